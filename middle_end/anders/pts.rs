//! The points-to set backend and its expansion cache.
//!
//! Sets of node IDs are stored as hash-consed big-endian Patricia tries
//! with 64-bit leaves.  Interning gives the properties the solver leans
//! on: set equality is one id comparison (so the `prev_points_to` delta
//! check is O(1)), structurally equal sets share memory, and the
//! set-to-vector cache can key on set identity.  Union, difference, and
//! intersection only touch the parts of the tries that differ.

use std::collections::{BinaryHeap, HashMap, HashSet};
use std::rc::Rc;

use hashconsing::{consign, HConsed, HashConsign};

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub enum PtsNode {
    /// The ids `base + b` for every set bit `b`.  `base` is a multiple of
    /// 64 and `bits` is never zero.
    Leaf { base: u32, bits: u64 },
    /// `mask` is the branching bit (a power of two >= 64); `prefix` holds
    /// the bits strictly above it, shared by every id below.  Ids with the
    /// mask bit clear are in `lo`, the rest in `hi`; neither is empty.
    Branch {
        prefix: u32,
        mask: u32,
        lo: PtsRef,
        hi: PtsRef,
    },
}

pub type PtsRef = HConsed<PtsNode>;

consign! {
    let PTS = consign(1031) for PtsNode;
}

use PtsNode::{Branch, Leaf};

fn mk_leaf(base: u32, bits: u64) -> PtsRef {
    debug_assert!(bits != 0 && base % 64 == 0);
    PTS.mk(Leaf { base, bits })
}

fn mk_branch(prefix: u32, mask: u32, lo: PtsRef, hi: PtsRef) -> PtsRef {
    PTS.mk(Branch { prefix, mask, lo, hi })
}

// the bits of k strictly above the mask bit m.
fn mask_bits(k: u32, m: u32) -> u32 {
    k & (!(m - 1) ^ m)
}

fn zero_bit(k: u32, m: u32) -> bool {
    k & m == 0
}

// the highest bit at which p0 and p1 differ.
fn branch_mask(p0: u32, p1: u32) -> u32 {
    let x = p0 ^ p1;
    debug_assert!(x != 0);
    1 << (31 - x.leading_zeros())
}

// a representative key prefix for any subtree.
fn prefix_of(t: &PtsRef) -> u32 {
    match t.get() {
        Leaf { base, .. } => *base,
        Branch { prefix, .. } => *prefix,
    }
}

// combine two subtrees known to have differing prefixes.
fn join(p0: u32, t0: PtsRef, p1: u32, t1: PtsRef) -> PtsRef {
    let m = branch_mask(p0, p1);
    let p = mask_bits(p0, m);
    if zero_bit(p0, m) {
        mk_branch(p, m, t0, t1)
    } else {
        mk_branch(p, m, t1, t0)
    }
}

// build a branch, collapsing empty sides.
fn branch_opt(prefix: u32, mask: u32, lo: Option<PtsRef>, hi: Option<PtsRef>) -> Option<PtsRef> {
    match (lo, hi) {
        (None, t) | (t, None) => t,
        (Some(l), Some(h)) => Some(mk_branch(prefix, mask, l, h)),
    }
}

fn insert_ref(t: &PtsRef, base: u32, bit: u64) -> PtsRef {
    match t.get() {
        Leaf { base: b, bits } => {
            if *b == base {
                mk_leaf(base, bits | bit)
            } else {
                join(base, mk_leaf(base, bit), *b, t.clone())
            }
        }
        Branch { prefix, mask, lo, hi } => {
            if mask_bits(base, *mask) != *prefix {
                join(base, mk_leaf(base, bit), *prefix, t.clone())
            } else if zero_bit(base, *mask) {
                mk_branch(*prefix, *mask, insert_ref(lo, base, bit), hi.clone())
            } else {
                mk_branch(*prefix, *mask, lo.clone(), insert_ref(hi, base, bit))
            }
        }
    }
}

fn union_ref(a: &PtsRef, b: &PtsRef) -> PtsRef {
    if a.uid() == b.uid() {
        return a.clone();
    }
    match (a.get(), b.get()) {
        (Leaf { base: b1, bits: s1 }, Leaf { base: b2, bits: s2 }) => {
            if b1 == b2 {
                mk_leaf(*b1, s1 | s2)
            } else {
                join(*b1, a.clone(), *b2, b.clone())
            }
        }
        (Leaf { base, .. }, Branch { prefix, mask, lo, hi }) => {
            if mask_bits(*base, *mask) != *prefix {
                join(*base, a.clone(), *prefix, b.clone())
            } else if zero_bit(*base, *mask) {
                mk_branch(*prefix, *mask, union_ref(a, lo), hi.clone())
            } else {
                mk_branch(*prefix, *mask, lo.clone(), union_ref(a, hi))
            }
        }
        (Branch { .. }, Leaf { .. }) => union_ref(b, a),
        (
            Branch { prefix: p1, mask: m1, lo: lo1, hi: hi1 },
            Branch { prefix: p2, mask: m2, lo: lo2, hi: hi2 },
        ) => {
            if m1 > m2 {
                // b fits inside one side of a, or they are disjoint.
                if mask_bits(*p2, *m1) != *p1 {
                    join(*p1, a.clone(), *p2, b.clone())
                } else if zero_bit(*p2, *m1) {
                    mk_branch(*p1, *m1, union_ref(lo1, b), hi1.clone())
                } else {
                    mk_branch(*p1, *m1, lo1.clone(), union_ref(hi1, b))
                }
            } else if m1 < m2 {
                if mask_bits(*p1, *m2) != *p2 {
                    join(*p1, a.clone(), *p2, b.clone())
                } else if zero_bit(*p1, *m2) {
                    mk_branch(*p2, *m2, union_ref(a, lo2), hi2.clone())
                } else {
                    mk_branch(*p2, *m2, lo2.clone(), union_ref(a, hi2))
                }
            } else if p1 == p2 {
                mk_branch(*p1, *m1, union_ref(lo1, lo2), union_ref(hi1, hi2))
            } else {
                join(*p1, a.clone(), *p2, b.clone())
            }
        }
    }
}

// a \ b
fn diff_ref(a: &PtsRef, b: &PtsRef) -> Option<PtsRef> {
    if a.uid() == b.uid() {
        return None;
    }
    match (a.get(), b.get()) {
        (Leaf { base: b1, bits: s1 }, Leaf { base: b2, bits: s2 }) => {
            if b1 == b2 {
                let bits = s1 & !s2;
                if bits == 0 {
                    None
                } else {
                    Some(mk_leaf(*b1, bits))
                }
            } else {
                Some(a.clone())
            }
        }
        (Leaf { base, .. }, Branch { prefix, mask, lo, hi }) => {
            if mask_bits(*base, *mask) != *prefix {
                Some(a.clone())
            } else if zero_bit(*base, *mask) {
                diff_ref(a, lo)
            } else {
                diff_ref(a, hi)
            }
        }
        (Branch { prefix, mask, lo, hi }, Leaf { base, .. }) => {
            if mask_bits(*base, *mask) != *prefix {
                Some(a.clone())
            } else if zero_bit(*base, *mask) {
                branch_opt(*prefix, *mask, diff_ref(lo, b), Some(hi.clone()))
            } else {
                branch_opt(*prefix, *mask, Some(lo.clone()), diff_ref(hi, b))
            }
        }
        (
            Branch { prefix: p1, mask: m1, lo: lo1, hi: hi1 },
            Branch { prefix: p2, mask: m2, lo: lo2, hi: hi2 },
        ) => {
            if m1 > m2 {
                if mask_bits(*p2, *m1) != *p1 {
                    Some(a.clone())
                } else if zero_bit(*p2, *m1) {
                    branch_opt(*p1, *m1, diff_ref(lo1, b), Some(hi1.clone()))
                } else {
                    branch_opt(*p1, *m1, Some(lo1.clone()), diff_ref(hi1, b))
                }
            } else if m1 < m2 {
                if mask_bits(*p1, *m2) != *p2 {
                    Some(a.clone())
                } else if zero_bit(*p1, *m2) {
                    diff_ref(a, lo2)
                } else {
                    diff_ref(a, hi2)
                }
            } else if p1 == p2 {
                branch_opt(*p1, *m1, diff_ref(lo1, lo2), diff_ref(hi1, hi2))
            } else {
                Some(a.clone())
            }
        }
    }
}

fn inter_ref(a: &PtsRef, b: &PtsRef) -> Option<PtsRef> {
    if a.uid() == b.uid() {
        return Some(a.clone());
    }
    match (a.get(), b.get()) {
        (Leaf { base: b1, bits: s1 }, Leaf { base: b2, bits: s2 }) => {
            if b1 == b2 {
                let bits = s1 & s2;
                if bits == 0 {
                    None
                } else {
                    Some(mk_leaf(*b1, bits))
                }
            } else {
                None
            }
        }
        (Leaf { base, .. }, Branch { prefix, mask, lo, hi }) => {
            if mask_bits(*base, *mask) != *prefix {
                None
            } else if zero_bit(*base, *mask) {
                inter_ref(a, lo)
            } else {
                inter_ref(a, hi)
            }
        }
        (Branch { .. }, Leaf { .. }) => inter_ref(b, a),
        (
            Branch { prefix: p1, mask: m1, lo: lo1, hi: hi1 },
            Branch { prefix: p2, mask: m2, lo: lo2, hi: hi2 },
        ) => {
            if m1 > m2 {
                if mask_bits(*p2, *m1) != *p1 {
                    None
                } else if zero_bit(*p2, *m1) {
                    inter_ref(lo1, b)
                } else {
                    inter_ref(hi1, b)
                }
            } else if m1 < m2 {
                if mask_bits(*p1, *m2) != *p2 {
                    None
                } else if zero_bit(*p1, *m2) {
                    inter_ref(a, lo2)
                } else {
                    inter_ref(a, hi2)
                }
            } else if p1 == p2 {
                branch_opt(*p1, *m1, inter_ref(lo1, lo2), inter_ref(hi1, hi2))
            } else {
                None
            }
        }
    }
}

fn count_ref(t: &PtsRef) -> usize {
    match t.get() {
        Leaf { bits, .. } => bits.count_ones() as usize,
        Branch { lo, hi, .. } => count_ref(lo) + count_ref(hi),
    }
}

fn collect_ref(t: &PtsRef, out: &mut Vec<u32>) {
    match t.get() {
        Leaf { base, bits } => {
            let mut bits = *bits;
            while bits != 0 {
                out.push(base + bits.trailing_zeros());
                bits &= bits - 1;
            }
        }
        Branch { lo, hi, .. } => {
            collect_ref(lo, out);
            collect_ref(hi, out);
        }
    }
}

/// A set of node IDs.  Cloning and equality are O(1).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PtsSet(Option<PtsRef>);

impl PtsSet {
    pub fn new() -> Self {
        PtsSet(None)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_none()
    }

    /// A nonzero identity for nonempty sets; 0 identifies the empty set.
    /// Structurally equal sets always share an identity.
    pub fn uid(&self) -> u64 {
        match &self.0 {
            None => 0,
            Some(r) => r.uid().wrapping_add(1),
        }
    }

    pub fn contains(&self, n: u32) -> bool {
        let mut t = match &self.0 {
            None => return false,
            Some(t) => t,
        };
        loop {
            match t.get() {
                Leaf { base, bits } => {
                    return *base == n - n % 64 && bits & (1u64 << (n % 64)) != 0;
                }
                Branch { prefix, mask, lo, hi } => {
                    if mask_bits(n, *mask) != *prefix {
                        return false;
                    }
                    t = if zero_bit(n, *mask) { lo } else { hi };
                }
            }
        }
    }

    /// Insert `n`; returns true if it was not present.
    pub fn insert(&mut self, n: u32) -> bool {
        let base = n - n % 64;
        let bit = 1u64 << (n % 64);
        match &self.0 {
            None => {
                self.0 = Some(mk_leaf(base, bit));
                true
            }
            Some(t) => {
                let new = insert_ref(t, base, bit);
                let changed = new.uid() != t.uid();
                self.0 = Some(new);
                changed
            }
        }
    }

    /// self = self ∪ other; returns whether self grew.
    pub fn union_with(&mut self, other: &PtsSet) -> bool {
        match (&self.0, &other.0) {
            (_, None) => false,
            (None, Some(_)) => {
                self.0 = other.0.clone();
                true
            }
            (Some(a), Some(b)) => {
                let new = union_ref(a, b);
                let changed = new.uid() != a.uid();
                self.0 = Some(new);
                changed
            }
        }
    }

    /// self \ other
    pub fn diff(&self, other: &PtsSet) -> PtsSet {
        match (&self.0, &other.0) {
            (None, _) => PtsSet(None),
            (Some(_), None) => self.clone(),
            (Some(a), Some(b)) => PtsSet(diff_ref(a, b)),
        }
    }

    pub fn intersect(&self, other: &PtsSet) -> PtsSet {
        match (&self.0, &other.0) {
            (None, _) | (_, None) => PtsSet(None),
            (Some(a), Some(b)) => PtsSet(inter_ref(a, b)),
        }
    }

    pub fn len(&self) -> usize {
        match &self.0 {
            None => 0,
            Some(t) => count_ref(t),
        }
    }

    pub fn is_singleton(&self) -> bool {
        match &self.0 {
            None => false,
            // a branch always has at least one id on each side.
            Some(t) => matches!(t.get(), Leaf { bits, .. } if bits.count_ones() == 1),
        }
    }

    /// The members in increasing order.  Prefer going through `PtsCache`
    /// when the same set is expanded repeatedly.
    pub fn to_vec(&self) -> Vec<u32> {
        let mut out = vec![];
        if let Some(t) = &self.0 {
            collect_ref(t, &mut out);
        }
        out
    }

    /// Is self a subset of other?
    pub fn subset_of(&self, other: &PtsSet) -> bool {
        self.diff(other).is_empty()
    }
}

impl FromIterator<u32> for PtsSet {
    fn from_iter<I: IntoIterator<Item = u32>>(iter: I) -> Self {
        let mut s = PtsSet::new();
        for n in iter {
            s.insert(n);
        }
        s
    }
}

// SECTION: the set-to-vector expansion cache

/// Maps set identity to the sorted member vector, with LRU eviction once
/// the configured memory budget is exceeded.  Evicted identities are
/// remembered so that reuse-after-eviction can be reported.
#[derive(Debug)]
pub struct PtsCache {
    cache: HashMap<u64, (u32, Rc<Vec<u32>>)>,
    // lowest timestamp on top; stale entries are skipped on pop.
    lru: BinaryHeap<std::cmp::Reverse<(u32, u64)>>,
    // total number of cached entries, 4 bytes each.
    sz: usize,
    time: u32,
    evicted: HashSet<u64>,
    empty: Rc<Vec<u32>>,
    max_mb: u32,
    remove_mb: u32,
    pub hits: u32,
    pub misses: u32,
    pub evictions: u32,
    pub evict_used: u32,
}

impl PtsCache {
    pub fn new(max_mb: u32, remove_mb: u32) -> Self {
        assert!(remove_mb <= max_mb);
        PtsCache {
            cache: HashMap::new(),
            lru: BinaryHeap::new(),
            sz: 0,
            time: 0,
            evicted: HashSet::new(),
            empty: Rc::new(vec![]),
            max_mb,
            remove_mb,
            hits: 0,
            misses: 0,
            evictions: 0,
            evict_used: 0,
        }
    }

    /// The members of `set` in increasing order.  The returned vector is
    /// shared with the cache and stays valid after eviction.
    pub fn to_vec(&mut self, set: &PtsSet) -> Rc<Vec<u32>> {
        if set.is_empty() {
            return self.empty.clone();
        }
        self.time += 1;
        let id = set.uid();
        if let Some((stamp, v)) = self.cache.get_mut(&id) {
            *stamp = self.time;
            self.lru.push(std::cmp::Reverse((self.time, id)));
            self.hits += 1;
            return v.clone();
        }
        self.misses += 1;
        if self.evicted.contains(&id) {
            self.evict_used += 1;
        }

        // entries are 4 bytes, so MB = entries >> 18.
        if self.sz >= (self.max_mb as usize) << 18 {
            let keep = ((self.max_mb - self.remove_mb) as usize) << 18;
            while self.sz > 0 && self.sz >= keep {
                let std::cmp::Reverse((t, old)) = self.lru.pop().expect("lru out of sync");
                // some lru entries may be older than the cache entry.
                if let Some((stamp, v)) = self.cache.get(&old) {
                    if *stamp == t {
                        self.sz -= v.len();
                        self.cache.remove(&old);
                        self.evicted.insert(old);
                        self.evictions += 1;
                    }
                }
            }
        }

        let v = Rc::new(set.to_vec());
        self.sz += v.len();
        self.cache.insert(id, (self.time, v.clone()));
        self.lru.push(std::cmp::Reverse((self.time, id)));
        v
    }

    pub fn clear(&mut self) {
        self.cache.clear();
        self.lru.clear();
        self.evicted.clear();
        self.sz = 0;
        self.time = 0;
        self.hits = 0;
        self.misses = 0;
        self.evictions = 0;
        self.evict_used = 0;
    }

    pub fn report(&self) -> String {
        format!(
            "set2vector cache: limit {}M, misses {}, hits {}, evictions {}, evicted and reused {}",
            self.max_mb, self.misses, self.hits, self.evictions, self.evict_used
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeSet;

    // a small deterministic generator, good enough to shake the trie.
    fn lcg(seed: &mut u64) -> u32 {
        *seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        (*seed >> 33) as u32
    }

    #[test]
    fn insert_and_contains_match_model() {
        let mut seed = 7;
        let mut s = PtsSet::new();
        let mut model = BTreeSet::new();
        for _ in 0..2000 {
            let n = lcg(&mut seed) % 5000;
            assert_eq!(s.insert(n), model.insert(n));
        }
        assert_eq!(s.to_vec(), model.iter().copied().collect::<Vec<u32>>());
        assert_eq!(s.len(), model.len());
        for n in 0..5000 {
            assert_eq!(s.contains(n), model.contains(&n));
        }
    }

    #[test]
    fn union_diff_intersect_match_model() {
        let mut seed = 99;
        let mut a = PtsSet::new();
        let mut b = PtsSet::new();
        let mut ma = BTreeSet::new();
        let mut mb = BTreeSet::new();
        for _ in 0..1500 {
            let n = lcg(&mut seed) % 3000;
            if n % 3 != 0 {
                a.insert(n);
                ma.insert(n);
            }
            if n % 2 == 0 {
                b.insert(n);
                mb.insert(n);
            }
        }
        let mut u = a.clone();
        u.union_with(&b);
        assert_eq!(
            u.to_vec(),
            ma.union(&mb).copied().collect::<Vec<u32>>()
        );
        assert_eq!(
            a.diff(&b).to_vec(),
            ma.difference(&mb).copied().collect::<Vec<u32>>()
        );
        assert_eq!(
            a.intersect(&b).to_vec(),
            ma.intersection(&mb).copied().collect::<Vec<u32>>()
        );
    }

    #[test]
    fn equal_sets_share_identity() {
        let a: PtsSet = [900, 3, 77, 12000].into_iter().collect();
        let b: PtsSet = [12000, 77, 3, 900].into_iter().collect();
        assert_eq!(a.uid(), b.uid());
        assert_eq!(a, b);
        let mut c = a.clone();
        assert!(!c.union_with(&b));
        assert_eq!(c.uid(), a.uid());
    }

    #[test]
    fn singleton_and_subset() {
        let a: PtsSet = [5].into_iter().collect();
        let b: PtsSet = [5, 6].into_iter().collect();
        assert!(a.is_singleton());
        assert!(!b.is_singleton());
        assert!(!PtsSet::new().is_singleton());
        assert!(a.subset_of(&b));
        assert!(!b.subset_of(&a));
    }

    #[test]
    fn cache_returns_same_content_regardless_of_eviction() {
        // tiny budget: max 0 MB means always evict down to zero.
        let mut cache = PtsCache::new(0, 0);
        let a: PtsSet = (0..100).collect();
        let v1 = cache.to_vec(&a);
        let v2 = cache.to_vec(&a);
        assert_eq!(v1, v2);
        assert_eq!(*v1, (0..100).collect::<Vec<u32>>());
        assert!(cache.misses >= 1);
    }
}
