//! Offline constraint-graph optimizations.
//!
//! These run in a fixed sequence before the solver and shrink the node
//! and constraint population without changing the solution: clumping of
//! address-taken nodes, hash-based value numbering (HVN) and its
//! set-union refinement (HU), repeated reduction (HR), offline hybrid
//! cycle detection (HCD), and load/store factoring.

use std::collections::{BTreeMap as Map, BTreeSet as Set};

use super::*;

// Offline pointer-equivalence labels.  0 means "points to nothing";
// UNASSIGNED marks nodes whose SCC has not been labeled yet.
const UNASSIGNED: u32 = u32::MAX;

#[derive(Clone, Copy, Debug)]
enum OffEdge {
    Copy(u32),
    Gep(u32, u32),
}

/// The offline graph: a VAR node per mergeable value node, a REF node per
/// dereferenced node.  Edges point from a node to the nodes whose labels
/// feed it (its predecessors in the inclusion order).
#[derive(Default)]
struct OffGraph {
    // main node id -> offline VAR id (0 = none)
    var_off: Vec<u32>,
    // main node id -> offline REF id
    ref_off: Map<u32, u32>,
    // per offline node
    inc: Vec<Vec<OffEdge>>,
    indirect: Vec<bool>,
    // labels contributed by addr-of sources
    ext: Vec<Vec<u32>>,
}

impl OffGraph {
    fn add_off_node(&mut self, indirect: bool) -> u32 {
        let id = self.inc.len() as u32;
        self.inc.push(vec![]);
        self.indirect.push(indirect);
        self.ext.push(vec![]);
        id
    }

    fn get_ref(&mut self, n: u32) -> u32 {
        if let Some(&r) = self.ref_off.get(&n) {
            return r;
        }
        let r = self.add_off_node(true);
        self.ref_off.insert(n, r);
        r
    }

    fn num(&self) -> usize {
        self.inc.len()
    }
}

/// Tarjan state for the offline labeling pass.
struct OffLabeling {
    pe: Vec<u32>,
    sets: Vec<Vec<u32>>,
    next_label: u32,
    // object node -> its addr-of label
    adr_label: Map<u32, u32>,
    // (source label, offset) -> label of the shifted result
    gep_label: Map<(u32, u32), u32>,
    // canonical label for a combination of incoming labels
    canon: Map<Vec<u32>, u32>,
}

impl OffLabeling {
    fn fresh(&mut self) -> u32 {
        let l = self.next_label;
        self.next_label += 1;
        l
    }

    fn adr(&mut self, obj: u32) -> u32 {
        if let Some(&l) = self.adr_label.get(&obj) {
            return l;
        }
        let l = self.fresh();
        self.adr_label.insert(obj, l);
        l
    }

    fn gep(&mut self, src_label: u32, off: u32) -> u32 {
        if let Some(&l) = self.gep_label.get(&(src_label, off)) {
            return l;
        }
        let l = self.fresh();
        self.gep_label.insert((src_label, off), l);
        l
    }

    fn canonical(&mut self, labels: Vec<u32>) -> u32 {
        if labels.is_empty() {
            return 0;
        }
        if labels.len() == 1 {
            return labels[0];
        }
        if let Some(&l) = self.canon.get(&labels) {
            return l;
        }
        let l = self.fresh();
        self.canon.insert(labels, l);
        l
    }
}

impl Anders {
    /// The offline sequence.  Each labeling pass ends by merging
    /// pointer-equivalent nodes and rewriting the constraint list, so the
    /// passes compose.
    pub fn cons_opt(&mut self) {
        // clumping renumbers and happens exactly once; all later passes
        // are fixed-point and may rerun.
        if self.last_obj_node == 0 {
            self.clump_addr_taken();
        }
        self.rewrite_constraints();
        self.hvn(false);
        self.hvn(true);
        self.hr(false, self.config.hr_min_del);
        self.hcd();
        self.factor_ls();
        self.count_reduced_stats();
    }

    fn count_reduced_stats(&mut self) {
        self.stats.r_val_nodes = self
            .nodes
            .iter()
            .filter(|n| n.is_rep() && n.obj_sz == 0 && !n.nonptr)
            .count() as u32;
        self.stats.r_cons = self.constraints.len() as u32;
        self.stats.r_addr_cons = 0;
        self.stats.r_copy_cons = 0;
        self.stats.r_load_cons = 0;
        self.stats.r_store_cons = 0;
        self.stats.r_gep_cons = 0;
        for c in &self.constraints {
            match c.kind {
                ConsType::AddrOf => self.stats.r_addr_cons += 1,
                ConsType::Copy => self.stats.r_copy_cons += 1,
                ConsType::Load => self.stats.r_load_cons += 1,
                ConsType::Store => self.stats.r_store_cons += 1,
                ConsType::Gep => self.stats.r_gep_cons += 1,
            }
        }
    }

    /// Renumber nodes so all object nodes sit in a contiguous low range,
    /// right after the reserved IDs.  This happens exactly once, before
    /// any merging; IDs are stable from here on.
    fn clump_addr_taken(&mut self) {
        let n = self.nodes.len();
        assert!(self.nodes.iter().all(|nd| nd.is_rep()));

        let mut order: Vec<u32> = vec![0, 1, 2];
        order.extend((FIRST_VAR_NODE..n as u32).filter(|&i| self.nodes[i as usize].obj_sz > 0));
        self.last_obj_node = order.len() as u32 - 1;
        order.extend((FIRST_VAR_NODE..n as u32).filter(|&i| self.nodes[i as usize].obj_sz == 0));

        let mut old2new = vec![0u32; n];
        for (new, &old) in order.iter().enumerate() {
            old2new[old as usize] = new as u32;
        }

        let mut old_nodes: Vec<Option<Node>> =
            std::mem::take(&mut self.nodes).into_iter().map(Some).collect();
        self.nodes = order
            .iter()
            .map(|&old| old_nodes[old as usize].take().expect("node moved twice"))
            .collect();

        for c in &mut self.constraints {
            c.dest = old2new[c.dest as usize];
            c.src = old2new[c.src as usize];
        }
        self.cons_seen = self.constraints.iter().copied().collect();

        for v in self.val_node.values_mut() {
            *v = old2new[*v as usize];
        }
        for v in self.obj_node.values_mut() {
            *v = old2new[*v as usize];
        }
        for v in self.func_val_node.values_mut() {
            *v = old2new[*v as usize];
        }
        for v in self.func_obj_node.values_mut() {
            *v = old2new[*v as usize];
        }
        for v in self.ret_node.values_mut() {
            *v = old2new[*v as usize];
        }
        for v in self.vararg_node.values_mut() {
            *v = old2new[*v as usize];
        }
        self.ind_calls = self
            .ind_calls
            .iter()
            .map(|&v| old2new[v as usize])
            .collect();
        for site in &mut self.icall_sites {
            if site.lhs != NODE_NONE {
                site.lhs = old2new[site.lhs as usize];
            }
            for a in &mut site.args {
                if *a != NODE_NONE {
                    *a = old2new[*a as usize];
                }
            }
        }
        let icall = std::mem::take(&mut self.icall_cons);
        self.icall_cons = icall
            .into_iter()
            .map(|(mut c, sites)| {
                c.dest = old2new[c.dest as usize];
                c.src = old2new[c.src as usize];
                (c, sites)
            })
            .collect();
    }

    /// Rewrite every constraint onto representatives, dropping duplicates,
    /// self-copies, and constraints whose endpoints were proved to hold no
    /// pointers.  Re-keys the indirect-call registry alongside.
    pub(crate) fn rewrite_constraints(&mut self) {
        let old = std::mem::take(&mut self.constraints);
        let mut seen: Set<Constraint> = Set::new();
        let mut out = vec![];
        let mut new_icall: Map<Constraint, Set<u32>> = Map::new();

        for c in old {
            let k = Constraint::new(
                c.kind,
                self.get_node_rep(c.dest),
                self.get_node_rep(c.src),
                c.off,
            );
            let sites = self.icall_cons.get(&c).cloned();
            let nonptr_endpoint = self.node(k.dest).nonptr || self.node(k.src).nonptr;
            let self_copy = k.kind == ConsType::Copy && k.dest == k.src;
            if nonptr_endpoint || self_copy {
                if matches!(k.kind, ConsType::Load | ConsType::Store | ConsType::Gep) {
                    self.stats.ccons_del += 1;
                }
                continue;
            }
            if seen.insert(k) {
                out.push(k);
            }
            if let Some(s) = sites {
                new_icall.entry(k).or_default().extend(s);
            }
        }
        self.constraints = out;
        self.cons_seen = seen;
        self.icall_cons = new_icall;
    }

    // SECTION: HVN / HU

    /// Build the offline graph for the current constraint list.
    fn make_off_graph(&mut self, lab: &mut OffLabeling) -> OffGraph {
        let mut g = OffGraph::default();
        g.add_off_node(false); // offline node 0 is unused
        g.var_off = vec![0; self.nodes.len()];
        for i in FIRST_VAR_NODE..self.nodes.len() as u32 {
            let nd = self.node(i);
            if nd.is_rep() && nd.obj_sz == 0 && !nd.nonptr {
                g.var_off[i as usize] = g.add_off_node(false);
            }
        }

        let constraints = self.constraints.clone();
        for c in &constraints {
            let dv = g.var_off[c.dest as usize];
            let sv = g.var_off[c.src as usize];
            match c.kind {
                ConsType::AddrOf => {
                    if dv != 0 {
                        let l = lab.adr(c.src);
                        g.ext[dv as usize].push(l);
                    }
                }
                ConsType::Copy => {
                    if dv != 0 {
                        if sv != 0 {
                            g.inc[dv as usize].push(OffEdge::Copy(sv));
                        } else {
                            // fed from an object node (function-block
                            // plumbing); contents unpredictable offline.
                            g.indirect[dv as usize] = true;
                        }
                    }
                }
                ConsType::Load => {
                    if dv != 0 {
                        if c.off == 0 {
                            let r = g.get_ref(c.src);
                            g.inc[dv as usize].push(OffEdge::Copy(r));
                        } else {
                            g.indirect[dv as usize] = true;
                        }
                    }
                }
                ConsType::Store => {
                    if c.off == 0 && sv != 0 {
                        let r = g.get_ref(c.dest);
                        g.inc[r as usize].push(OffEdge::Copy(sv));
                    }
                }
                ConsType::Gep => {
                    if dv != 0 {
                        if sv != 0 {
                            g.inc[dv as usize].push(OffEdge::Gep(sv, c.off));
                        } else {
                            g.indirect[dv as usize] = true;
                        }
                    }
                }
            }
        }
        g
    }

    /// One labeling pass.  `do_union` false is HVN (a node's label is the
    /// value number of its incoming-label set); true is HU (labels are
    /// whole sets, caught by canonicalization after set union).  Equal
    /// labels mean pointer-equivalent; label 0 means provably empty.
    fn hvn(&mut self, do_union: bool) {
        let mut lab = OffLabeling {
            pe: vec![],
            sets: vec![],
            next_label: 1,
            adr_label: Map::new(),
            gep_label: Map::new(),
            canon: Map::new(),
        };
        let g = self.make_off_graph(&mut lab);
        lab.pe = vec![UNASSIGNED; g.num()];
        lab.sets = vec![vec![]; g.num()];

        // Tarjan over incoming edges, so every predecessor SCC is labeled
        // before its dependents.
        let n = g.num();
        let mut index = vec![0u32; n];
        let mut low = vec![0u32; n];
        let mut on_stack = vec![false; n];
        let mut stack: Vec<u32> = vec![];
        let mut next_index = 1u32;

        for v0 in 1..n as u32 {
            if index[v0 as usize] != 0 {
                continue;
            }
            let mut call: Vec<(u32, usize)> = vec![(v0, 0)];
            index[v0 as usize] = next_index;
            low[v0 as usize] = next_index;
            next_index += 1;
            stack.push(v0);
            on_stack[v0 as usize] = true;

            while let Some(&(u, ei)) = call.last() {
                let edges = &g.inc[u as usize];
                if ei < edges.len() {
                    call.last_mut().expect("call stack").1 += 1;
                    let w = match edges[ei] {
                        OffEdge::Copy(w) => w,
                        // gep edges order labeling but never form
                        // collapsible cycles; see label_scc.
                        OffEdge::Gep(w, _) => w,
                    };
                    if index[w as usize] == 0 {
                        index[w as usize] = next_index;
                        low[w as usize] = next_index;
                        next_index += 1;
                        stack.push(w);
                        on_stack[w as usize] = true;
                        call.push((w, 0));
                    } else if on_stack[w as usize] {
                        low[u as usize] = low[u as usize].min(index[w as usize]);
                    }
                } else {
                    call.pop();
                    if let Some(&(p, _)) = call.last() {
                        low[p as usize] = low[p as usize].min(low[u as usize]);
                    }
                    if low[u as usize] == index[u as usize] {
                        let mut members = vec![];
                        loop {
                            let w = stack.pop().expect("tarjan stack underflow");
                            on_stack[w as usize] = false;
                            members.push(w);
                            if w == u {
                                break;
                            }
                        }
                        label_scc(&g, &mut lab, &members, do_union);
                    }
                }
            }
        }

        self.merge_ptr_eq(&g, &lab);
        self.rewrite_constraints();
    }

    /// Run HVN repeatedly while it deletes at least `min_del` constraints.
    fn hr(&mut self, do_union: bool, min_del: usize) {
        loop {
            let before = self.constraints.len();
            self.hvn(do_union);
            if before - self.constraints.len() < min_del {
                break;
            }
        }
    }

    /// Apply the computed labels: value nodes with label 0 are marked
    /// non-pointer; nodes sharing a nonzero label are merged.
    fn merge_ptr_eq(&mut self, g: &OffGraph, lab: &OffLabeling) {
        let mut label2node: Map<u32, u32> = Map::new();
        for i in FIRST_VAR_NODE..self.nodes.len() as u32 {
            let off = g.var_off[i as usize];
            if off == 0 || !self.node(i).is_rep() {
                continue;
            }
            let l = lab.pe[off as usize];
            assert!(l != UNASSIGNED, "offline node left unlabeled");
            if l == 0 {
                self.node_mut(i).nonptr = true;
                continue;
            }
            match label2node.get(&l).copied() {
                None => {
                    label2node.insert(l, i);
                }
                Some(j) => {
                    let rj = self.get_node_rep(j);
                    if rj != i {
                        self.merge_nodes(rj, i);
                        self.stats.hvn_merge += 1;
                    }
                }
            }
        }
    }

    // SECTION: HCD

    /// Offline hybrid cycle detection: find SCCs in the copy/deref graph
    /// that pass through a dereference.  VAR members of such an SCC are
    /// merged now; every REF member records `hcd_var[n] = v` so the
    /// solver can collapse `*n` into `v` the moment it materializes.
    fn hcd(&mut self) {
        // offline ids: VAR = node id itself (objects included), REF via map.
        let n_main = self.nodes.len() as u32;
        let mut ref_off: Map<u32, u32> = Map::new();
        let mut next = n_main;
        for c in &self.constraints {
            if c.off == 0 && matches!(c.kind, ConsType::Load | ConsType::Store) {
                let d = if c.kind == ConsType::Load { c.src } else { c.dest };
                ref_off.entry(d).or_insert_with(|| {
                    let r = next;
                    next += 1;
                    r
                });
            }
        }
        let total = next as usize;
        let mut succ: Vec<Vec<u32>> = vec![vec![]; total];
        for c in &self.constraints {
            match c.kind {
                ConsType::Copy => succ[c.src as usize].push(c.dest),
                ConsType::Load if c.off == 0 => {
                    let r = ref_off[&c.src];
                    succ[r as usize].push(c.dest);
                }
                ConsType::Store if c.off == 0 => {
                    let r = ref_off[&c.dest];
                    succ[c.src as usize].push(r);
                }
                _ => {}
            }
        }

        let sccs = tarjan_sccs(&succ);
        for members in sccs {
            if members.len() < 2 {
                continue;
            }
            let vars: Vec<u32> = members.iter().copied().filter(|&m| m < n_main).collect();
            if vars.is_empty() {
                continue;
            }
            let mut v = self.get_node_rep(vars[0]);
            for &m in &vars[1..] {
                let r = self.get_node_rep(m);
                if r != v {
                    v = self.merge_nodes(v, r);
                    self.stats.hcd_var_merge += 1;
                }
            }
            for (&main, &off) in &ref_off {
                if members.contains(&off) {
                    let r = self.get_node_rep(main);
                    self.hcd_var.insert(r, v);
                }
            }
        }
        self.stats.hcd_size = self.hcd_var.len() as u32;
        self.rewrite_constraints();
    }

    // SECTION: load/store factoring

    /// Rewrite groups of loads/stores sharing a dereferenced side through
    /// one artificial node, turning many-to-many into star shapes.
    /// Constraints registered for indirect calls are left alone.
    fn factor_ls(&mut self) {
        let min_sz = self.config.factor_ls_min_sz.max(2);
        let old = std::mem::take(&mut self.constraints);
        let mut keep: Vec<Constraint> = vec![];
        let mut loads: Map<(u32, u32), Vec<u32>> = Map::new();
        let mut stores: Map<(u32, u32), Vec<u32>> = Map::new();

        for c in old {
            if self.icall_cons.contains_key(&c) {
                keep.push(c);
                continue;
            }
            match c.kind {
                ConsType::Load => loads.entry((c.src, c.off)).or_default().push(c.dest),
                ConsType::Store => stores.entry((c.dest, c.off)).or_default().push(c.src),
                _ => keep.push(c),
            }
        }

        for ((src, off), dests) in loads {
            if dests.len() >= min_sz {
                let tmp = self.add_node(None, 0, false);
                keep.push(Constraint::new(ConsType::Load, tmp, src, off));
                for d in &dests {
                    keep.push(Constraint::new(ConsType::Copy, *d, tmp, 0));
                }
                self.stats.ls_factored += dests.len() as u32 - 1;
            } else {
                for d in dests {
                    keep.push(Constraint::new(ConsType::Load, d, src, off));
                }
            }
        }
        for ((dest, off), srcs) in stores {
            if srcs.len() >= min_sz {
                let tmp = self.add_node(None, 0, false);
                keep.push(Constraint::new(ConsType::Store, dest, tmp, off));
                for s in &srcs {
                    keep.push(Constraint::new(ConsType::Copy, tmp, *s, 0));
                }
                self.stats.ls_factored += srcs.len() as u32 - 1;
            } else {
                for s in srcs {
                    keep.push(Constraint::new(ConsType::Store, dest, s, off));
                }
            }
        }

        self.cons_seen = keep.iter().copied().collect();
        self.constraints = keep;
    }
}

/// Compute the label for a finished SCC of the offline graph.
fn label_scc(g: &OffGraph, lab: &mut OffLabeling, members: &[u32], do_union: bool) {
    let mut indirect = members.iter().any(|&m| g.indirect[m as usize]);
    let mut gep_cycle = false;
    let in_scc: Set<u32> = members.iter().copied().collect();
    let mut incoming: Set<u32> = Set::new();

    for &m in members {
        for &l in &g.ext[m as usize] {
            incoming.insert(l);
        }
        for e in &g.inc[m as usize] {
            match *e {
                OffEdge::Copy(p) => {
                    if in_scc.contains(&p) {
                        continue;
                    }
                    let pl = lab.pe[p as usize];
                    assert!(pl != UNASSIGNED, "predecessor labeled after dependent");
                    if do_union {
                        for &l in &lab.sets[p as usize] {
                            incoming.insert(l);
                        }
                    } else if pl != 0 {
                        incoming.insert(pl);
                    }
                }
                OffEdge::Gep(p, off) => {
                    if in_scc.contains(&p) {
                        // a cycle through pointer arithmetic: the members
                        // are NOT pointer-equal, only mutually dependent.
                        gep_cycle = true;
                        indirect = true;
                        continue;
                    }
                    let pl = lab.pe[p as usize];
                    assert!(pl != UNASSIGNED, "predecessor labeled after dependent");
                    if pl != 0 {
                        let l = lab.gep(pl, off);
                        incoming.insert(l);
                    }
                }
            }
        }
    }

    if gep_cycle {
        // keep the members apart: each gets a label of its own.
        for &m in members {
            let l = lab.fresh();
            lab.pe[m as usize] = l;
            if do_union {
                let mut set: Vec<u32> = incoming.iter().copied().collect();
                set.push(l);
                lab.sets[m as usize] = set;
            }
        }
        return;
    }

    if indirect {
        let l = lab.fresh();
        incoming.insert(l);
    }
    let set: Vec<u32> = incoming.into_iter().collect();
    let label = lab.canonical(set.clone());
    for &m in members {
        lab.pe[m as usize] = label;
        if do_union {
            lab.sets[m as usize] = set.clone();
        }
    }
}

/// Plain Tarjan over a successor-list graph; returns the SCCs.
fn tarjan_sccs(succ: &[Vec<u32>]) -> Vec<Vec<u32>> {
    let n = succ.len();
    let mut index = vec![0u32; n];
    let mut low = vec![0u32; n];
    let mut on_stack = vec![false; n];
    let mut stack: Vec<u32> = vec![];
    let mut next_index = 1u32;
    let mut out = vec![];

    for v0 in 0..n as u32 {
        if index[v0 as usize] != 0 {
            continue;
        }
        let mut call: Vec<(u32, usize)> = vec![(v0, 0)];
        index[v0 as usize] = next_index;
        low[v0 as usize] = next_index;
        next_index += 1;
        stack.push(v0);
        on_stack[v0 as usize] = true;

        while let Some(&(u, ei)) = call.last() {
            if ei < succ[u as usize].len() {
                let w = succ[u as usize][ei];
                call.last_mut().expect("call stack").1 += 1;
                if index[w as usize] == 0 {
                    index[w as usize] = next_index;
                    low[w as usize] = next_index;
                    next_index += 1;
                    stack.push(w);
                    on_stack[w as usize] = true;
                    call.push((w, 0));
                } else if on_stack[w as usize] {
                    low[u as usize] = low[u as usize].min(index[w as usize]);
                }
            } else {
                call.pop();
                if let Some(&(p, _)) = call.last() {
                    low[p as usize] = low[p as usize].min(low[u as usize]);
                }
                if low[u as usize] == index[u as usize] {
                    let mut members = vec![];
                    loop {
                        let w = stack.pop().expect("tarjan stack underflow");
                        on_stack[w as usize] = false;
                        members.push(w);
                        if w == u {
                            break;
                        }
                    }
                    out.push(members);
                }
            }
        }
    }
    out
}
