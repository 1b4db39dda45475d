//! The worklist solver: iterative propagation over the optimized graph,
//! with lazy cycle detection, online hybrid cycle detection, and
//! effect-table dispatch for external callees of indirect calls.

use std::collections::{BTreeMap as Map, BTreeSet as Set};
use std::time::Instant;

use super::extinfo::ExtEffect;
use super::pts::PtsSet;
use super::worklist::Worklist;
use super::*;
use crate::middle_end::lir::FuncId;

impl Anders {
    /// Build the offset masks: for every offset used by a load/store (or
    /// gep) constraint, the set of object nodes whose block extends past
    /// that offset.
    pub fn pts_init(&mut self) {
        self.rewrite_constraints();
        let mut ls_offs: Set<u32> = Set::new();
        let mut gep_offs: Set<u32> = Set::new();
        for c in &self.constraints {
            match c.kind {
                ConsType::Load | ConsType::Store if c.off > 0 => {
                    ls_offs.insert(c.off);
                }
                ConsType::Gep => {
                    gep_offs.insert(c.off);
                }
                _ => {}
            }
        }
        let max_ls = ls_offs.iter().max().copied().unwrap_or(0) as usize;
        let max_gep = gep_offs.iter().max().copied().unwrap_or(0) as usize;
        self.off_mask = vec![PtsSet::new(); max_ls + 1];
        self.geps = vec![PtsSet::new(); max_gep + 1];
        for i in 0..self.nodes.len() as u32 {
            let sz = self.node(i).obj_sz;
            if sz == 0 {
                continue;
            }
            for &k in &ls_offs {
                if k < sz {
                    self.off_mask[k as usize].insert(i);
                }
            }
            for &k in &gep_offs {
                if k < sz {
                    self.geps[k as usize].insert(i);
                }
            }
        }
    }

    /// Partition the optimized constraints: addr-ofs seed points-to sets,
    /// copies become edge bitmaps, complex constraints go to the indexed
    /// table.
    pub fn solve_init(&mut self) {
        let cons = self.constraints.clone();
        for c in cons {
            match c.kind {
                ConsType::AddrOf => {
                    self.node_mut(c.dest).points_to.insert(c.src);
                }
                ConsType::Copy => {
                    if self.node_mut(c.src).copy_to.set(c.dest) {
                        self.stats.copy_add += 1;
                    }
                }
                ConsType::Load => {
                    let i = self.cplx_cons.len() as u32;
                    self.cplx_cons.push(c);
                    self.node_mut(c.src).load_to.set(i);
                }
                ConsType::Store => {
                    let i = self.cplx_cons.len() as u32;
                    self.cplx_cons.push(c);
                    self.node_mut(c.dest).store_from.set(i);
                }
                ConsType::Gep => {
                    let i = self.cplx_cons.len() as u32;
                    self.cplx_cons.push(c);
                    self.node_mut(c.src).gep_to.set(i);
                }
            }
        }
    }

    fn wl_push(&mut self, wl: &mut Worklist, n: u32) {
        let p = self.node(n).vtime;
        wl.push(n, p);
        self.stats.node_push += 1;
    }

    /// The main loop.  Every pop handles one node: its complex
    /// constraints against the delta since its last visit, then simple
    /// propagation to its copy successors.
    pub fn solve(&mut self) {
        let num = self.nodes.len() as u32;
        let mut wl = Worklist::new(self.config.wl_order, self.config.dual_wl, num);
        for i in I2P..num {
            if self.node(i).is_rep() && !self.node(i).points_to.is_empty() {
                self.wl_push(&mut wl, i);
            }
        }

        let start = Instant::now();
        self.partial = false;
        let mut since_check = 0u32;

        loop {
            if wl.empty() {
                wl.swap_if_empty();
                if wl.empty() {
                    // flush pending cycle candidates before finishing, so
                    // clients see the collapsed classes.
                    if self.lcd_starts.len() >= self.config.lcd_sz {
                        self.run_lcd(&mut wl);
                        wl.swap_if_empty();
                    }
                    if wl.empty() {
                        break;
                    }
                }
                self.stats.passes += 1;
            }
            if self.lcd_starts.len() >= self.config.lcd_sz
                || self.n_node_runs - self.last_lcd >= self.config.lcd_period
            {
                if !self.lcd_starts.is_empty() {
                    self.run_lcd(&mut wl);
                }
                self.last_lcd = self.n_node_runs;
            }
            since_check += 1;
            if since_check >= 64 {
                since_check = 0;
                if self.limits_exceeded(&start) {
                    self.partial = true;
                    break;
                }
            }

            let n = wl.pop();
            self.stats.node_pop += 1;
            let n = self.get_node_rep(n);
            self.solve_node(n, &mut wl);
        }
    }

    fn limits_exceeded(&self, start: &Instant) -> bool {
        if self.config.solve_time_limit > 0
            && start.elapsed().as_secs() >= self.config.solve_time_limit
        {
            return true;
        }
        if self.config.solve_ram_limit > 0 && get_mem_usage() > self.config.solve_ram_limit {
            return true;
        }
        false
    }

    fn solve_node(&mut self, n0: u32, wl: &mut Worklist) {
        let (pts, prev) = {
            let nd = self.node(n0);
            (nd.points_to.clone(), nd.prev_points_to.clone())
        };
        if pts == prev {
            return;
        }
        let delta = pts.diff(&prev);
        self.stats.node_run += 1;
        self.n_node_runs += 1;
        self.vtime += 1;
        {
            let vtime = self.vtime;
            let nd = self.node_mut(n0);
            nd.prev_points_to = nd.points_to.clone();
            nd.vtime = vtime;
        }

        // online HCD: this node's dereference sits in a known cycle with
        // hcd_var[n]; collapse everything it now points to into that node.
        let mut n = n0;
        if let Some(v0) = self.hcd_var.get(&n).copied() {
            let mut v = self.get_node_rep(v0);
            let members = self.cache_mut().to_vec(&delta);
            let mut merged = false;
            for &x in members.iter() {
                let rx = self.get_node_rep(x);
                if rx != v {
                    v = self.merge_nodes(v, rx);
                    self.stats.hcd_on_var_merge += 1;
                    merged = true;
                }
            }
            if merged {
                self.stats.hcd_on_scc += 1;
                self.stats.hcd_on_sccn += members.len() as u32;
                self.wl_push(wl, v);
            }
            n = self.get_node_rep(n);
        }

        // complex constraints first, in table order; a set dedups the
        // entries that merging has made identical.
        let loads: Vec<u32> = self.node(n).load_to.iter().collect();
        let stores: Vec<u32> = self.node(n).store_from.iter().collect();
        let geps: Vec<u32> = self.node(n).gep_to.iter().collect();
        let mut seen: Set<Constraint> = Set::new();

        for i in loads {
            let c = self.cplx_cons[i as usize];
            let rc = Constraint::new(
                c.kind,
                self.get_node_rep(c.dest),
                self.get_node_rep(c.src),
                c.off,
            );
            if seen.insert(rc) {
                self.solve_ls_cons(true, c, rc, &delta, wl);
            }
        }
        for i in stores {
            let c = self.cplx_cons[i as usize];
            let rc = Constraint::new(
                c.kind,
                self.get_node_rep(c.dest),
                self.get_node_rep(c.src),
                c.off,
            );
            if seen.insert(rc) {
                self.solve_ls_cons(false, c, rc, &delta, wl);
            }
        }
        for i in geps {
            let c = self.cplx_cons[i as usize];
            let rc = Constraint::new(
                c.kind,
                self.get_node_rep(c.dest),
                self.get_node_rep(c.src),
                c.off,
            );
            if seen.insert(rc) {
                self.solve_gep_cons(rc, &delta, wl);
            }
        }

        self.solve_prop(n, &delta, wl);
    }

    /// Resolve one load/store constraint against the delta.  `orig` is
    /// the constraint as stored in the table (the indirect-call registry
    /// is keyed on it); `rc` is the same constraint over current reps.
    fn solve_ls_cons(
        &mut self,
        load: bool,
        orig: Constraint,
        rc: Constraint,
        delta: &PtsSet,
        wl: &mut Worklist,
    ) {
        // an external function object reaching an indirect call site
        // dispatches through the effect table instead of its block.
        if let Some(sites) = self.icall_cons.get(&orig).cloned() {
            let members = self.cache_mut().to_vec(delta);
            for &x in members.iter() {
                if let Some(NodeVal::FuncObj(f)) = self.node(x).val.clone() {
                    if self.ext_funcs.contains(&f) {
                        for &site in &sites {
                            self.handle_ext(&f, site, wl);
                        }
                    }
                }
            }
        }

        let targets = if rc.off == 0 {
            delta.clone()
        } else {
            match self.off_mask.get(rc.off as usize) {
                Some(m) => delta.intersect(m),
                None => PtsSet::new(),
            }
        };
        if targets.is_empty() {
            return;
        }
        let members = self.cache_mut().to_vec(&targets);

        if load {
            let d = rc.dest;
            for &x in members.iter() {
                let t = self.get_node_rep(x + rc.off);
                if t == d {
                    continue;
                }
                if self.add_copy_edge(t, d) {
                    let src_pts = self.node(t).points_to.clone();
                    if !src_pts.is_empty() && self.node_mut(d).points_to.union_with(&src_pts) {
                        self.wl_push(wl, d);
                    }
                }
            }
        } else {
            let s = rc.src;
            let s_pts = self.node(s).points_to.clone();
            for &x in members.iter() {
                let t = self.get_node_rep(x + rc.off);
                if t == s {
                    continue;
                }
                if self.add_copy_edge(s, t)
                    && !s_pts.is_empty()
                    && self.node_mut(t).points_to.union_with(&s_pts)
                {
                    self.wl_push(wl, t);
                }
            }
        }
    }

    /// `dest ⊇ delta + off`, filtered to objects big enough for the
    /// offset.
    fn solve_gep_cons(&mut self, rc: Constraint, delta: &PtsSet, wl: &mut Worklist) {
        let mask = match self.geps.get(rc.off as usize) {
            Some(m) if !m.is_empty() => m,
            _ => return,
        };
        let masked = delta.intersect(mask);
        if masked.is_empty() {
            return;
        }
        let out: PtsSet = self
            .cache_mut()
            .to_vec(&masked)
            .iter()
            .map(|x| x + rc.off)
            .collect();
        if self.node_mut(rc.dest).points_to.union_with(&out) {
            self.wl_push(wl, rc.dest);
        }
    }

    fn add_copy_edge(&mut self, src: u32, dest: u32) -> bool {
        if src == dest {
            return false;
        }
        if self.node_mut(src).copy_to.set(dest) {
            self.stats.copy_add += 1;
            true
        } else {
            false
        }
    }

    /// Simple propagation: the delta flows to every copy successor.  A
    /// successor that absorbs nothing and already has an identical set is
    /// a cycle candidate for LCD.
    fn solve_prop(&mut self, n: u32, delta: &PtsSet, wl: &mut Worklist) {
        let dests: Vec<u32> = self.node(n).copy_to.iter().collect();
        for d0 in dests {
            let d = self.get_node_rep(d0);
            if d == n {
                continue;
            }
            if self.node_mut(d).points_to.union_with(delta) {
                self.wl_push(wl, d);
            } else if self.node(d).points_to == self.node(n).points_to {
                self.lcd_starts.insert((n, d));
            }
        }
    }

    /// Lazy cycle detection: run Tarjan over the copy graph from the
    /// accumulated candidate edges and merge every SCC found.
    fn run_lcd(&mut self, wl: &mut Worklist) {
        self.stats.lcd_run += 1;
        let starts = std::mem::take(&mut self.lcd_starts);
        let mut roots: Set<u32> = Set::new();
        for (s, _) in starts {
            roots.insert(self.get_node_rep(s));
        }

        let mut index: Map<u32, u32> = Map::new();
        let mut low: Map<u32, u32> = Map::new();
        let mut on_stack: Set<u32> = Set::new();
        let mut stack: Vec<u32> = vec![];
        let mut next = 1u32;
        let mut sccs: Vec<Vec<u32>> = vec![];

        for &r in &roots {
            if index.contains_key(&r) {
                continue;
            }
            index.insert(r, next);
            low.insert(r, next);
            next += 1;
            stack.push(r);
            on_stack.insert(r);
            let mut call: Vec<(u32, Vec<u32>, usize)> = vec![(r, self.copy_succs(r), 0)];

            loop {
                let (u, w_opt) = match call.last() {
                    None => break,
                    Some(t) => (t.0, t.1.get(t.2).copied()),
                };
                match w_opt {
                    Some(w0) => {
                        call.last_mut().expect("call stack").2 += 1;
                        let w = self.get_node_rep(w0);
                        if w == u {
                            continue;
                        }
                        if !index.contains_key(&w) {
                            index.insert(w, next);
                            low.insert(w, next);
                            next += 1;
                            stack.push(w);
                            on_stack.insert(w);
                            let ws = self.copy_succs(w);
                            call.push((w, ws, 0));
                        } else if on_stack.contains(&w) {
                            let lu = low[&u].min(index[&w]);
                            low.insert(u, lu);
                        }
                    }
                    None => {
                        call.pop();
                        if let Some(t) = call.last() {
                            let lp = low[&t.0].min(low[&u]);
                            low.insert(t.0, lp);
                        }
                        if low[&u] == index[&u] {
                            let mut members = vec![];
                            loop {
                                let w = stack.pop().expect("lcd stack underflow");
                                on_stack.remove(&w);
                                members.push(w);
                                if w == u {
                                    break;
                                }
                            }
                            if members.len() >= 2 {
                                sccs.push(members);
                            }
                        }
                    }
                }
            }
        }

        for members in sccs {
            self.stats.lcd_scc += 1;
            self.stats.lcd_sccn += members.len() as u32;
            let mut v = self.get_node_rep(members[0]);
            for &m in &members[1..] {
                let r = self.get_node_rep(m);
                if r != v {
                    v = self.merge_nodes(v, r);
                }
            }
            self.wl_push(wl, v);
        }
    }

    fn copy_succs(&self, n: u32) -> Vec<u32> {
        self.node(n).copy_to.iter().collect()
    }

    /// Add a complex constraint discovered mid-solve (external effects on
    /// indirect calls).  The dereferenced node gets a cleared snapshot so
    /// its whole set is reprocessed against the new constraint.
    fn add_cplx(&mut self, kind: ConsType, dest: u32, src: u32, wl: &mut Worklist) {
        let c = Constraint::new(kind, dest, src, 0);
        let i = self.cplx_cons.len() as u32;
        self.cplx_cons.push(c);
        let deref = match kind {
            ConsType::Load => {
                self.node_mut(src).load_to.set(i);
                src
            }
            ConsType::Store => {
                self.node_mut(dest).store_from.set(i);
                dest
            }
            _ => unreachable!("only load/store constraints arise mid-solve"),
        };
        self.node_mut(deref).prev_points_to = PtsSet::new();
        self.wl_push(wl, deref);
    }

    /// Dispatch an external callee of an indirect call through the effect
    /// table, once per (function, call site).
    fn handle_ext(&mut self, f: &FuncId, site_idx: u32, wl: &mut Worklist) {
        if !self.ext_seen.insert((f.clone(), site_idx)) {
            return;
        }
        let site = self.icall_sites[site_idx as usize].clone();
        let effect = self.extinfo.get_effect(&f.0);

        let arg = |i: usize| site.args.get(i).copied().unwrap_or(NODE_NONE);

        match effect {
            ExtEffect::Noop | ExtEffect::Other => {}
            ExtEffect::Alloc | ExtEffect::NostructAlloc | ExtEffect::Realloc => {
                if site.lhs != NODE_NONE {
                    let obj = self.fresh_heap_node();
                    let l = self.get_node_rep(site.lhs);
                    if self.node_mut(l).points_to.insert(obj) {
                        self.wl_push(wl, l);
                    }
                    if effect == ExtEffect::Realloc && arg(0) != NODE_NONE {
                        let a = self.get_node_rep(arg(0));
                        self.copy_into(a, l, wl);
                    }
                }
            }
            ExtEffect::Stat => {
                if site.lhs != NODE_NONE {
                    let x = self.fresh_stat_node(&f.0);
                    let l = self.get_node_rep(site.lhs);
                    if self.node_mut(l).points_to.insert(x) {
                        self.wl_push(wl, l);
                    }
                }
            }
            ExtEffect::Stat2 => {
                if site.lhs != NODE_NONE {
                    let x = self.fresh_stat_node(&f.0);
                    let y = self.fresh_stat_node(&format!("{}$2", f.0));
                    let l = self.get_node_rep(site.lhs);
                    if self.node_mut(l).points_to.insert(x) {
                        self.wl_push(wl, l);
                    }
                    if self.node_mut(x).points_to.insert(y) {
                        self.wl_push(wl, x);
                    }
                }
            }
            ExtEffect::LArg(i) => {
                if site.lhs != NODE_NONE && arg(i as usize) != NODE_NONE {
                    let a = self.get_node_rep(arg(i as usize));
                    let l = self.get_node_rep(site.lhs);
                    self.copy_into(a, l, wl);
                }
            }
            ExtEffect::CopyR { dst, src, ret, .. } => {
                let (d, s) = (arg(dst as usize), arg(src as usize));
                if d != NODE_NONE && s != NODE_NONE {
                    let tmp = self.add_node(None, 0, false);
                    let (rd, rs) = (self.get_node_rep(d), self.get_node_rep(s));
                    self.add_cplx(ConsType::Load, tmp, rs, wl);
                    self.add_cplx(ConsType::Store, rd, tmp, wl);
                }
                if ret && site.lhs != NODE_NONE && d != NODE_NONE {
                    let a = self.get_node_rep(d);
                    let l = self.get_node_rep(site.lhs);
                    self.copy_into(a, l, wl);
                }
            }
            ExtEffect::StoreArg { dst, src, ret } => {
                let (d, s) = (arg(dst as usize), arg(src as usize));
                if d != NODE_NONE && s != NODE_NONE {
                    let (rd, rs) = (self.get_node_rep(d), self.get_node_rep(s));
                    self.add_cplx(ConsType::Store, rd, rs, wl);
                    if ret && site.lhs != NODE_NONE {
                        let l = self.get_node_rep(site.lhs);
                        self.copy_into(rs, l, wl);
                    }
                }
            }
            ExtEffect::NewArg(i) => {
                if arg(i as usize) != NODE_NONE {
                    let obj = self.fresh_heap_node();
                    let tmp = self.add_node(None, 0, false);
                    self.node_mut(tmp).points_to.insert(obj);
                    let ra = self.get_node_rep(arg(i as usize));
                    self.add_cplx(ConsType::Store, ra, tmp, wl);
                }
            }
        }
    }

    fn fresh_heap_node(&mut self) -> u32 {
        let site = self.next_heap_site;
        self.next_heap_site += 1;
        self.stats.ind_alloc += 1;
        self.add_node(
            Some(NodeVal::Obj { base: ObjBase::Heap(site), off: 0 }),
            1,
            true,
        )
    }

    fn fresh_stat_node(&mut self, name: &str) -> u32 {
        self.add_node(
            Some(NodeVal::Obj { base: ObjBase::Stat(name.to_string()), off: 0 }),
            1,
            true,
        )
    }

    /// A copy edge plus an immediate flush of the source's current set.
    fn copy_into(&mut self, src: u32, dest: u32, wl: &mut Worklist) {
        if src == dest {
            return;
        }
        if self.add_copy_edge(src, dest) {
            let s_pts = self.node(src).points_to.clone();
            if !s_pts.is_empty() && self.node_mut(dest).points_to.union_with(&s_pts) {
                self.wl_push(wl, dest);
            }
        }
    }
}

/// The current size of our data segment in MB, from /proc/self/status.
/// Returns 0 where that is unavailable, which disables the RAM guard.
pub fn get_mem_usage() -> u32 {
    #[cfg(target_os = "linux")]
    fn imp() -> u32 {
        if let Ok(s) = std::fs::read_to_string("/proc/self/status") {
            for line in s.lines() {
                if let Some(rest) = line.strip_prefix("VmData:") {
                    let kb: u64 = rest
                        .trim()
                        .trim_end_matches("kB")
                        .trim()
                        .parse()
                        .unwrap_or(0);
                    return ((kb + 512) / 1024) as u32;
                }
            }
        }
        0
    }
    #[cfg(not(target_os = "linux"))]
    fn imp() -> u32 {
        0
    }
    imp()
}
