//! Inclusion-based (Andersen-style), field-sensitive, context-insensitive
//! points-to analysis over whole lir modules.
//!
//! The run is a pipeline: constraint generation (`obj_cons_id`), offline
//! constraint-graph optimization (`cons_opt`), then the worklist solver
//! (`solve`).  Afterwards the engine answers points-to queries through
//! the client interface at the bottom of this file.

pub mod bitmap;
pub mod config;
pub mod cons_opt;
pub mod extinfo;
pub mod fromstr_impl;
pub mod heap;
pub mod obj_cons_id;
pub mod print;
pub mod pts;
pub mod solve;
pub mod worklist;

#[cfg(test)]
mod tests;

use std::collections::{BTreeMap as Map, BTreeSet as Set};
use std::fmt;
use std::rc::Rc;

use derive_more::Display;
use serde::Serialize;

use crate::commons::Valid;
use crate::middle_end::lir::{FuncId, Program, VarId};

use bitmap::Bitmap;
use config::AndersConfig;
use extinfo::ExtInfo;
use pts::{PtsCache, PtsSet};

// Special node IDs: 0 - no node, I2P - unknown target of pointers cast
// from int, P_I2P - constant ptr to I2P, FIRST_VAR_NODE - the first node
// representing a real variable.
pub const NODE_NONE: u32 = 0;
pub const I2P: u32 = 1;
pub const P_I2P: u32 = 2;
pub const FIRST_VAR_NODE: u32 = 3;

// Address-taken functions are represented by an object-node block; these
// are the offsets from the block's first node to the node for the return
// value and the node for the first argument.
pub const FUNC_NODE_OFF_RET: u32 = 1;
pub const FUNC_NODE_OFF_ARG0: u32 = 2;

// The starting union-find rank of a node.
pub const NODE_RANK_MIN: u32 = 0xf000_0000;

// SECTION: constraints

// There are 5 types of constraints in Andersen's analysis:
//   AddrOf (Base): D = &S
//   Copy (Simple): D = S
//   Load (Complex 1): D = *S + off
//   Store (Complex 2): *D + off = S
//   Gep (copy+offset): D = S + off
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConsType {
    AddrOf,
    Copy,
    Load,
    Store,
    Gep,
}

// Field order gives the lexicographic (kind, dest, src, off) order used
// for dedup and set containers.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct Constraint {
    pub kind: ConsType,
    pub dest: u32,
    pub src: u32,
    pub off: u32,
}

impl Constraint {
    pub fn new(kind: ConsType, dest: u32, src: u32, off: u32) -> Self {
        Constraint { kind, dest, src, off }
    }
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.kind {
            ConsType::AddrOf => write!(f, "n{} = &n{}", self.dest, self.src),
            ConsType::Copy => write!(f, "n{} = n{}", self.dest, self.src),
            ConsType::Load => {
                if self.off == 0 {
                    write!(f, "n{} = *n{}", self.dest, self.src)
                } else {
                    write!(f, "n{} = *n{} + {}", self.dest, self.src, self.off)
                }
            }
            ConsType::Store => {
                if self.off == 0 {
                    write!(f, "*n{} = n{}", self.dest, self.src)
                } else {
                    write!(f, "*n{} + {} = n{}", self.dest, self.off, self.src)
                }
            }
            ConsType::Gep => write!(f, "n{} = n{} + {}", self.dest, self.src, self.off),
        }
    }
}

// SECTION: nodes

/// What an object node abstracts: a global's or local's storage, a heap
/// allocation site, or a static object behind a library call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ObjBase {
    Global(VarId),
    Local(VarId),
    Heap(u32),
    Stat(String),
}

/// The program entity a node stands for, or nothing for artificial nodes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NodeVal {
    /// The value node of a variable (for globals, the constant `@g`).
    Var(VarId),
    /// The constant `@f` for a function.
    FuncPtr(FuncId),
    /// The return-value node of a function.
    Ret(FuncId),
    /// The varargs sink of a variadic function.
    VarArg(FuncId),
    /// Field `off` of an allocated object.
    Obj { base: ObjBase, off: u32 },
    /// The head of an address-taken function's object block.
    FuncObj(FuncId),
    /// Offset 1 of a function block: the return value passthrough.
    RetObj(FuncId),
    /// Offset 2+i of a function block: the i-th argument passthrough.
    ArgObj(FuncId, u32),
}

impl fmt::Display for NodeVal {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fn with_off(f: &mut fmt::Formatter, s: String, off: u32) -> fmt::Result {
            if off == 0 {
                write!(f, "{s}")
            } else {
                write!(f, "{s}+{off}")
            }
        }
        match self {
            NodeVal::Var(v) if v.scope().is_none() => write!(f, "@{v}"),
            NodeVal::Var(v) => write!(f, "{}", v.with_funcid()),
            NodeVal::FuncPtr(id) => write!(f, "@{id}"),
            NodeVal::Ret(id) => write!(f, "{id}.retval"),
            NodeVal::VarArg(id) => write!(f, "{id}.vararg"),
            NodeVal::Obj { base: ObjBase::Global(v), off } => with_off(f, v.to_string(), *off),
            NodeVal::Obj { base: ObjBase::Local(v), off } => with_off(f, v.with_funcid(), *off),
            NodeVal::Obj { base: ObjBase::Heap(site), off } => {
                with_off(f, format!("heap#{site}"), *off)
            }
            NodeVal::Obj { base: ObjBase::Stat(name), off } => {
                with_off(f, format!("stat<{name}>"), *off)
            }
            NodeVal::FuncObj(id) => write!(f, "{id}"),
            NodeVal::RetObj(id) => write!(f, "{id}.ret"),
            NodeVal::ArgObj(id, i) => write!(f, "{id}.arg{i}"),
        }
    }
}

/// A node in the constraint/points-to graph.
#[derive(Clone, Debug)]
pub struct Node {
    /// The value represented by this node, or None for artificial nodes.
    pub val: Option<NodeVal>,
    /// How many nodes are in the object that starts here (0 if this is
    /// not an object node).  For structs this equals the corresponding
    /// entry of the flattened layout.
    pub obj_sz: u32,
    /// The time this node was last visited by the solver.
    pub vtime: u32,
    /// If `rep < NODE_RANK_MIN`, this node is part of a set of equivalent
    /// nodes and `rep` is another node in that set.  Else this is the
    /// representative of the set and `rep - NODE_RANK_MIN` is its rank.
    pub rep: u32,
    /// Determined to never point to anything.
    pub nonptr: bool,
    /// An array or heap-allocated object; stores to it are weak updates.
    pub weak: bool,
    pub points_to: PtsSet,
    /// The points-to set at the start of the last visit to this node.
    pub prev_points_to: PtsSet,
    /// The simple-constraint edges: neighbors that include our set.
    pub copy_to: Bitmap,
    /// The load, store, and gep constraints in which this node is
    /// dereferenced, as indices into the complex-constraint table.
    pub load_to: Bitmap,
    pub store_from: Bitmap,
    pub gep_to: Bitmap,
}

impl Node {
    pub fn new(val: Option<NodeVal>, obj_sz: u32, weak: bool) -> Self {
        Node {
            val,
            obj_sz,
            vtime: 0,
            rep: NODE_RANK_MIN,
            nonptr: false,
            weak,
            points_to: PtsSet::new(),
            prev_points_to: PtsSet::new(),
            copy_to: Bitmap::new(),
            load_to: Bitmap::new(),
            store_from: Bitmap::new(),
            gep_to: Bitmap::new(),
        }
    }

    pub fn is_rep(&self) -> bool {
        self.rep >= NODE_RANK_MIN
    }
}

// SECTION: statistics

/// All counters are plain `u32`s so the whole struct can be compared or
/// serialized for regression baselines.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Stats {
    pub i_val_nodes: u32,
    pub i_obj_nodes: u32,
    pub insn: u32,
    pub i_cons: u32,
    pub i_addr_cons: u32,
    pub i_copy_cons: u32,
    pub i_load_cons: u32,
    pub i_store_cons: u32,
    pub i_gep_cons: u32,
    pub r_val_nodes: u32,
    pub r_cons: u32,
    pub r_addr_cons: u32,
    pub r_copy_cons: u32,
    pub r_load_cons: u32,
    pub r_store_cons: u32,
    pub r_gep_cons: u32,
    pub hvn_merge: u32,
    pub hcd_size: u32,
    pub hcd_var_merge: u32,
    pub hcd_on_var_merge: u32,
    pub hcd_on_scc: u32,
    pub hcd_on_sccn: u32,
    pub ls_factored: u32,
    pub passes: u32,
    pub node_push: u32,
    pub node_pop: u32,
    pub node_run: u32,
    pub copy_add: u32,
    pub copy_del: u32,
    pub ccons_del: u32,
    pub ind_alloc: u32,
    pub lcd_run: u32,
    pub lcd_scc: u32,
    pub lcd_sccn: u32,
}

// SECTION: errors

#[derive(Clone, Debug, Display, Eq, PartialEq)]
pub enum AndersError {
    #[display(fmt = "malformed module: {}", _0)]
    BadIr(String),
}

impl std::error::Error for AndersError {}

// SECTION: indirect call sites

/// The nodes of an indirect call site, used to dispatch external callees
/// through the effect table at solve time.  0 marks a missing or
/// non-pointer slot.
#[derive(Clone, Debug)]
pub struct IcallSite {
    pub lhs: u32,
    pub args: Vec<u32>,
}

// SECTION: the engine

pub struct Anders {
    pub config: AndersConfig,
    pub stats: Stats,

    // -- analysis results (remain in memory after the run completes) --
    /// The constraint/points-to graph.
    nodes: Vec<Node>,
    /// The ID of the last object node (set by clump_addr_taken).
    last_obj_node: u32,
    /// The node of each value and the first node of the object associated
    /// with it, plus per-function return/vararg nodes.
    val_node: Map<VarId, u32>,
    obj_node: Map<VarId, u32>,
    func_val_node: Map<FuncId, u32>,
    func_obj_node: Map<FuncId, u32>,
    ret_node: Map<FuncId, u32>,
    vararg_node: Map<FuncId, u32>,
    /// For offset `k` used by a gep constraint, the set of object nodes
    /// with `obj_sz > k` (empty for unused offsets).  Applying a gep is
    /// intersecting with this mask and shifting by `k`.
    geps: Vec<PtsSet>,

    // -- data for the whole run (deleted by run_cleanup) --
    constraints: Vec<Constraint>,
    cons_seen: Set<Constraint>,
    /// The complex constraints (load, store, gep) from the optimized list.
    cplx_cons: Vec<Constraint>,
    /// The function-pointer nodes used for indirect calls.
    ind_calls: Set<u32>,
    icall_sites: Vec<IcallSite>,
    /// Constraints that represent an indirect call's return or args,
    /// mapped to the sites using them.  Because constraints referring to
    /// different calls may be merged, one constraint may map to several.
    icall_cons: Map<Constraint, Set<u32>>,
    /// Dereferenced node -> the VAR node in its offline SCC; see hcd().
    hcd_var: Map<u32, u32>,
    /// For load/store offset `k`, the set of nodes with `obj_sz > k`.
    off_mask: Vec<PtsSet>,
    /// External callees already dispatched per (function, call site).
    ext_seen: Set<(FuncId, u32)>,
    /// Functions that dispatch through the effect table.
    ext_funcs: Set<FuncId>,
    /// Heap allocation site counter.
    next_heap_site: u32,
    /// The sequence number of the current node visit.
    vtime: u32,
    n_node_runs: u32,
    lcd_starts: Set<(u32, u32)>,
    last_lcd: u32,
    /// Set when a resource limit cut the solve short; the result is still
    /// sound but may be partial.
    partial: bool,

    // -- data for constraint generation (deleted by pre_opt_cleanup) --
    /// Struct type -> (expanded sizes, field offsets); see the layout
    /// analyzer in obj_cons_id.
    struct_info: Map<crate::middle_end::lir::StructId, (Vec<u32>, Vec<u32>)>,
    /// The struct with the most fields; unknown allocations assume it.
    max_struct: Option<crate::middle_end::lir::StructId>,
    max_struct_sz: u32,
    /// Static object node per has_static external, deduplicated by name.
    stat_ret_node: Map<String, u32>,
    /// Object nodes whose initializers were already processed.
    global_init_done: Set<u32>,
    /// External functions called but missing from the effect table.
    ext_unknown: Set<String>,

    pub extinfo: ExtInfo,
    cache: PtsCache,
}

impl Default for Anders {
    fn default() -> Self {
        Self::new(AndersConfig::default())
    }
}

impl Anders {
    pub fn new(config: AndersConfig) -> Self {
        let cache = PtsCache::new(config.bvc_max, config.bvc_remove);
        Anders {
            config,
            stats: Stats::default(),
            nodes: vec![],
            last_obj_node: 0,
            val_node: Map::new(),
            obj_node: Map::new(),
            func_val_node: Map::new(),
            func_obj_node: Map::new(),
            ret_node: Map::new(),
            vararg_node: Map::new(),
            geps: vec![],
            constraints: vec![],
            cons_seen: Set::new(),
            cplx_cons: vec![],
            ind_calls: Set::new(),
            icall_sites: vec![],
            icall_cons: Map::new(),
            hcd_var: Map::new(),
            off_mask: vec![],
            ext_seen: Set::new(),
            ext_funcs: Set::new(),
            next_heap_site: 0,
            vtime: 0,
            n_node_runs: 0,
            lcd_starts: Set::new(),
            last_lcd: 0,
            partial: false,
            struct_info: Map::new(),
            max_struct: None,
            max_struct_sz: 0,
            stat_ret_node: Map::new(),
            global_init_done: Set::new(),
            ext_unknown: Set::new(),
            extinfo: ExtInfo::new(),
            cache,
        }
    }

    /// Run the whole pipeline on a validated module.
    pub fn run(&mut self, prog: &Valid<Program>) -> Result<(), AndersError> {
        self.run_init();
        self.obj_cons_id(prog)?;
        self.pre_opt_cleanup();
        if !self.config.oci_only {
            self.cons_opt();
            if !self.config.no_solve {
                self.pts_init();
                self.solve_init();
                self.solve();
            }
        }
        self.run_cleanup();
        self.pts_cleanup();
        Ok(())
    }

    /// Initialize all data before starting a run.
    pub fn run_init(&mut self) {
        let config = self.config.clone();
        *self = Anders::new(config);
    }

    /// Whether a resource limit cut the last solve short.
    pub fn is_partial(&self) -> bool {
        self.partial
    }

    // SECTION: node bookkeeping

    pub(crate) fn add_node(&mut self, val: Option<NodeVal>, obj_sz: u32, weak: bool) -> u32 {
        let id = self.nodes.len() as u32;
        self.nodes.push(Node::new(val, obj_sz, weak));
        id
    }

    pub(crate) fn node(&self, n: u32) -> &Node {
        &self.nodes[n as usize]
    }

    pub(crate) fn node_mut(&mut self, n: u32) -> &mut Node {
        &mut self.nodes[n as usize]
    }

    pub fn num_nodes(&self) -> u32 {
        self.nodes.len() as u32
    }

    pub fn last_obj_node(&self) -> u32 {
        self.last_obj_node
    }

    /// The representative node of the set containing node `n`, with path
    /// compression.
    pub fn get_node_rep(&mut self, n: u32) -> u32 {
        let mut r = n;
        while self.nodes[r as usize].rep < NODE_RANK_MIN {
            r = self.nodes[r as usize].rep;
        }
        // compress the path we just walked.
        let mut cur = n;
        while cur != r {
            let next = self.nodes[cur as usize].rep;
            self.nodes[cur as usize].rep = r;
            cur = next;
        }
        r
    }

    /// Non-compressing version for `&self` contexts.
    pub fn cget_node_rep(&self, n: u32) -> u32 {
        let mut r = n;
        while self.nodes[r as usize].rep < NODE_RANK_MIN {
            r = self.nodes[r as usize].rep;
        }
        r
    }

    /// Merge the equivalence classes of two representative nodes, uniting
    /// their edge lists and points-to sets.  Returns the surviving
    /// representative (picked by union-find rank).
    pub(crate) fn merge_nodes(&mut self, n1: u32, n2: u32) -> u32 {
        assert!(n1 != n2, "trying to merge a node with itself");
        assert!(n1 != NODE_NONE && n2 != NODE_NONE);
        assert!(self.nodes[n1 as usize].is_rep() && self.nodes[n2 as usize].is_rep());
        let (r1, r2) = (self.nodes[n1 as usize].rep, self.nodes[n2 as usize].rep);
        let (winner, loser) = if r1 < r2 { (n2, n1) } else { (n1, n2) };
        if r1 == r2 {
            self.nodes[winner as usize].rep += 1;
        }

        let lnode = std::mem::replace(
            &mut self.nodes[loser as usize],
            Node::new(None, 0, false),
        );
        {
            let w = &mut self.nodes[winner as usize];
            w.points_to.union_with(&lnode.points_to);
            // force the next visit to reprocess the whole set.
            w.prev_points_to = PtsSet::new();
            w.copy_to.union_with(&lnode.copy_to);
            w.load_to.union_with(&lnode.load_to);
            w.store_from.union_with(&lnode.store_from);
            w.gep_to.union_with(&lnode.gep_to);
            w.weak = w.weak || lnode.weak;
            w.nonptr = w.nonptr && lnode.nonptr;
            w.obj_sz = w.obj_sz.max(lnode.obj_sz);
            w.vtime = w.vtime.max(lnode.vtime);
            if w.copy_to.clear(winner) {
                self.stats.copy_del += 1;
            }
            if w.copy_to.clear(loser) {
                self.stats.copy_del += 1;
            }
        }
        // the loser keeps its identity for printing but forwards to the
        // winner and holds no sets or edges.
        let mut stub = Node::new(lnode.val, lnode.obj_sz, lnode.weak);
        stub.rep = winner;
        stub.nonptr = lnode.nonptr;
        stub.vtime = lnode.vtime;
        self.nodes[loser as usize] = stub;

        if let Some(v) = self.hcd_var.remove(&loser) {
            self.hcd_var.entry(winner).or_insert(v);
        }
        winner
    }

    // SECTION: constraint bookkeeping

    /// Add a constraint, deduplicating and normalizing: a gep with offset
    /// 0 is a copy, and a copy onto itself is nothing at all.
    pub(crate) fn add_cons(&mut self, kind: ConsType, dest: u32, src: u32, off: u32) -> bool {
        assert!(dest != NODE_NONE && src != NODE_NONE, "constraint on node 0");
        assert!(
            (dest as usize) < self.nodes.len() && (src as usize) < self.nodes.len(),
            "node ID out of range"
        );
        let mut kind = kind;
        if kind == ConsType::Gep && off == 0 {
            kind = ConsType::Copy;
        }
        if kind == ConsType::Copy && dest == src {
            return false;
        }
        assert!(off == 0 || kind != ConsType::AddrOf, "addr_of with offset");
        let c = Constraint::new(kind, dest, src, off);
        if self.cons_seen.insert(c) {
            self.constraints.push(c);
            true
        } else {
            false
        }
    }

    pub fn constraints(&self) -> &[Constraint] {
        &self.constraints
    }

    pub(crate) fn take_constraints(&mut self) -> Vec<Constraint> {
        std::mem::take(&mut self.constraints)
    }

    pub(crate) fn set_constraints(&mut self, cons: Vec<Constraint>) {
        self.constraints = cons;
    }

    // SECTION: cleanup

    /// Delete what the optimizations and solver won't need.
    pub fn pre_opt_cleanup(&mut self) {
        self.struct_info.clear();
        self.global_init_done.clear();
        self.stat_ret_node.clear();
    }

    /// Delete anything not needed to answer queries.
    pub fn run_cleanup(&mut self) {
        self.pre_opt_cleanup();
        self.constraints.clear();
        self.cons_seen.clear();
        self.cplx_cons.clear();
        self.ind_calls.clear();
        self.icall_sites.clear();
        self.icall_cons.clear();
        self.hcd_var.clear();
        self.off_mask.clear();
        self.ext_seen.clear();
        self.lcd_starts.clear();
        for n in &mut self.nodes {
            n.prev_points_to = PtsSet::new();
            n.copy_to.clear_all();
            n.load_to.clear_all();
            n.store_from.clear_all();
            n.gep_to.clear_all();
        }
    }

    /// Delete the points-to sets not needed by clients: object nodes lose
    /// theirs (except function-block return/argument nodes, which carry
    /// top-level pointers), and value nodes whose final sets share
    /// identity collapse into one class.  Idempotent.
    pub fn pts_cleanup(&mut self) {
        let mut eq: Map<u64, u32> = Map::new();
        for i in 0..self.nodes.len() as u32 {
            if self.nodes[i as usize].obj_sz > 0 {
                let keep = matches!(
                    self.nodes[i as usize].val,
                    Some(NodeVal::RetObj(_)) | Some(NodeVal::ArgObj(..))
                );
                if !keep {
                    self.nodes[i as usize].points_to = PtsSet::new();
                    continue;
                }
            }
            if !self.nodes[i as usize].points_to.is_empty() {
                let id = self.nodes[i as usize].points_to.uid();
                match eq.get(&id).copied() {
                    None => {
                        eq.insert(id, i);
                    }
                    Some(j) => {
                        let a = self.get_node_rep(i);
                        let b = self.get_node_rep(j);
                        if a != b {
                            self.merge_nodes(a, b);
                        }
                    }
                }
            }
        }
    }

    // SECTION: client interface

    /// The points-to set of node `n`, with offset `off`, as a shared
    /// sorted vector from the expansion cache.
    pub fn points_to_set(&mut self, n: u32, off: u32) -> Rc<Vec<u32>> {
        assert!(
            n != NODE_NONE && (n as usize) < self.nodes.len(),
            "node ID out of range"
        );
        let r = self.get_node_rep(n);
        let pts = self.nodes[r as usize].points_to.clone();
        if off == 0 {
            self.cache.to_vec(&pts)
        } else {
            let shifted = self.gep_apply(&pts, off);
            self.cache.to_vec(&shifted)
        }
    }

    /// The points-to set of a program variable's node.
    pub fn points_to_set_of(&mut self, v: &VarId, off: u32) -> Option<Rc<Vec<u32>>> {
        let n = *self.val_node.get(v)?;
        Some(self.points_to_set(n, off))
    }

    /// The pointer-equivalence representative of node `n`.
    pub fn representative(&mut self, n: u32) -> u32 {
        assert!(
            n != NODE_NONE && (n as usize) < self.nodes.len(),
            "node ID out of range"
        );
        self.get_node_rep(n)
    }

    /// The representative of a variable's node, or None if it has none.
    pub fn representative_of(&mut self, v: &VarId) -> Option<u32> {
        let n = *self.val_node.get(v)?;
        Some(self.get_node_rep(n))
    }

    /// Answers emptiness without materializing the vector.
    pub fn is_empty(&self, n: u32, off: u32) -> bool {
        assert!(
            n != NODE_NONE && (n as usize) < self.nodes.len(),
            "node ID out of range"
        );
        let pts = &self.nodes[self.cget_node_rep(n) as usize].points_to;
        if off == 0 {
            pts.is_empty()
        } else {
            self.gep_apply(pts, off).is_empty()
        }
    }

    pub fn is_singleton(&self, n: u32, off: u32) -> bool {
        assert!(
            n != NODE_NONE && (n as usize) < self.nodes.len(),
            "node ID out of range"
        );
        let pts = &self.nodes[self.cget_node_rep(n) as usize].points_to;
        if off == 0 {
            pts.is_singleton()
        } else {
            self.gep_apply(pts, off).is_singleton()
        }
    }

    /// Read-only access to the precomputed gep relations; `geps()[k]` is
    /// the mask of objects large enough for offset `k`.
    pub fn geps(&self) -> &[PtsSet] {
        &self.geps
    }

    /// Apply the gep relation for `off`: keep the object nodes whose
    /// block extends past `off` and shift them.  An offset no gep
    /// constraint ever used has no relation and maps everything to the
    /// empty set.
    pub(crate) fn gep_apply(&self, set: &PtsSet, off: u32) -> PtsSet {
        let mask = match self.geps.get(off as usize) {
            Some(m) if !m.is_empty() => m,
            _ => return PtsSet::new(),
        };
        let masked = set.intersect(mask);
        masked.to_vec().into_iter().map(|x| x + off).collect()
    }

    /// External functions called by the module but absent from the effect
    /// table (populated during constraint generation).
    pub fn unknown_externals(&self) -> Vec<String> {
        self.ext_unknown.iter().cloned().collect()
    }

    pub(crate) fn cache_mut(&mut self) -> &mut PtsCache {
        &mut self.cache
    }

    pub fn cache_report(&self) -> String {
        self.cache.report()
    }
}
