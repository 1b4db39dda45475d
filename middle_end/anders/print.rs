//! Textual dumps for debugging and tests: the points-to graph, the
//! constraint list, struct layouts, and the run statistics.

use std::fmt;
use std::fmt::Write;

use super::*;

impl Anders {
    /// A printable name for a node: its program entity if it has one,
    /// `n<id>` for artificial nodes.
    pub fn node_name(&self, n: u32) -> String {
        match &self.node(n).val {
            Some(v) => v.to_string(),
            None => format!("n{n}"),
        }
    }

    /// The points-to graph, one `name -> {members}` line per node that
    /// stands for a program entity.  Unsorted output is in node-ID order;
    /// sorted output is in name order.
    pub fn cons_graph_to_string(&self, sorted: bool) -> String {
        let mut lines = vec![];
        for i in I2P..self.num_nodes() {
            if self.node(i).val.is_none() {
                continue;
            }
            let r = self.cget_node_rep(i);
            let pts = &self.node(r).points_to;
            if pts.is_empty() {
                continue;
            }
            let members = pts
                .to_vec()
                .iter()
                .map(|&x| self.node_name(x))
                .collect::<Vec<String>>()
                .join(", ");
            lines.push(format!("{} -> {{{members}}}", self.node_name(i)));
        }
        if sorted {
            lines.sort();
        }
        let mut out = lines.join("\n");
        out.push('\n');
        out
    }

    /// The graph by raw node ID, one line per representative with a
    /// nonempty set.  This is the dump for constraint-file runs, where
    /// nodes have no program entities behind them.
    pub fn raw_graph_to_string(&self) -> String {
        let mut out = String::new();
        for i in I2P..self.num_nodes() {
            if self.cget_node_rep(i) != i {
                continue;
            }
            let pts = &self.node(i).points_to;
            if pts.is_empty() {
                continue;
            }
            let members = pts
                .to_vec()
                .iter()
                .map(|&x| format!("n{x}"))
                .collect::<Vec<String>>()
                .join(", ");
            let _ = writeln!(out, "n{i} -> {{{members}}}");
        }
        out
    }

    /// The current constraint list, in the round-trippable textual form.
    pub fn constraints_to_string(&self, sorted: bool) -> String {
        let mut cs = self.constraints.clone();
        if sorted {
            cs.sort();
        }
        let mut out = String::new();
        for c in cs {
            let _ = writeln!(out, "{c}");
        }
        out
    }

    /// The flattened layouts computed so far.  Only meaningful between
    /// constraint generation and `pre_opt_cleanup`.
    pub fn struct_info_to_string(&self) -> String {
        let mut out = String::new();
        for (id, (sz, off)) in &self.struct_info {
            let szs = sz
                .iter()
                .map(|s| s.to_string())
                .collect::<Vec<String>>()
                .join(", ");
            let offs = off
                .iter()
                .map(|o| o.to_string())
                .collect::<Vec<String>>()
                .join(", ");
            let _ = writeln!(out, "{id}: sz = [{szs}], off = [{offs}]");
        }
        out
    }

    /// The equivalence classes with more than one member, by name.
    pub fn classes_to_string(&self) -> String {
        let mut classes: std::collections::BTreeMap<u32, Vec<String>> =
            std::collections::BTreeMap::new();
        for i in I2P..self.num_nodes() {
            let r = self.cget_node_rep(i);
            classes.entry(r).or_default().push(self.node_name(i));
        }
        let mut out = String::new();
        for (r, members) in classes {
            if members.len() > 1 {
                let _ = writeln!(out, "{}: {{{}}}", self.node_name(r), members.join(", "));
            }
        }
        out
    }
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "Initial nodes: {} val, {} obj", self.i_val_nodes, self.i_obj_nodes)?;
        writeln!(f, "Instructions: {}", self.insn)?;
        writeln!(
            f,
            "Initial constraints: {} ({} addr, {} copy, {} load, {} store, {} gep)",
            self.i_cons,
            self.i_addr_cons,
            self.i_copy_cons,
            self.i_load_cons,
            self.i_store_cons,
            self.i_gep_cons
        )?;
        writeln!(
            f,
            "Reduced: {} val nodes, {} constraints ({} addr, {} copy, {} load, {} store, {} gep)",
            self.r_val_nodes,
            self.r_cons,
            self.r_addr_cons,
            self.r_copy_cons,
            self.r_load_cons,
            self.r_store_cons,
            self.r_gep_cons
        )?;
        writeln!(
            f,
            "Offline: {} hvn merges, {} hcd entries, {} hcd var merges, {} factored",
            self.hvn_merge, self.hcd_size, self.hcd_var_merge, self.ls_factored
        )?;
        writeln!(
            f,
            "Solver: {} passes, {} pushes, {} pops, {} runs",
            self.passes, self.node_push, self.node_pop, self.node_run
        )?;
        writeln!(
            f,
            "Edges: {} copy added, {} copy deleted, {} complex deleted, {} indirect allocs",
            self.copy_add, self.copy_del, self.ccons_del, self.ind_alloc
        )?;
        writeln!(
            f,
            "Cycles: {} lcd runs, {} lcd sccs ({} nodes), {} hcd collapses ({} merges)",
            self.lcd_run, self.lcd_scc, self.lcd_sccn, self.hcd_on_scc, self.hcd_on_var_merge
        )
    }
}
