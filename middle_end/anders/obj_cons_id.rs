//! Object and constraint identification: the single pass over the module
//! that allocates nodes and emits the initial constraint set, plus the
//! struct layout analyzer it leans on.

use std::collections::{BTreeMap as Map, BTreeSet as Set};

use super::extinfo::ExtEffect;
use super::*;
use crate::commons::Valid;
use crate::middle_end::lir::*;

impl Anders {
    /// Walk the module: globals first (objects, then initializers), then
    /// functions and their bodies.
    pub fn obj_cons_id(&mut self, valid: &Valid<Program>) -> Result<(), AndersError> {
        let prog = &valid.0;

        // reserved nodes: 0 = none, then i2p and its constant pointer.
        let none = self.add_node(None, 0, false);
        let i2p = self.add_node(None, 1, true);
        let p_i2p = self.add_node(None, 0, false);
        assert!(none == NODE_NONE && i2p == I2P && p_i2p == P_I2P);
        self.add_cons(ConsType::AddrOf, I2P, I2P, 0);
        self.add_cons(ConsType::AddrOf, P_I2P, I2P, 0);

        for fid in prog.externs.keys() {
            self.ext_funcs.insert(fid.clone());
        }
        for fid in prog.functions.keys() {
            if self.extinfo.is_ext(fid, prog) {
                self.ext_funcs.insert(fid.clone());
            }
        }

        self.compute_max_struct(prog);
        for g in &prog.globals {
            self.id_global(prog, g);
        }
        for func in prog.functions.values() {
            self.id_func(func);
        }
        for g in &prog.globals {
            if let Some(init) = &g.init {
                let on = self.obj_node[&g.name];
                if self.global_init_done.insert(on) {
                    let typ = g.name.typ();
                    self.global_init_r(prog, on, &typ, init, false)?;
                }
            }
        }
        for func in prog.functions.values() {
            self.visit_func(prog, func)?;
        }

        self.count_initial_stats();
        if self.config.check_cons_undef {
            self.check_cons_undef()?;
        }
        Ok(())
    }

    fn count_initial_stats(&mut self) {
        self.stats.i_val_nodes = self.nodes.iter().filter(|n| n.obj_sz == 0).count() as u32 - 1;
        self.stats.i_obj_nodes = self.nodes.iter().filter(|n| n.obj_sz > 0).count() as u32;
        self.stats.i_cons = self.constraints.len() as u32;
        for c in &self.constraints {
            match c.kind {
                ConsType::AddrOf => self.stats.i_addr_cons += 1,
                ConsType::Copy => self.stats.i_copy_cons += 1,
                ConsType::Load => self.stats.i_load_cons += 1,
                ConsType::Store => self.stats.i_store_cons += 1,
                ConsType::Gep => self.stats.i_gep_cons += 1,
            }
        }
    }

    /// Every value used as a constraint endpoint must be a real node, and
    /// every addr-of source must be an object.  Failures here are bugs in
    /// the generator, not in the input.
    fn check_cons_undef(&self) -> Result<(), AndersError> {
        for c in &self.constraints {
            if c.dest == NODE_NONE
                || c.src == NODE_NONE
                || c.dest as usize >= self.nodes.len()
                || c.src as usize >= self.nodes.len()
            {
                return Err(AndersError::BadIr(format!(
                    "constraint references an undefined node: {c}"
                )));
            }
            if c.kind == ConsType::AddrOf && self.node(c.src).obj_sz == 0 {
                return Err(AndersError::BadIr(format!(
                    "addr-of constraint with a non-object source: {c}"
                )));
            }
        }
        Ok(())
    }

    // SECTION: struct layout analyzer

    /// `layout(T)`: the memoized (sizes, offsets) pair for a struct type.
    /// If field `i` of the expanded struct begins an embedded struct,
    /// `sz[i]` is the number of fields in the largest such struct, else 1;
    /// `sz[0]` is always the total expanded size, since a pointer to the
    /// first field may mean all of T.  A field with index `j` in the
    /// original struct sits at index `off[j]` in the expansion.
    pub fn get_struct_info(&mut self, prog: &Program, id: &StructId) -> &(Vec<u32>, Vec<u32>) {
        self.ensure_struct_info(prog, id);
        &self.struct_info[id]
    }

    fn ensure_struct_info(&mut self, prog: &Program, id: &StructId) {
        if self.struct_info.contains_key(id) {
            return;
        }
        let fields = prog.structs[id].clone();
        if !self.config.field_sensitive {
            // every struct is a single cell.
            self.struct_info
                .insert(id.clone(), (vec![1], vec![0; fields.len()]));
            return;
        }
        let mut sz: Vec<u32> = vec![];
        let mut off: Vec<u32> = vec![];
        for fld in &fields {
            off.push(sz.len() as u32);
            let (t, from_array) = strip_arrays(&fld.typ);
            if from_array {
                // arrays collapse to a single weak entry, whatever the
                // element shape.
                sz.push(1);
                continue;
            }
            match t.0.get() {
                LirType::Struct(inner) => {
                    self.ensure_struct_info(prog, inner);
                    sz.extend(self.struct_info[inner].0.iter());
                }
                _ => sz.push(1),
            }
        }
        if sz.is_empty() {
            sz.push(1);
        }
        sz[0] = sz.len() as u32;
        self.struct_info.insert(id.clone(), (sz, off));
    }

    fn compute_max_struct(&mut self, prog: &Program) {
        let ids: Vec<StructId> = prog.structs.keys().cloned().collect();
        for id in &ids {
            self.ensure_struct_info(prog, id);
            let n = self.struct_info[id].0.len() as u32;
            if n > self.max_struct_sz {
                self.max_struct_sz = n;
                self.max_struct = Some(id.clone());
            }
        }
    }

    // SECTION: node creation

    /// Allocate the object block for storage of the given type: one node
    /// per flattened field for structs, a single weak node for arrays.
    fn make_object_nodes(
        &mut self,
        prog: &Program,
        base: ObjBase,
        typ: &Type,
        force_weak: bool,
    ) -> u32 {
        let (t, from_array) = strip_arrays(typ);
        if from_array {
            // arrays collapse to one weak cell, even arrays of structs.
            return self.add_node(Some(NodeVal::Obj { base, off: 0 }), 1, true);
        }
        let weak = force_weak || self.type_reaches_array(prog, &t);
        if let LirType::Struct(id) = t.0.get() {
            self.ensure_struct_info(prog, id);
            let sz = self.struct_info[id].0.clone();
            let first = self.nodes.len() as u32;
            for (i, s) in sz.iter().enumerate() {
                self.add_node(
                    Some(NodeVal::Obj { base: base.clone(), off: i as u32 }),
                    *s,
                    weak,
                );
            }
            first
        } else {
            self.add_node(Some(NodeVal::Obj { base, off: 0 }), 1, weak)
        }
    }

    fn type_reaches_array(&self, prog: &Program, typ: &Type) -> bool {
        fn walk(prog: &Program, typ: &Type, seen: &mut Set<StructId>) -> bool {
            match typ.0.get() {
                LirType::Array { .. } => true,
                LirType::Struct(id) => {
                    if !seen.insert(id.clone()) {
                        return false;
                    }
                    prog.structs[id].iter().any(|f| walk(prog, &f.typ, seen))
                }
                _ => false,
            }
        }
        walk(prog, typ, &mut Set::new())
    }

    /// A fresh heap object for an allocation site.  Without a traced type
    /// the shape defaults to the biggest struct seen (or a single cell).
    fn make_heap_object(&mut self, prog: &Program, ty: Option<Type>) -> u32 {
        let site = self.next_heap_site;
        self.next_heap_site += 1;
        let base = ObjBase::Heap(site);
        match ty.or_else(|| self.max_struct.clone().map(struct_ty)) {
            Some(t) => self.make_object_nodes(prog, base, &t, true),
            None => self.add_node(Some(NodeVal::Obj { base, off: 0 }), 1, true),
        }
    }

    fn id_global(&mut self, prog: &Program, g: &Global) {
        let typ = g.name.typ();
        let obj = self.make_object_nodes(prog, ObjBase::Global(g.name.clone()), &typ, false);
        self.obj_node.insert(g.name.clone(), obj);
        let val = self.add_node(Some(NodeVal::Var(g.name.clone())), 0, false);
        self.val_node.insert(g.name.clone(), val);
        self.add_cons(ConsType::AddrOf, val, obj, 0);
    }

    /// Value nodes for a function's return, varargs sink, params, and
    /// locals.  The object block is made lazily, on first address-take.
    fn id_func(&mut self, func: &Function) {
        if func.ret_ty.as_ref().is_some_and(|t| t.can_hold_ptr()) {
            let rn = self.add_node(Some(NodeVal::Ret(func.id.clone())), 0, false);
            self.ret_node.insert(func.id.clone(), rn);
        }
        if func.va {
            let vn = self.add_node(Some(NodeVal::VarArg(func.id.clone())), 0, false);
            self.vararg_node.insert(func.id.clone(), vn);
        }
        for p in &func.params {
            if p.typ().can_hold_ptr() {
                let n = self.add_node(Some(NodeVal::Var(p.clone())), 0, false);
                self.val_node.insert(p.clone(), n);
            }
        }
        for l in &func.locals {
            if l.typ().can_hold_ptr() {
                let n = self.add_node(Some(NodeVal::Var(l.clone())), 0, false);
                self.val_node.insert(l.clone(), n);
            }
        }
    }

    /// The node of the constant `@f`, created on first use together with
    /// the function's object block.
    fn get_func_ptr_node(&mut self, prog: &Program, f: &FuncId) -> u32 {
        if let Some(&n) = self.func_val_node.get(f) {
            return n;
        }
        let obj = self.get_func_obj_node(prog, f);
        let n = self.add_node(Some(NodeVal::FuncPtr(f.clone())), 0, false);
        self.func_val_node.insert(f.clone(), n);
        self.add_cons(ConsType::AddrOf, n, obj, 0);
        n
    }

    /// The object block of an address-taken function: offset 0 is the
    /// function itself, offset 1 the return passthrough, offsets 2..k+1
    /// the parameter passthroughs.  External functions get a single node;
    /// their calls dispatch through the effect table instead.
    fn get_func_obj_node(&mut self, prog: &Program, f: &FuncId) -> u32 {
        if let Some(&n) = self.func_obj_node.get(f) {
            return n;
        }
        let obj = match prog.functions.get(f) {
            Some(func) if !self.ext_funcs.contains(f) => {
                let k = func.params.len() as u32;
                let head = self.add_node(Some(NodeVal::FuncObj(f.clone())), k + 2, false);
                let ret_obj = self.add_node(Some(NodeVal::RetObj(f.clone())), 1, false);
                for i in 0..k {
                    self.add_node(Some(NodeVal::ArgObj(f.clone(), i)), 1, false);
                }
                // wire the passthroughs to the real return/param nodes.
                if let Some(rn) = self.ret_node.get(f).copied() {
                    self.add_cons(ConsType::Copy, ret_obj, rn, 0);
                }
                for (i, p) in func.params.iter().enumerate() {
                    if let Some(pn) = self.val_node.get(p).copied() {
                        self.add_cons(
                            ConsType::Copy,
                            pn,
                            head + FUNC_NODE_OFF_ARG0 + i as u32,
                            0,
                        );
                    }
                }
                head
            }
            _ => self.add_node(Some(NodeVal::FuncObj(f.clone())), 1, false),
        };
        self.func_obj_node.insert(f.clone(), obj);
        obj
    }

    fn get_local_obj_node(&mut self, prog: &Program, v: &VarId) -> u32 {
        if let Some(&n) = self.obj_node.get(v) {
            return n;
        }
        let typ = v.typ();
        let obj = self.make_object_nodes(prog, ObjBase::Local(v.clone()), &typ, false);
        self.obj_node.insert(v.clone(), obj);
        obj
    }

    fn get_val_node(&self, v: &VarId) -> u32 {
        *self
            .val_node
            .get(v)
            .unwrap_or_else(|| panic!("no value node for `{}`", v.with_funcid()))
    }

    /// The node holding the value of an operand, or None for constants
    /// with no pointer content.
    fn get_val_node_cptr(&mut self, prog: &Program, op: &Operand) -> Option<u32> {
        match op {
            Operand::Var(v) => self.val_node.get(v).copied(),
            Operand::Global(v) => Some(self.get_val_node(v)),
            Operand::Func(f) => Some(self.get_func_ptr_node(prog, f)),
            Operand::CInt(_) | Operand::Null => None,
        }
    }

    // SECTION: global initializers

    /// Seed addr-of constraints for an initializer, walking the constant
    /// and the layout together.  `node` is the object node at the current
    /// flattened position; `single` means that position is a collapsed
    /// array cell, so nested fields stay on it.  Zero and null fields
    /// contribute nothing.
    fn global_init_r(
        &mut self,
        prog: &Program,
        node: u32,
        typ: &Type,
        c: &Const,
        single: bool,
    ) -> Result<(), AndersError> {
        match c {
            Const::Int(_) | Const::Null => {}
            Const::GlobalRef(h) => {
                let o = self.obj_node[h];
                self.add_cons(ConsType::AddrOf, node, o, 0);
            }
            Const::FuncRef(f) => {
                let o = self.get_func_obj_node(prog, f);
                self.add_cons(ConsType::AddrOf, node, o, 0);
            }
            Const::Gep { base, idx } => {
                // a constant gep folds to the right sub-node.
                let base_ty = base.typ();
                let off = self.compute_gep_off(prog, &base_ty, &idx_consts(idx))?;
                let o = self.obj_node[base] + off;
                self.add_cons(ConsType::AddrOf, node, o, 0);
            }
            Const::Struct(elems) => {
                let (t, from_array) = strip_arrays(typ);
                let single = single || from_array;
                if let LirType::Struct(id) = t.0.get() {
                    let id = id.clone();
                    self.ensure_struct_info(prog, &id);
                    let off = self.struct_info[&id].1.clone();
                    let fields = prog.structs[&id].clone();
                    for (j, e) in elems.iter().enumerate() {
                        if j < off.len() {
                            let target = if single { node } else { node + off[j] };
                            self.global_init_r(prog, target, &fields[j].typ, e, single)?;
                        }
                    }
                } else {
                    for e in elems {
                        self.global_init_r(prog, node, typ, e, single)?;
                    }
                }
            }
            Const::Array(elems) => {
                // arrays collapse to one weak cell; every element lands
                // on it.
                let elem_ty = match typ.0.get() {
                    LirType::Array { elem, .. } => elem.clone(),
                    _ => typ.clone(),
                };
                for e in elems {
                    self.global_init_r(prog, node, &elem_ty, e, true)?;
                }
            }
        }
        Ok(())
    }

    // SECTION: functions

    fn visit_func(&mut self, prog: &Program, func: &Function) -> Result<(), AndersError> {
        // def map for tracing int-to-pointer casts back to their sources.
        let mut defs: Map<VarId, &Instruction> = Map::new();
        for bb in func.body.values() {
            for inst in &bb.insts {
                if let Some(lhs) = inst_lhs(inst) {
                    defs.insert(lhs.clone(), inst);
                }
            }
        }

        for bb in func.body.values() {
            self.stats.insn += bb.insts.len() as u32 + 1;
            for inst in &bb.insts {
                self.id_insn(prog, func, &defs, inst)?;
            }
            self.id_term(prog, func, &bb.term)?;
        }
        Ok(())
    }

    fn id_insn(
        &mut self,
        prog: &Program,
        func: &Function,
        defs: &Map<VarId, &Instruction>,
        inst: &Instruction,
    ) -> Result<(), AndersError> {
        use Instruction::*;
        match inst {
            AddrOf { lhs, op } => {
                let n = self.get_val_node(lhs);
                let obj = self.get_local_obj_node(prog, op);
                self.add_cons(ConsType::AddrOf, n, obj, 0);
            }
            Alloc { lhs, ty } => {
                let n = self.get_val_node(lhs);
                let traced = self.trace_alloc_type(lhs, ty.clone());
                let obj = self.make_heap_object(prog, traced);
                self.add_cons(ConsType::AddrOf, n, obj, 0);
            }
            Arith { .. } | Cmp { .. } | PtrToInt { .. } => {
                // no effect on pointers; ptr2int matters only as a trace
                // target for int2ptr.
            }
            Copy { lhs, op } => {
                if lhs.typ().can_hold_ptr() {
                    let n = self.get_val_node(lhs);
                    self.id_copy_from_op(prog, n, op);
                }
            }
            Gep { lhs, src, idx } => {
                if lhs.typ().is_ptr() {
                    self.id_gep_insn(prog, lhs, src, idx)?;
                }
            }
            Load { lhs, src } => {
                if lhs.typ().can_hold_ptr() {
                    let n = self.get_val_node(lhs);
                    if let Some(s) = self.get_val_node_cptr(prog, src) {
                        self.add_cons(ConsType::Load, n, s, 0);
                    }
                }
            }
            Store { dst, op } => {
                if let Some(d) = self.get_val_node_cptr(prog, dst) {
                    self.id_store_insn(prog, d, op);
                }
            }
            Phi { lhs, ops } => {
                if lhs.typ().can_hold_ptr() {
                    let n = self.get_val_node(lhs);
                    for op in ops {
                        self.id_copy_from_op(prog, n, op);
                    }
                }
            }
            Select { lhs, tt, ff, .. } => {
                if lhs.typ().can_hold_ptr() {
                    let n = self.get_val_node(lhs);
                    self.id_copy_from_op(prog, n, tt);
                    self.id_copy_from_op(prog, n, ff);
                }
            }
            IntToPtr { lhs, op } => {
                if lhs.typ().is_ptr() {
                    self.id_i2p_insn(prog, lhs, op, defs);
                }
            }
            ExtractValue { lhs, src, .. } => {
                // aggregate SSA values are field-collapsed.
                if lhs.typ().can_hold_ptr() {
                    let n = self.get_val_node(lhs);
                    if let Some(s) = self.val_node.get(src).copied() {
                        self.add_cons(ConsType::Copy, n, s, 0);
                    }
                }
            }
            InsertValue { lhs, src, op, .. } => {
                if lhs.typ().can_hold_ptr() {
                    let n = self.get_val_node(lhs);
                    if let Some(s) = self.val_node.get(src).copied() {
                        self.add_cons(ConsType::Copy, n, s, 0);
                    }
                    self.id_copy_from_op(prog, n, op);
                }
            }
            VaArg { lhs } => {
                if lhs.typ().can_hold_ptr() {
                    let n = self.get_val_node(lhs);
                    let vn = self.vararg_node[&func.id];
                    self.add_cons(ConsType::Copy, n, vn, 0);
                }
            }
            CallExt { lhs, ext_callee, args } => {
                self.id_ext_call(prog, ext_callee, lhs.as_ref(), args);
            }
        }
        Ok(())
    }

    fn id_term(
        &mut self,
        prog: &Program,
        func: &Function,
        term: &Terminal,
    ) -> Result<(), AndersError> {
        match term {
            Terminal::Branch { .. } | Terminal::Jump(_) => {}
            Terminal::Ret(op) => {
                if let (Some(rn), Some(op)) = (self.ret_node.get(&func.id).copied(), op.as_ref()) {
                    self.id_copy_from_op(prog, rn, op);
                }
            }
            Terminal::CallDirect { lhs, callee, args, .. } => {
                if self.extinfo.is_ext(callee, prog) {
                    self.id_ext_call(prog, callee, lhs.as_ref(), args);
                } else {
                    self.id_dir_call(prog, callee, lhs.as_ref(), args);
                }
            }
            Terminal::CallIndirect { lhs, callee, args, .. } => {
                self.id_ind_call(prog, callee, lhs.as_ref(), args);
            }
        }
        Ok(())
    }

    /// `dest ⊇ op`, with address-of folding for module-level operands.
    /// An integer constant flowing into a pointer is an unknown cast and
    /// pins `i2p`.
    fn id_copy_from_op(&mut self, prog: &Program, dest: u32, op: &Operand) {
        match op {
            Operand::Var(v) => {
                if let Some(&s) = self.val_node.get(v) {
                    self.add_cons(ConsType::Copy, dest, s, 0);
                }
            }
            Operand::Global(v) => {
                let obj = self.obj_node[v];
                self.add_cons(ConsType::AddrOf, dest, obj, 0);
            }
            Operand::Func(f) => {
                let obj = self.get_func_obj_node(prog, f);
                self.add_cons(ConsType::AddrOf, dest, obj, 0);
            }
            Operand::CInt(_) => {
                self.add_cons(ConsType::AddrOf, dest, I2P, 0);
            }
            Operand::Null => {}
        }
    }

    fn id_store_insn(&mut self, prog: &Program, dst: u32, op: &Operand) {
        if let Operand::Var(v) = op {
            let (t, _) = strip_arrays(&v.typ());
            if let LirType::Struct(id) = t.0.get() {
                // an aggregate store writes every field; collapse the SSA
                // aggregate into all of them.
                let id = id.clone();
                self.ensure_struct_info(prog, &id);
                let sz = self.struct_info[&id].0[0];
                if let Some(&s) = self.val_node.get(v) {
                    for i in 0..sz {
                        self.add_cons(ConsType::Store, dst, s, i);
                    }
                }
                return;
            }
        }
        match op {
            Operand::CInt(_) | Operand::Null => {}
            _ => {
                if let Some(s) = self.get_val_node_cptr(prog, op) {
                    self.add_cons(ConsType::Store, dst, s, 0);
                }
            }
        }
    }

    fn id_gep_insn(
        &mut self,
        prog: &Program,
        lhs: &VarId,
        src: &Operand,
        idx: &[GepIdx],
    ) -> Result<(), AndersError> {
        let n = self.get_val_node(lhs);
        let base_ty = match src {
            Operand::Var(v) => v.typ().base_typ().ok_or_else(|| {
                AndersError::BadIr(format!("gep through non-pointer `{}`", v.with_funcid()))
            })?,
            Operand::Global(v) => v.typ(),
            _ => {
                return Err(AndersError::BadIr("gep off a constant operand".to_string()));
            }
        };
        let off = self.compute_gep_off(prog, &base_ty, idx)?;
        // a gep off a global with constant indices folds to an addr-of
        // into the right sub-node.
        if let Operand::Global(v) = src {
            if idx.iter().all(|i| matches!(i, GepIdx::Const(_))) {
                let o = self.obj_node[v] + off;
                self.add_cons(ConsType::AddrOf, n, o, 0);
                return Ok(());
            }
        }
        if let Some(s) = self.get_val_node_cptr(prog, src) {
            self.add_cons(ConsType::Gep, n, s, off);
        }
        Ok(())
    }

    /// Resolve a gep's indices into a single flat offset.  The first
    /// index steps over the pointee as an array and contributes nothing;
    /// struct levels need constant indices.  Array objects are a single
    /// cell, so once the walk steps through an array level the offset
    /// freezes: everything inside lands on that cell.
    fn compute_gep_off(
        &mut self,
        prog: &Program,
        base_ty: &Type,
        idx: &[GepIdx],
    ) -> Result<u32, AndersError> {
        let mut off = 0;
        let mut in_array = false;
        let mut cur = base_ty.clone();
        for ix in idx.iter().skip(1) {
            let next = match cur.0.get() {
                LirType::Array { elem, .. } => {
                    in_array = true;
                    elem.clone()
                }
                LirType::Struct(id) => {
                    let id = id.clone();
                    let c = match ix {
                        GepIdx::Const(c) => *c,
                        GepIdx::Var(v) => {
                            return Err(AndersError::BadIr(format!(
                                "variable struct index `{}` in gep",
                                v.with_funcid()
                            )));
                        }
                    };
                    self.ensure_struct_info(prog, &id);
                    let offs = &self.struct_info[&id].1;
                    if c as usize >= offs.len() {
                        return Err(AndersError::BadIr(format!(
                            "gep index {c} out of range for struct `{id}`"
                        )));
                    }
                    if !in_array {
                        off += offs[c as usize];
                    }
                    prog.structs[&id][c as usize].typ.clone()
                }
                _ => {
                    return Err(AndersError::BadIr("gep steps into a scalar".to_string()));
                }
            };
            cur = next;
        }
        Ok(off)
    }

    /// The allocated type of an allocation: the declared one if present,
    /// else the pointee of the destination if it is a struct.  None falls
    /// back to `max_struct` in `make_heap_object`.
    fn trace_alloc_type(&self, lhs: &VarId, ty: Option<Type>) -> Option<Type> {
        ty.or_else(|| lhs.typ().base_typ().filter(|t| t.is_struct()))
    }

    /// Trace an integer operand back to the pointers it was made from.
    /// None means the origin is unknown and the destination must be
    /// pinned to `i2p`.
    fn trace_int(
        &mut self,
        prog: &Program,
        defs: &Map<VarId, &Instruction>,
        op: &Operand,
        seen: &mut Set<VarId>,
        depth: u32,
    ) -> Option<Vec<u32>> {
        if depth > 8 {
            return None;
        }
        match op {
            Operand::Null => Some(vec![]),
            Operand::CInt(_) => None,
            Operand::Global(v) => Some(vec![self.get_val_node(v)]),
            Operand::Func(f) => Some(vec![self.get_func_ptr_node(prog, f)]),
            Operand::Var(v) => {
                if !seen.insert(v.clone()) {
                    return Some(vec![]);
                }
                match defs.get(v) {
                    Some(Instruction::PtrToInt { op, .. }) => {
                        let op = (*op).clone();
                        self.get_val_node_cptr(prog, &op).map(|n| vec![n])
                    }
                    Some(Instruction::Copy { op, .. }) => {
                        let op = (*op).clone();
                        self.trace_int(prog, defs, &op, seen, depth + 1)
                    }
                    Some(Instruction::Phi { ops, .. }) => {
                        let ops = ops.clone();
                        let mut out = vec![];
                        for o in &ops {
                            out.extend(self.trace_int(prog, defs, o, seen, depth + 1)?);
                        }
                        Some(out)
                    }
                    Some(Instruction::Select { tt, ff, .. }) => {
                        let (tt, ff) = ((*tt).clone(), (*ff).clone());
                        let mut out = self.trace_int(prog, defs, &tt, seen, depth + 1)?;
                        out.extend(self.trace_int(prog, defs, &ff, seen, depth + 1)?);
                        Some(out)
                    }
                    _ => None,
                }
            }
        }
    }

    fn id_i2p_insn(
        &mut self,
        prog: &Program,
        lhs: &VarId,
        op: &Operand,
        defs: &Map<VarId, &Instruction>,
    ) {
        let n = self.get_val_node(lhs);
        match self.trace_int(prog, defs, op, &mut Set::new(), 0) {
            Some(srcs) => {
                for s in srcs {
                    self.add_cons(ConsType::Copy, n, s, 0);
                }
            }
            None => {
                self.add_cons(ConsType::AddrOf, n, I2P, 0);
            }
        }
    }

    // SECTION: calls

    fn id_dir_call(
        &mut self,
        prog: &Program,
        callee: &FuncId,
        lhs: Option<&VarId>,
        args: &[Operand],
    ) {
        let func = &prog.functions[callee];
        if let Some(lhs) = lhs {
            if lhs.typ().can_hold_ptr() {
                if let Some(rn) = self.ret_node.get(callee).copied() {
                    let n = self.get_val_node(lhs);
                    self.add_cons(ConsType::Copy, n, rn, 0);
                }
            }
        }
        for (i, arg) in args.iter().enumerate() {
            if let Some(param) = func.params.get(i) {
                if param.typ().can_hold_ptr() {
                    let pn = self.get_val_node(param);
                    self.id_copy_from_op(prog, pn, arg);
                }
            } else if func.va {
                // surplus arguments of a variadic call land in the sink.
                if let Some(vn) = self.vararg_node.get(callee).copied() {
                    self.id_copy_from_op(prog, vn, arg);
                }
            }
        }
    }

    /// An indirect call becomes load/store constraints through the
    /// callee's function block.  The site is registered so external
    /// callees can dispatch through the effect table at solve time.
    fn id_ind_call(
        &mut self,
        prog: &Program,
        callee: &VarId,
        lhs: Option<&VarId>,
        args: &[Operand],
    ) {
        let fp = self.get_val_node(callee);
        self.ind_calls.insert(fp);

        let lhs_node = lhs
            .filter(|l| l.typ().can_hold_ptr())
            .map(|l| self.get_val_node(l))
            .unwrap_or(NODE_NONE);
        let arg_nodes: Vec<u32> = args
            .iter()
            .map(|a| self.get_val_node_cptr(prog, a).unwrap_or(NODE_NONE))
            .collect();
        let site = self.icall_sites.len() as u32;
        self.icall_sites.push(IcallSite {
            lhs: lhs_node,
            args: arg_nodes.clone(),
        });

        if lhs_node != NODE_NONE {
            let c = Constraint::new(ConsType::Load, lhs_node, fp, FUNC_NODE_OFF_RET);
            self.add_cons(c.kind, c.dest, c.src, c.off);
            self.icall_cons.entry(c).or_default().insert(site);
        }
        for (i, &an) in arg_nodes.iter().enumerate() {
            if an != NODE_NONE {
                let c = Constraint::new(
                    ConsType::Store,
                    fp,
                    an,
                    FUNC_NODE_OFF_ARG0 + i as u32,
                );
                self.add_cons(c.kind, c.dest, c.src, c.off);
                self.icall_cons.entry(c).or_default().insert(site);
            }
        }
    }

    /// Apply an external function's effect tag at a direct call site.
    fn id_ext_call(
        &mut self,
        prog: &Program,
        callee: &FuncId,
        lhs: Option<&VarId>,
        args: &[Operand],
    ) {
        let effect = self.extinfo.get_effect(&callee.0);
        if effect == ExtEffect::Other && !self.extinfo.is_known(&callee.0) {
            self.ext_unknown.insert(callee.0.clone());
        }
        let ln = lhs
            .filter(|l| l.typ().can_hold_ptr())
            .map(|l| self.get_val_node(l))
            .unwrap_or(NODE_NONE);
        let an: Vec<u32> = args
            .iter()
            .map(|a| self.get_val_node_cptr(prog, a).unwrap_or(NODE_NONE))
            .collect();

        match effect {
            ExtEffect::Noop | ExtEffect::Other => {}
            ExtEffect::Alloc => {
                if ln != NODE_NONE {
                    let ty = lhs.and_then(|l| self.trace_alloc_type(l, None));
                    let obj = self.make_heap_object(prog, ty);
                    self.add_cons(ConsType::AddrOf, ln, obj, 0);
                }
            }
            ExtEffect::NostructAlloc => {
                if ln != NODE_NONE {
                    let site = self.next_heap_site;
                    self.next_heap_site += 1;
                    let obj = self.add_node(
                        Some(NodeVal::Obj { base: ObjBase::Heap(site), off: 0 }),
                        1,
                        true,
                    );
                    self.add_cons(ConsType::AddrOf, ln, obj, 0);
                }
            }
            ExtEffect::Realloc => {
                if matches!(args.first(), Some(Operand::Null)) {
                    if ln != NODE_NONE {
                        let ty = lhs.and_then(|l| self.trace_alloc_type(l, None));
                        let obj = self.make_heap_object(prog, ty);
                        self.add_cons(ConsType::AddrOf, ln, obj, 0);
                    }
                } else if ln != NODE_NONE {
                    if let Some(&a0) = an.first() {
                        if a0 != NODE_NONE {
                            self.add_cons(ConsType::Copy, ln, a0, 0);
                        }
                    }
                }
            }
            ExtEffect::Stat => {
                if ln != NODE_NONE {
                    let x = self.get_stat_node(&callee.0);
                    self.add_cons(ConsType::AddrOf, ln, x, 0);
                }
            }
            ExtEffect::Stat2 => {
                if ln != NODE_NONE {
                    let x = self.get_stat_node(&callee.0);
                    let y = self.get_stat_node(&format!("{}$2", callee.0));
                    self.add_cons(ConsType::AddrOf, ln, x, 0);
                    self.add_cons(ConsType::AddrOf, x, y, 0);
                }
            }
            ExtEffect::LArg(i) => {
                if ln != NODE_NONE {
                    if let Some(&a) = an.get(i as usize) {
                        if a != NODE_NONE {
                            self.add_cons(ConsType::Copy, ln, a, 0);
                        }
                    }
                }
            }
            ExtEffect::CopyR { dst, src, ns, ret } => {
                let (d, s) = (
                    an.get(dst as usize).copied().unwrap_or(NODE_NONE),
                    an.get(src as usize).copied().unwrap_or(NODE_NONE),
                );
                if d != NODE_NONE && s != NODE_NONE {
                    let sz = if ns {
                        1
                    } else {
                        self.max_offset(args.get(dst as usize))
                            .min(self.max_offset(args.get(src as usize)))
                    };
                    self.add_store2_cons(d, s, sz);
                }
                if ret && ln != NODE_NONE && d != NODE_NONE {
                    self.add_cons(ConsType::Copy, ln, d, 0);
                }
            }
            ExtEffect::StoreArg { dst, src, ret } => {
                let (d, s) = (
                    an.get(dst as usize).copied().unwrap_or(NODE_NONE),
                    an.get(src as usize).copied().unwrap_or(NODE_NONE),
                );
                if d != NODE_NONE && s != NODE_NONE {
                    self.add_cons(ConsType::Store, d, s, 0);
                    if ret && ln != NODE_NONE {
                        self.add_cons(ConsType::Copy, ln, s, 0);
                    }
                }
            }
            ExtEffect::NewArg(i) => {
                if let Some(&a) = an.get(i as usize) {
                    if a != NODE_NONE {
                        let obj = self.make_heap_object(prog, None);
                        let tmp = self.add_node(None, 0, false);
                        self.add_cons(ConsType::AddrOf, tmp, obj, 0);
                        self.add_cons(ConsType::Store, a, tmp, 0);
                    }
                }
            }
        }
    }

    fn get_stat_node(&mut self, name: &str) -> u32 {
        if let Some(&n) = self.stat_ret_node.get(name) {
            return n;
        }
        let n = self.add_node(
            Some(NodeVal::Obj { base: ObjBase::Stat(name.to_string()), off: 0 }),
            1,
            true,
        );
        self.stat_ret_node.insert(name.to_string(), n);
        n
    }

    /// The flattened size behind a pointer operand, for struct-aware
    /// copies; 1 when the pointee is not a struct.
    fn max_offset(&mut self, op: Option<&Operand>) -> u32 {
        let t = match op {
            Some(Operand::Var(v)) => v.typ().base_typ(),
            Some(Operand::Global(v)) => Some(v.typ()),
            _ => None,
        };
        match t.map(|t| strip_arrays(&t).0) {
            Some(t) => match t.0.get() {
                LirType::Struct(id) => self
                    .struct_info
                    .get(id)
                    .map(|(sz, _)| sz[0])
                    .unwrap_or(1),
                _ => 1,
            },
            None => 1,
        }
    }

    /// Field-by-field copy through two pointers: one artificial node per
    /// field, loaded from the source and stored to the destination.
    fn add_store2_cons(&mut self, dst: u32, src: u32, sz: u32) {
        for i in 0..sz.max(1) {
            let tmp = self.add_node(None, 0, false);
            self.add_cons(ConsType::Load, tmp, src, i);
            self.add_cons(ConsType::Store, dst, tmp, i);
        }
    }
}

// SECTION: free helpers

/// Strip outer array layers; the flag reports whether any were present.
pub(crate) fn strip_arrays(typ: &Type) -> (Type, bool) {
    let mut t = typ.clone();
    let mut stripped = false;
    loop {
        let next = match t.0.get() {
            LirType::Array { elem, .. } => elem.clone(),
            _ => break,
        };
        t = next;
        stripped = true;
    }
    (t, stripped)
}

fn inst_lhs(inst: &Instruction) -> Option<&VarId> {
    use Instruction::*;
    match inst {
        AddrOf { lhs, .. }
        | Alloc { lhs, .. }
        | Arith { lhs, .. }
        | Cmp { lhs, .. }
        | Copy { lhs, .. }
        | Gep { lhs, .. }
        | Load { lhs, .. }
        | Phi { lhs, .. }
        | Select { lhs, .. }
        | PtrToInt { lhs, .. }
        | IntToPtr { lhs, .. }
        | ExtractValue { lhs, .. }
        | InsertValue { lhs, .. }
        | VaArg { lhs } => Some(lhs),
        Store { .. } => None,
        CallExt { lhs, .. } => lhs.as_ref(),
    }
}

fn idx_consts(idx: &[u32]) -> Vec<GepIdx> {
    idx.iter().map(|&c| GepIdx::Const(c)).collect()
}
