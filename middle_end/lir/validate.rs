//! The input-integrity gate.  A `Program` that passes `validate` has no
//! dangling names, its struct types are not recursive through value, and
//! every call site has the right callee kind.  The analysis only accepts
//! validated programs; anything caught here is a malformed-input error,
//! not an analysis failure.

use super::*;
use crate::commons::{Valid, ValidationError};

impl Program {
    pub fn validate(self) -> Result<Valid<Program>, ValidationError> {
        check_structs(&self)?;
        for g in &self.globals {
            check_type(&self, &g.name.typ())?;
            if let Some(init) = &g.init {
                check_const(&self, init)?;
            }
        }
        for typ in self.externs.values() {
            check_type(&self, typ)?;
        }
        for func in self.functions.values() {
            check_function(&self, func)?;
        }
        Ok(Valid(self))
    }
}

fn err<T>(msg: String) -> Result<T, ValidationError> {
    Err(ValidationError(msg))
}

fn check_type(prog: &Program, typ: &Type) -> Result<(), ValidationError> {
    match typ.0.get() {
        LirType::Int => Ok(()),
        LirType::Struct(id) => {
            if prog.structs.contains_key(id) {
                Ok(())
            } else {
                err(format!("undefined struct type `{id}`"))
            }
        }
        LirType::Array { elem, .. } => check_type(prog, elem),
        LirType::Pointer(t) => check_type(prog, t),
        LirType::Function { ret_ty, param_ty, .. } => {
            if let Some(t) = ret_ty {
                check_type(prog, t)?;
            }
            param_ty.iter().try_for_each(|t| check_type(prog, t))
        }
    }
}

// structs may refer to each other through pointers but not by value.
fn check_structs(prog: &Program) -> Result<(), ValidationError> {
    fn reaches_by_value(
        prog: &Program,
        typ: &Type,
        target: &StructId,
        visiting: &mut Set<StructId>,
    ) -> Result<bool, ValidationError> {
        match typ.0.get() {
            LirType::Struct(id) => {
                if id == target {
                    return Ok(true);
                }
                if !visiting.insert(id.clone()) {
                    return Ok(false);
                }
                let fields = prog
                    .structs
                    .get(id)
                    .ok_or_else(|| ValidationError(format!("undefined struct type `{id}`")))?;
                for fld in fields {
                    if reaches_by_value(prog, &fld.typ, target, visiting)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            LirType::Array { elem, .. } => reaches_by_value(prog, elem, target, visiting),
            _ => Ok(false),
        }
    }

    for (id, fields) in &prog.structs {
        for fld in fields {
            check_type(prog, &fld.typ)?;
            let mut visiting = Set::new();
            if reaches_by_value(prog, &fld.typ, id, &mut visiting)? {
                return err(format!("struct `{id}` is recursive through value"));
            }
        }
    }
    Ok(())
}

fn check_const(prog: &Program, c: &Const) -> Result<(), ValidationError> {
    match c {
        Const::Int(_) | Const::Null => Ok(()),
        Const::GlobalRef(v) => {
            if prog.global(v).is_some() {
                Ok(())
            } else {
                err(format!("initializer refers to undefined global `@{v}`"))
            }
        }
        Const::FuncRef(f) => {
            if prog.functions.contains_key(f) || prog.externs.contains_key(f) {
                Ok(())
            } else {
                err(format!("initializer refers to undefined function `@{f}`"))
            }
        }
        Const::Struct(elems) | Const::Array(elems) => {
            elems.iter().try_for_each(|e| check_const(prog, e))
        }
        Const::Gep { base, .. } => {
            if prog.global(base).is_some() {
                Ok(())
            } else {
                err(format!("constant gep off undefined global `@{base}`"))
            }
        }
    }
}

fn check_operand(prog: &Program, op: &Operand) -> Result<(), ValidationError> {
    match op {
        Operand::Var(_) | Operand::CInt(_) | Operand::Null => Ok(()),
        Operand::Global(v) => {
            if prog.global(v).is_some() {
                Ok(())
            } else {
                err(format!("operand refers to undefined global `@{v}`"))
            }
        }
        Operand::Func(f) => {
            if prog.functions.contains_key(f) || prog.externs.contains_key(f) {
                Ok(())
            } else {
                err(format!("operand refers to undefined function `@{f}`"))
            }
        }
    }
}

fn check_function(prog: &Program, func: &Function) -> Result<(), ValidationError> {
    use Instruction::*;

    for v in func.params.iter().chain(func.locals.iter()) {
        check_type(prog, &v.typ())?;
    }
    if !func.body.contains_key(&bb_id("entry")) {
        return err(format!("function `{}` has no entry block", func.id));
    }

    let check_bb = |bb: &BbId| {
        if func.body.contains_key(bb) {
            Ok(())
        } else {
            err(format!("jump to undefined block `{bb}` in `{}`", func.id))
        }
    };

    for bb in func.body.values() {
        for inst in &bb.insts {
            match inst {
                Gep { src, idx, .. } => {
                    check_operand(prog, src)?;
                    // only index kinds are checked here; the engine's gep
                    // walk range-checks constant indices when it resolves
                    // the flat offset.
                    for i in idx {
                        if let GepIdx::Var(v) = i {
                            if !v.typ().is_int() {
                                return err(format!(
                                    "non-integer gep index `{v}` in `{}`",
                                    func.id
                                ));
                            }
                        }
                    }
                }
                Load { src, .. } => check_operand(prog, src)?,
                Store { dst, op } => {
                    check_operand(prog, dst)?;
                    check_operand(prog, op)?;
                }
                Copy { op, .. }
                | PtrToInt { op, .. }
                | IntToPtr { op, .. }
                | InsertValue { op, .. } => check_operand(prog, op)?,
                Phi { ops, .. } => ops.iter().try_for_each(|o| check_operand(prog, o))?,
                Select { cond, tt, ff, .. } => {
                    check_operand(prog, cond)?;
                    check_operand(prog, tt)?;
                    check_operand(prog, ff)?;
                }
                Arith { op1, op2, .. } | Cmp { op1, op2, .. } => {
                    check_operand(prog, op1)?;
                    check_operand(prog, op2)?;
                }
                VaArg { .. } => {
                    if !func.va {
                        return err(format!(
                            "$vaarg in non-variadic function `{}`",
                            func.id
                        ));
                    }
                }
                CallExt { ext_callee, args, .. } => {
                    if !prog.externs.contains_key(ext_callee) {
                        return err(format!(
                            "$ext call to undeclared external `{ext_callee}` in `{}`",
                            func.id
                        ));
                    }
                    args.iter().try_for_each(|o| check_operand(prog, o))?;
                }
                AddrOf { .. } | Alloc { .. } | ExtractValue { .. } => {}
            }
        }
        match &bb.term {
            Terminal::Branch { cond, tt, ff } => {
                check_operand(prog, cond)?;
                check_bb(tt)?;
                check_bb(ff)?;
            }
            Terminal::Jump(next) => check_bb(next)?,
            Terminal::CallDirect { callee, args, next_bb, .. } => {
                if !prog.functions.contains_key(callee) && !prog.externs.contains_key(callee) {
                    return err(format!(
                        "direct call to undefined function `{callee}` in `{}`",
                        func.id
                    ));
                }
                args.iter().try_for_each(|o| check_operand(prog, o))?;
                check_bb(next_bb)?;
            }
            Terminal::CallIndirect { args, next_bb, .. } => {
                args.iter().try_for_each(|o| check_operand(prog, o))?;
                check_bb(next_bb)?;
            }
            Terminal::Ret(Some(op)) => check_operand(prog, op)?,
            Terminal::Ret(None) => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_value_recursive_struct() {
        let src = r#"
struct node {
  next: node
}

fn main() -> int {
entry:
  $ret 0
}
"#;
        let prog = src.parse::<Program>().unwrap();
        assert!(prog.validate().is_err());
    }

    #[test]
    fn accepts_pointer_recursion() {
        let src = r#"
struct node {
  next: &node
}

fn main() -> int {
entry:
  $ret 0
}
"#;
        let prog = src.parse::<Program>().unwrap();
        assert!(prog.validate().is_ok());
    }
}
