//! The typed low-level IR that the analysis consumes.
//!
//! A program is a set of struct definitions, global variables (with
//! optional initializers), external function declarations, and functions
//! made of basic blocks.  Types are hash-consed so they can be compared
//! and cloned cheaply.

pub mod fromstr_impl;
pub mod validate;

use std::cmp::Ordering;
use std::collections::{BTreeMap as Map, BTreeSet as Set};
use std::fmt;
use std::fmt::Display;

use hashconsing::{consign, HConsed, HashConsign};

// SECTION: types

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub enum LirType {
    Int,
    Struct(StructId),
    Array { elem: Type, len: u32 },
    Pointer(Type),
    Function {
        ret_ty: Option<Type>,
        param_ty: Vec<Type>,
        va: bool,
    },
}

/// An interned type.  Equality and hashing are by interning id.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct Type(pub HConsed<LirType>);

consign! {
    /// The type factory.  Process-wide, like the rest of the interners.
    let TYPES = consign(37) for LirType;
}

pub fn int_ty() -> Type {
    Type(TYPES.mk(LirType::Int))
}

pub fn struct_ty(id: StructId) -> Type {
    Type(TYPES.mk(LirType::Struct(id)))
}

pub fn array_ty(elem: Type, len: u32) -> Type {
    Type(TYPES.mk(LirType::Array { elem, len }))
}

pub fn ptr_ty(t: Type) -> Type {
    Type(TYPES.mk(LirType::Pointer(t)))
}

pub fn func_ty(ret_ty: Option<Type>, param_ty: Vec<Type>, va: bool) -> Type {
    Type(TYPES.mk(LirType::Function { ret_ty, param_ty, va }))
}

impl Type {
    pub fn is_int(&self) -> bool {
        matches!(self.0.get(), LirType::Int)
    }

    pub fn is_ptr(&self) -> bool {
        matches!(self.0.get(), LirType::Pointer(_))
    }

    pub fn is_struct(&self) -> bool {
        matches!(self.0.get(), LirType::Struct(_))
    }

    pub fn is_array(&self) -> bool {
        matches!(self.0.get(), LirType::Array { .. })
    }

    pub fn is_function(&self) -> bool {
        matches!(self.0.get(), LirType::Function { .. })
    }

    /// The pointee of a pointer type.
    pub fn base_typ(&self) -> Option<Type> {
        match self.0.get() {
            LirType::Pointer(t) => Some(t.clone()),
            _ => None,
        }
    }

    /// Whether a value of this type can hold or contain a pointer.
    pub fn can_hold_ptr(&self) -> bool {
        match self.0.get() {
            LirType::Int => false,
            LirType::Pointer(_) | LirType::Function { .. } => true,
            // structs and arrays get nodes unconditionally; field
            // sensitivity sorts out which fields matter.
            LirType::Struct(_) | LirType::Array { .. } => true,
        }
    }
}

impl Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.0.get() {
            LirType::Int => write!(f, "int"),
            LirType::Struct(id) => write!(f, "{id}"),
            LirType::Array { elem, len } => write!(f, "[{len} x {elem}]"),
            LirType::Pointer(t) => write!(f, "&{t}"),
            LirType::Function { ret_ty, param_ty, va } => {
                write!(f, "(")?;
                let params = param_ty
                    .iter()
                    .map(|t| t.to_string())
                    .collect::<Vec<String>>()
                    .join(", ");
                write!(f, "{params}")?;
                if *va {
                    if param_ty.is_empty() {
                        write!(f, "...")?;
                    } else {
                        write!(f, ", ...")?;
                    }
                }
                write!(f, ") -> ")?;
                match ret_ty {
                    Some(t) => write!(f, "{t}"),
                    None => write!(f, "_"),
                }
            }
        }
    }
}

// SECTION: identifiers

#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct FuncId(pub String);

#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct StructId(pub String);

#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct BbId(pub String);

pub fn func_id(name: &str) -> FuncId {
    FuncId(name.to_string())
}

pub fn struct_id(name: &str) -> StructId {
    StructId(name.to_string())
}

pub fn bb_id(name: &str) -> BbId {
    BbId(name.to_string())
}

impl Display for FuncId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Display for StructId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Display for BbId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The interned payload of a variable: name, type, and enclosing function
/// (None for globals).
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct VarInfo {
    pub name: String,
    pub typ: Type,
    pub scope: Option<FuncId>,
}

consign! {
    let VARS = consign(127) for VarInfo;
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct VarId(pub HConsed<VarInfo>);

pub fn var_id(name: &str, typ: Type, scope: Option<FuncId>) -> VarId {
    VarId(VARS.mk(VarInfo {
        name: name.to_string(),
        typ,
        scope,
    }))
}

impl VarId {
    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn typ(&self) -> Type {
        self.0.typ.clone()
    }

    pub fn scope(&self) -> Option<&FuncId> {
        self.0.scope.as_ref()
    }

    /// The fully scoped name, e.g. `main.p`.
    pub fn with_funcid(&self) -> String {
        if let Some(funcid) = &self.0.scope {
            format!("{}.{}", funcid, self)
        } else {
            self.to_string()
        }
    }
}

impl Display for VarId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0.name)
    }
}

// Order by scope then name so printed output is stable across runs.
impl PartialOrd for VarId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for VarId {
    fn cmp(&self, other: &Self) -> Ordering {
        (&self.0.scope, &self.0.name).cmp(&(&other.0.scope, &other.0.name))
    }
}

// SECTION: program structure

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldId {
    pub name: String,
    pub typ: Type,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Global {
    pub name: VarId,
    pub init: Option<Const>,
}

/// A constant initializer expression.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Const {
    Int(i64),
    Null,
    GlobalRef(VarId),
    FuncRef(FuncId),
    Struct(Vec<Const>),
    Array(Vec<Const>),
    /// A constant GEP expression off a global.
    Gep { base: VarId, idx: Vec<u32> },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Operand {
    /// A local variable or parameter.
    Var(VarId),
    /// The address of a global variable.
    Global(VarId),
    /// The address of a function.
    Func(FuncId),
    CInt(i64),
    Null,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GepIdx {
    Const(u32),
    Var(VarId),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Instruction {
    /// `lhs = &op`: the address of named storage (the alloca analog).
    AddrOf { lhs: VarId, op: VarId },
    /// Heap allocation.  `ty` is the allocated type when it can be traced;
    /// `None` falls back to the most conservative layout.
    Alloc { lhs: VarId, ty: Option<Type> },
    Arith { lhs: VarId, aop: ArithOp, op1: Operand, op2: Operand },
    Cmp { lhs: VarId, rop: CmpOp, op1: Operand, op2: Operand },
    /// Also covers bitcasts: a copy that may change the static type.
    Copy { lhs: VarId, op: Operand },
    Gep { lhs: VarId, src: Operand, idx: Vec<GepIdx> },
    Load { lhs: VarId, src: Operand },
    Store { dst: Operand, op: Operand },
    Phi { lhs: VarId, ops: Vec<Operand> },
    Select { lhs: VarId, cond: Operand, tt: Operand, ff: Operand },
    PtrToInt { lhs: VarId, op: Operand },
    IntToPtr { lhs: VarId, op: Operand },
    ExtractValue { lhs: VarId, src: VarId, idx: u32 },
    InsertValue { lhs: VarId, src: VarId, op: Operand, idx: u32 },
    VaArg { lhs: VarId },
    /// A call to a declared external function.
    CallExt {
        lhs: Option<VarId>,
        ext_callee: FuncId,
        args: Vec<Operand>,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Terminal {
    Branch { cond: Operand, tt: BbId, ff: BbId },
    Jump(BbId),
    CallDirect {
        lhs: Option<VarId>,
        callee: FuncId,
        args: Vec<Operand>,
        next_bb: BbId,
    },
    CallIndirect {
        lhs: Option<VarId>,
        callee: VarId,
        args: Vec<Operand>,
        next_bb: BbId,
    },
    Ret(Option<Operand>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BasicBlock {
    pub id: BbId,
    pub insts: Vec<Instruction>,
    pub term: Terminal,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Function {
    pub id: FuncId,
    pub params: Vec<VarId>,
    pub ret_ty: Option<Type>,
    pub va: bool,
    pub locals: Set<VarId>,
    pub body: Map<BbId, BasicBlock>,
}

impl Function {
    /// The type of this function.
    pub fn typ(&self) -> Type {
        func_ty(
            self.ret_ty.clone(),
            self.params.iter().map(|p| p.typ()).collect(),
            self.va,
        )
    }

    /// All operands returned by this function's `$ret` terminals.
    pub fn ret_ops(&self) -> Vec<&Operand> {
        self.body
            .values()
            .filter_map(|bb| match &bb.term {
                Terminal::Ret(Some(op)) => Some(op),
                _ => None,
            })
            .collect()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Program {
    pub structs: Map<StructId, Vec<FieldId>>,
    pub globals: Vec<Global>,
    pub externs: Map<FuncId, Type>,
    pub functions: Map<FuncId, Function>,
}

impl Program {
    pub fn global(&self, name: &VarId) -> Option<&Global> {
        self.globals.iter().find(|g| &g.name == name)
    }
}

// SECTION: printing

impl Display for Const {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Const::Int(n) => write!(f, "{n}"),
            Const::Null => write!(f, "null"),
            Const::GlobalRef(v) => write!(f, "@{v}"),
            Const::FuncRef(id) => write!(f, "@{id}"),
            Const::Struct(elems) => {
                let inner = elems
                    .iter()
                    .map(|c| c.to_string())
                    .collect::<Vec<String>>()
                    .join(", ");
                write!(f, "{{ {inner} }}")
            }
            Const::Array(elems) => {
                let inner = elems
                    .iter()
                    .map(|c| c.to_string())
                    .collect::<Vec<String>>()
                    .join(", ");
                write!(f, "[ {inner} ]")
            }
            Const::Gep { base, idx } => {
                write!(f, "@{base} gep")?;
                for i in idx {
                    write!(f, " {i}")?;
                }
                Ok(())
            }
        }
    }
}

impl Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Operand::Var(v) => write!(f, "{v}"),
            Operand::Global(v) => write!(f, "@{v}"),
            Operand::Func(id) => write!(f, "@{id}"),
            Operand::CInt(n) => write!(f, "{n}"),
            Operand::Null => write!(f, "null"),
        }
    }
}

impl Display for ArithOp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            ArithOp::Add => "add",
            ArithOp::Sub => "sub",
            ArithOp::Mul => "mul",
            ArithOp::Div => "div",
        };
        write!(f, "{s}")
    }
}

impl Display for CmpOp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            CmpOp::Eq => "eq",
            CmpOp::Neq => "neq",
            CmpOp::Lt => "lt",
            CmpOp::Lte => "lte",
            CmpOp::Gt => "gt",
            CmpOp::Gte => "gte",
        };
        write!(f, "{s}")
    }
}

impl Display for GepIdx {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            GepIdx::Const(n) => write!(f, "{n}"),
            GepIdx::Var(v) => write!(f, "{v}"),
        }
    }
}

fn write_args(f: &mut fmt::Formatter, args: &[Operand]) -> fmt::Result {
    for a in args {
        write!(f, " {a}")?;
    }
    Ok(())
}

impl Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use Instruction::*;
        match self {
            AddrOf { lhs, op } => write!(f, "{lhs} = $addrof {op}"),
            Alloc { lhs, ty: Some(t) } => write!(f, "{lhs} = $alloc {t}"),
            Alloc { lhs, ty: None } => write!(f, "{lhs} = $alloc"),
            Arith { lhs, aop, op1, op2 } => write!(f, "{lhs} = $arith {aop} {op1} {op2}"),
            Cmp { lhs, rop, op1, op2 } => write!(f, "{lhs} = $cmp {rop} {op1} {op2}"),
            Copy { lhs, op } => write!(f, "{lhs} = $copy {op}"),
            Gep { lhs, src, idx } => {
                write!(f, "{lhs} = $gep {src}")?;
                for i in idx {
                    write!(f, " {i}")?;
                }
                Ok(())
            }
            Load { lhs, src } => write!(f, "{lhs} = $load {src}"),
            Store { dst, op } => write!(f, "$store {dst} {op}"),
            Phi { lhs, ops } => {
                write!(f, "{lhs} = $phi")?;
                write_args(f, ops)
            }
            Select { lhs, cond, tt, ff } => write!(f, "{lhs} = $select {cond} {tt} {ff}"),
            PtrToInt { lhs, op } => write!(f, "{lhs} = $ptr2int {op}"),
            IntToPtr { lhs, op } => write!(f, "{lhs} = $int2ptr {op}"),
            ExtractValue { lhs, src, idx } => write!(f, "{lhs} = $extract {src} {idx}"),
            InsertValue { lhs, src, op, idx } => write!(f, "{lhs} = $insert {src} {op} {idx}"),
            VaArg { lhs } => write!(f, "{lhs} = $vaarg"),
            CallExt { lhs: Some(lhs), ext_callee, args } => {
                write!(f, "{lhs} = $ext {ext_callee}")?;
                write_args(f, args)
            }
            CallExt { lhs: None, ext_callee, args } => {
                write!(f, "$ext {ext_callee}")?;
                write_args(f, args)
            }
        }
    }
}

impl Display for Terminal {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use Terminal::*;
        match self {
            Branch { cond, tt, ff } => write!(f, "$branch {cond} {tt} {ff}"),
            Jump(bb) => write!(f, "$jump {bb}"),
            CallDirect { lhs, callee, args, next_bb } => {
                if let Some(lhs) = lhs {
                    write!(f, "{lhs} = ")?;
                }
                write!(f, "$call_dir {callee}")?;
                write_args(f, args)?;
                write!(f, " then {next_bb}")
            }
            CallIndirect { lhs, callee, args, next_bb } => {
                if let Some(lhs) = lhs {
                    write!(f, "{lhs} = ")?;
                }
                write!(f, "$call_idr {callee}")?;
                write_args(f, args)?;
                write!(f, " then {next_bb}")
            }
            Ret(Some(op)) => write!(f, "$ret {op}"),
            Ret(None) => write!(f, "$ret"),
        }
    }
}

impl Display for BasicBlock {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "{}:", self.id)?;
        for inst in &self.insts {
            writeln!(f, "  {inst}")?;
        }
        writeln!(f, "  {}", self.term)
    }
}

impl Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "fn {}(", self.id)?;
        let params = self
            .params
            .iter()
            .map(|p| format!("{}: {}", p, p.typ()))
            .collect::<Vec<String>>()
            .join(", ");
        write!(f, "{params}")?;
        if self.va {
            if self.params.is_empty() {
                write!(f, "...")?;
            } else {
                write!(f, ", ...")?;
            }
        }
        write!(f, ") -> ")?;
        match &self.ret_ty {
            Some(t) => writeln!(f, "{t} {{"),
            None => writeln!(f, "_ {{"),
        }?;
        if !self.locals.is_empty() {
            let locals = self
                .locals
                .iter()
                .map(|v| format!("{}: {}", v, v.typ()))
                .collect::<Vec<String>>()
                .join(", ");
            writeln!(f, "let {locals}")?;
        }
        // entry block first, then the rest in name order.
        let entry = bb_id("entry");
        if let Some(bb) = self.body.get(&entry) {
            write!(f, "{bb}")?;
        }
        for (id, bb) in &self.body {
            if *id != entry {
                write!(f, "{bb}")?;
            }
        }
        writeln!(f, "}}")
    }
}

impl Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (id, fields) in &self.structs {
            writeln!(f, "struct {id} {{")?;
            let inner = fields
                .iter()
                .map(|fld| format!("  {}: {}", fld.name, fld.typ))
                .collect::<Vec<String>>()
                .join(",\n");
            writeln!(f, "{inner}")?;
            writeln!(f, "}}")?;
            writeln!(f)?;
        }
        for (id, typ) in &self.externs {
            writeln!(f, "extern {id}: {typ}")?;
        }
        if !self.externs.is_empty() {
            writeln!(f)?;
        }
        for g in &self.globals {
            match &g.init {
                Some(c) => writeln!(f, "let @{}: {} = {c}", g.name, g.name.typ())?,
                None => writeln!(f, "let @{}: {}", g.name, g.name.typ())?,
            }
        }
        if !self.globals.is_empty() {
            writeln!(f)?;
        }
        for func in self.functions.values() {
            writeln!(f, "{func}")?;
        }
        Ok(())
    }
}
