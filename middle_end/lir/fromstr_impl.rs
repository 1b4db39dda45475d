// ll(1) parser for the textual lir format.
//
// Parsing happens in two passes over one token stream: the first pass
// harvests all module-level declarations (struct defs, externs, global
// types, function signatures) so that `@name` operands and initializers
// can be resolved without forward-reference problems; the second pass
// parses global initializers and function bodies.

use derive_more::Display;
use logos::Logos;

use super::*;
use TokenKind::*;

// SECTION: interface

pub fn parse(code: &str) -> Result<Program, ParseError> {
    let tokens = lex(code);
    let mut harvest = Parser::new(code, &tokens)?;
    let decls = harvest_decls(&mut harvest)?;
    let mut parser = Parser::new(code, &tokens)?;
    parser.decls = decls;
    program_r(&mut parser)
}

impl std::str::FromStr for Program {
    type Err = ParseError;

    fn from_str(code: &str) -> Result<Self, ParseError> {
        parse(code)
    }
}

// A parse error with explanatory message.
#[derive(Clone, Debug, Display, Eq, PartialEq)]
pub struct ParseError(pub String);
impl std::error::Error for ParseError {}

// SECTION: lexer

#[derive(Logos, Clone, Copy, Debug, PartialEq, Eq)]
#[logos(skip r"[ \t\r\n\f]+")]
#[logos(skip r"//[^\n]*")]
pub enum TokenKind {
    #[token("struct")]
    StructKw,
    #[token("extern")]
    ExternKw,
    #[token("let")]
    LetKw,
    #[token("fn")]
    FnKw,
    #[token("int")]
    IntKw,
    #[token("null")]
    NullKw,
    #[token("then")]
    ThenKw,
    #[token("gep")]
    GepKw,

    #[token("$addrof")]
    DAddrOf,
    #[token("$alloc")]
    DAlloc,
    #[token("$arith")]
    DArith,
    #[token("$cmp")]
    DCmp,
    #[token("$copy")]
    DCopy,
    #[token("$gep")]
    DGep,
    #[token("$load")]
    DLoad,
    #[token("$store")]
    DStore,
    #[token("$phi")]
    DPhi,
    #[token("$select")]
    DSelect,
    #[token("$ptr2int")]
    DPtr2Int,
    #[token("$int2ptr")]
    DInt2Ptr,
    #[token("$extract")]
    DExtract,
    #[token("$insert")]
    DInsert,
    #[token("$vaarg")]
    DVaArg,
    #[token("$ext")]
    DExt,
    #[token("$branch")]
    DBranch,
    #[token("$jump")]
    DJump,
    #[token("$call_dir")]
    DCallDir,
    #[token("$call_idr")]
    DCallIdr,
    #[token("$ret")]
    DRet,

    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    #[token(":")]
    Colon,
    #[token(",")]
    Comma,
    #[token("=")]
    Assign,
    #[token("&")]
    Amp,
    #[token("@")]
    At,
    #[token("->")]
    Arrow,
    #[token("...")]
    Ellipsis,

    #[regex(r"-?[0-9]+")]
    Num,
    #[regex(r"[a-zA-Z_][a-zA-Z0-9_]*")]
    Ident,

    // stands in for lex failures; never matched directly.
    #[token("\u{0}")]
    Error,
}

impl std::fmt::Display for TokenKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

#[derive(Clone, Debug)]
pub struct Token {
    pub kind: TokenKind,
    pub span: std::ops::Range<usize>,
}

fn lex(code: &str) -> Vec<Token> {
    TokenKind::lexer(code)
        .spanned()
        .map(|(kind, span)| Token {
            kind: kind.unwrap_or(TokenKind::Error),
            span,
        })
        .collect()
}

// SECTION: harvested module-level declarations

#[derive(Clone, Debug, Default)]
struct Decls {
    structs: Map<StructId, Vec<FieldId>>,
    externs: Map<FuncId, Type>,
    // global name -> its VarId, plus declaration order.
    globals: Map<String, VarId>,
    global_order: Vec<VarId>,
    // defined function name -> (params, ret_ty, va).
    funcs: Map<String, (Vec<VarId>, Option<Type>, bool)>,
}

// SECTION: parser functionality

#[derive(Clone, Debug)]
struct Parser<'a> {
    code: &'a str,       // the source code being parsed
    tokens: &'a [Token], // the token stream
    pos: usize,          // the position in the token stream
    decls: Decls,
    // name -> VarId for the params and locals of the current function.
    scope: Map<String, VarId>,
    cur_fn: Option<FuncId>,
}

// utility functions for traversing the token stream and creating error
// messages.
impl<'a> Parser<'a> {
    fn new(code: &'a str, tokens: &'a [Token]) -> Result<Self, ParseError> {
        if tokens.is_empty() {
            Err(ParseError("empty token stream".to_string()))
        } else {
            Ok(Parser {
                code,
                tokens,
                pos: 0,
                decls: Decls::default(),
                scope: Map::new(),
                cur_fn: None,
            })
        }
    }

    // if the next token has the given kind advances the iterator and returns
    // true, otherwise returns false.
    fn eat(&mut self, kind: TokenKind) -> bool {
        match self.peek() {
            Some(k) if k == kind => {
                self.next();
                true
            }
            _ => false,
        }
    }

    // returns an Ok or Err result depending on whether the next token has the
    // given kind, advancing the iterator on an Ok result.
    fn expect(&mut self, kind: TokenKind) -> Result<(), ParseError> {
        if self.eat(kind) {
            Ok(())
        } else {
            self.error_next(&format!("expected `{kind}`"))
        }
    }

    fn next(&mut self) -> Option<TokenKind> {
        if !self.end() {
            self.pos += 1;
            Some(self.tokens[self.pos - 1].kind)
        } else {
            None
        }
    }

    fn peek(&self) -> Option<TokenKind> {
        self.peek_at(0)
    }

    fn peek_at(&self, n: usize) -> Option<TokenKind> {
        self.tokens.get(self.pos + n).map(|t| t.kind)
    }

    fn next_is(&self, kind: TokenKind) -> bool {
        self.peek() == Some(kind)
    }

    fn end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    // returns the lexeme of the token immediately prior to the current token.
    fn slice_prev(&self) -> &str {
        &self.code[self.tokens[self.pos - 1].span.clone()]
    }

    // returns a parse error knowing that the next token to be inspected
    // causes an error.
    fn error_next<T>(&self, msg: &str) -> Result<T, ParseError> {
        if self.pos >= self.tokens.len() {
            Err(ParseError(format!(
                "parse error: unexpected end of input ({msg})"
            )))
        } else {
            let tok = &self.tokens[self.pos];
            Err(ParseError(format!(
                "parse error: unexpected token `{}` at byte {} ({msg})",
                &self.code[tok.span.clone()],
                tok.span.start
            )))
        }
    }

    fn ident(&mut self) -> Result<String, ParseError> {
        self.expect(Ident)?;
        Ok(self.slice_prev().to_string())
    }

    fn num(&mut self) -> Result<i64, ParseError> {
        self.expect(Num)?;
        self.slice_prev()
            .parse::<i64>()
            .map_err(|e| ParseError(format!("parse error: bad integer ({e})")))
    }

    fn num_u32(&mut self) -> Result<u32, ParseError> {
        let n = self.num()?;
        u32::try_from(n).map_err(|_| ParseError("parse error: negative index".to_string()))
    }

    fn lookup_var(&self, name: &str) -> Result<VarId, ParseError> {
        self.scope.get(name).cloned().ok_or_else(|| {
            ParseError(format!(
                "parse error: undeclared variable `{name}` in `{}`",
                self.cur_fn.as_ref().map(|f| f.0.as_str()).unwrap_or("?")
            ))
        })
    }

    // resolve `@name` to a global, a defined function, or an extern.
    fn lookup_at(&self, name: &str) -> Result<Operand, ParseError> {
        if let Some(v) = self.decls.globals.get(name) {
            Ok(Operand::Global(v.clone()))
        } else if self.decls.funcs.contains_key(name) || self.decls.externs.contains_key(&func_id(name)) {
            Ok(Operand::Func(func_id(name)))
        } else {
            Err(ParseError(format!(
                "parse error: unknown module-level name `@{name}`"
            )))
        }
    }
}

// SECTION: types

fn type_r(p: &mut Parser) -> Result<Type, ParseError> {
    match p.peek() {
        Some(IntKw) => {
            p.next();
            Ok(int_ty())
        }
        Some(Amp) => {
            p.next();
            Ok(ptr_ty(type_r(p)?))
        }
        Some(Ident) => {
            let name = p.ident()?;
            Ok(struct_ty(struct_id(&name)))
        }
        Some(LBracket) => {
            p.next();
            let len = p.num_u32()?;
            let sep = p.ident()?;
            if sep != "x" {
                return p.error_next("expected `x` in array type");
            }
            let elem = type_r(p)?;
            p.expect(RBracket)?;
            Ok(array_ty(elem, len))
        }
        Some(LParen) => {
            p.next();
            let mut param_ty = vec![];
            let mut va = false;
            if !p.next_is(RParen) {
                loop {
                    if p.eat(Ellipsis) {
                        va = true;
                        break;
                    }
                    param_ty.push(type_r(p)?);
                    if !p.eat(Comma) {
                        break;
                    }
                }
            }
            p.expect(RParen)?;
            p.expect(Arrow)?;
            let ret_ty = ret_type_r(p)?;
            Ok(func_ty(ret_ty, param_ty, va))
        }
        _ => p.error_next("expected a type"),
    }
}

// a return type is a type or `_`.
fn ret_type_r(p: &mut Parser) -> Result<Option<Type>, ParseError> {
    if p.peek() == Some(Ident) && p.tokens[p.pos].span.len() == 1 {
        let start = p.tokens[p.pos].span.start;
        if &p.code[start..start + 1] == "_" {
            p.next();
            return Ok(None);
        }
    }
    Ok(Some(type_r(p)?))
}

// does the next token begin a type?  Used to disambiguate `$alloc T` from a
// bare `$alloc` followed by another instruction.
fn next_starts_type(p: &Parser) -> bool {
    match p.peek() {
        Some(IntKw) | Some(Amp) | Some(LBracket) | Some(LParen) => true,
        Some(Ident) => !matches!(p.peek_at(1), Some(Assign) | Some(Colon)),
        _ => false,
    }
}

// SECTION: pass 1, harvesting declarations

fn harvest_decls(p: &mut Parser) -> Result<Decls, ParseError> {
    let mut decls = Decls::default();
    while !p.end() {
        match p.peek() {
            Some(StructKw) => {
                p.next();
                let id = struct_id(&p.ident()?);
                p.expect(LBrace)?;
                let mut fields = vec![];
                while !p.eat(RBrace) {
                    let name = p.ident()?;
                    p.expect(Colon)?;
                    let typ = type_r(p)?;
                    fields.push(FieldId { name, typ });
                    if !p.eat(Comma) {
                        p.expect(RBrace)?;
                        break;
                    }
                }
                if decls.structs.insert(id.clone(), fields).is_some() {
                    return Err(ParseError(format!("parse error: duplicate struct `{id}`")));
                }
            }
            Some(ExternKw) => {
                p.next();
                let id = func_id(&p.ident()?);
                p.expect(Colon)?;
                let typ = type_r(p)?;
                decls.externs.insert(id, typ);
            }
            Some(LetKw) => {
                p.next();
                p.expect(At)?;
                let name = p.ident()?;
                p.expect(Colon)?;
                let typ = type_r(p)?;
                let v = var_id(&name, typ, None);
                if decls.globals.insert(name.clone(), v.clone()).is_some() {
                    return Err(ParseError(format!("parse error: duplicate global `@{name}`")));
                }
                decls.global_order.push(v);
                if p.eat(Assign) {
                    skip_const(p)?;
                }
            }
            Some(FnKw) => {
                p.next();
                let name = p.ident()?;
                let fid = func_id(&name);
                p.expect(LParen)?;
                let mut params = vec![];
                let mut va = false;
                if !p.next_is(RParen) {
                    loop {
                        if p.eat(Ellipsis) {
                            va = true;
                            break;
                        }
                        let pname = p.ident()?;
                        p.expect(Colon)?;
                        let ptyp = type_r(p)?;
                        params.push(var_id(&pname, ptyp, Some(fid.clone())));
                        if !p.eat(Comma) {
                            break;
                        }
                    }
                }
                p.expect(RParen)?;
                p.expect(Arrow)?;
                let ret_ty = ret_type_r(p)?;
                if decls
                    .funcs
                    .insert(name.clone(), (params, ret_ty, va))
                    .is_some()
                {
                    return Err(ParseError(format!("parse error: duplicate function `{name}`")));
                }
                skip_braces(p)?;
            }
            _ => return p.error_next("expected a module-level item"),
        }
    }
    Ok(decls)
}

fn skip_const(p: &mut Parser) -> Result<(), ParseError> {
    match p.peek() {
        Some(Num) | Some(NullKw) => {
            p.next();
            Ok(())
        }
        Some(At) => {
            p.next();
            p.expect(Ident)?;
            if p.eat(GepKw) {
                while p.next_is(Num) {
                    p.next();
                }
            }
            Ok(())
        }
        Some(LBrace) | Some(LBracket) => {
            let open = p.next().unwrap();
            let close = if open == LBrace { RBrace } else { RBracket };
            let mut depth = 1;
            while depth > 0 {
                match p.next() {
                    Some(k) if k == open => depth += 1,
                    Some(k) if k == close => depth -= 1,
                    Some(_) => {}
                    None => return p.error_next("unterminated initializer"),
                }
            }
            Ok(())
        }
        _ => p.error_next("expected an initializer"),
    }
}

fn skip_braces(p: &mut Parser) -> Result<(), ParseError> {
    p.expect(LBrace)?;
    let mut depth = 1;
    while depth > 0 {
        match p.next() {
            Some(LBrace) => depth += 1,
            Some(RBrace) => depth -= 1,
            Some(_) => {}
            None => return p.error_next("unterminated function body"),
        }
    }
    Ok(())
}

// SECTION: pass 2, the program proper

fn program_r(p: &mut Parser) -> Result<Program, ParseError> {
    let mut globals: Vec<Global> = p
        .decls
        .global_order
        .iter()
        .map(|v| Global {
            name: v.clone(),
            init: None,
        })
        .collect();
    let mut functions = Map::new();

    while !p.end() {
        match p.peek() {
            Some(StructKw) => {
                // already harvested
                p.next();
                p.expect(Ident)?;
                skip_braces(p)?;
            }
            Some(ExternKw) => {
                p.next();
                p.expect(Ident)?;
                p.expect(Colon)?;
                type_r(p)?;
            }
            Some(LetKw) => {
                p.next();
                p.expect(At)?;
                let name = p.ident()?;
                p.expect(Colon)?;
                type_r(p)?;
                if p.eat(Assign) {
                    let init = const_r(p)?;
                    let g = globals
                        .iter_mut()
                        .find(|g| g.name.name() == name)
                        .expect("harvested global");
                    g.init = Some(init);
                }
            }
            Some(FnKw) => {
                let func = function_r(p)?;
                functions.insert(func.id.clone(), func);
            }
            _ => return p.error_next("expected a module-level item"),
        }
    }

    Ok(Program {
        structs: p.decls.structs.clone(),
        globals,
        externs: p.decls.externs.clone(),
        functions,
    })
}

fn const_r(p: &mut Parser) -> Result<Const, ParseError> {
    match p.peek() {
        Some(Num) => Ok(Const::Int(p.num()?)),
        Some(NullKw) => {
            p.next();
            Ok(Const::Null)
        }
        Some(At) => {
            p.next();
            let name = p.ident()?;
            if p.eat(GepKw) {
                let base = match p.lookup_at(&name)? {
                    Operand::Global(v) => v,
                    _ => return Err(ParseError(format!(
                        "parse error: constant gep base `@{name}` is not a global"
                    ))),
                };
                let mut idx = vec![];
                while p.next_is(Num) {
                    idx.push(p.num_u32()?);
                }
                Ok(Const::Gep { base, idx })
            } else {
                match p.lookup_at(&name)? {
                    Operand::Global(v) => Ok(Const::GlobalRef(v)),
                    Operand::Func(f) => Ok(Const::FuncRef(f)),
                    _ => unreachable!(),
                }
            }
        }
        Some(LBrace) => {
            p.next();
            let mut elems = vec![];
            while !p.eat(RBrace) {
                elems.push(const_r(p)?);
                if !p.eat(Comma) {
                    p.expect(RBrace)?;
                    break;
                }
            }
            Ok(Const::Struct(elems))
        }
        Some(LBracket) => {
            p.next();
            let mut elems = vec![];
            while !p.eat(RBracket) {
                elems.push(const_r(p)?);
                if !p.eat(Comma) {
                    p.expect(RBracket)?;
                    break;
                }
            }
            Ok(Const::Array(elems))
        }
        _ => p.error_next("expected an initializer"),
    }
}

fn function_r(p: &mut Parser) -> Result<Function, ParseError> {
    p.expect(FnKw)?;
    let name = p.ident()?;
    let fid = func_id(&name);
    let (params, ret_ty, va) = p.decls.funcs[&name].clone();

    // skip over the already-harvested signature.
    p.expect(LParen)?;
    let mut depth = 1;
    while depth > 0 {
        match p.next() {
            Some(LParen) => depth += 1,
            Some(RParen) => depth -= 1,
            Some(_) => {}
            None => return p.error_next("unterminated parameter list"),
        }
    }
    p.expect(Arrow)?;
    ret_type_r(p)?;
    p.expect(LBrace)?;

    p.cur_fn = Some(fid.clone());
    p.scope = params.iter().map(|v| (v.name().to_string(), v.clone())).collect();

    let mut locals = Set::new();
    if p.eat(LetKw) {
        loop {
            let lname = p.ident()?;
            p.expect(Colon)?;
            let ltyp = type_r(p)?;
            let v = var_id(&lname, ltyp, Some(fid.clone()));
            if p.scope.insert(lname.clone(), v.clone()).is_some() {
                return Err(ParseError(format!(
                    "parse error: duplicate declaration of `{lname}` in `{name}`"
                )));
            }
            locals.insert(v);
            if !p.eat(Comma) {
                break;
            }
        }
    }

    let mut body = Map::new();
    while !p.eat(RBrace) {
        let bb = basic_block_r(p)?;
        if body.insert(bb.id.clone(), bb.clone()).is_some() {
            return Err(ParseError(format!(
                "parse error: duplicate basic block `{}` in `{name}`",
                bb.id
            )));
        }
    }

    p.cur_fn = None;
    p.scope = Map::new();

    Ok(Function {
        id: fid,
        params,
        ret_ty,
        va,
        locals,
        body,
    })
}

fn basic_block_r(p: &mut Parser) -> Result<BasicBlock, ParseError> {
    let id = bb_id(&p.ident()?);
    p.expect(Colon)?;
    let mut insts = vec![];
    loop {
        match item_r(p)? {
            Item::Inst(i) => insts.push(i),
            Item::Term(t) => {
                return Ok(BasicBlock { id, insts, term: t });
            }
        }
    }
}

enum Item {
    Inst(Instruction),
    Term(Terminal),
}

fn operand_r(p: &mut Parser) -> Result<Operand, ParseError> {
    match p.peek() {
        Some(Num) => Ok(Operand::CInt(p.num()?)),
        Some(NullKw) => {
            p.next();
            Ok(Operand::Null)
        }
        Some(At) => {
            p.next();
            let name = p.ident()?;
            p.lookup_at(&name)
        }
        Some(Ident) => {
            let name = p.ident()?;
            Ok(Operand::Var(p.lookup_var(&name)?))
        }
        _ => p.error_next("expected an operand"),
    }
}

// can the next token start an operand of a variable-length operand list?
fn next_starts_operand(p: &Parser) -> bool {
    match p.peek() {
        Some(Num) | Some(NullKw) | Some(At) => true,
        Some(Ident) => !matches!(p.peek_at(1), Some(Assign) | Some(Colon)),
        _ => false,
    }
}

fn var_r(p: &mut Parser) -> Result<VarId, ParseError> {
    let name = p.ident()?;
    p.lookup_var(&name)
}

fn call_args_r(p: &mut Parser) -> Result<(Vec<Operand>, BbId), ParseError> {
    let mut args = vec![];
    while !p.eat(ThenKw) {
        args.push(operand_r(p)?);
    }
    let next_bb = bb_id(&p.ident()?);
    Ok((args, next_bb))
}

fn item_r(p: &mut Parser) -> Result<Item, ParseError> {
    use Instruction::*;
    // lhs-less forms first.
    match p.peek() {
        Some(DStore) => {
            p.next();
            let dst = operand_r(p)?;
            let op = operand_r(p)?;
            return Ok(Item::Inst(Store { dst, op }));
        }
        Some(DExt) => {
            p.next();
            let ext_callee = func_id(&p.ident()?);
            let mut args = vec![];
            while next_starts_operand(p) {
                args.push(operand_r(p)?);
            }
            return Ok(Item::Inst(CallExt {
                lhs: None,
                ext_callee,
                args,
            }));
        }
        Some(DBranch) => {
            p.next();
            let cond = operand_r(p)?;
            let tt = bb_id(&p.ident()?);
            let ff = bb_id(&p.ident()?);
            return Ok(Item::Term(Terminal::Branch { cond, tt, ff }));
        }
        Some(DJump) => {
            p.next();
            let bb = bb_id(&p.ident()?);
            return Ok(Item::Term(Terminal::Jump(bb)));
        }
        Some(DRet) => {
            p.next();
            let op = if next_starts_operand(p) {
                Some(operand_r(p)?)
            } else {
                None
            };
            return Ok(Item::Term(Terminal::Ret(op)));
        }
        Some(DCallDir) => {
            p.next();
            let callee = func_id(&p.ident()?);
            let (args, next_bb) = call_args_r(p)?;
            return Ok(Item::Term(Terminal::CallDirect {
                lhs: None,
                callee,
                args,
                next_bb,
            }));
        }
        Some(DCallIdr) => {
            p.next();
            let callee = var_r(p)?;
            let (args, next_bb) = call_args_r(p)?;
            return Ok(Item::Term(Terminal::CallIndirect {
                lhs: None,
                callee,
                args,
                next_bb,
            }));
        }
        _ => {}
    }

    // everything else is `lhs = $op ...`.
    let lhs = var_r(p)?;
    p.expect(Assign)?;
    let item = match p.next() {
        Some(DAddrOf) => Item::Inst(AddrOf { lhs, op: var_r(p)? }),
        Some(DAlloc) => {
            let ty = if next_starts_type(p) {
                Some(type_r(p)?)
            } else {
                None
            };
            Item::Inst(Alloc { lhs, ty })
        }
        Some(DArith) => {
            let aop = match p.ident()?.as_str() {
                "add" => ArithOp::Add,
                "sub" => ArithOp::Sub,
                "mul" => ArithOp::Mul,
                "div" => ArithOp::Div,
                other => {
                    return Err(ParseError(format!(
                        "parse error: unknown arith op `{other}`"
                    )))
                }
            };
            Item::Inst(Arith {
                lhs,
                aop,
                op1: operand_r(p)?,
                op2: operand_r(p)?,
            })
        }
        Some(DCmp) => {
            let rop = match p.ident()?.as_str() {
                "eq" => CmpOp::Eq,
                "neq" => CmpOp::Neq,
                "lt" => CmpOp::Lt,
                "lte" => CmpOp::Lte,
                "gt" => CmpOp::Gt,
                "gte" => CmpOp::Gte,
                other => {
                    return Err(ParseError(format!("parse error: unknown cmp op `{other}`")))
                }
            };
            Item::Inst(Cmp {
                lhs,
                rop,
                op1: operand_r(p)?,
                op2: operand_r(p)?,
            })
        }
        Some(DCopy) => Item::Inst(Copy {
            lhs,
            op: operand_r(p)?,
        }),
        Some(DGep) => {
            let src = operand_r(p)?;
            let mut idx = vec![];
            loop {
                match p.peek() {
                    Some(Num) => idx.push(GepIdx::Const(p.num_u32()?)),
                    Some(Ident) if next_starts_operand(p) => idx.push(GepIdx::Var(var_r(p)?)),
                    _ => break,
                }
            }
            Item::Inst(Gep { lhs, src, idx })
        }
        Some(DLoad) => Item::Inst(Load {
            lhs,
            src: operand_r(p)?,
        }),
        Some(DPhi) => {
            let mut ops = vec![];
            while next_starts_operand(p) {
                ops.push(operand_r(p)?);
            }
            Item::Inst(Phi { lhs, ops })
        }
        Some(DSelect) => Item::Inst(Select {
            lhs,
            cond: operand_r(p)?,
            tt: operand_r(p)?,
            ff: operand_r(p)?,
        }),
        Some(DPtr2Int) => Item::Inst(PtrToInt {
            lhs,
            op: operand_r(p)?,
        }),
        Some(DInt2Ptr) => Item::Inst(IntToPtr {
            lhs,
            op: operand_r(p)?,
        }),
        Some(DExtract) => Item::Inst(ExtractValue {
            lhs,
            src: var_r(p)?,
            idx: p.num_u32()?,
        }),
        Some(DInsert) => {
            let src = var_r(p)?;
            let op = operand_r(p)?;
            let idx = p.num_u32()?;
            Item::Inst(InsertValue { lhs, src, op, idx })
        }
        Some(DVaArg) => Item::Inst(VaArg { lhs }),
        Some(DExt) => {
            let ext_callee = func_id(&p.ident()?);
            let mut args = vec![];
            while next_starts_operand(p) {
                args.push(operand_r(p)?);
            }
            Item::Inst(CallExt {
                lhs: Some(lhs),
                ext_callee,
                args,
            })
        }
        Some(DCallDir) => {
            let callee = func_id(&p.ident()?);
            let (args, next_bb) = call_args_r(p)?;
            Item::Term(Terminal::CallDirect {
                lhs: Some(lhs),
                callee,
                args,
                next_bb,
            })
        }
        Some(DCallIdr) => {
            let callee = var_r(p)?;
            let (args, next_bb) = call_args_r(p)?;
            Item::Term(Terminal::CallIndirect {
                lhs: Some(lhs),
                callee,
                args,
                next_bb,
            })
        }
        _ => return p.error_next("expected an instruction"),
    };
    Ok(item)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn round_trip() {
        let src = r#"
struct pair {
  fst: &int,
  snd: &int
}

extern malloc: (int) -> &int

let @g: &int
let @gp: &&int = @g

fn main() -> int {
let h: &int, p: pair, pp: &pair, q: &&int, x: int
entry:
  h = $ext malloc 8
  pp = $addrof p
  q = $gep pp 0 1
  $store q h
  $ret 0
}
"#;
        let prog = src.parse::<Program>().unwrap();
        let printed = prog.to_string();
        let reparsed = printed.parse::<Program>().unwrap();
        assert_eq!(printed, reparsed.to_string());
        assert_eq!(prog, reparsed);
    }

    #[test]
    fn undeclared_var_is_an_error() {
        let src = r#"
fn main() -> int {
entry:
  x = $copy 3
  $ret 0
}
"#;
        assert!(src.parse::<Program>().is_err());
    }
}
