//! Parser for textual constraint files, the solver-level test surface.
//!
//! A constraint file declares nodes and constraints directly, bypassing
//! constraint generation:
//!
//! ```text
//! node n3 obj 2
//! node n5 obj 1 weak
//! node n6
//! n6 = &n3
//! n7 = *n6 + 1
//! *n6 = n7
//! n8 = n6 + 1
//! ```
//!
//! The syntax is exactly what `Display for Constraint` prints, so dumps
//! round-trip.  Node IDs at or below `P_I2P` are reserved.

use pest::iterators::Pair;
use pest::Parser;

use super::config::AndersConfig;
use super::*;

#[derive(pest_derive::Parser)]
#[grammar_inline = r#"
WHITESPACE = _{ " " | "\t" }
COMMENT = _{ "//" ~ (!NEWLINE ~ ANY)* }

file = { SOI ~ NEWLINE* ~ (line ~ NEWLINE+)* ~ line? ~ EOI }
line = _{ decl | cons }

decl = { "node" ~ node ~ ("obj" ~ num)? ~ weak? }
weak = { "weak" }

cons = { store_c | load_c | addr_c | gep_c | copy_c }
addr_c = { node ~ "=" ~ "&" ~ node }
load_c = { node ~ "=" ~ "*" ~ node ~ off? }
store_c = { "*" ~ node ~ off? ~ "=" ~ node }
gep_c = { node ~ "=" ~ node ~ off }
copy_c = { node ~ "=" ~ node }

off = { "+" ~ num }
node = @{ "n" ~ num }
num = @{ ASCII_DIGIT+ }
"#]
struct ConsFileParser;

use derive_more::Display;

#[derive(Debug, Display)]
pub enum ConsFileError {
    Parse(Box<pest::error::Error<Rule>>),
    #[display(fmt = "reserved node id n{}", _0)]
    ReservedNode(u32),
}

impl std::error::Error for ConsFileError {}

/// Build an engine preloaded with the nodes and constraints of a
/// constraint file.  The caller drives the phases from there.
pub fn parse_cons_file(input: &str, config: AndersConfig) -> Result<Anders, ConsFileError> {
    let file = ConsFileParser::parse(Rule::file, input)
        .map_err(|e| ConsFileError::Parse(Box::new(e)))?
        .next()
        .expect("file rule");

    let mut a = Anders::new(config);
    a.add_node(None, 0, false);
    a.add_node(None, 1, true);
    a.add_node(None, 0, false);
    a.add_cons(ConsType::AddrOf, I2P, I2P, 0);
    a.add_cons(ConsType::AddrOf, P_I2P, I2P, 0);

    for line in file.into_inner() {
        match line.as_rule() {
            Rule::decl => {
                let mut inner = line.into_inner();
                let id = parse_node(inner.next().expect("node id"))?;
                if id <= P_I2P {
                    return Err(ConsFileError::ReservedNode(id));
                }
                ensure_node(&mut a, id);
                for part in inner {
                    match part.as_rule() {
                        Rule::num => {
                            a.node_mut(id).obj_sz = part.as_str().parse().expect("obj size");
                        }
                        Rule::weak => a.node_mut(id).weak = true,
                        _ => unreachable!("unexpected decl part"),
                    }
                }
            }
            Rule::cons => {
                let c = line.into_inner().next().expect("constraint alternative");
                let (kind, dest, src, off) = match c.as_rule() {
                    Rule::addr_c => {
                        let (d, s, _) = cons_parts(c)?;
                        (ConsType::AddrOf, d, s, 0)
                    }
                    Rule::copy_c => {
                        let (d, s, _) = cons_parts(c)?;
                        (ConsType::Copy, d, s, 0)
                    }
                    Rule::load_c => {
                        let (d, s, off) = cons_parts(c)?;
                        (ConsType::Load, d, s, off)
                    }
                    Rule::store_c => {
                        let (d, s, off) = cons_parts(c)?;
                        (ConsType::Store, d, s, off)
                    }
                    Rule::gep_c => {
                        let (d, s, off) = cons_parts(c)?;
                        (ConsType::Gep, d, s, off)
                    }
                    _ => unreachable!("unexpected constraint rule"),
                };
                ensure_node(&mut a, dest);
                ensure_node(&mut a, src);
                a.add_cons(kind, dest, src, off);
            }
            Rule::EOI => {}
            _ => unreachable!("unexpected line rule"),
        }
    }
    Ok(a)
}

/// Parse, then run the solver phases on the raw constraints (no offline
/// optimization, so the file's node IDs stay meaningful to the caller).
pub fn solve_cons_file(input: &str, config: AndersConfig) -> Result<Anders, ConsFileError> {
    let mut a = parse_cons_file(input, config)?;
    a.pts_init();
    a.solve_init();
    a.solve();
    Ok(a)
}

// reserved nodes may appear in constraints (the i2p pins print like any
// other constraint) but cannot be redeclared; node 0 is never legal.
fn parse_node(p: Pair<Rule>) -> Result<u32, ConsFileError> {
    let id: u32 = p.as_str()[1..].parse().expect("node id");
    if id == NODE_NONE {
        return Err(ConsFileError::ReservedNode(id));
    }
    Ok(id)
}

// (dest, src, off) in constraint order.  Every rule names the dest node
// first, including `*nD + k = nS`.
fn cons_parts(c: Pair<Rule>) -> Result<(u32, u32, u32), ConsFileError> {
    let mut nodes = vec![];
    let mut off = 0;
    for p in c.into_inner() {
        match p.as_rule() {
            Rule::node => nodes.push(parse_node(p)?),
            Rule::off => {
                off = p
                    .into_inner()
                    .next()
                    .expect("offset value")
                    .as_str()
                    .parse()
                    .expect("offset");
            }
            _ => unreachable!("unexpected constraint part"),
        }
    }
    assert!(nodes.len() == 2, "constraint needs two nodes");
    Ok((nodes[0], nodes[1], off))
}

fn ensure_node(a: &mut Anders, id: u32) {
    while a.num_nodes() <= id {
        a.add_node(None, 0, false);
    }
}
