//! The deep embedding: an immutable tree of parser descriptions
//!
//! Combinators build this tree; compilation walks it. Sharing is by
//! `Arc` pointer identity - cloning a parser clones the handle, not the
//! tree - which is what the let-finder uses to spot sub-parsers worth
//! compiling once and calling.

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::ErrorItem;
use crate::registers::RegSlot;
use crate::value::{Value, ValueFn};
use crate::CompileError;

/// Predicate over a single input character.
pub(crate) type CharPred = Arc<dyn Fn(char) -> bool + Send + Sync>;
/// Predicate over an operand value.
pub(crate) type ValuePred = Arc<dyn Fn(&Value) -> bool + Send + Sync>;
/// Partial map from a value to a rejection reason.
pub(crate) type ReasonFn = Arc<dyn Fn(&Value) -> Option<String> + Send + Sync>;
/// Partial map from a value to failure messages.
pub(crate) type GuardFn = Arc<dyn Fn(&Value) -> Option<Vec<String>> + Send + Sync>;
/// Total map from a value to failure messages.
pub(crate) type MsgsFn = Arc<dyn Fn(&Value) -> Vec<String> + Send + Sync>;
/// Total map from a value to an unexpected-item description.
pub(crate) type ItemFn = Arc<dyn Fn(&Value) -> String + Send + Sync>;

/// The tying point of a recursive parser. `recursive` hands out a
/// placeholder referring to the knot, then fills the body in.
pub(crate) struct RecKnot {
    pub(crate) body: Mutex<Option<Arc<Ast>>>,
}

/// Which operand a sequence keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Keep {
    First,
    Second,
}

/// One node of the parser tree.
pub(crate) enum Ast {
    /// Succeed with a value, consuming nothing.
    Pure(Value),
    /// Apply a parsed function to a parsed argument.
    Ap { f: Arc<Ast>, x: Arc<Ast> },
    /// Transform the result with a host function.
    Map { p: Arc<Ast>, f: ValueFn },
    /// Run both, keep one side.
    Seq { first: Arc<Ast>, second: Arc<Ast>, keep: Keep },
    /// Try the left; on clean failure, the right.
    Alt { left: Arc<Ast>, right: Arc<Ast> },
    /// Roll the input back if the body fails after consuming.
    Attempt(Arc<Ast>),
    /// Run the body, then restore the input position on success.
    Look(Arc<Ast>),
    /// Succeed exactly when the body fails, consuming nothing.
    NotFollowedBy(Arc<Ast>),
    Many(Arc<Ast>),
    SkipMany(Arc<Ast>),
    /// `p` then zero or more postfix operators folded in.
    ChainPost { p: Arc<Ast>, op: Arc<Ast> },
    /// Zero or more prefix operators, then `p`.
    ChainPre { op: Arc<Ast>, p: Arc<Ast> },
    /// Left-associative operator chain.
    Chainl { p: Arc<Ast>, op: Arc<Ast> },
    /// Right-associative operator chain; `wrap` adjusts the final operand.
    Chainr { p: Arc<Ast>, op: Arc<Ast>, wrap: ValueFn },
    /// One or more `p` separated by `sep`, trailing separator allowed.
    SepEndBy1 { p: Arc<Ast>, sep: Arc<Ast> },
    /// Collect `p` until `end` matches.
    ManyUntil { p: Arc<Ast>, end: Arc<Ast> },
    /// Dispatch on a parsed `Either`.
    Branch { scrut: Arc<Ast>, left: Arc<Ast>, right: Arc<Ast> },
    /// Dispatch on a parsed boolean.
    IfElse { cond: Arc<Ast>, then_p: Arc<Ast>, else_p: Arc<Ast> },
    Filter { p: Arc<Ast>, pred: ValuePred },
    FilterOut { p: Arc<Ast>, reason: ReasonFn },
    GuardAgainst { p: Arc<Ast>, check: GuardFn },
    /// Always fail, building the messages from the parsed value.
    FastFail { p: Arc<Ast>, msgs: MsgsFn },
    /// Always fail, naming the parsed value as the unexpected item.
    FastUnexpected { p: Arc<Ast>, item: ItemFn },
    Satisfy { pred: CharPred, expected: Option<ErrorItem> },
    CharTok(char),
    StringTok(String),
    Label { p: Arc<Ast>, name: String },
    Reason { p: Arc<Ast>, reason: String },
    /// Fail silently.
    Empty,
    /// Fail with fixed messages.
    Fail(Vec<String>),
    /// Fail naming a fixed unexpected item.
    Unexpected(String),
    GetReg(Arc<RegSlot>),
    PutReg { reg: Arc<RegSlot>, p: Arc<Ast> },
    /// Push the current line number.
    Line,
    /// Push the current column number.
    Col,
    /// A recursion point; compiled as a call to the knot's body.
    Rec(Arc<RecKnot>),
    /// A shared sub-parser reference produced by preprocessing.
    Subroutine(usize),
    /// Character-indexed dispatch over alternatives with distinct
    /// leading literals; built by the optimiser.
    JumpTable { table: Vec<(char, Arc<Ast>)>, expecteds: BTreeSet<ErrorItem> },
}

impl Ast {
    /// Rough number of instructions this node lowers to, used to presize
    /// emission buffers. Calls count as one.
    pub(crate) fn size(&self) -> usize {
        match self {
            Ast::Pure(_)
            | Ast::Satisfy { .. }
            | Ast::CharTok(_)
            | Ast::StringTok(_)
            | Ast::Empty
            | Ast::Fail(_)
            | Ast::Unexpected(_)
            | Ast::GetReg(_)
            | Ast::Line
            | Ast::Col
            | Ast::Rec(_)
            | Ast::Subroutine(_) => 1,
            Ast::Map { p, .. } => p.size() + 2,
            Ast::Ap { f, x } => f.size() + x.size() + 1,
            Ast::Seq { first, second, .. } => first.size() + second.size() + 2,
            Ast::Alt { left, right } => left.size() + right.size() + 4,
            Ast::Attempt(p) | Ast::Look(p) | Ast::NotFollowedBy(p) => p.size() + 3,
            Ast::Many(p) | Ast::SkipMany(p) => p.size() + 2,
            Ast::ChainPost { p, op } | Ast::Chainl { p, op } | Ast::Chainr { p, op, .. } => {
                p.size() + op.size() + 3
            }
            Ast::ChainPre { op, p } => op.size() + p.size() + 4,
            Ast::SepEndBy1 { p, sep } => p.size() + sep.size() + 3,
            Ast::ManyUntil { p, end } => p.size() + end.size() + 8,
            Ast::Branch { scrut, left, right } => scrut.size() + left.size() + right.size() + 6,
            Ast::IfElse { cond, then_p, else_p } => {
                cond.size() + then_p.size() + else_p.size() + 2
            }
            Ast::Filter { p, .. }
            | Ast::FilterOut { p, .. }
            | Ast::GuardAgainst { p, .. }
            | Ast::FastFail { p, .. }
            | Ast::FastUnexpected { p, .. } => p.size() + 1,
            Ast::Label { p, .. } | Ast::Reason { p, .. } => p.size() + 4,
            Ast::PutReg { p, .. } => p.size() + 2,
            Ast::JumpTable { table, .. } => {
                table.iter().map(|(_, a)| a.size() + 1).sum::<usize>() + 1
            }
        }
    }
}

/// The character a parser is certain to consume first, when that can be
/// read off the tree. Drives jump-table construction.
fn leading_char(ast: &Ast) -> Option<char> {
    match ast {
        Ast::CharTok(c) => Some(*c),
        Ast::StringTok(s) => s.chars().next(),
        Ast::Map { p, .. } => leading_char(p),
        Ast::Seq { first, .. } => leading_char(first),
        Ast::Ap { f, .. } => leading_char(f),
        _ => None,
    }
}

fn flatten_alts(ast: &Arc<Ast>, out: &mut Vec<Arc<Ast>>) {
    match &**ast {
        Ast::Alt { left, right } => {
            flatten_alts(left, out);
            flatten_alts(right, out);
        }
        _ => out.push(Arc::clone(ast)),
    }
}

/// Try to turn an alternation chain into a jump table. Requires at least
/// three branches, every branch led by a literal character, all distinct.
fn build_jump_table(node: &Arc<Ast>) -> Option<Arc<Ast>> {
    // Merging into an already-built table handles chains longer than the
    // construction threshold.
    if let Ast::Alt { left, right } = &**node {
        if let Ast::JumpTable { table, expecteds } = &**right {
            let c = leading_char(left)?;
            if table.iter().any(|(k, _)| *k == c) {
                return None;
            }
            let mut table = table.clone();
            table.insert(0, (c, Arc::clone(left)));
            let mut expecteds = expecteds.clone();
            expecteds.insert(ErrorItem::Raw(c.to_string()));
            return Some(Arc::new(Ast::JumpTable { table, expecteds }));
        }
    }
    let mut leaves = Vec::new();
    flatten_alts(node, &mut leaves);
    if leaves.len() < 3 {
        return None;
    }
    let mut table = Vec::with_capacity(leaves.len());
    let mut expecteds = BTreeSet::new();
    for leaf in leaves {
        let c = leading_char(&leaf)?;
        if table.iter().any(|(k, _): &(char, Arc<Ast>)| *k == c) {
            return None;
        }
        expecteds.insert(ErrorItem::Raw(c.to_string()));
        table.push((c, leaf));
    }
    Some(Arc::new(Ast::JumpTable { table, expecteds }))
}

/// Peephole-rewrite one node whose children are already optimised.
///
/// `impure` disables every rewrite that would call or discard a user
/// function at compile time: pure application folding, `pure <|> _`,
/// branch/if constant dispatch and filter constant folding. The
/// structural identities over `empty` stay on.
pub(crate) fn optimise(node: Arc<Ast>, impure: bool) -> Result<Arc<Ast>, CompileError> {
    match &*node {
        Ast::Ap { f, x } => {
            if !impure {
                if let (Ast::Pure(g), Ast::Pure(v)) = (&**f, &**x) {
                    return Ok(Arc::new(Ast::Pure(g.clone().apply(v.clone()))));
                }
            }
            Ok(node)
        }
        Ast::Alt { left, right } => {
            if matches!(&**left, Ast::Empty) {
                return Ok(Arc::clone(right));
            }
            if matches!(&**right, Ast::Empty) {
                return Ok(Arc::clone(left));
            }
            if !impure && matches!(&**left, Ast::Pure(_)) {
                return Ok(Arc::clone(left));
            }
            Ok(build_jump_table(&node).unwrap_or(node))
        }
        Ast::Attempt(p) => match &**p {
            Ast::Pure(_) | Ast::Empty => Ok(Arc::clone(p)),
            _ => Ok(node),
        },
        Ast::Many(p) => match &**p {
            Ast::Pure(_) => Err(CompileError::InfiniteLoop("many")),
            Ast::Empty => Ok(Arc::new(Ast::Pure(Value::List(Vec::new())))),
            _ => Ok(node),
        },
        Ast::SkipMany(p) => match &**p {
            Ast::Pure(_) => Err(CompileError::InfiniteLoop("skip_many")),
            Ast::Empty => Ok(Arc::new(Ast::Pure(Value::Unit))),
            _ => Ok(node),
        },
        Ast::ChainPost { op, .. } => match &**op {
            Ast::Pure(_) => Err(CompileError::InfiniteLoop("postfix")),
            _ => Ok(node),
        },
        Ast::ChainPre { op, .. } => match &**op {
            Ast::Pure(_) => Err(CompileError::InfiniteLoop("prefix")),
            _ => Ok(node),
        },
        Ast::Chainl { p, op } => match (&**p, &**op) {
            (Ast::Pure(_), Ast::Pure(_)) => Err(CompileError::InfiniteLoop("chain_left1")),
            _ => Ok(node),
        },
        Ast::Chainr { p, op, .. } => match (&**p, &**op) {
            (Ast::Pure(_), Ast::Pure(_)) => Err(CompileError::InfiniteLoop("chain_right1")),
            _ => Ok(node),
        },
        Ast::SepEndBy1 { p, sep } => match (&**p, &**sep) {
            (Ast::Pure(_), Ast::Pure(_)) => Err(CompileError::InfiniteLoop("sep_end_by1")),
            _ => Ok(node),
        },
        Ast::ManyUntil { p, .. } => match &**p {
            Ast::Pure(_) => Err(CompileError::InfiniteLoop("many_until")),
            _ => Ok(node),
        },
        Ast::Branch { scrut, left, right } => {
            if !impure {
                if let Ast::Pure(v) = &**scrut {
                    match v {
                        Value::Left(x) => {
                            return Ok(Arc::new(Ast::Ap {
                                f: Arc::clone(left),
                                x: Arc::new(Ast::Pure((**x).clone())),
                            }));
                        }
                        Value::Right(x) => {
                            return Ok(Arc::new(Ast::Ap {
                                f: Arc::clone(right),
                                x: Arc::new(Ast::Pure((**x).clone())),
                            }));
                        }
                        _ => {}
                    }
                }
            }
            Ok(node)
        }
        Ast::IfElse { cond, then_p, else_p } => {
            if !impure {
                if let Ast::Pure(Value::Bool(b)) = &**cond {
                    return Ok(if *b { Arc::clone(then_p) } else { Arc::clone(else_p) });
                }
            }
            Ok(node)
        }
        Ast::Filter { p, pred } => {
            if !impure {
                if let Ast::Pure(v) = &**p {
                    return Ok(if pred(v) {
                        Arc::clone(p)
                    } else {
                        Arc::new(Ast::Empty)
                    });
                }
            }
            Ok(node)
        }
        _ => Ok(node),
    }
}
