//! Discovery of shared sub-parsers, recursion points and registers
//!
//! Walks the parser tree once, counting how often each node (by pointer)
//! is reachable. Nodes seen more than once become subroutines: compiled
//! one time and called from every use site. Recursion knots are traversed
//! exactly once, which is also what cuts the cycles. Register handles are
//! collected for slot allocation, classified as global or as local to a
//! single recursive body (locals get callee-save treatment).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::ast::{Ast, RecKnot};
use crate::registers::RegSlot;
use crate::CompileError;

pub(crate) struct LetInfo {
    /// Nodes reachable through more than one path.
    pub shared: HashSet<*const Ast>,
    /// Every register handle used in the grammar, in discovery order.
    pub regs: Vec<Arc<RegSlot>>,
    /// Registers whose every use sits inside one recursive body.
    pub local_regs: HashMap<*const RecKnot, Vec<Arc<RegSlot>>>,
}

pub(crate) fn find_lets(root: &Arc<Ast>) -> Result<LetInfo, CompileError> {
    let mut finder = Finder::default();
    finder.visit(root)?;
    let mut local_regs: HashMap<*const RecKnot, Vec<Arc<RegSlot>>> = HashMap::new();
    let mut regs = Vec::new();
    for ptr in &finder.reg_order {
        let (cell, contexts) = &finder.reg_uses[ptr];
        regs.push(Arc::clone(cell));
        let mut ctxs = contexts.iter();
        if let (Some(Some(knot)), None) = (ctxs.next(), ctxs.next()) {
            local_regs.entry(*knot).or_default().push(Arc::clone(cell));
        }
    }
    Ok(LetInfo { shared: finder.shared, regs, local_regs })
}

#[derive(Default)]
struct Finder {
    counts: HashMap<*const Ast, usize>,
    shared: HashSet<*const Ast>,
    #[allow(clippy::type_complexity)]
    reg_uses: HashMap<*const RegSlot, (Arc<RegSlot>, HashSet<Option<*const RecKnot>>)>,
    reg_order: Vec<*const RegSlot>,
    knots_seen: HashSet<*const RecKnot>,
    /// Recursive bodies currently being traversed, innermost last.
    path: Vec<*const RecKnot>,
}

impl Finder {
    fn visit(&mut self, node: &Arc<Ast>) -> Result<(), CompileError> {
        let ptr = Arc::as_ptr(node);
        let count = self.counts.entry(ptr).or_insert(0);
        *count += 1;
        if *count > 1 {
            self.shared.insert(ptr);
            return Ok(());
        }
        match &**node {
            Ast::Rec(knot) => {
                let kptr = Arc::as_ptr(knot);
                if self.knots_seen.insert(kptr) {
                    let body = knot
                        .body
                        .lock()
                        .clone()
                        .ok_or(CompileError::UndefinedRecursion)?;
                    self.path.push(kptr);
                    self.visit(&body)?;
                    self.path.pop();
                }
            }
            Ast::GetReg(reg) => self.record_reg(reg),
            Ast::PutReg { reg, p } => {
                self.record_reg(reg);
                self.visit(p)?;
            }
            _ => {
                for child in children(node) {
                    self.visit(child)?;
                }
            }
        }
        Ok(())
    }

    fn record_reg(&mut self, reg: &Arc<RegSlot>) {
        let ptr = Arc::as_ptr(reg);
        let context = self.path.last().copied();
        let entry = self
            .reg_uses
            .entry(ptr)
            .or_insert_with(|| (Arc::clone(reg), HashSet::new()));
        if entry.1.is_empty() {
            self.reg_order.push(ptr);
        }
        entry.1.insert(context);
    }
}

/// The direct child nodes of an AST node.
pub(crate) fn children(ast: &Ast) -> Vec<&Arc<Ast>> {
    match ast {
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
        | Ast::Subroutine(_) => Vec::new(),
        Ast::Map { p, .. }
        | Ast::Attempt(p)
        | Ast::Look(p)
        | Ast::NotFollowedBy(p)
        | Ast::Many(p)
        | Ast::SkipMany(p)
        | Ast::Filter { p, .. }
        | Ast::FilterOut { p, .. }
        | Ast::GuardAgainst { p, .. }
        | Ast::FastFail { p, .. }
        | Ast::FastUnexpected { p, .. }
        | Ast::Label { p, .. }
        | Ast::Reason { p, .. }
        | Ast::PutReg { p, .. } => vec![p],
        Ast::Ap { f, x } => vec![f, x],
        Ast::Seq { first, second, .. } => vec![first, second],
        Ast::Alt { left, right } => vec![left, right],
        Ast::ChainPost { p, op }
        | Ast::ChainPre { op, p }
        | Ast::Chainl { p, op }
        | Ast::Chainr { p, op, .. } => vec![p, op],
        Ast::SepEndBy1 { p, sep } => vec![p, sep],
        Ast::ManyUntil { p, end } => vec![p, end],
        Ast::Branch { scrut, left, right } => vec![scrut, left, right],
        Ast::IfElse { cond, then_p, else_p } => vec![cond, then_p, else_p],
        Ast::JumpTable { table, .. } => table.iter().map(|(_, a)| a).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_cloned_nodes_become_shared() {
        let shared = Arc::new(Ast::CharTok('a'));
        let root = Arc::new(Ast::Seq {
            first: Arc::clone(&shared),
            second: Arc::clone(&shared),
            keep: crate::ast::Keep::Second,
        });
        let info = find_lets(&root).unwrap();
        assert!(info.shared.contains(&Arc::as_ptr(&shared)));
    }

    #[test]
    fn test_single_use_is_not_shared() {
        let leaf = Arc::new(Ast::CharTok('a'));
        let root = Arc::new(Ast::Many(Arc::clone(&leaf)));
        let info = find_lets(&root).unwrap();
        assert!(info.shared.is_empty());
    }

    #[test]
    fn test_untied_knot_is_reported() {
        let knot = Arc::new(RecKnot { body: Mutex::new(None) });
        let root = Arc::new(Ast::Rec(knot));
        assert!(matches!(find_lets(&root), Err(CompileError::UndefinedRecursion)));
    }

    #[test]
    fn test_recursive_body_visited_once() {
        let knot = Arc::new(RecKnot { body: Mutex::new(None) });
        let rec = Arc::new(Ast::Rec(Arc::clone(&knot)));
        // body: 'a' then recurse
        let body = Arc::new(Ast::Seq {
            first: Arc::new(Ast::CharTok('a')),
            second: Arc::clone(&rec),
            keep: crate::ast::Keep::Second,
        });
        *knot.body.lock() = Some(body);
        let info = find_lets(&rec).unwrap();
        assert!(info.regs.is_empty());
    }

    #[test]
    fn test_register_locality() {
        let global = crate::Reg::<i64>::new();
        let local = crate::Reg::<i64>::new();
        let knot = Arc::new(RecKnot { body: Mutex::new(None) });
        let rec = Arc::new(Ast::Rec(Arc::clone(&knot)));
        let body = Arc::new(Ast::Seq {
            first: Arc::new(Ast::GetReg(Arc::clone(&local.cell))),
            second: Arc::new(Ast::Seq {
                first: Arc::new(Ast::GetReg(Arc::clone(&global.cell))),
                second: Arc::clone(&rec),
                keep: crate::ast::Keep::Second,
            }),
            keep: crate::ast::Keep::Second,
        });
        *knot.body.lock() = Some(body);
        // global is also read outside the recursion
        let root = Arc::new(Ast::Seq {
            first: Arc::new(Ast::GetReg(Arc::clone(&global.cell))),
            second: rec,
            keep: crate::ast::Keep::Second,
        });
        let info = find_lets(&root).unwrap();
        assert_eq!(info.regs.len(), 2);
        let locals = &info.local_regs[&Arc::as_ptr(&knot)];
        assert_eq!(locals.len(), 1);
        assert!(Arc::ptr_eq(&locals[0], &local.cell));
    }
}
