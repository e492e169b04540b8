//! Lowering the parser tree to instructions
//!
//! Compilation runs in four phases. The let-finder counts references;
//! preprocessing rebuilds the tree bottom-up, optimising each node and
//! replacing shared nodes and recursion knots with subroutine references;
//! emission walks the processed tree producing instructions with symbolic
//! labels, queueing subroutine bodies to be appended after the main
//! program; label resolution compacts the buffer into the final array and
//! records which positions hold stateful instructions.
//!
//! Emission is driven either by direct recursion (the default) or by an
//! explicit work stack for grammars deep enough to threaten the host
//! stack. Both drivers consume the same per-node plan, so they emit
//! identical streams.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use log::{debug, trace};

use crate::ast::{optimise, Ast, Keep, RecKnot};
use crate::instr::{Instr, Scratch};
use crate::letfinder::{find_lets, LetInfo};
use crate::machine::Machine;
use crate::registers;
use crate::value::Value;
use crate::CompileError;

/// A compiled parser: the instruction array plus the positions of
/// stateful instructions.
///
/// One `Program` must not be driven from two threads at once, which is
/// why [`Program::run`] takes `&mut self`; give each extra thread its own
/// copy from [`Program::clone_for_thread`].
#[derive(Debug)]
pub struct Program {
    pub(crate) instrs: Vec<Instr>,
    pub(crate) stateful: Vec<usize>,
}

impl Program {
    /// Number of instructions.
    pub fn len(&self) -> usize {
        self.instrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instrs.is_empty()
    }

    /// A copy safe to hand to another thread: the array is cloned
    /// shallowly and the stateful instructions get fresh scratch.
    pub fn clone_for_thread(&self) -> Program {
        let mut instrs = self.instrs.clone();
        for &i in &self.stateful {
            instrs[i] = instrs[i].fresh_stateful();
        }
        Program { instrs, stateful: self.stateful.clone() }
    }

    /// Run against an input, returning the parsed value or the pretty
    /// error message.
    pub fn run(&mut self, input: &str, source_name: Option<&str>) -> Result<Value, String> {
        Machine::new(&self.instrs, input).run(source_name)
    }

    /// Run through a shared reference. When the program carries stateful
    /// instructions this runs on a private copy, so concurrent callers
    /// cannot corrupt each other's accumulators.
    pub(crate) fn run_shared(&self, input: &str, source_name: Option<&str>) -> Result<Value, String> {
        if self.stateful.is_empty() {
            Machine::new(&self.instrs, input).run(source_name)
        } else {
            let copy = self.clone_for_thread();
            Machine::new(&copy.instrs, input).run(source_name)
        }
    }
}

/// Compile a parser tree.
pub(crate) fn compile(root: &Arc<Ast>, impure: bool, deep: bool) -> Result<Program, CompileError> {
    let info = find_lets(root)?;
    registers::allocate(&info.regs)?;
    debug!(
        "let-finder: {} shared nodes, {} registers",
        info.shared.len(),
        info.regs.len()
    );
    let mut pre = Preprocessor::new(&info, impure);
    let main = pre.process(root)?;
    let mut emitter = Emitter::new(pre, &info, deep);
    emitter.buf.reserve(main.size() + 8);
    emitter.gen(&main)?;
    emitter.emit_subroutines()?;
    let labels = emitter.next_label;
    let subs = emitter.emitted.len();
    let (instrs, stateful) = resolve(emitter.buf, labels);
    debug!(
        "emitted {} instructions ({} subroutines, {} stateful)",
        instrs.len(),
        subs,
        stateful.len()
    );
    Ok(Program { instrs, stateful })
}

/// Rebuilds the tree with shared nodes and recursion knots replaced by
/// subroutine references, optimising bottom-up. Memoised on node
/// identity, which both preserves sharing and makes the pass idempotent.
struct Preprocessor<'a> {
    shared: &'a HashSet<*const Ast>,
    impure: bool,
    memo: HashMap<*const Ast, Arc<Ast>>,
    sub_bodies: Vec<Option<Arc<Ast>>>,
    sub_of_knot: HashMap<*const RecKnot, usize>,
    rec_knots: HashMap<usize, *const RecKnot>,
}

impl<'a> Preprocessor<'a> {
    fn new(info: &'a LetInfo, impure: bool) -> Preprocessor<'a> {
        Preprocessor {
            shared: &info.shared,
            impure,
            memo: HashMap::new(),
            sub_bodies: Vec::new(),
            sub_of_knot: HashMap::new(),
            rec_knots: HashMap::new(),
        }
    }

    fn alloc_sub(&mut self) -> usize {
        self.sub_bodies.push(None);
        self.sub_bodies.len() - 1
    }

    fn process(&mut self, node: &Arc<Ast>) -> Result<Arc<Ast>, CompileError> {
        let ptr = Arc::as_ptr(node);
        if let Some(done) = self.memo.get(&ptr) {
            return Ok(Arc::clone(done));
        }
        let result = match &**node {
            Ast::Rec(knot) => {
                let kptr = Arc::as_ptr(knot);
                let id = match self.sub_of_knot.get(&kptr) {
                    Some(&id) => id,
                    None => {
                        let id = self.alloc_sub();
                        // Insert before descending: the body refers back
                        // through the knot, and that reference must
                        // resolve to this id instead of recursing.
                        self.sub_of_knot.insert(kptr, id);
                        self.rec_knots.insert(id, kptr);
                        let body = knot
                            .body
                            .lock()
                            .clone()
                            .ok_or(CompileError::UndefinedRecursion)?;
                        let processed = self.process(&body)?;
                        self.sub_bodies[id] = Some(processed);
                        id
                    }
                };
                Arc::new(Ast::Subroutine(id))
            }
            _ if self.shared.contains(&ptr) => {
                let id = self.alloc_sub();
                let body = self.rebuild(node)?;
                self.sub_bodies[id] = Some(body);
                Arc::new(Ast::Subroutine(id))
            }
            _ => self.rebuild(node)?,
        };
        self.memo.insert(ptr, Arc::clone(&result));
        Ok(result)
    }

    /// Reconstruct one node over its processed children, then optimise.
    fn rebuild(&mut self, node: &Arc<Ast>) -> Result<Arc<Ast>, CompileError> {
        let rebuilt = match &**node {
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
            | Ast::Subroutine(_) => return optimise(Arc::clone(node), self.impure),
            Ast::Rec(_) => unreachable!("recursion handled by process"),
            Ast::Map { p, f } => Ast::Map { p: self.process(p)?, f: Arc::clone(f) },
            Ast::Ap { f, x } => Ast::Ap { f: self.process(f)?, x: self.process(x)? },
            Ast::Seq { first, second, keep } => Ast::Seq {
                first: self.process(first)?,
                second: self.process(second)?,
                keep: *keep,
            },
            Ast::Alt { left, right } => Ast::Alt {
                left: self.process(left)?,
                right: self.process(right)?,
            },
            Ast::Attempt(p) => Ast::Attempt(self.process(p)?),
            Ast::Look(p) => Ast::Look(self.process(p)?),
            Ast::NotFollowedBy(p) => Ast::NotFollowedBy(self.process(p)?),
            Ast::Many(p) => Ast::Many(self.process(p)?),
            Ast::SkipMany(p) => Ast::SkipMany(self.process(p)?),
            Ast::ChainPost { p, op } => Ast::ChainPost {
                p: self.process(p)?,
                op: self.process(op)?,
            },
            Ast::ChainPre { op, p } => Ast::ChainPre {
                op: self.process(op)?,
                p: self.process(p)?,
            },
            Ast::Chainl { p, op } => Ast::Chainl {
                p: self.process(p)?,
                op: self.process(op)?,
            },
            Ast::Chainr { p, op, wrap } => Ast::Chainr {
                p: self.process(p)?,
                op: self.process(op)?,
                wrap: Arc::clone(wrap),
            },
            Ast::SepEndBy1 { p, sep } => Ast::SepEndBy1 {
                p: self.process(p)?,
                sep: self.process(sep)?,
            },
            Ast::ManyUntil { p, end } => Ast::ManyUntil {
                p: self.process(p)?,
                end: self.process(end)?,
            },
            Ast::Branch { scrut, left, right } => Ast::Branch {
                scrut: self.process(scrut)?,
                left: self.process(left)?,
                right: self.process(right)?,
            },
            Ast::IfElse { cond, then_p, else_p } => Ast::IfElse {
                cond: self.process(cond)?,
                then_p: self.process(then_p)?,
                else_p: self.process(else_p)?,
            },
            Ast::Filter { p, pred } => Ast::Filter {
                p: self.process(p)?,
                pred: Arc::clone(pred),
            },
            Ast::FilterOut { p, reason } => Ast::FilterOut {
                p: self.process(p)?,
                reason: Arc::clone(reason),
            },
            Ast::GuardAgainst { p, check } => Ast::GuardAgainst {
                p: self.process(p)?,
                check: Arc::clone(check),
            },
            Ast::FastFail { p, msgs } => Ast::FastFail {
                p: self.process(p)?,
                msgs: Arc::clone(msgs),
            },
            Ast::FastUnexpected { p, item } => Ast::FastUnexpected {
                p: self.process(p)?,
                item: Arc::clone(item),
            },
            Ast::Label { p, name } => Ast::Label {
                p: self.process(p)?,
                name: name.clone(),
            },
            Ast::Reason { p, reason } => Ast::Reason {
                p: self.process(p)?,
                reason: reason.clone(),
            },
            Ast::PutReg { reg, p } => Ast::PutReg {
                reg: Arc::clone(reg),
                p: self.process(p)?,
            },
            Ast::JumpTable { table, expecteds } => {
                let mut processed = Vec::with_capacity(table.len());
                for (c, branch) in table {
                    processed.push((*c, self.process(branch)?));
                }
                Ast::JumpTable { table: processed, expecteds: expecteds.clone() }
            }
        };
        optimise(Arc::new(rebuilt), self.impure)
    }
}

/// One unit of emission work.
enum Step {
    Emit(Instr),
    Mark(usize),
    Child(Arc<Ast>),
}

struct Emitter<'a> {
    buf: Vec<Instr>,
    next_label: usize,
    deep: bool,
    sub_bodies: Vec<Option<Arc<Ast>>>,
    rec_knots: HashMap<usize, *const RecKnot>,
    info: &'a LetInfo,
    sub_labels: HashMap<usize, usize>,
    queue: VecDeque<usize>,
    emitted: HashSet<usize>,
}

impl<'a> Emitter<'a> {
    fn new(pre: Preprocessor<'_>, info: &'a LetInfo, deep: bool) -> Emitter<'a> {
        Emitter {
            buf: Vec::new(),
            next_label: 0,
            deep,
            sub_bodies: pre.sub_bodies,
            rec_knots: pre.rec_knots,
            info,
            sub_labels: HashMap::new(),
            queue: VecDeque::new(),
            emitted: HashSet::new(),
        }
    }

    fn fresh_label(&mut self) -> usize {
        let l = self.next_label;
        self.next_label += 1;
        l
    }

    fn sub_label(&mut self, id: usize) -> usize {
        if let Some(&l) = self.sub_labels.get(&id) {
            return l;
        }
        let l = self.fresh_label();
        self.sub_labels.insert(id, l);
        self.queue.push_back(id);
        l
    }

    fn gen(&mut self, node: &Arc<Ast>) -> Result<(), CompileError> {
        if self.deep {
            self.gen_stacked(node)
        } else {
            self.gen_recursive(node)
        }
    }

    fn gen_recursive(&mut self, node: &Arc<Ast>) -> Result<(), CompileError> {
        for step in self.plan(node)? {
            match step {
                Step::Emit(i) => self.buf.push(i),
                Step::Mark(l) => self.buf.push(Instr::Label(l)),
                Step::Child(c) => self.gen_recursive(&c)?,
            }
        }
        Ok(())
    }

    /// Continuation-style driver: the pending plans live on an explicit
    /// stack instead of the host call stack.
    fn gen_stacked(&mut self, node: &Arc<Ast>) -> Result<(), CompileError> {
        let mut pending = vec![self.plan(node)?.into_iter()];
        loop {
            let step = match pending.last_mut() {
                Some(plan) => plan.next(),
                None => break,
            };
            match step {
                None => {
                    pending.pop();
                }
                Some(Step::Emit(i)) => self.buf.push(i),
                Some(Step::Mark(l)) => self.buf.push(Instr::Label(l)),
                Some(Step::Child(c)) => {
                    let plan = self.plan(&c)?;
                    pending.push(plan.into_iter());
                }
            }
        }
        Ok(())
    }

    /// The emission plan for one node. Shared between both drivers.
    fn plan(&mut self, node: &Arc<Ast>) -> Result<Vec<Step>, CompileError> {
        use Step::{Child, Emit, Mark};
        let steps = match &**node {
            Ast::Pure(v) => vec![Emit(Instr::Push(v.clone()))],
            Ast::Map { p, f } => vec![
                Emit(Instr::Push(Value::Func(Arc::clone(f)))),
                Child(Arc::clone(p)),
                Emit(Instr::Apply),
            ],
            Ast::Ap { f, x } => vec![
                Child(Arc::clone(f)),
                Child(Arc::clone(x)),
                Emit(Instr::Apply),
            ],
            Ast::Seq { first, second, keep } => match keep {
                Keep::First => vec![
                    Child(Arc::clone(first)),
                    Child(Arc::clone(second)),
                    Emit(Instr::Pop),
                ],
                Keep::Second => vec![
                    Child(Arc::clone(first)),
                    Emit(Instr::Pop),
                    Child(Arc::clone(second)),
                ],
            },
            Ast::Alt { left, right } => {
                let handler = self.fresh_label();
                let end = self.fresh_label();
                vec![
                    Emit(Instr::InputCheck(handler)),
                    Child(Arc::clone(left)),
                    Emit(Instr::JumpGood(end)),
                    Mark(handler),
                    Emit(Instr::Catch),
                    Child(Arc::clone(right)),
                    Emit(Instr::ErrorToHints),
                    Mark(end),
                ]
            }
            Ast::Attempt(p) => {
                let handler = self.fresh_label();
                let end = self.fresh_label();
                vec![
                    Emit(Instr::Attempt(handler)),
                    Child(Arc::clone(p)),
                    Emit(Instr::CommitState(end)),
                    Mark(handler),
                    Emit(Instr::RestoreFail),
                    Mark(end),
                ]
            }
            Ast::Look(p) => {
                let handler = self.fresh_label();
                let end = self.fresh_label();
                vec![
                    Emit(Instr::Look(handler)),
                    Child(Arc::clone(p)),
                    Emit(Instr::LookCommit(end)),
                    Mark(handler),
                    Emit(Instr::LookFail),
                    Mark(end),
                ]
            }
            Ast::NotFollowedBy(p) => {
                let handler = self.fresh_label();
                vec![
                    Emit(Instr::Attempt(handler)),
                    Child(Arc::clone(p)),
                    Emit(Instr::NegLookFail),
                    Mark(handler),
                    Emit(Instr::NegLookGood),
                ]
            }
            Ast::Many(p) => {
                let body = self.fresh_label();
                let head = self.fresh_label();
                vec![
                    Emit(Instr::InputCheck(head)),
                    Mark(body),
                    Child(Arc::clone(p)),
                    Mark(head),
                    Emit(Instr::Many { body, acc: Scratch::new() }),
                ]
            }
            Ast::SkipMany(p) => {
                let body = self.fresh_label();
                let head = self.fresh_label();
                vec![
                    Emit(Instr::InputCheck(head)),
                    Mark(body),
                    Child(Arc::clone(p)),
                    Mark(head),
                    Emit(Instr::SkipMany { body }),
                ]
            }
            Ast::ChainPost { p, op } => {
                let body = self.fresh_label();
                let head = self.fresh_label();
                vec![
                    Child(Arc::clone(p)),
                    Emit(Instr::InputCheck(head)),
                    Mark(body),
                    Child(Arc::clone(op)),
                    Mark(head),
                    Emit(Instr::ChainPost { body }),
                ]
            }
            Ast::ChainPre { op, p } => {
                let body = self.fresh_label();
                let head = self.fresh_label();
                vec![
                    Emit(Instr::Push(Value::identity())),
                    Emit(Instr::InputCheck(head)),
                    Mark(body),
                    Child(Arc::clone(op)),
                    Mark(head),
                    Emit(Instr::ChainPre { body }),
                    Child(Arc::clone(p)),
                    Emit(Instr::Apply),
                ]
            }
            Ast::Chainl { p, op } => {
                let body = self.fresh_label();
                let head = self.fresh_label();
                vec![
                    Child(Arc::clone(p)),
                    Emit(Instr::InputCheck(head)),
                    Mark(body),
                    Child(Arc::clone(op)),
                    Child(Arc::clone(p)),
                    Mark(head),
                    Emit(Instr::Chainl { body }),
                ]
            }
            Ast::Chainr { p, op, wrap } => {
                let body = self.fresh_label();
                let head = self.fresh_label();
                vec![
                    Child(Arc::clone(p)),
                    Emit(Instr::InputCheck(head)),
                    Mark(body),
                    Child(Arc::clone(op)),
                    Child(Arc::clone(p)),
                    Mark(head),
                    Emit(Instr::Chainr { body, wrap: Arc::clone(wrap), acc: Scratch::new() }),
                ]
            }
            Ast::SepEndBy1 { p, sep } => {
                let body = self.fresh_label();
                let head = self.fresh_label();
                vec![
                    Emit(Instr::InputCheck(head)),
                    Mark(body),
                    Child(Arc::clone(p)),
                    Emit(Instr::SepAccum { loop_pc: head }),
                    Child(Arc::clone(sep)),
                    Mark(head),
                    Emit(Instr::SepEndBy1 { body, acc: Scratch::new() }),
                ]
            }
            Ast::ManyUntil { p, end } => {
                let body = self.fresh_label();
                let head = self.fresh_label();
                let alt_handler = self.fresh_label();
                let alt_end = self.fresh_label();
                vec![
                    Emit(Instr::InputCheck(head)),
                    Mark(body),
                    // end #> Left(()) <|> p as Right
                    Emit(Instr::InputCheck(alt_handler)),
                    Child(Arc::clone(end)),
                    Emit(Instr::Pop),
                    Emit(Instr::Push(Value::Left(Box::new(Value::Unit)))),
                    Emit(Instr::JumpGood(alt_end)),
                    Mark(alt_handler),
                    Emit(Instr::Catch),
                    Emit(Instr::Push(Value::func(|v| Value::Right(Box::new(v))))),
                    Child(Arc::clone(p)),
                    Emit(Instr::Apply),
                    Emit(Instr::ErrorToHints),
                    Mark(alt_end),
                    Mark(head),
                    Emit(Instr::ManyUntil { body, acc: Scratch::new() }),
                ]
            }
            Ast::Branch { scrut, left, right } => {
                let right_l = self.fresh_label();
                let end = self.fresh_label();
                vec![
                    Child(Arc::clone(scrut)),
                    Emit(Instr::Case(right_l)),
                    Child(Arc::clone(left)),
                    Emit(Instr::Swap),
                    Emit(Instr::Apply),
                    Emit(Instr::Jump(end)),
                    Mark(right_l),
                    Child(Arc::clone(right)),
                    Emit(Instr::Swap),
                    Emit(Instr::Apply),
                    Mark(end),
                ]
            }
            Ast::IfElse { cond, then_p, else_p } => {
                let else_l = self.fresh_label();
                let end = self.fresh_label();
                vec![
                    Child(Arc::clone(cond)),
                    Emit(Instr::If(else_l)),
                    Child(Arc::clone(then_p)),
                    Emit(Instr::Jump(end)),
                    Mark(else_l),
                    Child(Arc::clone(else_p)),
                    Mark(end),
                ]
            }
            Ast::Filter { p, pred } => vec![
                Child(Arc::clone(p)),
                Emit(Instr::Filter { pred: Arc::clone(pred) }),
            ],
            Ast::FilterOut { p, reason } => vec![
                Child(Arc::clone(p)),
                Emit(Instr::FilterOut { reason: Arc::clone(reason) }),
            ],
            Ast::GuardAgainst { p, check } => vec![
                Child(Arc::clone(p)),
                Emit(Instr::GuardAgainst { check: Arc::clone(check) }),
            ],
            Ast::FastFail { p, msgs } => vec![
                Child(Arc::clone(p)),
                Emit(Instr::FastFail { msgs: Arc::clone(msgs) }),
            ],
            Ast::FastUnexpected { p, item } => vec![
                Child(Arc::clone(p)),
                Emit(Instr::FastUnexpected { item: Arc::clone(item) }),
            ],
            Ast::Satisfy { pred, expected } => vec![Emit(Instr::Satisfies {
                pred: Arc::clone(pred),
                expected: expected.clone(),
            })],
            Ast::CharTok(c) => vec![Emit(Instr::CharTok {
                c: *c,
                expected: Some(crate::error::ErrorItem::Raw(c.to_string())),
            })],
            Ast::StringTok(s) => vec![Emit(Instr::StringTok {
                s: s.clone(),
                simple: !s.contains(['\n', '\t']),
                expected: Some(crate::error::ErrorItem::Raw(s.clone())),
            })],
            Ast::Label { p, name } => {
                let handler = self.fresh_label();
                let end = self.fresh_label();
                vec![
                    Emit(Instr::InputCheck(handler)),
                    Child(Arc::clone(p)),
                    Emit(Instr::RelabelHints(name.clone())),
                    Emit(Instr::JumpGood(end)),
                    Mark(handler),
                    Emit(Instr::RelabelError(name.clone())),
                    Mark(end),
                ]
            }
            Ast::Reason { p, reason } => {
                let handler = self.fresh_label();
                let end = self.fresh_label();
                vec![
                    Emit(Instr::InputCheck(handler)),
                    Child(Arc::clone(p)),
                    Emit(Instr::JumpGood(end)),
                    Mark(handler),
                    Emit(Instr::ApplyReason(reason.clone())),
                    Mark(end),
                ]
            }
            Ast::Empty => vec![Emit(Instr::Empty)],
            Ast::Fail(msgs) => vec![Emit(Instr::Fail(msgs.clone()))],
            Ast::Unexpected(name) => vec![Emit(Instr::Unexpected(
                crate::error::ErrorItem::Desc(name.clone()),
            ))],
            Ast::GetReg(reg) => vec![Emit(Instr::Get(allocated_slot(reg)))],
            Ast::PutReg { reg, p } => vec![
                Child(Arc::clone(p)),
                Emit(Instr::Put(allocated_slot(reg))),
                Emit(Instr::Push(Value::Unit)),
            ],
            Ast::Line => vec![Emit(Instr::Line)],
            Ast::Col => vec![Emit(Instr::Col)],
            Ast::Rec(_) => unreachable!("recursion survived preprocessing"),
            Ast::Subroutine(id) => {
                let label = self.sub_label(*id);
                vec![Emit(Instr::Call(label))]
            }
            Ast::JumpTable { table, expecteds } => {
                let end = self.fresh_label();
                let mut dispatch = HashMap::with_capacity(table.len());
                let mut steps = Vec::with_capacity(table.len() * 3 + 2);
                let branch_labels: Vec<usize> =
                    table.iter().map(|_| self.fresh_label()).collect();
                for ((c, _), l) in table.iter().zip(&branch_labels) {
                    dispatch.insert(*c, *l);
                }
                steps.push(Emit(Instr::JumpTable {
                    table: dispatch,
                    expecteds: expecteds.clone(),
                }));
                for ((_, branch), l) in table.iter().zip(&branch_labels) {
                    steps.push(Mark(*l));
                    steps.push(Child(Arc::clone(branch)));
                    steps.push(Emit(Instr::Jump(end)));
                }
                steps.push(Mark(end));
                steps
            }
        };
        Ok(steps)
    }

    /// Emit the queued subroutine bodies after the main program. A
    /// recursive body with registers of its own gets wrapped so every
    /// invocation saves and restores those slots.
    fn emit_subroutines(&mut self) -> Result<(), CompileError> {
        if self.queue.is_empty() {
            return Ok(());
        }
        let exit = self.fresh_label();
        self.buf.push(Instr::Jump(exit));
        while let Some(id) = self.queue.pop_front() {
            if !self.emitted.insert(id) {
                continue;
            }
            let label = self.sub_labels[&id];
            let body = match &self.sub_bodies[id] {
                Some(b) => Arc::clone(b),
                None => unreachable!("subroutine body missing"),
            };
            let locals = self.local_slots(id);
            trace!("subroutine {}: {} local register slots", id, locals.len());
            self.buf.push(Instr::Label(label));
            if locals.is_empty() {
                self.gen(&body)?;
                self.buf.push(Instr::Return);
            } else {
                let fail = self.fresh_label();
                self.buf.push(Instr::CalleeSaveEnter {
                    fail,
                    slots: locals,
                    saved: Scratch::new(),
                });
                self.gen(&body)?;
                self.buf.push(Instr::CalleeSaveExit { enter: label });
                self.buf.push(Instr::Return);
                self.buf.push(Instr::Label(fail));
                self.buf.push(Instr::CalleeSaveFail { enter: label });
            }
        }
        self.buf.push(Instr::Label(exit));
        Ok(())
    }

    fn local_slots(&self, id: usize) -> Vec<usize> {
        let Some(kptr) = self.rec_knots.get(&id) else {
            return Vec::new();
        };
        let Some(locals) = self.info.local_regs.get(kptr) else {
            return Vec::new();
        };
        let mut slots: Vec<usize> = locals.iter().map(|cell| allocated_slot(cell)).collect();
        slots.sort_unstable();
        slots
    }
}

fn allocated_slot(cell: &Arc<crate::registers::RegSlot>) -> usize {
    match cell.slot() {
        Some(s) => s,
        None => unreachable!("register used before allocation"),
    }
}

/// Record where every label lands, then rewrite and compact.
fn resolve(buf: Vec<Instr>, label_count: usize) -> (Vec<Instr>, Vec<usize>) {
    let mut map = vec![usize::MAX; label_count];
    let mut pc = 0;
    for instr in &buf {
        match instr {
            Instr::Label(l) => map[*l] = pc,
            _ => pc += 1,
        }
    }
    let mut out = Vec::with_capacity(pc);
    let mut stateful = Vec::new();
    for instr in buf {
        if matches!(instr, Instr::Label(_)) {
            continue;
        }
        let resolved = instr.relabel(&map);
        if resolved.is_stateful() {
            stateful.push(out.len());
        }
        out.push(resolved);
    }
    (out, stateful)
}
