//! The machine's instruction set
//!
//! Instructions are the closed set of operations the code generator can
//! emit. Each one either advances the program counter, transfers control
//! (jump, call, return) or fails into the handler machinery. Labels only
//! exist in the emission buffer: by the time a program runs, every label
//! operand has been resolved to an absolute position.
//!
//! A few loop instructions carry per-run scratch (their accumulators)
//! behind a mutex. Every path out of a loop drains or clears its scratch,
//! so a program can be rerun sequentially without copying; concurrent use
//! goes through `Program::clone_for_thread`, which resets scratch at the
//! recorded stateful positions.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use parking_lot::Mutex;

use crate::ast::{CharPred, GuardFn, ItemFn, MsgsFn, ReasonFn, ValuePred};
use crate::error::{DefuncError, ErrorItem, ItemView};
use crate::machine::{Machine, Status};
use crate::value::{Value, ValueFn};

/// Mutable per-run scratch embedded in a loop instruction.
pub(crate) struct Scratch(Mutex<Vec<Value>>);

impl Scratch {
    pub(crate) fn new() -> Scratch {
        Scratch(Mutex::new(Vec::new()))
    }

    fn push(&self, v: Value) {
        self.0.lock().push(v);
    }

    fn pop(&self) -> Option<Value> {
        self.0.lock().pop()
    }

    fn take(&self) -> Vec<Value> {
        std::mem::take(&mut *self.0.lock())
    }

    fn clear(&self) {
        self.0.lock().clear();
    }
}

impl Clone for Scratch {
    fn clone(&self) -> Self {
        Scratch(Mutex::new(self.0.lock().clone()))
    }
}

impl Default for Scratch {
    fn default() -> Self {
        Scratch::new()
    }
}

impl fmt::Debug for Scratch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Scratch({})", self.0.lock().len())
    }
}

/// One machine instruction. Label-valued operands hold symbolic labels in
/// the emission buffer and absolute positions afterwards.
#[derive(Clone)]
pub(crate) enum Instr {
    // Stack and control
    Push(Value),
    Pop,
    Dup,
    Swap,
    /// Pop the argument, pop the function, push the application.
    Apply,
    Jump(usize),
    Call(usize),
    Return,
    /// Fail silently.
    Empty,
    /// Fail with fixed messages.
    Fail(Vec<String>),
    /// Fail naming a fixed unexpected item.
    Unexpected(ErrorItem),
    /// Emission placeholder, erased by label resolution.
    Label(usize),

    // Characters
    CharTok { c: char, expected: Option<ErrorItem> },
    Satisfies { pred: CharPred, expected: Option<ErrorItem> },
    /// `simple` marks strings free of newlines and tabs, which can bulk
    /// advance the column.
    StringTok { s: String, simple: bool, expected: Option<ErrorItem> },

    // Choice
    /// Record a choice point: an offset check plus a recovery handler.
    InputCheck(usize),
    /// Commit a branch: discard the handler and check, then jump.
    JumpGood(usize),
    /// Gate an alternative's handler: re-fail if input was consumed,
    /// otherwise recover and fall through into the alternative.
    Catch,
    /// Fold the surviving branch error into the hint buffer.
    ErrorToHints,

    // Attempt and lookahead
    /// Recovery handler plus input-state and hint snapshots.
    Attempt(usize),
    /// Success path of attempt: drop the snapshots and jump.
    CommitState(usize),
    /// Failure path of attempt: roll input and hints back, re-fail.
    RestoreFail,
    Look(usize),
    /// Success path of lookahead: roll the input back and jump.
    LookCommit(usize),
    /// Failure path of lookahead: failure stands as-is.
    LookFail,
    /// The body of a negated lookahead failed: succeed with unit.
    NegLookGood,
    /// The body of a negated lookahead succeeded: fail, quoting what it
    /// consumed as the unexpected item.
    NegLookFail,

    // Iteration
    Many { body: usize, acc: Scratch },
    SkipMany { body: usize },
    ChainPost { body: usize },
    ChainPre { body: usize },
    Chainl { body: usize },
    Chainr { body: usize, wrap: ValueFn, acc: Scratch },
    SepEndBy1 { body: usize, acc: Scratch },
    /// Move a parsed element into its loop's accumulator and refresh the
    /// check so a clean separator failure ends the loop successfully.
    SepAccum { loop_pc: usize },
    ManyUntil { body: usize, acc: Scratch },

    // Selective
    /// Pop an either: left falls through, right jumps.
    Case(usize),
    /// Pop a boolean: true falls through, false jumps.
    If(usize),
    Filter { pred: ValuePred },
    FilterOut { reason: ReasonFn },
    GuardAgainst { check: GuardFn },
    FastFail { msgs: MsgsFn },
    FastUnexpected { item: ItemFn },

    // Registers
    Get(usize),
    Put(usize),
    CalleeSaveEnter { fail: usize, slots: Vec<usize>, saved: Scratch },
    CalleeSaveExit { enter: usize },
    CalleeSaveFail { enter: usize },

    // Position
    Line,
    Col,

    // Error adjustment
    RelabelHints(String),
    RelabelError(String),
    ApplyReason(String),

    // Dispatch
    JumpTable { table: HashMap<char, usize>, expecteds: BTreeSet<ErrorItem> },
}

impl Instr {
    /// Whether this instruction embeds per-run scratch.
    pub(crate) fn is_stateful(&self) -> bool {
        matches!(
            self,
            Instr::Many { .. }
                | Instr::Chainr { .. }
                | Instr::SepEndBy1 { .. }
                | Instr::ManyUntil { .. }
                | Instr::CalleeSaveEnter { .. }
        )
    }

    /// A copy with fresh (empty) scratch; identity for stateless
    /// instructions.
    pub(crate) fn fresh_stateful(&self) -> Instr {
        let mut copy = self.clone();
        match &mut copy {
            Instr::Many { acc, .. }
            | Instr::Chainr { acc, .. }
            | Instr::SepEndBy1 { acc, .. }
            | Instr::ManyUntil { acc, .. } => *acc = Scratch::new(),
            Instr::CalleeSaveEnter { saved, .. } => *saved = Scratch::new(),
            _ => {}
        }
        copy
    }

    /// Rewrite every embedded label through the resolution map.
    pub(crate) fn relabel(&self, map: &[usize]) -> Instr {
        let mut copy = self.clone();
        match &mut copy {
            Instr::Jump(l)
            | Instr::Call(l)
            | Instr::InputCheck(l)
            | Instr::JumpGood(l)
            | Instr::Attempt(l)
            | Instr::CommitState(l)
            | Instr::Look(l)
            | Instr::LookCommit(l)
            | Instr::Case(l)
            | Instr::If(l) => *l = map[*l],
            Instr::Many { body, .. }
            | Instr::SkipMany { body }
            | Instr::ChainPost { body }
            | Instr::ChainPre { body }
            | Instr::Chainl { body }
            | Instr::Chainr { body, .. }
            | Instr::SepEndBy1 { body, .. }
            | Instr::ManyUntil { body, .. } => *body = map[*body],
            Instr::SepAccum { loop_pc } => *loop_pc = map[*loop_pc],
            Instr::CalleeSaveEnter { fail, .. } => *fail = map[*fail],
            Instr::CalleeSaveExit { enter } | Instr::CalleeSaveFail { enter } => {
                *enter = map[*enter]
            }
            Instr::JumpTable { table, .. } => {
                for target in table.values_mut() {
                    *target = map[*target];
                }
            }
            _ => {}
        }
        copy
    }

    /// Dispatch one instruction against the machine.
    pub(crate) fn exec(&self, m: &mut Machine<'_>) {
        match self {
            Instr::Push(v) => {
                m.push(v.clone());
                m.pc += 1;
            }
            Instr::Pop => {
                m.pop();
                m.pc += 1;
            }
            Instr::Dup => {
                let v = m.peek_mut().clone();
                m.push(v);
                m.pc += 1;
            }
            Instr::Swap => {
                let a = m.pop();
                let b = m.pop();
                m.push(a);
                m.push(b);
                m.pc += 1;
            }
            Instr::Apply => {
                let x = m.pop();
                let f = m.pop();
                m.push(f.apply(x));
                m.pc += 1;
            }
            Instr::Jump(l) => m.pc = *l,
            Instr::Call(l) => m.call(*l),
            Instr::Return => m.ret(),
            Instr::Empty => {
                let err = m.empty_err();
                m.fail_with(err);
            }
            Instr::Fail(msgs) => {
                let err = m.fancy_err(msgs.clone());
                m.fail_with(err);
            }
            Instr::Unexpected(item) => {
                let err = DefuncError::Unexpected {
                    offset: m.offset,
                    line: m.line,
                    col: m.col,
                    expected: None,
                    unexpected: item.clone(),
                };
                m.fail_with(err);
            }
            Instr::Label(_) => unreachable!("label survived resolution"),

            Instr::CharTok { c, expected } => match m.current_char() {
                Some(x) if x == *c => {
                    m.consume_char();
                    m.push(Value::Char(*c));
                    m.pc += 1;
                }
                _ => {
                    let err = m.expected_err(expected.clone());
                    m.fail_with(err);
                }
            },
            Instr::Satisfies { pred, expected } => match m.current_char() {
                Some(x) if pred(x) => {
                    m.consume_char();
                    m.push(Value::Char(x));
                    m.pc += 1;
                }
                _ => {
                    let err = m.expected_err(expected.clone());
                    m.fail_with(err);
                }
            },
            Instr::StringTok { s, simple, expected } => {
                let mut matched = 0;
                let mut full = true;
                for sc in s.chars() {
                    match m.input.get(m.offset + matched) {
                        Some(ic) if ic == sc => matched += 1,
                        _ => {
                            full = false;
                            break;
                        }
                    }
                }
                if full {
                    if *simple {
                        m.fast_unchecked_consume(matched);
                    } else {
                        for _ in 0..matched {
                            m.consume_char();
                        }
                    }
                    m.push(Value::Str(s.clone()));
                    m.pc += 1;
                } else {
                    let err = DefuncError::StringTok {
                        offset: m.offset,
                        line: m.line,
                        col: m.col,
                        expected: expected.clone(),
                        size: matched + 1,
                    };
                    // The matched prefix stays consumed; alternation sees
                    // this as a committed branch unless wrapped in attempt.
                    for _ in 0..matched {
                        m.consume_char();
                    }
                    m.fail_with(err);
                }
            }

            Instr::InputCheck(l) => {
                m.push_check();
                m.push_handler(*l);
                m.pc += 1;
            }
            Instr::JumpGood(l) => {
                m.handlers.pop();
                m.pop_check();
                m.pc = *l;
            }
            Instr::Catch => {
                let check = m.pop_check();
                if m.offset == check {
                    m.status = Status::Good;
                    m.pc += 1;
                } else {
                    m.fail();
                }
            }
            Instr::ErrorToHints => {
                m.add_error_to_hints();
                m.pc += 1;
            }

            Instr::Attempt(l) | Instr::Look(l) => {
                m.push_handler(*l);
                m.save_state();
                m.save_hints(true);
                m.pc += 1;
            }
            Instr::CommitState(l) => {
                m.handlers.pop();
                m.discard_state();
                m.merge_hints();
                m.pc = *l;
            }
            Instr::RestoreFail => {
                m.restore_state();
                m.restore_hints();
                m.fail();
            }
            Instr::LookCommit(l) => {
                m.handlers.pop();
                m.restore_state();
                m.restore_hints();
                m.pc = *l;
            }
            Instr::LookFail => {
                m.discard_state();
                m.commit_hints();
                m.fail();
            }
            Instr::NegLookGood => {
                // The body failed, which is what we wanted.
                m.errs.pop();
                m.restore_state();
                m.restore_hints();
                m.push(Value::Unit);
                m.status = Status::Good;
                m.pc += 1;
            }
            Instr::NegLookFail => {
                m.handlers.pop();
                let (offset, line, col) = m.discard_state();
                let consumed = m.input.substring(offset, m.offset - offset);
                m.offset = offset;
                m.line = line;
                m.col = col;
                m.restore_hints();
                let err = if consumed.is_empty() {
                    DefuncError::Empty { offset, line, col }
                } else {
                    DefuncError::Unexpected {
                        offset,
                        line,
                        col,
                        expected: None,
                        unexpected: ErrorItem::Raw(consumed),
                    }
                };
                m.fail_with(err);
            }

            Instr::Many { body, acc } => match m.status {
                Status::Good => {
                    let v = m.pop();
                    acc.push(v);
                    m.refresh_check();
                    m.pc = *body;
                }
                Status::Recover => {
                    let check = m.pop_check();
                    if m.offset == check {
                        m.add_error_to_hints();
                        m.push(Value::List(acc.take()));
                        m.status = Status::Good;
                        m.pc += 1;
                    } else {
                        acc.clear();
                        m.fail();
                    }
                }
                Status::Failed => unreachable!(),
            },
            Instr::SkipMany { body } => match m.status {
                Status::Good => {
                    m.pop();
                    m.refresh_check();
                    m.pc = *body;
                }
                Status::Recover => {
                    let check = m.pop_check();
                    if m.offset == check {
                        m.add_error_to_hints();
                        m.push(Value::Unit);
                        m.status = Status::Good;
                        m.pc += 1;
                    } else {
                        m.fail();
                    }
                }
                Status::Failed => unreachable!(),
            },
            Instr::ChainPost { body } => match m.status {
                Status::Good => {
                    let f = m.pop();
                    let x = m.pop();
                    m.push(f.apply(x));
                    m.refresh_check();
                    m.pc = *body;
                }
                Status::Recover => {
                    let check = m.pop_check();
                    if m.offset == check {
                        m.add_error_to_hints();
                        m.status = Status::Good;
                        m.pc += 1;
                    } else {
                        m.fail();
                    }
                }
                Status::Failed => unreachable!(),
            },
            Instr::ChainPre { body } => match m.status {
                Status::Good => {
                    let g = m.pop();
                    let f = m.pop();
                    m.push(f.compose(g));
                    m.refresh_check();
                    m.pc = *body;
                }
                Status::Recover => {
                    let check = m.pop_check();
                    if m.offset == check {
                        m.add_error_to_hints();
                        m.status = Status::Good;
                        m.pc += 1;
                    } else {
                        m.fail();
                    }
                }
                Status::Failed => unreachable!(),
            },
            Instr::Chainl { body } => match m.status {
                Status::Good => {
                    let y = m.pop();
                    let f = m.pop();
                    let x = m.pop();
                    m.push(f.apply(x).apply(y));
                    m.refresh_check();
                    m.pc = *body;
                }
                Status::Recover => {
                    let check = m.pop_check();
                    if m.offset == check {
                        m.add_error_to_hints();
                        m.status = Status::Good;
                        m.pc += 1;
                    } else {
                        m.fail();
                    }
                }
                Status::Failed => unreachable!(),
            },
            Instr::Chainr { body, wrap, acc } => match m.status {
                Status::Good => {
                    let y = m.pop();
                    let f = m.pop();
                    let x = m.pop();
                    let step = f.apply(x);
                    let composed = match acc.pop() {
                        Some(k) => k.compose(step),
                        None => step,
                    };
                    acc.push(composed);
                    m.push(y);
                    m.refresh_check();
                    m.pc = *body;
                }
                Status::Recover => {
                    let check = m.pop_check();
                    if m.offset == check {
                        let x = m.pop();
                        let wrapped = wrap(x);
                        let result = match acc.pop() {
                            Some(k) => k.apply(wrapped),
                            None => wrapped,
                        };
                        acc.clear();
                        m.add_error_to_hints();
                        m.push(result);
                        m.status = Status::Good;
                        m.pc += 1;
                    } else {
                        acc.clear();
                        m.fail();
                    }
                }
                Status::Failed => unreachable!(),
            },
            Instr::SepEndBy1 { body, acc } => match m.status {
                Status::Good => {
                    // The separator's value is discarded.
                    m.pop();
                    m.refresh_check();
                    m.pc = *body;
                }
                Status::Recover => {
                    let check = m.pop_check();
                    if m.offset == check {
                        let items = acc.take();
                        if items.is_empty() {
                            m.fail();
                        } else {
                            m.add_error_to_hints();
                            m.push(Value::List(items));
                            m.status = Status::Good;
                            m.pc += 1;
                        }
                    } else {
                        acc.clear();
                        m.fail();
                    }
                }
                Status::Failed => unreachable!(),
            },
            Instr::SepAccum { loop_pc } => {
                let v = m.pop();
                match &m.program()[*loop_pc] {
                    Instr::SepEndBy1 { acc, .. } => acc.push(v),
                    _ => unreachable!("separator accumulator points past its loop"),
                }
                m.refresh_check();
                m.pc += 1;
            }
            Instr::ManyUntil { body, acc } => match m.status {
                Status::Good => match m.pop() {
                    Value::Left(_) => {
                        m.handlers.pop();
                        m.pop_check();
                        m.push(Value::List(acc.take()));
                        m.pc += 1;
                    }
                    Value::Right(x) => {
                        acc.push(*x);
                        m.pc = *body;
                    }
                    other => unreachable!("many_until body produced {:?}", other),
                },
                Status::Recover => {
                    acc.clear();
                    m.pop_check();
                    m.fail();
                }
                Status::Failed => unreachable!(),
            },

            Instr::Case(l) => match m.pop() {
                Value::Left(x) => {
                    m.push(*x);
                    m.pc += 1;
                }
                Value::Right(y) => {
                    m.push(*y);
                    m.pc = *l;
                }
                other => unreachable!("case scrutinee was {:?}", other),
            },
            Instr::If(l) => match m.pop() {
                Value::Bool(true) => m.pc += 1,
                Value::Bool(false) => m.pc = *l,
                other => unreachable!("if condition was {:?}", other),
            },
            Instr::Filter { pred } => {
                let v = m.pop();
                if pred(&v) {
                    m.push(v);
                    m.pc += 1;
                } else {
                    let err = m.empty_err();
                    m.fail_with(err);
                }
            }
            Instr::FilterOut { reason } => {
                let v = m.pop();
                match reason(&v) {
                    Some(r) => {
                        let err = DefuncError::EmptyWithReason {
                            offset: m.offset,
                            line: m.line,
                            col: m.col,
                            reason: r,
                        };
                        m.fail_with(err);
                    }
                    None => {
                        m.push(v);
                        m.pc += 1;
                    }
                }
            }
            Instr::GuardAgainst { check } => {
                let v = m.pop();
                match check(&v) {
                    Some(msgs) => {
                        let err = m.fancy_err(msgs);
                        m.fail_with(err);
                    }
                    None => {
                        m.push(v);
                        m.pc += 1;
                    }
                }
            }
            Instr::FastFail { msgs } => {
                let v = m.pop();
                let err = m.fancy_err(msgs(&v));
                m.fail_with(err);
            }
            Instr::FastUnexpected { item } => {
                let v = m.pop();
                let err = DefuncError::Unexpected {
                    offset: m.offset,
                    line: m.line,
                    col: m.col,
                    expected: None,
                    unexpected: ErrorItem::Desc(item(&v)),
                };
                m.fail_with(err);
            }

            Instr::Get(slot) => {
                let v = m.regs[*slot].clone();
                m.push(v);
                m.pc += 1;
            }
            Instr::Put(slot) => {
                m.regs[*slot] = m.pop();
                m.pc += 1;
            }
            Instr::CalleeSaveEnter { fail, slots, saved } => {
                let frame: Vec<Value> = slots.iter().map(|&s| m.regs[s].clone()).collect();
                saved.push(Value::List(frame));
                m.push_handler(*fail);
                m.pc += 1;
            }
            Instr::CalleeSaveExit { enter } => {
                restore_saved_regs(m, *enter);
                m.handlers.pop();
                m.pc += 1;
            }
            Instr::CalleeSaveFail { enter } => {
                restore_saved_regs(m, *enter);
                m.fail();
            }

            Instr::Line => {
                m.push(Value::Int(m.line as i64));
                m.pc += 1;
            }
            Instr::Col => {
                m.push(Value::Int(m.col as i64));
                m.pc += 1;
            }

            Instr::RelabelHints(name) => {
                let current = std::mem::take(&mut m.hints);
                m.hints = if name.is_empty() {
                    crate::error::DefuncHints::Pop(Box::new(current))
                } else {
                    crate::error::DefuncHints::Replace(name.clone(), Box::new(current))
                };
                m.pc += 1;
            }
            Instr::RelabelError(name) => {
                let check = m.pop_check();
                if m.offset == check {
                    if let Some(err) = m.errs.pop() {
                        m.errs.push(DefuncError::WithLabel(Box::new(err), name.clone()));
                    }
                }
                m.fail();
            }
            Instr::ApplyReason(reason) => {
                let check = m.pop_check();
                if m.offset == check {
                    if let Some(err) = m.errs.pop() {
                        m.errs.push(DefuncError::WithReason(Box::new(err), reason.clone()));
                    }
                }
                m.fail();
            }

            Instr::JumpTable { table, expecteds } => {
                let target = m.current_char().and_then(|c| table.get(&c).copied());
                match target {
                    Some(t) => m.pc = t,
                    None => {
                        let err = DefuncError::MultiExpected {
                            offset: m.offset,
                            line: m.line,
                            col: m.col,
                            expected: expecteds.clone(),
                        };
                        m.fail_with(err);
                    }
                }
            }
        }
    }
}

fn restore_saved_regs(m: &mut Machine<'_>, enter: usize) {
    match &m.program()[enter] {
        Instr::CalleeSaveEnter { slots, saved, .. } => {
            if let Some(Value::List(frame)) = saved.pop() {
                for (&slot, v) in slots.iter().zip(frame) {
                    m.regs[slot] = v;
                }
            }
        }
        _ => unreachable!("callee-save exit points past its entry"),
    }
}

impl fmt::Debug for Instr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instr::Push(v) => write!(f, "Push({:?})", v),
            Instr::Pop => write!(f, "Pop"),
            Instr::Dup => write!(f, "Dup"),
            Instr::Swap => write!(f, "Swap"),
            Instr::Apply => write!(f, "Apply"),
            Instr::Jump(l) => write!(f, "Jump({})", l),
            Instr::Call(l) => write!(f, "Call({})", l),
            Instr::Return => write!(f, "Return"),
            Instr::Empty => write!(f, "Empty"),
            Instr::Fail(msgs) => write!(f, "Fail({:?})", msgs),
            Instr::Unexpected(item) => write!(f, "Unexpected({})", item),
            Instr::Label(l) => write!(f, "Label({})", l),
            Instr::CharTok { c, .. } => write!(f, "CharTok({:?})", c),
            Instr::Satisfies { .. } => write!(f, "Satisfies(..)"),
            Instr::StringTok { s, .. } => write!(f, "StringTok({:?})", s),
            Instr::InputCheck(l) => write!(f, "InputCheck({})", l),
            Instr::JumpGood(l) => write!(f, "JumpGood({})", l),
            Instr::Catch => write!(f, "Catch"),
            Instr::ErrorToHints => write!(f, "ErrorToHints"),
            Instr::Attempt(l) => write!(f, "Attempt({})", l),
            Instr::CommitState(l) => write!(f, "CommitState({})", l),
            Instr::RestoreFail => write!(f, "RestoreFail"),
            Instr::Look(l) => write!(f, "Look({})", l),
            Instr::LookCommit(l) => write!(f, "LookCommit({})", l),
            Instr::LookFail => write!(f, "LookFail"),
            Instr::NegLookGood => write!(f, "NegLookGood"),
            Instr::NegLookFail => write!(f, "NegLookFail"),
            Instr::Many { body, .. } => write!(f, "Many({})", body),
            Instr::SkipMany { body } => write!(f, "SkipMany({})", body),
            Instr::ChainPost { body } => write!(f, "ChainPost({})", body),
            Instr::ChainPre { body } => write!(f, "ChainPre({})", body),
            Instr::Chainl { body } => write!(f, "Chainl({})", body),
            Instr::Chainr { body, .. } => write!(f, "Chainr({})", body),
            Instr::SepEndBy1 { body, .. } => write!(f, "SepEndBy1({})", body),
            Instr::SepAccum { loop_pc } => write!(f, "SepAccum({})", loop_pc),
            Instr::ManyUntil { body, .. } => write!(f, "ManyUntil({})", body),
            Instr::Case(l) => write!(f, "Case({})", l),
            Instr::If(l) => write!(f, "If({})", l),
            Instr::Filter { .. } => write!(f, "Filter(..)"),
            Instr::FilterOut { .. } => write!(f, "FilterOut(..)"),
            Instr::GuardAgainst { .. } => write!(f, "GuardAgainst(..)"),
            Instr::FastFail { .. } => write!(f, "FastFail(..)"),
            Instr::FastUnexpected { .. } => write!(f, "FastUnexpected(..)"),
            Instr::Get(slot) => write!(f, "Get({})", slot),
            Instr::Put(slot) => write!(f, "Put({})", slot),
            Instr::CalleeSaveEnter { fail, slots, .. } => {
                write!(f, "CalleeSaveEnter({}, {:?})", fail, slots)
            }
            Instr::CalleeSaveExit { enter } => write!(f, "CalleeSaveExit({})", enter),
            Instr::CalleeSaveFail { enter } => write!(f, "CalleeSaveFail({})", enter),
            Instr::Line => write!(f, "Line"),
            Instr::Col => write!(f, "Col"),
            Instr::RelabelHints(name) => write!(f, "RelabelHints({:?})", name),
            Instr::RelabelError(name) => write!(f, "RelabelError({:?})", name),
            Instr::ApplyReason(r) => write!(f, "ApplyReason({:?})", r),
            Instr::JumpTable { table, .. } => {
                let mut keys: Vec<char> = table.keys().copied().collect();
                keys.sort_unstable();
                write!(f, "JumpTable({:?})", keys)
            }
        }
    }
}
