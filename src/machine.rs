//! The parsing machine
//!
//! A `Machine` binds a compiled instruction array to one input and drives
//! dispatch. All runtime state lives here: the operand stack, call and
//! handler stacks, choice-point checks, saved input states for rollback,
//! the register slots and the deferred error state.
//!
//! Failure is a status transition, not an exception: `fail` walks the
//! handler stack, truncating the other stacks back to the recovery
//! point's sizes and collapsing every error raised since into one merged
//! value, so each recovery point observes exactly one new error.

use crate::error::{DefuncError, DefuncHints, ItemView, LineView, ParseError};
use crate::instr::Instr;
use crate::registers::REGISTER_COUNT;
use crate::value::Value;

/// Input held as codepoints so offsets index characters.
pub(crate) struct Input {
    chars: Vec<char>,
}

impl Input {
    pub(crate) fn new(s: &str) -> Input {
        Input { chars: s.chars().collect() }
    }

    pub(crate) fn get(&self, offset: usize) -> Option<char> {
        self.chars.get(offset).copied()
    }
}

impl ItemView for Input {
    fn in_range(&self, offset: usize) -> bool {
        offset < self.chars.len()
    }

    fn char_at(&self, offset: usize) -> char {
        self.chars[offset]
    }

    fn substring(&self, offset: usize, size: usize) -> String {
        self.chars[offset..(offset + size).min(self.chars.len())].iter().collect()
    }
}

impl LineView for Input {
    fn nearest_newline_before(&self, offset: usize) -> usize {
        self.chars[..offset.min(self.chars.len())]
            .iter()
            .rposition(|&c| c == '\n')
            .map(|i| i + 1)
            .unwrap_or(0)
    }

    fn nearest_newline_after(&self, offset: usize) -> usize {
        let from = offset.min(self.chars.len());
        self.chars[from..]
            .iter()
            .position(|&c| c == '\n')
            .map(|i| from + i)
            .unwrap_or(self.chars.len())
    }

    fn segment_between(&self, start: usize, end: usize) -> String {
        self.chars[start..end].iter().collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Status {
    Good,
    Recover,
    Failed,
}

/// A recovery point. `errs_sz` scopes error merging: on recovery, every
/// error pushed above it is collapsed into a single merged value.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Handler {
    pub depth: usize,
    pub pc: usize,
    pub stack_sz: usize,
    pub errs_sz: usize,
}

pub(crate) struct Machine<'p> {
    instrs: &'p [Instr],
    pub(crate) input: Input,
    pub(crate) offset: usize,
    pub(crate) line: usize,
    pub(crate) col: usize,
    pub(crate) stack: Vec<Value>,
    pub(crate) calls: Vec<usize>,
    pub(crate) states: Vec<(usize, usize, usize)>,
    pub(crate) checks: Vec<usize>,
    pub(crate) handlers: Vec<Handler>,
    pub(crate) regs: [Value; REGISTER_COUNT],
    pub(crate) status: Status,
    pub(crate) pc: usize,
    pub(crate) errs: Vec<DefuncError>,
    pub(crate) hints: DefuncHints,
    pub(crate) hints_valid_offset: usize,
    pub(crate) hint_stack: Vec<(DefuncHints, usize)>,
}

impl<'p> Machine<'p> {
    pub(crate) fn new(instrs: &'p [Instr], input: &str) -> Machine<'p> {
        Machine {
            instrs,
            input: Input::new(input),
            offset: 0,
            line: 1,
            col: 1,
            stack: Vec::new(),
            calls: Vec::new(),
            states: Vec::new(),
            checks: Vec::new(),
            handlers: Vec::new(),
            regs: std::array::from_fn(|_| Value::Unit),
            status: Status::Good,
            pc: 0,
            errs: Vec::new(),
            hints: DefuncHints::Empty,
            hints_valid_offset: 0,
            hint_stack: Vec::new(),
        }
    }

    /// Drive dispatch to completion.
    pub(crate) fn run(&mut self, source_name: Option<&str>) -> Result<Value, String> {
        loop {
            if self.status == Status::Failed {
                let err = match self.errs.pop() {
                    Some(e) => e,
                    None => unreachable!("machine failed without an error"),
                };
                return Err(err.reify(&self.input).pretty(source_name, &self.input));
            }
            if self.pc < self.instrs.len() {
                let instrs = self.instrs;
                instrs[self.pc].exec(self);
            } else if self.calls.is_empty() {
                return Ok(self.pop());
            } else {
                self.ret();
            }
        }
    }

    /// The whole program, for instructions that address a sibling's
    /// scratch by resolved position.
    pub(crate) fn program(&self) -> &'p [Instr] {
        self.instrs
    }

    // Operand stack

    pub(crate) fn push(&mut self, v: Value) {
        self.stack.push(v);
    }

    pub(crate) fn pop(&mut self) -> Value {
        match self.stack.pop() {
            Some(v) => v,
            None => unreachable!("operand stack underflow"),
        }
    }

    pub(crate) fn peek_mut(&mut self) -> &mut Value {
        match self.stack.last_mut() {
            Some(v) => v,
            None => unreachable!("operand stack underflow"),
        }
    }

    // Input

    pub(crate) fn current_char(&self) -> Option<char> {
        self.input.get(self.offset)
    }

    /// Advance one character, maintaining the line and column. A newline
    /// starts the next line; a tab moves the column to the next multiple
    /// of four, plus one.
    pub(crate) fn consume_char(&mut self) -> char {
        let c = self.input.char_at(self.offset);
        self.offset += 1;
        match c {
            '\n' => {
                self.line += 1;
                self.col = 1;
            }
            '\t' => self.col += 4 - ((self.col - 1) % 4),
            _ => self.col += 1,
        }
        c
    }

    /// Bulk advance when the caller guarantees no newlines or tabs.
    pub(crate) fn fast_unchecked_consume(&mut self, n: usize) {
        self.offset += n;
        self.col += n;
    }

    // Control

    pub(crate) fn call(&mut self, target: usize) {
        self.calls.push(self.pc + 1);
        self.pc = target;
    }

    pub(crate) fn ret(&mut self) {
        match self.calls.pop() {
            Some(ret) => self.pc = ret,
            None => unreachable!("return with no call frame"),
        }
    }

    pub(crate) fn push_handler(&mut self, pc: usize) {
        self.handlers.push(Handler {
            depth: self.calls.len(),
            pc,
            stack_sz: self.stack.len(),
            errs_sz: self.errs.len(),
        });
    }

    /// Fail with a fresh error, decorated with the current hints when
    /// they are valid for the error's position.
    pub(crate) fn fail_with(&mut self, err: DefuncError) {
        let err = self.use_hints(err);
        self.errs.push(err);
        self.fail();
    }

    /// Unwind to the nearest recovery point, or terminate the parse.
    pub(crate) fn fail(&mut self) {
        match self.handlers.pop() {
            Some(h) => {
                self.calls.truncate(h.depth);
                self.stack.truncate(h.stack_sz);
                self.collapse_errors(h.errs_sz + 1);
                self.pc = h.pc;
                self.status = Status::Recover;
            }
            None => {
                self.collapse_errors(1);
                self.status = Status::Failed;
            }
        }
    }

    fn collapse_errors(&mut self, floor: usize) {
        while self.errs.len() > floor {
            let b = self.errs.pop().unwrap_or_else(|| unreachable!());
            let a = self.errs.pop().unwrap_or_else(|| unreachable!());
            self.errs.push(DefuncError::Merged(Box::new(a), Box::new(b)));
        }
    }

    // Backtracking state

    pub(crate) fn push_check(&mut self) {
        self.checks.push(self.offset);
    }

    pub(crate) fn pop_check(&mut self) -> usize {
        match self.checks.pop() {
            Some(c) => c,
            None => unreachable!("check stack underflow"),
        }
    }

    pub(crate) fn refresh_check(&mut self) {
        match self.checks.last_mut() {
            Some(c) => *c = self.offset,
            None => unreachable!("check stack underflow"),
        }
    }

    pub(crate) fn save_state(&mut self) {
        self.states.push((self.offset, self.line, self.col));
    }

    pub(crate) fn restore_state(&mut self) {
        let (offset, line, col) = self.discard_state();
        self.offset = offset;
        self.line = line;
        self.col = col;
    }

    pub(crate) fn discard_state(&mut self) -> (usize, usize, usize) {
        match self.states.pop() {
            Some(s) => s,
            None => unreachable!("state stack underflow"),
        }
    }

    // Hints

    fn use_hints(&self, err: DefuncError) -> DefuncError {
        if self.hints_valid_offset == err.offset() && !self.hints.is_empty() {
            DefuncError::WithHints(Box::new(err), self.hints.clone())
        } else {
            err
        }
    }

    pub(crate) fn save_hints(&mut self, shadow: bool) {
        self.hint_stack.push((self.hints.clone(), self.hints_valid_offset));
        if !shadow {
            self.hints = DefuncHints::Empty;
            self.hints_valid_offset = self.offset;
        }
    }

    pub(crate) fn restore_hints(&mut self) {
        if let Some((hints, off)) = self.hint_stack.pop() {
            self.hints = hints;
            self.hints_valid_offset = off;
        }
    }

    pub(crate) fn commit_hints(&mut self) {
        self.hint_stack.pop();
    }

    pub(crate) fn merge_hints(&mut self) {
        if let Some((saved, off)) = self.hint_stack.pop() {
            if off == self.hints_valid_offset {
                let current = std::mem::take(&mut self.hints);
                self.hints = DefuncHints::Merge(Box::new(saved), Box::new(current));
            }
        }
    }

    /// Fold the top error into the hint buffer and drop it. Only trivial
    /// errors with expectations at the current offset contribute; stale
    /// hints are cleared first.
    pub(crate) fn add_error_to_hints(&mut self) {
        let err = match self.errs.pop() {
            Some(e) => e,
            None => return,
        };
        let reified = err.reify(&self.input);
        if let ParseError::Trivial { offset, ref expecteds, .. } = reified {
            if offset == self.offset && !expecteds.is_empty() {
                if self.hints_valid_offset != self.offset {
                    self.hints = DefuncHints::Empty;
                    self.hints_valid_offset = self.offset;
                }
                let previous = std::mem::take(&mut self.hints);
                self.hints = DefuncHints::AddError(Box::new(previous), Box::new(reified));
            }
        }
    }

    // Error construction at the current position

    pub(crate) fn expected_err(&self, expected: Option<crate::error::ErrorItem>) -> DefuncError {
        DefuncError::Expected { offset: self.offset, line: self.line, col: self.col, expected }
    }

    pub(crate) fn empty_err(&self) -> DefuncError {
        DefuncError::Empty { offset: self.offset, line: self.line, col: self.col }
    }

    pub(crate) fn fancy_err(&self, msgs: Vec<String>) -> DefuncError {
        DefuncError::Fancy { offset: self.offset, line: self.line, col: self.col, msgs }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    #[test]
    fn test_trivial_program_returns_top_of_stack() {
        let prog = vec![Instr::Push(Value::Int(7))];
        let mut m = Machine::new(&prog, "");
        assert_eq!(m.run(None), Ok(Value::Int(7)));
    }

    #[test]
    fn test_position_tracking_rules() {
        let prog: Vec<Instr> = Vec::new();
        let mut m = Machine::new(&prog, "ab\tz\nq");
        m.consume_char();
        m.consume_char();
        assert_eq!((m.line, m.col), (1, 3));
        m.consume_char(); // tab: col 3 -> 5
        assert_eq!((m.line, m.col), (1, 5));
        m.consume_char();
        m.consume_char(); // newline
        assert_eq!((m.line, m.col), (2, 1));
        m.consume_char();
        assert_eq!((m.line, m.col), (2, 2));
    }

    #[test]
    fn test_tab_from_column_one() {
        let prog: Vec<Instr> = Vec::new();
        let mut m = Machine::new(&prog, "\tx");
        m.consume_char();
        assert_eq!(m.col, 5);
    }

    #[test]
    fn test_fail_truncates_to_handler_sizes() {
        let prog: Vec<Instr> = Vec::new();
        let mut m = Machine::new(&prog, "abc");
        m.push(Value::Int(1));
        m.push_handler(9);
        m.push(Value::Int(2));
        m.push(Value::Int(3));
        m.errs.push(m.empty_err());
        m.fail();
        assert_eq!(m.status, Status::Recover);
        assert_eq!(m.pc, 9);
        assert_eq!(m.stack.len(), 1);
        assert_eq!(m.errs.len(), 1);
    }

    #[test]
    fn test_recovery_collapses_errors_to_one() {
        let prog: Vec<Instr> = Vec::new();
        let mut m = Machine::new(&prog, "abc");
        m.push_handler(0);
        m.errs.push(m.empty_err());
        m.errs.push(m.empty_err());
        m.errs.push(m.empty_err());
        m.fail();
        assert_eq!(m.errs.len(), 1);
        assert!(matches!(m.errs[0], DefuncError::Merged(_, _)));
    }

    #[test]
    fn test_terminal_failure_reports_error() {
        let prog = vec![Instr::Empty];
        let mut m = Machine::new(&prog, "abc");
        let msg = m.run(None).unwrap_err();
        assert!(msg.contains("line 1, column 1"));
    }

    #[test]
    fn test_hints_survive_save_restore() {
        let prog: Vec<Instr> = Vec::new();
        let mut m = Machine::new(&prog, "abc");
        m.errs.push(m.expected_err(Some(crate::error::ErrorItem::raw("a"))));
        m.add_error_to_hints();
        assert!(!m.hints.is_empty());
        m.save_hints(false);
        assert!(m.hints.is_empty());
        m.restore_hints();
        assert!(!m.hints.is_empty());
    }
}
