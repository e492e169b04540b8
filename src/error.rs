//! Deferred parse errors and their reification
//!
//! Failures inside the machine are cheap to construct: each one is a small
//! tree node recording what went wrong and where, built in O(1) on the
//! failure path. Only when a parse terminally fails is the tree walked and
//! flattened into a [`ParseError`], which knows how to merge with rivals
//! from other alternatives and how to print itself with a source caret.
//!
//! Hints ride alongside: expectations harvested from alternatives that
//! failed at the current offset, used to enrich whichever error finally
//! surfaces at that same offset.

use std::collections::BTreeSet;
use std::fmt;

/// One item in an "expected ..." or "unexpected ..." clause.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorItem {
    /// A literal slice of input, printed quoted.
    Raw(String),
    /// A human description, printed bare.
    Desc(String),
    /// The end of the input.
    EndOfInput,
}

impl ErrorItem {
    pub fn raw(s: impl Into<String>) -> ErrorItem {
        ErrorItem::Raw(s.into())
    }

    pub fn desc(s: impl Into<String>) -> ErrorItem {
        ErrorItem::Desc(s.into())
    }

    /// Which of two unexpected items to report. End of input beats a
    /// description beats a raw slice; between raw slices the longer wins.
    fn outranks(&self, other: &ErrorItem) -> bool {
        match (self, other) {
            (ErrorItem::EndOfInput, _) => true,
            (_, ErrorItem::EndOfInput) => false,
            (ErrorItem::Desc(_), _) => true,
            (_, ErrorItem::Desc(_)) => false,
            (ErrorItem::Raw(a), ErrorItem::Raw(b)) => a.len() >= b.len(),
        }
    }
}

impl fmt::Display for ErrorItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorItem::Raw(s) => {
                write!(f, "\"")?;
                for c in s.chars() {
                    match c {
                        '\n' => write!(f, "\\n")?,
                        '\t' => write!(f, "\\t")?,
                        '\r' => write!(f, "\\r")?,
                        '\\' => write!(f, "\\\\")?,
                        '"' => write!(f, "\\\"")?,
                        c => write!(f, "{}", c)?,
                    }
                }
                write!(f, "\"")
            }
            ErrorItem::Desc(s) => write!(f, "{}", s),
            ErrorItem::EndOfInput => write!(f, "end of input"),
        }
    }
}

/// Read-only access to single positions of the input, used when a
/// deferred error is reified. Keeps the error algebra independent of how
/// the machine stores its input.
pub trait ItemView {
    fn in_range(&self, offset: usize) -> bool;
    fn char_at(&self, offset: usize) -> char;
    fn substring(&self, offset: usize, size: usize) -> String;
}

/// Read-only access to whole input lines, used by pretty printing.
pub trait LineView {
    fn nearest_newline_before(&self, offset: usize) -> usize;
    fn nearest_newline_after(&self, offset: usize) -> usize;
    fn segment_between(&self, start: usize, end: usize) -> String;
}

/// A deferred parse error. Construction is O(1); [`DefuncError::reify`]
/// walks the tree when a message is actually needed.
#[derive(Debug, Clone)]
pub enum DefuncError {
    /// A single expectation was not met (character/predicate failures).
    Expected {
        offset: usize,
        line: usize,
        col: usize,
        expected: Option<ErrorItem>,
    },
    /// As `Expected`, carrying an explanation.
    ExpectedWithReason {
        offset: usize,
        line: usize,
        col: usize,
        expected: Option<ErrorItem>,
        reason: String,
    },
    /// The unexpected item is known up front instead of read from input.
    Unexpected {
        offset: usize,
        line: usize,
        col: usize,
        expected: Option<ErrorItem>,
        unexpected: ErrorItem,
    },
    /// Free-form failure messages.
    Fancy {
        offset: usize,
        line: usize,
        col: usize,
        msgs: Vec<String>,
    },
    /// A silent failure (the `empty` parser, failed filters).
    Empty {
        offset: usize,
        line: usize,
        col: usize,
    },
    /// As `Empty`, carrying an explanation.
    EmptyWithReason {
        offset: usize,
        line: usize,
        col: usize,
        reason: String,
    },
    /// A string token mismatched. `size` is how much of the input to quote
    /// as the unexpected slice; the slice itself is read at reification.
    StringTok {
        offset: usize,
        line: usize,
        col: usize,
        expected: Option<ErrorItem>,
        size: usize,
    },
    /// Several expectations at once (table dispatch misses).
    MultiExpected {
        offset: usize,
        line: usize,
        col: usize,
        expected: BTreeSet<ErrorItem>,
    },
    /// Two branches both failed; resolved by offset priority at reification.
    Merged(Box<DefuncError>, Box<DefuncError>),
    /// An error decorated with the hints current when it was raised.
    WithHints(Box<DefuncError>, DefuncHints),
    /// An error decorated with an explanation.
    WithReason(Box<DefuncError>, String),
    /// An error whose expectations are rewritten by a label.
    WithLabel(Box<DefuncError>, String),
}

impl DefuncError {
    /// The input offset this error is anchored at. A merge reports the
    /// deeper of its two sides.
    pub fn offset(&self) -> usize {
        match self {
            DefuncError::Expected { offset, .. }
            | DefuncError::ExpectedWithReason { offset, .. }
            | DefuncError::Unexpected { offset, .. }
            | DefuncError::Fancy { offset, .. }
            | DefuncError::Empty { offset, .. }
            | DefuncError::EmptyWithReason { offset, .. }
            | DefuncError::StringTok { offset, .. }
            | DefuncError::MultiExpected { offset, .. } => *offset,
            DefuncError::Merged(a, b) => a.offset().max(b.offset()),
            DefuncError::WithHints(e, _)
            | DefuncError::WithReason(e, _)
            | DefuncError::WithLabel(e, _) => e.offset(),
        }
    }

    /// Flatten the tree into a concrete error.
    pub fn reify(&self, view: &dyn ItemView) -> ParseError {
        match self {
            DefuncError::Expected { offset, line, col, expected } => ParseError::Trivial {
                offset: *offset,
                line: *line,
                col: *col,
                unexpected: unexpected_at(view, *offset, 1),
                expecteds: expected.iter().cloned().collect(),
                reasons: Vec::new(),
            },
            DefuncError::ExpectedWithReason { offset, line, col, expected, reason } => {
                ParseError::Trivial {
                    offset: *offset,
                    line: *line,
                    col: *col,
                    unexpected: unexpected_at(view, *offset, 1),
                    expecteds: expected.iter().cloned().collect(),
                    reasons: vec![reason.clone()],
                }
            }
            DefuncError::Unexpected { offset, line, col, expected, unexpected } => {
                ParseError::Trivial {
                    offset: *offset,
                    line: *line,
                    col: *col,
                    unexpected: Some(unexpected.clone()),
                    expecteds: expected.iter().cloned().collect(),
                    reasons: Vec::new(),
                }
            }
            DefuncError::Fancy { offset, line, col, msgs } => ParseError::Fail {
                offset: *offset,
                line: *line,
                col: *col,
                msgs: msgs.clone(),
            },
            DefuncError::Empty { offset, line, col } => ParseError::Trivial {
                offset: *offset,
                line: *line,
                col: *col,
                unexpected: None,
                expecteds: BTreeSet::new(),
                reasons: Vec::new(),
            },
            DefuncError::EmptyWithReason { offset, line, col, reason } => ParseError::Trivial {
                offset: *offset,
                line: *line,
                col: *col,
                unexpected: None,
                expecteds: BTreeSet::new(),
                reasons: vec![reason.clone()],
            },
            DefuncError::StringTok { offset, line, col, expected, size } => ParseError::Trivial {
                offset: *offset,
                line: *line,
                col: *col,
                unexpected: unexpected_at(view, *offset, *size),
                expecteds: expected.iter().cloned().collect(),
                reasons: Vec::new(),
            },
            DefuncError::MultiExpected { offset, line, col, expected } => ParseError::Trivial {
                offset: *offset,
                line: *line,
                col: *col,
                unexpected: unexpected_at(view, *offset, 1),
                expecteds: expected.clone(),
                reasons: Vec::new(),
            },
            DefuncError::Merged(a, b) => a.reify(view).merge(b.reify(view)),
            DefuncError::WithHints(e, hints) => e.reify(view).with_hints(hints),
            DefuncError::WithReason(e, reason) => e.reify(view).with_reason(reason.clone()),
            DefuncError::WithLabel(e, label) => e.reify(view).with_label(label),
        }
    }
}

fn unexpected_at(view: &dyn ItemView, offset: usize, size: usize) -> Option<ErrorItem> {
    if view.in_range(offset) {
        Some(ErrorItem::Raw(view.substring(offset, size)))
    } else {
        Some(ErrorItem::EndOfInput)
    }
}

/// Deferred hint structure: expectations gathered from alternatives that
/// failed at the current offset.
#[derive(Debug, Clone, Default)]
pub enum DefuncHints {
    #[default]
    Empty,
    Merge(Box<DefuncHints>, Box<DefuncHints>),
    /// Collapse everything below into a single labelled expectation. An
    /// empty label hides the hints instead.
    Replace(String, Box<DefuncHints>),
    /// Drop the most recently added expectation set.
    Pop(Box<DefuncHints>),
    /// A reified trivial error's expectations, appended.
    AddError(Box<DefuncHints>, Box<ParseError>),
}

impl DefuncHints {
    pub fn is_empty(&self) -> bool {
        matches!(self, DefuncHints::Empty)
    }

    /// Yield the expectation sets in the order they were gathered.
    pub fn sets(&self) -> Vec<BTreeSet<ErrorItem>> {
        let mut out = Vec::new();
        self.collect(&mut out);
        out
    }

    fn collect(&self, out: &mut Vec<BTreeSet<ErrorItem>>) {
        match self {
            DefuncHints::Empty => {}
            DefuncHints::Merge(a, b) => {
                a.collect(out);
                b.collect(out);
            }
            DefuncHints::Replace(label, inner) => {
                let mut sub = Vec::new();
                inner.collect(&mut sub);
                if !label.is_empty() && !sub.is_empty() {
                    let mut set = BTreeSet::new();
                    set.insert(ErrorItem::Desc(label.clone()));
                    out.push(set);
                }
            }
            DefuncHints::Pop(inner) => {
                let mut sub = Vec::new();
                inner.collect(&mut sub);
                sub.pop();
                out.extend(sub);
            }
            DefuncHints::AddError(inner, err) => {
                inner.collect(out);
                if let ParseError::Trivial { expecteds, .. } = err.as_ref() {
                    out.push(expecteds.clone());
                }
            }
        }
    }
}

/// A concrete parse error, ready to merge and print.
#[derive(Debug, Clone, PartialEq)]
pub enum ParseError {
    Trivial {
        offset: usize,
        line: usize,
        col: usize,
        unexpected: Option<ErrorItem>,
        expecteds: BTreeSet<ErrorItem>,
        reasons: Vec<String>,
    },
    Fail {
        offset: usize,
        line: usize,
        col: usize,
        msgs: Vec<String>,
    },
}

impl ParseError {
    pub fn offset(&self) -> usize {
        match self {
            ParseError::Trivial { offset, .. } | ParseError::Fail { offset, .. } => *offset,
        }
    }

    pub fn position(&self) -> (usize, usize) {
        match self {
            ParseError::Trivial { line, col, .. } | ParseError::Fail { line, col, .. } => {
                (*line, *col)
            }
        }
    }

    /// Merge two rival errors. The deeper offset wins outright; at equal
    /// offsets a fail beats a trivial, two fails pool their messages and
    /// two trivials pool expectations and reasons, keeping the
    /// higher-ranked unexpected item.
    pub fn merge(self, other: ParseError) -> ParseError {
        if self.offset() > other.offset() {
            return self;
        }
        if other.offset() > self.offset() {
            return other;
        }
        match (self, other) {
            (ParseError::Fail { offset, line, col, mut msgs }, ParseError::Fail { msgs: more, .. }) => {
                for m in more {
                    if !msgs.contains(&m) {
                        msgs.push(m);
                    }
                }
                ParseError::Fail { offset, line, col, msgs }
            }
            (f @ ParseError::Fail { .. }, ParseError::Trivial { .. }) => f,
            (ParseError::Trivial { .. }, f @ ParseError::Fail { .. }) => f,
            (
                ParseError::Trivial { offset, line, col, unexpected, mut expecteds, mut reasons },
                ParseError::Trivial {
                    unexpected: unexpected2,
                    expecteds: expecteds2,
                    reasons: reasons2,
                    ..
                },
            ) => {
                expecteds.extend(expecteds2);
                for r in reasons2 {
                    if !reasons.contains(&r) {
                        reasons.push(r);
                    }
                }
                let unexpected = match (unexpected, unexpected2) {
                    (Some(a), Some(b)) => Some(if a.outranks(&b) { a } else { b }),
                    (a, b) => a.or(b),
                };
                ParseError::Trivial { offset, line, col, unexpected, expecteds, reasons }
            }
        }
    }

    /// Enrich a trivial error with hint expectations; fails pass through.
    pub fn with_hints(self, hints: &DefuncHints) -> ParseError {
        match self {
            ParseError::Trivial { offset, line, col, unexpected, mut expecteds, reasons } => {
                for set in hints.sets() {
                    expecteds.extend(set);
                }
                ParseError::Trivial { offset, line, col, unexpected, expecteds, reasons }
            }
            fail => fail,
        }
    }

    /// Attach an explanation to a trivial error; fails pass through.
    pub fn with_reason(self, reason: String) -> ParseError {
        match self {
            ParseError::Trivial { offset, line, col, unexpected, expecteds, mut reasons } => {
                if !reasons.contains(&reason) {
                    reasons.push(reason);
                }
                ParseError::Trivial { offset, line, col, unexpected, expecteds, reasons }
            }
            fail => fail,
        }
    }

    /// Rewrite a trivial error's expectations to a single label, or hide
    /// them entirely when the label is empty. Fails pass through.
    pub fn with_label(self, label: &str) -> ParseError {
        match self {
            ParseError::Trivial { offset, line, col, unexpected, mut expecteds, reasons } => {
                expecteds.clear();
                if !label.is_empty() {
                    expecteds.insert(ErrorItem::Desc(label.to_string()));
                }
                ParseError::Trivial { offset, line, col, unexpected, expecteds, reasons }
            }
            fail => fail,
        }
    }

    /// Render the error with a position header, the clause lines and the
    /// offending source line with a caret under the failure column.
    pub fn pretty(&self, source_name: Option<&str>, lines: &dyn LineView) -> String {
        let (line, col) = self.position();
        let mut out = match source_name {
            Some(name) => format!("parse error in {} at line {}, column {}:\n", name, line, col),
            None => format!("parse error at line {}, column {}:\n", line, col),
        };
        let mut wrote_clause = false;
        match self {
            ParseError::Trivial { unexpected, expecteds, reasons, .. } => {
                if let Some(u) = unexpected {
                    out.push_str(&format!("  unexpected {}\n", u));
                    wrote_clause = true;
                }
                if !expecteds.is_empty() {
                    out.push_str(&format!("  expected {}\n", join_items(expecteds)));
                    wrote_clause = true;
                }
                for r in reasons {
                    out.push_str(&format!("  note: {}\n", r));
                    wrote_clause = true;
                }
            }
            ParseError::Fail { msgs, .. } => {
                for m in msgs {
                    out.push_str(&format!("  {}\n", m));
                    wrote_clause = true;
                }
            }
        }
        if !wrote_clause {
            out.push_str("  unknown parse error\n");
        }
        let start = lines.nearest_newline_before(self.offset());
        let end = lines.nearest_newline_after(self.offset());
        let text = lines.segment_between(start, end);
        out.push_str("  | ");
        let mut width = 0usize;
        for c in text.chars() {
            if c == '\t' {
                let pad = 4 - (width % 4);
                for _ in 0..pad {
                    out.push(' ');
                }
                width += pad;
            } else {
                out.push(c);
                width += 1;
            }
        }
        out.push_str("\n  | ");
        for _ in 1..col {
            out.push(' ');
        }
        out.push('^');
        out
    }
}

fn join_items(items: &BTreeSet<ErrorItem>) -> String {
    let mut rendered: Vec<String> = items.iter().map(|i| i.to_string()).collect();
    match rendered.len() {
        0 => String::new(),
        1 => rendered.remove(0),
        _ => {
            let last = rendered.pop().unwrap_or_default();
            format!("{} or {}", rendered.join(", "), last)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StrView(Vec<char>);

    impl StrView {
        fn new(s: &str) -> StrView {
            StrView(s.chars().collect())
        }
    }

    impl ItemView for StrView {
        fn in_range(&self, offset: usize) -> bool {
            offset < self.0.len()
        }
        fn char_at(&self, offset: usize) -> char {
            self.0[offset]
        }
        fn substring(&self, offset: usize, size: usize) -> String {
            self.0[offset..(offset + size).min(self.0.len())].iter().collect()
        }
    }

    impl LineView for StrView {
        fn nearest_newline_before(&self, offset: usize) -> usize {
            self.0[..offset.min(self.0.len())]
                .iter()
                .rposition(|&c| c == '\n')
                .map(|i| i + 1)
                .unwrap_or(0)
        }
        fn nearest_newline_after(&self, offset: usize) -> usize {
            self.0[offset.min(self.0.len())..]
                .iter()
                .position(|&c| c == '\n')
                .map(|i| offset + i)
                .unwrap_or(self.0.len())
        }
        fn segment_between(&self, start: usize, end: usize) -> String {
            self.0[start..end].iter().collect()
        }
    }

    fn expected(offset: usize, col: usize, item: &str) -> DefuncError {
        DefuncError::Expected {
            offset,
            line: 1,
            col,
            expected: Some(ErrorItem::raw(item)),
        }
    }

    #[test]
    fn test_deeper_offset_wins() {
        let view = StrView::new("abc");
        let shallow = expected(0, 1, "x").reify(&view);
        let deep = expected(2, 3, "y").reify(&view);
        let merged = shallow.merge(deep.clone());
        assert_eq!(merged, deep);
    }

    #[test]
    fn test_equal_offsets_union() {
        let view = StrView::new("c");
        let a = expected(0, 1, "a").reify(&view);
        let b = expected(0, 1, "b").reify(&view);
        match a.merge(b) {
            ParseError::Trivial { expecteds, unexpected, .. } => {
                assert_eq!(expecteds.len(), 2);
                assert_eq!(unexpected, Some(ErrorItem::raw("c")));
            }
            other => panic!("expected trivial, got {:?}", other),
        }
    }

    #[test]
    fn test_fail_beats_trivial_at_same_offset() {
        let view = StrView::new("c");
        let trivial = expected(0, 1, "a").reify(&view);
        let fail = DefuncError::Fancy { offset: 0, line: 1, col: 1, msgs: vec!["boom".into()] }
            .reify(&view);
        assert_eq!(trivial.merge(fail.clone()), fail);
    }

    #[test]
    fn test_unexpected_priority() {
        assert!(ErrorItem::EndOfInput.outranks(&ErrorItem::desc("thing")));
        assert!(ErrorItem::desc("thing").outranks(&ErrorItem::raw("abc")));
        assert!(ErrorItem::raw("abc").outranks(&ErrorItem::raw("a")));
    }

    #[test]
    fn test_label_rewrites_and_hides() {
        let view = StrView::new("c");
        let err = expected(0, 1, "a").reify(&view);
        match err.clone().with_label("letter") {
            ParseError::Trivial { expecteds, .. } => {
                assert_eq!(expecteds.into_iter().collect::<Vec<_>>(), vec![ErrorItem::desc("letter")]);
            }
            other => panic!("expected trivial, got {:?}", other),
        }
        match err.with_label("") {
            ParseError::Trivial { expecteds, .. } => assert!(expecteds.is_empty()),
            other => panic!("expected trivial, got {:?}", other),
        }
    }

    #[test]
    fn test_label_leaves_fail_alone() {
        let view = StrView::new("c");
        let fail = DefuncError::Fancy { offset: 0, line: 1, col: 1, msgs: vec!["boom".into()] }
            .reify(&view);
        assert_eq!(fail.clone().with_label("ignored"), fail);
    }

    #[test]
    fn test_hints_enrich_trivial() {
        let view = StrView::new("c");
        let base = expected(0, 1, "a").reify(&view);
        let mut set = BTreeSet::new();
        set.insert(ErrorItem::raw("b"));
        let hints = DefuncHints::AddError(
            Box::new(DefuncHints::Empty),
            Box::new(ParseError::Trivial {
                offset: 0,
                line: 1,
                col: 1,
                unexpected: None,
                expecteds: set,
                reasons: Vec::new(),
            }),
        );
        match base.with_hints(&hints) {
            ParseError::Trivial { expecteds, .. } => assert_eq!(expecteds.len(), 2),
            other => panic!("expected trivial, got {:?}", other),
        }
    }

    #[test]
    fn test_hint_replace_and_pop() {
        let triv = |item: &str| {
            Box::new(ParseError::Trivial {
                offset: 0,
                line: 1,
                col: 1,
                unexpected: None,
                expecteds: [ErrorItem::raw(item)].into_iter().collect(),
                reasons: Vec::new(),
            })
        };
        let two = DefuncHints::AddError(
            Box::new(DefuncHints::AddError(Box::new(DefuncHints::Empty), triv("a"))),
            triv("b"),
        );
        assert_eq!(two.sets().len(), 2);
        let replaced = DefuncHints::Replace("item".into(), Box::new(two.clone()));
        assert_eq!(replaced.sets(), vec![[ErrorItem::desc("item")].into_iter().collect()]);
        let hidden = DefuncHints::Replace(String::new(), Box::new(two.clone()));
        assert!(hidden.sets().is_empty());
        let popped = DefuncHints::Pop(Box::new(two));
        assert_eq!(popped.sets(), vec![[ErrorItem::raw("a")].into_iter().collect()]);
    }

    #[test]
    fn test_string_tok_quotes_slice() {
        let view = StrView::new("lemma");
        let err = DefuncError::StringTok {
            offset: 0,
            line: 1,
            col: 1,
            expected: Some(ErrorItem::raw("let")),
            size: 3,
        };
        match err.reify(&view) {
            ParseError::Trivial { unexpected, .. } => {
                assert_eq!(unexpected, Some(ErrorItem::raw("lem")));
            }
            other => panic!("expected trivial, got {:?}", other),
        }
    }

    #[test]
    fn test_pretty_format() {
        let view = StrView::new("abc");
        let err = DefuncError::MultiExpected {
            offset: 1,
            line: 1,
            col: 2,
            expected: [ErrorItem::raw("x"), ErrorItem::raw("y"), ErrorItem::desc("digit")]
                .into_iter()
                .collect(),
        };
        let msg = err.reify(&view).pretty(Some("test"), &view);
        assert_eq!(
            msg,
            "parse error in test at line 1, column 2:\n  unexpected \"b\"\n  expected \"x\", \"y\" or digit\n  | abc\n  |  ^"
        );
    }

    #[test]
    fn test_pretty_at_end_of_input() {
        let view = StrView::new("ab");
        let err = expected(2, 3, "c");
        let msg = err.reify(&view).pretty(None, &view);
        assert!(msg.contains("unexpected end of input"));
        assert!(msg.contains("expected \"c\""));
    }
}
