//! The typed combinator surface
//!
//! A [`Parser<A>`] is a handle to an immutable description tree plus a
//! cache for its compiled program. Combinator methods build bigger trees;
//! nothing is compiled until [`Parser::parse`] or [`Parser::force`] runs.
//! Cloning a parser clones the handle, and a parser used in two places is
//! compiled once and called as a subroutine.

use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::ast::{Ast, Keep, RecKnot};
use crate::codegen::{compile, Program};
use crate::registers::Reg;
use crate::value::{curry2, Either, Fn1, Fn2, FromValue, IntoValue, Value};
use crate::CompileError;

struct Inner {
    ast: Arc<Ast>,
    impure: bool,
    deep: bool,
    compiled: Mutex<Option<Arc<Program>>>,
}

/// A parser producing values of type `A`.
pub struct Parser<A> {
    inner: Arc<Inner>,
    _marker: PhantomData<fn() -> A>,
}

impl<A> Clone for Parser<A> {
    fn clone(&self) -> Self {
        Parser { inner: Arc::clone(&self.inner), _marker: PhantomData }
    }
}

impl<A> Parser<A> {
    fn from_arc(ast: Arc<Ast>, impure: bool, deep: bool) -> Parser<A> {
        Parser {
            inner: Arc::new(Inner { ast, impure, deep, compiled: Mutex::new(None) }),
            _marker: PhantomData,
        }
    }

    fn from_ast(ast: Ast) -> Parser<A> {
        Self::from_arc(Arc::new(ast), false, false)
    }

    fn ast(&self) -> Arc<Ast> {
        Arc::clone(&self.inner.ast)
    }

    /// Rewrap under a new output type, keeping the compilation flags.
    fn derive<B>(&self, ast: Ast) -> Parser<B> {
        Parser::from_arc(Arc::new(ast), self.inner.impure, self.inner.deep)
    }

    fn derive_with<O, B>(&self, other: &Parser<O>, ast: Ast) -> Parser<B> {
        Parser::from_arc(
            Arc::new(ast),
            self.inner.impure || other.inner.impure,
            self.inner.deep || other.inner.deep,
        )
    }

    // Transformation

    /// Transform the parsed value.
    pub fn map<B, F>(self, f: F) -> Parser<B>
    where
        A: FromValue + 'static,
        B: IntoValue + 'static,
        F: Fn(A) -> B + Send + Sync + 'static,
    {
        let f = Arc::new(move |v: Value| f(A::from_value(v)).into_value());
        self.derive(Ast::Map { p: self.ast(), f })
    }

    /// Replace the parsed value with a constant.
    pub fn to<B>(self, value: B) -> Parser<B>
    where
        B: IntoValue + 'static,
    {
        let v = value.into_value();
        let f = Arc::new(move |_: Value| v.clone());
        self.derive(Ast::Map { p: self.ast(), f })
    }

    /// Combine with a second parser through a binary function.
    pub fn map2<B, C, F>(self, other: Parser<B>, f: F) -> Parser<C>
    where
        A: FromValue + 'static,
        B: FromValue + 'static,
        C: IntoValue + 'static,
        F: Fn(A, B) -> C + Send + Sync + 'static,
    {
        let f = curry2(move |a, b| f(A::from_value(a), B::from_value(b)).into_value());
        let partial = Ast::Map { p: self.ast(), f };
        let ast = Ast::Ap { f: Arc::new(partial), x: other.ast() };
        self.derive_with(&other, ast)
    }

    // Sequencing

    /// Run this parser, then `other`, producing both results.
    pub fn then<B>(self, other: Parser<B>) -> Parser<(A, B)> {
        let pair = curry2(|a, b| Value::Pair(Box::new(a), Box::new(b)));
        let partial = Ast::Map { p: self.ast(), f: pair };
        let ast = Ast::Ap { f: Arc::new(partial), x: other.ast() };
        self.derive_with(&other, ast)
    }

    /// Run both parsers, keeping only this one's result.
    pub fn then_ignore<B>(self, other: Parser<B>) -> Parser<A> {
        let ast = Ast::Seq { first: self.ast(), second: other.ast(), keep: Keep::First };
        self.derive_with(&other, ast)
    }

    /// Run both parsers, keeping only the other's result.
    pub fn ignore_then<B>(self, other: Parser<B>) -> Parser<B> {
        let ast = Ast::Seq { first: self.ast(), second: other.ast(), keep: Keep::Second };
        self.derive_with(&other, ast)
    }

    // Choice

    /// Try this parser; if it fails without consuming input, try `other`.
    ///
    /// A branch that fails after consuming input commits the whole choice
    /// to that failure; wrap the branch in [`Parser::attempt`] to allow
    /// the alternative a clean look at the input.
    pub fn or(self, other: Parser<A>) -> Parser<A> {
        let ast = Ast::Alt { left: self.ast(), right: other.ast() };
        self.derive_with(&other, ast)
    }

    /// Roll the input position back if this parser fails part-way in.
    pub fn attempt(self) -> Parser<A> {
        self.derive(Ast::Attempt(self.ast()))
    }

    /// Parse without consuming: on success the input position is
    /// restored; a failure is reported as if the parser ran bare.
    pub fn look_ahead(self) -> Parser<A> {
        self.derive(Ast::Look(self.ast()))
    }

    /// Succeed with `()` exactly when this parser fails, consuming
    /// nothing either way.
    pub fn not_followed_by(self) -> Parser<()> {
        self.derive(Ast::NotFollowedBy(self.ast()))
    }

    // Repetition

    /// Zero or more occurrences, collected in order.
    pub fn many(self) -> Parser<Vec<A>> {
        self.derive(Ast::Many(self.ast()))
    }

    /// One or more occurrences, collected in order.
    pub fn many1(self) -> Parser<Vec<A>> {
        let cons = curry2(|x, xs| match xs {
            Value::List(mut v) => {
                v.insert(0, x);
                Value::List(v)
            }
            other => unreachable!("repetition produced {:?}", other),
        });
        let partial = Ast::Map { p: self.ast(), f: cons };
        let rest = Ast::Many(self.ast());
        self.derive(Ast::Ap { f: Arc::new(partial), x: Arc::new(rest) })
    }

    /// Zero or more occurrences, discarding the results.
    pub fn skip_many(self) -> Parser<()> {
        self.derive(Ast::SkipMany(self.ast()))
    }

    // Errors

    /// Name the construct this parser recognises. On a failure that
    /// consumed nothing, the error's expected items become this label.
    pub fn label(self, name: &str) -> Parser<A> {
        self.derive(Ast::Label { p: self.ast(), name: name.to_string() })
    }

    /// Strip this parser's expected items from error messages.
    pub fn hide(self) -> Parser<A> {
        self.label("")
    }

    /// Attach an explanatory note to failures that consumed nothing.
    pub fn explain(self, reason: &str) -> Parser<A> {
        self.derive(Ast::Reason { p: self.ast(), reason: reason.to_string() })
    }

    // Validation

    /// Fail silently unless the predicate holds.
    pub fn filter<F>(self, pred: F) -> Parser<A>
    where
        A: FromValue + 'static,
        F: Fn(&A) -> bool + Send + Sync + 'static,
    {
        let pred = Arc::new(move |v: &Value| pred(&A::from_value(v.clone())));
        self.derive(Ast::Filter { p: self.ast(), pred })
    }

    /// Reject values the function maps to a reason, reporting it as a
    /// note on the error.
    pub fn filter_out<F>(self, f: F) -> Parser<A>
    where
        A: FromValue + 'static,
        F: Fn(&A) -> Option<String> + Send + Sync + 'static,
    {
        let reason = Arc::new(move |v: &Value| f(&A::from_value(v.clone())));
        self.derive(Ast::FilterOut { p: self.ast(), reason })
    }

    /// Reject values the function maps to messages, failing with them.
    pub fn guard_against<F>(self, f: F) -> Parser<A>
    where
        A: FromValue + 'static,
        F: Fn(&A) -> Option<Vec<String>> + Send + Sync + 'static,
    {
        let check = Arc::new(move |v: &Value| f(&A::from_value(v.clone())));
        self.derive(Ast::GuardAgainst { p: self.ast(), check })
    }

    /// Parse a value, then always fail with the message built from it.
    pub fn fail_using<B, F>(self, f: F) -> Parser<B>
    where
        A: FromValue + 'static,
        F: Fn(&A) -> String + Send + Sync + 'static,
    {
        let msgs = Arc::new(move |v: &Value| vec![f(&A::from_value(v.clone()))]);
        self.derive(Ast::FastFail { p: self.ast(), msgs })
    }

    /// Parse a value, then always fail naming it as unexpected.
    pub fn unexpected_using<B, F>(self, f: F) -> Parser<B>
    where
        A: FromValue + 'static,
        F: Fn(&A) -> String + Send + Sync + 'static,
    {
        let item = Arc::new(move |v: &Value| f(&A::from_value(v.clone())));
        self.derive(Ast::FastUnexpected { p: self.ast(), item })
    }

    // Compilation and execution

    /// Disable the compile-time rewrites that run or discard user
    /// functions: pure application folding, `pure(x).or(..)`
    /// short-circuiting, constant branch/if dispatch and constant filter
    /// folding. Structural identities over `empty` are unaffected. Use
    /// this when mapped functions have observable effects.
    pub fn impure(self) -> Parser<A> {
        Parser::from_arc(self.ast(), true, self.inner.deep)
    }

    /// Compile with the explicit work-stack driver. The output is
    /// identical; the host call stack stays shallow, which matters for
    /// machine-generated grammars thousands of nodes deep.
    pub fn overflows(self) -> Parser<A> {
        Parser::from_arc(self.ast(), self.inner.impure, true)
    }

    /// Compile now, caching the program for later parses.
    pub fn force(&self) -> crate::Result<()> {
        self.compiled().map(|_| ())
    }

    /// A private copy of the compiled program, for driving the machine
    /// directly or handing to another thread.
    pub fn program(&self) -> crate::Result<Program> {
        Ok(self.compiled()?.clone_for_thread())
    }

    fn compiled(&self) -> Result<Arc<Program>, CompileError> {
        let mut cache = self.inner.compiled.lock();
        if let Some(prog) = &*cache {
            return Ok(Arc::clone(prog));
        }
        let prog = Arc::new(compile(&self.inner.ast, self.inner.impure, self.inner.deep)?);
        *cache = Some(Arc::clone(&prog));
        Ok(prog)
    }

    /// Parse an input string.
    ///
    /// Success does not require consuming the whole input; sequence with
    /// [`eof`] when it should. The `Err` string is the rendered error
    /// message, for grammar mistakes and parse failures alike.
    pub fn parse(&self, input: &str) -> Result<A, String>
    where
        A: FromValue,
    {
        let prog = self.compiled().map_err(|e| e.to_string())?;
        prog.run_shared(input, None).map(A::from_value)
    }

    /// As [`Parser::parse`], naming the input source in error messages.
    pub fn parse_named(&self, input: &str, source_name: &str) -> Result<A, String>
    where
        A: FromValue,
    {
        let prog = self.compiled().map_err(|e| e.to_string())?;
        prog.run_shared(input, Some(source_name)).map(A::from_value)
    }
}

// Constructors

/// Succeed with a value, consuming nothing.
pub fn pure<A: IntoValue>(value: A) -> Parser<A> {
    Parser::from_ast(Ast::Pure(value.into_value()))
}

/// Match one specific character.
pub fn just(c: char) -> Parser<char> {
    Parser::from_ast(Ast::CharTok(c))
}

/// Match an exact string. On a partial match the matched prefix stays
/// consumed, so alternation treats the failure as committed.
pub fn string(s: &str) -> Parser<String> {
    Parser::from_ast(Ast::StringTok(s.to_string()))
}

/// Match any character satisfying the predicate.
pub fn satisfy<F>(pred: F) -> Parser<char>
where
    F: Fn(char) -> bool + Send + Sync + 'static,
{
    Parser::from_ast(Ast::Satisfy { pred: Arc::new(pred), expected: None })
}

/// Fail silently.
pub fn empty<A>() -> Parser<A> {
    Parser::from_ast(Ast::Empty)
}

/// Fail with a message.
pub fn fail<A>(msg: &str) -> Parser<A> {
    Parser::from_ast(Ast::Fail(vec![msg.to_string()]))
}

/// Fail naming an unexpected item.
pub fn unexpected<A>(item: &str) -> Parser<A> {
    Parser::from_ast(Ast::Unexpected(item.to_string()))
}

/// The current line number, 1-based.
pub fn line() -> Parser<i64> {
    Parser::from_ast(Ast::Line)
}

/// The current column number, 1-based.
pub fn col() -> Parser<i64> {
    Parser::from_ast(Ast::Col)
}

/// Succeed only at the end of the input.
pub fn eof() -> Parser<()> {
    satisfy(|_| true).not_followed_by().label("end of input")
}

/// Tie a recursive grammar: the closure receives a placeholder standing
/// for the parser being defined and must return its body.
///
/// ```rust
/// use chervil::{just, pure, recursive, Parser};
///
/// // matches a^n b^n
/// let p: Parser<()> = recursive(|p| {
///     just('a').ignore_then(p).then_ignore(just('b')).or(pure(()))
/// });
/// assert!(p.parse("aabb").is_ok());
/// ```
pub fn recursive<A, F>(f: F) -> Parser<A>
where
    F: FnOnce(Parser<A>) -> Parser<A>,
{
    let knot = Arc::new(RecKnot { body: Mutex::new(None) });
    let placeholder: Parser<A> =
        Parser::from_arc(Arc::new(Ast::Rec(Arc::clone(&knot))), false, false);
    let body = f(placeholder.clone());
    *knot.body.lock() = Some(body.ast());
    Parser::from_arc(placeholder.ast(), body.inner.impure, body.inner.deep)
}

/// First successful parser of the lot, associating to the right.
pub fn choice<A>(parsers: impl IntoIterator<Item = Parser<A>>) -> Parser<A> {
    let mut acc: Parser<A> = empty();
    let collected: Vec<Parser<A>> = parsers.into_iter().collect();
    for p in collected.into_iter().rev() {
        acc = p.or(acc);
    }
    acc
}

/// Dispatch on a parsed boolean.
pub fn if_then_else<A>(cond: Parser<bool>, then_p: Parser<A>, else_p: Parser<A>) -> Parser<A> {
    let ast = Ast::IfElse { cond: cond.ast(), then_p: then_p.ast(), else_p: else_p.ast() };
    Parser::from_arc(
        Arc::new(ast),
        cond.inner.impure || then_p.inner.impure || else_p.inner.impure,
        cond.inner.deep || then_p.inner.deep || else_p.inner.deep,
    )
}

/// Dispatch on a parsed either: the matching side's function is applied
/// to the payload.
pub fn branch<A, B, C>(
    scrut: Parser<Either<A, B>>,
    left: Parser<Fn1<A, C>>,
    right: Parser<Fn1<B, C>>,
) -> Parser<C> {
    let ast = Ast::Branch { scrut: scrut.ast(), left: left.ast(), right: right.ast() };
    Parser::from_arc(
        Arc::new(ast),
        scrut.inner.impure || left.inner.impure || right.inner.impure,
        scrut.inner.deep || left.inner.deep || right.inner.deep,
    )
}

/// One or more `p` joined by left-associative binary operators.
pub fn chain_left1<A>(p: Parser<A>, op: Parser<Fn2<A, A, A>>) -> Parser<A> {
    let ast = Ast::Chainl { p: p.ast(), op: op.ast() };
    p.derive_with(&op, ast)
}

/// One or more `p` joined by right-associative binary operators.
pub fn chain_right1<A>(p: Parser<A>, op: Parser<Fn2<A, A, A>>) -> Parser<A> {
    let ast = Ast::Chainr { p: p.ast(), op: op.ast(), wrap: Arc::new(|v: Value| v) };
    p.derive_with(&op, ast)
}

/// `p` followed by any number of postfix operators, applied in order.
pub fn postfix<A>(p: Parser<A>, op: Parser<Fn1<A, A>>) -> Parser<A> {
    let ast = Ast::ChainPost { p: p.ast(), op: op.ast() };
    p.derive_with(&op, ast)
}

/// Any number of prefix operators followed by `p`, applied inside-out.
pub fn prefix<A>(op: Parser<Fn1<A, A>>, p: Parser<A>) -> Parser<A> {
    let ast = Ast::ChainPre { op: op.ast(), p: p.ast() };
    p.derive_with(&op, ast)
}

/// One or more `p` separated by `sep`, allowing a trailing separator.
pub fn sep_end_by1<A, S>(p: Parser<A>, sep: Parser<S>) -> Parser<Vec<A>> {
    let ast = Ast::SepEndBy1 { p: p.ast(), sep: sep.ast() };
    p.derive_with(&sep, ast)
}

/// Collect `p` until `end` matches; `end`'s result is discarded.
pub fn many_until<A, E>(p: Parser<A>, end: Parser<E>) -> Parser<Vec<A>> {
    let ast = Ast::ManyUntil { p: p.ast(), end: end.ast() };
    p.derive_with(&end, ast)
}

// Register combinators

impl<A> Reg<A> {
    /// Read the register. Store a value with [`Reg::put`] or [`Reg::set`]
    /// before the first read; an unwritten slot holds the unit value.
    pub fn get(&self) -> Parser<A> {
        Parser::from_ast(Ast::GetReg(Arc::clone(&self.cell)))
    }

    /// Parse a value and store it, producing `()`.
    pub fn put(&self, p: Parser<A>) -> Parser<()> {
        p.derive(Ast::PutReg { reg: Arc::clone(&self.cell), p: p.ast() })
    }

    /// Store a constant.
    pub fn set(&self, value: A) -> Parser<()>
    where
        A: IntoValue,
    {
        self.put(pure(value))
    }

    /// Apply a function to the stored value.
    pub fn modify<F>(&self, f: F) -> Parser<()>
    where
        A: FromValue + IntoValue + 'static,
        F: Fn(A) -> A + Send + Sync + 'static,
    {
        self.put(self.get().map(f))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn test_parser_handles_are_shareable() {
        assert_send_sync::<Parser<i64>>();
        assert_send_sync::<Program>();
    }

    #[test]
    fn test_pure_never_consumes_never_fails() {
        let p = pure(5i64);
        assert_eq!(p.parse(""), Ok(5));
        assert_eq!(p.parse("anything"), Ok(5));
    }

    #[test]
    fn test_map_and_then() {
        let p = just('a').then(just('b')).map(|(a, b)| format!("{}{}", a, b));
        assert_eq!(p.parse("ab"), Ok("ab".to_string()));
    }

    #[test]
    fn test_force_is_idempotent() {
        let p = just('a').many();
        p.force().unwrap();
        p.force().unwrap();
        assert_eq!(p.parse("aa"), Ok(vec!['a', 'a']));
    }

    #[test]
    fn test_compile_error_surfaces_through_parse() {
        let p = pure(1i64).many();
        let err = p.parse("x").unwrap_err();
        assert!(err.contains("consumes no input"), "{}", err);
    }

    #[test]
    fn test_choice_builds_right_nested() {
        let p = choice([just('a'), just('b')]);
        assert_eq!(p.parse("b"), Ok('b'));
    }

    #[test]
    fn test_register_get_put() {
        let r: Reg<i64> = Reg::new();
        let p = r.set(3).ignore_then(r.modify(|n| n * 2)).ignore_then(r.get());
        assert_eq!(p.parse(""), Ok(6));
    }
}
