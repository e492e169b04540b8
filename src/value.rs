//! Dynamic values for the machine's operand stack
//!
//! The operand stack is heterogeneous: one parse can push characters,
//! numbers, lists and partially-applied functions. The typed surface in
//! [`crate::parser`] converts at the boundary, so inside the machine a
//! value mismatch means a compiler bug rather than a user error.

use std::fmt;
use std::sync::Arc;

/// A function value living on the operand stack.
pub type ValueFn = Arc<dyn Fn(Value) -> Value + Send + Sync>;

/// Either-style sum used by the selective combinators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Either<L, R> {
    Left(L),
    Right(R),
}

/// A dynamically typed runtime value.
#[derive(Clone)]
pub enum Value {
    Unit,
    Bool(bool),
    Int(i64),
    Float(f64),
    Char(char),
    Str(String),
    List(Vec<Value>),
    Pair(Box<Value>, Box<Value>),
    Left(Box<Value>),
    Right(Box<Value>),
    Func(ValueFn),
}

impl Value {
    /// Wrap a unary closure.
    pub fn func<F>(f: F) -> Value
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        Value::Func(Arc::new(f))
    }

    /// Wrap a binary closure as a curried function value.
    pub fn func2<F>(f: F) -> Value
    where
        F: Fn(Value, Value) -> Value + Send + Sync + 'static,
    {
        Value::Func(curry2(f))
    }

    /// The identity function value.
    pub fn identity() -> Value {
        Value::func(|v| v)
    }

    /// Compose two function values: `f.compose(g)` is `x -> f(g(x))`.
    pub fn compose(self, g: Value) -> Value {
        Value::func(move |x| self.clone().apply(g.clone().apply(x)))
    }

    /// Apply a function value to an argument.
    pub fn apply(self, arg: Value) -> Value {
        match self {
            Value::Func(f) => f(arg),
            other => mismatch("function", &other),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Unit => write!(f, "Unit"),
            Value::Bool(b) => write!(f, "Bool({})", b),
            Value::Int(n) => write!(f, "Int({})", n),
            Value::Float(x) => write!(f, "Float({})", x),
            Value::Char(c) => write!(f, "Char({:?})", c),
            Value::Str(s) => write!(f, "Str({:?})", s),
            Value::List(xs) => f.debug_tuple("List").field(xs).finish(),
            Value::Pair(a, b) => f.debug_tuple("Pair").field(a).field(b).finish(),
            Value::Left(x) => f.debug_tuple("Left").field(x).finish(),
            Value::Right(x) => f.debug_tuple("Right").field(x).finish(),
            Value::Func(_) => write!(f, "Func(..)"),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Unit, Value::Unit) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Char(a), Value::Char(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Pair(a, b), Value::Pair(c, d)) => a == c && b == d,
            (Value::Left(a), Value::Left(b)) => a == b,
            (Value::Right(a), Value::Right(b)) => a == b,
            // Functions compare by pointer: good enough for tests.
            (Value::Func(a), Value::Func(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// Curry a binary closure into a chain of unary function values.
pub(crate) fn curry2<F>(f: F) -> ValueFn
where
    F: Fn(Value, Value) -> Value + Send + Sync + 'static,
{
    let f = Arc::new(f);
    Arc::new(move |a| {
        let f = Arc::clone(&f);
        Value::Func(Arc::new(move |b| f(a.clone(), b)))
    })
}

#[cold]
fn mismatch(expected: &str, got: &Value) -> ! {
    panic!("machine invariant broken: expected {} value, got {:?}", expected, got)
}

/// Conversion from a concrete type into a machine value.
pub trait IntoValue {
    fn into_value(self) -> Value;
}

/// Conversion from a machine value back into a concrete type.
///
/// The typed builder API only composes well-typed trees, so these
/// conversions never fail at runtime.
pub trait FromValue: Sized {
    fn from_value(v: Value) -> Self;
}

macro_rules! simple_value {
    ($ty:ty, $variant:ident, $name:expr) => {
        impl IntoValue for $ty {
            fn into_value(self) -> Value {
                Value::$variant(self)
            }
        }
        impl FromValue for $ty {
            fn from_value(v: Value) -> Self {
                match v {
                    Value::$variant(x) => x,
                    other => mismatch($name, &other),
                }
            }
        }
    };
}

simple_value!(bool, Bool, "bool");
simple_value!(i64, Int, "integer");
simple_value!(f64, Float, "float");
simple_value!(char, Char, "char");
simple_value!(String, Str, "string");

impl IntoValue for () {
    fn into_value(self) -> Value {
        Value::Unit
    }
}

impl FromValue for () {
    fn from_value(v: Value) -> Self {
        match v {
            Value::Unit => (),
            other => mismatch("unit", &other),
        }
    }
}

impl IntoValue for Value {
    fn into_value(self) -> Value {
        self
    }
}

impl FromValue for Value {
    fn from_value(v: Value) -> Self {
        v
    }
}

impl<T: IntoValue> IntoValue for Vec<T> {
    fn into_value(self) -> Value {
        Value::List(self.into_iter().map(IntoValue::into_value).collect())
    }
}

impl<T: FromValue> FromValue for Vec<T> {
    fn from_value(v: Value) -> Self {
        match v {
            Value::List(xs) => xs.into_iter().map(FromValue::from_value).collect(),
            other => mismatch("list", &other),
        }
    }
}

impl<A: IntoValue, B: IntoValue> IntoValue for (A, B) {
    fn into_value(self) -> Value {
        Value::Pair(Box::new(self.0.into_value()), Box::new(self.1.into_value()))
    }
}

impl<A: FromValue, B: FromValue> FromValue for (A, B) {
    fn from_value(v: Value) -> Self {
        match v {
            Value::Pair(a, b) => (A::from_value(*a), B::from_value(*b)),
            other => mismatch("pair", &other),
        }
    }
}

impl<L: IntoValue, R: IntoValue> IntoValue for Either<L, R> {
    fn into_value(self) -> Value {
        match self {
            Either::Left(l) => Value::Left(Box::new(l.into_value())),
            Either::Right(r) => Value::Right(Box::new(r.into_value())),
        }
    }
}

impl<L: FromValue, R: FromValue> FromValue for Either<L, R> {
    fn from_value(v: Value) -> Self {
        match v {
            Value::Left(l) => Either::Left(L::from_value(*l)),
            Value::Right(r) => Either::Right(R::from_value(*r)),
            other => mismatch("either", &other),
        }
    }
}

/// A typed wrapper around a unary function value.
///
/// Parsers cannot carry bare Rust closures as their output type, so
/// function-producing parsers (the selective and chain combinators)
/// traffic in `Fn1`/`Fn2` instead.
#[derive(Clone)]
pub struct Fn1<A, B> {
    f: ValueFn,
    _marker: std::marker::PhantomData<fn(A) -> B>,
}

impl<A: FromValue, B: IntoValue> Fn1<A, B> {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(A) -> B + Send + Sync + 'static,
    {
        Fn1 {
            f: Arc::new(move |v| f(A::from_value(v)).into_value()),
            _marker: std::marker::PhantomData,
        }
    }
}

impl<A, B> IntoValue for Fn1<A, B> {
    fn into_value(self) -> Value {
        Value::Func(self.f)
    }
}

impl<A, B> FromValue for Fn1<A, B> {
    fn from_value(v: Value) -> Self {
        match v {
            Value::Func(f) => Fn1 { f, _marker: std::marker::PhantomData },
            other => mismatch("function", &other),
        }
    }
}

/// A typed wrapper around a curried binary function value.
#[derive(Clone)]
pub struct Fn2<A, B, C> {
    f: ValueFn,
    _marker: std::marker::PhantomData<fn(A, B) -> C>,
}

impl<A: FromValue, B: FromValue, C: IntoValue> Fn2<A, B, C> {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(A, B) -> C + Send + Sync + 'static,
    {
        let f = curry2(move |a, b| f(A::from_value(a), B::from_value(b)).into_value());
        Fn2 { f, _marker: std::marker::PhantomData }
    }
}

impl<A, B, C> IntoValue for Fn2<A, B, C> {
    fn into_value(self) -> Value {
        Value::Func(self.f)
    }
}

impl<A, B, C> FromValue for Fn2<A, B, C> {
    fn from_value(v: Value) -> Self {
        match v {
            Value::Func(f) => Fn2 { f, _marker: std::marker::PhantomData },
            other => mismatch("function", &other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        assert_eq!(i64::from_value(42i64.into_value()), 42);
        assert_eq!(char::from_value('x'.into_value()), 'x');
        assert_eq!(<(i64, char)>::from_value((7i64, 'y').into_value()), (7, 'y'));
        assert_eq!(Vec::<i64>::from_value(vec![1i64, 2, 3].into_value()), vec![1, 2, 3]);
    }

    #[test]
    fn test_func2_curries() {
        let add = Value::func2(|a, b| Value::Int(i64::from_value(a) + i64::from_value(b)));
        let partial = add.apply(Value::Int(2));
        assert_eq!(partial.apply(Value::Int(3)), Value::Int(5));
    }

    #[test]
    fn test_compose_order() {
        let inc = Value::func(|v| Value::Int(i64::from_value(v) + 1));
        let dbl = Value::func(|v| Value::Int(i64::from_value(v) * 2));
        // inc . dbl : double first, then increment
        assert_eq!(inc.compose(dbl).apply(Value::Int(5)), Value::Int(11));
    }

    #[test]
    fn test_either_conversion() {
        let l: Either<i64, char> = Either::Left(9);
        assert_eq!(Either::<i64, char>::from_value(l.clone().into_value()), l);
    }

    #[test]
    fn test_fn2_wrapper() {
        let sub = Fn2::<i64, i64, i64>::new(|a, b| a - b);
        let v = sub.into_value();
        assert_eq!(v.apply(Value::Int(10)).apply(Value::Int(4)), Value::Int(6));
    }
}
