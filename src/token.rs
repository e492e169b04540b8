//! Lexeme helpers built from the combinator surface
//!
//! Nothing here is primitive: these are ordinary grammars over the core
//! combinators, provided because almost every textual grammar wants them.

use crate::parser::{satisfy, string, Parser};

/// One ASCII digit.
pub fn digit() -> Parser<char> {
    satisfy(|c| c.is_ascii_digit()).label("digit")
}

/// An unsigned decimal integer.
pub fn natural() -> Parser<i64> {
    digit()
        .many1()
        .map(|digits| digits.iter().fold(0i64, |n, c| n * 10 + (*c as i64 - '0' as i64)))
        .label("natural number")
}

/// Skip any run of whitespace.
pub fn whitespace() -> Parser<()> {
    satisfy(char::is_whitespace).skip_many().hide()
}

/// `p` followed by skipped trailing whitespace.
pub fn lexeme<A>(p: Parser<A>) -> Parser<A> {
    p.then_ignore(whitespace())
}

/// An exact string with trailing whitespace skipped.
pub fn symbol(s: &str) -> Parser<String> {
    lexeme(string(s))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_natural_parses_digits() {
        assert_eq!(natural().parse("407x"), Ok(407));
        assert!(natural().parse("x").is_err());
    }

    #[test]
    fn test_natural_names_itself() {
        let err = natural().parse("x").unwrap_err();
        assert!(err.contains("natural number"), "{}", err);
    }

    #[test]
    fn test_lexeme_skips_trailing_space() {
        let p = lexeme(natural()).then(natural());
        assert_eq!(p.parse("12   34"), Ok((12, 34)));
    }

    #[test]
    fn test_symbol() {
        let p = symbol("let").then(natural());
        assert_eq!(p.parse("let 7"), Ok(("let".to_string(), 7)));
    }
}
