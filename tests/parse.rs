//! End-to-end tests driving compiled parsers against real inputs.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chervil::{
    chain_left1, chain_right1, choice, col, eof, if_then_else, just, line, many_until, postfix,
    prefix, pure, recursive, satisfy, sep_end_by1, string, token, branch, Either, Fn1, Fn2,
    Parser, Reg,
};

fn digit_value() -> Parser<i64> {
    token::digit().map(|c| c as i64 - '0' as i64)
}

/// Digits with `+`, `*`, parens and unary minus.
fn arithmetic() -> Parser<i64> {
    recursive(|expr| {
        let atom = token::natural()
            .or(just('(').ignore_then(expr.clone()).then_ignore(just(')')));
        let unary = just('-').ignore_then(atom.clone()).map(|n: i64| -n).or(atom);
        let product = chain_left1(unary, just('*').to(Fn2::new(|a: i64, b: i64| a * b)));
        chain_left1(product, just('+').to(Fn2::new(|a: i64, b: i64| a + b)))
    })
}

#[test]
fn test_arithmetic_expressions() {
    let p = arithmetic();
    assert_eq!(p.parse("(2+3)*8"), Ok(40));
    assert_eq!(p.parse("-(3+4)"), Ok(-7));
    assert_eq!(p.parse("1+2*3"), Ok(7));
    assert_eq!(p.parse("(1+2)*(3+4)"), Ok(21));
}

#[test]
fn test_many_stops_cleanly_and_tracks_offset() {
    let p = just('a').many().then(col());
    assert_eq!(p.parse("aaab"), Ok((vec!['a', 'a', 'a'], 4)));
}

#[test]
fn test_choice_takes_either_branch() {
    let p = just('a').or(just('b'));
    assert_eq!(p.parse("b"), Ok('b'));
}

#[test]
fn test_choice_error_unions_expectations() {
    let p = just('a').or(just('b'));
    let msg = p.parse("c").unwrap_err();
    assert_eq!(
        msg,
        "parse error at line 1, column 1:\n  unexpected \"c\"\n  expected \"a\" or \"b\"\n  | c\n  | ^"
    );
}

#[test]
fn test_source_name_appears_in_errors() {
    let p = just('a');
    let msg = p.parse_named("b", "input.txt").unwrap_err();
    assert!(msg.starts_with("parse error in input.txt at line 1, column 1:"), "{}", msg);
}

#[test]
fn test_attempt_allows_overlapping_alternatives() {
    let p = string("let").attempt().or(string("lemma"));
    assert_eq!(p.parse("lemma"), Ok("lemma".to_string()));
    assert_eq!(p.parse("let"), Ok("let".to_string()));
}

#[test]
fn test_without_attempt_the_choice_commits() {
    let p = string("let").or(string("lemma"));
    assert!(p.parse("lemma").is_err());
}

#[test]
fn test_chain_left_associates_left() {
    let p = chain_left1(digit_value(), just('-').to(Fn2::new(|a: i64, b: i64| a - b)));
    assert_eq!(p.parse("1-2-3"), Ok(-4));
    assert_eq!(p.parse("7"), Ok(7));
}

#[test]
fn test_chain_right_associates_right() {
    let p = chain_right1(digit_value(), just('-').to(Fn2::new(|a: i64, b: i64| a - b)));
    assert_eq!(p.parse("1-2-3"), Ok(2));
}

#[test]
fn test_prefix_and_postfix_operators() {
    let neg = prefix(just('-').to(Fn1::new(|n: i64| -n)), token::natural());
    assert_eq!(neg.parse("--3"), Ok(3));
    assert_eq!(neg.parse("-3"), Ok(-3));
    assert_eq!(neg.parse("3"), Ok(3));

    let bump = postfix(token::natural(), just('!').to(Fn1::new(|n: i64| n + 1)));
    assert_eq!(bump.parse("5!!"), Ok(7));
    assert_eq!(bump.parse("5"), Ok(5));
}

#[test]
fn test_sep_end_by_allows_trailing_separator() {
    let p = sep_end_by1(token::natural(), just(','));
    assert_eq!(p.parse("1,2,3"), Ok(vec![1, 2, 3]));
    assert_eq!(p.parse("1,2,3,"), Ok(vec![1, 2, 3]));
    assert_eq!(p.parse("1"), Ok(vec![1]));
    assert!(p.parse("").is_err());
}

#[test]
fn test_many_until_terminator() {
    let p = many_until(satisfy(|_| true), string("*/"));
    assert_eq!(p.parse("ab*/"), Ok(vec!['a', 'b']));
    assert_eq!(p.parse("*/"), Ok(vec![]));
    assert!(p.parse("ab").is_err());
}

#[test]
fn test_counting_brackets_through_a_register() {
    let depth: Reg<i64> = Reg::new();
    let nest: Parser<()> = {
        let depth = depth.clone();
        recursive(move |m| {
            just('(')
                .ignore_then(depth.modify(|n| n + 1))
                .ignore_then(m.clone())
                .then_ignore(just(')'))
                .ignore_then(depth.modify(|n| n - 1))
                .ignore_then(m)
                .or(pure(()))
        })
    };
    let p = depth
        .set(0)
        .ignore_then(nest)
        .then_ignore(eof())
        .ignore_then(depth.get())
        .filter(|n| *n == 0);
    assert_eq!(p.parse("(()())"), Ok(0));
    assert_eq!(p.parse(""), Ok(0));
    assert!(p.parse("(()").is_err());
    assert!(p.parse("())").is_err());
}

#[test]
fn test_recursion_saves_body_local_registers() {
    let r: Reg<i64> = Reg::new();
    let p: Parser<i64> = {
        let r = r.clone();
        recursive(move |m| {
            just('(')
                .ignore_then(r.put(col()))
                .ignore_then(m.clone().or(pure(0)))
                .then_ignore(just(')'))
                .ignore_then(r.get())
        })
    };
    // The inner invocation writes the register too; its exit must restore
    // the outer invocation's value.
    assert_eq!(p.parse("(())"), Ok(2));
}

#[test]
fn test_two_threads_one_compiled_parser() {
    let p = Arc::new(just('a').many().then_ignore(eof()));
    p.force().unwrap();
    let other = Arc::clone(&p);
    let handle = std::thread::spawn(move || other.parse("aaa"));
    let here = p.parse("aaa");
    let there = handle.join().unwrap();
    assert_eq!(here, there);
    assert_eq!(here, Ok(vec!['a', 'a', 'a']));
}

#[test]
fn test_thread_copy_of_program() {
    let p = just('a').many();
    let mut original = p.program().unwrap();
    let mut copy = original.clone_for_thread();
    let handle = std::thread::spawn(move || copy.run("aa", None));
    let here = original.run("aa", None);
    assert_eq!(here, handle.join().unwrap());
}

#[test]
fn test_lookahead_is_nondestructive_on_success() {
    let p = string("ab").look_ahead().then(just('a'));
    assert_eq!(p.parse("ab"), Ok(("ab".to_string(), 'a')));
}

#[test]
fn test_lookahead_failure_behaves_like_the_body() {
    // The lookahead consumes 'a' before failing, so the choice commits.
    let p = string("ab").look_ahead().to(1i64).or(just('a').to(2i64));
    assert!(p.parse("ax").is_err());
}

#[test]
fn test_not_followed_by_guards_keywords() {
    let keyword = string("let").then_ignore(satisfy(|c| c.is_alphanumeric()).not_followed_by());
    assert_eq!(keyword.parse("let "), Ok("let".to_string()));
    assert!(keyword.parse("lets").is_err());
}

#[test]
fn test_eof_names_itself() {
    let p = just('a').then_ignore(eof());
    let msg = p.parse("ab").unwrap_err();
    assert!(msg.contains("unexpected \"b\""), "{}", msg);
    assert!(msg.contains("end of input"), "{}", msg);
}

#[test]
fn test_label_hiding_strips_expectations() {
    let p = just('a').hide();
    let msg = p.parse("b").unwrap_err();
    assert!(msg.contains("unexpected \"b\""), "{}", msg);
    assert!(!msg.contains("expected"), "{}", msg);
}

#[test]
fn test_label_replaces_expectations() {
    let p = token::digit().then(token::digit());
    let msg = p.clone().label("two-digit code").parse("x").unwrap_err();
    assert!(msg.contains("expected two-digit code"), "{}", msg);
    assert!(!msg.contains("digit,"), "{}", msg);
}

#[test]
fn test_hints_from_failed_alternative_enrich_later_errors() {
    let p = just('a').or(pure('z')).then(just('c'));
    let msg = p.parse("b").unwrap_err();
    assert!(msg.contains("\"a\""), "{}", msg);
    assert!(msg.contains("\"c\""), "{}", msg);
}

#[test]
fn test_deeper_failure_wins_across_attempt() {
    let p = just('a').then(just('b')).attempt().or(just('x').then(just('y')));
    let msg = p.parse("ac").unwrap_err();
    // The attempted branch failed at column 2 before rolling back; the
    // other branch failed at column 1, so the deep failure is reported.
    assert!(msg.contains("column 2"), "{}", msg);
    assert!(msg.contains("\"b\""), "{}", msg);
    assert!(!msg.contains("\"x\""), "{}", msg);
}

#[test]
fn test_explain_adds_note() {
    let p = just('a').explain("identifiers start with the letter a");
    let msg = p.parse("b").unwrap_err();
    assert!(msg.contains("note: identifiers start with the letter a"), "{}", msg);
}

#[test]
fn test_guard_against_produces_failure_messages() {
    let p = token::natural().guard_against(|n| {
        (*n > 255).then(|| vec![format!("{} does not fit in a byte", n)])
    });
    assert_eq!(p.parse("200"), Ok(200));
    let msg = p.parse("300").unwrap_err();
    assert!(msg.contains("300 does not fit in a byte"), "{}", msg);
}

#[test]
fn test_position_tracking_with_tabs_and_newlines() {
    let p = satisfy(|c| c != '!').skip_many().ignore_then(line().then(col()));
    assert_eq!(p.parse("ab\tcd\nef"), Ok((2, 3)));
    assert_eq!(p.parse("\t"), Ok((1, 5)));
}

#[test]
fn test_caret_points_at_failure_column() {
    let p = just('a').then(just('b'));
    let msg = p.parse("ax").unwrap_err();
    assert!(msg.ends_with("  | ax\n  |  ^"), "{}", msg);
}

#[test]
fn test_branch_applies_the_matching_side() {
    let scrut = just('L')
        .to(Either::<i64, i64>::Left(1))
        .or(just('R').to(Either::<i64, i64>::Right(2)));
    let p = branch(
        scrut,
        pure(Fn1::new(|n: i64| n * 10)),
        pure(Fn1::new(|n: i64| n * 100)),
    );
    assert_eq!(p.parse("L"), Ok(10));
    assert_eq!(p.parse("R"), Ok(200));
}

#[test]
fn test_if_then_else_dispatches() {
    let cond = just('t').to(true).or(just('f').to(false));
    let p = if_then_else(cond, just('x').to(1i64), just('y').to(2i64));
    assert_eq!(p.parse("tx"), Ok(1));
    assert_eq!(p.parse("fy"), Ok(2));
    assert!(p.parse("ty").is_err());
}

#[test]
fn test_wide_literal_choice_dispatches_and_reports() {
    let p = choice([
        just('a').to(1i64),
        just('b').to(2i64),
        just('c').to(3i64),
        just('d').to(4i64),
    ]);
    assert_eq!(p.parse("c"), Ok(3));
    let msg = p.parse("z").unwrap_err();
    assert!(msg.contains("expected \"a\", \"b\", \"c\" or \"d\""), "{}", msg);
}

#[test]
fn test_parsing_is_deterministic() {
    let p = arithmetic();
    let first = p.parse("(2+3)*8");
    let second = p.parse("(2+3)*8");
    assert_eq!(first, second);
}

#[test]
fn test_force_is_idempotent_and_parse_still_works() {
    let p = arithmetic();
    p.force().unwrap();
    p.force().unwrap();
    assert_eq!(p.parse("1+1"), Ok(2));
}

#[test]
fn test_deep_grammar_compiles_with_stack_driver() {
    // A pathologically nested grammar: ((((...a...))))
    let mut p = just('a').to(0i64);
    for _ in 0..500 {
        p = just('(').ignore_then(p).then_ignore(just(')'));
    }
    let p = p.overflows();
    p.force().unwrap();
    let mut input = String::new();
    for _ in 0..500 {
        input.push('(');
    }
    input.push('a');
    for _ in 0..500 {
        input.push(')');
    }
    assert_eq!(p.parse(&input), Ok(0));
}

static EAGER_CALLS: AtomicUsize = AtomicUsize::new(0);
static IMPURE_CALLS: AtomicUsize = AtomicUsize::new(0);

#[test]
fn test_constant_folding_runs_predicates_at_compile_time() {
    let p = pure(3i64).filter(|_| {
        EAGER_CALLS.fetch_add(1, Ordering::SeqCst);
        true
    });
    p.force().unwrap();
    assert_eq!(EAGER_CALLS.load(Ordering::SeqCst), 1);
    p.parse("").unwrap();
    p.parse("").unwrap();
    assert_eq!(EAGER_CALLS.load(Ordering::SeqCst), 1);
}

#[test]
fn test_impure_defers_predicates_to_parse_time() {
    let p = pure(3i64)
        .filter(|_| {
            IMPURE_CALLS.fetch_add(1, Ordering::SeqCst);
            true
        })
        .impure();
    p.force().unwrap();
    assert_eq!(IMPURE_CALLS.load(Ordering::SeqCst), 0);
    p.parse("").unwrap();
    p.parse("").unwrap();
    assert_eq!(IMPURE_CALLS.load(Ordering::SeqCst), 2);
}

#[test]
fn test_shared_parser_compiles_once_and_still_parses() {
    let word = satisfy(|c| c.is_alphabetic()).many1().label("word");
    let p = word
        .clone()
        .then_ignore(just(','))
        .then(word)
        .map(|(a, b): (Vec<char>, Vec<char>)| {
            (a.into_iter().collect::<String>(), b.into_iter().collect::<String>())
        });
    assert_eq!(p.parse("hi,there"), Ok(("hi".to_string(), "there".to_string())));
}
