//! Benchmarks for compilation and parsing

use bencher::{benchmark_group, benchmark_main, Bencher};
use chervil::{chain_left1, just, recursive, token, Fn2, Parser};

fn arithmetic() -> Parser<i64> {
    recursive(|expr| {
        let atom = token::natural()
            .or(just('(').ignore_then(expr.clone()).then_ignore(just(')')));
        let product = chain_left1(atom, just('*').to(Fn2::new(|a: i64, b: i64| a * b)));
        chain_left1(product, just('+').to(Fn2::new(|a: i64, b: i64| a + b)))
    })
}

fn bench_compile(b: &mut Bencher) {
    b.iter(|| {
        let p = arithmetic();
        p.force().unwrap();
    });
}

fn bench_parse(b: &mut Bencher) {
    let p = arithmetic();
    p.force().unwrap();
    b.iter(|| p.parse("(1+2)*(3+4)+5*6+789").unwrap());
}

fn bench_many(b: &mut Bencher) {
    let p = just('a').many();
    p.force().unwrap();
    let input = "a".repeat(1000);
    b.iter(|| p.parse(&input).unwrap());
}

benchmark_group!(benches, bench_compile, bench_parse, bench_many);
benchmark_main!(benches);
