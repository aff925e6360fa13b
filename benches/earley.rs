//! Parser and generator benchmarks.
//!
//! Every refinement round parses each known-valid input once per candidate
//! and generates thousands of inputs, so these two dominate refinement time.
//!
//! Run with:
//! ```bash
//! cargo bench --bench earley
//! ```

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use grammar_miner::deadline::Deadline;
use grammar_miner::generator::Generator;
use grammar_miner::grammar::{from_literal, Grammar, START};
use grammar_miner::parser::{EarleyParser, ParseOutcome, Recognition};
use grammar_miner::tree::TreeArena;
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;

// ============================================================================
// Helpers
// ============================================================================

/// Arithmetic expressions with left recursion and nullable parts.
fn expr_grammar() -> Grammar {
    from_literal(&[
        ("<start>", &[&["<expr>"]]),
        ("<expr>", &[&["<expr>", "+", "<term>"], &["<expr>", "-", "<term>"], &["<term>"]]),
        ("<term>", &[&["<term>", "*", "<factor>"], &["<factor>"]]),
        ("<factor>", &[&["<sign>", "<number>"], &["(", "<expr>", ")"]]),
        ("<sign>", &[&[""], &["-"]]),
        ("<number>", &[&["<digit>", "<number>"], &["<digit>"]]),
        ("<digit>", &[&["0"], &["1"], &["2"], &["3"], &["4"], &["5"], &["6"], &["7"], &["8"], &["9"]]),
    ])
}

/// A random valid expression of roughly `len` characters.
fn random_expr(rng: &mut impl Rng, len: usize) -> String {
    let mut s = String::with_capacity(len + 8);
    let mut open = 0;
    while s.len() < len {
        if rng.gen_bool(0.1) {
            s.push('(');
            open += 1;
        }
        for _ in 0..rng.gen_range(1..4) {
            s.push(char::from(b'0' + rng.gen_range(0..10u8)));
        }
        if open > 0 && rng.gen_bool(0.3) {
            s.push(')');
            open -= 1;
        }
        s.push(*[b'+', b'-', b'*'].choose(rng).unwrap_or(&b'+') as char);
    }
    s.push('1');
    s.extend(std::iter::repeat(')').take(open));
    s
}

// ============================================================================
// Parsing
// ============================================================================

fn bench_recognize(c: &mut Criterion) {
    let grammar = expr_grammar();
    let parser = EarleyParser::new(&grammar);
    let mut rng = ChaCha8Rng::seed_from_u64(42);
    let mut group = c.benchmark_group("recognize");

    for len in [16, 64, 256] {
        let input = random_expr(&mut rng, len);
        group.throughput(Throughput::Bytes(input.len() as u64));
        group.bench_with_input(BenchmarkId::new("expr", len), &input, |b, input| {
            b.iter(|| {
                let result = parser.recognize(input, &Deadline::never());
                assert_eq!(result, Recognition::Accepted);
            });
        });
    }

    group.finish();
}

fn bench_parse_tree(c: &mut Criterion) {
    let grammar = expr_grammar();
    let parser = EarleyParser::new(&grammar);
    let mut rng = ChaCha8Rng::seed_from_u64(7);
    let mut group = c.benchmark_group("parse");
    group.sample_size(20);

    for len in [16, 64, 256] {
        let input = random_expr(&mut rng, len);
        group.bench_with_input(BenchmarkId::new("expr", len), &input, |b, input| {
            b.iter(|| {
                let mut arena = TreeArena::new();
                let outcome = parser.parse(&mut arena, input, &Deadline::never());
                assert!(matches!(outcome, ParseOutcome::Tree(_)));
            });
        });
    }

    group.finish();
}

fn bench_parser_construction(c: &mut Criterion) {
    let grammar = expr_grammar();
    c.bench_function("parser_new", |b| b.iter(|| EarleyParser::new(&grammar)));
}

// ============================================================================
// Generation
// ============================================================================

fn bench_generate(c: &mut Criterion) {
    let grammar = expr_grammar();
    let mut group = c.benchmark_group("generate");

    for depth in [4, 8, 12] {
        group.bench_with_input(BenchmarkId::new("expr", depth), &depth, |b, &depth| {
            let mut generator = Generator::new(&grammar, depth, 0);
            b.iter(|| generator.generate_string(START, &Deadline::never()));
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_recognize,
    bench_parse_tree,
    bench_parser_construction,
    bench_generate
);
criterion_main!(benches);
