//! Performance benchmarks for prompt resolution
//!
//! These benchmarks measure:
//! - Selector compilation
//! - Whole-tree resolution (`**`) and random picks over a wide document
//! - Summary encoding and decoding
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use toml_prompt::{
    codec::Summary,
    decode::{decode_prompt, DecodeOptions},
    document::PromptDocument,
    query::build_search_keys,
};

// Synthetic corpus: `groups` tables of `leaves` leaves each, every table templated.
fn wide_document(groups: usize, leaves: usize) -> PromptDocument {
    let mut text = String::new();
    for g in 0..groups {
        text.push_str(&format!("[group{g}]\n_t = \"group {g} {{a|b|c}}, $leaf0\"\n"));
        for l in 0..leaves {
            text.push_str(&format!("leaf{l} = [\"g{g} l{l} x\", \"g{g} l{l} y\"]\n"));
        }
        text.push('\n');
    }
    PromptDocument::from_toml_str(&text, ".").unwrap()
}

fn bench_build_search_keys(c: &mut Criterion) {
    c.bench_function("build_search_keys", |b| {
        b.iter(|| build_search_keys(black_box("a.b+c+d.e+f.?+g.*!.h")))
    });
}

fn bench_resolve_all_recursive(c: &mut Criterion) {
    let doc = wide_document(20, 20);
    c.bench_function("decode_all_recursive", |b| {
        b.iter(|| decode_prompt(doc.clone(), "**", black_box(7), DecodeOptions::default()).unwrap())
    });
}

fn bench_resolve_random_picks(c: &mut Criterion) {
    let doc = wide_document(20, 20);
    let selector = (0..20).map(|_| "?.?").collect::<Vec<_>>().join("\n");
    c.bench_function("decode_random_picks", |b| {
        b.iter(|| decode_prompt(doc.clone(), &selector, black_box(7), DecodeOptions::default()).unwrap())
    });
}

fn bench_summary(c: &mut Criterion) {
    let doc = wide_document(10, 10);
    let out = decode_prompt(doc, "**", 7, DecodeOptions::default()).unwrap();
    let text = out.summary_text();

    c.bench_function("summary_encode", |b| b.iter(|| black_box(&out.summary).encode()));
    c.bench_function("summary_decode", |b| {
        b.iter(|| Summary::decode(black_box(&text)).unwrap())
    });
}

criterion_group!(
    benches,
    bench_build_search_keys,
    bench_resolve_all_recursive,
    bench_resolve_random_picks,
    bench_summary
);
criterion_main!(benches);
