use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rand::{Rng, SeedableRng};
use std::sync::Arc;

use sift::index::reader::SearchIndex;
use sift::index::segment::{DocinfoMode, IndexSettings, SegmentPaths, CHECKPOINT_EVERY};
use sift::indexer::IndexBuilder;
use sift::io::varint::Varint;
use sift::schema::schema::Schema;
use sift::search::{search_locals, SearchQuery};
use sift::source::VecSource;

fn bench_varint(c: &mut Criterion) {
    let mut rng = rand::rngs::StdRng::seed_from_u64(7);
    let values: Vec<u32> = (0..10_000).map(|_| rng.gen_range(0..1_000_000)).collect();

    c.bench_function("varint_encode_10k", |b| {
        b.iter(|| {
            let mut out = Vec::with_capacity(40_000);
            for &v in &values {
                Varint::encode_u32(&mut out, black_box(v));
            }
            out
        })
    });

    let mut encoded = Vec::new();
    for &v in &values {
        Varint::encode_u32(&mut encoded, v);
    }
    c.bench_function("varint_decode_10k", |b| {
        b.iter(|| {
            let mut pos = 0;
            let mut sum = 0u64;
            while pos < encoded.len() {
                let (v, used) = Varint::decode_u32(&encoded[pos..]).unwrap();
                sum += v as u64;
                pos += used;
            }
            sum
        })
    });
}

fn bench_build_and_search(c: &mut Criterion) {
    let words = ["alpha", "beta", "gamma", "delta", "epsilon", "zeta", "eta", "theta"];
    let mut rng = rand::rngs::StdRng::seed_from_u64(42);
    let docs: Vec<(u64, Vec<String>, Vec<_>)> = (1..=2000u64)
        .map(|id| {
            let text: Vec<&str> = (0..20).map(|_| words[rng.gen_range(0..words.len())]).collect();
            (id, vec![text.join(" ")], vec![])
        })
        .collect();

    let mut schema = Schema::new();
    schema.add_field("content").unwrap();
    schema.finalize().unwrap();

    let dir = tempfile::tempdir().unwrap();
    let settings = IndexSettings {
        min_word_len: 1,
        dict: Default::default(),
        checkpoint_every: CHECKPOINT_EVERY,
    };

    c.bench_function("index_2k_docs", |b| {
        let mut run = 0u32;
        b.iter(|| {
            let prefix = dir.path().join(format!("bench{}", run));
            run += 1;
            let builder =
                IndexBuilder::new(SegmentPaths::new(&prefix), DocinfoMode::Extern, settings.clone());
            let source = VecSource::new(schema.clone(), docs.clone());
            builder.build(vec![Box::new(source)], None).unwrap()
        })
    });

    let prefix = dir.path().join("query_bench");
    let builder =
        IndexBuilder::new(SegmentPaths::new(&prefix), DocinfoMode::Extern, settings.clone());
    let source = VecSource::new(schema.clone(), docs);
    builder.build(vec![Box::new(source)], None).unwrap();
    let index = Arc::new(SearchIndex::open(SegmentPaths::new(&prefix), false).unwrap());
    let indexes = [("bench".to_string(), index)];

    c.bench_function("search_and_phrase", |b| {
        b.iter(|| {
            let query = SearchQuery {
                query: "alpha beta | \"gamma delta\"".to_string(),
                ..Default::default()
            };
            let result = search_locals(black_box(&indexes), &query);
            assert!(result.error.is_none());
            result.total_found
        })
    });
}

criterion_group!(benches, bench_varint, bench_build_and_search);
criterion_main!(benches);
