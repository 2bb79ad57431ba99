use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use std::hint::black_box;
use duet_core::{Attributes, Document, StateVector, Update, WireFormat};
use uuid::Uuid;

fn typed_document(chars: usize) -> Document {
    let mut doc = Document::new(Uuid::new_v4());
    for i in 0..chars {
        doc.insert(i, "x", Attributes::new());
    }
    doc
}

fn bench_local_typing(c: &mut Criterion) {
    let mut group = c.benchmark_group("Document");
    group.throughput(Throughput::Elements(1));

    group.bench_function("local_insert_append", |b| {
        let mut doc = Document::new(Uuid::new_v4());
        b.iter(|| {
            let len = doc.len();
            black_box(doc.insert(len, black_box("a"), Attributes::new()));
        })
    });

    group.finish();
}

fn bench_remote_integration(c: &mut Criterion) {
    let mut group = c.benchmark_group("Document");
    let source = typed_document(1_000);
    let update = source.diff(&StateVector::new());
    group.throughput(Throughput::Elements(1_000));

    group.bench_function("apply_snapshot_1k_chars", |b| {
        b.iter(|| {
            let mut doc = Document::new(Uuid::new_v4());
            black_box(doc.apply_update(black_box(&update)));
        })
    });

    group.bench_function("apply_duplicate_1k_chars", |b| {
        let mut doc = Document::new(Uuid::new_v4());
        doc.apply_update(&update);
        b.iter(|| {
            black_box(doc.apply_update(black_box(&update)));
        })
    });

    group.finish();
}

fn bench_codec(c: &mut Criterion) {
    let source = typed_document(1_000);
    let update = source.diff(&StateVector::new());
    let encoded = update.encode();

    c.bench_function("update_encode_1k_chars", |b| {
        b.iter(|| black_box(black_box(&update).encode()))
    });

    c.bench_function("update_decode_1k_chars", |b| {
        b.iter(|| black_box(Update::decode(black_box(&encoded)).unwrap()))
    });
}

criterion_group!(benches, bench_local_typing, bench_remote_integration, bench_codec);
criterion_main!(benches);
