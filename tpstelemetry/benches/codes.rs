use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;
use tpstelemetry::codes::{CodeEntry, CodeMapper, CodeType};

fn criterion_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("CodeMapper");
    let mapper = CodeMapper::new(vec![
        CodeEntry::new("101", CodeType::Timeout, "client timeout"),
        CodeEntry::new("21", CodeType::Timeout, "server timeout").with_service("shop.payment"),
        CodeEntry::new("10001", CodeType::Success, "not found is fine")
            .with_service("shop.cart")
            .with_method("/Get"),
    ]);
    let remote: Vec<_> = (0..200)
        .map(|i| CodeEntry::new(format!("{}", 20000 + i), CodeType::Exception, format!("biz {i}")))
        .collect();
    mapper.set(&remote);

    group.bench_function("success", |b| {
        b.iter(|| black_box(mapper.code_mapping("0", "shop.cart", "/Get")))
    });
    group.bench_function("exact-match", |b| {
        b.iter(|| black_box(mapper.code_mapping("10001", "shop.cart", "/Get")))
    });
    group.bench_function("service-match", |b| {
        b.iter(|| black_box(mapper.code_mapping("21", "shop.payment", "/Charge")))
    });
    group.bench_function("unknown-code", |b| {
        b.iter(|| black_box(mapper.code_mapping("99999", "shop.cart", "/Get")))
    });
    group.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
