use criterion::{criterion_group, criterion_main, Criterion};
use opentelemetry::trace::{SpanKind, TraceId};
use opentelemetry::KeyValue;
use std::collections::HashMap;
use std::hint::black_box;
use tpstelemetry::sampler::{
    DyeingTable, SamplerConfig, ServiceSamplerConfig, ShouldSample, TpsSampler,
};
use tpstelemetry::semconv;

fn config() -> SamplerConfig {
    SamplerConfig {
        fraction: 0.1,
        services: HashMap::from([(
            "shop.payment".to_string(),
            ServiceSamplerConfig {
                fraction: Some(0.5),
                methods: HashMap::from([("/Charge".to_string(), 1.0)]),
            },
        )]),
        ..Default::default()
    }
}

fn criterion_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("TpsSampler");
    let sampler = TpsSampler::with_dyeing(
        &config(),
        DyeingTable::new([("uid", ["10001", "10002"])]),
    );
    let plain = vec![
        KeyValue::new(semconv::CALLEE_SERVICE, "shop.cart"),
        KeyValue::new(semconv::CALLEE_METHOD, "/Add"),
    ];
    let method_override = vec![
        KeyValue::new(semconv::CALLEE_SERVICE, "shop.payment"),
        KeyValue::new(semconv::CALLEE_METHOD, "/Charge"),
    ];
    let dyed = vec![
        KeyValue::new(semconv::CALLEE_SERVICE, "shop.cart"),
        KeyValue::new("uid", "10002"),
    ];

    let mut id = 1u128;
    for (name, attributes) in [
        ("global-fraction", &plain),
        ("method-override", &method_override),
        ("dyed", &dyed),
    ] {
        group.bench_function(name, |b| {
            b.iter(|| {
                id = id.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                black_box(sampler.should_sample(
                    None,
                    TraceId::from_bytes(id.to_be_bytes()),
                    "op",
                    &SpanKind::Client,
                    attributes,
                    &[],
                ))
            })
        });
    }
    group.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
