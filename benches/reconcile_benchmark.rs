use cacheeasy_exporter::collectors::PrometheusAdapter;
use cacheeasy_exporter::config::ExporterConfig;
use cacheeasy_exporter::reconcile::Reconciler;
use cacheeasy_exporter::target::{Target, TargetKind};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use prometheus::Registry;

fn targets(count: usize, name: &str) -> Vec<Target> {
    (0..count)
        .map(|i| {
            let kind = if i % 4 == 0 {
                TargetKind::Proxy
            } else {
                TargetKind::CacheServer
            };
            Target::new(format!("10.0.{}.{}:6379", i / 250, i % 250), name, kind)
        })
        .collect()
}

/// Benchmark a pass where nothing changed, the steady state of the refresh loop
fn bench_idempotent_pass(c: &mut Criterion) {
    let engine = Reconciler::new(PrometheusAdapter::new(Registry::new()));
    let desired = targets(200, "steady");
    engine.reconcile(&desired).unwrap();

    c.bench_function("reconcile_unchanged_200", |b| {
        b.iter(|| {
            black_box(engine.reconcile(black_box(&desired)).unwrap());
        });
    });
}

/// Benchmark renaming every target, which swaps every collector
fn bench_full_replacement(c: &mut Criterion) {
    let engine = Reconciler::new(PrometheusAdapter::new(Registry::new()));
    let first = targets(50, "blue");
    let second = targets(50, "green");

    c.bench_function("reconcile_replace_50", |b| {
        let mut flip = false;
        b.iter(|| {
            flip = !flip;
            let desired = if flip { &first } else { &second };
            black_box(engine.reconcile(desired).unwrap());
        });
    });
}

/// Benchmark turning a configuration document into targets
fn bench_config_targets(c: &mut Criterion) {
    let config = ExporterConfig {
        bind: String::new(),
        redis: (0..200).map(|i| format!("10.0.0.{}:6379 cache-{}", i, i)).collect(),
        predixy: (0..20).map(|i| format!("10.1.0.{}:7617 proxy-{}", i, i)).collect(),
    };

    c.bench_function("config_targets_220", |b| {
        b.iter(|| {
            black_box(black_box(&config).targets());
        });
    });
}

criterion_group!(
    benches,
    bench_idempotent_pass,
    bench_full_replacement,
    bench_config_targets
);
criterion_main!(benches);
