use criterion::{Criterion, black_box, criterion_group, criterion_main};
use ddt_lcm::PolyaGamma;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

fn bench_pg_unit_shape(c: &mut Criterion) {
    let n = 100_000;
    let pg = PolyaGamma::new();
    let mut rng = ChaCha8Rng::seed_from_u64(42);
    c.bench_function("draw_vec b=1", |bencher| {
        bencher.iter(|| {
            let out = pg.draw_vec(&mut rng, 1.0, &vec![0.5; n]);
            black_box(out)
        });
    });
}

fn bench_pg_class_counts(c: &mut Criterion) {
    // One draw per (class, item) cell with a class size of 80.
    let tilts: Vec<f64> = (0..6 * 78).map(|i| (i % 13) as f64 * 0.4 - 2.4).collect();
    let pg = PolyaGamma::new();
    let mut rng = ChaCha8Rng::seed_from_u64(42);
    c.bench_function("draw_vec b=80", |bencher| {
        bencher.iter(|| {
            let out = pg.draw_vec(&mut rng, 80.0, &tilts);
            black_box(out)
        });
    });
}

fn bench_pg_gamma_series(c: &mut Criterion) {
    let n = 10_000;
    let pg = PolyaGamma::new();
    let mut rng = ChaCha8Rng::seed_from_u64(42);
    c.bench_function("draw_vec b=2.5", |bencher| {
        bencher.iter(|| {
            let out = pg.draw_vec(&mut rng, 2.5, &vec![1.0; n]);
            black_box(out)
        });
    });
}

criterion_group!(
    benches,
    bench_pg_unit_shape,
    bench_pg_class_counts,
    bench_pg_gamma_series
);
criterion_main!(benches);
