use criterion::{BatchSize, Criterion, black_box, criterion_group, criterion_main};
use ddt_lcm::{DdtLcm, DdtLcmConfig, ItemGroups, ResponseData};
use ndarray::Array2;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

fn synthetic(n: usize, j: usize, g: usize) -> ResponseData {
    let mut rng = ChaCha8Rng::seed_from_u64(7);
    let y = Array2::from_shape_fn((n, j), |(i, item)| {
        let p = if (i % 4 + item) % 3 == 0 { 0.8 } else { 0.2 };
        if rng.gen_bool(p) { 1.0 } else { 0.0 }
    });
    let names = (0..g).map(|h| format!("group_{h}")).collect();
    let membership = (0..j).map(|item| item * g / j).collect();
    ResponseData::new(&y, ItemGroups::new(names, membership).unwrap()).unwrap()
}

fn bench_iteration(c: &mut Criterion) {
    let data = synthetic(496, 78, 7);
    let chain = DdtLcm::new(data, DdtLcmConfig::new(6, 1)).unwrap();
    c.bench_function("iteration N=496 J=78 K=6", |bencher| {
        bencher.iter_batched(
            || chain.clone(),
            |mut chain| black_box(chain.step().unwrap().log_likelihood),
            BatchSize::SmallInput,
        );
    });
}

criterion_group!(benches, bench_iteration);
criterion_main!(benches);
