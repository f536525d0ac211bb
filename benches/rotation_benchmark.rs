use criterion::{Criterion, black_box, criterion_group, criterion_main};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thurstone::{Method, RotOpts, select_rotation};

fn rotation_benchmark(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(7);
    let loadings = Array2::from_shape_fn((40, 5), |_| rng.gen_range(-0.9..0.9));
    let opts = RotOpts::default();

    c.bench_function("varimax_40x5", |b| {
        b.iter(|| select_rotation(black_box(loadings.view()), Method::Varimax, &opts).unwrap())
    });
    c.bench_function("geomin_40x5", |b| {
        b.iter(|| select_rotation(black_box(loadings.view()), Method::Geomin, &opts).unwrap())
    });
}

criterion_group!(benches, rotation_benchmark);
criterion_main!(benches);
