use criterion::{criterion_group, criterion_main, Criterion};
use codebook_builder::{generate_descriptors, CodebookBuilder, Diagnostics, Initialization};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

fn bench_codebook(c: &mut Criterion) {
    let mut rng = ChaCha8Rng::seed_from_u64(42);
    let centres: Vec<Vec<f32>> = (0..128)
        .map(|_| (0..16).map(|_| rng.gen_range(0.0..128.0)).collect())
        .collect();
    let descriptors = generate_descriptors(&centres, 80, 4.0, &mut rng);

    c.bench_function("codebook_exact_10k_16d_k128", |b| {
        b.iter(|| {
            let mut builder = CodebookBuilder::with_seed(42);
            builder
                .append(&descriptors, 1.0, 0.0)
                .expect("append descriptors");
            builder.cluster(128, 5).expect("exact bench run");
        });
    });

    c.bench_function("codebook_approximate_10k_16d_k128", |b| {
        b.iter(|| {
            let mut builder = CodebookBuilder::with_seed(42);
            builder
                .append(&descriptors, 1.0, 0.0)
                .expect("append descriptors");
            builder
                .cluster_approximately(
                    128,
                    5,
                    0.9,
                    Initialization::KMeansPlusPlus,
                    Diagnostics::NONE,
                )
                .expect("approximate bench run");
        });
    });
}

criterion_group!(benches, bench_codebook);
criterion_main!(benches);
