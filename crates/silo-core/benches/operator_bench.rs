//! Bitmap operator algebra benchmark.
//!
//! Measures `Operator::evaluate` over randomly generated row sets at a few
//! table sizes, for the operators a typical filter expression compiles down
//! to: `Intersection`, `Union`, and `Threshold`.

use std::time::Duration;

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use silo_core::domain::bitmap::Bitmap;
use silo_core::query::operator::Operator;

const ROW_COUNTS: [u32; 3] = [10_000, 100_000, 1_000_000];

/// A bitmap with roughly `density` of `[0, n)` set, seeded deterministically
/// so successive runs are comparable.
fn random_bitmap(rng: &mut StdRng, n: u32, density: f64) -> Bitmap {
    Bitmap::from_rows((0..n).filter(|_| rng.gen_bool(density)))
}

fn operator_criterion() -> Criterion {
    Criterion::default()
        .sample_size(20)
        .measurement_time(Duration::from_secs(10))
}

fn bench_intersection(c: &mut Criterion) {
    let mut group = c.benchmark_group("intersection");
    for &n in &ROW_COUNTS {
        let mut rng = StdRng::seed_from_u64(n as u64);
        let a = random_bitmap(&mut rng, n, 0.3);
        let b = random_bitmap(&mut rng, n, 0.3);
        let c_bitmap = random_bitmap(&mut rng, n, 0.3);

        group.bench_function(format!("three_way_n{n}"), |bencher| {
            bencher.iter(|| {
                let op = Operator::Intersection {
                    pos: vec![
                        Operator::IndexScan(&a, n),
                        Operator::IndexScan(&b, n),
                        Operator::IndexScan(&c_bitmap, n),
                    ],
                    neg: vec![],
                    n,
                };
                black_box(op.evaluate().unwrap().cardinality())
            })
        });
    }
    group.finish();
}

fn bench_union(c: &mut Criterion) {
    let mut group = c.benchmark_group("union");
    for &n in &ROW_COUNTS {
        let mut rng = StdRng::seed_from_u64(n as u64);
        let a = random_bitmap(&mut rng, n, 0.1);
        let b = random_bitmap(&mut rng, n, 0.1);
        let c_bitmap = random_bitmap(&mut rng, n, 0.1);

        group.bench_function(format!("three_way_n{n}"), |bencher| {
            bencher.iter(|| {
                let op = Operator::Union {
                    children: vec![
                        Operator::IndexScan(&a, n),
                        Operator::IndexScan(&b, n),
                        Operator::IndexScan(&c_bitmap, n),
                    ],
                    n,
                };
                black_box(op.evaluate().unwrap().cardinality())
            })
        });
    }
    group.finish();
}

fn bench_threshold(c: &mut Criterion) {
    let mut group = c.benchmark_group("threshold");
    for &n in &ROW_COUNTS {
        let mut rng = StdRng::seed_from_u64(n as u64);
        let filters: Vec<Bitmap> = (0..4).map(|_| random_bitmap(&mut rng, n, 0.25)).collect();

        group.bench_function(format!("two_of_four_n{n}"), |bencher| {
            bencher.iter(|| {
                let op = Operator::Threshold {
                    pos: filters.iter().map(|bitmap| Operator::IndexScan(bitmap, n)).collect(),
                    neg: vec![],
                    k: 2,
                    exact: false,
                    n,
                };
                black_box(op.evaluate().unwrap().cardinality())
            })
        });
    }
    group.finish();
}

criterion_group! {
    name = benches;
    config = operator_criterion();
    targets = bench_intersection, bench_union, bench_threshold,
}
criterion_main!(benches);
