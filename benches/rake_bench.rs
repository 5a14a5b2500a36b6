//! Criterion benchmarks for the raking engine.

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};

use rimweight::{BucketedColumn, CategoryBucketer, RakeOpts, RakeVariable, TargetDistribution, rim_iterate};

fn synthetic_columns(n: usize) -> (BucketedColumn, BucketedColumn, BucketedColumn) {
    let gender: Vec<&str> = (0..n).map(|i| if i % 7 < 4 { "M" } else { "F" }).collect();
    let age: Vec<String> = (0..n).map(|i| format!("a{}", (i * 31) % 6)).collect();
    let region: Vec<String> = (0..n).map(|i| format!("r{}", (i * 17) % 12)).collect();

    (
        BucketedColumn::from_values(gender),
        CategoryBucketer::new(["a0", "a1", "a2", "a3"]).bucket(age.iter().map(|v| Some(v.as_str()))),
        CategoryBucketer::new(["r0", "r1", "r2"]).bucket(region.iter().map(|v| Some(v.as_str()))),
    )
}

fn bench_rim_iterate(c: &mut Criterion) {
    let gender_target = TargetDistribution::from_ratios("gender", [("M", 0.49), ("F", 0.51)]).unwrap();
    let age_target =
        TargetDistribution::from_ratios("age", [("a0", 0.15), ("a1", 0.2), ("a2", 0.25), ("a3", 0.2)])
            .unwrap();
    let region_target =
        TargetDistribution::from_ratios("region", [("r0", 0.3), ("r1", 0.2), ("r2", 0.1)]).unwrap();

    let mut group = c.benchmark_group("rim_iterate");
    for &n in &[10_000usize, 100_000, 1_000_000] {
        let (gender, age, region) = synthetic_columns(n);
        let vars = [
            RakeVariable::new(&gender, &gender_target),
            RakeVariable::new(&age, &age_target),
            RakeVariable::new(&region, &region_target),
        ];

        for parallel in [false, true] {
            let opts = RakeOpts {
                parallel,
                ..Default::default()
            };
            let label = if parallel { "parallel" } else { "sequential" };
            group.bench_with_input(BenchmarkId::new(label, n), &n, |b, _| {
                b.iter(|| rim_iterate(black_box(&vars), &opts).unwrap())
            });
        }
    }
    group.finish();
}

criterion_group!(benches, bench_rim_iterate);
criterion_main!(benches);
