use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use kornia_sfm::bundle::{BundleAdjuster, NormalEquations, SolverConfig};
use kornia_sfm::residual::linearize;
use kornia_sfm::synthetic::{SyntheticConfig, SyntheticScene};

fn scene(num_cameras: usize, num_points: usize) -> SyntheticScene {
    SyntheticScene::generate(&SyntheticConfig {
        num_cameras,
        num_points,
        noise_std: 1.0,
        seed: 42,
    })
}

fn bench_linearize(c: &mut Criterion) {
    let mut group = c.benchmark_group("linearize");
    for &num_points in &[100usize, 1000] {
        let problem = scene(10, num_points).perturbed_problem(0.01, 0.02, 1).unwrap();
        group.throughput(Throughput::Elements(problem.observations().len() as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(num_points),
            &num_points,
            |b, _| {
                b.iter(|| {
                    let blocks = linearize(problem.cameras(), problem.points(), &problem).unwrap();
                    std::hint::black_box(NormalEquations::assemble(&problem, &blocks));
                });
            },
        );
    }
    group.finish();
}

fn bench_bundle_adjustment(c: &mut Criterion) {
    let mut group = c.benchmark_group("bundle_adjustment");
    group.sample_size(10);
    for &(num_cameras, num_points) in &[(5usize, 50usize), (10, 200), (20, 500)] {
        let problem = scene(num_cameras, num_points)
            .perturbed_problem(0.01, 0.02, 1)
            .unwrap();
        let adjuster = BundleAdjuster::new(SolverConfig::default()).unwrap();
        group.bench_with_input(
            BenchmarkId::new("cameras_points", format!("{num_cameras}x{num_points}")),
            &problem,
            |b, problem| {
                b.iter(|| {
                    let res = adjuster.run(problem).unwrap();
                    std::hint::black_box(res);
                });
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_linearize, bench_bundle_adjustment);
criterion_main!(benches);
