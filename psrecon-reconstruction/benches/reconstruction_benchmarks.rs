//! Benchmarks for normal estimation and Poisson reconstruction on sphere samples

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use psrecon_algorithms::{estimate_normals, NormalEstimationConfig};
use psrecon_core::{Point3f, PointCloud, Vector3f};
use psrecon_reconstruction::{OctreeBuilder, PoissonSolver, ReconstructionConfig, SurfaceReconstructor};

fn fibonacci_sphere(count: usize) -> (Vec<Point3f>, Vec<Vector3f>) {
    let golden_ratio = (1.0 + 5.0_f32.sqrt()) / 2.0;
    (0..count)
        .map(|i| {
            let theta = 2.0 * std::f32::consts::PI * i as f32 / golden_ratio;
            let phi = (1.0 - 2.0 * (i as f32 + 0.5) / count as f32).acos();
            let n = Vector3f::new(phi.sin() * theta.cos(), phi.sin() * theta.sin(), phi.cos());
            (Point3f::from(n), n)
        })
        .unzip()
}

fn bench_normal_estimation(c: &mut Criterion) {
    let mut group = c.benchmark_group("normal_estimation");
    for &count in &[1000, 5000] {
        let (points, _) = fibonacci_sphere(count);
        let cloud = PointCloud::from_points(points);
        let config = NormalEstimationConfig::fixed(4);
        group.bench_with_input(BenchmarkId::new("fixed_knn", count), &cloud, |b, cloud| {
            b.iter(|| black_box(estimate_normals(black_box(cloud), &config).unwrap()));
        });
    }
    group.finish();
}

fn bench_reconstruction(c: &mut Criterion) {
    let (points, normals) = fibonacci_sphere(2000);
    let field = psrecon_core::NormalField::from_vec(normals.clone());

    let mut group = c.benchmark_group("reconstruction");
    group.sample_size(10);

    for &depth in &[5u8, 6, 7] {
        group.bench_with_input(BenchmarkId::new("octree", depth), &depth, |b, &depth| {
            let builder = OctreeBuilder::new().with_max_depth(depth);
            b.iter(|| black_box(builder.build(&points, &normals).unwrap()));
        });

        let octree = OctreeBuilder::new().with_max_depth(depth).build(&points, &normals).unwrap();
        group.bench_with_input(BenchmarkId::new("solve", depth), &octree, |b, octree| {
            let solver = PoissonSolver::default();
            b.iter(|| black_box(solver.solve(octree).unwrap().iso_value()));
        });

        group.bench_with_input(BenchmarkId::new("full", depth), &depth, |b, &depth| {
            let mut reconstructor = SurfaceReconstructor::new(ReconstructionConfig::default().with_max_depth(depth));
            b.iter(|| black_box(reconstructor.reconstruct(&points, &field).unwrap().mesh));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_normal_estimation, bench_reconstruction);
criterion_main!(benches);
