//! Poisson solve on the adaptive octree
//!
//! The indicator function is `chi = sum_o x_o B_o` over the tents of every
//! octree node. Minimizing `integral |grad chi + V|^2`, with `V` the splatted
//! oriented-normal field, gives `L x = b` with `L` the tent stiffness matrix
//! and `b_o = -integral grad B_o . V`. `chi` therefore rises towards the
//! inside of the sampled surface.
//!
//! The system is solved cascadically: depth by depth from the root, each
//! level solving for its own coefficients against the right-hand side minus
//! the contribution of the already solved coarser levels.

use crate::basis::{corner_offsets, node_width, overlapping_offsets, tent, CouplingTables, TentKey};
use crate::octree::Octree;
use crate::parallel;
use crate::pipeline::{reconstruct_surface, ReconstructionConfig};
use crate::sparse::{self, cholesky_solve, conjugate_gradient, IterativeOutcome, SparseMatrix};
use nalgebra::{Cholesky, DMatrix, DVector, Dyn};
use psrecon_core::{Error, NormalPoint3f, Point3f, PointCloud, Result, Stage, TriangleMesh, Vector3d};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Levels with at most this many nodes are factorized densely
const DIRECT_SOLVE_LIMIT: usize = 512;

const MAX_CG_ITERATIONS: usize = 2000;

/// Normals closer than this to a common direction enclose no volume
const PARALLEL_TOLERANCE: f64 = 1e-9;

/// Levels coarser than a block's ancestor are not split into blocks
const BLOCK_LEVELS: u8 = 2;

/// Numerical settings of the solve
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SolverSettings {
    /// First depth relaxed with block Gauss-Seidel instead of a global solve
    pub solver_divide: u8,
    pub gauss_seidel_iterations: usize,
    /// Relative residual target of the conjugate gradient levels
    pub cg_tolerance: f64,
    pub verbose: bool,
}

impl Default for SolverSettings {
    fn default() -> Self {
        Self {
            solver_divide: 8,
            gauss_seidel_iterations: 8,
            cg_tolerance: 1e-6,
            verbose: false,
        }
    }
}

/// How one depth level was solved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SolveMethod {
    Cholesky,
    ConjugateGradient,
    BlockGaussSeidel,
}

/// Per-depth solve record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepthReport {
    pub depth: u8,
    pub nodes: usize,
    pub method: SolveMethod,
    pub iterations: usize,
    pub relative_residual: f64,
    pub seconds: f64,
    pub memory_bytes: usize,
}

/// Solves for the indicator function of an octree's samples
#[derive(Debug, Clone, Default)]
pub struct PoissonSolver {
    settings: SolverSettings,
}

impl PoissonSolver {
    pub fn new(settings: SolverSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &SolverSettings {
        &self.settings
    }

    pub fn solve<'a>(&self, octree: &'a Octree) -> Result<ImplicitFunction<'a>> {
        check_encloses_volume(octree)?;

        let tables = CouplingTables::new(octree.realized_depth());
        let assembly_start = Instant::now();
        let rhs = assemble_rhs(octree, &tables);
        if self.settings.verbose {
            info!(
                seconds = assembly_start.elapsed().as_secs_f64(),
                memory_bytes = rhs.len() * std::mem::size_of::<f64>(),
                "right-hand side assembled"
            );
        }

        let mut coefficients = vec![0.0; octree.len()];
        let mut reports = Vec::with_capacity(octree.realized_depth() as usize + 1);
        for depth in 0..=octree.realized_depth() {
            let report = self.solve_level(octree, &tables, &rhs, &mut coefficients, depth)?;
            if self.settings.verbose {
                info!(
                    depth = report.depth,
                    nodes = report.nodes,
                    method = ?report.method,
                    iterations = report.iterations,
                    residual = report.relative_residual,
                    seconds = report.seconds,
                    memory_bytes = report.memory_bytes,
                    "level solved"
                );
            } else {
                debug!(depth = report.depth, nodes = report.nodes, residual = report.relative_residual, "level solved");
            }
            reports.push(report);
        }

        let mut function = ImplicitFunction {
            octree,
            coefficients,
            iso_value: 0.0,
            reports,
        };
        function.iso_value = function.sample_average()?;
        if self.settings.verbose {
            info!(iso_value = function.iso_value, "iso-value computed");
        }
        Ok(function)
    }

    fn solve_level(
        &self,
        octree: &Octree,
        tables: &CouplingTables,
        rhs: &[f64],
        coefficients: &mut [f64],
        depth: u8,
    ) -> Result<DepthReport> {
        let start = Instant::now();
        let range = octree.depth_range(depth);
        let matrix = level_matrix(octree, tables, depth);
        let level_rhs = cascade_rhs(octree, tables, rhs, coefficients, depth);
        let mut x = vec![0.0; range.len()];

        let (method, outcome) = if depth < self.settings.solver_divide {
            if range.len() <= DIRECT_SOLVE_LIMIT {
                x = cholesky_solve(&matrix, &level_rhs)?;
                let relative = relative_residual(&matrix, &x, &level_rhs);
                (
                    SolveMethod::Cholesky,
                    IterativeOutcome {
                        iterations: 1,
                        relative_residual: relative,
                        converged: true,
                    },
                )
            } else {
                let outcome = conjugate_gradient(
                    &matrix,
                    &level_rhs,
                    &mut x,
                    self.settings.cg_tolerance,
                    MAX_CG_ITERATIONS,
                )?;
                if !outcome.converged {
                    warn!(
                        depth,
                        residual = outcome.relative_residual,
                        "conjugate gradients stopped before reaching the tolerance"
                    );
                }
                (SolveMethod::ConjugateGradient, outcome)
            }
        } else {
            let offsets: Vec<[u32; 3]> = range.clone().map(|i| octree.node(i).offset).collect();
            let outcome =
                block_gauss_seidel(&matrix, &level_rhs, &mut x, &offsets, depth, self.settings.gauss_seidel_iterations)?;
            (SolveMethod::BlockGaussSeidel, outcome)
        };

        if x.iter().any(|v| !v.is_finite()) {
            return Err(Error::solver_divergence(
                Stage::Solve,
                format!("non-finite coefficients at depth {}", depth),
            ));
        }
        coefficients[range.clone()].copy_from_slice(&x);

        Ok(DepthReport {
            depth,
            nodes: range.len(),
            method,
            iterations: outcome.iterations,
            relative_residual: outcome.relative_residual,
            seconds: start.elapsed().as_secs_f64(),
            memory_bytes: matrix.memory_bytes() + 2 * range.len() * std::mem::size_of::<f64>(),
        })
    }
}

fn relative_residual(matrix: &SparseMatrix, x: &[f64], rhs: &[f64]) -> f64 {
    let rhs_norm = sparse::norm(rhs);
    if rhs_norm == 0.0 {
        return 0.0;
    }
    sparse::norm(&matrix.residual(x, rhs)) / rhs_norm
}

/// Reject normal fields that point in one common direction
fn check_encloses_volume(octree: &Octree) -> Result<()> {
    let directions: Vec<Vector3d> = octree
        .samples()
        .iter()
        .filter_map(|s| s.normal.try_normalize(0.0))
        .collect();
    let Some(reference) = directions.first() else {
        return Err(Error::solver_divergence(Stage::Solve, "every normal has zero length"));
    };
    if directions.iter().all(|d| d.dot(reference) > 1.0 - PARALLEL_TOLERANCE) {
        return Err(Error::solver_divergence(
            Stage::Solve,
            "all normals are parallel; the oriented field encloses no volume",
        ));
    }
    Ok(())
}

/// Splat each splat node's normal sum onto its trilinear neighbors at the
/// same depth, as vector coefficients per node
fn splat_normals(octree: &Octree) -> Vec<Vector3d> {
    let mut field = vec![Vector3d::zeros(); octree.len()];
    for splat in octree.splat_nodes() {
        let node = octree.node(splat);
        if node.sample_count() == 0 {
            continue;
        }

        let scale = (node.depth as f64).exp2();
        let limit = (1i64 << node.depth) - 1;
        let t = node.centroid * scale - Vector3d::repeat(0.5);
        let base = [t.x.floor() as i64, t.y.floor() as i64, t.z.floor() as i64];

        let mut targets = Vec::with_capacity(8);
        for corner in corner_offsets() {
            let offset: [i64; 3] = std::array::from_fn(|k| base[k] + corner[k] as i64);
            if offset.iter().any(|&o| o < 0 || o > limit) {
                continue;
            }
            let offset = offset.map(|o| o as u32);
            let Some(index) = octree.find(node.depth, offset) else { continue };
            let weight: f64 = (0..3).map(|k| tent(t[k] - offset[k] as f64).0).product();
            if weight > 0.0 {
                targets.push((index, weight));
            }
        }

        let total: f64 = targets.iter().map(|&(_, w)| w).sum();
        if total <= 0.0 {
            continue;
        }
        let volume = node_width(node.depth).powi(3);
        for (index, weight) in targets {
            field[index] += node.normal_sum * (weight / (total * volume));
        }
    }
    field
}

/// `b_o = -sum_s v_s . integral grad B_o B_s`, gathered per node
fn assemble_rhs(octree: &Octree, tables: &CouplingTables) -> Vec<f64> {
    let field = splat_normals(octree);
    parallel::parallel_map_range(octree.len(), |target| {
        let key = octree.node(target).key();
        let mut acc = 0.0;
        octree.for_each_overlapping(&key, |source| {
            let v = &field[source];
            if *v != Vector3d::zeros() {
                acc -= v.dot(&tables.gradient_value(&key, &octree.node(source).key()));
            }
        });
        acc
    })
}

/// Same-depth stiffness matrix of one level, indexed from the level's start
fn level_matrix(octree: &Octree, tables: &CouplingTables, depth: u8) -> SparseMatrix {
    let range = octree.depth_range(depth);
    let rows = parallel::parallel_map_range(range.len(), |row| {
        let key = octree.node(range.start + row).key();
        overlapping_offsets(&key, depth)
            .filter_map(|offset| octree.find(depth, offset))
            .map(|column| (column - range.start, tables.laplacian(&key, &octree.node(column).key())))
            .collect()
    });
    SparseMatrix::from_rows(rows)
}

/// Level right-hand side minus the coupling to the solved coarser levels
fn cascade_rhs(octree: &Octree, tables: &CouplingTables, rhs: &[f64], coefficients: &[f64], depth: u8) -> Vec<f64> {
    let range = octree.depth_range(depth);
    parallel::parallel_map_range(range.len(), |row| {
        let index = range.start + row;
        let key = octree.node(index).key();
        let mut value = rhs[index];
        for coarse in 0..depth {
            for offset in overlapping_offsets(&key, coarse) {
                if let Some(other) = octree.find(coarse, offset) {
                    value -= tables.laplacian(&key, &octree.node(other).key()) * coefficients[other];
                }
            }
        }
        value
    })
}

struct Block {
    members: Vec<usize>,
    factor: Cholesky<f64, Dyn>,
}

/// Block Gauss-Seidel over blocks of nodes sharing an ancestor
/// [`BLOCK_LEVELS`] levels up
///
/// Blocks whose ancestor offsets have equal parity never couple, so each of
/// the eight parity classes is relaxed in parallel.
fn block_gauss_seidel(
    matrix: &SparseMatrix,
    rhs: &[f64],
    x: &mut [f64],
    offsets: &[[u32; 3]],
    depth: u8,
    iterations: usize,
) -> Result<IterativeOutcome> {
    let shift = depth.min(BLOCK_LEVELS);
    let mut grouped: BTreeMap<[u32; 3], Vec<usize>> = BTreeMap::new();
    for (i, offset) in offsets.iter().enumerate() {
        grouped.entry(offset.map(|o| o >> shift)).or_default().push(i);
    }

    let mut slots = vec![usize::MAX; matrix.size()];
    let mut colors: [Vec<usize>; 8] = Default::default();
    let mut blocks = Vec::with_capacity(grouped.len());
    for (ancestor, members) in grouped {
        for (slot, &i) in members.iter().enumerate() {
            slots[i] = slot;
        }
        let mut dense = DMatrix::zeros(members.len(), members.len());
        for (slot, &i) in members.iter().enumerate() {
            for (column, value) in matrix.row(i) {
                let other = slots[column];
                if other != usize::MAX && members.get(other) == Some(&column) {
                    dense[(slot, other)] = value;
                }
            }
        }
        let factor = dense.cholesky().ok_or_else(|| {
            Error::solver_divergence(Stage::Solve, format!("block at depth {} is not positive definite", depth))
        })?;

        let color = (ancestor[0] & 1) | ((ancestor[1] & 1) << 1) | ((ancestor[2] & 1) << 2);
        colors[color as usize].push(blocks.len());
        blocks.push(Block { members, factor });
    }

    let initial = sparse::norm(rhs);
    for _ in 0..iterations {
        for class in &colors {
            let current: &[f64] = x;
            let updates = parallel::parallel_map(class, |&b| {
                let block = &blocks[b];
                let local = DVector::from_iterator(
                    block.members.len(),
                    block.members.iter().map(|&i| {
                        rhs[i] - matrix.row(i).map(|(c, v)| v * current[c]).sum::<f64>()
                    }),
                );
                block.factor.solve(&local)
            });
            for (&b, delta) in class.iter().zip(updates) {
                for (&i, d) in blocks[b].members.iter().zip(delta.iter()) {
                    x[i] += d;
                }
            }
        }
    }

    let last = sparse::norm(&matrix.residual(x, rhs));
    if !last.is_finite() || last > initial {
        return Err(Error::solver_divergence(
            Stage::Solve,
            format!("block relaxation at depth {} grew the residual from {:.3e} to {:.3e}", depth, initial, last),
        ));
    }
    Ok(IterativeOutcome {
        iterations,
        relative_residual: if initial > 0.0 { last / initial } else { 0.0 },
        converged: true,
    })
}

/// Solved indicator function over an octree
#[derive(Debug, Clone)]
pub struct ImplicitFunction<'a> {
    octree: &'a Octree,
    coefficients: Vec<f64>,
    iso_value: f64,
    reports: Vec<DepthReport>,
}

impl<'a> ImplicitFunction<'a> {
    #[cfg(test)]
    pub(crate) fn from_coefficients(octree: &'a Octree, coefficients: Vec<f64>, iso_value: f64) -> Self {
        Self {
            octree,
            coefficients,
            iso_value,
            reports: Vec::new(),
        }
    }

    pub fn octree(&self) -> &'a Octree {
        self.octree
    }

    pub fn coefficients(&self) -> &[f64] {
        &self.coefficients
    }

    /// Level of the reconstructed surface
    pub fn iso_value(&self) -> f64 {
        self.iso_value
    }

    pub fn reports(&self) -> &[DepthReport] {
        &self.reports
    }

    /// Coefficient and tent of every node whose tent may be non-zero at `p`
    fn contributing(&self, p: &Vector3d, mut visit: impl FnMut(f64, TentKey)) {
        for depth in 0..=self.octree.realized_depth() {
            let scale = (depth as f64).exp2();
            let limit = (1i64 << depth) - 1;
            let base = [
                (p.x * scale - 0.5).floor() as i64,
                (p.y * scale - 0.5).floor() as i64,
                (p.z * scale - 0.5).floor() as i64,
            ];
            for corner in corner_offsets() {
                let offset: [i64; 3] = std::array::from_fn(|k| base[k] + corner[k] as i64);
                if offset.iter().any(|&o| o < 0 || o > limit) {
                    continue;
                }
                let offset = offset.map(|o| o as u32);
                if let Some(index) = self.octree.find(depth, offset) {
                    visit(self.coefficients[index], TentKey::new(depth, offset));
                }
            }
        }
    }

    /// Value at `p` in unit-cube coordinates
    pub fn value(&self, p: &Vector3d) -> f64 {
        let mut value = 0.0;
        self.contributing(p, |coefficient, key| {
            let scale = (key.depth as f64).exp2();
            let weight: f64 = (0..3)
                .map(|k| tent(p[k] * scale - key.offset[k] as f64 - 0.5).0)
                .product();
            value += coefficient * weight;
        });
        value
    }

    /// Value and gradient at `p` in unit-cube coordinates
    pub fn value_and_gradient(&self, p: &Vector3d) -> (f64, Vector3d) {
        let mut value = 0.0;
        let mut gradient = Vector3d::zeros();
        self.contributing(p, |coefficient, key| {
            let (v, g) = key.evaluate(p);
            value += coefficient * v;
            gradient += g * coefficient;
        });
        (value, gradient)
    }

    /// Value at a point in input coordinates
    pub fn value_at(&self, point: &Point3f) -> f64 {
        self.value(&self.octree.frame().to_unit(point))
    }

    /// Weighted mean of the function over the samples
    fn sample_average(&self) -> Result<f64> {
        let samples = self.octree.samples();
        let weighted = parallel::parallel_map(samples, |s| s.field_weight() * self.value(&s.position));
        let weights: Vec<f64> = samples.iter().map(|s| s.field_weight()).collect();
        let total = parallel::deterministic_sum(&weights);
        let average = parallel::deterministic_sum(&weighted) / total;
        if !average.is_finite() {
            return Err(Error::solver_divergence(Stage::Solve, "iso-value is not finite"));
        }
        Ok(average)
    }
}

/// Reconstruct a mesh from points carrying their own normals
pub fn poisson_reconstruction(
    cloud: &PointCloud<NormalPoint3f>,
    config: &ReconstructionConfig,
) -> Result<TriangleMesh> {
    let points = PointCloud::from_points(cloud.positions());
    let reconstruction = reconstruct_surface(&points, &cloud.normal_field(), config)?;
    Ok(reconstruction.mesh)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::octree::OctreeBuilder;
    use approx::assert_relative_eq;
    use psrecon_core::Vector3f;

    fn sphere(count: usize) -> (Vec<Point3f>, Vec<Vector3f>) {
        let golden = (1.0 + 5.0_f32.sqrt()) / 2.0;
        (0..count)
            .map(|i| {
                let theta = 2.0 * std::f32::consts::PI * i as f32 / golden;
                let phi = (1.0 - 2.0 * (i as f32 + 0.5) / count as f32).acos();
                let n = Vector3f::new(phi.sin() * theta.cos(), phi.sin() * theta.sin(), phi.cos());
                (Point3f::from(n), n)
            })
            .unzip()
    }

    fn sphere_octree(count: usize, max_depth: u8) -> Octree {
        let (points, normals) = sphere(count);
        OctreeBuilder::new().with_max_depth(max_depth).build(&points, &normals).unwrap()
    }

    #[test]
    fn test_indicator_is_high_inside() {
        let octree = sphere_octree(400, 5);
        let function = PoissonSolver::default().solve(&octree).unwrap();
        let iso = function.iso_value();

        let center = function.value_at(&Point3f::origin());
        let outside = function.value_at(&Point3f::new(1.2, 0.0, 0.0));
        assert!(center > iso, "center {} iso {}", center, iso);
        assert!(outside < iso, "outside {} iso {}", outside, iso);
        assert_eq!(function.reports().len(), octree.realized_depth() as usize + 1);
    }

    #[test]
    fn test_value_matches_value_and_gradient() {
        let octree = sphere_octree(200, 4);
        let function = PoissonSolver::default().solve(&octree).unwrap();

        let p = Vector3d::new(0.41, 0.55, 0.63);
        let (value, gradient) = function.value_and_gradient(&p);
        assert_relative_eq!(value, function.value(&p), epsilon = 1e-12);

        let h = 1e-6;
        let dx = (function.value(&(p + Vector3d::x() * h)) - function.value(&(p - Vector3d::x() * h))) / (2.0 * h);
        assert_relative_eq!(gradient.x, dx, epsilon = 1e-4, max_relative = 1e-4);
    }

    #[test]
    fn test_block_gauss_seidel_reduces_residual() {
        let octree = sphere_octree(300, 5);
        let settings = SolverSettings {
            solver_divide: 2,
            ..SolverSettings::default()
        };
        let function = PoissonSolver::new(settings).solve(&octree).unwrap();

        for report in function.reports() {
            if report.depth >= 2 {
                assert_eq!(report.method, SolveMethod::BlockGaussSeidel);
                assert!(report.relative_residual < 1.0);
            } else {
                assert_eq!(report.method, SolveMethod::Cholesky);
            }
        }
    }

    #[test]
    fn test_direct_and_relaxed_solves_agree_in_sign() {
        let octree = sphere_octree(300, 5);
        let direct = PoissonSolver::default().solve(&octree).unwrap();
        let relaxed = PoissonSolver::new(SolverSettings {
            solver_divide: 3,
            gauss_seidel_iterations: 30,
            ..SolverSettings::default()
        })
        .solve(&octree)
        .unwrap();

        for p in [Point3f::origin(), Point3f::new(0.0, 0.0, 1.15), Point3f::new(0.3, -0.2, 0.1)] {
            let a = direct.value_at(&p) - direct.iso_value();
            let b = relaxed.value_at(&p) - relaxed.iso_value();
            assert_eq!(a > 0.0, b > 0.0);
        }
    }

    #[test]
    fn test_solve_is_deterministic() {
        let octree = sphere_octree(300, 5);
        let first = PoissonSolver::default().solve(&octree).unwrap();
        let second = PoissonSolver::default().solve(&octree).unwrap();
        assert_eq!(first.coefficients(), second.coefficients());
        assert_eq!(first.iso_value().to_bits(), second.iso_value().to_bits());
    }

    #[test]
    fn test_parallel_normals_diverge() {
        let (points, _) = sphere(100);
        let normals = vec![Vector3f::z(); points.len()];
        let octree = OctreeBuilder::new().with_max_depth(4).build(&points, &normals).unwrap();
        assert!(matches!(
            PoissonSolver::default().solve(&octree),
            Err(Error::SolverDivergence { stage: Stage::Solve, .. })
        ));
    }
}
