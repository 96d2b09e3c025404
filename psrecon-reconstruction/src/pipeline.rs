//! Staged surface reconstruction pipeline
//!
//! A reconstruction runs octree build, Poisson solve and isosurface extraction
//! in order, recording the state reached, per-stage timings and summary
//! statistics. Any failure aborts the call and leaves the reconstructor in a
//! terminal `Failed` state; the next call starts again from `Idle`.

use crate::isosurface::{ExtractionStats, IsosurfaceExtractor};
use crate::octree::{OctreeBuilder, OctreeStats};
use crate::parallel;
use crate::poisson::{DepthReport, PoissonSolver, SolverSettings};
use psrecon_algorithms::{estimate_normals, NormalEstimate, NormalEstimationConfig};
use psrecon_core::{
    is_finite_point, Drawable, Error, NormalField, Point3f, PointCloud, Result, Stage, TriangleMesh,
};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Configuration for surface reconstruction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconstructionConfig {
    /// Maximum octree depth (1..=20)
    pub max_depth: u8,
    /// Ratio of the reconstruction cube to the samples' bounding cube (>= 1)
    pub scale: f64,
    /// First depth solved with block Gauss-Seidel (1..=20)
    pub solver_divide: u8,
    /// Depth above which extraction runs block-wise (1..=20)
    pub iso_divide: u8,
    /// Subdivision threshold on accumulated sample weight (> 0)
    pub samples_per_node: f64,
    /// Use normal magnitudes as sample confidence
    pub confidence: bool,
    /// Report sub-stage timing and memory
    pub verbose: bool,
    /// Relaxation sweeps per block Gauss-Seidel level (>= 1)
    pub gauss_seidel_iterations: usize,
    /// Relative residual target for conjugate gradient levels (> 0)
    pub cg_tolerance: f64,
}

impl Default for ReconstructionConfig {
    fn default() -> Self {
        Self {
            max_depth: 8,
            scale: 1.25,
            solver_divide: 8,
            iso_divide: 8,
            samples_per_node: 1.0,
            confidence: false,
            verbose: false,
            gauss_seidel_iterations: 8,
            cg_tolerance: 1e-6,
        }
    }
}

impl ReconstructionConfig {
    pub fn with_max_depth(mut self, max_depth: u8) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn with_scale(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }

    pub fn with_solver_divide(mut self, solver_divide: u8) -> Self {
        self.solver_divide = solver_divide;
        self
    }

    pub fn with_iso_divide(mut self, iso_divide: u8) -> Self {
        self.iso_divide = iso_divide;
        self
    }

    pub fn with_samples_per_node(mut self, samples_per_node: f64) -> Self {
        self.samples_per_node = samples_per_node;
        self
    }

    pub fn with_confidence(mut self, confidence: bool) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn with_gauss_seidel_iterations(mut self, iterations: usize) -> Self {
        self.gauss_seidel_iterations = iterations;
        self
    }

    pub fn with_cg_tolerance(mut self, tolerance: f64) -> Self {
        self.cg_tolerance = tolerance;
        self
    }

    pub fn validate(&self) -> Result<()> {
        let depth_in_range = |name: &str, value: u8| {
            if (1..=20).contains(&value) {
                Ok(())
            } else {
                Err(Error::InvalidData(format!("{} must be in 1..=20, got {}", name, value)))
            }
        };
        depth_in_range("max_depth", self.max_depth)?;
        depth_in_range("solver_divide", self.solver_divide)?;
        depth_in_range("iso_divide", self.iso_divide)?;

        if !(self.scale.is_finite() && self.scale >= 1.0) {
            return Err(Error::InvalidData(format!("scale must be at least 1, got {}", self.scale)));
        }
        if !(self.samples_per_node.is_finite() && self.samples_per_node > 0.0) {
            return Err(Error::InvalidData(format!(
                "samples_per_node must be positive, got {}",
                self.samples_per_node
            )));
        }
        if self.gauss_seidel_iterations == 0 {
            return Err(Error::InvalidData("gauss_seidel_iterations must be at least 1".to_string()));
        }
        if !(self.cg_tolerance.is_finite() && self.cg_tolerance > 0.0) {
            return Err(Error::InvalidData(format!(
                "cg_tolerance must be positive, got {}",
                self.cg_tolerance
            )));
        }
        Ok(())
    }

    fn solver_settings(&self) -> SolverSettings {
        SolverSettings {
            solver_divide: self.solver_divide,
            gauss_seidel_iterations: self.gauss_seidel_iterations,
            cg_tolerance: self.cg_tolerance,
            verbose: self.verbose,
        }
    }
}

/// Progress of a reconstruction call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReconstructionState {
    #[default]
    Idle,
    OctreeBuilt,
    SolverConverged,
    MeshExtracted,
    /// Terminal failure in the given stage; input and configuration errors
    /// count as octree build, and a missed deadline names the stage that
    /// was about to start
    Failed(Stage),
}

/// Wall time per stage in seconds
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageTimings {
    pub octree_seconds: f64,
    pub solve_seconds: f64,
    pub extraction_seconds: f64,
}

/// Topological summary of the output mesh
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshSummary {
    pub vertex_count: usize,
    pub triangle_count: usize,
    pub closed_manifold: bool,
    pub euler_characteristic: i64,
    /// Axis-aligned bounds of the vertices
    pub bounding_box: (Point3f, Point3f),
}

impl MeshSummary {
    fn of(mesh: &TriangleMesh) -> Self {
        Self {
            vertex_count: mesh.vertex_count(),
            triangle_count: mesh.face_count(),
            closed_manifold: mesh.is_closed_manifold(),
            euler_characteristic: mesh.euler_characteristic(),
            bounding_box: mesh.bounding_box(),
        }
    }
}

/// Result of a successful reconstruction
#[derive(Debug, Clone)]
pub struct Reconstruction {
    pub mesh: TriangleMesh,
    pub elapsed_seconds: f64,
    pub timings: StageTimings,
    pub iso_value: f64,
    pub octree: OctreeStats,
    pub solve: Vec<DepthReport>,
    pub extraction: ExtractionStats,
    pub summary: MeshSummary,
}

/// Runs reconstructions and tracks the state of the latest call
#[derive(Debug, Clone, Default)]
pub struct SurfaceReconstructor {
    config: ReconstructionConfig,
    time_limit: Option<Duration>,
    state: ReconstructionState,
}

impl SurfaceReconstructor {
    pub fn new(config: ReconstructionConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Fail with `DeadlineExceeded` when a stage would start after `limit`
    /// has elapsed since the call began
    ///
    /// The error carries the stage that was not started; the state reached
    /// before it is the one for the preceding stage.
    pub fn with_time_limit(mut self, limit: Duration) -> Self {
        self.time_limit = Some(limit);
        self
    }

    pub fn config(&self) -> &ReconstructionConfig {
        &self.config
    }

    pub fn state(&self) -> ReconstructionState {
        self.state
    }

    /// Reconstruct a mesh from points and their oriented normals
    pub fn reconstruct(&mut self, points: &[Point3f], normals: &NormalField) -> Result<Reconstruction> {
        self.state = ReconstructionState::Idle;
        let mut state = ReconstructionState::Idle;
        let result = parallel::execute_parallel(|| self.run(points, normals, &mut state));
        self.state = match &result {
            Ok(_) => ReconstructionState::MeshExtracted,
            Err(e) => ReconstructionState::Failed(e.stage().unwrap_or(Stage::OctreeBuild)),
        };
        if let Err(e) = &result {
            debug!(error = %e, last_state = ?state, "reconstruction failed");
        }
        result
    }

    fn check_deadline(&self, start: Instant, stage: Stage) -> Result<()> {
        match self.time_limit {
            Some(limit) if start.elapsed() >= limit => Err(Error::DeadlineExceeded { stage }),
            _ => Ok(()),
        }
    }

    fn run(&self, points: &[Point3f], normals: &NormalField, state: &mut ReconstructionState) -> Result<Reconstruction> {
        let start = Instant::now();
        let config = &self.config;
        config.validate()?;
        validate_input(points, normals)?;

        self.check_deadline(start, Stage::OctreeBuild)?;
        let octree_start = Instant::now();
        let octree = OctreeBuilder::new()
            .with_max_depth(config.max_depth)
            .with_scale(config.scale)
            .with_samples_per_node(config.samples_per_node)
            .with_confidence(config.confidence)
            .build(points, normals.as_slice())?;
        let octree_seconds = octree_start.elapsed().as_secs_f64();
        let octree_stats = octree.stats();
        *state = ReconstructionState::OctreeBuilt;
        if config.verbose {
            info!(
                nodes = octree_stats.node_count,
                leaves = octree_stats.leaf_count,
                realized_depth = octree_stats.realized_depth,
                density_seconds = octree_stats.density_seconds,
                seconds = octree_seconds,
                memory_bytes = octree_stats.memory_bytes,
                "octree built"
            );
        }

        self.check_deadline(start, Stage::Solve)?;
        let solve_start = Instant::now();
        let function = PoissonSolver::new(config.solver_settings()).solve(&octree)?;
        let solve_seconds = solve_start.elapsed().as_secs_f64();
        *state = ReconstructionState::SolverConverged;

        self.check_deadline(start, Stage::Extraction)?;
        let extraction_start = Instant::now();
        let surface = IsosurfaceExtractor::new(config.iso_divide)
            .with_verbose(config.verbose)
            .extract(&function)?;
        let extraction_seconds = extraction_start.elapsed().as_secs_f64();
        *state = ReconstructionState::MeshExtracted;

        let summary = MeshSummary::of(&surface.mesh);
        let elapsed_seconds = start.elapsed().as_secs_f64();
        debug!(
            points = points.len(),
            triangles = summary.triangle_count,
            elapsed_seconds,
            "surface reconstructed"
        );

        Ok(Reconstruction {
            mesh: surface.mesh,
            elapsed_seconds,
            timings: StageTimings {
                octree_seconds,
                solve_seconds,
                extraction_seconds,
            },
            iso_value: function.iso_value(),
            octree: octree_stats,
            solve: function.reports().to_vec(),
            extraction: surface.stats,
            summary,
        })
    }
}

fn validate_input(points: &[Point3f], normals: &NormalField) -> Result<()> {
    if points.len() != normals.len() {
        return Err(Error::InvalidData(format!(
            "{} normals for {} points",
            normals.len(),
            points.len()
        )));
    }
    if let Some(index) = points.iter().position(|p| !is_finite_point(p)) {
        return Err(Error::InvalidData(format!("point {} has a non-finite coordinate", index)));
    }
    if let Some(index) = normals.first_invalid() {
        return Err(Error::InvalidData(format!("normal {} is zero or not finite", index)));
    }
    Ok(())
}

/// Reconstruct a surface from a point set and a normal field aligned with it
pub fn reconstruct_surface(
    points: &PointCloud<Point3f>,
    normals: &NormalField,
    config: &ReconstructionConfig,
) -> Result<Reconstruction> {
    SurfaceReconstructor::new(config.clone()).reconstruct(&points.points, normals)
}

/// Estimate normals, then reconstruct from them
pub fn reconstruct_with_estimated_normals(
    points: &PointCloud<Point3f>,
    normal_config: &NormalEstimationConfig,
    config: &ReconstructionConfig,
) -> Result<(NormalEstimate, Reconstruction)> {
    let estimate = estimate_normals(points, normal_config)?;
    let reconstruction = reconstruct_surface(points, &estimate.normals, config)?;
    Ok((estimate, reconstruction))
}
