//! # psrecon Reconstruction
//!
//! Poisson surface reconstruction on a density-adaptive octree.
//!
//! Oriented points are binned into an [`Octree`], the Poisson system for the
//! indicator function is solved coarse to fine by the [`PoissonSolver`], and
//! the [`IsosurfaceExtractor`] turns the solved [`ImplicitFunction`] into a
//! watertight [`psrecon_core::TriangleMesh`]. [`SurfaceReconstructor`] runs
//! the three stages as one call.

pub mod basis;
pub mod isosurface;
pub mod octree;
pub mod parallel;
pub mod pipeline;
pub mod poisson;
pub mod sparse;

// Re-export commonly used items
pub use isosurface::{ExtractionStats, Isosurface, IsosurfaceExtractor, LeafCell};
pub use octree::{CubeFrame, Octree, OctreeBuilder, OctreeNode, OctreeStats, Sample};
pub use parallel::{init_thread_pool, ThreadPoolConfig};
pub use pipeline::*;
pub use poisson::*;
