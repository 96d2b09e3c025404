//! # psrecon
//!
//! Surface reconstruction from unorganized 3D points.
//!
//! This is the umbrella crate over the psrecon workspace. It re-exports the
//! core types and, behind features, normal estimation and Poisson surface
//! reconstruction.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use psrecon::prelude::*;
//!
//! let golden_ratio = (1.0 + 5.0_f32.sqrt()) / 2.0;
//! let cloud: PointCloud<Point3f> = (0..1000)
//!     .map(|i| {
//!         let theta = 2.0 * std::f32::consts::PI * i as f32 / golden_ratio;
//!         let phi = (1.0 - 2.0 * (i as f32 + 0.5) / 1000.0).acos();
//!         Point3f::new(phi.sin() * theta.cos(), phi.sin() * theta.sin(), phi.cos())
//!     })
//!     .collect();
//!
//! // Estimate oriented normals, then reconstruct a watertight mesh
//! let estimate = estimate_normals(&cloud, &NormalEstimationConfig::fixed(4)).unwrap();
//! let result = reconstruct_surface(&cloud, &estimate.normals, &ReconstructionConfig::default()).unwrap();
//! println!("{} triangles in {:.2}s", result.mesh.face_count(), result.elapsed_seconds);
//! ```
//!
//! ## Feature Flags
//!
//! - `default`: Enables algorithms and reconstruction
//! - `algorithms`: Spatial index, neighbor graphs and normal estimation
//! - `reconstruction`: Octree Poisson surface reconstruction

// Re-export core functionality
pub use psrecon_core::*;

// Re-export sub-crates
#[cfg(feature = "algorithms")]
pub use psrecon_algorithms as algorithms;

#[cfg(feature = "reconstruction")]
pub use psrecon_reconstruction as reconstruction;

/// Convenient imports for common use cases
pub mod prelude {
    pub use psrecon_core::*;

    #[cfg(feature = "algorithms")]
    pub use psrecon_algorithms::{
        estimate_normals, estimate_normals_cloud, GraphType, NeighborGraph, NeighborGraphBuilder, NeighborhoodMode,
        NormalEstimate, NormalEstimationConfig, SpatialIndex,
    };

    #[cfg(feature = "reconstruction")]
    pub use psrecon_reconstruction::{
        poisson_reconstruction, reconstruct_surface, reconstruct_with_estimated_normals, Reconstruction,
        ReconstructionConfig, ReconstructionState, SurfaceReconstructor,
    };
}
