//! Core data structures and traits for psrecon
//!
//! This crate provides the fundamental types shared by the normal estimator and
//! the surface reconstructor: points, point clouds, normal fields, triangle
//! meshes, the error taxonomy and the nearest-neighbor search trait.

pub mod point;
pub mod point_cloud;
pub mod normal_field;
pub mod mesh;
pub mod traits;
pub mod error;

pub use point::*;
pub use point_cloud::*;
pub use normal_field::*;
pub use mesh::*;
pub use traits::*;
pub use error::*;

/// Re-export commonly used types from nalgebra
pub use nalgebra::{Point3, Vector3, Matrix3};

// Type aliases for easier imports
pub type Point = Point3f;
pub type Mesh = TriangleMesh;
