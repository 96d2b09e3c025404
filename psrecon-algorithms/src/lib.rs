//! # psrecon Algorithms
//!
//! Point cloud algorithms that run ahead of surface reconstruction: spatial
//! search, proximity graphs and consistently oriented normal estimation.

pub mod nearest_neighbor;
pub mod neighbor_graph;
pub mod normals;

// Re-export commonly used items
pub use nearest_neighbor::*;
pub use neighbor_graph::*;
pub use normals::*;
