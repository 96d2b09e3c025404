//! Normal estimation algorithms
//!
//! Normals are fitted per point by principal component analysis of a local
//! neighborhood, then given a consistent sign by propagating orientation along
//! a minimum spanning tree of the neighbor graph.

use crate::nearest_neighbor::SpatialIndex;
use crate::neighbor_graph::{GraphType, NeighborGraph, NeighborGraphBuilder};
use nalgebra::{Matrix3, SymmetricEigen};
use psrecon_core::{
    to_vector3d, Error, NearestNeighborSearch, NormalField, NormalPoint3f, Point3f, PointCloud, Result, Stage,
    Vector3d, Vector3f,
};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::time::Instant;
use tracing::{debug, warn};

/// Minimum neighborhood size (the point itself included) for a plane fit
const MIN_FIT_POINTS: usize = 3;

/// Relative eigenvalue floor below which a neighborhood counts as collinear
const RANK_TOLERANCE: f64 = 1e-10;

/// Which points contribute to a point's local plane fit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NeighborhoodMode {
    /// A constant number of nearest neighbors
    Fixed,
    /// All points within a Euclidean radius
    Radius,
}

/// Configuration for normal estimation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalEstimationConfig {
    pub mode: NeighborhoodMode,
    /// Neighbors per point in `Fixed` mode (1..=20); fits use at least two
    pub fixed_neighbor_count: usize,
    /// Search radius in `Radius` mode
    pub radius: f32,
    /// Graph used for orientation propagation and degenerate fill
    pub graph_type: GraphType,
    /// Neighbors per point of the KNN graph (1..=20)
    pub k_for_knn: usize,
    /// Candidate neighborhood size of the Riemann graph
    pub riemann_neighbors: usize,
}

impl Default for NormalEstimationConfig {
    fn default() -> Self {
        Self {
            mode: NeighborhoodMode::Radius,
            fixed_neighbor_count: 4,
            radius: 1.0,
            graph_type: GraphType::Knn,
            k_for_knn: 5,
            riemann_neighbors: 8,
        }
    }
}

impl NormalEstimationConfig {
    /// Fixed-count neighborhoods with the given neighbor count
    pub fn fixed(count: usize) -> Self {
        Self {
            mode: NeighborhoodMode::Fixed,
            fixed_neighbor_count: count,
            ..Default::default()
        }
    }

    /// Radius neighborhoods with the given radius
    pub fn with_radius(mut self, radius: f32) -> Self {
        self.mode = NeighborhoodMode::Radius;
        self.radius = radius;
        self
    }

    pub fn with_mode(mut self, mode: NeighborhoodMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_fixed_neighbor_count(mut self, count: usize) -> Self {
        self.fixed_neighbor_count = count;
        self
    }

    pub fn with_graph_type(mut self, graph_type: GraphType) -> Self {
        self.graph_type = graph_type;
        self
    }

    pub fn with_k_for_knn(mut self, k: usize) -> Self {
        self.k_for_knn = k;
        self
    }

    pub fn with_riemann_neighbors(mut self, count: usize) -> Self {
        self.riemann_neighbors = count;
        self
    }

    /// Check parameter ranges
    pub fn validate(&self) -> Result<()> {
        if !(1..=20).contains(&self.fixed_neighbor_count) {
            return Err(Error::InvalidData(format!(
                "fixed neighbor count must be in 1..=20, got {}",
                self.fixed_neighbor_count
            )));
        }
        if !(self.radius.is_finite() && self.radius > 0.0) {
            return Err(Error::InvalidData(format!("radius must be positive, got {}", self.radius)));
        }
        if !(1..=20).contains(&self.k_for_knn) {
            return Err(Error::InvalidData(format!("k for KNN must be in 1..=20, got {}", self.k_for_knn)));
        }
        if self.riemann_neighbors == 0 {
            return Err(Error::InvalidData("Riemann neighborhood size must be at least 1".to_string()));
        }
        Ok(())
    }

    fn graph_builder(&self) -> NeighborGraphBuilder {
        NeighborGraphBuilder::new(self.graph_type)
            .with_k(self.k_for_knn)
            .with_riemann_neighbors(self.riemann_neighbors)
    }
}

/// Result of normal estimation
#[derive(Debug, Clone)]
pub struct NormalEstimate {
    /// Unit normals aligned with the input points
    pub normals: NormalField,
    /// Wall time of the whole estimation in seconds
    pub elapsed_seconds: f64,
    /// Connected components of the orientation graph
    pub components: usize,
    /// True when components were oriented independently of each other
    pub independently_oriented: bool,
    /// Points whose normal was interpolated from graph neighbors
    pub degenerate_filled: usize,
}

/// Estimate consistently oriented normals for a point cloud
pub fn estimate_normals(cloud: &PointCloud<Point3f>, config: &NormalEstimationConfig) -> Result<NormalEstimate> {
    let start = Instant::now();
    config.validate()?;
    cloud.ensure_finite()?;

    let points = &cloud.points;
    let index = SpatialIndex::new(points);
    let graph = config.graph_builder().build_with_search(points, &index)?;

    let mut fitted: Vec<Option<Vector3d>> = (0..points.len())
        .into_par_iter()
        .map(|i| {
            let members = neighborhood(&index, points, i, config);
            fit_plane_normal(points, &members)
        })
        .collect();

    let degenerate_filled = fill_degenerate(&mut fitted, &graph)?;
    let mut normals: Vec<Vector3d> = fitted.into_iter().map(|n| n.unwrap_or_else(Vector3d::z)).collect();

    let components = orient_normals(points, &mut normals, &graph);
    let independently_oriented = components > 1;
    if independently_oriented {
        warn!(components, "neighbor graph is disconnected; components are oriented independently");
    }
    if degenerate_filled > 0 {
        warn!(degenerate_filled, "degenerate neighborhoods filled from graph neighbors");
    }

    let normals: NormalField = normals
        .iter()
        .map(|n| Vector3f::new(n.x as f32, n.y as f32, n.z as f32))
        .collect();

    let elapsed_seconds = start.elapsed().as_secs_f64();
    debug!(
        points = points.len(),
        mode = ?config.mode,
        components,
        degenerate_filled,
        elapsed_seconds,
        "normals estimated"
    );

    Ok(NormalEstimate {
        normals,
        elapsed_seconds,
        components,
        independently_oriented,
        degenerate_filled,
    })
}

/// Estimate normals and attach them to the points
pub fn estimate_normals_cloud(
    cloud: &PointCloud<Point3f>,
    config: &NormalEstimationConfig,
) -> Result<PointCloud<NormalPoint3f>> {
    let estimate = estimate_normals(cloud, config)?;
    cloud.with_normals(&estimate.normals)
}

/// Indices of the points used for the plane fit at `i`, the point itself first
fn neighborhood<S: NearestNeighborSearch>(
    search: &S,
    points: &[Point3f],
    i: usize,
    config: &NormalEstimationConfig,
) -> Vec<usize> {
    let query = &points[i];
    // A plane fit needs MIN_FIT_POINTS points even for the smallest counts
    let fit_count = config.fixed_neighbor_count.max(MIN_FIT_POINTS - 1);
    let found = match config.mode {
        NeighborhoodMode::Fixed => search.find_k_nearest(query, fit_count + 1),
        NeighborhoodMode::Radius => search.find_radius_neighbors(query, config.radius),
    };

    let mut indices = Vec::with_capacity(found.len());
    indices.push(i);
    indices.extend(found.into_iter().map(|(j, _)| j).filter(|&j| j != i));
    if config.mode == NeighborhoodMode::Fixed {
        indices.truncate(fit_count + 1);
    }
    indices
}

/// Least-variance direction of the neighborhood, or `None` when underdetermined
pub fn fit_plane_normal(points: &[Point3f], neighborhood: &[usize]) -> Option<Vector3d> {
    if neighborhood.len() < MIN_FIT_POINTS {
        return None;
    }

    let count = neighborhood.len() as f64;
    let centroid = neighborhood
        .iter()
        .fold(Vector3d::zeros(), |acc, &j| acc + to_vector3d(&points[j].coords))
        / count;

    let covariance = neighborhood.iter().fold(Matrix3::<f64>::zeros(), |acc, &j| {
        let d = to_vector3d(&points[j].coords) - centroid;
        acc + d * d.transpose()
    }) / count;

    let eigen = SymmetricEigen::new(covariance);
    let mut order = [0usize, 1, 2];
    order.sort_by(|&a, &b| eigen.eigenvalues[a].total_cmp(&eigen.eigenvalues[b]));

    let largest = eigen.eigenvalues[order[2]];
    let middle = eigen.eigenvalues[order[1]];
    if !(largest > 0.0) || middle <= largest * RANK_TOLERANCE {
        return None;
    }

    let normal = eigen.eigenvectors.column(order[0]).into_owned();
    normal.try_normalize(0.0).filter(|n| n.iter().all(|c| c.is_finite()))
}

/// Replace underdetermined fits with the sign-aligned mean of the nearest
/// well-fitted graph neighbors, found by breadth-first search.
fn fill_degenerate(fitted: &mut [Option<Vector3d>], graph: &NeighborGraph) -> Result<usize> {
    let degenerate: Vec<usize> = (0..fitted.len()).filter(|&i| fitted[i].is_none()).collect();
    if degenerate.is_empty() {
        return Ok(0);
    }

    let fills: Vec<(usize, Option<Vector3d>)> = degenerate
        .par_iter()
        .map(|&i| (i, nearest_fitted_mean(fitted, graph, i)))
        .collect();

    for (i, fill) in fills {
        match fill {
            Some(normal) => fitted[i] = Some(normal),
            None => {
                return Err(Error::DegenerateNeighborhood {
                    stage: Stage::NormalEstimation,
                    index: i,
                    reason: format!(
                        "fewer than {} usable neighbors and no well-fitted point reachable in the graph",
                        MIN_FIT_POINTS
                    ),
                })
            }
        }
    }
    Ok(degenerate.len())
}

fn nearest_fitted_mean(fitted: &[Option<Vector3d>], graph: &NeighborGraph, start: usize) -> Option<Vector3d> {
    let mut hops = vec![usize::MAX; fitted.len()];
    let mut queue = VecDeque::from([start]);
    hops[start] = 0;

    let mut found: Vec<Vector3d> = Vec::new();
    let mut found_at = usize::MAX;

    while let Some(node) = queue.pop_front() {
        if hops[node] > found_at {
            break;
        }
        if let Some(normal) = fitted[node] {
            found_at = hops[node];
            found.push(normal);
            continue;
        }
        for edge in graph.neighbors(node) {
            if hops[edge.target] == usize::MAX {
                hops[edge.target] = hops[node] + 1;
                queue.push_back(edge.target);
            }
        }
    }

    let reference = *found.first()?;
    let sum = found.iter().fold(Vector3d::zeros(), |acc, n| {
        if n.dot(&reference) < 0.0 {
            acc - n
        } else {
            acc + n
        }
    });
    Some(sum.try_normalize(1e-12).unwrap_or(reference))
}

/// Min-heap entry for Prim's traversal
#[derive(Debug, PartialEq)]
struct Frontier {
    cost: f64,
    node: usize,
    parent: usize,
}

impl Eq for Frontier {}

impl Ord for Frontier {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .cost
            .total_cmp(&self.cost)
            .then(other.node.cmp(&self.node))
            .then(other.parent.cmp(&self.parent))
    }
}

impl PartialOrd for Frontier {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Give every connected component a single sign convention.
///
/// Each component is rooted at its highest point, whose normal is turned
/// towards +z, and grown along the edges whose normals are closest to
/// parallel. Returns the number of components.
fn orient_normals(points: &[Point3f], normals: &mut [Vector3d], graph: &NeighborGraph) -> usize {
    let labels = graph.components();
    let component_count = labels.iter().max().map_or(0, |max| max + 1);

    let mut roots = vec![usize::MAX; component_count];
    for (i, &label) in labels.iter().enumerate() {
        let root = roots[label];
        if root == usize::MAX || points[i].z > points[root].z {
            roots[label] = i;
        }
    }

    let mut visited = vec![false; points.len()];
    let mut heap = BinaryHeap::new();
    for root in roots {
        if normals[root].z < 0.0 {
            normals[root] = -normals[root];
        }
        heap.push(Frontier { cost: 0.0, node: root, parent: root });

        while let Some(Frontier { node, parent, .. }) = heap.pop() {
            if visited[node] {
                continue;
            }
            visited[node] = true;
            if node != parent && normals[node].dot(&normals[parent]) < 0.0 {
                normals[node] = -normals[node];
            }

            for edge in graph.neighbors(node) {
                if !visited[edge.target] {
                    let cost = 1.0 - normals[node].dot(&normals[edge.target]).abs();
                    heap.push(Frontier { cost, node: edge.target, parent: node });
                }
            }
        }
    }

    component_count
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn grid(size: usize, z: f32) -> Vec<Point3f> {
        (0..size * size)
            .map(|i| Point3f::new((i % size) as f32 * 0.1, (i / size) as f32 * 0.1, z))
            .collect()
    }

    #[test]
    fn test_default_config() {
        let config = NormalEstimationConfig::default();
        assert_eq!(config.mode, NeighborhoodMode::Radius);
        assert_eq!(config.fixed_neighbor_count, 4);
        assert_eq!(config.k_for_knn, 5);
        assert_eq!(config.graph_type, GraphType::Knn);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_out_of_range() {
        assert!(NormalEstimationConfig::fixed(0).validate().is_err());
        assert!(NormalEstimationConfig::fixed(21).validate().is_err());
        assert!(NormalEstimationConfig::default().with_radius(0.0).validate().is_err());
        assert!(NormalEstimationConfig::default().with_k_for_knn(0).validate().is_err());
    }

    #[test]
    fn test_fit_plane_normal_on_plane() {
        let points = grid(3, 2.0);
        let neighborhood: Vec<usize> = (0..points.len()).collect();
        let normal = fit_plane_normal(&points, &neighborhood).unwrap();
        assert_relative_eq!(normal.z.abs(), 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_fit_plane_normal_rejects_collinear() {
        let points: Vec<Point3f> = (0..5).map(|i| Point3f::new(i as f32, 0.0, 0.0)).collect();
        assert!(fit_plane_normal(&points, &[0, 1, 2, 3, 4]).is_none());
        assert!(fit_plane_normal(&points, &[0, 1]).is_none());
    }

    #[test]
    fn test_plane_normals_point_up() {
        let cloud = PointCloud::from_points(grid(10, 0.0));
        let estimate = estimate_normals(&cloud, &NormalEstimationConfig::fixed(6)).unwrap();

        assert_eq!(estimate.normals.len(), cloud.len());
        assert_eq!(estimate.components, 1);
        for normal in &estimate.normals {
            assert_relative_eq!(normal.z, 1.0, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_disconnected_components_are_flagged() {
        let mut points = grid(6, 0.0);
        points.extend(grid(6, 0.0).into_iter().map(|p| p + Vector3f::new(100.0, 0.0, 0.0)));
        let cloud = PointCloud::from_points(points);

        let estimate = estimate_normals(&cloud, &NormalEstimationConfig::fixed(5).with_k_for_knn(4)).unwrap();
        assert_eq!(estimate.components, 2);
        assert!(estimate.independently_oriented);
    }

    #[test]
    fn test_collinear_tail_is_filled_from_graph() {
        // A plane patch with a short collinear spur; radius fits on the spur are underdetermined
        let mut points = grid(8, 0.0);
        points.push(Point3f::new(1.5, 0.35, 0.0));
        points.push(Point3f::new(2.5, 0.35, 0.0));
        let cloud = PointCloud::from_points(points);

        let config = NormalEstimationConfig::default().with_radius(0.25).with_k_for_knn(3);
        let estimate = estimate_normals(&cloud, &config).unwrap();
        assert!(estimate.degenerate_filled >= 1);
        assert!(estimate.normals.is_valid());
    }

    #[test]
    fn test_frontier_is_min_heap() {
        let mut heap = BinaryHeap::new();
        heap.push(Frontier { cost: 0.5, node: 1, parent: 0 });
        heap.push(Frontier { cost: 0.1, node: 2, parent: 0 });
        heap.push(Frontier { cost: 0.1, node: 3, parent: 0 });
        assert_eq!(heap.pop().map(|f| f.node), Some(2));
        assert_eq!(heap.pop().map(|f| f.node), Some(3));
        assert_eq!(heap.pop().map(|f| f.node), Some(1));
    }
}
