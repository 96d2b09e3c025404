//! Density-adaptive octree over an oriented point set
//!
//! Nodes live in a flat arena. The eight children of a node are stored
//! contiguously and referenced by the index of the first one, and nodes are
//! laid out level by level so every depth occupies one contiguous index range.
//!
//! Sample weight decides how deep the tree grows. A sample is splatted at
//! the first node on its path that the weight rule leaves unsplit, and each
//! level is closed so that node's 3x3x3 same-depth neighbors are present.

use crate::basis::{node_width, overlapping_offsets, tents_overlap, TentKey};
use crate::parallel;
use itertools::iproduct;
use psrecon_algorithms::SpatialIndex;
use psrecon_core::{
    bounds_of, to_point3d, to_vector3d, Error, NearestNeighborSearch, Point3d, Point3f, Result, Stage, Vector3d,
    Vector3f,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ops::Range;
use std::time::Instant;
use tracing::debug;

/// Sentinel for a leaf's child index
pub const NO_CHILD: u32 = u32::MAX;
/// Sentinel for the root's parent index
pub const NO_PARENT: u32 = u32::MAX;

/// Neighbor rank used for the sample density estimate
const DENSITY_NEIGHBORS: usize = 8;

/// Smallest neighbor distance used for density weights, in unit-cube lengths
const MIN_DENSITY_RADIUS: f64 = 1e-6;

/// Affine map between input coordinates and the unit reconstruction cube
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CubeFrame {
    pub origin: Point3d,
    pub size: f64,
}

impl CubeFrame {
    pub fn to_unit(&self, p: &Point3f) -> Vector3d {
        (to_point3d(p) - self.origin) / self.size
    }

    pub fn to_world(&self, unit: &Vector3d) -> Point3f {
        let p = self.origin + unit * self.size;
        Point3f::new(p.x as f32, p.y as f32, p.z as f32)
    }
}

/// An oriented sample in unit-cube coordinates
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub position: Vector3d,
    /// Unit normal, or the raw normal when confidence weighting is on
    pub normal: Vector3d,
    /// Surface area represented by the sample
    pub area: f64,
    /// Contribution to the subdivision weight
    pub weight: f64,
}

impl Sample {
    /// Weight of the sample in the vector field and the iso-value average
    pub fn field_weight(&self) -> f64 {
        self.area * self.normal.norm()
    }
}

/// Arena node of the octree
#[derive(Debug, Clone, PartialEq)]
pub struct OctreeNode {
    pub depth: u8,
    pub offset: [u32; 3],
    pub parent: u32,
    /// Index of the first of eight consecutive children, or [`NO_CHILD`]
    pub first_child: u32,
    /// Range of this node's samples in [`Octree::sample_order`]
    pub sample_start: u32,
    pub sample_end: u32,
    /// Accumulated subdivision weight of the contained samples
    pub sample_weight: f64,
    /// Split by the sample-weight rule rather than for neighbor closure
    pub refined: bool,
    /// Area-weighted sum of the contained normals (splat nodes only)
    pub normal_sum: Vector3d,
    /// Weighted centroid of the contained samples (splat nodes only)
    pub centroid: Vector3d,
    /// Sum of the contained samples' field weights (splat nodes only)
    pub field_weight: f64,
}

impl OctreeNode {
    fn new(depth: u8, offset: [u32; 3], parent: u32, samples: Range<u32>, sample_weight: f64) -> Self {
        Self {
            depth,
            offset,
            parent,
            first_child: NO_CHILD,
            sample_start: samples.start,
            sample_end: samples.end,
            sample_weight,
            refined: false,
            normal_sum: Vector3d::zeros(),
            centroid: Vector3d::zeros(),
            field_weight: 0.0,
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.first_child == NO_CHILD
    }

    pub fn sample_count(&self) -> usize {
        (self.sample_end - self.sample_start) as usize
    }

    pub fn key(&self) -> TentKey {
        TentKey::new(self.depth, self.offset)
    }
}

/// Summary of a built octree
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OctreeStats {
    pub node_count: usize,
    pub leaf_count: usize,
    pub realized_depth: u8,
    pub nodes_per_depth: Vec<usize>,
    pub memory_bytes: usize,
    pub density_seconds: f64,
}

/// Builds an [`Octree`] from oriented points
#[derive(Debug, Clone)]
pub struct OctreeBuilder {
    max_depth: u8,
    scale: f64,
    samples_per_node: f64,
    confidence: bool,
}

impl Default for OctreeBuilder {
    fn default() -> Self {
        Self {
            max_depth: 8,
            scale: 1.25,
            samples_per_node: 1.0,
            confidence: false,
        }
    }
}

impl OctreeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_depth(mut self, max_depth: u8) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn with_scale(mut self, scale: f64) -> Self {
        self.scale = scale;
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

    /// Build the octree; `points` and `normals` must have equal length
    pub fn build(&self, points: &[Point3f], normals: &[Vector3f]) -> Result<Octree> {
        if points.is_empty() {
            return Err(Error::insufficient_input(Stage::OctreeBuild, "no points to reconstruct from"));
        }
        if points.len() != normals.len() {
            return Err(Error::InvalidData(format!(
                "{} normals for {} points",
                normals.len(),
                points.len()
            )));
        }

        let frame = self.frame(points)?;
        let density_start = Instant::now();
        let areas = density_areas(points, frame.size);
        let density_seconds = density_start.elapsed().as_secs_f64();

        let samples: Vec<Sample> = points
            .iter()
            .zip(normals)
            .zip(areas)
            .map(|((p, n), area)| {
                let raw = to_vector3d(n);
                let magnitude = raw.norm();
                let (normal, weight) = if self.confidence {
                    (raw, magnitude)
                } else {
                    (raw / magnitude, 1.0)
                };
                Sample {
                    position: frame.to_unit(p),
                    normal,
                    area,
                    weight,
                }
            })
            .collect();

        let mut octree = self.subdivide(frame, samples);
        octree.accumulate_splat_nodes();
        octree.density_seconds = density_seconds;

        debug!(
            nodes = octree.nodes.len(),
            realized_depth = octree.realized_depth(),
            max_depth = self.max_depth,
            "octree built"
        );
        Ok(octree)
    }

    /// Bounding cube of the points inflated by `scale`
    fn frame(&self, points: &[Point3f]) -> Result<CubeFrame> {
        let (min, max) = bounds_of(points);
        let extent = (max - min).amax() as f64;
        if !(extent.is_finite() && extent > 0.0) {
            return Err(Error::degenerate_input(
                Stage::OctreeBuild,
                "all points coincide; the bounding cube has zero volume",
            ));
        }

        let center = to_point3d(&nalgebra::center(&min, &max));
        let size = extent * self.scale;
        Ok(CubeFrame {
            origin: center - Vector3d::repeat(size * 0.5),
            size,
        })
    }

    fn subdivide(&self, frame: CubeFrame, samples: Vec<Sample>) -> Octree {
        let total_weight: f64 = samples.iter().map(|s| s.weight).sum();
        let mut order: Vec<u32> = (0..samples.len() as u32).collect();
        let mut nodes = vec![OctreeNode::new(0, [0, 0, 0], NO_PARENT, 0..samples.len() as u32, total_weight)];
        let mut depth_ranges = vec![0..1];

        let mut level = 0..1;
        while !level.is_empty() {
            let next = nodes.len();
            let refine = self.refinement(&nodes, &order, &samples, level.clone());
            for (index, refine) in level.clone().zip(refine) {
                if refine {
                    nodes[index].refined = self.passes_weight_rule(&nodes[index]);
                    split(&mut nodes, &mut order, &samples, index);
                }
            }
            level = next..nodes.len();
            if !level.is_empty() {
                depth_ranges.push(level.clone());
            }
        }

        let lookup = depth_ranges
            .iter()
            .map(|range| range.clone().map(|i| (nodes[i].offset, i as u32)).collect())
            .collect();

        Octree {
            nodes,
            depth_ranges,
            lookup,
            frame,
            samples,
            order,
            density_seconds: 0.0,
        }
    }

    fn passes_weight_rule(&self, node: &OctreeNode) -> bool {
        node.depth < self.max_depth && node.sample_weight > self.samples_per_node
    }

    /// Which nodes of one level to split
    ///
    /// Nodes passing the weight rule split. Each of their children that holds
    /// samples needs its 3x3x3 neighbors, so the parents of those neighbors
    /// on this level split too. Closure splits impose no
    /// further neighbors and never add a level the weight rule did not reach.
    fn refinement(&self, nodes: &[OctreeNode], order: &[u32], samples: &[Sample], level: Range<usize>) -> Vec<bool> {
        let base = level.start;
        let by_offset: HashMap<[u32; 3], usize> = level.clone().map(|i| (nodes[i].offset, i - base)).collect();
        let weighted: Vec<usize> = level.clone().filter(|&i| self.passes_weight_rule(&nodes[i])).collect();
        let mut refine = vec![false; level.len()];

        for index in weighted {
            refine[index - base] = true;
            let node = &nodes[index];
            let mut cells: Vec<[u32; 3]> = order[node.sample_start as usize..node.sample_end as usize]
                .iter()
                .map(|&s| child_offset(node.offset, octant(&samples[s as usize].position, node.depth, node.offset)))
                .collect();
            cells.sort_unstable();
            cells.dedup();

            for cell in cells {
                for neighbor in same_depth_neighbors(cell, node.depth + 1) {
                    let parent = neighbor.map(|c| c >> 1);
                    if let Some(&j) = by_offset.get(&parent) {
                        refine[j] = true;
                    }
                }
            }
        }
        refine
    }
}

/// Child octant of the node at `depth`/`offset` that contains `position`
fn octant(position: &Vector3d, depth: u8, offset: [u32; 3]) -> usize {
    let child_scale = ((depth + 1) as f64).exp2();
    (0..3)
        .map(|k| {
            let cell = (position[k] * child_scale).floor() as i64 - 2 * offset[k] as i64;
            (cell.clamp(0, 1) as usize) << k
        })
        .sum()
}

fn child_offset(offset: [u32; 3], child: usize) -> [u32; 3] {
    [
        2 * offset[0] + (child & 1) as u32,
        2 * offset[1] + ((child >> 1) & 1) as u32,
        2 * offset[2] + ((child >> 2) & 1) as u32,
    ]
}

/// In-cube offsets of the 3x3x3 block centered on `cell` at `depth`
fn same_depth_neighbors(cell: [u32; 3], depth: u8) -> impl Iterator<Item = [u32; 3]> {
    let resolution = 1i64 << depth;
    let axis = move |k: usize| {
        let c = cell[k] as i64;
        (c - 1).max(0) as u32..=(c + 1).min(resolution - 1) as u32
    };
    iproduct!(axis(0), axis(1), axis(2)).map(|(x, y, z)| [x, y, z])
}

/// Split a node into eight children, partitioning its samples by octant
fn split(nodes: &mut Vec<OctreeNode>, order: &mut [u32], samples: &[Sample], index: usize) {
    let (depth, offset, start, end) = {
        let node = &nodes[index];
        (node.depth, node.offset, node.sample_start, node.sample_end)
    };
    let octant_of = |s: u32| octant(&samples[s as usize].position, depth, offset);

    let slice = &mut order[start as usize..end as usize];
    slice.sort_by_key(|&s| octant_of(s));

    let first_child = nodes.len() as u32;
    let mut cursor = start;
    for child in 0..8usize {
        let count = slice.iter().filter(|&&s| octant_of(s) == child).count() as u32;
        let weight: f64 = slice[(cursor - start) as usize..(cursor - start + count) as usize]
            .iter()
            .map(|&s| samples[s as usize].weight)
            .sum();
        nodes.push(OctreeNode::new(
            depth + 1,
            child_offset(offset, child),
            index as u32,
            cursor..cursor + count,
            weight,
        ));
        cursor += count;
    }
    nodes[index].first_child = first_child;
}

/// Area represented by each sample, `pi r^2 / k` with `r` the distance to
/// its k-th nearest neighbor, in unit-cube lengths
fn density_areas(points: &[Point3f], cube_size: f64) -> Vec<f64> {
    let k = DENSITY_NEIGHBORS.min(points.len().saturating_sub(1));
    if k == 0 {
        return vec![1.0; points.len()];
    }

    let index = SpatialIndex::new(points);
    parallel::parallel_map(points, |p| {
        let radius = index
            .find_k_nearest(p, k + 1)
            .last()
            .map_or(0.0, |&(_, distance)| distance as f64 / cube_size)
            .max(MIN_DENSITY_RADIUS);
        std::f64::consts::PI * radius * radius / k as f64
    })
}

/// Density-adaptive octree over an oriented point set
#[derive(Debug, Clone)]
pub struct Octree {
    nodes: Vec<OctreeNode>,
    depth_ranges: Vec<Range<usize>>,
    lookup: Vec<HashMap<[u32; 3], u32>>,
    frame: CubeFrame,
    samples: Vec<Sample>,
    order: Vec<u32>,
    density_seconds: f64,
}

impl Octree {
    pub fn nodes(&self) -> &[OctreeNode] {
        &self.nodes
    }

    pub fn node(&self, index: usize) -> &OctreeNode {
        &self.nodes[index]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn frame(&self) -> &CubeFrame {
        &self.frame
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    /// Sample indices grouped so every node owns a contiguous range
    pub fn sample_order(&self) -> &[u32] {
        &self.order
    }

    /// Deepest depth that holds nodes
    pub fn realized_depth(&self) -> u8 {
        (self.depth_ranges.len() - 1) as u8
    }

    /// Node index range of one depth; empty beyond the realized depth
    pub fn depth_range(&self, depth: u8) -> Range<usize> {
        self.depth_ranges.get(depth as usize).cloned().unwrap_or(0..0)
    }

    /// Node at `depth` with integer `offset`
    pub fn find(&self, depth: u8, offset: [u32; 3]) -> Option<usize> {
        self.lookup
            .get(depth as usize)
            .and_then(|level| level.get(&offset))
            .map(|&i| i as usize)
    }

    pub fn children(&self, index: usize) -> Option<Range<usize>> {
        let first = self.nodes[index].first_child;
        (first != NO_CHILD).then(|| first as usize..first as usize + 8)
    }

    pub fn parent(&self, index: usize) -> Option<usize> {
        let parent = self.nodes[index].parent;
        (parent != NO_PARENT).then_some(parent as usize)
    }

    pub fn leaves(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.nodes.len()).filter(|&i| self.nodes[i].is_leaf())
    }

    /// Nodes where the weight rule stopped: unrefined, with a refined parent
    ///
    /// Every sample lies in exactly one of them, and each one's 3x3x3
    /// same-depth neighbors are present in the tree.
    pub fn splat_nodes(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.nodes.len()).filter(|&i| {
            !self.nodes[i].refined && self.parent(i).map_or(true, |p| self.nodes[p].refined)
        })
    }

    pub fn node_samples(&self, index: usize) -> impl Iterator<Item = &Sample> + '_ {
        let node = &self.nodes[index];
        self.order[node.sample_start as usize..node.sample_end as usize]
            .iter()
            .map(move |&s| &self.samples[s as usize])
    }

    /// Visit every node whose tent overlaps `key`, coarsest depth first
    ///
    /// Coarser and equal depths are found by offset lookup; finer depths by
    /// descending from the overlapping nodes at `key.depth`, since a child's
    /// support lies inside its parent's.
    pub fn for_each_overlapping(&self, key: &TentKey, mut visit: impl FnMut(usize)) {
        let mut frontier = Vec::new();
        for depth in 0..=key.depth.min(self.realized_depth()) {
            for offset in overlapping_offsets(key, depth) {
                if let Some(index) = self.find(depth, offset) {
                    visit(index);
                    if depth == key.depth {
                        frontier.push(index);
                    }
                }
            }
        }

        while !frontier.is_empty() {
            let mut next = Vec::new();
            for node in frontier {
                let Some(children) = self.children(node) else { continue };
                for child in children {
                    if tents_overlap(key, &self.nodes[child].key()) {
                        visit(child);
                        next.push(child);
                    }
                }
            }
            frontier = next;
        }
    }

    /// Approximate heap footprint
    pub fn memory_bytes(&self) -> usize {
        let lookup_entries: usize = self.lookup.iter().map(|level| level.capacity()).sum();
        self.nodes.capacity() * std::mem::size_of::<OctreeNode>()
            + lookup_entries * (std::mem::size_of::<[u32; 3]>() + std::mem::size_of::<u32>() + 1)
            + self.samples.capacity() * std::mem::size_of::<Sample>()
            + self.order.capacity() * std::mem::size_of::<u32>()
    }

    pub fn stats(&self) -> OctreeStats {
        OctreeStats {
            node_count: self.nodes.len(),
            leaf_count: self.leaves().count(),
            realized_depth: self.realized_depth(),
            nodes_per_depth: self.depth_ranges.iter().map(|r| r.len()).collect(),
            memory_bytes: self.memory_bytes(),
            density_seconds: self.density_seconds,
        }
    }

    /// Accumulate the weighted normal sum and centroid of every splat node
    fn accumulate_splat_nodes(&mut self) {
        let splats: Vec<usize> = self.splat_nodes().collect();
        let sums = parallel::parallel_map(&splats, |&splat| {
            let mut normal_sum = Vector3d::zeros();
            let mut weighted_position = Vector3d::zeros();
            let mut total = 0.0;
            for sample in self.node_samples(splat) {
                let w = sample.field_weight();
                normal_sum += sample.normal * sample.area;
                weighted_position += sample.position * w;
                total += w;
            }
            (normal_sum, weighted_position, total)
        });

        for (&splat, (normal_sum, weighted_position, total)) in splats.iter().zip(sums) {
            let node = &mut self.nodes[splat];
            node.normal_sum = normal_sum;
            node.field_weight = total;
            node.centroid = if total > 0.0 {
                weighted_position / total
            } else {
                key_center(node.depth, node.offset)
            };
        }
    }
}

fn key_center(depth: u8, offset: [u32; 3]) -> Vector3d {
    let w = node_width(depth);
    Vector3d::new(
        (offset[0] as f64 + 0.5) * w,
        (offset[1] as f64 + 0.5) * w,
        (offset[2] as f64 + 0.5) * w,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

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

    #[test]
    fn test_subdivision_rule() {
        let (points, normals) = sphere(400);
        let builder = OctreeBuilder::new().with_max_depth(5).with_samples_per_node(2.0);
        let octree = builder.build(&points, &normals).unwrap();

        for node in octree.nodes() {
            if node.is_leaf() {
                assert!(node.depth == 5 || node.sample_weight <= 2.0);
                assert!(!node.refined);
            } else {
                assert!(node.depth < 5);
                assert_eq!(node.refined, node.sample_weight > 2.0);
            }
        }
        assert!(octree.realized_depth() <= 5);

        // The deepest level is only reached through the weight rule
        let deepest = octree.depth_range(octree.realized_depth() - 1);
        assert!(deepest.clone().any(|i| octree.node(i).refined));
    }

    #[test]
    fn test_splat_nodes_partition_samples() {
        let (points, normals) = sphere(600);
        let octree = OctreeBuilder::new().with_max_depth(6).build(&points, &normals).unwrap();

        let splats: Vec<usize> = octree.splat_nodes().collect();
        let covered: usize = splats.iter().map(|&i| octree.node(i).sample_count()).sum();
        assert_eq!(covered, points.len());
        for &i in &splats {
            let node = octree.node(i);
            assert!(!node.refined);
            assert!(node.depth == 6 || node.sample_weight <= 1.0);
        }
    }

    #[test]
    fn test_splat_nodes_have_all_neighbors() {
        for count in [500, 1000, 2000] {
            let (points, normals) = sphere(count);
            let octree = OctreeBuilder::new().build(&points, &normals).unwrap();

            for node in octree.splat_nodes().map(|i| octree.node(i)).filter(|n| n.sample_count() > 0) {
                for neighbor in same_depth_neighbors(node.offset, node.depth) {
                    assert!(
                        octree.find(node.depth, neighbor).is_some(),
                        "missing neighbor {:?} of {:?} at depth {}",
                        neighbor,
                        node.offset,
                        node.depth
                    );
                }
            }
        }
    }

    #[test]
    fn test_closure_splits_sparse_neighbors() {
        // A close pair drives refinement; the empty cells around it are split
        // too even though they carry no weight
        let points = vec![
            Point3f::new(0.0, 0.0, 0.0),
            Point3f::new(0.01, 0.0, 0.0),
            Point3f::new(0.3, 0.0, 0.0),
            Point3f::new(1.0, 1.0, 1.0),
        ];
        let normals = vec![Vector3f::z(); 4];
        let octree = OctreeBuilder::new().with_max_depth(6).build(&points, &normals).unwrap();

        for node in octree.splat_nodes().map(|i| octree.node(i)).filter(|n| n.sample_count() > 0) {
            for neighbor in same_depth_neighbors(node.offset, node.depth) {
                assert!(octree.find(node.depth, neighbor).is_some());
            }
        }
        let structural: Vec<&OctreeNode> = octree.nodes().iter().filter(|n| !n.is_leaf() && !n.refined).collect();
        assert!(!structural.is_empty());
        assert!(structural.iter().all(|n| n.sample_weight <= 1.0));
    }

    #[test]
    fn test_neighbor_block_is_clipped_to_cube() {
        assert_eq!(same_depth_neighbors([0, 0, 0], 0).count(), 1);
        assert_eq!(same_depth_neighbors([0, 0, 0], 2).count(), 8);
        assert_eq!(same_depth_neighbors([1, 1, 1], 2).count(), 27);
        assert_eq!(same_depth_neighbors([3, 1, 3], 2).count(), 12);
    }

    #[test]
    fn test_children_are_contiguous_and_partition_samples() {
        let (points, normals) = sphere(300);
        let octree = OctreeBuilder::new().with_max_depth(6).build(&points, &normals).unwrap();

        for index in 0..octree.len() {
            if let Some(children) = octree.children(index) {
                let node = octree.node(index);
                let child_samples: usize = children.clone().map(|c| octree.node(c).sample_count()).sum();
                assert_eq!(child_samples, node.sample_count());
                for child in children {
                    assert_eq!(octree.parent(child), Some(index));
                    assert_eq!(octree.node(child).depth, node.depth + 1);
                }
            }
        }

        let leaf_samples: usize = octree.leaves().map(|l| octree.node(l).sample_count()).sum();
        assert_eq!(leaf_samples, points.len());
    }

    #[test]
    fn test_samples_lie_in_their_leaf() {
        let (points, normals) = sphere(200);
        let octree = OctreeBuilder::new().with_max_depth(6).build(&points, &normals).unwrap();

        for leaf in octree.leaves() {
            let node = octree.node(leaf);
            let w = node_width(node.depth);
            for sample in octree.node_samples(leaf) {
                for k in 0..3 {
                    let lo = node.offset[k] as f64 * w;
                    assert!(sample.position[k] >= lo - 1e-12 && sample.position[k] <= lo + w + 1e-12);
                }
            }
        }
    }

    #[test]
    fn test_lookup_and_depth_ranges() {
        let (points, normals) = sphere(200);
        let octree = OctreeBuilder::new().with_max_depth(5).build(&points, &normals).unwrap();

        for depth in 0..=octree.realized_depth() {
            for index in octree.depth_range(depth) {
                let node = octree.node(index);
                assert_eq!(node.depth, depth);
                assert_eq!(octree.find(depth, node.offset), Some(index));
            }
        }
        assert!(octree.depth_range(octree.realized_depth() + 1).is_empty());
    }

    #[test]
    fn test_overlap_traversal_matches_brute_force() {
        let (points, normals) = sphere(120);
        let octree = OctreeBuilder::new().with_max_depth(5).build(&points, &normals).unwrap();

        for target in [0, 3, octree.len() / 2, octree.len() - 1] {
            let key = octree.node(target).key();
            let mut visited = Vec::new();
            octree.for_each_overlapping(&key, |i| visited.push(i));
            visited.sort_unstable();

            let expected: Vec<usize> = (0..octree.len())
                .filter(|&i| tents_overlap(&key, &octree.node(i).key()))
                .collect();
            assert_eq!(visited, expected);
        }
    }

    #[test]
    fn test_frame_is_inflated_bounding_cube() {
        let (points, normals) = sphere(100);
        let octree = OctreeBuilder::new().with_scale(2.0).build(&points, &normals).unwrap();
        let frame = octree.frame();
        let (min, max) = bounds_of(&points);
        assert_relative_eq!(frame.size, 2.0 * (max - min).amax() as f64, epsilon = 1e-9);

        for sample in octree.samples() {
            assert!(sample.position.iter().all(|&c| (0.24..=0.76).contains(&c)));
        }
        let back = frame.to_world(&frame.to_unit(&points[7]));
        assert_relative_eq!((back - points[7]).norm(), 0.0, epsilon = 1e-5);
    }

    #[test]
    fn test_splat_accumulation() {
        let (points, normals) = sphere(150);
        let octree = OctreeBuilder::new().with_max_depth(6).build(&points, &normals).unwrap();

        for splat in octree.splat_nodes() {
            let node = octree.node(splat);
            if node.sample_count() == 1 {
                let sample = octree.node_samples(splat).next().unwrap();
                assert_relative_eq!((node.centroid - sample.position).norm(), 0.0, epsilon = 1e-12);
                assert_relative_eq!((node.normal_sum - sample.normal * sample.area).norm(), 0.0, epsilon = 1e-12);
            } else if node.sample_count() == 0 {
                assert_eq!(node.field_weight, 0.0);
            }
        }
    }

    #[test]
    fn test_confidence_weights_drive_subdivision() {
        let (points, normals) = sphere(200);
        let halved: Vec<Vector3f> = normals.iter().map(|n| n * 0.5).collect();

        let plain = OctreeBuilder::new().with_max_depth(6).build(&points, &halved).unwrap();
        let weighted = OctreeBuilder::new()
            .with_max_depth(6)
            .with_confidence(true)
            .build(&points, &halved)
            .unwrap();

        // Half-magnitude normals need twice the samples per node before splitting
        assert!(weighted.len() <= plain.len());
        assert!(weighted.realized_depth() <= plain.realized_depth());
        let weighted_refined = weighted.nodes().iter().filter(|n| n.refined).count();
        let plain_refined = plain.nodes().iter().filter(|n| n.refined).count();
        assert!(weighted_refined < plain_refined);
        assert_relative_eq!(weighted.node(0).sample_weight, 100.0, epsilon = 1e-3);
        assert_relative_eq!(plain.node(0).sample_weight, 200.0, epsilon = 1e-9);
    }

    #[test]
    fn test_degenerate_and_empty_inputs() {
        let points = vec![Point3f::new(1.0, 1.0, 1.0); 5];
        let normals = vec![Vector3f::z(); 5];
        match OctreeBuilder::new().build(&points, &normals) {
            Err(Error::DegenerateInput { stage, .. }) => assert_eq!(stage, Stage::OctreeBuild),
            other => panic!("expected DegenerateInput, got {:?}", other.map(|o| o.len())),
        }

        assert!(matches!(
            OctreeBuilder::new().build(&[], &[]),
            Err(Error::InsufficientInput { .. })
        ));
        assert!(matches!(
            OctreeBuilder::new().build(&points[..2], &normals[..1]),
            Err(Error::InvalidData(_))
        ));
    }
}
