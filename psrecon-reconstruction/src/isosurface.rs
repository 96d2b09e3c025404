//! Isosurface extraction over the adaptive octree
//!
//! The implicit function is sampled on the lattice of the finest realized
//! leaf depth, but only where the surface passes. Every leaf is evaluated at
//! its corners to find seed cubes, and a flood fill across lattice faces with
//! mixed signs walks the rest of each surface component. Cubes are split into
//! six tetrahedra sharing the main diagonal, so neighboring cubes triangulate
//! shared faces identically and vertices keyed by lattice edge make the mesh
//! watertight. Lattice boundary corners always count as outside.

use crate::basis::corner_offsets;
use crate::octree::OctreeNode;
use crate::parallel;
use crate::poisson::ImplicitFunction;
use psrecon_core::{Error, Result, Stage, TriangleMesh, Vector3d, Vector3f};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::time::Instant;
use tracing::{debug, info};

/// Positively oriented split of the unit cube along the 0-7 diagonal,
/// corners numbered with bit 0 = x, bit 1 = y, bit 2 = z
const KUHN_TETRAHEDRA: [[usize; 4]; 6] = [
    [0, 1, 3, 7],
    [0, 2, 6, 7],
    [0, 4, 5, 7],
    [0, 1, 7, 5],
    [0, 2, 7, 3],
    [0, 4, 7, 6],
];

/// Even permutation of a tetrahedron's vertices starting with each vertex
const EVEN_PERMUTATIONS: [[usize; 4]; 4] = [[0, 1, 2, 3], [1, 0, 3, 2], [2, 3, 0, 1], [3, 2, 1, 0]];

/// How a leaf maps onto the extraction lattice
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafCell {
    /// Leaf at the lattice depth, covering exactly one lattice cube
    Uniform { cube: [u32; 3] },
    /// Coarser leaf covering `span` lattice cubes per axis
    Mismatch { origin: [u32; 3], span: u32 },
}

impl LeafCell {
    pub fn classify(node: &OctreeNode, lattice_depth: u8) -> Self {
        let span = 1u32 << (lattice_depth - node.depth);
        let origin = node.offset.map(|o| o * span);
        if span == 1 {
            LeafCell::Uniform { cube: origin }
        } else {
            LeafCell::Mismatch { origin, span }
        }
    }
}

/// Extraction statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractionStats {
    pub lattice_depth: u8,
    pub seeds: usize,
    pub cubes_visited: usize,
    pub blocks_processed: usize,
    pub corner_evaluations: usize,
    pub memory_bytes: usize,
}

/// Extracted mesh with its statistics
#[derive(Debug, Clone)]
pub struct Isosurface {
    pub mesh: TriangleMesh,
    pub stats: ExtractionStats,
}

/// Lattice of corner samples at one depth
struct Lattice<'f, 'a> {
    function: &'f ImplicitFunction<'a>,
    resolution: u32,
    iso: f64,
}

impl Lattice<'_, '_> {
    fn corner_id(&self, c: [u32; 3]) -> u64 {
        let r = self.resolution as u64 + 1;
        (c[2] as u64 * r + c[1] as u64) * r + c[0] as u64
    }

    fn position(&self, c: [u32; 3]) -> Vector3d {
        Vector3d::new(c[0] as f64, c[1] as f64, c[2] as f64) / self.resolution as f64
    }

    /// Function minus iso-value; positive inside
    fn evaluate(&self, c: [u32; 3]) -> f64 {
        let value = self.function.value(&self.position(c)) - self.iso;
        if c.iter().any(|&k| k == 0 || k == self.resolution) {
            -value.abs()
        } else {
            value
        }
    }

    fn cube_corners(cube: [u32; 3]) -> [[u32; 3]; 8] {
        let mut corners = [[0; 3]; 8];
        for (corner, offset) in corners.iter_mut().zip(corner_offsets()) {
            *corner = [cube[0] + offset[0], cube[1] + offset[1], cube[2] + offset[2]];
        }
        corners
    }
}

fn is_mixed(values: &[f64]) -> bool {
    let inside = values.iter().filter(|&&v| v > 0.0).count();
    inside > 0 && inside < values.len()
}

/// Extracts the iso-surface of a solved implicit function
#[derive(Debug, Clone)]
pub struct IsosurfaceExtractor {
    iso_divide: u8,
    verbose: bool,
}

impl Default for IsosurfaceExtractor {
    fn default() -> Self {
        Self {
            iso_divide: 8,
            verbose: false,
        }
    }
}

impl IsosurfaceExtractor {
    pub fn new(iso_divide: u8) -> Self {
        Self {
            iso_divide,
            ..Self::default()
        }
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn extract(&self, function: &ImplicitFunction<'_>) -> Result<Isosurface> {
        let start = Instant::now();
        let octree = function.octree();
        let depth = octree.realized_depth();
        let lattice = Lattice {
            function,
            resolution: 1u32 << depth,
            iso: function.iso_value(),
        };

        let leaves: Vec<usize> = octree.leaves().collect();
        let seeds: Vec<[u32; 3]> = parallel::parallel_map(&leaves, |&leaf| {
            seed(&lattice, LeafCell::classify(octree.node(leaf), depth))
        })
        .into_iter()
        .flatten()
        .collect();
        if seeds.is_empty() {
            return Err(Error::empty_isosurface(
                Stage::Extraction,
                "the function does not cross the iso-value at any leaf",
            ));
        }

        let block_shift = depth.checked_sub(self.iso_divide).filter(|&s| s > 0);
        let block_of = |cube: [u32; 3]| match block_shift {
            Some(shift) => cube.map(|c| c >> shift),
            None => [0; 3],
        };

        let mut mesher = Mesher::default();
        let mut visited: HashSet<[u32; 3]> = HashSet::new();
        let mut pending: BTreeMap<[u32; 3], Vec<[u32; 3]>> = BTreeMap::new();
        for &cube in &seeds {
            if visited.insert(cube) {
                pending.entry(block_of(cube)).or_default().push(cube);
            }
        }

        let mut stats = ExtractionStats {
            lattice_depth: depth,
            seeds: visited.len(),
            ..ExtractionStats::default()
        };
        let mut peak_cache = 0;

        while let Some((block, cubes)) = pending.pop_first() {
            stats.blocks_processed += 1;
            let mut cache: HashMap<u64, f64> = HashMap::new();
            let mut queue: VecDeque<[u32; 3]> = cubes.into();

            while let Some(cube) = queue.pop_front() {
                stats.cubes_visited += 1;
                let corners = Lattice::cube_corners(cube);
                let ids = corners.map(|c| lattice.corner_id(c));
                let mut values = [0.0; 8];
                for (value, (&corner, &id)) in values.iter_mut().zip(corners.iter().zip(&ids)) {
                    *value = *cache.entry(id).or_insert_with(|| lattice.evaluate(corner));
                }
                if !is_mixed(&values) {
                    continue;
                }
                mesher.triangulate_cube(&lattice, &corners, &ids, &values);

                for axis in 0..3 {
                    for side in 0..2u32 {
                        let face: Vec<f64> = (0..8)
                            .filter(|c| (c >> axis) & 1 == side as usize)
                            .map(|c| values[c])
                            .collect();
                        if !is_mixed(&face) {
                            continue;
                        }
                        let mut next = cube;
                        if side == 1 {
                            next[axis] += 1;
                        } else if next[axis] > 0 {
                            next[axis] -= 1;
                        } else {
                            continue;
                        }
                        if next[axis] >= lattice.resolution || !visited.insert(next) {
                            continue;
                        }
                        let next_block = block_of(next);
                        if next_block == block {
                            queue.push_back(next);
                        } else {
                            pending.entry(next_block).or_default().push(next);
                        }
                    }
                }
            }
            stats.corner_evaluations += cache.len();
            peak_cache = peak_cache.max(cache.capacity());
        }

        if mesher.faces.is_empty() {
            return Err(Error::empty_isosurface(Stage::Extraction, "no triangles were produced"));
        }

        stats.memory_bytes = mesher.memory_bytes() + peak_cache * (2 * std::mem::size_of::<u64>());
        let mesh = mesher.into_mesh(function);

        if self.verbose {
            info!(
                lattice_depth = depth,
                blocks = stats.blocks_processed,
                cubes = stats.cubes_visited,
                vertices = mesh.vertex_count(),
                faces = mesh.face_count(),
                memory_bytes = stats.memory_bytes,
                seconds = start.elapsed().as_secs_f64(),
                "isosurface extracted"
            );
        } else {
            debug!(vertices = mesh.vertex_count(), faces = mesh.face_count(), "isosurface extracted");
        }
        Ok(Isosurface { mesh, stats })
    }
}

/// First lattice cube of a leaf that the surface passes through
fn seed(lattice: &Lattice<'_, '_>, cell: LeafCell) -> Option<[u32; 3]> {
    match cell {
        LeafCell::Uniform { cube } => {
            let values = Lattice::cube_corners(cube).map(|c| lattice.evaluate(c));
            is_mixed(&values).then_some(cube)
        }
        LeafCell::Mismatch { origin, span } => {
            let corners: Vec<[u32; 3]> = corner_offsets()
                .map(|o| [origin[0] + o[0] * span, origin[1] + o[1] * span, origin[2] + o[2] * span])
                .collect();
            let values: Vec<f64> = corners.iter().map(|&c| lattice.evaluate(c)).collect();
            if !is_mixed(&values) {
                return None;
            }

            // Walk a sign-changing leaf edge one lattice step at a time
            for axis in 0..3 {
                for lower in (0..8).filter(|c| (c >> axis) & 1 == 0) {
                    let upper = lower | (1 << axis);
                    let inside = values[lower] > 0.0;
                    if inside == (values[upper] > 0.0) {
                        continue;
                    }
                    let start = corners[lower];
                    let mut point = start;
                    for step in 1..=span {
                        point[axis] = start[axis] + step;
                        if (lattice.evaluate(point) > 0.0) != inside {
                            let mut cube = start.map(|c| c.min(lattice.resolution - 1));
                            cube[axis] = start[axis] + step - 1;
                            return Some(cube);
                        }
                    }
                }
            }
            None
        }
    }
}

/// Accumulates triangles with vertices shared per lattice edge
#[derive(Default)]
struct Mesher {
    positions: Vec<Vector3d>,
    faces: Vec<[usize; 3]>,
    edges: HashMap<(u64, u64), usize>,
}

impl Mesher {
    fn vertex(&mut self, lattice: &Lattice<'_, '_>, a: ([u32; 3], u64, f64), b: ([u32; 3], u64, f64)) -> usize {
        let key = if a.1 < b.1 { (a.1, b.1) } else { (b.1, a.1) };
        if let Some(&index) = self.edges.get(&key) {
            return index;
        }
        let (inner, outer) = if a.2 > 0.0 { (a, b) } else { (b, a) };
        let t = inner.2 / (inner.2 - outer.2);
        let p = lattice.position(inner.0);
        let q = lattice.position(outer.0);
        let index = self.positions.len();
        self.positions.push(p + (q - p) * t);
        self.edges.insert(key, index);
        index
    }

    fn triangulate_cube(&mut self, lattice: &Lattice<'_, '_>, corners: &[[u32; 3]; 8], ids: &[u64; 8], values: &[f64; 8]) {
        for tet in KUHN_TETRAHEDRA {
            let vertex = |local: usize| (corners[tet[local]], ids[tet[local]], values[tet[local]]);
            let inside = [0, 1, 2, 3].map(|local| values[tet[local]] > 0.0);
            let count = inside.iter().filter(|&&b| b).count();

            match count {
                1 | 3 => {
                    let lone = inside.iter().position(|&b| b == (count == 1)).unwrap_or(0);
                    let p = EVEN_PERMUTATIONS[lone];
                    let a = self.vertex(lattice, vertex(p[0]), vertex(p[1]));
                    let b = self.vertex(lattice, vertex(p[0]), vertex(p[2]));
                    let c = self.vertex(lattice, vertex(p[0]), vertex(p[3]));
                    self.faces.push(if count == 1 { [a, b, c] } else { [c, b, a] });
                }
                2 => {
                    let mut order = [0usize; 4];
                    let (ins, outs): (Vec<usize>, Vec<usize>) = (0..4).partition(|&l| inside[l]);
                    order[..2].copy_from_slice(&ins);
                    order[2..].copy_from_slice(&outs);
                    if is_odd_permutation(&order) {
                        order.swap(2, 3);
                    }
                    let [a, b, c, d] = order;
                    let ac = self.vertex(lattice, vertex(a), vertex(c));
                    let ad = self.vertex(lattice, vertex(a), vertex(d));
                    let bd = self.vertex(lattice, vertex(b), vertex(d));
                    let bc = self.vertex(lattice, vertex(b), vertex(c));
                    self.faces.push([ac, ad, bd]);
                    self.faces.push([ac, bd, bc]);
                }
                _ => {}
            }
        }
    }

    fn memory_bytes(&self) -> usize {
        self.positions.capacity() * std::mem::size_of::<Vector3d>()
            + self.faces.capacity() * std::mem::size_of::<[usize; 3]>()
            + self.edges.capacity() * (std::mem::size_of::<(u64, u64)>() + std::mem::size_of::<usize>())
    }

    /// World-space mesh with normals from the negated function gradient
    fn into_mesh(self, function: &ImplicitFunction<'_>) -> TriangleMesh {
        let frame = function.octree().frame();
        let normals = parallel::parallel_map(&self.positions, |p| {
            let (_, gradient) = function.value_and_gradient(p);
            let n = (-gradient).try_normalize(0.0).unwrap_or_else(Vector3d::zeros);
            Vector3f::new(n.x as f32, n.y as f32, n.z as f32)
        });
        let vertices = self.positions.iter().map(|p| frame.to_world(p)).collect();

        let mut mesh = TriangleMesh::from_vertices_and_faces(vertices, self.faces);
        mesh.set_normals(normals);
        mesh
    }
}

fn is_odd_permutation(order: &[usize; 4]) -> bool {
    let mut inversions = 0;
    for i in 0..4 {
        for j in i + 1..4 {
            if order[i] > order[j] {
                inversions += 1;
            }
        }
    }
    inversions % 2 == 1
}
