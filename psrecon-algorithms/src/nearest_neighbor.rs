//! Nearest neighbor search implementations
//!
//! Both searches return `(index, distance)` pairs ordered by distance with ties
//! broken by point index, so neighborhoods are deterministic regardless of the
//! internal layout of the spatial index.

use psrecon_core::{bounds_of, NearestNeighborSearch, Point3f};
use rstar::RTree;
use std::cmp::Ordering;

/// A point with its index for spatial data structures
#[derive(Debug, Clone, Copy, PartialEq)]
struct IndexedPoint {
    point: Point3f,
    index: usize,
}

impl rstar::Point for IndexedPoint {
    type Scalar = f32;
    const DIMENSIONS: usize = 3;

    fn generate(mut generator: impl FnMut(usize) -> Self::Scalar) -> Self {
        Self {
            point: Point3f::new(generator(0), generator(1), generator(2)),
            index: usize::MAX,
        }
    }

    fn nth(&self, index: usize) -> Self::Scalar {
        self.point[index]
    }

    fn nth_mut(&mut self, index: usize) -> &mut Self::Scalar {
        &mut self.point[index]
    }
}

fn by_distance_then_index(a: &(usize, f32), b: &(usize, f32)) -> Ordering {
    a.1.total_cmp(&b.1).then(a.0.cmp(&b.0))
}

/// R*-tree backed spatial index over a point set
pub struct SpatialIndex {
    tree: RTree<IndexedPoint>,
    len: usize,
    /// Initial search radius for k-nearest queries, grown geometrically
    seed_radius: f32,
    /// Radius that covers the whole point set from any query inside its bounds
    cover_radius: f32,
}

impl SpatialIndex {
    pub fn new(points: &[Point3f]) -> Self {
        let indexed: Vec<IndexedPoint> = points
            .iter()
            .enumerate()
            .map(|(index, point)| IndexedPoint { point: *point, index })
            .collect();

        let (min, max) = bounds_of(points);
        let diagonal = (max - min).norm();
        let cover_radius = if diagonal > 0.0 { diagonal } else { 1.0 };
        // Surface samples: spacing scales with 1/sqrt(n)
        let seed_radius = cover_radius / (points.len().max(1) as f32).sqrt();

        Self {
            tree: RTree::bulk_load(indexed),
            len: points.len(),
            seed_radius: seed_radius.max(f32::EPSILON),
            cover_radius,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn within(&self, query: &Point3f, radius: f32) -> Vec<(usize, f32)> {
        let probe = IndexedPoint { point: *query, index: usize::MAX };
        self.tree
            .locate_within_distance(probe, radius * radius)
            .map(|candidate| (candidate.index, (candidate.point - query).norm()))
            .collect()
    }
}

impl NearestNeighborSearch for SpatialIndex {
    fn find_k_nearest(&self, query: &Point3f, k: usize) -> Vec<(usize, f32)> {
        let wanted = k.min(self.len);
        if wanted == 0 {
            return Vec::new();
        }

        let mut radius = self.seed_radius * (wanted as f32).sqrt();
        let mut found = self.within(query, radius);
        while found.len() < wanted {
            if radius > self.cover_radius * 4.0 {
                // Query far outside the bounds: everything is a candidate
                found = self.within(query, f32::MAX.sqrt());
                break;
            }
            radius *= 2.0;
            found = self.within(query, radius);
        }

        found.sort_by(by_distance_then_index);
        found.truncate(wanted);
        found
    }

    fn find_radius_neighbors(&self, query: &Point3f, radius: f32) -> Vec<(usize, f32)> {
        let mut found = self.within(query, radius);
        // The index compares squared distances; keep the result consistent with `<= radius`
        found.retain(|&(_, distance)| distance <= radius);
        found.sort_by(by_distance_then_index);
        found
    }
}

/// Simple brute force nearest neighbor search for small datasets
pub struct BruteForceSearch {
    points: Vec<Point3f>,
}

impl BruteForceSearch {
    pub fn new(points: &[Point3f]) -> Self {
        Self {
            points: points.to_vec(),
        }
    }

    fn all_distances(&self, query: &Point3f) -> Vec<(usize, f32)> {
        self.points
            .iter()
            .enumerate()
            .map(|(idx, point)| (idx, (point - query).norm()))
            .collect()
    }
}

impl NearestNeighborSearch for BruteForceSearch {
    fn find_k_nearest(&self, query: &Point3f, k: usize) -> Vec<(usize, f32)> {
        let mut distances = self.all_distances(query);
        distances.sort_by(by_distance_then_index);
        distances.truncate(k);
        distances
    }

    fn find_radius_neighbors(&self, query: &Point3f, radius: f32) -> Vec<(usize, f32)> {
        let mut distances = self.all_distances(query);
        distances.retain(|&(_, distance)| distance <= radius);
        distances.sort_by(by_distance_then_index);
        distances
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_points(count: usize, seed: u64) -> Vec<Point3f> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..count)
            .map(|_| Point3f::new(rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0)))
            .collect()
    }

    #[test]
    fn test_k_nearest_matches_brute_force() {
        let points = random_points(500, 7);
        let index = SpatialIndex::new(&points);
        let brute = BruteForceSearch::new(&points);

        for query in points.iter().take(50) {
            let fast: Vec<usize> = index.find_k_nearest(query, 6).into_iter().map(|(i, _)| i).collect();
            let slow: Vec<usize> = brute.find_k_nearest(query, 6).into_iter().map(|(i, _)| i).collect();
            assert_eq!(fast, slow);
        }
    }

    #[test]
    fn test_radius_matches_brute_force() {
        let points = random_points(300, 11);
        let index = SpatialIndex::new(&points);
        let brute = BruteForceSearch::new(&points);

        let query = Point3f::new(0.1, -0.2, 0.3);
        let fast = index.find_radius_neighbors(&query, 0.4);
        let slow = brute.find_radius_neighbors(&query, 0.4);
        assert_eq!(fast, slow);
    }

    #[test]
    fn test_ties_are_broken_by_index() {
        // Four points at the same distance from the origin
        let points = vec![
            Point3f::new(0.0, 0.0, 1.0),
            Point3f::new(1.0, 0.0, 0.0),
            Point3f::new(0.0, 1.0, 0.0),
            Point3f::new(-1.0, 0.0, 0.0),
        ];
        let index = SpatialIndex::new(&points);
        let nearest = index.find_k_nearest(&Point3f::origin(), 2);
        assert_eq!(nearest.iter().map(|(i, _)| *i).collect::<Vec<_>>(), vec![0, 1]);
    }

    #[test]
    fn test_k_larger_than_cloud() {
        let points = random_points(5, 3);
        let index = SpatialIndex::new(&points);
        assert_eq!(index.find_k_nearest(&points[0], 20).len(), 5);
    }

    #[test]
    fn test_query_far_outside_bounds() {
        let points = random_points(20, 5);
        let index = SpatialIndex::new(&points);
        let nearest = index.find_k_nearest(&Point3f::new(1.0e4, 0.0, 0.0), 3);
        assert_eq!(nearest.len(), 3);
    }

    #[test]
    fn test_coplanar_points() {
        let points: Vec<Point3f> = (0..400)
            .map(|i| Point3f::new((i % 20) as f32 * 0.1, (i / 20) as f32 * 0.1, 0.0))
            .collect();
        let index = SpatialIndex::new(&points);
        let nearest = index.find_k_nearest(&points[210], 5);
        assert_eq!(nearest[0].0, 210);
        assert_eq!(nearest.len(), 5);
    }
}
