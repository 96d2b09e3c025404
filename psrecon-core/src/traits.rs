//! Core traits for psrecon

use crate::{mesh::*, point::*, point_cloud::*};

/// Trait for nearest neighbor search functionality
///
/// Results are `(index, distance)` pairs sorted by distance, ties broken by index.
pub trait NearestNeighborSearch {
    /// Find the k nearest neighbors to a query point
    fn find_k_nearest(&self, query: &Point3f, k: usize) -> Vec<(usize, f32)>;

    /// Find all neighbors within a given radius (inclusive)
    fn find_radius_neighbors(&self, query: &Point3f, radius: f32) -> Vec<(usize, f32)>;
}

/// Trait for objects with a spatial extent
pub trait Drawable {
    /// Get the axis-aligned bounding box of the object
    fn bounding_box(&self) -> (Point3f, Point3f);

    /// Get the center point of the object
    fn center(&self) -> Point3f {
        let (min, max) = self.bounding_box();
        nalgebra::center(&min, &max)
    }
}

/// Axis-aligned bounds of a point sequence; the origin for an empty sequence
pub fn bounds_of<'a>(points: impl IntoIterator<Item = &'a Point3f>) -> (Point3f, Point3f) {
    let mut iter = points.into_iter();
    let Some(first) = iter.next() else {
        return (Point3f::origin(), Point3f::origin());
    };

    iter.fold((*first, *first), |(min, max), p| {
        (
            Point3f::new(min.x.min(p.x), min.y.min(p.y), min.z.min(p.z)),
            Point3f::new(max.x.max(p.x), max.y.max(p.y), max.z.max(p.z)),
        )
    })
}

impl<T> Drawable for PointCloud<T>
where
    T: Clone + Copy,
    Point3f: From<T>,
{
    fn bounding_box(&self) -> (Point3f, Point3f) {
        let positions: Vec<Point3f> = self.points.iter().map(|p| Point3f::from(*p)).collect();
        bounds_of(&positions)
    }
}

impl Drawable for TriangleMesh {
    fn bounding_box(&self) -> (Point3f, Point3f) {
        bounds_of(&self.vertices)
    }
}
