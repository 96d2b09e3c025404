//! Point cloud containers
//!
//! A point cloud is an ordered sequence; a point's index is its identity and is
//! preserved by every engine stage.

use crate::error::{Error, Result};
use crate::normal_field::NormalField;
use crate::point::*;
use serde::{Deserialize, Serialize};
use std::ops::Index;

/// A generic point cloud container
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PointCloud<T> {
    pub points: Vec<T>,
}

/// A point cloud with 3D points (the input point set)
pub type PointCloud3f = PointCloud<Point3f>;

/// A point cloud with oriented normals
pub type NormalPointCloud3f = PointCloud<NormalPoint3f>;

impl<T> PointCloud<T> {
    /// Create a new empty point cloud
    pub fn new() -> Self {
        Self { points: Vec::new() }
    }

    /// Create a point cloud from a vector of points
    pub fn from_points(points: Vec<T>) -> Self {
        Self { points }
    }

    /// Get the number of points in the cloud
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Check if the point cloud is empty
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Add a point to the cloud
    pub fn push(&mut self, point: T) {
        self.points.push(point);
    }

    /// Get an iterator over the points
    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.points.iter()
    }
}

impl PointCloud<Point3f> {
    /// Reject clouds containing NaN or infinite coordinates
    pub fn ensure_finite(&self) -> Result<()> {
        match self.points.iter().position(|p| !is_finite_point(p)) {
            Some(index) => Err(Error::InvalidData(format!(
                "point {} has a non-finite coordinate",
                index
            ))),
            None => Ok(()),
        }
    }

    /// Attach a normal field, producing an oriented point cloud
    pub fn with_normals(&self, normals: &NormalField) -> Result<PointCloud<NormalPoint3f>> {
        if normals.len() != self.len() {
            return Err(Error::InvalidData(format!(
                "normal field has {} entries for {} points",
                normals.len(),
                self.len()
            )));
        }
        Ok(self
            .points
            .iter()
            .zip(normals.iter())
            .map(|(position, normal)| NormalPoint3f::new(*position, *normal))
            .collect())
    }
}

impl PointCloud<NormalPoint3f> {
    /// Positions of the oriented points, in order
    pub fn positions(&self) -> Vec<Point3f> {
        self.points.iter().map(|p| p.position).collect()
    }

    /// Normals of the oriented points, in order
    pub fn normal_field(&self) -> NormalField {
        NormalField::from_vec(self.points.iter().map(|p| p.normal).collect())
    }
}

impl<T> Default for PointCloud<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Index<usize> for PointCloud<T> {
    type Output = T;

    fn index(&self, index: usize) -> &Self::Output {
        &self.points[index]
    }
}

impl<'a, T> IntoIterator for &'a PointCloud<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.points.iter()
    }
}

impl<T> FromIterator<T> for PointCloud<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self {
            points: Vec::from_iter(iter),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_normals_length_mismatch() {
        let cloud = PointCloud::from_points(vec![Point3f::origin(), Point3f::new(1.0, 0.0, 0.0)]);
        let normals = NormalField::from_vec(vec![Vector3f::z()]);
        assert!(cloud.with_normals(&normals).is_err());
    }

    #[test]
    fn test_with_normals_round_trip_order() {
        let cloud = PointCloud::from_points(vec![Point3f::origin(), Point3f::new(1.0, 0.0, 0.0)]);
        let normals = NormalField::from_vec(vec![Vector3f::z(), Vector3f::x()]);
        let oriented = cloud.with_normals(&normals).unwrap();
        assert_eq!(oriented[1].position, Point3f::new(1.0, 0.0, 0.0));
        assert_eq!(oriented[1].normal, Vector3f::x());
        assert_eq!(oriented.positions(), cloud.points);
    }

    #[test]
    fn test_ensure_finite() {
        let cloud = PointCloud::from_points(vec![Point3f::origin(), Point3f::new(f32::NAN, 0.0, 0.0)]);
        assert!(cloud.ensure_finite().is_err());
    }
}
