//! Per-point normal fields

use crate::error::Result;
use crate::point::{NormalPoint3f, Point3f, Vector3f};
use crate::point_cloud::PointCloud;
use serde::{Deserialize, Serialize};
use std::ops::Index;

/// Normals aligned 1:1 with a point set
///
/// Entries are unit length when produced by the estimator; callers may supply
/// magnitude-weighted normals for confidence-weighted reconstruction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NormalField {
    normals: Vec<Vector3f>,
}

impl NormalField {
    pub fn from_vec(normals: Vec<Vector3f>) -> Self {
        Self { normals }
    }

    pub fn len(&self) -> usize {
        self.normals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.normals.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Vector3f> {
        self.normals.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Vector3f> {
        self.normals.iter()
    }

    pub fn as_slice(&self) -> &[Vector3f] {
        &self.normals
    }

    pub fn into_vec(self) -> Vec<Vector3f> {
        self.normals
    }

    /// Index of the first entry that is non-finite or has zero length
    pub fn first_invalid(&self) -> Option<usize> {
        self.normals.iter().position(|n| {
            let finite = n.x.is_finite() && n.y.is_finite() && n.z.is_finite();
            !finite || n.norm_squared() == 0.0
        })
    }

    /// All entries finite and non-zero
    pub fn is_valid(&self) -> bool {
        self.first_invalid().is_none()
    }

    /// Pair each normal with its point
    pub fn zip_with(&self, points: &[Point3f]) -> Result<PointCloud<NormalPoint3f>> {
        PointCloud::from_points(points.to_vec()).with_normals(self)
    }
}

impl Index<usize> for NormalField {
    type Output = Vector3f;

    fn index(&self, index: usize) -> &Self::Output {
        &self.normals[index]
    }
}

impl<'a> IntoIterator for &'a NormalField {
    type Item = &'a Vector3f;
    type IntoIter = std::slice::Iter<'a, Vector3f>;

    fn into_iter(self) -> Self::IntoIter {
        self.normals.iter()
    }
}

impl FromIterator<Vector3f> for NormalField {
    fn from_iter<I: IntoIterator<Item = Vector3f>>(iter: I) -> Self {
        Self {
            normals: Vec::from_iter(iter),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validity() {
        let field = NormalField::from_vec(vec![Vector3f::z(), Vector3f::new(0.0, 2.0, 0.0)]);
        assert!(field.is_valid());

        let field = NormalField::from_vec(vec![Vector3f::z(), Vector3f::zeros()]);
        assert_eq!(field.first_invalid(), Some(1));

        let field = NormalField::from_vec(vec![Vector3f::new(f32::INFINITY, 0.0, 0.0)]);
        assert!(!field.is_valid());
    }

    #[test]
    fn test_zip_with_checks_length() {
        let field = NormalField::from_vec(vec![Vector3f::z(); 2]);
        let points = [Point3f::origin(), Point3f::new(1.0, 0.0, 0.0)];
        let cloud = field.zip_with(&points).unwrap();
        assert_eq!(cloud[1].position, points[1]);
        assert_eq!(cloud[1].normal, Vector3f::z());

        assert!(field.zip_with(&points[..1]).is_err());
    }
}
