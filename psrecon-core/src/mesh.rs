//! Triangle mesh produced by surface reconstruction

use crate::point::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A triangle mesh with vertices and faces
///
/// Faces are counter-clockwise when seen from outside the reconstructed solid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriangleMesh {
    pub vertices: Vec<Point3f>,
    pub faces: Vec<[usize; 3]>,
    pub normals: Option<Vec<Vector3f>>,
}

impl TriangleMesh {
    /// Create a new empty mesh
    pub fn new() -> Self {
        Self {
            vertices: Vec::new(),
            faces: Vec::new(),
            normals: None,
        }
    }

    /// Create a mesh from vertices and faces
    pub fn from_vertices_and_faces(vertices: Vec<Point3f>, faces: Vec<[usize; 3]>) -> Self {
        Self {
            vertices,
            faces,
            normals: None,
        }
    }

    /// Get the number of vertices
    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    /// Get the number of faces
    pub fn face_count(&self) -> usize {
        self.faces.len()
    }

    /// Check if the mesh is empty
    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty() || self.faces.is_empty()
    }

    /// Set vertex normals; ignored when the length does not match the vertices
    pub fn set_normals(&mut self, normals: Vec<Vector3f>) {
        if normals.len() == self.vertices.len() {
            self.normals = Some(normals);
        }
    }

    /// Calculate unit face normals (zero for degenerate faces)
    pub fn calculate_face_normals(&self) -> Vec<Vector3f> {
        self.faces
            .iter()
            .map(|face| {
                let v0 = self.vertices[face[0]];
                let edge1 = self.vertices[face[1]] - v0;
                let edge2 = self.vertices[face[2]] - v0;
                edge1.cross(&edge2).try_normalize(0.0).unwrap_or_else(Vector3f::zeros)
            })
            .collect()
    }

    /// Signed enclosed volume; positive when faces are oriented outwards
    pub fn signed_volume(&self) -> f64 {
        self.faces
            .iter()
            .map(|face| {
                let a = to_vector3d(&self.vertices[face[0]].coords);
                let b = to_vector3d(&self.vertices[face[1]].coords);
                let c = to_vector3d(&self.vertices[face[2]].coords);
                a.dot(&b.cross(&c))
            })
            .sum::<f64>()
            / 6.0
    }

    /// Number of distinct undirected edges
    pub fn edge_count(&self) -> usize {
        self.undirected_edge_uses().len()
    }

    /// V - E + F; 2 for a closed genus-0 surface
    pub fn euler_characteristic(&self) -> i64 {
        self.vertex_count() as i64 - self.edge_count() as i64 + self.face_count() as i64
    }

    /// Every edge is shared by exactly two faces traversing it in opposite directions
    pub fn is_closed_manifold(&self) -> bool {
        if self.faces.is_empty() {
            return false;
        }

        let mut directed: HashMap<(usize, usize), u32> = HashMap::with_capacity(self.faces.len() * 3);
        for face in &self.faces {
            for k in 0..3 {
                let edge = (face[k], face[(k + 1) % 3]);
                if edge.0 == edge.1 {
                    return false;
                }
                *directed.entry(edge).or_insert(0) += 1;
            }
        }

        directed
            .iter()
            .all(|(&(a, b), &count)| count == 1 && directed.get(&(b, a)) == Some(&1))
    }

    fn undirected_edge_uses(&self) -> HashMap<(usize, usize), u32> {
        let mut edges = HashMap::with_capacity(self.faces.len() * 3 / 2);
        for face in &self.faces {
            for k in 0..3 {
                let (a, b) = (face[k], face[(k + 1) % 3]);
                *edges.entry((a.min(b), a.max(b))).or_insert(0) += 1;
            }
        }
        edges
    }
}

impl Default for TriangleMesh {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// Unit tetrahedron with outward-facing faces
    fn tetrahedron() -> TriangleMesh {
        TriangleMesh::from_vertices_and_faces(
            vec![
                Point3f::new(0.0, 0.0, 0.0),
                Point3f::new(1.0, 0.0, 0.0),
                Point3f::new(0.0, 1.0, 0.0),
                Point3f::new(0.0, 0.0, 1.0),
            ],
            vec![[0, 2, 1], [0, 1, 3], [0, 3, 2], [1, 2, 3]],
        )
    }

    #[test]
    fn test_tetrahedron_topology() {
        let mesh = tetrahedron();
        assert_eq!(mesh.edge_count(), 6);
        assert_eq!(mesh.euler_characteristic(), 2);
        assert!(mesh.is_closed_manifold());
    }

    #[test]
    fn test_signed_volume_orientation() {
        let mut mesh = tetrahedron();
        assert_relative_eq!(mesh.signed_volume(), 1.0 / 6.0, epsilon = 1e-9);

        for face in &mut mesh.faces {
            face.swap(1, 2);
        }
        assert_relative_eq!(mesh.signed_volume(), -1.0 / 6.0, epsilon = 1e-9);
    }

    #[test]
    fn test_open_mesh_is_not_closed() {
        let mut mesh = tetrahedron();
        mesh.faces.pop();
        assert!(!mesh.is_closed_manifold());
        assert_eq!(mesh.euler_characteristic(), 1);
    }

    #[test]
    fn test_inconsistent_orientation_is_not_closed() {
        let mut mesh = tetrahedron();
        mesh.faces[0].swap(1, 2);
        assert!(!mesh.is_closed_manifold());
    }

    #[test]
    fn test_face_normals() {
        let mesh = tetrahedron();
        let normals = mesh.calculate_face_normals();
        assert_relative_eq!(normals[0].z, -1.0, epsilon = 1e-6);
        assert_relative_eq!(normals[3].norm(), 1.0, epsilon = 1e-6);
    }
}
