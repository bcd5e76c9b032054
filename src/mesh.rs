use std::collections::HashMap;

use nalgebra::Vector3;
use ndarray::{Array2, ArrayView2, Axis};

use crate::error::{Error, Result};

/// Largest face and vertex count of a [`Submesh`], so indices fit in 16 bits.
pub const MAX_SUBMESH_ELEMENTS: usize = 65535;

/// Indexed triangle mesh.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Mesh {
    /// Vertex positions. Shape is (Nx3).
    pub vertices: Array2<f32>,
    /// Per vertex unit normals. Shape is (Nx3).
    pub normals: Array2<f32>,
    /// Per vertex RGB colors. Shape is (Nx3).
    pub colors: Option<Array2<u8>>,
    /// Triangles as vertex indices. Shape is (Fx3).
    pub faces: Array2<usize>,
}

/// A part of a mesh with 16 bit indices.
#[derive(Clone, Debug, PartialEq)]
pub struct Submesh {
    pub vertices: Array2<f32>,
    pub normals: Array2<f32>,
    pub colors: Option<Array2<u8>>,
    pub faces: Array2<u16>,
}

impl Mesh {
    pub(crate) fn from_parts(vertices: Array2<f32>, normals: Array2<f32>, faces: Array2<usize>) -> Self {
        Self {
            vertices,
            normals,
            colors: None,
            faces,
        }
    }

    /// Creates a mesh, validating shapes and indices.
    /// Normals are computed from the faces when not given.
    pub fn new(
        vertices: Array2<f32>,
        normals: Option<Array2<f32>>,
        faces: Array2<usize>,
    ) -> Result<Self> {
        if vertices.ncols() != 3 || faces.ncols() != 3 {
            return Err(Error::invalid_parameter("vertices and faces must have 3 columns"));
        }
        if let Some(max_index) = faces.iter().max() {
            if *max_index >= vertices.nrows() {
                return Err(Error::invalid_parameter(format!(
                    "face index {} out of {} vertices",
                    max_index,
                    vertices.nrows()
                )));
            }
        }
        let normals = match normals {
            Some(normals) if normals.dim() == vertices.dim() => normals,
            Some(_) => return Err(Error::invalid_parameter("normals do not match vertices")),
            None => compute_normals(&vertices.view(), &faces.view()),
        };
        Ok(Self::from_parts(vertices, normals, faces))
    }

    pub fn with_colors(mut self, colors: Array2<u8>) -> Result<Self> {
        self.set_colors(colors)?;
        Ok(self)
    }

    pub fn set_colors(&mut self, colors: Array2<u8>) -> Result<()> {
        if colors.dim() != self.vertices.dim() {
            return Err(Error::invalid_parameter("colors do not match vertices"));
        }
        self.colors = Some(colors);
        Ok(())
    }

    pub fn len_vertices(&self) -> usize {
        self.vertices.nrows()
    }

    pub fn len_faces(&self) -> usize {
        self.faces.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len_faces() == 0
    }

    pub fn vertex(&self, index: usize) -> Vector3<f32> {
        row_vector(&self.vertices, index)
    }

    pub fn normal(&self, index: usize) -> Vector3<f32> {
        row_vector(&self.normals, index)
    }

    pub fn color(&self, index: usize) -> Option<[u8; 3]> {
        self.colors.as_ref().map(|colors| {
            [
                colors[(index, 0)],
                colors[(index, 1)],
                colors[(index, 2)],
            ]
        })
    }

    /// Corner positions of a face.
    pub fn triangle(&self, face: usize) -> [Vector3<f32>; 3] {
        [
            self.vertex(self.faces[(face, 0)]),
            self.vertex(self.faces[(face, 1)]),
            self.vertex(self.faces[(face, 2)]),
        ]
    }

    /// Unit normal of a face following its winding.
    pub fn face_normal(&self, face: usize) -> Vector3<f32> {
        let [p0, p1, p2] = self.triangle(face);
        (p1 - p0)
            .cross(&(p2 - p0))
            .try_normalize(0.0)
            .unwrap_or_else(Vector3::zeros)
    }

    /// Axis aligned bounds as (min, max), `None` for a mesh without vertices.
    pub fn bounds(&self) -> Option<(Vector3<f32>, Vector3<f32>)> {
        if self.len_vertices() == 0 {
            return None;
        }
        let mut min = Vector3::repeat(f32::INFINITY);
        let mut max = Vector3::repeat(f32::NEG_INFINITY);
        for vertex in self.vertices.axis_iter(Axis(0)) {
            for c in 0..3 {
                min[c] = min[c].min(vertex[c]);
                max[c] = max[c].max(vertex[c]);
            }
        }
        Some((min, max))
    }

    /// Splits the mesh into parts with at most [`MAX_SUBMESH_ELEMENTS`] faces and vertices.
    pub fn submeshes(&self) -> Vec<Submesh> {
        self.submeshes_with_limit(MAX_SUBMESH_ELEMENTS)
    }

    /// Splits the mesh into parts with at most `limit` faces and `limit` vertices.
    /// Face order is kept.
    pub fn submeshes_with_limit(&self, limit: usize) -> Vec<Submesh> {
        let limit = limit.clamp(3, MAX_SUBMESH_ELEMENTS);
        let mut parts = Vec::new();
        let mut remap: HashMap<usize, u16> = HashMap::new();
        let mut used: Vec<usize> = Vec::new();
        let mut faces: Vec<[u16; 3]> = Vec::new();

        for face in self.faces.axis_iter(Axis(0)) {
            let new_vertices = face.iter().filter(|v| !remap.contains_key(v)).count();
            if faces.len() + 1 > limit || used.len() + new_vertices > limit {
                parts.push(self.make_submesh(&used, &faces));
                remap.clear();
                used.clear();
                faces.clear();
            }
            let mut local = [0u16; 3];
            for (c, vertex) in face.iter().enumerate() {
                local[c] = *remap.entry(*vertex).or_insert_with(|| {
                    used.push(*vertex);
                    (used.len() - 1) as u16
                });
            }
            faces.push(local);
        }
        if !faces.is_empty() {
            parts.push(self.make_submesh(&used, &faces));
        }

        parts
    }

    fn make_submesh(&self, used: &[usize], faces: &[[u16; 3]]) -> Submesh {
        Submesh {
            vertices: Array2::from_shape_fn((used.len(), 3), |(v, c)| self.vertices[(used[v], c)]),
            normals: Array2::from_shape_fn((used.len(), 3), |(v, c)| self.normals[(used[v], c)]),
            colors: self.colors.as_ref().map(|colors| {
                Array2::from_shape_fn((used.len(), 3), |(v, c)| colors[(used[v], c)])
            }),
            faces: Array2::from_shape_fn((faces.len(), 3), |(f, c)| faces[f][c]),
        }
    }

    /// First intersection of the segment from `origin` to `end` with the mesh.
    ///
    /// # Returns
    ///
    /// The intersection point and the face index.
    pub fn intersect_ray(
        &self,
        origin: &Vector3<f32>,
        end: &Vector3<f32>,
    ) -> Option<(Vector3<f32>, usize)> {
        let direction = end - origin;
        (0..self.len_faces())
            .filter_map(|face| {
                intersect_triangle(origin, &direction, &self.triangle(face)).map(|t| (t, face))
            })
            .min_by_key(|(t, _)| ordered_float::OrderedFloat(*t))
            .map(|(t, face)| (origin + direction * t, face))
    }
}

fn row_vector(array: &Array2<f32>, index: usize) -> Vector3<f32> {
    Vector3::new(array[(index, 0)], array[(index, 1)], array[(index, 2)])
}

/// Möller-Trumbore intersection, `t` in [0, 1] along `direction`.
fn intersect_triangle(
    origin: &Vector3<f32>,
    direction: &Vector3<f32>,
    triangle: &[Vector3<f32>; 3],
) -> Option<f32> {
    let [p0, p1, p2] = triangle;
    let edge1 = p1 - p0;
    let edge2 = p2 - p0;
    let pvec = direction.cross(&edge2);
    let det = edge1.dot(&pvec);
    if det.abs() < 1e-12 {
        return None;
    }
    let inv_det = 1.0 / det;
    let tvec = origin - p0;
    let u = tvec.dot(&pvec) * inv_det;
    if !(0.0..=1.0).contains(&u) {
        return None;
    }
    let qvec = tvec.cross(&edge1);
    let v = direction.dot(&qvec) * inv_det;
    if v < 0.0 || u + v > 1.0 {
        return None;
    }
    let t = edge2.dot(&qvec) * inv_det;
    if (0.0..=1.0).contains(&t) {
        Some(t)
    } else {
        None
    }
}

/// Area weighted average of the face normals around each vertex.
pub fn compute_normals(vertices: &ArrayView2<f32>, faces: &ArrayView2<usize>) -> Array2<f32> {
    let point = |index: usize| Vector3::new(vertices[(index, 0)], vertices[(index, 1)], vertices[(index, 2)]);

    let mut vertex_normals = vec![Vector3::<f32>::zeros(); vertices.nrows()];
    faces.axis_iter(Axis(0)).for_each(|face| {
        let p0 = point(face[0]);
        let v0 = point(face[1]) - p0;
        let v1 = point(face[2]) - p0;
        let normal = v0.cross(&v1);
        for f in [face[0], face[1], face[2]] {
            vertex_normals[f] += normal;
        }
    });

    Array2::from_shape_fn((vertices.nrows(), 3), |(v, c)| {
        vertex_normals[v]
            .try_normalize(0.0)
            .map_or(0.0, |normal| normal[c])
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    /// A square of two triangles on the z = 1 plane, facing -z.
    fn square() -> Mesh {
        Mesh::new(
            array![
                [0.0, 0.0, 1.0],
                [0.0, 1.0, 1.0],
                [1.0, 1.0, 1.0],
                [1.0, 0.0, 1.0]
            ],
            None,
            array![[0, 1, 2], [0, 2, 3]],
        )
        .unwrap()
    }

    #[test]
    fn test_compute_normals() {
        let mesh = square();
        for v in 0..4 {
            assert_abs_diff_eq!(mesh.normal(v), Vector3::new(0.0, 0.0, -1.0));
        }
        for f in 0..2 {
            assert_abs_diff_eq!(mesh.face_normal(f), Vector3::new(0.0, 0.0, -1.0));
        }
        assert!(Mesh::new(array![[0.0, 0.0, 0.0]], None, array![[0, 1, 2]]).is_err());
    }

    #[test]
    fn test_intersect_ray() {
        let mesh = square();
        let (point, face) = mesh
            .intersect_ray(&Vector3::new(0.75, 0.25, 0.0), &Vector3::new(0.75, 0.25, 2.0))
            .unwrap();
        assert_abs_diff_eq!(point, Vector3::new(0.75, 0.25, 1.0), epsilon = 1e-6);
        assert_eq!(face, 1);
        assert!(mesh
            .intersect_ray(&Vector3::new(0.75, 0.25, 0.0), &Vector3::new(0.75, 0.25, 0.5))
            .is_none());
    }

    #[test]
    fn test_submeshes() {
        let mesh = square()
            .with_colors(array![[1, 1, 1], [2, 2, 2], [3, 3, 3], [4, 4, 4]])
            .unwrap();
        let parts = mesh.submeshes_with_limit(3);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].faces, array![[0u16, 1, 2]]);
        assert_eq!(parts[1].vertices.nrows(), 3);

        // Same triangles once indices are resolved.
        let part = &parts[1];
        for c in 0..3 {
            let local = part.faces[(0, c)] as usize;
            let global = mesh.faces[(1, c)];
            assert_eq!(part.vertices.row(local), mesh.vertices.row(global));
            assert_eq!(
                part.colors.as_ref().unwrap().row(local),
                mesh.colors.as_ref().unwrap().row(global)
            );
        }

        assert_eq!(mesh.submeshes().len(), 1);
    }
}
