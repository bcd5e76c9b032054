use std::collections::HashMap;

use nalgebra::Vector3;
use ndarray::Array2;
use rayon::prelude::*;
use tracing::info;

use crate::mesh::Mesh;
use crate::volume::Volume;

mod tables;
use tables::{EDGE_TABLE, TRIANGLE_TABLE};

/// Corner offsets of a cube, in the order of the lookup tables.
const CORNERS: [[usize; 3]; 8] = [
    [0, 0, 0],
    [1, 0, 0],
    [1, 1, 0],
    [0, 1, 0],
    [0, 0, 1],
    [1, 0, 1],
    [1, 1, 1],
    [0, 1, 1],
];

/// Corner pairs of the cube edges.
const EDGES: [[usize; 2]; 12] = [
    [0, 1],
    [1, 2],
    [2, 3],
    [3, 0],
    [4, 5],
    [5, 6],
    [6, 7],
    [7, 4],
    [0, 4],
    [1, 5],
    [2, 6],
    [3, 7],
];

/// A grid edge, identified by its lower voxel and its axis.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct EdgeKey {
    voxel: [usize; 3],
    axis: usize,
}

impl EdgeKey {
    fn new(cube: [usize; 3], edge: usize) -> Self {
        let [a, b] = EDGES[edge];
        let (ca, cb) = (CORNERS[a], CORNERS[b]);
        let mut voxel = [0; 3];
        let mut axis = 0;
        for c in 0..3 {
            voxel[c] = cube[c] + ca[c].min(cb[c]);
            if ca[c] != cb[c] {
                axis = c;
            }
        }
        Self { voxel, axis }
    }

    fn upper(&self) -> [usize; 3] {
        let mut upper = self.voxel;
        upper[self.axis] += 1;
        upper
    }
}

#[derive(Clone, Copy, Debug)]
struct EdgeVertex {
    position: Vector3<f32>,
    normal: Vector3<f32>,
}

/// Iso-surface extraction of the zero level of a [`Volume`].
#[derive(Clone, Debug)]
pub struct MarchingCubes {
    /// Triangles with an edge shorter than this fraction of the voxel size are dropped.
    pub min_edge_factor: f32,
}

impl Default for MarchingCubes {
    fn default() -> Self {
        Self {
            min_edge_factor: 0.1,
        }
    }
}

impl MarchingCubes {
    fn edge_vertex(volume: &Volume, key: &EdgeKey) -> EdgeVertex {
        let [i0, j0, k0] = key.voxel;
        let [i1, j1, k1] = key.upper();
        let grid = volume.grid();
        let (d0, _) = volume.voxel(i0, j0, k0);
        let (d1, _) = volume.voxel(i1, j1, k1);

        let t = if (d1 - d0).abs() < 1e-9 {
            0.5
        } else {
            (d0 / (d0 - d1)).clamp(0.0, 1.0)
        };
        let position = grid
            .voxel_center(i0, j0, k0)
            .lerp(&grid.voxel_center(i1, j1, k1), t);
        let normal = volume
            .voxel_gradient(i0, j0, k0)
            .lerp(&volume.voxel_gradient(i1, j1, k1), t);

        EdgeVertex {
            position,
            normal: normal.try_normalize(1e-9).unwrap_or_else(Vector3::zeros),
        }
    }

    /// Triangles of one x slice of cubes, in grid order.
    fn slice_triangles(&self, volume: &Volume, i: usize) -> Vec<[EdgeKey; 3]> {
        let [_, dim_y, dim_z] = volume.dims();
        let min_edge = volume.voxel_size() * self.min_edge_factor;
        let min_edge_squared = min_edge * min_edge;
        let mut triangles = Vec::new();

        for j in 0..dim_y - 1 {
            for k in 0..dim_z - 1 {
                let mut cube_index = 0usize;
                let mut observed = true;
                for (c, offset) in CORNERS.iter().enumerate() {
                    let (tsdf, weight) =
                        volume.voxel(i + offset[0], j + offset[1], k + offset[2]);
                    if weight <= 0.0 {
                        observed = false;
                        break;
                    }
                    if tsdf < 0.0 {
                        cube_index |= 1 << c;
                    }
                }
                if !observed || EDGE_TABLE[cube_index] == 0 {
                    continue;
                }

                for tri in TRIANGLE_TABLE[cube_index].chunks(3) {
                    if tri[0] < 0 {
                        break;
                    }
                    let mut keys = [
                        EdgeKey::new([i, j, k], tri[0] as usize),
                        EdgeKey::new([i, j, k], tri[1] as usize),
                        EdgeKey::new([i, j, k], tri[2] as usize),
                    ];
                    let vertices = keys.map(|key| Self::edge_vertex(volume, &key));

                    let (p0, p1, p2) = (
                        vertices[0].position,
                        vertices[1].position,
                        vertices[2].position,
                    );
                    if (p1 - p0).norm_squared() < min_edge_squared
                        || (p2 - p1).norm_squared() < min_edge_squared
                        || (p0 - p2).norm_squared() < min_edge_squared
                    {
                        continue;
                    }

                    // Winding follows the vertex normals.
                    let face_normal = (p1 - p0).cross(&(p2 - p0));
                    let vertex_normal =
                        vertices[0].normal + vertices[1].normal + vertices[2].normal;
                    if face_normal.dot(&vertex_normal) < 0.0 {
                        keys.swap(1, 2);
                    }
                    triangles.push(keys);
                }
            }
        }

        triangles
    }

    /// Extracts the zero crossing of the volume.
    ///
    /// Only cubes whose corners were all observed contribute. The output
    /// only depends on the volume content.
    pub fn extract(&self, volume: &Volume) -> Mesh {
        let [dim_x, dim_y, dim_z] = volume.dims();
        if dim_x < 2 || dim_y < 2 || dim_z < 2 {
            return Mesh::default();
        }

        let slices: Vec<Vec<[EdgeKey; 3]>> = (0..dim_x - 1)
            .into_par_iter()
            .map(|i| self.slice_triangles(volume, i))
            .collect();

        let mut index: HashMap<EdgeKey, usize> = HashMap::new();
        let mut vertices: Vec<EdgeVertex> = Vec::new();
        let mut faces: Vec<[usize; 3]> = Vec::new();
        for &keys in slices.iter().flatten() {
            let face = keys.map(|key| {
                *index.entry(key).or_insert_with(|| {
                    vertices.push(Self::edge_vertex(volume, &key));
                    vertices.len() - 1
                })
            });
            faces.push(face);
        }

        let mesh = Mesh::from_parts(
            Array2::from_shape_fn((vertices.len(), 3), |(v, c)| vertices[v].position[c]),
            Array2::from_shape_fn((vertices.len(), 3), |(v, c)| vertices[v].normal[c]),
            Array2::from_shape_fn((faces.len(), 3), |(f, c)| faces[f][c]),
        );
        info!(
            vertices = mesh.len_vertices(),
            faces = mesh.len_faces(),
            "mesh extracted"
        );
        mesh
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::CameraIntrinsics;
    use crate::config::FusionParams;
    use crate::unit_test::{fused_plane_volume, small_intrinsics, small_volume_params};
    use rstest::rstest;

    #[test]
    fn should_be_empty_for_unobserved_volume() {
        let volume = Volume::new(&small_volume_params(), &FusionParams::default()).unwrap();
        let mesh = MarchingCubes::default().extract(&volume);
        assert!(mesh.is_empty());
        assert_eq!(mesh.len_faces(), 0);
    }

    #[rstest]
    fn should_extract_fused_plane(small_intrinsics: CameraIntrinsics) {
        let volume = fused_plane_volume(&small_intrinsics, 0.55, 1);
        let mesh = MarchingCubes::default().extract(&volume);
        assert!(mesh.len_faces() > 100);

        for v in 0..mesh.len_vertices() {
            assert!((mesh.vertex(v)[2] - 0.55).abs() < 2e-3);
            assert!((mesh.normal(v) - Vector3::new(0.0, 0.0, -1.0)).norm() < 1e-2);
        }
        // Faces look at the camera.
        for f in 0..mesh.len_faces() {
            assert!(mesh.face_normal(f)[2] < 0.0);
        }
        // Normals rebuilt from the winding agree with the volume gradient.
        let rebuilt = crate::mesh::compute_normals(&mesh.vertices.view(), &mesh.faces.view());
        for v in 0..mesh.len_vertices() {
            assert!(rebuilt[(v, 2)] < -0.99, "vertex {}", v);
        }
    }

    #[rstest]
    fn should_be_deterministic(small_intrinsics: CameraIntrinsics) {
        let volume = fused_plane_volume(&small_intrinsics, 0.5, 2);
        let first = MarchingCubes::default().extract(&volume);
        let second = MarchingCubes::default().extract(&volume);
        assert_eq!(first, second);
    }

    #[test]
    fn test_edge_keys_are_shared() {
        // Edge 1 of a cube is edge 3 of its +x neighbor.
        assert_eq!(EdgeKey::new([0, 0, 0], 1), EdgeKey::new([1, 0, 0], 3));
        assert_eq!(EdgeKey::new([0, 0, 0], 10), EdgeKey::new([1, 1, 0], 8));
    }
}
