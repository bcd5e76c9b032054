use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use ndarray::{Array2, Axis};
use ply_rs::ply::{
    Addable, DefaultElement, ElementDef, Encoding, Ply, Property, PropertyDef, PropertyType,
    ScalarType,
};
use ply_rs::writer::Writer;
use ply_rs::{parser, ply};
use tracing::debug;

use crate::error::{Error, Result};
use crate::mesh::Mesh;

struct Vertex {
    point: [f32; 3],
    normal: [f32; 3],
    color: [u8; 3],
}

struct Face {
    vertex_index: Vec<i64>,
}

impl ply::PropertyAccess for Vertex {
    fn new() -> Self {
        Vertex {
            point: [0f32; 3],
            normal: [0f32; 3],
            color: [0u8; 3],
        }
    }

    fn set_property(&mut self, key: String, property: ply::Property) {
        match (key.as_ref(), property) {
            ("x", ply::Property::Float(v)) => self.point[0] = v,
            ("y", ply::Property::Float(v)) => self.point[1] = v,
            ("z", ply::Property::Float(v)) => self.point[2] = v,
            ("nx", ply::Property::Float(v)) => self.normal[0] = v,
            ("ny", ply::Property::Float(v)) => self.normal[1] = v,
            ("nz", ply::Property::Float(v)) => self.normal[2] = v,
            ("red", ply::Property::UChar(v)) => self.color[0] = v,
            ("green", ply::Property::UChar(v)) => self.color[1] = v,
            ("blue", ply::Property::UChar(v)) => self.color[2] = v,
            (key, _) => debug!(key, "ignored vertex property"),
        }
    }
}

impl ply::PropertyAccess for Face {
    fn new() -> Self {
        Face {
            vertex_index: Vec::new(),
        }
    }

    fn set_property(&mut self, key: String, property: ply::Property) {
        match (key.as_ref(), property) {
            ("vertex_index" | "vertex_indices", ply::Property::ListInt(vec)) => {
                self.vertex_index = vec.into_iter().map(i64::from).collect()
            }
            ("vertex_index" | "vertex_indices", ply::Property::ListUInt(vec)) => {
                self.vertex_index = vec.into_iter().map(i64::from).collect()
            }
            (key, _) => debug!(key, "ignored face property"),
        }
    }
}

/// Reads a triangle mesh. Vertex normals are recomputed when the file has none.
pub fn read_ply<P>(filepath: P) -> Result<Mesh>
where
    P: AsRef<Path>,
{
    let mut f = BufReader::new(File::open(filepath)?);

    let vertex_parser = parser::Parser::<Vertex>::new();
    let header = vertex_parser.read_header(&mut f)?;

    let mut vertices = None;
    let mut normals = None;
    let mut colors = None;
    let mut faces = None;
    for (_, element) in &header.elements {
        match element.name.as_ref() {
            "vertex" => {
                let vertex_vec = vertex_parser.read_payload_for_element(&mut f, element, &header)?;

                vertices = Some(Array2::<f32>::from_shape_fn(
                    (vertex_vec.len(), 3),
                    |(i, c)| vertex_vec[i].point[c],
                ));

                if ["nx", "ny", "nz"]
                    .iter()
                    .all(|k| element.properties.contains_key(*k))
                {
                    normals = Some(Array2::<f32>::from_shape_fn(
                        (vertex_vec.len(), 3),
                        |(i, c)| vertex_vec[i].normal[c],
                    ));
                }

                if ["red", "green", "blue"]
                    .iter()
                    .all(|k| element.properties.contains_key(*k))
                {
                    colors = Some(Array2::<u8>::from_shape_fn(
                        (vertex_vec.len(), 3),
                        |(i, c)| vertex_vec[i].color[c],
                    ));
                }
            }
            "face" => {
                let face_parser = parser::Parser::<Face>::new();
                let face_vec = face_parser.read_payload_for_element(&mut f, element, &header)?;
                let mut indices = Array2::<usize>::zeros((face_vec.len(), 3));
                for (i, face) in face_vec.iter().enumerate() {
                    if face.vertex_index.len() != 3 || face.vertex_index.iter().any(|v| *v < 0) {
                        return Err(Error::Parser(format!(
                            "face {} is not a triangle: {:?}",
                            i, face.vertex_index
                        )));
                    }
                    for c in 0..3 {
                        indices[(i, c)] = face.vertex_index[c] as usize;
                    }
                }
                faces = Some(indices);
            }
            name => {
                return Err(Error::Parser(format!("unexpected PLY element {}", name)));
            }
        }
    }

    let vertices = vertices.ok_or_else(|| Error::Parser("PLY without vertices".to_string()))?;
    let faces = faces.unwrap_or_else(|| Array2::zeros((0, 3)));
    let mesh = Mesh::new(vertices, normals, faces)?;
    match colors {
        Some(colors) => mesh.with_colors(colors),
        None => Ok(mesh),
    }
}

/// Writes a mesh as ASCII PLY, with vertex colors when the mesh has them.
pub fn write_ply<P>(filepath: P, mesh: &Mesh) -> Result<()>
where
    P: AsRef<Path>,
{
    let mut ply = Ply::<DefaultElement>::new();
    let mut vertex_element = ElementDef::new("vertex".to_string());
    ["x", "y", "z", "nx", "ny", "nz"].iter().for_each(|key| {
        vertex_element.properties.add(PropertyDef::new(
            key.to_string(),
            PropertyType::Scalar(ScalarType::Float),
        ));
    });

    let mut vertex_array: Vec<DefaultElement> = mesh
        .vertices
        .axis_iter(Axis(0))
        .zip(mesh.normals.axis_iter(Axis(0)))
        .map(|(point, normal)| {
            let mut elem = DefaultElement::new();
            elem.insert("x".to_string(), Property::Float(point[0]));
            elem.insert("y".to_string(), Property::Float(point[1]));
            elem.insert("z".to_string(), Property::Float(point[2]));
            elem.insert("nx".to_string(), Property::Float(normal[0]));
            elem.insert("ny".to_string(), Property::Float(normal[1]));
            elem.insert("nz".to_string(), Property::Float(normal[2]));
            elem
        })
        .collect();

    if let Some(colors) = &mesh.colors {
        ["red", "green", "blue"].iter().for_each(|key| {
            vertex_element.properties.add(PropertyDef::new(
                key.to_string(),
                PropertyType::Scalar(ScalarType::UChar),
            ));
        });

        colors
            .axis_iter(Axis(0))
            .zip(vertex_array.iter_mut())
            .for_each(|(color, elem)| {
                elem.insert("red".to_string(), Property::UChar(color[0]));
                elem.insert("green".to_string(), Property::UChar(color[1]));
                elem.insert("blue".to_string(), Property::UChar(color[2]));
            });
    }

    ply.header.elements.add(vertex_element);
    ply.payload.insert("vertex".to_string(), vertex_array);

    let mut face_element = ElementDef::new("face".to_string());
    face_element.properties.add(PropertyDef::new(
        "vertex_indices".to_string(),
        PropertyType::List(ScalarType::UChar, ScalarType::Int),
    ));
    let face_array: Vec<DefaultElement> = mesh
        .faces
        .axis_iter(Axis(0))
        .map(|face| {
            let mut elem = DefaultElement::new();
            elem.insert(
                "vertex_indices".to_string(),
                Property::ListInt(face.iter().map(|f| *f as i32).collect()),
            );
            elem
        })
        .collect();
    ply.header.elements.add(face_element);
    ply.payload.insert("face".to_string(), face_array);

    ply.make_consistent()
        .map_err(|err| Error::Parser(format!("inconsistent PLY: {:?}", err)))?;
    ply.header.encoding = Encoding::Ascii;

    let mut buf = BufWriter::new(File::create(filepath)?);
    Writer::new().write_ply(&mut buf, &mut ply)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{read_ply, write_ply};
    use crate::mesh::Mesh;
    use ndarray::array;

    fn colored_triangle() -> Mesh {
        Mesh::new(
            array![[0.0, 0.0, 0.5], [0.1, 0.0, 0.5], [0.0, 0.1, 0.5]],
            None,
            array![[0, 1, 2]],
        )
        .unwrap()
        .with_colors(array![[255, 0, 0], [0, 255, 0], [0, 0, 255]])
        .unwrap()
    }

    #[test]
    fn should_read_what_was_written() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("triangle.ply");
        let mesh = colored_triangle();
        write_ply(&path, &mesh).unwrap();

        let loaded = read_ply(&path).unwrap();
        assert_eq!(loaded.faces, mesh.faces);
        assert_eq!(loaded.colors, mesh.colors);
        for v in 0..3 {
            assert!((loaded.vertex(v) - mesh.vertex(v)).norm() < 1e-5);
            assert!((loaded.normal(v) - mesh.normal(v)).norm() < 1e-5);
        }
    }

    #[test]
    fn should_fail_on_missing_file() {
        assert!(read_ply("does-not-exist.ply").is_err());
    }
}
