use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use ndarray::Axis;

use crate::error::Result;
use crate::mesh::Mesh;

/// Writes a mesh as Wavefront OBJ.
///
/// Vertex colors, when present, follow the positions on the `v` lines as
/// RGB in [0, 1].
pub fn write_obj<W: Write>(writer: &mut W, mesh: &Mesh) -> Result<()> {
    writeln!(
        writer,
        "# {} vertices, {} faces",
        mesh.len_vertices(),
        mesh.len_faces()
    )?;
    for (v, point) in mesh.vertices.axis_iter(Axis(0)).enumerate() {
        match mesh.color(v) {
            Some([r, g, b]) => writeln!(
                writer,
                "v {} {} {} {:.4} {:.4} {:.4}",
                point[0],
                point[1],
                point[2],
                r as f32 / 255.0,
                g as f32 / 255.0,
                b as f32 / 255.0
            )?,
            None => writeln!(writer, "v {} {} {}", point[0], point[1], point[2])?,
        }
    }
    for normal in mesh.normals.axis_iter(Axis(0)) {
        writeln!(writer, "vn {} {} {}", normal[0], normal[1], normal[2])?;
    }
    // OBJ indices start at 1.
    for face in mesh.faces.axis_iter(Axis(0)) {
        let (a, b, c) = (face[0] + 1, face[1] + 1, face[2] + 1);
        writeln!(writer, "f {a}//{a} {b}//{b} {c}//{c}")?;
    }
    Ok(())
}

pub fn write_obj_file<P: AsRef<Path>>(filepath: P, mesh: &Mesh) -> Result<()> {
    let mut buf = BufWriter::new(File::create(filepath)?);
    write_obj(&mut buf, mesh)?;
    buf.flush()?;
    Ok(())
}
