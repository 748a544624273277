//! Mesh file parsing
//!
//! Wavefront OBJ goes through `tobj`, glTF through the `gltf` crate. Both
//! produce [`MeshData`] made of one or more sections.

use crate::backend::types::Vertex;
use crate::error::{EngineError, EngineResult};
use std::path::Path;

/// A range of the shared index list drawn with one call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshSection {
    pub name: String,
    pub start_index: u32,
    pub index_count: u32,
    /// Added to every index of the section
    pub base_vertex: i32,
}

/// Vertices, indices and sections of one mesh
#[derive(Debug, Clone, Default)]
pub struct MeshData {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
    pub sections: Vec<MeshSection>,
}

impl MeshData {
    /// Append a section whose indices are local to `vertices`
    pub fn push_section(&mut self, name: &str, vertices: &[Vertex], indices: &[u32]) {
        self.sections.push(MeshSection {
            name: name.to_string(),
            start_index: self.indices.len() as u32,
            index_count: indices.len() as u32,
            base_vertex: self.vertices.len() as i32,
        });
        self.vertices.extend_from_slice(vertices);
        self.indices.extend_from_slice(indices);
    }

    /// Append every section of `other`, keeping its indices local
    pub fn append(&mut self, other: MeshData) {
        let start_index = self.indices.len() as u32;
        let base_vertex = self.vertices.len() as i32;
        self.sections.extend(other.sections.into_iter().map(|section| MeshSection {
            start_index: section.start_index + start_index,
            base_vertex: section.base_vertex + base_vertex,
            ..section
        }));
        self.vertices.extend(other.vertices);
        self.indices.extend(other.indices);
    }
}

/// Load a mesh file, choosing the parser by extension
pub fn load_mesh_file(path: &Path) -> EngineResult<MeshData> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());

    match extension.as_deref() {
        Some("obj") => {
            let source = std::fs::read_to_string(path)?;
            parse_obj(&source, path)
        }
        Some("gltf") | Some("glb") => load_gltf(path),
        _ => Err(EngineError::UnsupportedExtension(path.to_path_buf())),
    }
}

/// Parse OBJ text with `tobj`.
///
/// Polygons are fanned into triangles and every `o`/`g`/`usemtl` split becomes
/// a section. Faces are expanded into unshared vertices and the second and
/// third corner of each triangle are swapped in the index list, turning
/// counter-clockwise winding into clockwise.
pub fn parse_obj(source: &str, path: &Path) -> EngineResult<MeshData> {
    let parse_error = |reason: String| EngineError::MeshParse {
        path: path.to_path_buf(),
        reason,
    };

    let options = tobj::LoadOptions {
        triangulate: true,
        single_index: false,
        ..Default::default()
    };
    let mut reader = std::io::Cursor::new(source.as_bytes());
    // Materials come from the texture groups, so `mtllib` is not followed.
    let (models, _materials) = tobj::load_obj_buf(&mut reader, &options, |_| Ok(Default::default()))
        .map_err(|e| parse_error(e.to_string()))?;

    let mut data = MeshData::default();
    for model in &models {
        let mesh = &model.mesh;
        if mesh.indices.len() % 3 != 0 {
            return Err(parse_error(format!(
                "section {} has {} indices, not a triangle list",
                model.name,
                mesh.indices.len()
            )));
        }
        let has_uv = !mesh.texcoords.is_empty() && mesh.texcoord_indices.len() == mesh.indices.len();
        let has_normal = !mesh.normals.is_empty() && mesh.normal_indices.len() == mesh.indices.len();
        if !mesh.texcoords.is_empty() && !has_uv {
            log::warn!("{}: section {} mixes faces with and without texture coordinates", path.display(), model.name);
        }

        let vertices = (0..mesh.indices.len())
            .map(|corner| {
                let mut vertex = Vertex {
                    position: read3(&mesh.positions, mesh.indices[corner])
                        .ok_or_else(|| parse_error(format!("position index out of range in {}", model.name)))?,
                    ..Default::default()
                };
                if has_uv {
                    vertex.uv = read2(&mesh.texcoords, mesh.texcoord_indices[corner])
                        .ok_or_else(|| parse_error(format!("texcoord index out of range in {}", model.name)))?;
                }
                if has_normal {
                    vertex.normal = read3(&mesh.normals, mesh.normal_indices[corner])
                        .ok_or_else(|| parse_error(format!("normal index out of range in {}", model.name)))?;
                }
                Ok(vertex)
            })
            .collect::<EngineResult<Vec<Vertex>>>()?;

        let indices: Vec<u32> = (0..vertices.len() as u32)
            .step_by(3)
            .flat_map(|face| [face, face + 2, face + 1])
            .collect();
        if !indices.is_empty() {
            data.push_section(&model.name, &vertices, &indices);
        }
    }
    Ok(data)
}

fn read3(values: &[f32], index: u32) -> Option<[f32; 3]> {
    let start = index as usize * 3;
    values.get(start..start + 3).map(|v| [v[0], v[1], v[2]])
}

fn read2(values: &[f32], index: u32) -> Option<[f32; 2]> {
    let start = index as usize * 2;
    values.get(start..start + 2).map(|v| [v[0], v[1]])
}

/// Load the first mesh of a glTF file, one section per primitive
pub fn load_gltf(path: &Path) -> EngineResult<MeshData> {
    let (document, buffers, _images) = gltf::import(path)?;
    let mesh = document.meshes().next().ok_or_else(|| EngineError::MeshParse {
        path: path.to_path_buf(),
        reason: "file contains no meshes".into(),
    })?;

    let mut data = MeshData::default();
    for primitive in mesh.primitives() {
        let reader = primitive.reader(|buffer| buffers.get(buffer.index()).map(|b| &b.0[..]));

        let positions: Vec<[f32; 3]> = reader
            .read_positions()
            .ok_or_else(|| EngineError::MeshParse {
                path: path.to_path_buf(),
                reason: format!("primitive {} has no positions", primitive.index()),
            })?
            .collect();
        let indices: Vec<u32> = reader
            .read_indices()
            .ok_or_else(|| EngineError::MeshParse {
                path: path.to_path_buf(),
                reason: format!("primitive {} is not indexed", primitive.index()),
            })?
            .into_u32()
            .collect();
        let normals: Vec<[f32; 3]> = reader
            .read_normals()
            .map(|n| n.collect())
            .unwrap_or_else(|| vec![[0.0; 3]; positions.len()]);
        let texcoords: Vec<[f32; 2]> = reader
            .read_tex_coords(0)
            .map(|t| t.into_f32().collect())
            .unwrap_or_else(|| vec![[0.0; 2]; positions.len()]);

        let vertices: Vec<Vertex> = positions
            .iter()
            .enumerate()
            .map(|(i, &position)| {
                Vertex::new(
                    position,
                    texcoords.get(i).copied().unwrap_or_default(),
                    normals.get(i).copied().unwrap_or_default(),
                )
            })
            .collect();

        let name = format!("{}#{}", mesh.name().unwrap_or("mesh"), primitive.index());
        data.push_section(&name, &vertices, &indices);
    }

    log::debug!(
        "Loaded glTF {}: {} sections, {} vertices",
        path.display(),
        data.sections.len(),
        data.vertices.len()
    );
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    const QUAD: &str = "\
# two triangles
o quad
v 0 0 0
v 1 0 0
v 1 1 0
v 0 1 0
vt 0 0
vt 1 0
vt 1 1
vt 0 1
vn 0 0 1
f 1/1/1 2/2/1 3/3/1
f 1/1/1 3/3/1 4/4/1
";

    #[test]
    fn test_parse_obj_swaps_winding() {
        let data = parse_obj(QUAD, Path::new("quad.obj")).unwrap();
        assert_eq!(data.vertices.len(), 6);
        assert_eq!(data.indices, vec![0, 2, 1, 3, 5, 4]);
        assert_eq!(data.sections.len(), 1);
        assert_eq!(data.sections[0].name, "quad");
        assert_eq!(data.sections[0].index_count, 6);
        assert_eq!(data.vertices[1].position, [1.0, 0.0, 0.0]);
        assert_eq!(data.vertices[2].uv, [1.0, 1.0]);
        assert_eq!(data.vertices[5].normal, [0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_parse_obj_sections() {
        let source = "v 0 0 0\nv 1 0 0\nv 0 1 0\no a\nf 1 2 3\no b\nf -3 -2 -1\n";
        let data = parse_obj(source, Path::new("two.obj")).unwrap();
        assert_eq!(data.sections.len(), 2);
        assert_eq!(data.sections[1].start_index, 3);
        assert_eq!(data.sections[1].base_vertex, 3);
        // Indices stay local to their section
        assert_eq!(&data.indices[3..], &[0, 2, 1]);
    }

    #[test]
    fn test_parse_obj_fans_quads_into_triangles() {
        let source = "v 0 0 0\nv 1 0 0\nv 1 1 0\nv 0 1 0\nvt 0 0\nvn 0 0 1\nf 1/1/1 2/1/1 3/1/1 4/1/1\n";
        let data = parse_obj(source, Path::new("quad.obj")).unwrap();
        assert_eq!(data.vertices.len(), 6);
        assert_eq!(data.indices, vec![0, 2, 1, 3, 5, 4]);
        let positions: Vec<[f32; 3]> = data.vertices.iter().map(|v| v.position).collect();
        assert_eq!(
            positions,
            vec![
                [0.0, 0.0, 0.0],
                [1.0, 0.0, 0.0],
                [1.0, 1.0, 0.0],
                [0.0, 0.0, 0.0],
                [1.0, 1.0, 0.0],
                [0.0, 1.0, 0.0],
            ]
        );
        assert!(data.vertices.iter().all(|v| v.normal == [0.0, 0.0, 1.0]));
    }

    #[test]
    fn test_parse_obj_index_out_of_range() {
        let source = "v 0 0 0\nf 1 2 3\n";
        assert!(parse_obj(source, Path::new("bad.obj")).is_err());
    }

    #[test]
    fn test_unsupported_extension() {
        let err = load_mesh_file(Path::new("model.fbx")).unwrap_err();
        assert!(matches!(err, EngineError::UnsupportedExtension(_)));
    }
}
