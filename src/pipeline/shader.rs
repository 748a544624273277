//! Shader blob loading and SPIR-V reflection
//!
//! Blobs are precompiled SPIR-V named `<name>.hlsl.<vs|ps|cs>.cso`. The binding
//! layout of a pipeline is read back from its vertex (or compute) blob: the
//! descriptor bindings it declares and the size of its push constant block,
//! which holds the root slots.

use crate::backend::types::{RootSignatureDesc, ShaderBinding, ShaderStage};
use crate::error::{EngineError, EngineResult};
use std::path::{Path, PathBuf};

/// The SPIR-V magic number (little-endian).
pub const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Bytes of push constant space one root slot occupies
pub const ROOT_SLOT_SIZE: u32 = 8;

/// File name suffix of a stage
pub fn stage_suffix(stage: ShaderStage) -> &'static str {
    match stage {
        ShaderStage::Vertex => "vs",
        ShaderStage::Fragment => "ps",
        ShaderStage::Compute => "cs",
    }
}

/// Path of the blob `name` for `stage` inside `dir`
pub fn shader_path(dir: &Path, name: &str, stage: ShaderStage) -> PathBuf {
    dir.join(format!("{name}.hlsl.{}.cso", stage_suffix(stage)))
}

/// A loaded SPIR-V module
#[derive(Debug, Clone)]
pub struct ShaderBlob {
    pub path: PathBuf,
    pub stage: ShaderStage,
    pub bytes: Vec<u8>,
}

impl ShaderBlob {
    /// Load and validate a blob. Missing, empty and non-SPIR-V files are errors.
    pub fn load(dir: &Path, name: &str, stage: ShaderStage) -> EngineResult<Self> {
        let path = shader_path(dir, name, stage);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(EngineError::ShaderNotFound(path));
            }
            Err(e) => return Err(e.into()),
        };
        Self::from_bytes(path, stage, bytes)
    }

    pub fn from_bytes(path: PathBuf, stage: ShaderStage, bytes: Vec<u8>) -> EngineResult<Self> {
        if bytes.is_empty() {
            return Err(EngineError::EmptyShader(path));
        }
        if bytes.len() % 4 != 0 {
            return Err(EngineError::InvalidShader {
                reason: format!("size {} is not a multiple of 4", bytes.len()),
                path,
            });
        }

        let magic = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        if bytes.len() < 20 || magic != SPIRV_MAGIC {
            return Err(EngineError::InvalidShader {
                reason: format!("bad SPIR-V magic 0x{magic:08X} (expected 0x{SPIRV_MAGIC:08X})"),
                path,
            });
        }

        Ok(Self { path, stage, bytes })
    }

    pub fn reflect(&self) -> EngineResult<ShaderReflection> {
        reflect(&self.bytes, &self.path)
    }
}

/// Binding information read from a SPIR-V module
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderReflection {
    pub stage: Option<ShaderStage>,
    pub entry_point: Option<String>,
    pub bindings: Vec<ShaderBinding>,
    pub push_constant_size: u32,
}

impl ShaderReflection {
    pub fn root_slot_count(&self) -> u32 {
        self.push_constant_size.div_ceil(ROOT_SLOT_SIZE)
    }

    pub fn root_signature_desc(&self, label: &str, stage: ShaderStage) -> RootSignatureDesc {
        RootSignatureDesc {
            label: Some(label.to_string()),
            stage,
            root_slot_count: self.root_slot_count(),
            bindings: self.bindings.clone(),
        }
    }
}

/// Parse a SPIR-V module with naga and read back its entry point, resource
/// bindings and push constant block size
pub fn reflect(bytes: &[u8], path: &Path) -> EngineResult<ShaderReflection> {
    let invalid = |reason: String| EngineError::InvalidShader {
        path: path.to_path_buf(),
        reason,
    };

    let options = naga::front::spv::Options {
        adjust_coordinate_space: false,
        ..Default::default()
    };
    let module = naga::front::spv::parse_u8_slice(bytes, &options)
        .map_err(|e| invalid(format!("SPIR-V parse error: {e}")))?;

    let mut layouter = naga::proc::Layouter::default();
    layouter
        .update(module.to_ctx())
        .map_err(|e| invalid(format!("type layout error: {e}")))?;

    let (stage, entry_point) = match module.entry_points.first() {
        Some(entry) => {
            let stage = match entry.stage {
                naga::ShaderStage::Vertex => ShaderStage::Vertex,
                naga::ShaderStage::Fragment => ShaderStage::Fragment,
                naga::ShaderStage::Compute => ShaderStage::Compute,
            };
            (Some(stage), Some(entry.name.clone()))
        }
        None => (None, None),
    };

    let mut push_constant_size = 0;
    let mut bindings = Vec::new();
    for (_, var) in module.global_variables.iter() {
        if var.space == naga::AddressSpace::PushConstant {
            push_constant_size = push_constant_size.max(layouter[var.ty].size);
        } else if let Some(binding) = &var.binding {
            bindings.push(ShaderBinding {
                set: binding.group,
                binding: binding.binding,
            });
        }
    }
    bindings.sort_by_key(|b| (b.set, b.binding));
    bindings.dedup();

    Ok(ShaderReflection {
        stage,
        entry_point,
        bindings,
        push_constant_size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;

    const VERTEX_WGSL: &str = r#"
struct Roots {
    slots: array<vec2<u32>, 2>,
}

var<push_constant> roots: Roots;
@group(0) @binding(1) var albedo: texture_2d<f32>;

@vertex
fn main(@builtin(vertex_index) index: u32) -> @builtin(position) vec4<f32> {
    let size = textureDimensions(albedo);
    return vec4<f32>(f32(roots.slots[0].x + size.x), f32(index), 0.0, 1.0);
}
"#;

    const COMPUTE_WGSL: &str = r#"
struct Transforms {
    matrices: array<mat4x4<f32>, 3>,
}

var<push_constant> transforms: Transforms;
@group(0) @binding(4) var output: texture_storage_2d<rgba16float, write>;
@group(0) @binding(2) var source: texture_2d<f32>;

@compute @workgroup_size(8, 8, 1)
fn blur(@builtin(global_invocation_id) id: vec3<u32>) {
    let value = textureLoad(source, vec2<i32>(id.xy), 0) * transforms.matrices[2][0].x;
    textureStore(output, vec2<i32>(id.xy), value);
}
"#;

    #[test]
    fn test_reflect_push_constants_and_bindings() {
        let bytes = test_support::compile_wgsl(VERTEX_WGSL);
        let reflection = reflect(&bytes, Path::new("test.vs")).unwrap();
        assert_eq!(reflection.stage, Some(ShaderStage::Vertex));
        assert_eq!(reflection.entry_point.as_deref(), Some("main"));
        assert_eq!(reflection.push_constant_size, 16);
        assert_eq!(reflection.root_slot_count(), 2);
        assert_eq!(reflection.bindings, vec![ShaderBinding { set: 0, binding: 1 }]);
    }

    #[test]
    fn test_reflect_array_of_matrices() {
        let bytes = test_support::compile_wgsl(COMPUTE_WGSL);
        let reflection = reflect(&bytes, Path::new("test.cs")).unwrap();
        assert_eq!(reflection.stage, Some(ShaderStage::Compute));
        assert_eq!(reflection.entry_point.as_deref(), Some("blur"));
        assert_eq!(reflection.push_constant_size, 192);
        assert_eq!(reflection.root_slot_count(), 24);
        assert_eq!(
            reflection.bindings,
            vec![ShaderBinding { set: 0, binding: 2 }, ShaderBinding { set: 0, binding: 4 }]
        );
    }

    #[test]
    fn test_truncated_module_is_invalid() {
        // Header plus the opcode word of the first instruction, without its operands
        let mut bytes = test_support::compile_wgsl(VERTEX_WGSL);
        bytes.truncate(24);
        assert!(matches!(
            reflect(&bytes, Path::new("bad.vs")),
            Err(EngineError::InvalidShader { .. })
        ));
    }

    #[test]
    fn test_load_missing_empty_and_invalid() {
        let dir = test_support::temp_dir("shaders");
        assert!(matches!(
            ShaderBlob::load(&dir, "missing", ShaderStage::Vertex),
            Err(EngineError::ShaderNotFound(_))
        ));

        std::fs::write(shader_path(&dir, "empty", ShaderStage::Fragment), b"").unwrap();
        assert!(matches!(
            ShaderBlob::load(&dir, "empty", ShaderStage::Fragment),
            Err(EngineError::EmptyShader(_))
        ));

        std::fs::write(shader_path(&dir, "dxil", ShaderStage::Compute), b"DXBC0000").unwrap();
        assert!(matches!(
            ShaderBlob::load(&dir, "dxil", ShaderStage::Compute),
            Err(EngineError::InvalidShader { .. })
        ));
    }

    #[test]
    fn test_load_valid_blob() {
        let dir = test_support::temp_dir("shaders");
        std::fs::write(
            shader_path(&dir, "render", ShaderStage::Vertex),
            test_support::compile_wgsl(VERTEX_WGSL),
        )
        .unwrap();

        let blob = ShaderBlob::load(&dir, "render", ShaderStage::Vertex).unwrap();
        assert!(blob.path.ends_with("render.hlsl.vs.cso"));
        assert_eq!(blob.reflect().unwrap().root_slot_count(), 2);
    }
}
