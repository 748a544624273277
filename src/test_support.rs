//! Shared fixtures for unit tests

use crate::backend::types::ShaderStage;
use crate::pipeline::shader::shader_path;
use crate::pipeline::PassId;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

static NEXT_DIR: AtomicU32 = AtomicU32::new(0);

/// Create a fresh directory under the system temp dir
pub fn temp_dir(prefix: &str) -> PathBuf {
    let id = NEXT_DIR.fetch_add(1, Ordering::Relaxed);
    let dir = std::env::temp_dir().join(format!("pbr-ibl-{prefix}-{}-{id}", std::process::id()));
    if dir.exists() {
        std::fs::remove_dir_all(&dir).unwrap();
    }
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// Compile WGSL source to a SPIR-V blob
pub fn compile_wgsl(source: &str) -> Vec<u8> {
    let module = naga::front::wgsl::parse_str(source).unwrap();
    let info = naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::all(),
    )
    .validate(&module)
    .unwrap();
    let options = naga::back::spv::Options {
        flags: naga::back::spv::WriterFlags::empty(),
        zero_initialize_workgroup_memory: naga::back::spv::ZeroInitializeWorkgroupMemoryMode::None,
        ..Default::default()
    };
    let words = naga::back::spv::write_vec(&module, &info, &options, None).unwrap();
    bytemuck::cast_slice(&words).to_vec()
}

/// WGSL for a `main` entry point of `stage` whose push constant block holds `root_slots` 8-byte slots
pub fn stub_wgsl(stage: ShaderStage, root_slots: u32) -> String {
    let (roots, read) = if root_slots == 0 {
        (String::new(), "0u")
    } else {
        (
            format!("struct Roots {{\n    slots: array<vec2<u32>, {root_slots}>,\n}}\n\nvar<push_constant> roots: Roots;\n\n"),
            "roots.slots[0].x",
        )
    };
    let entry = match stage {
        ShaderStage::Vertex => format!(
            "@vertex\nfn main() -> @builtin(position) vec4<f32> {{\n    return vec4<f32>(f32({read}), 0.0, 0.0, 1.0);\n}}\n"
        ),
        ShaderStage::Fragment => format!(
            "@fragment\nfn main() -> @location(0) vec4<f32> {{\n    return vec4<f32>(f32({read}), 0.0, 0.0, 1.0);\n}}\n"
        ),
        ShaderStage::Compute => format!(
            "var<workgroup> scratch: u32;\n\n@compute @workgroup_size(8, 8, 1)\nfn main() {{\n    scratch = {read};\n}}\n"
        ),
    };
    roots + &entry
}

pub fn write_shader(dir: &Path, name: &str, stage: ShaderStage, root_slots: u32) {
    let bytes = compile_wgsl(&stub_wgsl(stage, root_slots));
    std::fs::write(shader_path(dir, name, stage), bytes).unwrap();
}

/// Write a blob for every stage of every pass into a new directory
pub fn shader_directory() -> PathBuf {
    let dir = temp_dir("shaders");
    for pass in PassId::ALL {
        let slots = pass.root_slot_count();
        match pass.shader_names() {
            (vertex, Some(pixel)) => {
                write_shader(&dir, vertex, ShaderStage::Vertex, slots);
                write_shader(&dir, pixel, ShaderStage::Fragment, 0);
            }
            (compute, None) => write_shader(&dir, compute, ShaderStage::Compute, slots),
        }
    }
    dir
}
