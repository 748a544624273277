//! Compile-time tunables
//!
//! Everything the renderer sizes itself by lives here. There is no runtime
//! configuration file; [`crate::EngineConfig`] only covers the window and
//! asset locations.

use crate::backend::types::TextureFormat;

/// Number of frame slots (swap chain buffers and command allocators).
pub const FRAME_COUNT: usize = 2;

/// The scene is rendered at `SSAA_MULTIPLIER` times the window resolution.
pub const SSAA_MULTIPLIER: u32 = 2;

/// Requested MSAA sample count for the scene pass. Backends clamp it to what
/// the device supports.
pub const MSAA_COUNT: u32 = 8;

/// Format of the multisampled scene target and every HDR intermediate.
pub const HDR_FORMAT: TextureFormat = TextureFormat::Rgba16Float;

/// Depth format of the scene pass.
pub const DEPTH_FORMAT: TextureFormat = TextureFormat::Depth32Float;

/// Swap chain format.
pub const BACK_BUFFER_FORMAT: TextureFormat = TextureFormat::Rgba8Unorm;

pub const CLEAR_COLOR: [f32; 4] = [112.0 / 255.0, 151.0 / 255.0, 232.0 / 255.0, 1.0];

pub const CLEAR_DEPTH: f32 = 1.0;

/// Camera translation speed in world units per second.
pub const CAMERA_SPEED: f32 = 2.0;

/// Degrees of yaw/pitch per pixel of mouse offset from the viewport center.
pub const CAMERA_SENSITIVITY: f32 = 0.05;

/// Pitch limit in degrees.
pub const CAMERA_PITCH_LIMIT: f32 = 89.0;

/// Radians per second every scene mesh spins around Y.
pub const MESH_ROTATION_RATE: f32 = 0.02;

/// Tone mapping mode written to the pixel constants.
pub const TONE_MAPPING_MODE: ToneMappingMode = ToneMappingMode::Srgb;

pub const BLOOM_INTENSITY: f32 = 0.5;

/// Mip levels of the bright-pass cascade used by bloom.
pub const BLOOM_MIP_LEVELS: u32 = 6;

pub const BLOOM_BLEND_FACTOR: f32 = 0.7;

/// Bright-pass luminance threshold.
pub const BLOOM_THRESHOLD: f32 = 1.0;

// Descriptor heap capacities
pub const RTV_HEAP_CAPACITY: u32 = 1024;
pub const DSV_HEAP_CAPACITY: u32 = 1024;
pub const CPU_SRV_HEAP_CAPACITY: u32 = 16 * 1024;
pub const GPU_SRV_HEAP_CAPACITY: u32 = 16 * 1024;

/// Size of the linear upload arena holding every constant buffer.
pub const UPLOAD_ARENA_SIZE: u64 = 8 * 1024 * 1024;

/// Every upload arena allocation is rounded up to this.
pub const UPLOAD_ALIGNMENT: u64 = 256;

// IBL resolutions
pub const ENV_MAP_RESOLUTION: u32 = 1024;
pub const IRRADIANCE_MAP_RESOLUTION: u32 = 256;
pub const PREFILTERED_MAP_RESOLUTION: u32 = 256;
pub const PREFILTERED_MAP_MIP_LEVELS: u32 = 6;
pub const BRDF_MAP_RESOLUTION: u32 = 256;

/// Number of spheres in the demo scene.
pub const SPHERE_COUNT: usize = 5;

pub const SHADER_DIRECTORY: &str = "shaders";
pub const HDRI_PATH: &str = "resources/hdris/brown_photostudio_02_8k.exr";
pub const SPHERE_MESH_PATH: &str = "resources/meshes/Sphere.obj";

/// Materials of the demo scene, assigned to spheres in order.
pub const MATERIALS: [&str; 5] = [
    "coast_sand_rocks_02",
    "cliff_side",
    "red_brick",
    "square_tiles_03",
    "wood_table_001",
];

/// Texture suffixes loaded for every material, in descriptor-table order.
pub const MATERIAL_SUFFIXES: [(&str, &str); 3] = [("diff", "jpg"), ("nor_dx", "exr"), ("arm", "exr")];

/// Tone mapping operator applied by the present pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum ToneMappingMode {
    /// Linear to sRGB encode.
    #[default]
    Srgb = 0,
    /// Pass HDR values through unchanged.
    None = 1,
}

/// Path of one material texture following the `<material>/textures/<material>_<suffix>_1k.<ext>`
/// convention.
pub fn material_texture_path(root: &str, material: &str, suffix: &str, ext: &str) -> String {
    format!("{root}/{material}/textures/{material}_{suffix}_1k.{ext}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_material_texture_path() {
        assert_eq!(
            material_texture_path("resources", "red_brick", "nor_dx", "exr"),
            "resources/red_brick/textures/red_brick_nor_dx_1k.exr"
        );
    }

    #[test]
    fn test_upload_alignment_is_power_of_two() {
        assert!(UPLOAD_ALIGNMENT.is_power_of_two());
        assert_eq!(UPLOAD_ARENA_SIZE % UPLOAD_ALIGNMENT, 0);
    }
}
