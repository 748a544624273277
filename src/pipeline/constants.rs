//! Constant buffer layouts shared with the shaders
//!
//! Each struct is written into the upload arena at a 256-byte stride.

use bytemuck::{Pod, Zeroable};
use glam::Mat4;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct CameraConstants {
    pub view: Mat4,
    pub projection: Mat4,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct ModelConstants {
    pub model: Mat4,
}

/// Per-frame constants of the PBR pixel shader
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct PixelShaderConstants {
    pub eye_position: [f32; 3],
    pub tone_mapping_mode: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct PrefilterConstants {
    pub roughness: f32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct ToneMapperParams {
    pub tone_mapping_mode: u32,
    pub bloom_intensity: f32,
}

/// Number of mips a single mip generation dispatch writes at most
pub const NUM_MIPS_PER_PASS: u32 = 4;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct GenerateMipsConstants {
    pub src_mip_level: u32,
    /// Number of output mips written by this dispatch, 1 to 4
    pub num_mip_levels: u32,
    /// Bit 0: source width is odd. Bit 1: source height is odd.
    pub src_dimension: u32,
    pub is_srgb: i32,
    /// 1 / dimensions of the first output mip
    pub texel_size: [f32; 2],
    pub array_slice: u32,
}

/// Threads per group along each axis of the blur shader
pub const FILTER_N_THREADS: u32 = 16;
pub const MAX_KERNEL_RADIUS: usize = 8;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct BlurConstants {
    pub blur_radius: i32,
    pub src_width: u32,
    pub src_height: u32,
    pub src_mip_level: u32,
}

/// Blur weights, one per 16-byte row so the shader indexes them directly
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct BlurKernel {
    pub w: [f32; 8 * MAX_KERNEL_RADIUS + 4],
}

impl BlurKernel {
    pub fn from_weights(weights: &[f32]) -> Self {
        assert!(
            weights.len() <= 2 * MAX_KERNEL_RADIUS + 1,
            "blur kernel of {} taps exceeds radius {MAX_KERNEL_RADIUS}",
            weights.len()
        );
        let mut kernel = Self::zeroed();
        for (i, &weight) in weights.iter().enumerate() {
            kernel.w[i * 4] = weight;
        }
        kernel
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct BlendParams {
    /// 0.5 / target dimensions
    pub uv_scale: [f32; 2],
    pub target_width: u32,
    pub target_height: u32,
    pub mip_level: u32,
    pub blend_factor: f32,
}

/// Bright-pass parameters
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct ThresholdParams {
    pub threshold: f32,
    pub width: u32,
    pub height: u32,
    pub _padding: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::UploadAllocation;

    #[test]
    fn test_constant_sizes() {
        assert_eq!(std::mem::size_of::<CameraConstants>(), 128);
        assert_eq!(std::mem::size_of::<PixelShaderConstants>(), 16);
        assert_eq!(std::mem::size_of::<GenerateMipsConstants>(), 28);
        assert_eq!(std::mem::size_of::<BlendParams>(), 24);
        assert_eq!(UploadAllocation::stride::<CameraConstants>(), 256);
        assert_eq!(UploadAllocation::stride::<BlurKernel>(), 512);
    }

    #[test]
    fn test_blur_kernel_padding() {
        let kernel = BlurKernel::from_weights(&[0.25, 0.5, 0.25]);
        assert_eq!(kernel.w[0], 0.25);
        assert_eq!(kernel.w[4], 0.5);
        assert_eq!(kernel.w[8], 0.25);
        assert_eq!(kernel.w[1], 0.0);
    }
}
