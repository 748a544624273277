//! PBR / IBL Engine - a physically based renderer lit by an HDR environment
//!
//! The engine precomputes irradiance and prefiltered environment cube maps
//! plus a BRDF lookup table from an equirectangular panorama, draws PBR
//! meshes with them and post-processes the frame with bloom and tone mapping.
//!
//! # Features
//! - Bump allocation of descriptors and upload memory, never freed per frame
//! - Every GPU texture and buffer tracks its own resource state
//! - Compute mip generation for 2D and cube textures
//! - Supersampled, multisampled HDR scene target
//! - Two backends: Vulkan (native) and a headless recorder that validates
//!   every barrier, used by the tests

pub mod backend;
pub mod config;
pub mod engine;
pub mod error;
pub mod pipeline;
pub mod resources;
pub mod scene;
pub mod window;

#[cfg(test)]
mod test_support;

pub use backend::{GraphicsBackend, RecordingBackend};
#[cfg(not(target_arch = "wasm32"))]
pub use backend::vulkan::VulkanBackend;
pub use engine::{Engine, SceneAssets};
pub use error::{EngineError, EngineResult};
pub use scene::InputState;
pub use window::Window;

use std::path::PathBuf;

/// Configuration for initializing the graphics engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Window title
    pub title: String,
    /// Initial window width
    pub width: u32,
    /// Initial window height
    pub height: u32,
    /// Enable vsync
    pub vsync: bool,
    /// Directory the scene asset paths are relative to
    pub asset_root: PathBuf,
    /// Directory holding the compiled shader blobs
    pub shader_root: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            title: "PBR IBL Engine".to_string(),
            width: 1280,
            height: 720,
            vsync: true,
            asset_root: PathBuf::from("."),
            shader_root: PathBuf::from(config::SHADER_DIRECTORY),
        }
    }
}
