//! Backend abstraction layer
//!
//! Provides the [`GraphicsBackend`] trait and the types shared by the Vulkan
//! backend and the headless recording backend.

pub mod recording;
pub mod traits;
pub mod types;

// Vulkan backend is only available on native platforms
#[cfg(not(target_arch = "wasm32"))]
pub mod vulkan;

pub use recording::{Command, DescriptorView, RecordingBackend};
pub use traits::*;
pub use types::*;
