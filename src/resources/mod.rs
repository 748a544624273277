//! Resource management
//!
//! Descriptor and upload-memory allocation, state-tracked GPU objects,
//! meshes and texture groups.

pub mod heap;
pub mod mesh_loader;
pub mod state;

mod mesh;
mod texture;

pub use heap::{CpuHeapKind, DescriptorAllocator, UploadAllocation};
pub use mesh::*;
pub use state::{TrackedBuffer, TrackedTexture};
pub use texture::*;
