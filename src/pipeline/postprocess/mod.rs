//! Post-processing effects
//!
//! Bloom runs in compute on the resolved HDR image; tonemapping composites
//! the HDR image and the bloom result onto the back buffer.

mod bloom;
mod tonemapping;

pub use bloom::BloomPass;
pub use tonemapping::TonemappingPass;
