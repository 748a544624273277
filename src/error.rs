//! Crate-level error type

use crate::backend::BackendError;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while loading assets, building pipelines or rendering
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("Shader not found: {}", .0.display())]
    ShaderNotFound(PathBuf),
    #[error("Shader is empty: {}", .0.display())]
    EmptyShader(PathBuf),
    #[error("Invalid shader {}: {reason}", .path.display())]
    InvalidShader { path: PathBuf, reason: String },
    #[error("Unsupported file extension: {}", .0.display())]
    UnsupportedExtension(PathBuf),
    #[error("Unsupported pixel format in {}: {reason}", .path.display())]
    UnsupportedPixelFormat { path: PathBuf, reason: String },
    #[error("Unsupported color space in {}", .0.display())]
    UnsupportedColorSpace(PathBuf),
    #[error("Failed to parse mesh {}: {reason}", .path.display())]
    MeshParse { path: PathBuf, reason: String },
    #[error("Image decoding failed: {0}")]
    Image(#[from] image::ImageError),
    #[error("EXR decoding failed: {0}")]
    Exr(#[from] exr::error::Error),
    #[error("glTF loading failed: {0}")]
    Gltf(#[from] gltf::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{object} is {actual} but {operation} needs {expected}")]
    InvalidState {
        object: String,
        operation: &'static str,
        expected: &'static str,
        actual: &'static str,
    },
    #[error("Window error: {0}")]
    Window(String),
    #[error("Pipeline {0:?} was never registered")]
    MissingPipeline(crate::pipeline::PassId),
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EngineError::ShaderNotFound(PathBuf::from("shaders/render.hlsl.vs.cso"));
        assert_eq!(err.to_string(), "Shader not found: shaders/render.hlsl.vs.cso");

        let err = EngineError::UnsupportedExtension(PathBuf::from("mesh.fbx"));
        assert_eq!(err.to_string(), "Unsupported file extension: mesh.fbx");

        let err: EngineError = BackendError::OutOfMemory.into();
        assert_eq!(err.to_string(), "Out of memory");

        let err = EngineError::InvalidState {
            object: "mesh 'sphere'".into(),
            operation: "schedule_draw",
            expected: "Uploaded",
            actual: "Loaded",
        };
        assert_eq!(err.to_string(), "mesh 'sphere' is Loaded but schedule_draw needs Uploaded");
    }
}
