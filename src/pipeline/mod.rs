//! Rendering passes
//!
//! Every pass the renderer runs is identified by a [`PassId`]. The
//! [`PipelineRegistry`] loads the shader blobs of each pass once at startup and
//! keeps the resulting root signature and pipeline object for the lifetime of
//! the engine. The multi-step passes live in their own modules:
//! - [`ibl`]: environment cube, irradiance, prefiltered specular and BRDF bakes
//! - [`mipmaps`]: compute mip chain generation
//! - [`postprocess`]: bright pass, bloom and tone mapping

pub mod constants;
pub mod ibl;
pub mod mipmaps;
pub mod postprocess;
pub mod shader;

use crate::backend::traits::*;
use crate::backend::types::*;
use crate::config;
use crate::error::{EngineError, EngineResult};
use shader::ShaderBlob;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Identifier of one rendering pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PassId {
    Render,
    Present8bit,
    Spherical2Cube,
    SampleEnvMap,
    CreateIrradianceMap,
    PrefilterEnvMap,
    CreateBRDFMap,
    GenerateMips,
    Threshold,
    Blur,
    UpsampleBlend,
}

impl PassId {
    pub const ALL: [PassId; 11] = [
        PassId::Render,
        PassId::Present8bit,
        PassId::Spherical2Cube,
        PassId::SampleEnvMap,
        PassId::CreateIrradianceMap,
        PassId::PrefilterEnvMap,
        PassId::CreateBRDFMap,
        PassId::GenerateMips,
        PassId::Threshold,
        PassId::Blur,
        PassId::UpsampleBlend,
    ];

    /// Blob base names: `(vertex, Some(pixel))` for graphics passes, `(compute, None)` otherwise
    pub fn shader_names(&self) -> (&'static str, Option<&'static str>) {
        match self {
            PassId::Render => ("render", Some("render")),
            PassId::Present8bit => ("present", Some("present")),
            PassId::Spherical2Cube => ("spherical2Cube", Some("spherical2Cube")),
            PassId::SampleEnvMap => ("sampleEnvMap", Some("sampleEnvMap")),
            PassId::CreateIrradianceMap => ("createIrradianceMap", Some("createIrradianceMap")),
            PassId::PrefilterEnvMap => ("prefilterEnvMap", Some("prefilterEnvMap")),
            PassId::CreateBRDFMap => ("createBRDFMap", None),
            PassId::GenerateMips => ("generateMips", None),
            PassId::Threshold => ("threshold", None),
            PassId::Blur => ("blur", None),
            PassId::UpsampleBlend => ("upsampleBlend", None),
        }
    }

    pub fn is_compute(&self) -> bool {
        self.shader_names().1.is_none()
    }

    /// Root slots the renderer binds for this pass. A shader exposing fewer is rejected.
    pub fn root_slot_count(&self) -> u32 {
        match self {
            // camera, model, pixel constants, IBL table, material table
            PassId::Render => 5,
            // tone mapping constants, HDR + bloom table
            PassId::Present8bit => 2,
            PassId::Spherical2Cube | PassId::SampleEnvMap | PassId::CreateIrradianceMap => 2,
            // camera, roughness, environment
            PassId::PrefilterEnvMap => 3,
            PassId::CreateBRDFMap => 1,
            // constants, source table, destination table
            PassId::GenerateMips | PassId::Threshold => 3,
            // constants, kernel or second source, source table, destination table
            PassId::Blur | PassId::UpsampleBlend => 4,
        }
    }
}

/// Fixed-function state of a graphics pass
#[derive(Debug, Clone)]
pub struct GraphicsPassState {
    pub cull_mode: CullMode,
    pub depth_stencil: Option<DepthStencilState>,
    pub color_format: TextureFormat,
    pub sample_count: u32,
}

impl GraphicsPassState {
    /// State of `pass`, or `None` for compute passes. `msaa_samples` applies to
    /// the passes drawing into the multisampled scene target.
    pub fn for_pass(pass: PassId, msaa_samples: u32) -> Option<Self> {
        let offscreen = |cull_mode| Self {
            cull_mode,
            depth_stencil: None,
            color_format: config::HDR_FORMAT,
            sample_count: 1,
        };

        let state = match pass {
            PassId::Render => Self {
                cull_mode: CullMode::Back,
                depth_stencil: Some(DepthStencilState {
                    format: config::DEPTH_FORMAT,
                    depth_test_enabled: true,
                    depth_write_enabled: true,
                    depth_compare: CompareFunction::Less,
                }),
                color_format: config::HDR_FORMAT,
                sample_count: msaa_samples,
            },
            PassId::SampleEnvMap => Self {
                cull_mode: CullMode::Back,
                depth_stencil: Some(DepthStencilState {
                    format: config::DEPTH_FORMAT,
                    depth_test_enabled: false,
                    depth_write_enabled: false,
                    depth_compare: CompareFunction::Always,
                }),
                color_format: config::HDR_FORMAT,
                sample_count: msaa_samples,
            },
            PassId::Present8bit => Self {
                color_format: config::BACK_BUFFER_FORMAT,
                ..offscreen(CullMode::Back)
            },
            PassId::Spherical2Cube | PassId::CreateIrradianceMap | PassId::PrefilterEnvMap => {
                offscreen(CullMode::None)
            }
            _ => return None,
        };
        Some(state)
    }
}

struct PipelineEntry {
    pipeline: PipelineHandle,
    root_signature: RootSignatureHandle,
    root_slot_count: u32,
}

/// Pipelines of every pass, created once and never modified
pub struct PipelineRegistry {
    shader_dir: PathBuf,
    entries: HashMap<PassId, PipelineEntry>,
}

impl PipelineRegistry {
    pub fn new(shader_dir: impl Into<PathBuf>) -> Self {
        Self {
            shader_dir: shader_dir.into(),
            entries: HashMap::new(),
        }
    }

    pub fn shader_dir(&self) -> &Path {
        &self.shader_dir
    }

    /// Create the root signature described by `blob`, checking it covers the slots `id` binds
    fn create_root_signature(
        &self,
        backend: &mut dyn GraphicsBackend,
        id: PassId,
        blob: &ShaderBlob,
    ) -> EngineResult<(RootSignatureHandle, u32)> {
        let reflection = blob.reflect()?;
        let slots = reflection.root_slot_count();
        if slots < id.root_slot_count() {
            return Err(EngineError::InvalidShader {
                path: blob.path.clone(),
                reason: format!(
                    "push constant block holds {slots} root slots, {id:?} binds {}",
                    id.root_slot_count()
                ),
            });
        }
        let desc = reflection.root_signature_desc(&format!("{id:?} Root Signature"), blob.stage);
        Ok((backend.create_root_signature(&desc)?, slots))
    }

    /// Load `vs_name` and `ps_name`, derive the root signature from the vertex
    /// blob and create the pipeline for `id`
    pub fn add_graphics_pipeline(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        id: PassId,
        state: &GraphicsPassState,
        vs_name: &str,
        ps_name: &str,
    ) -> EngineResult<()> {
        let vertex = ShaderBlob::load(&self.shader_dir, vs_name, ShaderStage::Vertex)?;
        let pixel = ShaderBlob::load(&self.shader_dir, ps_name, ShaderStage::Fragment)?;
        let (root_signature, root_slot_count) = self.create_root_signature(backend, id, &vertex)?;

        let pipeline = backend.create_graphics_pipeline(&GraphicsPipelineDesc {
            label: Some(format!("{id:?} Pipeline")),
            root_signature,
            vertex_shader: vertex.bytes,
            pixel_shader: pixel.bytes,
            vertex_layout: Vertex::layout(),
            cull_mode: state.cull_mode,
            depth_stencil: state.depth_stencil.clone(),
            color_format: state.color_format,
            sample_count: state.sample_count,
        })?;

        log::debug!("Created graphics pipeline {id:?} ({root_slot_count} root slots)");
        self.entries.insert(
            id,
            PipelineEntry {
                pipeline,
                root_signature,
                root_slot_count,
            },
        );
        Ok(())
    }

    /// Load `cs_name` and create the compute pipeline for `id`
    pub fn add_compute_pipeline(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        id: PassId,
        cs_name: &str,
    ) -> EngineResult<()> {
        let compute = ShaderBlob::load(&self.shader_dir, cs_name, ShaderStage::Compute)?;
        let (root_signature, root_slot_count) = self.create_root_signature(backend, id, &compute)?;

        let pipeline = backend.create_compute_pipeline(&ComputePipelineDesc {
            label: Some(format!("{id:?} Pipeline")),
            root_signature,
            compute_shader: compute.bytes,
        })?;

        log::debug!("Created compute pipeline {id:?} ({root_slot_count} root slots)");
        self.entries.insert(
            id,
            PipelineEntry {
                pipeline,
                root_signature,
                root_slot_count,
            },
        );
        Ok(())
    }

    /// Create the pipeline of every [`PassId`]
    pub fn register_all(&mut self, backend: &mut dyn GraphicsBackend, msaa_samples: u32) -> EngineResult<()> {
        for id in PassId::ALL {
            match (id.shader_names(), GraphicsPassState::for_pass(id, msaa_samples)) {
                ((vs_name, Some(ps_name)), Some(state)) => {
                    self.add_graphics_pipeline(backend, id, &state, vs_name, ps_name)?
                }
                ((cs_name, _), _) => self.add_compute_pipeline(backend, id, cs_name)?,
            }
        }
        log::info!(
            "Registered {} pipelines from {}",
            self.entries.len(),
            self.shader_dir.display()
        );
        Ok(())
    }

    pub fn get(&self, id: PassId) -> EngineResult<PipelineHandle> {
        self.entries
            .get(&id)
            .map(|entry| entry.pipeline)
            .ok_or(EngineError::MissingPipeline(id))
    }

    pub fn root_signature(&self, id: PassId) -> EngineResult<RootSignatureHandle> {
        self.entries
            .get(&id)
            .map(|entry| entry.root_signature)
            .ok_or(EngineError::MissingPipeline(id))
    }

    pub fn root_slot_count(&self, id: PassId) -> Option<u32> {
        self.entries.get(&id).map(|entry| entry.root_slot_count)
    }

    /// Bind the pipeline of `id` on the current command list
    pub fn bind(&self, backend: &mut dyn GraphicsBackend, id: PassId) -> EngineResult<()> {
        backend.set_pipeline(self.get(id)?);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::RecordingBackend;
    use crate::test_support;

    #[test]
    fn test_register_all_passes() {
        let mut backend = RecordingBackend::new(64, 64, 2);
        let mut registry = PipelineRegistry::new(test_support::shader_directory());
        registry.register_all(&mut backend, 4).unwrap();

        assert_eq!(registry.len(), PassId::ALL.len());
        for id in PassId::ALL {
            let pipeline = registry.get(id).unwrap();
            assert_eq!(backend.pipeline_label(pipeline), Some(format!("{id:?} Pipeline").as_str()));
            assert_eq!(registry.root_slot_count(id), Some(id.root_slot_count()));
        }
    }

    #[test]
    fn test_missing_shader_fails_fast() {
        let mut backend = RecordingBackend::new(64, 64, 2);
        let dir = test_support::temp_dir("no-shaders");
        let mut registry = PipelineRegistry::new(&dir);
        let err = registry
            .add_compute_pipeline(&mut backend, PassId::Blur, "blur")
            .unwrap_err();
        assert!(matches!(err, EngineError::ShaderNotFound(ref path) if path.ends_with("blur.hlsl.cs.cso")));
        assert!(matches!(registry.get(PassId::Blur), Err(EngineError::MissingPipeline(PassId::Blur))));
    }

    #[test]
    fn test_empty_pixel_shader_fails_fast() {
        let mut backend = RecordingBackend::new(64, 64, 2);
        let dir = test_support::temp_dir("empty-ps");
        test_support::write_shader(&dir, "present", ShaderStage::Vertex, 2);
        std::fs::write(shader::shader_path(&dir, "present", ShaderStage::Fragment), b"").unwrap();

        let mut registry = PipelineRegistry::new(&dir);
        let state = GraphicsPassState::for_pass(PassId::Present8bit, 1).unwrap();
        let err = registry
            .add_graphics_pipeline(&mut backend, PassId::Present8bit, &state, "present", "present")
            .unwrap_err();
        assert!(matches!(err, EngineError::EmptyShader(_)));
    }

    #[test]
    fn test_too_few_root_slots_rejected() {
        let mut backend = RecordingBackend::new(64, 64, 2);
        let dir = test_support::temp_dir("few-slots");
        test_support::write_shader(&dir, "blur", ShaderStage::Compute, 2);

        let mut registry = PipelineRegistry::new(&dir);
        let err = registry
            .add_compute_pipeline(&mut backend, PassId::Blur, "blur")
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidShader { .. }));
    }

    #[test]
    fn test_fixed_function_table() {
        let render = GraphicsPassState::for_pass(PassId::Render, 8).unwrap();
        assert_eq!(render.sample_count, 8);
        assert!(render.depth_stencil.as_ref().is_some_and(|d| d.depth_write_enabled));

        let env = GraphicsPassState::for_pass(PassId::SampleEnvMap, 8).unwrap();
        assert!(env.depth_stencil.as_ref().is_some_and(|d| !d.depth_test_enabled));

        let present = GraphicsPassState::for_pass(PassId::Present8bit, 8).unwrap();
        assert_eq!(present.color_format, config::BACK_BUFFER_FORMAT);
        assert_eq!(present.sample_count, 1);

        assert!(GraphicsPassState::for_pass(PassId::Blur, 8).is_none());
        assert!(PassId::GenerateMips.is_compute());
    }
}
