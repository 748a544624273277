//! Tonemapping and bloom composite onto the back buffer

use crate::backend::traits::*;
use crate::backend::types::*;
use crate::config::{self, ToneMappingMode};
use crate::error::EngineResult;
use crate::pipeline::constants::ToneMapperParams;
use crate::pipeline::{PassId, PipelineRegistry};
use crate::resources::heap::{CpuHeapKind, DescriptorAllocator, UploadAllocation};
use crate::resources::state::TrackedTexture;
use crate::resources::Mesh;

/// Tonemapping post-processing pass
///
/// Reads the resolved HDR image and the bloom result through one two-entry
/// descriptor table and draws the full-screen triangle into the back buffer.
pub struct TonemappingPass {
    pub mode: ToneMappingMode,
    pub bloom_intensity: f32,
    params: UploadAllocation,
    inputs: GpuDescriptor,
}

impl TonemappingPass {
    pub fn new(
        backend: &mut dyn GraphicsBackend,
        allocator: &mut DescriptorAllocator,
        hdr: &TrackedTexture,
        bloom: &TrackedTexture,
    ) -> EngineResult<Self> {
        let cpu = allocator.allocate_descriptors(CpuHeapKind::ShaderResource, 2);
        backend.create_shader_resource_view(hdr.handle(), &ShaderResourceViewDesc::texture_2d(), cpu)?;
        backend.create_shader_resource_view(bloom.handle(), &ShaderResourceViewDesc::texture_2d(), cpu.offset(1))?;
        let inputs = allocator.copy_descriptors_to_gpu_heap(backend, 2, cpu)?;

        let pass = Self {
            mode: config::TONE_MAPPING_MODE,
            bloom_intensity: config::BLOOM_INTENSITY,
            params: allocator.allocate_constants::<ToneMapperParams>(1),
            inputs,
        };
        pass.write_params(backend)?;
        Ok(pass)
    }

    /// Upload `mode` and `bloom_intensity`
    pub fn write_params(&self, backend: &mut dyn GraphicsBackend) -> EngineResult<()> {
        self.params.write(
            backend,
            0,
            &ToneMapperParams {
                tone_mapping_mode: self.mode as u32,
                bloom_intensity: self.bloom_intensity,
            },
        )?;
        Ok(())
    }

    /// HDR and bloom views, in that order
    pub fn inputs(&self) -> GpuDescriptor {
        self.inputs
    }

    /// Draw into `rtv`, which must be in [`ResourceState::RenderTarget`]
    pub fn record(
        &self,
        backend: &mut dyn GraphicsBackend,
        pipelines: &PipelineRegistry,
        rtv: CpuDescriptor,
        width: u32,
        height: u32,
        triangle: &Mesh,
    ) -> EngineResult<()> {
        backend.set_viewport(Viewport::with_size(width, height));
        backend.set_scissor_rect(ScissorRect::with_size(width, height));
        backend.set_render_targets(&[rtv], None);
        backend.clear_render_target(rtv, config::CLEAR_COLOR);

        pipelines.bind(backend, PassId::Present8bit)?;
        backend.set_root_constant_buffer(0, self.params.gpu_address);
        backend.set_root_descriptor_table(1, self.inputs);
        triangle.schedule_draw(backend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::recording::Command;
    use crate::backend::{DescriptorView, RecordingBackend};
    use crate::test_support;

    fn sampled(backend: &mut RecordingBackend, label: &str) -> TrackedTexture {
        TrackedTexture::create(
            backend,
            TextureDescriptor {
                label: Some(label.into()),
                width: 16,
                height: 16,
                format: config::HDR_FORMAT,
                initial_state: ResourceState::PixelShaderResource,
                ..Default::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn test_present_draws_triangle_into_back_buffer() {
        let mut backend = RecordingBackend::new(16, 16, 2);
        let mut pipelines = PipelineRegistry::new(test_support::shader_directory());
        pipelines.register_all(&mut backend, 1).unwrap();
        let mut allocator = DescriptorAllocator::new(&mut backend).unwrap();

        let hdr = sampled(&mut backend, "HDR");
        let bloom = sampled(&mut backend, "Bloom");
        let pass = TonemappingPass::new(&mut backend, &mut allocator, &hdr, &bloom).unwrap();

        let inputs: Vec<TextureHandle> = (0..2)
            .map(|i| backend.gpu_descriptor(pass.inputs().offset(i)).unwrap().texture())
            .collect();
        assert_eq!(inputs, vec![hdr.handle(), bloom.handle()]);

        backend.reset_command_list(0).unwrap();
        let mut triangle = Mesh::present_triangle();
        triangle.create_constants(&mut allocator, &mut backend).unwrap();
        triangle.copy_to_upload_heap(&mut backend).unwrap();

        let back_buffer = backend.back_buffer(0);
        backend.resource_barrier(&[ResourceBarrier::transition(
            back_buffer,
            ResourceState::Present,
            ResourceState::RenderTarget,
        )]);
        let rtv = allocator.allocate_descriptors(CpuHeapKind::RenderTarget, 1);
        backend
            .create_render_target_view(back_buffer, &RenderTargetViewDesc::default(), rtv)
            .unwrap();
        allocator.bind_descriptor_heaps(&mut backend);
        pass.record(&mut backend, &pipelines, rtv, 16, 16, &triangle).unwrap();

        assert!(backend.violations().is_empty(), "{:?}", backend.violations());
        assert_eq!(backend.draw_count(), 1);
        assert!(backend
            .commands()
            .contains(&Command::SetRootDescriptorTable { slot: 1, table: pass.inputs() }));
        assert!(matches!(
            backend.cpu_descriptor(rtv),
            Some(DescriptorView::RenderTarget { texture, .. }) if texture == back_buffer
        ));
    }
}
