//! Bloom post-processing effect
//!
//! A bright pass writes the HDR pixels above a threshold into mip 0 of a
//! cascade texture whose mip chain is then generated. Starting at the
//! coarsest mip, each step blurs the previous result and blends it with the
//! next finer cascade level, until the accumulation buffer holds a full
//! resolution glow.

use crate::backend::traits::*;
use crate::backend::types::*;
use crate::config;
use crate::error::EngineResult;
use crate::pipeline::constants::{BlendParams, BlurConstants, BlurKernel, ThresholdParams, FILTER_N_THREADS};
use crate::pipeline::mipmaps::MipGenerator;
use crate::pipeline::{PassId, PipelineRegistry};
use crate::resources::heap::{CpuHeapKind, DescriptorAllocator, UploadAllocation};
use crate::resources::state::TrackedTexture;

const BLUR_WEIGHTS: [f32; 3] = [0.25, 0.5, 0.25];
const THREAD_GROUP_SIZE: u32 = 8;

fn mip_size(size: u32, mip: u32) -> u32 {
    (size >> mip).max(1)
}

/// Shader-visible views of one texture
struct Views {
    srv: GpuDescriptor,
    uav: GpuDescriptor,
}

fn create_views(
    backend: &mut dyn GraphicsBackend,
    allocator: &mut DescriptorAllocator,
    texture: &TrackedTexture,
) -> EngineResult<Views> {
    let cpu = allocator.allocate_descriptors(CpuHeapKind::ShaderResource, 2);
    backend.create_shader_resource_view(texture.handle(), &ShaderResourceViewDesc::texture_2d(), cpu)?;
    backend.create_unordered_access_view(texture.handle(), &UnorderedAccessViewDesc::default(), cpu.offset(1))?;
    let gpu = allocator.copy_descriptors_to_gpu_heap(backend, 2, cpu)?;
    Ok(Views {
        srv: gpu,
        uav: gpu.offset(1),
    })
}

fn storage_texture(
    backend: &mut dyn GraphicsBackend,
    label: &str,
    width: u32,
    height: u32,
    mip_levels: u32,
    initial_state: ResourceState,
) -> EngineResult<TrackedTexture> {
    Ok(TrackedTexture::create(
        backend,
        TextureDescriptor {
            label: Some(label.to_string()),
            width,
            height,
            mip_levels,
            format: config::HDR_FORMAT,
            usage: TextureUsage::STORAGE_BINDING | TextureUsage::TEXTURE_BINDING | TextureUsage::COPY_DST,
            initial_state,
            ..Default::default()
        },
    )?)
}

/// Bloom post-processing pass
pub struct BloomPass {
    pub threshold: f32,
    pub blend_factor: f32,

    cascade: TrackedTexture,
    cascade_views: Views,
    blur: TrackedTexture,
    blur_views: Views,
    accumulation: TrackedTexture,
    accumulation_views: Views,

    threshold_params: UploadAllocation,
    blur_constants: UploadAllocation,
    kernel: UploadAllocation,
    blend_params: UploadAllocation,
}

impl BloomPass {
    /// Create the cascade and scratch buffers for a `width` x `height` HDR image.
    ///
    /// Frame start states: cascade non-pixel-shader readable, both scratch buffers unordered access.
    pub fn new(
        backend: &mut dyn GraphicsBackend,
        allocator: &mut DescriptorAllocator,
        width: u32,
        height: u32,
    ) -> EngineResult<Self> {
        let levels = config::BLOOM_MIP_LEVELS.min(TextureDescriptor::full_mip_count(width, height));
        let cascade = storage_texture(
            backend,
            "Bloom Cascade",
            width,
            height,
            levels,
            ResourceState::NonPixelShaderResource,
        )?;
        let blur = storage_texture(backend, "Bloom Blur", width, height, 1, ResourceState::UnorderedAccess)?;
        let accumulation = storage_texture(
            backend,
            "Bloom Accumulation",
            width,
            height,
            1,
            ResourceState::UnorderedAccess,
        )?;

        let cascade_views = create_views(backend, allocator, &cascade)?;
        let blur_views = create_views(backend, allocator, &blur)?;
        let accumulation_views = create_views(backend, allocator, &accumulation)?;

        let steps = levels.saturating_sub(1).max(1) as u64;
        let mut bloom = Self {
            threshold: config::BLOOM_THRESHOLD,
            blend_factor: config::BLOOM_BLEND_FACTOR,
            cascade,
            cascade_views,
            blur,
            blur_views,
            accumulation,
            accumulation_views,
            threshold_params: allocator.allocate_constants::<ThresholdParams>(1),
            blur_constants: allocator.allocate_constants::<BlurConstants>(steps),
            kernel: allocator.allocate_constants::<BlurKernel>(1),
            blend_params: allocator.allocate_constants::<BlendParams>(steps),
        };
        bloom.write_constants(backend)?;

        log::debug!("Bloom pass created: {width}x{height}, {levels} cascade levels");
        Ok(bloom)
    }

    /// Mip levels of the cascade
    pub fn levels(&self) -> u32 {
        self.cascade.mip_levels()
    }

    /// Coarse-to-fine order of the cascade levels blended into
    fn steps(&self) -> impl Iterator<Item = (u64, u32)> {
        let levels = self.levels();
        (0..levels.saturating_sub(1)).rev().enumerate().map(|(i, mip)| (i as u64, mip))
    }

    /// Rewrite every constant buffer from the current settings
    pub fn write_constants(&mut self, backend: &mut dyn GraphicsBackend) -> EngineResult<()> {
        let (width, height) = (self.cascade.width(), self.cascade.height());
        self.threshold_params.write(
            backend,
            0,
            &ThresholdParams {
                threshold: self.threshold,
                width,
                height,
                _padding: 0,
            },
        )?;
        self.kernel.write(backend, 0, &BlurKernel::from_weights(&BLUR_WEIGHTS))?;

        let steps: Vec<(u64, u32)> = self.steps().collect();
        for (step, mip) in steps {
            let first = step == 0;
            let src_mip = mip + 1;
            self.blur_constants.write(
                backend,
                step,
                &BlurConstants {
                    blur_radius: (BLUR_WEIGHTS.len() / 2) as i32,
                    src_width: mip_size(width, src_mip),
                    src_height: mip_size(height, src_mip),
                    // The accumulation buffer only has mip 0
                    src_mip_level: if first { src_mip } else { 0 },
                },
            )?;

            let (target_width, target_height) = (mip_size(width, mip), mip_size(height, mip));
            self.blend_params.write(
                backend,
                step,
                &BlendParams {
                    uv_scale: [0.5 / target_width as f32, 0.5 / target_height as f32],
                    target_width,
                    target_height,
                    mip_level: mip,
                    blend_factor: self.blend_factor,
                },
            )?;
        }
        Ok(())
    }

    /// Write the pixels of `hdr_srv` above the threshold into cascade mip 0
    pub fn bright_pass(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        pipelines: &PipelineRegistry,
        hdr_srv: GpuDescriptor,
    ) -> EngineResult<()> {
        let mip0 = Subresource::new(0, 0);
        self.cascade
            .transition_subresource(backend, mip0, ResourceState::UnorderedAccess);

        pipelines.bind(backend, PassId::Threshold)?;
        backend.set_root_constant_buffer(0, self.threshold_params.gpu_address);
        backend.set_root_descriptor_table(1, hdr_srv);
        backend.set_root_descriptor_table(2, self.cascade_views.uav);
        backend.dispatch(
            self.cascade.width().div_ceil(THREAD_GROUP_SIZE),
            self.cascade.height().div_ceil(THREAD_GROUP_SIZE),
            1,
        );

        self.cascade
            .transition_subresource(backend, mip0, ResourceState::NonPixelShaderResource);
        Ok(())
    }

    /// Set up the mip generator for the cascade so frames allocate nothing
    pub fn prepare(
        &self,
        backend: &mut dyn GraphicsBackend,
        allocator: &mut DescriptorAllocator,
        mips: &mut MipGenerator,
    ) -> EngineResult<()> {
        mips.prepare(backend, allocator, &self.cascade, self.levels() - 1)
    }

    /// Generate the cascade mip chain from mip 0
    pub fn build_cascade(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        allocator: &mut DescriptorAllocator,
        mips: &mut MipGenerator,
    ) -> EngineResult<()> {
        let levels = self.levels() - 1;
        mips.generate(backend, allocator, &mut self.cascade, levels)
    }

    /// Zero the blur buffer
    pub fn clear_scratch(&mut self, backend: &mut dyn GraphicsBackend) {
        self.blur.transition_to(backend, ResourceState::UnorderedAccess);
        backend.clear_unordered_access(self.blur_views.uav, self.blur.handle(), [0.0; 4]);
        // The first blur writes the same UAV
        self.blur.uav_barrier(backend);
    }

    /// Blur and blend from the coarsest cascade level to the finest.
    ///
    /// Leaves the result in [`BloomPass::output`], pixel-shader readable.
    pub fn apply(&mut self, backend: &mut dyn GraphicsBackend, pipelines: &PipelineRegistry) -> EngineResult<()> {
        let (width, height) = (self.cascade.width(), self.cascade.height());
        let steps: Vec<(u64, u32)> = self.steps().collect();

        for (step, mip) in steps {
            // Blur the previous level into the blur buffer
            let source = if step == 0 {
                self.cascade_views.srv
            } else {
                self.accumulation
                    .transition_to(backend, ResourceState::NonPixelShaderResource);
                self.accumulation_views.srv
            };
            self.blur.transition_to(backend, ResourceState::UnorderedAccess);

            pipelines.bind(backend, PassId::Blur)?;
            backend.set_root_constant_buffer(0, self.blur_constants.gpu_address_of::<BlurConstants>(step));
            backend.set_root_constant_buffer(1, self.kernel.gpu_address);
            backend.set_root_descriptor_table(2, source);
            backend.set_root_descriptor_table(3, self.blur_views.uav);
            let (src_width, src_height) = (mip_size(width, mip + 1), mip_size(height, mip + 1));
            backend.dispatch(
                src_width.div_ceil(FILTER_N_THREADS),
                src_height.div_ceil(FILTER_N_THREADS),
                1,
            );

            // Upsample the blurred level and blend it with this one
            self.blur
                .transition_to(backend, ResourceState::NonPixelShaderResource);
            self.accumulation
                .transition_to(backend, ResourceState::UnorderedAccess);

            pipelines.bind(backend, PassId::UpsampleBlend)?;
            backend.set_root_constant_buffer(0, self.blend_params.gpu_address_of::<BlendParams>(step));
            backend.set_root_descriptor_table(1, self.blur_views.srv);
            backend.set_root_descriptor_table(2, self.cascade_views.srv);
            backend.set_root_descriptor_table(3, self.accumulation_views.uav);
            backend.dispatch(
                mip_size(width, mip).div_ceil(THREAD_GROUP_SIZE),
                mip_size(height, mip).div_ceil(THREAD_GROUP_SIZE),
                1,
            );
        }

        self.accumulation
            .transition_to(backend, ResourceState::PixelShaderResource);
        Ok(())
    }

    /// Bright pass, cascade, scratch clear and blend in frame order
    pub fn record(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        allocator: &mut DescriptorAllocator,
        pipelines: &PipelineRegistry,
        mips: &mut MipGenerator,
        hdr_srv: GpuDescriptor,
    ) -> EngineResult<()> {
        self.bright_pass(backend, pipelines, hdr_srv)?;
        self.build_cascade(backend, allocator, mips)?;
        self.clear_scratch(backend);
        self.apply(backend, pipelines)
    }

    /// Return the scratch buffers to their frame start state
    pub fn restore_frame_state(&mut self, backend: &mut dyn GraphicsBackend) {
        self.blur.transition_to(backend, ResourceState::UnorderedAccess);
        self.accumulation
            .transition_to(backend, ResourceState::UnorderedAccess);
    }

    /// Accumulated glow
    pub fn output(&self) -> &TrackedTexture {
        &self.accumulation
    }

    pub fn cascade(&self) -> &TrackedTexture {
        &self.cascade
    }

    pub fn release(self, backend: &mut dyn GraphicsBackend) {
        for texture in [self.cascade, self.blur, self.accumulation] {
            texture.destroy(backend);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::recording::Command;
    use crate::backend::RecordingBackend;
    use crate::test_support;

    struct Fixture {
        backend: RecordingBackend,
        allocator: DescriptorAllocator,
        pipelines: PipelineRegistry,
        mips: MipGenerator,
        hdr_srv: GpuDescriptor,
    }

    fn fixture() -> Fixture {
        let mut backend = RecordingBackend::new(32, 32, 2);
        let mut pipelines = PipelineRegistry::new(test_support::shader_directory());
        pipelines.register_all(&mut backend, 1).unwrap();
        let mut allocator = DescriptorAllocator::new(&mut backend).unwrap();
        let mips = MipGenerator::new(&pipelines).unwrap();

        let hdr = TrackedTexture::create(
            &mut backend,
            TextureDescriptor {
                label: Some("HDR".into()),
                width: 64,
                height: 64,
                format: config::HDR_FORMAT,
                initial_state: ResourceState::NonPixelShaderResource,
                ..Default::default()
            },
        )
        .unwrap();
        let cpu = allocator.allocate_descriptors(CpuHeapKind::ShaderResource, 1);
        backend
            .create_shader_resource_view(hdr.handle(), &ShaderResourceViewDesc::texture_2d(), cpu)
            .unwrap();
        let hdr_srv = allocator.copy_descriptors_to_gpu_heap(&mut backend, 1, cpu).unwrap();

        Fixture {
            backend,
            allocator,
            pipelines,
            mips,
            hdr_srv,
        }
    }

    #[test]
    fn test_ping_pong_has_no_state_violations() {
        let mut fx = fixture();
        let mut bloom = BloomPass::new(&mut fx.backend, &mut fx.allocator, 64, 64).unwrap();
        assert_eq!(bloom.levels(), config::BLOOM_MIP_LEVELS);

        fx.backend.reset_command_list(0).unwrap();
        bloom
            .record(&mut fx.backend, &mut fx.allocator, &fx.pipelines, &mut fx.mips, fx.hdr_srv)
            .unwrap();
        assert!(fx.backend.violations().is_empty(), "{:?}", fx.backend.violations());

        // threshold + cascade mips (32 -> 2 in one dispatch of 4, 2 -> 1 in another)
        // + one blur and one blend per step
        let steps = (config::BLOOM_MIP_LEVELS - 1) as usize;
        assert_eq!(fx.backend.dispatch_count(), 1 + 2 + 2 * steps);
        assert_eq!(bloom.output().state(), Some(ResourceState::PixelShaderResource));
        assert_eq!(bloom.cascade().state(), Some(ResourceState::NonPixelShaderResource));

        bloom.restore_frame_state(&mut fx.backend);
        assert_eq!(bloom.output().state(), Some(ResourceState::UnorderedAccess));
        fx.backend.close_command_list().unwrap();
        assert!(fx.backend.violations().is_empty(), "{:?}", fx.backend.violations());
    }

    #[test]
    fn test_blur_buffer_cleared_before_blending() {
        let mut fx = fixture();
        let mut bloom = BloomPass::new(&mut fx.backend, &mut fx.allocator, 64, 64).unwrap();
        fx.backend.reset_command_list(0).unwrap();
        bloom
            .record(&mut fx.backend, &mut fx.allocator, &fx.pipelines, &mut fx.mips, fx.hdr_srv)
            .unwrap();

        let commands = fx.backend.commands();
        let clear = commands
            .iter()
            .position(|c| matches!(c, Command::ClearUnorderedAccess { .. }))
            .unwrap();
        let blend_pipeline = fx.pipelines.get(PassId::UpsampleBlend).unwrap();
        let first_blend = commands
            .iter()
            .position(|c| *c == Command::SetPipeline(blend_pipeline))
            .unwrap();
        assert!(clear < first_blend);
    }

    #[test]
    fn test_uav_barrier_between_clear_and_first_blur() {
        let mut fx = fixture();
        let mut bloom = BloomPass::new(&mut fx.backend, &mut fx.allocator, 64, 64).unwrap();
        fx.backend.reset_command_list(0).unwrap();
        bloom
            .record(&mut fx.backend, &mut fx.allocator, &fx.pipelines, &mut fx.mips, fx.hdr_srv)
            .unwrap();
        assert!(fx.backend.violations().is_empty(), "{:?}", fx.backend.violations());

        let commands = fx.backend.commands();
        let clear = commands
            .iter()
            .position(|c| matches!(c, Command::ClearUnorderedAccess { .. }))
            .unwrap();
        let next_dispatch = clear
            + commands[clear..]
                .iter()
                .position(|c| matches!(c, Command::Dispatch { .. }))
                .unwrap();
        let blur = GpuResource::from(bloom.blur.handle());
        assert!(commands[clear..next_dispatch]
            .iter()
            .any(|c| matches!(c, Command::Barrier(b) if b.is_uav() && b.resource == blur)));
    }

    #[test]
    fn test_blend_constants_follow_mip_sizes() {
        let mut fx = fixture();
        let bloom = BloomPass::new(&mut fx.backend, &mut fx.allocator, 64, 32).unwrap();

        // First step blends into the second coarsest level
        let first_mip = bloom.levels() - 2;
        let bytes = fx
            .backend
            .read_buffer(
                bloom.blend_params.buffer,
                bloom.blend_params.offset,
                std::mem::size_of::<BlendParams>(),
            )
            .unwrap();
        let params: BlendParams = bytemuck::pod_read_unaligned(bytes);
        assert_eq!(params.mip_level, first_mip);
        assert_eq!(params.target_width, 64 >> first_mip);
        assert_eq!(params.target_height, (32 >> first_mip).max(1));
        assert_eq!(params.blend_factor, config::BLOOM_BLEND_FACTOR);
        assert_eq!(params.uv_scale[0], 0.5 / params.target_width as f32);
    }
}
