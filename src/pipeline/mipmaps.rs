//! Compute mip chain generation
//!
//! Each dispatch reads one source mip and writes up to four further levels
//! into a scratch texture with unordered access, which are then copied into the
//! destination. Array and cube textures repeat the sequence for every slice.
//!
//! Descriptors and constants come from bump allocators, so everything a
//! texture needs is created the first time it is processed and reused on every
//! later call.

use super::constants::{GenerateMipsConstants, NUM_MIPS_PER_PASS};
use super::{PassId, PipelineRegistry};
use crate::backend::traits::*;
use crate::backend::types::*;
use crate::error::{EngineError, EngineResult};
use crate::resources::heap::{CpuHeapKind, DescriptorAllocator, UploadAllocation};
use crate::resources::state::TrackedTexture;
use std::collections::HashMap;

/// Thread group edge of the mip shader
const THREAD_GROUP_SIZE: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MipDispatch {
    slice: u32,
    src_mip: u32,
    num_mips: u32,
    groups: (u32, u32),
}

struct MipPlan {
    srv: GpuDescriptor,
    constants: UploadAllocation,
    dispatches: Vec<MipDispatch>,
}

/// Scratch texture with a full mip chain plus one 4-entry UAV table per source mip
struct ScratchTexture {
    texture: TrackedTexture,
    uav_tables: Vec<GpuDescriptor>,
}

fn mip_size(size: u32, mip: u32) -> u32 {
    (size >> mip).max(1)
}

/// Split the generation of `levels` mips of a `width` x `height` texture into dispatches.
///
/// A dispatch writes as many levels as the destination size stays divisible by two,
/// at most [`NUM_MIPS_PER_PASS`].
fn plan_dispatches(width: u32, height: u32, array_layers: u32, levels: u32) -> Vec<MipDispatch> {
    let mut dispatches = Vec::new();
    for slice in 0..array_layers {
        let mut src_mip = 0;
        while src_mip < levels {
            let dst_width = mip_size(width, src_mip + 1);
            let dst_height = mip_size(height, src_mip + 1);

            let w = if dst_width == 1 { dst_height } else { dst_width };
            let h = if dst_height == 1 { dst_width } else { dst_height };
            let divisible = (w | h).trailing_zeros() + 1;
            let num_mips = divisible.min(NUM_MIPS_PER_PASS).min(levels - src_mip);

            dispatches.push(MipDispatch {
                slice,
                src_mip,
                num_mips,
                groups: (
                    dst_width.div_ceil(THREAD_GROUP_SIZE),
                    dst_height.div_ceil(THREAD_GROUP_SIZE),
                ),
            });
            src_mip += num_mips;
        }
    }
    dispatches
}

/// Builds mip chains with the [`PassId::GenerateMips`] compute pipeline
pub struct MipGenerator {
    pipeline: PipelineHandle,
    plans: HashMap<(TextureHandle, u32), MipPlan>,
    scratch: HashMap<(u32, u32, TextureFormat), ScratchTexture>,
}

impl MipGenerator {
    pub fn new(pipelines: &PipelineRegistry) -> EngineResult<Self> {
        Ok(Self {
            pipeline: pipelines.get(PassId::GenerateMips)?,
            plans: HashMap::new(),
            scratch: HashMap::new(),
        })
    }

    fn plan(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        allocator: &mut DescriptorAllocator,
        texture: &TrackedTexture,
        levels: u32,
    ) -> EngineResult<&MipPlan> {
        let key = (texture.handle(), levels);
        if !self.plans.contains_key(&key) {
            let cpu_srv = allocator.allocate_descriptors(CpuHeapKind::ShaderResource, 1);
            backend.create_shader_resource_view(
                texture.handle(),
                &ShaderResourceViewDesc::texture_2d_array(),
                cpu_srv,
            )?;
            let srv = allocator.copy_descriptors_to_gpu_heap(backend, 1, cpu_srv)?;

            let dispatches = plan_dispatches(texture.width(), texture.height(), texture.array_layers(), levels);
            let constants = allocator.allocate_constants::<GenerateMipsConstants>(dispatches.len() as u64);
            for (index, dispatch) in dispatches.iter().enumerate() {
                let src_width = mip_size(texture.width(), dispatch.src_mip);
                let src_height = mip_size(texture.height(), dispatch.src_mip);
                let value = GenerateMipsConstants {
                    src_mip_level: dispatch.src_mip,
                    num_mip_levels: dispatch.num_mips,
                    src_dimension: (src_width & 1) | ((src_height & 1) << 1),
                    is_srgb: texture.format().is_srgb() as i32,
                    texel_size: [
                        1.0 / mip_size(texture.width(), dispatch.src_mip + 1) as f32,
                        1.0 / mip_size(texture.height(), dispatch.src_mip + 1) as f32,
                    ],
                    array_slice: dispatch.slice,
                };
                constants.write(backend, index as u64, &value)?;
            }

            log::debug!(
                "Mip plan for {:?}: {} levels in {} dispatches",
                texture.desc().label,
                levels,
                dispatches.len()
            );
            self.plans.insert(
                key,
                MipPlan {
                    srv,
                    constants,
                    dispatches,
                },
            );
        }
        self.plans
            .get(&key)
            .ok_or(EngineError::MissingPipeline(PassId::GenerateMips))
    }

    fn scratch_texture(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        allocator: &mut DescriptorAllocator,
        width: u32,
        height: u32,
        format: TextureFormat,
    ) -> EngineResult<&mut ScratchTexture> {
        let format = format.uav_compatible();
        let key = (width, height, format);
        if !self.scratch.contains_key(&key) {
            let mip_levels = TextureDescriptor::full_mip_count(width, height);
            let texture = TrackedTexture::create(
                backend,
                TextureDescriptor {
                    label: Some(format!("Mip Scratch {width}x{height} {format:?}")),
                    width,
                    height,
                    mip_levels,
                    format,
                    usage: TextureUsage::STORAGE_BINDING | TextureUsage::COPY_SRC,
                    initial_state: ResourceState::UnorderedAccess,
                    ..Default::default()
                },
            )?;

            // Table `s` covers the outputs of a dispatch reading mip `s`. Entries
            // past the last mip repeat it so the shader always sees four views.
            let mut uav_tables = Vec::with_capacity(mip_levels.saturating_sub(1) as usize);
            for src_mip in 0..mip_levels.saturating_sub(1) {
                let cpu = allocator.allocate_descriptors(CpuHeapKind::ShaderResource, NUM_MIPS_PER_PASS);
                for k in 0..NUM_MIPS_PER_PASS {
                    let mip = (src_mip + 1 + k).min(mip_levels - 1);
                    backend.create_unordered_access_view(
                        texture.handle(),
                        &UnorderedAccessViewDesc { mip, slice: 0 },
                        cpu.offset(k),
                    )?;
                }
                uav_tables.push(allocator.copy_descriptors_to_gpu_heap(backend, NUM_MIPS_PER_PASS, cpu)?);
            }

            self.scratch.insert(key, ScratchTexture { texture, uav_tables });
        }
        self.scratch
            .get_mut(&key)
            .ok_or(EngineError::MissingPipeline(PassId::GenerateMips))
    }

    /// Create the descriptors, constants and scratch texture [`MipGenerator::generate`]
    /// will need for `texture`, without recording any command.
    pub fn prepare(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        allocator: &mut DescriptorAllocator,
        texture: &TrackedTexture,
        max_levels: u32,
    ) -> EngineResult<()> {
        let levels = max_levels.min(texture.mip_levels().saturating_sub(1));
        if levels == 0 {
            return Ok(());
        }
        self.plan(backend, allocator, texture, levels)?;
        self.scratch_texture(backend, allocator, texture.width(), texture.height(), texture.format())?;
        Ok(())
    }

    /// Fill mips `1..=max_levels` of `texture` from mip 0.
    ///
    /// The texture must be entirely [`ResourceState::NonPixelShaderResource`] and is
    /// left that way. A single-level texture or `max_levels == 0` records nothing.
    pub fn generate(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        allocator: &mut DescriptorAllocator,
        texture: &mut TrackedTexture,
        max_levels: u32,
    ) -> EngineResult<()> {
        let levels = max_levels.min(texture.mip_levels().saturating_sub(1));
        if levels == 0 {
            return Ok(());
        }
        if texture.state() != Some(ResourceState::NonPixelShaderResource) {
            return Err(EngineError::InvalidState {
                object: format!("texture {:?}", texture.desc().label),
                operation: "generate mips",
                expected: "NonPixelShaderResource",
                actual: "in another state",
            });
        }

        let pipeline = self.pipeline;
        let (srv, constants, dispatches) = {
            let plan = self.plan(backend, allocator, texture, levels)?;
            (plan.srv, plan.constants, plan.dispatches.clone())
        };
        let (width, height, format) = (texture.width(), texture.height(), texture.format());
        let scratch = self.scratch_texture(backend, allocator, width, height, format)?;

        backend.set_pipeline(pipeline);
        allocator.bind_descriptor_heaps(backend);
        backend.set_root_descriptor_table(1, srv);

        for (index, dispatch) in dispatches.iter().enumerate() {
            backend.set_root_constant_buffer(0, constants.gpu_address_of::<GenerateMipsConstants>(index as u64));
            backend.set_root_descriptor_table(2, scratch.uav_tables[dispatch.src_mip as usize]);
            backend.dispatch(dispatch.groups.0, dispatch.groups.1, 1);

            for mip in dispatch.src_mip + 1..=dispatch.src_mip + dispatch.num_mips {
                let scratch_sub = Subresource::new(mip, 0);
                let dest_sub = Subresource::new(mip, dispatch.slice);

                scratch
                    .texture
                    .transition_subresource(backend, scratch_sub, ResourceState::CopySource);
                texture.transition_subresource(backend, dest_sub, ResourceState::CopyDest);
                backend.copy_texture_region(texture.handle(), dest_sub, scratch.texture.handle(), scratch_sub);
                texture.transition_subresource(backend, dest_sub, ResourceState::NonPixelShaderResource);
                scratch
                    .texture
                    .transition_subresource(backend, scratch_sub, ResourceState::UnorderedAccess);
            }
        }

        log::trace!("Generated {levels} mips for {:?}", texture.desc().label);
        Ok(())
    }

    /// Destroy the scratch textures
    pub fn release(&mut self, backend: &mut dyn GraphicsBackend) {
        for (_, scratch) in self.scratch.drain() {
            scratch.texture.destroy(backend);
        }
        self.plans.clear();
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
        mips: MipGenerator,
    }

    fn fixture() -> Fixture {
        let mut backend = RecordingBackend::new(64, 64, 2);
        let mut registry = PipelineRegistry::new(test_support::shader_directory());
        registry
            .add_compute_pipeline(&mut backend, PassId::GenerateMips, "generateMips")
            .unwrap();
        let allocator = DescriptorAllocator::new(&mut backend).unwrap();
        let mips = MipGenerator::new(&registry).unwrap();
        backend.reset_command_list(0).unwrap();
        Fixture {
            backend,
            allocator,
            mips,
        }
    }

    fn texture(fx: &mut Fixture, size: u32, mip_levels: u32, array_layers: u32, format: TextureFormat) -> TrackedTexture {
        TrackedTexture::create(
            &mut fx.backend,
            TextureDescriptor {
                label: Some("target".into()),
                width: size,
                height: size,
                mip_levels,
                array_layers,
                format,
                initial_state: ResourceState::NonPixelShaderResource,
                ..Default::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn test_degenerate_generation_is_noop() {
        let mut fx = fixture();
        let mut single = texture(&mut fx, 16, 1, 1, TextureFormat::Rgba16Float);
        let mut chain = texture(&mut fx, 16, 5, 1, TextureFormat::Rgba16Float);
        fx.backend.clear_commands();

        fx.mips.generate(&mut fx.backend, &mut fx.allocator, &mut single, 8).unwrap();
        fx.mips.generate(&mut fx.backend, &mut fx.allocator, &mut chain, 0).unwrap();

        assert_eq!(fx.backend.dispatch_count(), 0);
        assert_eq!(fx.backend.texture_copy_count(), 0);
        assert!(fx.backend.commands().is_empty());
        assert_eq!(fx.allocator.gpu_descriptors_used(), 0);
    }

    #[test]
    fn test_four_levels_in_one_dispatch() {
        let mut fx = fixture();
        let mut target = texture(&mut fx, 16, 5, 1, TextureFormat::Rgba16Float);
        fx.mips.generate(&mut fx.backend, &mut fx.allocator, &mut target, 4).unwrap();

        assert_eq!(fx.backend.dispatch_count(), 1);
        assert_eq!(fx.backend.texture_copy_count(), 4);
        assert!(fx.backend.commands().contains(&Command::Dispatch { x: 1, y: 1, z: 1 }));
        assert!(fx.backend.violations().is_empty(), "{:?}", fx.backend.violations());
        assert_eq!(target.state(), Some(ResourceState::NonPixelShaderResource));
    }

    #[test]
    fn test_cube_repeats_per_slice() {
        let mut fx = fixture();
        let mut cube = texture(&mut fx, 8, 4, 6, TextureFormat::Rgba16Float);
        fx.mips.generate(&mut fx.backend, &mut fx.allocator, &mut cube, 3).unwrap();

        assert_eq!(fx.backend.dispatch_count(), 6);
        assert_eq!(fx.backend.texture_copy_count(), 18);
        assert!(fx.backend.violations().is_empty(), "{:?}", fx.backend.violations());
        assert_eq!(
            fx.backend.texture_states(cube.handle()).unwrap(),
            &[ResourceState::NonPixelShaderResource; 24][..]
        );
    }

    #[test]
    fn test_odd_sizes_split_dispatches() {
        let dispatches = plan_dispatches(6, 6, 1, 2);
        assert_eq!(dispatches.len(), 2);
        assert_eq!(dispatches[0].num_mips, 1);
        assert_eq!(dispatches[1].src_mip, 1);
        assert_eq!(dispatches[1].num_mips, 1);

        let dispatches = plan_dispatches(1024, 1024, 1, 10);
        let per_dispatch: Vec<u32> = dispatches.iter().map(|d| d.num_mips).collect();
        assert_eq!(per_dispatch, vec![4, 4, 2]);
        assert_eq!(dispatches[0].groups, (64, 64));
    }

    #[test]
    fn test_repeat_generation_allocates_nothing() {
        let mut fx = fixture();
        let mut target = texture(&mut fx, 32, 6, 1, TextureFormat::Rgba8UnormSrgb);
        fx.mips.generate(&mut fx.backend, &mut fx.allocator, &mut target, 5).unwrap();
        let descriptors = fx.allocator.gpu_descriptors_used();
        let memory = fx.allocator.gpu_memory_used();
        let textures = fx.backend.texture_count();

        fx.mips.generate(&mut fx.backend, &mut fx.allocator, &mut target, 5).unwrap();
        assert_eq!(fx.allocator.gpu_descriptors_used(), descriptors);
        assert_eq!(fx.allocator.gpu_memory_used(), memory);
        assert_eq!(fx.backend.texture_count(), textures);
        assert!(fx.backend.violations().is_empty(), "{:?}", fx.backend.violations());
    }

    #[test]
    fn test_prepare_records_nothing() {
        let mut fx = fixture();
        let mut target = texture(&mut fx, 32, 6, 1, TextureFormat::Rgba16Float);
        fx.backend.clear_commands();
        fx.mips.prepare(&mut fx.backend, &mut fx.allocator, &target, 5).unwrap();
        assert!(fx.backend.commands().is_empty());
        let textures = fx.backend.texture_count();
        let descriptors = fx.allocator.gpu_descriptors_used();

        fx.mips.generate(&mut fx.backend, &mut fx.allocator, &mut target, 5).unwrap();
        assert_eq!(fx.backend.texture_count(), textures);
        assert_eq!(fx.allocator.gpu_descriptors_used(), descriptors);
        assert_eq!(fx.backend.dispatch_count(), 2);
    }

    #[test]
    fn test_srgb_uses_linear_scratch() {
        let mut fx = fixture();
        let mut target = texture(&mut fx, 8, 4, 1, TextureFormat::Rgba8UnormSrgb);
        fx.mips.generate(&mut fx.backend, &mut fx.allocator, &mut target, 3).unwrap();
        assert!(fx.mips.scratch.contains_key(&(8, 8, TextureFormat::Rgba8Unorm)));
    }

    #[test]
    fn test_rejects_wrong_state() {
        let mut fx = fixture();
        let mut target = texture(&mut fx, 8, 4, 1, TextureFormat::Rgba16Float);
        target.transition_to(&mut fx.backend, ResourceState::PixelShaderResource);
        let err = fx
            .mips
            .generate(&mut fx.backend, &mut fx.allocator, &mut target, 3)
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidState { .. }));
    }
}
