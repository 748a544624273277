//! Image-based lighting precomputation
//!
//! Runs once per panorama:
//! 1. project the equirectangular panorama onto the six faces of an environment cube
//! 2. build the environment cube's mip chain
//! 3. convolve the environment into a diffuse irradiance cube
//! 4. prefilter the environment into a specular cube, one roughness per mip
//! 5. integrate the split-sum BRDF lookup table
//!
//! Every texture produced here ends in [`ResourceState::PixelShaderResource`].

use super::constants::{CameraConstants, PrefilterConstants};
use super::mipmaps::MipGenerator;
use super::{PassId, PipelineRegistry};
use crate::backend::traits::*;
use crate::backend::types::*;
use crate::config;
use crate::error::{EngineError, EngineResult};
use crate::resources::heap::{CpuHeapKind, DescriptorAllocator, UploadAllocation};
use crate::resources::state::TrackedTexture;
use crate::resources::{Mesh, TextureGroup};
use glam::{Mat4, Vec3};

/// Look directions and up vectors of the cube faces, in array slice order
const CUBE_FACES: [(Vec3, Vec3); 6] = [
    (Vec3::X, Vec3::Y),
    (Vec3::NEG_X, Vec3::Y),
    (Vec3::Y, Vec3::NEG_Z),
    (Vec3::NEG_Y, Vec3::Z),
    (Vec3::Z, Vec3::Y),
    (Vec3::NEG_Z, Vec3::Y),
];

/// View matrices looking from the origin through each cube face
pub fn cube_face_views() -> [Mat4; 6] {
    CUBE_FACES.map(|(dir, up)| Mat4::look_to_lh(Vec3::ZERO, dir, up))
}

/// Projection shared by every face: a 2x2 orthographic window
pub fn cube_face_projection() -> Mat4 {
    Mat4::orthographic_lh(-1.0, 1.0, -1.0, 1.0, 0.1, 10.0)
}

/// Textures produced by the bake
pub struct IblMaps {
    environment: TrackedTexture,
    environment_srv: GpuDescriptor,
    irradiance: TrackedTexture,
    prefiltered: TrackedTexture,
    brdf: TrackedTexture,
    range: GpuDescriptor,
}

fn cube_target(
    backend: &mut dyn GraphicsBackend,
    label: &str,
    size: u32,
    mip_levels: u32,
) -> EngineResult<TrackedTexture> {
    Ok(TrackedTexture::create(
        backend,
        TextureDescriptor {
            label: Some(label.to_string()),
            width: size,
            height: size,
            array_layers: 6,
            mip_levels,
            format: config::HDR_FORMAT,
            usage: TextureUsage::RENDER_ATTACHMENT | TextureUsage::TEXTURE_BINDING | TextureUsage::COPY_DST,
            initial_state: ResourceState::RenderTarget,
            cube_compatible: true,
            ..Default::default()
        },
    )?)
}

/// One render target view per mip and face, mip-major
fn face_views(
    backend: &mut dyn GraphicsBackend,
    allocator: &mut DescriptorAllocator,
    texture: &TrackedTexture,
) -> EngineResult<CpuDescriptor> {
    let count = texture.mip_levels() * 6;
    let rtvs = allocator.allocate_descriptors(CpuHeapKind::RenderTarget, count);
    for mip in 0..texture.mip_levels() {
        for slice in 0..6 {
            backend.create_render_target_view(
                texture.handle(),
                &RenderTargetViewDesc { mip, slice },
                rtvs.offset(mip * 6 + slice),
            )?;
        }
    }
    Ok(rtvs)
}

fn cube_srv(
    backend: &mut dyn GraphicsBackend,
    allocator: &mut DescriptorAllocator,
    texture: &TrackedTexture,
) -> EngineResult<CpuDescriptor> {
    let srv = allocator.allocate_descriptors(CpuHeapKind::ShaderResource, 1);
    backend.create_shader_resource_view(texture.handle(), &ShaderResourceViewDesc::cube(), srv)?;
    Ok(srv)
}

/// Clear one face and draw the inward cube into it. Root bindings are the caller's.
fn draw_face(backend: &mut dyn GraphicsBackend, rtv: CpuDescriptor, size: u32, cube: &Mesh) -> EngineResult<()> {
    backend.set_viewport(Viewport::with_size(size, size));
    backend.set_scissor_rect(ScissorRect::with_size(size, size));
    backend.set_render_targets(&[rtv], None);
    backend.clear_render_target(rtv, config::CLEAR_COLOR);
    cube.schedule_draw(backend)
}

impl IblMaps {
    /// Record the whole bake.
    ///
    /// `panorama` must be uploaded and `cube` must be an uploaded inward-facing cube.
    pub fn bake(
        backend: &mut dyn GraphicsBackend,
        allocator: &mut DescriptorAllocator,
        pipelines: &PipelineRegistry,
        mips: &mut MipGenerator,
        panorama: &TextureGroup,
        cube: &Mesh,
    ) -> EngineResult<Self> {
        let panorama_table = panorama.gpu_handle().ok_or_else(|| EngineError::InvalidState {
            object: format!("texture group '{}'", panorama.name()),
            operation: "bake IBL",
            expected: "uploaded",
            actual: "not uploaded",
        })?;

        let cameras = allocator.allocate_constants::<CameraConstants>(6);
        let projection = cube_face_projection();
        for (face, view) in cube_face_views().into_iter().enumerate() {
            cameras.write(backend, face as u64, &CameraConstants { view, projection })?;
        }

        allocator.bind_descriptor_heaps(backend);

        let (environment, environment_cpu) =
            Self::bake_environment(backend, allocator, pipelines, mips, panorama_table, &cameras, cube)?;
        let environment_srv = allocator.copy_descriptors_to_gpu_heap(backend, 1, environment_cpu)?;

        let irradiance = Self::bake_irradiance(backend, allocator, pipelines, environment_srv, &cameras, cube)?;
        let prefiltered = Self::bake_prefiltered(backend, allocator, pipelines, environment_srv, &cameras, cube)?;
        let brdf = Self::bake_brdf(backend, allocator, pipelines)?;

        let srvs = [
            cube_srv(backend, allocator, &irradiance)?,
            cube_srv(backend, allocator, &prefiltered)?,
            {
                let srv = allocator.allocate_descriptors(CpuHeapKind::ShaderResource, 1);
                backend.create_shader_resource_view(brdf.handle(), &ShaderResourceViewDesc::texture_2d(), srv)?;
                srv
            },
        ];
        let (range_cpu, range) = allocator.allocate_gpu_descriptors(srvs.len() as u32);
        for (i, srv) in srvs.into_iter().enumerate() {
            backend.copy_descriptors(1, range_cpu.offset(i as u32), srv)?;
        }

        log::info!("IBL maps baked");
        Ok(Self {
            environment,
            environment_srv,
            irradiance,
            prefiltered,
            brdf,
            range,
        })
    }

    fn bake_environment(
        backend: &mut dyn GraphicsBackend,
        allocator: &mut DescriptorAllocator,
        pipelines: &PipelineRegistry,
        mips: &mut MipGenerator,
        panorama: GpuDescriptor,
        cameras: &UploadAllocation,
        cube: &Mesh,
    ) -> EngineResult<(TrackedTexture, CpuDescriptor)> {
        let size = config::ENV_MAP_RESOLUTION;
        let mut environment = cube_target(
            backend,
            "Environment Map",
            size,
            TextureDescriptor::full_mip_count(size, size),
        )?;
        let rtvs = allocator.allocate_descriptors(CpuHeapKind::RenderTarget, 6);
        for slice in 0..6 {
            backend.create_render_target_view(
                environment.handle(),
                &RenderTargetViewDesc { mip: 0, slice },
                rtvs.offset(slice),
            )?;
        }

        pipelines.bind(backend, PassId::Spherical2Cube)?;
        backend.set_root_descriptor_table(1, panorama);
        for face in 0..6u32 {
            backend.set_root_constant_buffer(0, cameras.gpu_address_of::<CameraConstants>(face as u64));
            draw_face(backend, rtvs.offset(face), size, cube)?;
        }

        environment.transition_to(backend, ResourceState::NonPixelShaderResource);
        let levels = environment.mip_levels() - 1;
        mips.generate(backend, allocator, &mut environment, levels)?;
        environment.transition_to(backend, ResourceState::PixelShaderResource);

        let srv = cube_srv(backend, allocator, &environment)?;
        log::debug!("Environment cube rendered ({size}x{size}, {} mips)", environment.mip_levels());
        Ok((environment, srv))
    }

    fn bake_irradiance(
        backend: &mut dyn GraphicsBackend,
        allocator: &mut DescriptorAllocator,
        pipelines: &PipelineRegistry,
        environment: GpuDescriptor,
        cameras: &UploadAllocation,
        cube: &Mesh,
    ) -> EngineResult<TrackedTexture> {
        let size = config::IRRADIANCE_MAP_RESOLUTION;
        let mut irradiance = cube_target(backend, "Irradiance Map", size, 1)?;
        let rtvs = face_views(backend, allocator, &irradiance)?;

        pipelines.bind(backend, PassId::CreateIrradianceMap)?;
        allocator.bind_descriptor_heaps(backend);
        backend.set_root_descriptor_table(1, environment);
        for face in 0..6u32 {
            backend.set_root_constant_buffer(0, cameras.gpu_address_of::<CameraConstants>(face as u64));
            draw_face(backend, rtvs.offset(face), size, cube)?;
        }

        irradiance.transition_to(backend, ResourceState::PixelShaderResource);
        log::debug!("Irradiance cube rendered ({size}x{size})");
        Ok(irradiance)
    }

    fn bake_prefiltered(
        backend: &mut dyn GraphicsBackend,
        allocator: &mut DescriptorAllocator,
        pipelines: &PipelineRegistry,
        environment: GpuDescriptor,
        cameras: &UploadAllocation,
        cube: &Mesh,
    ) -> EngineResult<TrackedTexture> {
        let size = config::PREFILTERED_MAP_RESOLUTION;
        let mip_levels = config::PREFILTERED_MAP_MIP_LEVELS;
        let mut prefiltered = cube_target(backend, "Prefiltered Environment Map", size, mip_levels)?;
        let rtvs = face_views(backend, allocator, &prefiltered)?;

        let roughness = allocator.allocate_constants::<PrefilterConstants>(mip_levels as u64);
        for mip in 0..mip_levels {
            let value = PrefilterConstants {
                roughness: mip as f32 / (mip_levels - 1).max(1) as f32,
            };
            roughness.write(backend, mip as u64, &value)?;
        }

        pipelines.bind(backend, PassId::PrefilterEnvMap)?;
        allocator.bind_descriptor_heaps(backend);
        backend.set_root_descriptor_table(2, environment);
        for mip in 0..mip_levels {
            let mip_size = (size >> mip).max(1);
            backend.set_root_constant_buffer(1, roughness.gpu_address_of::<PrefilterConstants>(mip as u64));
            for face in 0..6u32 {
                backend.set_root_constant_buffer(0, cameras.gpu_address_of::<CameraConstants>(face as u64));
                draw_face(backend, rtvs.offset(mip * 6 + face), mip_size, cube)?;
            }
        }

        prefiltered.transition_to(backend, ResourceState::PixelShaderResource);
        log::debug!("Prefiltered cube rendered ({size}x{size}, {mip_levels} mips)");
        Ok(prefiltered)
    }

    fn bake_brdf(
        backend: &mut dyn GraphicsBackend,
        allocator: &mut DescriptorAllocator,
        pipelines: &PipelineRegistry,
    ) -> EngineResult<TrackedTexture> {
        let size = config::BRDF_MAP_RESOLUTION;
        let mut brdf = TrackedTexture::create(
            backend,
            TextureDescriptor {
                label: Some("BRDF Map".into()),
                width: size,
                height: size,
                format: TextureFormat::Rg16Float,
                usage: TextureUsage::STORAGE_BINDING | TextureUsage::TEXTURE_BINDING,
                initial_state: ResourceState::UnorderedAccess,
                ..Default::default()
            },
        )?;
        let uav = allocator.allocate_descriptors(CpuHeapKind::ShaderResource, 1);
        backend.create_unordered_access_view(brdf.handle(), &UnorderedAccessViewDesc::default(), uav)?;
        let uav = allocator.copy_descriptors_to_gpu_heap(backend, 1, uav)?;

        pipelines.bind(backend, PassId::CreateBRDFMap)?;
        allocator.bind_descriptor_heaps(backend);
        backend.set_root_descriptor_table(0, uav);
        backend.dispatch(size.div_ceil(8), size.div_ceil(8), 1);

        brdf.transition_to(backend, ResourceState::PixelShaderResource);
        log::debug!("BRDF lookup table integrated ({size}x{size})");
        Ok(brdf)
    }

    /// Raw environment cube, sampled by the background pass
    pub fn environment_srv(&self) -> GpuDescriptor {
        self.environment_srv
    }

    /// Table of irradiance, prefiltered and BRDF maps, in that order
    pub fn gpu_handle(&self) -> GpuDescriptor {
        self.range
    }

    pub fn environment(&self) -> &TrackedTexture {
        &self.environment
    }

    pub fn irradiance(&self) -> &TrackedTexture {
        &self.irradiance
    }

    pub fn prefiltered(&self) -> &TrackedTexture {
        &self.prefiltered
    }

    pub fn brdf(&self) -> &TrackedTexture {
        &self.brdf
    }

    pub fn release(self, backend: &mut dyn GraphicsBackend) {
        for texture in [self.environment, self.irradiance, self.prefiltered, self.brdf] {
            texture.destroy(backend);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DescriptorView, RecordingBackend};
    use crate::resources::TextureData;
    use crate::test_support;

    fn assert_close(a: Vec3, b: Vec3) {
        assert!((a - b).length() < 1e-5, "{a} != {b}");
    }

    #[test]
    fn test_face_views_look_down_their_axis() {
        let views = cube_face_views();
        for (view, (dir, up)) in views.iter().zip(CUBE_FACES) {
            assert_close(view.transform_vector3(dir), Vec3::Z);
            assert_close(view.transform_vector3(up), Vec3::Y);
        }
    }

    #[test]
    fn test_bake_records_expected_work() {
        let mut backend = RecordingBackend::new(64, 64, 2);
        let mut pipelines = PipelineRegistry::new(test_support::shader_directory());
        pipelines.register_all(&mut backend, 1).unwrap();
        let mut allocator = DescriptorAllocator::new(&mut backend).unwrap();
        let mut mips = MipGenerator::new(&pipelines).unwrap();

        backend.reset_command_list(0).unwrap();
        let mut panorama = TextureGroup::new("panorama");
        panorama.add_texture_data(TextureData {
            width: 8,
            height: 4,
            format: TextureFormat::Rgba16Float,
            data: vec![0; 8 * 4 * 8],
            name: "panorama".into(),
        });
        panorama.copy_to_upload_heap(&mut backend, &mut allocator).unwrap();
        let mut cube = Mesh::inward_cube();
        cube.create_constants(&mut allocator, &mut backend).unwrap();
        cube.copy_to_upload_heap(&mut backend).unwrap();
        backend.clear_commands();

        let maps = IblMaps::bake(&mut backend, &mut allocator, &pipelines, &mut mips, &panorama, &cube).unwrap();
        backend.close_command_list().unwrap();

        assert!(backend.violations().is_empty(), "{:?}", backend.violations());
        // 6 environment faces, 6 irradiance faces, 36 prefiltered faces
        let draws_per_cube = cube.sections().len();
        assert_eq!(backend.draw_count(), (6 + 6 + 36) * draws_per_cube);
        // 1024 -> 1 in [4, 4, 2] dispatches per face, plus the BRDF integration
        assert_eq!(backend.dispatch_count(), 6 * 3 + 1);

        for texture in [maps.environment(), maps.irradiance(), maps.prefiltered(), maps.brdf()] {
            assert_eq!(texture.state(), Some(ResourceState::PixelShaderResource));
        }

        let table: Vec<TextureHandle> = (0..3)
            .map(|i| backend.gpu_descriptor(maps.gpu_handle().offset(i)).unwrap().texture())
            .collect();
        assert_eq!(
            table,
            vec![maps.irradiance().handle(), maps.prefiltered().handle(), maps.brdf().handle()]
        );
        assert!(matches!(
            backend.gpu_descriptor(maps.environment_srv()),
            Some(DescriptorView::ShaderResource { desc, .. }) if desc.dimension == ViewDimension::TextureCube
        ));
    }
}
