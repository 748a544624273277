//! Main engine orchestrator
//!
//! Owns every GPU object of the demo scene and records one frame per
//! [`Engine::render`]: forward PBR into a multisampled HDR target, resolve,
//! bloom, then tone mapping onto the swap chain. Each frame waits for the GPU
//! before returning, so a single set of per-frame resources is enough.

use crate::backend::traits::*;
use crate::backend::types::*;
use crate::config;
use crate::error::{EngineError, EngineResult};
use crate::pipeline::constants::{CameraConstants, PixelShaderConstants};
use crate::pipeline::ibl::IblMaps;
use crate::pipeline::mipmaps::MipGenerator;
use crate::pipeline::postprocess::{BloomPass, TonemappingPass};
use crate::pipeline::{PassId, PipelineRegistry};
use crate::resources::{CpuHeapKind, DescriptorAllocator, Mesh, TextureGroup, TrackedTexture, UploadAllocation};
use crate::scene::{Camera, CameraController, FreeFlyController, InputState};
use crate::EngineConfig;
use glam::Vec3;
use std::path::Path;

/// Assets loaded at startup, relative to [`EngineConfig::asset_root`]
#[derive(Debug, Clone)]
pub struct SceneAssets {
    /// Equirectangular HDR panorama
    pub panorama: String,
    pub sphere_mesh: String,
    /// Material directories; sphere `i` uses material `i % materials.len()`
    pub materials: Vec<String>,
    pub sphere_count: usize,
}

impl Default for SceneAssets {
    fn default() -> Self {
        Self {
            panorama: config::HDRI_PATH.to_string(),
            sphere_mesh: config::SPHERE_MESH_PATH.to_string(),
            materials: config::MATERIALS.iter().map(|m| m.to_string()).collect(),
            sphere_count: config::SPHERE_COUNT,
        }
    }
}

/// Render targets of the scene pass, at supersampled resolution
struct FrameTargets {
    width: u32,
    height: u32,
    msaa: TrackedTexture,
    msaa_rtv: CpuDescriptor,
    depth: TrackedTexture,
    dsv: CpuDescriptor,
    /// Single-sampled resolve of `msaa`, read by bloom and tone mapping
    hdr: TrackedTexture,
    hdr_srv: GpuDescriptor,
}

impl FrameTargets {
    fn new(
        backend: &mut dyn GraphicsBackend,
        allocator: &mut DescriptorAllocator,
        width: u32,
        height: u32,
        samples: u32,
    ) -> EngineResult<Self> {
        let msaa = TrackedTexture::create(
            backend,
            TextureDescriptor {
                label: Some("MSAA Render Target".into()),
                width,
                height,
                sample_count: samples,
                format: config::HDR_FORMAT,
                usage: TextureUsage::RENDER_ATTACHMENT | TextureUsage::COPY_SRC,
                initial_state: ResourceState::RenderTarget,
                ..Default::default()
            },
        )?;
        let msaa_rtv = allocator.allocate_descriptors(CpuHeapKind::RenderTarget, 1);
        backend.create_render_target_view(msaa.handle(), &RenderTargetViewDesc::default(), msaa_rtv)?;

        let depth = TrackedTexture::create(
            backend,
            TextureDescriptor {
                label: Some("Depth Stencil Buffer".into()),
                width,
                height,
                sample_count: samples,
                format: config::DEPTH_FORMAT,
                usage: TextureUsage::RENDER_ATTACHMENT,
                initial_state: ResourceState::DepthWrite,
                ..Default::default()
            },
        )?;
        let dsv = allocator.allocate_descriptors(CpuHeapKind::DepthStencil, 1);
        backend.create_depth_stencil_view(depth.handle(), dsv)?;

        let hdr = TrackedTexture::create(
            backend,
            TextureDescriptor {
                label: Some("HDR Resolve Target".into()),
                width,
                height,
                format: config::HDR_FORMAT,
                usage: TextureUsage::TEXTURE_BINDING | TextureUsage::COPY_DST,
                initial_state: ResourceState::ResolveDest,
                ..Default::default()
            },
        )?;
        let cpu_srv = allocator.allocate_descriptors(CpuHeapKind::ShaderResource, 1);
        backend.create_shader_resource_view(hdr.handle(), &ShaderResourceViewDesc::texture_2d(), cpu_srv)?;
        let hdr_srv = allocator.copy_descriptors_to_gpu_heap(backend, 1, cpu_srv)?;

        Ok(Self {
            width,
            height,
            msaa,
            msaa_rtv,
            depth,
            dsv,
            hdr,
            hdr_srv,
        })
    }

    fn destroy(self, backend: &mut dyn GraphicsBackend) {
        for texture in [self.msaa, self.depth, self.hdr] {
            texture.destroy(backend);
        }
    }
}

fn not_uploaded(object: String, operation: &'static str) -> EngineError {
    EngineError::InvalidState {
        object,
        operation,
        expected: "uploaded",
        actual: "not uploaded",
    }
}

/// The main graphics engine
pub struct Engine<B: GraphicsBackend> {
    backend: B,
    width: u32,
    height: u32,

    allocator: DescriptorAllocator,
    pipelines: PipelineRegistry,
    mips: MipGenerator,

    camera: Camera,
    controller: FreeFlyController,
    camera_constants: UploadAllocation,
    pixel_constants: UploadAllocation,
    elapsed: f32,

    meshes: Vec<Mesh>,
    materials: Vec<TextureGroup>,
    panorama: TextureGroup,
    present_triangle: Mesh,
    inward_cube: Mesh,
    ibl: IblMaps,

    targets: FrameTargets,
    back_buffers: Vec<TrackedTexture>,
    back_buffer_rtvs: CpuDescriptor,
    bloom: BloomPass,
    tonemapping: TonemappingPass,

    fence_value: u64,
    frame_index: u32,
}

impl<B: GraphicsBackend> Engine<B> {
    /// Create pipelines, load and upload every asset and bake the IBL maps.
    ///
    /// All startup uploads go through one command list that is executed and
    /// waited on before the staging buffers are released.
    pub fn new(mut backend: B, settings: &EngineConfig, assets: &SceneAssets) -> EngineResult<Self> {
        if assets.materials.is_empty() {
            return Err(EngineError::InvalidState {
                object: "scene".into(),
                operation: "Engine::new",
                expected: "at least one material",
                actual: "no materials",
            });
        }

        let (width, height) = backend.surface_size();
        let samples = backend.supported_sample_count(config::MSAA_COUNT);
        if samples != config::MSAA_COUNT {
            log::warn!("{}x MSAA unsupported, using {samples}x", config::MSAA_COUNT);
        }

        let mut pipelines = PipelineRegistry::new(&settings.shader_root);
        pipelines.register_all(&mut backend, samples)?;
        let mut allocator = DescriptorAllocator::new(&mut backend)?;
        let mut mips = MipGenerator::new(&pipelines)?;

        let frame_index = backend.current_back_buffer_index()?;
        backend.reset_command_list(frame_index as usize % config::FRAME_COUNT)?;

        let mut present_triangle = Mesh::present_triangle();
        let mut inward_cube = Mesh::inward_cube();
        for mesh in [&mut present_triangle, &mut inward_cube] {
            mesh.create_constants(&mut allocator, &mut backend)?;
            mesh.copy_to_upload_heap(&mut backend)?;
            mesh.release_cpu_data();
        }

        let root = settings.asset_root.as_path();
        let meshes = load_spheres(&mut backend, &mut allocator, &root.join(&assets.sphere_mesh), assets.sphere_count)?;
        let materials = load_materials(&mut backend, &mut allocator, &mut mips, root, &assets.materials)?;

        let mut panorama = TextureGroup::new("Panorama");
        panorama.add_texture(root.join(&assets.panorama));
        panorama.load_textures()?;
        panorama.copy_to_upload_heap(&mut backend, &mut allocator)?;
        panorama.release_cpu_data();

        let ibl = IblMaps::bake(&mut backend, &mut allocator, &pipelines, &mut mips, &panorama, &inward_cube)?;

        let targets = FrameTargets::new(
            &mut backend,
            &mut allocator,
            width * config::SSAA_MULTIPLIER,
            height * config::SSAA_MULTIPLIER,
            samples,
        )?;

        let back_buffer_count = backend.back_buffer_count();
        let back_buffer_rtvs = allocator.allocate_descriptors(CpuHeapKind::RenderTarget, back_buffer_count);
        let mut back_buffers = Vec::with_capacity(back_buffer_count as usize);
        for index in 0..back_buffer_count {
            let handle = backend.back_buffer(index);
            backend.create_render_target_view(handle, &RenderTargetViewDesc::default(), back_buffer_rtvs.offset(index))?;
            back_buffers.push(TrackedTexture::wrap(
                handle,
                TextureDescriptor {
                    label: Some(format!("Back Buffer {index}")),
                    width,
                    height,
                    format: config::BACK_BUFFER_FORMAT,
                    usage: TextureUsage::RENDER_ATTACHMENT,
                    initial_state: ResourceState::Present,
                    ..Default::default()
                },
            ));
        }

        let bloom = BloomPass::new(&mut backend, &mut allocator, targets.width, targets.height)?;
        bloom.prepare(&mut backend, &mut allocator, &mut mips)?;
        let tonemapping = TonemappingPass::new(&mut backend, &mut allocator, &targets.hdr, bloom.output())?;

        let mut camera = Camera::default();
        camera.set_aspect(width as f32, height as f32);
        let camera_constants = allocator.allocate_constants::<CameraConstants>(1);
        let pixel_constants = allocator.allocate_constants::<PixelShaderConstants>(1);

        let mut engine = Self {
            backend,
            width,
            height,
            allocator,
            pipelines,
            mips,
            camera,
            controller: FreeFlyController::new(),
            camera_constants,
            pixel_constants,
            elapsed: 0.0,
            meshes,
            materials,
            panorama,
            present_triangle,
            inward_cube,
            ibl,
            targets,
            back_buffers,
            back_buffer_rtvs,
            bloom,
            tonemapping,
            fence_value: 0,
            frame_index,
        };
        engine.write_camera_constants()?;

        engine.backend.close_command_list()?;
        engine.backend.execute_command_list()?;
        engine.wait_for_gpu()?;
        engine.release_upload_heaps()?;

        log::info!(
            "Engine initialized: {}x{} ({}x{} supersampled, {samples}x MSAA), {} meshes, {} materials",
            width,
            height,
            engine.targets.width,
            engine.targets.height,
            engine.meshes.len(),
            engine.materials.len()
        );
        Ok(engine)
    }

    fn release_upload_heaps(&mut self) -> EngineResult<()> {
        for mesh in self
            .meshes
            .iter_mut()
            .chain([&mut self.present_triangle, &mut self.inward_cube])
        {
            mesh.release_upload_heaps(&mut self.backend)?;
        }
        for group in self.materials.iter_mut().chain([&mut self.panorama]) {
            group.release_upload_heaps(&mut self.backend);
        }
        Ok(())
    }

    fn write_camera_constants(&mut self) -> EngineResult<()> {
        self.camera_constants
            .write(&mut self.backend, 0, &self.camera.constants())?;
        self.pixel_constants.write(
            &mut self.backend,
            0,
            &self.camera.pixel_constants(self.tonemapping.mode as u32),
        )?;
        Ok(())
    }

    /// Signal the next fence value and block until the GPU reaches it
    fn wait_for_gpu(&mut self) -> EngineResult<()> {
        self.fence_value += 1;
        self.backend.signal_fence(self.fence_value)?;
        if self.backend.completed_fence_value()? < self.fence_value {
            self.backend.wait_for_fence(self.fence_value)?;
        }
        Ok(())
    }

    /// Advance the clock by `dt` seconds, move the camera and spin the meshes
    pub fn update(&mut self, dt: f32, input: &InputState) -> EngineResult<()> {
        self.elapsed += dt;
        self.controller.update(&mut self.camera, input, dt);
        self.write_camera_constants()?;

        let rotation = Vec3::new(0.0, config::MESH_ROTATION_RATE * dt, 0.0);
        for mesh in &mut self.meshes {
            mesh.rotate_by(&mut self.backend, rotation)?;
        }
        Ok(())
    }

    /// Record, submit and present one frame, then wait for it to finish
    pub fn render(&mut self) -> EngineResult<()> {
        self.backend
            .reset_command_list(self.frame_index as usize % config::FRAME_COUNT)?;
        self.record_frame()?;
        self.backend.close_command_list()?;
        self.backend.execute_command_list()?;
        self.backend.present()?;
        self.wait_for_gpu()?;
        self.frame_index = self.backend.current_back_buffer_index()?;
        Ok(())
    }

    fn record_frame(&mut self) -> EngineResult<()> {
        let backend: &mut dyn GraphicsBackend = &mut self.backend;
        let targets = &mut self.targets;

        backend.set_viewport(Viewport::with_size(targets.width, targets.height));
        backend.set_scissor_rect(ScissorRect::with_size(targets.width, targets.height));
        backend.set_render_targets(&[targets.msaa_rtv], Some(targets.dsv));
        backend.clear_render_target(targets.msaa_rtv, config::CLEAR_COLOR);
        backend.clear_depth(targets.dsv, config::CLEAR_DEPTH);
        self.allocator.bind_descriptor_heaps(backend);

        // Environment background
        self.pipelines.bind(backend, PassId::SampleEnvMap)?;
        backend.set_root_constant_buffer(0, self.camera_constants.gpu_address);
        backend.set_root_descriptor_table(1, self.ibl.environment_srv());
        self.inward_cube.schedule_draw(backend)?;

        // Scene
        self.pipelines.bind(backend, PassId::Render)?;
        backend.set_root_constant_buffer(0, self.camera_constants.gpu_address);
        backend.set_root_constant_buffer(2, self.pixel_constants.gpu_address);
        backend.set_root_descriptor_table(3, self.ibl.gpu_handle());
        for (i, mesh) in self.meshes.iter().enumerate() {
            let group = &self.materials[i % self.materials.len()];
            let model = mesh
                .constants_address()
                .ok_or_else(|| not_uploaded(format!("mesh '{}'", mesh.name()), "render"))?;
            let textures = group
                .gpu_handle()
                .ok_or_else(|| not_uploaded(format!("texture group '{}'", group.name()), "render"))?;
            backend.set_root_constant_buffer(1, model);
            backend.set_root_descriptor_table(4, textures);
            mesh.schedule_draw(backend)?;
        }

        // Resolve
        targets.msaa.transition_to(backend, ResourceState::ResolveSource);
        backend.resolve_subresource(targets.hdr.handle(), targets.msaa.handle(), config::HDR_FORMAT);

        // Bloom
        targets.hdr.transition_to(backend, ResourceState::NonPixelShaderResource);
        self.bloom
            .record(backend, &mut self.allocator, &self.pipelines, &mut self.mips, targets.hdr_srv)?;

        // Tone map onto the back buffer
        targets.hdr.transition_to(backend, ResourceState::PixelShaderResource);
        let index = self.frame_index as usize % self.back_buffers.len();
        let back_buffer = &mut self.back_buffers[index];
        back_buffer.transition_to(backend, ResourceState::RenderTarget);
        self.tonemapping.record(
            backend,
            &self.pipelines,
            self.back_buffer_rtvs.offset(index as u32),
            self.width,
            self.height,
            &self.present_triangle,
        )?;

        // Back to frame start states
        targets.msaa.transition_to(backend, ResourceState::RenderTarget);
        targets.hdr.transition_to(backend, ResourceState::ResolveDest);
        self.bloom.restore_frame_state(backend);
        back_buffer.transition_to(backend, ResourceState::Present);
        Ok(())
    }

    /// Wait for the GPU, then destroy every resource and hand the backend back
    pub fn destroy(mut self) -> EngineResult<B> {
        self.wait_for_gpu()?;

        let Self {
            mut backend,
            allocator,
            mut mips,
            meshes,
            materials,
            panorama,
            present_triangle,
            inward_cube,
            ibl,
            targets,
            bloom,
            ..
        } = self;

        for mut mesh in meshes.into_iter().chain([present_triangle, inward_cube]) {
            mesh.release_gpu_data(&mut backend);
        }
        for mut group in materials.into_iter().chain([panorama]) {
            group.release_gpu_data(&mut backend);
        }
        ibl.release(&mut backend);
        bloom.release(&mut backend);
        mips.release(&mut backend);
        targets.destroy(&mut backend);
        allocator.release(&mut backend);

        log::info!("Engine destroyed");
        Ok(backend)
    }

    pub fn camera(&self) -> &Camera {
        &self.camera
    }

    pub fn camera_mut(&mut self) -> &mut Camera {
        &mut self.camera
    }

    pub fn meshes(&self) -> &[Mesh] {
        &self.meshes
    }

    pub fn materials(&self) -> &[TextureGroup] {
        &self.materials
    }

    pub fn bloom_mut(&mut self) -> &mut BloomPass {
        &mut self.bloom
    }

    pub fn tonemapping_mut(&mut self) -> &mut TonemappingPass {
        &mut self.tonemapping
    }

    /// Seconds accumulated by [`Engine::update`]
    pub fn elapsed(&self) -> f32 {
        self.elapsed
    }

    /// Get current dimensions
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Back buffer the next frame renders into
    pub fn frame_index(&self) -> u32 {
        self.frame_index
    }

    pub fn fence_value(&self) -> u64 {
        self.fence_value
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }
}

/// Load `count` copies of the sphere mesh, lined up along X
fn load_spheres(
    backend: &mut dyn GraphicsBackend,
    allocator: &mut DescriptorAllocator,
    path: &Path,
    count: usize,
) -> EngineResult<Vec<Mesh>> {
    let mut meshes = Vec::with_capacity(count);
    for i in 0..count {
        let mut sphere = Mesh::new(&format!("Sphere {i}"));
        sphere.load_file(path)?;
        sphere.generate_tangents();
        sphere.create_constants(allocator, backend)?;
        sphere.move_to(backend, Vec3::new(-(count as f32) / 2.0 + i as f32, 0.0, 0.0))?;
        sphere.copy_to_upload_heap(backend)?;
        sphere.release_cpu_data();
        meshes.push(sphere);
    }
    Ok(meshes)
}

/// Load every material's texture set and build its mip chains
fn load_materials(
    backend: &mut dyn GraphicsBackend,
    allocator: &mut DescriptorAllocator,
    mips: &mut MipGenerator,
    root: &Path,
    names: &[String],
) -> EngineResult<Vec<TextureGroup>> {
    let root = root.to_string_lossy();
    let mut groups = Vec::with_capacity(names.len());
    for name in names {
        let mut group = TextureGroup::new(name);
        for (suffix, ext) in config::MATERIAL_SUFFIXES {
            group.add_texture(config::material_texture_path(&root, name, suffix, ext));
        }
        group.load_textures()?;
        group.copy_to_upload_heap(backend, allocator)?;
        group.generate_mips(backend, allocator, mips)?;
        group.release_cpu_data();
        groups.push(group);
    }
    Ok(groups)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::recording::Command;
    use crate::backend::RecordingBackend;
    use crate::test_support;
    use std::path::PathBuf;

    const OCTAHEDRON: &str = "\
o Sphere
v 0 0.5 0
v 0.5 0 0
v 0 0 0.5
v -0.5 0 0
v 0 0 -0.5
v 0 -0.5 0
vt 0.5 1
vt 0 0.5
vt 0.25 0.5
vt 0.5 0.5
vt 0.75 0.5
vt 0.5 0
vn 0 1 0
vn 1 0 0
vn 0 0 1
vn -1 0 0
vn 0 0 -1
vn 0 -1 0
f 1/1/1 3/3/3 2/2/2
f 1/1/1 4/4/4 3/3/3
f 1/1/1 5/5/5 4/4/4
f 1/1/1 2/2/2 5/5/5
f 6/6/6 2/2/2 3/3/3
f 6/6/6 3/3/3 4/4/4
f 6/6/6 4/4/4 5/5/5
f 6/6/6 5/5/5 2/2/2
";

    fn write_exr(path: &Path, width: usize, height: usize, value: f32) {
        exr::prelude::write_rgba_file(path, width, height, |_, _| (value, value, value, 1.0f32)).unwrap();
    }

    /// Asset tree with one panorama, `materials` texture sets and the sphere mesh
    fn asset_directory(materials: &[&str]) -> PathBuf {
        let root = test_support::temp_dir("assets");
        let hdris = root.join("hdris");
        std::fs::create_dir_all(&hdris).unwrap();
        write_exr(&hdris.join("studio.exr"), 8, 4, 4.0);

        std::fs::write(root.join("sphere.obj"), OCTAHEDRON).unwrap();

        for material in materials {
            let textures = root.join(material).join("textures");
            std::fs::create_dir_all(&textures).unwrap();
            image::RgbImage::from_pixel(4, 4, image::Rgb([200, 120, 40]))
                .save(textures.join(format!("{material}_diff_1k.jpg")))
                .unwrap();
            write_exr(&textures.join(format!("{material}_nor_dx_1k.exr")), 4, 4, 0.5);
            write_exr(&textures.join(format!("{material}_arm_1k.exr")), 4, 4, 1.0);
        }
        root
    }

    fn engine(materials: &[&str], spheres: usize) -> Engine<RecordingBackend> {
        let settings = EngineConfig {
            asset_root: asset_directory(materials),
            shader_root: test_support::shader_directory(),
            ..Default::default()
        };
        let assets = SceneAssets {
            panorama: "hdris/studio.exr".into(),
            sphere_mesh: "sphere.obj".into(),
            materials: materials.iter().map(|m| m.to_string()).collect(),
            sphere_count: spheres,
        };
        Engine::new(RecordingBackend::new(32, 24, config::FRAME_COUNT as u32), &settings, &assets).unwrap()
    }

    #[test]
    fn test_init_uploads_and_releases_staging() {
        let engine = engine(&["rock", "brick"], 3);
        let backend = engine.backend();
        assert!(backend.violations().is_empty(), "{:?}", backend.violations());
        assert_eq!(engine.fence_value(), 1);
        assert_eq!(engine.meshes().len(), 3);
        assert!(engine
            .meshes()
            .iter()
            .all(|m| m.state() == crate::resources::MeshState::StagingFreed));
        assert!(engine.materials().iter().all(|g| g.len() == 3));
        // Only the upload arena survives the startup upload
        assert_eq!(backend.buffer_count(), 1 + 2 * (3 + 2));
    }

    #[test]
    fn test_spheres_line_up_along_x() {
        let engine = engine(&["rock"], 5);
        let xs: Vec<f32> = engine
            .meshes()
            .iter()
            .map(|m| m.model_matrix().w_axis.x)
            .collect();
        assert_eq!(xs, vec![-2.5, -1.5, -0.5, 0.5, 1.5]);
    }

    #[test]
    fn test_frame_restores_every_state() {
        let mut engine = engine(&["coast", "cliff", "brick", "tiles"], 5);
        let start = engine.camera().position;
        let states = engine.backend().texture_state_snapshot();
        let textures = engine.backend().texture_count();

        engine.update(1.0 / 60.0, &InputState::new()).unwrap();
        engine.backend_mut().clear_commands();
        engine.render().unwrap();

        let backend = engine.backend();
        assert!(backend.violations().is_empty(), "{:?}", backend.violations());
        assert_eq!(engine.camera().position, start);
        assert_eq!(backend.presented_frames(), 1);
        assert_eq!(backend.texture_count(), textures);
        assert_eq!(backend.texture_state_snapshot(), states);
        assert_eq!(engine.fence_value(), 2);
        assert_eq!(engine.frame_index(), 1);
    }

    #[test]
    fn test_frame_draws_background_then_spheres() {
        let mut engine = engine(&["coast", "cliff"], 3);
        engine.backend_mut().clear_commands();
        engine.render().unwrap();

        let backend = engine.backend();
        // Inward cube, 3 spheres, present triangle
        assert_eq!(backend.draw_count(), 5);
        let tables: Vec<GpuDescriptor> = backend
            .commands()
            .iter()
            .filter_map(|c| match c {
                Command::SetRootDescriptorTable { slot: 4, table } => Some(*table),
                _ => None,
            })
            .collect();
        let materials = engine.materials();
        let expected: Vec<GpuDescriptor> = [0, 1, 0]
            .iter()
            .map(|&i| materials[i].gpu_handle().unwrap())
            .collect();
        assert_eq!(tables, expected);
        assert!(matches!(backend.commands().last(), Some(Command::Signal(2))));
    }

    #[test]
    fn test_frames_alternate_back_buffers() {
        let mut engine = engine(&["rock"], 1);
        for _ in 0..3 {
            engine.update(0.5, &InputState::new()).unwrap();
            engine.render().unwrap();
        }
        assert_eq!(engine.frame_index(), 1);
        assert_eq!(engine.backend().presented_frames(), 3);
        assert!(engine.backend().violations().is_empty(), "{:?}", engine.backend().violations());
        assert!((engine.elapsed() - 1.5).abs() < 1e-6);
    }

    #[test]
    fn test_missing_asset_fails() {
        let settings = EngineConfig {
            asset_root: test_support::temp_dir("empty-assets"),
            shader_root: test_support::shader_directory(),
            ..Default::default()
        };
        let result = Engine::new(RecordingBackend::new(8, 8, 2), &settings, &SceneAssets::default());
        assert!(result.is_err());
    }

    #[test]
    fn test_destroy_releases_everything() {
        let engine = engine(&["rock"], 2);
        let backend = engine.destroy().unwrap();
        // Only the swap chain remains
        assert_eq!(backend.texture_count(), config::FRAME_COUNT);
        assert_eq!(backend.buffer_count(), 0);
    }
}
