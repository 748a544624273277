//! Mesh resource
//!
//! A mesh owns combined vertex/index data split into sections, a model
//! transform and one constant slot in the upload arena. It moves through
//! [`MeshState`] in order: loaded from data, constants bound, uploaded to the
//! GPU, staging released.

use super::heap::{DescriptorAllocator, UploadAllocation};
use super::mesh_loader::{self, MeshData, MeshSection};
use super::state::TrackedBuffer;
use crate::backend::traits::*;
use crate::backend::types::*;
use crate::error::{EngineError, EngineResult};
use crate::pipeline::constants::ModelConstants;
use glam::{Mat4, Vec2, Vec3};
use std::path::Path;

/// Lifecycle of a [`Mesh`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MeshState {
    Empty,
    Loaded,
    ConstantsBound,
    Uploaded,
    StagingFreed,
}

impl MeshState {
    fn name(self) -> &'static str {
        match self {
            MeshState::Empty => "Empty",
            MeshState::Loaded => "Loaded",
            MeshState::ConstantsBound => "ConstantsBound",
            MeshState::Uploaded => "Uploaded",
            MeshState::StagingFreed => "StagingFreed",
        }
    }
}

struct GpuBuffers {
    vertex: TrackedBuffer,
    index: TrackedBuffer,
    staging: Option<(TrackedBuffer, TrackedBuffer)>,
}

/// A drawable mesh
pub struct Mesh {
    name: String,
    state: MeshState,
    data: MeshData,
    vertex_count: u32,
    index_count: u32,

    scale: Vec3,
    rotation: Mat4,
    translation: Vec3,

    constants: Option<UploadAllocation>,
    buffers: Option<GpuBuffers>,
}

impl Mesh {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: MeshState::Empty,
            data: MeshData::default(),
            vertex_count: 0,
            index_count: 0,
            scale: Vec3::ONE,
            rotation: Mat4::IDENTITY,
            translation: Vec3::ZERO,
            constants: None,
            buffers: None,
        }
    }

    fn expect_state(&self, operation: &'static str, allowed: &[MeshState], expected: &'static str) -> EngineResult<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(EngineError::InvalidState {
                object: format!("mesh '{}'", self.name),
                operation,
                expected,
                actual: self.state.name(),
            })
        }
    }

    /// Add one section from literal arrays
    pub fn load(&mut self, vertices: &[Vertex], indices: &[u32]) -> EngineResult<()> {
        self.expect_state("load", &[MeshState::Empty, MeshState::Loaded], "Empty or Loaded")?;
        let name = format!("{}#{}", self.name, self.data.sections.len());
        self.data.push_section(&name, vertices, indices);
        self.state = MeshState::Loaded;
        Ok(())
    }

    /// Add the sections of an `.obj`, `.gltf` or `.glb` file
    pub fn load_file(&mut self, path: impl AsRef<Path>) -> EngineResult<()> {
        self.expect_state("load_file", &[MeshState::Empty, MeshState::Loaded], "Empty or Loaded")?;
        let loaded = mesh_loader::load_mesh_file(path.as_ref())?;
        self.data.append(loaded);
        self.state = MeshState::Loaded;
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> MeshState {
        self.state
    }

    pub fn vertices(&self) -> &[Vertex] {
        &self.data.vertices
    }

    pub fn indices(&self) -> &[u32] {
        &self.data.indices
    }

    pub fn sections(&self) -> &[MeshSection] {
        &self.data.sections
    }

    fn triangles(&self) -> Vec<[usize; 3]> {
        self.data
            .sections
            .iter()
            .flat_map(|section| {
                let first = section.start_index as usize;
                let indices = &self.data.indices[first..first + section.index_count as usize];
                let base = section.base_vertex as usize;
                indices
                    .chunks_exact(3)
                    .map(move |t| [base + t[0] as usize, base + t[1] as usize, base + t[2] as usize])
            })
            .collect()
    }

    /// Replace vertex normals with the cross product of each triangle's edges
    pub fn generate_normals(&mut self) {
        for [a, b, c] in self.triangles() {
            let v0 = Vec3::from(self.data.vertices[a].position);
            let v1 = Vec3::from(self.data.vertices[b].position);
            let v2 = Vec3::from(self.data.vertices[c].position);
            let normal = (v1 - v0).cross(v2 - v0).to_array();
            for i in [a, b, c] {
                self.data.vertices[i].normal = normal;
            }
        }
    }

    /// Derive tangents and bitangents from each triangle's UV gradients
    pub fn generate_tangents(&mut self) {
        for [a, b, c] in self.triangles() {
            let vertex = |i: usize| {
                let v = &self.data.vertices[i];
                (Vec3::from(v.position), Vec2::from(v.uv))
            };
            let (v0, uv0) = vertex(a);
            let (v1, uv1) = vertex(b);
            let (v2, uv2) = vertex(c);

            let e0 = v1 - v0;
            let e1 = v2 - v0;
            let duv0 = uv1 - uv0;
            let duv1 = uv2 - uv0;

            let determinant = duv0.x * duv1.y - duv1.x * duv0.y;
            if determinant == 0.0 {
                continue;
            }
            let f = 1.0 / determinant;
            let tangent = (f * (duv1.y * e0 - duv0.y * e1)).to_array();
            let bitangent = (f * (duv0.x * e1 - duv1.x * e0)).to_array();
            for i in [a, b, c] {
                self.data.vertices[i].tangent = tangent;
                self.data.vertices[i].bitangent = bitangent;
            }
        }
    }

    /// Bind a model constant slot and write the identity transform
    pub fn create_constants(
        &mut self,
        allocator: &mut DescriptorAllocator,
        backend: &mut dyn GraphicsBackend,
    ) -> EngineResult<()> {
        self.expect_state("create_constants", &[MeshState::Loaded], "Loaded")?;
        self.constants = Some(allocator.allocate_constants::<ModelConstants>(1));
        self.scale = Vec3::ONE;
        self.rotation = Mat4::IDENTITY;
        self.translation = Vec3::ZERO;
        self.state = MeshState::ConstantsBound;
        self.write_model_matrix(backend)
    }

    /// Model matrix: scale, then rotation, then translation
    pub fn model_matrix(&self) -> Mat4 {
        Mat4::from_translation(self.translation) * self.rotation * Mat4::from_scale(self.scale)
    }

    fn write_model_matrix(&self, backend: &mut dyn GraphicsBackend) -> EngineResult<()> {
        let constants = self.constants.ok_or_else(|| EngineError::InvalidState {
            object: format!("mesh '{}'", self.name),
            operation: "write_model_matrix",
            expected: "ConstantsBound",
            actual: self.state.name(),
        })?;
        constants.write(backend, 0, &ModelConstants { model: self.model_matrix() })?;
        Ok(())
    }

    fn expect_constants(&self, operation: &'static str) -> EngineResult<()> {
        self.expect_state(
            operation,
            &[MeshState::ConstantsBound, MeshState::Uploaded, MeshState::StagingFreed],
            "ConstantsBound or later",
        )
    }

    pub fn move_to(&mut self, backend: &mut dyn GraphicsBackend, position: Vec3) -> EngineResult<()> {
        self.expect_constants("move_to")?;
        self.translation = position;
        self.write_model_matrix(backend)
    }

    /// Compound a rotation onto the current one, about X, then Y, then Z (radians)
    pub fn rotate_by(&mut self, backend: &mut dyn GraphicsBackend, rotation: Vec3) -> EngineResult<()> {
        self.expect_constants("rotate_by")?;
        self.rotation = Mat4::from_rotation_z(rotation.z)
            * Mat4::from_rotation_y(rotation.y)
            * Mat4::from_rotation_x(rotation.x)
            * self.rotation;
        self.write_model_matrix(backend)
    }

    pub fn set_scale(&mut self, backend: &mut dyn GraphicsBackend, factor: f32) -> EngineResult<()> {
        self.expect_constants("set_scale")?;
        self.scale = Vec3::splat(factor);
        self.write_model_matrix(backend)
    }

    /// GPU address of the model constants
    pub fn constants_address(&self) -> Option<u64> {
        self.constants.map(|c| c.gpu_address)
    }

    /// Record the copy of vertex and index data into GPU buffers.
    ///
    /// The staging buffers stay alive until [`Mesh::release_upload_heaps`],
    /// which must wait until the recorded copy has executed.
    pub fn copy_to_upload_heap(&mut self, backend: &mut dyn GraphicsBackend) -> EngineResult<()> {
        self.expect_state("copy_to_upload_heap", &[MeshState::ConstantsBound], "ConstantsBound")?;

        let vertex_bytes: &[u8] = bytemuck::cast_slice(&self.data.vertices);
        let index_bytes: &[u8] = bytemuck::cast_slice(&self.data.indices);

        let vertex_staging = create_buffer(
            backend,
            format!("{} Vertex Staging", self.name),
            vertex_bytes.len() as u64,
            BufferUsage::MAP_WRITE | BufferUsage::COPY_SRC,
            ResourceState::GenericRead,
        )?;
        let index_staging = create_buffer(
            backend,
            format!("{} Index Staging", self.name),
            index_bytes.len() as u64,
            BufferUsage::MAP_WRITE | BufferUsage::COPY_SRC,
            ResourceState::GenericRead,
        )?;
        let mut vertex = create_buffer(
            backend,
            format!("{} Vertices", self.name),
            vertex_bytes.len() as u64,
            BufferUsage::VERTEX | BufferUsage::COPY_DST,
            ResourceState::CopyDest,
        )?;
        let mut index = create_buffer(
            backend,
            format!("{} Indices", self.name),
            index_bytes.len() as u64,
            BufferUsage::INDEX | BufferUsage::COPY_DST,
            ResourceState::CopyDest,
        )?;

        backend.write_buffer(vertex_staging.handle(), 0, vertex_bytes)?;
        backend.write_buffer(index_staging.handle(), 0, index_bytes)?;

        backend.copy_buffer(vertex.handle(), 0, vertex_staging.handle(), 0, vertex_bytes.len() as u64);
        vertex.transition_to(backend, ResourceState::VertexAndConstantBuffer);
        backend.copy_buffer(index.handle(), 0, index_staging.handle(), 0, index_bytes.len() as u64);
        index.transition_to(backend, ResourceState::IndexBuffer);

        self.vertex_count = self.data.vertices.len() as u32;
        self.index_count = self.data.indices.len() as u32;
        self.buffers = Some(GpuBuffers {
            vertex,
            index,
            staging: Some((vertex_staging, index_staging)),
        });
        self.state = MeshState::Uploaded;
        log::debug!(
            "Mesh '{}' upload recorded: {} vertices, {} indices, {} sections",
            self.name,
            self.vertex_count,
            self.index_count,
            self.data.sections.len()
        );
        Ok(())
    }

    /// Drop the CPU copy of vertices and indices. Sections are kept for drawing.
    pub fn release_cpu_data(&mut self) {
        self.data.vertices = Vec::new();
        self.data.indices = Vec::new();
    }

    /// Destroy the staging buffers once the upload has executed
    pub fn release_upload_heaps(&mut self, backend: &mut dyn GraphicsBackend) -> EngineResult<()> {
        self.expect_state("release_upload_heaps", &[MeshState::Uploaded], "Uploaded")?;
        if let Some((vertex, index)) = self.buffers.as_mut().and_then(|b| b.staging.take()) {
            vertex.destroy(backend);
            index.destroy(backend);
        }
        self.state = MeshState::StagingFreed;
        Ok(())
    }

    /// Bind the buffers and issue one indexed draw per section
    pub fn schedule_draw(&self, backend: &mut dyn GraphicsBackend) -> EngineResult<()> {
        self.expect_state(
            "schedule_draw",
            &[MeshState::Uploaded, MeshState::StagingFreed],
            "Uploaded or StagingFreed",
        )?;
        let Some(buffers) = &self.buffers else {
            return Ok(());
        };
        backend.set_vertex_buffer(
            buffers.vertex.handle(),
            std::mem::size_of::<Vertex>() as u32,
            buffers.vertex.size(),
        );
        backend.set_index_buffer(buffers.index.handle(), buffers.index.size());
        for section in &self.data.sections {
            backend.draw_indexed(section.index_count, section.start_index, section.base_vertex);
        }
        Ok(())
    }

    /// Destroy every GPU buffer of the mesh
    pub fn release_gpu_data(&mut self, backend: &mut dyn GraphicsBackend) {
        if let Some(buffers) = self.buffers.take() {
            buffers.vertex.destroy(backend);
            buffers.index.destroy(backend);
            if let Some((vertex, index)) = buffers.staging {
                vertex.destroy(backend);
                index.destroy(backend);
            }
        }
    }

    /// Create a mesh from one literal section
    pub fn from_arrays(name: &str, vertices: &[Vertex], indices: &[u32]) -> Self {
        let mut mesh = Mesh::new(name);
        let section = format!("{name}#0");
        mesh.data.push_section(&section, vertices, indices);
        mesh.state = MeshState::Loaded;
        mesh
    }

    /// One triangle covering the whole screen in clip space
    pub fn present_triangle() -> Self {
        let normal = [0.0, 0.0, 1.0];
        let vertices = [
            Vertex::new([-1.0, -3.0, 0.0], [0.0, 2.0], normal),
            Vertex::new([-1.0, 1.0, 0.0], [0.0, 0.0], normal),
            Vertex::new([3.0, 1.0, 0.0], [2.0, 0.0], normal),
        ];
        Self::from_arrays("present triangle", &vertices, &[0, 1, 2])
    }

    /// Cube spanning -1..1 with outward faces
    pub fn cube() -> Self {
        let vertices = cube_vertices(1.0);
        let indices = [
            2, 1, 0, 3, 2, 0, //
            4, 5, 6, 4, 6, 7, //
            8, 9, 10, 8, 10, 11, //
            14, 13, 12, 15, 14, 12, //
            18, 17, 16, 19, 18, 16, //
            20, 21, 22, 20, 22, 23,
        ];
        Self::from_arrays("cube", &vertices, &indices)
    }

    /// Cube spanning -1..1 seen from inside, for sky and cube map rendering
    pub fn inward_cube() -> Self {
        let vertices = cube_vertices(-1.0);
        let indices = [
            0, 1, 2, 0, 2, 3, //
            6, 5, 4, 7, 6, 4, //
            10, 9, 8, 11, 10, 8, //
            12, 13, 14, 12, 14, 15, //
            16, 17, 18, 16, 18, 19, //
            22, 21, 20, 23, 22, 20,
        ];
        Self::from_arrays("inward cube", &vertices, &indices)
    }

    /// Create a UV sphere of radius 0.5
    pub fn sphere(segments: u32, rings: u32) -> Self {
        let segment_angle = 2.0 * std::f32::consts::PI / segments as f32;
        let ring_angle = std::f32::consts::PI / rings as f32;

        let mut vertices = Vec::new();
        for ring in 0..=rings {
            let phi = ring as f32 * ring_angle;
            let y = phi.cos();
            let ring_radius = phi.sin();

            for segment in 0..=segments {
                let theta = segment as f32 * segment_angle;
                let x = ring_radius * theta.cos();
                let z = ring_radius * theta.sin();

                let normal = Vec3::new(x, y, z).normalize_or_zero();
                let uv = [segment as f32 / segments as f32, ring as f32 / rings as f32];
                vertices.push(Vertex::new([x * 0.5, y * 0.5, z * 0.5], uv, normal.to_array()));
            }
        }

        let mut indices = Vec::new();
        for ring in 0..rings {
            for segment in 0..segments {
                let current = ring * (segments + 1) + segment;
                let next = current + segments + 1;

                indices.extend_from_slice(&[current, next, current + 1, current + 1, next, next + 1]);
            }
        }

        let mut mesh = Self::from_arrays("sphere", &vertices, &indices);
        mesh.generate_tangents();
        mesh
    }
}

fn create_buffer(
    backend: &mut dyn GraphicsBackend,
    label: String,
    size: u64,
    usage: BufferUsage,
    initial_state: ResourceState,
) -> BackendResult<TrackedBuffer> {
    TrackedBuffer::create(
        backend,
        &BufferDescriptor {
            label: Some(label),
            size: size.max(4),
            usage,
            initial_state,
        },
    )
}

/// The 24 cube vertices, four per face. `facing` 1 points normals outward, -1 inward.
fn cube_vertices(facing: f32) -> Vec<Vertex> {
    let faces: [([[f32; 3]; 4], [f32; 3]); 6] = [
        ([[-1.0, -1.0, 1.0], [-1.0, 1.0, 1.0], [-1.0, 1.0, -1.0], [-1.0, -1.0, -1.0]], [-1.0, 0.0, 0.0]),
        ([[1.0, -1.0, 1.0], [1.0, 1.0, 1.0], [1.0, 1.0, -1.0], [1.0, -1.0, -1.0]], [1.0, 0.0, 0.0]),
        ([[-1.0, -1.0, 1.0], [1.0, -1.0, 1.0], [1.0, -1.0, -1.0], [-1.0, -1.0, -1.0]], [0.0, -1.0, 0.0]),
        ([[-1.0, 1.0, 1.0], [1.0, 1.0, 1.0], [1.0, 1.0, -1.0], [-1.0, 1.0, -1.0]], [0.0, 1.0, 0.0]),
        ([[-1.0, 1.0, -1.0], [1.0, 1.0, -1.0], [1.0, -1.0, -1.0], [-1.0, -1.0, -1.0]], [0.0, 0.0, -1.0]),
        ([[-1.0, 1.0, 1.0], [1.0, 1.0, 1.0], [1.0, -1.0, 1.0], [-1.0, -1.0, 1.0]], [0.0, 0.0, 1.0]),
    ];
    let uvs = [[0.0, 1.0], [1.0, 1.0], [1.0, 0.0], [0.0, 0.0]];

    faces
        .iter()
        .flat_map(|(positions, normal)| {
            let normal = (Vec3::from(*normal) * facing).to_array();
            positions
                .iter()
                .zip(uvs)
                .map(move |(&position, uv)| Vertex::new(position, uv, normal))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::RecordingBackend;
    use std::f32::consts::FRAC_PI_2;

    fn bound_mesh(backend: &mut RecordingBackend, allocator: &mut DescriptorAllocator) -> Mesh {
        let mut mesh = Mesh::cube();
        mesh.create_constants(allocator, backend).unwrap();
        mesh
    }

    fn written_model(backend: &RecordingBackend, mesh: &Mesh) -> Mat4 {
        let constants = mesh.constants.unwrap();
        let bytes = backend.read_buffer(constants.buffer, constants.offset, 64).unwrap();
        bytemuck::pod_read_unaligned::<Mat4>(bytes)
    }

    #[test]
    fn test_rotate_by_composes_x_then_y() {
        let mut backend = RecordingBackend::new(8, 8, 2);
        let mut allocator = DescriptorAllocator::new(&mut backend).unwrap();
        let mut mesh = bound_mesh(&mut backend, &mut allocator);

        mesh.rotate_by(&mut backend, Vec3::new(FRAC_PI_2, 0.0, 0.0)).unwrap();
        mesh.rotate_by(&mut backend, Vec3::new(0.0, FRAC_PI_2, 0.0)).unwrap();

        let model = written_model(&backend, &mesh);
        let expected = Mat4::from_rotation_y(FRAC_PI_2) * Mat4::from_rotation_x(FRAC_PI_2);
        for point in [Vec3::X, Vec3::Y, Vec3::Z, Vec3::new(1.0, 2.0, 3.0)] {
            assert!(model.transform_point3(point).abs_diff_eq(expected.transform_point3(point), 1e-5));
        }
        // +Y turns to +Z about X, then +Z turns to +X about Y
        assert!(model.transform_point3(Vec3::Y).abs_diff_eq(Vec3::X, 1e-5));
    }

    #[test]
    fn test_model_matrix_order() {
        let mut backend = RecordingBackend::new(8, 8, 2);
        let mut allocator = DescriptorAllocator::new(&mut backend).unwrap();
        let mut mesh = bound_mesh(&mut backend, &mut allocator);

        mesh.set_scale(&mut backend, 2.0).unwrap();
        mesh.rotate_by(&mut backend, Vec3::new(0.0, FRAC_PI_2, 0.0)).unwrap();
        mesh.move_to(&mut backend, Vec3::new(10.0, 0.0, 0.0)).unwrap();

        // (1,0,0) scaled to (2,0,0), rotated to (0,0,-2), moved to (10,0,-2)
        let point = written_model(&backend, &mesh).transform_point3(Vec3::X);
        assert!(point.abs_diff_eq(Vec3::new(10.0, 0.0, -2.0), 1e-5));
    }

    #[test]
    fn test_transform_before_constants_is_rejected() {
        let mut backend = RecordingBackend::new(8, 8, 2);
        let mut mesh = Mesh::cube();
        let err = mesh.move_to(&mut backend, Vec3::ONE).unwrap_err();
        assert!(matches!(err, EngineError::InvalidState { .. }));
    }

    #[test]
    fn test_upload_and_draw() {
        let mut backend = RecordingBackend::new(8, 8, 2);
        let mut allocator = DescriptorAllocator::new(&mut backend).unwrap();
        let mut mesh = bound_mesh(&mut backend, &mut allocator);

        backend.reset_command_list(0).unwrap();
        mesh.copy_to_upload_heap(&mut backend).unwrap();
        assert_eq!(mesh.state(), MeshState::Uploaded);
        assert_eq!(backend.barriers().len(), 2);
        mesh.release_cpu_data();
        mesh.release_upload_heaps(&mut backend).unwrap();
        assert_eq!(mesh.state(), MeshState::StagingFreed);

        mesh.schedule_draw(&mut backend).unwrap();
        // No graphics pipeline is bound, so only the barriers and buffers are meaningful here
        assert_eq!(backend.draw_count(), 1);
        assert!(backend
            .violations()
            .iter()
            .all(|v| v.contains("draw_indexed with None pipeline")));
    }

    #[test]
    fn test_draw_before_upload_is_rejected() {
        let mut backend = RecordingBackend::new(8, 8, 2);
        let mesh = Mesh::cube();
        assert!(mesh.schedule_draw(&mut backend).is_err());
    }

    #[test]
    fn test_builtin_meshes() {
        let cube = Mesh::cube();
        assert_eq!(cube.vertices().len(), 24);
        assert_eq!(cube.indices().len(), 36);

        let inward = Mesh::inward_cube();
        assert_eq!(inward.vertices()[0].normal, [1.0, 0.0, 0.0]);
        assert_eq!(inward.vertices()[0].position, cube.vertices()[0].position);

        let triangle = Mesh::present_triangle();
        assert_eq!(triangle.sections().len(), 1);
        assert_eq!(triangle.sections()[0].index_count, 3);
    }

    #[test]
    fn test_generate_normals() {
        let vertices = [
            Vertex::new([0.0, 0.0, 0.0], [0.0, 0.0], [0.0; 3]),
            Vertex::new([1.0, 0.0, 0.0], [1.0, 0.0], [0.0; 3]),
            Vertex::new([0.0, 1.0, 0.0], [0.0, 1.0], [0.0; 3]),
        ];
        let mut mesh = Mesh::from_arrays("tri", &vertices, &[0, 1, 2]);
        mesh.generate_normals();
        mesh.generate_tangents();
        assert_eq!(mesh.vertices()[2].normal, [0.0, 0.0, 1.0]);
        assert_eq!(mesh.vertices()[0].tangent, [1.0, 0.0, 0.0]);
        assert_eq!(mesh.vertices()[0].bitangent, [0.0, 1.0, 0.0]);
    }
}
