//! Descriptor and upload memory allocation
//!
//! Four descriptor heaps and one linear upload arena, all bump allocated.
//! Nothing is ever freed individually; everything goes away in [`DescriptorAllocator::release`].

use crate::backend::traits::*;
use crate::backend::types::*;
use crate::config;
use bytemuck::Pod;

/// Round `size` up to the upload arena alignment
pub const fn align_upload(size: u64) -> u64 {
    (size + config::UPLOAD_ALIGNMENT - 1) & !(config::UPLOAD_ALIGNMENT - 1)
}

/// Heaps addressable through [`DescriptorAllocator::allocate_descriptors`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuHeapKind {
    RenderTarget,
    DepthStencil,
    ShaderResource,
}

struct BumpHeap {
    handle: DescriptorHeapHandle,
    label: &'static str,
    capacity: u32,
    size: u32,
}

impl BumpHeap {
    fn create(
        backend: &mut dyn GraphicsBackend,
        label: &'static str,
        kind: DescriptorHeapKind,
        capacity: u32,
        shader_visible: bool,
    ) -> BackendResult<Self> {
        let handle = backend.create_descriptor_heap(&DescriptorHeapDescriptor {
            label: Some(label.to_string()),
            kind,
            capacity,
            shader_visible,
        })?;
        Ok(Self {
            handle,
            label,
            capacity,
            size: 0,
        })
    }

    fn allocate(&mut self, count: u32) -> u32 {
        assert!(
            self.size + count <= self.capacity,
            "{} heap exhausted: {} + {} > {}",
            self.label,
            self.size,
            count,
            self.capacity
        );
        let start = self.size;
        self.size += count;
        start
    }
}

/// A range of the upload arena.
///
/// Identified by its offset in the arena buffer rather than by a mapped pointer;
/// all writes go through the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadAllocation {
    pub buffer: BufferHandle,
    pub offset: u64,
    pub gpu_address: u64,
    pub size: u64,
}

impl UploadAllocation {
    /// Distance between consecutive `T` elements. Constant buffers are 256-byte aligned.
    pub const fn stride<T>() -> u64 {
        align_upload(std::mem::size_of::<T>() as u64)
    }

    /// Write element `index` of an array of `T`
    pub fn write<T: Pod>(&self, backend: &mut dyn GraphicsBackend, index: u64, value: &T) -> BackendResult<()> {
        let offset = index * Self::stride::<T>();
        assert!(
            offset + std::mem::size_of::<T>() as u64 <= self.size,
            "write of element {index} past the end of a {}-byte upload allocation",
            self.size
        );
        backend.write_buffer(self.buffer, self.offset + offset, bytemuck::bytes_of(value))
    }

    /// GPU address of element `index` of an array of `T`
    pub fn gpu_address_of<T>(&self, index: u64) -> u64 {
        self.gpu_address + index * Self::stride::<T>()
    }
}

/// Bump allocator for descriptors and constant memory
pub struct DescriptorAllocator {
    rtv: BumpHeap,
    dsv: BumpHeap,
    cpu_srv: BumpHeap,
    gpu_srv: BumpHeap,
    arena: BufferHandle,
    arena_address: u64,
    arena_capacity: u64,
    arena_size: u64,
}

impl DescriptorAllocator {
    /// Create the heaps and the upload arena with the capacities from [`config`]
    pub fn new(backend: &mut dyn GraphicsBackend) -> BackendResult<Self> {
        Self::with_capacities(
            backend,
            [
                config::RTV_HEAP_CAPACITY,
                config::DSV_HEAP_CAPACITY,
                config::CPU_SRV_HEAP_CAPACITY,
                config::GPU_SRV_HEAP_CAPACITY,
            ],
            config::UPLOAD_ARENA_SIZE,
        )
    }

    /// Create with explicit capacities: `[rtv, dsv, cpu srv/uav, gpu srv/uav]` and arena bytes
    pub fn with_capacities(
        backend: &mut dyn GraphicsBackend,
        heap_capacities: [u32; 4],
        arena_capacity: u64,
    ) -> BackendResult<Self> {
        let [rtv, dsv, cpu_srv, gpu_srv] = heap_capacities;
        let rtv = BumpHeap::create(backend, "RTV", DescriptorHeapKind::RenderTarget, rtv, false)?;
        let dsv = BumpHeap::create(backend, "DSV", DescriptorHeapKind::DepthStencil, dsv, false)?;
        let cpu_srv = BumpHeap::create(backend, "CPU SRV/UAV", DescriptorHeapKind::ShaderResource, cpu_srv, false)?;
        let gpu_srv = BumpHeap::create(backend, "GPU SRV/UAV", DescriptorHeapKind::ShaderResource, gpu_srv, true)?;

        let arena = backend.create_buffer(&BufferDescriptor {
            label: Some("Upload Arena".into()),
            size: arena_capacity,
            usage: BufferUsage::MAP_WRITE | BufferUsage::UNIFORM,
            initial_state: ResourceState::GenericRead,
        })?;
        let arena_address = backend.buffer_gpu_address(arena);

        log::debug!(
            "Descriptor allocator created: {} RTV, {} DSV, {} CPU SRV, {} GPU SRV, {} byte arena",
            rtv.capacity,
            dsv.capacity,
            cpu_srv.capacity,
            gpu_srv.capacity,
            arena_capacity
        );

        Ok(Self {
            rtv,
            dsv,
            cpu_srv,
            gpu_srv,
            arena,
            arena_address,
            arena_capacity,
            arena_size: 0,
        })
    }

    /// Reserve `count` contiguous descriptors in a CPU-only heap
    pub fn allocate_descriptors(&mut self, kind: CpuHeapKind, count: u32) -> CpuDescriptor {
        let heap = match kind {
            CpuHeapKind::RenderTarget => &mut self.rtv,
            CpuHeapKind::DepthStencil => &mut self.dsv,
            CpuHeapKind::ShaderResource => &mut self.cpu_srv,
        };
        CpuDescriptor {
            heap: heap.handle,
            index: heap.allocate(count),
        }
    }

    /// Reserve `count` contiguous descriptors in the shader-visible heap
    pub fn allocate_gpu_descriptors(&mut self, count: u32) -> (CpuDescriptor, GpuDescriptor) {
        let heap = self.gpu_srv.handle;
        let index = self.gpu_srv.allocate(count);
        (CpuDescriptor { heap, index }, GpuDescriptor { heap, index })
    }

    /// Copy `count` CPU descriptors into a fresh shader-visible range
    pub fn copy_descriptors_to_gpu_heap(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        count: u32,
        src: CpuDescriptor,
    ) -> BackendResult<GpuDescriptor> {
        let (cpu, gpu) = self.allocate_gpu_descriptors(count);
        backend.copy_descriptors(count, cpu, src)?;
        Ok(gpu)
    }

    /// Reserve `size` bytes of upload memory, rounded up to 256
    pub fn allocate_gpu_memory(&mut self, size: u64) -> UploadAllocation {
        let size = align_upload(size);
        assert!(
            self.arena_size + size <= self.arena_capacity,
            "upload arena exhausted: {} + {} > {}",
            self.arena_size,
            size,
            self.arena_capacity
        );
        let offset = self.arena_size;
        self.arena_size += size;
        UploadAllocation {
            buffer: self.arena,
            offset,
            gpu_address: self.arena_address + offset,
            size,
        }
    }

    /// Reserve room for `count` constant buffers of type `T`
    pub fn allocate_constants<T>(&mut self, count: u64) -> UploadAllocation {
        self.allocate_gpu_memory(UploadAllocation::stride::<T>() * count)
    }

    /// Bind the shader-visible heap on the current command list
    pub fn bind_descriptor_heaps(&self, backend: &mut dyn GraphicsBackend) {
        backend.set_descriptor_heap(self.gpu_srv.handle);
    }

    /// Bytes of upload memory handed out so far
    pub fn gpu_memory_used(&self) -> u64 {
        self.arena_size
    }

    /// Descriptors handed out so far from the shader-visible heap
    pub fn gpu_descriptors_used(&self) -> u32 {
        self.gpu_srv.size
    }

    /// Destroy the arena and all heaps
    pub fn release(self, backend: &mut dyn GraphicsBackend) {
        backend.destroy_buffer(self.arena);
        for heap in [self.rtv, self.dsv, self.cpu_srv, self.gpu_srv] {
            backend.destroy_descriptor_heap(heap.handle);
        }
        log::debug!("Descriptor allocator released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::RecordingBackend;
    use rstest::rstest;

    fn small_allocator(backend: &mut RecordingBackend) -> DescriptorAllocator {
        DescriptorAllocator::with_capacities(backend, [8, 8, 8, 8], 4096).unwrap()
    }

    #[rstest]
    #[case::one_byte(1, 256)]
    #[case::ten_bytes(10, 256)]
    #[case::exact(256, 256)]
    #[case::just_over(257, 512)]
    fn test_gpu_memory_alignment(#[case] size: u64, #[case] advance: u64) {
        let mut backend = RecordingBackend::new(8, 8, 2);
        let mut allocator = small_allocator(&mut backend);
        let first = allocator.allocate_gpu_memory(size);
        let second = allocator.allocate_gpu_memory(1);
        assert_eq!(first.offset, 0);
        assert_eq!(first.size, advance);
        assert_eq!(second.offset, advance);
        assert_eq!(second.gpu_address % 256, 0);
        assert_eq!(second.gpu_address - first.gpu_address, advance);
    }

    #[test]
    fn test_descriptor_ranges_are_disjoint() {
        let mut backend = RecordingBackend::new(8, 8, 2);
        let mut allocator = small_allocator(&mut backend);

        let a = allocator.allocate_descriptors(CpuHeapKind::ShaderResource, 3);
        let b = allocator.allocate_descriptors(CpuHeapKind::ShaderResource, 2);
        let rtv = allocator.allocate_descriptors(CpuHeapKind::RenderTarget, 2);
        assert_eq!(a.index, 0);
        assert_eq!(b.index, 3);
        assert_eq!(rtv.index, 0);
        assert_ne!(a.heap, rtv.heap);

        let (cpu, gpu) = allocator.allocate_gpu_descriptors(4);
        let (_, next) = allocator.allocate_gpu_descriptors(1);
        assert_eq!(cpu.index, gpu.index);
        assert_eq!(next.index, 4);
        assert_eq!(allocator.gpu_descriptors_used(), 5);
    }

    #[test]
    fn test_fill_heap_to_capacity() {
        let mut backend = RecordingBackend::new(8, 8, 2);
        let mut allocator = small_allocator(&mut backend);
        let range = allocator.allocate_descriptors(CpuHeapKind::DepthStencil, 8);
        assert_eq!(range.index, 0);
    }

    #[test]
    #[should_panic(expected = "DSV heap exhausted")]
    fn test_heap_overrun_is_fatal() {
        let mut backend = RecordingBackend::new(8, 8, 2);
        let mut allocator = small_allocator(&mut backend);
        allocator.allocate_descriptors(CpuHeapKind::DepthStencil, 8);
        allocator.allocate_descriptors(CpuHeapKind::DepthStencil, 1);
    }

    #[test]
    #[should_panic(expected = "upload arena exhausted")]
    fn test_arena_overrun_is_fatal() {
        let mut backend = RecordingBackend::new(8, 8, 2);
        let mut allocator = small_allocator(&mut backend);
        allocator.allocate_gpu_memory(4096);
        allocator.allocate_gpu_memory(1);
    }

    #[test]
    fn test_typed_write_uses_constant_stride() {
        let mut backend = RecordingBackend::new(8, 8, 2);
        let mut allocator = small_allocator(&mut backend);
        let constants = allocator.allocate_constants::<[f32; 4]>(2);
        assert_eq!(constants.size, 512);

        constants.write(&mut backend, 1, &[1.0f32, 2.0, 3.0, 4.0]).unwrap();
        let bytes = backend.read_buffer(constants.buffer, constants.offset + 256, 16).unwrap();
        let values: [f32; 4] = bytemuck::pod_read_unaligned(bytes);
        assert_eq!(values, [1.0, 2.0, 3.0, 4.0]);
        assert_eq!(constants.gpu_address_of::<[f32; 4]>(1), constants.gpu_address + 256);
    }

    #[test]
    fn test_copy_descriptors_to_gpu_heap() {
        let mut backend = RecordingBackend::new(8, 8, 2);
        let mut allocator = small_allocator(&mut backend);
        let texture = backend.create_texture(&TextureDescriptor::default()).unwrap();
        let srv = allocator.allocate_descriptors(CpuHeapKind::ShaderResource, 1);
        backend
            .create_shader_resource_view(texture, &ShaderResourceViewDesc::texture_2d(), srv)
            .unwrap();

        let gpu = allocator.copy_descriptors_to_gpu_heap(&mut backend, 1, srv).unwrap();
        assert_eq!(backend.gpu_descriptor(gpu).map(|v| v.texture()), Some(texture));
    }
}
