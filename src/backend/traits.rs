//! Core backend abstraction traits
//!
//! The renderer talks to the GPU through [`GraphicsBackend`], which models one
//! device with one direct queue and a single command list that is reset,
//! recorded, closed and executed once per frame. Resource states are never
//! tracked here; callers declare every transition with a barrier.

use crate::backend::types::*;
use thiserror::Error;

/// Backend error type
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Failed to initialize backend: {0}")]
    InitializationFailed(String),
    #[error("Failed to create surface: {0}")]
    SurfaceCreationFailed(String),
    #[error("Failed to create device: {0}")]
    DeviceCreationFailed(String),
    #[error("Failed to create swapchain: {0}")]
    SwapchainCreationFailed(String),
    #[error("Failed to acquire next image: {0}")]
    AcquireImageFailed(String),
    #[error("Failed to present: {0}")]
    PresentFailed(String),
    #[error("Failed to create buffer: {0}")]
    BufferCreationFailed(String),
    #[error("Failed to create texture: {0}")]
    TextureCreationFailed(String),
    #[error("Failed to create descriptor heap: {0}")]
    DescriptorHeapCreationFailed(String),
    #[error("Failed to create pipeline: {0}")]
    PipelineCreationFailed(String),
    #[error("Command list error: {0}")]
    CommandListFailed(String),
    #[error("Fence error: {0}")]
    FenceFailed(String),
    #[error("Invalid handle: {0}")]
    InvalidHandle(String),
    #[error("Out of memory")]
    OutOfMemory,
    #[error("Device lost")]
    DeviceLost,
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Main graphics backend trait
pub trait GraphicsBackend {
    // Swap chain

    /// Number of swap chain buffers
    fn back_buffer_count(&self) -> u32;

    /// Texture of one swap chain buffer. Back buffers start in [`ResourceState::Present`].
    fn back_buffer(&self, index: u32) -> TextureHandle;

    /// Index of the back buffer the next frame renders into
    fn current_back_buffer_index(&mut self) -> BackendResult<u32>;

    /// Size of the swap chain buffers
    fn surface_size(&self) -> (u32, u32);

    /// Present the current back buffer
    fn present(&mut self) -> BackendResult<()>;

    /// Highest supported color/depth sample count not above `requested`
    fn supported_sample_count(&self, requested: u32) -> u32;

    // Resource creation

    /// Create a texture in `desc.initial_state`
    fn create_texture(&mut self, desc: &TextureDescriptor) -> BackendResult<TextureHandle>;

    /// Destroy a texture
    fn destroy_texture(&mut self, texture: TextureHandle);

    /// Create a buffer. Buffers with [`BufferUsage::MAP_WRITE`] stay mapped.
    fn create_buffer(&mut self, desc: &BufferDescriptor) -> BackendResult<BufferHandle>;

    /// Destroy a buffer
    fn destroy_buffer(&mut self, buffer: BufferHandle);

    /// Write into a mapped buffer. Writes are visible to the GPU without a flush.
    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) -> BackendResult<()>;

    /// GPU virtual address of the first byte of a buffer
    fn buffer_gpu_address(&self, buffer: BufferHandle) -> u64;

    // Descriptors

    /// Create a descriptor heap
    fn create_descriptor_heap(
        &mut self,
        desc: &DescriptorHeapDescriptor,
    ) -> BackendResult<DescriptorHeapHandle>;

    /// Destroy a descriptor heap
    fn destroy_descriptor_heap(&mut self, heap: DescriptorHeapHandle);

    /// Write a render target view into an RTV heap slot
    fn create_render_target_view(
        &mut self,
        texture: TextureHandle,
        desc: &RenderTargetViewDesc,
        dest: CpuDescriptor,
    ) -> BackendResult<()>;

    /// Write a depth stencil view into a DSV heap slot
    fn create_depth_stencil_view(&mut self, texture: TextureHandle, dest: CpuDescriptor) -> BackendResult<()>;

    /// Write a shader resource view into a CPU heap slot
    fn create_shader_resource_view(
        &mut self,
        texture: TextureHandle,
        desc: &ShaderResourceViewDesc,
        dest: CpuDescriptor,
    ) -> BackendResult<()>;

    /// Write an unordered access view into a CPU heap slot
    fn create_unordered_access_view(
        &mut self,
        texture: TextureHandle,
        desc: &UnorderedAccessViewDesc,
        dest: CpuDescriptor,
    ) -> BackendResult<()>;

    /// Copy `count` consecutive descriptors
    fn copy_descriptors(&mut self, count: u32, dest: CpuDescriptor, src: CpuDescriptor) -> BackendResult<()>;

    // Pipeline creation

    /// Create a root signature
    fn create_root_signature(&mut self, desc: &RootSignatureDesc) -> BackendResult<RootSignatureHandle>;

    /// Create a graphics pipeline
    fn create_graphics_pipeline(&mut self, desc: &GraphicsPipelineDesc) -> BackendResult<PipelineHandle>;

    /// Create a compute pipeline
    fn create_compute_pipeline(&mut self, desc: &ComputePipelineDesc) -> BackendResult<PipelineHandle>;

    // Synchronization

    /// Queue a signal of the frame fence to `value`
    fn signal_fence(&mut self, value: u64) -> BackendResult<()>;

    /// Last fence value the GPU has reached
    fn completed_fence_value(&self) -> BackendResult<u64>;

    /// Block until the fence reaches `value`
    fn wait_for_fence(&mut self, value: u64) -> BackendResult<()>;

    // Command recording and execution

    /// Reset the command list onto the allocator of `frame_slot`
    fn reset_command_list(&mut self, frame_slot: usize) -> BackendResult<()>;

    /// Finish recording
    fn close_command_list(&mut self) -> BackendResult<()>;

    /// Submit the closed command list
    fn execute_command_list(&mut self) -> BackendResult<()>;

    /// Declare resource state transitions
    fn resource_barrier(&mut self, barriers: &[ResourceBarrier]);

    /// Bind the shader-visible descriptor heap
    fn set_descriptor_heap(&mut self, heap: DescriptorHeapHandle);

    /// Bind a pipeline and its root signature
    fn set_pipeline(&mut self, pipeline: PipelineHandle);

    /// Bind a constant buffer address to a root slot
    fn set_root_constant_buffer(&mut self, slot: u32, gpu_address: u64);

    /// Bind a descriptor table to a root slot
    fn set_root_descriptor_table(&mut self, slot: u32, table: GpuDescriptor);

    /// Set viewport
    fn set_viewport(&mut self, viewport: Viewport);

    /// Set scissor rect
    fn set_scissor_rect(&mut self, rect: ScissorRect);

    /// Bind color targets and an optional depth target
    fn set_render_targets(&mut self, render_targets: &[CpuDescriptor], depth_stencil: Option<CpuDescriptor>);

    /// Clear a render target view
    fn clear_render_target(&mut self, rtv: CpuDescriptor, color: [f32; 4]);

    /// Clear the depth of a depth stencil view
    fn clear_depth(&mut self, dsv: CpuDescriptor, depth: f32);

    /// Clear a texture through an unordered access view
    fn clear_unordered_access(&mut self, uav: GpuDescriptor, texture: TextureHandle, values: [f32; 4]);

    /// Set vertex buffer
    fn set_vertex_buffer(&mut self, buffer: BufferHandle, stride: u32, size: u64);

    /// Set a 32-bit index buffer
    fn set_index_buffer(&mut self, buffer: BufferHandle, size: u64);

    /// Draw indexed triangles
    fn draw_indexed(&mut self, index_count: u32, start_index: u32, base_vertex: i32);

    /// Dispatch compute work
    fn dispatch(&mut self, x: u32, y: u32, z: u32);

    /// Copy bytes between buffers
    fn copy_buffer(&mut self, dest: BufferHandle, dest_offset: u64, src: BufferHandle, src_offset: u64, size: u64);

    /// Copy pixel rows from a buffer into one texture subresource
    fn copy_buffer_to_texture(
        &mut self,
        dest: TextureHandle,
        subresource: Subresource,
        src: BufferHandle,
        layout: BufferTextureLayout,
    );

    /// Copy a whole subresource between equally sized textures
    fn copy_texture_region(
        &mut self,
        dest: TextureHandle,
        dest_subresource: Subresource,
        src: TextureHandle,
        src_subresource: Subresource,
    );

    /// Resolve a multisampled texture into a single-sampled one
    fn resolve_subresource(&mut self, dest: TextureHandle, src: TextureHandle, format: TextureFormat);
}
