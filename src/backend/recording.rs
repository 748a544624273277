//! Headless recording backend
//!
//! Executes nothing on a GPU. Every command is appended to a log and the
//! resource state of every subresource is simulated, so a frame can be checked
//! for barrier correctness without hardware. Any barrier whose `before` state
//! disagrees with the simulated state, and any command that finds a resource in
//! the wrong state, is recorded as a violation.

use crate::backend::traits::*;
use crate::backend::types::*;
use std::collections::HashMap;

/// One recorded command
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Reset { frame_slot: usize },
    Close,
    Execute,
    Barrier(ResourceBarrier),
    SetDescriptorHeap(DescriptorHeapHandle),
    SetPipeline(PipelineHandle),
    SetRootConstantBuffer { slot: u32, gpu_address: u64 },
    SetRootDescriptorTable { slot: u32, table: GpuDescriptor },
    SetViewport(Viewport),
    SetScissorRect(ScissorRect),
    SetRenderTargets {
        render_targets: Vec<CpuDescriptor>,
        depth_stencil: Option<CpuDescriptor>,
    },
    ClearRenderTarget { rtv: CpuDescriptor, color: [f32; 4] },
    ClearDepth { dsv: CpuDescriptor, depth: f32 },
    ClearUnorderedAccess { texture: TextureHandle, values: [f32; 4] },
    SetVertexBuffer { buffer: BufferHandle, stride: u32 },
    SetIndexBuffer { buffer: BufferHandle },
    DrawIndexed { index_count: u32, start_index: u32, base_vertex: i32 },
    Dispatch { x: u32, y: u32, z: u32 },
    CopyBuffer { dest: BufferHandle, src: BufferHandle, size: u64 },
    CopyBufferToTexture { dest: TextureHandle, subresource: Subresource, src: BufferHandle },
    CopyTextureRegion {
        dest: TextureHandle,
        dest_subresource: Subresource,
        src: TextureHandle,
        src_subresource: Subresource,
    },
    Resolve { dest: TextureHandle, src: TextureHandle },
    Signal(u64),
    Present { back_buffer: u32 },
}

/// What a descriptor slot currently describes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorView {
    RenderTarget { texture: TextureHandle, mip: u32, slice: u32 },
    DepthStencil { texture: TextureHandle },
    ShaderResource { texture: TextureHandle, desc: ShaderResourceViewDesc },
    UnorderedAccess { texture: TextureHandle, mip: u32, slice: u32 },
}

impl DescriptorView {
    pub fn texture(&self) -> TextureHandle {
        match *self {
            DescriptorView::RenderTarget { texture, .. }
            | DescriptorView::DepthStencil { texture }
            | DescriptorView::ShaderResource { texture, .. }
            | DescriptorView::UnorderedAccess { texture, .. } => texture,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PipelineKind {
    Graphics,
    Compute,
}

struct RecordedTexture {
    desc: TextureDescriptor,
    states: Vec<ResourceState>,
}

struct RecordedBuffer {
    desc: BufferDescriptor,
    state: ResourceState,
    data: Vec<u8>,
    gpu_address: u64,
}

struct RecordedHeap {
    desc: DescriptorHeapDescriptor,
    slots: Vec<Option<DescriptorView>>,
}

struct RecordedPipeline {
    label: Option<String>,
    kind: PipelineKind,
    root_slot_count: u32,
}

/// Headless backend that records commands and simulates resource states.
pub struct RecordingBackend {
    width: u32,
    height: u32,
    max_samples: u32,

    textures: HashMap<u64, RecordedTexture>,
    buffers: HashMap<u64, RecordedBuffer>,
    heaps: HashMap<u64, RecordedHeap>,
    root_signatures: HashMap<u64, RootSignatureDesc>,
    pipelines: HashMap<u64, RecordedPipeline>,

    back_buffers: Vec<TextureHandle>,
    current_back_buffer: u32,

    commands: Vec<Command>,
    violations: Vec<String>,
    recording: bool,
    bound_pipeline: Option<u64>,
    next_gpu_address: u64,

    signaled_value: u64,
    completed_value: u64,
    presented_frames: u64,

    next_id: u64,
}

impl RecordingBackend {
    /// Create a backend whose swap chain has `buffer_count` buffers of `width` x `height`
    pub fn new(width: u32, height: u32, buffer_count: u32) -> Self {
        let mut backend = Self {
            width,
            height,
            max_samples: 8,
            textures: HashMap::new(),
            buffers: HashMap::new(),
            heaps: HashMap::new(),
            root_signatures: HashMap::new(),
            pipelines: HashMap::new(),
            back_buffers: Vec::new(),
            current_back_buffer: 0,
            commands: Vec::new(),
            violations: Vec::new(),
            recording: false,
            bound_pipeline: None,
            next_gpu_address: 0x1_0000,
            signaled_value: 0,
            completed_value: 0,
            presented_frames: 0,
            next_id: 1,
        };

        for i in 0..buffer_count {
            let desc = TextureDescriptor {
                label: Some(format!("back buffer {i}")),
                width,
                height,
                format: TextureFormat::Rgba8Unorm,
                usage: TextureUsage::RENDER_ATTACHMENT,
                initial_state: ResourceState::Present,
                ..Default::default()
            };
            let id = backend.allocate_id();
            backend.textures.insert(
                id,
                RecordedTexture {
                    states: vec![desc.initial_state; desc.subresource_count()],
                    desc,
                },
            );
            backend.back_buffers.push(TextureHandle(id));
        }

        backend
    }

    /// Limit the sample counts reported as supported
    pub fn with_max_samples(mut self, max_samples: u32) -> Self {
        self.max_samples = max_samples;
        self
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn violation(&mut self, message: String) {
        log::trace!("RecordingBackend: violation: {message}");
        self.violations.push(message);
    }

    fn record(&mut self, command: Command) {
        log::trace!("RecordingBackend: {:?}", command);
        if !self.recording {
            self.violation(format!("{command:?} recorded outside of an open command list"));
        }
        self.commands.push(command);
    }

    fn texture_label(&self, texture: TextureHandle) -> String {
        self.textures
            .get(&texture.0)
            .and_then(|t| t.desc.label.clone())
            .unwrap_or_else(|| format!("texture #{}", texture.0))
    }

    fn expect_texture_state(&mut self, texture: TextureHandle, subresource: Option<Subresource>, expected: ResourceState, usage: &str) {
        let Some(recorded) = self.textures.get(&texture.0) else {
            self.violation(format!("{usage}: unknown texture #{}", texture.0));
            return;
        };

        let mismatched: Vec<(usize, ResourceState)> = match subresource {
            Some(sub) => {
                let index = sub.index(recorded.desc.mip_levels);
                match recorded.states.get(index) {
                    Some(&state) if state != expected => vec![(index, state)],
                    Some(_) => Vec::new(),
                    None => {
                        let message = format!("{usage}: subresource {sub:?} out of range");
                        self.violation(message);
                        return;
                    }
                }
            }
            None => recorded
                .states
                .iter()
                .copied()
                .enumerate()
                .filter(|&(_, s)| s != expected)
                .collect(),
        };

        if let Some(&(index, state)) = mismatched.first() {
            let label = self.texture_label(texture);
            self.violation(format!(
                "{usage}: '{label}' subresource {index} is {state:?}, expected {expected:?}"
            ));
        }
    }

    fn expect_buffer_state(&mut self, buffer: BufferHandle, expected: &[ResourceState], usage: &str) {
        let state = match self.buffers.get(&buffer.0) {
            Some(b) => b.state,
            None => {
                self.violation(format!("{usage}: unknown buffer #{}", buffer.0));
                return;
            }
        };
        if !expected.contains(&state) {
            self.violation(format!("{usage}: buffer #{} is {state:?}, expected one of {expected:?}", buffer.0));
        }
    }

    fn descriptor_at(&self, heap: DescriptorHeapHandle, index: u32) -> Option<DescriptorView> {
        self.heaps
            .get(&heap.0)
            .and_then(|h| h.slots.get(index as usize))
            .copied()
            .flatten()
    }

    fn write_descriptor(&mut self, dest: CpuDescriptor, view: DescriptorView) -> BackendResult<()> {
        let heap = self
            .heaps
            .get_mut(&dest.heap.0)
            .ok_or_else(|| BackendError::InvalidHandle(format!("descriptor heap #{}", dest.heap.0)))?;
        let slot = heap
            .slots
            .get_mut(dest.index as usize)
            .ok_or_else(|| BackendError::InvalidHandle(format!("descriptor slot {}", dest.index)))?;
        *slot = Some(view);
        Ok(())
    }

    fn check_root_slot(&mut self, slot: u32) {
        let Some(id) = self.bound_pipeline else {
            self.violation(format!("root slot {slot} bound without a pipeline"));
            return;
        };
        let (count, label) = match self.pipelines.get(&id) {
            Some(p) => (p.root_slot_count, p.label.clone()),
            None => return,
        };
        if slot >= count {
            self.violation(format!(
                "root slot {slot} out of range for pipeline {label:?} with {count} slots"
            ));
        }
    }

    fn check_bound_pipeline(&mut self, kind: PipelineKind, command: &str) {
        let bound = self.bound_pipeline.and_then(|id| self.pipelines.get(&id)).map(|p| p.kind);
        if bound != Some(kind) {
            self.violation(format!("{command} with {bound:?} pipeline bound"));
        }
    }

    /// Every command recorded so far
    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    /// Forget the recorded commands (states and violations are kept)
    pub fn clear_commands(&mut self) {
        self.commands.clear();
    }

    /// Every state violation detected so far
    pub fn violations(&self) -> &[String] {
        &self.violations
    }

    pub fn draw_count(&self) -> usize {
        self.commands
            .iter()
            .filter(|c| matches!(c, Command::DrawIndexed { .. }))
            .count()
    }

    pub fn dispatch_count(&self) -> usize {
        self.commands
            .iter()
            .filter(|c| matches!(c, Command::Dispatch { .. }))
            .count()
    }

    /// Number of texture-to-texture region copies
    pub fn texture_copy_count(&self) -> usize {
        self.commands
            .iter()
            .filter(|c| matches!(c, Command::CopyTextureRegion { .. }))
            .count()
    }

    /// Recorded barriers in order
    pub fn barriers(&self) -> Vec<ResourceBarrier> {
        self.commands
            .iter()
            .filter_map(|c| match c {
                Command::Barrier(b) => Some(*b),
                _ => None,
            })
            .collect()
    }

    pub fn presented_frames(&self) -> u64 {
        self.presented_frames
    }

    /// Simulated per-subresource states of a texture
    pub fn texture_states(&self, texture: TextureHandle) -> Option<&[ResourceState]> {
        self.textures.get(&texture.0).map(|t| t.states.as_slice())
    }

    pub fn buffer_state(&self, buffer: BufferHandle) -> Option<ResourceState> {
        self.buffers.get(&buffer.0).map(|b| b.state)
    }

    /// Snapshot of every live texture's simulated states
    pub fn texture_state_snapshot(&self) -> HashMap<TextureHandle, Vec<ResourceState>> {
        self.textures
            .iter()
            .map(|(&id, t)| (TextureHandle(id), t.states.clone()))
            .collect()
    }

    pub fn texture_desc(&self, texture: TextureHandle) -> Option<&TextureDescriptor> {
        self.textures.get(&texture.0).map(|t| &t.desc)
    }

    pub fn texture_count(&self) -> usize {
        self.textures.len()
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    /// View written at a CPU descriptor
    pub fn cpu_descriptor(&self, handle: CpuDescriptor) -> Option<DescriptorView> {
        self.descriptor_at(handle.heap, handle.index)
    }

    /// View written at a shader-visible descriptor
    pub fn gpu_descriptor(&self, handle: GpuDescriptor) -> Option<DescriptorView> {
        self.descriptor_at(handle.heap, handle.index)
    }

    /// Bytes previously written into a mapped buffer
    pub fn read_buffer(&self, buffer: BufferHandle, offset: u64, len: usize) -> Option<&[u8]> {
        let data = &self.buffers.get(&buffer.0)?.data;
        let start = offset as usize;
        data.get(start..start + len)
    }

    /// Label of the pipeline with the given handle
    pub fn pipeline_label(&self, pipeline: PipelineHandle) -> Option<&str> {
        self.pipelines.get(&pipeline.0)?.label.as_deref()
    }
}

impl GraphicsBackend for RecordingBackend {
    fn back_buffer_count(&self) -> u32 {
        self.back_buffers.len() as u32
    }

    fn back_buffer(&self, index: u32) -> TextureHandle {
        self.back_buffers[index as usize % self.back_buffers.len()]
    }

    fn current_back_buffer_index(&mut self) -> BackendResult<u32> {
        Ok(self.current_back_buffer)
    }

    fn surface_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn present(&mut self) -> BackendResult<()> {
        let back_buffer = self.back_buffer(self.current_back_buffer);
        self.expect_texture_state(back_buffer, None, ResourceState::Present, "present");
        self.commands.push(Command::Present {
            back_buffer: self.current_back_buffer,
        });
        self.presented_frames += 1;
        self.current_back_buffer = (self.current_back_buffer + 1) % self.back_buffer_count().max(1);
        Ok(())
    }

    fn supported_sample_count(&self, requested: u32) -> u32 {
        let mut count = requested.min(self.max_samples).max(1);
        while !count.is_power_of_two() {
            count -= 1;
        }
        count
    }

    fn create_texture(&mut self, desc: &TextureDescriptor) -> BackendResult<TextureHandle> {
        log::trace!(
            "RecordingBackend: creating texture {:?} ({}x{}, {} layers, {} mips)",
            desc.label,
            desc.width,
            desc.height,
            desc.array_layers,
            desc.mip_levels
        );
        if desc.width == 0 || desc.height == 0 || desc.mip_levels == 0 || desc.array_layers == 0 {
            return Err(BackendError::TextureCreationFailed(format!(
                "degenerate texture {:?}",
                desc.label
            )));
        }
        let id = self.allocate_id();
        self.textures.insert(
            id,
            RecordedTexture {
                states: vec![desc.initial_state; desc.subresource_count()],
                desc: desc.clone(),
            },
        );
        Ok(TextureHandle(id))
    }

    fn destroy_texture(&mut self, texture: TextureHandle) {
        self.textures.remove(&texture.0);
    }

    fn create_buffer(&mut self, desc: &BufferDescriptor) -> BackendResult<BufferHandle> {
        log::trace!("RecordingBackend: creating buffer {:?} (size: {})", desc.label, desc.size);
        let id = self.allocate_id();
        let gpu_address = self.next_gpu_address;
        self.next_gpu_address += desc.size.next_multiple_of(0x1_0000).max(0x1_0000);
        let data = if desc.usage.contains(BufferUsage::MAP_WRITE) {
            vec![0; desc.size as usize]
        } else {
            Vec::new()
        };
        self.buffers.insert(
            id,
            RecordedBuffer {
                desc: desc.clone(),
                state: desc.initial_state,
                data,
                gpu_address,
            },
        );
        Ok(BufferHandle(id))
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        self.buffers.remove(&buffer.0);
    }

    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) -> BackendResult<()> {
        let recorded = self
            .buffers
            .get_mut(&buffer.0)
            .ok_or_else(|| BackendError::InvalidHandle(format!("buffer #{}", buffer.0)))?;
        if !recorded.desc.usage.contains(BufferUsage::MAP_WRITE) {
            return Err(BackendError::InvalidHandle(format!(
                "buffer {:?} is not host visible",
                recorded.desc.label
            )));
        }
        let start = offset as usize;
        let end = start + data.len();
        let target = recorded.data.get_mut(start..end).ok_or(BackendError::OutOfMemory)?;
        target.copy_from_slice(data);
        Ok(())
    }

    fn buffer_gpu_address(&self, buffer: BufferHandle) -> u64 {
        self.buffers.get(&buffer.0).map(|b| b.gpu_address).unwrap_or(0)
    }

    fn create_descriptor_heap(
        &mut self,
        desc: &DescriptorHeapDescriptor,
    ) -> BackendResult<DescriptorHeapHandle> {
        let id = self.allocate_id();
        self.heaps.insert(
            id,
            RecordedHeap {
                desc: desc.clone(),
                slots: vec![None; desc.capacity as usize],
            },
        );
        Ok(DescriptorHeapHandle(id))
    }

    fn destroy_descriptor_heap(&mut self, heap: DescriptorHeapHandle) {
        self.heaps.remove(&heap.0);
    }

    fn create_render_target_view(
        &mut self,
        texture: TextureHandle,
        desc: &RenderTargetViewDesc,
        dest: CpuDescriptor,
    ) -> BackendResult<()> {
        self.write_descriptor(
            dest,
            DescriptorView::RenderTarget {
                texture,
                mip: desc.mip,
                slice: desc.slice,
            },
        )
    }

    fn create_depth_stencil_view(&mut self, texture: TextureHandle, dest: CpuDescriptor) -> BackendResult<()> {
        self.write_descriptor(dest, DescriptorView::DepthStencil { texture })
    }

    fn create_shader_resource_view(
        &mut self,
        texture: TextureHandle,
        desc: &ShaderResourceViewDesc,
        dest: CpuDescriptor,
    ) -> BackendResult<()> {
        self.write_descriptor(dest, DescriptorView::ShaderResource { texture, desc: *desc })
    }

    fn create_unordered_access_view(
        &mut self,
        texture: TextureHandle,
        desc: &UnorderedAccessViewDesc,
        dest: CpuDescriptor,
    ) -> BackendResult<()> {
        self.write_descriptor(
            dest,
            DescriptorView::UnorderedAccess {
                texture,
                mip: desc.mip,
                slice: desc.slice,
            },
        )
    }

    fn copy_descriptors(&mut self, count: u32, dest: CpuDescriptor, src: CpuDescriptor) -> BackendResult<()> {
        for i in 0..count {
            let view = self
                .descriptor_at(src.heap, src.index + i)
                .ok_or_else(|| BackendError::InvalidHandle(format!("empty descriptor {}", src.index + i)))?;
            self.write_descriptor(dest.offset(i), view)?;
        }
        Ok(())
    }

    fn create_root_signature(&mut self, desc: &RootSignatureDesc) -> BackendResult<RootSignatureHandle> {
        let id = self.allocate_id();
        self.root_signatures.insert(id, desc.clone());
        Ok(RootSignatureHandle(id))
    }

    fn create_graphics_pipeline(&mut self, desc: &GraphicsPipelineDesc) -> BackendResult<PipelineHandle> {
        let root = self
            .root_signatures
            .get(&desc.root_signature.0)
            .ok_or_else(|| BackendError::PipelineCreationFailed("unknown root signature".into()))?;
        let root_slot_count = root.root_slot_count;
        if desc.vertex_shader.is_empty() || desc.pixel_shader.is_empty() {
            return Err(BackendError::PipelineCreationFailed(format!(
                "{:?}: empty shader bytecode",
                desc.label
            )));
        }
        let id = self.allocate_id();
        self.pipelines.insert(
            id,
            RecordedPipeline {
                label: desc.label.clone(),
                kind: PipelineKind::Graphics,
                root_slot_count,
            },
        );
        Ok(PipelineHandle(id))
    }

    fn create_compute_pipeline(&mut self, desc: &ComputePipelineDesc) -> BackendResult<PipelineHandle> {
        let root = self
            .root_signatures
            .get(&desc.root_signature.0)
            .ok_or_else(|| BackendError::PipelineCreationFailed("unknown root signature".into()))?;
        let root_slot_count = root.root_slot_count;
        if desc.compute_shader.is_empty() {
            return Err(BackendError::PipelineCreationFailed(format!(
                "{:?}: empty shader bytecode",
                desc.label
            )));
        }
        let id = self.allocate_id();
        self.pipelines.insert(
            id,
            RecordedPipeline {
                label: desc.label.clone(),
                kind: PipelineKind::Compute,
                root_slot_count,
            },
        );
        Ok(PipelineHandle(id))
    }

    fn signal_fence(&mut self, value: u64) -> BackendResult<()> {
        if value <= self.signaled_value {
            return Err(BackendError::FenceFailed(format!(
                "fence value {value} is not above {}",
                self.signaled_value
            )));
        }
        self.commands.push(Command::Signal(value));
        self.signaled_value = value;
        // Work completes as soon as it is submitted.
        self.completed_value = value;
        Ok(())
    }

    fn completed_fence_value(&self) -> BackendResult<u64> {
        Ok(self.completed_value)
    }

    fn wait_for_fence(&mut self, value: u64) -> BackendResult<()> {
        if value > self.signaled_value {
            return Err(BackendError::FenceFailed(format!(
                "waiting for {value} which was never signaled"
            )));
        }
        Ok(())
    }

    fn reset_command_list(&mut self, frame_slot: usize) -> BackendResult<()> {
        if self.recording {
            return Err(BackendError::CommandListFailed("reset while recording".into()));
        }
        self.recording = true;
        self.bound_pipeline = None;
        self.record(Command::Reset { frame_slot });
        Ok(())
    }

    fn close_command_list(&mut self) -> BackendResult<()> {
        if !self.recording {
            return Err(BackendError::CommandListFailed("close without reset".into()));
        }
        self.record(Command::Close);
        self.recording = false;
        Ok(())
    }

    fn execute_command_list(&mut self) -> BackendResult<()> {
        if self.recording {
            return Err(BackendError::CommandListFailed("execute of an open command list".into()));
        }
        self.commands.push(Command::Execute);
        Ok(())
    }

    fn resource_barrier(&mut self, barriers: &[ResourceBarrier]) {
        for barrier in barriers {
            self.record(Command::Barrier(*barrier));
            if barrier.before == barrier.after && !barrier.is_uav() {
                self.violation(format!("no-op barrier {barrier:?}"));
            }
            match barrier.resource {
                GpuResource::Texture(texture) => {
                    self.expect_texture_state(texture, barrier.subresource, barrier.before, "barrier");
                    if let Some(recorded) = self.textures.get_mut(&texture.0) {
                        match barrier.subresource {
                            Some(sub) => {
                                let index = sub.index(recorded.desc.mip_levels);
                                if let Some(state) = recorded.states.get_mut(index) {
                                    *state = barrier.after;
                                }
                            }
                            None => recorded.states.iter_mut().for_each(|s| *s = barrier.after),
                        }
                    }
                }
                GpuResource::Buffer(buffer) => {
                    self.expect_buffer_state(buffer, &[barrier.before], "barrier");
                    if let Some(recorded) = self.buffers.get_mut(&buffer.0) {
                        recorded.state = barrier.after;
                    }
                }
            }
        }
    }

    fn set_descriptor_heap(&mut self, heap: DescriptorHeapHandle) {
        let visible = self.heaps.get(&heap.0).map(|h| h.desc.shader_visible);
        if visible != Some(true) {
            self.violation(format!("descriptor heap #{} is not shader visible", heap.0));
        }
        self.record(Command::SetDescriptorHeap(heap));
    }

    fn set_pipeline(&mut self, pipeline: PipelineHandle) {
        if !self.pipelines.contains_key(&pipeline.0) {
            self.violation(format!("unknown pipeline #{}", pipeline.0));
        }
        self.bound_pipeline = Some(pipeline.0);
        self.record(Command::SetPipeline(pipeline));
    }

    fn set_root_constant_buffer(&mut self, slot: u32, gpu_address: u64) {
        self.check_root_slot(slot);
        if gpu_address % 256 != 0 {
            self.violation(format!("constant buffer address {gpu_address:#x} is not 256-aligned"));
        }
        self.record(Command::SetRootConstantBuffer { slot, gpu_address });
    }

    fn set_root_descriptor_table(&mut self, slot: u32, table: GpuDescriptor) {
        self.check_root_slot(slot);
        let visible = self.heaps.get(&table.heap.0).map(|h| h.desc.shader_visible);
        if visible != Some(true) {
            self.violation(format!("descriptor table {table:?} is not in a shader-visible heap"));
        } else if self.descriptor_at(table.heap, table.index).is_none() {
            self.violation(format!("descriptor table {table:?} starts at an empty slot"));
        }
        self.record(Command::SetRootDescriptorTable { slot, table });
    }

    fn set_viewport(&mut self, viewport: Viewport) {
        self.record(Command::SetViewport(viewport));
    }

    fn set_scissor_rect(&mut self, rect: ScissorRect) {
        self.record(Command::SetScissorRect(rect));
    }

    fn set_render_targets(&mut self, render_targets: &[CpuDescriptor], depth_stencil: Option<CpuDescriptor>) {
        for &rtv in render_targets {
            match self.cpu_descriptor(rtv) {
                Some(DescriptorView::RenderTarget { texture, mip, slice }) => {
                    self.expect_texture_state(
                        texture,
                        Some(Subresource::new(mip, slice)),
                        ResourceState::RenderTarget,
                        "set_render_targets",
                    );
                }
                other => self.violation(format!("{rtv:?} is not a render target view: {other:?}")),
            }
        }
        if let Some(dsv) = depth_stencil {
            match self.cpu_descriptor(dsv) {
                Some(DescriptorView::DepthStencil { texture }) => {
                    self.expect_texture_state(texture, None, ResourceState::DepthWrite, "set_render_targets");
                }
                other => self.violation(format!("{dsv:?} is not a depth stencil view: {other:?}")),
            }
        }
        self.record(Command::SetRenderTargets {
            render_targets: render_targets.to_vec(),
            depth_stencil,
        });
    }

    fn clear_render_target(&mut self, rtv: CpuDescriptor, color: [f32; 4]) {
        if let Some(DescriptorView::RenderTarget { texture, mip, slice }) = self.cpu_descriptor(rtv) {
            self.expect_texture_state(
                texture,
                Some(Subresource::new(mip, slice)),
                ResourceState::RenderTarget,
                "clear_render_target",
            );
        } else {
            self.violation(format!("clear of non render target view {rtv:?}"));
        }
        self.record(Command::ClearRenderTarget { rtv, color });
    }

    fn clear_depth(&mut self, dsv: CpuDescriptor, depth: f32) {
        if let Some(DescriptorView::DepthStencil { texture }) = self.cpu_descriptor(dsv) {
            self.expect_texture_state(texture, None, ResourceState::DepthWrite, "clear_depth");
        } else {
            self.violation(format!("clear of non depth stencil view {dsv:?}"));
        }
        self.record(Command::ClearDepth { dsv, depth });
    }

    fn clear_unordered_access(&mut self, uav: GpuDescriptor, texture: TextureHandle, values: [f32; 4]) {
        match self.gpu_descriptor(uav) {
            Some(DescriptorView::UnorderedAccess { texture: viewed, mip, slice }) if viewed == texture => {
                self.expect_texture_state(
                    texture,
                    Some(Subresource::new(mip, slice)),
                    ResourceState::UnorderedAccess,
                    "clear_unordered_access",
                );
            }
            other => self.violation(format!("clear through {uav:?} which holds {other:?}")),
        }
        self.record(Command::ClearUnorderedAccess { texture, values });
    }

    fn set_vertex_buffer(&mut self, buffer: BufferHandle, stride: u32, _size: u64) {
        self.expect_buffer_state(
            buffer,
            &[ResourceState::VertexAndConstantBuffer, ResourceState::GenericRead],
            "set_vertex_buffer",
        );
        self.record(Command::SetVertexBuffer { buffer, stride });
    }

    fn set_index_buffer(&mut self, buffer: BufferHandle, _size: u64) {
        self.expect_buffer_state(
            buffer,
            &[ResourceState::IndexBuffer, ResourceState::GenericRead],
            "set_index_buffer",
        );
        self.record(Command::SetIndexBuffer { buffer });
    }

    fn draw_indexed(&mut self, index_count: u32, start_index: u32, base_vertex: i32) {
        self.check_bound_pipeline(PipelineKind::Graphics, "draw_indexed");
        self.record(Command::DrawIndexed {
            index_count,
            start_index,
            base_vertex,
        });
    }

    fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        self.check_bound_pipeline(PipelineKind::Compute, "dispatch");
        if x == 0 || y == 0 || z == 0 {
            self.violation(format!("empty dispatch {x}x{y}x{z}"));
        }
        self.record(Command::Dispatch { x, y, z });
    }

    fn copy_buffer(&mut self, dest: BufferHandle, dest_offset: u64, src: BufferHandle, src_offset: u64, size: u64) {
        self.expect_buffer_state(dest, &[ResourceState::CopyDest], "copy_buffer");
        self.expect_buffer_state(src, &[ResourceState::GenericRead, ResourceState::CopySource], "copy_buffer");
        let _ = (dest_offset, src_offset);
        self.record(Command::CopyBuffer { dest, src, size });
    }

    fn copy_buffer_to_texture(
        &mut self,
        dest: TextureHandle,
        subresource: Subresource,
        src: BufferHandle,
        layout: BufferTextureLayout,
    ) {
        self.expect_texture_state(dest, Some(subresource), ResourceState::CopyDest, "copy_buffer_to_texture");
        self.expect_buffer_state(src, &[ResourceState::GenericRead, ResourceState::CopySource], "copy_buffer_to_texture");
        let fits = self
            .buffers
            .get(&src.0)
            .map(|b| layout.offset + layout.row_pitch as u64 * layout.height as u64 <= b.desc.size)
            .unwrap_or(false);
        if !fits {
            self.violation(format!("copy_buffer_to_texture reads past the end of buffer #{}", src.0));
        }
        self.record(Command::CopyBufferToTexture {
            dest,
            subresource,
            src,
        });
    }

    fn copy_texture_region(
        &mut self,
        dest: TextureHandle,
        dest_subresource: Subresource,
        src: TextureHandle,
        src_subresource: Subresource,
    ) {
        self.expect_texture_state(dest, Some(dest_subresource), ResourceState::CopyDest, "copy_texture_region");
        self.expect_texture_state(src, Some(src_subresource), ResourceState::CopySource, "copy_texture_region");
        self.record(Command::CopyTextureRegion {
            dest,
            dest_subresource,
            src,
            src_subresource,
        });
    }

    fn resolve_subresource(&mut self, dest: TextureHandle, src: TextureHandle, _format: TextureFormat) {
        self.expect_texture_state(dest, None, ResourceState::ResolveDest, "resolve_subresource");
        self.expect_texture_state(src, None, ResourceState::ResolveSource, "resolve_subresource");
        self.record(Command::Resolve { dest, src });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn color_texture(backend: &mut RecordingBackend, initial_state: ResourceState) -> TextureHandle {
        backend
            .create_texture(&TextureDescriptor {
                label: Some("test".into()),
                width: 4,
                height: 4,
                mip_levels: 2,
                initial_state,
                ..Default::default()
            })
            .unwrap()
    }

    #[test]
    fn test_barrier_updates_simulated_state() {
        let mut backend = RecordingBackend::new(8, 8, 2);
        let texture = color_texture(&mut backend, ResourceState::CopyDest);
        backend.reset_command_list(0).unwrap();
        backend.resource_barrier(&[ResourceBarrier::transition(
            texture,
            ResourceState::CopyDest,
            ResourceState::PixelShaderResource,
        )]);
        assert!(backend.violations().is_empty());
        assert_eq!(
            backend.texture_states(texture).unwrap(),
            &[ResourceState::PixelShaderResource; 2]
        );
    }

    #[test]
    fn test_mismatched_barrier_is_a_violation() {
        let mut backend = RecordingBackend::new(8, 8, 2);
        let texture = color_texture(&mut backend, ResourceState::CopyDest);
        backend.reset_command_list(0).unwrap();
        backend.resource_barrier(&[ResourceBarrier::transition(
            texture,
            ResourceState::RenderTarget,
            ResourceState::PixelShaderResource,
        )]);
        assert_eq!(backend.violations().len(), 1);
    }

    #[test]
    fn test_uav_barrier_is_not_a_no_op() {
        let mut backend = RecordingBackend::new(8, 8, 2);
        let texture = color_texture(&mut backend, ResourceState::UnorderedAccess);
        backend.reset_command_list(0).unwrap();
        backend.resource_barrier(&[ResourceBarrier::uav(texture)]);
        assert!(backend.violations().is_empty(), "{:?}", backend.violations());

        backend.resource_barrier(&[ResourceBarrier::transition(
            texture,
            ResourceState::UnorderedAccess,
            ResourceState::NonPixelShaderResource,
        )]);
        // Same-state transitions other than UAV barriers stay suspicious
        backend.resource_barrier(&[ResourceBarrier::transition(
            texture,
            ResourceState::NonPixelShaderResource,
            ResourceState::NonPixelShaderResource,
        )]);
        assert_eq!(backend.violations().len(), 1);
    }

    #[test]
    fn test_subresource_barrier() {
        let mut backend = RecordingBackend::new(8, 8, 2);
        let texture = color_texture(&mut backend, ResourceState::NonPixelShaderResource);
        backend.reset_command_list(0).unwrap();
        backend.resource_barrier(&[ResourceBarrier::transition_subresource(
            texture,
            Subresource::new(1, 0),
            ResourceState::NonPixelShaderResource,
            ResourceState::CopyDest,
        )]);
        assert_eq!(
            backend.texture_states(texture).unwrap(),
            &[ResourceState::NonPixelShaderResource, ResourceState::CopyDest]
        );

        // A whole-resource barrier now disagrees with mip 1
        backend.resource_barrier(&[ResourceBarrier::transition(
            texture,
            ResourceState::NonPixelShaderResource,
            ResourceState::PixelShaderResource,
        )]);
        assert_eq!(backend.violations().len(), 1);
    }

    #[test]
    fn test_commands_outside_command_list() {
        let mut backend = RecordingBackend::new(8, 8, 2);
        backend.dispatch(1, 1, 1);
        assert!(!backend.violations().is_empty());
    }

    #[test]
    fn test_fence_values_must_increase() {
        let mut backend = RecordingBackend::new(8, 8, 2);
        backend.signal_fence(1).unwrap();
        assert!(backend.signal_fence(1).is_err());
        assert_eq!(backend.completed_fence_value().unwrap(), 1);
        assert!(backend.wait_for_fence(2).is_err());
    }

    #[test]
    fn test_present_rotates_back_buffers() {
        let mut backend = RecordingBackend::new(8, 8, 2);
        assert_eq!(backend.current_back_buffer_index().unwrap(), 0);
        backend.present().unwrap();
        assert_eq!(backend.current_back_buffer_index().unwrap(), 1);
        backend.present().unwrap();
        assert_eq!(backend.current_back_buffer_index().unwrap(), 0);
        assert!(backend.violations().is_empty());
    }

    #[test]
    fn test_supported_sample_count() {
        let backend = RecordingBackend::new(8, 8, 2).with_max_samples(4);
        assert_eq!(backend.supported_sample_count(8), 4);
        assert_eq!(backend.supported_sample_count(3), 2);
        assert_eq!(backend.supported_sample_count(0), 1);
    }
}
