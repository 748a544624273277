//! Resources that remember their own state
//!
//! Every GPU texture and buffer the engine owns is wrapped in a tracked value
//! that knows the state of each subresource. Asking for a new state emits
//! exactly the barriers needed to get there.

use crate::backend::traits::*;
use crate::backend::types::*;

/// A texture plus the current state of each of its subresources
#[derive(Debug)]
pub struct TrackedTexture {
    handle: TextureHandle,
    desc: TextureDescriptor,
    states: Vec<ResourceState>,
}

impl TrackedTexture {
    /// Create the texture on the backend
    pub fn create(backend: &mut dyn GraphicsBackend, desc: TextureDescriptor) -> BackendResult<Self> {
        let handle = backend.create_texture(&desc)?;
        log::debug!(
            "Created texture {:?} ({}x{}, {} mips, {:?})",
            desc.label,
            desc.width,
            desc.height,
            desc.mip_levels,
            desc.format
        );
        Ok(Self::wrap(handle, desc))
    }

    /// Track a texture the caller created, such as a swap chain buffer
    pub fn wrap(handle: TextureHandle, desc: TextureDescriptor) -> Self {
        Self {
            handle,
            states: vec![desc.initial_state; desc.subresource_count()],
            desc,
        }
    }

    pub fn handle(&self) -> TextureHandle {
        self.handle
    }

    pub fn desc(&self) -> &TextureDescriptor {
        &self.desc
    }

    pub fn width(&self) -> u32 {
        self.desc.width
    }

    pub fn height(&self) -> u32 {
        self.desc.height
    }

    pub fn mip_levels(&self) -> u32 {
        self.desc.mip_levels
    }

    pub fn array_layers(&self) -> u32 {
        self.desc.array_layers
    }

    pub fn format(&self) -> TextureFormat {
        self.desc.format
    }

    /// State shared by every subresource, `None` while they differ
    pub fn state(&self) -> Option<ResourceState> {
        let first = *self.states.first()?;
        self.states.iter().all(|&s| s == first).then_some(first)
    }

    pub fn subresource_state(&self, subresource: Subresource) -> ResourceState {
        self.states[subresource.index(self.desc.mip_levels)]
    }

    /// Barriers moving every subresource to `target`, updating the tracked state
    pub fn barriers_to(&mut self, target: ResourceState) -> Vec<ResourceBarrier> {
        let barriers = match self.state() {
            Some(state) if state == target => Vec::new(),
            Some(state) => vec![ResourceBarrier::transition(self.handle, state, target)],
            None => {
                let mip_levels = self.desc.mip_levels;
                self.states
                    .iter()
                    .enumerate()
                    .filter(|&(_, &state)| state != target)
                    .map(|(index, &state)| {
                        let subresource = Subresource::new(index as u32 % mip_levels, index as u32 / mip_levels);
                        ResourceBarrier::transition_subresource(self.handle, subresource, state, target)
                    })
                    .collect()
            }
        };
        self.states.iter_mut().for_each(|s| *s = target);
        barriers
    }

    /// Move every subresource to `target`
    pub fn transition_to(&mut self, backend: &mut dyn GraphicsBackend, target: ResourceState) {
        let barriers = self.barriers_to(target);
        if !barriers.is_empty() {
            backend.resource_barrier(&barriers);
        }
    }

    /// Wait for earlier unordered-access writes before the next one. Every
    /// subresource must already be in the unordered-access state.
    pub fn uav_barrier(&self, backend: &mut dyn GraphicsBackend) {
        debug_assert_eq!(
            self.state(),
            Some(ResourceState::UnorderedAccess),
            "UAV barrier on {:?} outside the unordered-access state",
            self.desc.label
        );
        backend.resource_barrier(&[ResourceBarrier::uav(self.handle)]);
    }

    /// Move one subresource to `target`
    pub fn transition_subresource(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        subresource: Subresource,
        target: ResourceState,
    ) {
        let index = subresource.index(self.desc.mip_levels);
        let state = self.states[index];
        if state != target {
            backend.resource_barrier(&[ResourceBarrier::transition_subresource(
                self.handle,
                subresource,
                state,
                target,
            )]);
            self.states[index] = target;
        }
    }

    pub fn destroy(self, backend: &mut dyn GraphicsBackend) {
        backend.destroy_texture(self.handle);
    }
}

/// A buffer plus its current state
#[derive(Debug)]
pub struct TrackedBuffer {
    handle: BufferHandle,
    size: u64,
    state: ResourceState,
}

impl TrackedBuffer {
    pub fn create(backend: &mut dyn GraphicsBackend, desc: &BufferDescriptor) -> BackendResult<Self> {
        let handle = backend.create_buffer(desc)?;
        log::debug!("Created buffer {:?} ({} bytes)", desc.label, desc.size);
        Ok(Self {
            handle,
            size: desc.size,
            state: desc.initial_state,
        })
    }

    pub fn handle(&self) -> BufferHandle {
        self.handle
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn state(&self) -> ResourceState {
        self.state
    }

    /// Barrier moving the buffer to `target`, if it is not there already
    pub fn barrier_to(&mut self, target: ResourceState) -> Option<ResourceBarrier> {
        if self.state == target {
            return None;
        }
        let barrier = ResourceBarrier::transition(self.handle, self.state, target);
        self.state = target;
        Some(barrier)
    }

    pub fn transition_to(&mut self, backend: &mut dyn GraphicsBackend, target: ResourceState) {
        if let Some(barrier) = self.barrier_to(target) {
            backend.resource_barrier(&[barrier]);
        }
    }

    pub fn destroy(self, backend: &mut dyn GraphicsBackend) {
        backend.destroy_buffer(self.handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::RecordingBackend;

    fn mipped_texture(backend: &mut RecordingBackend) -> TrackedTexture {
        TrackedTexture::create(
            backend,
            TextureDescriptor {
                label: Some("mipped".into()),
                width: 8,
                height: 8,
                mip_levels: 4,
                array_layers: 2,
                initial_state: ResourceState::NonPixelShaderResource,
                ..Default::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn test_transition_to_same_state_is_silent() {
        let mut backend = RecordingBackend::new(8, 8, 2);
        let mut texture = mipped_texture(&mut backend);
        backend.reset_command_list(0).unwrap();
        texture.transition_to(&mut backend, ResourceState::NonPixelShaderResource);
        assert!(backend.barriers().is_empty());
    }

    #[test]
    fn test_mixed_states_converge_per_subresource() {
        let mut backend = RecordingBackend::new(8, 8, 2);
        let mut texture = mipped_texture(&mut backend);
        backend.reset_command_list(0).unwrap();

        texture.transition_subresource(&mut backend, Subresource::new(2, 1), ResourceState::CopyDest);
        assert_eq!(texture.state(), None);
        assert_eq!(texture.subresource_state(Subresource::new(2, 1)), ResourceState::CopyDest);

        texture.transition_to(&mut backend, ResourceState::PixelShaderResource);
        assert_eq!(texture.state(), Some(ResourceState::PixelShaderResource));
        // One barrier for the odd subresource, then one per remaining subresource
        assert_eq!(backend.barriers().len(), 1 + 8);
        assert!(backend.violations().is_empty());
        assert_eq!(
            backend.texture_states(texture.handle()).unwrap(),
            &[ResourceState::PixelShaderResource; 8]
        );
    }

    #[test]
    fn test_buffer_transition() {
        let mut backend = RecordingBackend::new(8, 8, 2);
        let mut buffer = TrackedBuffer::create(
            &mut backend,
            &BufferDescriptor {
                label: None,
                size: 64,
                usage: BufferUsage::VERTEX | BufferUsage::COPY_DST,
                initial_state: ResourceState::CopyDest,
            },
        )
        .unwrap();
        backend.reset_command_list(0).unwrap();
        buffer.transition_to(&mut backend, ResourceState::VertexAndConstantBuffer);
        buffer.transition_to(&mut backend, ResourceState::VertexAndConstantBuffer);
        assert_eq!(backend.barriers().len(), 1);
        assert_eq!(
            backend.buffer_state(buffer.handle()),
            Some(ResourceState::VertexAndConstantBuffer)
        );
        assert!(backend.violations().is_empty());
    }
}
