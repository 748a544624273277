//! Vulkan backend implementation using ash
//!
//! Maps the descriptor heap and root slot model onto Vulkan 1.3:
//! - Every pipeline shares one layout. Set 0 is a bindless descriptor set
//!   (sampled images, storage images, static samplers) and the push constant
//!   block holds [`MAX_ROOT_SLOTS`] root slots of 8 bytes. A constant buffer
//!   slot carries a buffer device address, a descriptor table slot carries an
//!   index into the bindless arrays.
//! - The shader-visible descriptor heap is that set. CPU-only heaps keep image
//!   views until they are copied into it.
//! - Render targets use dynamic rendering, begun at the first draw after
//!   they are bound.
//! - The frame fence is a timeline semaphore.

use crate::backend::traits::*;
use crate::backend::types::*;
use crate::config;
use ash::khr::{surface, swapchain};
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc};
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::collections::HashMap;
use std::ffi::CString;
use std::path::Path;
use std::sync::Arc;

/// Root slots every pipeline layout reserves in its push constant block
pub const MAX_ROOT_SLOTS: u32 = 16;

const SAMPLED_IMAGE_BINDING: u32 = 0;
const STORAGE_IMAGE_BINDING: u32 = 1;
const SAMPLER_BINDING: u32 = 2;

/// Vulkan backend implementation
pub struct VulkanBackend {
    _entry: ash::Entry,
    instance: ash::Instance,
    surface_fn: surface::Instance,
    swapchain_fn: swapchain::Device,
    surface: vk::SurfaceKHR,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
    graphics_queue: vk::Queue,
    allocator: Option<Arc<Mutex<Allocator>>>,
    sample_counts: vk::SampleCountFlags,

    // Swapchain
    swapchain: vk::SwapchainKHR,
    swapchain_format: vk::Format,
    swapchain_extent: vk::Extent2D,
    back_buffers: Vec<TextureHandle>,
    acquired_image: Option<u32>,
    acquire_wait_pending: bool,

    // Synchronization
    image_available_semaphore: vk::Semaphore,
    present_semaphores: [vk::Semaphore; 2],
    next_present_semaphore: usize,
    present_signal: Option<vk::Semaphore>,
    frame_fence: vk::Semaphore,

    // Command pool and buffers, one per frame slot
    command_pool: vk::CommandPool,
    command_buffers: Vec<vk::CommandBuffer>,
    list_state: ListState,
    rendering: RenderingState,
    pending_transitions: Vec<vk::ImageMemoryBarrier2<'static>>,

    // Bindless set shared by every pipeline
    descriptor_pool: vk::DescriptorPool,
    bindless_layout: vk::DescriptorSetLayout,
    bindless_set: vk::DescriptorSet,
    bindless_capacity: u32,
    pipeline_layout: vk::PipelineLayout,
    samplers: Vec<vk::Sampler>,
    visible_heap: Option<u64>,

    // Resource storage
    buffers: HashMap<u64, VkBuffer>,
    textures: HashMap<u64, VkTexture>,
    heaps: HashMap<u64, VkDescriptorHeap>,
    root_signatures: HashMap<u64, u32>,
    pipelines: HashMap<u64, VkPipeline>,

    // Handle counters
    next_buffer_id: u64,
    next_texture_id: u64,
    next_heap_id: u64,
    next_root_signature_id: u64,
    next_pipeline_id: u64,

    // VSync setting
    vsync: bool,
}

struct VkBuffer {
    buffer: vk::Buffer,
    allocation: Allocation,
    size: u64,
    address: u64,
}

struct VkTexture {
    image: vk::Image,
    /// `None` for swapchain images, which the swapchain owns.
    allocation: Option<Allocation>,
    format: vk::Format,
    uav_format: vk::Format,
    extent: vk::Extent2D,
    mip_levels: u32,
    array_layers: u32,
    bytes_per_pixel: u32,
    aspect: vk::ImageAspectFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ViewKind {
    RenderTarget { mip: u32, slice: u32 },
    DepthStencil,
    ShaderResource(ShaderResourceViewDesc),
    UnorderedAccess { mip: u32, slice: u32 },
}

struct VkView {
    texture: u64,
    view: vk::ImageView,
    kind: ViewKind,
    extent: vk::Extent2D,
}

struct VkDescriptorHeap {
    shader_visible: bool,
    slots: Vec<Option<VkView>>,
}

struct VkPipeline {
    pipeline: vk::Pipeline,
    bind_point: vk::PipelineBindPoint,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListState {
    Idle,
    Recording(usize),
    Closed(usize),
}

#[derive(Default)]
struct RenderingState {
    colors: Vec<(vk::ImageView, vk::Extent2D)>,
    depth: Option<(vk::ImageView, vk::Extent2D)>,
    active: bool,
}

/// Pipeline stages, access and image layout a resource state stands for
fn state_sync(state: ResourceState) -> (vk::PipelineStageFlags2, vk::AccessFlags2, vk::ImageLayout) {
    use vk::{AccessFlags2 as A, ImageLayout as L, PipelineStageFlags2 as S};
    match state {
        ResourceState::Common => (S::ALL_COMMANDS, A::MEMORY_READ | A::MEMORY_WRITE, L::GENERAL),
        ResourceState::VertexAndConstantBuffer => (S::ALL_COMMANDS, A::MEMORY_READ, L::GENERAL),
        ResourceState::IndexBuffer => (S::INDEX_INPUT, A::INDEX_READ, L::GENERAL),
        ResourceState::RenderTarget => (
            S::COLOR_ATTACHMENT_OUTPUT,
            A::COLOR_ATTACHMENT_READ | A::COLOR_ATTACHMENT_WRITE,
            L::COLOR_ATTACHMENT_OPTIMAL,
        ),
        ResourceState::UnorderedAccess => (
            S::COMPUTE_SHADER | S::CLEAR,
            A::SHADER_STORAGE_READ | A::SHADER_STORAGE_WRITE | A::TRANSFER_WRITE,
            L::GENERAL,
        ),
        ResourceState::DepthWrite => (
            S::EARLY_FRAGMENT_TESTS | S::LATE_FRAGMENT_TESTS,
            A::DEPTH_STENCIL_ATTACHMENT_READ | A::DEPTH_STENCIL_ATTACHMENT_WRITE,
            L::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        ),
        ResourceState::NonPixelShaderResource => (
            S::VERTEX_SHADER | S::COMPUTE_SHADER,
            A::SHADER_SAMPLED_READ,
            L::SHADER_READ_ONLY_OPTIMAL,
        ),
        ResourceState::PixelShaderResource => {
            (S::FRAGMENT_SHADER, A::SHADER_SAMPLED_READ, L::SHADER_READ_ONLY_OPTIMAL)
        }
        ResourceState::CopyDest => (S::COPY, A::TRANSFER_WRITE, L::TRANSFER_DST_OPTIMAL),
        ResourceState::CopySource => (S::COPY, A::TRANSFER_READ, L::TRANSFER_SRC_OPTIMAL),
        ResourceState::ResolveDest => (S::RESOLVE, A::TRANSFER_WRITE, L::TRANSFER_DST_OPTIMAL),
        ResourceState::ResolveSource => (S::RESOLVE, A::TRANSFER_READ, L::TRANSFER_SRC_OPTIMAL),
        ResourceState::Present => (S::NONE, A::NONE, L::PRESENT_SRC_KHR),
        ResourceState::GenericRead => (S::ALL_COMMANDS, A::MEMORY_READ, L::GENERAL),
    }
}

/// Highest sample count in `supported` that does not exceed `requested`
fn highest_sample_count(supported: vk::SampleCountFlags, requested: u32) -> u32 {
    [64, 32, 16, 8, 4, 2]
        .into_iter()
        .find(|&count| count <= requested && supported.contains(vk::SampleCountFlags::from_raw(count)))
        .unwrap_or(1)
}

fn mip_extent(extent: vk::Extent2D, mip: u32) -> vk::Extent2D {
    vk::Extent2D {
        width: (extent.width >> mip).max(1),
        height: (extent.height >> mip).max(1),
    }
}

fn subresource_range(
    aspect_mask: vk::ImageAspectFlags,
    subresource: Option<Subresource>,
) -> vk::ImageSubresourceRange {
    match subresource {
        Some(sub) => vk::ImageSubresourceRange {
            aspect_mask,
            base_mip_level: sub.mip,
            level_count: 1,
            base_array_layer: sub.slice,
            layer_count: 1,
        },
        None => vk::ImageSubresourceRange {
            aspect_mask,
            base_mip_level: 0,
            level_count: vk::REMAINING_MIP_LEVELS,
            base_array_layer: 0,
            layer_count: vk::REMAINING_ARRAY_LAYERS,
        },
    }
}

fn image_transition(
    image: vk::Image,
    range: vk::ImageSubresourceRange,
    before: Option<ResourceState>,
    after: ResourceState,
) -> vk::ImageMemoryBarrier2<'static> {
    let (src_stage, src_access, old_layout) = match before {
        Some(state) => state_sync(state),
        None => (vk::PipelineStageFlags2::NONE, vk::AccessFlags2::NONE, vk::ImageLayout::UNDEFINED),
    };
    let (dst_stage, dst_access, new_layout) = state_sync(after);
    vk::ImageMemoryBarrier2::default()
        .src_stage_mask(src_stage)
        .src_access_mask(src_access)
        .dst_stage_mask(dst_stage)
        .dst_access_mask(dst_access)
        .old_layout(old_layout)
        .new_layout(new_layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(range)
}

impl VulkanBackend {
    /// Create the instance, device, swapchain and bindless set for `window`
    pub fn new(window: Arc<winit::window::Window>, vsync: bool) -> BackendResult<Self> {
        unsafe {
            let entry = ash::Entry::load().map_err(|e| BackendError::InitializationFailed(e.to_string()))?;

            let app_info = vk::ApplicationInfo::default()
                .application_name(c"PBR IBL Viewer")
                .application_version(vk::make_api_version(0, 0, 1, 0))
                .engine_name(c"PBR IBL Engine")
                .engine_version(vk::make_api_version(0, 0, 1, 0))
                .api_version(vk::API_VERSION_1_3);

            let display_handle = window
                .display_handle()
                .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;
            let window_handle = window
                .window_handle()
                .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;

            let extensions = ash_window::enumerate_required_extensions(display_handle.as_raw())
                .map_err(|e| BackendError::InitializationFailed(e.to_string()))?
                .to_vec();

            let instance_info = vk::InstanceCreateInfo::default()
                .application_info(&app_info)
                .enabled_extension_names(&extensions);

            let instance = entry
                .create_instance(&instance_info, None)
                .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;

            // Create surface
            let surface_fn = surface::Instance::new(&entry, &instance);
            let surface = ash_window::create_surface(
                &entry,
                &instance,
                display_handle.as_raw(),
                window_handle.as_raw(),
                None,
            )
            .map_err(|e| BackendError::SurfaceCreationFailed(e.to_string()))?;

            let (physical_device, graphics_queue_family) =
                Self::pick_physical_device(&instance, &surface_fn, surface)?;

            let properties = instance.get_physical_device_properties(physical_device);
            let sample_counts = properties.limits.framebuffer_color_sample_counts
                & properties.limits.framebuffer_depth_sample_counts;
            log::info!(
                "Using {} (Vulkan {}.{})",
                properties
                    .device_name_as_c_str()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                vk::api_version_major(properties.api_version),
                vk::api_version_minor(properties.api_version)
            );

            let device = Self::create_device(&instance, physical_device, graphics_queue_family)?;
            let graphics_queue = device.get_device_queue(graphics_queue_family, 0);

            // Create allocator
            let allocator = Allocator::new(&AllocatorCreateDesc {
                instance: instance.clone(),
                device: device.clone(),
                physical_device,
                debug_settings: Default::default(),
                buffer_device_address: true,
                allocation_sizes: Default::default(),
            })
            .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;

            let swapchain_fn = swapchain::Device::new(&instance, &device);

            // Create command pool and one command buffer per frame slot
            let pool_info = vk::CommandPoolCreateInfo::default()
                .queue_family_index(graphics_queue_family)
                .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
            let command_pool = device
                .create_command_pool(&pool_info, None)
                .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;

            let alloc_info = vk::CommandBufferAllocateInfo::default()
                .command_pool(command_pool)
                .level(vk::CommandBufferLevel::PRIMARY)
                .command_buffer_count(config::FRAME_COUNT as u32);
            let command_buffers = device
                .allocate_command_buffers(&alloc_info)
                .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;

            // Create synchronization objects
            let semaphore_info = vk::SemaphoreCreateInfo::default();
            let binary_semaphore = || {
                device
                    .create_semaphore(&semaphore_info, None)
                    .map_err(|e| BackendError::InitializationFailed(e.to_string()))
            };
            let image_available_semaphore = binary_semaphore()?;
            let present_semaphores = [binary_semaphore()?, binary_semaphore()?];

            let mut timeline_info = vk::SemaphoreTypeCreateInfo::default()
                .semaphore_type(vk::SemaphoreType::TIMELINE)
                .initial_value(0);
            let frame_fence = device
                .create_semaphore(&vk::SemaphoreCreateInfo::default().push_next(&mut timeline_info), None)
                .map_err(|e| BackendError::FenceFailed(e.to_string()))?;

            let samplers = Self::create_samplers(&device)?;
            let bindless_capacity = config::GPU_SRV_HEAP_CAPACITY;
            let (bindless_layout, descriptor_pool, bindless_set) =
                Self::create_bindless_set(&device, &samplers, bindless_capacity)?;

            let push_constants = [vk::PushConstantRange {
                stage_flags: vk::ShaderStageFlags::ALL,
                offset: 0,
                size: MAX_ROOT_SLOTS * crate::pipeline::shader::ROOT_SLOT_SIZE,
            }];
            let set_layouts = [bindless_layout];
            let layout_info = vk::PipelineLayoutCreateInfo::default()
                .set_layouts(&set_layouts)
                .push_constant_ranges(&push_constants);
            let pipeline_layout = device
                .create_pipeline_layout(&layout_info, None)
                .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;

            let mut backend = Self {
                _entry: entry,
                instance,
                surface_fn,
                swapchain_fn,
                surface,
                physical_device,
                device,
                graphics_queue,
                allocator: Some(Arc::new(Mutex::new(allocator))),
                sample_counts,
                swapchain: vk::SwapchainKHR::null(),
                swapchain_format: vk::Format::R8G8B8A8_UNORM,
                swapchain_extent: vk::Extent2D { width: 0, height: 0 },
                back_buffers: Vec::new(),
                acquired_image: None,
                acquire_wait_pending: false,
                image_available_semaphore,
                present_semaphores,
                next_present_semaphore: 0,
                present_signal: None,
                frame_fence,
                command_pool,
                command_buffers,
                list_state: ListState::Idle,
                rendering: RenderingState::default(),
                pending_transitions: Vec::new(),
                descriptor_pool,
                bindless_layout,
                bindless_set,
                bindless_capacity,
                pipeline_layout,
                samplers,
                visible_heap: None,
                buffers: HashMap::new(),
                textures: HashMap::new(),
                heaps: HashMap::new(),
                root_signatures: HashMap::new(),
                pipelines: HashMap::new(),
                next_buffer_id: 1,
                next_texture_id: 1,
                next_heap_id: 1,
                next_root_signature_id: 1,
                next_pipeline_id: 1,
                vsync,
            };

            let size = window.inner_size();
            backend.create_swapchain(size.width.max(1), size.height.max(1))?;

            Ok(backend)
        }
    }

    /// Get the Vulkan device
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// Get the swapchain format (Vulkan format)
    pub fn vk_swapchain_format(&self) -> vk::Format {
        self.swapchain_format
    }

    fn convert_format(format: TextureFormat) -> vk::Format {
        match format {
            TextureFormat::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
            TextureFormat::Rgba8UnormSrgb => vk::Format::R8G8B8A8_SRGB,
            TextureFormat::R16Float => vk::Format::R16_SFLOAT,
            TextureFormat::Rg16Float => vk::Format::R16G16_SFLOAT,
            TextureFormat::Rgba16Float => vk::Format::R16G16B16A16_SFLOAT,
            TextureFormat::R32Float => vk::Format::R32_SFLOAT,
            TextureFormat::Rg32Float => vk::Format::R32G32_SFLOAT,
            TextureFormat::Rgba32Float => vk::Format::R32G32B32A32_SFLOAT,
            TextureFormat::R32Uint => vk::Format::R32_UINT,
            TextureFormat::Rg32Uint => vk::Format::R32G32_UINT,
            TextureFormat::Rgba32Uint => vk::Format::R32G32B32A32_UINT,
            TextureFormat::Depth32Float => vk::Format::D32_SFLOAT,
        }
    }

    fn convert_compare_op(func: CompareFunction) -> vk::CompareOp {
        match func {
            CompareFunction::Never => vk::CompareOp::NEVER,
            CompareFunction::Less => vk::CompareOp::LESS,
            CompareFunction::LessEqual => vk::CompareOp::LESS_OR_EQUAL,
            CompareFunction::Always => vk::CompareOp::ALWAYS,
        }
    }

    fn convert_cull_mode(mode: CullMode) -> vk::CullModeFlags {
        match mode {
            CullMode::None => vk::CullModeFlags::NONE,
            CullMode::Front => vk::CullModeFlags::FRONT,
            CullMode::Back => vk::CullModeFlags::BACK,
        }
    }

    fn convert_vertex_format(format: VertexFormat) -> vk::Format {
        match format {
            VertexFormat::Float32x2 => vk::Format::R32G32_SFLOAT,
            VertexFormat::Float32x3 => vk::Format::R32G32B32_SFLOAT,
        }
    }

    /// Color attachment format of a pipeline. The back buffer format follows
    /// whatever the surface offered.
    fn attachment_format(&self, format: TextureFormat) -> vk::Format {
        if format == config::BACK_BUFFER_FORMAT {
            self.swapchain_format
        } else {
            Self::convert_format(format)
        }
    }

    fn find_queue_family(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        surface_fn: &surface::Instance,
        surface: vk::SurfaceKHR,
    ) -> Option<u32> {
        let queue_families = unsafe { instance.get_physical_device_queue_family_properties(physical_device) };

        for (index, family) in queue_families.iter().enumerate() {
            let supports_work = family
                .queue_flags
                .contains(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE);
            let supports_surface = unsafe {
                surface_fn
                    .get_physical_device_surface_support(physical_device, index as u32, surface)
                    .unwrap_or(false)
            };

            if supports_work && supports_surface {
                return Some(index as u32);
            }
        }
        None
    }

    /// First Vulkan 1.3 device that can present, discrete GPUs first
    fn pick_physical_device(
        instance: &ash::Instance,
        surface_fn: &surface::Instance,
        surface: vk::SurfaceKHR,
    ) -> BackendResult<(vk::PhysicalDevice, u32)> {
        let physical_devices = unsafe { instance.enumerate_physical_devices() }
            .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;

        let mut candidates: Vec<(vk::PhysicalDevice, u32, bool)> = physical_devices
            .into_iter()
            .filter_map(|pd| {
                let properties = unsafe { instance.get_physical_device_properties(pd) };
                if properties.api_version < vk::API_VERSION_1_3 {
                    return None;
                }
                let family = Self::find_queue_family(instance, pd, surface_fn, surface)?;
                Some((pd, family, properties.device_type == vk::PhysicalDeviceType::DISCRETE_GPU))
            })
            .collect();
        candidates.sort_by_key(|&(_, _, discrete)| !discrete);

        candidates
            .first()
            .map(|&(pd, family, _)| (pd, family))
            .ok_or_else(|| BackendError::InitializationFailed("No Vulkan 1.3 device can present to the window".into()))
    }

    fn create_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        queue_family: u32,
    ) -> BackendResult<ash::Device> {
        let queue_priorities = [1.0f32];
        let queue_infos = [vk::DeviceQueueCreateInfo::default()
            .queue_family_index(queue_family)
            .queue_priorities(&queue_priorities)];

        let device_extensions = [swapchain::NAME.as_ptr()];
        let features = vk::PhysicalDeviceFeatures::default().shader_int64(true);
        let mut features12 = vk::PhysicalDeviceVulkan12Features::default()
            .timeline_semaphore(true)
            .buffer_device_address(true)
            .descriptor_indexing(true)
            .runtime_descriptor_array(true)
            .descriptor_binding_partially_bound(true)
            .descriptor_binding_sampled_image_update_after_bind(true)
            .descriptor_binding_storage_image_update_after_bind(true)
            .shader_sampled_image_array_non_uniform_indexing(true)
            .shader_storage_image_array_non_uniform_indexing(true);
        let mut features13 = vk::PhysicalDeviceVulkan13Features::default()
            .dynamic_rendering(true)
            .synchronization2(true);

        let device_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&device_extensions)
            .enabled_features(&features)
            .push_next(&mut features12)
            .push_next(&mut features13);

        unsafe { instance.create_device(physical_device, &device_info, None) }
            .map_err(|e| BackendError::DeviceCreationFailed(e.to_string()))
    }

    /// Static samplers: linear wrap, then linear clamp
    fn create_samplers(device: &ash::Device) -> BackendResult<Vec<vk::Sampler>> {
        [vk::SamplerAddressMode::REPEAT, vk::SamplerAddressMode::CLAMP_TO_EDGE]
            .into_iter()
            .map(|address_mode| {
                let info = vk::SamplerCreateInfo::default()
                    .mag_filter(vk::Filter::LINEAR)
                    .min_filter(vk::Filter::LINEAR)
                    .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
                    .address_mode_u(address_mode)
                    .address_mode_v(address_mode)
                    .address_mode_w(address_mode)
                    .max_lod(vk::LOD_CLAMP_NONE);
                unsafe { device.create_sampler(&info, None) }
                    .map_err(|e| BackendError::InitializationFailed(e.to_string()))
            })
            .collect()
    }

    fn create_bindless_set(
        device: &ash::Device,
        samplers: &[vk::Sampler],
        capacity: u32,
    ) -> BackendResult<(vk::DescriptorSetLayout, vk::DescriptorPool, vk::DescriptorSet)> {
        let failed = |e: vk::Result| BackendError::DescriptorHeapCreationFailed(e.to_string());

        let bindings = [
            vk::DescriptorSetLayoutBinding::default()
                .binding(SAMPLED_IMAGE_BINDING)
                .descriptor_type(vk::DescriptorType::SAMPLED_IMAGE)
                .descriptor_count(capacity)
                .stage_flags(vk::ShaderStageFlags::ALL),
            vk::DescriptorSetLayoutBinding::default()
                .binding(STORAGE_IMAGE_BINDING)
                .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
                .descriptor_count(capacity)
                .stage_flags(vk::ShaderStageFlags::ALL),
            vk::DescriptorSetLayoutBinding::default()
                .binding(SAMPLER_BINDING)
                .descriptor_type(vk::DescriptorType::SAMPLER)
                .descriptor_count(samplers.len() as u32)
                .stage_flags(vk::ShaderStageFlags::ALL)
                .immutable_samplers(samplers),
        ];
        let bindless = vk::DescriptorBindingFlags::PARTIALLY_BOUND | vk::DescriptorBindingFlags::UPDATE_AFTER_BIND;
        let binding_flags = [bindless, bindless, vk::DescriptorBindingFlags::empty()];
        let mut flags_info = vk::DescriptorSetLayoutBindingFlagsCreateInfo::default().binding_flags(&binding_flags);
        let layout_info = vk::DescriptorSetLayoutCreateInfo::default()
            .flags(vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL)
            .bindings(&bindings)
            .push_next(&mut flags_info);

        unsafe {
            let layout = device.create_descriptor_set_layout(&layout_info, None).map_err(failed)?;

            let pool_sizes = [
                vk::DescriptorPoolSize {
                    ty: vk::DescriptorType::SAMPLED_IMAGE,
                    descriptor_count: capacity,
                },
                vk::DescriptorPoolSize {
                    ty: vk::DescriptorType::STORAGE_IMAGE,
                    descriptor_count: capacity,
                },
                vk::DescriptorPoolSize {
                    ty: vk::DescriptorType::SAMPLER,
                    descriptor_count: samplers.len() as u32,
                },
            ];
            let pool_info = vk::DescriptorPoolCreateInfo::default()
                .flags(vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND)
                .max_sets(1)
                .pool_sizes(&pool_sizes);
            let pool = device.create_descriptor_pool(&pool_info, None).map_err(failed)?;

            let set_layouts = [layout];
            let alloc_info = vk::DescriptorSetAllocateInfo::default()
                .descriptor_pool(pool)
                .set_layouts(&set_layouts);
            let set = device.allocate_descriptor_sets(&alloc_info).map_err(failed)?[0];

            Ok((layout, pool, set))
        }
    }

    fn create_swapchain(&mut self, width: u32, height: u32) -> BackendResult<()> {
        unsafe {
            let capabilities = self
                .surface_fn
                .get_physical_device_surface_capabilities(self.physical_device, self.surface)
                .map_err(|e| BackendError::SwapchainCreationFailed(e.to_string()))?;

            let formats = self
                .surface_fn
                .get_physical_device_surface_formats(self.physical_device, self.surface)
                .map_err(|e| BackendError::SwapchainCreationFailed(e.to_string()))?;

            let present_modes = self
                .surface_fn
                .get_physical_device_surface_present_modes(self.physical_device, self.surface)
                .map_err(|e| BackendError::SwapchainCreationFailed(e.to_string()))?;

            // Tone mapping writes display-encoded values, so the surface must not re-encode
            let format = [vk::Format::R8G8B8A8_UNORM, vk::Format::B8G8R8A8_UNORM]
                .iter()
                .find_map(|&wanted| formats.iter().find(|f| f.format == wanted))
                .or_else(|| formats.first())
                .copied()
                .ok_or_else(|| BackendError::SwapchainCreationFailed("Surface reports no formats".into()))?;
            if format.format != vk::Format::R8G8B8A8_UNORM {
                log::warn!("Surface has no R8G8B8A8_UNORM format, presenting as {:?}", format.format);
            }

            // Choose present mode
            let present_mode = if self.vsync {
                vk::PresentModeKHR::FIFO
            } else {
                present_modes
                    .iter()
                    .copied()
                    .find(|&m| m == vk::PresentModeKHR::MAILBOX)
                    .unwrap_or(vk::PresentModeKHR::FIFO)
            };

            // Choose extent
            let extent = if capabilities.current_extent.width != u32::MAX {
                capabilities.current_extent
            } else {
                vk::Extent2D {
                    width: width.clamp(capabilities.min_image_extent.width, capabilities.max_image_extent.width),
                    height: height.clamp(capabilities.min_image_extent.height, capabilities.max_image_extent.height),
                }
            };

            let max_images = if capabilities.max_image_count > 0 {
                capabilities.max_image_count
            } else {
                u32::MAX
            };
            let image_count = capabilities
                .min_image_count
                .max(config::FRAME_COUNT as u32)
                .min(max_images);

            let swapchain_info = vk::SwapchainCreateInfoKHR::default()
                .surface(self.surface)
                .min_image_count(image_count)
                .image_format(format.format)
                .image_color_space(format.color_space)
                .image_extent(extent)
                .image_array_layers(1)
                .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
                .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
                .pre_transform(capabilities.current_transform)
                .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
                .present_mode(present_mode)
                .clipped(true);

            self.swapchain = self
                .swapchain_fn
                .create_swapchain(&swapchain_info, None)
                .map_err(|e| BackendError::SwapchainCreationFailed(e.to_string()))?;

            let images = self
                .swapchain_fn
                .get_swapchain_images(self.swapchain)
                .map_err(|e| BackendError::SwapchainCreationFailed(e.to_string()))?;

            self.swapchain_format = format.format;
            self.swapchain_extent = extent;

            // Swapchain images are exposed as textures that start in the present state
            self.back_buffers = images
                .into_iter()
                .map(|image| {
                    self.pending_transitions.push(image_transition(
                        image,
                        subresource_range(vk::ImageAspectFlags::COLOR, None),
                        None,
                        ResourceState::Present,
                    ));
                    self.insert_texture(VkTexture {
                        image,
                        allocation: None,
                        format: format.format,
                        uav_format: format.format,
                        extent,
                        mip_levels: 1,
                        array_layers: 1,
                        bytes_per_pixel: 4,
                        aspect: vk::ImageAspectFlags::COLOR,
                    })
                })
                .collect();

            log::info!(
                "Created swapchain: {}x{}, {} images, {:?}",
                extent.width,
                extent.height,
                self.back_buffers.len(),
                present_mode
            );
            Ok(())
        }
    }

    fn insert_texture(&mut self, texture: VkTexture) -> TextureHandle {
        let id = self.next_texture_id;
        self.next_texture_id += 1;
        self.textures.insert(id, texture);
        TextureHandle(id)
    }

    fn allocate(
        &self,
        name: &str,
        requirements: vk::MemoryRequirements,
        location: MemoryLocation,
        linear: bool,
    ) -> Result<Allocation, String> {
        self.allocator
            .as_ref()
            .ok_or_else(|| "Allocator not available".to_string())?
            .lock()
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location,
                linear,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|e| e.to_string())
    }

    fn free(&self, allocation: Allocation) {
        if let Some(allocator) = &self.allocator {
            if let Err(e) = allocator.lock().free(allocation) {
                log::warn!("Failed to free GPU allocation: {e}");
            }
        }
    }

    /// The open command buffer, or `None` (logged) outside of recording
    fn recording(&self, operation: &str) -> Option<vk::CommandBuffer> {
        match self.list_state {
            ListState::Recording(slot) => Some(self.command_buffers[slot]),
            _ => {
                log::error!("{operation} recorded outside of an open command list");
                None
            }
        }
    }

    fn end_rendering(&mut self) {
        if !self.rendering.active {
            return;
        }
        if let ListState::Recording(slot) = self.list_state {
            unsafe { self.device.cmd_end_rendering(self.command_buffers[slot]) };
        }
        self.rendering.active = false;
    }

    fn begin_rendering(
        &self,
        cmd: vk::CommandBuffer,
        colors: &[(vk::ImageView, vk::Extent2D)],
        depth: Option<(vk::ImageView, vk::Extent2D)>,
        clear_color: Option<[f32; 4]>,
        clear_depth: Option<f32>,
    ) {
        let load_op = |clear: bool| {
            if clear {
                vk::AttachmentLoadOp::CLEAR
            } else {
                vk::AttachmentLoadOp::LOAD
            }
        };

        let color_attachments: Vec<vk::RenderingAttachmentInfo> = colors
            .iter()
            .map(|&(view, _)| {
                vk::RenderingAttachmentInfo::default()
                    .image_view(view)
                    .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                    .load_op(load_op(clear_color.is_some()))
                    .store_op(vk::AttachmentStoreOp::STORE)
                    .clear_value(vk::ClearValue {
                        color: vk::ClearColorValue {
                            float32: clear_color.unwrap_or_default(),
                        },
                    })
            })
            .collect();
        let depth_attachment = depth.map(|(view, _)| {
            vk::RenderingAttachmentInfo::default()
                .image_view(view)
                .image_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
                .load_op(load_op(clear_depth.is_some()))
                .store_op(vk::AttachmentStoreOp::STORE)
                .clear_value(vk::ClearValue {
                    depth_stencil: vk::ClearDepthStencilValue {
                        depth: clear_depth.unwrap_or(1.0),
                        stencil: 0,
                    },
                })
        });

        let extent = colors
            .iter()
            .chain(depth.iter())
            .map(|&(_, extent)| extent)
            .reduce(|a, b| vk::Extent2D {
                width: a.width.min(b.width),
                height: a.height.min(b.height),
            })
            .unwrap_or_default();

        let mut info = vk::RenderingInfo::default()
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            })
            .layer_count(1)
            .color_attachments(&color_attachments);
        if let Some(depth_attachment) = depth_attachment.as_ref() {
            info = info.depth_attachment(depth_attachment);
        }

        unsafe { self.device.cmd_begin_rendering(cmd, &info) };
    }

    fn ensure_rendering(&mut self, cmd: vk::CommandBuffer) {
        if self.rendering.active {
            return;
        }
        let colors = self.rendering.colors.clone();
        self.begin_rendering(cmd, &colors, self.rendering.depth, None, None);
        self.rendering.active = true;
    }

    /// Record or queue `barriers` for a freshly created texture
    fn transition_new_texture(&mut self, barrier: vk::ImageMemoryBarrier2<'static>) {
        match self.list_state {
            ListState::Recording(slot) => {
                self.end_rendering();
                let barriers = [barrier];
                let dependency = vk::DependencyInfo::default().image_memory_barriers(&barriers);
                unsafe { self.device.cmd_pipeline_barrier2(self.command_buffers[slot], &dependency) };
            }
            _ => self.pending_transitions.push(barrier),
        }
    }

    fn create_view(&self, texture: u64, kind: ViewKind) -> BackendResult<VkView> {
        let tex = self
            .textures
            .get(&texture)
            .ok_or_else(|| BackendError::InvalidHandle(format!("texture {texture}")))?;

        let single = |mip: u32, slice: u32| vk::ImageSubresourceRange {
            aspect_mask: tex.aspect,
            base_mip_level: mip,
            level_count: 1,
            base_array_layer: slice,
            layer_count: 1,
        };

        let (view_type, format, range) = match kind {
            ViewKind::RenderTarget { mip, slice } => (vk::ImageViewType::TYPE_2D, tex.format, single(mip, slice)),
            ViewKind::DepthStencil => (vk::ImageViewType::TYPE_2D, tex.format, single(0, 0)),
            ViewKind::UnorderedAccess { mip, slice } => {
                (vk::ImageViewType::TYPE_2D, tex.uav_format, single(mip, slice))
            }
            ViewKind::ShaderResource(desc) => {
                let (view_type, layer_count) = match desc.dimension {
                    ViewDimension::Texture2D => (vk::ImageViewType::TYPE_2D, 1),
                    ViewDimension::Texture2DArray => (vk::ImageViewType::TYPE_2D_ARRAY, tex.array_layers),
                    ViewDimension::TextureCube => (vk::ImageViewType::CUBE, 6),
                };
                let range = vk::ImageSubresourceRange {
                    aspect_mask: tex.aspect,
                    base_mip_level: desc.most_detailed_mip,
                    level_count: desc
                        .mip_levels
                        .unwrap_or(tex.mip_levels.saturating_sub(desc.most_detailed_mip).max(1)),
                    base_array_layer: 0,
                    layer_count,
                };
                (view_type, tex.format, range)
            }
        };

        let view_info = vk::ImageViewCreateInfo::default()
            .image(tex.image)
            .view_type(view_type)
            .format(format)
            .subresource_range(range);

        let view = unsafe { self.device.create_image_view(&view_info, None) }
            .map_err(|e| BackendError::TextureCreationFailed(e.to_string()))?;

        Ok(VkView {
            texture,
            view,
            kind,
            extent: mip_extent(tex.extent, range.base_mip_level),
        })
    }

    /// Point bindless slot `index` at `view`
    fn write_bindless(&self, index: u32, view: &VkView) -> BackendResult<()> {
        if index >= self.bindless_capacity {
            return Err(BackendError::InvalidHandle(format!(
                "bindless slot {index} exceeds capacity {}",
                self.bindless_capacity
            )));
        }
        let (binding, descriptor_type, layout) = match view.kind {
            ViewKind::ShaderResource(_) => (
                SAMPLED_IMAGE_BINDING,
                vk::DescriptorType::SAMPLED_IMAGE,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            ),
            ViewKind::UnorderedAccess { .. } => (
                STORAGE_IMAGE_BINDING,
                vk::DescriptorType::STORAGE_IMAGE,
                vk::ImageLayout::GENERAL,
            ),
            kind => {
                return Err(BackendError::InvalidHandle(format!(
                    "{kind:?} views cannot live in the shader-visible heap"
                )))
            }
        };

        let image_info = [vk::DescriptorImageInfo::default()
            .image_view(view.view)
            .image_layout(layout)];
        let write = vk::WriteDescriptorSet::default()
            .dst_set(self.bindless_set)
            .dst_binding(binding)
            .dst_array_element(index)
            .descriptor_type(descriptor_type)
            .image_info(&image_info);
        unsafe { self.device.update_descriptor_sets(&[write], &[]) };
        Ok(())
    }

    /// Store `view` in a heap slot, destroying the view it replaces
    fn write_descriptor(&mut self, dest: CpuDescriptor, view: VkView) -> BackendResult<()> {
        let visible = match self.heaps.get(&dest.heap.0) {
            Some(heap) if (dest.index as usize) < heap.slots.len() => heap.shader_visible,
            _ => {
                unsafe { self.device.destroy_image_view(view.view, None) };
                return Err(BackendError::InvalidHandle(format!("descriptor {dest:?}")));
            }
        };
        if visible {
            if let Err(e) = self.write_bindless(dest.index, &view) {
                unsafe { self.device.destroy_image_view(view.view, None) };
                return Err(e);
            }
        }

        if let Some(heap) = self.heaps.get_mut(&dest.heap.0) {
            if let Some(old) = heap.slots[dest.index as usize].replace(view) {
                unsafe { self.device.destroy_image_view(old.view, None) };
            }
        }
        Ok(())
    }

    fn view_at(&self, heap: DescriptorHeapHandle, index: u32) -> Option<&VkView> {
        self.heaps
            .get(&heap.0)
            .and_then(|h| h.slots.get(index as usize))
            .and_then(Option::as_ref)
    }

    fn render_target_view(&self, handle: CpuDescriptor) -> Option<(vk::ImageView, vk::Extent2D)> {
        self.view_at(handle.heap, handle.index).map(|v| (v.view, v.extent))
    }

    fn push_root_slot(&self, slot: u32, value: u64) {
        let Some(cmd) = self.recording("root slot binding") else {
            return;
        };
        if slot >= MAX_ROOT_SLOTS {
            log::error!("Root slot {slot} exceeds the {MAX_ROOT_SLOTS} slot push constant block");
            return;
        }
        unsafe {
            self.device.cmd_push_constants(
                cmd,
                self.pipeline_layout,
                vk::ShaderStageFlags::ALL,
                slot * crate::pipeline::shader::ROOT_SLOT_SIZE,
                &value.to_le_bytes(),
            );
        }
    }

    fn create_shader_module(&self, code: &[u8], label: &str) -> BackendResult<(vk::ShaderModule, CString)> {
        let failed = |e: String| BackendError::PipelineCreationFailed(format!("{label}: {e}"));
        let words = ash::util::read_spv(&mut std::io::Cursor::new(code)).map_err(|e| failed(e.to_string()))?;
        let entry_point = crate::pipeline::shader::reflect(code, Path::new(label))
            .ok()
            .and_then(|reflection| reflection.entry_point)
            .unwrap_or_else(|| "main".to_string());
        let entry_point = CString::new(entry_point).map_err(|e| failed(e.to_string()))?;

        let info = vk::ShaderModuleCreateInfo::default().code(&words);
        let module =
            unsafe { self.device.create_shader_module(&info, None) }.map_err(|e| failed(e.to_string()))?;
        Ok((module, entry_point))
    }

    fn insert_pipeline(&mut self, pipeline: vk::Pipeline, bind_point: vk::PipelineBindPoint) -> PipelineHandle {
        let id = self.next_pipeline_id;
        self.next_pipeline_id += 1;
        self.pipelines.insert(id, VkPipeline { pipeline, bind_point });
        PipelineHandle(id)
    }

    fn check_root_signature(&self, handle: RootSignatureHandle) -> BackendResult<()> {
        if self.root_signatures.contains_key(&handle.0) {
            Ok(())
        } else {
            Err(BackendError::InvalidHandle(format!("{handle:?}")))
        }
    }
}

impl GraphicsBackend for VulkanBackend {
    fn back_buffer_count(&self) -> u32 {
        self.back_buffers.len() as u32
    }

    fn back_buffer(&self, index: u32) -> TextureHandle {
        // Handle 0 is never allocated, so a bad index surfaces as an invalid handle
        self.back_buffers
            .get(index as usize)
            .copied()
            .unwrap_or(TextureHandle(0))
    }

    fn current_back_buffer_index(&mut self) -> BackendResult<u32> {
        if let Some(index) = self.acquired_image {
            return Ok(index);
        }

        let (index, suboptimal) = unsafe {
            self.swapchain_fn.acquire_next_image(
                self.swapchain,
                u64::MAX,
                self.image_available_semaphore,
                vk::Fence::null(),
            )
        }
        .map_err(|e| BackendError::AcquireImageFailed(e.to_string()))?;
        if suboptimal {
            log::warn!("Swapchain is suboptimal for the surface");
        }

        self.acquired_image = Some(index);
        self.acquire_wait_pending = true;
        Ok(index)
    }

    fn surface_size(&self) -> (u32, u32) {
        (self.swapchain_extent.width, self.swapchain_extent.height)
    }

    fn present(&mut self) -> BackendResult<()> {
        let index = self
            .acquired_image
            .take()
            .ok_or_else(|| BackendError::PresentFailed("No swapchain image was acquired".into()))?;

        let wait_semaphores: Vec<vk::Semaphore> = self.present_signal.take().into_iter().collect();
        let swapchains = [self.swapchain];
        let image_indices = [index];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        match unsafe { self.swapchain_fn.queue_present(self.graphics_queue, &present_info) } {
            Ok(false) => Ok(()),
            Ok(true) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                log::warn!("Swapchain no longer matches the surface");
                Ok(())
            }
            Err(vk::Result::ERROR_DEVICE_LOST) => Err(BackendError::DeviceLost),
            Err(e) => Err(BackendError::PresentFailed(e.to_string())),
        }
    }

    fn supported_sample_count(&self, requested: u32) -> u32 {
        highest_sample_count(self.sample_counts, requested)
    }

    fn create_texture(&mut self, desc: &TextureDescriptor) -> BackendResult<TextureHandle> {
        let format = Self::convert_format(desc.format);
        let uav_format = Self::convert_format(desc.format.uav_compatible());
        let is_depth = desc.format.is_depth();

        let mut usage = vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::TRANSFER_DST;
        if desc.usage.contains(TextureUsage::TEXTURE_BINDING) {
            usage |= vk::ImageUsageFlags::SAMPLED;
        }
        if desc.usage.contains(TextureUsage::STORAGE_BINDING) {
            usage |= vk::ImageUsageFlags::STORAGE;
        }
        if desc.usage.contains(TextureUsage::RENDER_ATTACHMENT) {
            if is_depth {
                usage |= vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT;
            } else {
                usage |= vk::ImageUsageFlags::COLOR_ATTACHMENT;
            }
        }

        let mut flags = vk::ImageCreateFlags::empty();
        if desc.cube_compatible {
            flags |= vk::ImageCreateFlags::CUBE_COMPATIBLE;
        }
        if usage.contains(vk::ImageUsageFlags::STORAGE) && uav_format != format {
            flags |= vk::ImageCreateFlags::MUTABLE_FORMAT | vk::ImageCreateFlags::EXTENDED_USAGE;
        }

        let extent = vk::Extent2D {
            width: desc.width,
            height: desc.height,
        };
        let image_info = vk::ImageCreateInfo::default()
            .flags(flags)
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(vk::Extent3D {
                width: desc.width,
                height: desc.height,
                depth: 1,
            })
            .mip_levels(desc.mip_levels)
            .array_layers(desc.array_layers)
            .samples(vk::SampleCountFlags::from_raw(desc.sample_count.max(1)))
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let image = unsafe { self.device.create_image(&image_info, None) }
            .map_err(|e| BackendError::TextureCreationFailed(e.to_string()))?;
        let requirements = unsafe { self.device.get_image_memory_requirements(image) };

        let allocation = match self.allocate(
            desc.label.as_deref().unwrap_or("texture"),
            requirements,
            MemoryLocation::GpuOnly,
            false,
        ) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_image(image, None) };
                return Err(BackendError::TextureCreationFailed(e));
            }
        };

        unsafe { self.device.bind_image_memory(image, allocation.memory(), allocation.offset()) }
            .map_err(|e| BackendError::TextureCreationFailed(e.to_string()))?;

        let aspect = if is_depth {
            vk::ImageAspectFlags::DEPTH
        } else {
            vk::ImageAspectFlags::COLOR
        };
        self.transition_new_texture(image_transition(
            image,
            subresource_range(aspect, None),
            None,
            desc.initial_state,
        ));

        Ok(self.insert_texture(VkTexture {
            image,
            allocation: Some(allocation),
            format,
            uav_format,
            extent,
            mip_levels: desc.mip_levels,
            array_layers: desc.array_layers,
            bytes_per_pixel: desc.format.bytes_per_pixel(),
            aspect,
        }))
    }

    fn destroy_texture(&mut self, texture: TextureHandle) {
        if let Some(vk_texture) = self.textures.remove(&texture.0) {
            if let Some(allocation) = vk_texture.allocation {
                unsafe { self.device.destroy_image(vk_texture.image, None) };
                self.free(allocation);
            }
        }
    }

    fn create_buffer(&mut self, desc: &BufferDescriptor) -> BackendResult<BufferHandle> {
        let mut usage = vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS;
        if desc.usage.contains(BufferUsage::VERTEX) {
            usage |= vk::BufferUsageFlags::VERTEX_BUFFER;
        }
        if desc.usage.contains(BufferUsage::INDEX) {
            usage |= vk::BufferUsageFlags::INDEX_BUFFER;
        }
        if desc.usage.contains(BufferUsage::UNIFORM) || desc.usage.contains(BufferUsage::MAP_WRITE) {
            usage |= vk::BufferUsageFlags::UNIFORM_BUFFER;
        }
        if desc.usage.contains(BufferUsage::COPY_SRC) || desc.usage.contains(BufferUsage::MAP_WRITE) {
            usage |= vk::BufferUsageFlags::TRANSFER_SRC;
        }
        if desc.usage.contains(BufferUsage::COPY_DST) {
            usage |= vk::BufferUsageFlags::TRANSFER_DST;
        }

        let buffer_info = vk::BufferCreateInfo::default()
            .size(desc.size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { self.device.create_buffer(&buffer_info, None) }
            .map_err(|e| BackendError::BufferCreationFailed(e.to_string()))?;
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let location = if desc.usage.contains(BufferUsage::MAP_WRITE) {
            MemoryLocation::CpuToGpu
        } else {
            MemoryLocation::GpuOnly
        };

        let allocation = match self.allocate(desc.label.as_deref().unwrap_or("buffer"), requirements, location, true) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(BackendError::BufferCreationFailed(e));
            }
        };

        let address = unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
                .map_err(|e| BackendError::BufferCreationFailed(e.to_string()))?;
            self.device
                .get_buffer_device_address(&vk::BufferDeviceAddressInfo::default().buffer(buffer))
        };

        let id = self.next_buffer_id;
        self.next_buffer_id += 1;
        self.buffers.insert(
            id,
            VkBuffer {
                buffer,
                allocation,
                size: desc.size,
                address,
            },
        );

        Ok(BufferHandle(id))
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        if let Some(vk_buffer) = self.buffers.remove(&buffer.0) {
            unsafe { self.device.destroy_buffer(vk_buffer.buffer, None) };
            self.free(vk_buffer.allocation);
        }
    }

    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) -> BackendResult<()> {
        let vk_buffer = self
            .buffers
            .get_mut(&buffer.0)
            .ok_or_else(|| BackendError::InvalidHandle(format!("{buffer:?}")))?;
        let size = vk_buffer.size;
        let mapped = vk_buffer
            .allocation
            .mapped_slice_mut()
            .ok_or_else(|| BackendError::InvalidHandle(format!("{buffer:?} is not host visible")))?;

        let start = offset as usize;
        let end = start + data.len();
        if end as u64 > size || end > mapped.len() {
            return Err(BackendError::InvalidHandle(format!(
                "write of {} bytes at {offset} overflows {buffer:?} ({size} bytes)",
                data.len()
            )));
        }
        mapped[start..end].copy_from_slice(data);
        Ok(())
    }

    fn buffer_gpu_address(&self, buffer: BufferHandle) -> u64 {
        self.buffers.get(&buffer.0).map_or(0, |b| b.address)
    }

    fn create_descriptor_heap(&mut self, desc: &DescriptorHeapDescriptor) -> BackendResult<DescriptorHeapHandle> {
        if desc.shader_visible {
            if desc.kind != DescriptorHeapKind::ShaderResource {
                return Err(BackendError::DescriptorHeapCreationFailed(format!(
                    "{:?} heaps cannot be shader visible",
                    desc.kind
                )));
            }
            if self.visible_heap.is_some() {
                return Err(BackendError::DescriptorHeapCreationFailed(
                    "only one shader-visible heap can exist".into(),
                ));
            }
            if desc.capacity > self.bindless_capacity {
                return Err(BackendError::DescriptorHeapCreationFailed(format!(
                    "capacity {} exceeds the bindless set ({})",
                    desc.capacity, self.bindless_capacity
                )));
            }
        }

        let id = self.next_heap_id;
        self.next_heap_id += 1;
        self.heaps.insert(
            id,
            VkDescriptorHeap {
                shader_visible: desc.shader_visible,
                slots: (0..desc.capacity).map(|_| None).collect(),
            },
        );
        if desc.shader_visible {
            self.visible_heap = Some(id);
        }
        log::debug!(
            "Created {:?} descriptor heap {} ({} slots)",
            desc.kind,
            desc.label.as_deref().unwrap_or("unnamed"),
            desc.capacity
        );

        Ok(DescriptorHeapHandle(id))
    }

    fn destroy_descriptor_heap(&mut self, heap: DescriptorHeapHandle) {
        if let Some(vk_heap) = self.heaps.remove(&heap.0) {
            for view in vk_heap.slots.into_iter().flatten() {
                unsafe { self.device.destroy_image_view(view.view, None) };
            }
        }
        if self.visible_heap == Some(heap.0) {
            self.visible_heap = None;
        }
    }

    fn create_render_target_view(
        &mut self,
        texture: TextureHandle,
        desc: &RenderTargetViewDesc,
        dest: CpuDescriptor,
    ) -> BackendResult<()> {
        let view = self.create_view(
            texture.0,
            ViewKind::RenderTarget {
                mip: desc.mip,
                slice: desc.slice,
            },
        )?;
        self.write_descriptor(dest, view)
    }

    fn create_depth_stencil_view(&mut self, texture: TextureHandle, dest: CpuDescriptor) -> BackendResult<()> {
        let view = self.create_view(texture.0, ViewKind::DepthStencil)?;
        self.write_descriptor(dest, view)
    }

    fn create_shader_resource_view(
        &mut self,
        texture: TextureHandle,
        desc: &ShaderResourceViewDesc,
        dest: CpuDescriptor,
    ) -> BackendResult<()> {
        let view = self.create_view(texture.0, ViewKind::ShaderResource(*desc))?;
        self.write_descriptor(dest, view)
    }

    fn create_unordered_access_view(
        &mut self,
        texture: TextureHandle,
        desc: &UnorderedAccessViewDesc,
        dest: CpuDescriptor,
    ) -> BackendResult<()> {
        let view = self.create_view(
            texture.0,
            ViewKind::UnorderedAccess {
                mip: desc.mip,
                slice: desc.slice,
            },
        )?;
        self.write_descriptor(dest, view)
    }

    fn copy_descriptors(&mut self, count: u32, dest: CpuDescriptor, src: CpuDescriptor) -> BackendResult<()> {
        for i in 0..count {
            let (texture, kind) = self
                .view_at(src.heap, src.index + i)
                .map(|view| (view.texture, view.kind))
                .ok_or_else(|| BackendError::InvalidHandle(format!("empty descriptor {:?}", src.offset(i))))?;
            let view = self.create_view(texture, kind)?;
            self.write_descriptor(dest.offset(i), view)?;
        }
        Ok(())
    }

    fn create_root_signature(&mut self, desc: &RootSignatureDesc) -> BackendResult<RootSignatureHandle> {
        let label = desc.label.as_deref().unwrap_or("root signature");
        if desc.root_slot_count > MAX_ROOT_SLOTS {
            return Err(BackendError::PipelineCreationFailed(format!(
                "{label}: {} root slots exceed the {MAX_ROOT_SLOTS} slot push constant block",
                desc.root_slot_count
            )));
        }
        if let Some(binding) = desc
            .bindings
            .iter()
            .find(|b| b.set != 0 || b.binding > SAMPLER_BINDING)
        {
            return Err(BackendError::PipelineCreationFailed(format!(
                "{label}: binding {}.{} is outside the bindless set",
                binding.set, binding.binding
            )));
        }

        let id = self.next_root_signature_id;
        self.next_root_signature_id += 1;
        self.root_signatures.insert(id, desc.root_slot_count);
        Ok(RootSignatureHandle(id))
    }

    fn create_graphics_pipeline(&mut self, desc: &GraphicsPipelineDesc) -> BackendResult<PipelineHandle> {
        self.check_root_signature(desc.root_signature)?;
        let label = desc.label.as_deref().unwrap_or("graphics pipeline");

        let (vertex_module, vertex_entry) = self.create_shader_module(&desc.vertex_shader, label)?;
        let (pixel_module, pixel_entry) = match self.create_shader_module(&desc.pixel_shader, label) {
            Ok(module) => module,
            Err(e) => {
                unsafe { self.device.destroy_shader_module(vertex_module, None) };
                return Err(e);
            }
        };

        let stages = [
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(vertex_module)
                .name(&vertex_entry),
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(pixel_module)
                .name(&pixel_entry),
        ];

        let vertex_bindings = [vk::VertexInputBindingDescription {
            binding: 0,
            stride: desc.vertex_layout.array_stride as u32,
            input_rate: vk::VertexInputRate::VERTEX,
        }];
        let vertex_attributes: Vec<vk::VertexInputAttributeDescription> = desc
            .vertex_layout
            .attributes
            .iter()
            .map(|attribute| vk::VertexInputAttributeDescription {
                location: attribute.location,
                binding: 0,
                format: Self::convert_vertex_format(attribute.format),
                offset: attribute.offset as u32,
            })
            .collect();
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&vertex_bindings)
            .vertex_attribute_descriptions(&vertex_attributes);

        let input_assembly =
            vk::PipelineInputAssemblyStateCreateInfo::default().topology(vk::PrimitiveTopology::TRIANGLE_LIST);
        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);
        // The viewport is flipped, so clockwise stays the front face
        let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .polygon_mode(vk::PolygonMode::FILL)
            .cull_mode(Self::convert_cull_mode(desc.cull_mode))
            .front_face(vk::FrontFace::CLOCKWISE)
            .line_width(1.0);
        let multisample = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(vk::SampleCountFlags::from_raw(desc.sample_count.max(1)));
        let depth_stencil = match &desc.depth_stencil {
            Some(state) => vk::PipelineDepthStencilStateCreateInfo::default()
                .depth_test_enable(state.depth_test_enabled)
                .depth_write_enable(state.depth_write_enabled)
                .depth_compare_op(Self::convert_compare_op(state.depth_compare)),
            None => vk::PipelineDepthStencilStateCreateInfo::default(),
        };
        let blend_attachments = [vk::PipelineColorBlendAttachmentState {
            blend_enable: vk::FALSE,
            color_write_mask: vk::ColorComponentFlags::RGBA,
            ..Default::default()
        }];
        let color_blend = vk::PipelineColorBlendStateCreateInfo::default().attachments(&blend_attachments);
        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state = vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let color_formats = [self.attachment_format(desc.color_format)];
        let depth_format = desc
            .depth_stencil
            .as_ref()
            .map_or(vk::Format::UNDEFINED, |state| Self::convert_format(state.format));
        let mut rendering = vk::PipelineRenderingCreateInfo::default()
            .color_attachment_formats(&color_formats)
            .depth_attachment_format(depth_format);

        let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blend)
            .dynamic_state(&dynamic_state)
            .layout(self.pipeline_layout)
            .push_next(&mut rendering);

        let result = unsafe {
            self.device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        };
        unsafe {
            self.device.destroy_shader_module(vertex_module, None);
            self.device.destroy_shader_module(pixel_module, None);
        }
        let pipeline = result
            .map_err(|(_, e)| BackendError::PipelineCreationFailed(format!("{label}: {e}")))?
            .into_iter()
            .next()
            .ok_or_else(|| BackendError::PipelineCreationFailed(format!("{label}: no pipeline returned")))?;

        Ok(self.insert_pipeline(pipeline, vk::PipelineBindPoint::GRAPHICS))
    }

    fn create_compute_pipeline(&mut self, desc: &ComputePipelineDesc) -> BackendResult<PipelineHandle> {
        self.check_root_signature(desc.root_signature)?;
        let label = desc.label.as_deref().unwrap_or("compute pipeline");

        let (module, entry) = self.create_shader_module(&desc.compute_shader, label)?;
        let stage = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(module)
            .name(&entry);
        let pipeline_info = vk::ComputePipelineCreateInfo::default()
            .stage(stage)
            .layout(self.pipeline_layout);

        let result = unsafe {
            self.device
                .create_compute_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        };
        unsafe { self.device.destroy_shader_module(module, None) };
        let pipeline = result
            .map_err(|(_, e)| BackendError::PipelineCreationFailed(format!("{label}: {e}")))?
            .into_iter()
            .next()
            .ok_or_else(|| BackendError::PipelineCreationFailed(format!("{label}: no pipeline returned")))?;

        Ok(self.insert_pipeline(pipeline, vk::PipelineBindPoint::COMPUTE))
    }

    fn signal_fence(&mut self, value: u64) -> BackendResult<()> {
        let signals = [vk::SemaphoreSubmitInfo::default()
            .semaphore(self.frame_fence)
            .value(value)
            .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)];
        let submit = vk::SubmitInfo2::default().signal_semaphore_infos(&signals);
        unsafe { self.device.queue_submit2(self.graphics_queue, &[submit], vk::Fence::null()) }
            .map_err(|e| BackendError::FenceFailed(e.to_string()))
    }

    fn completed_fence_value(&self) -> BackendResult<u64> {
        unsafe { self.device.get_semaphore_counter_value(self.frame_fence) }.map_err(|e| match e {
            vk::Result::ERROR_DEVICE_LOST => BackendError::DeviceLost,
            e => BackendError::FenceFailed(e.to_string()),
        })
    }

    fn wait_for_fence(&mut self, value: u64) -> BackendResult<()> {
        let semaphores = [self.frame_fence];
        let values = [value];
        let wait_info = vk::SemaphoreWaitInfo::default()
            .semaphores(&semaphores)
            .values(&values);
        unsafe { self.device.wait_semaphores(&wait_info, u64::MAX) }.map_err(|e| match e {
            vk::Result::ERROR_DEVICE_LOST => BackendError::DeviceLost,
            e => BackendError::FenceFailed(e.to_string()),
        })
    }

    fn reset_command_list(&mut self, frame_slot: usize) -> BackendResult<()> {
        if let ListState::Recording(slot) = self.list_state {
            return Err(BackendError::CommandListFailed(format!(
                "command list {slot} is still recording"
            )));
        }
        let cmd = *self.command_buffers.get(frame_slot).ok_or_else(|| {
            BackendError::CommandListFailed(format!(
                "frame slot {frame_slot} out of {} command buffers",
                self.command_buffers.len()
            ))
        })?;

        unsafe {
            self.device
                .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
                .map_err(|e| BackendError::CommandListFailed(e.to_string()))?;
            let begin_info =
                vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            self.device
                .begin_command_buffer(cmd, &begin_info)
                .map_err(|e| BackendError::CommandListFailed(e.to_string()))?;

            if !self.pending_transitions.is_empty() {
                let dependency = vk::DependencyInfo::default().image_memory_barriers(&self.pending_transitions);
                self.device.cmd_pipeline_barrier2(cmd, &dependency);
                self.pending_transitions.clear();
            }
        }

        self.list_state = ListState::Recording(frame_slot);
        self.rendering = RenderingState::default();
        Ok(())
    }

    fn close_command_list(&mut self) -> BackendResult<()> {
        let ListState::Recording(slot) = self.list_state else {
            return Err(BackendError::CommandListFailed("no command list is recording".into()));
        };
        self.end_rendering();
        unsafe { self.device.end_command_buffer(self.command_buffers[slot]) }
            .map_err(|e| BackendError::CommandListFailed(e.to_string()))?;
        self.list_state = ListState::Closed(slot);
        Ok(())
    }

    fn execute_command_list(&mut self) -> BackendResult<()> {
        let ListState::Closed(slot) = self.list_state else {
            return Err(BackendError::CommandListFailed("command list is not closed".into()));
        };

        let mut waits = Vec::new();
        if self.acquire_wait_pending {
            waits.push(
                vk::SemaphoreSubmitInfo::default()
                    .semaphore(self.image_available_semaphore)
                    .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS),
            );
        }
        // A presentable image gets a fresh signal; an unconsumed earlier one is folded in
        let mut signals = Vec::new();
        let mut present_signal = self.present_signal;
        if self.acquired_image.is_some() {
            if let Some(previous) = present_signal {
                waits.push(
                    vk::SemaphoreSubmitInfo::default()
                        .semaphore(previous)
                        .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS),
                );
            }
            let next = self.present_semaphores[self.next_present_semaphore];
            signals.push(
                vk::SemaphoreSubmitInfo::default()
                    .semaphore(next)
                    .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS),
            );
            present_signal = Some(next);
        }

        let command_buffers = [vk::CommandBufferSubmitInfo::default().command_buffer(self.command_buffers[slot])];
        let submit = vk::SubmitInfo2::default()
            .wait_semaphore_infos(&waits)
            .command_buffer_infos(&command_buffers)
            .signal_semaphore_infos(&signals);

        unsafe { self.device.queue_submit2(self.graphics_queue, &[submit], vk::Fence::null()) }.map_err(
            |e| match e {
                vk::Result::ERROR_DEVICE_LOST => BackendError::DeviceLost,
                e => BackendError::CommandListFailed(e.to_string()),
            },
        )?;

        if !signals.is_empty() {
            self.next_present_semaphore ^= 1;
        }
        self.present_signal = present_signal;
        self.acquire_wait_pending = false;
        self.list_state = ListState::Idle;
        Ok(())
    }

    fn resource_barrier(&mut self, barriers: &[ResourceBarrier]) {
        self.end_rendering();
        let Some(cmd) = self.recording("resource_barrier") else {
            return;
        };

        let mut image_barriers = Vec::new();
        let mut buffer_barriers = Vec::new();
        for barrier in barriers {
            match barrier.resource {
                GpuResource::Texture(handle) => {
                    let Some(texture) = self.textures.get(&handle.0) else {
                        log::error!("Barrier on unknown {handle:?}");
                        continue;
                    };
                    // A UAV barrier keeps the GENERAL layout and only orders the
                    // clear and storage writes on either side of it.
                    image_barriers.push(image_transition(
                        texture.image,
                        subresource_range(texture.aspect, barrier.subresource),
                        Some(barrier.before),
                        barrier.after,
                    ));
                }
                GpuResource::Buffer(handle) => {
                    let Some(buffer) = self.buffers.get(&handle.0) else {
                        log::error!("Barrier on unknown {handle:?}");
                        continue;
                    };
                    let (src_stage, src_access, _) = state_sync(barrier.before);
                    let (dst_stage, dst_access, _) = state_sync(barrier.after);
                    buffer_barriers.push(
                        vk::BufferMemoryBarrier2::default()
                            .src_stage_mask(src_stage)
                            .src_access_mask(src_access)
                            .dst_stage_mask(dst_stage)
                            .dst_access_mask(dst_access)
                            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                            .buffer(buffer.buffer)
                            .offset(0)
                            .size(vk::WHOLE_SIZE),
                    );
                }
            }
        }

        let dependency = vk::DependencyInfo::default()
            .image_memory_barriers(&image_barriers)
            .buffer_memory_barriers(&buffer_barriers);
        unsafe { self.device.cmd_pipeline_barrier2(cmd, &dependency) };
    }

    fn set_descriptor_heap(&mut self, heap: DescriptorHeapHandle) {
        let Some(cmd) = self.recording("set_descriptor_heap") else {
            return;
        };
        if self.visible_heap != Some(heap.0) {
            log::error!("{heap:?} is not the shader-visible heap");
            return;
        }
        for bind_point in [vk::PipelineBindPoint::GRAPHICS, vk::PipelineBindPoint::COMPUTE] {
            unsafe {
                self.device.cmd_bind_descriptor_sets(
                    cmd,
                    bind_point,
                    self.pipeline_layout,
                    0,
                    &[self.bindless_set],
                    &[],
                );
            }
        }
    }

    fn set_pipeline(&mut self, pipeline: PipelineHandle) {
        let Some(cmd) = self.recording("set_pipeline") else {
            return;
        };
        match self.pipelines.get(&pipeline.0) {
            Some(vk_pipeline) => unsafe {
                self.device
                    .cmd_bind_pipeline(cmd, vk_pipeline.bind_point, vk_pipeline.pipeline)
            },
            None => log::error!("Unknown {pipeline:?}"),
        }
    }

    fn set_root_constant_buffer(&mut self, slot: u32, gpu_address: u64) {
        self.push_root_slot(slot, gpu_address);
    }

    fn set_root_descriptor_table(&mut self, slot: u32, table: GpuDescriptor) {
        if self.visible_heap != Some(table.heap.0) {
            log::error!("Descriptor table {table:?} is not in the shader-visible heap");
            return;
        }
        self.push_root_slot(slot, u64::from(table.index));
    }

    fn set_viewport(&mut self, viewport: Viewport) {
        let Some(cmd) = self.recording("set_viewport") else {
            return;
        };
        // Flip Y so clip space keeps +Y up like the HLSL the shaders come from
        let flipped = vk::Viewport {
            x: viewport.x,
            y: viewport.y + viewport.height,
            width: viewport.width,
            height: -viewport.height,
            min_depth: viewport.min_depth,
            max_depth: viewport.max_depth,
        };
        unsafe { self.device.cmd_set_viewport(cmd, 0, &[flipped]) };
    }

    fn set_scissor_rect(&mut self, rect: ScissorRect) {
        let Some(cmd) = self.recording("set_scissor_rect") else {
            return;
        };
        let scissor = vk::Rect2D {
            offset: vk::Offset2D {
                x: rect.x as i32,
                y: rect.y as i32,
            },
            extent: vk::Extent2D {
                width: rect.width,
                height: rect.height,
            },
        };
        unsafe { self.device.cmd_set_scissor(cmd, 0, &[scissor]) };
    }

    fn set_render_targets(&mut self, render_targets: &[CpuDescriptor], depth_stencil: Option<CpuDescriptor>) {
        self.end_rendering();
        let mut colors = Vec::with_capacity(render_targets.len());
        for &rtv in render_targets {
            match self.render_target_view(rtv) {
                Some(view) => colors.push(view),
                None => log::error!("Render target {rtv:?} holds no view"),
            }
        }
        let depth = depth_stencil.and_then(|dsv| {
            let view = self.render_target_view(dsv);
            if view.is_none() {
                log::error!("Depth target {dsv:?} holds no view");
            }
            view
        });
        self.rendering = RenderingState {
            colors,
            depth,
            active: false,
        };
    }

    fn clear_render_target(&mut self, rtv: CpuDescriptor, color: [f32; 4]) {
        self.end_rendering();
        let Some(cmd) = self.recording("clear_render_target") else {
            return;
        };
        let Some(view) = self.render_target_view(rtv) else {
            log::error!("Clear of empty render target {rtv:?}");
            return;
        };
        self.begin_rendering(cmd, &[view], None, Some(color), None);
        unsafe { self.device.cmd_end_rendering(cmd) };
    }

    fn clear_depth(&mut self, dsv: CpuDescriptor, depth: f32) {
        self.end_rendering();
        let Some(cmd) = self.recording("clear_depth") else {
            return;
        };
        let Some(view) = self.render_target_view(dsv) else {
            log::error!("Clear of empty depth target {dsv:?}");
            return;
        };
        self.begin_rendering(cmd, &[], Some(view), None, Some(depth));
        unsafe { self.device.cmd_end_rendering(cmd) };
    }

    fn clear_unordered_access(&mut self, uav: GpuDescriptor, texture: TextureHandle, values: [f32; 4]) {
        self.end_rendering();
        let Some(cmd) = self.recording("clear_unordered_access") else {
            return;
        };
        let Some(ViewKind::UnorderedAccess { mip, slice }) = self.view_at(uav.heap, uav.index).map(|v| v.kind) else {
            log::error!("{uav:?} is not an unordered access view");
            return;
        };
        let Some(vk_texture) = self.textures.get(&texture.0) else {
            log::error!("Clear of unknown {texture:?}");
            return;
        };
        let range = subresource_range(vk_texture.aspect, Some(Subresource::new(mip, slice)));
        unsafe {
            self.device.cmd_clear_color_image(
                cmd,
                vk_texture.image,
                vk::ImageLayout::GENERAL,
                &vk::ClearColorValue { float32: values },
                &[range],
            );
        }
    }

    fn set_vertex_buffer(&mut self, buffer: BufferHandle, _stride: u32, _size: u64) {
        let Some(cmd) = self.recording("set_vertex_buffer") else {
            return;
        };
        match self.buffers.get(&buffer.0) {
            Some(vk_buffer) => unsafe { self.device.cmd_bind_vertex_buffers(cmd, 0, &[vk_buffer.buffer], &[0]) },
            None => log::error!("Unknown vertex {buffer:?}"),
        }
    }

    fn set_index_buffer(&mut self, buffer: BufferHandle, _size: u64) {
        let Some(cmd) = self.recording("set_index_buffer") else {
            return;
        };
        match self.buffers.get(&buffer.0) {
            Some(vk_buffer) => unsafe {
                self.device
                    .cmd_bind_index_buffer(cmd, vk_buffer.buffer, 0, vk::IndexType::UINT32)
            },
            None => log::error!("Unknown index {buffer:?}"),
        }
    }

    fn draw_indexed(&mut self, index_count: u32, start_index: u32, base_vertex: i32) {
        let Some(cmd) = self.recording("draw_indexed") else {
            return;
        };
        self.ensure_rendering(cmd);
        unsafe {
            self.device
                .cmd_draw_indexed(cmd, index_count, 1, start_index, base_vertex, 0)
        };
    }

    fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        self.end_rendering();
        let Some(cmd) = self.recording("dispatch") else {
            return;
        };
        unsafe { self.device.cmd_dispatch(cmd, x, y, z) };
    }

    fn copy_buffer(&mut self, dest: BufferHandle, dest_offset: u64, src: BufferHandle, src_offset: u64, size: u64) {
        self.end_rendering();
        let Some(cmd) = self.recording("copy_buffer") else {
            return;
        };
        let (Some(dst_buffer), Some(src_buffer)) = (self.buffers.get(&dest.0), self.buffers.get(&src.0)) else {
            log::error!("Copy between unknown buffers {src:?} -> {dest:?}");
            return;
        };
        let region = vk::BufferCopy {
            src_offset,
            dst_offset: dest_offset,
            size,
        };
        unsafe {
            self.device
                .cmd_copy_buffer(cmd, src_buffer.buffer, dst_buffer.buffer, &[region])
        };
    }

    fn copy_buffer_to_texture(
        &mut self,
        dest: TextureHandle,
        subresource: Subresource,
        src: BufferHandle,
        layout: BufferTextureLayout,
    ) {
        self.end_rendering();
        let Some(cmd) = self.recording("copy_buffer_to_texture") else {
            return;
        };
        let (Some(texture), Some(buffer)) = (self.textures.get(&dest.0), self.buffers.get(&src.0)) else {
            log::error!("Upload between unknown resources {src:?} -> {dest:?}");
            return;
        };
        let region = vk::BufferImageCopy {
            buffer_offset: layout.offset,
            buffer_row_length: layout.row_pitch / texture.bytes_per_pixel,
            buffer_image_height: layout.height,
            image_subresource: vk::ImageSubresourceLayers {
                aspect_mask: texture.aspect,
                mip_level: subresource.mip,
                base_array_layer: subresource.slice,
                layer_count: 1,
            },
            image_offset: vk::Offset3D::default(),
            image_extent: vk::Extent3D {
                width: layout.width,
                height: layout.height,
                depth: 1,
            },
        };
        unsafe {
            self.device.cmd_copy_buffer_to_image(
                cmd,
                buffer.buffer,
                texture.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );
        }
    }

    fn copy_texture_region(
        &mut self,
        dest: TextureHandle,
        dest_subresource: Subresource,
        src: TextureHandle,
        src_subresource: Subresource,
    ) {
        self.end_rendering();
        let Some(cmd) = self.recording("copy_texture_region") else {
            return;
        };
        let (Some(dst_texture), Some(src_texture)) = (self.textures.get(&dest.0), self.textures.get(&src.0)) else {
            log::error!("Copy between unknown textures {src:?} -> {dest:?}");
            return;
        };
        let extent = mip_extent(dst_texture.extent, dest_subresource.mip);
        let layers = |texture: &VkTexture, sub: Subresource| vk::ImageSubresourceLayers {
            aspect_mask: texture.aspect,
            mip_level: sub.mip,
            base_array_layer: sub.slice,
            layer_count: 1,
        };
        let region = vk::ImageCopy {
            src_subresource: layers(src_texture, src_subresource),
            src_offset: vk::Offset3D::default(),
            dst_subresource: layers(dst_texture, dest_subresource),
            dst_offset: vk::Offset3D::default(),
            extent: vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            },
        };
        unsafe {
            self.device.cmd_copy_image(
                cmd,
                src_texture.image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                dst_texture.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );
        }
    }

    fn resolve_subresource(&mut self, dest: TextureHandle, src: TextureHandle, format: TextureFormat) {
        self.end_rendering();
        let Some(cmd) = self.recording("resolve_subresource") else {
            return;
        };
        let (Some(dst_texture), Some(src_texture)) = (self.textures.get(&dest.0), self.textures.get(&src.0)) else {
            log::error!("Resolve between unknown textures {src:?} -> {dest:?}");
            return;
        };
        if dst_texture.format != Self::convert_format(format) || src_texture.format != dst_texture.format {
            log::error!("Resolve of {src:?} into {dest:?} needs both in {format:?}");
            return;
        }
        let layers = vk::ImageSubresourceLayers {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            mip_level: 0,
            base_array_layer: 0,
            layer_count: 1,
        };
        let region = vk::ImageResolve {
            src_subresource: layers,
            src_offset: vk::Offset3D::default(),
            dst_subresource: layers,
            dst_offset: vk::Offset3D::default(),
            extent: vk::Extent3D {
                width: dst_texture.extent.width,
                height: dst_texture.extent.height,
                depth: 1,
            },
        };
        unsafe {
            self.device.cmd_resolve_image(
                cmd,
                src_texture.image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                dst_texture.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );
        }
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                log::warn!("device_wait_idle failed during shutdown: {e}");
            }

            for (_, heap) in self.heaps.drain() {
                for view in heap.slots.into_iter().flatten() {
                    self.device.destroy_image_view(view.view, None);
                }
            }

            if let Some(allocator) = &self.allocator {
                let mut allocator = allocator.lock();
                for (_, buffer) in self.buffers.drain() {
                    self.device.destroy_buffer(buffer.buffer, None);
                    let _ = allocator.free(buffer.allocation);
                }
                for (_, texture) in self.textures.drain() {
                    if let Some(allocation) = texture.allocation {
                        self.device.destroy_image(texture.image, None);
                        let _ = allocator.free(allocation);
                    }
                }
            }

            // Drop the allocator before destroying the device
            self.allocator = None;

            for (_, pipeline) in self.pipelines.drain() {
                self.device.destroy_pipeline(pipeline.pipeline, None);
            }
            self.device.destroy_pipeline_layout(self.pipeline_layout, None);
            self.device.destroy_descriptor_pool(self.descriptor_pool, None);
            self.device.destroy_descriptor_set_layout(self.bindless_layout, None);
            for &sampler in &self.samplers {
                self.device.destroy_sampler(sampler, None);
            }

            self.device.destroy_command_pool(self.command_pool, None);
            self.device.destroy_semaphore(self.image_available_semaphore, None);
            for &semaphore in &self.present_semaphores {
                self.device.destroy_semaphore(semaphore, None);
            }
            self.device.destroy_semaphore(self.frame_fence, None);

            self.swapchain_fn.destroy_swapchain(self.swapchain, None);
            self.device.destroy_device(None);
            self.surface_fn.destroy_surface(self.surface, None);
            self.instance.destroy_instance(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_count_never_exceeds_request() {
        let supported = vk::SampleCountFlags::TYPE_1 | vk::SampleCountFlags::TYPE_2 | vk::SampleCountFlags::TYPE_4;
        assert_eq!(highest_sample_count(supported, 8), 4);
        assert_eq!(highest_sample_count(supported, 4), 4);
        assert_eq!(highest_sample_count(supported, 3), 2);
        assert_eq!(highest_sample_count(supported, 1), 1);
        assert_eq!(highest_sample_count(vk::SampleCountFlags::TYPE_1, 8), 1);
    }

    #[test]
    fn test_state_layouts() {
        assert_eq!(state_sync(ResourceState::RenderTarget).2, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        assert_eq!(state_sync(ResourceState::Present).2, vk::ImageLayout::PRESENT_SRC_KHR);
        assert_eq!(state_sync(ResourceState::UnorderedAccess).2, vk::ImageLayout::GENERAL);
        for state in [ResourceState::PixelShaderResource, ResourceState::NonPixelShaderResource] {
            assert_eq!(state_sync(state).2, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        }
        assert_eq!(state_sync(ResourceState::ResolveSource).2, vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
        assert_eq!(state_sync(ResourceState::ResolveDest).2, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
    }

    #[test]
    fn test_format_conversion() {
        assert_eq!(VulkanBackend::convert_format(TextureFormat::Rgba16Float), vk::Format::R16G16B16A16_SFLOAT);
        assert_eq!(VulkanBackend::convert_format(TextureFormat::Rgba8UnormSrgb), vk::Format::R8G8B8A8_SRGB);
        assert_eq!(VulkanBackend::convert_format(TextureFormat::Depth32Float), vk::Format::D32_SFLOAT);
    }

    #[test]
    fn test_mip_extent_clamps_to_one() {
        let extent = vk::Extent2D { width: 256, height: 64 };
        assert_eq!(mip_extent(extent, 2), vk::Extent2D { width: 64, height: 16 });
        assert_eq!(mip_extent(extent, 8), vk::Extent2D { width: 1, height: 1 });
    }

    #[test]
    fn test_single_subresource_range() {
        let range = subresource_range(vk::ImageAspectFlags::COLOR, Some(Subresource::new(3, 5)));
        assert_eq!((range.base_mip_level, range.level_count), (3, 1));
        assert_eq!((range.base_array_layer, range.layer_count), (5, 1));

        let whole = subresource_range(vk::ImageAspectFlags::DEPTH, None);
        assert_eq!(whole.level_count, vk::REMAINING_MIP_LEVELS);
    }
}
