//! Common types shared between backends

use bytemuck::{Pod, Zeroable};

/// Texture format enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    Rgba8Unorm,
    Rgba8UnormSrgb,
    R16Float,
    Rg16Float,
    Rgba16Float,
    R32Float,
    Rg32Float,
    Rgba32Float,
    R32Uint,
    Rg32Uint,
    Rgba32Uint,
    Depth32Float,
}

impl TextureFormat {
    pub fn is_depth(&self) -> bool {
        matches!(self, TextureFormat::Depth32Float)
    }

    pub fn is_srgb(&self) -> bool {
        matches!(self, TextureFormat::Rgba8UnormSrgb)
    }

    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            TextureFormat::R32Uint | TextureFormat::Rg32Uint | TextureFormat::Rgba32Uint
        )
    }

    pub fn bytes_per_pixel(&self) -> u32 {
        match self {
            TextureFormat::R16Float => 2,
            TextureFormat::Rgba8Unorm
            | TextureFormat::Rgba8UnormSrgb
            | TextureFormat::Rg16Float
            | TextureFormat::R32Float
            | TextureFormat::R32Uint
            | TextureFormat::Depth32Float => 4,
            TextureFormat::Rgba16Float | TextureFormat::Rg32Float | TextureFormat::Rg32Uint => 8,
            TextureFormat::Rgba32Float | TextureFormat::Rgba32Uint => 16,
        }
    }

    /// Format usable for unordered access that shares this format's memory
    /// layout. sRGB formats map to their linear counterpart; the shader is
    /// told to re-encode.
    pub fn uav_compatible(&self) -> TextureFormat {
        match self {
            TextureFormat::Rgba8UnormSrgb => TextureFormat::Rgba8Unorm,
            other => *other,
        }
    }
}

/// Texture usage flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureUsage(u32);

impl TextureUsage {
    pub const COPY_SRC: Self = Self(1 << 0);
    pub const COPY_DST: Self = Self(1 << 1);
    pub const TEXTURE_BINDING: Self = Self(1 << 2);
    pub const STORAGE_BINDING: Self = Self(1 << 3);
    pub const RENDER_ATTACHMENT: Self = Self(1 << 4);

    pub fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl std::ops::BitOr for TextureUsage {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

/// Buffer usage flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferUsage(u32);

impl BufferUsage {
    /// Host visible, persistently mapped (upload heap).
    pub const MAP_WRITE: Self = Self(1 << 0);
    pub const COPY_SRC: Self = Self(1 << 1);
    pub const COPY_DST: Self = Self(1 << 2);
    pub const INDEX: Self = Self(1 << 3);
    pub const VERTEX: Self = Self(1 << 4);
    pub const UNIFORM: Self = Self(1 << 5);

    pub fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    pub fn bits(&self) -> u32 {
        self.0
    }
}

impl std::ops::BitOr for BufferUsage {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

/// The mode a GPU resource is currently usable in.
///
/// Every command that touches a resource expects a particular state. The
/// transition has to be declared with a [`ResourceBarrier`] beforehand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceState {
    Common,
    VertexAndConstantBuffer,
    IndexBuffer,
    RenderTarget,
    UnorderedAccess,
    DepthWrite,
    NonPixelShaderResource,
    PixelShaderResource,
    CopyDest,
    CopySource,
    ResolveDest,
    ResolveSource,
    Present,
    GenericRead,
}

impl ResourceState {
    /// Whether a texture in this state can be read through a shader resource view.
    pub fn is_shader_readable(&self) -> bool {
        matches!(
            self,
            ResourceState::PixelShaderResource | ResourceState::NonPixelShaderResource
        )
    }
}

/// One mip level of one array slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subresource {
    pub mip: u32,
    pub slice: u32,
}

impl Subresource {
    pub fn new(mip: u32, slice: u32) -> Self {
        Self { mip, slice }
    }

    /// Flat index with mips varying fastest.
    pub fn index(&self, mip_levels: u32) -> usize {
        (self.mip + self.slice * mip_levels) as usize
    }
}

/// Handle to a GPU buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub(crate) u64);

/// Handle to a GPU texture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureHandle(pub(crate) u64);

/// Handle to a root signature (binding layout)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RootSignatureHandle(pub(crate) u64);

/// Handle to a graphics or compute pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipelineHandle(pub(crate) u64);

/// Handle to a descriptor heap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorHeapHandle(pub(crate) u64);

/// A resource a barrier applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuResource {
    Texture(TextureHandle),
    Buffer(BufferHandle),
}

impl From<TextureHandle> for GpuResource {
    fn from(handle: TextureHandle) -> Self {
        GpuResource::Texture(handle)
    }
}

impl From<BufferHandle> for GpuResource {
    fn from(handle: BufferHandle) -> Self {
        GpuResource::Buffer(handle)
    }
}

/// State transition of a whole resource or of a single subresource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceBarrier {
    pub resource: GpuResource,
    /// `None` transitions every subresource.
    pub subresource: Option<Subresource>,
    pub before: ResourceState,
    pub after: ResourceState,
}

impl ResourceBarrier {
    pub fn transition(resource: impl Into<GpuResource>, before: ResourceState, after: ResourceState) -> Self {
        Self {
            resource: resource.into(),
            subresource: None,
            before,
            after,
        }
    }

    pub fn transition_subresource(
        resource: impl Into<GpuResource>,
        subresource: Subresource,
        before: ResourceState,
        after: ResourceState,
    ) -> Self {
        Self {
            resource: resource.into(),
            subresource: Some(subresource),
            before,
            after,
        }
    }

    /// Order unordered-access writes to a resource that stays in that state,
    /// such as a clear followed by a compute write
    pub fn uav(resource: impl Into<GpuResource>) -> Self {
        Self::transition(resource, ResourceState::UnorderedAccess, ResourceState::UnorderedAccess)
    }

    pub fn is_uav(&self) -> bool {
        self.before == ResourceState::UnorderedAccess && self.after == ResourceState::UnorderedAccess
    }
}

/// Texture descriptor
#[derive(Debug, Clone)]
pub struct TextureDescriptor {
    pub label: Option<String>,
    pub width: u32,
    pub height: u32,
    /// 6 for cube maps.
    pub array_layers: u32,
    pub mip_levels: u32,
    pub sample_count: u32,
    pub format: TextureFormat,
    pub usage: TextureUsage,
    pub initial_state: ResourceState,
    /// Marks a 6-layer texture as sampleable as a cube.
    pub cube_compatible: bool,
}

impl TextureDescriptor {
    /// Number of levels of a full mip chain down to 1x1.
    pub fn full_mip_count(width: u32, height: u32) -> u32 {
        32 - width.max(height).max(1).leading_zeros()
    }

    pub fn subresource_count(&self) -> usize {
        (self.mip_levels * self.array_layers) as usize
    }
}

impl Default for TextureDescriptor {
    fn default() -> Self {
        Self {
            label: None,
            width: 1,
            height: 1,
            array_layers: 1,
            mip_levels: 1,
            sample_count: 1,
            format: TextureFormat::Rgba8Unorm,
            usage: TextureUsage::TEXTURE_BINDING | TextureUsage::COPY_DST,
            initial_state: ResourceState::Common,
            cube_compatible: false,
        }
    }
}

/// Buffer descriptor
#[derive(Debug, Clone)]
pub struct BufferDescriptor {
    pub label: Option<String>,
    pub size: u64,
    pub usage: BufferUsage,
    pub initial_state: ResourceState,
}

/// Kinds of descriptor heap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorHeapKind {
    RenderTarget,
    DepthStencil,
    /// Shader resource and unordered access views.
    ShaderResource,
}

#[derive(Debug, Clone)]
pub struct DescriptorHeapDescriptor {
    pub label: Option<String>,
    pub kind: DescriptorHeapKind,
    pub capacity: u32,
    pub shader_visible: bool,
}

/// CPU-side handle to one descriptor slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CpuDescriptor {
    pub heap: DescriptorHeapHandle,
    pub index: u32,
}

impl CpuDescriptor {
    pub fn offset(self, count: u32) -> Self {
        Self {
            heap: self.heap,
            index: self.index + count,
        }
    }
}

/// Shader-visible handle to one descriptor slot, the start of a descriptor table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GpuDescriptor {
    pub heap: DescriptorHeapHandle,
    pub index: u32,
}

impl GpuDescriptor {
    pub fn offset(self, count: u32) -> Self {
        Self {
            heap: self.heap,
            index: self.index + count,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewDimension {
    Texture2D,
    Texture2DArray,
    TextureCube,
}

/// Shader resource view description
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShaderResourceViewDesc {
    pub dimension: ViewDimension,
    pub most_detailed_mip: u32,
    /// `None` covers every remaining mip.
    pub mip_levels: Option<u32>,
}

impl ShaderResourceViewDesc {
    pub fn texture_2d() -> Self {
        Self {
            dimension: ViewDimension::Texture2D,
            most_detailed_mip: 0,
            mip_levels: None,
        }
    }

    pub fn cube() -> Self {
        Self {
            dimension: ViewDimension::TextureCube,
            most_detailed_mip: 0,
            mip_levels: None,
        }
    }

    pub fn texture_2d_array() -> Self {
        Self {
            dimension: ViewDimension::Texture2DArray,
            most_detailed_mip: 0,
            mip_levels: None,
        }
    }
}

/// Render target view of one mip of one slice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RenderTargetViewDesc {
    pub mip: u32,
    pub slice: u32,
}

/// Unordered access view of one mip of one slice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UnorderedAccessViewDesc {
    pub mip: u32,
    pub slice: u32,
}

/// Layout of pixel rows inside a staging buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferTextureLayout {
    pub offset: u64,
    pub width: u32,
    pub height: u32,
    /// Bytes between the start of consecutive rows.
    pub row_pitch: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

impl Viewport {
    pub fn with_size(width: u32, height: u32) -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width: width as f32,
            height: height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScissorRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl ScissorRect {
    pub fn with_size(width: u32, height: u32) -> Self {
        Self {
            x: 0,
            y: 0,
            width,
            height,
        }
    }
}

/// Vertex attribute format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VertexFormat {
    Float32x2,
    Float32x3,
}

impl VertexFormat {
    pub fn size(&self) -> u64 {
        match self {
            VertexFormat::Float32x2 => 8,
            VertexFormat::Float32x3 => 12,
        }
    }
}

/// Vertex attribute description
#[derive(Debug, Clone)]
pub struct VertexAttribute {
    pub semantic: &'static str,
    pub location: u32,
    pub format: VertexFormat,
    pub offset: u64,
}

/// Vertex buffer layout
#[derive(Debug, Clone)]
pub struct VertexBufferLayout {
    pub array_stride: u64,
    pub attributes: Vec<VertexAttribute>,
}

/// Vertex shared by every pass: position, uv, normal, tangent, bitangent
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable, Default)]
pub struct Vertex {
    pub position: [f32; 3],
    pub uv: [f32; 2],
    pub normal: [f32; 3],
    pub tangent: [f32; 3],
    pub bitangent: [f32; 3],
}

impl Vertex {
    pub fn new(position: [f32; 3], uv: [f32; 2], normal: [f32; 3]) -> Self {
        Self {
            position,
            uv,
            normal,
            ..Default::default()
        }
    }

    pub fn layout() -> VertexBufferLayout {
        let attributes = [
            ("POSITION", VertexFormat::Float32x3),
            ("TEXCOORD", VertexFormat::Float32x2),
            ("NORMAL", VertexFormat::Float32x3),
            ("TANGENT", VertexFormat::Float32x3),
            ("BITANGENT", VertexFormat::Float32x3),
        ];

        let mut offset = 0;
        let attributes = attributes
            .iter()
            .enumerate()
            .map(|(location, &(semantic, format))| {
                let attribute = VertexAttribute {
                    semantic,
                    location: location as u32,
                    format,
                    offset,
                };
                offset += format.size();
                attribute
            })
            .collect();

        VertexBufferLayout {
            array_stride: std::mem::size_of::<Self>() as u64,
            attributes,
        }
    }
}

/// Cull mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CullMode {
    None,
    Front,
    Back,
}

/// Compare function for depth testing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareFunction {
    Never,
    Less,
    LessEqual,
    Always,
}

#[derive(Debug, Clone)]
pub struct DepthStencilState {
    pub format: TextureFormat,
    pub depth_test_enabled: bool,
    pub depth_write_enabled: bool,
    pub depth_compare: CompareFunction,
}

/// Shader stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Fragment,
    Compute,
}

/// One resource binding found in a shader module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShaderBinding {
    pub set: u32,
    pub binding: u32,
}

/// Binding layout of a pipeline.
///
/// A root signature is an ordered list of root slots. Each slot holds either
/// the GPU address of a constant buffer or the start of a descriptor table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootSignatureDesc {
    pub label: Option<String>,
    pub stage: ShaderStage,
    pub root_slot_count: u32,
    pub bindings: Vec<ShaderBinding>,
}

/// Graphics pipeline description
#[derive(Debug, Clone)]
pub struct GraphicsPipelineDesc {
    pub label: Option<String>,
    pub root_signature: RootSignatureHandle,
    pub vertex_shader: Vec<u8>,
    pub pixel_shader: Vec<u8>,
    pub vertex_layout: VertexBufferLayout,
    pub cull_mode: CullMode,
    pub depth_stencil: Option<DepthStencilState>,
    pub color_format: TextureFormat,
    pub sample_count: u32,
}

/// Compute pipeline description
#[derive(Debug, Clone)]
pub struct ComputePipelineDesc {
    pub label: Option<String>,
    pub root_signature: RootSignatureHandle,
    pub compute_shader: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_mip_count() {
        assert_eq!(TextureDescriptor::full_mip_count(1, 1), 1);
        assert_eq!(TextureDescriptor::full_mip_count(256, 256), 9);
        assert_eq!(TextureDescriptor::full_mip_count(1024, 512), 11);
        assert_eq!(TextureDescriptor::full_mip_count(5, 3), 3);
    }

    #[test]
    fn test_vertex_layout_matches_struct() {
        let layout = Vertex::layout();
        assert_eq!(layout.array_stride, 56);
        let offsets: Vec<u64> = layout.attributes.iter().map(|a| a.offset).collect();
        assert_eq!(offsets, vec![0, 12, 20, 32, 44]);
        assert_eq!(layout.attributes[1].semantic, "TEXCOORD");
    }

    #[test]
    fn test_subresource_index() {
        assert_eq!(Subresource::new(0, 0).index(6), 0);
        assert_eq!(Subresource::new(2, 1).index(6), 8);
    }

    #[test]
    fn test_uav_compatible_format() {
        assert_eq!(TextureFormat::Rgba8UnormSrgb.uav_compatible(), TextureFormat::Rgba8Unorm);
        assert_eq!(TextureFormat::Rgba16Float.uav_compatible(), TextureFormat::Rgba16Float);
    }
}
