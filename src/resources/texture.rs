//! Texture loading and management
//!
//! A [`TextureGroup`] collects related texture maps (for example the albedo,
//! normal and ARM maps of one material), decodes them, uploads each into its
//! own mipped GPU texture and exposes all of them as one contiguous
//! descriptor table.

use super::heap::{CpuHeapKind, DescriptorAllocator};
use super::state::{TrackedBuffer, TrackedTexture};
use crate::backend::traits::*;
use crate::backend::types::*;
use crate::error::{EngineError, EngineResult};
use crate::pipeline::mipmaps::MipGenerator;
use exr::prelude::{AttributeValue, FlatSamples, Text};
use half::f16;
use std::path::{Path, PathBuf};

/// Decoded pixels of one texture
#[derive(Debug, Clone)]
pub struct TextureData {
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    /// Tightly packed rows of `width * format.bytes_per_pixel()` bytes
    pub data: Vec<u8>,
    pub name: String,
}

impl TextureData {
    /// Decode a file: `.exr` through the channel-aware decoder, anything else as 8-bit sRGB
    pub fn from_file<P: AsRef<Path>>(path: P) -> EngineResult<Self> {
        let path = path.as_ref();
        let is_exr = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("exr"));
        if is_exr {
            Self::from_exr(path)
        } else {
            Self::from_image(path)
        }
    }

    fn from_image(path: &Path) -> EngineResult<Self> {
        let mut rgba = image::open(path)?.to_rgba8();
        for pixel in rgba.pixels_mut() {
            pixel.0[3] = 255;
        }
        Ok(Self {
            width: rgba.width(),
            height: rgba.height(),
            format: TextureFormat::Rgba8UnormSrgb,
            data: rgba.into_raw(),
            name: path.display().to_string(),
        })
    }

    fn from_exr(path: &Path) -> EngineResult<Self> {
        let image = exr::prelude::read_all_flat_layers_from_file(path)?;

        let color_space = Text::from("Exif:ColorSpace");
        let srgb = image
            .attributes
            .other
            .get(&color_space)
            .or_else(|| image.layer_data.first().and_then(|l| l.attributes.other.get(&color_space)))
            .is_some_and(|value| matches!(value, AttributeValue::I32(1)));
        if srgb {
            return Err(EngineError::UnsupportedColorSpace(path.to_path_buf()));
        }

        let layer = image.layer_data.first().ok_or_else(|| EngineError::UnsupportedPixelFormat {
            path: path.to_path_buf(),
            reason: "file has no layers".into(),
        })?;
        let channels: Vec<(String, FlatSamples)> = layer
            .channel_data
            .list
            .iter()
            .map(|channel| (channel.name.to_string(), channel.sample_data.clone()))
            .collect();

        Self::from_exr_channels(path, layer.size.width() as u32, layer.size.height() as u32, channels)
    }

    /// Interleave planar EXR channels in R, G, B, A, Y order
    fn from_exr_channels(
        path: &Path,
        width: u32,
        height: u32,
        mut channels: Vec<(String, FlatSamples)>,
    ) -> EngineResult<Self> {
        let unsupported = |reason: String| EngineError::UnsupportedPixelFormat {
            path: path.to_path_buf(),
            reason,
        };

        if channels.is_empty() || channels.len() > 4 {
            return Err(unsupported(format!("{} channels", channels.len())));
        }
        let sample_kind = |samples: &FlatSamples| std::mem::discriminant(samples);
        let first_kind = sample_kind(&channels[0].1);
        if channels.iter().any(|(_, samples)| sample_kind(samples) != first_kind) {
            return Err(unsupported("channels have different sample types".into()));
        }

        let order = |name: &str| match name {
            "R" => 0,
            "G" => 1,
            "B" => 2,
            "A" => 3,
            "Y" => 4,
            _ => 5,
        };
        channels.sort_by_key(|(name, _)| order(name));

        let pixel_count = (width * height) as usize;
        let count = channels.len();
        let output_channels = if count == 3 { 4 } else { count };

        let (format, data) = match &channels[0].1 {
            FlatSamples::F16(_) => {
                let planes: Vec<&[f16]> = channels
                    .iter()
                    .filter_map(|(_, s)| match s {
                        FlatSamples::F16(v) => Some(v.as_slice()),
                        _ => None,
                    })
                    .collect();
                let format = [
                    TextureFormat::R16Float,
                    TextureFormat::Rg16Float,
                    TextureFormat::Rgba16Float,
                    TextureFormat::Rgba16Float,
                ][count - 1];
                (format, interleave(&planes, pixel_count, output_channels, f16::ONE))
            }
            FlatSamples::F32(_) => {
                let planes: Vec<&[f32]> = channels
                    .iter()
                    .filter_map(|(_, s)| match s {
                        FlatSamples::F32(v) => Some(v.as_slice()),
                        _ => None,
                    })
                    .collect();
                let format = [
                    TextureFormat::R32Float,
                    TextureFormat::Rg32Float,
                    TextureFormat::Rgba32Float,
                    TextureFormat::Rgba32Float,
                ][count - 1];
                (format, interleave(&planes, pixel_count, output_channels, 1.0f32))
            }
            FlatSamples::U32(_) => {
                let planes: Vec<&[u32]> = channels
                    .iter()
                    .filter_map(|(_, s)| match s {
                        FlatSamples::U32(v) => Some(v.as_slice()),
                        _ => None,
                    })
                    .collect();
                let format = [
                    TextureFormat::R32Uint,
                    TextureFormat::Rg32Uint,
                    TextureFormat::Rgba32Uint,
                    TextureFormat::Rgba32Uint,
                ][count - 1];
                (format, interleave(&planes, pixel_count, output_channels, 1u32))
            }
        };

        if data.len() != pixel_count * format.bytes_per_pixel() as usize {
            return Err(unsupported("channel sample count does not match the data window".into()));
        }

        Ok(Self {
            width,
            height,
            format,
            data,
            name: path.display().to_string(),
        })
    }
}

/// Interleave planes into pixels of `output_channels`, padding missing channels with `pad`
fn interleave<T: bytemuck::Pod>(planes: &[&[T]], pixel_count: usize, output_channels: usize, pad: T) -> Vec<u8> {
    let mut pixels: Vec<T> = Vec::with_capacity(pixel_count * output_channels);
    for i in 0..pixel_count {
        for c in 0..output_channels {
            let sample = planes.get(c).and_then(|plane| plane.get(i)).copied().unwrap_or(pad);
            pixels.push(sample);
        }
    }
    bytemuck::cast_slice(&pixels).to_vec()
}

struct UploadedTexture {
    texture: TrackedTexture,
    staging: Option<TrackedBuffer>,
    srv: GpuDescriptor,
}

/// Ordered set of textures bound together as one descriptor table
pub struct TextureGroup {
    name: String,
    pending: Vec<PathBuf>,
    textures: Vec<TextureData>,
    uploaded: Vec<UploadedTexture>,
    range: Option<GpuDescriptor>,
}

impl TextureGroup {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            pending: Vec::new(),
            textures: Vec::new(),
            uploaded: Vec::new(),
            range: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue a file for [`TextureGroup::load_textures`]
    pub fn add_texture(&mut self, path: impl Into<PathBuf>) {
        self.pending.push(path.into());
    }

    /// Add already decoded pixels
    pub fn add_texture_data(&mut self, data: TextureData) {
        self.textures.push(data);
    }

    /// Decode every queued file, in the order they were added
    pub fn load_textures(&mut self) -> EngineResult<()> {
        for path in std::mem::take(&mut self.pending) {
            let data = TextureData::from_file(&path)?;
            log::debug!(
                "Decoded {} ({}x{}, {:?})",
                path.display(),
                data.width,
                data.height,
                data.format
            );
            self.textures.push(data);
        }
        Ok(())
    }

    /// Decoded textures not yet released
    pub fn texture_data(&self) -> &[TextureData] {
        &self.textures
    }

    /// Number of uploaded textures
    pub fn len(&self) -> usize {
        self.uploaded.len()
    }

    pub fn is_empty(&self) -> bool {
        self.uploaded.is_empty()
    }

    /// Record uploads of every decoded texture and build the combined descriptor range.
    ///
    /// Each texture ends in [`ResourceState::PixelShaderResource`] with mip 0 filled.
    pub fn copy_to_upload_heap(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        allocator: &mut DescriptorAllocator,
    ) -> EngineResult<()> {
        if self.range.is_some() {
            return Err(EngineError::InvalidState {
                object: format!("texture group '{}'", self.name),
                operation: "copy_to_upload_heap",
                expected: "not uploaded",
                actual: "uploaded",
            });
        }

        let mut cpu_srvs = Vec::with_capacity(self.textures.len());
        for data in &self.textures {
            let mut texture = TrackedTexture::create(
                backend,
                TextureDescriptor {
                    label: Some(data.name.clone()),
                    width: data.width,
                    height: data.height,
                    mip_levels: TextureDescriptor::full_mip_count(data.width, data.height),
                    format: data.format,
                    usage: TextureUsage::TEXTURE_BINDING | TextureUsage::COPY_DST | TextureUsage::COPY_SRC,
                    initial_state: ResourceState::CopyDest,
                    ..Default::default()
                },
            )?;

            let staging = TrackedBuffer::create(
                backend,
                &BufferDescriptor {
                    label: Some(format!("{} Staging", data.name)),
                    size: data.data.len() as u64,
                    usage: BufferUsage::MAP_WRITE | BufferUsage::COPY_SRC,
                    initial_state: ResourceState::GenericRead,
                },
            )?;
            backend.write_buffer(staging.handle(), 0, &data.data)?;

            backend.copy_buffer_to_texture(
                texture.handle(),
                Subresource::new(0, 0),
                staging.handle(),
                BufferTextureLayout {
                    offset: 0,
                    width: data.width,
                    height: data.height,
                    row_pitch: data.width * data.format.bytes_per_pixel(),
                },
            );
            texture.transition_to(backend, ResourceState::PixelShaderResource);

            let cpu_srv = allocator.allocate_descriptors(CpuHeapKind::ShaderResource, 1);
            backend.create_shader_resource_view(texture.handle(), &ShaderResourceViewDesc::texture_2d(), cpu_srv)?;
            let srv = allocator.copy_descriptors_to_gpu_heap(backend, 1, cpu_srv)?;

            cpu_srvs.push(cpu_srv);
            self.uploaded.push(UploadedTexture {
                texture,
                staging: Some(staging),
                srv,
            });
        }

        let (range_cpu, range_gpu) = allocator.allocate_gpu_descriptors(cpu_srvs.len() as u32);
        for (i, cpu_srv) in cpu_srvs.iter().enumerate() {
            backend.copy_descriptors(1, range_cpu.offset(i as u32), *cpu_srv)?;
        }
        self.range = Some(range_gpu);

        log::debug!("Texture group '{}' upload recorded: {} textures", self.name, self.uploaded.len());
        Ok(())
    }

    /// Build the mip chain of every uploaded texture. Integer formats are left alone.
    pub fn generate_mips(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        allocator: &mut DescriptorAllocator,
        mips: &mut MipGenerator,
    ) -> EngineResult<()> {
        for uploaded in &mut self.uploaded {
            let texture = &mut uploaded.texture;
            if texture.format().is_integer() || texture.mip_levels() < 2 {
                continue;
            }
            texture.transition_to(backend, ResourceState::NonPixelShaderResource);
            let levels = texture.mip_levels() - 1;
            mips.generate(backend, allocator, texture, levels)?;
            texture.transition_to(backend, ResourceState::PixelShaderResource);
        }
        Ok(())
    }

    /// Start of the combined descriptor table
    pub fn gpu_handle(&self) -> Option<GpuDescriptor> {
        self.range
    }

    /// Individual shader-visible descriptor of texture `index`
    pub fn texture_gpu_handle(&self, index: usize) -> Option<GpuDescriptor> {
        self.uploaded.get(index).map(|u| u.srv)
    }

    pub fn texture(&self, index: usize) -> Option<&TrackedTexture> {
        self.uploaded.get(index).map(|u| &u.texture)
    }

    pub fn texture_mut(&mut self, index: usize) -> Option<&mut TrackedTexture> {
        self.uploaded.get_mut(index).map(|u| &mut u.texture)
    }

    /// Drop decoded pixels
    pub fn release_cpu_data(&mut self) {
        self.textures = Vec::new();
    }

    /// Destroy staging buffers once the uploads have executed
    pub fn release_upload_heaps(&mut self, backend: &mut dyn GraphicsBackend) {
        for uploaded in &mut self.uploaded {
            if let Some(staging) = uploaded.staging.take() {
                staging.destroy(backend);
            }
        }
    }

    /// Destroy every GPU texture of the group
    pub fn release_gpu_data(&mut self, backend: &mut dyn GraphicsBackend) {
        self.release_upload_heaps(backend);
        for uploaded in self.uploaded.drain(..) {
            uploaded.texture.destroy(backend);
        }
        self.range = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DescriptorView, RecordingBackend};

    fn solid(name: &str, width: u32, height: u32) -> TextureData {
        TextureData {
            width,
            height,
            format: TextureFormat::Rgba8UnormSrgb,
            data: vec![255; (width * height * 4) as usize],
            name: name.into(),
        }
    }

    #[test]
    fn test_descriptor_range_follows_addition_order() {
        let mut backend = RecordingBackend::new(8, 8, 2);
        let mut allocator = DescriptorAllocator::new(&mut backend).unwrap();
        let mut group = TextureGroup::new("material");
        for name in ["diff", "nor_dx", "arm"] {
            group.add_texture_data(solid(name, 4, 4));
        }

        backend.reset_command_list(0).unwrap();
        group.copy_to_upload_heap(&mut backend, &mut allocator).unwrap();
        assert!(backend.violations().is_empty(), "{:?}", backend.violations());
        assert_eq!(group.len(), 3);

        let range = group.gpu_handle().unwrap();
        for i in 0..3 {
            let texture = group.texture(i).unwrap();
            assert_eq!(texture.state(), Some(ResourceState::PixelShaderResource));
            assert_eq!(texture.mip_levels(), 3);
            match backend.gpu_descriptor(range.offset(i as u32)) {
                Some(DescriptorView::ShaderResource { texture: viewed, .. }) => {
                    assert_eq!(viewed, texture.handle())
                }
                other => panic!("unexpected descriptor {other:?}"),
            }
        }
    }

    #[test]
    fn test_release_upload_heaps() {
        let mut backend = RecordingBackend::new(8, 8, 2);
        let mut allocator = DescriptorAllocator::new(&mut backend).unwrap();
        let mut group = TextureGroup::new("material");
        group.add_texture_data(solid("diff", 2, 2));
        backend.reset_command_list(0).unwrap();
        group.copy_to_upload_heap(&mut backend, &mut allocator).unwrap();

        let buffers = backend.buffer_count();
        group.release_upload_heaps(&mut backend);
        assert_eq!(backend.buffer_count(), buffers - 1);
        group.release_gpu_data(&mut backend);
        assert!(group.is_empty());
        assert!(group.gpu_handle().is_none());
    }

    #[test]
    fn test_exr_half_rgb_is_padded() {
        let half = |v: f32| f16::from_f32(v);
        let channels = vec![
            ("B".to_string(), FlatSamples::F16(vec![half(0.25)])),
            ("G".to_string(), FlatSamples::F16(vec![half(0.5)])),
            ("R".to_string(), FlatSamples::F16(vec![half(1.0)])),
        ];
        let data = TextureData::from_exr_channels(Path::new("sky.exr"), 1, 1, channels).unwrap();
        assert_eq!(data.format, TextureFormat::Rgba16Float);
        let pixel: [f16; 4] = bytemuck::pod_read_unaligned(&data.data);
        assert_eq!(pixel, [half(1.0), half(0.5), half(0.25), half(1.0)]);
    }

    #[test]
    fn test_exr_float_formats() {
        let plane = |v: f32| FlatSamples::F32(vec![v; 4]);
        let two = vec![("R".to_string(), plane(1.0)), ("G".to_string(), plane(2.0))];
        let data = TextureData::from_exr_channels(Path::new("rg.exr"), 2, 2, two).unwrap();
        assert_eq!(data.format, TextureFormat::Rg32Float);
        assert_eq!(data.data.len(), 4 * 8);

        let one = vec![("Y".to_string(), FlatSamples::U32(vec![7; 4]))];
        let data = TextureData::from_exr_channels(Path::new("y.exr"), 2, 2, one).unwrap();
        assert_eq!(data.format, TextureFormat::R32Uint);
    }

    #[test]
    fn test_exr_mixed_sample_types_rejected() {
        let channels = vec![
            ("R".to_string(), FlatSamples::F16(vec![f16::ONE])),
            ("G".to_string(), FlatSamples::F32(vec![1.0])),
        ];
        let err = TextureData::from_exr_channels(Path::new("mixed.exr"), 1, 1, channels).unwrap_err();
        assert!(matches!(err, EngineError::UnsupportedPixelFormat { .. }));
    }

    #[test]
    fn test_exr_too_many_channels_rejected() {
        let channels = ["R", "G", "B", "A", "Z"]
            .iter()
            .map(|name| (name.to_string(), FlatSamples::F32(vec![0.0])))
            .collect();
        assert!(TextureData::from_exr_channels(Path::new("deep.exr"), 1, 1, channels).is_err());
    }

    #[test]
    fn test_exr_file_round_trip() {
        let dir = crate::test_support::temp_dir("exr");
        let path = dir.join("tiny.exr");
        exr::prelude::write_rgba_file(&path, 2, 2, |x, y| {
            (f16::from_f32(x as f32), f16::from_f32(y as f32), f16::ZERO, f16::ONE)
        })
        .unwrap();

        let data = TextureData::from_file(&path).unwrap();
        assert_eq!((data.width, data.height), (2, 2));
        assert_eq!(data.format, TextureFormat::Rgba16Float);
        assert_eq!(data.data.len(), 2 * 2 * 8);
    }

    #[test]
    fn test_exr_srgb_color_space_rejected() {
        use exr::prelude::{Image, SpecificChannels, Vec2, WritableImage};

        let dir = crate::test_support::temp_dir("exr");
        let path = dir.join("srgb.exr");
        let channels = SpecificChannels::rgba(|_: Vec2<usize>| (f16::ONE, f16::ONE, f16::ONE, f16::ONE));
        let mut image = Image::from_channels((2, 2), channels);
        image
            .attributes
            .other
            .insert(Text::from("Exif:ColorSpace"), AttributeValue::I32(1));
        image.write().to_file(&path).unwrap();

        let err = TextureData::from_file(&path).unwrap_err();
        assert!(matches!(err, EngineError::UnsupportedColorSpace(ref rejected) if *rejected == path));
    }

    #[test]
    fn test_png_alpha_forced_opaque() {
        let dir = crate::test_support::temp_dir("png");
        let path = dir.join("albedo.png");
        image::RgbaImage::from_pixel(3, 2, image::Rgba([10, 20, 30, 40]))
            .save(&path)
            .unwrap();

        let mut group = TextureGroup::new("png");
        group.add_texture(&path);
        group.load_textures().unwrap();
        let data = &group.texture_data()[0];
        assert_eq!(data.format, TextureFormat::Rgba8UnormSrgb);
        assert_eq!(&data.data[..4], &[10, 20, 30, 255]);
    }
}
