//! Image types and descriptors.

use super::{Extent2d, MemoryUsage};
use bitflags::bitflags;

/// Texture format enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TextureFormat {
    /// 8-bit red channel, unsigned normalized.
    R8Unorm,
    /// 16-bit red channel, float.
    R16Float,
    /// 32-bit red channel, float.
    R32Float,
    /// 32-bit red channel, unsigned integer.
    R32Uint,
    /// 16-bit RG channels, float.
    Rg16Float,
    /// 8-bit RGBA channels, unsigned normalized.
    #[default]
    Rgba8Unorm,
    /// 8-bit RGBA channels, sRGB.
    Rgba8UnormSrgb,
    /// 8-bit BGRA channels, unsigned normalized.
    Bgra8Unorm,
    /// 8-bit BGRA channels, sRGB.
    Bgra8UnormSrgb,
    /// 16-bit RGBA channels, float.
    Rgba16Float,
    /// 32-bit RGBA channels, float.
    Rgba32Float,
    /// 16-bit depth.
    Depth16Unorm,
    /// 32-bit depth, float.
    Depth32Float,
    /// 24-bit depth with 8-bit stencil.
    Depth24UnormStencil8,
    /// 32-bit depth float with 8-bit stencil.
    Depth32FloatStencil8,
}

impl TextureFormat {
    /// Returns true if this is a depth or stencil format.
    pub fn is_depth_stencil(&self) -> bool {
        matches!(
            self,
            Self::Depth16Unorm
                | Self::Depth32Float
                | Self::Depth24UnormStencil8
                | Self::Depth32FloatStencil8
        )
    }

    /// Returns true if this format has a stencil component.
    pub fn has_stencil(&self) -> bool {
        matches!(self, Self::Depth24UnormStencil8 | Self::Depth32FloatStencil8)
    }

    /// Returns true for integer formats, which cannot be filtered.
    pub fn is_integer(&self) -> bool {
        matches!(self, Self::R32Uint)
    }

    /// Returns the size in bytes per pixel.
    pub fn block_size(&self) -> u32 {
        match self {
            Self::R8Unorm => 1,
            Self::R16Float | Self::Depth16Unorm => 2,
            Self::R32Float
            | Self::R32Uint
            | Self::Rg16Float
            | Self::Rgba8Unorm
            | Self::Rgba8UnormSrgb
            | Self::Bgra8Unorm
            | Self::Bgra8UnormSrgb
            | Self::Depth32Float
            | Self::Depth24UnormStencil8 => 4,
            Self::Rgba16Float | Self::Depth32FloatStencil8 => 8,
            Self::Rgba32Float => 16,
        }
    }
}

bitflags! {
    /// Usage flags for images.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TextureUsage: u32 {
        /// Image can be copied from.
        const COPY_SRC = 1 << 0;
        /// Image can be copied to.
        const COPY_DST = 1 << 1;
        /// Image can be sampled in a shader.
        const TEXTURE_BINDING = 1 << 2;
        /// Image can be used as a storage image.
        const STORAGE_BINDING = 1 << 3;
        /// Image can be used as a render attachment.
        const RENDER_ATTACHMENT = 1 << 4;
    }
}

impl Default for TextureUsage {
    fn default() -> Self {
        Self::empty()
    }
}

/// Texel arrangement in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ImageTiling {
    /// Driver-chosen layout, required for most sampling and attachment use.
    #[default]
    Optimal,
    /// Row-major layout that can be read directly from a mapped allocation.
    Linear,
}

/// Descriptor for creating an image.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TextureDescriptor {
    /// Debug label for the image.
    pub label: Option<String>,
    /// Size of each layer.
    pub size: Extent2d,
    /// Mip level count.
    pub mip_level_count: u32,
    /// Array layer count.
    pub layer_count: u32,
    /// Texture format.
    pub format: TextureFormat,
    /// Memory tiling.
    pub tiling: ImageTiling,
    /// Usage flags.
    pub usage: TextureUsage,
    /// Memory placement.
    pub memory: MemoryUsage,
}

impl TextureDescriptor {
    /// Create a new single-layer 2D image descriptor.
    pub fn new_2d(width: u32, height: u32, format: TextureFormat, usage: TextureUsage) -> Self {
        Self {
            label: None,
            size: Extent2d::new(width, height),
            mip_level_count: 1,
            layer_count: 1,
            format,
            tiling: ImageTiling::Optimal,
            usage,
            memory: MemoryUsage::GpuOnly,
        }
    }

    /// Set the debug label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Set the mip level count.
    pub fn with_mip_levels(mut self, count: u32) -> Self {
        self.mip_level_count = count;
        self
    }

    /// Set the layer count.
    pub fn with_layers(mut self, count: u32) -> Self {
        self.layer_count = count;
        self
    }

    /// Set the memory tiling.
    pub fn with_tiling(mut self, tiling: ImageTiling) -> Self {
        self.tiling = tiling;
        self
    }

    /// Set the memory placement.
    pub fn with_memory(mut self, memory: MemoryUsage) -> Self {
        self.memory = memory;
        self
    }

    /// Number of mips needed to reduce the largest dimension to one texel.
    pub fn full_mip_chain(size: Extent2d) -> u32 {
        32 - size.width.max(size.height).max(1).leading_zeros()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(TextureFormat::Depth32Float, true, false)]
    #[case(TextureFormat::Depth24UnormStencil8, true, true)]
    #[case(TextureFormat::Rgba16Float, false, false)]
    fn test_depth_stencil_queries(
        #[case] format: TextureFormat,
        #[case] depth: bool,
        #[case] stencil: bool,
    ) {
        assert_eq!(format.is_depth_stencil(), depth);
        assert_eq!(format.has_stencil(), stencil);
    }

    #[rstest]
    #[case(1, 1, 1)]
    #[case(512, 512, 10)]
    #[case(1024, 512, 11)]
    #[case(300, 7, 9)]
    fn test_full_mip_chain(#[case] width: u32, #[case] height: u32, #[case] expected: u32) {
        assert_eq!(
            TextureDescriptor::full_mip_chain(Extent2d::new(width, height)),
            expected
        );
    }

    #[test]
    fn test_descriptor_defaults() {
        let desc = TextureDescriptor::new_2d(
            64,
            32,
            TextureFormat::Rgba8Unorm,
            TextureUsage::TEXTURE_BINDING,
        );
        assert_eq!(desc.layer_count, 1);
        assert_eq!(desc.mip_level_count, 1);
        assert_eq!(desc.tiling, ImageTiling::Optimal);
        assert_eq!(desc.memory, MemoryUsage::GpuOnly);
    }
}
