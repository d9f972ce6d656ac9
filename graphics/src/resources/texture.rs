//! GPU image and image view resources.

use ash::vk;
use gpu_allocator::vulkan::Allocation;
use parking_lot::Mutex;

use super::LiveToken;
use crate::backend::vulkan::allocator::{self, SharedAllocator};
use crate::backend::vulkan::layout::TextureLayout;
use crate::types::{Extent2d, TextureFormat, TextureUsage};

/// A GPU image with its backing allocation.
///
/// The image remembers the layout it was last transitioned to through the
/// context, so later transitions know where to start from.
pub struct Image {
    device: ash::Device,
    allocator: SharedAllocator,
    image: vk::Image,
    allocation: Option<Allocation>,
    format: TextureFormat,
    extent: Extent2d,
    mip_levels: u32,
    layer_count: u32,
    usage: TextureUsage,
    cube_compatible: bool,
    layout: Mutex<TextureLayout>,
    _token: LiveToken,
}

/// Static properties of an image, used when wrapping a freshly created handle.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ImageInfo {
    pub format: TextureFormat,
    pub extent: Extent2d,
    pub mip_levels: u32,
    pub layer_count: u32,
    pub usage: TextureUsage,
    pub cube_compatible: bool,
}

impl Image {
    pub(crate) fn new(
        device: ash::Device,
        allocator: SharedAllocator,
        image: vk::Image,
        allocation: Allocation,
        info: ImageInfo,
        token: LiveToken,
    ) -> Self {
        Self {
            device,
            allocator,
            image,
            allocation: Some(allocation),
            format: info.format,
            extent: info.extent,
            mip_levels: info.mip_levels,
            layer_count: info.layer_count,
            usage: info.usage,
            cube_compatible: info.cube_compatible,
            layout: Mutex::new(TextureLayout::Undefined),
            _token: token,
        }
    }

    /// Native image handle.
    pub fn handle(&self) -> vk::Image {
        self.image
    }

    /// Texel format.
    pub fn format(&self) -> TextureFormat {
        self.format
    }

    /// Size of mip level zero.
    pub fn extent(&self) -> Extent2d {
        self.extent
    }

    /// Number of mip levels.
    pub fn mip_levels(&self) -> u32 {
        self.mip_levels
    }

    /// Number of array layers (6 for cube images).
    pub fn layer_count(&self) -> u32 {
        self.layer_count
    }

    /// Usage flags the image was created with.
    pub fn usage(&self) -> TextureUsage {
        self.usage
    }

    /// Whether the image was created cube compatible.
    pub fn is_cube(&self) -> bool {
        self.cube_compatible
    }

    /// Layout of the image after the last recorded transition.
    pub fn current_layout(&self) -> TextureLayout {
        *self.layout.lock()
    }

    pub(crate) fn set_layout(&self, layout: TextureLayout) {
        *self.layout.lock() = layout;
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        unsafe { self.device.destroy_image(self.image, None) };
        if let Some(allocation) = self.allocation.take() {
            allocator::free(&self.allocator, allocation);
        }
    }
}

impl std::fmt::Debug for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Image")
            .field("image", &self.image)
            .field("format", &self.format)
            .field("extent", &self.extent)
            .field("mip_levels", &self.mip_levels)
            .field("layer_count", &self.layer_count)
            .field("cube_compatible", &self.cube_compatible)
            .finish()
    }
}

/// A view onto an [`Image`].
pub struct ImageView {
    device: ash::Device,
    view: vk::ImageView,
    view_type: vk::ImageViewType,
    format: TextureFormat,
    extent: Extent2d,
    layer_count: u32,
    _token: LiveToken,
}

impl ImageView {
    pub(crate) fn new(
        device: ash::Device,
        view: vk::ImageView,
        view_type: vk::ImageViewType,
        image: &Image,
        layer_count: u32,
        token: LiveToken,
    ) -> Self {
        Self {
            device,
            view,
            view_type,
            format: image.format,
            extent: image.extent,
            layer_count,
            _token: token,
        }
    }

    /// Native view handle.
    pub fn handle(&self) -> vk::ImageView {
        self.view
    }

    /// View dimensionality.
    pub fn view_type(&self) -> vk::ImageViewType {
        self.view_type
    }

    /// Format of the viewed image.
    pub fn format(&self) -> TextureFormat {
        self.format
    }

    /// Size of the viewed image.
    pub fn extent(&self) -> Extent2d {
        self.extent
    }

    /// Layers covered by the view.
    pub fn layer_count(&self) -> u32 {
        self.layer_count
    }
}

impl Drop for ImageView {
    fn drop(&mut self) {
        unsafe { self.device.destroy_image_view(self.view, None) };
    }
}

impl std::fmt::Debug for ImageView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageView")
            .field("view", &self.view)
            .field("view_type", &self.view_type)
            .field("format", &self.format)
            .finish()
    }
}

static_assertions::assert_impl_all!(Image: Send, Sync);
static_assertions::assert_impl_all!(ImageView: Send, Sync);
