//! Common types shared across the graphics system.

use ash::vk;

// ============================================================================
// Viewport
// ============================================================================

/// Viewport configuration for rendering.
///
/// Depth range is `[0, 1]` and +Y points down in NDC, following Vulkan.
/// Projection matrices should therefore be built with `glam::Mat4::perspective_rh`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    /// X coordinate of the viewport's top-left corner.
    pub x: f32,
    /// Y coordinate of the viewport's top-left corner.
    pub y: f32,
    /// Width of the viewport.
    pub width: f32,
    /// Height of the viewport.
    pub height: f32,
    /// Minimum depth value.
    pub min_depth: f32,
    /// Maximum depth value.
    pub max_depth: f32,
}

impl Viewport {
    /// Create a viewport covering `extent` with the standard depth range.
    pub fn from_extent(extent: Extent2d) -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        }
    }

    pub(crate) fn to_vk(self) -> vk::Viewport {
        vk::Viewport {
            x: self.x,
            y: self.y,
            width: self.width,
            height: self.height,
            min_depth: self.min_depth,
            max_depth: self.max_depth,
        }
    }
}

// ============================================================================
// Extent2d
// ============================================================================

/// 2D extent for images and render targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Extent2d {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Extent2d {
    /// Create a new extent.
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// True when either dimension is zero.
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub(crate) fn to_vk(self) -> vk::Extent2D {
        vk::Extent2D {
            width: self.width,
            height: self.height,
        }
    }

    pub(crate) fn rect(self) -> vk::Rect2D {
        vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: self.to_vk(),
        }
    }
}

/// Clear value for render targets.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClearValue {
    /// Clear color attachment with RGBA values.
    Color([f32; 4]),
    /// Clear depth and stencil attachments.
    DepthStencil { depth: f32, stencil: u32 },
}

impl ClearValue {
    /// Create a color clear value.
    pub fn color(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self::Color([r, g, b, a])
    }

    /// Create a depth clear value.
    pub fn depth(value: f32) -> Self {
        Self::DepthStencil {
            depth: value,
            stencil: 0,
        }
    }

    pub(crate) fn to_vk(self) -> vk::ClearValue {
        match self {
            Self::Color(float32) => vk::ClearValue {
                color: vk::ClearColorValue { float32 },
            },
            Self::DepthStencil { depth, stencil } => vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue { depth, stencil },
            },
        }
    }
}
