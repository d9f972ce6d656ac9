//! GPU resources.
//!
//! This module contains the resource handles created by [`DeviceContext`]:
//! - [`Buffer`] - GPU memory buffer
//! - [`Image`] and [`ImageView`] - images, including cube-compatible ones
//! - [`Sampler`] - Texture sampler
//!
//! Handles are owned by whoever created them. Each one carries a [`LiveToken`]
//! so the context can refuse to tear down while any of them is still alive.
//!
//! [`DeviceContext`]: crate::DeviceContext

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

mod buffer;
mod sampler;
mod texture;

pub use buffer::Buffer;
pub use sampler::Sampler;
pub use texture::{Image, ImageView};
pub(crate) use texture::ImageInfo;

use crate::types::TextureDescriptor;

/// Static image properties taken from the descriptor it was created with.
pub(crate) fn texture_info(descriptor: &TextureDescriptor, cube_compatible: bool) -> ImageInfo {
    ImageInfo {
        format: descriptor.format,
        extent: descriptor.size,
        mip_levels: descriptor.mip_level_count,
        layer_count: descriptor.layer_count,
        usage: descriptor.usage,
        cube_compatible,
    }
}

/// Counts the handles created through one context.
#[derive(Debug, Clone, Default)]
pub(crate) struct ResourceTracker {
    live: Arc<AtomicUsize>,
}

impl ResourceTracker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register a new handle.
    pub(crate) fn token(&self) -> LiveToken {
        self.live.fetch_add(1, Ordering::AcqRel);
        LiveToken {
            live: Arc::clone(&self.live),
        }
    }

    /// Number of handles not yet dropped.
    pub(crate) fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }
}

/// Membership of one handle in a [`ResourceTracker`]; released on drop.
#[derive(Debug)]
pub(crate) struct LiveToken {
    live: Arc<AtomicUsize>,
}

impl Drop for LiveToken {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracker_counts_tokens() {
        let tracker = ResourceTracker::new();
        assert_eq!(tracker.live(), 0);

        let a = tracker.token();
        let b = tracker.token();
        assert_eq!(tracker.live(), 2);

        drop(a);
        assert_eq!(tracker.live(), 1);
        drop(b);
        assert_eq!(tracker.live(), 0);
    }

    #[test]
    fn test_tracker_clones_share_count() {
        let tracker = ResourceTracker::new();
        let clone = tracker.clone();
        let _token = clone.token();
        assert_eq!(tracker.live(), 1);
    }
}
