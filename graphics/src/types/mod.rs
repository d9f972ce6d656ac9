//! Common types and descriptors for graphics resources.
//!
//! This module contains format enums, usage flags, and descriptor structs
//! used throughout the graphics system.

mod buffer;
mod common;
mod sampler;
mod texture;

pub use buffer::{BufferDescriptor, BufferUsage, MemoryUsage};
pub use common::{ClearValue, Extent2d, Viewport};
pub use sampler::{AddressMode, CompareFunction, FilterMode, SamplerDescriptor};
pub use texture::{ImageTiling, TextureDescriptor, TextureFormat, TextureUsage};
