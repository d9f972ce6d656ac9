//! Vulkan plumbing used by [`DeviceContext`](crate::DeviceContext) and the
//! pipeline factory.
//!
//! The functions here are thin, explicit wrappers around `ash` calls. Object
//! ownership and teardown order live in the context, not in this module.

pub mod allocator;
pub mod command;
pub mod conversion;
pub mod debug;
pub mod device;
pub mod instance;
pub mod layout;

pub use device::{DeviceCapabilities, QueueFamilyIndices, QueueFamilyInfo, ResolvedQueues};
pub use layout::{SubresourceRange, TextureLayout};
