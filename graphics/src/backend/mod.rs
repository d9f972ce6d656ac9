//! Graphics backend.
//!
//! Vulkan through `ash` is the only backend.

pub mod vulkan;
