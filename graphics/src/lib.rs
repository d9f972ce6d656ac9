//! # Lumen Graphics
//!
//! An explicit resource and pipeline layer over Vulkan.
//!
//! ## Overview
//!
//! This crate provides:
//! - [`DeviceContext`] - Instance, device, queues, allocator and resource creation
//! - [`Fence`], [`Semaphore`] and [`FrameSync`] - CPU/GPU and GPU/GPU synchronization
//! - [`reflect`] - SPIR-V reflection into descriptor set and push constant layouts
//! - [`PipelineFactory`] - Shader modules, layouts, render passes and pipelines built from reflection
//! - [`CubemapConverter`] - Equirectangular panorama to cube image in one multiview pass
//! - [`LightSystem`] - Depth-only shadow pass
//! - [`FrameRenderer`] - The per-frame begin/record/complete sequence, with an
//!   off-screen [`ForwardRenderer`]
//!
//! ## Example
//!
//! ```ignore
//! use lumen_graphics::{ContextParameters, DeviceContext, PipelineFactory};
//!
//! let mut ctx = DeviceContext::initialize(ContextParameters::new().with_env_overrides(), None)?;
//! let mut factory = PipelineFactory::new(&ctx)?;
//! // Build techniques and pipelines, render...
//! factory.destroy(&ctx)?;
//! ctx.destroy()?;
//! ```

pub mod backend;
pub mod config;
pub mod context;
pub mod cubemap;
pub mod error;
pub mod light;
pub mod pipeline;
pub mod reflect;
pub mod renderer;
pub mod resources;
pub mod sync;
pub mod types;

// Re-export main types for convenience
pub use backend::vulkan::{
    DeviceCapabilities, QueueFamilyIndices, ResolvedQueues, SubresourceRange, TextureLayout,
};
pub use config::ContextParameters;
pub use context::{ContextState, DeviceContext, WindowHandles};
pub use cubemap::{CubeFace, CubemapConfig, CubemapConverter};
pub use error::{GraphicsError, GraphicsResult};
pub use light::{LightSystem, ShadowSettings};
pub use pipeline::{
    AttachmentDesc, DescriptorPool, DescriptorPoolSizing, DescriptorSetLayout,
    FixedFunctionState, Framebuffer, GraphicsPipeline, GraphicsPipelineDesc, LoadStoreConfig,
    MaterialDescriptorSet, PipelineFactory, PipelineLayout, RenderPass, ResourceBinding,
    ShaderModule, ShaderStageDesc, SubpassDesc, Technique, Vertex,
};
pub use reflect::{ShaderReflectionInfo, ShaderStage, StageReflection};
pub use renderer::{
    DrawConstants, Drawable, ForwardRenderer, ForwardTargetConfig, FramePhase, FrameRenderer,
    MaterialPipeline, Mesh,
};
pub use resources::{Buffer, Image, ImageView, Sampler};
pub use sync::{Fence, FenceStatus, FrameSync, Semaphore};
pub use types::{
    BufferDescriptor, BufferUsage, ClearValue, Extent2d, MemoryUsage, SamplerDescriptor,
    TextureDescriptor, TextureFormat, TextureUsage,
};

/// Graphics library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
