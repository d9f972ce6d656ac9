//! Pipeline construction driven by shader reflection.
//!
//! The pieces, from bytecode to a bindable pipeline:
//!
//! ```text
//! SPIR-V ──► ShaderModule (+ StageReflection per entry point)
//!                │
//!                ▼
//!   ShaderReflectionInfo::merge ──► create_sets ──► DescriptorSetLayout per set
//!                │                                   │
//!                ▼                                   ▼
//!   push constant block ─────────► create_pipeline_layout (sets ordered, gaps empty)
//!                                                    │
//!   RenderPass + subpass + FixedFunctionState ───────┴──► create_graphics_pipeline
//! ```
//!
//! Descriptor set layouts and render passes receive format IDs: objects with
//! equal signatures share an ID, so draws can be batched by comparing IDs.
//!
//! # Example
//!
//! ```ignore
//! let mut factory = PipelineFactory::new(&ctx)?;
//! let module = factory.create_shader_module(&spirv_bytes)?;
//! let stages = [
//!     ShaderStageDesc::new(&module, ShaderStage::Vertex),
//!     ShaderStageDesc::new(&module, ShaderStage::Fragment),
//! ];
//! let technique = factory.create_technique(&stages)?;
//! let pipeline = factory.create_graphics_pipeline(&GraphicsPipelineDesc {
//!     stages: &stages,
//!     layout: &technique.layout,
//!     render_pass: &render_pass,
//!     subpass: 0,
//!     state: FixedFunctionState::opaque(),
//! })?;
//! // ...
//! factory.destroy(&ctx)?;
//! ```

mod factory;
mod layout;
mod material;
mod pool;
mod registry;
mod render_pass;
mod shader;
mod state;

pub use factory::{
    DescriptorSetLayout, GraphicsPipeline, GraphicsPipelineDesc, PipelineFactory, PipelineLayout,
    Technique,
};
pub use layout::{
    check_push_constants, plan_set_order, push_constant_extent, PushConstantRange, SetLayoutDesc,
    SetSignature,
};
pub use material::{validate_bindings, MaterialDescriptorSet, ResourceBinding};
pub use pool::{DescriptorPool, DescriptorPoolSizing};
pub use registry::{FormatRegistry, EMPTY_FORMAT_ID};
pub use render_pass::{
    sampled_output_dependencies, AttachmentDesc, Framebuffer, LoadAction, LoadStoreConfig,
    MultiviewDesc, MultiviewSupport, RenderPass, StoreAction, SubpassDesc,
};
pub use shader::{compile_wgsl, ShaderModule, ShaderStageDesc};
pub use state::{
    BlendMode, CullMode, DepthBias, DepthState, FixedFunctionState, FrontFace, Topology, Vertex,
    VertexAttribute, VertexInput,
};
