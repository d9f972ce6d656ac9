//! Graphics error types.

use ash::vk;

/// Result alias used throughout the crate.
pub type GraphicsResult<T> = Result<T, GraphicsError>;

/// Errors that can occur in the graphics system.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphicsError {
    // Initialization
    /// No physical device satisfied the selection requirements.
    #[error("no suitable GPU found: {0}")]
    DeviceSelection(String),
    /// Validation layers were requested but are not installed.
    #[error("validation layers requested but not available")]
    ValidationUnavailable,
    /// Graphics and present queue families could not both be resolved.
    #[error("incomplete queue families (graphics: {graphics:?}, present: {present:?})")]
    IncompleteQueueFamilies {
        graphics: Option<u32>,
        present: Option<u32>,
    },
    /// Failed to initialize a core object (instance, device, allocator, ...).
    #[error("initialization failed: {0}")]
    InitializationFailed(String),

    // Resource creation
    /// Device or host memory could not satisfy an allocation.
    #[error("out of device memory")]
    OutOfDeviceMemory,
    /// The requested format is not supported for the requested use.
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),
    /// Failed to create a resource for a reason other than memory or format.
    #[error("resource creation failed: {0}")]
    ResourceCreationFailed(String),

    // Reflection and layouts
    /// Shader bytecode is malformed or could not be parsed.
    #[error("invalid shader bytecode: {0}")]
    InvalidBytecode(String),
    /// A built-in WGSL shader failed to compile to SPIR-V.
    #[error("shader compilation failed: {0}")]
    ShaderCompilation(String),
    /// Two bindings share one slot inside a single descriptor set.
    #[error("duplicate binding {binding} in set {set}")]
    DuplicateBinding { set: u32, binding: u32 },
    /// Two stages declare different resource kinds at the same (set, binding).
    #[error("conflicting declarations at set {set} binding {binding}: {details}")]
    ReflectionConflict {
        set: u32,
        binding: u32,
        details: String,
    },
    /// Outputs of one stage do not feed the inputs of the next.
    #[error("stage interface mismatch: {0}")]
    StageInterfaceMismatch(String),
    /// The subpass colour attachments do not match the fragment outputs.
    #[error("attachment mismatch: subpass has {attachments} colour attachments, fragment stage writes {outputs}")]
    AttachmentMismatch { attachments: u32, outputs: u32 },
    /// Push constant ranges exceed the device limit.
    #[error("push constants need {required} bytes, device allows {limit}")]
    PushConstantOverflow { required: u32, limit: u32 },
    /// Stages declare push constant blocks that cannot be unified.
    #[error("push constant blocks differ between stages: {0}")]
    PushConstantMismatch(String),
    /// More than one module was supplied for a shader stage.
    #[error("duplicate shader stage: {0}")]
    DuplicateStage(String),
    /// A uniform was looked up by a name no stage declares.
    #[error("unknown uniform: {0}")]
    UnknownUniform(String),

    // Pools and materials
    /// A descriptor pool has no room left for the requested allocation.
    #[error("descriptor pool exhausted: {0}")]
    PoolExhausted(String),
    /// Supplied resources do not match the layout's slots.
    #[error("binding count mismatch: layout declares {expected} slots, got {actual}")]
    BindingCountMismatch { expected: usize, actual: usize },

    // Render passes
    /// Multiview was requested but cannot be used.
    #[error("multiview unsupported: {0}")]
    MultiviewUnsupported(String),
    /// The render pass description could not be turned into a render pass.
    #[error("render pass creation failed: {0}")]
    RenderPassCreationFailed(String),
    /// An invalid parameter was provided.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    // Cubemap conversion
    /// The equirectangular source cannot be sampled for conversion.
    #[error("cubemap source format unsupported: {0}")]
    SourceFormatUnsupported(String),

    // Lifecycle and synchronization
    /// The context is not in a state that allows the call.
    #[error("invalid state: {0}")]
    InvalidState(String),
    /// Teardown was requested while resources created by the context are alive.
    #[error("{0} resources still alive at context teardown")]
    ResourcesOutstanding(usize),
    /// The GPU device was lost.
    #[error("GPU device lost")]
    DeviceLost,
    /// A fence wait timed out.
    #[error("timed out waiting for the GPU")]
    Timeout,
    /// Any other Vulkan failure.
    #[error("vulkan error: {0}")]
    Vulkan(vk::Result),
}

impl From<vk::Result> for GraphicsError {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
                Self::OutOfDeviceMemory
            }
            vk::Result::ERROR_DEVICE_LOST => Self::DeviceLost,
            vk::Result::ERROR_FORMAT_NOT_SUPPORTED => {
                Self::UnsupportedFormat("format not supported by the driver".to_string())
            }
            vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL => {
                Self::PoolExhausted(format!("{result:?}"))
            }
            vk::Result::TIMEOUT => Self::Timeout,
            other => Self::Vulkan(other),
        }
    }
}

impl From<gpu_allocator::AllocationError> for GraphicsError {
    fn from(error: gpu_allocator::AllocationError) -> Self {
        match error {
            gpu_allocator::AllocationError::OutOfMemory => Self::OutOfDeviceMemory,
            other => Self::ResourceCreationFailed(format!("allocation failed: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = GraphicsError::OutOfDeviceMemory;
        assert_eq!(err.to_string(), "out of device memory");

        let err = GraphicsError::DuplicateBinding { set: 1, binding: 3 };
        assert_eq!(err.to_string(), "duplicate binding 3 in set 1");
    }

    #[test]
    fn test_vk_result_mapping() {
        assert_eq!(
            GraphicsError::from(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY),
            GraphicsError::OutOfDeviceMemory
        );
        assert_eq!(
            GraphicsError::from(vk::Result::ERROR_DEVICE_LOST),
            GraphicsError::DeviceLost
        );
        assert!(matches!(
            GraphicsError::from(vk::Result::ERROR_OUT_OF_POOL_MEMORY),
            GraphicsError::PoolExhausted(_)
        ));
        assert_eq!(
            GraphicsError::from(vk::Result::ERROR_INITIALIZATION_FAILED),
            GraphicsError::Vulkan(vk::Result::ERROR_INITIALIZATION_FAILED)
        );
    }
}
