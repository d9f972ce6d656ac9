//! Shader modules and built-in WGSL compilation.

use std::ffi::CString;

use ash::vk;

use crate::error::{GraphicsError, GraphicsResult};
use crate::reflect::{ShaderStage, StageReflection};

/// Compile WGSL source to SPIR-V words for one entry point.
///
/// Used for the crate's built-in shaders; application shaders arrive as
/// precompiled SPIR-V.
pub fn compile_wgsl(
    source: &str,
    stage: ShaderStage,
    entry_point: &str,
) -> GraphicsResult<Vec<u32>> {
    let module = naga::front::wgsl::parse_str(source)
        .map_err(|e| GraphicsError::ShaderCompilation(format!("WGSL parse error: {e}")))?;

    let mut validator = naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::all(),
    );
    let info = validator
        .validate(&module)
        .map_err(|e| GraphicsError::ShaderCompilation(format!("Validation error: {e}")))?;

    let naga_stage = match stage {
        ShaderStage::Vertex => naga::ShaderStage::Vertex,
        ShaderStage::Fragment => naga::ShaderStage::Fragment,
        ShaderStage::Compute => naga::ShaderStage::Compute,
    };

    if !module
        .entry_points
        .iter()
        .any(|ep| ep.name == entry_point && ep.stage == naga_stage)
    {
        return Err(GraphicsError::ShaderCompilation(format!(
            "Entry point '{}' not found for stage {:?}",
            entry_point, stage
        )));
    }

    let options = naga::back::spv::Options {
        lang_version: (1, 3),
        // Names only; coordinates are written in Vulkan conventions already.
        flags: naga::back::spv::WriterFlags::DEBUG,
        ..Default::default()
    };
    let pipeline_options = naga::back::spv::PipelineOptions {
        shader_stage: naga_stage,
        entry_point: entry_point.to_string(),
    };

    naga::back::spv::write_vec(&module, &info, &options, Some(&pipeline_options))
        .map_err(|e| GraphicsError::ShaderCompilation(format!("SPIR-V generation error: {e}")))
}

/// A device shader module together with the reflection of its entry points.
///
/// Modules are owned by the [`PipelineFactory`](super::PipelineFactory) that
/// created them and are destroyed with it.
#[derive(Debug, Clone)]
pub struct ShaderModule {
    pub(crate) handle: vk::ShaderModule,
    stages: Vec<StageReflection>,
}

impl ShaderModule {
    pub(crate) fn new(handle: vk::ShaderModule, stages: Vec<StageReflection>) -> Self {
        Self { handle, stages }
    }

    /// Native module handle.
    pub fn handle(&self) -> vk::ShaderModule {
        self.handle
    }

    /// Reflection of every entry point in the module.
    pub fn stages(&self) -> &[StageReflection] {
        &self.stages
    }

    /// Reflection of the entry point for `stage`.
    pub fn stage(&self, stage: ShaderStage) -> Option<&StageReflection> {
        self.stages.iter().find(|s| s.stage == stage)
    }
}

/// One programmable stage of a pipeline: a module and which of its entry
/// points to run.
#[derive(Debug, Clone, Copy)]
pub struct ShaderStageDesc<'a> {
    pub module: &'a ShaderModule,
    pub stage: ShaderStage,
}

impl<'a> ShaderStageDesc<'a> {
    pub fn new(module: &'a ShaderModule, stage: ShaderStage) -> Self {
        Self { module, stage }
    }

    /// Reflection of the selected entry point.
    pub fn reflection(&self) -> GraphicsResult<&'a StageReflection> {
        self.module.stage(self.stage).ok_or_else(|| {
            GraphicsError::InvalidParameter(format!("module has no {:?} entry point", self.stage))
        })
    }

    pub(crate) fn entry_name(&self) -> GraphicsResult<CString> {
        CString::new(self.reflection()?.entry_point.as_str()).map_err(|e| {
            GraphicsError::InvalidParameter(format!(
                "Invalid entry point name (contains null byte): {}",
                e
            ))
        })
    }
}
