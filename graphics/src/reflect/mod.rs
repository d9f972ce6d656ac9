//! Shader reflection data.
//!
//! [`StageReflection`] describes what one compiled shader stage declares:
//! resource bindings, interface variables and push constants.
//! [`ShaderReflectionInfo`] merges the stages of one technique into the
//! set-to-bindings mapping that descriptor and pipeline layouts are built from.
//! Everything here is plain data, so layout construction can be tested without
//! a device.

mod spirv;

use std::collections::BTreeMap;

use bitflags::bitflags;

use crate::error::{GraphicsError, GraphicsResult};

pub use spirv::{reflect_spirv, reflect_stage};
pub(crate) use spirv::to_words;

/// Vertex attribute location of positions.
pub const A_POSITION: u32 = 0;
/// Vertex attribute location of normals.
pub const A_NORMAL: u32 = 1;
/// Vertex attribute location of the first texture coordinate set.
pub const A_UV0: u32 = 2;
/// Vertex attribute location of the second texture coordinate set.
pub const A_UV1: u32 = 3;

bitflags! {
    /// Shader stages that access a binding.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct StageFlags: u32 {
        const VERTEX = 1 << 0;
        const FRAGMENT = 1 << 1;
        const COMPUTE = 1 << 2;
    }
}

/// A single programmable stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ShaderStage {
    Vertex,
    Fragment,
    Compute,
}

impl ShaderStage {
    /// The stage as a one-bit mask.
    pub fn flag(self) -> StageFlags {
        match self {
            Self::Vertex => StageFlags::VERTEX,
            Self::Fragment => StageFlags::FRAGMENT,
            Self::Compute => StageFlags::COMPUTE,
        }
    }
}

/// Kind of resource bound at a descriptor slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    UniformBuffer,
    StorageBuffer,
    /// Image and sampler in one descriptor.
    CombinedImageSampler,
    SampledImage,
    StorageImage,
    Sampler,
}

/// A resource binding declared by one or more stages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReflectedBinding {
    pub set: u32,
    pub binding: u32,
    pub kind: ResourceKind,
    /// Stages that declare the binding.
    pub stages: StageFlags,
    /// Descriptor count; the product of all array dimensions.
    pub count: u32,
    pub name: Option<String>,
    /// Size in bytes of buffer blocks, zero for images and samplers.
    pub size: u32,
}

impl ReflectedBinding {
    /// A single-descriptor binding without a name.
    pub fn new(set: u32, binding: u32, kind: ResourceKind, stages: StageFlags) -> Self {
        Self {
            set,
            binding,
            kind,
            stages,
            count: 1,
            name: None,
            size: 0,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_count(mut self, count: u32) -> Self {
        self.count = count;
        self
    }

    pub fn with_size(mut self, size: u32) -> Self {
        self.size = size;
        self
    }
}

/// Numeric class of an interface variable's components.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NumericKind {
    Float,
    Sint,
    Uint,
    Bool,
}

/// Format of a stage input or output: `components` values of one kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InterfaceFormat {
    pub kind: NumericKind,
    pub components: u8,
    /// Component width in bytes.
    pub width: u8,
}

impl InterfaceFormat {
    pub fn float(components: u8) -> Self {
        Self {
            kind: NumericKind::Float,
            components,
            width: 4,
        }
    }
}

/// A stage input or output bound to a location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceVariable {
    pub location: u32,
    pub format: InterfaceFormat,
    pub name: Option<String>,
}

/// Push constant block of a technique.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushConstantBlock {
    pub size: u32,
    pub stages: StageFlags,
}

/// What one shader stage declares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageReflection {
    pub stage: ShaderStage,
    pub entry_point: String,
    pub bindings: Vec<ReflectedBinding>,
    /// Inputs sorted by location.
    pub inputs: Vec<InterfaceVariable>,
    /// Outputs sorted by location.
    pub outputs: Vec<InterfaceVariable>,
    pub push_constant_size: Option<u32>,
}

impl StageReflection {
    /// An empty reflection for `stage`.
    pub fn new(stage: ShaderStage, entry_point: impl Into<String>) -> Self {
        Self {
            stage,
            entry_point: entry_point.into(),
            bindings: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            push_constant_size: None,
        }
    }
}

/// Merged reflection of every stage of one technique.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ShaderReflectionInfo {
    stages: Vec<StageReflection>,
    stage_mask: StageFlags,
    sets: BTreeMap<u32, Vec<ReflectedBinding>>,
    push_constants: Option<PushConstantBlock>,
}

impl ShaderReflectionInfo {
    /// Merge per-stage reflections.
    ///
    /// Bindings at the same (set, binding) in several stages become one binding
    /// with the union of their stage masks. Different kinds or counts at the
    /// same slot are a [`GraphicsError::ReflectionConflict`]; push constant
    /// blocks must agree in size across stages.
    pub fn merge(stages: Vec<StageReflection>) -> GraphicsResult<Self> {
        let mut stage_mask = StageFlags::empty();
        let mut slots: BTreeMap<(u32, u32), ReflectedBinding> = BTreeMap::new();
        let mut push_constants: Option<PushConstantBlock> = None;

        for stage in &stages {
            let flag = stage.stage.flag();
            if stage_mask.contains(flag) {
                return Err(GraphicsError::DuplicateStage(format!("{:?}", stage.stage)));
            }
            stage_mask |= flag;

            for binding in &stage.bindings {
                let key = (binding.set, binding.binding);
                match slots.get_mut(&key) {
                    None => {
                        let mut merged = binding.clone();
                        merged.stages |= flag;
                        slots.insert(key, merged);
                    }
                    Some(existing) => {
                        merge_binding(existing, binding, flag)?;
                    }
                }
            }

            if let Some(size) = stage.push_constant_size {
                match &mut push_constants {
                    None => {
                        push_constants = Some(PushConstantBlock { size, stages: flag });
                    }
                    Some(block) if block.size == size => block.stages |= flag,
                    Some(block) => {
                        return Err(GraphicsError::PushConstantMismatch(format!(
                            "{:?} declares {} bytes, {:?} declares {}",
                            block.stages, block.size, stage.stage, size
                        )));
                    }
                }
            }
        }

        let mut sets: BTreeMap<u32, Vec<ReflectedBinding>> = BTreeMap::new();
        for ((set, _), binding) in slots {
            sets.entry(set).or_default().push(binding);
        }

        Ok(Self {
            stages,
            stage_mask,
            sets,
            push_constants,
        })
    }

    /// Stages present in the technique.
    pub fn stage_mask(&self) -> StageFlags {
        self.stage_mask
    }

    /// Per-stage reflections in the order they were merged.
    pub fn stages(&self) -> &[StageReflection] {
        &self.stages
    }

    /// Reflection of one stage.
    pub fn stage(&self, stage: ShaderStage) -> Option<&StageReflection> {
        self.stages.iter().find(|s| s.stage == stage)
    }

    /// Set indices with at least one binding, ascending.
    pub fn set_indices(&self) -> impl Iterator<Item = u32> + '_ {
        self.sets.keys().copied()
    }

    /// Bindings of `set`, sorted by slot.
    pub fn bindings(&self, set: u32) -> &[ReflectedBinding] {
        self.sets.get(&set).map(Vec::as_slice).unwrap_or(&[])
    }

    /// The full set-to-bindings mapping.
    pub fn sets(&self) -> &BTreeMap<u32, Vec<ReflectedBinding>> {
        &self.sets
    }

    /// The unified push constant block, if any stage declares one.
    pub fn push_constants(&self) -> Option<PushConstantBlock> {
        self.push_constants
    }

    /// Vertex stage inputs, sorted by location.
    pub fn vertex_inputs(&self) -> &[InterfaceVariable] {
        self.stage(ShaderStage::Vertex)
            .map(|s| s.inputs.as_slice())
            .unwrap_or(&[])
    }

    /// Number of colour outputs the fragment stage writes: highest location plus one.
    pub fn fragment_output_count(&self) -> u32 {
        self.stage(ShaderStage::Fragment)
            .and_then(|s| s.outputs.iter().map(|o| o.location + 1).max())
            .unwrap_or(0)
    }

    /// Locate a named binding, returning its (set, binding).
    pub fn uniform(&self, name: &str) -> GraphicsResult<(u32, u32)> {
        self.sets
            .values()
            .flatten()
            .find(|b| b.name.as_deref() == Some(name))
            .map(|b| (b.set, b.binding))
            .ok_or_else(|| GraphicsError::UnknownUniform(name.to_string()))
    }

    /// Check that every vertex output the fragment stage reads is written with
    /// the same format.
    pub fn check_stage_interface(&self) -> GraphicsResult<()> {
        let (Some(vertex), Some(fragment)) = (
            self.stage(ShaderStage::Vertex),
            self.stage(ShaderStage::Fragment),
        ) else {
            return Ok(());
        };
        check_interface(&vertex.outputs, &fragment.inputs)
    }
}

fn merge_binding(
    existing: &mut ReflectedBinding,
    incoming: &ReflectedBinding,
    flag: StageFlags,
) -> GraphicsResult<()> {
    let conflict = |details: String| GraphicsError::ReflectionConflict {
        set: incoming.set,
        binding: incoming.binding,
        details,
    };
    if existing.kind != incoming.kind {
        return Err(conflict(format!(
            "{:?} in {:?} vs {:?} in {:?}",
            existing.kind, existing.stages, incoming.kind, flag
        )));
    }
    if existing.count != incoming.count {
        return Err(conflict(format!(
            "array count {} vs {}",
            existing.count, incoming.count
        )));
    }
    existing.stages |= flag;
    existing.size = existing.size.max(incoming.size);
    if existing.name.is_none() {
        existing.name.clone_from(&incoming.name);
    }
    Ok(())
}

/// Every input of the later stage must match an output of the earlier one.
pub(crate) fn check_interface(
    outputs: &[InterfaceVariable],
    inputs: &[InterfaceVariable],
) -> GraphicsResult<()> {
    for input in inputs {
        match outputs.iter().find(|o| o.location == input.location) {
            None => {
                return Err(GraphicsError::StageInterfaceMismatch(format!(
                    "input at location {} ({:?}) is not written by the previous stage",
                    input.location, input.name
                )))
            }
            Some(output) if output.format != input.format => {
                return Err(GraphicsError::StageInterfaceMismatch(format!(
                    "location {}: previous stage writes {:?}, next stage reads {:?}",
                    input.location, output.format, input.format
                )))
            }
            Some(_) => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn stage(stage: ShaderStage, bindings: Vec<ReflectedBinding>) -> StageReflection {
        StageReflection {
            bindings,
            ..StageReflection::new(stage, "main")
        }
    }

    fn var(location: u32, components: u8) -> InterfaceVariable {
        InterfaceVariable {
            location,
            format: InterfaceFormat::float(components),
            name: None,
        }
    }

    #[test]
    fn test_merge_unions_stage_masks() {
        let info = ShaderReflectionInfo::merge(vec![
            stage(
                ShaderStage::Vertex,
                vec![
                    ReflectedBinding::new(0, 0, ResourceKind::UniformBuffer, StageFlags::VERTEX)
                        .with_name("camera"),
                ],
            ),
            stage(
                ShaderStage::Fragment,
                vec![
                    ReflectedBinding::new(0, 0, ResourceKind::UniformBuffer, StageFlags::FRAGMENT),
                    ReflectedBinding::new(1, 0, ResourceKind::CombinedImageSampler, StageFlags::FRAGMENT),
                ],
            ),
        ])
        .unwrap();

        assert_eq!(info.set_indices().collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(
            info.bindings(0)[0].stages,
            StageFlags::VERTEX | StageFlags::FRAGMENT
        );
        assert_eq!(info.bindings(0)[0].name.as_deref(), Some("camera"));
        assert_eq!(info.bindings(1)[0].stages, StageFlags::FRAGMENT);
        assert_eq!(info.stage_mask(), StageFlags::VERTEX | StageFlags::FRAGMENT);
    }

    #[test]
    fn test_merge_sorts_bindings_by_slot() {
        let info = ShaderReflectionInfo::merge(vec![stage(
            ShaderStage::Fragment,
            vec![
                ReflectedBinding::new(0, 3, ResourceKind::Sampler, StageFlags::FRAGMENT),
                ReflectedBinding::new(0, 1, ResourceKind::SampledImage, StageFlags::FRAGMENT),
                ReflectedBinding::new(0, 2, ResourceKind::UniformBuffer, StageFlags::FRAGMENT),
            ],
        )])
        .unwrap();
        let slots: Vec<u32> = info.bindings(0).iter().map(|b| b.binding).collect();
        assert_eq!(slots, vec![1, 2, 3]);
    }

    #[rstest]
    #[case(ResourceKind::UniformBuffer, ResourceKind::StorageBuffer, 1, 1)]
    #[case(ResourceKind::SampledImage, ResourceKind::CombinedImageSampler, 1, 1)]
    #[case(ResourceKind::SampledImage, ResourceKind::SampledImage, 2, 4)]
    fn test_merge_conflicts(
        #[case] first: ResourceKind,
        #[case] second: ResourceKind,
        #[case] first_count: u32,
        #[case] second_count: u32,
    ) {
        let result = ShaderReflectionInfo::merge(vec![
            stage(
                ShaderStage::Vertex,
                vec![ReflectedBinding::new(2, 5, first, StageFlags::VERTEX).with_count(first_count)],
            ),
            stage(
                ShaderStage::Fragment,
                vec![ReflectedBinding::new(2, 5, second, StageFlags::FRAGMENT)
                    .with_count(second_count)],
            ),
        ]);
        assert!(matches!(
            result,
            Err(GraphicsError::ReflectionConflict { set: 2, binding: 5, .. })
        ));
    }

    #[test]
    fn test_merge_rejects_duplicate_stage() {
        let result = ShaderReflectionInfo::merge(vec![
            stage(ShaderStage::Vertex, vec![]),
            stage(ShaderStage::Vertex, vec![]),
        ]);
        assert!(matches!(result, Err(GraphicsError::DuplicateStage(_))));
    }

    #[test]
    fn test_push_constants_unify() {
        let mut vertex = stage(ShaderStage::Vertex, vec![]);
        vertex.push_constant_size = Some(64);
        let mut fragment = stage(ShaderStage::Fragment, vec![]);
        fragment.push_constant_size = Some(64);

        let info = ShaderReflectionInfo::merge(vec![vertex.clone(), fragment.clone()]).unwrap();
        assert_eq!(
            info.push_constants(),
            Some(PushConstantBlock {
                size: 64,
                stages: StageFlags::VERTEX | StageFlags::FRAGMENT
            })
        );

        fragment.push_constant_size = Some(16);
        assert!(matches!(
            ShaderReflectionInfo::merge(vec![vertex, fragment]),
            Err(GraphicsError::PushConstantMismatch(_))
        ));
    }

    #[test]
    fn test_uniform_lookup() {
        let info = ShaderReflectionInfo::merge(vec![stage(
            ShaderStage::Fragment,
            vec![ReflectedBinding::new(1, 4, ResourceKind::UniformBuffer, StageFlags::FRAGMENT)
                .with_name("material")],
        )])
        .unwrap();
        assert_eq!(info.uniform("material").unwrap(), (1, 4));
        assert!(matches!(
            info.uniform("lights"),
            Err(GraphicsError::UnknownUniform(name)) if name == "lights"
        ));
    }

    #[test]
    fn test_fragment_output_count() {
        let mut fragment = stage(ShaderStage::Fragment, vec![]);
        fragment.outputs = vec![var(0, 4), var(2, 4)];
        let info = ShaderReflectionInfo::merge(vec![fragment]).unwrap();
        assert_eq!(info.fragment_output_count(), 3);

        let empty = ShaderReflectionInfo::merge(vec![stage(ShaderStage::Vertex, vec![])]).unwrap();
        assert_eq!(empty.fragment_output_count(), 0);
    }

    #[rstest]
    #[case(vec![var(0, 3), var(1, 2)], vec![var(1, 2)], true)]
    #[case(vec![var(0, 3)], vec![var(1, 2)], false)]
    #[case(vec![var(0, 3)], vec![var(0, 4)], false)]
    #[case(vec![], vec![], true)]
    fn test_check_interface(
        #[case] outputs: Vec<InterfaceVariable>,
        #[case] inputs: Vec<InterfaceVariable>,
        #[case] ok: bool,
    ) {
        let result = check_interface(&outputs, &inputs);
        assert_eq!(result.is_ok(), ok);
        if !ok {
            assert!(matches!(result, Err(GraphicsError::StageInterfaceMismatch(_))));
        }
    }
}
