//! Descriptor set and pipeline layout descriptions.
//!
//! These are the device-independent halves of the layout objects: binding
//! order, duplicate detection, set ordering with gaps, and push constant
//! limits. The factory turns them into Vulkan objects.

use ash::vk;

use crate::backend::vulkan::conversion::{convert_resource_kind, convert_stage_flags};
use crate::error::{GraphicsError, GraphicsResult};
use crate::reflect::{PushConstantBlock, ReflectedBinding, ResourceKind, ShaderReflectionInfo, StageFlags};

/// Bindings of one descriptor set, sorted by slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetLayoutDesc {
    set: u32,
    bindings: Vec<ReflectedBinding>,
}

/// Layout-compatibility key of a set: slot, kind, count, stages and block size.
pub type SetSignature = Vec<(u32, ResourceKind, u32, u32, u32)>;

impl SetLayoutDesc {
    /// Sort `bindings` by slot. Two bindings at one slot are a
    /// [`GraphicsError::DuplicateBinding`].
    pub fn new(set: u32, mut bindings: Vec<ReflectedBinding>) -> GraphicsResult<Self> {
        if let Some(stray) = bindings.iter().find(|b| b.set != set) {
            return Err(GraphicsError::InvalidParameter(format!(
                "binding {}.{} passed for set {}",
                stray.set, stray.binding, set
            )));
        }
        bindings.sort_by_key(|b| b.binding);
        if let Some(pair) = bindings.windows(2).find(|w| w[0].binding == w[1].binding) {
            return Err(GraphicsError::DuplicateBinding {
                set,
                binding: pair[0].binding,
            });
        }
        Ok(Self { set, bindings })
    }

    /// One description per set index found in `info`, ascending.
    pub fn from_reflection(info: &ShaderReflectionInfo) -> GraphicsResult<Vec<Self>> {
        info.sets()
            .iter()
            .map(|(&set, bindings)| Self::new(set, bindings.clone()))
            .collect()
    }

    pub fn set(&self) -> u32 {
        self.set
    }

    pub fn bindings(&self) -> &[ReflectedBinding] {
        &self.bindings
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn signature(&self) -> SetSignature {
        self.bindings
            .iter()
            .map(|b| (b.binding, b.kind, b.count, b.stages.bits(), b.size))
            .collect()
    }

    pub(crate) fn vk_bindings(&self) -> Vec<vk::DescriptorSetLayoutBinding<'static>> {
        self.bindings
            .iter()
            .map(|b| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(b.binding)
                    .descriptor_type(convert_resource_kind(b.kind))
                    .descriptor_count(b.count)
                    .stage_flags(convert_stage_flags(b.stages))
            })
            .collect()
    }
}

/// A push constant range of a pipeline layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushConstantRange {
    pub stages: StageFlags,
    pub offset: u32,
    pub size: u32,
}

impl PushConstantRange {
    pub fn new(stages: StageFlags, offset: u32, size: u32) -> Self {
        Self {
            stages,
            offset,
            size,
        }
    }

    pub(crate) fn to_vk(self) -> vk::PushConstantRange {
        vk::PushConstantRange {
            stage_flags: convert_stage_flags(self.stages),
            offset: self.offset,
            size: self.size,
        }
    }
}

impl From<PushConstantBlock> for PushConstantRange {
    fn from(block: PushConstantBlock) -> Self {
        Self::new(block.stages, 0, block.size)
    }
}

/// Bytes spanned by `ranges` together.
pub fn push_constant_extent(ranges: &[PushConstantRange]) -> u32 {
    ranges.iter().map(|r| r.offset + r.size).max().unwrap_or(0)
}

/// Fail with [`GraphicsError::PushConstantOverflow`] when `ranges` exceed `limit`.
pub fn check_push_constants(ranges: &[PushConstantRange], limit: u32) -> GraphicsResult<()> {
    let required = push_constant_extent(ranges);
    if required > limit {
        return Err(GraphicsError::PushConstantOverflow { required, limit });
    }
    Ok(())
}

/// Arrange set layouts by set index.
///
/// Returns, per set index from 0 to the highest given, the position of the
/// layout in `indices`, or `None` for a gap to fill with an empty layout.
pub fn plan_set_order(indices: &[u32]) -> GraphicsResult<Vec<Option<usize>>> {
    let Some(&highest) = indices.iter().max() else {
        return Ok(Vec::new());
    };
    let mut slots = vec![None; highest as usize + 1];
    for (position, &set) in indices.iter().enumerate() {
        let slot = &mut slots[set as usize];
        if slot.is_some() {
            return Err(GraphicsError::InvalidParameter(format!(
                "descriptor set {set} given more than once"
            )));
        }
        *slot = Some(position);
    }
    Ok(slots)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn ubo(set: u32, binding: u32) -> ReflectedBinding {
        ReflectedBinding::new(set, binding, ResourceKind::UniformBuffer, StageFlags::VERTEX)
    }

    #[test]
    fn test_set_layout_sorts_bindings() {
        let desc = SetLayoutDesc::new(0, vec![ubo(0, 2), ubo(0, 0), ubo(0, 1)]).unwrap();
        let slots: Vec<u32> = desc.bindings().iter().map(|b| b.binding).collect();
        assert_eq!(slots, vec![0, 1, 2]);
        assert_eq!(desc.vk_bindings()[2].binding, 2);
    }

    #[test]
    fn test_set_layout_duplicate_binding() {
        let result = SetLayoutDesc::new(3, vec![ubo(3, 1), ubo(3, 4), ubo(3, 1)]);
        assert_eq!(
            result,
            Err(GraphicsError::DuplicateBinding { set: 3, binding: 1 })
        );
    }

    #[test]
    fn test_set_layout_rejects_foreign_set() {
        assert!(matches!(
            SetLayoutDesc::new(0, vec![ubo(1, 0)]),
            Err(GraphicsError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_equal_sets_share_signature() {
        let a = SetLayoutDesc::new(0, vec![ubo(0, 1), ubo(0, 0)]).unwrap();
        let b = SetLayoutDesc::new(2, vec![ubo(2, 0), ubo(2, 1)]).unwrap();
        assert_eq!(a.signature(), b.signature());
    }

    #[rstest]
    #[case(vec![0, 1, 2], vec![Some(0), Some(1), Some(2)])]
    #[case(vec![2, 0, 1], vec![Some(1), Some(2), Some(0)])]
    #[case(vec![1, 0, 2], vec![Some(1), Some(0), Some(2)])]
    #[case(vec![3, 0], vec![Some(1), None, None, Some(0)])]
    #[case(vec![], vec![])]
    fn test_plan_set_order(#[case] indices: Vec<u32>, #[case] expected: Vec<Option<usize>>) {
        assert_eq!(plan_set_order(&indices).unwrap(), expected);
    }

    #[test]
    fn test_plan_set_order_is_permutation_invariant() {
        let sets = [4u32, 1, 0];
        let ordered = |indices: &[u32]| -> Vec<Option<u32>> {
            plan_set_order(indices)
                .unwrap()
                .into_iter()
                .map(|slot| slot.map(|p| indices[p]))
                .collect()
        };
        let expected = vec![Some(0), Some(1), None, None, Some(4)];
        assert_eq!(ordered(&sets), expected);
        assert_eq!(ordered(&[0, 4, 1]), expected);
        assert_eq!(ordered(&[1, 0, 4]), expected);
    }

    #[test]
    fn test_plan_set_order_duplicate() {
        assert!(plan_set_order(&[1, 1]).is_err());
    }

    #[rstest]
    #[case(vec![PushConstantRange::new(StageFlags::VERTEX, 0, 64)], 128, true)]
    #[case(vec![PushConstantRange::new(StageFlags::VERTEX, 0, 64), PushConstantRange::new(StageFlags::FRAGMENT, 64, 64)], 128, true)]
    #[case(vec![PushConstantRange::new(StageFlags::VERTEX, 0, 64), PushConstantRange::new(StageFlags::FRAGMENT, 64, 80)], 128, false)]
    #[case(vec![], 0, true)]
    fn test_push_constant_limit(
        #[case] ranges: Vec<PushConstantRange>,
        #[case] limit: u32,
        #[case] ok: bool,
    ) {
        let result = check_push_constants(&ranges, limit);
        assert_eq!(result.is_ok(), ok);
        if !ok {
            assert_eq!(
                result,
                Err(GraphicsError::PushConstantOverflow {
                    required: 144,
                    limit: 128
                })
            );
        }
    }
}
