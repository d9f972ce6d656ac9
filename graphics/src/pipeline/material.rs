//! Material descriptor sets: resources written into the slots of a set layout.

use ash::vk;

use super::layout::SetLayoutDesc;
use crate::error::{GraphicsError, GraphicsResult};
use crate::reflect::{ReflectedBinding, ResourceKind};
use crate::resources::{Buffer, ImageView, Sampler};

/// A resource for one binding slot, in the layout's slot order.
#[derive(Debug, Clone)]
pub enum ResourceBinding<'a> {
    UniformBuffer {
        buffer: &'a Buffer,
        offset: u64,
        /// `None` binds the rest of the buffer.
        range: Option<u64>,
    },
    StorageBuffer {
        buffer: &'a Buffer,
        offset: u64,
        range: Option<u64>,
    },
    CombinedImageSampler {
        view: &'a ImageView,
        sampler: &'a Sampler,
    },
    /// An array of combined image samplers filling one arrayed slot.
    CombinedImageSamplers(Vec<(&'a ImageView, &'a Sampler)>),
    SampledImage(&'a ImageView),
    StorageImage(&'a ImageView),
    Sampler(&'a Sampler),
}

impl<'a> ResourceBinding<'a> {
    /// Whole-buffer uniform binding.
    pub fn uniform(buffer: &'a Buffer) -> Self {
        Self::UniformBuffer {
            buffer,
            offset: 0,
            range: None,
        }
    }

    pub fn texture(view: &'a ImageView, sampler: &'a Sampler) -> Self {
        Self::CombinedImageSampler { view, sampler }
    }

    pub fn kind(&self) -> ResourceKind {
        match self {
            Self::UniformBuffer { .. } => ResourceKind::UniformBuffer,
            Self::StorageBuffer { .. } => ResourceKind::StorageBuffer,
            Self::CombinedImageSampler { .. } | Self::CombinedImageSamplers(_) => {
                ResourceKind::CombinedImageSampler
            }
            Self::SampledImage(_) => ResourceKind::SampledImage,
            Self::StorageImage(_) => ResourceKind::StorageImage,
            Self::Sampler(_) => ResourceKind::Sampler,
        }
    }

    /// Descriptors this entry writes.
    pub fn descriptor_count(&self) -> u32 {
        match self {
            Self::CombinedImageSamplers(items) => items.len() as u32,
            _ => 1,
        }
    }
}

/// Check `resources` against the slots of `layout`.
///
/// The list must have one entry per slot ([`GraphicsError::BindingCountMismatch`]
/// otherwise, also when the number of entries of some kind differs from the
/// slots of that kind) and each entry must fill its slot's kind and array size.
pub fn validate_bindings(layout: &SetLayoutDesc, resources: &[ResourceBinding<'_>]) -> GraphicsResult<()> {
    let supplied: Vec<(ResourceKind, u32)> = resources
        .iter()
        .map(|r| (r.kind(), r.descriptor_count()))
        .collect();
    validate_shape(layout.bindings(), &supplied)
}

const KINDS: [ResourceKind; 6] = [
    ResourceKind::UniformBuffer,
    ResourceKind::StorageBuffer,
    ResourceKind::CombinedImageSampler,
    ResourceKind::SampledImage,
    ResourceKind::StorageImage,
    ResourceKind::Sampler,
];

/// Slot-by-slot check of (kind, descriptor count) pairs.
fn validate_shape(slots: &[ReflectedBinding], supplied: &[(ResourceKind, u32)]) -> GraphicsResult<()> {
    if slots.len() != supplied.len() {
        return Err(GraphicsError::BindingCountMismatch {
            expected: slots.len(),
            actual: supplied.len(),
        });
    }
    for kind in KINDS {
        let expected = slots.iter().filter(|b| b.kind == kind).count();
        let actual = supplied.iter().filter(|(k, _)| *k == kind).count();
        if expected != actual {
            return Err(GraphicsError::BindingCountMismatch { expected, actual });
        }
    }
    for (slot, &(kind, count)) in slots.iter().zip(supplied) {
        if slot.kind != kind {
            return Err(GraphicsError::InvalidParameter(format!(
                "set {} binding {} expects {:?}, got {:?}",
                slot.set, slot.binding, slot.kind, kind
            )));
        }
        if slot.count != count {
            return Err(GraphicsError::BindingCountMismatch {
                expected: slot.count as usize,
                actual: count as usize,
            });
        }
    }
    Ok(())
}

/// Write `resources` into `set`. Assumes [`validate_bindings`] passed.
pub(crate) fn write_bindings(
    device: &ash::Device,
    set: vk::DescriptorSet,
    layout: &SetLayoutDesc,
    resources: &[ResourceBinding<'_>],
) {
    // Info arrays must stay put while the writes point into them.
    let mut buffer_infos: Vec<Vec<vk::DescriptorBufferInfo>> = Vec::with_capacity(resources.len());
    let mut image_infos: Vec<Vec<vk::DescriptorImageInfo>> = Vec::with_capacity(resources.len());
    for resource in resources {
        let (buffers, images) = match resource {
            ResourceBinding::UniformBuffer {
                buffer,
                offset,
                range,
            }
            | ResourceBinding::StorageBuffer {
                buffer,
                offset,
                range,
            } => (
                vec![vk::DescriptorBufferInfo {
                    buffer: buffer.handle(),
                    offset: *offset,
                    range: range.unwrap_or(vk::WHOLE_SIZE),
                }],
                Vec::new(),
            ),
            ResourceBinding::CombinedImageSampler { view, sampler } => {
                (Vec::new(), vec![sampled_info(view, Some(sampler))])
            }
            ResourceBinding::CombinedImageSamplers(items) => (
                Vec::new(),
                items
                    .iter()
                    .map(|(view, sampler)| sampled_info(view, Some(sampler)))
                    .collect(),
            ),
            ResourceBinding::SampledImage(view) => (Vec::new(), vec![sampled_info(view, None)]),
            ResourceBinding::StorageImage(view) => (
                Vec::new(),
                vec![vk::DescriptorImageInfo {
                    sampler: vk::Sampler::null(),
                    image_view: view.handle(),
                    image_layout: vk::ImageLayout::GENERAL,
                }],
            ),
            ResourceBinding::Sampler(sampler) => (
                Vec::new(),
                vec![vk::DescriptorImageInfo {
                    sampler: sampler.handle(),
                    image_view: vk::ImageView::null(),
                    image_layout: vk::ImageLayout::UNDEFINED,
                }],
            ),
        };
        buffer_infos.push(buffers);
        image_infos.push(images);
    }

    let writes: Vec<vk::WriteDescriptorSet> = layout
        .bindings()
        .iter()
        .enumerate()
        .map(|(i, slot)| {
            let write = vk::WriteDescriptorSet::default()
                .dst_set(set)
                .dst_binding(slot.binding)
                .dst_array_element(0)
                .descriptor_type(crate::backend::vulkan::conversion::convert_resource_kind(
                    slot.kind,
                ));
            if buffer_infos[i].is_empty() {
                write.image_info(&image_infos[i])
            } else {
                write.buffer_info(&buffer_infos[i])
            }
        })
        .collect();

    unsafe { device.update_descriptor_sets(&writes, &[]) };
}

fn sampled_info(view: &ImageView, sampler: Option<&Sampler>) -> vk::DescriptorImageInfo {
    let image_layout = if view.format().is_depth_stencil() {
        vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL
    } else {
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
    };
    vk::DescriptorImageInfo {
        sampler: sampler.map_or(vk::Sampler::null(), |s| s.handle()),
        image_view: view.handle(),
        image_layout,
    }
}

/// Descriptor set of one material instance.
///
/// The set stays valid until its pool is reset or dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaterialDescriptorSet {
    pub(crate) set: vk::DescriptorSet,
    set_index: u32,
    format_id: u32,
    binding_count: usize,
}

impl MaterialDescriptorSet {
    pub(crate) fn new(set: vk::DescriptorSet, set_index: u32, format_id: u32, binding_count: usize) -> Self {
        Self {
            set,
            set_index,
            format_id,
            binding_count,
        }
    }

    pub fn handle(&self) -> vk::DescriptorSet {
        self.set
    }

    /// Set index the layout was reflected at.
    pub fn set_index(&self) -> u32 {
        self.set_index
    }

    /// Format ID of the layout; sets sharing it are interchangeable.
    pub fn format_id(&self) -> u32 {
        self.format_id
    }

    /// Bindings written at creation.
    pub fn binding_count(&self) -> usize {
        self.binding_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reflect::StageFlags;
    use rstest::rstest;

    use crate::reflect::ResourceKind::{CombinedImageSampler as Cis, SampledImage, Sampler as Smp, UniformBuffer as Ubo};

    fn slots(kinds: &[(ResourceKind, u32)]) -> Vec<ReflectedBinding> {
        kinds
            .iter()
            .enumerate()
            .map(|(i, &(kind, count))| {
                ReflectedBinding::new(1, i as u32, kind, StageFlags::FRAGMENT).with_count(count)
            })
            .collect()
    }

    #[rstest]
    #[case(0)]
    #[case(1)]
    #[case(3)]
    fn test_empty_resource_list(#[case] count: usize) {
        let layout = SetLayoutDesc::new(1, slots(&vec![(Ubo, 1); count])).unwrap();
        let result = validate_bindings(&layout, &[]);
        if count == 0 {
            assert!(result.is_ok());
        } else {
            assert_eq!(
                result,
                Err(GraphicsError::BindingCountMismatch {
                    expected: count,
                    actual: 0
                })
            );
        }
    }

    #[rstest]
    #[case(&[(Ubo, 1), (Cis, 1)], Ok(()))]
    #[case(&[(Ubo, 1)], Err(GraphicsError::BindingCountMismatch { expected: 2, actual: 1 }))]
    #[case(&[(Ubo, 1), (Cis, 1), (Smp, 1)], Err(GraphicsError::BindingCountMismatch { expected: 2, actual: 3 }))]
    #[case(&[(Ubo, 1), (Ubo, 1)], Err(GraphicsError::BindingCountMismatch { expected: 1, actual: 2 }))]
    #[case(&[(Ubo, 1), (SampledImage, 1)], Err(GraphicsError::BindingCountMismatch { expected: 0, actual: 1 }))]
    fn test_validate_shape(
        #[case] supplied: &[(ResourceKind, u32)],
        #[case] expected: GraphicsResult<()>,
    ) {
        let layout = slots(&[(Ubo, 1), (Cis, 1)]);
        assert_eq!(validate_shape(&layout, supplied), expected);
    }

    #[test]
    fn test_positional_kind_mismatch() {
        let layout = slots(&[(Ubo, 1), (Cis, 1)]);
        assert!(matches!(
            validate_shape(&layout, &[(Cis, 1), (Ubo, 1)]),
            Err(GraphicsError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_array_slot_needs_full_array() {
        let layout = slots(&[(Cis, 4)]);
        assert!(validate_shape(&layout, &[(Cis, 4)]).is_ok());
        assert_eq!(
            validate_shape(&layout, &[(Cis, 3)]),
            Err(GraphicsError::BindingCountMismatch {
                expected: 4,
                actual: 3
            })
        );
    }
}
