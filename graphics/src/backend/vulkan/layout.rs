//! Image layout states and layout-transition barriers.

use ash::vk;

/// Vulkan image layout states that images can be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TextureLayout {
    /// Initial state, contents undefined. Can transition to any layout.
    #[default]
    Undefined,
    /// Optimal for color attachment writes.
    ColorAttachment,
    /// Optimal for depth/stencil attachment writes.
    DepthStencilAttachment,
    /// Optimal for depth read-only (sampling + depth testing).
    DepthStencilReadOnly,
    /// Optimal for shader sampling (texture reads).
    ShaderReadOnly,
    /// Optimal for transfer source operations.
    TransferSrc,
    /// Optimal for transfer destination operations.
    TransferDst,
    /// Optimal for presentation to swapchain.
    PresentSrc,
    /// General layout (least optimal but most flexible).
    General,
}

impl TextureLayout {
    /// Convert to Vulkan image layout.
    pub fn to_vk(self) -> vk::ImageLayout {
        match self {
            Self::Undefined => vk::ImageLayout::UNDEFINED,
            Self::ColorAttachment => vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            Self::DepthStencilAttachment => vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            Self::DepthStencilReadOnly => vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
            Self::ShaderReadOnly => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            Self::TransferSrc => vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            Self::TransferDst => vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            Self::PresentSrc => vk::ImageLayout::PRESENT_SRC_KHR,
            Self::General => vk::ImageLayout::GENERAL,
        }
    }

    /// Writes that must be made available before leaving this layout.
    pub fn src_access_mask(self) -> vk::AccessFlags {
        match self {
            Self::Undefined | Self::PresentSrc => vk::AccessFlags::empty(),
            Self::ColorAttachment => vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            Self::DepthStencilAttachment => vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            Self::DepthStencilReadOnly | Self::ShaderReadOnly | Self::TransferSrc => {
                vk::AccessFlags::empty()
            }
            Self::TransferDst => vk::AccessFlags::TRANSFER_WRITE,
            Self::General => vk::AccessFlags::SHADER_WRITE,
        }
    }

    /// Accesses that must wait for the transition into this layout.
    pub fn dst_access_mask(self) -> vk::AccessFlags {
        match self {
            Self::Undefined | Self::PresentSrc => vk::AccessFlags::empty(),
            Self::ColorAttachment => {
                vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE
            }
            Self::DepthStencilAttachment => {
                vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                    | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE
            }
            Self::DepthStencilReadOnly => {
                vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ | vk::AccessFlags::SHADER_READ
            }
            Self::ShaderReadOnly => vk::AccessFlags::SHADER_READ,
            Self::TransferSrc => vk::AccessFlags::TRANSFER_READ,
            Self::TransferDst => vk::AccessFlags::TRANSFER_WRITE,
            Self::General => vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
        }
    }

    /// Get the pipeline stage for this layout (as source).
    pub fn src_stage(self) -> vk::PipelineStageFlags {
        match self {
            Self::Undefined => vk::PipelineStageFlags::TOP_OF_PIPE,
            Self::ColorAttachment => vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            Self::DepthStencilAttachment => vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
            Self::DepthStencilReadOnly => vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
            Self::ShaderReadOnly => vk::PipelineStageFlags::FRAGMENT_SHADER,
            Self::TransferSrc | Self::TransferDst => vk::PipelineStageFlags::TRANSFER,
            Self::PresentSrc => vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            Self::General => vk::PipelineStageFlags::ALL_COMMANDS,
        }
    }

    /// Get the pipeline stage for this layout (as destination).
    pub fn dst_stage(self) -> vk::PipelineStageFlags {
        match self {
            Self::Undefined => vk::PipelineStageFlags::TOP_OF_PIPE,
            Self::ColorAttachment => vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            Self::DepthStencilAttachment | Self::DepthStencilReadOnly => {
                vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
            }
            Self::ShaderReadOnly => vk::PipelineStageFlags::FRAGMENT_SHADER,
            Self::TransferSrc | Self::TransferDst => vk::PipelineStageFlags::TRANSFER,
            Self::PresentSrc => vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            Self::General => vk::PipelineStageFlags::ALL_COMMANDS,
        }
    }
}

/// Subresources covered by a barrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubresourceRange {
    pub aspect: vk::ImageAspectFlags,
    pub base_mip: u32,
    pub mip_count: u32,
    pub base_layer: u32,
    pub layer_count: u32,
}

impl SubresourceRange {
    /// Every mip and layer of an image.
    pub fn whole(aspect: vk::ImageAspectFlags, mip_count: u32, layer_count: u32) -> Self {
        Self {
            aspect,
            base_mip: 0,
            mip_count,
            base_layer: 0,
            layer_count,
        }
    }

    pub(crate) fn to_vk(self) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: self.aspect,
            base_mip_level: self.base_mip,
            level_count: self.mip_count,
            base_array_layer: self.base_layer,
            layer_count: self.layer_count,
        }
    }
}

/// Record a layout transition. Transitions to the same layout are skipped.
pub fn record_transition(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    range: SubresourceRange,
    old_layout: TextureLayout,
    new_layout: TextureLayout,
) {
    if old_layout == new_layout {
        return;
    }

    let barrier = vk::ImageMemoryBarrier::default()
        .old_layout(old_layout.to_vk())
        .new_layout(new_layout.to_vk())
        .src_access_mask(old_layout.src_access_mask())
        .dst_access_mask(new_layout.dst_access_mask())
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(range.to_vk());

    unsafe {
        device.cmd_pipeline_barrier(
            cmd,
            old_layout.src_stage(),
            new_layout.dst_stage(),
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier],
        );
    }
}

/// Ownership hand-off of a resource written on one queue family and used on
/// another. The release half is recorded on the source queue after the write,
/// the acquire half on the destination queue before any use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueTransfer {
    pub src_family: u32,
    pub dst_family: u32,
}

impl QueueTransfer {
    /// `None` when both families are the same and no hand-off is needed.
    pub fn between(src_family: u32, dst_family: u32) -> Option<Self> {
        (src_family != dst_family).then_some(Self {
            src_family,
            dst_family,
        })
    }

    fn buffer_barrier(
        &self,
        buffer: vk::Buffer,
        src_access: vk::AccessFlags,
        dst_access: vk::AccessFlags,
    ) -> vk::BufferMemoryBarrier<'static> {
        vk::BufferMemoryBarrier::default()
            .src_access_mask(src_access)
            .dst_access_mask(dst_access)
            .src_queue_family_index(self.src_family)
            .dst_queue_family_index(self.dst_family)
            .buffer(buffer)
            .offset(0)
            .size(vk::WHOLE_SIZE)
    }

    /// Release of a buffer after a transfer write.
    pub fn buffer_release(&self, buffer: vk::Buffer) -> vk::BufferMemoryBarrier<'static> {
        self.buffer_barrier(buffer, vk::AccessFlags::TRANSFER_WRITE, vk::AccessFlags::empty())
    }

    /// Acquire of a buffer for any read on the destination queue.
    pub fn buffer_acquire(&self, buffer: vk::Buffer) -> vk::BufferMemoryBarrier<'static> {
        self.buffer_barrier(buffer, vk::AccessFlags::empty(), vk::AccessFlags::MEMORY_READ)
    }

    /// Both halves must carry the same layout change.
    fn image_barrier(
        &self,
        image: vk::Image,
        range: SubresourceRange,
        old_layout: TextureLayout,
        new_layout: TextureLayout,
    ) -> vk::ImageMemoryBarrier<'static> {
        vk::ImageMemoryBarrier::default()
            .old_layout(old_layout.to_vk())
            .new_layout(new_layout.to_vk())
            .src_queue_family_index(self.src_family)
            .dst_queue_family_index(self.dst_family)
            .image(image)
            .subresource_range(range.to_vk())
    }

    /// Release of an image, moving it from `old_layout` to `new_layout`.
    pub fn image_release(
        &self,
        image: vk::Image,
        range: SubresourceRange,
        old_layout: TextureLayout,
        new_layout: TextureLayout,
    ) -> vk::ImageMemoryBarrier<'static> {
        self.image_barrier(image, range, old_layout, new_layout)
            .src_access_mask(old_layout.src_access_mask())
    }

    /// Acquire matching [`image_release`](Self::image_release).
    pub fn image_acquire(
        &self,
        image: vk::Image,
        range: SubresourceRange,
        old_layout: TextureLayout,
        new_layout: TextureLayout,
    ) -> vk::ImageMemoryBarrier<'static> {
        self.image_barrier(image, range, old_layout, new_layout)
            .dst_access_mask(new_layout.dst_access_mask())
    }

    /// Record release barriers on the source queue.
    pub fn record_release(
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        buffers: &[vk::BufferMemoryBarrier<'_>],
        images: &[vk::ImageMemoryBarrier<'_>],
    ) {
        unsafe {
            device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                vk::DependencyFlags::empty(),
                &[],
                buffers,
                images,
            );
        }
    }

    /// Record acquire barriers on the destination queue.
    pub fn record_acquire(
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        buffers: &[vk::BufferMemoryBarrier<'_>],
        images: &[vk::ImageMemoryBarrier<'_>],
    ) {
        unsafe {
            device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::DependencyFlags::empty(),
                &[],
                buffers,
                images,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_to_vk() {
        assert_eq!(
            TextureLayout::ShaderReadOnly.to_vk(),
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        );
        assert_eq!(TextureLayout::default().to_vk(), vk::ImageLayout::UNDEFINED);
    }

    #[test]
    fn test_upload_transition_masks() {
        // Undefined -> TransferDst -> ShaderReadOnly is the staging upload path.
        assert!(TextureLayout::Undefined.src_access_mask().is_empty());
        assert_eq!(
            TextureLayout::TransferDst.dst_access_mask(),
            vk::AccessFlags::TRANSFER_WRITE
        );
        assert_eq!(
            TextureLayout::TransferDst.src_access_mask(),
            vk::AccessFlags::TRANSFER_WRITE
        );
        assert_eq!(
            TextureLayout::ShaderReadOnly.dst_stage(),
            vk::PipelineStageFlags::FRAGMENT_SHADER
        );
    }

    #[test]
    fn test_whole_range() {
        let range = SubresourceRange::whole(vk::ImageAspectFlags::COLOR, 3, 6).to_vk();
        assert_eq!(range.level_count, 3);
        assert_eq!(range.layer_count, 6);
        assert_eq!(range.base_array_layer, 0);
    }

    #[test]
    fn test_same_family_needs_no_transfer() {
        assert_eq!(QueueTransfer::between(0, 0), None);
        assert_eq!(
            QueueTransfer::between(2, 0),
            Some(QueueTransfer {
                src_family: 2,
                dst_family: 0
            })
        );
    }

    #[test]
    fn test_buffer_hand_off_pairs() {
        let transfer = QueueTransfer::between(2, 0).unwrap();
        let buffer = vk::Buffer::null();
        let release = transfer.buffer_release(buffer);
        let acquire = transfer.buffer_acquire(buffer);
        for barrier in [&release, &acquire] {
            assert_eq!(barrier.src_queue_family_index, 2);
            assert_eq!(barrier.dst_queue_family_index, 0);
            assert_eq!(barrier.size, vk::WHOLE_SIZE);
        }
        assert_eq!(release.src_access_mask, vk::AccessFlags::TRANSFER_WRITE);
        assert!(release.dst_access_mask.is_empty());
        assert!(acquire.src_access_mask.is_empty());
        assert_eq!(acquire.dst_access_mask, vk::AccessFlags::MEMORY_READ);
    }

    #[test]
    fn test_image_hand_off_carries_layout_change() {
        let transfer = QueueTransfer::between(1, 0).unwrap();
        let range = SubresourceRange::whole(vk::ImageAspectFlags::COLOR, 1, 6);
        let (from, to) = (TextureLayout::TransferDst, TextureLayout::ShaderReadOnly);
        let release = transfer.image_release(vk::Image::null(), range, from, to);
        let acquire = transfer.image_acquire(vk::Image::null(), range, from, to);
        for barrier in [&release, &acquire] {
            assert_eq!(barrier.old_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
            assert_eq!(barrier.new_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
            assert_eq!(barrier.src_queue_family_index, 1);
            assert_eq!(barrier.dst_queue_family_index, 0);
            assert_eq!(barrier.subresource_range.layer_count, 6);
        }
        assert_eq!(release.src_access_mask, vk::AccessFlags::TRANSFER_WRITE);
        assert!(release.dst_access_mask.is_empty());
        assert!(acquire.src_access_mask.is_empty());
        assert_eq!(acquire.dst_access_mask, vk::AccessFlags::SHADER_READ);
    }
}
