//! Render pass descriptions.
//!
//! Attachments declare format and usage; a [`LoadStoreConfig`] picks the
//! load/store operations and the layouts each attachment enters and leaves the
//! pass in. Multiview passes broadcast every draw to the layers selected by
//! each subpass's view mask.

use ash::vk;

use crate::backend::vulkan::conversion::{convert_sample_count, convert_texture_format};
use crate::error::{GraphicsError, GraphicsResult};
use crate::resources::{ImageView, LiveToken};
use crate::types::{Extent2d, TextureFormat, TextureUsage};

/// What happens to an attachment's contents when the pass begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoadAction {
    /// Clear to the pass clear value.
    Clear,
    /// Load contents written and then sampled by an earlier pass.
    Read,
    /// Contents are undefined.
    DontCare,
    /// Load contents left in attachment layout by an earlier pass.
    Continue,
}

/// What happens to an attachment's contents when the pass ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreAction {
    /// Store for sampling (or storage access) by a later pass.
    Read,
    DontCare,
    /// Store and stay in attachment layout for a later pass.
    Continue,
}

/// Load and store actions for colour and depth attachments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LoadStoreConfig {
    pub color_load: LoadAction,
    pub color_store: StoreAction,
    pub depth_load: LoadAction,
    pub depth_store: StoreAction,
}

impl Default for LoadStoreConfig {
    /// Clear everything, keep colour for sampling, discard depth.
    fn default() -> Self {
        Self {
            color_load: LoadAction::Clear,
            color_store: StoreAction::Read,
            depth_load: LoadAction::Clear,
            depth_store: StoreAction::DontCare,
        }
    }
}

/// One attachment of a render pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttachmentDesc {
    pub format: TextureFormat,
    /// Must include [`TextureUsage::RENDER_ATTACHMENT`].
    pub usage: TextureUsage,
    pub samples: u32,
    /// Array layers of the images bound to this attachment.
    pub layers: u32,
}

impl AttachmentDesc {
    pub fn new(format: TextureFormat, usage: TextureUsage) -> Self {
        Self {
            format,
            usage,
            samples: 1,
            layers: 1,
        }
    }

    pub fn with_layers(mut self, layers: u32) -> Self {
        self.layers = layers;
        self
    }

    pub fn with_samples(mut self, samples: u32) -> Self {
        self.samples = samples;
        self
    }

    pub fn is_depth(&self) -> bool {
        self.format.is_depth_stencil()
    }

    /// Registry key: format, usage and sample count.
    pub(crate) fn signature(&self) -> (TextureFormat, u32, u32) {
        (self.format, self.usage.bits(), self.samples)
    }
}

/// Layout an attachment rests in between passes, given how it is used.
fn resting_layout(desc: &AttachmentDesc) -> vk::ImageLayout {
    match (
        desc.is_depth(),
        desc.usage.contains(TextureUsage::TEXTURE_BINDING),
        desc.usage.contains(TextureUsage::STORAGE_BINDING),
    ) {
        (true, true, _) => vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
        (true, false, _) => vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        (false, true, _) => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        (false, false, true) => vk::ImageLayout::GENERAL,
        (false, false, false) => vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    }
}

fn attachment_layout(desc: &AttachmentDesc) -> vk::ImageLayout {
    if desc.is_depth() {
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
    } else {
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
    }
}

/// Build the attachment description for `desc` under `config`.
pub(crate) fn attachment_description(
    desc: &AttachmentDesc,
    config: LoadStoreConfig,
) -> GraphicsResult<vk::AttachmentDescription> {
    if !desc.usage.contains(TextureUsage::RENDER_ATTACHMENT) {
        return Err(GraphicsError::InvalidParameter(format!(
            "attachment {:?} with usage {:?} is neither colour nor depth target",
            desc.format, desc.usage
        )));
    }
    let (load, store) = if desc.is_depth() {
        (config.depth_load, config.depth_store)
    } else {
        (config.color_load, config.color_store)
    };

    let (load_op, initial_layout) = match load {
        LoadAction::Clear => (vk::AttachmentLoadOp::CLEAR, vk::ImageLayout::UNDEFINED),
        LoadAction::DontCare => (vk::AttachmentLoadOp::DONT_CARE, vk::ImageLayout::UNDEFINED),
        LoadAction::Read => (vk::AttachmentLoadOp::LOAD, resting_layout(desc)),
        LoadAction::Continue => (vk::AttachmentLoadOp::LOAD, attachment_layout(desc)),
    };
    let (store_op, final_layout) = match store {
        StoreAction::Read => (vk::AttachmentStoreOp::STORE, resting_layout(desc)),
        StoreAction::DontCare => (vk::AttachmentStoreOp::DONT_CARE, attachment_layout(desc)),
        StoreAction::Continue => (vk::AttachmentStoreOp::STORE, attachment_layout(desc)),
    };
    let (stencil_load_op, stencil_store_op) = if desc.format.has_stencil() {
        (load_op, store_op)
    } else {
        (vk::AttachmentLoadOp::DONT_CARE, vk::AttachmentStoreOp::DONT_CARE)
    };

    Ok(vk::AttachmentDescription::default()
        .format(convert_texture_format(desc.format))
        .samples(convert_sample_count(desc.samples))
        .load_op(load_op)
        .store_op(store_op)
        .stencil_load_op(stencil_load_op)
        .stencil_store_op(stencil_store_op)
        .initial_layout(initial_layout)
        .final_layout(final_layout))
}

/// Attachment indices used by one subpass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubpassDesc {
    pub color_attachments: Vec<u32>,
    pub depth_attachment: Option<u32>,
    pub input_attachments: Vec<u32>,
}

impl SubpassDesc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_color(mut self, attachment: u32) -> Self {
        self.color_attachments.push(attachment);
        self
    }

    pub fn with_depth(mut self, attachment: u32) -> Self {
        self.depth_attachment = Some(attachment);
        self
    }

    pub fn with_input(mut self, attachment: u32) -> Self {
        self.input_attachments.push(attachment);
        self
    }
}

/// Check attachment indices and that colour and depth slots hold matching formats.
pub(crate) fn validate_subpasses(
    attachments: &[AttachmentDesc],
    subpasses: &[SubpassDesc],
) -> GraphicsResult<()> {
    if subpasses.is_empty() {
        return Err(GraphicsError::RenderPassCreationFailed(
            "a render pass needs at least one subpass".to_string(),
        ));
    }
    let lookup = |subpass: usize, index: u32| {
        attachments.get(index as usize).ok_or_else(|| {
            GraphicsError::RenderPassCreationFailed(format!(
                "subpass {subpass} references attachment {index}, only {} exist",
                attachments.len()
            ))
        })
    };
    for (i, subpass) in subpasses.iter().enumerate() {
        for &index in &subpass.color_attachments {
            if lookup(i, index)?.is_depth() {
                return Err(GraphicsError::RenderPassCreationFailed(format!(
                    "subpass {i} uses depth attachment {index} as colour"
                )));
            }
        }
        if let Some(index) = subpass.depth_attachment {
            if !lookup(i, index)?.is_depth() {
                return Err(GraphicsError::RenderPassCreationFailed(format!(
                    "subpass {i} uses colour attachment {index} as depth"
                )));
            }
        }
        for &index in &subpass.input_attachments {
            lookup(i, index)?;
        }
    }
    Ok(())
}

/// View masks for a multiview render pass, one per subpass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiviewDesc {
    pub view_masks: Vec<u32>,
    /// Views likely to be rendered with spatial coherence.
    pub correlation_masks: Vec<u32>,
}

impl MultiviewDesc {
    /// Every subpass renders the same `mask`.
    pub fn uniform(mask: u32, subpass_count: usize) -> Self {
        Self {
            view_masks: vec![mask; subpass_count],
            correlation_masks: vec![mask],
        }
    }
}

/// Device limits relevant to multiview.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MultiviewSupport {
    pub supported: bool,
    pub max_view_count: u32,
}

/// Validate a multiview request against the attachments and device.
pub(crate) fn validate_multiview(
    attachments: &[AttachmentDesc],
    subpass_count: usize,
    multiview: &MultiviewDesc,
    support: MultiviewSupport,
) -> GraphicsResult<()> {
    if !support.supported {
        return Err(GraphicsError::MultiviewUnsupported(
            "device does not support the multiview feature".to_string(),
        ));
    }
    if multiview.view_masks.len() != subpass_count {
        return Err(GraphicsError::RenderPassCreationFailed(format!(
            "{} view masks for {} subpasses",
            multiview.view_masks.len(),
            subpass_count
        )));
    }
    let Some(layers) = attachments.first().map(|a| a.layers) else {
        return Err(GraphicsError::RenderPassCreationFailed(
            "multiview pass without attachments".to_string(),
        ));
    };
    if let Some(odd) = attachments.iter().find(|a| a.layers != layers) {
        return Err(GraphicsError::MultiviewUnsupported(format!(
            "attachment layer counts differ ({} vs {})",
            layers, odd.layers
        )));
    }
    for (i, &mask) in multiview.view_masks.iter().enumerate() {
        if mask == 0 {
            return Err(GraphicsError::RenderPassCreationFailed(format!(
                "subpass {i} has an empty view mask"
            )));
        }
        let views = 32 - mask.leading_zeros();
        if views > support.max_view_count {
            return Err(GraphicsError::MultiviewUnsupported(format!(
                "view mask {mask:#b} needs {views} views, device allows {}",
                support.max_view_count
            )));
        }
        if views > layers {
            return Err(GraphicsError::RenderPassCreationFailed(format!(
                "view mask {mask:#b} exceeds the {layers} attachment layers"
            )));
        }
    }
    Ok(())
}

/// Dependencies for a single-subpass pass whose results are sampled afterwards.
pub fn sampled_output_dependencies() -> Vec<vk::SubpassDependency> {
    vec![
        vk::SubpassDependency::default()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .dst_subpass(0)
            .src_stage_mask(vk::PipelineStageFlags::FRAGMENT_SHADER)
            .dst_stage_mask(
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                    | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
            )
            .src_access_mask(vk::AccessFlags::SHADER_READ)
            .dst_access_mask(
                vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                    | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            )
            .dependency_flags(vk::DependencyFlags::BY_REGION),
        vk::SubpassDependency::default()
            .src_subpass(0)
            .dst_subpass(vk::SUBPASS_EXTERNAL)
            .src_stage_mask(
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                    | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
            )
            .dst_stage_mask(
                vk::PipelineStageFlags::FRAGMENT_SHADER | vk::PipelineStageFlags::TRANSFER,
            )
            .src_access_mask(
                vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                    | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            )
            .dst_access_mask(vk::AccessFlags::SHADER_READ | vk::AccessFlags::TRANSFER_READ)
            .dependency_flags(vk::DependencyFlags::BY_REGION),
    ]
}

/// A render pass created by the [`PipelineFactory`](super::PipelineFactory).
#[derive(Debug, Clone)]
pub struct RenderPass {
    pub(crate) handle: vk::RenderPass,
    format_id: u32,
    attachments: Vec<AttachmentDesc>,
    subpass_color_counts: Vec<u32>,
    view_masks: Option<Vec<u32>>,
}

impl RenderPass {
    pub(crate) fn new(
        handle: vk::RenderPass,
        format_id: u32,
        attachments: &[AttachmentDesc],
        subpasses: &[SubpassDesc],
        view_masks: Option<Vec<u32>>,
    ) -> Self {
        Self {
            handle,
            format_id,
            attachments: attachments.to_vec(),
            subpass_color_counts: subpasses
                .iter()
                .map(|s| s.color_attachments.len() as u32)
                .collect(),
            view_masks,
        }
    }

    pub fn handle(&self) -> vk::RenderPass {
        self.handle
    }

    /// Framebuffer format ID; passes with equal attachment formats share it.
    pub fn format_id(&self) -> u32 {
        self.format_id
    }

    pub fn attachments(&self) -> &[AttachmentDesc] {
        &self.attachments
    }

    pub fn subpass_count(&self) -> usize {
        self.subpass_color_counts.len()
    }

    /// Colour attachments written by `subpass`.
    pub fn color_attachment_count(&self, subpass: u32) -> Option<u32> {
        self.subpass_color_counts.get(subpass as usize).copied()
    }

    /// View masks for multiview passes.
    pub fn view_masks(&self) -> Option<&[u32]> {
        self.view_masks.as_deref()
    }
}

/// Image views bound to the attachments of a render pass. Owned by its creator.
pub struct Framebuffer {
    device: ash::Device,
    pub(crate) handle: vk::Framebuffer,
    extent: Extent2d,
    format_id: u32,
    _token: LiveToken,
}

impl Framebuffer {
    pub(crate) fn new(
        device: &ash::Device,
        render_pass: &RenderPass,
        views: &[&ImageView],
        extent: Extent2d,
        token: LiveToken,
    ) -> GraphicsResult<Self> {
        check_framebuffer_views(render_pass, views, extent)?;
        let handles: Vec<vk::ImageView> = views.iter().map(|v| v.handle()).collect();
        // Multiview broadcasts through the view mask; the framebuffer itself has one layer.
        let layers = if render_pass.view_masks().is_some() {
            1
        } else {
            views.iter().map(|v| v.layer_count()).min().unwrap_or(1)
        };
        let create_info = vk::FramebufferCreateInfo::default()
            .render_pass(render_pass.handle)
            .attachments(&handles)
            .width(extent.width)
            .height(extent.height)
            .layers(layers);
        let handle = unsafe { device.create_framebuffer(&create_info, None) }?;
        Ok(Self {
            device: device.clone(),
            handle,
            extent,
            format_id: render_pass.format_id(),
            _token: token,
        })
    }

    pub fn handle(&self) -> vk::Framebuffer {
        self.handle
    }

    pub fn extent(&self) -> Extent2d {
        self.extent
    }

    /// Format ID of the render pass it was created for.
    pub fn format_id(&self) -> u32 {
        self.format_id
    }
}

impl Drop for Framebuffer {
    fn drop(&mut self) {
        unsafe { self.device.destroy_framebuffer(self.handle, None) };
    }
}

impl std::fmt::Debug for Framebuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Framebuffer")
            .field("handle", &self.handle)
            .field("extent", &self.extent)
            .finish()
    }
}

fn check_framebuffer_views(
    render_pass: &RenderPass,
    views: &[&ImageView],
    extent: Extent2d,
) -> GraphicsResult<()> {
    let attachments = render_pass.attachments();
    if views.len() != attachments.len() {
        return Err(GraphicsError::InvalidParameter(format!(
            "render pass has {} attachments, {} views given",
            attachments.len(),
            views.len()
        )));
    }
    if extent.is_empty() {
        return Err(GraphicsError::InvalidParameter(
            "framebuffer extent must be non-zero".to_string(),
        ));
    }
    for (i, (view, attachment)) in views.iter().zip(attachments).enumerate() {
        if view.format() != attachment.format {
            return Err(GraphicsError::InvalidParameter(format!(
                "attachment {i} is {:?}, view is {:?}",
                attachment.format,
                view.format()
            )));
        }
        if view.extent().width < extent.width || view.extent().height < extent.height {
            return Err(GraphicsError::InvalidParameter(format!(
                "attachment {i} view is smaller than the framebuffer"
            )));
        }
        if view.layer_count() < attachment.layers {
            return Err(GraphicsError::InvalidParameter(format!(
                "attachment {i} needs {} layers, view has {}",
                attachment.layers,
                view.layer_count()
            )));
        }
    }
    Ok(())
}
