//! Type conversions between Lumen types and Vulkan types.

use ash::vk;

use crate::pipeline::{BlendMode, CullMode, FrontFace, Topology};
use crate::reflect::{InterfaceFormat, NumericKind, ResourceKind, StageFlags};
use crate::types::{
    AddressMode, BufferUsage, CompareFunction, FilterMode, ImageTiling, TextureFormat,
    TextureUsage,
};

/// Convert BufferUsage flags to Vulkan buffer usage flags.
pub fn convert_buffer_usage(usage: BufferUsage) -> vk::BufferUsageFlags {
    let mut result = vk::BufferUsageFlags::empty();

    if usage.contains(BufferUsage::VERTEX) {
        result |= vk::BufferUsageFlags::VERTEX_BUFFER;
    }
    if usage.contains(BufferUsage::INDEX) {
        result |= vk::BufferUsageFlags::INDEX_BUFFER;
    }
    if usage.contains(BufferUsage::UNIFORM) {
        result |= vk::BufferUsageFlags::UNIFORM_BUFFER;
    }
    if usage.contains(BufferUsage::STORAGE) {
        result |= vk::BufferUsageFlags::STORAGE_BUFFER;
    }
    if usage.contains(BufferUsage::INDIRECT) {
        result |= vk::BufferUsageFlags::INDIRECT_BUFFER;
    }
    if usage.contains(BufferUsage::COPY_SRC) {
        result |= vk::BufferUsageFlags::TRANSFER_SRC;
    }
    if usage.contains(BufferUsage::COPY_DST) {
        result |= vk::BufferUsageFlags::TRANSFER_DST;
    }

    result
}

/// Convert TextureFormat to Vulkan format.
pub fn convert_texture_format(format: TextureFormat) -> vk::Format {
    match format {
        TextureFormat::R8Unorm => vk::Format::R8_UNORM,
        TextureFormat::R16Float => vk::Format::R16_SFLOAT,
        TextureFormat::R32Float => vk::Format::R32_SFLOAT,
        TextureFormat::R32Uint => vk::Format::R32_UINT,
        TextureFormat::Rg16Float => vk::Format::R16G16_SFLOAT,
        TextureFormat::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
        TextureFormat::Rgba8UnormSrgb => vk::Format::R8G8B8A8_SRGB,
        TextureFormat::Bgra8Unorm => vk::Format::B8G8R8A8_UNORM,
        TextureFormat::Bgra8UnormSrgb => vk::Format::B8G8R8A8_SRGB,
        TextureFormat::Rgba16Float => vk::Format::R16G16B16A16_SFLOAT,
        TextureFormat::Rgba32Float => vk::Format::R32G32B32A32_SFLOAT,
        TextureFormat::Depth16Unorm => vk::Format::D16_UNORM,
        TextureFormat::Depth32Float => vk::Format::D32_SFLOAT,
        TextureFormat::Depth24UnormStencil8 => vk::Format::D24_UNORM_S8_UINT,
        TextureFormat::Depth32FloatStencil8 => vk::Format::D32_SFLOAT_S8_UINT,
    }
}

/// Convert TextureUsage flags to Vulkan image usage flags.
///
/// The format decides whether RENDER_ATTACHMENT maps to a colour or depth attachment.
pub fn convert_texture_usage(usage: TextureUsage, format: TextureFormat) -> vk::ImageUsageFlags {
    let mut result = vk::ImageUsageFlags::empty();

    if usage.contains(TextureUsage::COPY_SRC) {
        result |= vk::ImageUsageFlags::TRANSFER_SRC;
    }
    if usage.contains(TextureUsage::COPY_DST) {
        result |= vk::ImageUsageFlags::TRANSFER_DST;
    }
    if usage.contains(TextureUsage::TEXTURE_BINDING) {
        result |= vk::ImageUsageFlags::SAMPLED;
    }
    if usage.contains(TextureUsage::STORAGE_BINDING) {
        result |= vk::ImageUsageFlags::STORAGE;
    }
    if usage.contains(TextureUsage::RENDER_ATTACHMENT) {
        if format.is_depth_stencil() {
            result |= vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT;
        } else {
            result |= vk::ImageUsageFlags::COLOR_ATTACHMENT;
        }
    }

    result
}

/// Image aspect touched by views and barriers of this format.
pub fn aspect_mask(format: TextureFormat) -> vk::ImageAspectFlags {
    if format.has_stencil() {
        vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
    } else if format.is_depth_stencil() {
        vk::ImageAspectFlags::DEPTH
    } else {
        vk::ImageAspectFlags::COLOR
    }
}

/// Convert ImageTiling to Vulkan tiling.
pub fn convert_tiling(tiling: ImageTiling) -> vk::ImageTiling {
    match tiling {
        ImageTiling::Optimal => vk::ImageTiling::OPTIMAL,
        ImageTiling::Linear => vk::ImageTiling::LINEAR,
    }
}

/// Convert FilterMode to Vulkan filter.
pub fn convert_filter_mode(mode: FilterMode) -> vk::Filter {
    match mode {
        FilterMode::Nearest => vk::Filter::NEAREST,
        FilterMode::Linear => vk::Filter::LINEAR,
    }
}

/// Convert FilterMode to Vulkan mipmap filter mode.
pub fn convert_mipmap_filter_mode(mode: FilterMode) -> vk::SamplerMipmapMode {
    match mode {
        FilterMode::Nearest => vk::SamplerMipmapMode::NEAREST,
        FilterMode::Linear => vk::SamplerMipmapMode::LINEAR,
    }
}

/// Convert AddressMode to Vulkan sampler address mode.
pub fn convert_address_mode(mode: AddressMode) -> vk::SamplerAddressMode {
    match mode {
        AddressMode::ClampToEdge => vk::SamplerAddressMode::CLAMP_TO_EDGE,
        AddressMode::Repeat => vk::SamplerAddressMode::REPEAT,
        AddressMode::MirrorRepeat => vk::SamplerAddressMode::MIRRORED_REPEAT,
    }
}

/// Convert CompareFunction to Vulkan compare op.
pub fn convert_compare_function(func: CompareFunction) -> vk::CompareOp {
    match func {
        CompareFunction::Never => vk::CompareOp::NEVER,
        CompareFunction::Less => vk::CompareOp::LESS,
        CompareFunction::Equal => vk::CompareOp::EQUAL,
        CompareFunction::LessEqual => vk::CompareOp::LESS_OR_EQUAL,
        CompareFunction::Greater => vk::CompareOp::GREATER,
        CompareFunction::NotEqual => vk::CompareOp::NOT_EQUAL,
        CompareFunction::GreaterEqual => vk::CompareOp::GREATER_OR_EQUAL,
        CompareFunction::Always => vk::CompareOp::ALWAYS,
    }
}

/// Convert reflected stage flags to Vulkan stage flags.
pub fn convert_stage_flags(flags: StageFlags) -> vk::ShaderStageFlags {
    let mut result = vk::ShaderStageFlags::empty();
    if flags.contains(StageFlags::VERTEX) {
        result |= vk::ShaderStageFlags::VERTEX;
    }
    if flags.contains(StageFlags::FRAGMENT) {
        result |= vk::ShaderStageFlags::FRAGMENT;
    }
    if flags.contains(StageFlags::COMPUTE) {
        result |= vk::ShaderStageFlags::COMPUTE;
    }
    result
}

/// Convert a reflected resource kind to a Vulkan descriptor type.
pub fn convert_resource_kind(kind: ResourceKind) -> vk::DescriptorType {
    match kind {
        ResourceKind::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
        ResourceKind::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
        ResourceKind::CombinedImageSampler => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
        ResourceKind::SampledImage => vk::DescriptorType::SAMPLED_IMAGE,
        ResourceKind::StorageImage => vk::DescriptorType::STORAGE_IMAGE,
        ResourceKind::Sampler => vk::DescriptorType::SAMPLER,
    }
}

/// Vulkan sample count flag for a sample count, falling back to one sample.
pub fn convert_sample_count(count: u32) -> vk::SampleCountFlags {
    match count {
        2 => vk::SampleCountFlags::TYPE_2,
        4 => vk::SampleCountFlags::TYPE_4,
        8 => vk::SampleCountFlags::TYPE_8,
        16 => vk::SampleCountFlags::TYPE_16,
        _ => vk::SampleCountFlags::TYPE_1,
    }
}

/// Vertex attribute format for a reflected interface format.
pub fn convert_interface_format(format: InterfaceFormat) -> Option<vk::Format> {
    if format.width != 4 {
        return None;
    }
    let f = match (format.kind, format.components) {
        (NumericKind::Float, 1) => vk::Format::R32_SFLOAT,
        (NumericKind::Float, 2) => vk::Format::R32G32_SFLOAT,
        (NumericKind::Float, 3) => vk::Format::R32G32B32_SFLOAT,
        (NumericKind::Float, 4) => vk::Format::R32G32B32A32_SFLOAT,
        (NumericKind::Sint, 1) => vk::Format::R32_SINT,
        (NumericKind::Sint, 2) => vk::Format::R32G32_SINT,
        (NumericKind::Sint, 3) => vk::Format::R32G32B32_SINT,
        (NumericKind::Sint, 4) => vk::Format::R32G32B32A32_SINT,
        (NumericKind::Uint, 1) => vk::Format::R32_UINT,
        (NumericKind::Uint, 2) => vk::Format::R32G32_UINT,
        (NumericKind::Uint, 3) => vk::Format::R32G32B32_UINT,
        (NumericKind::Uint, 4) => vk::Format::R32G32B32A32_UINT,
        _ => return None,
    };
    Some(f)
}

pub fn convert_cull_mode(mode: CullMode) -> vk::CullModeFlags {
    match mode {
        CullMode::None => vk::CullModeFlags::NONE,
        CullMode::Front => vk::CullModeFlags::FRONT,
        CullMode::Back => vk::CullModeFlags::BACK,
    }
}

pub fn convert_front_face(face: FrontFace) -> vk::FrontFace {
    match face {
        FrontFace::CounterClockwise => vk::FrontFace::COUNTER_CLOCKWISE,
        FrontFace::Clockwise => vk::FrontFace::CLOCKWISE,
    }
}

pub fn convert_topology(topology: Topology) -> vk::PrimitiveTopology {
    match topology {
        Topology::TriangleList => vk::PrimitiveTopology::TRIANGLE_LIST,
        Topology::TriangleStrip => vk::PrimitiveTopology::TRIANGLE_STRIP,
        Topology::LineList => vk::PrimitiveTopology::LINE_LIST,
        Topology::PointList => vk::PrimitiveTopology::POINT_LIST,
    }
}

/// Colour blend state of one attachment.
pub fn convert_blend_mode(mode: BlendMode) -> vk::PipelineColorBlendAttachmentState {
    let state =
        vk::PipelineColorBlendAttachmentState::default().color_write_mask(vk::ColorComponentFlags::RGBA);
    match mode {
        BlendMode::Opaque => state.blend_enable(false),
        BlendMode::AlphaBlend => state
            .blend_enable(true)
            .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
            .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .color_blend_op(vk::BlendOp::ADD)
            .src_alpha_blend_factor(vk::BlendFactor::ONE)
            .dst_alpha_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .alpha_blend_op(vk::BlendOp::ADD),
        BlendMode::Additive => state
            .blend_enable(true)
            .src_color_blend_factor(vk::BlendFactor::ONE)
            .dst_color_blend_factor(vk::BlendFactor::ONE)
            .color_blend_op(vk::BlendOp::ADD)
            .src_alpha_blend_factor(vk::BlendFactor::ONE)
            .dst_alpha_blend_factor(vk::BlendFactor::ONE)
            .alpha_blend_op(vk::BlendOp::ADD),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_attachment_follows_format() {
        let color = convert_texture_usage(TextureUsage::RENDER_ATTACHMENT, TextureFormat::Rgba8Unorm);
        assert_eq!(color, vk::ImageUsageFlags::COLOR_ATTACHMENT);

        let depth =
            convert_texture_usage(TextureUsage::RENDER_ATTACHMENT, TextureFormat::Depth32Float);
        assert_eq!(depth, vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT);
    }

    #[test]
    fn test_aspect_mask() {
        assert_eq!(
            aspect_mask(TextureFormat::Depth24UnormStencil8),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
        assert_eq!(
            aspect_mask(TextureFormat::Rgba16Float),
            vk::ImageAspectFlags::COLOR
        );
    }

    #[test]
    fn test_stage_flags() {
        let flags = convert_stage_flags(StageFlags::VERTEX | StageFlags::FRAGMENT);
        assert_eq!(
            flags,
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT
        );
    }

    #[test]
    fn test_interface_format() {
        assert_eq!(
            convert_interface_format(InterfaceFormat::float(3)),
            Some(vk::Format::R32G32B32_SFLOAT)
        );
        let half = InterfaceFormat {
            kind: NumericKind::Float,
            components: 2,
            width: 2,
        };
        assert_eq!(convert_interface_format(half), None);
    }

    #[test]
    fn test_blend_modes() {
        assert_eq!(convert_blend_mode(BlendMode::Opaque).blend_enable, vk::FALSE);
        let alpha = convert_blend_mode(BlendMode::AlphaBlend);
        assert_eq!(alpha.dst_color_blend_factor, vk::BlendFactor::ONE_MINUS_SRC_ALPHA);
    }
}
