//! Equirectangular panorama to cubemap conversion.
//!
//! [`CubemapConverter::convert`] renders all six faces of a new cube image in
//! a single multiview pass: view `i` of the pass writes array layer `i`, the
//! cube proxy geometry is generated in the vertex shader and every fragment
//! samples the panorama along its own direction. The conversion blocks until
//! the GPU is done, so it belongs in loading code rather than in a frame.
//!
//! The expected face content is defined on the CPU by [`face_direction`],
//! [`direction_to_equirect_uv`] and [`sample_equirect`].

mod faces;

use std::collections::HashMap;

use ash::vk;
use parking_lot::Mutex;

pub use faces::{
    direction_to_equirect_uv, face_direction, face_projection, sample_equirect, CubeFace,
};

use crate::backend::vulkan::layout::record_transition;
use crate::backend::vulkan::{SubresourceRange, TextureLayout};
use crate::context::DeviceContext;
use crate::error::{GraphicsError, GraphicsResult};
use crate::pipeline::{
    sampled_output_dependencies, AttachmentDesc, DescriptorPoolSizing, FixedFunctionState,
    GraphicsPipeline, GraphicsPipelineDesc, LoadAction, LoadStoreConfig, MultiviewDesc,
    PipelineFactory, RenderPass, ResourceBinding, ShaderModule, ShaderStageDesc, StoreAction,
    SubpassDesc, Technique,
};
use crate::reflect::ShaderStage;
use crate::resources::{Buffer, Image, ImageView, Sampler};
use crate::types::{
    AddressMode, BufferDescriptor, BufferUsage, ClearValue, Extent2d, ImageTiling, MemoryUsage,
    SamplerDescriptor, TextureDescriptor, TextureFormat, TextureUsage, Viewport,
};
use faces::CubeUniforms;

const SHADER_WGSL: &str = include_str!("../../shaders/equirect_to_cube.wgsl");

/// Face size used when neither the config nor the source gives one.
pub const DEFAULT_FACE_SIZE: u32 = 512;

const FACE_COUNT: u32 = 6;
const ALL_FACES_MASK: u32 = (1 << FACE_COUNT) - 1;
/// Two triangles per face.
const PROXY_VERTEX_COUNT: u32 = 36;

/// Output of a conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CubemapConfig {
    /// Edge length of each face; `None` uses the source height.
    pub face_size: Option<u32>,
    pub format: TextureFormat,
    /// Mip levels of the cube image. Levels past the first are blitted down
    /// from level 0.
    pub mip_levels: u32,
}

impl Default for CubemapConfig {
    fn default() -> Self {
        Self {
            face_size: None,
            format: TextureFormat::Rgba16Float,
            mip_levels: 1,
        }
    }
}

impl CubemapConfig {
    pub fn with_face_size(mut self, size: u32) -> Self {
        self.face_size = Some(size);
        self
    }

    pub fn with_format(mut self, format: TextureFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_mip_levels(mut self, count: u32) -> Self {
        self.mip_levels = count;
        self
    }

    /// Face edge for a source of `source` size.
    pub fn face_size_for(&self, source: Option<Extent2d>) -> u32 {
        self.face_size
            .or_else(|| source.filter(|s| !s.is_empty()).map(|s| s.height))
            .unwrap_or(DEFAULT_FACE_SIZE)
    }

    /// Check the face size and mip count against each other.
    fn validate(&self, face_size: u32) -> GraphicsResult<()> {
        if face_size == 0 {
            return Err(GraphicsError::InvalidParameter(
                "cubemap face size must be non-zero".to_string(),
            ));
        }
        let max_mips = TextureDescriptor::full_mip_chain(Extent2d::new(face_size, face_size));
        if self.mip_levels == 0 || self.mip_levels > max_mips {
            return Err(GraphicsError::InvalidParameter(format!(
                "{} mip levels requested, a {face_size}px face has 1..={max_mips}",
                self.mip_levels
            )));
        }
        Ok(())
    }
}

/// Usage of every cube image the converter creates.
fn cube_usage() -> TextureUsage {
    TextureUsage::RENDER_ATTACHMENT
        | TextureUsage::TEXTURE_BINDING
        | TextureUsage::COPY_SRC
        | TextureUsage::COPY_DST
}

/// Render pass and pipeline for one output format.
#[derive(Debug, Clone)]
struct CubeTarget {
    render_pass: RenderPass,
    pipeline: GraphicsPipeline,
}

/// Renders equirectangular images into cube images.
///
/// Shader modules and layouts are built once; the render pass and pipeline
/// are built the first time each output format is requested.
pub struct CubemapConverter {
    vertex: ShaderModule,
    fragment: ShaderModule,
    technique: Technique,
    sampler: Sampler,
    uniforms: Buffer,
    targets: Mutex<HashMap<TextureFormat, CubeTarget>>,
}

impl CubemapConverter {
    pub fn new(ctx: &DeviceContext, factory: &PipelineFactory) -> GraphicsResult<Self> {
        let vertex = factory.create_wgsl_module(SHADER_WGSL, ShaderStage::Vertex, "vs_main")?;
        let fragment = factory.create_wgsl_module(SHADER_WGSL, ShaderStage::Fragment, "fs_main")?;
        let technique = factory.create_technique(&[
            ShaderStageDesc::new(&vertex, ShaderStage::Vertex),
            ShaderStageDesc::new(&fragment, ShaderStage::Fragment),
        ])?;

        // Longitude wraps, latitude stops at the poles.
        let sampler = ctx.create_sampler(&SamplerDescriptor {
            address_mode_u: AddressMode::Repeat,
            address_mode_v: AddressMode::ClampToEdge,
            address_mode_w: AddressMode::ClampToEdge,
            ..SamplerDescriptor::linear()
        })?;

        let uniforms = ctx.create_buffer_with_data(
            &BufferDescriptor::new(0, BufferUsage::UNIFORM, MemoryUsage::GpuOnly)
                .with_label("cubemap face matrices"),
            bytemuck::bytes_of(&CubeUniforms::new()),
        )?;

        log::debug!(
            "Created cubemap converter ({} descriptor sets)",
            technique.sets.len()
        );
        Ok(Self {
            vertex,
            fragment,
            technique,
            sampler,
            uniforms,
            targets: Mutex::new(HashMap::new()),
        })
    }

    fn target(&self, factory: &PipelineFactory, format: TextureFormat) -> GraphicsResult<CubeTarget> {
        let mut targets = self.targets.lock();
        if let Some(target) = targets.get(&format) {
            return Ok(target.clone());
        }

        let attachment = AttachmentDesc::new(format, cube_usage()).with_layers(FACE_COUNT);
        let config = LoadStoreConfig {
            color_load: LoadAction::Clear,
            color_store: StoreAction::Read,
            ..LoadStoreConfig::default()
        };
        let render_pass = factory.create_render_pass_multiview(
            &[attachment],
            config,
            &[SubpassDesc::new().with_color(0)],
            &sampled_output_dependencies(),
            &MultiviewDesc::uniform(ALL_FACES_MASK, 1),
        )?;

        let stages = [
            ShaderStageDesc::new(&self.vertex, ShaderStage::Vertex),
            ShaderStageDesc::new(&self.fragment, ShaderStage::Fragment),
        ];
        let pipeline = factory.create_graphics_pipeline(&GraphicsPipelineDesc {
            stages: &stages,
            layout: &self.technique.layout,
            render_pass: &render_pass,
            subpass: 0,
            state: FixedFunctionState::cube_proxy(),
        })?;

        let target = CubeTarget {
            render_pass,
            pipeline,
        };
        targets.insert(format, target.clone());
        Ok(target)
    }

    /// Render `source` into a new cube image and wait for the GPU.
    ///
    /// `source` must be a 2D view in shader-read-only layout of a format that
    /// supports linear filtering. The returned image is in shader-read-only
    /// layout with every mip level filled.
    pub fn convert(
        &self,
        ctx: &DeviceContext,
        factory: &PipelineFactory,
        source: &ImageView,
        config: &CubemapConfig,
    ) -> GraphicsResult<Image> {
        check_source(ctx, source)?;
        let face_size = config.face_size_for(Some(source.extent()));
        config.validate(face_size)?;

        let mut features =
            vk::FormatFeatureFlags::COLOR_ATTACHMENT | vk::FormatFeatureFlags::SAMPLED_IMAGE;
        if config.mip_levels > 1 {
            features |= vk::FormatFeatureFlags::BLIT_SRC
                | vk::FormatFeatureFlags::BLIT_DST
                | vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR;
        }
        ctx.find_supported_format(&[config.format], ImageTiling::Optimal, features)?;

        let target = self.target(factory, config.format)?;
        let image = ctx.create_image_cube(
            &TextureDescriptor::new_2d(face_size, face_size, config.format, cube_usage())
                .with_mip_levels(config.mip_levels)
                .with_label("cubemap"),
        )?;
        let faces_view = ctx.create_image_view(
            &image,
            vk::ImageViewType::TYPE_2D_ARRAY,
            SubresourceRange {
                aspect: vk::ImageAspectFlags::COLOR,
                base_mip: 0,
                mip_count: 1,
                base_layer: 0,
                layer_count: FACE_COUNT,
            },
        )?;
        let extent = Extent2d::new(face_size, face_size);
        let framebuffer = factory.create_framebuffer(&target.render_pass, &[&faces_view], extent)?;

        let (Some(source_set), Some(uniform_set)) = (self.technique.set(0), self.technique.set(1))
        else {
            return Err(GraphicsError::InvalidState(
                "cubemap shader lost its descriptor sets".to_string(),
            ));
        };
        let pool = factory.create_descriptor_pool(DescriptorPoolSizing::from_layouts(
            &[source_set.desc().clone(), uniform_set.desc().clone()],
            1,
        ))?;
        let source_material = factory.create_material_set(
            &pool,
            source_set,
            &[
                ResourceBinding::SampledImage(source),
                ResourceBinding::Sampler(&self.sampler),
            ],
        )?;
        let uniform_material =
            factory.create_material_set(&pool, uniform_set, &[ResourceBinding::uniform(&self.uniforms)])?;

        let mip_levels = config.mip_levels;
        ctx.execute_one_shot(|device, cmd| {
            let clear = [ClearValue::color(0.0, 0.0, 0.0, 1.0).to_vk()];
            let begin = vk::RenderPassBeginInfo::default()
                .render_pass(target.render_pass.handle)
                .framebuffer(framebuffer.handle)
                .render_area(extent.rect())
                .clear_values(&clear);
            unsafe {
                device.cmd_begin_render_pass(cmd, &begin, vk::SubpassContents::INLINE);
                device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, target.pipeline.handle);
                device.cmd_bind_descriptor_sets(
                    cmd,
                    vk::PipelineBindPoint::GRAPHICS,
                    self.technique.layout.handle,
                    0,
                    &[source_material.handle(), uniform_material.handle()],
                    &[],
                );
                device.cmd_set_viewport(cmd, 0, &[Viewport::from_extent(extent).to_vk()]);
                device.cmd_set_scissor(cmd, 0, &[extent.rect()]);
                device.cmd_draw(cmd, PROXY_VERTEX_COUNT, 1, 0, 0);
                device.cmd_end_render_pass(cmd);
            }
            if mip_levels > 1 {
                record_mip_chain(device, cmd, image.handle(), face_size, mip_levels);
            }
            Ok(())
        })?;
        image.set_layout(TextureLayout::ShaderReadOnly);

        log::info!(
            "Converted {}x{} panorama to {}px cubemap ({:?}, {} mips)",
            source.extent().width,
            source.extent().height,
            face_size,
            config.format,
            mip_levels
        );
        Ok(image)
    }
}

impl std::fmt::Debug for CubemapConverter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CubemapConverter")
            .field("formats", &self.targets.lock().keys().collect::<Vec<_>>())
            .finish()
    }
}

/// The panorama must be a filterable colour 2D view.
fn check_source(ctx: &DeviceContext, source: &ImageView) -> GraphicsResult<()> {
    let format = source.format();
    if source.view_type() != vk::ImageViewType::TYPE_2D {
        return Err(GraphicsError::SourceFormatUnsupported(format!(
            "expected a 2D view, got {:?}",
            source.view_type()
        )));
    }
    if source.extent().is_empty() {
        return Err(GraphicsError::SourceFormatUnsupported(
            "source image is empty".to_string(),
        ));
    }
    if format.is_depth_stencil() || format.is_integer() {
        return Err(GraphicsError::SourceFormatUnsupported(format!(
            "{format:?} cannot be filtered"
        )));
    }
    ctx.find_supported_format(
        &[format],
        ImageTiling::Optimal,
        vk::FormatFeatureFlags::SAMPLED_IMAGE | vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR,
    )
    .map_err(|_| {
        GraphicsError::SourceFormatUnsupported(format!("{format:?} lacks linear filtering"))
    })?;

    let extent = source.extent();
    if extent.width != extent.height * 2 {
        log::warn!(
            "Equirectangular source is {}x{}, expected a 2:1 aspect ratio",
            extent.width,
            extent.height
        );
    }
    Ok(())
}

/// Edge length of mip `level` of a `size` face.
fn mip_size(size: u32, level: u32) -> u32 {
    (size >> level).max(1)
}

/// Fill levels `1..mip_levels` from level 0, which is in shader-read-only
/// layout. Every level ends in shader-read-only layout.
fn record_mip_chain(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    size: u32,
    mip_levels: u32,
) {
    let level = |mip: u32| SubresourceRange {
        aspect: vk::ImageAspectFlags::COLOR,
        base_mip: mip,
        mip_count: 1,
        base_layer: 0,
        layer_count: FACE_COUNT,
    };
    let layers = |mip: u32| vk::ImageSubresourceLayers {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        mip_level: mip,
        base_array_layer: 0,
        layer_count: FACE_COUNT,
    };
    let corner = |edge: u32| vk::Offset3D {
        x: edge as i32,
        y: edge as i32,
        z: 1,
    };

    record_transition(
        device,
        cmd,
        image,
        level(0),
        TextureLayout::ShaderReadOnly,
        TextureLayout::TransferSrc,
    );
    for mip in 1..mip_levels {
        record_transition(
            device,
            cmd,
            image,
            level(mip),
            TextureLayout::Undefined,
            TextureLayout::TransferDst,
        );
        let blit = vk::ImageBlit::default()
            .src_subresource(layers(mip - 1))
            .src_offsets([vk::Offset3D::default(), corner(mip_size(size, mip - 1))])
            .dst_subresource(layers(mip))
            .dst_offsets([vk::Offset3D::default(), corner(mip_size(size, mip))]);
        unsafe {
            device.cmd_blit_image(
                cmd,
                image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[blit],
                vk::Filter::LINEAR,
            )
        };
        record_transition(
            device,
            cmd,
            image,
            level(mip),
            TextureLayout::TransferDst,
            TextureLayout::TransferSrc,
        );
    }
    record_transition(
        device,
        cmd,
        image,
        SubresourceRange::whole(vk::ImageAspectFlags::COLOR, mip_levels, FACE_COUNT),
        TextureLayout::TransferSrc,
        TextureLayout::ShaderReadOnly,
    );
}
