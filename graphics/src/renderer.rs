//! Frame rendering on top of the context and the pipeline factory.
//!
//! A frame goes through three calls:
//!
//! ```text
//! begin_frame ──► record_draws (any number of times) ──► complete
//! ```
//!
//! `begin_frame` waits on the fence of the frame-in-flight slot it reuses, so
//! the CPU never runs more than `frames_in_flight` frames ahead of the GPU.
//! Nothing is created on this path: meshes, pipelines and material sets are
//! built while loading and only referenced by [`Drawable`]s.

use ash::vk;
use glam::Mat4;

use crate::backend::vulkan::TextureLayout;
use crate::context::DeviceContext;
use crate::error::{GraphicsError, GraphicsResult};
use crate::pipeline::{
    sampled_output_dependencies, AttachmentDesc, FixedFunctionState, Framebuffer, GraphicsPipeline,
    GraphicsPipelineDesc, LoadStoreConfig, MaterialDescriptorSet, PipelineFactory, PipelineLayout,
    PushConstantRange, RenderPass, ShaderStageDesc, SubpassDesc, Vertex,
};
use crate::resources::{Buffer, Image, ImageView};
use crate::sync::FrameSync;
use crate::types::{
    BufferDescriptor, BufferUsage, ClearValue, Extent2d, MemoryUsage, TextureDescriptor,
    TextureFormat, TextureUsage, Viewport,
};

/// Vertex and optional index data on the GPU.
pub struct Mesh {
    vertices: Buffer,
    indices: Option<Buffer>,
    vertex_count: u32,
    index_count: u32,
}

impl Mesh {
    /// Upload `vertices` and `indices`; an empty index list draws unindexed.
    pub fn new(ctx: &DeviceContext, vertices: &[Vertex], indices: &[u32]) -> GraphicsResult<Self> {
        if vertices.is_empty() {
            return Err(GraphicsError::InvalidParameter(
                "mesh needs at least one vertex".to_string(),
            ));
        }
        let vertex_buffer = ctx.create_buffer_with_data(
            &BufferDescriptor::new(0, BufferUsage::VERTEX, MemoryUsage::GpuOnly).with_label("mesh vertices"),
            bytemuck::cast_slice(vertices),
        )?;
        let index_buffer = if indices.is_empty() {
            None
        } else {
            Some(ctx.create_buffer_with_data(
                &BufferDescriptor::new(0, BufferUsage::INDEX, MemoryUsage::GpuOnly).with_label("mesh indices"),
                bytemuck::cast_slice(indices),
            )?)
        };
        Ok(Self {
            vertices: vertex_buffer,
            indices: index_buffer,
            vertex_count: vertices.len() as u32,
            index_count: indices.len() as u32,
        })
    }

    pub fn vertex_count(&self) -> u32 {
        self.vertex_count
    }

    pub fn index_count(&self) -> u32 {
        self.index_count
    }

    pub(crate) fn record_draw(&self, device: &ash::Device, cmd: vk::CommandBuffer) {
        unsafe {
            device.cmd_bind_vertex_buffers(cmd, 0, &[self.vertices.handle()], &[0]);
            match &self.indices {
                Some(indices) => {
                    device.cmd_bind_index_buffer(cmd, indices.handle(), 0, vk::IndexType::UINT32);
                    device.cmd_draw_indexed(cmd, self.index_count, 1, 0, 0, 0);
                }
                None => device.cmd_draw(cmd, self.vertex_count, 1, 0, 0),
            }
        }
    }
}

impl std::fmt::Debug for Mesh {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mesh")
            .field("vertex_count", &self.vertex_count)
            .field("index_count", &self.index_count)
            .finish()
    }
}

/// Per-draw data pushed before every draw.
///
/// Shaders declare a push-constant block starting with these fields; a block
/// holding only `mvp` receives the first 64 bytes.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct DrawConstants {
    pub mvp: Mat4,
    pub model: Mat4,
}

static_assertions::const_assert_eq!(std::mem::size_of::<DrawConstants>(), 128);

/// A pipeline built for a renderer's pass, with the push constants its
/// layout declares.
#[derive(Debug, Clone)]
pub struct MaterialPipeline {
    pipeline: GraphicsPipeline,
    push_constants: Vec<PushConstantRange>,
}

impl MaterialPipeline {
    pub fn pipeline(&self) -> &GraphicsPipeline {
        &self.pipeline
    }
}

/// One mesh to draw with a pipeline and its material set.
#[derive(Debug, Clone, Copy)]
pub struct Drawable<'a> {
    pub mesh: &'a Mesh,
    pub transform: Mat4,
    pub pipeline: &'a MaterialPipeline,
    pub material: Option<&'a MaterialDescriptorSet>,
}

impl<'a> Drawable<'a> {
    pub fn new(mesh: &'a Mesh, pipeline: &'a MaterialPipeline) -> Self {
        Self {
            mesh,
            transform: Mat4::IDENTITY,
            pipeline,
            material: None,
        }
    }

    pub fn with_transform(mut self, transform: Mat4) -> Self {
        self.transform = transform;
        self
    }

    pub fn with_material(mut self, material: &'a MaterialDescriptorSet) -> Self {
        self.material = Some(material);
        self
    }

    /// Sort key grouping draws by pipeline, then by material layout, then
    /// by material set.
    fn batch_key(&self) -> (u64, u32, u64) {
        use ash::vk::Handle;
        (
            self.pipeline.pipeline.handle().as_raw(),
            self.material.map_or(0, |m| m.format_id()),
            self.material.map_or(0, |m| m.handle().as_raw()),
        )
    }
}

/// Order in which to record draws so state changes are minimal. Stable, so
/// equal keys keep submission order.
fn batch_order(keys: &[(u64, u32, u64)]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..keys.len()).collect();
    order.sort_by_key(|&i| keys[i]);
    order
}

/// Push `data` into every range of `ranges`, clipped to the range.
pub(crate) fn push_constants(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    layout: vk::PipelineLayout,
    ranges: &[PushConstantRange],
    data: &[u8],
) {
    for range in ranges {
        let start = range.offset as usize;
        let end = (range.offset + range.size) as usize;
        if start >= data.len() {
            continue;
        }
        let bytes = &data[start..end.min(data.len())];
        unsafe {
            device.cmd_push_constants(cmd, layout, range.to_vk().stage_flags, range.offset, bytes)
        };
    }
}

/// The per-frame sequence every renderer follows.
pub trait FrameRenderer {
    /// Wait for the frame slot to be free and start recording.
    fn begin_frame(&mut self, ctx: &DeviceContext) -> GraphicsResult<()>;

    /// Record `drawables` into the current frame.
    fn record_draws(&mut self, ctx: &DeviceContext, drawables: &[Drawable<'_>]) -> GraphicsResult<()>;

    /// Finish recording and submit. The slot's fence signals on completion.
    fn complete(&mut self, ctx: &DeviceContext) -> GraphicsResult<()>;
}

/// Where a renderer is in the frame sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramePhase {
    Idle,
    Recording,
}

impl FramePhase {
    fn require(self, expected: FramePhase, operation: &str) -> GraphicsResult<()> {
        if self == expected {
            Ok(())
        } else {
            Err(GraphicsError::InvalidState(format!(
                "{operation} called while {self:?}, expected {expected:?}"
            )))
        }
    }
}

/// Off-screen target size and formats of a [`ForwardRenderer`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ForwardTargetConfig {
    pub extent: Extent2d,
    pub color_format: TextureFormat,
    pub clear_color: [f32; 4],
}

impl ForwardTargetConfig {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            extent: Extent2d::new(width, height),
            color_format: TextureFormat::Rgba8Unorm,
            clear_color: [0.0, 0.0, 0.0, 1.0],
        }
    }

    pub fn with_color_format(mut self, format: TextureFormat) -> Self {
        self.color_format = format;
        self
    }

    pub fn with_clear_color(mut self, color: [f32; 4]) -> Self {
        self.clear_color = color;
        self
    }
}

/// Forward shading into an off-screen colour and depth target.
///
/// The colour target ends every frame in shader-read-only layout and can be
/// copied out with [`DeviceContext::read_image_layer`].
pub struct ForwardRenderer {
    config: ForwardTargetConfig,
    render_pass: RenderPass,
    color: Image,
    _color_view: ImageView,
    _depth: Image,
    _depth_view: ImageView,
    framebuffer: Framebuffer,
    sync: FrameSync,
    command_buffers: Vec<vk::CommandBuffer>,
    phase: FramePhase,
    view_projection: Mat4,
    frames_submitted: u64,
}

impl ForwardRenderer {
    pub fn new(
        ctx: &DeviceContext,
        factory: &PipelineFactory,
        config: ForwardTargetConfig,
    ) -> GraphicsResult<Self> {
        if config.extent.is_empty() {
            return Err(GraphicsError::InvalidParameter(
                "forward target must not be empty".to_string(),
            ));
        }
        let color_usage =
            TextureUsage::RENDER_ATTACHMENT | TextureUsage::TEXTURE_BINDING | TextureUsage::COPY_SRC;
        let depth_format = ctx.find_depth_format()?;
        let depth_usage = TextureUsage::RENDER_ATTACHMENT;

        let render_pass = factory.create_render_pass(
            &[
                AttachmentDesc::new(config.color_format, color_usage),
                AttachmentDesc::new(depth_format, depth_usage),
            ],
            LoadStoreConfig::default(),
            &[SubpassDesc::new().with_color(0).with_depth(1)],
            &sampled_output_dependencies(),
        )?;

        let Extent2d { width, height } = config.extent;
        let color = ctx.create_image(
            &TextureDescriptor::new_2d(width, height, config.color_format, color_usage)
                .with_label("forward colour"),
        )?;
        let color_view = ctx.create_default_view(&color)?;
        let depth = ctx.create_image(
            &TextureDescriptor::new_2d(width, height, depth_format, depth_usage)
                .with_label("forward depth"),
        )?;
        let depth_view = ctx.create_default_view(&depth)?;
        let framebuffer =
            factory.create_framebuffer(&render_pass, &[&color_view, &depth_view], config.extent)?;

        let sync = ctx.create_frame_sync()?;
        let command_buffers = ctx.allocate_command_buffers(sync.frames_in_flight() as u32)?;
        log::info!(
            "Created forward renderer {}x{} ({:?} + {:?}, {} frames in flight)",
            width,
            height,
            config.color_format,
            depth_format,
            sync.frames_in_flight()
        );

        Ok(Self {
            config,
            render_pass,
            color,
            _color_view: color_view,
            _depth: depth,
            _depth_view: depth_view,
            framebuffer,
            sync,
            command_buffers,
            phase: FramePhase::Idle,
            view_projection: Mat4::IDENTITY,
            frames_submitted: 0,
        })
    }

    pub fn render_pass(&self) -> &RenderPass {
        &self.render_pass
    }

    pub fn color_target(&self) -> &Image {
        &self.color
    }

    pub fn extent(&self) -> Extent2d {
        self.config.extent
    }

    pub fn phase(&self) -> FramePhase {
        self.phase
    }

    pub fn frames_submitted(&self) -> u64 {
        self.frames_submitted
    }

    /// Camera transform applied to every following draw.
    pub fn set_view_projection(&mut self, view_projection: Mat4) {
        self.view_projection = view_projection;
    }

    /// Build a pipeline for this renderer's pass.
    pub fn create_pipeline(
        &self,
        factory: &PipelineFactory,
        stages: &[ShaderStageDesc<'_>],
        layout: &PipelineLayout,
        state: FixedFunctionState,
    ) -> GraphicsResult<MaterialPipeline> {
        let pipeline = factory.create_graphics_pipeline(&GraphicsPipelineDesc {
            stages,
            layout,
            render_pass: &self.render_pass,
            subpass: 0,
            state,
        })?;
        Ok(MaterialPipeline {
            pipeline,
            push_constants: layout.push_constants().to_vec(),
        })
    }

    fn current_command_buffer(&self) -> vk::CommandBuffer {
        self.command_buffers[self.sync.current_index()]
    }

    /// Wait for every frame in flight to finish.
    pub fn wait_idle(&self) -> GraphicsResult<()> {
        self.sync.wait_all()
    }

    /// Wait for outstanding frames and return the command buffers.
    pub fn destroy(self, ctx: &DeviceContext) -> GraphicsResult<()> {
        self.sync.wait_all()?;
        ctx.free_command_buffers(&self.command_buffers);
        log::debug!(
            "Forward renderer destroyed after {} frames",
            self.frames_submitted
        );
        Ok(())
    }
}

impl FrameRenderer for ForwardRenderer {
    fn begin_frame(&mut self, ctx: &DeviceContext) -> GraphicsResult<()> {
        self.phase.require(FramePhase::Idle, "begin_frame")?;
        self.sync.acquire()?;

        let device = ctx.device();
        let cmd = self.current_command_buffer();
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            device.reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())?;
            device.begin_command_buffer(cmd, &begin_info)?;
        }

        let [r, g, b, a] = self.config.clear_color;
        let clear_values = [ClearValue::color(r, g, b, a).to_vk(), ClearValue::depth(1.0).to_vk()];
        let extent = self.config.extent;
        let pass_info = vk::RenderPassBeginInfo::default()
            .render_pass(self.render_pass.handle)
            .framebuffer(self.framebuffer.handle)
            .render_area(extent.rect())
            .clear_values(&clear_values);
        unsafe {
            device.cmd_begin_render_pass(cmd, &pass_info, vk::SubpassContents::INLINE);
            device.cmd_set_viewport(cmd, 0, &[Viewport::from_extent(extent).to_vk()]);
            device.cmd_set_scissor(cmd, 0, &[extent.rect()]);
        }
        self.phase = FramePhase::Recording;
        Ok(())
    }

    fn record_draws(&mut self, ctx: &DeviceContext, drawables: &[Drawable<'_>]) -> GraphicsResult<()> {
        self.phase.require(FramePhase::Recording, "record_draws")?;
        let device = ctx.device();
        let cmd = self.current_command_buffer();

        let keys: Vec<_> = drawables.iter().map(Drawable::batch_key).collect();
        let mut bound_pipeline = vk::Pipeline::null();
        let mut bound_material = vk::DescriptorSet::null();
        for index in batch_order(&keys) {
            let drawable = &drawables[index];
            let pipeline = &drawable.pipeline.pipeline;
            if pipeline.handle() != bound_pipeline {
                unsafe {
                    device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, pipeline.handle())
                };
                bound_pipeline = pipeline.handle();
                bound_material = vk::DescriptorSet::null();
            }
            if let Some(material) = drawable.material {
                if material.handle() != bound_material {
                    unsafe {
                        device.cmd_bind_descriptor_sets(
                            cmd,
                            vk::PipelineBindPoint::GRAPHICS,
                            pipeline.layout(),
                            material.set_index(),
                            &[material.handle()],
                            &[],
                        )
                    };
                    bound_material = material.handle();
                }
            }
            let constants = DrawConstants {
                mvp: self.view_projection * drawable.transform,
                model: drawable.transform,
            };
            push_constants(
                device,
                cmd,
                pipeline.layout(),
                &drawable.pipeline.push_constants,
                bytemuck::bytes_of(&constants),
            );
            drawable.mesh.record_draw(device, cmd);
        }
        Ok(())
    }

    fn complete(&mut self, ctx: &DeviceContext) -> GraphicsResult<()> {
        self.phase.require(FramePhase::Recording, "complete")?;
        let device = ctx.device();
        let cmd = self.current_command_buffer();
        unsafe {
            device.cmd_end_render_pass(cmd);
            device.end_command_buffer(cmd)?;
        }

        let command_buffers = [cmd];
        let submit = vk::SubmitInfo::default().command_buffers(&command_buffers);
        // No swapchain: the slot fence is the only completion signal.
        ctx.submit(&[submit], Some(&self.sync.current().in_flight))?;
        self.color.set_layout(TextureLayout::ShaderReadOnly);

        self.phase = FramePhase::Idle;
        self.frames_submitted += 1;
        self.sync.advance();
        Ok(())
    }
}

impl std::fmt::Debug for ForwardRenderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwardRenderer")
            .field("config", &self.config)
            .field("phase", &self.phase)
            .field("frames_submitted", &self.frames_submitted)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reflect::StageFlags;
    use rstest::rstest;

    #[test]
    fn test_batch_order_groups_pipelines_then_materials() {
        let keys = [(2, 1, 10), (1, 2, 20), (2, 1, 11), (1, 1, 30), (2, 1, 10)];
        assert_eq!(batch_order(&keys), vec![3, 1, 0, 4, 2]);
    }

    #[test]
    fn test_batch_order_is_stable() {
        let keys = [(1, 0, 0); 4];
        assert_eq!(batch_order(&keys), vec![0, 1, 2, 3]);
    }

    #[rstest]
    #[case(FramePhase::Idle, FramePhase::Idle, true)]
    #[case(FramePhase::Recording, FramePhase::Idle, false)]
    #[case(FramePhase::Idle, FramePhase::Recording, false)]
    fn test_phase_guard(#[case] phase: FramePhase, #[case] expected: FramePhase, #[case] ok: bool) {
        let result = phase.require(expected, "op");
        assert_eq!(result.is_ok(), ok);
        if !ok {
            assert!(matches!(result, Err(GraphicsError::InvalidState(_))));
        }
    }

    #[test]
    fn test_draw_constants_layout() {
        let constants = DrawConstants {
            mvp: Mat4::from_scale(glam::Vec3::splat(2.0)),
            model: Mat4::IDENTITY,
        };
        let bytes = bytemuck::bytes_of(&constants);
        assert_eq!(bytes.len(), 128);
        assert_eq!(&bytes[0..4], &2.0f32.to_ne_bytes());
        assert_eq!(&bytes[64..68], &1.0f32.to_ne_bytes());
    }

    #[test]
    fn test_target_config_defaults() {
        let config = ForwardTargetConfig::new(64, 32).with_clear_color([1.0, 0.0, 0.0, 1.0]);
        assert_eq!(config.extent, Extent2d::new(64, 32));
        assert_eq!(config.color_format, TextureFormat::Rgba8Unorm);
        assert_eq!(
            PushConstantRange::new(StageFlags::VERTEX, 0, 64).to_vk().size,
            64
        );
    }
}
