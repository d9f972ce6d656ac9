//! Shadow casting.
//!
//! [`LightSystem`] renders the depth of every drawable as seen from a light
//! into a sampled depth image. The pass is depth-only and its pipeline layout
//! exposes one thing: the light-space transform at set 0, binding 0.

use ash::vk;
use glam::{Mat4, Vec3};

use crate::backend::vulkan::TextureLayout;
use crate::context::DeviceContext;
use crate::error::{GraphicsError, GraphicsResult};
use crate::pipeline::{
    sampled_output_dependencies, AttachmentDesc, DepthBias, DescriptorPool, DescriptorPoolSizing,
    FixedFunctionState, Framebuffer, GraphicsPipeline, GraphicsPipelineDesc, LoadAction,
    LoadStoreConfig, MaterialDescriptorSet, PipelineFactory, PipelineLayout, RenderPass,
    ResourceBinding, ShaderStageDesc, StoreAction, SubpassDesc, Technique,
};
use crate::reflect::{ResourceKind, ShaderReflectionInfo, ShaderStage, StageFlags};
use crate::renderer::{push_constants, DrawConstants, Drawable};
use crate::resources::{Buffer, Image, ImageView};
use crate::types::{
    BufferDescriptor, BufferUsage, ClearValue, Extent2d, ImageTiling, MemoryUsage,
    TextureDescriptor, TextureFormat, TextureUsage, Viewport,
};

const SHADER_WGSL: &str = include_str!("../shaders/shadow_depth.wgsl");

pub const SHADOW_MAP_FORMAT: TextureFormat = TextureFormat::Depth32Float;

fn shadow_usage() -> TextureUsage {
    TextureUsage::RENDER_ATTACHMENT | TextureUsage::TEXTURE_BINDING
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShadowSettings {
    /// Edge length of the square shadow map.
    pub resolution: u32,
    pub depth_bias: DepthBias,
}

impl Default for ShadowSettings {
    fn default() -> Self {
        Self {
            resolution: 2048,
            depth_bias: DepthBias {
                constant: 1.25,
                slope: 1.75,
            },
        }
    }
}

/// Depth-only render pass whose attachment ends ready for sampling.
pub fn create_shadow_render_pass(factory: &PipelineFactory) -> GraphicsResult<RenderPass> {
    let config = LoadStoreConfig {
        depth_load: LoadAction::Clear,
        depth_store: StoreAction::Read,
        ..LoadStoreConfig::default()
    };
    factory.create_render_pass(
        &[AttachmentDesc::new(SHADOW_MAP_FORMAT, shadow_usage())],
        config,
        &[SubpassDesc::new().with_depth(0)],
        &sampled_output_dependencies(),
    )
}

/// Light-space transform of a directional light shining along `direction`
/// onto the sphere at `center` with `radius`.
///
/// The sphere fits the orthographic volume and its centre lands at depth 0.5.
pub fn directional_light_matrix(direction: Vec3, center: Vec3, radius: f32) -> Mat4 {
    let direction = direction.try_normalize().unwrap_or(Vec3::NEG_Y);
    let up = if direction.y.abs() > 0.99 { Vec3::Z } else { Vec3::Y };
    let eye = center - direction * radius * 2.0;
    let view = Mat4::look_at_rh(eye, center, up);
    let projection = Mat4::orthographic_rh(-radius, radius, -radius, radius, radius, radius * 3.0);
    projection * view
}

/// The shadow shader must read nothing but the light transform.
fn check_light_layout(reflection: &ShaderReflectionInfo) -> GraphicsResult<()> {
    let sets: Vec<u32> = reflection.set_indices().collect();
    let bindings = reflection.bindings(0);
    let valid = sets == [0]
        && bindings.len() == 1
        && bindings[0].binding == 0
        && bindings[0].kind == ResourceKind::UniformBuffer
        && bindings[0].stages.contains(StageFlags::VERTEX);
    if valid {
        Ok(())
    } else {
        Err(GraphicsError::InvalidParameter(format!(
            "shadow layout must be a single vertex uniform at set 0 binding 0, got sets {sets:?}"
        )))
    }
}

/// Renders shadow casters into a depth map.
pub struct LightSystem {
    settings: ShadowSettings,
    render_pass: RenderPass,
    technique: Technique,
    pipeline: GraphicsPipeline,
    shadow_map: Image,
    shadow_view: ImageView,
    framebuffer: Framebuffer,
    light_uniforms: Buffer,
    _pool: DescriptorPool,
    light_set: MaterialDescriptorSet,
}

impl LightSystem {
    pub fn new(
        ctx: &DeviceContext,
        factory: &PipelineFactory,
        settings: ShadowSettings,
    ) -> GraphicsResult<Self> {
        if settings.resolution == 0 {
            return Err(GraphicsError::InvalidParameter(
                "shadow map resolution must be non-zero".to_string(),
            ));
        }
        ctx.find_supported_format(
            &[SHADOW_MAP_FORMAT],
            ImageTiling::Optimal,
            vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT | vk::FormatFeatureFlags::SAMPLED_IMAGE,
        )?;

        let render_pass = create_shadow_render_pass(factory)?;
        let module = factory.create_wgsl_module(SHADER_WGSL, ShaderStage::Vertex, "vs_main")?;
        let stages = [ShaderStageDesc::new(&module, ShaderStage::Vertex)];
        let technique = factory.create_technique(&stages)?;
        check_light_layout(&technique.reflection)?;
        let pipeline = factory.create_graphics_pipeline(&GraphicsPipelineDesc {
            stages: &stages,
            layout: &technique.layout,
            render_pass: &render_pass,
            subpass: 0,
            state: FixedFunctionState::shadow(),
        })?;

        let resolution = settings.resolution;
        let shadow_map = ctx.create_image(
            &TextureDescriptor::new_2d(resolution, resolution, SHADOW_MAP_FORMAT, shadow_usage())
                .with_label("shadow map"),
        )?;
        let shadow_view = ctx.create_default_view(&shadow_map)?;
        let framebuffer = factory.create_framebuffer(
            &render_pass,
            &[&shadow_view],
            Extent2d::new(resolution, resolution),
        )?;

        let mut light_uniforms = ctx.create_buffer(
            &BufferDescriptor::new(
                std::mem::size_of::<Mat4>() as u64,
                BufferUsage::UNIFORM,
                MemoryUsage::CpuToGpu,
            )
            .with_label("light transform"),
        )?;
        light_uniforms.write(0, bytemuck::bytes_of(&Mat4::IDENTITY))?;

        let Some(light_layout) = technique.set(0) else {
            return Err(GraphicsError::InvalidState(
                "shadow technique has no set 0".to_string(),
            ));
        };
        let pool = factory.create_descriptor_pool(DescriptorPoolSizing::from_layout(
            light_layout.desc(),
            1,
        ))?;
        let light_set = factory.create_material_set(
            &pool,
            light_layout,
            &[ResourceBinding::uniform(&light_uniforms)],
        )?;

        log::debug!("Created light system with {resolution}px shadow map");
        Ok(Self {
            settings,
            render_pass,
            technique,
            pipeline,
            shadow_map,
            shadow_view,
            framebuffer,
            light_uniforms,
            _pool: pool,
            light_set,
        })
    }

    pub fn settings(&self) -> &ShadowSettings {
        &self.settings
    }

    pub fn render_pass(&self) -> &RenderPass {
        &self.render_pass
    }

    /// Layout with the light transform at set 0, binding 0.
    pub fn light_layout(&self) -> &PipelineLayout {
        &self.technique.layout
    }

    pub fn shadow_map(&self) -> &Image {
        &self.shadow_map
    }

    /// Depth view for sampling the shadow map in later passes.
    pub fn shadow_view(&self) -> &ImageView {
        &self.shadow_view
    }

    /// Set the light-space transform used by the next [`cast`](Self::cast).
    ///
    /// The uniform is shared by all frames; the previous cast must have
    /// finished on the GPU.
    pub fn set_light(&mut self, light_space: Mat4) -> GraphicsResult<()> {
        self.light_uniforms.write(0, bytemuck::bytes_of(&light_space))
    }

    /// Record the shadow pass for `drawables` into `cmd`, outside any other
    /// render pass. The shadow map is sampleable once `cmd` has executed.
    pub fn cast(&self, ctx: &DeviceContext, cmd: vk::CommandBuffer, drawables: &[Drawable<'_>]) {
        let device = ctx.device();
        let resolution = self.settings.resolution;
        let extent = Extent2d::new(resolution, resolution);
        let clear = [ClearValue::depth(1.0).to_vk()];
        let begin = vk::RenderPassBeginInfo::default()
            .render_pass(self.render_pass.handle)
            .framebuffer(self.framebuffer.handle)
            .render_area(extent.rect())
            .clear_values(&clear);
        let bias = self.settings.depth_bias;
        let layout = self.technique.layout.handle;

        unsafe {
            device.cmd_begin_render_pass(cmd, &begin, vk::SubpassContents::INLINE);
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, self.pipeline.handle);
            device.cmd_set_viewport(cmd, 0, &[Viewport::from_extent(extent).to_vk()]);
            device.cmd_set_scissor(cmd, 0, &[extent.rect()]);
            device.cmd_set_depth_bias(cmd, bias.constant, 0.0, bias.slope);
            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                layout,
                0,
                &[self.light_set.handle()],
                &[],
            );
        }
        for drawable in drawables {
            let constants = DrawConstants {
                mvp: drawable.transform,
                model: drawable.transform,
            };
            push_constants(
                device,
                cmd,
                layout,
                self.technique.layout.push_constants(),
                bytemuck::bytes_of(&constants),
            );
            drawable.mesh.record_draw(device, cmd);
        }
        unsafe { device.cmd_end_render_pass(cmd) };
        self.shadow_map.set_layout(TextureLayout::DepthStencilReadOnly);
        log::trace!("Recorded shadow pass with {} casters", drawables.len());
    }
}

impl std::fmt::Debug for LightSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LightSystem")
            .field("settings", &self.settings)
            .field("render_pass_format", &self.render_pass.format_id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reflect::{ReflectedBinding, StageReflection};
    use rstest::rstest;

    fn reflection(bindings: Vec<ReflectedBinding>) -> ShaderReflectionInfo {
        let mut stage = StageReflection::new(ShaderStage::Vertex, "vs_main");
        stage.bindings = bindings;
        ShaderReflectionInfo::merge(vec![stage]).unwrap()
    }

    #[test]
    fn test_light_layout_accepts_single_uniform() {
        let info = reflection(vec![ReflectedBinding::new(
            0,
            0,
            ResourceKind::UniformBuffer,
            StageFlags::VERTEX,
        )]);
        assert!(check_light_layout(&info).is_ok());
    }

    #[rstest]
    #[case(vec![])]
    #[case(vec![ReflectedBinding::new(1, 0, ResourceKind::UniformBuffer, StageFlags::VERTEX)])]
    #[case(vec![ReflectedBinding::new(0, 0, ResourceKind::CombinedImageSampler, StageFlags::VERTEX)])]
    #[case(vec![
        ReflectedBinding::new(0, 0, ResourceKind::UniformBuffer, StageFlags::VERTEX),
        ReflectedBinding::new(0, 1, ResourceKind::UniformBuffer, StageFlags::VERTEX),
    ])]
    fn test_light_layout_rejects(#[case] bindings: Vec<ReflectedBinding>) {
        assert!(matches!(
            check_light_layout(&reflection(bindings)),
            Err(GraphicsError::InvalidParameter(_))
        ));
    }

    #[rstest]
    #[case(Vec3::NEG_Y)]
    #[case(Vec3::new(1.0, -1.0, 0.5))]
    #[case(Vec3::X)]
    fn test_directional_light_fits_sphere(#[case] direction: Vec3) {
        let center = Vec3::new(3.0, 1.0, -2.0);
        let radius = 5.0;
        let matrix = directional_light_matrix(direction, center, radius);

        let projected = matrix.project_point3(center);
        assert!(projected.truncate().length() < 1e-4);
        assert!((projected.z - 0.5).abs() < 1e-4);

        for offset in [Vec3::X, Vec3::NEG_Y, Vec3::Z, Vec3::NEG_X] {
            let p = matrix.project_point3(center + offset * radius * 0.99);
            assert!(p.x.abs() <= 1.0 && p.y.abs() <= 1.0, "{p:?}");
            assert!((0.0..=1.0).contains(&p.z), "{p:?}");
        }
    }

    #[test]
    fn test_default_settings() {
        let settings = ShadowSettings::default();
        assert_eq!(settings.resolution, 2048);
        assert!(settings.depth_bias.constant > 0.0);
    }
}
