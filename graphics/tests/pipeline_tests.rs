//! Pipeline factory integration tests: modules, layouts, pools, render
//! passes, pipelines and the renderers built on them.

mod common;

use common::{assert_close, rgba8_pixel, TestContext, FLAT_COLOR_SHADER};
use glam::{Mat4, Vec3};
use lumen_graphics::light::directional_light_matrix;
use lumen_graphics::pipeline::{CullMode, MultiviewDesc};
use lumen_graphics::reflect::ResourceKind;
use lumen_graphics::{
    AttachmentDesc, BufferDescriptor, BufferUsage, DescriptorPoolSizing, Drawable,
    FixedFunctionState, ForwardRenderer, ForwardTargetConfig, FrameRenderer, GraphicsError,
    GraphicsPipelineDesc, LightSystem, LoadStoreConfig, MemoryUsage, Mesh, PipelineFactory,
    ResourceBinding, SamplerDescriptor, ShaderModule, ShaderStage, ShaderStageDesc, ShadowSettings, SubpassDesc,
    Technique, TextureFormat, TextureLayout, TextureUsage, Vertex,
};

fn flat_color_modules(factory: &PipelineFactory) -> (ShaderModule, ShaderModule) {
    let vertex = factory
        .create_wgsl_module(FLAT_COLOR_SHADER, ShaderStage::Vertex, "vs_main")
        .unwrap();
    let fragment = factory
        .create_wgsl_module(FLAT_COLOR_SHADER, ShaderStage::Fragment, "fs_main")
        .unwrap();
    (vertex, fragment)
}

fn flat_color_technique(factory: &PipelineFactory) -> Technique {
    let (vertex, fragment) = flat_color_modules(factory);
    factory
        .create_technique(&[
            ShaderStageDesc::new(&vertex, ShaderStage::Vertex),
            ShaderStageDesc::new(&fragment, ShaderStage::Fragment),
        ])
        .unwrap()
}

fn color_bytes(color: [f32; 4]) -> Vec<u8> {
    color.iter().flat_map(|c| c.to_ne_bytes()).collect()
}

/// Two triangles covering the whole viewport at depth 0.5.
fn fullscreen_quad() -> Vec<Vertex> {
    let normal = [0.0, 0.0, 1.0];
    [
        [-1.0, -1.0],
        [1.0, -1.0],
        [1.0, 1.0],
        [-1.0, -1.0],
        [1.0, 1.0],
        [-1.0, 1.0],
    ]
    .iter()
    .map(|&[x, y]| Vertex::new([x, y, 0.5], normal, [0.0, 0.0]))
    .collect()
}

#[test]
fn test_invalid_bytecode_rejected() {
    let Some(tc) = TestContext::new() else { return };
    let mut factory = tc.factory();
    let result = factory.create_shader_module(&[1, 2, 3]);
    assert!(matches!(result, Err(GraphicsError::InvalidBytecode(_))));
    let result = factory.create_shader_module(&[0u8; 64]);
    assert!(matches!(result, Err(GraphicsError::InvalidBytecode(_))));
    factory.destroy(&tc.ctx).unwrap();
}

#[test]
fn test_technique_layout_from_reflection() {
    let Some(tc) = TestContext::new() else { return };
    let mut factory = tc.factory();
    let (vertex, fragment) = flat_color_modules(&factory);
    let technique = factory
        .create_technique(&[
            ShaderStageDesc::new(&vertex, ShaderStage::Vertex),
            ShaderStageDesc::new(&fragment, ShaderStage::Fragment),
        ])
        .unwrap();

    let material = technique.set(0).unwrap();
    assert_eq!(material.bindings().len(), 1);
    assert_eq!(material.bindings()[0].kind, ResourceKind::UniformBuffer);
    assert_ne!(material.format_id(), 0);
    assert_eq!(technique.layout.set_count(), 1);
    assert_eq!(technique.layout.push_constants().len(), 1);
    assert_eq!(technique.layout.push_constants()[0].size, 64);

    // The same shader twice gives layout-compatible sets.
    let again = flat_color_technique(&factory);
    assert_eq!(again.set(0).unwrap().format_id(), material.format_id());

    factory.destroy(&tc.ctx).unwrap();
}

#[test]
fn test_duplicate_stage_rejected() {
    let Some(tc) = TestContext::new() else { return };
    let mut factory = tc.factory();
    let (vertex, _) = flat_color_modules(&factory);
    let result = factory.create_technique(&[
        ShaderStageDesc::new(&vertex, ShaderStage::Vertex),
        ShaderStageDesc::new(&vertex, ShaderStage::Vertex),
    ]);
    assert!(matches!(result, Err(GraphicsError::DuplicateStage(_))));
    factory.destroy(&tc.ctx).unwrap();
}

#[test]
fn test_render_pass_format_ids() {
    let Some(tc) = TestContext::new() else { return };
    let mut factory = tc.factory();
    let usage = TextureUsage::RENDER_ATTACHMENT | TextureUsage::TEXTURE_BINDING;
    let pass = |format| {
        factory
            .create_render_pass(
                &[AttachmentDesc::new(format, usage)],
                LoadStoreConfig::default(),
                &[SubpassDesc::new().with_color(0)],
                &[],
            )
            .unwrap()
    };
    let a = pass(TextureFormat::Rgba8Unorm);
    let b = pass(TextureFormat::Rgba8Unorm);
    let c = pass(TextureFormat::Rgba16Float);
    assert_eq!(a.format_id(), b.format_id());
    assert_ne!(a.format_id(), c.format_id());

    let no_usage = factory.create_render_pass(
        &[AttachmentDesc::new(TextureFormat::Rgba8Unorm, TextureUsage::TEXTURE_BINDING)],
        LoadStoreConfig::default(),
        &[SubpassDesc::new().with_color(0)],
        &[],
    );
    assert!(no_usage.is_err());
    factory.destroy(&tc.ctx).unwrap();
}

#[test]
fn test_multiview_render_pass() {
    let Some(tc) = TestContext::new() else { return };
    if !tc.ctx.capabilities().multiview {
        eprintln!("skipping: multiview unsupported");
        return;
    }
    let mut factory = tc.factory();
    let attachment = AttachmentDesc::new(
        TextureFormat::Rgba8Unorm,
        TextureUsage::RENDER_ATTACHMENT | TextureUsage::TEXTURE_BINDING,
    );
    let subpasses = [SubpassDesc::new().with_color(0)];

    let pass = factory
        .create_render_pass_multiview(
            &[attachment.with_layers(6)],
            LoadStoreConfig::default(),
            &subpasses,
            &[],
            &MultiviewDesc::uniform(0b11_1111, 1),
        )
        .unwrap();
    assert_eq!(pass.view_masks(), Some(&[0b11_1111][..]));

    let too_wide = factory.create_render_pass_multiview(
        &[attachment.with_layers(2)],
        LoadStoreConfig::default(),
        &subpasses,
        &[],
        &MultiviewDesc::uniform(0b111, 1),
    );
    assert!(matches!(too_wide, Err(GraphicsError::RenderPassCreationFailed(_))));
    factory.destroy(&tc.ctx).unwrap();
}

#[test]
fn test_pipeline_output_count_must_match_attachments() {
    let Some(tc) = TestContext::new() else { return };
    let mut factory = tc.factory();
    let (vertex, fragment) = flat_color_modules(&factory);
    let stages = [
        ShaderStageDesc::new(&vertex, ShaderStage::Vertex),
        ShaderStageDesc::new(&fragment, ShaderStage::Fragment),
    ];
    let technique = factory.create_technique(&stages).unwrap();
    let usage = TextureUsage::RENDER_ATTACHMENT;
    let two_targets = factory
        .create_render_pass(
            &[
                AttachmentDesc::new(TextureFormat::Rgba8Unorm, usage),
                AttachmentDesc::new(TextureFormat::Rgba8Unorm, usage),
            ],
            LoadStoreConfig::default(),
            &[SubpassDesc::new().with_color(0).with_color(1)],
            &[],
        )
        .unwrap();

    let result = factory.create_graphics_pipeline(&GraphicsPipelineDesc {
        stages: &stages,
        layout: &technique.layout,
        render_pass: &two_targets,
        subpass: 0,
        state: FixedFunctionState::opaque(),
    });
    assert_eq!(
        result.unwrap_err(),
        GraphicsError::AttachmentMismatch {
            attachments: 2,
            outputs: 1
        }
    );
    factory.destroy(&tc.ctx).unwrap();
}

#[test]
fn test_pool_exhaustion_and_reset() {
    let Some(tc) = TestContext::new() else { return };
    let mut factory = tc.factory();
    let technique = flat_color_technique(&factory);
    let layout = technique.set(0).unwrap();
    let uniforms = tc
        .ctx
        .create_buffer_with_data(
            &BufferDescriptor::new(0, BufferUsage::UNIFORM, MemoryUsage::GpuOnly),
            &color_bytes([1.0, 0.0, 0.0, 1.0]),
        )
        .unwrap();

    let pool = factory
        .create_descriptor_pool(DescriptorPoolSizing::from_layout(layout.desc(), 1))
        .unwrap();
    assert_eq!(pool.sizing().capacity(ResourceKind::UniformBuffer), 1);
    let resources = [ResourceBinding::uniform(&uniforms)];
    factory.create_material_set(&pool, layout, &resources).unwrap();
    assert!(matches!(
        factory.create_material_set(&pool, layout, &resources),
        Err(GraphicsError::PoolExhausted(_))
    ));

    pool.reset().unwrap();
    assert_eq!(pool.allocated_sets(), 0);
    let set = factory.create_material_set(&pool, layout, &resources).unwrap();
    assert_eq!(set.format_id(), layout.format_id());

    drop(pool);
    factory.destroy(&tc.ctx).unwrap();
}

#[test]
fn test_material_set_binding_validation() {
    let Some(tc) = TestContext::new() else { return };
    let mut factory = tc.factory();
    let technique = flat_color_technique(&factory);
    let layout = technique.set(0).unwrap();
    let pool = factory
        .create_descriptor_pool(DescriptorPoolSizing::from_layout(layout.desc(), 4))
        .unwrap();
    let sampler = tc
        .ctx
        .create_sampler(&SamplerDescriptor::linear())
        .unwrap();

    assert_eq!(
        factory.create_material_set(&pool, layout, &[]).unwrap_err(),
        GraphicsError::BindingCountMismatch {
            expected: 1,
            actual: 0
        }
    );
    assert!(matches!(
        factory.create_material_set(&pool, layout, &[ResourceBinding::Sampler(&sampler)]),
        Err(GraphicsError::BindingCountMismatch { .. })
    ));
    // Failed validation allocates nothing.
    assert_eq!(pool.allocated_sets(), 0);

    drop(pool);
    factory.destroy(&tc.ctx).unwrap();
}

#[test]
fn test_factory_destroy_releases_everything() {
    let Some(tc) = TestContext::new() else { return };
    let mut factory = tc.factory();
    let (vertex, fragment) = flat_color_modules(&factory);
    factory
        .create_technique(&[
            ShaderStageDesc::new(&vertex, ShaderStage::Vertex),
            ShaderStageDesc::new(&fragment, ShaderStage::Fragment),
        ])
        .unwrap();
    assert!(factory.owned_objects() >= 4);

    factory.destroy(&tc.ctx).unwrap();
    assert_eq!(factory.owned_objects(), 0);
    assert!(matches!(
        factory.create_wgsl_module(FLAT_COLOR_SHADER, ShaderStage::Vertex, "vs_main"),
        Err(GraphicsError::InvalidState(_))
    ));
    factory.destroy(&tc.ctx).unwrap();
}

#[test]
fn test_forward_renderer_draws_material_color() {
    let Some(tc) = TestContext::new() else { return };
    let mut factory = tc.factory();
    let (vertex, fragment) = flat_color_modules(&factory);
    let stages = [
        ShaderStageDesc::new(&vertex, ShaderStage::Vertex),
        ShaderStageDesc::new(&fragment, ShaderStage::Fragment),
    ];
    let technique = factory.create_technique(&stages).unwrap();

    let mut renderer = ForwardRenderer::new(
        &tc.ctx,
        &factory,
        ForwardTargetConfig::new(32, 32).with_clear_color([0.0, 0.0, 1.0, 1.0]),
    )
    .unwrap();
    let pipeline = renderer
        .create_pipeline(
            &factory,
            &stages,
            &technique.layout,
            FixedFunctionState::opaque().with_cull_mode(CullMode::None),
        )
        .unwrap();

    let green = tc
        .ctx
        .create_buffer_with_data(
            &BufferDescriptor::new(0, BufferUsage::UNIFORM, MemoryUsage::GpuOnly),
            &color_bytes([0.0, 1.0, 0.0, 1.0]),
        )
        .unwrap();
    let layout = technique.set(0).unwrap();
    let pool = factory
        .create_descriptor_pool(DescriptorPoolSizing::from_layout(layout.desc(), 1))
        .unwrap();
    let material = factory
        .create_material_set(&pool, layout, &[ResourceBinding::uniform(&green)])
        .unwrap();

    // Left half only: the right half keeps the clear colour.
    let mesh = Mesh::new(&tc.ctx, &fullscreen_quad(), &[]).unwrap();
    let transform = Mat4::from_translation(Vec3::new(-0.5, 0.0, 0.0))
        * Mat4::from_scale(Vec3::new(0.5, 1.0, 1.0));
    let drawables = [Drawable::new(&mesh, &pipeline)
        .with_transform(transform)
        .with_material(&material)];

    for _ in 0..3 {
        renderer.begin_frame(&tc.ctx).unwrap();
        renderer.record_draws(&tc.ctx, &drawables).unwrap();
        renderer.complete(&tc.ctx).unwrap();
    }
    assert!(matches!(
        renderer.record_draws(&tc.ctx, &drawables),
        Err(GraphicsError::InvalidState(_))
    ));
    renderer.wait_idle().unwrap();
    assert_eq!(renderer.frames_submitted(), 3);

    let pixels = tc.ctx.read_image_layer(renderer.color_target(), 0).unwrap();
    assert_close(rgba8_pixel(&pixels, 32, 4, 16), [0.0, 1.0, 0.0, 1.0], 0.01, "left");
    assert_close(rgba8_pixel(&pixels, 32, 28, 16), [0.0, 0.0, 1.0, 1.0], 0.01, "right");

    renderer.destroy(&tc.ctx).unwrap();
    drop(pool);
    factory.destroy(&tc.ctx).unwrap();
}

#[test]
fn test_light_system_casts_shadows() {
    let Some(tc) = TestContext::new() else { return };
    let mut factory = tc.factory();
    let mut lights = LightSystem::new(
        &tc.ctx,
        &factory,
        ShadowSettings {
            resolution: 256,
            ..ShadowSettings::default()
        },
    )
    .unwrap();
    assert_eq!(lights.light_layout().set_count(), 1);
    assert!(lights.render_pass().attachments()[0].is_depth());

    let (vertex, fragment) = flat_color_modules(&factory);
    let stages = [
        ShaderStageDesc::new(&vertex, ShaderStage::Vertex),
        ShaderStageDesc::new(&fragment, ShaderStage::Fragment),
    ];
    let technique = factory.create_technique(&stages).unwrap();
    let renderer = ForwardRenderer::new(&tc.ctx, &factory, ForwardTargetConfig::new(8, 8)).unwrap();
    let pipeline = renderer
        .create_pipeline(&factory, &stages, &technique.layout, FixedFunctionState::opaque())
        .unwrap();
    let mesh = Mesh::new(&tc.ctx, &fullscreen_quad(), &[0, 1, 2, 3, 4, 5]).unwrap();
    assert_eq!(mesh.index_count(), 6);

    lights
        .set_light(directional_light_matrix(Vec3::NEG_Y, Vec3::ZERO, 4.0))
        .unwrap();
    let drawables = [Drawable::new(&mesh, &pipeline)];
    tc.ctx
        .execute_one_shot(|_, cmd| {
            lights.cast(&tc.ctx, cmd, &drawables);
            Ok(())
        })
        .unwrap();
    assert_eq!(
        lights.shadow_map().current_layout(),
        TextureLayout::DepthStencilReadOnly
    );

    renderer.destroy(&tc.ctx).unwrap();
    drop(lights);
    factory.destroy(&tc.ctx).unwrap();
}
