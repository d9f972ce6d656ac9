//! Builds shader modules, layouts, render passes and graphics pipelines.
//!
//! The factory owns everything it creates except descriptor pools and
//! framebuffers, which belong to the caller. Owned objects are released by
//! [`PipelineFactory::destroy`].

use std::collections::BTreeMap;
use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;

use super::layout::{check_push_constants, plan_set_order, PushConstantRange, SetLayoutDesc, SetSignature};
use super::material::{validate_bindings, write_bindings, MaterialDescriptorSet, ResourceBinding};
use super::pool::{DescriptorPool, DescriptorPoolSizing};
use super::registry::FormatRegistry;
use super::render_pass::{
    attachment_description, validate_multiview, validate_subpasses, AttachmentDesc, Framebuffer,
    LoadStoreConfig, MultiviewDesc, MultiviewSupport, RenderPass, SubpassDesc,
};
use super::shader::{compile_wgsl, ShaderModule, ShaderStageDesc};
use super::state::FixedFunctionState;
use crate::backend::vulkan::conversion::{
    convert_blend_mode, convert_compare_function, convert_cull_mode, convert_front_face,
    convert_interface_format, convert_sample_count, convert_stage_flags, convert_topology,
};
use crate::context::DeviceContext;
use crate::error::{GraphicsError, GraphicsResult};
use crate::reflect::{
    check_interface, reflect_spirv, to_words, ReflectedBinding, ShaderReflectionInfo,
    ShaderStage, StageReflection,
};
use crate::resources::{ImageView, LiveToken, ResourceTracker};
use crate::types::{Extent2d, TextureFormat};

/// A descriptor set layout with the reflected bindings it was built from.
#[derive(Debug, Clone)]
pub struct DescriptorSetLayout {
    pub(crate) handle: vk::DescriptorSetLayout,
    format_id: u32,
    desc: Arc<SetLayoutDesc>,
}

impl DescriptorSetLayout {
    pub fn handle(&self) -> vk::DescriptorSetLayout {
        self.handle
    }

    pub fn set(&self) -> u32 {
        self.desc.set()
    }

    /// Sets with equal bindings share a format ID; 0 is the empty set.
    pub fn format_id(&self) -> u32 {
        self.format_id
    }

    pub fn bindings(&self) -> &[ReflectedBinding] {
        self.desc.bindings()
    }

    pub fn desc(&self) -> &SetLayoutDesc {
        &self.desc
    }
}

/// A pipeline layout: set layouts ordered by set index plus push constants.
#[derive(Debug, Clone)]
pub struct PipelineLayout {
    pub(crate) handle: vk::PipelineLayout,
    set_format_ids: Vec<u32>,
    push_constants: Vec<PushConstantRange>,
}

impl PipelineLayout {
    pub fn handle(&self) -> vk::PipelineLayout {
        self.handle
    }

    /// Number of set slots, gaps included.
    pub fn set_count(&self) -> u32 {
        self.set_format_ids.len() as u32
    }

    /// Format ID of each set slot in index order; gaps hold the empty ID.
    pub fn set_format_ids(&self) -> &[u32] {
        &self.set_format_ids
    }

    pub fn push_constants(&self) -> &[PushConstantRange] {
        &self.push_constants
    }
}

/// Layouts derived from the reflection of a set of shader stages.
#[derive(Debug, Clone)]
pub struct Technique {
    pub reflection: ShaderReflectionInfo,
    pub sets: BTreeMap<u32, DescriptorSetLayout>,
    pub layout: PipelineLayout,
}

impl Technique {
    pub fn set(&self, index: u32) -> Option<&DescriptorSetLayout> {
        self.sets.get(&index)
    }
}

/// Inputs of [`PipelineFactory::create_graphics_pipeline`].
#[derive(Debug, Clone, Copy)]
pub struct GraphicsPipelineDesc<'a> {
    pub stages: &'a [ShaderStageDesc<'a>],
    pub layout: &'a PipelineLayout,
    pub render_pass: &'a RenderPass,
    pub subpass: u32,
    pub state: FixedFunctionState,
}

/// A graphics pipeline owned by the factory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GraphicsPipeline {
    pub(crate) handle: vk::Pipeline,
    layout: vk::PipelineLayout,
    render_pass_format: u32,
    subpass: u32,
}

impl GraphicsPipeline {
    pub fn handle(&self) -> vk::Pipeline {
        self.handle
    }

    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }

    /// Format ID of the render pass the pipeline is compatible with.
    pub fn render_pass_format(&self) -> u32 {
        self.render_pass_format
    }

    pub fn subpass(&self) -> u32 {
        self.subpass
    }
}

#[derive(Debug, Clone, Copy)]
struct FactoryLimits {
    max_push_constants_size: u32,
    max_bound_descriptor_sets: u32,
    multiview: MultiviewSupport,
}

#[derive(Default)]
struct OwnedObjects {
    shader_modules: Vec<vk::ShaderModule>,
    set_layouts: Vec<vk::DescriptorSetLayout>,
    empty_set_layout: Option<vk::DescriptorSetLayout>,
    pipeline_layouts: Vec<vk::PipelineLayout>,
    render_passes: Vec<vk::RenderPass>,
    pipelines: Vec<vk::Pipeline>,
}

impl OwnedObjects {
    fn count(&self) -> usize {
        self.shader_modules.len()
            + self.set_layouts.len()
            + usize::from(self.empty_set_layout.is_some())
            + self.pipeline_layouts.len()
            + self.render_passes.len()
            + self.pipelines.len()
    }

    /// # Safety
    /// The GPU must be done with every object.
    unsafe fn release(&mut self, device: &ash::Device) {
        for pipeline in self.pipelines.drain(..) {
            unsafe { device.destroy_pipeline(pipeline, None) };
        }
        for layout in self.pipeline_layouts.drain(..) {
            unsafe { device.destroy_pipeline_layout(layout, None) };
        }
        for render_pass in self.render_passes.drain(..) {
            unsafe { device.destroy_render_pass(render_pass, None) };
        }
        for layout in self.set_layouts.drain(..).chain(self.empty_set_layout.take()) {
            unsafe { device.destroy_descriptor_set_layout(layout, None) };
        }
        for module in self.shader_modules.drain(..) {
            unsafe { device.destroy_shader_module(module, None) };
        }
    }
}

#[derive(Default)]
struct Registries {
    sets: FormatRegistry<SetSignature>,
    passes: FormatRegistry<Vec<(TextureFormat, u32, u32)>>,
}

/// Turns shader bytecode and reflection into pipeline objects.
pub struct PipelineFactory {
    device: ash::Device,
    limits: FactoryLimits,
    objects: Mutex<OwnedObjects>,
    registries: Mutex<Registries>,
    tracker: ResourceTracker,
    /// Keeps the context alive until `destroy`.
    token: Option<LiveToken>,
}

impl PipelineFactory {
    pub fn new(ctx: &DeviceContext) -> GraphicsResult<Self> {
        let tracker = ctx.tracker()?.clone();
        let caps = ctx.capabilities();
        let limits = FactoryLimits {
            max_push_constants_size: caps.max_push_constants_size,
            max_bound_descriptor_sets: caps.max_bound_descriptor_sets,
            multiview: MultiviewSupport {
                supported: caps.multiview,
                max_view_count: caps.max_multiview_view_count,
            },
        };
        log::debug!("Created pipeline factory ({:?})", limits);
        Ok(Self {
            device: ctx.device().clone(),
            limits,
            objects: Mutex::new(OwnedObjects::default()),
            registries: Mutex::new(Registries::default()),
            token: Some(tracker.token()),
            tracker,
        })
    }

    fn ensure_alive(&self) -> GraphicsResult<()> {
        if self.token.is_some() {
            Ok(())
        } else {
            Err(GraphicsError::InvalidState(
                "pipeline factory was destroyed".to_string(),
            ))
        }
    }

    // ------------------------------------------------------------------
    // Shader modules
    // ------------------------------------------------------------------

    /// Reflect SPIR-V `bytecode` and wrap it in a shader module.
    pub fn create_shader_module(&self, bytecode: &[u8]) -> GraphicsResult<ShaderModule> {
        self.ensure_alive()?;
        let stages = reflect_spirv(bytecode)?;
        let words = to_words(bytecode)?;
        let create_info = vk::ShaderModuleCreateInfo::default().code(&words);
        let handle = unsafe { self.device.create_shader_module(&create_info, None) }
            .map_err(|e| GraphicsError::InvalidBytecode(format!("driver rejected module: {e:?}")))?;
        self.objects.lock().shader_modules.push(handle);
        log::debug!(
            "Created shader module with entry points {:?}",
            stages.iter().map(|s| &s.entry_point).collect::<Vec<_>>()
        );
        Ok(ShaderModule::new(handle, stages))
    }

    /// Compile one WGSL entry point and wrap it in a shader module.
    pub fn create_wgsl_module(
        &self,
        source: &str,
        stage: ShaderStage,
        entry_point: &str,
    ) -> GraphicsResult<ShaderModule> {
        let words = compile_wgsl(source, stage, entry_point)?;
        self.create_shader_module(bytemuck::cast_slice(&words))
    }

    // ------------------------------------------------------------------
    // Layouts
    // ------------------------------------------------------------------

    /// Build the layout of set `set` from its reflected bindings.
    pub fn create_set(
        &self,
        set: u32,
        bindings: &[ReflectedBinding],
    ) -> GraphicsResult<DescriptorSetLayout> {
        self.ensure_alive()?;
        let desc = SetLayoutDesc::new(set, bindings.to_vec())?;
        self.create_set_from_desc(desc)
    }

    fn create_set_from_desc(&self, desc: SetLayoutDesc) -> GraphicsResult<DescriptorSetLayout> {
        let vk_bindings = desc.vk_bindings();
        let create_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&vk_bindings);
        let handle = unsafe { self.device.create_descriptor_set_layout(&create_info, None) }?;
        self.objects.lock().set_layouts.push(handle);

        let format_id = self
            .registries
            .lock()
            .sets
            .id_for(desc.signature(), desc.is_empty());
        log::debug!(
            "Created layout for set {} ({} bindings, format {})",
            desc.set(),
            desc.bindings().len(),
            format_id
        );
        Ok(DescriptorSetLayout {
            handle,
            format_id,
            desc: Arc::new(desc),
        })
    }

    /// One layout per set index declared in `info`.
    ///
    /// Every set is validated before any layout is created.
    pub fn create_sets(
        &self,
        info: &ShaderReflectionInfo,
    ) -> GraphicsResult<BTreeMap<u32, DescriptorSetLayout>> {
        self.ensure_alive()?;
        let descs = SetLayoutDesc::from_reflection(info)?;
        descs
            .into_iter()
            .map(|desc| Ok((desc.set(), self.create_set_from_desc(desc)?)))
            .collect()
    }

    fn empty_set_layout(&self) -> GraphicsResult<vk::DescriptorSetLayout> {
        let mut objects = self.objects.lock();
        if let Some(layout) = objects.empty_set_layout {
            return Ok(layout);
        }
        let create_info = vk::DescriptorSetLayoutCreateInfo::default();
        let layout = unsafe { self.device.create_descriptor_set_layout(&create_info, None) }?;
        objects.empty_set_layout = Some(layout);
        Ok(layout)
    }

    /// Order `set_layouts` by set index, filling gaps with empty layouts.
    pub fn create_pipeline_layout(
        &self,
        set_layouts: &[DescriptorSetLayout],
        push_constants: &[PushConstantRange],
    ) -> GraphicsResult<PipelineLayout> {
        self.ensure_alive()?;
        check_push_constants(push_constants, self.limits.max_push_constants_size)?;
        let indices: Vec<u32> = set_layouts.iter().map(|l| l.set()).collect();
        let order = plan_set_order(&indices)?;
        if order.len() as u32 > self.limits.max_bound_descriptor_sets {
            return Err(GraphicsError::InvalidParameter(format!(
                "{} descriptor sets exceed the device limit of {}",
                order.len(),
                self.limits.max_bound_descriptor_sets
            )));
        }

        let mut handles = Vec::with_capacity(order.len());
        let mut set_format_ids = Vec::with_capacity(order.len());
        for slot in &order {
            match slot {
                Some(position) => {
                    handles.push(set_layouts[*position].handle);
                    set_format_ids.push(set_layouts[*position].format_id);
                }
                None => {
                    handles.push(self.empty_set_layout()?);
                    set_format_ids.push(super::registry::EMPTY_FORMAT_ID);
                }
            }
        }
        let ranges: Vec<vk::PushConstantRange> = push_constants.iter().map(|r| r.to_vk()).collect();
        let create_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&handles)
            .push_constant_ranges(&ranges);
        let handle = unsafe { self.device.create_pipeline_layout(&create_info, None) }?;
        self.objects.lock().pipeline_layouts.push(handle);
        log::debug!(
            "Created pipeline layout with {} sets and {} push constant ranges",
            handles.len(),
            ranges.len()
        );
        Ok(PipelineLayout {
            handle,
            set_format_ids,
            push_constants: push_constants.to_vec(),
        })
    }

    /// Reflect `stages` together and build their set and pipeline layouts.
    pub fn create_technique(&self, stages: &[ShaderStageDesc<'_>]) -> GraphicsResult<Technique> {
        let reflections = stages
            .iter()
            .map(|s| s.reflection().cloned())
            .collect::<GraphicsResult<Vec<_>>>()?;
        let reflection = ShaderReflectionInfo::merge(reflections)?;
        let sets = self.create_sets(&reflection)?;
        let set_layouts: Vec<DescriptorSetLayout> = sets.values().cloned().collect();
        let push_constants: Vec<PushConstantRange> =
            reflection.push_constants().map(PushConstantRange::from).into_iter().collect();
        let layout = self.create_pipeline_layout(&set_layouts, &push_constants)?;
        Ok(Technique {
            reflection,
            sets,
            layout,
        })
    }

    // ------------------------------------------------------------------
    // Descriptor pools and material sets
    // ------------------------------------------------------------------

    /// Create a fixed-size pool. It never grows; see [`DescriptorPool::allocate`].
    pub fn create_descriptor_pool(
        &self,
        sizing: DescriptorPoolSizing,
    ) -> GraphicsResult<DescriptorPool> {
        self.ensure_alive()?;
        DescriptorPool::new(&self.device, sizing, self.tracker.token())
    }

    /// Allocate a set of `layout` from `pool` and write `resources` into it.
    pub fn create_material_set(
        &self,
        pool: &DescriptorPool,
        layout: &DescriptorSetLayout,
        resources: &[ResourceBinding<'_>],
    ) -> GraphicsResult<MaterialDescriptorSet> {
        self.ensure_alive()?;
        validate_bindings(layout.desc(), resources)?;
        let sets = pool.allocate(layout, 1)?;
        let Some(&set) = sets.first() else {
            return Err(GraphicsError::PoolExhausted(
                "driver returned no descriptor set".to_string(),
            ));
        };
        write_bindings(&self.device, set, layout.desc(), resources);
        Ok(MaterialDescriptorSet::new(
            set,
            layout.set(),
            layout.format_id(),
            resources.len(),
        ))
    }

    // ------------------------------------------------------------------
    // Render passes
    // ------------------------------------------------------------------

    pub fn create_render_pass(
        &self,
        attachments: &[AttachmentDesc],
        config: LoadStoreConfig,
        subpasses: &[SubpassDesc],
        dependencies: &[vk::SubpassDependency],
    ) -> GraphicsResult<RenderPass> {
        self.build_render_pass(attachments, config, subpasses, dependencies, None)
    }

    /// Like [`create_render_pass`](Self::create_render_pass), rendering each
    /// subpass to the layers selected by its view mask.
    pub fn create_render_pass_multiview(
        &self,
        attachments: &[AttachmentDesc],
        config: LoadStoreConfig,
        subpasses: &[SubpassDesc],
        dependencies: &[vk::SubpassDependency],
        multiview: &MultiviewDesc,
    ) -> GraphicsResult<RenderPass> {
        validate_multiview(attachments, subpasses.len(), multiview, self.limits.multiview)?;
        self.build_render_pass(attachments, config, subpasses, dependencies, Some(multiview))
    }

    fn build_render_pass(
        &self,
        attachments: &[AttachmentDesc],
        config: LoadStoreConfig,
        subpasses: &[SubpassDesc],
        dependencies: &[vk::SubpassDependency],
        multiview: Option<&MultiviewDesc>,
    ) -> GraphicsResult<RenderPass> {
        self.ensure_alive()?;
        validate_subpasses(attachments, subpasses)?;
        let descriptions = attachments
            .iter()
            .map(|a| attachment_description(a, config))
            .collect::<GraphicsResult<Vec<_>>>()?;

        let reference = |index: u32, layout: vk::ImageLayout| vk::AttachmentReference {
            attachment: index,
            layout,
        };
        let color_refs: Vec<Vec<vk::AttachmentReference>> = subpasses
            .iter()
            .map(|s| {
                s.color_attachments
                    .iter()
                    .map(|&i| reference(i, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL))
                    .collect()
            })
            .collect();
        let input_refs: Vec<Vec<vk::AttachmentReference>> = subpasses
            .iter()
            .map(|s| {
                s.input_attachments
                    .iter()
                    .map(|&i| {
                        let layout = if attachments[i as usize].is_depth() {
                            vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL
                        } else {
                            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
                        };
                        reference(i, layout)
                    })
                    .collect()
            })
            .collect();
        let depth_refs: Vec<Option<vk::AttachmentReference>> = subpasses
            .iter()
            .map(|s| {
                s.depth_attachment
                    .map(|i| reference(i, vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL))
            })
            .collect();

        let vk_subpasses: Vec<vk::SubpassDescription> = (0..subpasses.len())
            .map(|i| {
                let description = vk::SubpassDescription::default()
                    .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
                    .color_attachments(&color_refs[i])
                    .input_attachments(&input_refs[i]);
                match &depth_refs[i] {
                    Some(depth) => description.depth_stencil_attachment(depth),
                    None => description,
                }
            })
            .collect();

        let mut create_info = vk::RenderPassCreateInfo::default()
            .attachments(&descriptions)
            .subpasses(&vk_subpasses)
            .dependencies(dependencies);
        let mut multiview_info = multiview.map(|mv| {
            vk::RenderPassMultiviewCreateInfo::default()
                .view_masks(&mv.view_masks)
                .correlation_masks(&mv.correlation_masks)
        });
        if let Some(info) = multiview_info.as_mut() {
            create_info = create_info.push_next(info);
        }

        let handle = unsafe { self.device.create_render_pass(&create_info, None) }.map_err(|e| {
            log::error!("Render pass creation failed: {:?}", e);
            match e {
                vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
                    GraphicsError::OutOfDeviceMemory
                }
                other => GraphicsError::RenderPassCreationFailed(format!("{other:?}")),
            }
        })?;
        self.objects.lock().render_passes.push(handle);

        let signature: Vec<_> = attachments.iter().map(|a| a.signature()).collect();
        let format_id = self
            .registries
            .lock()
            .passes
            .id_for(signature, attachments.is_empty());
        log::debug!(
            "Created render pass with {} attachments, {} subpasses{} (format {})",
            attachments.len(),
            subpasses.len(),
            if multiview.is_some() { ", multiview" } else { "" },
            format_id
        );
        Ok(RenderPass::new(
            handle,
            format_id,
            attachments,
            subpasses,
            multiview.map(|mv| mv.view_masks.clone()),
        ))
    }

    /// Bind `views` to the attachments of `render_pass`.
    pub fn create_framebuffer(
        &self,
        render_pass: &RenderPass,
        views: &[&ImageView],
        extent: Extent2d,
    ) -> GraphicsResult<Framebuffer> {
        self.ensure_alive()?;
        Framebuffer::new(&self.device, render_pass, views, extent, self.tracker.token())
    }

    // ------------------------------------------------------------------
    // Graphics pipelines
    // ------------------------------------------------------------------

    /// Build a graphics pipeline for `desc.subpass` of `desc.render_pass`.
    pub fn create_graphics_pipeline(
        &self,
        desc: &GraphicsPipelineDesc<'_>,
    ) -> GraphicsResult<GraphicsPipeline> {
        self.ensure_alive()?;
        let color_count = desc
            .render_pass
            .color_attachment_count(desc.subpass)
            .ok_or_else(|| {
                GraphicsError::InvalidParameter(format!(
                    "render pass has {} subpasses, subpass {} requested",
                    desc.render_pass.subpass_count(),
                    desc.subpass
                ))
            })?;
        let reflections = desc
            .stages
            .iter()
            .map(|s| s.reflection())
            .collect::<GraphicsResult<Vec<_>>>()?;
        check_graphics_stages(&reflections, color_count)?;
        check_layout_covers(&reflections, desc.layout)?;

        let vertex = reflections
            .iter()
            .find(|r| r.stage == ShaderStage::Vertex)
            .copied()
            .ok_or_else(|| GraphicsError::InvalidParameter("vertex stage required".to_string()))?;
        let attributes = desc.state.vertex_input.attributes(&vertex.inputs)?;
        let attribute_descriptions = attributes
            .iter()
            .map(|a| {
                let format = convert_interface_format(a.format).ok_or_else(|| {
                    GraphicsError::StageInterfaceMismatch(format!(
                        "no vertex format for {:?} at location {}",
                        a.format, a.location
                    ))
                })?;
                Ok(vk::VertexInputAttributeDescription::default()
                    .location(a.location)
                    .binding(0)
                    .format(format)
                    .offset(a.offset))
            })
            .collect::<GraphicsResult<Vec<_>>>()?;
        let binding_descriptions: Vec<vk::VertexInputBindingDescription> =
            if attribute_descriptions.is_empty() {
                Vec::new()
            } else {
                vec![vk::VertexInputBindingDescription::default()
                    .binding(0)
                    .stride(desc.state.vertex_input.stride())
                    .input_rate(vk::VertexInputRate::VERTEX)]
            };

        let entry_names = desc
            .stages
            .iter()
            .map(|s| s.entry_name())
            .collect::<GraphicsResult<Vec<_>>>()?;
        let shader_stages: Vec<vk::PipelineShaderStageCreateInfo> = desc
            .stages
            .iter()
            .zip(&entry_names)
            .map(|(s, name)| {
                vk::PipelineShaderStageCreateInfo::default()
                    .stage(convert_stage_flags(s.stage.flag()))
                    .module(s.module.handle)
                    .name(name)
            })
            .collect();

        let state = desc.state;
        let vertex_input_state = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&binding_descriptions)
            .vertex_attribute_descriptions(&attribute_descriptions);
        let input_assembly_state = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(convert_topology(state.topology))
            .primitive_restart_enable(false);
        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);

        let bias = state.depth.bias;
        let rasterization_state = vk::PipelineRasterizationStateCreateInfo::default()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(vk::PolygonMode::FILL)
            .line_width(1.0)
            .cull_mode(convert_cull_mode(state.cull_mode))
            .front_face(convert_front_face(state.front_face))
            .depth_bias_enable(state.dynamic_depth_bias || bias.is_some())
            .depth_bias_constant_factor(bias.map_or(0.0, |b| b.constant))
            .depth_bias_slope_factor(bias.map_or(0.0, |b| b.slope));

        let samples = desc
            .render_pass
            .attachments()
            .first()
            .map_or(1, |a| a.samples);
        let multisample_state = vk::PipelineMultisampleStateCreateInfo::default()
            .sample_shading_enable(false)
            .rasterization_samples(convert_sample_count(samples));

        let depth_stencil_state = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(state.depth.test)
            .depth_write_enable(state.depth.write)
            .depth_compare_op(convert_compare_function(state.depth.compare))
            .depth_bounds_test_enable(false)
            .stencil_test_enable(false);

        let blend_attachments =
            vec![convert_blend_mode(state.blend); color_count as usize];
        let color_blend_state = vk::PipelineColorBlendStateCreateInfo::default()
            .logic_op_enable(false)
            .attachments(&blend_attachments);

        let mut dynamic_states = vec![vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        if state.dynamic_depth_bias {
            dynamic_states.push(vk::DynamicState::DEPTH_BIAS);
        }
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&shader_stages)
            .vertex_input_state(&vertex_input_state)
            .input_assembly_state(&input_assembly_state)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization_state)
            .multisample_state(&multisample_state)
            .depth_stencil_state(&depth_stencil_state)
            .color_blend_state(&color_blend_state)
            .dynamic_state(&dynamic_state)
            .layout(desc.layout.handle)
            .render_pass(desc.render_pass.handle)
            .subpass(desc.subpass);

        let pipelines = unsafe {
            self.device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        }
        .map_err(|(_, e)| GraphicsError::from(e))?;
        let Some(&handle) = pipelines.first() else {
            return Err(GraphicsError::ResourceCreationFailed(
                "driver returned no pipeline".to_string(),
            ));
        };
        self.objects.lock().pipelines.push(handle);
        log::debug!(
            "Created graphics pipeline ({} stages, {} colour outputs, subpass {})",
            shader_stages.len(),
            color_count,
            desc.subpass
        );
        Ok(GraphicsPipeline {
            handle,
            layout: desc.layout.handle,
            render_pass_format: desc.render_pass.format_id(),
            subpass: desc.subpass,
        })
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Objects created and not yet released.
    pub fn owned_objects(&self) -> usize {
        self.objects.lock().count()
    }

    /// Wait for the GPU and release every object the factory owns.
    ///
    /// Pools and framebuffers are not affected. Calling it twice is a no-op.
    pub fn destroy(&mut self, ctx: &DeviceContext) -> GraphicsResult<()> {
        if self.token.is_none() {
            return Ok(());
        }
        ctx.wait_idle()?;
        let released = self.objects.get_mut().count();
        unsafe { self.objects.get_mut().release(&self.device) };
        self.token = None;
        log::debug!("Pipeline factory destroyed ({released} objects released)");
        Ok(())
    }
}

impl Drop for PipelineFactory {
    fn drop(&mut self) {
        if self.token.is_none() {
            return;
        }
        // The live token keeps the device alive until this point.
        log::warn!(
            "PipelineFactory dropped without destroy(); releasing {} objects",
            self.objects.get_mut().count()
        );
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                log::warn!("device_wait_idle failed during factory drop: {e:?}");
            }
            self.objects.get_mut().release(&self.device);
        }
    }
}

/// Stage set rules of a graphics pipeline.
fn check_graphics_stages(stages: &[&StageReflection], color_attachments: u32) -> GraphicsResult<()> {
    for (i, stage) in stages.iter().enumerate() {
        if stages[..i].iter().any(|s| s.stage == stage.stage) {
            return Err(GraphicsError::DuplicateStage(format!("{:?}", stage.stage)));
        }
    }
    if stages.iter().any(|s| s.stage == ShaderStage::Compute) {
        return Err(GraphicsError::InvalidParameter(
            "compute stage cannot be part of a graphics pipeline".to_string(),
        ));
    }
    let vertex = stages
        .iter()
        .find(|s| s.stage == ShaderStage::Vertex)
        .ok_or_else(|| GraphicsError::InvalidParameter("vertex stage required".to_string()))?;
    let fragment = stages.iter().find(|s| s.stage == ShaderStage::Fragment);

    if let Some(fragment) = fragment {
        check_interface(&vertex.outputs, &fragment.inputs)?;
    }
    let outputs = fragment
        .and_then(|f| f.outputs.iter().map(|o| o.location + 1).max())
        .unwrap_or(0);
    if outputs != color_attachments {
        return Err(GraphicsError::AttachmentMismatch {
            attachments: color_attachments,
            outputs,
        });
    }
    Ok(())
}

/// Every set the stages use must exist in the layout.
fn check_layout_covers(stages: &[&StageReflection], layout: &PipelineLayout) -> GraphicsResult<()> {
    let used = stages.iter().flat_map(|s| s.bindings.iter());
    for binding in used {
        if binding.set >= layout.set_count() {
            return Err(GraphicsError::InvalidParameter(format!(
                "shader uses set {} but the pipeline layout has {} sets",
                binding.set,
                layout.set_count()
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reflect::{InterfaceFormat, InterfaceVariable, ResourceKind, StageFlags};

    fn var(location: u32, components: u8) -> InterfaceVariable {
        InterfaceVariable {
            location,
            format: InterfaceFormat::float(components),
            name: None,
        }
    }

    fn vertex() -> StageReflection {
        let mut stage = StageReflection::new(ShaderStage::Vertex, "vs_main");
        stage.outputs = vec![var(0, 3), var(1, 2)];
        stage
    }

    fn fragment(outputs: &[u32]) -> StageReflection {
        let mut stage = StageReflection::new(ShaderStage::Fragment, "fs_main");
        stage.inputs = vec![var(0, 3), var(1, 2)];
        stage.outputs = outputs.iter().map(|&l| var(l, 4)).collect();
        stage
    }

    #[test]
    fn test_vertex_fragment_pair() {
        let (v, f) = (vertex(), fragment(&[0]));
        assert!(check_graphics_stages(&[&v, &f], 1).is_ok());
    }

    #[test]
    fn test_depth_only_pipeline() {
        let v = vertex();
        assert!(check_graphics_stages(&[&v], 0).is_ok());
    }

    #[test]
    fn test_attachment_mismatch() {
        let (v, f) = (vertex(), fragment(&[0, 1]));
        assert_eq!(
            check_graphics_stages(&[&v, &f], 1),
            Err(GraphicsError::AttachmentMismatch {
                attachments: 1,
                outputs: 2
            })
        );
    }

    #[test]
    fn test_duplicate_stage() {
        let (a, b) = (vertex(), vertex());
        assert!(matches!(
            check_graphics_stages(&[&a, &b], 0),
            Err(GraphicsError::DuplicateStage(_))
        ));
    }

    #[test]
    fn test_compute_rejected() {
        let v = vertex();
        let c = StageReflection::new(ShaderStage::Compute, "cs_main");
        assert!(matches!(
            check_graphics_stages(&[&v, &c], 0),
            Err(GraphicsError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_vertex_required() {
        let f = fragment(&[0]);
        assert!(check_graphics_stages(&[&f], 1).is_err());
    }

    #[test]
    fn test_interface_mismatch() {
        let v = vertex();
        let mut f = fragment(&[0]);
        f.inputs[1] = var(1, 4);
        assert!(matches!(
            check_graphics_stages(&[&v, &f], 1),
            Err(GraphicsError::StageInterfaceMismatch(_))
        ));
    }

    #[test]
    fn test_layout_must_cover_sets() {
        let mut v = vertex();
        v.bindings = vec![ReflectedBinding::new(
            2,
            0,
            ResourceKind::UniformBuffer,
            StageFlags::VERTEX,
        )];
        let layout = PipelineLayout {
            handle: vk::PipelineLayout::null(),
            set_format_ids: vec![1, 0],
            push_constants: Vec::new(),
        };
        assert!(check_layout_covers(&[&v], &layout).is_err());

        let wider = PipelineLayout {
            set_format_ids: vec![1, 0, 2],
            ..layout
        };
        assert!(check_layout_covers(&[&v], &wider).is_ok());
    }
}
