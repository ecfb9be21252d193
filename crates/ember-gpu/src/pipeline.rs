//! Pipeline creation and management.

use crate::error::{GpuError, Result};
use crate::shader::{ShaderKind, ShaderStage};
use ash::vk;

/// What a pipeline was built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineKind {
    /// Rasterization inside a render pass owned by the session's cache.
    Graphics { render_pass: vk::RenderPass },
    /// Ray tracing.
    RayTracing,
}

/// An immutable compiled pipeline and its layout.
///
/// Not `Clone`: the owning [`PipelineSet`] is the only place it is destroyed.
#[derive(Debug, PartialEq, Eq)]
pub struct Pipeline {
    pub kind: PipelineKind,
    pub layout: vk::PipelineLayout,
    pub handle: vk::Pipeline,
}

impl Pipeline {
    pub fn bind_point(&self) -> vk::PipelineBindPoint {
        match self.kind {
            PipelineKind::Graphics { .. } => vk::PipelineBindPoint::GRAPHICS,
            PipelineKind::RayTracing => vk::PipelineBindPoint::RAY_TRACING_KHR,
        }
    }

    /// Render pass for graphics pipelines.
    pub fn render_pass(&self) -> Option<vk::RenderPass> {
        match self.kind {
            PipelineKind::Graphics { render_pass } => Some(render_pass),
            PipelineKind::RayTracing => None,
        }
    }

    /// Destroy the pipeline and its layout. The render pass is not touched.
    ///
    /// # Safety
    /// The device must be valid and the pipeline must not be in use.
    pub unsafe fn destroy(self, device: &ash::Device) {
        device.destroy_pipeline(self.handle, None);
        device.destroy_pipeline_layout(self.layout, None);
    }
}

/// Identifies a pipeline within its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipelineId(usize);

impl PipelineId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Pipelines owned by a session, destroyed together at teardown.
#[derive(Debug, Default)]
pub struct PipelineSet {
    pipelines: Vec<Pipeline>,
}

impl PipelineSet {
    pub fn insert(&mut self, pipeline: Pipeline) -> PipelineId {
        self.pipelines.push(pipeline);
        PipelineId(self.pipelines.len() - 1)
    }

    pub fn get(&self, id: PipelineId) -> Result<&Pipeline> {
        self.pipelines
            .get(id.0)
            .ok_or_else(|| GpuError::InvalidState(format!("unknown pipeline {}", id.0)))
    }

    pub fn len(&self) -> usize {
        self.pipelines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }

    /// Destroy every pipeline. Ids handed out earlier stop resolving.
    ///
    /// # Safety
    /// No pipeline may be in use.
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        for pipeline in self.pipelines.drain(..) {
            pipeline.destroy(device);
        }
    }
}

/// Vertex layout: one binding plus its attributes.
#[derive(Debug, Clone, Copy)]
pub struct VertexLayout<'a> {
    pub binding: vk::VertexInputBindingDescription,
    pub attributes: &'a [vk::VertexInputAttributeDescription],
}

/// Everything a graphics pipeline is built from.
#[derive(Debug, Clone, Copy)]
pub struct GraphicsPipelineDesc<'a> {
    pub stages: &'a [ShaderStage],
    pub vertex: VertexLayout<'a>,
    /// Static viewport and scissor size, normally the chain extent.
    pub extent: vk::Extent2D,
    pub render_pass: vk::RenderPass,
    pub set_layouts: &'a [vk::DescriptorSetLayout],
}

/// Full-extent viewport and matching scissor.
pub fn viewport_for_extent(extent: vk::Extent2D) -> (vk::Viewport, vk::Rect2D) {
    let viewport = vk::Viewport {
        x: 0.0,
        y: 0.0,
        width: extent.width as f32,
        height: extent.height as f32,
        min_depth: 0.0,
        max_depth: 1.0,
    };
    let scissor = vk::Rect2D {
        offset: vk::Offset2D { x: 0, y: 0 },
        extent,
    };
    (viewport, scissor)
}

unsafe fn create_layout(
    device: &ash::Device,
    set_layouts: &[vk::DescriptorSetLayout],
) -> Result<vk::PipelineLayout> {
    let layout_info = vk::PipelineLayoutCreateInfo::default().set_layouts(set_layouts);

    device
        .create_pipeline_layout(&layout_info, None)
        .map_err(|e| GpuError::PipelineCreation(e.to_string()))
}

/// Create a graphics pipeline for subpass 0 of `desc.render_pass`.
///
/// # Safety
/// The device, shader modules, render pass and set layouts must be valid.
pub unsafe fn create_graphics_pipeline(
    device: &ash::Device,
    desc: &GraphicsPipelineDesc<'_>,
) -> Result<Pipeline> {
    let shader_stages: Vec<_> = desc.stages.iter().map(ShaderStage::create_info).collect();

    let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
        .vertex_binding_descriptions(std::slice::from_ref(&desc.vertex.binding))
        .vertex_attribute_descriptions(desc.vertex.attributes);

    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
        .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
        .primitive_restart_enable(false);

    let (viewport, scissor) = viewport_for_extent(desc.extent);
    let viewport_state = vk::PipelineViewportStateCreateInfo::default()
        .viewports(std::slice::from_ref(&viewport))
        .scissors(std::slice::from_ref(&scissor));

    let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
        .depth_clamp_enable(false)
        .rasterizer_discard_enable(false)
        .polygon_mode(vk::PolygonMode::FILL)
        .cull_mode(vk::CullModeFlags::BACK)
        .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
        .depth_bias_enable(false)
        .line_width(1.0);

    let multisampling = vk::PipelineMultisampleStateCreateInfo::default()
        .rasterization_samples(vk::SampleCountFlags::TYPE_1)
        .sample_shading_enable(false);

    let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
        .depth_test_enable(true)
        .depth_write_enable(true)
        .depth_compare_op(vk::CompareOp::LESS)
        .depth_bounds_test_enable(false)
        .stencil_test_enable(false);

    let color_blend_attachment = vk::PipelineColorBlendAttachmentState::default()
        .blend_enable(false)
        .color_write_mask(vk::ColorComponentFlags::RGBA);

    let color_blending = vk::PipelineColorBlendStateCreateInfo::default()
        .logic_op_enable(false)
        .attachments(std::slice::from_ref(&color_blend_attachment));

    let layout = create_layout(device, desc.set_layouts)?;

    let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
        .stages(&shader_stages)
        .vertex_input_state(&vertex_input)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterization)
        .multisample_state(&multisampling)
        .depth_stencil_state(&depth_stencil)
        .color_blend_state(&color_blending)
        .layout(layout)
        .render_pass(desc.render_pass)
        .subpass(0);

    let pipelines = match device.create_graphics_pipelines(
        vk::PipelineCache::null(),
        &[pipeline_info],
        None,
    ) {
        Ok(pipelines) => pipelines,
        Err((_, e)) => {
            device.destroy_pipeline_layout(layout, None);
            return Err(GpuError::PipelineCreation(e.to_string()));
        }
    };

    tracing::debug!("Created graphics pipeline with {} stages", desc.stages.len());

    Ok(Pipeline {
        kind: PipelineKind::Graphics {
            render_pass: desc.render_pass,
        },
        layout,
        handle: pipelines[0],
    })
}

/// Arrange stages as raygen, closest-hit, miss.
///
/// Exactly one stage of each kind is required, in any input order.
pub fn order_ray_tracing_stages(stages: &[ShaderStage]) -> Result<[ShaderStage; 3]> {
    if stages.len() != 3 {
        return Err(GpuError::PipelineCreation(format!(
            "ray tracing pipelines take exactly 3 stages, got {}",
            stages.len()
        )));
    }

    let find = |kind: ShaderKind| -> Result<ShaderStage> {
        let mut matching = stages.iter().filter(|s| s.kind == kind);
        match (matching.next(), matching.next()) {
            (Some(stage), None) => Ok(*stage),
            (None, _) => Err(GpuError::PipelineCreation(format!(
                "ray tracing pipeline is missing a {kind:?} stage"
            ))),
            (Some(_), Some(_)) => Err(GpuError::PipelineCreation(format!(
                "ray tracing pipeline has more than one {kind:?} stage"
            ))),
        }
    };

    Ok([
        find(ShaderKind::RayGeneration)?,
        find(ShaderKind::ClosestHit)?,
        find(ShaderKind::Miss)?,
    ])
}

/// Groups for stages ordered by [`order_ray_tracing_stages`].
pub fn ray_tracing_groups() -> [vk::RayTracingShaderGroupCreateInfoKHR<'static>; 3] {
    let general = |stage: u32| {
        vk::RayTracingShaderGroupCreateInfoKHR::default()
            .ty(vk::RayTracingShaderGroupTypeKHR::GENERAL)
            .general_shader(stage)
            .closest_hit_shader(vk::SHADER_UNUSED_KHR)
            .any_hit_shader(vk::SHADER_UNUSED_KHR)
            .intersection_shader(vk::SHADER_UNUSED_KHR)
    };

    [
        general(0),
        vk::RayTracingShaderGroupCreateInfoKHR::default()
            .ty(vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP)
            .general_shader(vk::SHADER_UNUSED_KHR)
            .closest_hit_shader(1)
            .any_hit_shader(vk::SHADER_UNUSED_KHR)
            .intersection_shader(vk::SHADER_UNUSED_KHR),
        general(2),
    ]
}

/// Create a ray tracing pipeline with recursion depth 1.
///
/// # Safety
/// The device, loader, shader modules and set layouts must be valid, and the
/// device must have `VK_KHR_ray_tracing_pipeline` enabled.
pub unsafe fn create_ray_tracing_pipeline(
    device: &ash::Device,
    rt_loader: &ash::khr::ray_tracing_pipeline::Device,
    stages: &[ShaderStage],
    set_layouts: &[vk::DescriptorSetLayout],
) -> Result<Pipeline> {
    let ordered = order_ray_tracing_stages(stages)?;
    let shader_stages = ordered.map(|stage| stage.create_info());
    let shader_groups = ray_tracing_groups();

    let layout = create_layout(device, set_layouts)?;

    let pipeline_info = vk::RayTracingPipelineCreateInfoKHR::default()
        .stages(&shader_stages)
        .groups(&shader_groups)
        .max_pipeline_ray_recursion_depth(1)
        .layout(layout);

    let pipelines = match rt_loader.create_ray_tracing_pipelines(
        vk::DeferredOperationKHR::null(),
        vk::PipelineCache::null(),
        &[pipeline_info],
        None,
    ) {
        Ok(pipelines) => pipelines,
        Err(e) => {
            device.destroy_pipeline_layout(layout, None);
            return Err(GpuError::PipelineCreation(format!("Ray tracing pipeline: {e:?}")));
        }
    };

    tracing::debug!("Created ray tracing pipeline");

    Ok(Pipeline {
        kind: PipelineKind::RayTracing,
        layout,
        handle: pipelines[0],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn stage(kind: ShaderKind, raw: u64) -> ShaderStage {
        ShaderStage {
            kind,
            module: vk::ShaderModule::from_raw(raw),
        }
    }

    #[test]
    fn viewport_covers_the_extent() {
        let (viewport, scissor) = viewport_for_extent(vk::Extent2D {
            width: 1920,
            height: 1080,
        });
        assert_eq!(viewport.width, 1920.0);
        assert_eq!(viewport.height, 1080.0);
        assert_eq!(viewport.max_depth, 1.0);
        assert_eq!(scissor.extent.width, 1920);
        assert_eq!(scissor.offset.x, 0);
    }

    #[test]
    fn ray_tracing_stages_are_reordered() {
        let stages = [
            stage(ShaderKind::Miss, 3),
            stage(ShaderKind::RayGeneration, 1),
            stage(ShaderKind::ClosestHit, 2),
        ];
        let ordered = order_ray_tracing_stages(&stages).unwrap();
        let raws: Vec<u64> = ordered.iter().map(|s| s.module.as_raw()).collect();
        assert_eq!(raws, vec![1, 2, 3]);
    }

    #[test]
    fn ray_tracing_needs_exactly_one_of_each() {
        let duplicate = [
            stage(ShaderKind::RayGeneration, 1),
            stage(ShaderKind::RayGeneration, 2),
            stage(ShaderKind::Miss, 3),
        ];
        assert!(matches!(
            order_ray_tracing_stages(&duplicate),
            Err(GpuError::PipelineCreation(_))
        ));

        let too_few = [stage(ShaderKind::RayGeneration, 1), stage(ShaderKind::Miss, 3)];
        assert!(order_ray_tracing_stages(&too_few).is_err());

        let wrong_kind = [
            stage(ShaderKind::RayGeneration, 1),
            stage(ShaderKind::Fragment, 2),
            stage(ShaderKind::Miss, 3),
        ];
        assert!(order_ray_tracing_stages(&wrong_kind).is_err());
    }

    #[test]
    fn groups_match_stage_order() {
        let [raygen, hit, miss] = ray_tracing_groups();

        assert_eq!(raygen.ty, vk::RayTracingShaderGroupTypeKHR::GENERAL);
        assert_eq!(raygen.general_shader, 0);

        assert_eq!(hit.ty, vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP);
        assert_eq!(hit.closest_hit_shader, 1);
        assert_eq!(hit.general_shader, vk::SHADER_UNUSED_KHR);

        assert_eq!(miss.ty, vk::RayTracingShaderGroupTypeKHR::GENERAL);
        assert_eq!(miss.general_shader, 2);
    }

    #[test]
    fn bind_point_follows_kind() {
        let graphics = Pipeline {
            kind: PipelineKind::Graphics {
                render_pass: vk::RenderPass::from_raw(9),
            },
            layout: vk::PipelineLayout::null(),
            handle: vk::Pipeline::null(),
        };
        assert_eq!(graphics.bind_point(), vk::PipelineBindPoint::GRAPHICS);
        assert_eq!(graphics.render_pass(), Some(vk::RenderPass::from_raw(9)));

        let rt = Pipeline {
            kind: PipelineKind::RayTracing,
            ..graphics
        };
        assert_eq!(rt.bind_point(), vk::PipelineBindPoint::RAY_TRACING_KHR);
        assert_eq!(rt.render_pass(), None);
    }

    fn pipeline(raw: u64) -> Pipeline {
        Pipeline {
            kind: PipelineKind::RayTracing,
            layout: vk::PipelineLayout::from_raw(raw + 100),
            handle: vk::Pipeline::from_raw(raw),
        }
    }

    #[test]
    fn set_hands_out_stable_ids() {
        let mut set = PipelineSet::default();
        assert!(set.is_empty());

        let first = set.insert(pipeline(1));
        let second = set.insert(pipeline(2));

        assert_eq!(set.len(), 2);
        assert_ne!(first, second);
        assert_eq!(set.get(first).unwrap().handle, vk::Pipeline::from_raw(1));
        assert_eq!(set.get(second).unwrap().layout, vk::PipelineLayout::from_raw(102));
    }

    #[test]
    fn unknown_id_is_rejected() {
        let mut set = PipelineSet::default();
        set.insert(pipeline(1));

        assert!(matches!(set.get(PipelineId(5)), Err(GpuError::InvalidState(_))));
    }
}
