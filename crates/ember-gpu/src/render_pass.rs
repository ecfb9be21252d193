//! Color + depth render passes.

use crate::error::{GpuError, Result};
use ash::vk;
use std::collections::HashMap;

/// Color (index 0) and depth (index 1) attachment descriptions.
pub fn attachment_descriptions(
    color_format: vk::Format,
    depth_format: vk::Format,
) -> [vk::AttachmentDescription; 2] {
    let color = vk::AttachmentDescription::default()
        .format(color_format)
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::STORE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(vk::ImageLayout::PRESENT_SRC_KHR);

    let depth = vk::AttachmentDescription::default()
        .format(depth_format)
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::DONT_CARE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);

    [color, depth]
}

/// The single EXTERNAL -> subpass 0 dependency.
pub fn external_dependency() -> vk::SubpassDependency {
    vk::SubpassDependency::default()
        .src_subpass(vk::SUBPASS_EXTERNAL)
        .dst_subpass(0)
        .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
        .dst_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
        .src_access_mask(vk::AccessFlags::empty())
        .dst_access_mask(
            vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
        )
}

/// Create a one-subpass render pass writing color and depth.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_render_pass(
    device: &ash::Device,
    color_format: vk::Format,
    depth_format: vk::Format,
) -> Result<vk::RenderPass> {
    let attachments = attachment_descriptions(color_format, depth_format);

    let color_ref = vk::AttachmentReference::default()
        .attachment(0)
        .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
    let depth_ref = vk::AttachmentReference::default()
        .attachment(1)
        .layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);

    let subpass = vk::SubpassDescription::default()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(std::slice::from_ref(&color_ref))
        .depth_stencil_attachment(&depth_ref);

    let dependency = external_dependency();

    let create_info = vk::RenderPassCreateInfo::default()
        .attachments(&attachments)
        .subpasses(std::slice::from_ref(&subpass))
        .dependencies(std::slice::from_ref(&dependency));

    device
        .create_render_pass(&create_info, None)
        .map_err(|e| GpuError::PipelineCreation(format!("Render pass: {e}")))
}

/// Render passes keyed by (color format, depth format).
///
/// Pipelines and framebuffers borrow handles from the cache; the cache
/// destroys them.
#[derive(Default)]
pub struct RenderPassCache {
    passes: HashMap<(vk::Format, vk::Format), vk::RenderPass>,
}

impl RenderPassCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The pass for this format pair, built by `create` on first request.
    pub fn get_or_create_with<F>(
        &mut self,
        color_format: vk::Format,
        depth_format: vk::Format,
        create: F,
    ) -> Result<vk::RenderPass>
    where
        F: FnOnce() -> Result<vk::RenderPass>,
    {
        let key = (color_format, depth_format);
        if let Some(&pass) = self.passes.get(&key) {
            return Ok(pass);
        }

        let pass = create()?;
        self.passes.insert(key, pass);
        Ok(pass)
    }

    /// # Safety
    /// The device must be valid.
    pub unsafe fn get_or_create(
        &mut self,
        device: &ash::Device,
        color_format: vk::Format,
        depth_format: vk::Format,
    ) -> Result<vk::RenderPass> {
        self.get_or_create_with(color_format, depth_format, || {
            create_render_pass(device, color_format, depth_format)
        })
    }

    pub fn len(&self) -> usize {
        self.passes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passes.is_empty()
    }

    /// # Safety
    /// No pipeline or framebuffer using a cached pass may be in use.
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        for (_, pass) in self.passes.drain() {
            device.destroy_render_pass(pass, None);
        }
    }
}
