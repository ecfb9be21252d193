//! Framebuffers over a presentation chain's views.

use crate::error::Result;
use ash::vk;

/// Shared shape of every framebuffer built for one chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramebufferDesc {
    pub render_pass: vk::RenderPass,
    pub depth_view: Option<vk::ImageView>,
    pub extent: vk::Extent2D,
}

impl FramebufferDesc {
    /// Color view first, then the depth view when there is one.
    pub fn attachments(&self, color_view: vk::ImageView) -> Vec<vk::ImageView> {
        std::iter::once(color_view).chain(self.depth_view).collect()
    }

    pub fn create_info<'a>(&self, attachments: &'a [vk::ImageView]) -> vk::FramebufferCreateInfo<'a> {
        vk::FramebufferCreateInfo::default()
            .render_pass(self.render_pass)
            .attachments(attachments)
            .width(self.extent.width)
            .height(self.extent.height)
            .layers(1)
    }
}

/// One framebuffer per chain image, index-aligned with the chain's views.
///
/// Owned by the caller. Destroy them before the chain is recreated and before
/// the session is dropped.
pub struct Framebuffers {
    pub framebuffers: Vec<vk::Framebuffer>,
    pub extent: vk::Extent2D,
}

impl Framebuffers {
    /// Build a framebuffer for every view in `color_views`.
    ///
    /// # Safety
    /// All handles must be valid and `desc.render_pass` compatible with the views.
    pub unsafe fn new(device: &ash::Device, desc: &FramebufferDesc, color_views: &[vk::ImageView]) -> Result<Self> {
        let mut framebuffers = Vec::with_capacity(color_views.len());

        for &view in color_views {
            let attachments = desc.attachments(view);
            let create_info = desc.create_info(&attachments);

            match device.create_framebuffer(&create_info, None) {
                Ok(framebuffer) => framebuffers.push(framebuffer),
                Err(e) => {
                    for framebuffer in framebuffers {
                        device.destroy_framebuffer(framebuffer, None);
                    }
                    return Err(e.into());
                }
            }
        }

        Ok(Self {
            framebuffers,
            extent: desc.extent,
        })
    }

    /// Framebuffer for swapchain image `image_index`.
    pub fn get(&self, image_index: u32) -> Option<vk::Framebuffer> {
        self.framebuffers.get(image_index as usize).copied()
    }

    pub fn len(&self) -> usize {
        self.framebuffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.framebuffers.is_empty()
    }

    /// # Safety
    /// No framebuffer may be in use.
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        for framebuffer in self.framebuffers.drain(..) {
            device.destroy_framebuffer(framebuffer, None);
        }
    }
}
