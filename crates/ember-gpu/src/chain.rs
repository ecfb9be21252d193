//! Presentation chains: a window, its surface, and the current swapchain.

use crate::capabilities::SurfaceSupport;
use crate::error::Result;
use crate::queues::SharingPlan;
use crate::surface::{NativeWindow, WindowSurface};
use crate::swapchain::{ChainParams, Swapchain, SwapchainDesc};
use ash::vk;
use std::sync::Arc;

/// Identifies a chain within its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChainId(pub(crate) usize);

impl ChainId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Loaders and queue layout a chain is built against.
pub struct ChainTarget<'a> {
    pub device: &'a ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub surface_loader: &'a ash::khr::surface::Instance,
    pub swapchain_loader: &'a ash::khr::swapchain::Device,
    pub sharing: SharingPlan,
}

/// One window's presentation chain.
pub struct PresentationChain {
    surface: WindowSurface,
    swapchain: Swapchain,
    params: ChainParams,
}

impl PresentationChain {
    /// Build a swapchain for `surface`. The surface is destroyed if this fails.
    ///
    /// # Safety
    /// All handles in `target` must be valid and belong to one device.
    pub unsafe fn new(
        target: &ChainTarget<'_>,
        surface: WindowSurface,
        extent: vk::Extent2D,
        params: ChainParams,
    ) -> Result<Self> {
        match build_swapchain(target, surface.handle(), extent, &params, vk::SwapchainKHR::null()) {
            Ok(swapchain) => Ok(Self {
                surface,
                swapchain,
                params,
            }),
            Err(e) => {
                surface.destroy(target.surface_loader);
                Err(e)
            }
        }
    }

    /// Replace the swapchain, passing the current one as `old_swapchain`.
    ///
    /// Returns the replaced swapchain; the caller destroys it once no
    /// in-flight submission references it.
    ///
    /// # Safety
    /// All handles in `target` must be valid.
    pub unsafe fn recreate(&mut self, target: &ChainTarget<'_>, extent: vk::Extent2D) -> Result<Swapchain> {
        let replacement = build_swapchain(
            target,
            self.surface.handle(),
            extent,
            &self.params,
            self.swapchain.swapchain,
        )?;

        tracing::info!(
            "Recreated presentation chain: {}x{} -> {}x{}",
            self.swapchain.extent.width,
            self.swapchain.extent.height,
            replacement.extent.width,
            replacement.extent.height
        );

        Ok(std::mem::replace(&mut self.swapchain, replacement))
    }

    pub fn swapchain(&self) -> &Swapchain {
        &self.swapchain
    }

    pub fn format(&self) -> vk::Format {
        self.swapchain.format
    }

    pub fn color_space(&self) -> vk::ColorSpaceKHR {
        self.swapchain.color_space
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.swapchain.extent
    }

    pub fn images(&self) -> &[vk::Image] {
        &self.swapchain.images
    }

    /// One view per image, index-aligned with [`Self::images`].
    pub fn views(&self) -> &[vk::ImageView] {
        &self.swapchain.image_views
    }

    pub fn surface(&self) -> vk::SurfaceKHR {
        self.surface.handle()
    }

    pub fn window(&self) -> &Arc<dyn NativeWindow> {
        self.surface.window()
    }

    pub fn params(&self) -> ChainParams {
        self.params
    }

    /// Destroy views, swapchain, surface, then release the window.
    ///
    /// # Safety
    /// The device must be idle with respect to this chain.
    pub unsafe fn destroy(
        self,
        device: &ash::Device,
        surface_loader: &ash::khr::surface::Instance,
        swapchain_loader: &ash::khr::swapchain::Device,
    ) {
        self.swapchain.destroy(device, swapchain_loader);
        self.surface.destroy(surface_loader);
    }
}

unsafe fn build_swapchain(
    target: &ChainTarget<'_>,
    surface: vk::SurfaceKHR,
    extent: vk::Extent2D,
    params: &ChainParams,
    old: vk::SwapchainKHR,
) -> Result<Swapchain> {
    let support = SurfaceSupport::query(target.surface_loader, target.physical_device, surface)?;
    let desc = SwapchainDesc::negotiate(&support, extent, params, target.sharing);
    Swapchain::new(target.device, target.swapchain_loader, surface, &desc, old)
}
