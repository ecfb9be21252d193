//! Window surfaces.
//!
//! Binds a native window to a Vulkan surface, hiding the raw-window-handle
//! plumbing from application code. The surface keeps the window alive for as
//! long as the surface exists.

use crate::error::{GpuError, Result};
use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::ffi::CStr;
use std::sync::Arc;

/// A window the session can present to.
pub trait NativeWindow: HasDisplayHandle + HasWindowHandle + Send + Sync {}

impl<T> NativeWindow for T where T: HasDisplayHandle + HasWindowHandle + Send + Sync {}

/// Instance extensions the windowing system needs to create surfaces.
pub fn required_surface_extensions(window: &dyn NativeWindow) -> Result<Vec<String>> {
    let display = window
        .display_handle()
        .map_err(|e| GpuError::SurfaceCreationFailed(format!("Failed to get display handle: {e}")))?;

    let names = ash_window::enumerate_required_extensions(display.as_raw())
        .map_err(|e| GpuError::SurfaceCreationFailed(format!("Unsupported display: {e}")))?;

    // Pointers come from ash's static extension name constants.
    Ok(names
        .iter()
        .map(|&ptr| unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned())
        .collect())
}

/// A Vulkan surface bound to one window.
pub struct WindowSurface {
    handle: vk::SurfaceKHR,
    window: Arc<dyn NativeWindow>,
}

impl WindowSurface {
    /// Create a surface for `window`.
    ///
    /// # Safety
    /// The entry and instance must be valid, and the instance must have the
    /// extensions from [`required_surface_extensions`] enabled.
    pub unsafe fn new(
        entry: &ash::Entry,
        instance: &ash::Instance,
        window: Arc<dyn NativeWindow>,
    ) -> Result<Self> {
        let display = window
            .display_handle()
            .map_err(|e| GpuError::SurfaceCreationFailed(format!("Failed to get display handle: {e}")))?;
        let window_handle = window
            .window_handle()
            .map_err(|e| GpuError::SurfaceCreationFailed(format!("Failed to get window handle: {e}")))?;

        let handle = ash_window::create_surface(
            entry,
            instance,
            display.as_raw(),
            window_handle.as_raw(),
            None,
        )
        .map_err(|e| GpuError::SurfaceCreationFailed(e.to_string()))?;

        Ok(Self { handle, window })
    }

    pub fn handle(&self) -> vk::SurfaceKHR {
        self.handle
    }

    /// The window this surface presents to.
    pub fn window(&self) -> &Arc<dyn NativeWindow> {
        &self.window
    }

    /// Destroy the surface, then release the window.
    ///
    /// # Safety
    /// No swapchain created from this surface may still exist.
    pub unsafe fn destroy(self, surface_loader: &ash::khr::surface::Instance) {
        surface_loader.destroy_surface(self.handle, None);
        drop(self.window);
    }
}
