//! GPU error types.

use ash::vk;
use thiserror::Error;

use crate::queues::QueueRole;

/// GPU-related errors.
///
/// Every variant except [`GpuError::Vulkan`] coming from a per-frame call is
/// fatal to the construction it interrupted; nothing in this crate retries.
#[derive(Error, Debug)]
pub enum GpuError {
    /// Vulkan error.
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// The Vulkan loader could not be found or initialized.
    #[error("Failed to load Vulkan: {0}")]
    Loading(String),

    /// Configuration rejected before any GPU object was created.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// No physical device met the mandatory extension and feature bar.
    #[error("No suitable GPU found: {0}")]
    NoSuitableDevice(String),

    /// A mandatory queue role could not be assigned to any queue family.
    #[error("No queue family can serve the {0} role")]
    NoQueueFamily(QueueRole),

    /// A native surface could not be bound to a window.
    #[error("Surface creation failed: {0}")]
    SurfaceCreationFailed(String),

    /// Validation was requested but the debug messenger entry point is missing.
    #[error("Debug messenger unavailable: {0}")]
    DebugHookUnavailable(String),

    /// No memory type satisfies the requested type bits and property flags.
    #[error("No memory type matches bits {type_bits:#b} with properties {properties:?}")]
    MemoryTypeNotFound {
        type_bits: u32,
        properties: vk::MemoryPropertyFlags,
    },

    /// The shared descriptor pool cannot satisfy an allocation.
    #[error("Descriptor pool exhausted: {0}")]
    DescriptorPoolExhausted(String),

    /// Memory allocation failed.
    #[error("Memory allocation failed: {0}")]
    AllocationFailed(String),

    /// Swapchain creation failed.
    #[error("Swapchain creation failed: {0}")]
    SwapchainCreation(String),

    /// Shader module creation failed.
    #[error("Shader module creation failed: {0}")]
    ShaderModule(String),

    /// Pipeline creation failed.
    #[error("Pipeline creation failed: {0}")]
    PipelineCreation(String),

    /// Invalid state.
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_family_error_names_the_role() {
        let err = GpuError::NoQueueFamily(QueueRole::Present);
        assert_eq!(err.to_string(), "No queue family can serve the present role");
    }

    #[test]
    fn vulkan_results_convert() {
        let err: GpuError = vk::Result::ERROR_DEVICE_LOST.into();
        assert!(matches!(err, GpuError::Vulkan(vk::Result::ERROR_DEVICE_LOST)));
    }
}
