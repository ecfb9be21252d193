//! Vulkan context management for the Ember renderer.
//!
//! This crate provides:
//! - Capability probing and physical device selection
//! - Queue-family allocation and logical device creation
//! - Presentation chains with deferred release on recreation
//! - Per-frame synchronization
//! - Render pass, graphics and ray tracing pipeline creation
//! - Keyed command pools and a shared descriptor pool

pub mod capabilities;
pub mod chain;
pub mod command;
pub mod config;
pub mod context;
pub mod debug;
pub mod descriptors;
pub mod error;
pub mod framebuffer;
pub mod instance;
pub mod memory;
pub mod pipeline;
pub mod queues;
pub mod render_pass;
pub mod retire;
pub mod selection;
pub mod shader;
pub mod surface;
pub mod swapchain;
pub mod sync;

pub use capabilities::{GpuVendor, PhysicalDeviceInfo, RayTracingCapabilities, SurfaceSupport};
pub use chain::{ChainId, PresentationChain};
pub use command::{CommandBuffer, CommandPool};
pub use config::{AppVersion, ContextConfig, LogVerbosity};
pub use context::{Queues, Session, SessionBuilder, TeardownStage, TEARDOWN_ORDER};
pub use descriptors::{
    write_combined_image_sampler, write_storage_image, write_uniform_buffer, DescriptorPool,
    DescriptorSetLayout, DescriptorSetLayoutBuilder,
};
pub use error::{GpuError, Result};
pub use framebuffer::{FramebufferDesc, Framebuffers};
pub use memory::{DepthBuffer, GpuAllocator, GpuBuffer, GpuImage};
pub use pipeline::{GraphicsPipelineDesc, Pipeline, PipelineId, PipelineKind, PipelineSet, VertexLayout};
pub use queues::{QueueAllocation, QueueRole, SharingPlan};
pub use shader::{ShaderKind, ShaderStage};
pub use surface::NativeWindow;
pub use swapchain::{ChainParams, PresentModePreference};
pub use sync::{FrameSlot, FrameSyncSet};
