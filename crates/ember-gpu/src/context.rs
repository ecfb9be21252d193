//! GPU session management.
//!
//! A [`Session`] owns every object this crate creates and releases them in
//! [`TEARDOWN_ORDER`] when dropped. The exceptions are [`Framebuffers`],
//! [`DepthBuffer`]s, buffers, command buffers and descriptor set layouts
//! handed to the caller, which must be destroyed before the session.

use crate::capabilities::{
    find_depth_format, surface_present_support, PhysicalDeviceInfo, RayTracingCapabilities,
};
use crate::chain::{ChainId, ChainTarget, PresentationChain};
use crate::command::{submit_command_buffers, CommandBuffer, CommandPoolCache};
use crate::config::{ContextConfig, LogVerbosity};
use crate::debug::DebugMessenger;
use crate::descriptors::{DescriptorBudget, DescriptorPool, DescriptorSetLayout, DescriptorSetLayoutBuilder};
use crate::error::{GpuError, Result};
use crate::framebuffer::{FramebufferDesc, Framebuffers};
use crate::instance::{create_instance, to_cstrings, InstanceBundle};
use crate::memory::{find_memory_type_index, DepthBuffer, GpuAllocator, GpuBuffer};
use crate::pipeline::{
    create_graphics_pipeline, create_ray_tracing_pipeline, GraphicsPipelineDesc, Pipeline, PipelineId, PipelineSet,
};
use crate::queues::{allocate_queue_families, QueueAllocation, QueueRole};
use crate::render_pass::RenderPassCache;
use crate::retire::RetiredChains;
use crate::selection::select_device;
use crate::shader::{ShaderKind, ShaderStage};
use crate::surface::{required_surface_extensions, NativeWindow, WindowSurface};
use crate::swapchain::ChainParams;
use crate::sync::{FrameSlot, FrameSyncSet};
use ash::vk;
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;
use std::ffi::c_char;
use std::sync::Arc;

/// Groups of session-owned objects, released in [`TEARDOWN_ORDER`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownStage {
    DescriptorPools,
    CommandPools,
    Pipelines,
    RenderPasses,
    RetiredChains,
    /// Image views, swapchain, surface, then the window reference.
    PresentationChains,
    FrameSync,
    Allocator,
    DebugMessenger,
    Device,
    Instance,
}

/// Order in which a session releases its objects.
pub const TEARDOWN_ORDER: [TeardownStage; 11] = [
    TeardownStage::DescriptorPools,
    TeardownStage::CommandPools,
    TeardownStage::Pipelines,
    TeardownStage::RenderPasses,
    TeardownStage::RetiredChains,
    TeardownStage::PresentationChains,
    TeardownStage::FrameSync,
    TeardownStage::Allocator,
    TeardownStage::DebugMessenger,
    TeardownStage::Device,
    TeardownStage::Instance,
];

/// Releases what a failed build created, newest first.
struct Unwind {
    steps: Vec<(TeardownStage, Box<dyn FnOnce()>)>,
}

impl Unwind {
    fn new() -> Self {
        Self { steps: Vec::new() }
    }

    fn push(&mut self, stage: TeardownStage, release: impl FnOnce() + 'static) {
        self.steps.push((stage, Box::new(release)));
    }

    /// Hand ownership to the built session.
    fn disarm(mut self) {
        self.steps.clear();
    }
}

impl Drop for Unwind {
    fn drop(&mut self) {
        while let Some((stage, release)) = self.steps.pop() {
            tracing::debug!("Releasing {:?} after failed session build", stage);
            release();
        }
    }
}

/// Device extensions a session enables: swapchain first, then `configured`.
pub fn required_device_extensions(configured: &[String]) -> Vec<String> {
    let mut extensions = vec![ash::khr::swapchain::NAME.to_string_lossy().into_owned()];
    for name in configured {
        if !extensions.contains(name) {
            extensions.push(name.clone());
        }
    }
    extensions
}

fn ray_tracing_extension_name() -> String {
    ash::khr::ray_tracing_pipeline::NAME
        .to_string_lossy()
        .into_owned()
}

/// Queue handles, one per role. Roles sharing a family share a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Queues {
    pub graphics: vk::Queue,
    pub present: vk::Queue,
    pub compute: vk::Queue,
    pub transfer: vk::Queue,
}

impl Queues {
    pub fn get(&self, role: QueueRole) -> vk::Queue {
        match role {
            QueueRole::Graphics => self.graphics,
            QueueRole::Present => self.present,
            QueueRole::Compute => self.compute,
            QueueRole::Transfer => self.transfer,
        }
    }
}

/// Builder for a [`Session`].
pub struct SessionBuilder {
    config: ContextConfig,
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self::new(ContextConfig::default())
    }
}

impl SessionBuilder {
    pub fn new(config: ContextConfig) -> Self {
        Self { config }
    }

    /// Build a session with no window. Presentation rides on the graphics family.
    pub fn build_headless(self) -> Result<Session> {
        let (session, _) = self.build(None)?;
        Ok(session)
    }

    /// Build a session around a primary window and create its chain.
    ///
    /// The window's surface takes part in queue-family selection.
    pub fn build_for_window<W: NativeWindow + 'static>(
        self,
        window: Arc<W>,
        extent: vk::Extent2D,
        params: ChainParams,
    ) -> Result<(Session, ChainId)> {
        let window: Arc<dyn NativeWindow> = window;
        let (mut session, surface) = self.build(Some(window))?;
        let surface = surface
            .ok_or_else(|| GpuError::InvalidState("primary window surface missing".to_string()))?;
        let id = unsafe { session.attach_surface(surface, extent, params)? };
        Ok((session, id))
    }

    fn build(self, window: Option<Arc<dyn NativeWindow>>) -> Result<(Session, Option<WindowSurface>)> {
        let config = self.config;
        config.validate()?;

        let entry = unsafe { ash::Entry::load() }.map_err(|e| GpuError::Loading(e.to_string()))?;

        let window_extensions = match &window {
            Some(window) => required_surface_extensions(window.as_ref())?,
            None => Vec::new(),
        };

        let mut unwind = Unwind::new();

        let InstanceBundle {
            instance,
            active_layers,
        } = unsafe { create_instance(&entry, &config, &window_extensions)? };
        {
            let instance = instance.clone();
            unwind.push(TeardownStage::Instance, move || unsafe {
                instance.destroy_instance(None);
            });
        }

        let debug = if !active_layers.is_empty() && config.log_verbosity != LogVerbosity::Off {
            let messenger = unsafe { DebugMessenger::new(&entry, &instance, config.log_verbosity)? };
            let release = messenger.clone();
            unwind.push(TeardownStage::DebugMessenger, move || unsafe {
                release.destroy();
            });
            Some(messenger)
        } else {
            None
        };

        let surface_loader = ash::khr::surface::Instance::new(&entry, &instance);
        let presentable = window.is_some();
        let surface = match window {
            Some(window) => {
                let surface = unsafe { WindowSurface::new(&entry, &instance, window)? };
                let loader = surface_loader.clone();
                let handle = surface.handle();
                unwind.push(TeardownStage::PresentationChains, move || unsafe {
                    loader.destroy_surface(handle, None);
                });
                Some(surface)
            }
            None => None,
        };

        let device_extensions = required_device_extensions(&config.device_extensions);
        let mut candidates = unsafe { instance.enumerate_physical_devices()? }
            .into_iter()
            .map(|physical_device| unsafe { PhysicalDeviceInfo::probe(&instance, physical_device) })
            .collect::<Result<Vec<_>>>()?;
        let chosen = select_device(&candidates, &device_extensions)?;
        let device_info = candidates.swap_remove(chosen);
        tracing::info!("Selected GPU: {}", device_info.summary());

        let present_support = match &surface {
            Some(surface) => Some(unsafe {
                surface_present_support(
                    &surface_loader,
                    device_info.handle,
                    surface.handle(),
                    device_info.queue_families.len(),
                )?
            }),
            None => None,
        };
        let queue_allocation =
            allocate_queue_families(&device_info.queue_families, present_support.as_deref())?;
        tracing::debug!(
            "Queue families: graphics={} present={} compute={} transfer={}",
            queue_allocation.graphics,
            queue_allocation.present,
            queue_allocation.compute,
            queue_allocation.transfer
        );

        let device = unsafe {
            create_logical_device(&instance, &device_info, &queue_allocation, &device_extensions)?
        };
        {
            let device = device.clone();
            unwind.push(TeardownStage::Device, move || unsafe {
                device.destroy_device(None);
            });
        }
        let device = Arc::new(device);

        let queues = unsafe {
            Queues {
                graphics: device.get_device_queue(queue_allocation.graphics, 0),
                present: device.get_device_queue(queue_allocation.present, 0),
                compute: device.get_device_queue(queue_allocation.compute, 0),
                transfer: device.get_device_queue(queue_allocation.transfer, 0),
            }
        };

        let allocator = unsafe { GpuAllocator::new(&instance, device.clone(), device_info.handle)? };
        let frame_sync = unsafe { FrameSyncSet::new(device.as_ref(), config.max_frames_in_flight)? };

        let swapchain_loader = ash::khr::swapchain::Device::new(&instance, &device);

        unwind.disarm();

        tracing::info!(
            "Session ready for {} with {} frames in flight",
            config.app_name,
            config.max_frames_in_flight
        );

        let session = Session {
            retired: RetiredChains::new(config.max_frames_in_flight),
            config,
            entry,
            instance,
            debug,
            surface_loader,
            physical_device: device_info.handle,
            device_info,
            device_extensions,
            device,
            swapchain_loader,
            rt_loader: None,
            queue_allocation,
            queues,
            allocator: Mutex::new(allocator),
            frame_sync,
            chains: Vec::new(),
            command_pools: CommandPoolCache::new(),
            descriptor_pool: None,
            render_passes: RenderPassCache::new(),
            pipelines: PipelineSet::default(),
            presentable,
        };

        Ok((session, surface))
    }
}

/// Create the logical device with one queue per allocated family.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn create_logical_device(
    instance: &ash::Instance,
    device_info: &PhysicalDeviceInfo,
    queue_allocation: &QueueAllocation,
    extensions: &[String],
) -> Result<ash::Device> {
    let max_queues = queue_allocation
        .create_plans
        .iter()
        .map(|plan| plan.count)
        .max()
        .unwrap_or(1);
    let priorities = vec![1.0_f32; max_queues as usize];
    let queue_create_infos = queue_allocation.queue_create_infos(&priorities);

    let extension_cstrings = to_cstrings(extensions)?;
    let extension_names: Vec<*const c_char> = extension_cstrings.iter().map(|s| s.as_ptr()).collect();

    let features = vk::PhysicalDeviceFeatures::default()
        .sampler_anisotropy(true)
        .vertex_pipeline_stores_and_atomics(true);

    let mut ray_tracing_features =
        vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default().ray_tracing_pipeline(true);

    let mut features2 = vk::PhysicalDeviceFeatures2::default().features(features);
    if extensions.contains(&ray_tracing_extension_name()) {
        features2 = features2.push_next(&mut ray_tracing_features);
    }

    let create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&extension_names)
        .push_next(&mut features2);

    let device = instance.create_device(device_info.handle, &create_info, None)?;
    tracing::debug!("Created logical device with extensions {:?}", extensions);
    Ok(device)
}

/// Main GPU session holding every Vulkan object created through it.
pub struct Session {
    config: ContextConfig,
    entry: ash::Entry,
    instance: ash::Instance,
    debug: Option<DebugMessenger>,
    surface_loader: ash::khr::surface::Instance,
    physical_device: vk::PhysicalDevice,
    device_info: PhysicalDeviceInfo,
    device_extensions: Vec<String>,
    device: Arc<ash::Device>,
    swapchain_loader: ash::khr::swapchain::Device,
    rt_loader: Option<ash::khr::ray_tracing_pipeline::Device>,
    queue_allocation: QueueAllocation,
    queues: Queues,
    allocator: Mutex<GpuAllocator>,
    frame_sync: FrameSyncSet,
    chains: Vec<PresentationChain>,
    retired: RetiredChains,
    command_pools: CommandPoolCache,
    descriptor_pool: Option<DescriptorPool>,
    render_passes: RenderPassCache,
    pipelines: PipelineSet,
    presentable: bool,
}

impl Session {
    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// Get the Vulkan instance handle.
    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    /// Get the Vulkan device handle.
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// Probed properties of the selected device.
    pub fn device_info(&self) -> &PhysicalDeviceInfo {
        &self.device_info
    }

    /// Device extensions enabled on the logical device.
    pub fn device_extensions(&self) -> &[String] {
        &self.device_extensions
    }

    pub fn queues(&self) -> Queues {
        self.queues
    }

    pub fn queue_allocation(&self) -> &QueueAllocation {
        &self.queue_allocation
    }

    /// Family index serving `role`.
    pub fn family(&self, role: QueueRole) -> u32 {
        self.queue_allocation.family(role)
    }

    /// Get access to the GPU allocator.
    pub fn allocator(&self) -> &Mutex<GpuAllocator> {
        &self.allocator
    }

    pub fn swapchain_loader(&self) -> &ash::khr::swapchain::Device {
        &self.swapchain_loader
    }

    pub fn frames_in_flight(&self) -> usize {
        self.frame_sync.len()
    }

    pub fn frame_counter(&self) -> u64 {
        self.frame_sync.frame_counter()
    }

    /// Ray tracing limits of the selected device.
    /// Whether `VK_KHR_ray_tracing_pipeline` was enabled on the device.
    pub fn ray_tracing_enabled(&self) -> bool {
        self.device_extensions.contains(&ray_tracing_extension_name())
    }

    /// Zeroed when ray tracing is not enabled.
    pub fn ray_tracing_capabilities(&self) -> RayTracingCapabilities {
        unsafe { RayTracingCapabilities::query(&self.instance, self.physical_device, self.ray_tracing_enabled()) }
    }

    // Presentation

    /// Create a surface and chain for another window.
    ///
    /// Fails on headless sessions, and when the present family cannot present
    /// to the new surface.
    pub fn create_window<W: NativeWindow + 'static>(
        &mut self,
        window: Arc<W>,
        extent: vk::Extent2D,
        params: ChainParams,
    ) -> Result<ChainId> {
        if !self.presentable {
            return Err(GpuError::InvalidState(
                "headless session has no windowing extensions enabled".to_string(),
            ));
        }

        let surface = unsafe { WindowSurface::new(&self.entry, &self.instance, window)? };

        let supported = unsafe {
            self.surface_loader.get_physical_device_surface_support(
                self.physical_device,
                self.queue_allocation.present,
                surface.handle(),
            )
        };
        match supported {
            Ok(true) => unsafe { self.attach_surface(surface, extent, params) },
            Ok(false) => {
                unsafe { surface.destroy(&self.surface_loader) };
                Err(GpuError::NoQueueFamily(QueueRole::Present))
            }
            Err(e) => {
                unsafe { surface.destroy(&self.surface_loader) };
                Err(e.into())
            }
        }
    }

    unsafe fn attach_surface(
        &mut self,
        surface: WindowSurface,
        extent: vk::Extent2D,
        params: ChainParams,
    ) -> Result<ChainId> {
        let target = ChainTarget {
            device: self.device.as_ref(),
            physical_device: self.physical_device,
            surface_loader: &self.surface_loader,
            swapchain_loader: &self.swapchain_loader,
            sharing: self.queue_allocation.present_sharing(),
        };
        let chain = PresentationChain::new(&target, surface, extent, params)?;

        tracing::info!(
            "Created presentation chain {}: {}x{} {:?}",
            self.chains.len(),
            chain.extent().width,
            chain.extent().height,
            chain.format()
        );

        self.chains.push(chain);
        Ok(ChainId(self.chains.len() - 1))
    }

    pub fn chain(&self, id: ChainId) -> Result<&PresentationChain> {
        self.chains
            .get(id.0)
            .ok_or_else(|| GpuError::InvalidState(format!("unknown presentation chain {}", id.0)))
    }

    pub fn chain_count(&self) -> usize {
        self.chains.len()
    }

    /// Rebuild a chain at `extent`.
    ///
    /// The replaced swapchain is released once every frame that could
    /// reference it has retired. Framebuffers over the old views must be
    /// rebuilt by the caller.
    pub fn recreate_chain(&mut self, id: ChainId, extent: vk::Extent2D) -> Result<()> {
        let target = ChainTarget {
            device: self.device.as_ref(),
            physical_device: self.physical_device,
            surface_loader: &self.surface_loader,
            swapchain_loader: &self.swapchain_loader,
            sharing: self.queue_allocation.present_sharing(),
        };
        let chain = self
            .chains
            .get_mut(id.0)
            .ok_or_else(|| GpuError::InvalidState(format!("unknown presentation chain {}", id.0)))?;

        let old = unsafe { chain.recreate(&target, extent)? };
        self.retired.retire(old, self.frame_sync.frame_counter());
        Ok(())
    }

    /// Acquire the next image of a chain, signaling `semaphore`.
    ///
    /// Returns the image index and whether the chain is suboptimal.
    pub fn acquire_next_image(&self, id: ChainId, semaphore: vk::Semaphore) -> Result<(u32, bool)> {
        let chain = self.chain(id)?;
        unsafe {
            chain
                .swapchain()
                .acquire_next_image(&self.swapchain_loader, semaphore)
        }
    }

    /// Present on the present queue. Returns `true` when the chain should be recreated.
    pub fn present(&self, id: ChainId, image_index: u32, wait_semaphores: &[vk::Semaphore]) -> Result<bool> {
        let chain = self.chain(id)?;
        unsafe {
            chain.swapchain().present(
                &self.swapchain_loader,
                self.queues.present,
                image_index,
                wait_semaphores,
            )
        }
    }

    // Frames

    /// Start a frame: wait for the slot's previous use, then release retired
    /// chains no in-flight frame can still reference.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn begin_frame(&mut self) -> Result<FrameSlot> {
        let slot = unsafe { self.frame_sync.begin_frame(self.device.as_ref())? };

        for swapchain in self.retired.drain_ready(self.frame_sync.frame_counter()) {
            unsafe { swapchain.destroy(&self.device, &self.swapchain_loader) };
        }

        Ok(slot)
    }

    pub fn end_frame(&mut self) {
        self.frame_sync.end_frame();
    }

    /// Wait for the device to finish all submitted work.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn end_composition(&self) -> Result<()> {
        unsafe {
            self.device.device_wait_idle()?;
        }
        Ok(())
    }

    /// Submit to the queue serving `role`.
    pub fn submit(
        &self,
        role: QueueRole,
        command_buffers: &[vk::CommandBuffer],
        wait_semaphores: &[vk::Semaphore],
        wait_stages: &[vk::PipelineStageFlags],
        signal_semaphores: &[vk::Semaphore],
        fence: vk::Fence,
    ) -> Result<()> {
        unsafe {
            submit_command_buffers(
                &self.device,
                self.queues.get(role),
                command_buffers,
                wait_semaphores,
                wait_stages,
                signal_semaphores,
                fence,
            )
        }
    }

    // Command buffers

    /// Allocate primary command buffers from the pool for `family`,
    /// creating the pool on first use.
    pub fn command_buffers(
        &mut self,
        family: u32,
        count: u32,
        usage: vk::CommandBufferUsageFlags,
    ) -> Result<Vec<CommandBuffer>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let pool = unsafe { self.command_pools.get_or_create(&self.device, family)? };
        unsafe { pool.allocate_command_buffers(&self.device, count, usage) }
    }

    /// Return buffers allocated for `family`.
    ///
    /// # Safety
    /// The buffers must not be pending.
    pub unsafe fn free_command_buffers(&mut self, family: u32, buffers: &[CommandBuffer]) -> Result<()> {
        let pool = self.command_pools.get_or_create(&self.device, family)?;
        pool.free_command_buffers(&self.device, buffers);
        Ok(())
    }

    /// Reset every buffer allocated for `family` to the initial state.
    ///
    /// A family that never allocated has no pool and nothing to reset.
    ///
    /// # Safety
    /// No buffer from the pool may be pending.
    pub unsafe fn reset_command_pool(&self, family: u32, flags: vk::CommandPoolResetFlags) -> Result<()> {
        match self.command_pools.get(family) {
            Some(pool) => pool.reset(&self.device, flags),
            None => Ok(()),
        }
    }

    pub fn graphics_command_buffers(
        &mut self,
        count: u32,
        usage: vk::CommandBufferUsageFlags,
    ) -> Result<Vec<CommandBuffer>> {
        self.command_buffers(self.queue_allocation.graphics, count, usage)
    }

    pub fn transfer_command_buffers(
        &mut self,
        count: u32,
        usage: vk::CommandBufferUsageFlags,
    ) -> Result<Vec<CommandBuffer>> {
        self.command_buffers(self.queue_allocation.transfer, count, usage)
    }

    pub fn present_command_buffers(
        &mut self,
        count: u32,
        usage: vk::CommandBufferUsageFlags,
    ) -> Result<Vec<CommandBuffer>> {
        self.command_buffers(self.queue_allocation.present, count, usage)
    }

    // Descriptors

    pub fn create_descriptor_set_layout(
        &self,
        builder: DescriptorSetLayoutBuilder<'_>,
    ) -> Result<DescriptorSetLayout> {
        unsafe { builder.build(&self.device) }
    }

    /// # Safety
    /// No pipeline layout or pending allocation may still need the layout.
    pub unsafe fn destroy_descriptor_set_layout(&self, layout: &DescriptorSetLayout) {
        layout.destroy(&self.device);
    }

    /// Allocate one set per layout from the shared pool, creating it on first use.
    pub fn allocate_descriptor_sets(
        &mut self,
        layouts: &[&DescriptorSetLayout],
    ) -> Result<Vec<vk::DescriptorSet>> {
        if layouts.is_empty() {
            return Ok(Vec::new());
        }
        let pool = match self.descriptor_pool.take() {
            Some(pool) => pool,
            None => unsafe { DescriptorPool::with_defaults(&self.device, self.ray_tracing_enabled())? },
        };
        let pool = self.descriptor_pool.insert(pool);
        unsafe { pool.allocate(&self.device, layouts) }
    }

    /// Remaining capacity of the shared pool, if it exists yet.
    pub fn descriptor_budget(&self) -> Option<&DescriptorBudget> {
        self.descriptor_pool.as_ref().map(DescriptorPool::budget)
    }

    // Pipelines

    /// The cached render pass for a color/depth format pair.
    pub fn render_pass(&mut self, color_format: vk::Format, depth_format: vk::Format) -> Result<vk::RenderPass> {
        unsafe {
            self.render_passes
                .get_or_create(&self.device, color_format, depth_format)
        }
    }

    pub fn load_shader(&self, kind: ShaderKind, spirv: &[u8]) -> Result<ShaderStage> {
        unsafe { ShaderStage::from_spirv(&self.device, kind, spirv) }
    }

    /// # Safety
    /// The module may be destroyed once every pipeline using it is created.
    pub unsafe fn destroy_shader(&self, stage: &ShaderStage) {
        stage.destroy(&self.device);
    }

    /// Build a graphics pipeline owned by the session.
    pub fn create_graphics_pipeline(&mut self, desc: &GraphicsPipelineDesc<'_>) -> Result<PipelineId> {
        let pipeline = unsafe { create_graphics_pipeline(&self.device, desc)? };
        Ok(self.pipelines.insert(pipeline))
    }

    /// Build a raygen/closest-hit/miss pipeline.
    ///
    /// Requires `VK_KHR_ray_tracing_pipeline` among the configured device extensions.
    pub fn create_ray_tracing_pipeline(
        &mut self,
        stages: &[ShaderStage],
        set_layouts: &[vk::DescriptorSetLayout],
    ) -> Result<PipelineId> {
        if !self.ray_tracing_enabled() {
            return Err(GpuError::InvalidState(format!(
                "{} is not enabled",
                ray_tracing_extension_name()
            )));
        }

        let loader = self
            .rt_loader
            .get_or_insert_with(|| ash::khr::ray_tracing_pipeline::Device::new(&self.instance, &self.device));
        let pipeline = unsafe { create_ray_tracing_pipeline(&self.device, loader, stages, set_layouts)? };
        Ok(self.pipelines.insert(pipeline))
    }

    pub fn pipeline(&self, id: PipelineId) -> Result<&Pipeline> {
        self.pipelines.get(id)
    }

    pub fn pipeline_count(&self) -> usize {
        self.pipelines.len()
    }

    // Attachments

    /// First depth format the device supports as an optimal-tiling attachment.
    pub fn depth_format(&self) -> Result<vk::Format> {
        unsafe { find_depth_format(&self.instance, self.physical_device) }
            .ok_or_else(|| GpuError::InvalidState("no supported depth format".to_string()))
    }

    /// Caller-owned. Pass it to [`Self::destroy_depth_buffer`] before the session drops.
    pub fn create_depth_buffer(&self, extent: vk::Extent2D) -> Result<DepthBuffer> {
        let format = self.depth_format()?;
        DepthBuffer::new(&mut self.allocator.lock(), format, extent)
    }

    pub fn destroy_depth_buffer(&self, depth: &mut DepthBuffer) -> Result<()> {
        depth.destroy(&mut self.allocator.lock())
    }

    /// One framebuffer per view of chain `id`, sharing `depth`.
    pub fn create_framebuffers(
        &self,
        id: ChainId,
        render_pass: vk::RenderPass,
        depth: &DepthBuffer,
    ) -> Result<Framebuffers> {
        let chain = self.chain(id)?;
        let desc = FramebufferDesc {
            render_pass,
            depth_view: Some(depth.view),
            extent: chain.extent(),
        };
        unsafe { Framebuffers::new(&self.device, &desc, chain.views()) }
    }

    /// # Safety
    /// No submitted work may still use the framebuffers.
    pub unsafe fn destroy_framebuffers(&self, framebuffers: &mut Framebuffers) {
        framebuffers.destroy(&self.device);
    }

    // Memory

    /// Buffer shared between the graphics and transfer families.
    pub fn create_buffer(
        &self,
        size: u64,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        name: &str,
    ) -> Result<GpuBuffer> {
        self.allocator.lock().create_buffer(
            size,
            usage,
            self.queue_allocation.transfer_sharing(),
            location,
            name,
        )
    }

    pub fn free_buffer(&self, buffer: &mut GpuBuffer) -> Result<()> {
        self.allocator.lock().free_buffer(buffer)
    }

    /// Index of the first memory type allowed by `type_bits` with all of `properties`.
    pub fn find_memory_type(&self, type_bits: u32, properties: vk::MemoryPropertyFlags) -> Result<u32> {
        let memory = unsafe {
            self.instance
                .get_physical_device_memory_properties(self.physical_device)
        };
        find_memory_type_index(&memory, type_bits, properties)
    }

    // Teardown

    unsafe fn release(&mut self, stage: TeardownStage) {
        match stage {
            TeardownStage::DescriptorPools => {
                if let Some(pool) = self.descriptor_pool.take() {
                    pool.destroy(&self.device);
                }
            }
            TeardownStage::CommandPools => self.command_pools.destroy(&self.device),
            TeardownStage::Pipelines => self.pipelines.destroy(&self.device),
            TeardownStage::RenderPasses => self.render_passes.destroy(&self.device),
            TeardownStage::RetiredChains => {
                for swapchain in self.retired.drain_all() {
                    swapchain.destroy(&self.device, &self.swapchain_loader);
                }
            }
            TeardownStage::PresentationChains => {
                for chain in self.chains.drain(..) {
                    chain.destroy(&self.device, &self.surface_loader, &self.swapchain_loader);
                }
            }
            TeardownStage::FrameSync => self.frame_sync.destroy(self.device.as_ref()),
            TeardownStage::Allocator => self.allocator.lock().shutdown(),
            TeardownStage::DebugMessenger => {
                if let Some(debug) = self.debug.take() {
                    debug.destroy();
                }
            }
            TeardownStage::Device => self.device.destroy_device(None),
            TeardownStage::Instance => self.instance.destroy_instance(None),
        }
        tracing::trace!("Released {:?}", stage);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Err(e) = self.end_composition() {
            tracing::error!("Device idle wait failed during teardown: {e}");
        }

        for stage in TEARDOWN_ORDER {
            unsafe { self.release(stage) };
        }
    }
}
