//! Window and render loop for the demo.

use std::sync::Arc;

use ash::vk;
use ember_gpu::{
    ChainId, ChainParams, CommandBuffer, ContextConfig, DepthBuffer, Framebuffers, GpuError,
    QueueRole, Session, SessionBuilder,
};
use tracing::{error, info};
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::WindowEvent;
use winit::event_loop::ActiveEventLoop;
use winit::window::{Window, WindowId};

const CLEAR_COLOR: [f32; 4] = [0.05, 0.08, 0.12, 1.0];

/// Drives the demo from winit's event loop.
pub struct DemoRunner {
    config: ContextConfig,
    params: ChainParams,
    size: PhysicalSize<u32>,
    state: Option<RenderState>,
}

impl DemoRunner {
    pub fn new(config: ContextConfig, params: ChainParams, width: u32, height: u32) -> Self {
        Self {
            config,
            params,
            size: PhysicalSize::new(width, height),
            state: None,
        }
    }

    fn create_state(&self, event_loop: &ActiveEventLoop) -> anyhow::Result<RenderState> {
        let window_attrs = Window::default_attributes()
            .with_title(&self.config.app_name)
            .with_inner_size(self.size);
        let window = Arc::new(event_loop.create_window(window_attrs)?);

        let size = window.inner_size();
        let (session, chain) = SessionBuilder::new(self.config.clone()).build_for_window(
            window.clone(),
            extent_of(size),
            self.params,
        )?;

        RenderState::new(window, session, chain)
    }
}

impl ApplicationHandler for DemoRunner {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.state.is_some() {
            return;
        }

        match self.create_state(event_loop) {
            Ok(state) => {
                self.state = Some(state);
                info!("Demo ready");
            }
            Err(e) => {
                error!("Failed to initialize demo: {e:#}");
                event_loop.exit();
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                info!("Close requested");
                // Dropping the state tears the session down in order.
                self.state = None;
                event_loop.exit();
            }
            WindowEvent::RedrawRequested => {
                if let Some(state) = &mut self.state {
                    if let Err(e) = state.render_frame() {
                        error!("Render error: {e:#}");
                    }
                }
            }
            WindowEvent::Resized(size) => {
                if let Some(state) = &mut self.state {
                    state.resize(size);
                }
            }
            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(state) = &self.state {
            state.window.request_redraw();
        }
    }
}

fn extent_of(size: PhysicalSize<u32>) -> vk::Extent2D {
    vk::Extent2D {
        width: size.width,
        height: size.height,
    }
}

/// Per-window GPU objects that depend on the chain.
struct ChainResources {
    depth: DepthBuffer,
    framebuffers: Framebuffers,
    /// One pre-recorded clear per chain image.
    command_buffers: Vec<CommandBuffer>,
}

struct RenderState {
    session: Session,
    window: Arc<Window>,
    chain: ChainId,
    render_pass: vk::RenderPass,
    resources: Option<ChainResources>,
    pending_extent: Option<vk::Extent2D>,
    frame_count: u64,
}

impl RenderState {
    fn new(window: Arc<Window>, mut session: Session, chain: ChainId) -> anyhow::Result<Self> {
        let color_format = session.chain(chain)?.format();
        let depth_format = session.depth_format()?;
        let render_pass = session.render_pass(color_format, depth_format)?;

        let mut state = Self {
            session,
            window,
            chain,
            render_pass,
            resources: None,
            pending_extent: None,
            frame_count: 0,
        };
        state.resources = Some(state.build_resources()?);
        Ok(state)
    }

    fn build_resources(&mut self) -> anyhow::Result<ChainResources> {
        let extent = self.session.chain(self.chain)?.extent();
        let mut depth = self.session.create_depth_buffer(extent)?;

        let framebuffers = match self
            .session
            .create_framebuffers(self.chain, self.render_pass, &depth)
        {
            Ok(framebuffers) => framebuffers,
            Err(e) => {
                self.session.destroy_depth_buffer(&mut depth)?;
                return Err(e.into());
            }
        };

        let command_buffers = self.session.graphics_command_buffers(
            framebuffers.len() as u32,
            vk::CommandBufferUsageFlags::SIMULTANEOUS_USE,
        )?;

        let device = self.session.device();
        for (image_index, command_buffer) in command_buffers.iter().enumerate() {
            let Some(framebuffer) = framebuffers.get(image_index as u32) else {
                continue;
            };
            unsafe {
                command_buffer.begin(device)?;
                record_clear(device, command_buffer.handle, self.render_pass, framebuffer, extent);
                command_buffer.end(device)?;
            }
        }

        info!(
            "Built {} framebuffers at {}x{}",
            framebuffers.len(),
            extent.width,
            extent.height
        );

        Ok(ChainResources {
            depth,
            framebuffers,
            command_buffers,
        })
    }

    /// Release chain-dependent objects. Waits for the device first.
    fn release_resources(&mut self) -> anyhow::Result<()> {
        let Some(mut resources) = self.resources.take() else {
            return Ok(());
        };

        self.session.end_composition()?;
        let family = self.session.family(QueueRole::Graphics);
        unsafe {
            self.session
                .free_command_buffers(family, &resources.command_buffers)?;
            self.session.destroy_framebuffers(&mut resources.framebuffers);
        }
        self.session.destroy_depth_buffer(&mut resources.depth)?;
        Ok(())
    }

    fn resize(&mut self, size: PhysicalSize<u32>) {
        self.pending_extent = Some(extent_of(size));
    }

    fn recreate(&mut self, extent: vk::Extent2D) -> anyhow::Result<()> {
        self.release_resources()?;
        self.session.recreate_chain(self.chain, extent)?;
        self.resources = Some(self.build_resources()?);
        Ok(())
    }

    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    fn render_frame(&mut self) -> anyhow::Result<()> {
        if let Some(extent) = self.pending_extent.take() {
            // Minimized windows report a zero extent; wait for a real size.
            if extent.width == 0 || extent.height == 0 {
                self.pending_extent = Some(extent);
                return Ok(());
            }
            self.recreate(extent)?;
        }

        let slot = self.session.begin_frame()?;

        let (image_index, suboptimal) =
            match self.session.acquire_next_image(self.chain, slot.image_available) {
                Ok(acquired) => acquired,
                Err(GpuError::Vulkan(vk::Result::ERROR_OUT_OF_DATE_KHR)) => {
                    // The slot fence was reset; signal it with an empty submit.
                    self.session
                        .submit(QueueRole::Graphics, &[], &[], &[], &[], slot.in_flight)?;
                    self.session.end_frame();
                    self.pending_extent = Some(extent_of(self.window.inner_size()));
                    return Ok(());
                }
                Err(e) => {
                    self.session.end_frame();
                    return Err(e.into());
                }
            };

        let command_buffer = self
            .resources
            .as_ref()
            .and_then(|resources| resources.command_buffers.get(image_index as usize))
            .map(|command_buffer| command_buffer.handle)
            .ok_or_else(|| anyhow::anyhow!("no command buffer for image {image_index}"))?;

        self.session.submit(
            QueueRole::Graphics,
            &[command_buffer],
            &[slot.image_available],
            &[vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT],
            &[slot.render_finished],
            slot.in_flight,
        )?;

        let stale = self
            .session
            .present(self.chain, image_index, &[slot.render_finished])?;
        self.session.end_frame();

        if suboptimal || stale {
            self.pending_extent = Some(extent_of(self.window.inner_size()));
        }

        self.frame_count += 1;
        Ok(())
    }
}

impl Drop for RenderState {
    fn drop(&mut self) {
        if let Err(e) = self.release_resources() {
            error!("Failed to release chain resources: {e:#}");
        }
        info!("Rendered {} frames", self.frame_count);
    }
}

/// Record a render pass that clears color and depth.
///
/// # Safety
/// The command buffer must be recording and all handles valid.
unsafe fn record_clear(
    device: &ash::Device,
    command_buffer: vk::CommandBuffer,
    render_pass: vk::RenderPass,
    framebuffer: vk::Framebuffer,
    extent: vk::Extent2D,
) {
    let clear_values = [
        vk::ClearValue {
            color: vk::ClearColorValue {
                float32: CLEAR_COLOR,
            },
        },
        vk::ClearValue {
            depth_stencil: vk::ClearDepthStencilValue {
                depth: 1.0,
                stencil: 0,
            },
        },
    ];

    let begin_info = vk::RenderPassBeginInfo::default()
        .render_pass(render_pass)
        .framebuffer(framebuffer)
        .render_area(vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        })
        .clear_values(&clear_values);

    device.cmd_begin_render_pass(command_buffer, &begin_info, vk::SubpassContents::INLINE);
    device.cmd_end_render_pass(command_buffer);
}
