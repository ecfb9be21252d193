//! Swapchain negotiation and management.

use crate::capabilities::SurfaceSupport;
use crate::error::{GpuError, Result};
use crate::queues::SharingPlan;
use ash::vk;

/// Caller-facing present mode preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentModePreference {
    /// Present immediately, tearing allowed.
    Immediate,
    /// Vsync that tears when a frame is late.
    DoubleBuffering,
    /// Strict vsync.
    Vsync,
    /// Replace the queued image instead of blocking.
    TripleBuffering,
}

impl PresentModePreference {
    pub fn to_vk(self) -> vk::PresentModeKHR {
        match self {
            Self::Immediate => vk::PresentModeKHR::IMMEDIATE,
            Self::DoubleBuffering => vk::PresentModeKHR::FIFO_RELAXED,
            Self::Vsync => vk::PresentModeKHR::FIFO,
            Self::TripleBuffering => vk::PresentModeKHR::MAILBOX,
        }
    }
}

/// Per-chain presentation preferences.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainParams {
    /// `None` takes the first mode the surface reports.
    pub present_mode: Option<PresentModePreference>,
    /// Prefer an sRGB surface format over a linear one.
    pub srgb: bool,
}

impl Default for ChainParams {
    fn default() -> Self {
        Self {
            present_mode: Some(PresentModePreference::Vsync),
            srgb: false,
        }
    }
}

impl ChainParams {
    pub fn with_present_mode(mut self, mode: PresentModePreference) -> Self {
        self.present_mode = Some(mode);
        self
    }

    pub fn with_srgb(mut self, srgb: bool) -> Self {
        self.srgb = srgb;
        self
    }
}

/// Pick the present mode for `preference`.
///
/// Falls back to the first available mode with a warning, both when the
/// preference is unsupported and when none was given.
pub fn select_present_mode(
    available: &[vk::PresentModeKHR],
    preference: Option<PresentModePreference>,
) -> vk::PresentModeKHR {
    let fallback = available.first().copied().unwrap_or(vk::PresentModeKHR::FIFO);

    match preference {
        Some(preference) => {
            let wanted = preference.to_vk();
            if available.contains(&wanted) {
                wanted
            } else {
                tracing::warn!(
                    "Present mode {:?} ({:?}) is not supported by the surface, using {:?}",
                    preference,
                    wanted,
                    fallback
                );
                fallback
            }
        }
        None => {
            tracing::warn!("No present mode requested, using {:?}", fallback);
            fallback
        }
    }
}

/// Whether `format` stores sRGB-encoded color.
pub fn is_srgb_format(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::R8_SRGB
            | vk::Format::R8G8_SRGB
            | vk::Format::R8G8B8_SRGB
            | vk::Format::B8G8R8_SRGB
            | vk::Format::R8G8B8A8_SRGB
            | vk::Format::B8G8R8A8_SRGB
            | vk::Format::A8B8G8R8_SRGB_PACK32
    )
}

/// Fallback when the surface accepts any format.
pub const DEFAULT_SURFACE_FORMAT: vk::SurfaceFormatKHR = vk::SurfaceFormatKHR {
    format: vk::Format::B8G8R8A8_UNORM,
    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
};

/// Select the surface format matching the sRGB preference.
pub fn select_surface_format(available: &[vk::SurfaceFormatKHR], srgb: bool) -> vk::SurfaceFormatKHR {
    match available {
        [] => DEFAULT_SURFACE_FORMAT,
        [only] if only.format == vk::Format::UNDEFINED => DEFAULT_SURFACE_FORMAT,
        _ => available
            .iter()
            .find(|f| is_srgb_format(f.format) == srgb)
            .copied()
            .unwrap_or(available[0]),
    }
}

/// Calculate swapchain extent.
pub fn calculate_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    desired_width: u32,
    desired_height: u32,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        capabilities.current_extent
    } else {
        vk::Extent2D {
            width: desired_width.clamp(
                capabilities.min_image_extent.width,
                capabilities.max_image_extent.width,
            ),
            height: desired_height.clamp(
                capabilities.min_image_extent.height,
                capabilities.max_image_extent.height,
            ),
        }
    }
}

/// One more image than the minimum, clamped to the maximum when there is one.
pub fn image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let count = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 {
        count.min(capabilities.max_image_count)
    } else {
        count
    }
}

/// Everything negotiated for one swapchain, before any handle exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainDesc {
    pub surface_format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
    pub image_count: u32,
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
    pub sharing: SharingPlan,
}

impl SwapchainDesc {
    /// Negotiate against probed surface support.
    pub fn negotiate(
        support: &SurfaceSupport,
        window_extent: vk::Extent2D,
        params: &ChainParams,
        sharing: SharingPlan,
    ) -> Self {
        Self {
            surface_format: select_surface_format(&support.formats, params.srgb),
            present_mode: select_present_mode(&support.present_modes, params.present_mode),
            extent: calculate_extent(
                &support.capabilities,
                window_extent.width,
                window_extent.height,
            ),
            image_count: image_count(&support.capabilities),
            pre_transform: support.capabilities.current_transform,
            sharing,
        }
    }

    /// Create info for this description. `old` is null on first creation.
    pub fn create_info(&self, surface: vk::SurfaceKHR, old: vk::SwapchainKHR) -> vk::SwapchainCreateInfoKHR<'_> {
        vk::SwapchainCreateInfoKHR::default()
            .surface(surface)
            .min_image_count(self.image_count)
            .image_format(self.surface_format.format)
            .image_color_space(self.surface_format.color_space)
            .image_extent(self.extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(self.sharing.mode())
            .queue_family_indices(self.sharing.families())
            .pre_transform(self.pre_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(self.present_mode)
            .clipped(true)
            .old_swapchain(old)
    }
}

/// Build one view per image, in image order.
///
/// If a view fails, the views already built are passed to `discard` before the
/// error is returned.
pub fn build_image_views<C, D>(images: &[vk::Image], mut create: C, mut discard: D) -> Result<Vec<vk::ImageView>>
where
    C: FnMut(vk::Image) -> Result<vk::ImageView>,
    D: FnMut(vk::ImageView),
{
    let mut views = Vec::with_capacity(images.len());
    for &image in images {
        match create(image) {
            Ok(view) => views.push(view),
            Err(e) => {
                views.into_iter().for_each(&mut discard);
                return Err(e);
            }
        }
    }
    Ok(views)
}

/// Swapchain wrapper.
pub struct Swapchain {
    pub swapchain: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub format: vk::Format,
    pub color_space: vk::ColorSpaceKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
}

impl Swapchain {
    /// Create a swapchain and one color view per image.
    ///
    /// # Safety
    /// All handles must be valid. `old_swapchain` must be null or a live
    /// swapchain created from `surface`.
    pub unsafe fn new(
        device: &ash::Device,
        swapchain_loader: &ash::khr::swapchain::Device,
        surface: vk::SurfaceKHR,
        desc: &SwapchainDesc,
        old_swapchain: vk::SwapchainKHR,
    ) -> Result<Self> {
        let create_info = desc.create_info(surface, old_swapchain);

        let swapchain = swapchain_loader
            .create_swapchain(&create_info, None)
            .map_err(|e| GpuError::SwapchainCreation(e.to_string()))?;

        let images = match swapchain_loader.get_swapchain_images(swapchain) {
            Ok(images) => images,
            Err(e) => {
                swapchain_loader.destroy_swapchain(swapchain, None);
                return Err(e.into());
            }
        };

        let format = desc.surface_format.format;
        let image_views = build_image_views(
            &images,
            |image| {
                let view_info = vk::ImageViewCreateInfo::default()
                    .image(image)
                    .view_type(vk::ImageViewType::TYPE_2D)
                    .format(format)
                    .components(vk::ComponentMapping::default())
                    .subresource_range(
                        vk::ImageSubresourceRange::default()
                            .aspect_mask(vk::ImageAspectFlags::COLOR)
                            .base_mip_level(0)
                            .level_count(1)
                            .base_array_layer(0)
                            .layer_count(1),
                    );
                Ok(device.create_image_view(&view_info, None)?)
            },
            |view| device.destroy_image_view(view, None),
        );

        let image_views = match image_views {
            Ok(views) => views,
            Err(e) => {
                swapchain_loader.destroy_swapchain(swapchain, None);
                return Err(e);
            }
        };

        tracing::debug!(
            "Created swapchain: {}x{}, {} images, {:?}, {:?}",
            desc.extent.width,
            desc.extent.height,
            images.len(),
            format,
            desc.present_mode
        );

        Ok(Self {
            swapchain,
            images,
            image_views,
            format,
            color_space: desc.surface_format.color_space,
            present_mode: desc.present_mode,
            extent: desc.extent,
        })
    }

    /// Acquire the next image.
    ///
    /// Returns the image index and whether the swapchain is suboptimal.
    /// `ERROR_OUT_OF_DATE_KHR` means no image was acquired and the chain must
    /// be recreated.
    ///
    /// # Safety
    /// All handles must be valid.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub unsafe fn acquire_next_image(
        &self,
        swapchain_loader: &ash::khr::swapchain::Device,
        semaphore: vk::Semaphore,
    ) -> Result<(u32, bool)> {
        let (index, suboptimal) = swapchain_loader.acquire_next_image(
            self.swapchain,
            u64::MAX,
            semaphore,
            vk::Fence::null(),
        )?;
        Ok((index, suboptimal))
    }

    /// Present an image. Returns `true` when the chain should be recreated.
    ///
    /// # Safety
    /// All handles must be valid.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub unsafe fn present(
        &self,
        swapchain_loader: &ash::khr::swapchain::Device,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> Result<bool> {
        let swapchains = [self.swapchain];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        match swapchain_loader.queue_present(queue, &present_info) {
            Ok(suboptimal) => Ok(suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(true),
            Err(e) => Err(GpuError::from(e)),
        }
    }

    /// Destroy the image views, then the swapchain.
    ///
    /// # Safety
    /// All handles must be valid and swapchain must not be in use.
    pub unsafe fn destroy(
        &self,
        device: &ash::Device,
        swapchain_loader: &ash::khr::swapchain::Device,
    ) {
        for &view in &self.image_views {
            device.destroy_image_view(view, None);
        }
        swapchain_loader.destroy_swapchain(self.swapchain, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn format(format: vk::Format) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }
    }

    fn capabilities(min: u32, max: u32) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: min,
            max_image_count: max,
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D {
                width: 64,
                height: 64,
            },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 2160,
            },
            current_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
            ..Default::default()
        }
    }

    #[test]
    fn triple_buffering_falls_back_to_first_available() {
        let available = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::IMMEDIATE];
        let mode = select_present_mode(&available, Some(PresentModePreference::TripleBuffering));
        assert_eq!(mode, vk::PresentModeKHR::FIFO);
    }

    #[derive(Clone, Default)]
    struct CapturedLog(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLog {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    /// Run `f` under a plain-text subscriber and return what it logged.
    fn capture_log<R>(f: impl FnOnce() -> R) -> (R, String) {
        let log = CapturedLog::default();
        let writer = log.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_max_level(tracing::Level::TRACE)
            .with_writer(move || writer.clone())
            .finish();

        let result = tracing::subscriber::with_default(subscriber, f);
        let text = String::from_utf8_lossy(&log.0.lock()).into_owned();
        (result, text)
    }

    fn warn_lines(log: &str) -> usize {
        log.lines().filter(|line| line.contains("WARN")).count()
    }

    #[test]
    fn unsupported_preference_logs_one_warning() {
        let available = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::IMMEDIATE];
        let (mode, log) = capture_log(|| {
            select_present_mode(&available, Some(PresentModePreference::TripleBuffering))
        });

        assert_eq!(mode, vk::PresentModeKHR::FIFO);
        assert_eq!(warn_lines(&log), 1, "log was: {log}");
        assert!(log.contains("TripleBuffering"));
    }

    #[test]
    fn missing_preference_logs_one_warning() {
        let available = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];
        let (mode, log) = capture_log(|| select_present_mode(&available, None));

        assert_eq!(mode, vk::PresentModeKHR::FIFO);
        assert_eq!(warn_lines(&log), 1, "log was: {log}");
    }

    #[test]
    fn honored_preference_logs_nothing() {
        let available = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];
        let (mode, log) = capture_log(|| {
            select_present_mode(&available, Some(PresentModePreference::TripleBuffering))
        });

        assert_eq!(mode, vk::PresentModeKHR::MAILBOX);
        assert_eq!(warn_lines(&log), 0, "log was: {log}");
    }

    #[test]
    fn preferences_map_to_vulkan_modes() {
        let all = [
            vk::PresentModeKHR::FIFO,
            vk::PresentModeKHR::FIFO_RELAXED,
            vk::PresentModeKHR::MAILBOX,
            vk::PresentModeKHR::IMMEDIATE,
        ];
        let cases = [
            (PresentModePreference::Immediate, vk::PresentModeKHR::IMMEDIATE),
            (PresentModePreference::DoubleBuffering, vk::PresentModeKHR::FIFO_RELAXED),
            (PresentModePreference::Vsync, vk::PresentModeKHR::FIFO),
            (PresentModePreference::TripleBuffering, vk::PresentModeKHR::MAILBOX),
        ];
        for (preference, expected) in cases {
            assert_eq!(select_present_mode(&all, Some(preference)), expected);
        }
        assert_eq!(select_present_mode(&all, None), vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn any_format_surface_gets_bgra_unorm() {
        let undefined = [format(vk::Format::UNDEFINED)];
        assert_eq!(select_surface_format(&undefined, true), DEFAULT_SURFACE_FORMAT);
        assert_eq!(select_surface_format(&[], false), DEFAULT_SURFACE_FORMAT);
    }

    #[test]
    fn surface_format_follows_srgb_preference() {
        let available = [
            format(vk::Format::B8G8R8A8_UNORM),
            format(vk::Format::B8G8R8A8_SRGB),
        ];
        assert_eq!(
            select_surface_format(&available, true).format,
            vk::Format::B8G8R8A8_SRGB
        );
        assert_eq!(
            select_surface_format(&available, false).format,
            vk::Format::B8G8R8A8_UNORM
        );

        let linear_only = [format(vk::Format::R16G16B16A16_SFLOAT)];
        assert_eq!(
            select_surface_format(&linear_only, true).format,
            vk::Format::R16G16B16A16_SFLOAT
        );
    }

    #[test]
    fn extent_is_clamped_unless_fixed() {
        let mut caps = capabilities(2, 3);
        assert_eq!(
            calculate_extent(&caps, 10_000, 10),
            vk::Extent2D {
                width: 4096,
                height: 64
            }
        );

        caps.current_extent = vk::Extent2D {
            width: 800,
            height: 600,
        };
        assert_eq!(
            calculate_extent(&caps, 1920, 1080),
            vk::Extent2D {
                width: 800,
                height: 600
            }
        );
    }

    #[test]
    fn image_count_respects_maximum() {
        assert_eq!(image_count(&capabilities(2, 0)), 3);
        assert_eq!(image_count(&capabilities(2, 8)), 3);
        assert_eq!(image_count(&capabilities(3, 3)), 3);
    }

    #[test]
    fn negotiation_fills_the_create_info() {
        let support = SurfaceSupport {
            capabilities: capabilities(2, 0),
            formats: vec![format(vk::Format::B8G8R8A8_UNORM)],
            present_modes: vec![vk::PresentModeKHR::FIFO],
        };
        let params = ChainParams::default();
        let desc = SwapchainDesc::negotiate(
            &support,
            vk::Extent2D {
                width: 1280,
                height: 720,
            },
            &params,
            SharingPlan::between(0, 1),
        );

        assert_eq!(desc.image_count, 3);
        assert_eq!(desc.present_mode, vk::PresentModeKHR::FIFO);

        let info = desc.create_info(vk::SurfaceKHR::from_raw(1), vk::SwapchainKHR::null());
        assert_eq!(info.image_sharing_mode, vk::SharingMode::CONCURRENT);
        assert_eq!(info.queue_family_index_count, 2);
        assert_eq!(info.composite_alpha, vk::CompositeAlphaFlagsKHR::OPAQUE);
        assert_eq!(info.clipped, vk::TRUE);
        assert!(info
            .image_usage
            .contains(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST));
        assert_eq!(info.image_extent.width, 1280);
    }

    #[test]
    fn views_are_index_aligned_with_images() {
        let images: Vec<vk::Image> = (1..=4).map(vk::Image::from_raw).collect();
        let views = build_image_views(
            &images,
            |image| Ok(vk::ImageView::from_raw(image.as_raw() * 100)),
            |_| panic!("nothing to discard"),
        )
        .unwrap();

        assert_eq!(views.len(), images.len());
        for (image, view) in images.iter().zip(&views) {
            assert_eq!(view.as_raw(), image.as_raw() * 100);
        }
    }

    #[test]
    fn failed_view_discards_earlier_ones() {
        let images: Vec<vk::Image> = (1..=3).map(vk::Image::from_raw).collect();
        let mut discarded = Vec::new();

        let result = build_image_views(
            &images,
            |image| {
                if image.as_raw() == 3 {
                    Err(GpuError::Vulkan(vk::Result::ERROR_OUT_OF_HOST_MEMORY))
                } else {
                    Ok(vk::ImageView::from_raw(image.as_raw()))
                }
            },
            |view| discarded.push(view.as_raw()),
        );

        assert!(result.is_err());
        assert_eq!(discarded, vec![1, 2]);
    }
}
