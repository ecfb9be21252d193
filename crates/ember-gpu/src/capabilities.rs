//! GPU capability probing.
//!
//! Read-only queries against the instance, physical devices and surfaces.
//! Nothing here caches: callers re-probe whenever the device they care about
//! changes.

use ash::vk;
use std::collections::HashSet;
use std::ffi::CStr;

use crate::error::{GpuError, Result};

/// GPU vendor identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    Other(u32),
}

impl GpuVendor {
    /// Identify vendor from PCI vendor ID.
    pub fn from_vendor_id(id: u32) -> Self {
        match id {
            0x10DE => Self::Nvidia,
            0x1002 => Self::Amd,
            0x8086 => Self::Intel,
            0x106B => Self::Apple,
            other => Self::Other(other),
        }
    }
}

/// Plain-data snapshot of one physical device, as seen by the device selector.
#[derive(Debug, Clone)]
pub struct PhysicalDeviceInfo {
    /// Raw handle (null in tests).
    pub handle: vk::PhysicalDevice,
    /// Device name
    pub name: String,
    /// GPU vendor
    pub vendor: GpuVendor,
    /// Discrete, integrated, virtual, ...
    pub device_type: vk::PhysicalDeviceType,
    /// Vulkan API version
    pub api_version: u32,
    /// Queue family properties, indexed by family.
    pub queue_families: Vec<vk::QueueFamilyProperties>,
    /// Names of all supported device extensions.
    pub extensions: HashSet<String>,
    /// `samplerAnisotropy` feature.
    pub sampler_anisotropy: bool,
    /// `vertexPipelineStoresAndAtomics` feature.
    pub vertex_pipeline_stores_and_atomics: bool,
}

impl PhysicalDeviceInfo {
    /// Probe a physical device.
    ///
    /// # Safety
    /// The instance and physical device must be valid.
    pub unsafe fn probe(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Result<Self> {
        let properties = instance.get_physical_device_properties(physical_device);
        let features = instance.get_physical_device_features(physical_device);

        let name = CStr::from_ptr(properties.device_name.as_ptr())
            .to_string_lossy()
            .into_owned();

        Ok(Self {
            handle: physical_device,
            name,
            vendor: GpuVendor::from_vendor_id(properties.vendor_id),
            device_type: properties.device_type,
            api_version: properties.api_version,
            queue_families: queue_family_properties(instance, physical_device),
            extensions: device_extension_names(instance, physical_device)?,
            sampler_anisotropy: features.sampler_anisotropy == vk::TRUE,
            vertex_pipeline_stores_and_atomics: features.vertex_pipeline_stores_and_atomics
                == vk::TRUE,
        })
    }

    /// Whether any queue family carries all of `flags`.
    pub fn has_queue_flags(&self, flags: vk::QueueFlags) -> bool {
        self.queue_families
            .iter()
            .any(|family| family.queue_flags.contains(flags))
    }

    /// Whether every name in `required` is a supported extension.
    pub fn supports_extensions<S: AsRef<str>>(&self, required: &[S]) -> bool {
        missing_extensions(&self.extensions, required).is_empty()
    }

    /// Get a human-readable summary of the device.
    pub fn summary(&self) -> String {
        format!(
            "{} ({:?}, {:?}) - Vulkan {}.{}.{}",
            self.name,
            self.vendor,
            self.device_type,
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            vk::api_version_patch(self.api_version),
        )
    }
}

/// Names of the instance layers the loader reports.
///
/// # Safety
/// The entry must be valid.
pub unsafe fn available_layer_names(entry: &ash::Entry) -> Result<Vec<String>> {
    let layers = entry.enumerate_instance_layer_properties()?;
    Ok(layers
        .iter()
        .map(|props| {
            CStr::from_ptr(props.layer_name.as_ptr())
                .to_string_lossy()
                .into_owned()
        })
        .collect())
}

/// Keep the requested layers that are available, in request order.
///
/// Unsupported layers are dropped with a warning; this never fails.
pub fn filter_supported_layers<S: AsRef<str>>(requested: &[S], available: &[String]) -> Vec<String> {
    requested
        .iter()
        .map(AsRef::as_ref)
        .filter(|name| {
            let supported = available.iter().any(|a| a == name);
            if !supported {
                tracing::warn!(
                    "Validation layer '{}' is not supported by this Vulkan instance and will not be activated",
                    name
                );
            }
            supported
        })
        .map(String::from)
        .collect()
}

/// Names of all extensions a physical device supports.
///
/// # Safety
/// The instance and physical device must be valid.
pub unsafe fn device_extension_names(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
) -> Result<HashSet<String>> {
    let extensions = instance.enumerate_device_extension_properties(physical_device)?;
    Ok(extensions
        .iter()
        .filter_map(|ext| {
            CStr::from_ptr(ext.extension_name.as_ptr())
                .to_str()
                .ok()
                .map(String::from)
        })
        .collect())
}

/// Required extension names that are not in `available`.
pub fn missing_extensions<'a, S: AsRef<str>>(
    available: &HashSet<String>,
    required: &'a [S],
) -> Vec<&'a str> {
    required
        .iter()
        .map(AsRef::as_ref)
        .filter(|name| !available.contains(*name))
        .collect()
}

/// Queue family properties of a physical device.
///
/// # Safety
/// The instance and physical device must be valid.
pub unsafe fn queue_family_properties(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
) -> Vec<vk::QueueFamilyProperties> {
    instance.get_physical_device_queue_family_properties(physical_device)
}

/// Per-family presentation support for a surface, indexed by family.
///
/// # Safety
/// All handles must be valid.
pub unsafe fn surface_present_support(
    surface_loader: &ash::khr::surface::Instance,
    physical_device: vk::PhysicalDevice,
    surface: vk::SurfaceKHR,
    family_count: usize,
) -> Result<Vec<bool>> {
    (0..family_count as u32)
        .map(|family| {
            surface_loader
                .get_physical_device_surface_support(physical_device, family, surface)
                .map_err(GpuError::from)
        })
        .collect()
}

/// Surface capabilities query result.
#[derive(Debug, Clone)]
pub struct SurfaceSupport {
    /// Raw surface capabilities.
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    /// Supported surface formats.
    pub formats: Vec<vk::SurfaceFormatKHR>,
    /// Supported present modes, in driver order.
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SurfaceSupport {
    /// Query a surface against a physical device.
    ///
    /// # Safety
    /// All handles must be valid.
    pub unsafe fn query(
        surface_loader: &ash::khr::surface::Instance,
        physical_device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
    ) -> Result<Self> {
        Ok(Self {
            capabilities: surface_loader
                .get_physical_device_surface_capabilities(physical_device, surface)?,
            formats: surface_loader.get_physical_device_surface_formats(physical_device, surface)?,
            present_modes: surface_loader
                .get_physical_device_surface_present_modes(physical_device, surface)?,
        })
    }
}

/// Whether `properties` advertise `features` for the given tiling.
pub fn format_supports(
    properties: &vk::FormatProperties,
    tiling: vk::ImageTiling,
    features: vk::FormatFeatureFlags,
) -> bool {
    match tiling {
        vk::ImageTiling::LINEAR => properties.linear_tiling_features.contains(features),
        vk::ImageTiling::OPTIMAL => properties.optimal_tiling_features.contains(features),
        _ => false,
    }
}

/// Whether a format supports a feature set for a tiling mode.
///
/// # Safety
/// The instance and physical device must be valid.
pub unsafe fn is_format_supported(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    format: vk::Format,
    tiling: vk::ImageTiling,
    features: vk::FormatFeatureFlags,
) -> bool {
    let properties = instance.get_physical_device_format_properties(physical_device, format);
    format_supports(&properties, tiling, features)
}

/// Depth formats tried by [`find_depth_format`], most precise first.
pub const DEPTH_FORMAT_CANDIDATES: [vk::Format; 3] = [
    vk::Format::D32_SFLOAT,
    vk::Format::D32_SFLOAT_S8_UINT,
    vk::Format::D24_UNORM_S8_UINT,
];

/// First candidate usable as an optimally tiled depth attachment.
///
/// # Safety
/// The instance and physical device must be valid.
pub unsafe fn find_depth_format(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
) -> Option<vk::Format> {
    DEPTH_FORMAT_CANDIDATES.into_iter().find(|&format| {
        is_format_supported(
            instance,
            physical_device,
            format,
            vk::ImageTiling::OPTIMAL,
            vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
        )
    })
}

/// Hardware ray tracing limits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RayTracingCapabilities {
    /// Size of one shader group handle in bytes.
    pub shader_group_handle_size: u32,
    /// Required alignment of shader group handles.
    pub shader_group_handle_alignment: u32,
    /// Required alignment of shader binding table base addresses.
    pub shader_group_base_alignment: u32,
    /// Maximum trace recursion depth.
    pub max_ray_recursion_depth: u32,
}

impl RayTracingCapabilities {
    /// Query ray tracing pipeline properties.
    ///
    /// Returns zeroed limits when `VK_KHR_ray_tracing_pipeline` is not
    /// enabled, without chaining the properties struct.
    ///
    /// # Safety
    /// The instance and physical device must be valid.
    pub unsafe fn query(instance: &ash::Instance, physical_device: vk::PhysicalDevice, enabled: bool) -> Self {
        if !enabled {
            return Self::default();
        }

        let mut rt_properties = vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
        let mut properties2 = vk::PhysicalDeviceProperties2::default().push_next(&mut rt_properties);
        instance.get_physical_device_properties2(physical_device, &mut properties2);

        Self {
            shader_group_handle_size: rt_properties.shader_group_handle_size,
            shader_group_handle_alignment: rt_properties.shader_group_handle_alignment,
            shader_group_base_alignment: rt_properties.shader_group_base_alignment,
            max_ray_recursion_depth: rt_properties.max_ray_recursion_depth,
        }
    }

    /// Whether the device can run ray tracing pipelines at all.
    pub fn is_supported(&self) -> bool {
        self.shader_group_handle_size > 0 && self.max_ray_recursion_depth > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_ray_tracing_limits_are_unsupported() {
        assert!(!RayTracingCapabilities::default().is_supported());

        let capable = RayTracingCapabilities {
            shader_group_handle_size: 32,
            shader_group_handle_alignment: 32,
            shader_group_base_alignment: 64,
            max_ray_recursion_depth: 1,
        };
        assert!(capable.is_supported());
    }

    #[test]
    fn vendor_identification() {
        assert_eq!(GpuVendor::from_vendor_id(0x10DE), GpuVendor::Nvidia);
        assert_eq!(GpuVendor::from_vendor_id(0x1002), GpuVendor::Amd);
        assert_eq!(GpuVendor::from_vendor_id(0x8086), GpuVendor::Intel);
        assert_eq!(GpuVendor::from_vendor_id(0x1234), GpuVendor::Other(0x1234));
    }

    #[test]
    fn unsupported_layers_are_dropped_in_order() {
        let available = vec![
            "VK_LAYER_KHRONOS_validation".to_string(),
            "VK_LAYER_MESA_overlay".to_string(),
        ];
        let requested = [
            "VK_LAYER_MESA_overlay",
            "VK_LAYER_LUNARG_missing",
            "VK_LAYER_KHRONOS_validation",
        ];

        let kept = filter_supported_layers(&requested, &available);
        assert_eq!(kept, vec!["VK_LAYER_MESA_overlay", "VK_LAYER_KHRONOS_validation"]);
    }

    #[test]
    fn missing_extensions_are_reported() {
        let available: HashSet<String> = ["VK_KHR_swapchain".to_string()].into_iter().collect();
        let required = ["VK_KHR_swapchain", "VK_KHR_ray_tracing_pipeline"];

        assert_eq!(
            missing_extensions(&available, &required),
            vec!["VK_KHR_ray_tracing_pipeline"]
        );
        assert!(missing_extensions(&available, &required[..1]).is_empty());
    }

    #[test]
    fn format_support_checks_the_right_tiling() {
        let properties = vk::FormatProperties {
            linear_tiling_features: vk::FormatFeatureFlags::SAMPLED_IMAGE,
            optimal_tiling_features: vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT
                | vk::FormatFeatureFlags::SAMPLED_IMAGE,
            buffer_features: vk::FormatFeatureFlags::empty(),
        };

        let depth = vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT;
        assert!(format_supports(&properties, vk::ImageTiling::OPTIMAL, depth));
        assert!(!format_supports(&properties, vk::ImageTiling::LINEAR, depth));
        assert!(format_supports(
            &properties,
            vk::ImageTiling::LINEAR,
            vk::FormatFeatureFlags::SAMPLED_IMAGE
        ));
    }
}
