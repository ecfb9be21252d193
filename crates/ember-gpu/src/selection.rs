//! Physical device scoring and selection.

use ash::vk;

use crate::capabilities::PhysicalDeviceInfo;
use crate::error::{GpuError, Result};

const GRAPHICS_QUEUE_SCORE: u32 = 10;
const COMPUTE_QUEUE_SCORE: u32 = 10;
const DISCRETE_GPU_SCORE: u32 = 10;
const INTEGRATED_GPU_SCORE: u32 = 5;
const PREFERRED_VENDOR_SCORE: u32 = 1;

/// Score a probed device. Zero means unusable.
///
/// Missing required extensions, anisotropic sampling or vertex-pipeline
/// stores/atomics disqualify the device; the logical device always enables them.
pub fn score_device<S: AsRef<str>>(device: &PhysicalDeviceInfo, required_extensions: &[S]) -> u32 {
    if !device.supports_extensions(required_extensions)
        || !device.sampler_anisotropy
        || !device.vertex_pipeline_stores_and_atomics
    {
        return 0;
    }

    let mut score = 0;

    if device.has_queue_flags(vk::QueueFlags::GRAPHICS) {
        score += GRAPHICS_QUEUE_SCORE;
    }
    if device.has_queue_flags(vk::QueueFlags::COMPUTE) {
        score += COMPUTE_QUEUE_SCORE;
    }

    match device.device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => score += DISCRETE_GPU_SCORE,
        vk::PhysicalDeviceType::INTEGRATED_GPU => score += INTEGRATED_GPU_SCORE,
        _ => {}
    }

    // Vendor tie-break between otherwise equal devices.
    if device.name.to_ascii_lowercase().contains("nvidia") {
        score += PREFERRED_VENDOR_SCORE;
    }

    score
}

/// Pick the index of the highest-scoring device; ties keep the first one.
pub fn select_device<S: AsRef<str>>(
    devices: &[PhysicalDeviceInfo],
    required_extensions: &[S],
) -> Result<usize> {
    if devices.is_empty() {
        return Err(GpuError::NoSuitableDevice(
            "no GPU with Vulkan support was found".to_string(),
        ));
    }

    let mut best = None;
    let mut best_score = 0;

    for (index, device) in devices.iter().enumerate() {
        let score = score_device(device, required_extensions);
        tracing::debug!("Device candidate {}: score {}", device.summary(), score);
        if score > best_score {
            best_score = score;
            best = Some(index);
        }
    }

    best.ok_or_else(|| {
        let any_has_extensions = devices
            .iter()
            .any(|device| device.supports_extensions(required_extensions));

        if any_has_extensions {
            GpuError::NoSuitableDevice(
                "no device supports sampler anisotropy and vertex pipeline stores".to_string(),
            )
        } else {
            let names: Vec<&str> = required_extensions.iter().map(AsRef::as_ref).collect();
            GpuError::NoSuitableDevice(format!(
                "no device supports all required device extensions [{}]",
                names.join(", ")
            ))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::GpuVendor;
    use std::collections::HashSet;

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    fn device(name: &str, device_type: vk::PhysicalDeviceType) -> PhysicalDeviceInfo {
        PhysicalDeviceInfo {
            handle: vk::PhysicalDevice::null(),
            name: name.to_string(),
            vendor: GpuVendor::Other(0),
            device_type,
            api_version: vk::API_VERSION_1_3,
            queue_families: vec![family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)],
            extensions: ["VK_KHR_swapchain".to_string()].into_iter().collect(),
            sampler_anisotropy: true,
            vertex_pipeline_stores_and_atomics: true,
        }
    }

    const SWAPCHAIN: [&str; 1] = ["VK_KHR_swapchain"];

    #[test]
    fn discrete_beats_integrated() {
        let devices = [
            device("Integrated", vk::PhysicalDeviceType::INTEGRATED_GPU),
            device("Discrete", vk::PhysicalDeviceType::DISCRETE_GPU),
        ];

        assert_eq!(score_device(&devices[0], &SWAPCHAIN), 25);
        assert_eq!(score_device(&devices[1], &SWAPCHAIN), 30);
        assert_eq!(select_device(&devices, &SWAPCHAIN).unwrap(), 1);
    }

    #[test]
    fn vendor_name_breaks_ties() {
        let devices = [
            device("AMD Radeon", vk::PhysicalDeviceType::DISCRETE_GPU),
            device("NVIDIA GeForce", vk::PhysicalDeviceType::DISCRETE_GPU),
        ];
        assert_eq!(select_device(&devices, &SWAPCHAIN).unwrap(), 1);
    }

    #[test]
    fn equal_scores_keep_the_first_device() {
        let devices = [
            device("First", vk::PhysicalDeviceType::DISCRETE_GPU),
            device("Second", vk::PhysicalDeviceType::DISCRETE_GPU),
        ];
        assert_eq!(select_device(&devices, &SWAPCHAIN).unwrap(), 0);
    }

    #[test]
    fn missing_extension_disqualifies() {
        let mut no_swapchain = device("NVIDIA Headless", vk::PhysicalDeviceType::DISCRETE_GPU);
        no_swapchain.extensions = HashSet::new();
        let fallback = device("Software", vk::PhysicalDeviceType::CPU);

        assert_eq!(score_device(&no_swapchain, &SWAPCHAIN), 0);
        assert_eq!(select_device(&[no_swapchain, fallback], &SWAPCHAIN).unwrap(), 1);
    }

    #[test]
    fn missing_features_disqualify() {
        let mut no_aniso = device("A", vk::PhysicalDeviceType::DISCRETE_GPU);
        no_aniso.sampler_anisotropy = false;
        let mut no_stores = device("B", vk::PhysicalDeviceType::DISCRETE_GPU);
        no_stores.vertex_pipeline_stores_and_atomics = false;

        assert_eq!(score_device(&no_aniso, &SWAPCHAIN), 0);
        assert_eq!(score_device(&no_stores, &SWAPCHAIN), 0);

        let err = select_device(&[no_aniso, no_stores], &SWAPCHAIN).unwrap_err();
        match err {
            GpuError::NoSuitableDevice(msg) => assert!(msg.contains("anisotropy")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn no_device_with_extensions_is_called_out() {
        let mut d = device("Only", vk::PhysicalDeviceType::DISCRETE_GPU);
        d.extensions.clear();

        let err = select_device(&[d], &SWAPCHAIN).unwrap_err();
        match err {
            GpuError::NoSuitableDevice(msg) => {
                assert!(msg.contains("required device extensions"));
                assert!(msg.contains("VK_KHR_swapchain"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn empty_list_fails() {
        let err = select_device::<&str>(&[], &[]).unwrap_err();
        assert!(matches!(err, GpuError::NoSuitableDevice(_)));
    }
}
