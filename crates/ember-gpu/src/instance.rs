//! Vulkan instance creation.

use crate::capabilities::{available_layer_names, filter_supported_layers};
use crate::config::ContextConfig;
use crate::error::{GpuError, Result};
use ash::vk;
use std::ffi::{c_char, CString};

const ENGINE_NAME: &str = "Ember";

/// Merge windowing, configured and debug extensions without duplicates.
///
/// Order is windowing first, then configured, then debug-utils.
pub fn merge_instance_extensions(
    window_extensions: &[String],
    configured: &[String],
    debug_utils: bool,
) -> Vec<String> {
    let debug = debug_utils.then(|| debug_utils_extension_name());

    let mut merged: Vec<String> = Vec::new();
    for name in window_extensions.iter().chain(configured).cloned().chain(debug) {
        if !merged.contains(&name) {
            merged.push(name);
        }
    }

    // Required for MoltenVK on macOS
    #[cfg(target_os = "macos")]
    {
        let portability = ash::khr::portability_enumeration::NAME
            .to_string_lossy()
            .into_owned();
        if !merged.contains(&portability) {
            merged.push(portability);
        }
    }

    merged
}

fn debug_utils_extension_name() -> String {
    ash::ext::debug_utils::NAME.to_string_lossy().into_owned()
}

pub(crate) fn to_cstrings(names: &[String]) -> Result<Vec<CString>> {
    names
        .iter()
        .map(|name| {
            CString::new(name.as_str())
                .map_err(|_| GpuError::InvalidConfig(format!("name contains a NUL byte: {name:?}")))
        })
        .collect()
}

/// A created instance and the layers actually activated on it.
pub struct InstanceBundle {
    pub instance: ash::Instance,
    pub active_layers: Vec<String>,
}

/// Create a Vulkan instance.
///
/// Unsupported validation layers are dropped with a warning. The debug-utils
/// extension is enabled only when at least one layer remains active.
///
/// # Safety
/// The entry must be a valid Vulkan entry point.
pub unsafe fn create_instance(
    entry: &ash::Entry,
    config: &ContextConfig,
    window_extensions: &[String],
) -> Result<InstanceBundle> {
    let app_name = CString::new(config.app_name.as_str())
        .map_err(|_| GpuError::InvalidConfig("app_name must not contain NUL bytes".to_string()))?;
    let engine_name = CString::new(ENGINE_NAME)
        .map_err(|_| GpuError::InvalidState("engine name contains a NUL byte".to_string()))?;

    let app_info = vk::ApplicationInfo::default()
        .application_name(&app_name)
        .application_version(config.app_version.to_vk())
        .engine_name(&engine_name)
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(vk::API_VERSION_1_3);

    let available = available_layer_names(entry)?;
    let active_layers = filter_supported_layers(&config.validation_layers, &available);

    let extensions = merge_instance_extensions(
        window_extensions,
        &config.instance_extensions,
        !active_layers.is_empty(),
    );

    let extension_cstrings = to_cstrings(&extensions)?;
    let layer_cstrings = to_cstrings(&active_layers)?;
    let extension_names: Vec<*const c_char> = extension_cstrings.iter().map(|s| s.as_ptr()).collect();
    let layer_names: Vec<*const c_char> = layer_cstrings.iter().map(|s| s.as_ptr()).collect();

    #[cfg(target_os = "macos")]
    let create_flags = vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
    #[cfg(not(target_os = "macos"))]
    let create_flags = vk::InstanceCreateFlags::empty();

    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(&extension_names)
        .enabled_layer_names(&layer_names)
        .flags(create_flags);

    let instance = entry.create_instance(&create_info, None)?;

    tracing::debug!(
        "Created instance with extensions {:?} and layers {:?}",
        extensions,
        active_layers
    );

    Ok(InstanceBundle {
        instance,
        active_layers,
    })
}
