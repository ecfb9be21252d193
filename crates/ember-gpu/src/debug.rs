//! Validation layer output routed into `tracing`.

use crate::config::LogVerbosity;
use crate::error::{GpuError, Result};
use ash::vk;
use std::borrow::Cow;
use std::ffi::c_void;
use tracing::Level;

/// Log level a validation message of `severity` is emitted at.
pub fn severity_level(severity: vk::DebugUtilsMessageSeverityFlagsEXT) -> Level {
    use vk::DebugUtilsMessageSeverityFlagsEXT as S;
    if severity.contains(S::ERROR) {
        Level::ERROR
    } else if severity.contains(S::WARNING) {
        Level::WARN
    } else if severity.contains(S::INFO) {
        Level::INFO
    } else {
        Level::DEBUG
    }
}

/// Prefix naming the message categories, e.g. `"(General, Validation) "`.
pub fn message_type_label(types: vk::DebugUtilsMessageTypeFlagsEXT) -> String {
    use vk::DebugUtilsMessageTypeFlagsEXT as T;
    let names: Vec<&str> = [
        (T::GENERAL, "General"),
        (T::VALIDATION, "Validation"),
        (T::PERFORMANCE, "Performance"),
        (T::DEVICE_ADDRESS_BINDING, "Device address binding"),
    ]
    .into_iter()
    .filter(|(flag, _)| types.contains(*flag))
    .map(|(_, name)| name)
    .collect();

    if names.is_empty() {
        String::new()
    } else {
        format!("({}) ", names.join(", "))
    }
}

unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    types: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user_data: *mut c_void,
) -> vk::Bool32 {
    let message = if data.is_null() {
        Cow::Borrowed("(no message)")
    } else {
        match (*data).message_as_c_str() {
            Some(msg) => msg.to_string_lossy(),
            None => Cow::Borrowed("(no message)"),
        }
    };
    let label = message_type_label(types);

    match severity_level(severity) {
        Level::ERROR => tracing::error!(target: "vulkan", "{}{}", label, message),
        Level::WARN => tracing::warn!(target: "vulkan", "{}{}", label, message),
        Level::INFO => tracing::info!(target: "vulkan", "{}{}", label, message),
        _ => tracing::debug!(target: "vulkan", "{}{}", label, message),
    }

    vk::FALSE
}

/// An installed `VK_EXT_debug_utils` messenger.
#[derive(Clone)]
pub struct DebugMessenger {
    loader: ash::ext::debug_utils::Instance,
    messenger: vk::DebugUtilsMessengerEXT,
}

impl DebugMessenger {
    /// Install a messenger subscribed to the severities `verbosity` allows.
    ///
    /// # Safety
    /// The instance must have been created with `VK_EXT_debug_utils` enabled.
    pub unsafe fn new(
        entry: &ash::Entry,
        instance: &ash::Instance,
        verbosity: LogVerbosity,
    ) -> Result<Self> {
        let create_fn =
            entry.get_instance_proc_addr(instance.handle(), c"vkCreateDebugUtilsMessengerEXT".as_ptr());
        if create_fn.is_none() {
            return Err(GpuError::DebugHookUnavailable(
                "vkCreateDebugUtilsMessengerEXT is not exported by the loader".to_string(),
            ));
        }

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
            .message_severity(verbosity.severity_mask())
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let loader = ash::ext::debug_utils::Instance::new(entry, instance);
        let messenger = loader
            .create_debug_utils_messenger(&create_info, None)
            .map_err(|e| GpuError::DebugHookUnavailable(e.to_string()))?;

        tracing::debug!("Installed debug messenger at {:?} verbosity", verbosity);
        Ok(Self { loader, messenger })
    }

    /// # Safety
    /// Must run before the instance is destroyed.
    pub unsafe fn destroy(&self) {
        self.loader
            .destroy_debug_utils_messenger(self.messenger, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vk::DebugUtilsMessageSeverityFlagsEXT as S;
    use vk::DebugUtilsMessageTypeFlagsEXT as T;

    #[test]
    fn severities_map_to_distinct_levels() {
        assert_eq!(severity_level(S::ERROR), Level::ERROR);
        assert_eq!(severity_level(S::WARNING), Level::WARN);
        assert_eq!(severity_level(S::INFO), Level::INFO);
        assert_eq!(severity_level(S::VERBOSE), Level::DEBUG);
    }

    #[test]
    fn type_label_lists_every_category() {
        assert_eq!(message_type_label(T::GENERAL | T::VALIDATION), "(General, Validation) ");
        assert_eq!(message_type_label(T::PERFORMANCE), "(Performance) ");
        assert_eq!(message_type_label(T::empty()), "");
    }

    #[test]
    fn callback_tolerates_null_data() {
        let result = unsafe {
            debug_callback(S::WARNING, T::VALIDATION, std::ptr::null(), std::ptr::null_mut())
        };
        assert_eq!(result, vk::FALSE);
    }
}
