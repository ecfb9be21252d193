//! Session configuration.
//!
//! Everything here is resolved once before a [`Session`](crate::Session) is
//! built and frozen for the session's lifetime.

use ash::vk;
use serde::{Deserialize, Serialize};

use crate::error::{GpuError, Result};

/// Default number of frames the CPU may record ahead of the GPU.
pub const DEFAULT_MAX_FRAMES_IN_FLIGHT: usize = 2;

/// Khronos validation layer, enabled by default in debug builds.
pub const KHRONOS_VALIDATION_LAYER: &str = "VK_LAYER_KHRONOS_validation";

/// How much of the validation layer output is routed into the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogVerbosity {
    /// No debug messenger is installed.
    Off,
    /// Errors only.
    Error,
    /// Errors and warnings.
    #[default]
    Warning,
    /// Errors, warnings and informational messages.
    Info,
    /// Everything the layers emit.
    Verbose,
}

impl LogVerbosity {
    /// Map a numeric threshold (0 = off, 4 = verbose) to a verbosity.
    ///
    /// Values above 4 saturate to [`LogVerbosity::Verbose`].
    pub fn from_level(level: u8) -> Self {
        match level {
            0 => Self::Off,
            1 => Self::Error,
            2 => Self::Warning,
            3 => Self::Info,
            _ => Self::Verbose,
        }
    }

    /// Message severities the debug messenger should subscribe to.
    pub fn severity_mask(self) -> vk::DebugUtilsMessageSeverityFlagsEXT {
        use vk::DebugUtilsMessageSeverityFlagsEXT as S;
        match self {
            Self::Off => S::empty(),
            Self::Error => S::ERROR,
            Self::Warning => S::ERROR | S::WARNING,
            Self::Info => S::ERROR | S::WARNING | S::INFO,
            Self::Verbose => S::ERROR | S::WARNING | S::INFO | S::VERBOSE,
        }
    }
}

/// Application version triple reported to the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl AppVersion {
    /// Packed Vulkan version number.
    pub fn to_vk(self) -> u32 {
        vk::make_api_version(0, self.major, self.minor, self.patch)
    }
}

impl Default for AppVersion {
    fn default() -> Self {
        Self {
            major: 0,
            minor: 1,
            patch: 0,
        }
    }
}

/// Immutable configuration passed into session construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Application name reported to the driver.
    pub app_name: String,
    /// Application version reported to the driver.
    pub app_version: AppVersion,
    /// Size of the in-flight frame ring.
    pub max_frames_in_flight: usize,
    /// Instance extensions required on top of the windowing-system ones.
    pub instance_extensions: Vec<String>,
    /// Device extensions required on top of `VK_KHR_swapchain`.
    pub device_extensions: Vec<String>,
    /// Validation layers to activate when supported.
    pub validation_layers: Vec<String>,
    /// Debug-callback routing threshold.
    pub log_verbosity: LogVerbosity,
}

impl Default for ContextConfig {
    fn default() -> Self {
        let validation_layers = if cfg!(debug_assertions) {
            vec![KHRONOS_VALIDATION_LAYER.to_string()]
        } else {
            Vec::new()
        };

        Self {
            app_name: "Ember".to_string(),
            app_version: AppVersion::default(),
            max_frames_in_flight: DEFAULT_MAX_FRAMES_IN_FLIGHT,
            instance_extensions: Vec::new(),
            device_extensions: Vec::new(),
            validation_layers,
            log_verbosity: LogVerbosity::default(),
        }
    }
}

impl ContextConfig {
    /// Create a new config with the given application name.
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            ..Default::default()
        }
    }

    /// Parse a config from TOML. Missing keys keep their defaults.
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(source).map_err(|e| GpuError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Set the application version.
    pub fn with_app_version(mut self, major: u32, minor: u32, patch: u32) -> Self {
        self.app_version = AppVersion {
            major,
            minor,
            patch,
        };
        self
    }

    /// Set the number of frames in flight.
    pub fn with_max_frames_in_flight(mut self, frames: usize) -> Self {
        self.max_frames_in_flight = frames;
        self
    }

    /// Require an additional instance extension.
    pub fn with_instance_extension(mut self, name: impl Into<String>) -> Self {
        self.instance_extensions.push(name.into());
        self
    }

    /// Require an additional device extension.
    pub fn with_device_extension(mut self, name: impl Into<String>) -> Self {
        self.device_extensions.push(name.into());
        self
    }

    /// Replace the list of validation layers.
    pub fn with_validation_layers<I, S>(mut self, layers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.validation_layers = layers.into_iter().map(Into::into).collect();
        self
    }

    /// Set the debug-callback verbosity.
    pub fn with_log_verbosity(mut self, verbosity: LogVerbosity) -> Self {
        self.log_verbosity = verbosity;
        self
    }

    /// Reject values no session can be built from.
    pub fn validate(&self) -> Result<()> {
        if self.max_frames_in_flight == 0 {
            return Err(GpuError::InvalidConfig(
                "max_frames_in_flight must be at least 1".to_string(),
            ));
        }
        if self.app_name.contains('\0') {
            return Err(GpuError::InvalidConfig(
                "app_name must not contain NUL bytes".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ContextConfig::default();
        assert_eq!(config.max_frames_in_flight, 2);
        assert!(config.device_extensions.is_empty());
        assert_eq!(config.log_verbosity, LogVerbosity::Warning);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_frames_in_flight_is_rejected() {
        let config = ContextConfig::new("test").with_max_frames_in_flight(0);
        assert!(matches!(config.validate(), Err(GpuError::InvalidConfig(_))));
    }

    #[test]
    fn toml_overrides_only_given_keys() {
        let config = ContextConfig::from_toml_str(
            r#"
            app_name = "demo"
            max_frames_in_flight = 3
            device_extensions = ["VK_KHR_ray_tracing_pipeline"]
            log_verbosity = "verbose"
            "#,
        )
        .unwrap();

        assert_eq!(config.app_name, "demo");
        assert_eq!(config.max_frames_in_flight, 3);
        assert_eq!(config.device_extensions, vec!["VK_KHR_ray_tracing_pipeline"]);
        assert_eq!(config.log_verbosity, LogVerbosity::Verbose);
        assert_eq!(config.app_version, AppVersion::default());
    }

    #[test]
    fn toml_with_zero_frames_fails() {
        let result = ContextConfig::from_toml_str("max_frames_in_flight = 0");
        assert!(matches!(result, Err(GpuError::InvalidConfig(_))));
    }

    #[test]
    fn verbosity_levels_widen_the_mask() {
        use vk::DebugUtilsMessageSeverityFlagsEXT as S;
        assert!(LogVerbosity::from_level(0).severity_mask().is_empty());
        assert_eq!(LogVerbosity::from_level(1).severity_mask(), S::ERROR);
        assert!(LogVerbosity::from_level(3).severity_mask().contains(S::INFO));
        assert!(!LogVerbosity::from_level(3).severity_mask().contains(S::VERBOSE));
        assert_eq!(LogVerbosity::from_level(9), LogVerbosity::Verbose);
    }
}
