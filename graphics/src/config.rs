//! Context configuration.
//!
//! [`ContextParameters`] collects everything [`DeviceContext`](crate::DeviceContext)
//! needs to know before it touches the driver.
//!
//! # Example
//!
//! ```ignore
//! let params = ContextParameters::new()
//!     .with_app_name("viewer")
//!     .with_validation(false)
//!     .with_frames_in_flight(3);
//! ```

use std::ffi::{CStr, CString};

/// Environment variable overriding [`ContextParameters::enable_validation`].
pub const VALIDATION_ENV_VAR: &str = "LUMEN_VALIDATION";

/// Upper bound for frames the CPU may record ahead of the GPU.
pub const MAX_FRAMES_IN_FLIGHT: u32 = 3;

/// Parameters for creating a [`DeviceContext`](crate::DeviceContext).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextParameters {
    /// Application name reported to the driver.
    pub app_name: String,
    /// Whether the Khronos validation layer is required.
    pub enable_validation: bool,
    /// Device extensions every candidate GPU must expose.
    pub required_device_extensions: Vec<CString>,
    /// Number of frame-in-flight slots.
    pub frames_in_flight: u32,
    /// Reject integrated and software devices instead of only ranking them lower.
    pub require_discrete_gpu: bool,
}

impl Default for ContextParameters {
    fn default() -> Self {
        Self {
            app_name: "Lumen".to_string(),
            enable_validation: true,
            required_device_extensions: vec![ash::khr::multiview::NAME.to_owned()],
            frames_in_flight: 2,
            require_discrete_gpu: false,
        }
    }
}

impl ContextParameters {
    /// Create parameters with defaults, then apply environment overrides.
    pub fn new() -> Self {
        Self::default().with_env_overrides()
    }

    /// Set the application name.
    pub fn with_app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    /// Enable or disable validation layers.
    pub fn with_validation(mut self, enabled: bool) -> Self {
        self.enable_validation = enabled;
        self
    }

    /// Require an additional device extension.
    pub fn with_device_extension(mut self, name: &CStr) -> Self {
        if !self.required_device_extensions.iter().any(|e| e.as_c_str() == name) {
            self.required_device_extensions.push(name.to_owned());
        }
        self
    }

    /// Set the frame-in-flight count, clamped to `1..=MAX_FRAMES_IN_FLIGHT`.
    pub fn with_frames_in_flight(mut self, count: u32) -> Self {
        self.frames_in_flight = count.clamp(1, MAX_FRAMES_IN_FLIGHT);
        self
    }

    /// Only accept discrete GPUs.
    pub fn with_discrete_gpu_required(mut self, required: bool) -> Self {
        self.require_discrete_gpu = required;
        self
    }

    /// Apply `LUMEN_VALIDATION` if it is set to a recognised value.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(value) = std::env::var(VALIDATION_ENV_VAR) {
            match parse_flag(&value) {
                Some(enabled) => self.enable_validation = enabled,
                None => log::warn!("Ignoring {VALIDATION_ENV_VAR}={value:?}: expected on/off"),
            }
        }
        self
    }

    /// Extensions required when presenting to a window surface.
    pub(crate) fn device_extensions(&self, windowed: bool) -> Vec<CString> {
        let mut extensions = self.required_device_extensions.clone();
        let swapchain = ash::khr::swapchain::NAME;
        if windowed && !extensions.iter().any(|e| e.as_c_str() == swapchain) {
            extensions.push(swapchain.to_owned());
        }
        extensions
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Some(true),
        "0" | "false" | "off" | "no" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_defaults() {
        let params = ContextParameters::default();
        assert!(params.enable_validation);
        assert_eq!(params.frames_in_flight, 2);
        assert!(params
            .required_device_extensions
            .iter()
            .any(|e| e.as_c_str() == ash::khr::multiview::NAME));
    }

    #[rstest]
    #[case(0, 1)]
    #[case(2, 2)]
    #[case(7, MAX_FRAMES_IN_FLIGHT)]
    fn test_frames_in_flight_clamped(#[case] requested: u32, #[case] expected: u32) {
        let params = ContextParameters::default().with_frames_in_flight(requested);
        assert_eq!(params.frames_in_flight, expected);
    }

    #[rstest]
    #[case("1", Some(true))]
    #[case("ON", Some(true))]
    #[case("false", Some(false))]
    #[case(" off ", Some(false))]
    #[case("maybe", None)]
    fn test_parse_flag(#[case] input: &str, #[case] expected: Option<bool>) {
        assert_eq!(parse_flag(input), expected);
    }

    #[test]
    fn test_swapchain_only_when_windowed() {
        let params = ContextParameters::default();
        let swapchain = ash::khr::swapchain::NAME;
        assert!(!params
            .device_extensions(false)
            .iter()
            .any(|e| e.as_c_str() == swapchain));
        assert!(params
            .device_extensions(true)
            .iter()
            .any(|e| e.as_c_str() == swapchain));
    }

    #[test]
    fn test_extension_not_duplicated() {
        let params = ContextParameters::default()
            .with_device_extension(ash::khr::multiview::NAME)
            .with_device_extension(ash::khr::multiview::NAME);
        assert_eq!(params.required_device_extensions.len(), 1);
    }
}
