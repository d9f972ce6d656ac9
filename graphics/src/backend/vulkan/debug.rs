//! Vulkan validation layer debug messenger.

use std::ffi::CStr;

use ash::vk;

use crate::error::{GraphicsError, GraphicsResult};

/// Create a debug messenger routing validation output into `log`.
pub fn create_debug_messenger(
    debug_utils: &ash::ext::debug_utils::Instance,
) -> GraphicsResult<vk::DebugUtilsMessengerEXT> {
    let create_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
        .message_severity(
            vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                | vk::DebugUtilsMessageSeverityFlagsEXT::INFO,
        )
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(debug_callback));

    let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }
        .map_err(|e| {
            GraphicsError::InitializationFailed(format!(
                "Failed to create debug messenger: {:?}",
                e
            ))
        })?;

    Ok(messenger)
}

/// Validation-layer callback. Every message is forwarded to `log`.
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    // SAFETY: This function is only called by the Vulkan driver with valid data
    let message = if callback_data.is_null() {
        String::from("(no message)")
    } else {
        // SAFETY: callback_data is guaranteed to be valid by the Vulkan driver
        let data = unsafe { *callback_data };
        if data.p_message.is_null() {
            String::from("(null message)")
        } else {
            // SAFETY: p_message is a valid null-terminated string from the Vulkan driver
            unsafe { CStr::from_ptr(data.p_message) }
                .to_string_lossy()
                .into_owned()
        }
    };

    log::log!(
        target: "lumen::vulkan",
        severity_level(message_severity),
        "[{}] {}",
        message_type_name(message_type),
        message
    );

    vk::FALSE
}

fn severity_level(severity: vk::DebugUtilsMessageSeverityFlagsEXT) -> log::Level {
    match severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => log::Level::Error,
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => log::Level::Warn,
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => log::Level::Info,
        vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE => log::Level::Debug,
        _ => log::Level::Trace,
    }
}

fn message_type_name(message_type: vk::DebugUtilsMessageTypeFlagsEXT) -> &'static str {
    match message_type {
        vk::DebugUtilsMessageTypeFlagsEXT::GENERAL => "General",
        vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION => "Validation",
        vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE => "Performance",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR, log::Level::Error)]
    #[case(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING, log::Level::Warn)]
    #[case(vk::DebugUtilsMessageSeverityFlagsEXT::INFO, log::Level::Info)]
    #[case(vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE, log::Level::Debug)]
    fn test_severity_level(
        #[case] severity: vk::DebugUtilsMessageSeverityFlagsEXT,
        #[case] expected: log::Level,
    ) {
        assert_eq!(severity_level(severity), expected);
    }
}
