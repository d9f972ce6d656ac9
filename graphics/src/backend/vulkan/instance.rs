//! Vulkan instance creation and configuration.

use std::ffi::{c_char, CStr, CString};

use ash::vk;
use raw_window_handle::RawDisplayHandle;

use crate::config::ContextParameters;
use crate::error::{GraphicsError, GraphicsResult};

use super::debug;

/// Vulkan API version the context targets. Multiview is core from 1.1.
pub const REQUIRED_API_VERSION: u32 = vk::make_api_version(0, 1, 2, 0);

/// Validation layer name.
pub const VALIDATION_LAYER_NAME: &CStr = c"VK_LAYER_KHRONOS_validation";

/// An instance together with its optional validation messenger.
pub struct InstanceBundle {
    pub instance: ash::Instance,
    pub debug_utils: Option<ash::ext::debug_utils::Instance>,
    pub debug_messenger: Option<vk::DebugUtilsMessengerEXT>,
}

/// Create a Vulkan instance with optional validation layers.
///
/// Fails with [`GraphicsError::ValidationUnavailable`] if validation was requested
/// and the layer is not installed. `display` adds the surface extensions needed to
/// present to that display.
pub fn create_instance(
    entry: &ash::Entry,
    params: &ContextParameters,
    display: Option<RawDisplayHandle>,
) -> GraphicsResult<InstanceBundle> {
    let validation = params.enable_validation;
    if validation && !check_validation_layer_support(entry) {
        log::error!("Validation layers requested but not available");
        return Err(GraphicsError::ValidationUnavailable);
    }

    let app_name = CString::new(params.app_name.as_str())
        .map_err(|e| GraphicsError::InvalidParameter(format!("application name: {e}")))?;

    let app_info = vk::ApplicationInfo::default()
        .application_name(&app_name)
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(c"Lumen")
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(REQUIRED_API_VERSION);

    let mut extensions: Vec<*const c_char> = Vec::new();
    if let Some(display) = display {
        let surface_extensions = ash_window::enumerate_required_extensions(display)
            .map_err(|e| {
                GraphicsError::InitializationFailed(format!(
                    "Failed to query surface extensions: {:?}",
                    e
                ))
            })?;
        extensions.extend_from_slice(surface_extensions);
    }

    if validation {
        extensions.push(ash::ext::debug_utils::NAME.as_ptr());
    }

    #[allow(unused_mut)]
    let mut create_flags = vk::InstanceCreateFlags::empty();

    #[cfg(target_os = "macos")]
    {
        extensions.push(ash::khr::portability_enumeration::NAME.as_ptr());
        create_flags |= vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
    }

    let layer_names: Vec<*const c_char> = if validation {
        vec![VALIDATION_LAYER_NAME.as_ptr()]
    } else {
        vec![]
    };

    let create_info = vk::InstanceCreateInfo::default()
        .flags(create_flags)
        .application_info(&app_info)
        .enabled_extension_names(&extensions)
        .enabled_layer_names(&layer_names);

    let instance = unsafe { entry.create_instance(&create_info, None) }.map_err(|e| {
        GraphicsError::InitializationFailed(format!("Failed to create Vulkan instance: {:?}", e))
    })?;

    let (debug_utils, debug_messenger) = if validation {
        let debug_utils = ash::ext::debug_utils::Instance::new(entry, &instance);
        match debug::create_debug_messenger(&debug_utils) {
            Ok(messenger) => (Some(debug_utils), Some(messenger)),
            Err(e) => {
                unsafe { instance.destroy_instance(None) };
                return Err(e);
            }
        }
    } else {
        (None, None)
    };

    Ok(InstanceBundle {
        instance,
        debug_utils,
        debug_messenger,
    })
}

/// Check if the validation layer is available.
pub fn check_validation_layer_support(entry: &ash::Entry) -> bool {
    let available_layers = match unsafe { entry.enumerate_instance_layer_properties() } {
        Ok(layers) => layers,
        Err(_) => return false,
    };

    available_layers.iter().any(|layer| {
        layer
            .layer_name_as_c_str()
            .is_ok_and(|name| name == VALIDATION_LAYER_NAME)
    })
}
