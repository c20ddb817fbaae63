//! Vulkan instance creation.

use std::ffi::CString;

use ash::vk;
use tracing::{info, warn};

use framepipe_hal::{HalError, HalResult};

use crate::vk_err;

const VALIDATION_LAYER: &std::ffi::CStr = c"VK_LAYER_KHRONOS_validation";

/// Vulkan entry point and instance.
///
/// The backend is headless: no surface extensions are requested.
pub struct VulkanInstance {
    entry: ash::Entry,
    instance: ash::Instance,
}

impl VulkanInstance {
    /// Loads the Vulkan library and creates an instance targeting
    /// Vulkan 1.2 (required for timeline semaphores).
    pub fn new(app_name: &str, enable_validation: bool) -> HalResult<Self> {
        let entry = unsafe {
            ash::Entry::load().map_err(|e| HalError::Backend(format!("loading Vulkan: {e}")))?
        };

        let app_name = CString::new(app_name)
            .map_err(|_| HalError::Backend("application name contains NUL".to_string()))?;
        let app_info = vk::ApplicationInfo::default()
            .application_name(&app_name)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(c"framepipe")
            .api_version(vk::API_VERSION_1_2);

        let mut layers: Vec<*const std::ffi::c_char> = Vec::new();
        if enable_validation {
            if Self::validation_available(&entry) {
                layers.push(VALIDATION_LAYER.as_ptr());
            } else {
                warn!("validation layer requested but not available");
            }
        }

        let create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_layer_names(&layers);

        let instance = unsafe { entry.create_instance(&create_info, None).map_err(vk_err)? };
        info!(validation = !layers.is_empty(), "Vulkan instance created");

        Ok(Self { entry, instance })
    }

    fn validation_available(entry: &ash::Entry) -> bool {
        let Ok(layers) = (unsafe { entry.enumerate_instance_layer_properties() }) else {
            return false;
        };
        layers.iter().any(|layer| {
            layer
                .layer_name_as_c_str()
                .is_ok_and(|name| name == VALIDATION_LAYER)
        })
    }

    /// Returns the ash instance handle.
    #[inline]
    pub fn handle(&self) -> &ash::Instance {
        &self.instance
    }

    /// Returns the loaded Vulkan entry point.
    #[inline]
    pub fn entry(&self) -> &ash::Entry {
        &self.entry
    }
}

impl Drop for VulkanInstance {
    fn drop(&mut self) {
        unsafe {
            self.instance.destroy_instance(None);
        }
    }
}
