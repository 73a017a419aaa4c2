//! Shared helpers for GPU-backed unit tests

use crate::config::ContextConfig;
use crate::context::DeviceContext;

/// Headless context, or `None` when no Vulkan loader or device is present
pub(crate) fn headless() -> Option<DeviceContext> {
    crate::logging::init_for_tests();
    match DeviceContext::headless(&ContextConfig::new("vk_frame tests")) {
        Ok(context) => Some(context),
        Err(e) => {
            log::warn!("Skipping GPU test, no Vulkan device: {}", e);
            None
        }
    }
}
