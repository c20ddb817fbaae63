//! Headless Vulkan backend for the framepipe hal.
//!
//! Built on `ash` with gpu-allocator managed memory. Completion tracking
//! uses Vulkan 1.2 timeline semaphores: the queue signals the timeline
//! value inside each submission, host waits go through
//! `vkWaitSemaphores`, and the exhaustion reset path recreates the
//! semaphore at its new base value.
//!
//! The backend is presentation-free: swapchain integration stays at the
//! collaborator boundary, and pipelines built over this device run
//! headless (uploads, compute-style frame loops).

mod buffer;
mod command;
mod device;
mod instance;
mod queue;
mod timeline;

pub use buffer::VulkanBuffer;
pub use command::VulkanCommandBuffer;
pub use device::{VulkanDevice, VulkanDeviceOptions};
pub use instance::VulkanInstance;
pub use queue::VulkanQueue;
pub use timeline::VulkanTimelineFence;

use framepipe_hal::HalError;

pub(crate) fn vk_err(result: ash::vk::Result) -> HalError {
    HalError::Backend(format!("{result}"))
}
