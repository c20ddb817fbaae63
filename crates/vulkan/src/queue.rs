//! Submission queue with in-submit timeline signaling.

use std::sync::{Arc, Mutex};

use ash::vk;

use framepipe_hal::{CommandBuffer, Fence, HalError, HalResult, Queue};

use crate::command::VulkanCommandBuffer;
use crate::device::DeviceShared;
use crate::timeline::VulkanTimelineFence;
use crate::vk_err;

/// Serial Vulkan queue.
///
/// Every submission signals the queue's timeline semaphore to the
/// caller-provided value as part of the same `vkQueueSubmit`, so the
/// fence counter is a watermark over submission order.
pub struct VulkanQueue {
    shared: Arc<DeviceShared>,
    queue: vk::Queue,
    fence: Arc<VulkanTimelineFence>,
    /// vkQueueSubmit requires external synchronization on the queue.
    submit_lock: Mutex<()>,
}

impl VulkanQueue {
    pub(crate) fn new(
        shared: Arc<DeviceShared>,
        queue: vk::Queue,
        fence: Arc<VulkanTimelineFence>,
    ) -> Self {
        Self {
            shared,
            queue,
            fence,
            submit_lock: Mutex::new(()),
        }
    }
}

impl Queue for VulkanQueue {
    fn submit(&self, cmd: &mut dyn CommandBuffer, signal_value: u64) -> HalResult<()> {
        let cmd = cmd
            .as_any()
            .downcast_ref::<VulkanCommandBuffer>()
            .ok_or_else(|| {
                HalError::InvalidHandle("command buffer does not belong to this device".to_string())
            })?;

        let command_buffers = [cmd.handle()];
        let signal_semaphores = [self.fence.handle()];
        let signal_values = [signal_value];
        let mut timeline_info =
            vk::TimelineSemaphoreSubmitInfo::default().signal_semaphore_values(&signal_values);
        let submit_info = vk::SubmitInfo::default()
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores)
            .push_next(&mut timeline_info);

        let _guard = self.submit_lock.lock().unwrap();
        unsafe {
            self.shared
                .device
                .queue_submit(self.queue, &[submit_info], vk::Fence::null())
                .map_err(vk_err)
        }
    }

    fn fence(&self) -> Arc<dyn Fence> {
        self.fence.clone()
    }
}
