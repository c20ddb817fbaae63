//! Timeline-semaphore completion fence.

use std::sync::{Arc, RwLock};

use ash::vk;
use tracing::debug;

use framepipe_hal::{Fence, HalError, HalResult};

use crate::device::DeviceShared;
use crate::vk_err;

/// Completion fence backed by a Vulkan timeline semaphore.
///
/// Timeline values can only increase for a given semaphore, so
/// [`Fence::reset`] destroys the semaphore and recreates it at the new
/// initial value. The handle lock is held for the duration of blocking
/// waits, which delays a concurrent reset until the waiters are done —
/// resets are only legal on a drained timeline anyway.
pub struct VulkanTimelineFence {
    shared: Arc<DeviceShared>,
    semaphore: RwLock<vk::Semaphore>,
}

impl VulkanTimelineFence {
    pub(crate) fn new(shared: Arc<DeviceShared>, initial_value: u64) -> HalResult<Self> {
        let semaphore = create_timeline_semaphore(&shared, initial_value)?;
        Ok(Self {
            shared,
            semaphore: RwLock::new(semaphore),
        })
    }

    /// Current semaphore handle, for submission.
    pub(crate) fn handle(&self) -> vk::Semaphore {
        *self.semaphore.read().unwrap()
    }
}

fn create_timeline_semaphore(
    shared: &DeviceShared,
    initial_value: u64,
) -> HalResult<vk::Semaphore> {
    let mut type_info = vk::SemaphoreTypeCreateInfo::default()
        .semaphore_type(vk::SemaphoreType::TIMELINE)
        .initial_value(initial_value);
    let create_info = vk::SemaphoreCreateInfo::default().push_next(&mut type_info);

    let semaphore = unsafe {
        shared
            .device
            .create_semaphore(&create_info, None)
            .map_err(|e| HalError::SyncInit(format!("timeline semaphore: {e}")))?
    };
    debug!(initial_value, "created timeline semaphore");
    Ok(semaphore)
}

impl Fence for VulkanTimelineFence {
    fn completed(&self) -> HalResult<u64> {
        let semaphore = self.semaphore.read().unwrap();
        unsafe {
            self.shared
                .device
                .get_semaphore_counter_value(*semaphore)
                .map_err(vk_err)
        }
    }

    fn wait(&self, value: u64) -> HalResult<()> {
        let semaphore = self.semaphore.read().unwrap();
        let semaphores = [*semaphore];
        let values = [value];
        let wait_info = vk::SemaphoreWaitInfo::default()
            .semaphores(&semaphores)
            .values(&values);
        let result = unsafe { self.shared.device.wait_semaphores(&wait_info, u64::MAX) };
        match result {
            Ok(()) => Ok(()),
            Err(vk::Result::TIMEOUT) => Err(HalError::SyncTimeout(format!(
                "timeline wait for {value} reported timeout"
            ))),
            Err(e) => Err(vk_err(e)),
        }
    }

    fn signal(&self, value: u64) -> HalResult<()> {
        let semaphore = self.semaphore.read().unwrap();
        let signal_info = vk::SemaphoreSignalInfo::default()
            .semaphore(*semaphore)
            .value(value);
        unsafe { self.shared.device.signal_semaphore(&signal_info).map_err(vk_err) }
    }

    fn reset(&self, value: u64) -> HalResult<()> {
        let mut semaphore = self.semaphore.write().unwrap();
        unsafe {
            self.shared.device.destroy_semaphore(*semaphore, None);
        }
        *semaphore = create_timeline_semaphore(&self.shared, value)?;
        debug!(value, "reset timeline semaphore");
        Ok(())
    }
}

impl Drop for VulkanTimelineFence {
    fn drop(&mut self) {
        let semaphore = *self.semaphore.read().unwrap();
        unsafe {
            self.shared.device.destroy_semaphore(semaphore, None);
        }
    }
}
