//! Logical device creation, adapter selection, and queue setup.

use std::sync::{Arc, Mutex};

use ash::vk;
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use tracing::{debug, info};

use framepipe_hal::{
    Buffer, BufferDesc, CommandBuffer, Device, Fence, HalError, HalResult, Queue,
};

use crate::buffer::VulkanBuffer;
use crate::command::VulkanCommandBuffer;
use crate::instance::VulkanInstance;
use crate::queue::VulkanQueue;
use crate::timeline::VulkanTimelineFence;
use crate::vk_err;

/// Options for [`VulkanDevice::new`].
#[derive(Clone, Debug)]
pub struct VulkanDeviceOptions {
    /// Application name reported to the driver.
    pub app_name: String,
    /// Request the Khronos validation layer if present.
    pub enable_validation: bool,
}

impl Default for VulkanDeviceOptions {
    fn default() -> Self {
        Self {
            app_name: "framepipe".to_string(),
            enable_validation: cfg!(debug_assertions),
        }
    }
}

/// State shared by every object created from the device.
///
/// Field order matters for teardown: the explicit `Drop` releases the
/// allocator and logical device before the instance field drops.
pub(crate) struct DeviceShared {
    pub(crate) device: ash::Device,
    pub(crate) physical_device: vk::PhysicalDevice,
    pub(crate) queue_family_index: u32,
    pub(crate) allocator: Mutex<Option<Allocator>>,
    instance: VulkanInstance,
}

impl DeviceShared {
    pub(crate) fn allocator(&self) -> &Mutex<Option<Allocator>> {
        &self.allocator
    }
}

impl Drop for DeviceShared {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
        }
        // The allocator owns device memory; it must go before the device.
        drop(self.allocator.lock().unwrap().take());
        unsafe {
            self.device.destroy_device(None);
        }
        debug!("destroyed Vulkan device");
    }
}

/// Headless Vulkan execution device.
///
/// Implements the hal device over one queue with timeline-semaphore
/// completion tracking. Presentation is out of scope for this backend;
/// surface integration happens at the collaborator boundary.
pub struct VulkanDevice {
    shared: Arc<DeviceShared>,
    queue: Arc<VulkanQueue>,
}

impl VulkanDevice {
    /// Creates the instance, selects an adapter, and builds the logical
    /// device with timeline semaphores and buffer device addressing.
    ///
    /// # Errors
    ///
    /// Returns [`HalError::NoAdapter`] if no Vulkan 1.2 adapter with a
    /// graphics-capable queue family exists, or a backend error if any
    /// creation call fails.
    pub fn new(options: VulkanDeviceOptions) -> HalResult<Self> {
        let instance = VulkanInstance::new(&options.app_name, options.enable_validation)?;
        let (physical_device, queue_family_index) = select_adapter(instance.handle())?;

        let queue_priorities = [1.0f32];
        let queue_infos = [vk::DeviceQueueCreateInfo::default()
            .queue_family_index(queue_family_index)
            .queue_priorities(&queue_priorities)];

        let mut features12 = vk::PhysicalDeviceVulkan12Features::default()
            .timeline_semaphore(true)
            .buffer_device_address(true);
        let device_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_infos)
            .push_next(&mut features12);

        let device = unsafe {
            instance
                .handle()
                .create_device(physical_device, &device_info, None)
                .map_err(vk_err)?
        };

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.handle().clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: true,
            allocation_sizes: Default::default(),
        })
        .map_err(|e| HalError::Backend(format!("allocator: {e}")))?;

        let raw_queue = unsafe { device.get_device_queue(queue_family_index, 0) };

        let shared = Arc::new(DeviceShared {
            device,
            physical_device,
            queue_family_index,
            allocator: Mutex::new(Some(allocator)),
            instance,
        });

        let fence = Arc::new(VulkanTimelineFence::new(shared.clone(), 0)?);
        let queue = Arc::new(VulkanQueue::new(shared.clone(), raw_queue, fence));

        info!(queue_family_index, "Vulkan device created");
        Ok(Self { shared, queue })
    }

    /// The selected physical device.
    #[inline]
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.shared.physical_device
    }

    /// The queue family submissions run on.
    #[inline]
    pub fn queue_family_index(&self) -> u32 {
        self.shared.queue_family_index
    }
}

impl Device for VulkanDevice {
    fn create_fence(&self, initial_value: u64) -> HalResult<Arc<dyn Fence>> {
        Ok(Arc::new(VulkanTimelineFence::new(
            self.shared.clone(),
            initial_value,
        )?))
    }

    fn create_command_buffer(&self) -> HalResult<Box<dyn CommandBuffer>> {
        Ok(Box::new(VulkanCommandBuffer::new(self.shared.clone())?))
    }

    fn create_buffer(&self, desc: &BufferDesc) -> HalResult<Box<dyn Buffer>> {
        Ok(Box::new(VulkanBuffer::new(self.shared.clone(), desc)?))
    }

    fn queue(&self) -> Arc<dyn Queue> {
        self.queue.clone()
    }

    fn wait_idle(&self) -> HalResult<()> {
        unsafe { self.shared.device.device_wait_idle().map_err(vk_err) }
    }
}

/// Picks the best adapter exposing Vulkan 1.2 and a graphics queue,
/// preferring discrete GPUs.
fn select_adapter(instance: &ash::Instance) -> HalResult<(vk::PhysicalDevice, u32)> {
    let adapters = unsafe { instance.enumerate_physical_devices().map_err(vk_err)? };

    let mut best: Option<(vk::PhysicalDevice, u32, u32)> = None;
    for adapter in adapters {
        let properties = unsafe { instance.get_physical_device_properties(adapter) };
        if properties.api_version < vk::API_VERSION_1_2 {
            continue;
        }
        let Some(family) = graphics_family(instance, adapter) else {
            continue;
        };

        let score = match properties.device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => 100,
            vk::PhysicalDeviceType::INTEGRATED_GPU => 50,
            vk::PhysicalDeviceType::VIRTUAL_GPU => 25,
            _ => 10,
        };
        if best.map_or(true, |(_, _, best_score)| score > best_score) {
            best = Some((adapter, family, score));
        }
    }

    best.map(|(adapter, family, _)| (adapter, family))
        .ok_or(HalError::NoAdapter)
}

fn graphics_family(instance: &ash::Instance, adapter: vk::PhysicalDevice) -> Option<u32> {
    let families = unsafe { instance.get_physical_device_queue_family_properties(adapter) };
    families
        .iter()
        .position(|family| family.queue_flags.contains(vk::QueueFlags::GRAPHICS))
        .map(|index| index as u32)
}
