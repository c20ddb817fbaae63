//! Buffer management over gpu-allocator.

use std::any::Any;
use std::ptr::NonNull;
use std::sync::Arc;

use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use tracing::debug;

use framepipe_hal::{Buffer, BufferDesc, BufferUsage, HalError, HalResult};

use crate::device::DeviceShared;
use crate::vk_err;

fn vk_usage(usage: BufferUsage) -> vk::BufferUsageFlags {
    match usage {
        BufferUsage::Staging => vk::BufferUsageFlags::TRANSFER_SRC,
        BufferUsage::Dynamic => {
            vk::BufferUsageFlags::UNIFORM_BUFFER
                | vk::BufferUsageFlags::STORAGE_BUFFER
                | vk::BufferUsageFlags::TRANSFER_DST
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
        }
        BufferUsage::DeviceLocal => {
            vk::BufferUsageFlags::TRANSFER_DST
                | vk::BufferUsageFlags::VERTEX_BUFFER
                | vk::BufferUsageFlags::INDEX_BUFFER
                | vk::BufferUsageFlags::UNIFORM_BUFFER
                | vk::BufferUsageFlags::STORAGE_BUFFER
        }
    }
}

fn memory_location(usage: BufferUsage) -> MemoryLocation {
    match usage {
        BufferUsage::Staging | BufferUsage::Dynamic => MemoryLocation::CpuToGpu,
        BufferUsage::DeviceLocal => MemoryLocation::GpuOnly,
    }
}

/// Vulkan buffer with gpu-allocator managed memory.
pub struct VulkanBuffer {
    shared: Arc<DeviceShared>,
    buffer: vk::Buffer,
    allocation: Option<Allocation>,
    size: u64,
    usage: BufferUsage,
    device_address: u64,
}

impl VulkanBuffer {
    pub(crate) fn new(shared: Arc<DeviceShared>, desc: &BufferDesc) -> HalResult<Self> {
        if desc.size == 0 {
            return Err(HalError::InvalidHandle(
                "buffer size must be greater than 0".to_string(),
            ));
        }

        let buffer_info = vk::BufferCreateInfo::default()
            .size(desc.size)
            .usage(vk_usage(desc.usage))
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe {
            shared
                .device
                .create_buffer(&buffer_info, None)
                .map_err(vk_err)?
        };
        let requirements = unsafe { shared.device.get_buffer_memory_requirements(buffer) };

        let allocation = {
            let mut allocator = shared.allocator().lock().unwrap();
            let allocator = allocator
                .as_mut()
                .ok_or_else(|| HalError::Backend("allocator already torn down".to_string()))?;
            allocator
                .allocate(&AllocationCreateDesc {
                    name: desc.usage.name(),
                    requirements,
                    location: memory_location(desc.usage),
                    linear: true,
                    allocation_scheme: AllocationScheme::GpuAllocatorManaged,
                })
                .map_err(|e| HalError::Backend(format!("allocation: {e}")))?
        };

        unsafe {
            shared
                .device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
                .map_err(vk_err)?;
        }

        let device_address = if desc.usage == BufferUsage::Dynamic {
            let info = vk::BufferDeviceAddressInfo::default().buffer(buffer);
            unsafe { shared.device.get_buffer_device_address(&info) }
        } else {
            0
        };

        debug!(size = desc.size, usage = desc.usage.name(), "created buffer");

        Ok(Self {
            shared,
            buffer,
            allocation: Some(allocation),
            size: desc.size,
            usage: desc.usage,
            device_address,
        })
    }

    /// Returns the Vulkan buffer handle.
    #[inline]
    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }
}

impl Buffer for VulkanBuffer {
    fn size(&self) -> u64 {
        self.size
    }

    fn usage(&self) -> BufferUsage {
        self.usage
    }

    fn write(&self, offset: u64, data: &[u8]) -> HalResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        let end = offset + data.len() as u64;
        if end > self.size {
            return Err(HalError::InvalidHandle(format!(
                "write exceeds buffer size: offset {} + data {} > buffer {}",
                offset,
                data.len(),
                self.size
            )));
        }
        let mapped = self
            .mapped_ptr()
            .ok_or_else(|| HalError::InvalidHandle("buffer memory is not mapped".to_string()))?;
        unsafe {
            let dst = mapped.as_ptr().add(offset as usize);
            std::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len());
        }
        Ok(())
    }

    fn mapped_ptr(&self) -> Option<NonNull<u8>> {
        self.allocation
            .as_ref()
            .and_then(|allocation| allocation.mapped_ptr())
            .map(|ptr| ptr.cast())
    }

    fn device_address(&self) -> u64 {
        self.device_address
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for VulkanBuffer {
    fn drop(&mut self) {
        // Free the allocation first, then destroy the buffer.
        if let Some(allocation) = self.allocation.take() {
            let mut allocator = self.shared.allocator().lock().unwrap();
            if let Some(allocator) = allocator.as_mut() {
                if let Err(e) = allocator.free(allocation) {
                    tracing::error!("failed to free buffer allocation: {e:?}");
                }
            }
        }
        unsafe {
            self.shared.device.destroy_buffer(self.buffer, None);
        }
    }
}
