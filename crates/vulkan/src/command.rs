//! Command pool and command buffer management.

use std::any::Any;
use std::sync::Arc;

use ash::vk;

use framepipe_hal::{Buffer, CommandBuffer, HalError, HalResult};

use crate::buffer::VulkanBuffer;
use crate::device::DeviceShared;
use crate::vk_err;

/// Command buffer with a private resettable pool.
///
/// One pool per command buffer keeps every buffer independently
/// resettable from whichever thread owns it, without sharing pool state.
pub struct VulkanCommandBuffer {
    shared: Arc<DeviceShared>,
    pool: vk::CommandPool,
    buffer: vk::CommandBuffer,
}

impl VulkanCommandBuffer {
    pub(crate) fn new(shared: Arc<DeviceShared>) -> HalResult<Self> {
        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(shared.queue_family_index)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let pool = unsafe {
            shared
                .device
                .create_command_pool(&pool_info, None)
                .map_err(vk_err)?
        };

        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffers = unsafe {
            shared
                .device
                .allocate_command_buffers(&alloc_info)
                .map_err(vk_err)?
        };

        Ok(Self {
            shared,
            pool,
            buffer: buffers[0],
        })
    }

    /// Returns the Vulkan command buffer handle.
    #[inline]
    pub fn handle(&self) -> vk::CommandBuffer {
        self.buffer
    }
}

fn vulkan_buffer(buffer: &dyn Buffer) -> HalResult<&VulkanBuffer> {
    buffer
        .as_any()
        .downcast_ref::<VulkanBuffer>()
        .ok_or_else(|| HalError::InvalidHandle("buffer does not belong to this device".to_string()))
}

impl CommandBuffer for VulkanCommandBuffer {
    fn reset(&mut self) -> HalResult<()> {
        unsafe {
            self.shared
                .device
                .reset_command_buffer(self.buffer, vk::CommandBufferResetFlags::empty())
                .map_err(vk_err)
        }
    }

    fn begin(&mut self) -> HalResult<()> {
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            self.shared
                .device
                .begin_command_buffer(self.buffer, &begin_info)
                .map_err(vk_err)
        }
    }

    fn end(&mut self) -> HalResult<()> {
        unsafe {
            self.shared
                .device
                .end_command_buffer(self.buffer)
                .map_err(vk_err)
        }
    }

    fn copy_buffer(
        &mut self,
        src: &dyn Buffer,
        src_offset: u64,
        dst: &dyn Buffer,
        dst_offset: u64,
        size: u64,
    ) -> HalResult<()> {
        if src_offset + size > src.size() || dst_offset + size > dst.size() {
            return Err(HalError::InvalidHandle(format!(
                "copy of {} bytes out of bounds (src {} @ {}, dst {} @ {})",
                size,
                src.size(),
                src_offset,
                dst.size(),
                dst_offset
            )));
        }
        let src = vulkan_buffer(src)?;
        let dst = vulkan_buffer(dst)?;
        let region = vk::BufferCopy::default()
            .src_offset(src_offset)
            .dst_offset(dst_offset)
            .size(size);
        unsafe {
            self.shared
                .device
                .cmd_copy_buffer(self.buffer, src.handle(), dst.handle(), &[region]);
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for VulkanCommandBuffer {
    fn drop(&mut self) {
        unsafe {
            // Destroying the pool frees the buffer allocated from it.
            self.shared.device.destroy_command_pool(self.pool, None);
        }
    }
}
