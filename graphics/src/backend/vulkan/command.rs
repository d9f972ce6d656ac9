//! Vulkan command pool and one-shot command buffers.

use std::time::Duration;

use ash::vk;

use crate::error::{GraphicsError, GraphicsResult};

/// Create the context's general-purpose command pool.
///
/// Buffers from this pool are short lived and individually resettable.
pub fn create_command_pool(
    device: &ash::Device,
    queue_family_index: u32,
) -> GraphicsResult<vk::CommandPool> {
    let pool_info = vk::CommandPoolCreateInfo::default()
        .queue_family_index(queue_family_index)
        .flags(
            vk::CommandPoolCreateFlags::TRANSIENT
                | vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
        );

    let pool = unsafe { device.create_command_pool(&pool_info, None) }.map_err(|e| {
        GraphicsError::InitializationFailed(format!("Failed to create command pool: {:?}", e))
    })?;

    Ok(pool)
}

/// Allocate `count` primary command buffers.
pub fn allocate_command_buffers(
    device: &ash::Device,
    pool: vk::CommandPool,
    count: u32,
) -> GraphicsResult<Vec<vk::CommandBuffer>> {
    let alloc_info = vk::CommandBufferAllocateInfo::default()
        .command_pool(pool)
        .level(vk::CommandBufferLevel::PRIMARY)
        .command_buffer_count(count);
    Ok(unsafe { device.allocate_command_buffers(&alloc_info) }?)
}

/// A transient command buffer that is recorded, submitted once and waited on.
///
/// Each one-shot owns a small pool on its queue family, so recording needs no
/// lock and may nest inside another one-shot's recording. The pool, its
/// buffer and the fence are released when the value is dropped, whether or
/// not it was ever submitted.
pub struct OneShotCommands<'a> {
    device: &'a ash::Device,
    pool: vk::CommandPool,
    buffer: vk::CommandBuffer,
    fence: vk::Fence,
}

impl<'a> OneShotCommands<'a> {
    /// Create a pool on `queue_family`, allocate a command buffer and begin recording.
    pub fn begin(device: &'a ash::Device, queue_family: u32) -> GraphicsResult<Self> {
        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);
        let pool = unsafe { device.create_command_pool(&pool_info, None) }?;

        let fence_info = vk::FenceCreateInfo::default();
        let fence = match unsafe { device.create_fence(&fence_info, None) } {
            Ok(fence) => fence,
            Err(e) => {
                unsafe { device.destroy_command_pool(pool, None) };
                return Err(e.into());
            }
        };

        let buffer = match allocate_command_buffers(device, pool, 1) {
            Ok(buffers) => buffers[0],
            Err(e) => {
                unsafe {
                    device.destroy_fence(fence, None);
                    device.destroy_command_pool(pool, None);
                }
                return Err(e);
            }
        };

        // From here on Drop owns the cleanup.
        let commands = Self {
            device,
            pool,
            buffer,
            fence,
        };

        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { device.begin_command_buffer(buffer, &begin_info) }?;

        Ok(commands)
    }

    /// The command buffer being recorded.
    pub fn buffer(&self) -> vk::CommandBuffer {
        self.buffer
    }

    /// End recording, submit to `queue` and block until the GPU is done.
    pub fn submit_and_wait(self, queue: vk::Queue, timeout: Duration) -> GraphicsResult<()> {
        unsafe { self.device.end_command_buffer(self.buffer) }?;

        let buffers = [self.buffer];
        let submit_info = vk::SubmitInfo::default().command_buffers(&buffers);
        unsafe {
            self.device
                .queue_submit(queue, &[submit_info], self.fence)
        }?;

        let timeout_ns = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
        match unsafe { self.device.wait_for_fences(&[self.fence], true, timeout_ns) } {
            Ok(()) => Ok(()),
            Err(vk::Result::TIMEOUT) => {
                log::error!("One-shot submission did not complete within {:?}", timeout);
                // The buffer may still be executing; wait it out so Drop can free it.
                unsafe { self.device.queue_wait_idle(queue) }?;
                Err(GraphicsError::Timeout)
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for OneShotCommands<'_> {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_fence(self.fence, None);
            // Frees the command buffer with it.
            self.device.destroy_command_pool(self.pool, None);
        }
    }
}
