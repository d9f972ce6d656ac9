//! GPU buffer resource.

use ash::vk;
use gpu_allocator::vulkan::Allocation;

use super::LiveToken;
use crate::backend::vulkan::allocator::{self, SharedAllocator};
use crate::error::{GraphicsError, GraphicsResult};
use crate::types::{BufferUsage, MemoryUsage};

/// A GPU buffer with its backing allocation.
///
/// Buffers are created by [`DeviceContext::create_buffer`](crate::DeviceContext::create_buffer)
/// and must be dropped before the context is destroyed.
///
/// # Example
///
/// ```ignore
/// let staging = ctx.create_buffer(&BufferDescriptor::new(
///     1024,
///     BufferUsage::COPY_SRC,
///     MemoryUsage::CpuToGpu,
/// ))?;
/// staging.write(0, &bytes)?;
/// ```
pub struct Buffer {
    device: ash::Device,
    allocator: SharedAllocator,
    buffer: vk::Buffer,
    allocation: Option<Allocation>,
    size: u64,
    usage: BufferUsage,
    memory: MemoryUsage,
    _token: LiveToken,
}

impl Buffer {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        device: ash::Device,
        allocator: SharedAllocator,
        buffer: vk::Buffer,
        allocation: Allocation,
        size: u64,
        usage: BufferUsage,
        memory: MemoryUsage,
        token: LiveToken,
    ) -> Self {
        Self {
            device,
            allocator,
            buffer,
            allocation: Some(allocation),
            size,
            usage,
            memory,
            _token: token,
        }
    }

    /// Native buffer handle.
    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    /// Size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Usage flags the buffer was created with.
    pub fn usage(&self) -> BufferUsage {
        self.usage
    }

    /// Memory placement.
    pub fn memory(&self) -> MemoryUsage {
        self.memory
    }

    /// Copy `data` into the mapped allocation at `offset`.
    pub fn write(&mut self, offset: u64, data: &[u8]) -> GraphicsResult<()> {
        let size = self.size;
        let mapped = self.mapped_mut()?;
        let range = checked_range(offset, data.len(), size)?;
        mapped[range].copy_from_slice(data);
        Ok(())
    }

    /// Copy from the mapped allocation at `offset` into `out`.
    pub fn read(&self, offset: u64, out: &mut [u8]) -> GraphicsResult<()> {
        let mapped = self
            .allocation
            .as_ref()
            .and_then(|a| a.mapped_slice())
            .ok_or_else(not_mapped)?;
        let range = checked_range(offset, out.len(), self.size)?;
        out.copy_from_slice(&mapped[range]);
        Ok(())
    }

    fn mapped_mut(&mut self) -> GraphicsResult<&mut [u8]> {
        self.allocation
            .as_mut()
            .and_then(|a| a.mapped_slice_mut())
            .ok_or_else(not_mapped)
    }
}

fn not_mapped() -> GraphicsError {
    GraphicsError::InvalidParameter("buffer memory is not host visible".to_string())
}

fn checked_range(offset: u64, len: usize, size: u64) -> GraphicsResult<std::ops::Range<usize>> {
    let end = offset
        .checked_add(len as u64)
        .filter(|&end| end <= size)
        .ok_or_else(|| {
            GraphicsError::InvalidParameter(format!(
                "range {offset}+{len} exceeds buffer size {size}"
            ))
        })?;
    Ok(offset as usize..end as usize)
}

impl Drop for Buffer {
    fn drop(&mut self) {
        unsafe { self.device.destroy_buffer(self.buffer, None) };
        if let Some(allocation) = self.allocation.take() {
            allocator::free(&self.allocator, allocation);
        }
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("buffer", &self.buffer)
            .field("size", &self.size)
            .field("usage", &self.usage)
            .field("memory", &self.memory)
            .finish()
    }
}

static_assertions::assert_impl_all!(Buffer: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checked_range() {
        assert_eq!(checked_range(0, 16, 16).unwrap(), 0..16);
        assert_eq!(checked_range(8, 4, 16).unwrap(), 8..12);
        assert!(checked_range(8, 16, 16).is_err());
        assert!(checked_range(u64::MAX, 1, 16).is_err());
    }
}
