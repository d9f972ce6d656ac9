//! Buffer types and descriptors.

use bitflags::bitflags;

bitflags! {
    /// Usage flags for buffers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        /// Buffer can be used as a vertex buffer.
        const VERTEX = 1 << 0;
        /// Buffer can be used as an index buffer.
        const INDEX = 1 << 1;
        /// Buffer can be used as a uniform buffer.
        const UNIFORM = 1 << 2;
        /// Buffer can be used as a storage buffer.
        const STORAGE = 1 << 3;
        /// Buffer can be used as an indirect buffer.
        const INDIRECT = 1 << 4;
        /// Buffer can be copied from.
        const COPY_SRC = 1 << 5;
        /// Buffer can be copied to.
        const COPY_DST = 1 << 6;
    }
}

impl Default for BufferUsage {
    fn default() -> Self {
        Self::empty()
    }
}

/// Where the memory backing a resource lives and who touches it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MemoryUsage {
    /// Device local, never mapped.
    #[default]
    GpuOnly,
    /// Host visible, written by the CPU and read by the GPU (staging, uniforms).
    CpuToGpu,
    /// Host visible, written by the GPU and read back by the CPU.
    GpuToCpu,
}

impl MemoryUsage {
    /// The gpu-allocator location for this usage.
    pub fn location(self) -> gpu_allocator::MemoryLocation {
        match self {
            Self::GpuOnly => gpu_allocator::MemoryLocation::GpuOnly,
            Self::CpuToGpu => gpu_allocator::MemoryLocation::CpuToGpu,
            Self::GpuToCpu => gpu_allocator::MemoryLocation::GpuToCpu,
        }
    }

    /// Whether allocations with this usage are mapped for CPU access.
    pub fn is_host_visible(self) -> bool {
        !matches!(self, Self::GpuOnly)
    }
}

/// Descriptor for creating a buffer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct BufferDescriptor {
    /// Debug label for the buffer.
    pub label: Option<String>,
    /// Size in bytes.
    pub size: u64,
    /// Usage flags.
    pub usage: BufferUsage,
    /// Memory placement.
    pub memory: MemoryUsage,
}

impl BufferDescriptor {
    /// Create a new buffer descriptor.
    pub fn new(size: u64, usage: BufferUsage, memory: MemoryUsage) -> Self {
        Self {
            label: None,
            size,
            usage,
            memory,
        }
    }

    /// Set the debug label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}
