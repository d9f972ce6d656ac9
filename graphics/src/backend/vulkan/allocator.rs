//! GPU memory allocator integration using gpu-allocator.

use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::AllocatorDebugSettings;
use parking_lot::Mutex;

use crate::error::{GraphicsError, GraphicsResult};
use crate::types::MemoryUsage;

/// Allocator slot shared between the context and the resources it creates.
///
/// The slot is emptied at context teardown, before the device is destroyed.
pub type SharedAllocator = std::sync::Arc<Mutex<Option<Allocator>>>;

/// Create a memory allocator for the Vulkan device.
pub fn create_allocator(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
) -> GraphicsResult<Allocator> {
    Allocator::new(&AllocatorCreateDesc {
        instance: instance.clone(),
        device,
        physical_device,
        debug_settings: AllocatorDebugSettings {
            log_leaks_on_shutdown: true,
            ..Default::default()
        },
        buffer_device_address: false,
        allocation_sizes: gpu_allocator::AllocationSizes::default(),
    })
    .map_err(|e| {
        GraphicsError::InitializationFailed(format!("Failed to create memory allocator: {}", e))
    })
}

/// Suballocate memory for a buffer or image.
pub fn allocate(
    allocator: &Mutex<Option<Allocator>>,
    name: &str,
    requirements: vk::MemoryRequirements,
    memory: MemoryUsage,
    linear: bool,
) -> GraphicsResult<Allocation> {
    let mut guard = allocator.lock();
    let allocator = guard
        .as_mut()
        .ok_or_else(|| GraphicsError::InvalidState("allocator already released".to_string()))?;
    allocator
        .allocate(&AllocationCreateDesc {
            name,
            requirements,
            location: memory.location(),
            linear,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })
        .map_err(|e| {
            log::error!("Allocation of {name:?} ({} bytes) failed: {e}", requirements.size);
            GraphicsError::from(e)
        })
}

/// Return an allocation to the allocator. A released allocator means the memory
/// went away with the device, so there is nothing left to free.
pub fn free(allocator: &Mutex<Option<Allocator>>, allocation: Allocation) {
    if let Some(allocator) = allocator.lock().as_mut() {
        if let Err(e) = allocator.free(allocation) {
            log::warn!("Failed to free allocation: {e}");
        }
    }
}
