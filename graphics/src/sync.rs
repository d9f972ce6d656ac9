//! GPU synchronization primitives.
//!
//! Fences let the CPU wait for GPU work; semaphores order work between queue
//! submissions. [`FrameSync`] bundles one of each per frame-in-flight slot and
//! bounds how far the CPU may run ahead of the GPU.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use ash::vk;

use crate::error::{GraphicsError, GraphicsResult};
use crate::resources::LiveToken;

/// Timeout used for fence waits that should never take long.
pub const FENCE_TIMEOUT: Duration = Duration::from_secs(10);

/// GPU semaphore for ordering operations between submissions.
///
/// Unlike fences, semaphores cannot be waited on from the CPU.
pub struct Semaphore {
    device: ash::Device,
    semaphore: vk::Semaphore,
    _token: LiveToken,
}

impl Semaphore {
    pub(crate) fn new(device: &ash::Device, token: LiveToken) -> GraphicsResult<Self> {
        let info = vk::SemaphoreCreateInfo::default();
        let semaphore = unsafe { device.create_semaphore(&info, None) }?;
        Ok(Self {
            device: device.clone(),
            semaphore,
            _token: token,
        })
    }

    /// Native semaphore handle.
    pub fn handle(&self) -> vk::Semaphore {
        self.semaphore
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        unsafe { self.device.destroy_semaphore(self.semaphore, None) };
    }
}

/// Status of a fence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceStatus {
    /// Not signaled and not part of any submission.
    Unsignaled,
    /// Submitted with GPU work that has not completed yet.
    Pending,
    /// The fence has been signaled (GPU work complete).
    Signaled,
}

/// CPU-GPU synchronization primitive.
///
/// # Example
///
/// ```ignore
/// let fence = ctx.create_fence(false)?;
/// ctx.submit(&[submit_info], Some(&fence))?;
/// fence.wait(FENCE_TIMEOUT)?;
/// assert_eq!(fence.status()?, FenceStatus::Signaled);
/// ```
pub struct Fence {
    device: ash::Device,
    fence: vk::Fence,
    submitted: AtomicBool,
    _token: LiveToken,
}

impl Fence {
    pub(crate) fn new(device: &ash::Device, signaled: bool, token: LiveToken) -> GraphicsResult<Self> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let info = vk::FenceCreateInfo::default().flags(flags);
        let fence = unsafe { device.create_fence(&info, None) }?;
        Ok(Self {
            device: device.clone(),
            fence,
            submitted: AtomicBool::new(false),
            _token: token,
        })
    }

    /// Native fence handle.
    pub fn handle(&self) -> vk::Fence {
        self.fence
    }

    /// Record that the fence was handed to a queue submission.
    pub(crate) fn mark_submitted(&self) {
        self.submitted.store(true, Ordering::Release);
    }

    /// Check the current status of the fence (non-blocking).
    pub fn status(&self) -> GraphicsResult<FenceStatus> {
        let signaled = unsafe { self.device.get_fence_status(self.fence) }?;
        Ok(fence_status(signaled, self.submitted.load(Ordering::Acquire)))
    }

    /// Wait for the fence to be signaled.
    ///
    /// Fails with [`GraphicsError::Timeout`] if `timeout` elapses first.
    pub fn wait(&self, timeout: Duration) -> GraphicsResult<()> {
        let timeout_ns = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
        match unsafe { self.device.wait_for_fences(&[self.fence], true, timeout_ns) } {
            Ok(()) => {
                self.submitted.store(false, Ordering::Release);
                Ok(())
            }
            Err(vk::Result::TIMEOUT) => {
                log::warn!(
                    "Fence wait timed out after {:?}. GPU may be hung or fence was never submitted.",
                    timeout
                );
                Err(GraphicsError::Timeout)
            }
            Err(e) => {
                log::error!("Fence wait failed: {:?}", e);
                Err(e.into())
            }
        }
    }

    /// Reset the fence to unsignaled.
    ///
    /// Must only be called when no submission is pending on this fence.
    pub fn reset(&self) -> GraphicsResult<()> {
        unsafe { self.device.reset_fences(&[self.fence]) }?;
        self.submitted.store(false, Ordering::Release);
        Ok(())
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        unsafe { self.device.destroy_fence(self.fence, None) };
    }
}

fn fence_status(signaled: bool, submitted: bool) -> FenceStatus {
    match (signaled, submitted) {
        (true, _) => FenceStatus::Signaled,
        (false, true) => FenceStatus::Pending,
        (false, false) => FenceStatus::Unsignaled,
    }
}

/// Synchronization objects owned by one frame-in-flight slot.
pub struct FrameSlot {
    /// Signaled when the target image is ready to be rendered to.
    pub image_available: Semaphore,
    /// Signaled when the slot's rendering work has finished.
    pub render_finished: Semaphore,
    /// Signaled when the slot's submission has completed on the GPU.
    pub in_flight: Fence,
}

/// Per-frame synchronization ring.
///
/// Each slot's fence is created signaled so the first [`acquire`](Self::acquire)
/// of every slot does not block.
pub struct FrameSync {
    slots: Vec<FrameSlot>,
    current: usize,
}

impl FrameSync {
    pub(crate) fn new(slots: Vec<FrameSlot>) -> GraphicsResult<Self> {
        if slots.is_empty() {
            return Err(GraphicsError::InvalidParameter(
                "frame sync needs at least one slot".to_string(),
            ));
        }
        Ok(Self { slots, current: 0 })
    }

    /// Number of slots.
    pub fn frames_in_flight(&self) -> usize {
        self.slots.len()
    }

    /// Index of the slot the next frame uses.
    pub fn current_index(&self) -> usize {
        self.current
    }

    /// Block until the current slot's previous submission is done, then reset
    /// its fence for reuse.
    pub fn acquire(&self) -> GraphicsResult<&FrameSlot> {
        let slot = &self.slots[self.current];
        slot.in_flight.wait(FENCE_TIMEOUT)?;
        slot.in_flight.reset()?;
        Ok(slot)
    }

    /// The current slot, without waiting.
    pub fn current(&self) -> &FrameSlot {
        &self.slots[self.current]
    }

    /// Move to the next slot.
    pub fn advance(&mut self) {
        self.current = next_slot(self.current, self.slots.len());
    }

    /// Wait for every slot's outstanding work.
    pub fn wait_all(&self) -> GraphicsResult<()> {
        for slot in &self.slots {
            if slot.in_flight.status()? == FenceStatus::Pending {
                slot.in_flight.wait(FENCE_TIMEOUT)?;
            }
        }
        Ok(())
    }
}

fn next_slot(current: usize, count: usize) -> usize {
    (current + 1) % count
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(true, false, FenceStatus::Signaled)]
    #[case(true, true, FenceStatus::Signaled)]
    #[case(false, true, FenceStatus::Pending)]
    #[case(false, false, FenceStatus::Unsignaled)]
    fn test_fence_status(
        #[case] signaled: bool,
        #[case] submitted: bool,
        #[case] expected: FenceStatus,
    ) {
        assert_eq!(fence_status(signaled, submitted), expected);
    }

    #[rstest]
    #[case(0, 2, 1)]
    #[case(1, 2, 0)]
    #[case(2, 3, 0)]
    #[case(0, 1, 0)]
    fn test_next_slot(#[case] current: usize, #[case] count: usize, #[case] expected: usize) {
        assert_eq!(next_slot(current, count), expected);
    }

    #[test]
    fn test_frame_sync_rejects_empty() {
        assert!(matches!(
            FrameSync::new(Vec::new()),
            Err(GraphicsError::InvalidParameter(_))
        ));
    }
}
