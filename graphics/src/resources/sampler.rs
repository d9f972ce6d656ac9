//! Texture sampler resource.

use ash::vk;

use super::LiveToken;

/// A texture sampler.
pub struct Sampler {
    device: ash::Device,
    sampler: vk::Sampler,
    _token: LiveToken,
}

impl Sampler {
    pub(crate) fn new(device: ash::Device, sampler: vk::Sampler, token: LiveToken) -> Self {
        Self {
            device,
            sampler,
            _token: token,
        }
    }

    /// Native sampler handle.
    pub fn handle(&self) -> vk::Sampler {
        self.sampler
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        unsafe { self.device.destroy_sampler(self.sampler, None) };
    }
}

impl std::fmt::Debug for Sampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sampler")
            .field("sampler", &self.sampler)
            .finish()
    }
}
