//! Vulkan physical and logical device management.
//!
//! Selection is split into a pure part ([`QueueFamilyIndices::resolve`],
//! [`missing_extensions`], [`DeviceCandidate::score`]) and the driver queries
//! that feed it, so the rules can be tested without a GPU.

use std::collections::BTreeSet;
use std::ffi::{c_char, CStr, CString};

use ash::vk;

use crate::error::{GraphicsError, GraphicsResult};

/// Capabilities of one queue family, as far as selection cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilyInfo {
    /// Operations supported by the family.
    pub flags: vk::QueueFlags,
    /// Whether the family can present to the target surface.
    pub present_support: bool,
}

/// Queue family indices for graphics, presentation and transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueFamilyIndices {
    pub graphics: Option<u32>,
    pub present: Option<u32>,
    pub transfer: Option<u32>,
}

/// Queue family indices once all of them are known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedQueues {
    pub graphics: u32,
    pub present: u32,
    pub transfer: u32,
}

impl ResolvedQueues {
    /// Distinct family indices, each of which needs one queue at device creation.
    pub fn unique_families(&self) -> Vec<u32> {
        let set: BTreeSet<u32> = [self.graphics, self.present, self.transfer]
            .into_iter()
            .collect();
        set.into_iter().collect()
    }
}

impl QueueFamilyIndices {
    /// Resolve indices from the families a device exposes.
    ///
    /// The present family is the graphics family when that one can present.
    /// Transfers use a dedicated transfer-only family when one exists, otherwise
    /// the graphics family.
    pub fn resolve(families: &[QueueFamilyInfo]) -> Self {
        let graphics = families
            .iter()
            .position(|f| f.flags.contains(vk::QueueFlags::GRAPHICS))
            .map(|i| i as u32);

        let present = match graphics {
            Some(g) if families[g as usize].present_support => Some(g),
            _ => families
                .iter()
                .position(|f| f.present_support)
                .map(|i| i as u32),
        };

        let dedicated_transfer = families
            .iter()
            .position(|f| {
                f.flags.contains(vk::QueueFlags::TRANSFER)
                    && !f.flags.contains(vk::QueueFlags::GRAPHICS)
                    && !f.flags.contains(vk::QueueFlags::COMPUTE)
            })
            .map(|i| i as u32);

        Self {
            graphics,
            present,
            transfer: dedicated_transfer.or(graphics),
        }
    }

    /// True once both graphics and present families are assigned.
    pub fn complete(&self) -> bool {
        self.graphics.is_some() && self.present.is_some()
    }

    /// Convert into [`ResolvedQueues`], or fail with `IncompleteQueueFamilies`.
    pub fn require_complete(&self) -> GraphicsResult<ResolvedQueues> {
        match (self.graphics, self.present) {
            (Some(graphics), Some(present)) => Ok(ResolvedQueues {
                graphics,
                present,
                transfer: self.transfer.unwrap_or(graphics),
            }),
            _ => Err(GraphicsError::IncompleteQueueFamilies {
                graphics: self.graphics,
                present: self.present,
            }),
        }
    }
}

/// Required extensions that are absent from `available`.
pub fn missing_extensions(available: &[CString], required: &[CString]) -> Vec<CString> {
    let mut missing: BTreeSet<&CString> = required.iter().collect();
    for name in available {
        missing.remove(name);
    }
    missing.into_iter().cloned().collect()
}

/// Everything selection needs to know about one physical device.
#[derive(Debug, Clone)]
pub struct DeviceCandidate {
    pub name: String,
    pub device_type: vk::PhysicalDeviceType,
    pub queues: QueueFamilyIndices,
    pub missing_extensions: Vec<CString>,
    pub sampler_anisotropy: bool,
    pub sampled_image_array_dynamic_indexing: bool,
    /// `None` when there is no surface to present to.
    pub swapchain_adequate: Option<bool>,
    pub max_image_dimension_2d: u32,
}

/// Score bonus for devices whose queue families are complete.
const COMPLETE_QUEUES_SCORE: u32 = 100_000;

impl DeviceCandidate {
    /// Score the candidate, or give the reason it is unsuitable.
    ///
    /// Devices with complete queue families always outrank those without, so an
    /// incomplete device is only chosen when nothing better exists; its queue
    /// check then fails with `IncompleteQueueFamilies`.
    pub fn score(&self, require_discrete: bool) -> Result<u32, String> {
        if !self.missing_extensions.is_empty() {
            return Err(format!(
                "missing extensions {:?}",
                self.missing_extensions
            ));
        }
        if !self.sampler_anisotropy {
            return Err("no sampler anisotropy".to_string());
        }
        if !self.sampled_image_array_dynamic_indexing {
            return Err("no dynamic indexing of sampled image arrays".to_string());
        }
        if self.swapchain_adequate == Some(false) {
            return Err("no surface formats or present modes".to_string());
        }
        if require_discrete && self.device_type != vk::PhysicalDeviceType::DISCRETE_GPU {
            return Err(format!("not a discrete GPU ({:?})", self.device_type));
        }

        let mut score = match self.device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
            vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
            vk::PhysicalDeviceType::VIRTUAL_GPU => 10,
            _ => 1,
        };
        score += self.max_image_dimension_2d / 1024;
        if self.queues.complete() {
            score += COMPLETE_QUEUES_SCORE;
        }
        Ok(score)
    }
}

/// Pick the best candidate; returns its index.
pub fn pick_best(candidates: &[DeviceCandidate], require_discrete: bool) -> GraphicsResult<usize> {
    let mut best: Option<(usize, u32)> = None;
    let mut rejections = Vec::new();

    for (index, candidate) in candidates.iter().enumerate() {
        match candidate.score(require_discrete) {
            Ok(score) => {
                log::info!(
                    "Found GPU: {:?} (type: {:?}, score: {})",
                    candidate.name,
                    candidate.device_type,
                    score
                );
                if best.map_or(true, |(_, s)| score > s) {
                    best = Some((index, score));
                }
            }
            Err(reason) => {
                log::info!("Skipping GPU {:?}: {}", candidate.name, reason);
                rejections.push(format!("{}: {}", candidate.name, reason));
            }
        }
    }

    match best {
        Some((index, _)) => Ok(index),
        None if candidates.is_empty() => Err(GraphicsError::DeviceSelection(
            "no Vulkan-capable GPU found".to_string(),
        )),
        None => Err(GraphicsError::DeviceSelection(rejections.join("; "))),
    }
}

/// Surface the device will present to, if any.
#[derive(Clone, Copy)]
pub struct SurfaceTarget<'a> {
    pub loader: &'a ash::khr::surface::Instance,
    pub surface: vk::SurfaceKHR,
}

/// Physical device chosen for the context.
#[derive(Debug, Clone)]
pub struct SelectedDevice {
    pub physical_device: vk::PhysicalDevice,
    pub name: String,
    pub queues: QueueFamilyIndices,
}

/// Select the best physical device for rendering.
///
/// Discrete GPUs are preferred over integrated ones.
pub fn select_physical_device(
    instance: &ash::Instance,
    surface: Option<SurfaceTarget<'_>>,
    required_extensions: &[CString],
    require_discrete: bool,
) -> GraphicsResult<SelectedDevice> {
    let devices = unsafe { instance.enumerate_physical_devices() }.map_err(|e| {
        GraphicsError::InitializationFailed(format!(
            "Failed to enumerate physical devices: {:?}",
            e
        ))
    })?;

    let mut candidates = Vec::with_capacity(devices.len());
    for &device in &devices {
        candidates.push(describe_device(
            instance,
            device,
            surface,
            required_extensions,
        )?);
    }

    let index = pick_best(&candidates, require_discrete)?;
    let chosen = &candidates[index];
    Ok(SelectedDevice {
        physical_device: devices[index],
        name: chosen.name.clone(),
        queues: chosen.queues,
    })
}

fn describe_device(
    instance: &ash::Instance,
    device: vk::PhysicalDevice,
    surface: Option<SurfaceTarget<'_>>,
    required_extensions: &[CString],
) -> GraphicsResult<DeviceCandidate> {
    let properties = unsafe { instance.get_physical_device_properties(device) };
    let features = unsafe { instance.get_physical_device_features(device) };
    let name = properties
        .device_name_as_c_str()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "<unnamed>".to_string());

    let families = queue_families(instance, device, surface)?;

    let available: Vec<CString> =
        unsafe { instance.enumerate_device_extension_properties(device) }
            .map_err(GraphicsError::from)?
            .iter()
            .filter_map(|ext| ext.extension_name_as_c_str().ok().map(CStr::to_owned))
            .collect();

    let swapchain_adequate = match surface {
        Some(target) => Some(check_swapchain_support(target, device)?),
        None => None,
    };

    Ok(DeviceCandidate {
        name,
        device_type: properties.device_type,
        queues: QueueFamilyIndices::resolve(&families),
        missing_extensions: missing_extensions(&available, required_extensions),
        sampler_anisotropy: features.sampler_anisotropy == vk::TRUE,
        sampled_image_array_dynamic_indexing: features
            .shader_sampled_image_array_dynamic_indexing
            == vk::TRUE,
        swapchain_adequate,
        max_image_dimension_2d: properties.limits.max_image_dimension2_d,
    })
}

/// Query queue families. Without a surface, every graphics family counts as
/// able to present (headless rendering presents nowhere).
fn queue_families(
    instance: &ash::Instance,
    device: vk::PhysicalDevice,
    surface: Option<SurfaceTarget<'_>>,
) -> GraphicsResult<Vec<QueueFamilyInfo>> {
    let properties = unsafe { instance.get_physical_device_queue_family_properties(device) };
    let mut families = Vec::with_capacity(properties.len());
    for (index, family) in properties.iter().enumerate() {
        let present_support = match surface {
            Some(target) => unsafe {
                target.loader.get_physical_device_surface_support(
                    device,
                    index as u32,
                    target.surface,
                )
            }
            .map_err(GraphicsError::from)?,
            None => family.queue_flags.contains(vk::QueueFlags::GRAPHICS),
        };
        families.push(QueueFamilyInfo {
            flags: family.queue_flags,
            present_support,
        });
    }
    Ok(families)
}

fn check_swapchain_support(
    target: SurfaceTarget<'_>,
    device: vk::PhysicalDevice,
) -> GraphicsResult<bool> {
    let formats = unsafe {
        target
            .loader
            .get_physical_device_surface_formats(device, target.surface)
    }
    .map_err(GraphicsError::from)?;
    let modes = unsafe {
        target
            .loader
            .get_physical_device_surface_present_modes(device, target.surface)
    }
    .map_err(GraphicsError::from)?;
    Ok(!formats.is_empty() && !modes.is_empty())
}

/// Device limits and optional features recorded once at initialization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCapabilities {
    pub device_name: String,
    pub device_type: vk::PhysicalDeviceType,
    pub multiview: bool,
    pub max_multiview_view_count: u32,
    pub max_push_constants_size: u32,
    pub max_bound_descriptor_sets: u32,
    pub max_sampler_anisotropy: u32,
    pub max_image_dimension_2d: u32,
}

/// Query capabilities of a physical device.
pub fn query_capabilities(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
) -> DeviceCapabilities {
    let mut multiview_features = vk::PhysicalDeviceMultiviewFeatures::default();
    let mut features2 = vk::PhysicalDeviceFeatures2::default().push_next(&mut multiview_features);
    unsafe { instance.get_physical_device_features2(physical_device, &mut features2) };
    let multiview = multiview_features.multiview == vk::TRUE;

    let mut multiview_properties = vk::PhysicalDeviceMultiviewProperties::default();
    let mut properties2 =
        vk::PhysicalDeviceProperties2::default().push_next(&mut multiview_properties);
    unsafe { instance.get_physical_device_properties2(physical_device, &mut properties2) };
    let properties = properties2.properties;

    DeviceCapabilities {
        device_name: properties
            .device_name_as_c_str()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        device_type: properties.device_type,
        multiview,
        max_multiview_view_count: multiview_properties.max_multiview_view_count,
        max_push_constants_size: properties.limits.max_push_constants_size,
        max_bound_descriptor_sets: properties.limits.max_bound_descriptor_sets,
        max_sampler_anisotropy: properties.limits.max_sampler_anisotropy as u32,
        max_image_dimension_2d: properties.limits.max_image_dimension2_d,
    }
}

/// Create a logical device with required features and extensions.
pub fn create_logical_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    queues: &ResolvedQueues,
    extensions: &[CString],
    enable_multiview: bool,
) -> GraphicsResult<ash::Device> {
    let queue_priorities = [1.0f32];
    let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = queues
        .unique_families()
        .into_iter()
        .map(|family| {
            vk::DeviceQueueCreateInfo::default()
                .queue_family_index(family)
                .queue_priorities(&queue_priorities)
        })
        .collect();

    let extension_ptrs: Vec<*const c_char> = extensions.iter().map(|e| e.as_ptr()).collect();

    let features = vk::PhysicalDeviceFeatures::default()
        .sampler_anisotropy(true)
        .shader_sampled_image_array_dynamic_indexing(true);

    let mut multiview_features =
        vk::PhysicalDeviceMultiviewFeatures::default().multiview(enable_multiview);

    let create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&extension_ptrs)
        .enabled_features(&features)
        .push_next(&mut multiview_features);

    let device =
        unsafe { instance.create_device(physical_device, &create_info, None) }.map_err(|e| {
            GraphicsError::InitializationFailed(format!("Failed to create logical device: {:?}", e))
        })?;

    Ok(device)
}

/// First candidate format supporting `features` with the given tiling.
pub fn find_supported_format(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    candidates: &[vk::Format],
    tiling: vk::ImageTiling,
    features: vk::FormatFeatureFlags,
) -> Option<vk::Format> {
    candidates.iter().copied().find(|&format| {
        let properties =
            unsafe { instance.get_physical_device_format_properties(physical_device, format) };
        match tiling {
            vk::ImageTiling::LINEAR => properties.linear_tiling_features.contains(features),
            _ => properties.optimal_tiling_features.contains(features),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn family(flags: vk::QueueFlags, present_support: bool) -> QueueFamilyInfo {
        QueueFamilyInfo {
            flags,
            present_support,
        }
    }

    fn candidate(device_type: vk::PhysicalDeviceType) -> DeviceCandidate {
        DeviceCandidate {
            name: "test".to_string(),
            device_type,
            queues: QueueFamilyIndices {
                graphics: Some(0),
                present: Some(0),
                transfer: Some(0),
            },
            missing_extensions: vec![],
            sampler_anisotropy: true,
            sampled_image_array_dynamic_indexing: true,
            swapchain_adequate: None,
            max_image_dimension_2d: 16384,
        }
    }

    #[test]
    fn test_combined_graphics_present_family() {
        let families = [family(
            vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
            true,
        )];
        let indices = QueueFamilyIndices::resolve(&families);
        assert!(indices.complete());
        assert_eq!(indices.graphics, Some(0));
        assert_eq!(indices.present, Some(0));
        assert_eq!(indices.transfer, Some(0));
    }

    #[test]
    fn test_no_usable_family_is_incomplete() {
        let families = [family(vk::QueueFlags::COMPUTE, false)];
        let indices = QueueFamilyIndices::resolve(&families);
        assert!(!indices.complete());
        assert!(matches!(
            indices.require_complete(),
            Err(GraphicsError::IncompleteQueueFamilies {
                graphics: None,
                present: None
            })
        ));
    }

    #[test]
    fn test_separate_present_and_transfer_families() {
        let families = [
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE, false),
            family(vk::QueueFlags::COMPUTE, true),
            family(vk::QueueFlags::TRANSFER, false),
        ];
        let indices = QueueFamilyIndices::resolve(&families);
        let resolved = indices.require_complete().unwrap();
        assert_eq!(resolved.graphics, 0);
        assert_eq!(resolved.present, 1);
        assert_eq!(resolved.transfer, 2);
        assert_eq!(resolved.unique_families(), vec![0, 1, 2]);
    }

    #[test]
    fn test_graphics_preferred_for_present_when_capable() {
        let families = [
            family(vk::QueueFlags::COMPUTE, true),
            family(vk::QueueFlags::GRAPHICS, true),
        ];
        let indices = QueueFamilyIndices::resolve(&families);
        assert_eq!(indices.graphics, Some(1));
        assert_eq!(indices.present, Some(1));
    }

    #[test]
    fn test_missing_extensions() {
        let available = vec![
            ash::khr::swapchain::NAME.to_owned(),
            c"VK_KHR_other".to_owned(),
        ];
        let required = vec![
            ash::khr::swapchain::NAME.to_owned(),
            ash::khr::multiview::NAME.to_owned(),
        ];
        assert_eq!(
            missing_extensions(&available, &required),
            vec![ash::khr::multiview::NAME.to_owned()]
        );
        assert!(missing_extensions(&available, &required[..1]).is_empty());
    }

    #[rstest]
    #[case(vk::PhysicalDeviceType::DISCRETE_GPU, vk::PhysicalDeviceType::INTEGRATED_GPU)]
    #[case(vk::PhysicalDeviceType::INTEGRATED_GPU, vk::PhysicalDeviceType::CPU)]
    fn test_device_type_ranking(
        #[case] better: vk::PhysicalDeviceType,
        #[case] worse: vk::PhysicalDeviceType,
    ) {
        let candidates = [candidate(worse), candidate(better)];
        assert_eq!(pick_best(&candidates, false).unwrap(), 1);
    }

    #[test]
    fn test_complete_queues_outrank_device_type() {
        let mut discrete = candidate(vk::PhysicalDeviceType::DISCRETE_GPU);
        discrete.queues = QueueFamilyIndices::default();
        let integrated = candidate(vk::PhysicalDeviceType::INTEGRATED_GPU);
        assert_eq!(pick_best(&[discrete, integrated], false).unwrap(), 1);
    }

    #[test]
    fn test_unsuitable_devices_fail_selection() {
        let mut no_ext = candidate(vk::PhysicalDeviceType::DISCRETE_GPU);
        no_ext.missing_extensions = vec![ash::khr::multiview::NAME.to_owned()];
        let mut no_aniso = candidate(vk::PhysicalDeviceType::INTEGRATED_GPU);
        no_aniso.sampler_anisotropy = false;

        let err = pick_best(&[no_ext, no_aniso], false).unwrap_err();
        assert!(matches!(err, GraphicsError::DeviceSelection(_)));
        assert!(matches!(
            pick_best(&[], false),
            Err(GraphicsError::DeviceSelection(_))
        ));
    }

    #[test]
    fn test_require_discrete() {
        let integrated = candidate(vk::PhysicalDeviceType::INTEGRATED_GPU);
        assert!(integrated.score(true).is_err());
        assert!(integrated.score(false).is_ok());
    }

    #[test]
    fn test_inadequate_swapchain_rejected() {
        let mut c = candidate(vk::PhysicalDeviceType::DISCRETE_GPU);
        c.swapchain_adequate = Some(false);
        assert!(c.score(false).is_err());
    }
}
