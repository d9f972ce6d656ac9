//! Descriptor pools.
//!
//! A pool is sized up front for a number of sets of a given shape and never
//! grows. Allocation past that capacity fails with
//! [`GraphicsError::PoolExhausted`]; callers create another pool.

use std::collections::BTreeMap;

use ash::vk;
use parking_lot::Mutex;

use super::factory::DescriptorSetLayout;
use super::layout::SetLayoutDesc;
use crate::backend::vulkan::conversion::convert_resource_kind;
use crate::error::{GraphicsError, GraphicsResult};
use crate::reflect::ResourceKind;
use crate::resources::LiveToken;

/// Capacity of a descriptor pool: how many sets, and how many descriptors of
/// each kind a single set needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorPoolSizing {
    pub max_sets: u32,
    per_set: BTreeMap<ResourceKind, u32>,
}

impl DescriptorPoolSizing {
    pub fn new(max_sets: u32) -> Self {
        Self {
            max_sets,
            per_set: BTreeMap::new(),
        }
    }

    /// Add `count` descriptors of `kind` to every set.
    pub fn with(mut self, kind: ResourceKind, count: u32) -> Self {
        *self.per_set.entry(kind).or_default() += count;
        self
    }

    /// Room for `max_sets` sets shaped like `layout`.
    pub fn from_layout(layout: &SetLayoutDesc, max_sets: u32) -> Self {
        Self::from_layouts(std::slice::from_ref(layout), max_sets)
    }

    /// Room for `max_sets` sets of each of `layouts`.
    pub fn from_layouts(layouts: &[SetLayoutDesc], max_sets: u32) -> Self {
        let mut sizing = Self::new(max_sets.saturating_mul(layouts.len().max(1) as u32));
        for binding in layouts.iter().flat_map(|l| l.bindings()) {
            sizing = sizing.with(binding.kind, binding.count);
        }
        if !layouts.is_empty() {
            // Counts above cover one set of every layout; spread them per set.
            let layouts = layouts.len() as u32;
            for count in sizing.per_set.values_mut() {
                *count = count.div_ceil(layouts);
            }
        }
        sizing
    }

    /// Descriptors of `kind` one set may use.
    pub fn per_set(&self, kind: ResourceKind) -> u32 {
        self.per_set.get(&kind).copied().unwrap_or(0)
    }

    /// Total descriptors of `kind` across the pool.
    pub fn capacity(&self, kind: ResourceKind) -> u32 {
        self.per_set(kind).saturating_mul(self.max_sets)
    }

    pub(crate) fn vk_pool_sizes(&self) -> Vec<vk::DescriptorPoolSize> {
        self.per_set
            .iter()
            .filter(|(_, &count)| count > 0)
            .map(|(&kind, &count)| vk::DescriptorPoolSize {
                ty: convert_resource_kind(kind),
                descriptor_count: count.saturating_mul(self.max_sets),
            })
            .collect()
    }
}

/// Book-keeping of what a pool has handed out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PoolAccounting {
    sets: u32,
    descriptors: BTreeMap<ResourceKind, u32>,
}

impl PoolAccounting {
    pub(crate) fn new() -> Self {
        Self {
            sets: 0,
            descriptors: BTreeMap::new(),
        }
    }

    /// Reserve room for `count` sets of `layout`. Reserves nothing on failure.
    pub(crate) fn reserve(
        &mut self,
        sizing: &DescriptorPoolSizing,
        layout: &SetLayoutDesc,
        count: u32,
    ) -> GraphicsResult<()> {
        let sets = match self.sets.checked_add(count) {
            Some(sets) if sets <= sizing.max_sets => sets,
            _ => {
                return Err(GraphicsError::PoolExhausted(format!(
                    "{} of {} sets in use, {} requested",
                    self.sets, sizing.max_sets, count
                )))
            }
        };
        let mut needed: BTreeMap<ResourceKind, u32> = BTreeMap::new();
        for binding in layout.bindings() {
            let entry = needed.entry(binding.kind).or_default();
            let current = *entry;
            *entry = binding
                .count
                .checked_mul(count)
                .and_then(|n| current.checked_add(n))
                .ok_or_else(|| {
                    GraphicsError::PoolExhausted(format!(
                        "{:?}: {} sets of {} descriptors overflow",
                        binding.kind, count, binding.count
                    ))
                })?;
        }
        for (&kind, &amount) in &needed {
            let used = self.descriptors.get(&kind).copied().unwrap_or(0);
            let capacity = sizing.capacity(kind);
            if used.checked_add(amount).map_or(true, |total| total > capacity) {
                return Err(GraphicsError::PoolExhausted(format!(
                    "{kind:?}: {used} of {capacity} in use, {amount} requested"
                )));
            }
        }
        self.sets = sets;
        for (kind, amount) in needed {
            *self.descriptors.entry(kind).or_default() += amount;
        }
        Ok(())
    }

    pub(crate) fn sets(&self) -> u32 {
        self.sets
    }

    pub(crate) fn reset(&mut self) {
        self.sets = 0;
        self.descriptors.clear();
    }
}

/// A descriptor pool owned by its creator.
pub struct DescriptorPool {
    device: ash::Device,
    pool: vk::DescriptorPool,
    sizing: DescriptorPoolSizing,
    accounting: Mutex<PoolAccounting>,
    _token: LiveToken,
}

impl DescriptorPool {
    pub(crate) fn new(
        device: &ash::Device,
        sizing: DescriptorPoolSizing,
        token: LiveToken,
    ) -> GraphicsResult<Self> {
        if sizing.max_sets == 0 {
            return Err(GraphicsError::InvalidParameter(
                "descriptor pool must hold at least one set".to_string(),
            ));
        }
        let pool_sizes = sizing.vk_pool_sizes();
        let create_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(sizing.max_sets)
            .pool_sizes(&pool_sizes);
        let pool = unsafe { device.create_descriptor_pool(&create_info, None) }?;
        log::debug!(
            "Created descriptor pool for {} sets ({} descriptor kinds)",
            sizing.max_sets,
            pool_sizes.len()
        );
        Ok(Self {
            device: device.clone(),
            pool,
            sizing,
            accounting: Mutex::new(PoolAccounting::new()),
            _token: token,
        })
    }

    pub fn handle(&self) -> vk::DescriptorPool {
        self.pool
    }

    pub fn sizing(&self) -> &DescriptorPoolSizing {
        &self.sizing
    }

    /// Sets allocated since creation or the last reset.
    pub fn allocated_sets(&self) -> u32 {
        self.accounting.lock().sets()
    }

    /// Allocate `count` sets of `layout`.
    pub fn allocate(
        &self,
        layout: &DescriptorSetLayout,
        count: u32,
    ) -> GraphicsResult<Vec<vk::DescriptorSet>> {
        let mut accounting = self.accounting.lock();
        accounting.reserve(&self.sizing, layout.desc(), count)?;

        let layouts = vec![layout.handle(); count as usize];
        let allocate_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.pool)
            .set_layouts(&layouts);
        match unsafe { self.device.allocate_descriptor_sets(&allocate_info) } {
            Ok(sets) => Ok(sets),
            Err(result) => {
                // The driver disagrees with the book-keeping; roll the reservation back.
                accounting.reset_partial(layout.desc(), count);
                Err(match result {
                    vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL => {
                        GraphicsError::PoolExhausted(format!("driver reported {result:?}"))
                    }
                    other => other.into(),
                })
            }
        }
    }

    /// Return every set to the pool. Sets allocated earlier become invalid.
    pub fn reset(&self) -> GraphicsResult<()> {
        let mut accounting = self.accounting.lock();
        unsafe {
            self.device
                .reset_descriptor_pool(self.pool, vk::DescriptorPoolResetFlags::empty())
        }?;
        accounting.reset();
        Ok(())
    }
}

impl PoolAccounting {
    fn reset_partial(&mut self, layout: &SetLayoutDesc, count: u32) {
        self.sets = self.sets.saturating_sub(count);
        for binding in layout.bindings() {
            if let Some(used) = self.descriptors.get_mut(&binding.kind) {
                *used = used.saturating_sub(binding.count * count);
            }
        }
    }
}

impl Drop for DescriptorPool {
    fn drop(&mut self) {
        unsafe { self.device.destroy_descriptor_pool(self.pool, None) };
    }
}

impl std::fmt::Debug for DescriptorPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescriptorPool")
            .field("pool", &self.pool)
            .field("sizing", &self.sizing)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reflect::{ReflectedBinding, StageFlags};

    fn material_layout() -> SetLayoutDesc {
        SetLayoutDesc::new(
            1,
            vec![
                ReflectedBinding::new(1, 0, ResourceKind::UniformBuffer, StageFlags::FRAGMENT),
                ReflectedBinding::new(1, 1, ResourceKind::CombinedImageSampler, StageFlags::FRAGMENT)
                    .with_count(2),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_sizing_from_layout() {
        let sizing = DescriptorPoolSizing::from_layout(&material_layout(), 8);
        assert_eq!(sizing.max_sets, 8);
        assert_eq!(sizing.per_set(ResourceKind::UniformBuffer), 1);
        assert_eq!(sizing.capacity(ResourceKind::CombinedImageSampler), 16);
        assert_eq!(sizing.vk_pool_sizes().len(), 2);
    }

    #[test]
    fn test_reserve_until_exhausted() {
        let layout = material_layout();
        let sizing = DescriptorPoolSizing::from_layout(&layout, 2);
        let mut accounting = PoolAccounting::new();
        accounting.reserve(&sizing, &layout, 1).unwrap();
        accounting.reserve(&sizing, &layout, 1).unwrap();
        assert!(matches!(
            accounting.reserve(&sizing, &layout, 1),
            Err(GraphicsError::PoolExhausted(_))
        ));
        assert_eq!(accounting.sets(), 2);

        accounting.reset();
        accounting.reserve(&sizing, &layout, 2).unwrap();
    }

    #[test]
    fn test_reserve_huge_count_is_exhaustion() {
        let layout = material_layout();
        let sizing = DescriptorPoolSizing::from_layout(&layout, 4);
        let mut accounting = PoolAccounting::new();
        accounting.reserve(&sizing, &layout, 1).unwrap();
        let before = accounting.clone();

        for count in [u32::MAX, u32::MAX / 2 + 1] {
            assert!(matches!(
                accounting.reserve(&sizing, &layout, count),
                Err(GraphicsError::PoolExhausted(_))
            ));
            assert_eq!(accounting, before);
        }

        // A pool whose total capacity does not fit in u32.
        let wide = DescriptorPoolSizing::new(u32::MAX).with(ResourceKind::UniformBuffer, 2);
        assert_eq!(wide.capacity(ResourceKind::UniformBuffer), u32::MAX);
        let ubo_only = SetLayoutDesc::new(
            0,
            vec![ReflectedBinding::new(0, 0, ResourceKind::UniformBuffer, StageFlags::VERTEX)
                .with_count(4)],
        )
        .unwrap();
        let mut accounting = PoolAccounting::new();
        assert!(matches!(
            accounting.reserve(&wide, &ubo_only, u32::MAX / 2),
            Err(GraphicsError::PoolExhausted(_))
        ));
        assert_eq!(accounting.sets(), 0);
    }

    #[test]
    fn test_reserve_checks_descriptor_kinds() {
        let layout = material_layout();
        // Enough sets but no room for samplers.
        let sizing = DescriptorPoolSizing::new(4).with(ResourceKind::UniformBuffer, 1);
        let mut accounting = PoolAccounting::new();
        assert!(matches!(
            accounting.reserve(&sizing, &layout, 1),
            Err(GraphicsError::PoolExhausted(_))
        ));
        assert_eq!(accounting.sets(), 0);
    }

    #[test]
    fn test_reset_partial_rolls_back() {
        let layout = material_layout();
        let sizing = DescriptorPoolSizing::from_layout(&layout, 1);
        let mut accounting = PoolAccounting::new();
        accounting.reserve(&sizing, &layout, 1).unwrap();
        accounting.reset_partial(&layout, 1);
        assert_eq!(accounting, PoolAccounting::new().with_cleared_kinds(&layout));
        accounting.reserve(&sizing, &layout, 1).unwrap();
    }

    impl PoolAccounting {
        fn with_cleared_kinds(mut self, layout: &SetLayoutDesc) -> Self {
            for binding in layout.bindings() {
                self.descriptors.insert(binding.kind, 0);
            }
            self
        }
    }
}
