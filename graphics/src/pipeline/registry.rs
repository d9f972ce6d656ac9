//! Format IDs for layout-compatible descriptor sets and render passes.
//!
//! Two objects with equal signatures get the same small integer ID, so the
//! renderer can compare IDs instead of layouts when batching draws. ID 0 is
//! reserved for the empty signature.

use std::collections::HashMap;
use std::hash::Hash;

/// ID shared by every empty signature.
pub const EMPTY_FORMAT_ID: u32 = 0;

/// Assigns stable IDs to distinct signatures, starting at 1.
#[derive(Debug)]
pub struct FormatRegistry<K> {
    ids: HashMap<K, u32>,
}

impl<K> Default for FormatRegistry<K> {
    fn default() -> Self {
        Self {
            ids: HashMap::new(),
        }
    }
}

impl<K: Hash + Eq> FormatRegistry<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// ID for `signature`, registering it if unseen. `is_empty` short-circuits to 0.
    pub fn id_for(&mut self, signature: K, is_empty: bool) -> u32 {
        if is_empty {
            return EMPTY_FORMAT_ID;
        }
        let next = self.ids.len() as u32 + 1;
        *self.ids.entry(signature).or_insert(next)
    }

    /// Number of distinct non-empty signatures seen.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_stable_and_dense() {
        let mut registry = FormatRegistry::new();
        assert_eq!(registry.id_for(vec![1, 2], false), 1);
        assert_eq!(registry.id_for(vec![3], false), 2);
        assert_eq!(registry.id_for(vec![1, 2], false), 1);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_empty_signature_is_zero() {
        let mut registry: FormatRegistry<Vec<u32>> = FormatRegistry::new();
        assert_eq!(registry.id_for(Vec::new(), true), EMPTY_FORMAT_ID);
        assert!(registry.is_empty());
    }
}
