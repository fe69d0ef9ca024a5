//! Destination-SP selection.
//!
//! The virtual-group manager ranks candidate SPs by its own criteria
//! (load, reputation, stake); the scheduler only supplies an exclusion
//! predicate. Two flavors exist: an exclude-set built from a slice, and an
//! exclude-map built from the multiplicity histogram of a family's
//! secondaries.

use std::collections::BTreeMap;

use cairn_types::{SpId, StorageProvider};

use crate::error::Result;

/// Predicate rejecting a fixed set of SP IDs.
#[derive(Debug, Clone, Default)]
pub struct PickDestSpFilter {
    excluded_sp_ids: Vec<SpId>,
}

impl PickDestSpFilter {
    /// Builds a filter from an exclusion slice.
    pub fn from_slice(excluded: &[SpId]) -> Self {
        Self {
            excluded_sp_ids: excluded.to_vec(),
        }
    }

    /// Builds a filter from a secondary-multiplicity histogram; every SP
    /// appearing in the map is excluded regardless of its count.
    pub fn from_multiplicity_map(map: &BTreeMap<SpId, usize>) -> Self {
        Self {
            excluded_sp_ids: map.keys().copied().collect(),
        }
    }

    /// Adds one more SP to the exclusion set.
    pub fn also_exclude(mut self, sp_id: SpId) -> Self {
        self.excluded_sp_ids.push(sp_id);
        self
    }

    /// Returns true when the candidate passes the filter.
    pub fn check(&self, sp_id: SpId) -> bool {
        !self.excluded_sp_ids.contains(&sp_id)
    }
}

/// Candidate ranking and SP lookup, owned by the virtual-group manager.
pub trait VirtualGroupManager: Send + Sync {
    /// Picks the best-ranked SP passing `filter`, or
    /// [`Error::NoEligibleSp`](crate::Error::NoEligibleSp).
    fn pick_sp_by_filter(&self, filter: &PickDestSpFilter) -> Result<StorageProvider>;

    /// Looks up an SP by ID.
    fn query_sp_by_id(&self, sp_id: SpId) -> Result<StorageProvider>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slice_filter_rejects_exactly_the_excluded() {
        let filter = PickDestSpFilter::from_slice(&[SpId::new(1), SpId::new(3)]);
        assert!(!filter.check(SpId::new(1)));
        assert!(filter.check(SpId::new(2)));
        assert!(!filter.check(SpId::new(3)));
    }

    #[test]
    fn map_filter_ignores_multiplicity() {
        let mut map = BTreeMap::new();
        map.insert(SpId::new(2), 5);
        map.insert(SpId::new(4), 1);
        let filter = PickDestSpFilter::from_multiplicity_map(&map);
        assert!(!filter.check(SpId::new(2)));
        assert!(!filter.check(SpId::new(4)));
        assert!(filter.check(SpId::new(5)));
    }

    #[test]
    fn also_exclude_extends_the_set() {
        let filter = PickDestSpFilter::from_slice(&[SpId::new(2)]).also_exclude(SpId::new(1));
        assert!(!filter.check(SpId::new(1)));
        assert!(!filter.check(SpId::new(2)));
        assert!(filter.check(SpId::new(3)));
    }

    #[test]
    fn empty_filter_accepts_everything() {
        let filter = PickDestSpFilter::default();
        assert!(filter.check(SpId::new(7)));
    }
}
