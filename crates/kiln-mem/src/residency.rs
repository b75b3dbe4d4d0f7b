//! # Residency Set
//!
//! Per-submission set of allocations the device must be able to address.
//!
//! Toggles are idempotent: making an allocation resident twice for the same
//! submission adds it once. After a physical submission the set is handed
//! off, and allocations made non-resident while evictable become eviction
//! candidates for the backend.

use alloc::vec::Vec;

use hashbrown::HashSet;
use kiln_core::{ByteSize, EngineId, Error, Result, TaskCount};
use log::trace;

use crate::registry::{AllocationId, AllocationRegistry};

/// Residency statistics
#[derive(Debug, Clone, Default)]
pub struct ResidencyStats {
    /// Allocations added to a set
    pub made_resident: u64,
    /// Redundant make-resident calls absorbed
    pub redundant: u64,
    /// Allocations made non-resident
    pub made_non_resident: u64,
    /// Allocations queued for eviction
    pub evictions: u64,
}

/// Allocations resident for the next submission of one engine
#[derive(Debug)]
pub struct ResidencySet {
    engine: EngineId,
    surfaces: Vec<AllocationId>,
    members: HashSet<AllocationId>,
    eviction: Vec<AllocationId>,
    footprint: ByteSize,
    stats: ResidencyStats,
}

impl ResidencySet {
    /// Create an empty set for an engine
    pub fn new(engine: EngineId) -> Self {
        Self {
            engine,
            surfaces: Vec::new(),
            members: HashSet::new(),
            eviction: Vec::new(),
            footprint: ByteSize::ZERO,
            stats: ResidencyStats::default(),
        }
    }

    /// Add an allocation for the submission with `task_count`
    pub fn make_resident(
        &mut self,
        registry: &mut AllocationRegistry,
        id: AllocationId,
        task_count: TaskCount,
    ) -> Result<()> {
        let allocation = registry.get_mut(id)?;

        if allocation.is_residency_task_count_below(task_count) {
            allocation.update_task_count(task_count);
            allocation.set_resident(self.engine, true);
            if self.members.insert(id) {
                self.footprint = self.footprint + allocation.size();
                self.surfaces.push(id);
            }
            self.stats.made_resident += 1;
            trace!("resident {:?} for task {}", id, task_count);
        } else {
            self.stats.redundant += 1;
        }
        allocation.update_residency_task_count(task_count);
        Ok(())
    }

    /// Drop an allocation's residency and remove it from the set
    pub fn make_non_resident(
        &mut self,
        registry: &mut AllocationRegistry,
        id: AllocationId,
    ) -> Result<()> {
        let size = self.release(registry, id)?;
        if self.members.remove(&id) {
            self.surfaces.retain(|surface| *surface != id);
            self.footprint =
                ByteSize::from_bytes(self.footprint.as_bytes().saturating_sub(size.as_bytes()));
        }
        Ok(())
    }

    /// Release residency of every allocation of a finished submission
    ///
    /// Membership of the set being built for the next submission is left
    /// untouched.
    pub fn make_surface_pack_non_resident(
        &mut self,
        registry: &mut AllocationRegistry,
        surfaces: &[AllocationId],
    ) -> Result<()> {
        for id in surfaces {
            match self.release(registry, *id) {
                // Freed while in flight, nothing to release
                Err(Error::StaleAllocation) => {}
                other => {
                    other?;
                }
            }
        }
        Ok(())
    }

    /// Evictable allocations become eviction candidates, others are marked
    /// evictable for the next time.
    fn release(&mut self, registry: &mut AllocationRegistry, id: AllocationId) -> Result<ByteSize> {
        let allocation = registry.get_mut(id)?;

        if allocation.is_resident(self.engine) {
            if allocation.is_evictable() {
                self.eviction.push(id);
                self.stats.evictions += 1;
            } else {
                allocation.set_evictable(true);
            }
        }
        allocation.release_residency(self.engine);

        self.stats.made_non_resident += 1;
        trace!("non-resident {:?}", id);
        Ok(allocation.size())
    }

    /// Hand off the current set, leaving it empty
    pub fn take_surfaces(&mut self) -> Vec<AllocationId> {
        self.members.clear();
        self.footprint = ByteSize::ZERO;
        core::mem::take(&mut self.surfaces)
    }

    /// Hand off the eviction candidates
    pub fn take_eviction_candidates(&mut self) -> Vec<AllocationId> {
        core::mem::take(&mut self.eviction)
    }

    /// Current members in insertion order
    pub fn surfaces(&self) -> &[AllocationId] {
        &self.surfaces
    }

    /// Check membership
    pub fn contains(&self, id: AllocationId) -> bool {
        self.members.contains(&id)
    }

    /// Total size of the current members
    pub fn footprint(&self) -> ByteSize {
        self.footprint
    }

    /// Engine this set is for
    pub fn engine(&self) -> EngineId {
        self.engine
    }

    /// Get statistics
    pub fn stats(&self) -> &ResidencyStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::GraphicsAllocation;
    use kiln_core::{AllocationType, GpuAddr};

    fn insert(registry: &mut AllocationRegistry, allocation_type: AllocationType) -> AllocationId {
        registry.insert(GraphicsAllocation::new(
            GpuAddr::new(0x1000 * (registry.len() as u64 + 1)),
            ByteSize::KIB_4,
            allocation_type,
            allocation_type.default_flags(),
        ))
    }

    #[test]
    fn test_make_resident_is_idempotent() {
        let mut registry = AllocationRegistry::new();
        let mut set = ResidencySet::new(EngineId::new(0));
        let id = insert(&mut registry, AllocationType::Buffer);

        set.make_resident(&mut registry, id, 1).unwrap();
        set.make_resident(&mut registry, id, 1).unwrap();

        assert_eq!(set.surfaces(), &[id]);
        assert_eq!(set.footprint(), ByteSize::KIB_4);
        assert_eq!(set.stats().redundant, 1);
        assert_eq!(registry.get(id).unwrap().task_count(), 1);
    }

    #[test]
    fn test_non_resident_eviction_rules() {
        let mut registry = AllocationRegistry::new();
        let mut set = ResidencySet::new(EngineId::new(0));
        let buffer = insert(&mut registry, AllocationType::Buffer);
        let heap = insert(&mut registry, AllocationType::SurfaceStateHeap);

        set.make_resident(&mut registry, buffer, 1).unwrap();
        set.make_resident(&mut registry, heap, 1).unwrap();
        let surfaces = set.take_surfaces();
        set.make_surface_pack_non_resident(&mut registry, &surfaces).unwrap();

        // Evictable buffer is queued, the heap only becomes evictable
        assert_eq!(set.take_eviction_candidates(), alloc::vec![buffer]);
        assert!(registry.get(heap).unwrap().is_evictable());
        assert!(!registry.get(heap).unwrap().is_resident(EngineId::new(0)));

        // Not resident anymore, nothing new to evict
        set.make_non_resident(&mut registry, buffer).unwrap();
        assert!(set.take_eviction_candidates().is_empty());
    }

    #[test]
    fn test_non_resident_leaves_set() {
        let mut registry = AllocationRegistry::new();
        let mut set = ResidencySet::new(EngineId::new(0));
        let a = insert(&mut registry, AllocationType::Scratch);
        let b = insert(&mut registry, AllocationType::Scratch);

        set.make_resident(&mut registry, a, 2).unwrap();
        set.make_resident(&mut registry, b, 2).unwrap();
        set.make_non_resident(&mut registry, a).unwrap();

        assert!(!set.contains(a));
        assert_eq!(set.surfaces(), &[b]);
        assert_eq!(set.footprint(), ByteSize::KIB_4);

        // Released residency can be re-added for the same task
        set.make_resident(&mut registry, a, 2).unwrap();
        assert!(set.contains(a));
    }

    #[test]
    fn test_next_submission_re_adds() {
        let mut registry = AllocationRegistry::new();
        let mut set = ResidencySet::new(EngineId::new(0));
        let a = insert(&mut registry, AllocationType::TagBuffer);

        set.make_resident(&mut registry, a, 1).unwrap();
        assert_eq!(set.take_surfaces().len(), 1);
        set.make_resident(&mut registry, a, 2).unwrap();
        assert_eq!(set.surfaces(), &[a]);
    }
}
