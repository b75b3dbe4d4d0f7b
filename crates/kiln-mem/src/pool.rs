//! # Allocation Lifecycle Pools
//!
//! Allocations the receiver no longer references directly but the device may
//! still be reading. An allocation leaves its pool only once its task count
//! has been reached.
//!
//! - TEMPORARY: freed as soon as it completes (replaced heaps, old scratch)
//! - REUSABLE: handed back to new requests of the same type (old streams)

use alloc::vec::Vec;

use kiln_core::{AllocationType, ByteSize, TaskCount};

use crate::registry::{AllocationId, AllocationRegistry};

// =============================================================================
// POOL KIND
// =============================================================================

/// Which pool an allocation is stored in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    /// Freed once complete
    Temporary,
    /// Reused once complete
    Reusable,
}

// =============================================================================
// ALLOCATION LIST
// =============================================================================

/// Pool statistics
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Allocations stored
    pub stored: u64,
    /// Allocations handed back to a request
    pub reused: u64,
    /// Allocations released for freeing
    pub released: u64,
    /// High water mark of pooled allocations
    pub peak_len: usize,
}

/// Ordered list of pooled allocations
#[derive(Debug)]
pub struct AllocationList {
    kind: PoolKind,
    entries: Vec<AllocationId>,
    stats: PoolStats,
}

impl AllocationList {
    /// Create an empty list
    pub fn new(kind: PoolKind) -> Self {
        Self {
            kind,
            entries: Vec::new(),
            stats: PoolStats::default(),
        }
    }

    /// Pool kind
    pub fn kind(&self) -> PoolKind {
        self.kind
    }

    /// Add an allocation
    pub fn push(&mut self, id: AllocationId) {
        self.entries.push(id);
        self.stats.stored += 1;
        self.stats.peak_len = self.stats.peak_len.max(self.entries.len());
    }

    /// Detach a completed allocation of `allocation_type` with at least `min_size` bytes
    pub fn detach_reusable(
        &mut self,
        registry: &AllocationRegistry,
        min_size: ByteSize,
        allocation_type: AllocationType,
        completed: TaskCount,
    ) -> Option<AllocationId> {
        let position = self.entries.iter().position(|id| {
            registry.get(*id).is_ok_and(|alloc| {
                alloc.allocation_type() == allocation_type
                    && alloc.size() >= min_size
                    && alloc.is_completed(completed)
            })
        })?;

        self.stats.reused += 1;
        Some(self.entries.remove(position))
    }

    /// Detach every allocation whose task count is at most `threshold`
    pub fn drain_completed(
        &mut self,
        registry: &AllocationRegistry,
        threshold: TaskCount,
    ) -> Vec<AllocationId> {
        let mut done = Vec::new();
        self.entries.retain(|id| match registry.get(*id) {
            Ok(alloc) if alloc.is_completed(threshold) => {
                done.push(*id);
                false
            }
            Ok(_) => true,
            // Already freed elsewhere, nothing left to track
            Err(_) => false,
        });
        self.stats.released += done.len() as u64;
        done
    }

    /// Detach everything
    pub fn drain_all(&mut self) -> Vec<AllocationId> {
        self.stats.released += self.entries.len() as u64;
        core::mem::take(&mut self.entries)
    }

    /// Check membership
    pub fn contains(&self, id: AllocationId) -> bool {
        self.entries.contains(&id)
    }

    /// Number of pooled allocations
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Get statistics
    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::GraphicsAllocation;
    use kiln_core::GpuAddr;

    fn insert(
        registry: &mut AllocationRegistry,
        size: ByteSize,
        allocation_type: AllocationType,
        task_count: TaskCount,
    ) -> AllocationId {
        let mut alloc = GraphicsAllocation::new(
            GpuAddr::new(0x10000 + registry.len() as u64 * 0x10000),
            size,
            allocation_type,
            allocation_type.default_flags(),
        );
        alloc.update_task_count(task_count);
        registry.insert(alloc)
    }

    #[test]
    fn test_drain_respects_threshold() {
        let mut registry = AllocationRegistry::new();
        let mut list = AllocationList::new(PoolKind::Temporary);
        let ids: Vec<_> = [3, 1, 5, 2]
            .iter()
            .map(|tc| insert(&mut registry, ByteSize::KIB_4, AllocationType::Scratch, *tc))
            .collect();
        for id in &ids {
            list.push(*id);
        }

        let done = list.drain_completed(&registry, 2);
        assert_eq!(done, alloc::vec![ids[1], ids[3]]);
        assert_eq!(list.len(), 2);
        for id in done {
            assert!(registry.get(id).map_or(false, |a| a.task_count() <= 2));
        }
    }

    #[test]
    fn test_detach_reusable_matches_type_and_size() {
        let mut registry = AllocationRegistry::new();
        let mut list = AllocationList::new(PoolKind::Reusable);
        let small = insert(&mut registry, ByteSize::KIB_4, AllocationType::CommandBuffer, 1);
        let heap = insert(&mut registry, ByteSize::KIB_64, AllocationType::SurfaceStateHeap, 1);
        let big = insert(&mut registry, ByteSize::KIB_64, AllocationType::CommandBuffer, 4);
        list.push(small);
        list.push(heap);
        list.push(big);

        let request = ByteSize::from_kib(16);
        assert_eq!(
            list.detach_reusable(&registry, request, AllocationType::CommandBuffer, 3),
            None
        );
        assert_eq!(
            list.detach_reusable(&registry, request, AllocationType::CommandBuffer, 4),
            Some(big)
        );
        assert_eq!(list.stats().reused, 1);
        assert!(list.contains(small));
    }
}
