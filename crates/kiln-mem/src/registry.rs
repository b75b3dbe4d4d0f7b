//! # Allocation Registry
//!
//! Generational arena owning every allocation of a receiver.
//!
//! Other components refer to allocations by [`AllocationId`]. Using an id
//! after its allocation was removed yields [`Error::StaleAllocation`] even if
//! the slot has been reused.

use alloc::vec::Vec;

use kiln_core::{ByteSize, Error, Handle, Result};

use crate::allocation::GraphicsAllocation;

/// Handle to a registered allocation
pub type AllocationId = Handle<GraphicsAllocation>;

#[derive(Debug)]
struct Slot {
    generation: u32,
    entry: Option<GraphicsAllocation>,
}

/// Registry statistics
#[derive(Debug, Clone, Default)]
pub struct RegistryStats {
    /// Allocations registered
    pub inserted: u64,
    /// Allocations removed
    pub removed: u64,
    /// Bytes currently registered
    pub bytes_live: u64,
}

/// Generational arena of allocations
#[derive(Debug, Default)]
pub struct AllocationRegistry {
    slots: Vec<Slot>,
    free_slots: Vec<u32>,
    live: usize,
    stats: RegistryStats,
}

impl AllocationRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of an allocation
    pub fn insert(&mut self, allocation: GraphicsAllocation) -> AllocationId {
        self.stats.inserted += 1;
        self.stats.bytes_live += allocation.size().as_bytes();
        self.live += 1;

        if let Some(index) = self.free_slots.pop() {
            let slot = &mut self.slots[index as usize];
            slot.entry = Some(allocation);
            return AllocationId::new(index, slot.generation);
        }

        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            entry: Some(allocation),
        });
        AllocationId::new(index, 0)
    }

    /// Look up an allocation
    pub fn get(&self, id: AllocationId) -> Result<&GraphicsAllocation> {
        self.slots
            .get(id.index() as usize)
            .filter(|slot| slot.generation == id.generation())
            .and_then(|slot| slot.entry.as_ref())
            .ok_or(Error::StaleAllocation)
    }

    /// Look up an allocation mutably
    pub fn get_mut(&mut self, id: AllocationId) -> Result<&mut GraphicsAllocation> {
        self.slots
            .get_mut(id.index() as usize)
            .filter(|slot| slot.generation == id.generation())
            .and_then(|slot| slot.entry.as_mut())
            .ok_or(Error::StaleAllocation)
    }

    /// Remove an allocation, invalidating its id
    pub fn remove(&mut self, id: AllocationId) -> Result<GraphicsAllocation> {
        let slot = self
            .slots
            .get_mut(id.index() as usize)
            .filter(|slot| slot.generation == id.generation())
            .ok_or(Error::StaleAllocation)?;
        let allocation = slot.entry.take().ok_or(Error::StaleAllocation)?;

        slot.generation = slot.generation.wrapping_add(1);
        self.free_slots.push(id.index());
        self.live -= 1;
        self.stats.removed += 1;
        self.stats.bytes_live -= allocation.size().as_bytes();
        Ok(allocation)
    }

    /// Check if an id is live
    pub fn contains(&self, id: AllocationId) -> bool {
        self.get(id).is_ok()
    }

    /// Number of live allocations
    pub fn len(&self) -> usize {
        self.live
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Total size of the given allocations, skipping stale ids
    pub fn footprint(&self, ids: &[AllocationId]) -> ByteSize {
        ids.iter()
            .filter_map(|id| self.get(*id).ok())
            .fold(ByteSize::ZERO, |total, alloc| total + alloc.size())
    }

    /// Iterate over live allocations
    pub fn iter(&self) -> impl Iterator<Item = (AllocationId, &GraphicsAllocation)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.entry
                .as_ref()
                .map(|alloc| (AllocationId::new(index as u32, slot.generation), alloc))
        })
    }

    /// Get statistics
    pub fn stats(&self) -> &RegistryStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::{AllocationType, GpuAddr};

    fn alloc(addr: u64) -> GraphicsAllocation {
        GraphicsAllocation::new(
            GpuAddr::new(addr),
            ByteSize::KIB_4,
            AllocationType::Buffer,
            AllocationType::Buffer.default_flags(),
        )
    }

    #[test]
    fn test_insert_get_remove() {
        let mut registry = AllocationRegistry::new();
        let id = registry.insert(alloc(0x1000));
        assert_eq!(registry.get(id).map(|a| a.gpu_addr()), Ok(GpuAddr::new(0x1000)));
        assert_eq!(registry.len(), 1);

        let removed = registry.remove(id);
        assert!(removed.is_ok());
        assert!(registry.is_empty());
        assert_eq!(registry.get(id).err(), Some(Error::StaleAllocation));
        assert_eq!(registry.remove(id).err(), Some(Error::StaleAllocation));
    }

    #[test]
    fn test_slot_reuse_detects_stale() {
        let mut registry = AllocationRegistry::new();
        let first = registry.insert(alloc(0x1000));
        registry.remove(first).map(|_| ()).unwrap_or_default();
        let second = registry.insert(alloc(0x2000));

        assert_eq!(first.index(), second.index());
        assert!(!registry.contains(first));
        assert!(registry.contains(second));
    }

    #[test]
    fn test_footprint() {
        let mut registry = AllocationRegistry::new();
        let a = registry.insert(alloc(0x1000));
        let b = registry.insert(alloc(0x2000));
        assert_eq!(registry.footprint(&[a, b]), ByteSize::from_kib(8));
        assert_eq!(registry.stats().bytes_live, 8192);
        assert_eq!(registry.iter().count(), 2);
    }
}
