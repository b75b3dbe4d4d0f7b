//! # Memory Manager
//!
//! Owns the backend, the registry and both lifecycle pools of a receiver.
//!
//! ```text
//!   allocate ──► backend ──► registry ──► owner (stream, heap, scratch, tag)
//!                                             │
//!                              store(kind, task count)
//!                                             ▼
//!                     ┌──────────────┬──────────────┐
//!                     │  TEMPORARY   │   REUSABLE   │
//!                     └──────┬───────┴──────┬───────┘
//!        clean_allocation_list│             │obtain_reusable
//!                             ▼             ▼
//!                          backend       new owner
//! ```

use kiln_core::{
    AllocationRequest, AllocationType, ByteSize, MemoryBackend, Result, TaskCount,
};
use log::{debug, trace};

use crate::allocation::GraphicsAllocation;
use crate::pool::{AllocationList, PoolKind};
use crate::registry::{AllocationId, AllocationRegistry};

/// Memory manager statistics
#[derive(Debug, Clone, Default)]
pub struct MemoryStats {
    /// Backend allocations
    pub allocations: u64,
    /// Backend frees
    pub frees: u64,
    /// Requests served from the reusable pool
    pub reused: u64,
    /// Bytes currently allocated from the backend
    pub bytes_allocated: u64,
}

/// Allocation owner of one receiver
#[derive(Debug)]
pub struct MemoryManager<B> {
    backend: B,
    registry: AllocationRegistry,
    temporary: AllocationList,
    reusable: AllocationList,
    stats: MemoryStats,
}

impl<B: MemoryBackend> MemoryManager<B> {
    /// Create a manager over a backend
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            registry: AllocationRegistry::new(),
            temporary: AllocationList::new(PoolKind::Temporary),
            reusable: AllocationList::new(PoolKind::Reusable),
            stats: MemoryStats::default(),
        }
    }

    /// Allocate fresh memory from the backend
    pub fn allocate(&mut self, request: &AllocationRequest) -> Result<AllocationId> {
        let gpu_addr = self.backend.allocate(request)?;
        let allocation =
            GraphicsAllocation::new(gpu_addr, request.size, request.allocation_type, request.flags);

        self.stats.allocations += 1;
        self.stats.bytes_allocated += request.size.as_bytes();
        trace!(
            "allocated {:?} {} at {}",
            request.allocation_type,
            request.size,
            gpu_addr
        );
        Ok(self.registry.insert(allocation))
    }

    /// Return an allocation to the backend
    pub fn free(&mut self, id: AllocationId) -> Result<()> {
        let allocation = self.registry.remove(id)?;
        self.backend.free(allocation.gpu_addr(), allocation.size());

        self.stats.frees += 1;
        self.stats.bytes_allocated -= allocation.size().as_bytes();
        Ok(())
    }

    /// Memory budget reported by the backend
    pub fn budget(&self) -> ByteSize {
        self.backend.budget()
    }

    /// Get a completed allocation from the reusable pool, or allocate
    pub fn obtain_reusable(
        &mut self,
        min_size: ByteSize,
        allocation_type: AllocationType,
        completed: TaskCount,
    ) -> Result<AllocationId> {
        if let Some(id) =
            self.reusable
                .detach_reusable(&self.registry, min_size, allocation_type, completed)
        {
            self.stats.reused += 1;
            return Ok(id);
        }
        self.allocate(&AllocationRequest::new(min_size, allocation_type))
    }

    /// Hand an allocation to a pool, protected until `task_count` completes
    pub fn store(&mut self, id: AllocationId, kind: PoolKind, task_count: TaskCount) -> Result<()> {
        let allocation = self.registry.get_mut(id)?;
        allocation.update_task_count(task_count);
        match kind {
            PoolKind::Temporary => self.temporary.push(id),
            PoolKind::Reusable => self.reusable.push(id),
        }
        Ok(())
    }

    /// Free every allocation of a pool whose task count is at most `threshold`
    pub fn clean_allocation_list(&mut self, threshold: TaskCount, kind: PoolKind) -> Result<usize> {
        let done = match kind {
            PoolKind::Temporary => self.temporary.drain_completed(&self.registry, threshold),
            PoolKind::Reusable => self.reusable.drain_completed(&self.registry, threshold),
        };
        for id in &done {
            self.free(*id)?;
        }
        if !done.is_empty() {
            debug!("freed {} {:?} allocations at task count {}", done.len(), kind, threshold);
        }
        Ok(done.len())
    }

    /// Free every pooled allocation regardless of task count
    pub fn drain_pools(&mut self) -> Result<usize> {
        let mut freed = 0;
        for id in self.temporary.drain_all() {
            self.free(id)?;
            freed += 1;
        }
        for id in self.reusable.drain_all() {
            self.free(id)?;
            freed += 1;
        }
        Ok(freed)
    }

    /// Pool of the given kind
    pub fn pool(&self, kind: PoolKind) -> &AllocationList {
        match kind {
            PoolKind::Temporary => &self.temporary,
            PoolKind::Reusable => &self.reusable,
        }
    }

    /// Registry
    pub fn registry(&self) -> &AllocationRegistry {
        &self.registry
    }

    /// Registry, mutably
    pub fn registry_mut(&mut self) -> &mut AllocationRegistry {
        &mut self.registry
    }

    /// Backend
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Backend, mutably
    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Registry and backend at once, for submitting registry-owned bytes
    pub fn split(&mut self) -> (&AllocationRegistry, &mut B) {
        (&self.registry, &mut self.backend)
    }

    /// Consume the manager, returning the backend
    ///
    /// Allocations still registered are not freed.
    pub fn into_backend(self) -> B {
        self.backend
    }

    /// Get statistics
    pub fn stats(&self) -> &MemoryStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;
    use kiln_core::{Error, GpuAddr};

    #[derive(Debug, Default)]
    struct Bump {
        next: u64,
        freed: Vec<GpuAddr>,
        fail: bool,
    }

    impl MemoryBackend for Bump {
        fn allocate(&mut self, request: &AllocationRequest) -> Result<GpuAddr> {
            if self.fail {
                return Err(Error::OutOfMemory);
            }
            self.next += 0x10000;
            let _ = request;
            Ok(GpuAddr::new(self.next))
        }

        fn free(&mut self, gpu_addr: GpuAddr, _size: ByteSize) {
            self.freed.push(gpu_addr);
        }

        fn budget(&self) -> ByteSize {
            ByteSize::from_mib(64)
        }
    }

    #[test]
    fn test_allocate_and_free() {
        let mut memory = MemoryManager::new(Bump::default());
        let id = memory
            .allocate(&AllocationRequest::new(ByteSize::KIB_4, AllocationType::Buffer))
            .unwrap();
        assert_eq!(memory.stats().bytes_allocated, 4096);
        memory.free(id).unwrap();
        assert_eq!(memory.backend().freed.len(), 1);
        assert_eq!(memory.free(id), Err(Error::StaleAllocation));
    }

    #[test]
    fn test_allocation_failure_propagates() {
        let mut memory = MemoryManager::new(Bump {
            fail: true,
            ..Bump::default()
        });
        let result = memory.allocate(&AllocationRequest::new(ByteSize::KIB_4, AllocationType::Buffer));
        assert_eq!(result, Err(Error::OutOfMemory));
    }

    #[test]
    fn test_cleanup_never_frees_pending() {
        let mut memory = MemoryManager::new(Bump::default());
        let mut ids = Vec::new();
        for task_count in [7, 2, 9, 4, 4, 1] {
            let id = memory
                .allocate(&AllocationRequest::new(ByteSize::KIB_4, AllocationType::Scratch))
                .unwrap();
            memory.store(id, PoolKind::Temporary, task_count).unwrap();
            ids.push((id, task_count));
        }

        let freed = memory.clean_allocation_list(4, PoolKind::Temporary).unwrap();
        assert_eq!(freed, 4);
        for (id, task_count) in ids {
            assert_eq!(memory.registry().contains(id), task_count > 4);
        }
    }

    #[test]
    fn test_obtain_reusable() {
        let mut memory = MemoryManager::new(Bump::default());
        let id = memory
            .allocate(&AllocationRequest::new(ByteSize::KIB_64, AllocationType::CommandBuffer))
            .unwrap();
        memory.store(id, PoolKind::Reusable, 3).unwrap();

        // Not complete yet, backend allocates
        let fresh = memory
            .obtain_reusable(ByteSize::KIB_4, AllocationType::CommandBuffer, 2)
            .unwrap();
        assert_ne!(fresh, id);

        let reused = memory
            .obtain_reusable(ByteSize::KIB_4, AllocationType::CommandBuffer, 3)
            .unwrap();
        assert_eq!(reused, id);
        assert_eq!(memory.stats().reused, 1);
        assert!(memory.pool(PoolKind::Reusable).is_empty());
    }

    #[test]
    fn test_drain_pools() {
        let mut memory = MemoryManager::new(Bump::default());
        for kind in [PoolKind::Temporary, PoolKind::Reusable] {
            let id = memory
                .allocate(&AllocationRequest::new(ByteSize::KIB_4, AllocationType::Scratch))
                .unwrap();
            memory.store(id, kind, 100).unwrap();
        }
        assert_eq!(memory.drain_pools().unwrap(), 2);
        assert!(memory.registry().is_empty());
    }
}
