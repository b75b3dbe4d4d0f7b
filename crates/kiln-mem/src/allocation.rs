//! # Graphics Allocation
//!
//! A GPU-visible allocation with its CPU view and the bookkeeping the
//! receiver needs to decide when it is safe to reuse or free.

use alloc::vec;
use alloc::vec::Vec;

use kiln_core::{AllocationFlags, AllocationType, ByteSize, EngineId, GpuAddr, TaskCount};

// =============================================================================
// GRAPHICS ALLOCATION
// =============================================================================

/// GPU-visible allocation owned by an [`AllocationRegistry`](crate::AllocationRegistry)
#[derive(Debug)]
pub struct GraphicsAllocation {
    /// GPU address
    gpu_addr: GpuAddr,
    /// Size
    size: ByteSize,
    /// Type tag
    allocation_type: AllocationType,
    /// Properties
    flags: AllocationFlags,
    /// CPU view, empty unless CPU_MAPPED
    memory: Vec<u8>,
    /// One bit per engine the allocation is resident on
    resident_engines: u32,
    /// Last task count that used the allocation
    task_count: TaskCount,
    /// Last submission the allocation was added to a residency set for
    residency_task_count: Option<TaskCount>,
    /// Backend may page the allocation out
    evictable: bool,
}

impl GraphicsAllocation {
    /// Wrap memory the backend returned
    pub fn new(
        gpu_addr: GpuAddr,
        size: ByteSize,
        allocation_type: AllocationType,
        flags: AllocationFlags,
    ) -> Self {
        let memory = if flags.contains(AllocationFlags::CPU_MAPPED) {
            vec![0u8; size.as_usize()]
        } else {
            Vec::new()
        };

        Self {
            gpu_addr,
            size,
            allocation_type,
            flags,
            memory,
            resident_engines: 0,
            task_count: 0,
            residency_task_count: None,
            evictable: flags.contains(AllocationFlags::EVICTABLE),
        }
    }

    /// GPU address
    pub fn gpu_addr(&self) -> GpuAddr {
        self.gpu_addr
    }

    /// Size
    pub fn size(&self) -> ByteSize {
        self.size
    }

    /// Type tag
    pub fn allocation_type(&self) -> AllocationType {
        self.allocation_type
    }

    /// Properties
    pub fn flags(&self) -> AllocationFlags {
        self.flags
    }

    /// CPU view of the contents
    pub fn cpu_view(&self) -> &[u8] {
        &self.memory
    }

    /// Mutable CPU view of the contents
    pub fn cpu_view_mut(&mut self) -> &mut [u8] {
        &mut self.memory
    }

    /// Check residency on an engine
    pub fn is_resident(&self, engine: EngineId) -> bool {
        self.resident_engines & engine.mask() != 0
    }

    /// Set residency on an engine
    pub fn set_resident(&mut self, engine: EngineId, resident: bool) {
        if resident {
            self.resident_engines |= engine.mask();
        } else {
            self.resident_engines &= !engine.mask();
        }
    }

    /// Last task count that used the allocation
    pub fn task_count(&self) -> TaskCount {
        self.task_count
    }

    /// Record a use by `task_count`
    pub fn update_task_count(&mut self, task_count: TaskCount) {
        self.task_count = task_count;
    }

    /// Whether the allocation was not yet added for `task_count`
    pub fn is_residency_task_count_below(&self, task_count: TaskCount) -> bool {
        self.residency_task_count.map_or(true, |current| current < task_count)
    }

    /// Record the submission the allocation was made resident for
    pub fn update_residency_task_count(&mut self, task_count: TaskCount) {
        self.residency_task_count = Some(task_count);
    }

    /// Drop residency on an engine
    pub fn release_residency(&mut self, engine: EngineId) {
        self.set_resident(engine, false);
        self.residency_task_count = None;
    }

    /// Check if evictable
    pub fn is_evictable(&self) -> bool {
        self.evictable
    }

    /// Set evictable
    pub fn set_evictable(&mut self, evictable: bool) {
        self.evictable = evictable;
    }

    /// Whether the allocation can be freed once `completed` is reached
    pub fn is_completed(&self, completed: TaskCount) -> bool {
        self.task_count <= completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer() -> GraphicsAllocation {
        GraphicsAllocation::new(
            GpuAddr::new(0x1000),
            ByteSize::KIB_4,
            AllocationType::Buffer,
            AllocationType::Buffer.default_flags(),
        )
    }

    #[test]
    fn test_cpu_view() {
        let mut alloc = buffer();
        assert_eq!(alloc.cpu_view().len(), 4096);
        alloc.cpu_view_mut()[0] = 0xAB;
        assert_eq!(alloc.cpu_view()[0], 0xAB);

        let scratch = GraphicsAllocation::new(
            GpuAddr::new(0x2000),
            ByteSize::from_mib(1),
            AllocationType::Scratch,
            AllocationType::Scratch.default_flags(),
        );
        assert!(scratch.cpu_view().is_empty());
    }

    #[test]
    fn test_residency_task_count() {
        let mut alloc = buffer();
        let engine = EngineId::new(1);
        assert!(alloc.is_residency_task_count_below(1));
        alloc.update_residency_task_count(1);
        alloc.set_resident(engine, true);
        assert!(!alloc.is_residency_task_count_below(1));
        assert!(alloc.is_residency_task_count_below(2));
        assert!(alloc.is_resident(engine));
        assert!(!alloc.is_resident(EngineId::new(0)));

        alloc.release_residency(engine);
        assert!(!alloc.is_resident(engine));
        assert!(alloc.is_residency_task_count_below(1));
    }

    #[test]
    fn test_completed() {
        let mut alloc = buffer();
        alloc.update_task_count(5);
        assert!(!alloc.is_completed(4));
        assert!(alloc.is_completed(5));
    }
}
