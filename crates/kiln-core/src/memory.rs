//! # Allocation Descriptors
//!
//! Type tags and usage flags of GPU-visible allocations, shared by the
//! backend traits and the allocation registry.

use crate::types::*;

// =============================================================================
// ALLOCATION TYPE
// =============================================================================

/// What an allocation is used for
///
/// Pools only hand an allocation back to a request of the same type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocationType {
    /// Receiver-owned or task command buffer
    CommandBuffer,
    /// Dynamic state heap
    DynamicStateHeap,
    /// Indirect object heap
    IndirectObjectHeap,
    /// Surface state heap
    SurfaceStateHeap,
    /// Kernel instruction heap
    InstructionHeap,
    /// Completion tag written by the device
    TagBuffer,
    /// Per-thread scratch space
    Scratch,
    /// User buffer or image backing store
    Buffer,
}

impl AllocationType {
    /// Whether the allocation is one of the three indirect heaps
    pub const fn is_indirect_heap(self) -> bool {
        matches!(
            self,
            Self::DynamicStateHeap | Self::IndirectObjectHeap | Self::SurfaceStateHeap
        )
    }

    /// Default flags for allocations of this type
    pub const fn default_flags(self) -> AllocationFlags {
        match self {
            Self::CommandBuffer | Self::InstructionHeap => AllocationFlags::CPU_MAPPED,
            Self::TagBuffer => AllocationFlags::CPU_MAPPED.union(AllocationFlags::UNCACHED),
            Self::DynamicStateHeap | Self::IndirectObjectHeap | Self::SurfaceStateHeap => {
                AllocationFlags::CPU_MAPPED
            }
            Self::Scratch => AllocationFlags::empty(),
            Self::Buffer => AllocationFlags::CPU_MAPPED.union(AllocationFlags::EVICTABLE),
        }
    }
}

bitflags::bitflags! {
    /// Allocation properties
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AllocationFlags: u32 {
        /// CPU keeps a mapping of the contents
        const CPU_MAPPED = 1 << 0;
        /// Device access is uncached
        const UNCACHED = 1 << 1;
        /// Backend may page the allocation out once it is not resident
        const EVICTABLE = 1 << 2;
    }
}

// =============================================================================
// ALLOCATION REQUEST
// =============================================================================

/// Backend allocation request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationRequest {
    /// Size in bytes
    pub size: ByteSize,
    /// Type tag
    pub allocation_type: AllocationType,
    /// Requested properties
    pub flags: AllocationFlags,
}

impl AllocationRequest {
    /// Request with the type's default flags
    pub const fn new(size: ByteSize, allocation_type: AllocationType) -> Self {
        Self {
            size,
            allocation_type,
            flags: allocation_type.default_flags(),
        }
    }
}

/// Memory range made resident for one submission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResidentRange {
    /// Start address
    pub gpu_addr: GpuAddr,
    /// Size
    pub size: ByteSize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_flags() {
        let request = AllocationRequest::new(ByteSize::KIB_4, AllocationType::Buffer);
        assert!(request.flags.contains(AllocationFlags::EVICTABLE));
        assert!(!AllocationType::TagBuffer
            .default_flags()
            .contains(AllocationFlags::EVICTABLE));
        assert!(AllocationType::SurfaceStateHeap.is_indirect_heap());
        assert!(!AllocationType::Scratch.is_indirect_heap());
    }
}
