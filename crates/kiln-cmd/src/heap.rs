//! # Indirect Heaps
//!
//! The three auxiliary regions a task's commands reference: dynamic state,
//! indirect objects and surface state. Queues own their heaps; the receiver
//! only programs their base addresses.

use kiln_core::{AllocationType, GpuAddr};
use kiln_mem::AllocationId;

use crate::encoder::HeapBase;
use crate::stream::LinearStream;

/// Kind of indirect heap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeapKind {
    /// Dynamic state heap
    DynamicState,
    /// Indirect object heap
    IndirectObject,
    /// Surface state heap
    SurfaceState,
}

impl HeapKind {
    /// All heap kinds in programming order
    pub const ALL: [Self; 3] = [Self::DynamicState, Self::IndirectObject, Self::SurfaceState];

    /// Allocation type backing this heap
    pub const fn allocation_type(self) -> AllocationType {
        match self {
            Self::DynamicState => AllocationType::DynamicStateHeap,
            Self::IndirectObject => AllocationType::IndirectObjectHeap,
            Self::SurfaceState => AllocationType::SurfaceStateHeap,
        }
    }
}

/// An indirect heap
#[derive(Debug, Clone)]
pub struct IndirectHeap {
    kind: HeapKind,
    stream: LinearStream,
}

impl IndirectHeap {
    /// Heap over an allocation
    pub fn new(kind: HeapKind, allocation: AllocationId, gpu_base: GpuAddr, size: usize) -> Self {
        Self {
            kind,
            stream: LinearStream::new(allocation, gpu_base, size),
        }
    }

    /// Heap kind
    pub fn kind(&self) -> HeapKind {
        self.kind
    }

    /// Backing allocation
    pub fn allocation(&self) -> Option<AllocationId> {
        self.stream.allocation()
    }

    /// Cursor over the heap
    pub fn stream(&self) -> &LinearStream {
        &self.stream
    }

    /// Mutable cursor over the heap
    pub fn stream_mut(&mut self) -> &mut LinearStream {
        &mut self.stream
    }

    /// Base address and size as programmed by state base address
    pub fn base(&self) -> HeapBase {
        HeapBase {
            gpu_base: self.stream.gpu_base(),
            size: self.stream.max_size() as u32,
        }
    }
}
