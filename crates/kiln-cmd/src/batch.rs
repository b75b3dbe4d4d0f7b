//! # Batch Buffers
//!
//! A flushed task packaged for later submission.
//!
//! ```text
//!   receiver stream                 task stream
//!  ┌──────────────────────┐        ┌──────────────────────────────┐
//!  │ state ... BB_START ──┼───────►│ task bytes [barrier] BB_END  │
//!  └──────────────────────┘        └──────────────────────┬───────┘
//!                                                   tail ─┘
//! ```
//!
//! When records are chained the tail is rewritten into a jump to the next
//! record's head.

use alloc::vec::Vec;

use kiln_core::{ByteSize, GpuAddr, TaskCount, TaskLevel, ThrottleLevel};
use kiln_mem::AllocationId;

use crate::encoder::BarrierDesc;
use crate::stream::{StreamLocation, StreamRange};

/// A barrier written into a stream, with what it was encoded from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarrierSlot {
    /// Where it is
    pub location: StreamLocation,
    /// What it encodes
    pub desc: BarrierDesc,
}

/// Physical layout of one flushed task
#[derive(Debug, Clone)]
pub struct BatchBuffer {
    /// State commands in the receiver stream, ending in a jump to the task
    pub csr: Option<StreamRange>,
    /// Task commands, ending in the tail
    pub task: Option<StreamRange>,
    /// Batch buffer end, padded so it can become a batch buffer start
    pub tail: StreamLocation,
    /// Requires coherent memory
    pub requires_coherency: bool,
    /// Low priority
    pub low_priority: bool,
    /// Throttle hint
    pub throttle: ThrottleLevel,
}

impl BatchBuffer {
    /// Range execution starts in
    pub fn head(&self) -> Option<&StreamRange> {
        self.csr.as_ref().or(self.task.as_ref())
    }

    /// GPU address execution starts at
    pub fn head_addr(&self) -> Option<GpuAddr> {
        self.head().map(StreamRange::gpu_start)
    }

    /// Ranges in execution order
    pub fn ranges(&self) -> impl Iterator<Item = &StreamRange> {
        self.csr.iter().chain(self.task.iter())
    }
}

/// A recorded, not yet submitted task
#[derive(Debug, Clone)]
pub struct CommandBufferRecord {
    /// Layout
    pub batch: BatchBuffer,
    /// Allocations that must be resident
    pub surfaces: Vec<AllocationId>,
    /// Total size of `surfaces`
    pub footprint: ByteSize,
    /// Task count of the task
    pub task_count: TaskCount,
    /// Task level the task ran at
    pub task_level: TaskLevel,
    /// Task may overlap with same-level neighbours
    pub out_of_order: bool,
    /// Epilogue barrier that may be turned into a no-op
    pub elidable_barrier: Option<BarrierSlot>,
    /// Epilogue barrier, if any
    pub epilogue: Option<BarrierSlot>,
    /// The next record made the elidable barrier redundant
    pub elide_barrier: bool,
}

impl CommandBufferRecord {
    /// Whether `other` may share a physical submission with this record
    pub fn is_compatible(&self, other: &Self) -> bool {
        self.batch.requires_coherency == other.batch.requires_coherency
            && self.batch.low_priority == other.batch.low_priority
            && self.batch.throttle == other.batch.throttle
    }
}
