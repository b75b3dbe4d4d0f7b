//! # KILN Backend Traits
//!
//! Capabilities the submission engine consumes from the platform.
//!
//! ## Trait Hierarchy
//!
//! ```text
//! DeviceBackend
//!    │
//!    ├── MemoryBackend      (allocate, free, budget)
//!    │
//!    └── SubmissionBackend  (submit chain, wait, completed task count)
//! ```
//!
//! Receivers are generic over these traits, so the hot path is monomorphized.

use crate::error::Result;
use crate::flags::ThrottleLevel;
use crate::memory::{AllocationRequest, ResidentRange};
use crate::sync::FlushStamp;
use crate::types::*;

// =============================================================================
// MEMORY BACKEND
// =============================================================================

/// Allocates GPU-visible memory
pub trait MemoryBackend {
    /// Allocate memory and return its GPU address
    fn allocate(&mut self, request: &AllocationRequest) -> Result<GpuAddr>;

    /// Free memory previously returned by [`MemoryBackend::allocate`]
    fn free(&mut self, gpu_addr: GpuAddr, size: ByteSize);

    /// Memory budget the device can keep resident at once
    fn budget(&self) -> ByteSize;
}

// =============================================================================
// SUBMISSION BACKEND
// =============================================================================

/// One fragment of a chained submission
#[derive(Debug, Clone, Copy)]
pub struct ChainFragment<'a> {
    /// GPU address of the first byte
    pub gpu_addr: GpuAddr,
    /// Encoded commands, already patched to jump into the next fragment
    pub bytes: &'a [u8],
}

/// A physical submission
#[derive(Debug, Clone, Copy)]
pub struct Submission<'a> {
    /// Fragments in execution order, the first is the chain head
    pub fragments: &'a [ChainFragment<'a>],
    /// Memory that must be resident while the chain executes
    pub residency: &'a [ResidentRange],
    /// Task count written to the tag when the chain completes
    pub task_count: TaskCount,
    /// Target engine
    pub engine: EngineId,
    /// Low priority submission
    pub low_priority: bool,
    /// Throttle hint
    pub throttle: ThrottleLevel,
    /// Coherent memory access required
    pub requires_coherency: bool,
}

impl<'a> Submission<'a> {
    /// GPU address execution starts at
    pub fn head(&self) -> Option<GpuAddr> {
        self.fragments.first().map(|fragment| fragment.gpu_addr)
    }
}

/// Submits command buffer chains and waits for them
pub trait SubmissionBackend {
    /// Submit a chain, returning a token to wait on
    fn submit(&mut self, submission: &Submission<'_>) -> Result<FlushStamp>;

    /// Wait until the submission identified by `stamp` completes
    fn wait(&mut self, stamp: FlushStamp, timeout_ns: u64) -> Result<()>;

    /// Latest task count the device reported as complete
    fn completed_task_count(&self) -> TaskCount;
}

// =============================================================================
// DEVICE BACKEND
// =============================================================================

/// Everything a command stream receiver needs from the platform
pub trait DeviceBackend: MemoryBackend + SubmissionBackend {}

impl<T: MemoryBackend + SubmissionBackend> DeviceBackend for T {}
