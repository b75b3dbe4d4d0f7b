//! # KILN Memory Management
//!
//! GPU-visible allocations, residency and allocation lifecycle.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      KILN Memory System                         │
//! │                                                                 │
//! │  ┌───────────────────────────────────────────────────────────┐  │
//! │  │                     Memory Manager                        │  │
//! │  │          (backend allocate / free / budget)               │  │
//! │  └───────────────────────────────────────────────────────────┘  │
//! │                              │                                  │
//! │  ┌─────────────────┐  ┌──────┴──────┐  ┌────────────────────┐   │
//! │  │   Allocation    │  │  Lifecycle  │  │    Residency       │   │
//! │  │   Registry      │  │   Pools     │  │      Set           │   │
//! │  └─────────────────┘  └─────────────┘  └────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Reclamation
//!
//! Every allocation carries the task count of its last use. Pooled
//! allocations are freed or reused only once the receiver has confirmed that
//! task count reached the device, never when work is merely recorded.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

#[cfg(feature = "std")]
extern crate std;

pub mod allocation;
pub mod manager;
pub mod pool;
pub mod registry;
pub mod residency;

// Re-exports
pub use allocation::GraphicsAllocation;
pub use manager::{MemoryManager, MemoryStats};
pub use pool::{AllocationList, PoolKind, PoolStats};
pub use registry::{AllocationId, AllocationRegistry, RegistryStats};
pub use residency::{ResidencySet, ResidencyStats};
