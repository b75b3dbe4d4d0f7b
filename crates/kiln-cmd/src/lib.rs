//! # KILN Command System
//!
//! Command stream receiver: state programming, batch packaging and
//! submission aggregation for one engine.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                    Command Submission Pipeline                    │
//! │                                                                   │
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────────┐     │
//! │  │  Task Stream │    │   Receiver   │    │   Submission     │     │
//! │  │  + Heaps     │───▶│ (state, tag, │───▶│   Aggregator     │     │
//! │  │  (Recording) │    │  residency)  │    │  (batched mode)  │     │
//! │  └──────────────┘    └──────┬───────┘    └────────┬─────────┘     │
//! │                             │ immediate           │ chains        │
//! │                             ▼                     ▼               │
//! │                      ┌──────────────────────────────────┐         │
//! │                      │        Submission Backend        │         │
//! │                      └──────────────────────────────────┘         │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Submission Flow
//!
//! 1. A queue records task commands into a task stream and its heaps
//! 2. `flush_task` prepends the dirty state into the receiver stream
//! 3. The task is submitted, or recorded for chaining
//! 4. The epilogue barrier writes the task count to the tag
//! 5. Completed task counts release pooled allocations

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

#[cfg(feature = "std")]
extern crate std;

pub mod aggregator;
pub mod batch;
pub mod csr;
pub mod encoder;
pub mod heap;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod state;
pub mod stream;

// Re-exports
pub use aggregator::{AggregatorStats, SubmissionAggregator};
pub use batch::{BarrierSlot, BatchBuffer, CommandBufferRecord};
pub use csr::{CommandStreamReceiver, CsrStats};
pub use encoder::{
    BarrierDesc, BarrierFlags, Command, CommandEncoder, CommandKind, DecodedCommand, PacketEncoder,
};
pub use heap::{HeapKind, IndirectHeap};
pub use state::{CachedState, ScratchConfig, StateCache};
pub use stream::{LinearStream, StreamLocation, StreamRange, CACHE_LINE_SIZE};
