//! # KILN Command Queues
//!
//! Blocking layer between applications and the command stream receiver.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                           Context                               │
//! │                                                                 │
//! │  ┌──────────────┐   ┌──────────────┐   ┌─────────────────────┐  │
//! │  │  Queue 0     │   │  Queue 1     │   │    Event Graph      │  │
//! │  │  (virtual    │   │  (virtual    │◄─►│  user / command     │  │
//! │  │   event)     │   │   event)     │   │  events, edges      │  │
//! │  └──────┬───────┘   └──────┬───────┘   └─────────────────────┘  │
//! │         └─────────┬────────┘                                    │
//! │                   ▼                                             │
//! │       ┌─────────────────────────┐                               │
//! │       │ Command Stream Receiver │                               │
//! │       └─────────────────────────┘                               │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Enqueues whose dependencies are resolved go straight to the receiver.
//! Others are parked in the event graph and released, in order, when the
//! user events they wait for complete.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

#[cfg(feature = "std")]
extern crate std;

pub mod context;
pub mod event;
pub mod queue;
pub mod task;

// Re-exports
pub use context::Context;
pub use event::{
    Dependencies, Event, EventGraph, EventHandle, EventKind, EventStatus, GraphStats,
    EXECUTION_FAILED,
};
pub use queue::{CommandQueue, QueueStats};
pub use task::{DeferredTask, QueueId, TaskDescriptor};
