//! # Completion Tracking
//!
//! Flush stamps, completion stamps and the shared completion counter.
//!
//! The device signals progress by writing the task count of each finished
//! task into a tag allocation. A task count `n` is complete once the tag
//! value is at least `n`.

use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::types::{TaskCount, TaskLevel};

// =============================================================================
// FLUSH STAMP
// =============================================================================

/// Opaque backend token identifying one physical submission
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct FlushStamp(u64);

impl FlushStamp {
    /// Stamp of a task that has not been physically submitted yet
    pub const NONE: Self = Self(0);

    /// Create a stamp from a raw backend value
    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw backend value
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Whether the task has reached the backend
    #[inline]
    pub const fn is_submitted(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Debug for FlushStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FlushStamp({})", self.0)
    }
}

// =============================================================================
// COMPLETION STAMP
// =============================================================================

/// Returned by every task flush, identifies when the task will be complete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionStamp {
    /// Task count that signals completion of this task
    pub task_count: TaskCount,
    /// Task level of the receiver after the flush
    pub task_level: TaskLevel,
    /// Backend token, [`FlushStamp::NONE`] while the task is still batched
    pub flush_stamp: FlushStamp,
}

impl CompletionStamp {
    /// Sentinel for work that never reaches a receiver
    pub const NOT_READY: Self = Self {
        task_count: TaskCount::MAX - 1,
        task_level: 0,
        flush_stamp: FlushStamp::NONE,
    };

    /// Sentinel for work whose submission failed
    pub const FAILED: Self = Self {
        task_count: TaskCount::MAX,
        task_level: 0,
        flush_stamp: FlushStamp::NONE,
    };

    /// Whether this stamp reports a failed submission
    #[inline]
    pub const fn is_failed(&self) -> bool {
        self.task_count == Self::FAILED.task_count
    }
}

// =============================================================================
// COMPLETION COUNTER
// =============================================================================

/// CPU view of the tag allocation
///
/// Shared between the backend that writes it and the waiters that poll it.
/// Values only move forward.
#[derive(Debug, Default)]
pub struct CompletionCounter {
    value: AtomicU32,
}

impl CompletionCounter {
    /// Create a counter with nothing completed
    pub const fn new() -> Self {
        Self {
            value: AtomicU32::new(0),
        }
    }

    /// Latest completed task count
    #[inline]
    pub fn get(&self) -> TaskCount {
        self.value.load(Ordering::Acquire)
    }

    /// Record completion of everything up to `task_count`
    pub fn signal(&self, task_count: TaskCount) {
        self.value.fetch_max(task_count, Ordering::AcqRel);
    }

    /// Check if `task_count` has completed
    #[inline]
    pub fn is_complete(&self, task_count: TaskCount) -> bool {
        self.get() >= task_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_monotonic() {
        let counter = CompletionCounter::new();
        counter.signal(5);
        counter.signal(3);
        assert_eq!(counter.get(), 5);
        assert!(counter.is_complete(4));
        assert!(!counter.is_complete(6));
    }

    #[test]
    fn test_failed_sentinel() {
        assert!(CompletionStamp::FAILED.is_failed());
        assert!(!CompletionStamp::NOT_READY.is_failed());
        assert!(!FlushStamp::NONE.is_submitted());
    }
}
