//! # KILN Error Handling
//!
//! Error types for the submission engine.
//!
//! Error handling in KILN follows these principles:
//! - Resource exhaustion is fatal for the command being encoded and is surfaced
//! - Budget pressure is never an error, it only triggers an eager flush
//! - Dependency graph corruption is an invariant violation, reported and never recovered
//! - Backend submission failures are propagated, never retried
//! - Errors are `no_std` compatible

use core::fmt;

// =============================================================================
// RESULT TYPE
// =============================================================================

/// KILN Result type alias
pub type Result<T> = core::result::Result<T, Error>;

// =============================================================================
// ERROR ENUM
// =============================================================================

/// KILN unified error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    // =========================================================================
    // Generic Errors
    // =========================================================================
    /// Invalid parameter provided
    InvalidParameter,
    /// Object is in a state that does not allow the operation
    InvalidState,
    /// Resource not found
    NotFound,

    // =========================================================================
    // Resource Exhaustion
    // =========================================================================
    /// Out of device memory
    OutOfMemory,
    /// Backend refused the allocation
    AllocationFailed,
    /// Indirect heap could not grow
    HeapExhausted,
    /// Linear command buffer has no space left
    CommandBufferFull,
    /// Allocation handle refers to a freed slot
    StaleAllocation,

    // =========================================================================
    // Submission Errors
    // =========================================================================
    /// Backend failed to submit a command buffer chain
    SubmissionFailed,
    /// Wait for a task count did not finish in time
    WaitTimeout,
    /// Device stopped making progress
    GpuHang,

    // =========================================================================
    // Dependency Graph Errors
    // =========================================================================
    /// Event handle refers to a destroyed event
    StaleEventHandle,
    /// Event reference count released below zero
    EventDoubleRelease,
    /// Event status transition is not allowed
    InvalidEventState,
    /// Queue still has deferred work that has not reached the device
    QueueBlocked,
}

impl Error {
    /// Check if this error means the device memory ran out
    pub const fn is_resource_exhaustion(self) -> bool {
        matches!(
            self,
            Self::OutOfMemory | Self::AllocationFailed | Self::HeapExhausted | Self::CommandBufferFull
        )
    }

    /// Check if this error is an invariant violation of the event graph
    pub const fn is_graph_violation(self) -> bool {
        matches!(self, Self::StaleEventHandle | Self::EventDoubleRelease | Self::InvalidEventState)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // Generic
            Self::InvalidParameter => write!(f, "invalid parameter"),
            Self::InvalidState => write!(f, "invalid state"),
            Self::NotFound => write!(f, "resource not found"),

            // Resources
            Self::OutOfMemory => write!(f, "out of device memory"),
            Self::AllocationFailed => write!(f, "allocation failed"),
            Self::HeapExhausted => write!(f, "indirect heap exhausted"),
            Self::CommandBufferFull => write!(f, "command buffer full"),
            Self::StaleAllocation => write!(f, "stale allocation handle"),

            // Submission
            Self::SubmissionFailed => write!(f, "submission failed"),
            Self::WaitTimeout => write!(f, "wait for task count timed out"),
            Self::GpuHang => write!(f, "GPU hang detected"),

            // Events
            Self::StaleEventHandle => write!(f, "stale event handle"),
            Self::EventDoubleRelease => write!(f, "event released more times than retained"),
            Self::InvalidEventState => write!(f, "invalid event status transition"),
            Self::QueueBlocked => write!(f, "queue is blocked on unresolved dependencies"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories() {
        assert!(Error::HeapExhausted.is_resource_exhaustion());
        assert!(!Error::SubmissionFailed.is_resource_exhaustion());
        assert!(Error::EventDoubleRelease.is_graph_violation());
        assert!(!Error::QueueBlocked.is_graph_violation());
    }
}
