//! # Receiver Configuration
//!
//! Explicit configuration object handed to a command stream receiver at
//! construction. Every override has a documented default.

use crate::flags::{DispatchMode, PreemptionMode, ThreadArbitrationPolicy};
use crate::types::{ByteSize, EngineId};

// =============================================================================
// BUDGET POLICY
// =============================================================================

/// How a memory limit is derived from the backend-reported budget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetPolicy {
    /// A fixed number of bytes
    Absolute(ByteSize),
    /// A fraction of the backend budget
    Fraction {
        /// Numerator
        num: u64,
        /// Denominator
        den: u64,
    },
    /// No limit
    Unlimited,
}

impl BudgetPolicy {
    /// Resolve the limit against the backend budget
    pub const fn limit(self, budget: ByteSize) -> Option<ByteSize> {
        match self {
            Self::Absolute(size) => Some(size),
            Self::Fraction { num, den } => Some(budget.scale(num, den)),
            Self::Unlimited => None,
        }
    }

    /// Check whether `footprint` exceeds the resolved limit
    pub const fn exceeded(self, footprint: ByteSize, budget: ByteSize) -> bool {
        match self.limit(budget) {
            Some(limit) => footprint.as_bytes() > limit.as_bytes(),
            None => false,
        }
    }
}

// =============================================================================
// CSR CONFIGURATION
// =============================================================================

/// Command stream receiver configuration
#[derive(Debug, Clone, Copy)]
pub struct CsrConfig {
    /// Initial dispatch mode
    pub dispatch_mode: DispatchMode,
    /// Preemption mode programmed by the preamble
    pub preemption_mode: PreemptionMode,
    /// Thread arbitration policy programmed by the preamble
    pub thread_arbitration_policy: ThreadArbitrationPolicy,
    /// Ordering is carried by timestamp packets instead of barriers
    pub timestamp_packet_write: bool,
    /// Enable the sampler cache flush workaround
    pub sampler_cache_flush_workaround: bool,
    /// Pending resident footprint that forces an eager batched flush
    pub eager_flush_budget: BudgetPolicy,
    /// Resident footprint cap of one chained submission
    pub chain_memory_limit: BudgetPolicy,
    /// Fragments at which adaptive mode flushes
    pub adaptive_flush_threshold: usize,
    /// Size of the receiver's own command stream
    pub command_stream_size: ByteSize,
    /// Compute units scratch space is replicated over
    pub scratch_compute_units: u32,
    /// Timeout of a single completion wait
    pub wait_timeout_ns: u64,
    /// Flush batched work on every task
    pub force_csr_flushing: bool,
    /// Reprogram all state on every task
    pub force_csr_reprogramming: bool,
    /// Engine submissions go to
    pub engine: EngineId,
}

impl CsrConfig {
    /// Default configuration
    pub const fn new() -> Self {
        Self {
            dispatch_mode: DispatchMode::Immediate,
            preemption_mode: PreemptionMode::ThreadGroup,
            thread_arbitration_policy: ThreadArbitrationPolicy::AgeBased,
            timestamp_packet_write: false,
            sampler_cache_flush_workaround: false,
            eager_flush_budget: BudgetPolicy::Fraction { num: 1, den: 4 },
            chain_memory_limit: BudgetPolicy::Fraction { num: 1, den: 2 },
            adaptive_flush_threshold: 8,
            command_stream_size: ByteSize::KIB_64,
            scratch_compute_units: 64,
            wait_timeout_ns: 2_000_000_000,
            force_csr_flushing: false,
            force_csr_reprogramming: false,
            engine: EngineId::new(0),
        }
    }

    /// Configuration for batched dispatch
    pub const fn batched() -> Self {
        Self::new().with_dispatch_mode(DispatchMode::Batched)
    }

    /// Set dispatch mode
    pub const fn with_dispatch_mode(mut self, mode: DispatchMode) -> Self {
        self.dispatch_mode = mode;
        self
    }

    /// Set preemption mode
    pub const fn with_preemption_mode(mut self, mode: PreemptionMode) -> Self {
        self.preemption_mode = mode;
        self
    }

    /// Set timestamp packet ordering
    pub const fn with_timestamp_packet_write(mut self, enabled: bool) -> Self {
        self.timestamp_packet_write = enabled;
        self
    }

    /// Set sampler cache flush workaround
    pub const fn with_sampler_cache_flush_workaround(mut self, enabled: bool) -> Self {
        self.sampler_cache_flush_workaround = enabled;
        self
    }

    /// Set eager flush budget
    pub const fn with_eager_flush_budget(mut self, policy: BudgetPolicy) -> Self {
        self.eager_flush_budget = policy;
        self
    }

    /// Set chain memory limit
    pub const fn with_chain_memory_limit(mut self, policy: BudgetPolicy) -> Self {
        self.chain_memory_limit = policy;
        self
    }

    /// Set adaptive flush threshold
    pub const fn with_adaptive_flush_threshold(mut self, fragments: usize) -> Self {
        self.adaptive_flush_threshold = fragments;
        self
    }

    /// Set command stream size
    pub const fn with_command_stream_size(mut self, size: ByteSize) -> Self {
        self.command_stream_size = size;
        self
    }

    /// Set wait timeout
    pub const fn with_wait_timeout_ns(mut self, timeout: u64) -> Self {
        self.wait_timeout_ns = timeout;
        self
    }

    /// Set forced flushing
    pub const fn with_force_csr_flushing(mut self, enabled: bool) -> Self {
        self.force_csr_flushing = enabled;
        self
    }

    /// Set forced reprogramming
    pub const fn with_force_csr_reprogramming(mut self, enabled: bool) -> Self {
        self.force_csr_reprogramming = enabled;
        self
    }

    /// Set engine
    pub const fn with_engine(mut self, engine: EngineId) -> Self {
        self.engine = engine;
        self
    }
}

impl Default for CsrConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_policy() {
        let budget = ByteSize::from_mib(4);
        let quarter = BudgetPolicy::Fraction { num: 1, den: 4 };
        assert_eq!(quarter.limit(budget), Some(ByteSize::from_mib(1)));
        assert!(quarter.exceeded(ByteSize::from_mib(2), budget));
        assert!(!quarter.exceeded(ByteSize::from_mib(1), budget));
        assert!(!BudgetPolicy::Unlimited.exceeded(ByteSize::from_mib(100), budget));
        assert!(BudgetPolicy::Absolute(ByteSize::KIB_4).exceeded(ByteSize::KIB_64, budget));
    }

    #[test]
    fn test_defaults() {
        let config = CsrConfig::default();
        assert_eq!(config.dispatch_mode, DispatchMode::Immediate);
        assert_eq!(config.adaptive_flush_threshold, 8);
        assert_eq!(CsrConfig::batched().dispatch_mode, DispatchMode::Batched);
    }
}
