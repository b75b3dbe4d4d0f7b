//! # Dispatch Flags
//!
//! Per-task options passed to the command stream receiver, plus the small
//! enums describing hardware modes tracked by the state cache.

// =============================================================================
// MODES
// =============================================================================

/// How the receiver turns a flushed task into physical submissions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchMode {
    /// Every task is submitted as soon as it is flushed
    #[default]
    Immediate,
    /// Tasks are recorded and chained into one submission later
    Batched,
    /// Batched, flushed whenever enough fragments accumulate
    Adaptive,
}

impl DispatchMode {
    /// Whether flushed tasks go through the aggregator
    pub const fn is_batching(self) -> bool {
        !matches!(self, Self::Immediate)
    }
}

/// Submission throttle hint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThrottleLevel {
    /// Low power
    Low,
    /// Default
    #[default]
    Medium,
    /// Latency sensitive
    High,
}

/// Granularity at which the device may preempt work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PreemptionMode {
    /// Preemption disabled
    Disabled,
    /// Between command buffers
    MidBatch,
    /// Between thread groups
    #[default]
    ThreadGroup,
    /// Between instructions
    MidThread,
}

/// Sampler cache flush workaround state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SamplerCacheFlushState {
    /// No flush pending
    #[default]
    NotRequired,
    /// Flush before the next task
    Before,
    /// Flush after the previous task, then stop
    After,
}

/// Thread scheduling policy of the execution units
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThreadArbitrationPolicy {
    /// Oldest thread first
    #[default]
    AgeBased,
    /// Round robin
    RoundRobin,
    /// Round robin after a dependency stall
    RoundRobinAfterDependency,
}

// =============================================================================
// DISPATCH FLAGS
// =============================================================================

/// Options of a single flushed task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchFlags {
    /// Wait for completion before returning
    pub blocking: bool,
    /// Flush the data cache at the end of the task
    pub dc_flush: bool,
    /// Terminate the task with a tag-writing barrier
    pub guard_command_buffer_with_pipe_control: bool,
    /// Task requires coherent memory access
    pub requires_coherency: bool,
    /// Submit at low priority
    pub low_priority: bool,
    /// Requested preemption granularity
    pub preemption_mode: PreemptionMode,
    /// Throttle hint
    pub throttle: ThrottleLevel,
    /// Task may overlap with neighbours at the same level
    pub out_of_order_execution_allowed: bool,
    /// Task uses the media sampler
    pub media_sampler_required: bool,
    /// Task uses shared local memory
    pub use_slm: bool,
}

impl DispatchFlags {
    /// Flags with every option off
    pub const fn new() -> Self {
        Self {
            blocking: false,
            dc_flush: false,
            guard_command_buffer_with_pipe_control: false,
            requires_coherency: false,
            low_priority: false,
            preemption_mode: PreemptionMode::ThreadGroup,
            throttle: ThrottleLevel::Medium,
            out_of_order_execution_allowed: false,
            media_sampler_required: false,
            use_slm: false,
        }
    }

    /// Set blocking
    pub const fn blocking(mut self, value: bool) -> Self {
        self.blocking = value;
        self
    }

    /// Set data cache flush
    pub const fn dc_flush(mut self, value: bool) -> Self {
        self.dc_flush = value;
        self
    }

    /// Set command buffer guard
    pub const fn guarded(mut self, value: bool) -> Self {
        self.guard_command_buffer_with_pipe_control = value;
        self
    }

    /// Set out-of-order permission
    pub const fn out_of_order(mut self, value: bool) -> Self {
        self.out_of_order_execution_allowed = value;
        self
    }

    /// Set throttle
    pub const fn throttle(mut self, value: ThrottleLevel) -> Self {
        self.throttle = value;
        self
    }

    /// Set low priority
    pub const fn low_priority(mut self, value: bool) -> Self {
        self.low_priority = value;
        self
    }

    /// Set coherency requirement
    pub const fn requires_coherency(mut self, value: bool) -> Self {
        self.requires_coherency = value;
        self
    }

    /// Whether the task ends with a tag-writing barrier
    pub const fn needs_epilogue_barrier(&self) -> bool {
        self.blocking || self.dc_flush || self.guard_command_buffer_with_pipe_control
    }
}

impl Default for DispatchFlags {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_epilogue_needed() {
        assert!(!DispatchFlags::new().needs_epilogue_barrier());
        assert!(DispatchFlags::new().blocking(true).needs_epilogue_barrier());
        assert!(DispatchFlags::new().guarded(true).needs_epilogue_barrier());
    }

    #[test]
    fn test_modes() {
        assert!(!DispatchMode::Immediate.is_batching());
        assert!(DispatchMode::Adaptive.is_batching());
    }
}
