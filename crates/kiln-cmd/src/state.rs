//! # State Cache
//!
//! Last-programmed values of expensive global GPU state.
//!
//! An entry changes only when the receiver actually emits the matching
//! command, so a flush that fails before emission leaves the cache
//! describing what the device really has.

use kiln_core::{PreemptionMode, SamplerCacheFlushState, ThreadArbitrationPolicy};

use crate::encoder::{L3Config, StateBaseAddress};

// =============================================================================
// CACHED STATE
// =============================================================================

/// One memoized state category
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachedState<T> {
    value: Option<T>,
    dirty: bool,
}

impl<T: Copy + PartialEq> CachedState<T> {
    /// Never programmed
    pub const fn new() -> Self {
        Self {
            value: None,
            dirty: true,
        }
    }

    /// Last programmed value
    pub fn get(&self) -> Option<T> {
        self.value
    }

    /// Whether programming `requested` needs a command
    pub fn needs_emit(&self, requested: T) -> bool {
        self.dirty || self.value != Some(requested)
    }

    /// Record that `value` was emitted
    pub fn commit(&mut self, value: T) {
        self.value = Some(value);
        self.dirty = false;
    }

    /// Force the next request to emit
    pub fn invalidate(&mut self) {
        self.dirty = true;
    }
}

impl<T: Copy + PartialEq> Default for CachedState<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Scratch programming
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScratchConfig {
    /// Scratch allocation address, null without scratch
    pub gpu_addr: kiln_core::GpuAddr,
    /// Per-thread size
    pub per_thread_size: u32,
}

// =============================================================================
// STATE CACHE
// =============================================================================

/// Memoized state of one receiver
#[derive(Debug, Clone, Default)]
pub struct StateCache {
    /// Preamble emitted
    pub preamble_sent: bool,
    /// Pipeline select, keyed by media sampler usage
    pub media_sampler: CachedState<bool>,
    /// Preemption mode
    pub preemption: CachedState<PreemptionMode>,
    /// L3 configuration
    pub l3_config: CachedState<L3Config>,
    /// Thread arbitration policy
    pub thread_arbitration: CachedState<ThreadArbitrationPolicy>,
    /// Scratch and front end state
    pub scratch: CachedState<ScratchConfig>,
    /// Base address triple plus general and instruction bases
    pub state_base_address: CachedState<StateBaseAddress>,
    /// Last coherency request
    pub coherency: CachedState<bool>,
    /// Sampler cache flush workaround progress
    pub sampler_cache_flush: SamplerCacheFlushState,
}

impl StateCache {
    /// Fresh cache, everything dirty
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget all programmed state, the next flush reprograms everything
    pub fn reset(&mut self) {
        let sampler_cache_flush = self.sampler_cache_flush;
        *self = Self::new();
        self.sampler_cache_flush = sampler_cache_flush;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cached_state() {
        let mut state = CachedState::<u32>::new();
        assert!(state.needs_emit(1));
        state.commit(1);
        assert!(!state.needs_emit(1));
        assert!(state.needs_emit(2));
        state.invalidate();
        assert!(state.needs_emit(1));
        assert_eq!(state.get(), Some(1));
    }

    #[test]
    fn test_reset_keeps_sampler_flush() {
        let mut cache = StateCache::new();
        cache.preamble_sent = true;
        cache.media_sampler.commit(false);
        cache.sampler_cache_flush = SamplerCacheFlushState::Before;
        cache.reset();
        assert!(!cache.preamble_sent);
        assert!(cache.media_sampler.needs_emit(false));
        assert_eq!(cache.sampler_cache_flush, SamplerCacheFlushState::Before);
    }
}
