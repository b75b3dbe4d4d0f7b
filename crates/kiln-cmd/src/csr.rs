//! # Command Stream Receiver
//!
//! Central orchestrator of one engine: turns flushed tasks into state
//! commands, residency and submissions, and tracks their completion.
//!
//! ## Flush Pipeline
//!
//! ```text
//!  flush_task
//!     │
//!     ├── scratch growth            (old scratch → TEMPORARY)
//!     ├── plan dirty state          (state cache lookups only)
//!     ├── ensure receiver space     (old stream → REUSABLE)
//!     ├── epilogue barrier          (task stream, tag write)
//!     ├── emit state                (receiver stream, cache committed)
//!     ├── residency                 (heaps, tag, scratch, streams)
//!     ├── package                   (BB_START → task → BB_END)
//!     │
//!     ├── Immediate ──► submit ──► latest flushed task count
//!     └── Batched   ──► aggregator ──► flush_batched_submissions
//! ```
//!
//! ## Completion Counters
//!
//! - `task_count`: tasks flushed so far, returned in every stamp
//! - `task_level`: dependency level, a higher request emits a barrier
//! - `latest_flushed_task_count`: last task count that reached the backend
//!
//! Pooled allocations are reclaimed against the latest flushed count, never
//! against `task_count`, because batched fragments may still reference them.

use alloc::vec::Vec;

use hashbrown::HashSet;
use kiln_core::{
    AllocationRequest, AllocationType, ByteSize, ChainFragment, CompletionStamp, CsrConfig,
    DeviceBackend, DispatchFlags, DispatchMode, Error, FlushStamp, GpuAddr, PreemptionMode,
    ResidentRange, Result, SamplerCacheFlushState, Submission, TaskCount, TaskLevel,
    ThreadArbitrationPolicy, ThrottleLevel,
};
use kiln_mem::{AllocationId, MemoryManager, PoolKind, ResidencySet};
use log::{debug, error, info, trace, warn};

use crate::aggregator::SubmissionAggregator;
use crate::batch::{BarrierSlot, BatchBuffer, CommandBufferRecord};
use crate::encoder::{
    BarrierDesc, BarrierFlags, Command, CommandEncoder, CommandKind, L3Config, StateBaseAddress,
};
use crate::heap::{HeapKind, IndirectHeap};
use crate::state::{ScratchConfig, StateCache};
use crate::stream::{
    patch_command, patch_noop, range_bytes, LinearStream, CACHE_LINE_SIZE,
};

/// Size of the completion tag allocation
const TAG_ALLOCATION_SIZE: ByteSize = ByteSize::KIB_4;

/// Granularity of command buffer and scratch allocations
const ALLOCATION_ALIGNMENT: u64 = 0x1000;

// =============================================================================
// STATISTICS
// =============================================================================

/// Receiver statistics
#[derive(Debug, Clone, Default)]
pub struct CsrStats {
    /// flush_task calls
    pub flushed_tasks: u64,
    /// Physical submissions
    pub physical_submissions: u64,
    /// Failed physical submissions
    pub failed_submissions: u64,
    /// Preambles emitted
    pub preambles: u64,
    /// Pipeline selects emitted
    pub pipeline_selects: u64,
    /// State base addresses emitted
    pub state_base_addresses: u64,
    /// Scratch states emitted
    pub scratch_states: u64,
    /// Task level barriers emitted
    pub level_barriers: u64,
    /// Sampler cache flushes emitted
    pub sampler_cache_flushes: u64,
    /// L3 configurations emitted
    pub l3_configs: u64,
    /// Preemption changes emitted
    pub preemption_changes: u64,
    /// Thread arbitration changes emitted
    pub arbitration_changes: u64,
    /// Batched flushes forced by the memory budget
    pub eager_flushes: u64,
    /// Stream and heap allocations replaced
    pub stream_grows: u64,
    /// Scratch allocations replaced
    pub scratch_grows: u64,
}

// =============================================================================
// STATE PLAN
// =============================================================================

/// State commands one flush has to emit, decided before anything is written
#[derive(Debug, Default)]
struct StatePlan {
    commands: Vec<Command>,
    preamble: bool,
    pipeline_select: Option<bool>,
    preemption: Option<PreemptionMode>,
    l3: Option<L3Config>,
    arbitration: Option<ThreadArbitrationPolicy>,
    level_barrier: bool,
    scratch: Option<ScratchConfig>,
    state_base_address: Option<StateBaseAddress>,
    sampler_cache_flush: bool,
}

// =============================================================================
// COMMAND STREAM RECEIVER
// =============================================================================

/// Command stream receiver of one engine
#[derive(Debug)]
pub struct CommandStreamReceiver<E, B> {
    encoder: E,
    memory: MemoryManager<B>,
    config: CsrConfig,
    dispatch_mode: DispatchMode,
    command_stream: LinearStream,
    residency: ResidencySet,
    aggregator: SubmissionAggregator,
    state: StateCache,
    tag: AllocationId,
    tag_addr: GpuAddr,
    scratch: Option<AllocationId>,
    scratch_config: ScratchConfig,
    required_scratch_size: u32,
    requested_arbitration: ThreadArbitrationPolicy,
    task_count: TaskCount,
    task_level: TaskLevel,
    latest_flushed_task_count: TaskCount,
    latest_sent_task_count: TaskCount,
    last_finished_task_count: TaskCount,
    flush_stamp: FlushStamp,
    submission_failed: bool,
    stats: CsrStats,
}

impl<E: CommandEncoder, B: DeviceBackend> CommandStreamReceiver<E, B> {
    /// Create a receiver, allocating its tag and command stream
    pub fn new(encoder: E, backend: B, config: CsrConfig) -> Result<Self> {
        let mut memory = MemoryManager::new(backend);

        let tag = memory.allocate(&AllocationRequest::new(
            TAG_ALLOCATION_SIZE,
            AllocationType::TagBuffer,
        ))?;
        let tag_addr = memory.registry().get(tag)?.gpu_addr();

        let stream_size = config.command_stream_size;
        let stream_id = memory.allocate(&AllocationRequest::new(
            stream_size,
            AllocationType::CommandBuffer,
        ))?;
        let stream_addr = memory.registry().get(stream_id)?.gpu_addr();

        info!(
            "command stream receiver: encoder {}, {:?} dispatch, {:?}",
            encoder.name(),
            config.dispatch_mode,
            config.engine
        );

        Ok(Self {
            encoder,
            memory,
            dispatch_mode: config.dispatch_mode,
            command_stream: LinearStream::new(stream_id, stream_addr, stream_size.as_usize()),
            residency: ResidencySet::new(config.engine),
            aggregator: SubmissionAggregator::new(),
            state: StateCache::new(),
            tag,
            tag_addr,
            scratch: None,
            scratch_config: ScratchConfig::default(),
            required_scratch_size: 0,
            requested_arbitration: config.thread_arbitration_policy,
            task_count: 0,
            task_level: 0,
            latest_flushed_task_count: 0,
            latest_sent_task_count: 0,
            last_finished_task_count: 0,
            flush_stamp: FlushStamp::NONE,
            submission_failed: false,
            stats: CsrStats::default(),
            config,
        })
    }

    // =========================================================================
    // Flushing
    // =========================================================================

    /// Flush one task
    ///
    /// `task_stream[task_start..]` holds the task's commands. The task stream
    /// must have [`task_stream_reserve`](Self::task_stream_reserve) bytes
    /// free for the epilogue and terminating commands, otherwise the flush
    /// fails with [`Error::CommandBufferFull`] before anything is written.
    pub fn flush_task(
        &mut self,
        task_stream: &mut LinearStream,
        task_start: usize,
        dsh: &IndirectHeap,
        ioh: &IndirectHeap,
        ssh: &IndirectHeap,
        task_level: TaskLevel,
        flags: &DispatchFlags,
    ) -> Result<CompletionStamp> {
        if task_stream.available() < self.task_stream_reserve() {
            error!(
                "task stream has {} bytes free, flush needs {}",
                task_stream.available(),
                self.task_stream_reserve()
            );
            return Err(Error::CommandBufferFull);
        }
        self.stats.flushed_tasks += 1;
        if self.config.force_csr_reprogramming {
            self.state.reset();
        }
        let submission_task_count = self.task_count + 1;

        self.update_scratch()?;

        let plan = self.plan_state(dsh, ioh, ssh, task_level, flags);
        let required = plan
            .commands
            .iter()
            .map(|command| self.encoder.size_of(command.kind()))
            .sum::<usize>()
            + 2 * self.encoder.size_of(CommandKind::BatchBufferStart)
            + CACHE_LINE_SIZE;
        self.ensure_csr_space(required)?;

        // Epilogue barrier closing the task
        let mut level_closed = false;
        let mut epilogue = None;
        let mut elidable_barrier = None;
        if flags.needs_epilogue_barrier() {
            let mut dc_flush = flags.dc_flush;
            if self.dispatch_mode == DispatchMode::Immediate {
                dc_flush |= flags.guard_command_buffer_with_pipe_control;
                level_closed = true;
            }
            let desc = BarrierDesc::tag_write(self.tag_addr, submission_task_count, dc_flush);
            let offset =
                task_stream.emit(self.memory.registry_mut(), &self.encoder, &Command::Barrier(desc))?;
            let slot = BarrierSlot {
                location: task_stream.location(offset)?,
                desc,
            };
            epilogue = Some(slot);
            if (flags.out_of_order_execution_allowed || self.config.timestamp_packet_write)
                && !dc_flush
            {
                elidable_barrier = Some(slot);
            }
        }

        let csr_start = self.command_stream.used();
        self.emit_state(&plan)?;
        if task_level > self.task_level {
            self.task_level = task_level;
        }
        self.state.coherency.commit(flags.requires_coherency);

        // Residency
        for heap in [dsh, ioh, ssh] {
            if let Some(id) = heap.allocation() {
                self.memory.registry_mut().get_mut(id)?.set_evictable(false);
                self.residency
                    .make_resident(self.memory.registry_mut(), id, submission_task_count)?;
            }
        }
        for id in core::iter::once(self.tag).chain(self.scratch) {
            self.memory.registry_mut().get_mut(id)?.set_evictable(false);
            self.residency
                .make_resident(self.memory.registry_mut(), id, submission_task_count)?;
        }

        let batch = self.package(task_stream, task_start, csr_start, flags)?;

        let mut failed = false;
        match batch {
            None => {
                let surfaces = self.residency.take_surfaces();
                self.residency
                    .make_surface_pack_non_resident(self.memory.registry_mut(), &surfaces)?;
            }
            Some(batch) if self.dispatch_mode == DispatchMode::Immediate => {
                let surfaces = self.residency.take_surfaces();
                let result = self.submit(&[&batch], &surfaces, submission_task_count);
                self.residency
                    .make_surface_pack_non_resident(self.memory.registry_mut(), &surfaces)?;
                failed = result.is_err();
            }
            Some(batch) => {
                let surfaces = self.residency.take_surfaces();
                let footprint = self.memory.registry().footprint(&surfaces);
                let pending = self.aggregator.pending_footprint() + footprint;
                if !self.aggregator.is_empty()
                    && self.config.eager_flush_budget.exceeded(pending, self.memory.budget())
                {
                    warn!("batched footprint {} over budget, flushing eagerly", pending);
                    self.stats.eager_flushes += 1;
                    failed |= self.flush_batched_tolerant()?;
                }

                self.aggregator.record(CommandBufferRecord {
                    batch,
                    surfaces,
                    footprint,
                    task_count: submission_task_count,
                    task_level: self.task_level,
                    out_of_order: flags.out_of_order_execution_allowed,
                    elidable_barrier,
                    epilogue,
                    elide_barrier: false,
                });

                if self.dispatch_mode == DispatchMode::Adaptive
                    && self.aggregator.len() >= self.config.adaptive_flush_threshold
                {
                    failed |= self.flush_batched_tolerant()?;
                }
            }
        }

        if self.dispatch_mode.is_batching() && (flags.blocking || self.config.force_csr_flushing) {
            failed |= self.flush_batched_tolerant()?;
        }

        self.task_count = submission_task_count;
        let flush_stamp = if self.latest_flushed_task_count >= self.task_count {
            self.flush_stamp
        } else {
            FlushStamp::NONE
        };
        let stamp = CompletionStamp {
            task_count: self.task_count,
            task_level: self.task_level,
            flush_stamp,
        };
        if level_closed {
            self.task_level += 1;
        }
        debug!(
            "flushed task {} at level {} ({:?})",
            stamp.task_count, stamp.task_level, self.dispatch_mode
        );

        if failed {
            return Ok(CompletionStamp::FAILED);
        }
        if flags.blocking {
            self.wait_for_task_count(self.task_count)?;
        }
        Ok(stamp)
    }

    /// Submit every recorded command buffer, chained into as few submissions
    /// as compatibility and the chain memory limit allow
    pub fn flush_batched_submissions(&mut self) -> Result<()> {
        if self.aggregator.is_empty() {
            return Ok(());
        }

        let limit = self.config.chain_memory_limit.limit(self.memory.budget());
        let mut first_error = None;
        loop {
            let chain = self.aggregator.take_next_chain(self.memory.registry(), limit);
            let Some(last) = chain.last() else {
                break;
            };
            let task_count = last.task_count;

            self.patch_chain(&chain)?;

            let surfaces: Vec<AllocationId> = chain
                .iter()
                .flat_map(|record| record.surfaces.iter().copied())
                .collect();
            let batches: Vec<&BatchBuffer> = chain.iter().map(|record| &record.batch).collect();
            let result = self.submit(&batches, &surfaces, task_count);
            self.residency
                .make_surface_pack_non_resident(self.memory.registry_mut(), &surfaces)?;
            self.task_level += 1;

            if let Err(err) = result {
                first_error.get_or_insert(err);
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Flush batched work, reporting a submission failure as `true`
    fn flush_batched_tolerant(&mut self) -> Result<bool> {
        match self.flush_batched_submissions() {
            Ok(()) => Ok(false),
            Err(Error::SubmissionFailed) => Ok(true),
            Err(err) => Err(err),
        }
    }

    // =========================================================================
    // Residency
    // =========================================================================

    /// Make an allocation resident for the next task
    pub fn make_resident(&mut self, id: AllocationId) -> Result<()> {
        self.residency
            .make_resident(self.memory.registry_mut(), id, self.task_count + 1)
    }

    /// Drop an allocation from the next task's residency
    pub fn make_non_resident(&mut self, id: AllocationId) -> Result<()> {
        self.residency.make_non_resident(self.memory.registry_mut(), id)
    }

    // =========================================================================
    // Completion
    // =========================================================================

    /// Wait until `task_count` completes
    ///
    /// Batched work is flushed first if it holds `task_count`. Waits only
    /// for work that was actually sent.
    pub fn wait_for_task_count(&mut self, task_count: TaskCount) -> Result<()> {
        if task_count > self.latest_flushed_task_count && !self.aggregator.is_empty() {
            self.flush_batched_submissions()?;
        }
        if self.submission_failed {
            return Err(Error::SubmissionFailed);
        }

        let target = task_count.min(self.latest_flushed_task_count);
        if target == 0 || self.memory.backend().completed_task_count() >= target {
            return Ok(());
        }

        self.memory
            .backend_mut()
            .wait(self.flush_stamp, self.config.wait_timeout_ns)?;
        if self.memory.backend().completed_task_count() >= target {
            Ok(())
        } else {
            warn!("task count {} not complete after wait", target);
            Err(Error::WaitTimeout)
        }
    }

    /// Wait for everything sent since the last finish
    pub fn finish(&mut self) -> Result<()> {
        self.flush_batched_submissions()?;
        if self.submission_failed {
            return Err(Error::SubmissionFailed);
        }
        if self.latest_flushed_task_count <= self.last_finished_task_count {
            return Ok(());
        }
        self.wait_for_task_count(self.latest_flushed_task_count)?;
        self.last_finished_task_count = self.latest_flushed_task_count;
        Ok(())
    }

    /// Whether the task with `task_count` has completed
    ///
    /// Tasks that produced no commands complete once everything sent before
    /// them has.
    pub fn is_task_complete(&self, task_count: TaskCount) -> bool {
        let completed = self.memory.backend().completed_task_count();
        if completed >= task_count {
            return true;
        }
        task_count > self.latest_flushed_task_count
            && task_count <= self.task_count
            && self.aggregator.is_empty()
            && !self.submission_failed
            && completed >= self.latest_flushed_task_count
    }

    /// Free pooled allocations the device is done with
    ///
    /// Returns the eviction candidates gathered since the last cleanup that
    /// are still allocated and no longer resident, for the caller to evict.
    pub fn cleanup_resources(&mut self) -> Result<Vec<AllocationId>> {
        self.wait_for_task_count(self.latest_flushed_task_count)?;

        let completed = self.memory.backend().completed_task_count();
        let threshold = self.latest_flushed_task_count.min(completed);
        self.memory.clean_allocation_list(threshold, PoolKind::Temporary)?;
        self.memory.clean_allocation_list(threshold, PoolKind::Reusable)?;

        let engine = self.config.engine;
        let registry = self.memory.registry();
        let mut seen = HashSet::new();
        let evictable: Vec<AllocationId> = self
            .residency
            .take_eviction_candidates()
            .into_iter()
            .filter(|id| seen.insert(*id))
            .filter(|id| {
                registry
                    .get(*id)
                    .is_ok_and(|allocation| !allocation.is_resident(engine))
            })
            .collect();
        if !evictable.is_empty() {
            trace!("{} eviction candidates", evictable.len());
        }
        Ok(evictable)
    }

    /// Wait for all work, free everything and return the backend
    pub fn shutdown(mut self) -> Result<B> {
        self.flush_batched_tolerant()?;
        match self.wait_for_task_count(self.latest_flushed_task_count) {
            Ok(()) | Err(Error::SubmissionFailed) => {}
            Err(err) => return Err(err),
        }

        let pooled = self.memory.drain_pools()?;
        let owned: Vec<AllocationId> = self.memory.registry().iter().map(|(id, _)| id).collect();
        for id in &owned {
            self.memory.free(*id)?;
        }
        debug!(
            "receiver shut down, freed {} pooled and {} owned allocations",
            pooled,
            owned.len()
        );
        Ok(self.memory.into_backend())
    }

    // =========================================================================
    // Counters
    // =========================================================================

    /// Tasks flushed so far
    pub fn peek_task_count(&self) -> TaskCount {
        self.task_count
    }

    /// Current task level
    pub fn peek_task_level(&self) -> TaskLevel {
        self.task_level
    }

    /// Last task count that reached the backend
    pub fn peek_latest_flushed_task_count(&self) -> TaskCount {
        self.latest_flushed_task_count
    }

    /// Last task count handed to the backend, including failed submissions
    pub fn peek_latest_sent_task_count(&self) -> TaskCount {
        self.latest_sent_task_count
    }

    /// Stamp of the latest physical submission
    pub fn peek_flush_stamp(&self) -> FlushStamp {
        self.flush_stamp
    }

    /// Start counting task levels from `level`
    #[cfg(any(test, feature = "mock"))]
    pub fn set_task_level(&mut self, level: TaskLevel) {
        self.task_level = level;
    }

    // =========================================================================
    // Configuration
    // =========================================================================

    /// Current dispatch mode
    pub fn dispatch_mode(&self) -> DispatchMode {
        self.dispatch_mode
    }

    /// Switch dispatch mode, flushing batched work when leaving batching
    pub fn set_dispatch_mode(&mut self, mode: DispatchMode) -> Result<()> {
        if mode == self.dispatch_mode {
            return Ok(());
        }
        if !mode.is_batching() {
            self.flush_batched_submissions()?;
        }
        info!("dispatch mode {:?} -> {:?}", self.dispatch_mode, mode);
        self.dispatch_mode = mode;
        Ok(())
    }

    /// Per-thread scratch size the next task needs
    pub fn set_required_scratch_size(&mut self, per_thread_size: u32) {
        self.required_scratch_size = per_thread_size;
    }

    /// Thread arbitration policy the next task should run with
    pub fn request_thread_arbitration_policy(&mut self, policy: ThreadArbitrationPolicy) {
        self.requested_arbitration = policy;
    }

    /// Request sampler cache flushes around the next tasks
    pub fn set_sampler_cache_flush_state(&mut self, state: SamplerCacheFlushState) {
        self.state.sampler_cache_flush = state;
    }

    // =========================================================================
    // Streams and heaps
    // =========================================================================

    /// Bytes a task stream needs free beyond its commands
    pub fn task_stream_reserve(&self) -> usize {
        self.encoder.size_of(CommandKind::Barrier)
            + self.encoder.size_of(CommandKind::BatchBufferStart)
            + CACHE_LINE_SIZE
    }

    /// Create a task command stream
    pub fn create_task_stream(&mut self, size: ByteSize) -> Result<LinearStream> {
        let size = size.align_up(ALLOCATION_ALIGNMENT);
        let completed = self.memory.backend().completed_task_count();
        let id = self
            .memory
            .obtain_reusable(size, AllocationType::CommandBuffer, completed)?;
        let allocation = self.memory.registry().get(id)?;
        Ok(LinearStream::new(
            id,
            allocation.gpu_addr(),
            allocation.size().as_usize(),
        ))
    }

    /// Make sure `stream` has `min_size` free bytes
    ///
    /// A full stream moves to a new allocation. The old one goes to the
    /// reusable pool, protected until the current task count completes.
    pub fn ensure_stream_space(&mut self, stream: &mut LinearStream, min_size: usize) -> Result<()> {
        if stream.allocation().is_some() && stream.available() >= min_size {
            return Ok(());
        }
        let size = ByteSize::from_bytes(min_size.max(stream.max_size()) as u64)
            .align_up(ALLOCATION_ALIGNMENT);
        self.replace_stream(stream, size, AllocationType::CommandBuffer, PoolKind::Reusable)
    }

    /// Allocate an indirect heap
    pub fn allocate_indirect_heap(&mut self, kind: HeapKind, size: ByteSize) -> Result<IndirectHeap> {
        let completed = self.memory.backend().completed_task_count();
        let id = self
            .memory
            .obtain_reusable(
                size.align_up(ALLOCATION_ALIGNMENT),
                kind.allocation_type(),
                completed,
            )
            .map_err(heap_error)?;
        let allocation = self.memory.registry().get(id)?;
        Ok(IndirectHeap::new(
            kind,
            id,
            allocation.gpu_addr(),
            allocation.size().as_usize(),
        ))
    }

    /// Make sure `heap` has `min_size` free bytes
    ///
    /// A full heap moves to a new, empty allocation. The old one is freed
    /// once the current task count completes, and the new base is programmed
    /// by the next flush.
    pub fn ensure_heap_space(&mut self, heap: &mut IndirectHeap, min_size: usize) -> Result<()> {
        if heap.stream().available() >= min_size {
            return Ok(());
        }
        let size = ByteSize::from_bytes(min_size.max(heap.stream().max_size()) as u64)
            .align_up(ALLOCATION_ALIGNMENT);
        let allocation_type = heap.kind().allocation_type();
        self.replace_stream(heap.stream_mut(), size, allocation_type, PoolKind::Temporary)
            .map_err(heap_error)
    }

    /// Return an indirect heap to the reusable pool
    pub fn release_indirect_heap(&mut self, heap: IndirectHeap) -> Result<()> {
        match heap.allocation() {
            Some(id) => self.memory.store(id, PoolKind::Reusable, self.task_count),
            None => Ok(()),
        }
    }

    /// Append raw bytes to a task stream or heap
    pub fn write_stream(&mut self, stream: &mut LinearStream, bytes: &[u8]) -> Result<usize> {
        stream.append(self.memory.registry_mut(), bytes)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Memory manager
    pub fn memory(&self) -> &MemoryManager<B> {
        &self.memory
    }

    /// Memory manager, mutably
    pub fn memory_mut(&mut self) -> &mut MemoryManager<B> {
        &mut self.memory
    }

    /// Backend
    pub fn backend(&self) -> &B {
        self.memory.backend()
    }

    /// Backend, mutably
    pub fn backend_mut(&mut self) -> &mut B {
        self.memory.backend_mut()
    }

    /// Encoder
    pub fn encoder(&self) -> &E {
        &self.encoder
    }

    /// Configuration
    pub fn config(&self) -> &CsrConfig {
        &self.config
    }

    /// State cache
    pub fn state(&self) -> &StateCache {
        &self.state
    }

    /// Residency set of the next task
    pub fn residency(&self) -> &ResidencySet {
        &self.residency
    }

    /// Batched command buffers
    pub fn aggregator(&self) -> &SubmissionAggregator {
        &self.aggregator
    }

    /// Receiver command stream
    pub fn command_stream(&self) -> &LinearStream {
        &self.command_stream
    }

    /// Current scratch allocation
    pub fn scratch_allocation(&self) -> Option<AllocationId> {
        self.scratch
    }

    /// Completion tag address
    pub fn tag_address(&self) -> GpuAddr {
        self.tag_addr
    }

    /// Get statistics
    pub fn stats(&self) -> &CsrStats {
        &self.stats
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn update_scratch(&mut self) -> Result<()> {
        let required = self.required_scratch_size;
        if required <= self.scratch_config.per_thread_size {
            return Ok(());
        }

        let size = ByteSize::from_bytes(required as u64 * self.config.scratch_compute_units as u64)
            .align_up(ALLOCATION_ALIGNMENT);
        let id = self
            .memory
            .allocate(&AllocationRequest::new(size, AllocationType::Scratch))?;
        let gpu_addr = self.memory.registry().get(id)?.gpu_addr();

        if let Some(old) = self.scratch.replace(id) {
            self.residency.make_non_resident(self.memory.registry_mut(), old)?;
            self.memory.store(old, PoolKind::Temporary, self.task_count)?;
        }
        self.scratch_config = ScratchConfig {
            gpu_addr,
            per_thread_size: required,
        };
        self.stats.scratch_grows += 1;
        debug!("scratch grown to {} per thread ({})", required, size);
        Ok(())
    }

    fn plan_state(
        &self,
        dsh: &IndirectHeap,
        ioh: &IndirectHeap,
        ssh: &IndirectHeap,
        task_level: TaskLevel,
        flags: &DispatchFlags,
    ) -> StatePlan {
        let mut plan = StatePlan::default();
        let state = &self.state;
        let l3 = if flags.use_slm {
            L3Config::SharedLocalMemory
        } else {
            L3Config::Default
        };

        if !state.preamble_sent {
            plan.commands.push(Command::Preamble {
                preemption: self.config.preemption_mode,
                arbitration: self.requested_arbitration,
                l3,
            });
            plan.preamble = true;
            plan.preemption = Some(self.config.preemption_mode);
            plan.l3 = Some(l3);
            plan.arbitration = Some(self.requested_arbitration);
        }

        if state.media_sampler.needs_emit(flags.media_sampler_required) {
            plan.commands.push(Command::PipelineSelect {
                media_sampler: flags.media_sampler_required,
            });
            plan.pipeline_select = Some(flags.media_sampler_required);
        }

        let preemption_changed = if plan.preamble {
            self.config.preemption_mode != flags.preemption_mode
        } else {
            state.preemption.needs_emit(flags.preemption_mode)
        };
        if preemption_changed {
            plan.commands.push(Command::Preemption(flags.preemption_mode));
            plan.preemption = Some(flags.preemption_mode);
        }

        if !plan.preamble && state.l3_config.needs_emit(l3) {
            plan.commands.push(Command::Barrier(BarrierDesc::stall()));
            plan.commands.push(Command::L3Config(l3));
            plan.l3 = Some(l3);
        }

        if !plan.preamble && state.thread_arbitration.needs_emit(self.requested_arbitration) {
            plan.commands
                .push(Command::ThreadArbitration(self.requested_arbitration));
            plan.arbitration = Some(self.requested_arbitration);
        }

        if task_level > self.task_level && !self.config.timestamp_packet_write {
            plan.commands.push(Command::Barrier(BarrierDesc::stall()));
            plan.level_barrier = true;
        }

        if self.scratch.is_some() && state.scratch.needs_emit(self.scratch_config) {
            plan.commands.push(Command::ScratchState {
                scratch: self.scratch_config.gpu_addr,
                per_thread_size: self.scratch_config.per_thread_size,
            });
            plan.scratch = Some(self.scratch_config);
        }

        let sba = StateBaseAddress {
            general_state: self.scratch_config.gpu_addr,
            dynamic_state: dsh.base(),
            indirect_object: ioh.base(),
            surface_state: ssh.base(),
            instruction: GpuAddr::null(),
        };
        if state.state_base_address.needs_emit(sba) {
            plan.commands.push(Command::Barrier(BarrierDesc::with_flags(
                BarrierFlags::STATE_BASE_ADDRESS_GUARD,
            )));
            plan.commands.push(Command::StateBaseAddress(sba));
            plan.state_base_address = Some(sba);
        }

        if self.config.sampler_cache_flush_workaround
            && state.sampler_cache_flush != SamplerCacheFlushState::NotRequired
        {
            plan.commands.push(Command::Barrier(BarrierDesc::with_flags(
                BarrierFlags::CS_STALL.union(BarrierFlags::TEXTURE_CACHE_INVALIDATE),
            )));
            plan.sampler_cache_flush = true;
        }

        plan
    }

    fn emit_state(&mut self, plan: &StatePlan) -> Result<()> {
        for command in &plan.commands {
            self.command_stream
                .emit(self.memory.registry_mut(), &self.encoder, command)?;
            trace!("emit {:?}", command.kind());

            let stats = &mut self.stats;
            match command.kind() {
                CommandKind::Preamble => stats.preambles += 1,
                CommandKind::PipelineSelect => stats.pipeline_selects += 1,
                CommandKind::Preemption => stats.preemption_changes += 1,
                CommandKind::L3Config => stats.l3_configs += 1,
                CommandKind::ThreadArbitration => stats.arbitration_changes += 1,
                CommandKind::ScratchState => stats.scratch_states += 1,
                CommandKind::StateBaseAddress => stats.state_base_addresses += 1,
                _ => {}
            }
        }

        let state = &mut self.state;
        if plan.preamble {
            state.preamble_sent = true;
        }
        if let Some(media_sampler) = plan.pipeline_select {
            state.media_sampler.commit(media_sampler);
        }
        if let Some(mode) = plan.preemption {
            state.preemption.commit(mode);
        }
        if let Some(l3) = plan.l3 {
            state.l3_config.commit(l3);
        }
        if let Some(policy) = plan.arbitration {
            state.thread_arbitration.commit(policy);
        }
        if let Some(scratch) = plan.scratch {
            state.scratch.commit(scratch);
        }
        if let Some(sba) = plan.state_base_address {
            state.state_base_address.commit(sba);
        }
        if plan.level_barrier {
            self.stats.level_barriers += 1;
        }
        if plan.sampler_cache_flush {
            state.sampler_cache_flush = match state.sampler_cache_flush {
                SamplerCacheFlushState::Before => SamplerCacheFlushState::After,
                _ => SamplerCacheFlushState::NotRequired,
            };
            self.stats.sampler_cache_flushes += 1;
        }
        Ok(())
    }

    /// Terminate the task and receiver streams, chain them, and describe the
    /// result. `None` when neither stream has anything to execute.
    fn package(
        &mut self,
        task_stream: &mut LinearStream,
        task_start: usize,
        csr_start: usize,
        flags: &DispatchFlags,
    ) -> Result<Option<BatchBuffer>> {
        let submit_task = task_stream.used() != task_start;
        let submit_csr = self.command_stream.used() != csr_start;
        if !submit_task && !submit_csr {
            return Ok(None);
        }

        let padding = if self.dispatch_mode.is_batching() {
            self.encoder.size_of(CommandKind::BatchBufferStart)
                - self.encoder.size_of(CommandKind::BatchBufferEnd)
        } else {
            0
        };
        let submission_task_count = self.task_count + 1;
        let registry = self.memory.registry_mut();
        let encoder = &self.encoder;

        let (csr, task, tail) = if submit_task {
            let end = task_stream.emit(registry, encoder, &Command::BatchBufferEnd)?;
            task_stream.emit_noop(registry, encoder, padding)?;
            task_stream.align_to_cache_line(registry, encoder)?;
            let task = task_stream.range_from(task_start)?;

            let csr = if submit_csr {
                self.command_stream.emit(
                    registry,
                    encoder,
                    &Command::BatchBufferStart {
                        target: task.gpu_start(),
                    },
                )?;
                self.command_stream.align_to_cache_line(registry, encoder)?;
                Some(self.command_stream.range_from(csr_start)?)
            } else {
                None
            };
            (csr, Some(task), task_stream.location(end)?)
        } else {
            let end = self
                .command_stream
                .emit(registry, encoder, &Command::BatchBufferEnd)?;
            self.command_stream.emit_noop(registry, encoder, padding)?;
            self.command_stream.align_to_cache_line(registry, encoder)?;
            (
                Some(self.command_stream.range_from(csr_start)?),
                None,
                self.command_stream.location(end)?,
            )
        };

        for range in csr.iter().chain(task.iter()) {
            self.residency
                .make_resident(self.memory.registry_mut(), range.allocation, submission_task_count)?;
        }

        Ok(Some(BatchBuffer {
            csr,
            task,
            tail,
            requires_coherency: flags.requires_coherency,
            low_priority: flags.low_priority,
            throttle: flags.throttle,
        }))
    }

    /// Rewrite a chain so it executes as one: tails jump to the next head,
    /// redundant barriers become no-ops and the last epilogue flushes the
    /// data cache.
    fn patch_chain(&mut self, chain: &[CommandBufferRecord]) -> Result<()> {
        let registry = self.memory.registry_mut();
        let encoder = &self.encoder;
        let barrier_size = encoder.size_of(CommandKind::Barrier);

        for pair in chain.windows(2) {
            let (current, next) = (&pair[0], &pair[1]);
            if current.elide_barrier {
                if let Some(slot) = current.elidable_barrier {
                    patch_noop(registry, encoder, slot.location, barrier_size)?;
                }
            }
            let target = next.batch.head_addr().ok_or(Error::InvalidState)?;
            patch_command(
                registry,
                encoder,
                current.batch.tail,
                &Command::BatchBufferStart { target },
            )?;
        }

        if let Some(slot) = chain.last().and_then(|record| record.epilogue) {
            if !slot.desc.flags.contains(BarrierFlags::DC_FLUSH) {
                let desc = BarrierDesc {
                    flags: slot.desc.flags | BarrierFlags::DC_FLUSH,
                    ..slot.desc
                };
                patch_command(registry, encoder, slot.location, &Command::Barrier(desc))?;
            }
        }
        Ok(())
    }

    /// Hand a chain to the backend
    fn submit(
        &mut self,
        batches: &[&BatchBuffer],
        surfaces: &[AllocationId],
        task_count: TaskCount,
    ) -> Result<FlushStamp> {
        let (low_priority, throttle, requires_coherency) = batches
            .first()
            .map(|batch| (batch.low_priority, batch.throttle, batch.requires_coherency))
            .unwrap_or((false, ThrottleLevel::Medium, false));

        let engine = self.config.engine;
        let (registry, backend) = self.memory.split();

        let mut fragments = Vec::new();
        for batch in batches {
            for range in batch.ranges() {
                fragments.push(ChainFragment {
                    gpu_addr: range.gpu_start(),
                    bytes: range_bytes(registry, range)?,
                });
            }
        }

        let mut seen = HashSet::new();
        let residency: Vec<ResidentRange> = surfaces
            .iter()
            .filter(|id| seen.insert(**id))
            .filter_map(|id| registry.get(*id).ok())
            .map(|allocation| ResidentRange {
                gpu_addr: allocation.gpu_addr(),
                size: allocation.size(),
            })
            .collect();

        let result = backend.submit(&Submission {
            fragments: &fragments,
            residency: &residency,
            task_count,
            engine,
            low_priority,
            throttle,
            requires_coherency,
        });

        self.latest_sent_task_count = self.latest_sent_task_count.max(task_count);
        match result {
            Ok(stamp) => {
                self.flush_stamp = stamp;
                self.latest_flushed_task_count = self.latest_flushed_task_count.max(task_count);
                self.stats.physical_submissions += 1;
                Ok(stamp)
            }
            Err(err) => {
                error!("submission of task count {} failed: {}", task_count, err);
                self.submission_failed = true;
                self.stats.failed_submissions += 1;
                Err(Error::SubmissionFailed)
            }
        }
    }

    fn ensure_csr_space(&mut self, required: usize) -> Result<()> {
        if self.command_stream.available() >= required {
            return Ok(());
        }
        let size = ByteSize::from_bytes(required.max(self.command_stream.max_size()) as u64)
            .align_up(ALLOCATION_ALIGNMENT);
        let mut stream = core::mem::take(&mut self.command_stream);
        let result =
            self.replace_stream(&mut stream, size, AllocationType::CommandBuffer, PoolKind::Reusable);
        self.command_stream = stream;
        result
    }

    fn replace_stream(
        &mut self,
        stream: &mut LinearStream,
        size: ByteSize,
        allocation_type: AllocationType,
        retire_to: PoolKind,
    ) -> Result<()> {
        let completed = self.memory.backend().completed_task_count();
        let id = self.memory.obtain_reusable(size, allocation_type, completed)?;
        let allocation = self.memory.registry().get(id)?;
        let (gpu_addr, actual) = (allocation.gpu_addr(), allocation.size());

        if let Some(old) = stream.allocation() {
            self.memory.store(old, retire_to, self.task_count)?;
        }
        stream.replace(id, gpu_addr, actual.as_usize());
        self.stats.stream_grows += 1;
        trace!("{:?} stream moved to {} ({})", allocation_type, gpu_addr, actual);
        Ok(())
    }
}

fn heap_error(err: Error) -> Error {
    if err.is_resource_exhaustion() {
        Error::HeapExhausted
    } else {
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::{DecodedCommand, PacketEncoder};
    use crate::mock::MockBackend;
    use alloc::vec::Vec;
    use kiln_core::BudgetPolicy;

    type Csr = CommandStreamReceiver<PacketEncoder, MockBackend>;

    struct Task {
        stream: LinearStream,
        dsh: IndirectHeap,
        ioh: IndirectHeap,
        ssh: IndirectHeap,
    }

    fn setup(config: CsrConfig, backend: MockBackend) -> (Csr, Task) {
        let mut csr = Csr::new(PacketEncoder::new(), backend, config).unwrap();
        let task = Task {
            stream: csr.create_task_stream(ByteSize::KIB_4).unwrap(),
            dsh: csr
                .allocate_indirect_heap(HeapKind::DynamicState, ByteSize::KIB_4)
                .unwrap(),
            ioh: csr
                .allocate_indirect_heap(HeapKind::IndirectObject, ByteSize::KIB_4)
                .unwrap(),
            ssh: csr
                .allocate_indirect_heap(HeapKind::SurfaceState, ByteSize::KIB_4)
                .unwrap(),
        };
        (csr, task)
    }

    fn flush(
        csr: &mut Csr,
        task: &mut Task,
        level: TaskLevel,
        flags: DispatchFlags,
    ) -> Result<CompletionStamp> {
        let start = task.stream.used();
        csr.write_stream(&mut task.stream, &[0; 16])?;
        csr.flush_task(&mut task.stream, start, &task.dsh, &task.ioh, &task.ssh, level, &flags)
    }

    fn flush_empty(csr: &mut Csr, task: &mut Task, flags: DispatchFlags) -> CompletionStamp {
        let start = task.stream.used();
        csr.flush_task(&mut task.stream, start, &task.dsh, &task.ioh, &task.ssh, 0, &flags)
            .unwrap()
    }

    fn barriers(commands: &[DecodedCommand]) -> Vec<BarrierDesc> {
        commands
            .iter()
            .filter_map(|command| match command {
                DecodedCommand::Command(Command::Barrier(desc)) => Some(*desc),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_first_flush_programs_state() {
        let (mut csr, mut task) = setup(CsrConfig::new(), MockBackend::new());
        let stamp = flush(&mut csr, &mut task, 0, DispatchFlags::new().guarded(true)).unwrap();

        assert_eq!(stamp.task_count, 1);
        assert!(stamp.flush_stamp.is_submitted());
        assert_eq!(csr.peek_task_count(), 1);
        assert_eq!(csr.peek_latest_flushed_task_count(), 1);

        let submission = csr.backend().last_submission().unwrap();
        assert_eq!(submission.task_count, 1);
        assert_eq!(submission.fragments.len(), 2);
        assert_eq!(submission.count(CommandKind::Preamble), 1);
        assert_eq!(submission.count(CommandKind::PipelineSelect), 1);
        assert_eq!(submission.count(CommandKind::StateBaseAddress), 1);
        assert_eq!(submission.count(CommandKind::BatchBufferStart), 1);
        assert_eq!(submission.count(CommandKind::BatchBufferEnd), 1);
        assert!(submission.is_resident(csr.tag_address()));

        // Guarded immediate task writes its task count to the tag
        let tag_writes: Vec<_> = barriers(&submission.commands())
            .into_iter()
            .filter_map(|desc| desc.post_sync)
            .collect();
        assert_eq!(tag_writes.len(), 1);
        assert_eq!(tag_writes[0].address, csr.tag_address());
        assert_eq!(tag_writes[0].value, 1);
    }

    #[test]
    fn test_repeated_flush_emits_no_state() {
        let (mut csr, mut task) = setup(CsrConfig::new(), MockBackend::new());
        let flags = DispatchFlags::new().guarded(true);
        flush(&mut csr, &mut task, 0, flags).unwrap();
        flush(&mut csr, &mut task, 0, flags).unwrap();

        let submission = csr.backend().last_submission().unwrap();
        assert_eq!(submission.fragments.len(), 1);
        assert_eq!(submission.count(CommandKind::Preamble), 0);
        assert_eq!(submission.count(CommandKind::PipelineSelect), 0);
        assert_eq!(submission.count(CommandKind::StateBaseAddress), 0);
        assert_eq!(csr.stats().preambles, 1);
        assert_eq!(csr.stats().state_base_addresses, 1);
        assert_eq!(csr.stats().physical_submissions, 2);
    }

    #[test]
    fn test_blocking_flush_below_current_level() {
        let (mut csr, mut task) = setup(CsrConfig::new(), MockBackend::new());
        csr.set_task_level(6);

        let stamp = flush(&mut csr, &mut task, 5, DispatchFlags::new().blocking(true)).unwrap();
        assert_eq!(stamp.task_count, 1);
        assert_eq!(stamp.task_level, 6);
        assert_eq!(csr.peek_task_level(), 7);
        assert_eq!(csr.stats().level_barriers, 0);
        assert!(csr.is_task_complete(1));
    }

    #[test]
    fn test_higher_level_emits_barrier() {
        let (mut csr, mut task) = setup(CsrConfig::new(), MockBackend::new());
        let stamp = flush(&mut csr, &mut task, 3, DispatchFlags::new()).unwrap();
        assert_eq!(stamp.task_level, 3);
        assert_eq!(csr.stats().level_barriers, 1);

        let config = CsrConfig::new().with_timestamp_packet_write(true);
        let (mut csr, mut task) = setup(config, MockBackend::new());
        flush(&mut csr, &mut task, 3, DispatchFlags::new()).unwrap();
        assert_eq!(csr.stats().level_barriers, 0);
        assert_eq!(csr.peek_task_level(), 3);
    }

    #[test]
    fn test_batched_chain_elides_barriers() {
        let (mut csr, mut task) = setup(CsrConfig::batched(), MockBackend::new());
        let flags = DispatchFlags::new().guarded(true).out_of_order(true);
        for expected in 1..=3 {
            let stamp = flush(&mut csr, &mut task, 0, flags).unwrap();
            assert_eq!(stamp.task_count, expected);
            assert_eq!(csr.peek_task_count(), stamp.task_count);
            assert_eq!(stamp.flush_stamp, FlushStamp::NONE);
        }
        assert!(csr.backend().submissions().is_empty());
        assert_eq!(csr.aggregator().len(), 3);
        assert_eq!(csr.aggregator().stats().elided_barriers, 2);

        csr.flush_batched_submissions().unwrap();
        assert_eq!(csr.backend().submissions().len(), 1);
        assert_eq!(csr.peek_latest_flushed_task_count(), 3);
        assert_eq!(csr.peek_task_level(), 1);

        let submission = csr.backend().last_submission().unwrap();
        assert_eq!(submission.task_count, 3);
        assert_eq!(submission.count(CommandKind::BatchBufferEnd), 1);
        // Receiver jump plus two chained tails
        assert_eq!(submission.count(CommandKind::BatchBufferStart), 3);

        let epilogues: Vec<_> = barriers(&submission.commands())
            .into_iter()
            .filter(|desc| desc.post_sync.is_some())
            .collect();
        assert_eq!(epilogues.len(), 1);
        assert_eq!(epilogues[0].post_sync.unwrap().value, 3);
        assert!(epilogues[0].flags.contains(BarrierFlags::DC_FLUSH));
    }

    #[test]
    fn test_batched_in_order_keeps_barriers() {
        let (mut csr, mut task) = setup(CsrConfig::batched(), MockBackend::new());
        let flags = DispatchFlags::new().guarded(true);
        for _ in 0..3 {
            flush(&mut csr, &mut task, 0, flags).unwrap();
        }
        csr.finish().unwrap();

        let submission = csr.backend().last_submission().unwrap();
        let epilogues = barriers(&submission.commands())
            .into_iter()
            .filter(|desc| desc.post_sync.is_some())
            .count();
        assert_eq!(epilogues, 3);
    }

    #[test]
    fn test_blocking_batched_flush_submits() {
        let (mut csr, mut task) = setup(CsrConfig::batched(), MockBackend::new());
        flush(&mut csr, &mut task, 0, DispatchFlags::new().guarded(true)).unwrap();
        let stamp = flush(&mut csr, &mut task, 0, DispatchFlags::new().blocking(true)).unwrap();

        assert_eq!(stamp.task_count, 2);
        assert!(stamp.flush_stamp.is_submitted());
        assert!(csr.aggregator().is_empty());
        assert_eq!(csr.backend().submissions().len(), 1);
    }

    #[test]
    fn test_adaptive_flushes_at_threshold() {
        let config = CsrConfig::new()
            .with_dispatch_mode(DispatchMode::Adaptive)
            .with_adaptive_flush_threshold(2);
        let (mut csr, mut task) = setup(config, MockBackend::new());
        let flags = DispatchFlags::new().guarded(true);

        flush(&mut csr, &mut task, 0, flags).unwrap();
        assert!(csr.backend().submissions().is_empty());
        flush(&mut csr, &mut task, 0, flags).unwrap();
        assert_eq!(csr.backend().submissions().len(), 1);
        assert!(csr.aggregator().is_empty());
    }

    #[test]
    fn test_scratch_growth() {
        let (mut csr, mut task) = setup(CsrConfig::new(), MockBackend::new());
        csr.set_required_scratch_size(1024);
        flush(&mut csr, &mut task, 0, DispatchFlags::new()).unwrap();

        let first = csr.scratch_allocation().unwrap();
        let first_addr = csr.memory().registry().get(first).unwrap().gpu_addr();
        let submission = csr.backend().last_submission().unwrap();
        assert!(submission.is_resident(first_addr));
        assert_eq!(submission.count(CommandKind::ScratchState), 1);

        csr.set_required_scratch_size(4096);
        flush(&mut csr, &mut task, 0, DispatchFlags::new()).unwrap();

        let second = csr.scratch_allocation().unwrap();
        assert_ne!(first, second);
        let second_addr = csr.memory().registry().get(second).unwrap().gpu_addr();
        let submission = csr.backend().last_submission().unwrap();
        assert!(!submission.is_resident(first_addr));
        assert!(submission.is_resident(second_addr));
        assert_eq!(submission.count(CommandKind::ScratchState), 1);
        assert_eq!(submission.count(CommandKind::StateBaseAddress), 1);
        assert_eq!(csr.memory().pool(PoolKind::Temporary).len(), 1);

        // Smaller requests reuse the current scratch
        csr.set_required_scratch_size(512);
        flush(&mut csr, &mut task, 0, DispatchFlags::new()).unwrap();
        assert_eq!(csr.scratch_allocation(), Some(second));
        assert_eq!(csr.stats().scratch_grows, 2);
    }

    #[test]
    fn test_cleanup_waits_for_completion() {
        let (mut csr, mut task) = setup(CsrConfig::new(), MockBackend::manual());
        flush(&mut csr, &mut task, 0, DispatchFlags::new()).unwrap();

        let old = task.ssh.allocation();
        csr.ensure_heap_space(&mut task.ssh, 0x2000).unwrap();
        assert_ne!(task.ssh.allocation(), old);
        assert_eq!(csr.memory().pool(PoolKind::Temporary).len(), 1);

        assert_eq!(csr.cleanup_resources(), Err(Error::WaitTimeout));
        assert_eq!(csr.memory().pool(PoolKind::Temporary).len(), 1);

        csr.backend().complete_up_to(1);
        csr.cleanup_resources().unwrap();
        assert_eq!(csr.memory().pool(PoolKind::Temporary).len(), 0);
    }

    #[test]
    fn test_cleanup_reports_eviction_candidates() {
        let (mut csr, mut task) = setup(CsrConfig::new(), MockBackend::new());
        let buffer = csr
            .memory_mut()
            .allocate(&AllocationRequest::new(ByteSize::KIB_4, AllocationType::Buffer))
            .unwrap();

        csr.make_resident(buffer).unwrap();
        flush(&mut csr, &mut task, 0, DispatchFlags::new()).unwrap();
        assert_eq!(csr.cleanup_resources().unwrap(), alloc::vec![buffer]);
        assert!(csr.cleanup_resources().unwrap().is_empty());

        // Resident again for the next task, so not evictable
        csr.make_resident(buffer).unwrap();
        flush(&mut csr, &mut task, 0, DispatchFlags::new()).unwrap();
        csr.make_resident(buffer).unwrap();
        let evictable = csr.cleanup_resources().unwrap();
        assert!(!evictable.contains(&buffer));
        assert!(!evictable.contains(&task.dsh.allocation().unwrap()));
    }

    #[test]
    fn test_full_task_stream_programs_nothing() {
        let (mut csr, mut task) = setup(CsrConfig::new(), MockBackend::new());
        let fill = alloc::vec![0u8; task.stream.available()];
        csr.write_stream(&mut task.stream, &fill).unwrap();

        let start = task.stream.used();
        let result = csr.flush_task(
            &mut task.stream,
            start,
            &task.dsh,
            &task.ioh,
            &task.ssh,
            0,
            &DispatchFlags::new().guarded(true),
        );
        assert_eq!(result, Err(Error::CommandBufferFull));
        assert!(!csr.state().preamble_sent);
        assert_eq!(csr.command_stream().used(), 0);
        assert_eq!(csr.peek_task_count(), 0);
        assert!(csr.residency().surfaces().is_empty());

        task.stream = csr.create_task_stream(ByteSize::KIB_4).unwrap();
        let stamp = flush(&mut csr, &mut task, 0, DispatchFlags::new().guarded(true)).unwrap();
        assert_eq!(stamp.task_count, 1);

        let submission = csr.backend().last_submission().unwrap();
        assert_eq!(submission.count(CommandKind::Preamble), 1);
        assert_eq!(submission.count(CommandKind::PipelineSelect), 1);
        assert_eq!(submission.count(CommandKind::StateBaseAddress), 1);
    }

    #[test]
    fn test_heap_growth_reprograms_base() {
        let (mut csr, mut task) = setup(CsrConfig::new(), MockBackend::new());
        flush(&mut csr, &mut task, 0, DispatchFlags::new()).unwrap();
        csr.ensure_heap_space(&mut task.dsh, 0x3000).unwrap();
        flush(&mut csr, &mut task, 0, DispatchFlags::new()).unwrap();

        let submission = csr.backend().last_submission().unwrap();
        let commands = submission.commands();
        let sba = commands.iter().find_map(|command| match command {
            DecodedCommand::Command(Command::StateBaseAddress(sba)) => Some(*sba),
            _ => None,
        });
        assert_eq!(sba.map(|sba| sba.dynamic_state), Some(task.dsh.base()));
        assert_eq!(csr.stats().state_base_addresses, 2);
    }

    #[test]
    fn test_heap_exhaustion() {
        let (mut csr, mut task) = setup(CsrConfig::new(), MockBackend::new());
        csr.backend_mut().fail_allocations_after(0);
        assert_eq!(
            csr.ensure_heap_space(&mut task.ioh, 0x2000),
            Err(Error::HeapExhausted)
        );
    }

    #[test]
    fn test_submission_failure() {
        let (mut csr, mut task) = setup(CsrConfig::new(), MockBackend::new());
        csr.backend_mut().fail_submissions(true);

        let stamp = flush(&mut csr, &mut task, 0, DispatchFlags::new().guarded(true)).unwrap();
        assert!(stamp.is_failed());
        assert_eq!(csr.peek_latest_sent_task_count(), 1);
        assert_eq!(csr.peek_latest_flushed_task_count(), 0);
        assert_eq!(csr.finish(), Err(Error::SubmissionFailed));
        assert_eq!(csr.stats().failed_submissions, 1);
    }

    #[test]
    fn test_eager_flush_over_budget() {
        let config = CsrConfig::batched()
            .with_command_stream_size(ByteSize::KIB_4)
            .with_eager_flush_budget(BudgetPolicy::Absolute(ByteSize::from_kib(32)));
        let (mut csr, mut task) = setup(config, MockBackend::new());
        let flags = DispatchFlags::new().guarded(true);

        // Heaps, tag and both streams
        flush(&mut csr, &mut task, 0, flags).unwrap();
        assert_eq!(csr.aggregator().pending_footprint(), ByteSize::from_kib(24));
        assert!(csr.backend().submissions().is_empty());

        flush(&mut csr, &mut task, 0, flags).unwrap();
        assert_eq!(csr.stats().eager_flushes, 1);
        assert_eq!(csr.backend().submissions().len(), 1);
        assert_eq!(csr.aggregator().len(), 1);
    }

    #[test]
    fn test_empty_flush_is_not_submitted() {
        let (mut csr, mut task) = setup(CsrConfig::new(), MockBackend::new());
        flush(&mut csr, &mut task, 0, DispatchFlags::new()).unwrap();

        let stamp = flush_empty(&mut csr, &mut task, DispatchFlags::new());
        assert_eq!(stamp.task_count, 2);
        assert_eq!(csr.backend().submissions().len(), 1);
        assert_eq!(csr.peek_latest_flushed_task_count(), 1);
        assert!(csr.is_task_complete(2));
        assert!(csr.residency().surfaces().is_empty());
    }

    #[test]
    fn test_blocking_wait_timeout() {
        let (mut csr, mut task) = setup(CsrConfig::new(), MockBackend::manual());
        let result = flush(&mut csr, &mut task, 0, DispatchFlags::new().blocking(true));
        assert_eq!(result, Err(Error::WaitTimeout));
        assert_eq!(csr.backend().wait_calls(), 1);
        assert!(!csr.is_task_complete(1));

        csr.backend().complete_up_to(1);
        csr.finish().unwrap();
        assert!(csr.is_task_complete(1));
    }

    #[test]
    fn test_wait_reports_hang() {
        let (mut csr, mut task) = setup(CsrConfig::new(), MockBackend::manual());
        flush(&mut csr, &mut task, 0, DispatchFlags::new()).unwrap();
        csr.backend_mut().set_hang(true);
        assert_eq!(csr.wait_for_task_count(1), Err(Error::GpuHang));
    }

    #[test]
    fn test_sampler_cache_flush_sequence() {
        let config = CsrConfig::new().with_sampler_cache_flush_workaround(true);
        let (mut csr, mut task) = setup(config, MockBackend::new());
        csr.set_sampler_cache_flush_state(SamplerCacheFlushState::Before);

        flush(&mut csr, &mut task, 0, DispatchFlags::new()).unwrap();
        assert_eq!(csr.state().sampler_cache_flush, SamplerCacheFlushState::After);
        flush(&mut csr, &mut task, 0, DispatchFlags::new()).unwrap();
        assert_eq!(csr.state().sampler_cache_flush, SamplerCacheFlushState::NotRequired);
        flush(&mut csr, &mut task, 0, DispatchFlags::new()).unwrap();
        assert_eq!(csr.stats().sampler_cache_flushes, 2);
    }

    #[test]
    fn test_preemption_and_arbitration_changes() {
        let (mut csr, mut task) = setup(CsrConfig::new(), MockBackend::new());
        flush(&mut csr, &mut task, 0, DispatchFlags::new()).unwrap();

        csr.request_thread_arbitration_policy(ThreadArbitrationPolicy::RoundRobin);
        let flags = DispatchFlags {
            preemption_mode: PreemptionMode::MidThread,
            use_slm: true,
            ..DispatchFlags::new()
        };
        flush(&mut csr, &mut task, 0, flags).unwrap();

        let submission = csr.backend().last_submission().unwrap();
        assert_eq!(submission.count(CommandKind::Preemption), 1);
        assert_eq!(submission.count(CommandKind::ThreadArbitration), 1);
        assert_eq!(submission.count(CommandKind::L3Config), 1);
        assert_eq!(csr.stats().preambles, 1);
    }

    #[test]
    fn test_force_reprogramming() {
        let config = CsrConfig::new().with_force_csr_reprogramming(true);
        let (mut csr, mut task) = setup(config, MockBackend::new());
        flush(&mut csr, &mut task, 0, DispatchFlags::new()).unwrap();
        flush(&mut csr, &mut task, 0, DispatchFlags::new()).unwrap();
        assert_eq!(csr.stats().preambles, 2);
    }

    #[test]
    fn test_switch_to_immediate_flushes() {
        let (mut csr, mut task) = setup(CsrConfig::batched(), MockBackend::new());
        flush(&mut csr, &mut task, 0, DispatchFlags::new().guarded(true)).unwrap();
        csr.set_dispatch_mode(DispatchMode::Immediate).unwrap();
        assert!(csr.aggregator().is_empty());
        assert_eq!(csr.backend().submissions().len(), 1);
    }

    #[test]
    fn test_receiver_stream_grows() {
        let config = CsrConfig::new().with_command_stream_size(ByteSize::from_bytes(64));
        let (mut csr, mut task) = setup(config, MockBackend::new());
        flush(&mut csr, &mut task, 0, DispatchFlags::new()).unwrap();
        assert!(csr.stats().stream_grows >= 1);
        assert_eq!(csr.backend().submissions().len(), 1);
    }

    #[test]
    fn test_shutdown_frees_everything() {
        let (mut csr, mut task) = setup(CsrConfig::batched(), MockBackend::new());
        flush(&mut csr, &mut task, 0, DispatchFlags::new().guarded(true)).unwrap();
        let backend = csr.shutdown().unwrap();
        assert_eq!(backend.submissions().len(), 1);
        assert_eq!(backend.live_allocations(), 0);
    }
}
