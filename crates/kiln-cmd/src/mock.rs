//! # Mock Backend
//!
//! In-memory device for tests: hands out bump-allocated GPU addresses,
//! records every physical submission with a copy of its bytes and reports
//! completion either immediately or when a test says so.

use alloc::sync::Arc;
use alloc::vec::Vec;

use hashbrown::HashMap;
use kiln_core::{
    AllocationRequest, ByteSize, CompletionCounter, EngineId, Error, FlushStamp, GpuAddr,
    MemoryBackend, ResidentRange, Result, Submission, SubmissionBackend, TaskCount, ThrottleLevel,
};

use crate::encoder::{decode_stream, CommandKind, DecodedCommand};

/// A submission as the mock saw it
#[derive(Debug, Clone)]
pub struct RecordedSubmission {
    /// Chain head
    pub head: GpuAddr,
    /// Fragment addresses and bytes, in execution order
    pub fragments: Vec<(GpuAddr, Vec<u8>)>,
    /// Resident memory
    pub residency: Vec<ResidentRange>,
    /// Task count the chain signals
    pub task_count: TaskCount,
    /// Engine
    pub engine: EngineId,
    /// Stamp returned
    pub stamp: FlushStamp,
    /// Low priority
    pub low_priority: bool,
    /// Throttle
    pub throttle: ThrottleLevel,
}

impl RecordedSubmission {
    /// Decode every fragment, in execution order
    pub fn commands(&self) -> Vec<DecodedCommand> {
        self.fragments
            .iter()
            .flat_map(|(_, bytes)| decode_stream(bytes))
            .collect()
    }

    /// Count commands of one category
    pub fn count(&self, kind: CommandKind) -> usize {
        crate::encoder::count_kind(&self.commands(), kind)
    }

    /// Whether memory at `gpu_addr` was resident
    pub fn is_resident(&self, gpu_addr: GpuAddr) -> bool {
        self.residency.iter().any(|range| range.gpu_addr == gpu_addr)
    }
}

/// Test device
#[derive(Debug)]
pub struct MockBackend {
    next_addr: u64,
    live: HashMap<GpuAddr, ByteSize>,
    budget: ByteSize,
    submissions: Vec<RecordedSubmission>,
    completion: Arc<CompletionCounter>,
    auto_complete: bool,
    allocations_left: Option<usize>,
    fail_submissions: bool,
    hang: bool,
    wait_calls: usize,
}

impl MockBackend {
    /// Device that completes everything on submission
    pub fn new() -> Self {
        Self {
            next_addr: 0x1_0000_0000,
            live: HashMap::new(),
            budget: ByteSize::from_mib(256),
            submissions: Vec::new(),
            completion: Arc::new(CompletionCounter::new()),
            auto_complete: true,
            allocations_left: None,
            fail_submissions: false,
            hang: false,
            wait_calls: 0,
        }
    }

    /// Device that completes work only through [`MockBackend::complete_up_to`]
    pub fn manual() -> Self {
        Self {
            auto_complete: false,
            ..Self::new()
        }
    }

    /// Set the reported budget
    pub fn with_budget(mut self, budget: ByteSize) -> Self {
        self.budget = budget;
        self
    }

    /// Fail allocations after `count` more succeed
    pub fn fail_allocations_after(&mut self, count: usize) {
        self.allocations_left = Some(count);
    }

    /// Make every following submission fail
    pub fn fail_submissions(&mut self, fail: bool) {
        self.fail_submissions = fail;
    }

    /// Make waits report a hang
    pub fn set_hang(&mut self, hang: bool) {
        self.hang = hang;
    }

    /// Complete everything up to `task_count`
    pub fn complete_up_to(&self, task_count: TaskCount) {
        self.completion.signal(task_count);
    }

    /// Complete everything submitted so far
    pub fn complete_all(&self) {
        if let Some(last) = self.submissions.iter().map(|s| s.task_count).max() {
            self.completion.signal(last);
        }
    }

    /// Shared completion counter
    pub fn completion(&self) -> Arc<CompletionCounter> {
        Arc::clone(&self.completion)
    }

    /// Submissions so far
    pub fn submissions(&self) -> &[RecordedSubmission] {
        &self.submissions
    }

    /// Most recent submission
    pub fn last_submission(&self) -> Option<&RecordedSubmission> {
        self.submissions.last()
    }

    /// Number of live allocations
    pub fn live_allocations(&self) -> usize {
        self.live.len()
    }

    /// Number of wait calls
    pub fn wait_calls(&self) -> usize {
        self.wait_calls
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend for MockBackend {
    fn allocate(&mut self, request: &AllocationRequest) -> Result<GpuAddr> {
        if let Some(left) = self.allocations_left.as_mut() {
            if *left == 0 {
                return Err(Error::OutOfMemory);
            }
            *left -= 1;
        }

        let gpu_addr = GpuAddr::new(self.next_addr);
        self.next_addr += request.size.align_up(0x1000).as_bytes().max(0x1000);
        self.live.insert(gpu_addr, request.size);
        Ok(gpu_addr)
    }

    fn free(&mut self, gpu_addr: GpuAddr, _size: ByteSize) {
        self.live.remove(&gpu_addr);
    }

    fn budget(&self) -> ByteSize {
        self.budget
    }
}

impl SubmissionBackend for MockBackend {
    fn submit(&mut self, submission: &Submission<'_>) -> Result<FlushStamp> {
        if self.fail_submissions {
            return Err(Error::SubmissionFailed);
        }
        let head = submission.head().ok_or(Error::InvalidParameter)?;

        let stamp = FlushStamp::new(self.submissions.len() as u64 + 1);
        self.submissions.push(RecordedSubmission {
            head,
            fragments: submission
                .fragments
                .iter()
                .map(|fragment| (fragment.gpu_addr, fragment.bytes.to_vec()))
                .collect(),
            residency: submission.residency.to_vec(),
            task_count: submission.task_count,
            engine: submission.engine,
            stamp,
            low_priority: submission.low_priority,
            throttle: submission.throttle,
        });

        if self.auto_complete {
            self.completion.signal(submission.task_count);
        }
        Ok(stamp)
    }

    fn wait(&mut self, _stamp: FlushStamp, _timeout_ns: u64) -> Result<()> {
        self.wait_calls += 1;
        if self.hang {
            return Err(Error::GpuHang);
        }
        Ok(())
    }

    fn completed_task_count(&self) -> TaskCount {
        self.completion.get()
    }
}
