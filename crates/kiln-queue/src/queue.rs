//! # Command Queue
//!
//! Blocking layer in front of the shared receiver.
//!
//! ## States
//!
//! ```text
//!            enqueue behind a pending event
//!   ┌────────────┐ ─────────────────────────► ┌────────────┐
//!   │ Unblocked  │                            │  Blocked   │──┐ enqueue:
//!   └────────────┘ ◄───────────────────────── └────────────┘◄─┘ new tail
//!        virtual event submitted or terminated
//! ```
//!
//! A blocked queue parks every enqueue behind its virtual event, the event
//! of the last parked task, and never touches the receiver. Parked tasks
//! reach the receiver in enqueue order once their dependencies resolve.
//!
//! The queue holds one reference to its virtual event. An output event
//! handed to the caller carries a second one, so replacing the virtual event
//! never destroys an event the caller still owns.

use alloc::sync::Arc;
use alloc::vec::Vec;

use kiln_core::{ByteSize, CompletionStamp, DeviceBackend, Error, Result, TaskCount, TaskLevel};
use kiln_cmd::{CommandEncoder, CommandStreamReceiver, HeapKind, IndirectHeap, LinearStream};
use kiln_mem::PoolKind;
use log::{debug, error, warn};
use spin::Mutex;

use crate::context::Shared;
use crate::event::{EventGraph, EventHandle};
use crate::task::{DeferredTask, QueueId, TaskDescriptor};

/// Initial task stream size
const TASK_STREAM_SIZE: ByteSize = ByteSize::KIB_64;

/// Initial size of each indirect heap
const HEAP_SIZE: ByteSize = ByteSize::KIB_64;

/// Queue statistics
#[derive(Debug, Clone, Default)]
pub struct QueueStats {
    /// Tasks sent straight to the receiver
    pub immediate_enqueues: u64,
    /// Tasks parked behind a pending event
    pub blocked_enqueues: u64,
    /// Parked tasks sent once unblocked
    pub unblocked_enqueues: u64,
    /// Tasks dropped because a dependency terminated
    pub aborted_enqueues: u64,
}

// =============================================================================
// QUEUE STATE
// =============================================================================

/// Per-queue state, guarded by the queue lock
#[derive(Debug)]
pub(crate) struct QueueState {
    virtual_event: Option<EventHandle>,
    task_level: TaskLevel,
    task_count: TaskCount,
    stream: LinearStream,
    dsh: IndirectHeap,
    ioh: IndirectHeap,
    ssh: IndirectHeap,
    pub(crate) stats: QueueStats,
}

impl QueueState {
    pub(crate) fn new<E: CommandEncoder, B: DeviceBackend>(
        csr: &mut CommandStreamReceiver<E, B>,
    ) -> Result<Self> {
        Ok(Self {
            virtual_event: None,
            task_level: 0,
            task_count: 0,
            stream: csr.create_task_stream(TASK_STREAM_SIZE)?,
            dsh: csr.allocate_indirect_heap(HeapKind::DynamicState, HEAP_SIZE)?,
            ioh: csr.allocate_indirect_heap(HeapKind::IndirectObject, HEAP_SIZE)?,
            ssh: csr.allocate_indirect_heap(HeapKind::SurfaceState, HEAP_SIZE)?,
            stats: QueueStats::default(),
        })
    }

    /// Drop the virtual event once it no longer blocks, and report whether
    /// the queue is blocked.
    fn refresh_blocked(&mut self, graph: &mut EventGraph) -> Result<bool> {
        let Some(event) = self.virtual_event else {
            return Ok(false);
        };
        match graph.status(event) {
            Ok(status) if status.is_pending() => Ok(true),
            Ok(_) => {
                self.virtual_event = None;
                graph.release(event)?;
                Ok(false)
            }
            Err(Error::StaleEventHandle) => {
                self.virtual_event = None;
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    /// Write a task into the queue's stream and heaps and flush it
    pub(crate) fn submit<E: CommandEncoder, B: DeviceBackend>(
        &mut self,
        csr: &mut CommandStreamReceiver<E, B>,
        task: TaskDescriptor,
        dependency_level: Option<TaskLevel>,
    ) -> Result<CompletionStamp> {
        let reserve = task.commands.len() + csr.task_stream_reserve();
        csr.ensure_stream_space(&mut self.stream, reserve)?;

        let heaps = [
            (&mut self.dsh, &task.dynamic_state),
            (&mut self.ioh, &task.indirect_object),
            (&mut self.ssh, &task.surface_state),
        ];
        for (heap, bytes) in heaps {
            if !bytes.is_empty() {
                csr.ensure_heap_space(heap, bytes.len())?;
                csr.write_stream(heap.stream_mut(), bytes)?;
            }
        }

        for surface in &task.surfaces {
            csr.make_resident(*surface)?;
        }
        if task.scratch_size > 0 {
            csr.set_required_scratch_size(task.scratch_size);
        }

        let start = self.stream.used();
        csr.write_stream(&mut self.stream, &task.commands)?;

        let level = dependency_level.map_or(self.task_level, |level| level.max(self.task_level));
        let stamp = csr.flush_task(
            &mut self.stream,
            start,
            &self.dsh,
            &self.ioh,
            &self.ssh,
            level,
            &task.flags,
        )?;
        if !stamp.is_failed() {
            self.task_level = stamp.task_level;
            self.task_count = stamp.task_count;
        }
        Ok(stamp)
    }
}

// =============================================================================
// COMMAND QUEUE
// =============================================================================

/// In-order command queue of a context
#[derive(Debug)]
pub struct CommandQueue<E, B> {
    id: QueueId,
    state: Arc<Mutex<QueueState>>,
    shared: Arc<Shared<E, B>>,
}

impl<E: CommandEncoder, B: DeviceBackend> CommandQueue<E, B> {
    pub(crate) fn new(id: QueueId, state: Arc<Mutex<QueueState>>, shared: Arc<Shared<E, B>>) -> Self {
        Self { id, state, shared }
    }

    /// Queue identifier
    pub fn id(&self) -> QueueId {
        self.id
    }

    /// Enqueue a task after the events of `wait_list`
    ///
    /// If a dependency is pending, or the queue is already blocked, the task
    /// is parked and becomes the queue's virtual event. Otherwise it is
    /// flushed right away. With `want_event` the task's event is returned
    /// and the caller owns one reference to it.
    pub fn enqueue(
        &self,
        task: TaskDescriptor,
        wait_list: &[EventHandle],
        want_event: bool,
    ) -> Result<Option<EventHandle>> {
        let mut graph = self.shared.graph.lock();
        let mut queue = self.state.lock();

        let mut wait: Vec<EventHandle> = wait_list.to_vec();
        if queue.refresh_blocked(&mut graph)? {
            wait.extend(queue.virtual_event);
        }
        let dependencies = graph.classify(&wait)?;

        if let Some(code) = dependencies.terminated {
            warn!("queue {:?}: dependency terminated with {}, task dropped", self.id, code);
            queue.stats.aborted_enqueues += 1;
            return Ok(want_event.then(|| graph.create_terminated(code, 1)));
        }

        if !dependencies.pending.is_empty() {
            let refcount = if want_event { 2 } else { 1 };
            let deferred = DeferredTask {
                queue: self.id,
                task,
            };
            let event = graph.create_deferred(deferred, &dependencies, refcount)?;
            if let Some(previous) = queue.virtual_event.replace(event) {
                debug!("queue {:?}: virtual event {:?} -> {:?}", self.id, previous, event);
                graph.release(previous)?;
            }
            queue.stats.blocked_enqueues += 1;
            return Ok(want_event.then_some(event));
        }

        let stamp = {
            let mut csr = self.shared.csr.lock();
            queue.submit(&mut *csr, task, dependencies.level)?
        };
        queue.stats.immediate_enqueues += 1;
        Ok(want_event.then(|| graph.create_submitted(stamp, 1)))
    }

    /// Whether enqueues are currently parked
    pub fn is_queue_blocked(&self) -> bool {
        let mut graph = self.shared.graph.lock();
        let mut queue = self.state.lock();
        match queue.refresh_blocked(&mut graph) {
            Ok(blocked) => blocked,
            Err(err) => {
                error!("queue {:?}: virtual event lookup failed: {}", self.id, err);
                false
            }
        }
    }

    /// Submit everything the receiver has batched
    pub fn flush(&self) -> Result<()> {
        self.shared.csr.lock().flush_batched_submissions()
    }

    /// Wait for all work that reached the receiver
    ///
    /// A blocked queue fails with [`Error::QueueBlocked`] instead of waiting
    /// on work that may never be released.
    pub fn finish(&self) -> Result<()> {
        {
            let mut graph = self.shared.graph.lock();
            let mut queue = self.state.lock();
            if queue.refresh_blocked(&mut graph)? {
                return Err(Error::QueueBlocked);
            }
        }
        self.shared.csr.lock().finish()
    }

    /// Task count of the last task this queue flushed
    pub fn task_count(&self) -> TaskCount {
        self.state.lock().task_count
    }

    /// Task level of the last task this queue flushed
    pub fn task_level(&self) -> TaskLevel {
        self.state.lock().task_level
    }

    /// Get statistics
    pub fn stats(&self) -> QueueStats {
        self.state.lock().stats.clone()
    }

    /// Destroy the queue, returning its stream and heaps to the pools
    pub fn release(self) -> Result<()> {
        let mut graph = self.shared.graph.lock();
        if self.state.lock().refresh_blocked(&mut graph)? {
            return Err(Error::QueueBlocked);
        }
        self.shared.remove_queue(self.id);

        let state = Arc::try_unwrap(self.state)
            .map_err(|_| Error::InvalidState)?
            .into_inner();
        let mut csr = self.shared.csr.lock();
        if let Some(stream) = state.stream.allocation() {
            let task_count = csr.peek_task_count();
            csr.memory_mut().store(stream, PoolKind::Reusable, task_count)?;
        }
        for heap in [state.dsh, state.ioh, state.ssh] {
            csr.release_indirect_heap(heap)?;
        }
        debug!("queue {:?} released", self.id);
        Ok(())
    }
}
