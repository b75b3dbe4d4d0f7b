//! # Context
//!
//! Owner of the event graph and the receiver shared by its queues.
//!
//! Lock order is graph, queue list, queue, receiver. Status changes and
//! enqueues both start at the graph lock, so releasing parked work and new
//! enqueues on the same queue never interleave.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;

use kiln_core::{
    AllocationRequest, AllocationType, ByteSize, CsrConfig, DeviceBackend, Error, Result,
};
use kiln_cmd::{CommandEncoder, CommandStreamReceiver};
use kiln_mem::{AllocationId, PoolKind};
use log::{error, info};
use spin::Mutex;

use crate::event::{EventGraph, EventHandle, EventStatus, EXECUTION_FAILED};
use crate::queue::{CommandQueue, QueueState};
use crate::task::QueueId;

/// State shared by a context and its queues
#[derive(Debug)]
pub(crate) struct Shared<E, B> {
    pub(crate) graph: Mutex<EventGraph>,
    pub(crate) queues: Mutex<Vec<Option<Arc<Mutex<QueueState>>>>>,
    pub(crate) csr: Mutex<CommandStreamReceiver<E, B>>,
}

impl<E: CommandEncoder, B: DeviceBackend> Shared<E, B> {
    fn queue(&self, id: QueueId) -> Result<Arc<Mutex<QueueState>>> {
        self.queues
            .lock()
            .get(id.0 as usize)
            .and_then(Option::clone)
            .ok_or(Error::NotFound)
    }

    pub(crate) fn remove_queue(&self, id: QueueId) {
        if let Some(slot) = self.queues.lock().get_mut(id.0 as usize) {
            *slot = None;
        }
    }

    /// Flush released tasks in order, following the tasks they release in turn
    ///
    /// A task that fails to flush is terminated, which aborts its
    /// dependents. The first such error is returned after the work list is
    /// drained.
    fn run_ready(&self, graph: &mut EventGraph, mut ready: VecDeque<EventHandle>) -> Result<()> {
        let mut first_error = None;

        while let Some(event) = ready.pop_front() {
            let Some(deferred) = graph.take_command(event)? else {
                continue;
            };
            let level = graph.get(event)?.dependency_level();

            let result = self.queue(deferred.queue).and_then(|queue| {
                let mut queue = queue.lock();
                let stamp = {
                    let mut csr = self.csr.lock();
                    queue.submit(&mut *csr, deferred.task, level)?
                };
                queue.stats.unblocked_enqueues += 1;
                Ok(stamp)
            });

            let released = match result {
                Ok(stamp) => graph.mark_submitted(event, stamp)?,
                Err(err) => {
                    error!("released task {:?} failed: {}", event, err);
                    first_error.get_or_insert(err);
                    graph.terminate(event, EXECUTION_FAILED)?
                }
            };
            ready.extend(released);
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Context: queues, events and the receiver they share
#[derive(Debug)]
pub struct Context<E, B> {
    shared: Arc<Shared<E, B>>,
}

impl<E: CommandEncoder, B: DeviceBackend> Context<E, B> {
    /// Create a context around a new receiver
    pub fn new(encoder: E, backend: B, config: CsrConfig) -> Result<Self> {
        let csr = CommandStreamReceiver::new(encoder, backend, config)?;
        Ok(Self {
            shared: Arc::new(Shared {
                graph: Mutex::new(EventGraph::new()),
                queues: Mutex::new(Vec::new()),
                csr: Mutex::new(csr),
            }),
        })
    }

    /// Create a queue
    pub fn create_queue(&self) -> Result<CommandQueue<E, B>> {
        let mut queues = self.shared.queues.lock();
        let id = QueueId(queues.len() as u32);
        let state = {
            let mut csr = self.shared.csr.lock();
            QueueState::new(&mut *csr)?
        };
        let state = Arc::new(Mutex::new(state));
        queues.push(Some(Arc::clone(&state)));
        info!("created queue {:?}", id);
        Ok(CommandQueue::new(id, state, Arc::clone(&self.shared)))
    }

    /// Create a buffer the application can hand to tasks as a surface
    pub fn create_buffer(&self, size: ByteSize) -> Result<AllocationId> {
        self.shared
            .csr
            .lock()
            .memory_mut()
            .allocate(&AllocationRequest::new(size, AllocationType::Buffer))
    }

    /// Release a buffer once every flushed task using it completes
    pub fn release_buffer(&self, buffer: AllocationId) -> Result<()> {
        let mut csr = self.shared.csr.lock();
        let task_count = csr.peek_task_count();
        csr.memory_mut().store(buffer, PoolKind::Temporary, task_count)
    }

    // =========================================================================
    // Events
    // =========================================================================

    /// Create a user event, owned by the caller
    pub fn create_user_event(&self) -> EventHandle {
        self.shared.graph.lock().create_user_event()
    }

    /// Complete or terminate a user event
    ///
    /// Tasks released by the change reach the receiver before this returns.
    pub fn set_user_event_status(&self, event: EventHandle, status: EventStatus) -> Result<()> {
        let mut graph = self.shared.graph.lock();
        let ready = graph.set_user_status(event, status)?;
        self.shared.run_ready(&mut graph, ready)
    }

    /// Status of an event, polling the receiver for submitted ones
    pub fn event_status(&self, event: EventHandle) -> Result<EventStatus> {
        let mut graph = self.shared.graph.lock();
        let status = graph.status(event)?;
        if status != EventStatus::Submitted {
            return Ok(status);
        }

        let Some(task_count) = graph.get(event)?.task_count() else {
            return Ok(status);
        };
        if self.shared.csr.lock().is_task_complete(task_count) {
            graph.mark_complete(event)?;
            return Ok(EventStatus::Complete);
        }
        Ok(status)
    }

    /// Add a reference to an event
    pub fn retain_event(&self, event: EventHandle) -> Result<()> {
        self.shared.graph.lock().retain(event)
    }

    /// Drop a reference to an event
    pub fn release_event(&self, event: EventHandle) -> Result<()> {
        self.shared.graph.lock().release(event)
    }

    /// Number of live events
    pub fn live_events(&self) -> usize {
        self.shared.graph.lock().len()
    }

    /// Run `f` with exclusive access to the receiver
    pub fn with_receiver<R>(&self, f: impl FnOnce(&mut CommandStreamReceiver<E, B>) -> R) -> R {
        f(&mut self.shared.csr.lock())
    }
}
