//! # Event Graph
//!
//! Arena of events linked by dependency edges.
//!
//! ```text
//!   user event ──┐
//!                ├──► deferred task ──► deferred task (queue tail)
//!   submitted ───┘         │
//!                          └──► deferred task (other queue)
//! ```
//!
//! Events are addressed by generation-checked [`EventHandle`]s. A child keeps
//! a count of unresolved parents; a parent keeps its children in the order
//! they were attached, which is the order they are released in.
//!
//! ## Resolution
//!
//! A parent resolves when it is submitted or completed. Resolution walks the
//! children with an explicit work list and reports the deferred tasks that
//! became ready, in order. Termination instead aborts every pending
//! descendant with the same code.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use kiln_core::{CompletionStamp, Error, Handle, Result, TaskCount, TaskLevel};
use log::{debug, error, trace, warn};

use crate::task::DeferredTask;

/// Handle to an event
pub type EventHandle = Handle<Event>;

/// Termination code of events whose submission failed
pub const EXECUTION_FAILED: i32 = -14;

// =============================================================================
// EVENT
// =============================================================================

/// Execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStatus {
    /// Waiting on dependencies or on the user
    NotReady,
    /// Handed to the receiver
    Submitted,
    /// Finished on the device
    Complete,
    /// Failed or aborted with a code
    Terminated(i32),
}

impl EventStatus {
    /// Submitted or complete
    pub const fn is_resolved(self) -> bool {
        matches!(self, Self::Submitted | Self::Complete)
    }

    /// Terminated with an error
    pub const fn is_terminated(self) -> bool {
        matches!(self, Self::Terminated(_))
    }

    /// Still waiting
    pub const fn is_pending(self) -> bool {
        matches!(self, Self::NotReady)
    }
}

/// Origin of an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Status set by the application
    User,
    /// Tracks an enqueued task
    Command,
}

/// Node of the event graph
#[derive(Debug)]
pub struct Event {
    kind: EventKind,
    status: EventStatus,
    pending_parents: usize,
    children: Vec<EventHandle>,
    command: Option<DeferredTask>,
    task_count: Option<TaskCount>,
    task_level: Option<TaskLevel>,
    dependency_level: Option<TaskLevel>,
    refcount: u32,
}

impl Event {
    fn new(kind: EventKind, status: EventStatus, refcount: u32) -> Self {
        Self {
            kind,
            status,
            pending_parents: 0,
            children: Vec::new(),
            command: None,
            task_count: None,
            task_level: None,
            dependency_level: None,
            refcount,
        }
    }

    /// Origin
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Status
    pub fn status(&self) -> EventStatus {
        self.status
    }

    /// Task count once submitted
    pub fn task_count(&self) -> Option<TaskCount> {
        self.task_count
    }

    /// Task level once submitted
    pub fn task_level(&self) -> Option<TaskLevel> {
        self.task_level
    }

    /// Lowest level the task may run at, from its resolved parents
    pub fn dependency_level(&self) -> Option<TaskLevel> {
        self.dependency_level
    }

    /// Parents not yet resolved
    pub fn pending_parents(&self) -> usize {
        self.pending_parents
    }

    /// Whether a deferred task is still attached
    pub fn has_command(&self) -> bool {
        self.command.is_some()
    }

    /// Reference count
    pub fn refcount(&self) -> u32 {
        self.refcount
    }

    fn raise_dependency_level(&mut self, parent_level: Option<TaskLevel>) {
        if let Some(level) = parent_level {
            let level = level + 1;
            self.dependency_level = Some(self.dependency_level.map_or(level, |l| l.max(level)));
        }
    }
}

// =============================================================================
// DEPENDENCIES
// =============================================================================

/// A wait list sorted by state
#[derive(Debug, Clone, Default)]
pub struct Dependencies {
    /// Events still pending
    pub pending: Vec<EventHandle>,
    /// Code of the first terminated event
    pub terminated: Option<i32>,
    /// Level derived from the resolved events
    pub level: Option<TaskLevel>,
}

impl Dependencies {
    /// Nothing to wait for and nothing failed
    pub fn is_ready(&self) -> bool {
        self.pending.is_empty() && self.terminated.is_none()
    }
}

// =============================================================================
// GRAPH
// =============================================================================

/// Graph statistics
#[derive(Debug, Clone, Default)]
pub struct GraphStats {
    /// Events created
    pub created: u64,
    /// Events destroyed
    pub destroyed: u64,
    /// Deferred tasks released to run
    pub unblocked: u64,
    /// Deferred tasks aborted
    pub aborted: u64,
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    entry: Option<Event>,
}

/// Arena of events
#[derive(Debug, Default)]
pub struct EventGraph {
    slots: Vec<Slot>,
    free_slots: Vec<u32>,
    live: usize,
    stats: GraphStats,
}

impl EventGraph {
    /// Create an empty graph
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&mut self, event: Event) -> EventHandle {
        self.stats.created += 1;
        self.live += 1;

        if let Some(index) = self.free_slots.pop() {
            let slot = &mut self.slots[index as usize];
            slot.entry = Some(event);
            return EventHandle::new(index, slot.generation);
        }

        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            entry: Some(event),
        });
        EventHandle::new(index, 0)
    }

    fn destroy(&mut self, handle: EventHandle) {
        if let Some(slot) = self.slots.get_mut(handle.index() as usize) {
            if slot.generation == handle.generation() && slot.entry.take().is_some() {
                slot.generation = slot.generation.wrapping_add(1);
                self.free_slots.push(handle.index());
                self.live -= 1;
                self.stats.destroyed += 1;
                trace!("destroyed {:?}", handle);
            }
        }
    }

    /// Look up an event
    pub fn get(&self, handle: EventHandle) -> Result<&Event> {
        self.slots
            .get(handle.index() as usize)
            .filter(|slot| slot.generation == handle.generation())
            .and_then(|slot| slot.entry.as_ref())
            .ok_or(Error::StaleEventHandle)
    }

    fn get_mut(&mut self, handle: EventHandle) -> Result<&mut Event> {
        self.slots
            .get_mut(handle.index() as usize)
            .filter(|slot| slot.generation == handle.generation())
            .and_then(|slot| slot.entry.as_mut())
            .ok_or(Error::StaleEventHandle)
    }

    /// Status of an event
    pub fn status(&self, handle: EventHandle) -> Result<EventStatus> {
        self.get(handle).map(Event::status)
    }

    /// Check if a handle is live
    pub fn contains(&self, handle: EventHandle) -> bool {
        self.get(handle).is_ok()
    }

    /// Number of live events
    pub fn len(&self) -> usize {
        self.live
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Get statistics
    pub fn stats(&self) -> &GraphStats {
        &self.stats
    }

    // =========================================================================
    // Creation
    // =========================================================================

    /// Create a pending user event
    pub fn create_user_event(&mut self) -> EventHandle {
        self.insert(Event::new(EventKind::User, EventStatus::NotReady, 1))
    }

    /// Create the event of a task that went straight to the receiver
    pub fn create_submitted(&mut self, stamp: CompletionStamp, refcount: u32) -> EventHandle {
        let mut event = Event::new(EventKind::Command, submitted_status(stamp), refcount);
        event.task_count = Some(stamp.task_count);
        event.task_level = Some(stamp.task_level);
        self.insert(event)
    }

    /// Create the event of a task that never ran
    pub fn create_terminated(&mut self, code: i32, refcount: u32) -> EventHandle {
        self.insert(Event::new(EventKind::Command, EventStatus::Terminated(code), refcount))
    }

    /// Park a task behind its pending dependencies
    pub fn create_deferred(
        &mut self,
        command: DeferredTask,
        dependencies: &Dependencies,
        refcount: u32,
    ) -> Result<EventHandle> {
        for parent in &dependencies.pending {
            if !self.status(*parent)?.is_pending() {
                return Err(Error::InvalidEventState);
            }
        }

        let mut event = Event::new(EventKind::Command, EventStatus::NotReady, refcount);
        event.pending_parents = dependencies.pending.len();
        event.dependency_level = dependencies.level;
        event.command = Some(command);
        let handle = self.insert(event);

        for parent in &dependencies.pending {
            self.get_mut(*parent)?.children.push(handle);
        }
        debug!(
            "deferred {:?} behind {} events",
            handle,
            dependencies.pending.len()
        );
        Ok(handle)
    }

    /// Sort a wait list by the state of its events
    pub fn classify(&self, wait_list: &[EventHandle]) -> Result<Dependencies> {
        let mut dependencies = Dependencies::default();
        for handle in wait_list {
            let event = self.get(*handle)?;
            match event.status {
                EventStatus::NotReady => {
                    if !dependencies.pending.contains(handle) {
                        dependencies.pending.push(*handle);
                    }
                }
                EventStatus::Terminated(code) => {
                    dependencies.terminated.get_or_insert(code);
                }
                EventStatus::Submitted | EventStatus::Complete => {
                    if let Some(level) = event.task_level {
                        let level = level + 1;
                        dependencies.level =
                            Some(dependencies.level.map_or(level, |l| l.max(level)));
                    }
                }
            }
        }
        Ok(dependencies)
    }

    // =========================================================================
    // Reference counting
    // =========================================================================

    /// Add a reference
    pub fn retain(&mut self, handle: EventHandle) -> Result<()> {
        let event = self.get_mut(handle)?;
        if event.refcount == 0 {
            error!("retain of released {:?}", handle);
            return Err(Error::EventDoubleRelease);
        }
        event.refcount += 1;
        Ok(())
    }

    /// Drop a reference
    ///
    /// An event whose last reference goes away while it is still pending
    /// stays in the graph until it resolves.
    pub fn release(&mut self, handle: EventHandle) -> Result<()> {
        let event = self.get_mut(handle)?;
        if event.refcount == 0 {
            error!("double release of {:?}", handle);
            return Err(Error::EventDoubleRelease);
        }
        event.refcount -= 1;
        if event.refcount > 0 {
            return Ok(());
        }

        if event.status.is_pending() {
            if event.kind == EventKind::User {
                warn!("user {:?} released before its status was set", handle);
            } else {
                trace!("{:?} released while pending", handle);
            }
        } else {
            self.destroy(handle);
        }
        Ok(())
    }

    // =========================================================================
    // Status transitions
    // =========================================================================

    /// Set the status of a user event
    ///
    /// Returns the deferred tasks that became ready, in release order.
    pub fn set_user_status(
        &mut self,
        handle: EventHandle,
        status: EventStatus,
    ) -> Result<VecDeque<EventHandle>> {
        if !matches!(status, EventStatus::Complete | EventStatus::Terminated(_)) {
            return Err(Error::InvalidParameter);
        }
        let event = self.get_mut(handle)?;
        if event.kind != EventKind::User || !event.status.is_pending() {
            return Err(Error::InvalidEventState);
        }
        event.status = status;
        debug!("user {:?} -> {:?}", handle, status);
        self.propagate(handle)
    }

    /// Detach the deferred task of a ready event
    pub fn take_command(&mut self, handle: EventHandle) -> Result<Option<DeferredTask>> {
        Ok(self.get_mut(handle)?.command.take())
    }

    /// Record that a task reached the receiver
    ///
    /// Returns the deferred tasks that became ready, in release order.
    pub fn mark_submitted(
        &mut self,
        handle: EventHandle,
        stamp: CompletionStamp,
    ) -> Result<VecDeque<EventHandle>> {
        let event = self.get_mut(handle)?;
        if !event.status.is_pending() || event.pending_parents != 0 {
            return Err(Error::InvalidEventState);
        }
        event.status = submitted_status(stamp);
        event.task_count = Some(stamp.task_count);
        event.task_level = Some(stamp.task_level);
        event.command = None;
        self.propagate(handle)
    }

    /// Terminate a released event whose task could not be flushed
    pub fn terminate(&mut self, handle: EventHandle, code: i32) -> Result<VecDeque<EventHandle>> {
        let event = self.get_mut(handle)?;
        if !event.status.is_pending() {
            return Err(Error::InvalidEventState);
        }
        event.status = EventStatus::Terminated(code);
        event.command = None;
        self.stats.aborted += 1;
        self.propagate(handle)
    }

    /// Record that a submitted task finished
    pub fn mark_complete(&mut self, handle: EventHandle) -> Result<()> {
        let event = self.get_mut(handle)?;
        match event.status {
            EventStatus::Submitted => {
                event.status = EventStatus::Complete;
                Ok(())
            }
            EventStatus::Complete => Ok(()),
            _ => Err(Error::InvalidEventState),
        }
    }

    /// Release the children of a settled event
    ///
    /// Resolved parents release children once their last pending parent is
    /// gone. Terminated parents abort pending children with their code,
    /// which then abort their own children.
    fn propagate(&mut self, root: EventHandle) -> Result<VecDeque<EventHandle>> {
        let mut ready = VecDeque::new();
        let mut work = VecDeque::from([root]);
        let (mut aborted, mut unblocked) = (0, 0);

        while let Some(parent) = work.pop_front() {
            let (status, level, children, refcount) = {
                let event = self.get_mut(parent)?;
                (
                    event.status,
                    event.task_level,
                    core::mem::take(&mut event.children),
                    event.refcount,
                )
            };

            for child in children {
                // Children may be gone or settled through another parent
                let Ok(event) = self.get_mut(child) else {
                    continue;
                };
                if !event.status.is_pending() {
                    continue;
                }

                match status {
                    EventStatus::Terminated(code) => {
                        event.status = EventStatus::Terminated(code);
                        event.command = None;
                        aborted += 1;
                        debug!("aborted {:?} with {}", child, code);
                        work.push_back(child);
                    }
                    _ => {
                        debug_assert!(event.pending_parents > 0, "unbalanced parent count");
                        event.pending_parents = event.pending_parents.saturating_sub(1);
                        event.raise_dependency_level(level);
                        if event.pending_parents == 0 {
                            unblocked += 1;
                            ready.push_back(child);
                        }
                    }
                }
            }

            if refcount == 0 {
                self.destroy(parent);
            }
        }

        self.stats.aborted += aborted;
        self.stats.unblocked += unblocked;
        Ok(ready)
    }
}

fn submitted_status(stamp: CompletionStamp) -> EventStatus {
    if stamp.is_failed() {
        EventStatus::Terminated(EXECUTION_FAILED)
    } else {
        EventStatus::Submitted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{QueueId, TaskDescriptor};
    use kiln_core::FlushStamp;

    fn deferred() -> DeferredTask {
        DeferredTask {
            queue: QueueId(0),
            task: TaskDescriptor::new(alloc::vec![0; 4]),
        }
    }

    fn stamp(task_count: TaskCount, task_level: TaskLevel) -> CompletionStamp {
        CompletionStamp {
            task_count,
            task_level,
            flush_stamp: FlushStamp::new(task_count as u64),
        }
    }

    fn defer(graph: &mut EventGraph, parents: &[EventHandle]) -> EventHandle {
        let dependencies = graph.classify(parents).unwrap();
        graph.create_deferred(deferred(), &dependencies, 1).unwrap()
    }

    #[test]
    fn test_user_event_releases_children_in_order() {
        let mut graph = EventGraph::new();
        let user = graph.create_user_event();
        let a = defer(&mut graph, &[user]);
        let b = defer(&mut graph, &[user]);

        let ready = graph.set_user_status(user, EventStatus::Complete).unwrap();
        assert_eq!(ready, VecDeque::from([a, b]));
        assert!(graph.get(a).unwrap().has_command());
        assert_eq!(graph.stats().unblocked, 2);
    }

    #[test]
    fn test_chain_resolves_iteratively() {
        let mut graph = EventGraph::new();
        let user = graph.create_user_event();
        let mut tail = defer(&mut graph, &[user]);
        let first = tail;
        for _ in 0..1000 {
            tail = defer(&mut graph, &[tail]);
        }

        let mut ready = graph.set_user_status(user, EventStatus::Complete).unwrap();
        assert_eq!(ready, VecDeque::from([first]));

        let mut task_count = 0;
        while let Some(event) = ready.pop_front() {
            assert!(graph.take_command(event).unwrap().is_some());
            task_count += 1;
            ready.extend(graph.mark_submitted(event, stamp(task_count, 0)).unwrap());
        }
        assert_eq!(task_count, 1001);
        assert_eq!(graph.status(tail), Ok(EventStatus::Submitted));
        assert_eq!(graph.get(tail).unwrap().dependency_level(), Some(1));
    }

    #[test]
    fn test_waits_for_every_parent() {
        let mut graph = EventGraph::new();
        let a = graph.create_user_event();
        let b = graph.create_user_event();
        let child = defer(&mut graph, &[a, b]);

        assert!(graph.set_user_status(a, EventStatus::Complete).unwrap().is_empty());
        assert_eq!(graph.get(child).unwrap().pending_parents(), 1);
        let ready = graph.set_user_status(b, EventStatus::Complete).unwrap();
        assert_eq!(ready, VecDeque::from([child]));
    }

    #[test]
    fn test_termination_aborts_descendants() {
        let mut graph = EventGraph::new();
        let user = graph.create_user_event();
        let a = defer(&mut graph, &[user]);
        let b = defer(&mut graph, &[a]);

        let ready = graph.set_user_status(user, EventStatus::Terminated(-5)).unwrap();
        assert!(ready.is_empty());
        assert_eq!(graph.status(a), Ok(EventStatus::Terminated(-5)));
        assert_eq!(graph.status(b), Ok(EventStatus::Terminated(-5)));
        assert!(!graph.get(b).unwrap().has_command());
        assert_eq!(graph.stats().aborted, 2);
    }

    #[test]
    fn test_classify() {
        let mut graph = EventGraph::new();
        let pending = graph.create_user_event();
        let done = graph.create_submitted(stamp(1, 4), 1);
        let failed = graph.create_terminated(EXECUTION_FAILED, 1);

        let dependencies = graph.classify(&[pending, done, pending]).unwrap();
        assert_eq!(dependencies.pending, alloc::vec![pending]);
        assert_eq!(dependencies.level, Some(5));
        assert!(!dependencies.is_ready());

        let dependencies = graph.classify(&[done, failed]).unwrap();
        assert_eq!(dependencies.terminated, Some(EXECUTION_FAILED));
    }

    #[test]
    fn test_failed_stamp_terminates() {
        let mut graph = EventGraph::new();
        let event = graph.create_submitted(CompletionStamp::FAILED, 1);
        assert_eq!(graph.status(event), Ok(EventStatus::Terminated(EXECUTION_FAILED)));
    }

    #[test]
    fn test_release_rules() {
        let mut graph = EventGraph::new();
        let done = graph.create_submitted(stamp(1, 0), 1);
        graph.retain(done).unwrap();
        graph.release(done).unwrap();
        graph.release(done).unwrap();
        assert_eq!(graph.status(done), Err(Error::StaleEventHandle));
        assert_eq!(graph.release(done), Err(Error::StaleEventHandle));

        // Pending events outlive their last reference until they resolve
        let user = graph.create_user_event();
        let child = defer(&mut graph, &[user]);
        graph.release(child).unwrap();
        assert_eq!(graph.release(child), Err(Error::EventDoubleRelease));
        assert!(graph.contains(child));

        let ready = graph.set_user_status(user, EventStatus::Complete).unwrap();
        graph.take_command(child).unwrap();
        graph.mark_submitted(ready[0], stamp(2, 0)).unwrap();
        assert!(!graph.contains(child));
    }

    #[test]
    fn test_user_status_rules() {
        let mut graph = EventGraph::new();
        let user = graph.create_user_event();
        assert_eq!(
            graph.set_user_status(user, EventStatus::Submitted),
            Err(Error::InvalidParameter)
        );
        graph.set_user_status(user, EventStatus::Complete).unwrap();
        assert_eq!(
            graph.set_user_status(user, EventStatus::Complete),
            Err(Error::InvalidEventState)
        );

        let command = graph.create_submitted(stamp(1, 0), 1);
        assert_eq!(
            graph.set_user_status(command, EventStatus::Complete),
            Err(Error::InvalidEventState)
        );
        graph.mark_complete(command).unwrap();
        assert_eq!(graph.status(command), Ok(EventStatus::Complete));
    }
}
