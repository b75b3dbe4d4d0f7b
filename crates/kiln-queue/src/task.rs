//! # Task Descriptors
//!
//! What a queue hands to the receiver for one enqueue: encoded task
//! commands, heap contents, surfaces and dispatch flags.

use alloc::vec::Vec;

use kiln_core::DispatchFlags;
use kiln_mem::AllocationId;

/// Queue identifier within a context
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QueueId(pub u32);

/// One unit of enqueued work
#[derive(Debug, Clone, Default)]
pub struct TaskDescriptor {
    /// Encoded task commands
    pub commands: Vec<u8>,
    /// Dynamic state heap contents
    pub dynamic_state: Vec<u8>,
    /// Indirect object heap contents
    pub indirect_object: Vec<u8>,
    /// Surface state heap contents
    pub surface_state: Vec<u8>,
    /// Allocations the task reads or writes
    pub surfaces: Vec<AllocationId>,
    /// Per-thread scratch size
    pub scratch_size: u32,
    /// Dispatch flags
    pub flags: DispatchFlags,
}

impl TaskDescriptor {
    /// Task with encoded commands and default flags
    pub fn new(commands: Vec<u8>) -> Self {
        Self {
            commands,
            ..Self::default()
        }
    }

    /// Set dispatch flags
    pub fn with_flags(mut self, flags: DispatchFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Add a surface
    pub fn with_surface(mut self, surface: AllocationId) -> Self {
        self.surfaces.push(surface);
        self
    }

    /// Set heap contents
    pub fn with_heaps(
        mut self,
        dynamic_state: Vec<u8>,
        indirect_object: Vec<u8>,
        surface_state: Vec<u8>,
    ) -> Self {
        self.dynamic_state = dynamic_state;
        self.indirect_object = indirect_object;
        self.surface_state = surface_state;
        self
    }

    /// Set per-thread scratch size
    pub fn with_scratch(mut self, per_thread_size: u32) -> Self {
        self.scratch_size = per_thread_size;
        self
    }

    /// Check if the task carries no commands
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

/// Task parked on an unresolved dependency
#[derive(Debug, Clone)]
pub struct DeferredTask {
    /// Queue that enqueued it
    pub queue: QueueId,
    /// The work
    pub task: TaskDescriptor,
}
