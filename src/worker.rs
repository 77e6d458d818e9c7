//! Worker slot model.
//!
//! A slot is one of a fixed number of concurrent execution units, rebuilt
//! fresh at session start and never persisted. The supervisor exclusively
//! owns slot state transitions; the orchestration loop only reads slots
//! to decide whether to request new work.

use crate::task::{TaskId, WorkerId};

/// Runtime state of a worker slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    Busy,
    Terminating,
}

/// A concurrency unit the orchestrator manages.
#[derive(Debug, Clone)]
pub struct WorkerSlot {
    /// Stable index, 1..=N.
    pub id: WorkerId,
    pub state: SlotState,
    /// Set iff `state == Busy`.
    pub current_task: Option<TaskId>,
    /// Domain of the most recently completed task; sticky-affinity signal.
    /// Empty at session start.
    pub last_domain: String,
}

impl WorkerSlot {
    /// Create an idle slot with no affinity history.
    pub fn new(id: WorkerId) -> Self {
        Self {
            id,
            state: SlotState::Idle,
            current_task: None,
            last_domain: String::new(),
        }
    }

    pub fn is_idle(&self) -> bool {
        self.state == SlotState::Idle
    }

    pub fn is_busy(&self) -> bool {
        self.state == SlotState::Busy
    }
}
