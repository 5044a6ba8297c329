use serde::Serialize;

use crate::state::StateId;
use crate::thread::PhpThread;

/// Snapshot of a booted thread, for debugging only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThreadDebugState {
    pub index: usize,
    pub name: String,
    pub state: String,
    pub is_waiting: bool,
    pub is_busy: bool,
    pub waiting_since_ms: u64,
}

impl ThreadDebugState {
    pub(crate) fn of(thread: &PhpThread) -> Self {
        let state = thread.state();
        Self {
            index: thread.index(),
            name: thread.name(),
            state: state.name().to_string(),
            is_waiting: state.is_waiting(),
            is_busy: state.is(StateId::Busy),
            waiting_since_ms: state.wait_time().as_millis() as u64,
        }
    }
}

/// Snapshot of every thread slot of the pool, for debugging only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DebugState {
    pub thread_debug_states: Vec<ThreadDebugState>,
    pub reserved_thread_count: usize,
}

impl DebugState {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn threads_in(&self, state: StateId) -> usize {
        self.thread_debug_states
            .iter()
            .filter(|thread| thread.state == state.name())
            .count()
    }
}
