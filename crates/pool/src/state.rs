//! Per-thread lifecycle state machine.
//!
//! Every pool thread owns one `ThreadState`. Mutations go through a single
//! lock and are validated against a fixed transition table; threads (and the
//! pool) block on `wait_for` until one of a set of states is reached. Waiters
//! are one-shot: they are released exactly once and then forgotten.

use std::fmt;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

use crate::error::{PoolError, PoolResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StateId {
    // lifecycle of a slot
    Reserved,
    Booting,
    Draining,
    ShuttingDown,
    Done,

    // stable states, safe to transition from at any time
    Inactive,
    Ready,

    // a request is bound to the thread
    Busy,

    // worker restarts
    Restarting,
    Yielding,

    // handler swaps
    TransitionRequested,
    TransitionInProgress,
    TransitionComplete,
}

impl StateId {
    pub fn name(self) -> &'static str {
        match self {
            StateId::Reserved => "reserved",
            StateId::Booting => "booting",
            StateId::Draining => "draining",
            StateId::ShuttingDown => "shutting down",
            StateId::Done => "done",
            StateId::Inactive => "inactive",
            StateId::Ready => "ready",
            StateId::Busy => "busy",
            StateId::Restarting => "restarting",
            StateId::Yielding => "yielding",
            StateId::TransitionRequested => "transition requested",
            StateId::TransitionInProgress => "transition in progress",
            StateId::TransitionComplete => "transition complete",
        }
    }

    /// The full transition table. Anything not listed is a logic error.
    pub fn can_transition_to(self, next: StateId) -> bool {
        use StateId::*;

        if self == next {
            return true;
        }
        matches!(
            (self, next),
            (Reserved, Booting | ShuttingDown)
                | (Booting, Inactive | ShuttingDown)
                | (Inactive, TransitionRequested | Draining | ShuttingDown)
                | (Ready, Busy | TransitionRequested | Restarting | ShuttingDown)
                | (Busy, Ready | Restarting | ShuttingDown)
                | (TransitionRequested, TransitionInProgress)
                | (TransitionInProgress, TransitionComplete)
                | (TransitionComplete, Inactive | Ready | Restarting | ShuttingDown)
                | (Restarting, Yielding | ShuttingDown)
                | (Yielding, Ready | ShuttingDown)
                | (Draining, ShuttingDown)
                | (ShuttingDown, Done)
                | (Done, Reserved)
        )
    }

    fn is_stopping(self) -> bool {
        matches!(
            self,
            StateId::Draining | StateId::ShuttingDown | StateId::Done | StateId::Reserved
        )
    }
}

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

struct Subscriber {
    states: Vec<StateId>,
    // dropping the sender wakes the waiter
    _wake: Sender<()>,
}

struct Inner {
    current: StateId,
    subscribers: Vec<Subscriber>,
    waiting_since: Option<Instant>,
}

impl Inner {
    fn apply(&mut self, next: StateId) -> PoolResult<()> {
        if !self.current.can_transition_to(next) {
            return Err(PoolError::InvalidTransition {
                from: self.current,
                to: next,
            });
        }
        self.current = next;
        self.subscribers.retain(|sub| !sub.states.contains(&next));
        Ok(())
    }
}

pub struct ThreadState {
    inner: Mutex<Inner>,
}

impl Default for ThreadState {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadState {
    pub fn new() -> Self {
        Self::with_state(StateId::Reserved)
    }

    pub(crate) fn with_state(state: StateId) -> Self {
        Self {
            inner: Mutex::new(Inner {
                current: state,
                subscribers: Vec::new(),
                waiting_since: None,
            }),
        }
    }

    pub fn is(&self, state: StateId) -> bool {
        self.inner.lock().current == state
    }

    pub fn get(&self) -> StateId {
        self.inner.lock().current
    }

    pub fn name(&self) -> &'static str {
        self.get().name()
    }

    /// Move to `next` and release every waiter subscribed to it.
    pub fn set(&self, next: StateId) -> PoolResult<()> {
        self.inner.lock().apply(next)
    }

    /// Move to `swap_to` only if the current state is `compare_to`.
    pub fn compare_and_swap(&self, compare_to: StateId, swap_to: StateId) -> PoolResult<bool> {
        let mut inner = self.inner.lock();
        if inner.current != compare_to {
            return Ok(false);
        }
        inner.apply(swap_to)?;
        Ok(true)
    }

    /// Block until the state is one of `states`.
    pub fn wait_for(&self, states: &[StateId]) -> StateId {
        let receiver = {
            let mut inner = self.inner.lock();
            if states.contains(&inner.current) {
                return inner.current;
            }
            let (wake, receiver): (Sender<()>, Receiver<()>) = crossbeam_channel::bounded(0);
            inner.subscribers.push(Subscriber {
                states: states.to_vec(),
                _wake: wake,
            });
            receiver
        };
        // returns Err once the subscriber was dropped
        let _ = receiver.recv();
        self.get()
    }

    /// Change the state from outside the owning thread, waiting for the thread
    /// to reach a state where the change is safe.
    ///
    /// Returns `false` when the thread is already stopping or not booted.
    pub fn request_safe_state_change(&self, next: StateId) -> PoolResult<bool> {
        let mut safe = vec![StateId::Ready, StateId::Inactive];
        if next == StateId::ShuttingDown {
            // a booting or yielding worker may be stopped without waiting for it
            safe.extend([StateId::TransitionComplete, StateId::Yielding]);
        }

        loop {
            {
                let mut inner = self.inner.lock();
                if inner.current.is_stopping() {
                    return Ok(false);
                }
                if safe.contains(&inner.current) {
                    inner.apply(next)?;
                    return Ok(true);
                }
            }

            let mut wake_on = safe.clone();
            wake_on.extend([
                StateId::ShuttingDown,
                StateId::Draining,
                StateId::Done,
                StateId::Reserved,
            ]);
            self.wait_for(&wake_on);
        }
    }

    /// Put a running worker thread into `Restarting`. Only threads that are
    /// executing or about to execute the worker script are eligible.
    pub(crate) fn request_restart(&self) -> PoolResult<bool> {
        let mut inner = self.inner.lock();
        match inner.current {
            StateId::Ready | StateId::Busy | StateId::TransitionComplete => {
                inner.apply(StateId::Restarting)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Force `Done` on a thread that died on a fatal error and release every
    /// waiter. Only used after the error has been reported.
    pub(crate) fn abandon(&self) {
        let mut inner = self.inner.lock();
        inner.current = StateId::Done;
        inner.waiting_since = None;
        inner.subscribers.clear();
    }

    /// Hint that the thread parked in a stable state, waiting for work or a signal.
    pub fn mark_as_waiting(&self, is_waiting: bool) {
        let mut inner = self.inner.lock();
        inner.waiting_since = if is_waiting { Some(Instant::now()) } else { None };
    }

    pub fn is_waiting(&self) -> bool {
        self.inner.lock().waiting_since.is_some()
    }

    /// How long the thread has been waiting, zero if it is not waiting.
    pub fn wait_time(&self) -> Duration {
        self.inner
            .lock()
            .waiting_since
            .map(|since| since.elapsed())
            .unwrap_or(Duration::ZERO)
    }

    #[cfg(test)]
    pub(crate) fn backdate_waiting(&self, by: Duration) {
        let mut inner = self.inner.lock();
        if let Some(since) = inner.waiting_since {
            inner.waiting_since = Some(since.checked_sub(by).unwrap_or(since));
        }
    }

    #[cfg(test)]
    fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn follows_the_lifecycle_of_a_regular_thread() {
        let state = ThreadState::new();
        for next in [
            StateId::Booting,
            StateId::Inactive,
            StateId::TransitionRequested,
            StateId::TransitionInProgress,
            StateId::TransitionComplete,
            StateId::Ready,
            StateId::Busy,
            StateId::Ready,
            StateId::ShuttingDown,
            StateId::Done,
            StateId::Reserved,
        ] {
            state.set(next).expect("valid transition");
            assert!(state.is(next));
        }
    }

    #[test]
    fn rejects_transitions_outside_the_table() {
        let state = ThreadState::with_state(StateId::Ready);
        let err = state.set(StateId::Done).unwrap_err();
        assert_eq!(
            err,
            PoolError::InvalidTransition {
                from: StateId::Ready,
                to: StateId::Done
            }
        );
        assert!(err.is_fatal());
        // the invalid transition was not applied
        assert!(state.is(StateId::Ready));

        let state = ThreadState::new();
        assert!(state.set(StateId::Ready).is_err());
        assert!(state.set(StateId::Done).is_err());
        assert!(state.is(StateId::Reserved));
    }

    #[test]
    fn compare_and_swap_only_applies_on_match() {
        let state = ThreadState::with_state(StateId::Ready);
        assert!(!state.compare_and_swap(StateId::Busy, StateId::Ready).unwrap());
        assert!(state.compare_and_swap(StateId::Ready, StateId::Busy).unwrap());
        assert!(state.is(StateId::Busy));
        assert!(state.compare_and_swap(StateId::Busy, StateId::Inactive).is_err());
        assert!(state.is(StateId::Busy));
    }

    #[test]
    fn wait_for_returns_immediately_when_satisfied() {
        let state = ThreadState::with_state(StateId::Inactive);
        assert_eq!(
            state.wait_for(&[StateId::Inactive, StateId::Ready]),
            StateId::Inactive
        );
        assert_eq!(state.subscriber_count(), 0);
    }

    #[test]
    fn wait_for_is_released_from_another_thread() {
        let state = Arc::new(ThreadState::with_state(StateId::Booting));
        let waiter = {
            let state = Arc::clone(&state);
            thread::spawn(move || state.wait_for(&[StateId::Inactive]))
        };

        // give the waiter a chance to subscribe; correctness does not depend on it
        thread::sleep(Duration::from_millis(10));
        state.set(StateId::Inactive).unwrap();

        assert_eq!(waiter.join().unwrap(), StateId::Inactive);
        assert_eq!(state.subscriber_count(), 0);
    }

    #[test]
    fn unrelated_transitions_keep_waiters_subscribed() {
        let state = Arc::new(ThreadState::with_state(StateId::Ready));
        let waiter = {
            let state = Arc::clone(&state);
            thread::spawn(move || state.wait_for(&[StateId::ShuttingDown]))
        };
        while state.subscriber_count() == 0 {
            thread::yield_now();
        }

        state.set(StateId::Busy).unwrap();
        state.set(StateId::Ready).unwrap();
        assert_eq!(state.subscriber_count(), 1);

        state.set(StateId::ShuttingDown).unwrap();
        assert_eq!(waiter.join().unwrap(), StateId::ShuttingDown);
    }

    #[test]
    fn safe_state_change_waits_for_a_stable_state() {
        let state = Arc::new(ThreadState::with_state(StateId::Busy));
        let requester = {
            let state = Arc::clone(&state);
            thread::spawn(move || state.request_safe_state_change(StateId::TransitionRequested))
        };
        while state.subscriber_count() == 0 {
            thread::yield_now();
        }
        assert!(state.is(StateId::Busy));

        state.set(StateId::Ready).unwrap();
        assert!(requester.join().unwrap().unwrap());
        assert!(state.is(StateId::TransitionRequested));
    }

    #[test]
    fn safe_state_change_is_refused_while_stopping() {
        for stopping in [StateId::ShuttingDown, StateId::Done, StateId::Reserved] {
            let state = ThreadState::with_state(stopping);
            assert!(!state.request_safe_state_change(StateId::ShuttingDown).unwrap());
            assert!(state.is(stopping));
        }
    }

    #[test]
    fn shutdown_does_not_wait_for_a_booting_worker() {
        let state = ThreadState::with_state(StateId::TransitionComplete);
        assert!(state.request_safe_state_change(StateId::ShuttingDown).unwrap());
        assert!(state.is(StateId::ShuttingDown));
    }

    #[test]
    fn restart_is_only_requested_from_running_states() {
        let state = ThreadState::with_state(StateId::Busy);
        assert!(state.request_restart().unwrap());
        assert!(state.is(StateId::Restarting));

        let state = ThreadState::with_state(StateId::Inactive);
        assert!(!state.request_restart().unwrap());
        assert!(state.is(StateId::Inactive));
    }

    #[test]
    fn tracks_waiting_time() {
        let state = ThreadState::with_state(StateId::Ready);
        assert_eq!(state.wait_time(), Duration::ZERO);
        state.mark_as_waiting(true);
        state.backdate_waiting(Duration::from_secs(60));
        assert!(state.is_waiting());
        assert!(state.wait_time() >= Duration::from_secs(60));
        state.mark_as_waiting(false);
        assert!(!state.is_waiting());
        assert_eq!(state.wait_time(), Duration::ZERO);
    }
}
