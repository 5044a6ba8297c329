use crate::error::{PoolError, PoolResult};
use crate::handler::Step;
use crate::state::StateId;
use crate::thread::PhpThread;

/// A booted thread with nothing assigned to it. Keeping threads inactive costs
/// memory but makes converting them to regular or worker threads fast.
pub(crate) struct InactiveHandler;

impl InactiveHandler {
    pub(crate) fn before_execution(&mut self, thread: &PhpThread) -> PoolResult<Step> {
        let state = thread.state();
        loop {
            match state.get() {
                StateId::TransitionRequested => return Ok(Step::Swap),
                StateId::Booting | StateId::TransitionComplete => {
                    state.set(StateId::Inactive)?;

                    // wait for an external signal to start, retire or shut down
                    state.mark_as_waiting(true);
                    state.wait_for(&[
                        StateId::TransitionRequested,
                        StateId::Draining,
                        StateId::ShuttingDown,
                        StateId::Done,
                    ]);
                    state.mark_as_waiting(false);
                }
                StateId::Draining => {
                    tracing::debug!("Retiring inactive thread {}", thread.index());
                    state.set(StateId::ShuttingDown)?;
                    return Ok(Step::Stop);
                }
                StateId::ShuttingDown | StateId::Done => return Ok(Step::Stop),
                other => {
                    return Err(PoolError::UnexpectedState {
                        handler: "inactive",
                        state: other,
                    });
                }
            }
        }
    }
}
