//! Routing requests to threads.
//!
//! A request first tries a non-blocking handoff to a thread that is waiting
//! for work. When every thread is busy the request is queued: it keeps offering
//! itself to the pool and to the autoscaler until a thread takes it, the
//! client goes away, the pool shuts down or the max wait time runs out.

use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::{Sender, TrySendError, select};

use crate::error::{PoolError, PoolResult};
use crate::pool::PoolInner;
use crate::request::{RequestContext, STATUS_GATEWAY_TIMEOUT, STATUS_SERVICE_UNAVAILABLE};

impl PoolInner {
    pub(crate) fn dispatch(&self, request: &Arc<RequestContext>) -> PoolResult<()> {
        if self.is_shutting_down() {
            request.reject(STATUS_SERVICE_UNAVAILABLE, "Service Unavailable");
            return Err(PoolError::ShuttingDown);
        }
        request.validate()?;

        let worker = self.workers().get(request.script_filename());
        let queue = match &worker {
            Some(worker) => {
                if worker.try_handoff(request) {
                    request.wait_done();
                    return Ok(());
                }
                worker.queue()
            }
            None => self.regular().queue(),
        };

        match queue.try_send(Arc::clone(request)) {
            Ok(()) => {
                request.wait_done();
                return Ok(());
            }
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {}
        }

        self.record_queued();
        tracing::debug!(
            "No thread available for {}, queueing request",
            request.script_filename().display()
        );
        self.wait_for_thread(queue, request)?;
        request.wait_done();
        Ok(())
    }

    fn wait_for_thread(
        &self,
        queue: &Sender<Arc<RequestContext>>,
        request: &Arc<RequestContext>,
    ) -> PoolResult<()> {
        let deadline = self
            .config()
            .max_wait_time()
            .map(|max_wait| request.started_at() + max_wait);
        let timeout = match deadline {
            Some(deadline) => crossbeam_channel::at(deadline),
            None => crossbeam_channel::never(),
        };

        loop {
            select! {
                send(queue, Arc::clone(request)) -> sent => {
                    if sent.is_ok() {
                        return Ok(());
                    }
                }
                send(self.scaling.signal(), Arc::clone(request)) -> _ => {
                    // the autoscaler picked it up, keep waiting for a thread
                }
                recv(request.cancellation()) -> _ => {
                    return Err(PoolError::Cancelled);
                }
                recv(self.done_signal()) -> _ => {
                    request.reject(STATUS_SERVICE_UNAVAILABLE, "Service Unavailable");
                    return Err(PoolError::ShuttingDown);
                }
                recv(timeout) -> _ => {
                    let waited = Instant::now().saturating_duration_since(request.started_at());
                    tracing::warn!(
                        "Request to {} timed out after waiting {}ms for a thread",
                        request.script_filename().display(),
                        waited.as_millis()
                    );
                    request.reject(STATUS_GATEWAY_TIMEOUT, "Gateway Timeout");
                    return Err(PoolError::Timeout {
                        waited_ms: waited.as_millis() as u64,
                    });
                }
            }
        }
    }
}
