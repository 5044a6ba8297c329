//! Requests travelling through the pool and the response they accumulate.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

use crate::error::{PoolError, PoolResult};

pub const STATUS_BAD_REQUEST: u16 = 400;
pub const STATUS_INTERNAL_SERVER_ERROR: u16 = 500;
pub const STATUS_SERVICE_UNAVAILABLE: u16 = 503;
pub const STATUS_GATEWAY_TIMEOUT: u16 = 504;

/// The response handed back to the front end once a request is done.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl Response {
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Default)]
struct ResponseBuffer {
    status: Option<u16>,
    headers: Vec<(String, String)>,
    body: BytesMut,
}

impl ResponseBuffer {
    fn is_written(&self) -> bool {
        self.status.is_some() || !self.body.is_empty()
    }
}

/// A request bound for a script. Shared between the front end, the scheduler
/// and the thread executing it.
pub struct RequestContext {
    script_filename: PathBuf,
    method: String,
    uri: String,
    headers: Vec<(String, String)>,
    body: Bytes,
    env: HashMap<String, String>,
    started_at: Instant,
    is_dummy: bool,

    response: Mutex<ResponseBuffer>,
    exit_status: Mutex<Option<i32>>,

    // closed exactly once when the response is complete
    done_tx: Mutex<Option<Sender<()>>>,
    done_rx: Receiver<()>,

    // closed when the client went away
    cancel_tx: Mutex<Option<Sender<()>>>,
    cancel_rx: Receiver<()>,
}

impl RequestContext {
    pub fn builder(script_filename: impl Into<PathBuf>) -> RequestBuilder {
        RequestBuilder {
            script_filename: script_filename.into(),
            method: "GET".to_string(),
            uri: "/".to_string(),
            headers: Vec::new(),
            body: Bytes::new(),
            env: HashMap::new(),
        }
    }

    /// Synthetic request used to boot a worker script before it reaches its
    /// request loop.
    pub(crate) fn dummy(script_filename: &Path, env: &HashMap<String, String>) -> Arc<Self> {
        let uri = script_filename
            .file_name()
            .map(|name| format!("/{}", name.to_string_lossy()))
            .unwrap_or_else(|| "/".to_string());

        let mut builder = Self::builder(script_filename).uri(uri);
        builder.env = env.clone();
        builder.into_context(true)
    }

    pub fn script_filename(&self) -> &Path {
        &self.script_filename
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn env(&self) -> &HashMap<String, String> {
        &self.env
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn is_dummy(&self) -> bool {
        self.is_dummy
    }

    /// Reject requests that must never reach a script.
    pub fn validate(&self) -> PoolResult<()> {
        if self.uri.contains('\0') {
            return Err(self.reject_bad_request("Invalid request path".to_string()));
        }

        if let Some(length) = self.header("content-length") {
            if length.trim().parse::<u64>().is_err() {
                return Err(
                    self.reject_bad_request(format!("invalid Content-Length header: {length}"))
                );
            }
        }

        Ok(())
    }

    fn reject_bad_request(&self, message: String) -> PoolError {
        self.reject(STATUS_BAD_REQUEST, &message);
        PoolError::InvalidRequest(message)
    }

    // ========== Response ==========

    pub fn write(&self, data: &[u8]) -> usize {
        let mut response = self.response.lock();
        response.body.extend_from_slice(data);
        data.len()
    }

    pub fn set_status(&self, status: u16) {
        self.response.lock().status = Some(status);
    }

    pub fn set_header(&self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let mut response = self.response.lock();
        response
            .headers
            .retain(|(key, _)| !key.eq_ignore_ascii_case(&name));
        response.headers.push((name, value.into()));
    }

    pub fn has_written(&self) -> bool {
        self.response.lock().is_written()
    }

    pub fn response(&self) -> Response {
        let response = self.response.lock();
        Response {
            status: response.status.unwrap_or(200),
            headers: response.headers.clone(),
            body: Bytes::copy_from_slice(&response.body),
        }
    }

    pub fn exit_status(&self) -> Option<i32> {
        *self.exit_status.lock()
    }

    pub(crate) fn set_exit_status(&self, status: i32) {
        *self.exit_status.lock() = Some(status);
    }

    /// Respond with `status` and `message` unless the request is already done.
    pub fn reject(&self, status: u16, message: &str) {
        if self.is_done() {
            return;
        }
        {
            let mut response = self.response.lock();
            response.status = Some(status);
            response.body.clear();
            response.body.extend_from_slice(message.as_bytes());
        }
        self.close();
    }

    // ========== Completion ==========

    /// Mark the response as complete. Returns false when it already was.
    pub fn close(&self) -> bool {
        self.done_tx.lock().take().is_some()
    }

    pub fn is_done(&self) -> bool {
        self.done_tx.lock().is_none()
    }

    /// Block until the response is complete.
    pub fn wait_done(&self) {
        // the channel never carries a value, recv returns once it is closed
        let _ = self.done_rx.recv();
    }

    pub fn wait_done_timeout(&self, timeout: Duration) -> bool {
        match self.done_rx.recv_timeout(timeout) {
            Ok(()) => true,
            Err(err) => err.is_disconnected(),
        }
    }

    /// The client went away; a request still waiting for a thread gives up.
    pub fn cancel(&self) {
        self.cancel_tx.lock().take();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_tx.lock().is_none()
    }

    pub(crate) fn cancellation(&self) -> &Receiver<()> {
        &self.cancel_rx
    }
}

impl std::fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestContext")
            .field("script_filename", &self.script_filename)
            .field("method", &self.method)
            .field("uri", &self.uri)
            .field("is_dummy", &self.is_dummy)
            .field("is_done", &self.is_done())
            .finish()
    }
}

pub struct RequestBuilder {
    script_filename: PathBuf,
    method: String,
    uri: String,
    headers: Vec<(String, String)>,
    body: Bytes,
    env: HashMap<String, String>,
}

impl RequestBuilder {
    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    pub fn uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = uri.into();
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> Arc<RequestContext> {
        self.into_context(false)
    }

    fn into_context(self, is_dummy: bool) -> Arc<RequestContext> {
        let (done_tx, done_rx) = crossbeam_channel::bounded(0);
        let (cancel_tx, cancel_rx) = crossbeam_channel::bounded(0);

        Arc::new(RequestContext {
            script_filename: self.script_filename,
            method: self.method,
            uri: self.uri,
            headers: self.headers,
            body: self.body,
            env: self.env,
            started_at: Instant::now(),
            is_dummy,
            response: Mutex::new(ResponseBuffer::default()),
            exit_status: Mutex::new(None),
            done_tx: Mutex::new(Some(done_tx)),
            done_rx,
            cancel_tx: Mutex::new(Some(cancel_tx)),
            cancel_rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn builds_a_request() {
        let ctx = RequestContext::builder("/app/index.php")
            .method("POST")
            .uri("/hello?x=1")
            .header("Content-Type", "text/plain")
            .body("payload")
            .env("APP_ENV", "test")
            .build();

        assert_eq!(ctx.script_filename(), Path::new("/app/index.php"));
        assert_eq!(ctx.method(), "POST");
        assert_eq!(ctx.uri(), "/hello?x=1");
        assert_eq!(ctx.header("content-type"), Some("text/plain"));
        assert_eq!(ctx.body().as_ref(), b"payload");
        assert_eq!(ctx.env().get("APP_ENV").map(String::as_str), Some("test"));
        assert!(!ctx.is_dummy());
    }

    #[test]
    fn close_happens_once() {
        let ctx = RequestContext::builder("/app/index.php").build();
        assert!(!ctx.is_done());
        assert!(ctx.close());
        assert!(!ctx.close());
        assert!(ctx.is_done());
        ctx.wait_done();
    }

    #[test]
    fn wait_done_is_released_by_another_thread() {
        let ctx = RequestContext::builder("/app/index.php").build();
        let writer = {
            let ctx = Arc::clone(&ctx);
            thread::spawn(move || {
                ctx.set_status(201);
                ctx.write(b"created");
                ctx.close();
            })
        };
        ctx.wait_done();
        writer.join().unwrap();

        let response = ctx.response();
        assert_eq!(response.status, 201);
        assert_eq!(response.body_text(), "created");
    }

    #[test]
    fn reject_is_ignored_once_done() {
        let ctx = RequestContext::builder("/app/index.php").build();
        ctx.write(b"ok");
        ctx.close();
        ctx.reject(STATUS_GATEWAY_TIMEOUT, "timeout");
        assert_eq!(ctx.response().status, 200);
        assert_eq!(ctx.response().body_text(), "ok");
    }

    #[test]
    fn validate_rejects_nul_in_path() {
        let ctx = RequestContext::builder("/app/index.php")
            .uri("/index.php\0.jpg")
            .build();
        assert!(matches!(ctx.validate(), Err(PoolError::InvalidRequest(_))));
        assert!(ctx.is_done());
        assert_eq!(ctx.response().status, STATUS_BAD_REQUEST);
    }

    #[test]
    fn validate_rejects_a_bad_content_length() {
        let ctx = RequestContext::builder("/app/index.php")
            .header("Content-Length", "-5")
            .build();
        assert!(ctx.validate().is_err());
        assert_eq!(
            ctx.response().body_text(),
            "invalid Content-Length header: -5"
        );

        let ctx = RequestContext::builder("/app/index.php")
            .header("Content-Length", "12")
            .build();
        assert!(ctx.validate().is_ok());
    }

    #[test]
    fn dummy_request_targets_the_script() {
        let mut env = HashMap::new();
        env.insert("PHP_WORKER_MODE".to_string(), "1".to_string());
        let ctx = RequestContext::dummy(Path::new("/app/worker.php"), &env);
        assert!(ctx.is_dummy());
        assert_eq!(ctx.uri(), "/worker.php");
        assert_eq!(ctx.env().get("PHP_WORKER_MODE").map(String::as_str), Some("1"));
    }

    #[test]
    fn cancellation_closes_the_signal() {
        let ctx = RequestContext::builder("/app/index.php").build();
        assert!(!ctx.is_cancelled());
        ctx.cancel();
        assert!(ctx.is_cancelled());
        assert!(ctx.cancellation().recv().is_err());
    }
}
