//! Deferred work: the global dispatch queue and the handler-thread loop.
//!
//! Parsed requests don't run handlers on worker threads; they are queued and
//! executed here, so I/O readiness callbacks never block on application
//! logic. Per-connection ordering is enforced by the connection's private
//! FIFO (see `conn.rs`): only one item per connection is ever in this queue.

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use tracing::{debug, warn};

use crate::config::Shared;
use crate::conn::Connection;
use crate::http::request::Request;
use crate::http::response::Response;
use crate::vhost::Vhost;
use crate::ws::frame::WsMessage;

/// What a queued item carries to a handler thread.
pub enum WorkPayload {
    Http(Request),
    /// Already answered by the engine (e.g. a rate-limit rejection); rides
    /// the queue so pipelined responses keep their order.
    Canned { req: Request, resp: Response },
    Ws(WsMessage),
}

/// One unit of completed-parse-but-not-yet-handled work.
pub struct WorkItem {
    pub conn: Arc<Connection>,
    pub vhost: Arc<Vhost>,
    pub payload: WorkPayload,
}

/// What the handler produced; the connection turns it into wire bytes.
pub enum HandlerOutcome {
    Http { req: Request, resp: Response },
    Ws { replies: Vec<WsMessage> },
    /// The handler panicked. The engine still releases the connection.
    Panicked,
}

/// Global FIFO distributing work across handler threads.
pub struct DispatchQueue {
    inner: Mutex<VecDeque<WorkItem>>,
    cond: Condvar,
    closed: AtomicBool,
}

impl Default for DispatchQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatchQueue {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Queue an item and wake one handler thread.
    pub fn push(&self, item: WorkItem) {
        let mut q = self.inner.lock().expect("queue mutex poisoned");
        q.push_back(item);
        drop(q);
        self.cond.notify_one();
    }

    /// Block until work arrives. Returns None once the queue is closed and
    /// drained, which is the handler thread's exit signal.
    pub fn pop(&self) -> Option<WorkItem> {
        let mut q = self.inner.lock().expect("queue mutex poisoned");
        loop {
            if let Some(item) = q.pop_front() {
                return Some(item);
            }
            if self.closed.load(Ordering::SeqCst) {
                return None;
            }
            q = self.cond.wait(q).expect("queue mutex poisoned");
        }
    }

    /// Close the queue and broadcast-wake every blocked handler thread.
    pub fn wake_all(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.cond.notify_all();
    }
}

/// One handler thread: pop, execute, hand the result back to the
/// connection's write path. Handler faults are contained; the connection is
/// always released.
pub fn handler_loop(shared: &Arc<Shared>) {
    while let Some(item) = shared.queue.pop() {
        let WorkItem {
            conn,
            vhost,
            payload,
        } = item;
        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| match payload {
            WorkPayload::Http(mut req) => {
                let mut resp = Response::new(200);
                vhost.handle(&mut req, &mut resp);
                HandlerOutcome::Http { req, resp }
            }
            WorkPayload::Canned { req, resp } => HandlerOutcome::Http { req, resp },
            WorkPayload::Ws(msg) => {
                let replies = vhost
                    .ws_handler
                    .as_ref()
                    .map(|h| h.on_message(&msg))
                    .unwrap_or_default();
                HandlerOutcome::Ws { replies }
            }
        }))
        .unwrap_or_else(|_| {
            warn!("Handler panicked on connection {}", conn.id);
            HandlerOutcome::Panicked
        });
        conn.publish(outcome, shared);
        // `conn` drops here: the queue's reference is released no matter
        // what the handler did.
    }
    debug!("Handler thread exiting");
}
