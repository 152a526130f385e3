//! The connection: the one structure shared across threads.
//!
//! Ownership and locking: the `Arc` is the reference count; every path that
//! hands the connection to another thread (queueing a work item, the poller
//! registration) clones it, and the memory goes away when the last clone
//! drops after the poller registration is gone. All mutable state sits
//! behind one mutex. Worker threads take it with `try_lock`: if a handler
//! thread is mid-publish the readiness event is recorded in `deferred`
//! instead of processed inline, and whoever releases the lock re-arms the
//! multiplexer so the event fires again. That enforces at most one active
//! processing unit per connection. `destroyed` makes close idempotent.

use std::collections::VecDeque;
use std::io::{self, Read};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tracing::{debug, info, trace, warn};
use zeroize::Zeroize;

use crate::config::{Shared, Snapshot};
use crate::http::parser::{Feed, HostResolver, Parser, ParserConfig};
use crate::http::request::Request;
use crate::http::response::{error_bytes, Response, ResponseWriter, WriteOutcome, WriteQueue};
use crate::http::ParseError;
use crate::poller::{Interest, Poller};
use crate::queue::{HandlerOutcome, WorkItem, WorkPayload};
use crate::tls::{HandshakeStep, TlsSession};
use crate::vhost::Vhost;
use crate::ws;
use crate::ws::deflate::Deflater;
use crate::ws::frame::{self, FrameParser, Opcode, WsEvent, WsMessage};

/// Protocol state, selected at accept (TLS) or upgrade time. Exactly one of
/// the two parsers ever exists per connection.
pub enum Proto {
    /// TLS negotiation in progress; no protocol bytes parsed yet.
    TlsHandshake,
    Http(Parser),
    Ws {
        parser: FrameParser,
        deflater: Option<Deflater>,
    },
    Closed,
}

impl Proto {
    fn name(&self) -> &'static str {
        match self {
            Proto::TlsHandshake => "handshaking",
            Proto::Http(_) => "http",
            Proto::Ws { .. } => "websocket",
            Proto::Closed => "closed",
        }
    }
}

/// Work waiting behind an in-flight exchange on the same connection.
struct PendingWork {
    vhost: Arc<Vhost>,
    payload: WorkPayload,
}

pub struct ConnState {
    sock: TcpStream,
    tls: Option<TlsSession>,
    proto: Proto,
    out: WriteQueue,
    /// Private FIFO preserving pipelining order.
    pending: VecDeque<PendingWork>,
    /// An item from this connection sits in the global queue or a handler.
    in_flight: bool,
    /// Virtual host index pinned by SNI.
    fixed_vhost: Option<usize>,
    /// The vhost a websocket upgrade locked in. Keeps the configuration
    /// generation it was created against alive until the connection dies.
    ws_vhost: Option<Arc<Vhost>>,
    last_action: Instant,
    close_after_flush: bool,
}

pub struct Connection {
    pub id: u64,
    pub peer: SocketAddr,
    fd: RawFd,
    poller: Arc<Poller>,
    state: Mutex<ConnState>,
    /// Readiness arrived while another thread held the lock.
    deferred: AtomicBool,
    destroyed: AtomicBool,
}

struct SnapResolver<'a> {
    snap: &'a Snapshot,
    fixed: Option<usize>,
}

impl HostResolver for SnapResolver<'_> {
    fn resolve(&self, host: &str) -> Option<usize> {
        self.snap.resolve(host)
    }

    fn fixed(&self) -> Option<usize> {
        self.fixed
    }
}

impl Connection {
    pub fn new(
        sock: TcpStream,
        peer: SocketAddr,
        id: u64,
        poller: Arc<Poller>,
        shared: &Shared,
        tls: Option<TlsSession>,
    ) -> Arc<Self> {
        let fd = sock.as_raw_fd();
        let proto = if tls.is_some() {
            Proto::TlsHandshake
        } else {
            Proto::Http(Parser::new(ParserConfig::new(
                shared.cfg.client_max_body_size,
                &shared.cfg.tmp_dir,
            )))
        };
        Arc::new(Self {
            id,
            peer,
            fd,
            poller,
            state: Mutex::new(ConnState {
                sock,
                tls,
                proto,
                out: WriteQueue::new(),
                pending: VecDeque::new(),
                in_flight: false,
                fixed_vhost: None,
                ws_vhost: None,
                last_action: Instant::now(),
                close_after_flush: false,
            }),
            deferred: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
        })
    }

    /// Add to the multiplexer's interest set.
    pub fn register(&self) -> io::Result<()> {
        self.poller.add(self.fd, self.id, Interest::READ)
    }

    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Close the idle connection if it has been quiet too long. Skipped when
    /// another thread is busy with it.
    pub fn sweep_idle(&self, max_idle: std::time::Duration) {
        let Ok(mut st) = self.state.try_lock() else {
            return;
        };
        if !st.in_flight && st.last_action.elapsed() > max_idle {
            debug!("Closing idle connection {}", self.id);
            self.close_locked(&mut st);
        }
    }

    /// Close unless an exchange is mid-flight; used when draining for
    /// shutdown. Busy connections finish their response and close then.
    pub fn close_if_idle(&self) {
        let Ok(mut st) = self.state.try_lock() else {
            return;
        };
        if st.in_flight || !st.out.is_empty() {
            st.close_after_flush = true;
        } else {
            self.close_locked(&mut st);
        }
    }

    /// Entry point for readiness events, on the worker thread that owns this
    /// connection's multiplexer.
    pub fn on_ready(
        self: &Arc<Self>,
        readable: bool,
        writable: bool,
        hangup: bool,
        scratch: &mut [u8],
        shared: &Arc<Shared>,
    ) {
        let Ok(mut st) = self.state.try_lock() else {
            // Mid-handler elsewhere: defer, never process inline.
            self.deferred.store(true, Ordering::SeqCst);
            return;
        };
        st.last_action = Instant::now();
        let span = tracing::info_span!("conn", id = self.id, state = st.proto.name());
        let _guard = span.enter();

        if writable {
            self.flush_locked(&mut st);
        }
        if (readable || hangup) && !self.is_destroyed() {
            // A hangup with pending data still drains; the read loop then
            // observes EOF.
            self.fill(&mut st, scratch, shared);
        }
        self.rearm(&st);
        drop(st);
        self.drain_deferred();
    }

    /// Read until would-block, feeding the protocol state machine.
    fn fill(self: &Arc<Self>, st: &mut ConnState, scratch: &mut [u8], shared: &Arc<Shared>) {
        loop {
            if self.is_destroyed() {
                return;
            }
            // Closing after a terminal response: discard whatever else the
            // client already sent so the pending response is not cut off by
            // a reset.
            if st.close_after_flush {
                match Self::read_some(st, scratch) {
                    Ok(0) => {
                        self.close_locked(st);
                        return;
                    }
                    Ok(_) => continue,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                    Err(_) => {
                        self.close_locked(st);
                        return;
                    }
                }
            }
            // TLS handshake consumes the socket until it completes.
            if let Proto::TlsHandshake = st.proto {
                if !self.drive_handshake(st, shared) {
                    return;
                }
                continue;
            }
            let n = match Self::read_some(st, scratch) {
                Ok(0) => {
                    trace!("EOF");
                    self.close_locked(st);
                    return;
                }
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    debug!("read(): {e}");
                    self.close_locked(st);
                    return;
                }
            };
            self.consume(st, &scratch[..n], shared);
        }
    }

    fn read_some(st: &mut ConnState, scratch: &mut [u8]) -> io::Result<usize> {
        let ConnState { sock, tls, .. } = st;
        match tls {
            Some(session) => session.read_app(sock, scratch),
            None => sock.read(scratch),
        }
    }

    /// One TLS handshake step. Returns true when the session became ready
    /// and protocol parsing can start.
    fn drive_handshake(&self, st: &mut ConnState, shared: &Arc<Shared>) -> bool {
        let step = {
            let ConnState { sock, tls, .. } = &mut *st;
            let session = tls.as_mut().expect("handshake without session");
            session.step(sock)
        };
        match step {
            HandshakeStep::Done => {
                // The server-name context switch happens exactly once,
                // before the first HTTP byte is parsed.
                let name = session_name(st.tls.as_ref());
                let snap = shared.snapshot();
                st.fixed_vhost = name.and_then(|n| snap.resolve(&n));
                if let Some(v) = st.fixed_vhost {
                    trace!("SNI selected vhost {v}");
                }
                st.proto = Proto::Http(Parser::new(ParserConfig::new(
                    shared.cfg.client_max_body_size,
                    &shared.cfg.tmp_dir,
                )));
                true
            }
            HandshakeStep::WantRead | HandshakeStep::WantWrite => false,
            HandshakeStep::Failed => {
                // TLS faults close silently.
                self.close_locked(st);
                false
            }
        }
    }

    /// Feed freshly read bytes into whichever parser this connection runs.
    fn consume(self: &Arc<Self>, st: &mut ConnState, mut buf: &[u8], shared: &Arc<Shared>) {
        enum Action {
            Request(Request),
            HttpError(ParseError),
            WsEvents(Vec<WsEvent>, Option<crate::ws::WsError>),
            Stop,
        }

        let snap = shared.snapshot();
        loop {
            let fixed = st.fixed_vhost;
            let action = match &mut st.proto {
                Proto::Http(parser) => {
                    let resolver = SnapResolver {
                        snap: &snap,
                        fixed,
                    };
                    match parser.feed(buf, &resolver) {
                        Ok(Feed::NeedMore) => Action::Stop,
                        Ok(Feed::Complete { consumed }) => {
                            let req = parser.take_request().expect("complete request");
                            // Pipelining: dispatch now, keep parsing the
                            // rest of this read without another syscall.
                            buf = &buf[consumed..];
                            Action::Request(req)
                        }
                        Err(err) => Action::HttpError(err),
                    }
                }
                Proto::Ws { parser, .. } => {
                    let mut events = Vec::new();
                    let result = parser.feed(buf, &mut events);
                    Action::WsEvents(events, result.err())
                }
                Proto::TlsHandshake | Proto::Closed => Action::Stop,
            };
            match action {
                Action::Stop => return,
                Action::Request(req) => {
                    self.accept_request(st, req, &snap, shared);
                    if self.is_destroyed() || buf.is_empty() {
                        return;
                    }
                    // More pipelined bytes: loop without another read.
                }
                Action::HttpError(err) => {
                    self.protocol_error(st, &err);
                    return;
                }
                Action::WsEvents(events, err) => {
                    self.handle_ws_events(st, events, &snap, shared);
                    if let Some(err) = err {
                        info!("WebSocket protocol violation: {err}");
                        // Best-effort close frame, no HTTP response.
                        let mut frame_bytes = Vec::new();
                        frame::encode_close(Some(1002), b"", &mut frame_bytes);
                        st.out.push(frame_bytes);
                        self.flush_locked(st);
                        self.close_locked(st);
                    }
                    return;
                }
            }
        }
    }

    /// A parsed request is ready: upgrade, rate-limit, or queue it.
    fn accept_request(
        self: &Arc<Self>,
        st: &mut ConnState,
        req: Request,
        snap: &Arc<Snapshot>,
        shared: &Arc<Shared>,
    ) {
        let vhost = snap.vhost(req.vhost);

        // Upgrades only happen on a quiet connection; a pipelined upgrade
        // behind unfinished exchanges would reorder the 101 ahead of their
        // responses.
        if req.upgrade_websocket && !st.in_flight && st.pending.is_empty() {
            if let (Some(_), Some((bytes, params))) =
                (vhost.ws_handler.as_ref(), ws::upgrade_response(&req))
            {
                debug!("Upgrading connection {} to websocket", self.id);
                st.out.push(bytes);
                st.fixed_vhost = Some(req.vhost);
                st.ws_vhost = Some(Arc::clone(&vhost));
                let max = usize::try_from(shared.cfg.client_max_body_size).unwrap_or(usize::MAX);
                st.proto = Proto::Ws {
                    parser: FrameParser::new(
                        params.is_some(),
                        params.is_some_and(|p| p.client_no_context_takeover),
                        max,
                    ),
                    deflater: params.map(|p| Deflater::new(p.server_no_context_takeover)),
                };
                self.flush_locked(st);
                return;
            }
            // Fall through: not a well-formed upgrade, or the host has no
            // websocket handler. Routed like any request (likely a 404).
        }

        if !vhost.limiter.allow(self.peer.ip(), 1) {
            debug!("Rate limited {}", self.peer);
            let resp = Response::text(429, "Too many requests\n");
            self.enqueue(st, vhost, WorkPayload::Canned { req, resp }, shared);
            return;
        }

        self.enqueue(st, vhost, WorkPayload::Http(req), shared);
    }

    /// Control frames are answered inline on the worker thread; data
    /// messages go through the deferred queue like any request.
    fn handle_ws_events(
        self: &Arc<Self>,
        st: &mut ConnState,
        events: Vec<WsEvent>,
        snap: &Arc<Snapshot>,
        shared: &Arc<Shared>,
    ) {
        for event in events {
            match event {
                WsEvent::Ping(payload) => {
                    trace!("Ping, {} bytes", payload.len());
                    let mut out = Vec::new();
                    frame::encode_frame(true, false, Opcode::Pong, &payload, &mut out);
                    st.out.push(out);
                }
                WsEvent::Pong(_) => {}
                WsEvent::Close { code, .. } => {
                    debug!("Client close, code {code:?}");
                    let mut out = Vec::new();
                    frame::encode_close(code, b"", &mut out);
                    st.out.push(out);
                    self.flush_locked(st);
                    self.close_locked(st);
                    return;
                }
                WsEvent::Message(msg) => {
                    let vhost = st
                        .ws_vhost
                        .clone()
                        .unwrap_or_else(|| snap.vhost(st.fixed_vhost.unwrap_or(0)));
                    self.enqueue(st, vhost, WorkPayload::Ws(msg), shared);
                }
            }
        }
        self.flush_locked(st);
    }

    /// The queue discipline of the deferred-work design: the first item for
    /// a connection goes straight to the global queue; anything behind it
    /// waits in the private FIFO until its predecessor completes. That keeps
    /// responses in request order without parking a handler thread.
    fn enqueue(
        self: &Arc<Self>,
        st: &mut ConnState,
        vhost: Arc<Vhost>,
        payload: WorkPayload,
        shared: &Arc<Shared>,
    ) {
        if st.in_flight {
            st.pending.push_back(PendingWork { vhost, payload });
        } else {
            st.in_flight = true;
            shared.queue.push(WorkItem {
                conn: Arc::clone(self),
                vhost,
                payload,
            });
        }
    }

    /// Handler thread re-enters the write path with the finished exchange.
    pub fn publish(self: &Arc<Self>, outcome: HandlerOutcome, shared: &Arc<Shared>) {
        let mut st = self.state.lock().expect("connection mutex poisoned");
        st.last_action = Instant::now();
        if self.is_destroyed() {
            st.in_flight = false;
            st.pending.clear();
            return;
        }
        match outcome {
            HandlerOutcome::Http { req, mut resp } => {
                if shared.shutting_down() {
                    resp.close = true;
                }
                let mut writer = ResponseWriter::new(&req, &resp);
                match writer.serialize(&resp, &mut st.out) {
                    Ok(()) => {
                        if !writer.keep_alive() {
                            st.close_after_flush = true;
                        }
                    }
                    Err(err) => {
                        warn!("Serializing response: {err}");
                        st.close_after_flush = true;
                    }
                }
            }
            HandlerOutcome::Ws { replies } => {
                for msg in replies {
                    Self::write_ws_message(&mut st, &msg);
                }
            }
            HandlerOutcome::Panicked => {
                st.out.push(error_bytes(&ParseError::Error));
                st.close_after_flush = true;
            }
        }
        self.flush_locked(&mut st);

        // Promote the next private item, if any, now that this one is done.
        if let Some(next) = st.pending.pop_front() {
            shared.queue.push(WorkItem {
                conn: Arc::clone(self),
                vhost: next.vhost,
                payload: next.payload,
            });
        } else {
            st.in_flight = false;
        }
        if !self.is_destroyed() {
            self.rearm(&st);
        }
        drop(st);
        self.drain_deferred();
    }

    fn write_ws_message(st: &mut ConnState, msg: &WsMessage) {
        let Proto::Ws { deflater, .. } = &mut st.proto else {
            return;
        };
        let mut out = Vec::new();
        match deflater {
            Some(d) => {
                let mut compressed = Vec::new();
                if d.compress_message(&msg.payload, &mut compressed).is_ok() {
                    frame::encode_frame(true, true, msg.opcode, &compressed, &mut out);
                } else {
                    frame::encode_frame(true, false, msg.opcode, &msg.payload, &mut out);
                }
            }
            None => frame::encode_frame(true, false, msg.opcode, &msg.payload, &mut out),
        }
        st.out.push(out);
    }

    /// Terminal parser fault: deterministic status, then close. No response
    /// at all once a close is already pending.
    fn protocol_error(&self, st: &mut ConnState, err: &ParseError) {
        info!("Protocol error on {}: {err}", self.peer);
        // Drain what the client already sent so closing does not reset the
        // terminal response off the wire.
        let mut discard = [0u8; 4096];
        loop {
            match Self::read_some(st, &mut discard) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
        if !st.close_after_flush {
            st.out.push(error_bytes(err));
        }
        st.close_after_flush = true;
        self.flush_locked(st);
    }

    /// Drain the outbound queue as far as the socket allows. Closing waits
    /// for the bytes to leave.
    fn flush_locked(&self, st: &mut ConnState) {
        if self.is_destroyed() {
            return;
        }
        let ConnState { sock, tls, out, .. } = st;
        let result = match tls {
            Some(session) => {
                // Hand everything to rustls, then push records out.
                let mut hand = Ok(());
                while let Some(segment) = out.pop_front() {
                    if let Err(e) = session.queue_plaintext(&segment) {
                        hand = Err(e);
                        break;
                    }
                }
                hand.and_then(|()| {
                    session.flush(sock).map(|done| {
                        if done {
                            WriteOutcome::Done
                        } else {
                            WriteOutcome::Again
                        }
                    })
                })
            }
            None => out.write_to(sock),
        };
        match result {
            Ok(WriteOutcome::Done) => {
                if st.close_after_flush {
                    self.close_locked(st);
                }
            }
            Ok(WriteOutcome::Again) => {}
            Err(e) => {
                debug!("write(): {e}");
                self.close_locked(st);
            }
        }
    }

    /// Re-arm the one-shot multiplexer registration with the interest this
    /// connection currently needs.
    fn rearm(&self, st: &ConnState) {
        if self.is_destroyed() {
            return;
        }
        let wants_write =
            !st.out.is_empty() || st.tls.as_ref().is_some_and(TlsSession::wants_write);
        let interest = if wants_write {
            Interest::BOTH
        } else {
            Interest::READ
        };
        if let Err(e) = self.poller.modify(self.fd, self.id, interest) {
            trace!("rearm: {e}");
        }
    }

    /// An event arrived while the lock was held. Re-arming makes the kernel
    /// report it again now that the lock is (about to be) free.
    fn drain_deferred(&self) {
        if self.deferred.swap(false, Ordering::SeqCst) {
            if let Ok(st) = self.state.try_lock() {
                self.rearm(&st);
            }
            // If somebody else holds the lock they will re-arm on release.
        }
    }

    /// Idempotent teardown: TLS shutdown precedes socket close, the poller
    /// registration goes away, unsent bytes are scrubbed. Memory is freed
    /// when the last Arc drops.
    fn close_locked(&self, st: &mut ConnState) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("Closing connection {}", self.id);
        let ConnState { sock, tls, .. } = st;
        if let Some(session) = tls.as_mut() {
            session.shutdown(sock);
        }
        if let Err(e) = self.poller.remove(self.fd) {
            trace!("poller remove: {e}");
        }
        let _ = sock.shutdown(Shutdown::Both);
        st.proto = Proto::Closed;
        st.pending.clear();
        st.ws_vhost = None;
        st.close_after_flush = false;
        while let Some(mut segment) = st.out.pop_front() {
            segment.zeroize();
        }
    }
}

fn session_name(tls: Option<&TlsSession>) -> Option<String> {
    tls.and_then(|t| t.server_name().map(str::to_string))
}
