//! Worker threads and engine assembly.
//!
//! Each worker owns one multiplexer, one `SO_REUSEPORT` listening socket
//! (the kernel spreads incoming connections across them), and one scratch
//! read buffer reused for every connection it drives. Handler threads are
//! spawned beside the workers and consume the global dispatch queue.

use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::os::unix::io::AsRawFd;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, error, info, trace, warn};
use zeroize::Zeroize;

use crate::config::{EngineConfig, Shared, Snapshot};
use crate::conn::Connection;
use crate::poller::{Event, Poller, TOKEN_LISTENER};
use crate::queue::handler_loop;
use crate::sock;
use crate::tls::TlsSession;

// 10MiB stack size per thread.
const THREAD_STACK_SIZE: usize = 10 * 1_048_576;

// Scratch read buffer size. Owned by the worker, never by a connection.
const READ_BUF: usize = 64 * 1024;

/// The assembled server: binds the first listener immediately (so the actual
/// port is known before `run`), then spawns workers and handler threads.
pub struct Engine {
    shared: Arc<Shared>,
    first_listener: Option<TcpListener>,
    addr: SocketAddr,
}

impl Engine {
    pub fn new(mut cfg: EngineConfig, snapshot: Snapshot) -> Result<Self> {
        let listener = sock::reuseport_listener(cfg.listen)
            .with_context(|| format!("binding {}", cfg.listen))?;
        let addr = listener.local_addr()?;
        // Workers bind the resolved address, which matters when the
        // configuration asked for port 0.
        cfg.listen = addr;
        let shared = Shared::new(cfg, snapshot);
        Ok(Self {
            shared,
            first_listener: Some(listener),
            addr,
        })
    }

    #[must_use]
    pub fn shared(&self) -> Arc<Shared> {
        Arc::clone(&self.shared)
    }

    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Run until shutdown completes. Spawns the worker and handler pools and
    /// joins them all.
    pub fn run(mut self) -> Result<()> {
        let shared = Arc::clone(&self.shared);
        std::thread::scope(|s| -> Result<()> {
            let mut handles = Vec::new();
            for n in 0..shared.cfg.workers {
                let listener = if n == 0 { self.first_listener.take() } else { None };
                let shared = Arc::clone(&shared);
                handles.push(
                    std::thread::Builder::new()
                        .name(format!("worker/{n}"))
                        .stack_size(THREAD_STACK_SIZE)
                        .spawn_scoped(s, move || -> Result<()> {
                            if shared.cfg.cpu_affinity {
                                // Set affinity mapping 1:1.
                                if !core_affinity::set_for_current(core_affinity::CoreId { id: n })
                                {
                                    error!("Failed to bind thread {n} to core {n}");
                                }
                            }
                            Worker::new(n, listener, shared)?.run()
                        })?,
                );
            }
            for n in 0..shared.cfg.handler_threads {
                let shared = Arc::clone(&shared);
                handles.push(
                    std::thread::Builder::new()
                        .name(format!("handler/{n}"))
                        .stack_size(THREAD_STACK_SIZE)
                        .spawn_scoped(s, move || -> Result<()> {
                            handler_loop(&shared);
                            Ok(())
                        })?,
                );
            }
            for handle in handles {
                handle.join().expect("thread panicked")?;
            }
            debug!("All threads joined");
            Ok(())
        })
    }
}

struct Worker {
    id: usize,
    shared: Arc<Shared>,
    listener: TcpListener,
    poller: Arc<Poller>,
    conns: HashMap<u64, Arc<Connection>>,
    accepting: bool,
    scratch: Box<[u8]>,
}

impl Worker {
    fn new(id: usize, listener: Option<TcpListener>, shared: Arc<Shared>) -> Result<Self> {
        let listener = match listener {
            Some(l) => l,
            None => sock::reuseport_listener(shared.cfg.listen)?,
        };
        let poller = Arc::new(Poller::new()?);
        poller.add_listener(listener.as_raw_fd())?;
        Ok(Self {
            id,
            shared,
            listener,
            poller,
            conns: HashMap::new(),
            accepting: true,
            scratch: vec![0u8; READ_BUF].into_boxed_slice(),
        })
    }

    fn run(mut self) -> Result<()> {
        info!("Worker {} running", self.id);
        let mut events: Vec<Event> = Vec::new();
        loop {
            self.poller.wait(&mut events, self.shared.cfg.tick)?;
            for ev in &events {
                if ev.token == TOKEN_LISTENER {
                    self.accept_burst();
                } else {
                    self.dispatch(ev);
                }
            }
            self.housekeeping();
            if self.shared.shutting_down() && self.conns.is_empty() && self.poller.live() == 0 {
                break;
            }
        }
        info!("Worker {} exiting", self.id);
        Ok(())
    }

    fn accept_burst(&mut self) {
        loop {
            if self.conns.len() >= self.shared.cfg.max_connections {
                // Full: disarm the listener; re-armed once slots free up.
                self.pause_accept();
                return;
            }
            let (stream, peer) = match self.listener.accept() {
                Ok(pair) => pair,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    warn!("accept(): {e}");
                    return;
                }
            };
            if let Err(e) = self.admit(stream, peer) {
                debug!("Admitting {peer}: {e}");
            }
        }
    }

    fn admit(&mut self, stream: std::net::TcpStream, peer: SocketAddr) -> Result<()> {
        stream.set_nonblocking(true)?;
        let tls = self
            .shared
            .cfg
            .tls
            .as_ref()
            .map(|cfg| TlsSession::new(Arc::clone(cfg)))
            .transpose()?;
        let id = self.shared.next_conn_id();
        debug!("Worker {} accepted {peer} as connection {id}", self.id);
        let conn = Connection::new(stream, peer, id, Arc::clone(&self.poller), &self.shared, tls);
        conn.register()?;
        self.conns.insert(id, conn);
        Ok(())
    }

    fn dispatch(&mut self, ev: &Event) {
        let Some(conn) = self.conns.get(&ev.token).map(Arc::clone) else {
            trace!("Event for a gone connection {}", ev.token);
            return;
        };
        conn.on_ready(ev.readable, ev.writable, ev.hangup, &mut self.scratch, &self.shared);
        if conn.is_destroyed() {
            self.conns.remove(&ev.token);
            self.scratch.zeroize();
        }
    }

    fn housekeeping(&mut self) {
        for conn in self.conns.values() {
            conn.sweep_idle(self.shared.cfg.max_idle);
        }
        if self.shared.shutting_down() {
            if self.accepting {
                self.pause_accept();
            }
            for conn in self.conns.values() {
                conn.close_if_idle();
            }
        }
        self.conns.retain(|_, c| !c.is_destroyed());
        if !self.accepting
            && !self.shared.shutting_down()
            && self.conns.len() < self.shared.cfg.max_connections
        {
            self.resume_accept();
        }
    }

    fn pause_accept(&mut self) {
        if !self.accepting {
            return;
        }
        if let Err(e) = self.poller.remove_listener(self.listener.as_raw_fd()) {
            warn!("Disarming listener: {e}");
        }
        self.accepting = false;
        debug!("Worker {} stopped accepting", self.id);
    }

    fn resume_accept(&mut self) {
        if let Err(e) = self.poller.add_listener(self.listener.as_raw_fd()) {
            warn!("Re-arming listener: {e}");
            return;
        }
        self.accepting = true;
        debug!("Worker {} accepting again", self.id);
    }
}
