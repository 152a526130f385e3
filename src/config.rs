//! Engine configuration and the swappable virtual-host snapshot.
//!
//! Nothing here mutates in place after startup: a reload builds a fresh
//! `Snapshot` and swaps the pointer; connections created against the old one
//! keep it alive until their last reference drops.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tracing::info;

use crate::queue::DispatchQueue;
use crate::vhost::Vhost;

/// Fixed engine knobs, set once from the CLI.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub listen: SocketAddr,
    /// Worker threads, each with its own multiplexer and listener socket.
    pub workers: usize,
    /// Handler threads consuming the global dispatch queue.
    pub handler_threads: usize,
    pub max_connections: usize,
    /// Request payload cap; also the websocket message cap.
    pub client_max_body_size: u64,
    /// Spool directory for oversized request payloads.
    pub tmp_dir: PathBuf,
    /// Connections idle longer than this are closed on the periodic sweep.
    pub max_idle: Duration,
    /// Multiplexer wakeup used for housekeeping.
    pub tick: Duration,
    pub tls: Option<Arc<rustls::ServerConfig>>,
    pub cpu_affinity: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:0".parse().expect("static addr"),
            workers: 1,
            handler_threads: 2,
            max_connections: 100,
            client_max_body_size: 1 << 20,
            tmp_dir: std::env::temp_dir(),
            max_idle: Duration::from_secs(5),
            tick: Duration::from_secs(1),
            tls: None,
            cpu_affinity: false,
        }
    }
}

/// Immutable routing state: the ordered virtual hosts of the listener.
pub struct Snapshot {
    pub vhosts: Vec<Arc<Vhost>>,
}

impl Snapshot {
    #[must_use]
    pub fn new(vhosts: Vec<Arc<Vhost>>) -> Self {
        assert!(!vhosts.is_empty(), "at least one virtual host required");
        Self { vhosts }
    }

    /// First vhost whose domain list matches, by configuration order.
    #[must_use]
    pub fn resolve(&self, host: &str) -> Option<usize> {
        self.vhosts.iter().position(|v| v.matches(host))
    }

    #[must_use]
    pub fn vhost(&self, idx: usize) -> Arc<Vhost> {
        Arc::clone(&self.vhosts[idx.min(self.vhosts.len() - 1)])
    }
}

/// Process-wide context handed by reference to every component; replaces any
/// global mutable registry.
pub struct Shared {
    pub cfg: EngineConfig,
    snapshot: ArcSwap<Snapshot>,
    pub queue: DispatchQueue,
    shutdown: AtomicBool,
    conn_ids: AtomicU64,
}

impl Shared {
    #[must_use]
    pub fn new(cfg: EngineConfig, snapshot: Snapshot) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            snapshot: ArcSwap::from_pointee(snapshot),
            queue: DispatchQueue::new(),
            shutdown: AtomicBool::new(false),
            conn_ids: AtomicU64::new(0),
        })
    }

    /// Current routing snapshot. Cheap; taken per request, not cached.
    #[must_use]
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshot.load_full()
    }

    /// Atomically replace the routing state. The old snapshot is freed once
    /// the last connection referencing it drops.
    pub fn reload(&self, snapshot: Snapshot) {
        info!("Swapping in new virtual-host snapshot");
        self.snapshot.store(Arc::new(snapshot));
    }

    pub fn next_conn_id(&self) -> u64 {
        self.conn_ids.fetch_add(1, Ordering::Relaxed)
    }

    #[must_use]
    pub fn shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Set the shutdown flag and wake every blocked handler thread.
    pub fn begin_shutdown(&self) {
        info!("Shutdown requested");
        self.shutdown.store(true, Ordering::SeqCst);
        self.queue.wake_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vhost(name: &str, domain: &str) -> Arc<Vhost> {
        Arc::new(Vhost::builder(name).domain(domain).unwrap().build())
    }

    #[test]
    fn resolve_picks_first_match_in_order() {
        let snap = Snapshot::new(vec![
            vhost("a", r"a\.example"),
            vhost("any", ".*"),
            vhost("b", r"b\.example"),
        ]);
        assert_eq!(snap.resolve("a.example"), Some(0));
        // The catch-all shadows later entries.
        assert_eq!(snap.resolve("b.example"), Some(1));
        assert_eq!(snap.resolve("zzz"), Some(1));
    }

    #[test]
    fn resolve_none_without_match() {
        let snap = Snapshot::new(vec![vhost("a", r"a\.example")]);
        assert_eq!(snap.resolve("other"), None);
    }

    #[test]
    fn reload_swaps_wholesale_and_old_survives() {
        let shared = Shared::new(
            EngineConfig::default(),
            Snapshot::new(vec![vhost("old", ".*")]),
        );
        let before = shared.snapshot();
        shared.reload(Snapshot::new(vec![vhost("new", ".*")]));
        // The old snapshot stays valid for holders of the old Arc.
        assert_eq!(before.vhosts[0].name, "old");
        assert_eq!(shared.snapshot().vhosts[0].name, "new");
    }
}
