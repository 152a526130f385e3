// Event-driven HTTP/1.x + WebSocket server.
//
// N worker threads each run their own epoll multiplexer over a shared
// listening port (SO_REUSEPORT); M handler threads consume the deferred work
// queue. See the library modules for the engine itself; this binary wires
// configuration, a default virtual host with demo handlers, and signals.
#![allow(clippy::similar_names)]

use std::sync::Arc;

use anyhow::{Context, Error, Result, anyhow};
use clap::Parser;
use tracing::{debug, info};

use spindrift::config::{EngineConfig, Snapshot};
use spindrift::http::request::Request;
use spindrift::http::response::Response;
use spindrift::http::Method;
use spindrift::vhost::Vhost;
use spindrift::worker::Engine;
use spindrift::ws::frame::WsMessage;
use spindrift::{load_certs, load_private_key};

#[derive(Parser)]
struct Opt {
    #[arg(
        long,
        short,
        help = "Verbosity level. Can be error, warn info, debug, or trace.",
        default_value = "error"
    )]
    verbose: String,

    #[arg(long, default_value_t = 1, help = "Number of worker threads to run")]
    threads: usize,

    #[arg(long, default_value_t = 2, help = "Number of handler threads to run")]
    handler_threads: usize,

    /// Max concurrent connections per worker.
    #[arg(long, default_value_t = 100)]
    max_connections: usize,

    #[arg(long, help = "Enable CPU affinity 1:1 for threads")]
    cpu_affinity: bool,

    #[arg(long, short, help = "Listen address.", default_value = "[::]:8080")]
    listen: String,

    /// Request payload cap in bytes; larger uploads get a 413.
    #[arg(long, default_value_t = 1_048_576)]
    client_max_body_size: u64,

    /// Directory for spooled request payloads.
    #[arg(long)]
    tmp_dir: Option<std::path::PathBuf>,

    #[arg(long, default_value = "5s", value_parser = parse_duration, help = "Close connections idle this long.")]
    max_idle: std::time::Duration,

    #[arg(long, default_value = "1s", value_parser = parse_duration, help = "Periodic wakeup.")]
    periodic_wakeup: std::time::Duration,

    /// Per-peer request rate limit; 0 disables limiting.
    #[arg(long, default_value_t = 0)]
    rate_limit: u32,

    #[arg(long, short = 'P', help = "TLS private key")]
    tls_key: Option<std::path::PathBuf>,

    #[arg(long, short = 'C', help = "TLS certificate chain")]
    tls_cert: Option<std::path::PathBuf>,
}

#[allow(clippy::cast_sign_loss)]
#[allow(clippy::cast_possible_truncation)]
fn parse_duration(time_str: &str) -> Result<std::time::Duration, String> {
    if time_str.ends_with("ms") {
        let ms = time_str
            .trim_end_matches("ms")
            .parse::<u64>()
            .map_err(|_| "Invalid milliseconds")?;
        Ok(std::time::Duration::from_millis(ms))
    } else if time_str.ends_with('s') {
        let secs = time_str
            .trim_end_matches('s')
            .parse::<f64>()
            .map_err(|_| "Invalid seconds")?;
        let secs_whole = secs.trunc() as u64;
        let nanos = (secs.fract() * 1_000_000_000.0) as u32;
        Ok(std::time::Duration::new(secs_whole, nanos))
    } else {
        Err("Invalid format. Use 'Xs' or 'Yms' (e.g., '1.5s', '500ms')".to_string())
    }
}

fn tls_config(opt: &Opt) -> Result<Option<Arc<rustls::ServerConfig>>> {
    let (Some(cf), Some(kf)) = (&opt.tls_cert, &opt.tls_key) else {
        if opt.tls_cert.is_some() || opt.tls_key.is_some() {
            return Err(anyhow!("--tls-cert and --tls-key must both be given"));
        }
        return Ok(None);
    };
    debug!("Loading certs");
    let certs =
        load_certs(cf).with_context(|| format!("Loading certs from {}", cf.display()))?;
    debug!("Loading key");
    let key = load_private_key(kf)
        .with_context(|| format!("Loading private key from {}", kf.display()))?;
    debug!("Creating TLS config");
    let config = rustls::ServerConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(Some(Arc::new(config)))
}

/// The stock virtual host this binary ships: a status page, an echo
/// endpoint, and an echo websocket. Real deployments register their own
/// handlers against the library.
fn default_vhost(opt: &Opt) -> Result<Arc<Vhost>> {
    let mut builder = Vhost::builder("default")
        .domain(".*")?
        .route(
            &[Method::Get, Method::Head],
            "/",
            Arc::new(|_req: &mut Request, resp: &mut Response| {
                *resp = Response::text(
                    200,
                    concat!("spindrift/", env!("CARGO_PKG_VERSION"), "\n"),
                );
            }),
        )?
        .route(
            &[Method::Post, Method::Put],
            "/echo",
            Arc::new(|req: &mut Request, resp: &mut Response| {
                *resp = match req.body.read_to_vec() {
                    Ok(body) => {
                        let mut r = Response::new(200);
                        r.set_header("Content-Type", "application/octet-stream");
                        r.body = body;
                        r
                    }
                    Err(_) => Response::text(500, "Failed reading body\n"),
                };
            }),
        )?
        .websocket(Arc::new(|msg: &WsMessage| {
            vec![WsMessage {
                opcode: msg.opcode,
                payload: msg.payload.clone(),
            }]
        }));
    if opt.rate_limit > 0 {
        builder = builder.rate_limit(opt.rate_limit, opt.rate_limit * 2);
    }
    Ok(Arc::new(builder.build()))
}

fn main() -> Result<()> {
    let opt = Opt::parse();
    tracing_subscriber::fmt()
        .with_env_filter(format!("spindrift={}", opt.verbose))
        .with_writer(std::io::stderr)
        .init();

    let cfg = EngineConfig {
        listen: opt
            .listen
            .parse()
            .with_context(|| format!("Parsing listen address {}", opt.listen))?,
        workers: opt.threads,
        handler_threads: opt.handler_threads,
        max_connections: opt.max_connections,
        client_max_body_size: opt.client_max_body_size,
        tmp_dir: opt.tmp_dir.clone().unwrap_or_else(std::env::temp_dir),
        max_idle: opt.max_idle,
        tick: opt.periodic_wakeup,
        tls: tls_config(&opt)?,
        cpu_affinity: opt.cpu_affinity,
    };
    let snapshot = Snapshot::new(vec![default_vhost(&opt)?]);

    let engine = Engine::new(cfg, snapshot)?;
    info!("Listening on {}", engine.local_addr());

    // SIGINT/SIGTERM flip the shutdown flag and wake everything; workers
    // drain to zero live connections and exit.
    let shared = engine.shared();
    let mut signals =
        signal_hook::iterator::Signals::new([libc::SIGINT, libc::SIGTERM])?;
    std::thread::Builder::new()
        .name("signals".to_string())
        .spawn(move || {
            if let Some(sig) = signals.forever().next() {
                info!("Got signal {sig}");
                shared.begin_shutdown();
            }
        })?;

    engine.run()?;
    debug!("All threads done");
    Ok::<_, Error>(())
}
