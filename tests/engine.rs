//! End-to-end tests against a live engine: real sockets, real worker and
//! handler threads, raw byte-level clients.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use spindrift::config::{EngineConfig, Shared, Snapshot};
use spindrift::http::request::Request;
use spindrift::http::response::Response;
use spindrift::http::Method;
use spindrift::vhost::Vhost;
use spindrift::worker::Engine;

struct TestServer {
    addr: SocketAddr,
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl TestServer {
    fn start(vhosts: Vec<Arc<Vhost>>, tweak: impl FnOnce(&mut EngineConfig)) -> Self {
        let mut cfg = EngineConfig {
            tick: Duration::from_millis(50),
            max_idle: Duration::from_secs(30),
            ..EngineConfig::default()
        };
        tweak(&mut cfg);
        let engine = Engine::new(cfg, Snapshot::new(vhosts)).expect("engine start");
        let addr = engine.local_addr();
        let shared = engine.shared();
        let handle = std::thread::spawn(move || engine.run().expect("engine run"));
        Self {
            addr,
            shared,
            handle: Some(handle),
        }
    }

    fn connect(&self) -> Client {
        let sock = TcpStream::connect(self.addr).expect("connect");
        sock.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        Client {
            sock,
            buf: Vec::new(),
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shared.begin_shutdown();
        self.handle.take().expect("handle").join().expect("join");
    }
}

/// Raw HTTP client that consumes exactly one Content-Length-framed response
/// per call, keeping pipelined leftovers for the next one.
struct Client {
    sock: TcpStream,
    buf: Vec<u8>,
}

impl Client {
    fn send(&mut self, bytes: &[u8]) {
        self.sock.write_all(bytes).expect("send");
    }

    fn read_response(&mut self) -> (String, String, Vec<u8>) {
        let mut chunk = [0u8; 4096];
        let header_end = loop {
            if let Some(pos) = self.buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
            let n = self.sock.read(&mut chunk).expect("read headers");
            assert!(
                n > 0,
                "EOF before headers: {:?}",
                String::from_utf8_lossy(&self.buf)
            );
            self.buf.extend_from_slice(&chunk[..n]);
        };
        let head = String::from_utf8(self.buf[..header_end].to_vec()).unwrap();
        let (status, headers) = head.split_once("\r\n").unwrap();
        let content_length: usize = headers
            .lines()
            .find_map(|l| l.strip_prefix("Content-Length: "))
            .map_or(0, |v| v.trim().parse().unwrap());
        while self.buf.len() < header_end + content_length {
            let n = self.sock.read(&mut chunk).expect("read body");
            assert!(n > 0, "EOF mid-body");
            self.buf.extend_from_slice(&chunk[..n]);
        }
        let body = self.buf[header_end..header_end + content_length].to_vec();
        self.buf.drain(..header_end + content_length);
        (status.to_string(), headers.to_string(), body)
    }

    /// Everything still unread, through to EOF.
    fn read_rest(&mut self) -> Vec<u8> {
        let mut rest = std::mem::take(&mut self.buf);
        self.sock.read_to_end(&mut rest).expect("read to EOF");
        rest
    }
}

fn hello_vhost() -> Arc<Vhost> {
    Arc::new(
        Vhost::builder("test")
            .domain(".*")
            .unwrap()
            .route(
                &[Method::Get, Method::Head],
                "/hello",
                Arc::new(|_req: &mut Request, resp: &mut Response| {
                    *resp = Response::text(200, "hello world");
                }),
            )
            .unwrap()
            .route(
                &[Method::Post],
                "/echo",
                Arc::new(|req: &mut Request, resp: &mut Response| {
                    let body = req.body.read_to_vec().unwrap_or_default();
                    let mut r = Response::new(200);
                    r.body = body;
                    *resp = r;
                }),
            )
            .unwrap()
            .build(),
    )
}

#[test]
fn serves_basic_request() {
    let server = TestServer::start(vec![hello_vhost()], |_| {});
    let mut client = server.connect();
    client.send(b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n");
    let (status, headers, body) = client.read_response();
    assert_eq!(status, "HTTP/1.1 200 OK");
    assert!(headers.contains("Content-Length: 11"));
    assert!(headers.contains("Server: spindrift/"));
    assert_eq!(body, b"hello world");
}

#[test]
fn unknown_path_is_404() {
    let server = TestServer::start(vec![hello_vhost()], |_| {});
    let mut client = server.connect();
    client.send(b"GET /missing HTTP/1.1\r\nHost: x\r\n\r\n");
    let (status, _, _) = client.read_response();
    assert_eq!(status, "HTTP/1.1 404 Not Found");
}

#[test]
fn wrong_method_is_405() {
    let server = TestServer::start(vec![hello_vhost()], |_| {});
    let mut client = server.connect();
    client.send(b"DELETE /hello HTTP/1.1\r\nHost: x\r\n\r\n");
    let (status, _, _) = client.read_response();
    assert_eq!(status, "HTTP/1.1 405 Method Not Allowed");
}

#[test]
fn keep_alive_serves_sequential_requests() {
    let server = TestServer::start(vec![hello_vhost()], |_| {});
    let mut client = server.connect();
    for _ in 0..3 {
        client.send(b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n");
        let (status, _, body) = client.read_response();
        assert_eq!(status, "HTTP/1.1 200 OK");
        assert_eq!(body, b"hello world");
    }
}

#[test]
fn post_body_round_trips() {
    let server = TestServer::start(vec![hello_vhost()], |_| {});
    let mut client = server.connect();
    let payload = b"some body bytes";
    let mut wire = format!(
        "POST /echo HTTP/1.1\r\nHost: x\r\nContent-Length: {}\r\n\r\n",
        payload.len()
    )
    .into_bytes();
    wire.extend_from_slice(payload);
    client.send(&wire);
    let (status, _, body) = client.read_response();
    assert_eq!(status, "HTTP/1.1 200 OK");
    assert_eq!(body, payload);
}

#[test]
fn pipelined_responses_arrive_in_request_order() {
    // Handler A sleeps past B's parse completion; responses must still come
    // back A then B.
    let vhost = Arc::new(
        Vhost::builder("pipeline")
            .domain(".*")
            .unwrap()
            .route(
                &[Method::Get],
                "/a",
                Arc::new(|_req: &mut Request, resp: &mut Response| {
                    std::thread::sleep(Duration::from_millis(200));
                    *resp = Response::text(200, "response-a");
                }),
            )
            .unwrap()
            .route(
                &[Method::Get],
                "/b",
                Arc::new(|_req: &mut Request, resp: &mut Response| {
                    *resp = Response::text(200, "response-b");
                }),
            )
            .unwrap()
            .build(),
    );
    let server = TestServer::start(vec![vhost], |cfg| cfg.handler_threads = 4);
    let mut client = server.connect();
    // Both requests in a single write, parsed from a single read.
    client.send(b"GET /a HTTP/1.1\r\nHost: x\r\n\r\nGET /b HTTP/1.1\r\nHost: x\r\n\r\n");
    let (status_a, _, body_a) = client.read_response();
    let (status_b, _, body_b) = client.read_response();
    assert_eq!(status_a, "HTTP/1.1 200 OK");
    assert_eq!(body_a, b"response-a");
    assert_eq!(status_b, "HTTP/1.1 200 OK");
    assert_eq!(body_b, b"response-b");
}

#[test]
fn oversized_body_gets_413_and_close() {
    let server = TestServer::start(vec![hello_vhost()], |cfg| {
        cfg.client_max_body_size = 1024;
    });
    let mut client = server.connect();
    let mut wire = b"POST /echo HTTP/1.1\r\nHost: x\r\nContent-Length: 2000\r\n\r\n".to_vec();
    wire.extend_from_slice(&[0u8; 2000]);
    client.send(&wire);
    let (status, headers, _) = client.read_response();
    assert_eq!(status, "HTTP/1.1 413 Payload Too Large");
    assert!(headers.contains("Connection: close"));
    // The engine closes after the terminal response.
    assert!(client.read_rest().is_empty());
}

#[test]
fn malformed_request_gets_400_and_close() {
    let server = TestServer::start(vec![hello_vhost()], |_| {});
    let mut client = server.connect();
    client.send(b"BOGUS-REQUEST\x01\r\n\r\n");
    let (status, _, _) = client.read_response();
    assert_eq!(status, "HTTP/1.1 400 Bad Request");
    assert!(client.read_rest().is_empty());
}

#[test]
fn traversal_is_rejected_before_routing() {
    let server = TestServer::start(vec![hello_vhost()], |_| {});
    let mut client = server.connect();
    client.send(b"GET /a/../b HTTP/1.1\r\nHost: x\r\n\r\n");
    let (status, _, _) = client.read_response();
    assert_eq!(status, "HTTP/1.1 400 Bad Request");
}

#[test]
fn unmatched_host_is_404() {
    let vhost = Arc::new(
        Vhost::builder("strict")
            .domain(r"only\.example")
            .unwrap()
            .route(
                &[Method::Get],
                "/",
                Arc::new(|_req: &mut Request, resp: &mut Response| {
                    *resp = Response::text(200, "ok");
                }),
            )
            .unwrap()
            .build(),
    );
    let server = TestServer::start(vec![vhost], |_| {});

    let mut client = server.connect();
    client.send(b"GET / HTTP/1.1\r\nHost: only.example\r\n\r\n");
    let (status, _, _) = client.read_response();
    assert_eq!(status, "HTTP/1.1 200 OK");

    let mut client = server.connect();
    client.send(b"GET / HTTP/1.1\r\nHost: elsewhere.example\r\n\r\n");
    let (status, _, _) = client.read_response();
    assert_eq!(status, "HTTP/1.1 404 Not Found");
}

#[test]
fn rate_limited_requests_get_429() {
    let vhost = Arc::new(
        Vhost::builder("limited")
            .domain(".*")
            .unwrap()
            .route(
                &[Method::Get],
                "/",
                Arc::new(|_req: &mut Request, resp: &mut Response| {
                    *resp = Response::text(200, "ok");
                }),
            )
            .unwrap()
            .rate_limit(1, 1)
            .build(),
    );
    let server = TestServer::start(vec![vhost], |_| {});
    let mut client = server.connect();
    client.send(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
    let (status, _, _) = client.read_response();
    assert_eq!(status, "HTTP/1.1 200 OK");
    client.send(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
    let (status, _, _) = client.read_response();
    assert_eq!(status, "HTTP/1.1 429 Too Many Requests");
}

#[test]
fn range_request_returns_206_slice() {
    let vhost = Arc::new(
        Vhost::builder("ranged")
            .domain(".*")
            .unwrap()
            .route(
                &[Method::Get],
                "/data",
                Arc::new(|_req: &mut Request, resp: &mut Response| {
                    let mut r = Response::new(200);
                    r.body = (0..=9u8).map(|d| d + b'0').collect();
                    *resp = r;
                }),
            )
            .unwrap()
            .build(),
    );
    let server = TestServer::start(vec![vhost], |_| {});
    let mut client = server.connect();
    client.send(b"GET /data HTTP/1.1\r\nHost: x\r\nRange: bytes=2-5\r\n\r\n");
    let (status, headers, body) = client.read_response();
    assert_eq!(status, "HTTP/1.1 206 Partial Content");
    assert!(headers.contains("Content-Range: bytes 2-5/10"));
    assert_eq!(body, b"2345");
}

#[test]
fn multiple_workers_share_the_port() {
    let server = TestServer::start(vec![hello_vhost()], |cfg| cfg.workers = 2);
    for _ in 0..8 {
        let mut client = server.connect();
        client.send(b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n");
        let (status, _, _) = client.read_response();
        assert_eq!(status, "HTTP/1.1 200 OK");
    }
}

#[test]
fn snapshot_reload_swaps_routes() {
    let server = TestServer::start(vec![hello_vhost()], |_| {});
    let replacement = Arc::new(
        Vhost::builder("v2")
            .domain(".*")
            .unwrap()
            .route(
                &[Method::Get],
                "/hello",
                Arc::new(|_req: &mut Request, resp: &mut Response| {
                    *resp = Response::text(200, "second generation");
                }),
            )
            .unwrap()
            .build(),
    );
    server.shared.reload(Snapshot::new(vec![replacement]));

    let mut client = server.connect();
    client.send(b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n");
    let (_, _, body) = client.read_response();
    assert_eq!(body, b"second generation");
}

#[test]
fn handler_panic_returns_500_and_releases_connection() {
    let vhost = Arc::new(
        Vhost::builder("panicky")
            .domain(".*")
            .unwrap()
            .route(
                &[Method::Get],
                "/boom",
                Arc::new(|_req: &mut Request, _resp: &mut Response| {
                    panic!("handler fault");
                }),
            )
            .unwrap()
            .build(),
    );
    let server = TestServer::start(vec![vhost], |_| {});
    let mut client = server.connect();
    client.send(b"GET /boom HTTP/1.1\r\nHost: x\r\n\r\n");
    let (status, _, _) = client.read_response();
    assert_eq!(status, "HTTP/1.1 500 Internal Server Error");
}
