//! Virtual hosts: domain matching, the statically-linked handler registry,
//! middleware, and socket-free internal dispatch.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::http::request::Request;
use crate::http::response::Response;
use crate::http::Method;
use crate::limit::RateLimiter;
use crate::ws::frame::WsMessage;

/// Internal dispatch recursion cap; one level past it answers 508.
const MAX_DISPATCH_DEPTH: u32 = 8;

thread_local! {
    static DISPATCH_DEPTH: std::cell::Cell<u32> = const { std::cell::Cell::new(0) };
}

/// An application request handler, resolved by (method, path pattern) at
/// configuration load and invoked on a handler thread. Handlers may block.
pub trait Handler: Send + Sync {
    fn handle(&self, req: &mut Request, resp: &mut Response);
}

impl<F> Handler for F
where
    F: Fn(&mut Request, &mut Response) + Send + Sync,
{
    fn handle(&self, req: &mut Request, resp: &mut Response) {
        self(req, resp);
    }
}

/// Built-in 301 handler.
pub struct Redirect(pub String);

impl Handler for Redirect {
    fn handle(&self, _req: &mut Request, resp: &mut Response) {
        *resp = Response::redirect(&self.0);
    }
}

/// Application callback for websocket messages. Replies are written back in
/// order, compressed when the connection negotiated it.
pub trait WsHandler: Send + Sync {
    fn on_message(&self, msg: &WsMessage) -> Vec<WsMessage>;
}

impl<F> WsHandler for F
where
    F: Fn(&WsMessage) -> Vec<WsMessage> + Send + Sync,
{
    fn on_message(&self, msg: &WsMessage) -> Vec<WsMessage> {
        self(msg)
    }
}

/// Pre-handler middleware. Returning false stops the chain; the middleware
/// has already filled the response (e.g. a 403).
pub trait Middleware: Send + Sync {
    fn apply(&self, req: &mut Request, resp: &mut Response) -> bool;
}

struct Route {
    /// Empty means any method.
    methods: Vec<Method>,
    pattern: regex::Regex,
    handler: Arc<dyn Handler>,
}

pub(crate) enum RouteMatch {
    Found(Arc<dyn Handler>),
    MethodNotAllowed,
    NotFound,
}

/// One virtual host: matched by Host header or TLS SNI against an ordered
/// list of domain patterns. Immutable after configuration load; reload swaps
/// the whole snapshot.
pub struct Vhost {
    pub name: String,
    domains: Vec<regex::Regex>,
    routes: Vec<Route>,
    middleware: Vec<Arc<dyn Middleware>>,
    pub limiter: RateLimiter,
    pub ws_handler: Option<Arc<dyn WsHandler>>,
}

impl Vhost {
    #[must_use]
    pub fn builder(name: &str) -> VhostBuilder {
        VhostBuilder {
            name: name.to_string(),
            domains: Vec::new(),
            routes: Vec::new(),
            middleware: Vec::new(),
            limiter: RateLimiter::unlimited(),
            ws_handler: None,
        }
    }

    #[must_use]
    pub fn matches(&self, host: &str) -> bool {
        self.domains.iter().any(|re| re.is_match(host))
    }

    pub(crate) fn route(&self, method: Method, path: &str) -> RouteMatch {
        let mut path_seen = false;
        for route in &self.routes {
            if !route.pattern.is_match(path) {
                continue;
            }
            path_seen = true;
            if route.methods.is_empty() || route.methods.contains(&method) {
                return RouteMatch::Found(Arc::clone(&route.handler));
            }
        }
        if path_seen {
            RouteMatch::MethodNotAllowed
        } else {
            RouteMatch::NotFound
        }
    }

    /// Middleware chain, then the matched handler. 404/405 when no route
    /// takes the request.
    pub fn handle(&self, req: &mut Request, resp: &mut Response) {
        for mw in &self.middleware {
            if !mw.apply(req, resp) {
                trace!("Middleware short-circuited {}", req.path);
                return;
            }
        }
        match self.route(req.method, &req.path) {
            RouteMatch::Found(handler) => handler.handle(req, resp),
            RouteMatch::MethodNotAllowed => {
                *resp = Response::text(405, "Method not allowed\n");
            }
            RouteMatch::NotFound => {
                debug!("No route for {} {}", req.method, req.path);
                *resp = Response::text(404, "Not found\n");
            }
        }
    }

    /// Dispatch a request against this host's own routes without touching
    /// the network stack. Shares the handler registry with socket-triggered
    /// requests; recursion answers 508.
    pub fn dispatch_internal(&self, req: &mut Request) -> Response {
        let depth = DISPATCH_DEPTH.with(std::cell::Cell::get);
        if depth >= MAX_DISPATCH_DEPTH {
            debug!("Internal dispatch loop at depth {depth}");
            return Response::text(508, "Loop detected\n");
        }
        DISPATCH_DEPTH.with(|d| d.set(depth + 1));
        let mut resp = Response::new(200);
        self.handle(req, &mut resp);
        DISPATCH_DEPTH.with(|d| d.set(depth));
        resp
    }
}

pub struct VhostBuilder {
    name: String,
    domains: Vec<regex::Regex>,
    routes: Vec<Route>,
    middleware: Vec<Arc<dyn Middleware>>,
    limiter: RateLimiter,
    ws_handler: Option<Arc<dyn WsHandler>>,
}

impl VhostBuilder {
    /// Add a domain pattern. Anchored: `example\.com` matches only that
    /// host, `.*` makes a catch-all.
    pub fn domain(mut self, pattern: &str) -> anyhow::Result<Self> {
        self.domains
            .push(regex::Regex::new(&format!("^(?i){pattern}$"))?);
        Ok(self)
    }

    /// Register a handler for a path pattern (anchored regex) and methods.
    /// Empty methods accept any.
    pub fn route(
        mut self,
        methods: &[Method],
        pattern: &str,
        handler: Arc<dyn Handler>,
    ) -> anyhow::Result<Self> {
        self.routes.push(Route {
            methods: methods.to_vec(),
            pattern: regex::Regex::new(&format!("^{pattern}$"))?,
            handler,
        });
        Ok(self)
    }

    pub fn middleware(mut self, mw: Arc<dyn Middleware>) -> Self {
        self.middleware.push(mw);
        self
    }

    pub fn rate_limit(mut self, requests_per_second: u32, burst: u32) -> Self {
        self.limiter = RateLimiter::new(requests_per_second, burst);
        self
    }

    pub fn websocket(mut self, handler: Arc<dyn WsHandler>) -> Self {
        self.ws_handler = Some(handler);
        self
    }

    #[must_use]
    pub fn build(self) -> Vhost {
        Vhost {
            name: self.name,
            domains: self.domains,
            routes: self.routes,
            middleware: self.middleware,
            limiter: self.limiter,
            ws_handler: self.ws_handler,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::parser::{Feed, HostResolver, Parser, ParserConfig};

    struct AnyHost;
    impl HostResolver for AnyHost {
        fn resolve(&self, _host: &str) -> Option<usize> {
            Some(0)
        }
    }

    fn request(raw: &[u8]) -> Request {
        let mut p = Parser::new(ParserConfig::new(1 << 20, &std::env::temp_dir()));
        match p.feed(raw, &AnyHost).unwrap() {
            Feed::Complete { .. } => p.take_request().unwrap(),
            Feed::NeedMore => panic!("incomplete"),
        }
    }

    fn hello_vhost() -> Vhost {
        Vhost::builder("test")
            .domain(r"example\.com")
            .unwrap()
            .route(
                &[Method::Get],
                "/hello",
                Arc::new(|_req: &mut Request, resp: &mut Response| {
                    *resp = Response::text(200, "hi");
                }),
            )
            .unwrap()
            .build()
    }

    #[test]
    fn domain_matching_is_anchored_and_case_insensitive() {
        let v = hello_vhost();
        assert!(v.matches("example.com"));
        assert!(v.matches("EXAMPLE.com"));
        assert!(!v.matches("notexample.com"));
        assert!(!v.matches("example.com.evil"));
    }

    #[test]
    fn found_route_runs_handler() {
        let v = hello_vhost();
        let mut req = request(b"GET /hello HTTP/1.1\r\nHost: a\r\n\r\n");
        let mut resp = Response::new(200);
        v.handle(&mut req, &mut resp);
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, b"hi");
    }

    #[test]
    fn wrong_method_is_405() {
        let v = hello_vhost();
        let mut req = request(b"POST /hello HTTP/1.1\r\nHost: a\r\nContent-Length: 0\r\n\r\n");
        let mut resp = Response::new(200);
        v.handle(&mut req, &mut resp);
        assert_eq!(resp.status, 405);
    }

    #[test]
    fn unknown_path_is_404() {
        let v = hello_vhost();
        let mut req = request(b"GET /nope HTTP/1.1\r\nHost: a\r\n\r\n");
        let mut resp = Response::new(200);
        v.handle(&mut req, &mut resp);
        assert_eq!(resp.status, 404);
    }

    #[test]
    fn middleware_short_circuits() {
        struct Deny;
        impl Middleware for Deny {
            fn apply(&self, _req: &mut Request, resp: &mut Response) -> bool {
                *resp = Response::text(403, "Forbidden\n");
                false
            }
        }
        let v = Vhost::builder("mw")
            .domain(".*")
            .unwrap()
            .route(
                &[],
                "/.*",
                Arc::new(|_: &mut Request, resp: &mut Response| {
                    *resp = Response::text(200, "never");
                }),
            )
            .unwrap()
            .middleware(Arc::new(Deny))
            .build();
        let mut req = request(b"GET /x HTTP/1.1\r\nHost: a\r\n\r\n");
        let mut resp = Response::new(200);
        v.handle(&mut req, &mut resp);
        assert_eq!(resp.status, 403);
    }

    #[test]
    fn redirect_handler() {
        let v = Vhost::builder("r")
            .domain(".*")
            .unwrap()
            .route(&[], "/old", Arc::new(Redirect("/new".to_string())))
            .unwrap()
            .build();
        let mut req = request(b"GET /old HTTP/1.1\r\nHost: a\r\n\r\n");
        let mut resp = Response::new(200);
        v.handle(&mut req, &mut resp);
        assert_eq!(resp.status, 301);
        assert_eq!(resp.header("Location"), Some("/new"));
    }

    #[test]
    fn internal_dispatch_shares_routes() {
        let v = hello_vhost();
        let mut req = request(b"GET /hello HTTP/1.1\r\nHost: a\r\n\r\n");
        let resp = v.dispatch_internal(&mut req);
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, b"hi");
    }

    #[test]
    fn recursive_internal_dispatch_hits_508() {
        // A handler that re-enters its own vhost forever.
        struct Loopy {
            vhost: std::sync::Mutex<Option<Arc<Vhost>>>,
        }
        impl Handler for Loopy {
            fn handle(&self, req: &mut Request, resp: &mut Response) {
                let vhost = self.vhost.lock().unwrap().clone().unwrap();
                *resp = vhost.dispatch_internal(req);
            }
        }
        let loopy = Arc::new(Loopy {
            vhost: std::sync::Mutex::new(None),
        });
        let v = Arc::new(
            Vhost::builder("loop")
                .domain(".*")
                .unwrap()
                .route(&[], "/spin", loopy.clone() as Arc<dyn Handler>)
                .unwrap()
                .build(),
        );
        *loopy.vhost.lock().unwrap() = Some(v.clone());

        let mut req = request(b"GET /spin HTTP/1.1\r\nHost: a\r\n\r\n");
        let resp = v.dispatch_internal(&mut req);
        assert_eq!(resp.status, 508);
    }
}
