//! HTTP/1.x request parser.
//!
//! A single-pass state machine over the bytes the worker thread read. Token
//! boundaries are single characters (space, `:`, CR, LF); control characters
//! anywhere in a token are a protocol error. The parser never buffers raw
//! input: partial tokens accumulate in the parser itself, so a request split
//! at any byte boundary across reads parses identically to a single read.
//!
//! When a request completes mid-buffer the consumed byte count is returned,
//! so the caller can dispatch the request and keep parsing the remainder of
//! the same read (pipelining) without another system call.

use std::path::{Path, PathBuf};

use tracing::{debug, trace};

use super::chunked::ChunkedDecoder;
use super::range;
use super::request::{Body, BodySink, Request};
use super::{Method, ParseError};

const METHOD_MAX: usize = 16;
const URI_MAX: usize = 8192;
const HEADER_KEY_MAX: usize = 256;
const HEADER_VALUE_MAX: usize = 8192;
const HEADERS_MAX: usize = 100;

/// Maps a Host header value (or its absence) to a virtual-host index.
pub trait HostResolver {
    fn resolve(&self, host: &str) -> Option<usize>;

    /// Used when an HTTP/1.0 request carries no Host header.
    fn default_vhost(&self) -> usize {
        0
    }

    /// Set when TLS SNI already picked the virtual host; the context switch
    /// happens once, so a later Host header does not override it.
    fn fixed(&self) -> Option<usize> {
        None
    }
}

/// Outcome of one `feed` call.
#[derive(Debug, PartialEq, Eq)]
pub enum Feed {
    /// All input consumed, request still incomplete. Wait for more bytes.
    NeedMore,
    /// A full request is ready (`take_request`). `consumed < input.len()`
    /// means pipelined bytes remain; keep parsing them before reading again.
    Complete { consumed: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Method,
    Uri,
    Protocol,
    ProtocolLf,
    HeaderStart,
    HeaderKey,
    HeaderSpace,
    HeaderValue,
    HeaderLf,
    HeadersEndLf,
    Payload,
    PayloadChunked,
}

/// Per-request parser limits and spool location.
#[derive(Debug, Clone)]
pub struct ParserConfig {
    pub max_body: u64,
    pub tmp_dir: PathBuf,
}

impl ParserConfig {
    #[must_use]
    pub fn new(max_body: u64, tmp_dir: &Path) -> Self {
        Self {
            max_body,
            tmp_dir: tmp_dir.to_path_buf(),
        }
    }
}

pub struct Parser {
    cfg: ParserConfig,
    state: State,

    method: String,
    uri: String,
    proto: String,
    key: String,
    value: String,

    parsed_method: Option<Method>,
    path: String,
    query: Vec<(String, String)>,
    headers: Vec<(String, String)>,
    cookies: Vec<(String, String)>,
    ranges: Option<Vec<range::RangeSpec>>,
    http11: bool,
    keep_alive: bool,
    vhost: Option<usize>,
    content_length: Option<u64>,
    chunked: bool,
    accept_deflate: bool,
    accept_gzip: bool,
    upgrade_websocket: bool,
    ws_key: Option<String>,
    ws_extensions: Option<String>,

    remaining: u64,
    sink: Option<BodySink>,
    chunk_dec: Option<ChunkedDecoder>,

    finished: Option<Request>,
}

fn is_ctrl(b: u8) -> bool {
    b < 0x20 || b == 0x7f
}

fn url_decode(input: &str, plus_is_space: bool) -> Result<String, ParseError> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hi = bytes.get(i + 1).and_then(|b| char::from(*b).to_digit(16));
                let lo = bytes.get(i + 2).and_then(|b| char::from(*b).to_digit(16));
                let (Some(hi), Some(lo)) = (hi, lo) else {
                    return Err(ParseError::BadRequest);
                };
                out.push(u8::try_from(hi * 16 + lo).map_err(|_| ParseError::BadRequest)?);
                i += 3;
            }
            b'+' if plus_is_space => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8(out).map_err(|_| ParseError::BadRequest)
}

impl Parser {
    #[must_use]
    pub fn new(cfg: ParserConfig) -> Self {
        Self {
            cfg,
            state: State::Method,
            method: String::new(),
            uri: String::new(),
            proto: String::new(),
            key: String::new(),
            value: String::new(),
            parsed_method: None,
            path: String::new(),
            query: Vec::new(),
            headers: Vec::new(),
            cookies: Vec::new(),
            ranges: None,
            http11: false,
            keep_alive: false,
            vhost: None,
            content_length: None,
            chunked: false,
            accept_deflate: false,
            accept_gzip: false,
            upgrade_websocket: false,
            ws_key: None,
            ws_extensions: None,
            remaining: 0,
            sink: None,
            chunk_dec: None,
            finished: None,
        }
    }

    /// Return to the freshly-created state. Called automatically when a
    /// finished request is taken, so a keep-alive connection reuses the same
    /// parser for its next request.
    pub fn reset(&mut self) {
        let cfg = self.cfg.clone();
        *self = Self::new(cfg);
    }

    /// Take the completed request. Resets the parser.
    pub fn take_request(&mut self) -> Option<Request> {
        let req = self.finished.take();
        if req.is_some() {
            self.reset();
        }
        req
    }

    /// Feed bytes from the worker's read buffer.
    pub fn feed(&mut self, input: &[u8], hosts: &dyn HostResolver) -> Result<Feed, ParseError> {
        debug_assert!(self.finished.is_none(), "previous request not taken");
        let mut pos = 0;
        while pos < input.len() {
            // Payload states consume in bulk, not per byte.
            match self.state {
                State::Payload => {
                    let take = usize::try_from(self.remaining)
                        .unwrap_or(usize::MAX)
                        .min(input.len() - pos);
                    self.sink_push(&input[pos..pos + take])?;
                    pos += take;
                    self.remaining -= take as u64;
                    if self.remaining == 0 {
                        self.complete()?;
                        return Ok(Feed::Complete { consumed: pos });
                    }
                    continue;
                }
                State::PayloadChunked => {
                    let mut dec = self.chunk_dec.take().unwrap_or_default();
                    let mut out = Vec::new();
                    let n = dec
                        .feed(&input[pos..], &mut out)
                        .map_err(|_| ParseError::BadRequest)?;
                    pos += n;
                    let done = dec.is_done();
                    self.chunk_dec = Some(dec);
                    self.sink_push(&out)?;
                    if done {
                        self.complete()?;
                        return Ok(Feed::Complete { consumed: pos });
                    }
                    continue;
                }
                _ => {}
            }

            let b = input[pos];
            pos += 1;
            match self.state {
                State::Method => match b {
                    b' ' => {
                        if self.method.is_empty() {
                            return Err(ParseError::BadRequest);
                        }
                        self.parsed_method = Some(
                            Method::from_token(&self.method).ok_or(ParseError::BadRequest)?,
                        );
                        self.state = State::Uri;
                    }
                    _ if is_ctrl(b) => return Err(ParseError::BadRequest),
                    _ => {
                        if self.method.len() >= METHOD_MAX {
                            return Err(ParseError::OutOfMemory);
                        }
                        self.method.push(char::from(b));
                    }
                },
                State::Uri => match b {
                    b' ' => {
                        self.process_uri()?;
                        self.state = State::Protocol;
                    }
                    _ if is_ctrl(b) => return Err(ParseError::BadRequest),
                    _ => {
                        if self.uri.len() >= URI_MAX {
                            return Err(ParseError::OutOfMemory);
                        }
                        self.uri.push(char::from(b));
                    }
                },
                State::Protocol => match b {
                    b'\r' => {
                        match self.proto.as_str() {
                            "HTTP/1.1" => {
                                self.http11 = true;
                                self.keep_alive = true;
                            }
                            "HTTP/1.0" => {
                                self.http11 = false;
                                self.keep_alive = false;
                            }
                            other => {
                                debug!("Unsupported protocol {other:?}");
                                return Err(ParseError::BadRequest);
                            }
                        }
                        self.state = State::ProtocolLf;
                    }
                    _ if is_ctrl(b) || b == b' ' => return Err(ParseError::BadRequest),
                    _ => {
                        if self.proto.len() >= METHOD_MAX {
                            return Err(ParseError::BadRequest);
                        }
                        self.proto.push(char::from(b));
                    }
                },
                State::ProtocolLf => {
                    if b != b'\n' {
                        return Err(ParseError::BadRequest);
                    }
                    self.state = State::HeaderStart;
                }
                State::HeaderStart => match b {
                    b'\r' => self.state = State::HeadersEndLf,
                    b':' => return Err(ParseError::BadRequest),
                    _ if is_ctrl(b) || b == b' ' => return Err(ParseError::BadRequest),
                    _ => {
                        if self.headers.len() >= HEADERS_MAX {
                            return Err(ParseError::OutOfMemory);
                        }
                        self.key.push(char::from(b));
                        self.state = State::HeaderKey;
                    }
                },
                State::HeaderKey => match b {
                    b':' => self.state = State::HeaderSpace,
                    _ if is_ctrl(b) || b == b' ' => return Err(ParseError::BadRequest),
                    _ => {
                        if self.key.len() >= HEADER_KEY_MAX {
                            return Err(ParseError::OutOfMemory);
                        }
                        self.key.push(char::from(b));
                    }
                },
                State::HeaderSpace => match b {
                    b' ' => {}
                    b'\r' => self.state = State::HeaderLf,
                    _ if is_ctrl(b) => return Err(ParseError::BadRequest),
                    _ => {
                        self.value.push(char::from(b));
                        self.state = State::HeaderValue;
                    }
                },
                State::HeaderValue => match b {
                    b'\r' => self.state = State::HeaderLf,
                    _ if is_ctrl(b) => return Err(ParseError::BadRequest),
                    _ => {
                        if self.value.len() >= HEADER_VALUE_MAX {
                            return Err(ParseError::OutOfMemory);
                        }
                        self.value.push(char::from(b));
                    }
                },
                State::HeaderLf => {
                    if b != b'\n' {
                        return Err(ParseError::BadRequest);
                    }
                    self.header_complete(hosts)?;
                    self.state = State::HeaderStart;
                }
                State::HeadersEndLf => {
                    if b != b'\n' {
                        return Err(ParseError::BadRequest);
                    }
                    if self.headers_end(hosts)? {
                        self.complete()?;
                        return Ok(Feed::Complete { consumed: pos });
                    }
                }
                State::Payload | State::PayloadChunked => unreachable!(),
            }
        }
        Ok(Feed::NeedMore)
    }

    fn sink_push(&mut self, data: &[u8]) -> Result<(), ParseError> {
        if self.sink.is_none() {
            self.sink = Some(BodySink::new(self.cfg.max_body, &self.cfg.tmp_dir));
        }
        self.sink
            .as_mut()
            .expect("sink just created")
            .push(data)
    }

    fn process_uri(&mut self) -> Result<(), ParseError> {
        if self.uri.is_empty() || !self.uri.starts_with('/') {
            return Err(ParseError::BadRequest);
        }
        // Fragment is dropped, query split off before decoding.
        let without_fragment = self.uri.split('#').next().unwrap_or("");
        let (raw_path, raw_query) = match without_fragment.split_once('?') {
            Some((p, q)) => (p, Some(q)),
            None => (without_fragment, None),
        };
        self.path = url_decode(raw_path, false)?;
        if self.path.bytes().any(is_ctrl) {
            return Err(ParseError::BadRequest);
        }
        // Path traversal never reaches the routing layer.
        if self.path.split('/').any(|seg| seg == "..") {
            debug!("Rejecting traversal attempt {:?}", self.path);
            return Err(ParseError::BadRequest);
        }
        if let Some(q) = raw_query {
            for pair in q.split('&').filter(|p| !p.is_empty()) {
                let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
                self.query
                    .push((url_decode(k, true)?, url_decode(v, true)?));
            }
        }
        Ok(())
    }

    /// Header side effects run as each value completes.
    fn header_complete(&mut self, hosts: &dyn HostResolver) -> Result<(), ParseError> {
        let key = std::mem::take(&mut self.key);
        let value = std::mem::take(&mut self.value);
        trace!("Header {key}: {value}");

        match key.to_ascii_lowercase().as_str() {
            "connection" => {
                let v = value.to_ascii_lowercase();
                if v.split(',').any(|t| t.trim() == "close") {
                    self.keep_alive = false;
                } else if v.split(',').any(|t| t.trim() == "keep-alive") {
                    self.keep_alive = true;
                }
            }
            "content-length" => {
                let len: u64 = value.trim().parse().map_err(|_| ParseError::BadRequest)?;
                self.content_length = Some(len);
            }
            "transfer-encoding" => {
                if value
                    .split(',')
                    .any(|t| t.trim().eq_ignore_ascii_case("chunked"))
                {
                    self.chunked = true;
                }
            }
            "host" => {
                if self.vhost.is_none() {
                    let name = value.rsplit_once(':').map_or(value.as_str(), |(h, port)| {
                        // Only strip a numeric port; IPv6 literals keep colons.
                        if port.bytes().all(|b| b.is_ascii_digit()) {
                            h
                        } else {
                            value.as_str()
                        }
                    });
                    self.vhost = Some(match hosts.fixed() {
                        Some(v) => v,
                        None => hosts.resolve(name).ok_or(ParseError::HostNotFound)?,
                    });
                }
            }
            "range" => match range::parse(&value) {
                Some(specs) => self.ranges = Some(specs),
                None => debug!("Invalid range header: {value:?}"),
            },
            "cookie" => {
                for pair in value.split(';') {
                    if let Some((k, v)) = pair.split_once('=') {
                        self.cookies
                            .push((k.trim().to_string(), v.trim().to_string()));
                    }
                }
            }
            "accept-encoding" => {
                for enc in value.split(',') {
                    match enc.trim() {
                        "deflate" => self.accept_deflate = true,
                        "gzip" => self.accept_gzip = true,
                        _ => {}
                    }
                }
            }
            "upgrade" => {
                if value.eq_ignore_ascii_case("websocket") {
                    self.upgrade_websocket = true;
                }
            }
            "sec-websocket-key" => self.ws_key = Some(value.trim().to_string()),
            "sec-websocket-extensions" => self.ws_extensions = Some(value.clone()),
            _ => {}
        }
        self.headers.push((key, value));
        Ok(())
    }

    /// Headers are done. Returns true when there is no payload to read.
    fn headers_end(&mut self, hosts: &dyn HostResolver) -> Result<bool, ParseError> {
        if self.vhost.is_none() {
            // HTTP/1.1 requires Host.
            if self.http11 && hosts.fixed().is_none() {
                return Err(ParseError::BadRequest);
            }
            self.vhost = Some(hosts.fixed().unwrap_or_else(|| hosts.default_vhost()));
        }
        if self.chunked {
            self.chunk_dec = Some(ChunkedDecoder::new());
            self.state = State::PayloadChunked;
            return Ok(false);
        }
        match self.content_length {
            Some(len) if len > 0 => {
                if len > self.cfg.max_body {
                    return Err(ParseError::PayloadTooLarge);
                }
                self.remaining = len;
                self.state = State::Payload;
                Ok(false)
            }
            _ => Ok(true),
        }
    }

    fn complete(&mut self) -> Result<(), ParseError> {
        let body = self.sink.take().map_or(Body::Empty, BodySink::finish);
        self.finished = Some(Request {
            method: self.parsed_method.take().ok_or(ParseError::Error)?,
            path: std::mem::take(&mut self.path),
            query: std::mem::take(&mut self.query),
            headers: std::mem::take(&mut self.headers),
            cookies: std::mem::take(&mut self.cookies),
            ranges: self.ranges.take(),
            http11: self.http11,
            keep_alive: self.keep_alive,
            vhost: self.vhost.take().ok_or(ParseError::Error)?,
            body,
            accept_deflate: self.accept_deflate,
            accept_gzip: self.accept_gzip,
            upgrade_websocket: self.upgrade_websocket,
            ws_key: self.ws_key.take(),
            ws_extensions: self.ws_extensions.take(),
        });
        Ok(())
    }
}
