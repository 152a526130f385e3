//! Response writing: status/header emission, the ordered body-filter chain
//! (compression, chunked framing, range slicing), and the resumable write
//! queue that feeds the socket.

use std::collections::VecDeque;
use std::fmt::Write as _;
use std::io::{self, Write};

use flate2::write::GzEncoder;
use flate2::{Compress, Compression, FlushCompress, Status};
use tracing::trace;

use super::chunked;
use super::range::{self, ByteRange};
use super::request::Request;
use super::{Method, ParseError};

/// Boundary for multipart/byteranges responses.
const RANGE_BOUNDARY: &str = "spindrift-byterange";

/// Body blocks are pushed through the filter chain in pieces of this size.
const BODY_BLOCK: usize = 16 * 1024;

/// The response a handler fills in. Owned by the connection for the duration
/// of one exchange.
#[derive(Debug)]
pub struct Response {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// Close the connection once this response is on the wire.
    pub close: bool,
}

impl Response {
    #[must_use]
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
            close: false,
        }
    }

    #[must_use]
    pub fn text(status: u16, body: &str) -> Self {
        let mut r = Self::new(status);
        r.set_header("Content-Type", "text/plain; charset=utf-8");
        r.body = body.as_bytes().to_vec();
        r
    }

    /// 301 with a Location header.
    #[must_use]
    pub fn redirect(location: &str) -> Self {
        let mut r = Self::new(301);
        r.set_header("Location", location);
        r
    }

    /// Replace-or-insert a header.
    pub fn set_header(&mut self, name: &str, value: &str) {
        if let Some(h) = self
            .headers
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
        {
            h.1 = value.to_string();
        } else {
            self.headers.push((name.to_string(), value.to_string()));
        }
    }

    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// The terminal response for a parser fault. No response at all if
    /// headers already went out; the caller closes either way.
    #[must_use]
    pub fn from_error(err: &ParseError) -> Self {
        let status = err.status();
        let mut r = Self::text(status, &format!("{}\n", reason(status)));
        r.close = true;
        r
    }
}

/// Reason phrase for the status line.
#[must_use]
pub fn reason(status: u16) -> &'static str {
    match status {
        101 => "Switching Protocols",
        200 => "OK",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        304 => "Not Modified",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        413 => "Payload Too Large",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        508 => "Loop Detected",
        _ => "Unknown",
    }
}

/// Minimal terminal-response bytes for a parser fault, used when there is no
/// parsed request to negotiate against. Always closes.
#[must_use]
pub fn error_bytes(err: &ParseError) -> Vec<u8> {
    let status = err.status();
    let body = format!("{}\n", reason(status));
    format!(
        "HTTP/1.1 {status} {}\r\nServer: spindrift/{}\r\nDate: {}\r\nConnection: close\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\n\r\n{body}",
        reason(status),
        env!("CARGO_PKG_VERSION"),
        httpdate::fmt_http_date(std::time::SystemTime::now()),
        body.len(),
    )
    .into_bytes()
}

/// Outcome of pushing queued bytes at the socket.
#[derive(Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Everything queued has hit the socket.
    Done,
    /// Socket is full; resume from the same point when writable again.
    Again,
}

/// Outbound byte queue. Draining stops at would-block and resumes from the
/// exact offset, so nothing is ever re-emitted.
#[derive(Debug, Default)]
pub struct WriteQueue {
    segments: VecDeque<Vec<u8>>,
    offset: usize,
}

impl WriteQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: Vec<u8>) {
        if !bytes.is_empty() {
            self.segments.push_back(bytes);
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.segments.iter().map(Vec::len).sum::<usize>() - self.offset
    }

    /// Take the next unsent segment, trimming any partially-written prefix.
    pub fn pop_front(&mut self) -> Option<Vec<u8>> {
        let mut segment = self.segments.pop_front()?;
        if self.offset > 0 {
            segment.drain(..self.offset);
            self.offset = 0;
        }
        Some(segment)
    }

    /// Write as much as the socket takes.
    pub fn write_to(&mut self, w: &mut dyn Write) -> io::Result<WriteOutcome> {
        while let Some(front) = self.segments.front() {
            match w.write(&front[self.offset..]) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
                Ok(n) => {
                    self.offset += n;
                    if self.offset == front.len() {
                        self.segments.pop_front();
                        self.offset = 0;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(WriteOutcome::Again)
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(WriteOutcome::Done)
    }
}

/// One transform in the body-filter chain. `last` marks the final block; the
/// filter must finish its stream exactly then.
trait BodyFilter {
    fn transform(
        &mut self,
        input: &[u8],
        last: bool,
        out: &mut Vec<u8>,
    ) -> Result<(), ParseError>;
}

/// Raw-deflate/zlib compression through the block-oriented API: loops over a
/// bounded output buffer until the compressor reports completion.
struct DeflateFilter {
    c: Compress,
}

impl DeflateFilter {
    fn new() -> Self {
        Self {
            c: Compress::new(Compression::default(), true),
        }
    }
}

impl BodyFilter for DeflateFilter {
    fn transform(
        &mut self,
        input: &[u8],
        last: bool,
        out: &mut Vec<u8>,
    ) -> Result<(), ParseError> {
        let mut pos = 0;
        let mut buf = [0u8; 4096];
        loop {
            let flush = if last {
                FlushCompress::Finish
            } else {
                FlushCompress::None
            };
            let before_in = self.c.total_in();
            let before_out = self.c.total_out();
            let status = self
                .c
                .compress(&input[pos..], &mut buf, flush)
                .map_err(|_| ParseError::Error)?;
            let consumed = usize::try_from(self.c.total_in() - before_in).unwrap_or(0);
            let produced = usize::try_from(self.c.total_out() - before_out).unwrap_or(0);
            pos += consumed;
            out.extend_from_slice(&buf[..produced]);
            match status {
                Status::StreamEnd => return Ok(()),
                Status::BufError if consumed == 0 && produced == 0 => {
                    return Err(ParseError::Error);
                }
                Status::Ok | Status::BufError => {
                    // Partial output: keep looping until the block is
                    // swallowed (and, on the last block, until StreamEnd).
                    if !last && pos >= input.len() && produced < buf.len() {
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Gzip compression through the streaming writer API.
struct GzipFilter {
    enc: Option<GzEncoder<Vec<u8>>>,
}

impl GzipFilter {
    fn new() -> Self {
        Self {
            enc: Some(GzEncoder::new(Vec::new(), Compression::default())),
        }
    }
}

impl BodyFilter for GzipFilter {
    fn transform(
        &mut self,
        input: &[u8],
        last: bool,
        out: &mut Vec<u8>,
    ) -> Result<(), ParseError> {
        let enc = self.enc.as_mut().ok_or(ParseError::Error)?;
        enc.write_all(input).map_err(|_| ParseError::Error)?;
        if last {
            let done = self
                .enc
                .take()
                .expect("encoder present")
                .finish()
                .map_err(|_| ParseError::Error)?;
            out.extend_from_slice(&done);
        } else {
            out.append(enc.get_mut());
        }
        Ok(())
    }
}

/// Chunked transfer framing. Emits one length-prefixed chunk per block and
/// the zero-length terminator on the last.
struct ChunkedFilter;

impl BodyFilter for ChunkedFilter {
    fn transform(
        &mut self,
        input: &[u8],
        last: bool,
        out: &mut Vec<u8>,
    ) -> Result<(), ParseError> {
        chunked::encode_chunk(input, out);
        if last {
            chunked::encode_final(out);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    /// Known length, bytes as-is.
    Identity,
    /// Length-prefixed chunks (compressed bodies on HTTP/1.1).
    Chunked,
    /// Delimited by connection close (compressed bodies on HTTP/1.0).
    UntilClose,
}

/// Serializes one response through the filter chain.
///
/// The header pass runs exactly once (`headers_sent`); the body pass streams
/// blocks through compression and framing filters into the write queue. The
/// queue, not the filters, owns would-block resumption: once bytes leave a
/// filter they are never produced again.
pub struct ResponseWriter {
    headers_sent: bool,
    head_only: bool,
    http11: bool,
    keep_alive: bool,
    framing: Framing,
    compress: Option<Box<dyn BodyFilter + Send>>,
    encoding_token: Option<&'static str>,
    ranges: Option<Vec<ByteRange>>,
}

impl ResponseWriter {
    /// Negotiate encodings and framing for this exchange.
    #[must_use]
    pub fn new(req: &Request, resp: &Response) -> Self {
        let head_only = req.method == Method::Head;
        let no_body = matches!(resp.status, 101 | 204 | 304);

        // Range requests substitute body emission with range-sliced reads,
        // and skip compression.
        let ranges = if resp.status == 200 && !no_body {
            req.ranges
                .as_deref()
                .and_then(|specs| range::resolve(specs, resp.body.len() as u64))
        } else {
            None
        };

        let compressible = !head_only
            && !no_body
            && ranges.is_none()
            && resp.body.len() >= 256
            && resp.header("Content-Encoding").is_none();
        let (compress, encoding_token): (Option<Box<dyn BodyFilter + Send>>, _) =
            if compressible && req.accept_gzip {
                (Some(Box::new(GzipFilter::new())), Some("gzip"))
            } else if compressible && req.accept_deflate {
                (Some(Box::new(DeflateFilter::new())), Some("deflate"))
            } else {
                (None, None)
            };

        let framing = if compress.is_some() {
            if req.http11 {
                Framing::Chunked
            } else {
                Framing::UntilClose
            }
        } else {
            Framing::Identity
        };

        Self {
            headers_sent: false,
            head_only,
            http11: req.http11,
            keep_alive: req.keep_alive && !resp.close && framing != Framing::UntilClose,
            framing,
            compress,
            encoding_token,
            ranges,
        }
    }

    /// True when this exchange leaves the connection open.
    #[must_use]
    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    #[must_use]
    pub fn headers_sent(&self) -> bool {
        self.headers_sent
    }

    /// Run the header pass and the body pass, appending wire bytes to `out`.
    pub fn serialize(&mut self, resp: &Response, out: &mut WriteQueue) -> Result<(), ParseError> {
        if let Some(ranges) = self.ranges.take() {
            return self.serialize_ranges(resp, &ranges, out);
        }
        let mut head = String::new();
        self.status_line(resp.status, &mut head);
        for (k, v) in &resp.headers {
            let _ = writeln!(head, "{k}: {v}\r");
        }
        if let Some(token) = self.encoding_token {
            let _ = writeln!(head, "Content-Encoding: {token}\r");
            let _ = writeln!(head, "Vary: accept-encoding\r");
        }
        match self.framing {
            Framing::Identity => {
                let _ = writeln!(head, "Content-Length: {}\r", resp.body.len());
            }
            Framing::Chunked => {
                let _ = writeln!(head, "Transfer-Encoding: chunked\r");
            }
            Framing::UntilClose => {}
        }
        head.push_str("\r\n");
        self.emit_headers(head, out);

        if self.head_only || resp.body.is_empty() && self.framing == Framing::Identity {
            return Ok(());
        }
        self.body_pass(&resp.body, out)
    }

    /// 206 body emission: identity slices of the full resource, one part per
    /// range (multipart framing when there is more than one).
    fn serialize_ranges(
        &mut self,
        resp: &Response,
        ranges: &[ByteRange],
        out: &mut WriteQueue,
    ) -> Result<(), ParseError> {
        let total = resp.body.len() as u64;
        let mut head = String::new();
        self.status_line(206, &mut head);
        for (k, v) in &resp.headers {
            if k.eq_ignore_ascii_case("content-type") && ranges.len() > 1 {
                continue; // replaced by the multipart type
            }
            let _ = writeln!(head, "{k}: {v}\r");
        }

        let mut body = Vec::new();
        if let [r] = ranges {
            let _ = writeln!(head, "Content-Range: bytes {}-{}/{total}\r", r.start, r.end);
            let _ = writeln!(head, "Content-Length: {}\r", r.len());
            head.push_str("\r\n");
            if !self.head_only {
                let (s, e) = (usize::try_from(r.start).unwrap(), usize::try_from(r.end).unwrap());
                body.extend_from_slice(&resp.body[s..=e]);
            }
        } else {
            let part_type = resp.header("Content-Type").unwrap_or("application/octet-stream").to_string();
            let mut parts = Vec::new();
            for r in ranges {
                let mut part = String::new();
                let _ = write!(
                    part,
                    "--{RANGE_BOUNDARY}\r\nContent-Type: {part_type}\r\nContent-Range: bytes {}-{}/{total}\r\n\r\n",
                    r.start, r.end
                );
                parts.push((part, r));
            }
            for (part, r) in &parts {
                body.extend_from_slice(part.as_bytes());
                let (s, e) = (usize::try_from(r.start).unwrap(), usize::try_from(r.end).unwrap());
                body.extend_from_slice(&resp.body[s..=e]);
                body.extend_from_slice(b"\r\n");
            }
            body.extend_from_slice(format!("--{RANGE_BOUNDARY}--\r\n").as_bytes());
            let _ = writeln!(
                head,
                "Content-Type: multipart/byteranges; boundary={RANGE_BOUNDARY}\r"
            );
            let _ = writeln!(head, "Content-Length: {}\r", body.len());
            head.push_str("\r\n");
            if self.head_only {
                body.clear();
            }
        }
        self.emit_headers(head, out);
        out.push(body);
        Ok(())
    }

    fn status_line(&mut self, status: u16, head: &mut String) {
        let version = if self.http11 { "HTTP/1.1" } else { "HTTP/1.0" };
        let _ = write!(head, "{version} {status} {}\r\n", reason(status));
        let _ = writeln!(
            head,
            "Server: spindrift/{}\r",
            env!("CARGO_PKG_VERSION")
        );
        let _ = writeln!(
            head,
            "Date: {}\r",
            httpdate::fmt_http_date(std::time::SystemTime::now())
        );
        let _ = writeln!(
            head,
            "Connection: {}\r",
            if self.keep_alive { "keep-alive" } else { "close" }
        );
    }

    fn emit_headers(&mut self, head: String, out: &mut WriteQueue) {
        assert!(!self.headers_sent, "header pass ran twice");
        trace!("Emitting {} header bytes", head.len());
        out.push(head.into_bytes());
        self.headers_sent = true;
    }

    fn body_pass(&mut self, body: &[u8], out: &mut WriteQueue) -> Result<(), ParseError> {
        let blocks: Vec<&[u8]> = if body.is_empty() {
            vec![&[]]
        } else {
            body.chunks(BODY_BLOCK).collect()
        };
        let n = blocks.len();
        let mut framer = ChunkedFilter;
        for (i, block) in blocks.into_iter().enumerate() {
            let last = i + 1 == n;
            let mut stage = Vec::new();
            let transformed: &[u8] = if let Some(c) = self.compress.as_mut() {
                c.transform(block, last, &mut stage)?;
                &stage
            } else {
                block
            };
            let mut wire = Vec::with_capacity(transformed.len() + 16);
            match self.framing {
                Framing::Chunked => framer.transform(transformed, last, &mut wire)?,
                Framing::Identity | Framing::UntilClose => {
                    wire.extend_from_slice(transformed);
                }
            }
            out.push(wire);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::parser::{Feed, HostResolver, Parser, ParserConfig};
    use flate2::read::{GzDecoder, ZlibDecoder};
    use std::io::Read;

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

    fn drain(out: &mut WriteQueue) -> Vec<u8> {
        let mut sink = Vec::new();
        assert_eq!(out.write_to(&mut sink).unwrap(), WriteOutcome::Done);
        sink
    }

    fn split_response(wire: &[u8]) -> (String, Vec<u8>) {
        let pos = wire
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .expect("header terminator");
        (
            String::from_utf8(wire[..pos + 4].to_vec()).unwrap(),
            wire[pos + 4..].to_vec(),
        )
    }

    #[test]
    fn identity_response_with_content_length() {
        let req = request(b"GET / HTTP/1.1\r\nHost: a\r\n\r\n");
        let resp = Response::text(200, "hello");
        let mut w = ResponseWriter::new(&req, &resp);
        let mut out = WriteQueue::new();
        w.serialize(&resp, &mut out).unwrap();
        let (head, body) = split_response(&drain(&mut out));
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(head.contains("Content-Length: 5\r\n"));
        assert!(head.contains("Connection: keep-alive\r\n"));
        assert_eq!(body, b"hello");
        assert!(w.keep_alive());
        assert!(w.headers_sent());
    }

    #[test]
    fn gzip_negotiated_and_chunked() {
        let req = request(b"GET / HTTP/1.1\r\nHost: a\r\nAccept-Encoding: gzip, deflate\r\n\r\n");
        let payload = "abcdefgh".repeat(100);
        let resp = Response::text(200, &payload);
        let mut w = ResponseWriter::new(&req, &resp);
        let mut out = WriteQueue::new();
        w.serialize(&resp, &mut out).unwrap();
        let (head, body) = split_response(&drain(&mut out));
        assert!(head.contains("Content-Encoding: gzip\r\n"));
        assert!(head.contains("Transfer-Encoding: chunked\r\n"));

        // De-chunk, then gunzip; must round-trip the payload.
        let mut dec = chunked::ChunkedDecoder::new();
        let mut compressed = Vec::new();
        dec.feed(&body, &mut compressed).unwrap();
        assert!(dec.is_done());
        let mut plain = Vec::new();
        GzDecoder::new(&compressed[..])
            .read_to_end(&mut plain)
            .unwrap();
        assert_eq!(plain, payload.as_bytes());
    }

    #[test]
    fn deflate_when_gzip_not_accepted() {
        let req = request(b"GET / HTTP/1.1\r\nHost: a\r\nAccept-Encoding: deflate\r\n\r\n");
        let payload = "0123456789".repeat(200);
        let resp = Response::text(200, &payload);
        let mut w = ResponseWriter::new(&req, &resp);
        let mut out = WriteQueue::new();
        w.serialize(&resp, &mut out).unwrap();
        let (head, body) = split_response(&drain(&mut out));
        assert!(head.contains("Content-Encoding: deflate\r\n"));

        let mut dec = chunked::ChunkedDecoder::new();
        let mut compressed = Vec::new();
        dec.feed(&body, &mut compressed).unwrap();
        let mut plain = Vec::new();
        ZlibDecoder::new(&compressed[..])
            .read_to_end(&mut plain)
            .unwrap();
        assert_eq!(plain, payload.as_bytes());
    }

    #[test]
    fn small_bodies_skip_compression() {
        let req = request(b"GET / HTTP/1.1\r\nHost: a\r\nAccept-Encoding: gzip\r\n\r\n");
        let resp = Response::text(200, "tiny");
        let mut w = ResponseWriter::new(&req, &resp);
        let mut out = WriteQueue::new();
        w.serialize(&resp, &mut out).unwrap();
        let (head, body) = split_response(&drain(&mut out));
        assert!(!head.contains("Content-Encoding"));
        assert_eq!(body, b"tiny");
    }

    #[test]
    fn single_range_yields_206_slice() {
        let req = request(b"GET / HTTP/1.1\r\nHost: a\r\nRange: bytes=2-5\r\n\r\n");
        let mut resp = Response::new(200);
        resp.body = b"0123456789".to_vec();
        let mut w = ResponseWriter::new(&req, &resp);
        let mut out = WriteQueue::new();
        w.serialize(&resp, &mut out).unwrap();
        let (head, body) = split_response(&drain(&mut out));
        assert!(head.starts_with("HTTP/1.1 206 Partial Content\r\n"));
        assert!(head.contains("Content-Range: bytes 2-5/10\r\n"));
        assert_eq!(body, b"2345");
    }

    #[test]
    fn two_ranges_yield_multipart() {
        let req = request(b"GET / HTTP/1.1\r\nHost: a\r\nRange: bytes=0-1,4-5\r\n\r\n");
        let mut resp = Response::new(200);
        resp.body = b"0123456789".to_vec();
        let mut w = ResponseWriter::new(&req, &resp);
        let mut out = WriteQueue::new();
        w.serialize(&resp, &mut out).unwrap();
        let (head, body) = split_response(&drain(&mut out));
        assert!(head.contains("multipart/byteranges"));
        let text = String::from_utf8_lossy(&body);
        assert!(text.contains("Content-Range: bytes 0-1/10"));
        assert!(text.contains("Content-Range: bytes 4-5/10"));
        assert!(text.contains("01"));
        assert!(text.contains("45"));
    }

    #[test]
    fn invalid_range_falls_back_to_full_body() {
        let req = request(b"GET / HTTP/1.1\r\nHost: a\r\nRange: bytes=0-1,1-3\r\n\r\n");
        let mut resp = Response::new(200);
        resp.body = b"0123456789".to_vec();
        let mut w = ResponseWriter::new(&req, &resp);
        let mut out = WriteQueue::new();
        w.serialize(&resp, &mut out).unwrap();
        let (head, body) = split_response(&drain(&mut out));
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert_eq!(body, b"0123456789");
    }

    #[test]
    fn head_omits_body() {
        let req = request(b"HEAD / HTTP/1.1\r\nHost: a\r\n\r\n");
        let resp = Response::text(200, "hello");
        let mut w = ResponseWriter::new(&req, &resp);
        let mut out = WriteQueue::new();
        w.serialize(&resp, &mut out).unwrap();
        let (head, body) = split_response(&drain(&mut out));
        assert!(head.contains("Content-Length: 5\r\n"));
        assert!(body.is_empty());
    }

    #[test]
    fn error_mapping() {
        for (err, code) in [
            (ParseError::BadRequest, 400),
            (ParseError::PayloadTooLarge, 413),
            (ParseError::HostNotFound, 404),
            (ParseError::OutOfMemory, 500),
            (ParseError::Error, 500),
        ] {
            let resp = Response::from_error(&err);
            assert_eq!(resp.status, code);
            assert!(resp.close);
        }
    }

    #[test]
    fn write_queue_resumes_without_reemitting() {
        // A writer that takes 3 bytes then blocks.
        struct Choppy {
            taken: Vec<u8>,
            budget: usize,
        }
        impl Write for Choppy {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                if self.budget == 0 {
                    return Err(io::Error::from(io::ErrorKind::WouldBlock));
                }
                let n = buf.len().min(self.budget);
                self.budget -= n;
                self.taken.extend_from_slice(&buf[..n]);
                Ok(n)
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let mut q = WriteQueue::new();
        q.push(b"hello ".to_vec());
        q.push(b"world".to_vec());
        let mut w = Choppy {
            taken: Vec::new(),
            budget: 3,
        };
        assert_eq!(q.write_to(&mut w).unwrap(), WriteOutcome::Again);
        w.budget = 4;
        assert_eq!(q.write_to(&mut w).unwrap(), WriteOutcome::Again);
        w.budget = 100;
        assert_eq!(q.write_to(&mut w).unwrap(), WriteOutcome::Done);
        assert_eq!(w.taken, b"hello world");
        assert!(q.is_empty());
    }

    #[test]
    fn deflate_filter_block_loop_handles_large_input() {
        let mut f = DeflateFilter::new();
        let input = vec![42u8; 1 << 20]; // far larger than the 4k out buffer
        let mut out = Vec::new();
        f.transform(&input, true, &mut out).unwrap();
        let mut plain = Vec::new();
        ZlibDecoder::new(&out[..]).read_to_end(&mut plain).unwrap();
        assert_eq!(plain, input);
    }
}
