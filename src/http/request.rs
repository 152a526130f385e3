//! The parsed request and its (possibly spooled) payload.

use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use super::range::RangeSpec;
use super::{Method, ParseError};

/// Payload bytes stay inline up to this size, then spill to a spool file.
pub const INLINE_BODY_MAX: usize = 16 * 1024;

/// Request payload storage.
#[derive(Debug)]
pub enum Body {
    Empty,
    Inline(Vec<u8>),
    /// Spooled to an unlinked temp file in the configured directory.
    Spooled { file: std::fs::File, len: u64 },
}

impl Body {
    #[must_use]
    pub fn len(&self) -> u64 {
        match self {
            Self::Empty => 0,
            Self::Inline(v) => v.len() as u64,
            Self::Spooled { len, .. } => *len,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read the whole payload back. Rewinds the spool file first.
    pub fn read_to_vec(&mut self) -> std::io::Result<Vec<u8>> {
        match self {
            Self::Empty => Ok(Vec::new()),
            Self::Inline(v) => Ok(v.clone()),
            Self::Spooled { file, len } => {
                file.seek(SeekFrom::Start(0))?;
                let mut out = Vec::with_capacity(usize::try_from(*len).unwrap_or(0));
                file.read_to_end(&mut out)?;
                Ok(out)
            }
        }
    }
}

/// Streaming body accumulator enforcing `client_max_body_size`.
///
/// Bytes stay inline until [`INLINE_BODY_MAX`], then everything spills into a
/// temp file that the OS unlinks on drop, so teardown needs no cleanup path.
/// Never writes past the cap: an oversized push stores only the allowed
/// prefix before failing.
#[derive(Debug)]
pub struct BodySink {
    cap: u64,
    tmp_dir: PathBuf,
    body: Body,
}

impl BodySink {
    #[must_use]
    pub fn new(cap: u64, tmp_dir: &Path) -> Self {
        Self {
            cap,
            tmp_dir: tmp_dir.to_path_buf(),
            body: Body::Empty,
        }
    }

    pub fn push(&mut self, data: &[u8]) -> Result<(), ParseError> {
        let len = self.body.len();
        let allowed = usize::try_from(self.cap.saturating_sub(len)).unwrap_or(usize::MAX);
        let (store, overflow) = if data.len() > allowed {
            (&data[..allowed], true)
        } else {
            (data, false)
        };
        self.store(store)?;
        if overflow {
            debug!("Request body exceeds cap of {} bytes", self.cap);
            return Err(ParseError::PayloadTooLarge);
        }
        Ok(())
    }

    fn store(&mut self, data: &[u8]) -> Result<(), ParseError> {
        if data.is_empty() {
            return Ok(());
        }
        match &mut self.body {
            Body::Empty => {
                self.body = Body::Inline(Vec::new());
                return self.store(data);
            }
            Body::Inline(v) if v.len() + data.len() <= INLINE_BODY_MAX => {
                v.extend_from_slice(data);
            }
            Body::Inline(v) => {
                // Crossing the inline threshold: spill what we have plus the
                // new bytes into a fresh spool file.
                let mut file =
                    tempfile::tempfile_in(&self.tmp_dir).map_err(|_| ParseError::Error)?;
                file.write_all(v).map_err(|_| ParseError::Error)?;
                file.write_all(data).map_err(|_| ParseError::Error)?;
                let len = (v.len() + data.len()) as u64;
                self.body = Body::Spooled { file, len };
            }
            Body::Spooled { file, len } => {
                file.write_all(data).map_err(|_| ParseError::Error)?;
                *len += data.len() as u64;
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn finish(self) -> Body {
        self.body
    }

    #[must_use]
    pub fn len(&self) -> u64 {
        self.body.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }
}

/// One parsed HTTP request, owned by its connection for the duration of the
/// exchange, then moved into the deferred work item.
#[derive(Debug)]
pub struct Request {
    pub method: Method,
    /// URL-decoded path, query and fragment stripped.
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub cookies: Vec<(String, String)>,
    pub ranges: Option<Vec<RangeSpec>>,
    /// HTTP/1.1, as opposed to 1.0.
    pub http11: bool,
    pub keep_alive: bool,
    /// Virtual host resolved from SNI or the Host header.
    pub vhost: usize,
    pub body: Body,
    /// Client accepts deflate/gzip response encoding.
    pub accept_deflate: bool,
    pub accept_gzip: bool,
    /// `Upgrade: websocket` with its key, if the client asked for one.
    pub upgrade_websocket: bool,
    pub ws_key: Option<String>,
    pub ws_extensions: Option<String>,
}

impl Request {
    /// First header value matching `name`, case-insensitive.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// First query parameter named `name`.
    #[must_use]
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    #[must_use]
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}
