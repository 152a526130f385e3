//! HTTP/1.x request parsing and response writing.

pub mod chunked;
pub mod parser;
pub mod range;
pub mod request;
pub mod response;

use thiserror::Error;

/// Terminal parser faults. Everything here maps to a fixed status code and
/// closes the connection after the response; would-block conditions are not
/// errors and never appear here.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    /// Malformed request line, header, or framing. 400.
    #[error("bad request")]
    BadRequest,
    /// Internal buffer/arena limit exceeded. 500.
    #[error("out of memory")]
    OutOfMemory,
    /// Body larger than `client_max_body_size`. 413.
    #[error("payload too large")]
    PayloadTooLarge,
    /// Host header (or SNI name) matched no configured virtual host. 404.
    #[error("host not found")]
    HostNotFound,
    /// Generic I/O or protocol fault. 500, or immediate close if headers
    /// already went out.
    #[error("protocol error")]
    Error,
}

impl ParseError {
    /// Status code for the terminal response.
    #[must_use]
    pub fn status(&self) -> u16 {
        match self {
            Self::BadRequest => 400,
            Self::PayloadTooLarge => 413,
            Self::HostNotFound => 404,
            Self::OutOfMemory | Self::Error => 500,
        }
    }
}

/// Request methods the engine recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Options,
    Patch,
}

impl Method {
    pub(crate) fn from_token(token: &str) -> Option<Self> {
        Some(match token {
            "GET" => Self::Get,
            "HEAD" => Self::Head,
            "POST" => Self::Post,
            "PUT" => Self::Put,
            "DELETE" => Self::Delete,
            "OPTIONS" => Self::Options,
            "PATCH" => Self::Patch,
            _ => return None,
        })
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Head => "HEAD",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Options => "OPTIONS",
            Self::Patch => "PATCH",
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
