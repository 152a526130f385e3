//! WebSocket support: upgrade handshake, frame state machine, and
//! permessage-deflate.

pub mod deflate;
pub mod frame;

use base64::Engine;
use sha1::{Digest, Sha1};
use thiserror::Error;
use tracing::debug;

use crate::http::request::Request;

/// Protocol violations. All of them close the connection without an HTTP
/// response; a close frame is attempted best-effort.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WsError {
    #[error("invalid opcode 0x{0:X}")]
    InvalidOpcode(u8),
    #[error("reserved bits set without negotiated extension")]
    ReservedBits,
    #[error("fragmented control frame")]
    FragmentedControl,
    #[error("control frame payload over 125 bytes")]
    ControlTooLarge,
    #[error("client frame not masked")]
    UnmaskedFrame,
    #[error("continuation without a message in progress")]
    BadContinuation,
    #[error("close frame with a one-byte payload")]
    BadClosePayload,
    #[error("message exceeds the configured size cap")]
    PayloadTooLarge,
    #[error("deflate stream error")]
    Inflate,
}

const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// `Sec-WebSocket-Accept` token for a client key.
#[must_use]
pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// Negotiated permessage-deflate parameters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeflateParams {
    pub client_no_context_takeover: bool,
    pub server_no_context_takeover: bool,
}

/// Pick the first acceptable `permessage-deflate` offer, if any.
///
/// Offers carrying parameters we cannot honor are skipped rather than
/// failing the upgrade; compression is optional.
#[must_use]
pub fn negotiate_deflate(extensions: Option<&str>) -> Option<DeflateParams> {
    let header = extensions?;
    'offer: for offer in header.split(',') {
        let mut parts = offer.split(';').map(str::trim);
        if parts.next() != Some("permessage-deflate") {
            continue;
        }
        let mut params = DeflateParams::default();
        for param in parts {
            let (name, value) = param
                .split_once('=')
                .map_or((param, None), |(n, v)| (n.trim(), Some(v.trim().trim_matches('"'))));
            match name {
                "client_no_context_takeover" => params.client_no_context_takeover = true,
                "server_no_context_takeover" => params.server_no_context_takeover = true,
                // We only speak the default 15-bit window.
                "client_max_window_bits" if matches!(value, None | Some("15")) => {}
                "server_max_window_bits" if value == Some("15") => {}
                other => {
                    debug!("Declining permessage-deflate offer with {other:?}");
                    continue 'offer;
                }
            }
        }
        return Some(params);
    }
    None
}

/// Build the 101 upgrade response for a websocket request, written raw (it
/// goes out before the protocol state switches, bypassing the HTTP filter
/// chain).
///
/// None when the request is not a well-formed upgrade.
#[must_use]
pub fn upgrade_response(req: &Request) -> Option<(Vec<u8>, Option<DeflateParams>)> {
    if !req.upgrade_websocket {
        return None;
    }
    let key = req.ws_key.as_deref()?;
    // The key must be base64 for 16 random bytes.
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(key)
        .ok()?;
    if decoded.len() != 16 {
        return None;
    }
    let params = negotiate_deflate(req.ws_extensions.as_deref());

    let mut out = format!(
        "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {}\r\n",
        accept_key(key)
    );
    if let Some(p) = params {
        out.push_str("Sec-WebSocket-Extensions: permessage-deflate");
        if p.client_no_context_takeover {
            out.push_str("; client_no_context_takeover");
        }
        if p.server_no_context_takeover {
            out.push_str("; server_no_context_takeover");
        }
        out.push_str("\r\n");
    }
    out.push_str("\r\n");
    Some((out.into_bytes(), params))
}
