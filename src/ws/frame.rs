//! RFC 6455 frame parsing and writing.
//!
//! The parser is a per-connection state machine over the worker's read
//! buffer: first byte (fin/rsv/opcode), second byte (mask bit + length
//! class), extended length (0, 2 or 8 bytes, network order), 4-byte mask
//! key, payload. Control frames are unmasked inline into a small dedicated
//! buffer; data frames stream through unmasking (and inflate, when the
//! message is compressed) into the message accumulator.

use arrayvec::ArrayVec;
use tracing::trace;

use super::deflate::Inflater;
use super::WsError;

/// Frame opcode (4 bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl Opcode {
    #[must_use]
    pub const fn is_control(self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }

    fn from_bits(value: u8) -> Result<Self, WsError> {
        Ok(match value {
            0x0 => Self::Continuation,
            0x1 => Self::Text,
            0x2 => Self::Binary,
            0x8 => Self::Close,
            0x9 => Self::Ping,
            0xA => Self::Pong,
            other => return Err(WsError::InvalidOpcode(other)),
        })
    }
}

/// A complete data message delivered to the application.
#[derive(Debug, PartialEq, Eq)]
pub struct WsMessage {
    /// Text or Binary.
    pub opcode: Opcode,
    /// Reassembled (and inflated, if compressed) payload.
    pub payload: Vec<u8>,
}

/// Parser output, in frame-arrival order. Control frames may appear between
/// the fragments of a message.
#[derive(Debug, PartialEq, Eq)]
pub enum WsEvent {
    Message(WsMessage),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close { code: Option<u16>, reason: Vec<u8> },
}

#[derive(Debug, Clone, Copy)]
enum State {
    First,
    Second,
    ExtLen { need: u8, have: u8, value: u64 },
    MaskKey { have: u8 },
    Payload { remaining: u64, mask_offset: usize },
}

/// Header fields of the frame currently being decoded.
#[derive(Debug, Clone, Copy, Default)]
struct FrameHead {
    fin: bool,
    rsv1: bool,
    opcode: u8,
    masked: bool,
    mask: [u8; 4],
}

pub struct FrameParser {
    state: State,
    head: FrameHead,
    /// permessage-deflate was negotiated during the upgrade.
    deflate: bool,
    /// Cap on a reassembled (post-inflate) message.
    max_message: usize,

    // Control frame payloads are tiny and never fragmented; they bypass the
    // streaming path entirely.
    control: ArrayVec<u8, 125>,

    // In-progress data message, accumulated across fragments.
    msg_opcode: Option<Opcode>,
    msg_compressed: bool,
    fragmented: bool,
    msg: Vec<u8>,
    inflater: Option<Inflater>,

    // Decoded payload length, carried between the length states and MaskKey.
    pending_len: u64,
}

impl FrameParser {
    #[must_use]
    pub fn new(deflate: bool, no_context_takeover: bool, max_message: usize) -> Self {
        Self {
            state: State::First,
            head: FrameHead::default(),
            deflate,
            max_message,
            control: ArrayVec::new(),
            msg_opcode: None,
            msg_compressed: false,
            fragmented: false,
            msg: Vec::new(),
            inflater: deflate.then(|| Inflater::new(no_context_takeover)),
            pending_len: 0,
        }
    }

    /// A fragmented message is in flight; the connection must not be reset
    /// for reuse until it completes.
    #[must_use]
    pub fn mid_message(&self) -> bool {
        self.fragmented
    }

    /// Feed bytes, appending completed events in arrival order.
    ///
    /// Any error is a protocol violation: the caller closes the connection
    /// (best-effort close frame first) without a response.
    pub fn feed(&mut self, input: &[u8], events: &mut Vec<WsEvent>) -> Result<(), WsError> {
        let mut pos = 0;
        while pos < input.len() {
            match self.state {
                State::First => {
                    let b = input[pos];
                    pos += 1;
                    self.head.fin = b & 0x80 != 0;
                    self.head.rsv1 = b & 0x40 != 0;
                    if b & 0x30 != 0 {
                        // rsv2/rsv3 have no negotiated meaning, ever.
                        return Err(WsError::ReservedBits);
                    }
                    self.head.opcode = b & 0x0f;
                    let opcode = Opcode::from_bits(self.head.opcode)?;
                    if self.head.rsv1 {
                        // RSV1 marks the first frame of a compressed message,
                        // nothing else.
                        if !self.deflate
                            || opcode.is_control()
                            || opcode == Opcode::Continuation
                        {
                            return Err(WsError::ReservedBits);
                        }
                    }
                    if opcode.is_control() && !self.head.fin {
                        return Err(WsError::FragmentedControl);
                    }
                    self.state = State::Second;
                }
                State::Second => {
                    let b = input[pos];
                    pos += 1;
                    self.head.masked = b & 0x80 != 0;
                    // Frames from the client must be masked.
                    if !self.head.masked {
                        return Err(WsError::UnmaskedFrame);
                    }
                    let len7 = b & 0x7f;
                    let opcode = Opcode::from_bits(self.head.opcode)?;
                    if opcode.is_control() && len7 > 125 {
                        return Err(WsError::ControlTooLarge);
                    }
                    match len7 {
                        126 => {
                            self.state = State::ExtLen {
                                need: 2,
                                have: 0,
                                value: 0,
                            }
                        }
                        127 => {
                            self.state = State::ExtLen {
                                need: 8,
                                have: 0,
                                value: 0,
                            }
                        }
                        n => self.start_payload(u64::from(n))?,
                    }
                }
                State::ExtLen {
                    need,
                    mut have,
                    mut value,
                } => {
                    value = (value << 8) | u64::from(input[pos]);
                    pos += 1;
                    have += 1;
                    if have == need {
                        self.start_payload(value)?;
                    } else {
                        self.state = State::ExtLen { need, have, value };
                    }
                }
                State::MaskKey { mut have } => {
                    self.head.mask[usize::from(have)] = input[pos];
                    pos += 1;
                    have += 1;
                    if have == 4 {
                        self.state = State::Payload {
                            remaining: self.pending_len,
                            mask_offset: 0,
                        };
                        // Zero-length frames complete immediately.
                        if self.pending_len == 0 {
                            self.frame_done(events)?;
                        }
                    } else {
                        self.state = State::MaskKey { have };
                    }
                }
                State::Payload {
                    remaining,
                    mask_offset,
                } => {
                    let take = usize::try_from(remaining)
                        .unwrap_or(usize::MAX)
                        .min(input.len() - pos);
                    let mut chunk = input[pos..pos + take].to_vec();
                    for (i, byte) in chunk.iter_mut().enumerate() {
                        *byte ^= self.head.mask[(mask_offset + i) % 4];
                    }
                    pos += take;
                    self.payload_chunk(&chunk)?;
                    let remaining = remaining - take as u64;
                    if remaining == 0 {
                        self.frame_done(events)?;
                    } else {
                        self.state = State::Payload {
                            remaining,
                            mask_offset: (mask_offset + take) % 4,
                        };
                    }
                }
            }
        }
        Ok(())
    }

    fn start_payload(&mut self, len: u64) -> Result<(), WsError> {
        let opcode = Opcode::from_bits(self.head.opcode)?;
        if !opcode.is_control() {
            // Account for fragments already received before accepting more.
            let already = self.msg.len() as u64;
            if already.saturating_add(len) > self.max_message as u64 {
                return Err(WsError::PayloadTooLarge);
            }
            match opcode {
                Opcode::Continuation => {
                    if self.msg_opcode.is_none() {
                        return Err(WsError::BadContinuation);
                    }
                }
                _ => {
                    if self.msg_opcode.is_some() {
                        // A new data frame may not start mid-message.
                        return Err(WsError::BadContinuation);
                    }
                    self.msg_opcode = Some(opcode);
                    self.msg_compressed = self.head.rsv1;
                }
            }
            self.fragmented = !self.head.fin;
        } else {
            self.control.clear();
        }
        self.pending_len = len;
        self.state = State::MaskKey { have: 0 };
        Ok(())
    }

    fn payload_chunk(&mut self, chunk: &[u8]) -> Result<(), WsError> {
        let opcode = Opcode::from_bits(self.head.opcode)?;
        if opcode.is_control() {
            self.control
                .try_extend_from_slice(chunk)
                .map_err(|_| WsError::ControlTooLarge)?;
            return Ok(());
        }
        if self.msg_compressed {
            let inflater = self.inflater.as_mut().ok_or(WsError::Inflate)?;
            inflater.feed(chunk, &mut self.msg, self.max_message)?;
        } else {
            if self.msg.len() + chunk.len() > self.max_message {
                return Err(WsError::PayloadTooLarge);
            }
            self.msg.extend_from_slice(chunk);
        }
        Ok(())
    }

    fn frame_done(&mut self, events: &mut Vec<WsEvent>) -> Result<(), WsError> {
        let opcode = Opcode::from_bits(self.head.opcode)?;
        trace!("Frame done: {opcode:?} fin={}", self.head.fin);
        if opcode.is_control() {
            let payload: Vec<u8> = self.control.drain(..).collect();
            events.push(match opcode {
                Opcode::Ping => WsEvent::Ping(payload),
                Opcode::Pong => WsEvent::Pong(payload),
                Opcode::Close => {
                    if payload.len() == 1 {
                        return Err(WsError::BadClosePayload);
                    }
                    let code = (payload.len() >= 2)
                        .then(|| u16::from_be_bytes([payload[0], payload[1]]));
                    WsEvent::Close {
                        code,
                        reason: payload.get(2..).map(<[u8]>::to_vec).unwrap_or_default(),
                    }
                }
                _ => unreachable!(),
            });
        } else if self.head.fin {
            if self.msg_compressed {
                // RFC 7692: the deflate stream of a message is terminated by
                // appending the 00 00 FF FF trailer before the final chunk.
                let inflater = self.inflater.as_mut().ok_or(WsError::Inflate)?;
                inflater.finish_message(&mut self.msg, self.max_message)?;
            }
            let opcode = self.msg_opcode.take().expect("message opcode set");
            events.push(WsEvent::Message(WsMessage {
                opcode,
                payload: std::mem::take(&mut self.msg),
            }));
            self.msg_compressed = false;
            self.fragmented = false;
        }
        self.state = State::First;
        Ok(())
    }
}

/// Write one unmasked server frame.
pub fn encode_frame(fin: bool, rsv1: bool, opcode: Opcode, payload: &[u8], out: &mut Vec<u8>) {
    let mut b0 = opcode as u8;
    if fin {
        b0 |= 0x80;
    }
    if rsv1 {
        b0 |= 0x40;
    }
    out.push(b0);
    match payload.len() {
        n if n <= 125 => out.push(n as u8),
        n if n <= 0xffff => {
            out.push(126);
            out.extend_from_slice(&(n as u16).to_be_bytes());
        }
        n => {
            out.push(127);
            out.extend_from_slice(&(n as u64).to_be_bytes());
        }
    }
    out.extend_from_slice(payload);
}

/// Write a close frame with an optional status code.
pub fn encode_close(code: Option<u16>, reason: &[u8], out: &mut Vec<u8>) {
    let mut payload = Vec::with_capacity(2 + reason.len());
    if let Some(code) = code {
        payload.extend_from_slice(&code.to_be_bytes());
        payload.extend_from_slice(reason);
    }
    encode_frame(true, false, Opcode::Close, &payload, out);
}
