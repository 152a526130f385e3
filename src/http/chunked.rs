//! Chunked transfer-encoding framing.
//!
//! Wire format: `<hex-length>CRLF<data>CRLF`, terminated by `0CRLF CRLF`.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChunkedError {
    #[error("bad chunk size line")]
    BadSize,
    #[error("missing CRLF after chunk data")]
    BadFraming,
    #[error("data after final chunk")]
    TrailingData,
}

/// Append one length-prefixed chunk to `out`. Zero-length input emits
/// nothing; the terminator is a separate call.
pub fn encode_chunk(data: &[u8], out: &mut Vec<u8>) {
    if data.is_empty() {
        return;
    }
    out.extend_from_slice(format!("{:x}\r\n", data.len()).as_bytes());
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
}

/// Append the zero-length terminating chunk.
pub fn encode_final(out: &mut Vec<u8>) {
    out.extend_from_slice(b"0\r\n\r\n");
}

#[derive(Debug)]
enum DecodeState {
    Size { value: u64, digits: usize },
    SizeLf { value: u64 },
    Data { remaining: u64 },
    DataCr,
    DataLf,
    // After the zero chunk: trailer lines until an empty one.
    Trailer { line_len: usize },
    TrailerLf { line_len: usize },
    Done,
}

/// Incremental chunked-body decoder. Feed arbitrary slices; decoded payload
/// bytes are appended to the caller's output.
#[derive(Debug)]
pub struct ChunkedDecoder {
    state: DecodeState,
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkedDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: DecodeState::Size {
                value: 0,
                digits: 0,
            },
        }
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        matches!(self.state, DecodeState::Done)
    }

    /// Consume `input`, appending decoded bytes to `out`.
    ///
    /// Returns the number of bytes consumed; short only when the terminator
    /// was reached mid-buffer.
    pub fn feed(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<usize, ChunkedError> {
        let mut pos = 0;
        while pos < input.len() {
            let b = input[pos];
            match self.state {
                DecodeState::Size {
                    mut value,
                    mut digits,
                } => {
                    match b {
                        b'0'..=b'9' | b'a'..=b'f' | b'A'..=b'F' => {
                            let d = u64::from(char::from(b).to_digit(16).unwrap_or(0));
                            value = value
                                .checked_mul(16)
                                .and_then(|v| v.checked_add(d))
                                .ok_or(ChunkedError::BadSize)?;
                            digits += 1;
                            self.state = DecodeState::Size { value, digits };
                        }
                        b'\r' if digits > 0 => {
                            self.state = DecodeState::SizeLf { value };
                        }
                        _ => return Err(ChunkedError::BadSize),
                    }
                    pos += 1;
                }
                DecodeState::SizeLf { value } => {
                    if b != b'\n' {
                        return Err(ChunkedError::BadSize);
                    }
                    pos += 1;
                    self.state = if value == 0 {
                        DecodeState::Trailer { line_len: 0 }
                    } else {
                        DecodeState::Data { remaining: value }
                    };
                }
                DecodeState::Data { remaining } => {
                    let take = usize::try_from(remaining)
                        .unwrap_or(usize::MAX)
                        .min(input.len() - pos);
                    out.extend_from_slice(&input[pos..pos + take]);
                    pos += take;
                    let remaining = remaining - take as u64;
                    self.state = if remaining == 0 {
                        DecodeState::DataCr
                    } else {
                        DecodeState::Data { remaining }
                    };
                }
                DecodeState::DataCr => {
                    if b != b'\r' {
                        return Err(ChunkedError::BadFraming);
                    }
                    pos += 1;
                    self.state = DecodeState::DataLf;
                }
                DecodeState::DataLf => {
                    if b != b'\n' {
                        return Err(ChunkedError::BadFraming);
                    }
                    pos += 1;
                    self.state = DecodeState::Size {
                        value: 0,
                        digits: 0,
                    };
                }
                DecodeState::Trailer { line_len } => {
                    if b == b'\r' {
                        self.state = DecodeState::TrailerLf { line_len };
                    } else {
                        self.state = DecodeState::Trailer {
                            line_len: line_len + 1,
                        };
                    }
                    pos += 1;
                }
                DecodeState::TrailerLf { line_len } => {
                    if b != b'\n' {
                        return Err(ChunkedError::BadFraming);
                    }
                    pos += 1;
                    if line_len == 0 {
                        self.state = DecodeState::Done;
                        return Ok(pos);
                    }
                    self.state = DecodeState::Trailer { line_len: 0 };
                }
                DecodeState::Done => return Err(ChunkedError::TrailingData),
            }
        }
        Ok(pos)
    }
}
