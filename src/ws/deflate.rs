//! Permessage-deflate (RFC 7692) streaming contexts.
//!
//! One inflate and one deflate context live for the whole connection; a
//! message is the unit of compression. Incoming payloads stream through the
//! inflater in bounded chunks as frames arrive (never buffered whole in
//! compressed form), with the `00 00 FF FF` trailer appended before the
//! final chunk of the final fragment. Outgoing messages are sync-flushed and
//! the trailer stripped. With `no_context_takeover` the context resets
//! between messages.

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use super::WsError;

/// RFC 7692 4-byte tail re-appended before inflating the final chunk.
const TRAILER: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

const BLOCK: usize = 4096;

pub struct Inflater {
    d: Decompress,
    no_context_takeover: bool,
}

impl Inflater {
    #[must_use]
    pub fn new(no_context_takeover: bool) -> Self {
        Self {
            // Raw deflate stream, no zlib header.
            d: Decompress::new(false),
            no_context_takeover,
        }
    }

    /// Inflate one chunk of a message, appending to `out`. Enforces `cap` on
    /// the decompressed size.
    pub fn feed(&mut self, chunk: &[u8], out: &mut Vec<u8>, cap: usize) -> Result<(), WsError> {
        let mut pos = 0;
        let mut buf = [0u8; BLOCK];
        loop {
            let before_in = self.d.total_in();
            let before_out = self.d.total_out();
            let status = self
                .d
                .decompress(&chunk[pos..], &mut buf, FlushDecompress::None)
                .map_err(|_| WsError::Inflate)?;
            let consumed = usize::try_from(self.d.total_in() - before_in).unwrap_or(0);
            let produced = usize::try_from(self.d.total_out() - before_out).unwrap_or(0);
            pos += consumed;
            if out.len() + produced > cap {
                return Err(WsError::PayloadTooLarge);
            }
            out.extend_from_slice(&buf[..produced]);
            match status {
                Status::StreamEnd => break,
                Status::Ok | Status::BufError => {
                    if consumed == 0 && produced == 0 {
                        break;
                    }
                    if pos >= chunk.len() && produced < buf.len() {
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// The final fragment of a message ended: append the trailer, flush out
    /// whatever remains, and reset the context if negotiated.
    pub fn finish_message(&mut self, out: &mut Vec<u8>, cap: usize) -> Result<(), WsError> {
        self.feed(&TRAILER, out, cap)?;
        if self.no_context_takeover {
            self.d.reset(false);
        }
        Ok(())
    }
}

pub struct Deflater {
    c: Compress,
    no_context_takeover: bool,
}

impl Deflater {
    #[must_use]
    pub fn new(no_context_takeover: bool) -> Self {
        Self {
            c: Compress::new(Compression::default(), false),
            no_context_takeover,
        }
    }

    /// Compress one whole outgoing message, stripping the sync-flush tail.
    pub fn compress_message(&mut self, payload: &[u8], out: &mut Vec<u8>) -> Result<(), WsError> {
        let start = out.len();
        let mut pos = 0;
        let mut buf = [0u8; BLOCK];
        // Swallow the payload.
        while pos < payload.len() {
            let before_in = self.c.total_in();
            let before_out = self.c.total_out();
            self.c
                .compress(&payload[pos..], &mut buf, FlushCompress::None)
                .map_err(|_| WsError::Inflate)?;
            let consumed = usize::try_from(self.c.total_in() - before_in).unwrap_or(0);
            let produced = usize::try_from(self.c.total_out() - before_out).unwrap_or(0);
            if consumed == 0 && produced == 0 {
                return Err(WsError::Inflate);
            }
            pos += consumed;
            out.extend_from_slice(&buf[..produced]);
        }
        // Sync flush until the compressor runs dry.
        loop {
            let before_out = self.c.total_out();
            self.c
                .compress(&[], &mut buf, FlushCompress::Sync)
                .map_err(|_| WsError::Inflate)?;
            let produced = usize::try_from(self.c.total_out() - before_out).unwrap_or(0);
            if produced == 0 {
                break;
            }
            out.extend_from_slice(&buf[..produced]);
        }
        // RFC 7692: the frame payload omits the trailing 00 00 FF FF.
        if out[start..].ends_with(&TRAILER) {
            out.truncate(out.len() - TRAILER.len());
        } else {
            return Err(WsError::Inflate);
        }
        if self.no_context_takeover {
            self.c.reset();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(no_context_takeover: bool, messages: &[&[u8]]) {
        let mut deflater = Deflater::new(no_context_takeover);
        let mut inflater = Inflater::new(no_context_takeover);
        for msg in messages {
            let mut compressed = Vec::new();
            deflater.compress_message(msg, &mut compressed).unwrap();
            let mut plain = Vec::new();
            inflater.feed(&compressed, &mut plain, 1 << 24).unwrap();
            inflater.finish_message(&mut plain, 1 << 24).unwrap();
            assert_eq!(&plain, msg);
        }
    }

    #[test]
    fn round_trips_with_shared_context() {
        round_trip(
            false,
            &[b"hello websocket", b"hello websocket", &[7u8; 100_000]],
        );
    }

    #[test]
    fn round_trips_with_context_reset() {
        round_trip(true, &[b"first message", b"second message", b""]);
    }

    #[test]
    fn inflate_streams_in_bounded_chunks() {
        let payload = b"the same bytes over and over ".repeat(1000);
        let mut deflater = Deflater::new(false);
        let mut compressed = Vec::new();
        deflater.compress_message(&payload, &mut compressed).unwrap();

        // Feed the compressed stream a few bytes at a time, as fragments
        // would arrive.
        let mut inflater = Inflater::new(false);
        let mut plain = Vec::new();
        for chunk in compressed.chunks(7) {
            inflater.feed(chunk, &mut plain, 1 << 24).unwrap();
        }
        inflater.finish_message(&mut plain, 1 << 24).unwrap();
        assert_eq!(plain, payload);
    }

    #[test]
    fn decompressed_cap_enforced() {
        let payload = vec![0u8; 1 << 20]; // compresses tiny, inflates huge
        let mut deflater = Deflater::new(false);
        let mut compressed = Vec::new();
        deflater.compress_message(&payload, &mut compressed).unwrap();

        let mut inflater = Inflater::new(false);
        let mut plain = Vec::new();
        let mut hit_cap = false;
        for chunk in compressed.chunks(64) {
            match inflater.feed(chunk, &mut plain, 1024) {
                Err(WsError::PayloadTooLarge) => {
                    hit_cap = true;
                    break;
                }
                Ok(()) => {}
                Err(e) => panic!("unexpected error {e}"),
            }
        }
        if !hit_cap {
            assert!(matches!(
                inflater.finish_message(&mut plain, 1024),
                Err(WsError::PayloadTooLarge)
            ));
        }
    }
}
