//! TLS session plumbing over rustls.
//!
//! The handshake is a step function driven by readiness events: each step
//! reports done / retry-on-read / retry-on-write / fail. After the handshake
//! the session pumps plaintext both ways, with would-block surfacing exactly
//! like a plain socket so the connection code does not care which it has.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;

use tracing::{debug, trace};

/// Handshake progress report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStep {
    Done,
    WantRead,
    WantWrite,
    Failed,
}

pub struct TlsSession {
    conn: rustls::ServerConnection,
}

impl TlsSession {
    pub fn new(config: Arc<rustls::ServerConfig>) -> anyhow::Result<Self> {
        Ok(Self {
            conn: rustls::ServerConnection::new(config)?,
        })
    }

    /// SNI name the client sent, available once the handshake finished.
    #[must_use]
    pub fn server_name(&self) -> Option<&str> {
        self.conn.server_name()
    }

    #[must_use]
    pub fn is_handshaking(&self) -> bool {
        self.conn.is_handshaking()
    }

    /// Drive the handshake as far as the socket allows.
    pub fn step(&mut self, sock: &mut TcpStream) -> HandshakeStep {
        loop {
            // Flush whatever rustls wants on the wire first.
            while self.conn.wants_write() {
                match self.conn.write_tls(sock) {
                    Ok(_) => {}
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        return HandshakeStep::WantWrite
                    }
                    Err(e) => {
                        debug!("TLS write during handshake: {e}");
                        return HandshakeStep::Failed;
                    }
                }
            }
            if !self.conn.is_handshaking() {
                return HandshakeStep::Done;
            }
            match self.conn.read_tls(sock) {
                Ok(0) => {
                    trace!("EOF during TLS handshake");
                    return HandshakeStep::Failed;
                }
                Ok(n) => {
                    trace!("Got {n} bytes of handshake data");
                    if let Err(e) = self.conn.process_new_packets() {
                        debug!("TLS handshake: {e}");
                        // Send the alert if one is pending, then give up.
                        let _ = self.conn.write_tls(sock);
                        return HandshakeStep::Failed;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return HandshakeStep::WantRead,
                Err(e) => {
                    debug!("TLS read during handshake: {e}");
                    return HandshakeStep::Failed;
                }
            }
        }
    }

    /// Read decrypted application bytes. `Ok(0)` is a clean close;
    /// `WouldBlock` means no more records are available yet.
    pub fn read_app(&mut self, sock: &mut TcpStream, out: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.conn.reader().read(out) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }
            match self.conn.read_tls(sock) {
                Ok(0) => return Ok(0),
                Ok(_) => {
                    self.conn
                        .process_new_packets()
                        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                }
                Err(e) => return Err(e), // WouldBlock propagates
            }
        }
    }

    /// Hand plaintext to rustls for encryption. Buffered; `flush` moves it
    /// to the socket.
    pub fn queue_plaintext(&mut self, data: &[u8]) -> io::Result<()> {
        self.conn.writer().write_all(data)
    }

    /// True while encrypted records are waiting for a writable socket.
    #[must_use]
    pub fn wants_write(&self) -> bool {
        self.conn.wants_write()
    }

    /// Push pending records at the socket. Returns false on would-block.
    pub fn flush(&mut self, sock: &mut TcpStream) -> io::Result<bool> {
        while self.conn.wants_write() {
            match self.conn.write_tls(sock) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    /// Teardown order matters: queue the close_notify alert and push it out
    /// best-effort before the socket closes.
    pub fn shutdown(&mut self, sock: &mut TcpStream) {
        self.conn.send_close_notify();
        let _ = self.flush(sock);
    }
}
