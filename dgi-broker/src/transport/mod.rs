//! Outbound datagram transport.
//!
//! Sessions never touch sockets. A [`PeerConnection`] encodes each protocol
//! window and hands the bytes to a [`DatagramSink`]. Writes are non-blocking
//! and a failed write is one lost datagram: the caller logs it and the next
//! resend pass retries.
//!
//! | Sink | Used for |
//! |---|---|
//! | [`UdpTransport`] | production, wraps the shared `tokio::net::UdpSocket` |
//! | [`LossyTransport`] | link-loss emulation when `reliability < 100` |
//!
//! [`PeerConnection`]: crate::connection::PeerConnection

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use prost::Message;
use thiserror::Error;
use tokio::net::UdpSocket;
use tracing::trace;

use crate::wire::{ProtocolWindow, MAX_DATAGRAM_SIZE};

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("socket I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("encoded window is {size} bytes, limit is {limit}")]
    Oversize { size: usize, limit: usize },

    #[error("datagram could not be decoded: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("datagram dropped by link emulation")]
    Emulated,
}

// ── DatagramSink ──────────────────────────────────────────────────────────────

/// Non-blocking datagram writer.
pub trait DatagramSink: Send + Sync {
    fn send_to(&self, datagram: &[u8], dest: SocketAddr) -> Result<(), TransportError>;
}

/// Encodes `window` and checks it against [`MAX_DATAGRAM_SIZE`].
pub fn encode_window(window: &ProtocolWindow) -> Result<Vec<u8>, TransportError> {
    let size = window.encoded_len();
    if size > MAX_DATAGRAM_SIZE {
        return Err(TransportError::Oversize {
            size,
            limit: MAX_DATAGRAM_SIZE,
        });
    }
    Ok(window.encode_to_vec())
}

pub fn decode_window(datagram: &[u8]) -> Result<ProtocolWindow, TransportError> {
    Ok(ProtocolWindow::decode(datagram)?)
}

// ── UdpTransport ──────────────────────────────────────────────────────────────

/// Writes through a shared UDP socket with `try_send_to`.
#[derive(Debug, Clone)]
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
}

impl UdpTransport {
    pub fn new(socket: Arc<UdpSocket>) -> Self {
        Self { socket }
    }

    pub fn socket(&self) -> &Arc<UdpSocket> {
        &self.socket
    }
}

impl DatagramSink for UdpTransport {
    fn send_to(&self, datagram: &[u8], dest: SocketAddr) -> Result<(), TransportError> {
        let sent = self.socket.try_send_to(datagram, dest)?;
        trace!(bytes = sent, dest = %dest, "datagram sent");
        Ok(())
    }
}

// ── LossyTransport ────────────────────────────────────────────────────────────

/// Drops each outbound datagram with probability `1 - reliability / 100`.
pub struct LossyTransport<S> {
    inner: S,
    reliability: u8,
}

impl<S: DatagramSink> LossyTransport<S> {
    /// `reliability` is the percentage of datagrams delivered, clamped to 100.
    pub fn new(inner: S, reliability: u8) -> Self {
        Self {
            inner,
            reliability: reliability.min(100),
        }
    }
}

impl<S: DatagramSink> DatagramSink for LossyTransport<S> {
    fn send_to(&self, datagram: &[u8], dest: SocketAddr) -> Result<(), TransportError> {
        if fastrand::u8(0..100) >= self.reliability {
            return Err(TransportError::Emulated);
        }
        self.inner.send_to(datagram, dest)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
