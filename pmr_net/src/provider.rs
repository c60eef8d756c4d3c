//! The socket provider contract and the standard (plain TCP/UDP) provider.
//!
//! Providers register by name with the socket service. The standard provider
//! maps operations directly onto OS calls through the socket's raw helpers;
//! TLS providers wrap those helpers with record-layer processing and register
//! alongside it.

use crate::error::Result;
use crate::socket::{Socket, SocketFlags};
use crate::ssl::SslConfig;
use std::sync::Arc;

/// Operations a socket dispatches through its provider.
pub trait SocketProvider: Send + Sync {
    /// Registry name of this provider.
    fn name(&self) -> &'static str;

    /// Opens a listening socket.
    ///
    /// # Errors
    ///
    /// Resolution, bind and listen failures.
    fn listen(
        &self,
        sock: &Socket,
        ip: Option<&str>,
        port: u16,
        flags: SocketFlags,
    ) -> Result<()>;

    /// Wraps an open socket with this provider's session state and performs
    /// the handshake per the socket's blocking mode.
    ///
    /// # Errors
    ///
    /// Configuration compilation and immediate handshake failures.
    fn upgrade(
        &self,
        sock: &Socket,
        ssl: Arc<SslConfig>,
        peer_name: Option<&str>,
    ) -> Result<()>;

    /// Closes the socket, optionally gracefully.
    fn close(&self, sock: &Socket, graceful: bool);

    /// Forceful abort.
    fn disconnect(&self, sock: &Socket);

    /// Reads application data. Negative-result convention; `0` means retry.
    fn read(&self, sock: &Socket, buf: &mut [u8]) -> isize;

    /// Writes application data. Negative-result convention; `0` means retry.
    fn write(&self, sock: &Socket, buf: &[u8]) -> isize;

    /// Flushes buffered output. After a successful flush no provider-level
    /// buffered write remains.
    fn flush(&self, sock: &Socket) -> isize;

    /// Describes the connection (`PROVIDER=...,CIPHER=...` for TLS).
    fn state(&self, sock: &Socket) -> String;
}

/// The standard provider: plain OS socket semantics, no security layer.
pub struct StandardProvider;

impl SocketProvider for StandardProvider {
    fn name(&self) -> &'static str {
        "standard"
    }

    fn listen(
        &self,
        sock: &Socket,
        ip: Option<&str>,
        port: u16,
        flags: SocketFlags,
    ) -> Result<()> {
        sock.std_listen(ip, port, flags)
    }

    fn upgrade(
        &self,
        _sock: &Socket,
        _ssl: Arc<SslConfig>,
        _peer_name: Option<&str>,
    ) -> Result<()> {
        Err(crate::error::Error::CantInitialize(
            "standard provider cannot upgrade to TLS".to_string(),
        ))
    }

    fn close(&self, sock: &Socket, graceful: bool) {
        sock.std_close(graceful);
    }

    fn disconnect(&self, sock: &Socket) {
        sock.std_disconnect();
    }

    fn read(&self, sock: &Socket, buf: &mut [u8]) -> isize {
        sock.std_read(buf)
    }

    fn write(&self, sock: &Socket, buf: &[u8]) -> isize {
        sock.std_write(buf)
    }

    fn flush(&self, _sock: &Socket) -> isize {
        // Nothing buffered at this layer
        0
    }

    fn state(&self, _sock: &Socket) -> String {
        String::new()
    }
}
