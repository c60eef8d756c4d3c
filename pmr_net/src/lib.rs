//! # PMR Socket Layer
//!
//! Blocking and non-blocking sockets behind a pluggable provider v-table,
//! integrated with the dispatcher event loop and the cooperative collector.
//!
//! ## Overview
//!
//! A [`Socket`] wraps an OS descriptor plus a [`SocketProvider`] supplying the
//! wire operations (`listen`, `read`, `write`, `close`, `disconnect`, `flush`,
//! `upgrade`, `state`). The standard provider maps directly onto OS calls.
//! TLS providers register by name with the [`SocketService`] and wrap the
//! standard operations; [`SocketService::upgrade_socket`] switches a socket
//! onto one and drives the handshake per the socket's blocking mode.
//!
//! Readiness is delivered through the [`WaitService`], a `poll(2)` loop with a
//! self-pipe wakeup that doubles as the event-loop notifier: socket handlers
//! run as events on their dispatcher, and providers holding buffered
//! plaintext recall their handler so the loop never sleeps on readable data.
//!
//! Blocking calls (accept, reads, sendfile) bracket themselves with a sticky
//! yield so a stalled peer never delays a garbage collection.

mod address;
mod error;
mod provider;
mod service;
mod socket;
mod ssl;
mod wait;

pub use address::{SocketAddress, is_ipv6, parse_socket_address};
pub use error::{Error, Result};
pub use provider::{SocketProvider, StandardProvider};
pub use service::{PrebindHook, SOCKET_SERVICE, SocketService, socket_service};
pub use socket::{Socket, SocketFlags};
pub use ssl::{SslConfig, SslProtocols, SslSettings, format_ssl_state};
pub use wait::{IoMask, WaitHandler, WaitProc, WaitService};
