//! Socket objects layered over OS descriptors through a provider v-table.

use crate::address::{is_ipv6, resolve};
use crate::error::{Error, Result};
use crate::provider::SocketProvider;
use crate::service::SocketService;
use crate::ssl::SslConfig;
use crate::wait::{IoMask, WaitHandler};
use bitflags::bitflags;
use parking_lot::{Mutex, MutexGuard};
use pmr_dispatch::Dispatcher;
use pmr_mem::YieldFlags;
use socket2::{Domain, SockAddr, Socket as OsSocket, Type};
use std::any::Any;
use std::io::{IoSlice, Read, Seek, SeekFrom, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Linger budget for graceful close draining.
const LINGER_TIMEOUT: Duration = Duration::from_secs(2);

/// Bounded wait for asynchronous connect completion.
const CONNECT_RETRIES: u32 = 50;

bitflags! {
    /// Socket state and option flags.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct SocketFlags: u32 {
        /// Accepted on a listener
        const SERVER = 0x1;
        /// Bound and listening
        const LISTENER = 0x2;
        /// Blocking I/O mode
        const BLOCK = 0x4;
        /// UDP socket
        const DATAGRAM = 0x8;
        /// Permit broadcast datagrams
        const BROADCAST = 0x10;
        /// Disable Nagle
        const NODELAY = 0x20;
        /// Skip `SO_REUSEADDR` on listen
        const NOREUSE = 0x40;
        /// End of stream observed
        const EOF = 0x80;
        /// Descriptor closed
        const CLOSED = 0x100;
        /// TLS handshake in progress
        const HANDSHAKING = 0x200;
        /// Provider holds buffered plaintext to read
        const BUFFERED_READ = 0x400;
        /// Provider holds buffered plaintext to write
        const BUFFERED_WRITE = 0x800;
        /// Forcefully aborted
        const DISCONNECTED = 0x1000;
    }
}

pub(crate) struct SocketState {
    pub fd: Option<OsSocket>,
    pub ip: Option<String>,
    pub port: i32,
    pub accept_ip: Option<String>,
    pub accept_port: i32,
    pub error_msg: Option<String>,
    pub ssl: Option<Arc<SslConfig>>,
}

/// A socket: an OS descriptor plus a provider of wire operations. The
/// standard provider maps straight onto OS calls; TLS providers wrap it.
pub struct Socket {
    pub(crate) service: Arc<SocketService>,
    flags: AtomicU32,
    pub(crate) state: Mutex<SocketState>,
    provider: Mutex<Arc<dyn SocketProvider>>,
    handler: Mutex<Option<Arc<WaitHandler>>>,
    /// Per-socket provider state (e.g. a TLS session), type-erased
    ssl_state: Mutex<Option<Box<dyn Any + Send>>>,
}

impl Socket {
    pub(crate) fn new(service: Arc<SocketService>, provider: Arc<dyn SocketProvider>) -> Arc<Self> {
        Arc::new(Self {
            service,
            flags: AtomicU32::new(0),
            state: Mutex::new(SocketState {
                fd: None,
                ip: None,
                port: 0,
                accept_ip: None,
                accept_port: 0,
                error_msg: None,
                ssl: None,
            }),
            provider: Mutex::new(provider),
            handler: Mutex::new(None),
            ssl_state: Mutex::new(None),
        })
    }

    // ------------------------------------------------------------------
    // Flags and fields
    // ------------------------------------------------------------------

    #[must_use]
    pub fn flags(&self) -> SocketFlags {
        SocketFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub fn set_flags(&self, flags: SocketFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    pub fn clear_flags(&self, flags: SocketFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    fn replace_flags(&self, flags: SocketFlags) {
        self.flags.store(flags.bits(), Ordering::Release);
    }

    #[must_use]
    pub fn is_eof(&self) -> bool {
        self.flags().contains(SocketFlags::EOF)
    }

    pub fn set_eof(&self, on: bool) {
        if on {
            self.set_flags(SocketFlags::EOF);
        } else {
            self.clear_flags(SocketFlags::EOF);
        }
    }

    #[must_use]
    pub fn is_handshaking(&self) -> bool {
        self.flags().contains(SocketFlags::HANDSHAKING)
    }

    #[must_use]
    pub fn has_buffered_read(&self) -> bool {
        self.flags().contains(SocketFlags::BUFFERED_READ)
    }

    #[must_use]
    pub fn has_buffered_write(&self) -> bool {
        self.flags().contains(SocketFlags::BUFFERED_WRITE)
    }

    /// Last provider error attached to this socket.
    #[must_use]
    pub fn error_msg(&self) -> Option<String> {
        self.state.lock().error_msg.clone()
    }

    /// Attaches a human-readable error to the socket. Used by providers.
    pub fn set_error(&self, message: impl Into<String>) {
        self.state.lock().error_msg = Some(message.into());
    }

    /// Remote address of a connected or accepted socket.
    #[must_use]
    pub fn peer(&self) -> (Option<String>, i32) {
        let state = self.state.lock();
        (state.ip.clone(), state.port)
    }

    /// Local interface address captured at accept time.
    #[must_use]
    pub fn accept_address(&self) -> (Option<String>, i32) {
        let state = self.state.lock();
        (state.accept_ip.clone(), state.accept_port)
    }

    /// The TLS configuration applied by an upgrade, if any.
    #[must_use]
    pub fn ssl_config(&self) -> Option<Arc<SslConfig>> {
        self.state.lock().ssl.clone()
    }

    /// Local address of a bound or connected socket.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        let state = self.state.lock();
        state
            .fd
            .as_ref()
            .and_then(|fd| fd.local_addr().ok())
            .and_then(|addr| addr.as_socket())
    }

    pub(crate) fn set_ssl_config(&self, ssl: Arc<SslConfig>) {
        self.state.lock().ssl = Some(ssl);
    }

    /// Installs per-socket provider state (a TLS session). Used by providers.
    pub fn set_provider_state(&self, state: Box<dyn Any + Send>) {
        *self.ssl_state.lock() = Some(state);
    }

    /// Runs `f` over the per-socket provider state. Used by providers.
    pub fn with_provider_state<R>(&self, f: impl FnOnce(Option<&mut (dyn Any + Send)>) -> R) -> R {
        let mut state = self.ssl_state.lock();
        f(state.as_deref_mut())
    }

    /// The active provider.
    #[must_use]
    pub fn provider(&self) -> Arc<dyn SocketProvider> {
        Arc::clone(&self.provider.lock())
    }

    pub(crate) fn set_provider(&self, provider: Arc<dyn SocketProvider>) {
        *self.provider.lock() = provider;
    }

    // ------------------------------------------------------------------
    // Provider-dispatched operations
    // ------------------------------------------------------------------

    /// Opens a listening socket on `ip:port`.
    ///
    /// # Errors
    ///
    /// See [`Error`]; address resolution and bind failures surface here.
    pub fn listen_on(&self, ip: Option<&str>, port: u16, flags: SocketFlags) -> Result<()> {
        let provider = self.provider();
        provider.listen(self, ip, port, flags)
    }

    /// Reads into `buf`.
    ///
    /// Returns the byte count, `0` to retry later (would-block or handshake in
    /// progress), or a negative error code; EOF is reported as `-1` with the
    /// EOF flag set.
    pub fn read(&self, buf: &mut [u8]) -> isize {
        let provider = self.provider();
        provider.read(self, buf)
    }

    /// Writes `buf`.
    ///
    /// Returns the bytes accepted (possibly short in non-blocking mode), `0`
    /// to retry later, or a negative error code.
    pub fn write(&self, buf: &[u8]) -> isize {
        let provider = self.provider();
        provider.write(self, buf)
    }

    /// Flushes provider-buffered data. The standard provider buffers nothing.
    pub fn flush(&self) -> isize {
        let provider = self.provider();
        provider.flush(self)
    }

    /// Closes the socket, optionally draining gracefully first.
    pub fn close(&self, graceful: bool) {
        self.remove_handler();
        let provider = self.provider();
        provider.close(self, graceful);
    }

    /// Forceful abort: drain, shutdown, mark EOF and recall the wait handler.
    pub fn disconnect(&self) {
        let provider = self.provider();
        provider.disconnect(self);
    }

    /// Provider state string (`PROVIDER=...,CIPHER=...`).
    #[must_use]
    pub fn state_string(&self) -> String {
        let provider = self.provider();
        provider.state(self)
    }

    // ------------------------------------------------------------------
    // Connect / accept (socket-level, not provider ops)
    // ------------------------------------------------------------------

    /// Connects to `ip:port`. In non-blocking mode an in-progress connect is
    /// polled briefly and then left to complete; the caller arms a write
    /// handler to learn the outcome.
    ///
    /// # Errors
    ///
    /// [`Error::CantConnect`] for immediate failures.
    pub fn connect(&self, ip: &str, port: u16, flags: SocketFlags) -> Result<()> {
        let address = resolve(Some(ip), port)?;
        let domain = Domain::for_address(address);
        let kind = if flags.contains(SocketFlags::DATAGRAM) {
            Type::DGRAM
        } else {
            Type::STREAM
        };
        let socket = OsSocket::new(domain, kind, None)
            .map_err(|error| Error::CantCreate(format!("socket: {error}")))?;
        socket.set_cloexec(true).ok();
        if flags.contains(SocketFlags::BROADCAST) {
            socket
                .set_broadcast(true)
                .map_err(|error| Error::CantConnect(format!("broadcast: {error}")))?;
        }
        let blocking = flags.contains(SocketFlags::BLOCK);
        socket
            .set_nonblocking(!blocking)
            .map_err(|error| Error::CantConnect(format!("blocking mode: {error}")))?;

        let target = SockAddr::from(address);
        let mut connected = false;
        let mut retries = 0;
        loop {
            match socket.connect(&target) {
                Ok(()) => {
                    connected = true;
                    break;
                }
                Err(error) => match error.raw_os_error() {
                    Some(libc::EISCONN) => {
                        connected = true;
                        break;
                    }
                    Some(libc::EINPROGRESS | libc::EALREADY | libc::EADDRINUSE) => {
                        // Asynchronous connect under way; poll briefly
                        if blocking || retries < CONNECT_RETRIES {
                            retries += 1;
                            std::thread::sleep(Duration::from_millis(1));
                            continue;
                        }
                        break;
                    }
                    Some(libc::EINTR) => continue,
                    _ => {
                        return Err(Error::CantConnect(format!("{ip}:{port}: {error}")));
                    }
                },
            }
        }
        if !connected {
            trace!("connect to {ip}:{port} still in progress");
        }
        if flags.contains(SocketFlags::NODELAY) && !flags.contains(SocketFlags::DATAGRAM) {
            socket.set_tcp_nodelay(true).ok();
        }
        let mut state = self.state.lock();
        state.fd = Some(socket);
        state.ip = Some(ip.to_string());
        state.port = i32::from(port);
        drop(state);
        self.replace_flags(flags & !(SocketFlags::LISTENER | SocketFlags::SERVER));
        Ok(())
    }

    /// Accepts one connection from a listening socket. Returns `Ok(None)` when
    /// no connection is pending or the global accept cap rejected it.
    ///
    /// # Errors
    ///
    /// [`Error::BadState`] if the socket is not a listener.
    pub fn accept(&self) -> Result<Option<Arc<Socket>>> {
        if !self.flags().contains(SocketFlags::LISTENER) {
            return Err(Error::BadState("accept on a non-listener".to_string()));
        }
        let listener = {
            let state = self.state.lock();
            let Some(fd) = &state.fd else {
                return Err(Error::BadState("listener is closed".to_string()));
            };
            fd.try_clone()
                .map_err(|error| Error::BadState(format!("dup listener: {error}")))?
        };

        let blocking = self.flags().contains(SocketFlags::BLOCK);
        let heap = self.service.heap();
        if blocking {
            heap.yield_control(YieldFlags::STICKY);
        }
        let accepted = listener.accept();
        if blocking {
            heap.reset_yield();
        }
        let (fd, peer) = match accepted {
            Ok(pair) => pair,
            Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => return Ok(None),
            Err(error) => {
                trace!("accept failed: {error}");
                return Ok(None);
            }
        };

        let new_socket = Socket::new(Arc::clone(&self.service), self.service.standard_provider());
        let flags = (self.flags() & !SocketFlags::LISTENER) | SocketFlags::SERVER;
        new_socket.replace_flags(flags);

        // Enforce the global accept cap before doing any more work
        if !self.service.on_accept() {
            warn!("rejecting connection, too many clients");
            let mut state = new_socket.state.lock();
            state.fd = Some(fd);
            drop(state);
            new_socket.close(false);
            return Ok(None);
        }

        fd.set_cloexec(true).ok();
        fd.set_nonblocking(!flags.contains(SocketFlags::BLOCK)).ok();
        if flags.contains(SocketFlags::NODELAY) {
            fd.set_tcp_nodelay(true).ok();
        }

        let (peer_ip, peer_port) = addr_parts(&peer);
        let (local_ip, local_port) = fd
            .local_addr()
            .map(|addr| addr_parts(&addr))
            .unwrap_or((None, 0));

        let mut state = new_socket.state.lock();
        state.fd = Some(fd);
        state.ip = peer_ip;
        state.port = peer_port;
        state.accept_ip = local_ip;
        state.accept_port = local_port;
        drop(state);
        Ok(Some(new_socket))
    }

    /// Vectored write: `writev` on the standard provider, a provider-write
    /// loop otherwise (TLS providers must see the plaintext).
    pub fn write_vectored(&self, bufs: &[IoSlice<'_>]) -> isize {
        if self.state.lock().ssl.is_none() {
            return self.std_write_vectored(bufs);
        }
        let mut written = 0isize;
        for buf in bufs {
            let rc = self.write(buf);
            if rc < 0 {
                return if written > 0 { written } else { rc };
            }
            written += rc;
            if (rc as usize) < buf.len() {
                break;
            }
        }
        written
    }

    /// Writes header vectors, a file range, then trailer vectors, using
    /// `sendfile(2)` for the file body where available. Returns the total
    /// bytes written; a short write stops the sequence.
    pub fn send_file(
        &self,
        file: &mut std::fs::File,
        offset: u64,
        len: u64,
        before: &[IoSlice<'_>],
        after: &[IoSlice<'_>],
    ) -> isize {
        let mut written = 0isize;
        let to_write_before: usize = before.iter().map(|buf| buf.len()).sum();

        if !before.is_empty() {
            let rc = self.write_vectored(before);
            if rc < 0 {
                return rc;
            }
            written += rc;
            if rc as usize != to_write_before {
                return written;
            }
        }

        let mut remaining = len;
        let mut file_offset = offset;
        while remaining > 0 {
            let rc = self.send_file_body(file, file_offset, remaining);
            if rc < 0 {
                return if written > 0 { written } else { rc };
            }
            if rc == 0 {
                return written;
            }
            written += rc;
            file_offset += rc as u64;
            remaining -= rc as u64;
        }

        if !after.is_empty() {
            let rc = self.write_vectored(after);
            if rc > 0 {
                written += rc;
            } else if rc < 0 && written == 0 {
                return rc;
            }
        }
        written
    }

    #[cfg(target_os = "linux")]
    fn send_file_body(&self, file: &std::fs::File, offset: u64, len: u64) -> isize {
        use std::os::fd::AsRawFd;
        // Plain descriptors only; TLS providers must encrypt, so fall back
        if self.state.lock().ssl.is_some() {
            return self.send_file_copy(file, offset, len);
        }
        let state = self.state.lock();
        let Some(fd) = &state.fd else {
            return Error::BadState("socket closed".to_string()).as_return();
        };
        let blocking = self.flags().contains(SocketFlags::BLOCK);
        let heap = Arc::clone(self.service.heap());
        if blocking {
            heap.yield_control(YieldFlags::STICKY);
        }
        let mut off = offset as libc::off_t;
        // Safety: both descriptors are open; off points to a live off_t.
        let rc = unsafe {
            libc::sendfile(
                fd.as_raw_fd(),
                file.as_raw_fd(),
                &raw mut off,
                usize::try_from(len).unwrap_or(usize::MAX),
            )
        };
        if blocking {
            heap.reset_yield();
        }
        if rc < 0 {
            let errno = std::io::Error::last_os_error();
            if errno.kind() == std::io::ErrorKind::WouldBlock {
                return 0;
            }
            return Error::CantWrite(format!("sendfile: {errno}")).as_return();
        }
        rc
    }

    #[cfg(not(target_os = "linux"))]
    fn send_file_body(&self, file: &std::fs::File, offset: u64, len: u64) -> isize {
        self.send_file_copy(file, offset, len)
    }

    /// Read-and-write fallback used off Linux and over TLS.
    fn send_file_copy(&self, file: &std::fs::File, offset: u64, len: u64) -> isize {
        let mut buf = [0u8; 8 * 1024];
        let span = usize::try_from(len).unwrap_or(usize::MAX).min(buf.len());
        let mut handle = file;
        if let Err(error) = handle.seek(SeekFrom::Start(offset)) {
            return Error::CantRead(format!("seek: {error}")).as_return();
        }
        let n = match handle.read(&mut buf[..span]) {
            Ok(0) => return 0,
            Ok(n) => n,
            Err(error) => return Error::CantRead(format!("read: {error}")).as_return(),
        };
        self.write(&buf[..n])
    }

    // ------------------------------------------------------------------
    // Modes and options
    // ------------------------------------------------------------------

    /// Switches between blocking and non-blocking I/O.
    ///
    /// # Errors
    ///
    /// [`Error::BadState`] if the descriptor is closed.
    pub fn set_blocking_mode(&self, on: bool) -> Result<()> {
        let state = self.state.lock();
        let Some(fd) = &state.fd else {
            return Err(Error::BadState("socket closed".to_string()));
        };
        fd.set_nonblocking(!on)
            .map_err(|error| Error::BadState(format!("blocking mode: {error}")))?;
        drop(state);
        if on {
            self.set_flags(SocketFlags::BLOCK);
        } else {
            self.clear_flags(SocketFlags::BLOCK);
        }
        Ok(())
    }

    /// Toggles `TCP_NODELAY`.
    ///
    /// # Errors
    ///
    /// [`Error::BadState`] if the descriptor is closed.
    pub fn set_no_delay(&self, on: bool) -> Result<()> {
        let state = self.state.lock();
        let Some(fd) = &state.fd else {
            return Err(Error::BadState("socket closed".to_string()));
        };
        fd.set_tcp_nodelay(on)
            .map_err(|error| Error::BadState(format!("nodelay: {error}")))?;
        drop(state);
        if on {
            self.set_flags(SocketFlags::NODELAY);
        } else {
            self.clear_flags(SocketFlags::NODELAY);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Wait handler integration
    // ------------------------------------------------------------------

    /// Arms an I/O handler: `proc` runs as an event on `dispatcher` when the
    /// socket becomes ready for `mask`. Delivery is one-shot; re-arm with
    /// [`Socket::enable_events`].
    ///
    /// # Errors
    ///
    /// [`Error::BadState`] if the descriptor is closed.
    pub fn add_handler(
        &self,
        mask: IoMask,
        dispatcher: &Arc<Dispatcher>,
        proc_: impl Fn(IoMask) + Send + Sync + 'static,
    ) -> Result<Arc<WaitHandler>> {
        let fd = {
            let state = self.state.lock();
            let Some(fd) = &state.fd else {
                return Err(Error::BadState("socket closed".to_string()));
            };
            use std::os::fd::AsRawFd;
            fd.as_raw_fd()
        };
        let handler = self
            .service
            .wait_service()
            .add_handler(fd, mask, dispatcher, Arc::new(proc_));
        *self.handler.lock() = Some(Arc::clone(&handler));
        Ok(handler)
    }

    /// Re-arms the handler interest mask.
    pub fn enable_events(&self, mask: IoMask) {
        if let Some(handler) = self.handler.lock().as_ref() {
            self.service.wait_service().enable_handler(handler, mask);
        }
    }

    /// Detaches the wait handler, if any.
    pub fn remove_handler(&self) {
        if let Some(handler) = self.handler.lock().take() {
            self.service.wait_service().remove_handler(&handler);
        }
    }

    /// Recalls the wait handler so buffered provider data is serviced without
    /// waiting for descriptor readiness.
    pub fn recall_handler(&self) {
        if let Some(handler) = self.handler.lock().as_ref() {
            self.service.wait_service().recall_handler(handler);
        }
    }

    /// Records that a provider holds `len` buffered plaintext bytes in the
    /// given direction, and recalls the wait handler so the event loop does
    /// not sleep on data that is already readable.
    pub fn hidden_data(&self, len: usize, dir: IoMask) {
        let flag = if dir.contains(IoMask::READABLE) {
            SocketFlags::BUFFERED_READ
        } else {
            SocketFlags::BUFFERED_WRITE
        };
        if len > 0 {
            self.set_flags(flag);
            self.recall_handler();
        } else {
            self.clear_flags(flag);
        }
    }

    // ------------------------------------------------------------------
    // Raw operations used by providers
    // ------------------------------------------------------------------

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, SocketState> {
        self.state.lock()
    }

    /// Raw descriptor listen path for providers. Resolves, binds and listens,
    /// applying option flags.
    ///
    /// # Errors
    ///
    /// Resolution, bind and listen failures.
    pub fn std_listen(&self, ip: Option<&str>, port: u16, flags: SocketFlags) -> Result<()> {
        let datagram = flags.contains(SocketFlags::DATAGRAM);
        let kind = if datagram { Type::DGRAM } else { Type::STREAM };

        // Prefer dual-stack :: when no interface is named
        let explicit_v6 = ip.is_some_and(is_ipv6);
        let (domain, address): (Domain, SocketAddr) = match ip {
            None => (
                Domain::IPV6,
                SocketAddr::new(std::net::IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED), port),
            ),
            Some(ip) => {
                let resolved = resolve(Some(ip), port)?;
                (Domain::for_address(resolved), resolved)
            }
        };

        let socket = OsSocket::new(domain, kind, None)
            .map_err(|error| Error::CantCreate(format!("socket: {error}")))?;
        socket.set_cloexec(true).ok();
        if !flags.contains(SocketFlags::NOREUSE) {
            socket.set_reuse_address(true).ok();
        }
        if domain == Domain::IPV6 {
            // Dual-stack when unspecified, V6-only for explicit IPv6 binds
            socket.set_only_v6(explicit_v6).ok();
        }
        if datagram && flags.contains(SocketFlags::BROADCAST) {
            socket
                .set_broadcast(true)
                .map_err(|error| Error::CantOpen(format!("broadcast: {error}")))?;
        }

        let socket = self.service.run_prebind(socket)?;
        socket
            .bind(&SockAddr::from(address))
            .map_err(|error| Error::CantOpen(format!("bind {address}: {error}")))?;
        if !datagram {
            socket
                .listen(libc::SOMAXCONN)
                .map_err(|error| Error::CantOpen(format!("listen: {error}")))?;
        }
        socket
            .set_nonblocking(!flags.contains(SocketFlags::BLOCK))
            .map_err(|error| Error::CantOpen(format!("blocking mode: {error}")))?;
        if flags.contains(SocketFlags::NODELAY) && !datagram {
            socket.set_tcp_nodelay(true).ok();
        }

        let mut state = self.state.lock();
        state.fd = Some(socket);
        state.ip = ip.map(str::to_string);
        state.port = i32::from(port);
        drop(state);
        self.replace_flags(flags | SocketFlags::LISTENER);
        debug!("listening on {}:{port}", ip.unwrap_or("*"));
        Ok(())
    }

    /// Raw read for providers. Returns bytes read, `0` for would-block, `-1`
    /// with EOF set at end of stream, or a negative error code.
    pub fn std_read(&self, buf: &mut [u8]) -> isize {
        let flags = self.flags();
        if flags.intersects(SocketFlags::EOF | SocketFlags::CLOSED) {
            self.set_eof(true);
            return -1;
        }
        let state = self.state.lock();
        let Some(fd) = &state.fd else {
            self.set_eof(true);
            return -1;
        };
        let blocking = flags.contains(SocketFlags::BLOCK);
        let heap = Arc::clone(self.service.heap());
        if blocking {
            heap.yield_control(YieldFlags::STICKY);
        }
        let mut handle = fd;
        let result = handle.read(buf);
        if blocking {
            heap.reset_yield();
        }
        drop(state);
        match result {
            Ok(0) if !flags.contains(SocketFlags::DATAGRAM) => {
                self.set_eof(true);
                -1
            }
            Ok(n) => isize::try_from(n).unwrap_or(isize::MAX),
            Err(error) if retryable(&error) => 0,
            Err(error) => {
                self.set_eof(true);
                Error::CantRead(error.to_string()).as_return()
            }
        }
    }

    /// Raw write for providers. Returns bytes accepted (short in non-blocking
    /// mode), `0` for would-block, or a negative error code.
    pub fn std_write(&self, buf: &[u8]) -> isize {
        let flags = self.flags();
        if flags.intersects(SocketFlags::EOF | SocketFlags::CLOSED) {
            return Error::CantWrite("socket at eof".to_string()).as_return();
        }
        let state = self.state.lock();
        let Some(fd) = &state.fd else {
            return Error::BadState("socket closed".to_string()).as_return();
        };
        let blocking = flags.contains(SocketFlags::BLOCK);
        let heap = Arc::clone(self.service.heap());
        let mut written = 0usize;
        let mut handle = fd;
        while written < buf.len() {
            if blocking {
                heap.yield_control(YieldFlags::STICKY);
            }
            let result = handle.write(&buf[written..]);
            if blocking {
                heap.reset_yield();
            }
            match result {
                Ok(n) => written += n,
                Err(error) if retryable(&error) => {
                    if blocking {
                        std::thread::sleep(Duration::from_millis(1));
                        continue;
                    }
                    break;
                }
                Err(error) => {
                    return Error::CantWrite(error.to_string()).as_return();
                }
            }
        }
        isize::try_from(written).unwrap_or(isize::MAX)
    }

    fn std_write_vectored(&self, bufs: &[IoSlice<'_>]) -> isize {
        let flags = self.flags();
        if flags.intersects(SocketFlags::EOF | SocketFlags::CLOSED) {
            return Error::CantWrite("socket at eof".to_string()).as_return();
        }
        let state = self.state.lock();
        let Some(fd) = &state.fd else {
            return Error::BadState("socket closed".to_string()).as_return();
        };
        match fd.send_vectored(bufs) {
            Ok(n) => isize::try_from(n).unwrap_or(isize::MAX),
            Err(error) if retryable(&error) => 0,
            Err(error) => Error::CantWrite(error.to_string()).as_return(),
        }
    }

    /// Raw close for providers: optional graceful drain, shutdown with a
    /// linger budget, then descriptor release. Idempotent.
    pub fn std_close(&self, graceful: bool) {
        let mut state = self.state.lock();
        if self.flags().contains(SocketFlags::CLOSED) {
            return;
        }
        self.set_flags(SocketFlags::CLOSED | SocketFlags::EOF);

        if let Some(fd) = state.fd.take() {
            trace!("close socket, graceful {graceful}");
            let mut buf = [0u8; 16];
            if graceful {
                fd.set_nonblocking(true).ok();
                let mut handle = &fd;
                while matches!(handle.read(&mut buf), Ok(n) if n > 0) {}
            }
            if fd.shutdown(std::net::Shutdown::Both).is_ok() && graceful {
                let deadline = Instant::now() + LINGER_TIMEOUT;
                let mut handle = &fd;
                while Instant::now() < deadline {
                    match handle.read(&mut buf) {
                        Ok(n) if n > 0 => {}
                        _ => break,
                    }
                }
            }
            // Descriptor released when fd drops
        }
        drop(state);

        if self.flags().contains(SocketFlags::SERVER) {
            self.service.on_close_server();
        }
    }

    /// Raw disconnect for providers: never blocks, drains a bounded amount,
    /// sends a FIN and marks the socket dead.
    pub fn std_disconnect(&self) {
        // Try-lock so an operation blocked elsewhere cannot wedge the abort
        let Some(state) = self.state.try_lock() else {
            return;
        };
        if let Some(fd) = &state.fd {
            if !self.flags().contains(SocketFlags::EOF) {
                trace!("disconnect socket");
                fd.set_nonblocking(true).ok();
                let mut buf = [0u8; 4 * 1024];
                let mut handle = fd;
                for _ in 0..16 {
                    match handle.read(&mut buf) {
                        Ok(n) if n > 0 => {}
                        _ => break,
                    }
                }
                fd.shutdown(std::net::Shutdown::Both).ok();
                for _ in 0..16 {
                    match handle.read(&mut buf) {
                        Ok(n) if n > 0 => {}
                        _ => break,
                    }
                }
            }
        }
        drop(state);
        self.set_flags(SocketFlags::EOF | SocketFlags::DISCONNECTED);
        self.recall_handler();
    }
}

fn retryable(error: &std::io::Error) -> bool {
    matches!(
        error.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted
    )
}

fn addr_parts(addr: &SockAddr) -> (Option<String>, i32) {
    match addr.as_socket() {
        Some(socket_addr) => (
            Some(socket_addr.ip().to_string()),
            i32::from(socket_addr.port()),
        ),
        None => (None, 0),
    }
}
