//! TLS provider contract tests using an in-tree mock provider.
//!
//! No real TLS library is bound here; the mock exercises the upgrade flow,
//! compiled-config caching, handshake gating, peer verification outcomes,
//! buffered-plaintext flags and the state string shape.

use pmr_dispatch::EventService;
use pmr_mem::{Configuration, Heap};
use pmr_net::{
    Error, IoMask, Result, Socket, SocketFlags, SocketProvider, SocketService, SslConfig,
    format_ssl_state,
};
use std::any::Any;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

const CERT_CN: &str = "server.example.com";
const ISSUER_CN: &str = "Example Test CA";
const TRUSTED_CA: &str = "trusted-ca.pem";

fn stack() -> (Arc<EventService>, Arc<SocketService>) {
    let heap = Heap::with_config(Configuration {
        enabled: false,
        ..Configuration::default()
    });
    let events = EventService::new(heap);
    let sockets = SocketService::new(Arc::clone(&events)).expect("socket service");
    (events, sockets)
}

/// Compiled form of an [`SslConfig`] for the mock provider.
struct MockCompiled {
    trusted_ca: bool,
    verify_peer: bool,
}

/// Per-socket session state for the mock provider.
struct MockSession {
    trusted_ca: bool,
    verify_peer: bool,
    peer_name: Option<String>,
    plaintext: VecDeque<u8>,
}

enum Handshake {
    Done,
    Untrusted,
    NameMismatch,
}

struct MockTlsProvider {
    builds: AtomicUsize,
}

impl MockTlsProvider {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            builds: AtomicUsize::new(0),
        })
    }

    fn advance_handshake(&self, sock: &Socket) -> isize {
        let outcome = sock.with_provider_state(|state| {
            let session = state
                .and_then(|state| state.downcast_mut::<MockSession>())
                .expect("mock session installed by upgrade");
            if session.verify_peer && !session.trusted_ca {
                return Handshake::Untrusted;
            }
            if let Some(peer_name) = &session.peer_name {
                if session.verify_peer && peer_name != CERT_CN {
                    return Handshake::NameMismatch;
                }
            }
            Handshake::Done
        });
        match outcome {
            Handshake::Done => {
                sock.clear_flags(SocketFlags::HANDSHAKING);
                0
            }
            Handshake::Untrusted => {
                sock.set_error("Certificate not trusted");
                sock.set_eof(true);
                -1
            }
            Handshake::NameMismatch => {
                sock.set_error("Certificate common name mismatch");
                sock.set_eof(true);
                -1
            }
        }
    }
}

impl SocketProvider for MockTlsProvider {
    fn name(&self) -> &'static str {
        "mock"
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
        sock: &Socket,
        ssl: Arc<SslConfig>,
        peer_name: Option<&str>,
    ) -> Result<()> {
        let compiled = ssl.compiled_with(|settings| {
            self.builds.fetch_add(1, Ordering::SeqCst);
            let trusted_ca = settings
                .ca_file
                .as_ref()
                .is_some_and(|path| path.ends_with(TRUSTED_CA));
            Ok::<_, Error>(Arc::new(MockCompiled {
                trusted_ca,
                verify_peer: settings.verify_peer,
            }) as Arc<dyn Any + Send + Sync>)
        })?;
        let compiled = compiled
            .downcast::<MockCompiled>()
            .map_err(|_| Error::CantInitialize("wrong compiled type".to_string()))?;
        sock.set_provider_state(Box::new(MockSession {
            trusted_ca: compiled.trusted_ca,
            verify_peer: compiled.verify_peer,
            peer_name: peer_name.map(str::to_string),
            plaintext: VecDeque::from(b"decrypted application data".to_vec()),
        }));
        sock.set_flags(SocketFlags::HANDSHAKING);
        // Non-blocking: the caller retries from read/write on wait events
        Ok(())
    }

    fn close(&self, sock: &Socket, graceful: bool) {
        sock.std_close(graceful);
    }

    fn disconnect(&self, sock: &Socket) {
        sock.std_disconnect();
    }

    fn read(&self, sock: &Socket, buf: &mut [u8]) -> isize {
        if sock.is_handshaking() {
            return self.advance_handshake(sock);
        }
        if sock.is_eof() {
            return -1;
        }
        let (n, remaining) = sock.with_provider_state(|state| {
            let session = state
                .and_then(|state| state.downcast_mut::<MockSession>())
                .expect("mock session installed by upgrade");
            let n = buf.len().min(session.plaintext.len());
            for slot in buf.iter_mut().take(n) {
                *slot = session.plaintext.pop_front().unwrap_or(0);
            }
            (n, session.plaintext.len())
        });
        sock.hidden_data(remaining, IoMask::READABLE);
        isize::try_from(n).unwrap_or(isize::MAX)
    }

    fn write(&self, sock: &Socket, buf: &[u8]) -> isize {
        if sock.is_handshaking() {
            // User data must be untouched until the handshake completes
            return 0;
        }
        if sock.is_eof() {
            return Error::CantWrite("socket at eof".to_string()).as_return();
        }
        isize::try_from(buf.len()).unwrap_or(isize::MAX)
    }

    fn flush(&self, sock: &Socket) -> isize {
        sock.clear_flags(SocketFlags::BUFFERED_WRITE);
        0
    }

    fn state(&self, sock: &Socket) -> String {
        let server_side = sock.flags().contains(SocketFlags::SERVER);
        format_ssl_state(
            "mock",
            "TLS_AES_128_GCM_SHA256",
            server_side,
            Some(CERT_CN),
            Some(ISSUER_CN),
            Some(CERT_CN),
            Some(ISSUER_CN),
        )
    }
}

fn client_config(ca_file: &str) -> Arc<SslConfig> {
    let config = SslConfig::new(false);
    config.set_ca_file(ca_file);
    config
}

#[test_log::test]
fn upgrade_without_provider_fails() {
    let (_events, sockets) = stack();
    let socket = sockets.create_socket().expect("socket");
    let result = sockets.upgrade_socket(&socket, None, None);
    assert!(matches!(result, Err(Error::CantInitialize(_))));
}

#[test_log::test]
fn upgrade_sets_handshaking_and_gates_io() {
    let (_events, sockets) = stack();
    sockets.add_socket_provider(MockTlsProvider::new());

    let socket = sockets.create_socket().expect("socket");
    sockets
        .upgrade_socket(&socket, Some(client_config(TRUSTED_CA)), None)
        .expect("upgrade");
    assert!(socket.is_handshaking());

    // While handshaking, writes accept nothing and reads yield no data
    assert_eq!(socket.write(b"early"), 0);
    let mut buf = [0u8; 8];
    assert_eq!(socket.read(&mut buf), 0, "handshake step returns retry");
    assert!(!socket.is_handshaking(), "trusted handshake completes");

    let n = socket.read(&mut buf);
    assert!(n > 0, "application data flows after the handshake");
}

#[test_log::test]
fn untrusted_issuer_fails_with_message_and_eof() {
    let (_events, sockets) = stack();
    sockets.add_socket_provider(MockTlsProvider::new());

    let socket = sockets.create_socket().expect("socket");
    sockets
        .upgrade_socket(&socket, Some(client_config("other-ca.pem")), None)
        .expect("upgrade starts");
    let mut buf = [0u8; 8];
    assert_eq!(socket.read(&mut buf), -1);
    assert!(socket.is_eof());
    let message = socket.error_msg().expect("error recorded");
    assert!(message.contains("Certificate not trusted"), "got: {message}");
}

#[test_log::test]
fn peer_name_mismatch_fails_verification() {
    let (_events, sockets) = stack();
    sockets.add_socket_provider(MockTlsProvider::new());

    let socket = sockets.create_socket().expect("socket");
    sockets
        .upgrade_socket(
            &socket,
            Some(client_config(TRUSTED_CA)),
            Some("other.example.com"),
        )
        .expect("upgrade starts");
    let mut buf = [0u8; 8];
    assert_eq!(socket.read(&mut buf), -1);
    let message = socket.error_msg().expect("error recorded");
    assert!(message.contains("common name"), "got: {message}");
}

#[test_log::test]
fn compiled_config_is_cached_until_changed() {
    let (_events, sockets) = stack();
    let provider = MockTlsProvider::new();
    sockets.add_socket_provider(Arc::clone(&provider) as Arc<dyn SocketProvider>);

    let config = client_config(TRUSTED_CA);
    for _ in 0..3 {
        let socket = sockets.create_socket().expect("socket");
        sockets
            .upgrade_socket(&socket, Some(Arc::clone(&config)), None)
            .expect("upgrade");
    }
    assert_eq!(
        provider.builds.load(Ordering::SeqCst),
        1,
        "unchanged config compiles once"
    );

    config.set_verify_depth(3);
    let socket = sockets.create_socket().expect("socket");
    sockets
        .upgrade_socket(&socket, Some(config), None)
        .expect("upgrade");
    assert_eq!(
        provider.builds.load(Ordering::SeqCst),
        2,
        "mutation forces a recompile"
    );
}

#[test_log::test]
fn buffered_plaintext_sets_and_clears_flags() {
    let (_events, sockets) = stack();
    sockets.add_socket_provider(MockTlsProvider::new());

    let socket = sockets.create_socket().expect("socket");
    sockets
        .upgrade_socket(&socket, Some(client_config(TRUSTED_CA)), None)
        .expect("upgrade");
    let mut buf = [0u8; 4];
    assert_eq!(socket.read(&mut buf), 0, "handshake step");

    // Partial read leaves plaintext buffered; the flag must say so
    let n = socket.read(&mut buf);
    assert_eq!(n, 4);
    assert!(socket.has_buffered_read());

    // Drain the rest
    let mut rest = [0u8; 64];
    let n = socket.read(&mut rest);
    assert!(n > 0);
    assert!(!socket.has_buffered_read(), "flag clears when drained");
}

#[test_log::test]
fn state_string_describes_the_session() {
    let (_events, sockets) = stack();
    sockets.add_socket_provider(MockTlsProvider::new());

    let socket = sockets.create_socket().expect("socket");
    sockets
        .upgrade_socket(&socket, Some(client_config(TRUSTED_CA)), None)
        .expect("upgrade");
    let state = socket.state_string();
    assert!(state.starts_with("PROVIDER=mock,CIPHER="));
    assert!(state.contains(&format!("SERVER_S_CN={CERT_CN}")));
    assert!(state.contains(&format!("SERVER_I_CN={ISSUER_CN}")));
}

#[test_log::test]
fn default_config_is_created_for_bare_upgrade() {
    let (_events, sockets) = stack();
    sockets.add_socket_provider(MockTlsProvider::new());

    let socket = sockets.create_socket().expect("socket");
    sockets
        .upgrade_socket(&socket, None, None)
        .expect("upgrade with default config");
    let config = socket.ssl_config().expect("config attached");
    assert!(!config.is_server(), "non-server socket gets a client config");
}
