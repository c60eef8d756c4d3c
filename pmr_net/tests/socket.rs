//! Socket layer tests over loopback TCP.

use pmr_dispatch::{EventService, ServiceFlags};
use pmr_mem::{Configuration, Heap};
use pmr_net::{IoMask, SocketFlags, SocketService};
use std::io::{IoSlice, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

fn stack() -> (Arc<EventService>, Arc<SocketService>) {
    let heap = Heap::with_config(Configuration {
        enabled: false,
        ..Configuration::default()
    });
    let events = EventService::new(heap);
    let sockets = SocketService::new(Arc::clone(&events)).expect("socket service");
    (events, sockets)
}

fn listen_blocking(sockets: &Arc<SocketService>) -> (Arc<pmr_net::Socket>, u16) {
    let listener = sockets.create_socket().expect("socket");
    listener
        .listen_on(Some("127.0.0.1"), 0, SocketFlags::BLOCK)
        .expect("listen");
    let port = listener.local_addr().expect("bound").port();
    (listener, port)
}

#[test_log::test]
fn listen_accept_read_write_roundtrip() {
    let (_events, sockets) = stack();
    let (listener, port) = listen_blocking(&sockets);

    let mut client = TcpStream::connect(("127.0.0.1", port)).expect("connect");
    client.write_all(b"hello runtime").expect("client write");

    let accepted = listener
        .accept()
        .expect("accept")
        .expect("a connection is pending");
    assert!(accepted.flags().contains(SocketFlags::SERVER));
    assert!(!accepted.flags().contains(SocketFlags::LISTENER));

    let mut buf = [0u8; 64];
    let n = accepted.read(&mut buf);
    assert!(n > 0, "read returned {n}");
    assert_eq!(&buf[..n as usize], b"hello runtime");

    let rc = accepted.write(b"pong");
    assert_eq!(rc, 4);
    let mut reply = [0u8; 4];
    client.read_exact(&mut reply).expect("client read");
    assert_eq!(&reply, b"pong");

    accepted.close(true);
    listener.close(false);
}

#[test_log::test]
fn accept_captures_peer_and_local_addresses() {
    let (_events, sockets) = stack();
    let (listener, port) = listen_blocking(&sockets);
    let _client = TcpStream::connect(("127.0.0.1", port)).expect("connect");
    let accepted = listener.accept().expect("accept").expect("pending");

    let (peer_ip, peer_port) = accepted.peer();
    assert_eq!(peer_ip.as_deref(), Some("127.0.0.1"));
    assert!(peer_port > 0);
    let (local_ip, local_port) = accepted.accept_address();
    assert_eq!(local_ip.as_deref(), Some("127.0.0.1"));
    assert_eq!(local_port, i32::from(port));
    accepted.close(false);
    listener.close(false);
}

#[test_log::test]
fn graceful_close_releases_descriptor_and_reads_eof() {
    let (_events, sockets) = stack();
    let (listener, port) = listen_blocking(&sockets);
    let _client = TcpStream::connect(("127.0.0.1", port)).expect("connect");
    let accepted = listener.accept().expect("accept").expect("pending");

    accepted.close(true);
    assert!(accepted.flags().contains(SocketFlags::CLOSED));
    assert!(accepted.is_eof());
    assert!(accepted.local_addr().is_none(), "descriptor should be released");

    let mut buf = [0u8; 8];
    assert_eq!(accepted.read(&mut buf), -1);
    assert!(accepted.is_eof());
    listener.close(false);
}

#[test_log::test]
fn accept_cap_rejects_excess_connections() {
    let (_events, sockets) = stack();
    sockets.set_max_accept(1);
    let (listener, port) = listen_blocking(&sockets);

    let _first_client = TcpStream::connect(("127.0.0.1", port)).expect("connect");
    let _second_client = TcpStream::connect(("127.0.0.1", port)).expect("connect");

    let first = listener.accept().expect("accept");
    assert!(first.is_some(), "first connection fits under the cap");
    let second = listener.accept().expect("accept");
    assert!(second.is_none(), "second connection must be rejected");
    assert_eq!(sockets.accept_count(), 1);

    if let Some(socket) = first {
        socket.close(false);
    }
    assert_eq!(sockets.accept_count(), 0);
    listener.close(false);
}

#[test_log::test]
fn connect_to_refused_port_errors() {
    let (_events, sockets) = stack();
    // Bind-then-drop to find a port with no listener
    let probe = std::net::TcpListener::bind("127.0.0.1:0").expect("probe bind");
    let port = probe.local_addr().expect("probe addr").port();
    drop(probe);

    let socket = sockets.create_socket().expect("socket");
    let result = socket.connect("127.0.0.1", port, SocketFlags::BLOCK);
    assert!(result.is_err(), "connect to a dead port should fail");
}

#[test_log::test]
fn nonblocking_read_returns_zero_without_data() {
    let (_events, sockets) = stack();
    let (listener, port) = listen_blocking(&sockets);
    let _client = TcpStream::connect(("127.0.0.1", port)).expect("connect");
    let accepted = listener.accept().expect("accept").expect("pending");

    accepted.set_blocking_mode(false).expect("nonblocking");
    let mut buf = [0u8; 16];
    assert_eq!(accepted.read(&mut buf), 0, "no data yet means retry");
    accepted.close(false);
    listener.close(false);
}

#[test_log::test]
fn vectored_write_sends_all_slices() {
    let (_events, sockets) = stack();
    let (listener, port) = listen_blocking(&sockets);
    let mut client = TcpStream::connect(("127.0.0.1", port)).expect("connect");
    let accepted = listener.accept().expect("accept").expect("pending");

    let parts = [IoSlice::new(b"alpha-"), IoSlice::new(b"beta-"), IoSlice::new(b"gamma")];
    let rc = accepted.write_vectored(&parts);
    assert_eq!(rc, 16);

    let mut buf = [0u8; 16];
    client.read_exact(&mut buf).expect("client read");
    assert_eq!(&buf, b"alpha-beta-gamma");
    accepted.close(false);
    listener.close(false);
}

#[test_log::test]
fn send_file_writes_headers_body_trailers_in_order() {
    let (_events, sockets) = stack();
    let (listener, port) = listen_blocking(&sockets);
    let mut client = TcpStream::connect(("127.0.0.1", port)).expect("connect");
    let accepted = listener.accept().expect("accept").expect("pending");

    let body = vec![0x42u8; 1024];
    let mut file = tempfile::tempfile().expect("tempfile");
    file.write_all(&body).expect("fill file");
    file.flush().expect("flush file");

    let header = IoSlice::new(b"HDR:");
    let trailer = IoSlice::new(b":TRL");
    let written = accepted.send_file(&mut file, 0, 1024, &[header], &[trailer]);
    assert_eq!(written, 4 + 1024 + 4);

    let mut received = vec![0u8; 4 + 1024 + 4];
    client.read_exact(&mut received).expect("client read");
    assert_eq!(&received[..4], b"HDR:");
    assert!(received[4..4 + 1024].iter().all(|&byte| byte == 0x42));
    assert_eq!(&received[4 + 1024..], b":TRL");
    accepted.close(true);
    listener.close(false);
}

#[test_log::test]
fn wait_handler_fires_on_readable_data() {
    let (events, sockets) = stack();
    let (listener, port) = listen_blocking(&sockets);
    let mut client = TcpStream::connect(("127.0.0.1", port)).expect("connect");
    let accepted = listener.accept().expect("accept").expect("pending");
    accepted.set_blocking_mode(false).expect("nonblocking");

    let dispatcher = events.create_dispatcher("io").expect("dispatcher");
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fired);
    accepted
        .add_handler(IoMask::READABLE, &dispatcher, move |mask| {
            assert!(mask.contains(IoMask::READABLE));
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .expect("handler");

    client.write_all(b"wake up").expect("client write");
    events.service_events(Some(Duration::from_millis(300)), ServiceFlags::empty());

    assert!(
        fired.load(Ordering::SeqCst) >= 1,
        "handler should fire when data arrives"
    );
    accepted.close(false);
    listener.close(false);
}

#[test_log::test]
fn recalled_handler_fires_without_descriptor_readiness() {
    let (events, sockets) = stack();
    let (listener, port) = listen_blocking(&sockets);
    let _client = TcpStream::connect(("127.0.0.1", port)).expect("connect");
    let accepted = listener.accept().expect("accept").expect("pending");
    accepted.set_blocking_mode(false).expect("nonblocking");

    let dispatcher = events.create_dispatcher("recall").expect("dispatcher");
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fired);
    accepted
        .add_handler(IoMask::READABLE, &dispatcher, move |_mask| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .expect("handler");

    // No data on the wire; a provider with buffered plaintext recalls instead
    accepted.hidden_data(32, IoMask::READABLE);
    assert!(accepted.has_buffered_read());

    events.service_events(Some(Duration::from_millis(200)), ServiceFlags::empty());
    assert!(
        fired.load(Ordering::SeqCst) >= 1,
        "recall must deliver the handler with no wire data"
    );

    accepted.hidden_data(0, IoMask::READABLE);
    assert!(!accepted.has_buffered_read());
    accepted.close(false);
    listener.close(false);
}

#[test_log::test]
fn disconnect_marks_eof_and_disconnected() {
    let (_events, sockets) = stack();
    let (listener, port) = listen_blocking(&sockets);
    let _client = TcpStream::connect(("127.0.0.1", port)).expect("connect");
    let accepted = listener.accept().expect("accept").expect("pending");

    accepted.disconnect();
    assert!(accepted.is_eof());
    assert!(accepted.flags().contains(SocketFlags::DISCONNECTED));
    accepted.close(false);
    listener.close(false);
}
