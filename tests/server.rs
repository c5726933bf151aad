//! End-to-end scenarios against a real server on an ephemeral port.
//!
//! The `list` command doubles as a synchronization barrier: every `list`
//! send produces exactly one response to the requester, so a client can
//! poll its own view of the registry without disturbing anyone else.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::thread;
use std::time::Duration;

use chatd::codec;
use chatd::server::ServerHandle;
use chatd::ChatServer;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);
const SILENCE_WINDOW: Duration = Duration::from_millis(300);

fn start_server() -> (SocketAddr, ServerHandle) {
    let mut server = ChatServer::bind("127.0.0.1", 0).expect("bind server");
    let addr = server.local_addr();
    let handle = server.handle();
    thread::spawn(move || {
        let _ = server.run();
    });
    (addr, handle)
}

struct TestClient {
    stream: TcpStream,
}

impl TestClient {
    fn connect(addr: SocketAddr, nick: &str) -> Self {
        let stream = TcpStream::connect(addr).expect("connect");
        stream
            .set_read_timeout(Some(RECV_TIMEOUT))
            .expect("set timeout");
        let mut client = Self { stream };
        client.send(nick);
        client
    }

    fn send(&mut self, body: &str) {
        let frame = codec::encode(body.as_bytes()).expect("encode");
        self.stream.write_all(&frame).expect("send frame");
    }

    fn recv(&mut self) -> String {
        let body = codec::decode(&mut self.stream).expect("recv frame");
        String::from_utf8(body).expect("utf8 body")
    }

    /// Sends `list` until the response satisfies `pred`; returns it.
    fn list_until(&mut self, pred: impl Fn(&str) -> bool) -> String {
        for _ in 0..100 {
            self.send("list");
            let listing = self.recv();
            if pred(&listing) {
                return listing;
            }
            thread::sleep(Duration::from_millis(20));
        }
        panic!("registry never reached the expected state");
    }

    /// Asserts that nothing arrives for a short grace period.
    fn assert_silent(&mut self) {
        self.stream
            .set_read_timeout(Some(SILENCE_WINDOW))
            .expect("set timeout");
        let mut byte = [0u8; 1];
        match self.stream.read(&mut byte) {
            Ok(n) => panic!("expected silence, read {n} bytes"),
            Err(err) => assert!(
                matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ),
                "expected read timeout, got {err}"
            ),
        }
        self.stream
            .set_read_timeout(Some(RECV_TIMEOUT))
            .expect("restore timeout");
    }
}

#[test]
fn broadcast_reaches_every_other_client_but_not_the_sender() {
    let (addr, _handle) = start_server();

    let mut alice = TestClient::connect(addr, "alice");
    alice.list_until(|l| l.contains("alice"));
    let mut bob = TestClient::connect(addr, "bob");
    bob.list_until(|l| l.contains("alice") && l.contains("bob"));

    alice.send("hi");
    assert_eq!(bob.recv(), "alice: hi");
    alice.assert_silent();
}

#[test]
fn list_response_pads_nicks_to_ten_columns() {
    let (addr, _handle) = start_server();

    let mut alice = TestClient::connect(addr, "alice");
    alice.list_until(|l| l.contains("alice"));
    let mut bob = TestClient::connect(addr, "bob");

    let listing = bob.list_until(|l| l.contains("alice") && l.contains("bob"));
    let mut lines: Vec<&str> = listing.lines().collect();
    lines.sort_unstable();
    assert_eq!(lines, vec!["alice     : online", "bob       : online"]);

    // Only the requester hears the answer.
    alice.assert_silent();
}

#[test]
fn empty_message_broadcasts_as_bare_prefix() {
    let (addr, _handle) = start_server();

    let mut alice = TestClient::connect(addr, "alice");
    alice.list_until(|l| l.contains("alice"));
    let mut bob = TestClient::connect(addr, "bob");
    bob.list_until(|l| l.contains("alice") && l.contains("bob"));

    alice.send("");
    assert_eq!(bob.recv(), "alice: ");
}

#[test]
fn messages_from_one_source_arrive_in_order() {
    let (addr, _handle) = start_server();

    let mut alice = TestClient::connect(addr, "alice");
    alice.list_until(|l| l.contains("alice"));
    let mut bob = TestClient::connect(addr, "bob");
    bob.list_until(|l| l.contains("alice") && l.contains("bob"));

    for body in ["one", "two", "three"] {
        alice.send(body);
    }
    assert_eq!(bob.recv(), "alice: one");
    assert_eq!(bob.recv(), "alice: two");
    assert_eq!(bob.recv(), "alice: three");
}

#[test]
fn peer_disconnect_leaves_other_clients_untouched() {
    let (addr, _handle) = start_server();

    let mut alice = TestClient::connect(addr, "alice");
    alice.list_until(|l| l.contains("alice"));
    let mut bob = TestClient::connect(addr, "bob");
    bob.list_until(|l| l.contains("alice") && l.contains("bob"));
    let mut carol = TestClient::connect(addr, "carol");
    carol.list_until(|l| l.contains("alice") && l.contains("bob") && l.contains("carol"));

    drop(bob);
    alice.list_until(|l| l.contains("bob       : offline"));

    alice.send("still here");
    assert_eq!(carol.recv(), "alice: still here");
    alice.assert_silent();
}

#[test]
fn truncated_frame_disconnects_only_the_offending_peer() {
    let (addr, _handle) = start_server();

    let mut alice = TestClient::connect(addr, "alice");
    alice.list_until(|l| l.contains("alice"));
    let mut bob = TestClient::connect(addr, "bob");
    bob.list_until(|l| l.contains("alice") && l.contains("bob"));
    let mut mallory = TestClient::connect(addr, "mallory");
    mallory.list_until(|l| l.contains("mallory"));

    // Header promises 10 bytes, only 3 follow.
    mallory
        .stream
        .write_all(&[0x00, 0x0A, b'a', b'b', b'c'])
        .expect("send truncated frame");
    drop(mallory);

    alice.list_until(|l| l.contains("mallory   : offline"));

    alice.send("unaffected");
    assert_eq!(bob.recv(), "alice: unaffected");
}

#[test]
fn connection_closed_before_handshake_registers_nothing() {
    let (addr, _handle) = start_server();

    let early_leaver = TcpStream::connect(addr).expect("connect");
    drop(early_leaver);

    let mut alice = TestClient::connect(addr, "alice");
    let listing = alice.list_until(|l| l.contains("alice"));
    assert_eq!(listing, "alice     : online\n");
}

#[test]
fn nickname_collision_evicts_the_previous_connection() {
    let (addr, _handle) = start_server();

    let mut first = TestClient::connect(addr, "alice");
    first.list_until(|l| l.contains("alice"));

    let mut second = TestClient::connect(addr, "alice");
    let listing = second.list_until(|l| l.contains("alice"));
    assert_eq!(listing, "alice     : online\n");

    // The displaced connection sees its stream close.
    assert!(codec::decode(&mut first.stream).is_err());

    // The surviving connection still receives traffic.
    let mut bob = TestClient::connect(addr, "bob");
    bob.list_until(|l| l.contains("alice") && l.contains("bob"));
    bob.send("hello again");
    assert_eq!(second.recv(), "bob: hello again");
}

#[test]
fn stop_shuts_both_threads_down() {
    let (addr, handle) = start_server();

    let mut alice = TestClient::connect(addr, "alice");
    alice.list_until(|l| l.contains("alice"));

    handle.stop();

    // The reactor is gone: the connection eventually reads EOF or errors.
    alice.stream.set_read_timeout(Some(RECV_TIMEOUT)).unwrap();
    assert!(codec::decode(&mut alice.stream).is_err());
}
