//! End-to-end client tests against a scripted IRC server on localhost.
//!
//! Each test binds a `TcpListener`, points a `Client` at it, and reads what
//! the client writes line by line. Reconnects are exercised by dropping the
//! accepted socket and accepting again.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

use ircord_sdk::{Client, ClientConfig, ConnectionState, Error, Message};

/// How long to wait for anything before considering the test failed.
const TIMEOUT: Duration = Duration::from_secs(10);

// ── Helpers ──────────────────────────────────────────────────────

struct FakeServer {
    listener: TcpListener,
}

impl FakeServer {
    async fn bind() -> Self {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        Self { listener }
    }

    /// A listener whose accepted sockets advertise a tiny receive window, so
    /// a peer that stops reading stalls the client's writer quickly.
    async fn bind_small_window() -> Self {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let socket = TcpSocket::new_v4().unwrap();
        socket.set_recv_buffer_size(4096).unwrap();
        socket.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        Self {
            listener: socket.listen(16).unwrap(),
        }
    }

    fn port(&self) -> u16 {
        self.listener.local_addr().unwrap().port()
    }

    fn config(&self, backoff: Duration) -> ClientConfig {
        ClientConfig {
            backoff,
            quit_grace: Duration::from_secs(2),
            ..ClientConfig::new("bot", "127.0.0.1", self.port(), false)
        }
    }

    async fn accept(&self) -> Peer {
        let (stream, _) = timeout(TIMEOUT, self.listener.accept())
            .await
            .expect("Timeout waiting for client to connect")
            .unwrap();
        let (reader, writer) = stream.into_split();
        Peer {
            reader: BufReader::new(reader),
            writer,
        }
    }
}

/// The server's side of one client connection.
struct Peer {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Peer {
    /// Next message from the client, or `None` at EOF.
    async fn next(&mut self) -> Option<Message> {
        let mut line = String::new();
        let n = timeout(TIMEOUT, self.reader.read_line(&mut line))
            .await
            .expect("Timeout waiting for a line from the client")
            .unwrap();
        if n == 0 {
            return None;
        }
        Some(Message::parse(&line).unwrap_or_else(|e| panic!("client sent bad line {line:?}: {e}")))
    }

    async fn expect(&mut self, command: &str, params: &[&str]) {
        let msg = self.next().await.unwrap_or_else(|| panic!("EOF waiting for {command}"));
        assert_eq!(msg.command, command, "unexpected message {msg}");
        assert_eq!(msg.params, params, "unexpected params on {msg}");
    }

    async fn expect_registration(&mut self) {
        self.expect("NICK", &["bot"]).await;
        self.expect("USER", &["bot", "0", "*", "bot"]).await;
    }

    async fn send(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
    }
}

async fn wait_state<F: Fn(&ConnectionState) -> bool>(
    rx: &mut watch::Receiver<ConnectionState>,
    predicate: F,
    desc: &str,
) {
    timeout(TIMEOUT, rx.wait_for(|s| predicate(s)))
        .await
        .unwrap_or_else(|_| panic!("Timeout waiting for state: {desc}"))
        .unwrap();
}

// ── Tests ────────────────────────────────────────────────────────

#[tokio::test]
async fn registers_on_start() {
    let server = FakeServer::bind().await;
    let client = Client::new(server.config(Duration::from_secs(10)));
    client.start().await.unwrap();

    let mut peer = server.accept().await;
    peer.expect_registration().await;
    assert!(client.state().is_connected());

    client.close().await.unwrap();
}

#[tokio::test]
async fn ping_is_answered_without_reaching_handlers() {
    let server = FakeServer::bind().await;
    let client = Client::new(server.config(Duration::from_secs(10)));
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    client
        .add_handler(move |msg: &Message| {
            let _ = seen_tx.send(msg.clone());
        })
        .await
        .unwrap();
    client.start().await.unwrap();

    let mut peer = server.accept().await;
    peer.expect_registration().await;

    peer.send("PING :tok en 42\r\n").await;
    peer.expect("PONG", &["tok en 42"]).await;

    peer.send(":alice!a@h PRIVMSG #c :after ping\r\n").await;
    let seen = timeout(TIMEOUT, seen_rx.recv()).await.unwrap().unwrap();
    assert_eq!(seen.command, "PRIVMSG", "PING must not reach handlers");
    assert_eq!(seen.params, vec!["#c", "after ping"]);

    // Exactly one PONG: the next thing on the wire is our own message.
    client.message("#c", "marker").await.unwrap();
    peer.expect("PRIVMSG", &["#c", "marker"]).await;

    client.close().await.unwrap();
}

#[tokio::test]
async fn handlers_run_in_registration_order() {
    let server = FakeServer::bind().await;
    let client = Client::new(server.config(Duration::from_secs(10)));
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();

    for id in 1..=2 {
        let seen_tx = seen_tx.clone();
        client
            .add_handler(move |msg: &Message| {
                let _ = seen_tx.send((id, msg.params.last().cloned().unwrap_or_default()));
            })
            .await
            .unwrap();
    }
    client.start().await.unwrap();

    // Added after start: goes through the event loop, still appended last.
    client
        .handle()
        .add_handler(move |msg: &Message| {
            let _ = seen_tx.send((3, msg.params.last().cloned().unwrap_or_default()));
        })
        .await
        .unwrap();

    let mut peer = server.accept().await;
    peer.expect_registration().await;
    peer.send(":a!a@h PRIVMSG #c :one\r\n:b!b@h PRIVMSG #c :two\r\n").await;

    let mut seen = Vec::new();
    for _ in 0..6 {
        seen.push(timeout(TIMEOUT, seen_rx.recv()).await.unwrap().unwrap());
    }
    let want: Vec<(i32, String)> = [(1, "one"), (2, "one"), (3, "one"), (1, "two"), (2, "two"), (3, "two")]
        .into_iter()
        .map(|(id, text)| (id, text.to_string()))
        .collect();
    assert_eq!(seen, want);

    client.close().await.unwrap();
}

#[tokio::test]
async fn reconnect_replays_registration_and_joins() {
    let server = FakeServer::bind().await;
    let client = Client::new(server.config(Duration::from_millis(50)));
    let mut state = client.handle().subscribe_state();
    client.start().await.unwrap();

    let mut first = server.accept().await;
    first.expect_registration().await;
    for channel in ["#a", "#b", "#a"] {
        client.join(channel).await.unwrap();
    }
    first.expect("JOIN", &["#a"]).await;
    first.expect("JOIN", &["#b"]).await;
    first.expect("JOIN", &["#a"]).await;

    drop(first);
    wait_state(&mut state, |s| !s.is_connected(), "disconnected").await;

    let mut second = server.accept().await;
    second.expect_registration().await;
    second.expect("JOIN", &["#a"]).await;
    second.expect("JOIN", &["#b"]).await;
    second.expect("JOIN", &["#a"]).await;
    wait_state(
        &mut state,
        |s| *s == ConnectionState::Connected { generation: 2 },
        "connected again",
    )
    .await;

    client.message("#a", "back").await.unwrap();
    second.expect("PRIVMSG", &["#a", "back"]).await;

    client.close().await.unwrap();
}

#[tokio::test]
async fn commands_while_disconnected_are_held_not_dropped() {
    let server = FakeServer::bind().await;
    let client = Client::new(server.config(Duration::from_millis(300)));
    let mut state = client.handle().subscribe_state();
    client.start().await.unwrap();

    let mut first = server.accept().await;
    first.expect_registration().await;
    drop(first);
    wait_state(&mut state, |s| *s == ConnectionState::Disconnected, "disconnected").await;

    client.join("#late").await.unwrap();
    client.message("#late", "queued while down").await.unwrap();

    let mut second = server.accept().await;
    second.expect_registration().await;
    second.expect("JOIN", &["#late"]).await;
    second.expect("PRIVMSG", &["#late", "queued while down"]).await;

    // The join was carried by the replay only, never sent twice.
    client.message("#late", "marker").await.unwrap();
    second.expect("PRIVMSG", &["#late", "marker"]).await;

    client.close().await.unwrap();
}

#[tokio::test]
async fn quit_is_the_last_line_written() {
    let server = FakeServer::bind().await;
    let client = Client::new(server.config(Duration::from_secs(10)));
    let mut state = client.handle().subscribe_state();
    client.start().await.unwrap();

    let mut peer = server.accept().await;
    peer.expect_registration().await;

    client.message("#c", "one").await.unwrap();
    client.quit("bye now").await.unwrap();
    // May be refused or silently never processed; it must not hit the wire.
    let _ = client.message("#c", "two").await;

    peer.expect("PRIVMSG", &["#c", "one"]).await;
    peer.expect("QUIT", &["bye now"]).await;
    assert!(peer.next().await.is_none(), "nothing may follow QUIT");

    wait_state(&mut state, |s| *s == ConnectionState::Stopped, "stopped").await;
    assert!(matches!(client.message("#c", "three").await, Err(Error::Closed)));
    client.close().await.unwrap();
}

#[tokio::test]
async fn close_is_clean_and_idempotent() {
    let server = FakeServer::bind().await;
    let client = Client::new(server.config(Duration::from_secs(10)));
    let handle = client.handle();
    client.start().await.unwrap();

    let mut peer = server.accept().await;
    peer.expect_registration().await;

    timeout(TIMEOUT, client.close()).await.unwrap().unwrap();
    assert!(peer.next().await.is_none(), "socket should be closed");
    assert_eq!(client.state(), ConnectionState::Stopped);

    timeout(TIMEOUT, client.close()).await.unwrap().unwrap();
    assert!(matches!(handle.join("#c").await, Err(Error::Closed)));
    assert!(matches!(client.start().await, Err(Error::Closed)));
}

#[tokio::test]
async fn close_interrupts_backoff() {
    let server = FakeServer::bind().await;
    let client = Client::new(server.config(Duration::from_secs(3600)));
    let mut state = client.handle().subscribe_state();
    client.start().await.unwrap();

    let peer = server.accept().await;
    drop(peer);
    wait_state(&mut state, |s| *s == ConnectionState::Disconnected, "disconnected").await;

    timeout(Duration::from_secs(2), client.close())
        .await
        .expect("close() must not wait out the backoff")
        .unwrap();
}

#[tokio::test]
async fn start_reports_first_connect_failure() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let client = Client::new(ClientConfig::new("bot", "127.0.0.1", port, false));
    assert!(matches!(client.start().await, Err(Error::Connect { .. })));
    assert_eq!(client.state(), ConnectionState::Disconnected);
    client.close().await.unwrap();
}

#[tokio::test]
async fn start_rejects_bad_config_and_double_start() {
    let client = Client::new(ClientConfig::new("", "127.0.0.1", 6667, false));
    assert!(matches!(client.start().await, Err(Error::Config(_))));

    let server = FakeServer::bind().await;
    let client = Client::new(server.config(Duration::from_secs(10)));
    client.start().await.unwrap();
    assert!(matches!(client.start().await, Err(Error::AlreadyStarted)));
    client.close().await.unwrap();
}

#[tokio::test]
async fn quit_then_close_still_writes_quit() {
    let server = FakeServer::bind().await;
    let client = Client::new(server.config(Duration::from_secs(10)));
    client.start().await.unwrap();

    let mut peer = server.accept().await;
    peer.expect_registration().await;

    client.quit("bye").await.unwrap();
    timeout(TIMEOUT, client.close()).await.unwrap().unwrap();

    peer.expect("QUIT", &["bye"]).await;
    assert!(peer.next().await.is_none());
}

#[tokio::test]
async fn close_returns_when_peer_stops_reading() {
    let server = FakeServer::bind_small_window().await;
    let client = Client::new(server.config(Duration::from_secs(10)));
    let handle = client.handle();
    client.start().await.unwrap();

    let mut peer = server.accept().await;
    peer.expect_registration().await;

    // Fill socket buffers and queues until a send blocks: from then on the
    // writer is stuck mid-write on a peer that never reads.
    let text = "x".repeat(400);
    let mut stalled = false;
    for _ in 0..200_000 {
        if timeout(Duration::from_millis(200), handle.message("#c", &text))
            .await
            .is_err()
        {
            stalled = true;
            break;
        }
    }
    assert!(stalled, "writer never stalled");

    let _ = timeout(TIMEOUT, client.close())
        .await
        .expect("close() hung with a stalled peer");
    assert_eq!(client.state(), ConnectionState::Stopped);
    drop(peer);
}

#[tokio::test]
async fn close_while_message_waits_for_a_session() {
    let server = FakeServer::bind().await;
    let client = Client::new(server.config(Duration::from_secs(3600)));
    let mut state = client.handle().subscribe_state();
    client.start().await.unwrap();

    let peer = server.accept().await;
    drop(peer);
    wait_state(&mut state, |s| *s == ConnectionState::Disconnected, "disconnected").await;

    // Accepted by the event loop, which then blocks waiting for a session.
    client.message("#c", "never sent").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    timeout(Duration::from_secs(2), client.close())
        .await
        .expect("close() must not wait for a session")
        .unwrap();
    assert!(matches!(client.message("#c", "late").await, Err(Error::Closed)));
}
