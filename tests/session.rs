//! End-to-end session tests against a scripted server on a loopback
//! socket: registration, PING/PONG, welcome joins, nick collision,
//! flood cooldown, read timeout, and orderly disconnect.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};

use irc_client::{
    connect, start, Disconnect, EventHandler, EventKind, InstanceConfig, IrcState, Message,
};

/// The server side of one scripted connection.
struct ServerConn {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl ServerConn {
    async fn accept(listener: &TcpListener) -> Self {
        let (socket, _) = listener.accept().await.expect("accept failed");
        let (read, write) = socket.into_split();
        Self {
            reader: BufReader::new(read),
            writer: write,
        }
    }

    /// Next parsed line from the client, or `None` on EOF.
    async fn recv(&mut self) -> Option<Message> {
        loop {
            let mut line = String::new();
            let n = timeout(Duration::from_secs(5), self.reader.read_line(&mut line))
                .await
                .expect("timed out waiting for a client line")
                .expect("read failed");
            if n == 0 {
                return None;
            }
            if let Some(msg) = Message::parse(&line) {
                return Some(msg);
            }
        }
    }

    async fn expect(&mut self, command: &str) -> Message {
        let msg = self.recv().await.unwrap_or_else(|| {
            panic!("connection closed while waiting for {command}")
        });
        assert_eq!(msg.command, command, "unexpected client line: {msg}");
        msg
    }

    /// Consume the client's registration burst (NICK then USER).
    async fn expect_registration(&mut self, nick: &str) {
        let msg = self.expect("NICK").await;
        assert_eq!(msg.params, vec![nick.to_string()]);
        let msg = self.expect("USER").await;
        assert_eq!(msg.params.first().map(String::as_str), Some("irc-client"));
    }

    async fn send_line(&mut self, line: &str) {
        self.writer
            .write_all(format!("{line}\r\n").as_bytes())
            .await
            .expect("server write failed");
    }
}

struct Session {
    state: Arc<IrcState<()>>,
    conn: ServerConn,
    done: tokio::task::JoinHandle<()>,
    causes: mpsc::UnboundedReceiver<Option<Disconnect>>,
}

/// Spin up a listener and a client session pointed at it; returns once
/// the client has registered.
async fn scripted_session(
    nick: &str,
    channels: &[&str],
    cooldown: Duration,
    read_timeout: Option<Duration>,
) -> Session {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind failed");
    let port = listener.local_addr().expect("local_addr failed").port();

    let (cause_tx, causes) = mpsc::unbounded_channel();
    let mut cconf = connect("127.0.0.1", port, cooldown).with_on_disconnect(
        move |_, cause| {
            let cause_tx = cause_tx.clone();
            async move {
                let _ = cause_tx.send(cause);
                Ok(())
            }
        },
    );
    if let Some(read_timeout) = read_timeout {
        cconf.read_timeout = read_timeout;
    }

    let mut iconf = InstanceConfig::new(nick);
    iconf.channels = channels.iter().map(|c| c.to_string()).collect();

    let state = IrcState::new(cconf, iconf, ());
    let done = tokio::spawn(start(Arc::clone(&state)));

    let mut conn = ServerConn::accept(&listener).await;
    conn.expect_registration(nick).await;

    Session {
        state,
        conn,
        done,
        causes,
    }
}

#[tokio::test]
async fn ping_is_answered_with_pong() {
    let mut s = scripted_session("alice", &[], Duration::ZERO, None).await;

    s.conn.send_line("PING :tolsun.oulu.fi").await;
    let pong = s.conn.expect("PONG").await;
    assert_eq!(pong.params, vec!["tolsun.oulu.fi".to_string()]);

    s.state.disconnect().await;
    s.done.await.unwrap();
}

#[tokio::test]
async fn welcome_joins_channels_in_order() {
    let mut s = scripted_session("alice", &["#a", "#b"], Duration::ZERO, None).await;

    s.conn.send_line(":srv 001 alice :Welcome to the network").await;
    let join = s.conn.expect("JOIN").await;
    assert_eq!(join.params, vec!["#a".to_string()]);
    let join = s.conn.expect("JOIN").await;
    assert_eq!(join.params, vec!["#b".to_string()]);

    s.state.disconnect().await;
    s.done.await.unwrap();
}

#[tokio::test]
async fn nick_collision_triggers_a_mangled_renick() {
    let mut s = scripted_session("alice", &[], Duration::ZERO, None).await;

    s.conn.send_line(":srv 433 * alice :Nickname is already in use").await;
    let nick = s.conn.expect("NICK").await;
    assert_eq!(nick.params, vec!["al1ce".to_string()]);
    assert_eq!(s.state.nick(), "al1ce");

    s.state.disconnect().await;
    s.done.await.unwrap();
}

#[tokio::test]
async fn sends_are_ordered_and_spaced_by_the_cooldown() {
    let cooldown = Duration::from_millis(100);
    let mut s = scripted_session("alice", &[], cooldown, None).await;

    for i in 0..4 {
        s.state
            .send(Message::privmsg("#c", &format!("m{i}")))
            .await
            .unwrap();
    }

    let mut arrivals = Vec::new();
    for i in 0..4 {
        let msg = s.conn.expect("PRIVMSG").await;
        assert_eq!(msg.params[1], format!("m{i}"), "sends must stay in order");
        arrivals.push(Instant::now());
    }
    for pair in arrivals.windows(2) {
        let gap = pair[1] - pair[0];
        assert!(
            gap >= Duration::from_millis(80),
            "adjacent writes only {gap:?} apart"
        );
    }

    s.state.disconnect().await;
    s.done.await.unwrap();
}

#[tokio::test]
async fn disconnect_quits_drains_and_reports_clean() {
    let mut s = scripted_session("alice", &[], Duration::ZERO, None).await;

    s.state.disconnect().await;
    let quit = s.conn.expect("QUIT").await;
    assert!(quit.params.is_empty());
    assert!(s.conn.recv().await.is_none(), "client should close the socket");

    s.done.await.unwrap();
    assert!(s.state.is_disconnected());
    assert!(matches!(s.causes.recv().await, Some(None)));

    // The queue is closed: later sends fail, and disconnecting again is
    // a no-op.
    assert!(s.state.send(Message::privmsg("#c", "late")).await.is_err());
    s.state.disconnect().await;
}

#[tokio::test]
async fn ignored_sources_still_update_bookkeeping() {
    let mut s = scripted_session("alice", &["#c"], Duration::ZERO, None).await;
    s.state.ignore("op", Some("#c"));

    // A user handler on the same kind must be suppressed for the
    // ignored source.
    s.state.add_handler(EventHandler::new(
        EventKind::Kick,
        |state, event| async move {
            state.reply(&event, "noticed that").await?;
            Ok(())
        },
    ));

    s.conn.send_line(":op!o@h KICK #c alice :begone").await;

    // The membership tracking still ran: #c drops out of the list.
    let deadline = Instant::now() + Duration::from_secs(2);
    while !s.state.channels().is_empty() {
        assert!(
            Instant::now() < deadline,
            "kick bookkeeping did not run for an ignored source"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // The user handler did not: the next client line is the QUIT, not
    // a PRIVMSG.
    s.state.disconnect().await;
    s.conn.expect("QUIT").await;
    s.done.await.unwrap();
}

#[tokio::test]
async fn read_timeout_ends_the_session() {
    let mut s = scripted_session(
        "alice",
        &[],
        Duration::ZERO,
        Some(Duration::from_millis(200)),
    )
    .await;

    // Say nothing and let the reader give up.
    s.done.await.unwrap();
    assert!(s.state.is_disconnected());
    assert!(matches!(
        s.causes.recv().await,
        Some(Some(Disconnect::Timeout))
    ));
    assert!(s.conn.recv().await.is_none());
}

#[tokio::test]
async fn failed_establishment_reports_a_transport_cause() {
    // Grab a port, then close the listener so the connect is refused.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let (cause_tx, mut causes) = mpsc::unbounded_channel();
    let cconf = connect("127.0.0.1", port, Duration::ZERO).with_on_disconnect(
        move |_, cause| {
            let cause_tx = cause_tx.clone();
            async move {
                let _ = cause_tx.send(cause);
                Ok(())
            }
        },
    );

    let state = IrcState::new(cconf, InstanceConfig::new("alice"), ());
    start(Arc::clone(&state)).await;

    assert!(state.is_disconnected());
    assert!(matches!(
        causes.recv().await,
        Some(Some(Disconnect::Transport(_)))
    ));
}
