//! Shared client state: the per-session state cells, the send queue, and
//! the helpers handlers use to read and mutate the running client.
//!
//! An [`IrcState`] is created once per session and shared by reference
//! (`Arc`) with every handler invocation. The three cells (connection
//! state, instance config, user state) are independent; each read is a
//! point-in-time snapshot and each write is an atomic replace-or-modify.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{mpsc, watch};

use crate::client::ConnectionConfig;
use crate::error::{Disconnect, SendError};
use crate::event::{Event, EventKind, Source};
use crate::irc::{self, Message};

/// Capacity of the outbound send queue. Producers block when it is full.
pub(crate) const SEND_QUEUE_CAPACITY: usize = 16;

/// A single atomic mutable cell.
///
/// `get`, `set`, and `modify` are linearisable; `modify` runs its function
/// under the cell's lock, so read-then-write sequences inside it cannot
/// interleave with other writers.
pub struct StateCell<T> {
    inner: Mutex<T>,
}

impl<T> StateCell<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, T> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the value.
    pub fn set(&self, value: T) {
        *self.lock() = value;
    }

    /// Run a function against a borrow of the value.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.lock())
    }

    /// Atomically read, transform, and write the value.
    pub fn modify(&self, f: impl FnOnce(&mut T)) {
        f(&mut self.lock());
    }

    /// Like [`modify`](Self::modify), but returns a value computed under
    /// the lock.
    pub fn snapshot_modify<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut self.lock())
    }
}

impl<T: Clone> StateCell<T> {
    /// Take a point-in-time snapshot of the value.
    pub fn get(&self) -> T {
        self.lock().clone()
    }
}

/// Phase of the connection state machine.
///
/// Strictly monotonic forward per session:
/// Disconnected → Connected → Disconnecting → Disconnected (terminal).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
    Disconnecting,
}

/// The boxed future an event handler action produces.
pub type HandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

type HandlerAction<S> =
    Arc<dyn Fn(Arc<IrcState<S>>, Event) -> HandlerFuture + Send + Sync>;

/// An event handler: a kind selector plus an action.
///
/// Handlers whose selector equals an incoming event's kind are spawned
/// concurrently by the dispatcher; the action receives the shared state
/// and the event.
pub struct EventHandler<S> {
    pub kind: EventKind,
    /// Whether this handler still runs for events whose source is on the
    /// ignore list. Off by default; the default handlers that track
    /// internal state (channel membership, nick negotiation) turn it on,
    /// since that state must follow reality even for ignored users.
    pub run_when_ignored: bool,
    action: HandlerAction<S>,
}

impl<S> EventHandler<S> {
    pub fn new<F, Fut>(kind: EventKind, action: F) -> Self
    where
        F: Fn(Arc<IrcState<S>>, Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            kind,
            run_when_ignored: false,
            action: Arc::new(move |state, event| Box::pin(action(state, event))),
        }
    }

    /// Keep running this handler for ignored sources, builder-style.
    pub fn run_when_ignored(mut self) -> Self {
        self.run_when_ignored = true;
        self
    }

    /// Whether this handler matches an event of `kind`.
    pub fn matches(&self, kind: EventKind) -> bool {
        self.kind == kind
    }

    /// Invoke the handler's action.
    pub fn call(&self, state: Arc<IrcState<S>>, event: Event) -> HandlerFuture {
        (self.action)(state, event)
    }
}

impl<S> Clone for EventHandler<S> {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            run_when_ignored: self.run_when_ignored,
            action: Arc::clone(&self.action),
        }
    }
}

/// The mutable per-instance configuration, held in a state cell.
pub struct InstanceConfig<S> {
    /// Our current nick, as last negotiated with the server.
    pub nick: String,
    /// Channels to join on welcome; kept current by the default handlers.
    pub channels: Vec<String>,
    /// The version string reported to CTCP VERSION queries.
    pub version: String,
    /// Ordered handler list. Insertion is at the head.
    pub handlers: Vec<EventHandler<S>>,
    /// Ignored users: `(nick, None)` ignores globally, `(nick, Some(chan))`
    /// only in that channel.
    pub ignore: Vec<(String, Option<String>)>,
}

impl<S: Send + Sync + 'static> InstanceConfig<S> {
    /// A config with the default handler set installed and the default
    /// version string.
    pub fn new(nick: impl Into<String>) -> Self {
        Self {
            nick: nick.into(),
            channels: Vec::new(),
            version: concat!(env!("CARGO_PKG_NAME"), "-", env!("CARGO_PKG_VERSION"))
                .to_string(),
            handlers: crate::handlers::default_handlers(),
            ignore: Vec::new(),
        }
    }
}

impl<S> Clone for InstanceConfig<S> {
    fn clone(&self) -> Self {
        Self {
            nick: self.nick.clone(),
            channels: self.channels.clone(),
            version: self.version.clone(),
            handlers: self.handlers.clone(),
            ignore: self.ignore.clone(),
        }
    }
}

/// An outbound queue entry: a structured message, or a pre-formed line.
pub(crate) enum Outbound {
    Msg(Message),
    Raw(String),
}

impl Outbound {
    pub(crate) fn into_line(self) -> String {
        match self {
            Outbound::Msg(msg) => msg.to_string(),
            Outbound::Raw(line) => line,
        }
    }
}

/// The shared state of one client session.
///
/// Constructed once per session with [`IrcState::new`]; not re-usable after
/// [`start`](crate::client::start) returns.
pub struct IrcState<S> {
    config: ConnectionConfig<S>,
    instance: StateCell<InstanceConfig<S>>,
    conn_state: StateCell<ConnectionState>,
    user_state: StateCell<S>,
    out_tx: mpsc::Sender<Outbound>,
    out_rx: Mutex<Option<mpsc::Receiver<Outbound>>>,
    shutdown: watch::Sender<bool>,
    cause: Mutex<Option<Disconnect>>,
    pub(crate) started: AtomicBool,
}

impl<S: Send + Sync + 'static> IrcState<S> {
    pub fn new(
        config: ConnectionConfig<S>,
        instance: InstanceConfig<S>,
        user_state: S,
    ) -> Arc<Self> {
        let (out_tx, out_rx) = mpsc::channel(SEND_QUEUE_CAPACITY);
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            config,
            instance: StateCell::new(instance),
            conn_state: StateCell::new(ConnectionState::Disconnected),
            user_state: StateCell::new(user_state),
            out_tx,
            out_rx: Mutex::new(Some(out_rx)),
            shutdown,
            cause: Mutex::new(None),
            started: AtomicBool::new(false),
        })
    }

    /// The immutable connection configuration.
    pub fn config(&self) -> &ConnectionConfig<S> {
        &self.config
    }

    /// The instance-config cell.
    pub fn instance(&self) -> &StateCell<InstanceConfig<S>> {
        &self.instance
    }

    /// The user-state cell.
    pub fn user_state(&self) -> &StateCell<S> {
        &self.user_state
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.conn_state.get()
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    pub fn is_disconnecting(&self) -> bool {
        self.connection_state() == ConnectionState::Disconnecting
    }

    pub fn is_disconnected(&self) -> bool {
        self.connection_state() == ConnectionState::Disconnected
    }

    /// Our current nick.
    pub fn nick(&self) -> String {
        self.instance.with(|ic| ic.nick.clone())
    }

    /// The current channel list.
    pub fn channels(&self) -> Vec<String> {
        self.instance.with(|ic| ic.channels.clone())
    }

    /// The version string reported to CTCP VERSION.
    pub fn version(&self) -> String {
        self.instance.with(|ic| ic.version.clone())
    }

    /// One atomic observation of all three cells.
    ///
    /// Cells are locked in a fixed order (connection state, instance,
    /// user state); this is the only place multiple cell locks are held
    /// at once.
    pub fn snapshot(&self) -> (ConnectionState, InstanceConfig<S>, S)
    where
        S: Clone,
    {
        self.conn_state.with(|cs| {
            self.instance
                .with(|ic| self.user_state.with(|us| (*cs, ic.clone(), us.clone())))
        })
    }

    /// Enqueue a message for sending.
    ///
    /// Blocks while the queue is full (capacity
    /// [`SEND_QUEUE_CAPACITY`]); fails once the session has left the
    /// Connected phase.
    pub async fn send(&self, msg: Message) -> Result<(), SendError> {
        self.enqueue(Outbound::Msg(msg)).await
    }

    /// Enqueue a pre-formed line, bypassing message construction.
    pub async fn send_raw(&self, line: impl Into<String>) -> Result<(), SendError> {
        self.enqueue(Outbound::Raw(line.into())).await
    }

    async fn enqueue(&self, out: Outbound) -> Result<(), SendError> {
        if !self.is_connected() {
            return Err(SendError::NotConnected);
        }
        self.out_tx
            .send(out)
            .await
            .map_err(|_| SendError::NotConnected)
    }

    /// Initiate an orderly shutdown: enqueue a QUIT, close the send queue,
    /// and flip the state to Disconnecting. Queued messages are still
    /// flushed. Idempotent.
    pub async fn disconnect(&self) {
        if !self.is_connected() {
            return;
        }
        let _ = self.send(Message::quit(None)).await;
        self.begin_disconnect(None);
    }

    /// Update the nick cell and send exactly one `NICK` message.
    pub async fn set_nick(&self, nick: &str) -> Result<(), SendError> {
        self.instance.modify(|ic| ic.nick = nick.to_string());
        self.send(Message::nick(nick)).await
    }

    /// Part from a channel and drop it from the channel list.
    pub async fn leave_channel(
        &self,
        channel: &str,
        reason: Option<&str>,
    ) -> Result<(), SendError> {
        self.instance.modify(|ic| ic.channels.retain(|c| c != channel));
        self.send(Message::part(channel, reason)).await
    }

    /// Install a handler at the head of the handler list.
    pub fn add_handler(&self, handler: EventHandler<S>) {
        self.instance.modify(|ic| ic.handlers.insert(0, handler));
    }

    /// Send a PRIVMSG back to where an event came from: its channel, or
    /// the user who sent it. Server events have no reply target.
    pub async fn reply(&self, event: &Event, text: &str) -> Result<(), SendError> {
        match &event.source {
            Source::Channel { name, .. } => self.send(Message::privmsg(name, text)).await,
            Source::User(nick) => self.send(Message::privmsg(nick, text)).await,
            Source::Server => Ok(()),
        }
    }

    /// Send a CTCP query (a CTCP-encoded PRIVMSG).
    pub async fn ctcp(
        &self,
        target: &str,
        verb: &str,
        args: &[&str],
    ) -> Result<(), SendError> {
        self.send(Message::privmsg(target, &irc::to_ctcp(verb, args)))
            .await
    }

    /// Send a CTCP reply (a CTCP-encoded NOTICE).
    pub async fn ctcp_reply(
        &self,
        target: &str,
        verb: &str,
        args: &[&str],
    ) -> Result<(), SendError> {
        self.send(Message::notice(target, &irc::to_ctcp(verb, args)))
            .await
    }

    /// Ignore a user, globally (`channel: None`) or in one channel.
    /// Adding the same entry twice has the same effect as once.
    pub fn ignore(&self, nick: &str, channel: Option<&str>) {
        let entry = (nick.to_string(), channel.map(|c| c.to_string()));
        self.instance.modify(|ic| {
            if !ic.ignore.contains(&entry) {
                ic.ignore.push(entry);
            }
        });
    }

    /// Remove an ignore-list entry.
    pub fn unignore(&self, nick: &str, channel: Option<&str>) {
        let entry = (nick.to_string(), channel.map(|c| c.to_string()));
        self.instance.modify(|ic| ic.ignore.retain(|e| *e != entry));
    }

    /// Whether an event from `source` is suppressed by the ignore list.
    pub(crate) fn is_ignored(&self, source: &Source) -> bool {
        let (nick, channel) = match source {
            Source::User(nick) => (nick, None),
            Source::Channel {
                name,
                user: Some(nick),
            } => (nick, Some(name)),
            _ => return false,
        };
        self.instance.with(|ic| {
            ic.ignore.iter().any(|(n, c)| {
                n == nick && (c.is_none() || c.as_deref() == channel.map(String::as_str))
            })
        })
    }

    pub(crate) fn mark_connected(&self) -> bool {
        self.conn_state.snapshot_modify(|st| {
            if *st == ConnectionState::Disconnected {
                *st = ConnectionState::Connected;
                true
            } else {
                false
            }
        })
    }

    /// Flip Connected → Disconnecting, recording the first cause and
    /// signalling the session tasks. Returns false if already past
    /// Connected.
    pub(crate) fn begin_disconnect(&self, cause: Option<Disconnect>) -> bool {
        let transitioned = self.conn_state.snapshot_modify(|st| {
            if *st == ConnectionState::Connected {
                *st = ConnectionState::Disconnecting;
                true
            } else {
                false
            }
        });
        if transitioned {
            if let Some(cause) = cause {
                let mut slot = self.cause.lock().unwrap_or_else(PoisonError::into_inner);
                if slot.is_none() {
                    *slot = Some(cause);
                }
            }
            let _ = self.shutdown.send_replace(true);
        }
        transitioned
    }

    pub(crate) fn mark_disconnected(&self) -> bool {
        self.conn_state.snapshot_modify(|st| {
            if *st == ConnectionState::Disconnecting {
                *st = ConnectionState::Disconnected;
                true
            } else {
                false
            }
        })
    }

    pub(crate) fn take_cause(&self) -> Option<Disconnect> {
        self.cause
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub(crate) fn take_out_rx(&self) -> Option<mpsc::Receiver<Outbound>> {
        self.out_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub(crate) fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }
}
