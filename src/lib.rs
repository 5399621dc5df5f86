//! Async IRC client library
//!
//! A client core for writing IRC bots and interactive clients: it owns the
//! socket (plaintext or TLS), parses and serialises wire messages, applies
//! flood-cooldown flow control on the outbound side, and dispatches
//! incoming events to concurrently-running handlers that share the client
//! state.
//!
//! # Modules
//!
//! - [`client`] — connection setup, TLS, and the session engine
//! - [`state`] — state cells, instance config, and the shared [`IrcState`]
//! - [`event`] — event kinds, sources, and message classification
//! - [`handlers`] — the default handler set (PING, CTCP, nick negotiation)
//! - [`irc`] — IRC message parsing/formatting and CTCP encoding
//! - [`logging`] — wire-log callbacks
//! - [`error`] — disconnect causes and send failures
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use irc_client::{connect, start, EventHandler, EventKind, InstanceConfig, IrcState};
//!
//! #[tokio::main]
//! async fn main() {
//!     let cconf = connect("irc.example.org", 6667, Duration::from_secs(1));
//!     let mut iconf = InstanceConfig::new("mybot");
//!     iconf.channels.push("#rust".to_string());
//!     iconf.handlers.insert(
//!         0,
//!         EventHandler::new(EventKind::Privmsg, |state, event| async move {
//!             if event.message.params.get(1).is_some_and(|t| t.contains("hello")) {
//!                 state.reply(&event, "hi!").await?;
//!             }
//!             Ok(())
//!         }),
//!     );
//!     start(IrcState::new(cconf, iconf, ())).await;
//! }
//! ```

pub mod client;
pub mod error;
pub mod event;
pub mod handlers;
pub mod irc;
pub mod logging;
pub mod state;

pub use client::{
    connect, connect_tls, connect_tls_with_config, connect_tls_with_verifier, run, start,
    ConnectAction, ConnectionConfig, Dialer, DisconnectAction,
};
pub use error::{Disconnect, SendError};
pub use event::{Event, EventKind, Source};
pub use irc::Message;
pub use logging::{file_logger, noop_logger, stdout_logger, Logger, Origin};
pub use state::{ConnectionState, EventHandler, InstanceConfig, IrcState, StateCell};
