//! Events dispatched to handlers, and how raw messages are classified.

use crate::irc::{self, Message};

/// The kind of an event, used to select which handlers run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Ping,
    Ctcp,
    Numeric,
    Privmsg,
    Notice,
    Join,
    Part,
    Quit,
    Mode,
    Topic,
    Invite,
    Kick,
    Nick,
    /// Anything not covered by a more specific kind.
    Raw,
}

impl EventKind {
    /// Classify a parsed message.
    ///
    /// A PRIVMSG or NOTICE whose body is CTCP-encoded classifies as
    /// [`EventKind::Ctcp`] rather than its carrier command.
    pub fn of(msg: &Message) -> EventKind {
        if msg.numeric().is_some() {
            return EventKind::Numeric;
        }
        match msg.command.as_str() {
            "PING" => EventKind::Ping,
            "PRIVMSG" | "NOTICE" => {
                let body = msg.params.get(1).map(String::as_str).unwrap_or("");
                if irc::is_ctcp(body) {
                    EventKind::Ctcp
                } else if msg.command == "PRIVMSG" {
                    EventKind::Privmsg
                } else {
                    EventKind::Notice
                }
            }
            "JOIN" => EventKind::Join,
            "PART" => EventKind::Part,
            "QUIT" => EventKind::Quit,
            "MODE" => EventKind::Mode,
            "TOPIC" => EventKind::Topic,
            "INVITE" => EventKind::Invite,
            "KICK" => EventKind::Kick,
            "NICK" => EventKind::Nick,
            _ => EventKind::Raw,
        }
    }
}

/// Where an event came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    /// The server itself (bare server prefix, or no prefix at all).
    Server,
    /// A user speaking in a channel.
    Channel {
        name: String,
        user: Option<String>,
    },
    /// A user addressing us directly.
    User(String),
}

impl Source {
    /// Extract the source from a message's prefix and first parameter.
    pub fn of(msg: &Message) -> Source {
        let Some(nick) = msg.source_nick() else {
            return Source::Server;
        };
        match msg.params.first() {
            Some(target) if target.starts_with('#') || target.starts_with('&') => {
                Source::Channel {
                    name: target.clone(),
                    user: Some(nick.to_string()),
                }
            }
            _ => Source::User(nick.to_string()),
        }
    }
}

/// A parsed inbound message together with its source and original bytes.
#[derive(Debug, Clone)]
pub struct Event {
    pub source: Source,
    pub message: Message,
    pub raw: String,
}

impl Event {
    pub(crate) fn from_message(message: Message, raw: String) -> Self {
        Self {
            source: Source::of(&message),
            message,
            raw,
        }
    }

    /// The kind this event classifies as.
    pub fn kind(&self) -> EventKind {
        EventKind::of(&self.message)
    }
}
