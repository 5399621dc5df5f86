//! IRC message types — the wire codec adapter.
//!
//! A minimal parser/formatter for IRC protocol lines (RFC 1459/2812),
//! plus the CTCP sub-encoding carried inside PRIVMSG and NOTICE payloads.

use std::fmt;

/// The CTCP delimiter character (`\x01`).
const CTCP_DELIM: char = '\x01';

/// A parsed IRC message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// `:server` or `:nick!user@host`, without the leading colon.
    pub prefix: Option<String>,
    pub command: String,
    pub params: Vec<String>,
}

impl Message {
    /// Parse a raw IRC line. Returns `None` for empty or malformed lines.
    ///
    /// The grammar has three layers: an optional `:`-led prefix, then
    /// space-separated command and middle parameters, then an optional
    /// trailing parameter introduced by ` :` which runs to the end of
    /// the line and may contain anything.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim_end_matches(['\r', '\n']);

        let (prefix, body) = match line.strip_prefix(':') {
            Some(rest) => {
                let (prefix, body) = rest.split_once(' ')?;
                (Some(prefix.to_string()), body)
            }
            None => (None, line),
        };

        let (middle, trailing) = match body.split_once(" :") {
            Some((middle, trailing)) => (middle, Some(trailing)),
            None => (body, None),
        };

        let mut words = middle.split(' ').filter(|w| !w.is_empty());
        let command = words.next()?.to_ascii_uppercase();
        let mut params: Vec<String> = words.map(str::to_string).collect();
        params.extend(trailing.map(str::to_string));

        Some(Message {
            prefix,
            command,
            params,
        })
    }

    pub fn new(command: &str, params: Vec<&str>) -> Self {
        Self {
            prefix: None,
            command: command.to_string(),
            params: params.into_iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn privmsg(target: &str, text: &str) -> Self {
        Self::new("PRIVMSG", vec![target, text])
    }

    pub fn notice(target: &str, text: &str) -> Self {
        Self::new("NOTICE", vec![target, text])
    }

    pub fn join(channel: &str) -> Self {
        Self::new("JOIN", vec![channel])
    }

    pub fn part(channel: &str, reason: Option<&str>) -> Self {
        match reason {
            Some(r) => Self::new("PART", vec![channel, r]),
            None => Self::new("PART", vec![channel]),
        }
    }

    pub fn nick(nick: &str) -> Self {
        Self::new("NICK", vec![nick])
    }

    pub fn pong(token: &str) -> Self {
        Self::new("PONG", vec![token])
    }

    pub fn quit(reason: Option<&str>) -> Self {
        match reason {
            Some(r) => Self::new("QUIT", vec![r]),
            None => Self::new("QUIT", vec![]),
        }
    }

    /// Attach a prefix, builder-style.
    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.prefix = Some(prefix.to_string());
        self
    }

    /// The numeric reply code, if the command is a three-digit numeric.
    pub fn numeric(&self) -> Option<u16> {
        if self.command.len() == 3 && self.command.bytes().all(|b| b.is_ascii_digit()) {
            self.command.parse().ok()
        } else {
            None
        }
    }

    /// The nick portion of a `nick!user@host` prefix.
    pub fn source_nick(&self) -> Option<&str> {
        let prefix = self.prefix.as_deref()?;
        if prefix.contains('!') {
            prefix.split('!').next()
        } else {
            None
        }
    }

    /// Decode the CTCP payload of a PRIVMSG or NOTICE, if there is one.
    pub fn ctcp(&self) -> Option<(String, Vec<String>)> {
        if self.command != "PRIVMSG" && self.command != "NOTICE" {
            return None;
        }
        from_ctcp(self.params.get(1)?)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(prefix) = &self.prefix {
            write!(f, ":{prefix} ")?;
        }
        f.write_str(&self.command)?;
        if let Some((last, middles)) = self.params.split_last() {
            for param in middles {
                write!(f, " {param}")?;
            }
            if needs_trailing_form(last) {
                write!(f, " :{last}")?;
            } else {
                write!(f, " {last}")?;
            }
        }
        Ok(())
    }
}

/// A final parameter must take the `:`-led trailing form when writing it
/// bare would be ambiguous on the wire.
fn needs_trailing_form(param: &str) -> bool {
    param.is_empty() || param.starts_with(':') || param.contains(' ')
}

/// Whether a PRIVMSG/NOTICE body is CTCP-encoded.
pub fn is_ctcp(body: &str) -> bool {
    body.starts_with(CTCP_DELIM)
}

/// Encode a CTCP verb and arguments into a message body.
pub fn to_ctcp(verb: &str, args: &[&str]) -> String {
    let mut body = String::with_capacity(verb.len() + 2);
    body.push(CTCP_DELIM);
    body.push_str(verb);
    for arg in args {
        body.push(' ');
        body.push_str(arg);
    }
    body.push(CTCP_DELIM);
    body
}

/// Decode a CTCP message body into its verb and arguments.
pub fn from_ctcp(body: &str) -> Option<(String, Vec<String>)> {
    let body = body.strip_prefix(CTCP_DELIM)?;
    let body = body.strip_suffix(CTCP_DELIM).unwrap_or(body);
    if body.is_empty() {
        return None;
    }
    let mut parts = body.split(' ');
    let verb = parts.next()?.to_string();
    let args = parts.map(|s| s.to_string()).collect();
    Some((verb, args))
}
