//! The default handler set.
//!
//! These nine handlers implement the mandatory client-side protocol
//! behaviour: PING replies, CTCP responses, nick negotiation, and channel
//! membership tracking. They are installed by
//! [`InstanceConfig::new`](crate::state::InstanceConfig::new) and are
//! individually replaceable: drop one from the handler list and install
//! your own with the same kind selector.

use chrono::Local;

use crate::event::{EventKind, Source};
use crate::irc::Message;
use crate::state::EventHandler;

/// Nick substitutions tried, in order, on a collision (433/436). The
/// first rule whose pattern occurs in the nick is applied to the first
/// occurrence only.
const SUBSTITUTIONS: &[(&str, &str)] = &[
    ("i", "1"),
    ("I", "1"),
    ("l", "1"),
    ("L", "1"),
    ("o", "0"),
    ("O", "0"),
    ("A", "4"),
    ("0", "1"),
    ("1", "2"),
    ("2", "3"),
    ("3", "4"),
    ("4", "5"),
    ("5", "6"),
    ("6", "7"),
    ("7", "8"),
    ("8", "9"),
    ("9", "-"),
];

/// The full default catalogue, in installation order.
pub fn default_handlers<S: Send + Sync + 'static>() -> Vec<EventHandler<S>> {
    vec![
        ping_handler(),
        ctcp_ping_handler(),
        ctcp_version_handler(),
        ctcp_time_handler(),
        welcome_nick(),
        join_on_welcome(),
        nick_mangler(),
        channel_tracker(),
        kick_handler(),
    ]
}

/// Reply to `PING` with a matching `PONG`.
pub fn ping_handler<S: Send + Sync + 'static>() -> EventHandler<S> {
    EventHandler::new(EventKind::Ping, |state, event| async move {
        let params = &event.message.params;
        if let Some(token) = params.get(1).or_else(|| params.first()) {
            state.send(Message::pong(token)).await?;
        }
        Ok(())
    })
}

/// Echo CTCP PING queries back with their arguments unchanged.
pub fn ctcp_ping_handler<S: Send + Sync + 'static>() -> EventHandler<S> {
    EventHandler::new(EventKind::Ctcp, |state, event| async move {
        let Source::User(nick) = &event.source else {
            return Ok(());
        };
        let Some((verb, args)) = event.message.ctcp() else {
            return Ok(());
        };
        if verb.eq_ignore_ascii_case("PING") {
            let args: Vec<&str> = args.iter().map(String::as_str).collect();
            state.ctcp_reply(nick, "PING", &args).await?;
        }
        Ok(())
    })
}

/// Answer CTCP VERSION with the configured version string.
pub fn ctcp_version_handler<S: Send + Sync + 'static>() -> EventHandler<S> {
    EventHandler::new(EventKind::Ctcp, |state, event| async move {
        let Source::User(nick) = &event.source else {
            return Ok(());
        };
        let Some((verb, _)) = event.message.ctcp() else {
            return Ok(());
        };
        if verb.eq_ignore_ascii_case("VERSION") {
            let version = state.version();
            state.ctcp_reply(nick, "VERSION", &[&version]).await?;
        }
        Ok(())
    })
}

/// Answer CTCP TIME with the local time.
pub fn ctcp_time_handler<S: Send + Sync + 'static>() -> EventHandler<S> {
    EventHandler::new(EventKind::Ctcp, |state, event| async move {
        let Source::User(nick) = &event.source else {
            return Ok(());
        };
        let Some((verb, _)) = event.message.ctcp() else {
            return Ok(());
        };
        if verb.eq_ignore_ascii_case("TIME") {
            let now = Local::now().format("%c").to_string();
            state.ctcp_reply(nick, "TIME", &[&now]).await?;
        }
        Ok(())
    })
}

/// On 001, adopt the nick the server welcomed us with; it may have
/// truncated or otherwise altered the one we asked for.
pub fn welcome_nick<S: Send + Sync + 'static>() -> EventHandler<S> {
    EventHandler::new(EventKind::Numeric, |state, event| async move {
        if event.message.numeric() != Some(1) {
            return Ok(());
        }
        if let Some(nick) = event.message.params.first() {
            let nick = nick.clone();
            state.instance().modify(|ic| ic.nick = nick);
        }
        Ok(())
    })
    .run_when_ignored()
}

/// On 001, join every configured channel, in order.
pub fn join_on_welcome<S: Send + Sync + 'static>() -> EventHandler<S> {
    EventHandler::new(EventKind::Numeric, |state, event| async move {
        if event.message.numeric() != Some(1) {
            return Ok(());
        }
        for channel in state.channels() {
            state.send(Message::join(&channel)).await?;
        }
        Ok(())
    })
}

/// On 432/433/436, pick a replacement nick and try again.
pub fn nick_mangler<S: Send + Sync + 'static>() -> EventHandler<S> {
    EventHandler::new(EventKind::Numeric, |state, event| async move {
        let code = match event.message.numeric() {
            Some(code @ (432 | 433 | 436)) => code,
            _ => return Ok(()),
        };
        // In `:srv 433 * <nick> :...` the server echoes the nick it saw,
        // which reveals any server-side truncation.
        let Some(echoed) = event.message.params.get(1) else {
            return Ok(());
        };
        let current = state.nick();
        let candidate = if code == 432 {
            sanitise(&current)
        } else {
            mangle(&current)
        };
        let candidate = clamp(candidate, &current, echoed);
        state.set_nick(&candidate).await?;
        Ok(())
    })
    .run_when_ignored()
}

/// On 332 (channel topic), remember the channel if we are not already
/// tracking it. New channels go to the front of the list.
pub fn channel_tracker<S: Send + Sync + 'static>() -> EventHandler<S> {
    EventHandler::new(EventKind::Numeric, |state, event| async move {
        if event.message.numeric() != Some(332) {
            return Ok(());
        }
        let Some(channel) = event.message.params.get(1) else {
            return Ok(());
        };
        let channel = channel.clone();
        state.instance().modify(|ic| {
            if !ic.channels.contains(&channel) {
                ic.channels.insert(0, channel);
            }
        });
        Ok(())
    })
    .run_when_ignored()
}

/// Forget a channel when we are the one kicked from it.
pub fn kick_handler<S: Send + Sync + 'static>() -> EventHandler<S> {
    EventHandler::new(EventKind::Kick, |state, event| async move {
        let params = &event.message.params;
        let (Some(channel), Some(kicked)) = (params.first(), params.get(1)) else {
            return Ok(());
        };
        if *kicked == state.nick() {
            let channel = channel.clone();
            state.instance().modify(|ic| ic.channels.retain(|c| *c != channel));
        }
        Ok(())
    })
    .run_when_ignored()
}

/// Replace an erroneous nickname (432) with its alphanumeric characters,
/// or `"f"` if none survive.
fn sanitise(nick: &str) -> String {
    let cleaned: String = nick.chars().filter(|c| c.is_alphanumeric()).collect();
    if cleaned.is_empty() {
        "f".to_string()
    } else {
        cleaned
    }
}

/// Derive a replacement for a nick that collided (433/436): the first
/// substitution whose pattern occurs in the nick is applied to its first
/// occurrence; if none applies, a `"1"` is appended.
fn mangle(nick: &str) -> String {
    for (from, to) in SUBSTITUTIONS {
        if let Some(pos) = nick.find(from) {
            let mut out = String::with_capacity(nick.len() + to.len());
            out.push_str(&nick[..pos]);
            out.push_str(to);
            out.push_str(&nick[pos + from.len()..]);
            return out;
        }
    }
    format!("{nick}1")
}

/// If the server echoed a nick of a different length than the one we
/// sent, it truncates: keep the last `echoed.len()` characters of the
/// candidate so the changed portion survives the cut.
fn clamp(candidate: String, sent: &str, echoed: &str) -> String {
    let limit = echoed.chars().count();
    if limit == 0 || limit == sent.chars().count() {
        return candidate;
    }
    let len = candidate.chars().count();
    if len <= limit {
        return candidate;
    }
    candidate.chars().skip(len - limit).collect()
}
