//! Wire-level logging callbacks.
//!
//! Every frame that crosses the socket is handed to the session's log
//! callback together with its direction, before any parsing or dispatch.
//! The callback must be safe to call from multiple tasks concurrently.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

/// Direction of a logged frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// The frame was read from the server.
    FromServer,
    /// The frame was written by this client.
    FromClient,
}

impl Origin {
    fn arrow(self) -> &'static str {
        match self {
            Origin::FromServer => "<--",
            Origin::FromClient => "-->",
        }
    }
}

/// A shared wire-log callback.
pub type Logger = Arc<dyn Fn(Origin, &[u8]) + Send + Sync>;

/// A logger that discards everything. This is the default.
pub fn noop_logger() -> Logger {
    Arc::new(|_, _| {})
}

/// A logger that prints each frame to stdout with a direction arrow.
pub fn stdout_logger() -> Logger {
    Arc::new(|origin, line| {
        println!("{} {}", origin.arrow(), String::from_utf8_lossy(line));
    })
}

/// A logger that appends each frame to the file at `path`.
pub fn file_logger(path: impl AsRef<Path>) -> io::Result<Logger> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let file = Mutex::new(file);
    Ok(Arc::new(move |origin, line| {
        let mut file = file.lock().unwrap_or_else(PoisonError::into_inner);
        let _ = writeln!(
            file,
            "{} {}",
            origin.arrow(),
            String::from_utf8_lossy(line)
        );
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_logger_appends() {
        let dir = std::env::temp_dir().join("irc-client-log-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("wire.log");
        let _ = std::fs::remove_file(&path);

        let logger = file_logger(&path).unwrap();
        logger(Origin::FromServer, b"PING :srv");
        logger(Origin::FromClient, b"PONG :srv");

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "<-- PING :srv\n--> PONG :srv\n");
    }
}
