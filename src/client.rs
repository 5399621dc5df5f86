//! Connection setup and the session engine.
//!
//! This is the main entry point for library consumers: build a
//! [`ConnectionConfig`] with one of the `connect*` constructors, pair it
//! with an [`InstanceConfig`] and a user state, and hand the resulting
//! [`IrcState`] to [`start`]. Supports plaintext and TLS connections, the
//! latter with default settings, a caller-supplied rustls config, or a
//! caller-supplied certificate verdict callback.
//!
//! One session runs three cooperating tasks: a reader (frames in, with a
//! read timeout), a writer (frames out, under the flood cooldown), and a
//! dispatcher (spawns matching handlers per event). `start` returns once
//! all three have stopped and the on-disconnect action has run.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, timeout, Instant};
use tokio_rustls::rustls::{self, pki_types::CertificateDer, pki_types::ServerName};
use tokio_rustls::TlsConnector;

use crate::error::Disconnect;
use crate::event::Event;
use crate::irc::Message;
use crate::logging::{noop_logger, Logger, Origin};
use crate::state::{EventHandler, InstanceConfig, IrcState, Outbound};

/// Capacity of the reader→dispatcher channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// The boxed future a connect/disconnect action produces.
pub type ActionFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// Action run once the socket is up, before any other traffic.
pub type ConnectAction<S> =
    Arc<dyn Fn(Arc<IrcState<S>>) -> ActionFuture + Send + Sync>;

/// Action run after the session has wound down. Receives the fatal cause,
/// or `None` for a clean disconnect.
pub type DisconnectAction<S> =
    Arc<dyn Fn(Arc<IrcState<S>>, Option<Disconnect>) -> ActionFuture + Send + Sync>;

/// Certificate verdict callback: `(host, port, chain)` to a list of
/// failure reasons. An empty list accepts the certificate.
pub type CertVerifier =
    dyn Fn(&str, u16, &[CertificateDer<'static>]) -> Vec<String> + Send + Sync;

/// How the socket is established.
#[derive(Clone)]
pub enum Dialer {
    /// Plain TCP.
    Plain,
    /// TLS with default settings (webpki roots, no client auth).
    Tls,
    /// TLS with a caller-supplied rustls configuration.
    TlsWithConfig(Arc<rustls::ClientConfig>),
    /// TLS accepting whatever the callback accepts.
    TlsWithVerifier(Arc<CertVerifier>),
}

/// Configuration for connecting to an IRC server. Immutable once the
/// session starts.
pub struct ConnectionConfig<S> {
    /// Server host name or address.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Username (ident) for registration.
    pub username: String,
    /// Real name for registration.
    pub realname: String,
    /// Server password, sent as `PASS` before registration if present.
    pub password: Option<String>,
    /// Minimum interval between successive outbound writes.
    pub flood_cooldown: Duration,
    /// The session disconnects if no frame arrives within this window.
    pub read_timeout: Duration,
    /// Run once the socket is up, before any other traffic. The default
    /// registers: `PASS` (if configured), `NICK`, `USER`.
    pub on_connect: ConnectAction<S>,
    /// Run after the session has wound down.
    pub on_disconnect: DisconnectAction<S>,
    /// Wire log callback.
    pub log: Logger,
    /// Transport factory, bound at construction.
    pub dialer: Dialer,
}

impl<S: Send + Sync + 'static> ConnectionConfig<S> {
    /// Replace the wire log callback.
    pub fn with_log(mut self, log: Logger) -> Self {
        self.log = log;
        self
    }

    /// Replace the on-connect action.
    pub fn with_on_connect<F, Fut>(mut self, action: F) -> Self
    where
        F: Fn(Arc<IrcState<S>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.on_connect = Arc::new(move |state| Box::pin(action(state)));
        self
    }

    /// Replace the on-disconnect action.
    pub fn with_on_disconnect<F, Fut>(mut self, action: F) -> Self
    where
        F: Fn(Arc<IrcState<S>>, Option<Disconnect>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.on_disconnect = Arc::new(move |state, cause| Box::pin(action(state, cause)));
        self
    }
}

/// A plaintext connection config.
pub fn connect<S: Send + Sync + 'static>(
    host: impl Into<String>,
    port: u16,
    flood_cooldown: Duration,
) -> ConnectionConfig<S> {
    base_config(host.into(), port, flood_cooldown, Dialer::Plain)
}

/// A TLS connection config with default settings.
pub fn connect_tls<S: Send + Sync + 'static>(
    host: impl Into<String>,
    port: u16,
    flood_cooldown: Duration,
) -> ConnectionConfig<S> {
    base_config(host.into(), port, flood_cooldown, Dialer::Tls)
}

/// A TLS connection config with a caller-supplied rustls configuration.
pub fn connect_tls_with_config<S: Send + Sync + 'static>(
    host: impl Into<String>,
    port: u16,
    flood_cooldown: Duration,
    tls: Arc<rustls::ClientConfig>,
) -> ConnectionConfig<S> {
    base_config(host.into(), port, flood_cooldown, Dialer::TlsWithConfig(tls))
}

/// A TLS connection config whose certificate verdict is delegated to a
/// callback.
pub fn connect_tls_with_verifier<S, F>(
    host: impl Into<String>,
    port: u16,
    flood_cooldown: Duration,
    verify: F,
) -> ConnectionConfig<S>
where
    S: Send + Sync + 'static,
    F: Fn(&str, u16, &[CertificateDer<'static>]) -> Vec<String> + Send + Sync + 'static,
{
    base_config(
        host.into(),
        port,
        flood_cooldown,
        Dialer::TlsWithVerifier(Arc::new(verify)),
    )
}

fn base_config<S: Send + Sync + 'static>(
    host: String,
    port: u16,
    flood_cooldown: Duration,
    dialer: Dialer,
) -> ConnectionConfig<S> {
    ConnectionConfig {
        host,
        port,
        username: "irc-client".to_string(),
        realname: "irc-client".to_string(),
        password: None,
        flood_cooldown,
        read_timeout: Duration::from_secs(300),
        on_connect: default_on_connect(),
        on_disconnect: Arc::new(|_, _| Box::pin(async { Ok(()) })),
        log: noop_logger(),
        dialer,
    }
}

fn default_on_connect<S: Send + Sync + 'static>() -> ConnectAction<S> {
    Arc::new(|state| {
        Box::pin(async move {
            if let Some(password) = &state.config().password {
                state.send(Message::new("PASS", vec![password.as_str()])).await?;
            }
            let nick = state.nick();
            state.send(Message::nick(&nick)).await?;
            let config = state.config();
            state
                .send(Message::new(
                    "USER",
                    vec![config.username.as_str(), "0", "*", config.realname.as_str()],
                ))
                .await?;
            Ok(())
        })
    })
}

/// Create the session state and run it to completion.
///
/// Returns the state bundle after the session has ended, for inspecting
/// the final configuration or user state.
pub async fn run<S: Send + Sync + 'static>(
    config: ConnectionConfig<S>,
    instance: InstanceConfig<S>,
    user_state: S,
) -> Arc<IrcState<S>> {
    let state = IrcState::new(config, instance, user_state);
    start(Arc::clone(&state)).await;
    state
}

/// Run one session to completion.
///
/// Always returns normally: connection establishment failures and fatal
/// session errors are reported through the on-disconnect action, not as
/// a return value. The state is not re-usable afterwards.
pub async fn start<S: Send + Sync + 'static>(state: Arc<IrcState<S>>) {
    if state.started.swap(true, Ordering::SeqCst) {
        tracing::warn!("start called twice on the same IrcState; sessions are single-use");
        return;
    }
    let config = state.config();
    match establish(&config.host, config.port, &config.dialer).await {
        Ok(Established::Plain(stream)) => run_session(state, stream).await,
        Ok(Established::Tls(stream)) => run_session(state, stream).await,
        Err(cause) => {
            let on_disconnect = Arc::clone(&state.config().on_disconnect);
            if let Err(e) = on_disconnect(Arc::clone(&state), Some(cause)).await {
                tracing::warn!(error = %e, "on-disconnect action failed");
            }
        }
    }
}

enum Established {
    Plain(TcpStream),
    Tls(tokio_rustls::client::TlsStream<TcpStream>),
}

async fn establish(host: &str, port: u16, dialer: &Dialer) -> Result<Established, Disconnect> {
    let tcp = TcpStream::connect((host, port)).await?;

    let tls_config = match dialer {
        Dialer::Plain => return Ok(Established::Plain(tcp)),
        Dialer::Tls => Arc::new(default_tls_config()),
        Dialer::TlsWithConfig(config) => Arc::clone(config),
        Dialer::TlsWithVerifier(verify) => {
            Arc::new(callback_tls_config(host, port, Arc::clone(verify)))
        }
    };
    let connector = TlsConnector::from(tls_config);
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| Disconnect::Tls(rustls::Error::General(e.to_string())))?;
    let stream = connector.connect(server_name, tcp).await?;
    Ok(Established::Tls(stream))
}

fn default_tls_config() -> rustls::ClientConfig {
    let root_store =
        rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth()
}

fn callback_tls_config(
    host: &str,
    port: u16,
    verify: Arc<CertVerifier>,
) -> rustls::ClientConfig {
    rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(CallbackVerifier {
            host: host.to_string(),
            port,
            verify,
        }))
        .with_no_client_auth()
}

struct CallbackVerifier {
    host: String,
    port: u16,
    verify: Arc<CertVerifier>,
}

impl std::fmt::Debug for CallbackVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackVerifier")
            .field("host", &self.host)
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}

impl rustls::client::danger::ServerCertVerifier for CallbackVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        let mut chain: Vec<CertificateDer<'static>> =
            Vec::with_capacity(intermediates.len() + 1);
        chain.push(end_entity.clone().into_owned());
        chain.extend(intermediates.iter().map(|c| c.clone().into_owned()));

        let failures = (self.verify)(&self.host, self.port, &chain);
        if failures.is_empty() {
            Ok(rustls::client::danger::ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::General(failures.join("; ")))
        }
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::aws_lc_rs::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

async fn run_session<S, T>(state: Arc<IrcState<S>>, stream: T)
where
    S: Send + Sync + 'static,
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    state.mark_connected();

    // The on-connect action runs to completion before the session tasks
    // exist, so its registration traffic is first in the queue.
    let on_connect = Arc::clone(&state.config().on_connect);
    if let Err(e) = on_connect(Arc::clone(&state)).await {
        tracing::warn!(error = %e, "on-connect action failed");
    }

    let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let reader = tokio::spawn(read_loop(
        Arc::clone(&state),
        BufReader::new(read_half),
        event_tx,
    ));
    let dispatcher = tokio::spawn(dispatch_loop(Arc::clone(&state), event_rx));
    let writer = tokio::spawn(write_loop(Arc::clone(&state), write_half));

    let _ = reader.await;
    let _ = dispatcher.await;
    let _ = writer.await;

    let cause = state.take_cause();
    let on_disconnect = Arc::clone(&state.config().on_disconnect);
    if let Err(e) = on_disconnect(Arc::clone(&state), cause).await {
        tracing::warn!(error = %e, "on-disconnect action failed");
    }
    state.mark_disconnected();
}

/// Wait until the shutdown flag flips to `true`.
///
/// Equivalent to `shutdown.wait_for(|stop| *stop)`, but written so the
/// `watch::Ref` borrow never crosses an `.await`; `wait_for`'s own future
/// holds that borrow across its internal `changed().await`, which makes it
/// non-`Send` and breaks `tokio::spawn` on the loops that select over it.
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Pull frames until EOF, a fatal error, the read timeout, or shutdown.
async fn read_loop<S, R>(
    state: Arc<IrcState<S>>,
    mut reader: R,
    events: mpsc::Sender<(Message, String)>,
) where
    S: Send + Sync + 'static,
    R: AsyncBufRead + Unpin + Send + 'static,
{
    let mut shutdown = state.shutdown_rx();
    let mut buf = String::new();
    loop {
        buf.clear();
        tokio::select! {
            res = timeout(state.config().read_timeout, reader.read_line(&mut buf)) => match res {
                Err(_) => {
                    state.begin_disconnect(Some(Disconnect::Timeout));
                    break;
                }
                Ok(Ok(0)) => {
                    state.begin_disconnect(None);
                    break;
                }
                Ok(Ok(_)) => {
                    let raw = buf.trim_end_matches(['\r', '\n']).to_string();
                    (state.config().log)(Origin::FromServer, raw.as_bytes());
                    match Message::parse(&raw) {
                        Some(message) => {
                            if events.send((message, raw)).await.is_err() {
                                break;
                            }
                        }
                        None => tracing::debug!(line = %raw, "dropping unparseable frame"),
                    }
                }
                Ok(Err(e)) => {
                    state.begin_disconnect(Some(Disconnect::Transport(e)));
                    break;
                }
            },
            _ = wait_for_shutdown(&mut shutdown) => break,
        }
    }
}

/// Classify inbound frames, apply the ignore list, and spawn matching
/// handlers. Never waits for a handler before taking the next frame.
///
/// An ignored source suppresses ordinary handlers only; handlers flagged
/// `run_when_ignored` (the internal bookkeeping ones) still run, so the
/// tracked channel and nick state cannot drift from the server's.
async fn dispatch_loop<S: Send + Sync + 'static>(
    state: Arc<IrcState<S>>,
    mut events: mpsc::Receiver<(Message, String)>,
) {
    while let Some((message, raw)) = events.recv().await {
        let event = Event::from_message(message, raw);
        let ignored = state.is_ignored(&event.source);
        let kind = event.kind();
        let matching: Vec<EventHandler<S>> = state.instance().with(|ic| {
            ic.handlers
                .iter()
                .filter(|h| h.matches(kind) && (!ignored || h.run_when_ignored))
                .cloned()
                .collect()
        });
        for handler in matching {
            let state = Arc::clone(&state);
            let event = event.clone();
            tokio::spawn(async move {
                if let Err(e) = handler.call(state, event).await {
                    tracing::warn!(kind = ?handler.kind, error = %e, "event handler failed");
                }
            });
        }
    }
}

/// Drain the send queue in FIFO order under the flood cooldown. On
/// shutdown, flush what was queued before the close point, then stop.
async fn write_loop<S, W>(state: Arc<IrcState<S>>, mut writer: W)
where
    S: Send + Sync + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let Some(mut queue) = state.take_out_rx() else {
        tracing::warn!("send queue already taken; refusing to start a second writer");
        return;
    };
    let mut shutdown = state.shutdown_rx();
    let mut last_write: Option<Instant> = None;
    let mut stopping = *shutdown.borrow();

    loop {
        if stopping {
            // Flush what was queued before the close point, then stop.
            while let Ok(out) = queue.try_recv() {
                if write_one(&state, &mut writer, &mut last_write, out).await.is_err() {
                    break;
                }
            }
            break;
        }
        tokio::select! {
            out = queue.recv() => match out {
                Some(out) => {
                    if let Err(e) = write_one(&state, &mut writer, &mut last_write, out).await {
                        state.begin_disconnect(Some(Disconnect::Transport(e)));
                        break;
                    }
                }
                None => break,
            },
            _ = wait_for_shutdown(&mut shutdown) => stopping = true,
        }
    }
    let _ = writer.shutdown().await;
}

/// Write a single frame, honouring the minimum gap since the previous
/// write. The first write of a session is not delayed.
async fn write_one<S, W>(
    state: &IrcState<S>,
    writer: &mut W,
    last_write: &mut Option<Instant>,
    out: Outbound,
) -> std::io::Result<()>
where
    S: Send + Sync + 'static,
    W: AsyncWrite + Unpin,
{
    if let Some(prev) = *last_write {
        sleep_until(prev + state.config().flood_cooldown).await;
    }
    let mut line = out.into_line();
    (state.config().log)(Origin::FromClient, line.as_bytes());
    line.push_str("\r\n");
    let result = writer.write_all(line.as_bytes()).await;
    *last_write = Some(Instant::now());
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_defaults() {
        let config: ConnectionConfig<()> =
            connect("irc.example.org", 6667, Duration::from_secs(1));
        assert_eq!(config.host, "irc.example.org");
        assert_eq!(config.port, 6667);
        assert_eq!(config.flood_cooldown, Duration::from_secs(1));
        assert!(config.password.is_none());
        assert!(matches!(config.dialer, Dialer::Plain));
    }

    #[test]
    fn tls_constructors_pick_their_dialer() {
        let tls: ConnectionConfig<()> =
            connect_tls("irc.example.org", 6697, Duration::ZERO);
        assert!(matches!(tls.dialer, Dialer::Tls));

        let cb: ConnectionConfig<()> =
            connect_tls_with_verifier("irc.example.org", 6697, Duration::ZERO, |_, _, _| {
                vec!["untrusted".to_string()]
            });
        assert!(matches!(cb.dialer, Dialer::TlsWithVerifier(_)));
    }

    #[test]
    fn callback_verifier_rejects_with_reasons() {
        let verifier = CallbackVerifier {
            host: "irc.example.org".to_string(),
            port: 6697,
            verify: Arc::new(|host, port, chain| {
                assert_eq!(host, "irc.example.org");
                assert_eq!(port, 6697);
                assert_eq!(chain.len(), 1);
                vec!["expired".to_string(), "wrong host".to_string()]
            }),
        };
        let cert = CertificateDer::from(vec![0u8; 4]);
        let err = rustls::client::danger::ServerCertVerifier::verify_server_cert(
            &verifier,
            &cert,
            &[],
            &ServerName::try_from("irc.example.org").unwrap(),
            &[],
            rustls::pki_types::UnixTime::now(),
        )
        .unwrap_err();
        match err {
            rustls::Error::General(reasons) => assert_eq!(reasons, "expired; wrong host"),
            other => panic!("expected a General error, got {other:?}"),
        }
    }
}
