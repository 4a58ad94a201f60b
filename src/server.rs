use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, Semaphore};
use tokio_rustls::TlsAcceptor;

use crate::error::ServerError;
use crate::internal;
use crate::smtp::{connection::TlsContext, envelope::Envelope, session::Session, Peer};

/// Invoked before the 220 banner; an error aborts the session.
pub type ConnectionChecker = dyn Fn(&Peer) -> anyhow::Result<()> + Send + Sync;
/// Invoked after HELO/EHLO with the announced name.
pub type HeloChecker = dyn Fn(&Peer, &str) -> anyhow::Result<()> + Send + Sync;
/// Invoked after MAIL FROM with the parsed sender address.
pub type SenderChecker = dyn Fn(&Peer, &str) -> anyhow::Result<()> + Send + Sync;
/// Invoked after each RCPT TO with the parsed recipient address.
pub type RecipientChecker = dyn Fn(&Peer, &str) -> anyhow::Result<()> + Send + Sync;
/// Invoked with decoded AUTH credentials; an error rejects them.
pub type Authenticator = dyn Fn(&Peer, &str, &str) -> anyhow::Result<()> + Send + Sync;
/// Receives each completed message; an error rejects it with the error's
/// code and text (see [`crate::SessionError`]).
pub type Handler = dyn Fn(&Peer, Envelope) -> anyhow::Result<()> + Send + Sync;

/// Server configuration. Every field has a default, so a TOML fragment only
/// needs to name what it changes. Zero-valued limits and timeouts are
/// normalized back to their defaults; `max_connections = -1` disables the
/// concurrency cap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Advertised in the EHLO response and in Received trace headers.
    #[serde(default = "defaults::hostname")]
    pub hostname: String,

    /// Initial banner; empty uses `"<hostname> ESMTP ready."`.
    #[serde(default)]
    pub welcome_message: String,

    /// Socket timeout for reads (default: 60s).
    #[serde(default = "defaults::read_timeout_secs")]
    pub read_timeout_secs: u64,

    /// Socket timeout for writes (default: 60s).
    #[serde(default = "defaults::write_timeout_secs")]
    pub write_timeout_secs: u64,

    /// Timeout for receiving the whole DATA body (default: 5 minutes).
    #[serde(default = "defaults::data_timeout_secs")]
    pub data_timeout_secs: u64,

    /// Concurrent session cap (default: 100; -1 disables).
    #[serde(default = "defaults::max_connections")]
    pub max_connections: i64,

    /// Maximum message size in bytes (default: 10240000).
    #[serde(default = "defaults::max_message_size")]
    pub max_message_size: usize,

    /// Maximum recipients per envelope (default: 100).
    #[serde(default = "defaults::max_recipients")]
    pub max_recipients: usize,

    /// Honor XCLIENT identity overrides from trusted upstreams.
    #[serde(default)]
    pub enable_xclient: bool,

    /// Expect a PROXY protocol v1 header as the first line.
    #[serde(default)]
    pub enable_proxy_protocol: bool,

    /// Reject MAIL until the session has been upgraded with STARTTLS.
    #[serde(default)]
    pub force_tls: bool,

    /// Certificate material for STARTTLS and implicit TLS.
    #[serde(default)]
    pub tls: Option<TlsContext>,
}

mod defaults {
    pub(super) fn hostname() -> String {
        "localhost".to_string()
    }

    pub(super) const fn read_timeout_secs() -> u64 {
        60
    }

    pub(super) const fn write_timeout_secs() -> u64 {
        60
    }

    pub(super) const fn data_timeout_secs() -> u64 {
        300
    }

    pub(super) const fn max_connections() -> i64 {
        100
    }

    pub(super) const fn max_message_size() -> usize {
        10_240_000
    }

    pub(super) const fn max_recipients() -> usize {
        100
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hostname: defaults::hostname(),
            welcome_message: String::new(),
            read_timeout_secs: defaults::read_timeout_secs(),
            write_timeout_secs: defaults::write_timeout_secs(),
            data_timeout_secs: defaults::data_timeout_secs(),
            max_connections: defaults::max_connections(),
            max_message_size: defaults::max_message_size(),
            max_recipients: defaults::max_recipients(),
            enable_xclient: false,
            enable_proxy_protocol: false,
            force_tls: false,
            tls: None,
        }
    }
}

impl Config {
    /// Load a configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// If the file does not exist, is not readable, or is not valid TOML.
    pub fn from_file(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let config = std::fs::read_to_string(path)?;

        toml::from_str(&config)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err.to_string()))
    }

    pub(crate) fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub(crate) fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    pub(crate) fn data_timeout(&self) -> Duration {
        Duration::from_secs(self.data_timeout_secs)
    }

    fn normalize(&mut self) {
        let defaults = Self::default();

        if self.hostname.is_empty() {
            self.hostname = defaults.hostname;
        }
        if self.read_timeout_secs == 0 {
            self.read_timeout_secs = defaults.read_timeout_secs;
        }
        if self.write_timeout_secs == 0 {
            self.write_timeout_secs = defaults.write_timeout_secs;
        }
        if self.data_timeout_secs == 0 {
            self.data_timeout_secs = defaults.data_timeout_secs;
        }
        if self.max_connections == 0 {
            self.max_connections = defaults.max_connections;
        }
        if self.max_message_size == 0 {
            self.max_message_size = defaults.max_message_size;
        }
        if self.max_recipients == 0 {
            self.max_recipients = defaults.max_recipients;
        }
    }
}

/// Per-session guard for the shutdown waitgroup. Every live session holds a
/// clone; once the master handle and all clones have dropped, `wait`
/// resolves.
#[derive(Clone)]
struct Activity {
    _tx: mpsc::Sender<()>,
}

struct Shutdown {
    closing: AtomicBool,
    done: watch::Sender<bool>,
    activity: Mutex<Option<Activity>>,
    drained: tokio::sync::Mutex<mpsc::Receiver<()>>,
}

enum Admission {
    Granted(Option<OwnedSemaphorePermit>),
    Rejected,
}

/// The SMTP server: configuration, embedder callbacks, and the accept loop.
///
/// Construct one with [`Server::new`], attach callbacks with the `with_*`
/// builders, wrap it in an [`Arc`], and call [`Server::serve`] or
/// [`Server::listen_and_serve`]. The configuration is read-only once
/// serving has begun.
pub struct Server {
    config: Config,
    connection_checker: Option<Arc<ConnectionChecker>>,
    helo_checker: Option<Arc<HeloChecker>>,
    sender_checker: Option<Arc<SenderChecker>>,
    recipient_checker: Option<Arc<RecipientChecker>>,
    authenticator: Option<Arc<Authenticator>>,
    handler: Option<Arc<Handler>>,
    limiter: Option<Arc<Semaphore>>,
    shutdown: Shutdown,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.config)
            .field("connection_checker", &self.connection_checker.is_some())
            .field("helo_checker", &self.helo_checker.is_some())
            .field("sender_checker", &self.sender_checker.is_some())
            .field("recipient_checker", &self.recipient_checker.is_some())
            .field("authenticator", &self.authenticator.is_some())
            .field("handler", &self.handler.is_some())
            .field("limiter", &self.limiter.is_some())
            .finish()
    }
}

impl Server {
    /// Create a server from a configuration.
    ///
    /// # Errors
    ///
    /// If `force_tls` is set without a TLS configuration.
    pub fn new(mut config: Config) -> Result<Self, ServerError> {
        config.normalize();

        if config.force_tls && config.tls.is_none() {
            return Err(ServerError::ForceTlsWithoutConfig);
        }

        let limiter = match config.max_connections {
            n if n > 0 => Some(Arc::new(Semaphore::new(n as usize))),
            _ => None,
        };

        let (activity_tx, activity_rx) = mpsc::channel(1);
        let (done, _) = watch::channel(false);

        Ok(Self {
            config,
            connection_checker: None,
            helo_checker: None,
            sender_checker: None,
            recipient_checker: None,
            authenticator: None,
            handler: None,
            limiter,
            shutdown: Shutdown {
                closing: AtomicBool::new(false),
                done,
                activity: Mutex::new(Some(Activity { _tx: activity_tx })),
                drained: tokio::sync::Mutex::new(activity_rx),
            },
        })
    }

    #[must_use]
    pub fn with_connection_checker(
        mut self,
        checker: impl Fn(&Peer) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.connection_checker = Some(Arc::new(checker));
        self
    }

    #[must_use]
    pub fn with_helo_checker(
        mut self,
        checker: impl Fn(&Peer, &str) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.helo_checker = Some(Arc::new(checker));
        self
    }

    #[must_use]
    pub fn with_sender_checker(
        mut self,
        checker: impl Fn(&Peer, &str) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.sender_checker = Some(Arc::new(checker));
        self
    }

    #[must_use]
    pub fn with_recipient_checker(
        mut self,
        checker: impl Fn(&Peer, &str) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.recipient_checker = Some(Arc::new(checker));
        self
    }

    #[must_use]
    pub fn with_authenticator(
        mut self,
        authenticator: impl Fn(&Peer, &str, &str) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.authenticator = Some(Arc::new(authenticator));
        self
    }

    #[must_use]
    pub fn with_handler(
        mut self,
        handler: impl Fn(&Peer, Envelope) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Bind `addr` and serve until shutdown.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Closed`] after a graceful shutdown, or the
    /// underlying error if the listener fails.
    pub async fn listen_and_serve(self: Arc<Self>, addr: &str) -> Result<(), ServerError> {
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    /// Serve plain SMTP (with STARTTLS if TLS is configured).
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Closed`] after a graceful shutdown, or the
    /// underlying error if the listener fails.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<(), ServerError> {
        let acceptor = self.build_acceptor()?;
        let mut done = self.shutdown.done.subscribe();

        if self.shutdown.closing.load(Ordering::SeqCst) {
            return Err(ServerError::Closed);
        }

        internal!(level = INFO, "serving on {:?}", listener.local_addr().ok());

        loop {
            tokio::select! {
                _ = done.changed() => return Err(ServerError::Closed),

                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let Some(activity) = self.activity() else { continue };
                        let session =
                            Session::new(Arc::clone(&self), stream, addr, acceptor.clone());
                        let admission = self.admit();

                        tokio::spawn(async move {
                            let _activity = activity;
                            match admission {
                                Admission::Granted(_permit) => session.run().await,
                                Admission::Rejected => session.reject().await,
                            }
                        });
                    }
                    Err(err) if is_temporary(&err) => {
                        internal!(level = WARN, "accept error: {err}");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                    Err(err) => return Err(err.into()),
                }
            }
        }
    }

    /// Serve implicit TLS: each accepted connection is handshaken before
    /// the greeting and the session starts encrypted.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::TlsNotConfigured`] without TLS material,
    /// [`ServerError::Closed`] after a graceful shutdown, or the underlying
    /// error if the listener fails.
    pub async fn serve_tls(self: Arc<Self>, listener: TcpListener) -> Result<(), ServerError> {
        let Some(acceptor) = self.build_acceptor()? else {
            return Err(ServerError::TlsNotConfigured);
        };
        let mut done = self.shutdown.done.subscribe();

        if self.shutdown.closing.load(Ordering::SeqCst) {
            return Err(ServerError::Closed);
        }

        internal!(level = INFO, "serving TLS on {:?}", listener.local_addr().ok());

        loop {
            tokio::select! {
                _ = done.changed() => return Err(ServerError::Closed),

                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let Some(activity) = self.activity() else { continue };
                        let server = Arc::clone(&self);
                        let tls = acceptor.clone();
                        let admission = self.admit();

                        tokio::spawn(async move {
                            let _activity = activity;

                            let stream = match tls.accept(stream).await {
                                Ok(stream) => stream,
                                Err(err) => {
                                    internal!("{addr}: TLS handshake failed: {err}");
                                    return;
                                }
                            };

                            let session = Session::with_tls(server, stream, addr, None);
                            match admission {
                                Admission::Granted(_permit) => session.run().await,
                                Admission::Rejected => session.reject().await,
                            }
                        });
                    }
                    Err(err) if is_temporary(&err) => {
                        internal!(level = WARN, "accept error: {err}");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                    Err(err) => return Err(err.into()),
                }
            }
        }
    }

    /// Begin a graceful shutdown: stop accepting, let live sessions finish.
    /// With `wait` set this also waits for them; otherwise pair it with
    /// [`Server::wait`].
    pub async fn shutdown(&self, wait: bool) {
        self.shutdown.closing.store(true, Ordering::SeqCst);
        self.shutdown.activity.lock().unwrap().take();
        self.shutdown.done.send_replace(true);

        if wait {
            self.wait().await;
        }
    }

    /// Wait for all live sessions to finish. Meant to be called after
    /// `shutdown(false)`.
    pub async fn wait(&self) {
        let mut drained = self.shutdown.drained.lock().await;
        // Resolves with None once the master handle and every session's
        // clone have dropped.
        let _ = drained.recv().await;
    }

    fn build_acceptor(&self) -> Result<Option<TlsAcceptor>, ServerError> {
        self.config
            .tls
            .as_ref()
            .map(TlsContext::acceptor)
            .transpose()
            .map_err(Into::into)
    }

    fn activity(&self) -> Option<Activity> {
        if self.shutdown.closing.load(Ordering::SeqCst) {
            return None;
        }
        self.shutdown.activity.lock().unwrap().clone()
    }

    fn admit(&self) -> Admission {
        match &self.limiter {
            Some(semaphore) => match Arc::clone(semaphore).try_acquire_owned() {
                Ok(permit) => Admission::Granted(Some(permit)),
                Err(_) => Admission::Rejected,
            },
            None => Admission::Granted(None),
        }
    }

    pub(crate) fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn welcome_message(&self) -> String {
        if self.config.welcome_message.is_empty() {
            format!("{} ESMTP ready.", self.config.hostname)
        } else {
            self.config.welcome_message.clone()
        }
    }

    pub(crate) fn connection_checker(&self) -> Option<&ConnectionChecker> {
        self.connection_checker.as_deref()
    }

    pub(crate) fn helo_checker(&self) -> Option<&HeloChecker> {
        self.helo_checker.as_deref()
    }

    pub(crate) fn sender_checker(&self) -> Option<&SenderChecker> {
        self.sender_checker.as_deref()
    }

    pub(crate) fn recipient_checker(&self) -> Option<&RecipientChecker> {
        self.recipient_checker.as_deref()
    }

    pub(crate) fn authenticator(&self) -> Option<&Authenticator> {
        self.authenticator.as_deref()
    }

    pub(crate) fn handler(&self) -> Option<&Handler> {
        self.handler.as_deref()
    }
}

/// Accept errors worth a cooldown and retry instead of ending the serve
/// loop (out of descriptors, peer aborted mid-accept).
fn is_temporary(err: &std::io::Error) -> bool {
    const EMFILE: i32 = 24;
    const ENFILE: i32 = 23;

    matches!(
        err.kind(),
        std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::WouldBlock
            | std::io::ErrorKind::Interrupted
            | std::io::ErrorKind::TimedOut
    ) || matches!(err.raw_os_error(), Some(EMFILE | ENFILE))
}
