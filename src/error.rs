//! Error types for the postern SMTP server.
//!
//! `SessionError` is the structured reply a checker or handler can return to
//! control the SMTP code sent to the client; everything else a callback
//! returns is reported as `502 <message>`. `ServerError` covers the serve
//! loop itself, including the sentinel returned after a graceful shutdown.

use std::io;

use thiserror::Error;

/// A structured SMTP reply carried inside a callback error.
///
/// Return this (through `anyhow::Error`) from a checker, authenticator or
/// message handler to choose the reply code and text:
///
/// ```
/// use postern::SessionError;
///
/// fn sender_checker(_: &postern::Peer, addr: &str) -> anyhow::Result<()> {
///     if addr.ends_with("@spam.example") {
///         return Err(SessionError::new(550, "Denied").into());
///     }
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code} {message}")]
pub struct SessionError {
    pub code: u16,
    pub message: String,
}

impl SessionError {
    #[must_use]
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Errors returned by the serve loop and server construction.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The server was shut down; returned by `serve` once the accept loop
    /// has been signalled to stop.
    #[error("server closed")]
    Closed,

    /// `force_tls` requires a TLS configuration.
    #[error("cannot enable force_tls without a TLS configuration")]
    ForceTlsWithoutConfig,

    /// Implicit-TLS serving requires a TLS configuration.
    #[error("cannot serve TLS without a TLS configuration")]
    TlsNotConfigured,

    /// I/O error from the listener.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Tls(#[from] TlsError),
}

/// Errors that can occur while preparing the TLS acceptor.
#[derive(Debug, Error)]
pub enum TlsError {
    /// Failed to load the TLS certificate chain.
    #[error("failed to load TLS certificate from {path}: {source}")]
    CertificateLoad {
        path: String,
        #[source]
        source: io::Error,
    },

    /// Failed to load the TLS private key.
    #[error("failed to load TLS private key from {path}: {reason}")]
    KeyLoad { path: String, reason: String },

    /// Rustls rejected the certificate/key material.
    #[error("TLS error: {0}")]
    Rustls(String),
}

impl From<tokio_rustls::rustls::Error> for TlsError {
    fn from(err: tokio_rustls::rustls::Error) -> Self {
        Self::Rustls(err.to_string())
    }
}
