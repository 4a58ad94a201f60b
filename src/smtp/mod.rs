use core::fmt::{self, Display};
use std::net::SocketAddr;

pub(crate) mod address;
pub(crate) mod command;
pub(crate) mod connection;
pub mod envelope;
pub(crate) mod extensions;
pub(crate) mod session;

pub use connection::{TlsContext, TlsInfo};
pub use envelope::Envelope;

/// The SMTP dialect the client greeted with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Protocol {
    #[default]
    Smtp,
    Esmtp,
}

impl Display for Protocol {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        fmt.write_str(match self {
            Self::Smtp => "SMTP",
            Self::Esmtp => "ESMTP",
        })
    }
}

/// The server's view of the connected client, handed to every callback.
///
/// The address may have been overridden by XCLIENT or a PROXY protocol
/// header when the corresponding feature is enabled.
#[derive(Debug, Clone)]
pub struct Peer {
    /// Remote network address.
    pub addr: SocketAddr,
    /// Name the client introduced itself with; `None` until HELO/EHLO.
    pub helo_name: Option<String>,
    /// SMTP or ESMTP, depending on the greeting.
    pub protocol: Protocol,
    /// The server hostname at session creation.
    pub server_name: String,
    /// Username accepted by the authenticator, if any.
    pub username: Option<String>,
    /// Password accepted by the authenticator, if any.
    pub password: Option<String>,
    /// Negotiated TLS parameters once STARTTLS (or implicit TLS) completed.
    pub tls: Option<TlsInfo>,
}

impl Peer {
    pub(crate) fn new(addr: SocketAddr, server_name: String) -> Self {
        Self {
            addr,
            helo_name: None,
            protocol: Protocol::Smtp,
            server_name,
            username: None,
            password: None,
            tls: None,
        }
    }
}
