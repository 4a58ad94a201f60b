//! An embeddable SMTP/ESMTP server library.
//!
//! postern accepts inbound connections, drives each one through the SMTP
//! state machine (RFC 5321 plus SIZE, 8BITMIME, PIPELINING, STARTTLS,
//! AUTH PLAIN/LOGIN, XCLIENT and the PROXY protocol), and hands completed
//! messages to a handler you provide. Queueing, routing and onward delivery
//! stay with the embedder; any checker can veto its stage of the dialogue by
//! returning an error, with [`SessionError`] choosing the reply code.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use postern::{Config, Server};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let server = Arc::new(
//!         Server::new(Config {
//!             hostname: "mx.example.org".to_string(),
//!             ..Config::default()
//!         })?
//!         .with_handler(|peer, envelope| {
//!             println!(
//!                 "message from {} via {}: {} recipient(s), {} bytes",
//!                 envelope.sender,
//!                 peer.addr,
//!                 envelope.recipients.len(),
//!                 envelope.data.len(),
//!             );
//!             Ok(())
//!         }),
//!     );
//!
//!     server.listen_and_serve("127.0.0.1:10025").await?;
//!     Ok(())
//! }
//! ```

mod error;
pub mod logging;
pub mod server;
pub mod smtp;

pub use error::{ServerError, SessionError, TlsError};
pub use server::{
    Authenticator, Config, ConnectionChecker, Handler, HeloChecker, RecipientChecker,
    SenderChecker, Server,
};
pub use smtp::{Envelope, Peer, Protocol, TlsContext, TlsInfo};

// Used by the logging macros.
#[doc(hidden)]
pub use tracing;
