use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;
use tokio_rustls::{server::TlsStream, TlsAcceptor};

use crate::error::SessionError;
use crate::server::Server;
use crate::smtp::{
    address::parse_address,
    command::Command,
    connection::{Connection, LineRead, TlsInfo, MAX_LINE_LENGTH},
    envelope::Envelope,
    extensions::Extension,
    Peer, Protocol,
};
use crate::{incoming, internal, outgoing};

/// What the dispatch loop should do after a command has been handled.
#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    /// `220 Go ahead` has been sent; perform the TLS handshake.
    Upgrade,
    Close,
}

/// One SMTP session. Owns its transport, its peer state and the envelope in
/// progress; nothing else touches these for the lifetime of the connection.
pub(crate) struct Session<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> {
    server: Arc<Server>,
    conn: Connection<Stream>,
    peer: Peer,
    envelope: Option<Envelope>,
    acceptor: Option<TlsAcceptor>,
    greeted: bool,
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> Session<Stream> {
    pub(crate) fn new(
        server: Arc<Server>,
        stream: Stream,
        addr: SocketAddr,
        acceptor: Option<TlsAcceptor>,
    ) -> Self {
        let peer = Peer::new(addr, server.config().hostname.clone());

        Self {
            server,
            conn: Connection::plain(stream),
            peer,
            envelope: None,
            acceptor,
            greeted: false,
        }
    }

    /// A session over an already-established TLS transport (implicit TLS).
    pub(crate) fn with_tls(
        server: Arc<Server>,
        stream: TlsStream<Stream>,
        addr: SocketAddr,
        acceptor: Option<TlsAcceptor>,
    ) -> Self {
        let mut peer = Peer::new(addr, server.config().hostname.clone());
        peer.tls = Some(TlsInfo::of(stream.get_ref().1));

        Self {
            server,
            conn: Connection::tls(stream),
            peer,
            envelope: None,
            acceptor,
            greeted: false,
        }
    }

    /// Turn away a connection that exceeded the concurrency cap.
    pub(crate) async fn reject(mut self) {
        let _ = self.reply(421, "Too busy. Try again later.").await;
        self.conn.close().await;
    }

    pub(crate) async fn run(mut self) {
        internal!("connected: {}", self.peer.addr);

        // With the PROXY protocol enabled the greeting waits for the
        // identity line; otherwise greet right away.
        if !self.server.config().enable_proxy_protocol {
            match self.welcome().await {
                Ok(Flow::Continue) => {}
                _ => {
                    self.conn.close().await;
                    return;
                }
            }
        }

        loop {
            let read = timeout(
                self.server.config().read_timeout(),
                self.conn.read_line(MAX_LINE_LENGTH),
            )
            .await;

            let flow = match read {
                Err(_elapsed) => break,
                Ok(Err(err)) => {
                    internal!("read error from {}: {err}", self.peer.addr);
                    break;
                }
                Ok(Ok(LineRead::Closed)) => break,
                Ok(Ok(LineRead::TooLong)) => {
                    self.reset();
                    match self.reply(500, "Line too long").await {
                        Ok(()) => Flow::Continue,
                        Err(_) => Flow::Close,
                    }
                }
                Ok(Ok(LineRead::Line(bytes))) => {
                    let line = String::from_utf8_lossy(&bytes).into_owned();
                    incoming!("{line}");

                    match self.handle(&line).await {
                        Ok(flow) => flow,
                        Err(err) => {
                            internal!("write error to {}: {err}", self.peer.addr);
                            Flow::Close
                        }
                    }
                }
            };

            match flow {
                Flow::Continue => {}
                Flow::Close => break,
                Flow::Upgrade => {
                    let Some(acceptor) = self.acceptor.clone() else {
                        break;
                    };

                    // The handshake consumes the plain transport; on failure
                    // there is nothing left to write a reply to.
                    let handshake = timeout(
                        self.server.config().read_timeout(),
                        self.conn.upgrade(&acceptor),
                    )
                    .await;

                    match handshake {
                        Ok(Ok((conn, info))) => {
                            internal!(
                                "{}: connection upgraded to {}",
                                self.peer.addr,
                                info.version_string()
                            );
                            self.conn = conn;
                            self.peer.tls = Some(info);
                            // The client has to introduce itself again.
                            self.peer.helo_name = None;
                            self.peer.protocol = Protocol::Smtp;
                            self.envelope = None;
                        }
                        Ok(Err(err)) => {
                            internal!("{}: TLS handshake failed: {err}", self.peer.addr);
                            return;
                        }
                        Err(_elapsed) => {
                            internal!("{}: TLS handshake timed out", self.peer.addr);
                            return;
                        }
                    }
                }
            }
        }

        self.conn.close().await;
        internal!("closed: {}", self.peer.addr);
    }

    async fn handle(&mut self, line: &str) -> std::io::Result<Flow> {
        match Command::parse(line) {
            Command::Helo { name } => self.handle_helo(name, Protocol::Smtp).await,
            Command::Ehlo { name } => self.handle_helo(name, Protocol::Esmtp).await,
            Command::Mail { path } => self.handle_mail(path).await,
            Command::Rcpt { path } => self.handle_rcpt(path).await,
            Command::StartTls => self.handle_starttls().await,
            Command::Data => self.handle_data().await,
            Command::Rset => {
                self.reset();
                self.reply(250, "Go ahead").await?;
                Ok(Flow::Continue)
            }
            Command::Noop => {
                self.reply(250, "Go ahead").await?;
                Ok(Flow::Continue)
            }
            Command::Quit => {
                self.reply(221, "OK, bye").await?;
                Ok(Flow::Close)
            }
            Command::Auth { mechanism, initial } => self.handle_auth(mechanism, initial).await,
            Command::Xclient { attrs } => self.handle_xclient(attrs).await,
            Command::Proxy { fields } => self.handle_proxy(fields).await,
            Command::Unknown => {
                self.reply(502, "Unsupported command.").await?;
                Ok(Flow::Continue)
            }
        }
    }

    /// Run the connection checker and send the 220 banner.
    async fn welcome(&mut self) -> std::io::Result<Flow> {
        let verdict = self
            .server
            .connection_checker()
            .map(|checker| checker(&self.peer));

        if let Some(Err(err)) = verdict {
            self.report(err).await?;
            return Ok(Flow::Close);
        }

        self.greeted = true;
        self.reply(220, &self.server.welcome_message()).await?;
        Ok(Flow::Continue)
    }

    async fn handle_helo(
        &mut self,
        name: Option<String>,
        protocol: Protocol,
    ) -> std::io::Result<Flow> {
        let Some(name) = name else {
            self.reply(502, "Missing parameter").await?;
            return Ok(Flow::Continue);
        };

        // A duplicate HELO/EHLO is allowed and resets the envelope.
        if self.peer.helo_name.is_some() {
            self.reset();
        }

        let verdict = self
            .server
            .helo_checker()
            .map(|checker| checker(&self.peer, &name));

        if let Some(Err(err)) = verdict {
            self.report(err).await?;
            return Ok(Flow::Continue);
        }

        self.peer.helo_name = Some(name);
        self.peer.protocol = protocol;

        match protocol {
            Protocol::Smtp => self.reply(250, "Go ahead").await?,
            Protocol::Esmtp => {
                let mut lines = vec![self.server.config().hostname.clone()];
                lines.extend(self.extensions().iter().map(ToString::to_string));
                self.reply(250, &lines.join("\n")).await?;
            }
        }

        Ok(Flow::Continue)
    }

    fn extensions(&self) -> Vec<Extension> {
        let config = self.server.config();

        let mut extensions = vec![
            Extension::Size(config.max_message_size),
            Extension::EightBitMime,
            Extension::Pipelining,
        ];

        if config.enable_xclient {
            extensions.push(Extension::Xclient);
        }
        if self.acceptor.is_some() && !self.conn.is_tls() {
            extensions.push(Extension::Starttls);
        }
        if self.server.authenticator().is_some() && self.conn.is_tls() {
            extensions.push(Extension::Auth);
        }

        extensions
    }

    async fn handle_mail(&mut self, path: Option<String>) -> std::io::Result<Flow> {
        let Some(path) = path else {
            self.reply(502, "Invalid syntax.").await?;
            return Ok(Flow::Continue);
        };

        if self.peer.helo_name.is_none() {
            self.reply(502, "Please introduce yourself first.").await?;
            return Ok(Flow::Continue);
        }

        if self.server.config().force_tls && !self.conn.is_tls() {
            self.reply(502, "Please turn on TLS by issuing a STARTTLS command.")
                .await?;
            return Ok(Flow::Continue);
        }

        if self.envelope.is_some() {
            self.reply(502, "Duplicate MAIL").await?;
            return Ok(Flow::Continue);
        }

        let addr = match parse_address(&path) {
            Ok(addr) => addr,
            Err(_) => {
                self.reply(502, "Ill-formatted e-mail address").await?;
                return Ok(Flow::Continue);
            }
        };

        let verdict = self
            .server
            .sender_checker()
            .map(|checker| checker(&self.peer, &addr));

        if let Some(Err(err)) = verdict {
            self.report(err).await?;
            return Ok(Flow::Continue);
        }

        self.envelope = Some(Envelope::new(addr));
        self.reply(250, "Go ahead").await?;
        Ok(Flow::Continue)
    }

    async fn handle_rcpt(&mut self, path: Option<String>) -> std::io::Result<Flow> {
        let Some(path) = path else {
            self.reply(502, "Invalid syntax.").await?;
            return Ok(Flow::Continue);
        };

        let Some(recipients) = self.envelope.as_ref().map(|e| e.recipients.len()) else {
            self.reply(502, "Missing MAIL FROM command.").await?;
            return Ok(Flow::Continue);
        };

        if recipients >= self.server.config().max_recipients {
            self.reply(452, "Too many recipients").await?;
            return Ok(Flow::Continue);
        }

        let addr = match parse_address(&path) {
            Ok(addr) => addr,
            Err(_) => {
                self.reply(502, "Ill-formatted e-mail address").await?;
                return Ok(Flow::Continue);
            }
        };

        let verdict = self
            .server
            .recipient_checker()
            .map(|checker| checker(&self.peer, &addr));

        if let Some(Err(err)) = verdict {
            self.report(err).await?;
            return Ok(Flow::Continue);
        }

        if let Some(envelope) = self.envelope.as_mut() {
            envelope.recipients.push(addr);
        }

        self.reply(250, "Go ahead").await?;
        Ok(Flow::Continue)
    }

    async fn handle_starttls(&mut self) -> std::io::Result<Flow> {
        if self.conn.is_tls() {
            self.reply(502, "Already running in TLS").await?;
            return Ok(Flow::Continue);
        }

        if self.acceptor.is_none() {
            self.reply(502, "TLS not supported").await?;
            return Ok(Flow::Continue);
        }

        self.reply(220, "Go ahead").await?;
        Ok(Flow::Upgrade)
    }

    async fn handle_data(&mut self) -> std::io::Result<Flow> {
        let ready = self
            .envelope
            .as_ref()
            .is_some_and(|e| !e.recipients.is_empty());

        if !ready {
            self.reply(502, "Missing RCPT TO command.").await?;
            return Ok(Flow::Continue);
        }

        self.reply(354, "Go ahead. End your data with <CR><LF>.<CR><LF>")
            .await?;

        let max_size = self.server.config().max_message_size;
        let body = match timeout(
            self.server.config().data_timeout(),
            self.conn.read_dot_body(max_size),
        )
        .await
        {
            Err(_elapsed) => return Ok(Flow::Close),
            Ok(Err(err)) => {
                internal!("read error during DATA from {}: {err}", self.peer.addr);
                return Ok(Flow::Close);
            }
            Ok(Ok(body)) => body,
        };

        match body {
            Some(data) => {
                let mut envelope = self.envelope.take().unwrap_or_default();
                envelope.data = data;

                let verdict = match self.server.handler() {
                    Some(handler) => handler(&self.peer, envelope),
                    None => Ok(()),
                };

                match verdict {
                    Ok(()) => self.reply(250, "Thank you.").await?,
                    Err(err) => self.report(err).await?,
                }
            }
            None => {
                self.reply(
                    552,
                    &format!("Message exceeded max message size of {max_size} bytes"),
                )
                .await?;
                self.reset();
            }
        }

        Ok(Flow::Continue)
    }

    async fn handle_auth(
        &mut self,
        mechanism: Option<String>,
        initial: Option<String>,
    ) -> std::io::Result<Flow> {
        let Some(mechanism) = mechanism else {
            self.reply(502, "Invalid syntax.").await?;
            return Ok(Flow::Continue);
        };

        if self.server.authenticator().is_none() {
            self.reply(502, "AUTH not supported.").await?;
            return Ok(Flow::Continue);
        }

        if self.peer.helo_name.is_none() {
            self.reply(502, "Please introduce yourself first.").await?;
            return Ok(Flow::Continue);
        }

        if !self.conn.is_tls() {
            self.reply(502, "Cannot AUTH in plain text mode. Use STARTTLS.")
                .await?;
            return Ok(Flow::Continue);
        }

        let (username, password) = match mechanism.as_str() {
            "PLAIN" => {
                let auth = match initial {
                    Some(initial) => initial,
                    None => {
                        self.reply(334, "Give me your credentials").await?;
                        match self.read_auth_line().await? {
                            Some(line) => line,
                            None => return Ok(Flow::Close),
                        }
                    }
                };

                match decode_plain(&auth) {
                    Some(credentials) => credentials,
                    None => {
                        self.reply(502, "Couldn't decode your credentials").await?;
                        return Ok(Flow::Continue);
                    }
                }
            }

            "LOGIN" => {
                let username = match initial {
                    Some(initial) => initial,
                    None => {
                        self.reply(334, "VXNlcm5hbWU6").await?;
                        match self.read_auth_line().await? {
                            Some(line) => line,
                            None => return Ok(Flow::Close),
                        }
                    }
                };

                self.reply(334, "UGFzc3dvcmQ6").await?;
                let password = match self.read_auth_line().await? {
                    Some(line) => line,
                    None => return Ok(Flow::Close),
                };

                match (decode_base64(&username), decode_base64(&password)) {
                    (Some(username), Some(password)) => (username, password),
                    _ => {
                        self.reply(502, "Couldn't decode your credentials").await?;
                        return Ok(Flow::Continue);
                    }
                }
            }

            _ => {
                self.reply(502, "Unknown authentication mechanism").await?;
                return Ok(Flow::Continue);
            }
        };

        let verdict = self
            .server
            .authenticator()
            .map(|authenticate| authenticate(&self.peer, &username, &password));

        if let Some(Err(err)) = verdict {
            self.report(err).await?;
            return Ok(Flow::Continue);
        }

        self.peer.username = Some(username);
        self.peer.password = Some(password);
        self.reply(235, "OK, you are now authenticated").await?;
        Ok(Flow::Continue)
    }

    async fn read_auth_line(&mut self) -> std::io::Result<Option<String>> {
        let read = timeout(
            self.server.config().read_timeout(),
            self.conn.read_line(MAX_LINE_LENGTH),
        )
        .await;

        match read {
            Ok(Ok(LineRead::Line(bytes))) => {
                let line = String::from_utf8_lossy(&bytes).into_owned();
                incoming!("{line}");
                Ok(Some(line))
            }
            Ok(Ok(LineRead::TooLong | LineRead::Closed)) | Err(_) => Ok(None),
            Ok(Err(err)) => Err(err),
        }
    }

    async fn handle_xclient(&mut self, attrs: Vec<String>) -> std::io::Result<Flow> {
        if !self.server.config().enable_xclient {
            self.reply(550, "XCLIENT not enabled").await?;
            return Ok(Flow::Continue);
        }

        let mut new_helo = None;
        let mut new_addr: Option<IpAddr> = None;
        let mut new_port: Option<u16> = None;
        let mut new_username = None;
        let mut new_protocol = None;

        for attr in &attrs {
            let Some((name, value)) = attr.split_once('=') else {
                self.reply(502, "Couldn't decode the command.").await?;
                return Ok(Flow::Continue);
            };

            match name {
                // The upstream proxy's own name; unused here.
                "NAME" => {}
                "HELO" => new_helo = Some(value.to_string()),
                "ADDR" => new_addr = value.parse().ok(),
                "PORT" => match value.parse() {
                    Ok(port) => new_port = Some(port),
                    Err(_) => {
                        self.reply(502, "Couldn't decode the command.").await?;
                        return Ok(Flow::Continue);
                    }
                },
                "LOGIN" => new_username = Some(value.to_string()),
                "PROTO" => match value {
                    "SMTP" => new_protocol = Some(Protocol::Smtp),
                    "ESMTP" => new_protocol = Some(Protocol::Esmtp),
                    _ => {}
                },
                _ => {
                    self.reply(502, "Couldn't decode the command.").await?;
                    return Ok(Flow::Continue);
                }
            }
        }

        if let Some(helo) = new_helo {
            self.peer.helo_name = Some(helo);
        }
        if let Some(ip) = new_addr {
            self.peer.addr.set_ip(ip);
        }
        if let Some(port) = new_port {
            self.peer.addr.set_port(port);
        }
        if let Some(username) = new_username {
            self.peer.username = Some(username);
        }
        if let Some(protocol) = new_protocol {
            self.peer.protocol = protocol;
        }

        // The override restarts the greeting under the new identity.
        self.welcome().await
    }

    async fn handle_proxy(&mut self, fields: Vec<String>) -> std::io::Result<Flow> {
        if !self.server.config().enable_proxy_protocol {
            self.reply(550, "Proxy Protocol not enabled").await?;
            return Ok(Flow::Continue);
        }

        // A PROXY header is only valid as the very first line.
        if self.greeted {
            self.reply(502, "Unsupported command.").await?;
            return Ok(Flow::Continue);
        }

        if fields.len() != 5 || (fields[0] != "TCP4" && fields[0] != "TCP6") {
            self.reply(502, "Couldn't decode the command.").await?;
            return Ok(Flow::Continue);
        }

        let (Ok(src_ip), Ok(src_port)) = (fields[1].parse::<IpAddr>(), fields[3].parse::<u16>())
        else {
            self.reply(502, "Couldn't decode the command.").await?;
            return Ok(Flow::Continue);
        };

        self.peer.addr = SocketAddr::new(src_ip, src_port);
        self.welcome().await
    }

    /// Report a checker/handler error: a `SessionError` picks the reply code,
    /// anything else becomes a 502.
    async fn report(&mut self, err: anyhow::Error) -> std::io::Result<()> {
        match err.downcast_ref::<SessionError>() {
            Some(session) => {
                let (code, message) = (session.code, session.message.clone());
                self.reply(code, &message).await
            }
            None => self.reply(502, &err.to_string()).await,
        }
    }

    /// Write a reply; embedded newlines become `-` continuation lines with
    /// the last line using the space separator.
    async fn reply(&mut self, code: u16, message: &str) -> std::io::Result<()> {
        let mut text = String::new();
        let mut lines = message.lines().peekable();

        while let Some(line) = lines.next() {
            let sep = if lines.peek().is_none() { ' ' } else { '-' };
            outgoing!("{code}{sep}{line}");
            text.push_str(&format!("{code}{sep}{line}\r\n"));
        }

        timeout(
            self.server.config().write_timeout(),
            self.conn.send(text.as_bytes()),
        )
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "write timed out"))?
    }

    /// Clear the transaction in progress; the HELO name persists.
    fn reset(&mut self) {
        self.envelope = None;
    }
}

fn decode_plain(auth: &str) -> Option<(String, String)> {
    let bytes = BASE64.decode(auth).ok()?;
    let parts: Vec<&[u8]> = bytes.split(|&b| b == 0).collect();

    if parts.len() != 3 {
        return None;
    }

    Some((
        String::from_utf8_lossy(parts[1]).into_owned(),
        String::from_utf8_lossy(parts[2]).into_owned(),
    ))
}

fn decode_base64(text: &str) -> Option<String> {
    BASE64
        .decode(text.trim())
        .ok()
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
}
