use std::{fs::File, path::Path, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio_rustls::{
    rustls::{
        pki_types::{CertificateDer, PrivateKeyDer},
        CipherSuite, ProtocolVersion, ServerConfig, ServerConnection,
    },
    server::TlsStream,
    TlsAcceptor,
};

use crate::error::TlsError;

/// Maximum accepted command line length; longer lines are reported as
/// `TooLong` after the reader has realigned past the next newline.
pub(crate) const MAX_LINE_LENGTH: usize = 8 * 1024;

/// TLS certificate and private key locations, both PEM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsContext {
    pub certificate: std::path::PathBuf,
    pub key: std::path::PathBuf,
}

impl TlsContext {
    pub(crate) fn acceptor(&self) -> Result<TlsAcceptor, TlsError> {
        let certs = load_certs(&self.certificate)?;
        let key = load_key(&self.key)?;

        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)?;

        Ok(TlsAcceptor::from(Arc::new(config)))
    }
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let file = File::open(path).map_err(|e| TlsError::CertificateLoad {
        path: path.display().to_string(),
        source: e,
    })?;

    rustls_pemfile::certs(&mut std::io::BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::CertificateLoad {
            path: path.display().to_string(),
            source: e,
        })
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let key_load = |reason: String| TlsError::KeyLoad {
        path: path.display().to_string(),
        reason,
    };

    let file = File::open(path).map_err(|e| key_load(e.to_string()))?;
    let mut reader = std::io::BufReader::new(file);

    match rustls_pemfile::read_one(&mut reader).map_err(|e| key_load(e.to_string()))? {
        Some(rustls_pemfile::Item::Pkcs1Key(key)) => Ok(PrivateKeyDer::Pkcs1(key)),
        Some(rustls_pemfile::Item::Pkcs8Key(key)) => Ok(PrivateKeyDer::Pkcs8(key)),
        Some(rustls_pemfile::Item::Sec1Key(key)) => Ok(PrivateKeyDer::Sec1(key)),
        _ => Err(key_load(
            "unable to determine key file format (expected PKCS1, PKCS8, or SEC1)".to_string(),
        )),
    }
}

/// Negotiated TLS parameters, recorded on the peer after a handshake.
#[derive(Debug, Clone, Copy)]
pub struct TlsInfo {
    version: ProtocolVersion,
    cipher: CipherSuite,
}

impl TlsInfo {
    pub(crate) fn of(conn: &ServerConnection) -> Self {
        Self {
            version: conn
                .protocol_version()
                .unwrap_or(ProtocolVersion::Unknown(0)),
            cipher: conn
                .negotiated_cipher_suite()
                .map_or(CipherSuite::Unknown(0), |suite| suite.suite()),
        }
    }

    /// The protocol version for trace headers; unknown values render as hex.
    #[must_use]
    pub fn version_string(&self) -> String {
        match u16::from(self.version) {
            0x0300 => "SSL3.0".to_string(),
            0x0301 => "TLS1.0".to_string(),
            0x0302 => "TLS1.1".to_string(),
            0x0303 => "TLS1.2".to_string(),
            0x0304 => "TLS1.3".to_string(),
            other => format!("0x{other:x}"),
        }
    }

    /// The cipher suite name for trace headers; unknown values render as hex.
    #[must_use]
    pub fn cipher_string(&self) -> String {
        match u16::from(self.cipher) {
            0x1301 => "TLS_AES_128_GCM_SHA256".to_string(),
            0x1302 => "TLS_AES_256_GCM_SHA384".to_string(),
            0x1303 => "TLS_CHACHA20_POLY1305_SHA256".to_string(),
            0xc02b => "TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256".to_string(),
            0xc02c => "TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384".to_string(),
            0xc02f => "TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256".to_string(),
            0xc030 => "TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384".to_string(),
            0xcca8 => "TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256".to_string(),
            0xcca9 => "TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256".to_string(),
            other => format!("0x{other:x}"),
        }
    }
}

/// One CRLF-delimited line off the wire.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum LineRead {
    Line(Vec<u8>),
    /// The line exceeded the limit; input has been realigned past the
    /// terminating newline.
    TooLong,
    Closed,
}

/// The session transport. STARTTLS swaps a `Plain` connection for a `Tls`
/// one; buffered reader state from before the handshake is discarded.
pub(crate) enum Connection<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> {
    Plain { stream: BufReader<Stream> },
    Tls { stream: BufReader<TlsStream<Stream>> },
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> Connection<Stream> {
    pub(crate) fn plain(stream: Stream) -> Self {
        Self::Plain {
            stream: BufReader::new(stream),
        }
    }

    pub(crate) fn tls(stream: TlsStream<Stream>) -> Self {
        Self::Tls {
            stream: BufReader::new(stream),
        }
    }

    pub(crate) fn is_tls(&self) -> bool {
        matches!(self, Self::Tls { .. })
    }

    pub(crate) async fn send(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        match self {
            Self::Plain { stream } => {
                stream.get_mut().write_all(bytes).await?;
                stream.get_mut().flush().await
            }
            Self::Tls { stream } => {
                stream.get_mut().write_all(bytes).await?;
                stream.get_mut().flush().await
            }
        }
    }

    pub(crate) async fn read_line(&mut self, limit: usize) -> std::io::Result<LineRead> {
        match self {
            Self::Plain { stream } => raw_line(stream, limit).await,
            Self::Tls { stream } => raw_line(stream, limit).await,
        }
    }

    /// Read a dot-stuffed DATA body, decoding CRLF to LF and unstuffing
    /// leading dots. Returns `None` when the decoded body exceeded
    /// `max_size`; the remaining input has been drained to the terminator
    /// either way.
    pub(crate) async fn read_dot_body(
        &mut self,
        max_size: usize,
    ) -> std::io::Result<Option<Vec<u8>>> {
        let mut data = Vec::new();
        let mut truncated = false;
        let line_limit = max_size.saturating_add(2);

        loop {
            match self.read_line(line_limit).await? {
                LineRead::Closed => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "connection closed during DATA",
                    ));
                }
                LineRead::TooLong => truncated = true,
                LineRead::Line(line) => {
                    if line == b"." {
                        break;
                    }

                    let content: &[u8] = if line.first() == Some(&b'.') {
                        &line[1..]
                    } else {
                        &line
                    };

                    if !truncated {
                        if data.len() + content.len() + 1 > max_size {
                            truncated = true;
                        } else {
                            data.extend_from_slice(content);
                            data.push(b'\n');
                        }
                    }
                }
            }
        }

        Ok(if truncated { None } else { Some(data) })
    }

    /// Perform the server-side TLS handshake, consuming the plain transport.
    pub(crate) async fn upgrade(
        self,
        acceptor: &TlsAcceptor,
    ) -> std::io::Result<(Self, TlsInfo)> {
        match self {
            Self::Plain { stream } => {
                let stream = acceptor.accept(stream.into_inner()).await?;
                let info = TlsInfo::of(stream.get_ref().1);
                Ok((Self::tls(stream), info))
            }
            Self::Tls { .. } => Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "already running in TLS",
            )),
        }
    }

    /// Shut the socket down, giving the peer a moment to read the final
    /// reply before the FIN.
    pub(crate) async fn close(&mut self) {
        tokio::time::sleep(Duration::from_millis(200)).await;

        let _ = match self {
            Self::Plain { stream } => stream.get_mut().shutdown().await,
            Self::Tls { stream } => stream.get_mut().shutdown().await,
        };
    }
}

async fn raw_line<R>(reader: &mut R, limit: usize) -> std::io::Result<LineRead>
where
    R: AsyncBufRead + Unpin,
{
    let mut line: Vec<u8> = Vec::new();

    loop {
        let buf = reader.fill_buf().await?;
        if buf.is_empty() {
            return Ok(LineRead::Closed);
        }

        if let Some(pos) = buf.iter().position(|&b| b == b'\n') {
            line.extend_from_slice(&buf[..pos]);
            reader.consume(pos + 1);

            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if line.len() > limit {
                return Ok(LineRead::TooLong);
            }
            return Ok(LineRead::Line(line));
        }

        if line.len() + buf.len() > limit {
            // Overflow mid-line: drop what we have and realign past the
            // next newline so the session can keep going.
            let n = buf.len();
            reader.consume(n);
            line.clear();

            loop {
                let buf = reader.fill_buf().await?;
                if buf.is_empty() {
                    return Ok(LineRead::Closed);
                }
                if let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                    reader.consume(pos + 1);
                    return Ok(LineRead::TooLong);
                }
                let n = buf.len();
                reader.consume(n);
            }
        }

        let n = buf.len();
        line.extend_from_slice(buf);
        reader.consume(n);
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;

    use super::*;

    async fn connection_with(input: &[u8]) -> Connection<tokio::io::DuplexStream> {
        let (client, server) = tokio::io::duplex(128 * 1024);
        let mut client = client;
        client.write_all(input).await.unwrap();
        drop(client);
        Connection::plain(server)
    }

    #[tokio::test]
    async fn reads_crlf_and_lf_lines() {
        let mut conn = connection_with(b"EHLO localhost\r\nNOOP\n").await;
        assert_eq!(
            conn.read_line(MAX_LINE_LENGTH).await.unwrap(),
            LineRead::Line(b"EHLO localhost".to_vec())
        );
        assert_eq!(
            conn.read_line(MAX_LINE_LENGTH).await.unwrap(),
            LineRead::Line(b"NOOP".to_vec())
        );
        assert_eq!(
            conn.read_line(MAX_LINE_LENGTH).await.unwrap(),
            LineRead::Closed
        );
    }

    #[tokio::test]
    async fn too_long_line_realigns_to_next_command() {
        let mut input = vec![b'x'; 64 * 1024];
        input.extend_from_slice(b"\r\nNOOP\r\n");
        let mut conn = connection_with(&input).await;

        assert_eq!(
            conn.read_line(MAX_LINE_LENGTH).await.unwrap(),
            LineRead::TooLong
        );
        assert_eq!(
            conn.read_line(MAX_LINE_LENGTH).await.unwrap(),
            LineRead::Line(b"NOOP".to_vec())
        );
    }

    #[tokio::test]
    async fn dot_body_is_unstuffed_and_lf_normalized() {
        let mut conn =
            connection_with(b"line one\r\n..leading dot\r\nline three\r\n.\r\nNOOP\r\n").await;

        let body = conn.read_dot_body(1024).await.unwrap().unwrap();
        assert_eq!(body, b"line one\n.leading dot\nline three\n");

        // The terminator is consumed; the next command is intact.
        assert_eq!(
            conn.read_line(MAX_LINE_LENGTH).await.unwrap(),
            LineRead::Line(b"NOOP".to_vec())
        );
    }

    #[tokio::test]
    async fn dot_body_over_limit_is_drained() {
        let mut conn = connection_with(b"This is the email body\r\n.\r\nQUIT\r\n").await;

        assert_eq!(conn.read_dot_body(5).await.unwrap(), None);
        assert_eq!(
            conn.read_line(MAX_LINE_LENGTH).await.unwrap(),
            LineRead::Line(b"QUIT".to_vec())
        );
    }

    #[tokio::test]
    async fn dot_body_at_exact_limit_is_accepted() {
        // "12345\r\n" decodes to "12345\n": exactly six bytes.
        let mut conn = connection_with(b"12345\r\n.\r\n").await;
        let body = conn.read_dot_body(6).await.unwrap().unwrap();
        assert_eq!(body, b"12345\n");
    }

    #[tokio::test]
    async fn dot_body_closed_midway_is_an_error() {
        let mut conn = connection_with(b"no terminator\r\n").await;
        assert!(conn.read_dot_body(1024).await.is_err());
    }
}
