use chrono::Utc;

use super::Peer;

/// A message envelope: the sender, recipients and body accumulated over one
/// MAIL/RCPT/DATA transaction.
#[derive(Debug, Clone, Default)]
pub struct Envelope {
    /// Bare sender address; empty for the null sender `<>`.
    pub sender: String,
    /// Accepted recipients, in RCPT order.
    pub recipients: Vec<String>,
    /// Message body, dot-unstuffed, with LF line endings.
    pub data: Vec<u8>,
}

impl Envelope {
    pub(crate) fn new(sender: String) -> Self {
        Self {
            sender,
            ..Self::default()
        }
    }

    /// Prepend an RFC 5321 `Received:` trace header recording this handoff.
    ///
    /// Long lines are soft-wrapped at whitespace around 76 columns. When the
    /// session is encrypted, the TLS version and cipher are recorded on a
    /// continuation line.
    pub fn add_received_line(&mut self, peer: &Peer) {
        let tls_details = peer.tls.as_ref().map_or_else(String::new, |tls| {
            format!(
                "\r\n\t(version={} cipher={});",
                tls.version_string(),
                tls.cipher_string()
            )
        });

        let line = wrap(
            format!(
                "Received: from {} ([{}]) by {} with {};{}\r\n\t{}\r\n",
                peer.helo_name.as_deref().unwrap_or(""),
                peer.addr.ip(),
                peer.server_name,
                peer.protocol,
                tls_details,
                Utc::now().format("%a, %d %b %Y %H:%M:%S +0000 (UTC)"),
            )
            .into_bytes(),
        );

        let mut data = line;
        data.extend_from_slice(&self.data);
        self.data = data;
    }
}

/// Soft-wrap a header at whitespace once a line exceeds ~76 columns,
/// replacing the space with a CRLF plus continuation tab.
fn wrap(input: Vec<u8>) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len() + 8);
    let mut length = 0usize;

    for byte in input {
        if length > 76 && byte == b' ' {
            out.extend_from_slice(b"\r\n\t");
            length = 1;
            continue;
        }
        if byte == b'\n' {
            length = 0;
        }
        out.push(byte);
        length += 1;
    }

    out
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use super::*;
    use crate::smtp::Protocol;

    fn peer() -> Peer {
        let addr: SocketAddr = "127.0.0.1:42042".parse().unwrap();
        let mut peer = Peer::new(addr, "mx.example.org".to_string());
        peer.helo_name = Some("client.example.net".to_string());
        peer.protocol = Protocol::Esmtp;
        peer
    }

    #[test]
    fn received_line_is_prepended() {
        let mut env = Envelope::new("sender@example.org".to_string());
        env.data = b"Subject: test\n\nbody\n".to_vec();
        env.add_received_line(&peer());

        let text = String::from_utf8(env.data).unwrap();
        assert!(text.starts_with("Received: "), "got: {text}");
        assert!(text.contains("from client.example.net ([127.0.0.1])"));
        assert!(text.contains("by mx.example.org with ESMTP;"));
        assert!(text.ends_with("body\n"));
    }

    #[test]
    fn received_line_without_tls_has_no_version_segment() {
        let mut env = Envelope::default();
        env.add_received_line(&peer());

        let text = String::from_utf8(env.data).unwrap();
        assert!(!text.contains("version="));
        assert!(!text.contains("cipher="));
    }

    #[test]
    fn wrap_folds_long_lines_at_whitespace() {
        let long = format!("Received: from {} more trailing words", "x".repeat(80));
        let folded = String::from_utf8(wrap(long.into_bytes())).unwrap();
        assert!(folded.contains("\r\n\t"));
        for line in folded.split("\r\n") {
            // Wrapping happens at the first space after column 76; the
            // unbreakable run itself may exceed that.
            assert!(!line.contains(" more trailing"));
        }
    }

    #[test]
    fn wrap_leaves_short_lines_alone() {
        let short = b"Received: from a by b;\r\n".to_vec();
        assert_eq!(wrap(short.clone()), short);
    }
}
