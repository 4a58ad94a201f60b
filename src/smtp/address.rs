//! Mailbox parsing for MAIL FROM / RCPT TO arguments.
//!
//! RFC 5321 mailbox specifications are not quite RFC 5322 addresses, but
//! enough badly behaved MTAs and MUAs send 5322 forms (display names, bare
//! addresses without angle brackets) that it pays to accept them and parse
//! down to the bare address.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed e-mail address: {0}")]
pub struct AddressError(pub String);

/// Parse the argument of `MAIL FROM:` / `RCPT TO:` down to a bare address.
///
/// Accepts `<addr>`, bare `addr`, and display-name forms; the null sender
/// `<>` parses to the empty string. A mailbox must contain exactly one `@`.
pub(crate) fn parse_address(src: &str) -> Result<String, AddressError> {
    let src = src.trim();

    if src == "<>" {
        return Ok(String::new());
    }

    if src.bytes().filter(|&b| b == b'@').count() != 1 {
        return Err(AddressError(src.to_string()));
    }

    match mailparse::addrparse(src) {
        Ok(list) => match list.first() {
            Some(mailparse::MailAddr::Single(single)) => Ok(single.addr.clone()),
            _ => Err(AddressError(src.to_string())),
        },
        Err(_) => Err(AddressError(src.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bracketed() {
        assert_eq!(
            parse_address("<sender@example.org>").unwrap(),
            "sender@example.org"
        );
    }

    #[test]
    fn bare() {
        assert_eq!(
            parse_address("sender@example.org").unwrap(),
            "sender@example.org"
        );
    }

    #[test]
    fn null_sender() {
        assert_eq!(parse_address("<>").unwrap(), "");
    }

    #[test]
    fn display_name_is_stripped() {
        assert_eq!(
            parse_address("Postmaster <postmaster@example.org>").unwrap(),
            "postmaster@example.org"
        );
    }

    #[test]
    fn surrounding_whitespace() {
        assert_eq!(
            parse_address(" <test@example.org> ").unwrap(),
            "test@example.org"
        );
    }

    #[test]
    fn double_at_rejected() {
        assert!(parse_address("<a@b@example.org>").is_err());
    }

    #[test]
    fn missing_at_rejected() {
        assert!(parse_address("<senderexample.org>").is_err());
        assert!(parse_address("").is_err());
    }
}
