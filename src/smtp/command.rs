//! Command line tokenizer.
//!
//! A command line is split on whitespace into fields, the first field is the
//! verb (matched case-insensitively), and for MAIL/RCPT the second field is
//! colon-split into a keyword/argument pair. Senders that write
//! `MAIL FROM: <a@b>` with a stray space after the colon are tolerated by
//! concatenating the following field.

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Command {
    Helo {
        name: Option<String>,
    },
    Ehlo {
        name: Option<String>,
    },
    Mail {
        path: Option<String>,
    },
    Rcpt {
        path: Option<String>,
    },
    StartTls,
    Data,
    Rset,
    Noop,
    Quit,
    Auth {
        mechanism: Option<String>,
        initial: Option<String>,
    },
    Xclient {
        attrs: Vec<String>,
    },
    Proxy {
        fields: Vec<String>,
    },
    Unknown,
}

impl Command {
    pub(crate) fn parse(line: &str) -> Self {
        let fields: Vec<&str> = line.split_whitespace().collect();

        let Some(verb) = fields.first() else {
            return Self::Unknown;
        };

        match verb.to_ascii_uppercase().as_str() {
            "HELO" => Self::Helo {
                name: fields.get(1).map(ToString::to_string),
            },
            "EHLO" => Self::Ehlo {
                name: fields.get(1).map(ToString::to_string),
            },
            "MAIL" => Self::Mail {
                path: envelope_path(&fields, "FROM"),
            },
            "RCPT" => Self::Rcpt {
                path: envelope_path(&fields, "TO"),
            },
            "STARTTLS" => Self::StartTls,
            "DATA" => Self::Data,
            "RSET" => Self::Rset,
            "NOOP" => Self::Noop,
            "QUIT" => Self::Quit,
            "AUTH" => Self::Auth {
                mechanism: fields.get(1).map(|m| m.to_ascii_uppercase()),
                initial: fields.get(2).map(ToString::to_string),
            },
            "XCLIENT" => Self::Xclient {
                attrs: fields[1..].iter().map(ToString::to_string).collect(),
            },
            "PROXY" => Self::Proxy {
                fields: fields[1..].iter().map(ToString::to_string).collect(),
            },
            _ => Self::Unknown,
        }
    }
}

/// Extract the path argument of `MAIL FROM:<...>` / `RCPT TO:<...>`.
///
/// Returns `None` when the argument does not split into exactly the expected
/// keyword and one value; the session reports that as a syntax error.
fn envelope_path(fields: &[&str], keyword: &str) -> Option<String> {
    let mut arg = (*fields.get(1)?).to_string();

    // "MAIL FROM: <a@b>" arrives as ["MAIL", "FROM:", "<a@b>"]
    if arg.ends_with(':') {
        if let Some(rest) = fields.get(2) {
            arg.push_str(rest);
        }
    }

    let params: Vec<&str> = arg.split(':').collect();
    if params.len() != 2 || !params[0].eq_ignore_ascii_case(keyword) {
        return None;
    }

    Some(params[1].trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbs_are_case_insensitive() {
        assert_eq!(Command::parse("QUIT"), Command::Quit);
        assert_eq!(Command::parse("quit"), Command::Quit);
        assert_eq!(Command::parse("Rset"), Command::Rset);
        assert_eq!(Command::parse("noop"), Command::Noop);
        assert_eq!(Command::parse("starttls"), Command::StartTls);
        assert_eq!(Command::parse("data"), Command::Data);
    }

    #[test]
    fn unknown_verbs() {
        assert_eq!(Command::parse("quite"), Command::Unknown);
        assert_eq!(Command::parse("FLIBBLE a b c"), Command::Unknown);
        assert_eq!(Command::parse(""), Command::Unknown);
    }

    #[test]
    fn helo_with_and_without_name() {
        assert_eq!(
            Command::parse("HELO mail.example.org"),
            Command::Helo {
                name: Some("mail.example.org".to_string())
            }
        );
        assert_eq!(Command::parse("EHLO"), Command::Ehlo { name: None });
    }

    #[test]
    fn mail_from_variants() {
        assert_eq!(
            Command::parse("MAIL FROM:<test@example.org>"),
            Command::Mail {
                path: Some("<test@example.org>".to_string())
            }
        );
        // Stray space after the colon is tolerated.
        assert_eq!(
            Command::parse("MAIL FROM: <test@example.org>"),
            Command::Mail {
                path: Some("<test@example.org>".to_string())
            }
        );
        assert_eq!(
            Command::parse("mail from:<test@example.org>"),
            Command::Mail {
                path: Some("<test@example.org>".to_string())
            }
        );
        // ESMTP parameters after the path are ignored, not rejected.
        assert_eq!(
            Command::parse("MAIL FROM:<test@example.org> BODY=8BITMIME"),
            Command::Mail {
                path: Some("<test@example.org>".to_string())
            }
        );
    }

    #[test]
    fn mail_syntax_errors() {
        assert_eq!(Command::parse("MAIL"), Command::Mail { path: None });
        assert_eq!(
            Command::parse("MAIL TO:<test@example.org>"),
            Command::Mail { path: None }
        );
        assert_eq!(
            Command::parse("MAIL FROM <test@example.org>"),
            Command::Mail { path: None }
        );
    }

    #[test]
    fn rcpt_to() {
        assert_eq!(
            Command::parse("RCPT TO:<r@example.net>"),
            Command::Rcpt {
                path: Some("<r@example.net>".to_string())
            }
        );
        assert_eq!(
            Command::parse("RCPT FROM:<r@example.net>"),
            Command::Rcpt { path: None }
        );
    }

    #[test]
    fn null_sender_path() {
        assert_eq!(
            Command::parse("MAIL FROM:<>"),
            Command::Mail {
                path: Some("<>".to_string())
            }
        );
    }

    #[test]
    fn auth_with_initial_response() {
        assert_eq!(
            Command::parse("AUTH LOGIN Zm9v"),
            Command::Auth {
                mechanism: Some("LOGIN".to_string()),
                initial: Some("Zm9v".to_string()),
            }
        );
        assert_eq!(
            Command::parse("auth plain"),
            Command::Auth {
                mechanism: Some("PLAIN".to_string()),
                initial: None,
            }
        );
        assert_eq!(
            Command::parse("AUTH"),
            Command::Auth {
                mechanism: None,
                initial: None,
            }
        );
    }

    #[test]
    fn xclient_attrs_kept_raw() {
        assert_eq!(
            Command::parse("XCLIENT NAME=ignored ADDR=42.42.42.42"),
            Command::Xclient {
                attrs: vec!["NAME=ignored".to_string(), "ADDR=42.42.42.42".to_string()]
            }
        );
    }

    #[test]
    fn proxy_fields_kept_raw() {
        assert_eq!(
            Command::parse("PROXY TCP4 1.2.3.4 5.6.7.8 1000 2000"),
            Command::Proxy {
                fields: vec![
                    "TCP4".to_string(),
                    "1.2.3.4".to_string(),
                    "5.6.7.8".to_string(),
                    "1000".to_string(),
                    "2000".to_string(),
                ]
            }
        );
    }
}
