use core::fmt::{self, Display};

/// An ESMTP extension advertised in the EHLO response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Extension {
    Size(usize),
    EightBitMime,
    Pipelining,
    Xclient,
    Starttls,
    Auth,
}

impl Display for Extension {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        match self {
            Self::Size(max) => write!(fmt, "SIZE {max}"),
            Self::EightBitMime => fmt.write_str("8BITMIME"),
            Self::Pipelining => fmt.write_str("PIPELINING"),
            Self::Xclient => fmt.write_str("XCLIENT"),
            Self::Starttls => fmt.write_str("STARTTLS"),
            Self::Auth => fmt.write_str("AUTH PLAIN LOGIN"),
        }
    }
}
