use std::fmt;

#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    /// Operation on a closed buffer or cursor.
    Closed,
    InvalidArgument(&'static str),
    /// Segment directory contains a file whose name does not parse.
    CorruptName(String),
    /// Payload exceeds the configured per-record limit.
    Oversize { size: usize, max: usize },
    /// Blocking read woken by close or interrupt.
    Interrupted,
    Corrupt(&'static str),
    UnsupportedVersion(u32),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(err) => write!(f, "io error: {err}"),
            Error::Closed => write!(f, "buffer closed"),
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Error::CorruptName(name) => write!(f, "corrupt segment file name: {name}"),
            Error::Oversize { size, max } => {
                write!(f, "payload of {size} bytes exceeds limit of {max}")
            }
            Error::Interrupted => write!(f, "blocking read interrupted"),
            Error::Corrupt(msg) => write!(f, "corrupt data: {msg}"),
            Error::UnsupportedVersion(version) => write!(f, "unsupported version: {version}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Error::Io(value)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
