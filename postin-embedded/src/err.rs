use std::error;
use std::fmt;
use std::io;

/// What went wrong while setting up or running the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The server was configured incorrectly
    Config,
    /// A socket or file operation failed
    Io,
    /// Certificates could not be loaded or a TLS session failed
    Tls,
}

/// All crate errors are wrapped in this custom error type
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    original: Option<Box<dyn error::Error + Send + Sync>>,
    msg: String,
}

impl Error {
    pub(crate) fn new<S>(msg: S) -> Self
    where
        S: Into<String>,
    {
        Self {
            kind: ErrorKind::Config,
            original: None,
            msg: msg.into(),
        }
    }

    pub(crate) fn io<S: Into<String>>(msg: S, source: io::Error) -> Self {
        Self {
            kind: ErrorKind::Io,
            original: Some(Box::new(source)),
            msg: msg.into(),
        }
    }

    pub(crate) fn tls<S, E>(msg: S, source: E) -> Self
    where
        S: Into<String>,
        E: error::Error + Send + Sync + 'static,
    {
        Self {
            kind: ErrorKind::Tls,
            original: Some(Box::new(source)),
            msg: msg.into(),
        }
    }

    pub(crate) fn bail<T, S>(msg: S) -> Result<T, Self>
    where
        S: Into<String>,
    {
        Err(Error::new(msg))
    }

    /// The category of the error
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.original {
            Some(original) if !self.msg.is_empty() => {
                write!(f, "{}: {}", self.msg, original)
            }
            Some(original) => write!(f, "{}", original),
            None => write!(f, "{}", self.msg),
        }
    }
}

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Self {
        Self::io("", error)
    }
}

impl From<rustls::Error> for Error {
    fn from(error: rustls::Error) -> Self {
        Self::tls("TLS error", error)
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        self.original
            .as_ref()
            .map(|o| o.as_ref() as &(dyn error::Error + 'static))
    }
}
