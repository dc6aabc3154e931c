//! A library for building inbound SMTP servers.
//!
//! The library supplies a byte stream framer, a SASL authenticator and an SMTP
//! state machine. The user of the library supplies I/O code and a `Handler`
//! implementation that makes policy decisions for each connection.
//!
//! Bytes received from the client are passed to `Connection::process()`, which
//! returns the responses to send back in order. Each `Response` carries an
//! `Action` telling the I/O code what to do after writing it.
//!
//! # Pseudo Code
//! ```rust,ignore
//! // Configuration shared by all connections
//! let mut builder = ConnectionBuilder::new("mx.example.org");
//! builder.enable_start_tls().enable_auth(AuthMechanism::Plain);
//!
//! // Create a connection when a new client connects
//! let mut conn = builder.build(local_addr, peer_addr, handler);
//! let mut responses = conn.start();
//!
//! loop {
//!     for res in responses.drain(..) {
//!         res.write_to(&mut tcp)?;
//!         match res.action {
//!             Action::Close => return conn.close(),
//!             Action::UpgradeTls => {
//!                 let tls_info = tls_handshake(&mut tcp)?;
//!                 responses = conn.tls_established(tls_info);
//!                 continue;
//!             }
//!             Action::Reply | Action::NoReply => (),
//!         }
//!     }
//!     let n = tcp.read(&mut buf)?;
//!     responses = if n == 0 { conn.finish() } else { conn.process(&buf[..n]) };
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod auth;
mod cmd;
mod connection;
mod fsm;
mod parser;
mod response;
mod sasl;
mod session;
pub mod stream;

pub use crate::auth::{AuthAttempt, AuthMechanism, CramMd5, Credentials, OAuthError};
pub use crate::connection::{CloseSignal, Connection, ConnectionBuilder};
pub use crate::response::{Action, Response};
pub use crate::session::{Address, Envelope, OpeningCommand, ParamValue, Session, TlsInfo};

use std::error;
use std::fmt;
use std::io::{sink, Write};

/// A `Handler` makes decisions about incoming mail commands.
///
/// A Handler implementation must be provided by code using the postin library.
///
/// All methods have a default implementation that accepts everything except
/// authentication. A separate handler instance should be created for each
/// connection. Every method is called at most once per event and the
/// connection waits for it to return.
///
/// # Examples
/// ```
/// # use postin::{Address, Handler, Reject, Session};
/// struct MyHandler {}
///
/// impl Handler for MyHandler {
///     fn connect(&mut self, session: &Session) -> Result<(), Reject> {
///         if session.remote_addr.ip().to_string() == "1.2.3.4" {
///             Err(Reject::with_code(421, "Blacklisted IP"))
///         } else {
///             Ok(())
///         }
///     }
///
///     fn rcpt(&mut self, to: &Address, _session: &Session) -> Result<(), Reject> {
///         if to.address == "alienscience@example.org" {
///             Ok(())
///         } else {
///             Err(Reject::no_mailbox())
///         }
///     }
/// }
/// ```
pub trait Handler {
    /// Called before the greeting is sent
    fn connect(&mut self, _session: &Session) -> Result<(), Reject> {
        Ok(())
    }

    /// Called after a TLS handshake, `session.tls` holds the negotiated parameters
    fn secure(&mut self, _session: &Session) -> Result<(), Reject> {
        Ok(())
    }

    /// Called when a client has sent credentials
    fn auth(&mut self, _attempt: &AuthAttempt, _session: &Session) -> AuthResult {
        AuthResult::InvalidCredentials
    }

    /// Called when a mail transaction is started with MAIL FROM
    fn mail(&mut self, _from: &Address, _session: &Session) -> Result<(), Reject> {
        Ok(())
    }

    /// Called when a mail recipient is given with RCPT TO
    fn rcpt(&mut self, _to: &Address, _session: &Session) -> Result<(), Reject> {
        Ok(())
    }

    /// Called when a DATA command is received.
    ///
    /// This function must return a writer and the email body will be written to
    /// this writer as it arrives.
    fn data(&mut self, _session: &Session) -> DataResult {
        DataResult::Ok(Box::new(sink()))
    }

    /// Called when the message body is complete.
    ///
    /// Returning `Ok(Some(message))` replaces the default queued message. If
    /// `summary.size_exceeded` is set the handler is expected to reject the
    /// message, usually with `Reject::size_exceeded`.
    fn data_end(
        &mut self,
        _summary: &DataSummary,
        _session: &Session,
    ) -> Result<Option<String>, Reject> {
        Ok(None)
    }

    /// Called once when the connection closes
    fn close(&mut self, _session: &Session) {}
}

impl<H: Handler + ?Sized> Handler for &mut H {
    fn connect(&mut self, session: &Session) -> Result<(), Reject> {
        (**self).connect(session)
    }

    fn secure(&mut self, session: &Session) -> Result<(), Reject> {
        (**self).secure(session)
    }

    fn auth(&mut self, attempt: &AuthAttempt, session: &Session) -> AuthResult {
        (**self).auth(attempt, session)
    }

    fn mail(&mut self, from: &Address, session: &Session) -> Result<(), Reject> {
        (**self).mail(from, session)
    }

    fn rcpt(&mut self, to: &Address, session: &Session) -> Result<(), Reject> {
        (**self).rcpt(to, session)
    }

    fn data(&mut self, session: &Session) -> DataResult {
        (**self).data(session)
    }

    fn data_end(
        &mut self,
        summary: &DataSummary,
        session: &Session,
    ) -> Result<Option<String>, Reject> {
        (**self).data_end(summary, session)
    }

    fn close(&mut self, session: &Session) {
        (**self).close(session)
    }
}

//------ Results of Handler calls ----------------------------------------------

/// A rejection returned by a `Handler`.
///
/// The message is sent to the client with the given code, or with a default
/// code that depends on the command when no code is given. A code of 421
/// closes the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reject {
    /// SMTP reply code
    pub code: Option<u16>,
    /// Text sent to the client
    pub message: String,
}

impl Reject {
    /// Reject with the default code for the command
    pub fn new<S: Into<String>>(message: S) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }

    /// Reject with the given reply code
    pub fn with_code<S: Into<String>>(code: u16, message: S) -> Self {
        Self {
            code: Some(code),
            message: message.into(),
        }
    }

    /// Service not available, closing transmission channel
    pub fn no_service() -> Self {
        Self::with_code(421, "Service not available, closing connection")
    }

    /// Requested action aborted: local error in processing
    pub fn internal_error() -> Self {
        Self::with_code(451, "Aborted: local error in processing")
    }

    /// Requested action not taken: insufficient system storage
    pub fn out_of_space() -> Self {
        Self::with_code(452, "Insufficient system storage")
    }

    /// No mailbox with the given name exists
    pub fn no_mailbox() -> Self {
        Self::with_code(550, "Mailbox unavailable")
    }

    /// The ip address is on blocklists
    pub fn blocked_ip() -> Self {
        Self::with_code(550, "IP address on blocklists")
    }

    /// Exceeded storage allocation
    pub fn no_storage() -> Self {
        Self::with_code(552, "Exceeded storage allocation")
    }

    /// The message was larger than the given maximum
    pub fn size_exceeded(max_size: usize) -> Self {
        Self::with_code(
            552,
            format!("Error: message exceeds fixed maximum message size {}", max_size),
        )
    }

    /// The mailbox name is not allowed
    pub fn bad_mailbox() -> Self {
        Self::with_code(553, "Mailbox name not allowed")
    }

    /// Transaction failed
    pub fn transaction_failed() -> Self {
        Self::with_code(554, "Transaction failed")
    }
}

impl fmt::Display for Reject {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} {}", code, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl error::Error for Reject {}

/// `DataResult` is the result of an smtp DATA command
pub enum DataResult {
    /// Start the message body, bytes are written to the Writer
    Ok(Box<dyn Write>),
    /// Refuse the message before the body is sent (default code 554)
    Reject(Reject),
}

/// Facts about a received message body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DataSummary {
    /// Bytes received after dot-stuffing was removed
    pub size: usize,
    /// The size was larger than the configured maximum
    pub size_exceeded: bool,
}

/// `AuthResult` is the result of authenticating a smtp session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthResult {
    /// Authentication successful, the user is stored in `Session::user`
    Ok(String),
    /// Temporary authentication failure
    TemporaryFailure,
    /// Invalid or insufficient credentials
    InvalidCredentials,
    /// Reject with a custom message (default code 535)
    Reject(Reject),
    /// Send an XOAUTH2 error challenge before failing.
    ///
    /// Treated as `InvalidCredentials` for other mechanisms.
    OAuthChallenge(OAuthError),
}
