use crate::Reject;
use log::trace;
use std::io;
use std::io::Write;

//------ Responses -------------------------------------------------------------

pub(crate) const EMPTY_RESPONSE: Response = Response::empty();
pub(crate) const START_TLS: Response =
    Response::constant(220, "Ready to start TLS", false, Action::UpgradeTls);
pub(crate) const GOODBYE: Response = Response::constant(221, "Goodbye", false, Action::Close);
pub(crate) const HELP: Response = Response::constant(
    214,
    "See https://tools.ietf.org/html/rfc5321 for details",
    false,
    Action::Reply,
);
pub(crate) const AUTH_OK: Response =
    Response::constant(235, "Authentication successful", false, Action::Reply);
pub(crate) const OK: Response = Response::constant(250, "OK", false, Action::Reply);
pub(crate) const ACCEPTED: Response = Response::constant(250, "Accepted", false, Action::Reply);
pub(crate) const QUEUED: Response =
    Response::constant(250, "OK: message queued", false, Action::Reply);
pub(crate) const VERIFY_RESPONSE: Response =
    Response::constant(252, "Maybe", false, Action::Reply);
pub(crate) const START_DATA: Response = Response::constant(
    354,
    "End data with <CR><LF>.<CR><LF>",
    false,
    Action::Reply,
);
pub(crate) const EARLY_TALKER: Response =
    Response::constant(421, "You talk too soon", true, Action::Close);
pub(crate) const HTTP_REQUEST: Response =
    Response::constant(421, "HTTP requests not allowed", true, Action::Close);
pub(crate) const TOO_MANY_UNRECOGNIZED: Response = Response::constant(
    421,
    "Error: too many unrecognized commands",
    true,
    Action::Close,
);
pub(crate) const TOO_MANY_UNAUTHENTICATED: Response = Response::constant(
    421,
    "Error: too many unauthenticated commands",
    true,
    Action::Close,
);
pub(crate) const TIMEOUT: Response =
    Response::constant(421, "Timeout - closing connection", true, Action::Close);
pub(crate) const SHUTTING_DOWN: Response =
    Response::constant(421, "Server shutting down", true, Action::Close);
pub(crate) const INTERNAL_ERROR: Response = Response::constant(
    451,
    "Error: local error in processing",
    true,
    Action::Reply,
);
pub(crate) const TEMPORARY_AUTH_FAILURE: Response = Response::constant(
    454,
    "Error: temporary authentication failure",
    true,
    Action::Reply,
);
pub(crate) const UNRECOGNIZED: Response =
    Response::constant(500, "Error: command not recognized", true, Action::Reply);
pub(crate) const AUTH_ABORTED: Response =
    Response::constant(501, "Authentication aborted", true, Action::Reply);
pub(crate) const INVALID_USERDATA: Response =
    Response::constant(501, "Error: invalid userdata", true, Action::Reply);
pub(crate) const BAD_SENDER: Response =
    Response::constant(501, "Error: Bad sender address syntax", true, Action::Reply);
pub(crate) const BAD_RECIPIENT: Response = Response::constant(
    501,
    "Error: Bad recipient address syntax",
    true,
    Action::Reply,
);
pub(crate) const BAD_PARAMETER: Response = Response::constant(
    501,
    "Error: Bad command parameter syntax",
    true,
    Action::Reply,
);
pub(crate) const SYNTAX_ERROR: Response =
    Response::constant(501, "Error: syntax error", true, Action::Reply);
pub(crate) const NOT_IMPLEMENTED: Response =
    Response::constant(502, "Error: command not implemented", true, Action::Reply);
pub(crate) const NESTED_MAIL: Response =
    Response::constant(503, "Error: nested MAIL command", true, Action::Reply);
pub(crate) const NEED_MAIL: Response =
    Response::constant(503, "Error: need MAIL command", true, Action::Reply);
pub(crate) const NEED_RCPT: Response =
    Response::constant(503, "Error: need RCPT command", true, Action::Reply);
pub(crate) const NEED_HELO: Response =
    Response::constant(503, "Error: send HELO/EHLO first", true, Action::Reply);
pub(crate) const NEED_LHLO: Response =
    Response::constant(503, "Error: send LHLO first", true, Action::Reply);
pub(crate) const TLS_ALREADY_ACTIVE: Response =
    Response::constant(503, "Error: TLS already active", true, Action::Reply);
pub(crate) const TLS_IN_TRANSACTION: Response = Response::constant(
    503,
    "Error: STARTTLS not allowed during a mail transaction",
    true,
    Action::Reply,
);
pub(crate) const TRANSACTION_IN_PROGRESS: Response =
    Response::constant(503, "Error: Mail transaction in progress", true, Action::Reply);
pub(crate) const NO_IDENTITY_CHANGES: Response = Response::constant(
    503,
    "Error: No identity changes permitted",
    true,
    Action::Reply,
);
pub(crate) const UNKNOWN_MECHANISM: Response = Response::constant(
    504,
    "Error: Unrecognized authentication type",
    true,
    Action::Reply,
);
pub(crate) const AUTHENTICATION_REQUIRED: Response =
    Response::constant(530, "Error: authentication Required", true, Action::Reply);
pub(crate) const MUST_STARTTLS: Response = Response::constant(
    530,
    "Error: Must issue a STARTTLS command first",
    true,
    Action::Reply,
);
pub(crate) const INVALID_CREDENTIALS: Response = Response::constant(
    535,
    "Error: Authentication credentials invalid",
    true,
    Action::Reply,
);

//------ Types -----------------------------------------------------------------

/// Response contains a code and message to be sent back to the client
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response {
    /// The three digit response code
    pub code: u16,
    message: Message,
    /// Is the response an error response?
    pub is_error: bool,
    /// The action to take after sending the response to the client
    pub action: Action,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Message {
    Fixed(&'static str),
    Text(String),
    Lines(Vec<String>),
    Empty,
}

/// Action indicates the recommended action to take on a response
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum Action {
    /// Send the response and close the connection
    Close,
    /// Send the response (if any) and upgrade the connection to use TLS
    UpgradeTls,
    /// Do not reply, wait for the client to send more data
    NoReply,
    /// Send a reply and keep the connection open
    Reply,
}

impl Response {
    // A response that can be used in const definitions
    pub(crate) const fn constant(
        code: u16,
        message: &'static str,
        is_error: bool,
        action: Action,
    ) -> Self {
        Self {
            code,
            message: Message::Fixed(message),
            is_error,
            action,
        }
    }

    // An empty response
    pub(crate) const fn empty() -> Self {
        Self {
            code: 0,
            message: Message::Empty,
            is_error: false,
            action: Action::NoReply,
        }
    }

    // Ask the IO layer for a TLS handshake without sending anything
    pub(crate) const fn handshake() -> Self {
        Self {
            code: 0,
            message: Message::Empty,
            is_error: false,
            action: Action::UpgradeTls,
        }
    }

    // A single line response built at runtime
    pub(crate) fn text<S: Into<String>>(code: u16, message: S) -> Self {
        let action = match code {
            221 | 421 => Action::Close,
            _ => Action::Reply,
        };
        Self {
            code,
            message: Message::Text(message.into()),
            is_error: !(200..400).contains(&code),
            action,
        }
    }

    // A multiline response, the first line is the head
    pub(crate) fn lines(code: u16, lines: Vec<String>) -> Self {
        Self {
            code,
            message: Message::Lines(lines),
            is_error: !(200..400).contains(&code),
            action: Action::Reply,
        }
    }

    // A response built from a handler rejection
    pub(crate) fn reject(reject: &Reject, default_code: u16) -> Self {
        Self::text(reject.code.unwrap_or(default_code), reject.message.clone())
    }

    // The same response, closing the connection afterwards
    pub(crate) fn and_close(mut self) -> Self {
        self.action = Action::Close;
        self
    }

    /// The text of the response without the reply code
    pub fn message(&self) -> String {
        match &self.message {
            Message::Fixed(s) => (*s).to_owned(),
            Message::Text(s) => s.clone(),
            Message::Lines(lines) => lines.join("\n"),
            Message::Empty => String::new(),
        }
    }

    /// Does this response carry anything to send?
    pub fn is_empty(&self) -> bool {
        self.message == Message::Empty
    }

    /// Write the response to the given writer
    pub fn write_to(&self, out: &mut dyn Write) -> io::Result<()> {
        match &self.message {
            Message::Lines(lines) => {
                let last = lines.len().saturating_sub(1);
                for (i, line) in lines.iter().enumerate() {
                    let sep = if i < last { '-' } else { ' ' };
                    write!(out, "{}{}{}\r\n", self.code, sep, line)?;
                }
            }
            Message::Fixed(s) => write!(out, "{} {}\r\n", self.code, s)?,
            Message::Text(s) => write!(out, "{} {}\r\n", self.code, s)?,
            Message::Empty => (),
        };
        Ok(())
    }

    // Log the response
    pub(crate) fn log(&self, id: &str) {
        if !self.is_empty() {
            let mut buf = Vec::new();
            let _ = self.write_to(&mut buf);
            trace!("[{}] < {}", id, String::from_utf8_lossy(&buf).trim_end());
        }
    }
}

//------ Tests -----------------------------------------------------------------
