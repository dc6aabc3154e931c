use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;

/// Per-connection facts that handlers can inspect.
///
/// A `Session` is created with the connection and updated by the protocol
/// state machine as the client negotiates.
#[derive(Debug, Clone)]
pub struct Session {
    /// Random identifier for logging
    pub id: String,
    /// The local address of the connection
    pub local_addr: SocketAddr,
    /// The client address, possibly overridden by a PROXY header or XCLIENT
    pub remote_addr: SocketAddr,
    /// The client hostname as shown in replies and logs
    pub client_hostname: String,
    /// The hostname the client gave in HELO/EHLO/LHLO, lowercased
    pub host_name_appears_as: Option<String>,
    /// The greeting command used by the client
    pub opening_command: Option<OpeningCommand>,
    /// Negotiated TLS parameters if the connection is encrypted
    pub tls: Option<TlsInfo>,
    /// The user returned by the handler after a successful AUTH
    pub user: Option<String>,
    /// The mail transaction in progress
    pub envelope: Envelope,
    /// The number of mail transactions started on this connection
    pub transaction: usize,
    /// Attributes set by XCLIENT
    pub xclient: HashMap<String, String>,
    /// Attributes set by XFORWARD
    pub xforward: HashMap<String, String>,
    pub(crate) ready: bool,
    pub(crate) unauthenticated_commands: usize,
    pub(crate) unrecognized_commands: usize,
}

impl Session {
    pub(crate) fn new(id: String, local_addr: SocketAddr, remote_addr: SocketAddr) -> Self {
        let local_addr = canonical(local_addr);
        let remote_addr = canonical(remote_addr);
        Self {
            id,
            local_addr,
            remote_addr,
            client_hostname: format!("[{}]", remote_addr.ip()),
            host_name_appears_as: None,
            opening_command: None,
            tls: None,
            user: None,
            envelope: Envelope::default(),
            transaction: 0,
            xclient: HashMap::new(),
            xforward: HashMap::new(),
            ready: false,
            unauthenticated_commands: 0,
            unrecognized_commands: 0,
        }
    }

    /// Is the connection encrypted?
    pub fn is_secure(&self) -> bool {
        self.tls.is_some()
    }

    /// Has the greeting been sent?
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Commands received while authentication was required but missing
    pub fn unauthenticated_commands(&self) -> usize {
        self.unauthenticated_commands
    }

    /// Commands that were not recognized
    pub fn unrecognized_commands(&self) -> usize {
        self.unrecognized_commands
    }

    pub(crate) fn set_remote(&mut self, remote: SocketAddr) {
        let remote = canonical(remote);
        if self.client_hostname == format!("[{}]", self.remote_addr.ip()) {
            self.client_hostname = format!("[{}]", remote.ip());
        }
        self.remote_addr = remote;
    }

    // Forget the greeting and the transaction
    pub(crate) fn reset(&mut self) {
        self.host_name_appears_as = None;
        self.opening_command = None;
        self.envelope.clear();
    }
}

// Strip IPv4-mapped IPv6 prefixes
fn canonical(addr: SocketAddr) -> SocketAddr {
    SocketAddr::new(addr.ip().to_canonical(), addr.port())
}

/// The command used to greet the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpeningCommand {
    /// HELO
    Helo,
    /// EHLO
    Ehlo,
    /// LHLO, in LMTP mode
    Lhlo,
}

impl fmt::Display for OpeningCommand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            OpeningCommand::Helo => "HELO",
            OpeningCommand::Ehlo => "EHLO",
            OpeningCommand::Lhlo => "LHLO",
        };
        f.write_str(name)
    }
}

/// Negotiated TLS parameters, supplied by the IO layer after a handshake
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsInfo {
    /// Cipher suite name
    pub cipher: String,
    /// Protocol version name
    pub protocol: String,
    /// The server name requested by the client (SNI)
    pub server_name: Option<String>,
}

/// The sender and recipients of the current mail transaction
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Envelope {
    /// The sender, set by MAIL FROM
    pub mail_from: Option<Address>,
    /// Accepted recipients in the order given
    pub rcpt_to: Vec<Address>,
}

impl Envelope {
    /// Has a mail transaction been started?
    pub fn is_open(&self) -> bool {
        self.mail_from.is_some()
    }

    pub(crate) fn clear(&mut self) {
        self.mail_from = None;
        self.rcpt_to.clear();
    }

    // Add a recipient, replacing an earlier one with the same address
    pub(crate) fn add_recipient(&mut self, to: Address) {
        let existing = self
            .rcpt_to
            .iter()
            .position(|r| r.address.eq_ignore_ascii_case(&to.address));
        match existing {
            Some(i) => self.rcpt_to[i] = to,
            None => self.rcpt_to.push(to),
        }
    }
}

/// The value of an ESMTP parameter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamValue {
    /// A parameter given without a value, e.g. SMTPUTF8
    Flag,
    /// A parameter with a decoded value, e.g. BODY=8BITMIME
    Value(String),
}

impl ParamValue {
    /// The value, if one was given
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::Flag => None,
            ParamValue::Value(v) => Some(v),
        }
    }
}

/// An address from MAIL FROM or RCPT TO with its ESMTP parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    /// The address without angle brackets, empty for the null sender
    pub address: String,
    /// Parameters keyed by upper case name, `None` if none were given
    pub params: Option<HashMap<String, ParamValue>>,
}

impl Address {
    /// Look up a parameter by name, ignoring case
    pub fn param(&self, key: &str) -> Option<&ParamValue> {
        self.params
            .as_ref()
            .and_then(|p| p.get(&key.to_ascii_uppercase()))
    }
}

//------ Tests -----------------------------------------------------------------
