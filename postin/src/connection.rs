use crate::auth::AuthMechanism;
use crate::cmd::Verb;
use crate::fsm::StateMachine;
use crate::response::{Response, EMPTY_RESPONSE, SHUTTING_DOWN, TIMEOUT};
use crate::session::{Session, TlsInfo};
use crate::stream::{Frame, Framer};
use crate::Handler;
use log::debug;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Tells a `Connection` that its client has gone away.
///
/// Clones share the same flag, so the I/O code can close the connection from
/// another thread. Handler results that arrive after the close are discarded.
#[derive(Debug, Clone, Default)]
pub struct CloseSignal(Arc<AtomicBool>);

impl CloseSignal {
    /// Mark the connection as closed
    pub fn close(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Has the connection been closed?
    pub fn is_closed(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// Settings shared by all connections built by a ConnectionBuilder
#[derive(Debug, Clone)]
pub(crate) struct Config {
    pub(crate) name: String,
    pub(crate) banner: Option<String>,
    pub(crate) start_tls: bool,
    pub(crate) hide_start_tls: bool,
    pub(crate) secure: bool,
    pub(crate) auth_mechanisms: Vec<AuthMechanism>,
    pub(crate) allow_insecure_auth: bool,
    pub(crate) auth_optional: bool,
    pub(crate) disabled_commands: Vec<String>,
    pub(crate) max_size: Option<usize>,
    pub(crate) hide_size: bool,
    pub(crate) max_unauthenticated_commands: Option<usize>,
    pub(crate) max_unrecognized_commands: usize,
    pub(crate) proxy: bool,
    pub(crate) lmtp: bool,
    pub(crate) xclient: bool,
    pub(crate) xforward: bool,
}

impl Config {
    pub(crate) fn is_disabled(&self, verb: Verb) -> bool {
        match verb {
            Verb::XClient if !self.xclient => true,
            Verb::XForward if !self.xforward => true,
            _ => self.disabled_commands.iter().any(|c| c == verb.name()),
        }
    }
}

/// Builds SMTP `Connection`s
///
/// # Examples
/// ```
/// # use postin::{AuthMechanism, ConnectionBuilder, Handler};
/// # use std::net::SocketAddr;
/// # struct EmptyHandler{};
/// # impl Handler for EmptyHandler{};
/// # let local: SocketAddr = "127.0.0.1:25".parse().unwrap();
/// # let remote: SocketAddr = "127.0.0.1:40000".parse().unwrap();
/// # let handler = EmptyHandler{};
/// // Create a connection builder that holds the configuration
/// let mut builder = ConnectionBuilder::new("server_name");
/// builder.enable_start_tls()
///        .enable_auth(AuthMechanism::Plain)
///        .max_size(10 * 1024 * 1024);
/// // Then when a client connects
/// let mut conn = builder.build(local, remote, handler);
/// let greeting = conn.start();
/// ```
#[derive(Debug, Clone)]
pub struct ConnectionBuilder {
    config: Config,
}

impl ConnectionBuilder {
    /// Create a builder for a server with the given host name
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            config: Config {
                name: name.into(),
                banner: None,
                start_tls: false,
                hide_start_tls: false,
                secure: false,
                auth_mechanisms: Vec::new(),
                allow_insecure_auth: false,
                auth_optional: false,
                disabled_commands: Vec::new(),
                max_size: None,
                hide_size: false,
                max_unauthenticated_commands: Some(10),
                max_unrecognized_commands: 10,
                proxy: false,
                lmtp: false,
                xclient: false,
                xforward: false,
            },
        }
    }

    /// The host name used in the greeting
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Do connections start with a TLS handshake?
    pub fn is_secure(&self) -> bool {
        self.config.secure
    }

    /// Is a PROXY protocol header expected before the SMTP conversation?
    pub fn is_proxy(&self) -> bool {
        self.config.proxy
    }

    /// Change the host name used in the greeting
    pub fn set_name<S: Into<String>>(&mut self, name: S) -> &mut Self {
        let ret = self;
        ret.config.name = name.into();
        ret
    }

    /// Text added to the end of the greeting
    pub fn banner<S: Into<String>>(&mut self, banner: S) -> &mut Self {
        let ret = self;
        ret.config.banner = Some(banner.into());
        ret
    }

    /// Offer the STARTTLS extension
    pub fn enable_start_tls(&mut self) -> &mut Self {
        let ret = self;
        ret.config.start_tls = true;
        ret
    }

    /// Do not advertise or accept STARTTLS
    pub fn hide_start_tls(&mut self) -> &mut Self {
        let ret = self;
        ret.config.hide_start_tls = true;
        ret
    }

    /// Connections start with a TLS handshake (implicit TLS)
    pub fn secure(&mut self) -> &mut Self {
        let ret = self;
        ret.config.secure = true;
        ret
    }

    /// Enable an authentication mechanism
    pub fn enable_auth(&mut self, mechanism: AuthMechanism) -> &mut Self {
        let ret = self;
        if !ret.config.auth_mechanisms.contains(&mechanism) {
            ret.config.auth_mechanisms.push(mechanism);
        }
        ret
    }

    /// Allow every mechanism, and advertise AUTH, on unencrypted connections
    pub fn allow_insecure_auth(&mut self) -> &mut Self {
        let ret = self;
        ret.config.allow_insecure_auth = true;
        ret
    }

    /// Accept mail from clients that have not authenticated
    pub fn auth_optional(&mut self) -> &mut Self {
        let ret = self;
        ret.config.auth_optional = true;
        ret
    }

    /// Answer a command with 502 as if it were not implemented
    pub fn disable_command(&mut self, command: &str) -> &mut Self {
        let ret = self;
        ret.config.disabled_commands.push(command.to_ascii_uppercase());
        ret
    }

    /// The maximum message size in bytes
    pub fn max_size(&mut self, max_size: usize) -> &mut Self {
        let ret = self;
        ret.config.max_size = Some(max_size);
        ret
    }

    /// Do not advertise the SIZE extension
    pub fn hide_size(&mut self) -> &mut Self {
        let ret = self;
        ret.config.hide_size = true;
        ret
    }

    /// Commands allowed before authentication when it is required, `None`
    /// for no limit
    pub fn max_unauthenticated_commands(&mut self, max: Option<usize>) -> &mut Self {
        let ret = self;
        ret.config.max_unauthenticated_commands = max;
        ret
    }

    /// Unrecognized commands allowed before the connection is closed
    pub fn max_unrecognized_commands(&mut self, max: usize) -> &mut Self {
        let ret = self;
        ret.config.max_unrecognized_commands = max;
        ret
    }

    /// Expect a PROXY protocol header before the SMTP conversation
    pub fn enable_proxy(&mut self) -> &mut Self {
        let ret = self;
        ret.config.proxy = true;
        ret
    }

    /// Speak LMTP instead of SMTP
    pub fn lmtp(&mut self) -> &mut Self {
        let ret = self;
        ret.config.lmtp = true;
        ret
    }

    /// Accept the XCLIENT command
    pub fn enable_xclient(&mut self) -> &mut Self {
        let ret = self;
        ret.config.xclient = true;
        ret
    }

    /// Accept the XFORWARD command
    pub fn enable_xforward(&mut self) -> &mut Self {
        let ret = self;
        ret.config.xforward = true;
        ret
    }

    /// The reply for a client turned away because the server is full
    pub fn too_many_connections(&self) -> Response {
        Response::text(
            421,
            format!(
                "{} Too many connected clients, try again in a moment",
                self.config.name
            ),
        )
    }

    /// Build a connection for a newly connected client
    pub fn build<H: Handler>(
        &self,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        handler: H,
    ) -> Connection<H> {
        let id = hex::encode(rand::random::<[u8; 10]>());
        let session = Session::new(id, local_addr, remote_addr);
        let close_signal = CloseSignal::default();
        Connection {
            fsm: StateMachine::new(session, Arc::new(self.config.clone()), close_signal.clone()),
            framer: Framer::new(),
            handler,
            close_signal,
            close_notified: false,
        }
    }
}

/// A single SMTP connection with a single client
pub struct Connection<H: Handler> {
    fsm: StateMachine,
    framer: Framer,
    handler: H,
    close_signal: CloseSignal,
    close_notified: bool,
}

impl<H: Handler> Connection<H> {
    /// Start the conversation, returning the greeting.
    ///
    /// Nothing is returned when a PROXY header is expected first. A single
    /// `Action::UpgradeTls` response is returned for implicit TLS.
    pub fn start(&mut self) -> Vec<Response> {
        let res = self.fsm.start(&mut self.handler);
        let mut out = Vec::new();
        push(&mut out, res);
        out
    }

    /// Process bytes received from the client
    pub fn process(&mut self, bytes: &[u8]) -> Vec<Response> {
        if self.fsm.is_closed() {
            return Vec::new();
        }
        self.framer.feed(bytes);
        self.drain()
    }

    /// The client closed its side of the connection.
    ///
    /// A final command without a line ending is processed.
    pub fn finish(&mut self) -> Vec<Response> {
        let mut out = self.drain();
        if self.fsm.is_paused() {
            return out;
        }
        if let Some(Frame::Command(line)) = self.framer.finish() {
            let res = self.fsm.line(&mut self.handler, &line);
            push(&mut out, res);
        }
        out
    }

    /// The TLS handshake requested by `Action::UpgradeTls` succeeded
    pub fn tls_established(&mut self, tls: TlsInfo) -> Vec<Response> {
        let mut out = Vec::new();
        let res = self.fsm.tls_established(&mut self.handler, tls);
        push(&mut out, res);
        if !self.fsm.is_paused() {
            self.framer.resume();
            out.extend(self.drain());
        }
        out
    }

    /// Bytes received before an implicit TLS handshake, which belong to the
    /// TLS stream
    pub fn take_pending(&mut self) -> Vec<u8> {
        self.framer.take_buffered()
    }

    /// The client has been idle for too long
    pub fn timeout(&mut self) -> Vec<Response> {
        self.closing(TIMEOUT)
    }

    /// The server is shutting down.
    ///
    /// Nothing is returned while a mail transaction is open, call again later.
    pub fn shutdown(&mut self) -> Vec<Response> {
        if self.fsm.has_open_transaction() {
            return Vec::new();
        }
        self.closing(SHUTTING_DOWN)
    }

    /// The server is shutting down now, even during a transaction
    pub fn abort(&mut self) -> Vec<Response> {
        self.closing(SHUTTING_DOWN)
    }

    /// Release the connection, calling `Handler::close` once
    pub fn close(&mut self) {
        self.close_signal.close();
        self.fsm.close();
        if !self.close_notified {
            self.close_notified = true;
            debug!("[{}] Connection closed", self.fsm.session.id);
            self.handler.close(&self.fsm.session);
        }
    }

    /// The state of the conversation
    pub fn session(&self) -> &Session {
        &self.fsm.session
    }

    /// Is a mail transaction in progress?
    pub fn has_open_transaction(&self) -> bool {
        self.fsm.has_open_transaction()
    }

    /// A signal that closes this connection from another thread
    pub fn close_signal(&self) -> CloseSignal {
        self.close_signal.clone()
    }

    /// Has the connection been closed?
    pub fn is_closed(&self) -> bool {
        self.fsm.is_closed()
    }

    fn closing(&mut self, res: Response) -> Vec<Response> {
        if self.fsm.is_closed() {
            return Vec::new();
        }
        self.fsm.close();
        res.log(&self.fsm.session.id);
        vec![res]
    }

    // Handle every complete frame in the buffer
    fn drain(&mut self) -> Vec<Response> {
        let mut out = Vec::new();
        while !self.fsm.is_paused() {
            let frame = match self.framer.next_frame() {
                Some(frame) => frame,
                None => break,
            };
            match frame {
                Frame::Command(line) => {
                    let res = self.fsm.line(&mut self.handler, &line);
                    push(&mut out, res);
                    if self.fsm.in_data() {
                        self.framer.enter_data_mode();
                    } else if self.fsm.is_upgrading() {
                        // Plaintext sent after STARTTLS is never interpreted
                        self.framer.discard();
                    }
                    if !self.fsm.is_paused() {
                        self.framer.resume();
                    }
                }
                Frame::Data(chunk) => self.fsm.data_chunk(&chunk),
                Frame::DataEnd => {
                    for res in self.fsm.data_end(&mut self.handler) {
                        push(&mut out, res);
                    }
                    if !self.fsm.is_paused() {
                        self.framer.resume();
                    }
                }
            }
        }
        out
    }
}

// Queue a response unless there is nothing to do
fn push(out: &mut Vec<Response>, res: Response) {
    if res != EMPTY_RESPONSE {
        out.push(res);
    }
}
