use crate::auth::{AuthAttempt, AuthMechanism};
use crate::cmd::{Cmd, Verb};
use crate::connection::{CloseSignal, Config};
use crate::parser::{is_http_request, parse_args, proxy_header, split_verb, ProxyHeader};
use crate::response::*;
use crate::sasl::{Sasl, Step};
use crate::session::{Address, OpeningCommand, Session, TlsInfo};
use crate::{AuthResult, DataResult, DataSummary, Handler};
use log::{debug, error, info, trace, warn};
use std::io::Write;
use std::mem;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

const XCLIENT_KEYS: [&str; 6] = ["NAME", "ADDR", "PORT", "PROTO", "HELO", "LOGIN"];
const XFORWARD_KEYS: [&str; 7] = ["NAME", "ADDR", "PORT", "PROTO", "HELO", "IDENT", "SOURCE"];

//------ State -----------------------------------------------------------------

pub(crate) enum State {
    // Built, start() not called yet
    Start,
    // Waiting for a PROXY header
    Proxy,
    // Waiting for the TLS handshake of an implicit TLS connection
    Handshake,
    Command,
    Auth(Sasl),
    Data(Body),
    // STARTTLS accepted, waiting for the TLS handshake
    Upgrading,
    Closed,
}

// A message body being received
pub(crate) struct Body {
    writer: Box<dyn Write>,
    size: usize,
    size_exceeded: bool,
    write_failed: bool,
}

impl Body {
    fn new(writer: Box<dyn Write>) -> Self {
        Self {
            writer,
            size: 0,
            size_exceeded: false,
            write_failed: false,
        }
    }

    fn write(&mut self, chunk: &[u8], max_size: Option<usize>, id: &str) {
        self.size += chunk.len();
        if max_size.map_or(false, |max| self.size > max) {
            self.size_exceeded = true;
        }
        if !self.write_failed {
            if let Err(err) = self.writer.write_all(chunk) {
                error!("[{}] Cannot write message body: {}", id, err);
                self.write_failed = true;
            }
        }
    }

    // Flush and drop the writer
    fn finish(mut self, id: &str) -> (DataSummary, bool) {
        if !self.write_failed {
            if let Err(err) = self.writer.flush() {
                error!("[{}] Cannot flush message body: {}", id, err);
                self.write_failed = true;
            }
        }
        let summary = DataSummary {
            size: self.size,
            size_exceeded: self.size_exceeded,
        };
        (summary, self.write_failed)
    }
}

//------ State machine ---------------------------------------------------------

pub(crate) struct StateMachine {
    pub(crate) state: State,
    pub(crate) session: Session,
    config: Arc<Config>,
    close_signal: CloseSignal,
}

impl StateMachine {
    pub(crate) fn new(session: Session, config: Arc<Config>, close_signal: CloseSignal) -> Self {
        Self {
            state: State::Start,
            session,
            config,
            close_signal,
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        matches!(self.state, State::Closed)
    }

    // Waiting for a TLS handshake, or closed
    pub(crate) fn is_paused(&self) -> bool {
        matches!(
            self.state,
            State::Handshake | State::Upgrading | State::Closed
        )
    }

    pub(crate) fn is_upgrading(&self) -> bool {
        matches!(self.state, State::Upgrading)
    }

    pub(crate) fn in_data(&self) -> bool {
        matches!(self.state, State::Data(_))
    }

    pub(crate) fn has_open_transaction(&self) -> bool {
        self.in_data() || self.session.envelope.is_open()
    }

    pub(crate) fn close(&mut self) {
        self.state = State::Closed;
    }

    // The connection was closed while a handler was running
    fn aborted(&mut self) -> bool {
        if self.close_signal.is_closed() {
            debug!("[{}] Discarding handler result after close", self.session.id);
            self.state = State::Closed;
            true
        } else {
            false
        }
    }

    // Finish a state transition, closing responses end the connection
    fn handle_response(&mut self, res: Response) -> Response {
        if res.action == Action::Close {
            self.state = State::Closed;
        }
        res.log(&self.session.id);
        res
    }

    //------ Startup -------------------------------------------------------------

    pub(crate) fn start(&mut self, handler: &mut dyn Handler) -> Response {
        debug!(
            "[{}] Connection from {}",
            self.session.id, self.session.remote_addr
        );
        let res = if self.config.proxy {
            self.state = State::Proxy;
            EMPTY_RESPONSE
        } else {
            self.begin(handler)
        };
        self.handle_response(res)
    }

    fn begin(&mut self, handler: &mut dyn Handler) -> Response {
        if self.config.secure && !self.session.is_secure() {
            self.state = State::Handshake;
            Response::handshake()
        } else {
            self.connect(handler)
        }
    }

    // Consult the handler and greet the client
    fn connect(&mut self, handler: &mut dyn Handler) -> Response {
        let result = handler.connect(&self.session);
        if self.aborted() {
            return EMPTY_RESPONSE;
        }
        match result {
            Ok(()) => {
                self.session.ready = true;
                self.state = State::Command;
                self.greeting()
            }
            Err(reject) => {
                info!(
                    "[{}] Connection from {} rejected: {}",
                    self.session.id, self.session.remote_addr, reject
                );
                Response::reject(&reject, 554).and_close()
            }
        }
    }

    fn greeting(&self) -> Response {
        let protocol = if self.config.lmtp { "LMTP" } else { "ESMTP" };
        let text = match &self.config.banner {
            Some(banner) => format!("{} {} {}", self.config.name, protocol, banner),
            None => format!("{} {}", self.config.name, protocol),
        };
        Response::text(220, text)
    }

    fn proxy(&mut self, handler: &mut dyn Handler, line: &[u8]) -> Response {
        match proxy_header(line) {
            Some(ProxyHeader::Tcp { source, .. }) => {
                debug!(
                    "[{}] PROXY from {} for {}",
                    self.session.id, self.session.remote_addr, source
                );
                self.session.set_remote(source);
            }
            Some(ProxyHeader::Unknown) => {
                debug!("[{}] PROXY UNKNOWN", self.session.id);
            }
            None => {
                warn!(
                    "[{}] Invalid PROXY header from {}",
                    self.session.id, self.session.remote_addr
                );
                return EMPTY_RESPONSE.and_close();
            }
        }
        self.begin(handler)
    }

    pub(crate) fn tls_established(&mut self, handler: &mut dyn Handler, tls: TlsInfo) -> Response {
        debug!(
            "[{}] TLS established {} {}",
            self.session.id, tls.protocol, tls.cipher
        );
        self.session.tls = Some(tls);
        let result = handler.secure(&self.session);
        if self.aborted() {
            return EMPTY_RESPONSE;
        }
        let res = match result {
            Err(reject) => Response::reject(&reject, 554).and_close(),
            Ok(()) => match mem::replace(&mut self.state, State::Closed) {
                State::Handshake => self.connect(handler),
                State::Upgrading => {
                    self.session.reset();
                    self.state = State::Command;
                    EMPTY_RESPONSE
                }
                other => {
                    self.state = other;
                    EMPTY_RESPONSE
                }
            },
        };
        self.handle_response(res)
    }

    //------ Lines -----------------------------------------------------------------

    // Handle a line sent by the client
    pub(crate) fn line(&mut self, handler: &mut dyn Handler, line: &[u8]) -> Response {
        let res = match mem::replace(&mut self.state, State::Closed) {
            State::Start => {
                trace!("[{}] > {}", self.session.id, String::from_utf8_lossy(line));
                debug!("[{}] Client talked before the greeting", self.session.id);
                EARLY_TALKER
            }
            State::Proxy => {
                trace!("[{}] > {}", self.session.id, String::from_utf8_lossy(line));
                self.proxy(handler, line)
            }
            State::Command => {
                trace!("[{}] > {}", self.session.id, String::from_utf8_lossy(line));
                self.state = State::Command;
                self.command(handler, line)
            }
            State::Auth(sasl) => {
                trace!("[{}] > [sasl response]", self.session.id);
                self.sasl_step(handler, sasl.respond(line))
            }
            state @ (State::Handshake | State::Upgrading | State::Data(_)) => {
                self.state = state;
                EMPTY_RESPONSE
            }
            State::Closed => EMPTY_RESPONSE,
        };
        self.handle_response(res)
    }

    fn command(&mut self, handler: &mut dyn Handler, line: &[u8]) -> Response {
        if is_http_request(line) {
            return HTTP_REQUEST;
        }
        let (verb, args) = match split_verb(line).filter(|(v, _)| self.recognized(*v)) {
            Some(found) => found,
            None => return self.unrecognized(),
        };
        if verb != Verb::Auth && self.auth_required() {
            if let Some(max) = self.config.max_unauthenticated_commands {
                self.session.unauthenticated_commands += 1;
                if self.session.unauthenticated_commands > max {
                    return TOO_MANY_UNAUTHENTICATED;
                }
            }
        }
        if self.config.is_disabled(verb) {
            return NOT_IMPLEMENTED;
        }
        if verb.needs_greeting() && self.session.opening_command.is_none() {
            return if self.config.lmtp { NEED_LHLO } else { NEED_HELO };
        }
        if verb.needs_user() && self.auth_required() {
            return AUTHENTICATION_REQUIRED;
        }
        let cmd = match parse_args(verb, args) {
            Ok(cmd) => cmd,
            Err(res) => return res,
        };
        match cmd {
            Cmd::Helo { domain } => self.hello(OpeningCommand::Helo, domain),
            Cmd::Ehlo { domain } => self.hello(OpeningCommand::Ehlo, domain),
            Cmd::Lhlo { domain } => self.hello(OpeningCommand::Lhlo, domain),
            Cmd::Mail(from) => self.mail(handler, from),
            Cmd::Rcpt(to) => self.rcpt(handler, to),
            Cmd::Data => self.data(handler),
            Cmd::Rset => {
                self.session.envelope.clear();
                OK
            }
            Cmd::Noop => OK,
            Cmd::Quit => GOODBYE,
            Cmd::Vrfy => VERIFY_RESPONSE,
            Cmd::Help => HELP,
            Cmd::StartTls => self.start_tls(),
            Cmd::Auth { mechanism, initial } => self.auth(handler, mechanism, initial),
            Cmd::XClient(attrs) => self.xclient(handler, attrs),
            Cmd::XForward(attrs) => self.xforward(attrs),
        }
    }

    fn recognized(&self, verb: Verb) -> bool {
        match verb {
            Verb::Helo | Verb::Ehlo => !self.config.lmtp,
            Verb::Lhlo => self.config.lmtp,
            _ => true,
        }
    }

    fn unrecognized(&mut self) -> Response {
        self.session.unrecognized_commands += 1;
        if self.session.unrecognized_commands > self.config.max_unrecognized_commands {
            TOO_MANY_UNRECOGNIZED
        } else {
            UNRECOGNIZED
        }
    }

    fn auth_supported(&self) -> bool {
        !self.config.auth_mechanisms.is_empty() && !self.config.is_disabled(Verb::Auth)
    }

    fn auth_required(&self) -> bool {
        self.auth_supported() && !self.config.auth_optional && self.session.user.is_none()
    }

    fn start_tls_available(&self) -> bool {
        self.config.start_tls
            && !self.config.hide_start_tls
            && !self.config.is_disabled(Verb::StartTls)
    }

    //------ Commands --------------------------------------------------------------

    fn hello(&mut self, opening: OpeningCommand, domain: &str) -> Response {
        self.session.envelope.clear();
        self.session.host_name_appears_as = Some(domain.to_lowercase());
        self.session.opening_command = Some(opening);
        let head = format!(
            "{} Nice to meet you, {}",
            self.config.name, self.session.client_hostname
        );
        if opening == OpeningCommand::Helo {
            return Response::text(250, head);
        }
        let mut lines = vec![
            head,
            "PIPELINING".to_owned(),
            "8BITMIME".to_owned(),
            "SMTPUTF8".to_owned(),
        ];
        if self.auth_supported() && (self.session.is_secure() || self.config.allow_insecure_auth) {
            let names: Vec<&str> = self
                .config
                .auth_mechanisms
                .iter()
                .map(AuthMechanism::name)
                .collect();
            lines.push(format!("AUTH {}", names.join(" ")));
        }
        if self.start_tls_available() && !self.session.is_secure() {
            lines.push("STARTTLS".to_owned());
        }
        if let Some(max_size) = self.config.max_size {
            if !self.config.hide_size {
                lines.push(format!("SIZE {}", max_size));
            }
        }
        if self.config.xclient {
            lines.push(format!("XCLIENT {}", XCLIENT_KEYS.join(" ")));
        }
        if self.config.xforward {
            lines.push(format!("XFORWARD {}", XFORWARD_KEYS.join(" ")));
        }
        Response::lines(250, lines)
    }

    fn mail(&mut self, handler: &mut dyn Handler, from: Address) -> Response {
        if self.session.envelope.is_open() {
            return NESTED_MAIL;
        }
        if let Some(max_size) = self.config.max_size {
            let declared = from
                .param("SIZE")
                .and_then(|v| v.as_str())
                .and_then(|v| v.parse::<usize>().ok());
            if declared.map_or(false, |size| size > max_size) {
                return Response::text(
                    552,
                    format!(
                        "Error: message exceeds fixed maximum message size {}",
                        max_size
                    ),
                );
            }
        }
        let result = handler.mail(&from, &self.session);
        if self.aborted() {
            return EMPTY_RESPONSE;
        }
        match result {
            Ok(()) => {
                self.session.envelope.mail_from = Some(from);
                self.session.transaction += 1;
                ACCEPTED
            }
            Err(reject) => {
                self.session.envelope.clear();
                Response::reject(&reject, 550)
            }
        }
    }

    fn rcpt(&mut self, handler: &mut dyn Handler, to: Address) -> Response {
        if !self.session.envelope.is_open() {
            return NEED_MAIL;
        }
        let result = handler.rcpt(&to, &self.session);
        if self.aborted() {
            return EMPTY_RESPONSE;
        }
        match result {
            Ok(()) => {
                self.session.envelope.add_recipient(to);
                ACCEPTED
            }
            Err(reject) => Response::reject(&reject, 550),
        }
    }

    fn data(&mut self, handler: &mut dyn Handler) -> Response {
        if !self.session.envelope.is_open() {
            return NEED_MAIL;
        }
        if self.session.envelope.rcpt_to.is_empty() {
            return NEED_RCPT;
        }
        let result = handler.data(&self.session);
        if self.aborted() {
            return EMPTY_RESPONSE;
        }
        match result {
            DataResult::Ok(writer) => {
                self.state = State::Data(Body::new(writer));
                START_DATA
            }
            DataResult::Reject(reject) => Response::reject(&reject, 554),
        }
    }

    pub(crate) fn data_chunk(&mut self, chunk: &[u8]) {
        if let State::Data(ref mut body) = self.state {
            body.write(chunk, self.config.max_size, &self.session.id);
        }
    }

    // The end of the message body was received
    pub(crate) fn data_end(&mut self, handler: &mut dyn Handler) -> Vec<Response> {
        let body = match mem::replace(&mut self.state, State::Command) {
            State::Data(body) => body,
            other => {
                self.state = other;
                return Vec::new();
            }
        };
        let (summary, write_failed) = body.finish(&self.session.id);
        debug!(
            "[{}] Received message of {} bytes",
            self.session.id, summary.size
        );
        let res = if write_failed {
            INTERNAL_ERROR
        } else {
            let result = handler.data_end(&summary, &self.session);
            if self.aborted() {
                return Vec::new();
            }
            match result {
                Ok(None) => QUEUED,
                Ok(Some(message)) => Response::text(250, message),
                Err(reject) => Response::reject(&reject, 450),
            }
        };
        let count = if self.config.lmtp {
            self.session.envelope.rcpt_to.len()
        } else {
            1
        };
        self.session.envelope.clear();
        let res = self.handle_response(res);
        vec![res; count]
    }

    fn start_tls(&mut self) -> Response {
        if self.session.is_secure() {
            TLS_ALREADY_ACTIVE
        } else if !self.start_tls_available() {
            NOT_IMPLEMENTED
        } else if self.session.envelope.is_open() {
            TLS_IN_TRANSACTION
        } else {
            self.state = State::Upgrading;
            START_TLS
        }
    }

    //------ Authentication --------------------------------------------------------

    fn auth(&mut self, handler: &mut dyn Handler, name: &str, initial: Option<&str>) -> Response {
        if !self.auth_supported() {
            return NOT_IMPLEMENTED;
        }
        if self.session.user.is_some() {
            return NO_IDENTITY_CHANGES;
        }
        let mechanism = match AuthMechanism::from_name(name)
            .filter(|m| self.config.auth_mechanisms.contains(m))
        {
            Some(m) => m,
            None => return UNKNOWN_MECHANISM,
        };
        if !self.session.is_secure()
            && !self.config.allow_insecure_auth
            && !mechanism.allowed_insecure()
        {
            return MUST_STARTTLS;
        }
        let step = Sasl::start(mechanism, initial, &self.config.name);
        self.sasl_step(handler, step)
    }

    fn sasl_step(&mut self, handler: &mut dyn Handler, step: Step) -> Response {
        match step {
            Step::Challenge(sasl, res) => {
                self.state = State::Auth(sasl);
                res
            }
            Step::Fail(res) => {
                self.state = State::Command;
                res
            }
            Step::Attempt(attempt) => self.authenticate(handler, attempt),
        }
    }

    fn authenticate(&mut self, handler: &mut dyn Handler, attempt: AuthAttempt) -> Response {
        let result = handler.auth(&attempt, &self.session);
        if self.aborted() {
            return EMPTY_RESPONSE;
        }
        self.state = State::Command;
        match result {
            AuthResult::Ok(user) => {
                info!(
                    "[{}] Authenticated {} as {} with {}",
                    self.session.id,
                    attempt.username(),
                    user,
                    attempt.mechanism.name()
                );
                self.session.user = Some(user);
                AUTH_OK
            }
            AuthResult::TemporaryFailure => TEMPORARY_AUTH_FAILURE,
            AuthResult::InvalidCredentials => {
                info!(
                    "[{}] Authentication failed for {}",
                    self.session.id,
                    attempt.username()
                );
                INVALID_CREDENTIALS
            }
            AuthResult::Reject(reject) => Response::reject(&reject, 535),
            AuthResult::OAuthChallenge(err) if attempt.mechanism == AuthMechanism::XOAuth2 => {
                self.state = State::Auth(Sasl::XOAuth2Failed {
                    reply: INVALID_CREDENTIALS,
                });
                Response::text(334, err.encode())
            }
            AuthResult::OAuthChallenge(_) => INVALID_CREDENTIALS,
        }
    }

    //------ XCLIENT and XFORWARD --------------------------------------------------

    fn xclient(&mut self, handler: &mut dyn Handler, attrs: Vec<(String, String)>) -> Response {
        if self.session.envelope.is_open() {
            return TRANSACTION_IN_PROGRESS;
        }
        if attrs.iter().any(|(k, _)| !XCLIENT_KEYS.contains(&k.as_str())) {
            return BAD_PARAMETER;
        }
        let mut remote = self.session.remote_addr;
        for (key, value) in attrs.iter().filter(|(_, v)| available(v)) {
            match key.as_str() {
                "ADDR" => match parse_ip(value) {
                    Some(ip) => remote = SocketAddr::new(ip, remote.port()),
                    None => return BAD_PARAMETER,
                },
                "PORT" => match value.parse() {
                    Ok(port) => remote.set_port(port),
                    Err(_) => return BAD_PARAMETER,
                },
                _ => (),
            }
        }
        self.session.reset();
        self.session.set_remote(remote);
        for (key, value) in attrs {
            let value = if available(&value) { Some(value) } else { None };
            match (key.as_str(), &value) {
                ("NAME", Some(name)) => self.session.client_hostname = name.to_lowercase(),
                ("NAME", None) => {
                    self.session.client_hostname = format!("[{}]", remote.ip());
                }
                ("HELO", helo) => {
                    self.session.host_name_appears_as = helo.as_ref().map(|h| h.to_lowercase());
                }
                ("LOGIN", login) => {
                    self.session.user = login.clone().filter(|l| !l.is_empty());
                }
                _ => (),
            }
            match value {
                Some(v) => self.session.xclient.insert(key, v),
                None => self.session.xclient.remove(&key),
            };
        }
        debug!(
            "[{}] XCLIENT changed client to {} ({})",
            self.session.id, self.session.remote_addr, self.session.client_hostname
        );
        self.session.ready = false;
        self.connect(handler)
    }

    fn xforward(&mut self, attrs: Vec<(String, String)>) -> Response {
        if self.session.envelope.is_open() {
            return TRANSACTION_IN_PROGRESS;
        }
        for (key, value) in &attrs {
            if !XFORWARD_KEYS.contains(&key.as_str()) {
                return BAD_PARAMETER;
            }
            if key == "ADDR" && available(value) && parse_ip(value).is_none() {
                return BAD_PARAMETER;
            }
        }
        for (key, value) in attrs {
            if available(&value) {
                self.session.xforward.insert(key, value);
            } else {
                self.session.xforward.remove(&key);
            }
        }
        OK
    }
}

// XCLIENT and XFORWARD use these values to unset an attribute
fn available(value: &str) -> bool {
    !value.eq_ignore_ascii_case("[UNAVAILABLE]") && !value.eq_ignore_ascii_case("[TEMPUNAVAIL]")
}

fn parse_ip(value: &str) -> Option<IpAddr> {
    let value = match value.get(..5) {
        Some(prefix) if prefix.eq_ignore_ascii_case("IPV6:") => &value[5..],
        _ => value,
    };
    value.parse().ok()
}

//------ Tests -----------------------------------------------------------------
