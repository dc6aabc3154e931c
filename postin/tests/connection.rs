use hmac::{Hmac, Mac};
use md5::Md5;
use postin::{
    Action, AuthAttempt, AuthMechanism, AuthResult, CloseSignal, Connection, ConnectionBuilder,
    DataResult, DataSummary, Handler, OAuthError, OpeningCommand, Reject, Response, Session,
    TlsInfo,
};
use pretty_assertions::assert_eq;
use std::cell::RefCell;
use std::io;
use std::io::Write;
use std::net::{IpAddr, SocketAddr};
use std::rc::Rc;

//------ Test handler ----------------------------------------------------------

#[derive(Default)]
struct Recorder {
    blocked: Option<IpAddr>,
    password: Option<String>,
    oauth_challenge: bool,
    max_size: Option<usize>,
    // Closed from inside the MAIL callback
    close_on_mail: Rc<RefCell<Option<CloseSignal>>>,
    body: Rc<RefCell<Vec<u8>>>,
    closed: Rc<RefCell<usize>>,
}

struct SharedWriter(Rc<RefCell<Vec<u8>>>);

impl Write for SharedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Handler for Recorder {
    fn connect(&mut self, session: &Session) -> Result<(), Reject> {
        if Some(session.remote_addr.ip()) == self.blocked {
            Err(Reject::with_code(421, "Blacklisted IP"))
        } else {
            Ok(())
        }
    }

    fn auth(&mut self, attempt: &AuthAttempt, _session: &Session) -> AuthResult {
        if self.oauth_challenge {
            return AuthResult::OAuthChallenge(OAuthError {
                status: "401".to_owned(),
                schemes: "bearer".to_owned(),
                scope: "https://mail.google.com/".to_owned(),
            });
        }
        match &self.password {
            Some(password) if attempt.validate_password(password) => {
                AuthResult::Ok(attempt.username().to_owned())
            }
            _ => AuthResult::InvalidCredentials,
        }
    }

    fn mail(&mut self, _from: &postin::Address, _session: &Session) -> Result<(), Reject> {
        if let Some(signal) = self.close_on_mail.borrow().as_ref() {
            signal.close();
        }
        Ok(())
    }

    fn rcpt(&mut self, to: &postin::Address, _session: &Session) -> Result<(), Reject> {
        if to.address.starts_with("nobody@") {
            Err(Reject::no_mailbox())
        } else {
            Ok(())
        }
    }

    fn data(&mut self, _session: &Session) -> DataResult {
        self.body.borrow_mut().clear();
        DataResult::Ok(Box::new(SharedWriter(self.body.clone())))
    }

    fn data_end(
        &mut self,
        summary: &DataSummary,
        _session: &Session,
    ) -> Result<Option<String>, Reject> {
        match self.max_size {
            Some(max) if summary.size_exceeded => Err(Reject::size_exceeded(max)),
            _ => Ok(None),
        }
    }

    fn close(&mut self, _session: &Session) {
        *self.closed.borrow_mut() += 1;
    }
}

//------ Helpers ---------------------------------------------------------------

fn local() -> SocketAddr {
    "127.0.0.1:25".parse().unwrap()
}

fn remote() -> SocketAddr {
    "127.0.0.1:40000".parse().unwrap()
}

fn connect(builder: &ConnectionBuilder, handler: Recorder) -> Connection<Recorder> {
    let mut conn = builder.build(local(), remote(), handler);
    let greeting = conn.start();
    assert_eq!(greeting.len(), 1);
    assert_eq!(greeting[0].code, 220);
    conn
}

fn written(responses: &[Response]) -> String {
    let mut buf = Vec::new();
    for res in responses {
        res.write_to(&mut buf).unwrap();
    }
    String::from_utf8(buf).unwrap()
}

// Send one line and return the single response
fn send(conn: &mut Connection<Recorder>, line: &str) -> Response {
    let mut responses = conn.process(format!("{}\r\n", line).as_bytes());
    assert_eq!(responses.len(), 1, "responses to {}: {:?}", line, responses);
    responses.remove(0)
}

fn codes(responses: &[Response]) -> Vec<u16> {
    responses.iter().map(|r| r.code).collect()
}

fn tls_info() -> TlsInfo {
    TlsInfo {
        cipher: "TLS13_AES_256_GCM_SHA384".to_owned(),
        protocol: "TLSv1_3".to_owned(),
        server_name: None,
    }
}

//------ Tests -----------------------------------------------------------------

#[test]
fn ehlo_extensions() {
    let mut builder = ConnectionBuilder::new("mx.example.org");
    builder
        .enable_start_tls()
        .enable_auth(AuthMechanism::Plain)
        .enable_auth(AuthMechanism::Login)
        .max_size(1000);
    let mut conn = connect(&builder, Recorder::default());
    let res = send(&mut conn, "EHLO client.example.org");
    assert_eq!(
        written(&[res]),
        "250-mx.example.org Nice to meet you, [127.0.0.1]\r\n\
         250-PIPELINING\r\n\
         250-8BITMIME\r\n\
         250-SMTPUTF8\r\n\
         250-STARTTLS\r\n\
         250 SIZE 1000\r\n"
    );
    assert_eq!(conn.session().opening_command, Some(OpeningCommand::Ehlo));
    assert_eq!(
        conn.session().host_name_appears_as.as_deref(),
        Some("client.example.org")
    );
}

#[test]
fn ehlo_insecure_auth() {
    let mut builder = ConnectionBuilder::new("mx");
    builder
        .enable_auth(AuthMechanism::Plain)
        .enable_auth(AuthMechanism::CramMd5)
        .allow_insecure_auth()
        .banner("Postin ready");
    let mut conn = builder.build(local(), remote(), Recorder::default());
    assert_eq!(written(&conn.start()), "220 mx ESMTP Postin ready\r\n");
    let res = send(&mut conn, "EHLO a");
    assert!(res.message().contains("AUTH PLAIN CRAM-MD5"));
}

#[test]
fn command_sequence() {
    let builder = ConnectionBuilder::new("mx");
    let mut conn = connect(&builder, Recorder::default());
    assert_eq!(
        written(&[send(&mut conn, "MAIL FROM:<a@b.c>")]),
        "503 Error: send HELO/EHLO first\r\n"
    );
    assert_eq!(send(&mut conn, "HELO").code, 501);
    assert_eq!(
        written(&[send(&mut conn, "HELO client")]),
        "250 mx Nice to meet you, [127.0.0.1]\r\n"
    );
    assert_eq!(
        written(&[send(&mut conn, "RCPT TO:<a@b.c>")]),
        "503 Error: need MAIL command\r\n"
    );
    assert_eq!(send(&mut conn, "DATA").code, 503);
    assert_eq!(send(&mut conn, "MAIL FROM:<>").code, 250);
    assert_eq!(
        written(&[send(&mut conn, "MAIL FROM:<a@b.c>")]),
        "503 Error: nested MAIL command\r\n"
    );
    assert_eq!(
        written(&[send(&mut conn, "DATA")]),
        "503 Error: need RCPT command\r\n"
    );
    assert_eq!(send(&mut conn, "RCPT TO:<>").code, 501);
    assert_eq!(
        written(&[send(&mut conn, "RCPT TO:<nobody@b.c>")]),
        "550 Mailbox unavailable\r\n"
    );
    assert!(conn.session().envelope.rcpt_to.is_empty());
    assert_eq!(send(&mut conn, "RCPT TO:<Fish@Sea.com>").code, 250);
    assert_eq!(send(&mut conn, "RCPT TO:<fish@sea.com>").code, 250);
    assert_eq!(conn.session().envelope.rcpt_to.len(), 1);
    assert_eq!(send(&mut conn, "VRFY fish").code, 252);
    assert_eq!(send(&mut conn, "NOOP").code, 250);
    assert_eq!(send(&mut conn, "RSET").code, 250);
    assert!(!conn.session().envelope.is_open());
    let res = send(&mut conn, "QUIT");
    assert_eq!(written(&[res.clone()]), "221 Goodbye\r\n");
    assert_eq!(res.action, Action::Close);
    assert!(conn.is_closed());
}

#[test]
fn pipelined_transaction() {
    let handler = Recorder::default();
    let body = handler.body.clone();
    let builder = ConnectionBuilder::new("mx");
    let mut conn = connect(&builder, handler);
    let responses = conn.process(
        b"EHLO a\r\nMAIL FROM:<a@b.c> BODY=8BITMIME\r\nRCPT TO:<d@e.f>\r\nDATA\r\n\
          Subject: hi\r\n\r\n..dot\r\n.\r\nQUIT\r\n",
    );
    assert_eq!(codes(&responses), vec![250, 250, 250, 354, 250, 221]);
    assert_eq!(responses[4].message(), "OK: message queued");
    assert_eq!(&body.borrow()[..], b"Subject: hi\r\n\r\n.dot\r\n");
    assert_eq!(conn.session().transaction, 1);
}

#[test]
fn body_split_across_reads() {
    let handler = Recorder::default();
    let body = handler.body.clone();
    let mut conn = connect(&ConnectionBuilder::new("mx"), handler);
    send(&mut conn, "HELO a");
    send(&mut conn, "MAIL FROM:<a@b.c>");
    send(&mut conn, "RCPT TO:<d@e.f>");
    assert_eq!(send(&mut conn, "DATA").code, 354);
    assert!(conn.process(b"line one\r").is_empty());
    assert!(conn.process(b"\n.").is_empty());
    assert!(conn.process(b".two\r\n").is_empty());
    assert!(conn.has_open_transaction());
    let res = conn.process(b".\r\n");
    assert_eq!(codes(&res), vec![250]);
    assert_eq!(&body.borrow()[..], b"line one\r\n.two\r\n");
    assert!(!conn.has_open_transaction());
}

#[test]
fn size_exceeded() {
    let handler = Recorder {
        max_size: Some(10),
        ..Recorder::default()
    };
    let mut builder = ConnectionBuilder::new("mx");
    builder.max_size(10);
    let mut conn = connect(&builder, handler);
    send(&mut conn, "EHLO a");
    assert_eq!(
        written(&[send(&mut conn, "MAIL FROM:<a@b.c> SIZE=100")]),
        "552 Error: message exceeds fixed maximum message size 10\r\n"
    );
    send(&mut conn, "MAIL FROM:<a@b.c> SIZE=5");
    send(&mut conn, "RCPT TO:<d@e.f>");
    send(&mut conn, "DATA");
    assert!(conn.process(b"0123456789\r\n").is_empty());
    let res = send(&mut conn, ".");
    assert_eq!(res.code, 552);
    assert_eq!(res.action, Action::Reply);
}

#[test]
fn unrecognized_limit() {
    let mut conn = connect(&ConnectionBuilder::new("mx"), Recorder::default());
    for _ in 0..10 {
        assert_eq!(
            written(&[send(&mut conn, "FOO bar")]),
            "500 Error: command not recognized\r\n"
        );
    }
    let res = send(&mut conn, "FOO bar");
    assert_eq!(res.code, 421);
    assert_eq!(res.action, Action::Close);
    assert_eq!(conn.session().unrecognized_commands(), 11);
}

#[test]
fn unauthenticated_limit() {
    let mut builder = ConnectionBuilder::new("mx");
    builder.enable_auth(AuthMechanism::Plain);
    let mut conn = connect(&builder, Recorder::default());
    assert_eq!(send(&mut conn, "EHLO a").code, 250);
    assert_eq!(
        written(&[send(&mut conn, "MAIL FROM:<a@b.c>")]),
        "530 Error: authentication Required\r\n"
    );
    for _ in 0..8 {
        assert_eq!(send(&mut conn, "NOOP").code, 250);
    }
    let res = send(&mut conn, "NOOP");
    assert_eq!(
        written(&[res]),
        "421 Error: too many unauthenticated commands\r\n"
    );
    assert!(conn.is_closed());
}

#[test]
fn auth_plain() {
    let handler = Recorder {
        password: Some("testpass".to_owned()),
        ..Recorder::default()
    };
    let mut builder = ConnectionBuilder::new("mx");
    builder.enable_auth(AuthMechanism::Plain);
    let mut conn = connect(&builder, handler);
    send(&mut conn, "EHLO a");
    assert_eq!(send(&mut conn, "AUTH PLAIN AHRlc3R1c2VyAHdyb25n").code, 535);
    assert_eq!(
        written(&[send(&mut conn, "AUTH PLAIN AHRlc3R1c2VyAHRlc3RwYXNz")]),
        "235 Authentication successful\r\n"
    );
    assert_eq!(conn.session().user.as_deref(), Some("testuser"));
    assert_eq!(
        send(&mut conn, "AUTH PLAIN AHRlc3R1c2VyAHRlc3RwYXNz").code,
        503
    );
    assert_eq!(send(&mut conn, "MAIL FROM:<a@b.c>").code, 250);
}

#[test]
fn auth_login_abort() {
    let mut builder = ConnectionBuilder::new("mx");
    builder.enable_auth(AuthMechanism::Login);
    let mut conn = connect(&builder, Recorder::default());
    send(&mut conn, "EHLO a");
    assert_eq!(
        written(&[send(&mut conn, "AUTH LOGIN")]),
        "334 VXNlcm5hbWU6\r\n"
    );
    assert_eq!(
        written(&[send(&mut conn, "*")]),
        "501 Authentication aborted\r\n"
    );
    assert_eq!(send(&mut conn, "NOOP").code, 250);
}

#[test]
fn auth_needs_tls() {
    let mut builder = ConnectionBuilder::new("mx");
    builder
        .enable_auth(AuthMechanism::Plain)
        .enable_auth(AuthMechanism::CramMd5);
    let mut conn = connect(&builder, Recorder::default());
    send(&mut conn, "EHLO a");
    assert_eq!(
        written(&[send(&mut conn, "AUTH CRAM-MD5")]),
        "530 Error: Must issue a STARTTLS command first\r\n"
    );
    assert_eq!(send(&mut conn, "AUTH XOAUTH2").code, 504);
    assert_eq!(send(&mut conn, "AUTH PLAIN").code, 334);
}

#[test]
fn auth_cram_md5() {
    let handler = Recorder {
        password: Some("testpass".to_owned()),
        ..Recorder::default()
    };
    let mut builder = ConnectionBuilder::new("mx.example.org");
    builder
        .enable_auth(AuthMechanism::CramMd5)
        .allow_insecure_auth();
    let mut conn = connect(&builder, handler);
    send(&mut conn, "EHLO a");
    let res = send(&mut conn, "AUTH CRAM-MD5");
    assert_eq!(res.code, 334);
    let challenge = base64::decode(res.message()).unwrap();
    assert!(challenge.ends_with(b"@mx.example.org>"));
    let mut mac = Hmac::<Md5>::new_from_slice(b"testpass").unwrap();
    mac.update(&challenge);
    let digest = hex::encode(mac.finalize().into_bytes());
    let response = base64::encode(format!("testuser {}", digest));
    assert_eq!(send(&mut conn, &response).code, 235);
    assert_eq!(conn.session().user.as_deref(), Some("testuser"));
}

#[test]
fn auth_xoauth2_challenge() {
    let handler = Recorder {
        oauth_challenge: true,
        ..Recorder::default()
    };
    let mut builder = ConnectionBuilder::new("mx");
    builder
        .enable_auth(AuthMechanism::XOAuth2)
        .allow_insecure_auth();
    let mut conn = connect(&builder, handler);
    send(&mut conn, "EHLO a");
    let token = base64::encode("user=testuser\x01auth=Bearer testtoken\x01\x01");
    let res = send(&mut conn, &format!("AUTH XOAUTH2 {}", token));
    assert_eq!(res.code, 334);
    let json: serde_json::Value =
        serde_json::from_slice(&base64::decode(res.message()).unwrap()).unwrap();
    assert_eq!(json["status"], "401");
    assert_eq!(json["schemes"], "bearer");
    assert_eq!(
        written(&[send(&mut conn, "")]),
        "535 Error: Authentication credentials invalid\r\n"
    );
    assert_eq!(send(&mut conn, "NOOP").code, 250);
}

#[test]
fn start_tls() {
    let mut builder = ConnectionBuilder::new("mx");
    builder.enable_start_tls();
    let mut conn = connect(&builder, Recorder::default());
    send(&mut conn, "EHLO a");
    send(&mut conn, "MAIL FROM:<a@b.c>");
    assert_eq!(send(&mut conn, "STARTTLS").code, 503);
    send(&mut conn, "RSET");
    // Plaintext after STARTTLS is dropped
    let res = conn.process(b"STARTTLS\r\nMAIL FROM:<injected@b.c>\r\n");
    assert_eq!(written(&res), "220 Ready to start TLS\r\n");
    assert_eq!(res[0].action, Action::UpgradeTls);
    assert!(conn.tls_established(tls_info()).is_empty());
    assert!(conn.session().is_secure());
    assert_eq!(conn.session().opening_command, None);
    assert_eq!(send(&mut conn, "MAIL FROM:<a@b.c>").code, 503);
    let res = send(&mut conn, "EHLO a");
    assert!(!res.message().contains("STARTTLS"));
    assert_eq!(
        written(&[send(&mut conn, "STARTTLS")]),
        "503 Error: TLS already active\r\n"
    );
}

#[test]
fn start_tls_hidden() {
    let mut builder = ConnectionBuilder::new("mx");
    builder.enable_start_tls().hide_start_tls();
    let mut conn = connect(&builder, Recorder::default());
    let res = send(&mut conn, "EHLO a");
    assert!(!res.message().contains("STARTTLS"));
    assert_eq!(send(&mut conn, "STARTTLS").code, 502);
}

#[test]
fn implicit_tls() {
    let mut builder = ConnectionBuilder::new("mx");
    builder.secure();
    let mut conn = builder.build(local(), remote(), Recorder::default());
    let res = conn.start();
    assert_eq!(res.len(), 1);
    assert_eq!(res[0].action, Action::UpgradeTls);
    assert!(res[0].is_empty());
    assert!(conn.process(b"\x16\x03\x01").is_empty());
    assert_eq!(conn.take_pending(), b"\x16\x03\x01".to_vec());
    let res = conn.tls_established(tls_info());
    assert_eq!(written(&res), "220 mx ESMTP\r\n");
    assert!(conn.session().is_ready());
}

#[test]
fn proxy_header() {
    let mut builder = ConnectionBuilder::new("mx");
    builder.enable_proxy();
    let mut conn = builder.build(local(), remote(), Recorder::default());
    assert!(conn.start().is_empty());
    let res = conn.process(b"PROXY TCP4 192.168.0.1 192.168.0.11 56324 443\r\nHELO a\r\n");
    assert_eq!(codes(&res), vec![220, 250]);
    assert_eq!(
        conn.session().remote_addr,
        "192.168.0.1:56324".parse::<SocketAddr>().unwrap()
    );
    assert_eq!(conn.session().client_hostname, "[192.168.0.1]");
}

#[test]
fn proxy_header_invalid() {
    let mut builder = ConnectionBuilder::new("mx");
    builder.enable_proxy();
    let mut conn = builder.build(local(), remote(), Recorder::default());
    conn.start();
    let res = conn.process(b"HELO a\r\n");
    assert_eq!(res.len(), 1);
    assert!(res[0].is_empty());
    assert_eq!(res[0].action, Action::Close);
    assert!(!conn.session().is_ready());
}

#[test]
fn proxy_blocked_source() {
    let handler = Recorder {
        blocked: Some("10.0.0.1".parse().unwrap()),
        ..Recorder::default()
    };
    let mut builder = ConnectionBuilder::new("mx");
    builder.enable_proxy();
    let mut conn = builder.build(local(), remote(), handler);
    conn.start();
    let res = conn.process(b"PROXY TCP4 10.0.0.1 127.0.0.1 1000 25\r\n");
    assert_eq!(written(&res), "421 Blacklisted IP\r\n");
    assert_eq!(res[0].action, Action::Close);
}

#[test]
fn early_talker() {
    let mut conn = ConnectionBuilder::new("mx").build(local(), remote(), Recorder::default());
    let res = conn.process(b"EHLO a\r\n");
    assert_eq!(written(&res), "421 You talk too soon\r\n");
    assert!(conn.is_closed());
}

#[test]
fn http_request() {
    let mut conn = connect(&ConnectionBuilder::new("mx"), Recorder::default());
    let res = send(&mut conn, "GET / HTTP/1.1");
    assert_eq!(written(&[res]), "421 HTTP requests not allowed\r\n");
}

#[test]
fn disabled_command() {
    let mut builder = ConnectionBuilder::new("mx");
    builder.disable_command("vrfy");
    let mut conn = connect(&builder, Recorder::default());
    assert_eq!(
        written(&[send(&mut conn, "VRFY someone")]),
        "502 Error: command not implemented\r\n"
    );
    assert_eq!(send(&mut conn, "XCLIENT NAME=a").code, 502);
}

#[test]
fn lmtp() {
    let mut builder = ConnectionBuilder::new("mx");
    builder.lmtp();
    let mut conn = builder.build(local(), remote(), Recorder::default());
    assert_eq!(written(&conn.start()), "220 mx LMTP\r\n");
    assert_eq!(send(&mut conn, "EHLO a").code, 500);
    assert_eq!(
        written(&[send(&mut conn, "MAIL FROM:<a@b.c>")]),
        "503 Error: send LHLO first\r\n"
    );
    assert_eq!(send(&mut conn, "LHLO a").code, 250);
    send(&mut conn, "MAIL FROM:<a@b.c>");
    send(&mut conn, "RCPT TO:<one@b.c>");
    send(&mut conn, "RCPT TO:<two@b.c>");
    send(&mut conn, "DATA");
    let res = conn.process(b"hello\r\n.\r\n");
    assert_eq!(codes(&res), vec![250, 250]);
}

#[test]
fn xclient() {
    let mut builder = ConnectionBuilder::new("mx");
    builder.enable_xclient();
    let mut conn = connect(&builder, Recorder::default());
    let res = send(&mut conn, "EHLO a");
    assert!(res
        .message()
        .contains("XCLIENT NAME ADDR PORT PROTO HELO LOGIN"));
    assert_eq!(send(&mut conn, "XCLIENT ADDR=not-an-ip").code, 501);
    assert_eq!(send(&mut conn, "XCLIENT FOO=bar").code, 501);
    let res = send(
        &mut conn,
        "XCLIENT NAME=Spike.Porcupine.org ADDR=168.100.189.2 PORT=2525 LOGIN=joe",
    );
    assert_eq!(written(&[res]), "220 mx ESMTP\r\n");
    let session = conn.session();
    assert_eq!(
        session.remote_addr,
        "168.100.189.2:2525".parse::<SocketAddr>().unwrap()
    );
    assert_eq!(session.client_hostname, "spike.porcupine.org");
    assert_eq!(session.user.as_deref(), Some("joe"));
    assert_eq!(session.opening_command, None);
    assert_eq!(session.xclient.get("LOGIN").map(String::as_str), Some("joe"));
}

#[test]
fn xforward() {
    let mut builder = ConnectionBuilder::new("mx");
    builder.enable_xforward();
    let mut conn = connect(&builder, Recorder::default());
    send(&mut conn, "EHLO a");
    assert_eq!(send(&mut conn, "XFORWARD ADDR=bogus").code, 501);
    assert_eq!(
        send(&mut conn, "XFORWARD NAME=relay.example.org IDENT=[UNAVAILABLE]").code,
        250
    );
    assert_eq!(
        conn.session().xforward.get("NAME").map(String::as_str),
        Some("relay.example.org")
    );
    assert!(conn.session().xforward.get("IDENT").is_none());
}

#[test]
fn final_line_without_newline() {
    let mut conn = connect(&ConnectionBuilder::new("mx"), Recorder::default());
    let res = conn.process(b"NOOP\r\nQUIT");
    assert_eq!(codes(&res), vec![250]);
    let res = conn.finish();
    assert_eq!(written(&res), "221 Goodbye\r\n");
}

#[test]
fn timeout() {
    let mut conn = connect(&ConnectionBuilder::new("mx"), Recorder::default());
    assert_eq!(written(&conn.timeout()), "421 Timeout - closing connection\r\n");
    assert!(conn.timeout().is_empty());
}

#[test]
fn shutdown_waits_for_transaction() {
    let mut conn = connect(&ConnectionBuilder::new("mx"), Recorder::default());
    send(&mut conn, "HELO a");
    send(&mut conn, "MAIL FROM:<a@b.c>");
    assert!(conn.shutdown().is_empty());
    assert!(!conn.is_closed());
    send(&mut conn, "RSET");
    assert_eq!(written(&conn.shutdown()), "421 Server shutting down\r\n");
    assert!(conn.is_closed());
}

#[test]
fn abort_during_transaction() {
    let mut conn = connect(&ConnectionBuilder::new("mx"), Recorder::default());
    send(&mut conn, "HELO a");
    send(&mut conn, "MAIL FROM:<a@b.c>");
    assert_eq!(codes(&conn.abort()), vec![421]);
}

#[test]
fn late_result_discarded() {
    let handler = Recorder::default();
    let slot = handler.close_on_mail.clone();
    let closed = handler.closed.clone();
    let mut conn = connect(&ConnectionBuilder::new("mx"), handler);
    *slot.borrow_mut() = Some(conn.close_signal());
    send(&mut conn, "HELO a");
    assert!(conn.process(b"MAIL FROM:<a@b.c>\r\n").is_empty());
    assert!(conn.is_closed());
    assert!(!conn.session().envelope.is_open());
    conn.close();
    conn.close();
    assert_eq!(*closed.borrow(), 1);
}
