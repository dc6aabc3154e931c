use crate::err::Error;
use crate::rtls;
use crate::rtls::SecureContextStore;
use crate::running::Registry;
use crate::ssl::Transport;
use log::{debug, error, trace};
use postin::{Action, Connection, ConnectionBuilder, Handler, Response};
use rustls::ServerConfig;
use std::io;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

// How often an idle connection checks for timeouts and shutdown
const POLL_INTERVAL: Duration = Duration::from_millis(250);

// Settings shared by all connections of a server
pub(crate) struct Shared {
    pub(crate) builder: ConnectionBuilder,
    pub(crate) tls: Arc<ServerConfig>,
    pub(crate) store: Arc<SecureContextStore>,
    pub(crate) socket_timeout: Duration,
    pub(crate) greeting_delay: Duration,
    pub(crate) max_connections: usize,
    pub(crate) stopping: Arc<AtomicBool>,
    pub(crate) connections: Registry,
}

// Drive a single client connection until it closes
pub(crate) fn handle_connection<H: Handler>(stream: TcpStream, handler: H, shared: &Shared) {
    let (local, remote) = match (stream.local_addr(), stream.peer_addr()) {
        (Ok(local), Ok(remote)) => (local, remote),
        (Err(err), _) | (_, Err(err)) => {
            error!("Cannot get connection addresses: {}", err);
            return;
        }
    };
    let mut conn = shared.builder.build(local, remote, handler);
    let id = conn.session().id.clone();
    debug!("[{}] New connection from {}", id, remote);
    match stream.try_clone() {
        Ok(clone) => shared.connections.add(&id, clone, conn.close_signal()),
        Err(err) => error!("[{}] Cannot register connection: {}", id, err),
    }
    if let Err(err) = run(&mut conn, stream, shared) {
        if !conn.close_signal().is_closed() {
            error!("[{}] {}", id, err);
        }
    }
    conn.close();
    shared.connections.remove(&id);
}

fn run<H: Handler>(
    conn: &mut Connection<H>,
    stream: TcpStream,
    shared: &Shared,
) -> Result<(), Error> {
    let mut buf = [0u8; 8192];
    // A TLS handshake or PROXY header is sent before the greeting
    let early = if shared.builder.is_secure() || shared.builder.is_proxy() {
        0
    } else {
        early_input(&stream, shared.greeting_delay, &mut buf)?
    };
    stream.set_read_timeout(Some(POLL_INTERVAL))?;
    stream.set_write_timeout(Some(shared.socket_timeout))?;
    let mut transport = Transport::Plain(stream);
    let mut responses = if early > 0 {
        conn.process(&buf[..early])
    } else {
        conn.start()
    };
    let mut idle = Duration::ZERO;
    loop {
        match send(&mut transport, &responses)? {
            Some(Action::Close) => return Ok(()),
            Some(Action::UpgradeTls) => {
                let (upgraded, more) = upgrade(conn, transport, shared)?;
                transport = upgraded;
                responses = more;
                continue;
            }
            _ => (),
        }
        if conn.is_closed() {
            return Ok(());
        }
        responses = match transport.read(&mut buf) {
            Ok(0) => {
                debug!("[{}] Client closed the connection", conn.session().id);
                send(&mut transport, &conn.finish())?;
                return Ok(());
            }
            Ok(n) => {
                idle = Duration::ZERO;
                conn.process(&buf[..n])
            }
            Err(err) if is_poll_timeout(&err) => {
                idle += POLL_INTERVAL;
                if shared.stopping.load(Ordering::SeqCst) {
                    conn.shutdown()
                } else if idle >= shared.socket_timeout {
                    debug!("[{}] Idle timeout", conn.session().id);
                    conn.timeout()
                } else {
                    Vec::new()
                }
            }
            Err(err) => return Err(err.into()),
        };
    }
}

// Write responses, returning the first action that is not a plain reply
fn send(transport: &mut Transport, responses: &[Response]) -> Result<Option<Action>, Error> {
    if responses.is_empty() {
        return Ok(None);
    }
    let mut out = Vec::with_capacity(256);
    let mut action = None;
    for res in responses {
        res.write_to(&mut out)?;
        if matches!(res.action, Action::Close | Action::UpgradeTls) {
            action = Some(res.action);
            break;
        }
    }
    if !out.is_empty() {
        transport
            .write_all(&out)
            .and_then(|_| transport.flush())
            .map_err(|e| Error::io("Cannot write response", e))?;
    }
    Ok(action)
}

fn upgrade<H: Handler>(
    conn: &mut Connection<H>,
    transport: Transport,
    shared: &Shared,
) -> Result<(Transport, Vec<Response>), Error> {
    let tcp = match transport {
        Transport::Plain(tcp) => tcp,
        Transport::Tls(_) => return Error::bail("TLS is already active"),
    };
    if shared.store.is_empty() {
        return Error::bail("Cannot upgrade to TLS without a certificate");
    }
    let pending = conn.take_pending();
    let (tls, info) = rtls::accept(&shared.tls, tcp, &pending)?;
    trace!(
        "[{}] TLS handshake done: {} {}",
        conn.session().id,
        info.protocol,
        info.cipher
    );
    let responses = conn.tls_established(info);
    Ok((Transport::Tls(Box::new(tls)), responses))
}

// Read anything the client sent before the greeting
fn early_input(mut stream: &TcpStream, delay: Duration, buf: &mut [u8]) -> Result<usize, Error> {
    let read = if delay.is_zero() {
        stream.set_nonblocking(true)?;
        let read = stream.read(buf);
        stream.set_nonblocking(false)?;
        read
    } else {
        stream.set_read_timeout(Some(delay))?;
        stream.read(buf)
    };
    match read {
        Ok(n) => Ok(n),
        Err(err) if is_poll_timeout(&err) => Ok(0),
        Err(err) => Err(err.into()),
    }
}

fn is_poll_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}
