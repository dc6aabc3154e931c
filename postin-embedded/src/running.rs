use crate::err::Error;
use crate::rtls::{server_config, SecureContextStore};
use crate::session::{handle_connection, Shared};
use crate::{Server, SslConfig};
use log::{debug, error, info, warn};
use postin::{CloseSignal, Handler};
use scoped_threadpool::Pool;
use std::collections::HashMap;
use std::io;
use std::io::Write;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const ACCEPT_INTERVAL: Duration = Duration::from_millis(50);

const REJECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Open connections that can be closed when the server stops
#[derive(Clone, Default)]
pub(crate) struct Registry {
    open: Arc<Mutex<HashMap<String, (TcpStream, CloseSignal)>>>,
    // Accepted connections, including those waiting for a thread
    active: Arc<AtomicUsize>,
}

impl Registry {
    pub(crate) fn add(&self, id: &str, stream: TcpStream, signal: CloseSignal) {
        if let Ok(mut map) = self.open.lock() {
            map.insert(id.to_owned(), (stream, signal));
        }
    }

    pub(crate) fn remove(&self, id: &str) {
        if let Ok(mut map) = self.open.lock() {
            map.remove(id);
        }
    }

    fn len(&self) -> usize {
        self.open.lock().map_or(0, |map| map.len())
    }

    // Count a new connection, fails when max connections are already active
    fn reserve(&self, max: usize) -> bool {
        self.active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                if n < max {
                    Some(n + 1)
                } else {
                    None
                }
            })
            .is_ok()
    }

    fn release(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    // Close every remaining connection, even in the middle of a transaction
    fn close_all(&self) {
        if let Ok(mut map) = self.open.lock() {
            for (id, (stream, signal)) in map.drain() {
                warn!("[{}] Closing connection at shutdown", id);
                signal.close();
                if let Err(err) = stream.shutdown(Shutdown::Both) {
                    debug!("[{}] Socket shutdown: {}", id, err);
                }
            }
        }
    }
}

/// A server that is running in a background thread
pub struct RunningServer {
    local_addr: SocketAddr,
    stopping: Arc<AtomicBool>,
    connections: Registry,
    store: Arc<SecureContextStore>,
    close_timeout: Duration,
    join: JoinHandle<()>,
}

impl RunningServer {
    pub(crate) fn serve<H>(config: Server<H>) -> Result<Self, Error>
    where
        H: Handler + Clone + Send + 'static,
    {
        let Server {
            handler,
            mut builder,
            ssl_config,
            sni,
            num_threads,
            max_connections,
            tcp_listener,
            socket_address,
            socket_timeout,
            close_timeout,
            greeting_delay,
        } = config;
        let store = Arc::new(SecureContextStore::default());
        store.update(None, &ssl_config)?;
        for (name, ssl) in &sni {
            store.update(Some(name), ssl)?;
        }
        if !store.is_empty() {
            builder.enable_start_tls();
        } else if builder.is_secure() {
            return Error::bail("Implicit TLS needs a certificate");
        }
        let tls = server_config(Arc::clone(&store))?;
        let listener = match tcp_listener {
            Some(listener) => listener,
            None => TcpListener::bind(&socket_address[..])
                .map_err(|err| Error::io("Cannot open listen address", err))?,
        };
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        let stopping = Arc::new(AtomicBool::new(false));
        let connections = Registry::default();
        let shared = Shared {
            builder,
            tls,
            store: Arc::clone(&store),
            socket_timeout,
            greeting_delay,
            max_connections: max_connections.unwrap_or(num_threads as usize),
            stopping: Arc::clone(&stopping),
            connections: connections.clone(),
        };
        info!("{} SMTP started on {}", shared.builder.name(), local_addr);
        let join = thread::Builder::new()
            .name("postin-accept".to_owned())
            .spawn(move || run(listener, handler, shared, num_threads))?;
        Ok(Self {
            local_addr,
            stopping,
            connections,
            store,
            close_timeout,
            join,
        })
    }

    /// The address the server is listening on
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Replace the certificate for a server name, or the default certificate
    /// when `name` is `None`. New TLS handshakes use the new certificate.
    pub fn update_secure_context(&self, name: Option<&str>, ssl: SslConfig) -> Result<(), Error> {
        self.store.update(name, &ssl)
    }

    /// Stop accepting connections and wait for open connections to finish.
    ///
    /// Idle connections are closed at once. Connections in the middle of a
    /// mail transaction get the close timeout to finish before they are
    /// closed.
    pub fn stop(self) -> Result<(), Error> {
        info!("Stopping SMTP server on {}", self.local_addr);
        self.stopping.store(true, Ordering::SeqCst);
        let deadline = Instant::now() + self.close_timeout;
        while !self.join.is_finished() && Instant::now() < deadline {
            thread::sleep(ACCEPT_INTERVAL);
        }
        if !self.join.is_finished() {
            warn!(
                "{} connections still open after {:?}",
                self.connections.len(),
                self.close_timeout
            );
            self.connections.close_all();
        }
        self.join()
    }

    /// Wait for the server thread to finish
    pub fn join(self) -> Result<(), Error> {
        self.join
            .join()
            .map_err(|_| Error::new("Error joining server"))
    }
}

fn run<H>(listener: TcpListener, handler: H, shared: Shared, num_threads: u32)
where
    H: Handler + Clone + Send + 'static,
{
    let mut pool = Pool::new(num_threads);
    pool.scoped(|scope| {
        while !shared.stopping.load(Ordering::SeqCst) {
            match listener.accept() {
                Ok((stream, remote)) => {
                    if let Err(err) = stream.set_nonblocking(false) {
                        error!("Cannot use connection from {}: {}", remote, err);
                        continue;
                    }
                    if !shared.connections.reserve(shared.max_connections) {
                        reject(stream, remote, &shared);
                        continue;
                    }
                    let handler = handler.clone();
                    let shared = &shared;
                    scope.execute(move || {
                        handle_connection(stream, handler, shared);
                        shared.connections.release();
                    });
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_INTERVAL);
                }
                Err(err) => {
                    error!("Error accepting connection: {}", err);
                    thread::sleep(ACCEPT_INTERVAL);
                }
            }
        }
        debug!("No longer accepting connections");
    });
    info!("SMTP server stopped");
}

// Turn away a client when the server is full
fn reject(stream: TcpStream, remote: SocketAddr, shared: &Shared) {
    warn!("Too many connections, rejecting {}", remote);
    if let Err(err) = send_busy(stream, shared) {
        debug!("Cannot reject {}: {}", remote, err);
    }
}

fn send_busy(mut stream: TcpStream, shared: &Shared) -> io::Result<()> {
    let mut out = Vec::with_capacity(128);
    shared.builder.too_many_connections().write_to(&mut out)?;
    stream.set_write_timeout(Some(REJECT_TIMEOUT))?;
    stream.write_all(&out)?;
    stream.shutdown(Shutdown::Write)
}
