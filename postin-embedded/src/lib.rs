//! A SMTP server that can be embedded into another program
//!
//! This library provides a simple embeddable SMTP server. The
//! server uses blocking IO and a threadpool.
//! # Examples
//! ```no_run
//! use postin_embedded::{Server, SslConfig, Handler};
//!
//! #[derive(Clone)]
//! struct MyHandler {}
//! impl Handler for MyHandler{}
//!
//! let addr = "127.0.0.1:25";
//! let domain = "example.com".to_owned();
//! let ssl_config = SslConfig::None;
//! let handler = MyHandler {};
//! let mut server = Server::new(handler);
//!
//! server.with_name(domain)
//!    .with_ssl(ssl_config)
//!    .with_addr(addr)
//!    .unwrap();
//! server.serve_forever().unwrap();
//! ```

#![forbid(unsafe_code)]

mod err;
mod rtls;
mod running;
mod session;
mod ssl;

pub use crate::err::{Error, ErrorKind};
pub use crate::running::RunningServer;
pub use postin::{
    Address, AuthAttempt, AuthMechanism, AuthResult, ConnectionBuilder, DataResult, DataSummary,
    Handler, Reject, Session,
};
use std::net::{SocketAddr, TcpListener, ToSocketAddrs};
use std::time::Duration;

/// `SslConfig` is used to configure the TLS certificates of the server
#[derive(Debug, Clone)]
pub enum SslConfig {
    /// Do not support TLS
    None,
    /// Use a self-signed certificate
    SelfSigned {
        /// Certificate path
        cert_path: String,
        /// Path to key file
        key_path: String,
    },
    /// Use a certificate from an authority
    Trusted {
        /// Certificate path
        cert_path: String,
        /// Key file path
        key_path: String,
        /// Path to CA bundle
        chain_path: String,
    },
}

/// `Server` is used to configure and start the SMTP server
pub struct Server<H>
where
    H: Handler + Clone + Send + 'static,
{
    handler: H,
    builder: ConnectionBuilder,
    ssl_config: SslConfig,
    sni: Vec<(String, SslConfig)>,
    num_threads: u32,
    max_connections: Option<usize>,
    tcp_listener: Option<TcpListener>,
    socket_address: Vec<SocketAddr>,
    socket_timeout: Duration,
    close_timeout: Duration,
    greeting_delay: Duration,
}

impl<H> Server<H>
where
    H: Handler + Clone + Send + 'static,
{
    /// Create a new server with the given Handler
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            builder: ConnectionBuilder::new("localhost"),
            ssl_config: SslConfig::None,
            sni: Vec::new(),
            num_threads: 4,
            max_connections: None,
            tcp_listener: None,
            socket_address: Vec::with_capacity(4),
            socket_timeout: Duration::from_secs(60),
            close_timeout: Duration::from_secs(30),
            greeting_delay: Duration::ZERO,
        }
    }

    /// Give the server a name
    pub fn with_name<S: Into<String>>(&mut self, name: S) -> &mut Self {
        self.builder.set_name(name);
        self
    }

    /// Set the default certificate of the server. STARTTLS is offered when
    /// a certificate is configured.
    pub fn with_ssl(&mut self, ssl_config: SslConfig) -> &mut Self {
        self.ssl_config = ssl_config;
        self
    }

    /// Use a certificate for clients that ask for the given server name.
    /// Names like `*.example.org` match any single label.
    pub fn with_sni<S: Into<String>>(&mut self, name: S, ssl_config: SslConfig) -> &mut Self {
        self.sni.push((name.into(), ssl_config));
        self
    }

    /// Set the size of the threadpool which is equal to the maximum number of
    /// concurrent SMTP sessions.
    pub fn with_num_threads(&mut self, num_threads: u32) -> &mut Self {
        self.num_threads = num_threads;
        self
    }

    /// Set the maximum number of clients that can be connected at once.
    /// Further clients get a 421 reply and are disconnected. Defaults to the
    /// number of threads.
    pub fn with_max_connections(&mut self, max_connections: usize) -> &mut Self {
        self.max_connections = Some(max_connections);
        self
    }

    /// Wait this long for client input before sending the greeting. Clients
    /// that talk before the greeting are disconnected.
    pub fn with_greeting_delay(&mut self, delay: Duration) -> &mut Self {
        self.greeting_delay = delay;
        self
    }

    /// Add an authentication mechanism that will supported by the server
    pub fn with_auth(&mut self, auth: AuthMechanism) -> &mut Self {
        self.builder.enable_auth(auth);
        self
    }

    /// Set a tcp listener from an already open socket
    pub fn with_tcp_listener(&mut self, listener: TcpListener) -> &mut Self {
        self.tcp_listener = Some(listener);
        self
    }

    /// Add ip addresses and ports to listen on.
    /// Returns an error if the given socket addresses are not valid.
    /// ```
    /// # use postin_embedded::{Server, Handler};
    /// # #[derive(Clone)]
    /// # struct EmptyHandler {}
    /// # impl Handler for EmptyHandler {}
    /// # let mut server = Server::new(EmptyHandler {});
    /// server.with_addr("127.0.0.1:25").unwrap();
    /// ```
    pub fn with_addr<A: ToSocketAddrs>(&mut self, addr: A) -> Result<&mut Self, Error> {
        for addr in addr.to_socket_addrs()? {
            self.socket_address.push(addr);
        }
        Ok(self)
    }

    /// Close connections that are idle for longer than this
    pub fn with_socket_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.socket_timeout = timeout;
        self
    }

    /// How long connections in a mail transaction may take to finish when
    /// the server stops
    pub fn with_close_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.close_timeout = timeout;
        self
    }

    /// The SMTP settings used for each connection
    /// ```
    /// # use postin_embedded::{Server, Handler};
    /// # #[derive(Clone)]
    /// # struct EmptyHandler {}
    /// # impl Handler for EmptyHandler {}
    /// # let mut server = Server::new(EmptyHandler {});
    /// server.connection_builder().max_size(10 * 1024 * 1024).enable_proxy();
    /// ```
    pub fn connection_builder(&mut self) -> &mut ConnectionBuilder {
        &mut self.builder
    }

    /// Start the SMTP server in a background thread
    pub fn serve(self) -> Result<RunningServer, Error> {
        if self.tcp_listener.is_none() && self.socket_address.is_empty() {
            return Error::bail("No address to listen on");
        }
        RunningServer::serve(self)
    }

    /// Start the SMTP server and run forever
    pub fn serve_forever(self) -> Result<(), Error> {
        let running = self.serve()?;
        running.join()
    }
}
