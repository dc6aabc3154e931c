use crate::ssl::TlsStream;
use crate::{Error, SslConfig};
use log::debug;
use postin::TlsInfo;
use rustls::crypto::ring;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::{ServerConfig, ServerConnection, StreamOwned};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::net::TcpStream;
use std::sync::{Arc, RwLock};
use std::time::Duration;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

// Certificates by server name, never modified once shared
#[derive(Debug, Default, Clone)]
struct ContextTable {
    default: Option<Arc<CertifiedKey>>,
    named: HashMap<String, Arc<CertifiedKey>>,
}

impl ContextTable {
    fn lookup(&self, server_name: Option<&str>) -> Option<Arc<CertifiedKey>> {
        server_name
            .map(normalize)
            .and_then(|name| {
                self.named
                    .get(&name)
                    .or_else(|| wildcard(&name).and_then(|w| self.named.get(&w)))
            })
            .or(self.default.as_ref())
            .cloned()
    }

    fn is_empty(&self) -> bool {
        self.default.is_none() && self.named.is_empty()
    }
}

/// Certificates used for TLS handshakes, selected by SNI.
///
/// Updates replace the whole table so a handshake always sees a complete
/// snapshot.
#[derive(Debug, Default)]
pub(crate) struct SecureContextStore {
    table: RwLock<Arc<ContextTable>>,
}

impl SecureContextStore {
    // Set the certificate for a server name, or the default when no name is given.
    // SslConfig::None removes the entry.
    pub(crate) fn update(&self, name: Option<&str>, ssl: &SslConfig) -> Result<(), Error> {
        let key = certified_key(ssl)?;
        let mut table = self
            .table
            .write()
            .map_err(|_| Error::new("Secure context table is poisoned"))?;
        let mut next = ContextTable::clone(&table);
        match (name, key) {
            (None, key) => next.default = key,
            (Some(name), Some(key)) => {
                next.named.insert(normalize(name), key);
            }
            (Some(name), None) => {
                next.named.remove(&normalize(name));
            }
        }
        *table = Arc::new(next);
        debug!("Secure context updated for {}", name.unwrap_or("default"));
        Ok(())
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.snapshot().map_or(true, |t| t.is_empty())
    }

    fn snapshot(&self) -> Option<Arc<ContextTable>> {
        self.table.read().ok().map(|t| Arc::clone(&t))
    }
}

impl ResolvesServerCert for SecureContextStore {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let server_name = client_hello.server_name();
        let key = self.snapshot()?.lookup(server_name);
        if key.is_none() {
            debug!("No certificate for server name {:?}", server_name);
        }
        key
    }
}

// Build a rustls configuration that picks certificates from the store
pub(crate) fn server_config(store: Arc<SecureContextStore>) -> Result<Arc<ServerConfig>, Error> {
    let config = ServerConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_cert_resolver(store);
    Ok(Arc::new(config))
}

// Run the server side of a TLS handshake.
// `pending` holds bytes of the handshake that were read before the upgrade.
pub(crate) fn accept(
    config: &Arc<ServerConfig>,
    mut tcp: TcpStream,
    pending: &[u8],
) -> Result<(TlsStream, TlsInfo), Error> {
    let mut tls = ServerConnection::new(Arc::clone(config))?;
    let mut pending = pending;
    while !pending.is_empty() {
        tls.read_tls(&mut pending)?;
        tls.process_new_packets()?;
    }
    let poll_timeout = tcp.read_timeout()?;
    tcp.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;
    while tls.is_handshaking() {
        let (read, written) = tls.complete_io(&mut tcp)?;
        if read == 0 && written == 0 {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
        }
    }
    tcp.set_read_timeout(poll_timeout)?;
    let info = TlsInfo {
        cipher: tls
            .negotiated_cipher_suite()
            .map(|s| format!("{:?}", s.suite()))
            .unwrap_or_default(),
        protocol: tls
            .protocol_version()
            .map(|v| format!("{:?}", v))
            .unwrap_or_default(),
        server_name: tls.server_name().map(str::to_owned),
    };
    Ok((StreamOwned::new(tls, tcp), info))
}

fn certified_key(ssl: &SslConfig) -> Result<Option<Arc<CertifiedKey>>, Error> {
    let (certs, key) = match ssl {
        SslConfig::None => return Ok(None),
        SslConfig::SelfSigned {
            cert_path,
            key_path,
        } => (load_certs(cert_path)?, load_key(key_path)?),
        SslConfig::Trusted {
            cert_path,
            key_path,
            chain_path,
        } => {
            let mut certs = load_certs(cert_path)?;
            let mut chain = load_certs(chain_path)?;
            certs.append(&mut chain);
            (certs, load_key(key_path)?)
        }
    };
    let signing_key = ring::sign::any_supported_type(&key)?;
    Ok(Some(Arc::new(CertifiedKey::new(certs, signing_key))))
}

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>, Error> {
    let pem = fs::read(path).map_err(|e| Error::io(format!("Cannot read {}", path), e))?;
    let certs = rustls_pemfile::certs(&mut &pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| Error::tls(format!("Unparseable certificates in {}", path), e))?;
    if certs.is_empty() {
        return Error::bail(format!("No certificates found in {}", path));
    }
    Ok(certs)
}

// PKCS8, PKCS1 or SEC1 keys
fn load_key(path: &str) -> Result<PrivateKeyDer<'static>, Error> {
    let pem = fs::read(path).map_err(|e| Error::io(format!("Cannot read {}", path), e))?;
    rustls_pemfile::private_key(&mut &pem[..])
        .map_err(|e| Error::tls(format!("Unparseable key in {}", path), e))?
        .ok_or_else(|| Error::new(format!("No private key found in {}", path)))
}

fn normalize(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}

// a.example.org -> *.example.org
fn wildcard(name: &str) -> Option<String> {
    let (_, parent) = name.split_once('.')?;
    if parent.contains('.') {
        Some(format!("*.{}", parent))
    } else {
        None
    }
}
