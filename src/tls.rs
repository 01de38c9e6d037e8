//! TLS for the shared channel: rustls client connector and server acceptor.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio::net::TcpStream;
use tokio_rustls::{client, server, TlsAcceptor, TlsConnector};

use crate::error::{Error, Result};

/// Client-side TLS: verifies the server against webpki roots, plus any roots
/// loaded from a CA file.
pub struct ClientTls {
    connector: TlsConnector,
    server_name: ServerName<'static>,
}

impl ClientTls {
    /// Build a connector verifying against `server_name`, trusting the
    /// webpki roots or, when `ca_file` is given, only the certificates in it.
    pub fn new(ca_file: Option<&str>, server_name: &str) -> Result<Self> {
        let mut root_store = RootCertStore::empty();
        match ca_file {
            Some(path) => {
                for cert in load_certificates(path)? {
                    root_store
                        .add(cert)
                        .map_err(|e| Error::tls(format!("bad CA certificate in {}: {}", path, e)))?;
                }
            }
            None => root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
        }

        let provider = rustls::crypto::ring::default_provider();
        let config = ClientConfig::builder_with_provider(Arc::new(provider))
            .with_safe_default_protocol_versions()
            .map_err(|e| Error::tls(format!("failed to set protocol versions: {}", e)))?
            .with_root_certificates(root_store)
            .with_no_client_auth();

        let server_name = ServerName::try_from(server_name.to_string())
            .map_err(|_| Error::tls(format!("invalid server name: {}", server_name)))?;

        Ok(Self {
            connector: TlsConnector::from(Arc::new(config)),
            server_name,
        })
    }

    /// Perform the client handshake over an established TCP connection.
    pub async fn connect(&self, socket: TcpStream) -> Result<client::TlsStream<TcpStream>> {
        self.connector
            .connect(self.server_name.clone(), socket)
            .await
            .map_err(|e| Error::tls(format!("handshake failed: {}", e)))
    }
}

/// Server-side TLS: presents the configured certificate chain.
pub struct ServerTls {
    acceptor: TlsAcceptor,
}

impl ServerTls {
    /// Build an acceptor from PEM certificate chain and private key files.
    pub fn new(cert_file: &str, key_file: &str) -> Result<Self> {
        let certs = load_certificates(cert_file)?;
        if certs.is_empty() {
            return Err(Error::tls(format!("no certificates in {}", cert_file)));
        }
        let key = load_private_key(key_file)?;

        let provider = rustls::crypto::ring::default_provider();
        let config = ServerConfig::builder_with_provider(Arc::new(provider))
            .with_safe_default_protocol_versions()
            .map_err(|e| Error::tls(format!("failed to set protocol versions: {}", e)))?
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| Error::tls(format!("invalid certificate/key: {}", e)))?;

        Ok(Self {
            acceptor: TlsAcceptor::from(Arc::new(config)),
        })
    }

    /// Perform the server handshake over an accepted TCP connection.
    pub async fn accept(&self, socket: TcpStream) -> Result<server::TlsStream<TcpStream>> {
        self.acceptor
            .accept(socket)
            .await
            .map_err(|e| Error::tls(format!("handshake failed: {}", e)))
    }
}

fn load_certificates(path: impl AsRef<Path>) -> Result<Vec<CertificateDer<'static>>> {
    let path = path.as_ref();
    let file = File::open(path)
        .map_err(|e| Error::tls(format!("failed to open {}: {}", path.display(), e)))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::tls(format!("failed to parse {}: {}", path.display(), e)))
}

fn load_private_key(path: impl AsRef<Path>) -> Result<PrivateKeyDer<'static>> {
    let path = path.as_ref();
    let file = File::open(path)
        .map_err(|e| Error::tls(format!("failed to open {}: {}", path.display(), e)))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| Error::tls(format!("failed to parse {}: {}", path.display(), e)))?
        .ok_or_else(|| Error::tls(format!("no private key in {}", path.display())))
}
