//! TLS termination for the public listener
//!
//! [`TlsListener`] implements [`axum::serve::Listener`], so `axum::serve()`
//! takes it in place of a plain `TcpListener`. A connection that fails the
//! handshake is simply dropped; only socket-level accept errors slow the
//! loop down.

use std::fs::File;
use std::io::{self, BufReader};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;

use crate::config::TlsConfig;
use crate::error::{Error, Result};

const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// TLS-terminating listener for the hub's public port.
pub struct TlsListener {
    tcp: TcpListener,
    acceptor: TlsAcceptor,
}

/// Why one accepted connection produced no stream.
enum AcceptFailure {
    /// The listening socket itself errored; worth backing off.
    Socket(io::Error),
    /// One client failed the handshake; the next may be fine.
    Handshake(io::Error),
}

impl TlsListener {
    /// Load certificate material and bind the address in one step.
    pub async fn bind(addr: SocketAddr, tls_config: &TlsConfig) -> Result<Self> {
        let server_config =
            server_config_from_pem(&tls_config.cert_path, &tls_config.key_path)?;
        let tcp = TcpListener::bind(addr).await?;
        tracing::debug!(
            cert = %tls_config.cert_path.display(),
            key = %tls_config.key_path.display(),
            "TLS material loaded"
        );
        Ok(Self {
            tcp,
            acceptor: TlsAcceptor::from(server_config),
        })
    }

    async fn accept_one(
        &self,
    ) -> std::result::Result<(TlsStream<TcpStream>, SocketAddr), AcceptFailure> {
        let (stream, peer) = self.tcp.accept().await.map_err(AcceptFailure::Socket)?;
        let tls_stream = self
            .acceptor
            .accept(stream)
            .await
            .map_err(AcceptFailure::Handshake)?;
        Ok((tls_stream, peer))
    }
}

impl axum::serve::Listener for TlsListener {
    type Io = TlsStream<TcpStream>;
    type Addr = SocketAddr;

    fn accept(&mut self) -> impl std::future::Future<Output = (Self::Io, Self::Addr)> + Send {
        async {
            loop {
                match self.accept_one().await {
                    Ok(accepted) => return accepted,
                    Err(AcceptFailure::Handshake(e)) => {
                        tracing::debug!(error = %e, "dropped connection that failed the handshake");
                    }
                    Err(AcceptFailure::Socket(e)) => {
                        tracing::error!(error = %e, "listener accept failed, backing off");
                        tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    }
                }
            }
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        self.tcp.local_addr()
    }
}

/// Build a rustls server config from PEM files on disk.
fn server_config_from_pem(cert_path: &Path, key_path: &Path) -> Result<Arc<ServerConfig>> {
    let cert_chain = pem_section(cert_path, |reader| {
        rustls_pemfile::certs(reader).collect::<io::Result<Vec<_>>>()
    })?;
    if cert_chain.is_empty() {
        return Err(Error::Internal(format!(
            "'{}' holds no certificates",
            cert_path.display()
        )));
    }

    let key = pem_section(key_path, |reader| rustls_pemfile::private_key(reader))?
        .ok_or_else(|| {
            Error::Internal(format!("'{}' holds no private key", key_path.display()))
        })?;

    ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)
        .map(Arc::new)
        .map_err(|e| Error::Internal(format!("certificate and key do not form a usable pair: {}", e)))
}

/// Open one PEM file and run a parser over it, with the path woven into
/// every failure.
fn pem_section<T>(
    path: &Path,
    parse: impl FnOnce(&mut BufReader<File>) -> io::Result<T>,
) -> Result<T> {
    let file = File::open(path).map_err(|e| {
        Error::Internal(format!("TLS material at '{}' unreadable: {}", path.display(), e))
    })?;
    parse(&mut BufReader::new(file)).map_err(|e| {
        Error::Internal(format!("TLS material at '{}' unparsable: {}", path.display(), e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn missing_certificate_names_the_file() {
        let err = server_config_from_pem(
            Path::new("/nonexistent/hub.crt"),
            Path::new("/nonexistent/hub.key"),
        )
        .unwrap_err();
        assert!(err.to_string().contains("hub.crt"));
    }

    #[test]
    fn empty_pem_files_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cert_path: PathBuf = dir.path().join("empty.crt");
        let key_path: PathBuf = dir.path().join("empty.key");
        std::fs::write(&cert_path, "").unwrap();
        std::fs::write(&key_path, "").unwrap();

        let err = server_config_from_pem(&cert_path, &key_path).unwrap_err();
        assert!(err.to_string().contains("no certificates"));
    }

    #[test]
    fn key_file_without_a_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("cert.crt");
        let key_path = dir.path().join("cert.key");
        // A certificate block satisfies the PEM parser but contains no key.
        std::fs::write(
            &cert_path,
            "-----BEGIN CERTIFICATE-----\nMIIB\n-----END CERTIFICATE-----\n",
        )
        .unwrap();
        std::fs::write(
            &key_path,
            "-----BEGIN CERTIFICATE-----\nMIIB\n-----END CERTIFICATE-----\n",
        )
        .unwrap();

        let err = server_config_from_pem(&cert_path, &key_path).unwrap_err();
        assert!(err.to_string().contains("private key") || err.to_string().contains("unparsable"));
    }
}
