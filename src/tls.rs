//! TLS setup for the daemon listener.
use std::fs;
use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use axum::serve::Listener;
use native_tls::Identity;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time;
use tokio_native_tls::{TlsAcceptor, TlsStream};
use tracing::{info, warn};
use x509_parser::pem::Pem;

/// Basic facts about the certificate the daemon presents.
#[derive(Debug, Clone)]
pub struct CertInfo {
    pub subject: String,
    pub not_after: String,
    pub currently_valid: bool,
}

/// Find the first certificate in a PEM buffer and read its subject and validity.
///
/// The buffer may also hold other blocks, e.g. a private key when cert and key
/// share one file.
pub fn inspect_certificate(pem_data: &[u8]) -> Result<CertInfo> {
    for pem in Pem::iter_from_buffer(pem_data) {
        let pem = pem.map_err(|e| anyhow!("malformed PEM data: {e}"))?;
        if pem.label != "CERTIFICATE" {
            continue;
        }
        let cert = pem
            .parse_x509()
            .map_err(|e| anyhow!("invalid X.509 certificate: {e}"))?;
        let validity = cert.validity();
        return Ok(CertInfo {
            subject: cert.subject().to_string(),
            not_after: validity.not_after.to_string(),
            currently_valid: validity.is_valid(),
        });
    }
    bail!("no certificate found in PEM data")
}

/// Load the certificate and PKCS#8 private key and build a TLS acceptor.
pub fn load_acceptor(cert_file: &Path, key_file: &Path) -> Result<TlsAcceptor> {
    let cert = fs::read(cert_file)
        .with_context(|| format!("failed to read certificate file: {}", cert_file.display()))?;
    let key = fs::read(key_file)
        .with_context(|| format!("failed to read private key file: {}", key_file.display()))?;

    let info = inspect_certificate(&cert)
        .with_context(|| format!("{}: unusable certificate", cert_file.display()))?;
    if info.currently_valid {
        info!(subject = %info.subject, not_after = %info.not_after, "loaded certificate");
    } else {
        warn!(subject = %info.subject, not_after = %info.not_after, "certificate is outside its validity period");
    }

    let identity = Identity::from_pkcs8(&cert, &key).context("failed to load TLS identity")?;
    let acceptor = native_tls::TlsAcceptor::new(identity).context("failed to build TLS acceptor")?;
    Ok(TlsAcceptor::from(acceptor))
}

/// How long a client gets to finish the TLS handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);
const PENDING_CONNECTIONS: usize = 64;

type Accepted = (TlsStream<TcpStream>, SocketAddr);

/// TLS listener for axum.
///
/// A background task accepts TCP connections and runs each handshake in its own
/// task, so a client that stalls mid-handshake only holds up itself.
pub struct TlsListener {
    incoming: mpsc::Receiver<Accepted>,
    local_addr: SocketAddr,
}

impl TlsListener {
    pub async fn bind(addr: SocketAddr, acceptor: TlsAcceptor) -> Result<Self> {
        Self::bind_with_handshake_timeout(addr, acceptor, HANDSHAKE_TIMEOUT).await
    }

    pub async fn bind_with_handshake_timeout(
        addr: SocketAddr,
        acceptor: TlsAcceptor,
        handshake_timeout: Duration,
    ) -> Result<Self> {
        let inner = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        let local_addr = inner.local_addr()?;
        let (tx, incoming) = mpsc::channel(PENDING_CONNECTIONS);
        tokio::spawn(accept_loop(inner, acceptor, handshake_timeout, tx));
        Ok(Self {
            incoming,
            local_addr,
        })
    }
}

/// Runs until the listener is dropped.
async fn accept_loop(
    inner: TcpListener,
    acceptor: TlsAcceptor,
    handshake_timeout: Duration,
    tx: mpsc::Sender<Accepted>,
) {
    loop {
        let (stream, peer) = tokio::select! {
            _ = tx.closed() => return,
            conn = inner.accept() => match conn {
                Ok(conn) => conn,
                Err(e) => {
                    // Usually fd exhaustion; give the process a moment to recover.
                    warn!("accept failed: {e}");
                    time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            },
        };

        let acceptor = acceptor.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            match time::timeout(handshake_timeout, acceptor.accept(stream)).await {
                Ok(Ok(tls)) => {
                    let _ = tx.send((tls, peer)).await;
                }
                Ok(Err(e)) => warn!(%peer, "TLS handshake failed: {e}"),
                Err(_) => warn!(%peer, "TLS handshake timed out, dropping connection"),
            }
        });
    }
}

impl Listener for TlsListener {
    type Io = TlsStream<TcpStream>;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        match self.incoming.recv().await {
            Some(conn) => conn,
            // The accept loop only stops once this listener is gone.
            None => std::future::pending().await,
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        Ok(self.local_addr)
    }
}
