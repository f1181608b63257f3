use crate::Body;
use anyhow::{anyhow, Context, Result};
use hyper::body::Incoming;
use hyper_util::{
    rt::TokioIo,
    server::graceful::GracefulShutdown,
    service::TowerToHyperService,
};
use rustls::{
    pki_types::{CertificateDer, PrivateKeyDer},
    server::WebPkiClientVerifier,
    RootCertStore, ServerConfig,
};
use std::{convert::Infallible, fs, io, path::PathBuf, sync::Arc};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

/// Certificate material for a TLS listener.
#[derive(Clone, Debug)]
pub struct TlsConfig {
    pub cert: PathBuf,
    pub key: PathBuf,
    /// When set, clients must present a certificate signed by this CA.
    pub client_ca: Option<PathBuf>,
}

// === impl TlsConfig ===

impl TlsConfig {
    pub fn load(&self) -> Result<Arc<ServerConfig>> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let builder = ServerConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()?;

        let builder = match &self.client_ca {
            Some(ca) => {
                let mut roots = RootCertStore::empty();
                for cert in load_certs(ca)? {
                    roots.add(cert)?;
                }
                let verifier =
                    WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider)
                        .build()?;
                builder.with_client_cert_verifier(verifier)
            }
            None => builder.with_no_client_auth(),
        };

        let mut config = builder
            .with_single_cert(load_certs(&self.cert)?, load_key(&self.key)?)
            .context("invalid server certificate")?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Ok(Arc::new(config))
    }
}

fn load_certs(path: &PathBuf) -> Result<Vec<CertificateDer<'static>>> {
    let pem = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let certs = rustls_pemfile::certs(&mut io::Cursor::new(pem))
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("invalid certificate in {}", path.display()))?;
    if certs.is_empty() {
        return Err(anyhow!("no certificates found in {}", path.display()));
    }
    Ok(certs)
}

fn load_key(path: &PathBuf) -> Result<PrivateKeyDer<'static>> {
    let pem = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    rustls_pemfile::private_key(&mut io::Cursor::new(pem))
        .with_context(|| format!("invalid private key in {}", path.display()))?
        .ok_or_else(|| anyhow!("no private key found in {}", path.display()))
}

/// Serves HTTP/1.1 on `listener` until `drain` is signaled, then waits for
/// in-flight connections to complete.
pub async fn serve<S>(
    name: &'static str,
    listener: TcpListener,
    tls: Option<Arc<ServerConfig>>,
    svc: S,
    drain: kubert::shutdown::Watch,
) -> Result<()>
where
    S: tower::Service<
            http::Request<Incoming>,
            Response = http::Response<Body>,
            Error = Infallible,
        > + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
{
    let addr = listener.local_addr()?;
    info!(%addr, tls = tls.is_some(), "{name} server listening");

    let acceptor = tls.map(TlsAcceptor::from);
    let graceful = GracefulShutdown::new();
    let signaled = drain.signaled();
    tokio::pin!(signaled);

    loop {
        tokio::select! {
            res = listener.accept() => {
                let (tcp, peer) = match res {
                    Ok(conn) => conn,
                    Err(error) => {
                        warn!(%error, "Failed to accept connection");
                        continue;
                    }
                };
                let svc = TowerToHyperService::new(svc.clone());
                let watcher = graceful.watcher();
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    let res = match acceptor {
                        None => {
                            let conn = hyper::server::conn::http1::Builder::new()
                                .serve_connection(TokioIo::new(tcp), svc);
                            watcher.watch(conn).await
                        }
                        Some(acceptor) => {
                            let tls = match acceptor.accept(tcp).await {
                                Ok(tls) => tls,
                                Err(error) => {
                                    debug!(%peer, %error, "TLS handshake failed");
                                    return;
                                }
                            };
                            let conn = hyper::server::conn::http1::Builder::new()
                                .serve_connection(TokioIo::new(tls), svc);
                            watcher.watch(conn).await
                        }
                    };
                    if let Err(error) = res {
                        debug!(%peer, %error, "Connection closed with error");
                    }
                });
            }

            handle = &mut signaled => {
                info!("{name} server shutting down");
                handle.release_after(graceful.shutdown()).await;
                return Ok(());
            }
        }
    }
}
