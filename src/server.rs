// Listener for the proxy router: plain TCP or rustls TLS termination.

use std::fs::File;
use std::future::Future;
use std::io::BufReader;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use tokio::net::TcpListener;
use tokio_rustls::{rustls, TlsAcceptor};
use tower::ServiceExt;
use tracing::{debug, error, info};

use crate::config::{ServerConfig, TlsConfig};

/// Serve `app` until `shutdown` resolves.
pub async fn serve<F>(app: Router, server: &ServerConfig, tls: &TlsConfig, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = format!("{}:{}", server.host, server.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    if tls.enabled {
        let acceptor = TlsAcceptor::from(load_tls_config(tls)?);
        info!("Proxy listening on https://{}", addr);
        serve_tls(listener, acceptor, app, shutdown).await
    } else {
        info!("Proxy listening on http://{}", addr);
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
            .context("Server error")
    }
}

/// Build a rustls server config from the PEM certificate chain and key.
pub fn load_tls_config(tls: &TlsConfig) -> Result<Arc<rustls::ServerConfig>> {
    let cert_file = File::open(&tls.cert_path)
        .with_context(|| format!("Failed to open certificate: {}", tls.cert_path))?;
    let cert_chain = rustls_pemfile::certs(&mut BufReader::new(cert_file))
        .collect::<std::result::Result<Vec<_>, _>>()
        .with_context(|| format!("Failed to parse certificate: {}", tls.cert_path))?;

    if cert_chain.is_empty() {
        anyhow::bail!("No certificates found in {}", tls.cert_path);
    }

    let key_file = File::open(&tls.key_path)
        .with_context(|| format!("Failed to open private key: {}", tls.key_path))?;
    let private_key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
        .with_context(|| format!("Failed to parse private key: {}", tls.key_path))?
        .ok_or_else(|| anyhow::anyhow!("No private key found in {}", tls.key_path))?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .context("Failed to select TLS protocol versions")?
        .with_no_client_auth()
        .with_single_cert(cert_chain, private_key)
        .with_context(|| format!("Failed to configure certificate {}", tls.cert_path))?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    Ok(Arc::new(config))
}

async fn serve_tls<F>(listener: TcpListener, acceptor: TlsAcceptor, app: Router, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::pin!(shutdown);

    loop {
        let (tcp_stream, peer_addr) = tokio::select! {
            _ = &mut shutdown => {
                info!("TLS listener stopped accepting connections");
                return Ok(());
            }
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Failed to accept HTTPS connection: {}", e);
                    continue;
                }
            },
        };

        let acceptor = acceptor.clone();
        let app = app.clone();

        tokio::spawn(async move {
            let tls_stream = match acceptor.accept(tcp_stream).await {
                Ok(stream) => stream,
                Err(e) => {
                    debug!("TLS handshake failed for {}: {}", peer_addr, e);
                    return;
                }
            };

            let service = hyper::service::service_fn(move |req: hyper::Request<Incoming>| {
                app.clone().oneshot(req)
            });

            if let Err(e) = auto::Builder::new(TokioExecutor::new())
                .serve_connection(TokioIo::new(tls_stream), service)
                .await
            {
                debug!("HTTPS connection from {} ended with error: {}", peer_addr, e);
            }
        });
    }
}
