//! TLS upgrade for `rtsps://` endpoints.
//!
//! The server certificate is verified against the Mozilla root set shipped
//! in `webpki-roots`. The upgrade happens on the freshly connected TCP
//! stream, before any RTSP bytes are exchanged.

use std::sync::{Arc, OnceLock};

use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;

use crate::error::{CastError, Result};

static CLIENT_CONFIG: OnceLock<Arc<rustls::ClientConfig>> = OnceLock::new();

fn client_config() -> Result<Arc<rustls::ClientConfig>> {
    if let Some(config) = CLIENT_CONFIG.get() {
        return Ok(config.clone());
    }

    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| CastError::Tls(e.to_string()))?
        .with_root_certificates(roots)
        .with_no_client_auth();

    Ok(CLIENT_CONFIG.get_or_init(|| Arc::new(config)).clone())
}

/// Run the TLS client handshake over `stream` for `host`.
pub async fn upgrade(stream: TcpStream, host: &str) -> Result<TlsStream<TcpStream>> {
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| CastError::Tls(format!("invalid server name {host}: {e}")))?;
    let connector = TlsConnector::from(client_config()?);

    tracing::debug!(host, "starting TLS handshake");
    connector
        .connect(server_name, stream)
        .await
        .map_err(|e| CastError::Tls(e.to_string()))
}
