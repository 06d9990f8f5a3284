//! TLS bootstrap (`SPEC_FULL.md`, `[TLS-BOOTSTRAP]`; spec.md §4.8).
//!
//! The agent-ingress listener always starts plain. After a successful
//! `register`, if both the server and the agent agree on TLS, the server
//! sends a fire-and-forget `upgrade` request and then wraps the same raw
//! socket in a TLS server handshake — no bytes are lost because the
//! request precedes the handshake on the same byte stream and the framer's
//! read buffer is drained by protocol (it must be empty: `upgrade` is the
//! only traffic between `register`'s response and the handshake).

use std::io::BufReader;
use std::sync::Arc;

use overlord_proto::mode::TlsSettings;
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};

use crate::error::{CoreError, CoreResult};

/// Build a server TLS config from PEM-encoded cert chain and private key
/// bytes (spec.md §6: "TLS certificate loading ... consumed contract"; the
/// core only needs the resulting `ServerConfig`, not the file/env format
/// the cert and key came from).
pub fn load_server_config(cert_pem: &[u8], key_pem: &[u8]) -> CoreResult<Arc<ServerConfig>> {
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut BufReader::new(cert_pem))
        .collect::<Result<_, _>>()
        .map_err(|e| CoreError::Fatal(format!("invalid TLS certificate: {e}")))?;
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut BufReader::new(key_pem))
        .map_err(|e| CoreError::Fatal(format!("invalid TLS private key: {e}")))?
        .ok_or_else(|| CoreError::Fatal("no private key found in PEM input".into()))?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| CoreError::Fatal(format!("invalid TLS cert/key pair: {e}")))?;
    Ok(Arc::new(config))
}

/// Whether this ingress connection should upgrade to TLS after
/// registration, given server policy and the agent's declared settings.
pub fn should_upgrade(server_tls: Option<&Arc<ServerConfig>>, agent_tls: &TlsSettings) -> bool {
    server_tls.is_some() && agent_tls.enabled
}

/// Perform the server-side TLS handshake over an already-plain socket.
///
/// Returns the wrapped stream; the caller re-binds a fresh `RpcFramer` to
/// it (spec.md §4.8: "The RPC framer must be re-bound to the wrapped
/// stream").
pub async fn upgrade(stream: TcpStream, config: Arc<ServerConfig>) -> CoreResult<tokio_rustls::server::TlsStream<TcpStream>> {
    let acceptor = TlsAcceptor::from(config);
    acceptor
        .accept(stream)
        .await
        .map_err(|e| CoreError::Protocol(format!("tls handshake failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upgrade_requires_both_sides_to_agree() {
        assert!(!should_upgrade(None, &TlsSettings { enabled: true, verify: false }));
    }
}
