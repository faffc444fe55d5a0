use std::io::Cursor;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use rustls_pemfile::{certs, private_key};
use tokio_rustls::TlsAcceptor;

use crate::CommonError;

/// Load certificates from PEM content string
fn load_certs_from_pem(pem_content: &str) -> Result<Vec<CertificateDer<'static>>, CommonError> {
    let mut cursor = Cursor::new(pem_content.as_bytes());
    let loaded = certs(&mut cursor)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| CommonError::Certificate(format!("Failed to parse certificates: {}", e)))?;

    if loaded.is_empty() {
        return Err(CommonError::Certificate(
            "No certificates found in PEM content".to_string(),
        ));
    }
    Ok(loaded)
}

/// Load a private key from PEM content string
fn load_private_key_from_pem(pem_content: &str) -> Result<PrivateKeyDer<'static>, CommonError> {
    let mut cursor = Cursor::new(pem_content.as_bytes());
    private_key(&mut cursor)
        .map_err(|e| CommonError::Certificate(format!("Failed to parse private key: {}", e)))?
        .ok_or_else(|| CommonError::Certificate("No private key found in PEM content".to_string()))
}

/// Build the HTTPS config for the console (no client certificates)
///
/// # Arguments
/// * `cert_pem` - Server certificate chain PEM content
/// * `key_pem` - Server private key PEM content
pub fn load_console_tls_config(cert_pem: &str, key_pem: &str) -> Result<ServerConfig, CommonError> {
    let certs = load_certs_from_pem(cert_pem)?;
    let key = load_private_key_from_pem(key_pem)?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| CommonError::Tls(format!("Unsupported protocol versions: {}", e)))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| CommonError::Tls(format!("Failed to build server config: {}", e)))?;

    // The console only speaks HTTP/1.1
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(config)
}

/// Convenience wrapper returning a ready acceptor
pub fn tls_acceptor_from_pem(cert_pem: &str, key_pem: &str) -> Result<TlsAcceptor, CommonError> {
    let config = load_console_tls_config(cert_pem, key_pem)?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_empty_pem() {
        let result = load_console_tls_config("", "");
        assert!(matches!(result, Err(CommonError::Certificate(_))));
    }

    #[test]
    fn test_rejects_missing_key() {
        let cert = "-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----\n";
        let result = load_private_key_from_pem(cert);
        assert!(result.is_err());
    }
}
