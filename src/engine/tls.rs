use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use rustls::{Certificate, PrivateKey, ServerConfig};
use rustls_pemfile::{certs, pkcs8_private_keys, rsa_private_keys};
use tokio_rustls::TlsAcceptor;

/// Builds the STARTTLS acceptor from PEM files.
pub fn load_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor> {
    let cert_file = std::fs::File::open(cert_path)
        .with_context(|| format!("Failed to open certificate: {:?}", cert_path))?;
    let cert_chain: Vec<Certificate> = certs(&mut BufReader::new(cert_file))
        .map_err(|_| anyhow::anyhow!("Failed to parse certificate: {:?}", cert_path))?
        .into_iter()
        .map(Certificate)
        .collect();

    if cert_chain.is_empty() {
        return Err(anyhow::anyhow!("No certificate found in {:?}", cert_path));
    }

    let private_key = read_private_key(key_path)?;

    let config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(cert_chain, private_key)
        .map_err(|e| anyhow::anyhow!("Failed to build TLS config: {}", e))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn read_private_key(key_path: &Path) -> Result<PrivateKey> {
    let open = || {
        std::fs::File::open(key_path)
            .map(BufReader::new)
            .with_context(|| format!("Failed to open private key: {:?}", key_path))
    };

    let mut keys = pkcs8_private_keys(&mut open()?)
        .map_err(|_| anyhow::anyhow!("Failed to parse private key: {:?}", key_path))?;
    if keys.is_empty() {
        keys = rsa_private_keys(&mut open()?)
            .map_err(|_| anyhow::anyhow!("Failed to parse private key: {:?}", key_path))?;
    }

    if keys.is_empty() {
        return Err(anyhow::anyhow!("No private key found in {:?}", key_path));
    }

    Ok(PrivateKey(keys.remove(0)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_files_are_reported() {
        let err = load_acceptor(Path::new("/nonexistent/cert.pem"), Path::new("/nonexistent/key.pem"))
            .err()
            .unwrap();
        assert!(format!("{:#}", err).contains("Failed to open certificate"));
    }

    #[test]
    fn empty_certificate_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("cert.pem");
        let key = dir.path().join("key.pem");
        std::fs::write(&cert, b"").unwrap();
        std::fs::write(&key, b"").unwrap();

        let err = load_acceptor(&cert, &key).err().unwrap();
        assert!(err.to_string().contains("No certificate found"));
    }

    #[test]
    fn loads_pem_certificate_and_pkcs8_key() {
        let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("testdata");
        assert!(load_acceptor(&dir.join("localhost.pem"), &dir.join("localhost.key")).is_ok());
    }
}
