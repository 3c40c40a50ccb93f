//! TLS material loading for the inbound listener.

use std::{fs::File, io::BufReader, path::Path, sync::Arc};

use thiserror::Error;
use tokio_rustls::{rustls::ServerConfig, TlsAcceptor};

use crate::config::TlsConfig;

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("unable to read TLS material: {0}")]
    Io(#[from] std::io::Error),

    #[error("no private key found in {0}")]
    NoPrivateKey(String),

    #[error("invalid TLS configuration: {0}")]
    Rustls(#[from] tokio_rustls::rustls::Error),
}

/// Build the acceptor for implicit-TLS inbound connections.
///
/// # Errors
///
/// Returns an error if the certificate chain or private key cannot be
/// read or parsed.
pub fn acceptor(config: &TlsConfig) -> Result<TlsAcceptor, TlsError> {
    let certificates = rustls_pemfile::certs(&mut reader(&config.certificate)?)
        .collect::<Result<Vec<_>, _>>()?;

    let key = rustls_pemfile::private_key(&mut reader(&config.key)?)?
        .ok_or_else(|| TlsError::NoPrivateKey(config.key.display().to_string()))?;

    let server = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certificates, key)?;

    Ok(TlsAcceptor::from(Arc::new(server)))
}

fn reader(path: &Path) -> Result<BufReader<File>, TlsError> {
    Ok(BufReader::new(File::open(path)?))
}
