//! DKIM signing of outbound envelopes.
//!
//! Wraps a configured RSA key, domain, and selector; prepends a
//! `DKIM-Signature` header over the canonicalised message. Deterministic
//! for identical inputs and key. When signing is disabled the stage is a
//! passthrough.

use mail_auth::{
    common::{
        crypto::{RsaKey, Sha256},
        headers::HeaderWriter,
    },
    dkim::{DkimSigner, Done},
};
use thiserror::Error;

/// Headers bound by the signature.
const SIGNED_HEADERS: [&str; 5] = ["From", "To", "Subject", "Date", "Message-ID"];

#[derive(Debug, Error)]
pub enum SignerError {
    /// The private key could not be parsed. Startup-fatal.
    #[error("invalid signing key: {0}")]
    Key(String),

    /// The envelope could not be canonicalised or signed. Aborts the
    /// single delivery attempt; the message is never sent unsigned.
    #[error("unable to sign envelope: {0}")]
    Sign(String),
}

/// The signing stage of the delivery pipeline.
pub enum Signer {
    Disabled,
    Enabled(Box<DkimSigner<RsaKey<Sha256>, Done>>),
}

impl Signer {
    /// A passthrough signer for relays without a published DKIM key.
    pub const fn disabled() -> Self {
        Self::Disabled
    }

    /// Build a signer from a PKCS#1 RSA private key PEM.
    ///
    /// # Errors
    ///
    /// Returns [`SignerError::Key`] when the key is structurally invalid.
    pub fn from_pem(pem: &str, domain: &str, selector: &str) -> Result<Self, SignerError> {
        let key = RsaKey::<Sha256>::from_rsa_pem(pem)
            .map_err(|err| SignerError::Key(err.to_string()))?;

        let signer = DkimSigner::from_key(key)
            .domain(domain.to_string())
            .selector(selector.to_string())
            .headers(SIGNED_HEADERS);

        Ok(Self::Enabled(Box::new(signer)))
    }

    pub const fn is_enabled(&self) -> bool {
        matches!(self, Self::Enabled(_))
    }

    /// Sign an encoded envelope, returning the envelope with the
    /// `DKIM-Signature` header prepended.
    ///
    /// # Errors
    ///
    /// Returns [`SignerError::Sign`] when the envelope cannot be signed.
    pub fn sign(&self, envelope: &[u8]) -> Result<Vec<u8>, SignerError> {
        match self {
            Self::Disabled => Ok(envelope.to_vec()),
            Self::Enabled(signer) => {
                let signature = signer
                    .sign(envelope)
                    .map_err(|err| SignerError::Sign(err.to_string()))?;

                let mut signed = Vec::with_capacity(envelope.len() + 512);
                signature.write_header(&mut signed);
                signed.extend_from_slice(envelope);
                Ok(signed)
            }
        }
    }
}
