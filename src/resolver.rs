//! Destination-server resolution for recipient addresses.
//!
//! Extracts the domain portion of a recipient address and looks up its
//! mail-exchange records, returning candidates ordered by preference
//! (lowest first, ties kept in resolver order). Candidates are transient;
//! nothing here is cached or persisted.

use std::time::Duration;

use async_trait::async_trait;
use hickory_resolver::{
    config::ResolverOpts, name_server::TokioConnectionProvider, TokioResolver,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ResolveError {
    /// The address has no `@` or an empty domain portion. Checked before
    /// any network lookup.
    #[error("invalid recipient address: {0}")]
    InvalidAddress(String),

    /// The domain does not exist. Permanent.
    #[error("domain does not exist: {0}")]
    DomainNotFound(String),

    /// The domain exists but publishes no mail-exchange records. Permanent.
    #[error("no mail servers found for domain: {0}")]
    NoRecords(String),

    /// The lookup itself failed (resolver timeout, network). Retryable at
    /// the caller's discretion.
    #[error("mx lookup failed for {domain}: {source}")]
    Lookup {
        domain: String,
        source: hickory_resolver::ResolveError,
    },
}

impl ResolveError {
    /// Returns `true` if the failure is transient.
    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        matches!(self, Self::Lookup { .. })
    }
}

/// A candidate delivery server with its preference rank.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailHost {
    pub host: String,
    /// Lower rank is tried first.
    pub preference: u16,
    pub port: u16,
}

impl MailHost {
    #[must_use]
    pub fn new(host: impl Into<String>, preference: u16) -> Self {
        Self {
            host: host.into(),
            preference,
            port: 25,
        }
    }

    /// The `host:port` string to connect to.
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Extract the domain portion of an email address.
///
/// # Errors
///
/// Returns [`ResolveError::InvalidAddress`] when there is no `@` or the
/// domain portion is empty.
pub fn domain_of(address: &str) -> Result<&str, ResolveError> {
    match address.split_once('@') {
        Some((_, domain)) if !domain.is_empty() => Ok(domain),
        _ => Err(ResolveError::InvalidAddress(address.to_string())),
    }
}

/// The resolution seam of the delivery pipeline.
#[async_trait]
pub trait ResolveMx: Send + Sync {
    /// Resolve the ordered candidate servers for a recipient address.
    async fn resolve(&self, recipient: &str) -> Result<Vec<MailHost>, ResolveError>;
}

/// MX resolution backed by the system DNS configuration.
#[derive(Debug)]
pub struct MxResolver {
    resolver: TokioResolver,
}

impl MxResolver {
    /// Build a resolver from the system DNS configuration with the given
    /// per-query timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the system DNS configuration cannot be loaded.
    pub fn new(timeout: Duration) -> Result<Self, hickory_resolver::ResolveError> {
        let mut opts = ResolverOpts::default();
        opts.timeout = timeout;

        let resolver = TokioResolver::builder(TokioConnectionProvider::default())?
            .with_options(opts)
            .build();

        Ok(Self { resolver })
    }
}

#[async_trait]
impl ResolveMx for MxResolver {
    async fn resolve(&self, recipient: &str) -> Result<Vec<MailHost>, ResolveError> {
        let domain = domain_of(recipient)?;

        match self.resolver.mx_lookup(domain).await {
            Ok(lookup) => {
                let mut hosts: Vec<MailHost> = lookup
                    .iter()
                    .map(|mx| {
                        let host = mx.exchange().to_utf8();
                        MailHost::new(host.trim_end_matches('.'), mx.preference())
                    })
                    .collect();

                if hosts.is_empty() {
                    return Err(ResolveError::NoRecords(domain.to_string()));
                }

                // Stable: resolver tie order is preserved within a rank.
                hosts.sort_by_key(|host| host.preference);
                tracing::debug!(domain, candidates = hosts.len(), "resolved mail servers");
                Ok(hosts)
            }
            Err(err) if err.is_nx_domain() => Err(ResolveError::DomainNotFound(domain.to_string())),
            Err(err) if err.is_no_records_found() => {
                Err(ResolveError::NoRecords(domain.to_string()))
            }
            Err(source) => Err(ResolveError::Lookup {
                domain: domain.to_string(),
                source,
            }),
        }
    }
}
