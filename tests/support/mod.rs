//! Shared helpers for integration tests.
#![allow(dead_code)]

pub mod mock_server;

use std::sync::Arc;

use async_trait::async_trait;
use mailgate::resolver::{MailHost, ResolveError, ResolveMx};

/// A resolver that answers every lookup with a fixed candidate list,
/// pointing deliveries at a mock sink instead of real DNS.
pub struct StaticResolver {
    hosts: Vec<MailHost>,
}

impl StaticResolver {
    /// All lookups resolve to a single candidate at `addr`.
    #[must_use]
    pub fn to_addr(addr: std::net::SocketAddr) -> Arc<Self> {
        let mut host = MailHost::new(addr.ip().to_string(), 10);
        host.port = addr.port();
        Arc::new(Self { hosts: vec![host] })
    }

    #[must_use]
    pub fn with_hosts(hosts: Vec<MailHost>) -> Arc<Self> {
        Arc::new(Self { hosts })
    }
}

#[async_trait]
impl ResolveMx for StaticResolver {
    async fn resolve(&self, _recipient: &str) -> Result<Vec<MailHost>, ResolveError> {
        Ok(self.hosts.clone())
    }
}
