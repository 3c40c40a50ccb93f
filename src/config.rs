//! Gateway configuration.
//!
//! All settings are read once at startup (TOML via serde) and shared as an
//! immutable [`Config`] for the lifetime of the process. There is no hot
//! reload.

use std::{net::SocketAddr, path::PathBuf, time::Duration};

use serde::Deserialize;

/// Top-level configuration for the relay gateway.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// The domain this relay advertises and signs for.
    #[serde(default = "default_domain")]
    pub domain: String,

    /// Socket the inbound SMTP listener binds to.
    #[serde(default = "default_smtp_listen")]
    pub smtp_listen: SocketAddr,

    /// Socket the HTTP ingress API binds to.
    #[serde(default = "default_http_listen")]
    pub http_listen: SocketAddr,

    /// Shared secret expected in the `Authorization` header of ingress
    /// submissions. An empty passphrase rejects every submission.
    #[serde(default)]
    pub passphrase: String,

    /// Capacity of the outbound queue. Enqueue fails once this is reached.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Lower bound on the worker pool size; the pool defaults to one
    /// worker per available CPU, but never fewer than this.
    #[serde(default = "default_worker_floor")]
    pub worker_floor: usize,

    #[serde(default)]
    pub timeouts: Timeouts,

    /// Maximum recipients accepted per inbound transaction.
    #[serde(default = "default_max_recipients")]
    pub max_recipients: usize,

    /// Maximum inbound message size in bytes.
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,

    #[serde(default)]
    pub inboxes: Inboxes,

    /// Destination address for mail arriving at the forward inbox.
    /// When unset, forwarding is disabled and such mail is rejected.
    #[serde(default)]
    pub forward_to: Option<String>,

    /// Whether mail to the no-reply inbox triggers an automated response.
    #[serde(default = "default_auto_reply")]
    pub auto_reply: bool,

    /// Cooldown before the same sender can trigger another auto-reply.
    #[serde(default = "default_cooldown_secs")]
    pub auto_reply_cooldown_secs: u64,

    /// Verify DKIM signatures on inbound mail before acting on it.
    #[serde(default = "default_verify_dkim")]
    pub verify_dkim: bool,

    #[serde(default)]
    pub dkim: DkimConfig,

    /// TLS material for the SMTP listener. When set, connections are
    /// wrapped in implicit TLS; when unset, the listener speaks plaintext.
    #[serde(default)]
    pub tls: Option<TlsConfig>,

    /// Bound on the whole shutdown drain; exceeding it is fatal.
    #[serde(default = "default_shutdown_deadline_secs")]
    pub shutdown_deadline_secs: u64,
}

/// Timeouts for the delivery pipeline and inbound sessions.
#[derive(Debug, Clone, Deserialize)]
pub struct Timeouts {
    /// Budget for one delivery unit (one recipient) across all candidate
    /// servers. Together with `attempt_secs` this fixes the attempt count.
    #[serde(default = "default_overall_secs")]
    pub overall_secs: u64,

    /// Budget for a single handoff attempt to one candidate server.
    #[serde(default = "default_attempt_secs")]
    pub attempt_secs: u64,

    /// Inbound session read timeout per command.
    #[serde(default = "default_session_secs")]
    pub session_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            overall_secs: default_overall_secs(),
            attempt_secs: default_attempt_secs(),
            session_secs: default_session_secs(),
        }
    }
}

impl Timeouts {
    pub const fn overall(&self) -> Duration {
        Duration::from_secs(self.overall_secs)
    }

    pub const fn attempt(&self) -> Duration {
        Duration::from_secs(self.attempt_secs)
    }

    pub const fn session(&self) -> Duration {
        Duration::from_secs(self.session_secs)
    }
}

/// Local parts of the three recognised inbound inboxes.
#[derive(Debug, Clone, Deserialize)]
pub struct Inboxes {
    /// Receives aggregate compliance reports; always silently discarded.
    #[serde(default = "default_dmarc_user")]
    pub dmarc: String,

    /// The unmonitored sender inbox; replies may trigger an auto-response.
    #[serde(default = "default_noreply_user")]
    pub noreply: String,

    /// The catch-all inbox whose mail is forwarded out of the relay.
    #[serde(default = "default_forward_user")]
    pub forward: String,
}

impl Default for Inboxes {
    fn default() -> Self {
        Self {
            dmarc: default_dmarc_user(),
            noreply: default_noreply_user(),
            forward: default_forward_user(),
        }
    }
}

/// DKIM signing settings for outbound mail.
#[derive(Debug, Clone, Deserialize)]
pub struct DkimConfig {
    /// Sign outbound envelopes. Unsigned relays tend to land in spam.
    #[serde(default)]
    pub enabled: bool,

    /// Selector label published alongside the public key in DNS.
    #[serde(default = "default_selector")]
    pub selector: String,

    /// Path to the PKCS#1 RSA private key PEM.
    #[serde(default = "default_dkim_key")]
    pub key_file: PathBuf,
}

impl Default for DkimConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            selector: default_selector(),
            key_file: default_dkim_key(),
        }
    }
}

/// Certificate and key files for the SMTP listener.
#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    pub certificate: PathBuf,
    pub key: PathBuf,
}

fn default_domain() -> String {
    "localhost".to_string()
}

fn default_smtp_listen() -> SocketAddr {
    "127.0.0.1:2525".parse().expect("valid default socket")
}

fn default_http_listen() -> SocketAddr {
    "127.0.0.1:8800".parse().expect("valid default socket")
}

const fn default_queue_capacity() -> usize {
    1024
}

const fn default_worker_floor() -> usize {
    8
}

const fn default_max_recipients() -> usize {
    5
}

const fn default_max_message_bytes() -> usize {
    10 << 20
}

const fn default_auto_reply() -> bool {
    true
}

const fn default_cooldown_secs() -> u64 {
    3600
}

const fn default_verify_dkim() -> bool {
    true
}

const fn default_shutdown_deadline_secs() -> u64 {
    60
}

const fn default_overall_secs() -> u64 {
    30
}

const fn default_attempt_secs() -> u64 {
    10
}

const fn default_session_secs() -> u64 {
    30
}

fn default_dmarc_user() -> String {
    "dmarc".to_string()
}

fn default_noreply_user() -> String {
    "noreply".to_string()
}

fn default_forward_user() -> String {
    "support".to_string()
}

fn default_selector() -> String {
    "default".to_string()
}

fn default_dkim_key() -> PathBuf {
    PathBuf::from("dkim.pem")
}

impl Default for Config {
    fn default() -> Self {
        toml::from_str("").expect("empty config deserialises to defaults")
    }
}

impl Config {
    /// Full address of the compliance-reports inbox.
    pub fn dmarc_address(&self) -> String {
        format!("{}@{}", self.inboxes.dmarc, self.domain)
    }

    /// Full address of the no-reply inbox.
    pub fn noreply_address(&self) -> String {
        format!("{}@{}", self.inboxes.noreply, self.domain)
    }

    /// Full address of the forward inbox.
    pub fn forward_address(&self) -> String {
        format!("{}@{}", self.inboxes.forward, self.domain)
    }

    /// Sender address used when forwarding mail out of the relay.
    pub fn catchall_address(&self) -> String {
        format!("catchall@{}", self.domain)
    }

    /// Number of outbound workers to spawn.
    pub fn worker_count(&self) -> usize {
        num_cpus::get().max(self.worker_floor)
    }

    pub const fn auto_reply_cooldown(&self) -> Duration {
        Duration::from_secs(self.auto_reply_cooldown_secs)
    }

    pub const fn shutdown_deadline(&self) -> Duration {
        Duration::from_secs(self.shutdown_deadline_secs)
    }
}
