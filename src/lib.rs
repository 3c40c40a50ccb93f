//! A self-hosted mail relay gateway.
//!
//! `mailgate` bridges two front doors into one delivery pipeline:
//!
//! - an HTTP JSON API for outbound send requests,
//! - an SMTP listener for inbound mail, which is classified per recipient
//!   and either silently discarded, auto-replied to, or forwarded.
//!
//! Both paths feed the same bounded [`queue::OutboundQueue`], drained by a
//! worker pool that signs ([`signer::Signer`]), resolves destination
//! servers ([`resolver::MxResolver`]) and hands envelopes off over SMTP
//! ([`delivery::DeliveryExecutor`]). The [`engine::Engine`] owns the
//! lifecycle of all of it.

pub mod client;
pub mod config;
pub mod delivery;
pub mod engine;
pub mod ingress;
pub mod listener;
pub mod logging;
pub mod message;
pub mod queue;
pub mod resolver;
pub mod session;
pub mod signer;
pub mod suppress;
pub mod tls;

pub use config::Config;
pub use engine::{Engine, EngineOptions, LifecycleState, RunningEngine};
pub use message::{Attachment, Mailbox, Message};
pub use queue::{Decision, Middleware, OutboundQueue};

/// Control signal broadcast to every long-running task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Shutdown,
}
