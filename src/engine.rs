//! Engine assembly and lifecycle.
//!
//! [`Engine::start`] wires the whole gateway together from a [`Config`]:
//! signer, resolver, queue, workers, suppression store, and both
//! listeners. The returned [`RunningEngine`] owns every spawned task and
//! drains them all exactly once on [`RunningEngine::shutdown`], no matter
//! how many callers race to trigger it.

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::Context as _;
use futures_util::future::join_all;
use parking_lot::Mutex;
use tokio::{
    net::TcpListener,
    sync::{broadcast, watch},
    task::JoinHandle,
};

use crate::{
    config::Config,
    delivery::DeliveryExecutor,
    ingress::{self, IngressState},
    listener::SmtpListener,
    queue::{default_error_handler, spawn_workers, ErrorHandler, Middleware, OutboundQueue},
    resolver::{MxResolver, ResolveMx},
    session::SessionContext,
    signer::Signer,
    suppress::Suppressor,
    tls, Signal,
};

/// How often expired suppression entries are collected.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Where a started engine is in its lifecycle. An [`Engine`] that has not
/// been started yet has no state to report; it is just configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Running,
    Stopping,
    Stopped,
}

/// Construction-time wiring of an [`Engine`].
///
/// Every slot has a production default; overrides exist for embedding and
/// testing.
pub struct EngineOptions {
    config: Config,
    middleware: Vec<Arc<dyn Middleware>>,
    error_handler: Option<ErrorHandler>,
    resolver: Option<Arc<dyn ResolveMx>>,
}

impl EngineOptions {
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            config,
            middleware: Vec::new(),
            error_handler: None,
            resolver: None,
        }
    }

    /// Append an inspection stage run by workers before delivery.
    #[must_use]
    pub fn with_middleware(mut self, stage: Arc<dyn Middleware>) -> Self {
        self.middleware.push(stage);
        self
    }

    /// Replace the default failure logger.
    #[must_use]
    pub fn with_error_handler(mut self, handler: ErrorHandler) -> Self {
        self.error_handler = Some(handler);
        self
    }

    /// Replace the system DNS resolver.
    #[must_use]
    pub fn with_resolver(mut self, resolver: Arc<dyn ResolveMx>) -> Self {
        self.resolver = Some(resolver);
        self
    }
}

/// An assembled but not yet started gateway.
pub struct Engine {
    options: EngineOptions,
}

impl Engine {
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self::with_options(EngineOptions::new(config))
    }

    #[must_use]
    pub const fn with_options(options: EngineOptions) -> Self {
        Self { options }
    }

    /// Bring every component up and hand back the running gateway.
    ///
    /// # Errors
    ///
    /// Fails fast on anything that would leave the gateway partially
    /// functional: an unreadable or invalid signing key, broken TLS
    /// material, or either listener socket refusing to bind.
    pub async fn start(self) -> anyhow::Result<RunningEngine> {
        let EngineOptions {
            config,
            middleware,
            error_handler,
            resolver,
        } = self.options;
        let config = Arc::new(config);

        tracing::info!(domain = %config.domain, "engine starting");

        let signer = if config.dkim.enabled {
            let pem = std::fs::read_to_string(&config.dkim.key_file).with_context(|| {
                format!("unable to read signing key {}", config.dkim.key_file.display())
            })?;
            Signer::from_pem(&pem, &config.domain, &config.dkim.selector)
                .context("unable to load signing key")?
        } else {
            Signer::disabled()
        };

        let resolver = match resolver {
            Some(resolver) => resolver,
            None => Arc::new(
                MxResolver::new(config.timeouts.attempt())
                    .context("unable to build DNS resolver")?,
            ),
        };

        let executor = Arc::new(DeliveryExecutor::new(
            signer,
            resolver,
            config.domain.clone(),
            config.timeouts.overall(),
            config.timeouts.attempt(),
        ));

        let queue = Arc::new(OutboundQueue::new(config.queue_capacity));
        let suppressor = Arc::new(Suppressor::new(config.auto_reply_cooldown()));

        let verifier = if config.verify_dkim {
            let resolver = mail_auth::Resolver::new_system_conf()
                .map_err(|err| anyhow::anyhow!("unable to build verification resolver: {err}"))?;
            Some(Arc::new(resolver))
        } else {
            None
        };

        let acceptor = config
            .tls
            .as_ref()
            .map(tls::acceptor)
            .transpose()
            .context("unable to load TLS material")?;

        let session_ctx = Arc::new(SessionContext {
            config: Arc::clone(&config),
            queue: Arc::clone(&queue),
            suppressor: Arc::clone(&suppressor),
            verifier,
        });

        let smtp_listener = SmtpListener::bind(config.smtp_listen, session_ctx, acceptor)
            .await
            .with_context(|| format!("unable to bind smtp listener {}", config.smtp_listen))?;
        let smtp_addr = smtp_listener.local_addr()?;

        let http_listener = TcpListener::bind(config.http_listen)
            .await
            .with_context(|| format!("unable to bind ingress api {}", config.http_listen))?;
        let http_addr = http_listener.local_addr()?;
        tracing::info!(%http_addr, "ingress api bound");

        let (signal, _) = broadcast::channel(16);

        let smtp = tokio::spawn(smtp_listener.serve(signal.subscribe()));

        let ingress_state = IngressState {
            config: Arc::clone(&config),
            queue: Arc::clone(&queue),
        };
        let http_shutdown = signal.subscribe();
        let http = tokio::spawn(async move {
            if let Err(error) = ingress::serve(http_listener, ingress_state, http_shutdown).await {
                tracing::error!(%error, "ingress api failed");
            }
        });

        let workers = spawn_workers(
            config.worker_count(),
            &queue,
            executor,
            middleware.into(),
            error_handler.unwrap_or_else(default_error_handler),
        );

        let sweep = {
            let suppressor = Arc::clone(&suppressor);
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(SWEEP_INTERVAL);
                loop {
                    interval.tick().await;
                    suppressor.sweep();
                }
            })
        };

        let (done_tx, done_rx) = watch::channel(false);

        tracing::info!(%smtp_addr, %http_addr, workers = config.worker_count(), "engine running");

        Ok(RunningEngine {
            config,
            queue,
            suppressor,
            signal,
            state: Mutex::new(LifecycleState::Running),
            draining: AtomicBool::new(false),
            done_tx,
            done_rx,
            tasks: Mutex::new(Some(Tasks {
                http,
                smtp,
                workers,
                sweep,
            })),
            smtp_addr,
            http_addr,
        })
    }
}

struct Tasks {
    http: JoinHandle<()>,
    smtp: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
    sweep: JoinHandle<()>,
}

/// A started gateway and the handles to stop it.
pub struct RunningEngine {
    config: Arc<Config>,
    queue: Arc<OutboundQueue>,
    suppressor: Arc<Suppressor>,
    signal: broadcast::Sender<Signal>,
    state: Mutex<LifecycleState>,
    draining: AtomicBool,
    done_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
    tasks: Mutex<Option<Tasks>>,
    smtp_addr: SocketAddr,
    http_addr: SocketAddr,
}

impl RunningEngine {
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        *self.state.lock()
    }

    #[must_use]
    pub const fn smtp_addr(&self) -> SocketAddr {
        self.smtp_addr
    }

    #[must_use]
    pub const fn http_addr(&self) -> SocketAddr {
        self.http_addr
    }

    #[must_use]
    pub fn queue(&self) -> &Arc<OutboundQueue> {
        &self.queue
    }

    #[must_use]
    pub fn suppressor(&self) -> &Arc<Suppressor> {
        &self.suppressor
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Drain and stop the whole gateway.
    ///
    /// Safe to call from any number of tasks concurrently; the drain runs
    /// once and every caller returns when it completes. Order: both
    /// listeners stop and finish their in-flight work, then the queue
    /// closes and workers deliver whatever is still buffered.
    pub async fn shutdown(&self) {
        if self.draining.swap(true, Ordering::SeqCst) {
            let mut done = self.done_rx.clone();
            while !*done.borrow() {
                if done.changed().await.is_err() {
                    break;
                }
            }
            return;
        }

        tracing::info!("engine shutting down");
        *self.state.lock() = LifecycleState::Stopping;
        let _ = self.signal.send(Signal::Shutdown);

        let drained = self.tasks.lock().take();
        if let Some(tasks) = drained {
            let Tasks {
                http,
                smtp,
                workers,
                sweep,
            } = tasks;

            let (http, smtp) = tokio::join!(http, smtp);
            if let Err(error) = http {
                tracing::warn!(%error, "ingress task panicked");
            }
            if let Err(error) = smtp {
                tracing::warn!(%error, "smtp task panicked");
            }

            // Intake is off only after the sessions that might still
            // enqueue have finished.
            self.queue.close();
            join_all(workers).await;
            sweep.abort();
        }

        *self.state.lock() = LifecycleState::Stopped;
        let _ = self.done_tx.send(true);
        tracing::info!("engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback_config() -> Config {
        Config {
            domain: "example.org".to_string(),
            smtp_listen: "127.0.0.1:0".parse().unwrap(),
            http_listen: "127.0.0.1:0".parse().unwrap(),
            verify_dkim: false,
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn starts_and_stops() {
        let engine = Engine::new(loopback_config());
        let running = engine.start().await.unwrap();

        assert_eq!(running.state(), LifecycleState::Running);
        assert_ne!(running.smtp_addr().port(), 0);
        assert_ne!(running.http_addr().port(), 0);

        running.shutdown().await;
        assert_eq!(running.state(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn concurrent_shutdowns_both_complete() {
        let engine = Engine::new(loopback_config());
        let running = Arc::new(engine.start().await.unwrap());

        let first = {
            let running = Arc::clone(&running);
            tokio::spawn(async move { running.shutdown().await })
        };
        let second = {
            let running = Arc::clone(&running);
            tokio::spawn(async move { running.shutdown().await })
        };

        first.await.unwrap();
        second.await.unwrap();
        assert_eq!(running.state(), LifecycleState::Stopped);

        // A later call returns immediately.
        running.shutdown().await;
        assert_eq!(running.state(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn missing_signing_key_is_fatal() {
        let mut config = loopback_config();
        config.dkim.enabled = true;
        config.dkim.key_file = "/nonexistent/dkim.pem".into();

        let result = Engine::new(config).start().await;
        assert!(result.is_err());
    }
}
