//! The inbound SMTP accept loop.

use std::{net::SocketAddr, sync::Arc};

use futures_util::future::join_all;
use tokio::{net::TcpListener, sync::broadcast};
use tokio_rustls::TlsAcceptor;

use crate::{
    session::{Session, SessionContext},
    Signal,
};

/// Accepts inbound connections and spawns a [`Session`] per connection.
pub struct SmtpListener {
    listener: TcpListener,
    ctx: Arc<SessionContext>,
    /// When set, every connection is wrapped in implicit TLS before the
    /// session starts.
    acceptor: Option<TlsAcceptor>,
}

impl SmtpListener {
    /// Bind the listener socket.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be bound.
    pub async fn bind(
        socket: SocketAddr,
        ctx: Arc<SessionContext>,
        acceptor: Option<TlsAcceptor>,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(socket).await?;
        tracing::info!(%socket, tls = acceptor.is_some(), "smtp listener bound");
        Ok(Self {
            listener,
            ctx,
            acceptor,
        })
    }

    /// The bound address, useful when binding to port 0.
    ///
    /// # Errors
    ///
    /// Returns an error if the local address cannot be read.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until shutdown, then wait for in-flight sessions to finish.
    pub async fn serve(self, mut shutdown: broadcast::Receiver<Signal>) {
        let mut sessions = Vec::new();

        loop {
            tokio::select! {
                signal = shutdown.recv() => {
                    if matches!(signal, Ok(Signal::Shutdown) | Err(_)) {
                        tracing::info!("smtp listener draining sessions");
                        join_all(sessions).await;
                        return;
                    }
                }

                connection = self.listener.accept() => {
                    let (stream, peer) = match connection {
                        Ok(accepted) => accepted,
                        Err(error) => {
                            tracing::warn!(%error, "accept failed");
                            continue;
                        }
                    };

                    tracing::debug!(%peer, "connection accepted");
                    let ctx = Arc::clone(&self.ctx);
                    let acceptor = self.acceptor.clone();

                    sessions.push(tokio::spawn(async move {
                        let outcome = match acceptor {
                            Some(acceptor) => match acceptor.accept(stream).await {
                                Ok(tls) => Session::new(tls, ctx).run().await,
                                Err(error) => {
                                    tracing::warn!(%peer, %error, "tls handshake failed");
                                    return;
                                }
                            },
                            None => Session::new(stream, ctx).run().await,
                        };

                        if let Err(error) = outcome {
                            tracing::warn!(%peer, %error, "session ended with error");
                        }
                    }));
                }
            }
        }
    }
}
