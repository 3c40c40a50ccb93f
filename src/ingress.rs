//! The HTTP submission API.
//!
//! A single authenticated endpoint, `POST /send`, accepting a JSON
//! [`Message`] and placing it on the outbound queue. Submission is
//! fire-and-forget: acceptance means queued, not delivered.

use std::sync::Arc;

use axum::{
    extract::State,
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    routing::post,
    Json, Router,
};
use tokio::{net::TcpListener, sync::broadcast};

use crate::{config::Config, message::Message, queue::OutboundQueue, Signal};

/// Shared state behind the submission handler.
#[derive(Clone)]
pub struct IngressState {
    pub config: Arc<Config>,
    pub queue: Arc<OutboundQueue>,
}

/// Build the ingress router.
pub fn router(state: IngressState) -> Router {
    Router::new()
        .route("/send", post(submit))
        .with_state(state)
}

/// Serve the ingress API until shutdown.
///
/// # Errors
///
/// Returns an error if the server fails while running.
pub async fn serve(
    listener: TcpListener,
    state: IngressState,
    mut shutdown: broadcast::Receiver<Signal>,
) -> std::io::Result<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
            tracing::info!("ingress api shutting down");
        })
        .await
}

async fn submit(
    State(state): State<IngressState>,
    headers: HeaderMap,
    Json(message): Json<Message>,
) -> (StatusCode, &'static str) {
    // An empty passphrase admits nobody; misconfiguration fails closed.
    let authorized = !state.config.passphrase.is_empty()
        && headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value == state.config.passphrase);

    if !authorized {
        return (StatusCode::UNAUTHORIZED, "unauthorized");
    }

    if let Err(error) = message.validate() {
        tracing::debug!(%error, "submission rejected");
        return (StatusCode::BAD_REQUEST, "invalid message");
    }

    if message.to.len() > state.config.max_recipients {
        return (StatusCode::BAD_REQUEST, "too many recipients");
    }

    if message.payload_size() > state.config.max_message_bytes {
        return (StatusCode::PAYLOAD_TOO_LARGE, "message too large");
    }

    if state.queue.enqueue(message) {
        (StatusCode::CREATED, "queued")
    } else {
        tracing::warn!("outbound queue full, submission refused");
        (StatusCode::SERVICE_UNAVAILABLE, "queue full")
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::message::Mailbox;

    fn state(passphrase: &str) -> IngressState {
        let config = Config {
            passphrase: passphrase.to_string(),
            ..Config::default()
        };
        IngressState {
            config: Arc::new(config),
            queue: Arc::new(OutboundQueue::new(2)),
        }
    }

    fn sample() -> Message {
        Message {
            from: Mailbox::new("", "sender@example.org"),
            to: vec![Mailbox::new("", "recipient@example.net")],
            subject: "hello".to_string(),
            content: "body".to_string(),
            is_markup: false,
            attachments: Vec::new(),
        }
    }

    fn with_auth(passphrase: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, passphrase.parse().unwrap());
        headers
    }

    #[tokio::test]
    async fn wrong_passphrase_is_rejected() {
        let state = state("hunter2");
        let (status, _) = submit(
            State(state.clone()),
            with_auth("wrong"),
            Json(sample()),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(state.queue.is_empty());
    }

    #[tokio::test]
    async fn empty_passphrase_admits_nobody() {
        let state = state("");
        let (status, _) = submit(State(state.clone()), with_auth(""), Json(sample())).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(state.queue.is_empty());
    }

    #[tokio::test]
    async fn valid_submission_is_queued() {
        let state = state("hunter2");
        let (status, _) =
            submit(State(state.clone()), with_auth("hunter2"), Json(sample())).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(state.queue.len(), 1);
    }

    #[tokio::test]
    async fn invalid_message_is_a_bad_request() {
        let state = state("hunter2");
        let mut message = sample();
        message.to.clear();

        let (status, _) =
            submit(State(state.clone()), with_auth("hunter2"), Json(message)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(state.queue.is_empty());
    }

    #[tokio::test]
    async fn full_queue_refuses_with_service_unavailable() {
        let state = state("hunter2");
        assert!(state.queue.enqueue(sample()));
        assert!(state.queue.enqueue(sample()));

        let (status, _) =
            submit(State(state.clone()), with_auth("hunter2"), Json(sample())).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(state.queue.len(), 2);
    }

    #[tokio::test]
    async fn oversized_payload_is_refused() {
        let mut config = Config {
            passphrase: "hunter2".to_string(),
            ..Config::default()
        };
        config.max_message_bytes = 2;
        let state = IngressState {
            config: Arc::new(config),
            queue: Arc::new(OutboundQueue::new(2)),
        };

        // The sample body alone exceeds a 2-byte cap.
        let message = sample();
        assert!(message.payload_size() > 2);

        let (status, _) =
            submit(State(state.clone()), with_auth("hunter2"), Json(message)).await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert!(state.queue.is_empty());
    }
}
