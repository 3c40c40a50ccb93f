//! The outbound delivery pipeline.
//!
//! A [`DeliveryExecutor`] takes one queued [`Message`] and carries it to
//! completion: validate, then for each recipient independently build the
//! envelope, sign it, resolve candidate servers, and attempt handoff in
//! preference order until the attempt budget is exhausted. A failing
//! recipient never blocks the others; all failures are reported together.

use std::{sync::Arc, time::Duration};

use thiserror::Error;

use crate::{
    client::SmtpClient,
    message::{Mailbox, Message, MessageError},
    resolver::{MailHost, ResolveError, ResolveMx},
    signer::{Signer, SignerError},
};

/// Failure of one recipient's delivery unit.
#[derive(Debug, Error)]
pub enum RecipientError {
    #[error(transparent)]
    Envelope(#[from] MessageError),

    #[error(transparent)]
    Sign(#[from] SignerError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    /// Every attempt in the budget failed; the string carries the
    /// per-attempt outcomes.
    #[error("all delivery attempts failed: {0}")]
    Exhausted(String),
}

/// The collected per-recipient failures of one message.
#[derive(Debug)]
pub struct RecipientFailures(pub Vec<(String, RecipientError)>);

impl std::fmt::Display for RecipientFailures {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (index, (recipient, error)) in self.0.iter().enumerate() {
            if index > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{recipient}: {error}")?;
        }
        Ok(())
    }
}

impl std::error::Error for RecipientFailures {}

#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The message failed validation before any recipient was tried.
    #[error("invalid message: {0}")]
    Invalid(#[from] MessageError),

    /// One or more recipients could not be delivered to.
    #[error("delivery failed: {0}")]
    Failed(#[from] RecipientFailures),
}

/// Number of handoff attempts that fit in the overall budget.
const fn attempt_budget(overall: Duration, attempt: Duration) -> u64 {
    let per = attempt.as_secs();
    let budget = overall.as_secs() / if per == 0 { 1 } else { per };
    if budget == 0 { 1 } else { budget }
}

/// Drives outbound messages from the queue to destination servers.
pub struct DeliveryExecutor {
    signer: Signer,
    resolver: Arc<dyn ResolveMx>,
    helo_domain: String,
    overall_timeout: Duration,
    attempt_timeout: Duration,
}

impl DeliveryExecutor {
    #[must_use]
    pub fn new(
        signer: Signer,
        resolver: Arc<dyn ResolveMx>,
        helo_domain: impl Into<String>,
        overall_timeout: Duration,
        attempt_timeout: Duration,
    ) -> Self {
        Self {
            signer,
            resolver,
            helo_domain: helo_domain.into(),
            overall_timeout,
            attempt_timeout,
        }
    }

    /// Deliver a message to all of its recipients.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::Invalid`] if the message fails validation,
    /// or [`DeliveryError::Failed`] carrying every recipient that could
    /// not be reached. Recipients that succeeded stay delivered either way.
    pub async fn deliver(&self, message: &Message) -> Result<(), DeliveryError> {
        message.validate()?;

        let mut failures = Vec::new();
        for recipient in &message.to {
            match self.deliver_to(message, recipient).await {
                Ok(()) => {
                    tracing::info!(
                        recipient = %recipient.address,
                        subject = %message.subject,
                        "message delivered"
                    );
                }
                Err(error) => {
                    tracing::warn!(
                        recipient = %recipient.address,
                        %error,
                        "recipient delivery failed"
                    );
                    failures.push((recipient.address.clone(), error));
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(RecipientFailures(failures).into())
        }
    }

    /// One recipient's delivery unit: envelope, signature, resolution,
    /// then ordered attempts across the candidate servers.
    async fn deliver_to(
        &self,
        message: &Message,
        recipient: &Mailbox,
    ) -> Result<(), RecipientError> {
        let envelope = message.envelope_for(recipient)?;
        let payload = self.signer.sign(&envelope)?;
        let candidates = self.resolver.resolve(&recipient.address).await?;
        if candidates.is_empty() {
            return Err(ResolveError::NoRecords(recipient.address.clone()).into());
        }

        let budget = attempt_budget(self.overall_timeout, self.attempt_timeout);
        let mut outcomes = Vec::new();

        for attempt in 0..budget {
            // Candidates are retried in preference order, wrapping around
            // when the budget outlasts the list.
            let host = &candidates[usize::try_from(attempt).unwrap_or(usize::MAX)
                % candidates.len()];

            match self.attempt(host, message, recipient, &payload).await {
                Ok(()) => return Ok(()),
                Err(error) => {
                    outcomes.push(format!(
                        "attempt {}/{budget} to {} failed: {error}",
                        attempt + 1,
                        host.address()
                    ));
                }
            }
        }

        Err(RecipientError::Exhausted(outcomes.join("; ")))
    }

    async fn attempt(
        &self,
        host: &MailHost,
        message: &Message,
        recipient: &Mailbox,
        payload: &[u8],
    ) -> Result<(), crate::client::ClientError> {
        let handoff = async {
            let mut client = SmtpClient::connect(&host.address()).await?;
            client
                .send_envelope(
                    &message.from.address,
                    &recipient.address,
                    payload,
                    &self.helo_domain,
                )
                .await
        };

        match tokio::time::timeout(self.attempt_timeout, handoff).await {
            Ok(result) => result,
            Err(_) => Err(crate::client::ClientError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("attempt timed out after {:?}", self.attempt_timeout),
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn budget_is_the_ratio_of_timeouts() {
        assert_eq!(
            attempt_budget(Duration::from_secs(30), Duration::from_secs(10)),
            3
        );
        assert_eq!(
            attempt_budget(Duration::from_secs(30), Duration::from_secs(7)),
            4
        );
    }

    #[test]
    fn budget_is_at_least_one() {
        assert_eq!(
            attempt_budget(Duration::from_secs(5), Duration::from_secs(10)),
            1
        );
        assert_eq!(
            attempt_budget(Duration::from_secs(0), Duration::from_secs(10)),
            1
        );
        // A zero attempt timeout must not divide by zero.
        assert_eq!(
            attempt_budget(Duration::from_secs(30), Duration::from_secs(0)),
            30
        );
    }

    #[test]
    fn candidate_index_wraps_around() {
        let candidates = ["a", "b", "c"];
        let order: Vec<&str> = (0..5u64)
            .map(|attempt| candidates[usize::try_from(attempt).unwrap() % candidates.len()])
            .collect();
        assert_eq!(order, ["a", "b", "c", "a", "b"]);
    }

    #[test]
    fn failures_render_per_recipient() {
        let failures = RecipientFailures(vec![
            (
                "a@example.net".to_string(),
                RecipientError::Exhausted("attempt 1/1 to mx:25 failed: refused".to_string()),
            ),
            (
                "b@example.net".to_string(),
                RecipientError::Resolve(ResolveError::NoRecords("example.net".to_string())),
            ),
        ]);

        let rendered = failures.to_string();
        assert!(rendered.contains("a@example.net"));
        assert!(rendered.contains("b@example.net"));
        assert!(rendered.contains("; "));

        let error = DeliveryError::from(failures);
        let rendered = error.to_string();
        assert!(rendered.starts_with("delivery failed: "));
        assert!(rendered.contains("a@example.net"));
        assert!(rendered.contains("b@example.net"));
    }
}
