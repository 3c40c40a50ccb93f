//! The message model moved through the pipeline.
//!
//! A [`Message`] is created either by the ingress API (deserialised
//! straight from the submission body) or synthesised by an inbound session
//! (auto-replies and forwards). It is consumed exactly once by an outbound
//! worker and never mutated after enqueue, except by middleware ahead of
//! signing.

use mail_builder::MessageBuilder;
use serde::Deserialize;
use thiserror::Error;

/// A display name plus address pair.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Mailbox {
    #[serde(default)]
    pub name: String,
    pub address: String,
}

impl Mailbox {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
        }
    }
}

/// A file carried inside a message. Owned exclusively by its [`Message`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Attachment {
    pub content_type: String,
    pub filename: String,
    pub data: Vec<u8>,
    /// Inline parts are embedded in the rendered body (referenced by
    /// content id); attached parts are offered for download.
    #[serde(default)]
    pub inline: bool,
}

/// One email on its way out of the relay.
#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub from: Mailbox,
    pub to: Vec<Mailbox>,
    pub subject: String,
    pub content: String,
    /// Body is HTML markup rather than plain text.
    #[serde(default)]
    pub is_markup: bool,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("message has no recipients")]
    NoRecipients,

    #[error("sender address is empty")]
    EmptySender,

    #[error("subject is empty")]
    EmptySubject,

    #[error("unable to encode envelope: {0}")]
    Encode(#[from] std::io::Error),
}

impl Message {
    /// Check the structural invariants: at least one recipient, and a
    /// non-empty sender address and subject.
    ///
    /// # Errors
    ///
    /// Returns the first violated invariant.
    pub fn validate(&self) -> Result<(), MessageError> {
        if self.to.is_empty() {
            return Err(MessageError::NoRecipients);
        }
        if self.from.address.is_empty() {
            return Err(MessageError::EmptySender);
        }
        if self.subject.is_empty() {
            return Err(MessageError::EmptySubject);
        }
        Ok(())
    }

    /// Rough size of the message payload, used for ingress limits.
    pub fn payload_size(&self) -> usize {
        self.content.len() + self.attachments.iter().map(|a| a.data.len()).sum::<usize>()
    }

    /// Build the MIME envelope for a single recipient.
    ///
    /// Multi-recipient messages are fanned out into one envelope per
    /// addressee before delivery, so the builder only ever sees one `To`.
    ///
    /// # Errors
    ///
    /// Returns [`MessageError::Encode`] if the envelope cannot be written.
    pub fn envelope_for(&self, recipient: &Mailbox) -> Result<Vec<u8>, MessageError> {
        let mut builder = MessageBuilder::new()
            .from((self.from.name.as_str(), self.from.address.as_str()))
            .to((recipient.name.as_str(), recipient.address.as_str()))
            .subject(self.subject.as_str());

        builder = if self.is_markup {
            builder.html_body(self.content.as_str())
        } else {
            builder.text_body(self.content.as_str())
        };

        for attachment in &self.attachments {
            builder = if attachment.inline {
                // The filename doubles as the content id the body refers to.
                builder.binary_inline(
                    attachment.content_type.as_str(),
                    attachment.filename.as_str(),
                    attachment.data.as_slice(),
                )
            } else {
                builder.binary_attachment(
                    attachment.content_type.as_str(),
                    attachment.filename.as_str(),
                    attachment.data.as_slice(),
                )
            };
        }

        Ok(builder.write_to_vec()?)
    }
}
