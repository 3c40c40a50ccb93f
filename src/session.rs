//! Inbound SMTP sessions.
//!
//! One [`Session`] per accepted connection. The state machine accepts mail
//! only for the relay's own recognised inboxes and, once a transaction
//! completes, acts on each recipient: compliance reports are discarded,
//! mail to the no-reply inbox may trigger a rate-limited automated
//! response, and mail to the forward inbox is wrapped and relayed to the
//! configured destination. Everything a session sends onward goes through
//! the same outbound queue as API submissions.

use std::sync::Arc;

use mail_auth::{AuthenticatedMessage, DkimResult, Resolver};
use mailparse::MailHeaderMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{
    config::Config,
    message::{Attachment, Mailbox, Message},
    queue::OutboundQueue,
    suppress::Suppressor,
};

/// Body of the automated response, rendered per domain.
const HELP_TEMPLATE: &str = include_str!("../assets/help.html");

/// Image embedded inline in the automated response.
const ROBOT_PNG: &[u8] = include_bytes!("../assets/robot.png");

/// Shared dependencies handed to every session.
pub struct SessionContext {
    pub config: Arc<Config>,
    pub queue: Arc<OutboundQueue>,
    pub suppressor: Arc<Suppressor>,
    /// DKIM verification resolver. `None` disables inbound verification.
    pub verifier: Option<Arc<Resolver>>,
}

/// The recognised inboxes a recipient can resolve to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InboxClass {
    Dmarc,
    NoReply,
    Forward,
}

impl SessionContext {
    /// Resolve a recipient address against the recognised inboxes.
    ///
    /// Membership is an exact (case-insensitive) match against the full
    /// set; anything else is unknown and refused at RCPT time.
    fn classify(&self, recipient: &str) -> Option<InboxClass> {
        let known = [
            (self.config.dmarc_address(), InboxClass::Dmarc),
            (self.config.noreply_address(), InboxClass::NoReply),
            (self.config.forward_address(), InboxClass::Forward),
        ];

        known
            .into_iter()
            .find(|(address, _)| address.eq_ignore_ascii_case(recipient))
            .map(|(_, class)| class)
    }
}

/// State of the in-flight transaction, reset by RSET and after each DATA.
#[derive(Debug, Default)]
struct Transaction {
    sender: Option<String>,
    recipients: Vec<(String, InboxClass)>,
}

/// One inbound connection being served.
pub struct Session<Stream> {
    stream: Stream,
    ctx: Arc<SessionContext>,
    buffer: Vec<u8>,
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send> Session<Stream> {
    pub fn new(stream: Stream, ctx: Arc<SessionContext>) -> Self {
        Self {
            stream,
            ctx,
            buffer: Vec::with_capacity(512),
        }
    }

    /// Drive the session to completion.
    ///
    /// # Errors
    ///
    /// Returns an error only on i/o failure; protocol violations are
    /// answered in-band and the connection stays usable.
    pub async fn run(mut self) -> std::io::Result<()> {
        let domain = self.ctx.config.domain.clone();
        self.reply(&format!("220 {domain} ESMTP ready")).await?;

        let mut transaction = Transaction::default();

        loop {
            let line = match self.read_line().await {
                Ok(Some(line)) => line,
                // Peer closed the connection.
                Ok(None) => return Ok(()),
                Err(TimedOut) => {
                    self.reply("421 4.4.2 idle timeout, closing").await?;
                    return Ok(());
                }
            };

            let (verb, argument) = split_command(&line);

            match verb.as_str() {
                "EHLO" => {
                    self.reply(&format!("250-{domain} greets you")).await?;
                    self.reply(&format!("250 SIZE {}", self.ctx.config.max_message_bytes))
                        .await?;
                }
                "HELO" => {
                    self.reply(&format!("250 {domain}")).await?;
                }
                "AUTH" => {
                    self.reply("502 5.7.0 authentication not supported").await?;
                }
                "MAIL" => {
                    match mail_path(argument, "FROM") {
                        Some(sender) => {
                            transaction = Transaction {
                                sender: Some(sender),
                                recipients: Vec::new(),
                            };
                            self.reply("250 2.1.0 OK").await?;
                        }
                        None => self.reply("501 5.5.4 malformed MAIL FROM").await?,
                    }
                }
                "RCPT" => {
                    let response = self.accept_recipient(&mut transaction, argument);
                    self.reply(&response).await?;
                }
                "DATA" => {
                    if transaction.recipients.is_empty() {
                        self.reply("503 5.5.1 RCPT TO required before DATA").await?;
                        continue;
                    }

                    self.reply("354 End data with <CR><LF>.<CR><LF>").await?;
                    let data = match self.read_data().await {
                        Ok(Some(data)) => data,
                        Ok(None) => return Ok(()),
                        Err(TimedOut) => {
                            self.reply("421 4.4.2 idle timeout, closing").await?;
                            return Ok(());
                        }
                    };

                    let data = match data {
                        DataOutcome::Complete(data) => data,
                        DataOutcome::TooLarge => {
                            self.reply("552 5.3.4 message exceeds maximum size").await?;
                            return Ok(());
                        }
                    };

                    let finished = std::mem::take(&mut transaction);
                    let response = self.dispatch(finished, data).await;
                    self.reply(&response).await?;
                }
                "RSET" => {
                    transaction = Transaction::default();
                    self.reply("250 2.0.0 OK").await?;
                }
                "NOOP" => {
                    self.reply("250 2.0.0 OK").await?;
                }
                "QUIT" => {
                    self.reply(&format!("221 2.0.0 {domain} closing")).await?;
                    return Ok(());
                }
                _ => {
                    self.reply("500 5.5.2 command not recognised").await?;
                }
            }
        }
    }

    /// RCPT TO handling: enforce the recipient cap and refuse any address
    /// that is not one of the recognised inboxes.
    fn accept_recipient(&self, transaction: &mut Transaction, argument: &str) -> String {
        if transaction.sender.is_none() {
            return "503 5.5.1 MAIL FROM required before RCPT".to_string();
        }

        if transaction.recipients.len() >= self.ctx.config.max_recipients {
            return "452 4.5.3 too many recipients".to_string();
        }

        let Some(recipient) = mail_path(argument, "TO") else {
            return "501 5.5.4 malformed RCPT TO".to_string();
        };

        match self.ctx.classify(&recipient) {
            Some(class) => {
                transaction.recipients.push((recipient, class));
                "250 2.1.5 OK".to_string()
            }
            None => {
                tracing::debug!(recipient, "unknown recipient refused");
                "550 5.1.1 unknown recipient".to_string()
            }
        }
    }

    /// Act on a completed transaction and produce the final reply.
    async fn dispatch(&self, transaction: Transaction, data: Vec<u8>) -> String {
        if let Some(verifier) = &self.ctx.verifier {
            let Some(parsed) = AuthenticatedMessage::parse(&data) else {
                return "451 4.7.1 message could not be parsed".to_string();
            };

            // Unsigned mail passes; a present-but-broken signature does not.
            let outputs = verifier.verify_dkim(&parsed).await;
            let broken = outputs.iter().any(|output| {
                matches!(
                    output.result(),
                    DkimResult::Fail(_) | DkimResult::PermError(_) | DkimResult::TempError(_)
                )
            });
            if broken {
                tracing::warn!("inbound signature verification failed");
                return "451 4.7.1 signature verification failed".to_string();
            }
        }

        let Ok(parsed) = mailparse::parse_mail(&data) else {
            return "451 4.7.1 message could not be parsed".to_string();
        };

        let header_sender = parsed
            .headers
            .get_first_value("From")
            .and_then(|value| first_address(&value));
        let Some(sender) = header_sender.or(transaction.sender) else {
            return "451 4.7.1 sender could not be determined".to_string();
        };

        let subject = parsed
            .headers
            .get_first_value("Subject")
            .unwrap_or_else(|| "(no subject)".to_string());

        for (recipient, class) in transaction.recipients {
            match class {
                InboxClass::Dmarc => {
                    tracing::info!(%sender, "compliance report discarded");
                }
                InboxClass::NoReply => {
                    if !self.ctx.config.auto_reply {
                        return "550 5.1.1 mailbox is unmonitored".to_string();
                    }
                    self.auto_reply(&sender);
                }
                InboxClass::Forward => {
                    let Some(destination) = self.ctx.config.forward_to.clone() else {
                        tracing::debug!(recipient, "forwarding is not configured");
                        return "550 5.1.1 mailbox unavailable".to_string();
                    };
                    self.forward(&sender, &subject, destination, data.clone());
                }
            }
        }

        "250 2.0.0 OK: accepted".to_string()
    }

    /// Queue the automated response unless the sender is in cooldown.
    fn auto_reply(&self, sender: &str) {
        if self.ctx.suppressor.check_and_record(sender) {
            tracing::info!(%sender, "auto-reply suppressed by cooldown");
            return;
        }

        let noreply = self.ctx.config.noreply_address();
        let reply = Message {
            from: Mailbox::new(noreply.clone(), noreply),
            to: vec![Mailbox::new("", sender)],
            subject: "Need Help?".to_string(),
            content: HELP_TEMPLATE.replace("{{DOMAIN}}", &self.ctx.config.domain),
            is_markup: true,
            attachments: vec![Attachment {
                content_type: "image/png".to_string(),
                filename: "robot.png".to_string(),
                data: ROBOT_PNG.to_vec(),
                inline: true,
            }],
        };

        if !self.ctx.queue.enqueue(reply) {
            tracing::warn!(%sender, "outbound queue full, auto-reply dropped");
        }
    }

    /// Queue the forwarded copy with the original attached unmodified.
    fn forward(&self, sender: &str, subject: &str, destination: String, raw: Vec<u8>) {
        let forwarded = Message {
            from: Mailbox::new(sender, self.ctx.config.catchall_address()),
            to: vec![Mailbox::new("", destination)],
            subject: format!("Fwd: {subject}"),
            content: format!("Forwarding an email from: {sender}"),
            is_markup: false,
            attachments: vec![Attachment {
                content_type: "message/rfc822".to_string(),
                filename: "forwarded_email.eml".to_string(),
                data: raw,
                inline: false,
            }],
        };

        if !self.ctx.queue.enqueue(forwarded) {
            tracing::warn!(%sender, "outbound queue full, forward dropped");
        }
    }

    async fn reply(&mut self, line: &str) -> std::io::Result<()> {
        self.stream.write_all(line.as_bytes()).await?;
        self.stream.write_all(b"\r\n").await
    }

    /// Read the message body until the terminating dot, unstuffing leading
    /// dots and enforcing the size cap as lines arrive.
    async fn read_data(&mut self) -> Result<Option<DataOutcome>, TimedOut> {
        let mut data: Vec<u8> = Vec::new();
        let cap = self.ctx.config.max_message_bytes;

        loop {
            let line = match self.read_line().await? {
                Some(line) => line,
                None => return Ok(None),
            };

            if line == "." {
                return Ok(Some(DataOutcome::Complete(data)));
            }

            let line = line.strip_prefix('.').map_or(line.as_str(), |rest| rest);

            if data.len() + line.len() + 2 > cap {
                return Ok(Some(DataOutcome::TooLarge));
            }

            data.extend_from_slice(line.as_bytes());
            data.extend_from_slice(b"\r\n");
        }
    }

    /// Read one CRLF-terminated line with the per-command timeout.
    /// `Ok(None)` once the peer closes.
    async fn read_line(&mut self) -> Result<Option<String>, TimedOut> {
        let timeout = self.ctx.config.timeouts.session();

        loop {
            if let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
                let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
                while line.last() == Some(&b'\n') || line.last() == Some(&b'\r') {
                    line.pop();
                }
                return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
            }

            let mut chunk = [0u8; 1024];
            let read = tokio::time::timeout(timeout, self.stream.read(&mut chunk))
                .await
                .map_err(|_| TimedOut)?;

            match read {
                Ok(0) => return Ok(None),
                Ok(read) => self.buffer.extend_from_slice(&chunk[..read]),
                Err(_) => return Ok(None),
            }
        }
    }
}

/// Marker for a per-command read timeout.
struct TimedOut;

enum DataOutcome {
    Complete(Vec<u8>),
    TooLarge,
}

/// Split a command line into its uppercased verb and remaining argument.
fn split_command(line: &str) -> (String, &str) {
    let trimmed = line.trim();
    match trimmed.split_once(char::is_whitespace) {
        Some((verb, rest)) => (verb.to_ascii_uppercase(), rest.trim()),
        None => (trimmed.to_ascii_uppercase(), ""),
    }
}

/// Extract the address from a `FROM:<addr>` or `TO:<addr>` argument.
fn mail_path(argument: &str, keyword: &str) -> Option<String> {
    let rest = argument
        .get(..keyword.len())
        .filter(|prefix| prefix.eq_ignore_ascii_case(keyword))
        .map(|_| &argument[keyword.len()..])?;
    let rest = rest.trim_start().strip_prefix(':')?.trim();

    let address = rest
        .strip_prefix('<')
        .and_then(|inner| inner.split_once('>'))
        .map_or(rest, |(inner, _)| inner);

    if address.is_empty() {
        // The null reverse-path of bounce messages.
        if keyword.eq_ignore_ascii_case("FROM") {
            return Some(String::new());
        }
        return None;
    }

    Some(address.to_string())
}

/// First address in an address header value.
fn first_address(value: &str) -> Option<String> {
    match mailparse::addrparse(value).ok()?.first()? {
        mailparse::MailAddr::Single(info) => Some(info.addr.clone()),
        mailparse::MailAddr::Group(group) => group.addrs.first().map(|info| info.addr.clone()),
    }
}
