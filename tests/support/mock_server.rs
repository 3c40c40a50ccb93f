//! Mock SMTP sink for delivery tests.
//!
//! Accepts connections, answers a plain command set, records everything
//! the client sends, and can be told to refuse specific recipients.
#![allow(dead_code)]

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    sync::RwLock,
};

/// A command as seen by the sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmtpCommand {
    Ehlo(String),
    Helo(String),
    MailFrom(String),
    RcptTo(String),
    Data,
    MessageContent(Vec<u8>),
    Quit,
    Other(String),
}

#[derive(Clone, Default)]
struct SinkConfig {
    /// Recipients answered with the given code and text instead of 250.
    rejected_recipients: HashMap<String, (u16, String)>,
}

pub struct MockSmtpServer {
    addr: SocketAddr,
    commands: Arc<RwLock<Vec<SmtpCommand>>>,
    shutdown: Arc<AtomicBool>,
}

impl MockSmtpServer {
    #[must_use]
    pub fn builder() -> MockSmtpServerBuilder {
        MockSmtpServerBuilder {
            config: SinkConfig::default(),
        }
    }

    pub async fn start() -> std::io::Result<Self> {
        Self::builder().build().await
    }

    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn commands(&self) -> Vec<SmtpCommand> {
        self.commands.read().await.clone()
    }

    /// The raw message bodies received so far.
    pub async fn messages(&self) -> Vec<Vec<u8>> {
        self.commands
            .read()
            .await
            .iter()
            .filter_map(|command| match command {
                SmtpCommand::MessageContent(data) => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    /// Poll until `count` messages have arrived or the deadline passes.
    pub async fn wait_for_messages(&self, count: usize, deadline: Duration) -> Vec<Vec<u8>> {
        let poll = Duration::from_millis(20);
        let mut waited = Duration::ZERO;

        loop {
            let messages = self.messages().await;
            if messages.len() >= count || waited >= deadline {
                return messages;
            }
            tokio::time::sleep(poll).await;
            waited += poll;
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    async fn handle_client(
        mut stream: TcpStream,
        config: SinkConfig,
        commands: Arc<RwLock<Vec<SmtpCommand>>>,
    ) -> std::io::Result<()> {
        let (reader, mut writer) = stream.split();
        let mut reader = BufReader::new(reader);
        let mut line = String::new();

        writer.write_all(b"220 mock sink ready\r\n").await?;

        loop {
            line.clear();
            if reader.read_line(&mut line).await? == 0 {
                return Ok(());
            }

            let trimmed = line.trim();
            let (verb, argument) = match trimmed.split_once(' ') {
                Some((verb, rest)) => (verb.to_uppercase(), rest.trim()),
                None => (trimmed.to_uppercase(), ""),
            };

            let response: String = match verb.as_str() {
                "EHLO" => {
                    commands
                        .write()
                        .await
                        .push(SmtpCommand::Ehlo(argument.to_string()));
                    "250-mock greets you\r\n250 SIZE 10485760\r\n".to_string()
                }
                "HELO" => {
                    commands
                        .write()
                        .await
                        .push(SmtpCommand::Helo(argument.to_string()));
                    "250 mock\r\n".to_string()
                }
                "MAIL" => {
                    commands
                        .write()
                        .await
                        .push(SmtpCommand::MailFrom(argument.to_string()));
                    "250 OK\r\n".to_string()
                }
                "RCPT" => {
                    commands
                        .write()
                        .await
                        .push(SmtpCommand::RcptTo(argument.to_string()));

                    let recipient = argument
                        .trim_start_matches(|c: char| !c.eq(&'<'))
                        .trim_start_matches('<')
                        .trim_end_matches('>')
                        .to_string();

                    match config.rejected_recipients.get(&recipient) {
                        Some((code, message)) => format!("{code} {message}\r\n"),
                        None => "250 OK\r\n".to_string(),
                    }
                }
                "DATA" => {
                    commands.write().await.push(SmtpCommand::Data);
                    writer
                        .write_all(b"354 End data with <CR><LF>.<CR><LF>\r\n")
                        .await?;

                    let mut content = Vec::new();
                    let mut data_line = String::new();
                    loop {
                        data_line.clear();
                        if reader.read_line(&mut data_line).await? == 0 {
                            return Ok(());
                        }
                        if data_line.trim_end_matches(['\r', '\n']) == "." {
                            break;
                        }
                        content.extend_from_slice(data_line.as_bytes());
                    }

                    commands
                        .write()
                        .await
                        .push(SmtpCommand::MessageContent(content));
                    "250 OK: message accepted\r\n".to_string()
                }
                "QUIT" => {
                    commands.write().await.push(SmtpCommand::Quit);
                    writer.write_all(b"221 bye\r\n").await?;
                    return Ok(());
                }
                _ => {
                    commands
                        .write()
                        .await
                        .push(SmtpCommand::Other(trimmed.to_string()));
                    "500 unknown command\r\n".to_string()
                }
            };

            writer.write_all(response.as_bytes()).await?;
        }
    }
}

pub struct MockSmtpServerBuilder {
    config: SinkConfig,
}

impl MockSmtpServerBuilder {
    /// Answer RCPT TO for `recipient` with the given code instead of 250.
    #[must_use]
    pub fn reject_recipient(
        mut self,
        recipient: impl Into<String>,
        code: u16,
        message: impl Into<String>,
    ) -> Self {
        self.config
            .rejected_recipients
            .insert(recipient.into(), (code, message.into()));
        self
    }

    pub async fn build(self) -> std::io::Result<MockSmtpServer> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let commands = Arc::new(RwLock::new(Vec::new()));
        let shutdown = Arc::new(AtomicBool::new(false));

        {
            let commands = Arc::clone(&commands);
            let shutdown = Arc::clone(&shutdown);
            let config = self.config;

            tokio::spawn(async move {
                loop {
                    if shutdown.load(Ordering::Relaxed) {
                        return;
                    }

                    if let Ok((stream, _)) = listener.accept().await {
                        let commands = Arc::clone(&commands);
                        let config = config.clone();
                        tokio::spawn(async move {
                            let _ = MockSmtpServer::handle_client(stream, config, commands).await;
                        });
                    }
                }
            });
        }

        Ok(MockSmtpServer {
            addr,
            commands,
            shutdown,
        })
    }
}
