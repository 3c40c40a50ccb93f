//! Minimal SMTP client used for outbound handoff.
//!
//! Speaks just enough of the protocol to push one envelope to one
//! destination server: greeting, EHLO (HELO fallback), MAIL FROM,
//! RCPT TO, DATA with dot stuffing, QUIT. Connections are never reused
//! across envelopes.

use std::string::FromUtf8Error;

use thiserror::Error;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed response: {0}")]
    Parse(String),

    /// The server answered a command with an error code.
    #[error("server replied {code}: {message}")]
    Smtp { code: u16, message: String },

    #[error("connection closed by server")]
    ConnectionClosed,

    #[error("response is not valid utf-8: {0}")]
    Utf8(#[from] FromUtf8Error),
}

/// A complete, possibly multi-line, server response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub code: u16,
    pub lines: Vec<String>,
}

impl Response {
    #[must_use]
    pub fn message(&self) -> String {
        self.lines.join("\n")
    }

    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.code >= 200 && self.code < 300
    }

    /// `true` for 3xx replies, which ask the client to continue (DATA).
    #[must_use]
    pub const fn is_intermediate(&self) -> bool {
        self.code >= 300 && self.code < 400
    }

    #[must_use]
    pub const fn is_permanent_error(&self) -> bool {
        self.code >= 500 && self.code < 600
    }

    /// Parse one response line into its code, continuation flag, and text.
    ///
    /// The code and separator grammar is pure ASCII, so parsing works on
    /// bytes; the line text itself may be arbitrary UTF-8.
    fn parse_line(line: &str) -> Result<(u16, bool, String), ClientError> {
        let bytes = line.as_bytes();
        if bytes.len() < 3 {
            return Err(ClientError::Parse(format!("line too short: {line:?}")));
        }

        let code = bytes[..3]
            .iter()
            .try_fold(0u16, |code, byte| {
                byte.is_ascii_digit()
                    .then(|| code * 10 + u16::from(byte - b'0'))
            })
            .ok_or_else(|| ClientError::Parse(format!("invalid status code in {line:?}")))?;

        // A dash after the code marks a continuation line, a space (or
        // nothing) marks the final line.
        let is_last = match bytes.get(3) {
            Some(b'-') => false,
            Some(b' ') | None => true,
            Some(_) => {
                return Err(ClientError::Parse(format!("invalid separator in {line:?}")));
            }
        };

        // Bytes 0..4 are known ASCII here, so 4 is a char boundary.
        let message = line.get(4..).unwrap_or_default().to_string();
        Ok((code, is_last, message))
    }
}

/// One plaintext connection to a destination server.
pub struct SmtpClient {
    stream: TcpStream,
    buffer: Vec<u8>,
}

impl SmtpClient {
    /// Open a connection to `address` (`host:port`).
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Io`] if the connection cannot be established.
    pub async fn connect(address: &str) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(address).await?;
        Ok(Self {
            stream,
            buffer: Vec::with_capacity(512),
        })
    }

    /// Read one CRLF-terminated line from the server.
    async fn read_line(&mut self) -> Result<String, ClientError> {
        loop {
            if let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
                let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
                while line.last() == Some(&b'\n') || line.last() == Some(&b'\r') {
                    line.pop();
                }
                return Ok(String::from_utf8(line)?);
            }

            let mut chunk = [0u8; 512];
            let read = self.stream.read(&mut chunk).await?;
            if read == 0 {
                return Err(ClientError::ConnectionClosed);
            }
            self.buffer.extend_from_slice(&chunk[..read]);
        }
    }

    /// Read a complete response, following continuation lines.
    ///
    /// # Errors
    ///
    /// Returns an error on i/o failure or a malformed response.
    pub async fn read_response(&mut self) -> Result<Response, ClientError> {
        let mut code = 0;
        let mut lines = Vec::new();

        loop {
            let line = self.read_line().await?;
            let (line_code, is_last, message) = Response::parse_line(&line)?;

            if code == 0 {
                code = line_code;
            } else if line_code != code {
                return Err(ClientError::Parse(format!(
                    "inconsistent codes in multi-line response: {code} then {line_code}"
                )));
            }

            lines.push(message);
            if is_last {
                return Ok(Response { code, lines });
            }
        }
    }

    /// Send one command line and read the server's response.
    ///
    /// # Errors
    ///
    /// Returns an error on i/o failure or a malformed response.
    pub async fn command(&mut self, command: &str) -> Result<Response, ClientError> {
        self.stream.write_all(command.as_bytes()).await?;
        self.stream.write_all(b"\r\n").await?;
        self.read_response().await
    }

    fn reject(response: &Response) -> ClientError {
        ClientError::Smtp {
            code: response.code,
            message: response.message(),
        }
    }

    /// Run the full handoff transaction for one envelope.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Smtp`] on the first command the server
    /// refuses, or an i/o error if the connection breaks.
    pub async fn send_envelope(
        &mut self,
        from: &str,
        to: &str,
        payload: &[u8],
        helo_domain: &str,
    ) -> Result<(), ClientError> {
        let greeting = self.read_response().await?;
        if !greeting.is_success() {
            return Err(Self::reject(&greeting));
        }

        let ehlo = self.command(&format!("EHLO {helo_domain}")).await?;
        if !ehlo.is_success() {
            let helo = self.command(&format!("HELO {helo_domain}")).await?;
            if !helo.is_success() {
                return Err(Self::reject(&helo));
            }
        }

        let mail = self.command(&format!("MAIL FROM:<{from}>")).await?;
        if !mail.is_success() {
            return Err(Self::reject(&mail));
        }

        let rcpt = self.command(&format!("RCPT TO:<{to}>")).await?;
        if !rcpt.is_success() {
            return Err(Self::reject(&rcpt));
        }

        let data = self.command("DATA").await?;
        if !data.is_intermediate() {
            return Err(Self::reject(&data));
        }

        self.write_dot_stuffed(payload).await?;
        self.stream.write_all(b"\r\n.\r\n").await?;

        let accepted = self.read_response().await?;
        if !accepted.is_success() {
            return Err(Self::reject(&accepted));
        }

        // Delivery already succeeded; a failed QUIT is not an error.
        if let Ok(quit) = self.command("QUIT").await {
            tracing::trace!(code = quit.code, "connection closed");
        }

        Ok(())
    }

    /// Write the payload with leading dots doubled per RFC 5321 4.5.2.
    async fn write_dot_stuffed(&mut self, payload: &[u8]) -> Result<(), ClientError> {
        let mut at_line_start = true;
        for line in payload.split_inclusive(|&b| b == b'\n') {
            if at_line_start && line.first() == Some(&b'.') {
                self.stream.write_all(b".").await?;
            }
            self.stream.write_all(line).await?;
            at_line_start = line.last() == Some(&b'\n');
        }
        Ok(())
    }
}
