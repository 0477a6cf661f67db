//! Direct SMTP transport, speaking the protocol over a plain
//! `tokio::net::TcpStream` rather than pulling in a dedicated mail
//! crate — the donor stack has no SMTP client dependency, and the
//! protocol exchange itself is a handful of line-oriented commands.

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};

use super::{synthesize_message_id, DeliveryError, Envelope, SendResult, Transport};

#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub helo_domain: String,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 25,
            helo_domain: "localhost".to_string(),
        }
    }
}

pub struct SmtpTransport {
    config: SmtpConfig,
}

impl SmtpTransport {
    pub fn new(config: SmtpConfig) -> Self {
        Self { config }
    }

    async fn deliver(&self, envelope: &Envelope) -> Result<String, DeliveryError> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let connect = timeout(Duration::from_secs(30), TcpStream::connect(&addr))
            .await
            .map_err(|_| DeliveryError::NetworkError("connect timed out".into()))?
            .map_err(|e| DeliveryError::NetworkError(e.to_string()))?;

        let (read_half, mut write_half) = connect.into_split();
        let mut reader = BufReader::new(read_half);

        read_reply(&mut reader).await?;
        command(&mut write_half, &mut reader, &format!("EHLO {}", self.config.helo_domain)).await?;
        command(&mut write_half, &mut reader, &format!("MAIL FROM:<{}>", envelope.from)).await?;
        command(&mut write_half, &mut reader, &format!("RCPT TO:<{}>", envelope.to)).await?;
        command(&mut write_half, &mut reader, "DATA").await?;

        let message = render_message(envelope);
        write_half
            .write_all(message.as_bytes())
            .await
            .map_err(|e| DeliveryError::NetworkError(e.to_string()))?;
        write_half
            .write_all(b"\r\n.\r\n")
            .await
            .map_err(|e| DeliveryError::NetworkError(e.to_string()))?;
        let reply = read_reply(&mut reader).await?;

        let _ = command(&mut write_half, &mut reader, "QUIT").await;

        Ok(extract_message_id(&reply).unwrap_or_else(|| synthesize_message_id("smtp")))
    }
}

fn render_message(envelope: &Envelope) -> String {
    let mut lines = vec![
        format!("From: {}", envelope.from),
        format!("To: {}", envelope.to),
        format!("Subject: {}", envelope.subject),
        "MIME-Version: 1.0".to_string(),
        "Content-Type: text/html; charset=UTF-8".to_string(),
    ];
    if let Some(reply_to) = &envelope.reply_to {
        lines.push(format!("Reply-To: {reply_to}"));
    }
    for (name, value) in &envelope.headers {
        lines.push(format!("{name}: {value}"));
    }
    lines.push(String::new());
    lines.push(envelope.html.clone());
    lines.join("\r\n")
}

fn extract_message_id(reply: &str) -> Option<String> {
    reply
        .split_whitespace()
        .find(|token| token.contains('@'))
        .map(str::to_string)
}

async fn command<W: tokio::io::AsyncWrite + Unpin, R: tokio::io::AsyncBufRead + Unpin>(
    writer: &mut W,
    reader: &mut R,
    line: &str,
) -> Result<String, DeliveryError> {
    writer
        .write_all(format!("{line}\r\n").as_bytes())
        .await
        .map_err(|e| DeliveryError::NetworkError(e.to_string()))?;
    read_reply(reader).await
}

async fn read_reply<R: tokio::io::AsyncBufRead + Unpin>(
    reader: &mut R,
) -> Result<String, DeliveryError> {
    let mut line = String::new();
    reader
        .read_line(&mut line)
        .await
        .map_err(|e| DeliveryError::NetworkError(e.to_string()))?;
    if line.is_empty() {
        return Err(DeliveryError::NetworkError("connection closed".into()));
    }
    classify_smtp_reply(&line)?;
    Ok(line)
}

fn classify_smtp_reply(line: &str) -> Result<(), DeliveryError> {
    let code: u16 = line
        .get(0..3)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    match code {
        200..=399 => Ok(()),
        421 | 450 | 451 | 452 => Err(DeliveryError::TemporaryDefer(line.trim().to_string())),
        530 | 535 => Err(DeliveryError::AuthFailed(line.trim().to_string())),
        500..=599 => Err(DeliveryError::PermanentReject(line.trim().to_string())),
        _ => Err(DeliveryError::TemporaryDefer(line.trim().to_string())),
    }
}

#[async_trait]
impl Transport for SmtpTransport {
    fn name(&self) -> &'static str {
        "smtp"
    }

    async fn send(&self, envelope: Envelope) -> SendResult {
        match self.deliver(&envelope).await {
            Ok(provider_message_id) => SendResult::Accepted { provider_message_id },
            Err(err) => SendResult::Rejected(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_smtp_reply_codes() {
        assert!(classify_smtp_reply("250 OK\r\n").is_ok());
        assert!(matches!(
            classify_smtp_reply("450 mailbox busy\r\n"),
            Err(DeliveryError::TemporaryDefer(_))
        ));
        assert!(matches!(
            classify_smtp_reply("550 no such user\r\n"),
            Err(DeliveryError::PermanentReject(_))
        ));
        assert!(matches!(
            classify_smtp_reply("535 auth failed\r\n"),
            Err(DeliveryError::AuthFailed(_))
        ));
    }
}
