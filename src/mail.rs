//! Email delivery of the finished book (e.g. to a Kindle inbox).
//!
//! Settings come from `SMTP_SERVER` (`host` or `host:port`, default port
//! 587), `SMTP_USER` and `SMTP_PASSWD`. The connection is upgraded with
//! STARTTLS before authenticating.

use crate::error::P2kError;
use crate::pocket::require_env;
use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use std::fmt;
use std::path::Path;
use tracing::info;

pub const SMTP_SERVER_ENV: &str = "SMTP_SERVER";
pub const SMTP_USER_ENV: &str = "SMTP_USER";
pub const SMTP_PASSWORD_ENV: &str = "SMTP_PASSWD";

const DEFAULT_SMTP_PORT: u16 = 587;
const SENDER_NAME: &str = "p2k bot";

/// Sends a file as an attachment.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, attachment: &Path, to: &str) -> Result<(), P2kError>;
}

/// SMTP connection settings.
#[derive(Clone)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
}

impl fmt::Debug for SmtpSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmtpSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl SmtpSettings {
    /// Parse `server` as `host` or `host:port`.
    pub fn new(
        server: &str,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Self, P2kError> {
        let (host, port) = match server.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|_| {
                    P2kError::InvalidConfig(format!("Invalid SMTP port in '{server}'"))
                })?;
                (host, port)
            }
            None => (server, DEFAULT_SMTP_PORT),
        };
        if host.is_empty() {
            return Err(P2kError::InvalidConfig(format!(
                "Invalid SMTP server '{server}'"
            )));
        }
        Ok(Self {
            host: host.to_string(),
            port,
            user: user.into(),
            password: password.into(),
        })
    }

    pub fn from_env() -> Result<Self, P2kError> {
        let server = require_env(SMTP_SERVER_ENV)?;
        let user = require_env(SMTP_USER_ENV)?;
        let password = require_env(SMTP_PASSWORD_ENV)?;
        Self::new(&server, user, password)
    }
}

/// `lettre`-backed SMTP mailer.
#[derive(Debug, Clone)]
pub struct SmtpMailer {
    settings: SmtpSettings,
}

impl SmtpMailer {
    pub fn new(settings: SmtpSettings) -> Self {
        Self { settings }
    }

    fn build_message(&self, attachment: &Path, to: &str, body: Vec<u8>) -> Result<Message, P2kError> {
        let failed = |reason: String| P2kError::MailFailed {
            path: attachment.to_path_buf(),
            reason,
        };
        let from: Mailbox = format!("{SENDER_NAME} <{}>", self.settings.user)
            .parse()
            .map_err(|e| failed(format!("sender '{}': {e}", self.settings.user)))?;
        let to: Mailbox = to
            .parse()
            .map_err(|e| failed(format!("recipient '{to}': {e}")))?;

        let filename = attachment
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "book".to_string());
        let content_type = ContentType::parse(attachment_type(attachment))
            .map_err(|e| failed(e.to_string()))?;

        Message::builder()
            .from(from)
            .to(to)
            .subject(filename.clone())
            .multipart(
                MultiPart::mixed()
                    .singlepart(SinglePart::plain(String::from("Your reading list.")))
                    .singlepart(Attachment::new(filename).body(body, content_type)),
            )
            .map_err(|e| failed(e.to_string()))
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, attachment: &Path, to: &str) -> Result<(), P2kError> {
        let failed = |reason: String| P2kError::MailFailed {
            path: attachment.to_path_buf(),
            reason,
        };
        let body = tokio::fs::read(attachment)
            .await
            .map_err(|e| failed(e.to_string()))?;
        let message = self.build_message(attachment, to, body)?;

        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&self.settings.host)
            .map_err(|e| failed(e.to_string()))?
            .port(self.settings.port)
            .credentials(Credentials::new(
                self.settings.user.clone(),
                self.settings.password.clone(),
            ))
            .build();

        info!(
            "Sending {} to {} via {}:{}",
            attachment.display(),
            to,
            self.settings.host,
            self.settings.port
        );
        transport
            .send(message)
            .await
            .map_err(|e| failed(e.to_string()))?;
        Ok(())
    }
}

/// MIME type for the attached book, by extension.
pub fn attachment_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "mobi" => "application/x-mobipocket-ebook",
        "epub" => "application/epub+zip",
        "azw3" => "application/vnd.amazon.ebook",
        "pdf" => "application/pdf",
        _ => "application/octet-stream",
    }
}
