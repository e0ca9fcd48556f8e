//! Outbound delivery: direct mail over SMTP and a broadcast chat webhook.
//!
//! Each channel is optional. An unconfigured channel reports
//! [`Delivery::Disabled`] instead of failing.
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use reqwest::Client;
use serde_json::json;
use std::fmt;
use std::time::Duration;
use tracing::debug;

use crate::config::Config;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    Disabled,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_direct(&self, to: &str, subject: &str, body: &str) -> Result<Delivery>;

    async fn send_broadcast(&self, message: &str) -> Result<Delivery>;
}

pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: String,
}

impl fmt::Debug for SmtpMailer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmtpMailer")
            .field("from", &self.from)
            .finish_non_exhaustive()
    }
}

impl SmtpMailer {
    /// `None` when any of host, port, user or password is missing.
    pub fn from_config(cfg: &Config) -> Result<Option<Self>> {
        let smtp = &cfg.smtp;
        if !smtp.is_enabled() {
            return Ok(None);
        }
        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(smtp.host.trim())
            .with_context(|| format!("invalid SMTP host {}", smtp.host))?
            .port(smtp.port)
            .credentials(Credentials::new(smtp.user.trim().to_string(), smtp.pass.clone()))
            .timeout(Some(Duration::from_secs(cfg.app.http_timeout_seconds)))
            .build();
        Ok(Some(Self {
            transport,
            from: smtp.sender().to_string(),
        }))
    }

    pub fn build_message(&self, to: &str, subject: &str, body: &str) -> Result<Message> {
        Message::builder()
            .from(
                self.from
                    .parse::<Mailbox>()
                    .with_context(|| format!("invalid sender {}", self.from))?,
            )
            .to(to
                .parse::<Mailbox>()
                .with_context(|| format!("invalid recipient {}", to))?)
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(body.to_string())
            .context("failed to build email")
    }

    pub async fn send(&self, to: &str, subject: &str, body: &str) -> Result<()> {
        let message = self.build_message(to, subject, body)?;
        self.transport
            .send(message)
            .await
            .with_context(|| format!("SMTP delivery to {} failed", to))?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct Webhook {
    http: Client,
    url: String,
}

impl fmt::Debug for Webhook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Webhook").finish_non_exhaustive()
    }
}

impl Webhook {
    pub fn new(url: String, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .user_agent("notion-overdue/0.1")
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { http, url })
    }

    pub async fn post(&self, message: &str) -> Result<()> {
        let res = self
            .http
            .post(&self.url)
            .json(&json!({ "text": message }))
            .send()
            .await
            .context("failed to reach webhook")?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow!("webhook error {}: {}", status, body));
        }
        Ok(())
    }
}

/// Both delivery channels, each present only when configured.
#[derive(Debug, Default)]
pub struct Channels {
    mailer: Option<SmtpMailer>,
    webhook: Option<Webhook>,
}

impl Channels {
    pub fn new(mailer: Option<SmtpMailer>, webhook: Option<Webhook>) -> Self {
        Self { mailer, webhook }
    }

    pub fn from_config(cfg: &Config) -> Result<Self> {
        let mailer = SmtpMailer::from_config(cfg)?;
        let url = cfg.slack.webhook_url.trim();
        let webhook = if url.is_empty() {
            None
        } else {
            Some(Webhook::new(
                url.to_string(),
                Duration::from_secs(cfg.app.http_timeout_seconds),
            )?)
        };
        Ok(Self::new(mailer, webhook))
    }

    pub fn mail_enabled(&self) -> bool {
        self.mailer.is_some()
    }

    pub fn broadcast_enabled(&self) -> bool {
        self.webhook.is_some()
    }
}

#[async_trait]
impl Notifier for Channels {
    async fn send_direct(&self, to: &str, subject: &str, body: &str) -> Result<Delivery> {
        let Some(mailer) = &self.mailer else {
            debug!(to, "mail disabled; skipping");
            return Ok(Delivery::Disabled);
        };
        mailer.send(to, subject, body).await?;
        Ok(Delivery::Sent)
    }

    async fn send_broadcast(&self, message: &str) -> Result<Delivery> {
        let Some(webhook) = &self.webhook else {
            debug!("broadcast disabled; skipping");
            return Ok(Delivery::Disabled);
        };
        webhook.post(message).await?;
        Ok(Delivery::Sent)
    }
}
