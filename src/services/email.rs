// SMTP adapter for send_email actions.

use std::time::Duration;

use async_trait::async_trait;
use lettre::{
    message::Mailbox,
    transport::smtp::{authentication::Credentials, PoolConfig},
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use tracing::{info, warn};

use crate::config::SmtpConfig;
use crate::error::{EngineError, EngineResult};
use crate::ports::EmailSender;

pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpMailer {
    pub fn new(config: &SmtpConfig) -> EngineResult<Self> {
        let creds = Credentials::new(config.username.clone(), config.password.clone());

        let transport = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host)
            .port(config.port)
            .credentials(creds)
            .pool_config(PoolConfig::new().max_size(10))
            .timeout(Some(Duration::from_secs(10)))
            .build();

        let from = format!("{} <{}>", config.from_name, config.from_email)
            .parse::<Mailbox>()
            .map_err(|e| EngineError::Email(format!("invalid from address: {e}")))?;

        Ok(Self { transport, from })
    }
}

#[async_trait]
impl EmailSender for SmtpMailer {
    async fn send(&self, to: &str, subject: &str, body: &str) -> EngineResult<()> {
        let to = to
            .parse::<Mailbox>()
            .map_err(|e| EngineError::Email(format!("invalid recipient {to}: {e}")))?;

        let message = Message::builder()
            .from(self.from.clone())
            .to(to.clone())
            .subject(subject)
            .body(body.to_string())
            .map_err(|e| EngineError::Email(e.to_string()))?;

        self.transport
            .send(message)
            .await
            .map_err(|e| EngineError::Email(e.to_string()))?;

        info!(to = %to, "email sent");
        Ok(())
    }
}

/// Fallback mailer used when SMTP is not configured. Logs the send and
/// succeeds, so automations with email steps still advance in development.
#[derive(Debug, Default)]
pub struct LogOnlyMailer;

#[async_trait]
impl EmailSender for LogOnlyMailer {
    async fn send(&self, to: &str, subject: &str, _body: &str) -> EngineResult<()> {
        warn!(to, subject, "SMTP not configured, dropping email");
        Ok(())
    }
}
