//! SMTP delivery through a single authenticated relay.

use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::{debug, info};

use super::{Notifier, NotifyError, SUBJECT, body_for};
use crate::config::{MailSettings, TlsMode};

/// Reply codes a relay uses to refuse the login itself.
fn is_auth_rejection(code: &str) -> bool {
    matches!(code, "530" | "534" | "535")
}

fn parse_mailbox(role: &str, address: &str) -> Result<Mailbox, NotifyError> {
    address
        .parse()
        .map_err(|e| NotifyError::Compose(format!("invalid {role} address '{address}': {e}")))
}

/// Build the plain-text notification for `status`.
pub fn compose_message(from: &str, to: &str, status: &str) -> Result<Message, NotifyError> {
    Message::builder()
        .from(parse_mailbox("sender", from)?)
        .to(parse_mailbox("recipient", to)?)
        .subject(SUBJECT)
        .header(ContentType::TEXT_PLAIN)
        .body(body_for(status))
        .map_err(|e| NotifyError::Compose(e.to_string()))
}

pub struct SmtpNotifier {
    settings: MailSettings,
}

impl SmtpNotifier {
    pub fn new(settings: &MailSettings) -> Self {
        Self {
            settings: settings.clone(),
        }
    }

    fn relay_label(&self) -> String {
        format!("{}:{}", self.settings.server, self.settings.port)
    }

    fn transport(&self) -> Result<AsyncSmtpTransport<Tokio1Executor>, NotifyError> {
        let server = self.settings.server.as_str();
        let builder = match self.settings.tls_mode() {
            TlsMode::Implicit => AsyncSmtpTransport::<Tokio1Executor>::relay(server),
            TlsMode::StartTls => AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(server),
        }
        .map_err(|e| NotifyError::TransportFailure {
            relay: self.relay_label(),
            detail: e.to_string(),
        })?;

        Ok(builder
            .port(self.settings.port)
            .credentials(Credentials::new(
                self.settings.from.clone(),
                self.settings.password.expose().to_string(),
            ))
            .build())
    }

    fn classify(&self, err: lettre::transport::smtp::Error) -> NotifyError {
        let code = err.status().map(|code| code.to_string());
        match code {
            Some(code) if is_auth_rejection(&code) => NotifyError::AuthenticationRejected {
                relay: self.relay_label(),
                user: self.settings.from.clone(),
                detail: err.to_string(),
            },
            _ => NotifyError::TransportFailure {
                relay: self.relay_label(),
                detail: err.to_string(),
            },
        }
    }
}

#[async_trait]
impl Notifier for SmtpNotifier {
    async fn notify(&self, status: &str) -> Result<(), NotifyError> {
        let message = compose_message(&self.settings.from, &self.settings.to, status)?;
        let transport = self.transport()?;

        debug!(
            relay = %self.relay_label(),
            tls = self.settings.tls_mode().label(),
            "sending notification"
        );
        transport
            .send(message)
            .await
            .map_err(|e| self.classify(e))?;

        info!(to = %self.settings.to, "notification sent");
        Ok(())
    }
}
