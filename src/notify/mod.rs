//! Operator notification.
//!
//! A [`Notifier`] delivers one message per reported status change. The
//! error type keeps credential rejection apart from delivery trouble: the
//! first needs the operator to fix the configuration, the second usually
//! clears up by the next cycle.

pub mod smtp;

use async_trait::async_trait;
use thiserror::Error;

pub use smtp::{SmtpNotifier, compose_message};

pub const SUBJECT: &str = "Emirates application status updated";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NotifyError {
    #[error(
        "mail relay {relay} rejected the credentials for {user} ({detail}). \
         Check EMAIL_FROM/EMAIL_PASSWORD; Gmail only accepts a 16-character App Password here"
    )]
    AuthenticationRejected {
        relay: String,
        user: String,
        detail: String,
    },

    #[error("could not deliver mail through {relay}: {detail}")]
    TransportFailure { relay: String, detail: String },

    #[error("could not compose notification: {0}")]
    Compose(String),
}

impl NotifyError {
    /// Whether the next cycle has a fair chance of succeeding unchanged.
    pub fn is_transient(&self) -> bool {
        matches!(self, NotifyError::TransportFailure { .. })
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, status: &str) -> Result<(), NotifyError>;
}

pub fn body_for(status: &str) -> String {
    format!("Your application status changed to: {status}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_rejection_message_is_actionable() {
        let err = NotifyError::AuthenticationRejected {
            relay: "smtp.gmail.com:465".to_string(),
            user: "watcher@example.com".to_string(),
            detail: "535 5.7.8 Username and Password not accepted".to_string(),
        };
        let message = err.to_string();
        assert!(message.contains("rejected the credentials"));
        assert!(message.contains("App Password"));
        assert!(!err.is_transient());
    }

    #[test]
    fn transport_failure_is_transient() {
        let err = NotifyError::TransportFailure {
            relay: "smtp.gmail.com:465".to_string(),
            detail: "connection refused".to_string(),
        };
        assert!(err.is_transient());
    }
}
