//! The mail-send collaborator.
//!
//! The queue only relies on a two-outcome contract: a send either succeeds
//! or fails with a [`SendError`]. Real transports (SMTP, provider APIs)
//! implement [`Mailer`]; [`LogMailer`] is the built-in stand-in.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Payload of a mail job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailPayload {
    pub to: String,
    pub template: String,
}

impl EmailPayload {
    pub fn new(to: impl Into<String>, template: impl Into<String>) -> Self {
        Self {
            to: to.into(),
            template: template.into(),
        }
    }

    /// Decode a job payload. Anything that is not a usable email is a `BadPayload`.
    pub fn from_value(value: &serde_json::Value) -> Result<Self, SendError> {
        let payload: Self = serde_json::from_value(value.clone())
            .map_err(|e| SendError::BadPayload(e.to_string()))?;
        if payload.to.trim().is_empty() {
            return Err(SendError::BadPayload("recipient is empty".into()));
        }
        if payload.template.trim().is_empty() {
            return Err(SendError::BadPayload("template is empty".into()));
        }
        Ok(payload)
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::json!({ "to": self.to, "template": self.template })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("bad payload: {0}")]
    BadPayload(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("send timed out after {}ms", .0.as_millis())]
    Timeout(Duration),
}

/// Sends one email. May be invoked more than once for the same job.
#[async_trait]
pub trait Mailer: Send + Sync + 'static {
    async fn send(&self, email: &EmailPayload) -> Result<(), SendError>;
}

/// Mailer that only records the send in the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, email: &EmailPayload) -> Result<(), SendError> {
        tracing::info!(to = %email.to, template = %email.template, "email sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn payload_decodes_from_job_value() {
        let p = EmailPayload::from_value(&json!({"to": "a@x.com", "template": "welcome"})).unwrap();
        assert_eq!(p, EmailPayload::new("a@x.com", "welcome"));
        assert_eq!(EmailPayload::from_value(&p.to_value()).unwrap(), p);
    }

    #[test]
    fn malformed_payloads_are_rejected() {
        for bad in [
            json!({}),
            json!({"to": "a@x.com"}),
            json!({"to": "  ", "template": "welcome"}),
            json!("a@x.com"),
        ] {
            assert!(
                matches!(EmailPayload::from_value(&bad), Err(SendError::BadPayload(_))),
                "{bad}"
            );
        }
    }
}
