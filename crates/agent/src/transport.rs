use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

/// How long the transport waits before showing the typing indicator, and how
/// long the indicator stays up before the message is delivered.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DeliveryTiming {
    pub delay: Duration,
    pub typing: Duration,
}

impl DeliveryTiming {
    pub fn immediate() -> Self {
        Self { delay: Duration::ZERO, typing: Duration::ZERO }
    }

    pub fn total(&self) -> Duration {
        self.delay + self.typing
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SendReceipt {
    pub message_id: String,
    pub delivered_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("message delivery failed: {0}")]
    Delivery(String),
    #[error("recipient `{0}` rejected by transport")]
    Rejected(String),
}

#[async_trait]
pub trait MessageTransport: Send + Sync {
    async fn send(
        &self,
        recipient: &str,
        text: &str,
        timing: DeliveryTiming,
    ) -> Result<SendReceipt, TransportError>;
}

/// Honours the timing with real sleeps and logs instead of delivering.
#[derive(Clone, Debug, Default)]
pub struct LoggingTransport;

#[async_trait]
impl MessageTransport for LoggingTransport {
    async fn send(
        &self,
        recipient: &str,
        text: &str,
        timing: DeliveryTiming,
    ) -> Result<SendReceipt, TransportError> {
        if recipient.trim().is_empty() {
            return Err(TransportError::Rejected(recipient.to_string()));
        }

        tokio::time::sleep(timing.delay).await;
        info!(
            event_name = "transport.typing_started",
            recipient,
            typing_ms = timing.typing.as_millis() as u64,
            "typing indicator shown"
        );
        tokio::time::sleep(timing.typing).await;

        let receipt = SendReceipt { message_id: Uuid::new_v4().to_string(), delivered_at: Utc::now() };
        info!(
            event_name = "transport.message_delivered",
            recipient,
            message_id = %receipt.message_id,
            chars = text.chars().count(),
            "message delivered"
        );
        Ok(receipt)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{DeliveryTiming, LoggingTransport, MessageTransport, TransportError};

    #[tokio::test(start_paused = true)]
    async fn logging_transport_waits_for_delay_and_typing() {
        let transport = LoggingTransport;
        let timing =
            DeliveryTiming { delay: Duration::from_secs(4), typing: Duration::from_secs(2) };

        let started = tokio::time::Instant::now();
        let receipt = transport.send("+15550100", "hello there", timing).await.expect("send");

        assert!(started.elapsed() >= timing.total());
        assert_eq!(receipt.message_id.len(), 36);
    }

    #[tokio::test]
    async fn empty_recipient_is_rejected() {
        let error = LoggingTransport
            .send(" ", "hello", DeliveryTiming::immediate())
            .await
            .expect_err("empty recipient");
        assert!(matches!(error, TransportError::Rejected(_)));
    }
}
