use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info};

use super::broker::BrokerLink;
use crate::contracts::Message;
use crate::metrics::Metrics;

const PAYLOAD_PREVIEW_CHARS: usize = 100;

/// Publishes one message at a time and waits for the broker's confirm.
pub struct MessagePublisher {
    publish_timeout: Duration,
    metrics: Arc<Metrics>,
}

impl MessagePublisher {
    pub fn new(publish_timeout: Duration, metrics: Arc<Metrics>) -> Self {
        Self {
            publish_timeout,
            metrics,
        }
    }

    pub async fn publish(
        &self,
        link: &mut dyn BrokerLink,
        message: &Message,
    ) -> Result<(), PublishError> {
        let queue = message.routing_key();

        if !link.is_open() {
            return Err(self.record_failure(message, PublishError::ChannelClosed {
                index: message.index(),
            }));
        }

        let start = Instant::now();
        let result = match tokio::time::timeout(self.publish_timeout, link.publish(message)).await
        {
            Ok(result) => result,
            Err(_) => Err(PublishError::Timeout {
                index: message.index(),
                timeout: self.publish_timeout,
            }),
        };
        let duration = start.elapsed().as_secs_f64();

        match result {
            Ok(()) => {
                self.metrics
                    .messages_published_total
                    .with_label_values(&[queue])
                    .inc();
                self.metrics
                    .publish_duration_seconds
                    .with_label_values(&[queue, "confirmed"])
                    .observe(duration);

                info!(
                    record = message.index(),
                    queue = %queue,
                    payload_size = message.len(),
                    duration_ms = duration * 1000.0,
                    " [x] Sent {}",
                    message.preview(PAYLOAD_PREVIEW_CHARS)
                );
                Ok(())
            }
            Err(e) => {
                self.metrics
                    .publish_duration_seconds
                    .with_label_values(&[queue, "failed"])
                    .observe(duration);
                Err(self.record_failure(message, e))
            }
        }
    }

    fn record_failure(&self, message: &Message, error: PublishError) -> PublishError {
        self.metrics
            .messages_failed_total
            .with_label_values(&[message.routing_key(), "publish"])
            .inc();

        error!(
            record = message.index(),
            queue = %message.routing_key(),
            error = %error,
            "Failed to publish message"
        );
        error
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("Record {index}: channel is closed")]
    ChannelClosed { index: u64 },

    #[error("Record {index}: broker rejected publish: {reason}")]
    Rejected { index: u64, reason: String },

    #[error("Record {index}: broker nacked the message")]
    Nacked { index: u64 },

    #[error("Record {index}: message returned as unroutable by queue '{queue}'")]
    Unroutable { index: u64, queue: String },

    #[error("Record {index}: no confirmation within {timeout:?}")]
    Timeout { index: u64, timeout: Duration },
}

impl PublishError {
    pub fn index(&self) -> u64 {
        match self {
            Self::ChannelClosed { index }
            | Self::Rejected { index, .. }
            | Self::Nacked { index }
            | Self::Unroutable { index, .. }
            | Self::Timeout { index, .. } => *index,
        }
    }
}
