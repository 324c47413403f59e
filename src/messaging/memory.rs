use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

use super::broker::{BrokerLink, Connector};
use super::connection::ConnectionError;
use super::publisher::PublishError;
use super::queue::DeclarationError;
use crate::contracts::Message;

/// Broker that lives in process memory.
///
/// Backs `--dry-run` and the test suite. Every call is recorded, and
/// faults can be injected before the broker is handed out.
/// Clones share state.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, bool>,
    published: Vec<Message>,
    events: Vec<BrokerEvent>,
    stats: BrokerStats,
    unreachable: bool,
    connect_delay: Option<Duration>,
    confirm_delay: Option<Duration>,
    declare_delay: Option<Duration>,
    close_delay: Option<Duration>,
    nacked: HashSet<u64>,
    channel_kills: HashSet<u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub connects: usize,
    pub declares: usize,
    pub publishes: usize,
    pub releases: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    Connected,
    Declared(String),
    Published(u64),
    Released,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unreachable(self) -> Self {
        self.lock().unreachable = true;
        self
    }

    pub fn with_connect_delay(self, delay: Duration) -> Self {
        self.lock().connect_delay = Some(delay);
        self
    }

    pub fn with_confirm_delay(self, delay: Duration) -> Self {
        self.lock().confirm_delay = Some(delay);
        self
    }

    pub fn with_declare_delay(self, delay: Duration) -> Self {
        self.lock().declare_delay = Some(delay);
        self
    }

    pub fn with_close_delay(self, delay: Duration) -> Self {
        self.lock().close_delay = Some(delay);
        self
    }

    pub fn with_existing_queue(self, name: &str, durable: bool) -> Self {
        self.lock().queues.insert(name.to_string(), durable);
        self
    }

    /// The broker will nack the message built from this record.
    pub fn nack_record(self, index: u64) -> Self {
        self.lock().nacked.insert(index);
        self
    }

    /// The broker will close the channel instead of confirming the message
    /// built from this record. The connection itself stays up.
    pub fn close_channel_on_record(self, index: u64) -> Self {
        self.lock().channel_kills.insert(index);
        self
    }

    pub fn stats(&self) -> BrokerStats {
        self.lock().stats
    }

    pub fn events(&self) -> Vec<BrokerEvent> {
        self.lock().events.clone()
    }

    /// Messages the broker confirmed, in arrival order.
    pub fn published(&self) -> Vec<Message> {
        self.lock().published.clone()
    }

    pub fn queue_durability(&self, name: &str) -> Option<bool> {
        self.lock().queues.get(name).copied()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        // A panicking test thread must not hide the state from the others.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Connector for InMemoryBroker {
    fn host(&self) -> &str {
        "memory"
    }

    async fn connect(&self) -> Result<Box<dyn BrokerLink>, ConnectionError> {
        let delay = self.lock().connect_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        if state.unreachable {
            return Err(ConnectionError::ConnectionFailed {
                host: "memory".to_string(),
                reason: "connection refused".to_string(),
            });
        }

        state.stats.connects += 1;
        state.events.push(BrokerEvent::Connected);
        debug!("In-memory broker link opened");

        Ok(Box::new(InMemoryLink {
            broker: self.clone(),
            open: true,
            channel_open: true,
        }))
    }
}

struct InMemoryLink {
    broker: InMemoryBroker,
    open: bool,
    channel_open: bool,
}

#[async_trait]
impl BrokerLink for InMemoryLink {
    fn is_open(&self) -> bool {
        self.open && self.channel_open
    }

    async fn declare_queue(&mut self, name: &str, durable: bool) -> Result<(), DeclarationError> {
        let delay = self.broker.lock().declare_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.broker.lock();
        state.stats.declares += 1;

        if let Some(existing) = state.queues.get(name) {
            if *existing != durable {
                return Err(DeclarationError::Conflict {
                    queue: name.to_string(),
                    reason: format!(
                        "PRECONDITION_FAILED - inequivalent arg 'durable', received '{}' but current is '{}'",
                        durable, existing
                    ),
                });
            }
        }

        state.queues.insert(name.to_string(), durable);
        state.events.push(BrokerEvent::Declared(name.to_string()));
        Ok(())
    }

    async fn publish(&mut self, message: &Message) -> Result<(), PublishError> {
        let delay = self.broker.lock().confirm_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.broker.lock();
        state.stats.publishes += 1;

        if !state.queues.contains_key(message.routing_key()) {
            return Err(PublishError::Unroutable {
                index: message.index(),
                queue: message.routing_key().to_string(),
            });
        }

        if state.channel_kills.contains(&message.index()) {
            self.channel_open = false;
            return Err(PublishError::Rejected {
                index: message.index(),
                reason: "channel closed by broker".to_string(),
            });
        }

        if state.nacked.contains(&message.index()) {
            return Err(PublishError::Nacked {
                index: message.index(),
            });
        }

        debug!(
            record = message.index(),
            queue = %message.routing_key(),
            "In-memory broker accepted message"
        );
        state.published.push(message.clone());
        state.events.push(BrokerEvent::Published(message.index()));
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ConnectionError> {
        if !self.open {
            return Ok(());
        }

        let delay = self.broker.lock().close_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.open = false;
        let mut state = self.broker.lock();
        state.stats.releases += 1;
        state.events.push(BrokerEvent::Released);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unknown_queue_is_unroutable() {
        let broker = InMemoryBroker::new();
        let mut link = broker.connect().await.unwrap();

        let err = link
            .publish(&Message::new("missing", 1, "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::Unroutable { index: 1, .. }));
    }

    #[tokio::test]
    async fn test_events_in_order() {
        let broker = InMemoryBroker::new();
        let mut link = broker.connect().await.unwrap();
        link.declare_queue("q", true).await.unwrap();
        link.publish(&Message::new("q", 1, "a")).await.unwrap();
        link.close().await.unwrap();
        link.close().await.unwrap();

        assert_eq!(
            broker.events(),
            vec![
                BrokerEvent::Connected,
                BrokerEvent::Declared("q".to_string()),
                BrokerEvent::Published(1),
                BrokerEvent::Released,
            ]
        );
        assert_eq!(broker.queue_durability("q"), Some(true));
    }

    #[tokio::test]
    async fn test_closed_channel_still_needs_release() {
        let broker = InMemoryBroker::new().close_channel_on_record(1);
        let mut link = broker.connect().await.unwrap();
        link.declare_queue("q", true).await.unwrap();

        let err = link.publish(&Message::new("q", 1, "a")).await.unwrap_err();
        assert!(matches!(err, PublishError::Rejected { index: 1, .. }));
        assert!(!link.is_open());
        assert!(broker.published().is_empty());

        link.close().await.unwrap();
        assert_eq!(broker.stats().releases, 1);
    }
}
