use async_trait::async_trait;

use super::connection::ConnectionError;
use super::publisher::PublishError;
use super::queue::DeclarationError;
use crate::contracts::Message;

/// Opens links to a broker.
///
/// Implemented by [`RabbitMqConnector`](super::rabbitmq::RabbitMqConnector)
/// for real runs and by [`InMemoryBroker`](super::memory::InMemoryBroker)
/// for dry runs and tests.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Broker address for log lines. Never contains credentials.
    fn host(&self) -> &str;

    async fn connect(&self) -> Result<Box<dyn BrokerLink>, ConnectionError>;
}

/// One connection plus the single channel the run publishes on.
#[async_trait]
pub trait BrokerLink: Send {
    fn is_open(&self) -> bool;

    async fn declare_queue(&mut self, name: &str, durable: bool) -> Result<(), DeclarationError>;

    /// Returns once the broker has confirmed the message.
    async fn publish(&mut self, message: &Message) -> Result<(), PublishError>;

    async fn close(&mut self) -> Result<(), ConnectionError>;
}
