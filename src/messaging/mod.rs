pub mod broker;
pub mod channel;
pub mod connection;
pub mod memory;
pub mod publisher;
pub mod queue;
pub mod rabbitmq;

pub use broker::{BrokerLink, Connector};
pub use channel::{ChannelError, ChannelProvider};
pub use connection::{ConnectionError, ConnectionManager, ManagedConnection, RabbitMqConnection};
pub use memory::InMemoryBroker;
pub use publisher::{MessagePublisher, PublishError};
pub use queue::{DeclarationError, QueueDeclarer};
pub use rabbitmq::RabbitMqConnector;
