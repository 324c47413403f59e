use async_trait::async_trait;
use lapin::{
    options::{BasicPublishOptions, QueueDeclareOptions},
    protocol::{AMQPErrorKind, AMQPSoftError},
    publisher_confirm::Confirmation,
    types::FieldTable,
    uri::AMQPUri,
    BasicProperties, Channel,
};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{info, warn};
use uuid::Uuid;

use super::broker::{BrokerLink, Connector};
use super::channel::ChannelProvider;
use super::connection::{ConnectionError, RabbitMqConnection};
use super::publisher::PublishError;
use super::queue::DeclarationError;
use crate::contracts::Message;

const DEFAULT_EXCHANGE: &str = "";
const PERSISTENT_DELIVERY_MODE: u8 = 2;
const CONTENT_TYPE: &str = "text/plain";

pub struct RabbitMqConnector {
    uri: AMQPUri,
    host: String,
}

impl RabbitMqConnector {
    pub fn new(uri: AMQPUri) -> Self {
        let host = format!("{}:{}", uri.authority.host, uri.authority.port);
        Self { uri, host }
    }
}

#[async_trait]
impl Connector for RabbitMqConnector {
    fn host(&self) -> &str {
        &self.host
    }

    async fn connect(&self) -> Result<Box<dyn BrokerLink>, ConnectionError> {
        let connection = RabbitMqConnection::connect(self.uri.clone(), &self.host).await?;

        let channel = match ChannelProvider::create_channel(connection.get_connection()).await {
            Ok(channel) => channel,
            Err(e) => {
                if let Err(close_err) = connection.shutdown().await {
                    warn!(error = %close_err, "Failed to close connection after channel error");
                }
                return Err(e.into());
            }
        };

        Ok(Box::new(RabbitMqLink {
            connection,
            channel,
        }))
    }
}

struct RabbitMqLink {
    connection: RabbitMqConnection,
    channel: Channel,
}

#[async_trait]
impl BrokerLink for RabbitMqLink {
    fn is_open(&self) -> bool {
        self.connection.is_connected() && self.channel.status().connected()
    }

    async fn declare_queue(&mut self, name: &str, durable: bool) -> Result<(), DeclarationError> {
        let queue = self
            .channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| declaration_error(name, e))?;

        info!(
            queue = %name,
            messages = queue.message_count(),
            consumers = queue.consumer_count(),
            "Broker acknowledged queue declaration"
        );
        Ok(())
    }

    async fn publish(&mut self, message: &Message) -> Result<(), PublishError> {
        let index = message.index();
        let rejected = move |e: lapin::Error| PublishError::Rejected {
            index,
            reason: e.to_string(),
        };

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();

        let properties = BasicProperties::default()
            .with_delivery_mode(PERSISTENT_DELIVERY_MODE)
            .with_content_type(CONTENT_TYPE.into())
            .with_message_id(Uuid::new_v4().to_string().into())
            .with_timestamp(timestamp);

        let confirmation = self
            .channel
            .basic_publish(
                DEFAULT_EXCHANGE,
                message.routing_key(),
                BasicPublishOptions {
                    mandatory: true,
                    ..Default::default()
                },
                message.payload(),
                properties,
            )
            .await
            .map_err(rejected)?
            .await
            .map_err(rejected)?;

        match confirmation {
            Confirmation::Ack(None) => Ok(()),
            Confirmation::Ack(Some(_)) => Err(PublishError::Unroutable {
                index,
                queue: message.routing_key().to_string(),
            }),
            Confirmation::Nack(_) => Err(PublishError::Nacked { index }),
            Confirmation::NotRequested => {
                warn!(record = index, "Channel is not in confirm mode, treating publish as sent");
                Ok(())
            }
        }
    }

    async fn close(&mut self) -> Result<(), ConnectionError> {
        if let Err(e) = ChannelProvider::close_channel(&self.channel).await {
            warn!(error = %e, "Closing connection after channel close failure");
        }
        self.connection.shutdown().await
    }
}

fn declaration_error(queue: &str, error: lapin::Error) -> DeclarationError {
    let conflict = matches!(
        &error,
        lapin::Error::ProtocolError(amqp)
            if matches!(amqp.kind(), AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED))
    );

    if conflict {
        DeclarationError::Conflict {
            queue: queue.to_string(),
            reason: error.to_string(),
        }
    } else {
        DeclarationError::Failed {
            queue: queue.to_string(),
            reason: error.to_string(),
        }
    }
}
