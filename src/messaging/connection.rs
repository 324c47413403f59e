use lapin::{uri::AMQPUri, Connection, ConnectionProperties};
use std::time::Duration;
use tracing::{error, info, warn};

use super::broker::{BrokerLink, Connector};

pub struct RabbitMqConnection {
    connection: Connection,
    host: String,
}

impl RabbitMqConnection {
    pub async fn connect(uri: AMQPUri, host: &str) -> Result<Self, ConnectionError> {
        info!(host = %host, vhost = %uri.vhost, "Connecting to RabbitMQ");

        let connection = Connection::connect_uri(uri, ConnectionProperties::default())
            .await
            .map_err(|e| {
                error!(error = %e, host = %host, "Failed to connect to RabbitMQ");
                ConnectionError::ConnectionFailed {
                    host: host.to_string(),
                    reason: e.to_string(),
                }
            })?;

        info!(host = %host, "Successfully connected to RabbitMQ");

        Ok(Self {
            connection,
            host: host.to_string(),
        })
    }

    pub fn get_connection(&self) -> &Connection {
        &self.connection
    }

    pub fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }

    pub async fn shutdown(&self) -> Result<(), ConnectionError> {
        if !self.is_connected() {
            warn!(host = %self.host, "RabbitMQ connection already closed");
            return Ok(());
        }

        info!(host = %self.host, "Shutting down RabbitMQ connection");

        self.connection
            .close(200, "Normal shutdown")
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to close RabbitMQ connection gracefully");
                ConnectionError::ShutdownFailed(e.to_string())
            })?;

        info!("RabbitMQ connection closed successfully");
        Ok(())
    }
}

/// Acquires broker links under a connect timeout.
///
/// The same timeout bounds closing the link and other control calls made
/// on it, so no broker round trip can block a run indefinitely.
pub struct ConnectionManager<C> {
    connector: C,
    connect_timeout: Duration,
}

impl<C: Connector> ConnectionManager<C> {
    pub fn new(connector: C, connect_timeout: Duration) -> Self {
        Self {
            connector,
            connect_timeout,
        }
    }

    pub fn host(&self) -> &str {
        self.connector.host()
    }

    pub fn timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Single attempt, no retry. Callers decide whether to try again.
    pub async fn acquire(&self) -> Result<ManagedConnection, ConnectionError> {
        let host = self.connector.host().to_string();

        let link = tokio::time::timeout(self.connect_timeout, self.connector.connect())
            .await
            .map_err(|_| {
                error!(
                    host = %host,
                    timeout_ms = self.connect_timeout.as_millis() as u64,
                    "Timed out connecting to broker"
                );
                ConnectionError::Timeout {
                    host: host.clone(),
                    timeout: self.connect_timeout,
                }
            })??;

        info!(host = %host, "Broker link acquired");

        Ok(ManagedConnection {
            host,
            link: Some(link),
            close_timeout: self.connect_timeout,
        })
    }
}

/// A live link owned by exactly one run.
///
/// `release` takes the link out, so later calls are no-ops and nothing can
/// reach the channel once it has been closed.
pub struct ManagedConnection {
    host: String,
    link: Option<Box<dyn BrokerLink>>,
    close_timeout: Duration,
}

impl ManagedConnection {
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn is_open(&self) -> bool {
        self.link.as_ref().is_some_and(|link| link.is_open())
    }

    pub fn is_released(&self) -> bool {
        self.link.is_none()
    }

    pub fn link(&mut self) -> Result<&mut (dyn BrokerLink + 'static), ConnectionError> {
        match self.link.as_mut() {
            Some(link) => Ok(&mut **link),
            None => Err(ConnectionError::Released(self.host.clone())),
        }
    }

    pub async fn release(&mut self) -> Result<(), ConnectionError> {
        let Some(mut link) = self.link.take() else {
            return Ok(());
        };

        info!(host = %self.host, "Releasing broker link");
        match tokio::time::timeout(self.close_timeout, link.close()).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    host = %self.host,
                    timeout_ms = self.close_timeout.as_millis() as u64,
                    "Broker did not confirm close in time, abandoning link"
                );
                Err(ConnectionError::ShutdownFailed(format!(
                    "no close confirmation from {} within {:?}",
                    self.host, self.close_timeout
                )))
            }
        }
    }
}

impl Drop for ManagedConnection {
    fn drop(&mut self) {
        if self.link.is_some() {
            warn!(host = %self.host, "Broker link dropped without release");
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Failed to connect to broker at {host}: {reason}")]
    ConnectionFailed { host: String, reason: String },

    #[error("Timed out after {timeout:?} connecting to broker at {host}")]
    Timeout { host: String, timeout: Duration },

    #[error("Failed to open channel: {0}")]
    Channel(#[from] super::channel::ChannelError),

    #[error("Connection to {0} was already released")]
    Released(String),

    #[error("Failed to shutdown connection gracefully: {0}")]
    ShutdownFailed(String),
}
