use std::collections::HashSet;
use std::time::Duration;
use tracing::{error, info};

use super::broker::BrokerLink;

/// Ensures durable queues exist before anything is published to them.
///
/// Declarations are remembered for the lifetime of the connection the
/// declarer belongs to; a new connection needs a new declarer. Each
/// declaration must be acknowledged within `timeout`.
#[derive(Debug)]
pub struct QueueDeclarer {
    declared: HashSet<String>,
    timeout: Duration,
}

impl QueueDeclarer {
    pub fn new(timeout: Duration) -> Self {
        Self {
            declared: HashSet::new(),
            timeout,
        }
    }

    pub async fn declare(
        &mut self,
        link: &mut dyn BrokerLink,
        name: &str,
        durable: bool,
    ) -> Result<(), DeclarationError> {
        if name.is_empty() {
            return Err(DeclarationError::InvalidName);
        }

        if self.declared.contains(name) {
            info!(queue = %name, "Queue already declared on this connection");
            return Ok(());
        }

        let result = match tokio::time::timeout(self.timeout, link.declare_queue(name, durable)).await
        {
            Ok(result) => result,
            Err(_) => Err(DeclarationError::Failed {
                queue: name.to_string(),
                reason: format!("no declare-ok within {:?}", self.timeout),
            }),
        };

        result.map_err(|e| {
            error!(error = %e, queue = %name, durable, "Queue declaration failed");
            e
        })?;

        self.declared.insert(name.to_string());
        info!(queue = %name, durable, "Queue declared");
        Ok(())
    }

    pub fn is_declared(&self, name: &str) -> bool {
        self.declared.contains(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DeclarationError {
    #[error("Queue name must not be empty")]
    InvalidName,

    #[error("Queue '{queue}' already exists with different parameters: {reason}")]
    Conflict { queue: String, reason: String },

    #[error("Failed to declare queue '{queue}': {reason}")]
    Failed { queue: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::memory::InMemoryBroker;
    use crate::messaging::Connector;

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_declare_twice_is_noop() {
        let broker = InMemoryBroker::new();
        let mut link = broker.connect().await.unwrap();
        let mut declarer = QueueDeclarer::new(TIMEOUT);

        declarer.declare(link.as_mut(), "task_queue3", true).await.unwrap();
        declarer.declare(link.as_mut(), "task_queue3", true).await.unwrap();

        assert!(declarer.is_declared("task_queue3"));
        assert_eq!(broker.stats().declares, 1);
    }

    #[tokio::test]
    async fn test_redeclare_on_fresh_declarer_is_idempotent() {
        let broker = InMemoryBroker::new();
        let mut link = broker.connect().await.unwrap();

        QueueDeclarer::new(TIMEOUT)
            .declare(link.as_mut(), "jobs", true)
            .await
            .unwrap();
        QueueDeclarer::new(TIMEOUT)
            .declare(link.as_mut(), "jobs", true)
            .await
            .unwrap();

        assert_eq!(broker.stats().declares, 2);
    }

    #[tokio::test]
    async fn test_durability_conflict() {
        let broker = InMemoryBroker::new().with_existing_queue("jobs", false);
        let mut link = broker.connect().await.unwrap();
        let mut declarer = QueueDeclarer::new(TIMEOUT);

        let result = declarer.declare(link.as_mut(), "jobs", true).await;
        assert!(matches!(result, Err(DeclarationError::Conflict { .. })));
        assert!(!declarer.is_declared("jobs"));
    }

    #[tokio::test]
    async fn test_empty_name_rejected() {
        let broker = InMemoryBroker::new();
        let mut link = broker.connect().await.unwrap();

        let result = QueueDeclarer::new(TIMEOUT).declare(link.as_mut(), "", true).await;
        assert!(matches!(result, Err(DeclarationError::InvalidName)));
        assert_eq!(broker.stats().declares, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_declaration_times_out() {
        let broker = InMemoryBroker::new().with_declare_delay(Duration::from_secs(60));
        let mut link = broker.connect().await.unwrap();
        let mut declarer = QueueDeclarer::new(Duration::from_secs(2));

        let result = declarer.declare(link.as_mut(), "jobs", true).await;
        assert!(matches!(result, Err(DeclarationError::Failed { .. })));
        assert!(!declarer.is_declared("jobs"));
        assert_eq!(broker.queue_durability("jobs"), None);
    }
}
