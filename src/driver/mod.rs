use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{error, info, warn};

pub mod report;

pub use report::{DriverState, RunReport};

use crate::contracts::{Message, RecordPolicy};
use crate::messaging::{
    ConnectionError, ConnectionManager, Connector, DeclarationError, ManagedConnection,
    MessagePublisher, PublishError, QueueDeclarer,
};
use crate::metrics::Metrics;
use crate::source::{SourceReadError, SourceRecord};

/// Runs one batch: connect, declare the queue, publish every record in
/// order, release the connection.
pub struct BatchDriver<C> {
    connections: ConnectionManager<C>,
    publisher: MessagePublisher,
    metrics: Arc<Metrics>,
    queue: String,
    policy: RecordPolicy,
    state: DriverState,
}

impl<C: Connector> BatchDriver<C> {
    pub fn new(
        connections: ConnectionManager<C>,
        publisher: MessagePublisher,
        metrics: Arc<Metrics>,
        queue: impl Into<String>,
        policy: RecordPolicy,
    ) -> Self {
        Self {
            connections,
            publisher,
            metrics,
            queue: queue.into(),
            policy,
            state: DriverState::Init,
        }
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    /// Publishes `records` and returns the run summary.
    ///
    /// Once a connection has been acquired it is released before this
    /// returns, whether the run finishes, aborts, or `shutdown` fires.
    pub async fn run<I>(&mut self, records: I, shutdown: &Notify) -> Result<RunReport, DriverError>
    where
        I: IntoIterator<Item = Result<SourceRecord, SourceReadError>>,
    {
        let mut report = RunReport::new(&self.queue, self.policy);

        info!(
            host = %self.connections.host(),
            queue = %self.queue,
            policy = %self.policy,
            "Starting batch run"
        );

        let acquired = tokio::select! {
            biased;
            _ = shutdown.notified() => {
                warn!("Shutdown requested before broker connection was established");
                report.state = self.state;
                return Err(DriverError::Interrupted { report });
            }
            result = self.connections.acquire() => result,
        };

        let mut connection = match acquired {
            Ok(connection) => connection,
            Err(e) => {
                error!(error = %e, "Unable to reach broker, nothing published");
                report.state = self.state;
                return Err(DriverError::Connection(e));
            }
        };

        self.transition(DriverState::Connected);
        self.metrics.connection_open.set(1.0);

        let outcome = tokio::select! {
            biased;
            _ = shutdown.notified() => Err(Stop::Interrupted),
            result = self.drive(&mut connection, records, &mut report) => result,
        };

        if let Err(e) = connection.release().await {
            warn!(error = %e, "Broker connection did not close cleanly");
        }
        self.metrics.connection_open.set(0.0);

        match outcome {
            Ok(()) => {
                self.transition(DriverState::Done);
                report.state = self.state;
                info!(
                    queue = %self.queue,
                    records_read = report.records_read,
                    published = report.published,
                    failed = report.failed,
                    "Batch run complete"
                );
                Ok(report)
            }
            Err(stop) => {
                self.transition(DriverState::Aborted);
                report.state = self.state;
                let err = match stop {
                    Stop::Connection(e) => DriverError::Connection(e),
                    Stop::Declaration(e) => DriverError::Declaration(e),
                    Stop::Record(cause) => DriverError::Aborted { report, cause },
                    Stop::Interrupted => DriverError::Interrupted { report },
                };
                error!(error = %err, "Batch run aborted");
                Err(err)
            }
        }
    }

    async fn drive<I>(
        &mut self,
        connection: &mut ManagedConnection,
        records: I,
        report: &mut RunReport,
    ) -> Result<(), Stop>
    where
        I: IntoIterator<Item = Result<SourceRecord, SourceReadError>>,
    {
        let link = connection.link().map_err(Stop::Connection)?;

        QueueDeclarer::new(self.connections.timeout())
            .declare(link, &self.queue, true)
            .await
            .map_err(Stop::Declaration)?;
        self.transition(DriverState::QueueReady);
        self.transition(DriverState::Publishing);

        for item in records {
            report.records_read += 1;
            self.metrics.records_read_total.inc();

            let result = match item {
                Ok(record) => {
                    let message = Message::new(self.queue.as_str(), record.index, record.payload);
                    self.publisher
                        .publish(link, &message)
                        .await
                        .map_err(RecordError::Publish)
                }
                Err(e) => {
                    self.metrics
                        .messages_failed_total
                        .with_label_values(&[self.queue.as_str(), "source"])
                        .inc();
                    Err(RecordError::Source(e))
                }
            };

            match result {
                Ok(()) => report.published += 1,
                Err(cause) => {
                    report.record_failure(cause.index());

                    if cause.is_fatal() || !link.is_open() {
                        error!(record = ?cause.index(), error = %cause, "Unrecoverable record failure");
                        return Err(Stop::Record(cause));
                    }
                    if self.policy.is_abort() {
                        error!(
                            record = ?cause.index(),
                            published = report.published,
                            error = %cause,
                            "Aborting on failed record"
                        );
                        return Err(Stop::Record(cause));
                    }

                    warn!(record = ?cause.index(), error = %cause, "Skipping failed record");
                }
            }
        }

        Ok(())
    }

    fn transition(&mut self, next: DriverState) {
        if !self.state.can_transition_to(next) {
            warn!(from = ?self.state, to = ?next, "Unexpected driver state transition");
        }
        info!(from = ?self.state, to = ?next, "Driver state changed");
        self.state = next;
    }
}

enum Stop {
    Connection(ConnectionError),
    Declaration(DeclarationError),
    Record(RecordError),
    Interrupted,
}

/// Why a single record did not reach the broker.
#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error(transparent)]
    Source(SourceReadError),

    #[error(transparent)]
    Publish(PublishError),
}

impl RecordError {
    pub fn index(&self) -> Option<u64> {
        match self {
            Self::Source(e) => e.index(),
            Self::Publish(e) => Some(e.index()),
        }
    }

    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Source(e) => e.is_fatal(),
            Self::Publish(_) => false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error(transparent)]
    Connection(ConnectionError),

    #[error(transparent)]
    Declaration(DeclarationError),

    #[error("Run aborted after {} published: {cause}", .report.published)]
    Aborted { report: RunReport, cause: RecordError },

    #[error("Run interrupted after {} published", .report.published)]
    Interrupted { report: RunReport },
}

impl DriverError {
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Connection(_) => report::EXIT_CONNECTION,
            Self::Declaration(_) => report::EXIT_DECLARATION,
            Self::Aborted { .. } => report::EXIT_PARTIAL,
            Self::Interrupted { .. } => report::EXIT_INTERRUPTED,
        }
    }

    pub fn report(&self) -> Option<&RunReport> {
        match self {
            Self::Aborted { report, .. } | Self::Interrupted { report } => Some(report),
            Self::Connection(_) | Self::Declaration(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::memory::{BrokerEvent, InMemoryBroker};
    use crate::source::{RowTranslator, TranslatorOptions};
    use std::io::Read;
    use std::time::Duration;

    struct FailingReader;

    impl Read for FailingReader {
        fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
            Err(std::io::Error::other("disk gone"))
        }
    }

    fn driver(broker: &InMemoryBroker, policy: RecordPolicy) -> BatchDriver<InMemoryBroker> {
        let metrics = Metrics::new().unwrap();
        BatchDriver::new(
            ConnectionManager::new(broker.clone(), Duration::from_secs(5)),
            MessagePublisher::new(Duration::from_secs(30), metrics.clone()),
            metrics,
            "task_queue3",
            policy,
        )
    }

    fn rows(input: &'static [u8]) -> RowTranslator<&'static [u8]> {
        RowTranslator::from_reader(input, TranslatorOptions::default())
    }

    fn payloads(broker: &InMemoryBroker) -> Vec<String> {
        broker
            .published()
            .iter()
            .map(|m| String::from_utf8(m.payload().to_vec()).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_publishes_every_row_in_order() {
        let broker = InMemoryBroker::new();
        let mut driver = driver(&broker, RecordPolicy::Abort);

        let report = driver
            .run(rows(b"a,b\nc,d,e\n"), &Notify::new())
            .await
            .unwrap();

        assert_eq!(payloads(&broker), vec!["a b", "c d e"]);
        assert_eq!(report.published, 2);
        assert_eq!(report.failed, 0);
        assert_eq!(report.state, DriverState::Done);
        assert_eq!(driver.state(), DriverState::Done);
        assert_eq!(
            broker.events(),
            vec![
                BrokerEvent::Connected,
                BrokerEvent::Declared("task_queue3".to_string()),
                BrokerEvent::Published(1),
                BrokerEvent::Published(2),
                BrokerEvent::Released,
            ]
        );
        assert_eq!(broker.queue_durability("task_queue3"), Some(true));
    }

    #[tokio::test]
    async fn test_empty_source_still_declares_and_releases() {
        let broker = InMemoryBroker::new();
        let report = driver(&broker, RecordPolicy::Abort)
            .run(rows(b""), &Notify::new())
            .await
            .unwrap();

        assert_eq!(report.records_read, 0);
        assert_eq!(broker.stats().declares, 1);
        assert_eq!(broker.stats().releases, 1);
    }

    #[tokio::test]
    async fn test_unreachable_broker_publishes_nothing() {
        let broker = InMemoryBroker::new().unreachable();
        let mut driver = driver(&broker, RecordPolicy::Abort);

        let err = driver.run(rows(b"a\n"), &Notify::new()).await.unwrap_err();

        assert!(matches!(err, DriverError::Connection(_)));
        assert_eq!(err.exit_code(), report::EXIT_CONNECTION);
        assert_eq!(broker.stats(), Default::default());
        assert_eq!(driver.state(), DriverState::Init);
    }

    #[tokio::test]
    async fn test_declaration_conflict_aborts_and_releases() {
        let broker = InMemoryBroker::new().with_existing_queue("task_queue3", false);
        let mut driver = driver(&broker, RecordPolicy::Skip);

        let err = driver.run(rows(b"a\nb\n"), &Notify::new()).await.unwrap_err();

        assert!(matches!(err, DriverError::Declaration(DeclarationError::Conflict { .. })));
        assert_eq!(err.exit_code(), report::EXIT_DECLARATION);
        assert_eq!(broker.stats().publishes, 0);
        assert_eq!(broker.stats().releases, 1);
        assert_eq!(driver.state(), DriverState::Aborted);
    }

    #[tokio::test]
    async fn test_malformed_record_aborts() {
        let broker = InMemoryBroker::new();
        let mut driver = driver(&broker, RecordPolicy::Abort);

        let err = driver
            .run(rows(b"one\ntwo\nbad\xff\nfour\n"), &Notify::new())
            .await
            .unwrap_err();

        match &err {
            DriverError::Aborted { report, cause } => {
                assert_eq!(cause.index(), Some(3));
                assert_eq!(report.published, 2);
                assert_eq!(report.failed_records, vec![3]);
                assert_eq!(report.state, DriverState::Aborted);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(err.exit_code(), report::EXIT_PARTIAL);
        assert_eq!(broker.stats().publishes, 2);
        assert_eq!(broker.stats().releases, 1);
    }

    #[tokio::test]
    async fn test_malformed_record_skipped() {
        let broker = InMemoryBroker::new();
        let mut driver = driver(&broker, RecordPolicy::Skip);

        let report = driver
            .run(rows(b"one\ntwo\nbad\xff\nfour\n"), &Notify::new())
            .await
            .unwrap();

        assert_eq!(payloads(&broker), vec!["one", "two", "four"]);
        assert_eq!(report.published, 3);
        assert_eq!(report.failed, 1);
        assert_eq!(report.records_read, 4);
        assert_eq!(report.exit_code(), report::EXIT_PARTIAL);
        assert_eq!(broker.stats().releases, 1);
    }

    #[tokio::test]
    async fn test_nacked_publish_skipped() {
        let broker = InMemoryBroker::new().nack_record(2);
        let mut driver = driver(&broker, RecordPolicy::Skip);

        let report = driver.run(rows(b"a\nb\nc\n"), &Notify::new()).await.unwrap();

        assert_eq!(payloads(&broker), vec!["a", "c"]);
        assert_eq!(broker.stats().publishes, 3);
        assert_eq!(report.failed_records, vec![2]);
    }

    #[tokio::test]
    async fn test_nacked_publish_aborts() {
        let broker = InMemoryBroker::new().nack_record(2);
        let mut driver = driver(&broker, RecordPolicy::Abort);

        let err = driver.run(rows(b"a\nb\nc\n"), &Notify::new()).await.unwrap_err();

        assert!(matches!(
            err,
            DriverError::Aborted {
                cause: RecordError::Publish(PublishError::Nacked { index: 2 }),
                ..
            }
        ));
        assert_eq!(broker.stats().publishes, 2);
        assert_eq!(broker.stats().releases, 1);
    }

    #[tokio::test]
    async fn test_read_failure_aborts_even_when_skipping() {
        let broker = InMemoryBroker::new();
        let mut driver = driver(&broker, RecordPolicy::Skip);
        let records = RowTranslator::from_reader(
            (&b"a\nb\n"[..]).chain(FailingReader),
            TranslatorOptions::default(),
        );

        let err = driver.run(records, &Notify::new()).await.unwrap_err();

        match &err {
            DriverError::Aborted { report, cause } => {
                assert!(matches!(
                    cause,
                    RecordError::Source(SourceReadError::Io { index: 3, .. })
                ));
                assert_eq!(report.published, 2);
                assert_eq!(report.failed_records, vec![3]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(err.exit_code(), report::EXIT_PARTIAL);
        assert_eq!(payloads(&broker), vec!["a", "b"]);
        assert_eq!(broker.stats().releases, 1);
    }

    #[tokio::test]
    async fn test_closed_channel_aborts_even_when_skipping() {
        let broker = InMemoryBroker::new().close_channel_on_record(2);
        let mut driver = driver(&broker, RecordPolicy::Skip);

        let err = driver.run(rows(b"a\nb\nc\n"), &Notify::new()).await.unwrap_err();

        match &err {
            DriverError::Aborted { report, cause } => {
                assert_eq!(cause.index(), Some(2));
                assert_eq!(report.published, 1);
                assert_eq!(report.records_read, 2);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(broker.stats().publishes, 2);
        assert_eq!(broker.stats().releases, 1);
        assert_eq!(driver.state(), DriverState::Aborted);
    }

    #[tokio::test]
    async fn test_blank_line_published_as_empty_message() {
        let broker = InMemoryBroker::new();
        let report = driver(&broker, RecordPolicy::Abort)
            .run(rows(b"a\n\nb\n"), &Notify::new())
            .await
            .unwrap();

        assert_eq!(payloads(&broker), vec!["a", "", "b"]);
        assert_eq!(report.records_read, 3);
        assert_eq!(report.published, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_declaration_aborts_and_releases() {
        let broker = InMemoryBroker::new().with_declare_delay(Duration::from_secs(60));
        let mut driver = driver(&broker, RecordPolicy::Abort);

        let err = driver.run(rows(b"a\n"), &Notify::new()).await.unwrap_err();

        assert!(matches!(err, DriverError::Declaration(DeclarationError::Failed { .. })));
        assert_eq!(err.exit_code(), report::EXIT_DECLARATION);
        assert_eq!(broker.stats().publishes, 0);
        assert_eq!(broker.stats().releases, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_close_does_not_hang_run() {
        let broker = InMemoryBroker::new().with_close_delay(Duration::from_secs(600));

        let report = driver(&broker, RecordPolicy::Abort)
            .run(rows(b"a\n"), &Notify::new())
            .await
            .unwrap();

        assert_eq!(report.published, 1);
        assert_eq!(report.state, DriverState::Done);
    }

    #[tokio::test]
    async fn test_interrupt_before_connect() {
        let broker = InMemoryBroker::new();
        let shutdown = Notify::new();
        shutdown.notify_one();

        let err = driver(&broker, RecordPolicy::Abort)
            .run(rows(b"a\n"), &shutdown)
            .await
            .unwrap_err();

        assert!(matches!(err, DriverError::Interrupted { .. }));
        assert_eq!(err.exit_code(), report::EXIT_INTERRUPTED);
        assert_eq!(broker.stats().connects, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupt_mid_run_releases_connection() {
        let broker = InMemoryBroker::new().with_confirm_delay(Duration::from_secs(10));
        let shutdown = Arc::new(Notify::new());

        let trigger = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(15)).await;
            trigger.notify_one();
        });

        let err = driver(&broker, RecordPolicy::Abort)
            .run(rows(b"a\nb\nc\n"), &shutdown)
            .await
            .unwrap_err();

        match err {
            DriverError::Interrupted { report } => {
                assert_eq!(report.published, 1);
                assert_eq!(report.state, DriverState::Aborted);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(broker.stats().releases, 1);
        assert_eq!(broker.events().last(), Some(&BrokerEvent::Released));
    }
}
