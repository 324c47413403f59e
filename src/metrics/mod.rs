use prometheus::{
    CounterVec, Gauge, HistogramOpts, HistogramVec, IntCounter, Opts, Registry,
};
use std::sync::Arc;

pub mod server;

pub struct Metrics {
    pub records_read_total: IntCounter,
    pub messages_published_total: CounterVec,
    pub messages_failed_total: CounterVec,
    pub publish_duration_seconds: HistogramVec,
    pub connection_open: Gauge,
    pub registry: Registry,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let records_read_total = IntCounter::new(
            "emitter_records_read_total",
            "Total number of input records read from the source",
        )?;

        let messages_published_total = CounterVec::new(
            Opts::new(
                "emitter_messages_published_total",
                "Total number of messages confirmed by the broker",
            ),
            &["queue"],
        )?;

        let messages_failed_total = CounterVec::new(
            Opts::new(
                "emitter_messages_failed_total",
                "Total number of records that did not reach the broker",
            ),
            &["queue", "reason"],
        )?;

        let publish_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "emitter_publish_duration_seconds",
                "Time from publish to broker confirmation",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
            &["queue", "status"],
        )?;

        let connection_open = Gauge::new(
            "emitter_connection_open",
            "1 while the broker connection is held by the run",
        )?;

        registry.register(Box::new(records_read_total.clone()))?;
        registry.register(Box::new(messages_published_total.clone()))?;
        registry.register(Box::new(messages_failed_total.clone()))?;
        registry.register(Box::new(publish_duration_seconds.clone()))?;
        registry.register(Box::new(connection_open.clone()))?;

        Ok(Arc::new(Self {
            records_read_total,
            messages_published_total,
            messages_failed_total,
            publish_duration_seconds,
            connection_open,
            registry,
        }))
    }
}
