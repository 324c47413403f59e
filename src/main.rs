use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

mod config;
mod dashboard;

use config::{Cli, Config};
use task_emitter::driver::{report, BatchDriver, DriverError, RunReport};
use task_emitter::messaging::{
    ConnectionManager, Connector, InMemoryBroker, MessagePublisher, RabbitMqConnector,
};
use task_emitter::metrics::{server::start_metrics_server, Metrics};
use task_emitter::source::{RowTranslator, SourceReadError, SourceRecord};

#[tokio::main]
async fn main() -> ExitCode {
    setup_panic_handler();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if !e.use_stderr() => e.exit(),
        Err(e) => {
            let _ = e.print();
            return ExitCode::from(report::EXIT_CONFIG);
        }
    };

    let config = match Config::from_cli(cli) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            return ExitCode::from(report::EXIT_CONFIG);
        }
    };

    setup_logging(&config.rust_log);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        queue = %config.queue,
        input = %config.input.display(),
        policy = %config.policy,
        dry_run = config.dry_run,
        "Task emitter starting"
    );

    if let Some(url) = config.dashboard_url.clone() {
        if let Err(e) = tokio::task::spawn_blocking(move || dashboard::offer(&url)).await {
            warn!(error = %e, "Dashboard prompt did not complete");
        }
    }

    let metrics = match Metrics::new() {
        Ok(metrics) => metrics,
        Err(e) => {
            error!(error = %e, "Failed to create metrics");
            return ExitCode::from(report::EXIT_CONFIG);
        }
    };

    if let Some(port) = config.metrics_port {
        let metrics_clone = metrics.clone();
        tokio::spawn(async move {
            if let Err(e) = start_metrics_server(metrics_clone, port).await {
                error!(error = %e, "Metrics server error");
            }
        });
    }

    let records = match RowTranslator::open(&config.input, config.translator.clone()) {
        Ok(records) => records,
        Err(e) => {
            error!(error = %e, "Cannot read input, nothing published");
            return ExitCode::from(report::EXIT_SOURCE);
        }
    };

    let shutdown = Arc::new(Notify::new());
    let shutdown_clone = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        warn!("Shutdown signal received, releasing broker connection...");
        shutdown_clone.notify_one();

        if tokio::signal::ctrl_c().await.is_ok() {
            error!("Second shutdown signal received, exiting without waiting for the broker");
            std::process::exit(i32::from(report::EXIT_INTERRUPTED));
        }
    });

    let result = if config.dry_run {
        run_batch(InMemoryBroker::new(), &config, metrics, records, &shutdown).await
    } else {
        let connector = RabbitMqConnector::new(config.broker_uri.clone());
        run_batch(connector, &config, metrics, records, &shutdown).await
    };

    match result {
        Ok(summary) => {
            print_summary(&summary);
            ExitCode::from(summary.exit_code())
        }
        Err(e) => {
            if let Some(summary) = e.report() {
                print_summary(summary);
            }
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run_batch<C, I>(
    connector: C,
    config: &Config,
    metrics: Arc<Metrics>,
    records: I,
    shutdown: &Notify,
) -> Result<RunReport, DriverError>
where
    C: Connector,
    I: IntoIterator<Item = Result<SourceRecord, SourceReadError>>,
{
    let mut driver = BatchDriver::new(
        ConnectionManager::new(connector, config.connect_timeout),
        MessagePublisher::new(config.publish_timeout, metrics.clone()),
        metrics,
        config.queue.as_str(),
        config.policy,
    );

    driver.run(records, shutdown).await
}

fn print_summary(summary: &RunReport) {
    match serde_json::to_string(summary) {
        Ok(line) => println!("{}", line),
        Err(e) => warn!(error = %e, "Failed to serialize run summary"),
    }
}

fn setup_logging(rust_log: &str) {
    let filter = EnvFilter::try_new(rust_log).unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_file(true)
        .with_line_number(true)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }
}

fn setup_panic_handler() {
    std::panic::set_hook(Box::new(|panic_info| {
        let payload = panic_info.payload();
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            *s
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.as_str()
        } else {
            "Unknown panic payload"
        };

        let location = panic_info
            .location()
            .map(|loc| format!("{}:{}:{}", loc.file(), loc.line(), loc.column()))
            .unwrap_or_else(|| "unknown location".to_string());

        eprintln!("PANIC: {} at {}", message, location);
        error!(panic_message = message, location = %location, "Task emitter panicked");
    }));
}
