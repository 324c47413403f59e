use clap::Parser;
use lapin::uri::AMQPUri;
use std::path::PathBuf;
use std::time::Duration;

use task_emitter::contracts::RecordPolicy;
use task_emitter::source::TranslatorOptions;

pub const DEFAULT_DASHBOARD_URL: &str = "http://localhost:15672/#/queues";

/// emitter: publish the rows of a CSV file as durable RabbitMQ tasks
#[derive(Parser, Debug, Clone)]
#[command(name = "emitter", version)]
pub struct Cli {
    /// RabbitMQ host
    #[arg(long, env = "EMITTER_HOST", default_value = "localhost")]
    pub host: String,

    /// RabbitMQ AMQP port
    #[arg(long, env = "EMITTER_PORT", default_value_t = 5672)]
    pub port: u16,

    #[arg(long, env = "EMITTER_USERNAME", default_value = "guest")]
    pub username: String,

    #[arg(long, env = "EMITTER_PASSWORD", default_value = "guest", hide_env_values = true)]
    pub password: String,

    #[arg(long, env = "EMITTER_VHOST", default_value = "/")]
    pub vhost: String,

    /// Full amqp:// URL; overrides host, port, credentials and vhost
    #[arg(long, env = "EMITTER_BROKER_URL", hide_env_values = true)]
    pub broker_url: Option<String>,

    /// Durable queue the tasks are published to
    #[arg(short, long, env = "EMITTER_QUEUE", default_value = "task_queue3")]
    pub queue: String,

    /// Delimited input file, one task per line, no header row
    #[arg(short, long, env = "EMITTER_INPUT", default_value = "tasks.csv")]
    pub input: PathBuf,

    /// Field delimiter: a single ASCII character, or "tab"
    #[arg(long, default_value = ",")]
    pub delimiter: String,

    /// Placed between the fields of a row in the message body
    #[arg(long, default_value = " ")]
    pub separator: String,

    /// What to do with a malformed or unpublishable record: abort or skip
    #[arg(long, env = "EMITTER_ON_MALFORMED", default_value = "abort")]
    pub on_malformed: RecordPolicy,

    /// Treat rows with a different number of fields as malformed
    #[arg(long)]
    pub expected_fields: Option<usize>,

    #[arg(long, env = "EMITTER_CONNECT_TIMEOUT_SECS", default_value_t = 10)]
    pub connect_timeout_secs: u64,

    /// How long to wait for the broker to confirm each message
    #[arg(long, env = "EMITTER_PUBLISH_TIMEOUT_SECS", default_value_t = 10)]
    pub publish_timeout_secs: u64,

    /// Serve Prometheus metrics on this port while the run is in progress
    #[arg(long, env = "EMITTER_METRICS_PORT")]
    pub metrics_port: Option<u16>,

    /// Ask whether to open the RabbitMQ management UI before publishing
    #[arg(long)]
    pub offer_dashboard: bool,

    #[arg(long, default_value = DEFAULT_DASHBOARD_URL)]
    pub dashboard_url: String,

    /// Publish to an in-process broker instead of RabbitMQ
    #[arg(long)]
    pub dry_run: bool,

    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub log_level: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub broker_uri: AMQPUri,
    pub queue: String,
    pub input: PathBuf,
    pub translator: TranslatorOptions,
    pub policy: RecordPolicy,
    pub connect_timeout: Duration,
    pub publish_timeout: Duration,
    pub metrics_port: Option<u16>,
    pub dashboard_url: Option<String>,
    pub dry_run: bool,
    pub rust_log: String,
}

impl Config {
    pub fn from_cli(cli: Cli) -> Result<Self, ConfigError> {
        let broker_uri = match &cli.broker_url {
            Some(url) => url
                .parse::<AMQPUri>()
                .map_err(ConfigError::InvalidBrokerUrl)?,
            None => {
                let mut uri = AMQPUri::default();
                uri.authority.host = cli.host.clone();
                uri.authority.port = cli.port;
                uri.authority.userinfo.username = cli.username.clone();
                uri.authority.userinfo.password = cli.password.clone();
                uri.vhost = cli.vhost.clone();
                uri
            }
        };

        if cli.queue.trim().is_empty() {
            return Err(ConfigError::EmptyQueue);
        }

        if cli.expected_fields == Some(0) {
            return Err(ConfigError::Invalid("expected-fields must be at least 1"));
        }

        if cli.connect_timeout_secs == 0 {
            return Err(ConfigError::Invalid("connect-timeout-secs must be greater than 0"));
        }

        if cli.publish_timeout_secs == 0 {
            return Err(ConfigError::Invalid("publish-timeout-secs must be greater than 0"));
        }

        let translator = TranslatorOptions {
            delimiter: parse_delimiter(&cli.delimiter)?,
            separator: cli.separator,
            expected_fields: cli.expected_fields,
        };

        Ok(Self {
            broker_uri,
            queue: cli.queue,
            input: cli.input,
            translator,
            policy: cli.on_malformed,
            connect_timeout: Duration::from_secs(cli.connect_timeout_secs),
            publish_timeout: Duration::from_secs(cli.publish_timeout_secs),
            metrics_port: cli.metrics_port,
            dashboard_url: cli.offer_dashboard.then_some(cli.dashboard_url),
            dry_run: cli.dry_run,
            rust_log: cli.log_level,
        })
    }
}

fn parse_delimiter(raw: &str) -> Result<u8, ConfigError> {
    match raw {
        "tab" | "\\t" | "\t" => Ok(b'\t'),
        _ => match raw.as_bytes() {
            [byte] if byte.is_ascii() && *byte != b'\n' && *byte != b'\r' && *byte != b'"' => {
                Ok(*byte)
            }
            _ => Err(ConfigError::InvalidDelimiter(raw.to_string())),
        },
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),

    #[error("Delimiter must be a single ASCII character other than a quote or newline, got {0:?}")]
    InvalidDelimiter(String),

    #[error("Queue name must not be empty")]
    EmptyQueue,

    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}
