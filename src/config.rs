use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Config file picked up from the working directory when no path is given.
const DEFAULT_CONFIG_FILE: &str = "monitor.yaml";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, env = "CONFIG_FILE")]
    pub config: Option<String>,

    /// Workflow run to observe (generated when absent)
    #[arg(long, env = "CORRELATION_ID")]
    pub correlation_id: Option<String>,

    /// Local workflow command whose stdout is the realtime event stream
    #[arg(long)]
    pub command: Option<String>,

    /// Arguments passed to `--command`
    #[arg(last = true)]
    pub command_args: Vec<String>,

    /// Store provider (`memory` or `jsonl`)
    #[arg(long, env = "STORE_PROVIDER")]
    pub store_provider: Option<String>,

    /// Path of the jsonl store file
    #[arg(long, env = "STORE_PATH")]
    pub store_path: Option<String>,

    /// Base poll interval in milliseconds
    #[arg(long, env = "POLL_INTERVAL_MS")]
    pub poll_interval_ms: Option<u64>,

    /// Emit JSON logs
    #[arg(long, env = "JSON_LOGS")]
    pub json_logs: Option<bool>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub store: StoreConfig,
    pub polling: PollingConfig,
    pub display: DisplayConfig,
    pub reporting: ReportingConfig,
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    pub provider: String,
    pub table_name: String,
    pub region: String,
    #[serde(default)]
    pub path: Option<String>,
    pub ttl_seconds: i64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PollingConfig {
    pub interval_ms: u64,
    pub backoff_ms: Vec<u64>,
    pub channel_capacity: usize,
}

impl PollingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn backoff_steps(&self) -> Vec<Duration> {
        self.backoff_ms
            .iter()
            .copied()
            .map(Duration::from_millis)
            .collect()
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_ms: 500,
            backoff_ms: vec![1_000, 2_000, 4_000, 8_000, 16_000, 30_000],
            channel_capacity: 256,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct DisplayConfig {
    /// Serialized payloads with more lines than this get a preview.
    pub payload_line_threshold: usize,
    pub payload_preview_lines: usize,
    pub error_preview_chars: usize,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            payload_line_threshold: 20,
            payload_preview_lines: 10,
            error_preview_chars: 100,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy)]
pub struct ReportingConfig {
    /// A tool counts as shared once this many actors used it.
    pub shared_tool_min_actors: usize,
}

impl Default for ReportingConfig {
    fn default() -> Self {
        Self {
            shared_tool_min_actors: 2,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy)]
pub struct TelemetryConfig {
    pub json_logs: bool,
}

impl AppConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        Self::load_from_args(std::env::args())
    }

    pub fn load_from_args<I, T>(args: I) -> Result<Self, config::ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let cli =
            Cli::try_parse_from(args).map_err(|e| config::ConfigError::Message(e.to_string()))?;
        Self::from_cli(&cli)
    }

    /// Layering: defaults < config file < `WFM_` environment < CLI flags.
    pub fn from_cli(cli: &Cli) -> Result<Self, config::ConfigError> {
        let polling = PollingConfig::default();
        let display = DisplayConfig::default();

        let mut builder = Config::builder()
            .set_default("store.provider", "memory")?
            .set_default("store.table_name", "workflow-events")?
            .set_default("store.region", "us-east-1")?
            .set_default("store.ttl_seconds", 7_200)?
            .set_default("polling.interval_ms", polling.interval_ms)?
            .set_default("polling.backoff_ms", polling.backoff_ms)?
            .set_default("polling.channel_capacity", polling.channel_capacity as u64)?
            .set_default(
                "display.payload_line_threshold",
                display.payload_line_threshold as u64,
            )?
            .set_default(
                "display.payload_preview_lines",
                display.payload_preview_lines as u64,
            )?
            .set_default("display.error_preview_chars", display.error_preview_chars as u64)?
            .set_default("reporting.shared_tool_min_actors", 2)?
            .set_default("telemetry.json_logs", false)?;

        match &cli.config {
            Some(path) => builder = builder.add_source(File::with_name(path)),
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                builder = builder.add_source(File::with_name(DEFAULT_CONFIG_FILE));
            }
            None => {}
        }

        // E.g. WFM_POLLING__INTERVAL_MS=250, WFM_POLLING__BACKOFF_MS=500,5000
        builder = builder.add_source(
            Environment::with_prefix("WFM")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("polling.backoff_ms")
                .try_parsing(true),
        );

        if let Some(provider) = &cli.store_provider {
            builder = builder.set_override("store.provider", provider.as_str())?;
        }
        if let Some(path) = &cli.store_path {
            builder = builder.set_override("store.path", path.as_str())?;
        }
        if let Some(interval) = cli.poll_interval_ms {
            builder = builder.set_override("polling.interval_ms", interval)?;
        }
        if let Some(json) = cli.json_logs {
            builder = builder.set_override("telemetry.json_logs", json)?;
        }

        let cfg: Self = builder.build()?.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), config::ConfigError> {
        if self.polling.interval_ms == 0 {
            return Err(config::ConfigError::Message(
                "polling.interval_ms must be positive".to_string(),
            ));
        }
        if self.polling.backoff_ms.is_empty() {
            return Err(config::ConfigError::Message(
                "polling.backoff_ms must not be empty".to_string(),
            ));
        }
        if self.polling.channel_capacity == 0 {
            return Err(config::ConfigError::Message(
                "polling.channel_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
