//! Configuration: generator definitions, runtime settings and logging.

/// Definition records and parse outcomes.
pub mod definition;
/// JSON definitions loader.
pub mod loader;

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::EnvFilter;

pub use definition::{GeneratorCategory, GeneratorDefinition, Param, ParamType, ParseOutcome};
pub use loader::{load_definitions, parse_definitions};

pub use crate::dispatcher::DispatcherConfig;
pub use crate::matcher::MatcherConfig;

use crate::error::{ConfigError, FileError, PerceptionError, PerceptionResult};

/// Log output format.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default level when `RUST_LOG` is unset.
    pub level: String,
    /// Output format.
    pub format: LogFormat,
    /// ANSI colours (pretty and compact only).
    pub colors: bool,
    /// Include file and line.
    pub source_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            colors: true,
            source_location: false,
        }
    }
}

/// Runtime settings of the whole pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerceptionConfig {
    /// Queues and backlog alerts.
    pub dispatcher: DispatcherConfig,
    /// Logging.
    pub logging: LoggingConfig,
    /// Matcher limits.
    pub matcher: MatcherConfig,
}

impl PerceptionConfig {
    /// Parses settings from JSON. Missing keys take their defaults.
    pub fn from_json(text: &str) -> PerceptionResult<Self> {
        serde_json::from_str(text).map_err(|e| {
            PerceptionError::Config(ConfigError::InvalidStructure {
                reason: format!("invalid runtime configuration: {e}"),
            })
        })
    }

    /// Reads settings from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> PerceptionResult<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| {
            PerceptionError::File(if e.kind() == std::io::ErrorKind::NotFound {
                FileError::NotFound {
                    path: path.to_path_buf(),
                }
            } else {
                FileError::Unreadable {
                    path: path.to_path_buf(),
                    message: e.to_string(),
                }
            })
        })?;
        Self::from_json(&text)
    }
}

/// Installs the global tracing subscriber.
///
/// `RUST_LOG` overrides `config.level`. Fails if a global subscriber is
/// already set.
pub fn init_logging(config: &LoggingConfig) -> PerceptionResult<()> {
    let level_filter = match config.level.to_lowercase().as_str() {
        "trace" => tracing::level_filters::LevelFilter::TRACE,
        "debug" => tracing::level_filters::LevelFilter::DEBUG,
        "warn" => tracing::level_filters::LevelFilter::WARN,
        "error" => tracing::level_filters::LevelFilter::ERROR,
        "off" => tracing::level_filters::LevelFilter::OFF,
        _ => tracing::level_filters::LevelFilter::INFO,
    };

    let env_filter = EnvFilter::builder()
        .with_default_directive(level_filter.into())
        .from_env_lossy();

    let installed = match config.format {
        LogFormat::Json => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location)
                    .with_thread_names(true),
            );
            tracing::subscriber::set_global_default(subscriber)
        }
        LogFormat::Compact => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                fmt::layer()
                    .compact()
                    .with_ansi(config.colors)
                    .with_target(true)
                    .with_thread_names(true),
            );
            tracing::subscriber::set_global_default(subscriber)
        }
        LogFormat::Pretty => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                fmt::layer()
                    .pretty()
                    .with_ansi(config.colors)
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location)
                    .with_thread_names(true),
            );
            tracing::subscriber::set_global_default(subscriber)
        }
    };
    installed.map_err(|e| PerceptionError::internal(format!("failed to set logger: {e}")))?;

    info!(
        target: "perception::config",
        level = %config.level,
        format = ?config.format,
        "logging initialized"
    );
    Ok(())
}
