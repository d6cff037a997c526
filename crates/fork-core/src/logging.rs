//! Logging setup for processes embedding the fork engine
//!
//! Besides its diagnostics, the engine writes one structured record per call
//! or message event (delivered, cancelled, accepted...) on two dedicated
//! targets. Those records are what an operator keeps in production, so they
//! have their own switch, independent of the diagnostic level:
//!
//! ```text
//! fork::call_log     one record per call event, from the call policy
//! fork::message_log  one record per delivery report, from the message policy
//! everything else    diagnostics, filtered by `level`
//! ```

use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::{EnvFilter, fmt};

use crate::errors::{ForkError, ForkResult};

/// Target of the call event records
pub const CALL_LOG_TARGET: &str = "fork::call_log";

/// Target of the message delivery records
pub const MESSAGE_LOG_TARGET: &str = "fork::message_log";

/// Configuration for the logging system
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Level of the engine diagnostics
    pub level: Level,
    /// Keep call and message event records, whatever `level` is
    pub event_log: bool,
    /// One JSON object per line, for log shippers
    pub json: bool,
    /// Include file and line information
    pub file_info: bool,
    /// Name of the embedding process, logged once at start-up
    pub app_name: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: Level::WARN,
            event_log: true,
            json: false,
            file_info: false,
            app_name: "rvoip-fork".to_string(),
        }
    }
}

impl LoggingConfig {
    pub fn new(level: Level, app_name: impl Into<String>) -> Self {
        LoggingConfig {
            level,
            app_name: app_name.into(),
            ..Default::default()
        }
    }

    pub fn with_json(mut self) -> Self {
        self.json = true;
        self
    }

    pub fn with_file_info(mut self) -> Self {
        self.file_info = true;
        self
    }

    /// Drop call and message event records
    pub fn without_event_log(mut self) -> Self {
        self.event_log = false;
        self
    }

    /// Filter directives, most general first
    pub fn directives(&self) -> Vec<String> {
        let event_level = if self.event_log {
            "info"
        } else {
            "off"
        };
        vec![
            self.level.to_string().to_lowercase(),
            format!("{}={}", CALL_LOG_TARGET, event_level),
            format!("{}={}", MESSAGE_LOG_TARGET, event_level),
        ]
    }

    /// Filter for these settings. `RUST_LOG` directives, when set, come last
    /// and win over the configured ones.
    pub fn env_filter(&self) -> ForkResult<EnvFilter> {
        let mut directives = self.directives();
        if let Ok(env) = std::env::var(EnvFilter::DEFAULT_ENV) {
            directives.extend(env.split(',').filter(|d| !d.trim().is_empty()).map(str::to_string));
        }
        EnvFilter::try_new(directives.join(","))
            .map_err(|e| ForkError::config(format!("invalid log filter: {}", e)))
    }
}

/// Install the global subscriber
pub fn setup_logging(config: LoggingConfig) -> ForkResult<()> {
    let builder = fmt::Subscriber::builder()
        .with_env_filter(config.env_filter()?)
        .with_file(config.file_info)
        .with_line_number(config.file_info);

    let installed = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    installed.map_err(|e| ForkError::config(format!("failed to install subscriber: {}", e)))?;
    tracing::info!(
        "Logging initialised for {} (event log {})",
        config.app_name,
        if config.event_log { "on" } else { "off" }
    );
    Ok(())
}

/// Parse a log level from a string
pub fn parse_log_level(level: &str) -> ForkResult<Level> {
    Level::from_str(level).map_err(|_| ForkError::config(format!("Invalid log level: {}", level)))
}
