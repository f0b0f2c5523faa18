//! Logging setup.
//!
//! # Environment Variables
//!
//! - `COMMIT_MINER_LOG` - Log filter (overrides RUST_LOG)
//! - `COMMIT_MINER_LOG_FORMAT` - Output format: pretty, compact
//! - `RUST_LOG` - Standard Rust log filter (fallback)
//!
//! A filter derived from `-v`/`-q` on the command line wins over both.

use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    /// Human-readable multi-field format
    #[default]
    Pretty,
    /// Compact single-line format
    Compact,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" | "full" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            _ => Err(format!(
                "Unknown log format: '{}'. Valid options: pretty, compact",
                s
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Base log level (default: INFO)
    pub level: Level,
    pub format: LogFormat,
    /// Custom filter string (overrides level if set)
    pub filter: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Pretty,
            filter: None,
        }
    }
}

impl LogConfig {
    /// Level from CLI verbosity: each `-v` raises it one step, `-q` drops to errors only.
    pub fn from_verbosity(verbose: u8, quiet: bool) -> Self {
        let mut config = Self::default();
        if quiet {
            config.filter = Some("error".to_string());
        } else if verbose > 0 {
            let level = if verbose == 1 { "debug" } else { "trace" };
            config.filter = Some(level.to_string());
        }
        config
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Apply environment variable overrides. A filter already set from the
    /// CLI is kept.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    fn with_overrides_from<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if self.filter.is_none() {
            self.filter = lookup("COMMIT_MINER_LOG").or_else(|| lookup("RUST_LOG"));
        }
        if let Some(format) = lookup("COMMIT_MINER_LOG_FORMAT").and_then(|f| f.parse().ok()) {
            self.format = format;
        }
        self
    }

    fn build_filter(&self) -> EnvFilter {
        let fallback = || EnvFilter::new(self.level.to_string().to_lowercase());
        match &self.filter {
            Some(filter) => EnvFilter::try_new(filter).unwrap_or_else(|_| {
                eprintln!("Warning: Invalid log filter '{}', using default", filter);
                fallback()
            }),
            None => fallback(),
        }
    }
}

/// Install the global subscriber. Later calls are ignored.
pub fn init(config: LogConfig) {
    let filter = config.build_filter();
    let result = match config.format {
        LogFormat::Compact => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().compact().with_writer(std::io::stderr))
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init(),
    };
    let _ = result;
}
