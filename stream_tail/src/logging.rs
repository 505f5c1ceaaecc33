//! Common CLI flags for logging.

use std::{fmt::Display, str::FromStr};

use tracing_subscriber::{EnvFilter, filter::ParseError};

#[derive(Debug, thiserror::Error)]
pub(crate) enum Error {
    #[error("invalid log filter '{filter}': {source}")]
    InvalidFilter { filter: String, source: ParseError },

    #[error("failed to install the log subscriber: {0}")]
    Install(Box<dyn std::error::Error + Send + Sync>),
}

/// Log line format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LogFormat {
    Full,
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "full" => Ok(Self::Full),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!(
                "Invalid log format '{s}'. Valid options: full, pretty, json"
            )),
        }
    }
}

impl Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Full => write!(f, "full"),
            Self::Pretty => write!(f, "pretty"),
            Self::Json => write!(f, "json"),
        }
    }
}

/// CLI config for the logging related subset of options.
#[derive(Debug, Clone, clap::Parser)]
pub(crate) struct LoggingConfig {
    /// Logs: filter directive
    ///
    /// Configures log severity level filter, by target.
    ///
    /// Simplest options: error, warn, info, debug, trace
    ///
    /// Levels for different modules can be specified. For example
    /// `debug,stream_tailer::reader=info` specifies debug logging for all modules
    /// except for the reader, which will only display info level logging.
    ///
    /// Overridden by `-v`.
    #[clap(long = "log-filter", env = "LOG_FILTER", action)]
    pub(crate) log_filter: Option<String>,

    /// Logs: filter short-hand
    ///
    /// Convenient way to set log severity level filter.
    /// Overrides `--log-filter`.
    ///
    /// -v   'info'
    ///
    /// -vv  'debug'
    ///
    /// -vvv 'trace'
    #[clap(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub(crate) log_verbose_count: u8,

    /// Logs: message format
    ///
    /// Can be one of: full, pretty, json
    #[clap(long = "log-format", env = "LOG_FORMAT", default_value = "full", action)]
    pub(crate) log_format: LogFormat,
}

impl LoggingConfig {
    pub(crate) const DEFAULT_LOG_FILTER: &'static str = "warn";

    /// The filter directive in effect, `-v` wins over `--log-filter`.
    pub(crate) fn filter_directive(&self) -> &str {
        match self.log_verbose_count {
            0 => self
                .log_filter
                .as_deref()
                .unwrap_or(Self::DEFAULT_LOG_FILTER),
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    }

    pub(crate) fn env_filter(&self) -> Result<EnvFilter, Error> {
        let filter = self.filter_directive();
        EnvFilter::try_new(filter).map_err(|source| Error::InvalidFilter {
            filter: filter.to_string(),
            source,
        })
    }

    /// Install the global log subscriber. Logs go to stderr, stdout is left to the command.
    pub(crate) fn install_global_subscriber(&self) -> Result<(), Error> {
        let builder = tracing_subscriber::fmt()
            .with_env_filter(self.env_filter()?)
            .with_writer(std::io::stderr);

        match self.log_format {
            LogFormat::Full => builder.try_init(),
            LogFormat::Pretty => builder.pretty().try_init(),
            LogFormat::Json => builder.json().try_init(),
        }
        .map_err(Error::Install)
    }
}
