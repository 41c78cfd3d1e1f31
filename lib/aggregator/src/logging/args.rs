use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::filter::{Directive, LevelFilter};

/// Output format emitted to the terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
#[clap(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable, single-line logs.
    Full,
    /// Like full, but with additional details.
    Pretty,
    /// Newline-delimited JSON.
    Json,
    /// Only the essential information.
    Compact,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
#[clap(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warning,
    Error,
}

impl From<LogLevel> for Directive {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Self::from(LevelFilter::TRACE),
            LogLevel::Debug => Self::from(LevelFilter::DEBUG),
            LogLevel::Info => Self::from(LevelFilter::INFO),
            LogLevel::Warning => Self::from(LevelFilter::WARN),
            LogLevel::Error => Self::from(LevelFilter::ERROR),
        }
    }
}

/// Arguments for the logging setup, shared by all subcommands.
#[derive(Debug, Parser)]
pub struct LoggingArgs {
    /// Log format used for output to stderr.
    #[clap(long, default_value = "full", value_enum, env = "AGGREGATOR_LOG_FORMAT")]
    pub log_format: LogFormat,

    /// Logging verbosity; falls back to `RUST_LOG` when unset.
    #[clap(long, value_enum, env = "AGGREGATOR_LOG_LEVEL")]
    pub log_level: Option<LogLevel>,

    /// Folder the JSON log file is written to.
    #[clap(long, default_value = "./logs", env = "AGGREGATOR_LOG_FOLDER")]
    pub log_folder: PathBuf,

    /// File name prefix of the JSON log file.
    #[clap(long, default_value = "out")]
    pub log_file_prefix: String,
}
