//! Builds the process-wide root logger from CLI-supplied settings and hands out
//! contextual child loggers to every subsystem. Mirrors the original intent of
//! this module ("hook up config to the endpoint") but actually reads the config
//! instead of a hard-coded TOML literal.

pub use slog::{debug, error, info, o, trace, warn, Discard, Logger};

use serde_derive::{Deserialize, Serialize};
use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::types::Severity;
use sloggers::Build;
use std::path::PathBuf;

/// Where log output goes; selected by the `-nodetach` / `-logfile` / `-syslog` CLI flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LogConfig {
    /// Human-readable output to stderr, used when the daemon is run in the foreground.
    Terminal { level: LogLevel },
    /// Plain-text output appended to a file, used when daemonised without syslog.
    File { path: PathBuf, level: LogLevel },
    /// The local syslog daemon, used when daemonised with `-syslog`.
    Syslog { level: LogLevel },
}

impl Default for LogConfig {
    fn default() -> LogConfig {
        LogConfig::Terminal {
            level: LogLevel::Info,
        }
    }
}

#[derive(Debug, Copy, Clone, Serialize, Deserialize)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warning,
    Error,
}

impl From<LogLevel> for Severity {
    fn from(level: LogLevel) -> Severity {
        match level {
            LogLevel::Trace => Severity::Trace,
            LogLevel::Debug => Severity::Debug,
            LogLevel::Info => Severity::Info,
            LogLevel::Warning => Severity::Warning,
            LogLevel::Error => Severity::Error,
        }
    }
}

/// Builds the root logger. File-backed logging falls back to a terminal logger
/// (with a warning emitted once the logger itself exists) if the file cannot be
/// opened, since a daemon should never fail to start over a logging sink.
pub fn init(config: &LogConfig) -> Logger {
    match config {
        LogConfig::Terminal { level } => build_terminal(*level),
        LogConfig::File { path, level } => match sloggers::file::FileLoggerBuilder::new(path)
            .level((*level).into())
            .build()
        {
            Ok(drain) => Logger::root(drain, o!()),
            Err(err) => {
                let log = build_terminal(*level);
                warn!(log, "falling back to terminal logging"; "context" => "logging::init", "path" => ?path, "error" => %err);
                log
            }
        },
        LogConfig::Syslog { level } => match sloggers::syslog::SyslogBuilder::new().level((*level).into()).build() {
            Ok(drain) => Logger::root(drain, o!()),
            Err(err) => {
                let log = build_terminal(*level);
                warn!(log, "falling back to terminal logging"; "context" => "logging::init", "destination" => "syslog", "error" => %err);
                log
            }
        },
    }
}

fn build_terminal(level: LogLevel) -> Logger {
    let mut builder = TerminalLoggerBuilder::new();
    builder.level(level.into());
    builder.destination(Destination::Stderr);

    match builder.build() {
        Ok(drain) => Logger::root(drain, o!()),
        Err(_) => Logger::root(Discard, o!()),
    }
}
