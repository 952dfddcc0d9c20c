//! CLI argument parsing and the optional TOML config file. Command line flags always
//! win over the config file, which in turn wins over the built-in defaults below —
//! the same precedence the original daemon's getopt-based argument parsing used.

use clap::{App, Arg};
use flux::logging::{LogConfig, LogLevel};
use serde_derive::{Deserialize, Serialize};
use std::path::PathBuf;
use vbiproto::message::Priority;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Path to the capture device, e.g. `/dev/vbi0`.
    pub device: PathBuf,
    /// Base directory the control socket path is derived from (§4.2).
    pub socket_dir: PathBuf,
    /// Optional TCP listener, `host:port`, in addition to the unix socket.
    pub tcp_listen: Option<String>,
    pub max_clients: usize,
    pub buffer_count: usize,
    pub default_priority: u32,
    pub log: LogConfig,
    /// Stay attached to the controlling terminal instead of daemonising (`-nodetach`).
    pub nodetach: bool,
    /// `-kill`: signal the already-running daemon for this device to shut down and
    /// exit, instead of starting a new one.
    pub kill: bool,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            device: PathBuf::from("/dev/vbi0"),
            socket_dir: PathBuf::from("/tmp"),
            tcp_listen: None,
            max_clients: 10,
            buffer_count: 8,
            default_priority: Priority::Interactive.to_wire(),
            log: LogConfig::default(),
            nodetach: false,
            kill: false,
        }
    }
}

fn parse_log_level(raw: &str) -> LogLevel {
    match raw.to_ascii_lowercase().as_str() {
        "trace" => LogLevel::Trace,
        "debug" => LogLevel::Debug,
        "info" => LogLevel::Info,
        "warning" | "warn" => LogLevel::Warning,
        "error" => LogLevel::Error,
        other => panic!("unrecognised log level {}", other),
    }
}

/// Normalises old-style single-dash, multi-letter flags (`-dev`, `-maxclients`, ...)
/// into the double-dash form `clap` expects, so the CLI surface can keep the
/// original daemon's getopt-style spelling without clap's own long-flag parsing
/// ever seeing the difference. True short flags (`-v`) and already-double-dash
/// flags pass through untouched.
fn normalize_args<I: IntoIterator<Item = String>>(args: I) -> Vec<String> {
    args.into_iter()
        .map(|arg| {
            if arg.starts_with('-') && !arg.starts_with("--") && arg.len() > 2 {
                format!("-{}", arg)
            } else {
                arg
            }
        })
        .collect()
}

impl Config {
    pub fn load_from_file(path: &std::path::Path) -> Result<Config, serdeconv::Error> {
        serdeconv::from_toml_file(path)
    }

    /// Parses CLI args, merges them over an optional `-config` TOML file, which is
    /// itself merged over [`Config::default`].
    pub fn from_args() -> Config {
        Config::from_args_iter(std::env::args())
    }

    fn from_args_iter<I: IntoIterator<Item = String>>(args: I) -> Config {
        let matches = App::new("vbiproxyd")
            .author("Bush Hammer Industries")
            .about("Arbitrates shared access to a VBI capture device")
            .arg(
                Arg::with_name("config")
                    .long("config")
                    .value_name("FILE")
                    .help("Load defaults from a TOML config file")
                    .takes_value(true),
            )
            .arg(
                Arg::with_name("dev")
                    .long("dev")
                    .value_name("PATH")
                    .help("Capture device path")
                    .takes_value(true),
            )
            .arg(
                Arg::with_name("socketdir")
                    .long("socketdir")
                    .value_name("DIR")
                    .help("Directory the control socket is created under")
                    .takes_value(true),
            )
            .arg(
                Arg::with_name("tcp")
                    .long("tcp")
                    .value_name("HOST:PORT")
                    .help("Also listen on this TCP address")
                    .takes_value(true),
            )
            .arg(
                Arg::with_name("maxclients")
                    .long("maxclients")
                    .value_name("N")
                    .help("Maximum concurrent client sessions")
                    .takes_value(true),
            )
            .arg(
                Arg::with_name("buffers")
                    .long("buffers")
                    .value_name("N")
                    .help("Number of frame buffer slots in the shared pool")
                    .takes_value(true),
            )
            .arg(
                Arg::with_name("nodetach")
                    .long("nodetach")
                    .help("Stay attached to the controlling terminal instead of daemonising"),
            )
            .arg(
                Arg::with_name("kill")
                    .long("kill")
                    .help("Signal the already-running daemon for this device to exit"),
            )
            .arg(
                Arg::with_name("debug")
                    .long("debug")
                    .value_name("LEVEL")
                    .help("trace|debug|info|warning|error, alias for -loglevel")
                    .takes_value(true),
            )
            .arg(
                Arg::with_name("loglevel")
                    .long("loglevel")
                    .value_name("LEVEL")
                    .help("trace|debug|info|warning|error")
                    .takes_value(true),
            )
            .arg(
                Arg::with_name("syslog")
                    .long("syslog")
                    .value_name("LEVEL")
                    .help("Log to the local syslog daemon at this level instead of stderr")
                    .takes_value(true),
            )
            .arg(
                Arg::with_name("logfile")
                    .long("logfile")
                    .value_name("PATH")
                    .help("Write logs to a file instead of stderr")
                    .takes_value(true),
            )
            .get_matches_from(normalize_args(args));

        let mut config = match matches.value_of("config") {
            Some(path) => Config::load_from_file(std::path::Path::new(path))
                .unwrap_or_else(|err| panic!("failed to read config file {}: {}", path, err)),
            None => Config::default(),
        };

        if let Some(device) = matches.value_of("dev") {
            config.device = PathBuf::from(device);
        }
        if let Some(dir) = matches.value_of("socketdir") {
            config.socket_dir = PathBuf::from(dir);
        }
        if let Some(tcp) = matches.value_of("tcp") {
            config.tcp_listen = Some(tcp.to_owned());
        }
        if let Some(max_clients) = matches.value_of("maxclients") {
            config.max_clients = max_clients
                .parse()
                .unwrap_or_else(|_| panic!("-maxclients expects an integer, got {}", max_clients));
        }
        if let Some(buffers) = matches.value_of("buffers") {
            config.buffer_count = buffers
                .parse()
                .unwrap_or_else(|_| panic!("-buffers expects an integer, got {}", buffers));
        }
        config.nodetach = matches.is_present("nodetach");
        config.kill = matches.is_present("kill");

        let level = matches
            .value_of("loglevel")
            .or_else(|| matches.value_of("debug"))
            .map(parse_log_level)
            .unwrap_or(LogLevel::Info);

        config.log = if let Some(level) = matches.value_of("syslog").map(parse_log_level) {
            LogConfig::Syslog { level }
        } else if let Some(path) = matches.value_of("logfile") {
            LogConfig::File {
                path: PathBuf::from(path),
                level,
            }
        } else {
            LogConfig::Terminal { level }
        };

        config
    }
}
