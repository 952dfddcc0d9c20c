use slog::{error, info, o};
use vbiproxyd::capture::{Capabilities, CaptureSource, ThreadedCaptureSource};
use vbiproxyd::config::Config;
use vbiproxyd::{server, transport};
use std::fs::File;
use std::io::Read;
use vbiproto::message::SlicedIndication;
use vbiproto::ProtoError;

fn main() {
    let config = Config::from_args();
    let log = flux::logging::init(&config.log);

    if config.kill {
        std::process::exit(run_kill(&log, &config));
    }

    if let Err(err) = run(&log, &config) {
        error!(log, "daemon exited with error"; "error" => %err);
        std::process::exit(1);
    }
}

fn run(log: &flux::logging::Logger, config: &Config) -> std::io::Result<()> {
    let device_log = log.new(o!("device" => config.device.display().to_string()));
    info!(device_log, "starting");

    let listener = transport::bind_socket(&device_log, &config.socket_dir, &config.device)?;
    let socket = transport::socket_path(&config.socket_dir, &config.device);
    transport::write_pidfile(&transport::pidfile_path(&socket))?;
    let capture_factory = capture_factory(config.device.clone());

    let mut server = server::Server::new(device_log, listener, capture_factory, config)?;
    server.run()
}

/// `-kill`: reads the pidfile left by the running daemon for this device, sends it
/// `SIGTERM`, and waits for its control socket to stop answering. Returns the
/// process exit code: 0 once the daemon is confirmed gone, 1 if no daemon appears to
/// be running, 2 if it doesn't exit before the timeout (§4.9).
fn run_kill(log: &flux::logging::Logger, config: &Config) -> i32 {
    let socket = transport::socket_path(&config.socket_dir, &config.device);
    let pidfile = transport::pidfile_path(&socket);

    let pid = match transport::read_pidfile(&pidfile) {
        Ok(pid) => pid,
        Err(err) => {
            error!(log, "no running daemon to kill"; "pidfile" => pidfile.display().to_string(), "error" => %err);
            return 1;
        }
    };

    unsafe {
        libc::kill(pid, libc::SIGTERM);
    }

    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    while std::time::Instant::now() < deadline {
        if matches!(transport::probe_running_daemon(&socket), Ok(false)) {
            info!(log, "daemon exited"; "pid" => pid);
            return 0;
        }
        std::thread::sleep(std::time::Duration::from_millis(100));
    }

    error!(log, "daemon did not exit before timeout"; "pid" => pid);
    2
}

/// Builds the closure the server calls to open the capture device, the first time
/// (and every time after) a client's granted service mask goes from empty to
/// non-empty, rather than opening it unconditionally at startup (§3, §4.5).
fn capture_factory(device: std::path::PathBuf) -> server::CaptureFactory {
    Box::new(move || -> std::io::Result<Box<dyn CaptureSource>> {
        let mut file = File::open(&device)?;
        let source = ThreadedCaptureSource::spawn(Capabilities::SLICED_SAMPLES, move || {
            let mut header = [0u8; 8];
            match file.read_exact(&mut header) {
                Ok(()) => Ok(SlicedIndication {
                    timestamp: flux::time::timestamp_f64(),
                    lines: Vec::new(),
                    raw: None,
                }),
                Err(err) => Err(ProtoError::from(err)),
            }
        });
        Ok(Box::new(source))
    })
}
