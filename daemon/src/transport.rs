//! Listener setup: derives the control socket path from the device path, probes for
//! an already-running daemon before binding, and copies the device's permissions onto
//! the socket so access control tracks whoever can already open the device.

use flux::logging::Logger;
use slog::{info, o, warn};
use std::fs;
use std::io;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

const SOCKET_PATH_PREFIX: &str = "vbiproxyd";

/// Longest symlink chain [`resolve_symlinks`] will follow before giving up and using
/// whatever path it last reached. Guards against a symlink loop hanging startup.
const MAX_SYMLINK_HOPS: usize = 100;

/// Follows symlinks in `path` up to [`MAX_SYMLINK_HOPS`] times, so two different
/// paths that alias the same device (e.g. `/dev/vbi0` and a udev-created
/// `/dev/v4l/by-id/...` symlink to it) resolve to the same control socket. Falls
/// back to the last path reached if the chain is longer than the hop limit or a
/// component along the way doesn't exist yet.
fn resolve_symlinks(path: &Path) -> PathBuf {
    let mut current = path.to_path_buf();
    for _ in 0..MAX_SYMLINK_HOPS {
        match fs::read_link(&current) {
            Ok(target) => {
                current = if target.is_absolute() {
                    target
                } else {
                    current
                        .parent()
                        .map(|parent| parent.join(&target))
                        .unwrap_or(target)
                };
            }
            Err(_) => break,
        }
    }
    current
}

/// Turns a device path like `/dev/vbi0` into a control socket path such as
/// `/tmp/vbiproxyd-dev-vbi0`, the same flattening scheme the original daemon uses so
/// two distinct devices never collide on one socket. Resolved through
/// [`resolve_symlinks`] first, so an aliased path collides with its target rather
/// than getting its own, separate socket.
pub fn socket_path(socket_dir: &Path, device: &Path) -> PathBuf {
    let resolved = resolve_symlinks(device);
    let flattened = resolved.to_string_lossy().replace('/', "-");
    let flattened = flattened.trim_start_matches('-');
    socket_dir.join(format!("{}-{}", SOCKET_PATH_PREFIX, flattened))
}

/// Tries to connect to a pre-existing socket at `path` before doing anything else.
/// A successful connect means another daemon instance already owns this device.
/// Any connect failure — not found, connection refused, or the path existing but not
/// being a socket at all (a stale leftover from an unclean shutdown) — means nobody
/// is home and it is safe to unlink and rebind.
pub fn probe_running_daemon(path: &Path) -> io::Result<bool> {
    Ok(UnixStream::connect(path).is_ok())
}

/// Binds the control socket, first removing a stale path if the bootstrap probe
/// found nobody home, then copies the device's file permissions onto it.
pub fn bind_socket(
    log: &Logger,
    socket_dir: &Path,
    device: &Path,
) -> io::Result<mio::net::UnixListener> {
    let path = socket_path(socket_dir, device);
    let log = log.new(o!("socket" => path.display().to_string()));

    if path.exists() {
        if probe_running_daemon(&path)? {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("a daemon is already listening on {}", path.display()),
            ));
        }
        info!(log, "removing stale socket");
        fs::remove_file(&path)?;
    }

    let listener = mio::net::UnixListener::bind(&path)?;
    match copy_device_permissions(&path, device) {
        Ok(()) => {}
        Err(err) => warn!(log, "could not copy device permissions onto socket"; "error" => %err),
    }
    info!(log, "listening");
    Ok(listener)
}

fn copy_device_permissions(socket: &Path, device: &Path) -> io::Result<()> {
    let meta = fs::metadata(device)?;
    fs::set_permissions(socket, meta.permissions())
}

/// Path to the pidfile written alongside a control socket, read back by `-kill`
/// (§4.9) to find the process to signal.
pub fn pidfile_path(socket: &Path) -> PathBuf {
    let mut name = socket.as_os_str().to_owned();
    name.push(".pid");
    PathBuf::from(name)
}

pub fn write_pidfile(path: &Path) -> io::Result<()> {
    fs::write(path, std::process::id().to_string())
}

pub fn read_pidfile(path: &Path) -> io::Result<i32> {
    let raw = fs::read_to_string(path)?;
    raw.trim()
        .parse()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "corrupt pidfile"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_path_flattens_device_path() {
        let path = socket_path(Path::new("/tmp"), Path::new("/dev/vbi0"));
        assert_eq!(path, PathBuf::from("/tmp/vbiproxyd-dev-vbi0"));
    }

    #[test]
    fn socket_path_resolves_an_aliased_symlink_to_its_target() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("real-device");
        fs::write(&target, b"").unwrap();
        let alias = dir.path().join("by-id-alias");
        std::os::unix::fs::symlink(&target, &alias).unwrap();

        assert_eq!(socket_path(dir.path(), &alias), socket_path(dir.path(), &target));
    }

    #[test]
    fn resolve_symlinks_terminates_on_a_self_referential_loop() {
        let dir = tempfile::tempdir().unwrap();
        let looped = dir.path().join("loop");
        std::os::unix::fs::symlink(&looped, &looped).unwrap();

        let resolved = resolve_symlinks(&looped);
        assert_eq!(resolved, looped);
    }

    #[test]
    fn probe_reports_false_for_missing_socket() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nothing-here");
        assert!(!probe_running_daemon(&missing).unwrap());
    }

    #[test]
    fn bind_socket_removes_stale_path_and_binds() {
        let dir = tempfile::tempdir().unwrap();
        let device = dir.path().join("fake-device");
        fs::write(&device, b"").unwrap();
        let stale = socket_path(dir.path(), &device);
        fs::write(&stale, b"not a socket").unwrap();

        let log = flux::logging::init(&flux::logging::LogConfig::default());
        let listener = bind_socket(&log, dir.path(), &device).expect("bind should succeed");
        drop(listener);
    }

    #[test]
    fn pidfile_round_trips_the_writing_process_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vbiproxyd-dev-vbi0.pid");
        write_pidfile(&path).unwrap();
        assert_eq!(read_pidfile(&path).unwrap(), std::process::id() as i32);
    }

    #[test]
    fn bind_socket_refuses_when_already_listening() {
        let dir = tempfile::tempdir().unwrap();
        let device = dir.path().join("fake-device");
        fs::write(&device, b"").unwrap();

        let log = flux::logging::init(&flux::logging::LogConfig::default());
        let first = bind_socket(&log, dir.path(), &device).unwrap();
        let err = bind_socket(&log, dir.path(), &device).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AddrInUse);
        drop(first);
    }
}
