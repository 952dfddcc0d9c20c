//! Drives a real `Server` over an actual unix domain socket, using `SimCaptureSource`
//! in place of a hardware device. Exercises the handshake and a service negotiation
//! end to end.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream as StdUnixStream;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use vbiproto::message::{ConnectRequest, Message, ServiceRequest, SlicedIndication, SlicedLine};
use vbiproto::{magic, Header, ProtoResult, Services, Strictness, HEADER_SIZE};
use vbiproxyd::capture::{Capabilities, CaptureSource, SimCaptureSource};
use vbiproxyd::config::Config;
use vbiproxyd::{server, transport};

/// Lets a test keep a handle to the `SimCaptureSource` the server opens lazily, by
/// sharing it behind a mutex instead of handing the server sole ownership.
#[derive(Clone)]
struct SharedCapture(Arc<Mutex<SimCaptureSource>>);

impl CaptureSource for SharedCapture {
    fn capabilities(&self) -> Capabilities {
        self.0.lock().unwrap().capabilities()
    }

    fn set_services(&mut self, services: Services) -> ProtoResult<Services> {
        self.0.lock().unwrap().set_services(services)
    }

    fn try_read(&mut self) -> ProtoResult<SlicedIndication> {
        self.0.lock().unwrap().try_read()
    }
}

fn send(stream: &mut StdUnixStream, msg: Message) {
    stream.write_all(&msg.encode()).unwrap();
}

fn recv(stream: &mut StdUnixStream) -> Message {
    let mut header_buf = [0u8; HEADER_SIZE];
    stream.read_exact(&mut header_buf).unwrap();
    let header = Header::decode(&header_buf).unwrap();
    let mut body = vec![0u8; header.body_len as usize];
    stream.read_exact(&mut body).unwrap();
    Message::decode(header, &body).unwrap()
}

fn connect_request(client_name: &str) -> ConnectRequest {
    ConnectRequest {
        magic: *magic::MAGIC_STR,
        endian_magic: magic::ENDIAN_MAGIC,
        version: magic::VERSION,
        pid: std::process::id(),
        flags: 0,
        scanning: 0,
        buffer_count: 4,
        initial_services: Services::empty(),
        initial_strictness: 0,
        client_name: client_name.to_owned(),
        device_name: "/dev/vbi0".to_owned(),
    }
}

fn spawn_server(dir: &std::path::Path) -> (server::Server, std::path::PathBuf) {
    let device = dir.join("fake-device");
    std::fs::write(&device, b"").unwrap();

    let log = flux::logging::init(&flux::logging::LogConfig::default());
    let listener = transport::bind_socket(&log, dir, &device).unwrap();
    let socket_path = transport::socket_path(dir, &device);

    let mut config = Config::default();
    config.device = device;
    config.buffer_count = 4;

    let capture_factory: server::CaptureFactory =
        Box::new(|| Ok(Box::new(SimCaptureSource::new()) as Box<dyn CaptureSource>));
    let server = server::Server::new(log, listener, capture_factory, &config).unwrap();
    (server, socket_path)
}

/// Same as [`spawn_server`], but hands back a shared handle to the simulated capture
/// source so a test can push frames into whatever instance the server's lazy-open
/// lifecycle ends up creating.
fn spawn_server_with_shared_capture(
    dir: &std::path::Path,
) -> (server::Server, std::path::PathBuf, Arc<Mutex<SimCaptureSource>>) {
    let device = dir.join("fake-device");
    std::fs::write(&device, b"").unwrap();

    let log = flux::logging::init(&flux::logging::LogConfig::default());
    let listener = transport::bind_socket(&log, dir, &device).unwrap();
    let socket_path = transport::socket_path(dir, &device);

    let mut config = Config::default();
    config.device = device;
    config.buffer_count = 4;

    let shared = Arc::new(Mutex::new(SimCaptureSource::new()));
    let factory_handle = shared.clone();
    let capture_factory: server::CaptureFactory =
        Box::new(move || Ok(Box::new(SharedCapture(factory_handle.clone())) as Box<dyn CaptureSource>));
    let server = server::Server::new(log, listener, capture_factory, &config).unwrap();
    (server, socket_path, shared)
}

fn connect_and_confirm(client: &mut StdUnixStream, server: &mut server::Server, name: &str) {
    send(client, Message::ConnectReq(connect_request(name)));
    server.poll_once(Duration::from_millis(50)).unwrap();
    match recv(client) {
        Message::ConnectCnf(_) => {}
        other => panic!("expected ConnectCnf, got {:?}", other),
    }
}

#[test]
fn handshake_and_service_negotiation() {
    let dir = tempfile::tempdir().unwrap();
    let (mut server, socket_path) = spawn_server(dir.path());

    let mut client = StdUnixStream::connect(&socket_path).unwrap();
    server.poll_once(Duration::from_millis(50)).unwrap();

    send(&mut client, Message::ConnectReq(connect_request("integration-test")));
    server.poll_once(Duration::from_millis(50)).unwrap();
    match recv(&mut client) {
        Message::ConnectCnf(_) => {}
        other => panic!("expected ConnectCnf, got {:?}", other),
    }

    send(
        &mut client,
        Message::ServiceReq(ServiceRequest {
            services: Services::TELETEXT_B,
            strictness: Strictness::default(),
            commit: true,
        }),
    );
    server.poll_once(Duration::from_millis(50)).unwrap();
    match recv(&mut client) {
        Message::ServiceCnf(cnf) => assert_eq!(cnf.granted, Services::TELETEXT_B),
        other => panic!("expected ServiceCnf, got {:?}", other),
    }

    assert_eq!(server.client_count(), 1);
}

#[test]
fn rejects_connect_with_bad_magic() {
    let dir = tempfile::tempdir().unwrap();
    let (mut server, socket_path) = spawn_server(dir.path());

    let mut client = StdUnixStream::connect(&socket_path).unwrap();
    server.poll_once(Duration::from_millis(50)).unwrap();

    send(
        &mut client,
        Message::ConnectReq(ConnectRequest {
            magic: [0u8; magic::MAGIC_LEN],
            ..connect_request("bad-client")
        }),
    );
    server.poll_once(Duration::from_millis(50)).unwrap();
    match recv(&mut client) {
        Message::ConnectRej(_) => {}
        other => panic!("expected ConnectRej, got {:?}", other),
    }
}

#[test]
fn rejects_connect_with_incompatible_version() {
    let dir = tempfile::tempdir().unwrap();
    let (mut server, socket_path) = spawn_server(dir.path());

    let mut client = StdUnixStream::connect(&socket_path).unwrap();
    server.poll_once(Duration::from_millis(50)).unwrap();

    send(
        &mut client,
        Message::ConnectReq(ConnectRequest {
            version: 0xffff_0000,
            ..connect_request("future-client")
        }),
    );
    server.poll_once(Duration::from_millis(50)).unwrap();
    match recv(&mut client) {
        Message::ConnectRej(_) => {}
        other => panic!("expected ConnectRej, got {:?}", other),
    }
}

#[test]
fn service_confirm_reports_the_clients_own_grant_not_the_global_union() {
    let dir = tempfile::tempdir().unwrap();
    let (mut server, socket_path) = spawn_server(dir.path());

    let mut teletext_client = StdUnixStream::connect(&socket_path).unwrap();
    server.poll_once(Duration::from_millis(50)).unwrap();
    connect_and_confirm(&mut teletext_client, &mut server, "teletext-client");

    let mut vps_client = StdUnixStream::connect(&socket_path).unwrap();
    server.poll_once(Duration::from_millis(50)).unwrap();
    connect_and_confirm(&mut vps_client, &mut server, "vps-client");

    send(
        &mut teletext_client,
        Message::ServiceReq(ServiceRequest {
            services: Services::TELETEXT_B,
            strictness: Strictness::default(),
            commit: true,
        }),
    );
    server.poll_once(Duration::from_millis(50)).unwrap();
    match recv(&mut teletext_client) {
        Message::ServiceCnf(cnf) => assert_eq!(cnf.granted, Services::TELETEXT_B),
        other => panic!("expected ServiceCnf, got {:?}", other),
    }

    send(
        &mut vps_client,
        Message::ServiceReq(ServiceRequest {
            services: Services::VPS,
            strictness: Strictness::default(),
            commit: true,
        }),
    );
    server.poll_once(Duration::from_millis(50)).unwrap();
    match recv(&mut vps_client) {
        // Each client's confirm must report its own request, not the
        // TELETEXT_B | VPS union the daemon now has open on the device.
        Message::ServiceCnf(cnf) => assert_eq!(cnf.granted, Services::VPS),
        other => panic!("expected ServiceCnf, got {:?}", other),
    }
}

#[test]
fn services_are_filtered_per_client_effective_mask() {
    let dir = tempfile::tempdir().unwrap();
    let (mut server, socket_path, capture) = spawn_server_with_shared_capture(dir.path());

    let mut teletext_client = StdUnixStream::connect(&socket_path).unwrap();
    server.poll_once(Duration::from_millis(50)).unwrap();
    connect_and_confirm(&mut teletext_client, &mut server, "teletext-client");

    let mut vps_client = StdUnixStream::connect(&socket_path).unwrap();
    server.poll_once(Duration::from_millis(50)).unwrap();
    connect_and_confirm(&mut vps_client, &mut server, "vps-client");

    send(
        &mut teletext_client,
        Message::ServiceReq(ServiceRequest {
            services: Services::TELETEXT_B,
            strictness: Strictness::default(),
            commit: true,
        }),
    );
    server.poll_once(Duration::from_millis(50)).unwrap();
    recv(&mut teletext_client); // ServiceCnf

    send(
        &mut vps_client,
        Message::ServiceReq(ServiceRequest {
            services: Services::VPS,
            strictness: Strictness::default(),
            commit: true,
        }),
    );
    server.poll_once(Duration::from_millis(50)).unwrap();
    recv(&mut vps_client); // ServiceCnf

    capture.lock().unwrap().push_frame(SlicedIndication {
        timestamp: 1.0,
        lines: vec![
            SlicedLine {
                id: Services::TELETEXT_B,
                line: 10,
                data: vec![0u8; 8],
            },
            SlicedLine {
                id: Services::VPS,
                line: 16,
                data: vec![1u8; 8],
            },
        ],
        raw: None,
    });
    server.poll_once(Duration::from_millis(50)).unwrap();

    match recv(&mut teletext_client) {
        Message::SlicedInd(ind) => {
            assert_eq!(ind.lines.len(), 1);
            assert_eq!(ind.lines[0].id, Services::TELETEXT_B);
        }
        other => panic!("expected SlicedInd, got {:?}", other),
    }

    match recv(&mut vps_client) {
        Message::SlicedInd(ind) => {
            assert_eq!(ind.lines.len(), 1);
            assert_eq!(ind.lines[0].id, Services::VPS);
        }
        other => panic!("expected SlicedInd, got {:?}", other),
    }
}

#[test]
fn token_req_queues_then_grants_on_holder_disconnect() {
    let dir = tempfile::tempdir().unwrap();
    let (mut server, socket_path) = spawn_server(dir.path());

    let mut holder = StdUnixStream::connect(&socket_path).unwrap();
    server.poll_once(Duration::from_millis(50)).unwrap();
    connect_and_confirm(&mut holder, &mut server, "token-holder");

    let mut waiter = StdUnixStream::connect(&socket_path).unwrap();
    server.poll_once(Duration::from_millis(50)).unwrap();
    connect_and_confirm(&mut waiter, &mut server, "token-waiter");

    send(&mut holder, Message::ChnTokenReq);
    server.poll_once(Duration::from_millis(50)).unwrap();
    match recv(&mut holder) {
        Message::ChnTokenCnf => {}
        other => panic!("expected ChnTokenCnf, got {:?}", other),
    }

    // Same priority as the holder, so this is queued rather than triggering a
    // reclaim; nothing should be waiting on the read yet.
    send(&mut waiter, Message::ChnTokenReq);
    server.poll_once(Duration::from_millis(50)).unwrap();

    send(&mut holder, Message::CloseReq);
    server.poll_once(Duration::from_millis(50)).unwrap();

    match recv(&mut waiter) {
        Message::ChnTokenInd(ind) => assert!(ind.token_id > 0),
        other => panic!("expected ChnTokenInd, got {:?}", other),
    }

    assert_eq!(server.client_count(), 1);
}
