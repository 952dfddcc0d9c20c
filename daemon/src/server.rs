//! The single-threaded `mio` event loop. Owns every connection's byte buffers, the
//! frame pool, the service aggregator, and the token scheduler, and is the only
//! place any of those are mutated — every other module is plain data and logic with
//! no knowledge of sockets.

use crate::aggregator::{ClientId as AggClientId, ServiceAggregator};
use crate::capture::CaptureSource;
use crate::client::{ioctl_is_permitted, ClientFlags, ClientSession};
use crate::config::Config;
use crate::pool::FramePool;
use crate::scheduler::{ClientId as SchedClientId, TokenScheduler};
use flux::logging::Logger;
use mio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use mio::{Events, Evented, Poll, PollOpt, Ready, Token};
use slog::{debug, info, warn};
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::time::Duration;
use vbiproto::message::{
    ChnNotifyRequest, ChnTokenIndication, ConnectConfirm, ConnectReject, Message, Priority,
    ServiceConfirm, SlicedIndication,
};
use vbiproto::{Buffer, ErrorKind, Header, ProtoError, Services, Strictness, HEADER_SIZE};

const LISTENER_TOKEN: Token = Token(0);
const TCP_LISTENER_TOKEN: Token = Token(1);
const FIRST_CLIENT_TOKEN: Token = Token(2);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);
const BUFFER_SIZE: usize = 65536;

/// Builds (or rebuilds) the capture source lazily, on demand, so the underlying
/// device handle is only ever held open while at least one client has a non-empty
/// granted service mask (§3, §4.5).
pub type CaptureFactory = Box<dyn FnMut() -> io::Result<Box<dyn CaptureSource>>>;

/// Either side of the control surface a client can reach the daemon through: the
/// always-present unix socket, or the optional TCP listener (§4.2, `-tcp`). Both
/// carry the identical wire protocol; only the transport differs.
enum ClientStream {
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl Read for ClientStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            ClientStream::Unix(s) => s.read(buf),
            ClientStream::Tcp(s) => s.read(buf),
        }
    }
}

impl Write for ClientStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            ClientStream::Unix(s) => s.write(buf),
            ClientStream::Tcp(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            ClientStream::Unix(s) => s.flush(),
            ClientStream::Tcp(s) => s.flush(),
        }
    }
}

impl Evented for ClientStream {
    fn register(&self, poll: &Poll, token: Token, interest: Ready, opts: PollOpt) -> io::Result<()> {
        match self {
            ClientStream::Unix(s) => s.register(poll, token, interest, opts),
            ClientStream::Tcp(s) => s.register(poll, token, interest, opts),
        }
    }

    fn reregister(&self, poll: &Poll, token: Token, interest: Ready, opts: PollOpt) -> io::Result<()> {
        match self {
            ClientStream::Unix(s) => s.reregister(poll, token, interest, opts),
            ClientStream::Tcp(s) => s.reregister(poll, token, interest, opts),
        }
    }

    fn deregister(&self, poll: &Poll) -> io::Result<()> {
        match self {
            ClientStream::Unix(s) => s.deregister(poll),
            ClientStream::Tcp(s) => s.deregister(poll),
        }
    }
}

struct Connection {
    stream: ClientStream,
    ingress: Buffer,
    egress: Buffer,
    session: ClientSession,
    writable_interest: bool,
}

/// Runs the daemon until the process receives a shutdown signal (driven externally
/// by whatever calls [`Server::run`] in a loop; tests instead call
/// [`Server::poll_once`] directly a fixed number of times).
pub struct Server {
    log: Logger,
    poll: Poll,
    listener: UnixListener,
    tcp_listener: Option<TcpListener>,
    capture: Option<Box<dyn CaptureSource>>,
    capture_factory: CaptureFactory,
    pool: FramePool,
    aggregator: ServiceAggregator,
    scheduler: TokenScheduler,
    connections: HashMap<Token, Connection>,
    next_token: usize,
}

impl Server {
    pub fn new(
        log: Logger,
        listener: UnixListener,
        capture_factory: CaptureFactory,
        config: &Config,
    ) -> std::io::Result<Server> {
        let poll = Poll::new()?;
        poll.register(&listener, LISTENER_TOKEN, Ready::readable(), PollOpt::edge())?;

        let tcp_listener = match &config.tcp_listen {
            Some(addr_str) => {
                let addr: std::net::SocketAddr = addr_str.parse().map_err(|err| {
                    io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("invalid --tcp-listen address {}: {}", addr_str, err),
                    )
                })?;
                let tcp = TcpListener::bind(&addr)?;
                poll.register(&tcp, TCP_LISTENER_TOKEN, Ready::readable(), PollOpt::edge())?;
                info!(log, "also listening on tcp"; "addr" => addr_str);
                Some(tcp)
            }
            None => None,
        };

        Ok(Server {
            log,
            poll,
            listener,
            tcp_listener,
            capture: None,
            capture_factory,
            pool: FramePool::new(config.buffer_count),
            aggregator: ServiceAggregator::new(vbiproto::ScanningSystem::Unknown),
            scheduler: TokenScheduler::new(),
            connections: HashMap::new(),
            next_token: FIRST_CLIENT_TOKEN.0,
        })
    }

    pub fn run(&mut self) -> std::io::Result<()> {
        loop {
            self.poll_once(Duration::from_millis(200))?;
        }
    }

    /// Runs a single poll/dispatch cycle. Exposed separately so tests can step the
    /// loop deterministically instead of running it forever.
    pub fn poll_once(&mut self, timeout: Duration) -> std::io::Result<()> {
        let mut events = Events::with_capacity(128);
        self.poll.poll(&mut events, Some(timeout))?;

        for event in events.iter() {
            if event.token() == LISTENER_TOKEN {
                self.accept_all_unix()?;
            } else if event.token() == TCP_LISTENER_TOKEN {
                self.accept_all_tcp()?;
            } else if event.readiness().is_readable() {
                self.readable(event.token());
            } else if event.readiness().is_writable() {
                self.writable(event.token());
            }
        }

        self.pump_capture();
        self.reap_idle_clients();
        Ok(())
    }

    fn accept_all_unix(&mut self) -> std::io::Result<()> {
        loop {
            match self.listener.accept() {
                Ok((stream, _addr)) => self.accept_one(ClientStream::Unix(stream))?,
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
                Err(err) => return Err(err),
            }
        }
    }

    fn accept_all_tcp(&mut self) -> std::io::Result<()> {
        loop {
            let accepted = match &self.tcp_listener {
                Some(listener) => listener.accept(),
                None => return Ok(()),
            };
            match accepted {
                Ok((stream, _addr)) => self.accept_one(ClientStream::Tcp(stream))?,
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
                Err(err) => return Err(err),
            }
        }
    }

    fn accept_one(&mut self, stream: ClientStream) -> std::io::Result<()> {
        let token = Token(self.next_token);
        self.next_token += 1;

        self.poll.register(&stream, token, Ready::readable(), PollOpt::edge())?;

        let session = ClientSession::new(token.0 as u32);
        info!(self.log, "client connected"; "client" => session.id);
        self.connections.insert(
            token,
            Connection {
                stream,
                ingress: Buffer::new(BUFFER_SIZE),
                egress: Buffer::new(BUFFER_SIZE),
                session,
                writable_interest: false,
            },
        );
        Ok(())
    }

    fn readable(&mut self, token: Token) {
        let mut closed = false;
        if let Some(conn) = self.connections.get_mut(&token) {
            match conn.ingress.ingress(&mut conn.stream) {
                Ok(_) => closed = true, // ingress() only returns Ok once the peer hits EOF
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(err) if err.kind() == std::io::ErrorKind::Other => {
                    // buffer overrun: drain what we have and pick up the rest next cycle
                }
                Err(_) => closed = true,
            }
        }

        self.dispatch_messages(token);

        if closed {
            self.drop_connection(token);
        }
    }

    fn dispatch_messages(&mut self, token: Token) {
        loop {
            let decoded = {
                let conn = match self.connections.get_mut(&token) {
                    Some(conn) => conn,
                    None => return,
                };
                let data = conn.ingress.read_slice();
                if data.len() < HEADER_SIZE {
                    break;
                }
                let header = match Header::decode(data) {
                    Ok(header) => header,
                    Err(ProtoError::Fatal(_)) => break,
                    Err(ProtoError::Wait) => break,
                };
                let total = HEADER_SIZE + header.body_len as usize;
                if data.len() < total {
                    break;
                }
                let body = data[HEADER_SIZE..total].to_vec();
                conn.ingress.move_head(total);
                match Message::decode(header, &body) {
                    Ok(msg) => msg,
                    Err(_) => break,
                }
            };

            self.handle_message(token, decoded);
        }
    }

    fn handle_message(&mut self, token: Token, msg: Message) {
        match msg {
            Message::ConnectReq(req) => self.handle_connect(token, req),
            Message::ServiceReq(req) => self.handle_service_req(token, req),
            Message::CloseReq => self.handle_close_req(token),
            Message::ChnIoctlReq { request, arg } => self.handle_ioctl_req(token, request, arg),
            Message::ChnTokenReq => self.handle_token_req(token),
            Message::ChnReclaimCnf => self.handle_reclaim_cnf(token),
            Message::ChnNotifyReq(req) => self.handle_notify_req(token, req),
            Message::ChnSuspendReq { commit } => self.handle_suspend_req(token, commit),
            Message::DaemonPidReq => self.handle_daemon_pid_req(token),
            other => {
                debug!(self.log, "unhandled message"; "type" => ?other.msg_type());
            }
        }
    }

    fn handle_connect(&mut self, token: Token, req: vbiproto::message::ConnectRequest) {
        use vbiproto::message::check_connect_preamble;

        let reply = match check_connect_preamble(&req) {
            Ok(()) => {
                let client_id = self.connections[&token].session.id;
                let priority = Priority::Interactive;
                let flags = ClientFlags::from_bits_truncate(req.flags);
                let scanning = self.aggregator.scanning();

                if let Some(conn) = self.connections.get_mut(&token) {
                    conn.session
                        .accept_connect(req.client_name.clone(), priority, req.pid, flags, scanning);
                }
                self.scheduler.enqueue(SchedClientId(client_id), priority);

                if !req.initial_services.is_empty() {
                    let strictness = Strictness::clamped(req.initial_strictness);
                    if let Some(conn) = self.connections.get_mut(&token) {
                        conn.session.service_table.set(strictness, req.initial_services);
                    }
                    self.aggregator
                        .set_client(AggClientId(client_id), req.initial_services, strictness);
                    self.sync_capture_lifecycle();
                }

                info!(self.log, "client handshake accepted"; "client" => client_id, "name" => req.client_name, "pid" => req.pid);
                Message::ConnectCnf(ConnectConfirm {
                    version: vbiproto::magic::VERSION,
                    scanning: self.aggregator.scanning().to_wire(),
                    services: self.aggregator.aggregate(),
                })
            }
            Err(ProtoError::Fatal(ErrorKind::BadMagic)) => {
                warn!(self.log, "rejecting connect: bad magic");
                Message::ConnectRej(ConnectReject {
                    reason: "bad magic string".to_owned(),
                })
            }
            Err(ProtoError::Fatal(ErrorKind::IncompatibleVersion)) => {
                warn!(self.log, "rejecting connect: incompatible protocol version"; "version" => req.version);
                Message::ConnectRej(ConnectReject {
                    reason: "incompatible protocol version".to_owned(),
                })
            }
            Err(_) => {
                warn!(self.log, "rejecting connect: endian mismatch");
                Message::ConnectRej(ConnectReject {
                    reason: "endian mismatch".to_owned(),
                })
            }
        };

        self.send(token, reply);
    }

    fn handle_service_req(&mut self, token: Token, req: vbiproto::message::ServiceRequest) {
        let client_id = match self.connections.get(&token) {
            Some(conn) => conn.session.id,
            None => return,
        };

        self.aggregator
            .set_client(AggClientId(client_id), req.services, req.strictness);
        let granted = self.aggregator.client_services(AggClientId(client_id));

        if let Some(conn) = self.connections.get_mut(&token) {
            conn.session.service_table.set(req.strictness, req.services);
        }

        self.sync_capture_lifecycle();

        self.send(
            token,
            Message::ServiceCnf(ServiceConfirm {
                granted,
                scanning: self.aggregator.scanning().to_wire(),
            }),
        );
    }

    fn handle_close_req(&mut self, token: Token) {
        if let Some(conn) = self.connections.get_mut(&token) {
            conn.session.begin_close();
        }
        self.drop_connection(token);
    }

    fn handle_ioctl_req(&mut self, token: Token, request: u32, _arg: Vec<u8>) {
        let reply = if ioctl_is_permitted(request) {
            Message::ChnIoctlCnf {
                result: 0,
                arg: Vec::new(),
            }
        } else {
            Message::ChnIoctlRej
        };
        self.send(token, reply);
    }

    /// A client asks for the channel token (§4.6). Granted immediately if the
    /// scheduler's own priority rules hand it over right away; otherwise, if this
    /// request outranks whoever currently holds it, the holder is sent a
    /// `ChnReclaimReq` and the actual handover happens once its `ChnReclaimCnf`
    /// arrives (see [`Server::handle_reclaim_cnf`]).
    fn handle_token_req(&mut self, token: Token) {
        let (client_id, priority) = match self.connections.get(&token) {
            Some(conn) => (conn.session.id, conn.session.priority),
            None => return,
        };
        let sched_id = SchedClientId(client_id);
        let holder_before = self.scheduler.holder();

        self.scheduler.enqueue(sched_id, priority);

        if self.scheduler.holder() == Some(sched_id) {
            self.send(token, Message::ChnTokenCnf);
            return;
        }

        if let Some(holder) = holder_before {
            let holder_token = Self::client_token(holder.0);
            let holder_priority = self.connections.get(&holder_token).map(|conn| conn.session.priority);
            if holder_priority.map_or(false, |held| priority > held) {
                self.scheduler.request_reclaim();
                self.send(holder_token, Message::ChnReclaimReq);
            }
        }
    }

    /// The previous holder confirms it has given up the channel. Releases it in the
    /// scheduler and, if that immediately grants someone else, tells them so with a
    /// `ChnTokenInd` rather than a `ChnTokenCnf` — their own `ChnTokenReq` was already
    /// answered (or left unanswered while queued); this grant happens later, as an
    /// event rather than a direct reply.
    fn handle_reclaim_cnf(&mut self, token: Token) {
        let client_id = match self.connections.get(&token) {
            Some(conn) => conn.session.id,
            None => return,
        };
        let sched_id = SchedClientId(client_id);
        if self.scheduler.holder() != Some(sched_id) {
            return;
        }
        self.scheduler.release();
        if let Some(new_holder) = self.scheduler.holder() {
            self.notify_token_grant(new_holder);
        }
    }

    fn handle_notify_req(&mut self, token: Token, req: ChnNotifyRequest) {
        if let Some(conn) = self.connections.get_mut(&token) {
            conn.session.profile = Some(req);
        }
        self.send(token, Message::ChnNotifyCnf);
    }

    /// Channel suspend is always rejected (see the suspend-always-reject resolution
    /// in the design notes) — there is no secondary device to suspend onto.
    fn handle_suspend_req(&mut self, token: Token, _commit: bool) {
        self.send(token, Message::ChnSuspendRej);
    }

    fn handle_daemon_pid_req(&mut self, token: Token) {
        self.send(token, Message::DaemonPidCnf { pid: std::process::id() });
    }

    fn notify_token_grant(&mut self, id: SchedClientId) {
        let token = Self::client_token(id.0);
        self.send(token, Message::ChnTokenInd(ChnTokenIndication { token_id: id.0 }));
    }

    /// Session ids are assigned from the same counter as their `Token`, so a
    /// scheduler/aggregator client id always maps straight back to its connection.
    fn client_token(client_id: u32) -> Token {
        Token(client_id as usize)
    }

    fn send(&mut self, token: Token, msg: Message) {
        let msg_type = msg.msg_type();
        let wire = msg.encode();
        let needs_writable = if let Some(conn) = self.connections.get_mut(&token) {
            if !enqueue(&mut conn.egress, &wire) {
                warn!(self.log, "dropping outgoing message: egress buffer full";
                    "client" => conn.session.id, "type" => ?msg_type);
            }
            self.flush(token);
            self.connections
                .get(&token)
                .map(|conn| !conn.egress.is_empty())
                .unwrap_or(false)
        } else {
            false
        };

        if needs_writable {
            self.set_writable_interest(token, true);
        }
    }

    fn flush(&mut self, token: Token) {
        if let Some(conn) = self.connections.get_mut(&token) {
            // A WouldBlock (or any other) error just leaves the remainder buffered
            // for the next writable event; egress() already advanced the head for
            // whatever did go out before hitting it.
            let _ = conn.egress.egress(&mut conn.stream);
        }
    }

    fn writable(&mut self, token: Token) {
        self.flush(token);
        let empty = self
            .connections
            .get(&token)
            .map(|conn| conn.egress.is_empty())
            .unwrap_or(true);
        if empty {
            self.set_writable_interest(token, false);
        }
    }

    fn set_writable_interest(&mut self, token: Token, want_writable: bool) {
        if let Some(conn) = self.connections.get_mut(&token) {
            if conn.writable_interest == want_writable {
                return;
            }
            conn.writable_interest = want_writable;
            let ready = if want_writable {
                Ready::readable() | Ready::writable()
            } else {
                Ready::readable()
            };
            let _ = self.poll.reregister(&conn.stream, token, ready, PollOpt::edge());
        }
    }

    fn drop_connection(&mut self, token: Token) {
        if let Some(conn) = self.connections.remove(&token) {
            let _ = self.poll.deregister(&conn.stream);
            let client_id = conn.session.id;
            self.aggregator.remove_client(AggClientId(client_id));

            let holder_before = self.scheduler.holder();
            self.scheduler.remove(SchedClientId(client_id));
            if let Some(new_holder) = self.scheduler.holder() {
                if Some(new_holder) != holder_before {
                    self.notify_token_grant(new_holder);
                }
            }

            self.sync_capture_lifecycle();
            info!(self.log, "client disconnected"; "client" => client_id);
        }
    }

    /// Opens or closes the capture device as the aggregate granted service mask
    /// transitions to/from empty, and otherwise keeps an already-open device's
    /// service set in sync with the aggregate (§3, §4.5 steps 1 and 3).
    fn sync_capture_lifecycle(&mut self) {
        let union = self.aggregator.aggregate();

        if union.is_empty() {
            if self.capture.take().is_some() {
                info!(self.log, "capture device closed"; "reason" => "granted service mask is empty");
            }
            return;
        }

        if self.capture.is_none() {
            match (self.capture_factory)() {
                Ok(mut source) => {
                    if let Err(err) = source.set_services(union) {
                        warn!(self.log, "capture device rejected initial service set"; "error" => ?err);
                    }
                    self.capture = Some(source);
                    info!(self.log, "capture device opened");
                }
                Err(err) => {
                    warn!(self.log, "failed to open capture device"; "error" => %err);
                }
            }
            return;
        }

        if let Some(source) = self.capture.as_mut() {
            if let Err(err) = source.set_services(union) {
                warn!(self.log, "capture device rejected updated service set"; "error" => ?err);
            }
        }
    }

    /// Drains frames from the capture source (if one is open) and fans them out to
    /// every client whose own effective service mask is non-empty, filtering each
    /// client's copy of the indication down to the lines (and optional raw payload)
    /// it actually asked for (§4.4, §4.7). Called once per poll cycle regardless of
    /// which fd woke the loop, since a threaded capture source has no fd of its own
    /// to register.
    fn pump_capture(&mut self) {
        loop {
            let read = match self.capture.as_mut() {
                Some(source) => source.try_read(),
                None => break,
            };
            match read {
                Ok(frame) => {
                    let recipients: Vec<(Token, Services)> = self
                        .connections
                        .iter()
                        .filter(|(_, conn)| conn.session.wants_indications())
                        .filter_map(|(token, conn)| {
                            let mask = conn.session.effective_services();
                            if mask.is_empty() {
                                None
                            } else {
                                Some((*token, mask))
                            }
                        })
                        .collect();

                    // Every recipient gets its own reference on the slot; the encoded
                    // bytes are pushed out synchronously below, so each reference is
                    // released again immediately rather than waiting on a per-client
                    // send queue.
                    let slot = self.pool.force_acquire();
                    self.pool.publish(slot, frame, recipients.len());

                    for (token, mask) in recipients {
                        let wire = self
                            .pool
                            .frame(slot)
                            .map(|frame| Message::SlicedInd(filter_indication(frame, mask)).encode())
                            .unwrap_or_default();

                        if let Some(conn) = self.connections.get_mut(&token) {
                            if !enqueue(&mut conn.egress, &wire) {
                                warn!(self.log, "dropping sliced indication: egress buffer full";
                                    "client" => conn.session.id);
                            }
                        }
                        self.flush(token);
                        let needs_writable = self
                            .connections
                            .get(&token)
                            .map(|conn| !conn.egress.is_empty())
                            .unwrap_or(false);
                        self.set_writable_interest(token, needs_writable);
                        self.pool.release(slot);
                    }
                }
                Err(ProtoError::Wait) => break,
                Err(ProtoError::Fatal(_)) => break,
            }
        }
    }

    fn reap_idle_clients(&mut self) {
        let dead: Vec<Token> = self
            .connections
            .iter()
            .filter(|(_, conn)| conn.session.is_idle(CLIENT_TIMEOUT))
            .map(|(token, _)| *token)
            .collect();
        for token in dead {
            warn!(self.log, "client timed out"; "client" => self.connections[&token].session.id);
            self.drop_connection(token);
        }
    }

    pub fn client_count(&self) -> usize {
        self.connections.len()
    }
}

/// Builds a client's own copy of a captured frame, keeping only the lines (and
/// optionally the raw payload) its effective service mask actually covers.
fn filter_indication(frame: &SlicedIndication, mask: Services) -> SlicedIndication {
    SlicedIndication {
        timestamp: frame.timestamp,
        lines: frame
            .lines
            .iter()
            .filter(|line| mask.intersects(line.id))
            .cloned()
            .collect(),
        raw: if mask.wants_raw() { frame.raw.clone() } else { None },
    }
}

/// Copies an encoded message into a connection's egress buffer's free capacity.
/// Returns `false` without writing anything if the message doesn't fit, rather than
/// splicing a partial message in — a partial write would desync every message after
/// it for this connection, since framing depends on each message's declared length
/// matching what actually went out (§4.1, the slow-client scenario).
fn enqueue(buffer: &mut Buffer, data: &[u8]) -> bool {
    let dest = buffer.write_slice();
    if data.len() > dest.len() {
        return false;
    }
    dest[..data.len()].copy_from_slice(data);
    buffer.move_tail(data.len());
    true
}
