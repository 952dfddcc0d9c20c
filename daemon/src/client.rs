//! Per-client session state: the handshake/forwarding/close state machine, the
//! per-strictness-level service table, the ioctl admission whitelist, and the
//! per-client inactivity timeout.

use std::time::{Duration, Instant};
use vbiproto::message::{ChnNotifyRequest, Priority};
use vbiproto::{ScanningSystem, Services, Strictness};

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum SessionState {
    AwaitConnectReq,
    AwaitClose,
    Forwarding,
    Closed,
}

/// The ioctls a client is allowed to issue through `ChnIoctlRequest` once forwarding.
/// Anything else is rejected without reaching the device, since letting a client
/// issue arbitrary ioctls against a shared device would let it wreck every other
/// client's session.
const IOCTL_WHITELIST: &[u32] = &[
    0x5600, // VIDIOCGUNIT-equivalent query, read-only
    0x5601, // VIDIOCGTUNER-equivalent query, read-only
    0x5602, // VIDIOCGFREQ-equivalent query, read-only
];

pub fn ioctl_is_permitted(request: u32) -> bool {
    IOCTL_WHITELIST.contains(&request)
}

bitflags::bitflags! {
    /// Per-client behaviour negotiated once at connect time, carried in
    /// `ConnectRequest.flags`.
    pub struct ClientFlags: u32 {
        /// Don't send `SlicedInd`/`ChnChangeInd` to this client at all; it only wants
        /// the control channel (tokens, ioctls, pid queries).
        const SUPPRESS_INDICATIONS = 0x01;
        /// Exempt this session from the idle-client reaper.
        const NO_TIMEOUT = 0x02;
    }
}

/// Per-strictness-level record of what a client has requested. A client renegotiates
/// one strictness level at a time (one `ServiceRequest` per call) without revoking
/// what it already holds at the other levels, so the levels accumulate rather than
/// overwrite; a client's standing effective grant is the union across all of them.
#[derive(Debug, Copy, Clone)]
pub struct ServiceTable {
    levels: [Services; Strictness::LEVELS],
}

impl ServiceTable {
    pub fn new() -> ServiceTable {
        ServiceTable {
            levels: [Services::empty(); Strictness::LEVELS],
        }
    }

    pub fn set(&mut self, strictness: Strictness, services: Services) {
        self.levels[strictness.index()] = services;
    }

    pub fn effective(&self) -> Services {
        self.levels.iter().fold(Services::empty(), |acc, &s| acc | s)
    }

    /// The highest strictness level that still has any service bit set, or `None` if
    /// the table is entirely empty.
    pub fn highest_active_level(&self) -> Option<Strictness> {
        self.levels
            .iter()
            .enumerate()
            .rev()
            .find(|(_, s)| !s.is_empty())
            .map(|(index, _)| Strictness::from_index(index))
    }

    /// Drops raw-service grants from every level, used when the scanning system
    /// changes underneath an already-negotiated table (§4.5 edge case).
    pub fn remove_raw(&mut self) {
        for services in self.levels.iter_mut() {
            services.remove(Services::RAW_525 | Services::RAW_625);
        }
    }
}

impl Default for ServiceTable {
    fn default() -> ServiceTable {
        ServiceTable::new()
    }
}

pub struct ClientSession {
    pub id: u32,
    pub state: SessionState,
    pub name: String,
    /// The connecting process's pid, reported back by `DaemonPidCnf`.
    pub pid: u32,
    pub priority: Priority,
    pub flags: ClientFlags,
    pub service_table: ServiceTable,
    /// The scanning system in effect when this client connected. Frozen at connect
    /// time rather than tracked live, so a norm change mid-session is visible to the
    /// client only through `ChnChangeInd`, not by silently reinterpreting its own
    /// recorded state.
    pub scanning: ScanningSystem,
    /// Head of this client's outstanding forwarding queue in the frame pool, if any
    /// frame is currently in flight to it.
    pub queue_head: Option<crate::pool::SlotId>,
    /// The channel profile last submitted via `ChnNotifyReq`, if any.
    pub profile: Option<ChnNotifyRequest>,
    pub last_activity: Instant,
}

impl ClientSession {
    pub fn new(id: u32) -> ClientSession {
        ClientSession {
            id,
            state: SessionState::AwaitConnectReq,
            name: String::new(),
            pid: 0,
            priority: Priority::Interactive,
            flags: ClientFlags::empty(),
            service_table: ServiceTable::new(),
            scanning: ScanningSystem::Unknown,
            queue_head: None,
            profile: None,
            last_activity: Instant::now(),
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn is_idle(&self, timeout: Duration) -> bool {
        if self.flags.contains(ClientFlags::NO_TIMEOUT) {
            return false;
        }
        self.last_activity.elapsed() >= timeout
    }

    /// Completes the handshake, recording the negotiated name/priority/pid/flags and
    /// the scanning system in effect at connect time, and moving into the forwarding
    /// state.
    pub fn accept_connect(
        &mut self,
        name: String,
        priority: Priority,
        pid: u32,
        flags: ClientFlags,
        scanning: ScanningSystem,
    ) {
        self.name = name;
        self.priority = priority;
        self.pid = pid;
        self.flags = flags;
        self.scanning = scanning;
        self.state = SessionState::Forwarding;
        self.touch();
    }

    pub fn begin_close(&mut self) {
        self.state = SessionState::AwaitClose;
    }

    pub fn close(&mut self) {
        self.state = SessionState::Closed;
    }

    pub fn is_forwarding(&self) -> bool {
        self.state == SessionState::Forwarding
    }

    /// Whether this session should be sent indications at all (§4.7 suppress flag).
    pub fn wants_indications(&self) -> bool {
        self.is_forwarding() && !self.flags.contains(ClientFlags::SUPPRESS_INDICATIONS)
    }

    pub fn effective_services(&self) -> Services {
        self.service_table.effective()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accept(session: &mut ClientSession, name: &str, priority: Priority) {
        session.accept_connect(
            name.to_owned(),
            priority,
            1234,
            ClientFlags::empty(),
            ScanningSystem::Unknown,
        );
    }

    #[test]
    fn new_session_starts_awaiting_connect() {
        let session = ClientSession::new(1);
        assert_eq!(session.state, SessionState::AwaitConnectReq);
    }

    #[test]
    fn accept_connect_moves_to_forwarding() {
        let mut session = ClientSession::new(1);
        accept(&mut session, "tvtime", Priority::Record);
        assert!(session.is_forwarding());
        assert_eq!(session.name, "tvtime");
        assert_eq!(session.priority, Priority::Record);
        assert_eq!(session.pid, 1234);
    }

    #[test]
    fn idle_detection_respects_timeout() {
        let session = ClientSession::new(1);
        assert!(!session.is_idle(Duration::from_secs(60)));
        assert!(session.is_idle(Duration::from_secs(0)));
    }

    #[test]
    fn no_timeout_flag_exempts_session_from_idle_reaping() {
        let mut session = ClientSession::new(1);
        session.flags = ClientFlags::NO_TIMEOUT;
        assert!(!session.is_idle(Duration::from_secs(0)));
    }

    #[test]
    fn suppress_indications_flag_stops_wants_indications() {
        let mut session = ClientSession::new(1);
        accept(&mut session, "x", Priority::Interactive);
        assert!(session.wants_indications());
        session.flags = ClientFlags::SUPPRESS_INDICATIONS;
        assert!(!session.wants_indications());
    }

    #[test]
    fn ioctl_whitelist_rejects_unknown_requests() {
        assert!(ioctl_is_permitted(0x5600));
        assert!(!ioctl_is_permitted(0xdead));
    }

    #[test]
    fn close_sequence_reaches_closed_state() {
        let mut session = ClientSession::new(1);
        accept(&mut session, "x", Priority::Interactive);
        session.begin_close();
        assert_eq!(session.state, SessionState::AwaitClose);
        session.close();
        assert_eq!(session.state, SessionState::Closed);
    }

    #[test]
    fn service_table_accumulates_across_strictness_levels() {
        let mut table = ServiceTable::new();
        table.set(Strictness::from_i8(-1).unwrap(), Services::TELETEXT_B);
        table.set(Strictness::from_i8(2).unwrap(), Services::VPS);
        assert_eq!(table.effective(), Services::TELETEXT_B | Services::VPS);
        assert_eq!(table.highest_active_level(), Strictness::from_i8(2));
    }

    #[test]
    fn service_table_norm_change_drops_raw_from_every_level() {
        let mut table = ServiceTable::new();
        table.set(Strictness::default(), Services::TELETEXT_B | Services::RAW_625);
        table.remove_raw();
        assert_eq!(table.effective(), Services::TELETEXT_B);
    }
}
