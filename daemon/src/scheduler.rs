//! The channel token scheduler. Exactly one client session at a time holds the
//! device "token" that lets it steer channel changes; everyone else is queued by
//! priority class. Mirrors the original daemon's `REQ_TOKEN_STATE` state machine
//! and its background-class round robin.

use std::collections::VecDeque;
use vbiproto::message::Priority;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum TokenState {
    None,
    Reclaim,
    Release,
    Grant,
    Granted,
    Returned,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct ClientId(pub u32);

struct Waiter {
    client: ClientId,
    priority: Priority,
}

/// Holds the token queue and whichever client currently has it. Background-class
/// waiters are served round robin among themselves rather than strict FIFO, so no
/// single background client can starve its peers while interactive/record clients
/// still always cut in line ahead of all of them.
pub struct TokenScheduler {
    holder: Option<ClientId>,
    state: TokenState,
    background: VecDeque<Waiter>,
    interactive: VecDeque<Waiter>,
    record: VecDeque<Waiter>,
    /// Counts consecutive background grants since the last higher-priority grant,
    /// saturating at 2 and reset to 0 whenever an interactive/record client is
    /// served instead.
    cycle_count: u8,
}

impl TokenScheduler {
    pub fn new() -> TokenScheduler {
        TokenScheduler {
            holder: None,
            state: TokenState::None,
            background: VecDeque::new(),
            interactive: VecDeque::new(),
            record: VecDeque::new(),
            cycle_count: 0,
        }
    }

    pub fn holder(&self) -> Option<ClientId> {
        self.holder
    }

    pub fn state(&self) -> TokenState {
        self.state
    }

    pub fn enqueue(&mut self, client: ClientId, priority: Priority) {
        let waiter = Waiter { client, priority };
        match priority {
            Priority::Background => self.background.push_back(waiter),
            Priority::Interactive => self.interactive.push_back(waiter),
            Priority::Record => self.record.push_back(waiter),
        }
        self.try_grant();
    }

    /// Drops a client from every queue and, if it held the token, releases it —
    /// used on session close so a dead client never blocks the scheduler.
    pub fn remove(&mut self, client: ClientId) {
        self.background.retain(|w| w.client != client);
        self.interactive.retain(|w| w.client != client);
        self.record.retain(|w| w.client != client);
        if self.holder == Some(client) {
            self.holder = None;
            self.state = TokenState::Returned;
            self.try_grant();
        }
    }

    /// Called when the current holder voluntarily returns the token (§4.6 release
    /// flow) or its `ChnTokenCnf` acknowledges a reclaim.
    pub fn release(&mut self) {
        self.holder = None;
        self.state = TokenState::Returned;
        self.try_grant();
    }

    /// Marks the token as being reclaimed from its current holder; the caller is
    /// expected to have already sent the client a reclaim request and is waiting
    /// for its confirm before actually granting to someone else.
    pub fn request_reclaim(&mut self) {
        if self.holder.is_some() {
            self.state = TokenState::Reclaim;
        }
    }

    fn try_grant(&mut self) {
        if self.holder.is_some() {
            return;
        }

        if let Some(waiter) = self.record.pop_front() {
            self.grant(waiter.client, false);
            return;
        }
        if let Some(waiter) = self.interactive.pop_front() {
            self.grant(waiter.client, false);
            return;
        }
        if let Some(waiter) = self.background.pop_front() {
            self.grant(waiter.client, true);
        }
    }

    fn grant(&mut self, client: ClientId, is_background: bool) {
        self.holder = Some(client);
        self.state = TokenState::Granted;
        if is_background {
            self.cycle_count = (self.cycle_count + 1).min(2);
        } else {
            self.cycle_count = 0;
        }
    }

    pub fn is_waiting(&self, client: ClientId) -> bool {
        self.background.iter().any(|w| w.client == client)
            || self.interactive.iter().any(|w| w.client == client)
            || self.record.iter().any(|w| w.client == client)
    }
}

impl Default for TokenScheduler {
    fn default() -> TokenScheduler {
        TokenScheduler::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_waiter_gets_token_immediately() {
        let mut sched = TokenScheduler::new();
        sched.enqueue(ClientId(1), Priority::Background);
        assert_eq!(sched.holder(), Some(ClientId(1)));
    }

    #[test]
    fn record_priority_cuts_ahead_of_background() {
        let mut sched = TokenScheduler::new();
        sched.enqueue(ClientId(1), Priority::Background);
        sched.enqueue(ClientId(2), Priority::Record);
        sched.release();
        assert_eq!(sched.holder(), Some(ClientId(2)));
    }

    #[test]
    fn interactive_cuts_ahead_of_background_but_not_record() {
        let mut sched = TokenScheduler::new();
        sched.enqueue(ClientId(1), Priority::Record);
        sched.enqueue(ClientId(2), Priority::Background);
        sched.enqueue(ClientId(3), Priority::Interactive);
        sched.release();
        assert_eq!(sched.holder(), Some(ClientId(3)));
        sched.release();
        assert_eq!(sched.holder(), Some(ClientId(2)));
    }

    #[test]
    fn remove_releases_held_token_to_next_waiter() {
        let mut sched = TokenScheduler::new();
        sched.enqueue(ClientId(1), Priority::Background);
        sched.enqueue(ClientId(2), Priority::Background);
        sched.remove(ClientId(1));
        assert_eq!(sched.holder(), Some(ClientId(2)));
    }

    #[test]
    fn background_cycle_count_saturates_and_is_tracked() {
        let mut sched = TokenScheduler::new();
        sched.enqueue(ClientId(1), Priority::Background);
        for _ in 0..5 {
            sched.release();
            sched.enqueue(ClientId(1), Priority::Background);
        }
        assert_eq!(sched.cycle_count, 2);
    }

    #[test]
    fn waiting_client_is_reported_until_granted() {
        let mut sched = TokenScheduler::new();
        sched.enqueue(ClientId(1), Priority::Background);
        sched.enqueue(ClientId(2), Priority::Background);
        assert!(sched.is_waiting(ClientId(2)));
        sched.release();
        assert!(!sched.is_waiting(ClientId(2)));
    }
}
