//! Merges every connected client's requested services into the single service mask
//! actually programmed on the device. A client's strictness only ever raises the
//! floor the aggregate asks the decoder for — the decoder is opened once for the
//! whole daemon, so no client gets a looser tolerance than another client already
//! asked for at a given service bit.

use crate::client::ServiceTable;
use std::collections::HashMap;
use vbiproto::{ScanningSystem, Services, Strictness};

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ClientId(pub u32);

/// Tracks every client's currently granted services (as a per-strictness-level table,
/// since a client renegotiates one level at a time) and recomputes the aggregate mask
/// and strictness whenever a client's request changes.
pub struct ServiceAggregator {
    wants: HashMap<ClientId, ServiceTable>,
    scanning: ScanningSystem,
}

impl ServiceAggregator {
    pub fn new(scanning: ScanningSystem) -> ServiceAggregator {
        ServiceAggregator {
            wants: HashMap::new(),
            scanning,
        }
    }

    pub fn scanning(&self) -> ScanningSystem {
        self.scanning
    }

    /// Records a client's request at one strictness level, leaving whatever it holds
    /// at other levels untouched. Returns the new aggregate mask so the caller can
    /// decide whether the device needs reprogramming.
    pub fn set_client(&mut self, client: ClientId, services: Services, strictness: Strictness) -> Services {
        self.wants
            .entry(client)
            .or_insert_with(ServiceTable::new)
            .set(strictness, services);
        self.aggregate()
    }

    pub fn remove_client(&mut self, client: ClientId) -> Services {
        self.wants.remove(&client);
        self.aggregate()
    }

    pub fn aggregate(&self) -> Services {
        self.wants
            .values()
            .fold(Services::empty(), |acc, table| acc | table.effective())
    }

    /// The strictest (numerically highest) strictness level any client still has a
    /// non-empty request at; `None` once the last client disconnects.
    pub fn aggregate_strictness(&self) -> Option<Strictness> {
        self.wants.values().filter_map(ServiceTable::highest_active_level).max()
    }

    /// Handles a video-standard change reported by the device: resets to the new
    /// scanning system and drops every client's raw-service grant, since raw sample
    /// geometry is tied to the old standard and must be renegotiated (§4.5 edge case).
    pub fn on_norm_change(&mut self, scanning: ScanningSystem) {
        self.scanning = scanning;
        for table in self.wants.values_mut() {
            table.remove_raw();
        }
    }

    /// A single client's own effective (union-across-levels) grant, as opposed to
    /// [`ServiceAggregator::aggregate`]'s union across every connected client.
    pub fn client_services(&self, client: ClientId) -> Services {
        self.wants
            .get(&client)
            .map(ServiceTable::effective)
            .unwrap_or_else(Services::empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_is_union_of_all_clients() {
        let mut agg = ServiceAggregator::new(ScanningSystem::Lines625);
        agg.set_client(ClientId(1), Services::TELETEXT_B, Strictness::default());
        agg.set_client(ClientId(2), Services::VPS, Strictness::default());
        assert_eq!(agg.aggregate(), Services::TELETEXT_B | Services::VPS);
    }

    #[test]
    fn removing_a_client_shrinks_the_aggregate() {
        let mut agg = ServiceAggregator::new(ScanningSystem::Lines625);
        agg.set_client(ClientId(1), Services::TELETEXT_B, Strictness::default());
        agg.set_client(ClientId(2), Services::VPS, Strictness::default());
        agg.remove_client(ClientId(1));
        assert_eq!(agg.aggregate(), Services::VPS);
    }

    #[test]
    fn aggregate_strictness_is_the_highest_requested() {
        let mut agg = ServiceAggregator::new(ScanningSystem::Lines625);
        agg.set_client(ClientId(1), Services::TELETEXT_B, Strictness::from_i8(-1).unwrap());
        agg.set_client(ClientId(2), Services::VPS, Strictness::from_i8(2).unwrap());
        assert_eq!(agg.aggregate_strictness(), Strictness::from_i8(2));
    }

    #[test]
    fn aggregate_strictness_is_none_with_no_clients() {
        let agg = ServiceAggregator::new(ScanningSystem::Lines625);
        assert_eq!(agg.aggregate_strictness(), None);
    }

    #[test]
    fn renegotiating_a_second_strictness_level_does_not_drop_the_first() {
        let mut agg = ServiceAggregator::new(ScanningSystem::Lines625);
        agg.set_client(ClientId(1), Services::TELETEXT_B, Strictness::from_i8(-1).unwrap());
        agg.set_client(ClientId(1), Services::VPS, Strictness::from_i8(1).unwrap());
        assert_eq!(
            agg.client_services(ClientId(1)),
            Services::TELETEXT_B | Services::VPS
        );
    }

    #[test]
    fn norm_change_drops_raw_services_from_every_client() {
        let mut agg = ServiceAggregator::new(ScanningSystem::Lines625);
        agg.set_client(
            ClientId(1),
            Services::TELETEXT_B | Services::RAW_625,
            Strictness::default(),
        );
        agg.on_norm_change(ScanningSystem::Lines525);
        assert_eq!(agg.scanning(), ScanningSystem::Lines525);
        assert_eq!(agg.client_services(ClientId(1)), Services::TELETEXT_B);
    }
}
