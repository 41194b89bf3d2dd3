//! # Locator Update Protocol
//!
//! When this node's locator set changes, every active correspondent gets a
//! unicast locator-update packet announcing the new set. Redundant
//! announcements (set unchanged since the last one) are suppressed.
//!
//! On receipt the stored locator set for the sending identifier is replaced
//! wholesale, and the caller is told which locators disappeared so routes
//! through them can be purged. Updates from identifiers we are not actively
//! corresponding with are unsolicited; whether they are applied or ignored
//! is a policy decision.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::identity::{Address, Identifier, IdentityStore, Locator};
use crate::packet::{Packet, PacketBody};

/// How to treat locator updates from identifiers outside the correspondent
/// set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnsolicitedUpdatePolicy {
    /// Apply the update anyway. Useful in small cooperative deployments.
    Accept,
    /// Discard it. The sender will resend once traffic makes it a
    /// correspondent.
    Ignore,
}

/// Result of processing a received locator update.
#[derive(Debug, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The peer's set was replaced; `removed` lists the locators no longer
    /// valid for that peer. Routes through them must be purged.
    Applied { removed: Vec<Locator> },
    Ignored,
}

pub struct LocatorUpdater {
    policy: UnsolicitedUpdatePolicy,
    /// The set most recently announced to correspondents, sorted.
    last_announced: Option<Vec<Locator>>,
    /// Current locator set per peer, learned from their updates.
    peer_locators: HashMap<Identifier, Vec<Locator>>,
}

impl LocatorUpdater {
    pub fn new(policy: UnsolicitedUpdatePolicy) -> Self {
        Self {
            policy,
            last_announced: None,
            peer_locators: HashMap::new(),
        }
    }

    /// Builds one locator-update packet per active correspondent announcing
    /// the node's current set. Returns no packets if the set equals the
    /// previously announced one.
    pub fn on_local_locator_change(
        &mut self,
        store: &IdentityStore,
        correspondents: &[Identifier],
    ) -> Vec<Packet> {
        let current = store.locators();
        let mut announced: Vec<Locator> = current.iter().copied().collect();
        announced.sort_unstable();

        if self.last_announced.as_ref() == Some(&announced) {
            debug!("locator set unchanged, suppressing update");
            return Vec::new();
        }
        self.last_announced = Some(announced);

        let src = store.primary_address();
        let packets: Vec<Packet> = correspondents
            .iter()
            .map(|&peer| {
                let dst = Address::new(self.best_locator_for(peer), peer);
                Packet::new(src, dst, PacketBody::LocatorUpdate(current.to_vec()))
            })
            .collect();
        debug!(
            correspondents = packets.len(),
            locators = current.len(),
            "announcing locator change"
        );
        packets
    }

    /// Replaces the stored locator set for `from.id` and reports the
    /// locators that dropped out of it. Unsolicited updates follow the
    /// configured policy.
    pub fn on_update_received(
        &mut self,
        from: Address,
        locators: &[Locator],
        known_correspondent: bool,
    ) -> UpdateOutcome {
        if !known_correspondent && self.policy == UnsolicitedUpdatePolicy::Ignore {
            warn!(from = %from, "ignoring unsolicited locator update");
            return UpdateOutcome::Ignored;
        }

        let previous = self
            .peer_locators
            .insert(from.id, locators.to_vec())
            .unwrap_or_default();
        let removed: Vec<Locator> = previous
            .into_iter()
            .filter(|loc| !locators.contains(loc))
            .collect();
        debug!(from = %from, locators = locators.len(), removed = removed.len(), "applied locator update");
        UpdateOutcome::Applied { removed }
    }

    /// Last known locator set for a peer, if any update has been seen.
    pub fn peer_locators(&self, peer: Identifier) -> Option<&[Locator]> {
        self.peer_locators.get(&peer).map(Vec::as_slice)
    }

    /// Drops cached state for a peer that aged out of the correspondent set.
    pub fn forget(&mut self, peer: Identifier) {
        self.peer_locators.remove(&peer);
    }

    fn best_locator_for(&self, peer: Identifier) -> Locator {
        self.peer_locators
            .get(&peer)
            .and_then(|locs| locs.first().copied())
            // Unknown reachability; the routing engine resolves or floods.
            .unwrap_or(Locator(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(id: u64, locs: &[u64]) -> IdentityStore {
        IdentityStore::new(Identifier(id), locs.iter().map(|&l| Locator(l)).collect()).unwrap()
    }

    #[test]
    fn one_update_per_correspondent() {
        let store = store(1, &[10, 20]);
        let mut updater = LocatorUpdater::new(UnsolicitedUpdatePolicy::Accept);
        let correspondents = [Identifier(2), Identifier(3), Identifier(4)];

        let packets = updater.on_local_locator_change(&store, &correspondents);
        assert_eq!(packets.len(), 3);
        for (packet, peer) in packets.iter().zip(correspondents) {
            assert_eq!(packet.dst.id, peer);
            assert_eq!(packet.src.id, Identifier(1));
            match &packet.body {
                PacketBody::LocatorUpdate(locs) => {
                    assert_eq!(locs, &vec![Locator(10), Locator(20)]);
                }
                other => panic!("expected locator update, got {other:?}"),
            }
        }
    }

    #[test]
    fn unchanged_set_is_suppressed() {
        let store = store(1, &[10, 20]);
        let mut updater = LocatorUpdater::new(UnsolicitedUpdatePolicy::Accept);
        let correspondents = [Identifier(2)];

        assert_eq!(updater.on_local_locator_change(&store, &correspondents).len(), 1);
        assert!(updater.on_local_locator_change(&store, &correspondents).is_empty());

        store.set_locators(vec![Locator(20), Locator(30)]).unwrap();
        assert_eq!(updater.on_local_locator_change(&store, &correspondents).len(), 1);
    }

    #[test]
    fn received_update_reports_removed_locators() {
        let mut updater = LocatorUpdater::new(UnsolicitedUpdatePolicy::Accept);
        let peer = Address::new(Locator(10), Identifier(2));

        let outcome = updater.on_update_received(peer, &[Locator(10), Locator(20)], true);
        assert_eq!(outcome, UpdateOutcome::Applied { removed: vec![] });

        let outcome = updater.on_update_received(peer, &[Locator(20), Locator(30)], true);
        assert_eq!(
            outcome,
            UpdateOutcome::Applied {
                removed: vec![Locator(10)]
            }
        );
        assert_eq!(
            updater.peer_locators(Identifier(2)),
            Some([Locator(20), Locator(30)].as_slice())
        );
    }

    #[test]
    fn unsolicited_update_follows_policy() {
        let peer = Address::new(Locator(10), Identifier(9));

        let mut ignoring = LocatorUpdater::new(UnsolicitedUpdatePolicy::Ignore);
        assert_eq!(
            ignoring.on_update_received(peer, &[Locator(10)], false),
            UpdateOutcome::Ignored
        );
        assert_eq!(ignoring.peer_locators(Identifier(9)), None);

        let mut accepting = LocatorUpdater::new(UnsolicitedUpdatePolicy::Accept);
        assert_eq!(
            accepting.on_update_received(peer, &[Locator(10)], false),
            UpdateOutcome::Applied { removed: vec![] }
        );
    }

    #[test]
    fn cached_peer_locator_addresses_updates() {
        let store = store(1, &[10]);
        let mut updater = LocatorUpdater::new(UnsolicitedUpdatePolicy::Accept);
        let peer = Address::new(Locator(40), Identifier(2));
        updater.on_update_received(peer, &[Locator(40), Locator(50)], true);

        let packets = updater.on_local_locator_change(&store, &[Identifier(2)]);
        assert_eq!(packets[0].dst.loc, Locator(40));

        updater.forget(Identifier(2));
        store.set_locators(vec![Locator(11)]).unwrap();
        let packets = updater.on_local_locator_change(&store, &[Identifier(2)]);
        assert_eq!(packets[0].dst.loc, Locator(0));
    }
}
