//! # Route Table and Correspondent Set
//!
//! The route table maps destination identifiers to candidate locator paths.
//! Each path remembers its hop count and when it was last refreshed; the
//! table is swept periodically by the dispatch loop instead of running a
//! timer per entry.
//!
//! Path preference is by ascending metric (hop count plus a penalty per
//! recorded send failure), with ties broken by lowest hop count and then by
//! most recent refresh.
//!
//! Invariant: no stored path ever exceeds the configured hop limit; a path
//! that would is discarded at insert time.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::identity::{Identifier, Locator};

/// Paths that fail this many sends in a row are evicted.
const MAX_PATH_FAILURES: u32 = 3;

/// Metric penalty per recorded send failure, in hop-count units.
const FAILURE_PENALTY: u32 = 4;

/// One candidate route: the locator sequence towards the destination.
/// `hops[0]` is the next-hop locator; the full sequence is kept so locator
/// changes elsewhere in the network can invalidate the path.
#[derive(Clone, Debug)]
pub struct RoutePath {
    pub hops: Vec<Locator>,
    pub hop_count: u8,
    refreshed_at: Instant,
    failures: u32,
}

impl RoutePath {
    pub fn new(hops: Vec<Locator>, hop_count: u8, now: Instant) -> Self {
        Self {
            hops,
            hop_count,
            refreshed_at: now,
            failures: 0,
        }
    }

    pub fn next_hop(&self) -> Option<Locator> {
        self.hops.first().copied()
    }

    /// Lower is better.
    pub fn metric(&self) -> u32 {
        self.hop_count as u32 + self.failures * FAILURE_PENALTY
    }

    fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.refreshed_at)
    }

    fn preference_key(&self) -> (u32, u8, std::cmp::Reverse<Instant>) {
        (self.metric(), self.hop_count, std::cmp::Reverse(self.refreshed_at))
    }
}

/// Route table keyed by destination identifier.
#[derive(Debug)]
pub struct RouteTable {
    entries: HashMap<Identifier, Vec<RoutePath>>,
    hop_limit: u8,
    max_paths: usize,
    max_age: Duration,
}

impl RouteTable {
    pub fn new(hop_limit: u8, max_paths: usize, max_age: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            hop_limit,
            max_paths: max_paths.max(1),
            max_age,
        }
    }

    /// Best known path to `dest`, or `None` when the destination is unknown.
    pub fn lookup(&self, dest: Identifier) -> Option<&RoutePath> {
        self.entries
            .get(&dest)?
            .iter()
            .min_by_key(|path| path.preference_key())
    }

    /// All known paths to `dest`, ascending metric. Used by multipath mode.
    pub fn expand(&self, dest: Identifier) -> Vec<&RoutePath> {
        let mut paths: Vec<&RoutePath> = self
            .entries
            .get(&dest)
            .map(|paths| paths.iter().collect())
            .unwrap_or_default();
        paths.sort_by_key(|path| path.preference_key());
        paths
    }

    /// Adds a path or refreshes the existing one with the same next hop.
    ///
    /// Returns false when the path violates the hop limit and was discarded.
    pub fn insert_or_refresh(
        &mut self,
        dest: Identifier,
        hops: Vec<Locator>,
        hop_count: u8,
        now: Instant,
    ) -> bool {
        if hop_count > self.hop_limit || hops.is_empty() {
            debug!(%dest, hop_count, "discarding path beyond hop limit");
            return false;
        }

        let paths = self.entries.entry(dest).or_default();
        if let Some(existing) = paths.iter_mut().find(|p| p.hops.first() == hops.first()) {
            // Same next hop: keep whichever route is shorter, reset aging.
            if hop_count <= existing.hop_count {
                existing.hops = hops;
                existing.hop_count = hop_count;
            }
            existing.refreshed_at = now;
            existing.failures = 0;
            return true;
        }

        paths.push(RoutePath::new(hops, hop_count, now));
        if paths.len() > self.max_paths {
            // Evict the worst candidate to stay within the path budget.
            if let Some(worst) = paths
                .iter()
                .enumerate()
                .max_by_key(|(_, p)| p.preference_key())
                .map(|(i, _)| i)
            {
                paths.swap_remove(worst);
            }
        }
        true
    }

    /// Marks the path through `next_hop` as fresh after a successful use.
    pub fn refresh(&mut self, dest: Identifier, next_hop: Locator, now: Instant) {
        if let Some(paths) = self.entries.get_mut(&dest) {
            if let Some(path) = paths.iter_mut().find(|p| p.next_hop() == Some(next_hop)) {
                path.refreshed_at = now;
            }
        }
    }

    /// Demotes the path through `next_hop`; evicts it after repeated failure.
    pub fn record_failure(&mut self, dest: Identifier, next_hop: Locator) {
        if let Some(paths) = self.entries.get_mut(&dest) {
            if let Some(idx) = paths.iter().position(|p| p.next_hop() == Some(next_hop)) {
                paths[idx].failures += 1;
                if paths[idx].failures >= MAX_PATH_FAILURES {
                    debug!(%dest, %next_hop, "evicting repeatedly failing path");
                    paths.swap_remove(idx);
                }
            }
            if paths.is_empty() {
                self.entries.remove(&dest);
            }
        }
    }

    /// Removes paths whose age exceeds the refresh delay. Called from the
    /// dispatch loop's maintenance tick. Returns how many paths were evicted.
    pub fn evict_stale(&mut self, now: Instant) -> usize {
        let max_age = self.max_age;
        let mut evicted = 0;
        self.entries.retain(|_, paths| {
            let before = paths.len();
            paths.retain(|path| path.age(now) <= max_age);
            evicted += before - paths.len();
            !paths.is_empty()
        });
        evicted
    }

    /// Drops every path that references one of the given locators. Used when
    /// a correspondent abandons locators so routes through them die with it.
    pub fn purge_locators(&mut self, removed: &[Locator]) -> usize {
        if removed.is_empty() {
            return 0;
        }
        let mut purged = 0;
        self.entries.retain(|_, paths| {
            let before = paths.len();
            paths.retain(|path| !path.hops.iter().any(|hop| removed.contains(hop)));
            purged += before - paths.len();
            !paths.is_empty()
        });
        purged
    }

    /// Drops paths to a peer whose final subnet is not one of the peer's
    /// current locators. Paths that only know their first leg are kept; the
    /// next hop may still be valid.
    pub fn purge_moved_peer(&mut self, dest: Identifier, current: &[Locator]) -> usize {
        let Some(paths) = self.entries.get_mut(&dest) else {
            return 0;
        };
        let before = paths.len();
        paths.retain(|path| {
            let complete = path.hops.len() == usize::from(path.hop_count);
            match path.hops.last() {
                Some(last) if complete => current.contains(last),
                _ => true,
            }
        });
        let purged = before - paths.len();
        if paths.is_empty() {
            self.entries.remove(&dest);
        }
        purged
    }

    pub fn contains(&self, dest: Identifier) -> bool {
        self.entries.contains_key(&dest)
    }

    #[cfg(test)]
    pub fn path_count(&self, dest: Identifier) -> usize {
        self.entries.get(&dest).map(Vec::len).unwrap_or(0)
    }
}

/// Identifiers this node is actively exchanging traffic with. Targets of
/// locator-update notifications; entries age out after the inactivity
/// window.
#[derive(Debug)]
pub struct CorrespondentSet {
    last_activity: HashMap<Identifier, Instant>,
    window: Duration,
}

impl CorrespondentSet {
    pub fn new(window: Duration) -> Self {
        Self {
            last_activity: HashMap::new(),
            window,
        }
    }

    pub fn note_activity(&mut self, peer: Identifier, now: Instant) {
        self.last_activity.insert(peer, now);
    }

    pub fn is_active(&self, peer: Identifier, now: Instant) -> bool {
        self.last_activity
            .get(&peer)
            .is_some_and(|last| now.saturating_duration_since(*last) <= self.window)
    }

    /// Correspondents still within the inactivity window, stable order.
    pub fn active(&self, now: Instant) -> Vec<Identifier> {
        let mut peers: Vec<Identifier> = self
            .last_activity
            .iter()
            .filter(|(_, last)| now.saturating_duration_since(**last) <= self.window)
            .map(|(peer, _)| *peer)
            .collect();
        peers.sort();
        peers
    }

    /// Drops aged-out correspondents and returns them so per-peer state held
    /// elsewhere can be released too.
    pub fn evict_stale(&mut self, now: Instant) -> Vec<Identifier> {
        let window = self.window;
        let mut evicted = Vec::new();
        self.last_activity.retain(|peer, last| {
            let keep = now.saturating_duration_since(*last) <= window;
            if !keep {
                evicted.push(*peer);
            }
            keep
        });
        evicted
    }

    pub fn len(&self) -> usize {
        self.last_activity.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_activity.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> RouteTable {
        RouteTable::new(8, 4, Duration::from_secs(60))
    }

    fn id(v: u64) -> Identifier {
        Identifier(v)
    }

    fn loc(v: u64) -> Locator {
        Locator(v)
    }

    #[test]
    fn lookup_prefers_lowest_metric() {
        let mut t = table();
        let now = Instant::now();
        t.insert_or_refresh(id(3), vec![loc(1), loc(2), loc(3)], 3, now);
        t.insert_or_refresh(id(3), vec![loc(5), loc(3)], 2, now);

        let best = t.lookup(id(3)).unwrap();
        assert_eq!(best.next_hop(), Some(loc(5)));
        assert_eq!(best.hop_count, 2);
    }

    #[test]
    fn ties_broken_by_most_recent_refresh() {
        let mut t = table();
        let earlier = Instant::now();
        let later = earlier + Duration::from_secs(5);
        t.insert_or_refresh(id(3), vec![loc(1), loc(3)], 2, earlier);
        t.insert_or_refresh(id(3), vec![loc(2), loc(3)], 2, later);

        assert_eq!(t.lookup(id(3)).unwrap().next_hop(), Some(loc(2)));
    }

    #[test]
    fn hop_limit_violations_discarded() {
        let mut t = table();
        let now = Instant::now();
        assert!(!t.insert_or_refresh(id(3), vec![loc(1)], 9, now));
        assert!(t.lookup(id(3)).is_none());
        // At the limit is still acceptable.
        assert!(t.insert_or_refresh(id(3), vec![loc(1)], 8, now));
    }

    #[test]
    fn stale_paths_evicted_on_sweep() {
        let mut t = table();
        let now = Instant::now();
        t.insert_or_refresh(id(3), vec![loc(1)], 1, now);
        t.insert_or_refresh(id(4), vec![loc(2)], 1, now + Duration::from_secs(50));

        let evicted = t.evict_stale(now + Duration::from_secs(70));
        assert_eq!(evicted, 1);
        assert!(t.lookup(id(3)).is_none());
        assert!(t.lookup(id(4)).is_some());
    }

    #[test]
    fn refresh_resets_aging() {
        let mut t = table();
        let now = Instant::now();
        t.insert_or_refresh(id(3), vec![loc(1)], 1, now);
        t.refresh(id(3), loc(1), now + Duration::from_secs(50));
        assert_eq!(t.evict_stale(now + Duration::from_secs(70)), 0);
        assert!(t.lookup(id(3)).is_some());
    }

    #[test]
    fn expand_orders_by_ascending_metric() {
        let mut t = table();
        let now = Instant::now();
        t.insert_or_refresh(id(3), vec![loc(1), loc(2), loc(3), loc(4)], 4, now);
        t.insert_or_refresh(id(3), vec![loc(5), loc(3)], 2, now);
        t.insert_or_refresh(id(3), vec![loc(6), loc(2), loc(3)], 3, now);

        let metrics: Vec<u32> = t.expand(id(3)).iter().map(|p| p.metric()).collect();
        assert_eq!(metrics, vec![2, 3, 4]);
    }

    #[test]
    fn repeated_failures_evict_path() {
        let mut t = table();
        let now = Instant::now();
        t.insert_or_refresh(id(3), vec![loc(1)], 1, now);
        t.insert_or_refresh(id(3), vec![loc(2)], 2, now);

        t.record_failure(id(3), loc(1));
        // One failure demotes below the clean path.
        assert_eq!(t.lookup(id(3)).unwrap().next_hop(), Some(loc(2)));

        t.record_failure(id(3), loc(1));
        t.record_failure(id(3), loc(1));
        assert_eq!(t.path_count(id(3)), 1);
    }

    #[test]
    fn path_budget_evicts_worst() {
        let mut t = RouteTable::new(8, 2, Duration::from_secs(60));
        let now = Instant::now();
        t.insert_or_refresh(id(3), vec![loc(1)], 5, now);
        t.insert_or_refresh(id(3), vec![loc(2)], 2, now);
        t.insert_or_refresh(id(3), vec![loc(4)], 3, now);

        assert_eq!(t.path_count(id(3)), 2);
        let hops: Vec<u8> = t.expand(id(3)).iter().map(|p| p.hop_count).collect();
        assert_eq!(hops, vec![2, 3]);
    }

    #[test]
    fn purge_drops_paths_referencing_locator() {
        let mut t = table();
        let now = Instant::now();
        t.insert_or_refresh(id(3), vec![loc(1), loc(9)], 2, now);
        t.insert_or_refresh(id(3), vec![loc(2)], 1, now);
        t.insert_or_refresh(id(4), vec![loc(9)], 1, now);

        assert_eq!(t.purge_locators(&[loc(9)]), 2);
        assert_eq!(t.path_count(id(3)), 1);
        assert!(!t.contains(id(4)));
    }

    #[test]
    fn moved_peer_invalidates_stale_destinations() {
        let mut t = table();
        let now = Instant::now();
        // Complete path ending in subnet 30, and a first-leg-only shortcut.
        t.insert_or_refresh(id(3), vec![loc(10), loc(30)], 2, now);
        t.insert_or_refresh(id(3), vec![loc(20)], 3, now);

        assert_eq!(t.purge_moved_peer(id(3), &[loc(31)]), 1);
        let remaining = t.expand(id(3));
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].next_hop(), Some(loc(20)));
    }

    #[test]
    fn correspondents_age_out() {
        let mut set = CorrespondentSet::new(Duration::from_secs(30));
        let now = Instant::now();
        set.note_activity(id(1), now);
        set.note_activity(id(2), now + Duration::from_secs(20));

        let later = now + Duration::from_secs(40);
        assert!(!set.is_active(id(1), later));
        assert!(set.is_active(id(2), later));
        assert_eq!(set.active(later), vec![id(2)]);

        assert_eq!(set.evict_stale(later), vec![id(1)]);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn activity_refreshes_window() {
        let mut set = CorrespondentSet::new(Duration::from_secs(30));
        let now = Instant::now();
        set.note_activity(id(1), now);
        set.note_activity(id(1), now + Duration::from_secs(25));
        assert!(set.is_active(id(1), now + Duration::from_secs(50)));
    }
}
