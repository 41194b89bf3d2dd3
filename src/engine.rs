//! # Routing Engine
//!
//! Decides what happens to every outgoing or forwarded packet. The engine is
//! synchronous and side-effect free at the network boundary: each call
//! returns a list of [`Action`]s which the dispatch loop executes (send,
//! deliver, drop). That keeps every routing decision testable without
//! sockets or a runtime.
//!
//! Per packet the decision walks the state machine
//! `NEED_ROUTE -> {ROUTE_KNOWN, ROUTE_REQUESTED} -> FORWARDED | DROPPED`:
//!
//! - **Random-walk**: no route state retained; an unknown destination gets
//!   forwarded out a uniformly random interface, never the one it arrived
//!   on. Accepts suboptimal paths for minimal memory.
//! - **Multipath**: up to `number_of_paths` concurrent paths per
//!   destination, spread by smooth weighted round-robin with weight equal to
//!   the inverse hop count. A failing path is demoted and the next candidate
//!   within the hop budget is used.
//! - **On-demand**: unknown destinations trigger a route-request flood
//!   (excluding the inbound link, bounded by the hop limit). Forwarders
//!   append their outbound locator to the visited list; the destination, or
//!   any node with a cached route, answers with a route-reply carrying the
//!   full locator path. The requester caches the first reply and releases
//!   the packets buffered for that destination.
//!
//! Every forward consumes one hop of budget; a packet that would exceed the
//! hop limit is silently dropped. Routing does not guarantee delivery.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::{debug, trace};

use crate::identity::{Address, Identifier, IdentityStore, Locator};
use crate::packet::{Packet, PacketBody};
use crate::table::RouteTable;

/// Route requests we have seen recently, to break flood loops.
const SEEN_REQUEST_CAPACITY: usize = 128;

/// An unanswered route request is retried after this long.
const REQUEST_RETRY_AFTER: Duration = Duration::from_secs(10);

/// Route requests retried this many times before the buffered packets are
/// given up on.
const MAX_REQUEST_ATTEMPTS: u32 = 5;

/// Buffered packets per destination while a route is being discovered.
const PENDING_PACKETS_PER_DEST: usize = 32;

/// Routing strategy, selected at startup via the `mode` config key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoutingMode {
    RandomWalk,
    Multipath,
    OnDemand,
}

/// What to do with route replies that arrive after a path is already cached.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplyPolicy {
    /// Later replies are ignored outright.
    FirstWins,
    /// A strictly shorter path replaces (or joins, in multipath mode) the
    /// cached one.
    PreferShorter,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DropReason {
    HopLimitExceeded,
    NoRoute,
    DuplicateRequest,
    /// Forwarding would only send the packet back out the inbound link.
    WouldBacktrack,
    /// Our own transmission echoed back to us (multicast loopback).
    OwnEcho,
}

/// One routing decision, executed by the dispatch loop.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Action {
    /// Packet is addressed to this node; hand the body up.
    Deliver(Packet),
    /// Transmit `packet` into the subnetwork named by `via`.
    Send { packet: Packet, via: Locator },
    Drop { packet: Packet, reason: DropReason },
}

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub mode: RoutingMode,
    pub hop_limit: u8,
    pub number_of_paths: usize,
    pub reply_policy: ReplyPolicy,
}

/// A usable next hop for a packet, with the destination's subnet when the
/// underlying path is complete enough to name it.
struct Candidate {
    via: Locator,
    hop_count: u8,
    dest_subnet: Option<Locator>,
}

struct PendingRoute {
    request_id: u16,
    dest: Address,
    packets: Vec<Packet>,
    attempts: u32,
    last_attempt: Instant,
}

pub struct RoutingEngine {
    config: EngineConfig,
    pending: HashMap<Identifier, PendingRoute>,
    seen_requests: LruCache<(Identifier, u16), ()>,
    /// Smooth weighted round-robin credit per destination and next hop.
    wrr_credits: HashMap<Identifier, HashMap<Locator, f64>>,
    next_request_id: u16,
    rng: StdRng,
}

impl RoutingEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self::with_rng(config, StdRng::from_entropy())
    }

    pub fn with_rng(config: EngineConfig, rng: StdRng) -> Self {
        Self {
            config,
            pending: HashMap::new(),
            seen_requests: LruCache::new(
                NonZeroUsize::new(SEEN_REQUEST_CAPACITY).expect("capacity is nonzero"),
            ),
            wrr_credits: HashMap::new(),
            next_request_id: 1,
            rng,
        }
    }

    pub fn mode(&self) -> RoutingMode {
        self.config.mode
    }

    /// Entry point for every packet dequeued by the dispatch loop.
    /// `inbound` is the locator the packet arrived on, `None` for local
    /// originations.
    pub fn handle_packet(
        &mut self,
        packet: Packet,
        inbound: Option<Locator>,
        store: &IdentityStore,
        table: &mut RouteTable,
        now: Instant,
    ) -> Vec<Action> {
        let my_id = store.identifier();

        if inbound.is_some() && packet.src.id == my_id {
            return vec![Action::Drop {
                packet,
                reason: DropReason::OwnEcho,
            }];
        }

        // Backwards learning: the packet's source is reachable via the link
        // it arrived on, at a cost of the hops it has travelled so far.
        // Random-walk mode keeps no route state at all. A reply addressed to
        // us installs its path explicitly under the reply policy instead,
        // but a reply in transit still teaches this node the way to the
        // destination that answered; without that, intermediates on a long
        // path could never forward the data that follows the reply.
        let reply_for_me = matches!(packet.body, PacketBody::RouteReply { .. })
            && packet.dst.id == my_id;
        if self.config.mode != RoutingMode::RandomWalk && !reply_for_me {
            if let Some(arriving) = inbound {
                // hop_count counts forwarding nodes; the subnet the packet
                // crossed to reach us is one more.
                let cost = packet.hop_count.saturating_add(1);
                table.insert_or_refresh(packet.src.id, vec![arriving], cost, now);
            }
        }

        match &packet.body {
            PacketBody::RouteRequest { .. } => self.on_route_request(packet, inbound, store, table, now),
            PacketBody::RouteReply { .. } => self.on_route_reply(packet, inbound, store, table, now),
            PacketBody::Data(_) | PacketBody::LocatorUpdate(_) => {
                self.route_unicast(packet, inbound, store, table, now)
            }
        }
    }

    /// Routes a data or locator-update packet towards `packet.dst`.
    pub fn route_unicast(
        &mut self,
        mut packet: Packet,
        inbound: Option<Locator>,
        store: &IdentityStore,
        table: &mut RouteTable,
        now: Instant,
    ) -> Vec<Action> {
        if packet.dst.id == store.identifier() {
            return vec![Action::Deliver(packet)];
        }

        // Destination sits in one of our subnetworks: one hop away.
        if store.has_locator(packet.dst.loc) {
            if inbound == Some(packet.dst.loc) {
                // Everyone on that link already saw this transmission.
                return vec![Action::Drop {
                    packet,
                    reason: DropReason::WouldBacktrack,
                }];
            }
            let via = packet.dst.loc;
            return self.forward(packet, via);
        }

        if self.config.mode != RoutingMode::RandomWalk {
            if let Some(choice) = self.select_next_hop(&packet, table, store) {
                // Stamp the destination's subnet when the chosen path names
                // it, so downstream nodes can forward by locator adjacency
                // without a table entry of their own.
                if let Some(subnet) = choice.dest_subnet {
                    if inbound.is_none() || packet.dst.loc == Locator(0) {
                        packet.dst.loc = subnet;
                    }
                }
                table.refresh(packet.dst.id, choice.via, now);
                return self.forward(packet, choice.via);
            }
        }

        // NEED_ROUTE and nothing cached.
        match self.config.mode {
            RoutingMode::RandomWalk => self.random_walk(packet, inbound, store),
            RoutingMode::Multipath | RoutingMode::OnDemand => {
                if matches!(packet.body, PacketBody::LocatorUpdate(_)) {
                    // Locator updates for unresolved destinations are
                    // flooded rather than buffered, locally originated ones
                    // included; they must outrun stale routes.
                    self.flood(packet, inbound, store)
                } else if inbound.is_none() {
                    self.start_discovery(packet, store, now)
                } else {
                    debug!(dst = %packet.dst, "no route for forwarded packet, discarding");
                    vec![Action::Drop {
                        packet,
                        reason: DropReason::NoRoute,
                    }]
                }
            }
        }
    }

    /// Periodic upkeep: retries aged route requests and abandons those past
    /// the attempt budget, dropping their buffered packets.
    pub fn maintenance(&mut self, store: &IdentityStore, now: Instant) -> Vec<Action> {
        let mut actions = Vec::new();
        let mut abandoned = Vec::new();
        let mut due = Vec::new();

        for (dest_id, pending) in self.pending.iter() {
            if now.saturating_duration_since(pending.last_attempt) < REQUEST_RETRY_AFTER {
                continue;
            }
            if pending.attempts >= MAX_REQUEST_ATTEMPTS {
                abandoned.push(*dest_id);
            } else {
                due.push(*dest_id);
            }
        }

        for dest_id in due {
            // A fresh request id per retry: the whole network already holds
            // the previous flood in its duplicate filters, the destination
            // included.
            let request_id = self.next_request_id();
            self.seen_requests.put((store.identifier(), request_id), ());
            let Some(pending) = self.pending.get_mut(&dest_id) else {
                continue;
            };
            pending.request_id = request_id;
            pending.attempts += 1;
            pending.last_attempt = now;
            debug!(dest = %pending.dest, request_id, attempt = pending.attempts, "retrying route request");
            actions.extend(flood_route_request(request_id, pending.dest, store, None));
        }

        for dest_id in abandoned {
            if let Some(pending) = self.pending.remove(&dest_id) {
                debug!(dest = %pending.dest, "abandoning route discovery");
                for packet in pending.packets {
                    actions.push(Action::Drop {
                        packet,
                        reason: DropReason::NoRoute,
                    });
                }
            }
        }

        actions
    }

    /// Number of destinations with a discovery in flight.
    pub fn pending_discoveries(&self) -> usize {
        self.pending.len()
    }

    fn forward(&mut self, mut packet: Packet, via: Locator) -> Vec<Action> {
        if packet.hop_count >= self.config.hop_limit {
            trace!(dst = %packet.dst, "hop limit reached, dropping");
            return vec![Action::Drop {
                packet,
                reason: DropReason::HopLimitExceeded,
            }];
        }
        packet.hop_count += 1;
        vec![Action::Send { packet, via }]
    }

    /// Multipath and cached-route next-hop selection. Only paths whose next
    /// hop is one of our current interfaces are usable, and only paths that
    /// still fit the packet's remaining hop budget qualify.
    fn select_next_hop(
        &mut self,
        packet: &Packet,
        table: &RouteTable,
        store: &IdentityStore,
    ) -> Option<Candidate> {
        let locators = store.locators();
        let remaining = self.config.hop_limit.saturating_sub(packet.hop_count);

        let mut usable: Vec<Candidate> = table
            .expand(packet.dst.id)
            .into_iter()
            .filter(|path| path.hop_count <= remaining)
            .filter_map(|path| {
                let via = path.next_hop()?;
                if !locators.contains(&via) {
                    return None;
                }
                // A path naming every traversed subnet ends at the
                // destination's; a backwards-learned shortcut only knows the
                // first leg.
                let complete = path.hops.len() == usize::from(path.hop_count);
                Some(Candidate {
                    via,
                    hop_count: path.hop_count,
                    dest_subnet: complete.then(|| path.hops.last().copied()).flatten(),
                })
            })
            .collect();
        usable.truncate(self.config.number_of_paths.max(1));

        if usable.is_empty() {
            return None;
        }

        match self.config.mode {
            RoutingMode::Multipath if usable.len() > 1 => {
                Some(self.select_weighted(packet.dst.id, usable))
            }
            _ => usable.into_iter().next(),
        }
    }

    /// Smooth weighted round-robin across candidate next hops, weight =
    /// 1 / hop_count. Spreads load proportionally without randomness.
    fn select_weighted(&mut self, dest: Identifier, candidates: Vec<Candidate>) -> Candidate {
        let credits = self.wrr_credits.entry(dest).or_default();
        credits.retain(|hop, _| candidates.iter().any(|c| c.via == *hop));

        let mut total_weight = 0.0;
        for candidate in &candidates {
            let weight = 1.0 / f64::from(candidate.hop_count).max(1.0);
            total_weight += weight;
            *credits.entry(candidate.via).or_insert(0.0) += weight;
        }

        let chosen = *credits
            .iter()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(hop, _)| hop)
            .expect("candidates are nonempty");

        if let Some(credit) = credits.get_mut(&chosen) {
            *credit -= total_weight;
        }
        candidates
            .into_iter()
            .find(|c| c.via == chosen)
            .expect("chosen credit belongs to a candidate")
    }

    /// Random-walk forwarding: uniform choice among our interfaces,
    /// excluding the inbound link.
    fn random_walk(
        &mut self,
        packet: Packet,
        inbound: Option<Locator>,
        store: &IdentityStore,
    ) -> Vec<Action> {
        let locators = store.locators();
        let candidates: Vec<Locator> = locators
            .iter()
            .copied()
            .filter(|loc| Some(*loc) != inbound)
            .collect();

        match candidates.choose(&mut self.rng) {
            Some(via) => {
                let via = *via;
                if packet.hop_count >= self.config.hop_limit {
                    return vec![Action::Drop {
                        packet,
                        reason: DropReason::HopLimitExceeded,
                    }];
                }
                let mut packet = packet;
                packet.hop_count += 1;
                vec![Action::Send { packet, via }]
            }
            None => vec![Action::Drop {
                packet,
                reason: DropReason::NoRoute,
            }],
        }
    }

    /// Sends one copy of the packet out every interface except the inbound
    /// one. Used for locator updates with no resolvable route.
    fn flood(
        &mut self,
        packet: Packet,
        inbound: Option<Locator>,
        store: &IdentityStore,
    ) -> Vec<Action> {
        if packet.hop_count >= self.config.hop_limit {
            return vec![Action::Drop {
                packet,
                reason: DropReason::HopLimitExceeded,
            }];
        }
        let mut actions = Vec::new();
        for loc in store.locators().iter().copied() {
            if Some(loc) == inbound {
                continue;
            }
            let mut copy = packet.clone();
            copy.hop_count += 1;
            actions.push(Action::Send { packet: copy, via: loc });
        }
        if actions.is_empty() {
            actions.push(Action::Drop {
                packet,
                reason: DropReason::WouldBacktrack,
            });
        }
        actions
    }

    /// Buffers the packet and floods a route request for its destination.
    /// `ROUTE_REQUESTED`: further packets for the same destination join the
    /// buffer without a second flood.
    fn start_discovery(
        &mut self,
        packet: Packet,
        store: &IdentityStore,
        now: Instant,
    ) -> Vec<Action> {
        let dest = packet.dst;

        if let Some(pending) = self.pending.get_mut(&dest.id) {
            if pending.packets.len() < PENDING_PACKETS_PER_DEST {
                pending.packets.push(packet);
            } else {
                debug!(dest = %dest, "pending buffer full, dropping packet");
                return vec![Action::Drop {
                    packet,
                    reason: DropReason::NoRoute,
                }];
            }
            return Vec::new();
        }

        let request_id = self.next_request_id();
        // Remember our own request so the flood echo is ignored.
        self.seen_requests.put((store.identifier(), request_id), ());
        self.pending.insert(
            dest.id,
            PendingRoute {
                request_id,
                dest,
                packets: vec![packet],
                attempts: 1,
                last_attempt: now,
            },
        );
        debug!(dest = %dest, request_id, "flooding route request");
        flood_route_request(request_id, dest, store, None)
    }

    fn on_route_request(
        &mut self,
        packet: Packet,
        inbound: Option<Locator>,
        store: &IdentityStore,
        table: &mut RouteTable,
        now: Instant,
    ) -> Vec<Action> {
        let (request_id, visited) = match &packet.body {
            PacketBody::RouteRequest { request_id, visited } => (*request_id, visited.clone()),
            _ => unreachable!("dispatched by body type"),
        };

        if self.seen_requests.contains(&(packet.src.id, request_id)) {
            return vec![Action::Drop {
                packet,
                reason: DropReason::DuplicateRequest,
            }];
        }
        self.seen_requests.put((packet.src.id, request_id), ());

        // The visited list also teaches us the reverse path to the
        // requester: it is `visited` reversed, entered via the inbound link.
        if let Some(arriving) = inbound {
            let mut reverse = vec![arriving];
            reverse.extend(visited.iter().rev().skip(1));
            let cost = (visited.len() as u8).max(1);
            table.insert_or_refresh(packet.src.id, reverse, cost, now);
        }

        if packet.dst.id == store.identifier() {
            debug!(from = %packet.src, request_id, "answering route request");
            let reply_src = store.primary_address();
            return self.send_route_reply(reply_src, packet.src, request_id, visited, inbound, store, table);
        }

        // A complete cached route lets us answer on the destination's
        // behalf; a backwards-learned shortcut cannot, it does not name the
        // subnets in between.
        if let Some(path) = table.lookup(packet.dst.id) {
            let locators = store.locators();
            let complete = path.hops.len() == usize::from(path.hop_count);
            if complete && path.next_hop().is_some_and(|hop| locators.contains(&hop)) {
                let mut full = visited.clone();
                full.extend(path.hops.iter().copied());
                if full.len() <= usize::from(self.config.hop_limit) {
                    debug!(dest = %packet.dst, request_id, "answering route request from cache");
                    // The reply speaks for the destination: the requester
                    // matches replies against the destination's identifier,
                    // not ours.
                    let subnet = full.last().copied().unwrap_or(packet.dst.loc);
                    let reply_src = Address::new(subnet, packet.dst.id);
                    return self.send_route_reply(reply_src, packet.src, request_id, full, inbound, store, table);
                }
            }
        }

        // Forward the flood, appending our outbound locator to each copy.
        if packet.hop_count >= self.config.hop_limit {
            return vec![Action::Drop {
                packet,
                reason: DropReason::HopLimitExceeded,
            }];
        }
        let mut actions = Vec::new();
        for loc in store.locators().iter().copied() {
            if Some(loc) == inbound {
                continue;
            }
            let mut branch_visited = visited.clone();
            branch_visited.push(loc);
            let mut copy = packet.clone();
            copy.hop_count += 1;
            copy.body = PacketBody::RouteRequest {
                request_id,
                visited: branch_visited,
            };
            actions.push(Action::Send { packet: copy, via: loc });
        }
        if actions.is_empty() {
            actions.push(Action::Drop {
                packet,
                reason: DropReason::WouldBacktrack,
            });
        }
        actions
    }

    #[allow(clippy::too_many_arguments)]
    fn send_route_reply(
        &mut self,
        reply_src: Address,
        requester: Address,
        request_id: u16,
        path: Vec<Locator>,
        inbound: Option<Locator>,
        store: &IdentityStore,
        table: &mut RouteTable,
    ) -> Vec<Action> {
        let reply = Packet::new(
            reply_src,
            requester,
            PacketBody::RouteReply { request_id, path },
        );

        // Prefer the learned reverse route; the inbound link always works as
        // a fallback since the request just arrived over it.
        if let Some(choice) = self.select_next_hop(&reply, table, store) {
            return self.forward(reply, choice.via);
        }
        match inbound {
            Some(via) => self.forward(reply, via),
            None => vec![Action::Drop {
                packet: reply,
                reason: DropReason::NoRoute,
            }],
        }
    }

    fn on_route_reply(
        &mut self,
        packet: Packet,
        inbound: Option<Locator>,
        store: &IdentityStore,
        table: &mut RouteTable,
        now: Instant,
    ) -> Vec<Action> {
        let (request_id, path) = match &packet.body {
            PacketBody::RouteReply { request_id, path } => (*request_id, path.clone()),
            _ => unreachable!("dispatched by body type"),
        };

        if packet.dst.id != store.identifier() {
            // In transit back to the requester.
            return self.route_unicast(packet, inbound, store, table, now);
        }

        let replier = packet.src.id;
        let hop_count = (path.len() as u8).max(1);

        match self.pending.remove(&replier) {
            Some(pending) if pending.request_id == request_id => {
                debug!(dest = %pending.dest, request_id, hops = path.len(), "route discovered");
                table.insert_or_refresh(replier, path, hop_count, now);
                let mut actions = Vec::new();
                for buffered in pending.packets {
                    actions.extend(self.route_unicast(buffered, None, store, table, now));
                }
                actions
            }
            Some(pending) => {
                // Stale request id: keep waiting for the right reply.
                let stale = pending.request_id;
                self.pending.insert(replier, pending);
                trace!(request_id, expected = stale, "ignoring reply for stale request");
                Vec::new()
            }
            None => {
                // Duplicate reply after the route is cached.
                let accept = match self.config.reply_policy {
                    ReplyPolicy::FirstWins => false,
                    ReplyPolicy::PreferShorter => table
                        .lookup(replier)
                        .map(|best| u32::from(hop_count) < best.metric())
                        .unwrap_or(true),
                };
                if accept {
                    debug!(from = %packet.src, request_id, "adopting shorter duplicate reply");
                    table.insert_or_refresh(replier, path, hop_count, now);
                }
                Vec::new()
            }
        }
    }

    fn next_request_id(&mut self) -> u16 {
        let id = self.next_request_id;
        self.next_request_id = self.next_request_id.wrapping_add(1).max(1);
        id
    }
}

/// One route-request copy per interface, each carrying that interface's
/// locator as the first visited entry so replies describe a usable path.
fn flood_route_request(
    request_id: u16,
    dest: Address,
    store: &IdentityStore,
    exclude: Option<Locator>,
) -> Vec<Action> {
    let src = store.primary_address();
    let mut actions = Vec::new();
    for loc in store.locators().iter().copied() {
        if Some(loc) == exclude {
            continue;
        }
        let packet = Packet::new(
            src,
            dest,
            PacketBody::RouteRequest {
                request_id,
                visited: vec![loc],
            },
        );
        actions.push(Action::Send { packet, via: loc });
    }
    actions
}
