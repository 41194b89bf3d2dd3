//! # Dispatch Loop
//!
//! The concurrency core of a node. One task owns every piece of mutable
//! routing state (identity store writes, route table, correspondent set,
//! locator updater, logs) and everything else communicates with it over
//! channels: receive tasks enqueue raw datagrams, the node API enqueues
//! commands. Single-writer discipline means no locks around routing state
//! and no internal races.
//!
//! Per iteration the loop either
//!
//! - decodes and routes one inbound datagram,
//! - executes one command (origination, locator change, shutdown), or
//! - runs the maintenance tick: stale route/correspondent eviction, route
//!   request retries, log flushing, and the external shutdown toggle.
//!
//! Network sends are fire-and-forget with a bounded retry count; each
//! attempt carries a timeout derived from the send delay so nothing blocks
//! the loop indefinitely. No packet-processing error is fatal: malformed
//! and oversized datagrams are logged and dropped while the loop keeps
//! serving.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use crate::config::Config;
use crate::engine::{Action, EngineConfig, RoutingEngine};
use crate::identity::{Address, IdentityStore, InvalidLocatorError, Locator};
use crate::locator_update::{LocatorUpdater, UpdateOutcome};
use crate::packet::{Packet, PacketBody, PacketError};
use crate::sink::{Monitor, SinkLog};
use crate::table::{CorrespondentSet, RouteTable};
use crate::transport::{Outbound, RawDatagram};

/// Attempts per packet before a send is abandoned.
const SEND_RETRIES: u32 = 3;

/// Set (non-empty, not "0") by the orchestration to request graceful
/// shutdown; checked on every maintenance tick.
pub const SHUTDOWN_ENV: &str = "WAYPOST_SHUTDOWN";

/// Commands from the node API to the dispatch loop.
#[derive(Debug)]
pub enum Event {
    /// Originate a data packet. Subject to the lifetime send budget.
    SendData { dst: Address, payload: Vec<u8> },
    /// Replace the locator set and announce the change to correspondents.
    SetLocators {
        new: Vec<Locator>,
        done: oneshot::Sender<Result<(), InvalidLocatorError>>,
    },
    Shutdown,
}

/// A payload that reached this node, handed to the API consumer.
#[derive(Debug)]
pub struct Delivered {
    pub from: Address,
    pub payload: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("datagram of {len} bytes exceeds packet buffer of {cap} bytes")]
    OversizedPacket { len: usize, cap: usize },
    #[error(transparent)]
    Malformed(#[from] PacketError),
}

pub struct Dispatcher {
    store: Arc<IdentityStore>,
    engine: RoutingEngine,
    table: RouteTable,
    correspondents: CorrespondentSet,
    updater: LocatorUpdater,
    outbound: Arc<dyn Outbound>,
    monitor: Monitor,
    sink_log: Option<SinkLog>,
    delivered_tx: mpsc::Sender<Delivered>,
    events: mpsc::Receiver<Event>,
    inbound: mpsc::Receiver<RawDatagram>,
    buffer_cap: usize,
    max_sends: u64,
    sends_used: u64,
    send_timeout: Duration,
    maintenance_interval: Duration,
}

impl Dispatcher {
    pub fn new(
        config: &Config,
        store: Arc<IdentityStore>,
        outbound: Arc<dyn Outbound>,
        events: mpsc::Receiver<Event>,
        inbound: mpsc::Receiver<RawDatagram>,
        delivered_tx: mpsc::Sender<Delivered>,
    ) -> Self {
        let engine = RoutingEngine::new(EngineConfig {
            mode: config.mode,
            hop_limit: config.hop_limit,
            number_of_paths: config.number_of_paths,
            reply_policy: config.reply_policy,
        });
        let table = RouteTable::new(
            config.hop_limit,
            config.number_of_paths,
            config.router_refresh_delay,
        );
        Self {
            engine,
            table,
            correspondents: CorrespondentSet::new(config.correspondent_timeout),
            updater: LocatorUpdater::new(config.unsolicited_updates),
            monitor: Monitor::new(config.my_id, config.save_file_loc.clone()),
            sink_log: config
                .is_sink
                .then(|| SinkLog::new(config.sink_save_file.clone())),
            store,
            outbound,
            delivered_tx,
            events,
            inbound,
            buffer_cap: config.packet_buffer_size_bytes,
            max_sends: config.max_sends,
            sends_used: 0,
            send_timeout: config.send_delay,
            // Retry timing for route discovery needs a finer tick than the
            // refresh delay alone.
            maintenance_interval: config.router_refresh_delay.min(Duration::from_secs(10)),
        }
    }

    /// Runs until a shutdown command arrives, the shutdown toggle is set, or
    /// every command sender is gone. Drains queued datagrams before exiting.
    pub async fn run(mut self) {
        let mut tick = tokio::time::interval(self.maintenance_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick fires immediately; skip it.
        tick.tick().await;

        loop {
            tokio::select! {
                event = self.events.recv() => match event {
                    Some(Event::Shutdown) | None => break,
                    Some(event) => self.handle_event(event).await,
                },
                Some(datagram) = self.inbound.recv() => self.handle_datagram(datagram).await,
                _ = tick.tick() => {
                    if self.maintenance().await {
                        break;
                    }
                }
            }
        }

        self.drain().await;
        self.flush_logs();
        info!("dispatch loop stopped");
    }

    async fn handle_event(&mut self, event: Event) {
        match event {
            Event::SendData { dst, payload } => self.originate(dst, payload).await,
            Event::SetLocators { new, done } => {
                let result = self.apply_locator_change(new).await;
                let _ = done.send(result);
            }
            Event::Shutdown => unreachable!("handled by the run loop"),
        }
    }

    /// Local origination, counted against the lifetime send budget.
    /// Forwarding of others' traffic is never budgeted.
    async fn originate(&mut self, dst: Address, payload: Vec<u8>) {
        if self.sends_used >= self.max_sends {
            warn!(%dst, budget = self.max_sends, "origination suppressed, send budget exhausted");
            return;
        }
        self.sends_used += 1;

        let now = Instant::now();
        self.correspondents.note_activity(dst.id, now);
        let packet = Packet::new(self.store.primary_address(), dst, PacketBody::Data(payload));
        let actions = self
            .engine
            .route_unicast(packet, None, &self.store, &mut self.table, now);
        self.execute(actions).await;
    }

    async fn apply_locator_change(
        &mut self,
        new: Vec<Locator>,
    ) -> Result<(), InvalidLocatorError> {
        let previous = self.store.set_locators(new)?;
        let current = self.store.locators();
        info!(?previous, ?current, "locator set replaced");

        if let Err(e) = self.outbound.update_groups(&current).await {
            warn!(error = %e, "failed to reconcile group membership");
        }

        let abandoned: Vec<Locator> = previous
            .iter()
            .copied()
            .filter(|loc| !current.contains(loc))
            .collect();
        let purged = self.table.purge_locators(&abandoned);
        if purged > 0 {
            debug!(purged, "purged routes through abandoned locators");
        }

        let now = Instant::now();
        let peers = self.correspondents.active(now);
        let updates = self.updater.on_local_locator_change(&self.store, &peers);
        for packet in updates {
            let actions = self
                .engine
                .route_unicast(packet, None, &self.store, &mut self.table, now);
            self.execute(actions).await;
        }
        Ok(())
    }

    async fn handle_datagram(&mut self, datagram: RawDatagram) {
        match self.validate(&datagram) {
            Ok(packet) => {
                let now = Instant::now();
                let actions = self.engine.handle_packet(
                    packet,
                    Some(datagram.arrived_on),
                    &self.store,
                    &mut self.table,
                    now,
                );
                self.execute(actions).await;
            }
            Err(e) => {
                warn!(arrived_on = %datagram.arrived_on, error = %e, "dropping datagram");
            }
        }
    }

    fn validate(&self, datagram: &RawDatagram) -> Result<Packet, DispatchError> {
        if datagram.bytes.len() > self.buffer_cap {
            return Err(DispatchError::OversizedPacket {
                len: datagram.bytes.len(),
                cap: self.buffer_cap,
            });
        }
        Ok(Packet::decode(&datagram.bytes)?)
    }

    async fn execute(&mut self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Deliver(packet) => self.deliver(packet).await,
                Action::Send { packet, via } => self.transmit(packet, via).await,
                Action::Drop { packet, reason } => {
                    trace!(dst = %packet.dst, ?reason, "packet dropped");
                }
            }
        }
    }

    async fn deliver(&mut self, packet: Packet) {
        let now = Instant::now();
        // Correspondent status before this packet decides whether a locator
        // update counts as solicited.
        let known = self.correspondents.is_active(packet.src.id, now);
        self.correspondents.note_activity(packet.src.id, now);

        match packet.body {
            PacketBody::Data(payload) => {
                trace!(from = %packet.src, len = payload.len(), "payload delivered");
                if let Some(sink_log) = &mut self.sink_log {
                    sink_log.record_payload(&payload);
                }
                let _ = self
                    .delivered_tx
                    .send(Delivered {
                        from: packet.src,
                        payload,
                    })
                    .await;
            }
            PacketBody::LocatorUpdate(locators) => {
                match self.updater.on_update_received(packet.src, &locators, known) {
                    UpdateOutcome::Applied { removed } => {
                        let purged = self.table.purge_locators(&removed)
                            + self.table.purge_moved_peer(packet.src.id, &locators);
                        if purged > 0 {
                            debug!(from = %packet.src, purged, "purged routes through retired locators");
                        }
                    }
                    UpdateOutcome::Ignored => {}
                }
            }
            PacketBody::RouteRequest { .. } | PacketBody::RouteReply { .. } => {
                debug!(from = %packet.src, "control packet surfaced to delivery, ignoring");
            }
        }
    }

    /// Fire-and-forget send with bounded retries; each attempt is bounded by
    /// the send timeout. Giving up demotes the path that failed.
    async fn transmit(&mut self, packet: Packet, via: Locator) {
        let bytes = match packet.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(dst = %packet.dst, error = %e, "cannot encode packet");
                return;
            }
        };

        let forwarded = packet.src.id != self.store.identifier();
        for attempt in 1..=SEND_RETRIES {
            match tokio::time::timeout(self.send_timeout, self.outbound.send(&bytes, via)).await {
                Ok(Ok(())) => {
                    self.monitor.record_sent(&packet, forwarded);
                    return;
                }
                Ok(Err(e)) => {
                    warn!(%via, attempt, error = %e, "send failed");
                }
                Err(_) => {
                    warn!(%via, attempt, "send timed out");
                }
            }
        }
        warn!(dst = %packet.dst, %via, "giving up on send, demoting path");
        self.table.record_failure(packet.dst.id, via);
    }

    /// Returns true when the environment toggle requests shutdown.
    async fn maintenance(&mut self) -> bool {
        let now = Instant::now();

        let evicted = self.table.evict_stale(now);
        if evicted > 0 {
            debug!(evicted, "evicted stale routes");
        }
        for peer in self.correspondents.evict_stale(now) {
            trace!(%peer, "correspondent aged out");
            self.updater.forget(peer);
        }

        let actions = self.engine.maintenance(&self.store, now);
        self.execute(actions).await;

        self.flush_logs();

        match std::env::var_os(SHUTDOWN_ENV) {
            Some(value) if !value.is_empty() && value != "0" => {
                info!("shutdown toggle set, stopping");
                true
            }
            _ => false,
        }
    }

    /// Processes datagrams already queued at shutdown; new originations are
    /// no longer accepted at this point.
    async fn drain(&mut self) {
        while let Ok(datagram) = self.inbound.try_recv() {
            self.handle_datagram(datagram).await;
        }
    }

    fn flush_logs(&mut self) {
        if let Err(e) = self.monitor.save() {
            warn!(error = %e, "failed to flush send log");
        }
        if let Some(sink_log) = &mut self.sink_log {
            if let Err(e) = sink_log.save() {
                warn!(error = %e, "failed to flush sink log");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ReplyPolicy, RoutingMode};
    use crate::identity::Identifier;
    use crate::locator_update::UnsolicitedUpdatePolicy;
    use std::io;
    use std::sync::Mutex;

    /// In-memory network capturing everything a node transmits.
    #[derive(Default)]
    struct MockNet {
        sent: Mutex<Vec<(Vec<u8>, Locator)>>,
    }

    impl MockNet {
        fn sent_packets(&self) -> Vec<(Packet, Locator)> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .map(|(bytes, via)| (Packet::decode(bytes).unwrap(), *via))
                .collect()
        }
    }

    #[async_trait::async_trait]
    impl Outbound for MockNet {
        async fn send(&self, bytes: &[u8], via: Locator) -> io::Result<()> {
            self.sent.lock().unwrap().push((bytes.to_vec(), via));
            Ok(())
        }
    }

    fn test_config(dir: &tempfile::TempDir) -> Config {
        Config {
            my_id: Identifier(1),
            locators: vec![Locator(10), Locator(30)],
            port: 9000,
            hop_limit: 8,
            packet_buffer_size_bytes: 4096,
            loopback: false,
            unique_identifier: "1".to_string(),
            multicast_interface: 0,
            router_refresh_delay: Duration::from_secs(60),
            correspondent_timeout: Duration::from_secs(120),
            mode: RoutingMode::OnDemand,
            reply_policy: ReplyPolicy::FirstWins,
            number_of_paths: 3,
            unsolicited_updates: UnsolicitedUpdatePolicy::Accept,
            max_sends: 3,
            send_delay: Duration::from_secs(1),
            save_file_loc: dir.path().join("send.csv"),
            sink_loc: Locator(10),
            sink_id: Identifier(1),
            sink_save_file: dir.path().join("sink.csv"),
            is_sink: false,
        }
    }

    struct Harness {
        dispatcher: Dispatcher,
        net: Arc<MockNet>,
        delivered_rx: mpsc::Receiver<Delivered>,
        _events_tx: mpsc::Sender<Event>,
        _inbound_tx: mpsc::Sender<RawDatagram>,
        _dir: tempfile::TempDir,
    }

    fn harness(configure: impl FnOnce(&mut Config)) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(&dir);
        configure(&mut config);
        let store = Arc::new(IdentityStore::new(config.my_id, config.locators.clone()).unwrap());
        let net = Arc::new(MockNet::default());
        let (events_tx, events_rx) = mpsc::channel(16);
        let (inbound_tx, inbound_rx) = mpsc::channel(16);
        let (delivered_tx, delivered_rx) = mpsc::channel(16);
        let dispatcher = Dispatcher::new(
            &config,
            store,
            net.clone(),
            events_rx,
            inbound_rx,
            delivered_tx,
        );
        Harness {
            dispatcher,
            net,
            delivered_rx,
            _events_tx: events_tx,
            _inbound_tx: inbound_tx,
            _dir: dir,
        }
    }

    fn datagram(packet: &Packet, arrived_on: Locator) -> RawDatagram {
        RawDatagram {
            bytes: packet.encode().unwrap(),
            arrived_on,
        }
    }

    #[tokio::test]
    async fn oversized_datagram_rejected_loop_continues() {
        let mut h = harness(|_| {});

        h.dispatcher
            .handle_datagram(RawDatagram {
                bytes: vec![0; 5000],
                arrived_on: Locator(10),
            })
            .await;
        assert!(h.net.sent_packets().is_empty());

        // A well-formed packet right after is still served.
        let packet = Packet::new(
            Address::new(Locator(10), Identifier(2)),
            Address::new(Locator(30), Identifier(3)),
            PacketBody::Data(b"x".to_vec()),
        );
        h.dispatcher.handle_datagram(datagram(&packet, Locator(10))).await;
        let sent = h.net.sent_packets();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, Locator(30));
    }

    #[tokio::test]
    async fn malformed_datagram_dropped() {
        let mut h = harness(|_| {});
        h.dispatcher
            .handle_datagram(RawDatagram {
                bytes: vec![0xFF; 40],
                arrived_on: Locator(10),
            })
            .await;
        assert!(h.net.sent_packets().is_empty());
    }

    #[tokio::test]
    async fn send_budget_limits_originations_but_not_forwarding() {
        let mut h = harness(|c| c.max_sends = 3);
        // Destination adjacent on locator 30, so each origination is one send.
        let dst = Address::new(Locator(30), Identifier(5));

        for i in 0..5u8 {
            h.dispatcher
                .handle_event(Event::SendData {
                    dst,
                    payload: vec![i],
                })
                .await;
        }
        assert_eq!(h.net.sent_packets().len(), 3);

        // Forwarding someone else's traffic is unaffected by the exhausted
        // budget.
        let transit = Packet::new(
            Address::new(Locator(10), Identifier(2)),
            Address::new(Locator(30), Identifier(3)),
            PacketBody::Data(b"x".to_vec()),
        );
        h.dispatcher.handle_datagram(datagram(&transit, Locator(10))).await;
        assert_eq!(h.net.sent_packets().len(), 4);
    }

    #[tokio::test]
    async fn delivered_payload_reaches_receiver() {
        let mut h = harness(|_| {});
        let packet = Packet::new(
            Address::new(Locator(20), Identifier(2)),
            Address::new(Locator(10), Identifier(1)),
            PacketBody::Data(b"hello".to_vec()),
        );
        h.dispatcher.handle_datagram(datagram(&packet, Locator(10))).await;

        let delivered = h.delivered_rx.try_recv().unwrap();
        assert_eq!(delivered.from.id, Identifier(2));
        assert_eq!(delivered.payload, b"hello");
    }

    #[tokio::test]
    async fn locator_change_announces_and_purges() {
        let mut h = harness(|_| {});

        // Make peer 2 an active correspondent with a route through 20.
        let packet = Packet::new(
            Address::new(Locator(20), Identifier(2)),
            Address::new(Locator(10), Identifier(1)),
            PacketBody::Data(b"hi".to_vec()),
        );
        h.dispatcher.handle_datagram(datagram(&packet, Locator(10))).await;

        let (done, done_rx) = oneshot::channel();
        h.dispatcher
            .handle_event(Event::SetLocators {
                new: vec![Locator(10), Locator(40)],
                done,
            })
            .await;
        done_rx.await.unwrap().unwrap();

        let updates: Vec<(Packet, Locator)> = h
            .net
            .sent_packets()
            .into_iter()
            .filter(|(p, _)| matches!(p.body, PacketBody::LocatorUpdate(_)))
            .collect();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].0.dst.id, Identifier(2));
        match &updates[0].0.body {
            PacketBody::LocatorUpdate(locs) => {
                assert_eq!(locs, &vec![Locator(10), Locator(40)]);
            }
            other => panic!("expected locator update, got {other:?}"),
        }

        // Unchanged set announces nothing.
        let before = h.net.sent_packets().len();
        let (done, done_rx) = oneshot::channel();
        h.dispatcher
            .handle_event(Event::SetLocators {
                new: vec![Locator(10), Locator(40)],
                done,
            })
            .await;
        done_rx.await.unwrap().unwrap();
        assert_eq!(h.net.sent_packets().len(), before);
    }

    #[tokio::test]
    async fn received_locator_update_purges_routes() {
        let mut h = harness(|_| {});

        // Peer 2 becomes a correspondent; we also learn a route to peer 3
        // through locator 50.
        let from_two = Packet::new(
            Address::new(Locator(20), Identifier(2)),
            Address::new(Locator(10), Identifier(1)),
            PacketBody::Data(b"hi".to_vec()),
        );
        h.dispatcher.handle_datagram(datagram(&from_two, Locator(10))).await;
        h.dispatcher
            .updater
            .on_update_received(
                Address::new(Locator(20), Identifier(2)),
                &[Locator(50)],
                true,
            );
        let now = Instant::now();
        h.dispatcher
            .table
            .insert_or_refresh(Identifier(3), vec![Locator(10), Locator(50)], 2, now);

        // Peer 2 abandons locator 50.
        let mut update = Packet::new(
            Address::new(Locator(20), Identifier(2)),
            Address::new(Locator(10), Identifier(1)),
            PacketBody::LocatorUpdate(vec![Locator(60)]),
        );
        update.hop_count = 1;
        h.dispatcher.handle_datagram(datagram(&update, Locator(10))).await;
        assert!(!h.dispatcher.table.contains(Identifier(3)));
    }

    #[tokio::test]
    async fn sink_records_delivered_readings() {
        let mut h = harness(|c| c.is_sink = true);
        let reading = crate::sink::SensorReading {
            temperature_kelvin: 290.0,
            humidity_pct: 55,
            pressure_hpa: 1000,
            uv_index: 3,
        };
        let packet = Packet::new(
            Address::new(Locator(20), Identifier(2)),
            Address::new(Locator(10), Identifier(1)),
            PacketBody::Data(reading.to_bytes().to_vec()),
        );
        h.dispatcher.handle_datagram(datagram(&packet, Locator(10))).await;
        h.dispatcher.flush_logs();

        let contents =
            std::fs::read_to_string(h._dir.path().join("sink.csv")).unwrap();
        assert_eq!(contents.lines().count(), 1);
    }
}
