//! # High-Level Node API
//!
//! A [`Node`] wires the identity store, routing engine, locator update
//! protocol and multicast transport together behind one handle. All state
//! lives inside the spawned dispatch loop; the handle only enqueues
//! commands.
//!
//! ## Quick Start
//!
//! ```ignore
//! let config = Config::load(Path::new("experiment.ini"), "node1")?;
//! let node = Node::spawn(config)?;
//!
//! // Send a payload towards another identifier
//! node.send(Address::new(Locator(10), Identifier(3)), b"reading".to_vec()).await?;
//!
//! // Receive payloads addressed to us
//! let mut rx = node.delivered().await?;
//! while let Some(delivered) = rx.recv().await {
//!     println!("from {}: {:?}", delivered.from, delivered.payload);
//! }
//!
//! // Move to a new set of subnetworks
//! node.set_locators(vec![Locator(20), Locator(21)]).await?;
//! ```

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::Config;
use crate::dispatch::{Delivered, Dispatcher, Event};
use crate::identity::{Address, Identifier, IdentityStore, Locator};
use crate::transport::{MulticastTransport, Outbound, RawDatagram};

/// A receiver that can be taken exactly once via `.take()`.
type TakeOnce<T> = tokio::sync::Mutex<Option<mpsc::Receiver<T>>>;

pub struct Node {
    store: Arc<IdentityStore>,
    events: mpsc::Sender<Event>,
    delivered: TakeOnce<Delivered>,
    transport: Option<Arc<MulticastTransport>>,
    dispatcher: JoinHandle<()>,
}

impl Node {
    /// Starts a node on the real multicast transport. Must be called from
    /// within a tokio runtime.
    pub fn spawn(config: Config) -> Result<Self> {
        let (transport, inbound) = MulticastTransport::bind(&config)?;
        let outbound: Arc<dyn Outbound> = transport.clone();
        let mut node = Self::with_outbound(config, outbound, inbound)?;
        node.transport = Some(transport);
        Ok(node)
    }

    /// Starts a node over an arbitrary egress seam. Lets tests run whole
    /// topologies on an in-memory network.
    pub fn with_outbound(
        config: Config,
        outbound: Arc<dyn Outbound>,
        inbound: mpsc::Receiver<RawDatagram>,
    ) -> Result<Self> {
        let store = Arc::new(
            IdentityStore::new(config.my_id, config.locators.clone())
                .context("invalid initial locator set")?,
        );
        let (events_tx, events_rx) = mpsc::channel(64);
        let (delivered_tx, delivered_rx) = mpsc::channel(64);
        let dispatcher = Dispatcher::new(
            &config,
            store.clone(),
            outbound,
            events_rx,
            inbound,
            delivered_tx,
        );
        let handle = tokio::spawn(dispatcher.run());
        info!(id = %store.identifier(), locators = ?store.locators(), "node started");

        Ok(Self {
            store,
            events: events_tx,
            delivered: tokio::sync::Mutex::new(Some(delivered_rx)),
            transport: None,
            dispatcher: handle,
        })
    }

    pub fn identifier(&self) -> Identifier {
        self.store.identifier()
    }

    pub fn locators(&self) -> Vec<Locator> {
        self.store.locators().to_vec()
    }

    pub fn addresses(&self) -> Vec<Address> {
        self.store.addresses()
    }

    /// Takes the receiver of payloads delivered to this node. Can only be
    /// taken once.
    pub async fn delivered(&self) -> Result<mpsc::Receiver<Delivered>> {
        self.delivered
            .lock()
            .await
            .take()
            .context("delivered receiver already taken")
    }

    /// Originates a data packet towards `dst`. Subject to the configured
    /// lifetime send budget; routing does not guarantee delivery.
    pub async fn send(&self, dst: Address, payload: Vec<u8>) -> Result<()> {
        self.events
            .send(Event::SendData { dst, payload })
            .await
            .map_err(|_| anyhow!("dispatch loop stopped"))
    }

    /// Replaces this node's locator set. Active correspondents are notified
    /// and group membership is reconciled before this returns.
    pub async fn set_locators(&self, new: Vec<Locator>) -> Result<()> {
        let (done, confirmed) = oneshot::channel();
        self.events
            .send(Event::SetLocators { new, done })
            .await
            .map_err(|_| anyhow!("dispatch loop stopped"))?;
        confirmed.await.context("dispatch loop stopped")??;
        Ok(())
    }

    /// Graceful shutdown: the dispatch loop drains queued packets and
    /// flushes its logs, then the listening sockets are released.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.events.send(Event::Shutdown).await;
        self.dispatcher.await.context("dispatch task panicked")?;
        if let Some(transport) = self.transport {
            transport.shutdown();
        }
        Ok(())
    }
}
