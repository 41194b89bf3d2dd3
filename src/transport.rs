//! # Multicast Transport
//!
//! Subnetworks are emulated as IPv6 link-local multicast groups: each
//! locator maps to one group address, and a node "attached to" a locator
//! holds a socket joined to that group. Because each listening socket is
//! joined to exactly one group, the socket a datagram arrives on identifies
//! the arriving locator without any address parsing.
//!
//! A group address packs the experiment's unique identifier and the full
//! 64-bit locator into the host segments:
//!
//! ```text
//! ff02:0:0:{uid}:{loc[63:48]}:{loc[47:32]}:{loc[31:16]}:{loc[15:0]}
//! ```
//!
//! One unbound sending socket serves all groups; `IPV6_MULTICAST_LOOP`
//! follows the `loopback` config flag so co-hosted nodes can hear each
//! other.

use std::collections::HashMap;
use std::io;
use std::net::{Ipv6Addr, SocketAddrV6};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::config::Config;
use crate::identity::Locator;

/// One received datagram, tagged with the locator of the group it arrived
/// on.
#[derive(Debug)]
pub struct RawDatagram {
    pub bytes: Vec<u8>,
    pub arrived_on: Locator,
}

/// Network egress seam. The dispatch loop only ever talks to this trait, so
/// tests substitute an in-memory network.
#[async_trait]
pub trait Outbound: Send + Sync {
    /// Transmits encoded packet bytes into the subnetwork named by `via`.
    async fn send(&self, bytes: &[u8], via: Locator) -> io::Result<()>;

    /// Reconciles group membership after a locator-set change. In-memory
    /// test networks have nothing to reconcile.
    async fn update_groups(&self, _current: &[Locator]) -> io::Result<()> {
        Ok(())
    }
}

pub struct MulticastTransport {
    socket: UdpSocket,
    port: u16,
    uid: u16,
    interface: u32,
    buffer_size: usize,
    inbound_tx: mpsc::Sender<RawDatagram>,
    listeners: Mutex<HashMap<Locator, JoinHandle<()>>>,
}

impl MulticastTransport {
    /// Opens the sending socket and one listening socket per configured
    /// locator. Returns the receive side of the inbound datagram queue.
    pub fn bind(config: &Config) -> anyhow::Result<(Arc<Self>, mpsc::Receiver<RawDatagram>)> {
        let uid = u16::from_str_radix(&config.unique_identifier, 16)
            .with_context(|| format!("unique_identifier `{}` is not hex", config.unique_identifier))?;

        let socket = sending_socket(config.loopback, config.multicast_interface)
            .context("failed to open sending socket")?;
        let socket = UdpSocket::from_std(socket).context("failed to register sending socket")?;

        let (inbound_tx, inbound_rx) = mpsc::channel(64);
        let transport = Arc::new(Self {
            socket,
            port: config.port,
            uid,
            interface: config.multicast_interface,
            buffer_size: config.packet_buffer_size_bytes,
            inbound_tx,
            listeners: Mutex::new(HashMap::new()),
        });

        for &loc in &config.locators {
            transport
                .join_group(loc)
                .with_context(|| format!("failed to join group for locator {loc}"))?;
        }
        Ok((transport, inbound_rx))
    }

    pub fn group_address(&self, loc: Locator) -> Ipv6Addr {
        group_address(self.uid, loc)
    }

    /// Joins the group for `loc` and starts its receive task. Re-joining a
    /// group restarts its listener. Must be called from within the runtime.
    pub fn join_group(&self, loc: Locator) -> io::Result<()> {
        let group = self.group_address(loc);
        let socket = listening_socket(group, self.port, self.interface)?;
        let socket = UdpSocket::from_std(socket)?;
        debug!(%loc, %group, "joined multicast group");

        let handle = tokio::spawn(listen(socket, loc, self.buffer_size, self.inbound_tx.clone()));
        let mut listeners = self.listeners.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(previous) = listeners.insert(loc, handle) {
            previous.abort();
        }
        Ok(())
    }

    /// Stops listening on `loc`; dropping the socket leaves the group.
    pub fn leave_group(&self, loc: Locator) {
        let mut listeners = self.listeners.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(handle) = listeners.remove(&loc) {
            handle.abort();
            debug!(%loc, "left multicast group");
        }
    }

    /// Stops all receive tasks and releases the listening sockets.
    pub fn shutdown(&self) {
        let mut listeners = self.listeners.lock().unwrap_or_else(|p| p.into_inner());
        for (_, handle) in listeners.drain() {
            handle.abort();
        }
    }
}

#[async_trait]
impl Outbound for MulticastTransport {
    async fn send(&self, bytes: &[u8], via: Locator) -> io::Result<()> {
        let dest = SocketAddrV6::new(self.group_address(via), self.port, 0, 0);
        trace!(%via, %dest, len = bytes.len(), "transmitting datagram");
        self.socket.send_to(bytes, dest).await?;
        Ok(())
    }

    async fn update_groups(&self, current: &[Locator]) -> io::Result<()> {
        let joined: Vec<Locator> = {
            let listeners = self.listeners.lock().unwrap_or_else(|p| p.into_inner());
            listeners.keys().copied().collect()
        };
        for loc in &joined {
            if !current.contains(loc) {
                self.leave_group(*loc);
            }
        }
        for loc in current {
            if !joined.contains(loc) {
                self.join_group(*loc)?;
            }
        }
        Ok(())
    }
}

/// Receive loop for one group. The buffer is one byte larger than the
/// configured cap so oversized datagrams are detectable downstream instead
/// of silently truncated.
async fn listen(
    socket: UdpSocket,
    arrived_on: Locator,
    buffer_size: usize,
    tx: mpsc::Sender<RawDatagram>,
) {
    loop {
        let mut buf = vec![0u8; buffer_size + 1];
        match socket.recv_from(&mut buf).await {
            Ok((len, _)) => {
                buf.truncate(len);
                if tx
                    .send(RawDatagram {
                        bytes: buf,
                        arrived_on,
                    })
                    .await
                    .is_err()
                {
                    // Dispatch loop is gone; nothing left to do.
                    return;
                }
            }
            Err(e) => {
                warn!(%arrived_on, error = %e, "receive failed");
            }
        }
    }
}

/// Maps (experiment uid, locator) onto a deterministic link-local multicast
/// group address.
pub fn group_address(uid: u16, loc: Locator) -> Ipv6Addr {
    let l = loc.0;
    Ipv6Addr::new(
        0xff02,
        0,
        0,
        uid,
        (l >> 48) as u16,
        (l >> 32) as u16,
        (l >> 16) as u16,
        l as u16,
    )
}

fn sending_socket(loopback: bool, interface: u32) -> io::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_multicast_loop_v6(loopback)?;
    if interface != 0 {
        socket.set_multicast_if_v6(interface)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, 0, 0, 0).into())?;
    Ok(socket.into())
}

fn listening_socket(group: Ipv6Addr, port: u16, interface: u32) -> io::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
    // Several nodes on one host share the port.
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, port, 0, 0).into())?;
    socket.join_multicast_v6(&group, interface)?;
    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_address_is_link_local_and_carries_locator() {
        let addr = group_address(0x3e8, Locator(0x1122_3344_5566_7788));
        assert_eq!(
            addr.segments(),
            [0xff02, 0, 0, 0x3e8, 0x1122, 0x3344, 0x5566, 0x7788]
        );
        assert!(addr.is_multicast());
    }

    #[test]
    fn distinct_locators_get_distinct_groups() {
        let a = group_address(1, Locator(10));
        let b = group_address(1, Locator(20));
        let c = group_address(2, Locator(10));
        assert_ne!(a, b);
        assert_ne!(a, c);
    }
}
