//! Peer discovery over UDP broadcast
//!
//! Every node periodically broadcasts a presence datagram and listens for the
//! datagrams of others. Peers that stay silent longer than the peer timeout are
//! swept from the table.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::events::{publish, EventSender, NodeEvent};
use super::messages::PresenceAnnouncement;
use crate::error::PeerError;

/// Largest datagram the listen loop accepts
const MAX_DATAGRAM_SIZE: usize = 4096;

/// Liveness of a peer record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    Online,
    Offline,
}

/// A peer known through its announcements
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub address: IpAddr,
    pub display_name: String,
    pub last_seen: Instant,
    pub status: PeerStatus,
}

/// Peer discovery service
pub struct PeerDiscovery {
    /// Our own address; datagrams from it are ignored
    local_address: IpAddr,

    /// Name put in our announcements
    display_name: String,

    /// Known peers keyed by address
    peers: RwLock<HashMap<IpAddr, PeerRecord>>,

    events: EventSender,
}

impl PeerDiscovery {
    pub fn new(local_address: IpAddr, display_name: &str, events: EventSender) -> Self {
        Self {
            local_address: local_address.to_canonical(),
            display_name: display_name.to_string(),
            peers: RwLock::new(HashMap::new()),
            events,
        }
    }

    fn read_peers(&self) -> RwLockReadGuard<'_, HashMap<IpAddr, PeerRecord>> {
        self.peers.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_peers(&self) -> RwLockWriteGuard<'_, HashMap<IpAddr, PeerRecord>> {
        self.peers.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn local_address(&self) -> IpAddr {
        self.local_address
    }

    /// Process one datagram received from `source`.
    ///
    /// Returns `true` when the datagram introduced a new peer.
    pub fn record_announcement(&self, source: IpAddr, payload: &[u8]) -> Result<bool, PeerError> {
        let source = source.to_canonical();
        if source == self.local_address {
            return Ok(false);
        }

        let announcement = match PresenceAnnouncement::parse(payload)? {
            Some(announcement) => announcement,
            None => {
                debug!("Ignoring non-presence datagram from {}", source);
                return Ok(false);
            }
        };
        let name = announcement.name();

        let is_new = {
            let mut peers = self.write_peers();
            match peers.get_mut(&source) {
                Some(peer) => {
                    peer.last_seen = Instant::now();
                    peer.display_name = name.clone();
                    peer.status = PeerStatus::Online;
                    false
                }
                None => {
                    peers.insert(
                        source,
                        PeerRecord {
                            address: source,
                            display_name: name.clone(),
                            last_seen: Instant::now(),
                            status: PeerStatus::Online,
                        },
                    );
                    true
                }
            }
        };

        if is_new {
            info!("Discovered peer {} ({})", name, source);
            publish(
                &self.events,
                NodeEvent::PeerDiscovered {
                    address: source,
                    display_name: name,
                },
            );
        }
        Ok(is_new)
    }

    /// Evict every peer not seen for longer than `timeout`.
    pub fn sweep(&self, timeout: Duration) -> Vec<PeerRecord> {
        self.sweep_at(Instant::now(), timeout)
    }

    pub(crate) fn sweep_at(&self, now: Instant, timeout: Duration) -> Vec<PeerRecord> {
        let evicted: Vec<PeerRecord> = {
            let mut peers = self.write_peers();
            let stale: Vec<IpAddr> = peers
                .values()
                .filter(|peer| now.saturating_duration_since(peer.last_seen) > timeout)
                .map(|peer| peer.address)
                .collect();

            stale
                .into_iter()
                .filter_map(|address| peers.remove(&address))
                .map(|mut peer| {
                    peer.status = PeerStatus::Offline;
                    peer
                })
                .collect()
        };

        for peer in &evicted {
            info!("Peer {} ({}) timed out", peer.display_name, peer.address);
            publish(
                &self.events,
                NodeEvent::PeerLost {
                    address: peer.address,
                },
            );
        }
        evicted
    }

    /// Snapshot of the known peers
    pub fn peers(&self) -> Vec<PeerRecord> {
        self.read_peers().values().cloned().collect()
    }

    pub fn peer(&self, address: &IpAddr) -> Option<PeerRecord> {
        self.read_peers().get(&address.to_canonical()).cloned()
    }

    pub fn peer_count(&self) -> usize {
        self.read_peers().len()
    }

    /// Broadcast our presence now and then every `interval` until shutdown.
    pub async fn announce_loop(
        &self,
        socket: &UdpSocket,
        target: SocketAddr,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let payload = match PresenceAnnouncement::new(&self.display_name).to_bytes() {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Cannot encode presence datagram: {}", e);
                return;
            }
        };

        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = socket.send_to(&payload, target).await {
                        warn!("Failed to announce presence to {}: {}", target, e);
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        debug!("Announce loop stopped");
    }

    /// Receive presence datagrams until shutdown.
    pub async fn listen_loop(&self, socket: &UdpSocket, mut shutdown: watch::Receiver<bool>) {
        let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            tokio::select! {
                received = socket.recv_from(&mut buffer) => match received {
                    Ok((len, source)) => {
                        if let Err(e) = self.record_announcement(source.ip(), &buffer[..len]) {
                            debug!("Dropping datagram from {}: {}", source, e);
                        }
                    }
                    Err(e) => warn!("Discovery receive failed: {}", e),
                },
                _ = shutdown.changed() => break,
            }
        }
        debug!("Listen loop stopped");
    }

    /// Sweep stale peers every `interval` until shutdown.
    pub async fn sweep_loop(
        &self,
        interval: Duration,
        timeout: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep(timeout);
                }
                _ = shutdown.changed() => break,
            }
        }
        debug!("Sweep loop stopped");
    }
}

/// Bind the discovery socket with broadcast enabled.
pub async fn bind_discovery_socket(address: SocketAddr) -> Result<UdpSocket, PeerError> {
    let socket = UdpSocket::bind(address).await.map_err(|e| {
        PeerError::Transport(format!("failed to bind discovery socket {}: {}", address, e))
    })?;
    socket.set_broadcast(true)?;
    Ok(socket)
}

/// Address of the interface used for outbound traffic, or loopback when there is none.
///
/// No packet is sent: connecting a UDP socket only selects a route.
pub async fn resolve_local_address() -> IpAddr {
    let fallback = IpAddr::V4(Ipv4Addr::LOCALHOST);
    let socket = match UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await {
        Ok(socket) => socket,
        Err(e) => {
            warn!("Cannot resolve local address: {}", e);
            return fallback;
        }
    };
    if let Err(e) = socket.connect((Ipv4Addr::new(8, 8, 8, 8), 80)).await {
        debug!("No outbound route, using loopback: {}", e);
        return fallback;
    }
    match socket.local_addr() {
        Ok(address) if !address.ip().is_unspecified() => address.ip(),
        _ => fallback,
    }
}
