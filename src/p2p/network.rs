//! Node orchestration
//!
//! [`LanNode`] wires discovery, the message engine and the group coordinator
//! together, starts the background loops and exposes the caller API.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::discovery::{bind_discovery_socket, resolve_local_address, PeerDiscovery, PeerRecord};
use super::events::{self, EventSender, NodeEvent};
use super::groups::{Group, GroupCoordinator, GroupCreation, GroupMessage};
use super::messaging::{DirectMessage, MessageEngine};
use crate::error::PeerError;
use crate::identity::Identity;
use crate::storage::StateStore;

/// Default UDP port for presence datagrams
pub const DEFAULT_DISCOVERY_PORT: u16 = 50000;

/// Default TCP port for connection frames
pub const DEFAULT_MESSAGING_PORT: u16 = 50001;

/// Network configuration
#[derive(Clone, Debug)]
pub struct NetworkConfig {
    /// Name announced to other peers and written into the certificate
    pub display_name: String,

    /// Our address as seen by peers; resolved from the routing table when `None`
    pub local_address: Option<IpAddr>,

    /// Address the TCP acceptor and the discovery socket bind to
    pub bind_address: IpAddr,

    /// Destination of presence datagrams
    pub broadcast_address: IpAddr,

    pub discovery_port: u16,
    pub messaging_port: u16,

    pub announce_interval: Duration,

    /// Silence after which a peer is considered gone
    pub peer_timeout: Duration,

    pub sweep_interval: Duration,

    /// Wait for the `PUBKEY:` reply
    pub handshake_timeout: Duration,

    /// Bound for connect and frame I/O
    pub io_timeout: Duration,

    /// Where identity, groups and messages are kept; in-memory only when `None`
    pub storage_dir: Option<PathBuf>,

    pub enable_discovery: bool,

    /// Bind outbound connections to `local_address`
    pub pin_source_address: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            display_name: "Unknown".to_string(),
            local_address: None,
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            broadcast_address: IpAddr::V4(Ipv4Addr::BROADCAST),
            discovery_port: DEFAULT_DISCOVERY_PORT,
            messaging_port: DEFAULT_MESSAGING_PORT,
            announce_interval: Duration::from_secs(5),
            peer_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(5),
            io_timeout: Duration::from_secs(5),
            storage_dir: None,
            enable_discovery: true,
            pin_source_address: false,
        }
    }
}

/// A running LAN messenger node
pub struct LanNode {
    config: NetworkConfig,
    local_address: IpAddr,
    messaging_address: SocketAddr,
    identity: Arc<Identity>,
    discovery: Arc<PeerDiscovery>,
    engine: Arc<MessageEngine>,
    groups: Arc<GroupCoordinator>,
    events: EventSender,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl LanNode {
    /// Load the identity, bind the sockets and start the background loops.
    pub async fn start(config: NetworkConfig) -> Result<Self, PeerError> {
        let local_address = match config.local_address {
            Some(address) => address,
            None => resolve_local_address().await,
        }
        .to_canonical();

        let store = match &config.storage_dir {
            Some(dir) => Some(Arc::new(StateStore::open(dir.clone())?)),
            None => None,
        };

        let identity = {
            let label = config.display_name.clone();
            let dir = store.as_ref().map(|store| store.dir().to_path_buf());
            // RSA key generation is CPU bound
            tokio::task::spawn_blocking(move || match dir {
                Some(dir) => Identity::load_or_create(&dir, &label),
                None => Identity::generate(&label),
            })
            .await
            .map_err(|e| PeerError::Identity(format!("identity task failed: {}", e)))??
        };
        let identity = Arc::new(identity);
        info!(
            "Identity {} ready (key {})",
            identity.label(),
            identity.fingerprint()
        );

        let events = events::channel();
        let discovery = Arc::new(PeerDiscovery::new(
            local_address,
            &config.display_name,
            events.clone(),
        ));
        let engine = Arc::new(MessageEngine::new(
            Arc::clone(&identity),
            local_address,
            &config,
            store.clone(),
            events.clone(),
        ));
        let groups = Arc::new(GroupCoordinator::new(
            Arc::clone(&engine),
            local_address,
            store,
            events.clone(),
        ));

        let listen_addr = SocketAddr::new(config.bind_address, config.messaging_port);
        let listener = TcpListener::bind(listen_addr)
            .await
            .map_err(|e| PeerError::Transport(format!("failed to bind to {}: {}", listen_addr, e)))?;
        let messaging_address = listener.local_addr()?;

        let discovery_socket = if config.enable_discovery {
            let address = SocketAddr::new(config.bind_address, config.discovery_port);
            Some(Arc::new(bind_discovery_socket(address).await?))
        } else {
            None
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();

        tasks.push(tokio::spawn(Arc::clone(&engine).serve(
            listener,
            Arc::clone(&groups),
            shutdown_rx.clone(),
        )));

        if let Some(socket) = discovery_socket {
            let target = SocketAddr::new(config.broadcast_address, config.discovery_port);
            let interval = config.announce_interval;
            let (d, s, rx) = (Arc::clone(&discovery), Arc::clone(&socket), shutdown_rx.clone());
            tasks.push(tokio::spawn(async move {
                d.announce_loop(&s, target, interval, rx).await
            }));

            let (d, s, rx) = (Arc::clone(&discovery), socket, shutdown_rx.clone());
            tasks.push(tokio::spawn(async move { d.listen_loop(&s, rx).await }));

            let (interval, timeout) = (config.sweep_interval, config.peer_timeout);
            let (d, rx) = (Arc::clone(&discovery), shutdown_rx);
            tasks.push(tokio::spawn(async move {
                d.sweep_loop(interval, timeout, rx).await
            }));
        }

        info!(
            "Node {} listening on {} (local address {})",
            config.display_name, messaging_address, local_address
        );

        Ok(Self {
            config,
            local_address,
            messaging_address,
            identity,
            discovery,
            engine,
            groups,
            events,
            shutdown_tx,
            tasks,
        })
    }

    /// Subscribe to node events
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn local_address(&self) -> IpAddr {
        self.local_address
    }

    /// Address the acceptor is bound to
    pub fn messaging_address(&self) -> SocketAddr {
        self.messaging_address
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn discovery(&self) -> &PeerDiscovery {
        &self.discovery
    }

    pub fn engine(&self) -> &MessageEngine {
        &self.engine
    }

    pub fn group_coordinator(&self) -> &GroupCoordinator {
        &self.groups
    }

    pub fn peers(&self) -> Vec<PeerRecord> {
        self.discovery.peers()
    }

    pub fn peer(&self, address: &IpAddr) -> Option<PeerRecord> {
        self.discovery.peer(address)
    }

    pub async fn exchange_keys(&self, address: IpAddr) -> Result<(), PeerError> {
        self.engine.exchange_keys(address).await
    }

    pub async fn send_direct_message(&self, address: IpAddr, text: &str) -> Result<(), PeerError> {
        self.engine.send_direct_message(address, text).await
    }

    pub async fn send_multicast(&self, addresses: &[IpAddr], text: &str) -> HashMap<IpAddr, bool> {
        self.engine.send_multicast(addresses, text).await
    }

    pub fn messages(&self) -> Vec<DirectMessage> {
        self.engine.messages()
    }

    pub fn messages_with(&self, address: &IpAddr) -> Vec<DirectMessage> {
        self.engine.messages_with(address)
    }

    pub async fn create_group(
        &self,
        name: &str,
        members: &[IpAddr],
    ) -> Result<GroupCreation, PeerError> {
        self.groups.create_group(name, members).await
    }

    pub async fn send_group_message(
        &self,
        name: &str,
        text: &str,
    ) -> Result<HashMap<IpAddr, bool>, PeerError> {
        self.groups.send_group_message(name, text).await
    }

    pub fn groups(&self) -> Vec<Group> {
        self.groups.groups()
    }

    pub fn group_messages(&self, name: &str) -> Option<Vec<GroupMessage>> {
        self.groups.group_messages(name)
    }

    /// Stop every background loop and wait for it to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }
        info!("Node {} stopped", self.config.display_name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = NetworkConfig::default();
        assert_eq!(config.discovery_port, 50000);
        assert_eq!(config.messaging_port, 50001);
        assert_eq!(config.announce_interval, Duration::from_secs(5));
        assert_eq!(config.peer_timeout, Duration::from_secs(30));
        assert_eq!(config.sweep_interval, Duration::from_secs(10));
        assert_eq!(config.handshake_timeout, Duration::from_secs(5));
        assert!(config.enable_discovery);
        assert!(!config.pin_source_address);
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = NetworkConfig {
            display_name: "solo".into(),
            local_address: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            messaging_port: 0,
            enable_discovery: false,
            storage_dir: Some(dir.path().to_path_buf()),
            ..NetworkConfig::default()
        };

        let node = LanNode::start(config).await.unwrap();
        assert_eq!(node.local_address(), IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_ne!(node.messaging_address().port(), 0);
        assert!(node.peers().is_empty());
        assert!(dir.path().join(crate::identity::PRIVATE_KEY_FILE).exists());

        let fingerprint = node.identity().fingerprint();
        node.shutdown().await;

        // Same directory, same identity
        let config = NetworkConfig {
            local_address: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            messaging_port: 0,
            enable_discovery: false,
            storage_dir: Some(dir.path().to_path_buf()),
            ..NetworkConfig::default()
        };
        let node = LanNode::start(config).await.unwrap();
        assert_eq!(node.identity().fingerprint(), fingerprint);
        node.shutdown().await;
    }
}
