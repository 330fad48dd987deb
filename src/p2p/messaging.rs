//! Connection protocol engine
//!
//! Owns the public-key cache and the direct-message log, runs the key exchange
//! handshake, sends encrypted direct messages and dispatches inbound frames.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::events::{notice, publish, EventSender, NodeEvent};
use super::groups::GroupCoordinator;
use super::messages::Frame;
use super::network::NetworkConfig;
use super::transport::{connect, read_frame, write_frame};
use crate::crypto::{hybrid_encrypt, parse_public_key};
use crate::error::PeerError;
use crate::identity::Identity;
use crate::storage::{StateStore, MESSAGES_FILE};

/// Direction of a logged direct message
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Sent,
    Received,
}

/// Entry of the direct-message log
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DirectMessage {
    pub peer_address: IpAddr,
    pub direction: Direction,
    pub text: String,
    /// Seconds since the Unix epoch
    pub timestamp: u64,
}

/// Engine for key exchange and direct messaging
pub struct MessageEngine {
    identity: Arc<Identity>,
    local_address: IpAddr,

    /// Source address of outbound connections, when pinned
    source_address: Option<IpAddr>,

    messaging_port: u16,
    handshake_timeout: Duration,
    io_timeout: Duration,

    /// Peer address -> public key PEM; entries are never overwritten
    key_cache: RwLock<HashMap<IpAddr, String>>,

    /// Direct messages in receipt/send order
    log: RwLock<Vec<DirectMessage>>,

    store: Option<Arc<StateStore>>,
    events: EventSender,
}

impl MessageEngine {
    pub fn new(
        identity: Arc<Identity>,
        local_address: IpAddr,
        config: &NetworkConfig,
        store: Option<Arc<StateStore>>,
        events: EventSender,
    ) -> Self {
        let log: Vec<DirectMessage> = store
            .as_ref()
            .map(|store| {
                store.load_lines(MESSAGES_FILE).unwrap_or_else(|e| {
                    warn!("Ignoring stored direct messages: {}", e);
                    Vec::new()
                })
            })
            .unwrap_or_default();
        if !log.is_empty() {
            debug!("Restored {} direct messages", log.len());
        }

        let local_address = local_address.to_canonical();
        Self {
            identity,
            local_address,
            source_address: config.pin_source_address.then_some(local_address),
            messaging_port: config.messaging_port,
            handshake_timeout: config.handshake_timeout,
            io_timeout: config.io_timeout,
            key_cache: RwLock::new(HashMap::new()),
            log: RwLock::new(log),
            store,
            events,
        }
    }

    fn read_keys(&self) -> RwLockReadGuard<'_, HashMap<IpAddr, String>> {
        self.key_cache.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_keys(&self) -> RwLockWriteGuard<'_, HashMap<IpAddr, String>> {
        self.key_cache.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_log(&self) -> RwLockReadGuard<'_, Vec<DirectMessage>> {
        self.log.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_log(&self) -> RwLockWriteGuard<'_, Vec<DirectMessage>> {
        self.log.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn local_address(&self) -> IpAddr {
        self.local_address
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    fn target(&self, address: IpAddr) -> SocketAddr {
        SocketAddr::new(address, self.messaging_port)
    }

    /// Make sure the public key of `address` is cached.
    ///
    /// A cached key returns immediately without touching the network.
    pub async fn exchange_keys(&self, address: IpAddr) -> Result<(), PeerError> {
        let address = address.to_canonical();
        if self.has_public_key(&address) {
            return Ok(());
        }

        match self.request_public_key(address).await {
            Ok(public_key) => {
                let fingerprint = crate::crypto::key_fingerprint(&public_key);
                self.cache_public_key(address, public_key);
                info!("Key exchange with {} complete (key {})", address, fingerprint);
                notice(
                    &self.events,
                    format!("Key exchange with {} complete", address),
                );
                Ok(())
            }
            Err(e) => {
                warn!("Key exchange with {} failed: {}", address, e);
                notice(
                    &self.events,
                    format!("Cannot exchange keys with {}: {}", address, e),
                );
                Err(e)
            }
        }
    }

    async fn request_public_key(&self, address: IpAddr) -> Result<String, PeerError> {
        let mut stream = connect(self.target(address), self.source_address, self.io_timeout).await?;

        let request = Frame::KeyExchange {
            public_key: self.identity.public_key_material().to_string(),
        };
        write_frame(&mut stream, &request.encode()?, self.io_timeout).await?;

        let reply = read_frame(&mut stream, self.handshake_timeout).await?;
        match Frame::parse(&reply)? {
            Frame::KeyExchange { public_key } => {
                parse_public_key(&public_key)?;
                Ok(public_key)
            }
            other => Err(PeerError::Protocol(format!(
                "expected a public key reply, got {:?} frame",
                other.kind()
            ))),
        }
    }

    /// Cache a key unless one is already known for `address`.
    fn cache_public_key(&self, address: IpAddr, public_key: String) {
        self.write_keys().entry(address).or_insert(public_key);
    }

    /// Encrypt `text` for `address` and deliver it on a fresh connection.
    pub async fn send_direct_message(&self, address: IpAddr, text: &str) -> Result<(), PeerError> {
        let address = address.to_canonical();
        self.exchange_keys(address).await?;

        let result = self.seal_and_send(address, text).await;
        match &result {
            Ok(()) => {
                debug!("Sent direct message to {}", address);
                self.append(DirectMessage {
                    peer_address: address,
                    direction: Direction::Sent,
                    text: text.to_string(),
                    timestamp: current_timestamp(),
                });
            }
            Err(e) => {
                warn!("Failed to send message to {}: {}", address, e);
                notice(
                    &self.events,
                    format!("Message to {} not delivered: {}", address, e),
                );
            }
        }
        result
    }

    async fn seal_and_send(&self, address: IpAddr, text: &str) -> Result<(), PeerError> {
        let public_key = self.public_key(&address).ok_or_else(|| {
            PeerError::State(format!("no public key cached for {}", address))
        })?;
        let envelope = hybrid_encrypt(&public_key, text.as_bytes())?;
        self.send_frame(address, &Frame::Encrypted(envelope)).await
    }

    /// Send `text` to each address in turn. One failure never blocks the others.
    pub async fn send_multicast(&self, addresses: &[IpAddr], text: &str) -> HashMap<IpAddr, bool> {
        let mut report = HashMap::new();
        for address in addresses {
            let delivered = self.send_direct_message(*address, text).await.is_ok();
            report.insert(address.to_canonical(), delivered);
        }
        report
    }

    /// Deliver one frame to `address` on a fresh connection.
    pub async fn send_frame(&self, address: IpAddr, frame: &Frame) -> Result<(), PeerError> {
        let encoded = frame.encode()?;
        let mut stream =
            connect(self.target(address.to_canonical()), self.source_address, self.io_timeout)
                .await?;
        write_frame(&mut stream, &encoded, self.io_timeout).await
    }

    /// Accept connections until shutdown, one task per connection.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        groups: Arc<GroupCoordinator>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((mut stream, peer)) => {
                        debug!("Accepted connection from {}", peer);
                        let engine = Arc::clone(&self);
                        let groups = Arc::clone(&groups);
                        tokio::spawn(async move {
                            let source = peer.ip().to_canonical();
                            if let Err(e) = engine.handle_connection(&mut stream, source, &groups).await {
                                warn!("Connection from {} failed: {}", source, e);
                            }
                        });
                    }
                    Err(e) => error!("Failed to accept connection: {}", e),
                },
                _ = shutdown.changed() => break,
            }
        }
        debug!("Accept loop stopped");
    }

    /// Read one frame from `stream` and dispatch it.
    pub async fn handle_connection<S>(
        &self,
        stream: &mut S,
        source: IpAddr,
        groups: &GroupCoordinator,
    ) -> Result<(), PeerError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let raw = read_frame(stream, self.io_timeout).await?;
        let frame = Frame::parse(&raw)?;
        debug!("Received {:?} frame from {}", frame.kind(), source);

        match frame {
            Frame::KeyExchange { public_key } => {
                match parse_public_key(&public_key) {
                    Ok(_) => self.cache_public_key(source, public_key),
                    Err(e) => warn!("Ignoring invalid public key from {}: {}", source, e),
                }
                let reply = Frame::KeyExchange {
                    public_key: self.identity.public_key_material().to_string(),
                };
                write_frame(stream, &reply.encode()?, self.io_timeout).await
            }
            Frame::GroupMessage { group, text } => {
                groups.handle_group_message(source, &group, &text);
                Ok(())
            }
            Frame::JoinGroup { group, members } => {
                groups.handle_join(source, &group, &members).await;
                Ok(())
            }
            Frame::Encrypted(envelope) => {
                let plaintext = match self.identity.decrypt(&envelope) {
                    Ok(plaintext) => plaintext,
                    Err(e) => {
                        warn!("Dropping undecryptable message from {}: {}", source, e);
                        notice(
                            &self.events,
                            format!("Could not decrypt a message from {}", source),
                        );
                        return Err(e.into());
                    }
                };
                let text = String::from_utf8(plaintext).map_err(|_| {
                    PeerError::Protocol("decrypted message is not valid UTF-8".into())
                })?;
                self.receive(source, text);
                Ok(())
            }
            Frame::Plaintext(text) => {
                debug!("Plaintext message from {}", source);
                self.receive(source, text);
                Ok(())
            }
        }
    }

    fn receive(&self, source: IpAddr, text: String) {
        self.append(DirectMessage {
            peer_address: source,
            direction: Direction::Received,
            text: text.clone(),
            timestamp: current_timestamp(),
        });
        publish(
            &self.events,
            NodeEvent::DirectMessage {
                address: source,
                text,
            },
        );
    }

    /// Append to the log. The record is written while the log lock is held, so the
    /// file order is the memory order.
    fn append(&self, message: DirectMessage) {
        let mut log = self.write_log();
        if let Some(store) = &self.store {
            if let Err(e) = store.append_line(MESSAGES_FILE, &message) {
                warn!("Failed to persist direct message: {}", e);
            }
        }
        log.push(message);
    }

    /// Apply `edit` to the log and rewrite the stored copy under the same lock.
    fn edit_log<T>(&self, edit: impl FnOnce(&mut Vec<DirectMessage>) -> T) -> T {
        let mut log = self.write_log();
        let result = edit(&mut log);
        if let Some(store) = &self.store {
            if let Err(e) = store.save_lines(MESSAGES_FILE, log.as_slice()) {
                warn!("Failed to persist direct messages: {}", e);
            }
        }
        result
    }

    /// Whole direct-message log
    pub fn messages(&self) -> Vec<DirectMessage> {
        self.read_log().clone()
    }

    /// Messages exchanged with `address`, both directions
    pub fn messages_with(&self, address: &IpAddr) -> Vec<DirectMessage> {
        let address = address.to_canonical();
        self.read_log()
            .iter()
            .filter(|m| m.peer_address == address)
            .cloned()
            .collect()
    }

    /// The last `count` messages
    pub fn recent_messages(&self, count: usize) -> Vec<DirectMessage> {
        let log = self.read_log();
        log[log.len().saturating_sub(count)..].to_vec()
    }

    /// Case-insensitive search in message text
    pub fn search_messages(&self, keyword: &str) -> Vec<DirectMessage> {
        let keyword = keyword.to_lowercase();
        self.read_log()
            .iter()
            .filter(|m| m.text.to_lowercase().contains(&keyword))
            .cloned()
            .collect()
    }

    pub fn message_count(&self) -> usize {
        self.read_log().len()
    }

    /// Number of messages exchanged with `address`
    pub fn message_count_with(&self, address: &IpAddr) -> usize {
        let address = address.to_canonical();
        self.read_log()
            .iter()
            .filter(|m| m.peer_address == address)
            .count()
    }

    pub fn clear_messages(&self) {
        self.edit_log(|log| log.clear());
    }

    /// Remove the messages exchanged with `address`; returns how many were removed.
    pub fn clear_messages_with(&self, address: &IpAddr) -> usize {
        let address = address.to_canonical();
        self.edit_log(|log| {
            let before = log.len();
            log.retain(|m| m.peer_address != address);
            before - log.len()
        })
    }

    pub fn public_keys(&self) -> HashMap<IpAddr, String> {
        self.read_keys().clone()
    }

    pub fn public_key(&self, address: &IpAddr) -> Option<String> {
        self.read_keys().get(&address.to_canonical()).cloned()
    }

    pub fn has_public_key(&self, address: &IpAddr) -> bool {
        self.read_keys().contains_key(&address.to_canonical())
    }
}

/// Get current timestamp in seconds
fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_secs()
}
