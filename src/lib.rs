//! LAN Messenger
//!
//! Serverless messaging between hosts of the same local network.
//!
//! ## Overview
//!
//! Hosts announce themselves with UDP broadcasts, swap RSA public keys on first
//! contact (trust on first use) and exchange direct messages sealed with a hybrid
//! scheme: a fresh ChaCha20-Poly1305 key per message, wrapped with RSA-OAEP.
//! Groups are lists of addresses replicated to every member; group messages are
//! fanned out one connection per member.
//!
//! ## Key Components
//!
//! - **Identity**: RSA key pair and self-signed certificate, persisted on disk
//! - **Discovery**: presence announcements, liveness tracking, expiry
//! - **Messaging**: key exchange, encrypted direct messages, inbound dispatch
//! - **Groups**: creation, membership propagation, fan-out
//!
//! ## Example
//!
//! ```rust,no_run
//! use lan_messenger::p2p::{LanNode, NetworkConfig, NodeEvent};
//!
//! # async fn run() -> Result<(), lan_messenger::PeerError> {
//! let node = LanNode::start(NetworkConfig {
//!     display_name: "alice".into(),
//!     storage_dir: Some("./alice".into()),
//!     ..NetworkConfig::default()
//! })
//! .await?;
//!
//! let mut events = node.subscribe();
//! while let Ok(event) = events.recv().await {
//!     if let NodeEvent::PeerDiscovered { address, .. } = event {
//!         node.send_direct_message(address, "hello").await?;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod crypto;
pub mod error;
pub mod identity;
pub mod p2p;
pub mod storage;

pub use crypto::{CryptoError, EncryptedEnvelope};
pub use error::PeerError;
pub use identity::Identity;
