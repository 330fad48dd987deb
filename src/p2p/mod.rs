//! Peer-to-peer messaging on a local network
//!
//! Nodes find each other without any central server and talk directly.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────┐ UDP broadcast  ┌───────────┐
//! │  Node A   ├───────────────►│  Node B   │   discovery: DISCOVER_PEER datagrams
//! │           │◄───────────────┤           │
//! │           │   TCP frames   │           │
//! │           ├───────────────►│           │   PUBKEY / ENCRYPTED_MESSAGE /
//! └───────────┘                └───────────┘   GROUPMSG / JOINGROUP
//! ```
//!
//! # Protocol Phases
//!
//! 1. **Discovery**: every node broadcasts its presence and tracks who is alive
//! 2. **Key exchange**: on first contact the two nodes swap RSA public keys
//! 3. **Direct messages**: hybrid-encrypted, one connection per message
//! 4. **Groups**: membership propagated with `JOINGROUP`, messages fanned out with `GROUPMSG`

pub mod discovery;
pub mod events;
pub mod groups;
pub mod messages;
pub mod messaging;
pub mod network;
pub mod transport;

pub use discovery::{PeerDiscovery, PeerRecord, PeerStatus};
pub use events::NodeEvent;
pub use groups::{Group, GroupCoordinator, GroupCreation, GroupMessage};
pub use messages::{Frame, FrameKind, PresenceAnnouncement};
pub use messaging::{Direction, DirectMessage, MessageEngine};
pub use network::{LanNode, NetworkConfig};
