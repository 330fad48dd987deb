//! Notifications published to the UI / orchestration layer

use std::net::IpAddr;
use tokio::sync::broadcast;

/// Capacity of the event channel; slow subscribers lag instead of blocking the node
pub const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    /// A new address announced itself
    PeerDiscovered { address: IpAddr, display_name: String },

    /// An address went silent for longer than the peer timeout
    PeerLost { address: IpAddr },

    /// A direct message was received and decoded
    DirectMessage { address: IpAddr, text: String },

    /// A group message was received
    GroupMessage {
        group: String,
        address: IpAddr,
        text: String,
    },

    /// Operational notice meant for the user (key exchange outcome, degraded group, ...)
    Log(String),
}

pub type EventSender = broadcast::Sender<NodeEvent>;

pub fn channel() -> EventSender {
    let (tx, _rx) = broadcast::channel(EVENT_CAPACITY);
    tx
}

/// Publish an event; having no subscriber is not an error.
pub(crate) fn publish(events: &EventSender, event: NodeEvent) {
    let _ = events.send(event);
}

pub(crate) fn notice(events: &EventSender, text: impl Into<String>) {
    publish(events, NodeEvent::Log(text.into()));
}
