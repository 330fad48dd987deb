//! Wire formats: the discovery datagram and the tag-prefixed connection frames

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use tracing::warn;

use crate::crypto::EncryptedEnvelope;
use crate::error::PeerError;

/// Frame tag of the key exchange request and reply
pub const PUBLIC_KEY_TAG: &str = "PUBKEY:";

/// Frame tag of a group message
pub const GROUP_MESSAGE_TAG: &str = "GROUPMSG:";

/// Frame tag of a group membership propagation
pub const JOIN_GROUP_TAG: &str = "JOINGROUP:";

/// `type` of the presence datagram
pub const DISCOVER_PEER_KIND: &str = "DISCOVER_PEER";

/// `type` of the encrypted direct message record
pub const ENCRYPTED_MESSAGE_KIND: &str = "ENCRYPTED_MESSAGE";

/// Display name used when an announcement carries none
pub const UNKNOWN_PEER_NAME: &str = "Unknown";

/// Presence datagram broadcast by the announce loop
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PresenceAnnouncement {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(rename = "username", alias = "displayName", default)]
    pub display_name: Option<String>,
}

impl PresenceAnnouncement {
    pub fn new(display_name: &str) -> Self {
        Self {
            kind: DISCOVER_PEER_KIND.to_string(),
            display_name: Some(display_name.to_string()),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, PeerError> {
        serde_json::to_vec(self).map_err(|e| PeerError::Protocol(e.to_string()))
    }

    /// Parse a datagram. `Ok(None)` for well-formed datagrams of another type.
    pub fn parse(payload: &[u8]) -> Result<Option<Self>, PeerError> {
        let announcement: PresenceAnnouncement = serde_json::from_slice(payload)
            .map_err(|e| PeerError::Protocol(format!("malformed presence datagram: {}", e)))?;
        if announcement.kind != DISCOVER_PEER_KIND {
            return Ok(None);
        }
        Ok(Some(announcement))
    }

    /// Announced name, or the placeholder when missing or blank
    pub fn name(&self) -> String {
        match self.display_name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => UNKNOWN_PEER_NAME.to_string(),
        }
    }
}

/// JSON form of an encrypted direct message, binary fields hex encoded
#[derive(Serialize, Deserialize, Debug, Clone)]
struct EnvelopeRecord {
    #[serde(rename = "type")]
    kind: String,
    wrapped_key: String,
    iv: String,
    ciphertext: String,
}

/// One connection frame, parsed once at the boundary
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// `PUBKEY:<pem>`, both request and reply
    KeyExchange { public_key: String },

    /// `GROUPMSG:<name>:<text>`
    GroupMessage { group: String, text: String },

    /// `JOINGROUP:<name>:<addr,addr,...>`
    JoinGroup { group: String, members: Vec<IpAddr> },

    /// Direct message sealed with the recipient's key
    Encrypted(EncryptedEnvelope),

    /// Anything else: legacy plaintext direct message
    Plaintext(String),
}

/// Frame classification for logging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    KeyExchange,
    GroupMessage,
    JoinGroup,
    Direct,
}

impl Frame {
    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::KeyExchange { .. } => FrameKind::KeyExchange,
            Frame::GroupMessage { .. } => FrameKind::GroupMessage,
            Frame::JoinGroup { .. } => FrameKind::JoinGroup,
            Frame::Encrypted(_) | Frame::Plaintext(_) => FrameKind::Direct,
        }
    }

    /// Classify a raw frame by its leading tag.
    ///
    /// Untagged input is a direct message: an `ENCRYPTED_MESSAGE` record when it parses
    /// as one, plaintext otherwise. Malformed tagged frames are protocol errors.
    pub fn parse(raw: &str) -> Result<Frame, PeerError> {
        if let Some(public_key) = raw.strip_prefix(PUBLIC_KEY_TAG) {
            let public_key = public_key.trim();
            if public_key.is_empty() {
                return Err(PeerError::Protocol("empty PUBKEY frame".into()));
            }
            return Ok(Frame::KeyExchange {
                public_key: public_key.to_string(),
            });
        }

        if let Some(rest) = raw.strip_prefix(GROUP_MESSAGE_TAG) {
            let (group, text) = split_group(rest, GROUP_MESSAGE_TAG)?;
            return Ok(Frame::GroupMessage {
                group,
                text: text.to_string(),
            });
        }

        if let Some(rest) = raw.strip_prefix(JOIN_GROUP_TAG) {
            let (group, list) = split_group(rest, JOIN_GROUP_TAG)?;
            return Ok(Frame::JoinGroup {
                group,
                members: parse_member_list(list),
            });
        }

        Ok(parse_direct(raw))
    }

    pub fn encode(&self) -> Result<String, PeerError> {
        match self {
            Frame::KeyExchange { public_key } => Ok(format!("{}{}", PUBLIC_KEY_TAG, public_key)),
            Frame::GroupMessage { group, text } => {
                Ok(format!("{}{}:{}", GROUP_MESSAGE_TAG, group, text))
            }
            Frame::JoinGroup { group, members } => {
                let list = members
                    .iter()
                    .map(|m| m.to_string())
                    .collect::<Vec<_>>()
                    .join(",");
                Ok(format!("{}{}:{}", JOIN_GROUP_TAG, group, list))
            }
            Frame::Encrypted(envelope) => {
                let record = EnvelopeRecord {
                    kind: ENCRYPTED_MESSAGE_KIND.to_string(),
                    wrapped_key: hex::encode(&envelope.wrapped_key),
                    iv: hex::encode(&envelope.iv),
                    ciphertext: hex::encode(&envelope.ciphertext),
                };
                serde_json::to_string(&record).map_err(|e| PeerError::Protocol(e.to_string()))
            }
            Frame::Plaintext(text) => Ok(text.clone()),
        }
    }
}

fn split_group<'a>(rest: &'a str, tag: &str) -> Result<(String, &'a str), PeerError> {
    let (group, payload) = rest
        .split_once(':')
        .ok_or_else(|| PeerError::Protocol(format!("{} frame without payload separator", tag)))?;
    if group.is_empty() {
        return Err(PeerError::Protocol(format!("{} frame with empty group name", tag)));
    }
    Ok((group.to_string(), payload))
}

fn parse_member_list(list: &str) -> Vec<IpAddr> {
    list.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| match entry.parse::<IpAddr>() {
            Ok(address) => Some(address),
            Err(_) => {
                warn!("Skipping invalid member address {:?} in JOINGROUP", entry);
                None
            }
        })
        .collect()
}

fn parse_direct(raw: &str) -> Frame {
    let record = match serde_json::from_str::<EnvelopeRecord>(raw) {
        Ok(record) if record.kind == ENCRYPTED_MESSAGE_KIND => record,
        _ => return Frame::Plaintext(raw.to_string()),
    };

    match (
        hex::decode(&record.wrapped_key),
        hex::decode(&record.iv),
        hex::decode(&record.ciphertext),
    ) {
        (Ok(wrapped_key), Ok(iv), Ok(ciphertext)) => Frame::Encrypted(EncryptedEnvelope {
            wrapped_key,
            iv,
            ciphertext,
        }),
        _ => Frame::Plaintext(raw.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_public_key() {
        let frame = Frame::parse("PUBKEY:-----BEGIN PUBLIC KEY-----\nabc\n").unwrap();
        assert_eq!(frame.kind(), FrameKind::KeyExchange);
        assert_eq!(
            frame,
            Frame::KeyExchange {
                public_key: "-----BEGIN PUBLIC KEY-----\nabc".to_string()
            }
        );
        assert!(Frame::parse("PUBKEY:").is_err());
    }

    #[test]
    fn test_group_message_keeps_colons_in_text() {
        let frame = Frame::parse("GROUPMSG:team:meet at 10:30").unwrap();
        assert_eq!(
            frame,
            Frame::GroupMessage {
                group: "team".into(),
                text: "meet at 10:30".into()
            }
        );
    }

    #[test]
    fn test_malformed_group_frames() {
        assert!(Frame::parse("GROUPMSG:no-separator").is_err());
        assert!(Frame::parse("GROUPMSG::text").is_err());
        assert!(Frame::parse("JOINGROUP:team").is_err());
    }

    #[test]
    fn test_join_group_skips_invalid_members() {
        let frame = Frame::parse("JOINGROUP:team:10.0.0.1, 10.0.0.2,,bogus").unwrap();
        let expected: Vec<IpAddr> = vec!["10.0.0.1".parse().unwrap(), "10.0.0.2".parse().unwrap()];
        assert_eq!(
            frame,
            Frame::JoinGroup {
                group: "team".into(),
                members: expected.clone()
            }
        );
        assert_eq!(
            Frame::JoinGroup {
                group: "team".into(),
                members: expected
            }
            .encode()
            .unwrap(),
            "JOINGROUP:team:10.0.0.1,10.0.0.2"
        );
    }

    #[test]
    fn test_unknown_frames_are_plaintext() {
        assert_eq!(
            Frame::parse("hello there").unwrap(),
            Frame::Plaintext("hello there".into())
        );
        // JSON of another type is still a direct plaintext message
        let other = r#"{"type":"SOMETHING_ELSE","wrapped_key":"","iv":"","ciphertext":""}"#;
        assert_eq!(Frame::parse(other).unwrap(), Frame::Plaintext(other.into()));
        // Bad hex falls back to plaintext too
        let bad_hex = r#"{"type":"ENCRYPTED_MESSAGE","wrapped_key":"zz","iv":"00","ciphertext":"00"}"#;
        assert_eq!(Frame::parse(bad_hex).unwrap().kind(), FrameKind::Direct);
        assert!(matches!(Frame::parse(bad_hex).unwrap(), Frame::Plaintext(_)));
    }

    #[test]
    fn test_encrypted_frame_encoding() {
        let envelope = EncryptedEnvelope {
            wrapped_key: vec![1, 2, 3],
            iv: vec![4; 12],
            ciphertext: vec![0xff, 0x00],
        };
        let encoded = Frame::Encrypted(envelope.clone()).encode().unwrap();
        assert!(encoded.contains(r#""type":"ENCRYPTED_MESSAGE""#));
        assert!(encoded.contains(r#""wrapped_key":"010203""#));
        assert_eq!(Frame::parse(&encoded).unwrap(), Frame::Encrypted(envelope));
    }

    #[test]
    fn test_presence_datagram() {
        let bytes = PresenceAnnouncement::new("alice").to_bytes().unwrap();
        let text = String::from_utf8(bytes.clone()).unwrap();
        assert!(text.contains(r#""type":"DISCOVER_PEER""#));
        assert!(text.contains(r#""username":"alice""#));

        let parsed = PresenceAnnouncement::parse(&bytes).unwrap().unwrap();
        assert_eq!(parsed.name(), "alice");
    }

    #[test]
    fn test_presence_tolerates_missing_and_extra_fields() {
        let parsed = PresenceAnnouncement::parse(br#"{"type":"DISCOVER_PEER","port":1}"#)
            .unwrap()
            .unwrap();
        assert_eq!(parsed.name(), UNKNOWN_PEER_NAME);

        let parsed = PresenceAnnouncement::parse(br#"{"type":"DISCOVER_PEER","displayName":"bob"}"#)
            .unwrap()
            .unwrap();
        assert_eq!(parsed.name(), "bob");

        assert!(PresenceAnnouncement::parse(br#"{"type":"OTHER"}"#)
            .unwrap()
            .is_none());
        assert!(PresenceAnnouncement::parse(b"\xff garbage").is_err());
    }
}
