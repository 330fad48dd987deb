//! Group coordinator
//!
//! Groups are replicated by sending `JOINGROUP` to every member on creation and
//! merged by set union on receipt. There is no consensus: membership views may
//! diverge between hosts.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::IpAddr;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::events::{notice, publish, EventSender, NodeEvent};
use super::messages::Frame;
use super::messaging::MessageEngine;
use crate::error::PeerError;
use crate::storage::{StateStore, GROUPS_FILE};

/// One entry of a group's history
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct GroupMessage {
    pub sender: IpAddr,
    pub text: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Group {
    pub name: String,
    pub members: BTreeSet<IpAddr>,
    #[serde(default)]
    pub messages: Vec<GroupMessage>,
}

impl Group {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            members: BTreeSet::new(),
            messages: Vec::new(),
        }
    }
}

/// Outcome of [`GroupCoordinator::create_group`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupCreation {
    pub name: String,
    pub members: Vec<IpAddr>,
    /// Members that could not be keyed or sent the join frame
    pub incomplete: Vec<IpAddr>,
}

impl GroupCreation {
    pub fn is_complete(&self) -> bool {
        self.incomplete.is_empty()
    }
}

pub struct GroupCoordinator {
    engine: Arc<MessageEngine>,
    local_address: IpAddr,
    groups: RwLock<BTreeMap<String, Group>>,
    store: Option<Arc<StateStore>>,
    events: EventSender,
}

impl GroupCoordinator {
    pub fn new(
        engine: Arc<MessageEngine>,
        local_address: IpAddr,
        store: Option<Arc<StateStore>>,
        events: EventSender,
    ) -> Self {
        let groups: BTreeMap<String, Group> = store
            .as_ref()
            .map(|store| store.load_or_default(GROUPS_FILE))
            .unwrap_or_default();
        if !groups.is_empty() {
            debug!("Restored {} groups", groups.len());
        }

        Self {
            engine,
            local_address: local_address.to_canonical(),
            groups: RwLock::new(groups),
            store,
            events,
        }
    }

    fn read_groups(&self) -> RwLockReadGuard<'_, BTreeMap<String, Group>> {
        self.groups.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_groups(&self) -> RwLockWriteGuard<'_, BTreeMap<String, Group>> {
        self.groups.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply `edit` to the group table and persist the result before releasing the lock.
    fn edit_groups<T>(&self, edit: impl FnOnce(&mut BTreeMap<String, Group>) -> T) -> T {
        let mut groups = self.write_groups();
        let result = edit(&mut groups);
        if let Some(store) = &self.store {
            if let Err(e) = store.save(GROUPS_FILE, &*groups) {
                warn!("Failed to persist groups: {}", e);
            }
        }
        result
    }

    /// Create `name` with `members` plus the local address and invite every member.
    ///
    /// Members whose key exchange fails are not invited; they are reported in
    /// [`GroupCreation::incomplete`]. The group is kept either way.
    pub async fn create_group(
        &self,
        name: &str,
        members: &[IpAddr],
    ) -> Result<GroupCreation, PeerError> {
        validate_group_name(name)?;

        let mut member_set: BTreeSet<IpAddr> = members.iter().map(|m| m.to_canonical()).collect();
        member_set.insert(self.local_address);

        self.edit_groups(|groups| {
            if groups.contains_key(name) {
                return Err(PeerError::State(format!("group {} already exists", name)));
            }
            let mut group = Group::new(name);
            group.members = member_set.clone();
            groups.insert(name.to_string(), group);
            Ok(())
        })?;
        info!("Created group {} with {} members", name, member_set.len());

        let members: Vec<IpAddr> = member_set.into_iter().collect();
        let join = Frame::JoinGroup {
            group: name.to_string(),
            members: members.clone(),
        };

        let mut incomplete = Vec::new();
        for member in members.iter().filter(|m| **m != self.local_address) {
            if let Err(e) = self.engine.exchange_keys(*member).await {
                warn!("Not inviting {} to {}: {}", member, name, e);
                incomplete.push(*member);
                continue;
            }
            if let Err(e) = self.engine.send_frame(*member, &join).await {
                warn!("Failed to send group invitation to {}: {}", member, e);
                incomplete.push(*member);
            }
        }

        if !incomplete.is_empty() {
            notice(
                &self.events,
                format!(
                    "Group {} created, {} member(s) could not be reached",
                    name,
                    incomplete.len()
                ),
            );
        }

        Ok(GroupCreation {
            name: name.to_string(),
            members,
            incomplete,
        })
    }

    /// Merge a received membership list, then key every member not yet known.
    pub async fn handle_join(&self, source: IpAddr, name: &str, members: &[IpAddr]) {
        if let Err(e) = validate_group_name(name) {
            warn!("Ignoring JOINGROUP from {}: {}", source, e);
            return;
        }

        let (merged, added) = self.edit_groups(|groups| {
            let group = groups
                .entry(name.to_string())
                .or_insert_with(|| Group::new(name));
            let before = group.members.len();
            group
                .members
                .extend(members.iter().map(|m| m.to_canonical()));
            let added = group.members.len() - before;
            (group.members.iter().copied().collect::<Vec<_>>(), added)
        });

        if added > 0 {
            info!("Group {} updated by {}: {} new member(s)", name, source, added);
            notice(&self.events, format!("Joined group {} (from {})", name, source));
        }

        for member in merged
            .into_iter()
            .filter(|m| *m != self.local_address && !self.engine.has_public_key(m))
        {
            if let Err(e) = self.engine.exchange_keys(member).await {
                debug!("Group {} member {} not keyed: {}", name, member, e);
            }
        }
    }

    /// Send `text` to every other member of `name`.
    ///
    /// The message joins the local history regardless of the per-member outcome.
    pub async fn send_group_message(
        &self,
        name: &str,
        text: &str,
    ) -> Result<HashMap<IpAddr, bool>, PeerError> {
        let members: Vec<IpAddr> = {
            let groups = self.read_groups();
            let group = groups
                .get(name)
                .ok_or_else(|| PeerError::State(format!("unknown group {}", name)))?;
            group.members.iter().copied().collect()
        };

        let frame = Frame::GroupMessage {
            group: name.to_string(),
            text: text.to_string(),
        };

        let mut report = HashMap::new();
        for member in members.into_iter().filter(|m| *m != self.local_address) {
            let delivered = match self.engine.send_frame(member, &frame).await {
                Ok(()) => true,
                Err(e) => {
                    warn!("Group {} message to {} failed: {}", name, member, e);
                    false
                }
            };
            report.insert(member, delivered);
        }

        let sender = self.local_address;
        self.edit_groups(|groups| {
            if let Some(group) = groups.get_mut(name) {
                group.messages.push(GroupMessage {
                    sender,
                    text: text.to_string(),
                });
            }
        });

        Ok(report)
    }

    /// Record a group message received from `source`, creating the group if needed.
    pub fn handle_group_message(&self, source: IpAddr, name: &str, text: &str) {
        let source = source.to_canonical();
        let created = self.edit_groups(|groups| {
            let created = !groups.contains_key(name);
            let group = groups
                .entry(name.to_string())
                .or_insert_with(|| Group::new(name));
            group.members.insert(source);
            group.messages.push(GroupMessage {
                sender: source,
                text: text.to_string(),
            });
            created
        });

        if created {
            info!("Group {} learned from a message by {}", name, source);
        }
        publish(
            &self.events,
            NodeEvent::GroupMessage {
                group: name.to_string(),
                address: source,
                text: text.to_string(),
            },
        );
    }

    pub fn groups(&self) -> Vec<Group> {
        self.read_groups().values().cloned().collect()
    }

    pub fn group(&self, name: &str) -> Option<Group> {
        self.read_groups().get(name).cloned()
    }

    pub fn members(&self, name: &str) -> Option<Vec<IpAddr>> {
        self.read_groups()
            .get(name)
            .map(|group| group.members.iter().copied().collect())
    }

    pub fn group_messages(&self, name: &str) -> Option<Vec<GroupMessage>> {
        self.read_groups()
            .get(name)
            .map(|group| group.messages.clone())
    }

    /// Forget a group locally. Other members are not told.
    pub fn remove_group(&self, name: &str) -> bool {
        self.edit_groups(|groups| groups.remove(name).is_some())
    }

    pub fn clear_group_messages(&self, name: &str) -> bool {
        self.edit_groups(|groups| match groups.get_mut(name) {
            Some(group) => {
                group.messages.clear();
                true
            }
            None => false,
        })
    }

    pub fn clear_all_group_messages(&self) {
        self.edit_groups(|groups| {
            for group in groups.values_mut() {
                group.messages.clear();
            }
        });
    }
}

/// Names travel inside colon-separated frames.
fn validate_group_name(name: &str) -> Result<(), PeerError> {
    if name.trim().is_empty() {
        return Err(PeerError::State("group name is empty".into()));
    }
    if name.contains(':') {
        return Err(PeerError::State(format!(
            "group name {:?} contains ':'",
            name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;
    use crate::p2p::events;
    use crate::p2p::network::NetworkConfig;
    use std::sync::OnceLock;
    use std::time::Duration;
    use tokio::net::TcpListener;

    const LOCAL: &str = "127.0.0.1";

    fn addr(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn identity() -> Arc<Identity> {
        static IDENTITY: OnceLock<Arc<Identity>> = OnceLock::new();
        IDENTITY
            .get_or_init(|| Arc::new(Identity::generate("groups").unwrap()))
            .clone()
    }

    /// Coordinator whose peers all refuse connections
    async fn coordinator(store: Option<Arc<StateStore>>) -> GroupCoordinator {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let config = NetworkConfig {
            messaging_port: port,
            io_timeout: Duration::from_secs(1),
            handshake_timeout: Duration::from_secs(1),
            ..NetworkConfig::default()
        };
        let events = events::channel();
        let engine = Arc::new(MessageEngine::new(
            identity(),
            addr(LOCAL),
            &config,
            store.clone(),
            events.clone(),
        ));
        GroupCoordinator::new(engine, addr(LOCAL), store, events)
    }

    #[tokio::test]
    async fn test_create_group_with_unreachable_member() {
        let coordinator = coordinator(None).await;
        let creation = coordinator
            .create_group("team", &[addr("127.0.0.2")])
            .await
            .unwrap();

        assert_eq!(creation.incomplete, vec![addr("127.0.0.2")]);
        assert!(!creation.is_complete());
        assert_eq!(
            coordinator.members("team").unwrap(),
            vec![addr(LOCAL), addr("127.0.0.2")]
        );

        let duplicate = coordinator.create_group("team", &[]).await;
        assert!(matches!(duplicate, Err(PeerError::State(_))));
    }

    #[tokio::test]
    async fn test_group_name_validation() {
        let coordinator = coordinator(None).await;
        assert!(coordinator.create_group("", &[]).await.is_err());
        assert!(coordinator.create_group("a:b", &[]).await.is_err());

        let solo = coordinator.create_group("solo", &[]).await.unwrap();
        assert!(solo.is_complete());
        assert_eq!(solo.members, vec![addr(LOCAL)]);
    }

    #[tokio::test]
    async fn test_join_is_idempotent() {
        let coordinator = coordinator(None).await;
        let members = [addr(LOCAL), addr("127.0.0.2"), addr("127.0.0.3")];

        coordinator
            .handle_join(addr("127.0.0.2"), "team", &members)
            .await;
        let once = coordinator.group("team").unwrap();
        coordinator
            .handle_join(addr("127.0.0.2"), "team", &members)
            .await;

        assert_eq!(coordinator.group("team").unwrap(), once);
        assert_eq!(once.members.len(), 3);
        assert!(once.messages.is_empty());
    }

    #[tokio::test]
    async fn test_join_merges_by_union() {
        let coordinator = coordinator(None).await;
        coordinator
            .handle_join(addr("127.0.0.2"), "team", &[addr(LOCAL), addr("127.0.0.2")])
            .await;
        coordinator
            .handle_join(addr("127.0.0.3"), "team", &[addr(LOCAL), addr("127.0.0.3")])
            .await;

        assert_eq!(
            coordinator.members("team").unwrap(),
            vec![addr(LOCAL), addr("127.0.0.2"), addr("127.0.0.3")]
        );
    }

    #[tokio::test]
    async fn test_message_for_unknown_group_creates_it() {
        let coordinator = coordinator(None).await;
        let mut rx = coordinator.events.subscribe();

        coordinator.handle_group_message(addr("127.0.0.2"), "team", "hello");

        let group = coordinator.group("team").unwrap();
        assert_eq!(group.members.into_iter().collect::<Vec<_>>(), vec![addr("127.0.0.2")]);
        assert_eq!(
            group.messages,
            vec![GroupMessage {
                sender: addr("127.0.0.2"),
                text: "hello".into()
            }]
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            NodeEvent::GroupMessage {
                group: "team".into(),
                address: addr("127.0.0.2"),
                text: "hello".into()
            }
        );
    }

    #[tokio::test]
    async fn test_send_group_message_records_history() {
        let coordinator = coordinator(None).await;
        assert!(matches!(
            coordinator.send_group_message("nope", "x").await,
            Err(PeerError::State(_))
        ));

        coordinator
            .create_group("team", &[addr("127.0.0.2")])
            .await
            .unwrap();
        let report = coordinator.send_group_message("team", "hi all").await.unwrap();

        assert_eq!(report.len(), 1);
        assert_eq!(report.get(&addr("127.0.0.2")), Some(&false));
        assert_eq!(
            coordinator.group_messages("team").unwrap(),
            vec![GroupMessage {
                sender: addr(LOCAL),
                text: "hi all".into()
            }]
        );
    }

    #[tokio::test]
    async fn test_concurrent_group_messages_all_persisted() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = Arc::new(StateStore::open(dir.path()).unwrap());
        let coordinator = coordinator(Some(Arc::clone(&store))).await;

        std::thread::scope(|scope| {
            for thread in 0..8u8 {
                let coordinator = &coordinator;
                scope.spawn(move || {
                    let source = IpAddr::from([10, 0, 2, thread]);
                    for i in 0..10 {
                        coordinator.handle_group_message(source, "team", &format!("post {}", i));
                    }
                });
            }
        });

        let stored: BTreeMap<String, Group> = store.load(GROUPS_FILE).unwrap();
        assert_eq!(stored["team"], coordinator.group("team").unwrap());
        assert_eq!(stored["team"].messages.len(), 80);
        assert_eq!(stored["team"].members.len(), 8);
    }

    #[tokio::test]
    async fn test_groups_survive_restart() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = Arc::new(StateStore::open(dir.path()).unwrap());

        let first = coordinator(Some(Arc::clone(&store))).await;
        first.handle_group_message(addr("127.0.0.2"), "team", "persisted");
        first.handle_group_message(addr("127.0.0.3"), "other", "gone soon");
        assert!(first.remove_group("other"));

        let second = coordinator(Some(Arc::clone(&store))).await;
        assert_eq!(second.groups().len(), 1);
        assert_eq!(second.group_messages("team").unwrap().len(), 1);

        assert!(second.clear_group_messages("team"));
        assert!(!second.clear_group_messages("missing"));
        second.handle_group_message(addr("127.0.0.2"), "team", "again");
        second.clear_all_group_messages();

        let third = coordinator(Some(store)).await;
        assert!(third.group_messages("team").unwrap().is_empty());
        assert_eq!(third.members("team").unwrap(), vec![addr("127.0.0.2")]);
    }
}
