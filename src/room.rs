use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use log::debug;
use serde_json::Value;
use tokio::sync::{mpsc, RwLock};

use crate::messages::ServerMessage;

pub type ConnectionId = String;
pub type Outbound = mpsc::UnboundedSender<ServerMessage>;

/// Broadcast group key. The prefix namespaces ids so keys of different
/// entity kinds never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RoomKey {
    Chat(String),
    Task(String),
    Project(String),
    User(String),
    Notification(String),
}

impl RoomKey {
    pub fn parse(raw: &str) -> Option<RoomKey> {
        let (kind, id) = raw.split_once(':')?;
        if id.is_empty() {
            return None;
        }
        let id = id.to_string();
        match kind {
            "chat" => Some(RoomKey::Chat(id)),
            "task" => Some(RoomKey::Task(id)),
            "project" => Some(RoomKey::Project(id)),
            "user" => Some(RoomKey::User(id)),
            "notification" => Some(RoomKey::Notification(id)),
            _ => None,
        }
    }
}

impl fmt::Display for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoomKey::Chat(id) => write!(f, "chat:{id}"),
            RoomKey::Task(id) => write!(f, "task:{id}"),
            RoomKey::Project(id) => write!(f, "project:{id}"),
            RoomKey::User(id) => write!(f, "user:{id}"),
            RoomKey::Notification(id) => write!(f, "notification:{id}"),
        }
    }
}

struct Connection {
    sender: Outbound,
    rooms: HashSet<RoomKey>,
}

#[derive(Default)]
struct RouterState {
    connections: HashMap<ConnectionId, Connection>,
    rooms: HashMap<RoomKey, HashSet<ConnectionId>>,
}

/// Room membership and fan-out. Delivery is fire-and-forget: events for
/// rooms nobody joined, or for closed connections, are dropped.
#[derive(Clone, Default)]
pub struct RoomRouter {
    state: Arc<RwLock<RouterState>>,
}

impl RoomRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn connect(&self, connection: &str, sender: Outbound) {
        let mut state = self.state.write().await;
        state.connections.insert(
            connection.to_string(),
            Connection {
                sender,
                rooms: HashSet::new(),
            },
        );
    }

    /// Removes the connection and all its memberships.
    pub async fn disconnect(&self, connection: &str) {
        let mut state = self.state.write().await;
        let Some(conn) = state.connections.remove(connection) else {
            return;
        };
        for room in conn.rooms {
            if let Some(members) = state.rooms.get_mut(&room) {
                members.remove(connection);
                if members.is_empty() {
                    state.rooms.remove(&room);
                }
            }
        }
    }

    /// Returns `false` when the connection was already a member (or is unknown).
    pub async fn join(&self, connection: &str, room: RoomKey) -> bool {
        let mut state = self.state.write().await;
        let Some(conn) = state.connections.get_mut(connection) else {
            return false;
        };
        if !conn.rooms.insert(room.clone()) {
            return false;
        }
        debug!("{} joined {}", connection, room);
        state
            .rooms
            .entry(room)
            .or_default()
            .insert(connection.to_string());
        true
    }

    /// Returns `false` when the connection was not a member.
    pub async fn leave(&self, connection: &str, room: &RoomKey) -> bool {
        let mut state = self.state.write().await;
        let Some(conn) = state.connections.get_mut(connection) else {
            return false;
        };
        if !conn.rooms.remove(room) {
            return false;
        }
        debug!("{} left {}", connection, room);
        if let Some(members) = state.rooms.get_mut(room) {
            members.remove(connection);
            if members.is_empty() {
                state.rooms.remove(room);
            }
        }
        true
    }

    /// Sends to every member of `room` except `exclude`. Returns the number of deliveries.
    pub async fn broadcast(
        &self,
        room: &RoomKey,
        event: &str,
        payload: Value,
        exclude: Option<&str>,
    ) -> usize {
        let state = self.state.read().await;
        let Some(members) = state.rooms.get(room) else {
            return 0;
        };
        let message = ServerMessage::new(event, payload);
        members
            .iter()
            .filter(|id| Some(id.as_str()) != exclude)
            .filter_map(|id| state.connections.get(id))
            .filter(|conn| conn.sender.send(message.clone()).is_ok())
            .count()
    }

    /// Sends to every connection, room membership aside.
    pub async fn broadcast_all(&self, event: &str, payload: Value, exclude: Option<&str>) -> usize {
        let state = self.state.read().await;
        let message = ServerMessage::new(event, payload);
        state
            .connections
            .iter()
            .filter(|(id, _)| Some(id.as_str()) != exclude)
            .filter(|(_, conn)| conn.sender.send(message.clone()).is_ok())
            .count()
    }

    pub async fn send_to(&self, connection: &str, event: &str, payload: Value) -> bool {
        let state = self.state.read().await;
        state
            .connections
            .get(connection)
            .is_some_and(|conn| conn.sender.send(ServerMessage::new(event, payload)).is_ok())
    }

    pub async fn members(&self, room: &RoomKey) -> Vec<ConnectionId> {
        let state = self.state.read().await;
        let mut members: Vec<ConnectionId> = state
            .rooms
            .get(room)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default();
        members.sort();
        members
    }

    pub async fn rooms_of(&self, connection: &str) -> HashSet<RoomKey> {
        let state = self.state.read().await;
        state
            .connections
            .get(connection)
            .map(|conn| conn.rooms.clone())
            .unwrap_or_default()
    }

    pub async fn connection_count(&self) -> usize {
        self.state.read().await.connections.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn connected(router: &RoomRouter, id: &str) -> mpsc::UnboundedReceiver<ServerMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        router.connect(id, tx).await;
        rx
    }

    #[test]
    fn room_keys_are_namespaced() {
        assert_eq!(RoomKey::Task("42".into()).to_string(), "task:42");
        assert_ne!(
            RoomKey::Task("42".into()).to_string(),
            RoomKey::Project("42".into()).to_string()
        );
        assert_eq!(RoomKey::parse("user:bob"), Some(RoomKey::User("bob".into())));
        assert_eq!(RoomKey::parse("chat:"), None);
        assert_eq!(RoomKey::parse("lobby:1"), None);
    }

    #[tokio::test]
    async fn join_and_leave_are_idempotent() {
        let router = RoomRouter::new();
        let _rx = connected(&router, "c1").await;
        let room = RoomKey::Chat("r".into());

        assert!(router.join("c1", room.clone()).await);
        assert!(!router.join("c1", room.clone()).await);
        assert_eq!(router.members(&room).await, vec!["c1".to_string()]);

        assert!(router.leave("c1", &room).await);
        assert!(!router.leave("c1", &room).await);
        assert!(router.members(&room).await.is_empty());

        // the final op decides membership, whatever came before
        for _ in 0..3 {
            router.join("c1", room.clone()).await;
        }
        router.leave("c1", &room).await;
        router.join("c1", room.clone()).await;
        assert_eq!(router.members(&room).await.len(), 1);
    }

    #[tokio::test]
    async fn broadcast_skips_excluded_connection() {
        let router = RoomRouter::new();
        let mut rx1 = connected(&router, "c1").await;
        let mut rx2 = connected(&router, "c2").await;
        let room = RoomKey::Project("p".into());
        router.join("c1", room.clone()).await;
        router.join("c2", room.clone()).await;

        let sent = router.broadcast(&room, "project:updated", json!({"id": "p"}), Some("c1")).await;
        assert_eq!(sent, 1);
        assert_eq!(rx2.recv().await.unwrap().event, "project:updated");
        assert!(rx1.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcast_to_empty_room_is_noop() {
        let router = RoomRouter::new();
        let sent = router
            .broadcast(&RoomKey::User("offline".into()), "notification:new", json!({}), None)
            .await;
        assert_eq!(sent, 0);
    }

    #[tokio::test]
    async fn disconnect_clears_memberships() {
        let router = RoomRouter::new();
        let _rx = connected(&router, "c1").await;
        router.join("c1", RoomKey::Chat("a".into())).await;
        router.join("c1", RoomKey::Task("b".into())).await;
        assert_eq!(router.rooms_of("c1").await.len(), 2);

        router.disconnect("c1").await;
        router.disconnect("c1").await;
        assert!(router.members(&RoomKey::Chat("a".into())).await.is_empty());
        assert_eq!(router.connection_count().await, 0);
    }

    #[tokio::test]
    async fn closed_receivers_are_not_counted() {
        let router = RoomRouter::new();
        let rx = connected(&router, "c1").await;
        drop(rx);
        assert_eq!(router.broadcast_all("user:online", json!({}), None).await, 0);
    }
}
