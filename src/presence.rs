use std::collections::HashMap;
use std::sync::Arc;

use log::debug;
use tokio::sync::RwLock;

use crate::room::ConnectionId;

/// Who is online: `user_id -> connection`. One tracked session per user,
/// the latest login wins.
#[derive(Clone, Default)]
pub struct PresenceRegistry {
    sessions: Arc<RwLock<HashMap<String, ConnectionId>>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the handle this registration replaced, if any.
    pub async fn register(&self, user_id: &str, connection: &str) -> Option<ConnectionId> {
        let mut sessions = self.sessions.write().await;
        let previous = sessions.insert(user_id.to_string(), connection.to_string());
        debug!("Registered {} on connection {}", user_id, connection);
        previous.filter(|prev| prev != connection)
    }

    /// Drops every entry pointing at `connection`. Returns the freed user.
    pub async fn unregister(&self, connection: &str) -> Option<String> {
        let mut sessions = self.sessions.write().await;
        let freed: Vec<String> = sessions
            .iter()
            .filter(|(_, handle)| handle.as_str() == connection)
            .map(|(user, _)| user.clone())
            .collect();
        for user in &freed {
            sessions.remove(user);
        }
        freed.into_iter().next()
    }

    pub async fn is_online(&self, user_id: &str) -> bool {
        self.sessions.read().await.contains_key(user_id)
    }

    pub async fn lookup(&self, user_id: &str) -> Option<ConnectionId> {
        self.sessions.read().await.get(user_id).cloned()
    }

    pub async fn online_users(&self) -> Vec<String> {
        let mut users: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        users.sort();
        users
    }
}
