use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "event", content = "data", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    #[serde(rename = "user:login")]
    UserLogin { user_id: String },

    #[serde(rename = "chat:join")]
    ChatJoin { room_id: String },
    #[serde(rename = "chat:leave")]
    ChatLeave { room_id: String },
    #[serde(rename = "taskChat:join")]
    TaskChatJoin { task_id: String },
    #[serde(rename = "taskChat:leave")]
    TaskChatLeave { task_id: String },
    #[serde(rename = "project:join")]
    ProjectJoin { project_id: String },
    #[serde(rename = "project:leave")]
    ProjectLeave { project_id: String },

    #[serde(rename = "chat:message")]
    ChatMessage {
        room_id: String,
        content: String,
        sender: String,
    },
    #[serde(rename = "taskChat:message")]
    TaskChatMessage {
        task_id: String,
        content: String,
        sender: String,
    },
    #[serde(rename = "chatbot:message")]
    ChatbotMessage {
        room_id: String,
        content: String,
        sender: String,
    },

    #[serde(rename = "chat:markRead")]
    ChatMarkRead {
        room_id: String,
        message_ids: Vec<String>,
        user_id: String,
    },
    #[serde(rename = "taskChat:markRead")]
    TaskChatMarkRead {
        task_id: String,
        message_ids: Vec<String>,
        user_id: String,
    },

    #[serde(rename = "chat:typing")]
    ChatTyping {
        room_id: String,
        user_id: String,
        is_typing: bool,
    },
    #[serde(rename = "taskChat:typing")]
    TaskChatTyping {
        task_id: String,
        user_id: String,
        is_typing: bool,
    },

    #[serde(rename = "chat:direct")]
    ChatDirect { user_id: String, other_user_id: String },
    #[serde(rename = "chat:history")]
    ChatHistory { room_id: String },
    #[serde(rename = "chat:rooms")]
    ChatRooms { user_id: String },

    #[serde(rename = "notification:subscribe")]
    NotificationSubscribe { channels: Vec<String> },
    #[serde(rename = "notification:unsubscribe")]
    NotificationUnsubscribe { channels: Vec<String> },
    #[serde(rename = "notification:markRead")]
    NotificationMarkRead {
        notification_id: String,
        user_id: String,
    },
    #[serde(rename = "notification:markAllRead")]
    NotificationMarkAllRead { user_id: String },
}

impl ClientMessage {
    /// Prefix of the `<scope>:error` event sent back when handling fails.
    pub fn scope(&self) -> &'static str {
        match self {
            ClientMessage::UserLogin { .. } => "user",
            ClientMessage::ChatJoin { .. }
            | ClientMessage::ChatLeave { .. }
            | ClientMessage::ChatMessage { .. }
            | ClientMessage::ChatMarkRead { .. }
            | ClientMessage::ChatTyping { .. }
            | ClientMessage::ChatDirect { .. }
            | ClientMessage::ChatHistory { .. }
            | ClientMessage::ChatRooms { .. } => "chat",
            ClientMessage::TaskChatJoin { .. }
            | ClientMessage::TaskChatLeave { .. }
            | ClientMessage::TaskChatMessage { .. }
            | ClientMessage::TaskChatMarkRead { .. }
            | ClientMessage::TaskChatTyping { .. } => "taskChat",
            ClientMessage::ProjectJoin { .. } | ClientMessage::ProjectLeave { .. } => "project",
            ClientMessage::ChatbotMessage { .. } => "chatbot",
            ClientMessage::NotificationSubscribe { .. }
            | ClientMessage::NotificationUnsubscribe { .. }
            | ClientMessage::NotificationMarkRead { .. }
            | ClientMessage::NotificationMarkAllRead { .. } => "notification",
        }
    }
}

/// Outbound event frame: `{"event": "...", "data": {...}}`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ServerMessage {
    pub event: String,
    pub data: Value,
}

impl ServerMessage {
    pub fn new(event: &str, data: Value) -> Self {
        ServerMessage {
            event: event.to_string(),
            data,
        }
    }

    pub fn error(scope: &str, message: &str) -> Self {
        ServerMessage::new(
            &format!("{scope}:error"),
            serde_json::json!({ "message": message }),
        )
    }
}
