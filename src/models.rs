use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Synthetic sender identity used for assistant replies.
pub const AI_SENDER: &str = "ai-assistant";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatKind {
    Direct,
    Group,
    Project,
    Task,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub sender: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub read: Vec<String>,
    #[serde(default, rename = "isAI")]
    pub is_ai: bool,
}

impl Message {
    /// A user message starts out read by its sender.
    pub fn from_user(sender: &str, content: &str) -> Self {
        Message {
            id: Uuid::new_v4().to_string(),
            sender: sender.to_string(),
            content: content.to_string(),
            timestamp: Utc::now(),
            read: vec![sender.to_string()],
            is_ai: false,
        }
    }

    pub fn from_ai(content: &str) -> Self {
        Message {
            id: Uuid::new_v4().to_string(),
            sender: AI_SENDER.to_string(),
            content: content.to_string(),
            timestamp: Utc::now(),
            read: Vec::new(),
            is_ai: true,
        }
    }

    pub fn is_read_by(&self, user_id: &str) -> bool {
        self.read.iter().any(|u| u == user_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRoom {
    pub room_id: String,
    #[serde(rename = "type")]
    pub kind: ChatKind,
    pub participants: Vec<String>,
    pub messages: Vec<Message>,
    pub last_activity: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Value,
    pub task: Option<String>,
}

impl ChatRoom {
    pub fn new(room_id: String, kind: ChatKind, participants: Vec<String>) -> Self {
        ChatRoom {
            room_id,
            kind,
            participants,
            messages: Vec::new(),
            last_activity: Utc::now(),
            metadata: Value::Null,
            task: None,
        }
    }

    pub fn has_participant(&self, user_id: &str) -> bool {
        self.participants.iter().any(|p| p == user_id)
    }
}

/// Room listing entry without the embedded message history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSummary {
    pub room_id: String,
    #[serde(rename = "type")]
    pub kind: ChatKind,
    pub participants: Vec<String>,
    pub last_activity: DateTime<Utc>,
    pub last_message: Option<Message>,
}

impl From<&ChatRoom> for ChatSummary {
    fn from(room: &ChatRoom) -> Self {
        ChatSummary {
            room_id: room.room_id.clone(),
            kind: room.kind,
            participants: room.participants.clone(),
            last_activity: room.last_activity,
            last_message: room.messages.last().cloned(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Task,
    Project,
    Chat,
    Deadline,
    Mention,
    System,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationDraft {
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub recipients: Vec<String>,
    pub sender: Option<String>,
    pub content: String,
    pub related_project: Option<String>,
    pub related_task: Option<String>,
    #[serde(default)]
    pub metadata: Value,
    pub expires_at: Option<DateTime<Utc>>,
}

impl NotificationDraft {
    pub fn new(kind: NotificationKind, recipients: Vec<String>, content: impl Into<String>) -> Self {
        NotificationDraft {
            kind,
            recipients,
            sender: None,
            content: content.into(),
            related_project: None,
            related_task: None,
            metadata: Value::Null,
            expires_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub recipients: Vec<String>,
    pub sender: Option<String>,
    pub content: String,
    pub read: Vec<String>,
    pub related_project: Option<String>,
    pub related_task: Option<String>,
    #[serde(default)]
    pub metadata: Value,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn from_draft(draft: NotificationDraft, created_at: DateTime<Utc>) -> Self {
        Notification {
            id: Uuid::new_v4().to_string(),
            kind: draft.kind,
            recipients: draft.recipients,
            sender: draft.sender,
            content: draft.content,
            read: Vec::new(),
            related_project: draft.related_project,
            related_task: draft.related_task,
            metadata: draft.metadata,
            expires_at: draft.expires_at,
            created_at,
        }
    }

    pub fn is_read_by(&self, user_id: &str) -> bool {
        self.read.iter().any(|u| u == user_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Todo,
    InProgress,
    Review,
    Completed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Cancelled)
    }

    pub fn label(self) -> &'static str {
        match self {
            TaskStatus::Todo => "todo",
            TaskStatus::InProgress => "in progress",
            TaskStatus::Review => "review",
            TaskStatus::Completed => "completed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub title: String,
    pub status: TaskStatus,
    pub project: Option<String>,
    pub assigned_to: Option<String>,
    pub created_by: String,
    pub updated_by: Option<String>,
    pub due_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    pub name: String,
    pub owner: String,
    pub members: Vec<String>,
    pub updated_by: Option<String>,
}

/// Collections whose mutations are observed through the change feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Collection {
    Tasks,
    Projects,
}

impl Collection {
    /// Event prefix, as in `task:created`.
    pub fn entity(self) -> &'static str {
        match self {
            Collection::Tasks => "task",
            Collection::Projects => "project",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Insert,
    Update,
    Replace,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub operation_type: OperationType,
    pub collection: Collection,
    pub document_id: String,
    pub full_document: Option<Value>,
    #[serde(default)]
    pub updated_fields: Vec<String>,
}

impl ChangeEvent {
    pub fn touches(&self, field: &str) -> bool {
        self.updated_fields.iter().any(|f| f == field)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_message_is_read_by_sender() {
        let msg = Message::from_user("alice", "hello");
        assert!(msg.is_read_by("alice"));
        assert!(!msg.is_ai);
    }

    #[test]
    fn ai_message_starts_unread() {
        let msg = Message::from_ai("hi");
        assert_eq!(msg.sender, AI_SENDER);
        assert!(msg.read.is_empty());
        assert!(msg.is_ai);
    }

    #[test]
    fn chat_room_serializes_kind_as_type() {
        let room = ChatRoom::new("r1".into(), ChatKind::Direct, vec!["a".into(), "b".into()]);
        let json = serde_json::to_value(&room).unwrap();
        assert_eq!(json["type"], "direct");
        assert_eq!(json["roomId"], "r1");
    }

    #[test]
    fn task_status_wire_names() {
        let status: TaskStatus = serde_json::from_str("\"in_progress\"").unwrap();
        assert_eq!(status, TaskStatus::InProgress);
        assert!(!status.is_terminal());
        assert!(TaskStatus::Completed.is_terminal());
    }
}
