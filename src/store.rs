use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::Stream;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, RwLock};

use crate::error::{Error, Result};
use crate::models::{
    ChangeEvent, ChatKind, ChatRoom, ChatSummary, Collection, Message, Notification,
    NotificationKind, OperationType, Project, Task,
};

pub type ChangeStream = Pin<Box<dyn Stream<Item = Result<ChangeEvent>> + Send>>;

/// Chat persistence. Every mutation is a single atomic operation on the store.
#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn find_chat(&self, room_id: &str) -> Result<Option<ChatRoom>>;

    async fn find_task_chat(&self, task_id: &str) -> Result<Option<ChatRoom>>;

    /// Returns the existing direct room for the unordered pair, inserting `candidate` otherwise.
    async fn find_or_create_direct_chat(
        &self,
        user_a: &str,
        user_b: &str,
        candidate: ChatRoom,
    ) -> Result<ChatRoom>;

    /// Returns the existing chat for the task, inserting `candidate` otherwise.
    async fn find_or_create_task_chat(&self, task_id: &str, candidate: ChatRoom) -> Result<ChatRoom>;

    async fn insert_chat(&self, room: ChatRoom) -> Result<ChatRoom>;

    /// Appends to the room's message sequence and bumps `lastActivity`.
    async fn append_message(&self, room_id: &str, message: Message) -> Result<()>;

    /// Adds `user_id` to the read set of each listed message lacking it.
    /// Returns the ids that were actually changed.
    async fn mark_messages_read(
        &self,
        room_id: &str,
        message_ids: &[String],
        user_id: &str,
    ) -> Result<Vec<String>>;

    async fn recent_messages(&self, room_id: &str, limit: usize) -> Result<Vec<Message>>;

    async fn chats_for_user(&self, user_id: &str) -> Result<Vec<ChatSummary>>;
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn find_task(&self, task_id: &str) -> Result<Option<Task>>;

    async fn find_project(&self, project_id: &str) -> Result<Option<Project>>;

    /// Tasks of any status whose due date falls in `[from, to]`, earliest first.
    async fn tasks_due_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Task>>;
}

#[async_trait]
pub trait NotificationStore: Send + Sync {
    async fn insert_notification(&self, notification: Notification) -> Result<Notification>;

    /// Returns `false` when the user had already read it.
    async fn mark_notification_read(&self, notification_id: &str, user_id: &str) -> Result<bool>;

    async fn mark_all_notifications_read(&self, user_id: &str) -> Result<usize>;

    async fn unread_notifications(&self, user_id: &str) -> Result<Vec<Notification>>;

    async fn recent_notification_exists(
        &self,
        kind: NotificationKind,
        task_id: &str,
        recipient: &str,
        since: DateTime<Utc>,
    ) -> Result<bool>;
}

#[async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn supports_change_feed(&self) -> Result<bool>;

    async fn watch(&self, collection: Collection) -> Result<ChangeStream>;
}

type Watchers = HashMap<Collection, Vec<mpsc::UnboundedSender<Result<ChangeEvent>>>>;

#[derive(Default)]
struct StoreState {
    chats: HashMap<String, ChatRoom>,
    tasks: HashMap<String, Task>,
    projects: HashMap<String, Project>,
    notifications: Vec<Notification>,
    watchers: Watchers,
}

/// In-process document store. A single lock serializes every write, which
/// makes each trait operation atomic.
#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<RwLock<StoreState>>,
    change_feed_enabled: bool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore {
            state: Arc::new(RwLock::new(StoreState::default())),
            change_feed_enabled: true,
        }
    }

    /// A store that reports no change-feed capability.
    pub fn without_change_feed() -> Self {
        MemoryStore {
            change_feed_enabled: false,
            ..Self::new()
        }
    }

    pub async fn insert_task(&self, task: Task) -> Result<Task> {
        let mut state = self.state.write().await;
        if state.tasks.contains_key(&task.id) {
            return Err(Error::ValidationFailed(format!("Task {} already exists", task.id)));
        }
        state.tasks.insert(task.id.clone(), task.clone());
        let event = change(OperationType::Insert, Collection::Tasks, &task.id, Some(&task), Vec::new())?;
        emit(&mut state.watchers, event);
        Ok(task)
    }

    pub async fn update_task<F>(&self, task_id: &str, apply: F) -> Result<Task>
    where
        F: FnOnce(&mut Task) + Send,
    {
        let mut state = self.state.write().await;
        let task = state
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| Error::NotFound(format!("Task {task_id} not found")))?;
        let before = serde_json::to_value(&*task)?;
        apply(task);
        task.id = task_id.to_string();
        let after = serde_json::to_value(&*task)?;
        let task = task.clone();
        let event = change(
            OperationType::Update,
            Collection::Tasks,
            task_id,
            Some(&task),
            changed_fields(&before, &after),
        )?;
        emit(&mut state.watchers, event);
        Ok(task)
    }

    pub async fn replace_task(&self, task: Task) -> Result<Task> {
        let mut state = self.state.write().await;
        let before = state
            .tasks
            .get(&task.id)
            .map(serde_json::to_value)
            .transpose()?
            .ok_or_else(|| Error::NotFound(format!("Task {} not found", task.id)))?;
        let after = serde_json::to_value(&task)?;
        state.tasks.insert(task.id.clone(), task.clone());
        let event = change(
            OperationType::Replace,
            Collection::Tasks,
            &task.id,
            Some(&task),
            changed_fields(&before, &after),
        )?;
        emit(&mut state.watchers, event);
        Ok(task)
    }

    pub async fn delete_task(&self, task_id: &str) -> Result<()> {
        let mut state = self.state.write().await;
        if state.tasks.remove(task_id).is_none() {
            return Err(Error::NotFound(format!("Task {task_id} not found")));
        }
        let event = change::<Task>(OperationType::Delete, Collection::Tasks, task_id, None, Vec::new())?;
        emit(&mut state.watchers, event);
        Ok(())
    }

    pub async fn insert_project(&self, project: Project) -> Result<Project> {
        let mut state = self.state.write().await;
        if state.projects.contains_key(&project.id) {
            return Err(Error::ValidationFailed(format!(
                "Project {} already exists",
                project.id
            )));
        }
        state.projects.insert(project.id.clone(), project.clone());
        let event = change(
            OperationType::Insert,
            Collection::Projects,
            &project.id,
            Some(&project),
            Vec::new(),
        )?;
        emit(&mut state.watchers, event);
        Ok(project)
    }

    pub async fn update_project<F>(&self, project_id: &str, apply: F) -> Result<Project>
    where
        F: FnOnce(&mut Project) + Send,
    {
        let mut state = self.state.write().await;
        let project = state
            .projects
            .get_mut(project_id)
            .ok_or_else(|| Error::NotFound(format!("Project {project_id} not found")))?;
        let before = serde_json::to_value(&*project)?;
        apply(project);
        project.id = project_id.to_string();
        let after = serde_json::to_value(&*project)?;
        let project = project.clone();
        let event = change(
            OperationType::Update,
            Collection::Projects,
            project_id,
            Some(&project),
            changed_fields(&before, &after),
        )?;
        emit(&mut state.watchers, event);
        Ok(project)
    }

    pub async fn delete_project(&self, project_id: &str) -> Result<()> {
        let mut state = self.state.write().await;
        if state.projects.remove(project_id).is_none() {
            return Err(Error::NotFound(format!("Project {project_id} not found")));
        }
        let event = change::<Project>(
            OperationType::Delete,
            Collection::Projects,
            project_id,
            None,
            Vec::new(),
        )?;
        emit(&mut state.watchers, event);
        Ok(())
    }

    /// Fails every open stream on `collection` and drops it, as a broken
    /// server-side cursor would.
    pub async fn interrupt_change_streams(&self, collection: Collection) {
        let mut state = self.state.write().await;
        if let Some(senders) = state.watchers.remove(&collection) {
            for sender in senders {
                let _ = sender.send(Err(Error::StreamFailure("cursor killed".to_string())));
            }
        }
    }

    pub async fn watcher_count(&self, collection: Collection) -> usize {
        let state = self.state.read().await;
        state
            .watchers
            .get(&collection)
            .map_or(0, |senders| senders.iter().filter(|s| !s.is_closed()).count())
    }

    pub async fn notifications(&self) -> Vec<Notification> {
        self.state.read().await.notifications.clone()
    }
}

fn change<T: Serialize>(
    operation_type: OperationType,
    collection: Collection,
    document_id: &str,
    document: Option<&T>,
    updated_fields: Vec<String>,
) -> Result<ChangeEvent> {
    Ok(ChangeEvent {
        operation_type,
        collection,
        document_id: document_id.to_string(),
        full_document: document.map(serde_json::to_value).transpose()?,
        updated_fields,
    })
}

fn emit(watchers: &mut Watchers, event: ChangeEvent) {
    if let Some(senders) = watchers.get_mut(&event.collection) {
        senders.retain(|sender| sender.send(Ok(event.clone())).is_ok());
    }
}

/// Top-level fields whose value differs between two document snapshots.
fn changed_fields(before: &Value, after: &Value) -> Vec<String> {
    let (Some(before), Some(after)) = (before.as_object(), after.as_object()) else {
        return Vec::new();
    };
    let mut fields: Vec<String> = after
        .iter()
        .filter(|(key, value)| before.get(*key) != Some(*value))
        .map(|(key, _)| key.clone())
        .chain(
            before
                .keys()
                .filter(|key| !after.contains_key(*key))
                .cloned(),
        )
        .collect();
    fields.sort();
    fields
}

fn same_pair(room: &ChatRoom, user_a: &str, user_b: &str) -> bool {
    room.kind == ChatKind::Direct
        && room.participants.len() == 2
        && room.has_participant(user_a)
        && room.has_participant(user_b)
}

#[async_trait]
impl ChatStore for MemoryStore {
    async fn find_chat(&self, room_id: &str) -> Result<Option<ChatRoom>> {
        let state = self.state.read().await;
        Ok(state.chats.get(room_id).cloned())
    }

    async fn find_task_chat(&self, task_id: &str) -> Result<Option<ChatRoom>> {
        let state = self.state.read().await;
        Ok(state
            .chats
            .values()
            .find(|room| room.kind == ChatKind::Task && room.task.as_deref() == Some(task_id))
            .cloned())
    }

    async fn find_or_create_direct_chat(
        &self,
        user_a: &str,
        user_b: &str,
        candidate: ChatRoom,
    ) -> Result<ChatRoom> {
        let mut state = self.state.write().await;
        if let Some(existing) = state.chats.values().find(|room| same_pair(room, user_a, user_b)) {
            return Ok(existing.clone());
        }
        let room = state
            .chats
            .entry(candidate.room_id.clone())
            .or_insert(candidate);
        Ok(room.clone())
    }

    async fn find_or_create_task_chat(&self, task_id: &str, candidate: ChatRoom) -> Result<ChatRoom> {
        let mut state = self.state.write().await;
        if let Some(existing) = state
            .chats
            .values()
            .find(|room| room.kind == ChatKind::Task && room.task.as_deref() == Some(task_id))
        {
            return Ok(existing.clone());
        }
        let room = state
            .chats
            .entry(candidate.room_id.clone())
            .or_insert(candidate);
        Ok(room.clone())
    }

    async fn insert_chat(&self, room: ChatRoom) -> Result<ChatRoom> {
        let mut state = self.state.write().await;
        if state.chats.contains_key(&room.room_id) {
            return Err(Error::ValidationFailed(format!(
                "Chat room {} already exists",
                room.room_id
            )));
        }
        state.chats.insert(room.room_id.clone(), room.clone());
        Ok(room)
    }

    async fn append_message(&self, room_id: &str, message: Message) -> Result<()> {
        let mut state = self.state.write().await;
        let room = state
            .chats
            .get_mut(room_id)
            .ok_or_else(|| Error::NotFound(format!("Chat room {room_id} not found")))?;
        room.last_activity = message.timestamp;
        room.messages.push(message);
        Ok(())
    }

    async fn mark_messages_read(
        &self,
        room_id: &str,
        message_ids: &[String],
        user_id: &str,
    ) -> Result<Vec<String>> {
        let mut state = self.state.write().await;
        let room = state
            .chats
            .get_mut(room_id)
            .ok_or_else(|| Error::NotFound(format!("Chat room {room_id} not found")))?;
        let mut changed = Vec::new();
        for message in &mut room.messages {
            if message_ids.contains(&message.id) && !message.is_read_by(user_id) {
                message.read.push(user_id.to_string());
                changed.push(message.id.clone());
            }
        }
        Ok(changed)
    }

    async fn recent_messages(&self, room_id: &str, limit: usize) -> Result<Vec<Message>> {
        let state = self.state.read().await;
        let room = state
            .chats
            .get(room_id)
            .ok_or_else(|| Error::NotFound(format!("Chat room {room_id} not found")))?;
        let skip = room.messages.len().saturating_sub(limit);
        Ok(room.messages[skip..].to_vec())
    }

    async fn chats_for_user(&self, user_id: &str) -> Result<Vec<ChatSummary>> {
        let state = self.state.read().await;
        let mut rooms: Vec<ChatSummary> = state
            .chats
            .values()
            .filter(|room| room.has_participant(user_id))
            .map(ChatSummary::from)
            .collect();
        rooms.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        Ok(rooms)
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn find_task(&self, task_id: &str) -> Result<Option<Task>> {
        let state = self.state.read().await;
        Ok(state.tasks.get(task_id).cloned())
    }

    async fn find_project(&self, project_id: &str) -> Result<Option<Project>> {
        let state = self.state.read().await;
        Ok(state.projects.get(project_id).cloned())
    }

    async fn tasks_due_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Task>> {
        let state = self.state.read().await;
        let mut tasks: Vec<Task> = state
            .tasks
            .values()
            .filter(|task| task.due_date.is_some_and(|due| due >= from && due <= to))
            .cloned()
            .collect();
        tasks.sort_by_key(|task| task.due_date);
        Ok(tasks)
    }
}

#[async_trait]
impl NotificationStore for MemoryStore {
    async fn insert_notification(&self, notification: Notification) -> Result<Notification> {
        let mut state = self.state.write().await;
        state.notifications.push(notification.clone());
        Ok(notification)
    }

    async fn mark_notification_read(&self, notification_id: &str, user_id: &str) -> Result<bool> {
        let mut state = self.state.write().await;
        let notification = state
            .notifications
            .iter_mut()
            .find(|n| n.id == notification_id)
            .ok_or_else(|| Error::NotFound(format!("Notification {notification_id} not found")))?;
        if notification.is_read_by(user_id) {
            return Ok(false);
        }
        notification.read.push(user_id.to_string());
        Ok(true)
    }

    async fn mark_all_notifications_read(&self, user_id: &str) -> Result<usize> {
        let mut state = self.state.write().await;
        let mut count = 0;
        for notification in &mut state.notifications {
            if notification.recipients.iter().any(|r| r == user_id) && !notification.is_read_by(user_id) {
                notification.read.push(user_id.to_string());
                count += 1;
            }
        }
        Ok(count)
    }

    async fn unread_notifications(&self, user_id: &str) -> Result<Vec<Notification>> {
        let state = self.state.read().await;
        let now = Utc::now();
        Ok(state
            .notifications
            .iter()
            .filter(|n| n.recipients.iter().any(|r| r == user_id))
            .filter(|n| !n.is_read_by(user_id))
            .filter(|n| n.expires_at.map_or(true, |expires| expires > now))
            .cloned()
            .collect())
    }

    async fn recent_notification_exists(
        &self,
        kind: NotificationKind,
        task_id: &str,
        recipient: &str,
        since: DateTime<Utc>,
    ) -> Result<bool> {
        let state = self.state.read().await;
        Ok(state.notifications.iter().any(|n| {
            n.kind == kind
                && n.related_task.as_deref() == Some(task_id)
                && n.recipients.iter().any(|r| r == recipient)
                && n.created_at >= since
        }))
    }
}

#[async_trait]
impl ChangeFeed for MemoryStore {
    async fn supports_change_feed(&self) -> Result<bool> {
        Ok(self.change_feed_enabled)
    }

    async fn watch(&self, collection: Collection) -> Result<ChangeStream> {
        if !self.change_feed_enabled {
            return Err(Error::StreamFailure("change feed not supported".to_string()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.write().await;
        state.watchers.entry(collection).or_default().push(tx);
        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use futures_util::StreamExt;

    fn task(id: &str) -> Task {
        Task {
            id: id.to_string(),
            title: "Write docs".to_string(),
            status: crate::models::TaskStatus::Todo,
            project: Some("p1".to_string()),
            assigned_to: Some("bob".to_string()),
            created_by: "alice".to_string(),
            updated_by: None,
            due_date: None,
        }
    }

    #[tokio::test]
    async fn direct_chat_is_unique_per_pair() {
        let store = MemoryStore::new();
        let first = store
            .find_or_create_direct_chat(
                "a",
                "b",
                ChatRoom::new("d1".into(), ChatKind::Direct, vec!["a".into(), "b".into()]),
            )
            .await
            .unwrap();
        let second = store
            .find_or_create_direct_chat(
                "b",
                "a",
                ChatRoom::new("d2".into(), ChatKind::Direct, vec!["b".into(), "a".into()]),
            )
            .await
            .unwrap();
        assert_eq!(first.room_id, second.room_id);
        assert_eq!(store.state.read().await.chats.len(), 1);
    }

    #[tokio::test]
    async fn mark_read_reports_only_changes() {
        let store = MemoryStore::new();
        store
            .insert_chat(ChatRoom::new("g".into(), ChatKind::Group, vec!["a".into(), "b".into()]))
            .await
            .unwrap();
        let msg = Message::from_user("a", "hi");
        store.append_message("g", msg.clone()).await.unwrap();

        let ids = vec![msg.id.clone(), "missing".to_string()];
        assert_eq!(store.mark_messages_read("g", &ids, "b").await.unwrap(), vec![msg.id.clone()]);
        assert!(store.mark_messages_read("g", &ids, "b").await.unwrap().is_empty());
        assert!(store.mark_messages_read("g", &ids, "a").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn recent_messages_keeps_tail() {
        let store = MemoryStore::new();
        store
            .insert_chat(ChatRoom::new("g".into(), ChatKind::Group, vec!["a".into()]))
            .await
            .unwrap();
        for i in 0..5 {
            store
                .append_message("g", Message::from_user("a", &format!("m{i}")))
                .await
                .unwrap();
        }
        let recent = store.recent_messages("g", 2).await.unwrap();
        let contents: Vec<_> = recent.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m3", "m4"]);
    }

    #[tokio::test]
    async fn update_emits_changed_fields() {
        let store = MemoryStore::new();
        let mut stream = store.watch(Collection::Tasks).await.unwrap();
        store.insert_task(task("t1")).await.unwrap();
        store
            .update_task("t1", |t| {
                t.status = crate::models::TaskStatus::Completed;
                t.updated_by = Some("bob".into());
            })
            .await
            .unwrap();

        let inserted = stream.next().await.unwrap().unwrap();
        assert_eq!(inserted.operation_type, OperationType::Insert);
        let updated = stream.next().await.unwrap().unwrap();
        assert_eq!(updated.operation_type, OperationType::Update);
        assert_eq!(updated.updated_fields, vec!["status", "updatedBy"]);
        assert!(updated.full_document.is_some());
    }

    #[tokio::test]
    async fn delete_event_has_no_document() {
        let store = MemoryStore::new();
        store.insert_task(task("t1")).await.unwrap();
        let mut stream = store.watch(Collection::Tasks).await.unwrap();
        store.delete_task("t1").await.unwrap();
        let event = stream.next().await.unwrap().unwrap();
        assert_eq!(event.operation_type, OperationType::Delete);
        assert_eq!(event.document_id, "t1");
        assert!(event.full_document.is_none());
    }

    #[tokio::test]
    async fn interrupted_stream_yields_error_then_ends() {
        let store = MemoryStore::new();
        let mut stream = store.watch(Collection::Projects).await.unwrap();
        store.interrupt_change_streams(Collection::Projects).await;
        assert!(matches!(stream.next().await, Some(Err(Error::StreamFailure(_)))));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn due_query_keeps_window_only_in_due_order() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let mut soon = task("soon");
        soon.due_date = Some(now + Duration::hours(1));
        let mut done = task("done");
        done.status = crate::models::TaskStatus::Completed;
        done.due_date = Some(now + Duration::minutes(30));
        let mut later = task("later");
        later.due_date = Some(now + Duration::days(5));
        for t in [soon, done, later] {
            store.insert_task(t).await.unwrap();
        }
        let due = store
            .tasks_due_between(now, now + Duration::days(2))
            .await
            .unwrap();
        let ids: Vec<&str> = due.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["done", "soon"]);
    }

    #[tokio::test]
    async fn mark_all_read_only_touches_recipient_records() {
        let store = MemoryStore::new();
        let mine = Notification::from_draft(
            crate::models::NotificationDraft::new(NotificationKind::System, vec!["a".into()], "x"),
            Utc::now(),
        );
        let theirs = Notification::from_draft(
            crate::models::NotificationDraft::new(NotificationKind::System, vec!["b".into()], "y"),
            Utc::now(),
        );
        store.insert_notification(mine).await.unwrap();
        store.insert_notification(theirs).await.unwrap();
        assert_eq!(store.mark_all_notifications_read("a").await.unwrap(), 1);
        assert_eq!(store.mark_all_notifications_read("a").await.unwrap(), 0);
        assert_eq!(store.unread_notifications("b").await.unwrap().len(), 1);
    }
}
