use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use log::{debug, warn};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;

use crate::ai::{self, AiResponder};
use crate::cache::{self, Cache, ROOM_CACHE_TTL};
use crate::error::{Error, Result};
use crate::models::{ChatKind, ChatRoom, ChatSummary, Message};
use crate::room::{RoomKey, RoomRouter};
use crate::store::{ChatStore, TaskStore};

/// Messages handed to the AI responder when a room has no cached context.
pub const AI_HISTORY_LIMIT: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatTarget {
    Room(String),
    Task(String),
}

impl ChatTarget {
    fn room_key(&self) -> RoomKey {
        match self {
            ChatTarget::Room(id) => RoomKey::Chat(id.clone()),
            ChatTarget::Task(id) => RoomKey::Task(id.clone()),
        }
    }

    fn scope(&self) -> &'static str {
        match self {
            ChatTarget::Room(_) => "chat",
            ChatTarget::Task(_) => "taskChat",
        }
    }

    fn payload(&self, room_id: &str) -> Value {
        match self {
            ChatTarget::Room(_) => json!({ "roomId": room_id }),
            ChatTarget::Task(task_id) => json!({ "roomId": room_id, "taskId": task_id }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MessageDraft {
    pub sender: String,
    pub content: String,
    /// Answer with the assistant even without an `@ai` trigger.
    pub force_ai: bool,
}

impl MessageDraft {
    pub fn new(sender: &str, content: &str) -> Self {
        MessageDraft {
            sender: sender.to_string(),
            content: content.to_string(),
            force_ai: false,
        }
    }

    pub fn for_chatbot(sender: &str, content: &str) -> Self {
        MessageDraft {
            force_ai: true,
            ..Self::new(sender, content)
        }
    }
}

/// Stable id for the direct chat of an unordered user pair.
pub fn direct_room_id(user_a: &str, user_b: &str) -> String {
    let (first, second) = if user_a <= user_b {
        (user_a, user_b)
    } else {
        (user_b, user_a)
    };
    let mut hasher = Sha256::new();
    hasher.update(first.as_bytes());
    hasher.update(b":");
    hasher.update(second.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    format!("direct-{}", &digest[..24])
}

/// A persisted user message, plus the assistant task when one was started.
#[derive(Debug)]
pub struct Posted {
    pub message: Message,
    pub reply: Option<JoinHandle<()>>,
}

/// One async lock per room. Append and broadcast happen under it, so
/// every connection sees a room's messages in persisted order.
#[derive(Clone, Default)]
struct RoomTurns(Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>);

impl RoomTurns {
    async fn take(&self, room_id: &str) -> OwnedMutexGuard<()> {
        let turn = self
            .0
            .lock()
            .await
            .entry(room_id.to_string())
            .or_default()
            .clone();
        turn.lock_owned().await
    }
}

#[derive(Clone)]
pub struct MessagePipeline {
    chats: Arc<dyn ChatStore>,
    tasks: Arc<dyn TaskStore>,
    cache: Arc<dyn Cache>,
    router: RoomRouter,
    ai: Arc<AiResponder>,
    turns: RoomTurns,
}

impl MessagePipeline {
    pub fn new(
        chats: Arc<dyn ChatStore>,
        tasks: Arc<dyn TaskStore>,
        cache: Arc<dyn Cache>,
        router: RoomRouter,
        ai: Arc<AiResponder>,
    ) -> Self {
        MessagePipeline {
            chats,
            tasks,
            cache,
            router,
            ai,
            turns: RoomTurns::default(),
        }
    }

    /// Validates, persists and fans out one message. An AI answer, when
    /// asked for, runs in its own task and never fails or delays the send.
    pub async fn send_message(&self, target: &ChatTarget, draft: MessageDraft) -> Result<Posted> {
        let content = draft.content.trim();
        if content.is_empty() {
            return Err(Error::ValidationFailed("Message content cannot be empty".to_string()));
        }
        if draft.sender.trim().is_empty() {
            return Err(Error::ValidationFailed("Message sender is required".to_string()));
        }

        let room = self.resolve(target, true).await?;
        if !room.has_participant(&draft.sender) {
            return Err(Error::PermissionDenied(
                "You are not a participant of this chat".to_string(),
            ));
        }

        let message = Message::from_user(&draft.sender, content);
        let scope = if draft.force_ai { "chatbot" } else { target.scope() };
        self.post(target, &room, scope, &message).await?;

        let reply = (draft.force_ai || ai::is_ai_directed(content)).then(|| {
            let pipeline = self.clone();
            let target = target.clone();
            let trigger = message.clone();
            tokio::spawn(async move {
                match pipeline.answer(&target, &room, scope, &trigger).await {
                    Ok(reply) => debug!("AI reply {} posted in {}", reply.id, room.room_id),
                    Err(e) => warn!("AI reply for {} failed: {}", room.room_id, e),
                }
            })
        });

        Ok(Posted { message, reply })
    }

    /// Append, invalidate and broadcast as one turn of the room.
    async fn post(&self, target: &ChatTarget, room: &ChatRoom, scope: &str, message: &Message) -> Result<()> {
        let _turn = self.turns.take(&room.room_id).await;
        self.chats.append_message(&room.room_id, message.clone()).await?;
        self.invalidate(room).await;
        self.publish(target, &room.room_id, scope, message).await
    }

    async fn answer(
        &self,
        target: &ChatTarget,
        room: &ChatRoom,
        scope: &str,
        trigger: &Message,
    ) -> Result<Message> {
        let query = if ai::is_ai_directed(&trigger.content) {
            ai::strip_trigger(&trigger.content)
        } else {
            trigger.content.clone()
        };
        let mut history = self
            .chats
            .recent_messages(&room.room_id, AI_HISTORY_LIMIT + 1)
            .await?;
        history.retain(|m| m.id != trigger.id);
        if history.len() > AI_HISTORY_LIMIT {
            history.remove(0);
        }

        let reply = self.ai.respond(&room.room_id, &query, &history).await?;
        let message = Message::from_ai(&reply);
        self.post(target, room, scope, &message).await?;
        Ok(message)
    }

    async fn publish(&self, target: &ChatTarget, room_id: &str, scope: &str, message: &Message) -> Result<()> {
        let mut payload = target.payload(room_id);
        payload["message"] = serde_json::to_value(message)?;
        self.router
            .broadcast(&target.room_key(), &format!("{scope}:message"), payload, None)
            .await;
        Ok(())
    }

    /// Marks the listed messages read by `user_id` and tells the rest of
    /// the room. Returns the ids that changed.
    pub async fn mark_read(
        &self,
        target: &ChatTarget,
        message_ids: &[String],
        user_id: &str,
        acting_connection: Option<&str>,
    ) -> Result<Vec<String>> {
        if user_id.trim().is_empty() {
            return Err(Error::ValidationFailed("userId is required".to_string()));
        }
        if message_ids.is_empty() {
            return Ok(Vec::new());
        }
        let room = self.resolve(target, false).await?;
        let changed = self
            .chats
            .mark_messages_read(&room.room_id, message_ids, user_id)
            .await?;
        if changed.is_empty() {
            return Ok(changed);
        }

        self.invalidate(&room).await;
        let mut payload = target.payload(&room.room_id);
        payload["messageIds"] = json!(changed);
        payload["userId"] = json!(user_id);
        self.router
            .broadcast(
                &target.room_key(),
                &format!("{}:messageRead", target.scope()),
                payload,
                acting_connection,
            )
            .await;
        Ok(changed)
    }

    /// Find-or-create in one store operation, so racing callers end up
    /// with the same room.
    pub async fn get_or_create_direct_chat(&self, user_a: &str, user_b: &str) -> Result<ChatRoom> {
        if user_a.trim().is_empty() || user_b.trim().is_empty() {
            return Err(Error::ValidationFailed("Both user ids are required".to_string()));
        }
        if user_a == user_b {
            return Err(Error::ValidationFailed("Cannot open a direct chat with yourself".to_string()));
        }
        let candidate = ChatRoom::new(
            direct_room_id(user_a, user_b),
            ChatKind::Direct,
            vec![user_a.to_string(), user_b.to_string()],
        );
        let room = self
            .chats
            .find_or_create_direct_chat(user_a, user_b, candidate)
            .await?;
        for user in [user_a, user_b] {
            self.forget(&cache::user_rooms_key(user)).await;
        }
        Ok(room)
    }

    pub async fn rooms_for_user(&self, user_id: &str) -> Result<Vec<ChatSummary>> {
        let key = cache::user_rooms_key(user_id);
        match cache::get_json::<Vec<ChatSummary>>(self.cache.as_ref(), &key).await {
            Ok(Some(rooms)) => return Ok(rooms),
            Ok(None) => {}
            Err(e) => warn!("Room list cache read failed for {}: {}", user_id, e),
        }
        let rooms = self.chats.chats_for_user(user_id).await?;
        if let Err(e) = cache::set_json(self.cache.as_ref(), &key, &rooms, ROOM_CACHE_TTL).await {
            warn!("Room list cache write failed for {}: {}", user_id, e);
        }
        Ok(rooms)
    }

    /// Full room with history, for a participant.
    pub async fn history(&self, room_id: &str, user_id: &str) -> Result<ChatRoom> {
        let room = self.room(room_id).await?;
        if !room.has_participant(user_id) {
            return Err(Error::PermissionDenied(
                "You are not a participant of this chat".to_string(),
            ));
        }
        Ok(room)
    }

    async fn room(&self, room_id: &str) -> Result<ChatRoom> {
        let key = cache::room_key(room_id);
        match cache::get_json::<ChatRoom>(self.cache.as_ref(), &key).await {
            Ok(Some(room)) => return Ok(room),
            Ok(None) => {}
            Err(e) => warn!("Room cache read failed for {}: {}", room_id, e),
        }
        let room = self
            .chats
            .find_chat(room_id)
            .await?
            .ok_or_else(|| Error::NotFound("Chat room not found".to_string()))?;
        if let Err(e) = cache::set_json(self.cache.as_ref(), &key, &room, ROOM_CACHE_TTL).await {
            warn!("Room cache write failed for {}: {}", room_id, e);
        }
        Ok(room)
    }

    async fn resolve(&self, target: &ChatTarget, create: bool) -> Result<ChatRoom> {
        match target {
            ChatTarget::Room(room_id) => {
                if room_id.trim().is_empty() {
                    return Err(Error::ValidationFailed("roomId is required".to_string()));
                }
                self.chats
                    .find_chat(room_id)
                    .await?
                    .ok_or_else(|| Error::NotFound("Chat room not found".to_string()))
            }
            ChatTarget::Task(task_id) => {
                if task_id.trim().is_empty() {
                    return Err(Error::ValidationFailed("taskId is required".to_string()));
                }
                if let Some(room) = self.chats.find_task_chat(task_id).await? {
                    return Ok(room);
                }
                if !create {
                    return Err(Error::NotFound("Task chat not found".to_string()));
                }
                self.create_task_chat(task_id).await
            }
        }
    }

    /// One chat per task: creator, assignee and project members.
    async fn create_task_chat(&self, task_id: &str) -> Result<ChatRoom> {
        let task = self
            .tasks
            .find_task(task_id)
            .await?
            .ok_or_else(|| Error::NotFound("Task not found".to_string()))?;
        let project = match task.project.as_deref() {
            Some(project_id) => self.tasks.find_project(project_id).await?,
            None => None,
        };

        let mut participants = vec![task.created_by.clone()];
        let others = task
            .assigned_to
            .iter()
            .chain(project.iter().flat_map(|p| p.members.iter()));
        for user in others {
            if !participants.contains(user) {
                participants.push(user.clone());
            }
        }

        let room_id = format!("task-{}-{}", task_id, Utc::now().timestamp_millis());
        let mut candidate = ChatRoom::new(room_id, ChatKind::Task, participants);
        candidate.task = Some(task_id.to_string());
        candidate.metadata = json!({ "taskTitle": task.title, "project": task.project });

        let room = self.chats.find_or_create_task_chat(task_id, candidate).await?;
        debug!("Task {} uses chat {}", task_id, room.room_id);
        for user in &room.participants {
            self.forget(&cache::user_rooms_key(user)).await;
        }
        Ok(room)
    }

    /// Coarse invalidation: the room and every participant's room list.
    async fn invalidate(&self, room: &ChatRoom) {
        self.forget(&cache::room_key(&room.room_id)).await;
        for user in &room.participants {
            self.forget(&cache::user_rooms_key(user)).await;
        }
    }

    async fn forget(&self, key: &str) {
        if let Err(e) = self.cache.del(key).await {
            warn!("Cache invalidation failed for {}: {}", key, e);
        }
    }
}
