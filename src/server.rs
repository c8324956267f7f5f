use std::convert::Infallible;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde_json::json;
use tokio::sync::mpsc;
use uuid::Uuid;
use warp::http::StatusCode;
use warp::ws::{Message, WebSocket};
use warp::{Filter, Rejection, Reply};

use crate::chat::{ChatTarget, MessageDraft, MessagePipeline};
use crate::error::{Error, Result};
use crate::messages::{ClientMessage, ServerMessage};
use crate::notifications::NotificationDispatcher;
use crate::presence::PresenceRegistry;
use crate::room::{ConnectionId, Outbound, RoomKey, RoomRouter};

/// Per-connection state owned by the connection's read loop.
#[derive(Debug)]
pub struct Session {
    pub id: ConnectionId,
    pub user: Option<String>,
}

#[derive(Clone)]
pub struct Server {
    presence: PresenceRegistry,
    router: RoomRouter,
    chat: Arc<MessagePipeline>,
    notifications: Arc<NotificationDispatcher>,
}

impl Server {
    pub fn new(
        presence: PresenceRegistry,
        router: RoomRouter,
        chat: Arc<MessagePipeline>,
        notifications: Arc<NotificationDispatcher>,
    ) -> Self {
        Server {
            presence,
            router,
            chat,
            notifications,
        }
    }

    pub async fn handle_connection(&self, ws: WebSocket) {
        let (mut ws_tx, mut ws_rx) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
        let mut session = self.open_session(tx).await;
        let connection = session.id.clone();

        // Ends once the router drops the connection's sender.
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let text = match serde_json::to_string(&message) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("Failed to encode {} for {}: {}", message.event, connection, e);
                        continue;
                    }
                };
                if let Err(e) = ws_tx.send(Message::text(text)).await {
                    debug!("Failed to send WebSocket message to {}: {}", connection, e);
                    break;
                }
            }
            let _ = ws_tx.close().await;
        });

        while let Some(result) = ws_rx.next().await {
            match result {
                Ok(msg) if msg.is_close() => break,
                Ok(msg) => {
                    if let Ok(text) = msg.to_str() {
                        self.handle_text(&mut session, text).await;
                    }
                }
                Err(e) => {
                    warn!("WebSocket error on {}: {}", session.id, e);
                    break;
                }
            }
        }

        self.close_session(session).await;
    }

    pub async fn open_session(&self, sender: Outbound) -> Session {
        let id = Uuid::new_v4().to_string();
        self.router.connect(&id, sender).await;
        debug!("Connection {} opened", id);
        Session { id, user: None }
    }

    /// Releases presence and room memberships. A connection that was
    /// already replaced by a newer login does not mark its user offline.
    pub async fn close_session(&self, session: Session) {
        if let Some(user_id) = self.presence.unregister(&session.id).await {
            info!("User {} went offline", user_id);
            self.router
                .broadcast_all("user:offline", json!({ "userId": user_id }), Some(&session.id))
                .await;
        }
        self.router.disconnect(&session.id).await;
        debug!("Connection {} closed", session.id);
    }

    pub async fn handle_text(&self, session: &mut Session, text: &str) {
        match serde_json::from_str::<ClientMessage>(text) {
            Ok(message) => self.handle_client_message(session, message).await,
            Err(e) => {
                debug!("Unparseable frame from {}: {}", session.id, e);
                self.router
                    .send_to(&session.id, "error", json!({ "message": "Invalid message format" }))
                    .await;
            }
        }
    }

    /// Failures go back to this connection only, as `<scope>:error`.
    pub async fn handle_client_message(&self, session: &mut Session, message: ClientMessage) {
        let scope = message.scope();
        if let Err(e) = self.dispatch(session, message).await {
            match &e {
                Error::ValidationFailed(_) | Error::NotFound(_) | Error::PermissionDenied(_) => {
                    debug!("{} request from {} rejected: {}", scope, session.id, e);
                }
                _ => warn!("{} request from {} failed: {}", scope, session.id, e),
            }
            self.send_error(&session.id, scope, &e).await;
        }
    }

    async fn send_error(&self, connection: &str, scope: &str, error: &Error) {
        let frame = ServerMessage::error(scope, &error.scope_message());
        self.router.send_to(connection, &frame.event, frame.data).await;
    }

    async fn dispatch(&self, session: &mut Session, message: ClientMessage) -> Result<()> {
        let conn = session.id.as_str();
        match message {
            ClientMessage::UserLogin { user_id } => {
                let user_id = required("userId", &user_id)?;
                if session.user.as_deref().is_some_and(|u| u != user_id) {
                    return Err(Error::ValidationFailed(
                        "Connection is already logged in as another user".to_string(),
                    ));
                }
                if let Some(previous) = self.presence.register(user_id, conn).await {
                    debug!("User {} moved from {} to {}", user_id, previous, conn);
                }
                session.user = Some(user_id.to_string());
                self.router.join(conn, RoomKey::User(user_id.to_string())).await;
                self.router
                    .broadcast_all("user:online", json!({ "userId": user_id }), Some(conn))
                    .await;
                info!("User {} online on {}", user_id, conn);

                match self.notifications.unread_for(user_id).await {
                    Ok(unread) => {
                        self.router
                            .send_to(conn, "notification:unread", json!({ "notifications": unread }))
                            .await;
                    }
                    Err(e) => warn!("Failed to load unread notifications for {}: {}", user_id, e),
                }
            }

            ClientMessage::ChatJoin { room_id } => {
                let room = RoomKey::Chat(required("roomId", &room_id)?.to_string());
                self.router.join(conn, room).await;
            }
            ClientMessage::ChatLeave { room_id } => {
                self.router.leave(conn, &RoomKey::Chat(room_id)).await;
            }
            ClientMessage::TaskChatJoin { task_id } => {
                let room = RoomKey::Task(required("taskId", &task_id)?.to_string());
                self.router.join(conn, room).await;
            }
            ClientMessage::TaskChatLeave { task_id } => {
                self.router.leave(conn, &RoomKey::Task(task_id)).await;
            }
            ClientMessage::ProjectJoin { project_id } => {
                let room = RoomKey::Project(required("projectId", &project_id)?.to_string());
                self.router.join(conn, room).await;
            }
            ClientMessage::ProjectLeave { project_id } => {
                self.router.leave(conn, &RoomKey::Project(project_id)).await;
            }

            ClientMessage::ChatMessage {
                room_id,
                content,
                sender,
            } => {
                self.chat
                    .send_message(&ChatTarget::Room(room_id), MessageDraft::new(&sender, &content))
                    .await?;
            }
            ClientMessage::TaskChatMessage {
                task_id,
                content,
                sender,
            } => {
                self.chat
                    .send_message(&ChatTarget::Task(task_id), MessageDraft::new(&sender, &content))
                    .await?;
            }
            ClientMessage::ChatbotMessage {
                room_id,
                content,
                sender,
            } => {
                self.chat
                    .send_message(
                        &ChatTarget::Room(room_id),
                        MessageDraft::for_chatbot(&sender, &content),
                    )
                    .await?;
            }

            ClientMessage::ChatMarkRead {
                room_id,
                message_ids,
                user_id,
            } => {
                self.chat
                    .mark_read(&ChatTarget::Room(room_id), &message_ids, &user_id, Some(conn))
                    .await?;
            }
            ClientMessage::TaskChatMarkRead {
                task_id,
                message_ids,
                user_id,
            } => {
                self.chat
                    .mark_read(&ChatTarget::Task(task_id), &message_ids, &user_id, Some(conn))
                    .await?;
            }

            ClientMessage::ChatTyping {
                room_id,
                user_id,
                is_typing,
            } => {
                let payload = json!({ "roomId": room_id, "userId": user_id, "isTyping": is_typing });
                self.router
                    .broadcast(&RoomKey::Chat(room_id), "chat:typing", payload, Some(conn))
                    .await;
            }
            ClientMessage::TaskChatTyping {
                task_id,
                user_id,
                is_typing,
            } => {
                let payload = json!({ "taskId": task_id, "userId": user_id, "isTyping": is_typing });
                self.router
                    .broadcast(&RoomKey::Task(task_id), "taskChat:typing", payload, Some(conn))
                    .await;
            }

            ClientMessage::ChatDirect {
                user_id,
                other_user_id,
            } => {
                let room = self.chat.get_or_create_direct_chat(&user_id, &other_user_id).await?;
                self.router.join(conn, RoomKey::Chat(room.room_id.clone())).await;
                self.router.send_to(conn, "chat:direct", json!({ "room": room })).await;
            }
            ClientMessage::ChatHistory { room_id } => {
                let user = session
                    .user
                    .as_deref()
                    .ok_or_else(|| Error::PermissionDenied("Login required".to_string()))?;
                let room = self.chat.history(&room_id, user).await?;
                self.router.send_to(conn, "chat:history", json!({ "room": room })).await;
            }
            ClientMessage::ChatRooms { user_id } => {
                let rooms = self.chat.rooms_for_user(required("userId", &user_id)?).await?;
                self.router.send_to(conn, "chat:rooms", json!({ "rooms": rooms })).await;
            }

            ClientMessage::NotificationSubscribe { channels } => {
                for channel in channels.into_iter().filter(|c| !c.is_empty()) {
                    self.router.join(conn, RoomKey::Notification(channel)).await;
                }
            }
            ClientMessage::NotificationUnsubscribe { channels } => {
                for channel in channels {
                    self.router.leave(conn, &RoomKey::Notification(channel)).await;
                }
            }
            ClientMessage::NotificationMarkRead {
                notification_id,
                user_id,
            } => {
                let user_id = required("userId", &user_id)?;
                let changed = self
                    .notifications
                    .mark_read(required("notificationId", &notification_id)?, user_id)
                    .await?;
                if changed {
                    let payload = json!({ "notificationId": notification_id, "userId": user_id });
                    self.router
                        .broadcast(&RoomKey::User(user_id.to_string()), "notification:read", payload, None)
                        .await;
                }
            }
            ClientMessage::NotificationMarkAllRead { user_id } => {
                let user_id = required("userId", &user_id)?;
                let count = self.notifications.mark_all_read(user_id).await?;
                let payload = json!({ "userId": user_id, "count": count });
                self.router
                    .broadcast(&RoomKey::User(user_id.to_string()), "notification:allRead", payload, None)
                    .await;
            }
        }
        Ok(())
    }
}

fn required<'a>(field: &str, value: &'a str) -> Result<&'a str> {
    let value = value.trim();
    if value.is_empty() {
        return Err(Error::ValidationFailed(format!("{field} is required")));
    }
    Ok(value)
}

fn with_server(server: Server) -> impl Filter<Extract = (Server,), Error = Infallible> + Clone {
    warp::any().map(move || server.clone())
}

/// `/ws` for sessions, `/health`, and `GET /notifications/<userId>` for
/// clients polling their unread notifications.
pub fn routes(server: Server) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    let ws_route = warp::path("ws")
        .and(warp::path::end())
        .and(warp::ws())
        .and(with_server(server.clone()))
        .map(|ws: warp::ws::Ws, server: Server| {
            ws.on_upgrade(move |socket| async move {
                server.handle_connection(socket).await;
            })
        });

    let health = warp::path("health")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_server(server.clone()))
        .and_then(health_check);

    let notifications = warp::path!("notifications" / String)
        .and(warp::get())
        .and(with_server(server))
        .and_then(unread_notifications);

    ws_route
        .or(health)
        .or(notifications)
        .with(warp::cors().allow_any_origin())
}

async fn health_check(server: Server) -> std::result::Result<impl Reply, Infallible> {
    Ok(warp::reply::json(&json!({
        "status": "ok",
        "connections": server.router.connection_count().await,
        "onlineUsers": server.presence.online_users().await.len(),
    })))
}

async fn unread_notifications(user_id: String, server: Server) -> std::result::Result<impl Reply, Infallible> {
    let reply = match server.notifications.unread_for(&user_id).await {
        Ok(unread) => warp::reply::with_status(
            warp::reply::json(&json!({ "notifications": unread })),
            StatusCode::OK,
        ),
        Err(e) => {
            warn!("Failed to load notifications for {}: {}", user_id, e);
            warp::reply::with_status(
                warp::reply::json(&json!({ "message": e.scope_message() })),
                StatusCode::INTERNAL_SERVER_ERROR,
            )
        }
    };
    Ok(reply)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::{AiResponder, AiStrategy, RuleBasedResponder};
    use crate::cache::MemoryCache;
    use crate::config::AiConfig;
    use crate::models::{ChatKind, ChatRoom, NotificationKind};
    use crate::notifications;
    use crate::store::{ChatStore, MemoryStore};

    struct Fixture {
        store: MemoryStore,
        server: Server,
        presence: PresenceRegistry,
        notifications: Arc<NotificationDispatcher>,
    }

    fn fixture() -> Fixture {
        let store = MemoryStore::new();
        let cache = Arc::new(MemoryCache::new());
        let router = RoomRouter::new();
        let presence = PresenceRegistry::new();
        let ai = Arc::new(AiResponder::with_strategy(
            AiStrategy::RuleBased(RuleBasedResponder),
            &AiConfig::default(),
            cache.clone(),
        ));
        let chat = Arc::new(MessagePipeline::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            cache,
            router.clone(),
            ai,
        ));
        let notifications = Arc::new(NotificationDispatcher::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            router.clone(),
            presence.clone(),
        ));
        Fixture {
            server: Server::new(presence.clone(), router, chat, notifications.clone()),
            store,
            presence,
            notifications,
        }
    }

    async fn connect(fx: &Fixture) -> (Session, mpsc::UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (fx.server.open_session(tx).await, rx)
    }

    async fn send(fx: &Fixture, session: &mut Session, frame: serde_json::Value) {
        fx.server.handle_text(session, &frame.to_string()).await;
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    #[tokio::test]
    async fn login_announces_presence_and_pushes_unread() {
        let fx = fixture();
        let draft = notifications::custom(NotificationKind::System, vec!["alice".into()], "Welcome", None);
        fx.notifications.create(draft.unwrap()).await.unwrap();

        let (mut bob, mut bob_rx) = connect(&fx).await;
        send(&fx, &mut bob, json!({ "event": "user:login", "data": { "userId": "bob" } })).await;
        drain(&mut bob_rx);

        let (mut alice, mut alice_rx) = connect(&fx).await;
        send(&fx, &mut alice, json!({ "event": "user:login", "data": { "userId": "alice" } })).await;

        assert!(fx.presence.is_online("alice").await);
        let to_bob = drain(&mut bob_rx);
        assert_eq!(to_bob.len(), 1);
        assert_eq!(to_bob[0].event, "user:online");
        assert_eq!(to_bob[0].data["userId"], "alice");

        let to_alice = drain(&mut alice_rx);
        assert_eq!(to_alice.len(), 1);
        assert_eq!(to_alice[0].event, "notification:unread");
        assert_eq!(to_alice[0].data["notifications"][0]["content"], "Welcome");
    }

    #[tokio::test]
    async fn disconnect_announces_offline_once() {
        let fx = fixture();
        let (mut watcher, mut watcher_rx) = connect(&fx).await;
        send(&fx, &mut watcher, json!({ "event": "user:login", "data": { "userId": "carol" } })).await;

        let (mut first, _first_rx) = connect(&fx).await;
        send(&fx, &mut first, json!({ "event": "user:login", "data": { "userId": "alice" } })).await;
        let (mut second, _second_rx) = connect(&fx).await;
        send(&fx, &mut second, json!({ "event": "user:login", "data": { "userId": "alice" } })).await;
        drain(&mut watcher_rx);

        fx.server.close_session(first).await;
        assert!(fx.presence.is_online("alice").await);
        assert!(drain(&mut watcher_rx).is_empty());

        fx.server.close_session(second).await;
        assert!(!fx.presence.is_online("alice").await);
        let frames = drain(&mut watcher_rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event, "user:offline");
    }

    #[tokio::test]
    async fn bad_frames_and_failures_answer_only_the_sender() {
        let fx = fixture();
        fx.store
            .insert_chat(ChatRoom::new("g1".into(), ChatKind::Group, vec!["alice".into(), "bob".into()]))
            .await
            .unwrap();
        let (mut alice, mut alice_rx) = connect(&fx).await;
        let (mut bob, mut bob_rx) = connect(&fx).await;
        send(&fx, &mut bob, json!({ "event": "chat:join", "data": { "roomId": "g1" } })).await;

        fx.server.handle_text(&mut alice, "not json").await;
        let frames = drain(&mut alice_rx);
        assert_eq!(frames[0].event, "error");

        send(
            &fx,
            &mut alice,
            json!({ "event": "chat:message", "data": { "roomId": "g1", "content": "", "sender": "alice" } }),
        )
        .await;
        let frames = drain(&mut alice_rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event, "chat:error");
        assert_eq!(frames[0].data["message"], "Message content cannot be empty");
        assert!(drain(&mut bob_rx).is_empty());

        send(
            &fx,
            &mut alice,
            json!({ "event": "chat:message", "data": { "roomId": "g1", "content": "hi", "sender": "alice" } }),
        )
        .await;
        let frames = drain(&mut bob_rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event, "chat:message");
    }

    #[tokio::test]
    async fn typing_is_relayed_to_others_only() {
        let fx = fixture();
        let (mut alice, mut alice_rx) = connect(&fx).await;
        let (mut bob, mut bob_rx) = connect(&fx).await;
        for session in [&mut alice, &mut bob] {
            send(&fx, session, json!({ "event": "taskChat:join", "data": { "taskId": "t1" } })).await;
        }
        send(
            &fx,
            &mut alice,
            json!({ "event": "taskChat:typing", "data": { "taskId": "t1", "userId": "alice", "isTyping": true } }),
        )
        .await;

        assert!(drain(&mut alice_rx).is_empty());
        let frames = drain(&mut bob_rx);
        assert_eq!(frames[0].event, "taskChat:typing");
        assert_eq!(frames[0].data["isTyping"], true);
    }

    #[tokio::test]
    async fn direct_chat_joins_and_replies_with_room() {
        let fx = fixture();
        let (mut alice, mut alice_rx) = connect(&fx).await;
        send(&fx, &mut alice, json!({ "event": "user:login", "data": { "userId": "alice" } })).await;
        drain(&mut alice_rx);

        send(
            &fx,
            &mut alice,
            json!({ "event": "chat:direct", "data": { "userId": "alice", "otherUserId": "bob" } }),
        )
        .await;
        let frames = drain(&mut alice_rx);
        assert_eq!(frames[0].event, "chat:direct");
        let room_id = frames[0].data["room"]["roomId"].as_str().unwrap().to_string();

        send(&fx, &mut alice, json!({ "event": "chat:history", "data": { "roomId": room_id } })).await;
        let frames = drain(&mut alice_rx);
        assert_eq!(frames[0].event, "chat:history");
        assert_eq!(frames[0].data["room"]["type"], "direct");
    }

    #[tokio::test]
    async fn history_requires_login() {
        let fx = fixture();
        let (mut anon, mut rx) = connect(&fx).await;
        send(&fx, &mut anon, json!({ "event": "chat:history", "data": { "roomId": "g1" } })).await;
        let frames = drain(&mut rx);
        assert_eq!(frames[0].event, "chat:error");
    }

    #[tokio::test]
    async fn mark_all_read_reports_count_to_user_room() {
        let fx = fixture();
        for text in ["one", "two"] {
            let draft = notifications::custom(NotificationKind::System, vec!["alice".into()], text, None);
            fx.notifications.create(draft.unwrap()).await.unwrap();
        }
        let (mut alice, mut rx) = connect(&fx).await;
        send(&fx, &mut alice, json!({ "event": "user:login", "data": { "userId": "alice" } })).await;
        drain(&mut rx);

        send(&fx, &mut alice, json!({ "event": "notification:markAllRead", "data": { "userId": "alice" } })).await;
        let frames = drain(&mut rx);
        assert_eq!(frames[0].event, "notification:allRead");
        assert_eq!(frames[0].data["count"], 2);
        assert!(fx.notifications.unread_for("alice").await.unwrap().is_empty());
    }
}
