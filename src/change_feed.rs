//! Turns store mutations into room broadcasts and notifications.
//!
//! One watch loop runs per collection. A loop that loses its stream waits
//! `retry_delay` and subscribes again, without limit, until [`ChangeFeedWatcher::close`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use log::{debug, error, info, warn};
use serde_json::{json, Value};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::models::{ChangeEvent, Collection, OperationType, Project, Task};
use crate::notifications::NotificationDispatcher;
use crate::room::{RoomKey, RoomRouter};
use crate::store::ChangeFeed;

pub const WATCHED: [Collection; 2] = [Collection::Tasks, Collection::Projects];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    Stopped,
    Starting,
    Watching,
    Error,
    Resubscribing,
}

enum StreamEnd {
    Shutdown,
    Unsupported,
    Failed(Error),
}

struct Inner {
    feed: Arc<dyn ChangeFeed>,
    router: RoomRouter,
    notifications: Arc<NotificationDispatcher>,
    retry_delay: Duration,
    states: RwLock<HashMap<Collection, WatchState>>,
    shutdown: watch::Sender<bool>,
}

#[derive(Clone)]
pub struct ChangeFeedWatcher {
    inner: Arc<Inner>,
    handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl ChangeFeedWatcher {
    pub fn new(
        feed: Arc<dyn ChangeFeed>,
        router: RoomRouter,
        notifications: Arc<NotificationDispatcher>,
        retry_delay: Duration,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        ChangeFeedWatcher {
            inner: Arc::new(Inner {
                feed,
                router,
                notifications,
                retry_delay,
                states: RwLock::new(HashMap::new()),
                shutdown,
            }),
            handles: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Spawns a watch loop for each collection. Fails without spawning
    /// anything when the store has no change feed.
    pub async fn start(&self) -> Result<()> {
        let mut handles = self.handles.lock().await;
        if !handles.is_empty() {
            debug!("Change-feed watcher already running");
            return Ok(());
        }
        if *self.inner.shutdown.borrow() {
            return Err(Error::StreamFailure("Change-feed watcher is closed".to_string()));
        }
        if !self.inner.feed.supports_change_feed().await? {
            error!("Store does not support change feeds; real-time entity events are disabled");
            for collection in WATCHED {
                self.inner.set_state(collection, WatchState::Stopped).await;
            }
            return Err(Error::StreamFailure("Change feed not supported".to_string()));
        }

        for collection in WATCHED {
            let inner = self.inner.clone();
            let shutdown = self.inner.shutdown.subscribe();
            handles.push(tokio::spawn(async move {
                inner.run(collection, shutdown).await;
            }));
        }
        info!("Change-feed watcher started for {} collections", WATCHED.len());
        Ok(())
    }

    pub async fn state(&self, collection: Collection) -> WatchState {
        self.inner
            .states
            .read()
            .await
            .get(&collection)
            .copied()
            .unwrap_or(WatchState::Stopped)
    }

    /// Stops both loops and waits for them. Calling it again does nothing.
    pub async fn close(&self) {
        let was_closed = self.inner.shutdown.send_replace(true);
        let handles: Vec<JoinHandle<()>> = self.handles.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Change-feed loop ended abnormally: {}", e);
            }
        }
        for collection in WATCHED {
            self.inner.set_state(collection, WatchState::Stopped).await;
        }
        if !was_closed {
            info!("Change-feed watcher closed");
        }
    }
}

impl Inner {
    async fn set_state(&self, collection: Collection, state: WatchState) {
        self.states.write().await.insert(collection, state);
    }

    async fn run(&self, collection: Collection, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            self.set_state(collection, WatchState::Starting).await;
            match self.watch_once(collection, &mut shutdown).await {
                StreamEnd::Shutdown => break,
                StreamEnd::Unsupported => {
                    error!("Change feed for {:?} is no longer supported, giving up", collection);
                    break;
                }
                StreamEnd::Failed(e) => {
                    self.set_state(collection, WatchState::Error).await;
                    warn!(
                        "Change stream for {:?} failed: {}; resubscribing in {:?}",
                        collection, e, self.retry_delay
                    );
                    self.set_state(collection, WatchState::Resubscribing).await;
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        () = tokio::time::sleep(self.retry_delay) => {}
                    }
                }
            }
        }
        self.set_state(collection, WatchState::Stopped).await;
        debug!("Change-feed loop for {:?} stopped", collection);
    }

    async fn watch_once(&self, collection: Collection, shutdown: &mut watch::Receiver<bool>) -> StreamEnd {
        match self.feed.supports_change_feed().await {
            Ok(true) => {}
            Ok(false) => return StreamEnd::Unsupported,
            Err(e) => return StreamEnd::Failed(e),
        }
        let mut stream = match self.feed.watch(collection).await {
            Ok(stream) => stream,
            Err(e) => return StreamEnd::Failed(e),
        };
        self.set_state(collection, WatchState::Watching).await;
        info!("Watching {:?} for changes", collection);

        loop {
            tokio::select! {
                _ = shutdown.changed() => return StreamEnd::Shutdown,
                item = stream.next() => match item {
                    Some(Ok(event)) => self.dispatch(event).await,
                    Some(Err(e)) => return StreamEnd::Failed(e),
                    None => {
                        return StreamEnd::Failed(Error::StreamFailure("Change stream ended".to_string()))
                    }
                },
            }
        }
    }

    async fn dispatch(&self, event: ChangeEvent) {
        debug!(
            "{:?} {:?} {}",
            event.collection, event.operation_type, event.document_id
        );
        let result = match event.collection {
            Collection::Tasks => self.on_task(&event).await,
            Collection::Projects => self.on_project(&event).await,
        };
        if let Err(e) = result {
            warn!(
                "Failed to handle {:?} change for {}: {}",
                event.collection, event.document_id, e
            );
        }
    }

    async fn on_task(&self, event: &ChangeEvent) -> Result<()> {
        if event.operation_type == OperationType::Delete {
            self.announce_delete(event).await;
            return Ok(());
        }
        let (task, document) = decode::<Task>(event)?;
        let project_room = task.project.clone().map(RoomKey::Project);

        match event.operation_type {
            OperationType::Insert => {
                let room = project_room.unwrap_or_else(|| RoomKey::Task(task.id.clone()));
                self.router.broadcast(&room, "task:created", document, None).await;
                self.notifications.notify_task_created(&task).await?;
            }
            _ => {
                let task_room = RoomKey::Task(task.id.clone());
                self.router
                    .broadcast(&task_room, "task:updated", document.clone(), None)
                    .await;
                if let Some(room) = project_room {
                    self.router.broadcast(&room, "task:updated", document, None).await;
                }
                if event.touches("status") {
                    if let Err(e) = self.notifications.notify_status_changed(&task).await {
                        warn!("Status notification for task {} failed: {}", task.id, e);
                    }
                }
                if event.touches("assignedTo") && task.assigned_to.is_some() {
                    if let Err(e) = self.notifications.notify_assignment_changed(&task).await {
                        warn!("Assignment notification for task {} failed: {}", task.id, e);
                    }
                }
            }
        }
        Ok(())
    }

    async fn on_project(&self, event: &ChangeEvent) -> Result<()> {
        if event.operation_type == OperationType::Delete {
            self.announce_delete(event).await;
            return Ok(());
        }
        let (project, document) = decode::<Project>(event)?;
        let room = RoomKey::Project(project.id.clone());

        if event.operation_type == OperationType::Insert {
            self.router.broadcast(&room, "project:created", document, None).await;
            self.notifications.notify_project_created(&project).await?;
        } else {
            self.router.broadcast(&room, "project:updated", document, None).await;
        }
        Ok(())
    }

    /// Deletes carry only the id, so the owning aggregate is unknown and
    /// the event goes to every connection.
    async fn announce_delete(&self, event: &ChangeEvent) {
        let name = format!("{}:deleted", event.collection.entity());
        self.router
            .broadcast_all(&name, json!({ "id": event.document_id }), None)
            .await;
    }
}

fn decode<T: serde::de::DeserializeOwned>(event: &ChangeEvent) -> Result<(T, Value)> {
    let document = event.full_document.clone().ok_or_else(|| {
        Error::StreamFailure(format!("{:?} event without document", event.operation_type))
    })?;
    let entity = serde_json::from_value(document.clone())?;
    Ok((entity, document))
}
