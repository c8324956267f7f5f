use std::sync::Arc;
use std::time::Duration;

use log::{error, info};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::ai::AiResponder;
use crate::cache::MemoryCache;
use crate::change_feed::ChangeFeedWatcher;
use crate::chat::MessagePipeline;
use crate::config::Config;
use crate::notifications::NotificationDispatcher;
use crate::presence::PresenceRegistry;
use crate::room::RoomRouter;
use crate::server::Server;
use crate::store::MemoryStore;
use crate::sweep::{self, DeadlineSweep};

const CACHE_PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// Every component, wired once at startup.
pub struct App {
    pub config: Config,
    pub store: MemoryStore,
    pub cache: Arc<MemoryCache>,
    pub router: RoomRouter,
    pub presence: PresenceRegistry,
    pub notifications: Arc<NotificationDispatcher>,
    pub chat: Arc<MessagePipeline>,
    pub watcher: ChangeFeedWatcher,
    pub sweep: Arc<DeadlineSweep>,
    stop: watch::Sender<bool>,
}

impl App {
    pub fn new(config: Config, store: MemoryStore) -> Self {
        let cache = Arc::new(MemoryCache::new());
        let router = RoomRouter::new();
        let presence = PresenceRegistry::new();

        let ai = Arc::new(AiResponder::new(&config.ai, cache.clone()));
        let chat = Arc::new(MessagePipeline::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            cache.clone(),
            router.clone(),
            ai,
        ));
        let notifications = Arc::new(NotificationDispatcher::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            router.clone(),
            presence.clone(),
        ));
        let watcher = ChangeFeedWatcher::new(
            Arc::new(store.clone()),
            router.clone(),
            notifications.clone(),
            config.watch_retry_delay,
        );
        let sweep = Arc::new(DeadlineSweep::new(
            Arc::new(store.clone()),
            router.clone(),
            config.sweep_window,
        ));
        let (stop, _) = watch::channel(false);

        App {
            config,
            store,
            cache,
            router,
            presence,
            notifications,
            chat,
            watcher,
            sweep,
            stop,
        }
    }

    pub fn server(&self) -> Server {
        Server::new(
            self.presence.clone(),
            self.router.clone(),
            self.chat.clone(),
            self.notifications.clone(),
        )
    }

    /// Starts the change-feed watcher and the periodic jobs. A store
    /// without change feeds is logged and the rest keeps running.
    pub async fn start_background(&self) -> Vec<JoinHandle<()>> {
        if let Err(e) = self.watcher.start().await {
            error!("Change-feed watcher not started: {}", e);
        }

        let mut handles = vec![
            sweep::spawn_deadline_sweep(
                self.sweep.clone(),
                self.config.sweep_interval,
                self.stop.subscribe(),
            ),
            sweep::spawn_due_date_checks(
                self.notifications.clone(),
                self.config.due_check_interval,
                self.stop.subscribe(),
            ),
        ];

        let cache = self.cache.clone();
        let mut shutdown = self.stop.subscribe();
        handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    () = tokio::time::sleep(CACHE_PURGE_INTERVAL) => cache.purge_expired().await,
                }
            }
        }));
        handles
    }

    pub async fn shutdown(&self, handles: Vec<JoinHandle<()>>) {
        self.stop.send_replace(true);
        self.watcher.close().await;
        for handle in handles {
            let _ = handle.await;
        }
        info!("Background jobs stopped");
    }
}
