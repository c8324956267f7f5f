use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::models::TaskStatus;
use crate::notifications::NotificationDispatcher;
use crate::room::RoomRouter;
use crate::store::TaskStore;

/// Global `deadlineWarning` broadcast for assigned, non-completed tasks
/// falling due inside the look-ahead window. Runs are not deduplicated; a task stays
/// in the window for several runs and is announced on each.
pub struct DeadlineSweep {
    tasks: Arc<dyn TaskStore>,
    router: RoomRouter,
    window: chrono::Duration,
}

impl DeadlineSweep {
    pub fn new(tasks: Arc<dyn TaskStore>, router: RoomRouter, window: chrono::Duration) -> Self {
        DeadlineSweep { tasks, router, window }
    }

    pub async fn run_once(&self) -> Result<usize> {
        self.run_once_at(Utc::now()).await
    }

    /// Returns the number of warnings emitted.
    pub async fn run_once_at(&self, now: DateTime<Utc>) -> Result<usize> {
        let due = self.tasks.tasks_due_between(now, now + self.window).await?;
        let mut warned = 0;
        for task in due.into_iter().filter(|t| t.status != TaskStatus::Completed) {
            let Some(assignee) = task.assigned_to.as_deref() else {
                continue;
            };
            let payload = json!({
                "taskId": task.id,
                "title": task.title,
                "dueDate": task.due_date,
                "assignedTo": assignee,
            });
            self.router.broadcast_all("deadlineWarning", payload, None).await;
            warned += 1;
        }
        if warned > 0 {
            info!("Deadline sweep warned about {} tasks", warned);
        }
        Ok(warned)
    }
}

/// Runs `job` every `every` until `shutdown` flips. The first run happens
/// one interval after start.
fn spawn_periodic<F, Fut>(
    name: &'static str,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
    job: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = Result<usize>> + Send + 'static,
{
    tokio::spawn(async move {
        debug!("{} scheduled every {:?}", name, every);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                () = tokio::time::sleep(every) => {}
            }
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = job().await {
                warn!("{} failed: {}", name, e);
            }
        }
        debug!("{} stopped", name);
    })
}

pub fn spawn_deadline_sweep(
    sweep: Arc<DeadlineSweep>,
    every: Duration,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    spawn_periodic("Deadline sweep", every, shutdown, move || {
        let sweep = sweep.clone();
        async move { sweep.run_once().await }
    })
}

pub fn spawn_due_date_checks(
    dispatcher: Arc<NotificationDispatcher>,
    every: Duration,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    spawn_periodic("Due-date check", every, shutdown, move || {
        let dispatcher = dispatcher.clone();
        async move { dispatcher.check_due_date_notifications().await }
    })
}
