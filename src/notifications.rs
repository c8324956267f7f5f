use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};
use serde_json::json;

use crate::error::Result;
use crate::models::{Notification, NotificationDraft, NotificationKind, Project, Task};
use crate::presence::PresenceRegistry;
use crate::room::{RoomKey, RoomRouter};
use crate::store::{NotificationStore, TaskStore};

/// How far ahead the due-date check looks.
pub const DUE_HORIZON_HOURS: i64 = 48;
/// A task+recipient pair is not re-notified within this many hours.
pub const DEDUP_WINDOW_HOURS: i64 = 12;

/// Assignee plus project members, minus whoever caused the change.
fn task_audience(task: &Task, project: Option<&Project>, actor: Option<&str>) -> Vec<String> {
    let mut recipients: Vec<String> = Vec::new();
    let candidates = task
        .assigned_to
        .iter()
        .chain(project.into_iter().flat_map(|p| p.members.iter()));
    for user in candidates {
        if Some(user.as_str()) != actor && !recipients.contains(user) {
            recipients.push(user.clone());
        }
    }
    recipients
}

fn task_draft(
    task: &Task,
    recipients: Vec<String>,
    actor: Option<&str>,
    content: String,
) -> Option<NotificationDraft> {
    if recipients.is_empty() {
        return None;
    }
    let mut draft = NotificationDraft::new(NotificationKind::Task, recipients, content);
    draft.sender = actor.map(str::to_string);
    draft.related_task = Some(task.id.clone());
    draft.related_project.clone_from(&task.project);
    Some(draft)
}

pub fn task_created(task: &Task, project: Option<&Project>, actor: Option<&str>) -> Option<NotificationDraft> {
    let content = match project {
        Some(project) => format!("New task \"{}\" created in {}", task.title, project.name),
        None => format!("New task \"{}\" created", task.title),
    };
    task_draft(task, task_audience(task, project, actor), actor, content)
}

pub fn status_changed(task: &Task, project: Option<&Project>, actor: Option<&str>) -> Option<NotificationDraft> {
    let content = format!("Task \"{}\" is now {}", task.title, task.status.label());
    let mut draft = task_draft(task, task_audience(task, project, actor), actor, content)?;
    draft.metadata = json!({ "status": task.status });
    Some(draft)
}

/// Only the new assignee hears about an assignment.
pub fn assignment_changed(task: &Task, actor: Option<&str>) -> Option<NotificationDraft> {
    let assignee = task.assigned_to.as_deref().filter(|a| Some(*a) != actor)?;
    let content = format!("You have been assigned to task \"{}\"", task.title);
    task_draft(task, vec![assignee.to_string()], actor, content)
}

pub fn deadline_message(title: &str, hours_remaining: f64) -> String {
    if hours_remaining <= 2.0 {
        format!("URGENT: Task \"{title}\" is due in less than 2 hours!")
    } else if hours_remaining <= 24.0 {
        format!("Reminder: Task \"{title}\" is due tomorrow")
    } else {
        #[allow(clippy::cast_possible_truncation)]
        let days = (hours_remaining / 24.0).ceil() as i64;
        format!("Task \"{title}\" is due in {days} days")
    }
}

pub fn deadline_approaching(task: &Task, hours_remaining: f64) -> Option<NotificationDraft> {
    let assignee = task.assigned_to.clone()?;
    let mut draft = NotificationDraft::new(
        NotificationKind::Deadline,
        vec![assignee],
        deadline_message(&task.title, hours_remaining),
    );
    draft.related_task = Some(task.id.clone());
    draft.related_project.clone_from(&task.project);
    draft.metadata = json!({
        "dueDate": task.due_date,
        "hoursRemaining": (hours_remaining * 10.0).round() / 10.0,
    });
    Some(draft)
}

pub fn project_created(project: &Project, actor: Option<&str>) -> Option<NotificationDraft> {
    let actor = actor.or(Some(project.owner.as_str()));
    let recipients: Vec<String> = project
        .members
        .iter()
        .filter(|m| Some(m.as_str()) != actor)
        .cloned()
        .collect();
    if recipients.is_empty() {
        return None;
    }
    let mut draft = NotificationDraft::new(
        NotificationKind::Project,
        recipients,
        format!("You have been added to project \"{}\"", project.name),
    );
    draft.sender = actor.map(str::to_string);
    draft.related_project = Some(project.id.clone());
    Some(draft)
}

pub fn custom(
    kind: NotificationKind,
    recipients: Vec<String>,
    content: &str,
    sender: Option<&str>,
) -> Option<NotificationDraft> {
    if recipients.is_empty() || content.trim().is_empty() {
        return None;
    }
    let mut draft = NotificationDraft::new(kind, recipients, content.trim());
    draft.sender = sender.map(str::to_string);
    Some(draft)
}

/// Persists notifications and pushes them to recipients who are online.
/// Offline recipients pick them up through `unread_for` on next login.
pub struct NotificationDispatcher {
    store: Arc<dyn NotificationStore>,
    tasks: Arc<dyn TaskStore>,
    router: RoomRouter,
    presence: PresenceRegistry,
}

impl NotificationDispatcher {
    pub fn new(
        store: Arc<dyn NotificationStore>,
        tasks: Arc<dyn TaskStore>,
        router: RoomRouter,
        presence: PresenceRegistry,
    ) -> Self {
        NotificationDispatcher {
            store,
            tasks,
            router,
            presence,
        }
    }

    /// `None` when the draft resolves to nobody; nothing is stored then.
    pub async fn create(&self, draft: NotificationDraft) -> Result<Option<Notification>> {
        self.create_at(draft, Utc::now()).await
    }

    async fn create_at(&self, mut draft: NotificationDraft, now: DateTime<Utc>) -> Result<Option<Notification>> {
        let mut recipients: Vec<String> = Vec::with_capacity(draft.recipients.len());
        for recipient in draft.recipients.drain(..) {
            if !recipient.is_empty() && !recipients.contains(&recipient) {
                recipients.push(recipient);
            }
        }
        if recipients.is_empty() {
            debug!("Skipping {:?} notification with no recipients", draft.kind);
            return Ok(None);
        }
        draft.recipients = recipients;

        let notification = self
            .store
            .insert_notification(Notification::from_draft(draft, now))
            .await?;

        let payload = serde_json::to_value(&notification)?;
        let mut delivered = 0;
        for recipient in &notification.recipients {
            if !self.presence.is_online(recipient).await {
                continue;
            }
            let room = RoomKey::User(recipient.clone());
            delivered += self
                .router
                .broadcast(&room, "notification:new", payload.clone(), None)
                .await;
        }
        debug!(
            "Notification {} stored for {} recipients, {} live deliveries",
            notification.id,
            notification.recipients.len(),
            delivered
        );
        Ok(Some(notification))
    }

    pub async fn mark_read(&self, notification_id: &str, user_id: &str) -> Result<bool> {
        self.store.mark_notification_read(notification_id, user_id).await
    }

    pub async fn mark_all_read(&self, user_id: &str) -> Result<usize> {
        self.store.mark_all_notifications_read(user_id).await
    }

    pub async fn unread_for(&self, user_id: &str) -> Result<Vec<Notification>> {
        self.store.unread_notifications(user_id).await
    }

    async fn project_of(&self, task: &Task) -> Option<Project> {
        let project_id = task.project.as_deref()?;
        match self.tasks.find_project(project_id).await {
            Ok(project) => project,
            Err(e) => {
                warn!("Failed to load project {} for task {}: {}", project_id, task.id, e);
                None
            }
        }
    }

    pub async fn notify_task_created(&self, task: &Task) -> Result<Option<Notification>> {
        let project = self.project_of(task).await;
        let actor = task.updated_by.as_deref().or(Some(task.created_by.as_str()));
        match task_created(task, project.as_ref(), actor) {
            Some(draft) => self.create(draft).await,
            None => Ok(None),
        }
    }

    pub async fn notify_status_changed(&self, task: &Task) -> Result<Option<Notification>> {
        let project = self.project_of(task).await;
        match status_changed(task, project.as_ref(), task.updated_by.as_deref()) {
            Some(draft) => self.create(draft).await,
            None => Ok(None),
        }
    }

    pub async fn notify_assignment_changed(&self, task: &Task) -> Result<Option<Notification>> {
        match assignment_changed(task, task.updated_by.as_deref()) {
            Some(draft) => self.create(draft).await,
            None => Ok(None),
        }
    }

    pub async fn notify_project_created(&self, project: &Project) -> Result<Option<Notification>> {
        match project_created(project, project.updated_by.as_deref()) {
            Some(draft) => self.create(draft).await,
            None => Ok(None),
        }
    }

    pub async fn check_due_date_notifications(&self) -> Result<usize> {
        self.check_due_date_notifications_at(Utc::now()).await
    }

    /// Warns assignees of open tasks due within two days. A task+recipient
    /// notified in the last twelve hours is skipped; this is clock-based, so
    /// an occasional repeat is possible.
    pub async fn check_due_date_notifications_at(&self, now: DateTime<Utc>) -> Result<usize> {
        let tasks = self.tasks.tasks_due_between(now, now + Duration::hours(DUE_HORIZON_HOURS)).await?;
        let mut created = 0;
        for task in tasks.into_iter().filter(|t| !t.status.is_terminal()) {
            let (Some(due), Some(assignee)) = (task.due_date, task.assigned_to.as_deref()) else {
                continue;
            };
            if self
                .store
                .recent_notification_exists(NotificationKind::Deadline, &task.id, assignee, now - Duration::hours(DEDUP_WINDOW_HOURS))
                .await?
            {
                continue;
            }
            #[allow(clippy::cast_precision_loss)]
            let hours_remaining = (due - now).num_minutes() as f64 / 60.0;
            if let Some(draft) = deadline_approaching(&task, hours_remaining) {
                if self.create_at(draft, now).await?.is_some() {
                    created += 1;
                }
            }
        }
        if created > 0 {
            info!("Created {} deadline notifications", created);
        }
        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TaskStatus;
    use crate::store::MemoryStore;
    use tokio::sync::mpsc;

    fn task(id: &str) -> Task {
        Task {
            id: id.to_string(),
            title: "Release notes".to_string(),
            status: TaskStatus::InProgress,
            project: Some("p1".to_string()),
            assigned_to: Some("bob".to_string()),
            created_by: "alice".to_string(),
            updated_by: None,
            due_date: None,
        }
    }

    fn project() -> Project {
        Project {
            id: "p1".to_string(),
            name: "Launch".to_string(),
            owner: "alice".to_string(),
            members: vec!["alice".to_string(), "bob".to_string(), "carol".to_string()],
            updated_by: None,
        }
    }

    fn dispatcher(store: &MemoryStore) -> (NotificationDispatcher, RoomRouter, PresenceRegistry) {
        let router = RoomRouter::new();
        let presence = PresenceRegistry::new();
        let dispatcher = NotificationDispatcher::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            router.clone(),
            presence.clone(),
        );
        (dispatcher, router, presence)
    }

    #[test]
    fn audience_excludes_actor_and_duplicates() {
        let recipients = task_audience(&task("t"), Some(&project()), Some("alice"));
        assert_eq!(recipients, vec!["bob".to_string(), "carol".to_string()]);
    }

    #[test]
    fn builders_never_produce_empty_fanout() {
        let mut lonely = task("t");
        lonely.project = None;
        lonely.assigned_to = Some("alice".to_string());
        assert!(task_created(&lonely, None, Some("alice")).is_none());
        assert!(assignment_changed(&lonely, Some("alice")).is_none());
        assert!(custom(NotificationKind::System, vec![], "hi", None).is_none());

        let solo = Project {
            members: vec!["alice".to_string()],
            ..project()
        };
        assert!(project_created(&solo, None).is_none());
    }

    #[test]
    fn deadline_severity() {
        assert!(deadline_message("x", 1.5).starts_with("URGENT"));
        assert!(deadline_message("x", 20.0).contains("tomorrow"));
        assert!(deadline_message("x", 30.0).contains("in 2 days"));
    }

    #[tokio::test]
    async fn online_recipient_gets_push_offline_does_not() {
        let store = MemoryStore::new();
        let (dispatcher, router, presence) = dispatcher(&store);

        let (tx, mut rx) = mpsc::unbounded_channel();
        router.connect("conn-a", tx).await;
        router.join("conn-a", RoomKey::User("a".into())).await;
        presence.register("a", "conn-a").await;

        let draft = NotificationDraft::new(
            NotificationKind::System,
            vec!["a".into(), "b".into()],
            "Maintenance tonight",
        );
        let created = dispatcher.create(draft).await.unwrap().unwrap();

        let pushed = rx.recv().await.unwrap();
        assert_eq!(pushed.event, "notification:new");
        assert_eq!(pushed.data["id"], created.id.as_str());

        let stored = store.notifications().await;
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].recipients, vec!["a".to_string(), "b".to_string()]);
        assert!(stored[0].read.is_empty());
        assert_eq!(dispatcher.unread_for("b").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn empty_recipients_is_a_noop() {
        let store = MemoryStore::new();
        let (dispatcher, _, _) = dispatcher(&store);
        let draft = NotificationDraft::new(NotificationKind::Chat, vec![String::new()], "x");
        assert!(dispatcher.create(draft).await.unwrap().is_none());
        assert!(store.notifications().await.is_empty());
    }

    #[tokio::test]
    async fn mark_read_is_idempotent() {
        let store = MemoryStore::new();
        let (dispatcher, _, _) = dispatcher(&store);
        let draft = NotificationDraft::new(NotificationKind::Mention, vec!["a".into(), "b".into()], "x");
        let created = dispatcher.create(draft).await.unwrap().unwrap();

        assert!(dispatcher.mark_read(&created.id, "a").await.unwrap());
        assert!(!dispatcher.mark_read(&created.id, "a").await.unwrap());
        assert_eq!(store.notifications().await[0].read, vec!["a".to_string()]);
        assert!(dispatcher.mark_read("missing", "a").await.is_err());

        assert_eq!(dispatcher.mark_all_read("b").await.unwrap(), 1);
        assert_eq!(dispatcher.mark_all_read("b").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn due_date_check_dedups_within_window() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let mut due = task("t1");
        due.due_date = Some(now + Duration::hours(30));
        store.insert_task(due).await.unwrap();
        let (dispatcher, _, _) = dispatcher(&store);

        assert_eq!(dispatcher.check_due_date_notifications_at(now).await.unwrap(), 1);
        assert_eq!(
            dispatcher
                .check_due_date_notifications_at(now + Duration::hours(6))
                .await
                .unwrap(),
            0
        );
        let stored = store.notifications().await;
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].kind, NotificationKind::Deadline);
        assert!(stored[0].content.contains("in 2 days"));

        // past the dedup window the reminder comes again, now more urgent
        assert_eq!(
            dispatcher
                .check_due_date_notifications_at(now + Duration::hours(13))
                .await
                .unwrap(),
            1
        );
        assert!(store.notifications().await[1].content.contains("tomorrow"));
    }

    #[tokio::test]
    async fn due_date_check_ignores_terminal_and_unassigned() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let mut done = task("done");
        done.status = TaskStatus::Completed;
        done.due_date = Some(now + Duration::hours(1));
        let mut unassigned = task("unassigned");
        unassigned.assigned_to = None;
        unassigned.due_date = Some(now + Duration::hours(1));
        store.insert_task(done).await.unwrap();
        store.insert_task(unassigned).await.unwrap();
        let (dispatcher, _, _) = dispatcher(&store);

        assert_eq!(dispatcher.check_due_date_notifications_at(now).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn task_created_uses_project_members() {
        let store = MemoryStore::new();
        store.insert_project(project()).await.unwrap();
        let (dispatcher, _, _) = dispatcher(&store);

        let created = dispatcher.notify_task_created(&task("t1")).await.unwrap().unwrap();
        assert_eq!(created.recipients, vec!["bob".to_string(), "carol".to_string()]);
        assert_eq!(created.sender.as_deref(), Some("alice"));
        assert_eq!(created.related_project.as_deref(), Some("p1"));
    }
}
