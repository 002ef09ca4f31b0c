//! Task State Container: the current user's tasks, in memory.
//!
//! Every mutation goes to the store first; local state changes only after
//! the store confirms it.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, error, info, instrument};

use crate::error::StoreError;
use crate::reminder::{Reminder, ReminderHandle, ReminderScheduler};
use crate::session::SessionUser;
use crate::store::TaskStore;
use crate::task::{Task, TaskDraft, TaskId, TaskPatch};

pub struct TaskState {
    store: Arc<dyn TaskStore>,
    scheduler: ReminderScheduler,
    user: Option<SessionUser>,
    tasks: Vec<Task>,
    loading: bool,
    reminders: HashMap<TaskId, ReminderHandle>,
}

impl TaskState {
    pub fn new(store: Arc<dyn TaskStore>, scheduler: ReminderScheduler) -> Self {
        Self {
            store,
            scheduler,
            user: None,
            tasks: Vec::new(),
            loading: false,
            reminders: HashMap::new(),
        }
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    pub fn user(&self) -> Option<&SessionUser> {
        self.user.as_ref()
    }

    pub fn scheduler(&self) -> &ReminderScheduler {
        &self.scheduler
    }

    pub fn find(&self, id: TaskId) -> Option<&Task> {
        self.tasks.iter().find(|task| task.id == id)
    }

    pub fn reminder_for(&self, id: TaskId) -> Option<&ReminderHandle> {
        self.reminders.get(&id)
    }

    /// Re-initializes for a new identity: prior tasks and tracked reminder
    /// handles are dropped, then the new user's tasks are loaded. Already
    /// armed reminders are left alone.
    #[instrument(skip(self, user), fields(user_id = ?user.as_ref().map(|u| u.id)))]
    pub async fn on_user_changed(&mut self, user: Option<SessionUser>) -> Result<(), StoreError> {
        if self.user.as_ref().map(|u| u.id) == user.as_ref().map(|u| u.id) {
            self.user = user;
            return Ok(());
        }

        info!("authenticated user changed; resetting task state");
        self.tasks.clear();
        self.reminders.clear();
        self.loading = false;
        self.user = user;
        self.refresh().await
    }

    /// Applies the latest identity from `session` if it changed since the
    /// last call. Returns whether anything was applied.
    pub async fn sync_session(
        &mut self,
        session: &mut watch::Receiver<Option<SessionUser>>,
    ) -> Result<bool, StoreError> {
        match session.has_changed() {
            Ok(true) => {
                let user = session.borrow_and_update().clone();
                self.on_user_changed(user).await?;
                Ok(true)
            }
            Ok(false) => Ok(false),
            Err(_) => {
                debug!("session closed; keeping current identity");
                Ok(false)
            }
        }
    }

    /// Tracks `session` until its sender is dropped. Load failures are
    /// logged by `refresh` and do not stop the loop.
    pub async fn follow(&mut self, mut session: watch::Receiver<Option<SessionUser>>) {
        let initial = session.borrow_and_update().clone();
        let _ = self.on_user_changed(initial).await;

        while session.changed().await.is_ok() {
            let user = session.borrow_and_update().clone();
            let _ = self.on_user_changed(user).await;
        }
        debug!("session closed; no longer following");
    }

    /// Replaces the collection with the store's view. Without a user this
    /// does nothing. On failure the collection is left as it was.
    #[instrument(skip(self))]
    pub async fn refresh(&mut self) -> Result<(), StoreError> {
        let Some(user_id) = self.user.as_ref().map(|u| u.id) else {
            debug!("no authenticated user; skipping refresh");
            return Ok(());
        };

        self.loading = true;
        let result = self.store.list(user_id).await;
        self.loading = false;

        match result {
            Ok(tasks) => {
                debug!(count = tasks.len(), "tasks loaded");
                self.tasks = tasks;
                self.adopt_scheduled().await;
                Ok(())
            }
            Err(err) => {
                error!(error = %err, "error loading tasks");
                Err(err)
            }
        }
    }

    /// Picks up reminders a previous process armed for tasks in the
    /// collection. Backends that cannot list contribute nothing.
    async fn adopt_scheduled(&mut self) {
        for reminder in self.scheduler.list_scheduled().await {
            if self.tasks.iter().any(|task| task.id == reminder.task_id) {
                self.reminders.insert(reminder.task_id, reminder.handle);
            }
        }
    }

    /// Armed reminders belonging to tasks in the collection. Reminders other
    /// users armed in the same data directory are not included.
    pub async fn scheduled_reminders(&self) -> Vec<Reminder> {
        let mut scheduled = self.scheduler.list_scheduled().await;
        scheduled.retain(|reminder| self.find(reminder.task_id).is_some());
        scheduled
    }

    /// Cancels every reminder of the current user's tasks and forgets the
    /// tracked handles. Returns how many were cancelled.
    #[instrument(skip(self))]
    pub async fn cancel_reminders(&mut self) -> usize {
        let mut handles: Vec<ReminderHandle> = self
            .scheduled_reminders()
            .await
            .into_iter()
            .map(|reminder| reminder.handle)
            .collect();
        for (_, handle) in self.reminders.drain() {
            if !handles.contains(&handle) {
                handles.push(handle);
            }
        }

        for handle in &handles {
            self.scheduler.cancel(handle).await;
        }
        info!(cancelled = handles.len(), "cancelled reminders for current user");
        handles.len()
    }

    /// Creates a task for the current user and puts it first. Returns
    /// `Ok(None)` when nobody is signed in.
    #[instrument(skip(self, draft))]
    pub async fn add(&mut self, draft: TaskDraft) -> Result<Option<Task>, StoreError> {
        let Some(user_id) = self.user.as_ref().map(|u| u.id) else {
            debug!("no authenticated user; ignoring add");
            return Ok(None);
        };

        let task = self.store.create(&draft, user_id).await.inspect_err(|err| {
            error!(error = %err, "error adding task");
        })?;
        self.tasks.insert(0, task.clone());

        if draft.has_due_moment()
            && let Some(handle) = self.scheduler.schedule(&task).await
        {
            self.reminders.insert(task.id, handle);
        }

        Ok(Some(task))
    }

    #[instrument(skip(self, patch), fields(id = %id))]
    pub async fn update(&mut self, id: TaskId, patch: TaskPatch) -> Result<Task, StoreError> {
        let updated = self.store.update(id, &patch).await.inspect_err(|err| {
            error!(error = %err, "error updating task");
        })?;

        if let Some(slot) = self.tasks.iter_mut().find(|task| task.id == id) {
            *slot = updated.clone();
        }

        if patch.touches_due() {
            if let Some(stale) = self.reminders.remove(&id) {
                self.scheduler.cancel(&stale).await;
            }
            if let Some(handle) = self.scheduler.schedule(&updated).await {
                self.reminders.insert(id, handle);
            }
        }

        Ok(updated)
    }

    #[instrument(skip(self), fields(id = %id))]
    pub async fn delete(&mut self, id: TaskId) -> Result<(), StoreError> {
        self.store.delete(id).await.inspect_err(|err| {
            error!(error = %err, "error deleting task");
        })?;

        self.tasks.retain(|task| task.id != id);
        if let Some(stale) = self.reminders.remove(&id) {
            self.scheduler.cancel(&stale).await;
        }
        Ok(())
    }
}
