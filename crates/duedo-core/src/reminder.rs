//! Reminder Scheduler.
//!
//! Turns a task's due date and time into a fire-moment and arms a reminder
//! on one of two backends:
//!
//! - [`DurableBackend`] keeps reminders in a spool in the data directory.
//!   They survive restarts and are delivered by `duedo remind run`.
//! - [`BestEffortBackend`] arms an in-process timer. It is lost when the
//!   process exits and cannot be cancelled or listed once armed.
//!
//! The scheduler does not remember which handle belongs to which task;
//! [`crate::state::TaskState`] does that.

pub mod best_effort;
pub mod durable;
pub mod notifier;

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info, instrument, warn};

use crate::config::Config;
use crate::datetime::fire_moment;
use crate::error::SchedulingError;
use crate::task::{Task, TaskId};

pub use best_effort::BestEffortBackend;
pub use durable::DurableBackend;
pub use notifier::{Notifier, TerminalNotifier};

pub const DEFAULT_REMINDER_TITLE: &str = "Task Reminder";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReminderHandle(String);

impl ReminderHandle {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReminderHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a backend is asked to arm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReminderRequest {
    pub task_id: TaskId,
    pub title: String,
    pub body: String,
    pub fire_at: DateTime<Utc>,
}

/// An armed reminder as the durable spool records it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reminder {
    pub handle: ReminderHandle,
    pub task_id: TaskId,
    pub title: String,
    pub body: String,
    pub fire_at: DateTime<Utc>,
}

impl Reminder {
    pub fn from_request(handle: ReminderHandle, request: ReminderRequest) -> Self {
        Self {
            handle,
            task_id: request.task_id,
            title: request.title,
            body: request.body,
            fire_at: request.fire_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionState {
    Default,
    Granted,
    Denied,
    Unsupported,
}

impl PermissionState {
    /// Outcome of asking the user. Only an unanswered prompt changes.
    pub fn after_request(self) -> Self {
        match self {
            Self::Default => Self::Granted,
            other => other,
        }
    }
}

impl fmt::Display for PermissionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Default => "default",
            Self::Granted => "granted",
            Self::Denied => "denied",
            Self::Unsupported => "unsupported",
        };
        f.write_str(label)
    }
}

impl FromStr for PermissionState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "default" | "prompt" => Ok(Self::Default),
            "granted" | "on" | "yes" => Ok(Self::Granted),
            "denied" | "off" | "no" => Ok(Self::Denied),
            "unsupported" => Ok(Self::Unsupported),
            other => Err(anyhow!("invalid notification permission: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Durable,
    BestEffort,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Durable => f.write_str("durable"),
            Self::BestEffort => f.write_str("best-effort"),
        }
    }
}

/// A platform facility that can arm reminders.
#[async_trait]
pub trait ReminderBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn permission(&self) -> PermissionState;

    async fn request_permission(&self) -> Result<PermissionState, SchedulingError>;

    /// Arms `request`, or returns `None` without permission.
    async fn arm(&self, request: ReminderRequest)
    -> Result<Option<ReminderHandle>, SchedulingError>;

    /// No-op when the handle is unknown or already fired.
    async fn cancel(&self, handle: &ReminderHandle) -> Result<(), SchedulingError>;

    async fn cancel_all(&self) -> Result<(), SchedulingError>;

    async fn list_scheduled(&self) -> Result<Vec<Reminder>, SchedulingError>;

    /// Hands every reminder due at `now` to the notifier; returns how many.
    async fn deliver_due(&self, now: DateTime<Utc>) -> Result<usize, SchedulingError>;
}

#[derive(Clone)]
pub struct ReminderScheduler {
    backend: Arc<dyn ReminderBackend>,
    timezone: Tz,
    title: String,
}

impl fmt::Debug for ReminderScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReminderScheduler")
            .field("backend", &self.backend.kind())
            .field("timezone", &self.timezone)
            .field("title", &self.title)
            .finish()
    }
}

impl ReminderScheduler {
    pub fn new(backend: Arc<dyn ReminderBackend>, timezone: Tz) -> Self {
        Self {
            backend,
            timezone,
            title: DEFAULT_REMINDER_TITLE.to_string(),
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn backend(&self) -> &Arc<dyn ReminderBackend> {
        &self.backend
    }

    pub fn timezone(&self) -> &Tz {
        &self.timezone
    }

    pub fn fire_moment(&self, task: &Task) -> Option<DateTime<Utc>> {
        let (date, time) = task.due()?;
        fire_moment(date, time, &self.timezone)
    }

    pub async fn request_permission(&self) -> bool {
        match self.backend.request_permission().await {
            Ok(state) => {
                info!(permission = %state, backend = %self.backend.kind(), "notification permission");
                state == PermissionState::Granted
            }
            Err(err) => {
                warn!(error = %err, "notification permission request failed");
                false
            }
        }
    }

    pub async fn schedule(&self, task: &Task) -> Option<ReminderHandle> {
        self.schedule_at(task, Utc::now()).await
    }

    /// Never fails: missing due parts, past fire-moments, missing permission
    /// and backend errors all come back as `None`.
    #[instrument(skip(self, task, now), fields(task_id = %task.id))]
    pub async fn schedule_at(&self, task: &Task, now: DateTime<Utc>) -> Option<ReminderHandle> {
        let Some(fire_at) = self.fire_moment(task) else {
            debug!("task has no complete due moment; no reminder");
            return None;
        };
        if fire_at <= now {
            debug!(fire_at = %fire_at, "due moment already passed; no reminder");
            return None;
        }

        let request = ReminderRequest {
            task_id: task.id,
            title: self.title.clone(),
            body: task.title.clone(),
            fire_at,
        };
        match self.backend.arm(request).await {
            Ok(Some(handle)) => {
                info!(handle = %handle, fire_at = %fire_at, backend = %self.backend.kind(), "reminder scheduled");
                Some(handle)
            }
            Ok(None) => {
                debug!(permission = %self.backend.permission(), "reminder not armed");
                None
            }
            Err(err) => {
                warn!(error = %err, "failed to arm reminder");
                None
            }
        }
    }

    pub async fn cancel(&self, handle: &ReminderHandle) {
        if let Err(err) = self.backend.cancel(handle).await {
            warn!(handle = %handle, error = %err, "failed to cancel reminder");
        }
    }

    pub async fn cancel_all(&self) {
        if let Err(err) = self.backend.cancel_all().await {
            warn!(error = %err, "failed to cancel reminders");
        }
    }

    pub async fn list_scheduled(&self) -> Vec<Reminder> {
        match self.backend.list_scheduled().await {
            Ok(reminders) => reminders,
            Err(err) => {
                warn!(error = %err, "failed to list reminders");
                Vec::new()
            }
        }
    }
}

/// Picks the backend named by `reminders.backend` (`auto`, `durable`,
/// `best-effort`). `auto` probes whether the data directory is writable.
#[instrument(skip(cfg, data_dir, notifier))]
pub fn probe_backend(
    cfg: &Config,
    data_dir: &Path,
    notifier: Arc<dyn Notifier>,
) -> anyhow::Result<Arc<dyn ReminderBackend>> {
    let permission = cfg
        .get("reminders.permission")
        .map(|raw| raw.parse::<PermissionState>())
        .transpose()?
        .unwrap_or(PermissionState::Default);
    let requested = cfg
        .get("reminders.backend")
        .unwrap_or_else(|| "auto".to_string())
        .to_ascii_lowercase();

    let kind = match requested.as_str() {
        "durable" => BackendKind::Durable,
        "best-effort" | "best_effort" | "timer" => BackendKind::BestEffort,
        "auto" => {
            if NamedTempFile::new_in(data_dir).is_ok() {
                BackendKind::Durable
            } else {
                warn!(dir = %data_dir.display(), "data directory not writable; reminders are best-effort");
                BackendKind::BestEffort
            }
        }
        other => {
            return Err(anyhow!(
                "invalid reminders.backend: {other} (expected auto, durable or best-effort)"
            ));
        }
    };
    info!(backend = %kind, permission = %permission, "selected reminder backend");

    Ok(match kind {
        BackendKind::Durable => Arc::new(DurableBackend::open(data_dir, permission, notifier)?),
        BackendKind::BestEffort => Arc::new(BestEffortBackend::new(permission, notifier)),
    })
}
