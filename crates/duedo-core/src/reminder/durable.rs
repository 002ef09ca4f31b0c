use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::error::SchedulingError;
use crate::reminder::{
    BackendKind, Notifier, PermissionState, Reminder, ReminderBackend, ReminderHandle,
    ReminderRequest,
};
use crate::store::file::{load_jsonl, lock_data_dir, lock_path_in, save_jsonl_atomic};

const SPOOL_FILE: &str = "reminders.data";
const PERMISSION_FILE: &str = "permission.data";

/// Reminders spooled to the data directory.
///
/// The spool outlives the process; whichever process runs
/// [`ReminderBackend::deliver_due`] fires them.
pub struct DurableBackend {
    pub(crate) spool_path: PathBuf,
    pub(crate) permission_path: PathBuf,
    lock_path: PathBuf,
    lock: Mutex<()>,
    notifier: Arc<dyn Notifier>,
}

impl DurableBackend {
    /// `permission` acts like the platform settings switch: `granted` or
    /// `denied` overwrites the stored answer, `default` keeps it.
    #[instrument(skip(data_dir, notifier))]
    pub fn open(
        data_dir: &Path,
        permission: PermissionState,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self, SchedulingError> {
        fs::create_dir_all(data_dir)?;
        let spool_path = data_dir.join(SPOOL_FILE);
        let permission_path = data_dir.join(PERMISSION_FILE);
        let lock_path = lock_path_in(data_dir);

        let _dir = lock_data_dir(&lock_path)?;
        if !spool_path.exists() {
            fs::write(&spool_path, "")?;
        }
        if permission != PermissionState::Default || !permission_path.exists() {
            write_permission(&permission_path, permission)?;
        }

        info!(
            spool = %spool_path.display(),
            permission = %permission_path.display(),
            "opened durable reminder spool"
        );
        Ok(Self {
            spool_path,
            permission_path,
            lock_path,
            lock: Mutex::new(()),
            notifier,
        })
    }

    fn load(&self) -> Result<Vec<Reminder>, SchedulingError> {
        Ok(load_jsonl(&self.spool_path)?)
    }

    fn save(&self, reminders: &[Reminder]) -> Result<(), SchedulingError> {
        Ok(save_jsonl_atomic(&self.spool_path, reminders)?)
    }

    fn read_permission(&self) -> Result<PermissionState, SchedulingError> {
        let raw = fs::read_to_string(&self.permission_path)?;
        raw.parse::<PermissionState>()
            .map_err(|err| SchedulingError::Spool(err.to_string()))
    }
}

#[async_trait]
impl ReminderBackend for DurableBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Durable
    }

    fn permission(&self) -> PermissionState {
        let _guard = self.lock.lock();
        self.read_permission().unwrap_or_else(|err| {
            warn!(error = %err, "unreadable permission state; treating as unanswered");
            PermissionState::Default
        })
    }

    async fn request_permission(&self) -> Result<PermissionState, SchedulingError> {
        let _guard = self.lock.lock();
        let _dir = lock_data_dir(&self.lock_path)?;
        let current = self.read_permission()?;
        let answered = current.after_request();
        if answered != current {
            write_permission(&self.permission_path, answered)?;
        }
        debug!(before = %current, after = %answered, "permission requested");
        Ok(answered)
    }

    #[instrument(skip(self, request), fields(task_id = %request.task_id))]
    async fn arm(
        &self,
        request: ReminderRequest,
    ) -> Result<Option<ReminderHandle>, SchedulingError> {
        let _guard = self.lock.lock();
        let _dir = lock_data_dir(&self.lock_path)?;
        if self.read_permission()? != PermissionState::Granted {
            return Ok(None);
        }

        let handle = ReminderHandle::new(Uuid::new_v4().to_string());
        let mut reminders = self.load()?;
        reminders.push(Reminder::from_request(handle.clone(), request));
        reminders.sort_by_key(|reminder| reminder.fire_at);
        self.save(&reminders)?;

        debug!(handle = %handle, pending = reminders.len(), "reminder spooled");
        Ok(Some(handle))
    }

    #[instrument(skip(self), fields(handle = %handle))]
    async fn cancel(&self, handle: &ReminderHandle) -> Result<(), SchedulingError> {
        let _guard = self.lock.lock();
        let _dir = lock_data_dir(&self.lock_path)?;
        let mut reminders = self.load()?;
        let before = reminders.len();
        reminders.retain(|reminder| &reminder.handle != handle);
        if reminders.len() == before {
            debug!("reminder already fired or unknown");
            return Ok(());
        }
        self.save(&reminders)
    }

    async fn cancel_all(&self) -> Result<(), SchedulingError> {
        let _guard = self.lock.lock();
        let _dir = lock_data_dir(&self.lock_path)?;
        let before = self.load()?.len();
        self.save(&[])?;
        info!(cancelled = before, "cancelled all reminders");
        Ok(())
    }

    async fn list_scheduled(&self) -> Result<Vec<Reminder>, SchedulingError> {
        let _guard = self.lock.lock();
        self.load()
    }

    #[instrument(skip(self))]
    async fn deliver_due(&self, now: DateTime<Utc>) -> Result<usize, SchedulingError> {
        let due = {
            let _guard = self.lock.lock();
            let _dir = lock_data_dir(&self.lock_path)?;
            let (due, pending): (Vec<Reminder>, Vec<Reminder>) = self
                .load()?
                .into_iter()
                .partition(|reminder| reminder.fire_at <= now);
            if due.is_empty() {
                return Ok(0);
            }
            self.save(&pending)?;
            due
        };

        for reminder in &due {
            if let Err(err) = self.notifier.deliver(reminder) {
                warn!(handle = %reminder.handle, error = %err, "reminder delivery failed; dropping");
            }
        }
        Ok(due.len())
    }
}

fn write_permission(path: &Path, state: PermissionState) -> Result<(), SchedulingError> {
    fs::write(path, state.to_string())?;
    Ok(())
}
