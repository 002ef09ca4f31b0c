use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::error::SchedulingError;
use crate::reminder::{
    BackendKind, Notifier, PermissionState, Reminder, ReminderBackend, ReminderHandle,
    ReminderRequest,
};

/// In-process timers on the current tokio runtime.
///
/// Known limitation: once armed, a reminder here can be neither cancelled
/// nor listed, and it disappears with the process.
pub struct BestEffortBackend {
    permission: Mutex<PermissionState>,
    notifier: Arc<dyn Notifier>,
}

impl BestEffortBackend {
    pub fn new(permission: PermissionState, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            permission: Mutex::new(permission),
            notifier,
        }
    }
}

#[async_trait]
impl ReminderBackend for BestEffortBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::BestEffort
    }

    fn permission(&self) -> PermissionState {
        *self.permission.lock()
    }

    async fn request_permission(&self) -> Result<PermissionState, SchedulingError> {
        let mut state = self.permission.lock();
        *state = state.after_request();
        Ok(*state)
    }

    #[instrument(skip(self, request), fields(task_id = %request.task_id))]
    async fn arm(
        &self,
        request: ReminderRequest,
    ) -> Result<Option<ReminderHandle>, SchedulingError> {
        if self.permission() != PermissionState::Granted {
            return Ok(None);
        }

        let Ok(delay) = (request.fire_at - Utc::now()).to_std() else {
            return Ok(None);
        };
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|err| SchedulingError::Spool(format!("no async runtime for timer: {err}")))?;

        let handle = ReminderHandle::new(format!("web-{}", request.task_id));
        let reminder = Reminder::from_request(handle.clone(), request);
        let notifier = Arc::clone(&self.notifier);
        runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(err) = notifier.deliver(&reminder) {
                warn!(handle = %reminder.handle, error = %err, "reminder delivery failed");
            }
        });

        debug!(handle = %handle, delay_secs = delay.as_secs(), "timer armed");
        Ok(Some(handle))
    }

    async fn cancel(&self, handle: &ReminderHandle) -> Result<(), SchedulingError> {
        info!(handle = %handle, "cannot cancel best-effort reminders once armed");
        Ok(())
    }

    async fn cancel_all(&self) -> Result<(), SchedulingError> {
        info!("cannot cancel best-effort reminders once armed");
        Ok(())
    }

    async fn list_scheduled(&self) -> Result<Vec<Reminder>, SchedulingError> {
        info!("best-effort reminders cannot be listed");
        Ok(Vec::new())
    }

    async fn deliver_due(&self, _now: DateTime<Utc>) -> Result<usize, SchedulingError> {
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration as StdDuration;

    use chrono::{Duration, Utc};
    use uuid::Uuid;

    use super::BestEffortBackend;
    use crate::reminder::notifier::tests::RecordingNotifier;
    use crate::reminder::{PermissionState, ReminderBackend, ReminderHandle, ReminderRequest};

    fn request(task_id: Uuid) -> ReminderRequest {
        ReminderRequest {
            task_id,
            title: "Task Reminder".to_string(),
            body: "Stretch".to_string(),
            fire_at: Utc::now() + Duration::minutes(10),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn armed_timer_fires_and_cancel_does_not_stop_it() {
        let notifier = Arc::new(RecordingNotifier::default());
        let backend = BestEffortBackend::new(PermissionState::Granted, notifier.clone());
        let task_id = Uuid::new_v4();

        let handle = backend
            .arm(request(task_id))
            .await
            .expect("arm")
            .expect("handle");
        assert_eq!(handle, ReminderHandle::new(format!("web-{task_id}")));

        backend.cancel(&handle).await.expect("cancel is a no-op");
        assert!(backend.list_scheduled().await.expect("list").is_empty());

        tokio::time::sleep(StdDuration::from_secs(11 * 60)).await;
        tokio::task::yield_now().await;
        assert_eq!(notifier.delivered.lock().len(), 1);
    }

    #[tokio::test]
    async fn no_timer_without_permission() {
        let backend = BestEffortBackend::new(
            PermissionState::Denied,
            Arc::new(RecordingNotifier::default()),
        );
        assert!(
            backend
                .arm(request(Uuid::new_v4()))
                .await
                .expect("arm")
                .is_none()
        );
        assert_eq!(
            backend.request_permission().await.expect("request"),
            PermissionState::Denied
        );
    }
}
