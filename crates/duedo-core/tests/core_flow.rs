use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{Duration, NaiveTime, Timelike, Utc};
use duedo_core::error::StoreError;
use duedo_core::reminder::{
    BestEffortBackend, DurableBackend, Notifier, PermissionState, Reminder, ReminderBackend,
    ReminderScheduler,
};
use duedo_core::session::{Session, SessionUser};
use duedo_core::state::TaskState;
use duedo_core::store::{FileTaskStore, TaskStore};
use duedo_core::task::{Task, TaskDraft, TaskId, TaskPatch, UserId};
use parking_lot::Mutex;
use tempfile::tempdir;
use uuid::Uuid;

#[derive(Default)]
struct Inbox {
    delivered: Mutex<Vec<Reminder>>,
}

impl Notifier for Inbox {
    fn deliver(&self, reminder: &Reminder) -> anyhow::Result<()> {
        self.delivered.lock().push(reminder.clone());
        Ok(())
    }
}

/// File store that can be switched into a failing mode.
struct FlakyStore {
    inner: FileTaskStore,
    failing: AtomicBool,
}

impl FlakyStore {
    fn check(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(StoreError::Network("connection reset".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl TaskStore for FlakyStore {
    async fn list(&self, user_id: UserId) -> Result<Vec<Task>, StoreError> {
        self.check()?;
        self.inner.list(user_id).await
    }

    async fn create(&self, draft: &TaskDraft, user_id: UserId) -> Result<Task, StoreError> {
        self.check()?;
        self.inner.create(draft, user_id).await
    }

    async fn update(&self, id: TaskId, patch: &TaskPatch) -> Result<Task, StoreError> {
        self.check()?;
        self.inner.update(id, patch).await
    }

    async fn delete(&self, id: TaskId) -> Result<(), StoreError> {
        self.check()?;
        self.inner.delete(id).await
    }
}

fn durable_state(dir: &Path) -> (TaskState, Arc<dyn ReminderBackend>) {
    let store = FileTaskStore::open(dir).expect("open store");
    let backend: Arc<dyn ReminderBackend> = Arc::new(
        DurableBackend::open(dir, PermissionState::Granted, Arc::new(Inbox::default()))
            .expect("open backend"),
    );
    let scheduler = ReminderScheduler::new(Arc::clone(&backend), chrono_tz::UTC);
    (TaskState::new(Arc::new(store), scheduler), backend)
}

fn tomorrow_at(hour: u32, minute: u32) -> TaskDraft {
    let tomorrow = (Utc::now() + Duration::days(1)).date_naive();
    TaskDraft::new("Pay rent").with_due(Some(tomorrow), NaiveTime::from_hms_opt(hour, minute, 0))
}

#[tokio::test]
async fn add_prepends_and_arms_reminder() {
    let temp = tempdir().expect("tempdir");
    let (mut state, backend) = durable_state(temp.path());
    state
        .on_user_changed(Some(SessionUser::new(Uuid::new_v4())))
        .await
        .expect("sign in");

    let first = state
        .add(TaskDraft::new("Buy milk"))
        .await
        .expect("add")
        .expect("user present");
    let second = state
        .add(tomorrow_at(8, 30))
        .await
        .expect("add")
        .expect("user present");

    let ids: Vec<TaskId> = state.tasks().iter().map(|task| task.id).collect();
    assert_eq!(ids, vec![second.id, first.id]);

    assert!(state.reminder_for(first.id).is_none());
    let handle = state.reminder_for(second.id).expect("reminder tracked").clone();
    let scheduled = backend.list_scheduled().await.expect("list");
    assert_eq!(scheduled.len(), 1);
    assert_eq!(scheduled[0].handle, handle);
    assert_eq!(scheduled[0].body, "Pay rent");
}

#[tokio::test]
async fn add_without_user_is_a_no_op() {
    let temp = tempdir().expect("tempdir");
    let (mut state, _backend) = durable_state(temp.path());

    assert!(state.add(TaskDraft::new("Orphan")).await.expect("add").is_none());
    assert!(state.tasks().is_empty());

    state.refresh().await.expect("refresh without user");
    assert!(!state.is_loading());
}

#[tokio::test]
async fn due_change_replaces_stale_reminder() {
    let temp = tempdir().expect("tempdir");
    let (mut state, backend) = durable_state(temp.path());
    state
        .on_user_changed(Some(SessionUser::new(Uuid::new_v4())))
        .await
        .expect("sign in");

    let task = state
        .add(tomorrow_at(8, 30))
        .await
        .expect("add")
        .expect("user present");
    let stale = state.reminder_for(task.id).expect("armed").clone();

    let retitled = state
        .update(
            task.id,
            TaskPatch {
                title: Some("Pay rent online".to_string()),
                ..TaskPatch::default()
            },
        )
        .await
        .expect("retitle");
    assert_eq!(retitled.title, "Pay rent online");
    assert_eq!(state.reminder_for(task.id), Some(&stale));

    let updated = state
        .update(
            task.id,
            TaskPatch {
                due_time: Some(NaiveTime::from_hms_opt(18, 0, 0)),
                ..TaskPatch::default()
            },
        )
        .await
        .expect("move due time");
    assert_eq!(updated.due_time, NaiveTime::from_hms_opt(18, 0, 0));
    assert_eq!(state.tasks().len(), 1);
    assert_eq!(state.tasks()[0], updated);

    let fresh = state.reminder_for(task.id).expect("re-armed").clone();
    assert_ne!(fresh, stale);
    let scheduled = backend.list_scheduled().await.expect("list");
    assert_eq!(scheduled.len(), 1);
    assert_eq!(scheduled[0].handle, fresh);

    state
        .update(
            task.id,
            TaskPatch {
                due_date: Some(None),
                ..TaskPatch::default()
            },
        )
        .await
        .expect("clear due date");
    assert!(state.reminder_for(task.id).is_none());
    assert!(backend.list_scheduled().await.expect("list").is_empty());
}

#[tokio::test]
async fn delete_removes_task_and_its_reminder() {
    let temp = tempdir().expect("tempdir");
    let (mut state, backend) = durable_state(temp.path());
    state
        .on_user_changed(Some(SessionUser::new(Uuid::new_v4())))
        .await
        .expect("sign in");

    let task = state
        .add(tomorrow_at(7, 0))
        .await
        .expect("add")
        .expect("user present");
    state.delete(task.id).await.expect("delete");

    assert!(state.tasks().is_empty());
    assert!(state.reminder_for(task.id).is_none());
    assert!(backend.list_scheduled().await.expect("list").is_empty());

    let err = state.delete(task.id).await.expect_err("already gone");
    assert!(matches!(err, StoreError::NotFound(_)));
}

#[tokio::test]
async fn edits_leave_neighbouring_tasks_in_place() {
    let temp = tempdir().expect("tempdir");
    let (mut state, _backend) = durable_state(temp.path());
    state
        .on_user_changed(Some(SessionUser::new(Uuid::new_v4())))
        .await
        .expect("sign in");

    for title in ["Water plants", "Call bank", "Book flights"] {
        state
            .add(TaskDraft::new(title))
            .await
            .expect("add")
            .expect("user present");
    }
    let before = state.tasks().to_vec();
    let middle = before[1].id;

    let patch = TaskPatch {
        title: Some("Call bank about card".to_string()),
        ..TaskPatch::default()
    };
    state.update(middle, patch).await.expect("update");

    let after_update = state.tasks();
    assert_eq!(after_update.len(), 3);
    assert_eq!(after_update[0], before[0]);
    assert_eq!(after_update[1].id, middle);
    assert_eq!(after_update[1].title, "Call bank about card");
    assert_eq!(after_update[2], before[2]);

    state.delete(before[0].id).await.expect("delete");

    let after_delete = state.tasks();
    assert_eq!(after_delete.len(), 2);
    assert_eq!(after_delete[0].id, middle);
    assert_eq!(after_delete[1], before[2]);
}

#[tokio::test]
async fn failures_leave_local_state_untouched() {
    let temp = tempdir().expect("tempdir");
    let store = Arc::new(FlakyStore {
        inner: FileTaskStore::open(temp.path()).expect("open store"),
        failing: AtomicBool::new(false),
    });
    let backend = Arc::new(BestEffortBackend::new(
        PermissionState::Denied,
        Arc::new(Inbox::default()),
    ));
    let mut state = TaskState::new(
        store.clone(),
        ReminderScheduler::new(backend, chrono_tz::UTC),
    );
    state
        .on_user_changed(Some(SessionUser::new(Uuid::new_v4())))
        .await
        .expect("sign in");
    let task = state
        .add(TaskDraft::new("Stretch"))
        .await
        .expect("add")
        .expect("user present");

    store.failing.store(true, Ordering::SeqCst);

    assert!(state.add(TaskDraft::new("Second")).await.is_err());
    assert!(
        state
            .update(
                task.id,
                TaskPatch {
                    title: Some("Renamed".to_string()),
                    ..TaskPatch::default()
                },
            )
            .await
            .is_err()
    );
    assert!(state.delete(task.id).await.is_err());
    assert!(state.refresh().await.is_err());

    assert!(!state.is_loading());
    assert_eq!(state.tasks(), std::slice::from_ref(&task));
}

#[tokio::test]
async fn user_switch_discards_prior_tasks() {
    let temp = tempdir().expect("tempdir");
    let (mut state, backend) = durable_state(temp.path());
    let alice = SessionUser::new(Uuid::new_v4());
    let bob = SessionUser::new(Uuid::new_v4());

    state.on_user_changed(Some(alice.clone())).await.expect("alice");
    let alice_task = state
        .add(tomorrow_at(9, 0))
        .await
        .expect("add")
        .expect("user present");

    state.on_user_changed(Some(bob.clone())).await.expect("bob");
    assert!(state.tasks().is_empty());
    assert!(state.reminder_for(alice_task.id).is_none());
    assert_eq!(backend.list_scheduled().await.expect("list").len(), 1);

    state
        .add(TaskDraft::new("Bob's chore"))
        .await
        .expect("add")
        .expect("user present");
    assert_eq!(state.tasks().len(), 1);
    assert_eq!(state.tasks()[0].user_id, bob.id);

    state.on_user_changed(None).await.expect("sign out");
    assert!(state.tasks().is_empty());
    assert!(state.user().is_none());

    state.on_user_changed(Some(alice)).await.expect("alice again");
    assert_eq!(state.tasks().len(), 1);
    assert!(state.reminder_for(alice_task.id).is_some());
}

#[tokio::test]
async fn session_changes_reach_the_container() {
    let temp = tempdir().expect("tempdir");
    let (mut state, _backend) = durable_state(temp.path());
    let session = Session::new(None);
    let mut rx = session.subscribe();

    assert!(!state.sync_session(&mut rx).await.expect("sync"));

    let user = SessionUser::new(Uuid::new_v4()).with_email("sam@example.com");
    session.sign_in(user.clone()).expect("sign in");
    assert!(state.sync_session(&mut rx).await.expect("sync"));
    assert_eq!(state.user(), Some(&user));
    assert!(!state.sync_session(&mut rx).await.expect("no change"));
}

#[tokio::test]
async fn follow_tracks_session_until_it_closes() {
    let temp = tempdir().expect("tempdir");
    let (mut state, _backend) = durable_state(temp.path());
    let first = SessionUser::new(Uuid::new_v4());
    let second = SessionUser::new(Uuid::new_v4());

    let session = Session::new(Some(first));
    let rx = session.subscribe();
    let switch_to = second.clone();
    let driver = async move {
        tokio::task::yield_now().await;
        session.sign_in(switch_to).expect("switch user");
        tokio::task::yield_now().await;
        drop(session);
    };

    tokio::join!(state.follow(rx), driver);
    assert_eq!(state.user(), Some(&second));
    assert!(state.tasks().is_empty());
}

#[tokio::test]
async fn reminders_are_rediscovered_by_a_new_container() {
    let temp = tempdir().expect("tempdir");
    let user = SessionUser::new(Uuid::new_v4());

    let task = {
        let (mut state, _backend) = durable_state(temp.path());
        state.on_user_changed(Some(user.clone())).await.expect("sign in");
        state
            .add(tomorrow_at(10, 15))
            .await
            .expect("add")
            .expect("user present")
    };

    let (mut state, backend) = durable_state(temp.path());
    state.on_user_changed(Some(user)).await.expect("sign in");
    let handle = state.reminder_for(task.id).expect("adopted").clone();

    state.delete(task.id).await.expect("delete");
    assert!(
        backend
            .list_scheduled()
            .await
            .expect("list")
            .iter()
            .all(|reminder| reminder.handle != handle)
    );
}

#[tokio::test(start_paused = true)]
async fn best_effort_reminder_survives_delete() {
    let temp = tempdir().expect("tempdir");
    let inbox = Arc::new(Inbox::default());
    let backend = Arc::new(BestEffortBackend::new(
        PermissionState::Granted,
        inbox.clone(),
    ));
    let mut state = TaskState::new(
        Arc::new(FileTaskStore::open(temp.path()).expect("open store")),
        ReminderScheduler::new(backend, chrono_tz::UTC),
    );
    state
        .on_user_changed(Some(SessionUser::new(Uuid::new_v4())))
        .await
        .expect("sign in");

    let soon = Utc::now() + Duration::minutes(2);
    let draft = TaskDraft::new("Kettle").with_due(
        Some(soon.date_naive()),
        NaiveTime::from_hms_opt(soon.hour(), soon.minute(), 0),
    );
    let task = state.add(draft).await.expect("add").expect("user present");
    let handle = state.reminder_for(task.id).expect("armed").clone();
    assert_eq!(handle.as_str(), format!("web-{}", task.id));

    state.delete(task.id).await.expect("delete");
    assert!(state.tasks().is_empty());

    tokio::time::sleep(std::time::Duration::from_secs(3 * 60)).await;
    tokio::task::yield_now().await;
    assert_eq!(inbox.delivered.lock().len(), 1);
}

#[tokio::test]
async fn cancelling_reminders_spares_other_users() {
    let temp = tempdir().expect("tempdir");
    let (mut alice, backend) = durable_state(temp.path());
    let (mut bob, _) = durable_state(temp.path());
    alice
        .on_user_changed(Some(SessionUser::new(Uuid::new_v4())))
        .await
        .expect("sign in alice");
    bob.on_user_changed(Some(SessionUser::new(Uuid::new_v4())))
        .await
        .expect("sign in bob");

    let alice_task = alice
        .add(tomorrow_at(9, 0))
        .await
        .expect("add")
        .expect("user present");
    let bob_task = bob
        .add(tomorrow_at(10, 0))
        .await
        .expect("add")
        .expect("user present");

    let visible: Vec<TaskId> = alice
        .scheduled_reminders()
        .await
        .iter()
        .map(|reminder| reminder.task_id)
        .collect();
    assert_eq!(visible, vec![alice_task.id]);

    assert_eq!(alice.cancel_reminders().await, 1);
    assert!(alice.reminder_for(alice_task.id).is_none());

    let remaining = backend.list_scheduled().await.expect("list");
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].task_id, bob_task.id);
    assert!(bob.reminder_for(bob_task.id).is_some());
}
