use std::fs;
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use fs4::fs_std::FileExt;
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tempfile::NamedTempFile;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::error::StoreError;
use crate::store::TaskStore;
use crate::task::{Task, TaskDraft, TaskId, TaskPatch, UserId};

const TASKS_FILE: &str = "tasks.data";
const LOCK_FILE: &str = ".lock";

/// JSON-lines task table in the data directory.
///
/// Rows are kept newest first. With an owner set, `update` and `delete`
/// only see that owner's rows, the way row-level security does remotely.
#[derive(Debug)]
pub struct FileTaskStore {
    pub(crate) tasks_path: PathBuf,
    lock_path: PathBuf,
    owner: Option<UserId>,
    lock: Mutex<()>,
}

impl FileTaskStore {
    #[instrument(skip(data_dir))]
    pub fn open(data_dir: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(data_dir)?;
        let tasks_path = data_dir.join(TASKS_FILE);
        if !tasks_path.exists() {
            fs::write(&tasks_path, "")?;
        }

        info!(tasks = %tasks_path.display(), "opened file task store");
        Ok(Self {
            tasks_path,
            lock_path: lock_path_in(data_dir),
            owner: None,
            lock: Mutex::new(()),
        })
    }

    pub fn with_owner(mut self, owner: UserId) -> Self {
        self.owner = Some(owner);
        self
    }

    fn visible(&self, task: &Task) -> bool {
        self.owner.is_none_or(|owner| task.user_id == owner)
    }
}

#[async_trait]
impl TaskStore for FileTaskStore {
    #[instrument(skip(self), fields(user_id = %user_id))]
    async fn list(&self, user_id: UserId) -> Result<Vec<Task>, StoreError> {
        let _guard = self.lock.lock();
        let mut rows: Vec<Task> = load_jsonl::<Task>(&self.tasks_path)?
            .into_iter()
            .filter(|task| task.user_id == user_id)
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows)
    }

    #[instrument(skip(self, draft), fields(user_id = %user_id))]
    async fn create(&self, draft: &TaskDraft, user_id: UserId) -> Result<Task, StoreError> {
        draft.validate()?;
        let _guard = self.lock.lock();
        let _dir = lock_data_dir(&self.lock_path)?;
        let mut rows: Vec<Task> = load_jsonl(&self.tasks_path)?;

        let now = Utc::now();
        let task = Task {
            id: Uuid::new_v4(),
            title: draft.title.clone(),
            description: draft.description.clone(),
            due_date: draft.due_date,
            due_time: draft.due_time,
            user_id,
            created_at: now,
            updated_at: now,
        };
        rows.insert(0, task.clone());
        save_jsonl_atomic(&self.tasks_path, &rows)?;

        debug!(id = %task.id, count = rows.len(), "task inserted");
        Ok(task)
    }

    #[instrument(skip(self, patch), fields(id = %id))]
    async fn update(&self, id: TaskId, patch: &TaskPatch) -> Result<Task, StoreError> {
        patch.validate()?;
        let _guard = self.lock.lock();
        let _dir = lock_data_dir(&self.lock_path)?;
        let mut rows: Vec<Task> = load_jsonl(&self.tasks_path)?;

        let updated = {
            let task = rows
                .iter_mut()
                .find(|task| task.id == id && self.visible(task))
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
            patch.apply(task);
            task.updated_at = Utc::now();
            task.clone()
        };

        save_jsonl_atomic(&self.tasks_path, &rows)?;
        Ok(updated)
    }

    #[instrument(skip(self), fields(id = %id))]
    async fn delete(&self, id: TaskId) -> Result<(), StoreError> {
        let _guard = self.lock.lock();
        let _dir = lock_data_dir(&self.lock_path)?;
        let mut rows: Vec<Task> = load_jsonl(&self.tasks_path)?;

        let idx = rows
            .iter()
            .position(|task| task.id == id && self.visible(task))
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        rows.remove(idx);

        save_jsonl_atomic(&self.tasks_path, &rows)?;
        debug!(count = rows.len(), "task removed");
        Ok(())
    }
}

/// Exclusive advisory lock on the data directory. Every load-modify-save
/// cycle holds one, so separate processes sharing the directory take turns.
/// Dropping it closes the file, which releases the lock.
#[derive(Debug)]
pub(crate) struct DirLock {
    _file: fs::File,
}

pub(crate) fn lock_path_in(data_dir: &Path) -> PathBuf {
    data_dir.join(LOCK_FILE)
}

pub(crate) fn lock_data_dir(lock_path: &Path) -> io::Result<DirLock> {
    let file = fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(lock_path)?;
    file.lock_exclusive()?;
    Ok(DirLock { _file: file })
}

pub(crate) fn load_jsonl<T: DeserializeOwned>(path: &Path) -> io::Result<Vec<T>> {
    debug!(file = %path.display(), "loading jsonl");
    let file = match fs::File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err),
    };
    let reader = BufReader::new(file);

    let mut out = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let row: T = serde_json::from_str(trimmed).map_err(|err| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("failed parsing {} line {}: {err}", path.display(), idx + 1),
            )
        })?;
        out.push(row);
    }

    debug!(count = out.len(), "loaded rows from jsonl");
    Ok(out)
}

pub(crate) fn save_jsonl_atomic<T: Serialize>(path: &Path, rows: &[T]) -> io::Result<()> {
    debug!(file = %path.display(), count = rows.len(), "saving jsonl atomically");

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut temp = NamedTempFile::new_in(dir)?;
    for row in rows {
        let serialized = serde_json::to_string(row).map_err(io::Error::other)?;
        writeln!(temp, "{serialized}")?;
    }
    temp.flush()?;

    temp.persist(path).map_err(|err| err.error)?;
    Ok(())
}
