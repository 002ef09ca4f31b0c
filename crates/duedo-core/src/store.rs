//! Task Store Client: list/create/update/delete against the task table.

pub mod file;
pub mod rest;

use std::path::Path;
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use tracing::info;

use crate::config::Config;
use crate::error::StoreError;
use crate::task::{Task, TaskDraft, TaskId, TaskPatch, UserId};

pub use file::FileTaskStore;
pub use rest::{RestConfig, RestTaskStore};

/// Remote table of tasks, scoped by owning user.
///
/// `list` returns rows newest first. Implementations never retry.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn list(&self, user_id: UserId) -> Result<Vec<Task>, StoreError>;

    async fn create(&self, draft: &TaskDraft, user_id: UserId) -> Result<Task, StoreError>;

    async fn update(&self, id: TaskId, patch: &TaskPatch) -> Result<Task, StoreError>;

    async fn delete(&self, id: TaskId) -> Result<(), StoreError>;
}

/// Builds the store named by `store.backend` (`rest` or `file`).
#[tracing::instrument(skip(cfg, data_dir))]
pub fn open_store(
    cfg: &Config,
    data_dir: &Path,
    owner: Option<UserId>,
) -> anyhow::Result<Arc<dyn TaskStore>> {
    let backend = cfg.get("store.backend").unwrap_or_else(|| "rest".to_string());
    info!(backend = %backend, "opening task store");

    match backend.to_ascii_lowercase().as_str() {
        "rest" => {
            let rest = RestTaskStore::new(RestConfig::from_config(cfg)?)?;
            Ok(Arc::new(rest))
        }
        "file" => {
            let mut file = FileTaskStore::open(data_dir)?;
            if let Some(owner) = owner {
                file = file.with_owner(owner);
            }
            Ok(Arc::new(file))
        }
        other => Err(anyhow!(
            "invalid store.backend: {other} (expected rest or file)"
        )),
    }
}
