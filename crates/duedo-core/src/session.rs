//! Authenticated-user context.
//!
//! The identity is shared state; consumers hold a [`watch::Receiver`] and
//! re-initialize whenever it changes.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::Config;
use crate::task::UserId;

const SESSION_FILE: &str = "session.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionUser {
    pub id: UserId,
    #[serde(default)]
    pub email: Option<String>,
}

impl SessionUser {
    pub fn new(id: UserId) -> Self {
        Self { id, email: None }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }
}

#[derive(Debug)]
pub struct Session {
    tx: watch::Sender<Option<SessionUser>>,
    path: Option<PathBuf>,
}

impl Session {
    pub fn new(user: Option<SessionUser>) -> Self {
        let (tx, _rx) = watch::channel(user);
        Self { tx, path: None }
    }

    /// Restores the session saved in `data_dir`. `auth.user_id` in the
    /// configuration pins the identity instead.
    #[tracing::instrument(skip(cfg, data_dir))]
    pub fn load(cfg: &Config, data_dir: &Path) -> anyhow::Result<Self> {
        let path = data_dir.join(SESSION_FILE);

        let user = if let Some(raw) = cfg.get("auth.user_id") {
            let id = Uuid::parse_str(raw.trim())
                .map_err(|e| anyhow!("invalid auth.user_id {raw}: {e}"))?;
            let mut user = SessionUser::new(id);
            user.email = cfg.get("auth.email");
            debug!(user_id = %id, "session pinned by config");
            Some(user)
        } else if path.exists() {
            let raw = fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let user: SessionUser = serde_json::from_str(&raw)
                .with_context(|| format!("failed to parse {}", path.display()))?;
            debug!(user_id = %user.id, "restored saved session");
            Some(user)
        } else {
            None
        };

        let mut session = Self::new(user);
        session.path = Some(path);
        Ok(session)
    }

    pub fn current_user(&self) -> Option<SessionUser> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<SessionUser>> {
        self.tx.subscribe()
    }

    pub fn sign_in(&self, user: SessionUser) -> anyhow::Result<()> {
        if let Some(path) = &self.path {
            let raw = serde_json::to_string_pretty(&user)?;
            fs::write(path, raw).with_context(|| format!("failed to write {}", path.display()))?;
        }
        info!(user_id = %user.id, "signed in");
        self.replace(Some(user));
        Ok(())
    }

    pub fn sign_out(&self) -> anyhow::Result<()> {
        if let Some(path) = &self.path
            && path.exists()
        {
            fs::remove_file(path)
                .with_context(|| format!("failed to remove {}", path.display()))?;
        }
        info!("signed out");
        self.replace(None);
        Ok(())
    }

    /// Notifies subscribers only when the identity actually differs.
    fn replace(&self, user: Option<SessionUser>) {
        self.tx.send_if_modified(|current| {
            if *current == user {
                false
            } else {
                *current = user;
                true
            }
        });
    }
}
