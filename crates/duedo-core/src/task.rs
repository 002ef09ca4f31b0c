use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::datetime::{due_time_serde, local_now};
use crate::error::StoreError;

pub type TaskId = Uuid;
pub type UserId = Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Task {
    pub id: TaskId,

    pub title: String,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub due_date: Option<NaiveDate>,

    #[serde(default, with = "due_time_serde")]
    pub due_time: Option<NaiveTime>,

    pub user_id: UserId,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Date and time together, or `None` when either half is missing.
    pub fn due(&self) -> Option<(NaiveDate, NaiveTime)> {
        Some((self.due_date?, self.due_time?))
    }

    /// Overdue compares midnight of the due date in `tz` against now, so a
    /// task due today counts as overdue for the rest of the day. Due dates are
    /// read in the same zone as reminder fire-moments, not as UTC midnight.
    pub fn is_overdue(&self, now: DateTime<Utc>, tz: &Tz) -> bool {
        let Some(date) = self.due_date else {
            return false;
        };
        let now_local = local_now(now, tz);
        date.and_time(NaiveTime::MIN) < now_local
    }
}

/// Insert payload. `user_id` is attached by the store client.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct TaskDraft {
    pub title: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub due_date: Option<NaiveDate>,

    #[serde(skip_serializing_if = "Option::is_none", with = "due_time_serde")]
    pub due_time: Option<NaiveTime>,
}

impl TaskDraft {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_due(mut self, date: Option<NaiveDate>, time: Option<NaiveTime>) -> Self {
        self.due_date = date;
        self.due_time = time;
        self
    }

    pub fn has_due_moment(&self) -> bool {
        self.due_date.is_some() && self.due_time.is_some()
    }

    pub fn validate(&self) -> Result<(), StoreError> {
        if self.title.trim().is_empty() {
            return Err(StoreError::Validation("title must not be empty".to_string()));
        }
        Ok(())
    }
}

/// Partial update. The outer `Option` says whether a field is touched; the
/// inner one (for nullable columns) distinguishes set from clear.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct TaskPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<Option<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub due_date: Option<Option<NaiveDate>>,

    #[serde(skip_serializing_if = "Option::is_none", with = "due_time_serde::patch")]
    pub due_time: Option<Option<NaiveTime>>,
}

impl TaskPatch {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && self.due_date.is_none()
            && self.due_time.is_none()
    }

    pub fn touches_due(&self) -> bool {
        self.due_date.is_some() || self.due_time.is_some()
    }

    pub fn validate(&self) -> Result<(), StoreError> {
        if let Some(title) = self.title.as_deref()
            && title.trim().is_empty()
        {
            return Err(StoreError::Validation("title must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn apply(&self, task: &mut Task) {
        if let Some(title) = &self.title {
            task.title = title.clone();
        }
        if let Some(description) = &self.description {
            task.description = description.clone();
        }
        if let Some(due_date) = self.due_date {
            task.due_date = due_date;
        }
        if let Some(due_time) = self.due_time {
            task.due_time = due_time;
        }
    }
}

impl From<TaskDraft> for TaskPatch {
    fn from(draft: TaskDraft) -> Self {
        Self {
            title: Some(draft.title),
            description: Some(draft.description),
            due_date: Some(draft.due_date),
            due_time: Some(draft.due_time),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, NaiveTime, TimeZone, Utc};
    use uuid::Uuid;

    use super::{Task, TaskDraft, TaskPatch};

    fn sample() -> Task {
        let now = Utc
            .with_ymd_and_hms(2025, 3, 1, 12, 0, 0)
            .single()
            .expect("valid now");
        Task {
            id: Uuid::new_v4(),
            title: "Buy milk".to_string(),
            description: None,
            due_date: NaiveDate::from_ymd_opt(2025, 3, 2),
            due_time: None,
            user_id: Uuid::new_v4(),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn due_requires_both_halves() {
        let mut task = sample();
        assert!(task.due().is_none());
        task.due_time = NaiveTime::from_hms_opt(9, 0, 0);
        assert!(task.due().is_some());
        task.due_date = None;
        assert!(task.due().is_none());
    }

    #[test]
    fn overdue_uses_local_midnight_of_due_date() {
        let task = sample();
        let before = Utc
            .with_ymd_and_hms(2025, 3, 1, 23, 0, 0)
            .single()
            .expect("valid");
        let during = Utc
            .with_ymd_and_hms(2025, 3, 2, 0, 30, 0)
            .single()
            .expect("valid");
        assert!(!task.is_overdue(before, &chrono_tz::UTC));
        assert!(task.is_overdue(during, &chrono_tz::UTC));
    }

    #[test]
    fn overdue_follows_the_configured_zone_not_utc() {
        let task = sample();
        let new_york = chrono_tz::America::New_York;
        // 21:00 on Mar 1 in New York.
        let evening_before = Utc
            .with_ymd_and_hms(2025, 3, 2, 2, 0, 0)
            .single()
            .expect("valid");
        // 00:30 on Mar 2 in New York.
        let just_after = Utc
            .with_ymd_and_hms(2025, 3, 2, 5, 30, 0)
            .single()
            .expect("valid");
        assert!(task.is_overdue(evening_before, &chrono_tz::UTC));
        assert!(!task.is_overdue(evening_before, &new_york));
        assert!(task.is_overdue(just_after, &new_york));
    }

    #[test]
    fn patch_serializes_only_touched_fields() {
        let patch = TaskPatch {
            description: Some(None),
            due_time: NaiveTime::from_hms_opt(8, 30, 0).map(Some),
            ..TaskPatch::default()
        };
        let json = serde_json::to_value(&patch).expect("serialize patch");
        assert_eq!(
            json,
            serde_json::json!({ "description": null, "due_time": "08:30:00" })
        );
        assert!(patch.touches_due());
    }

    #[test]
    fn blank_title_is_rejected() {
        assert!(TaskDraft::new("   ").validate().is_err());
        assert!(TaskDraft::new("ok").validate().is_ok());
        let patch = TaskPatch {
            title: Some(String::new()),
            ..TaskPatch::default()
        };
        assert!(patch.validate().is_err());
    }

    #[test]
    fn task_row_decodes_store_shape() {
        let raw = r#"{
            "id": "0b6f9f3e-8a51-4d55-9a3c-5c2b7f3f0a11",
            "title": "Call mom",
            "description": null,
            "due_date": "2025-06-01",
            "due_time": "18:45:00",
            "user_id": "4d0c7f0e-2b1a-4b7e-9f55-1c2d3e4f5a6b",
            "created_at": "2025-05-30T10:00:00.123456+00:00",
            "updated_at": "2025-05-30T10:00:00.123456+00:00"
        }"#;
        let task: Task = serde_json::from_str(raw).expect("decode row");
        assert_eq!(task.due_time, NaiveTime::from_hms_opt(18, 45, 0));
        assert_eq!(task.due_date, NaiveDate::from_ymd_opt(2025, 6, 1));
    }
}
