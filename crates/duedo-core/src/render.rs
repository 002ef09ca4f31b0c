use std::io::{self, IsTerminal, Write};

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use unicode_width::UnicodeWidthStr;

use crate::config::Config;
use crate::datetime::{format_due_date, format_due_time};
use crate::reminder::{Reminder, ReminderHandle};
use crate::task::{Task, TaskId};

const SHORT_ID_LEN: usize = 8;

#[derive(Debug, Clone)]
pub struct Renderer {
    color: bool,
}

impl Renderer {
    pub fn new(cfg: &Config) -> anyhow::Result<Self> {
        let color_cfg = cfg.get("color").unwrap_or_else(|| "on".to_string());
        let color = match color_cfg.to_ascii_lowercase().as_str() {
            "on" | "yes" | "true" | "1" => true,
            "off" | "no" | "false" | "0" => false,
            other => return Err(anyhow!("invalid color setting: {other}")),
        };

        Ok(Self { color })
    }

    /// `reminder_for` reports the tracked reminder of a task, if any.
    #[tracing::instrument(skip(self, tasks, reminder_for, now, tz))]
    pub fn print_task_table<'a, F>(
        &mut self,
        tasks: &[Task],
        reminder_for: F,
        now: DateTime<Utc>,
        tz: &Tz,
    ) -> anyhow::Result<()>
    where
        F: Fn(TaskId) -> Option<&'a ReminderHandle>,
    {
        let mut out = io::stdout().lock();

        if tasks.is_empty() {
            writeln!(out, "No tasks yet.")?;
            return Ok(());
        }

        let headers = vec![
            "ID".to_string(),
            "Due".to_string(),
            "Title".to_string(),
            "Reminder".to_string(),
        ];

        let mut rows = Vec::with_capacity(tasks.len());

        for task in tasks {
            let id = self.paint(&short_id(task.id), "33");

            let due = due_label(task);
            let due = if task.is_overdue(now, tz) {
                self.paint(&due, "31")
            } else {
                due
            };

            let reminder = reminder_for(task.id)
                .map(|_| "armed".to_string())
                .unwrap_or_default();

            rows.push(vec![id, due, task.title.clone(), reminder]);
        }

        write_table(&mut out, headers, rows)?;
        Ok(())
    }

    #[tracing::instrument(skip(self, task, reminder, now, tz))]
    pub fn print_task_info(
        &mut self,
        task: &Task,
        reminder: Option<&ReminderHandle>,
        now: DateTime<Utc>,
        tz: &Tz,
    ) -> anyhow::Result<()> {
        let mut out = io::stdout().lock();

        writeln!(out, "id          {}", task.id)?;
        writeln!(out, "title       {}", task.title)?;
        writeln!(
            out,
            "description {}",
            task.description.clone().unwrap_or_default()
        )?;

        let due = due_label(task);
        let due = if task.is_overdue(now, tz) {
            format!("{} {}", due, self.paint("(overdue)", "31"))
        } else {
            due
        };
        writeln!(out, "due         {due}")?;

        if let Some(handle) = reminder {
            writeln!(out, "reminder    {handle}")?;
        }
        writeln!(
            out,
            "created     {}",
            task.created_at.with_timezone(tz).format("%Y-%m-%d %H:%M")
        )?;
        writeln!(
            out,
            "updated     {}",
            task.updated_at.with_timezone(tz).format("%Y-%m-%d %H:%M")
        )?;

        Ok(())
    }

    #[tracing::instrument(skip(self, reminders, tz))]
    pub fn print_reminders(&mut self, reminders: &[Reminder], tz: &Tz) -> anyhow::Result<()> {
        let mut out = io::stdout().lock();

        if reminders.is_empty() {
            writeln!(out, "No reminders scheduled.")?;
            return Ok(());
        }

        let headers = vec![
            "Handle".to_string(),
            "Task".to_string(),
            "Fires".to_string(),
            "Body".to_string(),
        ];
        let rows = reminders
            .iter()
            .map(|reminder| {
                let local = reminder.fire_at.with_timezone(tz);
                vec![
                    self.paint(reminder.handle.as_str(), "33"),
                    short_id(reminder.task_id),
                    format!(
                        "{} {}",
                        format_due_date(local.date_naive()),
                        format_due_time(local.time())
                    ),
                    reminder.body.clone(),
                ]
            })
            .collect();

        write_table(&mut out, headers, rows)?;
        Ok(())
    }

    fn paint(&self, text: &str, code: &str) -> String {
        if !self.color || !io::stdout().is_terminal() {
            return text.to_string();
        }
        format!("\x1b[{code}m{text}\x1b[0m")
    }
}

pub fn short_id(id: TaskId) -> String {
    id.simple().to_string()[..SHORT_ID_LEN].to_string()
}

/// `Jan 5, 2025 at 9:00 AM`, with either half omitted when unset.
pub fn due_label(task: &Task) -> String {
    match (task.due_date, task.due_time) {
        (Some(date), Some(time)) => {
            format!("{} at {}", format_due_date(date), format_due_time(time))
        }
        (Some(date), None) => format_due_date(date),
        (None, Some(time)) => format_due_time(time),
        (None, None) => String::new(),
    }
}

fn write_table<W: Write>(
    mut writer: W,
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
) -> anyhow::Result<()> {
    let column_count = headers.len();
    let mut widths = vec![0usize; column_count];

    for (idx, header) in headers.iter().enumerate() {
        widths[idx] = widths[idx].max(UnicodeWidthStr::width(header.as_str()));
    }

    for row in &rows {
        for (idx, cell) in row.iter().enumerate() {
            widths[idx] = widths[idx].max(UnicodeWidthStr::width(strip_ansi(cell).as_str()));
        }
    }

    for idx in 0..column_count {
        write!(writer, "{:width$} ", headers[idx], width = widths[idx])?;
    }
    writeln!(writer)?;

    for idx in 0..column_count {
        write!(writer, "{:-<width$} ", "", width = widths[idx])?;
    }
    writeln!(writer)?;

    for row in rows {
        for idx in 0..column_count {
            let cell = &row[idx];
            let visible_width = UnicodeWidthStr::width(strip_ansi(cell).as_str());
            let padding = widths[idx].saturating_sub(visible_width);
            write!(writer, "{}{} ", cell, " ".repeat(padding))?;
        }
        writeln!(writer)?;
    }

    Ok(())
}

fn strip_ansi(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut escaped = false;

    for ch in s.chars() {
        if escaped {
            if ch == 'm' {
                escaped = false;
            }
            continue;
        }

        if ch == '\x1b' {
            escaped = true;
            continue;
        }

        out.push(ch);
    }

    out
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, NaiveTime, Utc};
    use uuid::Uuid;

    use super::{due_label, short_id, write_table};
    use crate::task::Task;

    #[test]
    fn due_label_handles_partial_due() {
        let now = Utc::now();
        let mut task = Task {
            id: Uuid::new_v4(),
            title: "Call mom".to_string(),
            description: None,
            due_date: NaiveDate::from_ymd_opt(2025, 1, 5),
            due_time: NaiveTime::from_hms_opt(9, 0, 0),
            user_id: Uuid::new_v4(),
            created_at: now,
            updated_at: now,
        };
        assert_eq!(due_label(&task), "Jan 5, 2025 at 9:00 AM");

        task.due_time = None;
        assert_eq!(due_label(&task), "Jan 5, 2025");

        task.due_date = None;
        assert_eq!(due_label(&task), "");
    }

    #[test]
    fn table_pads_by_visible_width() {
        let mut out = Vec::new();
        write_table(
            &mut out,
            vec!["ID".to_string(), "Title".to_string()],
            vec![vec!["\x1b[33mab\x1b[0m".to_string(), "Käse".to_string()]],
        )
        .expect("table");
        let text = String::from_utf8(out).expect("utf8");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "ID Title ");
        assert_eq!(lines[2], "\x1b[33mab\x1b[0m Käse  ");
    }

    #[test]
    fn short_id_is_a_prefix() {
        let id = Uuid::new_v4();
        assert!(id.simple().to_string().starts_with(&short_id(id)));
        assert_eq!(short_id(id).len(), 8);
    }
}
