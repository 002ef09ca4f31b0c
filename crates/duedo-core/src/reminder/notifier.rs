use std::io::{self, IsTerminal, Write};

use chrono_tz::Tz;
use tracing::info;

use crate::datetime::{format_due_date, format_due_time};
use crate::reminder::Reminder;

/// Displays a reminder to the user once it fires.
pub trait Notifier: Send + Sync {
    fn deliver(&self, reminder: &Reminder) -> anyhow::Result<()>;
}

/// Writes fired reminders to stderr, ringing the bell when attached to a
/// terminal.
#[derive(Debug, Clone)]
pub struct TerminalNotifier {
    timezone: Tz,
}

impl TerminalNotifier {
    pub fn new(timezone: Tz) -> Self {
        Self { timezone }
    }
}

impl Notifier for TerminalNotifier {
    fn deliver(&self, reminder: &Reminder) -> anyhow::Result<()> {
        let local = reminder.fire_at.with_timezone(&self.timezone);
        let due_label = format!(
            "{} {}",
            format_due_date(local.date_naive()),
            format_due_time(local.time())
        );
        info!(
            handle = %reminder.handle,
            task_id = %reminder.task_id,
            due = %due_label,
            "delivering reminder"
        );

        let mut err = io::stderr().lock();
        let bell = if err.is_terminal() { "\x07" } else { "" };
        writeln!(err, "{bell}{}: {} (due {due_label})", reminder.title, reminder.body)?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use parking_lot::Mutex;

    use super::Notifier;
    use crate::reminder::Reminder;

    #[derive(Debug, Default)]
    pub(crate) struct RecordingNotifier {
        pub delivered: Mutex<Vec<Reminder>>,
    }

    impl Notifier for RecordingNotifier {
        fn deliver(&self, reminder: &Reminder) -> anyhow::Result<()> {
            self.delivered.lock().push(reminder.clone());
            Ok(())
        }
    }
}
