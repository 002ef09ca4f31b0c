use std::io::{self, BufRead, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow};
use chrono::Utc;
use chrono_tz::Tz;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::cli::{AddArgs, Command, EditArgs, RemindCommand};
use crate::config::Config;
use crate::datetime::{local_today, parse_due_date, parse_due_time, resolve_timezone};
use crate::error::StoreError;
use crate::reminder::{
    BackendKind, DEFAULT_REMINDER_TITLE, ReminderHandle, ReminderScheduler, TerminalNotifier,
    probe_backend,
};
use crate::render::{Renderer, short_id};
use crate::session::{Session, SessionUser};
use crate::state::TaskState;
use crate::store::open_store;
use crate::task::{Task, TaskDraft, TaskPatch};

const SAVE_FAILED: &str = "Failed to save task";
const DELETE_FAILED: &str = "Failed to delete task";
const LOAD_FAILED: &str = "Failed to load tasks";
const SECRET_KEYS: &[&str] = &["store.anon_key", "auth.access_token"];

#[instrument(skip(cfg, data_dir, renderer, command))]
pub async fn dispatch(
    cfg: &Config,
    data_dir: &Path,
    renderer: &mut Renderer,
    command: Command,
) -> anyhow::Result<()> {
    if matches!(command, Command::Config) {
        return cmd_show_config(cfg);
    }

    let tz = resolve_timezone(cfg.get("timezone").as_deref());
    let session = Session::load(cfg, data_dir)?;
    debug!(command = ?command, timezone = %tz, "dispatching command");

    match command {
        Command::SignIn { user_id, email } => return cmd_sign_in(&session, &user_id, email),
        Command::SignOut => return cmd_sign_out(&session),
        Command::Whoami => return cmd_whoami(&session),
        _ => {}
    }

    let scheduler = build_scheduler(cfg, data_dir, tz)?;

    let command = match command {
        Command::Remind(remind) if !remind.is_user_scoped() => {
            return cmd_remind(&scheduler, renderer, remind).await;
        }
        other => other,
    };

    let user = session
        .current_user()
        .ok_or_else(|| anyhow!("not signed in; run `duedo sign-in --user-id <uuid>` first"))?;
    let store = open_store(cfg, data_dir, Some(user.id))?;
    let mut state = TaskState::new(store, scheduler);
    state.on_user_changed(Some(user)).await.map_err(|err| {
        debug!(error = %err, "initial load failed");
        user_facing(&err, LOAD_FAILED)
    })?;

    match command {
        Command::List => cmd_list(&state, renderer),
        Command::Info { id } => cmd_info(&state, renderer, &id),
        Command::Add(args) => cmd_add(&mut state, args).await,
        Command::Edit(args) => cmd_edit(&mut state, args).await,
        Command::Delete { id, yes } => cmd_delete(&mut state, &id, yes).await,
        Command::Remind(remind) => cmd_remind_own(&mut state, renderer, remind).await,
        Command::SignIn { .. }
        | Command::SignOut
        | Command::Whoami
        | Command::Config => Err(anyhow!("command already handled")),
    }
}

fn build_scheduler(cfg: &Config, data_dir: &Path, tz: Tz) -> anyhow::Result<ReminderScheduler> {
    let notifier = Arc::new(TerminalNotifier::new(tz));
    let backend = probe_backend(cfg, data_dir, notifier)?;
    let title = cfg
        .get("reminders.title")
        .unwrap_or_else(|| DEFAULT_REMINDER_TITLE.to_string());
    Ok(ReminderScheduler::new(backend, tz).with_title(title))
}

fn cmd_list(state: &TaskState, renderer: &mut Renderer) -> anyhow::Result<()> {
    renderer.print_task_table(
        state.tasks(),
        |id| state.reminder_for(id),
        Utc::now(),
        state.scheduler().timezone(),
    )
}

fn cmd_info(state: &TaskState, renderer: &mut Renderer, raw_id: &str) -> anyhow::Result<()> {
    let task = resolve_task(state.tasks(), raw_id)?;
    renderer.print_task_info(
        task,
        state.reminder_for(task.id),
        Utc::now(),
        state.scheduler().timezone(),
    )
}

#[instrument(skip(state, args))]
async fn cmd_add(state: &mut TaskState, args: AddArgs) -> anyhow::Result<()> {
    let today = local_today(Utc::now(), state.scheduler().timezone());
    let due_date = args
        .due_date
        .as_deref()
        .map(|raw| parse_due_date(raw, today))
        .transpose()?;
    let due_time = args.due_time.as_deref().map(parse_due_time).transpose()?;

    let mut draft = TaskDraft::new(args.title).with_due(due_date, due_time);
    if let Some(description) = args.description.filter(|d| !d.trim().is_empty()) {
        draft = draft.with_description(description);
    }

    if draft.has_due_moment() {
        ensure_permission(state.scheduler()).await;
    }

    let task = state
        .add(draft)
        .await
        .map_err(|err| {
            debug!(error = %err, "add failed");
            user_facing(&err, SAVE_FAILED)
        })?
        .ok_or_else(|| anyhow!("not signed in"))?;

    info!(id = %task.id, "task created");
    println!("Created task {}.", short_id(task.id));
    report_reminder(state, &task);
    Ok(())
}

#[instrument(skip(state, args))]
async fn cmd_edit(state: &mut TaskState, args: EditArgs) -> anyhow::Result<()> {
    let id = resolve_task(state.tasks(), &args.id)?.id;
    let today = local_today(Utc::now(), state.scheduler().timezone());

    let mut patch = TaskPatch {
        title: args.title,
        ..TaskPatch::default()
    };
    if args.clear_description {
        patch.description = Some(None);
    } else if let Some(description) = args.description {
        patch.description = Some(Some(description).filter(|d| !d.trim().is_empty()));
    }
    if args.clear_due_date {
        patch.due_date = Some(None);
    } else if let Some(raw) = args.due_date.as_deref() {
        patch.due_date = Some(Some(parse_due_date(raw, today)?));
    }
    if args.clear_due_time {
        patch.due_time = Some(None);
    } else if let Some(raw) = args.due_time.as_deref() {
        patch.due_time = Some(Some(parse_due_time(raw)?));
    }

    if patch.is_empty() {
        return Err(anyhow!("nothing to change; pass at least one field flag"));
    }
    if patch.touches_due() {
        ensure_permission(state.scheduler()).await;
    }

    let task = state.update(id, patch).await.map_err(|err| {
        debug!(error = %err, "update failed");
        user_facing(&err, SAVE_FAILED)
    })?;

    println!("Updated task {}.", short_id(task.id));
    report_reminder(state, &task);
    Ok(())
}

#[instrument(skip(state))]
async fn cmd_delete(state: &mut TaskState, raw_id: &str, yes: bool) -> anyhow::Result<()> {
    let task = resolve_task(state.tasks(), raw_id)?.clone();

    if !yes && !confirm(&format!("Delete \"{}\"? [y/N] ", task.title))? {
        println!("Nothing deleted.");
        return Ok(());
    }

    state.delete(task.id).await.map_err(|err| {
        debug!(error = %err, "delete failed");
        user_facing(&err, DELETE_FAILED)
    })?;

    println!("Deleted task {}.", short_id(task.id));
    Ok(())
}

#[instrument(skip(scheduler, renderer, command))]
async fn cmd_remind(
    scheduler: &ReminderScheduler,
    renderer: &mut Renderer,
    command: RemindCommand,
) -> anyhow::Result<()> {
    match command {
        RemindCommand::Permission => {
            let granted = scheduler.request_permission().await;
            println!(
                "Notifications {} ({} reminders).",
                if granted { "enabled" } else { "disabled" },
                scheduler.backend().kind()
            );
            Ok(())
        }
        RemindCommand::List { .. } => {
            if scheduler.backend().kind() == BackendKind::BestEffort {
                println!("Best-effort reminders cannot be listed.");
                return Ok(());
            }
            let reminders = scheduler.list_scheduled().await;
            renderer.print_reminders(&reminders, scheduler.timezone())
        }
        RemindCommand::Cancel { handle } => {
            scheduler.cancel(&ReminderHandle::new(handle)).await;
            Ok(())
        }
        RemindCommand::CancelAll { .. } => {
            scheduler.cancel_all().await;
            Ok(())
        }
        RemindCommand::Run {
            interval_secs,
            once,
        } => run_delivery_loop(scheduler, interval_secs, once).await,
    }
}

/// `remind list` and `remind cancel-all` without `--all-users`: only the
/// reminders of tasks the signed-in user owns.
async fn cmd_remind_own(
    state: &mut TaskState,
    renderer: &mut Renderer,
    command: RemindCommand,
) -> anyhow::Result<()> {
    match command {
        RemindCommand::List { .. } => {
            if state.scheduler().backend().kind() == BackendKind::BestEffort {
                println!("Best-effort reminders cannot be listed.");
                return Ok(());
            }
            let reminders = state.scheduled_reminders().await;
            renderer.print_reminders(&reminders, state.scheduler().timezone())
        }
        RemindCommand::CancelAll { .. } => {
            let cancelled = state.cancel_reminders().await;
            println!("Cancelled {cancelled} reminder(s).");
            Ok(())
        }
        other => cmd_remind(state.scheduler(), renderer, other).await,
    }
}

async fn run_delivery_loop(
    scheduler: &ReminderScheduler,
    interval_secs: u64,
    once: bool,
) -> anyhow::Result<()> {
    let backend = scheduler.backend();
    if backend.kind() == BackendKind::BestEffort {
        return Err(anyhow!(
            "reminder delivery needs the durable backend; set reminders.backend=durable"
        ));
    }

    if once {
        let delivered = backend.deliver_due(Utc::now()).await?;
        info!(delivered, "delivered due reminders");
        return Ok(());
    }

    let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
    info!(interval_secs, "waiting for reminders; ctrl-c to stop");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match backend.deliver_due(Utc::now()).await {
                    Ok(0) => {}
                    Ok(delivered) => info!(delivered, "delivered due reminders"),
                    Err(err) => warn!(error = %err, "reminder delivery pass failed"),
                }
            }
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed waiting for ctrl_c")?;
                info!("stopping reminder delivery");
                return Ok(());
            }
        }
    }
}

fn cmd_sign_in(session: &Session, raw_id: &str, email: Option<String>) -> anyhow::Result<()> {
    let id = Uuid::parse_str(raw_id.trim()).map_err(|e| anyhow!("invalid user id {raw_id}: {e}"))?;
    let mut user = SessionUser::new(id);
    if let Some(email) = email {
        user = user.with_email(email);
    }
    session.sign_in(user)?;
    println!("Signed in as {id}.");
    Ok(())
}

fn cmd_sign_out(session: &Session) -> anyhow::Result<()> {
    session.sign_out()?;
    println!("Signed out.");
    Ok(())
}

fn cmd_whoami(session: &Session) -> anyhow::Result<()> {
    match session.current_user() {
        Some(user) => match user.email {
            Some(email) => println!("{} <{email}>", user.id),
            None => println!("{}", user.id),
        },
        None => println!("Not signed in."),
    }
    Ok(())
}

fn cmd_show_config(cfg: &Config) -> anyhow::Result<()> {
    let mut entries: Vec<(&String, &String)> = cfg.iter().collect();
    entries.sort();
    for (key, value) in entries {
        if SECRET_KEYS.contains(&key.as_str()) && !value.is_empty() {
            println!("{key}=********");
        } else {
            println!("{key}={value}");
        }
    }
    Ok(())
}

async fn ensure_permission(scheduler: &ReminderScheduler) {
    if !scheduler.request_permission().await {
        println!("Notifications are off; no reminder will be scheduled.");
    }
}

fn report_reminder(state: &TaskState, task: &Task) {
    let Some(handle) = state.reminder_for(task.id) else {
        return;
    };
    match state.scheduler().backend().kind() {
        BackendKind::Durable => {
            println!("Reminder {handle} scheduled; `duedo remind run` delivers it.");
        }
        BackendKind::BestEffort => {
            warn!(handle = %handle, "best-effort reminder is lost when this process exits");
            println!("Reminder {handle} armed for this session only.");
        }
    }
}

/// Transport detail stays in the debug log; only validation messages are
/// meant for the user.
fn user_facing(err: &StoreError, generic: &str) -> anyhow::Error {
    match err {
        StoreError::Validation(message) => anyhow!("{generic}: {message}"),
        _ => anyhow!("{generic}"),
    }
}

/// Full UUID or an unambiguous prefix of one (dashes optional).
pub fn resolve_task<'a>(tasks: &'a [Task], raw: &str) -> anyhow::Result<&'a Task> {
    if let Ok(id) = Uuid::parse_str(raw.trim()) {
        return tasks
            .iter()
            .find(|task| task.id == id)
            .ok_or_else(|| anyhow!("no task with id {id}"));
    }

    let needle = raw.trim().to_ascii_lowercase().replace('-', "");
    if needle.is_empty() {
        return Err(anyhow!("empty task id"));
    }

    let mut matches = tasks
        .iter()
        .filter(|task| task.id.simple().to_string().starts_with(&needle));
    let first = matches
        .next()
        .ok_or_else(|| anyhow!("no task matches {raw}"))?;
    if matches.next().is_some() {
        return Err(anyhow!("task id {raw} is ambiguous; use more characters"));
    }
    Ok(first)
}

fn confirm(prompt: &str) -> anyhow::Result<bool> {
    let mut out = io::stdout().lock();
    write!(out, "{prompt}")?;
    out.flush()?;

    let mut answer = String::new();
    io::stdin()
        .lock()
        .read_line(&mut answer)
        .context("failed reading stdin")?;
    Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}
