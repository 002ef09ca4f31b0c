use std::io::IsTerminal;
use std::path::PathBuf;

use anyhow::anyhow;
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone)]
pub struct KeyVal {
    pub key: String,
    pub value: String,
}

impl std::str::FromStr for KeyVal {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (k, v) = s
            .split_once('=')
            .ok_or_else(|| anyhow!("expected KEY=VALUE, got: {s}"))?;
        Ok(Self {
            key: k.trim().to_string(),
            value: v.trim().to_string(),
        })
    }
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "duedo",
    version,
    about = "duedo: to-do list with due-time reminders",
    disable_help_subcommand = true
)]
pub struct GlobalCli {
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[arg(short = 'q', long = "quiet", action = ArgAction::Count, global = true)]
    pub quiet: u8,

    #[arg(
        long = "rc",
        value_parser = clap::builder::ValueParser::new(|s: &str| s.parse::<KeyVal>()),
        action = ArgAction::Append,
        global = true
    )]
    pub rc_overrides: Vec<KeyVal>,

    #[arg(long = "config", global = true)]
    pub config: Option<PathBuf>,

    #[arg(long = "data", global = true)]
    pub data: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// List your tasks, newest first (default).
    List,
    /// Show one task.
    Info { id: String },
    /// Create a task.
    Add(AddArgs),
    /// Change fields of a task.
    Edit(EditArgs),
    /// Delete a task.
    Delete {
        id: String,
        /// Skip the confirmation prompt.
        #[arg(short = 'y', long = "yes")]
        yes: bool,
    },
    /// Manage reminders.
    #[command(subcommand)]
    Remind(RemindCommand),
    /// Remember a user identity for this data directory.
    SignIn {
        #[arg(long = "user-id")]
        user_id: String,
        #[arg(long = "email")]
        email: Option<String>,
    },
    SignOut,
    Whoami,
    /// Print the effective configuration.
    Config,
}

#[derive(Args, Debug, Clone)]
pub struct AddArgs {
    pub title: String,
    #[arg(long = "description", short = 'd')]
    pub description: Option<String>,
    /// YYYY-MM-DD, today, tomorrow or +Nd.
    #[arg(long = "due-date")]
    pub due_date: Option<String>,
    /// HH:MM or h:mm am/pm.
    #[arg(long = "due-time")]
    pub due_time: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct EditArgs {
    pub id: String,
    #[arg(long = "title")]
    pub title: Option<String>,
    #[arg(long = "description", short = 'd', conflicts_with = "clear_description")]
    pub description: Option<String>,
    #[arg(long = "clear-description")]
    pub clear_description: bool,
    #[arg(long = "due-date", conflicts_with = "clear_due_date")]
    pub due_date: Option<String>,
    #[arg(long = "clear-due-date")]
    pub clear_due_date: bool,
    #[arg(long = "due-time", conflicts_with = "clear_due_time")]
    pub due_time: Option<String>,
    #[arg(long = "clear-due-time")]
    pub clear_due_time: bool,
}

#[derive(Subcommand, Debug, Clone)]
pub enum RemindCommand {
    /// Ask for notification permission.
    Permission,
    /// List armed reminders for your tasks.
    List {
        /// Include every user's reminders in this data directory.
        #[arg(long = "all-users")]
        all_users: bool,
    },
    /// Cancel one reminder by handle.
    Cancel { handle: String },
    /// Cancel the reminders for your tasks.
    CancelAll {
        /// Cancel every user's reminders in this data directory.
        #[arg(long = "all-users")]
        all_users: bool,
    },
    /// Deliver due reminders until interrupted.
    Run {
        #[arg(long = "interval-secs", default_value_t = 30)]
        interval_secs: u64,
        /// Deliver what is due now and exit.
        #[arg(long = "once")]
        once: bool,
    },
}

impl RemindCommand {
    /// Whether the command only touches the signed-in user's reminders.
    pub fn is_user_scoped(&self) -> bool {
        matches!(
            self,
            Self::List { all_users: false } | Self::CancelAll { all_users: false }
        )
    }
}

pub fn init_tracing(verbose: u8, quiet: u8) -> anyhow::Result<()> {
    let default_level = if quiet >= 2 {
        "error"
    } else if quiet == 1 {
        "warn"
    } else if verbose >= 3 {
        "trace"
    } else if verbose == 2 {
        "debug"
    } else if verbose == 1 {
        "info"
    } else {
        "warn"
    };

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .map_err(|e| anyhow!("invalid RUST_LOG / log filter: {e}"))?;

    let init_result = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_level(true)
        .with_thread_ids(true)
        .with_ansi(std::io::stderr().is_terminal())
        .try_init();

    if let Err(err) = init_result {
        debug!(error = %err, "tracing subscriber already set, continuing");
    }

    Ok(())
}
