use clap::{Args, Parser, Subcommand, ValueEnum};
use rally_proto::{HomeAway, JobAction, JobStatus, Resource};
use rally_sync::fetch::PinKind;
use rally_sync::{ConnectionMode, SyncConfig, Viewpoint};
use std::path::PathBuf;

use crate::logging::{LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "rally",
    about = "Follow live matches and manage the offline write queue",
    author,
    version
)]
pub struct Cli {
    #[command(flatten)]
    pub remote: RemoteArgs,

    #[command(flatten)]
    pub logging: LoggingArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone, Default)]
pub struct RemoteArgs {
    #[arg(
        long,
        global = true,
        env = "RALLY_SERVER_URL",
        help = "Base URL of the scorekeeping server"
    )]
    pub server_url: Option<String>,

    #[arg(
        long,
        global = true,
        env = "RALLY_FEED_URL",
        help = "Base URL of the hosted realtime service"
    )]
    pub feed_url: Option<String>,

    #[arg(
        long,
        global = true,
        env = "RALLY_FEED_REST_URL",
        help = "REST root of the hosted service (for example https://host/rest/v1)"
    )]
    pub feed_rest_url: Option<String>,

    #[arg(
        long,
        global = true,
        env = "RALLY_FEED_API_KEY",
        hide_env_values = true,
        help = "API key for the hosted service"
    )]
    pub feed_api_key: Option<String>,

    #[arg(
        long,
        global = true,
        env = "RALLY_JOB_STORE_PATH",
        value_name = "PATH",
        help = "SQLite file holding the write queue"
    )]
    pub job_store: Option<PathBuf>,
}

impl RemoteArgs {
    /// Flags win over whatever the environment already put in `cfg`.
    pub fn apply(&self, mut cfg: SyncConfig) -> SyncConfig {
        if let Some(url) = &self.server_url {
            cfg.server_url = url.clone();
        }
        if self.feed_url.is_some() {
            cfg.feed_url = self.feed_url.clone();
        }
        if self.feed_rest_url.is_some() {
            cfg.feed_rest_url = self.feed_rest_url.clone();
        }
        if self.feed_api_key.is_some() {
            cfg.feed_api_key = self.feed_api_key.clone();
        }
        if self.job_store.is_some() {
            cfg.job_store_path = self.job_store.clone();
        }
        cfg.normalize()
    }
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        global = true,
        env = "RALLY_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        global = true,
        env = "RALLY_LOG_FILE",
        help = "Write logs to the specified file instead of stderr"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Stream reconciled updates for one match
    Watch(WatchArgs),
    /// Inspect or drive the offline write queue
    #[command(subcommand)]
    Queue(QueueCommand),
    /// Append a write to the queue
    Enqueue(EnqueueArgs),
    /// Flush the last point and close a period, step by step
    ClosePeriod(ClosePeriodArgs),
    /// Check a PIN with the scorekeeping server
    Pin(PinArgs),
    /// List matches known to the scorekeeping server
    Matches,
}

#[derive(Args, Debug)]
pub struct WatchArgs {
    pub match_id: String,

    #[arg(long, help = "auto, feed or socket (defaults to the saved preference)")]
    pub mode: Option<ConnectionMode>,

    #[arg(long, action = clap::ArgAction::SetTrue, help = "Save --mode as the preferred mode")]
    pub remember: bool,

    #[arg(long, value_enum, default_value_t = ViewArg::HomeAway)]
    pub view: ViewArg,
}

#[derive(Clone, Copy, Debug, ValueEnum, PartialEq, Eq)]
pub enum ViewArg {
    HomeAway,
    LeftRight,
    /// Own team is the home team
    Home,
    /// Own team is the away team
    Away,
}

impl ViewArg {
    pub fn viewpoint(self) -> Viewpoint {
        match self {
            ViewArg::HomeAway => Viewpoint::HomeAway,
            ViewArg::LeftRight => Viewpoint::LeftRight,
            ViewArg::Home => Viewpoint::SelfOpponent { me: HomeAway::Home },
            ViewArg::Away => Viewpoint::SelfOpponent { me: HomeAway::Away },
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum QueueCommand {
    /// Counts, aggregate status and indicator
    Status,
    /// Print stored jobs
    List {
        #[arg(long)]
        status: Option<JobStatus>,
    },
    /// Requeue every errored job and drain once
    Retry,
    /// Drain until nothing is pending, or just once
    Drain {
        #[arg(long, action = clap::ArgAction::SetTrue)]
        once: bool,
    },
}

#[derive(Args, Debug)]
pub struct EnqueueArgs {
    /// match, period or event
    pub resource: Resource,
    /// insert or update
    pub action: JobAction,
    /// JSON payload
    pub payload: String,
}

#[derive(Args, Debug)]
pub struct ClosePeriodArgs {
    #[arg(long, help = "Period update as JSON; must carry external_id")]
    pub period: String,

    #[arg(long, help = "Final point event as JSON")]
    pub last_point: Option<String>,

    #[arg(long, help = "Match update as JSON")]
    pub match_update: Option<String>,
}

#[derive(Args, Debug)]
pub struct PinArgs {
    pub pin: String,

    #[arg(long, value_enum, default_value_t = PinArg::Referee)]
    pub kind: PinArg,
}

#[derive(Clone, Copy, Debug, ValueEnum, PartialEq, Eq)]
pub enum PinArg {
    Referee,
    HomeTeam,
    AwayTeam,
}

impl From<PinArg> for PinKind {
    fn from(arg: PinArg) -> Self {
        match arg {
            PinArg::Referee => PinKind::Referee,
            PinArg::HomeTeam => PinKind::HomeTeam,
            PinArg::AwayTeam => PinKind::AwayTeam,
        }
    }
}
