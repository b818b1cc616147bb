use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use patrol_core::EventKind;

#[derive(Parser)]
#[command(name = "patrol")]
#[command(about = "Run shift-gated patrol sessions from the command line")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[command(flatten)]
    pub global: GlobalArgs,
}

#[derive(Args, Clone, Debug, Default)]
pub struct GlobalArgs {
    /// Optional path to the local mirror database
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,

    /// CLI profile name for store configuration
    #[arg(long, global = true, value_name = "NAME")]
    pub profile: Option<String>,

    /// Guard ID (overrides the profile)
    #[arg(long, global = true, value_name = "ID")]
    pub guard: Option<String>,

    /// Treat the device as disconnected; everything is queued locally
    #[arg(long, global = true)]
    pub offline: bool,

    /// Current latitude reported with lifecycle events
    #[arg(long, global = true, requires = "lng", allow_negative_numbers = true)]
    pub lat: Option<f64>,

    /// Current longitude reported with lifecycle events
    #[arg(long, global = true, requires = "lat", allow_negative_numbers = true)]
    pub lng: Option<f64>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Check whether the guard's shift allows starting a patrol now
    Shift,
    /// Start a patrol session
    Start {
        /// Site being patrolled
        #[arg(long)]
        site: String,
        /// Optional team
        #[arg(long)]
        team: Option<String>,
    },
    /// Record a checkpoint visit
    Checkpoint {
        /// Checkpoint ID
        id: String,
        /// Optional note
        #[arg(long)]
        note: Option<String>,
    },
    /// Record an activity event
    Log {
        /// Event kind (incident-report, observation, location-sample, checkpoint-visit)
        #[arg(long)]
        kind: EventKind,
        /// JSON object payload
        #[arg(long, value_name = "JSON")]
        payload: Option<String>,
    },
    /// End the active patrol
    End,
    /// Cancel the active patrol
    Cancel,
    /// Show session and sync state
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Deliver queued events to the session store
    Sync,
    /// Drop delivered events from the local queue
    ClearSynced,
    /// Keep the session supervised in the foreground until it ends
    Watch,
    /// Generate shell completion scripts
    Completions {
        /// Target shell
        #[arg(value_enum)]
        shell: CompletionShell,
        /// Optional output path (stdout when omitted)
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
    /// Configure CLI profiles
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum CompletionShell {
    Bash,
    Zsh,
    Fish,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Initialize or update profile config
    Init {
        /// Session store base URL
        #[arg(long, value_name = "URL")]
        store_url: Option<String>,
        /// Session store public API key
        #[arg(long, value_name = "KEY")]
        anon_key: Option<String>,
        /// Signed-in guard access token
        #[arg(long, value_name = "TOKEN")]
        access_token: Option<String>,
        /// Guard ID used by default
        #[arg(long = "guard-id", value_name = "ID")]
        guard_id: Option<String>,
        /// Keep current active profile instead of activating this one
        #[arg(long)]
        no_activate: bool,
    },
}
