use std::path::PathBuf;

use clap::{Parser, Subcommand};
use herdsync_core::models::{ConflictChoice, EntityKind};

#[derive(Parser)]
#[command(name = "herdsync")]
#[command(about = "Keep farm records in sync from the command line")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Optional path to local database file
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,

    /// Engine config file (JSON); defaults plus environment when omitted
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a record locally and queue it for sync
    #[command(alias = "new")]
    Add {
        /// Record kind (animal, feed, diet_plan, milk_log, ...)
        kind: EntityKind,
        /// Field assignments: name=Bessie weight_kg=410
        fields: Vec<String>,
        /// Full payload as a JSON object
        #[arg(long, value_name = "JSON")]
        json: Option<String>,
    },
    /// Change fields of an existing record
    Edit {
        kind: EntityKind,
        /// Record ID
        id: String,
        /// Field assignments: weight_kg=415
        fields: Vec<String>,
        /// Changed fields as a JSON object
        #[arg(long, value_name = "JSON")]
        json: Option<String>,
    },
    /// Delete a record
    Delete { kind: EntityKind, id: String },
    /// List records of a kind
    List {
        kind: EntityKind,
        /// Number of records to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
        /// Only records with local changes not yet accepted
        #[arg(long)]
        unsynced: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show one record
    Show {
        kind: EntityKind,
        id: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Push queued mutations to the server
    Sync {
        /// Output the drain report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Replace local records of a kind with the server's copy
    Pull { kind: EntityKind },
    /// Show pending, conflict and attention counts
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List sync conflicts
    Conflicts {
        /// Include resolved conflicts
        #[arg(long)]
        all: bool,
        /// Number of conflicts to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Resolve one conflict, or all open conflicts
    Resolve {
        /// Conflict ID (omit with --all)
        id: Option<i64>,
        /// Which side wins: local or remote
        #[arg(long, value_name = "SIDE")]
        keep: ConflictChoice,
        /// Resolve every open conflict
        #[arg(long, conflicts_with = "id")]
        all: bool,
    },
    /// Show sync history, newest first
    History {
        /// Number of entries to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
        /// Entries to skip
        #[arg(long, default_value = "0")]
        offset: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Inspect and manage the mutation queue
    Queue {
        #[command(subcommand)]
        command: Option<QueueCommands>,
    },
    /// Stored HTTP requests awaiting replay
    Replay {
        #[command(subcommand)]
        command: Option<ReplayCommands>,
    },
    /// Clear all local user data (records, queue, conflicts, history)
    Logout {
        /// Skip the pending-changes check
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand)]
pub enum QueueCommands {
    /// List queued mutations
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Make a parked item eligible for the next sync
    Retry {
        /// Queue item ID (omit with --all)
        id: Option<i64>,
        /// Retry every item needing attention
        #[arg(long, conflicts_with = "id")]
        all: bool,
    },
    /// Drop a queued mutation and roll back its local effect
    Discard { id: i64 },
}

#[derive(Subcommand)]
pub enum ReplayCommands {
    /// List stored requests
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Re-send stored requests now
    Run,
    /// Send a request, storing it if the server is unreachable
    Send {
        /// HTTP method (POST, PUT, PATCH, DELETE)
        method: String,
        /// Path under the API base URL, or an absolute URL
        target: String,
        /// JSON body
        #[arg(long, value_name = "JSON")]
        body: Option<String>,
    },
}
