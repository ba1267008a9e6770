use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use diaryx_sync::{Resolution, StoreKind};

#[derive(Parser)]
#[command(name = "diaryx-sync")]
#[command(about = "Sync Diaryx workspaces with a sync server", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Config file to use instead of the default sync.toml
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Sync server URL, overriding the config for this run
    #[arg(long, global = true)]
    pub server: Option<String>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Manage the workspace registry
    #[command(alias = "ws")]
    Workspaces {
        #[command(subcommand)]
        command: WorkspaceCommands,
    },

    /// Replace local content with the server's copy of a workspace
    Download {
        /// Server workspace id
        id: String,

        /// Storage medium if the workspace is new on this device
        #[arg(long, value_enum)]
        storage: Option<StorageArg>,
    },

    /// Push a workspace to the server and start syncing it
    Upload {
        /// Workspace id or name (defaults to the active workspace)
        workspace: Option<String>,

        /// Keep server files the upload lacks instead of replacing them
        #[arg(long)]
        merge: bool,
    },

    /// Create a workspace locally and on the server
    Create {
        /// Workspace name
        name: String,

        /// Storage medium for the new workspace
        #[arg(long, value_enum)]
        storage: Option<StorageArg>,
    },

    /// Seed a new synced workspace from a zip archive
    Import {
        /// Workspace name
        name: String,

        /// Archive to import
        archive: PathBuf,
    },

    /// Write a snapshot archive of a workspace
    Export {
        /// Output zip file
        output: PathBuf,

        /// Workspace id or name (defaults to the active workspace)
        workspace: Option<String>,

        /// Only entries visible to this audience
        #[arg(short, long)]
        audience: Option<String>,

        /// Overwrite an existing output file
        #[arg(short, long)]
        force: bool,
    },

    /// Reconnect a synced workspace and report conflicts
    Sync {
        /// Workspace id or name (defaults to the active workspace)
        workspace: Option<String>,

        /// Resolve every open conflict this way
        #[arg(long, value_enum)]
        resolve: Option<ResolveArg>,

        /// Keep syncing until interrupted
        #[arg(short, long)]
        watch: bool,
    },

    /// Show configuration, server health and the active workspace
    Status,

    /// Show or change the sync configuration
    Config {
        /// Sync server URL
        #[arg(long)]
        set_server: Option<String>,

        /// Bearer token for the sync server
        #[arg(long)]
        token: Option<String>,

        /// Directory holding workspace storage
        #[arg(long)]
        workspaces_dir: Option<PathBuf>,

        /// Print the configuration as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
pub enum WorkspaceCommands {
    /// List registered workspaces
    List {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Create a local-only workspace
    Create {
        /// Workspace name
        name: String,

        /// Storage medium
        #[arg(long, value_enum)]
        storage: Option<StorageArg>,
    },

    /// Rename a workspace, on the server too if it syncs
    Rename {
        /// Workspace id or name
        workspace: String,

        /// New name
        name: String,
    },

    /// Forget a workspace. Its files are left in place
    Remove {
        /// Workspace id or name
        workspace: String,
    },

    /// Make a workspace the active one
    Activate {
        /// Workspace id or name
        workspace: String,
    },
}

/// Storage medium for new workspaces.
#[derive(Clone, Copy, ValueEnum)]
pub enum StorageArg {
    /// Files in a directory
    Native,
    /// A single SQLite database
    Sqlite,
}

impl From<StorageArg> for StoreKind {
    fn from(arg: StorageArg) -> Self {
        match arg {
            StorageArg::Native => StoreKind::Native,
            StorageArg::Sqlite => StoreKind::Sqlite,
        }
    }
}

/// How `sync --resolve` settles conflicts.
#[derive(Clone, Copy, ValueEnum)]
pub enum ResolveArg {
    /// Whatever is proposed for each conflict
    Proposed,
    /// Keep the local version
    Local,
    /// Keep the server version
    Remote,
    /// Keep both versions
    Both,
}

impl ResolveArg {
    /// The resolution to apply, given the proposed one.
    pub fn pick(self, proposed: Resolution) -> Resolution {
        match self {
            ResolveArg::Proposed => proposed,
            ResolveArg::Local => Resolution::Local,
            ResolveArg::Remote => Resolution::Remote,
            ResolveArg::Both => Resolution::Both,
        }
    }
}
