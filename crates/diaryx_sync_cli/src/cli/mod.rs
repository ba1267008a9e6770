//! Command handlers for `diaryx-sync`.

/// Clap argument definitions
mod args;

/// `download`, `upload`, `create`, `import` and `sync` commands
mod bootstrap;

/// `config` and `status` commands
mod config;

/// `export` command
mod export;

/// Terminal progress display
mod progress;

/// `workspaces` subcommands
mod workspace;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use diaryx_sync::bootstrap::StorageProvider;
use diaryx_sync::progress::ProgressReporter;
use diaryx_sync::remote::{HttpRemote, RemoteApi, RemoteWorkspace, SnapshotImportMode};
use diaryx_sync::store::BoxFuture;
use diaryx_sync::transport::TungsteniteConnector;
use diaryx_sync::{
    BootstrapOptions, BootstrapOrchestrator, DiaryxError, Result, StorageRoot, SyncConfig,
    Workspace, WorkspaceRegistry,
};

pub use args::Cli;
use args::Commands;

/// Everything a handler needs, resolved once from the flags and config file.
pub struct CliContext {
    /// Effective configuration (file plus `--server`)
    pub config: SyncConfig,
    /// Config file given with `--config`
    pub config_path: Option<PathBuf>,
}

impl CliContext {
    /// Load the config and apply command-line overrides.
    pub fn load(config_path: Option<PathBuf>, server: Option<String>) -> Result<Self> {
        let mut config = match &config_path {
            Some(path) => SyncConfig::load_path(path)?,
            None => SyncConfig::load()?,
        };
        if server.is_some() {
            config.server_url = server;
        }
        Ok(Self {
            config,
            config_path,
        })
    }

    /// Write `config` back to where it was loaded from.
    pub fn save_config(&self, config: &SyncConfig) -> Result<()> {
        match &self.config_path {
            Some(path) => config.save_path(path),
            None => config.save(),
        }
    }

    /// Open the workspace registry.
    pub fn registry(&self) -> Result<Arc<WorkspaceRegistry>> {
        Ok(Arc::new(WorkspaceRegistry::open(
            self.config.resolved_registry_path()?,
        )?))
    }

    /// Storage for the configured workspaces directory.
    pub fn storage(&self) -> Result<Arc<dyn StorageProvider>> {
        Ok(Arc::new(StorageRoot::from_config(&self.config)?))
    }

    /// HTTP client for the configured server, or [`Offline`] without one.
    pub fn remote(&self) -> Arc<dyn RemoteApi> {
        match HttpRemote::from_config(&self.config) {
            Ok(remote) => Arc::new(remote),
            Err(_) => Arc::new(Offline),
        }
    }

    /// Orchestrator wired to the real server, registry and disk.
    pub fn orchestrator(&self, options: BootstrapOptions) -> Result<BootstrapOrchestrator> {
        Ok(BootstrapOrchestrator::new(
            self.registry()?,
            self.remote(),
            Arc::new(TungsteniteConnector),
            self.storage()?,
            self.config.clone(),
        )
        .with_options(options))
    }
}

/// Stand-in server for runs without a configured `server_url`.
///
/// Local-only commands never reach it; everything else fails with a hint.
pub struct Offline;

impl Offline {
    fn error() -> DiaryxError {
        DiaryxError::InvalidState(
            "no sync server configured (use --server or `diaryx-sync config --set-server`)".into(),
        )
    }
}

impl RemoteApi for Offline {
    fn health(&self) -> BoxFuture<'_, Result<bool>> {
        Box::pin(async { Err(Self::error()) })
    }

    fn list_workspaces(&self) -> BoxFuture<'_, Result<Vec<RemoteWorkspace>>> {
        Box::pin(async { Err(Self::error()) })
    }

    fn create_workspace<'a>(&'a self, _name: &'a str) -> BoxFuture<'a, Result<RemoteWorkspace>> {
        Box::pin(async { Err(Self::error()) })
    }

    fn rename_workspace<'a>(
        &'a self,
        _id: &'a str,
        _name: &'a str,
    ) -> BoxFuture<'a, Result<RemoteWorkspace>> {
        Box::pin(async { Err(Self::error()) })
    }

    fn delete_workspace<'a>(&'a self, _id: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async { Err(Self::error()) })
    }

    fn download_snapshot<'a>(
        &'a self,
        _id: &'a str,
        _progress: &'a ProgressReporter,
    ) -> BoxFuture<'a, Result<Vec<u8>>> {
        Box::pin(async { Err(Self::error()) })
    }

    fn upload_snapshot<'a>(
        &'a self,
        _id: &'a str,
        _archive: Vec<u8>,
        _mode: SnapshotImportMode,
        _progress: &'a ProgressReporter,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async { Err(Self::error()) })
    }
}

/// Find a workspace by id, then by name. `None` means the active workspace.
pub fn resolve_workspace(registry: &WorkspaceRegistry, query: Option<&str>) -> Result<Workspace> {
    let Some(query) = query else {
        return registry
            .active()?
            .ok_or_else(|| DiaryxError::InvalidState("no active workspace".into()));
    };
    if let Some(workspace) = registry.get(query)? {
        return Ok(workspace);
    }
    let mut named: Vec<Workspace> = registry
        .list()?
        .into_iter()
        .filter(|w| w.name == query)
        .collect();
    match named.len() {
        0 => Err(DiaryxError::WorkspaceNotFound(query.to_string())),
        1 => Ok(named.remove(0)),
        n => Err(DiaryxError::InvalidState(format!(
            "{} workspaces are named '{}', use an id",
            n, query
        ))),
    }
}

/// Print a failed command's error. Returns `false` for the exit status.
pub fn report_error(context: &str, err: &DiaryxError) -> bool {
    eprintln!("✗ {}: {}", context, err);
    log::debug!("{:?}", err);
    false
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default))
        .format_timestamp(None)
        .init();
}

/// Main entry point for the CLI
pub fn run_cli() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let ctx = match CliContext::load(cli.config, cli.server) {
        Ok(ctx) => ctx,
        Err(e) => {
            eprintln!("✗ Error loading config: {}", e);
            std::process::exit(1);
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("✗ Failed to start async runtime: {}", e);
            std::process::exit(1);
        }
    };

    let command = cli.command;
    let success = runtime.block_on(async {
        match command {
            Commands::Workspaces { command } => {
                workspace::handle_workspace_command(&ctx, command).await
            }

            Commands::Download { id, storage } => {
                bootstrap::handle_download(&ctx, &id, storage).await
            }

            Commands::Upload { workspace, merge } => {
                bootstrap::handle_upload(&ctx, workspace.as_deref(), merge).await
            }

            Commands::Create { name, storage } => {
                bootstrap::handle_create(&ctx, &name, storage).await
            }

            Commands::Import { name, archive } => {
                bootstrap::handle_import(&ctx, &name, &archive).await
            }

            Commands::Export {
                output,
                workspace,
                audience,
                force,
            } => export::handle_export(&ctx, &output, workspace.as_deref(), audience, force).await,

            Commands::Sync {
                workspace,
                resolve,
                watch,
            } => bootstrap::handle_sync(&ctx, workspace.as_deref(), resolve, watch).await,

            Commands::Status => config::handle_status(&ctx).await,

            Commands::Config {
                set_server,
                token,
                workspaces_dir,
                json,
            } => config::handle_config(&ctx, set_server, token, workspaces_dir, json),
        }
    });

    if !success {
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use diaryx_sync::StoreKind;

    #[test]
    fn test_resolve_workspace_by_id_name_and_active() {
        let registry = WorkspaceRegistry::in_memory().unwrap();
        let notes = registry.create("Notes", StoreKind::Memory).unwrap();
        let trips = registry.create("Trips", StoreKind::Memory).unwrap();

        assert_eq!(resolve_workspace(&registry, Some(&notes.id)).unwrap().id, notes.id);
        assert_eq!(resolve_workspace(&registry, Some("Trips")).unwrap().id, trips.id);
        assert!(matches!(
            resolve_workspace(&registry, Some("Missing")),
            Err(DiaryxError::WorkspaceNotFound(_))
        ));

        registry.set_active(&trips.id).unwrap();
        assert_eq!(resolve_workspace(&registry, None).unwrap().id, trips.id);
    }

    #[test]
    fn test_ambiguous_name_needs_an_id() {
        let registry = WorkspaceRegistry::in_memory().unwrap();
        registry.create("Notes", StoreKind::Memory).unwrap();
        registry.create("Notes", StoreKind::Memory).unwrap();
        assert!(matches!(
            resolve_workspace(&registry, Some("Notes")),
            Err(DiaryxError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_offline_remote_explains_missing_server() {
        let err = Offline.list_workspaces().await.unwrap_err();
        assert!(err.to_string().contains("--server"));
    }

    #[test]
    fn test_server_flag_overrides_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.toml");
        SyncConfig::new("https://from-file.example.com")
            .save_path(&path)
            .unwrap();

        let ctx = CliContext::load(Some(path.clone()), None).unwrap();
        assert_eq!(
            ctx.config.server_url.as_deref(),
            Some("https://from-file.example.com")
        );

        let ctx = CliContext::load(Some(path), Some("http://localhost:3030".into())).unwrap();
        assert_eq!(ctx.config.server_url.as_deref(), Some("http://localhost:3030"));
    }
}
