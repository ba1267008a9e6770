//! Bootstrap command handlers.
//!
//! Each handler runs one orchestrator flow with a progress printer attached,
//! reports open conflicts and then winds the session down. `sync --watch`
//! keeps the session alive until Ctrl-C.

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use diaryx_sync::remote::SnapshotImportMode;
use diaryx_sync::transport::BodySyncOptions;
use diaryx_sync::{
    BootstrapOptions, BootstrapOutcome, ConflictRecord, ProgressReporter, Resolution, Result,
    SessionState,
};

use super::args::{ResolveArg, StorageArg};
use super::progress::spawn_printer;
use super::{CliContext, report_error, resolve_workspace};

/// How long queued local changes get to reach the server before exit.
const FLUSH_GRACE: Duration = Duration::from_secs(5);

fn options_for(ctx: &CliContext, storage: Option<StorageArg>) -> BootstrapOptions {
    let mut options = BootstrapOptions::from_config(&ctx.config);
    if let Some(storage) = storage {
        options.storage_kind = storage.into();
    }
    options
}

/// Run a flow with a progress printer attached.
async fn with_progress<F, Fut>(flow: F) -> Result<BootstrapOutcome>
where
    F: FnOnce(ProgressReporter) -> Fut,
    Fut: Future<Output = Result<BootstrapOutcome>>,
{
    let (reporter, rx) = ProgressReporter::channel();
    let mut printer = spawn_printer(rx);
    let result = flow(reporter).await;

    // A session may still hold a reporter clone; don't wait on it forever
    if tokio::time::timeout(Duration::from_millis(200), &mut printer)
        .await
        .is_err()
    {
        printer.abort();
    }
    result
}

fn print_summary(verb: &str, outcome: &BootstrapOutcome) {
    let workspace = &outcome.workspace;
    println!();
    println!("✓ {} '{}' ({})", verb, workspace.name, workspace.id);
    println!("  Files: {}", outcome.state().get_all_files().len());
    if !outcome.metadata_synced {
        println!("  Metadata sync did not finish in time.");
        println!("  Run `diaryx-sync sync` to pick it up again.");
    }
}

fn print_conflicts(conflicts: &[ConflictRecord]) {
    if conflicts.is_empty() {
        return;
    }
    println!();
    println!("Conflicts ({}):", conflicts.len());
    for conflict in conflicts {
        let newer = if conflict.remote_modified_at >= conflict.local_modified_at {
            "server"
        } else {
            "local"
        };
        println!(
            "  {} (newer: {}, proposed: {})",
            conflict.path,
            newer,
            resolution_name(conflict.proposed())
        );
    }
    println!();
    println!("Resolve with: diaryx-sync sync --resolve proposed|local|remote|both");
}

fn resolution_name(resolution: Resolution) -> &'static str {
    match resolution {
        Resolution::Local => "keep local",
        Resolution::Remote => "keep server",
        Resolution::Both => "keep both",
    }
}

fn state_label(state: SessionState) -> &'static str {
    match state {
        SessionState::Disconnected => "disconnected",
        SessionState::Connecting => "connecting",
        SessionState::MetadataSyncing => "syncing file list",
        SessionState::Steady => "connected",
        SessionState::BodySyncing => "syncing content",
    }
}

/// Report session phases until Ctrl-C or until the session gives up.
async fn watch_session(outcome: &BootstrapOutcome) {
    let mut states = outcome.session.watch_state();
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    log::error!("Failed to listen for Ctrl-C: {}", e);
                }
                break;
            }
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *states.borrow_and_update();
                println!("  Session: {}", state_label(state));
                if state == SessionState::Disconnected {
                    eprintln!("✗ Lost the connection to the server and gave up reconnecting");
                    break;
                }
            }
        }
    }
}

/// Give queued changes a moment to flush, then close the session.
async fn wind_down(outcome: &BootstrapOutcome) {
    let state = outcome.state();
    let deadline = tokio::time::Instant::now() + FLUSH_GRACE;
    while state.queued_len() > 0
        && outcome.session.state() != SessionState::Disconnected
        && tokio::time::Instant::now() < deadline
    {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    if state.queued_len() > 0 {
        log::warn!(
            "{} local changes not yet sent; they go out on the next sync",
            state.queued_len()
        );
    }
    if let Err(e) = state.persist() {
        log::warn!("Failed to compact replicas: {}", e);
    }
    outcome.session.disconnect().await;
}

/// Handle `download <id>`.
pub async fn handle_download(ctx: &CliContext, id: &str, storage: Option<StorageArg>) -> bool {
    let orchestrator = match ctx.orchestrator(options_for(ctx, storage)) {
        Ok(o) => o,
        Err(e) => return report_error("Cannot download", &e),
    };
    println!("Downloading workspace {}", id);

    let orchestrator = &orchestrator;
    let outcome = match with_progress(|p| async move {
        let outcome = orchestrator.download_server(id, &p).await?;

        // Subscriptions were only requested; pull every body before exiting
        let paths = outcome.state().get_all_files().into_keys().collect();
        let body_sync = BodySyncOptions {
            concurrency: ctx.config.body_sync_concurrency,
            wait_for_complete: true,
            timeout: ctx.config.body_sync_timeout(),
            progress: p.clone(),
        };
        outcome.session.subscribe_bodies(paths, body_sync).await?;
        Ok(outcome)
    })
    .await
    {
        Ok(outcome) => outcome,
        Err(e) => return report_error("Download failed", &e),
    };

    print_summary("Downloaded", &outcome);
    print_conflicts(&outcome.conflicts().conflicts());
    wind_down(&outcome).await;
    true
}

/// Handle `upload [workspace]`.
pub async fn handle_upload(ctx: &CliContext, workspace: Option<&str>, merge: bool) -> bool {
    let mut options = options_for(ctx, None);
    if merge {
        options.import_mode = SnapshotImportMode::Merge;
    }
    let orchestrator = match ctx.orchestrator(options) {
        Ok(o) => o,
        Err(e) => return report_error("Cannot upload", &e),
    };
    let workspace = match resolve_workspace(orchestrator.registry(), workspace) {
        Ok(w) => w,
        Err(e) => return report_error("Cannot upload", &e),
    };
    println!("Uploading '{}'", workspace.name);

    let orchestrator = &orchestrator;
    let id = workspace.id.as_str();
    let outcome = match with_progress(|p| async move { orchestrator.upload_local(id, &p).await }).await
    {
        Ok(outcome) => outcome,
        Err(e) => return report_error("Upload failed", &e),
    };

    print_summary("Uploaded", &outcome);
    if outcome.workspace.id != workspace.id {
        println!("  Server id: {}", outcome.workspace.id);
    }
    print_conflicts(&outcome.conflicts().conflicts());
    wind_down(&outcome).await;
    true
}

/// Handle `create <name>`.
pub async fn handle_create(ctx: &CliContext, name: &str, storage: Option<StorageArg>) -> bool {
    let orchestrator = match ctx.orchestrator(options_for(ctx, storage)) {
        Ok(o) => o,
        Err(e) => return report_error("Cannot create workspace", &e),
    };
    println!("Creating '{}'", name);

    let orchestrator = &orchestrator;
    let outcome = match with_progress(|p| async move { orchestrator.create_new(name, &p).await }).await
    {
        Ok(outcome) => outcome,
        Err(e) => return report_error("Create failed", &e),
    };

    print_summary("Created", &outcome);
    wind_down(&outcome).await;
    true
}

/// Handle `import <name> <archive>`.
pub async fn handle_import(ctx: &CliContext, name: &str, archive: &Path) -> bool {
    let bytes = match std::fs::read(archive) {
        Ok(bytes) => bytes,
        Err(e) => {
            eprintln!("✗ Cannot read {}: {}", archive.display(), e);
            return false;
        }
    };
    let orchestrator = match ctx.orchestrator(options_for(ctx, None)) {
        Ok(o) => o,
        Err(e) => return report_error("Cannot import", &e),
    };
    println!("Importing {} as '{}'", archive.display(), name);

    let orchestrator = &orchestrator;
    let outcome = match with_progress(|p| async move {
        orchestrator.import_archive(name, bytes, &p).await
    })
    .await
    {
        Ok(outcome) => outcome,
        Err(e) => return report_error("Import failed", &e),
    };

    print_summary("Imported", &outcome);
    wind_down(&outcome).await;
    true
}

/// Handle `sync [workspace]`.
pub async fn handle_sync(
    ctx: &CliContext,
    workspace: Option<&str>,
    resolve: Option<ResolveArg>,
    watch: bool,
) -> bool {
    let orchestrator = match ctx.orchestrator(options_for(ctx, None)) {
        Ok(o) => o,
        Err(e) => return report_error("Cannot sync", &e),
    };
    let workspace = match resolve_workspace(orchestrator.registry(), workspace) {
        Ok(w) => w,
        Err(e) => return report_error("Cannot sync", &e),
    };
    println!("Syncing '{}'", workspace.name);

    let orchestrator = &orchestrator;
    let id = workspace.id.as_str();
    let outcome = match with_progress(|p| async move { orchestrator.resume(id, &p).await }).await {
        Ok(outcome) => outcome,
        Err(e) => return report_error("Sync failed", &e),
    };
    print_summary("Synced", &outcome);

    let mut success = true;
    let conflicts = outcome.conflicts().conflicts();
    match resolve {
        Some(choice) => {
            for conflict in &conflicts {
                let resolution = choice.pick(conflict.proposed());
                match outcome
                    .conflicts()
                    .resolve(&conflict.path, resolution, &*outcome.session)
                    .await
                {
                    Ok(resolved) => match resolved.duplicate {
                        Some(duplicate) => println!(
                            "✓ {}: {} (other version in {})",
                            conflict.path,
                            resolution_name(resolution),
                            duplicate
                        ),
                        None => {
                            println!("✓ {}: {}", conflict.path, resolution_name(resolution))
                        }
                    },
                    Err(e) => success = report_error(&format!("Resolving {}", conflict.path), &e),
                }
            }
        }
        None => print_conflicts(&conflicts),
    }

    if watch {
        println!();
        println!("Watching for changes. Press Ctrl-C to stop.");
        watch_session(&outcome).await;
        println!();
    }

    wind_down(&outcome).await;
    success
}
