//! Snapshot export command handler

use std::path::Path;

use diaryx_sync::bootstrap::StorageProvider;
use diaryx_sync::snapshot::{ExportFilter, SnapshotArchive, export_snapshot};
use diaryx_sync::{ProgressReporter, Result, Workspace};

use super::progress::spawn_printer;
use super::{CliContext, report_error, resolve_workspace};

/// Handle `export <output> [workspace]`.
pub async fn handle_export(
    ctx: &CliContext,
    output: &Path,
    workspace: Option<&str>,
    audience: Option<String>,
    force: bool,
) -> bool {
    if output.exists() && !force {
        eprintln!("✗ {} already exists (use --force to overwrite)", output.display());
        return false;
    }

    let registry = match ctx.registry() {
        Ok(r) => r,
        Err(e) => return report_error("Cannot open workspace registry", &e),
    };
    let workspace = match resolve_workspace(&registry, workspace) {
        Ok(w) => w,
        Err(e) => return report_error("Cannot export", &e),
    };

    let filter = match audience {
        Some(audience) => ExportFilter::audience(audience),
        None => ExportFilter::all(),
    };
    match &filter.audience {
        Some(audience) => println!("Exporting '{}' for audience '{}'", workspace.name, audience),
        None => println!("Exporting '{}'", workspace.name),
    }

    let archive = match export_to(ctx, &workspace, &filter).await {
        Ok(archive) => archive,
        Err(e) => return report_error("Export failed", &e),
    };

    if let Err(e) = std::fs::write(output, &archive.bytes) {
        eprintln!("✗ Cannot write {}: {}", output.display(), e);
        return false;
    }
    println!(
        "✓ Wrote {} files ({} bytes) to {}",
        archive.entries.len(),
        archive.bytes.len(),
        output.display()
    );
    true
}

async fn export_to(
    ctx: &CliContext,
    workspace: &Workspace,
    filter: &ExportFilter,
) -> Result<SnapshotArchive> {
    let storage = ctx.storage()?.open(workspace)?;
    let (reporter, rx) = ProgressReporter::channel();
    let printer = spawn_printer(rx);
    let archive = export_snapshot(storage.store.as_ref(), "", filter, &reporter).await;
    drop(reporter);
    let _ = printer.await;
    archive
}
