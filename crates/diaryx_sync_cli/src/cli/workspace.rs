//! Workspace registry command handlers

use diaryx_sync::{BootstrapOptions, StoreKind, Workspace, WorkspaceRegistry};

use super::args::WorkspaceCommands;
use super::{CliContext, report_error, resolve_workspace};

pub async fn handle_workspace_command(ctx: &CliContext, command: WorkspaceCommands) -> bool {
    let registry = match ctx.registry() {
        Ok(r) => r,
        Err(e) => return report_error("Cannot open workspace registry", &e),
    };

    match command {
        WorkspaceCommands::List { json } => handle_list(&registry, json),
        WorkspaceCommands::Create { name, storage } => {
            let mut options = BootstrapOptions::from_config(&ctx.config);
            if let Some(storage) = storage {
                options.storage_kind = storage.into();
            }
            let orchestrator = match ctx.orchestrator(options) {
                Ok(o) => o,
                Err(e) => return report_error("Cannot create workspace", &e),
            };
            match orchestrator.create_local(&name).await {
                Ok(workspace) => {
                    println!("✓ Created '{}' ({})", workspace.name, workspace.id);
                    println!("  Run `diaryx-sync upload` to sync it.");
                    true
                }
                Err(e) => report_error("Cannot create workspace", &e),
            }
        }
        WorkspaceCommands::Rename { workspace, name } => {
            handle_rename(ctx, &registry, &workspace, &name).await
        }
        WorkspaceCommands::Remove { workspace } => handle_remove(ctx, &registry, &workspace),
        WorkspaceCommands::Activate { workspace } => {
            match resolve_workspace(&registry, Some(&workspace))
                .and_then(|w| registry.set_active(&w.id))
            {
                Ok(w) => {
                    println!("✓ Active workspace: '{}' ({})", w.name, w.id);
                    true
                }
                Err(e) => report_error("Cannot activate workspace", &e),
            }
        }
    }
}

fn handle_list(registry: &WorkspaceRegistry, json: bool) -> bool {
    let workspaces = match registry.list() {
        Ok(list) => list,
        Err(e) => return report_error("Cannot list workspaces", &e),
    };

    if json {
        return match serde_json::to_string_pretty(&workspaces) {
            Ok(text) => {
                println!("{}", text);
                true
            }
            Err(e) => {
                eprintln!("✗ {}", e);
                false
            }
        };
    }

    if workspaces.is_empty() {
        println!("No workspaces yet.");
        println!("  diaryx-sync workspaces create <name>   local only");
        println!("  diaryx-sync download <id>              from the server");
        return true;
    }

    let active = registry.active().ok().flatten().map(|w| w.id);
    for workspace in &workspaces {
        let marker = if active.as_deref() == Some(workspace.id.as_str()) {
            "*"
        } else {
            " "
        };
        println!("{} {}", marker, describe(workspace));
    }
    true
}

/// Local time for a millisecond timestamp.
fn format_millis(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|at| at.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ms.to_string())
}

/// One line per workspace: name, id, storage and sync status.
fn describe(workspace: &Workspace) -> String {
    let sync = if workspace.is_local {
        "local".to_string()
    } else {
        match workspace.downloaded_at {
            Some(at) => format!("synced, downloaded {}", format_millis(at)),
            None => "synced".to_string(),
        }
    };
    format!(
        "{} ({}) [{}, {}]",
        workspace.name,
        workspace.id,
        workspace.storage_kind.as_str(),
        sync
    )
}

async fn handle_rename(
    ctx: &CliContext,
    registry: &WorkspaceRegistry,
    query: &str,
    name: &str,
) -> bool {
    let workspace = match resolve_workspace(registry, Some(query)) {
        Ok(w) => w,
        Err(e) => return report_error("Cannot rename workspace", &e),
    };

    // Server first, so a refused name leaves both sides untouched
    if !workspace.is_local
        && let Err(e) = ctx.remote().rename_workspace(&workspace.id, name).await
    {
        return report_error("Server refused the rename", &e);
    }

    match registry.rename(&workspace.id, name) {
        Ok(w) => {
            println!("✓ Renamed '{}' to '{}'", workspace.name, w.name);
            true
        }
        Err(e) => report_error("Cannot rename workspace", &e),
    }
}

fn handle_remove(ctx: &CliContext, registry: &WorkspaceRegistry, query: &str) -> bool {
    let workspace = match resolve_workspace(registry, Some(query)) {
        Ok(w) => w,
        Err(e) => return report_error("Cannot remove workspace", &e),
    };
    if let Err(e) = registry.remove(&workspace.id) {
        return report_error("Cannot remove workspace", &e);
    }

    println!("✓ Removed '{}' from the registry", workspace.name);
    if let Ok(root) = ctx.config.resolved_workspaces_dir() {
        let location = match workspace.storage_kind {
            StoreKind::Native => Some(root.join(&workspace.storage_dir)),
            StoreKind::Sqlite => Some(root.join(format!("{}.db", workspace.storage_dir))),
            StoreKind::Memory => None,
        };
        if let Some(location) = location {
            println!("  Its files remain at {}", location.display());
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workspace(is_local: bool, downloaded_at: Option<i64>) -> Workspace {
        Workspace {
            id: "ws-1".into(),
            name: "Notes".into(),
            storage_kind: StoreKind::Sqlite,
            storage_dir: "ws-1".into(),
            is_local,
            downloaded_at,
            last_opened_at: None,
            created_at: 0,
        }
    }

    #[test]
    fn test_describe() {
        assert_eq!(describe(&workspace(true, None)), "Notes (ws-1) [sqlite, local]");
        assert_eq!(describe(&workspace(false, None)), "Notes (ws-1) [sqlite, synced]");
        assert!(
            describe(&workspace(false, Some(0)))
                .starts_with("Notes (ws-1) [sqlite, synced, downloaded ")
        );
    }
}
