//! Status and config command handlers.

use std::path::PathBuf;

use diaryx_sync::SyncConfig;

use super::{CliContext, report_error};

/// Handle the status command - show configuration and server health.
pub async fn handle_status(ctx: &CliContext) -> bool {
    let config = &ctx.config;
    println!("Sync Status");
    println!("===========");
    println!();

    match config.server_base() {
        Some(server) => {
            let health = match ctx.remote().health().await {
                Ok(true) => "reachable".to_string(),
                Ok(false) => "unhealthy".to_string(),
                Err(e) => format!("unreachable ({})", e),
            };
            println!("Server: {} ({})", server, health);
        }
        None => println!("Server: (not configured)"),
    }
    println!(
        "Auth token: {}",
        if config.auth_token.is_some() {
            "set"
        } else {
            "(not set)"
        }
    );

    match config.resolved_registry_path() {
        Ok(path) => println!("Registry: {}", path.display()),
        Err(e) => println!("Registry: (unavailable: {})", e),
    }
    match config.resolved_workspaces_dir() {
        Ok(path) => println!("Workspaces dir: {}", path.display()),
        Err(e) => println!("Workspaces dir: (unavailable: {})", e),
    }

    let registry = match ctx.registry() {
        Ok(r) => r,
        Err(e) => return report_error("Cannot open workspace registry", &e),
    };
    let workspaces = match registry.list() {
        Ok(list) => list,
        Err(e) => return report_error("Cannot read workspace registry", &e),
    };
    let active = registry.active().ok().flatten();
    let synced = workspaces.iter().filter(|w| !w.is_local).count();
    println!(
        "Workspaces: {} ({} synced, {} local)",
        workspaces.len(),
        synced,
        workspaces.len() - synced
    );
    match &active {
        Some(w) => println!(
            "Active: '{}' ({}, {})",
            w.name,
            w.id,
            if w.is_local { "local" } else { "synced" }
        ),
        None => println!("Active: (none)"),
    }

    println!();
    if config.server_base().is_none() {
        println!("To start syncing, point the CLI at a server:");
        println!("  diaryx-sync config --set-server https://sync.diaryx.org");
    } else if active.as_ref().is_some_and(|w| w.is_local) {
        println!("The active workspace is local only. Push it with:");
        println!("  diaryx-sync upload");
    } else if active.is_some() {
        println!("Ready to sync! Start with:");
        println!("  diaryx-sync sync --watch");
    } else {
        println!("No active workspace. Create one with:");
        println!("  diaryx-sync create <name>");
    }
    true
}

/// Handle the config command - show or change `sync.toml`.
pub fn handle_config(
    ctx: &CliContext,
    server: Option<String>,
    token: Option<String>,
    workspaces_dir: Option<PathBuf>,
    json: bool,
) -> bool {
    // Start from the file, not from the --server override
    let mut config = match CliContext::load(ctx.config_path.clone(), None) {
        Ok(loaded) => loaded.config,
        Err(e) => return report_error("Error loading config", &e),
    };

    if server.is_none() && token.is_none() && workspaces_dir.is_none() {
        return show_config(&config, json);
    }

    let mut changes = Vec::new();
    if let Some(server) = server {
        changes.push(format!("Server URL: {}", server));
        config.server_url = Some(server);
    }
    if let Some(token) = token {
        changes.push("Auth token: updated".to_string());
        config.auth_token = Some(token);
    }
    if let Some(dir) = workspaces_dir {
        changes.push(format!("Workspaces dir: {}", dir.display()));
        config.workspaces_dir = Some(dir);
    }

    if let Err(e) = ctx.save_config(&config) {
        return report_error("Failed to save config", &e);
    }
    println!("✓ Configuration updated:");
    for change in changes {
        println!("  {}", change);
    }
    true
}

fn show_config(config: &SyncConfig, json: bool) -> bool {
    let shown = redacted(config);
    if json {
        return match serde_json::to_string_pretty(&shown) {
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

    println!("Sync Configuration");
    println!("==================");
    println!();
    println!("Server URL: {}", shown.server_url.as_deref().unwrap_or("(not set)"));
    println!("Auth token: {}", shown.auth_token.as_deref().unwrap_or("(not set)"));
    println!("Metadata sync timeout: {} ms", shown.metadata_sync_timeout_ms);
    println!("Body sync timeout: {} ms", shown.body_sync_timeout_ms);
    println!("Body sync concurrency: {}", shown.body_sync_concurrency);
    println!("Max reconnect attempts: {}", shown.max_reconnect_attempts);
    println!("Ping interval: {} s", shown.ping_interval_secs);
    if let Some(path) = &shown.registry_path {
        println!("Registry: {}", path.display());
    }
    if let Some(path) = &shown.workspaces_dir {
        println!("Workspaces dir: {}", path.display());
    }
    true
}

/// The config with its token masked, for display.
fn redacted(config: &SyncConfig) -> SyncConfig {
    let mut shown = config.clone();
    shown.auth_token = shown.auth_token.map(|_| "********".to_string());
    shown
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redacted_hides_token_only() {
        let mut config = SyncConfig::new("https://sync.example.com");
        config.auth_token = Some("secret".into());
        let shown = redacted(&config);
        assert_eq!(shown.auth_token.as_deref(), Some("********"));
        assert_eq!(shown.server_url, config.server_url);
    }

    #[test]
    fn test_config_update_ignores_server_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.toml");
        SyncConfig::new("https://saved.example.com").save_path(&path).unwrap();

        let ctx =
            CliContext::load(Some(path.clone()), Some("http://override.test".into())).unwrap();
        assert!(handle_config(&ctx, None, Some("tok".into()), None, false));

        let saved = SyncConfig::load_path(&path).unwrap();
        assert_eq!(saved.server_url.as_deref(), Some("https://saved.example.com"));
        assert_eq!(saved.auth_token.as_deref(), Some("tok"));
    }
}
