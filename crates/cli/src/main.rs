// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 WG Tunnel Manager Contributors

// WG Tunnel Manager - CLI Client
// Command-line interface for importing and switching WireGuard tunnels

mod config;

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use comfy_table::{Attribute, Cell, Color, ContentArrangement, Table};
use dialoguer::Confirm;
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::Client;

use wg_tunnel_common::tunnel_config::sanitize_name;
use wg_tunnel_common::{
    activate_tunnel, check_status, deactivate_tunnel, export_config, import_config, list_tunnels,
    remove_config, run_transition_with_events, EventListener, LifecycleAction, LifecycleResult,
    TransitionHandler, TransitionOutcome, TunnelEvent, TunnelSummary,
};

/// Longer than the daemon's default confirmation delay
const SETTLE_WINDOW: Duration = Duration::from_secs(4);

/// How long `status` waits for fresh probe results
const STATUS_WINDOW: Duration = Duration::from_millis(1500);

#[derive(Parser)]
#[command(name = "wg-tunnel")]
#[command(about = "WireGuard Tunnel Manager CLI", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Import a tunnel configuration file
    Import {
        /// Path to a .conf file
        path: String,

        /// Tunnel name (default: the file name without .conf)
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Print a stored configuration
    Export {
        /// Tunnel name
        name: String,

        /// Write to this file instead of stdout
        #[arg(short, long)]
        output: Option<String>,
    },

    /// List stored tunnels
    List {
        /// Output as JSON for scripting
        #[arg(short, long)]
        json: bool,
    },

    /// Activate a tunnel
    Up {
        /// Tunnel name
        name: String,

        /// Return as soon as the daemon answers
        #[arg(long)]
        no_wait: bool,
    },

    /// Deactivate a tunnel
    Down {
        /// Tunnel name
        name: String,

        /// Return as soon as the daemon answers
        #[arg(long)]
        no_wait: bool,
    },

    /// Re-check and show tunnel status
    Status {
        /// Tunnel name (optional, shows all if not specified)
        name: Option<String>,
    },

    /// Delete a stored configuration
    Remove {
        /// Tunnel name
        name: String,

        /// Do not ask for confirmation
        #[arg(short = 'y', long)]
        yes: bool,
    },

    /// Stream tunnel events
    Watch {
        /// Optional tunnel name to filter by
        name: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Import { path, name } => {
            import_tunnel(path, name).await?;
        }
        Commands::Export { name, output } => {
            export_tunnel(name, output).await?;
        }
        Commands::List { json } => {
            list_tunnels_cmd(json).await?;
        }
        Commands::Up { name, no_wait } => {
            change_state(name, LifecycleAction::Activate, no_wait).await?;
        }
        Commands::Down { name, no_wait } => {
            change_state(name, LifecycleAction::Deactivate, no_wait).await?;
        }
        Commands::Status { name } => {
            show_status(name).await?;
        }
        Commands::Remove { name, yes } => {
            remove_tunnel(name, yes).await?;
        }
        Commands::Watch { name } => {
            watch_events(name).await?;
        }
    }

    Ok(())
}

/// Client plus the configuration it was built from
fn connect() -> Result<(Client, config::DaemonClientConfig)> {
    let cli_config = config::CliConfig::load()?;
    let client = wg_tunnel_common::create_daemon_client(&cli_config.daemon_config)?;
    Ok((client, cli_config.daemon_config))
}

fn expand_path(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).into_owned())
}

fn fail(message: Option<String>, code: Option<String>) -> anyhow::Error {
    let message = message.unwrap_or_else(|| "unknown error".to_string());
    match code {
        Some(code) => anyhow::anyhow!("{} [{}]", message, code),
        None => anyhow::anyhow!(message),
    }
}

async fn import_tunnel(path: String, name: Option<String>) -> Result<()> {
    let path = expand_path(&path);
    let text = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let source_name = match name {
        Some(name) => name,
        None => path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| anyhow::anyhow!("{} has no file name", path.display()))?,
    };

    let (client, daemon_config) = connect()?;
    let result = import_config(&client, &daemon_config, &source_name, &text).await?;
    if !result.success {
        return Err(fail(result.error, result.code)).context("Import failed");
    }

    let name = result.name.unwrap_or(source_name);
    println!();
    println!("{}", format!("Imported tunnel '{}'", name).green());
    println!("  Activate it with: {}", format!("wg-tunnel up {}", name).cyan());
    println!();
    Ok(())
}

async fn export_tunnel(name: String, output: Option<String>) -> Result<()> {
    let (client, daemon_config) = connect()?;
    let result = export_config(&client, &daemon_config, &name).await?;
    if !result.success {
        return Err(fail(result.error, result.code)).context("Export failed");
    }
    let text = result.text.unwrap_or_default();

    match output {
        Some(output) => {
            let path = expand_path(&output);
            write_private(&path, &text)?;
            eprintln!(
                "{}",
                format!("Wrote '{}' to {}", name, path.display()).green()
            );
        }
        None => print!("{}", text),
    }
    Ok(())
}

/// Exported configurations hold private keys
fn write_private(path: &Path, text: &str) -> Result<()> {
    fs::write(path, text).with_context(|| format!("Failed to write {}", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))
            .with_context(|| format!("Failed to set permissions on {}", path.display()))?;
    }
    Ok(())
}

async fn list_tunnels_cmd(json: bool) -> Result<()> {
    let (client, daemon_config) = connect()?;
    let tunnels = list_tunnels(&client, &daemon_config).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&tunnels)?);
        return Ok(());
    }

    if tunnels.is_empty() {
        println!("{}", "No tunnels found.".yellow());
        println!("Import one with: {}", "wg-tunnel import <file.conf>".cyan());
        return Ok(());
    }

    print_tunnels_table(&tunnels);
    Ok(())
}

fn print_tunnels_table(tunnels: &[TunnelSummary]) {
    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);

    table.set_header(vec![
        Cell::new("Name")
            .add_attribute(Attribute::Bold)
            .fg(Color::Cyan),
        Cell::new("State")
            .add_attribute(Attribute::Bold)
            .fg(Color::Cyan),
    ]);

    for tunnel in tunnels {
        let state = if tunnel.active {
            Cell::new("active").fg(Color::Green)
        } else {
            Cell::new("inactive").fg(Color::DarkGrey)
        };
        table.add_row(vec![Cell::new(&tunnel.name), state]);
    }

    let active = tunnels.iter().filter(|t| t.active).count();
    println!();
    println!("{}", table);
    println!();
    println!(
        "{} tunnel(s), {} active",
        tunnels.len().to_string().cyan(),
        active.to_string().green()
    );
    println!();
}

/// Shows events while the transition settles
struct CliTransitionHandler {
    spinner: ProgressBar,
}

impl TransitionHandler for CliTransitionHandler {
    fn on_event(&mut self, event: &TunnelEvent) {
        if let TunnelEvent::PrivilegeWarning { message, .. } = event {
            self.spinner
                .println(format!("{} {}", "Warning:".yellow().bold(), message));
        }
    }
}

fn spinner(message: String) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} {msg}") {
        spinner.set_style(style);
    }
    spinner.set_message(message);
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner
}

async fn change_state(name: String, action: LifecycleAction, no_wait: bool) -> Result<()> {
    let (client, daemon_config) = connect()?;
    let verb = match action {
        LifecycleAction::Activate => "Activating",
        LifecycleAction::Deactivate => "Deactivating",
    };

    if no_wait {
        println!("{}", format!("{} tunnel '{}'", verb, name).green().bold());
        let result = match action {
            LifecycleAction::Activate => activate_tunnel(&client, &daemon_config, &name).await?,
            LifecycleAction::Deactivate => {
                deactivate_tunnel(&client, &daemon_config, &name).await?
            }
        };
        let outcome = TransitionOutcome {
            result,
            settled_state: None,
            event_error: None,
        };
        return report_transition(&name, action, &outcome);
    }

    let progress = spinner(format!("{} tunnel '{}'...", verb, name));
    let mut handler = CliTransitionHandler {
        spinner: progress.clone(),
    };
    let outcome = run_transition_with_events(
        &client,
        &daemon_config,
        &name,
        action,
        SETTLE_WINDOW,
        &mut handler,
    )
    .await;
    progress.finish_and_clear();

    report_transition(&name, action, &outcome?)
}

fn report_transition(name: &str, action: LifecycleAction, outcome: &TransitionOutcome) -> Result<()> {
    let LifecycleResult {
        success,
        pending,
        mechanism,
        error,
        code,
    } = outcome.result.clone();
    let want_active = action == LifecycleAction::Activate;

    if !success {
        return Err(fail(error, code));
    }

    if let Some(state) = outcome.settled_state {
        if state != want_active {
            let reason = outcome
                .event_error
                .clone()
                .unwrap_or_else(|| "the backend reports a different state".to_string());
            anyhow::bail!("Tunnel '{}' did not settle: {}", name, reason);
        }
    }

    let state = if want_active { "active" } else { "inactive" };
    match mechanism {
        Some(mechanism) if pending && outcome.settled_state.is_none() => println!(
            "{}",
            format!("Tunnel '{}' reported {} via {} (confirmation pending)", name, state, mechanism)
                .green()
        ),
        Some(mechanism) => println!(
            "{}",
            format!("Tunnel '{}' is {} via {}", name, state, mechanism).green()
        ),
        None => println!("{}", format!("Tunnel '{}' was already {}", name, state).dimmed()),
    }
    Ok(())
}

async fn show_status(name: Option<String>) -> Result<()> {
    let (client, daemon_config) = connect()?;

    // Subscribe first so fresh results are not missed
    let mut events = EventListener::new(daemon_config.clone())
        .subscribe_once()
        .await
        .ok();

    check_status(&client, &daemon_config, name.as_deref()).await?;

    let progress = spinner("Checking tunnel status...".to_string());
    if let Some(rx) = events.as_mut() {
        let deadline = tokio::time::sleep(STATUS_WINDOW);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                event = rx.recv() => match event {
                    Some(TunnelEvent::TunnelStatus { name, success: false, error, .. }) => {
                        progress.println(format!(
                            "{} {}: {}",
                            "Error:".red().bold(),
                            name,
                            error.unwrap_or_default()
                        ));
                    }
                    Some(_) => {}
                    None => break,
                },
            }
        }
    } else {
        tokio::time::sleep(STATUS_WINDOW).await;
    }
    progress.finish_and_clear();

    let mut tunnels = list_tunnels(&client, &daemon_config).await?;
    if let Some(name) = &name {
        let wanted = sanitize_name(name);
        tunnels.retain(|t| t.name == wanted);
        if tunnels.is_empty() {
            anyhow::bail!("Tunnel '{}' not found", name.yellow());
        }
    }

    if tunnels.is_empty() {
        println!("{}", "No tunnels found.".yellow());
    } else {
        print_tunnels_table(&tunnels);
    }
    Ok(())
}

async fn remove_tunnel(name: String, yes: bool) -> Result<()> {
    if !yes {
        let confirm = Confirm::new()
            .with_prompt(format!(
                "Are you sure you want to remove tunnel '{}'?",
                name.yellow()
            ))
            .default(false)
            .interact()?;

        if !confirm {
            println!("{}", "Removal cancelled".dimmed());
            return Ok(());
        }
    }

    let (client, daemon_config) = connect()?;
    let result = remove_config(&client, &daemon_config, &name).await?;
    if !result.success {
        return Err(fail(result.error, result.code)).context("Remove failed");
    }

    println!("{}", format!("Tunnel '{}' removed", name).green());
    Ok(())
}

async fn watch_events(name: Option<String>) -> Result<()> {
    let cli_config = config::CliConfig::load()?;
    let filter = name.as_deref().map(sanitize_name);

    let mut rx = EventListener::new(cli_config.daemon_config)
        .listen()
        .await
        .context("Failed to connect to events stream")?;

    println!(
        "{}",
        "Connected to event stream. Press Ctrl+C to stop.".dimmed()
    );

    while let Some(event) = rx.recv().await {
        if let (Some(filter), Some(event_name)) = (&filter, event.tunnel_name()) {
            if filter != event_name {
                continue;
            }
        }

        match event {
            TunnelEvent::TunnelStatus {
                name,
                active,
                success,
                error,
                timestamp,
            } => {
                let time = timestamp.with_timezone(&chrono::Local).format("%H:%M:%S");
                let state = if active { "active" } else { "inactive" };
                if success {
                    let line = format!("[{}] {} is {}", time, name, state);
                    if active {
                        println!("{}", line.green());
                    } else {
                        println!("{}", line.yellow());
                    }
                } else {
                    eprintln!(
                        "{}",
                        format!(
                            "[{}] {} ({}): {}",
                            time,
                            name,
                            state,
                            error.unwrap_or_default()
                        )
                        .red()
                    );
                }
            }
            TunnelEvent::PrivilegeWarning { message, .. } => {
                println!("{} {}", "Warning:".yellow().bold(), message);
            }
            TunnelEvent::Heartbeat { .. } => {
                // Ignore heartbeats in watch mode
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use wg_tunnel_common::MechanismKind;

    fn outcome(result: LifecycleResult, settled_state: Option<bool>) -> TransitionOutcome {
        TransitionOutcome {
            result,
            settled_state,
            event_error: None,
        }
    }

    #[test]
    fn test_cli_parses_commands() {
        let cli = Cli::try_parse_from(["wg-tunnel", "up", "office", "--no-wait"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Up { ref name, no_wait: true } if name == "office"
        ));

        let cli = Cli::try_parse_from(["wg-tunnel", "remove", "office", "-y"]).unwrap();
        assert!(matches!(cli.command, Commands::Remove { yes: true, .. }));

        let cli = Cli::try_parse_from(["wg-tunnel", "status"]).unwrap();
        assert!(matches!(cli.command, Commands::Status { name: None }));
    }

    #[test]
    fn test_report_transition() {
        let confirmed = outcome(
            LifecycleResult::succeeded(Some(MechanismKind::ServiceControl), true),
            Some(true),
        );
        assert!(report_transition("office", LifecycleAction::Activate, &confirmed).is_ok());

        let already_down = outcome(LifecycleResult::succeeded(None, false), None);
        assert!(report_transition("office", LifecycleAction::Deactivate, &already_down).is_ok());

        let mut contradicted = outcome(
            LifecycleResult::succeeded(Some(MechanismKind::QuickScript), true),
            Some(false),
        );
        contradicted.event_error =
            Some("activation reported success but the tunnel is not active".to_string());
        let err = report_transition("office", LifecycleAction::Activate, &contradicted)
            .unwrap_err()
            .to_string();
        assert!(err.contains("not active"));

        let refused = outcome(
            LifecycleResult {
                success: false,
                error: Some("Tunnel office is busy".to_string()),
                code: Some("Busy".to_string()),
                ..Default::default()
            },
            None,
        );
        let err = report_transition("office", LifecycleAction::Activate, &refused)
            .unwrap_err()
            .to_string();
        assert_eq!(err, "Tunnel office is busy [Busy]");
    }
}
