//! netwarden
//!
//! Applies group policy to a managed router and inspects its state.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use nw_core::config::{self, WardenConfig};
use nw_core::types::{DeviceId, GroupId, SessionId};
use nw_orchestrator::{Controller, GroupSync, GroupSyncRequest};

#[derive(Parser)]
#[command(name = "netwarden")]
#[command(author, version, about = "Keep a router in sync with access and bandwidth policy")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Router to operate on, as named in the `[devices]` config section
    #[arg(short, long, global = true)]
    device: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply a group sync request read from a JSON file
    Sync {
        /// Request file (`-` for stdin)
        request: PathBuf,
        /// Only print the commands that would run
        #[arg(long)]
        dry_run: bool,
        /// Recreate all router scaffolding first
        #[arg(long)]
        restart: bool,
    },

    /// Remove a group from the router and the state document
    RemoveGroup {
        group_id: GroupId,
        #[arg(long)]
        dry_run: bool,
    },

    /// Show or change the active access list
    Mode {
        #[command(subcommand)]
        action: ModeAction,
    },

    /// Check a device list against the stored state
    Verify {
        #[arg(short, long)]
        group: GroupId,
        /// Device as `IP,MAC`; repeat for several
        #[arg(long = "entry", value_parser = parse_entry)]
        entries: Vec<(String, String)>,
    },

    /// Probe which router scaffolding is present
    Check,

    /// Create missing router scaffolding
    Setup {
        /// Recreate every component, not only missing ones
        #[arg(long)]
        restart: bool,
    },

    /// Show the active mode and the state document
    Status,
}

#[derive(Subcommand)]
enum ModeAction {
    /// Print the live mode
    Show,
    /// Activate a list for a group's devices
    Activate {
        #[arg(value_enum)]
        list: ListArg,
        #[arg(short, long)]
        group: GroupId,
    },
    /// Tear down both lists
    Off,
}

#[derive(Clone, Copy, ValueEnum)]
enum ListArg {
    Allow,
    Deny,
}

fn parse_entry(value: &str) -> Result<(String, String), String> {
    value
        .split_once(',')
        .map(|(ip, mac)| (ip.trim().to_string(), mac.trim().to_string()))
        .ok_or_else(|| format!("expected IP,MAC but got {}", value))
}

fn load_config(path: Option<&PathBuf>) -> Result<WardenConfig> {
    if let Some(path) = path {
        return config::load_config(path)
            .with_context(|| format!("Failed to load config from {:?}", path));
    }
    let default_path = config::default_config_path();
    if default_path.exists() {
        Ok(config::load_config(&default_path).unwrap_or_else(|e| {
            tracing::warn!("Failed to load config from {:?}: {}", default_path, e);
            WardenConfig::default()
        }))
    } else {
        tracing::info!("Using default configuration");
        Ok(WardenConfig::default())
    }
}

fn read_request(path: &Path) -> Result<GroupSyncRequest> {
    let contents = if path == Path::new("-") {
        std::io::read_to_string(std::io::stdin()).context("Failed to read request from stdin")?
    } else {
        std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read request from {:?}", path))?
    };
    serde_json::from_str(&contents).context("Invalid sync request")
}

fn print<T: Serialize + std::fmt::Debug>(json: bool, value: &T) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        println!("{:#?}", value);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| cli.log_level.clone()),
        ))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config = load_config(cli.config.as_ref())?;
    let device = match cli.device.clone() {
        Some(device) => DeviceId::new(device),
        None if config.devices.len() == 1 => {
            DeviceId::new(config.devices.keys().next().cloned().unwrap_or_default())
        }
        None => anyhow::bail!("--device is required when more than one router is configured"),
    };

    let controller = Controller::from_config(config)?;
    let cancel = CancellationToken::new();
    let reaper = controller.spawn_reaper(cancel.clone());

    let session = SessionId::new(uuid::Uuid::new_v4().to_string());
    controller.connection_pool().start_session(&session);
    let sync = controller.group_sync(&session, &device);

    let result = run(&sync, cli.command, cli.json).await;

    controller.connection_pool().end_session(&session).await;
    cancel.cancel();
    let _ = reaper.await;
    result
}

async fn run(sync: &GroupSync, command: Commands, json: bool) -> Result<()> {
    match command {
        Commands::Sync {
            request,
            dry_run,
            restart,
        } => {
            let mut request = read_request(&request)?;
            request.dry_run |= dry_run;
            request.restart |= restart;
            let bundle = sync.sync_group(&request).await?;
            print(json, &bundle)
        }
        Commands::RemoveGroup { group_id, dry_run } => {
            let bundle = sync.remove_group(group_id, dry_run).await?;
            print(json, &bundle)
        }
        Commands::Mode { action } => match action {
            ModeAction::Show => print(json, &sync.get_active_mode().await?),
            ModeAction::Activate { list, group } => {
                let plan = match list {
                    ListArg::Allow => sync.engine().activate_allow_list(group).await?,
                    ListArg::Deny => sync.engine().activate_deny_list(group).await?,
                };
                print(json, &plan.rendered())
            }
            ModeAction::Off => print(json, &sync.engine().deactivate().await?.rendered()),
        },
        Commands::Verify { group, entries } => {
            let (ips, macs): (Vec<String>, Vec<String>) = entries.into_iter().unzip();
            print(json, &sync.verify_devices(group, &ips, &macs).await?)
        }
        Commands::Check => print(json, &sync.reconciler().check_existing().await?),
        Commands::Setup { restart } => {
            let report = sync.reconciler().ensure(restart).await?;
            let rendered: Vec<String> = report
                .commands
                .iter()
                .chain(report.cleanup.iter())
                .map(ToString::to_string)
                .collect();
            print(json, &rendered)
        }
        Commands::Status => {
            let mode = sync.get_active_mode().await?;
            let document = sync.store().load().await?;
            print(
                json,
                &serde_json::json!({
                    "active_mode": mode,
                    "state": document,
                }),
            )
        }
    }
}
