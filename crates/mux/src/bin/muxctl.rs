use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use mcp_mux::{LogSettings, Manager, SpecOverrides};
use serde_json::Value;

#[derive(Parser)]
#[command(name = "muxctl")]
#[command(about = "MCP subprocess multiplexer control (spawn, call, inspect)")]
struct Cli {
    /// Compact JSON output (default: pretty JSON).
    #[arg(long, default_value_t = false)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

/// Spec overrides overlaid onto the registered server for this invocation.
#[derive(Args, Default)]
struct OverrideArgs {
    /// Replace the registered command.
    #[arg(long)]
    command: Option<String>,

    /// Replace the registered argument vector (repeatable).
    #[arg(long = "arg")]
    args: Vec<String>,

    /// KEY=VALUE environment overlay entries (repeatable; override wins).
    #[arg(long)]
    env: Vec<String>,

    /// Replace the working directory.
    #[arg(long)]
    cwd: Option<PathBuf>,
}

impl OverrideArgs {
    fn into_overrides(self) -> anyhow::Result<Option<SpecOverrides>> {
        let overrides = SpecOverrides {
            command: self.command,
            args: if self.args.is_empty() {
                None
            } else {
                Some(self.args)
            },
            env: parse_env_entries(&self.env)?,
            cwd: self.cwd,
        };
        Ok(if overrides.is_empty() {
            None
        } else {
            Some(overrides)
        })
    }
}

#[derive(Subcommand)]
enum Command {
    /// List registered server specifications and their connection state.
    ListServers,
    /// List tools exposed by one server.
    ListTools {
        server: String,
        #[command(flatten)]
        overrides: OverrideArgs,
    },
    /// List resources exposed by one server.
    ListResources {
        server: String,
        #[command(flatten)]
        overrides: OverrideArgs,
    },
    /// Call a tool exposed by a server.
    Call {
        server: String,
        tool: String,
        #[arg(long)]
        arguments_json: Option<String>,
        #[command(flatten)]
        overrides: OverrideArgs,
    },
    /// Read a resource exposed by a server.
    Read {
        server: String,
        uri: String,
        #[command(flatten)]
        overrides: OverrideArgs,
    },
    /// Health snapshot: registry counts plus a tools/list probe per server.
    Health,
    /// Connect auto-start servers and serve until SIGTERM/SIGINT.
    Run,
}

fn parse_env_entries(entries: &[String]) -> anyhow::Result<BTreeMap<String, String>> {
    let mut env = BTreeMap::new();
    for entry in entries {
        let (key, value) = entry
            .split_once('=')
            .with_context(|| format!("--env must be KEY=VALUE, got: {entry}"))?;
        env.insert(key.to_string(), value.to_string());
    }
    Ok(env)
}

async fn connect(
    manager: &Arc<Manager>,
    server: &str,
    overrides: OverrideArgs,
) -> anyhow::Result<()> {
    manager
        .connect_server(server, overrides.into_overrides()?)
        .await
        .with_context(|| format!("connect server={server}"))?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    LogSettings::from_env().init_tracing();
    let cli = Cli::parse();
    let manager = Manager::new();

    let result = match cli.command {
        Command::ListServers => serde_json::to_value(manager.status().await)?,
        Command::ListTools { server, overrides } => {
            connect(&manager, &server, overrides).await?;
            let result = manager
                .list_tools(&server)
                .await
                .with_context(|| format!("list-tools server={server}"));
            manager.disconnect_all().await;
            result?
        }
        Command::ListResources { server, overrides } => {
            connect(&manager, &server, overrides).await?;
            let result = manager
                .list_resources(&server)
                .await
                .with_context(|| format!("list-resources server={server}"));
            manager.disconnect_all().await;
            result?
        }
        Command::Call {
            server,
            tool,
            arguments_json,
            overrides,
        } => {
            let arguments = match arguments_json {
                Some(raw) => {
                    Some(serde_json::from_str::<Value>(&raw).context("parse --arguments-json")?)
                }
                None => None,
            };
            connect(&manager, &server, overrides).await?;
            let result = manager
                .call_tool(&server, &tool, arguments)
                .await
                .with_context(|| format!("call server={server} tool={tool}"));
            manager.disconnect_all().await;
            result?
        }
        Command::Read {
            server,
            uri,
            overrides,
        } => {
            connect(&manager, &server, overrides).await?;
            let result = manager
                .read_resource(&server, &uri)
                .await
                .with_context(|| format!("read server={server} uri={uri}"));
            manager.disconnect_all().await;
            result?
        }
        Command::Health => serde_json::to_value(manager.health_check().await)?,
        Command::Run => {
            manager.initialize_default_servers().await;
            tracing::info!("serving until SIGTERM/SIGINT");
            wait_for_shutdown_signal().await;
            manager.disconnect_all().await;
            serde_json::json!({ "ok": true })
        }
    };

    let text = if cli.json {
        serde_json::to_string(&result)?
    } else {
        serde_json::to_string_pretty(&result)?
    };
    println!("{text}");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(err) => {
                tracing::error!(error = %err, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = sigterm.recv() => tracing::info!("received SIGTERM"),
            result = tokio::signal::ctrl_c() => {
                if let Err(err) = result {
                    tracing::error!(error = %err, "ctrl-c handler failed");
                }
                tracing::info!("received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
