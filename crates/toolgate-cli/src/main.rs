//! `toolgate`: list, call and health-check tools across the servers in a registry.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use toolgate_core::ToolgateError;
use toolgate_mcp::{ConnectionManager, ToolSchema};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "toolgate", about = "Toolgate: call tools on many JSON-RPC tool servers", version)]
struct Cli {
    /// Path to the server registry (.yaml, .yml, .json or .toml)
    #[arg(short, long, default_value = "mcp-servers.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List discovered tools
    Tools {
        /// Only list tools of this server
        #[arg(long)]
        server: Option<String>,
    },
    /// Call a tool and print its result
    Call {
        /// Tool name
        tool: String,
        /// Arguments as a JSON object
        #[arg(long, default_value = "{}")]
        args: String,
        /// Send the call to this server instead of the routed owner
        #[arg(long)]
        server: Option<String>,
    },
    /// Report per-server health
    Health {
        /// Keep running, re-checking and printing every N seconds
        #[arg(long)]
        watch: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Bearer tokens are commonly kept in a local .env file.
    let _ = dotenvy::dotenv();

    // stdout carries command output; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .json()
        .init();

    let cli = Cli::parse();

    let manager = Arc::new(ConnectionManager::new(&cli.config));
    let discovered = manager.discover_tools().await.map_err(|e| {
        anyhow::anyhow!("Failed to load registry '{}': {e}", cli.config.display())
    })?;
    info!(
        servers = manager.server_count().await,
        tools = discovered.len(),
        "Discovery finished"
    );

    let outcome = run(cli.command, &manager, discovered).await;
    manager.shutdown().await;
    outcome
}

async fn run(
    command: Commands,
    manager: &Arc<ConnectionManager>,
    discovered: Vec<ToolSchema>,
) -> anyhow::Result<()> {
    match command {
        Commands::Tools { server } => {
            let tools = match server {
                Some(name) => {
                    if !manager.server_names().await.contains(&name) {
                        anyhow::bail!("Unknown server '{name}'");
                    }
                    manager.get_tools_by_server(&name).await
                }
                None => discovered,
            };
            print_json(&tools)
        }
        Commands::Call { tool, args, server } => {
            let arguments: serde_json::Value = serde_json::from_str(&args)
                .map_err(|e| anyhow::anyhow!("--args is not valid JSON: {e}"))?;
            if !arguments.is_object() {
                anyhow::bail!("--args must be a JSON object");
            }

            let result = match &server {
                Some(server) => manager.call_server_tool(server, &tool, arguments).await,
                None => manager.call_tool(&tool, arguments).await,
            };
            let result = match result {
                Ok(result) => result,
                Err(ToolgateError::NoServerForTool { tool }) => {
                    let known: Vec<String> = manager
                        .get_all_tools()
                        .await
                        .into_iter()
                        .map(|t| t.name)
                        .collect();
                    anyhow::bail!("No server offers '{tool}'. Known tools: {}", known.join(", "));
                }
                Err(e) => return Err(e.into()),
            };

            print_json(&result)?;
            if result.is_error {
                anyhow::bail!("Tool '{tool}' reported an error");
            }
            Ok(())
        }
        Commands::Health { watch: None } => print_json(&manager.status().await),
        Commands::Health {
            watch: Some(seconds),
        } => {
            let interval = Duration::from_secs(seconds.max(1));
            print_json(&manager.status().await)?;
            let health = manager.clone().start_health_loop(interval);
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => print_json(&manager.status().await)?,
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
            health.abort();
            info!("Health watch stopped");
            Ok(())
        }
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_path() {
        let cli = Cli::try_parse_from(["toolgate", "health"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("mcp-servers.yaml"));
        assert!(matches!(cli.command, Commands::Health { watch: None }));
    }

    #[test]
    fn test_call_arguments() {
        let cli = Cli::try_parse_from([
            "toolgate",
            "--config",
            "servers.json",
            "call",
            "read_file",
            "--args",
            r#"{"path":"a.txt"}"#,
            "--server",
            "files",
        ])
        .unwrap();
        assert_eq!(cli.config, PathBuf::from("servers.json"));
        match cli.command {
            Commands::Call { tool, args, server } => {
                assert_eq!(tool, "read_file");
                assert_eq!(args, r#"{"path":"a.txt"}"#);
                assert_eq!(server.as_deref(), Some("files"));
            }
            _ => panic!("expected call"),
        }
    }

    #[test]
    fn test_call_requires_tool() {
        assert!(Cli::try_parse_from(["toolgate", "call"]).is_err());
    }

    #[tokio::test]
    async fn test_tools_with_unknown_server_fails() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(ConnectionManager::new(dir.path().join("none.yaml")));
        manager.discover_tools().await.unwrap();
        let err = run(
            Commands::Tools {
                server: Some("ghost".into()),
            },
            &manager,
            Vec::new(),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[tokio::test]
    async fn test_call_rejects_non_object_args() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(ConnectionManager::new(dir.path().join("none.yaml")));
        let err = run(
            Commands::Call {
                tool: "ping".into(),
                args: "[1, 2]".into(),
                server: None,
            },
            &manager,
            Vec::new(),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("JSON object"));
    }
}
