//! Scripted tool server speaking newline-delimited JSON-RPC over stdio.
//!
//! Advertises `ping` and `info`. An unlisted `crash` tool makes the process
//! exit without answering, and `--exit-after-ms` makes it exit on its own. Used by the subprocess integration tests and handy
//! for trying the `toolgate` CLI by hand.

use clap::Parser;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use toolgate_mcp::protocol::{
    ContentBlock, JsonRpcResponse, ToolCallResult, ToolSchema, ToolsListResult, PROTOCOL_VERSION,
};

#[derive(Parser, Debug, Clone)]
#[command(name = "mock-tool-server", about = "Scripted JSON-RPC tool server")]
struct Args {
    /// Name reported in serverInfo and in tool output
    #[arg(long, default_value = "mock")]
    name: String,

    /// Delay every tools/call response by this many milliseconds
    #[arg(long, default_value_t = 0)]
    delay_ms: u64,

    /// Exit with status 1 before reading any input
    #[arg(long)]
    fail_startup: bool,

    /// Answer initialize with a JSON-RPC error
    #[arg(long)]
    reject_initialize: bool,

    /// Advertise an additional tool that echoes its arguments
    #[arg(long)]
    extra_tool: Vec<String>,

    /// Write a non-protocol line to stdout before serving
    #[arg(long)]
    noisy: bool,

    /// Exit with status 4 this many milliseconds after starting
    #[arg(long)]
    exit_after_ms: Option<u64>,
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    let args = Args::parse();
    if args.fail_startup {
        eprintln!("{}: refusing to start", args.name);
        std::process::exit(1);
    }
    eprintln!("{}: ready", args.name);

    if let Some(ms) = args.exit_after_ms {
        let name = args.name.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            eprintln!("{name}: exiting on timer");
            std::process::exit(4);
        });
    }

    let stdout = Arc::new(Mutex::new(tokio::io::stdout()));
    if args.noisy {
        write_line(&stdout, &format!("{} starting up", args.name)).await?;
    }

    let calls = Arc::new(AtomicU64::new(0));
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let Ok(msg) = serde_json::from_str::<serde_json::Value>(&line) else {
            eprintln!("{}: ignoring unparseable line", args.name);
            continue;
        };
        let method = msg["method"].as_str().unwrap_or_default().to_string();
        let Some(id) = msg["id"].as_u64() else {
            if method == "shutdown" {
                eprintln!("{}: shutdown requested", args.name);
            }
            continue;
        };
        let params = msg["params"].clone();

        match method.as_str() {
            "initialize" if args.reject_initialize => {
                let resp = JsonRpcResponse::failure(id, -32603, "initialization refused");
                write_response(&stdout, &resp).await?;
            }
            "initialize" => {
                let resp = JsonRpcResponse::success(
                    id,
                    serde_json::json!({
                        "protocolVersion": PROTOCOL_VERSION,
                        "capabilities": {"tools": {}},
                        "serverInfo": {"name": args.name, "version": env!("CARGO_PKG_VERSION")}
                    }),
                );
                write_response(&stdout, &resp).await?;
            }
            "tools/list" => {
                let resp = JsonRpcResponse::success(id, serde_json::to_value(catalog(&args))?);
                write_response(&stdout, &resp).await?;
            }
            "tools/call" => {
                let tool = params["name"].as_str().unwrap_or_default().to_string();
                if tool == "crash" {
                    eprintln!("{}: crashing on request", args.name);
                    std::process::exit(3);
                }
                let count = calls.fetch_add(1, Ordering::SeqCst) + 1;
                let result = call(&args, &tool, &params["arguments"], count);
                let stdout = stdout.clone();
                let delay = args.delay_ms;
                // Answer asynchronously so slow calls do not block later ones.
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    let value = serde_json::to_value(result).unwrap_or_default();
                    let _ = write_response(&stdout, &JsonRpcResponse::success(id, value)).await;
                });
            }
            _ => {
                let resp = JsonRpcResponse::failure(id, -32601, format!("Method not found: {method}"));
                write_response(&stdout, &resp).await?;
            }
        }
    }
    Ok(())
}

fn catalog(args: &Args) -> ToolsListResult {
    let mut tools = vec![
        ToolSchema {
            name: "ping".into(),
            description: "Reply with pong".into(),
            input_schema: serde_json::json!({"type": "object", "properties": {}}),
        },
        ToolSchema {
            name: "info".into(),
            description: "Describe this server".into(),
            input_schema: serde_json::json!({"type": "object", "properties": {}}),
        },
    ];
    tools.extend(args.extra_tool.iter().map(|name| ToolSchema {
        name: name.clone(),
        description: "Echo the arguments".into(),
        input_schema: serde_json::json!({"type": "object"}),
    }));
    ToolsListResult { tools }
}

fn call(args: &Args, tool: &str, arguments: &serde_json::Value, count: u64) -> ToolCallResult {
    let text = match tool {
        "ping" => format!("pong from {} via {tool}", args.name),
        "info" => serde_json::json!({"server": args.name, "tool": tool, "calls": count}).to_string(),
        other if args.extra_tool.iter().any(|t| t == other) => {
            format!("{} {other} {arguments}", args.name)
        }
        other => {
            return ToolCallResult {
                content: vec![ContentBlock::text(format!("unknown tool: {other}"))],
                is_error: true,
            }
        }
    };
    ToolCallResult {
        content: vec![ContentBlock::text(text)],
        is_error: false,
    }
}

async fn write_response(
    stdout: &Mutex<tokio::io::Stdout>,
    resp: &JsonRpcResponse,
) -> std::io::Result<()> {
    write_line(stdout, &serde_json::to_string(resp)?).await
}

async fn write_line(stdout: &Mutex<tokio::io::Stdout>, line: &str) -> std::io::Result<()> {
    let mut out = stdout.lock().await;
    out.write_all(line.as_bytes()).await?;
    out.write_all(b"\n").await?;
    out.flush().await
}
