//! Newline-delimited JSON over a child process's stdio.

use super::{ConnectionEvent, Transport, TransportContext};
use crate::protocol::{JsonRpcResponse, Outbound};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use toolgate_core::{ToolgateError, ToolgateResult};
use tracing::{debug, warn};

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Subprocess transport. Also usable over any reader/writer pair.
pub struct StdioTransport {
    server: String,
    writer: Mutex<Option<BoxedWriter>>,
    child: Mutex<Option<Child>>,
    alive: Arc<AtomicBool>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl StdioTransport {
    /// Spawn `command` with piped stdin/stdout/stderr.
    pub fn spawn(
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
        ctx: TransportContext,
    ) -> ToolgateResult<Self> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .envs(env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            ToolgateError::transport(&ctx.server, format!("failed to spawn '{command}': {e}"))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ToolgateError::transport(&ctx.server, "stdin not available"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ToolgateError::transport(&ctx.server, "stdout not available"))?;
        let stderr = child.stderr.take();

        debug!(server = %ctx.server, command, pid = ?child.id(), "Spawned server process");

        let transport = Self::build(stdout, stdin, ctx.clone(), Some(child));
        if let Some(stderr) = stderr {
            let handle = tokio::spawn(forward_stderr(stderr, ctx));
            transport.tasks.lock().push(handle);
        }
        Ok(transport)
    }

    /// Speak the protocol over an arbitrary stream pair. The reader is
    /// consumed by a background task until EOF.
    pub fn from_streams<R, W>(reader: R, writer: W, ctx: TransportContext) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::build(reader, writer, ctx, None)
    }

    fn build<R, W>(reader: R, writer: W, ctx: TransportContext, child: Option<Child>) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let alive = Arc::new(AtomicBool::new(true));
        let server = ctx.server.clone();
        let handle = tokio::spawn(read_loop(reader, ctx, alive.clone()));
        Self {
            server,
            writer: Mutex::new(Some(Box::new(writer))),
            child: Mutex::new(child),
            alive,
            tasks: parking_lot::Mutex::new(vec![handle]),
        }
    }
}

#[async_trait]
impl Transport for StdioTransport {
    fn kind(&self) -> &'static str {
        "subprocess"
    }

    async fn send(&self, message: &Outbound) -> ToolgateResult<()> {
        let mut line = message.to_json()?;
        line.push('\n');

        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| ToolgateError::transport(&self.server, "stdin already closed"))?;
        let method = message.method();
        writer.write_all(line.as_bytes()).await.map_err(|e| {
            ToolgateError::transport(
                &self.server,
                format!("failed to write {method} to stdin: {e}"),
            )
        })?;
        writer.flush().await.map_err(|e| {
            ToolgateError::transport(
                &self.server,
                format!("failed to flush {method} to stdin: {e}"),
            )
        })?;
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn close(&self, grace: Duration) {
        self.alive.store(false, Ordering::SeqCst);

        // Taking the writer waits for any write in progress to finish.
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }

        if let Some(mut child) = self.child.lock().await.take() {
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(Ok(status)) => debug!(server = %self.server, %status, "Server process exited"),
                Ok(Err(e)) => warn!(server = %self.server, error = %e, "Failed to wait for server process"),
                Err(_) => {
                    warn!(
                        server = %self.server,
                        grace_ms = grace.as_millis() as u64,
                        "Server process did not exit in time, killing"
                    );
                    if let Err(e) = child.kill().await {
                        warn!(server = %self.server, error = %e, "Failed to kill server process");
                    }
                }
            }
        }

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

async fn read_loop<R>(reader: R, ctx: TransportContext, alive: Arc<AtomicBool>)
where
    R: AsyncRead + Send + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    let reason = loop {
        match lines.next_line().await {
            Ok(Some(line)) => handle_line(&line, &ctx),
            Ok(None) => break "server closed its output stream".to_string(),
            Err(e) => break format!("failed to read server output: {e}"),
        }
    };

    alive.store(false, Ordering::SeqCst);
    let failed = ctx
        .pending
        .fail_all(|| ToolgateError::transport(&ctx.server, reason.clone()));
    debug!(server = %ctx.server, %reason, failed, "Server output stream ended");
    ctx.emit(ConnectionEvent::Closed {
        server: ctx.server.clone(),
        reason,
    });
}

fn handle_line(line: &str, ctx: &TransportContext) {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return;
    }

    let value: serde_json::Value = match serde_json::from_str(trimmed) {
        Ok(v) => v,
        Err(_) => {
            debug!(server = %ctx.server, line = %trimmed, "Non-JSON line from server");
            ctx.emit(ConnectionEvent::Diagnostic {
                server: ctx.server.clone(),
                line: trimmed.to_string(),
            });
            return;
        }
    };

    if let Some(method) = value.get("method").and_then(|m| m.as_str()) {
        if value.get("id").is_some() {
            debug!(server = %ctx.server, method, "Ignoring server-initiated request");
        } else {
            ctx.emit(ConnectionEvent::Notification {
                server: ctx.server.clone(),
                method: method.to_string(),
                params: value.get("params").cloned(),
            });
        }
        return;
    }

    match serde_json::from_value::<JsonRpcResponse>(value) {
        Ok(response) => {
            ctx.pending.resolve(response);
        }
        Err(e) => debug!(server = %ctx.server, error = %e, "Unparseable JSON-RPC frame"),
    }
}

async fn forward_stderr(stderr: tokio::process::ChildStderr, ctx: TransportContext) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(server = %ctx.server, line = %line, "Server stderr");
        ctx.emit(ConnectionEvent::Diagnostic {
            server: ctx.server.clone(),
            line,
        });
    }
}
