//! A JSON-RPC session with exactly one tool server.

use crate::config::ServerConfig;
use crate::pending::PendingRequests;
use crate::protocol::*;
use crate::transport::{self, ConnectionEvent, Transport, TransportContext};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use toolgate_core::{ToolgateError, ToolgateResult};
use tracing::{debug, info, warn};

/// How long a subprocess gets to exit after stdin is closed.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Upper bound on delivering the best-effort `shutdown` notification.
const SHUTDOWN_NOTIFY_TIMEOUT: Duration = Duration::from_millis(500);

const EVENT_CAPACITY: usize = 256;

/// What the server told us during the handshake.
#[derive(Debug, Clone)]
pub struct ServerSession {
    pub protocol_version: String,
    pub server_info: Option<ServerInfo>,
    pub capabilities: ServerCapabilities,
}

/// Owns at most one transport to one server.
///
/// Request ids start at 1 and increase for the lifetime of the connection,
/// across reconnects. Any number of requests may be outstanding at once.
pub struct Connection {
    config: ServerConfig,
    next_id: AtomicU64,
    pending: Arc<PendingRequests>,
    events: broadcast::Sender<ConnectionEvent>,
    /// Serializes connect and shutdown so only one handshake runs at a time.
    lifecycle: Mutex<()>,
    transport: RwLock<Option<Arc<dyn Transport>>>,
    connected: AtomicBool,
    session: RwLock<Option<ServerSession>>,
    tools: RwLock<Vec<ToolSchema>>,
}

impl Connection {
    pub fn new(config: ServerConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            pending: Arc::new(PendingRequests::new(config.name.clone())),
            config,
            next_id: AtomicU64::new(1),
            events,
            lifecycle: Mutex::new(()),
            transport: RwLock::new(None),
            connected: AtomicBool::new(false),
            session: RwLock::new(None),
            tools: RwLock::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Connected and the transport still delivers data.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
            && self
                .transport
                .read()
                .as_ref()
                .is_some_and(|t| t.is_alive())
    }

    /// Cached tool catalog from the last `tools/list`.
    pub fn tools(&self) -> Vec<ToolSchema> {
        self.tools.read().clone()
    }

    pub fn session(&self) -> Option<ServerSession> {
        self.session.read().clone()
    }

    pub fn server_info(&self) -> Option<ServerInfo> {
        self.session.read().as_ref().and_then(|s| s.server_info.clone())
    }

    pub fn protocol_version(&self) -> Option<String> {
        self.session.read().as_ref().map(|s| s.protocol_version.clone())
    }

    pub fn capabilities(&self) -> Option<ServerCapabilities> {
        self.session.read().as_ref().map(|s| s.capabilities.clone())
    }

    /// Requests sent and not yet answered, timed out or rejected.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Diagnostics, server notifications and stream closures.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// The handles a transport needs to route responses and events back here.
    pub fn transport_context(&self) -> TransportContext {
        TransportContext {
            server: self.config.name.clone(),
            pending: self.pending.clone(),
            events: self.events.clone(),
        }
    }

    /// Establish the configured transport, run the handshake and return the
    /// tool catalog. Returns the cached catalog when already connected.
    pub async fn connect(&self) -> ToolgateResult<Vec<ToolSchema>> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.is_connected() {
            return Ok(self.tools());
        }
        self.release_stale().await;
        self.pending.reopen();

        let transport = transport::open(&self.config, self.transport_context()).await?;
        self.handshake_over(transport).await
    }

    /// Like [`connect`](Self::connect), over a transport the caller built
    /// from [`transport_context`](Self::transport_context).
    pub async fn connect_over(&self, transport: Arc<dyn Transport>) -> ToolgateResult<Vec<ToolSchema>> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.is_connected() {
            return Ok(self.tools());
        }
        self.release_stale().await;
        self.pending.reopen();
        self.handshake_over(transport).await
    }

    /// Invoke a tool. A result with `is_error` set is a tool-level failure and
    /// still comes back as `Ok`.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> ToolgateResult<ToolCallResult> {
        self.ensure_connected()?;
        let params = serde_json::json!({
            "name": name,
            "arguments": arguments,
        });
        let result = self.request(methods::TOOLS_CALL, Some(params)).await?;
        let result: ToolCallResult = serde_json::from_value(result).map_err(|e| {
            ToolgateError::protocol(&self.config.name, format!("invalid tools/call result: {e}"))
        })?;
        if result.is_error {
            debug!(server = %self.config.name, tool = %name, "Tool reported an error");
        }
        Ok(result)
    }

    /// Re-issue `tools/list` and replace the cached catalog.
    pub async fn refresh_tools(&self) -> ToolgateResult<Vec<ToolSchema>> {
        self.ensure_connected()?;
        self.list_tools().await
    }

    /// Notify the server, reject everything pending, release the transport.
    /// Safe to call repeatedly and concurrently with in-flight calls.
    pub async fn shutdown(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        self.connected.store(false, Ordering::SeqCst);
        let Some(transport) = self.transport.write().take() else {
            return;
        };

        let notice = Outbound::Notification(JsonRpcNotification::new(methods::SHUTDOWN, None));
        match tokio::time::timeout(SHUTDOWN_NOTIFY_TIMEOUT, transport.send(&notice)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(server = %self.config.name, error = %e, "Shutdown notification failed"),
            Err(_) => debug!(server = %self.config.name, "Shutdown notification timed out"),
        }

        let server = self.config.name.clone();
        let rejected = self.pending.reject_all(|| ToolgateError::ShuttingDown {
            server: server.clone(),
        });
        transport.close(SHUTDOWN_GRACE).await;
        info!(server = %self.config.name, rejected, "Connection shut down");
    }

    async fn handshake_over(&self, transport: Arc<dyn Transport>) -> ToolgateResult<Vec<ToolSchema>> {
        let kind = transport.kind();
        *self.transport.write() = Some(transport.clone());

        match self.handshake().await {
            Ok(tools) => {
                self.connected.store(true, Ordering::SeqCst);
                info!(
                    server = %self.config.name,
                    transport = kind,
                    tools = tools.len(),
                    "Server connected"
                );
                Ok(tools)
            }
            Err(e) => {
                warn!(server = %self.config.name, error = %e, "Handshake failed");
                self.transport.write().take();
                let reason = e.to_string();
                self.pending
                    .fail_all(|| ToolgateError::transport(&self.config.name, reason.clone()));
                transport.close(SHUTDOWN_GRACE).await;
                Err(e)
            }
        }
    }

    async fn handshake(&self) -> ToolgateResult<Vec<ToolSchema>> {
        let result = self
            .request(methods::INITIALIZE, Some(initialize_params()))
            .await?;
        let init: InitializeResult = serde_json::from_value(result).map_err(|e| {
            ToolgateError::protocol(&self.config.name, format!("invalid initialize result: {e}"))
        })?;
        debug!(
            server = %self.config.name,
            version = %init.protocol_version,
            server_name = ?init.server_info.as_ref().map(|i| i.name.as_str()),
            "Server initialized"
        );
        *self.session.write() = Some(ServerSession {
            protocol_version: init.protocol_version,
            server_info: init.server_info,
            capabilities: init.capabilities,
        });

        self.notify(methods::INITIALIZED, None).await?;
        self.list_tools().await
    }

    async fn list_tools(&self) -> ToolgateResult<Vec<ToolSchema>> {
        let result = self.request(methods::TOOLS_LIST, None).await?;
        let list: ToolsListResult = serde_json::from_value(result).map_err(|e| {
            ToolgateError::protocol(&self.config.name, format!("invalid tools/list result: {e}"))
        })?;
        *self.tools.write() = list.tools.clone();
        Ok(list.tools)
    }

    /// Send a request and wait for its response under the server's deadline.
    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> ToolgateResult<serde_json::Value> {
        let transport = self.current_transport()?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let rx = self.pending.register(id)?;
        // The reader marks the transport dead before failing pending entries,
        // so an entry registered after that sweep is caught here.
        if !transport.is_alive() {
            self.pending.remove(id);
            return Err(ToolgateError::transport(&self.config.name, "connection lost"));
        }
        let message = Outbound::Request(JsonRpcRequest::new(id, method, params));

        let exchange = async {
            transport.send(&message).await?;
            match rx.await {
                Ok(completion) => completion,
                Err(_) => Err(ToolgateError::ShuttingDown {
                    server: self.config.name.clone(),
                }),
            }
        };

        let timeout = self.config.timeout;
        match tokio::time::timeout(timeout, exchange).await {
            Ok(Ok(response)) => response.into_result(&self.config.name),
            Ok(Err(e)) => {
                self.pending.remove(id);
                Err(e)
            }
            Err(_) => {
                self.pending.remove(id);
                warn!(server = %self.config.name, method, id, "Request timed out");
                Err(ToolgateError::Timeout {
                    server: self.config.name.clone(),
                    method: method.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    async fn notify(&self, method: &str, params: Option<serde_json::Value>) -> ToolgateResult<()> {
        let transport = self.current_transport()?;
        transport
            .send(&Outbound::Notification(JsonRpcNotification::new(method, params)))
            .await
    }

    fn current_transport(&self) -> ToolgateResult<Arc<dyn Transport>> {
        self.transport
            .read()
            .clone()
            .ok_or_else(|| ToolgateError::NotConnected {
                server: self.config.name.clone(),
            })
    }

    fn ensure_connected(&self) -> ToolgateResult<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(ToolgateError::NotConnected {
                server: self.config.name.clone(),
            })
        }
    }

    /// Drop a transport whose stream died without a shutdown.
    async fn release_stale(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let stale = self.transport.write().take();
        if let Some(stale) = stale {
            debug!(server = %self.config.name, "Releasing dead transport before reconnecting");
            stale.close(SHUTDOWN_GRACE).await;
        }
    }
}
