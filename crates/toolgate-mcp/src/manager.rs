use crate::breaker::{BreakerConfig, CircuitBreaker, CircuitState};
use crate::config::{load_registry, Registry, ServerConfig};
use crate::connection::Connection;
use crate::protocol::{ToolCallResult, ToolSchema};
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use toolgate_core::{ToolgateError, ToolgateResult};
use tracing::{debug, info, warn};

/// Health row for one registered server.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub name: String,
    pub transport: &'static str,
    pub connected: bool,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub tool_count: usize,
    pub last_error: Option<String>,
    pub connected_at: Option<DateTime<Utc>>,
    pub last_opened_at: Option<DateTime<Utc>>,
    pub last_health_check: Option<DateTime<Utc>>,
    pub reconnect_count: usize,
}

/// Internal state for a registered server.
struct ManagedServer {
    config: ServerConfig,
    connection: Arc<Connection>,
    breaker: Arc<CircuitBreaker>,
    /// Tools reported by the last successful connect or refresh.
    tools: Vec<ToolSchema>,
    last_error: Option<String>,
    connected_at: Option<DateTime<Utc>>,
    last_health_check: Option<DateTime<Utc>>,
    reconnect_count: usize,
}

impl ManagedServer {
    fn new(config: ServerConfig, breaker: &BreakerConfig) -> Self {
        Self {
            connection: Arc::new(Connection::new(config.clone())),
            breaker: Arc::new(CircuitBreaker::new(config.name.clone(), breaker.clone())),
            config,
            tools: Vec::new(),
            last_error: None,
            connected_at: None,
            last_health_check: None,
            reconnect_count: 0,
        }
    }

    fn handles(&self) -> (String, Arc<Connection>, Arc<CircuitBreaker>) {
        (
            self.config.name.clone(),
            self.connection.clone(),
            self.breaker.clone(),
        )
    }

    /// Fold the outcome of a connect or refresh into the server's record.
    fn record(&mut self, outcome: ToolgateResult<Vec<ToolSchema>>, was_connected: bool) {
        match outcome {
            Ok(tools) => {
                if !was_connected {
                    if self.connected_at.is_some() {
                        self.reconnect_count += 1;
                    }
                    self.connected_at = Some(Utc::now());
                }
                self.tools = tools;
                self.last_error = None;
            }
            Err(e) => {
                if e.is_circuit_open() {
                    debug!(server = %self.config.name, "Skipped: circuit open");
                } else {
                    warn!(server = %self.config.name, error = %e, "Server unavailable");
                    self.last_error = Some(e.to_string());
                }
                // Tools only stay routable while their connection is alive.
                if !self.connection.is_connected() {
                    self.tools.clear();
                }
            }
        }
    }
}

#[derive(Default)]
struct ManagerState {
    servers: HashMap<String, ManagedServer>,
    /// Server names in registry order.
    order: Vec<String>,
    /// Tool name to owning server.
    routes: HashMap<String, String>,
    catalog: Vec<ToolSchema>,
    initialized: bool,
}

impl ManagerState {
    /// Withdraw the tools of every server whose connection has died.
    /// Returns whether anything was withdrawn.
    fn withdraw_dead(&mut self) -> bool {
        let mut withdrawn = false;
        for server in self.servers.values_mut() {
            if !server.tools.is_empty() && !server.connection.is_connected() {
                warn!(
                    server = %server.config.name,
                    tools = server.tools.len(),
                    "Connection lost, withdrawing tools"
                );
                server.tools.clear();
                withdrawn = true;
            }
        }
        withdrawn
    }

    fn has_dead_routes(&self) -> bool {
        self.servers
            .values()
            .any(|s| !s.tools.is_empty() && !s.connection.is_connected())
    }

    /// Rebuild routes and the merged catalog from every server's tools, in
    /// registry order. A tool offered by several servers routes to the last.
    fn rebuild_routes(&mut self) {
        let mut routes: HashMap<String, String> = HashMap::new();
        for name in &self.order {
            let Some(server) = self.servers.get(name) else {
                continue;
            };
            for tool in &server.tools {
                if let Some(previous) = routes.insert(tool.name.clone(), name.clone()) {
                    if previous != *name {
                        warn!(
                            tool = %tool.name,
                            previous = %previous,
                            winner = %name,
                            "Tool name collision, last discovered server wins"
                        );
                    }
                }
            }
        }

        let catalog = self
            .order
            .iter()
            .filter_map(|name| self.servers.get(name))
            .flat_map(|server| {
                server
                    .tools
                    .iter()
                    .filter(|tool| routes.get(&tool.name) == Some(&server.config.name))
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect();

        self.routes = routes;
        self.catalog = catalog;
    }
}

/// Coordinates one [`Connection`] and one [`CircuitBreaker`] per registered
/// server and dispatches tool calls through a shared routing table.
pub struct ConnectionManager {
    registry_path: PathBuf,
    breaker_defaults: BreakerConfig,
    state: RwLock<ManagerState>,
    /// Serializes discovery, health checks and shutdown.
    discovery: Mutex<()>,
}

impl ConnectionManager {
    pub fn new(registry_path: impl Into<PathBuf>) -> Self {
        Self {
            registry_path: registry_path.into(),
            breaker_defaults: BreakerConfig::default(),
            state: RwLock::new(ManagerState::default()),
            discovery: Mutex::new(()),
        }
    }

    /// Breaker settings used when the registry does not override them.
    pub fn with_breaker_config(mut self, config: BreakerConfig) -> Self {
        self.breaker_defaults = config;
        self
    }

    pub fn registry_path(&self) -> &Path {
        &self.registry_path
    }

    /// Keep routes pointing at live connections only. A server whose stream
    /// ended since the last pass loses its tools until it reconnects.
    async fn prune_dead(&self) {
        if !self.state.read().await.has_dead_routes() {
            return;
        }
        let mut state = self.state.write().await;
        if state.withdraw_dead() {
            state.rebuild_routes();
        }
    }

    /// Load the registry, connect every server concurrently and rebuild the
    /// routing table. Servers that fail stay registered with their error.
    ///
    /// A missing registry file is not an error: the result is an empty
    /// catalog.
    pub async fn discover_tools(&self) -> ToolgateResult<Vec<ToolSchema>> {
        let _pass = self.discovery.lock().await;

        let registry = match load_registry(&self.registry_path, &self.breaker_defaults).await? {
            Some(registry) => registry,
            None => Registry {
                servers: Vec::new(),
                breaker: self.breaker_defaults.clone(),
            },
        };

        let (targets, retired) = self.adopt_registry(registry).await;
        for server in &retired {
            info!(server = %server.config.name, "Server removed from registry");
            server.connection.shutdown().await;
        }

        if targets.is_empty() {
            let mut state = self.state.write().await;
            state.rebuild_routes();
            state.initialized = true;
            debug!(path = %self.registry_path.display(), "No servers configured");
            return Ok(state.catalog.clone());
        }

        let attempts = targets.iter().map(|(name, connection, breaker)| async move {
            let was_connected = connection.is_connected();
            let outcome = breaker.execute(|| connection.connect()).await;
            (name, was_connected, outcome)
        });
        let outcomes = join_all(attempts).await;

        let mut state = self.state.write().await;
        let mut healthy = 0usize;
        for (name, was_connected, outcome) in outcomes {
            if outcome.is_ok() {
                healthy += 1;
            }
            if let Some(server) = state.servers.get_mut(name) {
                server.record(outcome, was_connected);
            }
        }
        state.rebuild_routes();
        state.initialized = true;

        info!(
            servers = state.order.len(),
            healthy,
            tools = state.catalog.len(),
            "Tool discovery complete"
        );
        Ok(state.catalog.clone())
    }

    /// Install `registry` as the set of managed servers, reusing entries
    /// whose configuration is unchanged. Returns the servers to connect and
    /// the ones to shut down.
    async fn adopt_registry(
        &self,
        registry: Registry,
    ) -> (
        Vec<(String, Arc<Connection>, Arc<CircuitBreaker>)>,
        Vec<ManagedServer>,
    ) {
        let mut state = self.state.write().await;
        let mut previous = std::mem::take(&mut state.servers);
        let mut retired = Vec::new();
        let mut order = Vec::with_capacity(registry.servers.len());

        for config in registry.servers {
            let name = config.name.clone();
            let server = match previous.remove(&name) {
                Some(existing)
                    if existing.config == config
                        && *existing.breaker.config() == registry.breaker =>
                {
                    existing
                }
                Some(stale) => {
                    retired.push(stale);
                    ManagedServer::new(config, &registry.breaker)
                }
                None => ManagedServer::new(config, &registry.breaker),
            };
            state.servers.insert(name.clone(), server);
            order.push(name);
        }
        retired.extend(previous.into_values());
        state.order = order;

        let targets = state
            .order
            .iter()
            .filter_map(|name| state.servers.get(name))
            .map(ManagedServer::handles)
            .collect();
        (targets, retired)
    }

    /// Call `tool` on the server that owns it, through that server's breaker.
    pub async fn call_tool(
        &self,
        tool: &str,
        arguments: serde_json::Value,
    ) -> ToolgateResult<ToolCallResult> {
        self.prune_dead().await;
        let (server, connection, breaker) = {
            let state = self.state.read().await;
            let owner = state
                .routes
                .get(tool)
                .and_then(|name| state.servers.get(name))
                .ok_or_else(|| ToolgateError::NoServerForTool {
                    tool: tool.to_string(),
                })?;
            owner.handles()
        };
        self.dispatch(&server, &connection, &breaker, tool, arguments)
            .await
    }

    /// Call `tool` on a named server, bypassing the routing table. Reaches
    /// tools that lost a name collision.
    pub async fn call_server_tool(
        &self,
        server: &str,
        tool: &str,
        arguments: serde_json::Value,
    ) -> ToolgateResult<ToolCallResult> {
        let (server, connection, breaker) = {
            let state = self.state.read().await;
            state
                .servers
                .get(server)
                .map(ManagedServer::handles)
                .ok_or_else(|| ToolgateError::NotConnected {
                    server: server.to_string(),
                })?
        };
        self.dispatch(&server, &connection, &breaker, tool, arguments)
            .await
    }

    async fn dispatch(
        &self,
        server: &str,
        connection: &Connection,
        breaker: &CircuitBreaker,
        tool: &str,
        arguments: serde_json::Value,
    ) -> ToolgateResult<ToolCallResult> {
        debug!(server = %server, tool = %tool, "Dispatching tool call");
        let result = breaker
            .execute(|| connection.call_tool(tool, arguments))
            .await;
        if let Err(e) = &result {
            if e.counts_as_failure() {
                let mut state = self.state.write().await;
                if let Some(managed) = state.servers.get_mut(server) {
                    managed.last_error = Some(e.to_string());
                }
                if state.withdraw_dead() {
                    state.rebuild_routes();
                }
            }
        }
        result
    }

    /// Tools last reported by `server`; empty for unknown servers.
    pub async fn get_tools_by_server(&self, server: &str) -> Vec<ToolSchema> {
        self.prune_dead().await;
        self.state
            .read()
            .await
            .servers
            .get(server)
            .map(|s| s.tools.clone())
            .unwrap_or_default()
    }

    /// The merged catalog, one entry per routable tool name.
    pub async fn get_all_tools(&self) -> Vec<ToolSchema> {
        self.prune_dead().await;
        self.state.read().await.catalog.clone()
    }

    /// Breaker state of `server`, or `None` if it is not registered.
    pub async fn get_server_state(&self, server: &str) -> Option<CircuitState> {
        self.state
            .read()
            .await
            .servers
            .get(server)
            .map(|s| s.breaker.state())
    }

    /// Registered servers, healthy or not.
    pub async fn server_count(&self) -> usize {
        self.state.read().await.servers.len()
    }

    /// Registered server names in registry order.
    pub async fn server_names(&self) -> Vec<String> {
        self.state.read().await.order.clone()
    }

    pub async fn is_initialized(&self) -> bool {
        self.state.read().await.initialized
    }

    /// Health rows in registry order.
    pub async fn status(&self) -> Vec<ServerStatus> {
        self.prune_dead().await;
        let state = self.state.read().await;
        state
            .order
            .iter()
            .filter_map(|name| state.servers.get(name))
            .map(|s| {
                let breaker = s.breaker.snapshot();
                ServerStatus {
                    name: s.config.name.clone(),
                    transport: s.config.transport.kind(),
                    connected: s.connection.is_connected(),
                    state: breaker.state,
                    consecutive_failures: breaker.consecutive_failures,
                    tool_count: s.tools.len(),
                    last_error: s.last_error.clone(),
                    connected_at: s.connected_at,
                    last_opened_at: breaker.last_opened_at,
                    last_health_check: s.last_health_check,
                    reconnect_count: s.reconnect_count,
                }
            })
            .collect()
    }

    /// Refresh every connected server's tools and try to reconnect the rest,
    /// all through their breakers, then rebuild routes.
    pub async fn health_check(&self) {
        let _pass = self.discovery.lock().await;
        let targets: Vec<_> = {
            let state = self.state.read().await;
            state
                .order
                .iter()
                .filter_map(|name| state.servers.get(name))
                .map(ManagedServer::handles)
                .collect()
        };
        if targets.is_empty() {
            return;
        }

        let checks = targets.iter().map(|(name, connection, breaker)| async move {
            let was_connected = connection.is_connected();
            let outcome = if was_connected {
                breaker.execute(|| connection.refresh_tools()).await
            } else {
                debug!(server = %name, "Attempting reconnection");
                breaker.execute(|| connection.connect()).await
            };
            (name, was_connected, outcome)
        });
        let outcomes = join_all(checks).await;

        let now = Utc::now();
        let mut state = self.state.write().await;
        for (name, was_connected, outcome) in outcomes {
            // A concurrent discovery pass may have replaced the server.
            let Some(server) = state.servers.get_mut(name) else {
                continue;
            };
            server.last_health_check = Some(now);
            if !was_connected && outcome.is_ok() {
                info!(server = %name, "Server reconnected");
            }
            server.record(outcome, was_connected);
        }
        state.rebuild_routes();
    }

    /// Run [`health_check`](Self::health_check) every `interval` until the
    /// returned task is aborted.
    pub fn start_health_loop(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut timer = tokio::time::interval_at(start, interval);
            loop {
                timer.tick().await;
                self.health_check().await;
            }
        })
    }

    /// Shut down every connection, reset every breaker and forget all
    /// servers. Idempotent.
    pub async fn shutdown(&self) {
        // Waits for a running discovery pass so it cannot re-populate or
        // re-initialize the manager afterwards.
        let _pass = self.discovery.lock().await;
        let drained: Vec<ManagedServer> = {
            let mut state = self.state.write().await;
            state.routes.clear();
            state.catalog.clear();
            state.order.clear();
            state.initialized = false;
            state.servers.drain().map(|(_, server)| server).collect()
        };
        if drained.is_empty() {
            return;
        }

        join_all(drained.iter().map(|s| s.connection.shutdown())).await;
        for server in &drained {
            server.breaker.reset();
        }
        info!(servers = drained.len(), "Connection manager shut down");
    }
}
