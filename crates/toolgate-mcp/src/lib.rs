//! JSON-RPC 2.0 tool client for many independently failing servers.
//!
//! A [`ConnectionManager`] reads a server registry, keeps one [`Connection`]
//! and one [`CircuitBreaker`] per server, merges every server's tool catalog
//! into a routing table and dispatches `tools/call` requests to the owning
//! server. Servers are reached over subprocess stdio or HTTP.

pub mod breaker;
pub mod config;
pub mod connection;
pub mod manager;
pub mod pending;
pub mod protocol;
pub mod transport;

pub use breaker::{BreakerConfig, BreakerSnapshot, CircuitBreaker, CircuitState, Transition};
pub use config::{load_registry, HttpAuth, Registry, ServerConfig, TransportConfig};
pub use connection::{Connection, ServerSession};
pub use manager::{ConnectionManager, ServerStatus};
pub use protocol::{ContentBlock, ToolCallResult, ToolSchema};
pub use transport::{ConnectionEvent, Transport};
