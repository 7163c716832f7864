//! Byte delivery for JSON-RPC envelopes.
//!
//! A [`Transport`] only moves envelopes. Responses to requests are handed to
//! the shared [`PendingRequests`] table, which is where the waiting caller
//! picks them up; the connection never needs to know which transport it is
//! talking through.

pub mod http;
pub mod stdio;

pub use http::HttpTransport;
pub use stdio::StdioTransport;

use crate::config::{ServerConfig, TransportConfig};
use crate::pending::PendingRequests;
use crate::protocol::Outbound;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use toolgate_core::ToolgateResult;

/// Out-of-band things a server did that are not responses.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// A line the server wrote to stderr, or a non-protocol line on stdout.
    Diagnostic { server: String, line: String },
    /// A server-initiated notification.
    Notification {
        server: String,
        method: String,
        params: Option<serde_json::Value>,
    },
    /// The transport stopped delivering data on its own.
    Closed { server: String, reason: String },
}

/// Everything a transport shares with its owning connection.
#[derive(Clone)]
pub struct TransportContext {
    pub server: String,
    pub pending: Arc<PendingRequests>,
    pub events: broadcast::Sender<ConnectionEvent>,
}

impl TransportContext {
    pub(crate) fn emit(&self, event: ConnectionEvent) {
        // Nobody listening is the common case.
        let _ = self.events.send(event);
    }
}

/// The `{send, notify, close}` contract shared by every transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// `"subprocess"` or `"http"`.
    fn kind(&self) -> &'static str;

    /// Deliver one envelope. For requests, the response is routed through
    /// the pending table; this returns once the envelope is on its way (or,
    /// for HTTP, once the response has been routed).
    async fn send(&self, message: &Outbound) -> ToolgateResult<()>;

    /// False once the underlying stream is gone.
    fn is_alive(&self) -> bool;

    /// Release the resource, waiting up to `grace` for a clean exit.
    /// Idempotent.
    async fn close(&self, grace: Duration);
}

/// Establish the transport described by `config`.
pub async fn open(
    config: &ServerConfig,
    ctx: TransportContext,
) -> ToolgateResult<Arc<dyn Transport>> {
    match &config.transport {
        TransportConfig::Subprocess { command, args, env } => {
            let transport = StdioTransport::spawn(command, args, env, ctx)?;
            Ok(Arc::new(transport))
        }
        TransportConfig::Http { url, auth } => {
            let transport = HttpTransport::new(url, auth.as_ref(), ctx)?;
            Ok(Arc::new(transport))
        }
    }
}
