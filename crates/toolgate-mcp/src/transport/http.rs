//! One JSON-RPC envelope per HTTP POST.

use super::{Transport, TransportContext};
use crate::config::HttpAuth;
use crate::protocol::{JsonRpcResponse, Outbound};
use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use toolgate_core::{ToolgateError, ToolgateResult};
use tracing::debug;

/// `<base>/mcp`, unless `base` already ends in `/mcp`.
pub fn endpoint_for(base: &str) -> String {
    let trimmed = base.trim_end_matches('/');
    if trimmed.ends_with("/mcp") {
        trimmed.to_string()
    } else {
        format!("{trimmed}/mcp")
    }
}

/// Connectionless transport: each request is its own POST.
pub struct HttpTransport {
    ctx: TransportContext,
    endpoint: String,
    client: reqwest::Client,
    bearer: Option<String>,
    closed: AtomicBool,
}

impl HttpTransport {
    /// Build the client and resolve the bearer token, if any.
    pub fn new(url: &str, auth: Option<&HttpAuth>, ctx: TransportContext) -> ToolgateResult<Self> {
        let bearer = match auth {
            None => None,
            Some(HttpAuth::Bearer { token_env }) => {
                let token = std::env::var(token_env).map_err(|_| {
                    ToolgateError::Config(format!(
                        "server '{}': environment variable '{token_env}' is not set",
                        ctx.server
                    ))
                })?;
                Some(token)
            }
        };

        let client = reqwest::Client::builder().build().map_err(|e| {
            ToolgateError::transport(&ctx.server, format!("failed to build HTTP client: {e}"))
        })?;

        Ok(Self {
            endpoint: endpoint_for(url),
            ctx,
            client,
            bearer,
            closed: AtomicBool::new(false),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn post(&self, body: String) -> reqwest::RequestBuilder {
        let request = self
            .client
            .post(&self.endpoint)
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json")
            .body(body);
        match &self.bearer {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn kind(&self) -> &'static str {
        "http"
    }

    async fn send(&self, message: &Outbound) -> ToolgateResult<()> {
        let server = &self.ctx.server;
        if self.closed.load(Ordering::SeqCst) {
            return Err(ToolgateError::transport(server, "transport closed"));
        }

        let request = self.post(message.to_json()?);

        let expected_id = match message {
            Outbound::Notification(note) => {
                let server = server.clone();
                let method = note.method.clone();
                tokio::spawn(async move {
                    if let Err(e) = request.send().await {
                        debug!(server = %server, method = %method, error = %e, "Notification POST failed");
                    }
                });
                return Ok(());
            }
            Outbound::Request(req) => req.id,
        };

        let response = request.send().await.map_err(|e| {
            ToolgateError::transport(server, format!("POST {} failed: {e}", self.endpoint))
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ToolgateError::transport(
                server,
                format!("HTTP {status} from {}", self.endpoint),
            ));
        }

        let body = response.text().await.map_err(|e| {
            ToolgateError::transport(server, format!("failed to read response body: {e}"))
        })?;
        let parsed: JsonRpcResponse = serde_json::from_str(&body)
            .map_err(|e| ToolgateError::protocol(server, format!("malformed response body: {e}")))?;

        if parsed.id != Some(expected_id) {
            return Err(ToolgateError::protocol(
                server,
                format!(
                    "response id {:?} does not match request id {expected_id}",
                    parsed.id
                ),
            ));
        }

        self.ctx.pending.resolve(parsed);
        Ok(())
    }

    fn is_alive(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self, _grace: Duration) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_suffixing() {
        assert_eq!(endpoint_for("http://h:1"), "http://h:1/mcp");
        assert_eq!(endpoint_for("http://h:1/"), "http://h:1/mcp");
        assert_eq!(endpoint_for("http://h:1/mcp"), "http://h:1/mcp");
        assert_eq!(endpoint_for("http://h:1/api/mcp/"), "http://h:1/api/mcp");
        assert_eq!(endpoint_for("http://h:1/api"), "http://h:1/api/mcp");
    }

    fn context(server: &str) -> TransportContext {
        let (events, _) = tokio::sync::broadcast::channel(8);
        TransportContext {
            server: server.into(),
            pending: std::sync::Arc::new(crate::pending::PendingRequests::new(server)),
            events,
        }
    }

    #[test]
    fn test_transport_posts_to_suffixed_endpoint() {
        let transport = HttpTransport::new("http://tools.local:8080/", None, context("search")).unwrap();
        assert_eq!(transport.endpoint(), "http://tools.local:8080/mcp");
    }

    #[test]
    fn test_missing_token_env_is_config_error() {
        let auth = HttpAuth::Bearer {
            token_env: "TOOLGATE_HTTP_UNIT_TOKEN_UNSET".into(),
        };
        let err = HttpTransport::new("http://tools.local", Some(&auth), context("search"))
            .err()
            .unwrap();
        assert!(matches!(err, ToolgateError::Config(ref msg) if msg.contains("TOOLGATE_HTTP_UNIT_TOKEN_UNSET")));
    }
}
