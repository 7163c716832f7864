use thiserror::Error;

/// A convenience `Result` alias using [`ToolgateError`].
pub type ToolgateResult<T> = Result<T, ToolgateError>;

/// Top-level error type for toolgate.
///
/// Tool-level failures (`isError` in a `tools/call` result) are not errors:
/// they come back as data. Everything here is a failure of the server, the
/// transport or the caller's request.
#[derive(Error, Debug)]
pub enum ToolgateError {
    /// The transport could not be established or the byte stream broke
    /// (spawn failure, unwritable stdin, closed stdout, non-2xx HTTP status).
    #[error("Transport error for server '{server}': {reason}")]
    Transport {
        /// Server the transport belongs to.
        server: String,
        /// Human-readable cause.
        reason: String,
    },

    /// The server answered, but not with a usable JSON-RPC result.
    #[error("Protocol error from server '{server}': {message}")]
    Protocol {
        /// Server that produced the response.
        server: String,
        /// JSON-RPC error code, when the server sent an error object.
        code: Option<i64>,
        /// Error message.
        message: String,
    },

    /// No response arrived before the per-server deadline.
    #[error("Request '{method}' to server '{server}' timed out after {timeout_ms}ms")]
    Timeout {
        /// Server the request was sent to.
        server: String,
        /// JSON-RPC method of the request.
        method: String,
        /// Deadline that expired, in milliseconds.
        timeout_ms: u64,
    },

    /// The server's circuit breaker rejected the call without attempting it.
    #[error("Circuit open for server '{server}'")]
    CircuitOpen {
        /// Server whose breaker is open.
        server: String,
    },

    /// No discovered server exposes the requested tool.
    #[error("No server found for tool '{tool}'")]
    NoServerForTool {
        /// Requested tool name.
        tool: String,
    },

    /// An operation that needs a live connection was called before `connect()`.
    #[error("Server '{server}' is not connected")]
    NotConnected {
        /// Server name.
        server: String,
    },

    /// The connection is being torn down; pending requests are rejected with this.
    #[error("Server '{server}' is shutting down")]
    ShuttingDown {
        /// Server name.
        server: String,
    },

    /// Registry file is malformed or a server entry is invalid.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ToolgateError {
    /// Shorthand for a [`ToolgateError::Transport`].
    pub fn transport(server: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Transport {
            server: server.into(),
            reason: reason.into(),
        }
    }

    /// Shorthand for a [`ToolgateError::Protocol`] without a JSON-RPC code.
    pub fn protocol(server: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Protocol {
            server: server.into(),
            code: None,
            message: message.into(),
        }
    }

    /// True for deadline expiries, so retry logic can treat them separately.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// True when a breaker refused the call.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    /// Whether a circuit breaker should record this error as a failure.
    ///
    /// Rejections by the breaker itself never count as a new failure.
    pub fn counts_as_failure(&self) -> bool {
        !self.is_circuit_open()
    }
}
