//! Server registry loading.
//!
//! The registry is a file with a `servers` list plus optional top-level
//! scalars. JSON, YAML and TOML are accepted, chosen by file extension.

use crate::breaker::BreakerConfig;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;
use toolgate_core::{ToolgateError, ToolgateResult};
use tracing::debug;

/// Default per-request deadline.
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// How to reach one server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportConfig {
    /// Spawn `command args...` and speak newline-delimited JSON over stdio.
    Subprocess {
        command: String,
        args: Vec<String>,
        env: HashMap<String, String>,
    },
    /// POST one envelope per request to `<url>/mcp`.
    Http { url: String, auth: Option<HttpAuth> },
}

impl TransportConfig {
    /// Short label used in logs and status output.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Subprocess { .. } => "subprocess",
            Self::Http { .. } => "http",
        }
    }
}

/// HTTP authentication scheme.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpAuth {
    /// `Authorization: Bearer <value of token_env>`.
    Bearer { token_env: String },
}

/// One validated registry entry. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub name: String,
    pub transport: TransportConfig,
    pub timeout: Duration,
}

impl ServerConfig {
    /// Subprocess server with the default timeout.
    pub fn subprocess(name: impl Into<String>, command: impl Into<String>, args: &[&str]) -> Self {
        Self {
            name: name.into(),
            transport: TransportConfig::Subprocess {
                command: command.into(),
                args: args.iter().map(|a| (*a).to_string()).collect(),
                env: HashMap::new(),
            },
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
        }
    }

    /// HTTP server without auth and with the default timeout.
    pub fn http(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            transport: TransportConfig::Http {
                url: url.into(),
                auth: None,
            },
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// A loaded registry: the servers plus breaker settings.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    pub servers: Vec<ServerConfig>,
    pub breaker: BreakerConfig,
}

#[derive(Debug, Deserialize)]
struct RawRegistry {
    #[serde(default)]
    servers: Vec<RawServer>,
    #[serde(default)]
    failure_threshold: Option<u32>,
    /// Milliseconds.
    #[serde(default)]
    reset_timeout: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawServer {
    #[serde(default)]
    name: String,
    #[serde(default)]
    transport: Option<String>,
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: HashMap<String, String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    auth: Option<String>,
    #[serde(default)]
    token_env: Option<String>,
    /// Milliseconds.
    #[serde(default = "default_timeout")]
    timeout: u64,
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_MS
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Json,
    Yaml,
    Toml,
}

impl Format {
    fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml" | "yml") => Self::Yaml,
            Some("toml") => Self::Toml,
            _ => Self::Json,
        }
    }
}

/// Load the registry at `path`.
///
/// Returns `Ok(None)` when the file does not exist; nothing beyond the
/// existence check touches the filesystem in that case.
pub async fn load_registry(
    path: &Path,
    defaults: &BreakerConfig,
) -> ToolgateResult<Option<Registry>> {
    if !tokio::fs::try_exists(path).await? {
        debug!(path = %path.display(), "No server registry found");
        return Ok(None);
    }
    let text = tokio::fs::read_to_string(path).await?;
    parse_registry(&text, Format::from_path(path), defaults).map(Some)
}

fn parse_registry(text: &str, format: Format, defaults: &BreakerConfig) -> ToolgateResult<Registry> {
    if text.trim().is_empty() {
        return Ok(Registry {
            servers: Vec::new(),
            breaker: defaults.clone(),
        });
    }

    let raw: RawRegistry = match format {
        Format::Json => serde_json::from_str(text)
            .map_err(|e| ToolgateError::Config(format!("invalid JSON registry: {e}")))?,
        Format::Yaml => serde_yaml::from_str(text)
            .map_err(|e| ToolgateError::Config(format!("invalid YAML registry: {e}")))?,
        Format::Toml => toml::from_str(text)
            .map_err(|e| ToolgateError::Config(format!("invalid TOML registry: {e}")))?,
    };

    let mut breaker = defaults.clone();
    if let Some(threshold) = raw.failure_threshold {
        if threshold == 0 {
            return Err(ToolgateError::Config(
                "failure_threshold must be at least 1".into(),
            ));
        }
        breaker.failure_threshold = threshold;
    }
    if let Some(ms) = raw.reset_timeout {
        breaker.reset_timeout = Duration::from_millis(ms);
    }

    let mut seen = HashSet::new();
    let mut servers = Vec::with_capacity(raw.servers.len());
    for entry in raw.servers {
        let server = validate(entry)?;
        if !seen.insert(server.name.clone()) {
            return Err(ToolgateError::Config(format!(
                "duplicate server name '{}'",
                server.name
            )));
        }
        servers.push(server);
    }

    Ok(Registry { servers, breaker })
}

fn validate(raw: RawServer) -> ToolgateResult<ServerConfig> {
    let name = raw.name.trim().to_string();
    if name.is_empty() {
        return Err(ToolgateError::Config("server entry without a name".into()));
    }

    if raw.timeout == 0 {
        return Err(ToolgateError::Config(format!(
            "server '{name}': timeout must be at least 1 ms"
        )));
    }

    let kind = match raw.transport.as_deref() {
        Some("stdio" | "subprocess") => "subprocess",
        Some("http") => "http",
        Some(other) => {
            return Err(ToolgateError::Config(format!(
                "server '{name}': unknown transport '{other}'"
            )))
        }
        None if raw.url.is_some() => "http",
        None if raw.command.is_some() => "subprocess",
        None => {
            return Err(ToolgateError::Config(format!(
                "server '{name}' needs either a command or a url"
            )))
        }
    };

    let transport = if kind == "http" {
        let url = raw
            .url
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| ToolgateError::Config(format!("server '{name}': missing url")))?;
        let auth = match raw.auth.as_deref().map(str::to_ascii_lowercase).as_deref() {
            None | Some("none") => None,
            Some("bearer") => {
                let token_env = raw.token_env.ok_or_else(|| {
                    ToolgateError::Config(format!("server '{name}': bearer auth needs token_env"))
                })?;
                Some(HttpAuth::Bearer { token_env })
            }
            Some(other) => {
                return Err(ToolgateError::Config(format!(
                    "server '{name}': unsupported auth '{other}'"
                )))
            }
        };
        TransportConfig::Http { url, auth }
    } else {
        let command = raw
            .command
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| ToolgateError::Config(format!("server '{name}': missing command")))?;
        TransportConfig::Subprocess {
            command,
            args: raw.args,
            env: raw.env,
        }
    };

    Ok(ServerConfig {
        name,
        transport,
        timeout: Duration::from_millis(raw.timeout),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn parse(text: &str, format: Format) -> ToolgateResult<Registry> {
        parse_registry(text, format, &BreakerConfig::default())
    }

    #[test]
    fn test_json_registry() {
        let reg = parse(
            r#"{"servers":[
                {"name":"files","command":"node","args":["server.js"],"timeout":5000},
                {"name":"search","url":"https://tools.example.com","auth":"bearer","token_env":"SEARCH_TOKEN"}
            ]}"#,
            Format::Json,
        )
        .unwrap();
        assert_eq!(reg.servers.len(), 2);
        assert_eq!(reg.servers[0].timeout, Duration::from_millis(5000));
        assert_eq!(reg.servers[0].transport.kind(), "subprocess");
        assert_eq!(
            reg.servers[1].transport,
            TransportConfig::Http {
                url: "https://tools.example.com".into(),
                auth: Some(HttpAuth::Bearer {
                    token_env: "SEARCH_TOKEN".into()
                }),
            }
        );
        assert_eq!(reg.servers[1].timeout, Duration::from_millis(DEFAULT_TIMEOUT_MS));
    }

    #[test]
    fn test_yaml_subset_registry() {
        let yaml = r#"
failure_threshold: 5
reset_timeout: 1000
servers:
  - name: files
    command: npx
    args: ["-y", "server-filesystem", "."]
  - name: remote
    transport: http
    url: http://localhost:9000
"#;
        let reg = parse(yaml, Format::Yaml).unwrap();
        assert_eq!(reg.breaker.failure_threshold, 5);
        assert_eq!(reg.breaker.reset_timeout, Duration::from_millis(1000));
        assert_eq!(reg.servers.len(), 2);
        match &reg.servers[0].transport {
            TransportConfig::Subprocess { command, args, .. } => {
                assert_eq!(command, "npx");
                assert_eq!(args, &vec!["-y", "server-filesystem", "."]);
            }
            other => panic!("unexpected transport {other:?}"),
        }
    }

    #[test]
    fn test_toml_registry() {
        let text = r#"
[[servers]]
name = "files"
command = "files-server"
"#;
        let reg = parse(text, Format::Toml).unwrap();
        assert_eq!(reg.servers[0].name, "files");
    }

    #[test]
    fn test_empty_server_list() {
        assert!(parse(r#"{"servers":[]}"#, Format::Json).unwrap().servers.is_empty());
        assert!(parse("", Format::Yaml).unwrap().servers.is_empty());
        assert!(parse("servers: []\n", Format::Yaml).unwrap().servers.is_empty());
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let err = parse(
            r#"{"servers":[{"name":"a","command":"x"},{"name":"a","command":"y"}]}"#,
            Format::Json,
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate server name 'a'"));
    }

    #[test]
    fn test_entry_without_command_or_url() {
        let err = parse(r#"{"servers":[{"name":"a"}]}"#, Format::Json).unwrap_err();
        assert!(matches!(err, ToolgateError::Config(_)));
    }

    #[test]
    fn test_missing_name_rejected() {
        assert!(parse(r#"{"servers":[{"command":"x"}]}"#, Format::Json).is_err());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let err = parse(
            r#"{"servers":[{"name":"files","command":"node","timeout":0}]}"#,
            Format::Json,
        )
        .unwrap_err();
        assert!(err.to_string().contains("timeout"));
    }

    #[test]
    fn test_unsupported_auth_rejected() {
        let err = parse(
            r#"{"servers":[{"name":"a","url":"http://x","auth":"basic"}]}"#,
            Format::Json,
        )
        .unwrap_err();
        assert!(err.to_string().contains("unsupported auth"));
    }

    #[test]
    fn test_malformed_file() {
        assert!(matches!(
            parse("{servers: [", Format::Json),
            Err(ToolgateError::Config(_))
        ));
    }

    #[test]
    fn test_format_from_extension() {
        assert_eq!(Format::from_path(Path::new("a.yml")), Format::Yaml);
        assert_eq!(Format::from_path(Path::new("a.yaml")), Format::Yaml);
        assert_eq!(Format::from_path(Path::new("a.toml")), Format::Toml);
        assert_eq!(Format::from_path(Path::new("a.json")), Format::Json);
        assert_eq!(Format::from_path(Path::new("servers")), Format::Json);
    }

    #[tokio::test]
    async fn test_load_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = load_registry(&dir.path().join("absent.yaml"), &BreakerConfig::default())
            .await
            .unwrap();
        assert!(loaded.is_none());
    }
}
