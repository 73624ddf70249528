//! CLI arguments and effective proxy settings.

use clap::Parser;
use std::collections::HashMap;
use std::time::Duration;

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_SSE_ENDPOINT: &str = "/sse";
const DEFAULT_STREAM_ENDPOINT: &str = "/mcp";
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
const DEFAULT_INITIALIZE_WAIT_MS: u64 = 100;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 300;
const DEFAULT_IDLE_TTL_SECS: u64 = 1800;
const DEFAULT_MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

/// Which client-facing transports to serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ServerMode {
    #[value(name = "sse")]
    Sse,
    #[value(name = "stream")]
    Stream,
    #[value(name = "both")]
    Both,
}

impl ServerMode {
    pub fn serves_sse(self) -> bool {
        matches!(self, ServerMode::Sse | ServerMode::Both)
    }

    pub fn serves_stream(self) -> bool {
        matches!(self, ServerMode::Stream | ServerMode::Both)
    }
}

/// CLI arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "mcp-switchboard")]
#[command(
    version,
    about = "Multi-transport MCP proxy: SSE / streamable HTTP in front, stdio or remote MCP servers behind"
)]
pub struct CliArgs {
    /// Port to listen on.
    #[arg(short = 'p', long, env = "SWITCHBOARD_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Host/interface to bind.
    #[arg(long, env = "SWITCHBOARD_HOST", default_value = DEFAULT_HOST)]
    pub host: String,

    /// Path serving the SSE transport (GET stream + POST messages).
    #[arg(long = "sse-endpoint", env = "SWITCHBOARD_SSE_ENDPOINT", default_value = DEFAULT_SSE_ENDPOINT)]
    pub sse_endpoint: String,

    /// Path serving the streamable HTTP transport.
    #[arg(long = "stream-endpoint", env = "SWITCHBOARD_STREAM_ENDPOINT", default_value = DEFAULT_STREAM_ENDPOINT)]
    pub stream_endpoint: String,

    /// Which client-facing transports to serve.
    #[arg(long = "server", env = "SWITCHBOARD_SERVER", value_enum, default_value = "both")]
    pub server: ServerMode,

    /// No fixed upstream: each session picks its upstream URL from the
    /// `upstream` query parameter on its initialize request.
    #[arg(long = "dynamic-proxy", env = "SWITCHBOARD_DYNAMIC_PROXY")]
    pub dynamic_proxy: bool,

    /// Enable the opaque `?target=<url>` HTTP pass-through.
    #[arg(long = "enable-proxy", env = "SWITCHBOARD_ENABLE_PROXY")]
    pub enable_proxy: bool,

    /// Command to spawn as the stdio upstream MCP server.
    #[arg(long, env = "SWITCHBOARD_COMMAND")]
    pub command: Option<String>,

    /// Arguments for the stdio upstream command (repeatable).
    #[arg(long = "args", allow_hyphen_values = true)]
    pub args: Vec<String>,

    /// Run the stdio upstream command through a shell.
    #[arg(long, env = "SWITCHBOARD_SHELL")]
    pub shell: bool,

    /// Extra environment for the stdio upstream, as KEY=VALUE (repeatable).
    /// The child otherwise inherits the proxy's environment.
    #[arg(long = "env", value_parser = parse_key_val)]
    pub env: Vec<(String, String)>,

    /// URL of a remote streamable-HTTP upstream MCP server.
    #[arg(long = "upstream-url", env = "SWITCHBOARD_UPSTREAM_URL")]
    pub upstream_url: Option<String>,

    /// Log level. Supports tracing filter syntax.
    #[arg(short = 'l', long = "log-level", env = "SWITCHBOARD_LOG", default_value = "info")]
    pub log_level: String,

    /// Timeout for forwarded upstream requests (seconds).
    #[arg(long = "request-timeout", env = "SWITCHBOARD_REQUEST_TIMEOUT", default_value_t = DEFAULT_REQUEST_TIMEOUT_SECS)]
    pub request_timeout: u64,

    /// Bounded wait for an initialize already in flight for the same session
    /// (milliseconds).
    #[arg(long = "initialize-wait-ms", env = "SWITCHBOARD_INITIALIZE_WAIT_MS", default_value_t = DEFAULT_INITIALIZE_WAIT_MS)]
    pub initialize_wait_ms: u64,

    /// Interval between idle-connection sweeps (seconds).
    #[arg(long = "sweep-interval", env = "SWITCHBOARD_SWEEP_INTERVAL", default_value_t = DEFAULT_SWEEP_INTERVAL_SECS)]
    pub sweep_interval: u64,

    /// Idle TTL after which a connection with no bound sessions is evicted
    /// (seconds).
    #[arg(long = "idle-ttl", env = "SWITCHBOARD_IDLE_TTL", default_value_t = DEFAULT_IDLE_TTL_SECS)]
    pub idle_ttl: u64,

    /// Retained events per session for SSE resumption.
    #[arg(long = "event-capacity", env = "SWITCHBOARD_EVENT_CAPACITY", default_value_t = crate::event_store::DEFAULT_CAPACITY)]
    pub event_capacity: usize,

    /// Hard cap on request body size (bytes).
    #[arg(long = "max-body-bytes", env = "SWITCHBOARD_MAX_BODY_BYTES", default_value_t = DEFAULT_MAX_BODY_BYTES)]
    pub max_body_bytes: usize,
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (k, v) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{s}'"))?;
    if k.is_empty() {
        return Err(format!("empty key in '{s}'"));
    }
    Ok((k.to_string(), v.to_string()))
}

/// Timing and sizing knobs handed to the session manager.
#[derive(Debug, Clone)]
pub struct ProxySettings {
    pub request_timeout: Duration,
    pub initialize_wait: Duration,
    pub sweep_interval: Duration,
    pub idle_ttl: Duration,
    pub event_capacity: usize,
}

impl Default for ProxySettings {
    fn default() -> Self {
        ProxySettings {
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            initialize_wait: Duration::from_millis(DEFAULT_INITIALIZE_WAIT_MS),
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            idle_ttl: Duration::from_secs(DEFAULT_IDLE_TTL_SECS),
            event_capacity: crate::event_store::DEFAULT_CAPACITY,
        }
    }
}

impl CliArgs {
    pub fn settings(&self) -> ProxySettings {
        ProxySettings {
            request_timeout: Duration::from_secs(self.request_timeout),
            initialize_wait: Duration::from_millis(self.initialize_wait_ms),
            sweep_interval: Duration::from_secs(self.sweep_interval),
            idle_ttl: Duration::from_secs(self.idle_ttl),
            event_capacity: self.event_capacity,
        }
    }

    /// Stdio upstream environment overlay as a map.
    pub fn env_map(&self) -> HashMap<String, String> {
        self.env.iter().cloned().collect()
    }

    /// Endpoint paths, normalized with a leading slash.
    pub fn endpoints(&self) -> (String, String) {
        (
            normalize_path(&self.sse_endpoint),
            normalize_path(&self.stream_endpoint),
        )
    }
}

fn normalize_path(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_key_val_pairs() {
        assert_eq!(
            parse_key_val("FOO=bar").unwrap(),
            ("FOO".to_string(), "bar".to_string())
        );
        assert_eq!(
            parse_key_val("FOO=a=b").unwrap(),
            ("FOO".to_string(), "a=b".to_string())
        );
        assert!(parse_key_val("FOO").is_err());
        assert!(parse_key_val("=bar").is_err());
    }

    #[test]
    fn normalizes_endpoint_paths() {
        let args = CliArgs::parse_from(["mcp-switchboard", "--sse-endpoint", "events"]);
        let (sse, stream) = args.endpoints();
        assert_eq!(sse, "/events");
        assert_eq!(stream, "/mcp");
    }

    #[test]
    fn defaults_match_documented_values() {
        let args = CliArgs::parse_from(["mcp-switchboard"]);
        let settings = args.settings();
        assert_eq!(settings.request_timeout, Duration::from_secs(30));
        assert_eq!(settings.initialize_wait, Duration::from_millis(100));
        assert_eq!(settings.sweep_interval, Duration::from_secs(300));
        assert_eq!(settings.idle_ttl, Duration::from_secs(1800));
        assert!(args.server.serves_sse() && args.server.serves_stream());
    }
}
