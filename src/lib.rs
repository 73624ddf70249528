//! mcp-switchboard
//!
//! A multi-transport proxy for the Model Context Protocol. Clients connect
//! over SSE or streamable HTTP; the proxy relays their JSON-RPC traffic to an
//! upstream MCP server reachable as a spawned stdio subprocess or a remote
//! streamable-HTTP endpoint, multiplexing many client sessions onto upstream
//! connections and negotiating capabilities on the client's behalf.

pub mod bridge;
pub mod config;
pub mod downstream;
pub mod error;
pub mod event_store;
pub mod http;
pub mod passthrough;
pub mod protocol;
pub mod session;
pub mod upstream;

pub use config::{CliArgs, ProxySettings, ServerMode};
pub use error::{ProxyError, Result};
pub use session::{SessionManager, GLOBAL_CONNECTION_ID};
