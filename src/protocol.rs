//! JSON-RPC 2.0 frame codec.
//!
//! Models the three envelope kinds (request, response, notification) over raw
//! `serde_json` payloads so unknown methods pass through the proxy untouched.
//! The only typed views are the ones the engine actually needs: recognizing
//! `initialize`, and a shallow capability set extracted from the initialize
//! result.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// JSON-RPC error codes used by the proxy.
pub mod error_codes {
    /// Session lifecycle errors ("Session not found", "Missing session ID",
    /// "Connection lost, please reinitialize").
    pub const SESSION_ERROR: i64 = -32000;
    /// Method disabled or unknown to the negotiated capability set.
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// Relay failure between the two sides of the proxy.
    pub const INTERNAL_ERROR: i64 = -32603;
    /// Malformed JSON body.
    pub const PARSE_ERROR: i64 = -32700;
}

/// The literal `"jsonrpc": "2.0"` marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Version2;

impl Serialize for Version2 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("2.0")
    }
}

impl<'de> Deserialize<'de> for Version2 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        if s == "2.0" {
            Ok(Version2)
        } else {
            Err(serde::de::Error::custom(format!(
                "unsupported jsonrpc version: {s}"
            )))
        }
    }
}

/// A JSON-RPC request id. The proxy never rewrites ids: responses are
/// correlated by the exact id the requester chose.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
    Null,
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::String(s) => write!(f, "{s}"),
            RequestId::Null => write!(f, "null"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: Version2,
    pub id: RequestId,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub jsonrpc: Version2,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// A response carries `result` xor `error`; both are kept optional so decoded
/// frames round-trip byte-for-byte through serde.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub jsonrpc: Version2,
    pub id: RequestId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl Response {
    pub fn ok(id: RequestId, result: Value) -> Self {
        Response {
            jsonrpc: Version2,
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: RequestId, code: i64, message: impl Into<String>) -> Self {
        Response {
            jsonrpc: Version2,
            id,
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }
}

/// One JSON-RPC 2.0 envelope.
///
/// Untagged variant order matters: a request has `id`+`method`, a response
/// has `id`+(`result`|`error`), a notification has `method` only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Envelope {
    Request(Request),
    Response(Response),
    Notification(Notification),
}

impl Envelope {
    /// Decode one envelope from raw bytes.
    pub fn decode(bytes: &[u8]) -> Result<Envelope, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Encode to a compact JSON string. `serde_json` escapes embedded
    /// newlines, which is what makes the newline-delimited stdio framing
    /// safe.
    pub fn encode(&self) -> String {
        serde_json::to_string(self).expect("envelope serialization is infallible")
    }

    /// True iff this is an `initialize` request (method + id present).
    pub fn is_initialize_request(&self) -> bool {
        matches!(self, Envelope::Request(r) if r.method == "initialize")
    }

    pub fn request_id(&self) -> Option<&RequestId> {
        match self {
            Envelope::Request(r) => Some(&r.id),
            Envelope::Response(r) => Some(&r.id),
            Envelope::Notification(_) => None,
        }
    }
}

impl From<Response> for Envelope {
    fn from(r: Response) -> Self {
        Envelope::Response(r)
    }
}

/// Best-effort id recovery from a raw JSON value, used to address error
/// responses for bodies that are valid JSON but not a valid envelope.
pub fn request_id_from_value(value: &Value) -> RequestId {
    value
        .get("id")
        .cloned()
        .and_then(|v| serde_json::from_value::<RequestId>(v).ok())
        .unwrap_or(RequestId::Null)
}

// ============================================================================
// Capabilities
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourcesCapability {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscribe: Option<bool>,
    #[serde(
        default,
        rename = "listChanged",
        skip_serializing_if = "Option::is_none"
    )]
    pub list_changed: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolsCapability {
    #[serde(
        default,
        rename = "listChanged",
        skip_serializing_if = "Option::is_none"
    )]
    pub list_changed: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PromptsCapability {
    #[serde(
        default,
        rename = "listChanged",
        skip_serializing_if = "Option::is_none"
    )]
    pub list_changed: Option<bool>,
}

/// Shallow view of the capability set an upstream advertises in its
/// initialize result. Unknown capability keys are preserved opaquely in
/// `experimental`-style passthrough because the initialize result itself is
/// relayed verbatim; this struct only drives handler gating.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerCapabilities {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompts: Option<PromptsCapability>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourcesCapability>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<ToolsCapability>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completions: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub experimental: Option<Value>,
}

impl ServerCapabilities {
    /// The compatibility assumption for upstreams that refuse to initialize
    /// twice: tools, resources, prompts and logging, all bare.
    pub fn default_for_global() -> Self {
        ServerCapabilities {
            prompts: Some(PromptsCapability::default()),
            resources: Some(ResourcesCapability::default()),
            tools: Some(ToolsCapability::default()),
            logging: Some(Value::Object(serde_json::Map::new())),
            completions: None,
            experimental: None,
        }
    }

    pub fn resources_subscribe(&self) -> bool {
        self.resources
            .as_ref()
            .is_some_and(|r| r.subscribe == Some(true))
    }
}

/// Extract the capability set from an initialize result value. Missing or
/// malformed capabilities decode as the empty set.
pub fn capabilities_from_initialize_result(result: &Value) -> ServerCapabilities {
    result
        .get("capabilities")
        .cloned()
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default()
}

/// Synthesize an initialize result for sessions bound to the shared global
/// connection, echoing the protocol version the client asked for.
pub fn synthesized_initialize_result(
    client_params: Option<&Value>,
    capabilities: &ServerCapabilities,
) -> Value {
    let protocol_version = client_params
        .and_then(|p| p.get("protocolVersion"))
        .cloned()
        .unwrap_or_else(|| Value::String("2024-11-05".to_string()));
    serde_json::json!({
        "protocolVersion": protocol_version,
        "capabilities": capabilities,
        "serverInfo": {
            "name": "mcp-switchboard",
            "version": env!("CARGO_PKG_VERSION"),
        },
    })
}
