//! Bidirectional proxy bridge.
//!
//! Installed per connection once capabilities are negotiated. Requests are
//! forwarded over a single uniform path; the bridge's job is gating the typed
//! method catalog against the advertised capability set, deciding which
//! notifications relay in each direction, and normalizing relay failures into
//! JSON-RPC errors without touching upstream-provided error codes.

use crate::error::ProxyError;
use crate::protocol::{error_codes, Request, Response, ServerCapabilities};
use crate::upstream::UpstreamConnection;
use std::collections::HashSet;

/// What to do with an inbound client request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestRoute {
    /// Forward to the upstream.
    Forward,
    /// Known method whose capability the upstream did not advertise.
    MethodNotFound,
}

#[derive(Debug)]
pub struct ProxyBridge {
    capabilities: ServerCapabilities,
    handlers: HashSet<&'static str>,
}

/// Methods always available regardless of capabilities.
const ALWAYS: &[&str] = &["completion/complete", "ping"];
const PROMPT_METHODS: &[&str] = &["prompts/get", "prompts/list"];
const RESOURCE_METHODS: &[&str] = &[
    "resources/list",
    "resources/templates/list",
    "resources/read",
];
const SUBSCRIPTION_METHODS: &[&str] = &["resources/subscribe", "resources/unsubscribe"];
const TOOL_METHODS: &[&str] = &["tools/call", "tools/list"];
const LOGGING_METHODS: &[&str] = &["logging/setLevel"];

impl ProxyBridge {
    /// Install handlers for every method the capability set advertises.
    pub fn new(capabilities: ServerCapabilities) -> Self {
        let mut handlers: HashSet<&'static str> = ALWAYS.iter().copied().collect();
        if capabilities.prompts.is_some() {
            handlers.extend(PROMPT_METHODS);
        }
        if capabilities.resources.is_some() {
            handlers.extend(RESOURCE_METHODS);
        }
        if capabilities.resources_subscribe() {
            handlers.extend(SUBSCRIPTION_METHODS);
        }
        if capabilities.tools.is_some() {
            handlers.extend(TOOL_METHODS);
        }
        if capabilities.logging.is_some() {
            handlers.extend(LOGGING_METHODS);
        }
        ProxyBridge {
            capabilities,
            handlers,
        }
    }

    /// Route decision for a client request method.
    ///
    /// Methods outside the typed catalog are forwarded opaquely; the proxy
    /// does not require a closed method universe.
    pub fn route_request(&self, method: &str) -> RequestRoute {
        if self.handlers.contains(method) {
            return RequestRoute::Forward;
        }
        let known = ALWAYS
            .iter()
            .chain(PROMPT_METHODS)
            .chain(RESOURCE_METHODS)
            .chain(SUBSCRIPTION_METHODS)
            .chain(TOOL_METHODS)
            .chain(LOGGING_METHODS)
            .any(|m| *m == method);
        if known {
            RequestRoute::MethodNotFound
        } else {
            RequestRoute::Forward
        }
    }

    /// Whether a server-initiated notification relays to the client.
    pub fn relays_to_client(&self, method: &str) -> bool {
        match method {
            "notifications/message" => self.capabilities.logging.is_some(),
            "notifications/resources/updated" => self.capabilities.resources_subscribe(),
            "notifications/resources/list_changed" => self.capabilities.resources.is_some(),
            "notifications/tools/list_changed" => self.capabilities.tools.is_some(),
            "notifications/prompts/list_changed" => self.capabilities.prompts.is_some(),
            _ => true,
        }
    }

    /// Whether a client notification relays to the upstream.
    pub fn relays_to_upstream(&self, method: &str) -> bool {
        match method {
            "notifications/message" => self.capabilities.logging.is_some(),
            _ => true,
        }
    }

    /// Forward one request and shape the outcome into a response envelope.
    ///
    /// Upstream JSON-RPC errors pass through verbatim (code, message, data)
    /// under the caller's original id. Relay failures are logged with the
    /// handler name and surface as `-32603`.
    pub async fn forward_request(
        &self,
        upstream: &UpstreamConnection,
        request: Request,
    ) -> Response {
        let method = request.method.clone();
        let id = request.id.clone();

        match self.route_request(&method) {
            RequestRoute::MethodNotFound => Response::error(
                id,
                error_codes::METHOD_NOT_FOUND,
                format!("Method not supported by upstream: {method}"),
            ),
            RequestRoute::Forward => match upstream.request(request).await {
                Ok(response) => response,
                Err(e) => {
                    tracing::error!(handler = %method, error = %e, "proxy handler failed");
                    let message = match &e {
                        ProxyError::RequestTimeout(_) => "Upstream request timed out".to_string(),
                        ProxyError::UpstreamClosed => "Upstream connection closed".to_string(),
                        other => other.to_string(),
                    };
                    Response::error(id, error_codes::INTERNAL_ERROR, message)
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{
        PromptsCapability, ResourcesCapability, ToolsCapability,
    };
    use serde_json::json;

    fn caps(tools: bool, resources: bool, subscribe: bool, prompts: bool, logging: bool) -> ServerCapabilities {
        ServerCapabilities {
            prompts: prompts.then(PromptsCapability::default),
            resources: resources.then(|| ResourcesCapability {
                subscribe: subscribe.then_some(true),
                list_changed: None,
            }),
            tools: tools.then(ToolsCapability::default),
            logging: logging.then(|| json!({})),
            completions: None,
            experimental: None,
        }
    }

    #[test]
    fn installs_handlers_per_capability() {
        let bridge = ProxyBridge::new(caps(true, false, false, false, false));
        assert_eq!(bridge.route_request("tools/call"), RequestRoute::Forward);
        assert_eq!(bridge.route_request("tools/list"), RequestRoute::Forward);
        assert_eq!(
            bridge.route_request("prompts/get"),
            RequestRoute::MethodNotFound
        );
        assert_eq!(
            bridge.route_request("resources/read"),
            RequestRoute::MethodNotFound
        );
    }

    #[test]
    fn subscription_needs_the_subscribe_flag() {
        let without = ProxyBridge::new(caps(false, true, false, false, false));
        assert_eq!(
            without.route_request("resources/subscribe"),
            RequestRoute::MethodNotFound
        );
        assert_eq!(
            without.route_request("resources/read"),
            RequestRoute::Forward
        );

        let with = ProxyBridge::new(caps(false, true, true, false, false));
        assert_eq!(
            with.route_request("resources/subscribe"),
            RequestRoute::Forward
        );
        assert_eq!(
            with.route_request("resources/unsubscribe"),
            RequestRoute::Forward
        );
    }

    #[test]
    fn complete_is_always_installed() {
        let bridge = ProxyBridge::new(ServerCapabilities::default());
        assert_eq!(
            bridge.route_request("completion/complete"),
            RequestRoute::Forward
        );
    }

    #[test]
    fn unknown_methods_pass_through() {
        let bridge = ProxyBridge::new(ServerCapabilities::default());
        assert_eq!(
            bridge.route_request("vendor/experimental-thing"),
            RequestRoute::Forward
        );
    }

    #[test]
    fn notification_relay_policy() {
        let bridge = ProxyBridge::new(caps(true, true, true, false, false));
        assert!(bridge.relays_to_client("notifications/resources/updated"));
        assert!(bridge.relays_to_client("notifications/tools/list_changed"));
        // No logging capability: logging messages stop in both directions.
        assert!(!bridge.relays_to_client("notifications/message"));
        assert!(!bridge.relays_to_upstream("notifications/message"));
        // Unknown notifications pass through.
        assert!(bridge.relays_to_client("notifications/vendor/custom"));
        assert!(bridge.relays_to_upstream("notifications/cancelled"));

        let no_subscribe = ProxyBridge::new(caps(true, true, false, false, false));
        assert!(!no_subscribe.relays_to_client("notifications/resources/updated"));

        let logging = ProxyBridge::new(caps(false, false, false, false, true));
        assert!(logging.relays_to_client("notifications/message"));
        assert!(logging.relays_to_upstream("notifications/message"));
    }
}
