/// Trait contracts at the gateway's seams.
///
/// The dispatcher codes against these interfaces, not against concrete
/// transports or classifier backends. Transport adapters implement
/// [`ReplyChannel`], the forwarding side implements [`UpstreamClient`], and
/// L2 backends implement [`IntentClassifier`].
use async_trait::async_trait;

use crate::analysis::{L2Finding, SessionMessage};
use crate::errors::GatewayError;

/// Back-reference to the originating transport for delivering replies.
///
/// One per in-flight request. `is_open` lets the dispatcher detect agent
/// disconnects and cancel forwarding, classification, and pending
/// escalations for abandoned requests.
#[async_trait]
pub trait ReplyChannel: Send + Sync {
    /// Deliver a whole serialized JSON-RPC message to the agent.
    async fn send(&self, payload: Vec<u8>) -> Result<(), GatewayError>;

    /// Whether the originating transport is still connected.
    fn is_open(&self) -> bool;
}

/// Client for the upstream tool server.
///
/// Forwarding preserves the raw request bytes verbatim — the gateway never
/// rewrites payloads.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    /// Forward raw request bytes upstream and return the raw response bytes.
    async fn forward(&self, raw: &[u8]) -> Result<Vec<u8>, GatewayError>;
}

/// Backend for the L2 semantic classifier.
///
/// Implementations must be swappable between a live LLM endpoint and a
/// deterministic mock; selection is configuration-driven. Errors are mapped
/// to the fail-open `unknown` finding by the caller.
#[async_trait]
pub trait IntentClassifier: Send + Sync {
    /// Classify a request as injection / benign with a confidence score.
    async fn classify(
        &self,
        method: &str,
        params: Option<&serde_json::Value>,
        context: &[SessionMessage],
    ) -> Result<L2Finding, GatewayError>;

    /// Stable identifier of this backend, recorded in findings.
    fn backend_id(&self) -> &str;
}
