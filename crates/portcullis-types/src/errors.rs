/// Unified error type for the Portcullis gateway.
///
/// All crates use this error type for propagation across crate boundaries.
/// Internal module errors should be converted into the appropriate variant.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Inbound bytes could not be parsed as a JSON-RPC 2.0 request.
    #[error("wire error: {0}")]
    Wire(String),

    /// Error from the L1 static analyzer (pattern compilation, scan failures).
    #[error("static analysis error: {0}")]
    Analysis(String),

    /// Error from the L2 semantic classifier (HTTP call, response parsing).
    #[error("classifier error: {0}")]
    Classifier(String),

    /// Error from the session store.
    #[error("session error: {0}")]
    Session(String),

    /// Error from the audit sink (queue, file I/O, query failures).
    #[error("audit error: {0}")]
    Audit(String),

    /// Error from the escalation hub (registration, resolution).
    #[error("escalation error: {0}")]
    Escalation(String),

    /// Error forwarding a request to the upstream tool server.
    #[error("upstream error: {0}")]
    Upstream(String),

    /// Error delivering a reply through the originating transport channel.
    #[error("transport error: {0}")]
    Transport(String),

    /// Error from configuration loading or validation.
    #[error("config error: {0}")]
    Config(String),

    /// Timeout waiting for a response (classifier, operator, upstream).
    #[error("timeout: {0}")]
    Timeout(String),

    /// Serialization or deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Generic internal error for unexpected conditions.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for GatewayError {
    fn from(err: serde_yaml::Error) -> Self {
        GatewayError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        GatewayError::Audit(err.to_string())
    }
}
