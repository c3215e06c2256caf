//! JSON-RPC 2.0 wire model.
//!
//! All intercepted MCP traffic is JSON-RPC 2.0. Parsing is strict enough to
//! distinguish malformed bytes (`-32700`) from well-formed JSON that is not a
//! valid request (`-32600`), and the reply builders produce the exact shapes
//! the gateway puts on the wire.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::analysis::ThreatLevel;

/// JSON-RPC 2.0 error codes used by the gateway.
pub mod codes {
    /// Invalid JSON was received.
    pub const PARSE_ERROR: i64 = -32700;
    /// The JSON sent is not a valid JSON-RPC 2.0 request object.
    pub const INVALID_REQUEST: i64 = -32600;
    /// The request was blocked by security policy.
    pub const BLOCKED_BY_POLICY: i64 = -32001;
    /// The upstream tool server failed while forwarding an allowed request.
    pub const UPSTREAM_FAILED: i64 = -32002;
}

// ============================================================
// Method classification
// ============================================================

/// MCP handshake and discovery methods that bypass all analysis.
pub const SAFE_METHODS: &[&str] = &[
    "initialize",
    "initialized",
    "ping",
    "tools/list",
    "resources/list",
    "resources/templates/list",
    "prompts/list",
    "logging/setLevel",
];

/// Methods that always undergo the full L1 + L2 pipeline.
pub const HIGH_RISK_METHODS: &[&str] = &[
    "tools/call",
    "completion/complete",
    "sampling/createMessage",
];

/// Risk class derived from a JSON-RPC method name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MethodClass {
    /// Handshake/discovery — bypasses analysis entirely.
    Safe,
    /// Always analyzed by both tiers, L2 even when L1 is clean.
    HighRisk,
    /// L1 always; L2 only when L1 surfaces MEDIUM or above (or L1 is disabled).
    Other,
}

impl MethodClass {
    /// Classify a method name.
    pub fn of(method: &str) -> Self {
        if SAFE_METHODS.contains(&method) {
            MethodClass::Safe
        } else if HIGH_RISK_METHODS.contains(&method) {
            MethodClass::HighRisk
        } else {
            MethodClass::Other
        }
    }
}

// ============================================================
// Request parsing
// ============================================================

/// Why inbound bytes failed to parse as a JSON-RPC request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseFailure {
    /// Not valid JSON at all — replied with `-32700`.
    Malformed(String),
    /// Valid JSON but not a JSON-RPC 2.0 request — replied with `-32600`.
    Invalid(String),
}

impl ParseFailure {
    /// The JSON-RPC error code this failure maps to.
    pub fn code(&self) -> i64 {
        match self {
            ParseFailure::Malformed(_) => codes::PARSE_ERROR,
            ParseFailure::Invalid(_) => codes::INVALID_REQUEST,
        }
    }

    /// The standard error message for this failure.
    pub fn message(&self) -> &'static str {
        match self {
            ParseFailure::Malformed(_) => "Parse error",
            ParseFailure::Invalid(_) => "Invalid request",
        }
    }

    /// The detail string carried in the error `data` field.
    pub fn detail(&self) -> &str {
        match self {
            ParseFailure::Malformed(d) | ParseFailure::Invalid(d) => d,
        }
    }
}

/// An inbound JSON-RPC 2.0 request from an agent.
///
/// `params` is kept as raw JSON to support MCP's diverse tool schemas
/// without premature deserialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    /// Protocol version, always "2.0".
    pub jsonrpc: String,
    /// Method name (e.g. "tools/call").
    pub method: String,
    /// Parameters, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Request id. Notifications carry no id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
}

impl JsonRpcRequest {
    /// Parse raw transport bytes into a request.
    ///
    /// Distinguishes malformed JSON (`-32700`) from well-formed JSON that is
    /// not a JSON-RPC 2.0 request object (`-32600`). An explicit `"id": null`
    /// is treated as an absent id.
    pub fn from_bytes(raw: &[u8]) -> Result<Self, ParseFailure> {
        let value: Value = serde_json::from_slice(raw)
            .map_err(|e| ParseFailure::Malformed(e.to_string()))?;

        let obj = value
            .as_object()
            .ok_or_else(|| ParseFailure::Invalid("request is not a JSON object".to_string()))?;

        match obj.get("jsonrpc").and_then(Value::as_str) {
            Some("2.0") => {}
            _ => {
                return Err(ParseFailure::Invalid(
                    "missing or unsupported jsonrpc version".to_string(),
                ))
            }
        }

        let method = obj
            .get("method")
            .and_then(Value::as_str)
            .ok_or_else(|| ParseFailure::Invalid("missing method".to_string()))?
            .to_string();

        let id = obj.get("id").cloned().filter(|v| !v.is_null());

        Ok(Self {
            jsonrpc: "2.0".to_string(),
            method,
            params: obj.get("params").cloned(),
            id,
        })
    }

    /// Risk class of this request's method.
    pub fn method_class(&self) -> MethodClass {
        MethodClass::of(&self.method)
    }
}

// ============================================================
// Responses
// ============================================================

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    /// Error code.
    pub code: i64,
    /// Error message.
    pub message: String,
    /// Additional structured error data.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// An outbound JSON-RPC 2.0 response to an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    /// Protocol version, always "2.0".
    pub jsonrpc: String,
    /// Id of the request being answered, preserved verbatim.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    /// Result payload for successful calls.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error object for failed or rejected calls.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// Build an error response with the given code, message, and data.
    pub fn error(id: Option<Value>, code: i64, message: &str, data: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.to_string(),
                data,
            }),
        }
    }

    /// The reply sent when the security policy blocks a request.
    pub fn blocked(
        id: Option<Value>,
        threat: ThreatLevel,
        matched_patterns: Vec<String>,
        l2_confidence: f64,
        reasoning: &str,
    ) -> Self {
        Self::error(
            id,
            codes::BLOCKED_BY_POLICY,
            "Request blocked by security policy",
            Some(json!({
                "threat_level": threat,
                "matched_patterns": matched_patterns,
                "l2_confidence": l2_confidence,
                "reasoning": reasoning,
            })),
        )
    }

    /// The reply sent when forwarding an allowed request upstream failed.
    pub fn upstream_failed(id: Option<Value>, detail: &str) -> Self {
        Self::error(
            id,
            codes::UPSTREAM_FAILED,
            "Upstream tool server failed",
            Some(json!({ "detail": detail })),
        )
    }

    /// The local reply for bytes that never became a request.
    pub fn parse_failure(failure: &ParseFailure) -> Self {
        Self::error(
            None,
            failure.code(),
            failure.message(),
            Some(json!(failure.detail())),
        )
    }

    /// Serialize to wire bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        // Serialization of this shape cannot fail; fall back to a static
        // internal-error frame if it somehow does.
        serde_json::to_vec(self).unwrap_or_else(|_| {
            br#"{"jsonrpc":"2.0","error":{"code":-32603,"message":"Internal error"}}"#.to_vec()
        })
    }
}
