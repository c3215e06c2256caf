//! Analysis and audit data types.
//!
//! These types are the lingua franca of the pipeline — the analyzers produce
//! findings, the policy engine folds them into a verdict, and the audit sink
//! and escalation hub record and broadcast the result.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::traits::ReplyChannel;

/// Maximum length of the payload preview carried in dashboard events.
pub const PAYLOAD_PREVIEW_LIMIT: usize = 2048;

/// Maximum length of the L2 reasoning string.
pub const REASONING_LIMIT: usize = 280;

// ============================================================
// Threat levels and verdicts
// ============================================================

/// Severity classification of detected threats, ordered from clean to worst.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum ThreatLevel {
    /// No threat detected.
    #[default]
    None,
    /// Weak signal, informational.
    Low,
    /// Suspicious — warrants deeper analysis.
    Medium,
    /// Likely attack pattern.
    High,
    /// Unambiguous attack pattern — immediate block.
    Critical,
}

impl std::fmt::Display for ThreatLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ThreatLevel::None => "NONE",
            ThreatLevel::Low => "LOW",
            ThreatLevel::Medium => "MEDIUM",
            ThreatLevel::High => "HIGH",
            ThreatLevel::Critical => "CRITICAL",
        };
        f.write_str(s)
    }
}

/// Gateway decision on a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    /// Forward the request upstream.
    Allow,
    /// Reject the request with a policy error.
    Block,
    /// Hold the request pending a human operator decision.
    Escalate,
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Verdict::Allow => "ALLOW",
            Verdict::Block => "BLOCK",
            Verdict::Escalate => "ESCALATE",
        };
        f.write_str(s)
    }
}

// ============================================================
// Findings
// ============================================================

/// Aggregated output from the L1 static analysis pass.
///
/// A pure function of the input payload and the analyzer configuration:
/// scanning the same bytes twice produces the same finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct L1Finding {
    /// Unique names of all matched patterns.
    pub patterns: BTreeSet<String>,
    /// Highest threat level across all matches.
    pub level: ThreatLevel,
    /// Deepest Base64 decode level reached during the heuristic re-scan.
    pub base64_depth: u8,
}

impl L1Finding {
    /// A finding with no matches.
    pub fn clean() -> Self {
        Self::default()
    }

    /// Record a matched pattern, raising the effective level if needed.
    pub fn record(&mut self, name: impl Into<String>, level: ThreatLevel) {
        self.patterns.insert(name.into());
        if level > self.level {
            self.level = level;
        }
    }

    /// Whether any pattern matched.
    pub fn is_clean(&self) -> bool {
        self.patterns.is_empty() && self.level == ThreatLevel::None
    }

    /// Pattern names as an ordered list.
    pub fn pattern_list(&self) -> Vec<String> {
        self.patterns.iter().cloned().collect()
    }
}

/// Tri-state injection classification from the L2 semantic pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum L2Disposition {
    /// The classifier judged the request an injection attempt.
    #[serde(rename = "yes")]
    Injection,
    /// The classifier judged the request benign.
    #[serde(rename = "no")]
    Benign,
    /// The classifier had no opinion (failure, timeout, or disabled).
    #[serde(rename = "unknown")]
    Unknown,
}

/// Output from the L2 semantic classification pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct L2Finding {
    /// Injection classification.
    pub disposition: L2Disposition,
    /// Confidence in [0.0, 1.0]. Meaningful only when the disposition is
    /// not `Unknown`.
    pub confidence: f64,
    /// Bounded human-readable reasoning.
    pub reasoning: String,
    /// Which backend produced this finding.
    pub backend: String,
}

impl L2Finding {
    /// The fail-open result: no opinion, zero confidence.
    pub fn unknown(backend: impl Into<String>, reasoning: impl Into<String>) -> Self {
        Self {
            disposition: L2Disposition::Unknown,
            confidence: 0.0,
            reasoning: truncate_chars(&reasoning.into(), REASONING_LIMIT),
            backend: backend.into(),
        }
    }

    /// A definite classification with clamped confidence and bounded reasoning.
    pub fn classified(
        backend: impl Into<String>,
        is_injection: bool,
        confidence: f64,
        reasoning: impl Into<String>,
    ) -> Self {
        Self {
            disposition: if is_injection {
                L2Disposition::Injection
            } else {
                L2Disposition::Benign
            },
            confidence: confidence.clamp(0.0, 1.0),
            reasoning: truncate_chars(&reasoning.into(), REASONING_LIMIT),
            backend: backend.into(),
        }
    }

    /// Whether the classifier positively flagged an injection.
    pub fn is_injection(&self) -> bool {
        self.disposition == L2Disposition::Injection
    }
}

/// Truncate a string to at most `limit` characters on a char boundary.
pub fn truncate_chars(s: &str, limit: usize) -> String {
    match s.char_indices().nth(limit) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

// ============================================================
// Session context
// ============================================================

/// A single entry in a session's bounded message ring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMessage {
    /// The JSON-RPC method observed.
    pub method: String,
    /// Truncated params preview for classifier context.
    pub params_preview: String,
    /// When the message arrived.
    pub received_at: DateTime<Utc>,
}

// ============================================================
// Audit records
// ============================================================

/// Immutable record of one request's journey through the pipeline.
///
/// Written as one JSON line to the append-only audit log. Carries the
/// payload hash, never the payload itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Id of the intercepted request.
    pub request_id: String,
    /// Arrival wall-clock time.
    pub received_at: DateTime<Utc>,
    /// Verdict finalization wall-clock time.
    pub finalized_at: DateTime<Utc>,
    /// Session the request belonged to.
    pub session_id: String,
    /// Agent that sent the request, empty when unknown.
    pub agent_id: String,
    /// JSON-RPC method name.
    pub method: String,
    /// SHA-256 of the raw payload bytes (hex).
    pub payload_sha256: String,
    /// L1 static finding.
    pub l1: L1Finding,
    /// L2 semantic finding.
    pub l2: L2Finding,
    /// Final verdict after any human resolution.
    pub verdict: Verdict,
    /// Structured reason string.
    pub reason: String,
    /// Operator id when the verdict came from human review.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub human_actor: Option<String>,
    /// Annotations such as `forward_failed`, `abandoned`, `audit_degraded`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Milliseconds from ingress to terminal state.
    pub elapsed_ms: f64,
}

// ============================================================
// Dashboard events
// ============================================================

/// Analysis summary embedded in dashboard events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisSummary {
    /// L1 static finding.
    pub l1: L1Finding,
    /// L2 semantic finding.
    pub l2: L2Finding,
    /// Verdict at finalization time.
    pub verdict: Verdict,
    /// Aggregated threat level (max of L1 and the confidence-derived L2 level).
    pub threat_level: ThreatLevel,
    /// Reason string.
    pub reason: String,
}

/// Real-time event pushed to connected operator consoles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashboardEvent {
    /// Event discriminator, currently always "request_analyzed".
    pub event_type: String,
    /// Epoch seconds as a float.
    pub timestamp: f64,
    /// Session the request belonged to.
    pub session_id: String,
    /// Agent that sent the request.
    pub agent_id: String,
    /// JSON-RPC method name.
    pub method: String,
    /// Truncated payload preview (at most 2 KiB).
    pub payload_preview: String,
    /// Analysis summary.
    pub analysis: AnalysisSummary,
    /// Set when the verdict is not ALLOW or the threat level is HIGH+.
    pub is_alert: bool,
    /// Id of the analyzed request (used by HITL responses).
    pub request_id: String,
}

// ============================================================
// Human-in-the-loop wire shapes
// ============================================================

/// Operator decision on an escalated request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperatorAction {
    /// Let the request through.
    Allow,
    /// Reject the request.
    Block,
}

/// Operator-inbound HITL response.
///
/// Unknown actions fail deserialization and are ignored by the hub;
/// unknown request ids are acknowledged and ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorResponse {
    /// The decision.
    pub action: OperatorAction,
    /// The escalated request this decision applies to.
    pub request_id: String,
}

// ============================================================
// Request envelope
// ============================================================

/// A request owned by the dispatcher from ingress to its terminal state.
///
/// Transport adapters construct one envelope per whole inbound message and
/// hand it to the dispatcher; the reply channel is the opaque back-reference
/// for delivering the response or rejection.
pub struct RequestEnvelope {
    /// Unique per-ingress request id.
    pub request_id: String,
    /// Stable id of the connected agent session.
    pub session_id: String,
    /// Agent identity, may be empty.
    pub agent_id: String,
    /// Raw serialized request bytes.
    pub raw: Vec<u8>,
    /// Arrival wall-clock time.
    pub received_at: DateTime<Utc>,
    /// Arrival monotonic time.
    pub received_mono: Instant,
    /// Channel for replying to the originating transport.
    pub reply: Arc<dyn ReplyChannel>,
}

impl RequestEnvelope {
    /// Build an envelope for freshly arrived bytes.
    pub fn new(
        session_id: impl Into<String>,
        agent_id: impl Into<String>,
        raw: Vec<u8>,
        reply: Arc<dyn ReplyChannel>,
    ) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            agent_id: agent_id.into(),
            raw,
            received_at: Utc::now(),
            received_mono: Instant::now(),
            reply,
        }
    }

    /// Hex-encoded SHA-256 of the raw payload.
    pub fn payload_sha256(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(&self.raw);
        hex::encode(hasher.finalize())
    }

    /// UTF-8 view of the raw payload, lossy on invalid sequences.
    pub fn payload_text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.raw)
    }

    /// Payload preview bounded for dashboard events.
    pub fn payload_preview(&self) -> String {
        truncate_chars(&self.payload_text(), PAYLOAD_PREVIEW_LIMIT)
    }
}

impl std::fmt::Debug for RequestEnvelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestEnvelope")
            .field("request_id", &self.request_id)
            .field("session_id", &self.session_id)
            .field("agent_id", &self.agent_id)
            .field("raw_len", &self.raw.len())
            .finish()
    }
}
