//! Gateway configuration.
//!
//! One YAML file, parsed into [`GatewayConfig`] at startup. Every section
//! rejects unknown keys loudly (`deny_unknown_fields`) rather than silently
//! ignoring them, and `validate()` checks cross-field invariants before the
//! gateway starts serving. All fields have working defaults so an empty file
//! is a valid configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::GatewayError;

/// Default dictionary for the L1 multi-pattern scan: destructive shell,
/// privileged paths, SQL DDL verbs, piped download-exec combinations.
pub const DEFAULT_BLOCKED_PATTERNS: &[&str] = &[
    "rm -rf",
    "/etc/shadow",
    "/etc/passwd",
    "DROP TABLE",
    "DELETE FROM",
    "TRUNCATE",
    "shutdown",
    "mkfs",
    "dd if=",
    "FORMAT C:",
    "wget|sh",
    "curl|bash",
];

/// Default exfiltration host fragments for the `data_exfiltration_url` pattern.
pub const DEFAULT_EXFILTRATION_HOSTS: &[&str] = &[
    "ngrok",
    "burpcollaborator",
    "requestbin",
    "webhook.site",
    "pipedream.net",
];

/// Supported transport modes for the listening side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    /// Server-sent events over HTTP.
    #[default]
    Sse,
    /// Bidirectional socket.
    Websocket,
    /// Subprocess stdio.
    Stdio,
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields, default)]
pub struct GatewayConfig {
    /// Listening address.
    pub listen: ListenConfig,
    /// Upstream tool server address and forward timeout.
    pub upstream: UpstreamConfig,
    /// Transport mode for the listening side.
    pub transport: TransportMode,
    /// L1 static analyzer tuning.
    pub l1: L1Config,
    /// L2 semantic classifier tuning.
    pub l2: L2Config,
    /// Session store tuning.
    pub session: SessionConfig,
    /// Token-bucket admission control.
    pub rate_limit: RateLimitConfig,
    /// Audit sink tuning.
    pub audit: AuditConfig,
    /// Escalation hub tuning.
    pub escalation: EscalationConfig,
}

/// Listening address.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ListenConfig {
    /// Bind host.
    pub host: String,
    /// Bind port.
    pub port: u16,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9090,
        }
    }
}

/// Upstream tool server address.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct UpstreamConfig {
    /// Upstream host.
    pub host: String,
    /// Upstream port.
    pub port: u16,
    /// Forward timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            timeout_secs: 30,
        }
    }
}

impl UpstreamConfig {
    /// Base URL of the upstream server.
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

/// L1 static analyzer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct L1Config {
    /// Whether L1 runs at all. When disabled, L2 runs for every non-safe method.
    pub enabled: bool,
    /// Literal fragments for the multi-pattern dictionary scan.
    pub blocked_patterns: Vec<String>,
    /// Host fragments treated as exfiltration egress targets.
    pub exfiltration_hosts: Vec<String>,
    /// Payloads larger than this are tagged `oversize_payload` without scanning.
    pub max_scan_bytes: usize,
}

impl Default for L1Config {
    fn default() -> Self {
        Self {
            enabled: true,
            blocked_patterns: DEFAULT_BLOCKED_PATTERNS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            exfiltration_hosts: DEFAULT_EXFILTRATION_HOSTS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            max_scan_bytes: 64 * 1024,
        }
    }
}

/// L2 semantic classifier configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct L2Config {
    /// Whether the live backend is used. When disabled, the deterministic
    /// mock backend classifies instead.
    pub enabled: bool,
    /// OpenAI-compatible chat-completions endpoint URL.
    pub endpoint: String,
    /// Bearer token for the endpoint, empty for none.
    pub api_key: String,
    /// Model identifier.
    pub model: String,
    /// Hard deadline for one classification call, in seconds.
    pub timeout_secs: f64,
}

impl Default for L2Config {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: "https://openrouter.ai/api/v1/chat/completions".to_string(),
            api_key: String::new(),
            model: "minimax/minimax-m2.5".to_string(),
            timeout_secs: 10.0,
        }
    }
}

/// Session store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SessionConfig {
    /// Bounded ring size per session.
    pub ring_size: usize,
    /// Idle seconds before a session is swept.
    pub ttl_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ring_size: 64,
            ttl_secs: 3600,
        }
    }
}

/// Token-bucket admission control configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RateLimitConfig {
    /// Refill rate in tokens per second.
    pub requests_per_sec: f64,
    /// Burst capacity.
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_sec: 100.0,
            burst: 200,
        }
    }
}

/// Audit sink configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct AuditConfig {
    /// Path of the JSON-lines audit log.
    pub log_path: String,
    /// Flush interval in milliseconds.
    pub flush_interval_ms: u64,
    /// Bounded capacity of the in-memory record queue.
    pub queue_capacity: usize,
    /// Batch size that triggers an early flush.
    pub high_watermark: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            log_path: "./audit/gateway.jsonl".to_string(),
            flush_interval_ms: 1000,
            queue_capacity: 4096,
            high_watermark: 256,
        }
    }
}

/// Escalation hub configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct EscalationConfig {
    /// Seconds to wait for a human verdict before resolving to BLOCK.
    pub deadline_secs: u64,
    /// Bounded per-operator event queue size.
    pub operator_queue_size: usize,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            deadline_secs: 30,
            operator_queue_size: 256,
        }
    }
}

impl GatewayConfig {
    /// Parse a YAML document. Unknown keys anywhere in the tree are an error.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, GatewayError> {
        let config: GatewayConfig = serde_yaml::from_str(yaml)
            .map_err(|e| GatewayError::Config(format!("failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a YAML config file.
    pub fn from_yaml_file(path: &Path) -> Result<Self, GatewayError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| GatewayError::Config(format!("failed to read {}: {e}", path.display())))?;
        Self::from_yaml_str(&content)
    }

    /// Check cross-field invariants.
    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.session.ring_size == 0 {
            return Err(GatewayError::Config(
                "session.ring_size must be at least 1".to_string(),
            ));
        }
        if self.rate_limit.requests_per_sec <= 0.0 {
            return Err(GatewayError::Config(
                "rate_limit.requests_per_sec must be positive".to_string(),
            ));
        }
        if self.rate_limit.burst == 0 {
            return Err(GatewayError::Config(
                "rate_limit.burst must be at least 1".to_string(),
            ));
        }
        if self.l2.enabled && self.l2.endpoint.is_empty() {
            return Err(GatewayError::Config(
                "l2.endpoint must be set when l2.enabled is true".to_string(),
            ));
        }
        if self.l2.timeout_secs <= 0.0 {
            return Err(GatewayError::Config(
                "l2.timeout_secs must be positive".to_string(),
            ));
        }
        if self.upstream.timeout_secs == 0 {
            return Err(GatewayError::Config(
                "upstream.timeout_secs must be positive".to_string(),
            ));
        }
        if self.audit.log_path.is_empty() {
            return Err(GatewayError::Config(
                "audit.log_path must not be empty".to_string(),
            ));
        }
        if self.audit.queue_capacity == 0 || self.audit.high_watermark == 0 {
            return Err(GatewayError::Config(
                "audit queue_capacity and high_watermark must be at least 1".to_string(),
            ));
        }
        if self.escalation.deadline_secs == 0 {
            return Err(GatewayError::Config(
                "escalation.deadline_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
