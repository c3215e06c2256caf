//! L1 static analyzer.
//!
//! Two sub-engines run over the UTF-8 payload and over every string leaf of
//! the parsed params:
//!
//! 1. A multi-pattern dictionary scan — a case-insensitive `RegexSet` built
//!    once from escaped literal fragments, so one linear pass finds every
//!    dictionary hit regardless of dictionary size.
//! 2. A compiled structural regex battery (shell pipes, injection markers,
//!    obfuscation, traversal, SQL, exfiltration URLs).
//!
//! Suspicious Base64 blobs are decoded and the decoded content re-scanned
//! through both sub-engines, bounded to two levels of recursion.
//!
//! L1 is infallible by contract: internal errors degrade the finding to
//! MEDIUM with an `l1_error` tag and the pipeline continues.

use regex::{Regex, RegexSet};
use serde_json::Value;
use tracing::{debug, warn};

use portcullis_types::analysis::{L1Finding, ThreatLevel};
use portcullis_types::config::L1Config;
use portcullis_types::errors::GatewayError;

/// Maximum Base64 re-analysis depth.
const MAX_BASE64_DEPTH: u8 = 2;

/// Minimum blob length considered a Base64 candidate.
const BASE64_MIN_LEN: usize = 16;

/// Minimum token length considered for the entropy gate.
const BLOB_MIN_LEN: usize = 64;

/// Shannon entropy (bits/char) above which an opaque token is flagged.
const BLOB_ENTROPY_THRESHOLD: f64 = 4.8;

/// A compiled structural pattern with its associated threat level.
struct BatteryPattern {
    name: &'static str,
    regex: Regex,
    level: ThreatLevel,
}

/// L1 static analysis engine.
///
/// All patterns are compiled once at construction; `analyze` is a pure
/// function of its input and runs synchronously on the caller's thread.
pub struct StaticAnalyzer {
    enabled: bool,
    dictionary: Vec<String>,
    dictionary_set: RegexSet,
    battery: Vec<BatteryPattern>,
    env_reference: Regex,
    egress_marker: Regex,
    hex_run: Regex,
    base64_candidate: Regex,
    blob_token: Regex,
    max_scan_bytes: usize,
}

impl StaticAnalyzer {
    /// Build the analyzer from configuration, compiling every pattern once.
    pub fn new(config: &L1Config) -> Result<Self, GatewayError> {
        let dictionary: Vec<String> = config
            .blocked_patterns
            .iter()
            .filter(|p| !p.is_empty())
            .cloned()
            .collect();

        let dictionary_set = RegexSet::new(
            dictionary
                .iter()
                .map(|p| format!("(?i){}", regex::escape(p))),
        )
        .map_err(|e| GatewayError::Analysis(format!("failed to compile dictionary: {e}")))?;

        let battery = Self::compile_battery(&config.exfiltration_hosts)?;

        Ok(Self {
            enabled: config.enabled,
            dictionary,
            dictionary_set,
            battery,
            env_reference: compile(
                r"\$\{?(?:[A-Z0-9_]*(?:API_KEY|SECRET|TOKEN|PASSWORD|CREDENTIALS)|AWS_[A-Z0-9_]+|OPENAI_[A-Z0-9_]+|ANTHROPIC_[A-Z0-9_]+)",
            )?,
            egress_marker: compile(r"(?i)https?://|\bcurl\b|\bwget\b|\bnc\b|fetch\s*\(")?,
            hex_run: compile(r"(?:\\+x[0-9a-fA-F]{2}){4,}|(?:%[0-9a-fA-F]{2}){4,}")?,
            base64_candidate: compile(r"[A-Za-z0-9+/]{16,}={0,2}")?,
            blob_token: compile(r#"[^\s"'\\]{64,}"#)?,
            max_scan_bytes: config.max_scan_bytes,
        })
    }

    /// Compile the structural regex battery.
    fn compile_battery(exfil_hosts: &[String]) -> Result<Vec<BatteryPattern>, GatewayError> {
        let host_alternation = exfil_hosts
            .iter()
            .filter(|h| !h.is_empty())
            .map(|h| regex::escape(h))
            .collect::<Vec<_>>()
            .join("|");
        let exfil_pattern = if host_alternation.is_empty() {
            r"(?i)https?://\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}".to_string()
        } else {
            format!(
                r"(?i)https?://(?:\d{{1,3}}\.\d{{1,3}}\.\d{{1,3}}\.\d{{1,3}}|[a-z0-9.-]*(?:{host_alternation}))"
            )
        };

        Ok(vec![
            BatteryPattern {
                name: "shell_pipe_injection",
                regex: compile(
                    r"(?i)(?:[|;`]|\$\()\s*(?:bash|sh|zsh|curl|wget|nc|python|perl|ruby|node)\b",
                )?,
                level: ThreatLevel::High,
            },
            BatteryPattern {
                name: "prompt_injection_marker",
                regex: compile(
                    r"(?i)(?:(?:ignore|disregard|forget)\s+(?:all\s+)?(?:previous|prior|above)\s+(?:instructions?|prompts?|rules?|context)|you\s+are\s+now\s)",
                )?,
                level: ThreatLevel::Critical,
            },
            BatteryPattern {
                name: "base64_obfuscation",
                regex: compile(r"(?i)(?:base64\s+(?:-d\b|--decode\b)|atob\s*\(|b64decode)")?,
                level: ThreatLevel::High,
            },
            BatteryPattern {
                name: "path_traversal",
                regex: compile(r"(?:\.\./){2,}|/etc/(?:passwd|shadow|sudoers)")?,
                level: ThreatLevel::High,
            },
            BatteryPattern {
                name: "sql_injection",
                regex: compile(
                    r"(?i)(?:UNION\s+SELECT|\bOR\s+1\s*=\s*1\b|'\s*(?:OR|AND)\s+'|[';]\s*--)",
                )?,
                level: ThreatLevel::High,
            },
            BatteryPattern {
                name: "data_exfiltration_url",
                regex: compile(&exfil_pattern)?,
                level: ThreatLevel::High,
            },
        ])
    }

    /// The configured dictionary, in insertion order.
    pub fn dictionary(&self) -> &[String] {
        &self.dictionary
    }

    /// Run the full L1 pipeline over a serialized payload.
    ///
    /// Never fails: internal errors degrade to a MEDIUM `l1_error` finding,
    /// oversize payloads short-circuit to a MEDIUM `oversize_payload` finding
    /// without scanning.
    pub fn analyze(&self, raw: &str, params: Option<&Value>) -> L1Finding {
        let mut finding = L1Finding::clean();
        if !self.enabled {
            return finding;
        }

        if raw.len() > self.max_scan_bytes {
            finding.record("oversize_payload", ThreatLevel::Medium);
            return finding;
        }

        if let Err(e) = self.scan_all(raw, params, &mut finding) {
            warn!(error = %e, "L1 scan degraded");
            finding.record("l1_error", ThreatLevel::Medium);
        }

        debug!(
            level = %finding.level,
            patterns = finding.patterns.len(),
            base64_depth = finding.base64_depth,
            "L1 analysis complete"
        );
        finding
    }

    fn scan_all(
        &self,
        raw: &str,
        params: Option<&Value>,
        finding: &mut L1Finding,
    ) -> Result<(), GatewayError> {
        self.scan_text(raw, 0, finding)?;
        if let Some(params) = params {
            for leaf in string_leaves(params) {
                self.scan_text(leaf, 0, finding)?;
            }
        }
        Ok(())
    }

    /// Scan one text fragment at the given Base64 recursion depth.
    fn scan_text(&self, text: &str, depth: u8, finding: &mut L1Finding) -> Result<(), GatewayError> {
        // Dictionary scan — one linear pass over the fragment.
        for idx in self.dictionary_set.matches(text) {
            let pattern = &self.dictionary[idx];
            finding.record(format!("dict:{pattern}"), dictionary_level(pattern));
        }

        // Structural battery.
        for pattern in &self.battery {
            if pattern.regex.is_match(text) {
                finding.record(pattern.name, pattern.level);
            }
        }

        // Environment exfiltration needs a privileged variable reference
        // combined with an egress marker in the same fragment.
        if self.env_reference.is_match(text) && self.egress_marker.is_match(text) {
            finding.record("env_exfiltration", ThreatLevel::Critical);
        }

        // Hex runs that decode to printable ASCII.
        for run in self.hex_run.find_iter(text) {
            if decode_hex_run(run.as_str()).is_some() {
                finding.record("hex_obfuscation", ThreatLevel::Medium);
                break;
            }
        }

        // High-entropy opaque tokens.
        for token in self.blob_token.find_iter(text) {
            if shannon_entropy(token.as_str()) >= BLOB_ENTROPY_THRESHOLD {
                finding.record("suspicious_blob", ThreatLevel::Medium);
                break;
            }
        }

        // Base64 heuristic re-analysis, bounded recursion.
        if depth < MAX_BASE64_DEPTH {
            for candidate in self.base64_candidate.find_iter(text) {
                let blob = candidate.as_str();
                if blob.len() < BASE64_MIN_LEN {
                    continue;
                }
                if let Some(decoded) = decode_base64_utf8(blob) {
                    if finding.base64_depth < depth + 1 {
                        finding.base64_depth = depth + 1;
                    }
                    self.scan_text(&decoded, depth + 1, finding)?;
                }
            }
        }

        Ok(())
    }
}

/// Severity of a dictionary hit. Privileged-path fragments scan at HIGH
/// (corroborated by the traversal battery); command fragments at CRITICAL.
fn dictionary_level(pattern: &str) -> ThreatLevel {
    if pattern.starts_with('/') {
        ThreatLevel::High
    } else {
        ThreatLevel::Critical
    }
}

/// Compile a regex, mapping failure into the gateway error space.
fn compile(pattern: &str) -> Result<Regex, GatewayError> {
    Regex::new(pattern)
        .map_err(|e| GatewayError::Analysis(format!("failed to compile pattern: {e}")))
}

/// Collect every string leaf of a JSON value, depth-first.
fn string_leaves(value: &Value) -> Vec<&str> {
    let mut leaves = Vec::new();
    collect_leaves(value, &mut leaves);
    leaves
}

fn collect_leaves<'a>(value: &'a Value, out: &mut Vec<&'a str>) {
    match value {
        Value::String(s) => out.push(s),
        Value::Array(items) => {
            for item in items {
                collect_leaves(item, out);
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                collect_leaves(item, out);
            }
        }
        _ => {}
    }
}

/// Decode a Base64-shaped blob if it yields valid UTF-8.
fn decode_base64_utf8(blob: &str) -> Option<String> {
    use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
    use base64::Engine;

    let bytes = if blob.ends_with('=') {
        STANDARD.decode(blob).ok()?
    } else {
        STANDARD_NO_PAD.decode(blob).ok()?
    };
    String::from_utf8(bytes).ok()
}

/// Decode a `\xNN` or `%NN` run, returning the text only if every byte is
/// printable ASCII. Tolerates the doubled backslashes of JSON-escaped text.
fn decode_hex_run(run: &str) -> Option<String> {
    let stripped = run
        .replace('\\', "")
        .replace('x', " ")
        .replace('%', " ");
    let mut bytes = Vec::with_capacity(run.len() / 4);
    for pair in stripped.split_whitespace() {
        bytes.push(u8::from_str_radix(pair, 16).ok()?);
    }
    if !bytes.is_empty() && bytes.iter().all(|b| (0x20..=0x7e).contains(b)) {
        String::from_utf8(bytes).ok()
    } else {
        None
    }
}

/// Shannon entropy in bits per character.
fn shannon_entropy(s: &str) -> f64 {
    let mut counts = std::collections::HashMap::new();
    let mut total = 0usize;
    for c in s.chars() {
        *counts.entry(c).or_insert(0usize) += 1;
        total += 1;
    }
    if total == 0 {
        return 0.0;
    }
    counts
        .values()
        .map(|&n| {
            let p = n as f64 / total as f64;
            -p * p.log2()
        })
        .sum()
}
