//! Policy engine.
//!
//! A pure function from `(method class, L1 finding, L2 finding)` to a
//! verdict. No I/O, no clock, no state: re-running the table on stored
//! findings reproduces the recorded verdict.
//!
//! Decision table (confidence bounds inclusive at their lower ends):
//!
//! | L1 level | L2                          | Verdict            |
//! |----------|-----------------------------|--------------------|
//! | CRITICAL | any                         | BLOCK              |
//! | HIGH     | injection, conf >= 0.7      | BLOCK              |
//! | HIGH     | injection, conf <  0.7      | ESCALATE           |
//! | HIGH     | not injection or unknown    | ESCALATE           |
//! | MEDIUM   | injection, conf >= 0.8      | BLOCK              |
//! | MEDIUM   | injection, conf <  0.8      | ESCALATE           |
//! | MEDIUM   | not injection or unknown    | ALLOW (audited)    |
//! | LOW/NONE | injection, conf >= 0.9      | BLOCK              |
//! | LOW/NONE | injection, 0.7 <= conf <0.9 | ESCALATE           |
//! | LOW/NONE | otherwise                   | ALLOW              |
//!
//! `unknown` is treated as "no opinion" and never triggers BLOCK on its own.

use portcullis_types::analysis::{L1Finding, L2Finding, ThreatLevel, Verdict};
use portcullis_types::wire::MethodClass;

/// Output of the policy engine.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    /// The verdict to enforce (before any human resolution).
    pub verdict: Verdict,
    /// Aggregated threat level: max of L1 and the confidence-derived L2 level.
    pub threat: ThreatLevel,
    /// Structured reason string for audit records and block replies.
    pub reason: String,
}

/// Threat level implied by the L2 finding alone.
fn l2_threat(l2: &L2Finding) -> ThreatLevel {
    if !l2.is_injection() {
        return ThreatLevel::None;
    }
    if l2.confidence >= 0.9 {
        ThreatLevel::Critical
    } else if l2.confidence >= 0.7 {
        ThreatLevel::High
    } else {
        ThreatLevel::Medium
    }
}

/// Compose the human-readable reason from both findings.
fn build_reason(l1: &L1Finding, l2: &L2Finding) -> String {
    let mut parts = Vec::new();
    if !l1.patterns.is_empty() {
        let shown: Vec<&str> = l1.patterns.iter().take(5).map(String::as_str).collect();
        parts.push(format!("L1 patterns: {}", shown.join(", ")));
    }
    if l2.is_injection() {
        parts.push(format!(
            "L2 injection (conf={:.2}): {}",
            l2.confidence, l2.reasoning
        ));
    }
    if parts.is_empty() {
        "clean".to_string()
    } else {
        parts.join("; ")
    }
}

/// Merge both findings into a final decision.
///
/// Safe-class methods short-circuit to ALLOW without consulting either
/// analysis.
pub fn decide(class: MethodClass, l1: &L1Finding, l2: &L2Finding) -> Decision {
    if class == MethodClass::Safe {
        return Decision {
            verdict: Verdict::Allow,
            threat: ThreatLevel::None,
            reason: "safe method".to_string(),
        };
    }

    let threat = l1.level.max(l2_threat(l2));
    let reason = build_reason(l1, l2);
    let injection = l2.is_injection();

    let verdict = match l1.level {
        ThreatLevel::Critical => Verdict::Block,
        ThreatLevel::High => {
            if injection && l2.confidence >= 0.7 {
                Verdict::Block
            } else {
                Verdict::Escalate
            }
        }
        ThreatLevel::Medium => {
            if injection && l2.confidence >= 0.8 {
                Verdict::Block
            } else if injection {
                Verdict::Escalate
            } else {
                Verdict::Allow
            }
        }
        ThreatLevel::Low | ThreatLevel::None => {
            if injection && l2.confidence >= 0.9 {
                Verdict::Block
            } else if injection && l2.confidence >= 0.7 {
                Verdict::Escalate
            } else {
                Verdict::Allow
            }
        }
    };

    Decision {
        verdict,
        threat,
        reason,
    }
}
