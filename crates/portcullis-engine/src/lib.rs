/// Dual analysis pipeline for the Portcullis gateway.
///
/// - `static_analyzer` — the L1 multi-pattern/regex engine (synchronous, infallible)
/// - `semantic_analyzer` — the L2 LLM classifier with pluggable backends and fail-open
/// - `policy` — the pure decision table merging both findings into a verdict
pub mod policy;
pub mod semantic_analyzer;
pub mod static_analyzer;

pub use policy::{decide, Decision};
pub use semantic_analyzer::{LiveClassifier, MockClassifier, SemanticAnalyzer};
pub use static_analyzer::StaticAnalyzer;
