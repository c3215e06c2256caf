/// The Portcullis gateway core: everything between transport ingress and the
/// upstream tool server.
///
/// - `session` — per-agent bounded message rings with TTL eviction
/// - `ratelimit` — token-bucket admission control
/// - `audit` — batched append-only JSONL audit sink with a read surface
/// - `hub` — operator event fan-out and human-in-the-loop escalations
/// - `upstream` — HTTP client for the protected tool server
/// - `reply` — the byte-stream contract back toward transport adapters
/// - `dispatch` — the orchestrator owning each request from ingress to its
///   terminal state
pub mod audit;
pub mod dispatch;
pub mod hub;
pub mod ratelimit;
pub mod reply;
pub mod session;
pub mod upstream;

pub use audit::{AuditQuery, AuditSink, AuditStats};
pub use dispatch::{Dispatcher, GatewayHealth};
pub use hub::{EscalationHub, EscalationOutcome, HumanDecision, OperatorFeed};
pub use ratelimit::RateLimiter;
pub use reply::MpscReplyChannel;
pub use session::SessionStore;
pub use upstream::HttpUpstream;
