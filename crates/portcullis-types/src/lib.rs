/// Shared types, traits, and errors for the Portcullis gateway.
///
/// This crate is the foundation that the analysis engine and the gateway
/// depend on. It contains:
/// - **Wire model** (`wire`) — JSON-RPC 2.0 parsing, method classes, reply shapes
/// - **Analysis types** (`analysis`) — findings, verdicts, audit records, events
/// - **Trait contracts** (`traits`) — the seams toward transports, upstream, and L2
/// - **Error types** (`errors`) — unified error handling
/// - **Config types** (`config`) — the enumerated configuration surface
pub mod analysis;
pub mod config;
pub mod errors;
pub mod traits;
pub mod wire;

// Re-export commonly used types at the crate root for convenience.
pub use analysis::*;
pub use errors::GatewayError;
pub use traits::*;
pub use wire::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, MethodClass};
