//! Reply channel for transport adapters.
//!
//! The byte-stream contract back toward the agent: the dispatcher writes
//! whole serialized JSON-RPC messages, the transport adapter drains them.
//! Dropping the receiving side models an agent disconnect — `is_open`
//! flips and the dispatcher abandons the in-flight request.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use portcullis_types::errors::GatewayError;
use portcullis_types::traits::ReplyChannel;

/// Bounded in-process reply channel.
pub struct MpscReplyChannel {
    tx: mpsc::Sender<Vec<u8>>,
}

impl MpscReplyChannel {
    /// Create a channel pair: the sender half for a [`RequestEnvelope`],
    /// the receiver half for the transport adapter's write loop.
    ///
    /// [`RequestEnvelope`]: portcullis_types::analysis::RequestEnvelope
    pub fn new(capacity: usize) -> (Arc<Self>, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Arc::new(Self { tx }), rx)
    }
}

#[async_trait]
impl ReplyChannel for MpscReplyChannel {
    async fn send(&self, payload: Vec<u8>) -> Result<(), GatewayError> {
        self.tx
            .send(payload)
            .await
            .map_err(|_| GatewayError::Transport("reply channel closed".to_string()))
    }

    fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }
}
