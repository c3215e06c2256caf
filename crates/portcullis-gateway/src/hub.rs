//! Escalation hub.
//!
//! Two responsibilities, both operator-facing:
//!
//! - **Event fan-out**: every analyzed request becomes a [`DashboardEvent`]
//!   broadcast to all connected operators. Each operator has a bounded view
//!   of the stream; slow consumers lose the oldest events and see a
//!   `dropped_n` count rather than ever backpressuring the pipeline.
//! - **Human-in-the-loop escalations**: ESCALATE verdicts register a pending
//!   entry keyed by request id and wait for the first operator response or
//!   the deadline. Later responses and unknown ids are acknowledged and
//!   ignored; disconnected requests are reaped without waiting.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, warn};

use portcullis_types::analysis::{DashboardEvent, OperatorAction, OperatorResponse};
use portcullis_types::config::EscalationConfig;

/// A resolved human decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HumanDecision {
    /// What the operator chose.
    pub action: OperatorAction,
    /// Who decided, for the audit record.
    pub operator: String,
}

/// How a pending escalation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EscalationOutcome {
    /// An operator decided before the deadline.
    Decided(HumanDecision),
    /// The deadline expired with no decision.
    TimedOut,
    /// The escalation was reaped (originating transport gone).
    Cancelled,
}

/// One operator's view of the event stream.
///
/// Wraps a broadcast receiver and accumulates the number of events this
/// operator lost to backpressure.
pub struct OperatorFeed {
    rx: broadcast::Receiver<DashboardEvent>,
    /// Events dropped for this operator because it fell behind.
    pub dropped: u64,
}

impl OperatorFeed {
    /// Next event, skipping over lag gaps. `None` when the hub is gone.
    pub async fn next(&mut self) -> Option<DashboardEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.dropped += n;
                    warn!(dropped = self.dropped, "operator feed lagging, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Broadcast hub for operator events and pending escalations.
pub struct EscalationHub {
    events: broadcast::Sender<DashboardEvent>,
    pending: Mutex<HashMap<String, oneshot::Sender<HumanDecision>>>,
    deadline: Duration,
}

impl EscalationHub {
    /// Build a hub from configuration.
    pub fn new(config: &EscalationConfig) -> Self {
        Self::with_deadline(
            Duration::from_secs(config.deadline_secs),
            config.operator_queue_size,
        )
    }

    /// Build a hub with an explicit deadline and per-operator queue bound.
    pub fn with_deadline(deadline: Duration, operator_queue_size: usize) -> Self {
        let (events, _) = broadcast::channel(operator_queue_size.max(1));
        Self {
            events,
            pending: Mutex::new(HashMap::new()),
            deadline,
        }
    }

    /// Connect an operator to the event stream.
    pub fn subscribe(&self) -> OperatorFeed {
        OperatorFeed {
            rx: self.events.subscribe(),
            dropped: 0,
        }
    }

    /// Number of connected operators.
    pub fn operator_count(&self) -> usize {
        self.events.receiver_count()
    }

    /// Number of escalations awaiting a decision.
    pub fn pending_count(&self) -> usize {
        self.lock_pending().len()
    }

    /// Fan an event out to all connected operators.
    ///
    /// Never blocks: operators that fell behind lose their oldest events.
    pub fn publish(&self, event: DashboardEvent) {
        // Send fails only when no operator is connected, which is fine.
        let _ = self.events.send(event);
    }

    /// Register a pending escalation for a request id.
    ///
    /// The returned receiver resolves when an operator responds; pass it to
    /// [`await_decision`](Self::await_decision).
    pub fn register(&self, request_id: &str) -> oneshot::Receiver<HumanDecision> {
        let (tx, rx) = oneshot::channel();
        self.lock_pending().insert(request_id.to_string(), tx);
        debug!(request = %request_id, "escalation registered");
        rx
    }

    /// Wait for the first operator decision or the deadline.
    ///
    /// On deadline expiry the pending entry is removed and the escalation
    /// resolves to a timeout (the dispatcher maps it to BLOCK with reason
    /// `escalation_timeout`).
    pub async fn await_decision(
        &self,
        request_id: &str,
        rx: oneshot::Receiver<HumanDecision>,
    ) -> EscalationOutcome {
        match tokio::time::timeout(self.deadline, rx).await {
            Ok(Ok(decision)) => {
                info!(request = %request_id, operator = %decision.operator, "escalation decided");
                EscalationOutcome::Decided(decision)
            }
            Ok(Err(_)) => {
                // Sender dropped without a decision: the escalation was reaped.
                EscalationOutcome::Cancelled
            }
            Err(_) => {
                self.lock_pending().remove(request_id);
                warn!(request = %request_id, "escalation deadline expired");
                EscalationOutcome::TimedOut
            }
        }
    }

    /// Apply an operator response. The first response wins; later responses
    /// and unknown request ids return `false` and change nothing.
    pub fn resolve(&self, response: &OperatorResponse, operator: &str) -> bool {
        let sender = self.lock_pending().remove(&response.request_id);
        match sender {
            Some(tx) => {
                let decision = HumanDecision {
                    action: response.action,
                    operator: operator.to_string(),
                };
                // The waiter may have timed out between removal and send.
                tx.send(decision).is_ok()
            }
            None => {
                debug!(request = %response.request_id, "ignoring response for unknown escalation");
                false
            }
        }
    }

    /// Parse and apply a raw operator message.
    ///
    /// Unknown actions (parse failures) are acknowledged and ignored.
    pub fn handle_operator_message(&self, raw: &[u8], operator: &str) -> bool {
        match serde_json::from_slice::<OperatorResponse>(raw) {
            Ok(response) => self.resolve(&response, operator),
            Err(e) => {
                debug!(error = %e, "ignoring unparseable operator message");
                false
            }
        }
    }

    /// Reap a pending escalation whose originating transport is gone.
    pub fn cancel(&self, request_id: &str) -> bool {
        let removed = self.lock_pending().remove(request_id).is_some();
        if removed {
            debug!(request = %request_id, "escalation cancelled");
        }
        removed
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<String, oneshot::Sender<HumanDecision>>> {
        match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use portcullis_types::analysis::{
        AnalysisSummary, L1Finding, L2Finding, ThreatLevel, Verdict,
    };
    use std::sync::Arc;

    fn event(request_id: &str) -> DashboardEvent {
        DashboardEvent {
            event_type: "request_analyzed".to_string(),
            timestamp: 0.0,
            session_id: "s1".to_string(),
            agent_id: "agent".to_string(),
            method: "tools/call".to_string(),
            payload_preview: String::new(),
            analysis: AnalysisSummary {
                l1: L1Finding::clean(),
                l2: L2Finding::unknown("mock", "test"),
                verdict: Verdict::Escalate,
                threat_level: ThreatLevel::High,
                reason: "test".to_string(),
            },
            is_alert: true,
            request_id: request_id.to_string(),
        }
    }

    fn hub(deadline: Duration) -> EscalationHub {
        EscalationHub::with_deadline(deadline, 16)
    }

    #[tokio::test]
    async fn operator_decision_resolves_escalation() {
        let hub = Arc::new(hub(Duration::from_secs(5)));
        let rx = hub.register("r1");

        let resolver = hub.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let response = OperatorResponse {
                action: OperatorAction::Allow,
                request_id: "r1".to_string(),
            };
            assert!(resolver.resolve(&response, "op-1"));
        });

        let outcome = hub.await_decision("r1", rx).await;
        assert_eq!(
            outcome,
            EscalationOutcome::Decided(HumanDecision {
                action: OperatorAction::Allow,
                operator: "op-1".to_string(),
            })
        );
        assert_eq!(hub.pending_count(), 0);
    }

    #[tokio::test]
    async fn first_operator_wins() {
        let hub = hub(Duration::from_secs(5));
        let rx = hub.register("r1");

        let block = OperatorResponse {
            action: OperatorAction::Block,
            request_id: "r1".to_string(),
        };
        let allow = OperatorResponse {
            action: OperatorAction::Allow,
            request_id: "r1".to_string(),
        };
        assert!(hub.resolve(&block, "op-1"));
        // The second response is acknowledged but changes nothing.
        assert!(!hub.resolve(&allow, "op-2"));

        let outcome = hub.await_decision("r1", rx).await;
        assert_eq!(
            outcome,
            EscalationOutcome::Decided(HumanDecision {
                action: OperatorAction::Block,
                operator: "op-1".to_string(),
            })
        );
    }

    #[tokio::test]
    async fn deadline_expiry_times_out() {
        let hub = hub(Duration::from_millis(40));
        let rx = hub.register("r1");
        let outcome = hub.await_decision("r1", rx).await;
        assert_eq!(outcome, EscalationOutcome::TimedOut);
        assert_eq!(hub.pending_count(), 0);
    }

    #[tokio::test]
    async fn late_response_after_timeout_is_ignored() {
        let hub = hub(Duration::from_millis(20));
        let rx = hub.register("r1");
        let _ = hub.await_decision("r1", rx).await;

        let response = OperatorResponse {
            action: OperatorAction::Allow,
            request_id: "r1".to_string(),
        };
        assert!(!hub.resolve(&response, "op-1"));
    }

    #[tokio::test]
    async fn cancel_reaps_without_waiting() {
        let hub = hub(Duration::from_secs(60));
        let rx = hub.register("r1");
        assert!(hub.cancel("r1"));

        let outcome = hub.await_decision("r1", rx).await;
        assert_eq!(outcome, EscalationOutcome::Cancelled);
        assert!(!hub.cancel("r1"));
    }

    #[tokio::test]
    async fn unknown_request_id_is_ignored() {
        let hub = hub(Duration::from_secs(5));
        let response = OperatorResponse {
            action: OperatorAction::Block,
            request_id: "never-registered".to_string(),
        };
        assert!(!hub.resolve(&response, "op-1"));
    }

    #[tokio::test]
    async fn operator_messages_parse_the_hitl_wire_shape() {
        let hub = hub(Duration::from_secs(5));
        let rx = hub.register("r1");

        assert!(hub.handle_operator_message(
            br#"{"action":"block","request_id":"r1"}"#,
            "op-1"
        ));
        let outcome = hub.await_decision("r1", rx).await;
        assert!(matches!(outcome, EscalationOutcome::Decided(d) if d.action == OperatorAction::Block));
    }

    #[tokio::test]
    async fn unknown_action_is_acknowledged_and_ignored() {
        let hub = hub(Duration::from_secs(5));
        let _rx = hub.register("r1");
        assert!(!hub.handle_operator_message(
            br#"{"action":"quarantine","request_id":"r1"}"#,
            "op-1"
        ));
        assert_eq!(hub.pending_count(), 1);
    }

    #[tokio::test]
    async fn events_fan_out_to_all_operators() {
        let hub = hub(Duration::from_secs(5));
        let mut feed_a = hub.subscribe();
        let mut feed_b = hub.subscribe();
        assert_eq!(hub.operator_count(), 2);

        hub.publish(event("r1"));

        assert_eq!(feed_a.next().await.unwrap().request_id, "r1");
        assert_eq!(feed_b.next().await.unwrap().request_id, "r1");
    }

    #[tokio::test]
    async fn slow_operator_drops_oldest_and_counts() {
        let hub = EscalationHub::with_deadline(Duration::from_secs(5), 4);
        let mut feed = hub.subscribe();

        for i in 0..10 {
            hub.publish(event(&format!("r{i}")));
        }

        // The feed lost the oldest events; the first delivered one is late in
        // the stream and the drop count reflects the gap.
        let first = feed.next().await.unwrap();
        assert!(feed.dropped > 0);
        assert_ne!(first.request_id, "r0");

        // The newest event is still delivered.
        let mut last = first;
        while let Ok(event) = tokio::time::timeout(Duration::from_millis(20), feed.next()).await {
            last = event.unwrap();
        }
        assert_eq!(last.request_id, "r9");
    }

    #[tokio::test]
    async fn publish_without_operators_does_not_block() {
        let hub = hub(Duration::from_secs(5));
        hub.publish(event("r1"));
        assert_eq!(hub.operator_count(), 0);
    }
}
