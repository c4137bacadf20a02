//! Single-fire commit decision shared by the participants of one update.

use std::sync::Arc;

use tokio::sync::watch;

/// Outcome of an update cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitDecision {
    Proceed,
    Abort,
}

/// A decision that can be made exactly once.
///
/// Every update cycle creates a fresh gate. Waiters clone the gate before
/// awaiting it, so a replacement made for a later cycle never changes the
/// outcome they observe.
#[derive(Debug, Clone)]
pub struct CommitGate {
    decision: Arc<watch::Sender<Option<CommitDecision>>>,
}

impl CommitGate {
    pub fn new() -> Self {
        let (decision, _) = watch::channel(None);
        Self {
            decision: Arc::new(decision),
        }
    }

    /// Resolves the gate. Returns `false` if it was already resolved, in
    /// which case the earlier decision stands.
    pub fn resolve(&self, decision: CommitDecision) -> bool {
        self.decision.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(decision);
            true
        })
    }

    pub fn decision(&self) -> Option<CommitDecision> {
        *self.decision.borrow()
    }

    /// Waits until the gate is resolved.
    pub async fn wait(&self) -> CommitDecision {
        let mut receiver = self.decision.subscribe();
        let decision = match receiver.wait_for(Option::is_some).await {
            Ok(decision) => *decision,
            // The sender lives in `self`, so the channel cannot close here.
            Err(_) => None,
        };
        decision.unwrap_or(CommitDecision::Abort)
    }
}

impl Default for CommitGate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn first_resolution_wins() {
        let gate = CommitGate::new();
        assert!(gate.resolve(CommitDecision::Proceed));
        assert!(!gate.resolve(CommitDecision::Abort));
        assert_eq!(gate.decision(), Some(CommitDecision::Proceed));
    }

    #[tokio::test]
    async fn waiter_sees_later_resolution() {
        let gate = CommitGate::new();
        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.wait().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        gate.resolve(CommitDecision::Abort);

        assert_eq!(waiter.await.unwrap(), CommitDecision::Abort);
    }

    #[tokio::test]
    async fn replaced_gate_does_not_leak_into_old_waiters() {
        let mut current = CommitGate::new();
        let captured = current.clone();

        current = CommitGate::new();
        current.resolve(CommitDecision::Proceed);
        captured.resolve(CommitDecision::Abort);

        assert_eq!(captured.wait().await, CommitDecision::Abort);
        assert_eq!(current.wait().await, CommitDecision::Proceed);
    }
}
