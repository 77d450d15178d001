//! Raft metrics for observability.
//!
//! Applications may use this data in whatever way is needed. The obvious use cases are to
//! expose these metrics to a metrics collection system, or to trigger events within higher
//! levels of the parent application.
//!
//! Metrics are observed on a running Raft node via the `Raft::metrics()` method, which will
//! return a `watch` channel always holding the most recent snapshot of the node's state.

use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::watch;

use crate::core::{LeaderPhase, State};
use crate::raft::MembershipConfig;
use crate::NodeId;

/// A set of metrics describing the current state of a Raft node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftMetrics {
    /// The ID of the Raft node.
    pub id: NodeId,
    /// The state of the Raft node.
    pub state: State,
    /// The leader sub-state, present only while this node is the leader.
    pub leader_phase: Option<LeaderPhase>,
    /// The current term of the Raft node.
    pub current_term: u64,
    /// The last log index to be appended to this Raft node's log.
    pub last_log_index: u64,
    /// The last log index to be applied to this Raft node's state machine.
    pub last_applied: u64,
    /// The current cluster leader, if known.
    pub current_leader: Option<NodeId>,
    /// The current membership config of the cluster.
    pub membership_config: MembershipConfig,
}

impl RaftMetrics {
    pub(crate) fn new_initial(id: NodeId) -> Self {
        Self {
            id,
            state: State::Follower,
            leader_phase: None,
            current_term: 0,
            last_log_index: 0,
            last_applied: 0,
            current_leader: None,
            membership_config: MembershipConfig::new_initial(id),
        }
    }
}

/// An error which may arise while waiting for a metrics condition.
#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    /// The condition was not satisfied within the timeout.
    #[error("timeout after {0:?} when waiting for {1}")]
    Timeout(Duration, String),

    /// The node shut down while waiting.
    #[error("raft is shutting down")]
    ShuttingDown,
}

/// A handle for waiting on the metrics of a Raft node to satisfy some condition.
pub struct Wait {
    pub timeout: Duration,
    pub rx: watch::Receiver<RaftMetrics>,
}

impl Wait {
    /// Wait until the metrics satisfy the given predicate, or until the timeout elapses.
    pub async fn metrics<T>(&self, func: T, msg: impl ToString) -> Result<RaftMetrics, WaitError>
    where
        T: Fn(&RaftMetrics) -> bool,
    {
        let mut rx = self.rx.clone();
        let start = tokio::time::Instant::now();
        loop {
            let latest = rx.borrow().clone();
            if func(&latest) {
                return Ok(latest);
            }
            let elapsed = start.elapsed();
            if elapsed >= self.timeout {
                return Err(WaitError::Timeout(self.timeout, msg.to_string()));
            }
            match tokio::time::timeout(self.timeout - elapsed, rx.changed()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => return Err(WaitError::ShuttingDown),
                Err(_) => return Err(WaitError::Timeout(self.timeout, msg.to_string())),
            }
        }
    }

    /// Wait for `current_term` to reach at least the given value.
    pub async fn term(&self, want: u64, msg: impl ToString) -> Result<RaftMetrics, WaitError> {
        self.metrics(|m| m.current_term >= want, msg).await
    }

    /// Wait for `last_log_index` to reach at least the given value.
    pub async fn log(&self, want: u64, msg: impl ToString) -> Result<RaftMetrics, WaitError> {
        self.metrics(|m| m.last_log_index >= want, msg).await
    }

    /// Wait for `last_applied` to reach at least the given value.
    pub async fn applied(&self, want: u64, msg: impl ToString) -> Result<RaftMetrics, WaitError> {
        self.metrics(|m| m.last_applied >= want, msg).await
    }

    /// Wait for the node to enter the given state.
    pub async fn state(&self, want: State, msg: impl ToString) -> Result<RaftMetrics, WaitError> {
        self.metrics(|m| m.state == want, msg).await
    }

    /// Wait for the node to enter the given leader phase.
    pub async fn leader_phase(&self, want: LeaderPhase, msg: impl ToString) -> Result<RaftMetrics, WaitError> {
        self.metrics(|m| m.leader_phase == Some(want), msg).await
    }

    /// Wait for the node to observe the given leader.
    pub async fn current_leader(&self, want: NodeId, msg: impl ToString) -> Result<RaftMetrics, WaitError> {
        self.metrics(|m| m.current_leader == Some(want), msg).await
    }

    /// Wait for the active membership to equal the given configuration.
    pub async fn members(&self, want: MembershipConfig, msg: impl ToString) -> Result<RaftMetrics, WaitError> {
        self.metrics(|m| m.membership_config == want, msg).await
    }
}
