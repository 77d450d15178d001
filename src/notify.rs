//! Domain notifications published by a running Raft node.
//!
//! Notifications describe what the node just did (role and term transitions, leader changes,
//! commits, applies and timer expirations) in the causal order the events occurred. They are
//! published on a single lossless stream obtained from [`Raft::notifications`]; producers never
//! block on a slow consumer.
//!
//! [`Raft::notifications`]: crate::Raft::notifications

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::core::State;
use crate::raft::MembershipConfig;
use crate::NodeId;

/// A notification of a domain event on a running Raft node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Notification {
    /// The node transitioned between top-level states.
    StateChange { old: State, new: State },
    /// The node's current term changed.
    TermChange { old: u64, new: u64 },
    /// The node's view of the cluster leader changed.
    LeaderChange { leader: Option<NodeId> },
    /// The commit index advanced to `index` while the node was at `term`.
    Commit { term: u64, index: u64 },
    /// The entry at `index` (created in `term`) was applied to the state machine.
    Apply { term: u64, index: u64 },
    /// The election timer expired.
    ElectionTimeout,
    /// The leader's heartbeat timer ticked.
    HeartbeatTimeout,
    /// The active membership configuration changed.
    MembershipChange { membership: MembershipConfig },
    /// The node encountered a fatal storage error and entered its terminal state.
    PersistError,
}

/// The producer half of the notification stream.
pub(crate) struct Notifier {
    tx: mpsc::UnboundedSender<Notification>,
}

impl Notifier {
    pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Publish a notification.
    ///
    /// An application which has dropped the receiving half simply stops observing events; the
    /// node itself is unaffected.
    pub(crate) fn notify(&self, event: Notification) {
        let _ = self.tx.send(event);
    }
}
