//! Error types exposed by this crate.

use crate::raft_types::SnapshotSegmentId;
use crate::NodeId;

/// A result type where the error variant is always a `RaftError`.
pub type RaftResult<T> = std::result::Result<T, RaftError>;

/// Error variants related to the internals of Raft.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum RaftError {
    /// A streaming snapshot segment arrived out of order.
    #[error("expected snapshot segment {expect}, got {got}")]
    SnapshotMismatch {
        expect: SnapshotSegmentId,
        got: SnapshotSegmentId,
    },

    /// An error which has come from the `RaftStorage` layer.
    ///
    /// Storage errors are fatal: the node which observes one transitions into the terminal
    /// persist-error state and stays there until externally restarted.
    #[error("{0}")]
    RaftStorage(anyhow::Error),

    /// An error which has come from the `RaftNetwork` layer.
    #[error("{0}")]
    RaftNetwork(anyhow::Error),

    /// An internal error indicating that the node is shutting down.
    #[error("raft is shutting down")]
    ShuttingDown,
}

/// The set of errors which a client request may resolve with.
///
/// Every client request carries a one-shot response channel; each of these variants is
/// delivered on that channel exactly once.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ClientError {
    /// An internal Raft error.
    #[error("{0}")]
    Raft(#[from] RaftError),

    /// This node is not the leader and no leader is currently known.
    #[error("this node is not the leader and no leader is known")]
    LeaderUnknown,

    /// This node is not the leader; the request should be retried against the given node.
    #[error("this node is not the leader, redirect to node {0}")]
    LeaderRedirect(NodeId),

    /// The leader has not yet committed an entry in its own term, so it cannot serve
    /// linearizable operations.
    #[error("the leader has not yet committed an entry in its term")]
    LeaderUnsync,

    /// A membership change is already in progress.
    #[error("a membership change is already in progress")]
    InMemberChange,

    /// The proposed configuration would leave the cluster in an inoperable state.
    #[error("the proposed configuration would leave the cluster inoperable")]
    InoperableConfig,

    /// The node has encountered a fatal storage error and is no longer serving requests.
    #[error("a fatal storage persistence error has occurred")]
    PersistError,
}

/// Error variants related to configuration.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// An election timeout not greater than the heartbeat interval would cause endless
    /// elections. A recommended election timeout is about 3 times the heartbeat interval.
    #[error("election_timeout must be greater than heartbeat_timeout")]
    ElectionTimeoutTooSmall,

    /// The election timeout threshold must lie within `(0, 1]`.
    #[error("election_timeout_threshold must lie within (0, 1]")]
    InvalidElectionTimeoutThreshold,

    /// The timeout jitter must lie within `[0, 1)`.
    #[error("max_timeout_jitter must lie within [0, 1)")]
    InvalidTimeoutJitter,

    /// The given value for `max_append_entries` is too small, must be > 0.
    #[error("max_append_entries must be greater than 0")]
    MaxAppendEntriesTooSmall,

    /// The given value for `max_snapshot_chunk_size` is too small, must be > 0.
    #[error("max_snapshot_chunk_size must be greater than 0")]
    SnapshotChunkSizeTooSmall,
}
