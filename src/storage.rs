//! The Raft storage interface and data types.
//!
//! The trait groups the four storage concerns the core consumes: the persistent log view, the
//! configuration history, the user state machine, and the snapshot store. A single object
//! implements all of them so that the core and the peer replicators can share one handle; the
//! log and the configuration history are written by the local node only, while replicators read
//! committed prefixes and snapshot chunks.

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;

use crate::raft::{ActiveMembership, Entry, MembershipConfig};
use crate::raft_types::LogId;
use crate::{AppData, AppDataResponse, NodeId};

/// A record holding the hard state of a Raft node.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    /// The last recorded term observed by this system.
    pub current_term: u64,
    /// The ID of the node voted for in the `current_term`.
    pub voted_for: Option<NodeId>,
}

/// The state which a Raft node needs when first starting.
#[derive(Clone, Debug)]
pub struct InitialState {
    /// The id of the last entry in the log.
    pub last_log_id: LogId,
    /// The lowest index still retained in the log.
    ///
    /// This is `1` for a log which has never been compacted, and
    /// `snapshot.last_log_id.index + 1` after compaction.
    pub first_log_index: u64,
    /// The durable committed-index cursor.
    pub committed_index: u64,
    /// The durable last-applied cursor.
    pub last_applied: u64,
    /// The saved hard state of the node.
    pub hard_state: HardState,
    /// The configuration defined by the highest-indexed configuration entry, else a new
    /// initial membership consisting only of this node's ID.
    pub membership: ActiveMembership,
}

impl InitialState {
    /// Create a new instance for a pristine Raft node.
    pub fn new_initial(id: NodeId) -> Self {
        Self {
            last_log_id: LogId::default(),
            first_log_index: 1,
            committed_index: 0,
            last_applied: 0,
            hard_state: HardState::default(),
            membership: ActiveMembership {
                log_id: LogId::default(),
                membership: MembershipConfig::new_initial(id),
            },
        }
    }
}

/// The metadata of a snapshot.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    /// The storage-assigned ID of the snapshot, used for chunked reads and writes.
    pub id: String,
    /// The id of the last log entry covered by this snapshot.
    pub last_log_id: LogId,
    /// The membership configuration in effect at `last_log_id`.
    pub membership: MembershipConfig,
}

/// A handle to a complete snapshot held by the snapshot store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// The snapshot's metadata.
    pub meta: SnapshotMeta,
    /// The total size of the snapshot blob, in bytes.
    pub size: u64,
}

/// A trait defining the interface for a Raft storage system.
///
/// Any error returned from these methods is treated as a persistence failure: the node emits a
/// `PersistError` notification, resolves inflight client requests with
/// [`ClientError::PersistError`](crate::error::ClientError) and transitions into its terminal
/// persist-error state. Recovery requires an external restart.
#[async_trait]
pub trait RaftStorage<D, R>: Send + Sync + 'static
where
    D: AppData,
    R: AppDataResponse,
{
    // --- initial & hard state ---------------------------------------------------------------

    /// Get the node's state from storage when it is first started.
    ///
    /// If no state exists because the node has never come online before,
    /// `InitialState::new_initial` should be used.
    async fn get_initial_state(&self) -> Result<InitialState>;

    /// Save the node's hard state.
    async fn save_hard_state(&self, hs: &HardState) -> Result<()>;

    // --- log view ---------------------------------------------------------------------------

    /// Get the lowest index still retained in the log.
    async fn first_log_index(&self) -> Result<u64>;

    /// Get a series of log entries from storage, inclusive of `start`, exclusive of `stop`.
    ///
    /// Entries which have been compacted away are simply absent from the result.
    async fn get_log_entries(&self, start: u64, stop: u64) -> Result<Vec<Entry<D>>>;

    /// Get a single log entry, if it is still present in the log.
    async fn try_get_log_entry(&self, index: u64) -> Result<Option<Entry<D>>>;

    /// Append a contiguous payload of entries to the log.
    ///
    /// The first entry's index must be at most `last_index + 1`; entries overwriting an
    /// existing suffix will already have been preceded by a truncation.
    async fn append_to_log(&self, entries: &[Entry<D>]) -> Result<()>;

    /// Delete all log entries with an index greater than `index`.
    async fn truncate_log_after(&self, index: u64) -> Result<()>;

    /// Persist the committed-index cursor.
    async fn save_committed_index(&self, index: u64) -> Result<()>;

    /// Persist the last-applied cursor.
    async fn save_applied_index(&self, index: u64) -> Result<()>;

    // --- configuration history --------------------------------------------------------------

    /// Get the configuration defined by the highest-indexed configuration entry.
    async fn last_config(&self) -> Result<ActiveMembership>;

    /// Get the configuration in effect at the given log index.
    async fn config_at(&self, index: u64) -> Result<MembershipConfig>;

    /// Record a configuration at the given log index.
    async fn push_config(&self, index: u64, membership: &MembershipConfig) -> Result<()>;

    /// Roll back the configuration history past the given log index.
    ///
    /// Called in lockstep with `truncate_log_after` whenever a truncation may cover a
    /// configuration entry.
    async fn truncate_configs_after(&self, index: u64) -> Result<()>;

    // --- user state machine -----------------------------------------------------------------

    /// Apply the given committed entry to the user state machine, returning its response data.
    ///
    /// The protocol guarantees that entries are applied in index order and that only committed
    /// entries reach this method.
    async fn apply_to_state_machine(&self, index: u64, data: &D) -> Result<R>;

    // --- snapshot store ---------------------------------------------------------------------

    /// Build a new snapshot of the state machine and compact the log prefix it covers.
    ///
    /// The snapshot must cover the log exactly up to the last-applied cursor; entries at or
    /// below that index may be deleted from the log once the snapshot is durable.
    async fn build_snapshot(&self) -> Result<Snapshot>;

    /// Get a handle to the current snapshot, if one exists.
    async fn current_snapshot(&self) -> Result<Option<Snapshot>>;

    /// Read up to `len` bytes of the identified snapshot blob, starting at `offset`.
    async fn read_snapshot_chunk(&self, id: &str, offset: u64, len: u64) -> Result<Vec<u8>>;

    /// Begin receiving a snapshot streamed from the cluster leader.
    ///
    /// Any partially received snapshot with a different ID is discarded.
    async fn begin_snapshot_install(&self, id: &str) -> Result<()>;

    /// Write a chunk of a snapshot being received from the cluster leader.
    ///
    /// Chunks arrive in order; a chunk may be rewritten at an offset already received when the
    /// leader retries after a lost response.
    async fn write_snapshot_chunk(&self, id: &str, offset: u64, data: &[u8]) -> Result<()>;

    /// Finalize the installation of a snapshot which has finished streaming.
    ///
    /// Implementations must restore the user state machine from the received blob, delete all
    /// log entries up through `meta.last_log_id.index`, record `meta.membership` at that index
    /// in the configuration history, and advance the durable committed/applied cursors to
    /// `meta.last_log_id.index`.
    async fn finalize_snapshot_install(&self, meta: &SnapshotMeta) -> Result<()>;
}
