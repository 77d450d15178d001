//! Public Raft interface and data types.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::core::RaftCore;
use crate::error::{ClientError, RaftError, RaftResult};
use crate::metrics::{RaftMetrics, Wait};
use crate::notify::Notification;
use crate::storage::SnapshotMeta;
use crate::{AppData, AppDataResponse, LogId, NodeId, RaftNetwork, RaftStorage};

struct RaftInner<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> {
    tx_api: mpsc::UnboundedSender<RaftMsg<D, R>>,
    rx_metrics: watch::Receiver<RaftMetrics>,
    rx_notify: Mutex<Option<mpsc::UnboundedReceiver<Notification>>>,
    raft_handle: Mutex<Option<JoinHandle<RaftResult<()>>>>,
    tx_shutdown: Mutex<Option<oneshot::Sender<()>>>,
    marker_n: std::marker::PhantomData<N>,
    marker_s: std::marker::PhantomData<S>,
}

/// The Raft API.
///
/// This type is the interface to a running Raft node. Applications building on top of Raft will
/// use this to spawn a Raft task and interact with the spawned task.
///
/// For more information on the Raft protocol, see
/// [the specification here](https://raft.github.io/raft.pdf) (**pdf warning**).
///
/// ### clone
/// This type implements `Clone`, and should be cloned liberally. The clone itself is very cheap
/// and helps to facilitate use with async workflows.
///
/// ### shutting down
/// If any of the interfaces returns a `RaftError::ShuttingDown`, this indicates that the Raft
/// node is shutting down (potentially for data safety reasons due to a storage error), and the
/// `shutdown` method should be called on this type to await the shutdown of the node. If the
/// parent application needs to shutdown the Raft node for any reason, calling `shutdown` will
/// do the trick.
pub struct Raft<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> {
    inner: Arc<RaftInner<D, R, N, S>>,
}

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> Raft<D, R, N, S> {
    /// Create and spawn a new Raft task.
    ///
    /// ### `id`
    /// The ID which the spawned Raft task will use to identify itself within the cluster.
    /// Applications must guarantee that the ID provided to this function is stable, and should
    /// be persisted in a well known location, probably alongside the Raft log and the
    /// application's state machine.
    ///
    /// ### `config`
    /// Raft's runtime config. See the docs on the `Config` object for more details.
    ///
    /// ### `network`
    /// An implementation of the `RaftNetwork` trait which will be used by Raft for sending RPCs
    /// to peer nodes within the cluster.
    ///
    /// ### `storage`
    /// An implementation of the `RaftStorage` trait which will be used by Raft for data storage.
    ///
    /// This function returns as soon as the node's task has been spawned; it performs no
    /// blocking work itself.
    #[tracing::instrument(level="debug", skip(config, network, storage), fields(cluster=%config.cluster_name))]
    pub fn new(id: NodeId, config: Arc<Config>, network: Arc<N>, storage: Arc<S>) -> Self {
        let (tx_api, rx_api) = mpsc::unbounded_channel();
        let (tx_metrics, rx_metrics) = watch::channel(RaftMetrics::new_initial(id));
        let (tx_shutdown, rx_shutdown) = oneshot::channel();
        let (notifier, rx_notify) = crate::notify::Notifier::new();
        let raft_handle = RaftCore::spawn(id, config, network, storage, rx_api, tx_metrics, notifier, rx_shutdown);
        let inner = RaftInner {
            tx_api,
            rx_metrics,
            rx_notify: Mutex::new(Some(rx_notify)),
            raft_handle: Mutex::new(Some(raft_handle)),
            tx_shutdown: Mutex::new(Some(tx_shutdown)),
            marker_n: std::marker::PhantomData,
            marker_s: std::marker::PhantomData,
        };
        Self { inner: Arc::new(inner) }
    }

    /// Submit an AppendEntries RPC to this Raft node.
    ///
    /// These RPCs are sent by the cluster leader to replicate log entries (§5.3), and are also
    /// used as heartbeats (§5.2).
    #[tracing::instrument(level="debug", skip(self, rpc), fields(term=rpc.term, leader_id=rpc.leader_id))]
    pub async fn append_entries(&self, rpc: AppendEntriesRequest<D>) -> Result<AppendEntriesResponse, RaftError> {
        let (tx, rx) = oneshot::channel();
        self.call_core(RaftMsg::AppendEntries { rpc, tx }, rx).await
    }

    /// Submit a VoteRequest (RequestVote in the spec) RPC to this Raft node.
    ///
    /// These RPCs are sent by cluster peers which are in candidate state attempting to gather
    /// votes (§5.2).
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn vote(&self, rpc: VoteRequest) -> Result<VoteResponse, RaftError> {
        let (tx, rx) = oneshot::channel();
        self.call_core(RaftMsg::RequestVote { rpc, tx }, rx).await
    }

    /// Submit an InstallSnapshot RPC to this Raft node.
    ///
    /// These RPCs are sent by the cluster leader in order to bring a new node or a slow node
    /// up-to-speed with the leader (§7).
    #[tracing::instrument(level="debug", skip(self, rpc), fields(snapshot_id=%rpc.meta.id, offset=rpc.offset))]
    pub async fn install_snapshot(&self, rpc: InstallSnapshotRequest) -> Result<InstallSnapshotResponse, RaftError> {
        let (tx, rx) = oneshot::channel();
        self.call_core(RaftMsg::InstallSnapshot { rpc, tx }, rx).await
    }

    /// Get the ID of the current leader from this Raft node.
    ///
    /// This method is based on the node's metrics, which do a good job of staying up-to-date;
    /// however, the `client_read` method must still be used to guard against stale reads. This
    /// method is perfect for making decisions on where to route client requests.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn current_leader(&self) -> Option<NodeId> {
        self.metrics().borrow().current_leader
    }

    /// Check to ensure this node is still the cluster leader, in order to guard against stale
    /// reads (§8).
    ///
    /// The actual read operation itself is up to the application; this method confirms
    /// leadership with a heartbeat round so that the read will not be stale.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn client_read(&self) -> Result<(), ClientError> {
        let (tx, rx) = oneshot::channel();
        self.call_core(RaftMsg::ClientRead { tx }, rx).await
    }

    /// Submit a mutating client request to Raft to update the state of the system (§5.1).
    ///
    /// It will be appended to the log, committed to the cluster, and then applied to the
    /// application state machine. The result of applying the request to the state machine will
    /// be returned as the response from this method.
    ///
    /// If the node is not the leader, the request resolves with `LeaderRedirect` when a leader
    /// is known and `LeaderUnknown` otherwise; a freshly elected leader which has not yet
    /// committed its own no-op entry rejects with `LeaderUnsync`.
    #[tracing::instrument(level = "debug", skip(self, rpc))]
    pub async fn client_write(&self, rpc: ClientWriteRequest<D>) -> Result<ClientWriteResponse<R>, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.call_core(RaftMsg::ClientWrite { rpc, tx }, rx).await
    }

    /// Append a barrier entry to the log, resolving once it has committed.
    ///
    /// A barrier touches no application state, but its commitment fences everything appended
    /// before it; this is useful for read-your-writes schemes.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn client_barrier(&self) -> Result<LogId, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.call_core(RaftMsg::ClientBarrier { tx }, rx).await
    }

    /// Get the active membership configuration of the cluster as this node knows it.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn get_config(&self) -> Result<MembershipConfig, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.call_core(RaftMsg::GetConfig { tx }, rx).await
    }

    /// Propose a cluster configuration change.
    ///
    /// The change is driven through joint consensus: a joint configuration carrying both the
    /// old and the new member sets is committed first, followed by the final uniform
    /// configuration. The future resolves with the final configuration once it has committed
    /// and the replicators of removed peers have been torn down.
    ///
    /// While a change is in flight, further proposals are rejected with `InMemberChange`.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn change_config(&self, members: BTreeSet<NodeId>) -> Result<MembershipConfig, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.call_core(RaftMsg::ChangeConfig { members, tx }, rx).await
    }

    /// Invoke RaftCore by sending a RaftMsg and blocking on the response.
    #[tracing::instrument(level = "debug", skip(self, mes, rx))]
    pub(crate) async fn call_core<T, E>(&self, mes: RaftMsg<D, R>, rx: RaftRespRx<T, E>) -> Result<T, E>
    where E: From<RaftError> {
        if self.inner.tx_api.send(mes).is_err() {
            return Err(RaftError::ShuttingDown.into());
        }
        match rx.await {
            Ok(res) => res,
            // The channel was dropped without a response, which only happens on shutdown.
            Err(_) => Err(RaftError::ShuttingDown.into()),
        }
    }

    /// Get a handle to the metrics channel.
    pub fn metrics(&self) -> watch::Receiver<RaftMetrics> {
        self.inner.rx_metrics.clone()
    }

    /// Get a handle to wait for the metrics to satisfy some condition.
    ///
    /// If `timeout` is none, a default of 500 milliseconds is used.
    ///
    /// ```ignore
    /// // wait for raft log-3 to be received and applied:
    /// r.wait(None).applied(3, "log applied").await?;
    ///
    /// // wait for raft state to become a follower
    /// r.wait(None).state(State::Follower, "follower").await?;
    /// ```
    pub fn wait(&self, timeout: Option<Duration>) -> Wait {
        Wait {
            timeout: timeout.unwrap_or_else(|| Duration::from_millis(500)),
            rx: self.inner.rx_metrics.clone(),
        }
    }

    /// Take the node's notification stream.
    ///
    /// The stream is lossless and carries notifications in the causal order of the events that
    /// produced them. There is a single stream per node; the second call returns `None`.
    pub async fn notifications(&self) -> Option<mpsc::UnboundedReceiver<Notification>> {
        self.inner.rx_notify.lock().await.take()
    }

    /// Shutdown this Raft node.
    ///
    /// The node's replicators are terminated, outstanding RPCs are cancelled and pending client
    /// requests are drained before this future resolves.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        if let Some(tx) = self.inner.tx_shutdown.lock().await.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.inner.raft_handle.lock().await.take() {
            let _ = handle.await?;
        }
        Ok(())
    }
}

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> Clone for Raft<D, R, N, S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

pub(crate) type RaftRespTx<T, E> = oneshot::Sender<Result<T, E>>;
pub(crate) type RaftRespRx<T, E> = oneshot::Receiver<Result<T, E>>;

pub(crate) type ClientWriteResponseTx<R> = RaftRespTx<ClientWriteResponse<R>, ClientError>;
pub(crate) type ClientReadResponseTx = RaftRespTx<(), ClientError>;
pub(crate) type BarrierResponseTx = RaftRespTx<LogId, ClientError>;
pub(crate) type ChangeConfigResponseTx = RaftRespTx<MembershipConfig, ClientError>;

/// A message coming from the Raft API.
pub(crate) enum RaftMsg<D: AppData, R: AppDataResponse> {
    AppendEntries {
        rpc: AppendEntriesRequest<D>,
        tx: RaftRespTx<AppendEntriesResponse, RaftError>,
    },
    RequestVote {
        rpc: VoteRequest,
        tx: RaftRespTx<VoteResponse, RaftError>,
    },
    InstallSnapshot {
        rpc: InstallSnapshotRequest,
        tx: RaftRespTx<InstallSnapshotResponse, RaftError>,
    },
    ClientWrite {
        rpc: ClientWriteRequest<D>,
        tx: ClientWriteResponseTx<R>,
    },
    ClientRead {
        tx: ClientReadResponseTx,
    },
    ClientBarrier {
        tx: BarrierResponseTx,
    },
    GetConfig {
        tx: RaftRespTx<MembershipConfig, ClientError>,
    },
    ChangeConfig {
        members: BTreeSet<NodeId>,
        tx: ChangeConfigResponseTx,
    },
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// An RPC sent by a cluster leader to replicate log entries (§5.3), and as a heartbeat (§5.2).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendEntriesRequest<D: AppData> {
    /// The leader's current term.
    pub term: u64,

    /// The leader's ID. Useful in redirecting clients.
    pub leader_id: NodeId,

    /// The id of the log entry immediately preceding `entries`.
    pub prev_log_id: LogId,

    /// The new log entries to store.
    ///
    /// This may be empty when the leader is sending heartbeats. Entries
    /// are batched for efficiency.
    #[serde(bound = "D: AppData")]
    pub entries: Vec<Entry<D>>,

    /// The leader's commit index.
    pub leader_commit: u64,
}

/// The response to an `AppendEntriesRequest`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    /// The responding node's current term, for the leader to update itself.
    pub term: u64,
    /// Will be true if the follower contained an entry matching `prev_log_id`.
    pub success: bool,
    /// The responder's last log index.
    ///
    /// On rejection the leader uses this to back-step its next-index for the responder
    /// without probing one index at a time.
    pub last_log_index: u64,
}

/// A Raft log entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry<D: AppData> {
    pub log_id: LogId,

    /// This entry's payload.
    #[serde(bound = "D: AppData")]
    pub payload: EntryPayload<D>,
}

/// Log entry payload variants.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum EntryPayload<D: AppData> {
    /// An empty payload committed by a new cluster leader.
    Blank,
    /// A normal log entry carrying an application command.
    #[serde(bound = "D: AppData")]
    Normal(EntryNormal<D>),
    /// A config change log entry carrying the resulting membership.
    ConfigChange(EntryConfigChange),
    /// A fence entry which commits without touching the state machine.
    Barrier,
}

/// A normal log entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntryNormal<D: AppData> {
    /// The contents of this entry.
    #[serde(bound = "D: AppData")]
    pub data: D,
}

/// A log entry holding a config change.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryConfigChange {
    /// Details on the cluster's membership configuration.
    pub membership: MembershipConfig,
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// The membership configuration of the cluster.
#[derive(Clone, Default, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipConfig {
    /// All members of the Raft cluster.
    pub members: BTreeSet<NodeId>,
    /// All members of the Raft cluster after joint consensus is finalized.
    ///
    /// The presence of a value here indicates that the config is in joint consensus, and that
    /// a quorum requires a majority of both sets.
    pub members_after_consensus: Option<BTreeSet<NodeId>>,
}

impl MembershipConfig {
    /// Get the set of all nodes in the current config.
    ///
    /// When in joint consensus, this is the union of both config groups.
    pub fn all_nodes(&self) -> BTreeSet<NodeId> {
        let mut all = self.members.clone();
        if let Some(members) = &self.members_after_consensus {
            all.extend(members);
        }
        all
    }

    /// Check if the given NodeId exists in this membership config.
    ///
    /// When in joint consensus, this will check both config groups.
    pub fn contains(&self, x: &NodeId) -> bool {
        self.members.contains(x)
            || self
                .members_after_consensus
                .as_ref()
                .map(|m| m.contains(x))
                .unwrap_or(false)
    }

    /// Check to see if the config is currently in joint consensus.
    pub fn is_in_joint_consensus(&self) -> bool {
        self.members_after_consensus.is_some()
    }

    /// Create a new initial config containing only the given node ID.
    pub fn new_initial(id: NodeId) -> Self {
        let mut members = BTreeSet::new();
        members.insert(id);
        Self {
            members,
            members_after_consensus: None,
        }
    }

    /// The uniform configuration this config resolves to once joint consensus is finalized.
    pub fn to_final_config(&self) -> Self {
        match self.members_after_consensus {
            None => self.clone(),
            Some(ref m) => MembershipConfig {
                members: m.clone(),
                members_after_consensus: None,
            },
        }
    }
}

/// The currently active membership config along with the log id at which it was defined.
///
/// The active configuration is the one defined by the highest-indexed configuration entry in
/// the log, whether or not that entry has committed.
#[derive(Clone, Default, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveMembership {
    /// The id of the log entry which defined this membership config.
    pub log_id: LogId,
    /// The membership config itself.
    pub membership: MembershipConfig,
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// An RPC sent by candidates to gather votes (§5.2).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VoteRequest {
    /// The candidate's current term.
    pub term: u64,
    /// The candidate's ID.
    pub candidate_id: NodeId,
    /// The id of the candidate's last log entry.
    pub last_log_id: LogId,
}

impl VoteRequest {
    /// Create a new instance.
    pub fn new(term: u64, candidate_id: NodeId, last_log_id: LogId) -> Self {
        Self {
            term,
            candidate_id,
            last_log_id,
        }
    }
}

/// The response to a `VoteRequest`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteResponse {
    /// The current term of the responding node, for the candidate to update itself.
    pub term: u64,
    /// Will be true if the candidate received a vote from the responder.
    pub vote_granted: bool,
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// An RPC sent by the Raft leader to send chunks of a snapshot to a follower (§7).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    /// The leader's current term.
    pub term: u64,
    /// The leader's ID. Useful in redirecting clients.
    pub leader_id: NodeId,

    /// Metadata of the snapshot being transmitted.
    pub meta: SnapshotMeta,

    /// The byte offset where this chunk of data is positioned in the snapshot blob.
    pub offset: u64,
    /// The raw bytes of the snapshot chunk, starting at `offset`.
    pub data: Vec<u8>,

    /// Will be `true` if this is the last chunk in the snapshot.
    pub done: bool,
}

/// The response to an `InstallSnapshotRequest`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    /// The receiving node's current term, for the leader to update itself.
    pub term: u64,
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// An application specific client request to update the state of the system (§5.1).
///
/// The entry of this payload will be appended to the Raft log and then applied to the Raft
/// state machine according to the Raft protocol.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientWriteRequest<D: AppData> {
    /// The application specific contents of this client request.
    #[serde(bound = "D: AppData")]
    pub(crate) entry: EntryPayload<D>,
}

impl<D: AppData> ClientWriteRequest<D> {
    /// Create a new client payload instance with a normal entry type.
    pub fn new(entry: D) -> Self {
        Self {
            entry: EntryPayload::Normal(EntryNormal { data: entry }),
        }
    }
}

/// The response to a `ClientWriteRequest`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientWriteResponse<R: AppDataResponse> {
    /// The id assigned to the request's log entry.
    pub log_id: LogId,

    /// Application specific response data, produced by applying the entry to the state machine.
    #[serde(bound = "R: AppDataResponse")]
    pub data: R,
}
