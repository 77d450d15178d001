//! The core logic of a Raft node.

mod admin;
mod append_entries;
mod client;
mod install_snapshot;
pub(crate) mod replication;
mod vote;

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::anyhow;
use futures::future::{AbortHandle, Abortable};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep_until, Duration, Instant};
use tracing_futures::Instrument;

use crate::config::{Config, SnapshotPolicy};
use crate::core::client::{ClientRequestEntry, ResponseSink};
use crate::error::{RaftError, RaftResult};
use crate::metrics::RaftMetrics;
use crate::notify::{Notification, Notifier};
use crate::quorum;
use crate::raft::{ActiveMembership, EntryPayload, RaftMsg, VoteRequest};
use crate::replication::{PeerDirective, PeerEvent, PeerHandle, PeerReplicator};
use crate::storage::HardState;
use crate::{AppData, AppDataResponse, ClientError, LogId, NodeId, RaftNetwork, RaftStorage};

/// The core type implementing the Raft protocol.
///
/// The core runs as a single task consuming two queues: the api queue carrying requests from
/// the `Raft` handle (each bearing a one-shot response sink), and the peer queue carrying
/// events raised by the per-peer replicators. All state mutation happens inside the handlers
/// of the active state's run loop.
pub(crate) struct RaftCore<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> {
    /// This node's ID.
    id: NodeId,
    /// This node's runtime config.
    config: Arc<Config>,
    /// The cluster's current membership configuration.
    membership: ActiveMembership,
    /// The `RaftNetwork` implementation.
    network: Arc<N>,
    /// The `RaftStorage` implementation.
    storage: Arc<S>,

    /// The target state of the system.
    target_state: State,
    /// The leader sub-state, present only while this node is the leader.
    leader_phase: Option<LeaderPhase>,

    /// The index of the highest log entry known to be committed cluster-wide.
    ///
    /// Restored from the durable committed-index cell at boot and non-decreasing afterwards.
    commit_index: u64,
    /// The index of the highest log entry which has been applied to the local state machine.
    last_applied: u64,
    /// The current term.
    ///
    /// Advances only forward. When a higher term is observed in any message, the node adopts
    /// it, clears its vote and becomes a follower.
    current_term: u64,
    /// The ID of the current leader of the Raft cluster, if known.
    current_leader: Option<NodeId>,
    /// The ID of the candidate which received this node's vote for the current term.
    voted_for: Option<NodeId>,

    /// The id of the last entry appended to the log.
    last_log_id: LogId,

    /// The node's current snapshot state.
    snapshot_state: Option<SnapshotState>,
    /// The index of the last snapshot taken on this node, if a snapshot exists.
    snapshot_index: u64,

    /// The replicator of every known remote peer, keyed by node ID.
    ///
    /// Replicators live across role changes: they are created at boot and on membership
    /// additions, deactivated whenever this node is not the leader, and destroyed when the
    /// removal of their peer commits or the node shuts down.
    peers: BTreeMap<NodeId, PeerHandle<D>>,
    /// The clonable sender handed to each replicator for raising peer events.
    tx_peer: mpsc::UnboundedSender<PeerEvent>,
    /// The single consumer of peer events.
    rx_peer: mpsc::UnboundedReceiver<PeerEvent>,

    tx_compaction: mpsc::Sender<SnapshotUpdate>,
    rx_compaction: mpsc::Receiver<SnapshotUpdate>,

    /// The last time a heartbeat was received from a live leader.
    last_heartbeat: Option<Instant>,
    /// The deadline of the next election timeout.
    next_election_timeout: Option<Instant>,

    notifier: Notifier,
    rx_api: mpsc::UnboundedReceiver<RaftMsg<D, R>>,
    tx_metrics: watch::Sender<RaftMetrics>,
    rx_shutdown: oneshot::Receiver<()>,
}

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> RaftCore<D, R, N, S> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn(
        id: NodeId, config: Arc<Config>, network: Arc<N>, storage: Arc<S>,
        rx_api: mpsc::UnboundedReceiver<RaftMsg<D, R>>, tx_metrics: watch::Sender<RaftMetrics>,
        notifier: Notifier, rx_shutdown: oneshot::Receiver<()>,
    ) -> JoinHandle<RaftResult<()>> {
        let (tx_peer, rx_peer) = mpsc::unbounded_channel();
        let (tx_compaction, rx_compaction) = mpsc::channel(1);
        let this = Self {
            id,
            config,
            membership: ActiveMembership::default(),
            network,
            storage,
            target_state: State::Follower,
            leader_phase: None,
            commit_index: 0,
            last_applied: 0,
            current_term: 0,
            current_leader: None,
            voted_for: None,
            last_log_id: LogId::default(),
            snapshot_state: None,
            snapshot_index: 0,
            peers: BTreeMap::new(),
            tx_peer,
            rx_peer,
            tx_compaction,
            rx_compaction,
            last_heartbeat: None,
            next_election_timeout: None,
            notifier,
            rx_api,
            tx_metrics,
            rx_shutdown,
        };
        tokio::spawn(this.main())
    }

    /// The main loop of the Raft protocol.
    #[tracing::instrument(level="trace", skip(self), fields(id=self.id, cluster=%self.config.cluster_name))]
    async fn main(mut self) -> RaftResult<()> {
        tracing::trace!("raft node is initializing");
        match self.storage.get_initial_state().await {
            Ok(state) => {
                self.last_log_id = state.last_log_id;
                self.current_term = state.hard_state.current_term;
                self.voted_for = state.hard_state.voted_for;
                self.commit_index = state.committed_index;
                self.last_applied = state.last_applied;
                // Initialization is not a membership change; set directly and bring up the
                // replicators.
                self.membership = state.membership;
                self.spawn_missing_peers();

                match self.storage.current_snapshot().await {
                    Ok(Some(snapshot)) => self.snapshot_index = snapshot.meta.last_log_id.index,
                    Ok(None) => {}
                    Err(err) => {
                        let _ = self.map_fatal_storage_error(err);
                    }
                }
                // Catch up on entries which committed before the last shutdown but were
                // never applied.
                let _ = self.apply_committed_entries().await;
            }
            // A node which cannot read its own durable state must not participate; it parks
            // itself in the terminal persist-error state below.
            Err(err) => {
                let _ = self.map_fatal_storage_error(err);
            }
        }

        // This is the central loop of the system. The Raft core assumes a few different roles
        // based on cluster state. It delegates control to the different state loops and simply
        // awaits the delegated loop to return, which will only take place on a state change or
        // a fatal error.
        loop {
            let res = match self.target_state {
                State::Leader => LeaderState::new(&mut self).run().await,
                State::Candidate => CandidateState::new(&mut self).run().await,
                State::Follower => FollowerState::new(&mut self).run().await,
                State::PersistError => PersistErrorState::new(&mut self).run().await,
                State::Shutdown => {
                    tracing::info!("node has shutdown");
                    self.shutdown_peers().await;
                    return Ok(());
                }
            };
            // Fatal errors have already parked the node in the persist-error state; the next
            // iteration dispatches accordingly.
            if let Err(err) = res {
                tracing::error!(error=%err, "error in state loop");
            }
        }
    }

    /// Report a metrics payload on the current state of the Raft node.
    #[tracing::instrument(level = "trace", skip(self))]
    fn report_metrics(&mut self) {
        let res = self.tx_metrics.send(RaftMetrics {
            id: self.id,
            state: self.target_state,
            leader_phase: self.leader_phase,
            current_term: self.current_term,
            last_log_index: self.last_log_id.index,
            last_applied: self.last_applied,
            current_leader: self.current_leader,
            membership_config: self.membership.membership.clone(),
        });
        if let Err(err) = res {
            tracing::error!(error=%err, id=self.id, "error reporting metrics");
        }
    }

    /// Save the Raft node's current hard state to disk.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn save_hard_state(&mut self) -> RaftResult<()> {
        let hs = HardState {
            current_term: self.current_term,
            voted_for: self.voted_for,
        };
        self.storage.save_hard_state(&hs).await.map_err(|err| self.map_fatal_storage_error(err))
    }

    /// Update the core's target state, publishing the transition.
    #[tracing::instrument(level = "trace", skip(self))]
    fn set_target_state(&mut self, target_state: State) {
        if target_state == self.target_state {
            return;
        }
        let old = self.target_state;
        self.target_state = target_state;
        if !target_state.is_leader() {
            self.leader_phase = None;
        }
        self.notifier.notify(Notification::StateChange { old, new: target_state });
    }

    /// Get the next election timeout, generating a new value if not set.
    #[tracing::instrument(level = "trace", skip(self))]
    fn get_next_election_timeout(&mut self) -> Instant {
        match self.next_election_timeout {
            Some(inst) => inst,
            None => {
                let inst = Instant::now() + Duration::from_millis(self.config.new_rand_election_timeout());
                self.next_election_timeout = Some(inst);
                inst
            }
        }
    }

    /// Set a value for the next election timeout.
    ///
    /// If `heartbeat=true`, then also update the value of `last_heartbeat`.
    #[tracing::instrument(level = "trace", skip(self))]
    fn update_next_election_timeout(&mut self, heartbeat: bool) {
        let now = Instant::now();
        self.next_election_timeout = Some(now + Duration::from_millis(self.config.new_rand_election_timeout()));
        if heartbeat {
            self.last_heartbeat = Some(now);
        }
    }

    /// Update the value of the `current_leader` property, publishing any change.
    #[tracing::instrument(level = "trace", skip(self))]
    fn update_current_leader(&mut self, update: UpdateCurrentLeader) {
        let new = match update {
            UpdateCurrentLeader::ThisNode => Some(self.id),
            UpdateCurrentLeader::OtherNode(target) => Some(target),
            UpdateCurrentLeader::Unknown => None,
        };
        if new != self.current_leader {
            self.current_leader = new;
            self.notifier.notify(Notification::LeaderChange { leader: new });
        }
    }

    /// Update the current term, clearing or setting `voted_for` as given.
    ///
    /// Terms only ever move forward; a stale value is ignored.
    #[tracing::instrument(level = "trace", skip(self))]
    fn update_current_term(&mut self, new_term: u64, voted_for: Option<NodeId>) {
        if new_term > self.current_term {
            self.notifier.notify(Notification::TermChange {
                old: self.current_term,
                new: new_term,
            });
            self.current_term = new_term;
            self.voted_for = voted_for;
        }
    }

    /// Transition into the terminal persist-error state due to a non-recoverable error from
    /// the storage layer.
    #[tracing::instrument(level = "trace", skip(self, err))]
    fn map_fatal_storage_error(&mut self, err: anyhow::Error) -> RaftError {
        tracing::error!(error=%err, id=self.id, "fatal storage error, node is halting");
        self.notifier.notify(Notification::PersistError);
        self.set_target_state(State::PersistError);
        RaftError::RaftStorage(err)
    }

    /// The error with which to reject a client request this node cannot serve.
    fn client_reject_error(&self) -> ClientError {
        if self.target_state == State::PersistError {
            return ClientError::PersistError;
        }
        match self.current_leader {
            Some(leader) if leader != self.id => ClientError::LeaderRedirect(leader),
            _ => ClientError::LeaderUnknown,
        }
    }

    /// Update the node's current membership config, spawning replicators for new members.
    ///
    /// Replicators of removed members are pruned immediately on non-leaders; a leader keeps
    /// them alive until the configuration entry removing them has committed (see
    /// `finish_member_change`).
    #[tracing::instrument(level = "trace", skip(self, cfg))]
    fn update_membership(&mut self, cfg: ActiveMembership) {
        if self.membership.membership != cfg.membership {
            self.notifier.notify(Notification::MembershipChange {
                membership: cfg.membership.clone(),
            });
        }
        self.membership = cfg;
        self.spawn_missing_peers();
        if !self.target_state.is_leader() {
            self.prune_stale_peers();
        }
    }

    /// Spawn a replicator for every member of the active config which does not have one.
    fn spawn_missing_peers(&mut self) {
        let all = self.membership.membership.all_nodes();
        for target in all {
            if target == self.id || self.peers.contains_key(&target) {
                continue;
            }
            let handle = PeerReplicator::spawn(
                self.id,
                target,
                self.config.clone(),
                self.network.clone(),
                self.storage.clone(),
                self.tx_peer.clone(),
            );
            self.peers.insert(target, handle);
        }
    }

    /// Terminate the replicator of every peer absent from the active config.
    fn prune_stale_peers(&mut self) {
        let all = self.membership.membership.all_nodes();
        let stale: Vec<NodeId> = self.peers.keys().filter(|id| !all.contains(id)).cloned().collect();
        for target in stale {
            tracing::debug!(target, "removing replicator of departed peer");
            if let Some(peer) = self.peers.remove(&target) {
                let _ = peer.repl_tx.send(PeerDirective::Terminate);
            }
        }
    }

    /// Send the given directive to every peer replicator.
    fn broadcast_peer_directive(&self, directive: PeerDirective<D>) {
        for peer in self.peers.values() {
            let _ = peer.repl_tx.send(directive.clone());
        }
    }

    /// Terminate all peer replicators and wait for their tasks to finish.
    async fn shutdown_peers(&mut self) {
        let mut handles = Vec::new();
        for (_, peer) in std::mem::take(&mut self.peers) {
            let _ = peer.repl_tx.send(PeerDirective::Terminate);
            handles.push(peer.handle);
        }
        let _ = futures::future::join_all(handles).await;
    }

    /// Apply all committed-but-unapplied entries to the state machine, in index order.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn apply_committed_entries(&mut self) -> RaftResult<()> {
        let stop = std::cmp::min(self.commit_index, self.last_log_id.index);
        if self.last_applied >= stop {
            return Ok(());
        }
        let entries = self
            .storage
            .get_log_entries(self.last_applied + 1, stop + 1)
            .await
            .map_err(|err| self.map_fatal_storage_error(err))?;
        for entry in entries {
            if let EntryPayload::Normal(inner) = &entry.payload {
                self.storage
                    .apply_to_state_machine(entry.log_id.index, &inner.data)
                    .await
                    .map_err(|err| self.map_fatal_storage_error(err))?;
            }
            self.last_applied = entry.log_id.index;
            self.notifier.notify(Notification::Apply {
                term: entry.log_id.term,
                index: entry.log_id.index,
            });
        }
        self.storage
            .save_applied_index(self.last_applied)
            .await
            .map_err(|err| self.map_fatal_storage_error(err))?;
        self.report_metrics();
        self.trigger_log_compaction_if_needed(false);
        Ok(())
    }

    /// Update the system's snapshot state based on the given data.
    #[tracing::instrument(level = "trace", skip(self))]
    fn update_snapshot_state(&mut self, update: SnapshotUpdate) {
        if let SnapshotUpdate::SnapshotComplete(index) = update {
            self.snapshot_index = index;
        }
        // A completed or failed compaction clears the building state; an inbound streaming
        // install is preserved.
        if let Some(state @ SnapshotState::Streaming { .. }) = self.snapshot_state.take() {
            self.snapshot_state = Some(state);
        }
    }

    /// Trigger a log compaction (snapshot) job if needed.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(self) fn trigger_log_compaction_if_needed(&mut self, force: bool) {
        if self.snapshot_state.is_some() {
            return;
        }
        let SnapshotPolicy::LogsSinceLast(threshold) = &self.config.snapshot_policy;
        if self.last_applied == 0 || self.last_applied < self.snapshot_index {
            return;
        }
        if !force && self.last_applied - self.snapshot_index < *threshold {
            return;
        }

        // At this point, we are clear to begin a new compaction process.
        let storage = self.storage.clone();
        let (handle, reg) = AbortHandle::new_pair();
        let (chan_tx, _) = broadcast::channel(1);
        let tx_compaction = self.tx_compaction.clone();
        self.snapshot_state = Some(SnapshotState::Building {
            handle,
            sender: chan_tx.clone(),
        });
        tokio::spawn(
            async move {
                match Abortable::new(storage.build_snapshot(), reg).await {
                    Ok(Ok(snapshot)) => {
                        let index = snapshot.meta.last_log_id.index;
                        let _ = tx_compaction.try_send(SnapshotUpdate::SnapshotComplete(index));
                        let _ = chan_tx.send(index);
                    }
                    Ok(Err(err)) => {
                        tracing::error!(error=%err, "error while generating snapshot");
                        let _ = tx_compaction.try_send(SnapshotUpdate::SnapshotFailed);
                    }
                    Err(_aborted) => {
                        let _ = tx_compaction.try_send(SnapshotUpdate::SnapshotFailed);
                    }
                }
            }
            .instrument(tracing::debug_span!("log-compaction")),
        );
    }

    /// Handle a peer event arriving while this node is not the leader.
    ///
    /// Replication progress and vote results are stale leftovers of a previous role; only
    /// term information and replicator failures are of interest here.
    #[tracing::instrument(level = "trace", skip(self, event))]
    async fn handle_peer_event_passive(&mut self, event: PeerEvent) -> RaftResult<()> {
        match event {
            PeerEvent::RevertToFollower { target: _, term } => {
                if term > self.current_term {
                    self.update_current_term(term, None);
                    self.update_current_leader(UpdateCurrentLeader::Unknown);
                    self.set_target_state(State::Follower);
                    self.save_hard_state().await?;
                    self.report_metrics();
                }
            }
            PeerEvent::PersistError { target } => {
                let _ = self.map_fatal_storage_error(anyhow!("replicator for peer {} hit a storage failure", target));
            }
            PeerEvent::NeedsSnapshot { target, .. } => {
                // Dropping the response channel tells the replicator to back off and retry;
                // it will be deactivated shortly since this node is not leading.
                tracing::trace!(target, "dropping snapshot request outside of leader state");
            }
            PeerEvent::VoteResult { target, .. } => {
                tracing::trace!(target, "ignoring stale vote result");
            }
            PeerEvent::UpdateMatched { target, .. } | PeerEvent::ReplicationFailed { target } => {
                tracing::trace!(target, "ignoring stale replication event");
            }
        }
        Ok(())
    }

    /// Respond to a get-config request; the active configuration is known in every state.
    fn respond_get_config(&self, tx: crate::raft::RaftRespTx<crate::raft::MembershipConfig, ClientError>) {
        let _ = tx.send(Ok(self.membership.membership.clone()));
    }
}

/// An enum describing the way the current leader property is to be updated.
#[derive(Debug)]
pub(self) enum UpdateCurrentLeader {
    Unknown,
    OtherNode(NodeId),
    ThisNode,
}

/// The current snapshot state of the Raft node.
pub(self) enum SnapshotState {
    /// The node is building a new snapshot of its own state machine.
    Building {
        /// A handle to abort the compaction process early if needed.
        handle: AbortHandle,
        /// A sender for notifying any waiting tasks of the completion of this compaction.
        sender: broadcast::Sender<u64>,
    },
    /// The node is streaming in a snapshot from the leader.
    Streaming {
        /// The offset up to which the incoming snapshot has been received.
        offset: u64,
        /// The ID of the snapshot being received.
        id: String,
    },
}

/// An update on a snapshot creation process.
#[derive(Debug)]
pub(self) enum SnapshotUpdate {
    /// Snapshot creation has finished successfully and covers the given index.
    SnapshotComplete(u64),
    /// Snapshot creation failed.
    SnapshotFailed,
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// All possible states of a Raft node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum State {
    /// The node is replicating logs from the leader.
    Follower,
    /// The node is campaigning to become the cluster leader.
    Candidate,
    /// The node is the Raft cluster leader.
    Leader,
    /// The node hit a fatal storage error and is parked until externally restarted.
    PersistError,
    /// The node is shutting down.
    Shutdown,
}

impl State {
    /// Check if currently in follower state.
    pub fn is_follower(&self) -> bool {
        matches!(self, Self::Follower)
    }

    /// Check if currently in candidate state.
    pub fn is_candidate(&self) -> bool {
        matches!(self, Self::Candidate)
    }

    /// Check if currently in leader state.
    pub fn is_leader(&self) -> bool {
        matches!(self, Self::Leader)
    }
}

/// The sub-state of a leader.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeaderPhase {
    /// The leader has not yet committed the blank entry of its own term; linearizable
    /// operations are deferred.
    Unsync,
    /// The leader has committed an entry in its own term and serves client traffic.
    Sync,
    /// A two-phase membership change is in flight.
    MemberChange,
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to the Raft leader.
pub(self) struct LeaderState<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> {
    pub(super) core: &'a mut RaftCore<D, R, N, S>,
    /// The leader's view of each replicator's match index, used for commit recomputation.
    ///
    /// The replicators own the authoritative next/match indexes; this map mirrors their
    /// `UpdateMatched` reports.
    pub(super) matched: BTreeMap<NodeId, LogId>,
    /// A buffer of client requests which have been appended locally and are awaiting
    /// commitment, in log-index order.
    pub(super) awaiting_committed: Vec<ClientRequestEntry<D, R>>,
    /// The index of the blank entry appended when this node came to power.
    pub(super) noop_index: u64,
    /// The in-flight membership change, if any.
    pub(super) member_change: Option<admin::MemberChangeState>,
}

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> LeaderState<'a, D, R, N, S> {
    /// Create a new instance.
    pub(self) fn new(core: &'a mut RaftCore<D, R, N, S>) -> Self {
        Self {
            core,
            matched: BTreeMap::new(),
            awaiting_committed: Vec::new(),
            noop_index: 0,
            member_change: None,
        }
    }

    /// Transition to the Raft leader state.
    #[tracing::instrument(level="trace", skip(self), fields(id=self.core.id, raft_state="leader"))]
    pub(self) async fn run(mut self) -> RaftResult<()> {
        self.core.leader_phase = Some(LeaderPhase::Unsync);
        self.core.last_heartbeat = None;
        self.core.next_election_timeout = None;
        self.core.update_current_leader(UpdateCurrentLeader::ThisNode);
        // Move every replicator out of its deactivated state.
        self.core.broadcast_peer_directive(PeerDirective::Activate {
            term: self.core.current_term,
            last_log: self.core.last_log_id,
            commit_index: self.core.commit_index,
        });
        self.core.report_metrics();

        let res = self.leader_loop().await;

        // Counterpart of the activation broadcast above: no RPCs leave a non-leader.
        self.core.broadcast_peer_directive(PeerDirective::Deactivate);
        self.drain_inflight();
        self.core.leader_phase = None;
        res
    }

    async fn leader_loop(&mut self) -> RaftResult<()> {
        // A leader elected in joint consensus must drive the inherited change to completion.
        self.resume_inherited_member_change();

        // Per §8, commit an initial blank entry as part of becoming the cluster leader.
        self.commit_initial_leader_entry().await?;
        self.step_member_change().await?;

        let period = Duration::from_millis(self.core.config.heartbeat_timeout);
        let mut heartbeat = interval_at(Instant::now() + period, period);

        loop {
            if !self.core.target_state.is_leader() {
                return Ok(());
            }
            tokio::select! {
                // The data-path heartbeats are produced by the replicators on their own
                // intervals; this tick only surfaces the leader's cadence to observers.
                _ = heartbeat.tick() => self.core.notifier.notify(Notification::HeartbeatTimeout),
                Some(msg) = self.core.rx_api.recv() => match msg {
                    RaftMsg::AppendEntries{rpc, tx} => {
                        let _ = tx.send(self.core.handle_append_entries_request(rpc).await);
                    }
                    RaftMsg::RequestVote{rpc, tx} => {
                        let _ = tx.send(self.core.handle_vote_request(rpc).await);
                    }
                    RaftMsg::InstallSnapshot{rpc, tx} => {
                        let _ = tx.send(self.core.handle_install_snapshot_request(rpc).await);
                    }
                    RaftMsg::ClientWrite{rpc, tx} => {
                        self.handle_client_write_request(rpc, tx).await;
                    }
                    RaftMsg::ClientRead{tx} => {
                        self.handle_client_read_request(tx).await;
                    }
                    RaftMsg::ClientBarrier{tx} => {
                        self.handle_client_barrier_request(tx).await;
                    }
                    RaftMsg::GetConfig{tx} => {
                        self.core.respond_get_config(tx);
                    }
                    RaftMsg::ChangeConfig{members, tx} => {
                        self.change_membership(members, tx).await;
                    }
                },
                Some(event) = self.core.rx_peer.recv() => self.handle_peer_event(event).await?,
                Some(update) = self.core.rx_compaction.recv() => self.core.update_snapshot_state(update),
                Ok(_) = &mut self.core.rx_shutdown => self.core.set_target_state(State::Shutdown),
            }
        }
    }

    /// Update the leader phase, keeping observers informed.
    pub(super) fn set_phase(&mut self, phase: LeaderPhase) {
        self.core.leader_phase = Some(phase);
        self.core.report_metrics();
    }

    /// Resolve every pending sink on the way out of leadership.
    ///
    /// Each sink resolves exactly once: anything still pending here gets the rejection
    /// matching the node's current knowledge.
    fn drain_inflight(&mut self) {
        for req in self.awaiting_committed.drain(..) {
            let err = self.core.client_reject_error();
            match req.tx {
                ResponseSink::Write(tx) => {
                    let _ = tx.send(Err(err));
                }
                ResponseSink::Barrier(tx) => {
                    let _ = tx.send(Err(err));
                }
                ResponseSink::None => {}
            }
        }
        if let Some(change) = self.member_change.take() {
            if let Some(tx) = change.tx {
                let _ = tx.send(Err(self.core.client_reject_error()));
            }
        }
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to a Raft node in candidate state.
pub(self) struct CandidateState<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> {
    core: &'a mut RaftCore<D, R, N, S>,
    /// The number of votes granted by peers of the old (current) config group.
    pub(super) votes_granted_old: u64,
    /// The number of votes needed from the old (current) config group.
    pub(super) votes_needed_old: u64,
    /// The number of votes granted by peers of the new config group (if in joint consensus).
    pub(super) votes_granted_new: u64,
    /// The number of votes needed from the new config group (if in joint consensus).
    pub(super) votes_needed_new: u64,
}

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> CandidateState<'a, D, R, N, S> {
    pub(self) fn new(core: &'a mut RaftCore<D, R, N, S>) -> Self {
        Self {
            core,
            votes_granted_old: 0,
            votes_needed_old: 0,
            votes_granted_new: 0,
            votes_needed_new: 0,
        }
    }

    /// Check whether the candidate holds a quorum of granted votes, under both config groups
    /// when in joint consensus.
    pub(super) fn has_quorum(&self) -> bool {
        self.votes_granted_old >= self.votes_needed_old
            && (self.votes_needed_new == 0 || self.votes_granted_new >= self.votes_needed_new)
    }

    /// Run the candidate loop.
    #[tracing::instrument(level="trace", skip(self), fields(id=self.core.id, raft_state="candidate"))]
    pub(self) async fn run(mut self) -> RaftResult<()> {
        // Each iteration of the outer loop represents a new term.
        loop {
            if !self.core.target_state.is_candidate() {
                return Ok(());
            }

            // Setup new term.
            self.core.update_next_election_timeout(false);
            self.core.update_current_term(self.core.current_term + 1, Some(self.core.id));
            self.core.update_current_leader(UpdateCurrentLeader::Unknown);
            self.core.save_hard_state().await?;
            self.core.report_metrics();

            // Setup vote tallies for this term. We vote for ourselves per the Raft spec.
            let membership = &self.core.membership.membership;
            self.votes_granted_old = membership.members.contains(&self.core.id) as u64;
            self.votes_needed_old = quorum::majority_of(membership.members.len()) as u64;
            if let Some(new_members) = &membership.members_after_consensus {
                self.votes_granted_new = new_members.contains(&self.core.id) as u64;
                self.votes_needed_new = quorum::majority_of(new_members.len()) as u64;
            } else {
                self.votes_granted_new = 0;
                self.votes_needed_new = 0;
            }

            // Ask each replicator of a voting member to campaign on our behalf.
            let rpc = VoteRequest::new(self.core.current_term, self.core.id, self.core.last_log_id);
            for (target, peer) in self.core.peers.iter() {
                if !self.core.membership.membership.contains(target) {
                    continue;
                }
                let _ = peer.repl_tx.send(PeerDirective::RequestVote { rpc: rpc.clone() });
            }

            // A single-node cluster wins its election on its own vote.
            if self.has_quorum() {
                self.core.set_target_state(State::Leader);
                continue;
            }

            // Inner processing loop for this Raft state.
            loop {
                if !self.core.target_state.is_candidate() {
                    return Ok(());
                }
                let timeout_fut = sleep_until(self.core.get_next_election_timeout());
                tokio::select! {
                    // This election has timed out. Break to the outer loop, which starts a
                    // new term.
                    _ = timeout_fut => {
                        self.core.notifier.notify(Notification::ElectionTimeout);
                        break;
                    }
                    Some(event) = self.core.rx_peer.recv() => self.handle_peer_event(event).await?,
                    Some(msg) = self.core.rx_api.recv() => match msg {
                        RaftMsg::AppendEntries{rpc, tx} => {
                            let _ = tx.send(self.core.handle_append_entries_request(rpc).await);
                        }
                        RaftMsg::RequestVote{rpc, tx} => {
                            let _ = tx.send(self.core.handle_vote_request(rpc).await);
                        }
                        RaftMsg::InstallSnapshot{rpc, tx} => {
                            let _ = tx.send(self.core.handle_install_snapshot_request(rpc).await);
                        }
                        RaftMsg::ClientWrite{tx, ..} => {
                            let _ = tx.send(Err(self.core.client_reject_error()));
                        }
                        RaftMsg::ClientRead{tx} => {
                            let _ = tx.send(Err(self.core.client_reject_error()));
                        }
                        RaftMsg::ClientBarrier{tx} => {
                            let _ = tx.send(Err(self.core.client_reject_error()));
                        }
                        RaftMsg::GetConfig{tx} => {
                            self.core.respond_get_config(tx);
                        }
                        RaftMsg::ChangeConfig{tx, ..} => {
                            let _ = tx.send(Err(self.core.client_reject_error()));
                        }
                    },
                    Some(update) = self.core.rx_compaction.recv() => self.core.update_snapshot_state(update),
                    Ok(_) = &mut self.core.rx_shutdown => self.core.set_target_state(State::Shutdown),
                }
            }
        }
    }

    /// Dispatch a peer event while campaigning.
    async fn handle_peer_event(&mut self, event: PeerEvent) -> RaftResult<()> {
        match event {
            PeerEvent::VoteResult { target, resp } => self.handle_vote_response(resp, target).await,
            other => self.core.handle_peer_event_passive(other).await,
        }
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to a Raft node in follower state.
pub(self) struct FollowerState<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> {
    core: &'a mut RaftCore<D, R, N, S>,
}

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> FollowerState<'a, D, R, N, S> {
    pub(self) fn new(core: &'a mut RaftCore<D, R, N, S>) -> Self {
        Self { core }
    }

    /// Run the follower loop.
    #[tracing::instrument(level="trace", skip(self), fields(id=self.core.id, raft_state="follower"))]
    pub(self) async fn run(self) -> RaftResult<()> {
        self.core.report_metrics();
        loop {
            if !self.core.target_state.is_follower() {
                return Ok(());
            }

            // The deadline is pushed forward as valid heartbeats arrive.
            let election_timeout = sleep_until(self.core.get_next_election_timeout());
            tokio::select! {
                _ = election_timeout => {
                    self.core.notifier.notify(Notification::ElectionTimeout);
                    if self.core.membership.membership.contains(&self.core.id) {
                        self.core.set_target_state(State::Candidate);
                    } else {
                        // A node removed from the cluster stays passive.
                        self.core.next_election_timeout = None;
                    }
                }
                Some(msg) = self.core.rx_api.recv() => match msg {
                    RaftMsg::AppendEntries{rpc, tx} => {
                        let _ = tx.send(self.core.handle_append_entries_request(rpc).await);
                    }
                    RaftMsg::RequestVote{rpc, tx} => {
                        let _ = tx.send(self.core.handle_vote_request(rpc).await);
                    }
                    RaftMsg::InstallSnapshot{rpc, tx} => {
                        let _ = tx.send(self.core.handle_install_snapshot_request(rpc).await);
                    }
                    RaftMsg::ClientWrite{tx, ..} => {
                        let _ = tx.send(Err(self.core.client_reject_error()));
                    }
                    RaftMsg::ClientRead{tx} => {
                        let _ = tx.send(Err(self.core.client_reject_error()));
                    }
                    RaftMsg::ClientBarrier{tx} => {
                        let _ = tx.send(Err(self.core.client_reject_error()));
                    }
                    RaftMsg::GetConfig{tx} => {
                        self.core.respond_get_config(tx);
                    }
                    RaftMsg::ChangeConfig{tx, ..} => {
                        let _ = tx.send(Err(self.core.client_reject_error()));
                    }
                },
                Some(event) = self.core.rx_peer.recv() => self.core.handle_peer_event_passive(event).await?,
                Some(update) = self.core.rx_compaction.recv() => self.core.update_snapshot_state(update),
                Ok(_) = &mut self.core.rx_shutdown => self.core.set_target_state(State::Shutdown),
            }
        }
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// The terminal state entered after a fatal storage error.
///
/// The node keeps answering requests with rejections and re-emits its failure notification
/// periodically; only shutdown leaves this state.
pub(self) struct PersistErrorState<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> {
    core: &'a mut RaftCore<D, R, N, S>,
}

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> PersistErrorState<'a, D, R, N, S> {
    pub(self) fn new(core: &'a mut RaftCore<D, R, N, S>) -> Self {
        Self { core }
    }

    /// Run the persist-error loop.
    #[tracing::instrument(level="trace", skip(self), fields(id=self.core.id, raft_state="persist-error"))]
    pub(self) async fn run(self) -> RaftResult<()> {
        self.core.broadcast_peer_directive(PeerDirective::Deactivate);
        self.core.report_metrics();
        let period = Duration::from_millis(self.core.config.persist_error_notify_timeout);
        let mut renotify = interval_at(Instant::now() + period, period);
        loop {
            if self.core.target_state != State::PersistError {
                return Ok(());
            }
            tokio::select! {
                _ = renotify.tick() => self.core.notifier.notify(Notification::PersistError),
                Some(msg) = self.core.rx_api.recv() => match msg {
                    RaftMsg::AppendEntries{tx, ..} => {
                        let _ = tx.send(Err(RaftError::ShuttingDown));
                    }
                    RaftMsg::RequestVote{tx, ..} => {
                        let _ = tx.send(Err(RaftError::ShuttingDown));
                    }
                    RaftMsg::InstallSnapshot{tx, ..} => {
                        let _ = tx.send(Err(RaftError::ShuttingDown));
                    }
                    RaftMsg::ClientWrite{tx, ..} => {
                        let _ = tx.send(Err(ClientError::PersistError));
                    }
                    RaftMsg::ClientRead{tx} => {
                        let _ = tx.send(Err(ClientError::PersistError));
                    }
                    RaftMsg::ClientBarrier{tx} => {
                        let _ = tx.send(Err(ClientError::PersistError));
                    }
                    RaftMsg::GetConfig{tx} => {
                        let _ = tx.send(Err(ClientError::PersistError));
                    }
                    RaftMsg::ChangeConfig{tx, ..} => {
                        let _ = tx.send(Err(ClientError::PersistError));
                    }
                },
                Some(_) = self.core.rx_peer.recv() => {}
                Some(update) = self.core.rx_compaction.recv() => self.core.update_snapshot_state(update),
                Ok(_) = &mut self.core.rx_shutdown => self.core.set_target_state(State::Shutdown),
            }
        }
    }
}
