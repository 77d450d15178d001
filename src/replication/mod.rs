//! Per-peer replication.
//!
//! One replicator task runs for every remote peer the local node knows of. A replicator lives
//! across role changes: it idles while the local node is not leading, campaigns on its behalf
//! while it is a candidate, and drives AppendEntries or snapshot replication while it leads.
//! All coordination with the local node happens over message channels; the replicator owns its
//! next/match indexes and all outstanding RPC state.

use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

use futures::stream::{FuturesOrdered, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, timeout, Duration, Instant};
use tracing_futures::Instrument;

use crate::config::Config;
use crate::raft::{AppendEntriesRequest, AppendEntriesResponse, Entry, InstallSnapshotRequest, VoteRequest, VoteResponse};
use crate::storage::Snapshot;
use crate::{AppData, AppDataResponse, LogId, NodeId, RaftNetwork, RaftStorage};

/// The maximum number of outstanding AppendEntries RPCs in pipeline mode.
const PIPELINE_WINDOW: usize = 8;

/// The core-side handle to a spawned peer replicator.
pub(crate) struct PeerHandle<D: AppData> {
    /// The channel used for communicating with the replicator task.
    pub repl_tx: mpsc::UnboundedSender<PeerDirective<D>>,
    /// The task handle, awaited during shutdown.
    pub handle: JoinHandle<()>,
}

/// A directive from the local node to one of its peer replicators.
#[derive(Clone)]
pub(crate) enum PeerDirective<D: AppData> {
    /// The local node became leader: replicate from the given log position.
    Activate {
        term: u64,
        last_log: LogId,
        commit_index: u64,
    },
    /// The local node is no longer leader: stop all timers and RPCs.
    Deactivate,
    /// The local node is campaigning: request this peer's vote.
    RequestVote { rpc: VoteRequest },
    /// A new entry was appended to the leader's log and awaits replication.
    Replicate {
        entry: Arc<Entry<D>>,
        commit_index: u64,
    },
    /// The leader's commit index advanced.
    UpdateCommitIndex { commit_index: u64 },
    /// The peer was removed or the node is shutting down; exit the task.
    Terminate,
}

/// An event raised by a peer replicator toward the local node.
pub(crate) enum PeerEvent {
    /// The peer answered a RequestVote RPC.
    VoteResult { target: NodeId, resp: VoteResponse },
    /// The highest log id known to be replicated on the peer advanced.
    UpdateMatched { target: NodeId, matched: LogId },
    /// The peer reported a strictly higher term.
    RevertToFollower { target: NodeId, term: u64 },
    /// An AppendEntries round failed on transport; the replicator retries with backoff.
    ReplicationFailed { target: NodeId },
    /// The replicator needs a snapshot to bring its peer up to speed.
    NeedsSnapshot {
        target: NodeId,
        tx: oneshot::Sender<Snapshot>,
    },
    /// The replicator hit a storage error; the node must halt.
    PersistError { target: NodeId },
}

/// The state of a peer replicator.
enum PeerState {
    /// No timers, no RPCs; the local node is neither leading nor campaigning.
    Deactivated,
    /// Requesting this peer's vote on behalf of the campaigning local node.
    CandidateVote(VoteRequest),
    /// Heartbeat-paced replication, one AppendEntries RPC at a time.
    LineRate,
    /// Several outstanding AppendEntries RPCs; entered while a healthy peer trails the log.
    Pipeline,
    /// Streaming a snapshot chunk-by-chunk.
    Snapshotting,
    /// The task is exiting.
    Shutdown,
}

/// The outcome of a single AppendEntries round.
enum SendResult {
    /// The peer accepted the payload (or the empty heartbeat).
    Replicated,
    /// The peer rejected the payload; `next_index` has been stepped back.
    Conflict,
    /// The RPC failed on transport or timed out.
    Transport,
    /// The replicator switched state (snapshot, deactivation or shutdown); stop the loop.
    Stop,
}

type PipelinedRpc = Pin<Box<dyn Future<Output = (Option<LogId>, anyhow::Result<AppendEntriesResponse>)> + Send>>;

/// A task driving replication (and votes) for a single remote peer.
pub(crate) struct PeerReplicator<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> {
    /// The ID of this Raft node.
    id: NodeId,
    /// The ID of the target peer.
    target: NodeId,
    /// The node's runtime config.
    config: Arc<Config>,
    /// The `RaftNetwork` interface.
    network: Arc<N>,
    /// The `RaftStorage` interface, used for reading committed log prefixes and snapshots.
    storage: Arc<S>,
    /// The channel for raising events at the local node.
    core_tx: mpsc::UnboundedSender<PeerEvent>,
    /// The channel of directives from the local node.
    rx: mpsc::UnboundedReceiver<PeerDirective<D>>,

    /// The replicator's current state.
    state: PeerState,
    /// The leader term this replicator is serving; set on activation.
    term: u64,
    /// The highest log id confirmed replicated on the target.
    matched: LogId,
    /// The index of the next log entry to send to the target.
    next_index: u64,
    /// The index of the last entry appended to the local log.
    last_log_index: u64,
    /// The leader's commit index, as last communicated.
    commit_index: u64,

    marker_r: PhantomData<R>,
}

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> PeerReplicator<D, R, N, S> {
    /// Spawn a new replicator task for the target peer, returning its handle.
    pub(crate) fn spawn(
        id: NodeId, target: NodeId, config: Arc<Config>, network: Arc<N>, storage: Arc<S>,
        core_tx: mpsc::UnboundedSender<PeerEvent>,
    ) -> PeerHandle<D> {
        let (repl_tx, rx) = mpsc::unbounded_channel();
        let this = Self {
            id,
            target,
            config,
            network,
            storage,
            core_tx,
            rx,
            state: PeerState::Deactivated,
            term: 0,
            matched: LogId::default(),
            next_index: 1,
            last_log_index: 0,
            commit_index: 0,
            marker_r: PhantomData,
        };
        let handle = tokio::spawn(this.main().instrument(tracing::debug_span!("peer", target)));
        PeerHandle { repl_tx, handle }
    }

    #[tracing::instrument(level = "trace", skip(self), fields(id = self.id, target = self.target))]
    async fn main(mut self) {
        loop {
            match &self.state {
                PeerState::Deactivated => self.deactivated_loop().await,
                PeerState::CandidateVote(_) => self.candidate_vote_loop().await,
                PeerState::LineRate => self.line_rate_loop().await,
                PeerState::Pipeline => self.pipeline_loop().await,
                PeerState::Snapshotting => self.snapshot_loop().await,
                PeerState::Shutdown => return,
            }
        }
    }

    /// Apply a directive from the local node.
    fn handle_directive(&mut self, directive: PeerDirective<D>) {
        match directive {
            PeerDirective::Activate {
                term,
                last_log,
                commit_index,
            } => {
                tracing::debug!(target = self.target, term, "replicator activated");
                self.term = term;
                self.matched = LogId::default();
                self.next_index = last_log.index + 1;
                self.last_log_index = last_log.index;
                self.commit_index = commit_index;
                self.state = PeerState::LineRate;
            }
            PeerDirective::Deactivate => {
                tracing::debug!(target = self.target, "replicator deactivated");
                self.state = PeerState::Deactivated;
            }
            PeerDirective::RequestVote { rpc } => {
                self.term = rpc.term;
                self.state = PeerState::CandidateVote(rpc);
            }
            PeerDirective::Replicate { entry, commit_index } => {
                self.commit_index = commit_index;
                self.last_log_index = entry.log_id.index;
            }
            PeerDirective::UpdateCommitIndex { commit_index } => {
                self.commit_index = commit_index;
            }
            PeerDirective::Terminate => {
                self.state = PeerState::Shutdown;
            }
        }
    }

    /// Park until a directive moves the replicator out of its deactivated state.
    async fn deactivated_loop(&mut self) {
        while matches!(self.state, PeerState::Deactivated) {
            match self.rx.recv().await {
                Some(directive) => self.handle_directive(directive),
                None => {
                    self.state = PeerState::Shutdown;
                    return;
                }
            }
        }
    }

    /// Request the peer's vote, retrying with backoff until a response arrives or a directive
    /// ends the campaign.
    #[tracing::instrument(level = "trace", skip(self), fields(state = "candidate-vote"))]
    async fn candidate_vote_loop(&mut self) {
        let ttl = Duration::from_millis(self.config.comm_client_timeout);
        loop {
            let rpc = match &self.state {
                PeerState::CandidateVote(rpc) => rpc.clone(),
                _ => return,
            };
            let network = self.network.clone();
            let target = self.target;
            let request = rpc.clone();
            let vote_fut = timeout(ttl, async move { network.vote(target, request).await });
            tokio::pin!(vote_fut);

            let res = tokio::select! {
                res = &mut vote_fut => Some(res),
                maybe = self.rx.recv() => {
                    match maybe {
                        Some(directive) => self.handle_directive(directive),
                        None => self.state = PeerState::Shutdown,
                    }
                    None
                }
            };
            // A directive preempted the RPC; re-evaluate at the top of the loop.
            let res = match res {
                Some(res) => res,
                None => continue,
            };

            match res {
                Ok(Ok(resp)) => {
                    let _ = self.core_tx.send(PeerEvent::VoteResult {
                        target: self.target,
                        resp,
                    });
                    self.state = PeerState::Deactivated;
                    return;
                }
                Ok(Err(err)) => {
                    tracing::warn!(error=%err, "error sending RequestVote RPC to peer");
                    self.backoff().await;
                }
                Err(_elapsed) => {
                    tracing::warn!("timeout while sending RequestVote RPC to peer");
                    self.backoff().await;
                }
            }
        }
    }

    /// Heartbeat-paced replication.
    #[tracing::instrument(level = "trace", skip(self), fields(state = "line-rate"))]
    async fn line_rate_loop(&mut self) {
        let period = Duration::from_millis(self.config.heartbeat_timeout);
        let mut heartbeat = interval_at(Instant::now() + period, period);
        loop {
            if !matches!(self.state, PeerState::LineRate) {
                return;
            }

            // Ship outstanding entries eagerly; promote to pipeline mode while a healthy
            // peer still trails the log.
            if self.next_index <= self.last_log_index {
                match self.send_append_entries().await {
                    SendResult::Replicated => {
                        if self.next_index <= self.last_log_index {
                            self.state = PeerState::Pipeline;
                            return;
                        }
                    }
                    SendResult::Conflict => {}
                    SendResult::Transport => self.backoff().await,
                    SendResult::Stop => return,
                }
                continue;
            }

            tokio::select! {
                _ = heartbeat.tick() => {
                    if let SendResult::Stop = self.send_append_entries().await {
                        return;
                    }
                }
                maybe = self.rx.recv() => match maybe {
                    Some(directive) => self.handle_directive(directive),
                    None => {
                        self.state = PeerState::Shutdown;
                        return;
                    }
                }
            }
        }
    }

    /// Replication with several AppendEntries RPCs on the wire at once.
    ///
    /// Responses are matched to their originating send in order by highest-index-sent; any
    /// error or rejection falls back to line rate.
    #[tracing::instrument(level = "trace", skip(self), fields(state = "pipeline"))]
    async fn pipeline_loop(&mut self) {
        let mut inflight: FuturesOrdered<PipelinedRpc> = FuturesOrdered::new();
        loop {
            if !matches!(self.state, PeerState::Pipeline) {
                return;
            }

            // Top up the send window.
            while inflight.len() < PIPELINE_WINDOW && self.next_index <= self.last_log_index {
                let (payload, last_sent) = match self.prepare_append_request().await {
                    Some(prepared) => prepared,
                    None => return,
                };
                let network = self.network.clone();
                let target = self.target;
                let ttl = Duration::from_millis(self.config.heartbeat_timeout);
                inflight.push_back(Box::pin(async move {
                    let res = match timeout(ttl, network.append_entries(target, payload)).await {
                        Ok(inner) => inner,
                        Err(err) => Err(anyhow::Error::new(err)),
                    };
                    (last_sent, res)
                }));
            }

            if inflight.is_empty() {
                // Caught up; heartbeat pacing is enough again.
                self.state = PeerState::LineRate;
                return;
            }

            tokio::select! {
                Some((last_sent, res)) = inflight.next() => match res {
                    Ok(resp) if resp.term > self.term => {
                        let _ = self.core_tx.send(PeerEvent::RevertToFollower { target: self.target, term: resp.term });
                        self.state = PeerState::Deactivated;
                        return;
                    }
                    Ok(resp) if resp.success => {
                        if let Some(log_id) = last_sent {
                            self.matched = log_id;
                            self.update_matched();
                        }
                    }
                    Ok(resp) => {
                        // Rejection: roll back to the confirmed point and let line rate
                        // resolve the conflict one round at a time.
                        let hint = resp.last_log_index.saturating_add(1);
                        self.next_index = std::cmp::max(1, std::cmp::min(self.matched.index + 1, hint));
                        self.state = PeerState::LineRate;
                        return;
                    }
                    Err(err) => {
                        tracing::warn!(error=%err, "pipelined AppendEntries failed, falling back to line rate");
                        let _ = self.core_tx.send(PeerEvent::ReplicationFailed { target: self.target });
                        self.next_index = self.matched.index + 1;
                        self.state = PeerState::LineRate;
                        return;
                    }
                },
                maybe = self.rx.recv() => match maybe {
                    Some(directive) => self.handle_directive(directive),
                    None => {
                        self.state = PeerState::Shutdown;
                        return;
                    }
                }
            }
        }
    }

    /// Stream the current snapshot to the peer, then resume line-rate replication from the
    /// snapshot boundary.
    #[tracing::instrument(level = "trace", skip(self), fields(state = "snapshotting"))]
    async fn snapshot_loop(&mut self) {
        // Obtain the current snapshot from the local node; it may need to build one first,
        // in which case the response channel is dropped and the request retried.
        let snapshot = loop {
            if !matches!(self.state, PeerState::Snapshotting) {
                return;
            }
            let (tx, mut rx) = oneshot::channel();
            let _ = self.core_tx.send(PeerEvent::NeedsSnapshot {
                target: self.target,
                tx,
            });
            let period = Duration::from_millis(self.config.heartbeat_timeout);
            let mut heartbeat = interval_at(Instant::now() + period, period);
            let snap = loop {
                tokio::select! {
                    res = &mut rx => break res.ok(),
                    // Keep the trailing peer from starting elections while it waits.
                    _ = heartbeat.tick() => {
                        self.send_heartbeat().await;
                        if !matches!(self.state, PeerState::Snapshotting) {
                            return;
                        }
                    }
                    maybe = self.rx.recv() => match maybe {
                        Some(directive) => {
                            self.handle_directive(directive);
                            if !matches!(self.state, PeerState::Snapshotting) {
                                return;
                            }
                        }
                        None => {
                            self.state = PeerState::Shutdown;
                            return;
                        }
                    }
                }
            };
            match snap {
                Some(snapshot) => break snapshot,
                None => self.backoff().await,
            }
        };

        let Snapshot { meta, size } = snapshot;
        tracing::debug!(snapshot_id=%meta.id, size, "streaming snapshot to peer");
        let mut offset = 0u64;
        loop {
            if !matches!(self.state, PeerState::Snapshotting) {
                return;
            }
            let len = std::cmp::min(self.config.max_snapshot_chunk_size, size - offset);
            let data = match self.storage.read_snapshot_chunk(&meta.id, offset, len).await {
                Ok(data) => data,
                // The snapshot may have been superseded by a newer compaction mid-stream;
                // back off and request the current one.
                Err(err) => {
                    tracing::warn!(error=%err, snapshot_id=%meta.id, "snapshot chunk no longer readable, re-requesting");
                    self.backoff().await;
                    return;
                }
            };
            let chunk_len = data.len() as u64;
            let done = offset + chunk_len >= size;
            let payload = InstallSnapshotRequest {
                term: self.term,
                leader_id: self.id,
                meta: meta.clone(),
                offset,
                data,
                done,
            };
            let ttl = Duration::from_millis(self.config.comm_client_timeout);
            match timeout(ttl, self.network.install_snapshot(self.target, payload)).await {
                Ok(Ok(resp)) => {
                    if resp.term > self.term {
                        let _ = self.core_tx.send(PeerEvent::RevertToFollower {
                            target: self.target,
                            term: resp.term,
                        });
                        self.state = PeerState::Deactivated;
                        return;
                    }
                    if done {
                        if meta.last_log_id > self.matched {
                            self.matched = meta.last_log_id;
                            self.update_matched();
                        }
                        self.next_index = meta.last_log_id.index + 1;
                        tracing::debug!("snapshot installation complete, resuming line-rate replication");
                        self.state = PeerState::LineRate;
                        return;
                    }
                    offset += chunk_len;
                    // Stay responsive to directives between chunks.
                    while let Ok(directive) = self.rx.try_recv() {
                        self.handle_directive(directive);
                    }
                }
                Ok(Err(err)) => {
                    tracing::warn!(error=%err, "error sending InstallSnapshot RPC to peer");
                    self.backoff().await;
                }
                Err(_) => {
                    tracing::warn!("timeout while sending InstallSnapshot RPC to peer");
                    self.backoff().await;
                }
            }
        }
    }

    /// Send one AppendEntries RPC carrying the next window of entries (or a bare heartbeat).
    #[tracing::instrument(level = "trace", skip(self))]
    async fn send_append_entries(&mut self) -> SendResult {
        let (prev_log_id, entries, last_sent) = match self.load_window().await {
            Some(window) => window,
            None => return SendResult::Stop,
        };
        let payload = AppendEntriesRequest {
            term: self.term,
            leader_id: self.id,
            prev_log_id,
            entries,
            leader_commit: self.commit_index,
        };

        let ttl = Duration::from_millis(self.config.heartbeat_timeout);
        let resp = match timeout(ttl, self.network.append_entries(self.target, payload)).await {
            Ok(Ok(resp)) => resp,
            Ok(Err(err)) => {
                tracing::warn!(error=%err, "error sending AppendEntries RPC to peer");
                let _ = self.core_tx.send(PeerEvent::ReplicationFailed { target: self.target });
                return SendResult::Transport;
            }
            Err(_elapsed) => {
                tracing::warn!("timeout while sending AppendEntries RPC to peer");
                let _ = self.core_tx.send(PeerEvent::ReplicationFailed { target: self.target });
                return SendResult::Transport;
            }
        };

        if resp.term > self.term {
            tracing::debug!(resp.term, "peer reported a higher term");
            let _ = self.core_tx.send(PeerEvent::RevertToFollower {
                target: self.target,
                term: resp.term,
            });
            self.state = PeerState::Deactivated;
            return SendResult::Stop;
        }

        if resp.success {
            if let Some(log_id) = last_sent {
                self.matched = log_id;
                self.next_index = log_id.index + 1;
                self.update_matched();
            }
            return SendResult::Replicated;
        }

        // Same-term rejection: the peer's log diverges. Back-step using the peer's last log
        // index as a hint, at least one step, clamped to index one.
        let hint = resp.last_log_index.saturating_add(1);
        self.next_index = std::cmp::max(1, std::cmp::min(self.next_index.saturating_sub(1), hint));
        tracing::debug!(next_index = self.next_index, "AppendEntries rejected, stepped next index back");
        SendResult::Conflict
    }

    /// Load the next window of entries and the preceding log id.
    ///
    /// Returns `None` after switching state: to snapshotting when the window has been
    /// compacted away, or to shutdown on a storage failure.
    async fn load_window(&mut self) -> Option<(LogId, Vec<Entry<D>>, Option<LogId>)> {
        let prev_index = self.next_index.saturating_sub(1);
        let prev_log_id = if prev_index == 0 {
            LogId::default()
        } else if prev_index == self.matched.index {
            self.matched
        } else {
            match self.storage.try_get_log_entry(prev_index).await {
                Ok(Some(entry)) => entry.log_id,
                Ok(None) => {
                    tracing::debug!(prev_index, "required previous entry is below the log floor, switching to snapshot replication");
                    self.state = PeerState::Snapshotting;
                    return None;
                }
                Err(err) => {
                    self.raise_persist_error(err);
                    return None;
                }
            }
        };

        let start = self.next_index;
        let stop = std::cmp::min(self.last_log_index + 1, start.saturating_add(self.config.max_append_entries));
        let mut entries = Vec::new();
        if start < stop {
            match self.storage.get_log_entries(start, stop).await {
                Ok(batch) => {
                    if batch.first().map(|e| e.log_id.index) != Some(start) {
                        tracing::debug!(start, "entries to replicate are below the log floor, switching to snapshot replication");
                        self.state = PeerState::Snapshotting;
                        return None;
                    }
                    entries = batch;
                }
                Err(err) => {
                    self.raise_persist_error(err);
                    return None;
                }
            }
        }
        let last_sent = entries.last().map(|e| e.log_id);
        Some((prev_log_id, entries, last_sent))
    }

    /// Load the next window for a pipelined send, optimistically advancing `next_index`.
    async fn prepare_append_request(&mut self) -> Option<(AppendEntriesRequest<D>, Option<LogId>)> {
        let (prev_log_id, entries, last_sent) = self.load_window().await?;
        if let Some(log_id) = last_sent {
            self.next_index = log_id.index + 1;
        }
        let payload = AppendEntriesRequest {
            term: self.term,
            leader_id: self.id,
            prev_log_id,
            entries,
            leader_commit: self.commit_index,
        };
        Some((payload, last_sent))
    }

    /// Send a bare keep-alive heartbeat, used while waiting for a snapshot to build.
    async fn send_heartbeat(&mut self) {
        let payload = AppendEntriesRequest {
            term: self.term,
            leader_id: self.id,
            prev_log_id: self.matched,
            entries: Vec::new(),
            leader_commit: self.commit_index,
        };
        let ttl = Duration::from_millis(self.config.heartbeat_timeout);
        match timeout(ttl, self.network.append_entries(self.target, payload)).await {
            Ok(Ok(resp)) if resp.term > self.term => {
                let _ = self.core_tx.send(PeerEvent::RevertToFollower {
                    target: self.target,
                    term: resp.term,
                });
                self.state = PeerState::Deactivated;
            }
            Ok(Ok(_)) => {}
            Ok(Err(err)) => tracing::trace!(error=%err, "keep-alive heartbeat failed"),
            Err(_) => tracing::trace!("keep-alive heartbeat timed out"),
        }
    }

    /// Report replication progress to the local node.
    fn update_matched(&mut self) {
        tracing::trace!(target = self.target, matched = %self.matched, "matched index advanced");
        let _ = self.core_tx.send(PeerEvent::UpdateMatched {
            target: self.target,
            matched: self.matched,
        });
    }

    /// Report a storage failure and park the task.
    fn raise_persist_error(&mut self, err: anyhow::Error) {
        tracing::error!(error=%err, target = self.target, "replicator storage failure");
        let _ = self.core_tx.send(PeerEvent::PersistError { target: self.target });
        self.state = PeerState::Shutdown;
    }

    /// Sleep one heartbeat interval before retrying, staying responsive to directives.
    async fn backoff(&mut self) {
        let delay = sleep(Duration::from_millis(self.config.heartbeat_timeout));
        tokio::pin!(delay);
        let before = std::mem::discriminant(&self.state);
        loop {
            tokio::select! {
                _ = &mut delay => return,
                maybe = self.rx.recv() => match maybe {
                    Some(directive) => {
                        self.handle_directive(directive);
                        if std::mem::discriminant(&self.state) != before {
                            return;
                        }
                    }
                    None => {
                        self.state = PeerState::Shutdown;
                        return;
                    }
                }
            }
        }
    }
}
