//! Fixtures for testing Raft.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use raftbus::async_trait::async_trait;
use raftbus::raft::{AppendEntriesRequest, AppendEntriesResponse};
use raftbus::raft::{ClientWriteRequest, ClientWriteResponse};
use raftbus::raft::{InstallSnapshotRequest, InstallSnapshotResponse};
use raftbus::raft::{VoteRequest, VoteResponse};
use raftbus::testing::{ClientRequest, ClientResponse, MemStore};
use raftbus::{Config, LeaderPhase, NodeId, Notification, Raft, RaftNetwork, State};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::RwLock;
use tokio::time::{sleep, Instant};
use tracing_subscriber::prelude::*;

/// A concrete Raft type used during testing.
pub type MemRaft = Raft<ClientRequest, ClientResponse, RaftRouter, MemStore>;

/// A Raft node driven by a scripted network rather than a router full of real peers.
pub type ScriptedRaft<N> = Raft<ClientRequest, ClientResponse, N, MemStore>;

/// Initialize the tracing system.
pub fn init_tracing() {
    let fmt_layer = tracing_subscriber::fmt::Layer::default().with_ansi(false);
    let subscriber = tracing_subscriber::Registry::default()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(fmt_layer);
    // Multiple tests share one binary; only the first install wins.
    let _ = tracing::subscriber::set_global_default(subscriber);
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// A type which emulates a network transport and implements the `RaftNetwork` trait.
pub struct RaftRouter {
    /// The runtime config which all nodes are using.
    config: Arc<Config>,
    /// The table of all nodes currently known to this router instance.
    routing_table: RwLock<BTreeMap<NodeId, (MemRaft, Arc<MemStore>)>>,
    /// Nodes which are isolated can neither send nor receive frames.
    isolated_nodes: RwLock<HashSet<NodeId>>,
}

impl RaftRouter {
    /// Create a new instance.
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            routing_table: Default::default(),
            isolated_nodes: Default::default(),
        }
    }

    /// Create and register a new Raft node bearing the given ID, seeded with the given
    /// cluster membership.
    pub async fn new_raft_node(self: &Arc<Self>, id: NodeId, members: BTreeSet<NodeId>) {
        let memstore = Arc::new(MemStore::new_with_members(id, members));
        let node = Raft::new(id, self.config.clone(), self.clone(), memstore.clone());
        let mut rt = self.routing_table.write().await;
        rt.insert(id, (node, memstore));
    }

    /// Get a handle to the given node.
    pub async fn node(&self, id: NodeId) -> Option<MemRaft> {
        self.routing_table.read().await.get(&id).map(|(node, _)| node.clone())
    }

    /// Get a handle to the given node's storage.
    pub async fn store(&self, id: NodeId) -> Option<Arc<MemStore>> {
        self.routing_table.read().await.get(&id).map(|(_, store)| store.clone())
    }

    /// Remove the target node from the routing table & isolation set.
    pub async fn remove_node(&self, id: NodeId) -> Option<(MemRaft, Arc<MemStore>)> {
        let opt_handles = self.routing_table.write().await.remove(&id);
        self.isolated_nodes.write().await.remove(&id);
        opt_handles
    }

    /// Isolate the target node: frames to and from it are dropped.
    pub async fn isolate_node(&self, id: NodeId) {
        self.isolated_nodes.write().await.insert(id);
    }

    /// Restore the target node's connectivity.
    pub async fn restore_node(&self, id: NodeId) {
        self.isolated_nodes.write().await.remove(&id);
    }

    /// The node currently believing itself leader, if any.
    pub async fn leader(&self) -> Option<NodeId> {
        let rt = self.routing_table.read().await;
        for (id, (node, _)) in rt.iter() {
            let metrics = node.metrics().borrow().clone();
            if metrics.state == State::Leader && metrics.current_leader == Some(*id) {
                return Some(*id);
            }
        }
        None
    }

    /// Wait for some node to establish itself as a synced leader.
    pub async fn wait_for_sync_leader(&self, within: Duration) -> Result<NodeId> {
        let deadline = Instant::now() + within;
        loop {
            {
                let rt = self.routing_table.read().await;
                for (id, (node, _)) in rt.iter() {
                    let metrics = node.metrics().borrow().clone();
                    if metrics.state == State::Leader
                        && metrics.current_leader == Some(*id)
                        && metrics.leader_phase == Some(LeaderPhase::Sync)
                    {
                        return Ok(*id);
                    }
                }
            }
            if Instant::now() >= deadline {
                return Err(anyhow!("timed out waiting for a synced leader"));
            }
            sleep(Duration::from_millis(50)).await;
        }
    }

    /// Wait for the given nodes to reach the given state.
    pub async fn wait_for_state(&self, nodes: &BTreeSet<NodeId>, want: State, within: Duration, msg: &str) -> Result<()> {
        for id in nodes {
            let node = self.node(*id).await.ok_or_else(|| anyhow!("node {} not found", id))?;
            node.wait(Some(within)).state(want, msg).await?;
        }
        Ok(())
    }

    /// Wait for the given nodes to have a last log index of at least `index`.
    pub async fn wait_for_log(&self, nodes: &BTreeSet<NodeId>, index: u64, within: Duration, msg: &str) -> Result<()> {
        for id in nodes {
            let node = self.node(*id).await.ok_or_else(|| anyhow!("node {} not found", id))?;
            node.wait(Some(within)).log(index, msg).await?;
        }
        Ok(())
    }

    /// Wait for the given nodes to have applied at least through `index`.
    pub async fn wait_for_applied(&self, nodes: &BTreeSet<NodeId>, index: u64, within: Duration, msg: &str) -> Result<()> {
        for id in nodes {
            let node = self.node(*id).await.ok_or_else(|| anyhow!("node {} not found", id))?;
            node.wait(Some(within)).applied(index, msg).await?;
        }
        Ok(())
    }

    /// Send a client write to the target node.
    pub async fn client_write(
        &self, target: NodeId, client: &str, serial: u64, status: &str,
    ) -> Result<ClientWriteResponse<ClientResponse>> {
        let node = self.node(target).await.ok_or_else(|| anyhow!("node {} not found", target))?;
        let req = ClientWriteRequest::new(ClientRequest {
            client: client.into(),
            serial,
            status: status.into(),
        });
        Ok(node.client_write(req).await?)
    }

    async fn route(&self, from: NodeId, to: NodeId) -> Result<MemRaft> {
        let isolated = self.isolated_nodes.read().await;
        if isolated.contains(&from) || isolated.contains(&to) {
            return Err(anyhow!("node {} or {} is isolated", from, to));
        }
        drop(isolated);
        self.node(to).await.ok_or_else(|| anyhow!("node {} not found in routing table", to))
    }
}

#[async_trait]
impl RaftNetwork<ClientRequest> for RaftRouter {
    async fn append_entries(&self, target: NodeId, rpc: AppendEntriesRequest<ClientRequest>) -> Result<AppendEntriesResponse> {
        let node = self.route(rpc.leader_id, target).await?;
        Ok(node.append_entries(rpc).await?)
    }

    async fn install_snapshot(&self, target: NodeId, rpc: InstallSnapshotRequest) -> Result<InstallSnapshotResponse> {
        let node = self.route(rpc.leader_id, target).await?;
        Ok(node.install_snapshot(rpc).await?)
    }

    async fn vote(&self, target: NodeId, rpc: VoteRequest) -> Result<VoteResponse> {
        let node = self.route(rpc.candidate_id, target).await?;
        Ok(node.vote(rpc).await?)
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// A network where every RPC fails, partitioning the node from the rest of its cluster.
pub struct UnreachableNetwork;

#[async_trait]
impl RaftNetwork<ClientRequest> for UnreachableNetwork {
    async fn append_entries(&self, target: NodeId, _rpc: AppendEntriesRequest<ClientRequest>) -> Result<AppendEntriesResponse> {
        Err(anyhow!("no route to node {}", target))
    }

    async fn install_snapshot(&self, target: NodeId, _rpc: InstallSnapshotRequest) -> Result<InstallSnapshotResponse> {
        Err(anyhow!("no route to node {}", target))
    }

    async fn vote(&self, target: NodeId, _rpc: VoteRequest) -> Result<VoteResponse> {
        Err(anyhow!("no route to node {}", target))
    }
}

/// A network whose peers grant every vote but never accept log entries.
///
/// A node campaigning against such peers wins its election and then hangs in the leader's
/// unsync phase, since its blank entry can never commit.
pub struct VotingOnlyNetwork;

#[async_trait]
impl RaftNetwork<ClientRequest> for VotingOnlyNetwork {
    async fn append_entries(&self, target: NodeId, _rpc: AppendEntriesRequest<ClientRequest>) -> Result<AppendEntriesResponse> {
        Err(anyhow!("node {} refuses entries", target))
    }

    async fn install_snapshot(&self, target: NodeId, _rpc: InstallSnapshotRequest) -> Result<InstallSnapshotResponse> {
        Err(anyhow!("node {} refuses snapshots", target))
    }

    async fn vote(&self, _target: NodeId, rpc: VoteRequest) -> Result<VoteResponse> {
        Ok(VoteResponse {
            term: rpc.term,
            vote_granted: true,
        })
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// Receive the next notification, erroring if none arrives within the timeout.
pub async fn next_notification(rx: &mut UnboundedReceiver<Notification>, within: Duration) -> Result<Notification> {
    tokio::time::timeout(within, rx.recv())
        .await
        .map_err(|_| anyhow!("timed out waiting for a notification"))?
        .ok_or_else(|| anyhow!("notification stream closed"))
}

/// Scan the stream until a notification satisfies the predicate, discarding everything that
/// arrives before it.
pub async fn expect_notification(
    rx: &mut UnboundedReceiver<Notification>, within: Duration, what: &str,
    pred: impl Fn(&Notification) -> bool,
) -> Result<Notification> {
    let deadline = Instant::now() + within;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(anyhow!("timed out waiting for notification: {}", what));
        }
        let notification = next_notification(rx, remaining).await?;
        if pred(&notification) {
            return Ok(notification);
        }
    }
}
