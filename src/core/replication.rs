use std::collections::{BTreeMap, BTreeSet};

use anyhow::anyhow;
use tokio::sync::oneshot;
use tracing_futures::Instrument;

use crate::config::SnapshotPolicy;
use crate::core::{LeaderPhase, LeaderState, SnapshotState, State, UpdateCurrentLeader};
use crate::error::RaftResult;
use crate::notify::Notification;
use crate::quorum;
use crate::replication::{PeerDirective, PeerEvent};
use crate::storage::Snapshot;
use crate::{AppData, AppDataResponse, LogId, NodeId, RaftNetwork, RaftStorage};

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> LeaderState<'a, D, R, N, S> {
    /// Handle an event coming from one of the peer replicators.
    #[tracing::instrument(level = "trace", skip(self, event))]
    pub(super) async fn handle_peer_event(&mut self, event: PeerEvent) -> RaftResult<()> {
        match event {
            PeerEvent::UpdateMatched { target, matched } => self.handle_update_matched(target, matched).await,
            PeerEvent::RevertToFollower { target, term } => self.handle_revert_to_follower(target, term).await,
            PeerEvent::NeedsSnapshot { target, tx } => self.handle_needs_snapshot(target, tx).await,
            PeerEvent::ReplicationFailed { target } => {
                tracing::warn!(target, "replication to peer failed, replicator is retrying");
                Ok(())
            }
            PeerEvent::VoteResult { target, .. } => {
                tracing::trace!(target, "ignoring vote result while leading");
                Ok(())
            }
            PeerEvent::PersistError { target } => {
                let _ = self
                    .core
                    .map_fatal_storage_error(anyhow!("replicator for peer {} hit a storage failure", target));
                Ok(())
            }
        }
    }

    /// Handle an event from a replication stream which updates the target node's match index.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn handle_update_matched(&mut self, target: NodeId, matched: LogId) -> RaftResult<()> {
        if !self.core.peers.contains_key(&target) {
            tracing::trace!(target, "match report from unknown peer");
            return Ok(());
        }
        self.matched.insert(target, matched);
        self.recompute_commit().await?;
        self.step_member_change().await
    }

    /// Recompute the commit index and, if it advanced, resolve everything riding on it:
    /// inflight client requests, the unsync-phase exit and membership change stages.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) async fn recompute_commit(&mut self) -> RaftResult<()> {
        let commit_index = self.calc_commit_index();
        if commit_index <= self.core.commit_index {
            return Ok(());
        }
        self.core.commit_index = commit_index;
        self.core
            .storage
            .save_committed_index(commit_index)
            .await
            .map_err(|err| self.core.map_fatal_storage_error(err))?;
        self.core.notifier.notify(Notification::Commit {
            term: self.core.current_term,
            index: commit_index,
        });

        // Let the replicators carry the new commit index to the followers.
        self.core.broadcast_peer_directive(PeerDirective::UpdateCommitIndex { commit_index });

        // Resolve inflight requests up to the new commit index. The buffer is in log-index
        // order, so responses are emitted in log-index order as well.
        let split = self
            .awaiting_committed
            .iter()
            .position(|e| e.entry.log_id.index > commit_index)
            .unwrap_or(self.awaiting_committed.len());
        if split > 0 {
            for request in self.awaiting_committed.drain(..split).collect::<Vec<_>>() {
                self.client_request_post_commit(request).await;
            }
        }

        // The leader leaves its unsync phase once the blank entry of its own term commits.
        if self.core.leader_phase == Some(LeaderPhase::Unsync) && self.noop_index > 0 && commit_index >= self.noop_index {
            self.set_phase(LeaderPhase::Sync);
        }

        self.core.report_metrics();
        Ok(())
    }

    /// Determine the largest index replicated to a quorum whose entry carries the current
    /// term, per config group; a joint configuration requires both majorities.
    #[tracing::instrument(level = "trace", skip(self))]
    fn calc_commit_index(&self) -> u64 {
        let membership = &self.core.membership.membership;
        let leader = (self.core.id, self.core.last_log_id);
        let c0_index = quorum_acked_index(
            &membership.members,
            leader,
            &self.matched,
            self.core.commit_index,
            self.core.current_term,
        );

        // In joint consensus a commit additionally needs the concurrence of the new config
        // group, so the lower of the two group indexes wins.
        match &membership.members_after_consensus {
            None => c0_index,
            Some(new_members) => {
                let c1_index = quorum_acked_index(
                    new_members,
                    leader,
                    &self.matched,
                    self.core.commit_index,
                    self.core.current_term,
                );
                std::cmp::min(c0_index, c1_index)
            }
        }
    }

    /// Handle a replicator's report that its peer holds a higher term.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn handle_revert_to_follower(&mut self, target: NodeId, term: u64) -> RaftResult<()> {
        if term > self.core.current_term {
            tracing::debug!(target, term, "reverting to follower due to higher term observed during replication");
            self.core.set_target_state(State::Follower);
            self.core.update_current_term(term, None);
            self.core.save_hard_state().await?;
            self.core.update_current_leader(UpdateCurrentLeader::Unknown);
        }
        Ok(())
    }

    /// Handle a replicator's request for the current snapshot.
    ///
    /// If a sufficiently fresh snapshot exists it is handed over directly. Otherwise a
    /// compaction is started (or awaited) and the request channel is dropped; the replicator
    /// backs off and asks again.
    #[tracing::instrument(level = "trace", skip(self, tx))]
    async fn handle_needs_snapshot(&mut self, target: NodeId, tx: oneshot::Sender<Snapshot>) -> RaftResult<()> {
        tracing::debug!(target, "replicator needs a snapshot");
        let SnapshotPolicy::LogsSinceLast(threshold) = &self.core.config.snapshot_policy;
        let threshold = *threshold;

        let current = self
            .core
            .storage
            .current_snapshot()
            .await
            .map_err(|err| self.core.map_fatal_storage_error(err))?;
        if let Some(snapshot) = current {
            // Hand the snapshot over unless it trails the log by more than half of the
            // compaction threshold, in which case a fresh one is built first.
            let distance = self.core.last_log_id.index.saturating_sub(snapshot.meta.last_log_id.index);
            if distance <= threshold / 2 {
                let _ = tx.send(snapshot);
                return Ok(());
            }
        }

        if let Some(SnapshotState::Building { handle, sender }) = self.core.snapshot_state.take() {
            // A compaction is already running; notify the replicator once it lands by
            // dropping the channel, which makes it re-request the finished snapshot.
            let mut chan = sender.subscribe();
            tokio::spawn(
                async move {
                    let _ = chan.recv().await;
                    drop(tx);
                }
                .instrument(tracing::debug_span!("snapshot-wait")),
            );
            self.core.snapshot_state = Some(SnapshotState::Building { handle, sender });
            return Ok(());
        }

        self.core.trigger_log_compaction_if_needed(true);
        Ok(())
    }
}

/// The highest log index acknowledged by a majority of `group`.
///
/// The leader vouches for its own last log id; a peer the replicators have not yet reported
/// on counts as matched at zero. The result never falls below `committed`, and it only moves
/// onto an entry created in `term`: older-term entries commit by riding under the first
/// current-term entry above them (§5.4.2).
fn quorum_acked_index(
    group: &BTreeSet<NodeId>,
    leader: (NodeId, LogId),
    matched: &BTreeMap<NodeId, LogId>,
    committed: u64,
    term: u64,
) -> u64 {
    if group.is_empty() {
        return committed;
    }
    let mut acked: Vec<LogId> = group
        .iter()
        .map(|id| {
            if *id == leader.0 {
                leader.1
            } else {
                matched.get(id).copied().unwrap_or_default()
            }
        })
        .collect();
    acked.sort_unstable_by_key(|log_id| log_id.index);

    // With the acks in ascending order, the member sitting one majority from the top bounds
    // what a quorum of the group holds.
    let at_quorum = acked[acked.len() - quorum::majority_of(acked.len())];
    if at_quorum.index > committed && at_quorum.term == term {
        at_quorum.index
    } else {
        committed
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    use maplit::btreeset;

    fn matched(pairs: &[(NodeId, LogId)]) -> BTreeMap<NodeId, LogId> {
        pairs.iter().copied().collect()
    }

    #[test]
    fn quorum_ack_follows_the_majority() {
        // The leader and one follower hold index 10; two of three is a majority.
        let m = matched(&[(1, LogId::new(5, 10)), (2, LogId::new(5, 4))]);
        let idx = quorum_acked_index(&btreeset![0, 1, 2], (0, LogId::new(5, 10)), &m, 4, 5);
        assert_eq!(idx, 10);
    }

    #[test]
    fn quorum_ack_waits_for_a_majority() {
        // Only the leader holds index 10; the group quorum still sits at 4.
        let m = matched(&[(1, LogId::new(5, 4)), (2, LogId::new(5, 4))]);
        let idx = quorum_acked_index(&btreeset![0, 1, 2], (0, LogId::new(5, 10)), &m, 2, 5);
        assert_eq!(idx, 4);
    }

    #[test]
    fn quorum_ack_never_regresses() {
        // Stale reports cannot pull the commit index back below its current value.
        let m = matched(&[(1, LogId::new(5, 4)), (2, LogId::new(5, 4))]);
        let idx = quorum_acked_index(&btreeset![0, 1, 2], (0, LogId::new(5, 10)), &m, 7, 5);
        assert_eq!(idx, 7);
    }

    #[test]
    fn prior_term_entries_do_not_commit_by_counting() {
        // A majority holds index 8, but that entry was created in an older term (§5.4.2).
        let m = matched(&[(1, LogId::new(4, 8)), (2, LogId::new(4, 8))]);
        let idx = quorum_acked_index(&btreeset![0, 1, 2], (0, LogId::new(4, 8)), &m, 3, 5);
        assert_eq!(idx, 3);
    }

    #[test]
    fn unreported_peers_count_at_zero() {
        // Fresh replicators have reported nothing yet, so only the leader's own log counts.
        let idx = quorum_acked_index(&btreeset![0, 1, 2], (0, LogId::new(1, 3)), &BTreeMap::new(), 0, 1);
        assert_eq!(idx, 0);
    }

    #[test]
    fn even_sized_groups_need_strictly_more_than_half() {
        // Two of four at index 9 is not a majority; three of four is.
        let leader = (0, LogId::new(2, 9));
        let half = matched(&[(1, LogId::new(2, 9)), (2, LogId::new(2, 1)), (3, LogId::new(2, 1))]);
        assert_eq!(quorum_acked_index(&btreeset![0, 1, 2, 3], leader, &half, 1, 2), 1);
        let most = matched(&[(1, LogId::new(2, 9)), (2, LogId::new(2, 9)), (3, LogId::new(2, 1))]);
        assert_eq!(quorum_acked_index(&btreeset![0, 1, 2, 3], leader, &most, 1, 2), 9);
    }

    #[test]
    fn joint_commit_takes_the_lower_group_index() {
        // The old group {0, 1, 2} has a quorum at 7 while the incoming group {3, 4, 5}
        // trails at 5; a joint commit may only advance to 5.
        let m = matched(&[
            (1, LogId::new(3, 7)),
            (2, LogId::new(3, 2)),
            (3, LogId::new(3, 5)),
            (4, LogId::new(3, 5)),
            (5, LogId::new(3, 1)),
        ]);
        let leader = (0, LogId::new(3, 7));
        let old_group = quorum_acked_index(&btreeset![0, 1, 2], leader, &m, 1, 3);
        let new_group = quorum_acked_index(&btreeset![3, 4, 5], leader, &m, 1, 3);
        assert_eq!(old_group, 7);
        assert_eq!(new_group, 5);
        assert_eq!(std::cmp::min(old_group, new_group), 5);
    }

    #[test]
    fn empty_group_changes_nothing() {
        let idx = quorum_acked_index(&BTreeSet::new(), (0, LogId::new(1, 1)), &BTreeMap::new(), 6, 1);
        assert_eq!(idx, 6);
    }
}
