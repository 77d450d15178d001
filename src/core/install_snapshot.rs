use crate::core::{RaftCore, SnapshotState, State, UpdateCurrentLeader};
use crate::error::{RaftError, RaftResult};
use crate::raft::{ActiveMembership, InstallSnapshotRequest, InstallSnapshotResponse};
use crate::{AppData, AppDataResponse, RaftNetwork, RaftStorage};

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> RaftCore<D, R, N, S> {
    /// Invoked by the leader to send chunks of a snapshot to a follower (§7).
    ///
    /// Leaders always send chunks in order; a chunk may be retransmitted after a lost
    /// response, but a gap in the stream is a protocol error.
    #[tracing::instrument(level="trace", skip(self, req), fields(term=req.term, snapshot_id=%req.meta.id, offset=req.offset, done=req.done))]
    pub(super) async fn handle_install_snapshot_request(
        &mut self, req: InstallSnapshotRequest,
    ) -> RaftResult<InstallSnapshotResponse> {
        // If the message's term is less than the most recent term, do not honor the request.
        if req.term < self.current_term {
            return Ok(InstallSnapshotResponse { term: self.current_term });
        }

        // This is a valid message from a live leader.
        self.update_next_election_timeout(true);
        let mut report_metrics = false;
        if !self.target_state.is_follower() {
            self.set_target_state(State::Follower);
            report_metrics = true;
        }
        if req.term > self.current_term {
            self.update_current_term(req.term, None);
            self.save_hard_state().await?;
            report_metrics = true;
        }
        if self.current_leader != Some(req.leader_id) {
            self.update_current_leader(UpdateCurrentLeader::OtherNode(req.leader_id));
            report_metrics = true;
        }
        if report_metrics {
            self.report_metrics();
        }

        // Compare the current snapshot state with the received chunk and proceed accordingly.
        match self.snapshot_state.take() {
            None => self.begin_installing_snapshot(req).await,
            Some(SnapshotState::Building { handle, .. }) => {
                // Abort our own compaction in favor of the snapshot streaming in from the
                // leader.
                handle.abort();
                self.begin_installing_snapshot(req).await
            }
            Some(SnapshotState::Streaming { offset, id }) => self.continue_installing_snapshot(req, offset, id).await,
        }
    }

    #[tracing::instrument(level = "trace", skip(self, req))]
    async fn begin_installing_snapshot(&mut self, req: InstallSnapshotRequest) -> RaftResult<InstallSnapshotResponse> {
        if req.offset != 0 {
            return Err(RaftError::SnapshotMismatch {
                expect: (req.meta.id.clone(), 0).into(),
                got: (req.meta.id.clone(), req.offset).into(),
            });
        }
        self.storage
            .begin_snapshot_install(&req.meta.id)
            .await
            .map_err(|err| self.map_fatal_storage_error(err))?;
        self.storage
            .write_snapshot_chunk(&req.meta.id, 0, &req.data)
            .await
            .map_err(|err| self.map_fatal_storage_error(err))?;

        // A small snapshot may arrive as a single chunk.
        if req.done {
            self.finalize_snapshot_installation(&req).await?;
            return Ok(InstallSnapshotResponse { term: self.current_term });
        }

        self.snapshot_state = Some(SnapshotState::Streaming {
            offset: req.data.len() as u64,
            id: req.meta.id.clone(),
        });
        Ok(InstallSnapshotResponse { term: self.current_term })
    }

    #[tracing::instrument(level = "trace", skip(self, req, offset, id))]
    async fn continue_installing_snapshot(
        &mut self, req: InstallSnapshotRequest, mut offset: u64, id: String,
    ) -> RaftResult<InstallSnapshotResponse> {
        // The leader has moved on to a newer snapshot; restart with it.
        if req.meta.id != id {
            return self.begin_installing_snapshot(req).await;
        }

        // A chunk beyond the received prefix means a lost segment.
        if req.offset > offset {
            self.snapshot_state = Some(SnapshotState::Streaming { offset, id });
            return Err(RaftError::SnapshotMismatch {
                expect: (req.meta.id.clone(), offset).into(),
                got: (req.meta.id.clone(), req.offset).into(),
            });
        }

        // A retried chunk may rewrite a prefix already received.
        self.storage
            .write_snapshot_chunk(&id, req.offset, &req.data)
            .await
            .map_err(|err| self.map_fatal_storage_error(err))?;
        offset = req.offset + req.data.len() as u64;

        if req.done {
            self.finalize_snapshot_installation(&req).await?;
        } else {
            self.snapshot_state = Some(SnapshotState::Streaming { offset, id });
        }
        Ok(InstallSnapshotResponse { term: self.current_term })
    }

    /// Finalize the installation of a new snapshot.
    ///
    /// The storage layer restores the user state machine from the received blob and replaces
    /// the covered log prefix; here the in-memory cursors and the active configuration are
    /// brought in line with it.
    #[tracing::instrument(level = "trace", skip(self, req))]
    async fn finalize_snapshot_installation(&mut self, req: &InstallSnapshotRequest) -> RaftResult<()> {
        self.storage
            .finalize_snapshot_install(&req.meta)
            .await
            .map_err(|err| self.map_fatal_storage_error(err))?;
        let index = req.meta.last_log_id.index;
        self.last_log_id = req.meta.last_log_id;
        self.last_applied = index;
        if index > self.commit_index {
            self.commit_index = index;
        }
        self.snapshot_index = index;
        self.snapshot_state = None;
        self.update_membership(ActiveMembership {
            log_id: req.meta.last_log_id,
            membership: req.meta.membership.clone(),
        });
        self.report_metrics();
        Ok(())
    }
}
