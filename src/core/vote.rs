use tokio::time::Instant;

use crate::core::{CandidateState, RaftCore, State, UpdateCurrentLeader};
use crate::error::RaftResult;
use crate::raft::{VoteRequest, VoteResponse};
use crate::{AppData, AppDataResponse, NodeId, RaftNetwork, RaftStorage};

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> RaftCore<D, R, N, S> {
    /// An RPC invoked by candidates to gather votes (§5.2).
    #[tracing::instrument(level="trace", skip(self, msg), fields(term=msg.term, candidate=msg.candidate_id))]
    pub(super) async fn handle_vote_request(&mut self, msg: VoteRequest) -> RaftResult<VoteResponse> {
        // If the candidate's term is less than this node's current term, reject.
        if msg.term < self.current_term {
            tracing::trace!(self.current_term, rpc_term = msg.term, "RequestVote RPC term is less than current term");
            return Ok(VoteResponse {
                term: self.current_term,
                vote_granted: false,
            });
        }

        // Do not unseat a leader we have recently heard from. This keeps a live leader in
        // place against a partitioned node coming back with an inflated term.
        if let Some(inst) = &self.last_heartbeat {
            let delta = Instant::now().duration_since(*inst);
            if (delta.as_millis() as u64) <= self.config.leader_lease_timeout() {
                tracing::trace!(candidate = msg.candidate_id, "rejecting vote request while the leader is live");
                return Ok(VoteResponse {
                    term: self.current_term,
                    vote_granted: false,
                });
            }
        }

        // An equal-term RequestVote while we are the leader is a protocol violation by the
        // sender; only a strictly higher term may unseat us.
        if msg.term == self.current_term && self.target_state.is_leader() {
            return Ok(VoteResponse {
                term: self.current_term,
                vote_granted: false,
            });
        }

        // Observing a higher term makes this node a follower of that term, with the vote
        // still to be decided below.
        if msg.term > self.current_term {
            if !self.target_state.is_follower() {
                self.set_target_state(State::Follower);
            }
            self.update_current_term(msg.term, None);
            self.update_next_election_timeout(false);
            self.save_hard_state().await?;
            self.report_metrics();
        }

        // Grant only if the candidate's log is at least as up-to-date, comparing
        // (last term, last index) lexicographically (§5.4.1).
        if msg.last_log_id < self.last_log_id {
            tracing::trace!(candidate = msg.candidate_id, "rejecting vote request as candidate's log is not up-to-date");
            return Ok(VoteResponse {
                term: self.current_term,
                vote_granted: false,
            });
        }

        match &self.voted_for {
            // This node has already voted for the candidate.
            Some(candidate_id) if candidate_id == &msg.candidate_id => Ok(VoteResponse {
                term: self.current_term,
                vote_granted: true,
            }),
            // This node has already voted for a different candidate.
            Some(_) => Ok(VoteResponse {
                term: self.current_term,
                vote_granted: false,
            }),
            // This node has not yet voted for the current term, so vote for the candidate.
            None => {
                self.voted_for = Some(msg.candidate_id);
                self.update_next_election_timeout(false);
                self.save_hard_state().await?;
                tracing::trace!(candidate = msg.candidate_id, msg.term, "voted for candidate");
                Ok(VoteResponse {
                    term: self.current_term,
                    vote_granted: true,
                })
            }
        }
    }
}

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> CandidateState<'a, D, R, N, S> {
    /// Handle a vote response relayed by the target peer's replicator.
    #[tracing::instrument(level = "trace", skip(self, res))]
    pub(super) async fn handle_vote_response(&mut self, res: VoteResponse, target: NodeId) -> RaftResult<()> {
        // If the peer's term is greater than our current term, revert to follower.
        if res.term > self.core.current_term {
            self.core.update_current_term(res.term, None);
            self.core.update_current_leader(UpdateCurrentLeader::Unknown);
            self.core.set_target_state(State::Follower);
            self.core.save_hard_state().await?;
            tracing::trace!("reverting to follower state due to greater term observed in RequestVote RPC response");
            return Ok(());
        }

        // A response from an earlier vote round must not count towards this term's tally.
        if res.term < self.core.current_term {
            tracing::trace!(rpc_term = res.term, "dropping vote response from a previous term");
            return Ok(());
        }

        if res.vote_granted {
            // Tally the vote under whichever config group(s) the responder belongs to; a
            // granted vote from a node outside the active configuration carries no weight.
            if self.core.membership.membership.members.contains(&target) {
                self.votes_granted_old += 1;
            }
            if self
                .core
                .membership
                .membership
                .members_after_consensus
                .as_ref()
                .map(|members| members.contains(&target))
                .unwrap_or(false)
            {
                self.votes_granted_new += 1;
            }
            if self.has_quorum() {
                tracing::trace!("transitioning to leader state as minimum number of votes have been received");
                self.core.set_target_state(State::Leader);
            }
        }

        Ok(())
    }
}
