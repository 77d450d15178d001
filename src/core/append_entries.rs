use crate::core::{RaftCore, State, UpdateCurrentLeader};
use crate::error::RaftResult;
use crate::notify::Notification;
use crate::raft::{ActiveMembership, AppendEntriesRequest, AppendEntriesResponse, Entry, EntryPayload, MembershipConfig};
use crate::{AppData, AppDataResponse, LogId, RaftNetwork, RaftStorage};

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> RaftCore<D, R, N, S> {
    /// An RPC invoked by the leader to replicate log entries (§5.3); also used as heartbeat (§5.2).
    #[tracing::instrument(
        level="trace", skip(self, msg),
        fields(term=msg.term, leader_id=msg.leader_id, prev_log_id=%msg.prev_log_id, leader_commit=msg.leader_commit),
    )]
    pub(super) async fn handle_append_entries_request(
        &mut self, msg: AppendEntriesRequest<D>,
    ) -> RaftResult<AppendEntriesResponse> {
        // If the message's term is less than the most recent term, then we do not honor the
        // request.
        if msg.term < self.current_term {
            tracing::trace!(self.current_term, rpc_term = msg.term, "AppendEntries RPC term is less than current term");
            return Ok(AppendEntriesResponse {
                term: self.current_term,
                success: false,
                last_log_index: self.last_log_id.index,
            });
        }

        // An equal-term AppendEntries while we are the leader would mean two leaders share one
        // term; only a strictly higher term may unseat us.
        if msg.term == self.current_term && self.target_state.is_leader() {
            tracing::error!(rpc_leader = msg.leader_id, "AppendEntries from another leader of the same term");
            return Ok(AppendEntriesResponse {
                term: self.current_term,
                success: false,
                last_log_index: self.last_log_id.index,
            });
        }

        // This is a valid message from a live leader.
        self.update_next_election_timeout(true);
        let mut report_metrics = false;

        if !self.target_state.is_follower() {
            self.set_target_state(State::Follower);
            report_metrics = true;
        }
        if msg.term > self.current_term {
            self.update_current_term(msg.term, None);
            self.save_hard_state().await?;
            report_metrics = true;
        }
        if self.current_leader != Some(msg.leader_id) {
            self.update_current_leader(UpdateCurrentLeader::OtherNode(msg.leader_id));
            report_metrics = true;
        }

        // Consistency check: the entry at `prev_log_id` must exist with a matching term.
        let prev = msg.prev_log_id;
        let consistent = if prev.index == 0 || prev == self.last_log_id {
            true
        } else if prev.index > self.last_log_id.index {
            false
        } else {
            let existing = self
                .storage
                .try_get_log_entry(prev.index)
                .await
                .map_err(|err| self.map_fatal_storage_error(err))?;
            match existing {
                Some(entry) => entry.log_id.term == prev.term,
                // The entry has been compacted away. Anything at or below the applied cursor
                // was committed, and committed entries match the leader's log.
                None => prev.index <= self.last_applied,
            }
        };
        if !consistent {
            tracing::trace!(prev=%prev, last_log_id=%self.last_log_id, "log consistency check failed");
            if report_metrics {
                self.report_metrics();
            }
            return Ok(AppendEntriesResponse {
                term: self.current_term,
                success: false,
                last_log_index: self.last_log_id.index,
            });
        }

        self.append_log_entries(prev, &msg.entries).await?;

        // Advance the commit index to min(leader commit, last locally verified index) and
        // apply. The commit index never regresses.
        let last_verified = msg.entries.last().map(|e| e.log_id.index).unwrap_or(prev.index);
        let new_commit = std::cmp::min(msg.leader_commit, last_verified);
        if new_commit > self.commit_index {
            self.commit_index = new_commit;
            self.storage
                .save_committed_index(new_commit)
                .await
                .map_err(|err| self.map_fatal_storage_error(err))?;
            self.notifier.notify(Notification::Commit {
                term: self.current_term,
                index: new_commit,
            });
            self.apply_committed_entries().await?;
        }

        if report_metrics || !msg.entries.is_empty() {
            self.report_metrics();
        }
        Ok(AppendEntriesResponse {
            term: self.current_term,
            success: true,
            last_log_index: self.last_log_id.index,
        })
    }

    /// Append the given entries to the log, dropping any conflicting local suffix first.
    ///
    /// Redelivery of entries which are already present is a no-op, which makes the
    /// AppendEntries handler idempotent on log contents. When a truncation covers a
    /// configuration entry, the configuration history is rolled back with it.
    #[tracing::instrument(level = "trace", skip(self, entries))]
    async fn append_log_entries(&mut self, prev: LogId, entries: &[Entry<D>]) -> RaftResult<()> {
        if entries.is_empty() {
            return Ok(());
        }

        // Find the first entry which is new to the local log, truncating a divergent suffix
        // if one exists (§5.3).
        let mut start = entries.len();
        for (i, entry) in entries.iter().enumerate() {
            let index = entry.log_id.index;
            if index > self.last_log_id.index {
                start = i;
                break;
            }
            let existing = self
                .storage
                .try_get_log_entry(index)
                .await
                .map_err(|err| self.map_fatal_storage_error(err))?;
            match existing {
                // Entry already present with the same term.
                Some(ex) if ex.log_id.term == entry.log_id.term => continue,
                // Compacted region: committed, so necessarily identical.
                None => continue,
                // Terms disagree at this position: everything from here on is divergent.
                Some(_) => {
                    tracing::debug!(index, "truncating conflicting log suffix");
                    self.storage
                        .truncate_log_after(index - 1)
                        .await
                        .map_err(|err| self.map_fatal_storage_error(err))?;
                    self.storage
                        .truncate_configs_after(index - 1)
                        .await
                        .map_err(|err| self.map_fatal_storage_error(err))?;
                    let membership = self
                        .storage
                        .last_config()
                        .await
                        .map_err(|err| self.map_fatal_storage_error(err))?;
                    self.update_membership(membership);
                    // The predecessor of the conflict position was just verified against the
                    // leader's log, so it is the new log head.
                    self.last_log_id = if i == 0 { prev } else { entries[i - 1].log_id };
                    start = i;
                    break;
                }
            }
        }
        if start >= entries.len() {
            return Ok(());
        }
        let new_entries = &entries[start..];

        // Record configuration changes carried by the new entries; the active config is
        // defined by the highest-indexed config entry, committed or not.
        let mut last_conf: Option<(LogId, MembershipConfig)> = None;
        for entry in new_entries {
            if let EntryPayload::ConfigChange(conf) = &entry.payload {
                self.storage
                    .push_config(entry.log_id.index, &conf.membership)
                    .await
                    .map_err(|err| self.map_fatal_storage_error(err))?;
                last_conf = Some((entry.log_id, conf.membership.clone()));
            }
        }

        self.storage
            .append_to_log(new_entries)
            .await
            .map_err(|err| self.map_fatal_storage_error(err))?;
        if let Some(last) = new_entries.last() {
            self.last_log_id = last.log_id;
        }

        if let Some((log_id, membership)) = last_conf {
            tracing::debug!(membership=?membership, "applying new membership config received from leader");
            self.update_membership(ActiveMembership { log_id, membership });
        }
        Ok(())
    }
}
