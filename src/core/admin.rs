use std::collections::BTreeSet;
use std::sync::Arc;

use crate::core::client::{ClientRequestEntry, ResponseSink};
use crate::core::{LeaderPhase, LeaderState, State, UpdateCurrentLeader};
use crate::error::{ClientError, RaftResult};
use crate::raft::{ActiveMembership, ChangeConfigResponseTx, Entry, EntryConfigChange, EntryPayload, MembershipConfig};
use crate::replication::PeerDirective;
use crate::{AppData, AppDataResponse, NodeId, RaftNetwork, RaftStorage};

/// The leader-side state of an in-flight two-phase membership change.
pub(super) struct MemberChangeState {
    /// The requested final member set.
    pub target_members: BTreeSet<NodeId>,
    /// The stage the change has reached.
    pub stage: ChangeStage,
    /// The response sink of the proposing client; absent when the change was inherited from
    /// a deposed leader and is merely being driven to completion.
    pub tx: Option<ChangeConfigResponseTx>,
}

/// The stages of a two-phase membership change.
pub(super) enum ChangeStage {
    /// The joint configuration is replicating; waiting for it to commit.
    Joint { joint_index: u64 },
    /// The final uniform configuration is replicating; waiting for it to commit.
    Uniform { final_index: u64 },
}

/// The next action the change protocol is due for.
enum StepAction {
    AppendFinal(BTreeSet<NodeId>),
    Finish,
}

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> LeaderState<'a, D, R, N, S> {
    /// Begin a two-phase membership change towards the given member set.
    #[tracing::instrument(level = "debug", skip(self, tx))]
    pub(super) async fn change_membership(&mut self, members: BTreeSet<NodeId>, tx: ChangeConfigResponseTx) {
        // The cluster must keep at least one member.
        if members.is_empty() {
            let _ = tx.send(Err(ClientError::InoperableConfig));
            return;
        }
        if self.core.leader_phase == Some(LeaderPhase::Unsync) {
            let _ = tx.send(Err(ClientError::LeaderUnsync));
            return;
        }
        if self.member_change.is_some() {
            let _ = tx.send(Err(ClientError::InMemberChange));
            return;
        }

        // Phase one: append the joint configuration carrying both member sets. All majority
        // decisions from here on require concurrence of both groups.
        let joint = MembershipConfig {
            members: self.core.membership.membership.members.clone(),
            members_after_consensus: Some(members.clone()),
        };
        let existing: BTreeSet<NodeId> = self.core.peers.keys().cloned().collect();
        let entry = match self.append_membership_log(joint).await {
            Ok(entry) => entry,
            Err(err) => {
                tracing::error!(error=%err, "error appending joint configuration");
                let _ = tx.send(Err(ClientError::PersistError));
                return;
            }
        };

        // Replicators for incoming peers were spawned by the membership update; activate
        // them so they start catching the new nodes up, by entries or by snapshot.
        for (target, peer) in self.core.peers.iter() {
            if existing.contains(target) {
                continue;
            }
            tracing::debug!(target, "activating replicator for incoming peer");
            let _ = peer.repl_tx.send(PeerDirective::Activate {
                term: self.core.current_term,
                last_log: self.core.last_log_id,
                commit_index: self.core.commit_index,
            });
        }

        self.member_change = Some(MemberChangeState {
            target_members: members,
            stage: ChangeStage::Joint {
                joint_index: entry.log_id.index,
            },
            tx: Some(tx),
        });
        self.set_phase(LeaderPhase::MemberChange);

        // In a cluster where this node is the only voter the joint entry has already
        // committed; drive the protocol forward immediately.
        if let Err(err) = self.step_member_change().await {
            tracing::error!(error=%err, "error stepping membership change");
        }
    }

    /// Record an inherited joint configuration so that it gets driven to completion.
    ///
    /// A leader elected while the cluster sits in joint consensus must finish the change a
    /// deposed leader started (§6).
    pub(super) fn resume_inherited_member_change(&mut self) {
        let membership = &self.core.membership;
        if let Some(targets) = &membership.membership.members_after_consensus {
            tracing::info!("resuming membership change inherited in joint consensus");
            self.member_change = Some(MemberChangeState {
                target_members: targets.clone(),
                stage: ChangeStage::Joint {
                    joint_index: membership.log_id.index,
                },
                tx: None,
            });
        }
    }

    /// Advance the membership change protocol as far as the current commit index allows.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) async fn step_member_change(&mut self) -> RaftResult<()> {
        loop {
            let action = match &self.member_change {
                None => return Ok(()),
                Some(change) => match change.stage {
                    ChangeStage::Joint { joint_index } if self.core.commit_index >= joint_index => {
                        StepAction::AppendFinal(change.target_members.clone())
                    }
                    ChangeStage::Uniform { final_index } if self.core.commit_index >= final_index => StepAction::Finish,
                    _ => return Ok(()),
                },
            };
            match action {
                StepAction::AppendFinal(target_members) => {
                    // Phase two: the joint entry has committed; append the final uniform
                    // configuration.
                    self.set_phase(LeaderPhase::MemberChange);
                    let final_config = MembershipConfig {
                        members: target_members,
                        members_after_consensus: None,
                    };
                    let entry = self.append_membership_log(final_config).await?;
                    if let Some(change) = self.member_change.as_mut() {
                        change.stage = ChangeStage::Uniform {
                            final_index: entry.log_id.index,
                        };
                    }
                    // Loop: with no other voters the final entry has already committed.
                }
                StepAction::Finish => {
                    self.finish_member_change();
                    return Ok(());
                }
            }
        }
    }

    /// Append a configuration entry to the log, making it the active configuration, and start
    /// replicating it.
    #[tracing::instrument(level = "debug", skip(self, membership))]
    pub(super) async fn append_membership_log(&mut self, membership: MembershipConfig) -> RaftResult<Entry<D>> {
        let entry = self
            .append_payload_to_log(EntryPayload::ConfigChange(EntryConfigChange {
                membership: membership.clone(),
            }))
            .await?;
        self.core
            .storage
            .push_config(entry.log_id.index, &membership)
            .await
            .map_err(|err| self.core.map_fatal_storage_error(err))?;
        // The new configuration takes effect on append, not on commit.
        self.core.update_membership(ActiveMembership {
            log_id: entry.log_id,
            membership,
        });
        let cr_entry = ClientRequestEntry {
            entry: Arc::new(entry.clone()),
            tx: ResponseSink::None,
        };
        self.replicate_client_request(cr_entry).await?;
        Ok(entry)
    }

    /// Wrap up a completed membership change: tear down the replicators of removed peers,
    /// resolve the proposing client and return to steady-state leadership.
    #[tracing::instrument(level = "debug", skip(self))]
    fn finish_member_change(&mut self) {
        let change = match self.member_change.take() {
            Some(change) => change,
            None => return,
        };
        // The configuration entry removing the departed peers has committed; their
        // replicators may now be destroyed.
        self.core.prune_stale_peers();
        let all = self.core.membership.membership.all_nodes();
        self.matched.retain(|id, _| all.contains(id));

        if let Some(tx) = change.tx {
            let _ = tx.send(Ok(self.core.membership.membership.clone()));
        }
        self.set_phase(LeaderPhase::Sync);

        // A leader which removed itself hands leadership off by stepping down.
        if !self.core.membership.membership.contains(&self.core.id) {
            tracing::info!("leader is not part of the new configuration, stepping down");
            self.core.set_target_state(State::Follower);
            self.core.update_current_leader(UpdateCurrentLeader::Unknown);
        }
    }
}
