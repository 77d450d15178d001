use std::sync::Arc;

use anyhow::anyhow;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use tokio::time::{timeout, Duration};

use crate::core::{LeaderPhase, LeaderState, State, UpdateCurrentLeader};
use crate::error::{ClientError, RaftError, RaftResult};
use crate::notify::Notification;
use crate::quorum;
use crate::raft::{
    AppendEntriesRequest, BarrierResponseTx, ClientReadResponseTx, ClientWriteRequest, ClientWriteResponse,
    ClientWriteResponseTx, Entry, EntryPayload,
};
use crate::replication::PeerDirective;
use crate::{AppData, AppDataResponse, LogId, RaftNetwork, RaftStorage};

/// A client request which has been transformed into a log entry, along with its response sink.
pub(super) struct ClientRequestEntry<D: AppData, R: AppDataResponse> {
    /// The Arc'd entry of the request, shared with the replicators without cloning the
    /// payload itself.
    pub entry: Arc<Entry<D>>,
    /// The response sink of the request.
    pub tx: ResponseSink<R>,
}

/// The response channel of an inflight entry, if any.
pub(super) enum ResponseSink<R: AppDataResponse> {
    /// No caller is waiting; used for the leader's blank entry and configuration entries.
    None,
    /// A client write awaiting the state machine's response data.
    Write(ClientWriteResponseTx<R>),
    /// A barrier awaiting commitment.
    Barrier(BarrierResponseTx),
}

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, S: RaftStorage<D, R>> LeaderState<'a, D, R, N, S> {
    /// Commit the initial entry which new leaders are obligated to create when first coming to
    /// power, per §8.
    ///
    /// Committing this blank entry is what safely commits any entries left over from prior
    /// terms, and is what moves the leader out of its unsync phase.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) async fn commit_initial_leader_entry(&mut self) -> RaftResult<()> {
        let entry = self.append_payload_to_log(EntryPayload::Blank).await?;
        self.noop_index = entry.log_id.index;
        let cr_entry = ClientRequestEntry {
            entry: Arc::new(entry),
            tx: ResponseSink::None,
        };
        self.replicate_client_request(cr_entry).await?;
        self.core.report_metrics();
        Ok(())
    }

    /// Handle a client write request appearing on the leader.
    #[tracing::instrument(level = "trace", skip(self, rpc, tx))]
    pub(super) async fn handle_client_write_request(&mut self, rpc: ClientWriteRequest<D>, tx: ClientWriteResponseTx<R>) {
        if self.core.leader_phase == Some(LeaderPhase::Unsync) {
            let _ = tx.send(Err(ClientError::LeaderUnsync));
            return;
        }
        let entry = match self.append_payload_to_log(rpc.entry).await {
            Ok(entry) => entry,
            Err(err) => {
                tracing::error!(error=%err, "error appending client write to log");
                let _ = tx.send(Err(ClientError::PersistError));
                return;
            }
        };
        let cr_entry = ClientRequestEntry {
            entry: Arc::new(entry),
            tx: ResponseSink::Write(tx),
        };
        if let Err(err) = self.replicate_client_request(cr_entry).await {
            tracing::error!(error=%err, "error replicating client write");
        }
    }

    /// Handle a client barrier request appearing on the leader.
    #[tracing::instrument(level = "trace", skip(self, tx))]
    pub(super) async fn handle_client_barrier_request(&mut self, tx: BarrierResponseTx) {
        if self.core.leader_phase == Some(LeaderPhase::Unsync) {
            let _ = tx.send(Err(ClientError::LeaderUnsync));
            return;
        }
        let entry = match self.append_payload_to_log(EntryPayload::Barrier).await {
            Ok(entry) => entry,
            Err(err) => {
                tracing::error!(error=%err, "error appending barrier to log");
                let _ = tx.send(Err(ClientError::PersistError));
                return;
            }
        };
        let cr_entry = ClientRequestEntry {
            entry: Arc::new(entry),
            tx: ResponseSink::Barrier(tx),
        };
        if let Err(err) = self.replicate_client_request(cr_entry).await {
            tracing::error!(error=%err, "error replicating barrier");
        }
    }

    /// Handle a client read request.
    ///
    /// From the spec (§8): a leader must check whether it has been deposed before processing a
    /// read-only request. This is handled by exchanging a heartbeat with a majority of the
    /// cluster (a joint majority during a membership change) before responding.
    #[tracing::instrument(level = "trace", skip(self, tx))]
    pub(super) async fn handle_client_read_request(&mut self, tx: ClientReadResponseTx) {
        if self.core.leader_phase == Some(LeaderPhase::Unsync) {
            let _ = tx.send(Err(ClientError::LeaderUnsync));
            return;
        }

        let membership = self.core.membership.membership.clone();
        let mut c0_confirmed = membership.members.contains(&self.core.id) as usize;
        let c0_needed = quorum::majority_of(membership.members.len());
        let mut c1_confirmed = 0usize;
        let mut c1_needed = 0usize;
        if let Some(joint) = &membership.members_after_consensus {
            c1_confirmed = joint.contains(&self.core.id) as usize;
            c1_needed = quorum::majority_of(joint.len());
        }

        // A single-node cluster needs no confirmation round.
        if c0_confirmed >= c0_needed && c1_confirmed >= c1_needed {
            let _ = tx.send(Ok(()));
            return;
        }

        // Spawn parallel heartbeats, all with the standard heartbeat timeout.
        let mut pending = FuturesUnordered::new();
        for target in membership.all_nodes() {
            if target == self.core.id {
                continue;
            }
            let rpc = AppendEntriesRequest {
                term: self.core.current_term,
                leader_id: self.core.id,
                prev_log_id: self.matched.get(&target).copied().unwrap_or_default(),
                entries: vec![],
                leader_commit: self.core.commit_index,
            };
            let network = self.core.network.clone();
            let ttl = Duration::from_millis(self.core.config.heartbeat_timeout);
            pending.push(async move {
                match timeout(ttl, network.append_entries(target, rpc)).await {
                    Ok(Ok(resp)) => Ok((target, resp)),
                    Ok(Err(err)) => Err((target, err)),
                    Err(_) => Err((target, anyhow!("timeout waiting for leadership confirmation"))),
                }
            });
        }

        // Handle responses as they return.
        let mut confirmed = false;
        let mut deposed = false;
        while let Some(res) = pending.next().await {
            let (target, data) = match res {
                Ok(inner) => inner,
                Err((target, err)) => {
                    tracing::warn!(target, error=%err, "heartbeat failed while confirming leadership for read");
                    continue;
                }
            };

            // A response carrying a greater term deposes this leader; abort the read.
            if data.term > self.core.current_term {
                self.core.update_current_term(data.term, None);
                self.core.update_current_leader(UpdateCurrentLeader::Unknown);
                self.core.set_target_state(State::Follower);
                let _ = self.core.save_hard_state().await;
                deposed = true;
                break;
            }

            if membership.members.contains(&target) {
                c0_confirmed += 1;
            }
            if membership
                .members_after_consensus
                .as_ref()
                .map(|members| members.contains(&target))
                .unwrap_or(false)
            {
                c1_confirmed += 1;
            }
            if c0_confirmed >= c0_needed && c1_confirmed >= c1_needed {
                confirmed = true;
                break;
            }
        }

        let res = if confirmed {
            Ok(())
        } else if deposed {
            Err(self.core.client_reject_error())
        } else {
            Err(ClientError::Raft(RaftError::RaftNetwork(anyhow!(
                "too many requests failed, could not confirm leadership"
            ))))
        };
        let _ = tx.send(res);
    }

    /// Transform the given payload into an entry, assign it an index and the current term, and
    /// append it to the log.
    #[tracing::instrument(level = "trace", skip(self, payload))]
    pub(super) async fn append_payload_to_log(&mut self, payload: EntryPayload<D>) -> RaftResult<Entry<D>> {
        let entry = Entry {
            log_id: LogId::new(self.core.current_term, self.core.last_log_id.index + 1),
            payload,
        };
        self.core
            .storage
            .append_to_log(std::slice::from_ref(&entry))
            .await
            .map_err(|err| self.core.map_fatal_storage_error(err))?;
        self.core.last_log_id = entry.log_id;
        Ok(entry)
    }

    /// Begin the process of replicating the given request.
    ///
    /// This does not wait for the request to finish replication: the entry joins the inflight
    /// table and its response is generated once the entry commits.
    #[tracing::instrument(level = "trace", skip(self, req))]
    pub(super) async fn replicate_client_request(&mut self, req: ClientRequestEntry<D, R>) -> RaftResult<()> {
        let entry = req.entry.clone();
        self.awaiting_committed.push(req);
        self.core.broadcast_peer_directive(PeerDirective::Replicate {
            entry,
            commit_index: self.core.commit_index,
        });
        // A lone voter commits on its own append; with peers this is a no-op until their
        // acknowledgements arrive.
        self.recompute_commit().await
    }

    /// Handle the post-commit logic for an inflight entry.
    #[tracing::instrument(level = "trace", skip(self, req))]
    pub(super) async fn client_request_post_commit(&mut self, req: ClientRequestEntry<D, R>) {
        match req.tx {
            ResponseSink::Write(tx) => match &req.entry.payload {
                EntryPayload::Normal(inner) => {
                    match self.apply_entry_to_state_machine(req.entry.log_id, &inner.data).await {
                        Ok(data) => {
                            let _ = tx.send(Ok(ClientWriteResponse {
                                log_id: req.entry.log_id,
                                data,
                            }));
                        }
                        Err(err) => {
                            tracing::error!(error=%err, "error applying client write to state machine");
                            let _ = tx.send(Err(ClientError::PersistError));
                        }
                    }
                }
                _ => {
                    // Only normal entries are ever bound to a write sink; anything else here
                    // is a bug upstream in this module.
                    tracing::error!("non-normal payload bound to a client write sink");
                    let _ = tx.send(Err(ClientError::Raft(RaftError::ShuttingDown)));
                    self.core.set_target_state(State::Shutdown);
                }
            },
            ResponseSink::Barrier(tx) => {
                if let Err(err) = self.advance_applied_through(&req.entry).await {
                    tracing::error!(error=%err, "error advancing applied cursor through barrier");
                    let _ = tx.send(Err(ClientError::PersistError));
                } else {
                    let _ = tx.send(Ok(req.entry.log_id));
                }
            }
            ResponseSink::None => {
                if let Err(err) = self.advance_applied_through(&req.entry).await {
                    tracing::error!(error=%err, "error advancing applied cursor");
                }
            }
        }
        self.core.trigger_log_compaction_if_needed(false);
    }

    /// Apply the given committed entry to the state machine, returning its response data.
    ///
    /// Any outstanding committed entries preceding this one are applied first; that only comes
    /// up when a new leader carries unapplied entries from before its term.
    #[tracing::instrument(level = "trace", skip(self, data))]
    pub(super) async fn apply_entry_to_state_machine(&mut self, log_id: LogId, data: &D) -> RaftResult<R> {
        let index = log_id.index;
        let expected_next = self.core.last_applied + 1;
        if index != expected_next {
            let entries = self
                .core
                .storage
                .get_log_entries(expected_next, index)
                .await
                .map_err(|err| self.core.map_fatal_storage_error(err))?;
            for entry in entries {
                if let EntryPayload::Normal(inner) = &entry.payload {
                    self.core
                        .storage
                        .apply_to_state_machine(entry.log_id.index, &inner.data)
                        .await
                        .map_err(|err| self.core.map_fatal_storage_error(err))?;
                }
                self.core.last_applied = entry.log_id.index;
                self.core.notifier.notify(Notification::Apply {
                    term: entry.log_id.term,
                    index: entry.log_id.index,
                });
            }
        }

        let res = self
            .core
            .storage
            .apply_to_state_machine(index, data)
            .await
            .map_err(|err| self.core.map_fatal_storage_error(err))?;
        self.core.last_applied = index;
        self.core.notifier.notify(Notification::Apply { term: log_id.term, index });
        self.core
            .storage
            .save_applied_index(index)
            .await
            .map_err(|err| self.core.map_fatal_storage_error(err))?;
        self.core.report_metrics();
        Ok(res)
    }

    /// Advance the applied cursor through the given committed entry, applying any normal
    /// entries on the way.
    #[tracing::instrument(level = "trace", skip(self, entry))]
    pub(super) async fn advance_applied_through(&mut self, entry: &Entry<D>) -> RaftResult<()> {
        let stop = entry.log_id.index;
        if self.core.last_applied >= stop {
            return Ok(());
        }
        let entries = self
            .core
            .storage
            .get_log_entries(self.core.last_applied + 1, stop + 1)
            .await
            .map_err(|err| self.core.map_fatal_storage_error(err))?;
        for entry in entries {
            if let EntryPayload::Normal(inner) = &entry.payload {
                self.core
                    .storage
                    .apply_to_state_machine(entry.log_id.index, &inner.data)
                    .await
                    .map_err(|err| self.core.map_fatal_storage_error(err))?;
            }
            self.core.last_applied = entry.log_id.index;
            self.core.notifier.notify(Notification::Apply {
                term: entry.log_id.term,
                index: entry.log_id.index,
            });
        }
        self.core
            .storage
            .save_applied_index(self.core.last_applied)
            .await
            .map_err(|err| self.core.map_fatal_storage_error(err))?;
        self.core.report_metrics();
        Ok(())
    }
}
