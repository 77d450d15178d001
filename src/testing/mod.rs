//! An in-memory storage system for demo and testing purposes.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::raft::{ActiveMembership, Entry, MembershipConfig};
use crate::storage::{HardState, InitialState, RaftStorage, Snapshot, SnapshotMeta};
use crate::{AppData, AppDataResponse, LogId, NodeId};

/// The application data type which the `MemStore` works with.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClientRequest {
    /// The ID of the client which sent the request.
    pub client: String,
    /// The serial number of this request.
    pub serial: u64,
    /// A string describing the status of the client.
    pub status: String,
}

impl AppData for ClientRequest {}

/// The application response type which the `MemStore` works with.
///
/// Carries the previously recorded status of the request's client, if any.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClientResponse(pub Option<String>);

impl AppDataResponse for ClientResponse {}

/// The state machine of the `MemStore`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MemStoreStateMachine {
    pub last_applied_log: u64,
    /// A mapping of client IDs to their last serial and the response it produced, used to
    /// keep re-applied requests idempotent.
    pub client_serial_responses: HashMap<String, (u64, Option<String>)>,
    /// A mapping of client IDs to their current status.
    pub client_status: HashMap<String, String>,
}

/// A complete snapshot blob with its metadata.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MemStoreSnapshot {
    pub meta: SnapshotMeta,
    pub data: Vec<u8>,
}

/// An in-memory implementation of the `RaftStorage` trait.
pub struct MemStore {
    id: NodeId,
    log: RwLock<BTreeMap<u64, Entry<ClientRequest>>>,
    sm: RwLock<MemStoreStateMachine>,
    hs: RwLock<Option<HardState>>,
    committed: RwLock<u64>,
    applied: RwLock<u64>,
    configs: RwLock<BTreeMap<u64, MembershipConfig>>,
    snapshot: RwLock<Option<MemStoreSnapshot>>,
    installing: RwLock<Option<(String, Vec<u8>)>>,
    snapshot_seq: AtomicU64,
    fail: AtomicBool,
}

impl MemStore {
    /// Create a new pristine `MemStore` for the node with the given ID.
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            log: RwLock::new(BTreeMap::new()),
            sm: RwLock::new(MemStoreStateMachine::default()),
            hs: RwLock::new(None),
            committed: RwLock::new(0),
            applied: RwLock::new(0),
            configs: RwLock::new(BTreeMap::new()),
            snapshot: RwLock::new(None),
            installing: RwLock::new(None),
            snapshot_seq: AtomicU64::new(0),
            fail: AtomicBool::new(false),
        }
    }

    /// Create a new `MemStore` seeded with the given cluster membership, recorded at index 0.
    pub fn new_with_members(id: NodeId, members: BTreeSet<NodeId>) -> Self {
        let this = Self::new(id);
        let membership = MembershipConfig {
            members,
            members_after_consensus: None,
        };
        let mut configs = BTreeMap::new();
        configs.insert(0, membership);
        Self {
            configs: RwLock::new(configs),
            ..this
        }
    }

    /// Toggle the fault flag: while set, every storage operation fails.
    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    fn check_fail(&self) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            Err(anyhow!("simulated storage failure"))
        } else {
            Ok(())
        }
    }

    /// Get a full copy of the current log, for assertions.
    pub async fn get_log(&self) -> BTreeMap<u64, Entry<ClientRequest>> {
        self.log.read().await.clone()
    }

    /// Get a copy of the current state machine, for assertions.
    pub async fn get_state_machine(&self) -> MemStoreStateMachine {
        self.sm.read().await.clone()
    }

    /// Read the stored hard state, for assertions.
    pub async fn read_hard_state(&self) -> Option<HardState> {
        self.hs.read().await.clone()
    }

    async fn last_config_inner(&self) -> ActiveMembership {
        let configs = self.configs.read().await;
        let log = self.log.read().await;
        match configs.iter().next_back() {
            Some((index, membership)) => ActiveMembership {
                log_id: log.get(index).map(|e| e.log_id).unwrap_or(LogId::new(0, *index)),
                membership: membership.clone(),
            },
            None => ActiveMembership {
                log_id: LogId::default(),
                membership: MembershipConfig::new_initial(self.id),
            },
        }
    }
}

#[async_trait]
impl RaftStorage<ClientRequest, ClientResponse> for MemStore {
    async fn get_initial_state(&self) -> Result<InitialState> {
        self.check_fail()?;
        let membership = self.last_config_inner().await;
        let mut hs = self.hs.write().await;
        let log = self.log.read().await;
        let snapshot = self.snapshot.read().await;
        match &mut *hs {
            Some(inner) => {
                let snap_last = snapshot.as_ref().map(|s| s.meta.last_log_id).unwrap_or_default();
                let last_log_id = log.values().next_back().map(|e| e.log_id).unwrap_or(snap_last);
                let first_log_index = log.keys().next().copied().unwrap_or(snap_last.index + 1);
                Ok(InitialState {
                    last_log_id,
                    first_log_index,
                    committed_index: *self.committed.read().await,
                    last_applied: *self.applied.read().await,
                    hard_state: inner.clone(),
                    membership,
                })
            }
            None => {
                let mut new = InitialState::new_initial(self.id);
                new.membership = membership;
                *hs = Some(new.hard_state.clone());
                Ok(new)
            }
        }
    }

    async fn save_hard_state(&self, hs: &HardState) -> Result<()> {
        self.check_fail()?;
        *self.hs.write().await = Some(hs.clone());
        Ok(())
    }

    async fn first_log_index(&self) -> Result<u64> {
        self.check_fail()?;
        let log = self.log.read().await;
        match log.keys().next() {
            Some(first) => Ok(*first),
            None => {
                let snapshot = self.snapshot.read().await;
                Ok(snapshot.as_ref().map(|s| s.meta.last_log_id.index + 1).unwrap_or(1))
            }
        }
    }

    async fn get_log_entries(&self, start: u64, stop: u64) -> Result<Vec<Entry<ClientRequest>>> {
        self.check_fail()?;
        if start >= stop {
            return Ok(vec![]);
        }
        let log = self.log.read().await;
        Ok(log.range(start..stop).map(|(_, entry)| entry.clone()).collect())
    }

    async fn try_get_log_entry(&self, index: u64) -> Result<Option<Entry<ClientRequest>>> {
        self.check_fail()?;
        Ok(self.log.read().await.get(&index).cloned())
    }

    async fn append_to_log(&self, entries: &[Entry<ClientRequest>]) -> Result<()> {
        self.check_fail()?;
        let mut log = self.log.write().await;
        for entry in entries {
            log.insert(entry.log_id.index, entry.clone());
        }
        Ok(())
    }

    async fn truncate_log_after(&self, index: u64) -> Result<()> {
        self.check_fail()?;
        let mut log = self.log.write().await;
        log.split_off(&(index + 1));
        Ok(())
    }

    async fn save_committed_index(&self, index: u64) -> Result<()> {
        self.check_fail()?;
        *self.committed.write().await = index;
        Ok(())
    }

    async fn save_applied_index(&self, index: u64) -> Result<()> {
        self.check_fail()?;
        *self.applied.write().await = index;
        Ok(())
    }

    async fn last_config(&self) -> Result<ActiveMembership> {
        self.check_fail()?;
        Ok(self.last_config_inner().await)
    }

    async fn config_at(&self, index: u64) -> Result<MembershipConfig> {
        self.check_fail()?;
        let configs = self.configs.read().await;
        Ok(configs
            .range(..=index)
            .next_back()
            .map(|(_, m)| m.clone())
            .unwrap_or_else(|| MembershipConfig::new_initial(self.id)))
    }

    async fn push_config(&self, index: u64, membership: &MembershipConfig) -> Result<()> {
        self.check_fail()?;
        self.configs.write().await.insert(index, membership.clone());
        Ok(())
    }

    async fn truncate_configs_after(&self, index: u64) -> Result<()> {
        self.check_fail()?;
        let mut configs = self.configs.write().await;
        configs.split_off(&(index + 1));
        Ok(())
    }

    async fn apply_to_state_machine(&self, index: u64, data: &ClientRequest) -> Result<ClientResponse> {
        self.check_fail()?;
        let mut sm = self.sm.write().await;
        sm.last_applied_log = index;
        if let Some((serial, res)) = sm.client_serial_responses.get(&data.client) {
            if serial == &data.serial {
                return Ok(ClientResponse(res.clone()));
            }
        }
        let previous = sm.client_status.insert(data.client.clone(), data.status.clone());
        sm.client_serial_responses.insert(data.client.clone(), (data.serial, previous.clone()));
        Ok(ClientResponse(previous))
    }

    async fn build_snapshot(&self) -> Result<Snapshot> {
        self.check_fail()?;
        let (data, last_applied) = {
            let sm = self.sm.read().await;
            (serde_json::to_vec(&*sm)?, sm.last_applied_log)
        };
        let membership = self.config_at(last_applied).await?;
        let last_log_id = {
            let mut log = self.log.write().await;
            let last_log_id = log
                .get(&last_applied)
                .map(|e| e.log_id)
                .unwrap_or(LogId::new(0, last_applied));
            // Compact the covered prefix.
            *log = log.split_off(&(last_applied + 1));
            last_log_id
        };
        let seq = self.snapshot_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let meta = SnapshotMeta {
            id: format!("snapshot-{}", seq),
            last_log_id,
            membership,
        };
        let size = data.len() as u64;
        *self.snapshot.write().await = Some(MemStoreSnapshot { meta: meta.clone(), data });
        Ok(Snapshot { meta, size })
    }

    async fn current_snapshot(&self) -> Result<Option<Snapshot>> {
        self.check_fail()?;
        let snapshot = self.snapshot.read().await;
        Ok(snapshot.as_ref().map(|s| Snapshot {
            meta: s.meta.clone(),
            size: s.data.len() as u64,
        }))
    }

    async fn read_snapshot_chunk(&self, id: &str, offset: u64, len: u64) -> Result<Vec<u8>> {
        self.check_fail()?;
        let snapshot = self.snapshot.read().await;
        let snapshot = snapshot.as_ref().ok_or_else(|| anyhow!("no snapshot exists"))?;
        if snapshot.meta.id != id {
            return Err(anyhow!("snapshot {} is no longer available", id));
        }
        let start = offset as usize;
        if start > snapshot.data.len() {
            return Err(anyhow!("snapshot read beyond end of blob"));
        }
        let stop = std::cmp::min(start + len as usize, snapshot.data.len());
        Ok(snapshot.data[start..stop].to_vec())
    }

    async fn begin_snapshot_install(&self, id: &str) -> Result<()> {
        self.check_fail()?;
        *self.installing.write().await = Some((id.to_string(), Vec::new()));
        Ok(())
    }

    async fn write_snapshot_chunk(&self, id: &str, offset: u64, data: &[u8]) -> Result<()> {
        self.check_fail()?;
        let mut installing = self.installing.write().await;
        let (cur_id, buf) = installing
            .as_mut()
            .ok_or_else(|| anyhow!("no snapshot installation in progress"))?;
        if cur_id != id {
            return Err(anyhow!("snapshot id mismatch during installation"));
        }
        let offset = offset as usize;
        if offset > buf.len() {
            return Err(anyhow!("gap in snapshot chunk stream"));
        }
        buf.truncate(offset);
        buf.extend_from_slice(data);
        Ok(())
    }

    async fn finalize_snapshot_install(&self, meta: &SnapshotMeta) -> Result<()> {
        self.check_fail()?;
        let (id, data) = self
            .installing
            .write()
            .await
            .take()
            .ok_or_else(|| anyhow!("no snapshot installation in progress"))?;
        if id != meta.id {
            return Err(anyhow!("snapshot id mismatch during finalization"));
        }
        let sm: MemStoreStateMachine = serde_json::from_slice(&data)?;
        *self.sm.write().await = sm;
        // The received snapshot replaces the log wholesale; anything beyond it belongs to a
        // dead branch.
        self.log.write().await.clear();
        {
            let mut configs = self.configs.write().await;
            configs.clear();
            configs.insert(meta.last_log_id.index, meta.membership.clone());
        }
        *self.committed.write().await = meta.last_log_id.index;
        *self.applied.write().await = meta.last_log_id.index;
        *self.snapshot.write().await = Some(MemStoreSnapshot {
            meta: meta.clone(),
            data,
        });
        Ok(())
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////
// Unit Tests ////////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::{EntryNormal, EntryPayload};
    use maplit::btreeset;

    fn entry(term: u64, index: u64) -> Entry<ClientRequest> {
        Entry {
            log_id: LogId::new(term, index),
            payload: EntryPayload::Normal(EntryNormal {
                data: ClientRequest {
                    client: format!("client-{}", index),
                    serial: index,
                    status: format!("status-{}", index),
                },
            }),
        }
    }

    #[tokio::test]
    async fn test_log_view_semantics() -> Result<()> {
        let store = MemStore::new(0);
        assert_eq!(store.first_log_index().await?, 1);

        let entries: Vec<_> = (1..=5).map(|i| entry(1, i)).collect();
        store.append_to_log(&entries).await?;
        assert_eq!(store.first_log_index().await?, 1);
        assert_eq!(store.try_get_log_entry(3).await?.map(|e| e.log_id), Some(LogId::new(1, 3)));

        let range = store.get_log_entries(2, 4).await?;
        assert_eq!(range.len(), 2);
        assert_eq!(range[0].log_id.index, 2);
        assert_eq!(range[1].log_id.index, 3);

        store.truncate_log_after(3).await?;
        assert!(store.try_get_log_entry(4).await?.is_none());
        assert!(store.try_get_log_entry(3).await?.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_config_history_rolls_back_with_truncation() -> Result<()> {
        let store = MemStore::new_with_members(0, btreeset![0, 1, 2]);
        let joint = MembershipConfig {
            members: btreeset![0, 1, 2],
            members_after_consensus: Some(btreeset![0, 1, 3]),
        };
        store.push_config(7, &joint).await?;
        assert_eq!(store.last_config().await?.membership, joint);
        assert_eq!(store.config_at(6).await?.members, btreeset![0, 1, 2]);

        store.truncate_configs_after(6).await?;
        assert_eq!(store.last_config().await?.membership.members, btreeset![0, 1, 2]);
        assert!(!store.last_config().await?.membership.is_in_joint_consensus());
        Ok(())
    }

    #[tokio::test]
    async fn test_snapshot_round_trip() -> Result<()> {
        let source = MemStore::new_with_members(0, btreeset![0, 1]);
        let entries: Vec<_> = (1..=10).map(|i| entry(1, i)).collect();
        source.append_to_log(&entries).await?;
        for e in &entries {
            if let EntryPayload::Normal(normal) = &e.payload {
                source.apply_to_state_machine(e.log_id.index, &normal.data).await?;
            }
        }

        let snapshot = source.build_snapshot().await?;
        assert_eq!(snapshot.meta.last_log_id, LogId::new(1, 10));
        // The covered prefix is compacted away.
        assert_eq!(source.first_log_index().await?, 11);
        assert!(source.try_get_log_entry(5).await?.is_none());

        // Stream it into a second store in small chunks.
        let dest = MemStore::new(1);
        dest.begin_snapshot_install(&snapshot.meta.id).await?;
        let mut offset = 0u64;
        while offset < snapshot.size {
            let chunk = source.read_snapshot_chunk(&snapshot.meta.id, offset, 7).await?;
            dest.write_snapshot_chunk(&snapshot.meta.id, offset, &chunk).await?;
            offset += chunk.len() as u64;
        }
        dest.finalize_snapshot_install(&snapshot.meta).await?;

        let src_sm = source.get_state_machine().await;
        let dst_sm = dest.get_state_machine().await;
        assert_eq!(src_sm.client_status, dst_sm.client_status);
        assert_eq!(dst_sm.last_applied_log, 10);
        assert_eq!(dest.last_config().await?.membership.members, btreeset![0, 1]);
        Ok(())
    }

    #[tokio::test]
    async fn test_fault_toggle_fails_operations() -> Result<()> {
        let store = MemStore::new(0);
        store.set_fail(true);
        assert!(store.append_to_log(&[entry(1, 1)]).await.is_err());
        assert!(store.save_hard_state(&HardState::default()).await.is_err());
        store.set_fail(false);
        assert!(store.append_to_log(&[entry(1, 1)]).await.is_ok());
        Ok(())
    }
}
