mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use fixtures::RaftRouter;
use maplit::btreeset;
use raftbus::{Config, RaftStorage, SnapshotPolicy};
use tokio::time::{sleep, Instant};

/// A peer whose required log prefix has been compacted away is brought up by a chunked
/// snapshot installation, then resumes ordinary replication from the snapshot boundary.
#[tokio::test(flavor = "multi_thread", worker_threads = 6)]
async fn lagging_peer_is_restored_via_snapshot() -> Result<()> {
    fixtures::init_tracing();
    let config = Arc::new(
        Config::build("test")
            .heartbeat_timeout(50)
            .election_timeout(300)
            .snapshot_policy(SnapshotPolicy::LogsSinceLast(10))
            // A small chunk size forces a multi-chunk stream.
            .max_snapshot_chunk_size(64)
            .validate()?,
    );
    let router = Arc::new(RaftRouter::new(config));
    let all = btreeset![0, 1, 2];

    // Nodes 0 and 1 form a working majority; node 2 stays offline for now.
    router.new_raft_node(0, all.clone()).await;
    router.new_raft_node(1, all.clone()).await;

    let leader = router.wait_for_sync_leader(Duration::from_secs(10)).await?;

    for serial in 1..=50u64 {
        router.client_write(leader, &format!("client-{}", serial), serial, "snapshotted").await?;
    }
    let last_index = router.node(leader).await.expect("leader handle").metrics().borrow().last_log_index;
    router.wait_for_applied(&btreeset![leader], last_index, Duration::from_secs(10), "leader applied").await?;

    // The compaction policy has kicked in by now; the head of the log is gone.
    let leader_store = router.store(leader).await.expect("leader store");
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if leader_store.first_log_index().await? > 1 {
            break;
        }
        if Instant::now() >= deadline {
            return Err(anyhow!("timed out waiting for log compaction on the leader"));
        }
        sleep(Duration::from_millis(50)).await;
    }

    // Node 2 comes online with an empty log; its required prefix no longer exists, so only a
    // snapshot can restore it.
    router.new_raft_node(2, all.clone()).await;
    router.wait_for_applied(&btreeset![2], last_index, Duration::from_secs(30), "node 2 restored").await?;

    let restored_store = router.store(2).await.expect("node 2 store");
    let leader_sm = leader_store.get_state_machine().await;
    let restored_sm = restored_store.get_state_machine().await;
    assert_eq!(leader_sm.client_status, restored_sm.client_status, "restored state machine diverged");

    // The restored node's log starts at the snapshot boundary, not at index 1.
    assert!(restored_store.first_log_index().await? > 1, "node 2 must have installed a snapshot");

    // Replication continues normally past the snapshot.
    let res = router.client_write(leader, "after-snapshot", 1, "ok").await?;
    router
        .wait_for_applied(&all, res.log_id.index, Duration::from_secs(10), "all nodes applied post-snapshot write")
        .await?;

    Ok(())
}
