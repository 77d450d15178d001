mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use fixtures::RaftRouter;
use maplit::btreeset;
use raftbus::{ClientError, Config, RaftError};

/// Shutting the leader down quiesces it completely; the survivors elect a replacement and the
/// cluster keeps serving writes. A handle to a stopped node answers every call with a
/// shutdown error.
#[tokio::test(flavor = "multi_thread", worker_threads = 6)]
async fn shutdown_leader_and_elect_replacement() -> Result<()> {
    fixtures::init_tracing();
    let config = Arc::new(Config::build("test").heartbeat_timeout(50).election_timeout(300).validate()?);
    let router = Arc::new(RaftRouter::new(config));
    let all = btreeset![0, 1, 2];
    for id in all.iter() {
        router.new_raft_node(*id, all.clone()).await;
    }

    let first_leader = router.wait_for_sync_leader(Duration::from_secs(10)).await?;
    router.client_write(first_leader, "c0", 1, "before").await?;

    // Take the leader out entirely.
    let (old_leader, _store) = router.remove_node(first_leader).await.expect("leader was registered");
    old_leader.shutdown().await?;

    // A stopped node rejects everything.
    let res = old_leader.client_read().await;
    assert!(
        matches!(res, Err(ClientError::Raft(RaftError::ShuttingDown))),
        "expected ShuttingDown from a stopped node"
    );

    // The survivors elect a replacement and keep accepting writes.
    let second_leader = router.wait_for_sync_leader(Duration::from_secs(10)).await?;
    assert_ne!(second_leader, first_leader);
    let res = router.client_write(second_leader, "c0", 2, "after").await?;
    assert!(res.log_id.index > 1);

    // Repeated shutdown is a no-op.
    old_leader.shutdown().await?;
    Ok(())
}
