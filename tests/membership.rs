mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use fixtures::RaftRouter;
use maplit::btreeset;
use raftbus::{ClientError, Config};

/// A two-phase membership change from `{0, 1, 2}` to `{0, 1, 3}`: the joint configuration
/// commits under both majorities, the final configuration follows, the incoming node is
/// brought up to speed and the outgoing node's replicator is torn down.
#[tokio::test(flavor = "multi_thread", worker_threads = 6)]
async fn change_membership_replaces_a_node() -> Result<()> {
    fixtures::init_tracing();
    let config = Arc::new(Config::build("test").heartbeat_timeout(50).election_timeout(300).validate()?);
    let router = Arc::new(RaftRouter::new(config));
    let initial = btreeset![0, 1, 2];
    for id in initial.iter() {
        router.new_raft_node(*id, initial.clone()).await;
    }

    let leader = router.wait_for_sync_leader(Duration::from_secs(10)).await?;

    // Seed some data so the new node has something to catch up on.
    for serial in 1..=5u64 {
        router.client_write(leader, "seed", serial, &format!("status-{}", serial)).await?;
    }

    // Node 3 comes online knowing the old cluster; it is passive until the configuration
    // naming it reaches its log.
    router.new_raft_node(3, initial.clone()).await;

    let leader_node = router.node(leader).await.expect("leader handle");
    let final_members = btreeset![0, 1, 3];
    let resolved = leader_node.change_config(final_members.clone()).await?;
    assert_eq!(resolved.members, final_members);
    assert!(!resolved.is_in_joint_consensus());

    // The leader settles back into steady-state with the uniform config active.
    let metrics = leader_node.metrics().borrow().clone();
    assert_eq!(metrics.membership_config.members, final_members);
    assert_eq!(metrics.membership_config.members_after_consensus, None);

    // The incoming node holds the full log and the final configuration.
    let last_index = leader_node.metrics().borrow().last_log_index;
    router.wait_for_applied(&btreeset![3], last_index, Duration::from_secs(10), "node 3 caught up").await?;
    let node3 = router.node(3).await.expect("node 3 handle");
    assert_eq!(node3.get_config().await?.members, final_members);

    let leader_sm = router.store(leader).await.expect("leader store").get_state_machine().await;
    let new_sm = router.store(3).await.expect("node 3 store").get_state_machine().await;
    assert_eq!(leader_sm.client_status, new_sm.client_status);

    // The cluster keeps serving writes under the new configuration.
    let res = router.client_write(leader, "after", 1, "ok").await?;
    assert!(res.log_id.index > last_index);

    Ok(())
}

/// Degenerate membership proposals are rejected before anything reaches the log.
#[tokio::test(flavor = "multi_thread", worker_threads = 6)]
async fn change_membership_rejects_empty_member_set() -> Result<()> {
    fixtures::init_tracing();
    let config = Arc::new(Config::build("test").heartbeat_timeout(50).election_timeout(300).validate()?);
    let router = Arc::new(RaftRouter::new(config));
    let initial = btreeset![0, 1, 2];
    for id in initial.iter() {
        router.new_raft_node(*id, initial.clone()).await;
    }

    let leader = router.wait_for_sync_leader(Duration::from_secs(10)).await?;
    let leader_node = router.node(leader).await.expect("leader handle");

    let res = leader_node.change_config(btreeset![]).await;
    assert!(matches!(res, Err(ClientError::InoperableConfig)), "expected InoperableConfig");

    // Followers refuse configuration changes outright.
    let follower = initial.iter().find(|id| **id != leader).copied().expect("a follower exists");
    let follower_node = router.node(follower).await.expect("follower handle");
    let res = follower_node.change_config(btreeset![0, 1]).await;
    assert!(
        matches!(res, Err(ClientError::LeaderRedirect(l)) if l == leader),
        "expected redirect to the leader"
    );

    Ok(())
}
