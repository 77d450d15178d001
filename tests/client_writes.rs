mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use fixtures::{expect_notification, RaftRouter, UnreachableNetwork};
use maplit::btreeset;
use raftbus::raft::ClientWriteRequest;
use raftbus::testing::{ClientRequest, MemStore};
use raftbus::{ClientError, Config, LeaderPhase, Notification, Raft};

const WAIT: Duration = Duration::from_secs(5);

/// A single-member cluster elects itself, commits on its own appends, and resolves each write
/// with the state machine's response. Commit and apply notifications fire for every index.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_voter_commits_and_applies() -> Result<()> {
    fixtures::init_tracing();
    let config = Arc::new(Config::build("test").election_timeout(200).validate()?);
    let store = Arc::new(MemStore::new_with_members(0, btreeset![0]));
    let node: fixtures::ScriptedRaft<UnreachableNetwork> =
        Raft::new(0, config, Arc::new(UnreachableNetwork), store.clone());
    let mut notes = node.notifications().await.expect("notification stream");

    node.wait(Some(WAIT)).leader_phase(LeaderPhase::Sync, "self-elected leader").await?;

    // The blank entry of the new term sits at index 1 and has already committed and applied.
    expect_notification(&mut notes, WAIT, "noop commit", |n| {
        matches!(n, Notification::Commit { index: 1, .. })
    })
    .await?;
    expect_notification(&mut notes, WAIT, "noop apply", |n| {
        matches!(n, Notification::Apply { index: 1, .. })
    })
    .await?;

    // First write lands at index 2; the client never wrote before, so no previous status.
    let res = node
        .client_write(ClientWriteRequest::new(ClientRequest {
            client: "c0".into(),
            serial: 1,
            status: "alpha".into(),
        }))
        .await?;
    assert_eq!(res.log_id.index, 2);
    assert_eq!(res.data.0, None);
    expect_notification(&mut notes, WAIT, "write commit", |n| {
        matches!(n, Notification::Commit { index: 2, .. })
    })
    .await?;
    expect_notification(&mut notes, WAIT, "write apply", |n| {
        matches!(n, Notification::Apply { index: 2, .. })
    })
    .await?;

    // Second write by the same client observes the previous status.
    let res = node
        .client_write(ClientWriteRequest::new(ClientRequest {
            client: "c0".into(),
            serial: 2,
            status: "beta".into(),
        }))
        .await?;
    assert_eq!(res.log_id.index, 3);
    assert_eq!(res.data.0.as_deref(), Some("alpha"));

    let sm = store.get_state_machine().await;
    assert_eq!(sm.client_status.get("c0").map(String::as_str), Some("beta"));
    assert_eq!(sm.last_applied_log, 3);

    // A barrier fences everything appended before it.
    let log_id = node.client_barrier().await?;
    assert_eq!(log_id.index, 4);

    node.shutdown().await?;
    Ok(())
}

/// Writes against a three-node cluster replicate to every member and leave all state machines
/// identical.
#[tokio::test(flavor = "multi_thread", worker_threads = 6)]
async fn cluster_writes_replicate_to_all_members() -> Result<()> {
    fixtures::init_tracing();
    let config = Arc::new(Config::build("test").heartbeat_timeout(50).election_timeout(300).validate()?);
    let router = Arc::new(RaftRouter::new(config));
    let all = btreeset![0, 1, 2];
    for id in all.iter() {
        router.new_raft_node(*id, all.clone()).await;
    }

    let leader = router.wait_for_sync_leader(Duration::from_secs(10)).await?;

    // The noop of the leader's term occupies index 1; ten writes follow.
    let mut last_index = 1;
    for serial in 1..=10u64 {
        let res = router
            .client_write(leader, &format!("client-{}", serial % 3), serial, &format!("status-{}", serial))
            .await?;
        assert_eq!(res.log_id.index, last_index + 1, "responses must arrive in log order");
        last_index = res.log_id.index;
    }

    router.wait_for_applied(&all, last_index, Duration::from_secs(10), "all nodes applied").await?;

    let reference = router.store(leader).await.expect("leader store").get_state_machine().await;
    for id in all.iter() {
        let sm = router.store(*id).await.expect("node store").get_state_machine().await;
        assert_eq!(sm.client_status, reference.client_status, "state machine of node {} diverged", id);
        assert_eq!(sm.last_applied_log, last_index);
    }

    // Writes against a follower are redirected to the leader.
    let follower = all.iter().find(|id| **id != leader).copied().expect("a follower exists");
    let res = router.client_write(follower, "c", 99, "x").await;
    let err = res.expect_err("follower must not accept writes");
    let client_err = err.downcast::<ClientError>()?;
    assert!(
        matches!(&client_err, ClientError::LeaderRedirect(l) if *l == leader),
        "expected redirect to {}, got {}",
        leader,
        client_err,
    );

    Ok(())
}
