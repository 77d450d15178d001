mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use fixtures::{expect_notification, UnreachableNetwork};
use maplit::btreeset;
use raftbus::raft::ClientWriteRequest;
use raftbus::testing::{ClientRequest, MemStore};
use raftbus::{ClientError, Config, LeaderPhase, Notification, Raft, State};

const WAIT: Duration = Duration::from_secs(5);

/// A storage failure is fatal: the node publishes a persist-error notification, parks itself
/// in the terminal state, and answers every further request with `PersistError`. Clearing the
/// fault does not revive it; only shutdown leaves the state.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn storage_failure_parks_the_node() -> Result<()> {
    fixtures::init_tracing();
    let config = Arc::new(
        Config::build("test")
            .election_timeout(200)
            .persist_error_notify_timeout(100)
            .validate()?,
    );
    let store = Arc::new(MemStore::new_with_members(0, btreeset![0]));
    let node: fixtures::ScriptedRaft<UnreachableNetwork> =
        Raft::new(0, config, Arc::new(UnreachableNetwork), store.clone());
    let mut notes = node.notifications().await.expect("notification stream");

    node.wait(Some(WAIT)).leader_phase(LeaderPhase::Sync, "self-elected leader").await?;

    store.set_fail(true);
    let res = node
        .client_write(ClientWriteRequest::new(ClientRequest {
            client: "c0".into(),
            serial: 1,
            status: "x".into(),
        }))
        .await;
    assert!(matches!(res, Err(ClientError::PersistError)), "expected PersistError on the failed write");

    expect_notification(&mut notes, WAIT, "persist error notification", |n| n == &Notification::PersistError).await?;
    node.wait(Some(WAIT)).state(State::PersistError, "terminal state").await?;

    // The terminal state re-announces itself periodically.
    expect_notification(&mut notes, WAIT, "re-notification", |n| n == &Notification::PersistError).await?;

    // Clearing the fault does not revive the node; recovery requires a restart.
    store.set_fail(false);
    let res = node
        .client_write(ClientWriteRequest::new(ClientRequest {
            client: "c0".into(),
            serial: 2,
            status: "y".into(),
        }))
        .await;
    assert!(matches!(res, Err(ClientError::PersistError)), "expected PersistError from the parked node");
    assert_eq!(node.metrics().borrow().state, State::PersistError);

    node.shutdown().await?;
    Ok(())
}
