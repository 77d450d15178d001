mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use fixtures::{expect_notification, next_notification, UnreachableNetwork, VotingOnlyNetwork};
use maplit::btreeset;
use raftbus::raft::{AppendEntriesRequest, ClientWriteRequest};
use raftbus::testing::{ClientRequest, MemStore};
use raftbus::{ClientError, Config, LeaderPhase, LogId, Notification, Raft, State};

const WAIT: Duration = Duration::from_secs(5);

fn election_config() -> Result<Arc<Config>> {
    Ok(Arc::new(
        Config::build("test").heartbeat_timeout(50).election_timeout(200).validate()?,
    ))
}

/// A node partitioned from its two peers times out, becomes candidate for term 1, and keeps
/// campaigning with fresh terms while it gathers no votes.
///
/// Expected notification order per round: the election timeout first, then the state
/// transition, then the term change.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn follower_election_timeout_starts_campaign() -> Result<()> {
    fixtures::init_tracing();
    let store = Arc::new(MemStore::new_with_members(0, btreeset![0, 1, 2]));
    let node: fixtures::ScriptedRaft<UnreachableNetwork> =
        Raft::new(0, election_config()?, Arc::new(UnreachableNetwork), store);
    let mut notes = node.notifications().await.expect("first take of the notification stream");

    // First round: follower -> candidate.
    assert_eq!(next_notification(&mut notes, WAIT).await?, Notification::ElectionTimeout);
    assert_eq!(
        next_notification(&mut notes, WAIT).await?,
        Notification::StateChange {
            old: State::Follower,
            new: State::Candidate
        }
    );
    assert_eq!(next_notification(&mut notes, WAIT).await?, Notification::TermChange { old: 0, new: 1 });

    // Second round: no votes arrived, so the candidate starts over with a fresh term.
    assert_eq!(next_notification(&mut notes, WAIT).await?, Notification::ElectionTimeout);
    assert_eq!(next_notification(&mut notes, WAIT).await?, Notification::TermChange { old: 1, new: 2 });

    let metrics = node.wait(Some(WAIT)).term(2, "second campaign round").await?;
    assert_eq!(metrics.state, State::Candidate);
    assert_eq!(metrics.current_leader, None);

    node.shutdown().await?;
    Ok(())
}

/// A candidate which gathers votes from its peers transitions to leader, but stays in the
/// unsync phase until the blank entry of its term commits, which it never does here as the
/// peers refuse all entries.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn candidate_wins_election_into_unsync() -> Result<()> {
    fixtures::init_tracing();
    let store = Arc::new(MemStore::new_with_members(0, btreeset![0, 1, 2]));
    let node: fixtures::ScriptedRaft<VotingOnlyNetwork> =
        Raft::new(0, election_config()?, Arc::new(VotingOnlyNetwork), store);
    let mut notes = node.notifications().await.expect("first take of the notification stream");

    node.wait(Some(WAIT)).state(State::Leader, "candidate wins").await?;
    let metrics = node.wait(Some(WAIT)).leader_phase(LeaderPhase::Unsync, "unsync leader").await?;
    assert_eq!(metrics.current_leader, Some(0));

    // The causal chain of the victory, in order.
    expect_notification(&mut notes, WAIT, "election timeout", |n| n == &Notification::ElectionTimeout).await?;
    expect_notification(&mut notes, WAIT, "follower -> candidate", |n| {
        n == &Notification::StateChange {
            old: State::Follower,
            new: State::Candidate,
        }
    })
    .await?;
    expect_notification(&mut notes, WAIT, "candidate -> leader", |n| {
        n == &Notification::StateChange {
            old: State::Candidate,
            new: State::Leader,
        }
    })
    .await?;
    expect_notification(&mut notes, WAIT, "leader change to self", |n| {
        n == &Notification::LeaderChange { leader: Some(0) }
    })
    .await?;

    // Linearizable operations are deferred while unsync.
    let res = node
        .client_write(ClientWriteRequest::new(ClientRequest {
            client: "c0".into(),
            serial: 0,
            status: "x".into(),
        }))
        .await;
    assert!(matches!(res, Err(ClientError::LeaderUnsync)), "expected LeaderUnsync");

    node.shutdown().await?;
    Ok(())
}

/// A candidate receiving AppendEntries with a higher term concedes: it answers with success,
/// becomes a follower of the new term and records the sender as leader, clearing its own vote.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn candidate_concedes_to_higher_term_append_entries() -> Result<()> {
    fixtures::init_tracing();
    let store = Arc::new(MemStore::new_with_members(0, btreeset![0, 1, 2]));
    let node: fixtures::ScriptedRaft<UnreachableNetwork> =
        Raft::new(0, election_config()?, Arc::new(UnreachableNetwork), store.clone());
    let mut notes = node.notifications().await.expect("first take of the notification stream");

    node.wait(Some(WAIT)).state(State::Candidate, "campaigning").await?;

    let resp = node
        .append_entries(AppendEntriesRequest {
            term: 10,
            leader_id: 1,
            prev_log_id: LogId::new(0, 0),
            entries: vec![],
            leader_commit: 0,
        })
        .await?;
    assert!(resp.success);
    assert_eq!(resp.term, 10);
    assert_eq!(resp.last_log_index, 0);

    expect_notification(&mut notes, WAIT, "candidate -> follower", |n| {
        n == &Notification::StateChange {
            old: State::Candidate,
            new: State::Follower,
        }
    })
    .await?;
    expect_notification(&mut notes, WAIT, "term change to 10", |n| {
        matches!(n, Notification::TermChange { new: 10, .. })
    })
    .await?;
    expect_notification(&mut notes, WAIT, "leader change to node 1", |n| {
        n == &Notification::LeaderChange { leader: Some(1) }
    })
    .await?;

    let metrics = node.metrics().borrow().clone();
    assert_eq!(metrics.state, State::Follower);
    assert_eq!(metrics.current_term, 10);
    assert_eq!(metrics.current_leader, Some(1));

    // Adopting the higher term cleared the vote this node had cast for itself.
    let hs = store.read_hard_state().await.expect("hard state must exist");
    assert_eq!(hs.current_term, 10);
    assert_eq!(hs.voted_for, None);

    node.shutdown().await?;
    Ok(())
}

/// A candidate knows no leader, so client requests are rejected outright and leave no trace
/// in the log.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn candidate_rejects_client_requests() -> Result<()> {
    fixtures::init_tracing();
    let store = Arc::new(MemStore::new_with_members(0, btreeset![0, 1, 2]));
    let node: fixtures::ScriptedRaft<UnreachableNetwork> =
        Raft::new(0, election_config()?, Arc::new(UnreachableNetwork), store.clone());

    node.wait(Some(WAIT)).state(State::Candidate, "campaigning").await?;

    let res = node
        .client_write(ClientWriteRequest::new(ClientRequest {
            client: "c0".into(),
            serial: 0,
            status: "x".into(),
        }))
        .await;
    assert!(matches!(res, Err(ClientError::LeaderUnknown)), "expected LeaderUnknown");

    let res = node.client_read().await;
    assert!(matches!(res, Err(ClientError::LeaderUnknown)), "expected LeaderUnknown");

    assert!(store.get_log().await.is_empty(), "a rejected request must not touch the log");

    node.shutdown().await?;
    Ok(())
}
