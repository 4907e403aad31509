use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use common::random_str;
use rust_coord_utils::{
    election::{current_leader, subscribe_leader_ack, Candidate},
    watcher::DeliveryMode,
};

mod common;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn single_candidate_wins_and_publishes_its_ack() {
    let cluster = common::cluster();
    let conn = common::connect(&cluster).await;
    let election = random_str(10);

    let candidate = Candidate::new(conn.clone(), election.clone(), b"node-a".to_vec());
    let ready = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let ready2 = Arc::clone(&ready);
    candidate.on_winning(move || {
        ready2.store(true, std::sync::atomic::Ordering::Release);
    });
    candidate.register().await.expect("failed to register");

    let mut changes = candidate.leader_changes();
    tokio::time::timeout(Duration::from_secs(5), changes.wait_for(|leader| *leader))
        .await
        .expect("timed out waiting for leadership")
        .expect("leader channel closed");
    assert!(candidate.is_leader());
    // The winning hook ran before the announcement.
    assert!(ready.load(std::sync::atomic::Ordering::Acquire));

    let announced = current_leader(&conn, &election)
        .await
        .expect("failed to read ack");
    assert_eq!(announced.as_deref(), Some(&b"node-a"[..]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn leadership_passes_to_the_next_lowest_candidate() {
    let cluster = common::cluster();
    let election = random_str(10);

    // Votes are cast in registration order, which fixes the sequence order.
    let mut candidates = Vec::new();
    for name in ["a", "b", "c"] {
        let conn = common::connect(&cluster).await;
        let candidate = Candidate::new(conn, election.clone(), name.as_bytes().to_vec());
        candidate.register().await.expect("failed to register");
        candidates.push(candidate);
    }

    let mut first = candidates[0].leader_changes();
    tokio::time::timeout(Duration::from_secs(5), first.wait_for(|leader| *leader))
        .await
        .expect("timed out waiting for first leader")
        .expect("leader channel closed");
    assert!(candidates[0].is_leader());
    assert!(!candidates[1].is_leader());
    assert!(!candidates[2].is_leader());

    candidates[0].resign().await.expect("failed to resign");

    let mut resigned = candidates[0].leader_changes();
    tokio::time::timeout(Duration::from_secs(5), resigned.wait_for(|leader| !*leader))
        .await
        .expect("timed out waiting for resignation")
        .expect("leader channel closed");
    let mut second = candidates[1].leader_changes();
    tokio::time::timeout(Duration::from_secs(5), second.wait_for(|leader| *leader))
        .await
        .expect("timed out waiting for handover")
        .expect("leader channel closed");
    assert!(!candidates[0].is_leader());
    assert!(candidates[1].is_leader());
    assert!(!candidates[2].is_leader());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn leader_session_expiry_triggers_a_handover() {
    let cluster = common::cluster();
    let election = random_str(10);

    let leader_conn = common::connect(&cluster).await;
    let leader = Candidate::new(leader_conn.clone(), election.clone(), b"a".to_vec());
    leader.register().await.expect("failed to register leader");
    let mut first = leader.leader_changes();
    tokio::time::timeout(Duration::from_secs(5), first.wait_for(|l| *l))
        .await
        .expect("timed out waiting for first leader")
        .expect("leader channel closed");

    let follower_conn = common::connect(&cluster).await;
    let follower = Candidate::new(follower_conn, election.clone(), b"b".to_vec());
    follower.register().await.expect("failed to register follower");
    assert!(!follower.is_leader());

    cluster.expire_session(leader_conn.session_id());

    let mut second = follower.leader_changes();
    tokio::time::timeout(Duration::from_secs(5), second.wait_for(|l| *l))
        .await
        .expect("timed out waiting for handover")
        .expect("leader channel closed");
    assert!(follower.is_leader());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ack_subscription_observes_leadership_announcements() {
    let cluster = common::cluster();
    let election = random_str(10);

    let observer_conn = common::connect(&cluster).await;
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen2 = Arc::clone(&seen);
    let _sub = subscribe_leader_ack(&observer_conn, &election, DeliveryMode::Inline, move |event| {
        seen2.lock().expect("seen mutex").push(event.kind);
    });
    // Arms the watch on the not-yet-existing ack node.
    assert_eq!(
        current_leader(&observer_conn, &election)
            .await
            .expect("failed to read ack"),
        None
    );

    let candidate_conn = common::connect(&cluster).await;
    let candidate = Candidate::new(candidate_conn, election.clone(), b"a".to_vec());
    candidate.register().await.expect("failed to register");

    let seen3 = Arc::clone(&seen);
    common::eventually("ack announcement", move || {
        !seen3.lock().expect("seen mutex").is_empty()
    })
    .await;
    assert_eq!(
        seen.lock().expect("seen mutex").first().copied(),
        Some(rust_coord_utils::client::EventKind::Created)
    );
}
