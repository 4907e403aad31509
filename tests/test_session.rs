use std::time::Duration;

use rust_coord_utils::client::{CoordError, CreateMode, SessionState};
use serde::{Deserialize, Serialize};
use tokio_stream::StreamExt;

mod common;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Membership {
    host: String,
    weight: u32,
}

#[tokio::test]
async fn json_payloads_round_trip() {
    let cluster = common::cluster();
    let conn = common::connect(&cluster).await;

    conn.create("/member", b"", CreateMode::Persistent)
        .await
        .expect("failed to create node");
    let value = Membership {
        host: "db-1".to_string(),
        weight: 7,
    };
    conn.set_json("/member", &value, None)
        .await
        .expect("failed to set json");
    let read: Membership = conn.get_json("/member").await.expect("failed to get json");
    assert_eq!(read, value);

    // Garbage payloads surface as payload errors, not panics.
    conn.set_data("/member", b"not json", None)
        .await
        .expect("failed to set data");
    let result: Result<Membership, _> = conn.get_json("/member").await;
    assert!(matches!(result, Err(CoordError::Payload(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn await_removal_returns_once_the_node_is_gone() {
    let cluster = common::cluster();
    let conn = common::connect(&cluster).await;
    let other = common::connect(&cluster).await;

    // Absent node: returns immediately.
    conn.await_removal("/nothing-here")
        .await
        .expect("await_removal on absent node failed");

    conn.create("/doomed", b"", CreateMode::Persistent)
        .await
        .expect("failed to create node");
    let conn2 = conn.clone();
    let waiter = tokio::spawn(async move { conn2.await_removal("/doomed").await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished());

    // An unrelated change wakes and re-arms without returning.
    other
        .set_data("/doomed", b"still here", None)
        .await
        .expect("failed to set data");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished());

    other
        .delete("/doomed", None)
        .await
        .expect("failed to delete node");
    waiter
        .await
        .expect("waiter task failed")
        .expect("await_removal failed");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn await_removal_fails_on_session_expiry() {
    let cluster = common::cluster();
    let conn = common::connect(&cluster).await;
    conn.create("/pinned", b"", CreateMode::Persistent)
        .await
        .expect("failed to create node");

    let session = conn.session_id();
    let conn2 = conn.clone();
    let waiter = tokio::spawn(async move { conn2.await_removal("/pinned").await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    cluster.expire_session(session);
    let result = waiter.await.expect("waiter task failed");
    assert_eq!(result, Err(CoordError::SessionExpired));
}

#[tokio::test]
async fn close_is_idempotent_and_fails_later_operations() {
    let cluster = common::cluster();
    let conn = common::connect(&cluster).await;
    assert!(conn.is_connected());

    conn.close().await;
    conn.close().await;
    assert_eq!(conn.state(), SessionState::Closed);
    assert!(matches!(
        conn.exists("/", false).await,
        Err(CoordError::Closed)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn state_stream_yields_transitions() {
    let cluster = common::cluster();
    let conn = common::connect(&cluster).await;
    let mut states = conn.state_stream();
    assert_eq!(states.next().await, Some(SessionState::Connected));

    cluster.disconnect_session(conn.session_id());
    // The backend's own initial Connected notification may be replayed
    // ahead of the transition.
    let next = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match states.next().await {
                Some(SessionState::Connected) => continue,
                other => return other,
            }
        }
    })
    .await
    .expect("timed out waiting for state change");
    assert_eq!(next, Some(SessionState::Connecting));
}
