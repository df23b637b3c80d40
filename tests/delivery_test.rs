//! End-to-end delivery scenarios.
//!
//! Tests:
//! - Offline delivery is queued, then replayed exactly once on connect
//! - Offline entries replay in enqueue order
//! - A newer connection takes over dispatches for its user
//! - Topic fan-out reaches online and offline followers
//! - Queued notifications survive a restart on SQLite storage

mod common;

use common::{TestFixture, TestService};
use std::time::Duration;
use tidings::config::{Config, Follow, SupersedePolicy};
use tidings::notification::UserId;
use tidings::server::preload_follows;
use tidings::service::{DeliveryOutcome, TopicEvent};
use tidings::storage::{MemoryStore, Stores};
use tokio_test::assert_ok;

const FRAME_WAIT: Duration = Duration::from_secs(2);
const QUIET_WAIT: Duration = Duration::from_millis(200);

#[tokio::test]
async fn test_offline_notification_delivered_once_on_connect() {
    let service = TestService::memory();
    let state = &service.state;
    let u9 = UserId::from("U9");

    let delivery = assert_ok!(state.dispatcher.deliver(&u9, "hello").await);
    assert_eq!(delivery.outcome, DeliveryOutcome::Queued);
    assert_eq!(state.stores.pending.pending(&u9).unwrap().len(), 1);
    assert_eq!(state.stores.notifications.history(&u9, 10).unwrap().len(), 1);

    let mut client = service.connect("U9").await;
    assert_eq!(client.next_frame(FRAME_WAIT).await.as_deref(), Some("hello"));
    assert_eq!(client.next_frame(QUIET_WAIT).await, None);

    let pending = state.stores.pending.clone();
    assert!(common::wait_for(FRAME_WAIT, || pending.pending(&u9).unwrap().is_empty()).await);
    client.disconnect().await;

    // A second attach has nothing left to replay.
    let mut again = service.connect("U9").await;
    assert_eq!(again.next_frame(QUIET_WAIT).await, None);
    again.disconnect().await;
}

#[tokio::test]
async fn test_backlog_replays_in_enqueue_order() {
    let service = TestService::memory();
    let user = UserId::from("u1");
    for payload in ["A", "B", "C"] {
        service.state.dispatcher.deliver(&user, payload).await.unwrap();
    }

    let mut client = service.connect("u1").await;
    let mut received = Vec::new();
    for _ in 0..3 {
        received.push(client.next_frame(FRAME_WAIT).await.expect("missing replayed frame"));
    }
    assert_eq!(received, vec!["A", "B", "C"]);
    client.disconnect().await;
}

#[tokio::test]
async fn test_online_user_gets_direct_write() {
    let service = TestService::memory();
    let user = UserId::from("u1");
    let mut client = service.connect("u1").await;

    let delivery = service.state.dispatcher.deliver(&user, "ping").await.unwrap();
    assert_eq!(delivery.outcome, DeliveryOutcome::Delivered);
    assert_eq!(client.next_frame(FRAME_WAIT).await.as_deref(), Some("ping"));
    assert!(service.state.stores.pending.pending(&user).unwrap().is_empty());

    client.disconnect().await;
    assert!(service.state.registry.lookup(&user).is_none());
}

#[tokio::test]
async fn test_newer_connection_takes_over_and_evicts() {
    let service = TestService::memory();
    let user = UserId::from("u1");

    let mut first = service.connect("u1").await;
    let mut second = service.connect("u1").await;

    assert!(first.closed_by_server(FRAME_WAIT).await, "superseded socket should be closed");

    service.state.dispatcher.deliver(&user, "x").await.unwrap();
    assert_eq!(second.next_frame(FRAME_WAIT).await.as_deref(), Some("x"));
    assert_eq!(service.state.registry.active_count(), 1);

    second.disconnect().await;
}

#[tokio::test]
async fn test_kept_connection_receives_no_dispatches() {
    let mut config = Config::test_config(std::env::temp_dir());
    config.supersede = SupersedePolicy::Keep;
    let service = TestService::with_stores(&config, Stores::from_backend(MemoryStore::new()));
    let user = UserId::from("u1");

    let mut first = service.connect("u1").await;
    let mut second = service.connect("u1").await;

    service.state.dispatcher.deliver(&user, "x").await.unwrap();
    assert_eq!(second.next_frame(FRAME_WAIT).await.as_deref(), Some("x"));
    assert_eq!(first.next_frame(QUIET_WAIT).await, None);

    // The older session ending must not remove the newer entry.
    first.disconnect().await;
    let current = service.state.registry.lookup(&user);
    assert!(current.is_some());

    second.disconnect().await;
}

#[tokio::test]
async fn test_market_update_reaches_both_followers() {
    let service = TestService::memory();
    let state = &service.state;
    let follows = vec![
        Follow {
            user_id: "u1".into(),
            topics: vec!["AAPL".into()],
        },
        Follow {
            user_id: "u2".into(),
            topics: vec!["AAPL".into()],
        },
    ];
    preload_follows(state, &follows).await.unwrap();

    let mut online = service.connect("u1").await;
    let report = state.fanout.notify_topic("AAPL", "news").await;
    assert_eq!(report.recipients, 2);
    assert_eq!(report.delivered, 1);
    assert_eq!(report.queued, 1);

    assert_eq!(
        online.next_frame(FRAME_WAIT).await.as_deref(),
        Some("Market Update: news")
    );
    let mut offline = service.connect("u2").await;
    assert_eq!(
        offline.next_frame(FRAME_WAIT).await.as_deref(),
        Some("Market Update: news")
    );

    let persisted = state.stores.notifications.history(&UserId::from("u1"), 10).unwrap().len()
        + state.stores.notifications.history(&UserId::from("u2"), 10).unwrap().len();
    assert_eq!(persisted, 2);

    online.disconnect().await;
    offline.disconnect().await;
}

#[tokio::test]
async fn test_fanout_to_three_with_one_offline() {
    let service = TestService::memory();
    let state = &service.state;
    for user in ["u1", "u2", "u3"] {
        state
            .stores
            .subscriptions
            .subscribe("MSFT", &UserId::from(user))
            .unwrap();
    }

    let mut c1 = service.connect("u1").await;
    let mut c2 = service.connect("u2").await;

    let report = state.fanout.notify_topic("MSFT", "flat").await;
    assert_eq!(
        (report.recipients, report.delivered, report.queued, report.failed),
        (3, 2, 1, 0)
    );
    assert!(c1.next_frame(FRAME_WAIT).await.is_some());
    assert!(c2.next_frame(FRAME_WAIT).await.is_some());
    assert_eq!(state.stores.pending.pending(&UserId::from("u3")).unwrap().len(), 1);

    c1.disconnect().await;
    c2.disconnect().await;
}

#[tokio::test]
async fn test_driver_cycle_fans_out_queued_events() {
    let mut service = TestService::memory();
    let user = UserId::from("u1");
    service.state.stores.subscriptions.subscribe("AAPL", &user).unwrap();

    service
        .state
        .events
        .try_send(TopicEvent {
            topic: "AAPL".into(),
            message: "tick".into(),
        })
        .unwrap();

    let reports = service.driver.run_cycle().await;
    assert_eq!(reports.len(), 1);

    let mut client = service.connect("u1").await;
    assert_eq!(client.next_frame(FRAME_WAIT).await.as_deref(), Some("Market Update: tick"));
    client.disconnect().await;
}

#[tokio::test]
async fn test_client_frame_marks_notification_read() {
    let service = TestService::memory();
    let user = UserId::from("u1");
    let client = service.connect("u1").await;

    let delivery = service.state.dispatcher.deliver(&user, "read me").await.unwrap();
    client.send(&delivery.notification_id);
    client.disconnect().await;

    let history = service.state.stores.notifications.history(&user, 1).unwrap();
    assert!(history[0].read);
}

#[tokio::test]
async fn test_queue_survives_restart_on_sqlite() {
    let fixture = TestFixture::new();
    let config = fixture.config();
    let user = UserId::from("U9");

    {
        let service = TestService::with_stores(&config, fixture.sqlite_stores());
        service.state.dispatcher.deliver(&user, "hello").await.unwrap();
    }

    let service = TestService::with_stores(&config, fixture.sqlite_stores());
    let mut client = service.connect("U9").await;
    assert_eq!(client.next_frame(FRAME_WAIT).await.as_deref(), Some("hello"));

    let pending = service.state.stores.pending.clone();
    assert!(common::wait_for(FRAME_WAIT, || pending.pending(&user).unwrap().is_empty()).await);
    client.disconnect().await;
}
