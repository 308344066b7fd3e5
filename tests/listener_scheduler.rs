//! Listener and scheduler behaviour against a scripted mail server.
//!
//! Time is paused, so the 30 s poll interval and 60 s connect retry run
//! instantly while keeping their ordering.

mod support;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use mail_bridge::config::ListenerConfig;
use mail_bridge::listener::{
    ListenerDeps, ListenerState, ListenerStatus, PollScheduler, spawn_listener,
};
use mail_bridge::pipeline::{ContentPipeline, DedupStrategy};
use mail_bridge::store::Database;

use support::{RecordingChat, ScriptedConnector, bridged_room, memory_store, raw_mail};

/// Upper bound of virtual time any wait may take.
const VIRTUAL_TIMEOUT: Duration = Duration::from_secs(24 * 3600);

fn deps(
    store: &Arc<dyn Database>,
    connector: &Arc<ScriptedConnector>,
    chat: &Arc<RecordingChat>,
) -> ListenerDeps {
    ListenerDeps {
        store: Arc::clone(store),
        connector: connector.clone(),
        pipeline: Arc::new(ContentPipeline::new(Arc::clone(store), DedupStrategy::default())),
        chat: chat.clone(),
        config: ListenerConfig::default(),
    }
}

async fn until(
    rx: &mut watch::Receiver<ListenerStatus>,
    f: impl FnMut(&ListenerStatus) -> bool,
) -> ListenerStatus {
    tokio::time::timeout(VIRTUAL_TIMEOUT, rx.wait_for(f))
        .await
        .expect("listener never reached the expected state")
        .expect("listener status channel closed")
        .clone()
}

#[tokio::test(start_paused = true)]
async fn unreachable_server_is_retried_forever() {
    let store = memory_store().await;
    let entry = bridged_room(&store, "R1", "alice").await;
    let connector = Arc::new(ScriptedConnector::refusing());
    let chat = Arc::new(RecordingChat::default());

    let handle = spawn_listener(entry, false, deps(&store, &connector, &chat));
    let mut rx = handle.subscribe();

    let status = until(&mut rx, |s| s.connect_attempts >= 20).await;
    assert_eq!(status.state, ListenerState::Connecting);
    assert_eq!(status.polls, 0);
    assert_eq!(connector.fetches(), 0);
    assert!(!handle.is_finished());

    handle.cancel();
    let status = until(&mut rx, |s| s.state == ListenerState::Stopped).await;
    assert_eq!(status.polls, 0);
}

#[tokio::test(start_paused = true)]
async fn connects_once_the_server_accepts() {
    let store = memory_store().await;
    let entry = bridged_room(&store, "R1", "alice").await;
    let connector = Arc::new(ScriptedConnector::with_mail(vec![raw_mail(
        1,
        "bob@example.com",
        "Hi",
        1000,
    )]));
    connector
        .refuse_connects
        .store(3, std::sync::atomic::Ordering::SeqCst);
    let chat = Arc::new(RecordingChat::default());

    let handle = spawn_listener(entry, false, deps(&store, &connector, &chat));
    let mut rx = handle.subscribe();

    let status = until(&mut rx, |s| s.polls >= 1).await;
    assert_eq!(status.connect_attempts, 4);
    assert_eq!(chat.headers_for("R1"), 1);
    handle.cancel();
}

#[tokio::test(start_paused = true)]
async fn fifteen_polls_trigger_exactly_one_reconnect() {
    let store = memory_store().await;
    let entry = bridged_room(&store, "R1", "alice").await;
    let connector = Arc::new(ScriptedConnector::with_mail(vec![raw_mail(
        1,
        "bob@example.com",
        "Hi",
        1000,
    )]));
    let chat = Arc::new(RecordingChat::default());

    let handle = spawn_listener(entry, false, deps(&store, &connector, &chat));
    let mut rx = handle.subscribe();

    let status = until(&mut rx, |s| s.polls == 15).await;
    assert_eq!(status.checks, 15);
    assert_eq!(status.reconnects, 0);
    assert_eq!(connector.connects(), 1);

    let status = until(&mut rx, |s| s.reconnects == 1 && s.state == ListenerState::Polling).await;
    assert!(status.checks <= 1, "checks not reset: {status:?}");
    assert_eq!(connector.connects(), 2);

    let status = until(&mut rx, |s| s.polls == 26).await;
    assert_eq!(status.reconnects, 1);
    assert_eq!(status.checks, 11);
    assert_eq!(status.login_errors, 0);

    // Same message every poll, delivered once.
    assert_eq!(chat.headers_for("R1"), 1);
    handle.cancel();
}

#[tokio::test(start_paused = true)]
async fn failing_polls_force_a_reconnect() {
    let store = memory_store().await;
    let entry = bridged_room(&store, "R1", "alice").await;
    // An empty mailbox fails every poll.
    let connector = Arc::new(ScriptedConnector::default());
    let chat = Arc::new(RecordingChat::default());

    let handle = spawn_listener(entry, false, deps(&store, &connector, &chat));
    let mut rx = handle.subscribe();

    let status = until(&mut rx, |s| s.errors == 10).await;
    assert_eq!(status.login_errors, 0);
    assert_eq!(status.reconnects, 0);

    // The error count starts over on the fresh connection.
    let status = until(&mut rx, |s| s.login_errors == 1).await;
    assert_eq!(status.reconnects, 1);
    assert!(status.errors <= 1, "errors not reset: {status:?}");
    assert!(status.polls >= 11);
    handle.cancel();
}

#[tokio::test(start_paused = true)]
async fn seen_mail_is_delivered_once() {
    let store = memory_store().await;
    let entry = bridged_room(&store, "R1", "alice").await;
    let room_id = entry.room.id;
    let connector = Arc::new(ScriptedConnector::with_mail(vec![raw_mail(
        1,
        "bob@example.com",
        "Hi",
        1000,
    )]));
    let chat = Arc::new(RecordingChat::default());

    let handle = spawn_listener(entry, false, deps(&store, &connector, &chat));
    let mut rx = handle.subscribe();
    until(&mut rx, |s| s.polls >= 3).await;

    assert_eq!(chat.headers_for("R1"), 1);
    let bodies: Vec<_> = chat
        .messages()
        .into_iter()
        .filter(|m| m.text.contains("Hello from bob@example.com"))
        .collect();
    assert_eq!(bodies.len(), 1);
    // The record already exists.
    assert!(!store.mark_mail_seen(room_id, "Hi1000").await.unwrap());
    handle.cancel();
}

#[tokio::test(start_paused = true)]
async fn silent_start_skips_the_first_poll_only() {
    let store = memory_store().await;
    let entry = bridged_room(&store, "R1", "alice").await;
    let room_id = entry.room.id;
    let connector = Arc::new(ScriptedConnector::with_mail(vec![raw_mail(
        1,
        "bob@example.com",
        "Old news",
        1000,
    )]));
    let chat = Arc::new(RecordingChat::default());

    let handle = spawn_listener(entry, true, deps(&store, &connector, &chat));
    let mut rx = handle.subscribe();
    until(&mut rx, |s| s.polls >= 1).await;
    assert_eq!(chat.headers_for("R1"), 0);
    assert!(!store.mark_mail_seen(room_id, "Old news1000").await.unwrap());

    connector.push(raw_mail(2, "bob@example.com", "Fresh", 2000));
    until(&mut rx, |s| s.polls >= 2).await;
    assert_eq!(chat.headers_for("R1"), 1);
    assert!(chat.messages().iter().any(|m| m.text.contains("Subject: Fresh")));
    handle.cancel();
}

#[tokio::test(start_paused = true)]
async fn listener_stops_when_its_room_is_deleted() {
    let store = memory_store().await;
    let entry = bridged_room(&store, "R1", "alice").await;
    let connector = Arc::new(ScriptedConnector::with_mail(vec![raw_mail(
        1,
        "bob@example.com",
        "Hi",
        1000,
    )]));
    let chat = Arc::new(RecordingChat::default());

    let handle = spawn_listener(entry, false, deps(&store, &connector, &chat));
    let mut rx = handle.subscribe();
    until(&mut rx, |s| s.polls >= 1).await;

    store.delete_room("R1").await.unwrap();
    until(&mut rx, |s| s.state == ListenerState::Stopped).await;
}

#[tokio::test(start_paused = true)]
async fn scheduler_keeps_one_listener_per_room() {
    let store = memory_store().await;
    let r1 = bridged_room(&store, "R1", "alice").await;
    let connector = Arc::new(ScriptedConnector::with_mail(vec![raw_mail(
        1,
        "bob@example.com",
        "Hi",
        1000,
    )]));
    let chat = Arc::new(RecordingChat::default());
    let scheduler = PollScheduler::new(deps(&store, &connector, &chat));

    scheduler.start(r1.clone(), false).await;
    scheduler.start(r1, false).await;
    assert_eq!(scheduler.active_rooms().await, vec!["R1".to_string()]);
    assert!(scheduler.status("R1").await.is_some());

    assert!(scheduler.stop("R1").await);
    assert!(!scheduler.stop("R1").await);
    assert!(scheduler.status("R1").await.is_none());
    assert!(scheduler.active_rooms().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn bootstrap_starts_every_bridged_room() {
    let store = memory_store().await;
    bridged_room(&store, "R2", "bob").await;
    bridged_room(&store, "R1", "alice").await;
    store.ensure_room("R3", 30, false).await.unwrap();

    let connector = Arc::new(ScriptedConnector::with_mail(vec![raw_mail(
        1,
        "carol@example.com",
        "Hi",
        1000,
    )]));
    let chat = Arc::new(RecordingChat::default());
    let scheduler = PollScheduler::new(deps(&store, &connector, &chat));

    assert_eq!(scheduler.bootstrap().await.unwrap(), 2);
    assert_eq!(
        scheduler.active_rooms().await,
        vec!["R1".to_string(), "R2".to_string()]
    );

    tokio::time::sleep(Duration::from_secs(1)).await;
    let mailboxes = scheduler.list_mailboxes("R1").await.unwrap();
    assert_eq!(mailboxes, vec!["INBOX".to_string(), "Archive".to_string()]);
    assert!(scheduler.list_mailboxes("R3").await.is_err());

    scheduler.shutdown().await;
    assert!(scheduler.active_rooms().await.is_empty());
}
