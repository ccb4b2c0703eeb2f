//! Multi-instance simulation tests for chat-cluster.
//!
//! Several `ChatInstance`s share one in-memory store, standing in for a set
//! of chat servers behind a load balancer sharing one Redis.

use chat_cluster::{
    ChatInstance, ChatMessage, ClientSession, InstanceConfig, Keyspace, MemoryStore,
    PresenceStore, ServerEvent, SharedStore,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};

const PREFIX: &str = "sim";

fn config(instance_id: &str) -> InstanceConfig {
    InstanceConfig::default()
        .with_instance_id(instance_id)
        .with_key_prefix(PREFIX)
        .with_heartbeat(Duration::from_millis(50), Duration::from_millis(250))
}

async fn start(store: &Arc<MemoryStore>, instance_id: &str) -> ChatInstance {
    ChatInstance::start(store.clone(), config(instance_id))
        .await
        .unwrap()
}

async fn next_event(session: &mut ClientSession) -> ServerEvent {
    timeout(Duration::from_secs(3), session.recv())
        .await
        .expect("Timeout waiting for server event")
        .expect("Session closed")
}

/// Connect and claim `name`, consuming the handshake events.
async fn join(instance: &ChatInstance, name: &str) -> ClientSession {
    let mut session = instance.connect().unwrap();
    assert_eq!(next_event(&mut session).await, ServerEvent::RequestUsername);
    session.set_username(name).unwrap();
    assert_eq!(
        next_event(&mut session).await,
        ServerEvent::IsValid(true),
        "{} should be accepted",
        name
    );
    assert_eq!(
        next_event(&mut session).await,
        ServerEvent::ServerName(instance.instance_id().to_string())
    );
    session
}

/// Read events until a roster equal to `expected` arrives.
async fn wait_for_roster(session: &mut ClientSession, expected: &[&str]) {
    let expected: Vec<String> = expected.iter().map(|s| s.to_string()).collect();
    loop {
        if let ServerEvent::Users(users) = next_event(session).await {
            if users == expected {
                return;
            }
        }
    }
}

/// Everything except roster pushes received within `window`.
async fn chat_events(session: &mut ClientSession, window: Duration) -> Vec<ServerEvent> {
    let deadline = Instant::now() + window;
    let mut events = Vec::new();
    while let Ok(Some(event)) = tokio::time::timeout_at(deadline, session.recv()).await {
        if !matches!(event, ServerEvent::Users(_)) {
            events.push(event);
        }
    }
    events
}

fn presence(store: &Arc<MemoryStore>) -> PresenceStore {
    PresenceStore::new(store.clone(), Keyspace::new(PREFIX))
}

#[tokio::test]
async fn test_username_is_unique_across_instances() {
    let store = Arc::new(MemoryStore::new());
    let s1 = start(&store, "S1").await;
    let s2 = start(&store, "S2").await;
    let presence = presence(&store);

    let alice = join(&s1, "alice").await;
    assert_eq!(
        presence.list_owned_by("S1").await.unwrap(),
        HashSet::from(["alice".to_string()])
    );

    let mut other = s2.connect().unwrap();
    assert_eq!(next_event(&mut other).await, ServerEvent::RequestUsername);
    other.set_username("alice").unwrap();
    assert_eq!(next_event(&mut other).await, ServerEvent::IsValid(false));

    // alice leaves S1; the same S2 connection may now take the name
    drop(alice);
    let deadline = Instant::now() + Duration::from_secs(2);
    while presence.list_global().await.unwrap().contains("alice") {
        assert!(Instant::now() < deadline, "alice was never released");
        sleep(Duration::from_millis(10)).await;
    }

    other.set_username("alice").unwrap();
    assert_eq!(next_event(&mut other).await, ServerEvent::IsValid(true));
    assert_eq!(
        presence.list_owned_by("S2").await.unwrap(),
        HashSet::from(["alice".to_string()])
    );
    assert!(presence.list_owned_by("S1").await.unwrap().is_empty());

    s1.shutdown().await.unwrap();
    s2.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_claims_have_one_winner() {
    let store = Arc::new(MemoryStore::new());
    let instances = vec![
        start(&store, "S1").await,
        start(&store, "S2").await,
        start(&store, "S3").await,
    ];

    let mut sessions = Vec::new();
    for instance in &instances {
        let mut session = instance.connect().unwrap();
        assert_eq!(next_event(&mut session).await, ServerEvent::RequestUsername);
        sessions.push(session);
    }
    for session in &sessions {
        session.set_username("zoe").unwrap();
    }

    let mut accepted = 0;
    for session in &mut sessions {
        if next_event(session).await == ServerEvent::IsValid(true) {
            accepted += 1;
        }
    }
    assert_eq!(accepted, 1, "Exactly one instance may own zoe");

    drop(sessions);
    for instance in instances {
        instance.shutdown().await.unwrap();
    }
}

#[tokio::test]
async fn test_crashed_instance_users_are_evicted() {
    let store = Arc::new(MemoryStore::new());
    let s1 = start(&store, "S1").await;
    let s2 = start(&store, "S2").await;

    let _bob = join(&s1, "bob").await;
    let _carol = join(&s1, "carol").await;
    let mut dave = join(&s2, "dave").await;
    wait_for_roster(&mut dave, &["bob", "carol", "dave"]).await;

    // S1 dies without releasing anything
    s1.abort().await;

    wait_for_roster(&mut dave, &["dave"]).await;

    let presence = presence(&store);
    assert_eq!(
        presence.list_global().await.unwrap(),
        HashSet::from(["dave".to_string()])
    );
    assert!(presence.list_owned_by("S1").await.unwrap().is_empty());

    // bob can sign in again elsewhere
    let _bob_again = join(&s2, "bob").await;

    s2.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_direct_message_reaches_only_sender_and_recipient() {
    let store = Arc::new(MemoryStore::new());
    let s1 = start(&store, "S1").await;
    let s2 = start(&store, "S2").await;
    let s3 = start(&store, "S3").await;

    let mut dave = join(&s1, "dave").await;
    let mut eve = join(&s2, "eve").await;
    let mut carol = join(&s3, "carol").await;
    wait_for_roster(&mut carol, &["carol", "dave", "eve"]).await;

    dave.send_message("hi", "eve").unwrap();

    let expected = ServerEvent::Private(ChatMessage::direct("dave", "eve", "hi"));
    let window = Duration::from_millis(300);
    assert_eq!(chat_events(&mut dave, window).await, vec![expected.clone()]);
    assert_eq!(chat_events(&mut eve, window).await, vec![expected]);
    assert!(chat_events(&mut carol, window).await.is_empty());

    s1.shutdown().await.unwrap();
    s2.shutdown().await.unwrap();
    s3.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_broadcast_is_delivered_exactly_once_everywhere() {
    let store = Arc::new(MemoryStore::new());
    let s1 = start(&store, "S1").await;
    let s2 = start(&store, "S2").await;

    let mut alice = join(&s1, "alice").await;
    let mut frank = join(&s1, "frank").await;
    let mut bob = join(&s2, "bob").await;
    wait_for_roster(&mut bob, &["alice", "bob", "frank"]).await;

    alice.send_message("hello everyone", "main").unwrap();

    let window = Duration::from_millis(300);
    for session in [&mut alice, &mut frank, &mut bob] {
        let events = chat_events(session, window).await;
        assert_eq!(events.len(), 1, "Got {:?}", events);
        match &events[0] {
            ServerEvent::Main(payload) => {
                assert_eq!(payload.user, "alice");
                assert_eq!(payload.message, "hello everyone");
            }
            other => panic!("Expected main, got {:?}", other),
        }
    }

    s1.shutdown().await.unwrap();
    s2.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_graceful_shutdown_updates_peer_rosters() {
    let store = Arc::new(MemoryStore::new());
    let s1 = start(&store, "S1").await;
    let s2 = start(&store, "S2").await;

    let _alice = join(&s1, "alice").await;
    let mut bob = join(&s2, "bob").await;
    wait_for_roster(&mut bob, &["alice", "bob"]).await;

    let started = std::time::Instant::now();
    s1.shutdown().await.unwrap();
    wait_for_roster(&mut bob, &["bob"]).await;
    assert!(
        started.elapsed() < Duration::from_millis(250),
        "Roster should update without waiting for the heartbeat threshold"
    );

    s2.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_store_outage_keeps_local_chat_working() {
    let store = Arc::new(MemoryStore::new());
    let s1 = start(&store, "S1").await;
    let mut alice = join(&s1, "alice").await;
    let mut frank = join(&s1, "frank").await;

    store.set_available(false);
    s1.trigger_heartbeat().unwrap();

    // New registrations fail while the store is down
    let mut late = s1.connect().unwrap();
    assert_eq!(next_event(&mut late).await, ServerEvent::RequestUsername);
    late.set_username("gina").unwrap();
    assert_eq!(next_event(&mut late).await, ServerEvent::IsValid(false));
    assert!(s1.status().degraded);

    alice.send_message("local only", "main").unwrap();
    let events = chat_events(&mut frank, Duration::from_millis(200)).await;
    assert_eq!(events.len(), 1);

    store.set_available(true);
    let deadline = Instant::now() + Duration::from_secs(3);
    while s1.status().degraded && Instant::now() < deadline {
        sleep(Duration::from_millis(20)).await;
    }
    assert!(!s1.status().degraded);

    late.set_username("gina").unwrap();
    assert_eq!(next_event(&mut late).await, ServerEvent::IsValid(true));

    // Every session survived the outage
    let _ = chat_events(&mut alice, Duration::from_millis(50)).await;
    assert_eq!(s1.status().live_sessions, 3);

    s1.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_stale_release_after_eviction_keeps_new_owner() {
    let store = Arc::new(MemoryStore::new());
    let s1 = start(&store, "S1").await;
    let s2 = start(&store, "S2").await;
    let presence = presence(&store);

    let alice = join(&s1, "alice").await;

    // alice leaves while S1 cannot reach the store, so the release is queued
    store.set_available(false);
    drop(alice);
    let deadline = Instant::now() + Duration::from_secs(2);
    while s1.status().live_sessions > 0 || !s1.status().degraded {
        assert!(Instant::now() < deadline, "Disconnect was never handled");
        sleep(Duration::from_millis(10)).await;
    }
    store.set_available(true);

    // A peer evicts S1 before it recovers, and alice reconnects on S2
    presence.drop_instance("S1").await.unwrap();
    store
        .hash_delete(&Keyspace::new(PREFIX).heartbeats(), "S1")
        .await
        .unwrap();
    let _alice_again = join(&s2, "alice").await;

    let deadline = Instant::now() + Duration::from_secs(3);
    while s1.status().degraded {
        assert!(Instant::now() < deadline, "S1 never recovered");
        sleep(Duration::from_millis(20)).await;
    }
    // A few more passes for any queued release to run
    sleep(Duration::from_millis(200)).await;

    assert!(presence.list_global().await.unwrap().contains("alice"));
    assert_eq!(
        presence.list_owned_by("S2").await.unwrap(),
        HashSet::from(["alice".to_string()])
    );

    let mut impostor = s1.connect().unwrap();
    assert_eq!(next_event(&mut impostor).await, ServerEvent::RequestUsername);
    impostor.set_username("alice").unwrap();
    assert_eq!(next_event(&mut impostor).await, ServerEvent::IsValid(false));

    drop(impostor);
    s1.shutdown().await.unwrap();
    s2.shutdown().await.unwrap();
}
