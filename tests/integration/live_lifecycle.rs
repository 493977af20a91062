//! Integration tests for the live subscription lifecycle.
//!
//! Activation opens exactly one subscription per engine; deactivation
//! releases it and discards all state, and results of requests that were
//! in flight at teardown never leak into a later session.

use std::sync::Arc;
use std::time::Duration;

use threadsync::config::SyncConfig;
use threadsync::remote::memory::InMemoryRemote;
use threadsync::sync::{ConversationSyncEngine, SyncError, SyncEvent};
use threadsync_proto::message::{ConversationId, DeliveryStatus, MessageId, MessageRef, SenderId};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

type Engine = ConversationSyncEngine<Arc<InMemoryRemote>>;

fn conv() -> ConversationId {
    ConversationId::new("conv-1")
}

fn engine_for(backend: &Arc<InMemoryRemote>) -> (Engine, tokio::sync::mpsc::Receiver<SyncEvent>) {
    ConversationSyncEngine::new(
        Arc::clone(backend),
        conv(),
        SenderId::new("alice"),
        &SyncConfig::default(),
    )
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn peer_messages_arrive_through_live_feed() {
    let backend = Arc::new(InMemoryRemote::new());
    let (engine, mut events) = engine_for(&backend);
    engine.activate().await.unwrap();

    backend.post(&conv(), &SenderId::new("bob"), "hey");
    wait_until(|| engine.messages().len() == 1).await;

    let msg = engine.messages()[0].clone();
    assert_eq!(msg.content, "hey");
    assert_eq!(msg.status, DeliveryStatus::Sent);
    assert_eq!(events.recv().await, Some(SyncEvent::ThreadChanged));
}

#[tokio::test]
async fn foreign_conversation_traffic_is_ignored() {
    let backend = Arc::new(InMemoryRemote::new());
    let (engine, _events) = engine_for(&backend);
    engine.activate().await.unwrap();

    backend.post(&ConversationId::new("elsewhere"), &SenderId::new("bob"), "not for you");
    backend.post(&conv(), &SenderId::new("bob"), "for you");
    wait_until(|| engine.messages().len() == 1).await;
    assert_eq!(engine.messages()[0].content, "for you");
}

#[tokio::test]
async fn deactivate_releases_subscription_and_discards_state() {
    let backend = Arc::new(InMemoryRemote::new());
    backend.seed_history(&conv(), &SenderId::new("bob"), 5);
    let (engine, _events) = engine_for(&backend);
    engine.activate().await.unwrap();
    wait_until(|| engine.messages().len() == 5).await;
    engine.set_reply_target(MessageRef::Durable(MessageId::new("m-000001")));
    assert_eq!(backend.subscriber_count(&conv()), 1);

    engine.deactivate().await;

    assert_eq!(backend.subscriber_count(&conv()), 0);
    assert!(!engine.is_active());
    assert!(engine.messages().is_empty());
    assert!(engine.reply_target().is_none());
    assert!(engine.has_older_messages());

    backend.post(&conv(), &SenderId::new("bob"), "after teardown");
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(engine.messages().is_empty());
}

#[tokio::test]
async fn page_arriving_after_teardown_is_discarded() {
    let backend = Arc::new(InMemoryRemote::new());
    backend.seed_history(&conv(), &SenderId::new("bob"), 30);
    let (engine, _events) = engine_for(&backend);
    engine.activate().await.unwrap();
    backend.pause();

    let teardown = async {
        wait_until(|| backend.fetch_calls() == 1).await;
        engine.deactivate().await;
        backend.resume();
    };
    let (result, ()) = tokio::join!(engine.load_older_messages(), teardown);

    assert!(matches!(result, Err(SyncError::Inactive)));
    assert!(engine.messages().is_empty());
    assert!(!engine.is_loading_older());
}

#[tokio::test]
async fn send_completing_after_teardown_does_not_leak() {
    let backend = Arc::new(InMemoryRemote::new());
    let (engine, _events) = engine_for(&backend);
    engine.activate().await.unwrap();
    backend.set_auto_push(false);
    backend.pause();

    let teardown = async {
        wait_until(|| engine.messages().len() == 1).await;
        engine.deactivate().await;
        backend.resume();
    };
    let (result, ()) = tokio::join!(engine.send_message("late"), teardown);

    assert!(matches!(result, Err(SyncError::Inactive)));
    assert!(engine.messages().is_empty());
    assert!(!engine.is_sending());

    // A fresh session sees the message only as the server has it.
    backend.set_auto_push(true);
    engine.activate().await.unwrap();
    wait_until(|| engine.messages().len() == 1).await;
    let msg = engine.messages()[0].clone();
    assert_eq!(msg.status, DeliveryStatus::Sent);
    assert_eq!(msg.content, "late");
}

#[tokio::test]
async fn reactivation_opens_a_single_fresh_subscription() {
    let backend = Arc::new(InMemoryRemote::new());
    backend.seed_history(&conv(), &SenderId::new("bob"), 3);
    let (engine, _events) = engine_for(&backend);

    engine.activate().await.unwrap();
    engine.deactivate().await;
    engine.activate().await.unwrap();

    wait_until(|| engine.messages().len() == 3).await;
    assert_eq!(backend.subscriber_count(&conv()), 1);
    assert!(engine.is_active());
}

#[tokio::test]
async fn operations_after_deactivate_are_refused() {
    let backend = Arc::new(InMemoryRemote::new());
    let (engine, _events) = engine_for(&backend);
    engine.activate().await.unwrap();
    engine.deactivate().await;

    assert!(matches!(engine.send_message("x").await, Err(SyncError::Inactive)));
    assert!(matches!(
        engine.delete_message(&MessageId::new("m-1")).await,
        Err(SyncError::Inactive)
    ));
    assert!(matches!(
        engine.load_older_messages().await,
        Err(SyncError::Inactive)
    ));
    assert_eq!(backend.create_calls(), 0);
    assert_eq!(backend.delete_calls(), 0);
    assert_eq!(backend.fetch_calls(), 0);
}

#[tokio::test]
async fn dropping_engine_releases_subscription() {
    let backend = Arc::new(InMemoryRemote::new());
    let (engine, _events) = engine_for(&backend);
    engine.activate().await.unwrap();
    assert_eq!(backend.subscriber_count(&conv()), 1);

    drop(engine);
    wait_until(|| backend.subscriber_count(&conv()) == 0).await;
}

#[tokio::test]
async fn engines_for_different_conversations_are_isolated() {
    let backend = Arc::new(InMemoryRemote::new());
    let other = ConversationId::new("conv-2");
    let (first, _e1) = engine_for(&backend);
    let (second, _e2) = ConversationSyncEngine::new(
        Arc::clone(&backend),
        other.clone(),
        SenderId::new("alice"),
        &SyncConfig::default(),
    );
    first.activate().await.unwrap();
    second.activate().await.unwrap();

    first.send_message("only here").await.unwrap();
    backend.post(&other, &SenderId::new("bob"), "only there");
    wait_until(|| second.messages().len() == 1).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(first.messages().len(), 1);
    assert_eq!(first.messages()[0].content, "only here");
    assert_eq!(second.messages()[0].content, "only there");
}
