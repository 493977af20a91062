//! Integration tests for optimistic sends.
//!
//! Covers the send lifecycle end to end against the in-memory backend:
//! pending insert at the head, reconciliation by live echo or by response,
//! failure and retry, and reply references surviving every step.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use threadsync::config::SyncConfig;
use threadsync::remote::memory::InMemoryRemote;
use threadsync::remote::timeout::TimeoutRemote;
use threadsync::remote::RemoteError;
use threadsync::sync::store::ReplyPreview;
use threadsync::sync::{ConversationSyncEngine, SyncError, SyncEvent};
use threadsync_proto::message::{
    AttachmentRef, ConversationId, DeliveryStatus, MessageId, MessageRef, SenderId,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

type Engine = ConversationSyncEngine<Arc<InMemoryRemote>>;

fn conv() -> ConversationId {
    ConversationId::new("conv-1")
}

/// Backend seeded with `history` messages from a peer, and an active engine
/// that has merged the initial live snapshot.
async fn active_engine(history: usize) -> (Arc<InMemoryRemote>, Engine, mpsc::Receiver<SyncEvent>) {
    let backend = Arc::new(InMemoryRemote::new());
    backend.seed_history(&conv(), &SenderId::new("bob"), history);
    let (engine, events) = ConversationSyncEngine::new(
        Arc::clone(&backend),
        conv(),
        SenderId::new("alice"),
        &SyncConfig::default(),
    );
    engine.activate().await.unwrap();
    let visible = history.min(20);
    wait_until(|| engine.messages().len() == visible).await;
    (backend, engine, events)
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
// Pending insert and reconciliation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn send_is_pending_at_head_then_echo_confirms_in_place() {
    let (backend, engine, _events) = active_engine(3).await;
    backend.set_auto_push(false);
    backend.pause();

    let observe = async {
        wait_until(|| engine.messages().len() == 4).await;
        let head = engine.messages()[0].clone();
        assert_eq!(head.content, "hi");
        assert_eq!(head.status, DeliveryStatus::Pending);
        assert!(head.id.is_none());
        assert!(engine.is_sending());

        // The server already stored the record; deliver its echo first.
        backend.push_snapshot(&conv());
        wait_until(|| engine.messages()[0].status == DeliveryStatus::Sent).await;
        assert_eq!(engine.messages().len(), 4);
        assert_eq!(engine.messages()[0].client_temp_id, head.client_temp_id);

        backend.resume();
    };
    let (sent, ()) = tokio::join!(engine.send_message("hi"), observe);

    let id = sent.unwrap();
    let thread = engine.messages();
    assert_eq!(thread.len(), 4);
    assert_eq!(thread[0].id, Some(id));
    assert_eq!(thread[0].status, DeliveryStatus::Sent);
    assert!(!engine.is_sending());
}

#[tokio::test]
async fn response_before_echo_reconciles_without_duplicates() {
    let (backend, engine, _events) = active_engine(3).await;
    backend.set_auto_push(false);

    let id = engine.send_message("hello").await.unwrap();
    assert_eq!(engine.messages().len(), 4);

    backend.push_snapshot(&conv());
    tokio::time::sleep(Duration::from_millis(20)).await;

    let thread = engine.messages();
    assert_eq!(thread.len(), 4);
    assert_eq!(thread.iter().filter(|m| m.id.as_ref() == Some(&id)).count(), 1);
}

#[tokio::test]
async fn echo_without_temp_id_is_folded_into_the_pending_entry() {
    let (backend, engine, _events) = active_engine(3).await;
    backend.set_echo_temp_ids(false);

    let id = engine.send_message("no echo id").await.unwrap();
    wait_until(|| engine.messages().len() == 4).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let thread = engine.messages();
    assert_eq!(thread.len(), 4);
    let matching: Vec<_> = thread.iter().filter(|m| m.id.as_ref() == Some(&id)).collect();
    assert_eq!(matching.len(), 1);
    assert_eq!(matching[0].status, DeliveryStatus::Sent);
}

#[tokio::test]
async fn concurrent_sends_all_confirm() {
    let (_backend, engine, _events) = active_engine(0).await;

    let (a, b, c) = tokio::join!(
        engine.send_message("one"),
        engine.send_message("two"),
        engine.send_message("three"),
    );
    a.unwrap();
    b.unwrap();
    c.unwrap();

    wait_until(|| engine.messages().len() == 3).await;
    assert!(engine
        .messages()
        .iter()
        .all(|m| m.status == DeliveryStatus::Sent));
    assert!(!engine.is_sending());
}

#[tokio::test]
async fn image_message_carries_attachment() {
    let (backend, engine, _events) = active_engine(0).await;
    let id = engine
        .send_image_message(AttachmentRef::new("uploads/cat.png"))
        .await
        .unwrap();

    let head = engine.messages()[0].clone();
    assert_eq!(head.id, Some(id));
    assert_eq!(head.attachment, Some(AttachmentRef::new("uploads/cat.png")));
    assert_eq!(
        backend.records(&conv())[0].attachment_ref,
        Some(AttachmentRef::new("uploads/cat.png"))
    );
}

#[tokio::test]
async fn empty_message_is_rejected_without_staging() {
    let (backend, engine, _events) = active_engine(0).await;
    let result = engine.send_message("   ").await;
    assert!(matches!(result, Err(SyncError::Validation(_))));
    assert!(engine.messages().is_empty());
    assert_eq!(backend.create_calls(), 0);
}

// ---------------------------------------------------------------------------
// Replies
// ---------------------------------------------------------------------------

#[tokio::test]
async fn reply_reference_survives_reconciliation_and_redelivery() {
    // 30 seeded, only the newest 20 are live; m-000001 is never loaded.
    let (backend, engine, _events) = active_engine(30).await;
    let target = MessageRef::Durable(MessageId::new("m-000001"));
    engine.set_reply_target(target.clone());

    let id = engine.send_message("answer").await.unwrap();
    assert!(engine.reply_target().is_none());

    let head = engine.messages()[0].clone();
    assert_eq!(head.id, Some(id.clone()));
    assert_eq!(head.reply_to, Some(target.clone()));
    assert_eq!(engine.resolve_reply(&target), ReplyPreview::Stub(target.clone()));

    backend.push_snapshot(&conv());
    tokio::time::sleep(Duration::from_millis(20)).await;
    let redelivered = engine
        .messages()
        .into_iter()
        .find(|m| m.id.as_ref() == Some(&id))
        .unwrap();
    assert_eq!(redelivered.reply_to, Some(target));
}

#[tokio::test]
async fn reply_to_pending_message_resolves_after_confirmation() {
    let (backend, engine, _events) = active_engine(0).await;
    backend.pause();

    let reply_flow = async {
        wait_until(|| engine.messages().len() == 1).await;
        let temp = engine.messages()[0].client_temp_id.unwrap();
        engine.set_reply_target(MessageRef::Temp(temp));
        backend.resume();
        temp
    };
    let (first, temp) = tokio::join!(engine.send_message("first"), reply_flow);
    let first = first.unwrap();

    let second = engine.send_message("second").await.unwrap();
    let reply = engine
        .messages()
        .into_iter()
        .find(|m| m.id.as_ref() == Some(&second))
        .unwrap()
        .reply_to
        .unwrap();
    // The local entry keeps the reference it was composed with; the server
    // stores the durable id.
    assert_eq!(reply, MessageRef::Temp(temp));
    let stored = backend
        .records(&conv())
        .into_iter()
        .find(|r| r.id.as_ref() == Some(&second))
        .unwrap();
    assert_eq!(stored.reply_to_id, Some(MessageRef::Durable(first.clone())));

    match engine.resolve_reply(&MessageRef::Temp(temp)) {
        ReplyPreview::Loaded(msg) => assert_eq!(msg.id, Some(first)),
        ReplyPreview::Stub(_) => panic!("temp reference should resolve after confirmation"),
    }
}

// ---------------------------------------------------------------------------
// Failure, retry, dismissal
// ---------------------------------------------------------------------------

#[tokio::test]
async fn failed_send_stays_visible_and_keeps_reply_target() {
    let (backend, engine, mut events) = active_engine(3).await;
    while events.try_recv().is_ok() {}
    backend.set_fail_create(true);
    let target = MessageRef::Durable(MessageId::new("m-000002"));
    engine.set_reply_target(target.clone());

    let err = engine.send_message("doomed").await.unwrap_err();
    let SyncError::SendFailed { temp_id, .. } = err else {
        panic!("expected SendFailed");
    };

    let head = engine.messages()[0].clone();
    assert_eq!(head.status, DeliveryStatus::Failed);
    assert_eq!(head.client_temp_id, Some(temp_id));
    assert_eq!(engine.reply_target(), Some(target));
    assert!(engine.failure_reason(temp_id).is_some());
    assert!(!engine.is_sending());

    let mut saw_failure = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, SyncEvent::SendFailed { temp_id: t, .. } if t == temp_id) {
            saw_failure = true;
        }
    }
    assert!(saw_failure);
}

#[tokio::test]
async fn retry_resubmits_under_new_temp_id() {
    let (backend, engine, _events) = active_engine(3).await;
    backend.set_reject_create(true);
    let target = MessageRef::Durable(MessageId::new("m-000001"));
    engine.set_reply_target(target.clone());

    let Err(SyncError::SendFailed { temp_id, .. }) = engine.send_message("again").await else {
        panic!("send should fail");
    };

    backend.set_reject_create(false);
    let id = engine.retry_failed(temp_id).await.unwrap();

    let thread = engine.messages();
    assert_eq!(thread.len(), 4);
    assert!(thread.iter().all(|m| m.status != DeliveryStatus::Failed));
    let retried = thread.iter().find(|m| m.id.as_ref() == Some(&id)).unwrap();
    assert_ne!(retried.client_temp_id, Some(temp_id));
    assert_eq!(retried.reply_to, Some(target));
    assert!(engine.failure_reason(temp_id).is_none());
    assert_eq!(backend.create_calls(), 2);

    assert!(matches!(
        engine.retry_failed(temp_id).await,
        Err(SyncError::UnknownFailedSend(_))
    ));
}

#[tokio::test]
async fn dismissing_failed_send_removes_it() {
    let (backend, engine, _events) = active_engine(2).await;
    backend.set_fail_create(true);

    let Err(SyncError::SendFailed { temp_id, .. }) = engine.send_message("bye").await else {
        panic!("send should fail");
    };
    assert_eq!(engine.messages().len(), 3);

    let removed = engine.dismiss_failed(temp_id).unwrap();
    assert_eq!(removed.content, "bye");
    assert_eq!(engine.messages().len(), 2);
    assert!(engine.dismiss_failed(temp_id).is_none());
}

#[tokio::test]
async fn abandoned_send_becomes_failed_and_retryable() {
    let (backend, engine, _events) = active_engine(0).await;
    backend.set_auto_push(false);
    backend.pause();

    let abandoned =
        tokio::time::timeout(Duration::from_millis(30), engine.send_message("lost")).await;
    assert!(abandoned.is_err());
    assert!(!engine.is_sending());

    let head = engine.messages()[0].clone();
    assert_eq!(head.status, DeliveryStatus::Failed);
    let temp_id = head.client_temp_id.unwrap();
    assert_eq!(
        engine.failure_reason(temp_id),
        Some(RemoteError::Cancelled.to_string())
    );

    backend.resume();
    let id = engine.retry_failed(temp_id).await.unwrap();
    let thread = engine.messages();
    assert_eq!(thread.len(), 1);
    assert_eq!(thread[0].id, Some(id));
    assert_eq!(backend.create_calls(), 2);
}

#[tokio::test]
async fn timed_out_send_with_late_echo_can_still_be_dismissed() {
    let backend = Arc::new(InMemoryRemote::new());
    let (engine, _events) = ConversationSyncEngine::new(
        TimeoutRemote::new(Arc::clone(&backend), Duration::from_millis(30)),
        conv(),
        SenderId::new("alice"),
        &SyncConfig::default(),
    );
    engine.activate().await.unwrap();
    backend.set_auto_push(false);
    backend.pause();

    let Err(SyncError::SendFailed { temp_id, .. }) = engine.send_message("slow").await else {
        panic!("send should time out");
    };
    backend.resume();

    // The server did store it; the echo shows up next to the failed entry.
    backend.push_snapshot(&conv());
    wait_until(|| engine.messages().len() == 2).await;
    let echoed = engine
        .messages()
        .into_iter()
        .find_map(|m| m.id)
        .unwrap();

    engine.delete_message(&echoed).await.unwrap();
    let thread = engine.messages();
    assert_eq!(thread.len(), 1);
    assert_eq!(thread[0].status, DeliveryStatus::Failed);

    let removed = engine.dismiss_failed(temp_id).unwrap();
    assert_eq!(removed.content, "slow");
    assert!(engine.messages().is_empty());
}
