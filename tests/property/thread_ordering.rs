//! Property-based tests for thread ordering and deduplication.
//!
//! Uses proptest to verify, for arbitrary interleavings of live merges,
//! older-page appends, deletes, optimistic sends and their confirmations:
//! 1. The snapshot is strictly ordered newest first by `(created_at, id)`.
//! 2. No durable id appears twice.
//! 3. A deleted id never reappears.
//! 4. Re-delivering the same batch changes nothing.

use std::collections::HashSet;

use proptest::prelude::*;
use threadsync::sync::store::MessageStore;
use threadsync_proto::message::*;
use threadsync_proto::page::PageCursor;

// --- Strategies ---

fn conv() -> ConversationId {
    ConversationId::new("conv-1")
}

/// Small id and timestamp ranges so duplicates and ties are common.
fn arb_message() -> impl Strategy<Value = Message> {
    (0u8..24, 0u64..8, "[a-z ]{0,12}", any::<bool>()).prop_map(|(n, at, content, deleted)| {
        Message {
            id: Some(MessageId::new(format!("m-{n:02}"))),
            client_temp_id: None,
            conversation_id: conv(),
            sender_id: SenderId::new("bob"),
            content,
            attachment: None,
            reply_to: None,
            created_at: Timestamp::from_millis(at),
            // Deletions are rarer than live messages in practice.
            status: if deleted && n % 5 == 0 {
                DeliveryStatus::Deleted
            } else {
                DeliveryStatus::Sent
            },
        }
    })
}

#[derive(Debug, Clone)]
enum Op {
    Live(Vec<Message>),
    Older(Vec<Message>, bool),
    Delete(u8),
    Send,
    /// Confirms the n-th local send with a server id and timestamp.
    Confirm(usize, u8, u64),
    Fail(usize),
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => prop::collection::vec(arb_message(), 0..12).prop_map(Op::Live),
        2 => (prop::collection::vec(arb_message(), 0..12), any::<bool>())
            .prop_map(|(msgs, more)| Op::Older(msgs, more)),
        1 => (0u8..24).prop_map(Op::Delete),
        2 => Just(Op::Send),
        2 => (0usize..8, 0u8..24, 0u64..8).prop_map(|(i, n, at)| Op::Confirm(i, n, at)),
        1 => (0usize..8).prop_map(Op::Fail),
    ]
}

/// Applies `op`, recording deleted ids and the temp ids of local sends.
fn apply(
    store: &mut MessageStore,
    op: Op,
    deleted: &mut HashSet<MessageId>,
    sends: &mut Vec<ClientTempId>,
) {
    match op {
        Op::Live(msgs) => {
            for m in &msgs {
                if m.status == DeliveryStatus::Deleted {
                    deleted.extend(m.id.clone());
                }
            }
            store.merge_live_page(msgs);
        }
        Op::Older(msgs, more) => {
            for m in &msgs {
                if m.status == DeliveryStatus::Deleted {
                    deleted.extend(m.id.clone());
                }
            }
            let cursor = more.then(|| PageCursor::new("next"));
            store.append_older_page(msgs, cursor, 12);
        }
        Op::Delete(n) => {
            let id = MessageId::new(format!("m-{n:02}"));
            store.mark_deleted(&id);
            deleted.insert(id);
        }
        Op::Send => {
            let temp = ClientTempId::new();
            let msg = Message::pending(
                temp,
                conv(),
                SenderId::new("alice"),
                "local".to_string(),
                None,
                None,
            );
            assert!(store.apply_optimistic_insert(msg));
            sends.push(temp);
        }
        Op::Confirm(i, n, at) => {
            if let Some(&temp) = sends.get(i) {
                let confirmed = Message {
                    id: Some(MessageId::new(format!("m-{n:02}"))),
                    client_temp_id: Some(temp),
                    conversation_id: conv(),
                    sender_id: SenderId::new("alice"),
                    content: "local".to_string(),
                    attachment: None,
                    reply_to: None,
                    created_at: Timestamp::from_millis(at),
                    status: DeliveryStatus::Sent,
                };
                store.mark_delivered(temp, confirmed);
            }
        }
        Op::Fail(i) => {
            if let Some(&temp) = sends.get(i) {
                store.mark_failed(temp);
            }
        }
    }
}

// --- Properties ---

proptest! {
    #[test]
    fn snapshot_is_strictly_ordered_and_deduplicated(ops in prop::collection::vec(arb_op(), 0..24)) {
        let mut store = MessageStore::new(conv());
        let mut deleted = HashSet::new();
        let mut sends = Vec::new();
        for op in ops {
            apply(&mut store, op, &mut deleted, &mut sends);
        }

        let thread = store.snapshot();
        prop_assert_eq!(thread.len(), store.len());
        for pair in thread.windows(2) {
            prop_assert!(
                (pair[0].created_at, &pair[0].id) > (pair[1].created_at, &pair[1].id),
                "out of order: {:?} before {:?}", pair[0].id, pair[1].id
            );
        }

        let mut seen = HashSet::new();
        for msg in &thread {
            let Some(id) = msg.id.clone() else {
                prop_assert!(matches!(
                    msg.status,
                    DeliveryStatus::Pending | DeliveryStatus::Failed
                ));
                continue;
            };
            prop_assert!(!deleted.contains(&id), "deleted id {} resurrected", id);
            prop_assert!(seen.insert(id), "duplicate id");
            prop_assert_eq!(msg.status, DeliveryStatus::Sent);
        }
    }

    #[test]
    fn redelivering_a_batch_is_idempotent(
        history in prop::collection::vec(arb_op(), 0..8),
        batch in prop::collection::vec(arb_message(), 0..12),
    ) {
        let mut store = MessageStore::new(conv());
        let mut deleted = HashSet::new();
        let mut sends = Vec::new();
        for op in history {
            apply(&mut store, op, &mut deleted, &mut sends);
        }

        store.merge_live_page(batch.clone());
        let once = store.snapshot();
        store.merge_live_page(batch);
        prop_assert_eq!(once, store.snapshot());
    }

    #[test]
    fn exhaustion_follows_page_shape(count in 0usize..30, requested in 1usize..25, more in any::<bool>()) {
        let mut store = MessageStore::new(conv());
        let page: Vec<Message> = (0..count)
            .map(|i| Message {
                id: Some(MessageId::new(format!("p-{i:03}"))),
                client_temp_id: None,
                conversation_id: conv(),
                sender_id: SenderId::new("bob"),
                content: String::new(),
                attachment: None,
                reply_to: None,
                created_at: Timestamp::from_millis(i as u64),
                status: DeliveryStatus::Sent,
            })
            .collect();
        let cursor = more.then(|| PageCursor::new("next"));
        store.append_older_page(page, cursor, requested);

        prop_assert_eq!(store.is_exhausted(), count < requested || !more);
        prop_assert_eq!(store.len(), count);
    }
}
