//! Ordered, deduplicated message cache for one conversation.
//!
//! Entries are kept in a `BTreeMap` keyed by `(created_at, identity, seq)`,
//! so the rendered order never depends on hash iteration. Unconfirmed
//! entries have an empty identity and sort below confirmed ones with the
//! same timestamp. Secondary indexes
//! map durable ids and client temp ids to their slot. Temp ids keep
//! resolving after reconciliation, which lets a reply that targeted a
//! pending message still find it once confirmed.
//!
//! Every operation here is synchronous and infallible. Anomalies (stale
//! reconciliation, foreign records) are logged and ignored.

use std::collections::{BTreeMap, HashMap, HashSet};

use threadsync_proto::message::{
    ClientTempId, ConversationId, DeliveryStatus, Message, MessageId, MessageRef, Timestamp,
};
use threadsync_proto::page::PageCursor;

/// Position of an entry in the thread. Ascending key order is oldest first.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct SlotKey {
    created_at: Timestamp,
    identity: String,
    seq: u64,
}

#[derive(Debug, Clone)]
struct Slot {
    message: Message,
    /// Every temp id that resolves to this slot.
    temps: Vec<ClientTempId>,
}

/// What happened to one incoming message during a merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// A new entry was added.
    Inserted,
    /// An existing entry with the same durable id was refreshed.
    Updated,
    /// A pending entry was matched by temp id and confirmed in place.
    Reconciled,
    /// The entry was removed because the record is deleted.
    Removed,
    /// The record was ignored (tombstoned, foreign, or lacking an id).
    Skipped,
}

/// Per-batch merge counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    /// New entries.
    pub inserted: usize,
    /// Entries refreshed in place.
    pub updated: usize,
    /// Pending entries confirmed by an echo.
    pub reconciled: usize,
    /// Entries removed by deleted records.
    pub removed: usize,
    /// Records ignored.
    pub skipped: usize,
}

impl MergeStats {
    fn record(&mut self, outcome: MergeOutcome) {
        match outcome {
            MergeOutcome::Inserted => self.inserted += 1,
            MergeOutcome::Updated => self.updated += 1,
            MergeOutcome::Reconciled => self.reconciled += 1,
            MergeOutcome::Removed => self.removed += 1,
            MergeOutcome::Skipped => self.skipped += 1,
        }
    }

    /// Whether the batch changed the visible thread.
    #[must_use]
    pub const fn changed(&self) -> bool {
        self.inserted + self.updated + self.reconciled + self.removed > 0
    }
}

/// Result of [`MessageStore::mark_delivered`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconcile {
    /// The pending entry was confirmed in place.
    Applied,
    /// The confirmed id was already present; the pending entry was merged into it.
    Folded,
    /// A live echo confirmed the entry first.
    AlreadyReconciled,
    /// No pending entry for the temp id; nothing changed.
    Stale,
}

/// A reply target as the presentation layer should render it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyPreview {
    /// The target is in the local cache.
    Loaded(Message),
    /// The target is not loaded (or was deleted); render a placeholder.
    Stub(MessageRef),
}

/// In-memory thread cache.
#[derive(Debug)]
pub struct MessageStore {
    conversation_id: ConversationId,
    slots: BTreeMap<SlotKey, Slot>,
    by_id: HashMap<MessageId, SlotKey>,
    by_temp: HashMap<ClientTempId, SlotKey>,
    tombstones: HashSet<MessageId>,
    cursor: Option<PageCursor>,
    exhausted: bool,
    next_seq: u64,
}

impl MessageStore {
    /// Creates an empty cache for `conversation_id`.
    #[must_use]
    pub fn new(conversation_id: ConversationId) -> Self {
        Self {
            conversation_id,
            slots: BTreeMap::new(),
            by_id: HashMap::new(),
            by_temp: HashMap::new(),
            tombstones: HashSet::new(),
            cursor: None,
            exhausted: false,
            next_seq: 0,
        }
    }

    /// The conversation this cache belongs to.
    #[must_use]
    pub const fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    /// Merges a batch of confirmed messages from the live feed.
    ///
    /// Matches by durable id first, then by pending temp id (the echo of a
    /// local send replaces its optimistic entry in the same slot), else
    /// inserts. Deleted records remove their entry; tombstoned ids are never
    /// brought back.
    pub fn merge_live_page(&mut self, messages: impl IntoIterator<Item = Message>) -> MergeStats {
        let mut stats = MergeStats::default();
        for msg in messages {
            stats.record(self.upsert(msg));
        }
        stats
    }

    /// Merges one page of older history and records pagination state.
    ///
    /// The cache is exhausted when fewer than `requested` messages arrived or
    /// the remote returned no next cursor.
    pub fn append_older_page(
        &mut self,
        messages: Vec<Message>,
        next_cursor: Option<PageCursor>,
        requested: usize,
    ) -> MergeStats {
        let received = messages.len();
        let mut stats = MergeStats::default();
        for msg in messages {
            stats.record(self.upsert(msg));
        }
        self.exhausted = received < requested || next_cursor.is_none();
        if next_cursor.is_some() {
            self.cursor = next_cursor;
        }
        tracing::debug!(
            conversation = %self.conversation_id,
            received,
            inserted = stats.inserted,
            exhausted = self.exhausted,
            "older page appended"
        );
        stats
    }

    /// Inserts a pending local message at the head of the thread.
    ///
    /// A local timestamp that lags the newest entry (device clock behind the
    /// server) is raised just above it. Once confirmed, the entry sorts by
    /// the server's timestamp.
    ///
    /// Returns `false` (and changes nothing) if the message is not a
    /// pending, temp-only entry or its temp id is already known.
    pub fn apply_optimistic_insert(&mut self, mut message: Message) -> bool {
        let Some(temp) = message.client_temp_id else {
            return false;
        };
        if message.status != DeliveryStatus::Pending
            || message.id.is_some()
            || self.by_temp.contains_key(&temp)
        {
            tracing::warn!(temp_id = %temp, "rejected optimistic insert");
            return false;
        }

        if let Some(newest) = self.slots.keys().next_back() {
            let above = Timestamp::from_millis(newest.created_at.as_millis().saturating_add(1));
            message.created_at = message.created_at.max(above);
        }
        self.place(Slot {
            message,
            temps: vec![temp],
        });
        true
    }

    /// Confirms a pending entry with the server's record.
    ///
    /// The entry moves to the server's timestamp and keeps the reply
    /// reference it was composed with. If `confirmed`'s id is
    /// already cached (an echo arrived without the temp id), the pending
    /// entry is folded into that one instead.
    pub fn mark_delivered(&mut self, temp: ClientTempId, confirmed: Message) -> Reconcile {
        let Some(key) = self.by_temp.get(&temp).cloned() else {
            tracing::warn!(temp_id = %temp, "stale reconciliation: unknown temp id");
            return Reconcile::Stale;
        };
        let Some(slot) = self.slots.get(&key) else {
            return Reconcile::Stale;
        };
        if slot.message.status != DeliveryStatus::Pending {
            if slot.message.id.is_some() && slot.message.id == confirmed.id {
                return Reconcile::AlreadyReconciled;
            }
            tracing::warn!(
                temp_id = %temp,
                status = ?slot.message.status,
                "stale reconciliation: entry no longer pending"
            );
            return Reconcile::Stale;
        }
        let Some(id) = confirmed.id.clone() else {
            tracing::warn!(temp_id = %temp, "stale reconciliation: confirmation has no id");
            return Reconcile::Stale;
        };

        if self.tombstones.contains(&id) {
            self.remove_slot(&key);
            tracing::debug!(temp_id = %temp, message_id = %id, "confirmed message already deleted");
            return Reconcile::Folded;
        }

        if let Some(existing) = self.by_id.get(&id).cloned() {
            let Some(removed) = self.slots.remove(&key) else {
                return Reconcile::Stale;
            };
            if let Some(target) = self.slots.get_mut(&existing) {
                target.message.client_temp_id.get_or_insert(temp);
                if removed.message.reply_to.is_some() {
                    target.message.reply_to = removed.message.reply_to;
                }
                for alias in removed.temps {
                    self.by_temp.insert(alias, existing.clone());
                    target.temps.push(alias);
                }
            }
            tracing::debug!(temp_id = %temp, message_id = %id, "pending entry folded into echo");
            return Reconcile::Folded;
        }

        let Some(mut slot) = self.slots.remove(&key) else {
            return Reconcile::Stale;
        };
        let reply_to = slot.message.reply_to.take().or(confirmed.reply_to);
        slot.message = Message {
            client_temp_id: Some(temp),
            reply_to,
            status: DeliveryStatus::Sent,
            ..confirmed
        };
        self.place(slot);
        Reconcile::Applied
    }

    /// Moves a pending entry to `Failed`. The entry stays visible.
    ///
    /// Returns `false` if there is no pending entry for `temp`.
    pub fn mark_failed(&mut self, temp: ClientTempId) -> bool {
        let slot = self
            .by_temp
            .get(&temp)
            .and_then(|key| self.slots.get_mut(key));
        match slot {
            Some(slot) if slot.message.status == DeliveryStatus::Pending => {
                slot.message.status = DeliveryStatus::Failed;
                true
            }
            _ => {
                tracing::warn!(temp_id = %temp, "stale failure: no pending entry");
                false
            }
        }
    }

    /// Removes the entry with durable id `id` and tombstones the id.
    ///
    /// Idempotent. Returns whether an entry was removed.
    pub fn mark_deleted(&mut self, id: &MessageId) -> bool {
        self.tombstones.insert(id.clone());
        let Some(key) = self.by_id.get(id).cloned() else {
            tracing::debug!(message_id = %id, "stale delete: id not cached");
            return false;
        };
        self.remove_slot(&key).is_some()
    }

    /// Removes a failed send. Returns the removed message.
    pub fn remove_failed(&mut self, temp: ClientTempId) -> Option<Message> {
        let key = self.by_temp.get(&temp)?.clone();
        if self.slots.get(&key)?.message.status != DeliveryStatus::Failed {
            return None;
        }
        self.remove_slot(&key)
    }

    /// Newest-first copy of the thread.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Message> {
        self.slots.values().rev().map(|s| s.message.clone()).collect()
    }

    /// Looks up an entry by durable or temp reference.
    #[must_use]
    pub fn get(&self, reference: &MessageRef) -> Option<&Message> {
        let key = match reference {
            MessageRef::Durable(id) => self.by_id.get(id)?,
            MessageRef::Temp(temp) => self.by_temp.get(temp)?,
        };
        self.slots.get(key).map(|s| &s.message)
    }

    /// Whether a reference resolves to a cached entry.
    #[must_use]
    pub fn contains(&self, reference: &MessageRef) -> bool {
        self.get(reference).is_some()
    }

    /// Rewrites a temp reference to the durable id once the target is confirmed.
    #[must_use]
    pub fn canonical_ref(&self, reference: &MessageRef) -> MessageRef {
        match self.get(reference).and_then(|m| m.id.clone()) {
            Some(id) => MessageRef::Durable(id),
            None => reference.clone(),
        }
    }

    /// Resolves a reply reference; targets outside the cache become stubs.
    #[must_use]
    pub fn resolve_reply(&self, reference: &MessageRef) -> ReplyPreview {
        self.get(reference).map_or_else(
            || ReplyPreview::Stub(reference.clone()),
            |m| ReplyPreview::Loaded(m.clone()),
        )
    }

    /// Whether `id` has been deleted during this session.
    #[must_use]
    pub fn is_tombstoned(&self, id: &MessageId) -> bool {
        self.tombstones.contains(id)
    }

    /// Cursor for the next older page, if any page has been loaded.
    #[must_use]
    pub const fn cursor(&self) -> Option<&PageCursor> {
        self.cursor.as_ref()
    }

    /// Whether the remote has no older messages.
    #[must_use]
    pub const fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Number of visible entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the thread is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Discards every entry, tombstone and pagination state.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.by_id.clear();
        self.by_temp.clear();
        self.tombstones.clear();
        self.cursor = None;
        self.exhausted = false;
    }

    fn next_key(&mut self, created_at: Timestamp, identity: String) -> SlotKey {
        self.next_seq += 1;
        SlotKey {
            created_at,
            identity,
            seq: self.next_seq,
        }
    }

    /// Inserts `slot` under the key its message sorts by and points the
    /// indexes at it.
    fn place(&mut self, slot: Slot) {
        let identity = slot
            .message
            .id
            .as_ref()
            .map_or_else(String::new, ToString::to_string);
        let key = self.next_key(slot.message.created_at, identity);
        if let Some(id) = &slot.message.id {
            self.by_id.insert(id.clone(), key.clone());
        }
        for temp in &slot.temps {
            self.by_temp.insert(*temp, key.clone());
        }
        self.slots.insert(key, slot);
    }

    fn remove_slot(&mut self, key: &SlotKey) -> Option<Message> {
        let slot = self.slots.remove(key)?;
        if let Some(id) = &slot.message.id
            && self.by_id.get(id) == Some(key)
        {
            self.by_id.remove(id);
        }
        for temp in &slot.temps {
            if self.by_temp.get(temp) == Some(key) {
                self.by_temp.remove(temp);
            }
        }
        Some(slot.message)
    }

    fn upsert(&mut self, mut msg: Message) -> MergeOutcome {
        if msg.conversation_id != self.conversation_id {
            tracing::warn!(
                expected = %self.conversation_id,
                actual = %msg.conversation_id,
                "dropping message from another conversation"
            );
            return MergeOutcome::Skipped;
        }
        let Some(id) = msg.id.clone() else {
            tracing::warn!(temp_id = ?msg.client_temp_id, "dropping record without durable id");
            return MergeOutcome::Skipped;
        };
        if self.tombstones.contains(&id) {
            return MergeOutcome::Skipped;
        }
        if msg.status == DeliveryStatus::Deleted {
            return if self.mark_deleted(&id) {
                MergeOutcome::Removed
            } else {
                MergeOutcome::Skipped
            };
        }
        msg.status = DeliveryStatus::Sent;

        if let Some(key) = self.by_id.get(&id).cloned() {
            self.refresh(key, msg);
            return MergeOutcome::Updated;
        }

        if let Some(temp) = msg.client_temp_id
            && let Some(key) = self.by_temp.get(&temp).cloned()
            && self
                .slots
                .get(&key)
                .is_some_and(|slot| slot.message.status == DeliveryStatus::Pending)
            && let Some(mut slot) = self.slots.remove(&key)
        {
            msg.reply_to = slot.message.reply_to.take().or(msg.reply_to);
            slot.message = msg;
            self.place(slot);
            return MergeOutcome::Reconciled;
        }

        // A temp id already owned by another entry (a failed send whose
        // echo arrived late) stays with that entry.
        let temps = msg
            .client_temp_id
            .filter(|temp| !self.by_temp.contains_key(temp))
            .into_iter()
            .collect();
        self.place(Slot {
            message: msg,
            temps,
        });
        MergeOutcome::Inserted
    }

    /// Replaces an existing confirmed entry, moving it if its timestamp changed.
    fn refresh(&mut self, key: SlotKey, mut msg: Message) {
        let Some(mut slot) = self.slots.remove(&key) else {
            return;
        };
        if msg.client_temp_id.is_none() {
            msg.client_temp_id = slot.message.client_temp_id;
        }
        // Own sends keep the reply reference they were composed with.
        let local_reply = slot.message.reply_to.take();
        msg.reply_to = if slot.temps.is_empty() {
            msg.reply_to.or(local_reply)
        } else {
            local_reply.or(msg.reply_to)
        };
        slot.message = msg;
        if slot.message.created_at == key.created_at {
            self.slots.insert(key, slot);
        } else {
            self.place(slot);
        }
    }
}
