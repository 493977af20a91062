//! In-memory remote backend for testing and the demo binary.
//!
//! Keeps every conversation as an ordered list of [`RemoteRecord`]s and
//! pushes a snapshot of the newest records to each live subscriber after
//! every write, the way a reactive query backend re-runs a subscribed query.
//!
//! Failure injection and response pausing let tests hold a request
//! in flight or make it fail without any real network.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use threadsync_proto::message::{ConversationId, MessageId, SenderId, Timestamp};
use threadsync_proto::page::{Page, PageCursor};
use threadsync_proto::record::{CreateMessage, RemoteRecord};

use super::{LiveSubscription, RemoteError, RemoteSource};

/// Default number of newest records included in each live snapshot.
const DEFAULT_LIVE_WINDOW: usize = 20;

/// Default capacity of each subscriber's snapshot channel.
const DEFAULT_LIVE_BUFFER: usize = 32;

/// Creation time of the first seeded history record.
const SEED_BASE_MILLIS: u64 = 1_700_000_000_000;

/// Spacing between seeded history records.
const SEED_SPACING_MILLIS: u64 = 60_000;

#[derive(Default)]
struct Backend {
    /// Records per conversation, oldest first.
    threads: HashMap<ConversationId, Vec<RemoteRecord>>,
    /// Live subscribers per conversation.
    subscribers: HashMap<ConversationId, Vec<mpsc::Sender<Vec<RemoteRecord>>>>,
    next_id: u64,
    last_created_at: u64,
}

impl Backend {
    fn allocate_id(&mut self) -> MessageId {
        self.next_id += 1;
        MessageId::new(format!("m-{:06}", self.next_id))
    }

    /// Server clock: wall time, forced to be strictly increasing.
    fn stamp(&mut self) -> Timestamp {
        let now = Timestamp::now().as_millis();
        self.last_created_at = now.max(self.last_created_at + 1);
        Timestamp::from_millis(self.last_created_at)
    }

    fn insert(&mut self, record: RemoteRecord) {
        let thread = self
            .threads
            .entry(record.conversation_id.clone().unwrap_or_else(|| ConversationId::new("")))
            .or_default();
        let key = sort_key(&record);
        let at = thread.partition_point(|r| sort_key(r) <= key);
        thread.insert(at, record);
    }

    fn snapshot(&self, conversation: &ConversationId, window: usize) -> Vec<RemoteRecord> {
        self.threads
            .get(conversation)
            .map(|thread| thread.iter().rev().take(window).cloned().collect())
            .unwrap_or_default()
    }

    /// Drops closed subscribers and returns the live ones.
    fn live_senders(
        &mut self,
        conversation: &ConversationId,
    ) -> Vec<mpsc::Sender<Vec<RemoteRecord>>> {
        let Some(senders) = self.subscribers.get_mut(conversation) else {
            return Vec::new();
        };
        senders.retain(|tx| !tx.is_closed());
        senders.clone()
    }
}

fn sort_key(record: &RemoteRecord) -> (Timestamp, Option<MessageId>) {
    (
        record.created_at.unwrap_or(Timestamp::from_millis(0)),
        record.id.clone(),
    )
}

fn encode_cursor(record: &RemoteRecord) -> Option<PageCursor> {
    let id = record.id.as_ref()?;
    let created_at = record.created_at?;
    Some(PageCursor::new(format!("{}:{}", created_at.as_millis(), id)))
}

fn decode_cursor(cursor: &PageCursor) -> Result<(Timestamp, MessageId), RemoteError> {
    let (millis, id) = cursor
        .as_str()
        .split_once(':')
        .ok_or_else(|| RemoteError::Rejected(format!("invalid cursor {cursor}")))?;
    let millis = millis
        .parse::<u64>()
        .map_err(|_| RemoteError::Rejected(format!("invalid cursor {cursor}")))?;
    Ok((Timestamp::from_millis(millis), MessageId::new(id)))
}

/// In-process implementation of [`RemoteSource`].
pub struct InMemoryRemote {
    backend: Mutex<Backend>,
    /// `true` while responses flow; `false` holds every response.
    gate: watch::Sender<bool>,
    fail_fetch: AtomicBool,
    fail_create: AtomicBool,
    reject_create: AtomicBool,
    fail_delete: AtomicBool,
    echo_temp_ids: AtomicBool,
    auto_push: AtomicBool,
    fetch_calls: AtomicUsize,
    create_calls: AtomicUsize,
    delete_calls: AtomicUsize,
    live_window: usize,
    live_buffer: usize,
}

impl Default for InMemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRemote {
    /// Creates an empty backend with default live window and buffer sizes.
    #[must_use]
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_LIVE_WINDOW, DEFAULT_LIVE_BUFFER)
    }

    /// Creates an empty backend with custom live snapshot window and
    /// per-subscriber channel capacity.
    #[must_use]
    pub fn with_limits(live_window: usize, live_buffer: usize) -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            backend: Mutex::new(Backend::default()),
            gate,
            fail_fetch: AtomicBool::new(false),
            fail_create: AtomicBool::new(false),
            reject_create: AtomicBool::new(false),
            fail_delete: AtomicBool::new(false),
            echo_temp_ids: AtomicBool::new(true),
            auto_push: AtomicBool::new(true),
            fetch_calls: AtomicUsize::new(0),
            create_calls: AtomicUsize::new(0),
            delete_calls: AtomicUsize::new(0),
            live_window: live_window.max(1),
            live_buffer: live_buffer.max(1),
        }
    }

    /// Seeds `count` history records from `sender`, oldest first, spaced a
    /// minute apart in the past. Returns the created records.
    pub fn seed_history(
        &self,
        conversation: &ConversationId,
        sender: &SenderId,
        count: usize,
    ) -> Vec<RemoteRecord> {
        let mut backend = self.backend.lock();
        let base = backend.threads.get(conversation).map_or(0, Vec::len) as u64;
        let mut created = Vec::with_capacity(count);
        for i in 0..count as u64 {
            let n = base + i;
            let record = RemoteRecord {
                id: Some(backend.allocate_id()),
                conversation_id: Some(conversation.clone()),
                sender_id: Some(sender.clone()),
                content: Some(format!("history message {n}")),
                created_at: Some(Timestamp::from_millis(
                    SEED_BASE_MILLIS + n * SEED_SPACING_MILLIS,
                )),
                ..RemoteRecord::default()
            };
            backend.insert(record.clone());
            created.push(record);
        }
        created
    }

    /// Posts a message as another participant and notifies subscribers.
    pub fn post(
        &self,
        conversation: &ConversationId,
        sender: &SenderId,
        content: &str,
    ) -> RemoteRecord {
        let record = {
            let mut backend = self.backend.lock();
            let record = RemoteRecord {
                id: Some(backend.allocate_id()),
                conversation_id: Some(conversation.clone()),
                sender_id: Some(sender.clone()),
                content: Some(content.to_string()),
                created_at: Some(backend.stamp()),
                ..RemoteRecord::default()
            };
            backend.insert(record.clone());
            record
        };
        if self.auto_push.load(Ordering::SeqCst) {
            self.push_snapshot(conversation);
        }
        record
    }

    /// Pushes the current snapshot of `conversation` to every live subscriber.
    ///
    /// Returns the number of subscribers that accepted it. A subscriber
    /// whose buffer is full misses this snapshot; the next one supersedes it.
    pub fn push_snapshot(&self, conversation: &ConversationId) -> usize {
        let (senders, snapshot) = {
            let mut backend = self.backend.lock();
            let senders = backend.live_senders(conversation);
            (senders, backend.snapshot(conversation, self.live_window))
        };
        let mut delivered = 0;
        for tx in senders {
            match tx.try_send(snapshot.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::debug!(conversation = %conversation, error = %e, "live snapshot not delivered");
                }
            }
        }
        delivered
    }

    /// All records of a conversation, oldest first, including deleted ones.
    #[must_use]
    pub fn records(&self, conversation: &ConversationId) -> Vec<RemoteRecord> {
        self.backend
            .lock()
            .threads
            .get(conversation)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of live subscribers still registered on a conversation.
    #[must_use]
    pub fn subscriber_count(&self, conversation: &ConversationId) -> usize {
        self.backend.lock().live_senders(conversation).len()
    }

    /// Holds every response until [`resume`](Self::resume) is called.
    ///
    /// Writes still apply (and are pushed live) immediately; only the reply
    /// to the caller waits. This reproduces "echo before response" races.
    pub fn pause(&self) {
        self.gate.send_replace(false);
    }

    /// Releases held responses.
    pub fn resume(&self) {
        self.gate.send_replace(true);
    }

    /// Makes page fetches fail with a network error.
    pub fn set_fail_fetch(&self, fail: bool) {
        self.fail_fetch.store(fail, Ordering::SeqCst);
    }

    /// Makes create mutations fail with a network error.
    pub fn set_fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    /// Makes create mutations be rejected by the server.
    pub fn set_reject_create(&self, reject: bool) {
        self.reject_create.store(reject, Ordering::SeqCst);
    }

    /// Makes delete mutations fail with a network error.
    pub fn set_fail_delete(&self, fail: bool) {
        self.fail_delete.store(fail, Ordering::SeqCst);
    }

    /// Controls whether created records carry the client temp id back.
    pub fn set_echo_temp_ids(&self, echo: bool) {
        self.echo_temp_ids.store(echo, Ordering::SeqCst);
    }

    /// Controls whether writes are pushed to subscribers automatically.
    pub fn set_auto_push(&self, push: bool) {
        self.auto_push.store(push, Ordering::SeqCst);
    }

    /// Number of page fetches received.
    #[must_use]
    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    /// Number of create mutations received.
    #[must_use]
    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    /// Number of delete mutations received.
    #[must_use]
    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }

    async fn released(&self) -> Result<(), RemoteError> {
        let mut rx = self.gate.subscribe();
        rx.wait_for(|open| *open)
            .await
            .map(|_| ())
            .map_err(|_| RemoteError::Closed)
    }
}

impl RemoteSource for InMemoryRemote {
    async fn fetch_older_page(
        &self,
        conversation: &ConversationId,
        cursor: Option<&PageCursor>,
        page_size: usize,
    ) -> Result<Page, RemoteError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        self.released().await?;
        if self.fail_fetch.load(Ordering::SeqCst) {
            return Err(RemoteError::Network("history fetch failed".into()));
        }

        let bound = cursor.map(decode_cursor).transpose()?;
        let backend = self.backend.lock();
        let Some(thread) = backend.threads.get(conversation) else {
            return Ok(Page::default());
        };
        let older: Vec<&RemoteRecord> = thread
            .iter()
            .filter(|r| !r.deleted)
            .filter(|r| match &bound {
                Some((at, id)) => sort_key(r) < (*at, Some(id.clone())),
                None => true,
            })
            .collect();
        let start = older.len().saturating_sub(page_size);
        let records: Vec<RemoteRecord> = older[start..].iter().rev().map(|r| (*r).clone()).collect();
        let next_cursor = records.last().and_then(encode_cursor);
        drop(backend);

        Ok(Page {
            records,
            next_cursor,
        })
    }

    async fn subscribe_live(
        &self,
        conversation: &ConversationId,
    ) -> Result<LiveSubscription, RemoteError> {
        let (tx, rx) = mpsc::channel(self.live_buffer);
        {
            let mut backend = self.backend.lock();
            let initial = backend.snapshot(conversation, self.live_window);
            // Fresh channel: capacity is at least one, so this cannot be full.
            let _ = tx.try_send(initial);
            backend
                .subscribers
                .entry(conversation.clone())
                .or_default()
                .push(tx);
        }
        tracing::debug!(conversation = %conversation, "live subscriber registered");
        Ok(LiveSubscription::new(rx))
    }

    async fn create_message(&self, request: CreateMessage) -> Result<RemoteRecord, RemoteError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_create.load(Ordering::SeqCst) {
            self.released().await?;
            return Err(RemoteError::Network("connection reset".into()));
        }
        if self.reject_create.load(Ordering::SeqCst) {
            self.released().await?;
            return Err(RemoteError::Rejected("message not allowed".into()));
        }

        let conversation = request.conversation_id.clone();
        let record = {
            let mut backend = self.backend.lock();
            let record = RemoteRecord {
                id: Some(backend.allocate_id()),
                client_temp_id: self
                    .echo_temp_ids
                    .load(Ordering::SeqCst)
                    .then_some(request.client_temp_id),
                conversation_id: Some(request.conversation_id),
                sender_id: Some(request.sender_id),
                content: Some(request.content),
                attachment_ref: request.attachment_ref,
                reply_to_id: request.reply_to_id,
                created_at: Some(backend.stamp()),
                deleted: false,
            };
            backend.insert(record.clone());
            record
        };
        if self.auto_push.load(Ordering::SeqCst) {
            self.push_snapshot(&conversation);
        }

        self.released().await?;
        Ok(record)
    }

    async fn delete_message(&self, id: &MessageId) -> Result<(), RemoteError> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_delete.load(Ordering::SeqCst) {
            self.released().await?;
            return Err(RemoteError::Network("connection reset".into()));
        }

        let conversation = {
            let mut backend = self.backend.lock();
            backend.threads.iter_mut().find_map(|(conversation, thread)| {
                let record = thread.iter_mut().find(|r| r.id.as_ref() == Some(id))?;
                record.deleted = true;
                Some(conversation.clone())
            })
        };
        if let Some(conversation) = conversation
            && self.auto_push.load(Ordering::SeqCst)
        {
            self.push_snapshot(&conversation);
        }

        self.released().await?;
        Ok(())
    }
}
