//! Conversation synchronization engine.
//!
//! [`ConversationSyncEngine`] reconciles three sources of truth for one
//! conversation: the cached window of history, the live push feed, and
//! locally-originated optimistic mutations. It is the only type
//! presentation code talks to; the components it composes are public for
//! reuse and testing.
//!
//! All mutable state sits behind one `parking_lot::Mutex` that is never held
//! across an `.await`. Every operation that suspends captures the engine
//! epoch first and drops its result if [`deactivate`](ConversationSyncEngine::deactivate)
//! ran in the meantime.

pub mod mutation;
pub mod outbound;
pub mod pagination;
pub mod reply;
pub mod store;

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use threadsync_proto::message::{
    ClientTempId, ConversationId, Message, MessageId, MessageRef, SenderId, ValidationError,
};
use threadsync_proto::record::{RecordError, RemoteRecord};

use crate::config::SyncConfig;
use crate::remote::{LiveSubscription, RemoteError, RemoteSource};

use mutation::OptimisticMutationQueue;
use pagination::PaginationController;
use reply::ReplyContext;
use store::{MessageStore, ReplyPreview};

/// Errors returned by engine operations.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// The message was rejected before anything was staged.
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// The remote returned a record that failed identity checks.
    #[error("invalid remote record: {0}")]
    Record(#[from] RecordError),

    /// A remote request failed.
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),

    /// The create mutation failed; the entry is now `Failed`.
    #[error("send {temp_id} failed: {source}")]
    SendFailed {
        /// Temp id of the failed entry.
        temp_id: ClientTempId,
        /// Underlying remote error.
        source: RemoteError,
    },

    /// The delete mutation failed; the entry stays removed locally.
    #[error("delete of {id} failed: {source}")]
    DeleteFailed {
        /// Durable id of the message.
        id: MessageId,
        /// Underlying remote error.
        source: RemoteError,
    },

    /// The engine is not active, or was torn down while the operation ran.
    #[error("conversation engine is not active")]
    Inactive,

    /// No failed send exists for the temp id.
    #[error("no failed send {0}")]
    UnknownFailedSend(ClientTempId),
}

/// Notifications for presentation code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// The visible thread changed; re-read [`ConversationSyncEngine::messages`].
    ThreadChanged,
    /// A send failed and its entry is now `Failed`.
    SendFailed {
        /// Temp id of the failed entry.
        temp_id: ClientTempId,
        /// Why the remote refused or could not be reached.
        error: RemoteError,
    },
    /// A delete failed remotely. The entry stays removed.
    DeleteFailed {
        /// Durable id of the message.
        id: MessageId,
        /// Why the remote failed.
        error: RemoteError,
    },
    /// A history fetch failed. The caller may try again.
    HistoryLoadFailed {
        /// Why the remote failed.
        error: RemoteError,
    },
    /// The beginning of the conversation has been reached.
    HistoryExhausted,
    /// The remote ended the live feed while the engine was active.
    LiveFeedClosed,
}

/// Outcome of [`ConversationSyncEngine::load_older_messages`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOlder {
    /// A page was fetched and merged.
    Loaded {
        /// Entries that were not already cached.
        inserted: usize,
        /// Whether this page reached the beginning of the conversation.
        exhausted: bool,
    },
    /// Another fetch is in flight; nothing was issued.
    AlreadyLoading,
    /// No older messages remain; nothing was issued.
    Exhausted,
}

/// Everything guarded by the engine lock.
#[derive(Debug)]
pub(crate) struct ConversationState {
    pub(crate) store: MessageStore,
    pub(crate) pagination: PaginationController,
    pub(crate) mutations: OptimisticMutationQueue,
    pub(crate) reply: ReplyContext,
    pub(crate) active: bool,
    pub(crate) epoch: u64,
}

impl ConversationState {
    /// Errors unless the engine is active; returns the current epoch.
    pub(crate) fn require_active(&self) -> Result<u64, SyncError> {
        if self.active {
            Ok(self.epoch)
        } else {
            Err(SyncError::Inactive)
        }
    }

    /// Whether an operation started at `epoch` may still apply its result.
    pub(crate) const fn is_current(&self, epoch: u64) -> bool {
        self.active && self.epoch == epoch
    }
}

/// A marker set before a remote call and settled once it returns.
#[derive(Debug)]
pub(crate) enum InFlight {
    Page,
    Send(ClientTempId),
    Delete(MessageId),
}

/// Rolls an [`InFlight`] marker back if the future awaiting the remote is
/// dropped before the call returns.
///
/// - fetch: pagination returns to idle
/// - send: the entry becomes `Failed` and can be retried or dismissed
/// - delete: repeats are no longer suppressed; the entry stays removed
pub(crate) struct InFlightGuard<'a> {
    state: &'a Mutex<ConversationState>,
    events: &'a mpsc::Sender<SyncEvent>,
    epoch: u64,
    marker: Option<InFlight>,
}

impl InFlightGuard<'_> {
    /// The remote call returned; the caller settles the marker itself.
    pub(crate) fn disarm(mut self) {
        self.marker = None;
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let Some(marker) = self.marker.take() else {
            return;
        };
        tracing::debug!(?marker, "remote call abandoned");
        let mut guard = self.state.lock();
        if !guard.is_current(self.epoch) {
            return;
        }
        let state = &mut *guard;
        match marker {
            InFlight::Page => state.pagination.cancel(),
            InFlight::Delete(id) => state.mutations.cancel_delete(&id),
            InFlight::Send(temp) => {
                let error = RemoteError::Cancelled;
                if state.mutations.fail_send(&mut state.store, temp, &error) {
                    drop(guard);
                    let _ = self.events.try_send(SyncEvent::ThreadChanged);
                    let _ = self.events.try_send(SyncEvent::SendFailed {
                        temp_id: temp,
                        error,
                    });
                }
            }
        }
    }
}

/// Sync engine for a single conversation.
///
/// Created inactive. [`activate`](Self::activate) opens the live feed;
/// [`deactivate`](Self::deactivate) closes it and discards all state.
/// Dropping the engine also closes the feed.
pub struct ConversationSyncEngine<R: RemoteSource> {
    pub(crate) remote: R,
    pub(crate) conversation_id: ConversationId,
    pub(crate) sender_id: SenderId,
    pub(crate) state: Arc<Mutex<ConversationState>>,
    pub(crate) event_tx: mpsc::Sender<SyncEvent>,
    live_task: Mutex<Option<JoinHandle<()>>>,
}

impl<R: RemoteSource> ConversationSyncEngine<R> {
    /// Creates an inactive engine.
    ///
    /// Returns the engine and a receiver for [`SyncEvent`]s. Events are
    /// dropped when the receiver lags behind `config.event_buffer`.
    pub fn new(
        remote: R,
        conversation_id: ConversationId,
        sender_id: SenderId,
        config: &SyncConfig,
    ) -> (Self, mpsc::Receiver<SyncEvent>) {
        let (event_tx, event_rx) = mpsc::channel(config.event_buffer.max(1));
        let state = ConversationState {
            store: MessageStore::new(conversation_id.clone()),
            pagination: PaginationController::new(config.page_size),
            mutations: OptimisticMutationQueue::new(),
            reply: ReplyContext::new(),
            active: false,
            epoch: 0,
        };
        let engine = Self {
            remote,
            conversation_id,
            sender_id,
            state: Arc::new(Mutex::new(state)),
            event_tx,
            live_task: Mutex::new(None),
        };
        (engine, event_rx)
    }

    /// Subscribes to the live feed. Every snapshot is validated and merged.
    ///
    /// Calling this on an active engine does nothing.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Remote`] if the subscription cannot be opened,
    /// or [`SyncError::Inactive`] if [`deactivate`](Self::deactivate) ran
    /// while it was being opened.
    pub async fn activate(&self) -> Result<(), SyncError> {
        let epoch = {
            let mut state = self.state.lock();
            if state.active {
                tracing::debug!(conversation = %self.conversation_id, "already active");
                return Ok(());
            }
            state.active = true;
            state.epoch += 1;
            state.epoch
        };

        let subscription = match self.remote.subscribe_live(&self.conversation_id).await {
            Ok(s) => s,
            Err(e) => {
                let mut state = self.state.lock();
                if state.epoch == epoch {
                    state.active = false;
                }
                tracing::warn!(conversation = %self.conversation_id, error = %e, "live subscription failed");
                return Err(e.into());
            }
        };

        if !self.state.lock().is_current(epoch) {
            subscription.unsubscribe();
            return Err(SyncError::Inactive);
        }

        let handle = tokio::spawn(forward_live(
            subscription,
            Arc::clone(&self.state),
            self.event_tx.clone(),
            self.conversation_id.clone(),
            epoch,
        ));
        if let Some(previous) = self.live_task.lock().replace(handle) {
            previous.abort();
        }
        tracing::info!(conversation = %self.conversation_id, "conversation activated");
        Ok(())
    }

    /// Unsubscribes and discards every cached message and pending mutation.
    ///
    /// Results of requests still in flight are ignored when they arrive.
    /// Returns once the live subscription has been released.
    pub async fn deactivate(&self) {
        {
            let mut state = self.state.lock();
            state.active = false;
            state.epoch += 1;
            state.store.clear();
            state.pagination.reset();
            state.mutations.clear();
            state.reply.clear();
        }
        let handle = self.live_task.lock().take();
        if let Some(handle) = handle {
            handle.abort();
            // Resolves once the task (and its subscription) has been dropped.
            let _ = handle.await;
        }
        tracing::info!(conversation = %self.conversation_id, "conversation deactivated");
    }

    /// Fetches the next page of older history.
    ///
    /// A no-op while a fetch is in flight or after the beginning of the
    /// conversation was reached. Failures are never retried automatically.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Remote`] if the fetch failed (also reported by
    /// [`pagination_error`](Self::pagination_error)), or
    /// [`SyncError::Inactive`] if the engine is or became inactive.
    pub async fn load_older_messages(&self) -> Result<LoadOlder, SyncError> {
        let (epoch, request) = {
            let mut guard = self.state.lock();
            let epoch = guard.require_active()?;
            let state = &mut *guard;
            let Some(request) = state.pagination.try_begin(&state.store) else {
                return Ok(if state.pagination.is_exhausted() {
                    LoadOlder::Exhausted
                } else {
                    LoadOlder::AlreadyLoading
                });
            };
            (epoch, request)
        };
        tracing::debug!(
            conversation = %self.conversation_id,
            cursor = ?request.cursor,
            page_size = request.page_size,
            "loading older page"
        );

        let pending = self.in_flight(epoch, InFlight::Page);
        let result = self
            .remote
            .fetch_older_page(&self.conversation_id, request.cursor.as_ref(), request.page_size)
            .await;
        pending.disarm();

        let page = {
            let mut guard = self.state.lock();
            if !guard.is_current(epoch) {
                tracing::debug!(conversation = %self.conversation_id, "discarding page after teardown");
                return Err(SyncError::Inactive);
            }
            match result {
                Ok(page) => page,
                Err(e) => {
                    guard.pagination.fail(&e);
                    drop(guard);
                    tracing::warn!(
                        conversation = %self.conversation_id,
                        error = %e,
                        transient = e.is_transient(),
                        "history fetch failed"
                    );
                    self.emit(SyncEvent::HistoryLoadFailed { error: e.clone() });
                    return Err(e.into());
                }
            }
        };

        let (messages, dropped) = validate_records(page.records, &self.conversation_id);
        let (stats, exhausted) = {
            let mut guard = self.state.lock();
            if !guard.is_current(epoch) {
                return Err(SyncError::Inactive);
            }
            let state = &mut *guard;
            // Dropped records still count toward the page the remote filled.
            let requested = request.page_size.saturating_sub(dropped);
            let stats = state
                .store
                .append_older_page(messages, page.next_cursor, requested);
            let exhausted = state.store.is_exhausted();
            state.pagination.complete(exhausted);
            (stats, exhausted)
        };

        if stats.changed() {
            self.emit(SyncEvent::ThreadChanged);
        }
        if exhausted {
            self.emit(SyncEvent::HistoryExhausted);
        }
        Ok(LoadOlder::Loaded {
            inserted: stats.inserted,
            exhausted,
        })
    }

    /// Newest-first copy of the visible thread.
    #[must_use]
    pub fn messages(&self) -> Vec<Message> {
        self.state.lock().store.snapshot()
    }

    /// Whether a history fetch is in flight.
    #[must_use]
    pub fn is_loading_older(&self) -> bool {
        self.state.lock().pagination.is_loading()
    }

    /// Whether older history may remain.
    #[must_use]
    pub fn has_older_messages(&self) -> bool {
        let state = self.state.lock();
        !state.store.is_exhausted() && !state.pagination.is_exhausted()
    }

    /// Error of the most recent failed history fetch.
    #[must_use]
    pub fn pagination_error(&self) -> Option<RemoteError> {
        self.state.lock().pagination.last_error().cloned()
    }

    /// Whether any send awaits its response.
    #[must_use]
    pub fn is_sending(&self) -> bool {
        self.state.lock().mutations.is_sending()
    }

    /// Targets `target` for the next send.
    pub fn set_reply_target(&self, target: MessageRef) {
        self.state.lock().reply.set(target);
    }

    /// Cancels the reply marker.
    pub fn clear_reply_target(&self) {
        self.state.lock().reply.clear();
    }

    /// Current reply target.
    #[must_use]
    pub fn reply_target(&self) -> Option<MessageRef> {
        self.state.lock().reply.target().cloned()
    }

    /// Resolves a reply reference against the cache.
    #[must_use]
    pub fn resolve_reply(&self, reference: &MessageRef) -> ReplyPreview {
        self.state.lock().store.resolve_reply(reference)
    }

    /// Why the send with `temp` failed, while its entry is visible.
    #[must_use]
    pub fn failure_reason(&self, temp: ClientTempId) -> Option<String> {
        self.state
            .lock()
            .mutations
            .failure_reason(temp)
            .map(ToString::to_string)
    }

    /// Whether the live feed is open.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state.lock().active
    }

    /// The conversation this engine syncs.
    #[must_use]
    pub const fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    /// Arms a guard for `marker`, set under `epoch`, across one remote call.
    pub(crate) fn in_flight(&self, epoch: u64, marker: InFlight) -> InFlightGuard<'_> {
        InFlightGuard {
            state: &self.state,
            events: &self.event_tx,
            epoch,
            marker: Some(marker),
        }
    }

    pub(crate) fn emit(&self, event: SyncEvent) {
        let _ = self.event_tx.try_send(event);
    }
}

impl<R: RemoteSource> Drop for ConversationSyncEngine<R> {
    fn drop(&mut self) {
        if let Some(handle) = self.live_task.get_mut().take() {
            handle.abort();
        }
    }
}

/// Converts remote records, dropping the ones that fail identity checks.
///
/// Returns the valid messages and how many records were dropped.
pub(crate) fn validate_records(
    records: Vec<RemoteRecord>,
    conversation: &ConversationId,
) -> (Vec<Message>, usize) {
    let mut dropped = 0;
    let messages = records
        .into_iter()
        .filter_map(|record| match Message::from_record(record, conversation) {
            Ok(msg) => Some(msg),
            Err(e) => {
                dropped += 1;
                tracing::warn!(conversation = %conversation, error = %e, "dropping invalid record");
                None
            }
        })
        .collect();
    (messages, dropped)
}

/// Merges live snapshots until the feed ends or the engine epoch moves on.
async fn forward_live(
    mut subscription: LiveSubscription,
    state: Arc<Mutex<ConversationState>>,
    event_tx: mpsc::Sender<SyncEvent>,
    conversation: ConversationId,
    epoch: u64,
) {
    while let Some(snapshot) = subscription.next_snapshot().await {
        let (messages, _) = validate_records(snapshot, &conversation);
        let stats = {
            let mut state = state.lock();
            if !state.is_current(epoch) {
                break;
            }
            state.store.merge_live_page(messages)
        };
        tracing::debug!(
            conversation = %conversation,
            inserted = stats.inserted,
            reconciled = stats.reconciled,
            removed = stats.removed,
            "live snapshot merged"
        );
        if stats.changed() {
            let _ = event_tx.try_send(SyncEvent::ThreadChanged);
        }
    }

    if state.lock().is_current(epoch) {
        tracing::warn!(conversation = %conversation, "live feed closed by remote");
        let _ = event_tx.try_send(SyncEvent::LiveFeedClosed);
    }
    subscription.unsubscribe();
}
