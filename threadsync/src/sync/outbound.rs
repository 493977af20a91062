//! Outbound mutation methods for [`ConversationSyncEngine`].
//!
//! Sends and deletes are applied to the local thread before their request
//! is issued, so the change is visible ahead of both the response and any
//! live echo. Sends that fail stay visible as `Failed` until retried or
//! dismissed. Deletes that fail are not rolled back.

use threadsync_proto::message::{AttachmentRef, ClientTempId, Message, MessageId, MessageRef};
use threadsync_proto::record::RecordError;

use crate::remote::{RemoteError, RemoteSource};

use super::mutation::SendDraft;
use super::{ConversationSyncEngine, InFlight, SyncError, SyncEvent};

/// Outcome of [`ConversationSyncEngine::delete_message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// The entry was removed and the remote confirmed.
    Deleted,
    /// A delete of the same id was already in flight; nothing was issued.
    AlreadyDeleting,
}

impl<R: RemoteSource> ConversationSyncEngine<R> {
    /// Sends a text message, replying to the current reply target if any.
    ///
    /// The message appears at the head of the thread as `Pending` before
    /// the create request is issued. On success the reply target is cleared
    /// (unless the user picked another one meanwhile); on failure it is kept.
    ///
    /// The entry keeps the reply reference as selected, even a `Temp` one.
    /// The server is sent the durable id if that target has been confirmed.
    /// Dropping the returned future before the remote answers leaves the
    /// entry `Failed` with [`RemoteError::Cancelled`].
    ///
    /// # Errors
    ///
    /// - [`SyncError::Validation`] if the content is empty or too large
    /// - [`SyncError::SendFailed`] if the remote failed; the entry is `Failed`
    /// - [`SyncError::Inactive`] if the engine is or became inactive
    pub async fn send_message(&self, content: impl Into<String>) -> Result<MessageId, SyncError> {
        self.send_with_reply_context(SendDraft::text(content)).await
    }

    /// Sends an attachment-only message. Behaves like
    /// [`send_message`](Self::send_message).
    ///
    /// # Errors
    ///
    /// Same as [`send_message`](Self::send_message).
    pub async fn send_image_message(
        &self,
        attachment: AttachmentRef,
    ) -> Result<MessageId, SyncError> {
        self.send_with_reply_context(SendDraft::attachment(attachment))
            .await
    }

    /// Resubmits a failed send under a new temp id with the same content
    /// and reply reference. The failed entry is replaced.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::UnknownFailedSend`] if no failed entry exists
    /// for `temp`, otherwise as [`send_message`](Self::send_message).
    pub async fn retry_failed(&self, temp: ClientTempId) -> Result<MessageId, SyncError> {
        let draft = {
            let mut guard = self.state.lock();
            guard.require_active()?;
            let state = &mut *guard;
            let failed = state
                .mutations
                .take_failed(&mut state.store, temp)
                .ok_or(SyncError::UnknownFailedSend(temp))?;
            SendDraft::from(failed)
        };
        tracing::info!(temp_id = %temp, "retrying failed send");
        self.submit(draft, None).await
    }

    /// Removes a failed send from the thread. Returns the removed entry.
    pub fn dismiss_failed(&self, temp: ClientTempId) -> Option<Message> {
        let removed = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            state.mutations.take_failed(&mut state.store, temp)
        };
        if removed.is_some() {
            self.emit(SyncEvent::ThreadChanged);
        }
        removed
    }

    /// Deletes a confirmed message.
    ///
    /// The entry disappears immediately and its id is tombstoned. A second
    /// request for an id whose delete is in flight is suppressed. A reply
    /// marker pointing at the message is cleared.
    ///
    /// # Errors
    ///
    /// - [`SyncError::DeleteFailed`] if the remote failed; the entry stays removed
    /// - [`SyncError::Inactive`] if the engine is or became inactive
    pub async fn delete_message(&self, id: &MessageId) -> Result<DeleteOutcome, SyncError> {
        let epoch = {
            let mut guard = self.state.lock();
            let epoch = guard.require_active()?;
            let state = &mut *guard;
            let targets_deleted = state.reply.target().is_some_and(|target| {
                *target == MessageRef::Durable(id.clone())
                    || state.store.get(target).and_then(|m| m.id.as_ref()) == Some(id)
            });
            if !state.mutations.stage_delete(&mut state.store, id) {
                return Ok(DeleteOutcome::AlreadyDeleting);
            }
            if targets_deleted {
                state.reply.clear();
            }
            epoch
        };
        self.emit(SyncEvent::ThreadChanged);
        tracing::debug!(message_id = %id, "delete staged");

        let pending = self.in_flight(epoch, InFlight::Delete(id.clone()));
        let result = self.remote.delete_message(id).await;
        pending.disarm();

        {
            let mut state = self.state.lock();
            if !state.is_current(epoch) {
                tracing::debug!(message_id = %id, "discarding delete result after teardown");
                return Err(SyncError::Inactive);
            }
            state.mutations.finish_delete(id, result.as_ref().map(|_| ()));
        }

        match result {
            Ok(()) => Ok(DeleteOutcome::Deleted),
            Err(e) => {
                self.emit(SyncEvent::DeleteFailed {
                    id: id.clone(),
                    error: e.clone(),
                });
                Err(SyncError::DeleteFailed {
                    id: id.clone(),
                    source: e,
                })
            }
        }
    }

    /// Attaches the current reply target to `draft` and submits it.
    async fn send_with_reply_context(&self, draft: SendDraft) -> Result<MessageId, SyncError> {
        let reply = self.state.lock().reply.target().cloned();
        self.submit(draft.replying_to(reply.clone()), reply).await
    }

    /// Stages `draft`, issues the create request and applies its outcome.
    ///
    /// `used_reply` is the reply-context target consumed by this send; it
    /// is cleared on success if still selected.
    async fn submit(
        &self,
        draft: SendDraft,
        used_reply: Option<MessageRef>,
    ) -> Result<MessageId, SyncError> {
        let (epoch, temp, request) = {
            let mut guard = self.state.lock();
            let epoch = guard.require_active()?;
            let state = &mut *guard;
            let (temp, request) = state.mutations.stage_send(
                &mut state.store,
                &self.conversation_id,
                &self.sender_id,
                draft,
            )?;
            (epoch, temp, request)
        };
        self.emit(SyncEvent::ThreadChanged);
        tracing::debug!(temp_id = %temp, reply_to = ?request.reply_to_id, "sending message");

        let pending = self.in_flight(epoch, InFlight::Send(temp));
        let result = self.remote.create_message(request).await;
        pending.disarm();

        let outcome = {
            let mut guard = self.state.lock();
            if !guard.is_current(epoch) {
                tracing::debug!(temp_id = %temp, "discarding send result after teardown");
                return Err(SyncError::Inactive);
            }
            let state = &mut *guard;
            match result.map(|record| Message::from_record(record, &self.conversation_id)) {
                Ok(Ok(confirmed)) => {
                    let id = confirmed.id.clone();
                    state.mutations.confirm_send(&mut state.store, temp, confirmed);
                    if let Some(reply) = &used_reply {
                        state.reply.clear_if(reply);
                    }
                    Ok(id)
                }
                Ok(Err(e)) => {
                    let reason = RemoteError::Rejected(format!("invalid confirmation: {e}"));
                    state.mutations.fail_send(&mut state.store, temp, &reason);
                    Err((reason, Some(e)))
                }
                Err(e) => {
                    state.mutations.fail_send(&mut state.store, temp, &e);
                    Err((e, None))
                }
            }
        };
        self.emit(SyncEvent::ThreadChanged);

        match outcome {
            Ok(id) => id.ok_or(SyncError::Record(RecordError::MissingId)),
            Err((error, record_error)) => {
                self.emit(SyncEvent::SendFailed {
                    temp_id: temp,
                    error: error.clone(),
                });
                Err(record_error.map_or(
                    SyncError::SendFailed {
                        temp_id: temp,
                        source: error,
                    },
                    SyncError::Record,
                ))
            }
        }
    }
}
