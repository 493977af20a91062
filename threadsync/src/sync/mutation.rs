//! Optimistic send and delete bookkeeping.
//!
//! The queue owns the local side of a mutation: it stages the visible
//! change in the [`MessageStore`] before the remote request is issued and
//! applies the outcome afterwards. It never talks to the remote itself,
//! which keeps every step a synchronous critical section for the engine.

use std::collections::{HashMap, HashSet};

use threadsync_proto::message::{
    AttachmentRef, ClientTempId, ConversationId, Message, MessageId, MessageRef, SenderId,
    ValidationError,
};
use threadsync_proto::record::CreateMessage;

use crate::remote::RemoteError;

use super::store::{MessageStore, Reconcile};

/// User input for one send.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SendDraft {
    /// Text body.
    pub content: String,
    /// Optional attachment.
    pub attachment: Option<AttachmentRef>,
    /// Message being replied to.
    pub reply_to: Option<MessageRef>,
}

impl SendDraft {
    /// A plain text draft.
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    /// An attachment-only draft.
    #[must_use]
    pub fn attachment(attachment: AttachmentRef) -> Self {
        Self {
            attachment: Some(attachment),
            ..Self::default()
        }
    }

    /// Sets the reply target.
    #[must_use]
    pub fn replying_to(mut self, reply_to: Option<MessageRef>) -> Self {
        self.reply_to = reply_to;
        self
    }
}

impl From<Message> for SendDraft {
    fn from(msg: Message) -> Self {
        Self {
            content: msg.content,
            attachment: msg.attachment,
            reply_to: msg.reply_to,
        }
    }
}

/// In-flight and failed mutations for one conversation.
#[derive(Debug, Default)]
pub struct OptimisticMutationQueue {
    in_flight_sends: HashSet<ClientTempId>,
    failures: HashMap<ClientTempId, String>,
    in_flight_deletes: HashSet<MessageId>,
}

impl OptimisticMutationQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates a draft, inserts it as a pending entry and returns the
    /// create request to issue.
    ///
    /// The local entry keeps the reply reference as given. The request
    /// names a target that has since been confirmed by its durable id.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] if the draft is empty or too large.
    /// Nothing is inserted in that case.
    pub fn stage_send(
        &mut self,
        store: &mut MessageStore,
        conversation: &ConversationId,
        sender: &SenderId,
        draft: SendDraft,
    ) -> Result<(ClientTempId, CreateMessage), ValidationError> {
        let temp = ClientTempId::new();
        let msg = Message::pending(
            temp,
            conversation.clone(),
            sender.clone(),
            draft.content,
            draft.attachment,
            draft.reply_to,
        );
        msg.validate()?;

        let mut request = CreateMessage::new(&msg, temp);
        request.reply_to_id = msg.reply_to.as_ref().map(|r| store.canonical_ref(r));
        store.apply_optimistic_insert(msg);
        self.in_flight_sends.insert(temp);
        tracing::debug!(temp_id = %temp, "send staged");
        Ok((temp, request))
    }

    /// Applies a successful create response.
    pub fn confirm_send(
        &mut self,
        store: &mut MessageStore,
        temp: ClientTempId,
        confirmed: Message,
    ) -> Reconcile {
        self.in_flight_sends.remove(&temp);
        let outcome = store.mark_delivered(temp, confirmed);
        tracing::debug!(temp_id = %temp, ?outcome, "send confirmed");
        outcome
    }

    /// Applies a failed create response. The reason is retained only if the
    /// entry actually moved to `Failed`.
    pub fn fail_send(&mut self, store: &mut MessageStore, temp: ClientTempId, error: &RemoteError) -> bool {
        self.in_flight_sends.remove(&temp);
        let failed = store.mark_failed(temp);
        if failed {
            self.failures.insert(temp, error.to_string());
        }
        tracing::warn!(temp_id = %temp, error = %error, "send failed");
        failed
    }

    /// Optimistically removes `id`. Returns `false` if a delete of the same
    /// id is already in flight, in which case nothing should be issued.
    pub fn stage_delete(&mut self, store: &mut MessageStore, id: &MessageId) -> bool {
        if !self.in_flight_deletes.insert(id.clone()) {
            tracing::debug!(message_id = %id, "delete already in flight");
            return false;
        }
        store.mark_deleted(id);
        true
    }

    /// Clears the in-flight marker for `id`. Failures are not rolled back.
    pub fn finish_delete(&mut self, id: &MessageId, result: Result<(), &RemoteError>) {
        self.in_flight_deletes.remove(id);
        match result {
            Ok(()) => tracing::debug!(message_id = %id, "delete confirmed"),
            Err(e) => tracing::warn!(message_id = %id, error = %e, "delete failed; entry stays removed"),
        }
    }

    /// Clears the in-flight marker of a delete whose request was abandoned.
    /// The entry stays removed.
    pub fn cancel_delete(&mut self, id: &MessageId) {
        if self.in_flight_deletes.remove(id) {
            tracing::debug!(message_id = %id, "delete abandoned; entry stays removed");
        }
    }

    /// Removes a failed send from the store and the failure table.
    pub fn take_failed(&mut self, store: &mut MessageStore, temp: ClientTempId) -> Option<Message> {
        let msg = store.remove_failed(temp)?;
        self.failures.remove(&temp);
        Some(msg)
    }

    /// Reason a send failed, while its entry is still visible.
    #[must_use]
    pub fn failure_reason(&self, temp: ClientTempId) -> Option<&str> {
        self.failures.get(&temp).map(String::as_str)
    }

    /// Number of sends awaiting a response.
    #[must_use]
    pub fn in_flight_sends(&self) -> usize {
        self.in_flight_sends.len()
    }

    /// Whether any send awaits a response.
    #[must_use]
    pub fn is_sending(&self) -> bool {
        !self.in_flight_sends.is_empty()
    }

    /// Whether a delete of `id` is in flight.
    #[must_use]
    pub fn is_deleting(&self, id: &MessageId) -> bool {
        self.in_flight_deletes.contains(id)
    }

    /// Drops every pending mutation.
    pub fn clear(&mut self) {
        self.in_flight_sends.clear();
        self.failures.clear();
        self.in_flight_deletes.clear();
    }
}
