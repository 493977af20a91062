//! Remote message shape and the requests sent to the remote service.
//!
//! The remote service speaks a loosely-typed, versionless JSON shape.
//! [`RemoteRecord`] mirrors it with every field optional so that a record
//! missing a field deserializes cleanly and is then rejected by
//! [`Message::from_record`] instead of failing somewhere deeper.

use serde::{Deserialize, Serialize};

use crate::message::{
    AttachmentRef, ClientTempId, ConversationId, DeliveryStatus, Message, MessageId, MessageRef,
    SenderId, Timestamp,
};

/// Errors raised while turning a remote record into a [`Message`].
#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    /// The record carries no usable durable id.
    #[error("record has no durable id")]
    MissingId,

    /// A required field is absent.
    #[error("record is missing field `{0}`")]
    MissingField(&'static str),

    /// The record belongs to a different conversation.
    #[error("record for conversation {actual} delivered to conversation {expected}")]
    ConversationMismatch {
        /// Conversation the record was delivered to.
        expected: ConversationId,
        /// Conversation named by the record.
        actual: ConversationId,
    },

    /// The JSON payload could not be parsed.
    #[error("malformed record JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// A message as delivered by the remote service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RemoteRecord {
    /// Durable id.
    pub id: Option<MessageId>,
    /// Temp id echoed back for messages created by this device.
    pub client_temp_id: Option<ClientTempId>,
    /// Conversation the record belongs to.
    pub conversation_id: Option<ConversationId>,
    /// Author.
    pub sender_id: Option<SenderId>,
    /// Text body.
    pub content: Option<String>,
    /// Attachment reference.
    pub attachment_ref: Option<AttachmentRef>,
    /// Replied-to message.
    pub reply_to_id: Option<MessageRef>,
    /// Server creation time.
    pub created_at: Option<Timestamp>,
    /// Set when the server reports the message as deleted.
    pub deleted: bool,
}

impl RemoteRecord {
    /// Parses a record from its JSON form.
    ///
    /// # Errors
    ///
    /// Returns [`RecordError::Json`] if the payload is not a JSON object of
    /// the expected shape. Unknown fields are ignored.
    pub fn from_json(json: &str) -> Result<Self, RecordError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Serializes the record to JSON.
    ///
    /// # Errors
    ///
    /// Returns [`RecordError::Json`] if serialization fails.
    pub fn to_json(&self) -> Result<String, RecordError> {
        Ok(serde_json::to_string(self)?)
    }
}

impl From<&Message> for RemoteRecord {
    fn from(msg: &Message) -> Self {
        Self {
            id: msg.id.clone(),
            client_temp_id: msg.client_temp_id,
            conversation_id: Some(msg.conversation_id.clone()),
            sender_id: Some(msg.sender_id.clone()),
            content: Some(msg.content.clone()),
            attachment_ref: msg.attachment.clone(),
            reply_to_id: msg.reply_to.clone(),
            created_at: Some(msg.created_at),
            deleted: msg.status == DeliveryStatus::Deleted,
        }
    }
}

impl Message {
    /// Validates a remote record and converts it into a confirmed message.
    ///
    /// Remote records are always server-side entities, so a durable id is
    /// mandatory. The returned message is `Sent`, or `Deleted` when the
    /// record is flagged as such.
    ///
    /// # Errors
    ///
    /// Returns [`RecordError`] if the identity fields are missing or blank,
    /// a required field is absent, or the record names another conversation.
    pub fn from_record(
        record: RemoteRecord,
        expected: &ConversationId,
    ) -> Result<Self, RecordError> {
        let id = record
            .id
            .filter(|id| !id.as_str().trim().is_empty())
            .ok_or(RecordError::MissingId)?;
        let conversation_id = record
            .conversation_id
            .ok_or(RecordError::MissingField("conversationId"))?;
        if conversation_id != *expected {
            return Err(RecordError::ConversationMismatch {
                expected: expected.clone(),
                actual: conversation_id,
            });
        }
        let sender_id = record
            .sender_id
            .ok_or(RecordError::MissingField("senderId"))?;
        let created_at = record
            .created_at
            .ok_or(RecordError::MissingField("createdAt"))?;

        Ok(Self {
            id: Some(id),
            client_temp_id: record.client_temp_id,
            conversation_id,
            sender_id,
            content: record.content.unwrap_or_default(),
            attachment: record.attachment_ref,
            reply_to: record.reply_to_id,
            created_at,
            status: if record.deleted {
                DeliveryStatus::Deleted
            } else {
                DeliveryStatus::Sent
            },
        })
    }
}

/// Arguments of the remote "create message" mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateMessage {
    /// Target conversation.
    pub conversation_id: ConversationId,
    /// Author.
    pub sender_id: SenderId,
    /// Text body.
    pub content: String,
    /// Attachment reference.
    pub attachment_ref: Option<AttachmentRef>,
    /// Replied-to message.
    pub reply_to_id: Option<MessageRef>,
    /// Temp id the server should echo back on the live feed.
    pub client_temp_id: ClientTempId,
}

impl CreateMessage {
    /// Builds the create request for a locally staged message.
    #[must_use]
    pub fn new(msg: &Message, client_temp_id: ClientTempId) -> Self {
        Self {
            conversation_id: msg.conversation_id.clone(),
            sender_id: msg.sender_id.clone(),
            content: msg.content.clone(),
            attachment_ref: msg.attachment.clone(),
            reply_to_id: msg.reply_to.clone(),
            client_temp_id,
        }
    }
}
