//! Message data model for a single conversation thread.
//!
//! These types describe what the engine caches and renders. Durable
//! identifiers are issued by the remote service and treated as opaque
//! strings; client temp identifiers are UUID v7 values generated locally
//! for optimistic entries.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum allowed message content size in bytes (64 KB).
pub const MAX_CONTENT_LEN: usize = 64 * 1024;

/// Durable, server-assigned message identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// Wraps a server-issued identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Locally generated identifier for a message that has not been confirmed.
///
/// Unique per device session. Travels with the create mutation so the
/// server can echo it back on the live feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientTempId(Uuid);

impl ClientTempId {
    /// Creates a new time-ordered temp identifier (UUID v7).
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Creates a `ClientTempId` from an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the inner UUID value.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ClientTempId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ClientTempId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tmp-{}", self.0)
    }
}

/// Identifies a conversation (one thread of messages).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(String);

impl ConversationId {
    /// Wraps a server-issued conversation identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies the author of a message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SenderId(String);

impl SenderId {
    /// Wraps a user identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SenderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Reference to an uploaded attachment (e.g. an image storage key).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttachmentRef(String);

impl AttachmentRef {
    /// Wraps an attachment storage reference.
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    /// Returns the reference as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AttachmentRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Points at another message by durable id or, before confirmation, by temp id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRef {
    /// A server-confirmed message.
    Durable(MessageId),
    /// A locally-originated message that may not be confirmed yet.
    Temp(ClientTempId),
}

impl std::fmt::Display for MessageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Durable(id) => write!(f, "{id}"),
            Self::Temp(id) => write!(f, "{id}"),
        }
    }
}

impl From<MessageId> for MessageRef {
    fn from(id: MessageId) -> Self {
        Self::Durable(id)
    }
}

impl From<ClientTempId> for MessageRef {
    fn from(id: ClientTempId) -> Self {
        Self::Temp(id)
    }
}

/// Millisecond-precision UTC timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Creates a timestamp for the current instant.
    #[must_use]
    pub fn now() -> Self {
        let millis = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        Self(u64::try_from(millis).unwrap_or(u64::MAX))
    }

    /// Creates a timestamp from milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Returns the timestamp as milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn as_millis(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// Delivery lifecycle of a message.
///
/// `Pending` moves to `Sent` or `Failed` exactly once. The only transition
/// after that is `Sent` to `Deleted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    /// Optimistically inserted, create mutation in flight.
    Pending,
    /// Confirmed by the server.
    Sent,
    /// The create mutation failed; the user may retry or dismiss.
    Failed,
    /// Removed from the thread.
    Deleted,
}

impl DeliveryStatus {
    /// Display symbol for the status, as used by the thread printer.
    #[must_use]
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::Pending => "\u{22ef}",
            Self::Sent => "\u{2713}",
            Self::Failed => "\u{2717}",
            Self::Deleted => "\u{2205}",
        }
    }
}

/// One entry of a conversation thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Durable id; `None` until the server confirms the message.
    pub id: Option<MessageId>,
    /// Temp id for locally-originated messages.
    pub client_temp_id: Option<ClientTempId>,
    /// Conversation the message belongs to.
    pub conversation_id: ConversationId,
    /// Author of the message.
    pub sender_id: SenderId,
    /// Text body (may be empty for attachment-only messages).
    pub content: String,
    /// Optional attachment reference.
    pub attachment: Option<AttachmentRef>,
    /// Message this one replies to.
    pub reply_to: Option<MessageRef>,
    /// Client clock for optimistic entries, server clock once confirmed.
    pub created_at: Timestamp,
    /// Current lifecycle state.
    pub status: DeliveryStatus,
}

/// Error returned when a message fails validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// No text and no attachment.
    #[error("message content is empty")]
    Empty,
    /// Message content exceeds the maximum allowed size.
    #[error("message too large ({size} bytes, max {max} bytes)")]
    TooLarge {
        /// Actual size of the content in bytes.
        size: usize,
        /// Maximum allowed size in bytes.
        max: usize,
    },
}

impl Message {
    /// Builds a pending, locally-originated message stamped with the client clock.
    #[must_use]
    pub fn pending(
        client_temp_id: ClientTempId,
        conversation_id: ConversationId,
        sender_id: SenderId,
        content: String,
        attachment: Option<AttachmentRef>,
        reply_to: Option<MessageRef>,
    ) -> Self {
        Self {
            id: None,
            client_temp_id: Some(client_temp_id),
            conversation_id,
            sender_id,
            content,
            attachment,
            reply_to,
            created_at: Timestamp::now(),
            status: DeliveryStatus::Pending,
        }
    }

    /// The identity used for ordering and lookup: durable id first, then temp id.
    #[must_use]
    pub fn identity(&self) -> Option<MessageRef> {
        self.id
            .clone()
            .map(MessageRef::Durable)
            .or_else(|| self.client_temp_id.map(MessageRef::Temp))
    }

    /// Whether this message is addressed by `reference`.
    #[must_use]
    pub fn is_addressed_by(&self, reference: &MessageRef) -> bool {
        match reference {
            MessageRef::Durable(id) => self.id.as_ref() == Some(id),
            MessageRef::Temp(temp) => self.client_temp_id.as_ref() == Some(temp),
        }
    }

    /// Validates this message for sending.
    ///
    /// An attachment-only message may have empty text.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::Empty`] if there is neither text nor an
    /// attachment, or [`ValidationError::TooLarge`] if the text exceeds
    /// [`MAX_CONTENT_LEN`].
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.content.trim().is_empty() && self.attachment.is_none() {
            return Err(ValidationError::Empty);
        }
        let size = self.content.len();
        if size > MAX_CONTENT_LEN {
            return Err(ValidationError::TooLarge {
                size,
                max: MAX_CONTENT_LEN,
            });
        }
        Ok(())
    }
}
