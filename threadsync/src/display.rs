//! Plain-text rendering of a thread for the demo binary.

use chrono::{DateTime, Utc};

use threadsync_proto::message::{Message, Timestamp};

use crate::sync::store::ReplyPreview;

/// Longest reply quote shown before truncation, in characters.
const QUOTE_LEN: usize = 24;

/// One rendered thread entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayMessage {
    /// Author.
    pub sender: String,
    /// Body, or `[attachment ...]` for attachment-only messages.
    pub content: String,
    /// Formatted creation time.
    pub timestamp: String,
    /// Delivery status symbol.
    pub status: &'static str,
    /// Quoted reply target, if any.
    pub quote: Option<String>,
}

impl DisplayMessage {
    /// Builds the display form of `msg`.
    ///
    /// `reply` is the resolved reply target; unloaded targets render as a
    /// placeholder.
    #[must_use]
    pub fn new(msg: &Message, reply: Option<&ReplyPreview>, timestamp_format: &str) -> Self {
        let content = match (&msg.attachment, msg.content.is_empty()) {
            (Some(attachment), true) => format!("[attachment {attachment}]"),
            (Some(attachment), false) => format!("{} [attachment {attachment}]", msg.content),
            (None, _) => msg.content.clone(),
        };
        let quote = reply.map(|preview| match preview {
            ReplyPreview::Loaded(target) => {
                let text: String = target.content.chars().take(QUOTE_LEN).collect();
                format!("{}: {text}", target.sender_id)
            }
            ReplyPreview::Stub(_) => "original message unavailable".to_string(),
        });
        Self {
            sender: msg.sender_id.to_string(),
            content,
            timestamp: format_timestamp(msg.created_at, timestamp_format),
            status: msg.status.symbol(),
            quote,
        }
    }
}

impl std::fmt::Display for DisplayMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(quote) = &self.quote {
            writeln!(f, "        \u{21b3} {quote}")?;
        }
        write!(
            f,
            "[{}] {} {}: {}",
            self.timestamp, self.status, self.sender, self.content
        )
    }
}

/// Formats a timestamp with a chrono format string, in UTC.
#[must_use]
pub fn format_timestamp(ts: Timestamp, format: &str) -> String {
    i64::try_from(ts.as_millis())
        .ok()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .map_or_else(|| ts.to_string(), |dt| dt.format(format).to_string())
}
