//! Pagination types for history fetches.

use serde::{Deserialize, Serialize};

use crate::record::RemoteRecord;

/// Opaque pagination token bound to the oldest message currently loaded.
///
/// Only the remote service interprets the contents. The engine passes it
/// back unchanged on the next "load older" request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PageCursor(String);

impl PageCursor {
    /// Wraps a token issued by the remote service.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Returns the raw token.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PageCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One page of history returned by the remote service, newest first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    /// Records strictly older than the cursor the page was requested with.
    pub records: Vec<RemoteRecord>,
    /// Cursor for the next older page; `None` when the service has nothing older.
    pub next_cursor: Option<PageCursor>,
}
