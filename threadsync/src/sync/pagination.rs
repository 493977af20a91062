//! "Load older" gating.
//!
//! At most one history fetch is outstanding per conversation. Requests made
//! while a fetch is in flight, or after the remote reported the beginning of
//! the conversation, are no-ops. Failures return to `Idle` and are never
//! retried automatically.

use threadsync_proto::page::PageCursor;

use crate::remote::RemoteError;

use super::store::MessageStore;

/// Pagination state of one conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PaginationPhase {
    /// Ready to fetch the next older page.
    #[default]
    Idle,
    /// A fetch is in flight.
    Loading,
    /// No older messages remain.
    Exhausted,
}

/// Parameters for one history fetch, captured when the fetch begins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    /// `None` asks for the most recent page.
    pub cursor: Option<PageCursor>,
    /// Number of messages requested.
    pub page_size: usize,
}

/// Tracks whether a history fetch may start.
#[derive(Debug)]
pub struct PaginationController {
    phase: PaginationPhase,
    page_size: usize,
    last_error: Option<RemoteError>,
}

impl PaginationController {
    /// Creates an idle controller requesting `page_size` messages per page.
    #[must_use]
    pub fn new(page_size: usize) -> Self {
        Self {
            phase: PaginationPhase::Idle,
            page_size: page_size.max(1),
            last_error: None,
        }
    }

    /// Moves to `Loading` and returns the request to issue, or `None` if a
    /// fetch is already in flight or history is exhausted.
    pub fn try_begin(&mut self, store: &MessageStore) -> Option<PageRequest> {
        if store.is_exhausted() {
            self.phase = PaginationPhase::Exhausted;
        }
        if self.phase != PaginationPhase::Idle {
            return None;
        }
        self.phase = PaginationPhase::Loading;
        self.last_error = None;
        Some(PageRequest {
            cursor: store.cursor().cloned(),
            page_size: self.page_size,
        })
    }

    /// Ends the in-flight fetch successfully.
    pub fn complete(&mut self, exhausted: bool) {
        self.phase = if exhausted {
            PaginationPhase::Exhausted
        } else {
            PaginationPhase::Idle
        };
    }

    /// Ends the in-flight fetch with an error. The caller may request again.
    pub fn fail(&mut self, error: &RemoteError) {
        self.phase = PaginationPhase::Idle;
        self.last_error = Some(error.clone());
    }

    /// Abandons the in-flight fetch without recording an error.
    pub fn cancel(&mut self) {
        if self.phase == PaginationPhase::Loading {
            self.phase = PaginationPhase::Idle;
        }
    }

    /// Returns to a fresh `Idle` state.
    pub fn reset(&mut self) {
        self.phase = PaginationPhase::Idle;
        self.last_error = None;
    }

    /// Current phase.
    #[must_use]
    pub const fn phase(&self) -> PaginationPhase {
        self.phase
    }

    /// Whether a fetch is in flight.
    #[must_use]
    pub fn is_loading(&self) -> bool {
        self.phase == PaginationPhase::Loading
    }

    /// Whether no older messages remain.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.phase == PaginationPhase::Exhausted
    }

    /// Error of the most recent failed fetch, cleared when the next one starts.
    #[must_use]
    pub const fn last_error(&self) -> Option<&RemoteError> {
        self.last_error.as_ref()
    }

    /// Messages requested per page.
    #[must_use]
    pub const fn page_size(&self) -> usize {
        self.page_size
    }
}
