//! Remote data service abstraction.
//!
//! Defines the [`RemoteSource`] trait the sync engine consumes. Concrete
//! implementations include:
//! - [`memory::InMemoryRemote`]: in-process backend for tests and the demo
//! - [`timeout::TimeoutRemote`]: wraps any source and bounds every call

pub mod memory;
pub mod timeout;

use std::sync::Arc;

use tokio::sync::mpsc;

use threadsync_proto::message::{ConversationId, MessageId};
use threadsync_proto::page::{Page, PageCursor};
use threadsync_proto::record::{CreateMessage, RemoteRecord};

/// Errors reported by the remote data service.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    /// Transport failure while talking to the service.
    #[error("network error: {0}")]
    Network(String),

    /// The service declined the request.
    #[error("rejected by server: {0}")]
    Rejected(String),

    /// The request did not complete within the configured bound.
    #[error("remote operation timed out")]
    Timeout,

    /// The service or subscription has shut down.
    #[error("remote connection closed")]
    Closed,

    /// The caller stopped waiting before the service answered. The request
    /// may still have been applied.
    #[error("request cancelled before the remote answered")]
    Cancelled,
}

impl RemoteError {
    /// Whether retrying the same request later could succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::Timeout | Self::Closed | Self::Cancelled
        )
    }
}

/// A live registration on a conversation's push feed.
///
/// Each delivered item is a full snapshot of the newest records in the
/// conversation. Dropping the subscription or calling
/// [`unsubscribe`](Self::unsubscribe) ends delivery.
#[derive(Debug)]
pub struct LiveSubscription {
    snapshots: mpsc::Receiver<Vec<RemoteRecord>>,
}

impl LiveSubscription {
    /// Wraps the receiving half of a snapshot channel.
    #[must_use]
    pub const fn new(snapshots: mpsc::Receiver<Vec<RemoteRecord>>) -> Self {
        Self { snapshots }
    }

    /// Waits for the next snapshot. Returns `None` once the feed has ended.
    pub async fn next_snapshot(&mut self) -> Option<Vec<RemoteRecord>> {
        self.snapshots.recv().await
    }

    /// Ends the registration. The service observes the closed channel and
    /// stops pushing.
    pub fn unsubscribe(mut self) {
        self.snapshots.close();
    }
}

/// Async interface to the reactive remote data service.
///
/// The engine never inspects how requests travel; implementations decide
/// transport, retries and timeouts. A timeout must surface as an error like
/// any other failure.
pub trait RemoteSource: Send + Sync {
    /// Fetch the page of messages strictly older than `cursor`.
    ///
    /// A `None` cursor asks for the most recent page.
    fn fetch_older_page(
        &self,
        conversation: &ConversationId,
        cursor: Option<&PageCursor>,
        page_size: usize,
    ) -> impl std::future::Future<Output = Result<Page, RemoteError>> + Send;

    /// Register for live snapshots of the conversation.
    fn subscribe_live(
        &self,
        conversation: &ConversationId,
    ) -> impl std::future::Future<Output = Result<LiveSubscription, RemoteError>> + Send;

    /// Create a message and return the durable record.
    fn create_message(
        &self,
        request: CreateMessage,
    ) -> impl std::future::Future<Output = Result<RemoteRecord, RemoteError>> + Send;

    /// Delete a message by durable id.
    fn delete_message(
        &self,
        id: &MessageId,
    ) -> impl std::future::Future<Output = Result<(), RemoteError>> + Send;
}

impl<T: RemoteSource> RemoteSource for Arc<T> {
    fn fetch_older_page(
        &self,
        conversation: &ConversationId,
        cursor: Option<&PageCursor>,
        page_size: usize,
    ) -> impl std::future::Future<Output = Result<Page, RemoteError>> + Send {
        (**self).fetch_older_page(conversation, cursor, page_size)
    }

    fn subscribe_live(
        &self,
        conversation: &ConversationId,
    ) -> impl std::future::Future<Output = Result<LiveSubscription, RemoteError>> + Send {
        (**self).subscribe_live(conversation)
    }

    fn create_message(
        &self,
        request: CreateMessage,
    ) -> impl std::future::Future<Output = Result<RemoteRecord, RemoteError>> + Send {
        (**self).create_message(request)
    }

    fn delete_message(
        &self,
        id: &MessageId,
    ) -> impl std::future::Future<Output = Result<(), RemoteError>> + Send {
        (**self).delete_message(id)
    }
}
