//! Deadline wrapper for any [`RemoteSource`].

use std::future::Future;
use std::time::Duration;

use threadsync_proto::message::{ConversationId, MessageId};
use threadsync_proto::page::{Page, PageCursor};
use threadsync_proto::record::{CreateMessage, RemoteRecord};

use super::{LiveSubscription, RemoteError, RemoteSource};

/// Bounds every request of the wrapped source by a fixed deadline.
///
/// Expiry surfaces as [`RemoteError::Timeout`]. The live feed itself is not
/// bounded, only the call that registers it.
#[derive(Debug, Clone)]
pub struct TimeoutRemote<R> {
    inner: R,
    limit: Duration,
}

impl<R: RemoteSource> TimeoutRemote<R> {
    /// Wraps `inner` with a per-request `limit`.
    pub const fn new(inner: R, limit: Duration) -> Self {
        Self { inner, limit }
    }

    /// The wrapped source.
    pub const fn inner(&self) -> &R {
        &self.inner
    }

    /// The per-request deadline.
    pub const fn limit(&self) -> Duration {
        self.limit
    }

    async fn bounded<T>(
        &self,
        op: &'static str,
        fut: impl Future<Output = Result<T, RemoteError>>,
    ) -> Result<T, RemoteError> {
        if let Ok(result) = tokio::time::timeout(self.limit, fut).await {
            result
        } else {
            tracing::warn!(op, limit = ?self.limit, "remote request timed out");
            Err(RemoteError::Timeout)
        }
    }
}

impl<R: RemoteSource> RemoteSource for TimeoutRemote<R> {
    async fn fetch_older_page(
        &self,
        conversation: &ConversationId,
        cursor: Option<&PageCursor>,
        page_size: usize,
    ) -> Result<Page, RemoteError> {
        self.bounded(
            "fetch_older_page",
            self.inner.fetch_older_page(conversation, cursor, page_size),
        )
        .await
    }

    async fn subscribe_live(
        &self,
        conversation: &ConversationId,
    ) -> Result<LiveSubscription, RemoteError> {
        self.bounded("subscribe_live", self.inner.subscribe_live(conversation))
            .await
    }

    async fn create_message(&self, request: CreateMessage) -> Result<RemoteRecord, RemoteError> {
        self.bounded("create_message", self.inner.create_message(request))
            .await
    }

    async fn delete_message(&self, id: &MessageId) -> Result<(), RemoteError> {
        self.bounded("delete_message", self.inner.delete_message(id))
            .await
    }
}
