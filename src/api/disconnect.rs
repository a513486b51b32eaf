//! Detection of callers that abandon a streaming response.

use crate::core::metrics::get_metrics;
use crate::core::StreamCancelHandle;
use axum::body::Bytes;
use futures::stream::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};

/// A stream wrapper that triggers a cancellation handle when dropped.
///
/// Dropping before the producer marked the handle completed means the
/// caller went away mid-stream. Dropping the inner stream also drops the
/// upstream body, which releases the upstream connection.
pub struct DisconnectStream<S> {
    stream: S,
    cancel_handle: StreamCancelHandle,
    endpoint: String,
}

impl<S> DisconnectStream<S> {
    pub fn new(stream: S, cancel_handle: StreamCancelHandle, endpoint: impl Into<String>) -> Self {
        Self {
            stream,
            cancel_handle,
            endpoint: endpoint.into(),
        }
    }
}

impl<S, E> Stream for DisconnectStream<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
{
    type Item = Result<Bytes, E>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.stream).poll_next(cx)
    }
}

impl<S> Drop for DisconnectStream<S> {
    fn drop(&mut self) {
        if self.cancel_handle.cancel() {
            get_metrics()
                .client_disconnects
                .with_label_values(&[&self.endpoint])
                .inc();
            tracing::info!(endpoint = %self.endpoint, "Client disconnected before stream completed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::convert::Infallible;

    fn chunks() -> impl Stream<Item = Result<Bytes, Infallible>> + Unpin {
        futures::stream::iter(vec![Ok(Bytes::from("a")), Ok(Bytes::from("b"))])
    }

    #[tokio::test]
    async fn test_drop_before_completion_is_disconnect() {
        let handle = StreamCancelHandle::new();
        let mut stream = DisconnectStream::new(chunks(), handle.clone(), "/test/disconnect");
        assert!(stream.next().await.is_some());
        drop(stream);

        assert!(handle.is_cancelled());
        assert_eq!(
            get_metrics()
                .client_disconnects
                .with_label_values(&["/test/disconnect"])
                .get(),
            1
        );
    }

    #[tokio::test]
    async fn test_drop_after_completion_is_not_disconnect() {
        let handle = StreamCancelHandle::new();
        let mut stream = DisconnectStream::new(chunks(), handle.clone(), "/test/completed");
        while stream.next().await.is_some() {}
        handle.mark_completed();
        drop(stream);

        assert!(!handle.is_cancelled());
        assert_eq!(
            get_metrics()
                .client_disconnects
                .with_label_values(&["/test/completed"])
                .get(),
            0
        );
    }
}
