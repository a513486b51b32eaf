//! Server-Sent Events (SSE) rendering of committed chat streams.
//!
//! Each delta becomes a `chat.completion.chunk` event. A completed answer
//! ends with a stop chunk carrying usage followed by `data: [DONE]`. A
//! stream whose upstream fails after commit simply ends.

use crate::api::disconnect::DisconnectStream;
use crate::api::models::StreamChunk;
use crate::core::middleware::ModelName;
use crate::core::StreamCancelHandle;
use crate::services::chat_stream::{ChatStream, StreamItem};
use crate::transformer::stream::{format_sse_data, format_sse_done};
use axum::body::{Body, Bytes};
use axum::http::{header, StatusCode};
use axum::response::Response;
use futures::{Stream, StreamExt};
use std::convert::Infallible;

fn chunk_event(chunk: &StreamChunk) -> Option<Bytes> {
    match serde_json::to_string(chunk) {
        Ok(json) => Some(Bytes::from(format_sse_data(&json))),
        Err(e) => {
            tracing::error!(error = %e, "Failed to serialize stream chunk");
            None
        }
    }
}

/// Turn stream items into SSE frames, marking `cancel_handle` completed
/// once the producer is exhausted.
pub fn sse_events<S>(
    items: S,
    id: String,
    model: String,
    cancel_handle: StreamCancelHandle,
) -> impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static
where
    S: Stream<Item = StreamItem> + Send + 'static,
{
    async_stream::stream! {
        futures::pin_mut!(items);
        while let Some(item) = items.next().await {
            match item {
                StreamItem::Delta(content) => {
                    if let Some(event) = chunk_event(&StreamChunk::delta(&id, &model, &content)) {
                        yield Ok::<_, Infallible>(event);
                    }
                }
                StreamItem::Stop(usage) => {
                    if let Some(event) = chunk_event(&StreamChunk::stop(&id, &model, usage)) {
                        yield Ok::<_, Infallible>(event);
                    }
                    cancel_handle.mark_completed();
                    yield Ok::<_, Infallible>(Bytes::from(format_sse_done()));
                }
            }
        }
        cancel_handle.mark_completed();
    }
}

/// Build the streaming HTTP response for a committed chat stream.
pub fn sse_response(stream: ChatStream, endpoint: &str) -> Response {
    let id = stream.id().to_string();
    let model = stream.model().to_string();
    let cancel_handle = StreamCancelHandle::new();

    let events = sse_events(stream.into_items(), id, model.clone(), cancel_handle.clone());
    let body = DisconnectStream::new(Box::pin(events), cancel_handle, endpoint);

    let mut response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .body(Body::from_stream(body))
        .unwrap_or_else(|_| Response::new(Body::empty()));
    response.extensions_mut().insert(ModelName(model));
    response
}
