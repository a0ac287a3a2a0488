//! Server-sent re-broadcast of the internal event bus.

use axum::{
    extract::State,
    response::sse::{Event as SseEvent, KeepAlive, Sse},
};
use futures::Stream;
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use crate::AppState;

/// `GET /paas-deploy/v1/events`. A lagged subscriber silently skips the
/// events it missed; the stream ends when the notifier closes.
pub async fn event_stream(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let rx = state.notifier.subscribe();

    let stream = BroadcastStream::new(rx).filter_map(|item| match item {
        Ok(event) => match serde_json::to_string(&event) {
            Ok(json) => Some(Ok(SseEvent::default().data(json))),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to serialize event for SSE");
                None
            }
        },
        Err(BroadcastStreamRecvError::Lagged(missed)) => {
            tracing::debug!(missed, "SSE subscriber lagged");
            None
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}
