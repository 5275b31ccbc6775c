//! `GET /events`: Server-Sent-Events stream of every envelope the bridge
//! broadcasts (detections and heartbeats).

use std::convert::Infallible;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::{self, Stream, StreamExt};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use crate::state::HttpState;

/// Opens an event stream.
#[utoipa::path(
    get,
    path = "/events",
    tag = "bridge",
    operation_id = "streamEvents",
    summary = "Subscribe to bridge events",
    description = "Each SSE `data:` line carries one JSON envelope: `t: 3` for a manufacturer \
        sighting, `t: 4` for the periodic heartbeat.",
    responses(
        (status = 200, description = "Event stream", content_type = "text/event-stream", body = String)
    )
)]
pub async fn stream_events(
    State(state): State<HttpState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (events, mut shutdown) = state.subscribe();
    debug!(clients = state.sse_clients(), "Event stream opened");

    let stream = stream::unfold(events, |mut events| async move {
        loop {
            match events.recv().await {
                Ok(payload) => {
                    return Some((Ok::<_, Infallible>(Event::default().data(payload)), events));
                }
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "Event stream client lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    })
    .take_until(async move {
        let _ = shutdown.wait_for(|stopped| *stopped).await;
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}
