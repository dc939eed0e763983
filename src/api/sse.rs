//! Server-Sent Events support

use crate::conversation::ConversationState;
use crate::runtime::ProgressEvent;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use serde_json::json;
use std::convert::Infallible;
use std::time::Duration;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

/// Convert the assistant's progress broadcast into one session's SSE stream,
/// starting with a snapshot of the session
pub fn sse_stream(
    session_id: String,
    state: ConversationState,
    broadcast_rx: tokio::sync::broadcast::Receiver<ProgressEvent>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let init = futures::stream::once(async move { Ok(init_event(&state)) });

    let phases = BroadcastStream::new(broadcast_rx).filter_map(move |result| match result {
        Ok(event) if event.session_id == session_id => Some(Ok(phase_event(&event))),
        // Other sessions, or lagged messages
        _ => None,
    });

    Sse::new(init.chain(phases)).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}

fn init_event(state: &ConversationState) -> Event {
    let data = json!({
        "type": "init",
        "turns": state.turns.len(),
        "context": state.context,
    });
    Event::default().event("init").data(data.to_string())
}

fn phase_event(event: &ProgressEvent) -> Event {
    let data = json!({
        "type": "phase",
        "phase": event.phase,
    });
    Event::default().event("phase").data(data.to_string())
}
