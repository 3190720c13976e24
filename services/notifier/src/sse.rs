use crate::control_api::AppState;
use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::{StreamExt, wrappers::BroadcastStream};

pub async fn notifier_sse(
    State(state): State<Arc<AppState>>,
) -> Sse<impl futures_util::stream::Stream<Item = Result<Event, Infallible>>> {
    let rx = state.ui_tx.subscribe();
    let updates = BroadcastStream::new(rx).filter_map(|result| match result {
        Ok(event) => match serde_json::to_string(&event) {
            Ok(json) => Some(Ok(Event::default().event(event.event_name()).data(json))),
            Err(_) => None,
        },
        // Lagged: the client should refetch GET /api/v1/notifications.
        Err(_) => Some(Ok(Event::default().event("resync").data("{}"))),
    });
    let initial = tokio_stream::once(Ok(Event::default().event("connected").data("{}")));
    let stream = initial.chain(updates);

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keepalive"),
    )
}
