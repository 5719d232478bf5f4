//! Server-sent event framing for relayed chat streams.
//!
//! Each [`RelayEvent`] becomes one `event: <name>` / `data: <json>` block.

use std::convert::Infallible;
use std::time::Duration;

use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures_util::{Stream, StreamExt};
use tally_types::upstream::RelayEvent;

/// Frames buffered between the relay task and the response body.
pub const STREAM_BUFFER: usize = 32;

pub fn sse_event(event: &RelayEvent) -> Event {
    Event::default().event(event.name()).data(event.data().to_string())
}

pub fn sse_response<S>(events: S) -> Response
where
    S: Stream<Item = RelayEvent> + Send + 'static,
{
    let frames = events.map(|event| Ok::<_, Infallible>(sse_event(&event)));
    Sse::new(frames)
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
        .into_response()
}
