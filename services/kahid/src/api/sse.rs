//! Server-Sent Event streams: the event firehose and per-process log
//! tails.
//!
//! Each connection gets a bounded channel fed by transient bus
//! subscriptions; the bus handler enqueues without blocking and drops
//! frames for this connection only when the client falls behind.  The
//! subscriptions are removed when the client disconnects (the stream,
//! and with it the guard, is dropped).

use super::AppState;
use super::response::{bad_request, control_error};
use axum::{
    extract::{Path, Query, State},
    http::{HeaderName, HeaderValue, header},
    response::{
        IntoResponse, Response,
        sse::{Event as SseEvent, KeepAlive, Sse},
    },
};
use futures_util::Stream;
use kahi_events::{EventBus, EventType};
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const CHANNEL_CAPACITY: usize = 64;
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Removes this connection's bus subscriptions when the stream drops.
struct BusSubscriptions {
    bus: Arc<EventBus>,
    ids: Vec<u64>,
}

impl Drop for BusSubscriptions {
    fn drop(&mut self) {
        for id in &self.ids {
            self.bus.unsubscribe(*id);
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct EventStreamQuery {
    /// Comma-separated event type tags; defaults to the state,
    /// supervisor, and group families (not logs, not ticks).
    types: Option<String>,
}

pub async fn events_sse(
    State(state): State<AppState>,
    Query(query): Query<EventStreamQuery>,
) -> Response {
    let types: Vec<EventType> = match &query.types {
        Some(raw) => {
            let mut types = Vec::new();
            for tag in raw.split(',').map(str::trim).filter(|tag| !tag.is_empty()) {
                match tag.parse::<EventType>() {
                    Ok(event_type) => types.push(event_type),
                    Err(error) => return bad_request(error.to_string()),
                }
            }
            types
        }
        None => EventType::PROCESS_STATE
            .iter()
            .chain(&EventType::SUPERVISOR_STATE)
            .chain(&EventType::PROCESS_GROUP)
            .copied()
            .collect(),
    };

    let (tx, mut rx) = mpsc::channel::<(EventType, String)>(CHANNEL_CAPACITY);
    let mut ids = Vec::with_capacity(types.len());
    for event_type in types {
        let tx = tx.clone();
        ids.push(state.bus.subscribe(event_type, move |event| {
            let data = serde_json::to_string(&event.data).unwrap_or_else(|_| "{}".to_owned());
            // Lossy on overflow: this connection just misses the frame.
            let _ = tx.try_send((event.event_type, data));
        }));
    }
    let guard = BusSubscriptions {
        bus: state.bus.clone(),
        ids,
    };

    let stream = async_stream::stream! {
        let _guard = guard;
        while let Some((event_type, data)) = rx.recv().await {
            yield Ok::<_, Infallible>(
                SseEvent::default().event(event_type.as_str()).data(data),
            );
        }
    };
    sse_response(stream)
}

pub async fn process_log_sse(
    State(state): State<AppState>,
    Path((name, stream)): Path<(String, String)>,
) -> Response {
    let Some(stream) = crate::control::LogStream::parse(&stream) else {
        return bad_request("log stream must be stdout or stderr");
    };
    if let Err(error) = state.processes.get(&name) {
        return control_error(error);
    }

    let (tx, mut rx) = mpsc::channel::<String>(CHANNEL_CAPACITY);
    let filter_name = name.clone();
    let id = state.bus.subscribe(stream.event_type(), move |event| {
        if event.data.get("name").is_some_and(|n| *n == filter_name) {
            if let Some(chunk) = event.data.get("data") {
                let _ = tx.try_send(chunk.clone());
            }
        }
    });
    let guard = BusSubscriptions {
        bus: state.bus.clone(),
        ids: vec![id],
    };

    let stream = async_stream::stream! {
        let _guard = guard;
        while let Some(chunk) = rx.recv().await {
            yield Ok::<_, Infallible>(SseEvent::default().data(chunk));
        }
    };
    sse_response(stream)
}

fn sse_response(
    stream: impl Stream<Item = Result<SseEvent, Infallible>> + Send + 'static,
) -> Response {
    let sse = Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(KEEP_ALIVE_INTERVAL)
            .text("keepalive"),
    );
    let mut response = sse.into_response();
    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert(
        HeaderName::from_static("x-accel-buffering"),
        HeaderValue::from_static("no"),
    );
    response
}
