// src/daemon/events.rs

//! Event hub
//!
//! One broadcast channel fans change and task events out to every
//! subscriber of `/v2/events`. Each subscriber gets a bounded queue; a
//! subscriber that falls behind is dropped, the producer never blocks.
//! The wire format is newline-delimited JSON.

use axum::body::Body;
use axum::http::header;
use axum::response::IntoResponse;
use crate::state::runner::EnsureEvent;
use futures::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;

/// Queue depth per subscriber
const CHANNEL_CAPACITY: usize = 64;

/// An event as it appears on the wire
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Event {
    ChangeUpdate {
        #[serde(rename = "change-id")]
        change_id: String,
        kind: String,
        summary: String,
        status: String,
        ready: bool,
    },
    TaskProgress {
        #[serde(rename = "task-id")]
        task_id: String,
        #[serde(rename = "change-id")]
        change_id: String,
        label: String,
        done: usize,
        total: usize,
    },
}

/// Fan-out hub for daemon events
#[derive(Clone)]
pub struct Hub {
    tx: broadcast::Sender<Event>,
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

impl Hub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish an event; subscribers that lag simply miss it
    pub fn publish(&self, event: Event) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Adapter feeding the ensure loop's events into the hub
    pub fn observer(&self) -> crate::state::runner::Observer {
        let hub = self.clone();
        Arc::new(move |event: EnsureEvent| {
            let event = match event {
                EnsureEvent::ChangeUpdate {
                    change_id,
                    kind,
                    summary,
                    status,
                    ready,
                } => Event::ChangeUpdate {
                    change_id,
                    kind,
                    summary,
                    status,
                    ready,
                },
                EnsureEvent::TaskProgress {
                    task_id,
                    change_id,
                    label,
                    done,
                    total,
                } => Event::TaskProgress {
                    task_id,
                    change_id,
                    label,
                    done,
                    total,
                },
            };
            hub.publish(event);
        })
    }
}

/// Long-lived NDJSON response streaming hub events
pub struct EventStream {
    rx: broadcast::Receiver<Event>,
}

impl EventStream {
    pub fn new(rx: broadcast::Receiver<Event>) -> Self {
        Self { rx }
    }
}

impl IntoResponse for EventStream {
    fn into_response(self) -> axum::response::Response {
        let stream = BroadcastStream::new(self.rx)
            .take_while(|item| {
                // A lagged subscriber is dropped rather than resumed with a
                // gap it cannot see.
                let keep = !matches!(item, Err(BroadcastStreamRecvError::Lagged(_)));
                if !keep {
                    tracing::warn!("dropping lagging event subscriber");
                }
                futures::future::ready(keep)
            })
            .filter_map(|item| {
                let line = match item {
                    Ok(event) => serde_json::to_string(&event)
                        .ok()
                        .map(|mut json| {
                            json.push('\n');
                            Ok::<_, std::convert::Infallible>(json)
                        }),
                    Err(_) => None,
                };
                futures::future::ready(line)
            });

        (
            [(header::CONTENT_TYPE, "application/json")],
            Body::from_stream(stream),
        )
            .into_response()
    }
}
