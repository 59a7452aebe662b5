//! Server-Sent Events over a long lived HTTP response.
//!
//! An [`SseStream`] owns one task that is the only writer of the response
//! body. Producers hand events to it with [`SseStream::send`], which waits
//! until the task has taken the event. The task also writes a heartbeat after
//! 30 seconds without traffic and ends the stream after 24 hours.

use std::{
    borrow::Cow,
    convert::Infallible,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use axum::response::{
    IntoResponse, Response,
    sse::{Event, Sse},
};
use http::{HeaderValue, header};
use serde::Serialize;
use tokio::{
    sync::{mpsc, watch},
    time::Instant,
};

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub const MAX_STREAM_TIME: Duration = Duration::from_secs(24 * 60 * 60);
const BODY_BUFFER: usize = 16;
const CLOSE_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

pub const INTERNAL_SERVER_ERROR: &str = "INTERNAL_SERVER_ERROR";
const SERVER_CLOSED: &str = "SERVER_CLOSED";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SseErrorData {
    pub code: Cow<'static, str>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl SseErrorData {
    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            code: Cow::Borrowed(INTERNAL_SERVER_ERROR),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SseEvent {
    pub event: Cow<'static, str>,
    pub data: serde_json::Value,
}

impl SseEvent {
    pub fn new(event: impl Into<Cow<'static, str>>, data: impl Serialize) -> Self {
        let data = serde_json::to_value(data).unwrap_or_else(|e| {
            log::error!("Unable to serialize SSE payload: {e}");
            serde_json::Value::Null
        });
        Self {
            event: event.into(),
            data,
        }
    }

    pub fn error(data: SseErrorData) -> Self {
        Self::new("error", data)
    }

    fn to_event(&self) -> Result<Event, axum::Error> {
        let event = Event::default();
        let event = if self.event.is_empty() {
            event
        } else {
            event.event(&*self.event)
        };
        event.json_data(&self.data)
    }
}

fn heartbeat() -> Event {
    Event::default().event("heartbeat")
}

/// Server wide notice that every open stream must wind down.
#[derive(Debug)]
pub struct ShutdownSignal {
    tx: watch::Sender<bool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self {
            tx: watch::channel(false).0,
        }
    }

    /// Close every stream opened with this signal, and any opened later.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// The response half of an [`SseStream`].
pub struct SseBody {
    rx: mpsc::Receiver<Event>,
}

impl IntoResponse for SseBody {
    fn into_response(self) -> Response {
        let mut rx = self.rx;
        let stream = futures_util::stream::poll_fn(move |cx| {
            rx.poll_recv(cx).map(|event| event.map(Ok::<_, Infallible>))
        });
        let mut response = Sse::new(stream).into_response();
        response
            .headers_mut()
            .insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        response
    }
}

pub struct SseStream {
    events: mpsc::Sender<SseEvent>,
    closing: AtomicBool,
    shutdown: watch::Sender<bool>,
    stopped: watch::Receiver<bool>,
}

impl SseStream {
    /// Spawn the writer task. The body must be returned from the handler for
    /// anything to reach the client.
    pub fn open(server: &ShutdownSignal) -> (Self, SseBody) {
        let (events_tx, events_rx) = mpsc::channel(1);
        let (body_tx, body_rx) = mpsc::channel(BODY_BUFFER);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (stopped_tx, stopped_rx) = watch::channel(false);

        tokio::spawn(run(
            events_rx,
            body_tx,
            shutdown_rx,
            server.tx.subscribe(),
            stopped_tx,
        ));

        let stream = Self {
            events: events_tx,
            closing: AtomicBool::new(false),
            shutdown: shutdown_tx,
            stopped: stopped_rx,
        };
        (stream, SseBody { rx: body_rx })
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Hand an event to the writer, waiting until it is accepted. Ignored once
    /// the stream is closing or the writer has stopped.
    pub async fn send(&self, event: SseEvent) {
        if self.is_closing() {
            log::debug!("SSE stream is closing, ignoring {} event", event.event);
            return;
        }
        if self.events.send(event).await.is_err() {
            log::debug!("SSE stream has stopped, event dropped");
        }
    }

    pub async fn send_error(&self, error: SseErrorData) {
        self.send(SseEvent::error(error)).await
    }

    /// Resolves once the writer task has written its last byte.
    pub async fn stopped(&self) {
        let mut stopped = self.stopped.clone();
        let _ = stopped.wait_for(|stopped| *stopped).await;
    }

    /// Ask the writer to finish and wait for it. Nothing is written to the
    /// body after this returns.
    pub async fn close(&self) {
        if !self.closing.swap(true, Ordering::AcqRel) {
            let _ = self.shutdown.send(true);
        }
        self.stopped().await
    }
}

impl Drop for SseStream {
    fn drop(&mut self) {
        self.closing.store(true, Ordering::Release);
        let _ = self.shutdown.send(true);
    }
}

enum Exit {
    ClientGone,
    Shutdown,
}

/// Resolves when the server shuts down. Never resolves if the signal is gone.
async fn server_closing(mut server: watch::Receiver<bool>) {
    let gone = server.wait_for(|closing| *closing).await.is_err();
    if gone {
        std::future::pending::<()>().await;
    }
}

fn encode(event: &SseEvent) -> Option<Event> {
    match event.to_event() {
        Ok(event) => Some(event),
        Err(e) => {
            log::error!("Unable to encode {} event: {e}", event.event);
            None
        }
    }
}

async fn run(
    mut events: mpsc::Receiver<SseEvent>,
    body: mpsc::Sender<Event>,
    mut shutdown: watch::Receiver<bool>,
    server: watch::Receiver<bool>,
    stopped: watch::Sender<bool>,
) {
    let deadline = tokio::time::sleep(MAX_STREAM_TIME);
    let heartbeat_timer = tokio::time::sleep(HEARTBEAT_INTERVAL);
    let server_closing = server_closing(server);
    tokio::pin!(deadline, heartbeat_timer, server_closing);

    let exit = loop {
        tokio::select! {
            biased;
            _ = body.closed() => {
                log::debug!("SSE client went away");
                break Exit::ClientGone;
            }
            _ = shutdown.changed() => {
                log::debug!("SSE stream shutting down");
                break Exit::Shutdown;
            }
            _ = &mut server_closing => {
                log::debug!("Server is shutting down, closing SSE stream");
                break Exit::Shutdown;
            }
            _ = &mut deadline => {
                log::info!("SSE stream reached its maximum lifetime");
                break Exit::Shutdown;
            }
            event = events.recv() => {
                let Some(event) = event else {
                    break Exit::Shutdown;
                };
                let Some(frame) = encode(&event) else {
                    continue;
                };
                if body.send(frame).await.is_err() {
                    log::debug!("Failed to write {} event", event.event);
                    break Exit::ClientGone;
                }
                heartbeat_timer.as_mut().reset(Instant::now() + HEARTBEAT_INTERVAL);
            }
            _ = &mut heartbeat_timer => {
                if body.send(heartbeat()).await.is_err() {
                    log::debug!("Failed to write heartbeat");
                    break Exit::ClientGone;
                }
                heartbeat_timer.as_mut().reset(Instant::now() + HEARTBEAT_INTERVAL);
            }
        }
    };

    if let Exit::Shutdown = exit {
        let mut closing_events = Vec::new();
        while let Ok(event) = events.try_recv() {
            closing_events.push(event);
        }
        closing_events.push(SseEvent::error(SseErrorData {
            code: Cow::Borrowed(SERVER_CLOSED),
            message: String::new(),
        }));
        closing_events.push(SseEvent::new("close", "Stream closed by server"));

        for frame in closing_events.iter().filter_map(encode) {
            match tokio::time::timeout(CLOSE_WRITE_TIMEOUT, body.send(frame)).await {
                Ok(Ok(())) => {}
                _ => {
                    log::debug!("Unable to write closing frames");
                    break;
                }
            }
        }
    }

    events.close();
    drop(body);
    let _ = stopped.send(true);
}
