//! SSE event stream with auto-reconnect.
//!
//! Connects to the bridge's `/eventstream/clip/v2` endpoint and streams
//! parsed event batches through a [`tokio::sync::broadcast`] channel.
//! Handles reconnection with exponential backoff + jitter automatically,
//! and publishes liveness through a [`tokio::sync::watch`] channel so the
//! owning session can degrade its online status while the stream is down.
//!
//! One SSE message holds a whole batch of events; batch boundaries are
//! preserved on the broadcast channel because consumers need to see all
//! resources of a batch together (scene events in particular).

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use secrecy::ExposeSecret;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::client::{APPLICATION_KEY_HEADER, Clip2Client};
use crate::error::Error;
use crate::transport::TransportConfig;
use crate::types::{Event, EventKind};

// ── Broadcast channel capacity ───────────────────────────────────────

const EVENT_CHANNEL_CAPACITY: usize = 1024;

// ── ReconnectConfig ──────────────────────────────────────────────────

/// Exponential backoff configuration for event stream reconnection.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt. Default: 1s.
    pub initial_delay: Duration,

    /// Upper bound on backoff delay. Default: 30s.
    pub max_delay: Duration,

    /// Maximum reconnection attempts before giving up.
    /// `None` means retry forever.
    pub max_retries: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_retries: None,
        }
    }
}

// ── EventStreamHandle ────────────────────────────────────────────────

/// Handle to a running SSE event stream.
///
/// Subscribe for event batches, watch [`alive`](Self::alive) for stream
/// health, and cancel via [`shutdown`](Self::shutdown).
pub struct EventStreamHandle {
    event_rx: broadcast::Receiver<Arc<Vec<Event>>>,
    alive_rx: watch::Receiver<bool>,
    cancel: CancellationToken,
}

impl EventStreamHandle {
    /// Spawn the event stream background task for `client`'s bridge.
    ///
    /// Returns immediately; the first connection attempt happens
    /// asynchronously. Watch [`alive`](Self::alive) to learn when the
    /// stream is actually up.
    pub fn spawn(
        client: &Clip2Client,
        transport: &TransportConfig,
        reconnect: ReconnectConfig,
        cancel: CancellationToken,
    ) -> Result<Self, Error> {
        let http = Clip2Client::streaming_http(transport)?;
        let url = client.event_url().clone();
        let key = client.application_key().expose_secret().to_owned();

        let (event_tx, event_rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (alive_tx, alive_rx) = watch::channel(false);

        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            sse_loop(http, url, key, event_tx, alive_tx, reconnect, task_cancel).await;
        });

        Ok(Self {
            event_rx,
            alive_rx,
            cancel,
        })
    }

    /// Get a new broadcast receiver for event batches.
    ///
    /// Multiple consumers can subscribe concurrently. A consumer that
    /// falls behind receives [`broadcast::error::RecvError::Lagged`].
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Vec<Event>>> {
        self.event_rx.resubscribe()
    }

    /// Watch channel carrying the stream's liveness.
    ///
    /// `true` while a connection is open and delivering bytes, `false`
    /// between connections.
    pub fn alive(&self) -> watch::Receiver<bool> {
        self.alive_rx.clone()
    }

    /// `true` if a connection is currently open.
    pub fn is_alive(&self) -> bool {
        *self.alive_rx.borrow()
    }

    /// Signal the background task to shut down.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

// ── Background reconnection loop ─────────────────────────────────────

/// Main loop: connect → read → on error, backoff → reconnect.
async fn sse_loop(
    http: reqwest::Client,
    url: Url,
    application_key: String,
    event_tx: broadcast::Sender<Arc<Vec<Event>>>,
    alive_tx: watch::Sender<bool>,
    reconnect: ReconnectConfig,
    cancel: CancellationToken,
) {
    let mut attempt: u32 = 0;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = connect_and_read(&http, &url, &application_key, &event_tx, &alive_tx, &cancel) => {
                let _ = alive_tx.send(false);
                match result {
                    // Clean end of stream. Reset the attempt counter and
                    // reconnect immediately.
                    Ok(()) => {
                        tracing::info!("event stream ended cleanly, reconnecting");
                        attempt = 0;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, attempt, "event stream error");

                        if let Some(max) = reconnect.max_retries {
                            if attempt >= max {
                                tracing::error!(
                                    max_retries = max,
                                    "event stream reconnection limit reached, giving up"
                                );
                                break;
                            }
                        }

                        let delay = calculate_backoff(attempt, &reconnect);
                        tracing::info!(
                            delay_ms = delay.as_millis() as u64,
                            attempt,
                            "waiting before event stream reconnect"
                        );

                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(delay) => {}
                        }

                        attempt += 1;
                    }
                }
            }
        }
    }

    let _ = alive_tx.send(false);
    tracing::debug!("event stream loop exiting");
}

// ── Single connection lifecycle ──────────────────────────────────────

/// Open one SSE connection and read messages until it drops.
async fn connect_and_read(
    http: &reqwest::Client,
    url: &Url,
    application_key: &str,
    event_tx: &broadcast::Sender<Arc<Vec<Event>>>,
    alive_tx: &watch::Sender<bool>,
    cancel: &CancellationToken,
) -> Result<(), Error> {
    tracing::info!(url = %url, "connecting to event stream");

    let response = http
        .get(url.clone())
        .header(APPLICATION_KEY_HEADER, application_key)
        .header(reqwest::header::ACCEPT, "text/event-stream")
        .send()
        .await?;

    let status = response.status();
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN
    {
        return Err(Error::Unauthorized {
            message: format!("event stream refused with {status}"),
        });
    }
    if !status.is_success() {
        return Err(Error::EventStream(format!(
            "event stream returned {status}"
        )));
    }

    tracing::info!("event stream connected");
    let _ = alive_tx.send(true);

    let mut body = response.bytes_stream();
    let mut parser = SseParser::default();

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            chunk = body.next() => {
                match chunk {
                    Some(Ok(bytes)) => {
                        for message in parser.push(&bytes) {
                            parse_and_broadcast(&message, event_tx);
                        }
                    }
                    Some(Err(e)) => {
                        return Err(Error::EventStream(e.to_string()));
                    }
                    None => {
                        tracing::info!("event stream closed by bridge");
                        return Ok(());
                    }
                }
            }
        }
    }
}

// ── SSE framing ──────────────────────────────────────────────────────

/// Incremental parser for the `text/event-stream` wire format.
///
/// Accumulates chunks and yields the concatenated `data:` payload of
/// each complete message (messages end with a blank line). Comment
/// lines (`:` prefix, used by the bridge as keep-alive) and `id:`/
/// `event:` fields are skipped.
#[derive(Debug, Default)]
struct SseParser {
    buffer: String,
}

impl SseParser {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.push_str(&String::from_utf8_lossy(bytes));

        let mut messages = Vec::new();
        while let Some(end) = self.buffer.find("\n\n") {
            let raw: String = self.buffer.drain(..end + 2).collect();
            let mut data = String::new();
            for line in raw.lines() {
                if let Some(payload) = line.strip_prefix("data:") {
                    data.push_str(payload.trim_start());
                }
            }
            if !data.is_empty() {
                messages.push(data);
            }
        }
        messages
    }
}

/// Parse one SSE message payload and broadcast the event batch.
fn parse_and_broadcast(payload: &str, event_tx: &broadcast::Sender<Arc<Vec<Event>>>) {
    let mut events: Vec<Event> = match serde_json::from_str(payload) {
        Ok(events) => events,
        Err(e) => {
            tracing::debug!(error = %e, "failed to parse event stream payload");
            return;
        }
    };

    // Update events carry partial resources; absent fields mean
    // unchanged, and consumers merge them against their caches.
    for event in &mut events {
        if event.kind == EventKind::Update {
            for resource in std::mem::take(&mut event.data) {
                event.data.push(resource.mark_sparse());
            }
        }
    }

    let resource_count: usize = events.iter().map(|e| e.data.len()).sum();
    tracing::trace!(events = events.len(), resources = resource_count, "event batch");

    // Ignore send errors; it just means no active subscribers right now
    let _ = event_tx.send(Arc::new(events));
}

// ── Backoff calculation ──────────────────────────────────────────────

/// Exponential backoff with jitter.
///
/// `delay = min(initial * 2^attempt, max) + jitter`
///
/// Jitter is +-25% to spread out reconnection storms from multiple clients.
fn calculate_backoff(attempt: u32, config: &ReconnectConfig) -> Duration {
    let base = config.initial_delay.as_secs_f64() * 2.0_f64.powi(attempt as i32);
    let capped = base.min(config.max_delay.as_secs_f64());

    // Deterministic "jitter" seeded from the attempt number.
    // Not cryptographically random, but good enough for backoff spread.
    let jitter_factor = 1.0 + 0.25 * ((f64::from(attempt) * 7.3).sin());
    let with_jitter = (capped * jitter_factor).max(0.0);

    Duration::from_secs_f64(with_jitter)
}

// ── Tests ────────────────────────────────────────────────────────────
