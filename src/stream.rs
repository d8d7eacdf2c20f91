//! Live result streams.
//!
//! A transport submits a run to the [`StreamStore`], hands the returned id to
//! its client, and later takes the stream back by id to forward it as
//! server-sent events. Every envelope becomes one [`StreamEvent::Result`]; a
//! final [`StreamEvent::Finished`] carries the default export filename.
//!
//! Each stream owns a [`CancellationToken`]. Cancelling it, or the client
//! going away, stops the forward loop and no further device is contacted.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use futures::stream::{self, BoxStream, StreamExt};
use log::{debug, info};
use moka::future::Cache;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::StreamConfig;
use crate::engine::{Engine, EnvelopeStream};
use crate::error::NetqueryError;
use crate::export;
use crate::inventory::Inventory;
use crate::outcome::Emitted;
use crate::query::Query;

/// Wire form of one envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct EnvelopePayload {
    pub filename: String,
    pub group: String,
    pub label: String,
    pub hostname: String,
    pub ip: String,
    pub device_type: Option<String>,
    /// Outcome kind, e.g. `timed_out`.
    pub outcome: String,
    /// Result column text; failures in their string form.
    pub result: String,
    /// Unfiltered output kept by a `no_matches` outcome.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
    pub log: String,
    pub progress: f64,
}

impl From<&Emitted> for EnvelopePayload {
    fn from(emitted: &Emitted) -> Self {
        let envelope = &emitted.envelope;
        Self {
            filename: envelope.source.clone(),
            group: envelope.group.clone(),
            label: envelope.label.clone(),
            hostname: envelope.hostname.clone(),
            ip: envelope.ip.clone(),
            device_type: envelope.device_type.clone(),
            outcome: envelope.outcome.kind().to_string(),
            result: envelope.outcome.label().into_owned(),
            raw: envelope.outcome.raw().map(str::to_string),
            log: envelope.transcript.clone(),
            progress: emitted.progress.fraction(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StreamEvent {
    Result { id: usize, payload: EnvelopePayload },
    Finished { filename: String },
}

impl StreamEvent {
    /// Server-sent event frame, blank line included.
    pub fn to_sse(&self) -> Result<String, NetqueryError> {
        match self {
            StreamEvent::Result { id, payload } => {
                Ok(format!("id:{id}\ndata:{}\n\n", serde_json::to_string(payload)?))
            }
            StreamEvent::Finished { filename } => {
                Ok(format!("event:finished\ndata:{filename}\n\n"))
            }
        }
    }
}

/// Wraps an envelope stream into events, ending early once `cancel` fires.
pub fn events(
    envelopes: EnvelopeStream,
    commands: Vec<String>,
    cancel: CancellationToken,
) -> BoxStream<'static, StreamEvent> {
    let finished = stream::once(async move {
        StreamEvent::Finished {
            filename: export::default_filename(&commands, Utc::now()),
        }
    });

    envelopes
        .enumerate()
        .map(|(id, emitted)| StreamEvent::Result {
            id,
            payload: EnvelopePayload::from(&emitted),
        })
        .chain(finished)
        .take_until(cancel.cancelled_owned())
        .boxed()
}

/// A submitted stream that nobody has taken yet.
pub struct PendingStream {
    events: BoxStream<'static, StreamEvent>,
    cancel: CancellationToken,
}

impl PendingStream {
    pub fn new(events: BoxStream<'static, StreamEvent>, cancel: CancellationToken) -> Self {
        Self { events, cancel }
    }
}

type Slot = Arc<Mutex<Option<PendingStream>>>;
type Registry = Arc<Mutex<HashMap<String, CancellationToken>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Bounded, expiring store of pending streams plus the tokens of streams
/// currently being forwarded.
#[derive(Clone)]
pub struct StreamStore {
    pending: Cache<String, Slot>,
    active: Registry,
}

impl StreamStore {
    pub fn new(config: StreamConfig) -> Self {
        let pending = Cache::builder()
            .max_capacity(config.capacity)
            .time_to_live(config.ttl())
            .build();

        Self {
            pending,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Stores a stream under a fresh id.
    pub async fn put(&self, stream: PendingStream) -> String {
        let id = Uuid::new_v4().to_string();
        self.pending
            .insert(id.clone(), Arc::new(Mutex::new(Some(stream))))
            .await;
        debug!("Stored stream {}", id);
        id
    }

    /// Starts a run and stores its event stream.
    ///
    /// Validation errors surface here; devices are only contacted once the
    /// stream is taken and forwarded.
    pub async fn submit(
        &self,
        engine: &Engine,
        inventory: &Inventory,
        query: Arc<Query>,
    ) -> Result<String, NetqueryError> {
        let cancel = CancellationToken::new();
        let envelopes = engine.execute(inventory, query.clone(), cancel.clone())?;
        let events = events(envelopes, query.commands.clone(), cancel.clone());
        Ok(self.put(PendingStream::new(events, cancel)).await)
    }

    /// True if `id` is pending and not expired.
    pub fn contains(&self, id: &str) -> bool {
        self.pending.contains_key(id)
    }

    /// Removes a pending stream for forwarding. Each id can be taken once.
    pub async fn take(&self, id: &str) -> Result<LiveStream, NetqueryError> {
        let not_found = || NetqueryError::StreamNotFound(id.to_string());
        let slot = self.pending.get(id).await.ok_or_else(not_found)?;
        self.pending.invalidate(id).await;
        let pending = lock(&slot).take().ok_or_else(not_found)?;

        lock(&self.active).insert(id.to_string(), pending.cancel.clone());
        Ok(LiveStream {
            events: pending.events,
            cancel: pending.cancel,
            _active: ActiveGuard {
                id: id.to_string(),
                registry: self.active.clone(),
            },
        })
    }

    /// Cancels a pending or live stream. Returns false for unknown ids.
    pub async fn cancel(&self, id: &str) -> bool {
        let live = lock(&self.active).get(id).cloned();
        if let Some(token) = live {
            token.cancel();
            info!("Cancelled live stream {}", id);
            return true;
        }

        let Some(slot) = self.pending.get(id).await else {
            return false;
        };
        let pending = lock(&slot).as_ref().map(|p| p.cancel.clone());
        match pending {
            Some(token) => {
                token.cancel();
                info!("Cancelled pending stream {}", id);
                true
            }
            None => false,
        }
    }
}

/// Drops the active-token entry of a stream when forwarding ends.
struct ActiveGuard {
    id: String,
    registry: Registry,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        lock(&self.registry).remove(&self.id);
    }
}

/// How a forward loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpOutcome {
    Completed,
    Cancelled,
    Disconnected,
}

/// A stream taken out of the store.
pub struct LiveStream {
    events: BoxStream<'static, StreamEvent>,
    cancel: CancellationToken,
    _active: ActiveGuard,
}

impl LiveStream {
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Forwards events into `sink` until the stream ends, is cancelled or the
    /// receiving side is dropped. Dropping the stream afterwards tears down
    /// any device session still in flight.
    pub async fn forward(mut self, sink: &mpsc::Sender<StreamEvent>) -> PumpOutcome {
        loop {
            if self.cancel.is_cancelled() {
                return PumpOutcome::Cancelled;
            }
            if sink.is_closed() {
                self.cancel.cancel();
                return PumpOutcome::Disconnected;
            }

            let next = tokio::select! {
                _ = sink.closed() => {
                    self.cancel.cancel();
                    return PumpOutcome::Disconnected;
                }
                next = self.events.next() => next,
            };

            match next {
                Some(event) => {
                    if sink.send(event).await.is_err() {
                        self.cancel.cancel();
                        return PumpOutcome::Disconnected;
                    }
                }
                None if self.cancel.is_cancelled() => return PumpOutcome::Cancelled,
                None => return PumpOutcome::Completed,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::{Outcome, Progress, ResultEnvelope};
    use std::time::Duration;

    fn emitted(index: usize, total: usize, outcome: Outcome) -> Emitted {
        Emitted {
            envelope: ResultEnvelope {
                source: "f1.json".to_string(),
                group: "core".to_string(),
                label: format!("r{index}"),
                hostname: format!("r{index}"),
                ip: format!("10.0.0.{index}"),
                device_type: Some("cisco_ios".to_string()),
                outcome,
                transcript: String::new(),
            },
            progress: Progress {
                completed: index,
                total,
            },
        }
    }

    fn envelope_stream(items: Vec<Emitted>) -> EnvelopeStream {
        stream::iter(items).boxed()
    }

    #[test]
    fn result_event_is_an_sse_frame() {
        let event = StreamEvent::Result {
            id: 0,
            payload: EnvelopePayload::from(&emitted(1, 2, Outcome::TimedOut)),
        };
        let frame = event.to_sse().expect("frame");
        assert!(frame.starts_with("id:0\ndata:{"));
        assert!(frame.ends_with("\n\n"));
        assert!(frame.contains(r#""result":"(timeout)""#));
        assert!(frame.contains(r#""progress":0.5"#));
    }

    #[test]
    fn finished_event_carries_filename() {
        let frame = StreamEvent::Finished {
            filename: "accessible__x.csv".to_string(),
        }
        .to_sse()
        .expect("frame");
        assert_eq!(frame, "event:finished\ndata:accessible__x.csv\n\n");
    }

    #[test]
    fn no_matches_payload_keeps_raw_output() {
        let payload = EnvelopePayload::from(&emitted(1, 1, Outcome::NoMatches("OK: link up".into())));
        assert_eq!(payload.outcome, "no_matches");
        assert_eq!(payload.raw.as_deref(), Some("OK: link up"));
    }

    #[tokio::test]
    async fn events_end_with_finished() {
        let items = vec![
            emitted(1, 2, Outcome::ConnectivityOnly),
            emitted(2, 2, Outcome::ConnectivityOnly),
        ];
        let collected: Vec<StreamEvent> =
            events(envelope_stream(items), Vec::new(), CancellationToken::new())
                .collect()
                .await;
        assert_eq!(collected.len(), 3);
        assert!(matches!(collected[1], StreamEvent::Result { id: 1, .. }));
        match &collected[2] {
            StreamEvent::Finished { filename } => assert!(filename.starts_with("accessible__")),
            other => panic!("expected finished, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancelled_token_yields_nothing() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let items = vec![emitted(1, 1, Outcome::ConnectivityOnly)];
        let collected: Vec<StreamEvent> =
            events(envelope_stream(items), Vec::new(), cancel).collect().await;
        assert!(collected.is_empty());
    }

    async fn store_with_one(store: &StreamStore) -> String {
        let cancel = CancellationToken::new();
        let items = vec![emitted(1, 1, Outcome::ConnectivityOnly)];
        let events = events(envelope_stream(items), Vec::new(), cancel.clone());
        store.put(PendingStream::new(events, cancel)).await
    }

    #[tokio::test]
    async fn stream_can_be_taken_once() {
        let store = StreamStore::new(StreamConfig::default());
        let id = store_with_one(&store).await;
        assert!(store.contains(&id));

        let live = store.take(&id).await.expect("first take");
        assert!(!store.contains(&id));
        assert!(matches!(
            store.take(&id).await,
            Err(NetqueryError::StreamNotFound(_))
        ));

        let (tx, mut rx) = mpsc::channel(8);
        assert_eq!(live.forward(&tx).await, PumpOutcome::Completed);
        assert!(matches!(rx.recv().await, Some(StreamEvent::Result { .. })));
        assert!(matches!(rx.recv().await, Some(StreamEvent::Finished { .. })));
    }

    #[tokio::test]
    async fn unknown_id_is_not_found() {
        let store = StreamStore::new(StreamConfig::default());
        assert!(matches!(
            store.take("missing").await,
            Err(NetqueryError::StreamNotFound(_))
        ));
        assert!(!store.cancel("missing").await);
    }

    #[tokio::test]
    async fn cancelling_a_pending_stream_stops_it_before_forwarding() {
        let store = StreamStore::new(StreamConfig::default());
        let id = store_with_one(&store).await;
        assert!(store.cancel(&id).await);

        let live = store.take(&id).await.expect("take");
        let (tx, mut rx) = mpsc::channel(8);
        assert_eq!(live.forward(&tx).await, PumpOutcome::Cancelled);
        drop(tx);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn live_stream_is_cancellable_by_id_until_dropped() {
        let store = StreamStore::new(StreamConfig::default());
        let id = store_with_one(&store).await;
        let live = store.take(&id).await.expect("take");
        let token = live.cancel_token();

        assert!(store.cancel(&id).await);
        assert!(token.is_cancelled());
        drop(live);
        assert!(!store.cancel(&id).await);
    }

    #[tokio::test]
    async fn dropped_receiver_reports_disconnect() {
        let store = StreamStore::new(StreamConfig::default());
        let id = store_with_one(&store).await;
        let live = store.take(&id).await.expect("take");
        let token = live.cancel_token();

        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        assert_eq!(live.forward(&tx).await, PumpOutcome::Disconnected);
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn pending_streams_expire() {
        let store = StreamStore::new(StreamConfig {
            capacity: 4,
            ttl_secs: 1,
        });
        let id = store_with_one(&store).await;
        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert!(!store.contains(&id));
        assert!(matches!(
            store.take(&id).await,
            Err(NetqueryError::StreamNotFound(_))
        ));
    }
}
