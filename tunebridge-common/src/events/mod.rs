//! Conversion event types and the in-process EventBus
//!
//! Events are the only thing delivered to subscribers. They form a closed,
//! tagged union serialized with an `event_type` discriminator, so transports
//! never handle untyped payload blobs.

mod payloads;

pub use payloads::TrackPayload;

use chrono::{DateTime, Utc};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::warn;
use uuid::Uuid;

use crate::platform::Platform;
use crate::task::{DoneSummary, TaskFailure};
use crate::track::PlaylistMetadata;

/// Discriminator of a [`ConversionEvent`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Metadata,
    Track,
    Done,
    Error,
}

/// Event emitted while a playlist conversion runs
///
/// Every execution of a task is a run, numbered by the task's retry count
/// when it started. Per (task, run) the order is: one `Metadata`, zero or
/// more `Track` (any platform interleaving), then exactly one of `Done` /
/// `Error`. A run whose source playlist cannot be read emits a lone `Error`.
///
/// `sequence` increases by one per event of the same run, starting at 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum ConversionEvent {
    /// Source playlist metadata, sent once before any track event
    Metadata {
        task_id: Uuid,
        run: u32,
        sequence: u64,
        payload: PlaylistMetadata,
        timestamp: DateTime<Utc>,
    },

    /// One source track resolved on one target platform
    Track {
        task_id: Uuid,
        run: u32,
        sequence: u64,
        platform: Platform,
        payload: TrackPayload,
        timestamp: DateTime<Utc>,
    },

    /// Conversion finished and its result was persisted
    Done {
        task_id: Uuid,
        run: u32,
        sequence: u64,
        payload: DoneSummary,
        timestamp: DateTime<Utc>,
    },

    /// Conversion stopped (failure or cancellation)
    Error {
        task_id: Uuid,
        run: u32,
        sequence: u64,
        payload: TaskFailure,
        timestamp: DateTime<Utc>,
    },
}

impl ConversionEvent {
    pub fn task_id(&self) -> Uuid {
        match self {
            ConversionEvent::Metadata { task_id, .. }
            | ConversionEvent::Track { task_id, .. }
            | ConversionEvent::Done { task_id, .. }
            | ConversionEvent::Error { task_id, .. } => *task_id,
        }
    }

    /// Run of the task this event belongs to
    pub fn run(&self) -> u32 {
        match self {
            ConversionEvent::Metadata { run, .. }
            | ConversionEvent::Track { run, .. }
            | ConversionEvent::Done { run, .. }
            | ConversionEvent::Error { run, .. } => *run,
        }
    }

    pub fn sequence(&self) -> u64 {
        match self {
            ConversionEvent::Metadata { sequence, .. }
            | ConversionEvent::Track { sequence, .. }
            | ConversionEvent::Done { sequence, .. }
            | ConversionEvent::Error { sequence, .. } => *sequence,
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            ConversionEvent::Metadata { .. } => EventKind::Metadata,
            ConversionEvent::Track { .. } => EventKind::Track,
            ConversionEvent::Done { .. } => EventKind::Done,
            ConversionEvent::Error { .. } => EventKind::Error,
        }
    }

    /// Whether this event ends its run's event sequence
    pub fn is_terminal(&self) -> bool {
        matches!(self.kind(), EventKind::Done | EventKind::Error)
    }

    /// Identity a consumer can use to drop duplicate deliveries
    ///
    /// Track events are keyed by task, run, platform and source track ID; the
    /// other kinds occur once per run and are keyed by task, run and kind.
    pub fn dedup_key(&self) -> String {
        match self {
            ConversionEvent::Track {
                task_id,
                run,
                platform,
                payload,
                ..
            } => format!("{}:{}:track:{}:{}", task_id, run, platform, payload.source_id),
            other => format!("{}:{}:{:?}", other.task_id(), other.run(), other.kind()),
        }
    }
}

/// Central event distribution bus
///
/// Wraps `tokio::sync::broadcast`: publishing never blocks, slow subscribers
/// observe `Lagged` instead of stalling producers, subscribers clean up on drop.
///
/// # Examples
///
/// ```
/// use tunebridge_common::events::EventBus;
///
/// let event_bus = EventBus::new(256);
/// let _rx = event_bus.subscribe();
/// assert_eq!(event_bus.subscriber_count(), 1);
/// ```
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ConversionEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus buffering up to `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    ///
    /// Events emitted before subscription are not received.
    pub fn subscribe(&self) -> broadcast::Receiver<ConversionEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Err` if no subscribers are listening.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: ConversionEvent,
    ) -> Result<usize, broadcast::error::SendError<ConversionEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: ConversionEvent) {
        let _ = self.tx.send(event);
    }

    /// Finite stream of one run of a task
    ///
    /// Subscribes immediately (so nothing emitted after this call is missed)
    /// and ends right after the run's terminal event, or when the bus closes.
    pub fn task_stream(&self, task_id: Uuid, run: u32) -> impl Stream<Item = ConversionEvent> {
        Self::task_events(self.subscribe(), task_id, run)
    }

    /// Same as [`EventBus::task_stream`] over a receiver subscribed earlier
    ///
    /// Lets a caller subscribe before the task id is known.
    pub fn task_events(
        mut rx: broadcast::Receiver<ConversionEvent>,
        task_id: Uuid,
        run: u32,
    ) -> impl Stream<Item = ConversionEvent> {
        async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(event) if event.task_id() == task_id && event.run() == run => {
                        let terminal = event.is_terminal();
                        yield event;
                        if terminal {
                            break;
                        }
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(task_id = %task_id, skipped, "Task event stream lagged, events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    /// Get the current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Get the configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
