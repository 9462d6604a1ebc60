//! Lifecycle event stream.
//!
//! Every observable side effect of the engine is published on a broadcast
//! channel. Monitoring collaborators subscribe without touching internals;
//! publishing never blocks and is a no-op when nobody listens.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use super::config::InvalidationStrategy;

/// Monotonic sequence number of an event within one engine.
pub type Epoch = u64;

/// Tier that served a hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Local,
    Remote,
}

/// A lifecycle event with identity and ordering.
#[derive(Debug, Clone)]
pub struct CacheEvent {
    /// Unique identifier (UUIDv4).
    pub id: Uuid,
    pub epoch: Epoch,
    pub kind: EventKind,
    pub timestamp: OffsetDateTime,
}

impl CacheEvent {
    pub fn new(kind: EventKind, epoch: Epoch) -> Self {
        Self {
            id: Uuid::new_v4(),
            epoch,
            kind,
            timestamp: OffsetDateTime::now_utc(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    /// A lookup was served from cache.
    Hit {
        key: String,
        fingerprint: String,
        tier: Tier,
        elapsed: Duration,
    },
    /// A lookup found nothing usable.
    Miss {
        key: String,
        fingerprint: String,
        elapsed: Duration,
    },
    /// A result was stored.
    Set {
        key: String,
        fingerprint: String,
        size: usize,
        ttl_secs: i64,
        tables: Vec<String>,
    },
    /// A key was deleted explicitly.
    Delete { key: String },
    /// Entries were removed because their tables changed.
    Invalidation {
        tables: Vec<String>,
        keys: usize,
        strategy: InvalidationStrategy,
    },
    /// A warming cycle finished.
    Warm {
        warmed: usize,
        refreshed: usize,
        elapsed: Duration,
    },
    /// The whole cache was cleared.
    Clear,
}

impl EventKind {
    /// Short event name, matching the public event vocabulary.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Hit { .. } => "cacheHit",
            Self::Miss { .. } => "cacheMiss",
            Self::Set { .. } => "cacheSet",
            Self::Delete { .. } => "cacheDelete",
            Self::Invalidation { .. } => "cacheInvalidation",
            Self::Warm { .. } => "cacheWarm",
            Self::Clear => "cacheClear",
        }
    }
}

/// Broadcast publisher for lifecycle events.
pub struct EventBus {
    sender: broadcast::Sender<CacheEvent>,
    epoch_counter: AtomicU64,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            epoch_counter: AtomicU64::new(0),
        }
    }

    pub fn next_epoch(&self) -> Epoch {
        self.epoch_counter.fetch_add(1, Ordering::SeqCst)
    }

    /// Publish an event to current subscribers.
    pub fn publish(&self, kind: EventKind) {
        let event = CacheEvent::new(kind, self.next_epoch());

        debug!(
            event_id = %event.id,
            event_epoch = event.epoch,
            event_name = event.kind.name(),
            "Cache event published"
        );

        // Err only means there are no receivers right now.
        let _ = self.sender.send(event);
    }

    /// Subscribe to events published from now on.
    ///
    /// Slow subscribers that fall more than the channel capacity behind see
    /// `RecvError::Lagged` and skip ahead.
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
