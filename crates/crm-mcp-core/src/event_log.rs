//! Bounded per-session event log with broadcast for stream resumption.

use std::{
    collections::VecDeque,
    fmt,
    sync::{
        PoisonError, RwLock,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use futures::{StreamExt, future, stream::BoxStream};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::{sync::broadcast, time::Instant};
use tokio_stream::wrappers::{BroadcastStream, errors::BroadcastStreamRecvError};

use crate::{EventLogConfig, TransportError};

/// Process-wide source of event ids, so ids never repeat across sessions.
static NEXT_EVENT_ID: AtomicU64 = AtomicU64::new(1);

/// Identifier of a logged event. Strictly increasing in append order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(u64);

impl EventId {
    fn next() -> Self {
        Self(NEXT_EVENT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Parse an id received from a client (`Last-Event-ID`).
    ///
    /// Anything that is not a decimal id yields `None`, which callers treat
    /// as "replay everything".
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        raw.trim().parse().ok().map(Self)
    }

    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A retained outbound message.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub event_id: EventId,
    pub payload: Value,
    /// Creation time. Only used for retention.
    pub timestamp: Instant,
}

struct Inner {
    entries: VecDeque<LogEntry>,
    /// Newest id ever appended here, retained or not.
    newest: Option<EventId>,
    /// Dropped on destroy so that live subscribers see the end of the stream.
    sender: Option<broadcast::Sender<LogEntry>>,
}

/// Append-only ring buffer of outbound messages for one session.
///
/// Essential for resumption: a reconnecting client replays everything after
/// its last seen id, then seamlessly switches to live entries.
pub struct EventLog {
    inner: RwLock<Inner>,
    retention: Duration,
    max_entries: usize,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new(&EventLogConfig::default())
    }
}

impl fmt::Debug for EventLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLog")
            .field("len", &self.len())
            .field("retention", &self.retention)
            .field("max_entries", &self.max_entries)
            .finish_non_exhaustive()
    }
}

impl EventLog {
    /// Create an empty log with the given retention limits.
    #[must_use]
    pub fn new(config: &EventLogConfig) -> Self {
        let max_entries = config.max_entries.max(1);
        let (sender, _) = broadcast::channel(max_entries.clamp(16, 4096));
        Self {
            inner: RwLock::new(Inner {
                entries: VecDeque::with_capacity(max_entries.min(64)),
                newest: None,
                sender: Some(sender),
            }),
            retention: config.retention(),
            max_entries,
        }
    }

    /// Append a message, trimming expired and excess entries first.
    ///
    /// After `destroy` the id is still allocated but nothing is stored.
    pub fn append(&self, payload: Value) -> EventId {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let event_id = EventId::next();

        let Some(sender) = inner.sender.clone() else {
            tracing::debug!(%event_id, "Dropping event appended to destroyed log");
            return event_id;
        };

        let now = Instant::now();
        self.trim(&mut inner.entries, now);

        let entry = LogEntry {
            event_id,
            payload,
            timestamp: now,
        };
        // Sent under the write lock so subscribe_after snapshots stay gap-free.
        let _ = sender.send(entry.clone());
        inner.entries.push_back(entry);
        inner.newest = Some(event_id);
        event_id
    }

    fn trim(&self, entries: &mut VecDeque<LogEntry>, now: Instant) {
        while entries
            .front()
            .is_some_and(|front| now.duration_since(front.timestamp) > self.retention)
        {
            entries.pop_front();
        }
        // Make room for the entry about to be pushed.
        while entries.len() >= self.max_entries {
            entries.pop_front();
        }
    }

    fn is_expired(&self, entry: &LogEntry, now: Instant) -> bool {
        now.duration_since(entry.timestamp) > self.retention
    }

    /// Ids this log never issued are unknown and replay everything.
    fn known(inner: &Inner, after: Option<EventId>) -> Option<EventId> {
        let after = after?;
        if inner.newest.is_some_and(|newest| after <= newest) {
            Some(after)
        } else {
            tracing::debug!(%after, newest = ?inner.newest, "Unknown resume id, replaying all");
            None
        }
    }

    fn backlog(&self, inner: &Inner, after: Option<EventId>) -> Vec<LogEntry> {
        let after = Self::known(inner, after);
        let now = Instant::now();
        inner
            .entries
            .iter()
            .filter(|e| !self.is_expired(e, now))
            .filter(|e| after.is_none_or(|after| e.event_id > after))
            .cloned()
            .collect()
    }

    /// Deliver every retained entry newer than `after`, oldest first.
    ///
    /// With `after == None`, or an id newer than anything appended here, the
    /// whole log is replayed. An id that has already been trimmed replays from
    /// the oldest retained entry. Returns the number
    /// of entries delivered.
    pub fn replay_after<F>(&self, after: Option<EventId>, mut sink: F) -> usize
    where
        F: FnMut(EventId, &Value),
    {
        let backlog = {
            let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
            self.backlog(&inner, after)
        };
        for entry in &backlog {
            sink(entry.event_id, &entry.payload);
        }
        tracing::debug!(after = ?after, replayed = backlog.len(), "Replayed event log");
        backlog.len()
    }

    /// Snapshot the replay backlog and subscribe to live entries atomically.
    ///
    /// Every entry is either in the returned backlog or delivered through
    /// the receiver, never both: entries are broadcast under the write lock
    /// and the receiver is created under the read lock. The receiver is `None` once destroyed.
    #[must_use]
    pub fn subscribe_after(
        &self,
        after: Option<EventId>,
    ) -> (Vec<LogEntry>, Option<broadcast::Receiver<LogEntry>>) {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let rx = inner.sender.as_ref().map(broadcast::Sender::subscribe);
        (self.backlog(&inner, after), rx)
    }

    /// Stream that yields the backlog after `after`, then live entries.
    ///
    /// A lagging subscriber receives `TransportError::Lagged`. The stream ends
    /// when the log is destroyed.
    #[must_use]
    pub fn stream_after(
        &self,
        after: Option<EventId>,
    ) -> BoxStream<'static, Result<LogEntry, TransportError>> {
        let (backlog, rx) = self.subscribe_after(after);

        let hist = futures::stream::iter(backlog.into_iter().map(Ok));
        let Some(rx) = rx else {
            return hist.boxed();
        };

        let live = BroadcastStream::new(rx).filter_map(move |res| {
            future::ready(match res {
                Ok(entry) => Some(Ok(entry)),
                Err(BroadcastStreamRecvError::Lagged(n)) => Some(Err(TransportError::Lagged(n))),
            })
        });

        hist.chain(live).boxed()
    }

    /// Release all entries and end live subscriptions.
    pub fn destroy(&self) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.entries.clear();
        inner.sender = None;
    }

    /// Whether `destroy` has been called.
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .sender
            .is_none()
    }

    /// Number of retained entries (expired entries included until the next append).
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Id of the newest retained entry.
    #[must_use]
    pub fn last_event_id(&self) -> Option<EventId> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .back()
            .map(|e| e.event_id)
    }
}
