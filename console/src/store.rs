//! Bounded event store: per-resource telemetry state with normalization
//! at ingestion and version-counted, reference-stable snapshots.

use log::warn;
use shared::{
    BackgroundJob, BufferEntry, ConsoleRecord, FreezeTicket, HealthRecord, LogLevel,
    MetricsRecord, PlayerRecord, ResourceId, Topic, WirePayload, CONSOLE_CAPACITY,
};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

/// Payload rejected at the normalization boundary.
#[derive(Debug, PartialEq)]
pub enum IngestError {
    /// Payload shape belongs to a different topic than the channel it
    /// arrived on. The payload is dropped whole.
    TopicMismatch { expected: Topic, actual: Topic },
}

impl fmt::Display for IngestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IngestError::TopicMismatch { expected, actual } => write!(
                f,
                "payload shape is for topic {} but arrived on {} channel",
                actual, expected
            ),
        }
    }
}

impl std::error::Error for IngestError {}

/// Immutable view of the console buffer at one version. Two snapshots
/// with equal versions share the same entries allocation, so render
/// memoization can compare versions instead of contents.
#[derive(Debug, Clone)]
pub struct ConsoleSnapshot {
    pub version: u64,
    pub entries: Arc<Vec<BufferEntry<ConsoleRecord>>>,
}

/// Fixed-capacity console ring. Eviction is strictly FIFO and appending
/// a batch costs O(batch), never O(buffer).
pub struct ConsoleBuffer {
    entries: VecDeque<BufferEntry<ConsoleRecord>>,
    capacity: usize,
    next_seq: u64,
    version: u64,
    cached: Option<Arc<Vec<BufferEntry<ConsoleRecord>>>>,
}

impl ConsoleBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            next_seq: 0,
            version: 0,
            cached: None,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Appends records in arrival order, evicting from the front once
    /// full. Sequence numbers keep climbing across evictions; they are
    /// never reused.
    pub fn push_batch(&mut self, records: impl IntoIterator<Item = ConsoleRecord>) {
        let mut appended = false;
        for record in records {
            if self.entries.len() == self.capacity {
                self.entries.pop_front();
            }
            self.entries.push_back(BufferEntry {
                seq: self.next_seq,
                record,
            });
            self.next_seq += 1;
            appended = true;
        }
        if appended {
            self.version += 1;
            self.cached = None;
        }
    }

    /// Drops every entry and bumps the version. Sequence numbers are not
    /// reset; records appended after a clear keep climbing from where
    /// the evicted ones left off.
    pub fn clear(&mut self) {
        if self.entries.is_empty() {
            return;
        }
        self.entries.clear();
        self.version += 1;
        self.cached = None;
    }

    /// Snapshot at the current version. Rebuilds the backing Vec only
    /// when the buffer changed since the last call.
    pub fn snapshot(&mut self) -> ConsoleSnapshot {
        let entries = match &self.cached {
            Some(cached) => Arc::clone(cached),
            None => {
                let rebuilt: Arc<Vec<BufferEntry<ConsoleRecord>>> =
                    Arc::new(self.entries.iter().cloned().collect());
                self.cached = Some(Arc::clone(&rebuilt));
                rebuilt
            }
        };
        ConsoleSnapshot {
            version: self.version,
            entries,
        }
    }
}

/// Most-recent-wins slot for a replace-topic. Readers hold the Arc; a
/// replace swaps the slot without touching live references.
pub struct Latest<T> {
    version: u64,
    value: Option<Arc<T>>,
}

impl<T> Latest<T> {
    pub fn new() -> Self {
        Self {
            version: 0,
            value: None,
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn get(&self) -> Option<Arc<T>> {
        self.value.as_ref().map(Arc::clone)
    }

    pub fn replace(&mut self, value: T) {
        self.value = Some(Arc::new(value));
        self.version += 1;
    }
}

impl<T> Default for Latest<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// All stored telemetry for one resource.
pub struct ResourceStore {
    pub console: ConsoleBuffer,
    pub metrics: Latest<MetricsRecord>,
    pub players: Latest<Vec<PlayerRecord>>,
    pub freezes: Latest<Vec<FreezeTicket>>,
    pub jobs: Latest<Vec<BackgroundJob>>,
    pub health: Latest<HealthRecord>,
    /// Store generation for this resource id. Completions captured under
    /// an older epoch must not touch a recreated entry.
    pub epoch: u64,
}

impl ResourceStore {
    fn new(console_capacity: usize, epoch: u64) -> Self {
        Self {
            console: ConsoleBuffer::new(console_capacity),
            metrics: Latest::new(),
            players: Latest::new(),
            freezes: Latest::new(),
            jobs: Latest::new(),
            health: Latest::new(),
            epoch,
        }
    }
}

/// The event store: one `ResourceStore` per resource the console has
/// touched. Every channel payload enters through [`EventStore::ingest`],
/// the single normalization boundary.
pub struct EventStore {
    resources: HashMap<ResourceId, ResourceStore>,
    console_capacity: usize,
    next_epoch: u64,
}

impl EventStore {
    pub fn new() -> Self {
        Self::with_console_capacity(CONSOLE_CAPACITY)
    }

    /// Capacity override for tests that exercise eviction without
    /// pushing a thousand records.
    pub fn with_console_capacity(console_capacity: usize) -> Self {
        Self {
            resources: HashMap::new(),
            console_capacity,
            next_epoch: 0,
        }
    }

    pub fn entry(&mut self, resource: &ResourceId) -> &mut ResourceStore {
        if !self.resources.contains_key(resource) {
            let epoch = self.next_epoch;
            self.next_epoch += 1;
            self.resources
                .insert(resource.clone(), ResourceStore::new(self.console_capacity, epoch));
        }
        self.resources.get_mut(resource).unwrap()
    }

    pub fn get(&self, resource: &ResourceId) -> Option<&ResourceStore> {
        self.resources.get(resource)
    }

    pub fn get_mut(&mut self, resource: &ResourceId) -> Option<&mut ResourceStore> {
        self.resources.get_mut(resource)
    }

    /// Drops all stored telemetry for a resource. A later `entry` call
    /// recreates it under a fresh epoch.
    pub fn remove(&mut self, resource: &ResourceId) {
        self.resources.remove(resource);
    }

    /// Normalizes and applies one channel payload. Rejects payloads whose
    /// shape disagrees with the channel topic; skips console lines whose
    /// level fails validation rather than dropping the batch.
    pub fn ingest(
        &mut self,
        resource: &ResourceId,
        topic: Topic,
        payload: WirePayload,
    ) -> Result<(), IngestError> {
        if payload.topic() != topic {
            return Err(IngestError::TopicMismatch {
                expected: topic,
                actual: payload.topic(),
            });
        }

        let entry = self.entry(resource);
        match payload {
            WirePayload::ConsoleLines(lines) => {
                let records = lines.into_iter().filter_map(|line| {
                    match LogLevel::parse_loose(&line.level) {
                        Some(level) => Some(ConsoleRecord {
                            timestamp_ms: line.ts_ms,
                            level,
                            text: line.text,
                        }),
                        None => {
                            warn!("Skipping console line with unknown level '{}'", line.level);
                            None
                        }
                    }
                });
                entry.console.push_batch(records);
            }
            WirePayload::ConsoleLinesV1(lines) => {
                // Legacy lines carry no level; Info is the canonical default.
                let records = lines.into_iter().map(|(ts_ms, text)| ConsoleRecord {
                    timestamp_ms: ts_ms,
                    level: LogLevel::Info,
                    text,
                });
                entry.console.push_batch(records);
            }
            WirePayload::Metrics(m) => {
                entry.metrics.replace(MetricsRecord {
                    ticks_per_second: m.ticks_per_second,
                    tick_p95_ms: m.tick_p95_ms,
                    heap_mb: m.heap_mb,
                    gpu_queue_ms: m.gpu_queue_ms,
                    players_online: m.players_online,
                });
            }
            WirePayload::MetricsV1(m) => {
                entry.metrics.replace(MetricsRecord {
                    ticks_per_second: m.tps,
                    tick_p95_ms: m.tick_p95,
                    heap_mb: m.heap,
                    gpu_queue_ms: m.gpu_ms,
                    players_online: m.online,
                });
            }
            WirePayload::Players(players) => entry.players.replace(players),
            WirePayload::Freezes(freezes) => entry.freezes.replace(freezes),
            WirePayload::Jobs(jobs) => entry.jobs.replace(jobs),
            WirePayload::Health(health) => entry.health.replace(health),
        }
        Ok(())
    }

    /// Appends a locally synthesized console record, bypassing wire
    /// normalization. Used for command echo and failure records.
    pub fn push_synthetic(&mut self, resource: &ResourceId, record: ConsoleRecord) {
        self.entry(resource).console.push_batch([record]);
    }

    /// Empties a resource's console buffer while keeping the rest of its
    /// telemetry and its epoch. No-op for a resource with no entry.
    pub fn clear_console(&mut self, resource: &ResourceId) {
        if let Some(entry) = self.resources.get_mut(resource) {
            entry.console.clear();
        }
    }
}

impl Default for EventStore {
    fn default() -> Self {
        Self::new()
    }
}
