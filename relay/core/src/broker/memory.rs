//! In-process partitioned log
//!
//! Each topic owns a growable set of partitions; each partition is a bounded
//! log with monotonically increasing offsets. Consumers wait on a watch of the
//! partition's high watermark, so an append wakes every parked reader without
//! a per-consumer queue.
//!
//! Fault injection hooks (`reject_publishes`, `fail_metadata`,
//! `sever_partition`) let tests and drills reproduce broker failures.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::{
    Broker, BrokerError, BrokerRecord, ConsumerConnection, ProducerConnection, StartOffset,
};
use crate::config::BrokerCredentials;

/// Records retained per partition before the oldest are dropped
pub const DEFAULT_PARTITION_CAPACITY: usize = 4096;

// ============================================================================
// Partition log
// ============================================================================

#[derive(Debug)]
struct LogState {
    // Offset of the first retained record.
    base_offset: u64,
    records: VecDeque<BrokerRecord>,
}

#[derive(Debug)]
struct PartitionLog {
    index: usize,
    capacity: usize,
    log: Mutex<LogState>,
    // Next offset to be assigned.
    high_watermark: watch::Sender<u64>,
    // Live consumers, keyed by consumer id, with their sever handle.
    consumers: Mutex<HashMap<u64, CancellationToken>>,
}

impl PartitionLog {
    fn new(index: usize, capacity: usize) -> Self {
        let (high_watermark, _) = watch::channel(0);
        Self {
            index,
            capacity,
            log: Mutex::new(LogState {
                base_offset: 0,
                records: VecDeque::new(),
            }),
            high_watermark,
            consumers: Mutex::new(HashMap::new()),
        }
    }

    fn append(&self, key: &[u8], value: &[u8]) -> u64 {
        let offset = {
            let mut state = self.log.lock();
            let offset = state.base_offset + state.records.len() as u64;
            state.records.push_back(BrokerRecord {
                partition: self.index,
                offset,
                key: key.to_vec(),
                value: value.to_vec(),
            });
            while state.records.len() > self.capacity {
                state.records.pop_front();
                state.base_offset += 1;
            }
            offset
        };
        self.high_watermark.send_replace(offset + 1);
        offset
    }

    /// Read the record at `*next`, advancing it. Readers that fell behind the
    /// retained window skip forward to the oldest retained record.
    fn read_at(&self, next: &mut u64) -> Option<BrokerRecord> {
        let state = self.log.lock();
        if *next < state.base_offset {
            tracing::warn!(
                partition = self.index,
                requested = *next,
                oldest = state.base_offset,
                "Consumer fell behind retained log, skipping ahead"
            );
            *next = state.base_offset;
        }
        let idx = (*next - state.base_offset) as usize;
        let record = state.records.get(idx).cloned()?;
        *next += 1;
        Some(record)
    }

    fn end_offset(&self) -> u64 {
        let state = self.log.lock();
        state.base_offset + state.records.len() as u64
    }

    fn start_offset(&self) -> u64 {
        self.log.lock().base_offset
    }
}

#[derive(Debug)]
struct TopicState {
    partitions: RwLock<Vec<Arc<PartitionLog>>>,
    partition_count: watch::Sender<usize>,
}

impl TopicState {
    fn new(partitions: usize, capacity: usize) -> Self {
        let logs = (0..partitions)
            .map(|i| Arc::new(PartitionLog::new(i, capacity)))
            .collect();
        let (partition_count, _) = watch::channel(partitions);
        Self {
            partitions: RwLock::new(logs),
            partition_count,
        }
    }

    fn partition(&self, topic: &str, index: usize) -> Result<Arc<PartitionLog>, BrokerError> {
        self.partitions
            .read()
            .get(index)
            .cloned()
            .ok_or_else(|| BrokerError::UnknownPartition {
                topic: topic.to_string(),
                partition: index,
            })
    }
}

// ============================================================================
// Broker
// ============================================================================

#[derive(Debug, Default)]
struct Faults {
    reject_remaining: AtomicU64,
    reject_all: AtomicBool,
    fail_metadata: AtomicBool,
}

#[derive(Debug)]
struct BrokerState {
    topics: RwLock<HashMap<String, Arc<TopicState>>>,
    partition_capacity: usize,
    required_credentials: RwLock<Option<BrokerCredentials>>,
    faults: Faults,
    open_producers: AtomicUsize,
    open_consumers: AtomicUsize,
    next_consumer_id: AtomicU64,
    publish_attempts: AtomicU64,
}

/// In-process broker with partitioned, offset-addressed logs
#[derive(Debug, Clone)]
pub struct InMemoryBroker {
    state: Arc<BrokerState>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_PARTITION_CAPACITY)
    }

    /// Broker retaining at most `partition_capacity` records per partition
    pub fn with_capacity(partition_capacity: usize) -> Self {
        Self {
            state: Arc::new(BrokerState {
                topics: RwLock::new(HashMap::new()),
                partition_capacity: partition_capacity.max(1),
                required_credentials: RwLock::new(None),
                faults: Faults::default(),
                open_producers: AtomicUsize::new(0),
                open_consumers: AtomicUsize::new(0),
                next_consumer_id: AtomicU64::new(1),
                publish_attempts: AtomicU64::new(0),
            }),
        }
    }

    /// Require every connection to present these credentials
    #[must_use]
    pub fn with_required_credentials(self, credentials: BrokerCredentials) -> Self {
        *self.state.required_credentials.write() = Some(credentials);
        self
    }

    /// Create `topic` with `partitions` partitions. No-op if it exists.
    pub fn create_topic(&self, topic: &str, partitions: usize) -> Result<(), BrokerError> {
        if partitions == 0 {
            return Err(BrokerError::Rejected(format!(
                "topic {topic} needs at least one partition"
            )));
        }
        let mut topics = self.state.topics.write();
        topics.entry(topic.to_string()).or_insert_with(|| {
            Arc::new(TopicState::new(partitions, self.state.partition_capacity))
        });
        Ok(())
    }

    /// Grow `topic` to `partitions` partitions and notify watchers.
    /// Partition counts never shrink.
    pub fn set_partition_count(&self, topic: &str, partitions: usize) -> Result<(), BrokerError> {
        let topic_state = self.topic(topic)?;
        {
            let mut logs = topic_state.partitions.write();
            if partitions < logs.len() {
                return Err(BrokerError::Rejected(format!(
                    "cannot shrink topic {topic} from {} to {partitions} partitions",
                    logs.len()
                )));
            }
            let capacity = self.state.partition_capacity;
            for index in logs.len()..partitions {
                logs.push(Arc::new(PartitionLog::new(index, capacity)));
            }
        }
        topic_state.partition_count.send_replace(partitions);
        tracing::info!(topic, partitions, "Topic partition count changed");
        Ok(())
    }

    /// Reject the next `count` publish attempts
    pub fn reject_publishes(&self, count: u64) {
        self.state
            .faults
            .reject_remaining
            .store(count, Ordering::SeqCst);
    }

    /// Reject every publish attempt until turned off
    pub fn reject_all_publishes(&self, reject: bool) {
        self.state.faults.reject_all.store(reject, Ordering::SeqCst);
    }

    /// Make metadata requests fail until turned off
    pub fn fail_metadata(&self, fail: bool) {
        self.state.faults.fail_metadata.store(fail, Ordering::SeqCst);
    }

    /// Forcibly drop every consumer connected to one partition.
    /// Returns how many consumers were severed.
    pub fn sever_partition(&self, topic: &str, partition: usize) -> Result<usize, BrokerError> {
        let log = self.topic(topic)?.partition(topic, partition)?;
        let consumers = log.consumers.lock();
        for token in consumers.values() {
            token.cancel();
        }
        tracing::warn!(topic, partition, severed = consumers.len(), "Severed consumers");
        Ok(consumers.len())
    }

    /// Snapshot of the retained records of one partition
    pub fn records(&self, topic: &str, partition: usize) -> Result<Vec<BrokerRecord>, BrokerError> {
        let log = self.topic(topic)?.partition(topic, partition)?;
        let state = log.log.lock();
        Ok(state.records.iter().cloned().collect())
    }

    #[must_use]
    pub fn open_producers(&self) -> usize {
        self.state.open_producers.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn open_consumers(&self) -> usize {
        self.state.open_consumers.load(Ordering::SeqCst)
    }

    /// Publish attempts seen so far, including rejected ones
    #[must_use]
    pub fn publish_attempts(&self) -> u64 {
        self.state.publish_attempts.load(Ordering::SeqCst)
    }

    fn topic(&self, topic: &str) -> Result<Arc<TopicState>, BrokerError> {
        self.state
            .topics
            .read()
            .get(topic)
            .cloned()
            .ok_or_else(|| BrokerError::UnknownTopic(topic.to_string()))
    }

    fn authenticate(&self, credentials: Option<&BrokerCredentials>) -> Result<(), BrokerError> {
        match (&*self.state.required_credentials.read(), credentials) {
            (None, _) => Ok(()),
            (Some(required), Some(given))
                if required.username == given.username && required.password == given.password =>
            {
                Ok(())
            }
            (Some(_), Some(given)) => Err(BrokerError::Authentication(format!(
                "invalid credentials for user {}",
                given.username
            ))),
            (Some(_), None) => Err(BrokerError::Authentication(
                "credentials required".to_string(),
            )),
        }
    }

    fn check_metadata(&self, topic: &str) -> Result<(), BrokerError> {
        if self.state.faults.fail_metadata.load(Ordering::SeqCst) {
            return Err(BrokerError::Metadata {
                topic: topic.to_string(),
                reason: "leader not available".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn partition_count(
        &self,
        topic: &str,
        credentials: Option<&BrokerCredentials>,
    ) -> Result<usize, BrokerError> {
        self.authenticate(credentials)?;
        self.check_metadata(topic)?;
        Ok(self.topic(topic)?.partitions.read().len())
    }

    async fn watch_partitions(
        &self,
        topic: &str,
        credentials: Option<&BrokerCredentials>,
    ) -> Result<watch::Receiver<usize>, BrokerError> {
        self.authenticate(credentials)?;
        self.check_metadata(topic)?;
        Ok(self.topic(topic)?.partition_count.subscribe())
    }

    async fn connect_producer(
        &self,
        topic: &str,
        partition: usize,
        credentials: Option<&BrokerCredentials>,
    ) -> Result<Box<dyn ProducerConnection>, BrokerError> {
        self.authenticate(credentials)?;
        let log = self.topic(topic)?.partition(topic, partition)?;
        self.state.open_producers.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryProducer {
            state: Arc::clone(&self.state),
            log,
            closed: false,
        }))
    }

    async fn connect_consumer(
        &self,
        topic: &str,
        partition: usize,
        start: StartOffset,
        credentials: Option<&BrokerCredentials>,
    ) -> Result<Box<dyn ConsumerConnection>, BrokerError> {
        self.authenticate(credentials)?;
        let log = self.topic(topic)?.partition(topic, partition)?;

        let id = self.state.next_consumer_id.fetch_add(1, Ordering::SeqCst);
        let severed = CancellationToken::new();
        log.consumers.lock().insert(id, severed.clone());
        self.state.open_consumers.fetch_add(1, Ordering::SeqCst);

        let next_offset = match start {
            StartOffset::Earliest => log.start_offset(),
            StartOffset::Latest => log.end_offset(),
        };
        let watermark = log.high_watermark.subscribe();

        Ok(Box::new(MemoryConsumer {
            state: Arc::clone(&self.state),
            log,
            id,
            next_offset,
            watermark,
            severed,
            closed: false,
        }))
    }
}

// ============================================================================
// Connections
// ============================================================================

struct MemoryProducer {
    state: Arc<BrokerState>,
    log: Arc<PartitionLog>,
    closed: bool,
}

impl MemoryProducer {
    fn release(&mut self) {
        if !self.closed {
            self.closed = true;
            self.state.open_producers.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl ProducerConnection for MemoryProducer {
    async fn send(&mut self, key: &[u8], value: &[u8]) -> Result<u64, BrokerError> {
        if self.closed {
            return Err(BrokerError::Closed);
        }
        self.state.publish_attempts.fetch_add(1, Ordering::SeqCst);

        let faults = &self.state.faults;
        if faults.reject_all.load(Ordering::SeqCst) {
            return Err(BrokerError::Rejected("broker refusing writes".to_string()));
        }
        let rejected = faults
            .reject_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if rejected {
            return Err(BrokerError::Rejected("not enough replicas".to_string()));
        }

        Ok(self.log.append(key, value))
    }

    async fn close(&mut self) {
        self.release();
    }
}

impl Drop for MemoryProducer {
    fn drop(&mut self) {
        self.release();
    }
}

struct MemoryConsumer {
    state: Arc<BrokerState>,
    log: Arc<PartitionLog>,
    id: u64,
    next_offset: u64,
    watermark: watch::Receiver<u64>,
    severed: CancellationToken,
    closed: bool,
}

impl MemoryConsumer {
    fn release(&mut self) {
        if !self.closed {
            self.closed = true;
            self.log.consumers.lock().remove(&self.id);
            self.state.open_consumers.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn dropped(&self) -> BrokerError {
        BrokerError::Disconnected(format!("partition {} connection severed", self.log.index))
    }
}

#[async_trait]
impl ConsumerConnection for MemoryConsumer {
    async fn next(&mut self) -> Result<BrokerRecord, BrokerError> {
        loop {
            if self.closed {
                return Err(BrokerError::Closed);
            }
            if self.severed.is_cancelled() {
                return Err(self.dropped());
            }

            // Mark the current watermark as seen before reading so an append
            // racing with the read still wakes the wait below.
            let _ = self.watermark.borrow_and_update();
            if let Some(record) = self.log.read_at(&mut self.next_offset) {
                return Ok(record);
            }

            let lost = tokio::select! {
                _ = self.severed.cancelled() => true,
                changed = self.watermark.changed() => changed.is_err(),
            };
            if lost {
                return Err(self.dropped());
            }
        }
    }

    async fn close(&mut self) {
        self.release();
    }
}

impl Drop for MemoryConsumer {
    fn drop(&mut self) {
        self.release();
    }
}
