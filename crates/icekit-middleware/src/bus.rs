//! In-process, typed, topic-based interconnect bus.
//!
//! [`DomainBus`] keeps one instance table per topic and fans every write out
//! to the topic's readers. Each [`DataReader`] owns a bounded queue and a
//! read [`Condition`] that stays triggered while unread samples exist, so it
//! can be attached to a [`WaitSet`][crate::condition::WaitSet] and serviced
//! by an event loop.
//!
//! # Instance lifecycle
//!
//! | Call | Readers observe |
//! |---|---|
//! | `register_instance` | nothing |
//! | `write` | valid, alive sample (`view_new` on first sight) |
//! | `dispose` | invalid, not-alive sample carrying the key data |
//! | `unregister_instance` | invalid, not-alive sample carrying the key data |
//!
//! Records stay typed in memory; there is no wire format. At `TRACE` level
//! every write is logged as JSON.

use std::any::{Any, TypeId};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use chrono::Utc;
use icekit_types::{DriverError, InstanceHandle, Time, TopicType};
use parking_lot::Mutex;
use tracing::{Level, debug, trace, warn};

use crate::adapter::{InstanceWriter, Sample, SampleInfo};
use crate::condition::Condition;

/// Default reader queue depth before the oldest samples are dropped.
const DEFAULT_READER_CAPACITY: usize = 256;

/// Bus tuning knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusConfig {
    /// Samples buffered per reader; the oldest is dropped when full.
    pub reader_capacity: usize,
    /// Upper bound on live instances per topic. Registration beyond it is
    /// rejected, which is how a resource-limited transport behaves.
    pub max_instances_per_topic: Option<usize>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            reader_capacity: DEFAULT_READER_CAPACITY,
            max_instances_per_topic: None,
        }
    }
}

/// Shared bus handle. Clone it cheaply – all clones share the same topics.
#[derive(Clone)]
pub struct DomainBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    config: BusConfig,
    next_handle: AtomicU64,
    topics: Mutex<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
}

impl DomainBus {
    pub fn new(config: BusConfig) -> Self {
        Self {
            inner: Arc::new(BusInner {
                config,
                next_handle: AtomicU64::new(1),
                topics: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    /// Bus time, used as the presentation time of published samples.
    pub fn current_time(&self) -> Time {
        Time::from_datetime(&Utc::now())
    }

    /// Create a writer for topic `T`.
    pub fn writer<T: TopicType>(&self) -> DomainWriter<T> {
        DomainWriter {
            bus: self.clone(),
            topic: self.topic::<T>(),
        }
    }

    /// Create a reader that receives every sample of topic `T`.
    pub fn reader<T: TopicType>(&self) -> DataReader<T> {
        self.attach_reader(None)
    }

    /// Create a reader that only receives samples whose data passes `filter`.
    /// Not-alive samples are filtered on their key data.
    pub fn filtered_reader<T, F>(&self, filter: F) -> DataReader<T>
    where
        T: TopicType,
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.attach_reader(Some(Box::new(filter)))
    }

    /// Current data of every live instance of `T`, in registration order.
    pub fn live_instances<T: TopicType>(&self) -> Vec<T> {
        let topic = self.topic::<T>();
        let state = topic.lock();
        let mut entries: Vec<(&InstanceHandle, &InstanceEntry<T>)> = state.instances.iter().collect();
        entries.sort_by_key(|(handle, _)| **handle);
        entries
            .into_iter()
            .filter(|(_, entry)| entry.alive)
            .map(|(_, entry)| entry.data.clone())
            .collect()
    }

    /// Number of registered instances of `T`.
    pub fn instance_count<T: TopicType>(&self) -> usize {
        self.topic::<T>().lock().instances.len()
    }

    // -----------------------------------------------------------------------
    // Internal helpers
    // -----------------------------------------------------------------------

    fn topic<T: TopicType>(&self) -> Arc<Mutex<TopicState<T>>> {
        let mut topics = self.inner.topics.lock();
        let entry = topics.entry(TypeId::of::<T>()).or_insert_with(|| {
            let fresh: Arc<dyn Any + Send + Sync> = Arc::new(Mutex::new(TopicState::<T>::default()));
            fresh
        });
        match Arc::clone(entry).downcast::<Mutex<TopicState<T>>>() {
            Ok(topic) => topic,
            // Keyed by TypeId, so the stored value always has this type.
            Err(_) => unreachable!("topic table keyed by TypeId"),
        }
    }

    fn attach_reader<T: TopicType>(&self, filter: Option<ContentFilter<T>>) -> DataReader<T> {
        let shared = Arc::new(ReaderShared {
            topic: T::TOPIC,
            capacity: self.inner.config.reader_capacity.max(1),
            queue: Mutex::new(ReaderQueue {
                samples: VecDeque::new(),
                seen: HashSet::new(),
            }),
            read_condition: Condition::new(format!("{} reader", T::TOPIC)),
            filter,
        });
        self.topic::<T>().lock().readers.push(Arc::downgrade(&shared));
        debug!(topic = T::TOPIC, "reader attached");
        DataReader { shared }
    }

    fn next_handle(&self) -> InstanceHandle {
        InstanceHandle(self.inner.next_handle.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for DomainBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Topic state
// ---------------------------------------------------------------------------

struct InstanceEntry<T> {
    key: String,
    data: T,
    alive: bool,
}

struct TopicState<T> {
    instances: HashMap<InstanceHandle, InstanceEntry<T>>,
    by_key: HashMap<String, InstanceHandle>,
    readers: Vec<Weak<ReaderShared<T>>>,
}

impl<T> Default for TopicState<T> {
    fn default() -> Self {
        Self {
            instances: HashMap::new(),
            by_key: HashMap::new(),
            readers: Vec::new(),
        }
    }
}

impl<T: TopicType> TopicState<T> {
    fn deliver(&mut self, key: &str, data: &T, alive: bool) {
        self.readers.retain(|r| r.strong_count() > 0);
        for reader in self.readers.iter().filter_map(Weak::upgrade) {
            reader.push(key, data, alive);
        }
    }
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

/// [`InstanceWriter`] for topic `T` on a [`DomainBus`].
pub struct DomainWriter<T> {
    bus: DomainBus,
    topic: Arc<Mutex<TopicState<T>>>,
}

impl<T: TopicType> DomainWriter<T> {
    fn retire(&self, handle: InstanceHandle, unregister: bool) {
        let mut state = self.topic.lock();
        let Some(entry) = state.instances.get_mut(&handle) else {
            warn!(topic = T::TOPIC, handle = %handle, "unknown instance handle");
            return;
        };
        let was_alive = entry.alive;
        entry.alive = false;
        let key = entry.key.clone();
        let data = entry.data.clone();
        if unregister {
            state.instances.remove(&handle);
            state.by_key.remove(&key);
        }
        if was_alive {
            state.deliver(&key, &data, false);
        }
    }
}

impl<T: TopicType> InstanceWriter<T> for DomainWriter<T> {
    fn register_instance(&self, data: &T) -> Option<InstanceHandle> {
        let key = data.instance_key();
        let mut state = self.topic.lock();
        if let Some(handle) = state.by_key.get(&key) {
            return Some(*handle);
        }
        if let Some(limit) = self.bus.config().max_instances_per_topic {
            if state.instances.len() >= limit {
                warn!(topic = T::TOPIC, key = %key, limit, "instance limit reached, registration rejected");
                return None;
            }
        }
        let handle = self.bus.next_handle();
        state.by_key.insert(key.clone(), handle);
        state.instances.insert(
            handle,
            InstanceEntry {
                key,
                data: data.clone(),
                alive: false,
            },
        );
        Some(handle)
    }

    fn unregister_instance(&self, handle: InstanceHandle) {
        self.retire(handle, true);
    }

    fn write(&self, data: &T, handle: InstanceHandle) -> Result<(), DriverError> {
        let key = data.instance_key();
        let mut state = self.topic.lock();
        let Some(entry) = state.instances.get_mut(&handle) else {
            return Err(DriverError::Bus(format!(
                "write to unregistered {} instance {handle}",
                T::TOPIC
            )));
        };
        if entry.key != key {
            return Err(DriverError::Bus(format!(
                "{} instance {handle} is registered for key {}, not {key}",
                T::TOPIC, entry.key
            )));
        }
        entry.data = data.clone();
        entry.alive = true;
        if tracing::enabled!(Level::TRACE) {
            match serde_json::to_string(data) {
                Ok(json) => trace!(topic = T::TOPIC, handle = %handle, payload = %json, "write"),
                Err(e) => trace!(topic = T::TOPIC, handle = %handle, error = %e, "write (unserializable)"),
            }
        }
        state.deliver(&key, data, true);
        Ok(())
    }

    fn dispose(&self, handle: InstanceHandle) {
        self.retire(handle, false);
    }
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

type ContentFilter<T> = Box<dyn Fn(&T) -> bool + Send + Sync>;

struct ReaderQueue<T> {
    samples: VecDeque<Sample<T>>,
    seen: HashSet<String>,
}

struct ReaderShared<T> {
    topic: &'static str,
    capacity: usize,
    queue: Mutex<ReaderQueue<T>>,
    read_condition: Condition,
    filter: Option<ContentFilter<T>>,
}

impl<T: TopicType> ReaderShared<T> {
    fn push(&self, key: &str, data: &T, alive: bool) {
        if let Some(filter) = &self.filter {
            if !filter(data) {
                return;
            }
        }
        let mut queue = self.queue.lock();
        let view_new = if alive {
            queue.seen.insert(key.to_string())
        } else {
            queue.seen.remove(key);
            false
        };
        if queue.samples.len() >= self.capacity {
            queue.samples.pop_front();
            warn!(topic = self.topic, capacity = self.capacity, "reader queue full, dropped oldest sample");
        }
        queue.samples.push_back(Sample {
            info: SampleInfo {
                valid: alive,
                view_new,
                instance_alive: alive,
            },
            data: data.clone(),
        });
        self.read_condition.set_trigger_value(true);
    }
}

/// Subscribe side of topic `T`.
pub struct DataReader<T> {
    shared: Arc<ReaderShared<T>>,
}

impl<T: TopicType> DataReader<T> {
    /// Condition that stays triggered while unread samples exist.
    pub fn read_condition(&self) -> &Condition {
        &self.shared.read_condition
    }

    /// Remove and return every queued sample, oldest first.
    pub fn take(&self) -> Vec<Sample<T>> {
        let mut queue = self.shared.queue.lock();
        let samples: Vec<Sample<T>> = queue.samples.drain(..).collect();
        self.shared.read_condition.set_trigger_value(false);
        samples
    }

    pub fn topic(&self) -> &'static str {
        self.shared.topic
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use icekit_types::{DeviceAlertCondition, Numeric};

    fn numeric(udi: &str, metric: &str, value: f32) -> Numeric {
        Numeric {
            unique_device_identifier: udi.to_string(),
            metric_id: metric.to_string(),
            value,
            ..Default::default()
        }
    }

    #[test]
    fn register_is_idempotent_per_key() {
        let bus = DomainBus::default();
        let writer = bus.writer::<Numeric>();
        let a = writer.register_instance(&numeric("udi", "hr", 0.0));
        let b = writer.register_instance(&numeric("udi", "hr", 42.0));
        let c = writer.register_instance(&numeric("udi", "spo2", 0.0));
        assert!(a.is_some());
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(bus.instance_count::<Numeric>(), 2);
    }

    #[test]
    fn reader_sees_alive_then_not_alive() -> Result<(), Box<dyn std::error::Error>> {
        let bus = DomainBus::default();
        let reader = bus.reader::<Numeric>();
        let writer = bus.writer::<Numeric>();

        let data = numeric("udi", "hr", 60.0);
        let handle = writer.register_instance(&data).ok_or("rejected")?;
        assert!(!reader.read_condition().trigger_value(), "register alone delivers nothing");

        writer.write(&data, handle)?;
        writer.write(&numeric("udi", "hr", 61.0), handle)?;
        assert!(reader.read_condition().trigger_value());

        let samples = reader.take();
        assert_eq!(samples.len(), 2);
        assert!(samples[0].info.view_new);
        assert!(!samples[1].info.view_new);
        assert_eq!(samples[1].data.value, 61.0);
        assert!(!reader.read_condition().trigger_value());

        writer.unregister_instance(handle);
        let samples = reader.take();
        assert_eq!(samples.len(), 1);
        assert!(!samples[0].info.valid);
        assert!(!samples[0].info.instance_alive);
        assert_eq!(samples[0].data.metric_id, "hr");
        assert_eq!(bus.instance_count::<Numeric>(), 0);
        Ok(())
    }

    #[test]
    fn filtered_reader_skips_other_devices() -> Result<(), Box<dyn std::error::Error>> {
        let bus = DomainBus::default();
        let mine = bus.filtered_reader::<Numeric, _>(|n| n.unique_device_identifier == "mine");
        let writer = bus.writer::<Numeric>();
        for udi in ["mine", "other"] {
            let data = numeric(udi, "hr", 1.0);
            let handle = writer.register_instance(&data).ok_or("rejected")?;
            writer.write(&data, handle)?;
        }
        let samples = mine.take();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].data.unique_device_identifier, "mine");
        Ok(())
    }

    #[test]
    fn instance_limit_rejects_registration() {
        let bus = DomainBus::new(BusConfig {
            max_instances_per_topic: Some(1),
            ..Default::default()
        });
        let writer = bus.writer::<Numeric>();
        assert!(writer.register_instance(&numeric("udi", "a", 0.0)).is_some());
        assert!(writer.register_instance(&numeric("udi", "b", 0.0)).is_none());
    }

    #[test]
    fn write_with_wrong_key_is_rejected() -> Result<(), Box<dyn std::error::Error>> {
        let bus = DomainBus::default();
        let writer = bus.writer::<Numeric>();
        let handle = writer.register_instance(&numeric("udi", "a", 0.0)).ok_or("rejected")?;
        assert!(writer.write(&numeric("udi", "b", 0.0), handle).is_err());
        writer.unregister_instance(handle);
        assert!(writer.write(&numeric("udi", "a", 0.0), handle).is_err());
        Ok(())
    }

    #[test]
    fn full_reader_queue_drops_oldest() -> Result<(), Box<dyn std::error::Error>> {
        let bus = DomainBus::new(BusConfig {
            reader_capacity: 2,
            ..Default::default()
        });
        let reader = bus.reader::<Numeric>();
        let writer = bus.writer::<Numeric>();
        let handle = writer.register_instance(&numeric("udi", "hr", 0.0)).ok_or("rejected")?;
        for v in [1.0, 2.0, 3.0] {
            writer.write(&numeric("udi", "hr", v), handle)?;
        }
        let values: Vec<f32> = reader.take().into_iter().map(|s| s.data.value).collect();
        assert_eq!(values, vec![2.0, 3.0]);
        Ok(())
    }

    #[test]
    fn dispose_keeps_registration() -> Result<(), Box<dyn std::error::Error>> {
        let bus = DomainBus::default();
        let writer = bus.writer::<DeviceAlertCondition>();
        let data = DeviceAlertCondition {
            unique_device_identifier: "udi".to_string(),
            alert_state: "Normal".to_string(),
        };
        let handle = writer.register_instance(&data).ok_or("rejected")?;
        writer.write(&data, handle)?;
        writer.dispose(handle);
        assert_eq!(bus.instance_count::<DeviceAlertCondition>(), 1);
        assert!(bus.live_instances::<DeviceAlertCondition>().is_empty());
        writer.write(&data, handle)?;
        assert_eq!(bus.live_instances::<DeviceAlertCondition>().len(), 1);
        Ok(())
    }
}
