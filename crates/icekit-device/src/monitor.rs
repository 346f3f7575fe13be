//! Objective monitors: bus subscriptions serviced by the event loop.
//!
//! A [`Subscription`] owns a [`DataReader`] and keeps a handler for its read
//! condition registered with an [`EventLoop`] between `register` and
//! `unregister`. The monitors bind a subscription to a device-side callback
//! held weakly, so a monitor never keeps its device alive.
//!
//! | Monitor | Topic | Valid sample | Not-alive sample |
//! |---|---|---|---|
//! | [`AlarmLimitObjectiveMonitor`] | `GlobalAlarmLimitObjective` | `set_alarm_limit` | `unset_alarm_limit` |
//! | [`GlobalSimulationObjectiveMonitor`] | `GlobalSimulationObjective` | `simulated_numeric` | ignored |

use std::sync::{Arc, Weak};

use icekit_kernel::EventLoop;
use icekit_middleware::{Condition, DataReader, DomainBus, Sample};
use icekit_types::{
    DriverError, GlobalAlarmLimitObjective, GlobalSimulationObjective, LimitType, TopicType,
};
use parking_lot::Mutex;
use tracing::{debug, warn};

/// Applies alarm-limit objectives to a device.
pub trait AlarmLimitHandler: Send + Sync {
    fn set_alarm_limit(&self, objective: &GlobalAlarmLimitObjective) -> Result<(), DriverError>;

    fn unset_alarm_limit(&self, metric_id: &str, limit_type: LimitType) -> Result<(), DriverError>;
}

/// Receives simulation drive values.
pub trait SimulationListener: Send + Sync {
    fn simulated_numeric(&self, objective: &GlobalSimulationObjective);
}

// ────────────────────────────────────────────────────────────────────────────
// Subscription
// ────────────────────────────────────────────────────────────────────────────

type SampleCallback<T> = Arc<dyn Fn(Sample<T>) + Send + Sync>;

struct Registered {
    event_loop: EventLoop,
    condition: Condition,
}

/// A reader whose samples are delivered on an event loop's service thread.
pub struct Subscription<T> {
    callback: SampleCallback<T>,
    filter: Option<Arc<dyn Fn(&T) -> bool + Send + Sync>>,
    registered: Mutex<Option<Registered>>,
}

impl<T: TopicType> Subscription<T> {
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(Sample<T>) + Send + Sync + 'static,
    {
        Self {
            callback: Arc::new(callback),
            filter: None,
            registered: Mutex::new(None),
        }
    }

    /// Only deliver samples whose data passes `filter`.
    pub fn with_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }

    pub fn is_registered(&self) -> bool {
        self.registered.lock().is_some()
    }

    /// Create the reader and add its handler. A second call while registered
    /// does nothing.
    pub fn register(&self, bus: &DomainBus, event_loop: &EventLoop) {
        if self.is_registered() {
            return;
        }
        let reader: Arc<DataReader<T>> = Arc::new(match &self.filter {
            Some(filter) => {
                let filter = Arc::clone(filter);
                bus.filtered_reader::<T, _>(move |data| filter(data))
            }
            None => bus.reader::<T>(),
        });
        let condition = reader.read_condition().clone();
        let callback = Arc::clone(&self.callback);
        event_loop.add_handler(&condition, move |_: &Condition| {
            for sample in reader.take() {
                callback(sample);
            }
        });
        debug!(topic = T::TOPIC, "subscription registered");
        *self.registered.lock() = Some(Registered {
            event_loop: event_loop.clone(),
            condition,
        });
    }

    /// Remove the handler; the reader is dropped with it.
    pub fn unregister(&self) {
        let registered = self.registered.lock().take();
        if let Some(registered) = registered {
            registered.event_loop.remove_handler(&registered.condition);
            debug!(topic = T::TOPIC, "subscription unregistered");
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Monitors
// ────────────────────────────────────────────────────────────────────────────

/// Feeds [`GlobalAlarmLimitObjective`]s to an [`AlarmLimitHandler`].
pub struct AlarmLimitObjectiveMonitor {
    subscription: Subscription<GlobalAlarmLimitObjective>,
}

impl AlarmLimitObjectiveMonitor {
    pub fn new(handler: Weak<dyn AlarmLimitHandler>) -> Self {
        let subscription = Subscription::new(move |sample: Sample<GlobalAlarmLimitObjective>| {
            let Some(handler) = handler.upgrade() else {
                return;
            };
            let result = if sample.is_valid_alive() {
                handler.set_alarm_limit(&sample.data)
            } else if !sample.info.instance_alive {
                handler.unset_alarm_limit(&sample.data.metric_id, sample.data.limit_type)
            } else {
                Ok(())
            };
            if let Err(e) = result {
                warn!(metric_id = %sample.data.metric_id, limit_type = %sample.data.limit_type, error = %e, "unable to apply alarm limit objective");
            }
        });
        Self { subscription }
    }

    pub fn register(&self, bus: &DomainBus, event_loop: &EventLoop) {
        self.subscription.register(bus, event_loop);
    }

    pub fn unregister(&self) {
        self.subscription.unregister();
    }

    pub fn is_registered(&self) -> bool {
        self.subscription.is_registered()
    }
}

/// Feeds valid [`GlobalSimulationObjective`]s to a [`SimulationListener`].
pub struct GlobalSimulationObjectiveMonitor {
    subscription: Subscription<GlobalSimulationObjective>,
}

impl GlobalSimulationObjectiveMonitor {
    pub fn new(listener: Weak<dyn SimulationListener>) -> Self {
        let subscription = Subscription::new(move |sample: Sample<GlobalSimulationObjective>| {
            if !sample.info.valid {
                return;
            }
            if let Some(listener) = listener.upgrade() {
                listener.simulated_numeric(&sample.data);
            }
        });
        Self { subscription }
    }

    pub fn register(&self, bus: &DomainBus, event_loop: &EventLoop) {
        self.subscription.register(bus, event_loop);
    }

    pub fn unregister(&self) {
        self.subscription.unregister();
    }

    pub fn is_registered(&self) -> bool {
        self.subscription.is_registered()
    }
}
