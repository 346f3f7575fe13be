//! Waitable conditions and wait sets.
//!
//! A [`Condition`] is a boolean trigger that any number of [`WaitSet`]s can
//! watch. [`WaitSet::wait`] blocks until at least one attached condition is
//! triggered (or the timeout elapses) and returns the triggered ones.
//!
//! | Type | Triggered by |
//! |---|---|
//! | [`Condition`] | whoever owns it, e.g. a [`DataReader`][crate::bus::DataReader] while unread samples exist |
//! | [`GuardCondition`] | application code, explicitly |
//!
//! Triggering never loses a wakeup: a wait set checks trigger values while
//! holding its own lock, and a condition notifies through that same lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

static NEXT_CONDITION_ID: AtomicU64 = AtomicU64::new(1);

// ────────────────────────────────────────────────────────────────────────────
// Condition
// ────────────────────────────────────────────────────────────────────────────

struct ConditionInner {
    id: u64,
    name: String,
    triggered: Mutex<bool>,
    watchers: Mutex<Vec<Weak<WaitSetShared>>>,
}

/// A shareable boolean trigger. Clones refer to the same condition.
#[derive(Clone)]
pub struct Condition {
    inner: Arc<ConditionInner>,
}

impl Condition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(ConditionInner {
                id: NEXT_CONDITION_ID.fetch_add(1, Ordering::Relaxed),
                name: name.into(),
                triggered: Mutex::new(false),
                watchers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Process-unique id; equality and hashing use it.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn trigger_value(&self) -> bool {
        *self.inner.triggered.lock()
    }

    /// Set the trigger value; raising it wakes every wait set watching this
    /// condition.
    pub fn set_trigger_value(&self, value: bool) {
        *self.inner.triggered.lock() = value;
        if value {
            self.notify_watchers();
        }
    }

    fn notify_watchers(&self) {
        let watchers: Vec<Arc<WaitSetShared>> = {
            let mut watchers = self.inner.watchers.lock();
            watchers.retain(|w| w.strong_count() > 0);
            watchers.iter().filter_map(Weak::upgrade).collect()
        };
        for shared in watchers {
            let _guard = shared.attached.lock();
            shared.signal.notify_all();
        }
    }

    fn add_watcher(&self, shared: &Arc<WaitSetShared>) {
        self.inner.watchers.lock().push(Arc::downgrade(shared));
    }

    fn remove_watcher(&self, shared: &Arc<WaitSetShared>) {
        self.inner
            .watchers
            .lock()
            .retain(|w| w.strong_count() > 0 && !std::ptr::eq(w.as_ptr(), Arc::as_ptr(shared)));
    }
}

impl PartialEq for Condition {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Condition {}

impl std::hash::Hash for Condition {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl std::fmt::Debug for Condition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Condition")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("triggered", &self.trigger_value())
            .finish()
    }
}

/// A condition raised and lowered explicitly by application code.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct GuardCondition(Condition);

impl GuardCondition {
    pub fn new(name: impl Into<String>) -> Self {
        Self(Condition::new(name))
    }

    pub fn trigger(&self) {
        self.0.set_trigger_value(true);
    }

    pub fn reset(&self) {
        self.0.set_trigger_value(false);
    }

    pub fn condition(&self) -> &Condition {
        &self.0
    }
}

// ────────────────────────────────────────────────────────────────────────────
// WaitSet
// ────────────────────────────────────────────────────────────────────────────

struct WaitSetShared {
    attached: Mutex<Vec<Condition>>,
    signal: Condvar,
}

/// A set of conditions a single thread can block on.
pub struct WaitSet {
    shared: Arc<WaitSetShared>,
}

impl WaitSet {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(WaitSetShared {
                attached: Mutex::new(Vec::new()),
                signal: Condvar::new(),
            }),
        }
    }

    /// Attach `condition`. Attaching the same condition twice is a no-op.
    pub fn attach(&self, condition: &Condition) {
        let mut attached = self.shared.attached.lock();
        if attached.contains(condition) {
            return;
        }
        attached.push(condition.clone());
        condition.add_watcher(&self.shared);
    }

    /// Detach `condition`. Returns `false` if it was not attached.
    pub fn detach(&self, condition: &Condition) -> bool {
        let mut attached = self.shared.attached.lock();
        let before = attached.len();
        attached.retain(|c| c != condition);
        let removed = attached.len() != before;
        if removed {
            condition.remove_watcher(&self.shared);
        }
        removed
    }

    pub fn contains(&self, condition: &Condition) -> bool {
        self.shared.attached.lock().contains(condition)
    }

    pub fn len(&self) -> usize {
        self.shared.attached.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Block until at least one attached condition is triggered, or until
    /// `timeout` elapses (`None` waits forever).
    ///
    /// Returns the triggered conditions; an empty vector means the wait
    /// timed out.
    pub fn wait(&self, timeout: Option<Duration>) -> Vec<Condition> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut attached = self.shared.attached.lock();
        loop {
            let ready: Vec<Condition> = attached
                .iter()
                .filter(|c| c.trigger_value())
                .cloned()
                .collect();
            if !ready.is_empty() {
                return ready;
            }
            match deadline {
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        return Vec::new();
                    }
                    self.shared.signal.wait_until(&mut attached, deadline);
                }
                None => self.shared.signal.wait(&mut attached),
            }
        }
    }
}

impl Default for WaitSet {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for WaitSet {
    fn drop(&mut self) {
        let attached = std::mem::take(&mut *self.shared.attached.lock());
        for condition in attached {
            condition.remove_watcher(&self.shared);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn wait_returns_triggered_conditions_only() {
        let ws = WaitSet::new();
        let a = Condition::new("a");
        let b = Condition::new("b");
        ws.attach(&a);
        ws.attach(&b);
        b.set_trigger_value(true);
        let ready = ws.wait(Some(Duration::from_millis(10)));
        assert_eq!(ready, vec![b.clone()]);
    }

    #[test]
    fn wait_times_out_when_nothing_triggers() {
        let ws = WaitSet::new();
        ws.attach(&Condition::new("idle"));
        let start = Instant::now();
        assert!(ws.wait(Some(Duration::from_millis(50))).is_empty());
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn trigger_from_another_thread_wakes_waiter() {
        let ws = WaitSet::new();
        let guard = GuardCondition::new("wake");
        ws.attach(guard.condition());

        let remote = guard.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            remote.trigger();
        });

        let start = Instant::now();
        let ready = ws.wait(Some(Duration::from_secs(5)));
        handle.join().unwrap();
        assert_eq!(ready.len(), 1);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn detached_condition_is_ignored() {
        let ws = WaitSet::new();
        let c = Condition::new("c");
        ws.attach(&c);
        ws.attach(&c);
        assert_eq!(ws.len(), 1);
        assert!(ws.detach(&c));
        assert!(!ws.detach(&c));
        c.set_trigger_value(true);
        assert!(ws.wait(Some(Duration::from_millis(10))).is_empty());
    }
}
