//! [`EventLoop`] – single-service-thread dispatcher over a set of conditions.
//!
//! Exactly one thread at a time holds the *service thread* role, acquired by
//! [`EventLoop::wait_and_handle`]. The service thread blocks on the loop's
//! [`WaitSet`] and runs the handler of every condition that became ready,
//! one after another. Other threads never touch the condition set or device
//! state directly; they go through four entry points:
//!
//! | Entry point | From the service thread | From any other thread |
//! |---|---|---|
//! | [`add_handler`][EventLoop::add_handler] | applied inline | queued, caller blocks until applied |
//! | [`remove_handler`][EventLoop::remove_handler] | applied inline | queued, caller blocks until applied |
//! | [`do_now`][EventLoop::do_now] | runs inline | queued, caller blocks until it ran |
//! | [`do_later`][EventLoop::do_later] | queued | queued |
//!
//! [`ServiceThread`] owns a thread that keeps calling `wait_and_handle`.

use std::backtrace::Backtrace;
use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use icekit_middleware::{Condition, GuardCondition, WaitSet};
use icekit_types::DriverError;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, warn};

/// Handlers running at least this long are reported.
const SLOW_HANDLER_THRESHOLD: Duration = Duration::from_millis(100);

/// Callback bound to a condition.
pub trait ConditionHandler: Send + Sync {
    fn condition_changed(&self, condition: &Condition);
}

impl<F> ConditionHandler for F
where
    F: Fn(&Condition) + Send + Sync,
{
    fn condition_changed(&self, condition: &Condition) {
        self(condition)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Queued work
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Pending,
    Done,
    Abandoned,
}

/// One-shot completion signal a blocked caller waits on.
struct Completion {
    outcome: Mutex<Outcome>,
    signal: Condvar,
}

impl Completion {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            outcome: Mutex::new(Outcome::Pending),
            signal: Condvar::new(),
        })
    }

    fn finish(&self, outcome: Outcome) {
        let mut current = self.outcome.lock();
        if *current == Outcome::Pending {
            *current = outcome;
        }
        drop(current);
        self.signal.notify_all();
    }

    fn wait(&self) -> Outcome {
        let mut outcome = self.outcome.lock();
        while *outcome == Outcome::Pending {
            self.signal.wait(&mut outcome);
        }
        *outcome
    }
}

/// Marks its completion abandoned if dropped before being finished.
struct CompletionGuard(Option<Arc<Completion>>);

impl CompletionGuard {
    fn done(mut self) {
        if let Some(completion) = self.0.take() {
            completion.finish(Outcome::Done);
        }
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        if let Some(completion) = self.0.take() {
            completion.finish(Outcome::Abandoned);
        }
    }
}

enum MutationKind {
    Add(Arc<dyn ConditionHandler>),
    Remove,
}

struct Mutation {
    condition: Condition,
    kind: MutationKind,
    /// Where the mutation was requested.
    origin: Backtrace,
    completion: CompletionGuard,
}

struct QueuedCallable {
    callable: Box<dyn FnOnce() + Send>,
    completion: CompletionGuard,
}

// ────────────────────────────────────────────────────────────────────────────
// EventLoop
// ────────────────────────────────────────────────────────────────────────────

struct LoopState {
    service_thread: Option<ThreadId>,
    handlers: HashMap<Condition, Arc<dyn ConditionHandler>>,
    mutations: VecDeque<Mutation>,
    callables: VecDeque<QueuedCallable>,
}

struct LoopInner {
    state: Mutex<LoopState>,
    role_released: Condvar,
    wait_set: WaitSet,
    mutate_guard: GuardCondition,
    callable_guard: GuardCondition,
}

/// Cooperative dispatcher. Clone it cheaply – clones share the same loop.
#[derive(Clone)]
pub struct EventLoop {
    inner: Arc<LoopInner>,
}

impl EventLoop {
    pub fn new() -> Self {
        let mutate_guard = GuardCondition::new("event-loop mutate");
        let callable_guard = GuardCondition::new("event-loop callable");
        let wait_set = WaitSet::new();
        wait_set.attach(mutate_guard.condition());
        wait_set.attach(callable_guard.condition());
        Self {
            inner: Arc::new(LoopInner {
                state: Mutex::new(LoopState {
                    service_thread: None,
                    handlers: HashMap::new(),
                    mutations: VecDeque::new(),
                    callables: VecDeque::new(),
                }),
                role_released: Condvar::new(),
                wait_set,
                mutate_guard,
                callable_guard,
            }),
        }
    }

    /// `true` when the calling thread currently holds the service role.
    pub fn is_service_thread(&self) -> bool {
        self.inner.state.lock().service_thread == Some(thread::current().id())
    }

    /// Number of application handlers currently registered.
    pub fn handler_count(&self) -> usize {
        self.inner.state.lock().handlers.len()
    }

    /// Become the service thread, wait up to `timeout` for conditions, and
    /// dispatch the ready ones.
    ///
    /// Returns `Ok(true)` when at least one condition was serviced and
    /// `Ok(false)` when nothing became ready in time. Fails with
    /// [`DriverError::ServiceThreadTimeout`] if another thread kept the role
    /// for the whole timeout (immediately, for a zero timeout).
    pub fn wait_and_handle(&self, timeout: Duration) -> Result<bool, DriverError> {
        let start = Instant::now();
        let me = thread::current().id();
        {
            let mut state = self.inner.state.lock();
            while let Some(holder) = state.service_thread {
                if holder == me {
                    return Err(DriverError::Configuration(
                        "wait_and_handle called from inside a handler".to_string(),
                    ));
                }
                let waited = start.elapsed();
                if timeout.is_zero() || waited >= timeout {
                    return Err(DriverError::ServiceThreadTimeout);
                }
                self.inner.role_released.wait_for(&mut state, timeout - waited);
            }
            state.service_thread = Some(me);
        }
        let _role = RoleRelease(&self.inner);

        let remaining = timeout.saturating_sub(start.elapsed());
        let ready = self.inner.wait_set.wait(Some(remaining));
        if ready.is_empty() {
            return Ok(false);
        }
        for condition in &ready {
            if condition == self.inner.mutate_guard.condition() {
                self.drain_mutations();
            } else if condition == self.inner.callable_guard.condition() {
                self.drain_callables();
            } else {
                self.dispatch(condition);
            }
        }
        Ok(true)
    }

    /// Bind `handler` to `condition` and add the condition to the wait set.
    pub fn add_handler<H>(&self, condition: &Condition, handler: H)
    where
        H: ConditionHandler + 'static,
    {
        self.mutate(condition, MutationKind::Add(Arc::new(handler)));
    }

    /// Remove `condition` and its handler from the wait set.
    pub fn remove_handler(&self, condition: &Condition) {
        self.mutate(condition, MutationKind::Remove);
    }

    /// Queue `callable` for the service thread. Fire and forget.
    pub fn do_later<F>(&self, callable: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.inner.state.lock();
        state.callables.push_back(QueuedCallable {
            callable: Box::new(callable),
            completion: CompletionGuard(None),
        });
        self.inner.callable_guard.trigger();
    }

    /// Run `callable` on the service thread and return its result.
    ///
    /// Runs inline when already on the service thread. Returns `None` when
    /// the callable panicked or was dropped without running.
    pub fn do_now<F, R>(&self, callable: F) -> Option<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.is_service_thread() {
            return Some(callable());
        }
        let slot: Arc<Mutex<Option<R>>> = Arc::new(Mutex::new(None));
        let completion = Completion::new();
        {
            let slot = Arc::clone(&slot);
            let mut state = self.inner.state.lock();
            state.callables.push_back(QueuedCallable {
                callable: Box::new(move || {
                    let result = callable();
                    *slot.lock() = Some(result);
                }),
                completion: CompletionGuard(Some(Arc::clone(&completion))),
            });
            self.inner.callable_guard.trigger();
        }
        match completion.wait() {
            Outcome::Done => slot.lock().take(),
            _ => {
                error!("do_now callable did not complete");
                None
            }
        }
    }

    // -----------------------------------------------------------------------
    // Internal helpers
    // -----------------------------------------------------------------------

    fn mutate(&self, condition: &Condition, kind: MutationKind) {
        let origin = Backtrace::capture();
        if self.is_service_thread() {
            self.apply_mutation(condition, kind, &origin);
            return;
        }
        let completion = Completion::new();
        {
            let mut state = self.inner.state.lock();
            state.mutations.push_back(Mutation {
                condition: condition.clone(),
                kind,
                origin,
                completion: CompletionGuard(Some(Arc::clone(&completion))),
            });
            self.inner.mutate_guard.trigger();
        }
        if completion.wait() != Outcome::Done {
            error!(condition = condition.name(), "condition set mutation was not applied");
        }
    }

    fn apply_mutation(&self, condition: &Condition, kind: MutationKind, origin: &Backtrace) {
        let mut state = self.inner.state.lock();
        match kind {
            MutationKind::Add(handler) => {
                state.handlers.insert(condition.clone(), handler);
                self.inner.wait_set.attach(condition);
                debug!(condition = condition.name(), "handler added");
            }
            MutationKind::Remove => {
                self.inner.wait_set.detach(condition);
                if state.handlers.remove(condition).is_none() {
                    warn!(
                        condition = condition.name(),
                        origin = %origin,
                        "removed a condition that had no handler"
                    );
                }
            }
        }
    }

    fn drain_mutations(&self) {
        let pending: Vec<Mutation> = {
            let mut state = self.inner.state.lock();
            self.inner.mutate_guard.reset();
            state.mutations.drain(..).collect()
        };
        for mutation in pending {
            self.apply_mutation(&mutation.condition, mutation.kind, &mutation.origin);
            mutation.completion.done();
        }
    }

    fn drain_callables(&self) {
        let pending: Vec<QueuedCallable> = {
            let mut state = self.inner.state.lock();
            self.inner.callable_guard.reset();
            state.callables.drain(..).collect()
        };
        for queued in pending {
            let QueuedCallable { callable, completion } = queued;
            match panic::catch_unwind(AssertUnwindSafe(callable)) {
                Ok(()) => completion.done(),
                Err(_) => error!("queued callable panicked"),
            }
        }
    }

    fn dispatch(&self, condition: &Condition) {
        let handler = self.inner.state.lock().handlers.get(condition).cloned();
        let Some(handler) = handler else {
            warn!(
                condition = condition.name(),
                backtrace = %Backtrace::capture(),
                "ready condition has no handler"
            );
            return;
        };
        let start = Instant::now();
        handler.condition_changed(condition);
        let elapsed = start.elapsed();
        if elapsed >= SLOW_HANDLER_THRESHOLD {
            warn!(
                condition = condition.name(),
                elapsed_ms = elapsed.as_millis() as u64,
                "slow condition handler"
            );
        }
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

/// Releases the service role and wakes waiting threads, however
/// `wait_and_handle` exits.
struct RoleRelease<'a>(&'a LoopInner);

impl Drop for RoleRelease<'_> {
    fn drop(&mut self) {
        self.0.state.lock().service_thread = None;
        self.0.role_released.notify_all();
    }
}

// ────────────────────────────────────────────────────────────────────────────
// ServiceThread
// ────────────────────────────────────────────────────────────────────────────

/// A dedicated thread that services an [`EventLoop`] until stopped.
pub struct ServiceThread {
    event_loop: EventLoop,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ServiceThread {
    /// Spawn a thread calling `wait_and_handle(period)` in a loop.
    pub fn spawn(event_loop: EventLoop, period: Duration) -> Result<Self, DriverError> {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let thread_loop = event_loop.clone();
        let handle = thread::Builder::new()
            .name("event-loop".to_string())
            .spawn(move || {
                while !thread_stop.load(Ordering::Acquire) {
                    match thread_loop.wait_and_handle(period) {
                        Ok(_) => {}
                        Err(DriverError::ServiceThreadTimeout) => {
                            debug!("service role busy, retrying");
                        }
                        Err(e) => {
                            error!(error = %e, "event loop service failed");
                            break;
                        }
                    }
                }
                debug!("service thread exiting");
            })?;
        Ok(Self {
            event_loop,
            stop,
            handle: Some(handle),
        })
    }

    /// Stop servicing and join the thread. Idempotent.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.event_loop.do_later(|| {});
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("service thread panicked");
            }
        }
    }
}

impl Drop for ServiceThread {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn times_out_with_nothing_ready() -> Result<(), DriverError> {
        let el = EventLoop::new();
        assert!(!el.wait_and_handle(Duration::from_millis(20))?);
        Ok(())
    }

    #[test]
    fn dispatches_ready_condition_to_handler() -> Result<(), Box<dyn std::error::Error>> {
        let el = EventLoop::new();
        let _svc = ServiceThread::spawn(el.clone(), Duration::from_millis(20))?;

        let guard = GuardCondition::new("work");
        let hits = Arc::new(AtomicUsize::new(0));
        let handler_hits = Arc::clone(&hits);
        let handler_guard = guard.clone();
        el.add_handler(guard.condition(), move |_: &Condition| {
            handler_guard.reset();
            handler_hits.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(el.handler_count(), 1);

        guard.trigger();
        let deadline = Instant::now() + Duration::from_secs(2);
        while hits.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        el.remove_handler(guard.condition());
        assert_eq!(el.handler_count(), 0);
        Ok(())
    }

    #[test]
    fn add_handler_from_other_thread_blocks_until_drained() -> Result<(), Box<dyn std::error::Error>> {
        let el = EventLoop::new();
        let guard = GuardCondition::new("late");

        let adder_loop = el.clone();
        let adder_cond = guard.condition().clone();
        let adder = thread::spawn(move || {
            adder_loop.add_handler(&adder_cond, |_: &Condition| {});
        });

        thread::sleep(Duration::from_millis(50));
        assert!(!adder.is_finished(), "caller returns only after the drain");
        assert_eq!(el.handler_count(), 0);

        assert!(el.wait_and_handle(Duration::from_millis(500))?);
        adder.join().unwrap();
        assert_eq!(el.handler_count(), 1);
        Ok(())
    }

    #[test]
    fn zero_timeout_fails_while_role_is_held() -> Result<(), Box<dyn std::error::Error>> {
        let el = EventLoop::new();
        let holder = el.clone();
        let busy = thread::spawn(move || holder.wait_and_handle(Duration::from_millis(300)));
        thread::sleep(Duration::from_millis(50));
        assert!(matches!(
            el.wait_and_handle(Duration::ZERO),
            Err(DriverError::ServiceThreadTimeout)
        ));
        // A waiting caller gets the role once it is released.
        assert!(!el.wait_and_handle(Duration::from_millis(600))?);
        assert!(!busy.join().unwrap()?);
        Ok(())
    }

    #[test]
    fn do_now_returns_result_and_runs_on_service_thread() -> Result<(), Box<dyn std::error::Error>> {
        let el = EventLoop::new();
        let _svc = ServiceThread::spawn(el.clone(), Duration::from_millis(20))?;
        let inner = el.clone();
        let on_service = el.do_now(move || inner.is_service_thread());
        assert_eq!(on_service, Some(true));
        assert_eq!(el.do_now(|| 6 * 7), Some(42));
        Ok(())
    }

    #[test]
    fn do_now_survives_panicking_callable() -> Result<(), Box<dyn std::error::Error>> {
        let el = EventLoop::new();
        let _svc = ServiceThread::spawn(el.clone(), Duration::from_millis(20))?;
        let result: Option<()> = el.do_now(|| panic!("boom"));
        assert!(result.is_none());
        assert_eq!(el.do_now(|| 1), Some(1), "loop keeps serving");
        Ok(())
    }

    #[test]
    fn do_later_runs_in_order() -> Result<(), Box<dyn std::error::Error>> {
        let el = EventLoop::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = Arc::clone(&order);
            el.do_later(move || order.lock().push(i));
        }
        assert!(order.lock().is_empty());
        assert!(el.wait_and_handle(Duration::from_millis(100))?);
        assert_eq!(*order.lock(), vec![0, 1, 2]);
        Ok(())
    }

    #[test]
    fn handler_may_add_handlers_inline() -> Result<(), Box<dyn std::error::Error>> {
        let el = EventLoop::new();
        let outer = GuardCondition::new("outer");
        let inner = GuardCondition::new("inner");
        let nested_loop = el.clone();
        let inner_cond = inner.condition().clone();
        let outer_guard = outer.clone();
        el.do_later({
            let el = el.clone();
            let outer_cond = outer.condition().clone();
            move || {
                el.add_handler(&outer_cond, move |_: &Condition| {
                    outer_guard.reset();
                    nested_loop.add_handler(&inner_cond, |_: &Condition| {});
                });
            }
        });
        assert!(el.wait_and_handle(Duration::from_millis(100))?);
        outer.trigger();
        assert!(el.wait_and_handle(Duration::from_millis(100))?);
        assert_eq!(el.handler_count(), 2);
        Ok(())
    }
}
