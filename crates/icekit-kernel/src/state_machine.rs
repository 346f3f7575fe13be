//! [`StateMachine`] – a state value guarded by a fixed legal-transition table.
//!
//! Transitions either happen immediately ([`StateMachine::transition_if_legal`])
//! or after blocking until the current state makes them legal
//! ([`StateMachine::transition_when_legal`]). Every successful transition is
//! reported to the [`TransitionObserver`] given at construction, after the
//! new state is already visible and in the order the transitions happened.
//!
//! # Example
//!
//! ```
//! use icekit_kernel::state_machine::StateMachine;
//!
//! #[derive(Debug, Clone, Copy, PartialEq, Eq)]
//! enum Door { Open, Closed }
//!
//! let sm = StateMachine::new("door", &[(Door::Open, Door::Closed)], Door::Open);
//! assert!(sm.transition_if_legal(Door::Closed, "shut"));
//! assert!(!sm.transition_if_legal(Door::Open, "no way back"));
//! assert_eq!(sm.state(), Door::Closed);
//! ```

use std::backtrace::Backtrace;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::{Duration, Instant};

use icekit_types::DriverError;
use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{Level, debug, warn};

// ────────────────────────────────────────────────────────────────────────────
// Observer and policy
// ────────────────────────────────────────────────────────────────────────────

/// Receives every successful transition.
///
/// `emit` may read the machine it observes but must not transition it.
pub trait TransitionObserver<S>: Send + Sync {
    fn emit(&self, new_state: S, old_state: S, note: &str);
}

impl<S, F> TransitionObserver<S> for F
where
    F: Fn(S, S, &str) + Send + Sync,
{
    fn emit(&self, new_state: S, old_state: S, note: &str) {
        self(new_state, old_state, note)
    }
}

/// Timing behaviour of the blocking operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionPolicy {
    /// Used by `transition_when_legal` when the caller passes no timeout.
    pub transition_timeout: Duration,
    /// A timed-out `transition_when_legal` is an error rather than `Ok(None)`.
    pub timeout_is_fatal: bool,
    /// Granularity of blocking waits.
    pub poll_interval: Duration,
}

impl Default for TransitionPolicy {
    fn default() -> Self {
        Self {
            transition_timeout: Duration::from_millis(2000),
            timeout_is_fatal: true,
            poll_interval: Duration::from_millis(10),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// StateMachine
// ────────────────────────────────────────────────────────────────────────────

struct Current<S> {
    state: S,
    note: String,
    /// Sequence number handed to the next successful transition.
    next_seq: u64,
}

/// State container with legal-transition checking and blocking waits.
pub struct StateMachine<S> {
    name: String,
    table: Vec<(S, S)>,
    current: Mutex<Current<S>>,
    changed: Condvar,
    /// Sequence number whose emit may run next.
    emit_turn: Mutex<u64>,
    emit_done: Condvar,
    observer: Option<Arc<dyn TransitionObserver<S>>>,
    policy: TransitionPolicy,
}

impl<S> StateMachine<S>
where
    S: Copy + Eq + Debug + Send + Sync + 'static,
{
    /// Create a machine in `initial` with no observer and the default policy.
    pub fn new(name: impl Into<String>, table: &[(S, S)], initial: S) -> Self {
        Self {
            name: name.into(),
            table: table.to_vec(),
            current: Mutex::new(Current {
                state: initial,
                note: String::new(),
                next_seq: 0,
            }),
            changed: Condvar::new(),
            emit_turn: Mutex::new(0),
            emit_done: Condvar::new(),
            observer: None,
            policy: TransitionPolicy::default(),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn TransitionObserver<S>>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn with_policy(mut self, policy: TransitionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> &TransitionPolicy {
        &self.policy
    }

    pub fn state(&self) -> S {
        self.current.lock().state
    }

    pub fn transition_note(&self) -> String {
        self.current.lock().note.clone()
    }

    /// `true` iff moving from the current state to `candidate` is in the table.
    pub fn legal_transition(&self, candidate: S) -> bool {
        self.is_legal(self.current.lock().state, candidate)
    }

    /// Transition now if legal. Returns `false` (and logs at debug) otherwise.
    pub fn transition_if_legal(&self, new_state: S, note: &str) -> bool {
        let guard = self.current.lock();
        if !self.is_legal(guard.state, new_state) {
            if tracing::enabled!(Level::DEBUG) {
                debug!(
                    machine = %self.name,
                    from = ?guard.state,
                    to = ?new_state,
                    backtrace = %Backtrace::force_capture(),
                    "illegal transition"
                );
            }
            return false;
        }
        self.apply(guard, new_state, note);
        true
    }

    /// Block until `new_state` is legal, then transition.
    ///
    /// `timeout` defaults to the policy's transition timeout. Returns the
    /// state that was left. On timeout returns
    /// [`DriverError::TransitionTimeout`] when the policy says timeouts are
    /// fatal, `Ok(None)` otherwise.
    pub fn transition_when_legal(
        &self,
        new_state: S,
        note: &str,
        timeout: Option<Duration>,
    ) -> Result<Option<S>, DriverError> {
        let timeout = timeout.unwrap_or(self.policy.transition_timeout);
        let start = Instant::now();
        let mut guard = self.current.lock();
        while !self.is_legal(guard.state, new_state) {
            let waited = start.elapsed();
            if waited >= timeout {
                let from = guard.state;
                drop(guard);
                if self.policy.timeout_is_fatal {
                    return Err(DriverError::TransitionTimeout {
                        from: format!("{from:?}"),
                        to: format!("{new_state:?}"),
                        waited_ms: waited.as_millis(),
                    });
                }
                warn!(
                    machine = %self.name,
                    from = ?from,
                    to = ?new_state,
                    waited_ms = waited.as_millis() as u64,
                    "transition did not become legal in time"
                );
                return Ok(None);
            }
            let slice = self.policy.poll_interval.min(timeout - waited);
            self.changed.wait_for(&mut guard, slice);
        }
        let old = guard.state;
        self.apply(guard, new_state, note);
        Ok(Some(old))
    }

    /// Block until the state equals `target` or `timeout` elapses. Returns
    /// whether the target was reached.
    pub fn wait(&self, target: S, timeout: Duration) -> bool {
        let poll = self.policy.poll_interval;
        if !poll.is_zero() && (timeout < poll || timeout.as_nanos() % poll.as_nanos() != 0) {
            warn!(
                machine = %self.name,
                timeout_ms = timeout.as_millis() as u64,
                poll_ms = poll.as_millis() as u64,
                "wait timeout is not a multiple of the poll interval"
            );
        }
        let start = Instant::now();
        let mut guard = self.current.lock();
        while guard.state != target {
            let waited = start.elapsed();
            if waited >= timeout {
                return false;
            }
            let slice = if poll.is_zero() { timeout - waited } else { poll.min(timeout - waited) };
            self.changed.wait_for(&mut guard, slice);
        }
        true
    }

    // -----------------------------------------------------------------------
    // Internal helpers
    // -----------------------------------------------------------------------

    fn is_legal(&self, from: S, to: S) -> bool {
        self.table.iter().any(|&(f, t)| f == from && t == to)
    }

    /// Commit the transition, release the state lock, then emit in order.
    fn apply(&self, mut guard: MutexGuard<'_, Current<S>>, new_state: S, note: &str) {
        let old_state = guard.state;
        guard.state = new_state;
        guard.note = note.to_string();
        let seq = guard.next_seq;
        guard.next_seq += 1;
        drop(guard);
        self.changed.notify_all();

        debug!(machine = %self.name, from = ?old_state, to = ?new_state, note, "transition");

        let mut turn = self.emit_turn.lock();
        while *turn != seq {
            self.emit_done.wait(&mut turn);
        }
        if let Some(observer) = &self.observer {
            observer.emit(new_state, old_state, note);
        }
        *turn += 1;
        drop(turn);
        self.emit_done.notify_all();
    }
}
