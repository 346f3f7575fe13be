//! `icekit-kernel` – coordination primitives for device drivers.
//!
//! Nothing here knows about devices. It provides the pieces a driver session
//! is assembled from.
//!
//! # Modules
//!
//! - [`averager`] – [`Averager`][averager::Averager] and
//!   [`AverageTable`][averager::AverageTable]: per-metric mean accumulators
//!   drained on read.
//! - [`rolling_average`] – [`RollingAverageScheduler`][rolling_average::RollingAverageScheduler]:
//!   background thread draining an average table once per period.
//! - [`state_machine`] – [`StateMachine`][state_machine::StateMachine]:
//!   legal-transition-checked state with blocking waits and an ordered
//!   transition observer.
//! - [`event_loop`] – [`EventLoop`][event_loop::EventLoop]: the
//!   single-service-thread dispatcher every bus callback and deferred
//!   mutation goes through, plus [`ServiceThread`][event_loop::ServiceThread].

pub mod averager;
pub mod event_loop;
pub mod rolling_average;
pub mod state_machine;

pub use averager::{AverageTable, Averager};
pub use event_loop::{ConditionHandler, EventLoop, ServiceThread};
pub use rolling_average::RollingAverageScheduler;
pub use state_machine::{StateMachine, TransitionObserver, TransitionPolicy};
