//! [`RollingAverageScheduler`] – background thread that drains an
//! [`AverageTable`] once per period and hands each metric's mean to a sink.
//!
//! The scheduler only touches averager locks. Whatever the sink does with a
//! mean (record it, publish it through an event loop) is up to the sink.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use icekit_types::DriverError;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::averager::AverageTable;

struct StopSignal {
    stopped: Mutex<bool>,
    wake: Condvar,
}

/// Periodic drain of an [`AverageTable`]. Stops on [`stop`][Self::stop] or
/// drop.
pub struct RollingAverageScheduler {
    period: Duration,
    signal: Arc<StopSignal>,
    handle: Option<JoinHandle<()>>,
}

impl RollingAverageScheduler {
    /// Spawn the scheduler thread.
    pub fn start<F>(table: Arc<AverageTable>, period: Duration, mut sink: F) -> Result<Self, DriverError>
    where
        F: FnMut(&str, f64) + Send + 'static,
    {
        if period.is_zero() {
            return Err(DriverError::Configuration(
                "averaging period must be non-zero".to_string(),
            ));
        }
        let signal = Arc::new(StopSignal {
            stopped: Mutex::new(false),
            wake: Condvar::new(),
        });
        let thread_signal = Arc::clone(&signal);
        let handle = thread::Builder::new()
            .name("rolling-average".to_string())
            .spawn(move || {
                let mut next = Instant::now() + period;
                loop {
                    {
                        let mut stopped = thread_signal.stopped.lock();
                        while !*stopped && Instant::now() < next {
                            thread_signal.wake.wait_until(&mut stopped, next);
                        }
                        if *stopped {
                            break;
                        }
                    }
                    for (metric, mean) in table.drain() {
                        sink(&metric, mean);
                    }
                    next += period;
                }
                debug!("rolling average scheduler stopped");
            })?;
        Ok(Self {
            period,
            signal,
            handle: Some(handle),
        })
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Stop the thread and wait for it to exit. Idempotent.
    pub fn stop(&mut self) {
        *self.signal.stopped.lock() = true;
        self.signal.wake.notify_all();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!(period_ms = self.period.as_millis() as u64, "rolling average scheduler panicked");
            }
        }
    }
}

impl Drop for RollingAverageScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}
