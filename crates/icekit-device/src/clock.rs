//! Clock readings and the sample-array resolution tracker.
//!
//! A [`Reading`] is one instant as seen by a clock, optionally paired with
//! the device's own notion of that instant. The two are not assumed to be in
//! sync, so both travel together.
//!
//! | Clock | `time()` | device time |
//! |---|---|---|
//! | [`WallClock`] | wall time | wall time |
//! | [`Metronome`] | wall time floored to the period | same |
//! | [`DomainClock`] | bus time floored to the tracked resolution | none |
//!
//! [`ResolutionTracker`] holds the finest sample period any sample array has
//! needed so far. It only ever gets finer.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use icekit_middleware::DomainBus;
use icekit_types::{DriverError, Time};
use tracing::info;

const NANOS_PER_SEC: i64 = 1_000_000_000;

// ────────────────────────────────────────────────────────────────────────────
// Resolution tracker
// ────────────────────────────────────────────────────────────────────────────

/// Finest sample period (ns per sample) required so far.
#[derive(Debug)]
pub struct ResolutionTracker {
    resolution_ns: AtomicI64,
}

impl ResolutionTracker {
    /// One second.
    pub const DEFAULT_RESOLUTION_NS: i64 = NANOS_PER_SEC;

    pub fn new() -> Self {
        Self {
            resolution_ns: AtomicI64::new(Self::DEFAULT_RESOLUTION_NS),
        }
    }

    pub fn resolution_ns(&self) -> i64 {
        self.resolution_ns.load(Ordering::Acquire)
    }

    /// Tighten the resolution to the per-batch period of `size` samples at
    /// `hertz`, if that is finer than the current one. Returns the
    /// resolution in effect afterwards.
    pub fn ensure_resolution_for_frequency(&self, hertz: i32, size: usize) -> Result<i64, DriverError> {
        if hertz <= 0 {
            return Err(DriverError::Configuration(format!(
                "sample array frequency must be positive, got {hertz}Hz"
            )));
        }
        let current = self.resolution_ns();
        if size == 0 {
            return Ok(current);
        }
        let period_ns = i64::try_from(size)
            .ok()
            .and_then(|size| NANOS_PER_SEC.checked_mul(size))
            .map(|total| total / i64::from(hertz))
            .ok_or_else(|| {
                DriverError::Configuration(format!("frequency {hertz}Hz overflow for size {size}"))
            })?;
        let previous = self.resolution_ns.fetch_min(period_ns, Ordering::AcqRel);
        if period_ns < previous {
            info!(
                hertz,
                size,
                from_ns = previous,
                to_ns = period_ns,
                "increased sample array resolution"
            );
            Ok(period_ns)
        } else {
            Ok(previous)
        }
    }

    /// Floor `t` onto the current resolution grid.
    pub fn quantize(&self, t: Time) -> Time {
        quantize(self.resolution_ns(), t)
    }
}

impl Default for ResolutionTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Floor `t` to `resolution_ns`.
///
/// Whole-second resolutions floor the seconds to the whole-second part and
/// the nanoseconds to the sub-second part (zeroing them when there is none);
/// sub-second resolutions floor only the nanoseconds.
pub fn quantize(resolution_ns: i64, t: Time) -> Time {
    let mut sec = t.sec;
    let mut nanosec = i64::from(t.nanosec);
    if resolution_ns >= NANOS_PER_SEC {
        let seconds_mod = resolution_ns / NANOS_PER_SEC;
        let nanoseconds_mod = resolution_ns % NANOS_PER_SEC;
        if seconds_mod != 0 {
            sec -= sec.rem_euclid(seconds_mod);
        }
        if nanoseconds_mod == 0 {
            nanosec = 0;
        } else {
            nanosec -= nanosec % nanoseconds_mod;
        }
    } else if resolution_ns > 0 {
        nanosec -= nanosec % resolution_ns;
    }
    Time {
        sec,
        // Floored from a u32, so it still fits.
        nanosec: nanosec as u32,
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Reading
// ────────────────────────────────────────────────────────────────────────────

/// One instant as captured by a clock.
#[derive(Debug, Clone)]
pub struct Reading {
    time: Time,
    device_time: Option<Time>,
    tracker: Option<Arc<ResolutionTracker>>,
}

impl Reading {
    pub fn new(time: Time, device_time: Option<Time>) -> Self {
        Self {
            time,
            device_time,
            tracker: None,
        }
    }

    /// A reading whose time is also the device time.
    pub fn from_device_time(time: Time) -> Self {
        Self::new(time, Some(time))
    }

    /// Reference time from `reference` (including its resolution tracking),
    /// device time from `device`.
    pub fn combined(reference: &Reading, device: &Reading) -> Self {
        Self {
            time: reference.time,
            device_time: device.device_time,
            tracker: reference.tracker.clone(),
        }
    }

    /// The reading's time, floored to the tracked resolution if the reading
    /// came from a [`DomainClock`].
    pub fn time(&self) -> Time {
        match &self.tracker {
            Some(tracker) => tracker.quantize(self.time),
            None => self.time,
        }
    }

    pub fn has_device_time(&self) -> bool {
        self.device_time.is_some()
    }

    pub fn device_time(&self) -> Option<Time> {
        self.device_time
    }

    /// Make sure the tracked resolution can represent `size` samples at
    /// `hertz`. Readings without a tracker are returned unchanged.
    pub fn refine_resolution_for_frequency(&self, hertz: i32, size: usize) -> Result<Reading, DriverError> {
        if let Some(tracker) = &self.tracker {
            tracker.ensure_resolution_for_frequency(hertz, size)?;
        }
        Ok(self.clone())
    }
}

impl std::fmt::Display for Reading {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let render = |t: Time| t.to_datetime().map(|d| d.to_rfc3339()).unwrap_or_else(|| format!("{}.{:09}", t.sec, t.nanosec));
        match self.device_time {
            Some(device) => write!(f, "{} {}", render(self.time()), render(device)),
            None => write!(f, "{}", render(self.time())),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Clocks
// ────────────────────────────────────────────────────────────────────────────

/// Source of [`Reading`]s.
pub trait DeviceClock: Send + Sync {
    fn instant(&self) -> Reading;
}

/// Human wall-clock time, millisecond precision.
#[derive(Debug, Clone, Copy, Default)]
pub struct WallClock;

impl WallClock {
    fn now_millis() -> i64 {
        Utc::now().timestamp_millis()
    }
}

fn millis_to_time(ms: i64) -> Time {
    Time {
        sec: ms.div_euclid(1000),
        nanosec: (ms.rem_euclid(1000) * 1_000_000) as u32,
    }
}

impl DeviceClock for WallClock {
    fn instant(&self) -> Reading {
        Reading::from_device_time(millis_to_time(Self::now_millis()))
    }
}

/// Wall clock that ticks once per `period`.
#[derive(Debug, Clone, Copy)]
pub struct Metronome {
    period_ms: i64,
}

impl Metronome {
    pub fn new(period: Duration) -> Self {
        Self {
            period_ms: i64::try_from(period.as_millis()).unwrap_or(i64::MAX).max(1),
        }
    }
}

impl DeviceClock for Metronome {
    fn instant(&self) -> Reading {
        let now = WallClock::now_millis();
        Reading::from_device_time(millis_to_time(now - now.rem_euclid(self.period_ms)))
    }
}

/// Bus time, floored to the session's sample-array resolution.
#[derive(Clone)]
pub struct DomainClock {
    bus: DomainBus,
    tracker: Arc<ResolutionTracker>,
}

impl DomainClock {
    pub fn new(bus: DomainBus) -> Self {
        Self {
            bus,
            tracker: Arc::new(ResolutionTracker::new()),
        }
    }

    pub fn tracker(&self) -> &Arc<ResolutionTracker> {
        &self.tracker
    }

    pub fn current_time(&self) -> DateTime<Utc> {
        self.bus.current_time().to_datetime().unwrap_or_else(Utc::now)
    }
}

impl DeviceClock for DomainClock {
    fn instant(&self) -> Reading {
        Reading {
            time: self.bus.current_time(),
            device_time: None,
            tracker: Some(Arc::clone(&self.tracker)),
        }
    }
}
