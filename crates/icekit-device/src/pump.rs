//! [`SimInfusionPump`] – a simulated infusion pump.
//!
//! While connected a worker thread advances the infusion once per update
//! period and publishes [`InfusionStatus`]:
//!
//! | Condition | Effect |
//! |---|---|
//! | waiting to resume, resume time reached | restart at 0 %, active unless interlocked |
//! | waiting to resume | inactive |
//! | interlock engaged | inactive, progress held |
//! | otherwise | advance `100 / duration` %; at 100 % stop and wait to resume |
//!
//! An [`InfusionObjective`] addressed to the pump's UDI engages or releases
//! the interlock. The objective subscription lives from construction to
//! [`shutdown`][ConnectedDevice::shutdown], so objectives sent while
//! disconnected still apply.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use icekit_kernel::EventLoop;
use icekit_middleware::{DomainBus, DomainWriter, InstanceWriter, Sample};
use icekit_types::{
    ConnectionState, ConnectionType, DriverError, InfusionObjective, InfusionStatus, InstanceHandle,
};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::connected::{ConnectedDevice, ConnectedSession};
use crate::monitor::Subscription;
use crate::session::{DeviceSession, SessionConfig};
use crate::simulated::{SimulatedConnectedDevice, simulated_session};

const MODEL: &str = "Simulated Infusion Pump";
const DRUG_NAME: &str = "Morphine";
const DRUG_MASS_MCG: i32 = 20;
const SOLUTION_VOLUME_ML: i32 = 120;
const VOLUME_TO_BE_INFUSED_ML: i32 = 100;

/// Timing of the simulated infusion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PumpConfig {
    /// Interval between progress updates.
    pub update_period: Duration,
    /// Pause after a completed infusion before the next one starts.
    pub resume_delay: Duration,
    /// Progress advances by `100 / infusion_duration_seconds` percent per update.
    pub infusion_duration_seconds: i32,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            update_period: Duration::from_millis(1000),
            resume_delay: Duration::from_millis(10_000),
            infusion_duration_seconds: 3600,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Infusion progress
// ────────────────────────────────────────────────────────────────────────────

struct Infusion {
    record: InfusionStatus,
    resume_at: Option<Instant>,
    writer: DomainWriter<InfusionStatus>,
    handle: Option<InstanceHandle>,
}

impl Infusion {
    /// One update step at `now`.
    fn advance(&mut self, interlock: bool, now: Instant, resume_delay: Duration) {
        let status = &mut self.record;
        if let Some(resume_at) = self.resume_at {
            if now >= resume_at {
                status.infusion_fraction_complete = 0.0;
                status.infusion_active = !interlock;
                self.resume_at = None;
            } else {
                status.infusion_active = false;
            }
        } else if interlock {
            status.infusion_active = false;
        } else {
            let duration = status.infusion_duration_seconds.max(1) as f32;
            status.infusion_fraction_complete += 100.0 / duration;
            if status.infusion_fraction_complete >= 100.0 {
                status.infusion_active = false;
                self.resume_at = Some(now + resume_delay);
            } else {
                status.infusion_active = true;
            }
        }
    }

    fn publish(&self) {
        let Some(handle) = self.handle else {
            return;
        };
        if let Err(e) = self.writer.write(&self.record, handle) {
            warn!(error = %e, "unable to publish infusion status");
        }
    }
}

struct StopSignal {
    stopped: Mutex<bool>,
    wake: Condvar,
}

struct Worker {
    signal: Arc<StopSignal>,
    handle: JoinHandle<()>,
}

impl Worker {
    fn spawn(infusion: Arc<Mutex<Infusion>>, interlock: Arc<AtomicBool>, config: PumpConfig) -> Result<Self, DriverError> {
        let signal = Arc::new(StopSignal {
            stopped: Mutex::new(false),
            wake: Condvar::new(),
        });
        let thread_signal = Arc::clone(&signal);
        let handle = thread::Builder::new()
            .name("infusion-pump".to_string())
            .spawn(move || {
                let mut next = Instant::now();
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
                    {
                        let mut state = infusion.lock();
                        state.advance(interlock.load(Ordering::Acquire), Instant::now(), config.resume_delay);
                        state.publish();
                    }
                    next += config.update_period;
                }
                debug!("infusion pump worker stopped");
            })?;
        Ok(Self { signal, handle })
    }

    fn stop(self) {
        *self.signal.stopped.lock() = true;
        self.signal.wake.notify_all();
        if self.handle.join().is_err() {
            warn!("infusion pump worker panicked");
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// SimInfusionPump
// ────────────────────────────────────────────────────────────────────────────

/// Simulated infusion pump publishing [`InfusionStatus`].
pub struct SimInfusionPump {
    base: SimulatedConnectedDevice,
    config: PumpConfig,
    infusion: Arc<Mutex<Infusion>>,
    interlock: Arc<AtomicBool>,
    objective: Subscription<InfusionObjective>,
    worker: Mutex<Option<Worker>>,
}

impl SimInfusionPump {
    /// Create the pump, publish its identity and initial status, and
    /// subscribe to [`InfusionObjective`]. The subscription goes through
    /// [`EventLoop::add_handler`], so `event_loop` must already be serviced.
    pub fn new(
        bus: DomainBus,
        event_loop: EventLoop,
        session_config: SessionConfig,
        config: PumpConfig,
    ) -> Result<Self, DriverError> {
        let session = simulated_session(bus, event_loop, MODEL, session_config)?;
        let udi = session.udi();
        let base = SimulatedConnectedDevice::new(Arc::clone(&session), None, None);
        base.write_device_identity()?;

        let record = InfusionStatus {
            unique_device_identifier: udi.clone(),
            infusion_active: true,
            drug_name: DRUG_NAME.to_string(),
            drug_mass_mcg: DRUG_MASS_MCG,
            solution_volume_ml: SOLUTION_VOLUME_ML,
            volume_to_be_infused_ml: VOLUME_TO_BE_INFUSED_ML,
            infusion_duration_seconds: config.infusion_duration_seconds,
            infusion_fraction_complete: 0.0,
        };
        let writer = session.bus().writer::<InfusionStatus>();
        let handle = writer.register_instance(&record);
        if handle.is_none() {
            warn!(udi = %udi, "unable to register infusion status");
        }
        let infusion = Infusion {
            record,
            resume_at: None,
            writer,
            handle,
        };
        infusion.publish();

        let interlock = Arc::new(AtomicBool::new(false));
        let objective_interlock = Arc::clone(&interlock);
        let objective_udi = udi.clone();
        let objective = Subscription::new(move |sample: Sample<InfusionObjective>| {
            if sample.is_valid_alive() {
                engage_interlock(&objective_interlock, &objective_udi, sample.data.stop_infusion);
            }
        })
        .with_filter(move |o: &InfusionObjective| o.unique_device_identifier == udi);
        objective.register(session.bus(), session.event_loop());

        Ok(Self {
            base,
            config,
            infusion: Arc::new(Mutex::new(infusion)),
            interlock,
            objective,
            worker: Mutex::new(None),
        })
    }

    pub fn session(&self) -> &Arc<DeviceSession> {
        self.base.session()
    }

    pub fn connected(&self) -> &ConnectedSession {
        self.base.connected()
    }

    pub fn config(&self) -> PumpConfig {
        self.config
    }

    /// Engage (`true`) or release (`false`) the interlock.
    pub fn stop_the_pump(&self, stop: bool) {
        engage_interlock(&self.interlock, &self.session().udi(), stop);
    }

    pub fn is_interlocked(&self) -> bool {
        self.interlock.load(Ordering::Acquire)
    }

    /// Last published status.
    pub fn status(&self) -> InfusionStatus {
        self.infusion.lock().record.clone()
    }

    /// Whether the infusion worker is running.
    pub fn is_infusing(&self) -> bool {
        self.worker.lock().is_some()
    }

    fn start_worker(&self) -> Result<(), DriverError> {
        self.stop_worker();
        let worker = Worker::spawn(Arc::clone(&self.infusion), Arc::clone(&self.interlock), self.config)?;
        *self.worker.lock() = Some(worker);
        Ok(())
    }

    fn stop_worker(&self) {
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            worker.stop();
        }
    }
}

fn engage_interlock(interlock: &AtomicBool, udi: &str, stop: bool) {
    if interlock.swap(stop, Ordering::AcqRel) != stop {
        info!(udi, stop, "infusion interlock changed");
    }
}

impl ConnectedDevice for SimInfusionPump {
    fn connect(&self, device_name: &str) -> Result<(), DriverError> {
        self.base.connect(device_name)?;
        self.start_worker()
    }

    fn disconnect(&self) -> Result<(), DriverError> {
        self.stop_worker();
        self.base.disconnect()
    }

    fn connection_type(&self) -> ConnectionType {
        self.base.connection_type()
    }

    fn state(&self) -> ConnectionState {
        self.base.state()
    }

    fn await_state(&self, state: ConnectionState, timeout: Duration) -> bool {
        self.base.await_state(state, timeout)
    }

    fn shutdown(&self) {
        self.stop_worker();
        self.objective.unregister();
        {
            let mut infusion = self.infusion.lock();
            if let Some(handle) = infusion.handle.take() {
                infusion.writer.unregister_instance(handle);
            }
        }
        self.base.shutdown();
    }
}

impl Drop for SimInfusionPump {
    fn drop(&mut self) {
        self.stop_worker();
    }
}
