//! [`SimPulseOximeter`] – a simulated pulse oximeter.
//!
//! Publishes SpO2 and pulse rate numerics and a plethysmogram sample array.
//! Values come from the application ([`SimPulseOximeter::set_bpm_o2`],
//! [`SimPulseOximeter::publish_pleth`]) or, while connected, from
//! `GlobalSimulationObjective`s for either metric. Every publish runs on the
//! session's event loop.

use std::sync::{Arc, Weak};
use std::time::Duration;

use icekit_kernel::EventLoop;
use icekit_middleware::DomainBus;
use icekit_types::{
    ConnectionState, ConnectionType, DriverError, GlobalSimulationObjective, Numeric, SampleArray, rosetta,
};
use parking_lot::Mutex;
use tracing::{debug, error};

use crate::clock::DeviceClock;
use crate::connected::{ConnectedDevice, ConnectedSession};
use crate::monitor::SimulationListener;
use crate::registry::{HolderRef, NumericIdentity, SampleArrayIdentity};
use crate::session::{DeviceSession, SessionConfig};
use crate::simulated::{SimulatedConnectedDevice, simulated_session};

const MODEL: &str = "Simulated Pulse Oximeter";

/// Plethysmogram sampling rate.
pub const PLETH_FREQUENCY_HZ: i32 = 50;

/// A numeric the oximeter reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vital {
    SpO2,
    PulseRate,
}

impl Vital {
    pub fn metric_id(self) -> &'static str {
        match self {
            Vital::SpO2 => rosetta::MDC_PULS_OXIM_SAT_O2,
            Vital::PulseRate => rosetta::MDC_PULS_OXIM_PULS_RATE,
        }
    }

    pub fn from_metric_id(metric_id: &str) -> Option<Self> {
        match metric_id {
            rosetta::MDC_PULS_OXIM_SAT_O2 => Some(Vital::SpO2),
            rosetta::MDC_PULS_OXIM_PULS_RATE => Some(Vital::PulseRate),
            _ => None,
        }
    }

    fn identity(self) -> NumericIdentity {
        match self {
            Vital::SpO2 => NumericIdentity::new(self.metric_id(), "spo2").unit(rosetta::MDC_DIM_PERCENT),
            Vital::PulseRate => NumericIdentity::new(self.metric_id(), "pulse_rate").unit(rosetta::MDC_DIM_BEAT_PER_MIN),
        }
    }
}

#[derive(Default)]
struct Holders {
    spo2: Option<HolderRef<Numeric>>,
    pulse_rate: Option<HolderRef<Numeric>>,
    pleth: Option<HolderRef<SampleArray>>,
}

impl Holders {
    fn vital(&mut self, vital: Vital) -> &mut Option<HolderRef<Numeric>> {
        match vital {
            Vital::SpO2 => &mut self.spo2,
            Vital::PulseRate => &mut self.pulse_rate,
        }
    }
}

/// Simulated pulse oximeter.
pub struct SimPulseOximeter {
    base: SimulatedConnectedDevice,
    holders: Mutex<Holders>,
}

impl SimPulseOximeter {
    /// Create the oximeter and publish its identity.
    pub fn new(bus: DomainBus, event_loop: EventLoop, config: SessionConfig) -> Result<Arc<Self>, DriverError> {
        let session = simulated_session(bus, event_loop, MODEL, config)?;
        let oximeter = Arc::new_cyclic(|weak: &Weak<Self>| {
            let listener: Weak<dyn SimulationListener> = weak.clone();
            Self {
                base: SimulatedConnectedDevice::new(session, None, Some(listener)),
                holders: Mutex::new(Holders::default()),
            }
        });
        oximeter.base.write_device_identity()?;
        Ok(oximeter)
    }

    pub fn session(&self) -> &Arc<DeviceSession> {
        self.base.session()
    }

    pub fn connected(&self) -> &ConnectedSession {
        self.base.connected()
    }

    pub fn device(&self) -> &SimulatedConnectedDevice {
        &self.base
    }

    /// Publish pulse rate and SpO2 from the event loop.
    pub fn set_bpm_o2(self: &Arc<Self>, bpm: f32, o2: f32) -> Result<(), DriverError> {
        let this = Arc::clone(self);
        self.on_event_loop(move || {
            this.publish_vital(Vital::PulseRate, bpm)?;
            this.publish_vital(Vital::SpO2, o2)
        })
    }

    /// Publish one plethysmogram batch from the event loop.
    pub fn publish_pleth(self: &Arc<Self>, values: Vec<f32>) -> Result<(), DriverError> {
        let this = Arc::clone(self);
        self.on_event_loop(move || {
            let session = this.session();
            let reading = session.clock().instant();
            let identity = SampleArrayIdentity::new(
                rosetta::MDC_PULS_OXIM_PLETH,
                "pleth",
                rosetta::MDC_DIM_DIMLESS,
                PLETH_FREQUENCY_HZ,
            );
            let mut holders = this.holders.lock();
            holders.pleth = session.sample_array_sample(holders.pleth, Some(values), &reading, &identity)?;
            Ok(())
        })
    }

    /// Live value of `vital`, if published.
    pub fn vital(&self, vital: Vital) -> Option<f32> {
        let holder = *self.holders.lock().vital(vital);
        holder.and_then(|h| self.session().numeric(h)).map(|n| n.value)
    }

    fn publish_vital(&self, vital: Vital, value: f32) -> Result<(), DriverError> {
        let reading = self.session().clock().instant();
        let mut holders = self.holders.lock();
        let slot = holders.vital(vital);
        *slot = self.base.numeric_sample(*slot, Some(value), &reading, &vital.identity())?;
        Ok(())
    }

    fn on_event_loop<F>(&self, publish: F) -> Result<(), DriverError>
    where
        F: FnOnce() -> Result<(), DriverError> + Send + 'static,
    {
        match self.session().event_loop().do_now(publish) {
            Some(result) => result,
            None => {
                error!("oximeter publish did not run");
                Err(DriverError::Bus("publish did not complete on the event loop".to_string()))
            }
        }
    }
}

impl SimulationListener for SimPulseOximeter {
    fn simulated_numeric(&self, objective: &GlobalSimulationObjective) {
        let Some(vital) = Vital::from_metric_id(&objective.metric_id) else {
            return;
        };
        debug!(metric_id = %objective.metric_id, value = objective.value, "simulation objective");
        if let Err(e) = self.publish_vital(vital, objective.value) {
            error!(metric_id = %objective.metric_id, error = %e, "unable to publish simulated value");
        }
    }
}

impl ConnectedDevice for SimPulseOximeter {
    fn connect(&self, device_name: &str) -> Result<(), DriverError> {
        self.base.connect(device_name)
    }

    fn disconnect(&self) -> Result<(), DriverError> {
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
        self.base.shutdown();
    }
}
