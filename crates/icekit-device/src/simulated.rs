//! Building blocks for simulated devices.
//!
//! [`simulated_session`] gives a device a random UDI and a simulated
//! identity. [`SimulatedConnectedDevice`] adds a connection state machine that
//! connects instantly, applies alarm-limit objectives from the bus and raises
//! `LOW`/`HIGH`/`NORMAL` patient alerts for every numeric it publishes.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use icekit_kernel::EventLoop;
use icekit_middleware::DomainBus;
use icekit_types::{
    AlarmLimit, ConnectionState, ConnectionType, DriverError, GlobalAlarmLimitObjective, LimitType,
    LocalAlarmLimitObjective, Numeric,
};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::clock::Reading;
use crate::connected::{ConnectedDevice, ConnectedSession, ConnectionListener};
use crate::identity::DeviceIdentityBuilder;
use crate::monitor::{
    AlarmLimitHandler, AlarmLimitObjectiveMonitor, GlobalSimulationObjectiveMonitor, SimulationListener,
};
use crate::registry::{HolderRef, LimitIdentity, NumericIdentity};
use crate::session::{DeviceSession, SessionConfig};

const MANUFACTURER: &str = "Simulated";
const STEP_TIMEOUT: Duration = Duration::from_millis(1000);
const DISCONNECT_TIMEOUT: Duration = Duration::from_millis(2000);

/// A session for a simulated device: random UDI, simulated manufacturer,
/// this crate's build and the host OS.
pub fn simulated_session(
    bus: DomainBus,
    event_loop: EventLoop,
    model: &str,
    config: SessionConfig,
) -> Result<Arc<DeviceSession>, DriverError> {
    let identity = DeviceIdentityBuilder::new()
        .random_udi()
        .manufacturer(MANUFACTURER)
        .model(model)
        .software_rev()
        .os_name()
        .build();
    DeviceSession::new(bus, event_loop, identity, config)
}

// ────────────────────────────────────────────────────────────────────────────
// Alarm limits
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Clone, Copy)]
struct LimitHolders {
    objective: Option<HolderRef<LocalAlarmLimitObjective>>,
    limit: Option<HolderRef<AlarmLimit>>,
}

/// Alarm limits currently applied, one objective and one limit per
/// (metric, limit type).
struct AlarmLimits {
    session: Weak<DeviceSession>,
    holders: Mutex<HashMap<(String, LimitType), LimitHolders>>,
}

impl AlarmLimits {
    fn session(&self) -> Result<Arc<DeviceSession>, DriverError> {
        self.session
            .upgrade()
            .ok_or_else(|| DriverError::Configuration("device session is gone".to_string()))
    }

    fn value(&self, session: &DeviceSession, metric_id: &str, limit_type: LimitType) -> Option<f32> {
        let limit = self
            .holders
            .lock()
            .get(&(metric_id.to_string(), limit_type))
            .and_then(|h| h.limit)?;
        session.alarm_limit(limit).map(|l| l.value)
    }

    /// Patient alert text for `value` against the limits of `metric_id`.
    fn classify(&self, session: &DeviceSession, metric_id: &str, value: f32) -> Option<&'static str> {
        let low = self.value(session, metric_id, LimitType::LowLimit);
        let high = self.value(session, metric_id, LimitType::HighLimit);
        if low.is_none() && high.is_none() {
            return None;
        }
        if low.is_some_and(|low| low > value) {
            Some("LOW")
        } else if high.is_some_and(|high| high < value) {
            Some("HIGH")
        } else {
            Some("NORMAL")
        }
    }
}

impl AlarmLimitHandler for AlarmLimits {
    fn set_alarm_limit(&self, objective: &GlobalAlarmLimitObjective) -> Result<(), DriverError> {
        let session = self.session()?;
        let key = (objective.metric_id.clone(), objective.limit_type);
        let current = self.holders.lock().get(&key).copied().unwrap_or_default();
        let identity = LimitIdentity::new(objective.metric_id.clone(), objective.limit_type);
        let unit = objective.unit_identifier.as_str();
        let updated = LimitHolders {
            objective: session.alarm_limit_objective_sample(current.objective, unit, Some(objective.value), &identity)?,
            limit: session.alarm_limit_sample(current.limit, unit, Some(objective.value), &identity)?,
        };
        debug!(metric_id = %objective.metric_id, limit_type = %objective.limit_type, value = objective.value, "alarm limit set");
        self.holders.lock().insert(key, updated);
        Ok(())
    }

    fn unset_alarm_limit(&self, metric_id: &str, limit_type: LimitType) -> Result<(), DriverError> {
        let session = self.session()?;
        let Some(current) = self.holders.lock().remove(&(metric_id.to_string(), limit_type)) else {
            return Ok(());
        };
        let identity = LimitIdentity::new(metric_id, limit_type);
        session.alarm_limit_objective_sample(current.objective, "", None, &identity)?;
        session.alarm_limit_sample(current.limit, "", None, &identity)?;
        debug!(metric_id, limit_type = %limit_type, "alarm limit unset");
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// SimulatedConnectedDevice
// ────────────────────────────────────────────────────────────────────────────

/// A simulated device with an instant connection lifecycle.
pub struct SimulatedConnectedDevice {
    connected: ConnectedSession,
    limits: Arc<AlarmLimits>,
    alarm_monitor: AlarmLimitObjectiveMonitor,
    simulation_monitor: Option<GlobalSimulationObjectiveMonitor>,
    last_error: Mutex<Option<String>>,
}

impl SimulatedConnectedDevice {
    /// Wrap `session`. `simulation`, when given, receives simulation
    /// objectives while connected.
    pub fn new(
        session: Arc<DeviceSession>,
        listener: Option<Weak<dyn ConnectionListener>>,
        simulation: Option<Weak<dyn SimulationListener>>,
    ) -> Self {
        let limits = Arc::new(AlarmLimits {
            session: Arc::downgrade(&session),
            holders: Mutex::new(HashMap::new()),
        });
        let handler: Weak<dyn AlarmLimitHandler> = Arc::downgrade(&limits) as Weak<dyn AlarmLimitHandler>;
        Self {
            connected: ConnectedSession::new(session, ConnectionType::Simulated, listener),
            alarm_monitor: AlarmLimitObjectiveMonitor::new(handler),
            simulation_monitor: simulation.map(GlobalSimulationObjectiveMonitor::new),
            limits,
            last_error: Mutex::new(None),
        }
    }

    pub fn connected(&self) -> &ConnectedSession {
        &self.connected
    }

    pub fn session(&self) -> &Arc<DeviceSession> {
        self.connected.session()
    }

    /// Most recent connect/disconnect failure.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    /// Publish the identity and initial connectivity.
    pub fn write_device_identity(&self) -> Result<(), DriverError> {
        self.connected.write_device_identity()
    }

    /// [`DeviceSession::numeric_sample`], then a patient alert
    /// `"<metric>-<instance>"` against the metric's alarm limits.
    pub fn numeric_sample(
        &self,
        holder: Option<HolderRef<Numeric>>,
        value: Option<f32>,
        reading: &Reading,
        identity: &NumericIdentity,
    ) -> Result<Option<HolderRef<Numeric>>, DriverError> {
        let session = self.session();
        let live = session.numeric_sample(holder, value, reading, identity)?;
        if let (Some(_), Some(value)) = (live, value) {
            if let Some(text) = self.limits.classify(session, &identity.metric_id, value) {
                let key = format!("{}-{}", identity.metric_id, identity.instance_id);
                debug!(alert = %key, value, text, "alarm limit check");
                session.write_patient_alert(&key, Some(text))?;
            }
        }
        Ok(live)
    }

    pub fn set_alarm_limit(&self, objective: &GlobalAlarmLimitObjective) -> Result<(), DriverError> {
        self.limits.set_alarm_limit(objective)
    }

    pub fn unset_alarm_limit(&self, metric_id: &str, limit_type: LimitType) -> Result<(), DriverError> {
        self.limits.unset_alarm_limit(metric_id, limit_type)
    }

    fn register_monitors(&self) {
        let session = self.session();
        self.alarm_monitor.register(session.bus(), session.event_loop());
        if let Some(monitor) = &self.simulation_monitor {
            monitor.register(session.bus(), session.event_loop());
        }
    }

    fn unregister_monitors(&self) {
        self.alarm_monitor.unregister();
        if let Some(monitor) = &self.simulation_monitor {
            monitor.unregister();
        }
    }

    fn record(&self, result: Result<(), DriverError>) -> Result<(), DriverError> {
        if let Err(e) = &result {
            warn!(error = %e, "connection lifecycle failed");
            *self.last_error.lock() = Some(e.to_string());
        }
        result
    }
}

impl ConnectedDevice for SimulatedConnectedDevice {
    fn connect(&self, device_name: &str) -> Result<(), DriverError> {
        self.register_monitors();
        match self.connected.state() {
            ConnectionState::Connected | ConnectionState::Connecting | ConnectionState::Negotiating => Ok(()),
            _ => {
                let result = self
                    .connected
                    .transition_when_legal(
                        ConnectionState::Connecting,
                        &format!("connect requested to {device_name}"),
                        STEP_TIMEOUT,
                    )
                    .and_then(|_| {
                        self.connected
                            .transition_when_legal(ConnectionState::Negotiating, "connect requested", STEP_TIMEOUT)
                    })
                    .and_then(|_| {
                        self.connected
                            .transition_when_legal(ConnectionState::Connected, "connect requested", STEP_TIMEOUT)
                    });
                self.record(result)
            }
        }
    }

    fn disconnect(&self) -> Result<(), DriverError> {
        self.unregister_monitors();
        if self.connected.state() == ConnectionState::Terminal {
            return Ok(());
        }
        let result = self
            .connected
            .transition_when_legal(ConnectionState::Terminal, "disconnect requested", DISCONNECT_TIMEOUT);
        self.record(result)
    }

    fn connection_type(&self) -> ConnectionType {
        ConnectionType::Simulated
    }

    fn state(&self) -> ConnectionState {
        self.connected.state()
    }

    fn await_state(&self, state: ConnectionState, timeout: Duration) -> bool {
        self.connected.await_state(state, timeout)
    }

    fn shutdown(&self) {
        self.unregister_monitors();
        self.connected.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::DeviceClock;
    use icekit_kernel::ServiceThread;
    use icekit_types::{PatientAlert, rosetta};

    fn device(el: &EventLoop) -> Result<SimulatedConnectedDevice, DriverError> {
        let config = SessionConfig {
            averaging_period: None,
            ..Default::default()
        };
        let session = simulated_session(DomainBus::default(), el.clone(), "Test Device", config)?;
        let device = SimulatedConnectedDevice::new(session, None, None);
        device.write_device_identity()?;
        Ok(device)
    }

    fn limit(limit_type: LimitType, value: f32) -> GlobalAlarmLimitObjective {
        GlobalAlarmLimitObjective {
            metric_id: rosetta::MDC_PULS_OXIM_SAT_O2.to_string(),
            limit_type,
            unit_identifier: rosetta::MDC_DIM_PERCENT.to_string(),
            value,
        }
    }

    #[test]
    fn identity_is_simulated() -> Result<(), DriverError> {
        let el = EventLoop::new();
        let d = device(&el)?;
        let identity = d.session().identity();
        assert_eq!(identity.manufacturer, "Simulated");
        assert_eq!(identity.model, "Test Device");
        assert!(!identity.unique_device_identifier.is_empty());
        Ok(())
    }

    #[test]
    fn numeric_against_limits_raises_patient_alert() -> Result<(), DriverError> {
        let el = EventLoop::new();
        let d = device(&el)?;
        let spo2 = NumericIdentity::new(rosetta::MDC_PULS_OXIM_SAT_O2, "spo2").unit(rosetta::MDC_DIM_PERCENT);
        let key = format!("{}-0", rosetta::MDC_PULS_OXIM_SAT_O2);
        let reading = d.session().clock().instant();

        let holder = d.numeric_sample(None, Some(85.0), &reading, &spo2)?;
        assert_eq!(d.session().patient_alert(&key), None, "no limits, no alert");

        d.set_alarm_limit(&limit(LimitType::LowLimit, 90.0))?;
        d.set_alarm_limit(&limit(LimitType::HighLimit, 100.0))?;
        let holder = d.numeric_sample(holder, Some(85.0), &reading, &spo2)?;
        assert_eq!(d.session().patient_alert(&key).as_deref(), Some("LOW"));
        let holder = d.numeric_sample(holder, Some(95.0), &reading, &spo2)?;
        assert_eq!(d.session().patient_alert(&key).as_deref(), Some("NORMAL"));

        d.set_alarm_limit(&limit(LimitType::HighLimit, 94.0))?;
        d.numeric_sample(holder, Some(95.0), &reading, &spo2)?;
        assert_eq!(d.session().patient_alert(&key).as_deref(), Some("HIGH"));
        assert_eq!(d.session().bus().instance_count::<AlarmLimit>(), 2);
        assert_eq!(d.session().bus().live_instances::<PatientAlert>().len(), 1);
        Ok(())
    }

    #[test]
    fn unset_retracts_limit_and_objective() -> Result<(), DriverError> {
        let el = EventLoop::new();
        let d = device(&el)?;
        d.set_alarm_limit(&limit(LimitType::LowLimit, 90.0))?;
        assert_eq!(d.session().bus().instance_count::<LocalAlarmLimitObjective>(), 1);
        d.unset_alarm_limit(rosetta::MDC_PULS_OXIM_SAT_O2, LimitType::LowLimit)?;
        d.unset_alarm_limit(rosetta::MDC_PULS_OXIM_SAT_O2, LimitType::LowLimit)?;
        assert_eq!(d.session().bus().instance_count::<LocalAlarmLimitObjective>(), 0);
        assert_eq!(d.session().bus().instance_count::<AlarmLimit>(), 0);
        Ok(())
    }

    #[test]
    fn connect_and_disconnect_walk_the_machine() -> Result<(), Box<dyn std::error::Error>> {
        let el = EventLoop::new();
        let _svc = ServiceThread::spawn(el.clone(), Duration::from_millis(20))?;
        let d = device(&el)?;
        d.connect("bench")?;
        assert_eq!(d.state(), ConnectionState::Connected);
        d.connect("again")?;
        assert_eq!(d.connected().connectivity().info, "connect requested");

        d.disconnect()?;
        assert!(d.await_state(ConnectionState::Terminal, Duration::from_millis(100)));
        d.disconnect()?;
        assert!(d.last_error().is_none());
        d.shutdown();
        Ok(())
    }

    #[test]
    fn disconnect_before_connect_times_out() -> Result<(), Box<dyn std::error::Error>> {
        let el = EventLoop::new();
        let _svc = ServiceThread::spawn(el.clone(), Duration::from_millis(20))?;
        let d = device(&el)?;
        assert!(matches!(d.disconnect(), Err(DriverError::TransitionTimeout { .. })));
        assert!(d.last_error().is_some());
        Ok(())
    }
}
