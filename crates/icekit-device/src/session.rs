//! [`DeviceSession`] – everything one device publishes, for the lifetime of
//! the device.
//!
//! The session owns the device identity, one [`InstanceRegistry`] per
//! published record family, the patient and technical [`AlertTable`]s and the
//! per-metric averaging table. Every publish entry point comes in two forms:
//!
//! * `*_sample` takes the identity the caller wants published and an optional
//!   existing [`HolderRef`], reconciles the two (creating, re-creating or
//!   retracting the bus instance) and returns the holder to use next time.
//! * `*_update` publishes into a holder the caller already knows is live.
//!
//! ```no_run
//! # use icekit_device::session::{DeviceSession, SessionConfig};
//! # use icekit_device::registry::NumericIdentity;
//! # use icekit_device::clock::DeviceClock;
//! # use icekit_middleware::DomainBus;
//! # use icekit_kernel::EventLoop;
//! # fn demo() -> Result<(), icekit_types::DriverError> {
//! let identity = icekit_device::identity::DeviceIdentityBuilder::new().random_udi().build();
//! let session = DeviceSession::new(DomainBus::default(), EventLoop::new(), identity, SessionConfig::default())?;
//! session.write_device_identity()?;
//! let spo2 = NumericIdentity::new("MDC_PULS_OXIM_SAT_O2", "spo2");
//! let reading = session.clock().instant();
//! let holder = session.numeric_sample(None, Some(98.0), &reading, &spo2)?;
//! let holder = session.numeric_sample(holder, Some(97.0), &reading, &spo2)?;
//! # let _ = holder;
//! session.shutdown();
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use icekit_kernel::{AverageTable, EventLoop, RollingAverageScheduler, TransitionPolicy};
use icekit_middleware::{DomainBus, DomainWriter, InstanceWriter};
use icekit_types::{
    AlarmLimit, DeviceAlertCondition, DeviceIdentity, DriverError, InstanceHandle,
    LocalAlarmLimitObjective, Numeric, PatientAlert, SampleArray, TechnicalAlert, Time,
};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::alerts::AlertTable;
use crate::clock::{DomainClock, Reading};
use crate::registry::{
    HolderRef, InstanceRegistry, LimitIdentity, LimitRecord, NumericIdentity, SampleArrayIdentity,
};

/// Default averaging window.
const DEFAULT_AVERAGING_PERIOD: Duration = Duration::from_secs(10);

/// Alert state published with the identity until the device says otherwise.
const INITIAL_ALERT_STATE: &str = "Normal";

/// Per-session settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Period of the rolling-average drain; `None` disables averaging.
    pub averaging_period: Option<Duration>,
    /// Timing of the connection state machine, for connected devices.
    pub transition_policy: TransitionPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            averaging_period: Some(DEFAULT_AVERAGING_PERIOD),
            transition_policy: TransitionPolicy::default(),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Device state
// ────────────────────────────────────────────────────────────────────────────

struct AlertCondition {
    data: DeviceAlertCondition,
    handle: InstanceHandle,
}

struct DeviceCore {
    identity: DeviceIdentity,
    identity_writer: DomainWriter<DeviceIdentity>,
    identity_handle: Option<InstanceHandle>,
    alert_condition_writer: DomainWriter<DeviceAlertCondition>,
    alert_condition: Option<AlertCondition>,
    numerics: InstanceRegistry<Numeric>,
    sample_arrays: InstanceRegistry<SampleArray>,
    alarm_limits: InstanceRegistry<AlarmLimit>,
    alarm_limit_objectives: InstanceRegistry<LocalAlarmLimitObjective>,
    patient_alerts: AlertTable<PatientAlert>,
    technical_alerts: AlertTable<TechnicalAlert>,
}

impl DeviceCore {
    fn new(bus: &DomainBus, identity: DeviceIdentity) -> Self {
        Self {
            identity,
            identity_writer: bus.writer(),
            identity_handle: None,
            alert_condition_writer: bus.writer(),
            alert_condition: None,
            numerics: InstanceRegistry::new(Arc::new(bus.writer::<Numeric>())),
            sample_arrays: InstanceRegistry::new(Arc::new(bus.writer::<SampleArray>())),
            alarm_limits: InstanceRegistry::new(Arc::new(bus.writer::<AlarmLimit>())),
            alarm_limit_objectives: InstanceRegistry::new(Arc::new(bus.writer::<LocalAlarmLimitObjective>())),
            patient_alerts: AlertTable::new(Arc::new(bus.writer::<PatientAlert>())),
            technical_alerts: AlertTable::new(Arc::new(bus.writer::<TechnicalAlert>())),
        }
    }

    fn udi(&self) -> &str {
        &self.identity.unique_device_identifier
    }

    fn unregister_all(&mut self) {
        self.numerics.unregister_all();
        self.sample_arrays.unregister_all();
        self.alarm_limits.unregister_all();
        self.alarm_limit_objectives.unregister_all();
        self.patient_alerts.unregister_all();
        self.technical_alerts.unregister_all();
    }
}

/// Write `value`/`unit` into a limit holder, publishing only when something
/// changed or the instance has never been written.
fn limit_update<T: LimitRecord>(
    registry: &mut InstanceRegistry<T>,
    holder: HolderRef<T>,
    unit_id: &str,
    value: f32,
) -> Result<(), DriverError> {
    let entry = registry.holder_mut(holder)?;
    let changed = entry.data.value() != value || entry.data.unit_identifier() != unit_id;
    if changed || !entry.written() {
        entry.data.set(unit_id, value);
        registry.write(holder)?;
    }
    Ok(())
}

fn limit_sample<T: LimitRecord>(
    registry: &mut InstanceRegistry<T>,
    udi: &str,
    holder: Option<HolderRef<T>>,
    unit_id: &str,
    value: Option<f32>,
    identity: &LimitIdentity,
) -> Result<Option<HolderRef<T>>, DriverError> {
    let live = registry.upsert(holder, udi, identity, value.is_some())?;
    if let (Some(live), Some(value)) = (live, value) {
        limit_update(registry, live, unit_id, value)?;
    }
    Ok(live)
}

fn fill_sample_array<I>(data: &mut SampleArray, values: I)
where
    I: IntoIterator,
    I::Item: Into<f64>,
{
    data.values.clear();
    // Published arrays are f32: wider inputs round to the nearest f32.
    data.values.extend(values.into_iter().map(|v| v.into() as f32));
}

// ────────────────────────────────────────────────────────────────────────────
// DeviceSession
// ────────────────────────────────────────────────────────────────────────────

/// Publication state of one device.
pub struct DeviceSession {
    bus: DomainBus,
    event_loop: EventLoop,
    clock: DomainClock,
    config: SessionConfig,
    averages: Arc<AverageTable>,
    latest: Arc<Mutex<HashMap<String, f64>>>,
    scheduler: Mutex<Option<RollingAverageScheduler>>,
    core: Mutex<DeviceCore>,
    shut_down: AtomicBool,
}

impl DeviceSession {
    /// Create the session and start its averaging scheduler.
    pub fn new(
        bus: DomainBus,
        event_loop: EventLoop,
        identity: DeviceIdentity,
        config: SessionConfig,
    ) -> Result<Arc<Self>, DriverError> {
        let averages = Arc::new(AverageTable::new());
        let latest: Arc<Mutex<HashMap<String, f64>>> = Arc::new(Mutex::new(HashMap::new()));
        let scheduler = match config.averaging_period {
            Some(period) => {
                let sink_latest = Arc::clone(&latest);
                let udi = identity.unique_device_identifier.clone();
                Some(RollingAverageScheduler::start(
                    Arc::clone(&averages),
                    period,
                    move |metric_id: &str, mean: f64| {
                        debug!(udi = %udi, metric_id = %metric_id, mean, "rolling average");
                        sink_latest.lock().insert(metric_id.to_string(), mean);
                    },
                )?)
            }
            None => None,
        };
        Ok(Arc::new(Self {
            clock: DomainClock::new(bus.clone()),
            core: Mutex::new(DeviceCore::new(&bus, identity)),
            bus,
            event_loop,
            config,
            averages,
            latest,
            scheduler: Mutex::new(scheduler),
            shut_down: AtomicBool::new(false),
        }))
    }

    pub fn bus(&self) -> &DomainBus {
        &self.bus
    }

    pub fn event_loop(&self) -> &EventLoop {
        &self.event_loop
    }

    /// Bus clock; its readings track this session's sample-array resolution.
    pub fn clock(&self) -> &DomainClock {
        &self.clock
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn identity(&self) -> DeviceIdentity {
        self.core.lock().identity.clone()
    }

    pub fn udi(&self) -> String {
        self.core.lock().udi().to_string()
    }

    /// Replace the identity. Takes effect on the next
    /// [`write_device_identity`][Self::write_device_identity].
    pub fn set_identity(&self, identity: DeviceIdentity) {
        self.core.lock().identity = identity;
    }

    // -----------------------------------------------------------------------
    // Identity and device alert condition
    // -----------------------------------------------------------------------

    /// Publish the identity, registering it (and the device alert condition)
    /// on first use.
    pub fn write_device_identity(&self) -> Result<(), DriverError> {
        let mut guard = self.core.lock();
        let core = &mut *guard;
        if core.udi().is_empty() {
            return Err(DriverError::Configuration(
                "cannot write a device identity without a unique_device_identifier".to_string(),
            ));
        }
        let handle = match core.identity_handle {
            Some(handle) => handle,
            None => {
                let Some(handle) = core.identity_writer.register_instance(&core.identity) else {
                    warn!(udi = %core.udi(), "unable to register device identity");
                    return Ok(());
                };
                core.identity_handle = Some(handle);
                handle
            }
        };
        core.identity_writer.write(&core.identity, handle)?;
        info!(udi = %core.udi(), model = %core.identity.model, "device identity published");

        if core.alert_condition.is_none() {
            let data = DeviceAlertCondition {
                unique_device_identifier: core.udi().to_string(),
                alert_state: INITIAL_ALERT_STATE.to_string(),
            };
            match core.alert_condition_writer.register_instance(&data) {
                Some(handle) => {
                    core.alert_condition_writer.write(&data, handle)?;
                    core.alert_condition = Some(AlertCondition { data, handle });
                }
                None => warn!(udi = %core.udi(), "unable to register device alert condition"),
            }
        }
        Ok(())
    }

    /// Publish the device-wide alert state if it changed.
    pub fn write_device_alert(&self, alert_state: &str) -> Result<(), DriverError> {
        let mut guard = self.core.lock();
        let core = &mut *guard;
        let Some(condition) = core.alert_condition.as_mut() else {
            return Err(DriverError::Configuration(
                "no device alert condition; write the device identity first".to_string(),
            ));
        };
        if condition.data.alert_state != alert_state {
            condition.data.alert_state = alert_state.to_string();
            core.alert_condition_writer.write(&condition.data, condition.handle)?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Numerics
    // -----------------------------------------------------------------------

    /// Publish `value` under `identity`, or retract the numeric when `value`
    /// is `None`. Returns the holder to pass next time.
    pub fn numeric_sample(
        &self,
        holder: Option<HolderRef<Numeric>>,
        value: Option<f32>,
        reading: &Reading,
        identity: &NumericIdentity,
    ) -> Result<Option<HolderRef<Numeric>>, DriverError> {
        let live = {
            let mut guard = self.core.lock();
            let core = &mut *guard;
            let udi = core.identity.unique_device_identifier.clone();
            core.numerics.upsert(holder, &udi, identity, value.is_some())?
        };
        if let (Some(live), Some(value)) = (live, value) {
            self.numeric_update(live, value, reading)?;
        }
        Ok(live)
    }

    /// Publish `value` into a live numeric and feed the metric's averager.
    pub fn numeric_update(&self, holder: HolderRef<Numeric>, value: f32, reading: &Reading) -> Result<(), DriverError> {
        let metric_id = {
            let mut core = self.core.lock();
            let entry = core.numerics.holder_mut(holder)?;
            entry.data.value = value;
            entry.data.device_time = reading.device_time().unwrap_or(Time::ZERO);
            entry.data.presentation_time = reading.time();
            let metric_id = entry.data.metric_id.clone();
            core.numerics.write(holder)?;
            metric_id
        };
        self.averages.add(&metric_id, f64::from(value));
        Ok(())
    }

    /// Current data of a live numeric.
    pub fn numeric(&self, holder: HolderRef<Numeric>) -> Option<Numeric> {
        self.core.lock().numerics.get(holder).map(|h| h.data.clone())
    }

    pub fn unregister_numeric(&self, holder: HolderRef<Numeric>) -> bool {
        self.core.lock().numerics.unregister(holder)
    }

    // -----------------------------------------------------------------------
    // Sample arrays
    // -----------------------------------------------------------------------

    /// Publish `values` under `identity`, or retract the sample array when
    /// `values` is `None`.
    pub fn sample_array_sample<I>(
        &self,
        holder: Option<HolderRef<SampleArray>>,
        values: Option<I>,
        reading: &Reading,
        identity: &SampleArrayIdentity,
    ) -> Result<Option<HolderRef<SampleArray>>, DriverError>
    where
        I: IntoIterator,
        I::Item: Into<f64>,
    {
        let values: Option<Vec<f64>> = values.map(|v| v.into_iter().map(Into::into).collect());
        let reading = match &values {
            Some(values) => reading.refine_resolution_for_frequency(identity.frequency, values.len())?,
            None => reading.clone(),
        };
        let live = {
            let mut guard = self.core.lock();
            let core = &mut *guard;
            let udi = core.identity.unique_device_identifier.clone();
            core.sample_arrays.upsert(holder, &udi, identity, values.is_some())?
        };
        if let (Some(live), Some(values)) = (live, values) {
            self.sample_array_update(live, values, &reading)?;
        }
        Ok(live)
    }

    /// Replace the values of a live sample array and publish it.
    pub fn sample_array_update<I>(
        &self,
        holder: HolderRef<SampleArray>,
        values: I,
        reading: &Reading,
    ) -> Result<(), DriverError>
    where
        I: IntoIterator,
        I::Item: Into<f64>,
    {
        let mut core = self.core.lock();
        let entry = core.sample_arrays.holder_mut(holder)?;
        fill_sample_array(&mut entry.data, values);
        entry.data.device_time = reading.device_time().unwrap_or(Time::ZERO);
        let adjusted = reading.refine_resolution_for_frequency(entry.data.frequency, entry.data.values.len())?;
        entry.data.presentation_time = adjusted.time();
        core.sample_arrays.write(holder)
    }

    pub fn sample_array(&self, holder: HolderRef<SampleArray>) -> Option<SampleArray> {
        self.core.lock().sample_arrays.get(holder).map(|h| h.data.clone())
    }

    pub fn unregister_sample_array(&self, holder: HolderRef<SampleArray>) -> bool {
        self.core.lock().sample_arrays.unregister(holder)
    }

    // -----------------------------------------------------------------------
    // Alarm limits and objectives
    // -----------------------------------------------------------------------

    pub fn alarm_limit_sample(
        &self,
        holder: Option<HolderRef<AlarmLimit>>,
        unit_id: &str,
        value: Option<f32>,
        identity: &LimitIdentity,
    ) -> Result<Option<HolderRef<AlarmLimit>>, DriverError> {
        let mut guard = self.core.lock();
        let core = &mut *guard;
        let udi = core.identity.unique_device_identifier.clone();
        limit_sample(&mut core.alarm_limits, &udi, holder, unit_id, value, identity)
    }

    pub fn alarm_limit_update(&self, holder: HolderRef<AlarmLimit>, unit_id: &str, value: f32) -> Result<(), DriverError> {
        limit_update(&mut self.core.lock().alarm_limits, holder, unit_id, value)
    }

    pub fn alarm_limit(&self, holder: HolderRef<AlarmLimit>) -> Option<AlarmLimit> {
        self.core.lock().alarm_limits.get(holder).map(|h| h.data.clone())
    }

    pub fn unregister_alarm_limit(&self, holder: HolderRef<AlarmLimit>) -> bool {
        self.core.lock().alarm_limits.unregister(holder)
    }

    pub fn alarm_limit_objective_sample(
        &self,
        holder: Option<HolderRef<LocalAlarmLimitObjective>>,
        unit_id: &str,
        value: Option<f32>,
        identity: &LimitIdentity,
    ) -> Result<Option<HolderRef<LocalAlarmLimitObjective>>, DriverError> {
        let mut guard = self.core.lock();
        let core = &mut *guard;
        let udi = core.identity.unique_device_identifier.clone();
        limit_sample(&mut core.alarm_limit_objectives, &udi, holder, unit_id, value, identity)
    }

    pub fn alarm_limit_objective_update(
        &self,
        holder: HolderRef<LocalAlarmLimitObjective>,
        unit_id: &str,
        value: f32,
    ) -> Result<(), DriverError> {
        limit_update(&mut self.core.lock().alarm_limit_objectives, holder, unit_id, value)
    }

    pub fn unregister_alarm_limit_objective(&self, holder: HolderRef<LocalAlarmLimitObjective>) -> bool {
        self.core.lock().alarm_limit_objectives.unregister(holder)
    }

    // -----------------------------------------------------------------------
    // Alerts
    // -----------------------------------------------------------------------

    /// Publish a patient alert, or retract it with `None`.
    pub fn write_patient_alert(&self, key: &str, text: Option<&str>) -> Result<(), DriverError> {
        let mut guard = self.core.lock();
        let core = &mut *guard;
        let udi = core.identity.unique_device_identifier.clone();
        core.patient_alerts.write(&udi, key, text)
    }

    /// Publish a technical alert, or retract it with `None`.
    pub fn write_technical_alert(&self, key: &str, text: Option<&str>) -> Result<(), DriverError> {
        let mut guard = self.core.lock();
        let core = &mut *guard;
        let udi = core.identity.unique_device_identifier.clone();
        core.technical_alerts.write(&udi, key, text)
    }

    pub fn mark_old_patient_alerts(&self) {
        self.core.lock().patient_alerts.mark_old();
    }

    pub fn mark_old_technical_alerts(&self) {
        self.core.lock().technical_alerts.mark_old();
    }

    pub fn clear_old_patient_alerts(&self) {
        self.core.lock().patient_alerts.clear_old();
    }

    pub fn clear_old_technical_alerts(&self) {
        self.core.lock().technical_alerts.clear_old();
    }

    /// Live patient alert text by key.
    pub fn patient_alert(&self, key: &str) -> Option<String> {
        self.core.lock().patient_alerts.text(key).map(str::to_string)
    }

    pub fn technical_alert(&self, key: &str) -> Option<String> {
        self.core.lock().technical_alerts.text(key).map(str::to_string)
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Retract every numeric, sample array, alarm limit, objective and alert.
    /// The identity stays published. Idempotent.
    pub fn unregister_all_instances(&self) {
        self.core.lock().unregister_all();
        debug!("all device instances unregistered");
    }

    /// Latest rolling average per metric.
    pub fn latest_averages(&self) -> HashMap<String, f64> {
        self.latest.lock().clone()
    }

    pub fn averages(&self) -> &Arc<AverageTable> {
        &self.averages
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Stop averaging and retract everything the device published,
    /// including its identity. Idempotent.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(mut scheduler) = self.scheduler.lock().take() {
            scheduler.stop();
        }
        let mut core = self.core.lock();
        core.unregister_all();
        if let Some(condition) = core.alert_condition.take() {
            core.alert_condition_writer.unregister_instance(condition.handle);
        }
        if let Some(handle) = core.identity_handle.take() {
            core.identity_writer.unregister_instance(handle);
        }
        info!(udi = %core.udi(), "device session shut down");
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::DeviceClock;
    use icekit_types::{LimitType, rosetta};

    #[test]
    fn sample_values_round_to_f32() {
        let mut data = SampleArray::default();
        fill_sample_array(&mut data, [1u8, 2, 3]);
        assert_eq!(data.values, vec![1.0, 2.0, 3.0]);
        fill_sample_array(&mut data, [16_777_217u32, 0]);
        assert_eq!(data.values, vec![16_777_216.0, 0.0], "replaced, not appended");
        fill_sample_array(&mut data, [0.1f64]);
        assert_eq!(data.values, vec![0.1f32]);
    }

    fn session() -> Result<Arc<DeviceSession>, DriverError> {
        let identity = DeviceIdentity {
            unique_device_identifier: "udi-1".to_string(),
            model: "test".to_string(),
            ..Default::default()
        };
        let config = SessionConfig {
            averaging_period: None,
            ..Default::default()
        };
        DeviceSession::new(DomainBus::default(), EventLoop::new(), identity, config)
    }

    fn spo2() -> NumericIdentity {
        NumericIdentity::new(rosetta::MDC_PULS_OXIM_SAT_O2, "spo2").unit(rosetta::MDC_DIM_PERCENT)
    }

    #[test]
    fn numeric_sample_publishes_and_feeds_averager() -> Result<(), DriverError> {
        let s = session()?;
        let reader = s.bus().reader::<Numeric>();
        let reading = Reading::from_device_time(Time { sec: 7, nanosec: 5 });
        let holder = s.numeric_sample(None, Some(97.0), &reading, &spo2())?;
        let holder = s.numeric_sample(holder, Some(99.0), &reading, &spo2())?;

        let samples = reader.take();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[1].data.value, 99.0);
        assert_eq!(samples[1].data.device_time, Time { sec: 7, nanosec: 5 });
        assert_eq!(s.averages().averager(rosetta::MDC_PULS_OXIM_SAT_O2).get(), 98.0);

        assert_eq!(s.numeric_sample(holder, None, &reading, &spo2())?, None);
        assert_eq!(s.bus().instance_count::<Numeric>(), 0);
        Ok(())
    }

    #[test]
    fn numeric_without_device_time_stamps_zero() -> Result<(), DriverError> {
        let s = session()?;
        let reading = s.clock().instant();
        let holder = s.numeric_sample(None, Some(60.0), &reading, &spo2())?;
        let data = holder.and_then(|h| s.numeric(h)).ok_or(DriverError::Bus("missing".into()))?;
        assert_eq!(data.device_time, Time::ZERO);
        assert_eq!(data.presentation_time.nanosec, 0);
        Ok(())
    }

    #[test]
    fn missing_udi_is_configuration_error() -> Result<(), DriverError> {
        let s = session()?;
        s.set_identity(DeviceIdentity::default());
        let reading = s.clock().instant();
        assert!(matches!(
            s.numeric_sample(None, Some(1.0), &reading, &spo2()),
            Err(DriverError::Configuration(_))
        ));
        assert!(matches!(s.write_device_identity(), Err(DriverError::Configuration(_))));
        Ok(())
    }

    #[test]
    fn sample_array_refines_resolution_and_stamps_device_time() -> Result<(), DriverError> {
        let s = session()?;
        let identity = SampleArrayIdentity::new(rosetta::MDC_PULS_OXIM_PLETH, "pleth", rosetta::MDC_DIM_DIMLESS, 50);
        let device = Reading::from_device_time(Time { sec: 3, nanosec: 250_000_000 });
        let reading = Reading::combined(&s.clock().instant(), &device);
        let values = vec![1u8, 2, 3, 4, 5];
        let holder = s.sample_array_sample(None, Some(values), &reading, &identity)?;

        // 5 samples at 50Hz: 100ms per batch
        assert_eq!(s.clock().tracker().resolution_ns(), 100_000_000);
        let data = holder.and_then(|h| s.sample_array(h)).ok_or(DriverError::Bus("missing".into()))?;
        assert_eq!(data.values, vec![1.0, 2.0, 3.0, 4.0, 5.0]);
        assert_eq!(data.device_time, Time { sec: 3, nanosec: 250_000_000 });
        assert_eq!(data.presentation_time.nanosec % 100_000_000, 0);
        Ok(())
    }

    #[test]
    fn sample_array_rejects_non_positive_frequency() -> Result<(), DriverError> {
        let s = session()?;
        let identity = SampleArrayIdentity::new(rosetta::MDC_PULS_OXIM_PLETH, "pleth", rosetta::MDC_DIM_DIMLESS, 0);
        let reading = s.clock().instant();
        assert!(matches!(
            s.sample_array_sample(None, Some([1.0f32]), &reading, &identity),
            Err(DriverError::Configuration(_))
        ));
        assert_eq!(s.bus().instance_count::<SampleArray>(), 0);
        Ok(())
    }

    #[test]
    fn alarm_limit_update_skips_unchanged_values() -> Result<(), DriverError> {
        let s = session()?;
        let reader = s.bus().reader::<AlarmLimit>();
        let identity = LimitIdentity::new(rosetta::MDC_PULS_OXIM_SAT_O2, LimitType::LowLimit);
        let holder = s.alarm_limit_sample(None, rosetta::MDC_DIM_PERCENT, Some(90.0), &identity)?;
        let live = holder.ok_or(DriverError::Bus("missing".into()))?;
        s.alarm_limit_update(live, rosetta::MDC_DIM_PERCENT, 90.0)?;
        assert_eq!(reader.take().len(), 1);
        s.alarm_limit_update(live, rosetta::MDC_DIM_PERCENT, 88.0)?;
        assert_eq!(reader.take().len(), 1);
        assert_eq!(s.alarm_limit(live).map(|l| l.value), Some(88.0));
        Ok(())
    }

    #[test]
    fn device_alert_requires_identity() -> Result<(), DriverError> {
        let s = session()?;
        assert!(matches!(s.write_device_alert("Alarm"), Err(DriverError::Configuration(_))));
        s.write_device_identity()?;
        let reader = s.bus().reader::<DeviceAlertCondition>();
        s.write_device_alert("Alarm")?;
        s.write_device_alert("Alarm")?;
        assert_eq!(reader.take().len(), 1);
        Ok(())
    }

    #[test]
    fn unregister_all_then_stale_holder_recreates() -> Result<(), DriverError> {
        let s = session()?;
        let reading = s.clock().instant();
        let holder = s.numeric_sample(None, Some(1.0), &reading, &spo2())?;
        s.write_patient_alert("a", Some("x"))?;
        s.unregister_all_instances();
        s.unregister_all_instances();
        assert_eq!(s.bus().instance_count::<Numeric>(), 0);
        assert_eq!(s.bus().instance_count::<PatientAlert>(), 0);

        let stale = holder.ok_or(DriverError::Bus("missing".into()))?;
        assert!(matches!(
            s.numeric_update(stale, 2.0, &reading),
            Err(DriverError::MissingHolder { .. })
        ));
        let fresh = s.numeric_sample(holder, Some(2.0), &reading, &spo2())?;
        assert!(fresh.is_some());
        assert_ne!(fresh, holder);
        Ok(())
    }

    #[test]
    fn shutdown_retracts_identity_and_is_idempotent() -> Result<(), DriverError> {
        let s = session()?;
        s.write_device_identity()?;
        assert_eq!(s.bus().live_instances::<DeviceIdentity>().len(), 1);
        s.shutdown();
        s.shutdown();
        assert!(s.is_shut_down());
        assert_eq!(s.bus().instance_count::<DeviceIdentity>(), 0);
        assert_eq!(s.bus().instance_count::<DeviceAlertCondition>(), 0);
        Ok(())
    }

    #[test]
    fn scheduler_records_latest_average() -> Result<(), Box<dyn std::error::Error>> {
        let identity = DeviceIdentity {
            unique_device_identifier: "udi-avg".to_string(),
            ..Default::default()
        };
        let config = SessionConfig {
            averaging_period: Some(Duration::from_millis(200)),
            ..Default::default()
        };
        let s = DeviceSession::new(DomainBus::default(), EventLoop::new(), identity, config)?;
        let reading = s.clock().instant();
        let holder = s.numeric_sample(None, Some(10.0), &reading, &spo2())?;
        if let Some(h) = holder {
            s.numeric_update(h, 20.0, &reading)?;
        }
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while s.latest_averages().is_empty() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(s.latest_averages().get(rosetta::MDC_PULS_OXIM_SAT_O2), Some(&15.0));
        Ok(())
    }
}
