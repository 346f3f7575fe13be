//! `icekit-types` – shared vocabulary for the driver kit.
//!
//! Every record a device driver publishes or consumes on the interconnect
//! bus lives here, together with the [`TopicType`] trait that names a
//! record's topic and instance key, the opaque [`InstanceHandle`] the bus
//! hands back on registration, and the workspace-wide [`DriverError`].
//!
//! Only the fields the driver kit reads or writes are modelled; the record
//! layouts are not a wire schema.

pub mod rosetta;

use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ────────────────────────────────────────────────────────────────────────────
// Topics and handles
// ────────────────────────────────────────────────────────────────────────────

/// A record type that can be published on the bus.
///
/// `TOPIC` selects the topic channel; [`TopicType::instance_key`] renders the
/// key fields that decide instance identity (two records with the same key
/// are the same bus instance).
pub trait TopicType: Clone + fmt::Debug + Send + Sync + Serialize + 'static {
    /// Topic name, e.g. `"Numeric"`.
    const TOPIC: &'static str;

    /// Key fields rendered as a single string.
    fn instance_key(&self) -> String;
}

/// Opaque registration handle assigned by the bus to one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceHandle(pub u64);

impl fmt::Display for InstanceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Time
// ────────────────────────────────────────────────────────────────────────────

/// Bus timestamp: whole seconds since the Unix epoch plus nanoseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Time {
    pub sec: i64,
    pub nanosec: u32,
}

impl Time {
    /// The zero timestamp, used when a reading carries no device time.
    pub const ZERO: Time = Time { sec: 0, nanosec: 0 };

    pub fn from_datetime(at: &DateTime<Utc>) -> Self {
        Self {
            sec: at.timestamp(),
            nanosec: at.timestamp_subsec_nanos(),
        }
    }

    /// Convert back to a `DateTime`. Returns `None` for out-of-range values.
    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.sec, self.nanosec).single()
    }

    pub fn as_millis(&self) -> i64 {
        self.sec * 1000 + i64::from(self.nanosec / 1_000_000)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Enumerations
// ────────────────────────────────────────────────────────────────────────────

/// Connectivity lifecycle of a connected device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    #[default]
    Initial,
    Connecting,
    Negotiating,
    Connected,
    Terminal,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Initial => "Initial",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Negotiating => "Negotiating",
            ConnectionState::Connected => "Connected",
            ConnectionState::Terminal => "Terminal",
        };
        f.write_str(name)
    }
}

/// Physical link a connected device uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ConnectionType {
    Serial,
    #[default]
    Simulated,
    Network,
}

/// Which side of a metric's range an alarm limit bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LimitType {
    LowLimit,
    HighLimit,
}

impl fmt::Display for LimitType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimitType::LowLimit => f.write_str("low_limit"),
            LimitType::HighLimit => f.write_str("high_limit"),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Device records
// ────────────────────────────────────────────────────────────────────────────

/// Icon attached to a device identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    pub content_type: String,
    pub image: Vec<u8>,
}

/// Who a device is. Must carry a unique device identifier (UDI) before any
/// other record is published for the device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub unique_device_identifier: String,
    pub manufacturer: String,
    pub model: String,
    pub serial_number: String,
    pub icon: Image,
    pub build: String,
    pub operating_system: String,
}

impl DeviceIdentity {
    /// Upper bound on `operating_system`, in characters.
    pub const OPERATING_SYSTEM_MAX_LEN: usize = 128;
}

/// Published connectivity status of a connected device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceConnectivity {
    pub unique_device_identifier: String,
    pub state: ConnectionState,
    pub connection_type: ConnectionType,
    pub info: String,
    pub valid_targets: Vec<String>,
}

/// Device-wide alert state (e.g. `"Normal"`, `"Alarm"`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceAlertCondition {
    pub unique_device_identifier: String,
    pub alert_state: String,
}

/// A single numeric vital (e.g. SpO2 percentage, pulse rate).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Numeric {
    pub unique_device_identifier: String,
    pub metric_id: String,
    pub vendor_metric_id: String,
    pub instance_id: i32,
    pub unit_id: String,
    pub value: f32,
    pub device_time: Time,
    pub presentation_time: Time,
}

/// A block of waveform samples captured at `frequency` Hz.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SampleArray {
    pub unique_device_identifier: String,
    pub metric_id: String,
    pub vendor_metric_id: String,
    pub instance_id: i32,
    pub unit_id: String,
    pub frequency: i32,
    pub values: Vec<f32>,
    pub device_time: Time,
    pub presentation_time: Time,
}

/// An alarm limit the device is currently applying.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmLimit {
    pub unique_device_identifier: String,
    pub metric_id: String,
    pub limit_type: LimitType,
    pub unit_identifier: String,
    pub value: f32,
}

/// The device's acknowledgement of an alarm limit it was asked to apply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalAlarmLimitObjective {
    pub unique_device_identifier: String,
    pub metric_id: String,
    pub limit_type: LimitType,
    pub unit_identifier: String,
    pub value: f32,
}

/// A request, published by a supervisor, to apply an alarm limit to every
/// device that reports `metric_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalAlarmLimitObjective {
    pub metric_id: String,
    pub limit_type: LimitType,
    pub unit_identifier: String,
    pub value: f32,
}

/// A patient or technical alert. Patient and technical alerts share the
/// record but travel on separate topics, see [`PatientAlert`] and
/// [`TechnicalAlert`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub unique_device_identifier: String,
    pub identifier: String,
    pub text: String,
}

/// [`Alert`] on the patient-alert topic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PatientAlert(pub Alert);

/// [`Alert`] on the technical-alert topic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TechnicalAlert(pub Alert);

/// Status report of an infusion pump.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InfusionStatus {
    pub unique_device_identifier: String,
    pub infusion_active: bool,
    pub drug_name: String,
    pub drug_mass_mcg: i32,
    pub solution_volume_ml: i32,
    pub volume_to_be_infused_ml: i32,
    pub infusion_duration_seconds: i32,
    pub infusion_fraction_complete: f32,
}

/// Command addressed to one pump; `stop_infusion` engages the interlock.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InfusionObjective {
    pub unique_device_identifier: String,
    pub requestor: String,
    pub stop_infusion: bool,
}

/// Drive value for simulated devices reporting `metric_id`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalSimulationObjective {
    pub metric_id: String,
    pub value: f32,
    pub jitter_step: f32,
    pub floor: f32,
    pub ceil: f32,
}

// ────────────────────────────────────────────────────────────────────────────
// Topic bindings
// ────────────────────────────────────────────────────────────────────────────

impl TopicType for DeviceIdentity {
    const TOPIC: &'static str = "DeviceIdentity";
    fn instance_key(&self) -> String {
        self.unique_device_identifier.clone()
    }
}

impl TopicType for DeviceConnectivity {
    const TOPIC: &'static str = "DeviceConnectivity";
    fn instance_key(&self) -> String {
        self.unique_device_identifier.clone()
    }
}

impl TopicType for DeviceAlertCondition {
    const TOPIC: &'static str = "DeviceAlertCondition";
    fn instance_key(&self) -> String {
        self.unique_device_identifier.clone()
    }
}

impl TopicType for Numeric {
    const TOPIC: &'static str = "Numeric";
    fn instance_key(&self) -> String {
        format!(
            "{}/{}/{}/{}/{}",
            self.unique_device_identifier,
            self.metric_id,
            self.vendor_metric_id,
            self.instance_id,
            self.unit_id
        )
    }
}

impl TopicType for SampleArray {
    const TOPIC: &'static str = "SampleArray";
    fn instance_key(&self) -> String {
        format!(
            "{}/{}/{}/{}/{}",
            self.unique_device_identifier,
            self.metric_id,
            self.vendor_metric_id,
            self.instance_id,
            self.unit_id
        )
    }
}

impl TopicType for AlarmLimit {
    const TOPIC: &'static str = "AlarmLimit";
    fn instance_key(&self) -> String {
        format!(
            "{}/{}/{}",
            self.unique_device_identifier, self.metric_id, self.limit_type
        )
    }
}

impl TopicType for LocalAlarmLimitObjective {
    const TOPIC: &'static str = "LocalAlarmLimitObjective";
    fn instance_key(&self) -> String {
        format!(
            "{}/{}/{}",
            self.unique_device_identifier, self.metric_id, self.limit_type
        )
    }
}

impl TopicType for GlobalAlarmLimitObjective {
    const TOPIC: &'static str = "GlobalAlarmLimitObjective";
    fn instance_key(&self) -> String {
        format!("{}/{}", self.metric_id, self.limit_type)
    }
}

impl TopicType for PatientAlert {
    const TOPIC: &'static str = "PatientAlert";
    fn instance_key(&self) -> String {
        format!("{}/{}", self.0.unique_device_identifier, self.0.identifier)
    }
}

impl TopicType for TechnicalAlert {
    const TOPIC: &'static str = "TechnicalAlert";
    fn instance_key(&self) -> String {
        format!("{}/{}", self.0.unique_device_identifier, self.0.identifier)
    }
}

impl TopicType for InfusionStatus {
    const TOPIC: &'static str = "InfusionStatus";
    fn instance_key(&self) -> String {
        self.unique_device_identifier.clone()
    }
}

impl TopicType for InfusionObjective {
    const TOPIC: &'static str = "InfusionObjective";
    fn instance_key(&self) -> String {
        self.unique_device_identifier.clone()
    }
}

impl TopicType for GlobalSimulationObjective {
    const TOPIC: &'static str = "GlobalSimulationObjective";
    fn instance_key(&self) -> String {
        self.metric_id.clone()
    }
}

/// Patient and technical alert records both wrap an [`Alert`]; this lets the
/// alert tables stay generic over the topic.
pub trait AlertRecord: TopicType {
    fn from_alert(alert: Alert) -> Self;
    fn alert(&self) -> &Alert;
    fn alert_mut(&mut self) -> &mut Alert;
}

impl AlertRecord for PatientAlert {
    fn from_alert(alert: Alert) -> Self {
        PatientAlert(alert)
    }
    fn alert(&self) -> &Alert {
        &self.0
    }
    fn alert_mut(&mut self) -> &mut Alert {
        &mut self.0
    }
}

impl AlertRecord for TechnicalAlert {
    fn from_alert(alert: Alert) -> Self {
        TechnicalAlert(alert)
    }
    fn alert(&self) -> &Alert {
        &self.0
    }
    fn alert_mut(&mut self) -> &mut Alert {
        &mut self.0
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Errors
// ────────────────────────────────────────────────────────────────────────────

/// Error type shared by every icekit crate.
///
/// Precondition violations (`Configuration`, `MissingHolder`) and fatal
/// timeouts are the only errors a driver is expected to surface to its
/// caller; registration failures and illegal immediate transitions are
/// logged and degrade gracefully instead.
#[derive(Error, Debug)]
pub enum DriverError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("No live {kind} instance for holder {holder}")]
    MissingHolder { kind: &'static str, holder: u64 },

    #[error("Unable to transition from {from} to {to} after waiting {waited_ms}ms")]
    TransitionTimeout {
        from: String,
        to: String,
        waited_ms: u128,
    },

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Timed out waiting to become service thread")]
    ServiceThreadTimeout,

    #[error("Bus error: {0}")]
    Bus(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_roundtrips_through_datetime() {
        let at = Utc.timestamp_opt(1_700_000_000, 123_456_789).unwrap();
        let t = Time::from_datetime(&at);
        assert_eq!(t.sec, 1_700_000_000);
        assert_eq!(t.nanosec, 123_456_789);
        assert_eq!(t.to_datetime(), Some(at));
        assert_eq!(t.as_millis(), 1_700_000_000_123);
    }

    #[test]
    fn numeric_key_covers_identity_fields() {
        let a = Numeric {
            unique_device_identifier: "udi".to_string(),
            metric_id: rosetta::MDC_PULS_OXIM_SAT_O2.to_string(),
            vendor_metric_id: "spo2".to_string(),
            instance_id: 0,
            unit_id: rosetta::MDC_DIM_PERCENT.to_string(),
            ..Default::default()
        };
        let mut b = a.clone();
        b.value = 97.0;
        assert_eq!(a.instance_key(), b.instance_key(), "value is not a key field");
        b.instance_id = 1;
        assert_ne!(a.instance_key(), b.instance_key());
    }

    #[test]
    fn alert_topics_are_distinct() {
        assert_ne!(PatientAlert::TOPIC, TechnicalAlert::TOPIC);
        let alert = PatientAlert::from_alert(Alert {
            unique_device_identifier: "udi".to_string(),
            identifier: "spo2-0".to_string(),
            text: String::new(),
        });
        assert_eq!(alert.instance_key(), "udi/spo2-0");
    }

    #[test]
    fn limit_type_display_matches_key_rendering() {
        assert_eq!(LimitType::LowLimit.to_string(), "low_limit");
        assert_eq!(LimitType::HighLimit.to_string(), "high_limit");
    }

    #[test]
    fn driver_error_display() {
        let err = DriverError::TransitionTimeout {
            from: ConnectionState::Initial.to_string(),
            to: ConnectionState::Connected.to_string(),
            waited_ms: 1000,
        };
        assert!(err.to_string().contains("Initial"));
        assert!(err.to_string().contains("1000ms"));

        let err = DriverError::MissingHolder {
            kind: "Numeric",
            holder: 7,
        };
        assert!(err.to_string().contains("Numeric"));
        assert_eq!(InstanceHandle(7).to_string(), "#7");
    }

    #[test]
    fn connectivity_serializes_state_by_name() {
        let c = DeviceConnectivity {
            unique_device_identifier: "udi".to_string(),
            state: ConnectionState::Negotiating,
            ..Default::default()
        };
        let json = serde_json::to_string(&c).unwrap();
        assert!(json.contains("\"Negotiating\""));
    }
}
