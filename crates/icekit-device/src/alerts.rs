//! Mark-and-sweep tables for patient and technical alerts.
//!
//! A device republishes its active alerts once per cycle:
//!
//! ```text
//! table.mark_old();            // every live key becomes a sweep candidate
//! table.write(udi, "a", Some("HIGH"))?;   // still active, kept
//! table.clear_old();           // whatever was not rewritten is retracted
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use icekit_middleware::InstanceWriter;
use icekit_types::{Alert, AlertRecord, DriverError, InstanceHandle};
use tracing::{debug, warn};

struct AlertHolder<A> {
    data: A,
    handle: InstanceHandle,
    written: bool,
}

/// Live alerts of one class, keyed by alert identifier.
pub struct AlertTable<A> {
    writer: Arc<dyn InstanceWriter<A>>,
    live: HashMap<String, AlertHolder<A>>,
    old: HashSet<String>,
}

impl<A: AlertRecord> AlertTable<A> {
    pub fn new(writer: Arc<dyn InstanceWriter<A>>) -> Self {
        Self {
            writer,
            live: HashMap::new(),
            old: HashSet::new(),
        }
    }

    /// Publish `text` under `key`, or retract the key when `text` is `None`.
    pub fn write(&mut self, udi: &str, key: &str, text: Option<&str>) -> Result<(), DriverError> {
        let Some(text) = text else {
            self.retract(key);
            return Ok(());
        };
        if !self.live.contains_key(key) {
            if udi.is_empty() {
                return Err(DriverError::Configuration(format!(
                    "populate the device identity's unique_device_identifier before writing {} {key}",
                    A::TOPIC
                )));
            }
            let data = A::from_alert(Alert {
                unique_device_identifier: udi.to_string(),
                identifier: key.to_string(),
                text: String::new(),
            });
            let Some(handle) = self.writer.register_instance(&data) else {
                warn!(topic = A::TOPIC, key, "unable to register alert instance");
                return Ok(());
            };
            self.live.insert(
                key.to_string(),
                AlertHolder {
                    data,
                    handle,
                    written: false,
                },
            );
        }
        self.old.remove(key);
        let Some(holder) = self.live.get_mut(key) else {
            return Ok(());
        };
        if !holder.written || holder.data.alert().text != text {
            holder.data.alert_mut().text = text.to_string();
            self.writer.write(&holder.data, holder.handle)?;
            holder.written = true;
        }
        Ok(())
    }

    /// Make every live key a candidate for the next [`clear_old`][Self::clear_old].
    pub fn mark_old(&mut self) {
        self.old.clear();
        self.old.extend(self.live.keys().cloned());
    }

    /// Retract every key marked old and not rewritten since.
    pub fn clear_old(&mut self) {
        let stale: Vec<String> = self.old.drain().collect();
        for key in stale {
            debug!(topic = A::TOPIC, key = %key, "clearing stale alert");
            self.retract(&key);
        }
    }

    /// Retract every alert. Idempotent.
    pub fn unregister_all(&mut self) {
        for (_, holder) in self.live.drain() {
            self.writer.unregister_instance(holder.handle);
        }
        self.old.clear();
    }

    pub fn live_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.live.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Current text of `key`, if live.
    pub fn text(&self, key: &str) -> Option<&str> {
        self.live.get(key).map(|h| h.data.alert().text.as_str())
    }

    fn retract(&mut self, key: &str) {
        self.old.remove(key);
        if let Some(holder) = self.live.remove(key) {
            self.writer.unregister_instance(holder.handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use icekit_middleware::{BusConfig, DomainBus};
    use icekit_types::PatientAlert;

    fn table(bus: &DomainBus) -> AlertTable<PatientAlert> {
        AlertTable::new(Arc::new(bus.writer::<PatientAlert>()))
    }

    #[test]
    fn unchanged_text_is_not_republished() -> Result<(), DriverError> {
        let bus = DomainBus::default();
        let reader = bus.reader::<PatientAlert>();
        let mut alerts = table(&bus);
        alerts.write("udi", "spo2-0", Some("LOW"))?;
        alerts.write("udi", "spo2-0", Some("LOW"))?;
        assert_eq!(reader.take().len(), 1);
        alerts.write("udi", "spo2-0", Some("NORMAL"))?;
        let samples = reader.take();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].data.0.text, "NORMAL");
        Ok(())
    }

    #[test]
    fn mark_and_sweep_retracts_unwritten_keys() -> Result<(), DriverError> {
        let bus = DomainBus::default();
        let mut alerts = table(&bus);
        alerts.write("udi", "a", Some("x"))?;
        alerts.write("udi", "b", Some("y"))?;

        alerts.mark_old();
        alerts.write("udi", "a", Some("x"))?;
        alerts.clear_old();

        assert_eq!(alerts.live_keys(), vec!["a".to_string()]);
        assert_eq!(bus.instance_count::<PatientAlert>(), 1);
        Ok(())
    }

    #[test]
    fn retract_of_marked_key_also_leaves_old_set() -> Result<(), DriverError> {
        let bus = DomainBus::default();
        let mut alerts = table(&bus);
        alerts.write("udi", "a", Some("x"))?;
        alerts.mark_old();
        alerts.write("udi", "a", None)?;
        // Re-created after the retract; must survive the sweep.
        alerts.write("udi", "a", Some("x"))?;
        alerts.clear_old();
        assert_eq!(alerts.text("a"), Some("x"));
        Ok(())
    }

    #[test]
    fn missing_udi_is_configuration_error() {
        let bus = DomainBus::default();
        let mut alerts = table(&bus);
        assert!(matches!(
            alerts.write("", "a", Some("x")),
            Err(DriverError::Configuration(_))
        ));
        assert!(alerts.write("", "a", None).is_ok());
    }

    #[test]
    fn rejected_registration_keeps_nothing() -> Result<(), DriverError> {
        let bus = DomainBus::new(BusConfig {
            max_instances_per_topic: Some(0),
            ..Default::default()
        });
        let mut alerts = table(&bus);
        alerts.write("udi", "a", Some("x"))?;
        assert!(alerts.live_keys().is_empty());
        Ok(())
    }

    #[test]
    fn unregister_all_is_idempotent() -> Result<(), DriverError> {
        let bus = DomainBus::default();
        let mut alerts = table(&bus);
        alerts.write("udi", "a", Some("x"))?;
        alerts.unregister_all();
        alerts.unregister_all();
        assert_eq!(bus.instance_count::<PatientAlert>(), 0);
        Ok(())
    }
}
