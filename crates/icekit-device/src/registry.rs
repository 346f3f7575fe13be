//! [`InstanceRegistry`] – the live bus instances of one record family.
//!
//! A device publishes each numeric, sample array, alarm limit and alarm-limit
//! objective as its own bus instance. The registry owns the
//! [`InstanceHolder`] (record plus bus handle) of every live instance and
//! hands callers a copyable [`HolderRef`] token. Removing a holder and
//! unregistering its instance always happen together.
//!
//! [`InstanceRegistry::upsert`] is the one upsert-or-retract algorithm all
//! families share:
//!
//! | Existing ref | Identity | Present | Outcome |
//! |---|---|---|---|
//! | none / stale | – | yes | create and register |
//! | live | same | yes | keep |
//! | live | different | yes | unregister old, create new |
//! | any | – | no | unregister any live holder, `None` |

use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use icekit_middleware::InstanceWriter;
use icekit_types::{
    AlarmLimit, DriverError, InstanceHandle, LimitType, LocalAlarmLimitObjective, Numeric,
    SampleArray, TopicType, rosetta,
};
use tracing::{debug, warn};

// ────────────────────────────────────────────────────────────────────────────
// Identities
// ────────────────────────────────────────────────────────────────────────────

/// A record family with identity fields a device chooses (the UDI is added by
/// the device).
pub trait Instance: TopicType {
    type Identity: Clone + PartialEq + fmt::Debug + Send + Sync;

    fn identity(&self) -> Self::Identity;

    fn udi(&self) -> &str;

    /// A fresh record carrying only `udi` and `identity`.
    fn from_identity(udi: &str, identity: &Self::Identity) -> Self;
}

/// Identity of a [`Numeric`] instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NumericIdentity {
    pub metric_id: String,
    pub vendor_metric_id: String,
    pub instance_id: i32,
    pub unit_id: String,
}

impl NumericIdentity {
    /// Instance 0, dimensionless.
    pub fn new(metric_id: impl Into<String>, vendor_metric_id: impl Into<String>) -> Self {
        Self {
            metric_id: metric_id.into(),
            vendor_metric_id: vendor_metric_id.into(),
            instance_id: 0,
            unit_id: rosetta::MDC_DIM_DIMLESS.to_string(),
        }
    }

    pub fn instance(mut self, instance_id: i32) -> Self {
        self.instance_id = instance_id;
        self
    }

    pub fn unit(mut self, unit_id: impl Into<String>) -> Self {
        self.unit_id = unit_id.into();
        self
    }
}

/// Identity of a [`SampleArray`] instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SampleArrayIdentity {
    pub metric_id: String,
    pub vendor_metric_id: String,
    pub instance_id: i32,
    pub unit_id: String,
    pub frequency: i32,
}

impl SampleArrayIdentity {
    pub fn new(
        metric_id: impl Into<String>,
        vendor_metric_id: impl Into<String>,
        unit_id: impl Into<String>,
        frequency: i32,
    ) -> Self {
        Self {
            metric_id: metric_id.into(),
            vendor_metric_id: vendor_metric_id.into(),
            instance_id: 0,
            unit_id: unit_id.into(),
            frequency,
        }
    }

    pub fn instance(mut self, instance_id: i32) -> Self {
        self.instance_id = instance_id;
        self
    }
}

/// Identity of an alarm limit or alarm-limit objective.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LimitIdentity {
    pub metric_id: String,
    pub limit_type: LimitType,
}

impl LimitIdentity {
    pub fn new(metric_id: impl Into<String>, limit_type: LimitType) -> Self {
        Self {
            metric_id: metric_id.into(),
            limit_type,
        }
    }
}

impl Instance for Numeric {
    type Identity = NumericIdentity;

    fn identity(&self) -> NumericIdentity {
        NumericIdentity {
            metric_id: self.metric_id.clone(),
            vendor_metric_id: self.vendor_metric_id.clone(),
            instance_id: self.instance_id,
            unit_id: self.unit_id.clone(),
        }
    }

    fn udi(&self) -> &str {
        &self.unique_device_identifier
    }

    fn from_identity(udi: &str, identity: &NumericIdentity) -> Self {
        Numeric {
            unique_device_identifier: udi.to_string(),
            metric_id: identity.metric_id.clone(),
            vendor_metric_id: identity.vendor_metric_id.clone(),
            instance_id: identity.instance_id,
            unit_id: identity.unit_id.clone(),
            ..Default::default()
        }
    }
}

impl Instance for SampleArray {
    type Identity = SampleArrayIdentity;

    fn identity(&self) -> SampleArrayIdentity {
        SampleArrayIdentity {
            metric_id: self.metric_id.clone(),
            vendor_metric_id: self.vendor_metric_id.clone(),
            instance_id: self.instance_id,
            unit_id: self.unit_id.clone(),
            frequency: self.frequency,
        }
    }

    fn udi(&self) -> &str {
        &self.unique_device_identifier
    }

    fn from_identity(udi: &str, identity: &SampleArrayIdentity) -> Self {
        SampleArray {
            unique_device_identifier: udi.to_string(),
            metric_id: identity.metric_id.clone(),
            vendor_metric_id: identity.vendor_metric_id.clone(),
            instance_id: identity.instance_id,
            unit_id: identity.unit_id.clone(),
            frequency: identity.frequency,
            ..Default::default()
        }
    }
}

/// Alarm limits and alarm-limit objectives share identity and payload.
pub trait LimitRecord: Instance<Identity = LimitIdentity> {
    fn value(&self) -> f32;
    fn unit_identifier(&self) -> &str;
    fn set(&mut self, unit_identifier: &str, value: f32);
}

macro_rules! limit_record {
    ($ty:ty) => {
        impl Instance for $ty {
            type Identity = LimitIdentity;

            fn identity(&self) -> LimitIdentity {
                LimitIdentity::new(self.metric_id.clone(), self.limit_type)
            }

            fn udi(&self) -> &str {
                &self.unique_device_identifier
            }

            fn from_identity(udi: &str, identity: &LimitIdentity) -> Self {
                Self {
                    unique_device_identifier: udi.to_string(),
                    metric_id: identity.metric_id.clone(),
                    limit_type: identity.limit_type,
                    unit_identifier: String::new(),
                    value: 0.0,
                }
            }
        }

        impl LimitRecord for $ty {
            fn value(&self) -> f32 {
                self.value
            }

            fn unit_identifier(&self) -> &str {
                &self.unit_identifier
            }

            fn set(&mut self, unit_identifier: &str, value: f32) {
                self.unit_identifier = unit_identifier.to_string();
                self.value = value;
            }
        }
    };
}

limit_record!(AlarmLimit);
limit_record!(LocalAlarmLimitObjective);

// ────────────────────────────────────────────────────────────────────────────
// Holders
// ────────────────────────────────────────────────────────────────────────────

/// A registered record and its bus handle.
#[derive(Debug, Clone)]
pub struct InstanceHolder<T> {
    pub data: T,
    pub handle: InstanceHandle,
    written: bool,
}

impl<T> InstanceHolder<T> {
    fn new(data: T, handle: InstanceHandle) -> Self {
        Self {
            data,
            handle,
            written: false,
        }
    }

    /// Whether the instance has been written at least once.
    pub fn written(&self) -> bool {
        self.written
    }
}

/// Copyable token naming a holder in an [`InstanceRegistry`]. A ref whose
/// holder was unregistered is stale; lookups through it find nothing.
pub struct HolderRef<T> {
    id: u64,
    _family: PhantomData<fn() -> T>,
}

impl<T> HolderRef<T> {
    fn new(id: u64) -> Self {
        Self {
            id,
            _family: PhantomData,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

impl<T> Clone for HolderRef<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for HolderRef<T> {}

impl<T> PartialEq for HolderRef<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> Eq for HolderRef<T> {}

impl<T> std::hash::Hash for HolderRef<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl<T> fmt::Debug for HolderRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HolderRef({})", self.id)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Registry
// ────────────────────────────────────────────────────────────────────────────

/// Live holders of one record family.
pub struct InstanceRegistry<T> {
    writer: Arc<dyn InstanceWriter<T>>,
    holders: BTreeMap<u64, InstanceHolder<T>>,
    next_id: u64,
}

impl<T: Instance> InstanceRegistry<T> {
    pub fn new(writer: Arc<dyn InstanceWriter<T>>) -> Self {
        Self {
            writer,
            holders: BTreeMap::new(),
            next_id: 1,
        }
    }

    /// Build a record from `identity`, register it and keep its holder.
    ///
    /// An empty `udi` is a configuration error. A rejected registration is
    /// logged and yields `Ok(None)`; nothing is kept.
    pub fn create(&mut self, udi: &str, identity: &T::Identity) -> Result<Option<HolderRef<T>>, DriverError> {
        if udi.is_empty() {
            return Err(DriverError::Configuration(format!(
                "populate the device identity's unique_device_identifier before creating {} instances",
                T::TOPIC
            )));
        }
        let data = T::from_identity(udi, identity);
        let Some(handle) = self.writer.register_instance(&data) else {
            warn!(topic = T::TOPIC, identity = ?identity, "unable to register instance");
            return Ok(None);
        };
        let id = self.next_id;
        self.next_id += 1;
        self.holders.insert(id, InstanceHolder::new(data, handle));
        debug!(topic = T::TOPIC, handle = %handle, identity = ?identity, "instance registered");
        Ok(Some(HolderRef::new(id)))
    }

    pub fn contains(&self, holder: HolderRef<T>) -> bool {
        self.holders.contains_key(&holder.id)
    }

    pub fn get(&self, holder: HolderRef<T>) -> Option<&InstanceHolder<T>> {
        self.holders.get(&holder.id)
    }

    /// The live holder behind `holder`, or [`DriverError::MissingHolder`].
    pub fn holder_mut(&mut self, holder: HolderRef<T>) -> Result<&mut InstanceHolder<T>, DriverError> {
        self.holders.get_mut(&holder.id).ok_or(DriverError::MissingHolder {
            kind: T::TOPIC,
            holder: holder.id,
        })
    }

    /// Publish the holder's current data.
    pub fn write(&mut self, holder: HolderRef<T>) -> Result<(), DriverError> {
        let writer = Arc::clone(&self.writer);
        let entry = self.holder_mut(holder)?;
        writer.write(&entry.data, entry.handle)?;
        entry.written = true;
        Ok(())
    }

    /// Remove the holder and unregister its instance. Returns `false` for a
    /// stale ref.
    pub fn unregister(&mut self, holder: HolderRef<T>) -> bool {
        match self.holders.remove(&holder.id) {
            Some(entry) => {
                self.writer.unregister_instance(entry.handle);
                debug!(topic = T::TOPIC, handle = %entry.handle, "instance unregistered");
                true
            }
            None => false,
        }
    }

    /// Unregister every holder. Idempotent.
    pub fn unregister_all(&mut self) {
        while let Some((_, entry)) = self.holders.pop_first() {
            self.writer.unregister_instance(entry.handle);
        }
    }

    /// Reconcile `existing` with the requested identity.
    ///
    /// Returns the live holder the caller should publish into, or `None`
    /// when `present` is false or registration was rejected.
    pub fn upsert(
        &mut self,
        existing: Option<HolderRef<T>>,
        udi: &str,
        identity: &T::Identity,
        present: bool,
    ) -> Result<Option<HolderRef<T>>, DriverError> {
        let mut current = existing.filter(|r| self.contains(*r));
        if let Some(live) = current {
            let matches = self
                .get(live)
                .is_some_and(|h| h.data.udi() == udi && h.data.identity() == *identity);
            if !matches {
                self.unregister(live);
                current = None;
            }
        }
        if !present {
            if let Some(live) = current {
                self.unregister(live);
            }
            return Ok(None);
        }
        match current {
            Some(live) => Ok(Some(live)),
            None => self.create(udi, identity),
        }
    }

    pub fn len(&self) -> usize {
        self.holders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.holders.is_empty()
    }

    pub fn refs(&self) -> Vec<HolderRef<T>> {
        self.holders.keys().map(|id| HolderRef::new(*id)).collect()
    }
}
