//! Publish and subscribe surfaces.
//!
//! Device code never talks to a transport directly. It registers, writes and
//! unregisters bus instances through [`InstanceWriter`], and consumes
//! [`Sample`]s from a reader. [`DomainBus`][crate::bus::DomainBus] is the
//! in-process implementation; another transport only has to provide an
//! [`InstanceWriter`] per topic.

use icekit_types::{DriverError, InstanceHandle, TopicType};

/// Publish side of one topic.
///
/// # Contract
///
/// * `register_instance` – idempotent per instance key. `None` means the
///   transport rejected the instance; the caller logs and carries on without
///   publishing it.
/// * `write` – publishes `data` for an instance registered earlier.
/// * `unregister_instance` – the writer gives up the instance; readers see a
///   not-alive sample.
/// * `dispose` – marks the instance not-alive but keeps the registration.
pub trait InstanceWriter<T: TopicType>: Send + Sync {
    fn register_instance(&self, data: &T) -> Option<InstanceHandle>;

    fn unregister_instance(&self, handle: InstanceHandle);

    fn write(&self, data: &T, handle: InstanceHandle) -> Result<(), DriverError>;

    fn dispose(&self, handle: InstanceHandle);
}

/// Per-sample metadata delivered with every taken sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleInfo {
    /// `false` for lifecycle-only samples; `data` then carries only the key.
    pub valid: bool,
    /// First alive sample this reader sees for the instance.
    pub view_new: bool,
    /// `false` once the writer unregistered or disposed the instance.
    pub instance_alive: bool,
}

/// One taken sample.
#[derive(Debug, Clone)]
pub struct Sample<T> {
    pub info: SampleInfo,
    pub data: T,
}

impl<T> Sample<T> {
    /// Data carrying a live payload.
    pub fn is_valid_alive(&self) -> bool {
        self.info.valid && self.info.instance_alive
    }
}
