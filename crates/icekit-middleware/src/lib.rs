//! `icekit-middleware` – the interconnect plumbing.
//!
//! Carries typed records between device drivers and whoever listens, without
//! caring what the records mean.
//!
//! # Modules
//!
//! - [`condition`] – triggerable conditions and the wait sets that block on
//!   them.
//! - [`adapter`] – the publish ([`InstanceWriter`]) and subscribe
//!   ([`Sample`]) surfaces device code is written against.
//! - [`bus`] – [`DomainBus`], the in-process transport implementing both
//!   surfaces.

pub mod adapter;
pub mod bus;
pub mod condition;

pub use adapter::{InstanceWriter, Sample, SampleInfo};
pub use bus::{BusConfig, DataReader, DomainBus, DomainWriter};
pub use condition::{Condition, GuardCondition, WaitSet};
