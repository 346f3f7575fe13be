//! `icekit-device` – device sessions and the bundled simulated drivers.
//!
//! # Modules
//!
//! - [`clock`] – [`Reading`][clock::Reading]s, device clocks and the
//!   sample-array [`ResolutionTracker`][clock::ResolutionTracker].
//! - [`registry`] – [`InstanceRegistry`][registry::InstanceRegistry]: published
//!   instances keyed by identity, reused while the identity holds.
//! - [`alerts`] – [`AlertTable`][alerts::AlertTable]: keyed alerts with
//!   mark-and-sweep retraction.
//! - [`identity`] – [`DeviceIdentityBuilder`][identity::DeviceIdentityBuilder].
//! - [`session`] – [`DeviceSession`][session::DeviceSession]: everything one
//!   device publishes.
//! - [`connected`] – connection state machine and the
//!   [`ConnectedDevice`][connected::ConnectedDevice] lifecycle trait.
//! - [`monitor`] – objective subscriptions serviced by the event loop.
//! - [`simulated`] – base for simulated devices, with alarm-limit handling.
//! - [`pump`] – [`SimInfusionPump`][pump::SimInfusionPump].
//! - [`pulse_ox`] – [`SimPulseOximeter`][pulse_ox::SimPulseOximeter].

pub mod alerts;
pub mod clock;
pub mod connected;
pub mod identity;
pub mod monitor;
pub mod pulse_ox;
pub mod pump;
pub mod registry;
pub mod session;
pub mod simulated;

pub use clock::{DeviceClock, DomainClock, Reading};
pub use connected::{ConnectedDevice, ConnectedSession, ConnectionListener};
pub use identity::DeviceIdentityBuilder;
pub use pulse_ox::{SimPulseOximeter, Vital};
pub use pump::{PumpConfig, SimInfusionPump};
pub use registry::{HolderRef, InstanceRegistry, NumericIdentity, SampleArrayIdentity};
pub use session::{DeviceSession, SessionConfig};
pub use simulated::{SimulatedConnectedDevice, simulated_session};
