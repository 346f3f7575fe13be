//! Connected devices: a [`DeviceSession`] plus a connection state machine
//! whose every transition is published as [`DeviceConnectivity`].
//!
//! ```text
//!            ┌──────────────┐
//!  Initial ─►│  Connecting  │◄──────────────┐
//!            └──┬────────▲──┘               │
//!               ▼        │                  │
//!            ┌──────────────┐        ┌──────┴─────┐
//!            │ Negotiating  │───────►│ Connected  │
//!            │              │◄───────│            │
//!            └──────┬───────┘        └─────┬──────┘
//!                   ▼                      ▼
//!                 Terminal ◄───────────────┘   (also from Connecting)
//! ```
//!
//! Leaving `Connected` schedules
//! [`DeviceSession::unregister_all_instances`] on the session's event loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use icekit_kernel::{StateMachine, TransitionObserver};
use icekit_middleware::{DomainWriter, InstanceWriter};
use icekit_types::{
    ConnectionState, ConnectionType, DeviceConnectivity, DriverError, InstanceHandle,
};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::session::DeviceSession;

/// Legal connection-state transitions.
pub const CONNECTION_TRANSITIONS: [(ConnectionState, ConnectionState); 9] = [
    // connect requested
    (ConnectionState::Initial, ConnectionState::Connecting),
    // link established
    (ConnectionState::Connecting, ConnectionState::Negotiating),
    // link open, session lost
    (ConnectionState::Connected, ConnectionState::Negotiating),
    // link lost
    (ConnectionState::Connected, ConnectionState::Connecting),
    (ConnectionState::Negotiating, ConnectionState::Connected),
    (ConnectionState::Negotiating, ConnectionState::Connecting),
    (ConnectionState::Negotiating, ConnectionState::Terminal),
    (ConnectionState::Connecting, ConnectionState::Terminal),
    (ConnectionState::Connected, ConnectionState::Terminal),
];

/// Device hooks around every connection-state transition.
pub trait ConnectionListener: Send + Sync {
    /// Before the connectivity record is updated.
    fn state_changing(&self, _new: ConnectionState, _old: ConnectionState, _note: &str) {}

    /// After the record was published.
    fn state_changed(&self, _new: ConnectionState, _old: ConnectionState, _note: &str) {}
}

/// Lifecycle surface every connected device exposes.
pub trait ConnectedDevice: Send + Sync {
    /// Drive the device to `Connected`. Already connecting or connected is
    /// not an error.
    fn connect(&self, device_name: &str) -> Result<(), DriverError>;

    /// Drive the device to `Terminal`.
    fn disconnect(&self) -> Result<(), DriverError>;

    fn connection_type(&self) -> ConnectionType;

    fn state(&self) -> ConnectionState;

    /// Block until `state` is reached or `timeout` elapses.
    fn await_state(&self, state: ConnectionState, timeout: Duration) -> bool;

    /// Retract everything the device published. Idempotent.
    fn shutdown(&self);
}

// ────────────────────────────────────────────────────────────────────────────
// Connectivity publication
// ────────────────────────────────────────────────────────────────────────────

struct Connectivity {
    record: DeviceConnectivity,
    handle: Option<InstanceHandle>,
    writer: DomainWriter<DeviceConnectivity>,
}

impl Connectivity {
    fn publish(&mut self, udi: &str) -> Result<(), DriverError> {
        if udi.is_empty() {
            return Err(DriverError::Configuration(
                "cannot write device connectivity without a unique_device_identifier".to_string(),
            ));
        }
        self.record.unique_device_identifier = udi.to_string();
        let handle = match self.handle {
            Some(handle) => handle,
            None => {
                let Some(handle) = self.writer.register_instance(&self.record) else {
                    warn!(udi, "unable to register device connectivity");
                    return Ok(());
                };
                self.handle = Some(handle);
                handle
            }
        };
        self.writer.write(&self.record, handle)
    }
}

struct ConnectivityObserver {
    session: Weak<DeviceSession>,
    connectivity: Arc<Mutex<Connectivity>>,
    listener: Option<Weak<dyn ConnectionListener>>,
}

impl ConnectivityObserver {
    fn listener(&self) -> Option<Arc<dyn ConnectionListener>> {
        self.listener.as_ref().and_then(Weak::upgrade)
    }
}

impl TransitionObserver<ConnectionState> for ConnectivityObserver {
    fn emit(&self, new_state: ConnectionState, old_state: ConnectionState, note: &str) {
        let listener = self.listener();
        if let Some(listener) = &listener {
            listener.state_changing(new_state, old_state, note);
        }
        debug!(from = %old_state, to = %new_state, note, "connection state");

        let session = self.session.upgrade();
        {
            let mut connectivity = self.connectivity.lock();
            connectivity.record.state = new_state;
            connectivity.record.info = note.to_string();
            if let Some(handle) = connectivity.handle {
                if let Err(e) = connectivity.writer.write(&connectivity.record, handle) {
                    warn!(error = %e, "unable to publish device connectivity");
                }
            }
        }

        if old_state == ConnectionState::Connected && new_state != ConnectionState::Connected {
            if let Some(session) = &session {
                let weak = Arc::downgrade(session);
                session.event_loop().do_later(move || {
                    if let Some(session) = weak.upgrade() {
                        session.unregister_all_instances();
                    }
                });
            }
        }

        if let Some(listener) = &listener {
            listener.state_changed(new_state, old_state, note);
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// ConnectedSession
// ────────────────────────────────────────────────────────────────────────────

/// A [`DeviceSession`] with a connection state machine.
pub struct ConnectedSession {
    session: Arc<DeviceSession>,
    machine: StateMachine<ConnectionState>,
    connectivity: Arc<Mutex<Connectivity>>,
    shut_down: AtomicBool,
}

impl ConnectedSession {
    /// Wrap `session`. The machine starts in `Initial` and uses the
    /// session's transition policy.
    pub fn new(
        session: Arc<DeviceSession>,
        connection_type: ConnectionType,
        listener: Option<Weak<dyn ConnectionListener>>,
    ) -> Self {
        let connectivity = Arc::new(Mutex::new(Connectivity {
            record: DeviceConnectivity {
                state: ConnectionState::Initial,
                connection_type,
                ..Default::default()
            },
            handle: None,
            writer: session.bus().writer(),
        }));
        let observer = Arc::new(ConnectivityObserver {
            session: Arc::downgrade(&session),
            connectivity: Arc::clone(&connectivity),
            listener,
        });
        let machine = StateMachine::new("connection", &CONNECTION_TRANSITIONS, ConnectionState::Initial)
            .with_observer(observer)
            .with_policy(session.config().transition_policy);
        Self {
            session,
            machine,
            connectivity,
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn session(&self) -> &Arc<DeviceSession> {
        &self.session
    }

    pub fn machine(&self) -> &StateMachine<ConnectionState> {
        &self.machine
    }

    pub fn state(&self) -> ConnectionState {
        self.machine.state()
    }

    pub fn await_state(&self, state: ConnectionState, timeout: Duration) -> bool {
        self.machine.wait(state, timeout)
    }

    pub fn connection_type(&self) -> ConnectionType {
        self.connectivity.lock().record.connection_type
    }

    /// Snapshot of the connectivity record.
    pub fn connectivity(&self) -> DeviceConnectivity {
        self.connectivity.lock().record.clone()
    }

    /// Transition now if legal; see [`StateMachine::transition_if_legal`].
    pub fn transition_if_legal(&self, state: ConnectionState, note: &str) -> bool {
        self.machine.transition_if_legal(state, note)
    }

    /// Block until `state` is legal and transition. A transition that did
    /// not become legal in time is [`DriverError::ConnectionFailed`] under a
    /// non-fatal policy and [`DriverError::TransitionTimeout`] otherwise.
    pub fn transition_when_legal(&self, state: ConnectionState, note: &str, timeout: Duration) -> Result<(), DriverError> {
        match self.machine.transition_when_legal(state, note, Some(timeout))? {
            Some(_) => Ok(()),
            None => Err(DriverError::ConnectionFailed(format!("unable to enter {state}"))),
        }
    }

    /// Update the connectivity info and republish it if it changed.
    pub fn set_connection_info(&self, info: &str) -> Result<(), DriverError> {
        let udi = self.session.udi();
        let mut connectivity = self.connectivity.lock();
        if connectivity.record.info != info {
            connectivity.record.info = info.to_string();
            connectivity.publish(&udi)?;
        }
        Ok(())
    }

    /// Publish the identity, and the connectivity record if it was never
    /// registered.
    pub fn write_device_identity(&self) -> Result<(), DriverError> {
        self.session.write_device_identity()?;
        let udi = self.session.udi();
        let mut connectivity = self.connectivity.lock();
        if connectivity.handle.is_none() {
            connectivity.publish(&udi)?;
        }
        Ok(())
    }

    pub fn write_device_connectivity(&self) -> Result<(), DriverError> {
        let udi = self.session.udi();
        self.connectivity.lock().publish(&udi)
    }

    /// Dispose the connectivity record, then shut the session down.
    /// Idempotent.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        {
            let mut connectivity = self.connectivity.lock();
            if let Some(handle) = connectivity.handle.take() {
                connectivity.writer.dispose(handle);
            }
        }
        self.session.shutdown();
    }
}
