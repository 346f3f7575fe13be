use std::thread;
use std::time::{Duration, Instant};

use icekit_device::SessionConfig;

/// Poll `done` every few milliseconds for up to two seconds.
pub fn wait_for(mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !done() {
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
    true
}

pub fn quiet_session() -> SessionConfig {
    SessionConfig {
        averaging_period: None,
        ..Default::default()
    }
}
