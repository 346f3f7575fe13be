//! [`DeviceIdentityBuilder`] – bootstrap a [`DeviceIdentity`] record.
//!
//! # Example
//!
//! ```
//! use icekit_device::identity::DeviceIdentityBuilder;
//!
//! let identity = DeviceIdentityBuilder::new()
//!     .udi("0123456789abcdef0123456789abcdef0123")
//!     .manufacturer("Simulated")
//!     .model("Pulse Oximeter")
//!     .software_rev()
//!     .build();
//! assert_eq!(identity.model, "Pulse Oximeter");
//! assert!(!identity.build.is_empty());
//! ```

use std::env;
use std::fs;
use std::path::Path;

use icekit_types::{DeviceIdentity, Image};
use tracing::warn;
use uuid::Uuid;

/// Environment variable that pins the UDI handed out by [`random_udi`].
pub const RANDOM_UDI_ENV: &str = "randomUDI";

const ICON_CONTENT_TYPE: &str = "image/png";

/// A fresh unique device identifier: `$randomUDI` when set and non-empty,
/// otherwise a 36-character UUID string.
pub fn random_udi() -> String {
    match env::var(RANDOM_UDI_ENV) {
        Ok(udi) if !udi.trim().is_empty() => udi.trim().to_string(),
        _ => Uuid::new_v4().to_string(),
    }
}

/// Description of the host OS: distribution name, architecture and kernel
/// release, bounded to [`DeviceIdentity::OPERATING_SYSTEM_MAX_LEN`].
pub fn os_name() -> String {
    let distribution = fs::read_to_string("/etc/os-release")
        .ok()
        .and_then(|contents| pretty_name(&contents))
        .unwrap_or_else(|| env::consts::OS.to_string());
    let release = fs::read_to_string("/proc/sys/kernel/osrelease")
        .map(|r| r.trim().to_string())
        .unwrap_or_default();
    let full = format!("{distribution} {} {release}", env::consts::ARCH);
    full.trim()
        .chars()
        .take(DeviceIdentity::OPERATING_SYSTEM_MAX_LEN)
        .collect()
}

fn pretty_name(os_release: &str) -> Option<String> {
    os_release.lines().find_map(|line| {
        let value = line.strip_prefix("PRETTY_NAME=")?;
        Some(value.trim().trim_matches('"').to_string())
    })
}

/// Builder for [`DeviceIdentity`].
#[derive(Debug, Clone, Default)]
pub struct DeviceIdentityBuilder {
    identity: DeviceIdentity,
}

impl DeviceIdentityBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn udi(mut self, udi: impl Into<String>) -> Self {
        self.identity.unique_device_identifier = udi.into();
        self
    }

    /// Use [`random_udi`].
    pub fn random_udi(self) -> Self {
        self.udi(random_udi())
    }

    pub fn manufacturer(mut self, manufacturer: impl Into<String>) -> Self {
        self.identity.manufacturer = manufacturer.into();
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.identity.model = model.into();
        self
    }

    pub fn serial_number(mut self, serial_number: impl Into<String>) -> Self {
        self.identity.serial_number = serial_number.into();
        self
    }

    /// Stamp the build string with this crate's version.
    pub fn software_rev(mut self) -> Self {
        self.identity.build = format!("icekit {}", env!("CARGO_PKG_VERSION"));
        self
    }

    pub fn build_string(mut self, build: impl Into<String>) -> Self {
        self.identity.build = build.into();
        self
    }

    /// Fill `operating_system` from [`os_name`].
    pub fn os_name(mut self) -> Self {
        self.identity.operating_system = os_name();
        self
    }

    /// Load icon bytes from `path`. A file that cannot be read leaves the
    /// icon empty and logs a warning.
    pub fn with_icon(mut self, path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match fs::read(path) {
            Ok(bytes) => {
                self.identity.icon = Image {
                    content_type: ICON_CONTENT_TYPE.to_string(),
                    image: bytes,
                };
            }
            Err(e) => warn!(path = %path.display(), error = %e, "unable to load device icon"),
        }
        self
    }

    pub fn build(self) -> DeviceIdentity {
        self.identity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pretty_name_is_unquoted() {
        let os_release = "NAME=\"Debian\"\nPRETTY_NAME=\"Debian GNU/Linux 12 (bookworm)\"\nID=debian\n";
        assert_eq!(pretty_name(os_release).as_deref(), Some("Debian GNU/Linux 12 (bookworm)"));
        assert_eq!(pretty_name("ID=alpine\n"), None);
    }

    #[test]
    fn os_name_is_bounded() {
        let name = os_name();
        assert!(!name.is_empty());
        assert!(name.chars().count() <= DeviceIdentity::OPERATING_SYSTEM_MAX_LEN);
    }

    #[test]
    fn generated_udi_is_uuid_shaped() {
        // Only meaningful when the override is not set in the test environment.
        if env::var(RANDOM_UDI_ENV).is_err() {
            assert_eq!(random_udi().len(), 36);
        }
    }

    #[test]
    fn missing_icon_leaves_icon_empty() {
        let identity = DeviceIdentityBuilder::new()
            .with_icon("/nonexistent/icon.png")
            .build();
        assert!(identity.icon.image.is_empty());
        assert!(identity.icon.content_type.is_empty());
    }

    #[test]
    fn builder_sets_fields() {
        let identity = DeviceIdentityBuilder::new()
            .udi("abc")
            .manufacturer("Acme")
            .model("Pump")
            .serial_number("42")
            .build_string("1.2.3")
            .build();
        assert_eq!(identity.unique_device_identifier, "abc");
        assert_eq!(identity.manufacturer, "Acme");
        assert_eq!(identity.serial_number, "42");
        assert_eq!(identity.build, "1.2.3");
    }
}
