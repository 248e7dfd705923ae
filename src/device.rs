//! # Device Identity
//!
//! Describes the host once at startup; published to `devices/{userId}/{deviceId}`.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

const UNKNOWN: &str = "unknown";

/// Static description of the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceIdentity {
    pub device_id: String,
    pub brand: String,
    pub device: String,
    pub hardware: String,
    /// Build identifier (kernel release)
    pub id: String,
    pub manufacturer: String,
    pub model: String,
    pub product: String,
}

impl DeviceIdentity {
    /// Reads the identity of the running host.
    pub fn discover() -> Self {
        Self::discover_under(Path::new("/"))
    }

    /// Reads the identity from a filesystem rooted at `root`.
    ///
    /// Values that cannot be read become `"unknown"`.
    pub fn discover_under(root: &Path) -> Self {
        let read = |relative: &str| read_value(&root.join(relative));

        let vendor = read("sys/class/dmi/id/sys_vendor");
        let model = read("sys/class/dmi/id/product_name");
        let product = read("sys/class/dmi/id/product_family").or_else(|| model.clone());
        let device = read("etc/hostname").or_else(|| read("proc/sys/kernel/hostname"));

        let identity = Self {
            device_id: or_unknown(read("etc/machine-id")),
            brand: or_unknown(vendor.clone()),
            device: or_unknown(device),
            hardware: std::env::consts::ARCH.to_string(),
            id: or_unknown(read("proc/sys/kernel/osrelease")),
            manufacturer: or_unknown(vendor),
            model: or_unknown(model),
            product: or_unknown(product),
        };
        debug!("Device identity: {:?}", identity);
        identity
    }

    /// Store path of this device's record for `user_id`.
    pub fn record_path(&self, user_id: &str) -> String {
        format!("devices/{}/{}", user_id, self.device_id)
    }
}

fn read_value(path: &Path) -> Option<String> {
    let raw = fs::read_to_string(path).ok()?;
    let value = raw.trim();
    (!value.is_empty()).then(|| value.to_string())
}

fn or_unknown(value: Option<String>) -> String {
    value.unwrap_or_else(|| UNKNOWN.to_string())
}

#[cfg(test)]
pub mod mocks {
    use super::DeviceIdentity;

    pub fn test_identity() -> DeviceIdentity {
        DeviceIdentity {
            device_id: "machine-1".to_string(),
            brand: "Framework".to_string(),
            device: "tracker-host".to_string(),
            hardware: "x86_64".to_string(),
            id: "6.8.0".to_string(),
            manufacturer: "Framework".to_string(),
            model: "Laptop 13".to_string(),
            product: "Laptop".to_string(),
        }
    }
}
