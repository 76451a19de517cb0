//! Host classification: OS, services, vendor and device type
//!
//! Every classifier is best-effort. When the evidence is not enough the
//! answer is [`UNKNOWN`], never an error.

pub mod device;
pub mod nmap;
pub mod os_fingerprinting;
pub mod service_detection;
pub mod vendor;

pub use device::{classify_device, DeviceEvidence, DeviceType};
pub use nmap::{NmapConfig, NmapEngine};
pub use os_fingerprinting::OsFingerprinter;
pub use service_detection::{ServiceDetector, ServiceInfo};
pub use vendor::VendorDatabase;

/// Label used when a classification cannot be made
pub const UNKNOWN: &str = "Unknown";
