//! Device type classification
//!
//! The rule list is evaluated top to bottom and the first match wins. Order
//! matters: a Cisco box with HTTP and telnet on `.1` is a router, not a
//! phone, because the router rule comes first.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Router,
    Switch,
    Printer,
    Phone,
    Audio,
    Iot,
    Camera,
    Server,
    Workstation,
    Mac,
    Mobile,
    Computer,
    Unknown,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Router => "router",
            DeviceType::Switch => "switch",
            DeviceType::Printer => "printer",
            DeviceType::Phone => "phone",
            DeviceType::Audio => "audio",
            DeviceType::Iot => "iot",
            DeviceType::Camera => "camera",
            DeviceType::Server => "server",
            DeviceType::Workstation => "workstation",
            DeviceType::Mac => "mac",
            DeviceType::Mobile => "mobile",
            DeviceType::Computer => "computer",
            DeviceType::Unknown => "unknown",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the classifier gets to look at
#[derive(Debug, Clone, Copy)]
pub struct DeviceEvidence<'a> {
    pub ip: Ipv4Addr,
    pub open_ports: &'a [u16],
    pub vendor: &'a str,
}

impl DeviceEvidence<'_> {
    fn any_port(&self, ports: &[u16]) -> bool {
        ports.iter().any(|p| self.open_ports.contains(p))
    }

    fn has_port(&self, port: u16) -> bool {
        self.open_ports.contains(&port)
    }

    fn vendor_is_any(&self, vendors: &[&str]) -> bool {
        let vendor = self.vendor.to_ascii_lowercase();
        vendors.iter().any(|v| vendor.contains(&v.to_ascii_lowercase()))
    }
}

struct DeviceRule {
    device: DeviceType,
    matches: fn(&DeviceEvidence<'_>) -> bool,
}

const DEVICE_RULES: &[DeviceRule] = &[
    DeviceRule {
        device: DeviceType::Router,
        matches: |e| {
            let last = e.ip.octets()[3];
            (last == 1 || last == 254) && e.any_port(&[80, 443, 23])
        },
    },
    DeviceRule {
        device: DeviceType::Switch,
        matches: |e| e.has_port(23) && e.has_port(80) && !e.has_port(22),
    },
    DeviceRule {
        device: DeviceType::Printer,
        matches: |e| e.any_port(&[515, 631, 9100]) || e.vendor_is_any(&["HP", "Canon", "Epson", "Brother"]),
    },
    DeviceRule {
        device: DeviceType::Phone,
        matches: |e| {
            e.any_port(&[5060, 5061, 2000]) || (e.vendor_is_any(&["Cisco"]) && e.any_port(&[80, 443]))
        },
    },
    DeviceRule {
        device: DeviceType::Audio,
        matches: |e| e.any_port(&[554, 8080]) && e.vendor_is_any(&["Sonos", "Bose"]),
    },
    DeviceRule {
        device: DeviceType::Iot,
        matches: |e| e.any_port(&[1883, 8883]) || e.vendor_is_any(&["Nest", "Ring", "Philips"]),
    },
    DeviceRule {
        device: DeviceType::Camera,
        matches: |e| e.any_port(&[554, 8080, 80]) && e.vendor_is_any(&["Hikvision", "Dahua", "Axis"]),
    },
    DeviceRule {
        device: DeviceType::Server,
        matches: |e| e.has_port(22) && e.any_port(&[80, 443, 3306, 5432]),
    },
    DeviceRule {
        device: DeviceType::Workstation,
        matches: |e| e.any_port(&[3389, 135, 445]),
    },
    DeviceRule {
        device: DeviceType::Mac,
        matches: |e| e.any_port(&[548, 5900]),
    },
    DeviceRule {
        device: DeviceType::Mobile,
        matches: |e| e.vendor_is_any(&["Apple"]) && !e.has_port(22),
    },
];

/// First matching rule, `Computer` when none match
pub fn classify_device(evidence: &DeviceEvidence<'_>) -> DeviceType {
    DEVICE_RULES
        .iter()
        .find(|rule| (rule.matches)(evidence))
        .map(|rule| rule.device)
        .unwrap_or(DeviceType::Computer)
}
