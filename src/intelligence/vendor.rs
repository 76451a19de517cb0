//! MAC vendor lookup by OUI prefix

use super::UNKNOWN;
use crate::error::OpsResult;
use crate::network::arp::normalize_mac;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::path::Path;

static BUILTIN_VENDORS: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        // Virtual machines
        ("00:50:56", "VMware"),
        ("08:00:27", "VirtualBox"),
        ("00:0C:29", "VMware"),
        ("00:1C:42", "Parallels"),
        ("00:15:5D", "Microsoft Hyper-V"),
        ("00:16:3E", "Xen"),
        ("52:54:00", "QEMU/KVM"),
        ("00:03:FF", "Microsoft Virtual PC"),
        // Network equipment
        ("00:1B:21", "Intel"),
        ("00:E0:4C", "Realtek"),
        ("00:90:27", "Intel"),
        ("00:A0:C9", "Intel"),
        ("00:13:72", "Dell"),
        ("00:14:22", "Dell"),
        ("00:1E:C9", "Cisco"),
        ("00:26:99", "Cisco"),
        ("00:50:E2", "Cisco"),
        // Common manufacturers
        ("00:23:6C", "Apple"),
        ("00:25:00", "Apple"),
        ("A4:C3:61", "Apple"),
        ("00:1A:A0", "Dell"),
        ("00:21:70", "Dell"),
        ("B8:AC:6F", "Dell"),
        ("00:1F:16", "Dell"),
        ("00:26:B9", "Dell"),
        ("18:03:73", "Dell"),
        ("00:15:17", "HP"),
        ("00:1B:78", "HP"),
        ("00:21:5A", "HP"),
        ("00:23:7D", "HP"),
        ("3C:4A:92", "HP"),
        ("70:10:6F", "HP"),
        ("00:50:8D", "Compaq"),
        ("00:80:5F", "Compaq"),
        ("00:02:B3", "Intel"),
        ("00:07:E9", "Intel"),
        ("00:13:02", "Intel"),
        ("00:15:00", "Intel"),
        ("00:16:76", "Intel"),
        ("00:19:D1", "Intel"),
        ("00:1E:67", "Intel"),
        ("00:21:6A", "Intel"),
        ("00:24:D7", "Intel"),
        ("3C:97:0E", "Intel"),
        ("A0:36:9F", "Intel"),
        ("00:60:97", "3Com"),
        ("00:A0:24", "3Com"),
        ("00:50:04", "3Com"),
    ])
});

/// Normalize an OUI written as `00:50:56`, `00-50-56` or `005056`
pub fn normalize_oui(raw: &str) -> Option<String> {
    let hex: String = raw
        .trim()
        .chars()
        .filter(|c| !matches!(c, ':' | '-' | '.'))
        .collect();
    if hex.len() < 6 || !hex.chars().take(6).all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    let hex = hex[..6].to_ascii_uppercase();
    Some(format!("{}:{}:{}", &hex[0..2], &hex[2..4], &hex[4..6]))
}

/// OUI table: built-in entries plus optional CSV extensions
#[derive(Debug, Clone)]
pub struct VendorDatabase {
    entries: HashMap<String, String>,
}

impl Default for VendorDatabase {
    fn default() -> Self {
        Self::builtin()
    }
}

impl VendorDatabase {
    /// Only the built-in table
    pub fn builtin() -> Self {
        let entries = BUILTIN_VENDORS
            .iter()
            .map(|(oui, vendor)| (oui.to_string(), vendor.to_string()))
            .collect();
        Self { entries }
    }

    /// Built-in table merged with `OUI,VendorName` rows from `path`
    pub fn with_csv<P: AsRef<Path>>(path: P) -> OpsResult<Self> {
        let mut db = Self::builtin();
        let reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_path(path.as_ref())?;
        let added = db.merge_csv(reader)?;
        log::info!(
            "Loaded {} vendor entries from {}",
            added,
            path.as_ref().display()
        );
        Ok(db)
    }

    /// Built-in table, plus `path` when it loads; a bad file only warns
    pub fn load_or_builtin(path: Option<&Path>) -> Self {
        match path {
            Some(path) => Self::with_csv(path).unwrap_or_else(|e| {
                log::warn!("Could not load vendor file {}: {}", path.display(), e);
                Self::builtin()
            }),
            None => Self::builtin(),
        }
    }

    /// Merge rows without overriding built-in entries; returns rows added
    pub fn merge_csv<R: std::io::Read>(&mut self, mut reader: csv::Reader<R>) -> OpsResult<usize> {
        let mut added = 0;
        for record in reader.records() {
            let record = record?;
            let (Some(oui), Some(vendor)) = (record.get(0), record.get(1)) else {
                continue;
            };
            let Some(oui) = normalize_oui(oui) else {
                continue;
            };
            if vendor.is_empty() || BUILTIN_VENDORS.contains_key(oui.as_str()) {
                continue;
            }
            if self.entries.insert(oui, vendor.to_string()).is_none() {
                added += 1;
            }
        }
        Ok(added)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Vendor for a MAC address, `"Unknown"` when nothing matches
    pub fn lookup(&self, mac: &str) -> String {
        let Some(oui) = normalize_mac(mac).map(|m| m[..8].to_string()) else {
            return UNKNOWN.to_string();
        };
        if let Some(vendor) = self.entries.get(&oui) {
            return vendor.clone();
        }
        if oui.starts_with("00:50:") || oui.starts_with("00:0C:") {
            "VMware (likely)".to_string()
        } else if oui.starts_with("08:00:") {
            "VirtualBox (likely)".to_string()
        } else {
            UNKNOWN.to_string()
        }
    }
}
