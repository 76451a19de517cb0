//! Export of host profiles to JSON, CSV and XML
//!
//! Renders are pure functions over a profile slice. [`export_profiles`]
//! writes the rendered document through a temporary file in the destination
//! directory and renames it into place, so a failed export leaves nothing
//! behind.

use crate::error::{OpsError, OpsResult};
use crate::intelligence::{DeviceType, ServiceInfo};
use crate::mapping::HostProfile;
use chrono::{DateTime, Utc};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Write;
use std::net::Ipv4Addr;
use std::path::Path;

/// Export format options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExportFormat {
    Json,
    Csv,
    Xml,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::Csv => "csv",
            ExportFormat::Xml => "xml",
        }
    }

    /// Guess the format from a file extension
    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|ext| ext.to_str())
            .and_then(|ext| ext.parse().ok())
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl std::str::FromStr for ExportFormat {
    type Err = OpsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "csv" => Ok(ExportFormat::Csv),
            "xml" => Ok(ExportFormat::Xml),
            other => Err(OpsError::ExportError(format!("Unknown export format: {}", other))),
        }
    }
}

/// One host as it appears in an export
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostRecord {
    pub ip: Ipv4Addr,
    pub mac: String,
    pub hostname: String,
    pub os: String,
    pub vendor: String,
    pub device_type: DeviceType,
    pub ports: Vec<u16>,
    pub services: Vec<ServiceInfo>,
}

impl From<&HostProfile> for HostRecord {
    fn from(profile: &HostProfile) -> Self {
        Self {
            ip: profile.host.address,
            mac: profile.host.mac.clone().unwrap_or_default(),
            hostname: profile.host.display_name(),
            os: profile.os_guess.clone(),
            vendor: profile.vendor.clone(),
            device_type: profile.device_type,
            ports: profile.host.open_ports.clone(),
            services: profile.services.clone(),
        }
    }
}

/// JSON export document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkMapDocument {
    pub hosts: Vec<HostRecord>,
    pub timestamp: DateTime<Utc>,
}

impl NetworkMapDocument {
    pub fn new(profiles: &[HostProfile], timestamp: DateTime<Utc>) -> Self {
        Self {
            hosts: profiles.iter().map(HostRecord::from).collect(),
            timestamp,
        }
    }
}

pub fn render_json(profiles: &[HostProfile], timestamp: DateTime<Utc>) -> OpsResult<String> {
    Ok(serde_json::to_string_pretty(&NetworkMapDocument::new(profiles, timestamp))?)
}

pub fn render_csv(profiles: &[HostProfile]) -> OpsResult<String> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record([
        "IP", "MAC", "Hostname", "OS", "Vendor", "DeviceType", "Ports", "Services",
    ])?;

    for record in profiles.iter().map(HostRecord::from) {
        let ports = record
            .ports
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join(";");
        let services = record
            .services
            .iter()
            .map(|s| format!("{}/{}", s.port, s.label()))
            .collect::<Vec<_>>()
            .join(";");
        writer.write_record([
            record.ip.to_string(),
            record.mac,
            record.hostname,
            record.os,
            record.vendor,
            record.device_type.to_string(),
            ports,
            services,
        ])?;
    }

    let bytes = writer
        .into_inner()
        .map_err(|e| OpsError::ExportError(format!("CSV flush failed: {}", e)))?;
    String::from_utf8(bytes).map_err(|e| OpsError::ExportError(e.to_string()))
}

fn write_text_element<W: Write>(writer: &mut Writer<W>, name: &str, text: &str) -> OpsResult<()> {
    writer.write_event(Event::Start(BytesStart::new(name)))?;
    writer.write_event(Event::Text(BytesText::new(text)))?;
    writer.write_event(Event::End(BytesEnd::new(name)))?;
    Ok(())
}

pub fn render_xml(profiles: &[HostProfile], timestamp: DateTime<Utc>) -> OpsResult<String> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

    let stamp = timestamp.to_rfc3339();
    let mut root = BytesStart::new("NetworkMap");
    root.push_attribute(("timestamp", stamp.as_str()));
    writer.write_event(Event::Start(root))?;
    writer.write_event(Event::Start(BytesStart::new("Hosts")))?;

    for record in profiles.iter().map(HostRecord::from) {
        writer.write_event(Event::Start(BytesStart::new("Host")))?;
        write_text_element(&mut writer, "IP", &record.ip.to_string())?;
        write_text_element(&mut writer, "MAC", &record.mac)?;
        write_text_element(&mut writer, "Hostname", &record.hostname)?;
        write_text_element(&mut writer, "OS", &record.os)?;
        write_text_element(&mut writer, "Vendor", &record.vendor)?;
        write_text_element(&mut writer, "DeviceType", record.device_type.as_str())?;

        writer.write_event(Event::Start(BytesStart::new("Ports")))?;
        for port in &record.ports {
            write_text_element(&mut writer, "Port", &port.to_string())?;
        }
        writer.write_event(Event::End(BytesEnd::new("Ports")))?;

        writer.write_event(Event::Start(BytesStart::new("Services")))?;
        for service in &record.services {
            let port = service.port.to_string();
            let mut element = BytesStart::new("Service");
            element.push_attribute(("port", port.as_str()));
            if let Some(version) = &service.version {
                element.push_attribute(("version", version.as_str()));
            }
            writer.write_event(Event::Start(element))?;
            writer.write_event(Event::Text(BytesText::new(&service.name)))?;
            writer.write_event(Event::End(BytesEnd::new("Service")))?;
        }
        writer.write_event(Event::End(BytesEnd::new("Services")))?;

        writer.write_event(Event::End(BytesEnd::new("Host")))?;
    }

    writer.write_event(Event::End(BytesEnd::new("Hosts")))?;
    writer.write_event(Event::End(BytesEnd::new("NetworkMap")))?;

    String::from_utf8(writer.into_inner()).map_err(|e| OpsError::ExportError(e.to_string()))
}

/// Render in `format`
pub fn render(profiles: &[HostProfile], format: ExportFormat, timestamp: DateTime<Utc>) -> OpsResult<String> {
    match format {
        ExportFormat::Json => render_json(profiles, timestamp),
        ExportFormat::Csv => render_csv(profiles),
        ExportFormat::Xml => render_xml(profiles, timestamp),
    }
}

/// Atomically replace `path` with the rendered document
pub fn write_atomic(path: &Path, contents: &str) -> OpsResult<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut file = tempfile::NamedTempFile::new_in(dir).map_err(|e| {
        OpsError::ExportError(format!("Cannot write to {}: {}", dir.display(), e))
    })?;
    file.write_all(contents.as_bytes())?;
    file.as_file().sync_all()?;
    file.persist(path)
        .map_err(|e| OpsError::ExportError(format!("Cannot create {}: {}", path.display(), e.error)))?;
    Ok(())
}

/// Render `profiles` and write them to `path`
pub fn export_profiles(profiles: &[HostProfile], format: ExportFormat, path: &Path) -> OpsResult<()> {
    let document = render(profiles, format, Utc::now())?;
    write_atomic(path, &document)?;
    log::info!(
        "Exported {} hosts as {} to {}",
        profiles.len(),
        format,
        path.display()
    );
    Ok(())
}
