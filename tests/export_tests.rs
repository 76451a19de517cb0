//! Export format and atomic write tests

use chrono::{TimeZone, Utc};
use netsecops::{
    intelligence::{DeviceType, ServiceInfo},
    mapping::HostProfile,
    network::HostResult,
    output::{self, ExportFormat, HostRecord, NetworkMapDocument},
    OpsError,
};
use std::net::Ipv4Addr;
use tempfile::TempDir;

fn profile(last: u8, ports: &[u16], device_type: DeviceType) -> HostProfile {
    let mut host = HostResult::offline(Ipv4Addr::new(192, 168, 1, last));
    host.is_online = true;
    host.open_ports = ports.to_vec();
    host.hostname = Some(format!("host-{}", last));
    host.mac = Some(format!("00:50:56:00:00:{:02X}", last));
    HostProfile {
        host,
        os_guess: "Windows".to_string(),
        vendor: "VMware".to_string(),
        device_type,
        services: ports
            .iter()
            .map(|&port| ServiceInfo {
                port,
                name: format!("svc{}", port),
                version: (port == 445).then(|| "SMBv3".to_string()),
            })
            .collect(),
    }
}

fn sample() -> Vec<HostProfile> {
    vec![
        profile(10, &[135, 445, 3389], DeviceType::Workstation),
        profile(20, &[9100], DeviceType::Printer),
    ]
}

#[test]
fn test_json_document_shape() {
    let stamp = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
    let json = output::render_json(&sample(), stamp).unwrap();
    let value: serde_json::Value = serde_json::from_str(&json).unwrap();

    let host = &value["hosts"][0];
    assert_eq!(host["ip"], "192.168.1.10");
    assert_eq!(host["mac"], "00:50:56:00:00:0A");
    assert_eq!(host["hostname"], "host-10");
    assert_eq!(host["deviceType"], "workstation");
    assert_eq!(host["ports"], serde_json::json!([135, 445, 3389]));
    assert_eq!(host["services"][0]["port"], 135);
    assert_eq!(value["timestamp"], "2024-05-01T12:00:00Z");

    assert_eq!(host["services"][1]["version"], "SMBv3");
    assert!(host["services"][0]["version"].is_null());

    let document: NetworkMapDocument = serde_json::from_str(&json).unwrap();
    let expected: Vec<HostRecord> = sample().iter().map(HostRecord::from).collect();
    assert_eq!(document.hosts, expected);
    assert_eq!(document.hosts[0].services[1].version.as_deref(), Some("SMBv3"));
    assert_eq!(document.hosts[0].services[0].version, None);
    assert_eq!(document.timestamp, stamp);
}

#[test]
fn test_xml_document_structure() {
    let stamp = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
    let xml = output::render_xml(&sample(), stamp).unwrap();

    assert!(xml.starts_with(r#"<?xml version="1.0" encoding="UTF-8"?>"#));
    assert!(xml.contains(r#"<NetworkMap timestamp="2024-05-01T12:00:00+00:00">"#));
    assert_eq!(xml.matches("<Host>").count(), 2);
    assert!(xml.contains("<DeviceType>printer</DeviceType>"));
    assert!(xml.contains("<Port>9100</Port>"));
    assert!(xml.trim_end().ends_with("</NetworkMap>"));
}

#[test]
fn test_export_writes_each_format() {
    let dir = TempDir::new().unwrap();
    for format in [ExportFormat::Json, ExportFormat::Csv, ExportFormat::Xml] {
        let path = dir.path().join(format!("map.{}", format.extension()));
        output::export_profiles(&sample(), format, &path).unwrap();
        assert!(std::fs::metadata(&path).unwrap().len() > 0);
    }

    // Only the three exports; no temp files left over
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 3);
}

#[test]
fn test_export_replaces_existing_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("map.csv");
    std::fs::write(&path, "stale").unwrap();

    output::export_profiles(&sample()[..1], ExportFormat::Csv, &path).unwrap();
    let csv = std::fs::read_to_string(&path).unwrap();
    assert!(!csv.contains("stale"));
    assert_eq!(csv.lines().count(), 2);
}

#[test]
fn test_unwritable_destination_leaves_no_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("missing").join("map.json");

    let err = output::export_profiles(&sample(), ExportFormat::Json, &path).unwrap_err();
    assert!(matches!(err, OpsError::ExportError(_)));
    assert!(!path.exists());
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}
