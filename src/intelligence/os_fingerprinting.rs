//! OS fingerprinting
//!
//! nmap's answer wins when it is available and says something; otherwise the
//! open-port signature decides. Results are plain labels such as `"Linux"`
//! or `"Windows (RDP)"`, and `"Unknown"` when nothing matches.

use super::nmap::NmapEngine;
use super::UNKNOWN;
use std::net::Ipv4Addr;
use std::sync::Arc;

/// Keyword families searched in free-form nmap output, most specific first
const OS_KEYWORDS: &[(&str, &str)] = &[
    ("windows 11", "Windows 11"),
    ("windows 10", "Windows 10"),
    ("windows 7", "Windows 7"),
    ("windows xp", "Windows XP"),
    ("windows server 2019", "Windows Server 2019"),
    ("windows server 2016", "Windows Server 2016"),
    ("windows", "Windows"),
    ("ubuntu", "Ubuntu Linux"),
    ("centos", "CentOS Linux"),
    ("red hat", "Red Hat Linux"),
    ("linux", "Linux"),
    ("mac os", "macOS"),
    ("macos", "macOS"),
    ("freebsd", "FreeBSD"),
    ("android", "Android"),
    ("ios", "iOS"),
];

/// Parse nmap `-O` output into a single OS label
pub fn parse_os_output(output: &str) -> Option<String> {
    for line in output.lines() {
        if let Some(details) = line.trim().strip_prefix("OS details:") {
            // "Linux 4.15 - 5.6, Linux 5.0" -> first candidate
            let first = details.split(',').next().unwrap_or_default().trim();
            if !first.is_empty() {
                return Some(first.to_string());
            }
        }
    }

    for line in output.lines() {
        if let Some(running) = line.trim().strip_prefix("Running:") {
            let running = running.trim();
            if !running.is_empty() {
                return Some(running.to_string());
            }
        }
    }

    let lower = output.to_ascii_lowercase();
    OS_KEYWORDS
        .iter()
        .find(|(keyword, _)| contains_word(&lower, keyword))
        .map(|(_, label)| label.to_string())
}

/// Substring match that refuses to fire inside a longer word
fn contains_word(haystack: &str, needle: &str) -> bool {
    haystack.match_indices(needle).any(|(start, _)| {
        let before = haystack[..start].chars().next_back();
        let after = haystack[start + needle.len()..].chars().next();
        !before.map_or(false, char::is_alphanumeric) && !after.map_or(false, char::is_alphanumeric)
    })
}

/// Ordered open-port signature table
pub fn guess_from_ports(open_ports: &[u16]) -> String {
    let has = |port: u16| open_ports.contains(&port);

    let guess = if has(3389) {
        "Windows (RDP)"
    } else if has(135) || has(445) {
        "Windows"
    } else if has(548) {
        "macOS (AFP)"
    } else if has(22) && has(111) {
        "Linux (NFS)"
    } else if has(22) {
        "Linux"
    } else {
        UNKNOWN
    };
    guess.to_string()
}

/// OS guesser with optional nmap delegation
#[derive(Debug, Clone, Default)]
pub struct OsFingerprinter {
    nmap: Option<Arc<NmapEngine>>,
}

impl OsFingerprinter {
    pub fn new(nmap: Option<Arc<NmapEngine>>) -> Self {
        Self { nmap }
    }

    pub async fn detect(&self, target: Ipv4Addr, open_ports: &[u16]) -> String {
        if let Some(nmap) = &self.nmap {
            if nmap.is_available().await {
                match nmap.os_scan(target).await {
                    Ok(output) => {
                        if let Some(os) = parse_os_output(&output.stdout) {
                            log::debug!("nmap identified {} as {}", target, os);
                            return os;
                        }
                    }
                    Err(e) => log::debug!("nmap OS scan of {} failed: {}", target, e),
                }
            }
        }
        guess_from_ports(open_ports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_os_details_takes_first_candidate() {
        let output = "\
Device type: general purpose
Running: Linux 4.X|5.X
OS details: Linux 4.15 - 5.6, Linux 5.0 - 5.4
Network Distance: 1 hop";
        assert_eq!(parse_os_output(output).as_deref(), Some("Linux 4.15 - 5.6"));
    }

    #[test]
    fn test_running_line_fallback() {
        let output = "Running (JUST GUESSING): Microsoft Windows 2016\nRunning: Microsoft Windows 10";
        assert_eq!(
            parse_os_output(output).as_deref(),
            Some("Microsoft Windows 10")
        );
    }

    #[test]
    fn test_keyword_fallback() {
        assert_eq!(
            parse_os_output("Aggressive OS guesses: Windows Server 2019 (96%)").as_deref(),
            Some("Windows Server 2019")
        );
        assert_eq!(
            parse_os_output("guess: FreeBSD 12.1").as_deref(),
            Some("FreeBSD")
        );
        // "ios" must not fire inside "scenarios" or "bios"
        assert_eq!(parse_os_output("no exact scenarios matched, bios unknown"), None);
        assert_eq!(parse_os_output("Note: Host seems down."), None);
    }

    #[test]
    fn test_port_signature_precedence() {
        assert_eq!(guess_from_ports(&[22, 3389, 445]), "Windows (RDP)");
        assert_eq!(guess_from_ports(&[22, 445]), "Windows");
        assert_eq!(guess_from_ports(&[22, 548]), "macOS (AFP)");
        assert_eq!(guess_from_ports(&[22, 111]), "Linux (NFS)");
        assert_eq!(guess_from_ports(&[22, 80]), "Linux");
        assert_eq!(guess_from_ports(&[80, 443]), "Unknown");
    }

    #[tokio::test]
    async fn test_detect_without_nmap_uses_ports() {
        let fingerprinter = OsFingerprinter::new(None);
        assert_eq!(
            fingerprinter.detect(Ipv4Addr::LOCALHOST, &[135]).await,
            "Windows"
        );
    }
}
