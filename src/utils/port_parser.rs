//! Port specification parsing
//!
//! `"22,80;443 8000-8010"` style lists. Bad tokens are skipped silently and
//! parsing carries on with the rest of the list.

use super::target_parser::TOKEN_SEPARATOR;
use std::collections::BTreeSet;

/// Parse a port list into a sorted, deduplicated vector
pub fn parse_ports(spec: &str) -> Vec<u16> {
    let mut ports = BTreeSet::new();

    for token in TOKEN_SEPARATOR.split(spec.trim()).filter(|t| !t.is_empty()) {
        if let Some((start, end)) = token.split_once('-') {
            if let (Some(start), Some(end)) = (parse_port(start), parse_port(end)) {
                if start <= end {
                    ports.extend(start..=end);
                }
            }
        } else if let Some(port) = parse_port(token) {
            ports.insert(port);
        }
    }

    ports.into_iter().collect()
}

fn parse_port(value: &str) -> Option<u16> {
    match value.trim().parse::<u16>() {
        Ok(0) | Err(_) => None,
        Ok(port) => Some(port),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mixed_list() {
        assert_eq!(parse_ports("443, 22;80 20-23"), vec![20, 21, 22, 23, 80, 443]);
    }

    #[test]
    fn test_invalid_tokens_dropped() {
        assert_eq!(parse_ports("abc,0,70000,100-90,8080,1-,5"), vec![5, 8080]);
        assert!(parse_ports("").is_empty());
    }

    #[test]
    fn test_full_range_bounds() {
        let ports = parse_ports("65530-65535");
        assert_eq!(ports.len(), 6);
        assert_eq!(*ports.last().unwrap(), 65535);
        assert!(parse_ports("65530-65536").is_empty());
    }
}
