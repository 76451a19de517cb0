//! Subnet-grouped topology tree

use super::HostProfile;
use crate::intelligence::DeviceType;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TopologyNode {
    Subnet {
        /// `a.b.c.0/24`
        prefix: String,
        host_count: usize,
    },
    Host {
        ip: Ipv4Addr,
        os: String,
        vendor: String,
        device_type: DeviceType,
        services: Vec<String>,
    },
}

impl fmt::Display for TopologyNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopologyNode::Subnet { prefix, host_count } => {
                write!(f, "SUBNET|{}|{} hosts", prefix, host_count)
            }
            TopologyNode::Host {
                ip,
                os,
                vendor,
                device_type,
                services,
            } => write!(
                f,
                "HOST|{}|{}|{}|{}|{}",
                ip,
                os,
                vendor,
                device_type,
                services.join(",")
            ),
        }
    }
}

fn subnet_of(ip: Ipv4Addr) -> Ipv4Addr {
    let [a, b, c, _] = ip.octets();
    Ipv4Addr::new(a, b, c, 0)
}

/// Group profiles by /24: one subnet node followed by its hosts, both in
/// the order they were first encountered
pub fn build_topology(profiles: &[HostProfile]) -> Vec<TopologyNode> {
    let mut order: Vec<Ipv4Addr> = Vec::new();
    let mut groups: HashMap<Ipv4Addr, Vec<&HostProfile>> = HashMap::new();

    for profile in profiles {
        let subnet = subnet_of(profile.host.address);
        groups
            .entry(subnet)
            .or_insert_with(|| {
                order.push(subnet);
                Vec::new()
            })
            .push(profile);
    }

    let mut nodes = Vec::with_capacity(order.len() + profiles.len());
    for subnet in order {
        let members = groups.remove(&subnet).unwrap_or_default();
        nodes.push(TopologyNode::Subnet {
            prefix: format!("{}/24", subnet),
            host_count: members.len(),
        });
        nodes.extend(members.into_iter().map(|profile| TopologyNode::Host {
            ip: profile.host.address,
            os: profile.os_guess.clone(),
            vendor: profile.vendor.clone(),
            device_type: profile.device_type,
            services: profile.services.iter().map(|s| s.label()).collect(),
        }));
    }
    nodes
}
