//! Host discovery
//!
//! A [`DiscoveryCoordinator`] expands the target and port specifications,
//! probes every host through a [`crate::network::HostProbe`] on a bounded
//! pool and publishes per-host, progress and completion events.

pub mod coordinator;

pub use coordinator::{DiscoveryCoordinator, DiscoveryEvent};
