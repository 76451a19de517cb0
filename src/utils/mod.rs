//! Input parsing helpers shared by every coordinator

pub mod port_parser;
pub mod target_parser;

pub use port_parser::parse_ports;
pub use target_parser::{expand, TargetParser, MAX_TARGETS};
