//! Configuration and value types for the capctr container driver.
//!
//! This crate defines the schema layer: the TOML driver configuration
//! (`DriverConfig`), docker-style image references (`ImageReference`),
//! `port/protocol` specs and the JSON port-mapping label (`PortSpec`,
//! `PortMapping`), well-known container labels, listing filters
//! (`ContainerFilter`) and identifier newtypes.

pub mod config;
pub mod filter;
pub mod labels;
pub mod ports;
pub mod reference;
pub mod types;

pub use config::{parse_config_file, parse_config_str, ConfigError, DriverConfig};
pub use filter::{ContainerFilter, FilterError};
pub use ports::{
    decode_port_mappings, encode_port_mappings, find_host_port, PortMapping, PortSpec,
    PortSpecError,
};
pub use reference::{ImageReference, ReferenceError};
pub use types::{ContainerId, ExecId};
