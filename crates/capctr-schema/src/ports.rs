use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub const DEFAULT_PROTOCOL: &str = "tcp";

#[derive(Debug, Error)]
pub enum PortSpecError {
    #[error("invalid port in '{spec}': {reason}")]
    InvalidPort { spec: String, reason: String },
    #[error("unexpected port {0}")]
    NonPositivePort(i64),
    #[error("failed to parse '{0}', expected '<port>[/<protocol>]'")]
    Malformed(String),
    #[error("invalid port mapping label: {0}")]
    InvalidLabel(#[from] serde_json::Error),
}

/// A requested `port/protocol` pair, e.g. `6443/tcp`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortSpec {
    pub port: u16,
    pub protocol: String,
}

impl PortSpec {
    /// Parse `port[/protocol]`. The protocol defaults to `tcp` and is
    /// lower-cased; ports must be positive.
    pub fn parse(spec: &str) -> Result<Self, PortSpecError> {
        let mut parts = spec.split('/');
        let port_part = parts.next().unwrap_or_default();
        let port: i64 = port_part
            .trim()
            .parse()
            .map_err(|e: std::num::ParseIntError| PortSpecError::InvalidPort {
                spec: spec.to_owned(),
                reason: e.to_string(),
            })?;
        if port <= 0 {
            return Err(PortSpecError::NonPositivePort(port));
        }
        let port = u16::try_from(port).map_err(|e| PortSpecError::InvalidPort {
            spec: spec.to_owned(),
            reason: e.to_string(),
        })?;

        let protocol = match (parts.next(), parts.next()) {
            (None, _) => DEFAULT_PROTOCOL.to_owned(),
            (Some(proto), None) => proto.trim().to_lowercase(),
            (Some(_), Some(_)) => return Err(PortSpecError::Malformed(spec.to_owned())),
        };

        Ok(Self { port, protocol })
    }
}

impl fmt::Display for PortSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.port, self.protocol)
    }
}

/// One entry of the JSON-encoded port-mapping label.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PortMapping {
    pub host_port: i32,
    pub container_port: i32,
    #[serde(default)]
    pub protocol: String,
    #[serde(rename = "hostIP", default, skip_serializing_if = "String::is_empty")]
    pub host_ip: String,
}

impl PortMapping {
    pub fn new(container_port: i32, host_port: i32, protocol: &str) -> Self {
        Self {
            host_port,
            container_port,
            protocol: protocol.to_owned(),
            host_ip: String::new(),
        }
    }

    pub fn matches(&self, spec: &PortSpec) -> bool {
        self.container_port == i32::from(spec.port)
            && self.protocol.to_lowercase() == spec.protocol
    }
}

/// Decode the ports label. An empty label decodes to no mappings.
pub fn decode_port_mappings(label: &str) -> Result<Vec<PortMapping>, PortSpecError> {
    if label.trim().is_empty() {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_str(label)?)
}

pub fn encode_port_mappings(ports: &[PortMapping]) -> Result<String, PortSpecError> {
    Ok(serde_json::to_string(ports)?)
}

/// First mapping matching the requested container port and protocol.
pub fn find_host_port<'a>(ports: &'a [PortMapping], spec: &PortSpec) -> Option<&'a PortMapping> {
    ports.iter().find(|p| p.matches(spec))
}
