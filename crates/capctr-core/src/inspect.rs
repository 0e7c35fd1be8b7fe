//! Docker-compatible inspect view of a container.

use crate::{CoreError, Driver};
use capctr_runtime::{ContainerRecord, NetworkInterface, TaskState, TaskStatus};
use capctr_schema::decode_port_mappings;
use capctr_schema::labels::{self, display_name};
use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;
use tracing::debug;

const LOOPBACK_INTERFACE: &str = "lo";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerInspect {
    pub id: String,
    pub created: String,
    pub path: String,
    pub args: Vec<String>,
    pub state: ContainerState,
    pub image: String,
    pub name: String,
    pub platform: String,
    pub config: InspectConfig,
    pub mounts: Vec<MountPoint>,
    /// Present only while the task is running.
    pub network_settings: Option<NetworkSettings>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerState {
    pub status: String,
    pub running: bool,
    pub paused: bool,
    pub pid: u32,
    pub exit_code: u32,
    pub started_at: String,
    pub finished_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InspectConfig {
    pub hostname: String,
    pub labels: BTreeMap<String, String>,
    pub env: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MountPoint {
    #[serde(rename = "Type")]
    pub mount_type: String,
    pub source: String,
    pub destination: String,
    #[serde(rename = "RW")]
    pub rw: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSettings {
    #[serde(rename = "Ports")]
    pub ports: BTreeMap<String, Vec<PortBinding>>,
    #[serde(rename = "IPAddress")]
    pub ip_address: String,
    #[serde(rename = "GlobalIPv6Address")]
    pub global_ipv6_address: String,
    #[serde(rename = "MacAddress")]
    pub mac_address: String,
    /// Keyed by network name; an attached interface without addresses has no
    /// endpoint.
    #[serde(rename = "Networks")]
    pub networks: BTreeMap<String, Option<NetworkEndpoint>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkEndpoint {
    #[serde(rename = "IPAddress")]
    pub ip_address: String,
    #[serde(rename = "IPPrefixLen")]
    pub ip_prefix_len: u8,
    #[serde(rename = "GlobalIPv6Address")]
    pub global_ipv6_address: String,
    #[serde(rename = "GlobalIPv6PrefixLen")]
    pub global_ipv6_prefix_len: u8,
    #[serde(rename = "MacAddress")]
    pub mac_address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    #[serde(rename = "HostIp")]
    pub host_ip: String,
    #[serde(rename = "HostPort")]
    pub host_port: String,
}

fn is_global_v6(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V6(v6) => !v6.is_loopback() && (v6.segments()[0] & 0xffc0) != 0xfe80,
        IpAddr::V4(_) => false,
    }
}

impl NetworkEndpoint {
    fn from_interface(iface: &NetworkInterface) -> Option<Self> {
        if iface.addresses.is_empty() {
            return None;
        }
        let mut endpoint = Self {
            mac_address: iface.mac.clone(),
            ..Self::default()
        };
        if let Some(v4) = iface.addresses.iter().find(|a| a.ip.is_ipv4()) {
            endpoint.ip_address = v4.ip.to_string();
            endpoint.ip_prefix_len = v4.prefix_len;
        }
        if let Some(v6) = iface.addresses.iter().find(|a| is_global_v6(&a.ip)) {
            endpoint.global_ipv6_address = v6.ip.to_string();
            endpoint.global_ipv6_prefix_len = v6.prefix_len;
        }
        Some(endpoint)
    }
}

impl NetworkSettings {
    fn build(record: &ContainerRecord, interfaces: &[NetworkInterface]) -> Result<Self, CoreError> {
        let mut settings = Self::default();

        let label = record.ports_label();
        if !label.is_empty() {
            for mapping in decode_port_mappings(label)? {
                settings
                    .ports
                    .entry(format!("{}/{}", mapping.container_port, mapping.protocol))
                    .or_default()
                    .push(PortBinding {
                        host_ip: mapping.host_ip.clone(),
                        host_port: mapping.host_port.to_string(),
                    });
            }
        }

        for iface in interfaces.iter().filter(|i| i.name != LOOPBACK_INTERFACE) {
            let endpoint = NetworkEndpoint::from_interface(iface);
            if settings.ip_address.is_empty() {
                if let Some(ep) = endpoint.as_ref().filter(|ep| !ep.ip_address.is_empty()) {
                    settings.ip_address.clone_from(&ep.ip_address);
                    settings.global_ipv6_address.clone_from(&ep.global_ipv6_address);
                    settings.mac_address.clone_from(&ep.mac_address);
                }
            }
            settings.networks.insert(iface.network.clone(), endpoint);
        }
        Ok(settings)
    }
}

fn state_name(status: Option<&TaskStatus>) -> &'static str {
    match status.map(|s| s.state) {
        None | Some(TaskState::Created) => "created",
        Some(TaskState::Running) => "running",
        Some(TaskState::Stopped) => "exited",
        Some(TaskState::Paused | TaskState::Pausing) => "paused",
        Some(TaskState::Unknown) => "unknown",
    }
}

impl ContainerInspect {
    /// Assemble the inspect view from the engine's records. Network settings
    /// are filled only for a running task.
    pub fn from_engine(
        record: &ContainerRecord,
        status: Option<&TaskStatus>,
        interfaces: &[NetworkInterface],
    ) -> Result<Self, CoreError> {
        let process = record.spec.process.as_ref();
        let mut args = process.map(|p| p.args.clone()).unwrap_or_default();
        let path = if args.is_empty() {
            String::new()
        } else {
            args.remove(0)
        };
        let timestamp = |t: Option<chrono::DateTime<chrono::Utc>>| {
            t.map(|t| t.to_rfc3339_opts(SecondsFormat::Nanos, true))
                .unwrap_or_default()
        };
        let running = status.is_some_and(|s| s.state == TaskState::Running);

        let state = ContainerState {
            status: state_name(status).to_owned(),
            running,
            paused: status.is_some_and(|s| s.state == TaskState::Paused),
            pid: status.map_or(0, |s| s.pid),
            exit_code: status.map_or(0, |s| s.exit_status),
            started_at: timestamp(status.and_then(|s| s.started_at)),
            finished_at: timestamp(status.and_then(|s| s.exited_at)),
        };

        let hostname = record
            .spec
            .hostname
            .clone()
            .or_else(|| record.labels.get(labels::HOSTNAME).cloned())
            .unwrap_or_default();

        let mounts = record
            .spec
            .mounts
            .iter()
            .map(|m| MountPoint {
                mount_type: m.mount_type.clone().unwrap_or_default(),
                source: m.source.clone().unwrap_or_default(),
                destination: m.destination.clone(),
                rw: !m.is_read_only(),
            })
            .collect();

        let network_settings = if running {
            Some(NetworkSettings::build(record, interfaces)?)
        } else {
            None
        };

        Ok(Self {
            id: record.id.to_string(),
            created: record.created_at.to_rfc3339_opts(SecondsFormat::Nanos, true),
            path,
            args,
            state,
            image: record.image.clone(),
            name: display_name(&record.labels),
            platform: "linux".to_owned(),
            config: InspectConfig {
                hostname,
                labels: record.labels.clone(),
                env: process.map(|p| p.env.clone()).unwrap_or_default(),
            },
            mounts,
            network_settings,
        })
    }
}

impl Driver {
    /// Inspect the container `container` resolves to.
    pub async fn inspect(&self, container: &str) -> Result<ContainerInspect, CoreError> {
        let record = self.resolve_one(container).await?;
        self.inspect_record(&record).await
    }

    /// Gather task status and interfaces for `record`, bounded by the
    /// configured inspect timeout.
    pub(crate) async fn inspect_record(
        &self,
        record: &ContainerRecord,
    ) -> Result<ContainerInspect, CoreError> {
        let id = &record.id;
        let gather = async {
            let status = self
                .engine
                .task_status(&self.namespace, id)
                .await
                .map_err(|e| CoreError::engine(format!("get task status of {id}"), e))?;
            let interfaces = match &status {
                Some(s) if s.state == TaskState::Running => self
                    .engine
                    .network_interfaces(&self.namespace, id)
                    .await
                    .map_err(|e| CoreError::engine(format!("inspect network of {id}"), e))?,
                _ => Vec::new(),
            };
            ContainerInspect::from_engine(record, status.as_ref(), &interfaces)
        };

        let inspect = tokio::time::timeout(self.inspect_timeout, gather)
            .await
            .map_err(|_| CoreError::Timeout {
                op: format!("inspect {id}"),
                timeout: self.inspect_timeout,
            })??;
        debug!("inspected container {id} ({})", inspect.state.status);
        Ok(inspect)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::{render_with_fallback, Template};
    use capctr_runtime::{container_record, InterfaceAddress};
    use capctr_schema::{encode_port_mappings, PortMapping};
    use chrono::Utc;

    fn iface(network: &str, name: &str, addrs: &[(&str, u8)]) -> NetworkInterface {
        NetworkInterface {
            network: network.to_owned(),
            name: name.to_owned(),
            mac: "02:42:ac:12:00:02".to_owned(),
            addresses: addrs
                .iter()
                .map(|(ip, len)| InterfaceAddress {
                    ip: ip.parse().unwrap(),
                    prefix_len: *len,
                })
                .collect(),
        }
    }

    fn running() -> TaskStatus {
        TaskStatus::running(4242, Utc::now())
    }

    #[test]
    fn splits_path_and_args() {
        let record = container_record("abc123", "node-0", "docker.io/kindest/node:v1");
        let inspect = ContainerInspect::from_engine(&record, None, &[]).unwrap();
        assert_eq!(inspect.path, "/sbin/init");
        assert!(inspect.args.is_empty());
        assert_eq!(inspect.name, "node-0");
        assert_eq!(inspect.state.status, "created");
        assert!(inspect.network_settings.is_none());
        assert_eq!(inspect.config.hostname, "node-0");
    }

    #[test]
    fn network_settings_from_interfaces() {
        let mut record = container_record("abc123", "node-0", "img");
        let ports = encode_port_mappings(&[PortMapping::new(8080, 30080, "tcp")]).unwrap();
        record.labels.insert(labels::PORTS.to_owned(), ports);
        let ifaces = [
            iface("lo", "lo", &[("127.0.0.1", 8)]),
            iface(
                "kind",
                "eth0",
                &[("fe80::1", 64), ("172.18.0.2", 16), ("fc00:f853::2", 64)],
            ),
        ];
        let status = running();
        let inspect = ContainerInspect::from_engine(&record, Some(&status), &ifaces).unwrap();
        let settings = inspect.network_settings.unwrap();
        assert_eq!(settings.ip_address, "172.18.0.2");
        assert_eq!(settings.global_ipv6_address, "fc00:f853::2");
        let kind = settings.networks["kind"].as_ref().unwrap();
        assert_eq!(kind.ip_prefix_len, 16);
        assert_eq!(kind.global_ipv6_prefix_len, 64);
        assert!(!settings.networks.contains_key("lo"));
        assert_eq!(settings.ports["8080/tcp"][0].host_port, "30080");
    }

    #[test]
    fn serializes_docker_field_names() {
        let record = container_record("abc123", "node-0", "img");
        let status = running();
        let ifaces = [iface("kind", "eth0", &[("172.18.0.2", 16)])];
        let inspect = ContainerInspect::from_engine(&record, Some(&status), &ifaces).unwrap();
        let json = serde_json::to_value(&inspect).unwrap();
        assert_eq!(json["Id"], "abc123");
        assert_eq!(json["State"]["Running"], true);
        assert_eq!(
            json["NetworkSettings"]["Networks"]["kind"]["IPAddress"],
            "172.18.0.2"
        );
        assert!(json["NetworkSettings"]["Networks"]["kind"]["GlobalIPv6Address"]
            .as_str()
            .unwrap()
            .is_empty());
    }

    #[test]
    fn template_over_inspect() {
        let record = container_record("abc123", "node-0", "img");
        let status = running();
        let ifaces = [iface("kind", "eth0", &[("172.18.0.2", 16)])];
        let inspect = ContainerInspect::from_engine(&record, Some(&status), &ifaces).unwrap();
        let t = Template::parse("{{.Name}} {{.State.Pid}} {{.State.Running}}").unwrap();
        assert_eq!(t.render(&inspect).unwrap(), "node-0 4242 true");
        let t = Template::parse("{{.Config.Labels.missing}}").unwrap();
        assert!(render_with_fallback(&t, &inspect).unwrap_err().is_exec());
    }

    #[test]
    fn empty_endpoint_is_skipped_on_retry() {
        let record = container_record("abc123", "node-0", "img");
        let status = running();
        let ifaces = [
            iface("bridge", "eth1", &[]),
            iface("kind", "eth0", &[("172.18.0.2", 16)]),
        ];
        let inspect = ContainerInspect::from_engine(&record, Some(&status), &ifaces).unwrap();
        let t = Template::parse("{{range.NetworkSettings.Networks}}{{.IPAddress}}{{end}}").unwrap();
        assert!(t.render(&inspect).unwrap_err().is_exec());
        assert_eq!(render_with_fallback(&t, &inspect).unwrap(), "172.18.0.2");
    }

    #[test]
    fn stopped_container_has_no_network_settings() {
        let record = container_record("abc123", "node-0", "img");
        let status = TaskStatus::stopped(137, Utc::now());
        let inspect = ContainerInspect::from_engine(&record, Some(&status), &[]).unwrap();
        assert_eq!(inspect.state.status, "exited");
        assert_eq!(inspect.state.exit_code, 137);
        assert!(inspect.network_settings.is_none());
        let json = serde_json::to_value(&inspect).unwrap();
        assert!(json["NetworkSettings"].is_null());
    }
}
