use crate::template::{render_with_fallback, Template, TemplateError};
use crate::{CoreError, Driver};
use capctr_runtime::ContainerRecord;
use capctr_schema::{decode_port_mappings, find_host_port, PortSpec};
use tracing::debug;

/// Concatenated IPv4 addresses of every attached network.
pub const IPV4_TEMPLATE: &str = "{{range.NetworkSettings.Networks}}{{.IPAddress}}{{end}}";
/// Concatenated global IPv6 addresses of every attached network.
pub const IPV6_TEMPLATE: &str =
    "{{range.NetworkSettings.Networks}}{{.GlobalIPv6Address}}{{end}}";

/// Host port published for `spec` according to the record's ports label.
/// A container without published ports yields an empty string.
pub fn host_port_for(record: &ContainerRecord, spec: &PortSpec) -> Result<String, CoreError> {
    let label = record.ports_label();
    if label.is_empty() {
        return Ok(String::new());
    }
    let mappings = decode_port_mappings(label)?;
    find_host_port(&mappings, spec)
        .map(|m| m.host_port.to_string())
        .ok_or_else(|| CoreError::NoHostPortFound {
            container: record.id.to_string(),
            port: spec.to_string(),
        })
}

impl Driver {
    /// Host port a published container port is reachable on.
    /// `port_and_protocol` is `port[/protocol]`, protocol defaulting to tcp.
    pub async fn get_host_port(
        &self,
        container: &str,
        port_and_protocol: &str,
    ) -> Result<String, CoreError> {
        let spec = PortSpec::parse(port_and_protocol)?;
        let record = self.resolve_one(container).await?;
        let port = host_port_for(&record, &spec)?;
        debug!("{spec} of {} is published on '{port}'", record.id);
        Ok(port)
    }

    /// IPv4 and IPv6 addresses of a running container, each the
    /// concatenation over its networks. A container that is not running has
    /// no network settings and fails with a template execution error.
    pub async fn get_container_ips(&self, container: &str) -> Result<(String, String), CoreError> {
        let record = self.resolve_one(container).await?;
        let inspect = self.inspect_record(&record).await?;
        if inspect.network_settings.is_none() {
            return Err(TemplateError::Render(format!(
                "container {} is {} and has no network settings",
                record.id, inspect.state.status
            ))
            .into());
        }
        let ipv4 = render_with_fallback(&Template::parse(IPV4_TEMPLATE)?, &inspect)?;
        let ipv6 = render_with_fallback(&Template::parse(IPV6_TEMPLATE)?, &inspect)?;
        Ok((ipv4, ipv6))
    }
}
