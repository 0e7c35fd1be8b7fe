//! Subset of the OCI runtime-spec `config.json` that the driver reads and
//! rewrites. Reference: <https://github.com/opencontainers/runtime-spec/blob/main/config.md>

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const OCI_VERSION: &str = "1.1.0";

/// Container runtime configuration as stored by the engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Spec {
    #[serde(default)]
    pub oci_version: String,

    /// Container process; exec processes start from a copy of it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process: Option<Process>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<Mount>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

/// Process configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Process {
    #[serde(default)]
    pub terminal: bool,

    #[serde(default)]
    pub user: User,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    /// `KEY=VALUE` entries.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,

    /// Working directory; must be absolute.
    pub cwd: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Capabilities>,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub no_new_privileges: bool,
}

impl Default for Process {
    fn default() -> Self {
        Self {
            terminal: false,
            user: User::default(),
            args: vec!["sh".to_owned()],
            env: vec![
                "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".to_owned(),
            ],
            cwd: "/".to_owned(),
            capabilities: None,
            no_new_privileges: false,
        }
    }
}

/// Linux capability sets, each a list of `CAP_*` names.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Capabilities {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bounding: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub effective: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inheritable: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub permitted: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ambient: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct User {
    #[serde(default)]
    pub uid: u32,
    #[serde(default)]
    pub gid: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_gids: Vec<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Mount {
    pub destination: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub mount_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

impl Mount {
    /// Read-write or read-only bind mount of a host path.
    pub fn bind(source: &str, destination: &str, read_only: bool) -> Self {
        let mode = if read_only { "ro" } else { "rw" };
        Self {
            destination: destination.to_owned(),
            mount_type: Some("bind".to_owned()),
            source: Some(source.to_owned()),
            options: vec!["rbind".to_owned(), mode.to_owned()],
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.options.iter().any(|o| o == "ro")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_engine_spec_json() {
        let json = r#"{
            "ociVersion": "1.1.0",
            "process": {
                "user": {"uid": 0, "gid": 0},
                "args": ["/usr/local/bin/entrypoint", "/sbin/init"],
                "env": ["PATH=/usr/bin", "container=containerd"],
                "cwd": "/",
                "capabilities": {"bounding": ["CAP_CHOWN"], "effective": ["CAP_CHOWN"]},
                "noNewPrivileges": true
            },
            "hostname": "worker-0",
            "mounts": [{"destination": "/proc", "type": "proc", "source": "proc"}],
            "linux": {"namespaces": [{"type": "pid"}]}
        }"#;
        let spec: Spec = serde_json::from_str(json).unwrap();
        let process = spec.process.unwrap();
        assert_eq!(process.args.len(), 2);
        assert!(process.no_new_privileges);
        assert_eq!(
            process.capabilities.unwrap().bounding,
            vec!["CAP_CHOWN".to_owned()]
        );
        assert_eq!(spec.hostname.as_deref(), Some("worker-0"));
        assert_eq!(spec.mounts[0].mount_type.as_deref(), Some("proc"));
    }

    #[test]
    fn bind_mount_options() {
        let m = Mount::bind("/lib/modules", "/lib/modules", true);
        assert!(m.is_read_only());
        assert_eq!(m.mount_type.as_deref(), Some("bind"));
        assert!(!Mount::bind("/a", "/b", false).is_read_only());
    }

    #[test]
    fn default_process_runs_shell_at_root() {
        let p = Process::default();
        assert_eq!(p.cwd, "/");
        assert_eq!(p.args, vec!["sh".to_owned()]);
    }
}
