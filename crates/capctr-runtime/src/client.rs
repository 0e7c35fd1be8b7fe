use crate::spec::{Process, Spec};
use crate::stdio::ProcessIo;
use crate::EngineError;
use async_trait::async_trait;
use capctr_schema::{labels, ContainerId, ExecId};
use chrono::{DateTime, Utc};
use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

/// Runtime defaults recorded in an image's config blob.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageConfig {
    #[serde(default)]
    pub entrypoint: Vec<String>,
    #[serde(default)]
    pub cmd: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub working_dir: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub stop_signal: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageRecord {
    /// Canonical reference, e.g. `docker.io/kindest/node:v1.29.2`.
    pub name: String,
    pub digest: String,
    #[serde(default)]
    pub config: ImageConfig,
}

/// Engine-side container metadata. Never cached by the driver.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContainerRecord {
    pub id: ContainerId,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub image: String,
    pub spec: Spec,
    #[serde(default)]
    pub snapshot_key: String,
    #[serde(default)]
    pub runtime: String,
    pub created_at: DateTime<Utc>,
}

impl ContainerRecord {
    pub fn name_label(&self) -> Option<&str> {
        self.labels.get(labels::NAME).map(String::as_str)
    }

    pub fn ports_label(&self) -> &str {
        self.labels.get(labels::PORTS).map_or("", String::as_str)
    }

    pub fn stop_signal_label(&self) -> Option<&str> {
        self.labels.get(labels::STOP_SIGNAL).map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Created,
    Running,
    Stopped,
    Paused,
    Pausing,
    Unknown,
}

impl TaskState {
    /// States in which the task may be deleted without killing it first.
    pub fn is_deletable(self) -> bool {
        matches!(self, Self::Created | Self::Stopped)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Paused => "paused",
            Self::Pausing => "pausing",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskStatus {
    pub state: TaskState,
    pub pid: u32,
    pub exit_status: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub exited_at: Option<DateTime<Utc>>,
}

impl TaskStatus {
    pub fn running(pid: u32, started_at: DateTime<Utc>) -> Self {
        Self {
            state: TaskState::Running,
            pid,
            exit_status: 0,
            started_at: Some(started_at),
            exited_at: None,
        }
    }

    pub fn stopped(code: u32, exited_at: DateTime<Utc>) -> Self {
        Self {
            state: TaskState::Stopped,
            pid: 0,
            exit_status: code,
            started_at: None,
            exited_at: Some(exited_at),
        }
    }

    pub fn with_state(state: TaskState) -> Self {
        Self {
            state,
            pid: 0,
            exit_status: 0,
            started_at: None,
            exited_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    pub code: u32,
    pub exited_at: Option<DateTime<Utc>>,
}

impl ExitStatus {
    pub fn success(self) -> bool {
        self.code == 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InterfaceAddress {
    pub ip: std::net::IpAddr,
    pub prefix_len: u8,
}

/// An interface inside the container's network namespace, keyed by the
/// network it is attached to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkInterface {
    pub network: String,
    pub name: String,
    #[serde(default)]
    pub mac: String,
    #[serde(default)]
    pub addresses: Vec<InterfaceAddress>,
}

/// Operations the driver needs from a containerd-style engine.
///
/// Every call is scoped to an engine namespace. Implementations must be safe
/// to share across tasks; the driver holds them as `Arc<dyn EngineClient>`.
#[async_trait]
pub trait EngineClient: Send + Sync {
    fn name(&self) -> &str;

    /// Images whose canonical name equals `name` exactly.
    async fn list_images(&self, namespace: &str, name: &str)
        -> Result<Vec<ImageRecord>, EngineError>;

    /// Fetch and unpack an image, blocking until it is ready.
    async fn pull_image(&self, namespace: &str, reference: &str)
        -> Result<ImageRecord, EngineError>;

    /// Write an image archive to `dest`.
    async fn export_image(
        &self,
        namespace: &str,
        reference: &str,
        dest: &Path,
    ) -> Result<(), EngineError>;

    async fn list_containers(&self, namespace: &str) -> Result<Vec<ContainerId>, EngineError>;

    async fn container_info(
        &self,
        namespace: &str,
        id: &ContainerId,
    ) -> Result<ContainerRecord, EngineError>;

    async fn create_container(
        &self,
        namespace: &str,
        record: ContainerRecord,
    ) -> Result<ContainerRecord, EngineError>;

    /// Delete container metadata, optionally removing its snapshot too.
    async fn delete_container(
        &self,
        namespace: &str,
        id: &ContainerId,
        cleanup_snapshot: bool,
    ) -> Result<(), EngineError>;

    async fn create_task(&self, namespace: &str, id: &ContainerId) -> Result<(), EngineError>;

    /// Start the container's task and return its pid.
    async fn start_task(&self, namespace: &str, id: &ContainerId) -> Result<u32, EngineError>;

    /// Status of the container's task, `None` when it has no task.
    async fn task_status(
        &self,
        namespace: &str,
        id: &ContainerId,
    ) -> Result<Option<TaskStatus>, EngineError>;

    /// Deliver `signal` to the task's init process, or to every process in
    /// the task when `all` is set.
    async fn kill_task(
        &self,
        namespace: &str,
        id: &ContainerId,
        signal: Signal,
        all: bool,
    ) -> Result<(), EngineError>;

    async fn delete_task(&self, namespace: &str, id: &ContainerId)
        -> Result<ExitStatus, EngineError>;

    /// Register an exec process in a running task. The engine owns `io` until
    /// the process is deleted.
    async fn exec_process(
        &self,
        namespace: &str,
        id: &ContainerId,
        exec_id: &ExecId,
        process: Process,
        io: ProcessIo,
    ) -> Result<(), EngineError>;

    async fn start_process(
        &self,
        namespace: &str,
        id: &ContainerId,
        exec_id: &ExecId,
    ) -> Result<(), EngineError>;

    /// Resolves once the exec process has exited.
    async fn wait_process(
        &self,
        namespace: &str,
        id: &ContainerId,
        exec_id: &ExecId,
    ) -> Result<ExitStatus, EngineError>;

    async fn kill_process(
        &self,
        namespace: &str,
        id: &ContainerId,
        exec_id: &ExecId,
        signal: Signal,
    ) -> Result<(), EngineError>;

    async fn close_process_stdin(
        &self,
        namespace: &str,
        id: &ContainerId,
        exec_id: &ExecId,
    ) -> Result<(), EngineError>;

    async fn delete_process(
        &self,
        namespace: &str,
        id: &ContainerId,
        exec_id: &ExecId,
    ) -> Result<(), EngineError>;

    /// Interfaces of the task's network namespace.
    async fn network_interfaces(
        &self,
        namespace: &str,
        id: &ContainerId,
    ) -> Result<Vec<NetworkInterface>, EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(labels: &[(&str, &str)]) -> ContainerRecord {
        ContainerRecord {
            id: ContainerId::from("0123456789ab"),
            labels: labels
                .iter()
                .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
                .collect(),
            image: "docker.io/kindest/node:v1.29.2".to_owned(),
            spec: Spec::default(),
            snapshot_key: String::new(),
            runtime: String::new(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn label_accessors() {
        let r = record(&[(labels::NAME, "cp-0"), (labels::STOP_SIGNAL, "SIGRTMIN+3")]);
        assert_eq!(r.name_label(), Some("cp-0"));
        assert_eq!(r.stop_signal_label(), Some("SIGRTMIN+3"));
        assert_eq!(r.ports_label(), "");
    }

    #[test]
    fn deletable_states() {
        assert!(TaskState::Created.is_deletable());
        assert!(TaskState::Stopped.is_deletable());
        assert!(!TaskState::Running.is_deletable());
        assert!(!TaskState::Paused.is_deletable());
        assert!(!TaskState::Unknown.is_deletable());
    }

    #[test]
    fn task_state_serde_is_lowercase() {
        let json = serde_json::to_string(&TaskState::Running).unwrap();
        assert_eq!(json, "\"running\"");
        assert_eq!(TaskState::Pausing.to_string(), "pausing");
    }
}
