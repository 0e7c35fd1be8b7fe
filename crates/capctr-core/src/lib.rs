//! Container lifecycle and exec driver.
//!
//! This crate ties the schema types and the engine boundary together into the
//! `Driver`: the API a cluster controller uses to pull images, run containers,
//! exec processes inside them with signal forwarding, kill and delete them
//! under task-state guards, list them, and extract ports, addresses, inspect
//! data and logs. Every name-addressed operation resolves the name to exactly
//! one container first.

pub mod driver;
pub mod exec;
pub mod image;
pub mod inspect;
pub mod lifecycle;
pub mod logs;
pub mod network;
pub mod resolve;
pub mod template;

pub use driver::Driver;
pub use exec::{merge_env, ExecRequest, ExecSession};
pub use inspect::{
    ContainerInspect, ContainerState, InspectConfig, MountPoint, NetworkEndpoint,
    NetworkSettings, PortBinding,
};
pub use lifecycle::{ContainerSummary, RunContainerInput};
pub use logs::{copy_json_log, log_path, LogEntry};
pub use network::{IPV4_TEMPLATE, IPV6_TEMPLATE};
pub use resolve::ResolutionResult;
pub use template::{render_with_fallback, Template, TemplateError};

use capctr_runtime::{EngineError, SignalError, TaskState};
use capctr_schema::{ConfigError, FilterError, PortSpecError, ReferenceError};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Coarse classification of [`CoreError`] for callers that branch on the
/// failure class rather than the exact cause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    /// The container exists but does not publish the requested port.
    PortNotPublished,
    Ambiguous,
    InvalidInput,
    EngineFailure,
    StateConflict,
    ExecNonZeroExit,
    ResourceUnavailable,
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("no such container: {0}")]
    NotFound(String),
    #[error("ambiguous container name '{name}': {count} containers match")]
    Ambiguous { name: String, count: usize },
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("failed to parse image reference: {0}")]
    InvalidReference(#[from] ReferenceError),
    #[error("signal error: {0}")]
    Signal(#[from] SignalError),
    #[error("invalid port: {0}")]
    InvalidPort(#[from] PortSpecError),
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("invalid filter: {0}")]
    Filter(#[from] FilterError),
    #[error("error listing images for '{reference}': {source}")]
    ImageQuery {
        reference: String,
        #[source]
        source: EngineError,
    },
    #[error("error pulling image '{reference}': {source}")]
    Pull {
        reference: String,
        #[source]
        source: EngineError,
    },
    #[error("{op}: {source}")]
    Engine {
        op: String,
        #[source]
        source: EngineError,
    },
    #[error("cannot delete a non stopped container '{container}': task is {state}")]
    CannotDeleteRunning { container: String, state: TaskState },
    #[error("container name '{0}' is already in use")]
    NameInUse(String),
    #[error("exec failed with exit code {code}")]
    ExecFailed { code: u32 },
    #[error("no host port found for {port} on container '{container}'")]
    NoHostPortFound { container: String, port: String },
    #[error(
        "failed to open {}, was this container started in detached mode?: {source}",
        path.display()
    )]
    LogUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("template error: {0}")]
    Template(#[from] TemplateError),
    #[error("{op} timed out after {}s", timeout.as_secs())]
    Timeout { op: String, timeout: Duration },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CoreError {
    /// Wrap an engine error with the operation that produced it.
    pub fn engine(op: impl Into<String>, source: EngineError) -> Self {
        Self::Engine {
            op: op.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::NoHostPortFound { .. } => ErrorKind::PortNotPublished,
            Self::Ambiguous { .. } => ErrorKind::Ambiguous,
            Self::InvalidInput(_)
            | Self::InvalidReference(_)
            | Self::Signal(SignalError::Invalid(_))
            | Self::Config(_)
            | Self::Filter(_) => ErrorKind::InvalidInput,
            Self::Template(e) if e.is_exec() => ErrorKind::EngineFailure,
            Self::Template(_) => ErrorKind::InvalidInput,
            Self::InvalidPort(PortSpecError::InvalidLabel(_)) => ErrorKind::EngineFailure,
            Self::InvalidPort(_) => ErrorKind::InvalidInput,
            Self::Engine { source, .. } if source.is_not_found() => ErrorKind::NotFound,
            Self::ImageQuery { .. }
            | Self::Pull { .. }
            | Self::Engine { .. }
            | Self::Timeout { .. }
            | Self::Json(_) => ErrorKind::EngineFailure,
            Self::CannotDeleteRunning { .. } | Self::NameInUse(_) => ErrorKind::StateConflict,
            Self::ExecFailed { .. } => ErrorKind::ExecNonZeroExit,
            Self::LogUnavailable { .. } | Self::Signal(SignalError::Listen { .. }) | Self::Io(_) => {
                ErrorKind::ResourceUnavailable
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_taxonomy() {
        assert_eq!(CoreError::NotFound("x".into()).kind(), ErrorKind::NotFound);
        assert_eq!(
            CoreError::Ambiguous {
                name: "x".into(),
                count: 2
            }
            .kind(),
            ErrorKind::Ambiguous
        );
        assert_eq!(
            CoreError::Signal(SignalError::Invalid("SIGFOO".into())).kind(),
            ErrorKind::InvalidInput
        );
        assert_eq!(
            CoreError::CannotDeleteRunning {
                container: "x".into(),
                state: TaskState::Running
            }
            .kind(),
            ErrorKind::StateConflict
        );
        assert_eq!(
            CoreError::NoHostPortFound {
                container: "x".into(),
                port: "80/tcp".into()
            }
            .kind(),
            ErrorKind::PortNotPublished
        );
        assert_eq!(
            CoreError::ExecFailed { code: 2 }.kind(),
            ErrorKind::ExecNonZeroExit
        );
        assert_eq!(
            CoreError::engine("kill", EngineError::Unavailable("down".into())).kind(),
            ErrorKind::EngineFailure
        );
        assert_eq!(
            CoreError::engine("load", EngineError::not_found("container", "x")).kind(),
            ErrorKind::NotFound
        );
    }

    #[test]
    fn log_unavailable_message_is_actionable() {
        let err = CoreError::LogUnavailable {
            path: PathBuf::from("/var/lib/nerdctl/1935db59/containers/default/abc/abc-json.log"),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        };
        assert_eq!(err.kind(), ErrorKind::ResourceUnavailable);
        assert!(err.to_string().contains("detached mode"));
    }
}
