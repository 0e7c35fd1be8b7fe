//! Engine boundary for the capctr container driver.
//!
//! This crate defines what the driver needs from a containerd-style engine:
//! the async `EngineClient` trait and the records it exchanges, the OCI
//! process spec used to synthesize exec processes, capability discovery for
//! privileged execs, signal parsing and forwarding, stdio plumbing, and an
//! in-memory `MockEngine` for tests.

pub mod capabilities;
pub mod client;
pub mod mock;
pub mod signal;
pub mod spec;
pub mod stdio;

pub use capabilities::current_capabilities;
pub use client::{
    ContainerRecord, EngineClient, ExitStatus, ImageConfig, ImageRecord, InterfaceAddress,
    NetworkInterface, TaskState, TaskStatus,
};
pub use mock::{container_record, ExecScript, MockEngine};
pub use signal::{
    parse_signal, ChannelSignalSource, OsSignalSource, SignalError, SignalRelay, SignalSource,
    FORWARDED_SIGNALS,
};
pub use spec::{Capabilities, Mount, Process, Spec, User};
pub use stdio::{BoxedReader, BoxedWriter, ProcessIo, SharedBuffer, StdinCloser};

pub use nix::sys::signal::Signal;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },
    #[error("{kind} '{id}' already exists")]
    AlreadyExists { kind: &'static str, id: String },
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),
    #[error("engine unavailable: {0}")]
    Unavailable(String),
    #[error("engine internal error: {0}")]
    Internal(String),
    #[error("engine I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_is_classified() {
        let err = EngineError::not_found("container", "abc");
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "container 'abc' not found");
        assert!(!EngineError::Unavailable("socket closed".into()).is_not_found());
    }
}
