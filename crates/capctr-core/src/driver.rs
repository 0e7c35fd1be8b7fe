use crate::CoreError;
use capctr_runtime::{EngineClient, OsSignalSource, SignalSource};
use capctr_schema::DriverConfig;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Container lifecycle driver bound to one engine namespace.
///
/// Holds no container state of its own: every operation re-reads the engine,
/// so several drivers (or several namespaces) can share one engine client.
/// The driver is immutable after construction and cheap to clone.
#[derive(Clone)]
pub struct Driver {
    pub(crate) engine: Arc<dyn EngineClient>,
    pub(crate) namespace: String,
    pub(crate) data_store: PathBuf,
    pub(crate) inspect_timeout: Duration,
    pub(crate) signals: Arc<dyn SignalSource>,
}

impl Driver {
    /// Build a driver from a validated configuration. Exec sessions forward
    /// signals received by this process.
    pub fn new(engine: Arc<dyn EngineClient>, config: &DriverConfig) -> Result<Self, CoreError> {
        config.validate()?;
        let data_store = config.data_store_dir();
        debug!(
            "driver for namespace '{}' on {} (engine: {}, data store: {})",
            config.namespace,
            config.address,
            engine.name(),
            data_store.display()
        );
        Ok(Self {
            engine,
            namespace: config.namespace.clone(),
            data_store,
            inspect_timeout: config.inspect_timeout(),
            signals: Arc::new(OsSignalSource),
        })
    }

    /// Replace where exec sessions receive forwarded signals from.
    #[must_use]
    pub fn with_signal_source(mut self, signals: Arc<dyn SignalSource>) -> Self {
        self.signals = signals;
        self
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn data_store(&self) -> &Path {
        &self.data_store
    }

    pub fn inspect_timeout(&self) -> Duration {
        self.inspect_timeout
    }

    pub fn engine(&self) -> &Arc<dyn EngineClient> {
        &self.engine
    }
}

impl std::fmt::Debug for Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Driver")
            .field("engine", &self.engine.name())
            .field("namespace", &self.namespace)
            .field("data_store", &self.data_store)
            .field("inspect_timeout", &self.inspect_timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capctr_runtime::MockEngine;

    #[test]
    fn builds_from_config() {
        let config = DriverConfig::default().with_namespace("capi");
        let driver = Driver::new(Arc::new(MockEngine::new()), &config).unwrap();
        assert_eq!(driver.namespace(), "capi");
        assert_eq!(driver.data_store(), Path::new("/var/lib/nerdctl/1935db59"));
        assert_eq!(driver.inspect_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn rejects_invalid_config() {
        let config = DriverConfig::default().with_namespace("");
        let err = Driver::new(Arc::new(MockEngine::new()), &config).unwrap_err();
        assert!(matches!(err, CoreError::Config(_)));
    }

    #[test]
    fn drivers_are_independent() {
        let engine: Arc<dyn EngineClient> = Arc::new(MockEngine::new());
        let a = Driver::new(Arc::clone(&engine), &DriverConfig::default().with_namespace("a"))
            .unwrap();
        let b = Driver::new(engine, &DriverConfig::default().with_namespace("b")).unwrap();
        assert_ne!(a.namespace(), b.namespace());
    }
}
