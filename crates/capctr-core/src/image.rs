use crate::{CoreError, Driver};
use capctr_runtime::ImageRecord;
use capctr_schema::ImageReference;
use std::path::Path;
use tracing::{debug, info};

impl Driver {
    /// Make sure `image` is present in the namespace, pulling it when no image
    /// with the exact canonical name exists. A present image is not
    /// re-validated. Failures are returned as-is; nothing is retried.
    pub async fn pull_image_if_absent(&self, image: &str) -> Result<(), CoreError> {
        self.ensure_image(image).await.map(|_| ())
    }

    /// Like [`Driver::pull_image_if_absent`], returning the image record.
    pub(crate) async fn ensure_image(&self, image: &str) -> Result<ImageRecord, CoreError> {
        let reference = ImageReference::parse(image)?;
        let name = reference.to_string();

        let existing = self
            .engine
            .list_images(&self.namespace, &name)
            .await
            .map_err(|source| CoreError::ImageQuery {
                reference: name.clone(),
                source,
            })?;
        if let Some(record) = existing.into_iter().next() {
            debug!("image {name} already present");
            return Ok(record);
        }

        info!("pulling image {name}");
        let record = self
            .engine
            .pull_image(&self.namespace, &name)
            .await
            .map_err(|source| CoreError::Pull {
                reference: name.clone(),
                source,
            })?;
        info!("pulled image {name} ({})", record.digest);
        Ok(record)
    }

    /// Export `image` as an archive at `dest`. The image must already be
    /// present.
    pub async fn save_image(&self, image: &str, dest: &Path) -> Result<(), CoreError> {
        let reference = ImageReference::parse(image)?;
        let name = reference.to_string();
        debug!("saving image {name} to {}", dest.display());
        self.engine
            .export_image(&self.namespace, &name, dest)
            .await
            .map_err(|e| CoreError::engine(format!("save image {name}"), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use capctr_runtime::{EngineClient, ImageConfig, MockEngine};
    use capctr_schema::DriverConfig;
    use std::sync::Arc;

    fn driver(engine: &Arc<MockEngine>) -> Driver {
        let engine: Arc<dyn EngineClient> = Arc::clone(engine) as _;
        Driver::new(engine, &DriverConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn pull_is_idempotent() {
        let engine = Arc::new(MockEngine::new());
        let d = driver(&engine);
        d.pull_image_if_absent("kindest/node:v1.29.2").await.unwrap();
        d.pull_image_if_absent("kindest/node:v1.29.2").await.unwrap();
        d.pull_image_if_absent("docker.io/kindest/node:v1.29.2")
            .await
            .unwrap();
        assert_eq!(engine.pull_count(), 1);
        assert!(engine.has_image("default", "docker.io/kindest/node:v1.29.2"));
    }

    #[tokio::test]
    async fn present_image_is_not_pulled() {
        let engine = Arc::new(MockEngine::new());
        engine.add_image(
            "default",
            "docker.io/library/busybox:latest",
            ImageConfig::default(),
        );
        driver(&engine).pull_image_if_absent("busybox").await.unwrap();
        assert_eq!(engine.pull_count(), 0);
    }

    #[tokio::test]
    async fn bad_reference_touches_nothing() {
        let engine = Arc::new(MockEngine::new());
        let err = driver(&engine)
            .pull_image_if_absent("Busybox:latest")
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidReference(_)));
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert_eq!(engine.image_query_count(), 0);
        assert_eq!(engine.pull_count(), 0);
    }

    #[tokio::test]
    async fn query_and_pull_failures_are_distinct() {
        let engine = Arc::new(MockEngine::new());
        engine.fail_pulls("registry unreachable");
        let err = driver(&engine).pull_image_if_absent("alpine").await.unwrap_err();
        assert!(matches!(err, CoreError::Pull { .. }));
        assert_eq!(err.kind(), ErrorKind::EngineFailure);

        let engine = Arc::new(MockEngine::new());
        engine.fail_image_queries("socket closed");
        let err = driver(&engine).pull_image_if_absent("alpine").await.unwrap_err();
        assert!(matches!(err, CoreError::ImageQuery { .. }));
        assert_eq!(engine.pull_count(), 0);
    }

    #[tokio::test]
    async fn save_exports_canonical_name() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(MockEngine::new());
        let d = driver(&engine);
        d.pull_image_if_absent("alpine:3.19").await.unwrap();
        let dest = dir.path().join("alpine.tar");
        d.save_image("alpine:3.19", &dest).await.unwrap();
        assert_eq!(
            engine.exports(),
            vec![("docker.io/library/alpine:3.19".to_owned(), dest.clone())]
        );
        assert!(dest.exists());
    }
}
