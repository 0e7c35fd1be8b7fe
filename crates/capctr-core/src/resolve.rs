use crate::{CoreError, Driver};
use capctr_runtime::ContainerRecord;
use tracing::{debug, warn};

/// Outcome of matching an identifier against the namespace's containers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolutionResult {
    NotFound,
    Single(Box<ContainerRecord>),
    Ambiguous(usize),
}

impl ResolutionResult {
    /// The single match, or the error distinguishing zero from many.
    pub fn into_single(self, name: &str) -> Result<ContainerRecord, CoreError> {
        match self {
            Self::Single(record) => Ok(*record),
            Self::NotFound => Err(CoreError::NotFound(name.to_owned())),
            Self::Ambiguous(count) => Err(CoreError::Ambiguous {
                name: name.to_owned(),
                count,
            }),
        }
    }
}

/// True when `record` is addressed by `req`: exact name label or id prefix.
pub fn matches_request(record: &ContainerRecord, req: &str) -> bool {
    record.name_label() == Some(req) || record.id.starts_with(req)
}

impl Driver {
    /// Match `req` against every container in the namespace by exact name
    /// label or id prefix. Containers that disappear between listing and
    /// lookup are skipped.
    pub async fn resolve(&self, req: &str) -> Result<ResolutionResult, CoreError> {
        if req.is_empty() {
            return Err(CoreError::InvalidInput(
                "container name or id must not be empty".to_owned(),
            ));
        }
        let ids = self
            .engine
            .list_containers(&self.namespace)
            .await
            .map_err(|e| CoreError::engine("list containers", e))?;

        let mut found = Vec::new();
        for id in ids {
            let record = match self.engine.container_info(&self.namespace, &id).await {
                Ok(record) => record,
                Err(e) if e.is_not_found() => {
                    warn!("container {id} vanished while resolving '{req}'");
                    continue;
                }
                Err(e) => return Err(CoreError::engine(format!("load container {id}"), e)),
            };
            if matches_request(&record, req) {
                found.push(record);
            }
        }

        debug!("'{req}' matched {} container(s)", found.len());
        Ok(match found.len() {
            0 => ResolutionResult::NotFound,
            1 => match found.pop() {
                Some(record) => ResolutionResult::Single(Box::new(record)),
                None => ResolutionResult::NotFound,
            },
            n => ResolutionResult::Ambiguous(n),
        })
    }

    /// Resolve `req` to exactly one container.
    pub async fn resolve_one(&self, req: &str) -> Result<ContainerRecord, CoreError> {
        self.resolve(req).await?.into_single(req)
    }
}
