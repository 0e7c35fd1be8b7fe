use crate::exec::{grant_current_capabilities, merge_env};
use crate::{CoreError, Driver};
use capctr_runtime::spec::OCI_VERSION;
use capctr_runtime::{
    parse_signal, ContainerRecord, Mount, Process, Signal, Spec, TaskState, TaskStatus,
};
use capctr_schema::labels::{self, display_name};
use capctr_schema::{encode_port_mappings, ContainerFilter, ContainerId, PortMapping};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

const DEFAULT_STOP_SIGNAL: Signal = Signal::SIGTERM;
const DEFAULT_RUNTIME: &str = "io.containerd.runc.v2";

/// One row of a container listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    pub id: ContainerId,
    pub name: String,
    pub image: String,
    pub status: String,
}

/// Everything needed to create and start a container.
#[derive(Debug, Clone, Default)]
pub struct RunContainerInput {
    pub name: String,
    pub image: String,
    pub hostname: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub mounts: Vec<Mount>,
    pub port_mappings: Vec<PortMapping>,
    pub env: Vec<String>,
    /// Replaces the image entrypoint; the image command is then dropped too.
    pub entrypoint: Option<Vec<String>>,
    pub command: Option<Vec<String>>,
    pub privileged: bool,
}

/// A task may be deleted only once it is `Created` or `Stopped`.
pub fn check_deletable(container: &str, status: Option<&TaskStatus>) -> Result<(), CoreError> {
    match status {
        None => Ok(()),
        Some(task) if task.state.is_deletable() => Ok(()),
        Some(task) => Err(CoreError::CannotDeleteRunning {
            container: container.to_owned(),
            state: task.state,
        }),
    }
}

/// Human-readable duration in the style of `docker ps`.
pub fn human_duration(d: chrono::Duration) -> String {
    let secs = d.num_seconds();
    if secs < 1 {
        return "Less than a second".to_owned();
    }
    if secs == 1 {
        return "1 second".to_owned();
    }
    if secs < 60 {
        return format!("{secs} seconds");
    }
    let minutes = secs / 60;
    if minutes == 1 {
        return "About a minute".to_owned();
    }
    if minutes < 60 {
        return format!("{minutes} minutes");
    }
    let hours = (secs + 1800) / 3600;
    if hours == 1 {
        return "About an hour".to_owned();
    }
    if hours < 48 {
        return format!("{hours} hours");
    }
    if hours < 24 * 7 * 2 {
        return format!("{} days", hours / 24);
    }
    if hours < 24 * 30 * 2 {
        return format!("{} weeks", hours / 24 / 7);
    }
    if hours < 24 * 365 * 2 {
        return format!("{} months", hours / 24 / 30);
    }
    format!("{} years", hours / 24 / 365)
}

/// Listing status: `Created`, `Up 3 minutes`, `Exited (0) 2 hours ago`,
/// `Paused`, or the raw state name.
pub fn status_string(
    status: Option<&TaskStatus>,
    created_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> String {
    let Some(task) = status else {
        return "Created".to_owned();
    };
    match task.state {
        TaskState::Created => "Created".to_owned(),
        TaskState::Running => {
            let since = task.started_at.unwrap_or(created_at);
            format!("Up {}", human_duration(now - since))
        }
        TaskState::Stopped => match task.exited_at {
            Some(at) => format!("Exited ({}) {} ago", task.exit_status, human_duration(now - at)),
            None => format!("Exited ({})", task.exit_status),
        },
        TaskState::Paused => "Paused".to_owned(),
        TaskState::Pausing => "Pausing".to_owned(),
        TaskState::Unknown => "Unknown".to_owned(),
    }
}

impl Driver {
    /// Send a signal to every process in the container.
    ///
    /// Without an explicit signal the container's stop-signal label is used,
    /// falling back to `SIGTERM`.
    pub async fn kill(&self, container: &str, signal: Option<&str>) -> Result<(), CoreError> {
        let explicit = signal
            .filter(|s| !s.trim().is_empty())
            .map(parse_signal)
            .transpose()?;
        let record = self.resolve_one(container).await?;
        let signal = match explicit {
            Some(signal) => signal,
            None => match record.stop_signal_label() {
                Some(label) => parse_signal(label)?,
                None => DEFAULT_STOP_SIGNAL,
            },
        };

        info!("killing container {} with {signal}", record.id);
        self.engine
            .kill_task(&self.namespace, &record.id, signal, true)
            .await
            .map_err(|e| CoreError::engine(format!("kill container {}", record.id), e))
    }

    /// Remove a container together with its snapshot. Only containers
    /// without a task, or whose task is `Created` or `Stopped`, can be
    /// deleted.
    pub async fn delete(&self, container: &str) -> Result<(), CoreError> {
        let record = self.resolve_one(container).await?;
        let id = &record.id;
        let status = self
            .engine
            .task_status(&self.namespace, id)
            .await
            .map_err(|e| CoreError::engine(format!("task status of {id}"), e))?;
        check_deletable(container, status.as_ref())?;

        if status.is_some() {
            self.engine
                .delete_task(&self.namespace, id)
                .await
                .map_err(|e| CoreError::engine(format!("delete task {id}"), e))?;
        }
        self.engine
            .delete_container(&self.namespace, id, true)
            .await
            .map_err(|e| CoreError::engine(format!("delete container {id}"), e))?;
        info!("deleted container {id}");
        Ok(())
    }

    /// Summaries of the namespace's containers accepted by `filter`.
    ///
    /// Containers that vanish while the listing is built are skipped.
    pub async fn list(&self, filter: &ContainerFilter) -> Result<Vec<ContainerSummary>, CoreError> {
        let ids = self
            .engine
            .list_containers(&self.namespace)
            .await
            .map_err(|e| CoreError::engine("list containers", e))?;
        let now = Utc::now();

        let mut summaries = Vec::with_capacity(ids.len());
        for id in ids {
            let record = match self.engine.container_info(&self.namespace, &id).await {
                Ok(record) => record,
                Err(e) if e.is_not_found() => {
                    warn!("container {id} disappeared while listing, skipping");
                    continue;
                }
                Err(e) => return Err(CoreError::engine(format!("load container {id}"), e)),
            };
            let name = display_name(&record.labels);
            if !filter.matches(&name, &record.labels) {
                continue;
            }
            let status = match self.engine.task_status(&self.namespace, &id).await {
                Ok(status) => status,
                Err(e) if e.is_not_found() => {
                    warn!("container {id} disappeared while listing, skipping");
                    continue;
                }
                Err(e) => return Err(CoreError::engine(format!("task status of {id}"), e)),
            };
            summaries.push(ContainerSummary {
                status: status_string(status.as_ref(), record.created_at, now),
                id: record.id,
                name,
                image: record.image,
            });
        }
        debug!("listed {} container(s)", summaries.len());
        Ok(summaries)
    }

    /// Create and start a container from `input`, pulling its image when
    /// needed. Fails with [`CoreError::NameInUse`] when another container
    /// already carries the name.
    pub async fn run_container(&self, input: RunContainerInput) -> Result<ContainerId, CoreError> {
        if input.name.is_empty() {
            return Err(CoreError::InvalidInput(
                "container name must not be empty".to_owned(),
            ));
        }
        let image = self.ensure_image(&input.image).await?;
        if self.name_in_use(&input.name).await? {
            return Err(CoreError::NameInUse(input.name));
        }

        let (entrypoint, cmd) = match input.entrypoint {
            Some(entrypoint) => (entrypoint, input.command.unwrap_or_default()),
            None => (
                image.config.entrypoint.clone(),
                input.command.unwrap_or_else(|| image.config.cmd.clone()),
            ),
        };
        let args: Vec<String> = entrypoint.into_iter().chain(cmd).collect();
        if args.is_empty() {
            return Err(CoreError::InvalidInput(format!(
                "no command specified for image {}",
                image.name
            )));
        }

        let mut process = Process {
            args,
            env: merge_env(&image.config.env, &input.env),
            ..Process::default()
        };
        if !image.config.working_dir.is_empty() {
            process.cwd.clone_from(&image.config.working_dir);
        }
        if input.privileged {
            grant_current_capabilities(&mut process)?;
        }

        let hostname = input.hostname.unwrap_or_else(|| input.name.clone());
        let mut container_labels = input.labels;
        container_labels.insert(labels::NAME.to_owned(), input.name.clone());
        container_labels.insert(labels::HOSTNAME.to_owned(), hostname.clone());
        if !input.port_mappings.is_empty() {
            container_labels.insert(
                labels::PORTS.to_owned(),
                encode_port_mappings(&input.port_mappings)?,
            );
        }
        if let Some(stop_signal) = &image.config.stop_signal {
            container_labels.insert(labels::STOP_SIGNAL.to_owned(), stop_signal.clone());
        }

        let id = ContainerId::generate();
        let record = ContainerRecord {
            id: id.clone(),
            labels: container_labels,
            image: image.name.clone(),
            spec: Spec {
                oci_version: OCI_VERSION.to_owned(),
                process: Some(process),
                hostname: Some(hostname),
                mounts: input.mounts,
                annotations: BTreeMap::new(),
            },
            snapshot_key: id.to_string(),
            runtime: DEFAULT_RUNTIME.to_owned(),
            created_at: Utc::now(),
        };

        self.engine
            .create_container(&self.namespace, record)
            .await
            .map_err(|e| CoreError::engine(format!("create container {}", input.name), e))?;
        if let Err(e) = self.start_new_task(&id).await {
            self.discard_failed_run(&id).await;
            return Err(e);
        }
        info!("started container {} ({})", input.name, id.short());
        Ok(id)
    }

    async fn name_in_use(&self, name: &str) -> Result<bool, CoreError> {
        let ids = self
            .engine
            .list_containers(&self.namespace)
            .await
            .map_err(|e| CoreError::engine("list containers", e))?;
        for id in ids {
            match self.engine.container_info(&self.namespace, &id).await {
                Ok(record) if record.name_label() == Some(name) => return Ok(true),
                Ok(_) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(CoreError::engine(format!("load container {id}"), e)),
            }
        }
        Ok(false)
    }

    async fn start_new_task(&self, id: &ContainerId) -> Result<(), CoreError> {
        self.engine
            .create_task(&self.namespace, id)
            .await
            .map_err(|e| CoreError::engine(format!("create task {id}"), e))?;
        let pid = self
            .engine
            .start_task(&self.namespace, id)
            .await
            .map_err(|e| CoreError::engine(format!("start task {id}"), e))?;
        debug!("task {id} running as pid {pid}");
        Ok(())
    }

    async fn discard_failed_run(&self, id: &ContainerId) {
        if let Ok(Some(_)) = self.engine.task_status(&self.namespace, id).await {
            if let Err(e) = self.engine.delete_task(&self.namespace, id).await {
                warn!("failed to remove task of unstarted container {id}: {e}");
            }
        }
        if let Err(e) = self.engine.delete_container(&self.namespace, id, true).await {
            warn!("failed to remove unstarted container {id}: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn deletable_only_without_task_or_when_idle() {
        assert!(check_deletable("n", None).is_ok());
        assert!(check_deletable("n", Some(&TaskStatus::with_state(TaskState::Created))).is_ok());
        assert!(check_deletable("n", Some(&TaskStatus::stopped(0, Utc::now()))).is_ok());
        for state in [TaskState::Running, TaskState::Paused, TaskState::Pausing, TaskState::Unknown] {
            let err = check_deletable("n", Some(&TaskStatus::with_state(state))).unwrap_err();
            assert!(matches!(err, CoreError::CannotDeleteRunning { .. }));
        }
    }

    #[test]
    fn human_durations() {
        assert_eq!(human_duration(Duration::milliseconds(300)), "Less than a second");
        assert_eq!(human_duration(Duration::seconds(1)), "1 second");
        assert_eq!(human_duration(Duration::seconds(45)), "45 seconds");
        assert_eq!(human_duration(Duration::seconds(90)), "About a minute");
        assert_eq!(human_duration(Duration::minutes(3)), "3 minutes");
        assert_eq!(human_duration(Duration::minutes(70)), "About an hour");
        assert_eq!(human_duration(Duration::hours(5)), "5 hours");
        assert_eq!(human_duration(Duration::days(3)), "3 days");
        assert_eq!(human_duration(Duration::days(21)), "3 weeks");
        assert_eq!(human_duration(Duration::days(120)), "4 months");
        assert_eq!(human_duration(Duration::days(800)), "2 years");
    }

    #[test]
    fn status_strings() {
        let now = Utc::now();
        let created = now - Duration::minutes(10);
        assert_eq!(status_string(None, created, now), "Created");
        assert_eq!(
            status_string(
                Some(&TaskStatus::running(7, now - Duration::minutes(3))),
                created,
                now
            ),
            "Up 3 minutes"
        );
        assert_eq!(
            status_string(
                Some(&TaskStatus::stopped(137, now - Duration::hours(2))),
                created,
                now
            ),
            "Exited (137) 2 hours ago"
        );
        assert_eq!(
            status_string(Some(&TaskStatus::with_state(TaskState::Paused)), created, now),
            "Paused"
        );
        assert_eq!(
            status_string(Some(&TaskStatus::with_state(TaskState::Unknown)), created, now),
            "Unknown"
        );
    }

    #[test]
    fn running_without_start_time_uses_creation() {
        let now = Utc::now();
        let mut task = TaskStatus::with_state(TaskState::Running);
        task.started_at = None;
        assert_eq!(
            status_string(Some(&task), now - Duration::seconds(30), now),
            "Up 30 seconds"
        );
    }
}
