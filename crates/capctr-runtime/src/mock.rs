use crate::client::{
    ContainerRecord, EngineClient, ExitStatus, ImageConfig, ImageRecord, NetworkInterface,
    TaskState, TaskStatus,
};
use crate::spec::{Process, Spec, OCI_VERSION};
use crate::stdio::ProcessIo;
use crate::EngineError;
use async_trait::async_trait;
use capctr_schema::{labels, ContainerId, ExecId};
use chrono::Utc;
use nix::sys::signal::Signal;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::watch;
use tracing::debug;

const FIRST_PID: u32 = 4000;

/// Behaviour of exec processes started on a [`MockEngine`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecScript {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: u32,
    /// Keep running until killed; exits with `128 + signal`.
    pub wait_for_signal: bool,
    /// Copy stdin to stdout and exit once stdin has been closed.
    pub echo_stdin: bool,
}

impl ExecScript {
    pub fn exit(code: u32) -> Self {
        Self {
            exit_code: code,
            ..Self::default()
        }
    }

    pub fn until_signal() -> Self {
        Self {
            wait_for_signal: true,
            ..Self::default()
        }
    }

    pub fn echo() -> Self {
        Self {
            echo_stdin: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_stdout(mut self, text: &str) -> Self {
        self.stdout = text.to_owned();
        self
    }

    #[must_use]
    pub fn with_stderr(mut self, text: &str) -> Self {
        self.stderr = text.to_owned();
        self
    }
}

/// Container record named through the name label, running `/sbin/init`.
pub fn container_record(id: &str, name: &str, image: &str) -> ContainerRecord {
    let mut record_labels = BTreeMap::new();
    if !name.is_empty() {
        record_labels.insert(labels::NAME.to_owned(), name.to_owned());
    }
    ContainerRecord {
        id: ContainerId::from(id),
        labels: record_labels,
        image: image.to_owned(),
        spec: Spec {
            oci_version: OCI_VERSION.to_owned(),
            process: Some(Process {
                args: vec!["/sbin/init".to_owned()],
                env: vec![
                    "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin"
                        .to_owned(),
                    "container=containerd".to_owned(),
                ],
                ..Process::default()
            }),
            hostname: Some(name.to_owned()),
            ..Spec::default()
        },
        snapshot_key: id.to_owned(),
        runtime: "io.containerd.runc.v2".to_owned(),
        created_at: Utc::now(),
    }
}

#[derive(Default)]
struct MockContainer {
    record: Option<ContainerRecord>,
    task: Option<TaskStatus>,
    interfaces: Vec<NetworkInterface>,
    kills: Vec<(Signal, bool)>,
}

#[derive(Default)]
struct NamespaceState {
    images: BTreeMap<String, ImageRecord>,
    containers: BTreeMap<ContainerId, MockContainer>,
}

impl NamespaceState {
    fn container(&self, id: &ContainerId) -> Result<&MockContainer, EngineError> {
        self.containers
            .get(id)
            .filter(|c| c.record.is_some())
            .ok_or_else(|| EngineError::not_found("container", id.as_str()))
    }

    fn container_mut(&mut self, id: &ContainerId) -> Result<&mut MockContainer, EngineError> {
        self.containers
            .get_mut(id)
            .filter(|c| c.record.is_some())
            .ok_or_else(|| EngineError::not_found("container", id.as_str()))
    }
}

struct MockExec {
    container: ContainerId,
    io: Option<ProcessIo>,
    script: ExecScript,
    exit: Arc<watch::Sender<Option<ExitStatus>>>,
    stdin_closed: Arc<watch::Sender<bool>>,
}

#[derive(Default)]
struct State {
    namespaces: HashMap<String, NamespaceState>,
    registry: BTreeMap<String, ImageConfig>,
    execs: HashMap<ExecId, MockExec>,
    exec_script: ExecScript,
    exec_history: Vec<(ExecId, Process)>,
    exec_deletes: HashMap<ExecId, usize>,
    exec_kills: Vec<(ExecId, Signal)>,
    stdin_closes: usize,
    pulls: usize,
    image_queries: usize,
    container_deletes: Vec<(ContainerId, bool)>,
    task_deletes: usize,
    exports: Vec<(String, PathBuf)>,
    next_pid: u32,
    pull_failure: Option<String>,
    query_failure: Option<String>,
    inspect_delay: Duration,
    exec_delete_delay: Duration,
}

impl State {
    fn ns(&mut self, namespace: &str) -> &mut NamespaceState {
        self.namespaces.entry(namespace.to_owned()).or_default()
    }
}

/// In-memory engine for tests. Namespaces are created on first use.
pub struct MockEngine {
    state: Mutex<State>,
}

impl Default for MockEngine {
    fn default() -> Self {
        Self {
            state: Mutex::new(State {
                next_pid: FIRST_PID,
                ..State::default()
            }),
        }
    }
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, State>, EngineError> {
        self.state
            .lock()
            .map_err(|e| EngineError::Internal(format!("mutex poisoned: {e}")))
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // Fixtures

    pub fn add_image(&self, namespace: &str, name: &str, config: ImageConfig) -> ImageRecord {
        let record = image_record(name, config);
        self.lock()
            .ns(namespace)
            .images
            .insert(name.to_owned(), record.clone());
        record
    }

    /// Config returned when `name` is pulled.
    pub fn add_registry_image(&self, name: &str, config: ImageConfig) {
        self.lock().registry.insert(name.to_owned(), config);
    }

    pub fn add_container(&self, namespace: &str, record: ContainerRecord) {
        let id = record.id.clone();
        let mut state = self.lock();
        let entry = state.ns(namespace).containers.entry(id).or_default();
        entry.record = Some(record);
    }

    /// Listed by `list_containers` but gone by the time it is looked up.
    pub fn add_phantom_container(&self, namespace: &str, id: &str) {
        self.lock()
            .ns(namespace)
            .containers
            .insert(ContainerId::from(id), MockContainer::default());
    }

    pub fn set_task(&self, namespace: &str, id: &str, task: Option<TaskStatus>) {
        let mut state = self.lock();
        if let Some(c) = state.ns(namespace).containers.get_mut(id) {
            c.task = task;
        }
    }

    pub fn set_network_interfaces(&self, namespace: &str, id: &str, ifaces: Vec<NetworkInterface>) {
        let mut state = self.lock();
        if let Some(c) = state.ns(namespace).containers.get_mut(id) {
            c.interfaces = ifaces;
        }
    }

    /// Script applied to exec processes created from now on.
    pub fn set_exec_script(&self, script: ExecScript) {
        self.lock().exec_script = script;
    }

    /// Delay every network inspection by `delay`.
    pub fn set_inspect_delay(&self, delay: Duration) {
        self.lock().inspect_delay = delay;
    }

    /// Delay every exec delete by `delay` before it takes effect.
    pub fn set_exec_delete_delay(&self, delay: Duration) {
        self.lock().exec_delete_delay = delay;
    }

    pub fn fail_pulls(&self, message: &str) {
        self.lock().pull_failure = Some(message.to_owned());
    }

    pub fn fail_image_queries(&self, message: &str) {
        self.lock().query_failure = Some(message.to_owned());
    }

    // Observations

    pub fn pull_count(&self) -> usize {
        self.lock().pulls
    }

    pub fn image_query_count(&self) -> usize {
        self.lock().image_queries
    }

    pub fn has_image(&self, namespace: &str, name: &str) -> bool {
        self.lock().ns(namespace).images.contains_key(name)
    }

    pub fn container(&self, namespace: &str, id: &str) -> Option<ContainerRecord> {
        self.lock()
            .ns(namespace)
            .containers
            .get(id)
            .and_then(|c| c.record.clone())
    }

    pub fn task(&self, namespace: &str, id: &str) -> Option<TaskStatus> {
        self.lock()
            .ns(namespace)
            .containers
            .get(id)
            .and_then(|c| c.task.clone())
    }

    /// Signals delivered to a container's task with their "all" flag.
    pub fn kills(&self, namespace: &str, id: &str) -> Vec<(Signal, bool)> {
        self.lock()
            .ns(namespace)
            .containers
            .get(id)
            .map(|c| c.kills.clone())
            .unwrap_or_default()
    }

    /// Deleted container ids with their snapshot-cleanup flag.
    pub fn container_deletes(&self) -> Vec<(ContainerId, bool)> {
        self.lock().container_deletes.clone()
    }

    pub fn task_delete_count(&self) -> usize {
        self.lock().task_deletes
    }

    /// Exec ids in creation order.
    pub fn exec_ids(&self) -> Vec<ExecId> {
        self.lock()
            .exec_history
            .iter()
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn exec_spec(&self, exec_id: &str) -> Option<Process> {
        self.lock()
            .exec_history
            .iter()
            .find(|(id, _)| id == exec_id)
            .map(|(_, p)| p.clone())
    }

    /// Number of delete calls for `exec_id`, successful or not.
    pub fn exec_delete_count(&self, exec_id: &str) -> usize {
        self.lock()
            .exec_deletes
            .get(exec_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn exec_kills(&self, exec_id: &str) -> Vec<Signal> {
        self.lock()
            .exec_kills
            .iter()
            .filter(|(id, _)| id == exec_id)
            .map(|(_, s)| *s)
            .collect()
    }

    /// Exec processes registered and not yet deleted.
    pub fn live_exec_count(&self) -> usize {
        self.lock().execs.len()
    }

    pub fn is_exec_started(&self, exec_id: &str) -> bool {
        self.lock()
            .execs
            .get(exec_id)
            .is_some_and(|e| e.io.is_none())
    }

    pub fn stdin_close_count(&self) -> usize {
        self.lock().stdin_closes
    }

    pub fn exports(&self) -> Vec<(String, PathBuf)> {
        self.lock().exports.clone()
    }
}

fn image_record(name: &str, config: ImageConfig) -> ImageRecord {
    let digest = format!("sha256:{}", hex::encode(Sha256::digest(name.as_bytes())));
    ImageRecord {
        name: name.to_owned(),
        digest,
        config,
    }
}

fn exit_now(code: u32) -> Option<ExitStatus> {
    Some(ExitStatus {
        code,
        exited_at: Some(Utc::now()),
    })
}

async fn run_exec(
    mut io: ProcessIo,
    script: ExecScript,
    exit: Arc<watch::Sender<Option<ExitStatus>>>,
    mut stdin_closed: watch::Receiver<bool>,
) {
    if let Err(e) = io.stdout.write_all(script.stdout.as_bytes()).await {
        debug!("mock exec stdout: {e}");
    }
    if let Err(e) = io.stderr.write_all(script.stderr.as_bytes()).await {
        debug!("mock exec stderr: {e}");
    }
    if script.echo_stdin {
        let mut input = Vec::new();
        if let Some(mut stdin) = io.stdin.take() {
            if let Err(e) = stdin.read_to_end(&mut input).await {
                debug!("mock exec stdin: {e}");
            }
        }
        if let Err(e) = io.stdout.write_all(&input).await {
            debug!("mock exec stdout: {e}");
        }
        let _ = stdin_closed.wait_for(|closed| *closed).await;
    }
    let _ = io.stdout.flush().await;
    let _ = io.stderr.flush().await;
    if !script.wait_for_signal {
        exit.send_if_modified(|status| {
            if status.is_some() {
                return false;
            }
            *status = exit_now(script.exit_code);
            true
        });
    }
}

#[async_trait]
impl EngineClient for MockEngine {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn list_images(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Vec<ImageRecord>, EngineError> {
        let mut state = self.state()?;
        state.image_queries += 1;
        if let Some(msg) = &state.query_failure {
            return Err(EngineError::Unavailable(msg.clone()));
        }
        Ok(state.ns(namespace).images.get(name).cloned().into_iter().collect())
    }

    async fn pull_image(
        &self,
        namespace: &str,
        reference: &str,
    ) -> Result<ImageRecord, EngineError> {
        let mut state = self.state()?;
        state.pulls += 1;
        if let Some(msg) = &state.pull_failure {
            return Err(EngineError::Unavailable(msg.clone()));
        }
        let config = state.registry.get(reference).cloned().unwrap_or_default();
        let record = image_record(reference, config);
        state
            .ns(namespace)
            .images
            .insert(reference.to_owned(), record.clone());
        Ok(record)
    }

    async fn export_image(
        &self,
        namespace: &str,
        reference: &str,
        dest: &Path,
    ) -> Result<(), EngineError> {
        let archive = {
            let mut state = self.state()?;
            let image = state
                .ns(namespace)
                .images
                .get(reference)
                .cloned()
                .ok_or_else(|| EngineError::not_found("image", reference))?;
            state.exports.push((reference.to_owned(), dest.to_path_buf()));
            serde_json::to_vec_pretty(&image)
                .map_err(|e| EngineError::Internal(format!("encode image: {e}")))?
        };
        tokio::fs::write(dest, archive).await?;
        Ok(())
    }

    async fn list_containers(&self, namespace: &str) -> Result<Vec<ContainerId>, EngineError> {
        let mut state = self.state()?;
        Ok(state.ns(namespace).containers.keys().cloned().collect())
    }

    async fn container_info(
        &self,
        namespace: &str,
        id: &ContainerId,
    ) -> Result<ContainerRecord, EngineError> {
        let mut state = self.state()?;
        let container = state.ns(namespace).container(id)?;
        container
            .record
            .clone()
            .ok_or_else(|| EngineError::not_found("container", id.as_str()))
    }

    async fn create_container(
        &self,
        namespace: &str,
        record: ContainerRecord,
    ) -> Result<ContainerRecord, EngineError> {
        let mut state = self.state()?;
        let ns = state.ns(namespace);
        if ns.containers.contains_key(&record.id) {
            return Err(EngineError::AlreadyExists {
                kind: "container",
                id: record.id.to_string(),
            });
        }
        ns.containers.insert(
            record.id.clone(),
            MockContainer {
                record: Some(record.clone()),
                ..MockContainer::default()
            },
        );
        Ok(record)
    }

    async fn delete_container(
        &self,
        namespace: &str,
        id: &ContainerId,
        cleanup_snapshot: bool,
    ) -> Result<(), EngineError> {
        let mut state = self.state()?;
        let ns = state.ns(namespace);
        if ns.container(id)?.task.is_some() {
            return Err(EngineError::FailedPrecondition(format!(
                "container '{id}' has an active task"
            )));
        }
        ns.containers.remove(id);
        state.container_deletes.push((id.clone(), cleanup_snapshot));
        Ok(())
    }

    async fn create_task(&self, namespace: &str, id: &ContainerId) -> Result<(), EngineError> {
        let mut state = self.state()?;
        let container = state.ns(namespace).container_mut(id)?;
        if container.task.is_some() {
            return Err(EngineError::AlreadyExists {
                kind: "task",
                id: id.to_string(),
            });
        }
        container.task = Some(TaskStatus::with_state(TaskState::Created));
        Ok(())
    }

    async fn start_task(&self, namespace: &str, id: &ContainerId) -> Result<u32, EngineError> {
        let mut state = self.state()?;
        state.next_pid += 1;
        let pid = state.next_pid;
        let container = state.ns(namespace).container_mut(id)?;
        match container.task.as_ref().map(|t| t.state) {
            Some(TaskState::Created) => {
                container.task = Some(TaskStatus::running(pid, Utc::now()));
                Ok(pid)
            }
            Some(other) => Err(EngineError::FailedPrecondition(format!(
                "task '{id}' is {other}"
            ))),
            None => Err(EngineError::not_found("task", id.as_str())),
        }
    }

    async fn task_status(
        &self,
        namespace: &str,
        id: &ContainerId,
    ) -> Result<Option<TaskStatus>, EngineError> {
        let mut state = self.state()?;
        Ok(state.ns(namespace).container(id)?.task.clone())
    }

    async fn kill_task(
        &self,
        namespace: &str,
        id: &ContainerId,
        signal: Signal,
        all: bool,
    ) -> Result<(), EngineError> {
        let mut state = self.state()?;
        let container = state.ns(namespace).container_mut(id)?;
        let Some(task) = container.task.as_mut() else {
            return Err(EngineError::not_found("task", id.as_str()));
        };
        if task.state == TaskState::Running {
            *task = TaskStatus::stopped(128 + signal as u32, Utc::now());
        }
        container.kills.push((signal, all));
        Ok(())
    }

    async fn delete_task(
        &self,
        namespace: &str,
        id: &ContainerId,
    ) -> Result<ExitStatus, EngineError> {
        let mut state = self.state()?;
        let container = state.ns(namespace).container_mut(id)?;
        let task = container
            .task
            .take()
            .ok_or_else(|| EngineError::not_found("task", id.as_str()))?;
        if !task.state.is_deletable() {
            let state_name = task.state;
            container.task = Some(task);
            return Err(EngineError::FailedPrecondition(format!(
                "task '{id}' is {state_name}"
            )));
        }
        state.task_deletes += 1;
        Ok(ExitStatus {
            code: task.exit_status,
            exited_at: task.exited_at,
        })
    }

    async fn exec_process(
        &self,
        namespace: &str,
        id: &ContainerId,
        exec_id: &ExecId,
        process: Process,
        io: ProcessIo,
    ) -> Result<(), EngineError> {
        let mut state = self.state()?;
        let running = state
            .ns(namespace)
            .container(id)?
            .task
            .as_ref()
            .is_some_and(|t| t.state == TaskState::Running);
        if !running {
            return Err(EngineError::FailedPrecondition(format!(
                "container '{id}' has no running task"
            )));
        }
        if state.execs.contains_key(exec_id) {
            return Err(EngineError::AlreadyExists {
                kind: "exec process",
                id: exec_id.to_string(),
            });
        }
        let (exit, _) = watch::channel(None);
        let (stdin_closed, _) = watch::channel(false);
        let script = state.exec_script.clone();
        state.exec_history.push((exec_id.clone(), process));
        state.execs.insert(
            exec_id.clone(),
            MockExec {
                container: id.clone(),
                io: Some(io),
                script,
                exit: Arc::new(exit),
                stdin_closed: Arc::new(stdin_closed),
            },
        );
        Ok(())
    }

    async fn start_process(
        &self,
        _namespace: &str,
        id: &ContainerId,
        exec_id: &ExecId,
    ) -> Result<(), EngineError> {
        let (io, script, exit, stdin_closed) = {
            let mut state = self.state()?;
            let exec = state
                .execs
                .get_mut(exec_id)
                .filter(|e| e.container == *id)
                .ok_or_else(|| EngineError::not_found("exec process", exec_id.as_str()))?;
            let io = exec.io.take().ok_or_else(|| {
                EngineError::FailedPrecondition(format!("exec '{exec_id}' already started"))
            })?;
            (
                io,
                exec.script.clone(),
                Arc::clone(&exec.exit),
                exec.stdin_closed.subscribe(),
            )
        };
        tokio::spawn(run_exec(io, script, exit, stdin_closed));
        Ok(())
    }

    async fn wait_process(
        &self,
        _namespace: &str,
        _id: &ContainerId,
        exec_id: &ExecId,
    ) -> Result<ExitStatus, EngineError> {
        let mut rx = {
            let state = self.state()?;
            state
                .execs
                .get(exec_id)
                .ok_or_else(|| EngineError::not_found("exec process", exec_id.as_str()))?
                .exit
                .subscribe()
        };
        let status = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| EngineError::not_found("exec process", exec_id.as_str()))?;
        (*status).ok_or_else(|| EngineError::Internal(format!("exec '{exec_id}' has no status")))
    }

    async fn kill_process(
        &self,
        _namespace: &str,
        _id: &ContainerId,
        exec_id: &ExecId,
        signal: Signal,
    ) -> Result<(), EngineError> {
        let mut state = self.state()?;
        let exec = state
            .execs
            .get(exec_id)
            .ok_or_else(|| EngineError::not_found("exec process", exec_id.as_str()))?;
        exec.exit.send_if_modified(|status| {
            if status.is_some() {
                return false;
            }
            *status = exit_now(128 + signal as u32);
            true
        });
        state.exec_kills.push((exec_id.clone(), signal));
        Ok(())
    }

    async fn close_process_stdin(
        &self,
        _namespace: &str,
        _id: &ContainerId,
        exec_id: &ExecId,
    ) -> Result<(), EngineError> {
        let mut state = self.state()?;
        let exec = state
            .execs
            .get(exec_id)
            .ok_or_else(|| EngineError::not_found("exec process", exec_id.as_str()))?;
        exec.stdin_closed.send_replace(true);
        state.stdin_closes += 1;
        Ok(())
    }

    async fn delete_process(
        &self,
        _namespace: &str,
        _id: &ContainerId,
        exec_id: &ExecId,
    ) -> Result<(), EngineError> {
        let delay = self.state()?.exec_delete_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state()?;
        *state.exec_deletes.entry(exec_id.clone()).or_default() += 1;
        state
            .execs
            .remove(exec_id)
            .map(|_| ())
            .ok_or_else(|| EngineError::not_found("exec process", exec_id.as_str()))
    }

    async fn network_interfaces(
        &self,
        namespace: &str,
        id: &ContainerId,
    ) -> Result<Vec<NetworkInterface>, EngineError> {
        let delay = self.state()?.inspect_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state()?;
        Ok(state.ns(namespace).container(id)?.interfaces.clone())
    }
}
