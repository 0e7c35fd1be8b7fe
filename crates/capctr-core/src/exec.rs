//! Exec sessions: processes started inside a running container.
//!
//! A session walks `created -> spec synthesized -> spawned -> running ->
//! exited`. The process spec is derived from the container's own process,
//! signals received while it runs are forwarded to it, and the engine-side
//! exec handle is deleted exactly once whichever way the session ends.

use crate::{CoreError, Driver};
use capctr_runtime::{
    current_capabilities, BoxedReader, BoxedWriter, Capabilities, ContainerRecord,
    EngineClient, EngineError, ExitStatus, Process, ProcessIo, StdinCloser, User,
};
use capctr_schema::{ContainerId, ExecId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// What to run and how to wire its streams. Output is discarded unless
/// writers are supplied.
pub struct ExecRequest {
    command: String,
    args: Vec<String>,
    env: Vec<String>,
    stdin: Option<BoxedReader>,
    stdout: BoxedWriter,
    stderr: BoxedWriter,
    privileged: bool,
    cwd: Option<String>,
    user: Option<User>,
}

impl ExecRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: Vec::new(),
            stdin: None,
            stdout: Box::new(tokio::io::sink()),
            stderr: Box::new(tokio::io::sink()),
            privileged: false,
            cwd: None,
            user: None,
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set `key` in the process environment. Later values for the same key
    /// win over earlier ones and over the container's own environment.
    #[must_use]
    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.push(format!("{key}={value}"));
        self
    }

    /// Add a raw `KEY=VALUE` entry.
    #[must_use]
    pub fn env_entry(mut self, entry: impl Into<String>) -> Self {
        self.env.push(entry.into());
        self
    }

    #[must_use]
    pub fn stdin(mut self, reader: impl tokio::io::AsyncRead + Send + Unpin + 'static) -> Self {
        self.stdin = Some(Box::new(reader));
        self
    }

    #[must_use]
    pub fn stdout(mut self, writer: impl tokio::io::AsyncWrite + Send + Unpin + 'static) -> Self {
        self.stdout = Box::new(writer);
        self
    }

    #[must_use]
    pub fn stderr(mut self, writer: impl tokio::io::AsyncWrite + Send + Unpin + 'static) -> Self {
        self.stderr = Box::new(writer);
        self
    }

    /// Grant the exec'd process every capability the driver's own process
    /// holds, in all four sets. This widens the privilege of the new process
    /// only; the container's profile is unchanged.
    #[must_use]
    pub fn privileged(mut self, privileged: bool) -> Self {
        self.privileged = privileged;
        self
    }

    #[must_use]
    pub fn cwd(mut self, dir: impl Into<String>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    #[must_use]
    pub fn user(mut self, uid: u32, gid: u32) -> Self {
        self.user = Some(User {
            uid,
            gid,
            ..User::default()
        });
        self
    }

    pub fn command_line(&self) -> String {
        std::iter::once(self.command.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Debug for ExecRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecRequest")
            .field("command", &self.command)
            .field("args", &self.args)
            .field("env", &self.env)
            .field("stdin", &self.stdin.is_some())
            .field("privileged", &self.privileged)
            .field("cwd", &self.cwd)
            .finish_non_exhaustive()
    }
}

fn env_key(entry: &str) -> &str {
    entry.split_once('=').map_or(entry, |(key, _)| key)
}

/// Merge `overrides` into `base`. Each key appears once: inherited keys keep
/// their position, new keys follow in the order given, and the last value
/// for a key wins.
pub fn merge_env(base: &[String], overrides: &[String]) -> Vec<String> {
    let mut merged: Vec<String> = Vec::with_capacity(base.len() + overrides.len());
    let mut index: HashMap<String, usize> = HashMap::new();
    for entry in base.iter().chain(overrides) {
        let key = env_key(entry);
        match index.get(key) {
            Some(&i) => entry.clone_into(&mut merged[i]),
            None => {
                index.insert(key.to_owned(), merged.len());
                merged.push(entry.clone());
            }
        }
    }
    merged
}

/// Build the exec process spec from the container's process.
fn synthesize_process(
    record: &ContainerRecord,
    command: String,
    args: Vec<String>,
    env: &[String],
    cwd: Option<String>,
    user: Option<User>,
    privileged: bool,
) -> Result<Process, CoreError> {
    let mut process = record.spec.process.clone().ok_or_else(|| {
        CoreError::engine(
            format!("load process spec of {}", record.id),
            EngineError::FailedPrecondition("container spec has no process".to_owned()),
        )
    })?;

    process.terminal = false;
    process.args = std::iter::once(command).chain(args).collect();
    process.env = merge_env(&process.env, env);
    if let Some(cwd) = cwd {
        process.cwd = cwd;
    }
    if let Some(user) = user {
        process.user = user;
    }
    if privileged {
        grant_current_capabilities(&mut process)?;
    }
    Ok(process)
}

/// Copy the driver process' capabilities into the bounding, effective,
/// inheritable and permitted sets of `process`.
pub(crate) fn grant_current_capabilities(process: &mut Process) -> Result<(), CoreError> {
    let caps =
        current_capabilities().map_err(|e| CoreError::engine("read current capabilities", e))?;
    let ambient = process
        .capabilities
        .take()
        .map(|c| c.ambient)
        .unwrap_or_default();
    process.capabilities = Some(Capabilities {
        bounding: caps.clone(),
        effective: caps.clone(),
        inheritable: caps.clone(),
        permitted: caps,
        ambient,
    });
    Ok(())
}

/// Engine-side exec handle. Deleted exactly once: explicitly when the
/// session ends, or from `Drop` when the owning future is cancelled.
pub struct ExecSession {
    engine: Arc<dyn EngineClient>,
    namespace: String,
    container: ContainerId,
    exec_id: ExecId,
    deleted: bool,
}

impl ExecSession {
    fn new(driver: &Driver, container: ContainerId, exec_id: ExecId) -> Self {
        Self {
            engine: Arc::clone(&driver.engine),
            namespace: driver.namespace.clone(),
            container,
            exec_id,
            deleted: false,
        }
    }

    pub fn exec_id(&self) -> &ExecId {
        &self.exec_id
    }

    pub fn container(&self) -> &ContainerId {
        &self.container
    }

    /// Delete the exec process. If this future is dropped before the engine
    /// answers, `Drop` retries the delete.
    async fn delete(mut self) -> Result<(), EngineError> {
        let result = self
            .engine
            .delete_process(&self.namespace, &self.container, &self.exec_id)
            .await;
        self.deleted = true;
        result
    }
}

impl Drop for ExecSession {
    fn drop(&mut self) {
        if self.deleted {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("exec {} abandoned outside a runtime; not deleted", self.exec_id);
            return;
        };
        debug!("exec {} cancelled, deleting in background", self.exec_id);
        let engine = Arc::clone(&self.engine);
        let namespace = std::mem::take(&mut self.namespace);
        let container = self.container.clone();
        let exec_id = self.exec_id.clone();
        handle.spawn(async move {
            if let Err(e) = engine.delete_process(&namespace, &container, &exec_id).await {
                warn!("failed to delete cancelled exec {exec_id}: {e}");
            }
        });
    }
}

impl Driver {
    /// Run a command inside `container` and wait for it to exit.
    ///
    /// Signals delivered to this process while the command runs are forwarded
    /// to it. A non-zero exit is reported as [`CoreError::ExecFailed`].
    pub async fn exec(&self, container: &str, request: ExecRequest) -> Result<(), CoreError> {
        if request.command.is_empty() {
            return Err(CoreError::InvalidInput(
                "exec command must not be empty".to_owned(),
            ));
        }
        let record = self.resolve_one(container).await?;
        let command_line = request.command_line();
        let ExecRequest {
            command,
            args,
            env,
            stdin,
            stdout,
            stderr,
            privileged,
            cwd,
            user,
        } = request;

        let session = ExecSession::new(self, record.id.clone(), ExecId::generate());
        let result = async {
            let process =
                synthesize_process(&record, command, args, &env, cwd, user, privileged)?;
            let (stdin, stdin_eof) = match stdin {
                Some(reader) => {
                    let (closer, eof) = StdinCloser::new(reader);
                    (Some(Box::new(closer) as BoxedReader), Some(eof))
                }
                None => (None, None),
            };
            let io = ProcessIo {
                stdin,
                stdout,
                stderr,
            };
            self.run_session(&session, process, io, stdin_eof, &command_line)
                .await
        }
        .await;

        let exec_id = session.exec_id().clone();
        let cleanup = session.delete().await;
        let status = result?;
        if let Err(e) = cleanup {
            if e.is_not_found() {
                debug!("exec {exec_id} already gone");
            } else {
                return Err(CoreError::engine(format!("delete exec {exec_id}"), e));
            }
        }

        if status.success() {
            Ok(())
        } else {
            Err(CoreError::ExecFailed { code: status.code })
        }
    }

    async fn run_session(
        &self,
        session: &ExecSession,
        process: Process,
        io: ProcessIo,
        stdin_eof: Option<oneshot::Receiver<()>>,
        command_line: &str,
    ) -> Result<ExitStatus, CoreError> {
        let ns = self.namespace.as_str();
        let (id, exec_id) = (session.container(), session.exec_id());

        self.engine
            .exec_process(ns, id, exec_id, process, io)
            .await
            .map_err(|e| CoreError::engine(format!("create exec {exec_id} in {id}"), e))?;

        // Subscribe before starting so no signal slips through.
        let mut relay = self.signals.subscribe()?;
        self.engine
            .start_process(ns, id, exec_id)
            .await
            .map_err(|e| CoreError::engine(format!("start exec {exec_id}"), e))?;
        info!("exec {exec_id} in {id}: {command_line}");

        let mut wait = self.engine.wait_process(ns, id, exec_id);
        let stdin_done = async move {
            match stdin_eof {
                Some(eof) => eof.await.is_ok(),
                None => std::future::pending().await,
            }
        };
        tokio::pin!(stdin_done);
        let mut relay_open = true;
        let mut stdin_open = true;

        loop {
            tokio::select! {
                status = &mut wait => {
                    let status = status
                        .map_err(|e| CoreError::engine(format!("wait exec {exec_id}"), e))?;
                    info!("exec {exec_id} exited with {}", status.code);
                    return Ok(status);
                }
                signal = relay.recv(), if relay_open => match signal {
                    Some(signal) => {
                        debug!("forwarding {signal} to exec {exec_id}");
                        if let Err(e) = self.engine.kill_process(ns, id, exec_id, signal).await {
                            warn!("failed to forward {signal} to exec {exec_id}: {e}");
                        }
                    }
                    None => relay_open = false,
                },
                eof = &mut stdin_done, if stdin_open => {
                    stdin_open = false;
                    if eof {
                        debug!("stdin of exec {exec_id} reached EOF");
                        if let Err(e) = self.engine.close_process_stdin(ns, id, exec_id).await {
                            warn!("failed to close stdin of exec {exec_id}: {e}");
                        }
                    }
                }
            }
        }
    }
}
