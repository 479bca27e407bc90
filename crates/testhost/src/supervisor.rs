//! Test host process supervisor.
//!
//! Spawns a child with captured output, drives the process lifetime
//! extension points around it and reports exactly one exit per start.
//!
//! Exit codes are the child's own; signal deaths map to `128 + signal`.
//! [`EXIT_CODE_SPAWN_FAILED`] and [`EXIT_CODE_KILLED`] cover the cases where
//! the OS has no code to give.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::extensions::host::{ActiveExtensions, contain};
use crate::extensions::points::ValidationResult;
use crate::logging::HOST_OUTPUT_TARGET;

pub const EXIT_CODE_SPAWN_FAILED: i32 = -1;
pub const EXIT_CODE_KILLED: i32 = -2;

/// Per-stream cap on captured child output. Lines past it are still logged.
pub const MAX_CAPTURED_OUTPUT: usize = 1024 * 1024;

pub const DEFAULT_KILL_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// How long to wait for output pipes to close once the child is gone.
/// Grandchildren may keep them open indefinitely.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

const REDACTED: &str = "<redacted>";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    NotStarted,
    Starting,
    Running,
    Exited,
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("pre-start validation failed in '{extension}': {reason}")]
    PreStartValidationFailed { extension: String, reason: String },

    #[error("start cancelled")]
    Cancelled,
}

/// A single environment override. Secret values never reach `Debug` or logs.
#[derive(Clone, PartialEq, Eq)]
pub struct EnvironmentVariable {
    pub name: String,
    pub value: String,
    pub is_secret: bool,
}

impl EnvironmentVariable {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            is_secret: false,
        }
    }

    pub fn secret(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            is_secret: true,
            ..Self::new(name, value)
        }
    }

    fn display_value(&self) -> &str {
        if self.is_secret { REDACTED } else { &self.value }
    }
}

impl fmt::Debug for EnvironmentVariable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnvironmentVariable")
            .field("name", &self.name)
            .field("value", &self.display_value())
            .field("is_secret", &self.is_secret)
            .finish()
    }
}

/// Overrides applied on top of the controller's own environment.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct EnvironmentOverrides {
    vars: BTreeMap<String, EnvironmentVariable>,
}

impl EnvironmentOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.insert(EnvironmentVariable::new(name, value));
    }

    pub fn set_secret(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.insert(EnvironmentVariable::secret(name, value));
    }

    /// Replaces any existing entry with the same name.
    pub fn insert(&mut self, var: EnvironmentVariable) {
        self.vars.insert(var.name.clone(), var);
    }

    pub fn get(&self, name: &str) -> Option<&EnvironmentVariable> {
        self.vars.get(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<EnvironmentVariable> {
        self.vars.remove(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &EnvironmentVariable> {
        self.vars.values()
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

impl fmt::Debug for EnvironmentOverrides {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.vars.iter().map(|(name, var)| (name, var.display_value())))
            .finish()
    }
}

/// What to run.
#[derive(Debug, Clone)]
pub struct ProcessStartInfo {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: EnvironmentOverrides,
    pub current_dir: Option<PathBuf>,
}

impl ProcessStartInfo {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: EnvironmentOverrides::new(),
            current_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.set(name, value);
        self
    }

    pub fn env_secret(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.set_secret(name, value);
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(self.env.iter().map(|var| (&var.name, &var.value)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.current_dir {
            command.current_dir(dir);
        }
        command
    }
}

/// Passed to started callbacks.
#[derive(Debug, Clone)]
pub struct ProcessInfo {
    pub pid: u32,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    Exited,
    Signaled(i32),
    Killed(String),
    SpawnFailed(String),
}

/// Passed to exited callbacks and returned from [`SupervisedProcess::wait`].
#[derive(Debug, Clone)]
pub struct ProcessExit {
    pub pid: Option<u32>,
    pub exit_code: i32,
    pub reason: ExitReason,
    pub stdout: String,
    pub stderr: String,
    pub exited_at: DateTime<Utc>,
}

/// Point-in-time view of a supervised process.
#[derive(Debug, Clone)]
pub struct ProcessRecord {
    pub id: Uuid,
    pub pid: Option<u32>,
    pub program: PathBuf,
    pub state: ProcessState,
    pub exit_code: Option<i32>,
    pub started_at: Option<DateTime<Utc>>,
    pub exited_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct CapturedOutput {
    bytes: Vec<u8>,
    truncated: bool,
}

impl CapturedOutput {
    fn push(&mut self, line: &[u8]) {
        let room = MAX_CAPTURED_OUTPUT.saturating_sub(self.bytes.len());
        if line.len() > room {
            self.bytes.extend_from_slice(&line[..room]);
            self.truncated = true;
        } else {
            self.bytes.extend_from_slice(line);
        }
    }

    fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

struct ProcessInner {
    id: Uuid,
    pid: Option<u32>,
    program: PathBuf,
    started_at: Option<DateTime<Utc>>,
    state: watch::Sender<ProcessState>,
    exit: watch::Sender<Option<ProcessExit>>,
    kill_token: CancellationToken,
    kill_reason: Mutex<Option<String>>,
    exit_reported: AtomicBool,
    stdout: Arc<Mutex<CapturedOutput>>,
    stderr: Arc<Mutex<CapturedOutput>>,
}

impl ProcessInner {
    fn new(program: PathBuf, pid: Option<u32>, state: ProcessState) -> Self {
        let (state, _) = watch::channel(state);
        let (exit, _) = watch::channel(None);
        Self {
            id: Uuid::new_v4(),
            pid,
            program,
            started_at: pid.map(|_| Utc::now()),
            state,
            exit,
            kill_token: CancellationToken::new(),
            kill_reason: Mutex::new(None),
            exit_reported: AtomicBool::new(false),
            stdout: Arc::default(),
            stderr: Arc::default(),
        }
    }

    fn request_kill(&self, reason: &str) {
        lock(&self.kill_reason).get_or_insert_with(|| reason.to_string());
        self.kill_token.cancel();
    }

    fn kill_reason(&self) -> String {
        lock(&self.kill_reason)
            .clone()
            .unwrap_or_else(|| "killed".to_string())
    }
}

/// Handle to a started (or failed-to-start) process. Cheap to clone.
#[derive(Clone)]
pub struct SupervisedProcess {
    inner: Arc<ProcessInner>,
}

impl fmt::Debug for SupervisedProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SupervisedProcess")
            .field("id", &self.inner.id)
            .field("pid", &self.inner.pid)
            .field("state", &self.state())
            .finish()
    }
}

impl SupervisedProcess {
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// `None` when the spawn failed.
    pub fn pid(&self) -> Option<u32> {
        self.inner.pid
    }

    pub fn state(&self) -> ProcessState {
        *self.inner.state.borrow()
    }

    pub fn has_exited(&self) -> bool {
        self.inner.exit.borrow().is_some()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.inner.exit.borrow().as_ref().map(|exit| exit.exit_code)
    }

    /// Output captured so far.
    pub fn stdout(&self) -> String {
        lock(&self.inner.stdout).text()
    }

    pub fn stderr(&self) -> String {
        lock(&self.inner.stderr).text()
    }

    pub fn record(&self) -> ProcessRecord {
        let exit = self.inner.exit.borrow();
        ProcessRecord {
            id: self.inner.id,
            pid: self.inner.pid,
            program: self.inner.program.clone(),
            state: self.state(),
            exit_code: exit.as_ref().map(|e| e.exit_code),
            started_at: self.inner.started_at,
            exited_at: exit.as_ref().map(|e| e.exited_at),
        }
    }

    /// Resolves once the exit is recorded and every exited callback has run.
    pub async fn wait(&self) -> ProcessExit {
        let mut rx = self.inner.exit.subscribe();
        loop {
            if let Some(exit) = rx.borrow_and_update().clone() {
                return exit;
            }
            // The sender lives in `inner`, so this never reports closed.
            let _ = rx.changed().await;
        }
    }

    /// Ask the process to stop: SIGTERM, then SIGKILL after the grace period.
    /// Repeated calls and calls after exit are no-ops.
    pub fn kill(&self, reason: &str) {
        if self.has_exited() || self.inner.kill_token.is_cancelled() {
            return;
        }
        tracing::info!(pid = ?self.inner.pid, reason, "Killing test host process");
        self.inner.request_kill(reason);
    }
}

/// Starts and tracks test host processes for one controller.
pub struct ProcessSupervisor {
    extensions: ActiveExtensions,
    kill_grace_period: Duration,
    processes: Arc<DashMap<Uuid, SupervisedProcess>>,
}

impl ProcessSupervisor {
    pub fn new(extensions: ActiveExtensions) -> Self {
        Self {
            extensions,
            kill_grace_period: DEFAULT_KILL_GRACE_PERIOD,
            processes: Arc::new(DashMap::new()),
        }
    }

    pub fn with_kill_grace_period(mut self, grace: Duration) -> Self {
        self.kill_grace_period = grace;
        self
    }

    /// Processes that have not exited yet.
    pub fn running(&self) -> Vec<SupervisedProcess> {
        self.processes.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn kill_all(&self, reason: &str) {
        for process in self.running() {
            process.kill(reason);
        }
    }

    /// Prepare the environment, let extensions veto, then spawn.
    ///
    /// An OS spawn failure is not an error here: the returned handle is
    /// already exited with [`EXIT_CODE_SPAWN_FAILED`].
    pub async fn start(
        &self,
        mut start_info: ProcessStartInfo,
        cancel: &CancellationToken,
    ) -> Result<SupervisedProcess, SupervisorError> {
        if cancel.is_cancelled() {
            return Err(SupervisorError::Cancelled);
        }

        self.prepare_environment(&mut start_info.env).await?;
        self.validate_before_start(&start_info).await?;
        if cancel.is_cancelled() {
            return Err(SupervisorError::Cancelled);
        }

        tracing::debug!(
            program = %start_info.program.display(),
            args = ?start_info.args,
            env = ?start_info.env,
            "Spawning test host process"
        );

        let mut child = match start_info.command().spawn() {
            Ok(child) => child,
            Err(e) => return Ok(self.spawn_failed(&start_info, e).await),
        };

        let pid = child.id();
        let inner = Arc::new(ProcessInner::new(
            start_info.program.clone(),
            pid,
            ProcessState::Starting,
        ));
        let process = SupervisedProcess {
            inner: Arc::clone(&inner),
        };
        self.processes.insert(inner.id, process.clone());

        let mut captures = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            captures.push(capture(stdout, "stdout", pid, Arc::clone(&inner.stdout)));
        }
        if let Some(stderr) = child.stderr.take() {
            captures.push(capture(stderr, "stderr", pid, Arc::clone(&inner.stderr)));
        }

        tracing::info!(?pid, program = %start_info.program.display(), "Test host process started");

        // The monitor owns the child from here on, so an exit is reported even
        // if this future is dropped during the started callbacks.
        let (started_tx, started_rx) = oneshot::channel();
        tokio::spawn(monitor(
            child,
            Arc::clone(&inner),
            captures,
            started_rx,
            self.extensions.clone(),
            Arc::clone(&self.processes),
            self.kill_grace_period,
            cancel.clone(),
        ));
        let guard = AbandonedStart(Some(process.clone()));

        let started = ProcessInfo {
            pid: pid.unwrap_or_default(),
            program: start_info.program.clone(),
            args: start_info.args.clone(),
            started_at: inner.started_at.unwrap_or_else(Utc::now),
        };
        for (extension, handler) in self.extensions.process_lifetime_handlers() {
            contain(&extension.info, "on_started", handler.on_started(&started)).await;
        }
        inner.state.send_replace(ProcessState::Running);
        let _ = started_tx.send(());
        guard.disarm();

        Ok(process)
    }

    async fn prepare_environment(&self, env: &mut EnvironmentOverrides) -> Result<(), SupervisorError> {
        for (extension, provider) in self.extensions.environment_providers() {
            contain(&extension.info, "update_environment", provider.update_environment(env)).await;
        }
        for (extension, provider) in self.extensions.environment_providers() {
            let result = contain(
                &extension.info,
                "validate_environment",
                provider.validate_environment(env),
            )
            .await;
            if let Some(ValidationResult::Invalid(reason)) = result {
                return Err(SupervisorError::PreStartValidationFailed {
                    extension: extension.info.id.clone(),
                    reason,
                });
            }
        }
        Ok(())
    }

    async fn validate_before_start(&self, start_info: &ProcessStartInfo) -> Result<(), SupervisorError> {
        for (extension, handler) in self.extensions.process_lifetime_handlers() {
            let result = contain(&extension.info, "before_start", handler.before_start(start_info)).await;
            if let Some(ValidationResult::Invalid(reason)) = result {
                tracing::warn!(extension = %extension.info.id, %reason, "Process start vetoed");
                return Err(SupervisorError::PreStartValidationFailed {
                    extension: extension.info.id.clone(),
                    reason,
                });
            }
        }
        Ok(())
    }

    async fn spawn_failed(&self, start_info: &ProcessStartInfo, error: std::io::Error) -> SupervisedProcess {
        tracing::error!(
            program = %start_info.program.display(),
            error = %error,
            "Failed to spawn test host process"
        );
        let inner = Arc::new(ProcessInner::new(
            start_info.program.clone(),
            None,
            ProcessState::Starting,
        ));
        let exit = ProcessExit {
            pid: None,
            exit_code: EXIT_CODE_SPAWN_FAILED,
            reason: ExitReason::SpawnFailed(error.to_string()),
            stdout: String::new(),
            stderr: String::new(),
            exited_at: Utc::now(),
        };
        report_exit(&inner, &self.extensions, exit).await;
        SupervisedProcess { inner }
    }
}

/// Kills a process whose `start` call was dropped before returning it.
struct AbandonedStart(Option<SupervisedProcess>);

impl AbandonedStart {
    fn disarm(mut self) {
        self.0 = None;
    }
}

impl Drop for AbandonedStart {
    fn drop(&mut self) {
        if let Some(process) = self.0.take() {
            process.kill("start abandoned");
        }
    }
}

fn capture<R>(
    stream: R,
    name: &'static str,
    pid: Option<u32>,
    sink: Arc<Mutex<CapturedOutput>>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut line = Vec::new();
        loop {
            line.clear();
            match reader.read_until(b'\n', &mut line).await {
                Ok(0) => break,
                Ok(_) => {
                    tracing::debug!(
                        target: HOST_OUTPUT_TARGET,
                        ?pid,
                        stream = name,
                        "{}",
                        String::from_utf8_lossy(&line).trim_end()
                    );
                    lock(&sink).push(&line);
                }
                Err(e) => {
                    tracing::debug!(?pid, stream = name, error = %e, "Output capture ended");
                    break;
                }
            }
        }
        if lock(&sink).truncated {
            tracing::warn!(?pid, stream = name, limit = MAX_CAPTURED_OUTPUT, "Captured output truncated");
        }
    })
}

async fn monitor(
    mut child: Child,
    inner: Arc<ProcessInner>,
    captures: Vec<JoinHandle<()>>,
    started: oneshot::Receiver<()>,
    extensions: ActiveExtensions,
    processes: Arc<DashMap<Uuid, SupervisedProcess>>,
    grace: Duration,
    cancel: CancellationToken,
) {
    let status = tokio::select! {
        status = child.wait() => Some(status),
        _ = inner.kill_token.cancelled() => None,
        _ = cancel.cancelled() => {
            inner.request_kill("cancelled");
            None
        }
    };

    let (exit_code, reason) = match status {
        Some(Ok(status)) => exit_code_of(status),
        Some(Err(e)) => {
            tracing::error!(pid = ?inner.pid, error = %e, "Failed to wait for test host process");
            terminate(&mut child, Duration::ZERO).await;
            (EXIT_CODE_KILLED, ExitReason::Killed(format!("wait failed: {e}")))
        }
        None => {
            terminate(&mut child, grace).await;
            (EXIT_CODE_KILLED, ExitReason::Killed(inner.kill_reason()))
        }
    };

    for task in captures {
        let abort = task.abort_handle();
        if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, task).await.is_err() {
            tracing::debug!(pid = ?inner.pid, "Output still open after exit, detaching");
            abort.abort();
        }
    }

    let exit = ProcessExit {
        pid: inner.pid,
        exit_code,
        reason,
        stdout: lock(&inner.stdout).text(),
        stderr: lock(&inner.stderr).text(),
        exited_at: Utc::now(),
    };
    processes.remove(&inner.id);
    // Started callbacks finish (or are abandoned) before exited ones run.
    let _ = started.await;
    report_exit(&inner, &extensions, exit).await;
}

/// Record the exit and run exited callbacks. Only the first call has any effect.
async fn report_exit(inner: &ProcessInner, extensions: &ActiveExtensions, exit: ProcessExit) {
    if inner.exit_reported.swap(true, Ordering::SeqCst) {
        return;
    }
    tracing::info!(
        pid = ?exit.pid,
        exit_code = exit.exit_code,
        reason = ?exit.reason,
        "Test host process exited"
    );
    inner.state.send_replace(ProcessState::Exited);
    for (extension, handler) in extensions.process_lifetime_handlers() {
        contain(&extension.info, "on_exited", handler.on_exited(&exit)).await;
    }
    inner.exit.send_replace(Some(exit));
}

async fn terminate(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        if !grace.is_zero()
            && let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok())
        {
            match kill(Pid::from_raw(pid), Signal::SIGTERM) {
                Ok(()) => {
                    if let Ok(Ok(_)) = tokio::time::timeout(grace, child.wait()).await {
                        return;
                    }
                    tracing::warn!(pid, ?grace, "Test host ignored SIGTERM, sending SIGKILL");
                }
                Err(e) => tracing::debug!(pid, error = %e, "SIGTERM failed"),
            }
        }
    }
    if let Err(e) = child.kill().await {
        tracing::warn!(error = %e, "Failed to kill test host process");
    }
}

fn exit_code_of(status: ExitStatus) -> (i32, ExitReason) {
    if let Some(code) = status.code() {
        return (code, ExitReason::Exited);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return (128 + signal, ExitReason::Signaled(signal));
        }
    }
    (EXIT_CODE_KILLED, ExitReason::Killed(format!("terminated: {status}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extensions::host::ExtensionHost;
    use crate::extensions::points::{
        EnvironmentProvider, Extension, ExtensionInfo, ExtensionPoint, ProcessLifetimeHandler,
    };
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    #[derive(Default)]
    struct Lifecycle {
        veto: Option<String>,
        started: AtomicUsize,
        exits: Mutex<Vec<i32>>,
    }

    #[async_trait]
    impl Extension for Lifecycle {
        fn as_process_lifetime_handler(&self) -> Option<&dyn ProcessLifetimeHandler> {
            Some(self)
        }
    }

    #[async_trait]
    impl ProcessLifetimeHandler for Lifecycle {
        async fn before_start(&self, _info: &ProcessStartInfo) -> anyhow::Result<ValidationResult> {
            Ok(match &self.veto {
                Some(reason) => ValidationResult::invalid(reason),
                None => ValidationResult::Valid,
            })
        }

        async fn on_started(&self, process: &ProcessInfo) -> anyhow::Result<()> {
            assert!(process.pid > 0);
            self.started.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn on_exited(&self, exit: &ProcessExit) -> anyhow::Result<()> {
            self.exits.lock().unwrap().push(exit.exit_code);
            Ok(())
        }
    }

    struct Greeter {
        reject: bool,
    }

    #[async_trait]
    impl Extension for Greeter {
        fn as_environment_provider(&self) -> Option<&dyn EnvironmentProvider> {
            Some(self)
        }
    }

    #[async_trait]
    impl EnvironmentProvider for Greeter {
        async fn update_environment(&self, env: &mut EnvironmentOverrides) -> anyhow::Result<()> {
            env.set("GREETING", "hello");
            env.set_secret("TESTHOST_TOKEN", "hunter2");
            Ok(())
        }

        async fn validate_environment(&self, env: &EnvironmentOverrides) -> anyhow::Result<ValidationResult> {
            if self.reject && env.get("GREETING").is_some() {
                return Ok(ValidationResult::invalid("greetings are not allowed"));
            }
            Ok(ValidationResult::Valid)
        }
    }

    async fn supervisor_with(extensions: Vec<(ExtensionPoint, &str, Arc<dyn Extension>)>) -> ProcessSupervisor {
        let mut host = ExtensionHost::new();
        for (point, id, extension) in extensions {
            host.register(point, ExtensionInfo::new(id, id, "1.0.0"), move || Ok(extension))
                .unwrap();
        }
        ProcessSupervisor::new(host.build_active_set().await)
            .with_kill_grace_period(Duration::from_millis(200))
    }

    fn sh(script: &str) -> ProcessStartInfo {
        ProcessStartInfo::new("sh").args(["-c", script])
    }

    #[tokio::test]
    async fn exit_code_and_output_are_reported_once() {
        let lifecycle = Arc::new(Lifecycle::default());
        let supervisor = supervisor_with(vec![(
            ExtensionPoint::ProcessLifetimeHandler,
            "lifecycle",
            lifecycle.clone() as Arc<dyn Extension>,
        )])
        .await;

        let process = supervisor
            .start(sh("echo out; echo err >&2; exit 3"), &CancellationToken::new())
            .await
            .unwrap();
        assert!(process.pid().is_some());

        let exit = process.wait().await;
        assert_eq!(exit.exit_code, 3);
        assert_eq!(exit.reason, ExitReason::Exited);
        assert_eq!(exit.stdout, "out\n");
        assert_eq!(exit.stderr, "err\n");
        assert_eq!(process.state(), ProcessState::Exited);
        assert_eq!(process.exit_code(), Some(3));

        process.kill("late");
        process.wait().await;
        assert_eq!(lifecycle.started.load(Ordering::SeqCst), 1);
        assert_eq!(*lifecycle.exits.lock().unwrap(), vec![3]);
        assert!(supervisor.running().is_empty());
    }

    #[tokio::test]
    async fn immediate_crash_reports_exactly_once() {
        let lifecycle = Arc::new(Lifecycle::default());
        let supervisor = supervisor_with(vec![(
            ExtensionPoint::ProcessLifetimeHandler,
            "lifecycle",
            lifecycle.clone() as Arc<dyn Extension>,
        )])
        .await;

        let process = supervisor
            .start(sh("kill -9 $$"), &CancellationToken::new())
            .await
            .unwrap();
        let exit = process.wait().await;
        assert_eq!(exit.exit_code, 128 + 9);
        assert_eq!(exit.reason, ExitReason::Signaled(9));
        assert_eq!(*lifecycle.exits.lock().unwrap(), vec![137]);
    }

    /// Takes its time in `on_started` and records callback order.
    #[derive(Default)]
    struct SlowStart {
        events: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Extension for SlowStart {
        fn as_process_lifetime_handler(&self) -> Option<&dyn ProcessLifetimeHandler> {
            Some(self)
        }
    }

    #[async_trait]
    impl ProcessLifetimeHandler for SlowStart {
        async fn on_started(&self, _process: &ProcessInfo) -> anyhow::Result<()> {
            tokio::time::sleep(Duration::from_millis(500)).await;
            self.events.lock().unwrap().push("started".into());
            Ok(())
        }

        async fn on_exited(&self, exit: &ProcessExit) -> anyhow::Result<()> {
            self.events.lock().unwrap().push(format!("exited {}", exit.exit_code));
            Ok(())
        }
    }

    async fn slow_start_supervisor() -> (Arc<SlowStart>, ProcessSupervisor) {
        let slow = Arc::new(SlowStart::default());
        let supervisor = supervisor_with(vec![(
            ExtensionPoint::ProcessLifetimeHandler,
            "slow",
            slow.clone() as Arc<dyn Extension>,
        )])
        .await;
        (slow, supervisor)
    }

    #[tokio::test]
    async fn dropped_start_still_reports_the_exit() {
        let (slow, supervisor) = slow_start_supervisor().await;

        let cancel = CancellationToken::new();
        let start = supervisor.start(ProcessStartInfo::new("sleep").arg("30"), &cancel);
        assert!(tokio::time::timeout(Duration::from_millis(100), start).await.is_err());

        tokio::time::timeout(Duration::from_secs(5), async {
            while slow.events.lock().unwrap().is_empty() || !supervisor.running().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(*slow.events.lock().unwrap(), vec![format!("exited {EXIT_CODE_KILLED}")]);
    }

    #[tokio::test]
    async fn started_callbacks_finish_before_exited_ones() {
        let (slow, supervisor) = slow_start_supervisor().await;

        let process = supervisor
            .start(sh("exit 6"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(process.wait().await.exit_code, 6);
        assert_eq!(*slow.events.lock().unwrap(), vec!["started", "exited 6"]);
    }

    #[tokio::test]
    async fn spawn_failure_is_an_exit_not_an_error() {
        let lifecycle = Arc::new(Lifecycle::default());
        let supervisor = supervisor_with(vec![(
            ExtensionPoint::ProcessLifetimeHandler,
            "lifecycle",
            lifecycle.clone() as Arc<dyn Extension>,
        )])
        .await;

        let process = supervisor
            .start(
                ProcessStartInfo::new("/nonexistent/testhost-missing"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(process.pid(), None);
        assert_eq!(process.state(), ProcessState::Exited);
        let exit = process.wait().await;
        assert_eq!(exit.exit_code, EXIT_CODE_SPAWN_FAILED);
        assert!(matches!(exit.reason, ExitReason::SpawnFailed(_)));
        assert_eq!(lifecycle.started.load(Ordering::SeqCst), 0);
        assert_eq!(*lifecycle.exits.lock().unwrap(), vec![EXIT_CODE_SPAWN_FAILED]);
    }

    #[tokio::test]
    async fn veto_prevents_spawn() {
        let lifecycle = Arc::new(Lifecycle {
            veto: Some("not today".into()),
            ..Lifecycle::default()
        });
        let supervisor = supervisor_with(vec![(
            ExtensionPoint::ProcessLifetimeHandler,
            "veto",
            lifecycle.clone() as Arc<dyn Extension>,
        )])
        .await;

        let err = supervisor
            .start(sh("exit 0"), &CancellationToken::new())
            .await
            .unwrap_err();
        insta::assert_snapshot!(err.to_string(), @"pre-start validation failed in 'veto': not today");
        assert_eq!(lifecycle.started.load(Ordering::SeqCst), 0);
        assert!(lifecycle.exits.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn environment_providers_shape_the_child_environment() {
        let supervisor = supervisor_with(vec![(
            ExtensionPoint::EnvironmentProvider,
            "greeter",
            Arc::new(Greeter { reject: false }) as Arc<dyn Extension>,
        )])
        .await;

        let process = supervisor
            .start(
                sh("echo \"$GREETING $TESTHOST_TOKEN $PLAIN\"").env("PLAIN", "set"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(process.wait().await.stdout, "hello hunter2 set\n");
    }

    #[tokio::test]
    async fn invalid_environment_prevents_spawn() {
        let supervisor = supervisor_with(vec![(
            ExtensionPoint::EnvironmentProvider,
            "greeter",
            Arc::new(Greeter { reject: true }) as Arc<dyn Extension>,
        )])
        .await;

        let err = supervisor
            .start(sh("exit 0"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SupervisorError::PreStartValidationFailed { ref extension, .. } if extension == "greeter"
        ));
    }

    #[tokio::test]
    async fn kill_is_idempotent_and_reports_killed() {
        let lifecycle = Arc::new(Lifecycle::default());
        let supervisor = supervisor_with(vec![(
            ExtensionPoint::ProcessLifetimeHandler,
            "lifecycle",
            lifecycle.clone() as Arc<dyn Extension>,
        )])
        .await;

        let process = supervisor
            .start(ProcessStartInfo::new("sleep").arg("30"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(process.state(), ProcessState::Running);

        let started = Instant::now();
        process.kill("test over");
        process.kill("second request");
        let exit = process.wait().await;
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(exit.exit_code, EXIT_CODE_KILLED);
        assert_eq!(exit.reason, ExitReason::Killed("test over".into()));
        assert_eq!(*lifecycle.exits.lock().unwrap(), vec![EXIT_CODE_KILLED]);
    }

    #[tokio::test]
    async fn sigterm_ignoring_child_is_killed_after_grace() {
        let supervisor = supervisor_with(Vec::new()).await;
        let process = supervisor
            .start(sh("trap '' TERM; exec sleep 30"), &CancellationToken::new())
            .await
            .unwrap();

        supervisor.kill_all("shutdown");
        let exit = process.wait().await;
        assert_eq!(exit.exit_code, EXIT_CODE_KILLED);
    }

    #[tokio::test]
    async fn cancellation_stops_start_and_running_process() {
        let supervisor = supervisor_with(Vec::new()).await;
        let cancelled = CancellationToken::new();
        cancelled.cancel();
        assert!(matches!(
            supervisor.start(sh("exit 0"), &cancelled).await,
            Err(SupervisorError::Cancelled)
        ));

        let cancel = CancellationToken::new();
        let process = supervisor
            .start(ProcessStartInfo::new("sleep").arg("30"), &cancel)
            .await
            .unwrap();
        cancel.cancel();
        let exit = process.wait().await;
        assert_eq!(exit.reason, ExitReason::Killed("cancelled".into()));
    }

    #[test]
    fn secrets_are_redacted_in_debug() {
        let mut env = EnvironmentOverrides::new();
        env.set("PLAIN", "visible");
        env.set_secret("TOKEN", "hunter2");
        insta::assert_snapshot!(format!("{env:?}"), @r#"{"PLAIN": "visible", "TOKEN": "<redacted>"}"#);

        let secret = format!("{:?}", env.get("TOKEN").unwrap());
        assert!(!secret.contains("hunter2"));
    }

    #[test]
    fn captured_output_is_capped() {
        let mut output = CapturedOutput::default();
        output.push(&vec![b'x'; MAX_CAPTURED_OUTPUT - 1]);
        output.push(b"yz\n");
        assert_eq!(output.bytes.len(), MAX_CAPTURED_OUTPUT);
        assert!(output.truncated);
    }
}
