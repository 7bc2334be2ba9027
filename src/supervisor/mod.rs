//! Allocation engine process supervisor.
//!
//! Owns the out-of-process lifetime of exactly one `allot-engine` worker:
//! start, stop, deadline-based auto-stop, and crash-safe cleanup. The worker
//! is spawned into its own process group so it can later be signalled as a
//! group without touching the supervisor's own group — the one invariant this
//! module exists to protect.

mod deadline;
pub mod pidfile;

pub use deadline::{DeadlineError, GateDeadline};

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Local;
use nix::sys::signal::{self, Signal};
use nix::unistd::{getpgid, Pid};
use serde::Serialize;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// How long to wait after SIGKILL before declaring the worker stuck.
const KILL_CONFIRM_TIMEOUT: Duration = Duration::from_secs(2);

/// Supervisor configuration.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Worker argv; the program is resolved through `PATH`.
    pub worker_command: Vec<String>,
    /// Path of the pid record.
    pub pid_path: PathBuf,
    /// Directory for the worker's append-only stdout/stderr logs.
    pub log_dir: PathBuf,
    /// Grace period between SIGTERM and SIGKILL.
    pub grace_timeout: Duration,
    /// Interval between liveness probes while waiting.
    pub poll_interval: Duration,
}

impl SupervisorConfig {
    /// Configuration rooted at a data directory.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            worker_command: vec!["allot-engine".to_string()],
            pid_path: data_dir.join("allot-engine.pid"),
            log_dir: data_dir.join("logs"),
            grace_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(250),
        }
    }

    /// Override the worker argv.
    pub fn with_worker_command(mut self, argv: Vec<String>) -> Self {
        self.worker_command = argv;
        self
    }

    /// Override the SIGTERM grace period.
    pub fn with_grace_timeout(mut self, timeout: Duration) -> Self {
        self.grace_timeout = timeout;
        self
    }

    /// Override the liveness poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Result of a start request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StartOutcome {
    /// A worker was spawned.
    Started { pid: u32 },
    /// A worker is already alive; the request was a no-op.
    AlreadyRunning,
}

/// Result of a stop request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StopOutcome {
    /// The worker is confirmed gone.
    Stopped,
    /// No worker was running; the request was a no-op.
    NothingToStop,
    /// The target was refused or survived SIGKILL. Surfaced to the operator,
    /// never swallowed.
    StopFailed,
}

/// Snapshot returned to the control surface.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    /// Whether a worker is currently alive.
    pub running: bool,
    /// Whether the gate-close deadline fired on this interaction.
    pub expired: bool,
    /// Time left until the deadline, when one is set.
    pub remaining: Option<Duration>,
    /// Token the control surface should carry to the next status check;
    /// `None` means any stored token should be cleared.
    pub deadline_token: Option<String>,
}

/// The kill target, resolved from the live handle or the pid record.
enum Target {
    /// Our own child; liveness comes from its exit status so the zombie is
    /// reaped as a side effect.
    Child(Child, i32),
    /// A pid recorded by a previous supervisor incarnation.
    Detached(i32),
}

impl Target {
    fn pid(&self) -> i32 {
        match self {
            Target::Child(_, pid) => *pid,
            Target::Detached(pid) => *pid,
        }
    }

    /// Existence probe. Stopped is only reported once this fails.
    fn alive(&mut self) -> bool {
        match self {
            Target::Child(child, pid) => match child.try_wait() {
                Ok(None) => true,
                Ok(Some(_)) => false,
                Err(e) => {
                    warn!(error = %e, "Exit-status poll failed; falling back to signal probe");
                    detached_alive(*pid)
                }
            },
            Target::Detached(pid) => detached_alive(*pid),
        }
    }
}

/// Existence probe for a pid we hold no handle for.
///
/// When the pid happens to be a child of this process (a handle discarded by
/// a previous supervisor incarnation in the same process), `waitpid` reaps
/// the zombie so the probe cannot report a dead worker as alive; for
/// unrelated processes it is a plain signal-0 check.
fn detached_alive(pid: i32) -> bool {
    use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};

    match waitpid(Pid::from_raw(pid), Some(WaitPidFlag::WNOHANG)) {
        Ok(WaitStatus::StillAlive) => true,
        Ok(_) => false,
        // Not our child; plain existence probe.
        Err(_) => signal::kill(Pid::from_raw(pid), None::<Signal>).is_ok(),
    }
}

#[derive(Default)]
struct Session {
    child: Option<Child>,
    deadline: Option<GateDeadline>,
}

/// Supervisor for one allocation engine worker.
pub struct Supervisor {
    config: SupervisorConfig,
    session: Mutex<Session>,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            session: Mutex::new(Session::default()),
        }
    }

    /// Start the worker, unless one is already alive.
    ///
    /// The worker lands in its own process group, its stdout/stderr go to
    /// append-only logs (best-effort), its pid is recorded on disk, and the
    /// optional gate-close deadline is stored with the session.
    pub async fn start(&self, deadline: Option<GateDeadline>) -> Result<StartOutcome> {
        let mut session = self.session.lock().await;

        if let Some(child) = session.child.as_mut() {
            match child.try_wait() {
                Ok(None) => return Ok(StartOutcome::AlreadyRunning),
                Ok(Some(status)) => {
                    info!(%status, "Previous worker exited; starting a new one");
                    session.child = None;
                }
                Err(e) => {
                    warn!(error = %e, "Exit-status poll failed; assuming previous worker gone");
                    session.child = None;
                }
            }
        }

        // After a supervisor restart there is no handle; the pid record is
        // the only trace of a still-running worker. A start must see it the
        // same way status() does, or it would double-spawn and orphan the
        // recorded worker.
        if let Some(pid) = pidfile::read(&self.config.pid_path) {
            if detached_alive(pid) {
                info!(pid, "Recorded worker is still alive; not starting another");
                return Ok(StartOutcome::AlreadyRunning);
            }
            debug!(pid, "Stale pid record; replacing");
        }

        let child = self.spawn_worker()?;
        let pid = child.id().context("spawned worker has no pid")?;

        if let Err(e) = pidfile::write(&self.config.pid_path, pid) {
            // Stop still works through the live handle.
            warn!(error = %e, "Failed to persist worker pid");
        }

        info!(pid, deadline = ?deadline, "Allocation engine started");
        session.child = Some(child);
        session.deadline = deadline;

        Ok(StartOutcome::Started { pid })
    }

    /// Stop the worker via the safe kill protocol. Idempotent.
    pub async fn stop(&self) -> StopOutcome {
        let mut session = self.session.lock().await;
        self.stop_locked(&mut session).await
    }

    /// Report running/expired state, firing the deadline auto-stop if the
    /// gate close time has passed.
    pub async fn status(&self, deadline_token: Option<&str>) -> StatusReport {
        let mut session = self.session.lock().await;
        let now = Local::now();

        // A token re-presented by the control surface refreshes a session
        // that lost its deadline (e.g. after a supervisor restart).
        if session.deadline.is_none() {
            if let Some(token) = deadline_token {
                match GateDeadline::from_token(token) {
                    Some(deadline) => session.deadline = Some(deadline),
                    None => warn!("Malformed deadline token; treating as no deadline"),
                }
            }
        }

        let mut running = self.poll_running(&mut session);
        let mut expired = false;

        if let Some(deadline) = session.deadline {
            if deadline.is_past(now) {
                expired = true;
                session.deadline = None;
                if running {
                    info!("Gate close time reached; stopping allocation engine");
                    match self.stop_locked(&mut session).await {
                        StopOutcome::StopFailed => {
                            error!("Deadline stop failed; worker may still be running");
                        }
                        _ => running = false,
                    }
                }
            }
        }

        let remaining = session.deadline.and_then(|d| d.remaining(now));
        let deadline_token = session.deadline.map(|d| d.to_token());

        StatusReport {
            running,
            expired,
            remaining,
            deadline_token,
        }
    }

    fn spawn_worker(&self) -> Result<Child> {
        let (program, args) = self
            .config
            .worker_command
            .split_first()
            .context("worker command is empty")?;

        let mut cmd = Command::new(program);
        // The engine reads tokens from stdin unless ALLOT_READER_DEVICE
        // points it at a device, so the stream must stay open.
        cmd.args(args)
            .stdin(Stdio::inherit())
            .stdout(self.open_log("engine.out.log"))
            .stderr(self.open_log("engine.err.log"));

        // New process group, so a later group signal can never reach the
        // supervisor's own group.
        unsafe {
            cmd.pre_exec(|| {
                if libc::setpgid(0, 0) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        cmd.spawn()
            .with_context(|| format!("failed to spawn worker `{program}`"))
    }

    /// Open an append-only worker log. Failure falls back to discarding the
    /// stream; it never blocks the start.
    fn open_log(&self, name: &str) -> Stdio {
        if let Err(e) = std::fs::create_dir_all(&self.config.log_dir) {
            warn!(error = %e, "Failed to create worker log dir; discarding output");
            return Stdio::null();
        }
        let path = self.config.log_dir.join(name);
        match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(file) => Stdio::from(file),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to open worker log; discarding output");
                Stdio::null()
            }
        }
    }

    /// Non-blocking liveness check: exit-status poll for our own child, pid
    /// record plus existence probe after a supervisor restart.
    fn poll_running(&self, session: &mut Session) -> bool {
        if let Some(child) = session.child.as_mut() {
            return match child.try_wait() {
                Ok(None) => true,
                Ok(Some(status)) => {
                    info!(%status, "Worker exited");
                    session.child = None;
                    pidfile::remove(&self.config.pid_path);
                    false
                }
                Err(e) => {
                    warn!(error = %e, "Exit-status poll failed; assuming worker alive");
                    true
                }
            };
        }

        match pidfile::read(&self.config.pid_path) {
            Some(pid) => detached_alive(pid),
            None => false,
        }
    }

    async fn stop_locked(&self, session: &mut Session) -> StopOutcome {
        let mut target = match session.child.take() {
            Some(mut child) => match child.try_wait() {
                Ok(Some(status)) => {
                    info!(%status, "Worker already exited");
                    pidfile::remove(&self.config.pid_path);
                    session.deadline = None;
                    return StopOutcome::NothingToStop;
                }
                Ok(None) | Err(_) => match child.id() {
                    Some(pid) => Target::Child(child, pid as i32),
                    None => {
                        pidfile::remove(&self.config.pid_path);
                        session.deadline = None;
                        return StopOutcome::NothingToStop;
                    }
                },
            },
            None => match pidfile::read(&self.config.pid_path) {
                Some(pid) => Target::Detached(pid),
                None => return StopOutcome::NothingToStop,
            },
        };

        let outcome = self.safe_kill(&mut target).await;
        match outcome {
            StopOutcome::Stopped | StopOutcome::NothingToStop => {
                pidfile::remove(&self.config.pid_path);
                session.deadline = None;
            }
            StopOutcome::StopFailed => {
                // Keep the handle so a retry can resolve the same target.
                if let Target::Child(child, _) = target {
                    session.child = Some(child);
                }
            }
        }
        outcome
    }

    /// The safe kill protocol: guard the target, signal its whole process
    /// group SIGTERM, wait, escalate to SIGKILL, and report Stopped only once
    /// the existence probe fails.
    async fn safe_kill(&self, target: &mut Target) -> StopOutcome {
        let pid = target.pid();
        let own_pid = std::process::id() as i32;

        // Guards against signalling the wrong target after misread state.
        if pid <= 0 {
            error!(pid, "Refusing to signal invalid pid");
            return StopOutcome::StopFailed;
        }
        if pid == own_pid {
            error!(pid, "Refusing to signal the supervisor's own pid");
            return StopOutcome::StopFailed;
        }
        if pid == 1 {
            error!("Refusing to signal pid 1");
            return StopOutcome::StopFailed;
        }

        let pgid = match getpgid(Some(Pid::from_raw(pid))) {
            Ok(pgid) => pgid,
            Err(e) => {
                debug!(pid, error = %e, "Target process group unresolvable; already gone");
                return StopOutcome::Stopped;
            }
        };

        match getpgid(None) {
            Ok(own_pgid) if pgid == own_pgid => {
                // The critical invariant: never signal our own group.
                error!(
                    pid,
                    pgid = pgid.as_raw(),
                    "Target shares the supervisor's process group; refusing to signal"
                );
                return StopOutcome::StopFailed;
            }
            Ok(_) => {}
            Err(e) => {
                error!(error = %e, "Cannot resolve own process group; refusing to signal");
                return StopOutcome::StopFailed;
            }
        }

        info!(pid, pgid = pgid.as_raw(), "Sending SIGTERM to worker group");
        if let Err(e) = signal::killpg(pgid, Signal::SIGTERM) {
            warn!(error = %e, "SIGTERM delivery failed");
        }

        if self.wait_for_exit(target, self.config.grace_timeout).await {
            info!(pid, "Worker stopped gracefully");
            return StopOutcome::Stopped;
        }

        warn!(pid, "Worker ignored SIGTERM; escalating to SIGKILL");
        if let Err(e) = signal::killpg(pgid, Signal::SIGKILL) {
            warn!(error = %e, "SIGKILL delivery failed");
        }

        if self.wait_for_exit(target, KILL_CONFIRM_TIMEOUT).await {
            info!(pid, "Worker force-killed");
            return StopOutcome::Stopped;
        }

        error!(pid, "Worker still alive after SIGKILL");
        StopOutcome::StopFailed
    }

    /// Poll the existence probe until the target is gone or the timeout
    /// elapses.
    async fn wait_for_exit(&self, target: &mut Target, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if !target.alive() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }
}
