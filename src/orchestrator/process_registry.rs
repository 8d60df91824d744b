//! Registry of backend subprocesses keyed by session.
//!
//! Each tracked child is owned by a watcher task that waits for it to exit
//! and publishes the exit status on a `watch` channel. Signals are routed
//! to the watcher, so callers never hold the `Child` themselves.

use std::collections::HashMap;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::process::Child;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};

/// Exit status reported by the watcher task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// Exit code, `None` when killed by a signal or unknown.
    pub code: Option<i32>,
    /// Whether the process reported success.
    pub success: bool,
}

impl From<ExitStatus> for ProcessExit {
    fn from(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
            success: status.success(),
        }
    }
}

/// Result of waiting for a subprocess to exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    /// No process was registered for the session.
    NotTracked,
    /// The process exited within the timeout.
    Exited,
    /// The process was still running when the timeout elapsed.
    TimedOut,
}

#[derive(Debug, Clone, Copy)]
enum ProcessSignal {
    Terminate,
    Kill,
}

enum WatchEvent {
    Exited(std::io::Result<ExitStatus>),
    Signal(ProcessSignal),
    ControlClosed,
}

/// Handle to a subprocess owned by its watcher task.
#[derive(Debug, Clone)]
pub struct TrackedProcess {
    session_db_id: i64,
    pid: Option<u32>,
    spawned_at: DateTime<Utc>,
    exit: watch::Receiver<Option<ProcessExit>>,
    control: mpsc::UnboundedSender<ProcessSignal>,
}

impl TrackedProcess {
    /// Hand `child` to a watcher task and return a handle to it.
    ///
    /// Take any piped stdio from the child before calling this.
    #[must_use]
    pub fn spawn_watch(session_db_id: i64, mut child: Child) -> Self {
        let pid = child.id();
        let (exit_tx, exit_rx) = watch::channel(None);
        let (control_tx, mut control_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut control_open = true;
            loop {
                let event = tokio::select! {
                    status = child.wait() => WatchEvent::Exited(status),
                    signal = control_rx.recv(), if control_open => {
                        signal.map_or(WatchEvent::ControlClosed, WatchEvent::Signal)
                    }
                };

                match event {
                    WatchEvent::Signal(signal) => deliver(&mut child, pid, signal),
                    WatchEvent::ControlClosed => control_open = false,
                    WatchEvent::Exited(status) => {
                        let exit = match status {
                            Ok(status) => ProcessExit::from(status),
                            Err(err) => {
                                warn!(session_db_id, %err, "failed to wait for subprocess");
                                ProcessExit {
                                    code: None,
                                    success: false,
                                }
                            }
                        };
                        debug!(session_db_id, pid = ?pid, code = ?exit.code, "subprocess exited");
                        let _ = exit_tx.send(Some(exit));
                        break;
                    }
                }
            }
        });

        Self {
            session_db_id,
            pid,
            spawned_at: Utc::now(),
            exit: exit_rx,
            control: control_tx,
        }
    }

    /// Owning session.
    #[must_use]
    pub fn session_db_id(&self) -> i64 {
        self.session_db_id
    }

    /// OS process id, if the process was still running at registration.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// When the process was handed to the registry.
    #[must_use]
    pub fn spawned_at(&self) -> DateTime<Utc> {
        self.spawned_at
    }

    /// Whether the process is still running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.exit.borrow().is_none()
    }

    /// Exit status, once known.
    #[must_use]
    pub fn exit_status(&self) -> Option<ProcessExit> {
        *self.exit.borrow()
    }

    /// Ask the process to terminate gracefully (`SIGTERM` on unix).
    pub fn terminate(&self) {
        let _ = self.control.send(ProcessSignal::Terminate);
    }

    /// Force-kill the process.
    pub fn kill(&self) {
        let _ = self.control.send(ProcessSignal::Kill);
    }

    /// Wait for the process to exit.
    pub async fn wait(&self) -> Option<ProcessExit> {
        let mut exit = self.exit.clone();
        let status = match exit.wait_for(Option::is_some).await {
            Ok(status) => *status,
            // Watcher gone without reporting; the child was reaped regardless.
            Err(_) => None,
        };
        status
    }
}

fn deliver(child: &mut Child, pid: Option<u32>, signal: ProcessSignal) {
    match signal {
        ProcessSignal::Kill => {
            if let Err(err) = child.start_kill() {
                debug!(pid = ?pid, %err, "kill failed, process likely gone");
            }
        }
        ProcessSignal::Terminate => terminate_gracefully(child, pid),
    }
}

#[cfg(unix)]
fn terminate_gracefully(child: &mut Child, pid: Option<u32>) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(raw) = pid.and_then(|pid| i32::try_from(pid).ok()) else {
        return;
    };
    if let Err(err) = kill(Pid::from_raw(raw), Signal::SIGTERM) {
        debug!(pid = raw, %err, "SIGTERM failed, falling back to kill");
        let _ = child.start_kill();
    }
}

#[cfg(not(unix))]
fn terminate_gracefully(child: &mut Child, _pid: Option<u32>) {
    let _ = child.start_kill();
}

/// Wait up to `timeout` for `handle` to exit.
pub async fn await_exit(handle: &TrackedProcess, timeout: Duration) -> ExitOutcome {
    match tokio::time::timeout(timeout, handle.wait()).await {
        Ok(_) => ExitOutcome::Exited,
        Err(_) => ExitOutcome::TimedOut,
    }
}

/// Shared, synchronized map of live subprocesses.
#[derive(Clone, Default)]
pub struct ProcessRegistry {
    inner: Arc<Mutex<HashMap<i64, TrackedProcess>>>,
}

impl ProcessRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `handle` for its session, replacing any previous entry.
    pub async fn register(&self, handle: TrackedProcess) {
        let session_db_id = handle.session_db_id();
        let pid = handle.pid();
        let previous = self.inner.lock().await.insert(session_db_id, handle);
        if let Some(previous) = previous.filter(TrackedProcess::is_running) {
            warn!(
                session_db_id,
                previous_pid = ?previous.pid(),
                "replacing a subprocess that is still running"
            );
        }
        debug!(session_db_id, pid = ?pid, "subprocess registered");
    }

    /// Look up the subprocess of a session.
    pub async fn lookup(&self, session_db_id: i64) -> Option<TrackedProcess> {
        self.inner.lock().await.get(&session_db_id).cloned()
    }

    /// Stop tracking the subprocess of a session.
    pub async fn unregister(&self, session_db_id: i64) -> Option<TrackedProcess> {
        self.inner.lock().await.remove(&session_db_id)
    }

    /// Every tracked subprocess.
    pub async fn active(&self) -> Vec<TrackedProcess> {
        self.inner.lock().await.values().cloned().collect()
    }

    /// Remove entries whose process already exited. Returns their sessions.
    pub async fn reap_exited(&self) -> Vec<i64> {
        let mut guard = self.inner.lock().await;
        let exited: Vec<i64> = guard
            .iter()
            .filter(|(_, handle)| !handle.is_running())
            .map(|(id, _)| *id)
            .collect();
        for id in &exited {
            guard.remove(id);
        }
        exited
    }

    /// Make sure the subprocess of a session has exited.
    ///
    /// Waits up to `timeout`; on timeout logs a warning, force-kills the
    /// process and returns [`ExitOutcome::TimedOut`] without waiting further.
    /// The entry is removed in every case.
    pub async fn ensure_exit(&self, session_db_id: i64, timeout: Duration) -> ExitOutcome {
        let Some(handle) = self.lookup(session_db_id).await else {
            return ExitOutcome::NotTracked;
        };

        let outcome = await_exit(&handle, timeout).await;
        match outcome {
            ExitOutcome::Exited => {
                info!(session_db_id, pid = ?handle.pid(), "subprocess exit verified");
            }
            ExitOutcome::TimedOut => {
                warn!(
                    session_db_id,
                    pid = ?handle.pid(),
                    ?timeout,
                    "subprocess did not exit in time, killing"
                );
                handle.kill();
            }
            ExitOutcome::NotTracked => {}
        }

        self.unregister(session_db_id).await;
        outcome
    }
}
