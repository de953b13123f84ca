/// Termination protocol for a session's child process.
///
/// `close()` sends the graceful signal, then waits on the closed latch. Every
/// time `close_timeout` elapses first, the child gets a kill signal and the
/// wait starts over. Only the exit watcher ever moves the state to `Closed`.
use crate::error::SessionError;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};
#[cfg(test)]
use std::sync::MutexGuard;
use std::time::Duration;
use tokio::sync::watch;

/// Default graceful signal.
pub const DEFAULT_CLOSE_SIGNAL: Signal = Signal::SIGTERM;

/// Default grace period between the graceful signal and the first kill.
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Where a session is in its shutdown protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    /// Child running, no close requested.
    Running,
    /// Graceful signal delivered, waiting for exit.
    SignalSent,
    /// At least one kill signal delivered, waiting for exit.
    KillSent { attempts: u32 },
    /// Child exited and the pty is closed.
    Closed,
}

const UNKNOWN_EXIT: ExitStatus = ExitStatus {
    code: None,
    signal: None,
};

/// How the child process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    /// Exit code if the process exited normally.
    pub code: Option<i32>,
    /// Terminating signal number if the process was killed by a signal.
    pub signal: Option<i32>,
}

impl ExitStatus {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<std::process::ExitStatus> for ExitStatus {
    fn from(status: std::process::ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }
}

/// Graceful signal, grace period and kill cap for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownPolicy {
    pub close_signal: Signal,
    /// `None` waits forever and never escalates.
    pub close_timeout: Option<Duration>,
    /// `None` re-sends kill signals for as long as the child lives.
    /// `Some(0)` gives up after the first grace period without killing.
    pub kill_retry_limit: Option<u32>,
}

impl Default for ShutdownPolicy {
    fn default() -> Self {
        Self {
            close_signal: DEFAULT_CLOSE_SIGNAL,
            close_timeout: Some(DEFAULT_CLOSE_TIMEOUT),
            kill_retry_limit: None,
        }
    }
}

/// One-shot, multi-waiter latch carrying the child's exit status.
#[derive(Debug)]
pub struct ClosedLatch {
    tx: watch::Sender<Option<ExitStatus>>,
}

impl ClosedLatch {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    /// Fire the latch. Returns `false` if it had already fired; the first status wins.
    pub fn fire(&self, status: ExitStatus) -> bool {
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(status);
            true
        })
    }

    pub fn status(&self) -> Option<ExitStatus> {
        *self.tx.borrow()
    }

    pub fn is_fired(&self) -> bool {
        self.status().is_some()
    }

    /// Wait until the latch fires.
    pub async fn wait(&self) -> ExitStatus {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close under us.
        let status = match rx.wait_for(Option::is_some).await {
            Ok(status) => (*status).unwrap_or(UNKNOWN_EXIT),
            Err(_) => UNKNOWN_EXIT,
        };
        status
    }
}

impl Default for ClosedLatch {
    fn default() -> Self {
        Self::new()
    }
}

/// Owns the signal side of the protocol and the closed latch.
pub struct ShutdownController {
    policy: ShutdownPolicy,
    /// Cleared by the watcher once the child is reaped.
    pid: Mutex<Option<Pid>>,
    state: Mutex<ShutdownState>,
    kills_sent: AtomicU32,
    latch: ClosedLatch,
}

impl ShutdownController {
    pub fn new(pid: u32, policy: ShutdownPolicy) -> Self {
        Self {
            policy,
            pid: Mutex::new(Some(Pid::from_raw(pid as i32))),
            state: Mutex::new(ShutdownState::Running),
            kills_sent: AtomicU32::new(0),
            latch: ClosedLatch::new(),
        }
    }

    pub fn policy(&self) -> &ShutdownPolicy {
        &self.policy
    }

    pub fn state(&self) -> ShutdownState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn kills_sent(&self) -> u32 {
        self.kills_sent.load(Ordering::SeqCst)
    }

    pub fn latch(&self) -> &ClosedLatch {
        &self.latch
    }

    /// Send `signal` to the child. A child that is already gone is a no-op.
    fn deliver(&self, signal: Signal) {
        let slot = self.pid.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(pid) = *slot else {
            tracing::debug!(signal = signal.as_str(), "child already reaped, signal skipped");
            return;
        };
        match signal::kill(pid, signal) {
            Ok(()) => tracing::info!(pid = pid.as_raw(), signal = signal.as_str(), "sent signal"),
            Err(Errno::ESRCH) => {
                tracing::debug!(pid = pid.as_raw(), signal = signal.as_str(), "child already gone")
            }
            Err(e) => tracing::warn!(
                pid = pid.as_raw(),
                signal = signal.as_str(),
                error = %e,
                "failed to deliver signal"
            ),
        }
    }

    fn transition(&self, next: ShutdownState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != ShutdownState::Closed {
            *state = next;
        }
    }

    /// Run the close protocol until the watcher reports the child has exited.
    pub async fn close(&self) -> Result<(), SessionError> {
        if self.latch.is_fired() {
            return Ok(());
        }

        tracing::info!(signal = self.policy.close_signal.as_str(), "closing session");
        self.deliver(self.policy.close_signal);
        if !matches!(self.state(), ShutdownState::KillSent { .. }) {
            self.transition(ShutdownState::SignalSent);
        }

        loop {
            tokio::select! {
                _ = self.latch.wait() => return Ok(()),
                _ = grace_period(self.policy.close_timeout) => {
                    let sent = self.kills_sent();
                    if let Some(limit) = self.policy.kill_retry_limit {
                        if sent >= limit {
                            tracing::warn!(kill_signals = sent, "child survived kill signals, giving up");
                            return Err(SessionError::StillRunning { kill_signals: sent });
                        }
                    }
                    let attempts = self.kills_sent.fetch_add(1, Ordering::SeqCst) + 1;
                    tracing::warn!(attempt = attempts, "close timeout elapsed, escalating to SIGKILL");
                    self.deliver(Signal::SIGKILL);
                    self.transition(ShutdownState::KillSent { attempts });
                }
            }
        }
    }

    /// Forget the pid. Called by the watcher after the child has exited and
    /// before it is reaped, so no signal can reach a recycled pid.
    pub(crate) fn release_pid(&self) -> Option<Pid> {
        self.pid
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Called by the watcher once the child has been reaped and the pty closed.
    pub(crate) fn mark_closed(&self, status: ExitStatus) {
        self.release_pid();
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = ShutdownState::Closed;
        if !self.latch.fire(status) {
            tracing::debug!("closed latch already fired");
        }
    }

    /// Hold the pid slot, blocking both signal delivery and the watcher's reap.
    #[cfg(test)]
    pub(crate) fn lock_pid(&self) -> MutexGuard<'_, Option<Pid>> {
        self.pid.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn grace_period(timeout: Option<Duration>) {
    match timeout {
        Some(timeout) => tokio::time::sleep(timeout).await,
        None => std::future::pending().await,
    }
}
