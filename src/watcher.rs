/// Exit watcher for a session's child process.
///
/// Runs alongside the child from the moment it is spawned. When the child
/// exits it forgets the pid, reaps the child, closes the pty so pending reads
/// see end-of-stream, and then fires the closed latch. It is the only code
/// that closes the pty.
use crate::pty::PtyChannel;
use crate::shutdown::{ExitStatus, ShutdownController};
use nix::errno::Errno;
use nix::sys::wait::{waitid, Id, WaitPidFlag};
use nix::unistd::Pid;
use std::sync::Arc;
use tokio::process::Child;
use tokio::task::JoinHandle;

/// Start watching `child`. The returned handle finishes once the latch has fired.
pub fn spawn(
    mut child: Child,
    pty: Arc<PtyChannel>,
    shutdown: Arc<ShutdownController>,
) -> JoinHandle<ExitStatus> {
    tokio::spawn(async move {
        let pid = child.id().unwrap_or(0);
        if pid != 0 {
            wait_until_exited(pid).await;
        }
        // The child is a zombie until reaped below, so its pid is still ours.
        shutdown.release_pid();

        let status = match child.wait().await {
            Ok(status) => ExitStatus::from(status),
            Err(e) => {
                tracing::warn!(pid, error = %e, "failed to wait for child, treating it as exited");
                ExitStatus {
                    code: None,
                    signal: None,
                }
            }
        };

        tracing::info!(
            pid,
            exit_code = ?status.code,
            signal = ?status.signal,
            "child exited, closing pty"
        );

        pty.close();
        shutdown.mark_closed(status);
        status
    })
}

/// Block until `pid` has exited, leaving it unreaped.
async fn wait_until_exited(pid: u32) {
    let target = Pid::from_raw(pid as i32);
    let result = tokio::task::spawn_blocking(move || loop {
        match waitid(Id::Pid(target), WaitPidFlag::WEXITED | WaitPidFlag::WNOWAIT) {
            Err(Errno::EINTR) => continue,
            other => return other,
        }
    })
    .await;
    match result {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => tracing::debug!(pid, error = %e, "waitid failed, reaping directly"),
        Err(e) => tracing::warn!(pid, error = %e, "exit wait task failed, reaping directly"),
    }
}
