/// Single session lifecycle: spawn the attach command on a pty, expose the
/// pty as a byte stream, resize it, and shut the child down on request.
use crate::error::SessionError;
use crate::geometry::WindowSize;
use crate::launcher::{self, Invocation};
use crate::pty::PtyChannel;
use crate::shutdown::{
    ExitStatus, ShutdownController, ShutdownPolicy, ShutdownState, DEFAULT_CLOSE_SIGNAL,
    DEFAULT_CLOSE_TIMEOUT,
};
use crate::watcher;
use nix::sys::signal::Signal;
use serde::Serialize;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Construction-time options for a session. Immutable once passed to [`Session::spawn`].
#[derive(Debug, Clone, PartialEq)]
pub struct SessionOptions {
    /// Program that attaches to the target (`<tool> exec -it <target> ...`).
    pub container_tool: String,
    /// Program that wraps the attach command when recording.
    pub recorder_tool: String,
    /// Directory for recordings. `None` writes into the working directory.
    pub recording_dir: Option<PathBuf>,
    /// Window size applied when the pty is allocated.
    pub initial_size: Option<WindowSize>,
    /// Signal sent first on close.
    pub close_signal: Signal,
    /// Grace period before each kill signal. `None` never escalates.
    pub close_timeout: Option<Duration>,
    /// Give up after this many kill signals. `None` keeps re-sending.
    pub kill_retry_limit: Option<u32>,
}

impl SessionOptions {
    pub fn shutdown_policy(&self) -> ShutdownPolicy {
        ShutdownPolicy {
            close_signal: self.close_signal,
            close_timeout: self.close_timeout,
            kill_retry_limit: self.kill_retry_limit,
        }
    }
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            container_tool: "docker".to_string(),
            recorder_tool: "asciinema".to_string(),
            recording_dir: None,
            initial_size: None,
            close_signal: DEFAULT_CLOSE_SIGNAL,
            close_timeout: Some(DEFAULT_CLOSE_TIMEOUT),
            kill_retry_limit: None,
        }
    }
}

/// Labels for a session, e.g. for a window title.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DescriptiveFields {
    pub command: String,
    pub argv: Vec<String>,
    pub pid: u32,
}

/// A child process attached to a pty.
///
/// Reads and writes go straight to the pty. `close` runs the shutdown
/// protocol. A background watcher notices when the child exits, with or
/// without a `close`, and closes the pty.
pub struct Session {
    invocation: Invocation,
    pid: u32,
    pty: Arc<PtyChannel>,
    shutdown: Arc<ShutdownController>,
    watcher: Mutex<Option<JoinHandle<ExitStatus>>>,
}

impl Session {
    /// Attach to `target_id`, running `args_line` split on whitespace.
    ///
    /// Must be called from within a Tokio runtime: the exit watcher is a Tokio
    /// task and is running before this returns.
    pub fn spawn(
        target_id: &str,
        args_line: &str,
        use_recorder: bool,
        options: &SessionOptions,
    ) -> Result<Session, SessionError> {
        let invocation = launcher::build_invocation(
            target_id,
            args_line,
            use_recorder,
            options,
            chrono::Local::now(),
        );
        let (child, pty) = launcher::launch(&invocation, options)?;

        let Some(pid) = child.id() else {
            // Only possible if the child was already reaped, which nothing has done yet.
            return Err(SessionError::Spawn {
                command: invocation.command_line(),
                source: io::Error::new(io::ErrorKind::Other, "child has no pid"),
            });
        };
        tracing::info!(pid, target_id, "pty session started");

        let pty = Arc::new(pty);
        let shutdown = Arc::new(ShutdownController::new(pid, options.shutdown_policy()));
        let watcher = watcher::spawn(child, Arc::clone(&pty), Arc::clone(&shutdown));

        Ok(Session {
            invocation,
            pid,
            pty,
            shutdown,
            watcher: Mutex::new(Some(watcher)),
        })
    }

    /// Blocking read from the pty. `Ok(0)` means the child is gone.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, SessionError> {
        Ok(self.pty.read(buf)?)
    }

    /// Blocking write to the pty. Fails once the session is closed.
    pub fn write(&self, buf: &[u8]) -> Result<usize, SessionError> {
        Ok(self.pty.write(buf)?)
    }

    /// Send the close signal and wait for the child to exit, escalating to
    /// SIGKILL every `close_timeout`.
    pub async fn close(&self) -> Result<(), SessionError> {
        self.shutdown.close().await?;
        self.reap_watcher().await;
        Ok(())
    }

    /// Wait for the watcher's task so a panic inside it surfaces here.
    async fn reap_watcher(&self) {
        let handle = self
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!(pid = self.pid, error = %e, "exit watcher task failed");
            }
        }
    }

    /// Set the pty window size. `width` is columns, `height` is rows.
    pub fn resize(&self, width: u16, height: u16) -> Result<(), SessionError> {
        self.pty
            .resize(WindowSize::new(width, height))
            .map_err(|source| SessionError::Geometry { source })?;
        tracing::debug!(width, height, "resized pty");
        Ok(())
    }

    /// Current pty window size as `(width, height)`.
    pub fn current_size(&self) -> Result<(u16, u16), SessionError> {
        let size = self
            .pty
            .size()
            .map_err(|source| SessionError::Geometry { source })?;
        Ok((size.width, size.height))
    }

    pub fn descriptive_fields(&self) -> DescriptiveFields {
        DescriptiveFields {
            command: self.invocation.command.clone(),
            argv: self.invocation.argv.clone(),
            pid: self.pid,
        }
    }

    pub fn invocation(&self) -> &Invocation {
        &self.invocation
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Wait until the child has exited and the pty is closed.
    pub async fn closed(&self) -> ExitStatus {
        self.shutdown.latch().wait().await
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.latch().is_fired()
    }

    /// How the child ended, once it has.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.shutdown.latch().status()
    }

    pub fn state(&self) -> ShutdownState {
        self.shutdown.state()
    }

    /// Kill signals sent so far by `close`.
    pub fn kill_signals_sent(&self) -> u32 {
        self.shutdown.kills_sent()
    }
}

impl io::Read for &Session {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.pty.read(buf)
    }
}

impl io::Write for &Session {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.pty.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.pty.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use std::time::Instant;

    /// Stand-in container tool: drops `exec -it <target>` and runs the rest.
    const FAKE_TOOL: &str = "#!/bin/sh\nshift 3\nexec \"$@\"\n";

    /// Ignores SIGTERM, announces itself, then idles until killed.
    const STUBBORN: &str = "#!/bin/sh\ntrap '' TERM\necho ready\nwhile :; do sleep 1; done\n";

    /// Leaves a detached grandchild holding the pty, then exits.
    const ORPHANING: &str = "#!/bin/sh\nsetsid sleep 5 &\nsleep 0.3\nexit 0\n";

    /// Exits on SIGTERM once it has announced itself.
    const POLITE: &str = "#!/bin/sh\ntrap 'exit 0' TERM\necho ready\nwhile :; do sleep 0.05; done\n";

    fn write_script(dir: &Path, name: &str, body: &str) -> String {
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.display().to_string()
    }

    fn options(dir: &Path) -> SessionOptions {
        SessionOptions {
            container_tool: write_script(dir, "fake-tool", FAKE_TOOL),
            ..Default::default()
        }
    }

    /// Read until `needle` shows up or the stream ends.
    fn read_until(session: &Session, needle: &str) -> String {
        let mut output = String::new();
        let mut buf = [0u8; 1024];
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            match session.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    output.push_str(&String::from_utf8_lossy(&buf[..n]));
                    if output.contains(needle) {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
        output
    }

    #[test]
    fn test_default_options() {
        let options = SessionOptions::default();
        assert_eq!(options.container_tool, "docker");
        assert_eq!(options.recorder_tool, "asciinema");
        assert_eq!(options.close_signal, Signal::SIGTERM);
        assert_eq!(options.close_timeout, Some(Duration::from_secs(10)));
        assert_eq!(options.shutdown_policy(), ShutdownPolicy::default());
    }

    #[tokio::test]
    async fn test_spawn_failure_returns_no_session() {
        let options = SessionOptions {
            container_tool: "nonexistent-binary-xyz".to_string(),
            ..Default::default()
        };
        let err = Session::spawn("c1", "sh", false, &options).err().unwrap();
        assert!(matches!(err, SessionError::Spawn { .. }));
        assert!(err.to_string().contains("failed to start command"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_child_exit_closes_session_without_close() {
        let dir = tempfile::tempdir().unwrap();
        let session = Session::spawn("c1", "true", false, &options(dir.path())).unwrap();

        let status = tokio::time::timeout(Duration::from_secs(10), session.closed())
            .await
            .unwrap();
        assert!(status.success());
        assert!(session.is_closed());
        assert_eq!(session.state(), ShutdownState::Closed);

        let mut buf = [0u8; 64];
        assert_eq!(session.read(&mut buf).unwrap(), 0);
        let err = session.write(b"late\n").unwrap_err();
        assert!(matches!(err, SessionError::Io { .. }));
        assert!(matches!(
            session.resize(80, 24),
            Err(SessionError::Geometry { .. })
        ));
        assert_eq!(session.kill_signals_sent(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_echo_through_pty() {
        let dir = tempfile::tempdir().unwrap();
        let session = Session::spawn("c1", "cat", false, &options(dir.path())).unwrap();

        session.write(b"hello pty\n").unwrap();
        let output = read_until(&session, "hello pty");
        assert!(output.contains("hello pty"), "got: {output:?}");

        session.close().await.unwrap();
        assert!(session.is_closed());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_close_graceful_never_kills() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "polite", POLITE);
        let options = SessionOptions {
            close_timeout: Some(Duration::from_secs(5)),
            ..options(dir.path())
        };
        let session = Session::spawn("c1", &script, false, &options).unwrap();
        assert!(read_until(&session, "ready").contains("ready"));

        session.close().await.unwrap();
        assert_eq!(session.kill_signals_sent(), 0);
        assert_eq!(session.exit_status().unwrap().code, Some(0));
        assert_eq!(session.state(), ShutdownState::Closed);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_close_escalates_when_signal_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "stubborn", STUBBORN);
        let options = SessionOptions {
            close_timeout: Some(Duration::from_millis(200)),
            ..options(dir.path())
        };
        let session = Session::spawn("c1", &script, false, &options).unwrap();
        assert!(read_until(&session, "ready").contains("ready"));

        let started = Instant::now();
        session.close().await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert_eq!(session.kill_signals_sent(), 1);
        assert_eq!(session.exit_status().unwrap().signal, Some(libc::SIGKILL));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_close_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let session = Session::spawn("c1", "sleep 30", false, &options(dir.path())).unwrap();

        session.close().await.unwrap();
        session.close().await.unwrap();
        assert_eq!(session.kill_signals_sent(), 0);
        assert_eq!(session.exit_status().unwrap().signal, Some(libc::SIGTERM));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_resize_then_current_size() {
        let dir = tempfile::tempdir().unwrap();
        let session = Session::spawn("c1", "sleep 30", false, &options(dir.path())).unwrap();

        session.resize(80, 24).unwrap();
        assert_eq!(session.current_size().unwrap(), (80, 24));
        session.resize(132, 43).unwrap();
        assert_eq!(session.current_size().unwrap(), (132, 43));

        session.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_initial_size_visible_to_child() {
        let dir = tempfile::tempdir().unwrap();
        let options = SessionOptions {
            initial_size: Some(WindowSize::new(101, 33)),
            ..options(dir.path())
        };
        let session = Session::spawn("c1", "stty size", false, &options).unwrap();
        let output = read_until(&session, "33 101");
        assert!(output.contains("33 101"), "got: {output:?}");
        session.closed().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_concurrent_read_and_resize() {
        let dir = tempfile::tempdir().unwrap();
        let session = Arc::new(Session::spawn("c1", "cat", false, &options(dir.path())).unwrap());

        let resizer = {
            let session = Arc::clone(&session);
            std::thread::spawn(move || {
                for i in 0..200u16 {
                    session.resize(40 + i % 80, 10 + i % 40).unwrap();
                }
            })
        };

        (&*session).write_all(b"marker-42\n").unwrap();
        let output = read_until(&session, "marker-42");
        resizer.join().unwrap();

        assert!(output.contains("marker-42"), "got: {output:?}");
        session.resize(80, 24).unwrap();
        assert_eq!(session.current_size().unwrap(), (80, 24));
        session.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_pending_read_unblocks_on_exit() {
        let dir = tempfile::tempdir().unwrap();
        let session = Arc::new(Session::spawn("c1", "sleep 30", false, &options(dir.path())).unwrap());

        let reader = {
            let session = Arc::clone(&session);
            tokio::task::spawn_blocking(move || {
                let mut buf = Vec::new();
                (&*session).read_to_end(&mut buf).map(|_| buf)
            })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        session.close().await.unwrap();

        let drained = tokio::time::timeout(Duration::from_secs(10), reader)
            .await
            .unwrap()
            .unwrap();
        assert!(drained.is_ok());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_pending_read_ends_when_grandchild_keeps_pty_open() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "orphaning", ORPHANING);
        let session = Arc::new(Session::spawn("c1", &script, false, &options(dir.path())).unwrap());

        let reader = {
            let session = Arc::clone(&session);
            tokio::task::spawn_blocking(move || {
                let mut buf = Vec::new();
                (&*session).read_to_end(&mut buf).map(|_| buf)
            })
        };

        let status = tokio::time::timeout(Duration::from_secs(10), session.closed())
            .await
            .unwrap();
        assert!(status.success());

        let drained = tokio::time::timeout(Duration::from_secs(3), reader)
            .await
            .expect("read still blocked after the session closed")
            .unwrap();
        assert!(drained.is_ok());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_descriptive_fields() {
        let dir = tempfile::tempdir().unwrap();
        let options = options(dir.path());
        let session = Session::spawn("web", "sleep   30", false, &options).unwrap();

        let fields = session.descriptive_fields();
        assert_eq!(fields.command, options.container_tool);
        assert_eq!(fields.argv, vec!["exec", "-it", "web", "sleep", "30"]);
        assert_eq!(fields.pid, session.pid());
        assert!(fields.pid > 0);

        let json = serde_json::to_value(&fields).unwrap();
        assert_eq!(json["pid"], fields.pid);
        assert_eq!(json["argv"][2], "web");

        session.close().await.unwrap();
    }
}
