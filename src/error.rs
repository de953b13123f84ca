use nix::errno::Errno;

/// Errors that can occur while driving a pty session.
#[derive(Debug)]
pub enum SessionError {
    /// Pty allocation or process start failed. No session was produced.
    Spawn {
        command: String,
        source: std::io::Error,
    },
    /// Read or write on the pty failed.
    Io { source: std::io::Error },
    /// The terminal-control call failed. Carries the raw platform error code.
    Geometry { source: Errno },
    /// Close gave up after the configured number of kill signals.
    StillRunning { kill_signals: u32 },
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::Spawn { command, source } => {
                write!(f, "failed to start command `{}`: {}", command, source)
            }
            SessionError::Io { source } => {
                write!(f, "I/O error on pty: {}", source)
            }
            SessionError::Geometry { source } => {
                write!(f, "terminal size control failed: {}", source)
            }
            SessionError::StillRunning { kill_signals } => {
                write!(
                    f,
                    "process still running after {} kill signal(s)",
                    kill_signals
                )
            }
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SessionError::Spawn { source, .. } => Some(source),
            SessionError::Io { source } => Some(source),
            SessionError::Geometry { source } => Some(source),
            SessionError::StillRunning { .. } => None,
        }
    }
}

impl From<std::io::Error> for SessionError {
    fn from(source: std::io::Error) -> Self {
        SessionError::Io { source }
    }
}
