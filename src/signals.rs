/// Signal handling for the host process.
///
/// SIGINT, SIGTERM and SIGHUP ask for the session to be closed.
/// SIGWINCH means the local terminal changed size and the pty should follow.
use tokio::signal::unix::{signal, Signal, SignalKind};

/// What the host was asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostSignal {
    /// Close the session; carries the signal name for logging.
    Shutdown(&'static str),
    /// Mirror the local window size onto the pty.
    Resize,
}

pub struct SignalHandler {
    interrupt: Signal,
    terminate: Signal,
    hangup: Signal,
    window_change: Signal,
}

impl SignalHandler {
    /// Install the handlers. Must be called from within a Tokio runtime.
    pub fn install() -> std::io::Result<SignalHandler> {
        Ok(SignalHandler {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
            hangup: signal(SignalKind::hangup())?,
            window_change: signal(SignalKind::window_change())?,
        })
    }

    /// Wait for the next signal of interest.
    pub async fn recv(&mut self) -> HostSignal {
        tokio::select! {
            _ = self.interrupt.recv() => HostSignal::Shutdown("SIGINT"),
            _ = self.terminate.recv() => HostSignal::Shutdown("SIGTERM"),
            _ = self.hangup.recv() => HostSignal::Shutdown("SIGHUP"),
            _ = self.window_change.recv() => HostSignal::Resize,
        }
    }
}
