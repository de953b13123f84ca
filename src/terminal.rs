/// Raw mode for the host terminal while a session is attached.
///
/// Input goes to the pty byte for byte, so the local line discipline must
/// not echo, buffer lines or turn Ctrl-C into SIGINT. The guard restores
/// the saved settings when dropped.
use nix::sys::termios::{self, SetArg, Termios};
use std::io::IsTerminal;

pub struct RawModeGuard {
    saved: Termios,
}

impl RawModeGuard {
    /// Put stdin into raw mode. Returns `None` when stdin is not a terminal.
    pub fn enter() -> nix::Result<Option<RawModeGuard>> {
        let stdin = std::io::stdin();
        if !stdin.is_terminal() {
            return Ok(None);
        }
        let saved = termios::tcgetattr(&stdin)?;
        let mut raw = saved.clone();
        termios::cfmakeraw(&mut raw);
        termios::tcsetattr(&stdin, SetArg::TCSANOW, &raw)?;
        tracing::debug!("host terminal in raw mode");
        Ok(Some(RawModeGuard { saved }))
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if let Err(e) = termios::tcsetattr(std::io::stdin(), SetArg::TCSANOW, &self.saved) {
            tracing::warn!(error = %e, "failed to restore host terminal settings");
        }
    }
}
