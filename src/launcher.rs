/// Process launching: build the attach invocation, allocate a pty, start the
/// child with the pty as its controlling terminal.
use crate::error::SessionError;
use crate::pty::{self, PtyChannel, PtyPair};
use crate::session::SessionOptions;
use chrono::{DateTime, Local};
use std::process::Stdio;
use tokio::process::{Child, Command};

/// Arguments placed between the container tool and the target identifier.
const ATTACH_ARGS: [&str; 2] = ["exec", "-it"];

/// The program and arguments a session runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub command: String,
    pub argv: Vec<String>,
}

impl Invocation {
    /// Render as a single space-joined command line.
    pub fn command_line(&self) -> String {
        std::iter::once(self.command.as_str())
            .chain(self.argv.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Build the invocation for attaching to `target_id`.
///
/// `args_line` is split on whitespace with no notion of quoting. With
/// `use_recorder`, the attach command line is handed to the recorder as a
/// single `-c` argument and the recording lands in
/// `<target_id>_<HHMMSSmmm>.rec`, stamped from `now`.
pub fn build_invocation(
    target_id: &str,
    args_line: &str,
    use_recorder: bool,
    options: &SessionOptions,
    now: DateTime<Local>,
) -> Invocation {
    let mut argv: Vec<String> = ATTACH_ARGS.iter().map(|a| a.to_string()).collect();
    argv.push(target_id.to_string());
    argv.extend(args_line.split_whitespace().map(str::to_string));

    let attach = Invocation {
        command: options.container_tool.clone(),
        argv,
    };

    if !use_recorder {
        return attach;
    }

    let file_name = recording_file_name(target_id, now);
    let output = match &options.recording_dir {
        Some(dir) => dir.join(file_name).display().to_string(),
        None => file_name,
    };

    Invocation {
        command: options.recorder_tool.clone(),
        argv: vec![
            "rec".to_string(),
            "-t".to_string(),
            target_id.to_string(),
            "-c".to_string(),
            attach.command_line(),
            output,
        ],
    }
}

/// `<target_id>_<HHMMSSmmm>.rec`. Two recordings of one target within the
/// same millisecond collide.
fn recording_file_name(target_id: &str, now: DateTime<Local>) -> String {
    format!("{}_{}.rec", target_id, now.format("%H%M%S%3f"))
}

/// Allocate a pty and start `invocation` attached to it.
///
/// The child gets a new session with the pty's subordinate side as its
/// controlling terminal and as stdin/stdout/stderr. On failure every fd
/// allocated here is dropped before the error is returned.
pub fn launch(
    invocation: &Invocation,
    options: &SessionOptions,
) -> Result<(Child, PtyChannel), SessionError> {
    let spawn_error = |source: std::io::Error| SessionError::Spawn {
        command: invocation.command_line(),
        source,
    };

    let PtyPair {
        controller,
        subordinate,
    } = pty::allocate(options.initial_size).map_err(|e| spawn_error(e.into()))?;
    let channel = PtyChannel::new(controller).map_err(|e| spawn_error(e.into()))?;

    // Clones are close-on-exec, so only the dup'd stdio survive into the child.
    let stdin = subordinate.try_clone().map_err(spawn_error)?;
    let stdout = subordinate.try_clone().map_err(spawn_error)?;
    let stderr = subordinate.try_clone().map_err(spawn_error)?;
    drop(subordinate);

    tracing::info!(
        command = %invocation.command,
        args = ?invocation.argv,
        "spawning pty session"
    );

    let mut command = Command::new(&invocation.command);
    command
        .args(&invocation.argv)
        .stdin(Stdio::from(stdin))
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr));

    // SAFETY: only async-signal-safe calls (setsid, ioctl) run between fork and exec.
    unsafe {
        command.pre_exec(|| {
            nix::unistd::setsid()?;
            if libc::ioctl(libc::STDIN_FILENO, libc::TIOCSCTTY as _, 0) < 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let child = command.spawn().map_err(spawn_error)?;
    // The command still holds the parent's copies of the subordinate side.
    // They must go, or reads on the controller never see the hang-up.
    drop(command);

    Ok((child, channel))
}
