mod signals;
mod terminal;

use clap::Parser;
use ptyexec::config::ExecConfig;
use ptyexec::geometry;
use ptyexec::launcher::build_invocation;
use ptyexec::session::Session;
use signals::{HostSignal, SignalHandler};
use std::io::{Read, Write};
use std::os::fd::AsFd;
use std::path::PathBuf;
use std::sync::Arc;
use terminal::RawModeGuard;
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG: &str = "ptyexec.toml";

/// Attach to a running container through a pseudo-terminal, forwarding the
/// local terminal and shutting the child down gracefully on exit.
#[derive(Parser, Debug)]
#[command(name = "ptyexec", version, about)]
pub struct Cli {
    /// Container (or other target) to attach to
    #[arg(value_name = "TARGET")]
    target: String,

    /// Command to run inside the target, split on whitespace
    #[arg(value_name = "ARGS", trailing_var_arg = true, allow_hyphen_values = true, default_value = "sh")]
    args: Vec<String>,

    /// Record the session with the configured recorder
    #[arg(short, long)]
    record: bool,

    /// Config file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print the resolved invocation and exit
    #[arg(long)]
    dry_run: bool,

    /// Debug logging on stderr
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    tracing::debug!(?cli, "parsed CLI arguments");

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("ptyexec: {}", e);
            1
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32, Box<dyn std::error::Error>> {
    let config = match &cli.config {
        Some(path) => ExecConfig::load(path, true)?,
        None => ExecConfig::load(&PathBuf::from(DEFAULT_CONFIG), false)?,
    };
    let options = config.session_options()?;
    let args_line = cli.args.join(" ");

    if cli.dry_run {
        let invocation = build_invocation(
            &cli.target,
            &args_line,
            cli.record,
            &options,
            chrono::Local::now(),
        );
        println!("{}", invocation.command_line());
        println!("close signal: {}", options.close_signal.as_str());
        match options.close_timeout {
            Some(timeout) => println!("close timeout: {:?}", timeout),
            None => println!("close timeout: never escalate"),
        }
        return Ok(0);
    }

    let session = Arc::new(Session::spawn(&cli.target, &args_line, cli.record, &options)?);
    let mut signals = SignalHandler::install()?;
    let raw_mode = RawModeGuard::enter()?;
    mirror_window_size(&session);

    let output = {
        let session = Arc::clone(&session);
        tokio::task::spawn_blocking(move || pump_output(&session))
    };
    {
        // Not joined: a read on stdin cannot be interrupted once the session ends.
        let session = Arc::clone(&session);
        std::thread::Builder::new()
            .name("stdin-pump".into())
            .spawn(move || pump_input(&session))?;
    }

    loop {
        tokio::select! {
            status = session.closed() => {
                tracing::info!(exit_code = ?status.code, signal = ?status.signal, "session ended");
                break;
            }
            signal = signals.recv() => match signal {
                HostSignal::Resize => mirror_window_size(&session),
                HostSignal::Shutdown(name) => {
                    tracing::info!(signal = name, "shutdown requested");
                    session.close().await?;
                    break;
                }
            },
        }
    }

    // The closed pty releases the pump even if a grandchild still holds it open.
    if let Err(e) = output.await {
        tracing::warn!(error = %e, "output pump failed");
    }
    drop(raw_mode);

    let status = session.exit_status();
    Ok(match status {
        Some(s) => s.code.or(s.signal.map(|sig| 128 + sig)).unwrap_or(1),
        None => 1,
    })
}

/// Copy the local terminal's size onto the pty, if stdout is a terminal.
fn mirror_window_size(session: &Session) {
    let stdout = std::io::stdout();
    let Ok(size) = geometry::window_size(stdout.as_fd()) else {
        return;
    };
    if let Err(e) = session.resize(size.width, size.height) {
        tracing::debug!(error = %e, "could not mirror window size");
    }
}

fn pump_output(session: &Session) {
    let mut stdout = std::io::stdout().lock();
    let mut buf = [0u8; 8192];
    loop {
        match session.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if stdout.write_all(&buf[..n]).and_then(|_| stdout.flush()).is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "pty read ended");
                break;
            }
        }
    }
}

fn pump_input(session: &Session) {
    let mut pty = session;
    let mut stdin = std::io::stdin().lock();
    let mut buf = [0u8; 1024];
    loop {
        match stdin.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if let Err(e) = pty.write_all(&buf[..n]) {
                    tracing::debug!(error = %e, "pty write ended");
                    break;
                }
            }
        }
    }
}
