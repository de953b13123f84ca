/// Pty allocation and the raw byte channel over its controller side.
///
/// The controller fd lives in a [`PtyChannel`] slot. Reads and writes clone
/// the handle out of the slot for the duration of one call, so the exit
/// watcher can empty the slot at any time without racing an in-flight read
/// onto a recycled fd number. The controller is non-blocking and every call
/// polls it together with a wake pipe. Closing the channel makes the pipe
/// readable for good, which releases callers that are still waiting even
/// when something outside the child keeps the subordinate side open.
use crate::geometry::{self, WindowSize};
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::pty::openpty;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::sync::{Arc, Mutex, PoisonError};

/// A freshly allocated pty pair.
pub struct PtyPair {
    pub controller: OwnedFd,
    pub subordinate: OwnedFd,
}

/// Allocate a pty, optionally with an initial window size.
///
/// The controller side is marked close-on-exec so it never leaks into the child.
pub fn allocate(initial_size: Option<WindowSize>) -> Result<PtyPair, Errno> {
    let winsize = initial_size.map(|size| nix::pty::Winsize {
        ws_row: size.height,
        ws_col: size.width,
        ws_xpixel: 0,
        ws_ypixel: 0,
    });
    let pty = openpty(winsize.as_ref(), None)?;
    set_cloexec(&pty.master)?;
    Ok(PtyPair {
        controller: pty.master,
        subordinate: pty.slave,
    })
}

fn set_cloexec(fd: &OwnedFd) -> Result<(), Errno> {
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
    Ok(())
}

fn set_nonblocking(fd: &OwnedFd) -> Result<(), Errno> {
    let flags = OFlag::from_bits_truncate(fcntl(fd.as_raw_fd(), FcntlArg::F_GETFL)?);
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(())
}

/// What a poll on the controller woke up for.
enum Wakeup {
    /// The controller is ready, or hung up. Try the syscall.
    Pty,
    /// The channel was closed while waiting.
    Closed,
}

/// Raw, unbuffered byte pipe over the controller side of a pty.
#[derive(Debug)]
pub struct PtyChannel {
    slot: Mutex<Option<Arc<File>>>,
    /// Readable once the channel is closed. Never drained.
    wake_rx: File,
    wake_tx: File,
}

impl PtyChannel {
    /// Take ownership of the controller fd and switch it to non-blocking mode.
    pub fn new(controller: OwnedFd) -> Result<Self, Errno> {
        set_nonblocking(&controller)?;
        let (wake_rx, wake_tx) = nix::unistd::pipe()?;
        set_cloexec(&wake_rx)?;
        set_cloexec(&wake_tx)?;
        Ok(Self {
            slot: Mutex::new(Some(Arc::new(File::from(controller)))),
            wake_rx: File::from(wake_rx),
            wake_tx: File::from(wake_tx),
        })
    }

    fn handle(&self) -> Option<Arc<File>> {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Block until `file` is ready for `events` or the channel is closed.
    ///
    /// A ready controller wins over a close, so a read already in flight
    /// still gets whatever the child left in the buffer.
    fn wait(&self, file: &File, events: PollFlags) -> io::Result<Wakeup> {
        loop {
            let mut fds = [
                PollFd::new(file.as_fd(), events),
                PollFd::new(self.wake_rx.as_fd(), PollFlags::POLLIN),
            ];
            match poll(&mut fds, PollTimeout::NONE) {
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
            if fired(&fds[0]) {
                return Ok(Wakeup::Pty);
            }
            if fired(&fds[1]) {
                return Ok(Wakeup::Closed);
            }
        }
    }

    /// Blocking read. Returns `Ok(0)` once the pty is closed or the child side hung up.
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let Some(file) = self.handle() else {
            return Ok(0);
        };
        loop {
            if let Wakeup::Closed = self.wait(&file, PollFlags::POLLIN)? {
                return Ok(0);
            }
            match (&*file).read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                // Linux reports a hung-up pty as EIO rather than EOF.
                Err(e) if e.raw_os_error() == Some(libc::EIO) => return Ok(0),
                Err(e) => return Err(e),
            }
        }
    }

    /// Blocking write. Fails with `BrokenPipe` once the pty is closed.
    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let Some(file) = self.handle() else {
            return Err(closed_error());
        };
        loop {
            if let Wakeup::Closed = self.wait(&file, PollFlags::POLLOUT)? {
                return Err(closed_error());
            }
            match (&*file).write(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    pub fn flush(&self) -> io::Result<()> {
        match self.handle() {
            Some(file) => (&*file).flush(),
            None => Err(closed_error()),
        }
    }

    pub fn resize(&self, size: WindowSize) -> Result<(), Errno> {
        let file = self.handle().ok_or(Errno::EBADF)?;
        geometry::set_window_size(file.as_fd(), size)
    }

    pub fn size(&self) -> Result<WindowSize, Errno> {
        let file = self.handle().ok_or(Errno::EBADF)?;
        geometry::window_size(file.as_fd())
    }

    /// Drop the channel's reference to the controller fd and wake every
    /// caller still waiting on it. Later calls see a closed pty.
    pub fn close(&self) {
        let taken = self
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if taken.is_some() {
            if let Err(e) = (&self.wake_tx).write(&[1]) {
                tracing::warn!(error = %e, "failed to wake pty waiters");
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.handle().is_none()
    }
}

fn fired(fd: &PollFd<'_>) -> bool {
    fd.revents().is_some_and(|r| !r.is_empty())
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "pty is closed")
}
