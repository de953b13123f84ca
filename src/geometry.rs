/// Terminal geometry: rows/cols of a pty and the platform call that moves them.
///
/// The OS contract is the classic window-size descriptor: four 16-bit fields
/// `(rows, cols, xpixel, ypixel)`. The pixel fields are legacy and always 0.
/// Callers work with [`WindowSize`] and never see the descriptor.
use nix::errno::Errno;
use std::os::fd::BorrowedFd;

/// Terminal dimensions in character cells.
///
/// `width` is columns and `height` is rows, matching `Session::resize`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSize {
    pub width: u16,
    pub height: u16,
}

impl WindowSize {
    pub fn new(width: u16, height: u16) -> Self {
        Self { width, height }
    }
}

impl Default for WindowSize {
    fn default() -> Self {
        Self {
            width: 80,
            height: 24,
        }
    }
}

/// Apply `size` to the terminal behind `fd`.
pub fn set_window_size(fd: BorrowedFd<'_>, size: WindowSize) -> Result<(), Errno> {
    platform::set_window_size(fd, size)
}

/// Query the current size of the terminal behind `fd`.
pub fn window_size(fd: BorrowedFd<'_>) -> Result<WindowSize, Errno> {
    platform::window_size(fd)
}

#[cfg(unix)]
mod platform {
    use super::WindowSize;
    use nix::errno::Errno;
    use nix::pty::Winsize;
    use std::os::fd::{AsRawFd, BorrowedFd};

    nix::ioctl_write_ptr_bad!(tiocswinsz, libc::TIOCSWINSZ, Winsize);
    nix::ioctl_read_bad!(tiocgwinsz, libc::TIOCGWINSZ, Winsize);

    pub(super) fn descriptor(size: WindowSize) -> Winsize {
        Winsize {
            ws_row: size.height,
            ws_col: size.width,
            ws_xpixel: 0,
            ws_ypixel: 0,
        }
    }

    pub(super) fn set_window_size(fd: BorrowedFd<'_>, size: WindowSize) -> Result<(), Errno> {
        let winsize = descriptor(size);
        // SAFETY: `fd` is borrowed for the duration of the call and `winsize`
        // is a valid, initialized descriptor.
        unsafe { tiocswinsz(fd.as_raw_fd(), &winsize) }?;
        Ok(())
    }

    pub(super) fn window_size(fd: BorrowedFd<'_>) -> Result<WindowSize, Errno> {
        let mut winsize = descriptor(WindowSize::new(0, 0));
        // SAFETY: the kernel writes a full descriptor into `winsize`.
        unsafe { tiocgwinsz(fd.as_raw_fd(), &mut winsize) }?;
        Ok(WindowSize {
            width: winsize.ws_col,
            height: winsize.ws_row,
        })
    }
}
