//! PTY window size, read off or pushed onto a raw fd via `ioctl(2)`. Grounded
//! on the teacher's `tty.rs`; the client-side raw-mode helpers
//! (`disable_echo`, `set_attach_flags`) have no counterpart here since this
//! daemon never attaches its own stdio to a tty -- that is the GUI client's
//! job, out of scope per §1.

use std::os::unix::io::RawFd;

use anyhow::Context;
use serde_derive::{Deserialize, Serialize};

// see `man ioctl_tty` for info on these ioctl commands
nix::ioctl_read_bad!(tiocgwinsz, libc::TIOCGWINSZ, libc::winsize);
nix::ioctl_write_ptr_bad!(tiocswinsz, libc::TIOCSWINSZ, libc::winsize);

#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Size {
    pub rows: u16,
    pub cols: u16,
}

impl Size {
    /// Returns the terminal size currently set on `fd`.
    pub fn from_fd(fd: RawFd) -> anyhow::Result<Size> {
        let mut term_size = libc::winsize { ws_row: 0, ws_col: 0, ws_xpixel: 0, ws_ypixel: 0 };

        // Safety: term_size is stack allocated and lives for the whole call.
        unsafe {
            tiocgwinsz(fd, &mut term_size).context("fetching term size")?;
        }

        Ok(Size { rows: term_size.ws_row, cols: term_size.ws_col })
    }

    /// Pushes this size onto the tty indicated by `fd`, triggering a
    /// `SIGWINCH` in whatever process group owns it.
    pub fn set_fd(&self, fd: RawFd) -> anyhow::Result<()> {
        let term_size =
            libc::winsize { ws_row: self.rows, ws_col: self.cols, ws_xpixel: 0, ws_ypixel: 0 };

        // Safety: term_size is stack allocated and lives for the whole call.
        unsafe {
            tiocswinsz(fd, &term_size).context("setting term size")?;
        }

        Ok(())
    }
}
