//! Pty allocation and terminal-mode helpers.
//!
//! Built on `nix::pty::openpty` and `nix::unistd`/`libc::ioctl(TIOCSCTTY)`
//! for controlling-tty acquisition, generalized to the engine's
//! three-stream topology.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use nix::pty::{Winsize, openpty};
use nix::sys::termios::{self, LocalFlags, SetArg};

/// A master/slave pty pair.
pub struct PtyPair {
    pub master: OwnedFd,
    pub slave: OwnedFd,
}

/// Default window size used for every pty the engine allocates — the
/// engine's children are never interactive, so a fixed, generous size
/// avoids `SIGWINCH`-dependent line wrapping in uncooperative tools.
pub const DEFAULT_WINSIZE: Winsize = Winsize {
    ws_row: 24,
    ws_col: 80,
    ws_xpixel: 0,
    ws_ypixel: 0,
};

/// Allocate a pty pair with [`DEFAULT_WINSIZE`].
pub fn allocate() -> nix::Result<PtyPair> {
    let result = openpty(Some(&DEFAULT_WINSIZE), None)?;
    Ok(PtyPair {
        master: result.master,
        slave: result.slave,
    })
}

/// Put the master side into raw mode so the engine never sees `\r\n`
/// translation or other line-discipline surprises on output it didn't ask
/// for.
pub fn set_raw(fd: RawFd) -> nix::Result<()> {
    let mut attrs = termios::tcgetattr(unsafe { borrowed(fd) })?;
    termios::cfmakeraw(&mut attrs);
    termios::tcsetattr(unsafe { borrowed(fd) }, SetArg::TCSANOW, &attrs)
}

/// Disable local echo on the stdin pty master.
pub fn disable_echo(fd: RawFd) -> nix::Result<()> {
    let mut attrs = termios::tcgetattr(unsafe { borrowed(fd) })?;
    attrs.local_flags.remove(LocalFlags::ECHO);
    termios::tcsetattr(unsafe { borrowed(fd) }, SetArg::TCSANOW, &attrs)
}

/// Fetch the terminal's configured VEOF byte, falling back to the
/// conventional Ctrl-D (`0x04`) on platforms/ttys where it isn't set.
pub fn veof_byte(fd: RawFd) -> u8 {
    const CTRL_D: u8 = 4;
    termios::tcgetattr(unsafe { borrowed(fd) })
        .map(|attrs| attrs.control_chars[termios::SpecialCharacterIndices::VEOF as usize])
        .unwrap_or(CTRL_D)
}

/// `nix`'s termios functions borrow a `BorrowedFd`; the engine juggles raw
/// fds across thread boundaries (they outlive any single `OwnedFd`
/// borrow), so this wraps the unsafe "fd is valid for this call" contract
/// in one place instead of repeating it at every call site.
///
/// # Safety
/// `fd` must refer to an open file descriptor for the duration of the
/// call; the engine only ever calls this on pty master/slave fds it owns
/// and which remain open until `OProc` closes them.
unsafe fn borrowed(fd: RawFd) -> std::os::fd::BorrowedFd<'static> {
    unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) }
}

/// Apply [`DEFAULT_WINSIZE`] to an already-open pty fd (used when resizing
/// a stdin pty the engine allocated itself).
pub fn set_winsize(fd: RawFd, winsize: &Winsize) -> nix::Result<()> {
    use nix::libc::{TIOCSWINSZ, ioctl};
    // SAFETY: fd is an open pty descriptor owned by the caller; winsize is
    // a valid, fully-initialized struct of the shape the ioctl expects.
    let rc = unsafe { ioctl(fd.as_raw_fd(), TIOCSWINSZ, winsize) };
    if rc == -1 {
        Err(nix::Error::last())
    } else {
        Ok(())
    }
}
