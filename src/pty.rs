//! PTY endpoint: opens a pseudo-terminal pair and publishes the slave under
//! a caller-chosen path, mirroring a classical serial device node.

use std::os::fd::{AsFd, BorrowedFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use nix::pty::openpty;
use nix::sys::stat::{fchmod, Mode};
use nix::sys::termios::{tcgetattr, tcsetattr, LocalFlags, SetArg};
use nix::unistd::ttyname;

use crate::error::{Error, ErrorKind, Result};

/// An open PTY pair, with the slave published as a symlink at a
/// caller-chosen filesystem path.
///
/// Invariant: while the endpoint is alive, a symlink at `published_path`
/// points to the slave's `/dev/pts` entry, and the slave's file mode is
/// world-read/write. `close()` takes `&self` (not `&mut self`) so that a
/// thread other than the one blocked in `read`/`write` can force both fds
/// closed and the symlink removed; it is this struct's only synchronization
/// point, guarding each fd independently so closing one never blocks on a
/// concurrent read/write holding the other.
pub struct PtyEndpoint {
    master: Mutex<Option<OwnedFd>>,
    slave: Mutex<Option<OwnedFd>>,
    published_path: PathBuf,
}

impl PtyEndpoint {
    /// Open a PTY pair and publish the slave name at `published_path`.
    pub fn create(published_path: impl AsRef<Path>) -> Result<Self> {
        let published_path = published_path.as_ref().to_path_buf();

        let pty = openpty(None, None).map_err(|e| {
            Error::with_source(ErrorKind::Fatal, "failed to open PTY pair", e)
        })?;

        let slave_name = ttyname(pty.slave.as_fd())
            .map_err(|e| Error::with_source(ErrorKind::Fatal, "failed to resolve PTY slave name", e))?;

        fchmod(
            pty.slave.as_fd(),
            Mode::from_bits_truncate(0o666),
        )
        .map_err(|e| Error::with_source(ErrorKind::Fatal, "failed to chmod PTY slave", e))?;

        let _ = std::fs::remove_file(&published_path);
        std::os::unix::fs::symlink(&slave_name, &published_path).map_err(|e| {
            Error::with_source(
                ErrorKind::Fatal,
                format!("failed to symlink {} -> {}", published_path.display(), slave_name.display()),
                e,
            )
        })?;

        let mut termios = tcgetattr(pty.master.as_fd())
            .map_err(|e| Error::with_source(ErrorKind::Fatal, "failed to read PTY master termios", e))?;
        termios.local_flags.remove(LocalFlags::ECHO);
        tcsetattr(pty.master.as_fd(), SetArg::TCSAFLUSH, &termios)
            .map_err(|e| Error::with_source(ErrorKind::Fatal, "failed to apply PTY master termios", e))?;

        Ok(Self {
            master: Mutex::new(Some(pty.master)),
            slave: Mutex::new(Some(pty.slave)),
            published_path,
        })
    }

    /// Path of the published symlink.
    pub fn published_path(&self) -> &Path {
        &self.published_path
    }

    fn master_fd(&self) -> Result<RawFd> {
        self.master
            .lock()
            .unwrap()
            .as_ref()
            .map(std::os::fd::AsRawFd::as_raw_fd)
            .ok_or_else(|| Error::new(ErrorKind::PtyIo, "PTY master is closed"))
    }

    /// Blocking read from the master fd.
    ///
    /// Looks up the raw fd and releases the lock before the syscall, so a
    /// concurrent `close()` can drop the owning `OwnedFd` while this call is
    /// parked in the kernel; the read is then interrupted with an error,
    /// which callers must treat as a normal shutdown signal rather than a
    /// transport failure.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let fd = self.master_fd()?;
        // SAFETY: `fd` was a valid, open master descriptor at the moment it
        // was read out of `self.master` above. It remains valid for the
        // duration of this syscall unless `close()` races it, which is the
        // intended wakeup path for a thread parked here during shutdown.
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        let n = nix::unistd::read(borrowed, buf)?;
        Ok(n)
    }

    /// Blocking write to the master fd. See [`PtyEndpoint::read`] for the
    /// fd-lifetime reasoning.
    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        let fd = self.master_fd()?;
        // SAFETY: see `read` above.
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        let n = nix::unistd::write(borrowed, buf)?;
        Ok(n)
    }

    /// Raw master fd, for diagnostics. May go stale immediately after a
    /// concurrent `close()`.
    pub fn master_raw_fd(&self) -> Option<RawFd> {
        self.master
            .lock()
            .unwrap()
            .as_ref()
            .map(std::os::fd::AsRawFd::as_raw_fd)
    }

    /// Close both fds and remove the published symlink. Idempotent, and
    /// safe to call concurrently with an in-progress `read`/`write`: doing
    /// so closes the fd out from under the blocked syscall, which returns
    /// an error instead of hanging.
    pub fn close(&self) {
        self.master.lock().unwrap().take();
        self.slave.lock().unwrap().take();
        let _ = std::fs::remove_file(&self.published_path);
    }
}

impl Drop for PtyEndpoint {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::FileTypeExt;
    use std::sync::Arc;

    #[test]
    fn pty_symlink_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ptyU0");

        let pty = PtyEndpoint::create(&path).unwrap();
        let resolved = std::fs::read_link(&path).unwrap();
        assert!(resolved.starts_with("/dev/pts"));
        let meta = std::fs::metadata(&path).unwrap();
        assert!(meta.file_type().is_char_device());

        pty.close();
        assert!(!path.exists());
    }

    #[test]
    fn close_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ptyU1");
        let pty = PtyEndpoint::create(&path).unwrap();
        pty.close();
        pty.close();
        assert!(!path.exists());
    }

    #[test]
    fn echo_is_disabled_on_master() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ptyU2");
        let pty = PtyEndpoint::create(&path).unwrap();
        let fd = pty.master_raw_fd().unwrap();
        // SAFETY: `pty` outlives this borrow.
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        let termios = tcgetattr(borrowed).unwrap();
        assert!(!termios.local_flags.contains(LocalFlags::ECHO));
    }

    #[test]
    fn read_after_close_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ptyU3");
        let pty = PtyEndpoint::create(&path).unwrap();
        pty.close();
        let mut buf = [0u8; 8];
        assert!(pty.read(&mut buf).is_err());
    }

    #[test]
    fn close_unblocks_a_concurrent_blocking_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ptyU4");
        let pty = Arc::new(PtyEndpoint::create(&path).unwrap());

        let reader = {
            let pty = Arc::clone(&pty);
            std::thread::spawn(move || {
                let mut buf = [0u8; 8];
                pty.read(&mut buf)
            })
        };

        // Give the reader time to park in the blocking read before closing.
        std::thread::sleep(std::time::Duration::from_millis(100));
        pty.close();

        let result = reader.join().unwrap();
        assert!(result.is_err(), "read should be interrupted by close(), not hang");
    }
}
