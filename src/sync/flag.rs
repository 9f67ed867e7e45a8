//! Select-friendly sticky flags.
//!
//! A [`Flag`] is a level-triggered boolean whose set state is mirrored by a
//! readable file descriptor, so it can participate in
//! [`select`](crate::select::select) alongside channels and timers. While
//! the flag is set, one byte sits in an internal socketpair and the read end
//! stays readable; `reset` drains it.

use crate::awaitable::{Awaitable, Trigger};
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::Arc;

struct FlagInner {
    read_half: UnixStream,
    write_half: UnixStream,
    set: Mutex<bool>,
}

/// A sticky, level-triggered boolean with fd-style readiness.
///
/// Cloning a `Flag` shares the underlying state.
#[derive(Clone)]
pub struct Flag {
    inner: Arc<FlagInner>,
}

impl Flag {
    /// Creates a new flag in the reset state.
    ///
    /// # Errors
    ///
    /// Fails if the process is out of file descriptors.
    pub fn new() -> Result<Self> {
        let (read_half, write_half) =
            UnixStream::pair().map_err(|e| Error::from_io(e, "flag socketpair"))?;
        read_half
            .set_nonblocking(true)
            .and_then(|()| write_half.set_nonblocking(true))
            .map_err(|e| Error::from_io(e, "flag non-blocking mode"))?;
        Ok(Self {
            inner: Arc::new(FlagInner {
                read_half,
                write_half,
                set: Mutex::new(false),
            }),
        })
    }

    /// Sets the flag. Idempotent.
    pub fn set(&self) {
        let mut set = self.inner.set.lock();
        if !*set {
            // One byte in flight keeps the read end level-readable.
            if let Err(e) = (&self.inner.write_half).write(b"*") {
                tracing::error!(error = %e, "flag signal byte could not be written");
                return;
            }
            *set = true;
        }
    }

    /// Resets the flag. Idempotent.
    pub fn reset(&self) {
        let mut set = self.inner.set.lock();
        if *set {
            let mut byte = [0u8; 1];
            if let Err(e) = (&self.inner.read_half).read(&mut byte) {
                tracing::error!(error = %e, "flag signal byte could not be drained");
                return;
            }
            *set = false;
        }
    }

    /// Returns whether the flag is currently set.
    #[must_use]
    pub fn is_set(&self) -> bool {
        *self.inner.set.lock()
    }

    /// Returns an awaitable that fires while the flag is set.
    ///
    /// The reaction re-checks under the lock; a wake that lost the race to
    /// a concurrent `reset` reports `TryAgain` and the wait continues.
    #[must_use]
    pub fn async_wait(&self) -> Awaitable<'static, ()> {
        let this = self.clone();
        Awaitable::new(Trigger::Readable(self.fd()), move || {
            if this.is_set() {
                Ok(())
            } else {
                Err(Error::try_again("flag not set"))
            }
        })
    }

    /// Blocks the calling thread until the flag is set.
    ///
    /// # Errors
    ///
    /// Fails with `cancelled` or `deadline_exceeded` from the current
    /// context.
    pub fn wait(&self) -> Result<()> {
        let _ = crate::select::select((self.async_wait(),))?;
        Ok(())
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.inner.read_half.as_raw_fd()
    }
}

impl std::fmt::Debug for Flag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Flag").field("set", &self.is_set()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_reset() {
        let flag = Flag::new().unwrap();
        assert!(!flag.is_set());
    }

    #[test]
    fn set_and_reset_are_idempotent() {
        let flag = Flag::new().unwrap();
        flag.set();
        flag.set();
        assert!(flag.is_set());
        flag.reset();
        flag.reset();
        assert!(!flag.is_set());
    }

    #[test]
    fn clones_share_state() {
        let flag = Flag::new().unwrap();
        let other = flag.clone();
        flag.set();
        assert!(other.is_set());
        other.reset();
        assert!(!flag.is_set());
    }

    #[test]
    fn async_wait_reports_spurious_wakes() {
        let flag = Flag::new().unwrap();
        let mut aw = flag.async_wait();
        assert!(aw.react().unwrap_err().is_try_again());
        flag.set();
        aw.react().unwrap();
    }

    #[test]
    fn wait_returns_once_set() {
        let flag = Flag::new().unwrap();
        flag.set();
        flag.wait().unwrap();
    }
}
