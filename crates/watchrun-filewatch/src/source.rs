use std::os::fd::AsFd;
use std::path::Path;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify, InotifyEvent, WatchDescriptor};
use thiserror::Error;
use tracing::trace;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("inotify watch quota exhausted (raise fs.inotify.max_user_watches)")]
    NoSpace,
    #[error("watch target vanished before registration")]
    NotFound,
    #[error("permission denied registering watch")]
    Permission,
    #[error("inotify: {0}")]
    Io(Errno),
}

impl From<Errno> for SourceError {
    fn from(errno: Errno) -> Self {
        match errno {
            Errno::ENOSPC => SourceError::NoSpace,
            Errno::ENOENT | Errno::ENOTDIR => SourceError::NotFound,
            Errno::EACCES | Errno::EPERM => SourceError::Permission,
            other => SourceError::Io(other),
        }
    }
}

/// The platform event source: a non-blocking inotify instance.
///
/// One watch per directory; files are observed through their parent
/// directory's watch. `poll` delivers events in the order the kernel
/// produced them for any single descriptor; ordering across descriptors is
/// unspecified.
#[derive(Debug)]
pub struct InotifySource {
    inotify: Inotify,
}

impl InotifySource {
    pub fn new() -> Result<Self, SourceError> {
        let inotify = Inotify::init(InitFlags::IN_NONBLOCK | InitFlags::IN_CLOEXEC)?;
        Ok(Self { inotify })
    }

    /// Register a watch on `dir` for the given mask. None of the error
    /// cases are fatal to the source; the caller decides per call whether
    /// to skip the directory or give up.
    pub fn watch(&self, dir: &Path, mask: AddWatchFlags) -> Result<WatchDescriptor, SourceError> {
        let wd = self.inotify.add_watch(dir, mask)?;
        trace!("watching {}", dir.display());
        Ok(wd)
    }

    /// Drop a watch. Best effort: the kernel removes watches on its own
    /// when the target goes away, so a failure here only gets traced.
    pub fn unwatch(&self, wd: WatchDescriptor) {
        if let Err(errno) = self.inotify.rm_watch(wd) {
            trace!("rm_watch: {errno}");
        }
    }

    /// Block up to `timeout` for events, then drain whatever the kernel
    /// has queued. May return early with any number of events, including
    /// zero. A zero timeout never blocks.
    pub fn poll(&self, timeout: Duration) -> Result<Vec<InotifyEvent>, SourceError> {
        if !timeout.is_zero() && !self.wait_readable(timeout)? {
            return Ok(Vec::new());
        }
        self.drain()
    }

    fn wait_readable(&self, timeout: Duration) -> Result<bool, SourceError> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(false);
            }
            let mut fds = [PollFd::new(self.inotify.as_fd(), PollFlags::POLLIN)];
            match poll(&mut fds, poll_timeout(remaining)) {
                Ok(0) => continue,
                Ok(_) => return Ok(true),
                // interrupted by a signal; keep waiting out the deadline
                Err(Errno::EINTR) => continue,
                Err(errno) => return Err(errno.into()),
            }
        }
    }

    fn drain(&self) -> Result<Vec<InotifyEvent>, SourceError> {
        let mut events = Vec::new();
        loop {
            match self.inotify.read_events() {
                Ok(batch) if batch.is_empty() => break,
                Ok(batch) => events.extend(batch),
                Err(Errno::EAGAIN) => break,
                Err(Errno::EINTR) => continue,
                Err(errno) => return Err(errno.into()),
            }
        }
        Ok(events)
    }
}

/// `poll(2)` takes milliseconds; anything longer than `i32::MAX` ms is
/// clamped and the caller loops around its own deadline.
fn poll_timeout(duration: Duration) -> PollTimeout {
    let millis = duration.as_millis().min(i32::MAX as u128) as i32;
    // a non-blocking zero would busy-loop in wait_readable; round up
    let millis = millis.max(1);
    PollTimeout::try_from(millis).unwrap_or(PollTimeout::MAX)
}
