use std::io;
use std::os::unix::process::CommandExt;
use std::process::ExitStatus;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::{setsid, Pid};
use thiserror::Error;
use tracing::{debug, trace};

/// How often the blocking wait paths poll a child that has a deadline.
const CHILD_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
#[error("failed to spawn `{command}`: {source}")]
pub struct SpawnError {
    pub command: String,
    pub source: io::Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildExit {
    /// The process exited on its own; `None` means it was ended by a
    /// signal we did not send.
    Finished(Option<i32>),
    /// We delivered `signal` to the process group and reaped the child.
    Killed { signal: Signal },
    /// The wall-clock deadline expired and the group was killed.
    TimedOut,
}

impl ChildExit {
    pub fn success(&self) -> bool {
        matches!(self, ChildExit::Finished(Some(0)))
    }

    /// Exit code to propagate when the run's status becomes ours.
    pub fn code(&self) -> i32 {
        match self {
            ChildExit::Finished(Some(code)) => *code,
            ChildExit::Finished(None) | ChildExit::Killed { .. } | ChildExit::TimedOut => 1,
        }
    }
}

/// A supervised child process.
///
/// The child is made leader of a fresh session at spawn (`setsid` in the
/// fork window), so its process group id equals its pid and `kill`
/// reaches every descendant; grandchildren cannot outlive a kill. The
/// exit status is observed exactly once and cached.
#[derive(Debug)]
pub struct Child {
    inner: std::process::Child,
    pgid: Pid,
    started_at: Instant,
    deadline: Option<Instant>,
    timeout_signal: Signal,
    exit: Option<ChildExit>,
}

impl Child {
    /// Spawn `command` in its own process group. When `timeout` is given,
    /// the group receives `timeout_signal` once that much wall-clock time
    /// has passed without an exit.
    pub fn spawn(
        command: &super::Command,
        timeout: Option<Duration>,
        timeout_signal: Signal,
    ) -> Result<Self, SpawnError> {
        let mut std_command = command.to_std();
        unsafe {
            std_command.pre_exec(|| {
                setsid()?;
                Ok(())
            });
        }

        let inner = std_command.spawn().map_err(|source| SpawnError {
            command: command.label(),
            source,
        })?;
        let pgid = Pid::from_raw(inner.id() as i32);
        debug!("spawned `{}` as group {pgid}", command.label());

        let started_at = Instant::now();
        Ok(Self {
            inner,
            pgid,
            started_at,
            deadline: timeout.map(|timeout| started_at + timeout),
            timeout_signal,
            exit: None,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pgid.as_raw() as u32
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// Non-blocking status check. Also the place the deadline is
    /// enforced: an expired deadline triggers the group-kill path.
    pub fn try_wait(&mut self) -> io::Result<Option<ChildExit>> {
        if let Some(exit) = self.exit {
            return Ok(Some(exit));
        }
        if let Some(status) = self.inner.try_wait()? {
            let exit = finished(status);
            self.exit = Some(exit);
            return Ok(Some(exit));
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                debug!("run deadline expired, killing group {}", self.pgid);
                self.kill_group(self.timeout_signal)?;
                let exit = ChildExit::TimedOut;
                self.exit = Some(exit);
                return Ok(Some(exit));
            }
        }
        Ok(None)
    }

    /// Block until the child exits or its deadline expires.
    pub fn wait(&mut self) -> io::Result<ChildExit> {
        if let Some(exit) = self.exit {
            return Ok(exit);
        }
        if self.deadline.is_none() {
            let status = self.inner.wait()?;
            let exit = finished(status);
            self.exit = Some(exit);
            return Ok(exit);
        }
        loop {
            if let Some(exit) = self.try_wait()? {
                return Ok(exit);
            }
            std::thread::sleep(CHILD_POLL_INTERVAL);
        }
    }

    /// Deliver `signal` to the whole group and reap the child. If the
    /// child already exited, that exit wins and no signal is sent.
    pub fn kill(&mut self, signal: Signal) -> io::Result<ChildExit> {
        if let Some(exit) = self.exit {
            return Ok(exit);
        }
        if let Some(status) = self.inner.try_wait()? {
            let exit = finished(status);
            self.exit = Some(exit);
            return Ok(exit);
        }
        self.kill_group(signal)?;
        let exit = ChildExit::Killed { signal };
        self.exit = Some(exit);
        Ok(exit)
    }

    /// Signal the negative pgid and reap the direct child so nothing is
    /// left as a zombie. `ESRCH` means the group raced away already.
    fn kill_group(&mut self, signal: Signal) -> io::Result<()> {
        trace!("sending {signal} to group {}", self.pgid);
        match killpg(self.pgid, signal) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(errno) => return Err(io::Error::from(errno)),
        }
        self.inner.wait()?;
        Ok(())
    }
}

fn finished(status: ExitStatus) -> ChildExit {
    ChildExit::Finished(status.code())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::Command;

    fn shell(script: &str) -> Command {
        Command::new("/bin/sh").arg("-c").arg(script)
    }

    fn group_is_gone(pid: u32) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        let group = Pid::from_raw(-(pid as i32));
        loop {
            match nix::sys::signal::kill(group, None) {
                Err(Errno::ESRCH) => return true,
                _ if Instant::now() >= deadline => return false,
                _ => std::thread::sleep(Duration::from_millis(20)),
            }
        }
    }

    #[test]
    fn reports_exit_code() {
        let mut child = Child::spawn(&shell("exit 3"), None, Signal::SIGKILL).unwrap();
        let exit = child.wait().unwrap();
        assert_eq!(exit, ChildExit::Finished(Some(3)));
        assert_eq!(exit.code(), 3);
        assert!(!exit.success());
    }

    #[test]
    fn reports_success() {
        let mut child = Child::spawn(&shell("true"), None, Signal::SIGKILL).unwrap();
        assert!(child.wait().unwrap().success());
    }

    #[test]
    fn status_is_stable_once_observed() {
        let mut child = Child::spawn(&shell("exit 7"), None, Signal::SIGKILL).unwrap();
        let first = child.wait().unwrap();
        assert_eq!(child.try_wait().unwrap(), Some(first));
        assert_eq!(child.wait().unwrap(), first);
    }

    #[test]
    fn merged_environment_reaches_the_child() {
        let tmp = tempfile::tempdir().unwrap();
        let out = tmp.path().join("out");
        let command = shell(&format!("printf '%s' \"$MARKER\" > {}", out.display()))
            .env("MARKER", "present");
        let mut child = Child::spawn(&command, None, Signal::SIGKILL).unwrap();
        assert!(child.wait().unwrap().success());
        assert_eq!(std::fs::read_to_string(out).unwrap(), "present");
    }

    #[test]
    fn kill_ends_a_long_running_child() {
        let mut child = Child::spawn(&shell("sleep 30"), None, Signal::SIGKILL).unwrap();
        let start = Instant::now();
        let exit = child.kill(Signal::SIGKILL).unwrap();
        assert_eq!(
            exit,
            ChildExit::Killed {
                signal: Signal::SIGKILL
            }
        );
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn kill_reaches_grandchildren() {
        let mut child = Child::spawn(
            &shell("(trap '' TERM; sleep 30) & sleep 30 & wait"),
            None,
            Signal::SIGKILL,
        )
        .unwrap();
        // give the shell a moment to fork its background jobs
        std::thread::sleep(Duration::from_millis(200));
        let pid = child.pid();
        child.kill(Signal::SIGKILL).unwrap();
        assert!(group_is_gone(pid), "descendants survived the group kill");
    }

    #[test]
    fn exit_wins_over_kill() {
        let mut child = Child::spawn(&shell("exit 5"), None, Signal::SIGKILL).unwrap();
        // let it finish before we ask for the kill
        std::thread::sleep(Duration::from_millis(200));
        let exit = child.kill(Signal::SIGKILL).unwrap();
        assert_eq!(exit, ChildExit::Finished(Some(5)));
    }

    #[test]
    fn deadline_expiry_kills_the_group() {
        let mut child = Child::spawn(
            &shell("sleep 30"),
            Some(Duration::from_millis(100)),
            Signal::SIGKILL,
        )
        .unwrap();
        let start = Instant::now();
        let exit = child.wait().unwrap();
        assert_eq!(exit, ChildExit::TimedOut);
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(group_is_gone(child.pid()));
    }
}
