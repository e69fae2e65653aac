use std::collections::HashSet;
use std::env;
use std::io::{self, Write};
use std::time::Duration;

use console::style;
use nix::sys::signal::Signal;
use thiserror::Error;
use tracing::{debug, info, warn};
use watchrun_filewatch::{encode_change_set, MonitorError, MonitorResult, RecursiveMonitor};
use watchrun_process::{Child, ChildExit, Command, SpawnError};

use crate::notification;

/// Poll period while a restartable child runs: the loop alternates a
/// non-blocking child check with a monitor wait of this length.
const RESTART_POLL: Duration = Duration::from_millis(10);
/// Chunk length for the idle wait; purely an upper bound on how long a
/// single blocking poll lasts.
const IDLE_POLL: Duration = Duration::from_millis(500);

const PROG_NAME: &str = "watchrun";

#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Monitor(#[from] MonitorError),
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    #[error("failed supervising command: {0}")]
    Supervise(#[from] io::Error),
}

pub struct RunOptions {
    pub restart: bool,
    pub clear_screen: bool,
    pub debounce: Duration,
    pub timeout: Option<Duration>,
    pub signal: Signal,
    pub export_env: bool,
    pub clear_events: bool,
    pub postpone: bool,
    pub notify: Option<String>,
}

enum Supervised {
    Exited(ChildExit),
    Restart(Vec<MonitorResult>),
}

/// The live-mode driver: idle → debounce → execute, with restart-vs-wait
/// semantics against the running child. Single-threaded throughout; the
/// only blocking points are the monitor's poll and the child wait.
pub struct RunLoop {
    monitor: RecursiveMonitor,
    command: Vec<String>,
    options: RunOptions,
}

impl RunLoop {
    pub fn new(monitor: RecursiveMonitor, command: Vec<String>, options: RunOptions) -> Self {
        Self {
            monitor,
            command,
            options,
        }
    }

    /// Run until externally terminated. Only a failure to set up the very
    /// first child (or a monitor failure) ends the loop with an error.
    pub fn run(mut self) -> Result<(), RunError> {
        let mut first_spawn = true;
        if !self.options.postpone {
            self.cycle(Vec::new(), &mut first_spawn)?;
        }
        loop {
            let changes = self.next_trigger()?;
            debug!("triggered by {} events", changes.len());
            self.cycle(changes, &mut first_spawn)?;
        }
    }

    /// Block until events arrive, then keep folding events into the
    /// change-set for the debounce window.
    fn next_trigger(&mut self) -> Result<Vec<MonitorResult>, RunError> {
        let first = loop {
            let batch = self.monitor.wait(IDLE_POLL)?;
            if !batch.is_empty() {
                break batch;
            }
        };
        self.settle(first)
    }

    fn settle(&mut self, initial: Vec<MonitorResult>) -> Result<Vec<MonitorResult>, RunError> {
        let mut changes = initial;
        if !self.options.debounce.is_zero() {
            let late = self.monitor.collect(self.options.debounce)?;
            merge(&mut changes, late);
        }
        Ok(changes)
    }

    /// One execution cycle, including any restarts it evolves into.
    fn cycle(
        &mut self,
        mut changes: Vec<MonitorResult>,
        first_spawn: &mut bool,
    ) -> Result<(), RunError> {
        loop {
            let child = match self.spawn(&changes) {
                Ok(child) => child,
                Err(err) if *first_spawn => return Err(err.into()),
                Err(err) => {
                    warn!("{err}");
                    return Ok(());
                }
            };
            *first_spawn = false;

            match self.supervise(child)? {
                Supervised::Exited(exit) => {
                    self.report(&exit);
                    if self.options.clear_events {
                        self.monitor.clear()?;
                    }
                    return Ok(());
                }
                Supervised::Restart(new_changes) => {
                    info!("restarting");
                    changes = new_changes;
                }
            }
        }
    }

    fn spawn(&self, changes: &[MonitorResult]) -> Result<Child, SpawnError> {
        if self.options.clear_screen {
            // terminal reset, not just a scroll
            print!("\x1bc");
            let _ = io::stdout().flush();
        }
        let mut command = shell_command(&self.command);
        if self.options.export_env {
            command = command.env("WATCHEXEC_EVENT", encode_change_set(changes));
        }
        Child::spawn(&command, self.options.timeout, self.options.signal)
    }

    /// Watch a running child. Without `restart`, this is just the blocking
    /// wait. With it, alternate the non-blocking exit check and a short
    /// monitor poll; the exit check comes first so that a child finishing
    /// in the same tick as an incoming event is never restarted.
    fn supervise(&mut self, mut child: Child) -> Result<Supervised, RunError> {
        if !self.options.restart {
            return Ok(Supervised::Exited(child.wait()?));
        }
        loop {
            if let Some(exit) = child.try_wait()? {
                return Ok(Supervised::Exited(exit));
            }
            let events = self.monitor.wait(RESTART_POLL)?;
            if !events.is_empty() {
                child.kill(self.options.signal)?;
                let changes = self.settle(events)?;
                return Ok(Supervised::Restart(changes));
            }
        }
    }

    fn report(&self, exit: &ChildExit) {
        report_status(exit, self.options.notify.as_deref());
    }
}

/// Route the argv through the operator's shell; joining the words is the
/// shell's business, not ours.
pub fn shell_command(argv: &[String]) -> Command {
    let shell = env::var("SHELL").unwrap_or_else(|_| String::from("/bin/sh"));
    Command::new(shell).arg("-c").arg(argv.join(" "))
}

/// The per-run verdict line, green check or red cross.
pub fn report_status(exit: &ChildExit, notify: Option<&str>) {
    let (ok, text) = match exit {
        ChildExit::Finished(Some(code)) => (*code == 0, format!("exit status {code}")),
        ChildExit::Finished(None) => (false, String::from("terminated by signal")),
        ChildExit::Killed { signal } => (false, format!("killed by {signal}")),
        ChildExit::TimedOut => (false, String::from("timed out")),
    };
    if ok {
        println!("{}", style(format!("✓ {text}")).green());
    } else {
        println!("{}", style(format!("✗ {text}")).red());
    }
    if let Some(message) = notify {
        notification::send(PROG_NAME, message, &text);
    }
}

fn merge(changes: &mut Vec<MonitorResult>, extra: Vec<MonitorResult>) {
    let seen: HashSet<_> = changes.iter().cloned().collect();
    changes.extend(extra.into_iter().filter(|result| !seen.contains(result)));
}

#[cfg(test)]
mod test {
    use super::*;
    use std::fs;
    use std::path::Path;
    use std::time::Instant;
    use watchrun_filewatch::{GlobFilter, MonitorConfig};

    fn options() -> RunOptions {
        RunOptions {
            restart: false,
            clear_screen: false,
            debounce: Duration::from_millis(50),
            timeout: None,
            signal: Signal::SIGKILL,
            export_env: false,
            clear_events: false,
            postpone: true,
            notify: None,
        }
    }

    fn run_loop_on(root: &Path, command: Vec<String>, options: RunOptions) -> RunLoop {
        let monitor =
            RecursiveMonitor::new(MonitorConfig::new(vec![root.to_owned()], GlobFilter::empty()))
                .unwrap();
        RunLoop::new(monitor, command, options)
    }

    #[test]
    fn burst_inside_debounce_window_is_one_trigger() {
        let tmp = tempfile::tempdir().unwrap();
        let mut run_loop = run_loop_on(tmp.path(), vec!["true".into()], options());

        let dir = tmp.path().to_owned();
        let writer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            fs::write(dir.join("a.txt"), b"a").unwrap();
            std::thread::sleep(Duration::from_millis(10));
            fs::write(dir.join("b.txt"), b"b").unwrap();
        });

        let changes = run_loop.next_trigger().unwrap();
        writer.join().unwrap();

        let paths: HashSet<_> = changes
            .iter()
            .filter_map(|result| result.path.file_name())
            .collect();
        assert!(paths.contains(std::ffi::OsStr::new("a.txt")));
        assert!(paths.contains(std::ffi::OsStr::new("b.txt")));

        // both writes were folded into the one trigger
        assert!(run_loop.monitor.wait(Duration::ZERO).unwrap().is_empty());
    }

    #[test]
    fn restart_evicts_the_running_child() {
        let tmp = tempfile::tempdir().unwrap();
        let mut opts = options();
        opts.restart = true;
        let mut run_loop = run_loop_on(tmp.path(), vec!["sleep".into(), "60".into()], opts);

        let child = run_loop.spawn(&[]).unwrap();
        let pid = child.pid();

        let dir = tmp.path().to_owned();
        let writer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(200));
            fs::write(dir.join("poke.txt"), b"x").unwrap();
        });

        let start = Instant::now();
        let outcome = run_loop.supervise(child).unwrap();
        writer.join().unwrap();

        match outcome {
            Supervised::Restart(changes) => {
                assert!(!changes.is_empty());
            }
            Supervised::Exited(exit) => panic!("child exited instead of restarting: {exit:?}"),
        }
        assert!(start.elapsed() < Duration::from_secs(5));

        // the whole group is gone
        let group = nix::unistd::Pid::from_raw(-(pid as i32));
        assert!(matches!(
            nix::sys::signal::kill(group, None),
            Err(nix::errno::Errno::ESRCH)
        ));
    }

    #[test]
    fn completed_child_wins_over_late_events() {
        let tmp = tempfile::tempdir().unwrap();
        let mut opts = options();
        opts.restart = true;
        let mut run_loop = run_loop_on(tmp.path(), vec!["true".into()], opts);

        let child = run_loop.spawn(&[]).unwrap();
        // let the child finish, then produce an event before supervising
        std::thread::sleep(Duration::from_millis(200));
        fs::write(tmp.path().join("late.txt"), b"x").unwrap();

        match run_loop.supervise(child).unwrap() {
            Supervised::Exited(exit) => assert!(exit.success()),
            Supervised::Restart(_) => panic!("a finished child must not restart"),
        }
    }

    #[test]
    fn change_set_reaches_the_child_environment() {
        let tmp = tempfile::tempdir().unwrap();
        let out = tmp.path().join("env-out");
        let mut opts = options();
        opts.export_env = true;
        let run_loop = run_loop_on(
            tmp.path(),
            vec![format!("printf '%s' \"$WATCHEXEC_EVENT\" > {}", out.display())],
            opts,
        );

        let changes = vec![MonitorResult::new(
            watchrun_filewatch::EventKind::CloseWrite,
            tmp.path().join("x.txt"),
        )];
        let mut child = run_loop.spawn(&changes).unwrap();
        assert!(child.wait().unwrap().success());

        let recorded = fs::read_to_string(&out).unwrap();
        assert_eq!(recorded, encode_change_set(&changes));
    }

    #[test]
    fn shell_command_joins_argv() {
        let command = shell_command(&["echo".into(), "one".into(), "two".into()]);
        assert!(command.label().ends_with("-c echo one two"));
    }
}
