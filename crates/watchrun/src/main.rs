#![deny(clippy::all)]

mod args;
mod filters;
mod logging;
mod notification;
mod run;

use std::process::exit;
use std::time::Duration;

use anyhow::bail;
use clap::error::ErrorKind;
use clap::Parser;
use tracing::error;
use watchrun_filewatch::{EventClasses, MonitorConfig, RecursiveMonitor};
use watchrun_oneshot::{one_shot, OneShotOptions};

use crate::args::Args;
use crate::run::{report_status, shell_command, RunLoop, RunOptions};

fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err)
            if matches!(
                err.kind(),
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion
            ) =>
        {
            let _ = err.print();
            exit(0);
        }
        Err(err) => {
            let _ = err.print();
            exit(1);
        }
    };

    logging::init(args.verbose);

    match run(args) {
        Ok(code) => exit(code),
        Err(err) => {
            error!("{err:#}");
            exit(1);
        }
    }
}

fn run(args: Args) -> anyhow::Result<i32> {
    if args.watch.is_empty() {
        bail!("no watch roots given (use -w DIR)");
    }
    if args.command.is_empty() {
        bail!("no command given (put it after `--`)");
    }
    if args.shell {
        tracing::warn!("--shell is deprecated; commands always run through the shell");
    }

    let signal = args::parse_signal(&args.signal)?;
    let filter = filters::build_filter(&args)?;
    let timeout = (args.timeout > 0).then(|| Duration::from_secs(args.timeout));
    let follow_symlinks = !args.no_follow_symlink;

    if args.oneshot {
        let Some(db_path) = args.oneshot_db.clone() else {
            bail!("--oneshot requires --oneshot-db PATH");
        };
        let options = OneShotOptions {
            db_path,
            follow_symlinks,
            timeout,
            signal,
            export_env: args.env,
        };
        let outcome = one_shot(
            &args.watch,
            &filter,
            shell_command(&args.command),
            args.command.clone(),
            &options,
        )?;
        return Ok(match outcome.exit {
            Some(exit) => {
                report_status(&exit, args.notify.as_deref());
                exit.code()
            }
            None => 0,
        });
    }

    let mut classes = EventClasses::CONTENT;
    if args.meta {
        classes |= EventClasses::METADATA;
    }
    let mut config = MonitorConfig::new(args.watch.clone(), filter);
    config.follow_symlinks = follow_symlinks;
    config.classes = classes;
    config.vcs_ignore = !args.no_vcs_ignore;
    let monitor = RecursiveMonitor::new(config)?;

    let options = RunOptions {
        restart: args.restart,
        clear_screen: args.clear,
        debounce: Duration::from_millis(args.debounce),
        timeout,
        signal,
        export_env: args.env,
        clear_events: args.clear_events,
        postpone: args.postpone,
        notify: args.notify.clone(),
    };
    RunLoop::new(monitor, args.command.clone(), options).run()?;
    Ok(0)
}
