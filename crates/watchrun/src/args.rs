use std::path::PathBuf;

use anyhow::anyhow;
use clap::Parser;
use nix::sys::signal::Signal;

#[derive(Parser, Clone, Debug, PartialEq)]
#[clap(name = "watchrun", version)]
#[clap(about = "Runs a command when watched files change", long_about = None)]
pub struct Args {
    /// Directory root to watch
    #[clap(short = 'w', long = "watch", value_name = "DIR")]
    pub watch: Vec<PathBuf>,
    /// File extension to react to; shorthand for --include "*.EXT"
    #[clap(short = 'e', long = "ext", value_name = "EXT")]
    pub ext: Vec<String>,
    /// Glob pattern a path must match to be reported
    #[clap(long, value_name = "PAT")]
    pub include: Vec<String>,
    /// Glob pattern that removes a path from reporting
    #[clap(long, value_name = "PAT")]
    pub exclude: Vec<String>,
    /// Do not read .gitignore files
    #[clap(long)]
    pub no_vcs_ignore: bool,
    /// Skip the built-in ignore patterns
    #[clap(long)]
    pub no_default_ignore: bool,
    /// Keep watch roots symbolic instead of resolving them through symlinks
    #[clap(long)]
    pub no_follow_symlink: bool,
    /// Reset the terminal before each run
    #[clap(short = 'c', long)]
    pub clear: bool,
    /// Milliseconds to keep coalescing events after the first one
    #[clap(short = 'd', long, value_name = "MS", default_value_t = 200)]
    pub debounce: u64,
    /// Wall-clock seconds a run may take before its group is killed
    #[clap(short = 't', long, value_name = "SEC", default_value_t = 3600)]
    pub timeout: u64,
    /// Kill and restart the command when events arrive during a run
    #[clap(short = 'r', long)]
    pub restart: bool,
    /// Signal used to end a running command
    #[clap(short = 's', long, value_name = "SIG", default_value = "SIGKILL")]
    pub signal: String,
    /// Also observe metadata events (access, attributes, open)
    #[clap(long)]
    pub meta: bool,
    /// Export the change-set to the child as WATCHEXEC_EVENT
    #[clap(long)]
    pub env: bool,
    /// Send a desktop notification with the exit status after each run
    #[clap(long, value_name = "MSG")]
    pub notify: Option<String>,
    /// Do not run the command at startup
    #[clap(short = 'p', long)]
    pub postpone: bool,
    /// Discard events that occurred while the command was running
    #[clap(long)]
    pub clear_events: bool,
    /// Diff a filesystem scan against a persisted database instead of
    /// watching, then exit
    #[clap(short = 'o', long)]
    pub oneshot: bool,
    /// Database file for --oneshot
    #[clap(long, value_name = "PATH")]
    pub oneshot_db: Option<PathBuf>,
    /// Deprecated: commands always run through the shell
    #[clap(long, hide = true)]
    pub shell: bool,
    /// Verbosity level (0 = warnings, 3 = trace)
    #[clap(short = 'v', long = "verbose", value_name = "LEVEL", default_value_t = 0)]
    pub verbose: u8,
    /// The command to run, given after `--`
    #[clap(last = true, value_name = "CMD")]
    pub command: Vec<String>,
}

/// Accepts `TERM` and `SIGTERM` alike.
pub fn parse_signal(raw: &str) -> anyhow::Result<Signal> {
    let name = raw.trim().to_ascii_uppercase();
    let name = if name.starts_with("SIG") {
        name
    } else {
        format!("SIG{name}")
    };
    name.parse::<Signal>()
        .map_err(|_| anyhow!("unknown signal `{raw}`"))
}
