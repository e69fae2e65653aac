use std::collections::HashSet;
use std::env;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::sys::signal::Signal;
use thiserror::Error;
use tracing::{debug, info, trace, warn};
use walkdir::WalkDir;
use watchrun_filewatch::{encode_change_set, EventKind, GlobFilter, MonitorResult};
use watchrun_process::{Child, ChildExit, Command, SpawnError};

use crate::db::{DbEntry, FileDb};
use crate::fingerprint::Fingerprint;

#[derive(Debug, Error)]
pub enum OneShotError {
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    #[error("failed waiting for command: {0}")]
    Wait(#[from] io::Error),
}

pub struct OneShotOptions {
    pub db_path: PathBuf,
    pub follow_symlinks: bool,
    pub timeout: Option<Duration>,
    pub signal: Signal,
    /// Export the change-set as `WATCHEXEC_EVENT` to the child.
    pub export_env: bool,
}

pub struct OneShotOutcome {
    pub changes: Vec<MonitorResult>,
    /// `None` when nothing changed and the command was not run.
    pub exit: Option<ChildExit>,
}

/// Enumerate every file reachable under the roots (plus file paths given
/// directly as roots) that passes the filter. Paths come back relative to
/// the working directory where possible, matching how the database keys
/// them.
pub fn scan(roots: &[PathBuf], filter: &GlobFilter, follow_symlinks: bool) -> Vec<PathBuf> {
    let cwd = env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let mut candidates = Vec::new();

    for root in roots {
        let root = if follow_symlinks {
            root.clone()
        } else {
            // resolve the root once; entries below are never dereferenced
            match root.canonicalize() {
                Ok(resolved) => resolved,
                Err(err) => {
                    info!("skipping root {}: {err}", root.display());
                    continue;
                }
            }
        };

        if root.is_file() {
            if filter.matches(&root) {
                candidates.push(relativize(root, &cwd));
            }
            continue;
        }

        for entry in WalkDir::new(&root).follow_links(false) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    trace!("walk error under {}: {err}", root.display());
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.into_path();
            if filter.matches(&path) {
                candidates.push(relativize(path, &cwd));
            }
        }
    }
    candidates
}

fn relativize(path: PathBuf, cwd: &Path) -> PathBuf {
    path.strip_prefix(cwd).map(Path::to_owned).unwrap_or(path)
}

/// Diff the candidate set against the prior database.
///
/// Cheap case first: a size mismatch is a change without any read, and an
/// equal size with an equal mtime is trusted as unchanged without
/// consulting checksums. Only the ambiguous case (same size, different
/// mtime) pays for hashing. Unchanged entries copy the prior record so the
/// cached checksum survives into the next run.
pub fn diff(
    prior: &FileDb,
    candidates: Vec<PathBuf>,
    cmd: Vec<String>,
) -> (FileDb, Vec<MonitorResult>) {
    let mut db = FileDb::new(cmd);
    let mut changes = Vec::new();
    let mut seen = HashSet::new();

    for path in candidates {
        if !seen.insert(path.clone()) {
            continue;
        }
        let mut fingerprint = match Fingerprint::of_file(&path) {
            Ok(fingerprint) => fingerprint,
            Err(err) => {
                debug!("skipping {}: {err}", path.display());
                continue;
            }
        };

        let verdict = match prior.files.get(&path) {
            None => Some(EventKind::Create),
            Some(prev) if prev.size != fingerprint.size => Some(EventKind::Modify),
            Some(prev) if prev.mtime == fingerprint.mtime => None,
            Some(prev) => match fingerprint.checksum() {
                Ok(checksum) if checksum == prev.checksum => None,
                Ok(_) => Some(EventKind::Modify),
                Err(err) => {
                    debug!("skipping {}: {err}", path.display());
                    continue;
                }
            },
        };

        match verdict {
            Some(kind) => {
                let checksum = match fingerprint.checksum() {
                    Ok(checksum) => checksum,
                    Err(err) => {
                        debug!("skipping {}: {err}", path.display());
                        continue;
                    }
                };
                db.files.insert(
                    path.clone(),
                    DbEntry {
                        mtime: fingerprint.mtime,
                        size: fingerprint.size,
                        checksum,
                    },
                );
                changes.push(MonitorResult::new(kind, path));
            }
            None => {
                if let Some(prev) = prior.files.get(&path) {
                    db.files.insert(path, prev.clone());
                }
            }
        }
    }

    for path in prior.files.keys() {
        if !seen.contains(path) {
            changes.push(MonitorResult::new(EventKind::Delete, path.clone()));
        }
    }

    (db, changes)
}

/// A full one-shot cycle: load, scan, diff, and, when anything changed,
/// run the command and advance the database only on success.
///
/// The new database is written to a temp file before the child starts and
/// renamed over the canonical path after a zero exit, so a failing command
/// leaves the prior state byte-identical and a concurrent invocation never
/// observes a half-written file.
pub fn one_shot(
    roots: &[PathBuf],
    filter: &GlobFilter,
    command: Command,
    cmd_argv: Vec<String>,
    options: &OneShotOptions,
) -> Result<OneShotOutcome, OneShotError> {
    let prior = FileDb::load(&options.db_path);
    let candidates = scan(roots, filter, options.follow_symlinks);
    let (db, changes) = diff(&prior, candidates, cmd_argv);

    if changes.is_empty() {
        info!("no changes detected");
        return Ok(OneShotOutcome {
            changes,
            exit: None,
        });
    }
    debug!("{} paths changed", changes.len());

    let temp = match db.write_temp(&options.db_path) {
        Ok(temp) => Some(temp),
        Err(err) => {
            warn!("{err}; the database will not be advanced");
            None
        }
    };

    let mut command = command;
    if options.export_env {
        command = command.env("WATCHEXEC_EVENT", encode_change_set(&changes));
    }

    let mut child = Child::spawn(&command, options.timeout, options.signal)?;
    let exit = child.wait()?;

    if exit.success() {
        if let Some(temp) = temp {
            if let Err(err) = FileDb::commit(temp, &options.db_path) {
                warn!("{err}; the previous database is left in place");
            }
        }
    }

    Ok(OneShotOutcome {
        changes,
        exit: Some(exit),
    })
}
