use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use nix::sys::inotify::{AddWatchFlags, InotifyEvent, WatchDescriptor};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::events::{EventClasses, EventKind, MonitorResult};
use crate::filter::{read_ignore_file, GlobFilter, OverrideSet};
use crate::source::{InotifySource, SourceError};

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("watch root {0} is not a directory")]
    NotADirectory(PathBuf),
    #[error("failed to resolve watch root {path}: {source}")]
    Root { path: PathBuf, source: io::Error },
    #[error(transparent)]
    Source(#[from] SourceError),
}

pub struct MonitorConfig {
    pub roots: Vec<PathBuf>,
    pub filter: GlobFilter,
    pub overrides: OverrideSet,
    pub follow_symlinks: bool,
    pub classes: EventClasses,
    /// Pick up `.gitignore` files as per-directory override filters while
    /// walking.
    pub vcs_ignore: bool,
}

impl MonitorConfig {
    pub fn new(roots: Vec<PathBuf>, filter: GlobFilter) -> Self {
        Self {
            roots,
            filter,
            overrides: OverrideSet::new(),
            follow_symlinks: true,
            classes: EventClasses::CONTENT,
            vcs_ignore: false,
        }
    }
}

/// Maintains a live watch over the recursive closure of the configured
/// roots and yields classified, filtered events.
///
/// Watches are per directory; the set grows when directories appear
/// (`Create`/`Rename`) and shrinks when they vanish (`DeleteSelf`,
/// `MoveSelf` out of the roots, kernel `IN_IGNORED`).
#[derive(Debug)]
pub struct RecursiveMonitor {
    source: InotifySource,
    watch_mask: AddWatchFlags,
    classes: EventClasses,
    filter: GlobFilter,
    overrides: OverrideSet,
    vcs_ignore: bool,
    roots: Vec<PathBuf>,
    dirs_by_wd: HashMap<WatchDescriptor, PathBuf>,
    wds_by_dir: HashMap<PathBuf, WatchDescriptor>,
}

impl RecursiveMonitor {
    pub fn new(config: MonitorConfig) -> Result<Self, MonitorError> {
        let MonitorConfig {
            roots,
            filter,
            overrides,
            follow_symlinks,
            classes,
            vcs_ignore,
        } = config;

        let source = InotifySource::new()?;
        // The structural bits are always watched: without them the watch
        // set could not track the tree, whatever classes are reported.
        let watch_mask = EventKind::mask_for(classes)
            | AddWatchFlags::IN_CREATE
            | AddWatchFlags::IN_DELETE
            | AddWatchFlags::IN_DELETE_SELF
            | AddWatchFlags::IN_MOVE_SELF
            | AddWatchFlags::IN_MOVED_FROM
            | AddWatchFlags::IN_MOVED_TO
            | AddWatchFlags::IN_ONLYDIR;

        let mut resolved = Vec::with_capacity(roots.len());
        for root in roots {
            let root = if follow_symlinks {
                absolutize(&root)
            } else {
                // resolve once through symlinks, then treat as a fixed anchor
                root.canonicalize()
            }
            .map_err(|source| MonitorError::Root {
                path: root.clone(),
                source,
            })?;
            if !root.is_dir() {
                return Err(MonitorError::NotADirectory(root));
            }
            resolved.push(root);
        }

        let mut monitor = Self {
            source,
            watch_mask,
            classes,
            filter,
            overrides,
            vcs_ignore,
            roots: resolved.clone(),
            dirs_by_wd: HashMap::new(),
            wds_by_dir: HashMap::new(),
        };
        for root in &resolved {
            monitor.add_dir_tree(root, None);
        }
        debug!("watching {} directories", monitor.watched_dirs());
        Ok(monitor)
    }

    /// Number of directories currently under watch.
    pub fn watched_dirs(&self) -> usize {
        self.wds_by_dir.len()
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// Block up to `timeout` and return the deduplicated set of events that
    /// pass the filter. A zero timeout never blocks. May return early with
    /// an empty set.
    pub fn wait(&mut self, timeout: Duration) -> Result<Vec<MonitorResult>, MonitorError> {
        let raw = self.source.poll(timeout)?;
        Ok(self.process(raw))
    }

    /// Drain window: keep pumping events for `window`, accumulating
    /// everything observed. Used to fold a burst that follows an initial
    /// trigger (slow writers, NFS latency) into one change-set.
    pub fn collect(&mut self, window: Duration) -> Result<Vec<MonitorResult>, MonitorError> {
        let deadline = Instant::now() + window;
        let mut seen = HashSet::new();
        let mut results = Vec::new();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            for result in self.wait(remaining)? {
                if seen.insert(result.clone()) {
                    results.push(result);
                }
            }
        }
        Ok(results)
    }

    /// Fully drain the source without blocking, discarding events. Watch
    /// registration for freshly created directories still happens, so the
    /// watch set stays complete.
    pub fn clear(&mut self) -> Result<(), MonitorError> {
        loop {
            if self.wait(Duration::ZERO)?.is_empty() {
                break;
            }
        }
        Ok(())
    }

    fn process(&mut self, raw: Vec<InotifyEvent>) -> Vec<MonitorResult> {
        let mut pending: Vec<(EventKind, PathBuf)> = Vec::new();

        for event in raw {
            if event.mask.contains(AddWatchFlags::IN_Q_OVERFLOW) {
                warn!("kernel event queue overflowed; some events were lost");
                continue;
            }
            if event.mask.contains(AddWatchFlags::IN_IGNORED) {
                // the kernel already dropped this watch
                if let Some(dir) = self.dirs_by_wd.remove(&event.wd) {
                    self.wds_by_dir.remove(&dir);
                }
                continue;
            }

            let dir = match self.dirs_by_wd.get(&event.wd) {
                Some(dir) => dir.clone(),
                // events may trail behind an unwatch; drop them
                None => continue,
            };
            let path = match &event.name {
                Some(name) => {
                    if name.to_str().is_none() {
                        warn!(
                            "dropping event for non-UTF-8 name under {}",
                            dir.display()
                        );
                        continue;
                    }
                    dir.join(name)
                }
                None => dir.clone(),
            };

            let Some(kind) = EventKind::classify(event.mask) else {
                continue;
            };
            let is_dir = event.mask.contains(AddWatchFlags::IN_ISDIR);

            match kind {
                EventKind::Create | EventKind::Rename if is_dir => {
                    // Register the new subtree before pumping further
                    // events, and surface what the walk finds: files
                    // created inside it before the watch existed would
                    // otherwise go unseen.
                    let mut discovered = Vec::new();
                    self.add_dir_tree(&path, Some(&mut discovered));
                    pending.extend(discovered);
                }
                EventKind::DeleteSelf => {
                    self.forget(&path);
                }
                EventKind::Delete if is_dir => {
                    // covers IN_MOVED_FROM of a subdirectory: the entry
                    // for the departed name must go before its descriptor
                    // is reused for the destination
                    self.forget(&path);
                }
                EventKind::MoveSelf => {
                    if self.under_root(&path) && path.is_dir() {
                        // the mapping already points at a live directory
                        // (the rename landed inside the roots); re-register
                        // whatever is below it
                        self.add_dir_tree(&path, None);
                    } else {
                        if let Some(wd) = self.wds_by_dir.get(&path).copied() {
                            self.source.unwatch(wd);
                        }
                        self.forget(&path);
                    }
                }
                _ => {}
            }

            if self.classes.contains(kind.class()) {
                pending.push((kind, path));
            }
        }

        let mut seen = HashSet::new();
        pending
            .into_iter()
            .filter(|(_, path)| self.filter.matches(path))
            .filter(|entry| seen.insert(entry.clone()))
            .map(|(kind, path)| MonitorResult::new(kind, path))
            .collect()
    }

    /// Register `start` and every directory below it that passes
    /// `should_watch`. Driven by an explicit work queue so deep trees
    /// cannot exhaust the machine stack. When `discovered` is given, every
    /// entry the walk encounters is reported as a `Create`.
    fn add_dir_tree(
        &mut self,
        start: &Path,
        mut discovered: Option<&mut Vec<(EventKind, PathBuf)>>,
    ) {
        let mut queue = VecDeque::new();
        queue.push_back(start.to_owned());

        while let Some(dir) = queue.pop_front() {
            if self.wds_by_dir.contains_key(&dir) {
                continue;
            }
            if !self.should_watch(&dir) {
                trace!("not watching {}", dir.display());
                continue;
            }
            match self.source.watch(&dir, self.watch_mask) {
                Ok(wd) => {
                    self.dirs_by_wd.insert(wd, dir.clone());
                    self.wds_by_dir.insert(dir.clone(), wd);
                }
                // vanished between enumeration and registration
                Err(SourceError::NotFound) => continue,
                Err(err) => {
                    warn!("skipping {}: {err}", dir.display());
                    continue;
                }
            }

            if self.vcs_ignore {
                let ignore_file = dir.join(".gitignore");
                if ignore_file.is_file() {
                    match read_ignore_file(&ignore_file) {
                        Ok(filter) => self.overrides.push(dir.clone(), filter),
                        Err(err) => info!("{err}"),
                    }
                }
            }

            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(err) => {
                    trace!("read_dir {}: {err}", dir.display());
                    continue;
                }
            };
            for entry in entries.flatten() {
                let path = entry.path();
                // symlinked directories are not descended; roots were
                // dereferenced up front and that is the only place links
                // are followed
                let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
                if is_dir {
                    queue.push_back(path.clone());
                }
                if let Some(out) = discovered.as_mut() {
                    out.push((EventKind::Create, path));
                }
            }
        }
    }

    fn should_watch(&self, dir: &Path) -> bool {
        self.overrides.allows(dir) && self.filter.allows_dir(dir)
    }

    fn forget(&mut self, dir: &Path) {
        if let Some(wd) = self.wds_by_dir.remove(dir) {
            self.dirs_by_wd.remove(&wd);
        }
    }

    fn under_root(&self, path: &Path) -> bool {
        self.roots.iter().any(|root| path.starts_with(root))
    }
}

fn absolutize(path: &Path) -> io::Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_owned())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const SETTLE: Duration = Duration::from_millis(50);
    const PATIENCE: Duration = Duration::from_secs(5);

    fn monitor_on(root: &Path, filter: GlobFilter) -> RecursiveMonitor {
        RecursiveMonitor::new(MonitorConfig::new(vec![root.to_owned()], filter)).unwrap()
    }

    /// Pump the monitor until `pred` matches a result or patience runs out.
    fn pump_until(
        monitor: &mut RecursiveMonitor,
        pred: impl Fn(&MonitorResult) -> bool,
    ) -> Vec<MonitorResult> {
        let deadline = Instant::now() + PATIENCE;
        let mut all = Vec::new();
        while Instant::now() < deadline {
            let batch = monitor.wait(SETTLE).unwrap();
            let hit = batch.iter().any(&pred);
            all.extend(batch);
            if hit {
                return all;
            }
        }
        panic!("no matching event within {:?}; saw {:?}", PATIENCE, all);
    }

    fn wait_for_watches(monitor: &mut RecursiveMonitor, at_least: usize) {
        let deadline = Instant::now() + PATIENCE;
        while monitor.watched_dirs() < at_least {
            assert!(
                Instant::now() < deadline,
                "only {} watches registered",
                monitor.watched_dirs()
            );
            monitor.wait(SETTLE).unwrap();
        }
    }

    #[test]
    fn watches_existing_tree() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("a/b")).unwrap();

        let mut monitor = monitor_on(tmp.path(), GlobFilter::empty());
        assert_eq!(monitor.watched_dirs(), 3);

        let file = tmp.path().join("a/b/file.txt");
        fs::write(&file, b"content").unwrap();
        pump_until(&mut monitor, |r| {
            r.path.file_name() == Some("file.txt".as_ref()) && r.kind == EventKind::CloseWrite
        });
    }

    #[test]
    fn watches_directories_created_later() {
        let tmp = tempfile::tempdir().unwrap();
        let mut monitor = monitor_on(tmp.path(), GlobFilter::empty());
        assert_eq!(monitor.watched_dirs(), 1);

        fs::create_dir_all(tmp.path().join("x/y")).unwrap();
        wait_for_watches(&mut monitor, 3);

        let file = tmp.path().join("x/y/deep.txt");
        fs::write(&file, b"deep").unwrap();
        pump_until(&mut monitor, |r| {
            r.path.file_name() == Some("deep.txt".as_ref()) && r.kind == EventKind::CloseWrite
        });
    }

    #[test]
    fn filter_honesty() {
        let tmp = tempfile::tempdir().unwrap();
        let filter = GlobFilter::new(vec!["*.d".into()], vec![]).unwrap();
        let mut monitor = monitor_on(tmp.path(), filter);

        fs::write(tmp.path().join("a.py"), b"py").unwrap();
        fs::write(tmp.path().join("a.d"), b"d").unwrap();

        let seen = pump_until(&mut monitor, |r| {
            r.path.file_name() == Some("a.d".as_ref()) && r.kind == EventKind::CloseWrite
        });
        assert!(seen
            .iter()
            .all(|r| r.path.extension() != Some("py".as_ref())));
    }

    #[test]
    fn clear_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let mut monitor = monitor_on(tmp.path(), GlobFilter::empty());

        fs::write(tmp.path().join("noise.txt"), b"n").unwrap();
        std::thread::sleep(SETTLE);

        monitor.clear().unwrap();
        let watched = monitor.watched_dirs();
        monitor.clear().unwrap();
        assert_eq!(monitor.watched_dirs(), watched);
        assert!(monitor.wait(Duration::ZERO).unwrap().is_empty());
    }

    #[test]
    fn deleted_directory_leaves_the_watch_set() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir(tmp.path().join("gone")).unwrap();

        let mut monitor = monitor_on(tmp.path(), GlobFilter::empty());
        assert_eq!(monitor.watched_dirs(), 2);

        fs::remove_dir(tmp.path().join("gone")).unwrap();
        let deadline = Instant::now() + PATIENCE;
        while monitor.watched_dirs() > 1 {
            assert!(Instant::now() < deadline, "watch entry not removed");
            monitor.wait(SETTLE).unwrap();
        }
    }

    #[test]
    fn renamed_directory_is_rewatched_at_destination() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir(tmp.path().join("old")).unwrap();

        let mut monitor = monitor_on(tmp.path(), GlobFilter::empty());
        assert_eq!(monitor.watched_dirs(), 2);

        fs::rename(tmp.path().join("old"), tmp.path().join("new")).unwrap();
        pump_until(&mut monitor, |r| {
            r.kind == EventKind::Rename && r.path == tmp.path().join("new")
        });

        fs::write(tmp.path().join("new/inside.txt"), b"x").unwrap();
        pump_until(&mut monitor, |r| {
            r.path.file_name() == Some("inside.txt".as_ref())
                && r.kind == EventKind::CloseWrite
        });
    }

    #[test]
    fn gitignore_prunes_watches() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join(".gitignore"), "skipped\n").unwrap();
        fs::create_dir(tmp.path().join("skipped")).unwrap();
        fs::create_dir(tmp.path().join("kept")).unwrap();

        let mut config = MonitorConfig::new(vec![tmp.path().to_owned()], GlobFilter::empty());
        config.vcs_ignore = true;
        let monitor = RecursiveMonitor::new(config).unwrap();

        // root + kept, but not the ignored directory
        assert_eq!(monitor.watched_dirs(), 2);
    }

    #[test]
    fn missing_root_is_an_error() {
        let err = RecursiveMonitor::new(MonitorConfig::new(
            vec![PathBuf::from("/does/not/exist")],
            GlobFilter::empty(),
        ))
        .unwrap_err();
        assert!(matches!(err, MonitorError::NotADirectory(_)));
    }
}
