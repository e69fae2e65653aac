use std::io;
use std::path::Path;

use anyhow::Context;
use tracing::debug;
use watchrun_filewatch::filter::parse_ignore_lines;
use watchrun_filewatch::GlobFilter;

use crate::args::Args;

/// Patterns nobody wants to react to: editor swap files, VCS internals,
/// compiled python, macOS droppings.
pub const DEFAULT_IGNORES: &[&str] = &[
    "*/.DS_Store",
    "*.py[co]",
    "*/#*#",
    "*/.#*",
    "*/.*.kate-swp",
    "*/.*.sw?",
    "*/.*.sw?x",
    "*/.git/*",
];

/// Assemble the primary filter from the command line: includes (plus the
/// `--ext` sugar), excludes, the built-in ignore set, and the working
/// directory's `.gitignore`.
pub fn build_filter(args: &Args) -> anyhow::Result<GlobFilter> {
    let mut include = args.include.clone();
    include.extend(
        args.ext
            .iter()
            .map(|ext| format!("*.{}", ext.trim_start_matches('.'))),
    );

    let mut exclude = args.exclude.clone();
    if !args.no_default_ignore {
        exclude.extend(DEFAULT_IGNORES.iter().map(|pattern| (*pattern).to_owned()));
    }
    if !args.no_vcs_ignore {
        exclude.extend(read_gitignore(Path::new(".gitignore"))?);
    }

    debug!(
        "filter: {} include, {} exclude patterns",
        include.len(),
        exclude.len()
    );
    GlobFilter::new(include, exclude).map_err(Into::into)
}

/// A missing .gitignore is normal; an unreadable one is a configuration
/// error.
fn read_gitignore(path: &Path) -> anyhow::Result<Vec<String>> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(parse_ignore_lines(&content)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(err) => {
            Err(err).with_context(|| format!("cannot read gitignore at {}", path.display()))
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use clap::Parser;
    use std::path::PathBuf;

    fn args(argv: &[&str]) -> Args {
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn ext_is_include_sugar() {
        let args = args(&["watchrun", "-w", "src", "-e", "d", "--no-vcs-ignore", "--", "x"]);
        let filter = build_filter(&args).unwrap();
        assert!(filter.matches(Path::new("src/a.d")));
        assert!(!filter.matches(Path::new("src/a.py")));
        assert!(filter.include_patterns().contains(&"*.d".to_owned()));
    }

    #[test]
    fn leading_dot_in_ext_is_tolerated() {
        let args = args(&["watchrun", "-w", "src", "-e", ".rs", "--no-vcs-ignore", "--", "x"]);
        let filter = build_filter(&args).unwrap();
        assert!(filter.matches(Path::new("src/lib.rs")));
    }

    #[test]
    fn default_ignores_apply() {
        let args = args(&["watchrun", "-w", "src", "--no-vcs-ignore", "--", "x"]);
        let filter = build_filter(&args).unwrap();
        assert!(!filter.matches(Path::new("proj/.git/HEAD")));
        assert!(!filter.matches(Path::new("proj/.DS_Store")));
        assert!(!filter.matches(Path::new("proj/mod.pyc")));
        assert!(!filter.matches(Path::new("proj/.main.rs.swp")));
        assert!(filter.matches(Path::new("proj/main.rs")));
    }

    #[test]
    fn default_ignores_can_be_disabled() {
        let args = args(&[
            "watchrun",
            "-w",
            "src",
            "--no-default-ignore",
            "--no-vcs-ignore",
            "--",
            "x",
        ]);
        let filter = build_filter(&args).unwrap();
        assert!(filter.matches(Path::new("proj/.git/HEAD")));
    }

    #[test]
    fn explicit_excludes_are_kept() {
        let args = args(&[
            "watchrun",
            "-w",
            "src",
            "--exclude",
            "*.tmp",
            "--no-vcs-ignore",
            "--",
            "x",
        ]);
        let filter = build_filter(&args).unwrap();
        assert!(!filter.matches(&PathBuf::from("src/scratch.tmp")));
    }
}
