#![deny(clippy::all)]

//! One-shot change detection for watchrun.
//!
//! Instead of a live watcher, a single invocation scans the tree, diffs
//! file fingerprints against a persisted database, runs the command when
//! anything differs, and advances the database atomically only when the
//! command succeeds.

pub mod db;
pub mod differ;
pub mod fingerprint;

pub use db::{DbEntry, DbError, FileDb};
pub use differ::{diff, one_shot, scan, OneShotError, OneShotOptions, OneShotOutcome};
pub use fingerprint::Fingerprint;
