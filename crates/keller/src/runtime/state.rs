//! Per-environment runtime state.

use std::collections::HashSet;
use std::path::PathBuf;

use crate::ledger::Ledger;

/// Everything the lifecycle acquires for one environment.
///
/// The mounted stacks are the single source of truth for release: a path
/// is pushed as its mount succeeds and popped only after a successful
/// unmount, so a failing release keeps exactly the entries still owed.
#[derive(Debug)]
pub struct State {
    /// Path the overlay is actually mounted on; equals `original_root`
    /// unless `mktemp` redirected it to a temporary directory.
    pub effective_root: PathBuf,
    /// Path the caller named.
    pub original_root: PathBuf,
    /// System pseudo-filesystem mounts, in mount order.
    pub mounted_system_fs: Vec<PathBuf>,
    /// Bind mounts, in mount order.
    pub mounted_binds: Vec<PathBuf>,
    /// tmpfs mounts, in mount order.
    pub mounted_tmpfs: Vec<PathBuf>,
    /// File descriptors kept open across exec.
    pub keep_fds: HashSet<i32>,
    /// The open ledger; present from the first acquire step on.
    pub ledger: Option<Ledger>,
    /// Exit status of the child command.
    pub exit_status: i32,
}

impl State {
    /// Fresh state for a resolved build-root.
    pub fn new(original_root: impl Into<PathBuf>) -> Self {
        let original_root = original_root.into();
        Self {
            effective_root: original_root.clone(),
            original_root,
            mounted_system_fs: Vec::new(),
            mounted_binds: Vec::new(),
            mounted_tmpfs: Vec::new(),
            keep_fds: HashSet::new(),
            ledger: None,
            exit_status: 0,
        }
    }
}
