//! Acquire-progress marker.

use std::fmt;

/// How far the acquire phase got.
///
/// Each value names the latest action that must be reversed when release
/// begins from it; release falls through from the given stage all the way
/// down to [`Stage::None`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    /// Nothing acquired.
    None,
    /// The temporary effective root exists.
    Mktemp,
    /// The overlay is mounted on the effective root.
    Root,
    /// System pseudo-filesystems are attached.
    SystemFs,
    /// Bind mounts are attached.
    Binds,
    /// tmpfs mounts are attached.
    Tmpfs,
    /// Processes may be running inside the environment.
    Processes,
    /// The ledger records the active pair.
    Mtab,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::None => "none",
            Stage::Mktemp => "mktemp",
            Stage::Root => "root",
            Stage::SystemFs => "system-fs",
            Stage::Binds => "binds",
            Stage::Tmpfs => "tmpfs",
            Stage::Processes => "processes",
            Stage::Mtab => "mtab",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stages_are_ordered() {
        assert!(Stage::None < Stage::Mktemp);
        assert!(Stage::Mktemp < Stage::Root);
        assert!(Stage::Root < Stage::SystemFs);
        assert!(Stage::SystemFs < Stage::Binds);
        assert!(Stage::Binds < Stage::Tmpfs);
        assert!(Stage::Tmpfs < Stage::Processes);
        assert!(Stage::Processes < Stage::Mtab);
    }
}
