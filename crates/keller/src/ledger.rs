//! The shared mount ledger.
//!
//! Every active manager in a working directory records its
//! `(original_root, effective_root)` pair as one line of the plain-text
//! `mtab` file. The ledger is advisory; it exists for self-diagnosis and
//! external observability. Peers serialize on an exclusive `flock` held
//! for the duration of each mutation.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use rustix::fs::{flock, FlockOperation};

use crate::error::{KellerError, KellerResult};

/// Default ledger file name, relative to the manager's working directory.
pub const LEDGER_FILE: &str = "mtab";

/// Append-only text ledger of active `(original, effective)` pairs.
///
/// The descriptor is opened once per lifecycle and carries the advisory
/// lock; it stays open until the manager exits.
#[derive(Debug)]
pub struct Ledger {
    path: PathBuf,
    file: File,
}

/// Holds the exclusive ledger lock; unlocks on drop.
#[derive(Debug)]
#[must_use = "the lock is released when the guard drops"]
pub struct LedgerGuard<'a> {
    ledger: &'a Ledger,
}

impl Ledger {
    /// Open the ledger at `path`, creating it if missing.
    pub fn open(path: impl Into<PathBuf>) -> KellerResult<Self> {
        let path = path.into();
        // std::fs opens descriptors close-on-exec.
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .mode(0o664)
            .open(&path)
            .map_err(|e| KellerError::Ledger {
                message: format!("failed to open {}: {e}", path.display()),
            })?;
        Ok(Self { path, file })
    }

    /// Take the exclusive lock, blocking until contending peers release it.
    pub fn lock(&self) -> KellerResult<LedgerGuard<'_>> {
        flock(&self.file, FlockOperation::LockExclusive).map_err(|e| KellerError::Ledger {
            message: format!(
                "failed to lock {}: {}",
                self.path.display(),
                std::io::Error::from(e)
            ),
        })?;
        Ok(LedgerGuard { ledger: self })
    }

    /// Record an active `(original, effective)` pair.
    pub fn append(&self, original: &Path, effective: &Path) -> KellerResult<()> {
        let _guard = self.lock()?;
        let mut file = &self.file;
        writeln!(file, "{} {}", original.display(), effective.display()).map_err(|e| {
            KellerError::Ledger {
                message: format!("failed to append to {}: {e}", self.path.display()),
            }
        })?;
        tracing::debug!(ledger = %self.path.display(), "Recorded environment");
        Ok(())
    }

    /// Drop exactly one line recording `(original, effective)`, rewriting
    /// every other tenant's line verbatim.
    pub fn remove(&self, original: &Path, effective: &Path) -> KellerResult<()> {
        let _guard = self.lock()?;
        let text = std::fs::read_to_string(&self.path).unwrap_or_default();
        let needle = format!("{} {}", original.display(), effective.display());

        let mut kept = String::with_capacity(text.len());
        let mut dropped = false;
        for line in text.lines() {
            if !dropped && line == needle {
                dropped = true;
                continue;
            }
            kept.push_str(line);
            kept.push('\n');
        }

        std::fs::write(&self.path, kept).map_err(|e| KellerError::Ledger {
            message: format!("failed to rewrite {}: {e}", self.path.display()),
        })?;
        tracing::debug!(ledger = %self.path.display(), dropped, "Cleared environment");
        Ok(())
    }
}

impl Drop for LedgerGuard<'_> {
    fn drop(&mut self) {
        let _ = flock(&self.ledger.file, FlockOperation::Unlock);
    }
}
