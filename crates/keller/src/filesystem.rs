//! Mount operations.

use std::path::Path;

use rustix::mount::{mount, unmount as rustix_unmount, MountFlags, UnmountFlags};

use crate::error::{KellerError, KellerResult};

fn mount_error(target: &Path, errno: rustix::io::Errno) -> KellerError {
    KellerError::Mount {
        target: target.to_path_buf(),
        source: errno.into(),
    }
}

/// Replicate a host mount under the effective root: same source, same
/// filesystem type, default options.
pub fn mount_system_fs(source: &str, target: &Path, fstype: &str) -> KellerResult<()> {
    tracing::debug!(source, target = %target.display(), fstype, "Mounting system filesystem");
    mount(source, target, fstype, MountFlags::empty(), None)
        .map_err(|e| mount_error(target, e))
}

/// Bind `source` onto `target`.
pub fn bind_mount(source: &Path, target: &Path) -> KellerResult<()> {
    tracing::debug!(source = %source.display(), target = %target.display(), "Bind mounting");
    mount(source, target, "", MountFlags::BIND, None).map_err(|e| mount_error(target, e))
}

/// Mount a fresh tmpfs on `target`.
pub fn mount_tmpfs(target: &Path) -> KellerResult<()> {
    tracing::debug!(target = %target.display(), "Mounting tmpfs");
    mount("tmpfs", target, "tmpfs", MountFlags::empty(), None).map_err(|e| mount_error(target, e))
}

/// Unmount `target`.
pub fn unmount(target: &Path) -> KellerResult<()> {
    tracing::debug!(target = %target.display(), "Unmounting");
    rustix_unmount(target, UnmountFlags::empty()).map_err(|e| KellerError::Unmount {
        target: target.to_path_buf(),
        source: e.into(),
    })
}
