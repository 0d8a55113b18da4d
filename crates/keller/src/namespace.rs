//! Kernel namespace entry.

use crate::error::{KellerError, KellerResult};

/// Unshare the environment's namespace set: filesystem attributes, cgroup,
/// IPC, network, mount, PID, UTS and SysV semaphores. The user namespace
/// is intentionally not part of the set.
pub fn unshare_all() -> KellerResult<()> {
    use rustix::thread::{unshare_unsafe, UnshareFlags};

    let flags = UnshareFlags::FS
        | UnshareFlags::NEWCGROUP
        | UnshareFlags::NEWIPC
        | UnshareFlags::NEWNET
        | UnshareFlags::NEWNS
        | UnshareFlags::NEWPID
        | UnshareFlags::NEWUTS
        | UnshareFlags::SYSVSEM;

    // Safety: the manager is single-threaded and shares no file
    // descriptor table with a sibling.
    unsafe { unshare_unsafe(flags) }.map_err(|e| KellerError::Unshare { source: e.into() })?;

    tracing::debug!(?flags, "Unshared namespaces");
    Ok(())
}
