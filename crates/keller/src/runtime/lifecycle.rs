//! The acquire/release state machine.
//!
//! `start` advances through the stages in order; on failure it logs the
//! cause and returns the [`Stage`] from which `stop` must unwind. `stop`
//! walks back from whichever stage it is given, falling through to
//! [`Stage::None`], and returns the stage still owing work when a step
//! fails, so an outer retry loop can call it again from exactly there.

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use keller_mounts::{flat, MountTree};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::{error, info, warn};

use crate::config::BuildRoot;
use crate::error::KellerResult;
use crate::exec;
use crate::filesystem;
use crate::ledger::{Ledger, LEDGER_FILE};
use crate::namespace;
use crate::overlay::{self, Overlay, UpperPair};

use super::stage::Stage;
use super::state::State;

/// System pseudo-filesystems replicated into the environment, in mount
/// order.
pub const SYSTEM_FS: [&str; 4] = ["/proc", "/sys", "/dev", "/dev/pts"];

/// Placeholder replaced by the effective root in every argv element.
pub const ROOT_PLACEHOLDER: &str = "$$build_root$$";

/// Join a rootward-absolute chroot path under the effective root.
fn under_root(root: &Path, path: &Path) -> PathBuf {
    match path.strip_prefix("/") {
        Ok(relative) => root.join(relative),
        Err(_) => root.join(path),
    }
}

/// Compose the final argv.
///
/// A configured `exec` (with its `args`) runs ahead of the caller's
/// arguments. An empty argv falls back to the first shell candidate that
/// exists under `root`, or to the first configured candidate when none
/// does. Every occurrence of [`ROOT_PLACEHOLDER`] is then replaced by the
/// effective root.
pub fn compose_argv(config: &BuildRoot, root: &Path, mut args: Vec<String>) -> Vec<String> {
    if let Some(exec) = &config.exec {
        let mut front = vec![exec.clone()];
        if let Some(extra) = &config.args {
            front.extend(extra.iter().cloned());
        }
        front.append(&mut args);
        args = front;
    }

    if args.is_empty() {
        args.push(pick_shell(config, root));
    }

    let root = root.display().to_string();
    for arg in &mut args {
        if arg.contains(ROOT_PLACEHOLDER) {
            *arg = arg.replace(ROOT_PLACEHOLDER, &root);
        }
    }
    args
}

fn pick_shell(config: &BuildRoot, root: &Path) -> String {
    for shell in &config.shell {
        if under_root(root, Path::new(shell)).exists() {
            return shell.clone();
        }
    }
    config
        .shell
        .first()
        .cloned()
        .unwrap_or_else(|| "/bin/sh".to_string())
}

/// Advance through the acquire stages and run the command.
///
/// On success the child's exit status is recorded in `state` and release
/// must unwind from [`Stage::Mtab`]. On failure the stage still owing
/// cleanup is returned after the cause has been logged.
pub fn start(state: &mut State, config: &BuildRoot, caller_args: Vec<String>) -> Result<(), Stage> {
    match Ledger::open(LEDGER_FILE) {
        Ok(ledger) => state.ledger = Some(ledger),
        Err(e) => {
            error!(error = %e, "Failed to open the ledger");
            return Err(Stage::None);
        }
    }

    if config.mktemp {
        match tempfile::Builder::new().prefix("chroot-").tempdir_in("/tmp") {
            Ok(dir) => state.effective_root = dir.keep(),
            Err(e) => {
                error!(error = %e, "Failed to create a temporary root");
                return Err(Stage::None);
            }
        }
    }

    let argv = compose_argv(config, &state.effective_root, caller_args);

    mount_root(state, config)?;

    if config.newnamespace {
        if let Err(e) = namespace::unshare_all() {
            error!(error = %e, "Failed to enter namespaces");
            return Err(Stage::SystemFs);
        }
    } else if !config.nosystem {
        mount_system_fs(state)?;
    }

    mount_binds(state, config)?;
    mount_tmpfs(state, config)?;

    if argv.is_empty() {
        error!("Nothing to exec");
        return Err(Stage::Processes);
    }

    if let Err(e) = record_ledger(state) {
        warn!(error = %e, "Failed to record the environment in the ledger");
    }

    match exec::spawn_command(&argv, config, state) {
        Ok(status) => {
            state.exit_status = status;
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Failed to run the command");
            Err(Stage::Mtab)
        }
    }
}

fn mount_root(state: &mut State, config: &BuildRoot) -> Result<(), Stage> {
    let mounts = match flat::read() {
        Ok(mounts) => mounts,
        Err(e) => {
            error!(error = %e, "Failed to read the mount table");
            return Err(Stage::Mktemp);
        }
    };

    if flat::any(&mounts, |m| m.dir == state.effective_root) {
        error!(root = %state.effective_root.display(), "Already mounted");
        return Err(Stage::Mktemp);
    }

    let upper = if config.noupper {
        None
    } else {
        let pair = UpperPair::for_build_root(&state.original_root, config.base.as_deref());
        if let Err(e) = pair.create_dirs() {
            error!(error = %e, "Failed to create the upper/work pair");
            return Err(Stage::Mktemp);
        }
        let fragment = pair.options_fragment();
        if flat::any(&mounts, |m| m.options.contains(&fragment)) {
            error!(
                upper = %pair.upper.display(),
                work = %pair.work.display(),
                "The upper/work pair is already part of an active mount"
            );
            return Err(Stage::Mktemp);
        }
        Some(pair)
    };

    let overlay = Overlay {
        source: state.original_root.clone(),
        target: state.effective_root.clone(),
        lower: overlay::lower_dirs(config),
        upper,
        index_off: config.indexoff,
    };
    if let Err(e) = overlay.mount() {
        error!(error = %e, "Failed to mount the overlay");
        return Err(Stage::Mktemp);
    }
    Ok(())
}

fn mount_system_fs(state: &mut State) -> Result<(), Stage> {
    let mounts = match flat::read() {
        Ok(mounts) => mounts,
        Err(e) => {
            error!(error = %e, "Failed to read the mount table");
            return Err(Stage::SystemFs);
        }
    };
    let by_dir = flat::index_by(&mounts, |m| m.dir.clone());

    for path in SYSTEM_FS {
        let Some(host) = by_dir.get(Path::new(path)) else {
            error!(path, "The host does not have this filesystem mounted");
            return Err(Stage::SystemFs);
        };
        let target = under_root(&state.effective_root, Path::new(path));
        if let Err(e) = filesystem::mount_system_fs(&host.source, &target, &host.fstype) {
            error!(error = %e, "Failed to replicate a system filesystem");
            return Err(Stage::SystemFs);
        }
        state.mounted_system_fs.push(target);
    }
    Ok(())
}

fn mount_binds(state: &mut State, config: &BuildRoot) -> Result<(), Stage> {
    for (destination, source) in &config.binds {
        let target = under_root(&state.effective_root, destination);
        if !target.exists() {
            // Single level only: a destination whose parent tree is not
            // already present in the composed layers is a hard failure.
            if let Err(e) = fs::create_dir(&target) {
                error!(
                    destination = %destination.display(),
                    error = %e,
                    "Failed to create the bind destination"
                );
                if config.noupper {
                    warn!("The overlay is read-only under noupper; the destination must already exist in a lower layer");
                }
                return Err(Stage::Binds);
            }
        }
        if !target.is_dir() {
            error!(destination = %destination.display(), "Bind destination is not a directory");
            return Err(Stage::Binds);
        }
        if let Err(e) = filesystem::bind_mount(source, &target) {
            error!(error = %e, "Failed to bind mount");
            return Err(Stage::Binds);
        }
        state.mounted_binds.push(target);
    }
    Ok(())
}

fn mount_tmpfs(state: &mut State, config: &BuildRoot) -> Result<(), Stage> {
    for point in &config.tmpfs {
        let target = under_root(&state.effective_root, point);
        if let Err(e) = filesystem::mount_tmpfs(&target) {
            error!(error = %e, "Failed to mount tmpfs");
            return Err(Stage::Tmpfs);
        }
        state.mounted_tmpfs.push(target);
    }
    Ok(())
}

fn record_ledger(state: &State) -> KellerResult<()> {
    if let Some(ledger) = &state.ledger {
        ledger.append(&state.original_root, &state.effective_root)?;
    }
    Ok(())
}

/// Unwind the acquire stages from `from` down to nothing.
///
/// Returns the stage still owing work when a step fails; the surviving
/// stack entries are kept so a retry resumes exactly there.
pub fn stop(state: &mut State, config: &BuildRoot, from: Stage) -> Result<(), Stage> {
    if from >= Stage::Mtab {
        if let Err(e) = clear_ledger(state) {
            error!(error = %e, "Failed to clear the ledger entry");
            return Err(Stage::Mtab);
        }
    }

    if from >= Stage::Processes {
        sweep_processes(state)?;
    }

    if from >= Stage::Tmpfs {
        release_stack(&mut state.mounted_tmpfs, Stage::Tmpfs)?;
    }

    if from >= Stage::Binds {
        release_stack(&mut state.mounted_binds, Stage::Binds)?;
    }

    if from >= Stage::SystemFs && !config.nosystem {
        release_stack(&mut state.mounted_system_fs, Stage::SystemFs)?;
    }

    if from >= Stage::Root {
        release_root(state)?;
    }

    if from >= Stage::Mktemp && config.mktemp {
        if let Err(e) = fs::remove_dir(&state.effective_root) {
            if e.kind() != std::io::ErrorKind::NotFound {
                error!(root = %state.effective_root.display(), error = %e, "Failed to remove the temporary root");
                return Err(Stage::Mktemp);
            }
        }
    }

    Ok(())
}

fn clear_ledger(state: &State) -> KellerResult<()> {
    if let Some(ledger) = &state.ledger {
        ledger.remove(&state.original_root, &state.effective_root)?;
    }
    Ok(())
}

/// SIGTERM every process whose root resolves to the effective root, then
/// give the group a second to wind down.
fn sweep_processes(state: &State) -> Result<(), Stage> {
    let entries = match fs::read_dir("/proc") {
        Ok(entries) => entries,
        Err(e) => {
            error!(error = %e, "Failed to scan /proc");
            return Err(Stage::Processes);
        }
    };

    let mut signalled = false;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(pid) = name.to_str().and_then(|n| n.parse::<i32>().ok()) else {
            continue;
        };
        // Unreadable root links (other users' processes) are skipped.
        match fs::read_link(entry.path().join("root")) {
            Ok(root) if root == state.effective_root => {
                info!(pid, "Terminating lingering process");
                signalled = true;
                if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
                    error!(pid, error = %e, "Failed to signal lingering process");
                    return Err(Stage::Processes);
                }
            }
            _ => {}
        }
    }

    if signalled {
        thread::sleep(Duration::from_secs(1));
    }
    Ok(())
}

fn release_stack(stack: &mut Vec<PathBuf>, stage: Stage) -> Result<(), Stage> {
    while let Some(target) = stack.last() {
        if let Err(e) = filesystem::unmount(target) {
            error!(error = %e, "Release failed");
            return Err(stage);
        }
        stack.pop();
    }
    Ok(())
}

/// Sweep dangling child mounts inside the effective root, innermost first,
/// then unmount the overlay itself.
fn release_root(state: &State) -> Result<(), Stage> {
    let tree = match MountTree::read() {
        Ok(tree) => tree,
        Err(e) => {
            error!(error = %e, "Failed to read the mount tree");
            return Err(Stage::Root);
        }
    };

    if let Some(node) = tree.find_mount_point(&state.effective_root) {
        if !node.children.is_empty() {
            warn!("Found dangling mounts inside the environment:\n{node}");
            for mount in node.descendants().iter().rev() {
                if let Err(e) = filesystem::unmount(&mount.mount_point) {
                    error!(error = %e, "Failed to unmount a dangling mount");
                    return Err(Stage::Root);
                }
            }
        }
    }

    if let Err(e) = filesystem::unmount(&state.effective_root) {
        error!(error = %e, "Failed to unmount the overlay");
        return Err(Stage::Root);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exec_and_args_run_ahead_of_caller_arguments() {
        let config = BuildRoot {
            exec: Some("/usr/bin/make".to_string()),
            args: Some(vec!["-C".to_string(), "/src".to_string()]),
            ..Default::default()
        };
        let argv = compose_argv(
            &config,
            Path::new("/srv/build"),
            vec!["all".to_string(), "check".to_string()],
        );
        assert_eq!(argv, ["/usr/bin/make", "-C", "/src", "all", "check"]);
    }

    #[test]
    fn placeholder_is_replaced_everywhere() {
        let config = BuildRoot::default();
        let argv = compose_argv(
            &config,
            Path::new("/tmp/chroot-abc"),
            vec![
                "/bin/echo".to_string(),
                "$$build_root$$/out".to_string(),
                "a-$$build_root$$-b".to_string(),
            ],
        );
        assert_eq!(
            argv,
            [
                "/bin/echo",
                "/tmp/chroot-abc/out",
                "a-/tmp/chroot-abc-b"
            ]
        );
    }

    #[test]
    fn shell_candidate_present_under_root_is_chosen() {
        let temp = tempfile::tempdir().unwrap();
        fs::create_dir_all(temp.path().join("bin")).unwrap();
        fs::write(temp.path().join("bin/dash"), "").unwrap();

        let config = BuildRoot {
            shell: vec!["/bin/bash".to_string(), "/bin/dash".to_string()],
            ..Default::default()
        };
        let argv = compose_argv(&config, temp.path(), Vec::new());
        assert_eq!(argv, ["/bin/dash"]);
    }

    #[test]
    fn first_candidate_is_the_fallback() {
        let temp = tempfile::tempdir().unwrap();
        let config = BuildRoot {
            shell: vec!["/bin/bash".to_string(), "/bin/dash".to_string()],
            ..Default::default()
        };
        let argv = compose_argv(&config, temp.path(), Vec::new());
        assert_eq!(argv, ["/bin/bash"]);
    }

    #[test]
    fn stop_from_none_is_a_no_op() {
        let mut state = State::new("/nonexistent/build-root");
        let config = BuildRoot::default();
        assert_eq!(stop(&mut state, &config, Stage::None), Ok(()));
    }

    #[test]
    fn stop_below_root_leaves_the_overlay_alone() {
        // From Mktemp with mktemp unset nothing at all is owed.
        let mut state = State::new("/nonexistent/build-root");
        let config = BuildRoot::default();
        assert_eq!(stop(&mut state, &config, Stage::Mktemp), Ok(()));
    }

    #[test]
    fn failed_unmount_keeps_the_stack_entry() {
        let mut state = State::new("/nonexistent/build-root");
        state
            .mounted_tmpfs
            .push(PathBuf::from("/nonexistent/build-root/tmp"));
        let config = BuildRoot::default();

        assert_eq!(stop(&mut state, &config, Stage::Tmpfs), Err(Stage::Tmpfs));
        assert_eq!(state.mounted_tmpfs.len(), 1);
    }

    #[test]
    fn unwind_reaches_the_root_stage() {
        // Empty stacks unwind cleanly; the overlay unmount of a path that
        // was never mounted is the first failure.
        let mut state = State::new("/nonexistent/build-root");
        let config = BuildRoot::default();
        assert_eq!(stop(&mut state, &config, Stage::Binds), Err(Stage::Root));
    }
}
