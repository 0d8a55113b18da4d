//! Child process spawn.

use std::collections::HashSet;
use std::ffi::CString;

use tracing::info;

use crate::config::BuildRoot;
use crate::error::{KellerError, KellerResult};
use crate::runtime::State;
use crate::supervisor;

/// Fork, run `argv` inside the environment, and wait for it to exit.
///
/// The child chdirs to the effective root, chroots unless `nochroot`,
/// drops its effective uid to the real uid, closes every descriptor >= 3
/// not in the keep set, and execs with the reconstructed environment. The
/// returned status is the child's exit code, or `128 + signal` when it was
/// killed.
pub fn spawn_command(argv: &[String], config: &BuildRoot, state: &State) -> KellerResult<i32> {
    let c_argv = to_cstrings(argv)?;
    let env = config.child_env(&state.original_root);
    let c_env = to_cstrings(
        &env.iter()
            .map(|(key, val)| format!("{key}={val}"))
            .collect::<Vec<_>>(),
    )?;

    info!(command = ?argv, "Spawning");

    let pid = unsafe { libc::fork() };
    if pid < 0 {
        return Err(KellerError::Spawn {
            message: format!("fork failed: {}", std::io::Error::last_os_error()),
        });
    }
    if pid == 0 {
        child_exec(&c_argv, &c_env, config, state);
    }

    supervisor::set_child(pid);
    let status = wait_child(pid);
    supervisor::clear_child();
    status
}

fn to_cstrings(strings: &[String]) -> KellerResult<Vec<CString>> {
    strings
        .iter()
        .map(|s| {
            CString::new(s.as_bytes()).map_err(|_| KellerError::Spawn {
                message: format!("argument contains a NUL byte: {s:?}"),
            })
        })
        .collect()
}

/// Child side of the fork; never returns.
fn child_exec(argv: &[CString], env: &[CString], config: &BuildRoot, state: &State) -> ! {
    if let Err(e) = enter_root(config, state) {
        eprintln!("keller: {e}");
        unsafe { libc::_exit(1) };
    }

    // The manager may run setuid; the command must not.
    unsafe {
        if libc::seteuid(libc::getuid()) != 0 {
            eprintln!("keller: failed to drop the effective uid");
            libc::_exit(1);
        }
    }

    close_unkept_fds(&state.keep_fds);

    let argv_ptrs: Vec<*const libc::c_char> = argv
        .iter()
        .map(|arg| arg.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect();
    let env_ptrs: Vec<*const libc::c_char> = env
        .iter()
        .map(|entry| entry.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect();

    unsafe {
        libc::execve(argv[0].as_ptr(), argv_ptrs.as_ptr(), env_ptrs.as_ptr());
    }
    eprintln!(
        "keller: failed to exec {}: {}",
        argv[0].to_string_lossy(),
        std::io::Error::last_os_error()
    );
    unsafe { libc::_exit(127) }
}

fn enter_root(config: &BuildRoot, state: &State) -> KellerResult<()> {
    let spawn_error = |what: &str, errno: rustix::io::Errno| KellerError::Spawn {
        message: format!("{what} failed: {}", std::io::Error::from(errno)),
    };

    rustix::process::chdir(&state.effective_root).map_err(|e| spawn_error("chdir", e))?;
    if !config.nochroot {
        rustix::process::chroot(".").map_err(|e| spawn_error("chroot", e))?;
        rustix::process::chdir(&config.cwd).map_err(|e| spawn_error("chdir", e))?;
    }
    Ok(())
}

fn close_unkept_fds(keep: &HashSet<i32>) {
    let limit = unsafe { libc::sysconf(libc::_SC_OPEN_MAX) };
    let limit = if limit < 0 { 1024 } else { limit as i32 };
    for fd in 3..limit {
        if keep.contains(&fd) {
            continue;
        }
        unsafe {
            libc::close(fd);
        }
    }
}

fn wait_child(pid: libc::pid_t) -> KellerResult<i32> {
    let mut status: libc::c_int = 0;
    loop {
        let rc = unsafe { libc::waitpid(pid, &mut status, 0) };
        if rc == -1 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return Err(KellerError::Spawn {
                message: format!("waitpid failed: {err}"),
            });
        }
        break;
    }

    if libc::WIFEXITED(status) {
        Ok(libc::WEXITSTATUS(status))
    } else if libc::WIFSIGNALED(status) {
        Ok(128 + libc::WTERMSIG(status))
    } else {
        Ok(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::os::unix::io::AsRawFd;

    /// Every descriptor currently open in this process.
    fn open_fds() -> HashSet<i32> {
        std::fs::read_dir("/proc/self/fd")
            .expect("Failed to read /proc/self/fd")
            .flatten()
            .filter_map(|entry| entry.file_name().into_string().ok()?.parse().ok())
            .collect()
    }

    fn fd_is_open(fd: i32) -> bool {
        unsafe { libc::fcntl(fd, libc::F_GETFD) != -1 }
    }

    #[test]
    fn unkept_fds_are_closed_and_kept_fds_survive() {
        // Keep everything the harness already owns; only the descriptors
        // opened below are up for closing.
        let mut keep = open_fds();

        let kept = File::open("/dev/null").unwrap();
        let unkept = File::open("/dev/null").unwrap();
        let kept_fd = kept.as_raw_fd();
        let unkept_fd = unkept.as_raw_fd();
        keep.insert(kept_fd);

        close_unkept_fds(&keep);

        assert!(fd_is_open(kept_fd));
        assert!(!fd_is_open(unkept_fd));

        // Already closed; dropping the handle would close whatever
        // descriptor has reused the number by then.
        std::mem::forget(unkept);
    }

    #[test]
    fn stdio_is_never_touched() {
        close_unkept_fds(&open_fds());
        assert!(fd_is_open(0));
        assert!(fd_is_open(1));
        assert!(fd_is_open(2));
    }

    #[test]
    fn arguments_with_nul_bytes_are_refused() {
        let argv = vec!["/bin/echo".to_string(), "a\0b".to_string()];
        assert!(matches!(
            to_cstrings(&argv),
            Err(KellerError::Spawn { .. })
        ));
    }
}
