//! Signal forwarding and the release retry loop.
//!
//! The first SIGINT/SIGTERM is forwarded to the foreground child and
//! latches a halting flag; later deliveries are ignored. The manager's own
//! syscalls are never interrupted — the forwarded signal makes the child
//! exit, `waitpid` return, and release begin.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::thread;
use std::time::Duration;

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use tracing::{error, warn};

use crate::config::BuildRoot;
use crate::error::{KellerError, KellerResult};
use crate::runtime::{self, Stage, State};

/// Pid of the foreground child; -1 when none is running.
static CHILD_PID: AtomicI32 = AtomicI32::new(-1);

/// Latched once the first trapped signal has been forwarded.
static HALTING: AtomicBool = AtomicBool::new(false);

/// How many times a failing release is retried.
const RELEASE_RETRIES: u32 = 3;

/// Pause between release retries.
const RELEASE_BACKOFF: Duration = Duration::from_secs(1);

/// Install the SIGINT/SIGTERM traps. One-shot, called at startup.
pub fn install() -> KellerResult<()> {
    let action = SigAction::new(
        SigHandler::Handler(forward_signal),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    // Safety: the handler body is async-signal-safe; it only touches
    // atomics and issues kill(2).
    unsafe {
        for signal in [Signal::SIGINT, Signal::SIGTERM] {
            sigaction(signal, &action).map_err(|e| KellerError::Signal {
                source: std::io::Error::from_raw_os_error(e as i32),
            })?;
        }
    }
    Ok(())
}

extern "C" fn forward_signal(signum: libc::c_int) {
    if HALTING.swap(true, Ordering::SeqCst) {
        return;
    }
    let pid = CHILD_PID.load(Ordering::SeqCst);
    if pid > 1 {
        unsafe {
            libc::kill(pid, signum);
        }
    }
}

/// Record the foreground child for the signal trap.
pub fn set_child(pid: i32) {
    CHILD_PID.store(pid, Ordering::SeqCst);
}

/// Forget the foreground child once it has been reaped.
pub fn clear_child() {
    CHILD_PID.store(-1, Ordering::SeqCst);
}

/// Whether a trapped signal has begun a shutdown.
pub fn halting() -> bool {
    HALTING.load(Ordering::SeqCst)
}

/// Run the release phase from `from`, retrying a failing stage a bounded
/// number of times. Returns `true` when the environment was fully
/// released.
pub fn release(state: &mut State, config: &BuildRoot, from: Stage) -> bool {
    let mut owing = Some(from);
    for attempt in 0..=RELEASE_RETRIES {
        let Some(stage) = owing else {
            return true;
        };
        if attempt > 0 {
            warn!(%stage, attempt, "Retrying release");
            thread::sleep(RELEASE_BACKOFF);
        }
        owing = runtime::stop(state, config, stage).err();
    }

    match owing {
        None => true,
        Some(stage) => {
            error!(%stage, "Giving up on release");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_of_an_empty_state_succeeds_immediately() {
        let mut state = State::new("/nonexistent/build-root");
        let config = BuildRoot::default();
        assert!(release(&mut state, &config, Stage::None));
    }

    #[test]
    fn child_latch_round_trips() {
        set_child(4242);
        assert_eq!(CHILD_PID.load(Ordering::SeqCst), 4242);
        clear_child();
        assert_eq!(CHILD_PID.load(Ordering::SeqCst), -1);
        assert!(!halting());
    }
}
