//! Process hardening for the agent.
//!
//! Run once before the socket is bound.  Each step is best effort: a
//! failure is logged and the daemon keeps going, with the outcome reported
//! in the returned [`Hardening`].
//!
//! - `umask(0077)`, so the socket directory and socket are never created
//!   accessible to other users, even before the explicit chmod.
//! - `PR_SET_DUMPABLE 0`, so other non-root processes cannot read
//!   `/proc/<pid>/mem` and no core file is written.
//! - `mlockall(MCL_CURRENT | MCL_FUTURE)`, so key pages are never swapped.
//!   Needs `CAP_IPC_LOCK` or a large enough `RLIMIT_MEMLOCK`.

use std::fmt;

const AGENT_UMASK: libc::mode_t = 0o077;

/// Outcome of [`harden_process`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hardening {
    pub previous_umask: libc::mode_t,
    pub not_dumpable: bool,
    pub memory_locked: bool,
}

impl fmt::Display for Hardening {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "umask {:03o} (was {:03o}), dumpable={}, memory {}",
            AGENT_UMASK,
            self.previous_umask,
            !self.not_dumpable,
            if self.memory_locked { "locked" } else { "swappable" }
        )
    }
}

pub fn harden_process() -> Hardening {
    Hardening {
        previous_umask: restrict_umask(),
        not_dumpable: set_not_dumpable(),
        memory_locked: lock_memory(),
    }
}

/// Returns the mask that was in effect before.
fn restrict_umask() -> libc::mode_t {
    // SAFETY: umask only swaps the process file mode mask.
    unsafe { libc::umask(AGENT_UMASK) }
}

fn set_not_dumpable() -> bool {
    // SAFETY: PR_SET_DUMPABLE takes plain integer arguments.
    let ret = unsafe { libc::prctl(libc::PR_SET_DUMPABLE, 0i64, 0i64, 0i64, 0i64) };
    if ret != 0 {
        let err = std::io::Error::last_os_error();
        tracing::warn!("PR_SET_DUMPABLE=0 failed (non-fatal): {err}");
    }
    ret == 0
}

fn lock_memory() -> bool {
    // SAFETY: mlockall has no memory-safety preconditions.
    let ret = unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) };
    if ret != 0 {
        let err = std::io::Error::last_os_error();
        tracing::warn!("mlockall failed, keys may be swapped to disk: {err}");
    }
    ret == 0
}
