//! Signalling helpers for supervised child processes.
//!
//! The supervisor only ever holds a child's pid between spawn and reap, so
//! every helper here takes a raw pid and reports `ESRCH` as "already gone"
//! rather than as an error.

use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;

pub use nix::sys::signal::Signal as UnixSignal;

/// Send `signal` to `pid`.
///
/// Returns `Ok(false)` if the process no longer exists.
pub fn send_signal(pid: u32, signal: Signal) -> Result<bool, Errno> {
    match kill(Pid::from_raw(pid as i32), signal) {
        Ok(()) => Ok(true),
        Err(Errno::ESRCH) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Send `signal` to every process in the group led by `pgid`.
///
/// Children are started as group leaders, so this also reaches anything a
/// wrapper script forked. Returns `Ok(false)` if the group is empty.
pub fn send_group_signal(pgid: u32, signal: Signal) -> Result<bool, Errno> {
    match killpg(Pid::from_raw(pgid as i32), signal) {
        Ok(()) => Ok(true),
        Err(Errno::ESRCH) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Check whether a process with this pid exists.
///
/// Uses the null signal, so it only probes for existence. A zombie that has
/// not been reaped yet still counts as alive.
pub fn is_alive(pid: u32) -> bool {
    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        // Exists but belongs to someone else
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Human-readable name of a signal, e.g. `SIGTERM`.
pub fn signal_name(signal: Signal) -> &'static str {
    signal.as_str()
}
