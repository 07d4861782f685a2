//! Unix helpers shared by the flotilla supervisor and its tests.
//!
//! - [`process`] - signalling and liveness checks for child pids
//! - [`users`] - user/group resolution for privilege dropping

#[cfg(unix)]
pub mod process;
#[cfg(unix)]
pub mod users;
