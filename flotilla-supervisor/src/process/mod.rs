//! Child process management for the supervisor
//!
//! This module provides:
//! - `ProgramRunner` - launch a child with the derived environment, tag its
//!   output, and stop it with SIGTERM-then-SIGKILL on cancellation
//! - `RunOptions` - per-call stdout sink, extra env, user and stdin
//! - `log_tag` - the short component name shown in front of child output

mod runner;
mod tag;

pub use runner::{DEFAULT_GRACE, ProgramRunner, RunOptions};
pub use tag::{ROOT_SERVER, log_tag};

#[cfg(test)]
mod tests;
