//! Test utilities for the flotilla workspace
//!
//! Harnesses for running the supervisor against small task plans made of
//! shell scripts, with fake health endpoints standing in for real services.

pub mod helpers;

pub use helpers::config_builder::{TestClusterBuilder, TestConfigBuilder};
pub use helpers::fake_health::FakeHealthServer;
pub use helpers::marker_files::MarkerFileHelper;
pub use helpers::script_plan::{ScriptPlan, ScriptService, ScriptTask};
pub use helpers::supervisor_harness::TestSupervisor;
pub use helpers::wait_utils::{WaitError, wait_for, wait_for_state};

/// Route supervisor logs to the test writer; honours `RUST_LOG`
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}
