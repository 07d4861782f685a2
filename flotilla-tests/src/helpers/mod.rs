pub mod config_builder;
pub mod fake_health;
pub mod marker_files;
pub mod script_plan;
pub mod supervisor_harness;
pub mod wait_utils;
