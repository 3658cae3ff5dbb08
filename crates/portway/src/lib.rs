// Library exports for the daemon binary and integration tests

pub mod admin_api;
pub mod config;
pub mod forward;
pub mod metrics;
