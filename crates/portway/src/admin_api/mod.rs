//! Admin REST API for the forwarding engine.
//!
//! This module provides the `/forwards` REST surface:
//! - Creating, updating, deleting and listing rules
//! - Starting and stopping rules
//! - Per-rule and aggregate statistics
//! - Health and metrics endpoints
//!
//! The API listens on a configurable port (default: 2480).

mod handlers;
mod router;
mod server;
mod types;

pub use server::AdminApiServer;
pub use types::{ListQuery, DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE};
