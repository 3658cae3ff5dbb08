//! Admin API request handlers.

pub mod forwards;
pub mod system;
