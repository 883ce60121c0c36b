//! Transport layer for the storage node.
//!
//! Only HTTP is provided: a small axum server for metrics scraping and status checks.

pub mod http;

pub use http::{StatusServer, wait_for_signal};
