//! Hillclimb library crate
//!
//! Exposes core modules so integration tests and external tooling can
//! exercise the loop's internals without going through CLI startup.

pub mod apply;
pub mod config;
pub mod decide;
pub mod error;
pub mod guard;
pub mod logging;
pub mod metrics;
pub mod patch;
pub mod record;
pub mod runner;
pub mod server;
pub mod util;
