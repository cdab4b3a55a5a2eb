//! Hostgate - one local entrypoint for many independently started apps
//!
//! This library provides:
//! - A route registry in a shared state directory that any local process can
//!   add itself to, guarded by a cross-process lock
//! - Liveness-based cleanup of routes whose owning process has exited
//! - A dispatcher that routes HTTP and upgrade traffic by Host header to
//!   `127.0.0.1:<port>`, reading the current routes on every request
//! - Helpers to pick a free backend port and detect a running dispatcher

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod lock;
pub mod pages;
pub mod pool;
pub mod ports;
pub mod process;
pub mod registry;
pub mod route;

/// Package name, used in logs and CLI output
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
/// Package version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
