//! CLI command implementations.

pub mod check;
pub mod watch;

pub use check::{check, CheckOptions};
pub use watch::watch;
