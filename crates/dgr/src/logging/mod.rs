//! Logger setup for DGR processes.
//!
//! Library code only talks to the `log` facade; binaries call
//! [`init_logging`] once from `main`.

mod init;

pub use init::{LoggingConfig, init_logging};
