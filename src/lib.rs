//! SC3 Debugger - remote debugger for SC3 script VMs
//!
//! This library speaks the binary debug protocol of a running script VM:
//! it lists script threads, sets breakpoints per script buffer, and reports
//! breakpoint hits and inspected values.

pub mod cli;
pub mod commands;
pub mod common;
pub mod proto;
pub mod session;

// Re-export commonly used types for tests
pub use common::{Error, Result};
pub use session::{Breakpoint, Debugger, SessionOptions, SessionState, VmValue};
