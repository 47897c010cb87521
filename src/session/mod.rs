//! Debugger session: script buffer level breakpoints over the thread level
//! protocol

mod debugger;
mod registry;

pub use debugger::{Debugger, SessionOptions, SessionState};
pub use registry::{Applied, Breakpoint, Registry, VmValue};
