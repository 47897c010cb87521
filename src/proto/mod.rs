//! Debug protocol between the debugger and a script VM target
//!
//! The debugger always initiates a TCP connection to the target. Both
//! directions carry length-prefixed binary frames, see [`codec`].

pub mod codec;
pub mod connection;
pub mod types;

pub use codec::{Codec, CodecError, WireMessage};
pub use connection::{Connection, ConnectionOptions, FrameBuffer};
pub use types::{Command, Reply, ThreadId, ThreadMap};
