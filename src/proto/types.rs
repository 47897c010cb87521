//! Debug protocol message types
//!
//! The target keeps no notion of script buffers for breakpoints. Everything on
//! the wire is addressed by thread id, and the debugger maps script buffers to
//! threads itself.

use std::collections::BTreeMap;

use bytes::{BufMut, BytesMut};

use super::codec::{self, CodecError, WireMessage};

/// Identifies one script thread on the target. Assigned by the target.
pub type ThreadId = u8;

/// Thread list as reported by the target: script buffer name to the threads
/// currently executing it.
pub type ThreadMap = BTreeMap<String, Vec<ThreadId>>;

/// Debugger -> target
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// List running threads grouped by script buffer
    GetThreads,
    /// Get a thread's instruction pointer
    GetIp { tid: ThreadId },
    /// Get a 32-bit thread-local variable
    GetLocalVar { tid: ThreadId, var: u32 },
    /// Get a 32-bit global variable
    GetGlobalVar { var: u32 },
    /// Get a global flag
    GetGlobalFlag { flag: u32 },
    /// Break execution
    BreakNow { tid: ThreadId },
    /// Continue execution
    Continue { tid: ThreadId },
    SetBreakpoint { tid: ThreadId, addr: u32 },
    UnsetBreakpoint { tid: ThreadId, addr: u32 },
}

impl Command {
    const GET_THREADS: u8 = 0;
    const GET_IP: u8 = 1;
    const GET_LOCAL_VAR: u8 = 2;
    const GET_GLOBAL_VAR: u8 = 3;
    const GET_GLOBAL_FLAG: u8 = 4;
    const BREAK_NOW: u8 = 5;
    const CONTINUE: u8 = 6;
    const SET_BREAKPOINT: u8 = 7;
    const UNSET_BREAKPOINT: u8 = 8;

    /// Wire tag of this command
    pub fn tag(&self) -> u8 {
        match self {
            Self::GetThreads => Self::GET_THREADS,
            Self::GetIp { .. } => Self::GET_IP,
            Self::GetLocalVar { .. } => Self::GET_LOCAL_VAR,
            Self::GetGlobalVar { .. } => Self::GET_GLOBAL_VAR,
            Self::GetGlobalFlag { .. } => Self::GET_GLOBAL_FLAG,
            Self::BreakNow { .. } => Self::BREAK_NOW,
            Self::Continue { .. } => Self::CONTINUE,
            Self::SetBreakpoint { .. } => Self::SET_BREAKPOINT,
            Self::UnsetBreakpoint { .. } => Self::UNSET_BREAKPOINT,
        }
    }
}

impl WireMessage for Command {
    fn encode_payload(&self, dst: &mut BytesMut) {
        dst.put_u8(self.tag());
        match *self {
            Self::GetThreads => {}
            Self::GetIp { tid } | Self::BreakNow { tid } | Self::Continue { tid } => {
                dst.put_u8(tid);
            }
            Self::GetLocalVar { tid, var } => {
                dst.put_u8(tid);
                dst.put_u32_le(var);
            }
            Self::GetGlobalVar { var } => dst.put_u32_le(var),
            Self::GetGlobalFlag { flag } => dst.put_u32_le(flag),
            Self::SetBreakpoint { tid, addr } | Self::UnsetBreakpoint { tid, addr } => {
                dst.put_u8(tid);
                dst.put_u32_le(addr);
            }
        }
    }

    fn decode_payload(src: &mut &[u8]) -> Result<Self, CodecError> {
        let cmd = match codec::get_u8(src)? {
            Self::GET_THREADS => Self::GetThreads,
            Self::GET_IP => Self::GetIp {
                tid: codec::get_u8(src)?,
            },
            Self::GET_LOCAL_VAR => Self::GetLocalVar {
                tid: codec::get_u8(src)?,
                var: codec::get_u32(src)?,
            },
            Self::GET_GLOBAL_VAR => Self::GetGlobalVar {
                var: codec::get_u32(src)?,
            },
            Self::GET_GLOBAL_FLAG => Self::GetGlobalFlag {
                flag: codec::get_u32(src)?,
            },
            Self::BREAK_NOW => Self::BreakNow {
                tid: codec::get_u8(src)?,
            },
            Self::CONTINUE => Self::Continue {
                tid: codec::get_u8(src)?,
            },
            Self::SET_BREAKPOINT => Self::SetBreakpoint {
                tid: codec::get_u8(src)?,
                addr: codec::get_u32(src)?,
            },
            Self::UNSET_BREAKPOINT => Self::UnsetBreakpoint {
                tid: codec::get_u8(src)?,
                addr: codec::get_u32(src)?,
            },
            other => return Err(CodecError::UnknownCommand(other)),
        };
        Ok(cmd)
    }
}

/// Target -> debugger
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    GetThreads { threads: ThreadMap },
    GetIp { tid: ThreadId, ip: u32 },
    GetLocalVar { tid: ThreadId, var: u32, value: i32 },
    GetGlobalVar { var: u32, value: i32 },
    GetGlobalFlag { flag: u32, value: bool },
    /// Unsolicited: a thread stopped at an armed address
    BreakpointHit { tid: ThreadId, addr: u32 },
    /// A tag this debugger does not understand. The payload is skipped.
    ///
    /// Decode-only: encoding writes just the tag, so the skipped payload is
    /// lost and a known tag here would not decode back to `Unknown`.
    Unknown { tag: u8 },
}

impl Reply {
    const GET_THREADS: u8 = 0;
    const GET_IP: u8 = 1;
    const GET_LOCAL_VAR: u8 = 2;
    const GET_GLOBAL_VAR: u8 = 3;
    const GET_GLOBAL_FLAG: u8 = 4;
    const BREAKPOINT_HIT: u8 = 5;

    /// Wire tag of this reply
    pub fn tag(&self) -> u8 {
        match self {
            Self::GetThreads { .. } => Self::GET_THREADS,
            Self::GetIp { .. } => Self::GET_IP,
            Self::GetLocalVar { .. } => Self::GET_LOCAL_VAR,
            Self::GetGlobalVar { .. } => Self::GET_GLOBAL_VAR,
            Self::GetGlobalFlag { .. } => Self::GET_GLOBAL_FLAG,
            Self::BreakpointHit { .. } => Self::BREAKPOINT_HIT,
            Self::Unknown { tag } => *tag,
        }
    }
}

impl WireMessage for Reply {
    fn encode_payload(&self, dst: &mut BytesMut) {
        dst.put_u8(self.tag());
        match self {
            Self::GetThreads { threads } => {
                dst.put_u32_le(threads.len() as u32);
                for (name, tids) in threads {
                    codec::put_string(dst, name);
                    dst.put_u32_le(tids.len() as u32);
                    dst.put_slice(tids);
                }
            }
            Self::GetIp { tid, ip } => {
                dst.put_u8(*tid);
                dst.put_u32_le(*ip);
            }
            Self::GetLocalVar { tid, var, value } => {
                dst.put_u8(*tid);
                dst.put_u32_le(*var);
                dst.put_i32_le(*value);
            }
            Self::GetGlobalVar { var, value } => {
                dst.put_u32_le(*var);
                dst.put_i32_le(*value);
            }
            Self::GetGlobalFlag { flag, value } => {
                dst.put_u32_le(*flag);
                dst.put_u8(u8::from(*value));
            }
            Self::BreakpointHit { tid, addr } => {
                dst.put_u8(*tid);
                dst.put_u32_le(*addr);
            }
            Self::Unknown { .. } => {}
        }
    }

    fn decode_payload(src: &mut &[u8]) -> Result<Self, CodecError> {
        let reply = match codec::get_u8(src)? {
            Self::GET_THREADS => {
                let count = codec::get_u32(src)?;
                let mut threads = ThreadMap::new();
                for _ in 0..count {
                    let name = codec::get_string(src)?;
                    let len = codec::get_u32(src)? as usize;
                    if src.len() < len {
                        return Err(CodecError::Truncated);
                    }
                    let (tids, rest) = src.split_at(len);
                    *src = rest;
                    threads.insert(name, tids.to_vec());
                }
                Self::GetThreads { threads }
            }
            Self::GET_IP => Self::GetIp {
                tid: codec::get_u8(src)?,
                ip: codec::get_u32(src)?,
            },
            Self::GET_LOCAL_VAR => Self::GetLocalVar {
                tid: codec::get_u8(src)?,
                var: codec::get_u32(src)?,
                value: codec::get_i32(src)?,
            },
            Self::GET_GLOBAL_VAR => Self::GetGlobalVar {
                var: codec::get_u32(src)?,
                value: codec::get_i32(src)?,
            },
            Self::GET_GLOBAL_FLAG => Self::GetGlobalFlag {
                flag: codec::get_u32(src)?,
                value: codec::get_bool(src)?,
            },
            Self::BREAKPOINT_HIT => Self::BreakpointHit {
                tid: codec::get_u8(src)?,
                addr: codec::get_u32(src)?,
            },
            tag => {
                // The frame length already bounds the payload, so the rest can
                // be dropped without losing sync.
                *src = &[];
                Self::Unknown { tag }
            }
        };
        Ok(reply)
    }
}
