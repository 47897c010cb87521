//! Volatile per-connection debugger state
//!
//! Users think in script buffers, the target only knows thread ids. The
//! registry keeps the mapping between the two, the set of armed breakpoints,
//! and the queues a front-end drains after each update.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt;

use serde::Serialize;

use crate::common::{parse_address, Error, Result};
use crate::proto::{Reply, ThreadId, ThreadMap};

/// A breakpoint on a script buffer address.
///
/// Set per script buffer and fanned out to every thread running it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Breakpoint {
    pub script_buffer: String,
    pub address: u32,
}

impl Breakpoint {
    pub fn new(script_buffer: impl Into<String>, address: u32) -> Self {
        Self {
            script_buffer: script_buffer.into(),
            address,
        }
    }

    /// Parse a location string like "main:0x100" or "main:256"
    pub fn parse(s: &str) -> Result<Self> {
        // Script names may contain ':' themselves, the address is after the last one
        let (buffer, addr) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::InvalidLocation(format!("expected <script>:<address>, got '{}'", s)))?;

        if buffer.is_empty() {
            return Err(Error::InvalidLocation(format!("missing script buffer name in '{}'", s)));
        }

        let address = parse_address(addr)
            .ok_or_else(|| Error::InvalidLocation(format!("invalid address: {}", addr)))?;

        Ok(Self::new(buffer, address))
    }
}

impl fmt::Display for Breakpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:#x}", self.script_buffer, self.address)
    }
}

/// A value reported in reply to an inspection command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VmValue {
    Ip { tid: ThreadId, ip: u32 },
    LocalVar { tid: ThreadId, var: u32, value: i32 },
    GlobalVar { var: u32, value: i32 },
    GlobalFlag { flag: u32, value: bool },
}

impl fmt::Display for VmValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ip { tid, ip } => write!(f, "thread {} ip = {:#x}", tid, ip),
            Self::LocalVar { tid, var, value } => write!(f, "thread {} local[{}] = {}", tid, var, value),
            Self::GlobalVar { var, value } => write!(f, "global[{}] = {}", var, value),
            Self::GlobalFlag { flag, value } => write!(f, "flag[{}] = {}", flag, value),
        }
    }
}

/// What applying one reply did to the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// Thread maps were replaced
    ThreadsUpdated,
    /// A hit notification queued this many breakpoints
    Hits(usize),
    /// An inspection value was queued
    Value,
    /// Nothing changed
    Ignored,
}

#[derive(Debug, Default)]
pub struct Registry {
    script_buf_to_tids: ThreadMap,
    /// Always exactly the inverse of `script_buf_to_tids`
    tid_to_script_buf: HashMap<ThreadId, String>,
    breakpoints: BTreeSet<Breakpoint>,
    hits: VecDeque<Breakpoint>,
    values: VecDeque<VmValue>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one reply from the target
    pub fn apply(&mut self, reply: Reply) -> Applied {
        match reply {
            Reply::GetThreads { threads } => {
                self.replace_threads(threads);
                Applied::ThreadsUpdated
            }
            Reply::BreakpointHit { tid, addr } => Applied::Hits(self.record_hit(tid, addr)),
            Reply::GetIp { tid, ip } => self.push_value(VmValue::Ip { tid, ip }),
            Reply::GetLocalVar { tid, var, value } => self.push_value(VmValue::LocalVar { tid, var, value }),
            Reply::GetGlobalVar { var, value } => self.push_value(VmValue::GlobalVar { var, value }),
            Reply::GetGlobalFlag { flag, value } => self.push_value(VmValue::GlobalFlag { flag, value }),
            Reply::Unknown { tag } => {
                tracing::warn!(tag, "Ignoring reply with unknown type");
                Applied::Ignored
            }
        }
    }

    /// Replace the thread list wholesale.
    ///
    /// The inverse map is built before either map is swapped in, so both
    /// always describe the same thread list.
    pub fn replace_threads(&mut self, threads: ThreadMap) {
        let mut inverse = HashMap::new();
        for (name, tids) in &threads {
            for &tid in tids {
                if let Some(previous) = inverse.insert(tid, name.clone()) {
                    tracing::warn!(tid, first = %previous, second = %name, "Thread listed under two script buffers");
                }
            }
        }

        tracing::debug!(
            script_buffers = threads.len(),
            threads = inverse.len(),
            "Thread list updated"
        );
        self.script_buf_to_tids = threads;
        self.tid_to_script_buf = inverse;
    }

    fn record_hit(&mut self, tid: ThreadId, addr: u32) -> usize {
        // Late notifications for threads dropped by a refresh are expected
        let Some(script_buffer) = self.tid_to_script_buf.get(&tid) else {
            tracing::warn!(tid, addr, "Breakpoint hit on unknown thread");
            return 0;
        };

        let before = self.hits.len();
        self.hits.extend(
            self.breakpoints
                .iter()
                .filter(|bp| bp.address == addr && &bp.script_buffer == script_buffer)
                .cloned(),
        );

        let queued = self.hits.len() - before;
        if queued == 0 {
            tracing::debug!(tid, addr, %script_buffer, "Hit does not match any breakpoint");
        } else {
            tracing::info!(tid, addr, %script_buffer, "Breakpoint hit");
        }
        queued
    }

    fn push_value(&mut self, value: VmValue) -> Applied {
        self.values.push_back(value);
        Applied::Value
    }

    /// Threads currently running `script_buffer`
    pub fn threads_running(&self, script_buffer: &str) -> Result<&[ThreadId]> {
        self.script_buf_to_tids
            .get(script_buffer)
            .map(Vec::as_slice)
            .ok_or_else(|| Error::unknown_script_buffer(script_buffer))
    }

    /// Script buffer a thread is running, if the thread is known
    pub fn script_buffer_of(&self, tid: ThreadId) -> Option<&str> {
        self.tid_to_script_buf.get(&tid).map(String::as_str)
    }

    pub fn threads(&self) -> &ThreadMap {
        &self.script_buf_to_tids
    }

    /// Add a breakpoint, returns false if it was already present
    pub fn insert(&mut self, bp: Breakpoint) -> bool {
        self.breakpoints.insert(bp)
    }

    /// Remove a breakpoint, returns false if it was not present
    pub fn remove(&mut self, bp: &Breakpoint) -> bool {
        self.breakpoints.remove(bp)
    }

    pub fn contains(&self, bp: &Breakpoint) -> bool {
        self.breakpoints.contains(bp)
    }

    /// Armed breakpoints in script buffer, address order
    pub fn breakpoints(&self) -> impl Iterator<Item = &Breakpoint> {
        self.breakpoints.iter()
    }

    /// Take every queued hit, oldest first
    pub fn take_hits(&mut self) -> VecDeque<Breakpoint> {
        std::mem::take(&mut self.hits)
    }

    /// Take every queued inspection value, oldest first
    pub fn take_values(&mut self) -> VecDeque<VmValue> {
        std::mem::take(&mut self.values)
    }

    /// Drop the thread mapping and breakpoints of a finished connection.
    ///
    /// Undrained hits and values are kept so a front-end can still show them.
    pub fn reset(&mut self) {
        self.script_buf_to_tids.clear();
        self.tid_to_script_buf.clear();
        self.breakpoints.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn threads(entries: &[(&str, &[ThreadId])]) -> ThreadMap {
        entries
            .iter()
            .map(|(name, tids)| (name.to_string(), tids.to_vec()))
            .collect()
    }

    fn registry_with(entries: &[(&str, &[ThreadId])]) -> Registry {
        let mut registry = Registry::new();
        registry.apply(Reply::GetThreads {
            threads: threads(entries),
        });
        registry
    }

    #[test]
    fn test_parse_location() {
        assert_eq!(Breakpoint::parse("main:0x100").unwrap(), Breakpoint::new("main", 0x100));
        assert_eq!(Breakpoint::parse("main:256").unwrap(), Breakpoint::new("main", 256));
        assert_eq!(
            Breakpoint::parse("system:boot:0x10").unwrap(),
            Breakpoint::new("system:boot", 0x10)
        );
    }

    #[test]
    fn test_parse_location_errors() {
        assert!(matches!(Breakpoint::parse("main"), Err(Error::InvalidLocation(_))));
        assert!(matches!(Breakpoint::parse(":0x10"), Err(Error::InvalidLocation(_))));
        assert!(matches!(Breakpoint::parse("main:zz"), Err(Error::InvalidLocation(_))));
    }

    #[test]
    fn test_display_round_trips_through_parse() {
        let bp = Breakpoint::new("main", 0x1f0);
        assert_eq!(bp.to_string(), "main:0x1f0");
        assert_eq!(Breakpoint::parse(&bp.to_string()).unwrap(), bp);
    }

    #[test]
    fn test_inverse_map_built_from_thread_list() {
        let registry = registry_with(&[("main", &[1, 2]), ("sub", &[3])]);
        assert_eq!(registry.script_buffer_of(1), Some("main"));
        assert_eq!(registry.script_buffer_of(2), Some("main"));
        assert_eq!(registry.script_buffer_of(3), Some("sub"));
        assert_eq!(registry.script_buffer_of(4), None);
        assert_eq!(registry.threads_running("main").unwrap(), &[1, 2]);
    }

    #[test]
    fn test_second_thread_list_leaves_no_stale_entries() {
        let mut registry = registry_with(&[("main", &[1, 2]), ("sub", &[3])]);
        let applied = registry.apply(Reply::GetThreads {
            threads: threads(&[("other", &[2]), ("main", &[5])]),
        });

        assert_eq!(applied, Applied::ThreadsUpdated);
        assert_eq!(registry.script_buffer_of(1), None);
        assert_eq!(registry.script_buffer_of(3), None);
        assert_eq!(registry.script_buffer_of(2), Some("other"));
        assert_eq!(registry.script_buffer_of(5), Some("main"));
        assert!(matches!(registry.threads_running("sub"), Err(Error::UnknownScriptBuffer(_))));

        // The inverse covers exactly the listed threads
        let listed: usize = registry.threads().values().map(Vec::len).sum();
        assert_eq!(registry.tid_to_script_buf.len(), listed);
        for (name, tids) in registry.threads() {
            for tid in tids {
                assert_eq!(registry.script_buffer_of(*tid), Some(name.as_str()));
            }
        }
    }

    #[test]
    fn test_hit_matching_breakpoint_is_queued() {
        let mut registry = registry_with(&[("main", &[1])]);
        registry.insert(Breakpoint::new("main", 0x100));

        assert_eq!(registry.apply(Reply::BreakpointHit { tid: 1, addr: 0x100 }), Applied::Hits(1));
        assert_eq!(registry.apply(Reply::BreakpointHit { tid: 1, addr: 0x200 }), Applied::Hits(0));

        let hits: Vec<_> = registry.take_hits().into_iter().collect();
        assert_eq!(hits, vec![Breakpoint::new("main", 0x100)]);
        assert!(registry.take_hits().is_empty());
    }

    #[test]
    fn test_hit_on_other_script_does_not_match() {
        let mut registry = registry_with(&[("main", &[1]), ("sub", &[2])]);
        registry.insert(Breakpoint::new("main", 0x100));

        assert_eq!(registry.apply(Reply::BreakpointHit { tid: 2, addr: 0x100 }), Applied::Hits(0));
        assert!(registry.take_hits().is_empty());
    }

    #[test]
    fn test_hit_on_unknown_thread_is_ignored() {
        let mut registry = registry_with(&[("main", &[1])]);
        registry.insert(Breakpoint::new("main", 0x100));

        assert_eq!(registry.apply(Reply::BreakpointHit { tid: 9, addr: 0x100 }), Applied::Hits(0));
        assert!(registry.take_hits().is_empty());
    }

    #[test]
    fn test_hits_keep_arrival_order() {
        let mut registry = registry_with(&[("main", &[1, 2]), ("sub", &[3])]);
        registry.insert(Breakpoint::new("main", 0x10));
        registry.insert(Breakpoint::new("sub", 0x20));

        registry.apply(Reply::BreakpointHit { tid: 3, addr: 0x20 });
        registry.apply(Reply::BreakpointHit { tid: 2, addr: 0x10 });
        registry.apply(Reply::BreakpointHit { tid: 3, addr: 0x20 });

        let hits: Vec<_> = registry.take_hits().into_iter().collect();
        assert_eq!(
            hits,
            vec![
                Breakpoint::new("sub", 0x20),
                Breakpoint::new("main", 0x10),
                Breakpoint::new("sub", 0x20),
            ]
        );
    }

    #[test]
    fn test_insert_is_set_like() {
        let mut registry = Registry::new();
        assert!(registry.insert(Breakpoint::new("main", 0x100)));
        assert!(!registry.insert(Breakpoint::new("main", 0x100)));
        assert_eq!(registry.breakpoints().count(), 1);

        assert!(registry.remove(&Breakpoint::new("main", 0x100)));
        assert!(!registry.remove(&Breakpoint::new("main", 0x100)));
        assert_eq!(registry.breakpoints().count(), 0);
    }

    #[test]
    fn test_values_are_queued() {
        let mut registry = Registry::new();
        registry.apply(Reply::GetIp { tid: 1, ip: 0x44 });
        registry.apply(Reply::GetGlobalFlag { flag: 3, value: true });

        let values: Vec<_> = registry.take_values().into_iter().collect();
        assert_eq!(
            values,
            vec![
                VmValue::Ip { tid: 1, ip: 0x44 },
                VmValue::GlobalFlag { flag: 3, value: true },
            ]
        );
    }

    #[test]
    fn test_unknown_reply_changes_nothing() {
        let mut registry = registry_with(&[("main", &[1])]);
        assert_eq!(registry.apply(Reply::Unknown { tag: 77 }), Applied::Ignored);
        assert_eq!(registry.script_buffer_of(1), Some("main"));
    }

    #[test]
    fn test_reset_keeps_undrained_hits() {
        let mut registry = registry_with(&[("main", &[1])]);
        registry.insert(Breakpoint::new("main", 0x100));
        registry.apply(Reply::BreakpointHit { tid: 1, addr: 0x100 });

        registry.reset();
        assert!(registry.threads().is_empty());
        assert_eq!(registry.breakpoints().count(), 0);
        assert_eq!(registry.take_hits().len(), 1);
    }
}
