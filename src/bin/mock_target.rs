//! Mock script VM target for manual and integration testing
//!
//! Serves the target side of the debug protocol on a TCP port. Each script
//! thread "runs" on a timer: a running thread with breakpoints armed stops at
//! the lowest one on the next tick and reports a hit.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;

use sc3dbg::proto::{Command, Connection, ConnectionOptions, Reply, ThreadId, ThreadMap};
use sc3dbg::Result;

#[derive(Parser)]
#[command(name = "mock-target", about = "Mock SC3 script VM debug target")]
struct Args {
    /// Port to listen on
    #[arg(long, short, default_value = "1337")]
    port: u16,

    /// Script buffer and the threads running it, as name=tid,tid.
    /// Can be specified multiple times. Default: main=1,2 and system=3
    #[arg(long = "script", short = 's')]
    scripts: Vec<String>,

    /// Milliseconds between execution ticks
    #[arg(long, default_value = "500")]
    tick_millis: u64,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_target(false)
        .init();

    let args = Args::parse();

    if let Err(e) = run(args).await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let threads = if args.scripts.is_empty() {
        default_threads()
    } else {
        parse_scripts(&args.scripts).map_err(sc3dbg::Error::ConfigParse)?
    };

    let listener = TcpListener::bind(("127.0.0.1", args.port)).await?;
    tracing::info!(addr = ?listener.local_addr().ok(), "Mock target listening");

    loop {
        let (stream, peer) = listener.accept().await?;
        tracing::info!(%peer, "Debugger connected");

        let conn = Connection::from_stream(stream, &ConnectionOptions::default());
        let mut vm = MockVm::new(threads.clone());
        match vm.serve(conn, tick_interval(args.tick_millis)).await {
            Ok(()) => tracing::info!(%peer, "Debugger disconnected"),
            Err(e) => tracing::warn!(%peer, error = %e, "Debugger connection ended with error"),
        }
    }
}

/// Tick period; tokio intervals reject a zero period
fn tick_interval(millis: u64) -> Duration {
    Duration::from_millis(millis.max(1))
}

fn default_threads() -> ThreadMap {
    let mut threads = ThreadMap::new();
    threads.insert("main".to_string(), vec![1, 2]);
    threads.insert("system".to_string(), vec![3]);
    threads
}

fn parse_scripts(entries: &[String]) -> std::result::Result<ThreadMap, String> {
    let mut threads = ThreadMap::new();
    for entry in entries {
        let (name, tids) = entry
            .split_once('=')
            .ok_or_else(|| format!("expected name=tid,tid, got '{}'", entry))?;
        let tids = tids
            .split(',')
            .filter(|t| !t.is_empty())
            .map(|t| t.trim().parse::<ThreadId>().map_err(|_| format!("invalid thread id '{}'", t)))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        threads.insert(name.to_string(), tids);
    }
    Ok(threads)
}

#[derive(Debug, Default)]
struct MockThread {
    ip: u32,
    stopped: bool,
    breakpoints: BTreeSet<u32>,
}

struct MockVm {
    threads: ThreadMap,
    state: BTreeMap<ThreadId, MockThread>,
}

impl MockVm {
    fn new(threads: ThreadMap) -> Self {
        let state = threads
            .values()
            .flatten()
            .map(|&tid| (tid, MockThread::default()))
            .collect();
        Self { threads, state }
    }

    async fn serve(&mut self, mut conn: Connection, tick: Duration) -> Result<()> {
        let mut ticker = tokio::time::interval(tick);

        loop {
            tokio::select! {
                ready = conn.readable() => {
                    ready?;
                    loop {
                        match conn.poll_message::<Command>() {
                            Ok(Some(cmd)) => {
                                tracing::debug!(?cmd, "Command");
                                if let Some(reply) = self.handle(cmd) {
                                    conn.send_message(&reply).await?;
                                }
                            }
                            Ok(None) => break,
                            Err(sc3dbg::Error::ConnectionClosed) => return Ok(()),
                            Err(e) => return Err(e),
                        }
                    }
                }
                _ = ticker.tick() => {
                    for reply in self.step() {
                        conn.send_message(&reply).await?;
                    }
                }
            }
        }
    }

    fn handle(&mut self, cmd: Command) -> Option<Reply> {
        match cmd {
            Command::GetThreads => Some(Reply::GetThreads {
                threads: self.threads.clone(),
            }),
            Command::GetIp { tid } => {
                let ip = self.state.get(&tid).map_or(0, |t| t.ip);
                Some(Reply::GetIp { tid, ip })
            }
            Command::GetLocalVar { tid, var } => Some(Reply::GetLocalVar {
                tid,
                var,
                value: (i32::from(tid) * 100).wrapping_add(var as i32),
            }),
            Command::GetGlobalVar { var } => Some(Reply::GetGlobalVar {
                var,
                value: (var as i32).wrapping_mul(10),
            }),
            Command::GetGlobalFlag { flag } => Some(Reply::GetGlobalFlag {
                flag,
                value: flag % 2 == 0,
            }),
            Command::BreakNow { tid } => {
                if let Some(thread) = self.state.get_mut(&tid) {
                    thread.stopped = true;
                }
                None
            }
            Command::Continue { tid } => {
                if let Some(thread) = self.state.get_mut(&tid) {
                    thread.stopped = false;
                }
                None
            }
            Command::SetBreakpoint { tid, addr } => {
                if let Some(thread) = self.state.get_mut(&tid) {
                    thread.breakpoints.insert(addr);
                }
                None
            }
            Command::UnsetBreakpoint { tid, addr } => {
                if let Some(thread) = self.state.get_mut(&tid) {
                    thread.breakpoints.remove(&addr);
                }
                None
            }
        }
    }

    /// Advance every running thread; returns hit notifications
    fn step(&mut self) -> Vec<Reply> {
        let mut hits = Vec::new();
        for (&tid, thread) in self.state.iter_mut().filter(|(_, t)| !t.stopped) {
            match thread.breakpoints.iter().next() {
                Some(&addr) => {
                    thread.ip = addr;
                    thread.stopped = true;
                    tracing::info!(tid, addr, "Thread hit breakpoint");
                    hits.push(Reply::BreakpointHit { tid, addr });
                }
                None => thread.ip = thread.ip.wrapping_add(4),
            }
        }
        hits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_scripts() {
        let threads = parse_scripts(&["main=1,2".to_string(), "idle=".to_string()]).unwrap();
        assert_eq!(threads["main"], vec![1, 2]);
        assert!(threads["idle"].is_empty());
        assert!(parse_scripts(&["main".to_string()]).is_err());
        assert!(parse_scripts(&["main=300".to_string()]).is_err());
    }

    #[test]
    fn test_running_thread_stops_at_breakpoint() {
        let mut vm = MockVm::new(default_threads());
        vm.handle(Command::SetBreakpoint { tid: 1, addr: 0x40 });

        let hits = vm.step();
        assert_eq!(hits, vec![Reply::BreakpointHit { tid: 1, addr: 0x40 }]);
        // Stopped threads do not hit again until continued
        assert!(vm.step().is_empty());

        vm.handle(Command::Continue { tid: 1 });
        assert_eq!(vm.step(), vec![Reply::BreakpointHit { tid: 1, addr: 0x40 }]);
    }

    #[test]
    fn test_zero_tick_is_clamped() {
        assert_eq!(tick_interval(0), Duration::from_millis(1));
        assert_eq!(tick_interval(250), Duration::from_millis(250));
    }

    #[test]
    fn test_large_variable_numbers_wrap() {
        let mut vm = MockVm::new(default_threads());
        assert_eq!(
            vm.handle(Command::GetGlobalVar { var: 300_000_000 }),
            Some(Reply::GetGlobalVar {
                var: 300_000_000,
                value: 300_000_000i32.wrapping_mul(10),
            })
        );
        assert_eq!(
            vm.handle(Command::GetLocalVar { tid: 255, var: u32::MAX }),
            Some(Reply::GetLocalVar {
                tid: 255,
                var: u32::MAX,
                value: 25_500i32.wrapping_add(-1),
            })
        );
    }

    #[test]
    fn test_inspection_replies() {
        let mut vm = MockVm::new(default_threads());
        assert_eq!(
            vm.handle(Command::GetLocalVar { tid: 2, var: 5 }),
            Some(Reply::GetLocalVar { tid: 2, var: 5, value: 205 })
        );
        assert_eq!(
            vm.handle(Command::GetGlobalFlag { flag: 4 }),
            Some(Reply::GetGlobalFlag { flag: 4, value: true })
        );
    }
}
