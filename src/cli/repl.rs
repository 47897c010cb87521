//! Interactive attach loop
//!
//! Polls the session on a fixed interval and reads commands from stdin in
//! the same task, so hits are reported while the user is typing.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::MissedTickBehavior;

use super::{print_breakpoints, print_threads};
use crate::common::{parse_address, Result};
use crate::proto::ThreadId;
use crate::session::{Breakpoint, Debugger};

const HELP: &str = "\
Commands:
  break <script>:<addr>     Set a breakpoint (alias: b)
  delete <script>:<addr>    Remove a breakpoint (alias: d)
  continue [script]         Resume the last hit script, or the named one (alias: c)
  pause <script>            Break every thread running a script
  threads                   Show the known thread list
  refresh                   Ask the target for a new thread list
  ip <tid>                  Read a thread's instruction pointer
  local <tid> <var>         Read a thread-local variable
  global <var>              Read a global variable
  flag <flag>               Read a global flag
  list                      List breakpoints (alias: l)
  help                      Show this help
  quit                      Detach and exit (alias: q)";

/// One line of user input
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplCommand {
    Break(Breakpoint),
    Delete(Breakpoint),
    Continue(Option<String>),
    Pause(String),
    Threads,
    Refresh,
    Ip(ThreadId),
    Local(ThreadId, u32),
    Global(u32),
    Flag(u32),
    List,
    Help,
    Quit,
}

impl ReplCommand {
    pub fn parse(line: &str) -> std::result::Result<Self, String> {
        let mut words = line.split_whitespace();
        let Some(name) = words.next() else {
            return Err("Empty command".to_string());
        };
        let args: Vec<&str> = words.collect();

        let cmd = match (name, args.as_slice()) {
            ("break" | "b", [loc]) => Self::Break(location(loc)?),
            ("delete" | "d", [loc]) => Self::Delete(location(loc)?),
            ("continue" | "c", []) => Self::Continue(None),
            ("continue" | "c", [script]) => Self::Continue(Some(script.to_string())),
            ("pause", [script]) => Self::Pause(script.to_string()),
            ("threads", []) => Self::Threads,
            ("refresh", []) => Self::Refresh,
            ("ip", [tid]) => Self::Ip(thread_id(tid)?),
            ("local", [tid, var]) => Self::Local(thread_id(tid)?, number(var)?),
            ("global", [var]) => Self::Global(number(var)?),
            ("flag", [flag]) => Self::Flag(number(flag)?),
            ("list" | "l", []) => Self::List,
            ("help" | "h" | "?", []) => Self::Help,
            ("quit" | "q" | "exit", []) => Self::Quit,
            _ => {
                return Err(format!(
                    "Unknown command or wrong arguments: '{}'. Type 'help' for a list.",
                    line.trim()
                ))
            }
        };
        Ok(cmd)
    }
}

fn location(s: &str) -> std::result::Result<Breakpoint, String> {
    Breakpoint::parse(s).map_err(|e| e.to_string())
}

fn thread_id(s: &str) -> std::result::Result<ThreadId, String> {
    s.parse().map_err(|_| format!("Invalid thread id: {}", s))
}

fn number(s: &str) -> std::result::Result<u32, String> {
    parse_address(s).ok_or_else(|| format!("Invalid number: {}", s))
}

/// Run until the user quits, Ctrl-C, or the session dies
pub async fn run(debugger: Arc<Debugger>, poll_interval: Duration, auto_continue: bool) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut last_hit: Option<Breakpoint> = None;

    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    println!("Type 'help' for a list of commands.");

    let result = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received Ctrl+C, detaching");
                break Ok(());
            }
            _ = ticker.tick() => {
                if let Err(e) = poll(&debugger, &mut last_hit, auto_continue).await {
                    break Err(e);
                }
            }
            line = lines.next_line(), if stdin_open => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => {
                        // Keep reporting hits when run without a terminal
                        tracing::debug!("stdin closed, no more commands");
                        stdin_open = false;
                        continue;
                    }
                    Err(e) => break Err(e.into()),
                };
                if line.trim().is_empty() {
                    continue;
                }

                match ReplCommand::parse(&line) {
                    Ok(ReplCommand::Quit) => break Ok(()),
                    Ok(cmd) => {
                        if let Err(e) = execute(&debugger, cmd, &mut last_hit).await {
                            if e.is_fatal() {
                                break Err(e);
                            }
                            println!("Error: {}", e);
                        }
                    }
                    Err(msg) => println!("{}", msg),
                }
            }
        }
    };

    debugger.close().await;
    result
}

async fn poll(debugger: &Debugger, last_hit: &mut Option<Breakpoint>, auto_continue: bool) -> Result<()> {
    debugger.update().await?;

    let mut hits = Vec::new();
    debugger.drain_hits(|bp| hits.push(bp.clone())).await;
    for bp in hits {
        println!("Breakpoint hit: {}", bp);
        if auto_continue {
            debugger.continue_execution(&bp).await?;
            println!("Continuing {}", bp.script_buffer);
        } else {
            *last_hit = Some(bp);
        }
    }

    debugger.drain_values(|value| println!("{}", value)).await;
    Ok(())
}

async fn execute(debugger: &Debugger, cmd: ReplCommand, last_hit: &mut Option<Breakpoint>) -> Result<()> {
    match cmd {
        ReplCommand::Break(bp) => {
            debugger.set_breakpoint(&bp.script_buffer, bp.address).await?;
            if debugger.breakpoints().await.contains(&bp) {
                println!("Breakpoint set at {}", bp);
            } else {
                println!("No threads run {}, breakpoint not set", bp.script_buffer);
            }
        }
        ReplCommand::Delete(bp) => {
            debugger.unset_breakpoint(&bp.script_buffer, bp.address).await?;
            println!("Breakpoint removed: {}", bp);
        }
        ReplCommand::Continue(None) => match last_hit.take() {
            Some(bp) => {
                debugger.continue_execution(&bp).await?;
                println!("Continuing {}", bp.script_buffer);
            }
            None => println!("No breakpoint hit to continue from. Use 'continue <script>'."),
        },
        ReplCommand::Continue(Some(script)) => {
            debugger.resume(&script).await?;
            println!("Continuing {}", script);
        }
        ReplCommand::Pause(script) => {
            debugger.break_now(&script).await?;
            println!("Pausing {}", script);
        }
        ReplCommand::Threads => print_threads(&debugger.threads().await),
        ReplCommand::Refresh => {
            debugger.refresh_threads().await?;
            println!("Requested thread list");
        }
        ReplCommand::Ip(tid) => debugger.request_ip(tid).await?,
        ReplCommand::Local(tid, var) => debugger.request_local_var(tid, var).await?,
        ReplCommand::Global(var) => debugger.request_global_var(var).await?,
        ReplCommand::Flag(flag) => debugger.request_global_flag(flag).await?,
        ReplCommand::List => print_breakpoints(&debugger.breakpoints().await),
        ReplCommand::Help => println!("{}", HELP),
        ReplCommand::Quit => {}
    }
    Ok(())
}
